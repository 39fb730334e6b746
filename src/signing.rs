//! Request signing for the supported brokers.
//!
//! Hyperliquid L1 actions (orders, cancels) are signed by msgpack-hashing the
//! action, wrapping the hash in a "phantom agent" EIP-712 struct and signing
//! that with the wallet key. BingX signs the sorted query string with
//! HMAC-SHA256 and appends the hex digest as the `signature` parameter.

use alloy_primitives::{Address, FixedBytes};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{eip712_domain, sol, SolStruct};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tiny_keccak::{Hasher, Keccak};
use tracing::debug;

use crate::config::NetworkMode;
use crate::error::{Result, TraderError};

/// Signature components as Hyperliquid expects them in the request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthSignature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

fn exchange_domain() -> alloy_sol_types::Eip712Domain {
    eip712_domain! {
        name: "Exchange",
        version: "1",
        chain_id: 1337,
        verifying_contract: Address::ZERO,
    }
}

sol! {
    #[derive(Debug)]
    struct Agent {
        string source;
        bytes32 connectionId;
    }
}

/// keccak256(msgpack(action) ‖ nonce_be ‖ vault flag [‖ vault] [‖ 0x00 ‖ expires_be])
pub fn action_hash(
    action: &serde_json::Value,
    vault_address: Option<&str>,
    nonce: u64,
    expires_after: Option<u64>,
) -> Result<[u8; 32]> {
    let mut data = rmp_serde::to_vec_named(action)
        .map_err(|e| TraderError::Signing(format!("msgpack encoding failed: {}", e)))?;
    data.extend_from_slice(&nonce.to_be_bytes());

    match vault_address {
        None => data.push(0x00),
        Some(addr) => {
            data.push(0x01);
            data.extend_from_slice(&hex_to_bytes(addr)?);
        }
    }

    if let Some(expires) = expires_after {
        data.push(0x00);
        data.extend_from_slice(&expires.to_be_bytes());
    }

    Ok(keccak256(&data))
}

/// Sign a Hyperliquid L1 action
pub async fn sign_l1_action(
    private_key_hex: &str,
    action: &serde_json::Value,
    vault_address: Option<&str>,
    nonce: u64,
    expires_after: Option<u64>,
    network: NetworkMode,
) -> Result<EthSignature> {
    let hash = action_hash(action, vault_address, nonce, expires_after)?;
    let phantom_agent = Agent {
        source: network.source_id().to_string(),
        connectionId: FixedBytes::from(hash),
    };
    let signing_hash = phantom_agent.eip712_signing_hash(&exchange_domain());

    let signer = parse_signer(private_key_hex)?;
    let signature = signer
        .sign_hash(&signing_hash)
        .await
        .map_err(|e| TraderError::Signing(e.to_string()))?;

    // r(32) ‖ s(32) ‖ v(1)
    let sig_bytes = signature.as_bytes();
    let v = sig_bytes[64];

    debug!(source = network.source_id(), nonce, "signed L1 action");

    Ok(EthSignature {
        r: format!("0x{}", hex::encode(&sig_bytes[..32])),
        s: format!("0x{}", hex::encode(&sig_bytes[32..64])),
        v: if v < 27 { v + 27 } else { v },
    })
}

fn parse_signer(private_key_hex: &str) -> Result<PrivateKeySigner> {
    private_key_hex
        .trim()
        .parse()
        .map_err(|e| TraderError::Signing(format!("invalid private key: {}", e)))
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    output
}

fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let s = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(s).map_err(|e| TraderError::Signing(format!("invalid hex {}: {}", hex_str, e)))
}

/// Load a private key from a file
pub fn load_private_key(path: &str) -> Result<String> {
    let key = std::fs::read_to_string(path)
        .map_err(|e| TraderError::Config(format!("failed to read private key from {}: {}", path, e)))?;
    Ok(key.trim().to_string())
}

/// Derive the wallet address from a private key
pub fn derive_address(private_key_hex: &str) -> Result<String> {
    let signer = parse_signer(private_key_hex)?;
    Ok(format!("{:?}", signer.address()))
}

/// Hex-encoded HMAC-SHA256 of `payload`
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| TraderError::Signing(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Join parameters sorted by key as `k=v&k=v`
pub fn sorted_query(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Sorted query string with its HMAC signature appended last
pub fn signed_query(params: &[(String, String)], secret: &str) -> Result<String> {
    let query = sorted_query(params);
    let signature = hmac_sha256_hex(secret, &query)?;
    if query.is_empty() {
        Ok(format!("signature={}", signature))
    } else {
        Ok(format!("{}&signature={}", query, signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hardhat account #0, never use with real funds
    const TEST_PRIVATE_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_hex_to_bytes_prefix_optional() {
        assert_eq!(hex_to_bytes("0xabcdef").unwrap(), vec![0xab, 0xcd, 0xef]);
        assert_eq!(hex_to_bytes("abcdef").unwrap(), vec![0xab, 0xcd, 0xef]);
        assert!(hex_to_bytes("0xzz").is_err());
    }

    #[test]
    fn test_action_hash_inputs_matter() {
        let action = serde_json::json!({"type": "cancel", "cancels": [{"a": 0, "o": 1}]});
        let base = action_hash(&action, None, 1000, None).unwrap();
        assert_eq!(base, action_hash(&action, None, 1000, None).unwrap());
        assert_ne!(base, action_hash(&action, None, 2000, None).unwrap());
        assert_ne!(
            base,
            action_hash(&action, Some("0x0000000000000000000000000000000000000001"), 1000, None).unwrap()
        );
        assert_ne!(base, action_hash(&action, None, 1000, Some(5000)).unwrap());
    }

    #[tokio::test]
    async fn test_sign_l1_action_shape() {
        let action = serde_json::json!({
            "type": "order",
            "orders": [{"a": 0, "b": true, "p": "50000", "s": "0.01", "r": false, "t": {"limit": {"tif": "Gtc"}}}],
            "grouping": "na"
        });
        let sig = sign_l1_action(TEST_PRIVATE_KEY, &action, None, 1_234_567_890, None, NetworkMode::Testnet)
            .await
            .unwrap();
        assert_eq!(sig.r.len(), 66);
        assert_eq!(sig.s.len(), 66);
        assert!(sig.v == 27 || sig.v == 28);
    }

    #[tokio::test]
    async fn test_sign_l1_action_network_separation() {
        let action = serde_json::json!({"type": "order", "orders": [], "grouping": "na"});
        let a = sign_l1_action(TEST_PRIVATE_KEY, &action, None, 1000, None, NetworkMode::Testnet).await.unwrap();
        let b = sign_l1_action(TEST_PRIVATE_KEY, &action, None, 1000, None, NetworkMode::Testnet).await.unwrap();
        let c = sign_l1_action(TEST_PRIVATE_KEY, &action, None, 1000, None, NetworkMode::Mainnet).await.unwrap();
        assert_eq!(a.r, b.r);
        assert_ne!(a.r, c.r);
    }

    #[tokio::test]
    async fn test_sign_l1_action_invalid_key() {
        let action = serde_json::json!({"type": "order"});
        assert!(sign_l1_action("nope", &action, None, 1, None, NetworkMode::Mainnet).await.is_err());
    }

    #[test]
    fn test_derive_address() {
        assert_eq!(
            derive_address(TEST_PRIVATE_KEY).unwrap().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_load_private_key_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hl.key");
        std::fs::write(&path, "  0xdeadbeef  \n").unwrap();
        assert_eq!(load_private_key(path.to_str().unwrap()).unwrap(), "0xdeadbeef");
        assert!(load_private_key("/nonexistent/hl.key").is_err());
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            hmac_sha256_hex("Jefe", "what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sorted_query() {
        let params = vec![
            ("symbol".to_string(), "BTC-USDT".to_string()),
            ("limit".to_string(), "5".to_string()),
            ("interval".to_string(), "3m".to_string()),
        ];
        assert_eq!(sorted_query(&params), "interval=3m&limit=5&symbol=BTC-USDT");
    }

    #[test]
    fn test_signed_query_appends_signature_last() {
        let params = vec![
            ("timestamp".to_string(), "1700000000000".to_string()),
            ("symbol".to_string(), "ETH-USDT".to_string()),
        ];
        let q = signed_query(&params, "secret").unwrap();
        let expected_sig = hmac_sha256_hex("secret", "symbol=ETH-USDT&timestamp=1700000000000").unwrap();
        assert_eq!(q, format!("symbol=ETH-USDT&timestamp=1700000000000&signature={}", expected_sig));
        assert!(signed_query(&[], "secret").unwrap().starts_with("signature="));
    }
}
