/// Errors surfaced by the trading runtime.
#[derive(Debug, thiserror::Error)]
pub enum TraderError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("exchange error: {0}")]
    Exchange(String),
    #[error("llm error: {0}")]
    Llm(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TraderError>;

/// Read a secret from the environment.
pub fn resolve_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(TraderError::MissingEnv(name.to_string())),
    }
}
