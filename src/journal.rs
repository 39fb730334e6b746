use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::account::AccountSnapshot;
use crate::decision::TradingDecision;
use crate::error::Result;
use crate::market::AssetSnapshot;

/// One trading cycle, as written to the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub invocation: u64,
    pub market: BTreeMap<String, Option<AssetSnapshot>>,
    pub account: Option<AccountSnapshot>,
    pub prompt_chars: usize,
    pub llm_response: Option<String>,
    pub decision: Option<TradingDecision>,
    pub outcome: Option<String>,
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn new(agent: &str, invocation: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            agent: agent.to_string(),
            invocation,
            market: BTreeMap::new(),
            account: None,
            prompt_chars: 0,
            llm_response: None,
            decision: None,
            outcome: None,
            error: None,
        }
    }
}

/// Append-only JSONL journal, one file per agent
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn open(dir: &Path, agent: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(format!("{}.jsonl", agent)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)?;
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}
