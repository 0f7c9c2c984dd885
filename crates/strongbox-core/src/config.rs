//! Engine configuration: transaction budgets, concurrent-restore policy and
//! snapshot retention.
//!
//! Reads from environment variables:
//! - `STRONGBOX_TX_MAX_WAIT_SECS`: how long to wait for the write slot (default 10)
//! - `STRONGBOX_TX_TIMEOUT_SECS`: restore transaction budget (default 30)
//! - `STRONGBOX_BUSY_POLICY`: `wait` or `reject` (default `wait`)
//! - `STRONGBOX_RETAIN_LAST`: keep only this many snapshots after each backup

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strongbox_state::TxOptions;

/// What a restore does when another restore already holds the dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Queue behind the running restore.
    #[default]
    Wait,
    /// Fail immediately with `RestoreInProgress`.
    Reject,
}

impl FromStr for BusyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(BusyPolicy::Wait),
            "reject" => Ok(BusyPolicy::Reject),
            other => Err(format!("unknown busy policy '{other}' (expected wait|reject)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub tx_max_wait: Duration,
    pub tx_timeout: Duration,
    pub busy_policy: BusyPolicy,
    /// `None` keeps every snapshot.
    pub retain_last: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let tx = TxOptions::default();
        Self {
            tx_max_wait: tx.max_wait,
            tx_timeout: tx.timeout,
            busy_policy: BusyPolicy::default(),
            retain_last: None,
        }
    }
}

impl EngineConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.tx_max_wait = max_wait;
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_retain_last(mut self, keep: usize) -> Self {
        self.retain_last = Some(keep);
        self
    }

    pub fn tx_options(&self) -> TxOptions {
        TxOptions {
            max_wait: self.tx_max_wait,
            timeout: self.tx_timeout,
        }
    }

    /// Defaults overridden by whichever `STRONGBOX_*` variables are set.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(v) = lookup("STRONGBOX_TX_MAX_WAIT_SECS") {
            config.tx_max_wait = Duration::from_secs(parse_num("STRONGBOX_TX_MAX_WAIT_SECS", &v)?);
        }
        if let Some(v) = lookup("STRONGBOX_TX_TIMEOUT_SECS") {
            config.tx_timeout = Duration::from_secs(parse_num("STRONGBOX_TX_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("STRONGBOX_BUSY_POLICY") {
            config.busy_policy = v.parse()?;
        }
        if let Some(v) = lookup("STRONGBOX_RETAIN_LAST") {
            config.retain_last = Some(parse_num("STRONGBOX_RETAIN_LAST", &v)? as usize);
        }
        Ok(config)
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{key} must be a non-negative integer, got '{value}'"))
}
