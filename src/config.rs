//! Stack Configuration
//!
//! One section per layer. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration. Durations are given in
//! milliseconds.
//!
//! ```toml
//! [failure_detector]
//! bind_addr = "10.0.0.5"
//! start_port = 12000
//!
//! [verifier]
//! timeout_ms = 1500
//! num_msgs = 2
//!
//! [merge]
//! min_interval_ms = 2000
//! max_interval_ms = 8000
//! ```

use crate::error::{Result, StackError};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub failure_detector: FailureDetectorConfig,
    pub verifier: VerifierConfig,
    pub merge: MergeConfig,
    pub transport: TransportConfig,
}

impl StackConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: StackConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        tracing::info!("Loaded configuration file: {}", path.as_ref().display());
        Self::from_toml_str(&raw)
    }

    /// Checks value ranges, clamping the ones that have a safe fallback.
    pub fn validate(&mut self) -> Result<()> {
        self.failure_detector.validate()?;
        self.verifier.validate();
        self.merge.validate()
    }
}

/// Ring failure detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetectorConfig {
    /// How long to wait for the coordinator's cache snapshot.
    pub get_cache_timeout_ms: u64,
    /// Pause between two cache requests.
    pub get_cache_retry_timeout_ms: u64,
    /// Number of cache requests sent to the coordinator before giving up.
    pub num_tries: u32,
    /// Period of the SUSPECT re-broadcast.
    pub suspect_msg_interval_ms: u64,
    /// Interface the monitoring listener binds to.
    pub bind_addr: String,
    /// First port tried for the listener; 0 picks an ephemeral port.
    pub start_port: u16,
    /// Wait for each WHO_HAS_SOCK answer.
    pub ping_addr_timeout_ms: u64,
    /// Grace period before asking peers for an address missing from the cache.
    pub cache_settle_delay_ms: u64,
    /// Attempts to resolve the successor's socket address before monitoring stops.
    pub max_fetch_tries: u32,
    pub fetch_retry_delay_ms: u64,
    pub suspect_history_size: usize,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            get_cache_timeout_ms: 3000,
            get_cache_retry_timeout_ms: 500,
            num_tries: 3,
            suspect_msg_interval_ms: 5000,
            bind_addr: "127.0.0.1".to_string(),
            start_port: 0,
            ping_addr_timeout_ms: 3000,
            cache_settle_delay_ms: 300,
            max_fetch_tries: 10,
            fetch_retry_delay_ms: 2000,
            suspect_history_size: 20,
        }
    }
}

impl FailureDetectorConfig {
    fn validate(&self) -> Result<()> {
        if self.suspect_msg_interval_ms == 0 {
            return Err(StackError::InvalidConfig(
                "suspect_msg_interval_ms has to be > 0".to_string(),
            ));
        }
        if self.num_tries == 0 {
            return Err(StackError::InvalidConfig(
                "num_tries has to be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.get_cache_timeout_ms)
    }

    pub fn get_cache_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.get_cache_retry_timeout_ms)
    }

    pub fn suspect_msg_interval(&self) -> Duration {
        Duration::from_millis(self.suspect_msg_interval_ms)
    }

    pub fn ping_addr_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_addr_timeout_ms)
    }

    pub fn cache_settle_delay(&self) -> Duration {
        Duration::from_millis(self.cache_settle_delay_ms)
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }
}

/// Suspicion verifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Time a suspect has to answer before the suspicion is confirmed.
    pub timeout_ms: u64,
    /// Copies of every probe and every reply sent, for redundancy.
    pub num_msgs: i64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            num_msgs: 1,
        }
    }
}

impl VerifierConfig {
    fn validate(&mut self) {
        if self.num_msgs <= 0 {
            tracing::warn!("num_msgs is invalid ({}): setting it to 1", self.num_msgs);
            self.num_msgs = 1;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_count(&self) -> usize {
        self.num_msgs.max(1) as usize
    }
}

/// Partition-merge detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Deliver MERGE on its own task instead of the announcement's caller.
    pub use_separate_thread: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 5000,
            max_interval_ms: 20000,
            use_separate_thread: false,
        }
    }
}

impl MergeConfig {
    fn validate(&self) -> Result<()> {
        if self.min_interval_ms == 0 || self.max_interval_ms == 0 {
            return Err(StackError::InvalidConfig(
                "min_interval_ms and max_interval_ms have to be > 0".to_string(),
            ));
        }
        if self.max_interval_ms <= self.min_interval_ms {
            return Err(StackError::InvalidConfig(
                "max_interval_ms has to be greater than min_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// UDP transport settings used by the node binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bind: SocketAddr,
    /// Peers contacted for broadcasts before they show up in a view.
    pub initial_hosts: Vec<SocketAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7800)),
            initial_hosts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = StackConfig::from_toml_str("").expect("Empty config should parse");

        assert_eq!(config.failure_detector.get_cache_timeout_ms, 3000);
        assert_eq!(config.failure_detector.num_tries, 3);
        assert_eq!(config.failure_detector.suspect_msg_interval_ms, 5000);
        assert_eq!(config.verifier.timeout_ms, 2000);
        assert_eq!(config.verifier.num_msgs, 1);
        assert_eq!(config.merge.min_interval_ms, 5000);
        assert_eq!(config.merge.max_interval_ms, 20000);
        assert!(!config.merge.use_separate_thread);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let raw = r#"
            [failure_detector]
            bind_addr = "0.0.0.0"
            start_port = 12000

            [merge]
            min_interval_ms = 1000
            max_interval_ms = 2000
            use_separate_thread = true

            [transport]
            bind = "127.0.0.1:7900"
            initial_hosts = ["127.0.0.1:7901"]
        "#;

        let config = StackConfig::from_toml_str(raw).expect("Config should parse");

        assert_eq!(config.failure_detector.bind_addr, "0.0.0.0");
        assert_eq!(config.failure_detector.start_port, 12000);
        assert_eq!(config.failure_detector.get_cache_retry_timeout_ms, 500);
        assert!(config.merge.use_separate_thread);
        assert_eq!(config.transport.initial_hosts.len(), 1);
    }

    #[test]
    fn test_non_positive_num_msgs_is_clamped() {
        let config = StackConfig::from_toml_str("[verifier]\nnum_msgs = -3\n")
            .expect("Config should parse");

        assert_eq!(config.verifier.num_msgs, 1);
        assert_eq!(config.verifier.probe_count(), 1);
    }

    #[test]
    fn test_merge_intervals_are_validated() {
        let zero = StackConfig::from_toml_str("[merge]\nmin_interval_ms = 0\n");
        assert!(matches!(zero, Err(StackError::InvalidConfig(_))));

        let inverted =
            StackConfig::from_toml_str("[merge]\nmin_interval_ms = 3000\nmax_interval_ms = 3000\n");
        assert!(matches!(inverted, Err(StackError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_rebroadcast_interval_is_rejected() {
        let result = StackConfig::from_toml_str("[failure_detector]\nsuspect_msg_interval_ms = 0\n");

        assert!(matches!(result, Err(StackError::InvalidConfig(_))));
    }

    #[test]
    fn test_unparsable_config_is_reported() {
        let result = StackConfig::from_toml_str("[merge]\nmin_interval_ms = \"soon\"\n");

        assert!(matches!(result, Err(StackError::ConfigParse(_))));
    }
}
