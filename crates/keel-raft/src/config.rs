//! Replication configuration (timeouts, partition count, tuning parameters).

use crate::types::Endpoint;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for a replication node.
///
/// Example YAML:
/// ```yaml
/// host: "10.0.1.10"
/// port: 8001
/// max_partitions: 4
/// start_election_timeout_ms: 1500
/// end_election_timeout_ms: 4000
/// heartbeat_interval_ms: 750
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Host this node advertises to the cluster.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port this node advertises to the cluster.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of independent replication groups hosted by this process.
    #[serde(default = "default_max_partitions")]
    pub max_partitions: u32,

    /// Lower bound of the randomized election timeout.
    ///
    /// A follower that hears nothing from a leader for its drawn timeout
    /// starts a candidacy. Drawn uniformly from
    /// `[start_election_timeout_ms, end_election_timeout_ms]` at startup.
    #[serde(default = "default_start_election_timeout_ms")]
    pub start_election_timeout_ms: u64,

    /// Upper bound of the randomized election timeout.
    #[serde(default = "default_end_election_timeout_ms")]
    pub end_election_timeout_ms: u64,

    /// Lower bound of the post-candidacy timeout increment.
    ///
    /// After a failed candidacy the election timeout grows by a random
    /// amount from this range to break symmetric livelocks.
    #[serde(default = "default_start_election_timeout_increment_ms")]
    pub start_election_timeout_increment_ms: u64,

    /// Upper bound of the post-candidacy timeout increment.
    #[serde(default = "default_end_election_timeout_increment_ms")]
    pub end_election_timeout_increment_ms: u64,

    /// Leader heartbeat interval. Must be below the election timeout lower
    /// bound or followers will call spurious elections.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a candidate waits for quorum before reverting to follower.
    #[serde(default = "default_voting_timeout_ms")]
    pub voting_timeout_ms: u64,

    /// Period of the CheckLeader tick that drives all timers.
    #[serde(default = "default_check_leader_interval_ms")]
    pub check_leader_interval_ms: u64,

    /// Warn threshold for a single state-machine message's processing time.
    #[serde(default = "default_slow_state_machine_log_ms")]
    pub slow_state_machine_log_ms: u64,

    /// How long a leader keeps a committed ticket around for status polling.
    #[serde(default = "default_ticket_retention_ms")]
    pub ticket_retention_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_partitions: default_max_partitions(),
            start_election_timeout_ms: default_start_election_timeout_ms(),
            end_election_timeout_ms: default_end_election_timeout_ms(),
            start_election_timeout_increment_ms: default_start_election_timeout_increment_ms(),
            end_election_timeout_increment_ms: default_end_election_timeout_increment_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            voting_timeout_ms: default_voting_timeout_ms(),
            check_leader_interval_ms: default_check_leader_interval_ms(),
            slow_state_machine_log_ms: default_slow_state_machine_log_ms(),
            ticket_retention_ms: default_ticket_retention_ms(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_max_partitions() -> u32 {
    1
}

fn default_start_election_timeout_ms() -> u64 {
    1500
}

fn default_end_election_timeout_ms() -> u64 {
    4000
}

fn default_start_election_timeout_increment_ms() -> u64 {
    500
}

fn default_end_election_timeout_increment_ms() -> u64 {
    2000
}

fn default_heartbeat_interval_ms() -> u64 {
    750
}

fn default_voting_timeout_ms() -> u64 {
    3000
}

fn default_check_leader_interval_ms() -> u64 {
    500
}

fn default_slow_state_machine_log_ms() -> u64 {
    200
}

fn default_ticket_retention_ms() -> u64 {
    60_000
}

impl RaftConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read config file: {}", e)))?;

        let config: RaftConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `KEEL_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// Recognized variables: `KEEL_HOST`, `KEEL_PORT`, `KEEL_MAX_PARTITIONS`.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = RaftConfig::default();

        if let Ok(host) = std::env::var("KEEL_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("KEEL_PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::InvalidField(format!("KEEL_PORT: {}", e)))?;
        }
        if let Ok(partitions) = std::env::var("KEEL_MAX_PARTITIONS") {
            config.max_partitions = partitions
                .parse()
                .map_err(|e| ConfigError::InvalidField(format!("KEEL_MAX_PARTITIONS: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidField("host cannot be empty".to_string()));
        }

        if self.max_partitions == 0 {
            return Err(ConfigError::InvalidField(
                "max_partitions must be > 0".to_string(),
            ));
        }

        if self.start_election_timeout_ms >= self.end_election_timeout_ms {
            return Err(ConfigError::InvalidField(format!(
                "start_election_timeout_ms ({}) must be < end_election_timeout_ms ({})",
                self.start_election_timeout_ms, self.end_election_timeout_ms
            )));
        }

        if self.start_election_timeout_increment_ms > self.end_election_timeout_increment_ms {
            return Err(ConfigError::InvalidField(format!(
                "start_election_timeout_increment_ms ({}) must be <= end_election_timeout_increment_ms ({})",
                self.start_election_timeout_increment_ms, self.end_election_timeout_increment_ms
            )));
        }

        if self.heartbeat_interval_ms >= self.start_election_timeout_ms {
            return Err(ConfigError::InvalidField(format!(
                "heartbeat_interval_ms ({}) must be < start_election_timeout_ms ({})",
                self.heartbeat_interval_ms, self.start_election_timeout_ms
            )));
        }

        if self.check_leader_interval_ms == 0 {
            return Err(ConfigError::InvalidField(
                "check_leader_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The endpoint this node advertises to the cluster.
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(format!("{}:{}", self.host, self.port))
    }

    /// Draw a randomized election timeout from the configured range.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng()
            .gen_range(self.start_election_timeout_ms..=self.end_election_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Draw a randomized election-timeout increment from the configured range.
    pub fn random_election_timeout_increment(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng().gen_range(
            self.start_election_timeout_increment_ms..=self.end_election_timeout_increment_ms,
        );
        Duration::from_millis(ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn voting_timeout(&self) -> Duration {
        Duration::from_millis(self.voting_timeout_ms)
    }

    pub fn check_leader_interval(&self) -> Duration {
        Duration::from_millis(self.check_leader_interval_ms)
    }

    pub fn slow_state_machine_log(&self) -> Duration {
        Duration::from_millis(self.slow_state_machine_log_ms)
    }

    pub fn ticket_retention(&self) -> Duration {
        Duration::from_millis(self.ticket_retention_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}
