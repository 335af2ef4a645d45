//! Configuration module for the operator.
//!
//! Every knob has a default equal to the operational constant the rollout
//! and status logic were tuned against, so an empty config file (or none at
//! all) yields the production behaviour.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Member probe configuration.
    pub probe: ProbeConfig,
    /// Rolling update configuration.
    pub rollout: RolloutConfig,
    /// Storage expansion configuration.
    pub storage: StorageConfig,
    /// Status aggregation configuration.
    pub status: StatusConfig,
    /// Controller requeue configuration.
    pub controller: ControllerConfig,
}

impl OperatorConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            field: path.display().to_string(),
            reason: format!("Failed to read config file: {}", e),
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| Error::InvalidConfig {
            field: path.display().to_string(),
            reason: format!("Failed to parse config: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.probe.sql_retries == 0 {
            return Err(Error::InvalidConfig {
                field: "probe.sql_retries".to_string(),
                reason: "At least one attempt is required".to_string(),
            });
        }

        let polls = [
            ("rollout.healthy_wait", &self.rollout.healthy_wait),
            ("rollout.pod_wait", &self.rollout.pod_wait),
            ("rollout.leader_transfer", &self.rollout.leader_transfer),
            ("rollout.binlog_drain", &self.rollout.binlog_drain),
            ("rollout.generation_wait", &self.rollout.generation_wait),
            ("storage.resize_wait", &self.storage.resize_wait),
        ];
        for (field, poll) in polls {
            poll.validate(field)?;
        }

        if self.status.interval.is_zero() {
            return Err(Error::InvalidConfig {
                field: "status.interval".to_string(),
                reason: "Status interval must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Configuration with short waits, used by tests and local runs.
    pub fn fast() -> Self {
        let quick = |interval_ms: u64, timeout_ms: u64| PollSettings {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        };
        Self {
            probe: ProbeConfig {
                sql_retries: 3,
                sql_retry_interval: Duration::from_millis(5),
                connect_timeout: Duration::from_millis(200),
                http_timeout: Duration::from_millis(200),
            },
            rollout: RolloutConfig {
                healthy_wait: quick(5, 100),
                pod_wait: quick(5, 500),
                leader_transfer: quick(5, 200),
                binlog_drain: quick(5, 200),
                generation_wait: quick(5, 200),
            },
            storage: StorageConfig {
                resize_wait: quick(5, 500),
            },
            status: StatusConfig {
                interval: Duration::from_millis(50),
                raft_not_ready_tolerance: Duration::from_millis(100),
                unschedulable_tolerance: Duration::from_millis(200),
            },
            controller: ControllerConfig::default(),
        }
    }
}

/// A bounded poll: check every `interval` until `timeout` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl PollSettings {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig {
                field: format!("{}.interval", field),
                reason: "Poll interval must be non-zero".to_string(),
            });
        }
        if self.timeout < self.interval {
            return Err(Error::InvalidConfig {
                field: format!("{}.timeout", field),
                reason: "Poll timeout must not be shorter than the interval".to_string(),
            });
        }
        Ok(())
    }
}

/// Member probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Attempts for `show slave status` before giving up on a member.
    pub sql_retries: u32,
    /// Pause between replication status attempts.
    #[serde(with = "humantime_serde")]
    pub sql_retry_interval: Duration,
    /// MySQL connection timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Consensus agent HTTP timeout.
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sql_retries: 3,
            sql_retry_interval: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(5),
        }
    }
}

/// Rolling update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Pre-update wait for every member's healthy label.
    pub healthy_wait: PollSettings,
    /// Wait for one deleted member to come back healthy at the new revision.
    pub pod_wait: PollSettings,
    /// Wait for the chosen follower to report itself leader.
    pub leader_transfer: PollSettings,
    /// Wait for the read-only leader to ship its remaining binlog.
    pub binlog_drain: PollSettings,
    /// Wait for the workload controller to observe a new generation.
    pub generation_wait: PollSettings,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            healthy_wait: PollSettings::new(Duration::from_secs(2), Duration::from_secs(60)),
            pod_wait: PollSettings::new(Duration::from_secs(10), Duration::from_secs(2 * 60 * 60)),
            leader_transfer: PollSettings::new(Duration::from_secs(5), Duration::from_secs(60)),
            binlog_drain: PollSettings::new(Duration::from_secs(2), Duration::from_secs(2 * 60 * 60)),
            generation_wait: PollSettings::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }
}

/// Storage expansion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Wait for a single claim's resize to be picked up.
    pub resize_wait: PollSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resize_wait: PollSettings::new(Duration::from_secs(2), Duration::from_secs(2 * 60 * 60)),
        }
    }
}

/// Status aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Period of the status controller.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long a Raft quorum loss may last before the cluster reports Error.
    #[serde(with = "humantime_serde")]
    pub raft_not_ready_tolerance: Duration,
    /// How long a pod may stay unschedulable before the cluster reports Error.
    #[serde(with = "humantime_serde")]
    pub unschedulable_tolerance: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            raft_not_ready_tolerance: Duration::from_secs(10),
            unschedulable_tolerance: Duration::from_secs(60),
        }
    }
}

/// Controller requeue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    #[serde(with = "humantime_serde")]
    pub requeue_after: Duration,
    #[serde(with = "humantime_serde")]
    pub error_requeue_after: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(60),
            error_requeue_after: Duration::from_secs(60),
        }
    }
}
