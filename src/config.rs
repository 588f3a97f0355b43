//! Plugin configuration surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the group name option is mandatory")]
    GroupNameMissing,
    #[error("the group name `{raw}` is not a valid UUID")]
    GroupNameInvalid { raw: String },
    #[error("components_stop_timeout is {got}s, minimum is {min}s")]
    StopTimeoutTooSmall { got: u64, min: u64 },
    #[error("broadcast_period cannot be zero")]
    BroadcastPeriodZero,
}

/// Named handler pipelines the applier can be configured with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSpec {
    #[default]
    Standard,
}

/// Which group communication binding to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcsProtocol {
    #[default]
    Corosync,
}

/// What the stable-set broadcaster does when a broadcast fails (typically
/// while the group sits in a minority view).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastFailurePolicy {
    /// Log and retry next tick.
    #[default]
    Ignore,
    /// Flip the local member status to offline.
    Offline,
}

pub const MIN_STOP_TIMEOUT_SECS: u64 = 2;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 31536000;
const DEFAULT_BROADCAST_PERIOD_SECS: u64 = 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 36-character UUID naming the group; doubles as the cluster sid.
    pub group_name: String,
    /// Start replication when the plugin loads.
    pub start_on_boot: bool,
    pub pipeline_type: PipelineSpec,
    pub gcs_protocol: GcsProtocol,
    /// Credentials recovery uses for the donor connection.
    pub recovery_user: String,
    pub recovery_password: String,
    /// Donor connection attempts before giving up; 0 means one attempt per
    /// available donor.
    pub recovery_retry_count: u32,
    /// Queued-transaction count at or below which a joiner declares itself
    /// online after recovery.
    pub recovery_transaction_threshold: u64,
    /// Per-component shutdown timeout, seconds.
    pub components_stop_timeout_secs: u64,
    /// Stable-set broadcast period, seconds.
    pub broadcast_period_secs: u64,
    pub broadcast_failure_policy: BroadcastFailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group_name: String::new(),
            start_on_boot: false,
            pipeline_type: PipelineSpec::default(),
            gcs_protocol: GcsProtocol::default(),
            recovery_user: "root".to_string(),
            recovery_password: String::new(),
            recovery_retry_count: 0,
            recovery_transaction_threshold: 0,
            components_stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            broadcast_period_secs: DEFAULT_BROADCAST_PERIOD_SECS,
            broadcast_failure_policy: BroadcastFailurePolicy::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.group_uuid()?;
        if self.components_stop_timeout_secs < MIN_STOP_TIMEOUT_SECS {
            return Err(ConfigError::StopTimeoutTooSmall {
                got: self.components_stop_timeout_secs,
                min: MIN_STOP_TIMEOUT_SECS,
            });
        }
        if self.broadcast_period_secs == 0 {
            return Err(ConfigError::BroadcastPeriodZero);
        }
        Ok(())
    }

    /// The group name parsed as the cluster sid.
    pub fn group_uuid(&self) -> Result<Uuid, ConfigError> {
        if self.group_name.is_empty() {
            return Err(ConfigError::GroupNameMissing);
        }
        Uuid::try_parse(&self.group_name).map_err(|_| ConfigError::GroupNameInvalid {
            raw: self.group_name.clone(),
        })
    }

    pub fn components_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.components_stop_timeout_secs)
    }

    pub fn broadcast_period(&self) -> Duration {
        Duration::from_secs(self.broadcast_period_secs)
    }
}
