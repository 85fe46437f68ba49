//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MendError, Result};
use crate::repair::RepairConfig;
use crate::safety::{SafetyConfig, SafetyPolicy};

/// Every knob of a recovery run. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Iteration budget (at least 1).
    pub max_iterations: u32,
    /// Wall-clock budget for the whole run.
    pub timeout_secs: u64,
    /// Optional cap on any single collaborator call.
    pub call_timeout_secs: Option<u64>,
    /// Extra Proposer attempts when it errors or returns an empty patch.
    pub proposer_retries: u32,
    /// Stop with `NoProgress` after this many consecutive iterations without
    /// improvement. Disabled when unset.
    pub max_stalled_iterations: Option<u32>,
    /// Where run directories are created, relative to the working tree.
    pub runs_dir: PathBuf,
    pub safety: SafetyConfig,
    pub repair: RepairConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            timeout_secs: 1800,
            call_timeout_secs: None,
            proposer_retries: 1,
            max_stalled_iterations: None,
            runs_dir: PathBuf::from(".mendloop/runs"),
            safety: SafetyConfig::default(),
            repair: RepairConfig::default(),
        }
    }
}

impl RecoveryConfig {
    /// Reject values a run cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(MendError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(MendError::InvalidConfig(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_secs == Some(0) {
            return Err(MendError::InvalidConfig(
                "call_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        if self.max_stalled_iterations == Some(0) {
            return Err(MendError::InvalidConfig(
                "max_stalled_iterations must be at least 1 when set".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.repair.min_similarity) {
            return Err(MendError::InvalidConfig(format!(
                "repair.min_similarity must be within 0.0..=1.0, got {}",
                self.repair.min_similarity
            )));
        }
        if self.runs_dir.as_os_str().is_empty() {
            return Err(MendError::InvalidConfig("runs_dir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    /// Compile the safety section into a policy.
    pub fn safety_policy(&self) -> Result<SafetyPolicy> {
        SafetyPolicy::from_config(&self.safety).map_err(|e| MendError::InvalidConfig(e.to_string()))
    }
}
