// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::RewardsError;

/// Where RPL rounding dust ends up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RplDustPolicy {
    /// Everything that is not paid out to a node accrues to the treasury.
    #[default]
    Treasury,
    /// Dust of each pool is handed out one wei at a time by largest remainder.
    ProRata,
}

/// How a node below the minimum collateral ratio is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollateralFloor {
    /// Raw stake is clamped into `[min, max]`.
    #[default]
    Clamp,
    /// Raw stake below the minimum counts as zero.
    Forfeit,
}

/// Which part of a minipool's smoothing pool share is credited to the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EthSplit {
    /// Commission plus the bond-proportional part; the rest goes to pool stakers.
    #[default]
    OperatorShare,
    /// The whole minipool share is credited to the node.
    FullApportionment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Network name written into artifacts and file names.
    pub network: String,
    /// Number of epochs fetched from the beacon node concurrently.
    pub worker_count: usize,
    /// Retries per beacon request before giving up on the interval.
    pub max_retries: u32,
    /// Initial backoff between retries, doubled on every attempt.
    pub retry_backoff_ms: u64,
    /// Upper bound on a full interval computation. Unlimited if unset.
    pub timeout_secs: Option<u64>,
    /// Gzip artifacts when writing them.
    pub compress: bool,
    pub rpl_dust: RplDustPolicy,
    pub collateral_floor: CollateralFloor,
    pub eth_split: EthSplit,
    /// Directory for replay checkpoints. Replays are not checkpointed if unset.
    pub checkpoint_dir: Option<PathBuf>,
    /// Replayed epochs between two checkpoints.
    pub checkpoint_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            worker_count: 8,
            max_retries: 3,
            retry_backoff_ms: 1000,
            timeout_secs: None,
            compress: false,
            rpl_dust: RplDustPolicy::default(),
            collateral_floor: CollateralFloor::default(),
            eth_split: EthSplit::default(),
            checkpoint_dir: None,
            checkpoint_interval: 100,
        }
    }
}

impl EngineConfig {
    /// Load a TOML configuration file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, RewardsError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|err| {
            RewardsError::Config(format!("unable to parse config {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RewardsError> {
        if self.worker_count == 0 {
            return Err(RewardsError::Config("worker_count must be at least 1".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(RewardsError::Config("checkpoint_interval must be at least 1".into()));
        }
        if self.network.is_empty() {
            return Err(RewardsError::Config("network name must not be empty".into()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
