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

use alloy::primitives::B256;
use thiserror::Error;

/// Errors produced while computing or validating a rewards interval.
///
/// None of these are recovered inside the engine. They bubble to whoever is driving the
/// pipeline, which decides whether to retry the whole interval.
#[derive(Error, Debug)]
pub enum RewardsError {
    /// A beacon or execution endpoint could not supply required data.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Aggregated amounts do not add up to the protocol-level totals.
    #[error("conservation violation: {0}")]
    ConservationViolation(String),

    /// The locally computed root differs from the on-chain anchor.
    #[error("merkle root mismatch for interval {index}: local {local}, on-chain {onchain}")]
    RootMismatch { index: u64, local: B256, onchain: B256 },

    /// A rewards file could not be verified against its own contents or the on-chain anchor.
    #[error("rewards file integrity error: {0}")]
    FileIntegrity(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid network state snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("arithmetic overflow in {0}")]
    Arithmetic(&'static str),

    #[error("interval computation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error {0:?}")]
    Io(#[from] std::io::Error),

    #[error("json error {0:?}")]
    Json(#[from] serde_json::Error),
}

impl RewardsError {
    /// Whether retrying the same computation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RewardsError::DataUnavailable(_) | RewardsError::Timeout(_))
    }
}
