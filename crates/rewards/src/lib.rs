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

//! Rewards interval calculation and Merkle distribution for node operators.
//!
//! The pipeline replays beacon chain duties for a closed interval, derives collateral and
//! smoothing pool shares from a frozen [NetworkState], aggregates per-node RPL and ETH, and
//! commits the result to a Merkle tree whose root every operator must reproduce bit for bit.

use alloy::primitives::U256;

pub mod aggregate;
pub mod beacon;
pub mod checkpoint;
pub mod collateral;
pub mod config;
pub mod consistency;
pub mod duties;
pub mod error;
pub mod events;
pub mod files;
pub mod generator;
pub mod interval;
pub mod merkle;
pub mod serde_decimal;
pub mod smoothing;
pub mod state;

pub use aggregate::{aggregate_rewards, NodeRewards, RewardLedger, RplTotals};
pub use beacon::{
    http::HttpBeaconClient, resolve_interval, BeaconBlock, BeaconSource, BeaconStateReplayer,
    EpochRecord,
};
pub use checkpoint::CheckpointStore;
pub use collateral::{CollateralCalculator, NodeCollateral};
pub use config::{CollateralFloor, EngineConfig, EthSplit, RplDustPolicy};
pub use consistency::{check_root, reconcile, ContentStore, HttpGatewayStore, Reconciled};
pub use duties::{DutyOverrides, DutyReport, DutyTracker, DutyVerdict, ValidatorDuties};
pub use error::RewardsError;
pub use events::{decode_anchor_log, fetch_rewards_event, AnchorEvent, RewardsEvent};
pub use files::{MinipoolPerformanceFile, RewardsFile};
pub use generator::{GeneratedTree, TreeGenerator};
pub use interval::{BeaconConfig, EpochWindow, Interval, SnapshotEnd, FAR_FUTURE_EPOCH};
pub use merkle::{LeafEncoding, MerkleTree, RewardLeaf};
pub use smoothing::{apportion_smoothing_pool, MinipoolShare, SmoothingPoolResult};
pub use state::{
    Bond, BondReduction, MinipoolRecord, MinipoolStatus, NetworkParameters, NetworkState,
    NetworkStateData, NodeRecord, OracleDaoMembership, Pubkey, SnapshotFile, ValidatorRecord,
};

/// 1 ETH (or 1 RPL) in wei, also the unit of 1e18 fixed point fractions.
pub const ONE_ETH: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// `a * b / c`, rounded down.
pub(crate) fn mul_div(a: U256, b: U256, c: U256, what: &'static str) -> Result<U256, RewardsError> {
    if c.is_zero() {
        return Err(RewardsError::Arithmetic(what));
    }
    a.checked_mul(b).map(|product| product / c).ok_or(RewardsError::Arithmetic(what))
}
