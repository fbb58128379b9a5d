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

//! Frozen view of the protocol at the end of a rewards interval.
//!
//! A [NetworkState] is assembled once, validated, and then shared read-only (usually behind an
//! `Arc`) by every stage of the computation. Records reference each other only through
//! addresses and pubkeys, and all lookups go through the state's own tables.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{Address, FixedBytes, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    interval::{BeaconConfig, EpochWindow, Interval, SnapshotEnd, FAR_FUTURE_EPOCH},
    RewardsError, ONE_ETH,
};

/// BLS public key of a validator.
pub type Pubkey = FixedBytes<48>;

/// Minipools with this many penalties mark their node as ineligible for the smoothing pool.
pub const CHEATER_PENALTY_THRESHOLD: u64 = 3;

/// Full deposit backing one validator.
pub fn full_deposit() -> U256 {
    U256::from(32u64) * ONE_ETH
}

/// Protocol-wide parameters, all 1e18 fixed point where they are fractions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkParameters {
    /// RPL price in ETH.
    #[serde(with = "crate::serde_decimal")]
    pub rpl_price: U256,
    #[serde(with = "crate::serde_decimal")]
    pub min_collateral_fraction: U256,
    #[serde(with = "crate::serde_decimal")]
    pub max_collateral_fraction: U256,
    /// Smoothing pool balance at the end of the interval.
    #[serde(with = "crate::serde_decimal")]
    pub smoothing_pool_balance: U256,
    #[serde(with = "crate::serde_decimal")]
    pub node_operator_rewards_percent: U256,
    #[serde(with = "crate::serde_decimal")]
    pub trusted_node_operator_rewards_percent: U256,
    #[serde(with = "crate::serde_decimal")]
    pub protocol_dao_rewards_percent: U256,
    /// RPL minted for this interval, including any carryover.
    #[serde(with = "crate::serde_decimal")]
    pub pending_rpl_rewards: U256,
    /// Nominal interval length in seconds.
    pub interval_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleDaoMembership {
    pub joined_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub address: Address,
    #[serde(with = "crate::serde_decimal")]
    pub rpl_stake: U256,
    pub smoothing_pool_registered: bool,
    /// Time of the last smoothing pool registration change. Zero if it never changed.
    pub smoothing_pool_changed: u64,
    pub oracle_dao: Option<OracleDaoMembership>,
    pub minipools: Vec<Address>,
}

impl NodeRecord {
    /// Epochs during which the node belonged to the smoothing pool.
    pub fn smoothing_pool_window(&self, beacon: &BeaconConfig) -> EpochWindow {
        let changed_epoch = beacon.epoch_at(self.smoothing_pool_changed);
        if self.smoothing_pool_registered {
            EpochWindow::new(changed_epoch, FAR_FUTURE_EPOCH)
        } else if self.smoothing_pool_changed == 0 {
            EpochWindow::EMPTY
        } else {
            EpochWindow::new(0, changed_epoch)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinipoolStatus {
    Initialized,
    Prelaunch,
    Staking,
    Dissolved,
    Withdrawable,
    Exited,
}

/// ETH supplied by the node operator for one minipool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bond {
    Eight,
    Sixteen,
    ThirtyTwo,
    /// Any other amount, as left behind by a bond reduction.
    Variable(U256),
}

impl Bond {
    pub fn from_wei(wei: U256) -> Self {
        if wei == U256::from(8u64) * ONE_ETH {
            Bond::Eight
        } else if wei == U256::from(16u64) * ONE_ETH {
            Bond::Sixteen
        } else if wei == full_deposit() {
            Bond::ThirtyTwo
        } else {
            Bond::Variable(wei)
        }
    }

    pub fn wei(&self) -> U256 {
        match self {
            Bond::Eight => U256::from(8u64) * ONE_ETH,
            Bond::Sixteen => U256::from(16u64) * ONE_ETH,
            Bond::ThirtyTwo => full_deposit(),
            Bond::Variable(wei) => *wei,
        }
    }

    /// ETH borrowed from pool stakers to fill the rest of the deposit.
    pub fn borrowed(&self) -> U256 {
        full_deposit().saturating_sub(self.wei())
    }
}

impl Serialize for Bond {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        crate::serde_decimal::serialize(&self.wei(), serializer)
    }
}

impl<'de> Deserialize<'de> for Bond {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        crate::serde_decimal::deserialize(deserializer).map(Bond::from_wei)
    }
}

/// Bond and commission in force for a minipool at some point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondTerms {
    pub bond: Bond,
    pub fee: U256,
}

impl BondTerms {
    /// Part of a minipool's rewards owed to the operator, 1e18 fixed point:
    /// `fee + bond / 32 * (1 - fee)`.
    pub fn node_fraction(&self) -> Result<U256, RewardsError> {
        let depositor_fee = ONE_ETH.checked_sub(self.fee).ok_or(RewardsError::Arithmetic("fee"))?;
        let bonded = self
            .bond
            .wei()
            .checked_mul(depositor_fee)
            .ok_or(RewardsError::Arithmetic("node fraction"))?
            / full_deposit();
        Ok(self.fee + bonded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondReduction {
    pub time: u64,
    pub previous_bond: Bond,
    /// Commission before the reduction. Zero when it did not change.
    #[serde(with = "crate::serde_decimal")]
    pub previous_fee: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinipoolRecord {
    pub address: Address,
    pub node: Address,
    pub pubkey: Pubkey,
    pub status: MinipoolStatus,
    /// Time the minipool entered its current status.
    pub status_time: u64,
    pub finalized: bool,
    pub bond: Bond,
    #[serde(with = "crate::serde_decimal")]
    pub fee: U256,
    #[serde(default)]
    pub penalty_count: u64,
    pub bond_reduction: Option<BondReduction>,
}

impl MinipoolRecord {
    /// Only staking, non-finalized minipools earn rewards.
    pub fn is_accruing(&self) -> bool {
        self.status == MinipoolStatus::Staking && !self.finalized
    }

    /// Bond regime in force during `epoch`. A reduction takes effect from the epoch
    /// containing its timestamp.
    pub fn terms_at(&self, beacon: &BeaconConfig, epoch: u64) -> BondTerms {
        match &self.bond_reduction {
            Some(reduction) if epoch < beacon.epoch_at(reduction.time) => BondTerms {
                bond: reduction.previous_bond,
                fee: if reduction.previous_fee.is_zero() { self.fee } else { reduction.previous_fee },
            },
            _ => BondTerms { bond: self.bond, fee: self.fee },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRecord {
    pub pubkey: Pubkey,
    pub index: u64,
    pub activation_epoch: u64,
    pub exit_epoch: u64,
}

impl ValidatorRecord {
    pub fn is_active_at(&self, epoch: u64) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }
}

/// Serialized form of [NetworkState].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStateData {
    pub beacon: BeaconConfig,
    pub params: NetworkParameters,
    pub nodes: Vec<NodeRecord>,
    pub minipools: Vec<MinipoolRecord>,
    pub validators: Vec<ValidatorRecord>,
}

/// Immutable, cross-checked snapshot of the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NetworkStateData", into = "NetworkStateData")]
pub struct NetworkState {
    beacon: BeaconConfig,
    params: NetworkParameters,
    nodes: BTreeMap<Address, NodeRecord>,
    minipools: BTreeMap<Address, MinipoolRecord>,
    validators: BTreeMap<Pubkey, ValidatorRecord>,
}

impl NetworkState {
    pub fn new(data: NetworkStateData) -> Result<Self, RewardsError> {
        let NetworkStateData { beacon, params, nodes, minipools, validators } = data;
        beacon.validate()?;
        validate_params(&params)?;

        let mut validator_map = BTreeMap::new();
        let mut indices = BTreeSet::new();
        for validator in validators {
            if !indices.insert(validator.index) {
                return Err(invalid(format!("duplicate validator index {}", validator.index)));
            }
            if validator.activation_epoch > validator.exit_epoch {
                return Err(invalid(format!(
                    "validator {} activates after it exits",
                    validator.index
                )));
            }
            let pubkey = validator.pubkey;
            if validator_map.insert(pubkey, validator).is_some() {
                return Err(invalid(format!("duplicate validator pubkey {pubkey}")));
            }
        }

        let mut minipool_map = BTreeMap::new();
        let mut claimed_pubkeys = BTreeSet::new();
        for minipool in minipools {
            if minipool.fee > ONE_ETH {
                return Err(invalid(format!("minipool {} fee above 100%", minipool.address)));
            }
            if minipool.bond.wei() > full_deposit() || minipool.bond.wei().is_zero() {
                return Err(invalid(format!("minipool {} has bond outside (0, 32] ETH", minipool.address)));
            }
            if let Some(reduction) = &minipool.bond_reduction {
                if reduction.previous_bond.wei() > full_deposit() || reduction.previous_fee > ONE_ETH {
                    return Err(invalid(format!(
                        "minipool {} has an invalid bond reduction",
                        minipool.address
                    )));
                }
            }
            // Prelaunch minipools may not have a validator on the beacon chain yet.
            if minipool.is_accruing() && !validator_map.contains_key(&minipool.pubkey) {
                return Err(invalid(format!(
                    "staking minipool {} has no validator {}",
                    minipool.address, minipool.pubkey
                )));
            }
            if !claimed_pubkeys.insert(minipool.pubkey) {
                return Err(invalid(format!("pubkey {} used by two minipools", minipool.pubkey)));
            }
            let address = minipool.address;
            if minipool_map.insert(address, minipool).is_some() {
                return Err(invalid(format!("duplicate minipool {address}")));
            }
        }

        let mut node_map = BTreeMap::new();
        let mut owned = BTreeSet::new();
        for node in nodes {
            for minipool in &node.minipools {
                let record = minipool_map.get(minipool).ok_or_else(|| {
                    invalid(format!("node {} lists unknown minipool {minipool}", node.address))
                })?;
                if record.node != node.address {
                    return Err(invalid(format!(
                        "minipool {minipool} listed by {} but owned by {}",
                        node.address, record.node
                    )));
                }
                if !owned.insert(*minipool) {
                    return Err(invalid(format!("minipool {minipool} listed twice")));
                }
            }
            let address = node.address;
            if node_map.insert(address, node).is_some() {
                return Err(invalid(format!("duplicate node {address}")));
            }
        }
        if let Some(orphan) = minipool_map.keys().find(|address| !owned.contains(*address)) {
            return Err(invalid(format!("minipool {orphan} is not listed by its node")));
        }

        Ok(Self {
            beacon,
            params,
            nodes: node_map,
            minipools: minipool_map,
            validators: validator_map,
        })
    }

    pub fn beacon(&self) -> &BeaconConfig {
        &self.beacon
    }

    pub fn params(&self) -> &NetworkParameters {
        &self.params
    }

    /// Nodes in ascending address order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn node(&self, address: &Address) -> Option<&NodeRecord> {
        self.nodes.get(address)
    }

    pub fn minipool(&self, address: &Address) -> Option<&MinipoolRecord> {
        self.minipools.get(address)
    }

    /// Minipools in ascending address order.
    pub fn minipools(&self) -> impl Iterator<Item = &MinipoolRecord> {
        self.minipools.values()
    }

    /// Minipools of a node in the order the node lists them.
    pub fn minipools_of<'a>(
        &'a self,
        node: &'a NodeRecord,
    ) -> impl Iterator<Item = &'a MinipoolRecord> + 'a {
        node.minipools.iter().filter_map(|address| self.minipools.get(address))
    }

    pub fn validator(&self, pubkey: &Pubkey) -> Option<&ValidatorRecord> {
        self.validators.get(pubkey)
    }

    /// Validators whose duties decide smoothing pool weight during `interval`: those behind an
    /// accruing minipool whose node was opted in for part of it.
    pub fn tracked_validators<'a>(
        &'a self,
        interval: &'a Interval,
    ) -> impl Iterator<Item = &'a ValidatorRecord> + 'a {
        let window = interval.window();
        self.minipools
            .values()
            .filter(|mp| mp.is_accruing())
            .filter(move |mp| self.beacon.epoch_at(mp.status_time) <= interval.end_epoch)
            .filter(move |mp| {
                self.nodes
                    .get(&mp.node)
                    .is_some_and(|node| node.smoothing_pool_window(&self.beacon).overlaps(&window))
            })
            .filter_map(|mp| self.validators.get(&mp.pubkey))
    }

    /// Oracle DAO members in ascending address order.
    pub fn oracle_dao_members(&self) -> impl Iterator<Item = (&NodeRecord, &OracleDaoMembership)> {
        self.nodes.values().filter_map(|node| node.oracle_dao.as_ref().map(|odao| (node, odao)))
    }
}

impl TryFrom<NetworkStateData> for NetworkState {
    type Error = RewardsError;

    fn try_from(data: NetworkStateData) -> Result<Self, Self::Error> {
        NetworkState::new(data)
    }
}

impl From<NetworkState> for NetworkStateData {
    fn from(state: NetworkState) -> Self {
        NetworkStateData {
            beacon: state.beacon,
            params: state.params,
            nodes: state.nodes.into_values().collect(),
            minipools: state.minipools.into_values().collect(),
            validators: state.validators.into_values().collect(),
        }
    }
}

/// Snapshot file handed over by the contract binding layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub end: SnapshotEnd,
    pub state: NetworkState,
}

fn invalid(msg: String) -> RewardsError {
    RewardsError::InvalidSnapshot(msg)
}

fn validate_params(params: &NetworkParameters) -> Result<(), RewardsError> {
    if params.rpl_price.is_zero() {
        return Err(invalid("RPL price is zero".into()));
    }
    if params.min_collateral_fraction > params.max_collateral_fraction {
        return Err(invalid("minimum collateral fraction exceeds the maximum".into()));
    }
    for (name, percent) in [
        ("node operator", params.node_operator_rewards_percent),
        ("trusted node", params.trusted_node_operator_rewards_percent),
        ("protocol DAO", params.protocol_dao_rewards_percent),
    ] {
        if percent > ONE_ETH {
            return Err(invalid(format!("{name} rewards percent above 100%")));
        }
    }
    Ok(())
}
