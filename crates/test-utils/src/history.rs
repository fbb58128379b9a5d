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

//! Builder for synthetic network histories.
//!
//! A [MockHistory] hands out unique node addresses, minipool addresses, pubkeys and
//! validator indices, and turns the nodes added to it into a validated [NetworkState] for a
//! 100 epoch interval.

use alloy::primitives::{Address, B256, U256};
use rpl_rewards::{
    interval::FAR_FUTURE_EPOCH, BeaconConfig, Bond, BondReduction, Interval, MinipoolRecord,
    MinipoolStatus, NetworkParameters, NetworkState, NetworkStateData, NodeRecord,
    OracleDaoMembership, Pubkey, RewardsError, RewardsEvent, SnapshotEnd, SnapshotFile,
    ValidatorRecord, ONE_ETH,
};

/// 2020-01-01T00:00:00Z
pub const DEFAULT_GENESIS: u64 = 1_577_836_800;

/// Interval index used by default; high enough that a test tree is never mistaken for a real
/// one.
pub const DEFAULT_INDEX: u64 = 40_000;

pub fn eth(n: u64) -> U256 {
    U256::from(n) * ONE_ETH
}

/// `n / 1000` in 1e18 fixed point.
pub fn milli(n: u64) -> U256 {
    U256::from(n) * ONE_ETH / U256::from(1000u64)
}

/// Node classes of the default history.
pub mod class {
    pub const SINGLE_EIGHT_ETH: &str = "single_eight_eth";
    pub const SINGLE_EIGHT_ETH_SP: &str = "single_eight_eth_sp";
    pub const SINGLE_SIXTEEN_ETH: &str = "single_sixteen_eth";
    pub const SINGLE_SIXTEEN_ETH_SP: &str = "single_sixteen_eth_sp";
    pub const EIGHT_ETH_OPTED_IN_QUARTER: &str = "single_eight_eth_opted_in_quarter";
    pub const SIXTEEN_ETH_OPTED_IN_QUARTER: &str = "single_sixteen_eth_opted_in_quarter";
    pub const EIGHT_ETH_OPTED_OUT_THREE_QUARTERS: &str = "single_eight_eth_opted_out_three_quarters";
    pub const SIXTEEN_ETH_OPTED_OUT_THREE_QUARTERS: &str =
        "single_sixteen_eth_opted_out_three_quarters";
    pub const BOND_REDUCTION: &str = "single_bond_reduction";
    pub const NO_MINIPOOLS: &str = "no_minipools";
    pub const EIGHT_ETH_PENDING: &str = "single_eight_eth_pending";
    pub const EIGHT_ETH_FINALIZED: &str = "single_eight_eth_finalized";
    pub const ODAO: &str = "odao";
}

#[derive(Debug, Clone)]
pub struct MockMinipool {
    pub address: Address,
    pub pubkey: Pubkey,
    pub validator_index: u64,
    pub status: MinipoolStatus,
    pub status_time: u64,
    pub finalized: bool,
    pub bond: Bond,
    pub fee: U256,
    pub penalty_count: u64,
    pub bond_reduction: Option<BondReduction>,
    pub activation_epoch: u64,
    pub exit_epoch: u64,
}

#[derive(Debug, Clone)]
pub struct MockNode {
    pub address: Address,
    pub class: &'static str,
    pub rpl_stake: U256,
    pub smoothing_pool_registered: bool,
    pub smoothing_pool_changed: u64,
    pub oracle_dao: Option<OracleDaoMembership>,
    pub minipools: Vec<MockMinipool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeParams {
    pub eight_eth_minipools: usize,
    pub sixteen_eth_minipools: usize,
    pub collateral_rpl: u64,
    pub smoothing_pool: bool,
}

#[derive(Debug, Clone)]
pub struct MockHistory {
    pub beacon: BeaconConfig,
    pub start_epoch: u64,
    pub end_epoch: u64,
    /// Execution block number of a slot is the slot plus this offset.
    pub block_offset: u64,
    pub index: u64,
    pub params: NetworkParameters,
    pub nodes: Vec<MockNode>,
    last_node: u64,
    last_minipool: u64,
    last_pubkey: u64,
    last_validator_index: u64,
}

impl Default for MockHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHistory {
    /// A history without nodes covering epochs 100 through 199.
    pub fn new() -> Self {
        let beacon =
            BeaconConfig { genesis_time: DEFAULT_GENESIS, seconds_per_slot: 12, slots_per_epoch: 32 };
        Self {
            beacon,
            start_epoch: 100,
            end_epoch: 199,
            block_offset: 100_000,
            index: DEFAULT_INDEX,
            params: NetworkParameters {
                // 10 RPL backs 2.4 ETH, so an 8 ETH minipool with 10 RPL is 10% collateralized
                rpl_price: milli(240),
                min_collateral_fraction: milli(100),
                max_collateral_fraction: milli(600),
                smoothing_pool_balance: eth(100),
                node_operator_rewards_percent: milli(700),
                trusted_node_operator_rewards_percent: milli(15),
                protocol_dao_rewards_percent: milli(285),
                pending_rpl_rewards: eth(70_000),
                interval_duration: 100 * 32 * 12,
            },
            nodes: vec![],
            last_node: 2000,
            last_minipool: 30_000,
            last_pubkey: 600_000,
            last_validator_index: 0,
        }
    }

    /// A history populated with [MockHistory::default_nodes].
    pub fn with_default_nodes() -> Self {
        let mut history = Self::new();
        history.nodes = history.default_nodes();
        history
    }

    /// First epoch plus `numerator / denominator` of the interval's length.
    pub fn epoch_at_fraction(&self, numerator: u64, denominator: u64) -> u64 {
        self.start_epoch + (self.end_epoch + 1 - self.start_epoch) * numerator / denominator
    }

    pub fn epoch_start_time(&self, epoch: u64) -> u64 {
        self.beacon.epoch_start_time(epoch)
    }

    pub fn new_minipool(&mut self, bond: Bond) -> MockMinipool {
        self.last_minipool += 1;
        self.last_pubkey += 1;
        self.last_validator_index += 1;
        MockMinipool {
            address: Address::left_padding_from(&self.last_minipool.to_be_bytes()),
            pubkey: Pubkey::left_padding_from(&self.last_pubkey.to_be_bytes()),
            validator_index: self.last_validator_index,
            status: MinipoolStatus::Staking,
            status_time: self.beacon.genesis_time,
            finalized: false,
            bond,
            fee: milli(100),
            penalty_count: 0,
            bond_reduction: None,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
        }
    }

    pub fn new_node(&mut self, class: &'static str, params: NodeParams) -> MockNode {
        self.last_node += 1;
        let mut minipools = vec![];
        for _ in 0..params.eight_eth_minipools {
            minipools.push(self.new_minipool(Bond::Eight));
        }
        for _ in 0..params.sixteen_eth_minipools {
            minipools.push(self.new_minipool(Bond::Sixteen));
        }
        // Opted in one epoch before the interval starts.
        let smoothing_pool_changed = if params.smoothing_pool {
            self.epoch_start_time(self.start_epoch - 1)
        } else {
            0
        };
        MockNode {
            address: Address::left_padding_from(&self.last_node.to_be_bytes()),
            class,
            rpl_stake: eth(params.collateral_rpl),
            smoothing_pool_registered: params.smoothing_pool,
            smoothing_pool_changed,
            oracle_dao: None,
            minipools,
        }
    }

    /// Nodes covering the interesting cases: plain and smoothing pool nodes of both bond
    /// sizes, mid-interval opt in and opt out, a bond reduction, nodes with no accruing
    /// minipool and two Oracle DAO members.
    pub fn default_nodes(&mut self) -> Vec<MockNode> {
        let mut nodes = vec![];
        let eight = NodeParams { eight_eth_minipools: 1, collateral_rpl: 10, ..Default::default() };
        let sixteen =
            NodeParams { sixteen_eth_minipools: 1, collateral_rpl: 10, ..Default::default() };
        let sp = |params: NodeParams| NodeParams { smoothing_pool: true, ..params };

        for (class, params) in [
            (class::SINGLE_EIGHT_ETH, eight),
            (class::SINGLE_EIGHT_ETH_SP, sp(eight)),
            (class::SINGLE_SIXTEEN_ETH, sixteen),
            (class::SINGLE_SIXTEEN_ETH_SP, sp(sixteen)),
        ] {
            for _ in 0..10 {
                nodes.push(self.new_node(class, params));
            }
        }

        let quarter = self.epoch_start_time(self.epoch_at_fraction(1, 4));
        let three_quarters = self.epoch_start_time(self.epoch_at_fraction(3, 4));
        for (class, params, changed) in [
            (class::EIGHT_ETH_OPTED_IN_QUARTER, sp(eight), quarter),
            (class::SIXTEEN_ETH_OPTED_IN_QUARTER, sp(sixteen), quarter),
            (class::EIGHT_ETH_OPTED_OUT_THREE_QUARTERS, eight, three_quarters),
            (class::SIXTEEN_ETH_OPTED_OUT_THREE_QUARTERS, sixteen, three_quarters),
        ] {
            let mut node = self.new_node(class, NodeParams { collateral_rpl: 20, ..params });
            node.smoothing_pool_changed = changed;
            nodes.push(node);
        }

        let mut node = self.new_node(class::BOND_REDUCTION, sp(eight));
        node.minipools[0].bond_reduction = Some(BondReduction {
            time: self.epoch_start_time(self.epoch_at_fraction(1, 2)),
            previous_bond: Bond::Sixteen,
            previous_fee: milli(200),
        });
        nodes.push(node);

        // Collateral without any minipool to back.
        nodes.push(self.new_node(class::NO_MINIPOOLS, NodeParams { collateral_rpl: 10, ..Default::default() }));

        let mut node = self.new_node(class::EIGHT_ETH_PENDING, eight);
        node.minipools[0].status = MinipoolStatus::Prelaunch;
        node.minipools[0].activation_epoch = FAR_FUTURE_EPOCH;
        nodes.push(node);

        let mut node = self.new_node(class::EIGHT_ETH_FINALIZED, eight);
        node.minipools[0].finalized = true;
        nodes.push(node);

        nodes.extend(self.odao_nodes());
        nodes
    }

    pub fn odao_nodes(&mut self) -> Vec<MockNode> {
        (0..2)
            .map(|_| {
                let mut node = self.new_node(class::ODAO, NodeParams::default());
                node.oracle_dao =
                    Some(OracleDaoMembership { joined_time: self.beacon.genesis_time });
                node
            })
            .collect()
    }

    pub fn nodes_of_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a MockNode> + 'a {
        self.nodes.iter().filter(move |node| node.class == class)
    }

    pub fn snapshot_end(&self) -> SnapshotEnd {
        let consensus_block = self.beacon.last_slot(self.end_epoch);
        SnapshotEnd {
            index: self.index,
            consensus_block,
            execution_block: consensus_block + self.block_offset,
            intervals_passed: 1,
        }
    }

    pub fn interval(&self) -> Result<Interval, RewardsError> {
        let start_slot = self.beacon.first_slot(self.start_epoch);
        Interval::from_slots(&self.beacon, &self.snapshot_end(), start_slot, start_slot + self.block_offset)
    }

    pub fn state_data(&self) -> NetworkStateData {
        let mut data = NetworkStateData {
            beacon: self.beacon,
            params: self.params.clone(),
            nodes: vec![],
            minipools: vec![],
            validators: vec![],
        };
        for node in &self.nodes {
            data.nodes.push(NodeRecord {
                address: node.address,
                rpl_stake: node.rpl_stake,
                smoothing_pool_registered: node.smoothing_pool_registered,
                smoothing_pool_changed: node.smoothing_pool_changed,
                oracle_dao: node.oracle_dao.clone(),
                minipools: node.minipools.iter().map(|mp| mp.address).collect(),
            });
            for mp in &node.minipools {
                data.minipools.push(MinipoolRecord {
                    address: mp.address,
                    node: node.address,
                    pubkey: mp.pubkey,
                    status: mp.status,
                    status_time: mp.status_time,
                    finalized: mp.finalized,
                    bond: mp.bond,
                    fee: mp.fee,
                    penalty_count: mp.penalty_count,
                    bond_reduction: mp.bond_reduction.clone(),
                });
                data.validators.push(ValidatorRecord {
                    pubkey: mp.pubkey,
                    index: mp.validator_index,
                    activation_epoch: mp.activation_epoch,
                    exit_epoch: mp.exit_epoch,
                });
            }
        }
        data
    }

    pub fn network_state(&self) -> Result<NetworkState, RewardsError> {
        NetworkState::new(self.state_data())
    }

    pub fn snapshot_file(&self) -> Result<SnapshotFile, RewardsError> {
        Ok(SnapshotFile { end: self.snapshot_end(), state: self.network_state()? })
    }

    /// On-chain event of the interval before this one, ending in the epoch before
    /// `start_epoch`.
    pub fn previous_event(&self) -> RewardsEvent {
        let consensus_block = self.beacon.last_slot(self.start_epoch - 1);
        RewardsEvent {
            index: self.index - 1,
            execution_block: consensus_block + self.block_offset,
            consensus_block,
            merkle_root: B256::ZERO,
            merkle_tree_cid: String::new(),
            intervals_passed: 1,
            treasury_rpl: U256::ZERO,
            trusted_node_rpl: vec![],
            node_rpl: vec![],
            node_eth: vec![],
            user_eth: U256::ZERO,
            interval_start_time: self.epoch_start_time(self.start_epoch - 1),
            interval_end_time: self.beacon.slot_time(consensus_block),
            submission_time: self.beacon.slot_time(consensus_block) + 600,
        }
    }

    /// Validator indices of every minipool in the history.
    pub fn validator_indices(&self) -> Vec<u64> {
        self.nodes.iter().flat_map(|n| n.minipools.iter().map(|mp| mp.validator_index)).collect()
    }
}
