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

use std::sync::Arc;

use alloy::primitives::U256;
use rpl_rewards::{
    files::MinipoolPerformance, Bond, BondReduction, DutyOverrides, EngineConfig, GeneratedTree,
    TreeGenerator,
};
use rpl_test_utils::{class, eth, milli, MockBeacon, MockHistory, NodeParams};

/// Smoothing pool nodes with one 8 ETH minipool each, registered before the interval.
fn smoothing_pool_history(nodes: usize) -> MockHistory {
    let mut history = MockHistory::new();
    let params = NodeParams {
        eight_eth_minipools: 1,
        collateral_rpl: 10,
        smoothing_pool: true,
        ..Default::default()
    };
    for _ in 0..nodes {
        let node = history.new_node(class::SINGLE_EIGHT_ETH_SP, params);
        history.nodes.push(node);
    }
    history
}

fn validator(history: &MockHistory, node: usize) -> u64 {
    history.nodes[node].minipools[0].validator_index
}

async fn run(history: &MockHistory, beacon: MockBeacon, overrides: DutyOverrides) -> GeneratedTree {
    let config =
        EngineConfig { network: "testnet".into(), retry_backoff_ms: 10, ..Default::default() };
    let generator = TreeGenerator::new(Arc::new(beacon), config);
    generator
        .generate(&history.interval().unwrap(), Arc::new(history.network_state().unwrap()), overrides)
        .await
        .unwrap()
}

fn performance<'a>(
    tree: &'a GeneratedTree,
    history: &MockHistory,
    node: usize,
) -> &'a MinipoolPerformance {
    &tree.performance_file.minipool_performance[&history.nodes[node].minipools[0].address]
}

fn node_eth(tree: &GeneratedTree, history: &MockHistory, node: usize) -> U256 {
    tree.rewards_file.node_rewards[&history.nodes[node].address].smoothing_pool_eth
}

#[tokio::test]
async fn opt_in_counts_from_containing_epoch() {
    for (offset, expected) in [(0i64, 50), (1, 50), (-1, 51)] {
        let mut history = smoothing_pool_history(1);
        let boundary = history.epoch_start_time(150);
        history.nodes[0].smoothing_pool_changed = boundary.saturating_add_signed(offset);

        let tree = run(&history, MockBeacon::for_history(&history), DutyOverrides::new()).await;
        let minipool = performance(&tree, &history, 0);
        assert_eq!(minipool.attendance_weight, expected, "opted in at {offset:+}s");
        // Epochs before the opt in are not counted at all.
        assert_eq!(minipool.successful_attestations, expected);
        assert_eq!(minipool.missed_attestations, 0);
    }
}

#[tokio::test]
async fn bond_reduction_switches_split_mid_interval() {
    let mut history = smoothing_pool_history(1);
    let reduced_at = history.epoch_start_time(150);
    history.nodes[0].minipools[0].bond_reduction = Some(BondReduction {
        time: reduced_at,
        previous_bond: Bond::Sixteen,
        previous_fee: milli(200),
    });

    let tree = run(&history, MockBeacon::for_history(&history), DutyOverrides::new()).await;
    // Fifty epochs at 16 ETH and 20% (0.6), fifty at 8 ETH and 10% (0.325).
    assert_eq!(node_eth(&tree, &history, 0), milli(46_250));
    assert_eq!(performance(&tree, &history, 0).attendance_weight, 100);
    assert_eq!(tree.rewards_file.total_rewards.pool_staker_smoothing_pool_eth, milli(53_750));

    // Without a recorded previous fee the current one applies before the reduction too.
    history.nodes[0].minipools[0].bond_reduction = Some(BondReduction {
        time: reduced_at,
        previous_bond: Bond::Sixteen,
        previous_fee: U256::ZERO,
    });
    let tree = run(&history, MockBeacon::for_history(&history), DutyOverrides::new()).await;
    assert_eq!(node_eth(&tree, &history, 0), milli(43_750));
}

#[tokio::test]
async fn exit_excuses_remaining_epochs() {
    let mut history = smoothing_pool_history(1);
    history.nodes[0].minipools[0].exit_epoch = 150;

    let tree = run(&history, MockBeacon::for_history(&history), DutyOverrides::new()).await;
    let minipool = performance(&tree, &history, 0);
    assert_eq!(minipool.successful_attestations, 50);
    assert_eq!(minipool.excused_epochs, 50);
    assert_eq!(minipool.missed_attestations, 0);
    assert_eq!(minipool.attendance_weight, 50);
    // Still the only weight in the pool.
    assert_eq!(minipool.eth_earned, eth(100));
}

#[tokio::test]
async fn missed_attestations_lose_weight() {
    let history = smoothing_pool_history(2);
    let missing = validator(&history, 0);
    let beacon = MockBeacon::for_history(&history).with_missed_attestations(missing, 100..110);

    let tree = run(&history, beacon, DutyOverrides::new()).await;
    let minipool = performance(&tree, &history, 0);
    assert_eq!(minipool.missed_attestations, 10);
    assert_eq!(minipool.successful_attestations, 90);
    assert_eq!(minipool.attendance_weight, 90);
    let expected_slots: Vec<u64> =
        (100..110).map(|epoch| history.beacon.first_slot(epoch) + missing % 32).collect();
    assert_eq!(minipool.missing_attestation_slots, expected_slots);
    assert_eq!(performance(&tree, &history, 1).attendance_weight, 100);

    // 90 and 100 of 190 weighted epochs, rounded down.
    let balance = eth(100);
    assert_eq!(minipool.eth_earned, balance * U256::from(90) / U256::from(190));
    let totals = &tree.rewards_file.total_rewards;
    assert_eq!(
        totals.node_operator_smoothing_pool_eth
            + totals.pool_staker_smoothing_pool_eth
            + totals.carried_over_eth,
        balance
    );
    assert!(node_eth(&tree, &history, 0) < node_eth(&tree, &history, 1));
}

#[tokio::test]
async fn missed_proposal_outranks_override() {
    let history = smoothing_pool_history(1);
    let v = validator(&history, 0);
    let slot = history.beacon.first_slot(120) + 5;
    let beacon =
        MockBeacon::for_history(&history).with_proposal(slot, v).with_missing_block(slot);
    let mut overrides = DutyOverrides::new();
    overrides.entry(v).or_default().extend([120, 130]);

    let tree = run(&history, beacon, overrides).await;
    let minipool = performance(&tree, &history, 0);
    assert_eq!(minipool.disqualified_epochs, 1);
    assert_eq!(minipool.missed_attestations, 1);
    assert_eq!(minipool.successful_attestations, 98);
    assert_eq!(minipool.attendance_weight, 98);
}

#[tokio::test]
async fn delivered_proposal_keeps_weight() {
    let history = smoothing_pool_history(1);
    let v = validator(&history, 0);
    let beacon =
        MockBeacon::for_history(&history).with_proposal(history.beacon.first_slot(120) + 5, v);

    let tree = run(&history, beacon, DutyOverrides::new()).await;
    assert_eq!(performance(&tree, &history, 0).attendance_weight, 100);
}

#[tokio::test]
async fn sync_committee_failure_disqualifies_epoch() {
    let history = smoothing_pool_history(1);
    let v = validator(&history, 0);
    let failed = history.beacon.first_slot(140) + 3;
    // A slot without a block is not held against the sync committee.
    let empty = history.beacon.first_slot(160) + 10;
    let beacon = MockBeacon::for_history(&history)
        .with_sync_committee([v])
        .with_sync_failure(v, failed)
        .with_sync_failure(v, empty)
        .with_missing_block(empty);

    let tree = run(&history, beacon, DutyOverrides::new()).await;
    let minipool = performance(&tree, &history, 0);
    assert_eq!(minipool.disqualified_epochs, 1);
    assert_eq!(minipool.attendance_weight, 99);
}

#[tokio::test]
async fn attestation_beyond_inclusion_window_is_missed() {
    let history = smoothing_pool_history(1);
    let v = validator(&history, 0);
    let attested = history.beacon.first_slot(130) + v % 32;
    // The next block appears 33 slots after the attestation.
    let mut beacon = MockBeacon::for_history(&history);
    for slot in attested + 1..=attested + 32 {
        beacon = beacon.with_missing_block(slot);
    }

    let tree = run(&history, beacon, DutyOverrides::new()).await;
    let minipool = performance(&tree, &history, 0);
    assert_eq!(minipool.missed_attestations, 1);
    assert_eq!(minipool.missing_attestation_slots, vec![attested]);
    assert_eq!(minipool.attendance_weight, 99);
}
