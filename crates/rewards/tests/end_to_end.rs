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

use alloy::primitives::{Address, B256, U256};
use rpl_rewards::{
    merkle, resolve_interval, DutyOverrides, EngineConfig, EthSplit, GeneratedTree, LeafEncoding,
    RewardLeaf, RewardsError, RewardsEvent, RewardsFile, TreeGenerator,
};
use rpl_test_utils::{class, eth, milli, MockBeacon, MockHistory, NodeParams};

fn test_config() -> EngineConfig {
    EngineConfig { network: "testnet".into(), retry_backoff_ms: 10, ..Default::default() }
}

/// Ten plain and ten smoothing pool nodes, each with one 8 ETH minipool and 10 RPL.
fn eight_eth_history() -> MockHistory {
    let mut history = MockHistory::new();
    let plain = NodeParams { eight_eth_minipools: 1, collateral_rpl: 10, ..Default::default() };
    let sp = NodeParams { smoothing_pool: true, ..plain };
    for _ in 0..10 {
        let node = history.new_node(class::SINGLE_EIGHT_ETH, plain);
        history.nodes.push(node);
    }
    for _ in 0..10 {
        let node = history.new_node(class::SINGLE_EIGHT_ETH_SP, sp);
        history.nodes.push(node);
    }
    history
}

async fn generate(
    history: &MockHistory,
    beacon: Arc<MockBeacon>,
    config: EngineConfig,
) -> Result<GeneratedTree, RewardsError> {
    let generator = TreeGenerator::new(beacon, config);
    let state = Arc::new(history.network_state()?);
    generator.generate(&history.interval()?, state, DutyOverrides::new()).await
}

fn node_eth(file: &RewardsFile, node: &Address) -> U256 {
    file.node_rewards.get(node).map(|entry| entry.smoothing_pool_eth).unwrap_or_default()
}

fn assert_proofs_verify(file: &RewardsFile) {
    for (address, entry) in &file.node_rewards {
        let leaf = RewardLeaf::new(*address, file.index, &entry.rewards()).hash(file.leaf_encoding);
        assert!(
            merkle::verify(&entry.merkle_proof, &file.merkle_root, &leaf),
            "proof of {address} does not verify"
        );
    }
}

#[test_log::test(tokio::test)]
async fn smoothing_pool_nodes_earn_operator_share() {
    let history = eight_eth_history();
    let beacon = Arc::new(MockBeacon::for_history(&history));
    let tree = generate(&history, beacon, test_config()).await.unwrap();
    let file = &tree.rewards_file;

    assert_eq!(file.merkle_root, tree.root);
    assert_eq!(file.leaf_encoding, LeafEncoding::V1);
    assert_eq!(file.node_rewards.len(), 20);

    // 70% of 70,000 RPL over twenty equal stakes.
    for entry in file.node_rewards.values() {
        assert_eq!(entry.collateral_rpl, eth(2450));
        assert_eq!(entry.oracle_dao_rpl, U256::ZERO);
    }
    // Without Oracle DAO members their share joins the protocol DAO share.
    assert_eq!(file.total_rewards.protocol_dao_rpl, eth(21_000));

    // 10 ETH per minipool; the node keeps 10% commission plus a quarter of the rest.
    for node in history.nodes_of_class(class::SINGLE_EIGHT_ETH_SP) {
        assert_eq!(node_eth(file, &node.address), milli(3250));
    }
    for node in history.nodes_of_class(class::SINGLE_EIGHT_ETH) {
        assert_eq!(node_eth(file, &node.address), U256::ZERO);
    }
    assert_eq!(file.total_rewards.node_operator_smoothing_pool_eth, milli(32_500));
    assert_eq!(file.total_rewards.pool_staker_smoothing_pool_eth, milli(67_500));
    assert_eq!(file.total_rewards.carried_over_eth, U256::ZERO);

    let performance = &tree.performance_file;
    assert_eq!(performance.minipool_performance.len(), 10);
    for minipool in performance.minipool_performance.values() {
        assert_eq!(minipool.successful_attestations, 100);
        assert_eq!(minipool.attendance_weight, 100);
        assert!(minipool.missing_attestation_slots.is_empty());
        assert_eq!(minipool.eth_earned, eth(10));
    }

    assert_proofs_verify(file);
}

#[tokio::test]
async fn full_apportionment_credits_whole_share() {
    let history = eight_eth_history();
    let beacon = Arc::new(MockBeacon::for_history(&history));
    let config = EngineConfig { eth_split: EthSplit::FullApportionment, ..test_config() };
    let tree = generate(&history, beacon, config).await.unwrap();

    for node in history.nodes_of_class(class::SINGLE_EIGHT_ETH_SP) {
        assert_eq!(node_eth(&tree.rewards_file, &node.address), eth(10));
    }
    assert_eq!(tree.rewards_file.total_rewards.pool_staker_smoothing_pool_eth, U256::ZERO);
}

#[tokio::test]
async fn output_is_deterministic() {
    let history = MockHistory::with_default_nodes();
    let first = generate(&history, Arc::new(MockBeacon::for_history(&history)), test_config())
        .await
        .unwrap();
    let second = generate(&history, Arc::new(MockBeacon::for_history(&history)), test_config())
        .await
        .unwrap();

    assert_eq!(first, second);
    for compress in [false, true] {
        assert_eq!(
            first.rewards_file.encode(compress).unwrap(),
            second.rewards_file.encode(compress).unwrap()
        );
        assert_eq!(
            first.performance_file.encode(compress).unwrap(),
            second.performance_file.encode(compress).unwrap()
        );
    }

    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let (rewards_a, performance_a) = first.write(a.path(), true).unwrap();
    let (rewards_b, performance_b) = second.write(b.path(), true).unwrap();
    assert_eq!(rewards_a.file_name(), rewards_b.file_name());
    assert_eq!(std::fs::read(&rewards_a).unwrap(), std::fs::read(&rewards_b).unwrap());
    assert_eq!(std::fs::read(&performance_a).unwrap(), std::fs::read(&performance_b).unwrap());

    let loaded = RewardsFile::load(&rewards_a).unwrap();
    assert_eq!(loaded, first.rewards_file);
    loaded.verify_self().unwrap();
}

#[tokio::test]
async fn default_history_conserves_every_pool() {
    let history = MockHistory::with_default_nodes();
    let beacon = Arc::new(MockBeacon::for_history(&history));
    let tree = generate(&history, beacon, test_config()).await.unwrap();
    let file = &tree.rewards_file;
    let totals = &file.total_rewards;

    let sum = |f: fn(&rpl_rewards::files::NodeRewardsEntry) -> U256| {
        file.node_rewards.values().fold(U256::ZERO, |acc, entry| acc + f(entry))
    };
    assert_eq!(sum(|e| e.collateral_rpl), totals.total_collateral_rpl);
    assert_eq!(sum(|e| e.oracle_dao_rpl), totals.total_oracle_dao_rpl);
    assert_eq!(sum(|e| e.smoothing_pool_eth), totals.node_operator_smoothing_pool_eth);
    assert_eq!(
        totals.total_collateral_rpl + totals.total_oracle_dao_rpl + totals.protocol_dao_rpl,
        history.params.pending_rpl_rewards
    );
    assert_eq!(
        totals.node_operator_smoothing_pool_eth
            + totals.pool_staker_smoothing_pool_eth
            + totals.carried_over_eth,
        history.params.smoothing_pool_balance
    );
    assert_eq!(totals.total_smoothing_pool_eth, history.params.smoothing_pool_balance);

    // Both members served the whole interval and split 1.5% of the pending rewards.
    for node in history.nodes_of_class(class::ODAO) {
        assert_eq!(file.node_rewards[&node.address].oracle_dao_rpl, eth(525));
    }

    let weight_of = |class: &str| -> Vec<u64> {
        history
            .nodes_of_class(class)
            .flat_map(|node| node.minipools.iter())
            .map(|mp| tree.performance_file.minipool_performance[&mp.address].attendance_weight)
            .collect()
    };
    assert_eq!(weight_of(class::EIGHT_ETH_OPTED_IN_QUARTER), vec![75]);
    assert_eq!(weight_of(class::SIXTEEN_ETH_OPTED_IN_QUARTER), vec![75]);
    assert_eq!(weight_of(class::EIGHT_ETH_OPTED_OUT_THREE_QUARTERS), vec![75]);
    assert_eq!(weight_of(class::SIXTEEN_ETH_OPTED_OUT_THREE_QUARTERS), vec![75]);
    assert_eq!(weight_of(class::BOND_REDUCTION), vec![100]);

    for class in [class::NO_MINIPOOLS, class::EIGHT_ETH_PENDING, class::EIGHT_ETH_FINALIZED] {
        for node in history.nodes_of_class(class) {
            assert_eq!(node_eth(file, &node.address), U256::ZERO, "{class} earned ETH");
            for mp in &node.minipools {
                assert!(!tree.performance_file.minipool_performance.contains_key(&mp.address));
            }
        }
    }

    // A sixteen ETH bond keeps a larger part of the same share than an eight ETH bond.
    let eight = history.nodes_of_class(class::SINGLE_EIGHT_ETH_SP).next().unwrap();
    let sixteen = history.nodes_of_class(class::SINGLE_SIXTEEN_ETH_SP).next().unwrap();
    assert!(node_eth(file, &sixteen.address) > node_eth(file, &eight.address));

    assert_proofs_verify(file);
}

#[tokio::test]
async fn first_interval_skips_replay() {
    let mut history = eight_eth_history();
    history.index = 0;
    let beacon = Arc::new(MockBeacon::for_history(&history));
    let tree = generate(&history, beacon.clone(), test_config()).await.unwrap();

    assert_eq!(beacon.calls(), 0);
    let totals = &tree.rewards_file.total_rewards;
    assert_eq!(totals.carried_over_eth, eth(100));
    assert_eq!(totals.node_operator_smoothing_pool_eth, U256::ZERO);
    assert_eq!(totals.total_collateral_rpl, eth(49_000));
    assert!(tree.performance_file.minipool_performance.is_empty());
}

#[tokio::test]
async fn interval_resolves_from_previous_event() {
    let history = eight_eth_history();
    let beacon = Arc::new(MockBeacon::for_history(&history));
    let previous = history.previous_event();

    let generator = TreeGenerator::new(beacon.clone(), test_config());
    let interval = resolve_interval(
        generator.replayer(),
        &history.beacon,
        Some(&previous),
        &history.snapshot_end(),
    )
    .await
    .unwrap();
    assert_eq!(interval, history.interval().unwrap());

    let stale = RewardsEvent { index: history.index - 2, ..previous };
    assert!(matches!(
        resolve_interval(generator.replayer(), &history.beacon, Some(&stale), &history.snapshot_end())
            .await,
        Err(RewardsError::InvalidSnapshot(_))
    ));
}

#[tokio::test]
async fn interval_start_skips_empty_slots() {
    let history = eight_eth_history();
    let first_slot = history.beacon.first_slot(history.start_epoch);
    let beacon = Arc::new(
        MockBeacon::for_history(&history)
            .with_missing_block(first_slot)
            .with_missing_block(first_slot + 1),
    );
    let generator = TreeGenerator::new(beacon, test_config());
    let previous_end = history.beacon.last_slot(history.start_epoch - 1);
    let previous = serde_json::json!({
        "index": history.index - 1,
        "executionBlock": previous_end + history.block_offset,
        "consensusBlock": previous_end,
        "merkleRoot": B256::ZERO,
        "merkleTreeCID": "",
        "intervalsPassed": 1,
        "treasuryRpl": "0",
        "trustedNodeRpl": [],
        "nodeRpl": [],
        "nodeEth": [],
        "userEth": "0",
        "intervalStartTime": 0,
        "intervalEndTime": 0,
        "submissionTime": 0,
    });
    let previous: RewardsEvent = serde_json::from_value(previous).unwrap();

    let interval = resolve_interval(
        generator.replayer(),
        &history.beacon,
        Some(&previous),
        &history.snapshot_end(),
    )
    .await
    .unwrap();
    assert_eq!(interval.start_epoch, history.start_epoch);
    assert_eq!(interval.consensus_start_block, first_slot);
    assert_eq!(interval.execution_start_block, first_slot + 2 + history.block_offset);
}
