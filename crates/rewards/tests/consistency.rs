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

use std::{collections::BTreeMap, sync::Arc};

use alloy::primitives::B256;
use async_trait::async_trait;
use rpl_rewards::{
    check_root, files::rewards_file_name, reconcile, ContentStore, DutyOverrides, EngineConfig,
    Reconciled, RewardsError, RewardsEvent, RewardsFile, TreeGenerator,
};
use rpl_test_utils::{class, eth, MockBeacon, MockHistory, NodeParams};

const NETWORK: &str = "testnet";
const CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

/// Content addressed files held in memory, keyed by CID and file name.
#[derive(Default)]
struct MemoryStore {
    files: BTreeMap<(String, String), Vec<u8>>,
}

impl MemoryStore {
    fn pin(&mut self, cid: &str, file: &RewardsFile) {
        let name = rewards_file_name(NETWORK, file.index, true);
        self.files.insert((cid.to_string(), name), file.encode(true).unwrap());
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn fetch(&self, cid: &str, file_name: &str) -> Result<Vec<u8>, RewardsError> {
        self.files
            .get(&(cid.to_string(), file_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                RewardsError::DataUnavailable(format!("{cid}/{file_name} is not pinned"))
            })
    }
}

async fn rewards_file() -> RewardsFile {
    // The first interval needs no beacon data.
    let mut history = MockHistory::new();
    history.index = 0;
    let params = NodeParams { eight_eth_minipools: 1, collateral_rpl: 10, ..Default::default() };
    for collateral_rpl in [10, 20, 30] {
        let node =
            history.new_node(class::SINGLE_EIGHT_ETH, NodeParams { collateral_rpl, ..params });
        history.nodes.push(node);
    }
    let config = EngineConfig { network: NETWORK.into(), ..Default::default() };
    let generator = TreeGenerator::new(Arc::new(MockBeacon::for_history(&history)), config);
    generator
        .generate(
            &history.interval().unwrap(),
            Arc::new(history.network_state().unwrap()),
            DutyOverrides::new(),
        )
        .await
        .unwrap()
        .rewards_file
}

fn anchor(file: &RewardsFile) -> RewardsEvent {
    RewardsEvent {
        index: file.index,
        execution_block: file.execution_end_block,
        consensus_block: file.consensus_end_block,
        merkle_root: file.merkle_root,
        merkle_tree_cid: CID.to_string(),
        intervals_passed: file.intervals_passed,
        treasury_rpl: file.total_rewards.protocol_dao_rpl,
        trusted_node_rpl: vec![file.total_rewards.total_oracle_dao_rpl],
        node_rpl: vec![file.total_rewards.total_collateral_rpl],
        node_eth: vec![file.total_rewards.node_operator_smoothing_pool_eth],
        user_eth: file.total_rewards.pool_staker_smoothing_pool_eth,
        interval_start_time: file.start_time.timestamp() as u64,
        interval_end_time: file.end_time.timestamp() as u64,
        submission_time: file.end_time.timestamp() as u64 + 600,
    }
}

fn tampered(file: &RewardsFile) -> RewardsFile {
    let mut file = file.clone();
    let entry = file.node_rewards.values_mut().next().unwrap();
    entry.collateral_rpl += eth(1);
    file
}

#[tokio::test]
async fn matching_local_file_is_kept() {
    let file = rewards_file().await;
    let event = anchor(&file);
    check_root(&file, &event).unwrap();

    let reconciled = reconcile(Some(file.clone()), &event, NETWORK, &MemoryStore::default())
        .await
        .unwrap();
    assert!(matches!(reconciled, Reconciled::Local(_)));
    assert_eq!(reconciled.into_file(), file);
}

#[tokio::test]
async fn tampered_local_file_is_replaced() {
    let file = rewards_file().await;
    let event = anchor(&file);
    let mut store = MemoryStore::default();
    store.pin(CID, &file);

    let local = tampered(&file);
    assert!(matches!(local.verify_self(), Err(RewardsError::FileIntegrity(_))));

    let reconciled = reconcile(Some(local), &event, NETWORK, &store).await.unwrap();
    assert!(matches!(reconciled, Reconciled::Downloaded(_)));
    assert_eq!(reconciled.file(), &file);
}

#[tokio::test]
async fn missing_local_file_is_downloaded() {
    let file = rewards_file().await;
    let event = anchor(&file);
    let mut store = MemoryStore::default();
    store.pin(CID, &file);

    let reconciled = reconcile(None, &event, NETWORK, &store).await.unwrap();
    assert_eq!(reconciled.into_file(), file);
}

#[tokio::test]
async fn local_file_with_other_root_is_replaced() {
    let file = rewards_file().await;
    let mut store = MemoryStore::default();
    store.pin(CID, &file);

    // A local file committing to a root the chain never accepted.
    let mut other = file.clone();
    other.merkle_root = B256::repeat_byte(0x42);
    let event = anchor(&file);
    assert!(matches!(
        check_root(&other, &event),
        Err(RewardsError::RootMismatch { index: 0, .. })
    ));

    let reconciled = reconcile(Some(other), &event, NETWORK, &store).await.unwrap();
    assert_eq!(reconciled.file().merkle_root, event.merkle_root);
}

#[tokio::test]
async fn downloaded_file_must_match_anchor() {
    let file = rewards_file().await;
    let mut store = MemoryStore::default();
    store.pin(CID, &file);

    let mut event = anchor(&file);
    event.merkle_root = B256::repeat_byte(0x42);
    assert!(matches!(
        reconcile(None, &event, NETWORK, &store).await,
        Err(RewardsError::FileIntegrity(_))
    ));

    // The pinned file claims another interval.
    let mut store = MemoryStore::default();
    let mut wrong_index = file.clone();
    wrong_index.index = 7;
    let name = rewards_file_name(NETWORK, 0, true);
    store.files.insert((CID.to_string(), name), wrong_index.encode(true).unwrap());
    assert!(matches!(
        reconcile(None, &anchor(&file), NETWORK, &store).await,
        Err(RewardsError::FileIntegrity(_))
    ));

    // Tampered bytes behind the right name.
    let mut store = MemoryStore::default();
    store.pin(CID, &tampered(&file));
    assert!(matches!(
        reconcile(None, &anchor(&file), NETWORK, &store).await,
        Err(RewardsError::FileIntegrity(_))
    ));
}

#[tokio::test]
async fn unpinned_file_is_unavailable() {
    let file = rewards_file().await;
    let result = reconcile(None, &anchor(&file), NETWORK, &MemoryStore::default()).await;
    assert!(matches!(result, Err(RewardsError::DataUnavailable(_))));

    let mut store = MemoryStore::default();
    let name = rewards_file_name(NETWORK, 0, true);
    store.files.insert((CID.to_string(), name), b"garbage".to_vec());
    assert!(matches!(
        reconcile(None, &anchor(&file), NETWORK, &store).await,
        Err(RewardsError::FileIntegrity(_))
    ));
}
