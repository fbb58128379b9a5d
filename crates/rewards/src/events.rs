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

//! On-chain rewards anchor events and log querying utilities.

use alloy::{
    primitives::{Address, B256, U256},
    providers::Provider,
    rpc::types::{BlockNumberOrTag, Filter, Log},
    sol,
    sol_types::SolEvent,
};
use serde::{Deserialize, Serialize};

use crate::RewardsError;

sol! {
    #[derive(Debug)]
    struct RewardSubmission {
        uint256 rewardIndex;
        uint256 executionBlock;
        uint256 consensusBlock;
        bytes32 merkleRoot;
        string merkleTreeCID;
        uint256 intervalsPassed;
        uint256 treasuryRPL;
        uint256[] trustedNodeRPL;
        uint256[] nodeRPL;
        uint256[] nodeETH;
        uint256 userETH;
    }

    /// Emitted by the rewards pool once a submission reaches consensus.
    #[derive(Debug)]
    event RewardSnapshot(
        uint256 indexed rewardIndex,
        RewardSubmission submission,
        uint256 intervalStartTime,
        uint256 intervalEndTime,
        uint256 time
    );

    /// Emitted for every individual Oracle DAO submission.
    #[derive(Debug)]
    event RewardSnapshotSubmitted(
        address indexed from,
        uint256 indexed rewardIndex,
        RewardSubmission submission,
        uint256 time
    );
}

/// The accepted result of an interval as recorded on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardsEvent {
    pub index: u64,
    pub execution_block: u64,
    pub consensus_block: u64,
    pub merkle_root: B256,
    #[serde(rename = "merkleTreeCID")]
    pub merkle_tree_cid: String,
    pub intervals_passed: u64,
    #[serde(with = "crate::serde_decimal")]
    pub treasury_rpl: U256,
    #[serde(with = "crate::serde_decimal::vec")]
    pub trusted_node_rpl: Vec<U256>,
    #[serde(with = "crate::serde_decimal::vec")]
    pub node_rpl: Vec<U256>,
    #[serde(with = "crate::serde_decimal::vec")]
    pub node_eth: Vec<U256>,
    #[serde(with = "crate::serde_decimal")]
    pub user_eth: U256,
    pub interval_start_time: u64,
    pub interval_end_time: u64,
    pub submission_time: u64,
}

/// Decoded rewards pool event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorEvent {
    Snapshot(RewardsEvent),
    Submitted { from: Address, index: u64, merkle_root: B256, time: u64 },
}

type Decoder = fn(&Log) -> Result<AnchorEvent, RewardsError>;

/// Decoders keyed by event signature.
const DECODERS: &[(B256, Decoder)] = &[
    (RewardSnapshot::SIGNATURE_HASH, decode_snapshot),
    (RewardSnapshotSubmitted::SIGNATURE_HASH, decode_submitted),
];

fn to_u64(value: U256, field: &str) -> Result<u64, RewardsError> {
    if value > U256::from(u64::MAX) {
        return Err(RewardsError::DataUnavailable(format!("{field} {value} does not fit in u64")));
    }
    Ok(value.to::<u64>())
}

fn decode_error(err: alloy::sol_types::Error) -> RewardsError {
    RewardsError::DataUnavailable(format!("failed to decode rewards pool log: {err}"))
}

fn decode_snapshot(log: &Log) -> Result<AnchorEvent, RewardsError> {
    let event = log.log_decode::<RewardSnapshot>().map_err(decode_error)?.inner.data;
    let submission = event.submission;
    Ok(AnchorEvent::Snapshot(RewardsEvent {
        index: to_u64(event.rewardIndex, "reward index")?,
        execution_block: to_u64(submission.executionBlock, "execution block")?,
        consensus_block: to_u64(submission.consensusBlock, "consensus block")?,
        merkle_root: submission.merkleRoot,
        merkle_tree_cid: submission.merkleTreeCID,
        intervals_passed: to_u64(submission.intervalsPassed, "intervals passed")?,
        treasury_rpl: submission.treasuryRPL,
        trusted_node_rpl: submission.trustedNodeRPL,
        node_rpl: submission.nodeRPL,
        node_eth: submission.nodeETH,
        user_eth: submission.userETH,
        interval_start_time: to_u64(event.intervalStartTime, "interval start time")?,
        interval_end_time: to_u64(event.intervalEndTime, "interval end time")?,
        submission_time: to_u64(event.time, "submission time")?,
    }))
}

fn decode_submitted(log: &Log) -> Result<AnchorEvent, RewardsError> {
    let event = log.log_decode::<RewardSnapshotSubmitted>().map_err(decode_error)?.inner.data;
    Ok(AnchorEvent::Submitted {
        from: event.from,
        index: to_u64(event.rewardIndex, "reward index")?,
        merkle_root: event.submission.merkleRoot,
        time: to_u64(event.time, "submission time")?,
    })
}

/// Largest block range requested from the provider in one `eth_getLogs` call.
pub const BLOCK_CHUNK_SIZE: u64 = 50_000;

/// Decode a rewards pool log. Logs of other events yield `None`.
pub fn decode_anchor_log(log: &Log) -> Option<Result<AnchorEvent, RewardsError>> {
    let topic0 = log.topic0()?;
    DECODERS.iter().find(|(signature, _)| signature == topic0).map(|(_, decode)| decode(log))
}

/// Query logs for `from_block..=to_block` in windows of [`BLOCK_CHUNK_SIZE`] blocks.
///
/// Providers cap the range of a single `eth_getLogs` call, so a rewards event that may sit
/// anywhere in a long interval is searched window by window. Logs come back in block order.
pub async fn query_logs_chunked<P: Provider>(
    provider: &P,
    filter: Filter,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<Log>, RewardsError> {
    let mut all_logs = Vec::new();

    let mut current_from = from_block;
    while current_from <= to_block {
        let current_to = (current_from + BLOCK_CHUNK_SIZE - 1).min(to_block);

        let chunk_filter = filter
            .clone()
            .from_block(BlockNumberOrTag::Number(current_from))
            .to_block(BlockNumberOrTag::Number(current_to));

        let logs = provider.get_logs(&chunk_filter).await.map_err(|e| {
            RewardsError::DataUnavailable(format!(
                "get_logs {current_from}..={current_to} failed: {e}"
            ))
        })?;
        all_logs.extend(logs);

        current_from = current_to + 1;
    }

    Ok(all_logs)
}

/// Fetch the accepted rewards event for interval `index` from the rewards pool.
pub async fn fetch_rewards_event<P: Provider>(
    provider: &P,
    rewards_pool: Address,
    index: u64,
    from_block: u64,
    to_block: u64,
) -> Result<RewardsEvent, RewardsError> {
    tracing::info!("Searching blocks {from_block} to {to_block} for the interval {index} rewards event");
    let filter = Filter::new()
        .address(rewards_pool)
        .event_signature(RewardSnapshot::SIGNATURE_HASH)
        .topic1(B256::from(U256::from(index)));
    let logs = query_logs_chunked(provider, filter, from_block, to_block).await?;

    let mut found = None;
    for log in &logs {
        if let Some(AnchorEvent::Snapshot(event)) = decode_anchor_log(log).transpose()? {
            if event.index == index {
                found = Some(event);
            }
        }
    }
    found.ok_or_else(|| {
        RewardsError::DataUnavailable(format!("no rewards event for interval {index}"))
    })
}
