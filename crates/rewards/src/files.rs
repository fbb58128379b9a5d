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

//! Published artifacts of an interval: the rewards file holding the Merkle tree, and the
//! minipool performance file explaining how the smoothing pool was split.
//!
//! Both serialize deterministically. Maps are ordered, amounts are decimal strings and gzip
//! output carries a zero mtime, so the same inputs always give the same bytes.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use alloy::primitives::{Address, B256, U256};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, Compression, GzBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    aggregate::{NodeRewards, RewardLedger},
    duties::DutyReport,
    interval::Interval,
    merkle::{verify, LeafEncoding, MerkleTree, RewardLeaf},
    smoothing::SmoothingPoolResult,
    state::{NetworkState, Pubkey},
    RewardsError,
};

pub const REWARDS_FILE_VERSION: u64 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn rewards_file_name(network: &str, index: u64, compressed: bool) -> String {
    with_extension(format!("rp-rewards-{network}-{index}.json"), compressed)
}

pub fn performance_file_name(network: &str, index: u64, compressed: bool) -> String {
    with_extension(format!("rp-minipool-performance-{network}-{index}.json"), compressed)
}

fn with_extension(name: String, compressed: bool) -> String {
    if compressed {
        format!("{name}.gz")
    } else {
        name
    }
}

fn timestamp(secs: u64) -> Result<DateTime<Utc>, RewardsError> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or(RewardsError::Arithmetic("timestamp out of range"))
}

pub(crate) fn encode<T: Serialize>(value: &T, compress: bool) -> Result<Vec<u8>, RewardsError> {
    let json = serde_json::to_vec_pretty(value)?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RewardsError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    } else {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RewardsError> {
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite).write(|f| f.write_all(bytes)).map_err(
        |err| match err {
            atomicwrites::Error::Internal(err) | atomicwrites::Error::User(err) => {
                RewardsError::Io(err)
            }
        },
    )?;
    tracing::debug!("Wrote {}", path.display());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalRewards {
    #[serde(with = "crate::serde_decimal")]
    pub protocol_dao_rpl: U256,
    #[serde(with = "crate::serde_decimal")]
    pub total_collateral_rpl: U256,
    #[serde(with = "crate::serde_decimal")]
    pub total_oracle_dao_rpl: U256,
    #[serde(with = "crate::serde_decimal")]
    pub total_smoothing_pool_eth: U256,
    #[serde(with = "crate::serde_decimal")]
    pub pool_staker_smoothing_pool_eth: U256,
    #[serde(with = "crate::serde_decimal")]
    pub node_operator_smoothing_pool_eth: U256,
    #[serde(with = "crate::serde_decimal")]
    pub carried_over_eth: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRewardsEntry {
    #[serde(with = "crate::serde_decimal")]
    pub collateral_rpl: U256,
    #[serde(with = "crate::serde_decimal")]
    pub oracle_dao_rpl: U256,
    #[serde(with = "crate::serde_decimal")]
    pub smoothing_pool_eth: U256,
    pub merkle_proof: Vec<B256>,
}

impl NodeRewardsEntry {
    pub fn rewards(&self) -> NodeRewards {
        NodeRewards {
            collateral_rpl: self.collateral_rpl,
            oracle_dao_rpl: self.oracle_dao_rpl,
            smoothing_pool_eth: self.smoothing_pool_eth,
        }
    }
}

/// The canonical rewards file of an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardsFile {
    pub rewards_file_version: u64,
    pub leaf_encoding: LeafEncoding,
    pub network: String,
    pub index: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub consensus_start_block: u64,
    pub consensus_end_block: u64,
    pub execution_start_block: u64,
    pub execution_end_block: u64,
    pub intervals_passed: u64,
    pub merkle_root: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minipool_performance_file_cid: Option<String>,
    pub total_rewards: TotalRewards,
    pub node_rewards: BTreeMap<Address, NodeRewardsEntry>,
}

impl RewardsFile {
    /// Assemble the file from an aggregated ledger and the tree built over it. Nodes without
    /// a leaf are left out.
    pub fn new(
        network: &str,
        interval: &Interval,
        ledger: &RewardLedger,
        tree: &MerkleTree,
    ) -> Result<Self, RewardsError> {
        let node_rewards = ledger
            .nodes
            .iter()
            .filter_map(|(address, rewards)| {
                let merkle_proof = tree.proof(address)?;
                Some((
                    *address,
                    NodeRewardsEntry {
                        collateral_rpl: rewards.collateral_rpl,
                        oracle_dao_rpl: rewards.oracle_dao_rpl,
                        smoothing_pool_eth: rewards.smoothing_pool_eth,
                        merkle_proof,
                    },
                ))
            })
            .collect();

        Ok(Self {
            rewards_file_version: REWARDS_FILE_VERSION,
            leaf_encoding: tree.encoding(),
            network: network.to_string(),
            index: interval.index,
            start_time: timestamp(interval.start_time)?,
            end_time: timestamp(interval.end_time)?,
            consensus_start_block: interval.consensus_start_block,
            consensus_end_block: interval.consensus_end_block,
            execution_start_block: interval.execution_start_block,
            execution_end_block: interval.execution_end_block,
            intervals_passed: interval.intervals_passed,
            merkle_root: tree.root(),
            minipool_performance_file_cid: None,
            total_rewards: TotalRewards {
                protocol_dao_rpl: ledger.rpl.treasury_rpl,
                total_collateral_rpl: ledger.rpl.collateral_rpl,
                total_oracle_dao_rpl: ledger.rpl.oracle_dao_rpl,
                total_smoothing_pool_eth: ledger.smoothing_pool_balance,
                pool_staker_smoothing_pool_eth: ledger.user_eth,
                node_operator_smoothing_pool_eth: ledger.node_eth,
                carried_over_eth: ledger.carried_over_eth,
            },
            node_rewards,
        })
    }

    pub fn file_name(&self, compressed: bool) -> String {
        rewards_file_name(&self.network, self.index, compressed)
    }

    pub fn node_amounts(&self) -> BTreeMap<Address, NodeRewards> {
        self.node_rewards.iter().map(|(address, entry)| (*address, entry.rewards())).collect()
    }

    pub fn encode(&self, compress: bool) -> Result<Vec<u8>, RewardsError> {
        encode(self, compress)
    }

    /// Parse a rewards file, gzip compressed or not.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RewardsError> {
        decode(bytes)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RewardsError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Write the file into `dir` under its canonical name and return the path.
    pub fn write(&self, dir: impl AsRef<Path>, compress: bool) -> Result<PathBuf, RewardsError> {
        let path = dir.as_ref().join(self.file_name(compress));
        write_atomic(&path, &self.encode(compress)?)?;
        Ok(path)
    }

    /// Rebuild the tree from the node amounts and check it against the recorded root and
    /// every recorded proof.
    pub fn verify_self(&self) -> Result<(), RewardsError> {
        let tree = MerkleTree::build(self.index, &self.node_amounts(), self.leaf_encoding);
        if tree.root() != self.merkle_root {
            return Err(RewardsError::FileIntegrity(format!(
                "rewards file {} records root {} but its entries give {}",
                self.index,
                self.merkle_root,
                tree.root()
            )));
        }
        for (address, entry) in &self.node_rewards {
            let leaf = RewardLeaf::new(*address, self.index, &entry.rewards());
            if !verify(&entry.merkle_proof, &self.merkle_root, &leaf.hash(self.leaf_encoding)) {
                return Err(RewardsError::FileIntegrity(format!(
                    "proof for node {address} does not verify against {}",
                    self.merkle_root
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinipoolPerformance {
    pub node_address: Address,
    pub pubkey: Pubkey,
    pub successful_attestations: u64,
    pub missed_attestations: u64,
    pub excused_epochs: u64,
    pub disqualified_epochs: u64,
    pub missing_attestation_slots: Vec<u64>,
    pub attendance_weight: u64,
    #[serde(with = "crate::serde_decimal")]
    pub eth_earned: U256,
    #[serde(with = "crate::serde_decimal")]
    pub node_eth_earned: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinipoolPerformanceFile {
    pub rewards_file_version: u64,
    pub network: String,
    pub index: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub consensus_end_block: u64,
    pub execution_end_block: u64,
    pub minipool_performance: BTreeMap<Address, MinipoolPerformance>,
}

impl MinipoolPerformanceFile {
    pub fn new(
        network: &str,
        interval: &Interval,
        state: &NetworkState,
        smoothing: &SmoothingPoolResult,
        duties: Option<&DutyReport>,
    ) -> Result<Self, RewardsError> {
        let mut minipool_performance = BTreeMap::new();
        for (address, share) in &smoothing.minipools {
            let Some(minipool) = state.minipool(address) else {
                continue;
            };
            let missing_attestation_slots = state
                .validator(&minipool.pubkey)
                .and_then(|v| duties?.duties(v.index))
                .map(|d| d.missed_attestation_slots.iter().copied().collect())
                .unwrap_or_default();
            minipool_performance.insert(
                *address,
                MinipoolPerformance {
                    node_address: share.node,
                    pubkey: minipool.pubkey,
                    successful_attestations: share.successful_epochs,
                    missed_attestations: share.missed_epochs,
                    excused_epochs: share.excused_epochs,
                    disqualified_epochs: share.disqualified_epochs,
                    missing_attestation_slots,
                    attendance_weight: share.attendance_weight,
                    eth_earned: share.share_eth,
                    node_eth_earned: share.node_eth,
                },
            );
        }

        Ok(Self {
            rewards_file_version: REWARDS_FILE_VERSION,
            network: network.to_string(),
            index: interval.index,
            start_time: timestamp(interval.start_time)?,
            end_time: timestamp(interval.end_time)?,
            consensus_end_block: interval.consensus_end_block,
            execution_end_block: interval.execution_end_block,
            minipool_performance,
        })
    }

    pub fn file_name(&self, compressed: bool) -> String {
        performance_file_name(&self.network, self.index, compressed)
    }

    pub fn encode(&self, compress: bool) -> Result<Vec<u8>, RewardsError> {
        encode(self, compress)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RewardsError> {
        decode(bytes)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RewardsError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn write(&self, dir: impl AsRef<Path>, compress: bool) -> Result<PathBuf, RewardsError> {
        let path = dir.as_ref().join(self.file_name(compress));
        write_atomic(&path, &self.encode(compress)?)?;
        Ok(path)
    }
}
