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

//! Merkle commitment over per-node rewards.
//!
//! Leaves are ordered by ascending node address. Internal nodes hash the two children in
//! sorted order, so a proof is just the list of siblings from the leaf up. A node without a
//! sibling at some level is carried up unchanged and contributes nothing to the proof.

use std::collections::BTreeMap;

use alloy::primitives::{keccak256, Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::aggregate::NodeRewards;

/// Byte layout used to hash a reward leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LeafEncoding {
    /// `address (20) || interval index (32) || RPL (32) || ETH (32)`, integers big-endian.
    #[default]
    V1,
}

impl From<LeafEncoding> for u8 {
    fn from(encoding: LeafEncoding) -> u8 {
        match encoding {
            LeafEncoding::V1 => 1,
        }
    }
}

impl TryFrom<u8> for LeafEncoding {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LeafEncoding::V1),
            other => Err(format!("unsupported leaf encoding {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardLeaf {
    pub address: Address,
    pub interval_index: u64,
    pub rpl: U256,
    pub eth: U256,
}

impl RewardLeaf {
    pub fn new(address: Address, interval_index: u64, rewards: &NodeRewards) -> Self {
        Self { address, interval_index, rpl: rewards.total_rpl(), eth: rewards.smoothing_pool_eth }
    }

    pub fn encode(&self, encoding: LeafEncoding) -> Vec<u8> {
        match encoding {
            LeafEncoding::V1 => {
                let mut buf = Vec::with_capacity(20 + 3 * 32);
                buf.extend_from_slice(self.address.as_slice());
                buf.extend_from_slice(&U256::from(self.interval_index).to_be_bytes::<32>());
                buf.extend_from_slice(&self.rpl.to_be_bytes::<32>());
                buf.extend_from_slice(&self.eth.to_be_bytes::<32>());
                buf
            }
        }
    }

    pub fn hash(&self, encoding: LeafEncoding) -> B256 {
        keccak256(self.encode(encoding))
    }
}

pub fn hash_pair(a: &B256, b: &B256) -> B256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_slice());
    buf[32..].copy_from_slice(hi.as_slice());
    keccak256(buf)
}

/// Check that `leaf` is committed to by `root`.
pub fn verify(proof: &[B256], root: &B256, leaf: &B256) -> bool {
    proof.iter().fold(*leaf, |acc, sibling| hash_pair(&acc, sibling)) == *root
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    encoding: LeafEncoding,
    /// `levels[0]` are the leaf hashes; the last level holds the root.
    levels: Vec<Vec<B256>>,
    positions: BTreeMap<Address, usize>,
}

impl MerkleTree {
    /// Build the tree for an interval. Nodes whose amounts are all zero get no leaf.
    pub fn build(
        interval_index: u64,
        rewards: &BTreeMap<Address, NodeRewards>,
        encoding: LeafEncoding,
    ) -> Self {
        let leaves = rewards
            .iter()
            .filter(|(_, r)| !r.is_zero())
            .map(|(address, r)| RewardLeaf::new(*address, interval_index, r))
            .collect();
        Self::from_leaves(leaves, encoding)
    }

    pub fn from_leaves(mut leaves: Vec<RewardLeaf>, encoding: LeafEncoding) -> Self {
        leaves.sort_by_key(|leaf| leaf.address);
        let positions = leaves.iter().enumerate().map(|(i, leaf)| (leaf.address, i)).collect();

        let mut levels = vec![leaves.iter().map(|leaf| leaf.hash(encoding)).collect::<Vec<_>>()];
        while levels.last().is_some_and(|level| level.len() > 1) {
            let next = levels
                .last()
                .map(|level| {
                    level
                        .chunks(2)
                        .map(|pair| match pair {
                            [a, b] => hash_pair(a, b),
                            // Odd one out is carried up as is.
                            _ => pair[0],
                        })
                        .collect()
                })
                .unwrap_or_default();
            levels.push(next);
        }
        Self { encoding, levels, positions }
    }

    /// Zero for an empty tree.
    pub fn root(&self) -> B256 {
        self.levels.last().and_then(|level| level.first()).copied().unwrap_or(B256::ZERO)
    }

    pub fn encoding(&self) -> LeafEncoding {
        self.encoding
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn leaf(&self, address: &Address) -> Option<B256> {
        self.positions.get(address).map(|i| self.levels[0][*i])
    }

    /// Sibling hashes from the leaf of `address` up to the root.
    pub fn proof(&self, address: &Address) -> Option<Vec<B256>> {
        let mut position = *self.positions.get(address)?;
        let mut proof = vec![];
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = position ^ 1;
            if let Some(hash) = level.get(sibling) {
                proof.push(*hash);
            }
            position /= 2;
        }
        Some(proof)
    }
}
