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

//! Replay checkpoints.
//!
//! A checkpoint is the serialized [DutyTracker] of a replay in progress. Each file starts with
//! the keccak256 hash of its gzipped JSON body so a torn or tampered file is recognized and
//! skipped. Checkpoints are private working state and never published.

use std::path::{Path, PathBuf};

use alloy::primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};

use crate::{
    duties::DutyTracker,
    files::{decode, encode, write_atomic},
    interval::Interval,
    RewardsError,
};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Older checkpoints of an interval beyond this many are deleted.
const CHECKPOINTS_KEPT: usize = 3;

const EXTENSION: &str = "checkpoint";

const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Checkpoint<T> {
    version: u32,
    network: String,
    index: u64,
    replay_key: B256,
    tracker: T,
}

/// Identity of a replay: the interval and everything the tracker was built from.
///
/// A checkpoint only resumes a replay with the same key, so a changed snapshot or overrides
/// start over from the first epoch.
pub fn replay_key(network: &str, index: u64, fresh: &DutyTracker) -> Result<B256, RewardsError> {
    Ok(keccak256(serde_json::to_vec(&(network, index, fresh))?))
}

pub struct CheckpointStore {
    dir: PathBuf,
    network: String,
    every: u64,
}

impl CheckpointStore {
    /// Store checkpoints under `dir`, one every `every` replayed epochs.
    pub fn new(dir: impl AsRef<Path>, network: &str, every: u64) -> Result<Self, RewardsError> {
        if every == 0 {
            return Err(RewardsError::Config("checkpoint_interval must be at least 1".into()));
        }
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self { dir: dir.as_ref().to_path_buf(), network: network.to_string(), every })
    }

    /// Whether the replay should be saved once `epoch` has been ingested.
    pub fn is_due(&self, interval: &Interval, epoch: u64) -> bool {
        epoch < interval.end_epoch && (epoch + 1 - interval.start_epoch) % self.every == 0
    }

    fn path(&self, index: u64, epoch: u64) -> PathBuf {
        self.dir.join(format!("{}-{index}-{epoch}.{EXTENSION}", self.network))
    }

    /// Checkpoint files of interval `index`, newest first.
    fn entries(&self, index: u64) -> Result<Vec<(u64, PathBuf)>, RewardsError> {
        let prefix = format!("{}-{index}-", self.network);
        let mut entries = vec![];
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let epoch = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(&prefix))
                .and_then(|rest| rest.strip_suffix(&format!(".{EXTENSION}")))
                .and_then(|epoch| epoch.parse::<u64>().ok());
            if let Some(epoch) = epoch {
                entries.push((epoch, path));
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries)
    }

    /// Save `tracker` and delete all but the newest checkpoints of the interval.
    pub fn save(
        &self,
        index: u64,
        replay_key: B256,
        tracker: &DutyTracker,
    ) -> Result<PathBuf, RewardsError> {
        let epoch = tracker.next_epoch().saturating_sub(1);
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            network: self.network.clone(),
            index,
            replay_key,
            tracker,
        };
        let body = encode(&checkpoint, true)?;
        let mut bytes = keccak256(&body).to_vec();
        bytes.extend_from_slice(&body);

        let path = self.path(index, epoch);
        write_atomic(&path, &bytes)?;
        tracing::info!("Saved replay checkpoint for interval {index} at epoch {epoch}");

        for (_, stale) in self.entries(index)?.into_iter().skip(CHECKPOINTS_KEPT) {
            std::fs::remove_file(&stale)?;
            tracing::debug!("Removed old checkpoint {}", stale.display());
        }
        Ok(path)
    }

    fn load(&self, path: &Path) -> Result<Checkpoint<DutyTracker>, RewardsError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < CHECKSUM_LEN {
            return Err(RewardsError::FileIntegrity("checkpoint is truncated".into()));
        }
        let (checksum, body) = bytes.split_at(CHECKSUM_LEN);
        if keccak256(body).as_slice() != checksum {
            return Err(RewardsError::FileIntegrity("checkpoint checksum mismatch".into()));
        }
        decode(body)
    }

    /// The newest usable checkpoint of `interval`, skipping any that fail verification.
    pub fn latest(
        &self,
        interval: &Interval,
        replay_key: B256,
    ) -> Result<Option<DutyTracker>, RewardsError> {
        for (epoch, path) in self.entries(interval.index)? {
            let checkpoint = match self.load(&path) {
                Ok(checkpoint) => checkpoint,
                Err(err) => {
                    tracing::warn!("Ignoring checkpoint {}: {err}", path.display());
                    continue;
                }
            };
            if checkpoint.version != CHECKPOINT_VERSION
                || checkpoint.network != self.network
                || checkpoint.index != interval.index
                || checkpoint.replay_key != replay_key
                || !checkpoint.tracker.is_tracking(interval)
            {
                tracing::warn!(
                    "Ignoring checkpoint {}: it belongs to another replay",
                    path.display()
                );
                continue;
            }
            tracing::info!(
                "Resuming interval {} from the checkpoint at epoch {epoch}",
                interval.index
            );
            return Ok(Some(checkpoint.tracker));
        }
        Ok(None)
    }

    /// Delete every checkpoint of interval `index`.
    pub fn clear(&self, index: u64) -> Result<(), RewardsError> {
        for (_, path) in self.entries(index)? {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
