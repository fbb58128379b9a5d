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

//! Replay of consensus layer duties over a rewards interval.
//!
//! [BeaconStateReplayer] pulls committee assignments, proposer and sync committee duties and
//! the blocks of every slot from a [BeaconSource]. Epochs are fetched concurrently in bounded
//! chunks but always handed to the consumer in ascending order, so downstream accounting sees
//! the same sequence no matter how the fetches interleave.

pub mod http;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::try_join_all;

use crate::{
    config::EngineConfig,
    events::RewardsEvent,
    interval::{BeaconConfig, Interval, SnapshotEnd},
    RewardsError,
};

/// Validators assigned to attest in one committee of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
    pub slot: u64,
    pub index: u64,
    /// Validator indices, in aggregation bit order.
    pub validators: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposerDuty {
    pub slot: u64,
    pub validator_index: u64,
}

/// Fixed or variable length bit field as used by attestations and sync aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bits {
    bytes: Vec<u8>,
    len: usize,
}

impl Bits {
    /// Decode an SSZ bitlist, whose highest set bit marks its length.
    pub fn from_ssz_bitlist(bytes: &[u8]) -> Result<Self, RewardsError> {
        let last = bytes.last().copied().unwrap_or(0);
        if last == 0 {
            return Err(RewardsError::DataUnavailable(
                "malformed bitlist without length delimiter".into(),
            ));
        }
        let len = (bytes.len() - 1) * 8 + (7 - last.leading_zeros() as usize);
        Ok(Self { bytes: bytes.to_vec(), len })
    }

    /// Decode an SSZ bitvector; every bit is significant.
    pub fn from_bitvector(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec(), len: bytes.len() * 8 }
    }

    pub fn from_bools(bits: &[bool]) -> Self {
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (i, _) in bits.iter().enumerate().filter(|(_, set)| **set) {
            bytes[i / 8] |= 1 << (i % 8);
        }
        Self { bytes, len: bits.len() }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.bytes[i / 8] & (1 << (i % 8)) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub slot: u64,
    /// Committee of a single committee attestation. Unused once `committee_bits` is set.
    pub committee_index: u64,
    /// Committees covered by an aggregate spanning several of them.
    pub committee_bits: Option<Bits>,
    pub aggregation_bits: Bits,
}

impl Attestation {
    /// Committees whose members' bits follow each other in `aggregation_bits`, in order.
    pub fn committees(&self) -> Vec<u64> {
        match &self.committee_bits {
            Some(bits) => (0..bits.len()).filter(|i| bits.get(*i)).map(|i| i as u64).collect(),
            None => vec![self.committee_index],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconBlock {
    pub slot: u64,
    pub proposer_index: u64,
    /// Number of the execution payload, absent before the merge.
    pub execution_block_number: Option<u64>,
    pub attestations: Vec<Attestation>,
    pub sync_committee_bits: Option<Bits>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub slot: u64,
    /// `None` when no block was produced for the slot.
    pub block: Option<BeaconBlock>,
}

/// Everything replayed for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    pub epoch: u64,
    /// Whether duties were assigned from this epoch. The epoch after the interval is only
    /// replayed for its late attestation inclusions.
    pub assigns_duties: bool,
    pub committees: Vec<Committee>,
    pub proposers: Vec<ProposerDuty>,
    /// Sync committee members in participation bit order.
    pub sync_committee: Vec<u64>,
    pub slots: Vec<SlotRecord>,
}

/// Read-only access to a consensus layer client.
///
/// Transport failures must be reported as [RewardsError::DataUnavailable]; an empty slot is
/// `Ok(None)`, not an error.
#[async_trait]
pub trait BeaconSource: Send + Sync {
    async fn committees(&self, epoch: u64) -> Result<Vec<Committee>, RewardsError>;

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, RewardsError>;

    async fn sync_committee(&self, epoch: u64) -> Result<Vec<u64>, RewardsError>;

    async fn block(&self, slot: u64) -> Result<Option<BeaconBlock>, RewardsError>;
}

#[async_trait]
impl<T: BeaconSource + ?Sized> BeaconSource for Arc<T> {
    async fn committees(&self, epoch: u64) -> Result<Vec<Committee>, RewardsError> {
        (**self).committees(epoch).await
    }

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, RewardsError> {
        (**self).proposer_duties(epoch).await
    }

    async fn sync_committee(&self, epoch: u64) -> Result<Vec<u64>, RewardsError> {
        (**self).sync_committee(epoch).await
    }

    async fn block(&self, slot: u64) -> Result<Option<BeaconBlock>, RewardsError> {
        (**self).block(slot).await
    }
}

pub struct BeaconStateReplayer<B> {
    source: B,
    worker_count: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl<B: BeaconSource> BeaconStateReplayer<B> {
    pub fn new(source: B, config: &EngineConfig) -> Self {
        Self {
            source,
            worker_count: config.worker_count.max(1),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Replay every epoch of the interval plus the one after it, feeding `sink` in epoch order.
    ///
    /// Any fetch that still fails after retries aborts the replay.
    pub async fn replay<F>(
        &self,
        beacon: &BeaconConfig,
        interval: &Interval,
        sink: F,
    ) -> Result<(), RewardsError>
    where
        F: FnMut(EpochRecord) -> Result<(), RewardsError>,
    {
        self.replay_from(beacon, interval, interval.start_epoch, sink).await
    }

    /// Like [BeaconStateReplayer::replay], skipping the epochs before `first_epoch`.
    pub async fn replay_from<F>(
        &self,
        beacon: &BeaconConfig,
        interval: &Interval,
        first_epoch: u64,
        mut sink: F,
    ) -> Result<(), RewardsError>
    where
        F: FnMut(EpochRecord) -> Result<(), RewardsError>,
    {
        let first_epoch = first_epoch.max(interval.start_epoch);
        let epochs: Vec<u64> = (first_epoch..=interval.end_epoch + 1).collect();
        tracing::info!(
            "Replaying epochs {} to {} of interval {} with {} workers",
            first_epoch,
            interval.end_epoch,
            interval.index,
            self.worker_count
        );

        // Process in chunks to bound concurrent requests against the beacon node
        for chunk in epochs.chunks(self.worker_count) {
            let records = try_join_all(chunk.iter().map(|&epoch| {
                self.fetch_epoch(beacon, epoch, epoch <= interval.end_epoch)
            }))
            .await?;
            for record in records {
                tracing::debug!("Replayed epoch {} ({} slots)", record.epoch, record.slots.len());
                sink(record)?;
            }
        }
        Ok(())
    }

    pub async fn fetch_epoch(
        &self,
        beacon: &BeaconConfig,
        epoch: u64,
        assigns_duties: bool,
    ) -> Result<EpochRecord, RewardsError> {
        let slots = try_join_all((beacon.first_slot(epoch)..=beacon.last_slot(epoch)).map(
            |slot| async move {
                let block =
                    self.with_retries("block", slot, || self.source.block(slot)).await?;
                Ok::<_, RewardsError>(SlotRecord { slot, block })
            },
        ));

        if !assigns_duties {
            return Ok(EpochRecord {
                epoch,
                assigns_duties,
                committees: vec![],
                proposers: vec![],
                sync_committee: vec![],
                slots: slots.await?,
            });
        }

        let (committees, proposers, sync_committee, slots) = tokio::try_join!(
            self.with_retries("committees", epoch, || self.source.committees(epoch)),
            self.with_retries("proposer duties", epoch, || self.source.proposer_duties(epoch)),
            self.with_retries("sync committee", epoch, || self.source.sync_committee(epoch)),
            slots,
        )?;
        Ok(EpochRecord { epoch, assigns_duties, committees, proposers, sync_committee, slots })
    }

    async fn with_retries<T, F, Fut>(
        &self,
        what: &str,
        at: u64,
        mut op: F,
    ) -> Result<T, RewardsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RewardsError>>,
    {
        let mut backoff = self.retry_backoff;
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Fetching {what} for {at} failed (attempt {attempt}/{}): {err}",
                        self.max_retries
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Derive the bounds of the interval closing at `end`.
///
/// The interval starts with the first epoch after the consensus block of the previous
/// interval's on-chain event. Its execution start block is the payload of the first
/// non-empty slot from there on.
pub async fn resolve_interval<B: BeaconSource>(
    replayer: &BeaconStateReplayer<B>,
    beacon: &BeaconConfig,
    previous: Option<&RewardsEvent>,
    end: &SnapshotEnd,
) -> Result<Interval, RewardsError> {
    let start_slot = match previous {
        Some(event) => {
            if event.index + 1 != end.index {
                return Err(RewardsError::InvalidSnapshot(format!(
                    "previous event is for interval {}, expected {}",
                    event.index,
                    end.index.saturating_sub(1)
                )));
            }
            beacon.first_slot(beacon.epoch_of_slot(event.consensus_block) + 1)
        }
        None if end.index == 0 => 0,
        None => {
            return Err(RewardsError::InvalidSnapshot(format!(
                "interval {} needs the previous interval's event",
                end.index
            )))
        }
    };

    for slot in start_slot..=end.consensus_block {
        let block = replayer.with_retries("block", slot, || replayer.source.block(slot)).await?;
        if let Some(number) = block.and_then(|block| block.execution_block_number) {
            tracing::info!("Interval {} starts at slot {start_slot}, execution block {number}", end.index);
            return Interval::from_slots(beacon, end, start_slot, number);
        }
    }
    Err(RewardsError::DataUnavailable(format!(
        "no execution payload between slots {start_slot} and {}",
        end.consensus_block
    )))
}
