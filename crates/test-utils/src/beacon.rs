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

//! In-memory beacon chain.
//!
//! Every tracked validator attests once per epoch, in the slot matching its index modulo the
//! epoch length, and its attestation is included by the next block that exists. Blocks are
//! proposed by validators outside the tracked set unless a proposal is assigned explicitly.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use async_trait::async_trait;
use rpl_rewards::{
    beacon::{Attestation, Bits, Committee, ProposerDuty},
    BeaconBlock, BeaconConfig, BeaconSource, RewardsError,
};

use crate::MockHistory;

/// Index space of the untracked validators that propose by default.
const PROPOSER_BASE: u64 = 10_000_000;

#[derive(Debug)]
pub struct MockBeacon {
    beacon: BeaconConfig,
    block_offset: u64,
    validators: BTreeSet<u64>,
    missed_attestations: BTreeMap<u64, BTreeSet<u64>>,
    missing_blocks: BTreeSet<u64>,
    proposers: BTreeMap<u64, u64>,
    sync_committee: Vec<u64>,
    sync_failures: BTreeSet<(u64, u64)>,
    failures_remaining: AtomicU32,
    unavailable: AtomicBool,
    outage_from_epoch: Option<u64>,
    calls: AtomicU64,
}

impl MockBeacon {
    pub fn new(beacon: BeaconConfig, validators: impl IntoIterator<Item = u64>) -> Self {
        Self {
            beacon,
            block_offset: 0,
            validators: validators.into_iter().collect(),
            missed_attestations: BTreeMap::new(),
            missing_blocks: BTreeSet::new(),
            proposers: BTreeMap::new(),
            sync_committee: vec![],
            sync_failures: BTreeSet::new(),
            failures_remaining: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            outage_from_epoch: None,
            calls: AtomicU64::new(0),
        }
    }

    /// A chain on which every minipool validator of `history` performs every duty.
    pub fn for_history(history: &MockHistory) -> Self {
        Self {
            block_offset: history.block_offset,
            ..Self::new(history.beacon, history.validator_indices())
        }
    }

    /// The validator produces no attestation during `epoch`.
    pub fn with_missed_attestation(mut self, validator: u64, epoch: u64) -> Self {
        self.missed_attestations.entry(validator).or_default().insert(epoch);
        self
    }

    pub fn with_missed_attestations(
        mut self,
        validator: u64,
        epochs: impl IntoIterator<Item = u64>,
    ) -> Self {
        self.missed_attestations.entry(validator).or_default().extend(epochs);
        self
    }

    /// No block is produced at `slot`.
    pub fn with_missing_block(mut self, slot: u64) -> Self {
        self.missing_blocks.insert(slot);
        self
    }

    /// Assign the proposal of `slot` to `validator`.
    pub fn with_proposal(mut self, slot: u64, validator: u64) -> Self {
        self.proposers.insert(slot, validator);
        self
    }

    pub fn with_sync_committee(mut self, members: impl IntoIterator<Item = u64>) -> Self {
        self.sync_committee = members.into_iter().collect();
        self
    }

    /// The sync committee member leaves its participation bit unset at `slot`.
    pub fn with_sync_failure(mut self, validator: u64, slot: u64) -> Self {
        self.sync_failures.insert((validator, slot));
        self
    }

    /// Fail the next `count` requests with a transient error.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every request.
    pub fn unavailable(self) -> Self {
        self.unavailable.store(true, Ordering::SeqCst);
        self
    }

    /// Refuse every request about `epoch` or later, as if the node fell over mid replay.
    pub fn with_outage_from(mut self, epoch: u64) -> Self {
        self.outage_from_epoch = Some(epoch);
        self
    }

    /// Number of requests served or refused so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn request(&self, what: &str, at: u64, epoch: u64) -> Result<(), RewardsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let flaky = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let down = self.outage_from_epoch.is_some_and(|from| epoch >= from);
        if flaky || down || self.unavailable.load(Ordering::SeqCst) {
            tracing::debug!("Mock beacon refusing {what} for {at}");
            return Err(RewardsError::DataUnavailable(format!(
                "mock beacon: {what} {at} unavailable"
            )));
        }
        Ok(())
    }

    fn committee_at(&self, slot: u64) -> Vec<u64> {
        let offset = slot % self.beacon.slots_per_epoch;
        self.validators
            .iter()
            .copied()
            .filter(|v| v % self.beacon.slots_per_epoch == offset)
            .collect()
    }

    fn proposer(&self, slot: u64) -> u64 {
        self.proposers.get(&slot).copied().unwrap_or(PROPOSER_BASE + slot)
    }

    /// First slot after `slot` that has a block.
    fn including_slot(&self, slot: u64) -> u64 {
        (slot + 1..).find(|s| !self.missing_blocks.contains(s)).unwrap_or(u64::MAX)
    }

    fn attested(&self, validator: u64, slot: u64) -> bool {
        let epoch = self.beacon.epoch_of_slot(slot);
        !self.missed_attestations.get(&validator).is_some_and(|epochs| epochs.contains(&epoch))
    }
}

impl MockBeacon {
    pub(crate) fn committees_of(&self, epoch: u64) -> Result<Vec<Committee>, RewardsError> {
        self.request("committees", epoch, epoch)?;
        Ok((self.beacon.first_slot(epoch)..=self.beacon.last_slot(epoch))
            .map(|slot| Committee { slot, index: 0, validators: self.committee_at(slot) })
            .filter(|committee| !committee.validators.is_empty())
            .collect())
    }

    pub(crate) fn proposers_of(&self, epoch: u64) -> Result<Vec<ProposerDuty>, RewardsError> {
        self.request("proposer duties", epoch, epoch)?;
        Ok((self.beacon.first_slot(epoch)..=self.beacon.last_slot(epoch))
            .map(|slot| ProposerDuty { slot, validator_index: self.proposer(slot) })
            .collect())
    }

    pub(crate) fn sync_committee_of(&self, epoch: u64) -> Result<Vec<u64>, RewardsError> {
        self.request("sync committee", epoch, epoch)?;
        Ok(self.sync_committee.clone())
    }

    pub(crate) fn block_at(&self, slot: u64) -> Result<Option<BeaconBlock>, RewardsError> {
        self.request("block", slot, self.beacon.epoch_of_slot(slot))?;
        if self.missing_blocks.contains(&slot) {
            return Ok(None);
        }

        let earliest = slot.saturating_sub(self.beacon.slots_per_epoch);
        let attestations = (earliest..slot)
            .filter(|s| self.including_slot(*s) == slot)
            .filter_map(|s| {
                let committee = self.committee_at(s);
                if committee.is_empty() {
                    return None;
                }
                let bits: Vec<bool> = committee.iter().map(|v| self.attested(*v, s)).collect();
                Some(Attestation {
                    slot: s,
                    committee_index: 0,
                    committee_bits: None,
                    aggregation_bits: Bits::from_bools(&bits),
                })
            })
            .collect();

        let sync_committee_bits = (!self.sync_committee.is_empty()).then(|| {
            let bits: Vec<bool> = self
                .sync_committee
                .iter()
                .map(|v| !self.sync_failures.contains(&(*v, slot)))
                .collect();
            Bits::from_bools(&bits)
        });

        Ok(Some(BeaconBlock {
            slot,
            proposer_index: self.proposer(slot),
            execution_block_number: Some(slot + self.block_offset),
            attestations,
            sync_committee_bits,
        }))
    }
}

#[async_trait]
impl BeaconSource for MockBeacon {
    async fn committees(&self, epoch: u64) -> Result<Vec<Committee>, RewardsError> {
        self.committees_of(epoch)
    }

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>, RewardsError> {
        self.proposers_of(epoch)
    }

    async fn sync_committee(&self, epoch: u64) -> Result<Vec<u64>, RewardsError> {
        self.sync_committee_of(epoch)
    }

    async fn block(&self, slot: u64) -> Result<Option<BeaconBlock>, RewardsError> {
        self.block_at(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon() -> BeaconConfig {
        BeaconConfig { genesis_time: 0, seconds_per_slot: 12, slots_per_epoch: 32 }
    }

    #[tokio::test]
    async fn attestation_included_by_next_present_block() {
        let mock = MockBeacon::new(beacon(), [5, 37])
            .with_missing_block(6)
            .with_missed_attestation(37, 0);

        assert!(mock.block(6).await.unwrap().is_none());
        // Slot 6 has no committee, so only slot 5 is carried.
        let block = mock.block(7).await.unwrap().unwrap();
        let included: Vec<u64> = block.attestations.iter().map(|a| a.slot).collect();
        assert_eq!(included, vec![5]);
        let bits = &block.attestations[0].aggregation_bits;
        assert!(bits.get(0));
        assert!(!bits.get(1));
    }

    #[tokio::test]
    async fn transient_failures_run_out() {
        let mock = MockBeacon::new(beacon(), [1]).failing_first(2);
        assert!(mock.committees(0).await.is_err());
        assert!(mock.committees(0).await.is_err());
        assert_eq!(mock.committees(0).await.unwrap().len(), 1);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn outage_covers_later_epochs_only() {
        let mock = MockBeacon::new(beacon(), [1]).with_outage_from(3);
        assert!(mock.committees(2).await.is_ok());
        assert!(mock.block(beacon().last_slot(2)).await.is_ok());
        assert!(mock.committees(3).await.is_err());
        assert!(mock.block(beacon().first_slot(3)).await.is_err());
    }
}
