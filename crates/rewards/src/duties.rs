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

//! Per validator-epoch duty verdicts.
//!
//! The [DutyTracker] consumes [EpochRecord]s in epoch order. Attestation duties stay pending
//! until they are seen in a block no more than one epoch after their slot, or until that
//! window closes. Proposal and sync committee duties are critical: failing one disqualifies
//! the validator for the enclosing epoch only.
//!
//! An epoch is settled as soon as its inclusion window closes, so the tracker only holds the
//! duties of the two most recent epochs plus a run-length history per validator. The whole
//! tracker is serializable and can be checkpointed between epochs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    beacon::EpochRecord,
    interval::{BeaconConfig, Interval},
    state::{NetworkState, ValidatorRecord},
    RewardsError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DutyVerdict {
    Fulfilled,
    Missed,
    /// A critical duty was missed during the epoch.
    Disqualified,
    /// The validator was not active during the epoch.
    Excused,
}

/// Epochs known to be missed per validator index, supplied by the operator.
pub type DutyOverrides = BTreeMap<u64, BTreeSet<u64>>;

/// Consecutive epochs sharing a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerdictRun {
    first_epoch: u64,
    epochs: u64,
    verdict: DutyVerdict,
}

impl VerdictRun {
    fn end(&self) -> u64 {
        self.first_epoch + self.epochs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorDuties {
    runs: Vec<VerdictRun>,
    pub missed_attestation_slots: BTreeSet<u64>,
    pub critical_failure_slots: BTreeSet<u64>,
}

impl ValidatorDuties {
    /// Record the verdict of the epoch following the last recorded one.
    fn push(&mut self, epoch: u64, verdict: DutyVerdict) {
        match self.runs.last_mut() {
            Some(run) if run.verdict == verdict && run.end() == epoch => run.epochs += 1,
            _ => self.runs.push(VerdictRun { first_epoch: epoch, epochs: 1, verdict }),
        }
    }

    /// Epochs that were never settled are excused.
    pub fn verdict(&self, epoch: u64) -> DutyVerdict {
        let at = self.runs.partition_point(|run| run.end() <= epoch);
        self.runs
            .get(at)
            .filter(|run| run.first_epoch <= epoch)
            .map_or(DutyVerdict::Excused, |run| run.verdict)
    }

    pub fn count(&self, verdict: DutyVerdict) -> u64 {
        self.runs.iter().filter(|run| run.verdict == verdict).map(|run| run.epochs).sum()
    }

    pub fn verdicts(&self) -> impl Iterator<Item = (u64, DutyVerdict)> + '_ {
        self.runs
            .iter()
            .flat_map(|run| (run.first_epoch..run.end()).map(move |epoch| (epoch, run.verdict)))
    }
}

/// Verdicts for every tracked validator over an interval.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DutyReport {
    validators: BTreeMap<u64, ValidatorDuties>,
}

impl DutyReport {
    /// Assemble a report from verdicts already known, one per epoch from `start_epoch`.
    pub fn from_verdicts(start_epoch: u64, verdicts: BTreeMap<u64, Vec<DutyVerdict>>) -> Self {
        let validators = verdicts
            .into_iter()
            .map(|(index, verdicts)| {
                let mut duties = ValidatorDuties::default();
                for (epoch, verdict) in (start_epoch..).zip(verdicts) {
                    duties.push(epoch, verdict);
                }
                (index, duties)
            })
            .collect();
        Self { validators }
    }

    pub fn duties(&self, validator_index: u64) -> Option<&ValidatorDuties> {
        self.validators.get(&validator_index)
    }

    /// Untracked validators have no duties and are excused.
    pub fn verdict(&self, validator_index: u64, epoch: u64) -> DutyVerdict {
        self.duties(validator_index).map_or(DutyVerdict::Excused, |d| d.verdict(epoch))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Activity {
    activation_epoch: u64,
    exit_epoch: u64,
}

impl Activity {
    fn is_active_at(&self, epoch: u64) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }
}

/// Attestation duties of one committee still waiting for inclusion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingCommittee {
    /// Size of the whole committee, tracked or not. Aggregates spanning several committees
    /// concatenate their bits, so this locates the next committee's bits.
    size: usize,
    /// (aggregation bit position, validator index)
    members: Vec<(usize, u64)>,
}

/// slot -> committee index -> pending duties
type PendingAttestations = BTreeMap<u64, BTreeMap<u64, PendingCommittee>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DutyTracker {
    beacon: BeaconConfig,
    start_epoch: u64,
    end_epoch: u64,
    next_epoch: u64,
    tracked: BTreeMap<u64, Activity>,
    overrides: DutyOverrides,
    pending: PendingAttestations,
    /// Open epoch -> validators given an attestation duty.
    assigned: BTreeMap<u64, BTreeSet<u64>>,
    /// Open epoch -> validators whose attestation was included.
    attested: BTreeMap<u64, BTreeSet<u64>>,
    duties: BTreeMap<u64, ValidatorDuties>,
}

impl DutyTracker {
    pub fn new<'a>(
        beacon: BeaconConfig,
        interval: &Interval,
        validators: impl IntoIterator<Item = &'a ValidatorRecord>,
        mut overrides: DutyOverrides,
    ) -> Self {
        let tracked: BTreeMap<u64, Activity> = validators
            .into_iter()
            .map(|v| {
                (v.index, Activity { activation_epoch: v.activation_epoch, exit_epoch: v.exit_epoch })
            })
            .collect();
        overrides.retain(|index, epochs| {
            epochs.retain(|epoch| interval.epochs().contains(epoch));
            tracked.contains_key(index) && !epochs.is_empty()
        });
        let duties = tracked.keys().map(|&index| (index, ValidatorDuties::default())).collect();
        Self {
            beacon,
            start_epoch: interval.start_epoch,
            end_epoch: interval.end_epoch,
            next_epoch: interval.start_epoch,
            tracked,
            overrides,
            pending: BTreeMap::new(),
            assigned: BTreeMap::new(),
            attested: BTreeMap::new(),
            duties,
        }
    }

    /// Track the validators whose duties decide smoothing pool weight in `interval`.
    pub fn for_state(state: &NetworkState, interval: &Interval, overrides: DutyOverrides) -> Self {
        Self::new(*state.beacon(), interval, state.tracked_validators(interval), overrides)
    }

    /// The next epoch [DutyTracker::ingest] expects.
    pub fn next_epoch(&self) -> u64 {
        self.next_epoch
    }

    pub fn is_tracking(&self, interval: &Interval) -> bool {
        self.start_epoch == interval.start_epoch && self.end_epoch == interval.end_epoch
    }

    fn active(&self, validator_index: u64, epoch: u64) -> bool {
        self.tracked.get(&validator_index).is_some_and(|a| a.is_active_at(epoch))
    }

    fn critical_failure(&mut self, validator_index: u64, slot: u64) {
        if let Some(duties) = self.duties.get_mut(&validator_index) {
            duties.critical_failure_slots.insert(slot);
        }
    }

    pub fn ingest(&mut self, record: EpochRecord) -> Result<(), RewardsError> {
        if record.epoch != self.next_epoch {
            return Err(RewardsError::DataUnavailable(format!(
                "epoch {} replayed out of order, expected {}",
                record.epoch, self.next_epoch
            )));
        }
        let epoch = record.epoch;

        if record.assigns_duties {
            for committee in &record.committees {
                let members: Vec<(usize, u64)> = committee
                    .validators
                    .iter()
                    .enumerate()
                    .filter(|(_, validator)| self.active(**validator, epoch))
                    .map(|(position, validator)| (position, *validator))
                    .collect();
                if !members.is_empty() {
                    self.assigned
                        .entry(epoch)
                        .or_default()
                        .extend(members.iter().map(|(_, validator)| *validator));
                }
                let pending = PendingCommittee { size: committee.validators.len(), members };
                self.pending.entry(committee.slot).or_default().insert(committee.index, pending);
            }

            for duty in &record.proposers {
                if !self.active(duty.validator_index, epoch) {
                    continue;
                }
                let proposed = record
                    .slots
                    .iter()
                    .find(|s| s.slot == duty.slot)
                    .and_then(|s| s.block.as_ref())
                    .is_some_and(|block| block.proposer_index == duty.validator_index);
                if !proposed {
                    tracing::debug!(
                        "Validator {} missed its proposal at slot {}",
                        duty.validator_index,
                        duty.slot
                    );
                    self.critical_failure(duty.validator_index, duty.slot);
                }
            }

            for (position, &validator) in record.sync_committee.iter().enumerate() {
                if !self.active(validator, epoch) {
                    continue;
                }
                // Empty slots are the proposer's failure, not the sync committee's.
                for slot in &record.slots {
                    let Some(bits) = slot.block.as_ref().and_then(|b| b.sync_committee_bits.as_ref())
                    else {
                        continue;
                    };
                    if !bits.get(position) {
                        self.critical_failure(validator, slot.slot);
                    }
                }
            }
        }

        for block in record.slots.iter().filter_map(|s| s.block.as_ref()) {
            for attestation in &block.attestations {
                if attestation.slot >= block.slot
                    || block.slot - attestation.slot > self.beacon.slots_per_epoch
                {
                    continue;
                }
                let Some(committees) = self.pending.get_mut(&attestation.slot) else {
                    continue;
                };
                let attested =
                    self.attested.entry(self.beacon.epoch_of_slot(attestation.slot)).or_default();
                let mut offset = 0;
                for index in attestation.committees() {
                    // Without the size of an unknown committee the bits after it cannot be
                    // placed.
                    let Some(committee) = committees.get_mut(&index) else {
                        break;
                    };
                    committee.members.retain(|(position, validator)| {
                        if attestation.aggregation_bits.get(offset + *position) {
                            attested.insert(*validator);
                            false
                        } else {
                            true
                        }
                    });
                    offset += committee.size;
                }
            }
        }

        // Duties from before this epoch can no longer be included and are missed.
        let still_open = self.pending.split_off(&self.beacon.first_slot(epoch));
        let expired = std::mem::replace(&mut self.pending, still_open);
        self.expire(expired);

        if epoch > self.start_epoch && epoch <= self.end_epoch + 1 {
            self.settle(epoch - 1);
        }
        self.next_epoch += 1;
        Ok(())
    }

    fn expire(&mut self, expired: PendingAttestations) {
        for (slot, committees) in expired {
            for (_, validator) in committees.into_values().flat_map(|c| c.members) {
                if let Some(duties) = self.duties.get_mut(&validator) {
                    duties.missed_attestation_slots.insert(slot);
                }
            }
        }
    }

    /// Decide the verdict of every tracked validator for `epoch`, whose inclusion window has
    /// closed, and forget its attestation bookkeeping.
    fn settle(&mut self, epoch: u64) {
        let assigned = self.assigned.remove(&epoch).unwrap_or_default();
        let attested = self.attested.remove(&epoch).unwrap_or_default();
        let slots = self.beacon.first_slot(epoch)..=self.beacon.last_slot(epoch);
        for (index, activity) in &self.tracked {
            let Some(duties) = self.duties.get_mut(index) else {
                continue;
            };
            let verdict = if !activity.is_active_at(epoch) {
                DutyVerdict::Excused
            } else if duties.critical_failure_slots.range(slots.clone()).next().is_some() {
                DutyVerdict::Disqualified
            } else if self.overrides.get(index).is_some_and(|epochs| epochs.contains(&epoch)) {
                DutyVerdict::Missed
            } else if assigned.contains(index) && attested.contains(index) {
                DutyVerdict::Fulfilled
            } else {
                // No assignment means the committee data never showed this validator, which
                // counts as unknown.
                DutyVerdict::Missed
            };
            duties.push(epoch, verdict);
        }
    }

    /// Produce the verdicts. Fails unless every epoch of the interval, plus the one after it,
    /// has been ingested.
    pub fn finish(mut self) -> Result<DutyReport, RewardsError> {
        if self.next_epoch != self.end_epoch + 2 {
            return Err(RewardsError::DataUnavailable(format!(
                "duty replay stopped at epoch {}, interval ends at {}",
                self.next_epoch, self.end_epoch
            )));
        }
        let leftover = std::mem::take(&mut self.pending);
        self.expire(leftover);
        Ok(DutyReport { validators: self.duties })
    }

    #[cfg(test)]
    fn open_epochs(&self) -> usize {
        self.assigned.len().max(self.attested.len())
    }
}
