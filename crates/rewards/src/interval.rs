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

//! Beacon chain clock and rewards interval boundaries.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::RewardsError;

/// Sentinel exit epoch for validators that have not exited.
pub const FAR_FUTURE_EPOCH: u64 = u64::MAX;

/// Genesis time and slot geometry of the consensus layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconConfig {
    pub genesis_time: u64,
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
}

impl BeaconConfig {
    pub fn seconds_per_epoch(&self) -> u64 {
        self.seconds_per_slot * self.slots_per_epoch
    }

    pub fn slot_time(&self, slot: u64) -> u64 {
        self.genesis_time + slot * self.seconds_per_slot
    }

    pub fn epoch_of_slot(&self, slot: u64) -> u64 {
        slot / self.slots_per_epoch
    }

    pub fn first_slot(&self, epoch: u64) -> u64 {
        epoch * self.slots_per_epoch
    }

    pub fn last_slot(&self, epoch: u64) -> u64 {
        self.first_slot(epoch) + self.slots_per_epoch - 1
    }

    pub fn epoch_start_time(&self, epoch: u64) -> u64 {
        self.slot_time(self.first_slot(epoch))
    }

    /// The epoch containing the given wall-clock second. Times before genesis map to epoch 0.
    pub fn epoch_at(&self, timestamp: u64) -> u64 {
        timestamp.saturating_sub(self.genesis_time) / self.seconds_per_epoch()
    }

    pub(crate) fn validate(&self) -> Result<(), RewardsError> {
        if self.seconds_per_slot == 0 || self.slots_per_epoch == 0 {
            return Err(RewardsError::InvalidSnapshot(format!(
                "beacon config has zero slot geometry: {self:?}"
            )));
        }
        Ok(())
    }
}

/// Half-open epoch range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochWindow {
    pub start: u64,
    pub end: u64,
}

impl EpochWindow {
    pub const EMPTY: EpochWindow = EpochWindow { start: 0, end: 0 };

    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, epoch: u64) -> bool {
        self.start <= epoch && epoch < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &EpochWindow) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }
}

/// Where the network state snapshot for an interval was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnd {
    pub index: u64,
    /// Last consensus slot of the interval.
    pub consensus_block: u64,
    /// Execution block paired with `consensus_block`.
    pub execution_block: u64,
    pub intervals_passed: u64,
}

/// A closed rewards interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interval {
    pub index: u64,
    pub start_epoch: u64,
    pub end_epoch: u64,
    pub consensus_start_block: u64,
    pub consensus_end_block: u64,
    pub execution_start_block: u64,
    pub execution_end_block: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub intervals_passed: u64,
}

impl Interval {
    /// Build an interval from its consensus slot bounds.
    pub fn from_slots(
        beacon: &BeaconConfig,
        end: &SnapshotEnd,
        consensus_start_block: u64,
        execution_start_block: u64,
    ) -> Result<Self, RewardsError> {
        if consensus_start_block > end.consensus_block {
            return Err(RewardsError::InvalidSnapshot(format!(
                "interval {} starts at slot {} after its end slot {}",
                end.index, consensus_start_block, end.consensus_block
            )));
        }
        if execution_start_block > end.execution_block {
            return Err(RewardsError::InvalidSnapshot(format!(
                "interval {} starts at execution block {} after its end block {}",
                end.index, execution_start_block, end.execution_block
            )));
        }
        Ok(Self {
            index: end.index,
            start_epoch: beacon.epoch_of_slot(consensus_start_block),
            end_epoch: beacon.epoch_of_slot(end.consensus_block),
            consensus_start_block,
            consensus_end_block: end.consensus_block,
            execution_start_block,
            execution_end_block: end.execution_block,
            start_time: beacon.slot_time(consensus_start_block),
            end_time: beacon.slot_time(end.consensus_block),
            intervals_passed: end.intervals_passed,
        })
    }

    pub fn epochs(&self) -> RangeInclusive<u64> {
        self.start_epoch..=self.end_epoch
    }

    pub fn epoch_count(&self) -> u64 {
        self.end_epoch - self.start_epoch + 1
    }

    pub fn window(&self) -> EpochWindow {
        EpochWindow::new(self.start_epoch, self.end_epoch.saturating_add(1))
    }

    pub fn duration(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEACON: BeaconConfig =
        BeaconConfig { genesis_time: 1_577_836_800, seconds_per_slot: 12, slots_per_epoch: 32 };

    #[test]
    fn epoch_at_boundaries() {
        let start = BEACON.epoch_start_time(150);
        assert_eq!(BEACON.epoch_at(start), 150);
        assert_eq!(BEACON.epoch_at(start - 1), 149);
        assert_eq!(BEACON.epoch_at(start + 1), 150);
        assert_eq!(BEACON.epoch_at(0), 0);
    }

    #[test]
    fn interval_from_slots() {
        let end = SnapshotEnd {
            index: 3,
            consensus_block: BEACON.last_slot(199),
            execution_block: 100_200,
            intervals_passed: 1,
        };
        let interval = Interval::from_slots(&BEACON, &end, BEACON.first_slot(100), 100_100).unwrap();
        assert_eq!(interval.epochs(), 100..=199);
        assert_eq!(interval.epoch_count(), 100);
        assert_eq!(interval.start_time, BEACON.epoch_start_time(100));
        assert_eq!(interval.duration(), 100 * 384 - 12);
    }

    #[test]
    fn inverted_interval_rejected() {
        let end = SnapshotEnd { index: 3, consensus_block: 10, execution_block: 5, intervals_passed: 1 };
        assert!(Interval::from_slots(&BEACON, &end, 11, 0).is_err());
        assert!(Interval::from_slots(&BEACON, &end, 0, 6).is_err());
    }
}
