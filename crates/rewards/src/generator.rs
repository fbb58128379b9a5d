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

//! End to end generation of an interval's rewards tree.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use alloy::primitives::{utils::format_ether, B256};

use crate::{
    aggregate::aggregate_rewards,
    beacon::{BeaconSource, BeaconStateReplayer},
    checkpoint::{replay_key, CheckpointStore},
    collateral::CollateralCalculator,
    config::EngineConfig,
    duties::{DutyOverrides, DutyReport, DutyTracker},
    files::{MinipoolPerformanceFile, RewardsFile},
    interval::Interval,
    merkle::{LeafEncoding, MerkleTree},
    smoothing::{apportion_smoothing_pool, SmoothingPoolResult},
    state::NetworkState,
    RewardsError,
};

/// Artifacts of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedTree {
    pub rewards_file: RewardsFile,
    pub performance_file: MinipoolPerformanceFile,
    pub root: B256,
}

impl GeneratedTree {
    /// Write both files into `dir`, returning the rewards file path then the performance file
    /// path.
    pub fn write(
        &self,
        dir: impl AsRef<Path>,
        compress: bool,
    ) -> Result<(PathBuf, PathBuf), RewardsError> {
        let rewards = self.rewards_file.write(dir.as_ref(), compress)?;
        let performance = self.performance_file.write(dir.as_ref(), compress)?;
        Ok((rewards, performance))
    }
}

pub struct TreeGenerator<B> {
    replayer: BeaconStateReplayer<B>,
    config: EngineConfig,
}

impl<B: BeaconSource> TreeGenerator<B> {
    pub fn new(source: B, config: EngineConfig) -> Self {
        let replayer = BeaconStateReplayer::new(source, &config);
        Self { replayer, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn replayer(&self) -> &BeaconStateReplayer<B> {
        &self.replayer
    }

    /// Compute the rewards tree of `interval` over the frozen `state`.
    ///
    /// Nothing is returned unless every stage succeeds within the configured timeout.
    pub async fn generate(
        &self,
        interval: &Interval,
        state: Arc<NetworkState>,
        overrides: DutyOverrides,
    ) -> Result<GeneratedTree, RewardsError> {
        match self.config.timeout() {
            Some(limit) => tokio::time::timeout(limit, self.run(interval, state, overrides))
                .await
                .map_err(|_| RewardsError::Timeout(limit))?,
            None => self.run(interval, state, overrides).await,
        }
    }

    fn checkpoints(&self) -> Result<Option<CheckpointStore>, RewardsError> {
        let Some(dir) = &self.config.checkpoint_dir else {
            return Ok(None);
        };
        CheckpointStore::new(dir, &self.config.network, self.config.checkpoint_interval).map(Some)
    }

    async fn replay_duties(
        &self,
        interval: &Interval,
        state: &NetworkState,
        overrides: DutyOverrides,
        checkpoints: Option<&CheckpointStore>,
    ) -> Result<Option<DutyReport>, RewardsError> {
        // The first interval predates the smoothing pool.
        if interval.index == 0 {
            return Ok(None);
        }
        let mut tracker = DutyTracker::for_state(state, interval, overrides);
        let mut key = None;
        if let Some(store) = checkpoints {
            let replay = replay_key(&self.config.network, interval.index, &tracker)?;
            if let Some(resumed) = store.latest(interval, replay)? {
                tracker = resumed;
            }
            key = Some((store, replay));
        }

        let first_epoch = tracker.next_epoch();
        self.replayer
            .replay_from(state.beacon(), interval, first_epoch, |record| {
                let epoch = record.epoch;
                tracker.ingest(record)?;
                if let Some((store, replay)) = key {
                    if store.is_due(interval, epoch) {
                        store.save(interval.index, replay, &tracker)?;
                    }
                }
                Ok(())
            })
            .await?;
        let report = tracker.finish()?;
        tracing::info!("Evaluated duties of {} validators", report.len());
        Ok(Some(report))
    }

    async fn run(
        &self,
        interval: &Interval,
        state: Arc<NetworkState>,
        overrides: DutyOverrides,
    ) -> Result<GeneratedTree, RewardsError> {
        tracing::info!(
            "Generating rewards tree for interval {} (epochs {} to {})",
            interval.index,
            interval.start_epoch,
            interval.end_epoch
        );

        let checkpoints = self.checkpoints()?;
        let (duties, collateral) = tokio::join!(
            self.replay_duties(interval, &state, overrides, checkpoints.as_ref()),
            async {
                CollateralCalculator::new(&state, interval, self.config.collateral_floor)
                    .calculate_all()
            }
        );
        let duties = duties?;
        let collateral = collateral?;

        let smoothing = match &duties {
            Some(report) => {
                apportion_smoothing_pool(&state, interval, report, self.config.eth_split)?
            }
            None => SmoothingPoolResult::undistributed(state.params().smoothing_pool_balance),
        };
        let ledger =
            aggregate_rewards(&state, interval, &collateral, &smoothing, self.config.rpl_dust)?;

        let tree = MerkleTree::build(interval.index, &ledger.nodes, LeafEncoding::V1);
        let rewards_file = RewardsFile::new(&self.config.network, interval, &ledger, &tree)?;
        rewards_file.verify_self()?;
        let performance_file = MinipoolPerformanceFile::new(
            &self.config.network,
            interval,
            &state,
            &smoothing,
            duties.as_ref(),
        )?;

        if let Some(store) = &checkpoints {
            store.clear(interval.index)?;
        }

        tracing::info!(
            "Interval {} root {} over {} nodes: {} RPL to nodes, {} ETH to nodes, {} ETH carried over",
            interval.index,
            tree.root(),
            tree.len(),
            format_ether(ledger.rpl.collateral_rpl + ledger.rpl.oracle_dao_rpl),
            format_ether(ledger.node_eth),
            format_ether(ledger.carried_over_eth)
        );
        Ok(GeneratedTree { root: tree.root(), rewards_file, performance_file })
    }
}
