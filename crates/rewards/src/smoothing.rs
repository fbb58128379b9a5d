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

//! Smoothing pool apportionment.
//!
//! Every eligible minipool earns one unit of weight for each epoch in which it attested, was
//! not disqualified, and its node was opted in. The pool balance is split in proportion to
//! weight. A minipool's share is then divided between its node and the pool stakers
//! according to the bond and commission in force during each weighted epoch, so a bond
//! reduction changes the split but never the weight.
//!
//! Shares are rounded down. Whatever rounding leaves behind stays in the pool and is reported
//! as carried over.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::{utils::format_ether, Address, U256};
use serde::Serialize;

use crate::{
    config::EthSplit,
    duties::{DutyReport, DutyVerdict},
    interval::Interval,
    mul_div,
    state::{BondTerms, MinipoolRecord, NetworkState, CHEATER_PENALTY_THRESHOLD},
    RewardsError, ONE_ETH,
};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinipoolShare {
    pub node: Address,
    pub successful_epochs: u64,
    pub missed_epochs: u64,
    pub disqualified_epochs: u64,
    pub excused_epochs: u64,
    /// Epochs that earned weight.
    pub attendance_weight: u64,
    /// Full proportional share of the pool balance.
    #[serde(with = "crate::serde_decimal")]
    pub share_eth: U256,
    /// Part of the share credited to the node.
    #[serde(with = "crate::serde_decimal")]
    pub node_eth: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmoothingPoolResult {
    pub balance: U256,
    pub total_weight: u64,
    /// Eligible minipools, including those that earned nothing.
    pub minipools: BTreeMap<Address, MinipoolShare>,
    /// Nodes with a non-zero ETH amount.
    pub node_eth: BTreeMap<Address, U256>,
    pub user_eth: U256,
    /// Rounding remainder left in the pool for the next interval.
    pub carried_over_eth: U256,
}

impl SmoothingPoolResult {
    /// Nothing distributed; the whole balance stays in the pool.
    pub fn undistributed(balance: U256) -> Self {
        Self { balance, carried_over_eth: balance, ..Default::default() }
    }

    pub fn total_node_eth(&self) -> U256 {
        self.node_eth.values().fold(U256::ZERO, |acc, eth| acc + *eth)
    }
}

/// Weighted epochs of one minipool, grouped by consecutive bond regime.
struct Attendance {
    share: MinipoolShare,
    regimes: Vec<(BondTerms, u64)>,
}

fn attendance(
    state: &NetworkState,
    interval: &Interval,
    duties: &DutyReport,
    minipool: &MinipoolRecord,
) -> Option<Attendance> {
    let beacon = state.beacon();
    let node = state.node(&minipool.node)?;
    let validator = state.validator(&minipool.pubkey)?;
    let window = node.smoothing_pool_window(beacon);
    let status_epoch = beacon.epoch_at(minipool.status_time);

    let mut share = MinipoolShare { node: node.address, ..Default::default() };
    let mut regimes: Vec<(BondTerms, u64)> = vec![];
    let mut eligible = false;
    for epoch in interval.epochs().filter(|e| window.contains(*e) && *e >= status_epoch) {
        eligible = true;
        match duties.verdict(validator.index, epoch) {
            DutyVerdict::Fulfilled => {
                share.successful_epochs += 1;
                share.attendance_weight += 1;
                let terms = minipool.terms_at(beacon, epoch);
                match regimes.last_mut() {
                    Some((last, weight)) if *last == terms => *weight += 1,
                    _ => regimes.push((terms, 1)),
                }
            }
            DutyVerdict::Missed => share.missed_epochs += 1,
            DutyVerdict::Disqualified => share.disqualified_epochs += 1,
            DutyVerdict::Excused => share.excused_epochs += 1,
        }
    }
    eligible.then_some(Attendance { share, regimes })
}

/// Split the smoothing pool balance of `state` across eligible minipools.
pub fn apportion_smoothing_pool(
    state: &NetworkState,
    interval: &Interval,
    duties: &DutyReport,
    split: EthSplit,
) -> Result<SmoothingPoolResult, RewardsError> {
    let balance = state.params().smoothing_pool_balance;

    let cheaters: BTreeSet<Address> = state
        .minipools()
        .filter(|mp| mp.penalty_count >= CHEATER_PENALTY_THRESHOLD)
        .map(|mp| mp.node)
        .collect();
    for cheater in &cheaters {
        tracing::warn!("Node {cheater} has a penalized minipool and is excluded from the smoothing pool");
    }

    let mut attendances = BTreeMap::new();
    for minipool in state.minipools() {
        if !minipool.is_accruing() || cheaters.contains(&minipool.node) {
            continue;
        }
        if let Some(attendance) = attendance(state, interval, duties, minipool) {
            attendances.insert(minipool.address, attendance);
        }
    }
    let total_weight: u64 = attendances.values().map(|a| a.share.attendance_weight).sum();

    if total_weight == 0 || balance.is_zero() {
        tracing::info!("No smoothing pool weight earned; {} ETH carried over", format_ether(balance));
        let minipools = attendances.into_iter().map(|(addr, a)| (addr, a.share)).collect();
        return Ok(SmoothingPoolResult { minipools, ..SmoothingPoolResult::undistributed(balance) });
    }

    let weight_denominator = U256::from(total_weight);
    let fraction_denominator =
        weight_denominator.checked_mul(ONE_ETH).ok_or(RewardsError::Arithmetic("smoothing weight"))?;

    let mut result = SmoothingPoolResult { balance, total_weight, ..Default::default() };
    let mut distributed = U256::ZERO;
    for (address, Attendance { mut share, regimes }) in attendances {
        share.share_eth =
            mul_div(balance, U256::from(share.attendance_weight), weight_denominator, "minipool share")?;
        share.node_eth = match split {
            EthSplit::FullApportionment => share.share_eth,
            EthSplit::OperatorShare => {
                let mut node_eth = U256::ZERO;
                for (terms, weight) in &regimes {
                    let weighted = balance
                        .checked_mul(U256::from(*weight))
                        .ok_or(RewardsError::Arithmetic("regime weight"))?;
                    node_eth += mul_div(weighted, terms.node_fraction()?, fraction_denominator, "node share")?;
                }
                node_eth
            }
        };
        // Sum of rounded-down parts never exceeds the rounded-down whole.
        let user_part = share.share_eth.checked_sub(share.node_eth).ok_or_else(|| {
            RewardsError::ConservationViolation(format!("minipool {address} node share exceeds its share"))
        })?;

        distributed += share.share_eth;
        result.user_eth += user_part;
        if !share.node_eth.is_zero() {
            *result.node_eth.entry(share.node).or_default() += share.node_eth;
        }
        result.minipools.insert(address, share);
    }

    result.carried_over_eth = balance.checked_sub(distributed).ok_or_else(|| {
        RewardsError::ConservationViolation(format!(
            "smoothing pool shares {distributed} exceed balance {balance}"
        ))
    })?;
    let total_node_eth = result.total_node_eth();
    if total_node_eth + result.user_eth + result.carried_over_eth != balance {
        return Err(RewardsError::ConservationViolation(format!(
            "node ETH {total_node_eth} + user ETH {} + carried {} != balance {balance}",
            result.user_eth, result.carried_over_eth
        )));
    }

    tracing::info!(
        "Apportioned {} ETH over {} minipools ({} weighted epochs): node {} ETH, user {} ETH, carried {} wei",
        format_ether(balance),
        result.minipools.len(),
        total_weight,
        format_ether(total_node_eth),
        format_ether(result.user_eth),
        result.carried_over_eth
    );
    Ok(result)
}
