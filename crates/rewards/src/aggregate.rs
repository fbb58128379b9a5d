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

//! Per-node RPL and ETH totals for an interval.

use std::collections::BTreeMap;

use alloy::primitives::{utils::format_ether, Address, U256};
use serde::{Deserialize, Serialize};

use crate::{
    collateral::NodeCollateral, config::RplDustPolicy, interval::Interval, mul_div,
    smoothing::SmoothingPoolResult, state::NetworkState, RewardsError, ONE_ETH,
};

/// Amounts owed to one node for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRewards {
    #[serde(with = "crate::serde_decimal")]
    pub collateral_rpl: U256,
    #[serde(with = "crate::serde_decimal")]
    pub oracle_dao_rpl: U256,
    #[serde(with = "crate::serde_decimal")]
    pub smoothing_pool_eth: U256,
}

impl NodeRewards {
    pub fn total_rpl(&self) -> U256 {
        self.collateral_rpl + self.oracle_dao_rpl
    }

    pub fn is_zero(&self) -> bool {
        self.total_rpl().is_zero() && self.smoothing_pool_eth.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RplTotals {
    pub total: U256,
    pub collateral_rpl: U256,
    pub oracle_dao_rpl: U256,
    pub treasury_rpl: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RewardLedger {
    /// Nodes with at least one non-zero amount, by address.
    pub nodes: BTreeMap<Address, NodeRewards>,
    pub rpl: RplTotals,
    pub smoothing_pool_balance: U256,
    pub node_eth: U256,
    pub user_eth: U256,
    pub carried_over_eth: U256,
}

/// Split `pool` in proportion to `weights`.
///
/// Amounts are rounded down. With [RplDustPolicy::ProRata] the leftover wei are handed out
/// one each by largest remainder, ties broken by address, so the whole pool is paid out.
fn split_pool(
    pool: U256,
    weights: &BTreeMap<Address, U256>,
    policy: RplDustPolicy,
) -> Result<BTreeMap<Address, U256>, RewardsError> {
    let total_weight = weights.values().fold(U256::ZERO, |acc, w| acc + *w);
    if total_weight.is_zero() {
        return Ok(BTreeMap::new());
    }

    let mut amounts = BTreeMap::new();
    let mut remainders = Vec::with_capacity(weights.len());
    let mut paid = U256::ZERO;
    for (address, weight) in weights {
        let product = pool.checked_mul(*weight).ok_or(RewardsError::Arithmetic("pool split"))?;
        let amount = product / total_weight;
        remainders.push((product % total_weight, *address));
        paid += amount;
        amounts.insert(*address, amount);
    }

    if policy == RplDustPolicy::ProRata {
        let dust = pool - paid;
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, address) in remainders.iter().take(dust.saturating_to::<usize>()) {
            if let Some(amount) = amounts.get_mut(address) {
                *amount += U256::from(1u64);
            }
        }
    }
    Ok(amounts)
}

/// Seconds each Oracle DAO member was part of the DAO during the interval.
fn oracle_dao_participation(state: &NetworkState, interval: &Interval) -> BTreeMap<Address, U256> {
    let duration = match state.params().interval_duration {
        0 => interval.duration(),
        duration => duration,
    };
    state
        .oracle_dao_members()
        .map(|(node, membership)| {
            let seconds = interval.end_time.saturating_sub(membership.joined_time).min(duration);
            (node.address, U256::from(seconds))
        })
        .collect()
}

/// Combine collateral and smoothing pool results into the per-node ledger.
///
/// Totals are checked exactly: RPL must add up to the interval's pending rewards and ETH
/// must not exceed the smoothing pool balance.
pub fn aggregate_rewards(
    state: &NetworkState,
    interval: &Interval,
    collateral: &BTreeMap<Address, NodeCollateral>,
    smoothing: &SmoothingPoolResult,
    dust: RplDustPolicy,
) -> Result<RewardLedger, RewardsError> {
    let params = state.params();
    let total = params.pending_rpl_rewards;
    if total.is_zero() {
        return Err(RewardsError::InvalidSnapshot("no pending RPL rewards for the interval".into()));
    }

    let node_pool = mul_div(total, params.node_operator_rewards_percent, ONE_ETH, "node pool")?;
    let odao_pool =
        mul_div(total, params.trusted_node_operator_rewards_percent, ONE_ETH, "oracle DAO pool")?;

    let stakes: BTreeMap<Address, U256> =
        collateral.iter().map(|(address, c)| (*address, c.effective_stake)).collect();
    let collateral_rpl = split_pool(node_pool, &stakes, dust)?;
    if collateral_rpl.is_empty() {
        tracing::warn!("No effective RPL stake; node operator rewards go to the treasury");
    }

    let participation = oracle_dao_participation(state, interval);
    let oracle_dao_rpl = split_pool(odao_pool, &participation, dust)?;
    if oracle_dao_rpl.is_empty() && !odao_pool.is_zero() {
        tracing::warn!("No Oracle DAO participation; trusted node rewards go to the treasury");
    }

    let mut nodes: BTreeMap<Address, NodeRewards> = BTreeMap::new();
    for (address, amount) in &collateral_rpl {
        nodes.entry(*address).or_default().collateral_rpl = *amount;
    }
    for (address, amount) in &oracle_dao_rpl {
        nodes.entry(*address).or_default().oracle_dao_rpl = *amount;
    }
    for (address, amount) in &smoothing.node_eth {
        if state.node(address).is_none() {
            return Err(RewardsError::ConservationViolation(format!(
                "smoothing pool paid unknown node {address}"
            )));
        }
        nodes.entry(*address).or_default().smoothing_pool_eth = *amount;
    }
    nodes.retain(|_, rewards| !rewards.is_zero());

    let sum_collateral = nodes.values().fold(U256::ZERO, |acc, r| acc + r.collateral_rpl);
    let sum_odao = nodes.values().fold(U256::ZERO, |acc, r| acc + r.oracle_dao_rpl);
    let treasury_rpl = total
        .checked_sub(sum_collateral)
        .and_then(|rest| rest.checked_sub(sum_odao))
        .ok_or_else(|| {
            RewardsError::ConservationViolation(format!(
                "node RPL {sum_collateral} + oracle DAO RPL {sum_odao} exceed total {total}"
            ))
        })?;
    if sum_collateral > node_pool || sum_odao > odao_pool {
        return Err(RewardsError::ConservationViolation(format!(
            "pool overpaid: node {sum_collateral}/{node_pool}, oracle DAO {sum_odao}/{odao_pool}"
        )));
    }
    if sum_collateral + sum_odao + treasury_rpl != total {
        return Err(RewardsError::ConservationViolation(format!(
            "RPL {sum_collateral} + {sum_odao} + {treasury_rpl} != {total}"
        )));
    }

    let node_eth = nodes.values().fold(U256::ZERO, |acc, r| acc + r.smoothing_pool_eth);
    let balance = params.smoothing_pool_balance;
    if node_eth > balance || node_eth + smoothing.user_eth + smoothing.carried_over_eth != balance {
        return Err(RewardsError::ConservationViolation(format!(
            "node ETH {node_eth} + user ETH {} + carried {} does not match balance {balance}",
            smoothing.user_eth, smoothing.carried_over_eth
        )));
    }

    tracing::info!(
        "Aggregated rewards for {} nodes: collateral {} RPL, oracle DAO {} RPL, treasury {} RPL, node {} ETH",
        nodes.len(),
        format_ether(sum_collateral),
        format_ether(sum_odao),
        format_ether(treasury_rpl),
        format_ether(node_eth)
    );

    Ok(RewardLedger {
        nodes,
        rpl: RplTotals { total, collateral_rpl: sum_collateral, oracle_dao_rpl: sum_odao, treasury_rpl },
        smoothing_pool_balance: balance,
        node_eth,
        user_eth: smoothing.user_eth,
        carried_over_eth: smoothing.carried_over_eth,
    })
}
