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

//! Effective RPL stake of each node.

use std::collections::BTreeMap;

use alloy::primitives::{Address, U256};
use serde::Serialize;

use crate::{config::CollateralFloor, interval::Interval, mul_div, state::NetworkState, RewardsError};

/// Collateral position of a node at the end of an interval.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCollateral {
    #[serde(with = "crate::serde_decimal")]
    pub borrowed_eth: U256,
    #[serde(with = "crate::serde_decimal")]
    pub min_stake: U256,
    #[serde(with = "crate::serde_decimal")]
    pub max_stake: U256,
    #[serde(with = "crate::serde_decimal")]
    pub effective_stake: U256,
    /// Raw stake value over borrowed ETH, 1e18 fixed point. Zero when nothing is borrowed.
    #[serde(with = "crate::serde_decimal")]
    pub collateral_ratio: U256,
}

pub struct CollateralCalculator<'a> {
    state: &'a NetworkState,
    end_epoch: u64,
    floor: CollateralFloor,
}

impl<'a> CollateralCalculator<'a> {
    pub fn new(state: &'a NetworkState, interval: &Interval, floor: CollateralFloor) -> Self {
        Self { state, end_epoch: interval.end_epoch, floor }
    }

    /// ETH borrowed from pool stakers across the node's active minipools.
    pub fn borrowed_eth(&self, node: &Address) -> U256 {
        let Some(record) = self.state.node(node) else {
            return U256::ZERO;
        };
        self.state
            .minipools_of(record)
            .filter(|mp| mp.is_accruing())
            .filter(|mp| {
                self.state.validator(&mp.pubkey).is_some_and(|v| v.is_active_at(self.end_epoch))
            })
            .map(|mp| mp.bond.borrowed())
            .fold(U256::ZERO, |acc, borrowed| acc + borrowed)
    }

    pub fn node_collateral(&self, node: &Address) -> Result<NodeCollateral, RewardsError> {
        let raw = self.state.node(node).map(|n| n.rpl_stake).unwrap_or_default();
        let borrowed_eth = self.borrowed_eth(node);
        if borrowed_eth.is_zero() {
            return Ok(NodeCollateral::default());
        }

        let params = self.state.params();
        let min_stake =
            mul_div(borrowed_eth, params.min_collateral_fraction, params.rpl_price, "min stake")?;
        let max_stake =
            mul_div(borrowed_eth, params.max_collateral_fraction, params.rpl_price, "max stake")?;
        let effective_stake = match self.floor {
            CollateralFloor::Forfeit if raw < min_stake => U256::ZERO,
            _ => raw.clamp(min_stake, max_stake),
        };
        let collateral_ratio = mul_div(raw, params.rpl_price, borrowed_eth, "collateral ratio")?;
        Ok(NodeCollateral { borrowed_eth, min_stake, max_stake, effective_stake, collateral_ratio })
    }

    /// Collateral of every node, in ascending address order.
    pub fn calculate_all(&self) -> Result<BTreeMap<Address, NodeCollateral>, RewardsError> {
        let collateral = self
            .state
            .nodes()
            .map(|node| Ok((node.address, self.node_collateral(&node.address)?)))
            .collect::<Result<BTreeMap<_, _>, RewardsError>>()?;
        let total = collateral.values().fold(U256::ZERO, |acc, c| acc + c.effective_stake);
        tracing::info!(
            "Computed collateral for {} nodes, total effective stake {} RPL",
            collateral.len(),
            alloy::primitives::utils::format_ether(total)
        );
        Ok(collateral)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;
    use crate::{
        interval::{BeaconConfig, FAR_FUTURE_EPOCH},
        ONE_ETH,
        state::{
            Bond, MinipoolRecord, MinipoolStatus, NetworkParameters, NetworkStateData, NodeRecord,
            Pubkey, ValidatorRecord,
        },
    };

    const NODE: Address = address!("0x00000000000000000000000000000000000007d0");

    fn eth(n: u64) -> U256 {
        U256::from(n) * ONE_ETH
    }

    fn state(rpl_stake: U256, minipools: &[(Bond, MinipoolStatus, bool, u64)]) -> NetworkState {
        let mut data = NetworkStateData {
            beacon: BeaconConfig { genesis_time: 0, seconds_per_slot: 12, slots_per_epoch: 32 },
            params: NetworkParameters {
                // 0.25 ETH per RPL
                rpl_price: ONE_ETH / U256::from(4u64),
                min_collateral_fraction: ONE_ETH / U256::from(10u64),
                max_collateral_fraction: ONE_ETH * U256::from(3u64) / U256::from(2u64),
                smoothing_pool_balance: U256::ZERO,
                node_operator_rewards_percent: ONE_ETH,
                trusted_node_operator_rewards_percent: U256::ZERO,
                protocol_dao_rewards_percent: U256::ZERO,
                pending_rpl_rewards: ONE_ETH,
                interval_duration: 86400,
            },
            nodes: vec![NodeRecord {
                address: NODE,
                rpl_stake,
                smoothing_pool_registered: false,
                smoothing_pool_changed: 0,
                oracle_dao: None,
                minipools: vec![],
            }],
            minipools: vec![],
            validators: vec![],
        };
        for (i, (bond, status, finalized, exit_epoch)) in minipools.iter().enumerate() {
            let address = Address::with_last_byte(0x10 + i as u8);
            let pubkey = Pubkey::with_last_byte(i as u8);
            data.nodes[0].minipools.push(address);
            data.minipools.push(MinipoolRecord {
                address,
                node: NODE,
                pubkey,
                status: *status,
                status_time: 0,
                finalized: *finalized,
                bond: *bond,
                fee: ONE_ETH / U256::from(10u64),
                penalty_count: 0,
                bond_reduction: None,
            });
            data.validators.push(ValidatorRecord {
                pubkey,
                index: i as u64,
                activation_epoch: 0,
                exit_epoch: *exit_epoch,
            });
        }
        NetworkState::new(data).unwrap()
    }

    fn interval() -> Interval {
        Interval {
            index: 1,
            start_epoch: 100,
            end_epoch: 199,
            consensus_start_block: 3200,
            consensus_end_block: 6399,
            execution_start_block: 0,
            execution_end_block: 0,
            start_time: 0,
            end_time: 0,
            intervals_passed: 1,
        }
    }

    #[test]
    fn stake_within_bounds_is_unchanged() {
        // 24 ETH borrowed: min 9.6 RPL, max 144 RPL
        let state = state(eth(100), &[(Bond::Eight, MinipoolStatus::Staking, false, FAR_FUTURE_EPOCH)]);
        let calc = CollateralCalculator::new(&state, &interval(), CollateralFloor::Clamp);
        let collateral = calc.node_collateral(&NODE).unwrap();
        assert_eq!(collateral.borrowed_eth, eth(24));
        assert_eq!(collateral.min_stake, U256::from(9_600_000_000_000_000_000u128));
        assert_eq!(collateral.max_stake, eth(144));
        assert_eq!(collateral.effective_stake, eth(100));
        // 100 RPL * 0.25 / 24 ETH
        assert_eq!(collateral.collateral_ratio, U256::from(1_041_666_666_666_666_666u128));
    }

    #[test]
    fn stake_clamped_to_bounds() {
        let mp = [(Bond::Sixteen, MinipoolStatus::Staking, false, FAR_FUTURE_EPOCH)];
        let over = state(eth(1000), &mp);
        let calc = CollateralCalculator::new(&over, &interval(), CollateralFloor::Clamp);
        assert_eq!(calc.node_collateral(&NODE).unwrap().effective_stake, eth(96));

        let under = state(eth(1), &mp);
        let calc = CollateralCalculator::new(&under, &interval(), CollateralFloor::Clamp);
        assert_eq!(calc.node_collateral(&NODE).unwrap().effective_stake, U256::from(6_400_000_000_000_000_000u128));

        let calc = CollateralCalculator::new(&under, &interval(), CollateralFloor::Forfeit);
        assert_eq!(calc.node_collateral(&NODE).unwrap().effective_stake, U256::ZERO);
    }

    #[test]
    fn only_active_minipools_borrow() {
        let state = state(
            eth(50),
            &[
                (Bond::Eight, MinipoolStatus::Staking, false, FAR_FUTURE_EPOCH),
                (Bond::Eight, MinipoolStatus::Staking, true, FAR_FUTURE_EPOCH),
                (Bond::Sixteen, MinipoolStatus::Dissolved, false, FAR_FUTURE_EPOCH),
                (Bond::Sixteen, MinipoolStatus::Staking, false, 150),
            ],
        );
        let calc = CollateralCalculator::new(&state, &interval(), CollateralFloor::Clamp);
        assert_eq!(calc.borrowed_eth(&NODE), eth(24));
    }

    #[test]
    fn no_minipools_means_no_effective_stake() {
        let state = state(eth(5000), &[]);
        let calc = CollateralCalculator::new(&state, &interval(), CollateralFloor::Clamp);
        assert_eq!(calc.node_collateral(&NODE).unwrap(), NodeCollateral::default());
        assert_eq!(calc.calculate_all().unwrap().len(), 1);
    }
}
