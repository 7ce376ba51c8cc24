// Copyright 2026 Stakewatch, Inc.
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

//! Contract interfaces for the staking pool and its ERC-20 staking token.
//!
//! The Solidity surface is fixed by the deployed contracts; both interfaces
//! are declared here and nowhere else. The pool exposes a combined
//! `getUserDetails` accessor plus a set of legacy per-field accessors that
//! older deployments implement instead.

use alloy::{rpc::types::Log, sol, sol_types::SolEvent};

sol! {
    #[sol(rpc)]
    interface IStakingPool {
        struct UserDetails {
            uint256 stakedAmount;
            uint256 lastStakeTimestamp;
            uint256 pendingRewards;
            uint256 timeUntilUnlock;
            bool canWithdraw;
        }

        function stakingToken() external view returns (address);

        function getUserDetails(address user) external view returns (UserDetails memory);
        function userInfo(address user) external view returns (uint256 stakedAmount, uint256 lastStakeTimestamp);
        function getPendingRewards(address user) external view returns (uint256);
        function getTimeUntilUnlock(address user) external view returns (uint256);

        function initialApr() external view returns (uint256);
        function currentRewardRate() external view returns (uint256);
        function totalStaked() external view returns (uint256);
        function getTotalRewards() external view returns (uint256);
        function minLockDuration() external view returns (uint256);
        function emergencyWithdrawPenalty() external view returns (uint256);

        function stake(uint256 amount) external;
        function withdraw(uint256 amount) external;
        function claimRewards() external;
        function emergencyWithdraw() external;

        event Staked(address indexed user, uint256 amount, uint256 newTotalStaked);
        event Withdrawn(address indexed user, uint256 amount, uint256 rewardsAccrued, uint256 newTotalStaked);
        event RewardsClaimed(address indexed user, uint256 amount);
        event EmergencyWithdrawn(address indexed user, uint256 amount, uint256 penalty, uint256 newTotalStaked);
        event RewardRateUpdated(uint256 newRate);
    }

    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

/// All pool event types the reconciler subscribes to.
#[derive(Clone)]
pub enum PoolEvent {
    Staked(IStakingPool::Staked),
    Withdrawn(IStakingPool::Withdrawn),
    RewardsClaimed(IStakingPool::RewardsClaimed),
    EmergencyWithdrawn(IStakingPool::EmergencyWithdrawn),
    RewardRateUpdated(IStakingPool::RewardRateUpdated),
}

// the sol!-generated event structs carry no Debug impl of their own
impl std::fmt::Debug for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolEvent::Staked(e) => f
                .debug_struct("Staked")
                .field("user", &e.user)
                .field("amount", &e.amount)
                .field("new_total_staked", &e.newTotalStaked)
                .finish(),
            PoolEvent::Withdrawn(e) => f
                .debug_struct("Withdrawn")
                .field("user", &e.user)
                .field("amount", &e.amount)
                .field("rewards_accrued", &e.rewardsAccrued)
                .field("new_total_staked", &e.newTotalStaked)
                .finish(),
            PoolEvent::RewardsClaimed(e) => f
                .debug_struct("RewardsClaimed")
                .field("user", &e.user)
                .field("amount", &e.amount)
                .finish(),
            PoolEvent::EmergencyWithdrawn(e) => f
                .debug_struct("EmergencyWithdrawn")
                .field("user", &e.user)
                .field("amount", &e.amount)
                .field("penalty", &e.penalty)
                .field("new_total_staked", &e.newTotalStaked)
                .finish(),
            PoolEvent::RewardRateUpdated(e) => f
                .debug_struct("RewardRateUpdated")
                .field("new_rate", &e.newRate)
                .finish(),
        }
    }
}

impl PoolEvent {
    /// Topic hashes of every subscribed event, for the log filter.
    pub fn signatures() -> Vec<alloy::primitives::B256> {
        vec![
            IStakingPool::Staked::SIGNATURE_HASH,
            IStakingPool::Withdrawn::SIGNATURE_HASH,
            IStakingPool::RewardsClaimed::SIGNATURE_HASH,
            IStakingPool::EmergencyWithdrawn::SIGNATURE_HASH,
            IStakingPool::RewardRateUpdated::SIGNATURE_HASH,
        ]
    }

    /// Decode an RPC log by topic0. Returns `None` for unknown topics or
    /// logs that fail to decode; the caller is expected to log and skip.
    pub fn decode(log: &Log) -> Option<PoolEvent> {
        match log.topic0() {
            Some(t) if t == &IStakingPool::Staked::SIGNATURE_HASH => {
                match log.log_decode::<IStakingPool::Staked>() {
                    Ok(res) => Some(PoolEvent::Staked(res.inner.data)),
                    Err(err) => {
                        tracing::error!("Failed to decode Staked log: {err:?}");
                        None
                    }
                }
            }
            Some(t) if t == &IStakingPool::Withdrawn::SIGNATURE_HASH => {
                match log.log_decode::<IStakingPool::Withdrawn>() {
                    Ok(res) => Some(PoolEvent::Withdrawn(res.inner.data)),
                    Err(err) => {
                        tracing::error!("Failed to decode Withdrawn log: {err:?}");
                        None
                    }
                }
            }
            Some(t) if t == &IStakingPool::RewardsClaimed::SIGNATURE_HASH => {
                match log.log_decode::<IStakingPool::RewardsClaimed>() {
                    Ok(res) => Some(PoolEvent::RewardsClaimed(res.inner.data)),
                    Err(err) => {
                        tracing::error!("Failed to decode RewardsClaimed log: {err:?}");
                        None
                    }
                }
            }
            Some(t) if t == &IStakingPool::EmergencyWithdrawn::SIGNATURE_HASH => {
                match log.log_decode::<IStakingPool::EmergencyWithdrawn>() {
                    Ok(res) => Some(PoolEvent::EmergencyWithdrawn(res.inner.data)),
                    Err(err) => {
                        tracing::error!("Failed to decode EmergencyWithdrawn log: {err:?}");
                        None
                    }
                }
            }
            Some(t) if t == &IStakingPool::RewardRateUpdated::SIGNATURE_HASH => {
                match log.log_decode::<IStakingPool::RewardRateUpdated>() {
                    Ok(res) => Some(PoolEvent::RewardRateUpdated(res.inner.data)),
                    Err(err) => {
                        tracing::error!("Failed to decode RewardRateUpdated log: {err:?}");
                        None
                    }
                }
            }
            other => {
                tracing::debug!("Skipping unknown topic0 log: {other:?}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, LogData, U256};

    fn rpc_log(address: Address, data: LogData) -> Log {
        Log { inner: alloy::primitives::Log { address, data }, ..Default::default() }
    }

    #[test]
    fn decode_staked_log() {
        let user = Address::repeat_byte(0x11);
        let event = IStakingPool::Staked {
            user,
            amount: U256::from(50u64),
            newTotalStaked: U256::from(150u64),
        };
        let log = rpc_log(Address::repeat_byte(0xaa), event.encode_log_data());

        match PoolEvent::decode(&log) {
            Some(PoolEvent::Staked(decoded)) => {
                assert_eq!(decoded.user, user);
                assert_eq!(decoded.amount, U256::from(50u64));
                assert_eq!(decoded.newTotalStaked, U256::from(150u64));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn decode_rate_update_log() {
        let event = IStakingPool::RewardRateUpdated { newRate: U256::from(850u64) };
        let log = rpc_log(Address::repeat_byte(0xaa), event.encode_log_data());

        match PoolEvent::decode(&log) {
            Some(PoolEvent::RewardRateUpdated(decoded)) => {
                assert_eq!(decoded.newRate, U256::from(850u64));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn events_render_in_log_lines() {
        let event = PoolEvent::Staked(IStakingPool::Staked {
            user: Address::repeat_byte(0x11),
            amount: U256::from(50u64),
            newTotalStaked: U256::from(150u64),
        });
        let rendered = format!("{event:?}");
        assert!(rendered.contains("Staked"));
        assert!(rendered.contains("new_total_staked"));

        let event =
            PoolEvent::RewardRateUpdated(IStakingPool::RewardRateUpdated { newRate: U256::ZERO });
        assert!(format!("{event:?}").contains("RewardRateUpdated"));
    }

    #[test]
    fn unknown_topic_is_skipped() {
        let event = IStakingPool::Staked {
            user: Address::ZERO,
            amount: U256::ZERO,
            newTotalStaked: U256::ZERO,
        };
        let mut data = event.encode_log_data();
        data.topics_mut()[0] = alloy::primitives::B256::repeat_byte(0xff);
        let log = rpc_log(Address::repeat_byte(0xaa), data);

        assert!(PoolEvent::decode(&log).is_none());
    }
}
