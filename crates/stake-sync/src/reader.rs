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

//! Read-only calls against the staking pool and token contracts.
//!
//! Not every deployment implements the combined `getUserDetails` accessor,
//! so user reads go through an ordered list of candidate sources: the
//! combined accessor first, then the legacy per-field accessors with
//! degraded precision. First success wins. Protocol-wide reads degrade
//! per field to zero instead of failing the batch; the store keeps its
//! last-known-good values in that case.

use std::sync::Arc;

use alloy::{
    network::Ethereum,
    primitives::{address, Address, U256},
    providers::Provider,
};
use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;

use crate::{
    contracts::{IStakingPool, IERC20},
    derived,
    errors::CodedError,
    impl_coded_debug, now_timestamp,
    orchestrator::StoreRefresher,
    snapshot::{ProtocolUpdate, SnapshotLock, UserUpdate},
};

/// Used when the pool's `stakingToken()` accessor cannot be read.
const FALLBACK_TOKEN_ADDRESS: Address = address!("efec53fa6759fcdd49c3e084b69286a8967c7db2");

/// Window over which `total_rewards` is estimated when the contract's
/// cumulative read returns zero.
pub(crate) const ESTIMATION_WINDOW_SECS: u64 = 3600;

#[derive(Error)]
pub enum ReaderErr {
    #[error("{code} Read of `{field}` failed: {cause:#}", code = self.code())]
    ReadFailed { field: &'static str, cause: anyhow::Error },

    #[error("{code} No contract deployed at {0}", code = self.code())]
    NotDeployed(Address),

    #[error("{code} Snapshot store unavailable: {0}", code = self.code())]
    StoreErr(#[from] crate::snapshot::StoreErr),
}

impl_coded_debug!(ReaderErr);

impl CodedError for ReaderErr {
    fn code(&self) -> &str {
        match self {
            ReaderErr::ReadFailed { .. } => "[SS-RD-401]",
            ReaderErr::NotDeployed(_) => "[SS-RD-402]",
            ReaderErr::StoreErr(_) => "[SS-RD-403]",
        }
    }
}

impl ReaderErr {
    fn read(field: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::ReadFailed { field, cause: cause.into() }
    }
}

/// Raw per-user fields as the contract reports them, before derivation.
#[derive(Debug, Clone, Default)]
pub struct RawUserDetails {
    pub staked_amount: U256,
    pub last_stake_timestamp: u64,
    pub pending_rewards: U256,
    pub time_until_unlock: u64,
    pub can_withdraw: bool,
}

/// Ordered candidate sources for per-user reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserDetailsSource {
    /// The combined `getUserDetails` accessor
    Combined,
    /// `userInfo` + `getPendingRewards` + `getTimeUntilUnlock`; no
    /// `canWithdraw` flag, so that field degrades to false
    Legacy,
}

const USER_DETAILS_SOURCES: [UserDetailsSource; 2] =
    [UserDetailsSource::Combined, UserDetailsSource::Legacy];

#[derive(Clone)]
pub struct ChainReader<P> {
    provider: Arc<P>,
    staking_addr: Address,
    token_addr: Address,
}

impl<P> ChainReader<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    /// Checks the pool contract is deployed and resolves the token address,
    /// falling back to the hardcoded token when `stakingToken()` fails.
    pub async fn resolve(
        provider: Arc<P>,
        staking_addr: Address,
        token_fallback: Address,
    ) -> Result<Self, ReaderErr> {
        let code = provider
            .get_code_at(staking_addr)
            .await
            .context("Failed to fetch contract bytecode")
            .map_err(|cause| ReaderErr::read("bytecode", cause))?;
        if code.is_empty() {
            return Err(ReaderErr::NotDeployed(staking_addr));
        }

        let pool = IStakingPool::new(staking_addr, provider.clone());
        let token_addr = match pool.stakingToken().call().await {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(
                    "Failed to read stakingToken, using fallback {token_fallback}: {err:?}"
                );
                token_fallback
            }
        };

        Ok(Self { provider, staking_addr, token_addr })
    }

    /// Constructs a reader without touching the chain. Used by tests and by
    /// callers that already know the token address.
    pub fn new(provider: Arc<P>, staking_addr: Address, token_addr: Address) -> Self {
        Self { provider, staking_addr, token_addr }
    }

    pub fn token_address(&self) -> Address {
        self.token_addr
    }

    pub fn staking_address(&self) -> Address {
        self.staking_addr
    }

    /// Default token fallback for deployments that predate the
    /// `stakingToken()` accessor.
    pub fn fallback_token_address() -> Address {
        FALLBACK_TOKEN_ADDRESS
    }

    fn pool(&self) -> IStakingPool::IStakingPoolInstance<Arc<P>> {
        IStakingPool::new(self.staking_addr, self.provider.clone())
    }

    fn token(&self) -> IERC20::IERC20Instance<Arc<P>> {
        IERC20::new(self.token_addr, self.provider.clone())
    }

    async fn read_user_from(
        &self,
        source: UserDetailsSource,
        user: Address,
    ) -> Result<RawUserDetails, ReaderErr> {
        let pool = self.pool();
        match source {
            UserDetailsSource::Combined => {
                let details = pool
                    .getUserDetails(user)
                    .call()
                    .await
                    .map_err(|err| ReaderErr::read("getUserDetails", err))?;
                Ok(RawUserDetails {
                    staked_amount: details.stakedAmount,
                    last_stake_timestamp: as_secs(details.lastStakeTimestamp),
                    pending_rewards: details.pendingRewards,
                    time_until_unlock: as_secs(details.timeUntilUnlock),
                    can_withdraw: details.canWithdraw,
                })
            }
            UserDetailsSource::Legacy => {
                let info = pool
                    .userInfo(user)
                    .call()
                    .await
                    .map_err(|err| ReaderErr::read("userInfo", err))?;
                let pending = pool
                    .getPendingRewards(user)
                    .call()
                    .await
                    .map_err(|err| ReaderErr::read("getPendingRewards", err))?;
                // getTimeUntilUnlock is the newest of the legacy accessors
                // and may itself be missing; degrade to zero.
                let time_until_unlock = match pool.getTimeUntilUnlock(user).call().await {
                    Ok(val) => as_secs(val),
                    Err(err) => {
                        tracing::warn!("getTimeUntilUnlock unavailable, defaulting to 0: {err:?}");
                        0
                    }
                };
                Ok(RawUserDetails {
                    staked_amount: info.stakedAmount,
                    last_stake_timestamp: as_secs(info.lastStakeTimestamp),
                    pending_rewards: pending,
                    time_until_unlock,
                    can_withdraw: false,
                })
            }
        }
    }

    /// Reads the user's pool-side fields, trying each candidate source in
    /// order.
    pub async fn load_user(&self, user: Address) -> Result<RawUserDetails, ReaderErr> {
        let mut last_err = None;
        for source in USER_DETAILS_SOURCES {
            match self.read_user_from(source, user).await {
                Ok(details) => {
                    if source != UserDetailsSource::Combined {
                        tracing::warn!("User details read degraded to {source:?}");
                    }
                    return Ok(details);
                }
                Err(err) => {
                    tracing::debug!("User details source {source:?} failed: {err:?}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ReaderErr::read("user details", anyhow::anyhow!("no candidate sources"))
        }))
    }

    pub async fn token_balance(&self, owner: Address) -> Result<U256, ReaderErr> {
        self.token()
            .balanceOf(owner)
            .call()
            .await
            .map_err(|err| ReaderErr::read("balanceOf", err))
    }

    pub async fn token_allowance(&self, owner: Address) -> Result<U256, ReaderErr> {
        self.token()
            .allowance(owner, self.staking_addr)
            .call()
            .await
            .map_err(|err| ReaderErr::read("allowance", err))
    }

    pub async fn total_staked(&self) -> Result<U256, ReaderErr> {
        self.pool().totalStaked().call().await.map_err(|err| ReaderErr::read("totalStaked", err))
    }

    pub async fn total_rewards(&self) -> Result<U256, ReaderErr> {
        self.pool()
            .getTotalRewards()
            .call()
            .await
            .map_err(|err| ReaderErr::read("getTotalRewards", err))
    }

    /// Pending rewards via the direct accessor, falling back to the
    /// combined read.
    pub async fn pending_rewards(&self, user: Address) -> Result<U256, ReaderErr> {
        match self.pool().getPendingRewards(user).call().await {
            Ok(val) => Ok(val),
            Err(err) => {
                tracing::debug!("getPendingRewards failed, trying getUserDetails: {err:?}");
                Ok(self.load_user(user).await?.pending_rewards)
            }
        }
    }

    /// Reads every protocol-wide field concurrently. Individual failures
    /// degrade to zero with a warning instead of failing the batch, and a
    /// zero cumulative-rewards read is replaced by the APR estimation
    /// fallback for display.
    pub async fn load_protocol(&self) -> ProtocolUpdate {
        let pool = self.pool();
        let apr_call = pool.initialApr();
        let rate_call = pool.currentRewardRate();
        let total_staked_call = pool.totalStaked();
        let total_rewards_call = pool.getTotalRewards();
        let min_lock_call = pool.minLockDuration();
        let penalty_call = pool.emergencyWithdrawPenalty();
        let (apr, rate, total_staked, total_rewards, min_lock, penalty) = tokio::join!(
            apr_call.call(),
            rate_call.call(),
            total_staked_call.call(),
            total_rewards_call.call(),
            min_lock_call.call(),
            penalty_call.call(),
        );

        let apr = unwrap_or_zero("initialApr", apr);
        let total_staked = unwrap_or_zero("totalStaked", total_staked);
        let total_rewards = unwrap_or_zero("getTotalRewards", total_rewards);

        let total_rewards = if total_rewards.is_zero() {
            derived::estimated_rewards(total_staked, apr, ESTIMATION_WINDOW_SECS)
        } else {
            total_rewards
        };

        ProtocolUpdate {
            apr: Some(apr),
            current_reward_rate: Some(unwrap_or_zero("currentRewardRate", rate)),
            total_staked: Some(total_staked),
            total_rewards: Some(total_rewards),
            min_lock_duration: Some(as_secs(unwrap_or_zero("minLockDuration", min_lock))),
            emergency_withdraw_penalty: Some(unwrap_or_zero("emergencyWithdrawPenalty", penalty)),
        }
    }

    /// Derives the display fields from a raw read and merges the result
    /// into the store.
    pub fn apply_user_details(
        &self,
        store: &SnapshotLock,
        raw: &RawUserDetails,
    ) -> Result<(), ReaderErr> {
        let min_lock_duration = store.protocol()?.min_lock_duration;
        store.apply_user_update(user_update_from_raw(raw, min_lock_duration, now_timestamp()))?;
        Ok(())
    }
}

/// Combines the raw contract fields with wall-clock time into the derived
/// user fields.
pub fn user_update_from_raw(
    raw: &RawUserDetails,
    min_lock_duration: u64,
    now: u64,
) -> UserUpdate {
    let time_until_unlock = derived::time_until_unlock(
        raw.last_stake_timestamp,
        min_lock_duration,
        now,
        raw.time_until_unlock,
    );
    let can_withdraw =
        derived::can_withdraw(raw.can_withdraw, time_until_unlock, raw.staked_amount);
    UserUpdate {
        staked_balance: Some(raw.staked_amount),
        pending_rewards: Some(raw.pending_rewards),
        last_stake_timestamp: Some(raw.last_stake_timestamp),
        time_until_unlock: Some(time_until_unlock),
        can_withdraw: Some(can_withdraw),
        ..Default::default()
    }
}

fn unwrap_or_zero(field: &'static str, res: Result<U256, alloy::contract::Error>) -> U256 {
    match res {
        Ok(val) => val,
        Err(err) => {
            tracing::warn!("Failed to read {field}, defaulting to 0: {err:?}");
            U256::ZERO
        }
    }
}

fn as_secs(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[async_trait]
impl<P> StoreRefresher for ChainReader<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    /// The batched post-action refresh: user details, token balance, token
    /// allowance and the pool total, fetched together to minimize
    /// time-to-consistency.
    async fn refresh_after_action(
        &self,
        store: &SnapshotLock,
        user: Address,
    ) -> anyhow::Result<()> {
        let (raw, balance, allowance, total_staked) = tokio::try_join!(
            self.load_user(user),
            self.token_balance(user),
            self.token_allowance(user),
            self.total_staked(),
        )?;

        let min_lock_duration = store.protocol()?.min_lock_duration;
        let mut update = user_update_from_raw(&raw, min_lock_duration, now_timestamp());
        update.token_balance = Some(balance);
        update.token_allowance = Some(allowance);
        store.apply_user_update(update)?;
        store.apply_protocol_update(ProtocolUpdate {
            total_staked: Some(total_staked),
            ..Default::default()
        })?;
        Ok(())
    }
}
