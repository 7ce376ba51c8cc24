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

//! The staking state store: one merged view of on-chain state per session.
//!
//! The store is the only mutable shared resource in the crate. Readers,
//! event handlers, the poller and the orchestrator all write through the
//! merge entry points below; nothing mutates the snapshots from outside.
//! Updates are shallow `Option`-field merges applied under a single write
//! guard, so concurrent writers commute field-by-field and the most recent
//! write of a field wins regardless of whether it arrived from a log batch
//! or a poll tick.

use std::sync::{Arc, RwLock};

use alloy::primitives::U256;
use thiserror::Error;

use crate::{errors::CodedError, impl_coded_debug};

#[derive(Error)]
pub enum StoreErr {
    #[error("{code} Failed to lock snapshot state", code = self.code())]
    LockFailed,
}

impl_coded_debug!(StoreErr);

impl CodedError for StoreErr {
    fn code(&self) -> &str {
        match self {
            StoreErr::LockFailed => "[SS-ST-2001]",
        }
    }
}

/// Per-account view of the user's stake. All amounts in 18-decimal base
/// units; timestamps in epoch seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStakingSnapshot {
    pub staked_balance: U256,
    pub pending_rewards: U256,
    pub last_stake_timestamp: u64,
    /// Derived; clamped to >= 0 at computation time
    pub time_until_unlock: u64,
    /// Derived; `staked_balance == 0` forces false
    pub can_withdraw: bool,
    pub token_balance: U256,
    pub token_allowance: U256,
}

/// Contract-wide view. Refreshed as a unit so consumers never observe a
/// mismatched apr/rate pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolSnapshot {
    /// Initial APR, fixed at deploy
    pub apr: U256,
    pub current_reward_rate: U256,
    pub total_staked: U256,
    /// Cumulative; may carry the estimation fallback when the contract
    /// read returns zero
    pub total_rewards: U256,
    pub min_lock_duration: u64,
    pub emergency_withdraw_penalty: U256,
}

/// Partial update of [UserStakingSnapshot]. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub staked_balance: Option<U256>,
    pub pending_rewards: Option<U256>,
    pub last_stake_timestamp: Option<u64>,
    pub time_until_unlock: Option<u64>,
    pub can_withdraw: Option<bool>,
    pub token_balance: Option<U256>,
    pub token_allowance: Option<U256>,
}

/// Partial update of [ProtocolSnapshot].
#[derive(Debug, Clone, Default)]
pub struct ProtocolUpdate {
    pub apr: Option<U256>,
    pub current_reward_rate: Option<U256>,
    pub total_staked: Option<U256>,
    pub total_rewards: Option<U256>,
    pub min_lock_duration: Option<u64>,
    pub emergency_withdraw_penalty: Option<U256>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StoreState {
    user: UserStakingSnapshot,
    protocol: ProtocolSnapshot,
}

/// Handle to the store. Cheap to clone; every clone points at the same
/// state. Tests construct independent instances per case.
#[derive(Clone, Debug, Default)]
pub struct SnapshotLock {
    state: Arc<RwLock<StoreState>>,
}

impl SnapshotLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of both snapshots, taken under one read guard.
    pub fn snapshot(&self) -> Result<(UserStakingSnapshot, ProtocolSnapshot), StoreErr> {
        let state = self.state.read().map_err(|_| StoreErr::LockFailed)?;
        Ok((state.user.clone(), state.protocol.clone()))
    }

    pub fn user(&self) -> Result<UserStakingSnapshot, StoreErr> {
        Ok(self.snapshot()?.0)
    }

    pub fn protocol(&self) -> Result<ProtocolSnapshot, StoreErr> {
        Ok(self.snapshot()?.1)
    }

    /// Merge a partial user update. Fields absent from the partial keep
    /// their current value.
    pub fn apply_user_update(&self, update: UserUpdate) -> Result<(), StoreErr> {
        let mut state = self.state.write().map_err(|_| StoreErr::LockFailed)?;
        let user = &mut state.user;
        if let Some(v) = update.staked_balance {
            user.staked_balance = v;
        }
        if let Some(v) = update.pending_rewards {
            user.pending_rewards = v;
        }
        if let Some(v) = update.last_stake_timestamp {
            user.last_stake_timestamp = v;
        }
        if let Some(v) = update.time_until_unlock {
            user.time_until_unlock = v;
        }
        if let Some(v) = update.can_withdraw {
            user.can_withdraw = v;
        }
        if let Some(v) = update.token_balance {
            user.token_balance = v;
        }
        if let Some(v) = update.token_allowance {
            user.token_allowance = v;
        }
        // invariant: an empty stake is never withdrawable
        if user.staked_balance.is_zero() {
            user.can_withdraw = false;
        }
        Ok(())
    }

    /// Merge a partial protocol update, atomically as a unit.
    pub fn apply_protocol_update(&self, update: ProtocolUpdate) -> Result<(), StoreErr> {
        let mut state = self.state.write().map_err(|_| StoreErr::LockFailed)?;
        let protocol = &mut state.protocol;
        if let Some(v) = update.apr {
            protocol.apr = v;
        }
        if let Some(v) = update.current_reward_rate {
            protocol.current_reward_rate = v;
        }
        if let Some(v) = update.total_staked {
            protocol.total_staked = v;
        }
        if let Some(v) = update.total_rewards {
            protocol.total_rewards = v;
        }
        if let Some(v) = update.min_lock_duration {
            protocol.min_lock_duration = v;
        }
        if let Some(v) = update.emergency_withdraw_penalty {
            protocol.emergency_withdraw_penalty = v;
        }
        Ok(())
    }

    /// Return both snapshots to zero defaults. Called on disconnect and on
    /// account change, so no stale balances leak across addresses.
    pub fn reset(&self) -> Result<(), StoreErr> {
        let mut state = self.state.write().map_err(|_| StoreErr::LockFailed)?;
        *state = StoreState::default();
        Ok(())
    }
}
