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

//! Derived staking fields, computed locally from raw contract values plus
//! wall-clock time.
//!
//! Everything here is a pure function over unsigned integers. Token amounts
//! stay in 18-decimal base units and all division floors, matching the
//! contract's arithmetic; callers format to decimal strings only at the
//! display boundary.

use alloy::primitives::U256;

/// Seconds per year times 100, the denominator of the APR formula.
const APR_DENOMINATOR: u64 = 365 * 24 * 3600 * 100;

/// Seconds remaining until the stake unlocks.
///
/// The contract's own `getTimeUntilUnlock` value wins when it is positive,
/// since it reflects contract-internal state the local formula cannot see.
/// The exception is `lock_duration == 0`: then the accessor is the only
/// source of truth and its value is taken even when zero.
pub fn time_until_unlock(
    last_stake_timestamp: u64,
    lock_duration: u64,
    now: u64,
    contract_value: u64,
) -> u64 {
    if lock_duration == 0 || contract_value > 0 {
        return contract_value;
    }
    (last_stake_timestamp + lock_duration).saturating_sub(now)
}

/// Whether a withdraw would pass the lock check.
///
/// The contract flag is OR'd with the local time computation, but the result
/// is gated on a nonzero stake: an account with nothing staked can never
/// withdraw, whatever the flag claims.
pub fn can_withdraw(contract_flag: bool, time_until_unlock: u64, staked: U256) -> bool {
    if staked.is_zero() {
        return false;
    }
    contract_flag || time_until_unlock == 0
}

/// Rewards accrued by `staked` at `apr` percent over `elapsed` seconds.
///
/// Display fallback only, used when the contract's cumulative total reads
/// zero. Never feeds a transaction.
pub fn estimated_rewards(staked: U256, apr: U256, elapsed: u64) -> U256 {
    staked
        .checked_mul(apr)
        .and_then(|v| v.checked_mul(U256::from(elapsed)))
        .map(|v| v / U256::from(APR_DENOMINATOR))
        .unwrap_or(U256::MAX)
}

/// Split of an emergency withdrawal into penalty and payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyWithdrawBreakdown {
    pub penalty: U256,
    pub received: U256,
}

/// Penalty is floored the way the contract floors it, so
/// `penalty + received == staked` holds exactly.
pub fn emergency_withdraw_breakdown(
    staked: U256,
    penalty_percent: U256,
) -> EmergencyWithdrawBreakdown {
    let penalty = staked * penalty_percent / U256::from(100u64);
    EmergencyWithdrawBreakdown { penalty, received: staked - penalty }
}

/// Staked share of `total`, in basis points. Zero when nothing is staked
/// pool-wide.
pub fn stake_share_bps(staked: U256, total: U256) -> u64 {
    if total.is_zero() {
        return 0;
    }
    let bps = staked.saturating_mul(U256::from(10_000u64)) / total;
    bps.try_into().unwrap_or(u64::MAX)
}
