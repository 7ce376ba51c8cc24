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

//! Periodic refresh of the volatile fields: pending rewards, pool total
//! and cumulative rewards.
//!
//! Events cover discrete state changes; continuous accrual only shows up
//! by re-reading. A failed tick logs a warning and leaves the store on its
//! last-known-good values rather than surfacing an error for a transient
//! RPC problem.

use std::sync::Arc;

use alloy::{network::Ethereum, primitives::Address, providers::Provider};
use anyhow::Context;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigLock,
    derived,
    errors::CodedError,
    impl_coded_debug,
    reader::{ChainReader, ESTIMATION_WINDOW_SECS},
    snapshot::{ProtocolUpdate, SnapshotLock, StoreErr, UserUpdate},
    task::{RetryRes, RetryTask, SupervisorErr},
};

#[derive(Error)]
pub enum RefresherErr {
    #[error("{code} Snapshot store unavailable: {0}", code = self.code())]
    StoreErr(#[from] StoreErr),

    #[error("{code} Unexpected error: {0:#}", code = self.code())]
    UnexpectedErr(#[from] anyhow::Error),
}

impl_coded_debug!(RefresherErr);

impl CodedError for RefresherErr {
    fn code(&self) -> &str {
        match self {
            RefresherErr::StoreErr(_) => "[SS-RF-701]",
            RefresherErr::UnexpectedErr(_) => "[SS-RF-700]",
        }
    }
}

#[derive(Clone)]
pub struct PollRefresher<P> {
    reader: Arc<ChainReader<P>>,
    config: ConfigLock,
    store: SnapshotLock,
    user: Address,
}

impl<P> PollRefresher<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub fn new(
        reader: Arc<ChainReader<P>>,
        config: ConfigLock,
        store: SnapshotLock,
        user: Address,
    ) -> Self {
        Self { reader, config, store, user }
    }

    /// One refresh tick: the three continuously accruing fields, nothing
    /// else. Lock state is only derived from contract reads (connect,
    /// post-action refresh) and events, never from a stale local
    /// timestamp — a stake observed only through an event must stay locked
    /// until a real re-read says otherwise.
    async fn tick(&self) -> Result<(), RefresherErr> {
        let (pending, total_staked, total_rewards) = match tokio::try_join!(
            self.reader.pending_rewards(self.user),
            self.reader.total_staked(),
            self.reader.total_rewards(),
        ) {
            Ok(vals) => vals,
            Err(err) => {
                tracing::warn!("Refresh tick failed, keeping last-known values: {err:?}");
                return Ok(());
            }
        };

        let total_rewards = if total_rewards.is_zero() {
            let apr = self.store.protocol()?.apr;
            derived::estimated_rewards(total_staked, apr, ESTIMATION_WINDOW_SECS)
        } else {
            total_rewards
        };

        self.store.apply_protocol_update(ProtocolUpdate {
            total_staked: Some(total_staked),
            total_rewards: Some(total_rewards),
            ..Default::default()
        })?;
        self.store.apply_user_update(UserUpdate {
            pending_rewards: Some(pending),
            ..Default::default()
        })?;

        Ok(())
    }
}

impl<P> RetryTask for PollRefresher<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    type Error = RefresherErr;

    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
        let refresher = self.clone();

        Box::pin(async move {
            let period = {
                let config = refresher
                    .config
                    .lock_all()
                    .context("Failed to lock config")
                    .map_err(|err| SupervisorErr::Fault(RefresherErr::UnexpectedErr(err)))?;
                config.sync.refresh_interval()
            };
            tracing::info!("Starting poll refresher, period {period:?}");

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    // shutdown wins over a due tick
                    biased;
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Poll refresher received cancellation");
                        return Ok(());
                    }
                    _ = interval.tick() => {
                        refresher.tick().await.map_err(SupervisorErr::Recover)?;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, Config, SyncConfig};
    use alloy::{
        primitives::{Bytes, U256},
        providers::{mock::Asserter, ProviderBuilder},
        sol_types::SolValue,
    };
    use tracing_test::traced_test;

    fn e18(value: u64) -> U256 {
        U256::from(value) * U256::from(10u64).pow(U256::from(18u64))
    }

    fn encoded<T: SolValue>(value: T) -> Bytes {
        value.abi_encode().into()
    }

    fn test_config() -> ConfigLock {
        ConfigLock::from_config(Config {
            chain: ChainConfig {
                staking_address: Address::repeat_byte(0xaa),
                token_address_fallback: Address::repeat_byte(0xbb),
            },
            sync: SyncConfig::default(),
        })
    }

    fn mocked_refresher(asserter: &Asserter, store: &SnapshotLock) -> PollRefresher<impl Provider<Ethereum> + Clone + 'static> {
        let provider = Arc::new(ProviderBuilder::new().connect_mocked_client(asserter.clone()));
        let reader = Arc::new(ChainReader::new(
            provider,
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
        ));
        PollRefresher::new(reader, test_config(), store.clone(), Address::repeat_byte(0x11))
    }

    #[tokio::test]
    #[traced_test]
    async fn tick_updates_only_volatile_fields() {
        let store = SnapshotLock::new();
        store
            .apply_protocol_update(ProtocolUpdate {
                apr: Some(U256::from(10u64)),
                min_lock_duration: Some(3600),
                ..Default::default()
            })
            .unwrap();
        // a stake observed only through an event: the local timestamp is
        // long stale, but the contract still enforces the lock
        store
            .apply_user_update(UserUpdate {
                staked_balance: Some(e18(100)),
                last_stake_timestamp: Some(1),
                time_until_unlock: Some(3600),
                can_withdraw: Some(false),
                ..Default::default()
            })
            .unwrap();

        let asserter = Asserter::new();
        let refresher = mocked_refresher(&asserter, &store);
        asserter.push_success(&encoded(e18(2))); // getPendingRewards
        asserter.push_success(&encoded(e18(500))); // totalStaked
        asserter.push_success(&encoded(e18(9))); // getTotalRewards

        refresher.tick().await.unwrap();

        let (user, protocol) = store.snapshot().unwrap();
        assert_eq!(user.pending_rewards, e18(2));
        assert_eq!(protocol.total_staked, e18(500));
        assert_eq!(protocol.total_rewards, e18(9));
        // lock state is untouched until a real contract re-read
        assert!(!user.can_withdraw);
        assert_eq!(user.time_until_unlock, 3600);
        assert_eq!(user.staked_balance, e18(100));
    }

    #[tokio::test]
    #[traced_test]
    async fn tick_estimates_rewards_when_cumulative_is_zero() {
        let store = SnapshotLock::new();
        store
            .apply_protocol_update(ProtocolUpdate {
                apr: Some(U256::from(10u64)),
                ..Default::default()
            })
            .unwrap();

        let asserter = Asserter::new();
        let refresher = mocked_refresher(&asserter, &store);
        asserter.push_success(&encoded(U256::ZERO)); // getPendingRewards
        asserter.push_success(&encoded(e18(1000))); // totalStaked
        asserter.push_success(&encoded(U256::ZERO)); // getTotalRewards unset

        refresher.tick().await.unwrap();

        let expected =
            derived::estimated_rewards(e18(1000), U256::from(10u64), ESTIMATION_WINDOW_SECS);
        assert_eq!(store.protocol().unwrap().total_rewards, expected);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_tick_keeps_last_known_values() {
        let store = SnapshotLock::new();
        store
            .apply_user_update(UserUpdate {
                pending_rewards: Some(e18(4)),
                ..Default::default()
            })
            .unwrap();

        let asserter = Asserter::new();
        let refresher = mocked_refresher(&asserter, &store);
        // nothing queued: every read fails

        refresher.tick().await.unwrap();

        assert_eq!(store.user().unwrap().pending_rewards, e18(4));
    }
}
