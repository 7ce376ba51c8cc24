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

//! Session lifecycle: connect, account switch, teardown.
//!
//! A connected session owns the store and the three background services
//! (chain head, event monitor, poll refresher), each running under its own
//! supervisor on a child cancellation token. Disconnecting cancels the
//! child token, waits for the services to drain and resets the store, so
//! no balances leak from one account to the next.

use std::sync::Arc;

use alloy::{
    network::Ethereum,
    primitives::{Address, U256},
    providers::Provider,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    chain_monitor::ChainHeadService,
    config::{ConfigErr, ConfigLock},
    errors::CodedError,
    event_monitor::EventMonitor,
    impl_coded_debug,
    orchestrator::{Notifier, Orchestrator, StakingWriter},
    reader::{ChainReader, RawUserDetails, ReaderErr},
    refresher::PollRefresher,
    snapshot::{SnapshotLock, StoreErr, UserUpdate},
    task::{RetryPolicy, RetryTask, Supervisor},
};

#[derive(Error)]
pub enum SessionErr {
    #[error("{code} No account connected", code = self.code())]
    NotConnected,

    #[error("{code} {0}", code = self.code())]
    ReaderErr(#[from] ReaderErr),

    #[error("{code} {0}", code = self.code())]
    ConfigErr(#[from] ConfigErr),

    #[error("{code} {0}", code = self.code())]
    StoreErr(#[from] StoreErr),
}

impl_coded_debug!(SessionErr);

impl CodedError for SessionErr {
    fn code(&self) -> &str {
        match self {
            SessionErr::NotConnected => "[SS-SN-801]",
            SessionErr::ReaderErr(_) => "[SS-SN-802]",
            SessionErr::ConfigErr(_) => "[SS-SN-803]",
            SessionErr::StoreErr(_) => "[SS-SN-804]",
        }
    }
}

struct ActiveConnection<P> {
    user: Address,
    reader: Arc<ChainReader<P>>,
    cancel_token: CancellationToken,
    services: Vec<JoinHandle<()>>,
}

/// One staking session per wallet connection.
pub struct StakingSession<P> {
    provider: Arc<P>,
    config: ConfigLock,
    store: SnapshotLock,
    notifier: Arc<dyn Notifier>,
    cancel_token: CancellationToken,
    active: Option<ActiveConnection<P>>,
}

impl<P> StakingSession<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    /// `cancel_token` is the application-level token; each connection runs
    /// on a child of it so an account switch never tears down the caller.
    pub fn new(
        provider: Arc<P>,
        config: ConfigLock,
        notifier: Arc<dyn Notifier>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            provider,
            config,
            store: SnapshotLock::new(),
            notifier,
            cancel_token,
            active: None,
        }
    }

    pub fn store(&self) -> &SnapshotLock {
        &self.store
    }

    pub fn connected_account(&self) -> Option<Address> {
        self.active.as_ref().map(|conn| conn.user)
    }

    /// Connects an account: verifies the pool deployment, populates the
    /// store and starts the background services.
    pub async fn connect(&mut self, user: Address) -> Result<(), SessionErr> {
        if self.active.is_some() {
            self.disconnect().await?;
        }

        let (staking_addr, token_fallback) = {
            let config = self.config.lock_all()?;
            (config.chain.staking_address, config.chain.token_address_fallback)
        };

        let reader = Arc::new(
            ChainReader::resolve(self.provider.clone(), staking_addr, token_fallback).await?,
        );

        // protocol fields first; the user derivation needs min_lock_duration
        self.store.apply_protocol_update(reader.load_protocol().await)?;
        // data reads degrade to zero defaults; the poller and event monitor
        // fill the store in once the chain answers again
        let raw = match reader.load_user(user).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!("User details unavailable at connect, starting from zero: {err:?}");
                RawUserDetails::default()
            }
        };
        reader.apply_user_details(&self.store, &raw)?;
        let (balance, allowance) =
            match tokio::try_join!(reader.token_balance(user), reader.token_allowance(user)) {
                Ok(vals) => vals,
                Err(err) => {
                    tracing::warn!(
                        "Token balance unavailable at connect, starting from zero: {err:?}"
                    );
                    (U256::ZERO, U256::ZERO)
                }
            };
        self.store.apply_user_update(UserUpdate {
            token_balance: Some(balance),
            token_allowance: Some(allowance),
            ..Default::default()
        })?;

        let cancel_token = self.cancel_token.child_token();
        let chain_head = ChainHeadService::new(self.provider.clone(), self.config.clone());
        let event_monitor = EventMonitor::new(
            self.provider.clone(),
            self.config.clone(),
            self.store.clone(),
            chain_head.clone(),
            self.notifier.clone(),
            staking_addr,
            user,
        );
        let poll_refresher = PollRefresher::new(
            reader.clone(),
            self.config.clone(),
            self.store.clone(),
            user,
        );

        let services = vec![
            spawn_supervised("chain head", chain_head, cancel_token.clone()),
            spawn_supervised("event monitor", event_monitor, cancel_token.clone()),
            spawn_supervised("poll refresher", poll_refresher, cancel_token.clone()),
        ];

        tracing::info!("Session connected for {user}");
        self.active = Some(ActiveConnection { user, reader, cancel_token, services });
        Ok(())
    }

    /// Stops the background services and clears the store. Idempotent.
    pub async fn disconnect(&mut self) -> Result<(), SessionErr> {
        let Some(conn) = self.active.take() else {
            return Ok(());
        };

        conn.cancel_token.cancel();
        for handle in conn.services {
            if let Err(err) = handle.await {
                tracing::warn!("Service join failed during disconnect: {err:?}");
            }
        }
        self.store.reset()?;
        tracing::info!("Session disconnected for {}", conn.user);
        Ok(())
    }

    /// Tears down the current connection and brings up a fresh one for the
    /// new account.
    pub async fn switch_account(&mut self, user: Address) -> Result<(), SessionErr> {
        self.disconnect().await?;
        self.connect(user).await
    }

    /// Builds a transaction orchestrator bound to the connected account.
    /// The connection's reader doubles as the post-action refresher.
    pub fn orchestrator(&self, writer: Arc<dyn StakingWriter>) -> Result<Orchestrator, SessionErr> {
        let conn = self.active.as_ref().ok_or(SessionErr::NotConnected)?;
        let settle_delay = {
            let config = self.config.lock_all()?;
            std::time::Duration::from_millis(config.sync.settle_delay_ms)
        };
        Ok(Orchestrator::new(
            self.store.clone(),
            writer,
            conn.reader.clone(),
            self.notifier.clone(),
            conn.user,
            settle_delay,
            conn.cancel_token.clone(),
        ))
    }
}

fn spawn_supervised<T>(name: &'static str, task: T, cancel_token: CancellationToken) -> JoinHandle<()>
where
    T: RetryTask + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let supervisor = Supervisor::new(Arc::new(task), cancel_token)
            .with_retry_policy(RetryPolicy::CRITICAL_SERVICE);
        if let Err(err) = supervisor.run().await {
            tracing::error!("Service `{name}` exited: {err:?}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ChainConfig, Config, SyncConfig},
        contracts::IStakingPool,
        orchestrator::TracingNotifier,
        snapshot::{ProtocolSnapshot, UserStakingSnapshot},
    };
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

    fn test_session(
        asserter: &Asserter,
    ) -> StakingSession<impl Provider<Ethereum> + Clone + 'static> {
        let provider = Arc::new(ProviderBuilder::new().connect_mocked_client(asserter.clone()));
        StakingSession::new(
            provider,
            test_config(),
            Arc::new(TracingNotifier),
            CancellationToken::new(),
        )
    }

    /// Queues the full set of connect-time reads, in request order.
    fn queue_connect_reads(asserter: &Asserter, staked: u64, balance: u64) {
        asserter.push_success(&Bytes::from(vec![0x60, 0x80, 0x60, 0x40])); // getCode
        asserter.push_success(&encoded(Address::repeat_byte(0xbb))); // stakingToken
        asserter.push_success(&encoded(U256::from(10u64))); // initialApr
        asserter.push_success(&encoded(U256::from(850u64))); // currentRewardRate
        asserter.push_success(&encoded(e18(1000))); // totalStaked
        asserter.push_success(&encoded(e18(12))); // getTotalRewards
        asserter.push_success(&encoded(U256::from(3600u64))); // minLockDuration
        asserter.push_success(&encoded(U256::from(30u64))); // emergencyWithdrawPenalty
        asserter.push_success(&encoded(IStakingPool::UserDetails {
            stakedAmount: e18(staked),
            lastStakeTimestamp: U256::from(1_700_000_000u64),
            pendingRewards: e18(1),
            timeUntilUnlock: U256::ZERO,
            canWithdraw: staked > 0,
        })); // getUserDetails
        asserter.push_success(&encoded(e18(balance))); // balanceOf
        asserter.push_success(&encoded(e18(balance))); // allowance
    }

    #[tokio::test]
    #[traced_test]
    async fn connect_populates_and_disconnect_resets() {
        let asserter = Asserter::new();
        let mut session = test_session(&asserter);
        let user = Address::repeat_byte(0x11);

        queue_connect_reads(&asserter, 50, 500);
        session.connect(user).await.unwrap();

        assert_eq!(session.connected_account(), Some(user));
        let (user_snap, protocol) = session.store().snapshot().unwrap();
        assert_eq!(user_snap.staked_balance, e18(50));
        assert_eq!(user_snap.pending_rewards, e18(1));
        assert_eq!(user_snap.token_balance, e18(500));
        assert_eq!(user_snap.token_allowance, e18(500));
        assert!(user_snap.can_withdraw);
        assert_eq!(protocol.total_staked, e18(1000));
        assert_eq!(protocol.min_lock_duration, 3600);
        assert_eq!(protocol.emergency_withdraw_penalty, U256::from(30u64));

        session.disconnect().await.unwrap();

        assert_eq!(session.connected_account(), None);
        let (user_snap, protocol) = session.store().snapshot().unwrap();
        assert_eq!(user_snap, UserStakingSnapshot::default());
        assert_eq!(protocol, ProtocolSnapshot::default());
    }

    #[tokio::test]
    #[traced_test]
    async fn disconnect_without_connect_is_a_noop() {
        let asserter = Asserter::new();
        let mut session = test_session(&asserter);

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.connected_account(), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn switch_account_never_leaks_balances() {
        let asserter = Asserter::new();
        let mut session = test_session(&asserter);

        queue_connect_reads(&asserter, 50, 500);
        session.connect(Address::repeat_byte(0x11)).await.unwrap();
        assert_eq!(session.store().user().unwrap().staked_balance, e18(50));

        queue_connect_reads(&asserter, 7, 40);
        session.switch_account(Address::repeat_byte(0x22)).await.unwrap();

        assert_eq!(session.connected_account(), Some(Address::repeat_byte(0x22)));
        let user_snap = session.store().user().unwrap();
        assert_eq!(user_snap.staked_balance, e18(7));
        assert_eq!(user_snap.token_balance, e18(40));
        assert_eq!(user_snap.pending_rewards, e18(1));
    }

    #[tokio::test]
    #[traced_test]
    async fn connect_fails_without_deployed_contract() {
        let asserter = Asserter::new();
        let mut session = test_session(&asserter);

        asserter.push_success(&Bytes::new()); // empty bytecode

        let res = session.connect(Address::repeat_byte(0x11)).await;
        assert!(matches!(res, Err(SessionErr::ReaderErr(ReaderErr::NotDeployed(_)))));
        assert_eq!(session.connected_account(), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn connect_degrades_failed_user_reads_to_zero() {
        let asserter = Asserter::new();
        let mut session = test_session(&asserter);
        let user = Address::repeat_byte(0x11);

        asserter.push_success(&Bytes::from(vec![0x60, 0x80])); // getCode
        asserter.push_success(&encoded(Address::repeat_byte(0xbb))); // stakingToken
        asserter.push_success(&encoded(U256::from(10u64))); // initialApr
        asserter.push_success(&encoded(U256::from(850u64))); // currentRewardRate
        asserter.push_success(&encoded(e18(1000))); // totalStaked
        asserter.push_success(&encoded(e18(12))); // getTotalRewards
        asserter.push_success(&encoded(U256::from(3600u64))); // minLockDuration
        asserter.push_success(&encoded(U256::from(30u64))); // emergencyWithdrawPenalty
        asserter.push_failure_msg("execution reverted"); // getUserDetails
        asserter.push_failure_msg("execution reverted"); // userInfo
        asserter.push_success(&encoded(e18(500))); // balanceOf
        asserter.push_success(&encoded(e18(500))); // allowance

        session.connect(user).await.unwrap();

        assert_eq!(session.connected_account(), Some(user));
        let (user_snap, protocol) = session.store().snapshot().unwrap();
        assert_eq!(user_snap.staked_balance, U256::ZERO);
        assert!(!user_snap.can_withdraw);
        assert_eq!(user_snap.token_balance, e18(500));
        // the protocol view is still live
        assert_eq!(protocol.total_staked, e18(1000));
    }

    #[tokio::test]
    #[traced_test]
    async fn orchestrator_requires_a_connection() {
        let asserter = Asserter::new();
        let session = test_session(&asserter);

        struct NoWriter;
        #[async_trait::async_trait]
        impl crate::orchestrator::StakingWriter for NoWriter {
            async fn submit(
                &self,
                _kind: crate::orchestrator::ActionKind,
                _amount: Option<U256>,
            ) -> Result<alloy::primitives::TxHash, crate::orchestrator::SubmitErr> {
                unimplemented!("never submitted")
            }
            async fn confirm(
                &self,
                _tx_hash: alloy::primitives::TxHash,
            ) -> Result<(), crate::orchestrator::ConfirmErr> {
                unimplemented!("never confirmed")
            }
        }

        let res = session.orchestrator(Arc::new(NoWriter));
        assert!(matches!(res, Err(SessionErr::NotConnected)));
    }
}
