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

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use alloy::{network::Ethereum, providers::Provider};
use anyhow::Context;
use thiserror::Error;

use crate::{
    config::ConfigLock,
    errors::CodedError,
    impl_coded_debug,
    task::{RetryRes, RetryTask, SupervisorErr},
};

#[derive(Error)]
pub enum ChainHeadErr {
    #[error("{code} Failed to query block number: {0:#}", code = self.code())]
    BlockQueryFailed(anyhow::Error),

    #[error("{code} Unexpected error: {0:#}", code = self.code())]
    UnexpectedErr(#[from] anyhow::Error),
}

impl_coded_debug!(ChainHeadErr);

impl CodedError for ChainHeadErr {
    fn code(&self) -> &str {
        match self {
            ChainHeadErr::BlockQueryFailed(_) => "[SS-CH-501]",
            ChainHeadErr::UnexpectedErr(_) => "[SS-CH-500]",
        }
    }
}

/// Caches the chain head so concurrent callers share at most one
/// `eth_blockNumber` query per poll period.
#[derive(Clone)]
pub struct ChainHeadService<P> {
    provider: Arc<P>,
    config: ConfigLock,
    block_number: watch::Sender<u64>,
    update_notifier: Arc<Notify>,
    next_update: Arc<RwLock<Instant>>,
}

impl<P> ChainHeadService<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub fn new(provider: Arc<P>, config: ConfigLock) -> Self {
        let (block_number, _) = watch::channel(0);

        Self {
            provider,
            config,
            block_number,
            update_notifier: Arc::new(Notify::new()),
            next_update: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Returns the latest block number, triggering an update if enough time has passed
    pub async fn current_block_number(&self) -> Result<u64, ChainHeadErr> {
        if Instant::now() > *self.next_update.read().await {
            let mut rx = self.block_number.subscribe();
            self.update_notifier.notify_one();
            rx.changed()
                .await
                .context("failed to query block number from chain head service")
                .map_err(ChainHeadErr::BlockQueryFailed)?;
            let block_number = *rx.borrow();
            Ok(block_number)
        } else {
            Ok(*self.block_number.borrow())
        }
    }
}

impl<P> RetryTask for ChainHeadService<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    type Error = ChainHeadErr;

    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
        let self_clone = self.clone();

        Box::pin(async move {
            tracing::info!("Starting chain head service");
            let poll_ms = {
                let config = self_clone
                    .config
                    .lock_all()
                    .context("Failed to lock config")
                    .map_err(|err| SupervisorErr::Fault(ChainHeadErr::UnexpectedErr(err)))?;
                config.sync.block_poll_ms
            };

            loop {
                tokio::select! {
                    // shutdown wins over a pending update request
                    biased;
                    _ = cancel_token.cancelled() => return Ok(()),
                    _ = self_clone.update_notifier.notified() => {}
                }
                // Needs update, lock next update value to avoid unnecessary notifications.
                let mut next_update = self_clone.next_update.write().await;

                let block_number = self_clone
                    .provider
                    .get_block_number()
                    .await
                    .context("Failed to get block number")
                    .map_err(|err| SupervisorErr::Recover(ChainHeadErr::BlockQueryFailed(err)))?;
                let _ = self_clone.block_number.send_replace(block_number);

                // Set timestamp for next update
                *next_update = Instant::now() + Duration::from_millis(poll_ms);
            }
        })
    }
}
