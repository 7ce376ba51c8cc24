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

//! Transaction orchestration: validate, submit, confirm, refresh.
//!
//! Each action runs through an explicit state machine
//! `Idle → Validating → Submitted → Confirming → {Confirmed, Failed}`.
//! Validation works entirely against the current store snapshot, so a
//! failing precondition never costs a chain call. Chain access sits behind
//! [StakingWriter] and [StoreRefresher] so the machine is testable with
//! fakes. Every failure is recovered here and surfaced through the
//! [Notifier]; nothing propagates to the store or the UI layer as an
//! unhandled error.
//!
//! Approve and Stake are not auto-chained: the caller sequences them and
//! Stake's allowance check is what enforces the ordering.

use std::sync::Arc;
use std::time::Duration;

use alloy::{
    network::Ethereum,
    primitives::{
        utils::{format_ether, parse_ether},
        Address, TxHash, U256,
    },
    providers::{Provider, WalletProvider},
};
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    contracts::{IStakingPool, IERC20},
    errors::CodedError,
    impl_coded_debug,
    snapshot::SnapshotLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Approve,
    Stake,
    Withdraw,
    Claim,
    EmergencyWithdraw,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionKind::Approve => "approve",
            ActionKind::Stake => "stake",
            ActionKind::Withdraw => "withdraw",
            ActionKind::Claim => "claim",
            ActionKind::EmergencyWithdraw => "emergency withdraw",
        };
        write!(f, "{name}")
    }
}

impl ActionKind {
    fn requires_amount(&self) -> bool {
        matches!(self, ActionKind::Approve | ActionKind::Stake | ActionKind::Withdraw)
    }
}

/// States of the per-action machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPhase {
    Idle,
    Validating,
    Submitted,
    Confirming,
    Confirmed,
    Failed(RevertClass),
}

/// Coarse status as consumers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One in-flight transaction. Ephemeral; exists only for the duration of
/// the action's lifecycle and is never persisted.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub amount: Option<U256>,
    pub submitted_hash: Option<TxHash>,
    pub phase: ActionPhase,
}

impl PendingAction {
    fn new(kind: ActionKind) -> Self {
        Self { kind, amount: None, submitted_hash: None, phase: ActionPhase::Idle }
    }

    pub fn status(&self) -> ActionStatus {
        match self.phase {
            ActionPhase::Confirmed => ActionStatus::Confirmed,
            ActionPhase::Failed(_) => ActionStatus::Failed,
            _ => ActionStatus::Pending,
        }
    }
}

/// Failure classes derived from matching known substrings in the
/// underlying failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertClass {
    Paused,
    InsufficientBalance,
    TransferFailed,
    StillLocked,
    UserRejected,
    Validation,
    Unknown,
}

impl RevertClass {
    pub fn from_message(message: &str) -> Self {
        if message.contains("EnforcedPause") {
            RevertClass::Paused
        } else if message.contains("Insufficient balance") {
            RevertClass::InsufficientBalance
        } else if message.contains("Transfer failed") {
            RevertClass::TransferFailed
        } else if message.contains("Lock duration") {
            RevertClass::StillLocked
        } else if message.contains("user rejected") {
            RevertClass::UserRejected
        } else {
            RevertClass::Unknown
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            RevertClass::Paused => "Staking is currently paused",
            RevertClass::InsufficientBalance => "Insufficient token balance",
            RevertClass::TransferFailed => "Token transfer failed - check allowance",
            RevertClass::StillLocked => "Previous stake still locked",
            RevertClass::UserRejected => "Transaction rejected by user",
            RevertClass::Validation => "Action failed local validation",
            RevertClass::Unknown => "Transaction failed",
        }
    }
}

#[derive(Error)]
pub enum ValidationErr {
    #[error("{code} Invalid amount: {0}", code = self.code())]
    InvalidAmount(String),

    #[error("{code} Insufficient token balance", code = self.code())]
    InsufficientBalance,

    #[error("{code} Allowance too low, approve first", code = self.code())]
    AllowanceTooLow,

    #[error("{code} Lock duration not met, {0}s until unlock", code = self.code())]
    StillLocked(u64),

    #[error("{code} Snapshot store unavailable: {0}", code = self.code())]
    StoreErr(#[from] crate::snapshot::StoreErr),
}

impl_coded_debug!(ValidationErr);

impl CodedError for ValidationErr {
    fn code(&self) -> &str {
        match self {
            ValidationErr::InvalidAmount(_) => "[SS-TX-601]",
            ValidationErr::InsufficientBalance => "[SS-TX-602]",
            ValidationErr::AllowanceTooLow => "[SS-TX-603]",
            ValidationErr::StillLocked(_) => "[SS-TX-604]",
            ValidationErr::StoreErr(_) => "[SS-TX-605]",
        }
    }
}

#[derive(Error, Debug)]
#[error("submission failed: {message}")]
pub struct SubmitErr {
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ConfirmErr {
    #[error("transaction reverted: {message}")]
    Reverted { message: String },

    #[error("timed out waiting for receipt of {0}")]
    Timeout(TxHash),

    #[error("receipt wait failed: {message}")]
    ReceiptErr { message: String },
}

impl ConfirmErr {
    fn message(&self) -> String {
        match self {
            ConfirmErr::Reverted { message } => message.clone(),
            ConfirmErr::Timeout(hash) => format!("timed out waiting for {hash}"),
            ConfirmErr::ReceiptErr { message } => message.clone(),
        }
    }
}

/// The signed-write half of the chain interface. Implemented for a wallet
/// provider in production and by fakes in tests.
#[async_trait]
pub trait StakingWriter: Send + Sync {
    /// Sends the signed transaction for the action; returns its hash.
    async fn submit(&self, kind: ActionKind, amount: Option<U256>) -> Result<TxHash, SubmitErr>;

    /// Waits for the transaction to be mined, failing on revert.
    async fn confirm(&self, tx_hash: TxHash) -> Result<(), ConfirmErr>;
}

/// The batched re-read performed after a confirmed action.
#[async_trait]
pub trait StoreRefresher: Send + Sync {
    async fn refresh_after_action(
        &self,
        store: &SnapshotLock,
        user: Address,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Sink for user-facing notifications. The presentation layer supplies its
/// own; the default logs through tracing.
pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str, detail: &str);
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, message: &str, detail: &str) {
        match severity {
            Severity::Info => tracing::info!("{message}: {detail}"),
            Severity::Success => tracing::info!("{message}: {detail}"),
            Severity::Warning => tracing::warn!("{message}: {detail}"),
            Severity::Error => tracing::error!("{message}: {detail}"),
        }
    }
}

/// Alloy-backed [StakingWriter] over a wallet provider.
#[derive(Clone)]
pub struct PoolWriter<P> {
    provider: Arc<P>,
    staking_addr: Address,
    token_addr: Address,
    txn_timeout: Duration,
    receipt_poll: Duration,
}

impl<P> PoolWriter<P>
where
    P: Provider<Ethereum> + WalletProvider + 'static + Clone,
{
    pub fn new(
        provider: Arc<P>,
        staking_addr: Address,
        token_addr: Address,
        txn_timeout: Duration,
        receipt_poll: Duration,
    ) -> Self {
        Self { provider, staking_addr, token_addr, txn_timeout, receipt_poll }
    }
}

#[async_trait]
impl<P> StakingWriter for PoolWriter<P>
where
    P: Provider<Ethereum> + WalletProvider + 'static + Clone,
{
    async fn submit(&self, kind: ActionKind, amount: Option<U256>) -> Result<TxHash, SubmitErr> {
        let pool = IStakingPool::new(self.staking_addr, self.provider.clone());
        let amount = amount.unwrap_or_default();
        let pending = match kind {
            ActionKind::Approve => {
                let token = IERC20::new(self.token_addr, self.provider.clone());
                token.approve(self.staking_addr, amount).send().await
            }
            ActionKind::Stake => pool.stake(amount).send().await,
            ActionKind::Withdraw => pool.withdraw(amount).send().await,
            ActionKind::Claim => pool.claimRewards().send().await,
            ActionKind::EmergencyWithdraw => pool.emergencyWithdraw().send().await,
        }
        .map_err(|err| SubmitErr { message: format!("{err:#}") })?;

        Ok(*pending.tx_hash())
    }

    async fn confirm(&self, tx_hash: TxHash) -> Result<(), ConfirmErr> {
        let deadline = tokio::time::Instant::now() + self.txn_timeout;
        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status() {
                        return Ok(());
                    }
                    return Err(ConfirmErr::Reverted {
                        message: format!("transaction {tx_hash} reverted"),
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    // transient RPC failures are retried until the deadline
                    tracing::debug!("Receipt query for {tx_hash} failed: {err:?}");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConfirmErr::Timeout(tx_hash));
            }
            tokio::time::sleep(self.receipt_poll).await;
        }
    }
}

pub struct Orchestrator {
    store: SnapshotLock,
    writer: Arc<dyn StakingWriter>,
    refresher: Arc<dyn StoreRefresher>,
    notifier: Arc<dyn Notifier>,
    user: Address,
    settle_delay: Duration,
    cancel_token: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: SnapshotLock,
        writer: Arc<dyn StakingWriter>,
        refresher: Arc<dyn StoreRefresher>,
        notifier: Arc<dyn Notifier>,
        user: Address,
        settle_delay: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self { store, writer, refresher, notifier, user, settle_delay, cancel_token }
    }

    /// Runs one action through the machine. Always returns the final
    /// [PendingAction]; failures are surfaced through the notifier, never
    /// propagated.
    pub async fn run_action(&self, kind: ActionKind, amount: Option<&str>) -> PendingAction {
        let mut action = PendingAction::new(kind);

        action.phase = ActionPhase::Validating;
        match self.validate(kind, amount) {
            Ok(parsed) => action.amount = parsed,
            Err(err) => {
                tracing::debug!("Validation failed for {kind}: {err:?}");
                self.notifier.notify(
                    Severity::Error,
                    &format!("Failed to {kind}"),
                    &err.to_string(),
                );
                action.phase = ActionPhase::Failed(RevertClass::Validation);
                return action;
            }
        }

        let tx_hash = match self.writer.submit(kind, action.amount).await {
            Ok(hash) => hash,
            Err(err) => {
                let class = RevertClass::from_message(&err.message);
                tracing::warn!("Submission failed for {kind}: {err:?}");
                self.notifier.notify(
                    Severity::Error,
                    &format!("Failed to {kind}"),
                    class.user_message(),
                );
                action.phase = ActionPhase::Failed(class);
                return action;
            }
        };
        action.submitted_hash = Some(tx_hash);
        action.phase = ActionPhase::Submitted;
        tracing::debug!("Submitted {kind} transaction: {tx_hash}");

        action.phase = ActionPhase::Confirming;
        let confirm_res = tokio::select! {
            res = self.writer.confirm(tx_hash) => res,
            _ = self.cancel_token.cancelled() => {
                // session torn down mid-wait; outcome unknown, leave the
                // action pending and stop waiting
                tracing::debug!("Confirmation wait for {tx_hash} cancelled by teardown");
                return action;
            }
        };

        if let Err(err) = confirm_res {
            let class = RevertClass::from_message(&err.message());
            tracing::warn!("Confirmation failed for {kind} ({tx_hash}): {err:?}");
            self.notifier.notify(
                Severity::Error,
                &format!("Failed to {kind}"),
                class.user_message(),
            );
            action.phase = ActionPhase::Failed(class);
            return action;
        }

        action.phase = ActionPhase::Confirmed;
        let detail = match action.amount {
            Some(amount) => format!("{} of {} tokens confirmed", kind, format_ether(amount)),
            None => format!("{kind} confirmed"),
        };
        self.notifier.notify(Severity::Success, "Transaction confirmed", &detail);

        // Some accessors lag the confirmed block; give the chain a moment
        // before re-reading, unless the session is being torn down.
        tokio::select! {
            _ = tokio::time::sleep(self.settle_delay) => {}
            _ = self.cancel_token.cancelled() => return action,
        }
        if let Err(err) = self.refresher.refresh_after_action(&self.store, self.user).await {
            tracing::warn!("Post-action refresh failed, store keeps prior values: {err:?}");
        }

        action
    }

    /// Local precondition checks against the current snapshot. No chain
    /// call is made when any of these fail.
    fn validate(
        &self,
        kind: ActionKind,
        amount: Option<&str>,
    ) -> Result<Option<U256>, ValidationErr> {
        if !kind.requires_amount() {
            return Ok(None);
        }

        let raw = amount.unwrap_or_default().trim();
        let parsed = parse_ether(raw)
            .map_err(|err| ValidationErr::InvalidAmount(format!("{raw:?}: {err}")))?;
        if parsed.is_zero() {
            return Err(ValidationErr::InvalidAmount("amount must be positive".to_string()));
        }

        let user = self.store.user()?;
        match kind {
            ActionKind::Approve => {
                if parsed > user.token_balance {
                    return Err(ValidationErr::InsufficientBalance);
                }
            }
            ActionKind::Stake => {
                if parsed > user.token_balance {
                    return Err(ValidationErr::InsufficientBalance);
                }
                if parsed > user.token_allowance {
                    return Err(ValidationErr::AllowanceTooLow);
                }
            }
            ActionKind::Withdraw => {
                if !user.can_withdraw {
                    return Err(ValidationErr::StillLocked(user.time_until_unlock));
                }
            }
            _ => {}
        }

        Ok(Some(parsed))
    }
}
