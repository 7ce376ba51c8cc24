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

//! Client-side reconciliation of staking-pool state.
//!
//! The crate keeps one merged, always-current view of a token staking
//! contract for a single connected account. On connect it populates the
//! [snapshot] store from the chain, then keeps it fresh through two
//! complementary paths: the [event_monitor] folds emitted pool events into
//! the store as they land, and the [refresher] re-reads the continuously
//! accruing fields on a fixed interval. Writes go through the
//! [orchestrator], which validates against the local snapshot before any
//! transaction is signed, confirms the receipt and triggers a batched
//! re-read once the chain settles.
//!
//! All amounts stay in 18-decimal base units end to end; derivation of
//! display fields (lock countdown, withdrawability, reward estimates)
//! lives in [derived] as pure functions.

pub mod chain_monitor;
pub mod config;
pub mod contracts;
pub mod derived;
pub mod errors;
pub mod event_monitor;
pub mod orchestrator;
pub mod reader;
pub mod refresher;
pub mod session;
pub mod snapshot;
pub mod task;

pub use config::{Config, ConfigLock, ConfigWatcher};
pub use orchestrator::{
    ActionKind, ActionPhase, ActionStatus, Notifier, Orchestrator, PendingAction, PoolWriter,
    RevertClass, Severity, StakingWriter, TracingNotifier,
};
pub use reader::ChainReader;
pub use session::StakingSession;
pub use snapshot::{ProtocolSnapshot, SnapshotLock, UserStakingSnapshot};

/// Current wall-clock time as unix seconds.
pub fn now_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
