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

use std::{
    path::Path,
    sync::{Arc, RwLock},
};

use crate::{errors::CodedError, impl_coded_debug};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use notify::{EventKind, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs,
    task::JoinHandle,
    time::{timeout, Duration},
};

pub mod defaults {
    pub const fn lookback_blocks() -> u64 {
        300
    }

    pub const fn events_poll_blocks() -> u64 {
        500
    }

    pub const fn events_poll_ms() -> u64 {
        5000
    }

    pub const fn block_poll_ms() -> u64 {
        2000
    }

    pub const fn refresh_interval_secs() -> u64 {
        10
    }

    pub const fn settle_delay_ms() -> u64 {
        2000
    }

    pub const fn txn_timeout_secs() -> u64 {
        90
    }

    pub const fn receipt_poll_ms() -> u64 {
        2000
    }
}

/// Hard bounds on the volatile-field refresh period.
const REFRESH_INTERVAL_MIN_SECS: u64 = 10;
const REFRESH_INTERVAL_MAX_SECS: u64 = 30;

#[derive(Error)]
pub enum ConfigErr {
    #[error("{code} Failed to lock internal config structure", code = self.code())]
    LockFailed,

    #[error("{code} Invalid configuration", code = self.code())]
    InvalidConfig,
}

impl_coded_debug!(ConfigErr);

impl CodedError for ConfigErr {
    fn code(&self) -> &str {
        match self {
            ConfigErr::LockFailed => "[SS-CON-3012]",
            ConfigErr::InvalidConfig => "[SS-CON-3013]",
        }
    }
}

/// Addresses of the fixed external contracts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Staking pool contract address
    pub staking_address: Address,
    /// Fallback token address, used when `stakingToken()` cannot be read
    pub token_address_fallback: Address,
}

/// Tuning knobs for the reconciliation services.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Blocks scanned behind the head when event polling starts
    #[serde(default = "defaults::lookback_blocks")]
    pub lookback_blocks: u64,
    /// Max blocks per get_logs query
    #[serde(default = "defaults::events_poll_blocks")]
    pub events_poll_blocks: u64,
    /// Event poll tick, milliseconds
    #[serde(default = "defaults::events_poll_ms")]
    pub events_poll_ms: u64,
    /// Minimum spacing between block-number queries, milliseconds
    #[serde(default = "defaults::block_poll_ms")]
    pub block_poll_ms: u64,
    /// Volatile-field refresh period, seconds
    #[serde(default = "defaults::refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Delay between a confirmed transaction and the follow-up refresh,
    /// milliseconds. Some accessors lag the confirmed block.
    #[serde(default = "defaults::settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Overall receipt-wait timeout, seconds
    #[serde(default = "defaults::txn_timeout_secs")]
    pub txn_timeout_secs: u64,
    /// Receipt poll tick while confirming, milliseconds
    #[serde(default = "defaults::receipt_poll_ms")]
    pub receipt_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_blocks: defaults::lookback_blocks(),
            events_poll_blocks: defaults::events_poll_blocks(),
            events_poll_ms: defaults::events_poll_ms(),
            block_poll_ms: defaults::block_poll_ms(),
            refresh_interval_secs: defaults::refresh_interval_secs(),
            settle_delay_ms: defaults::settle_delay_ms(),
            txn_timeout_secs: defaults::txn_timeout_secs(),
            receipt_poll_ms: defaults::receipt_poll_ms(),
        }
    }
}

impl SyncConfig {
    /// Refresh period clamped to the supported band.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(
            self.refresh_interval_secs
                .clamp(REFRESH_INTERVAL_MIN_SECS, REFRESH_INTERVAL_MAX_SECS),
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load the config from a TOML file.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {path:?}"))?;
        toml::from_str(&data).with_context(|| format!("Failed to parse toml file from {path:?}"))
    }
}

#[derive(Clone, Debug)]
pub struct ConfigLock {
    config: Arc<RwLock<Config>>,
}

impl ConfigLock {
    fn new(config: Arc<RwLock<Config>>) -> Self {
        Self { config }
    }

    /// Wrap an already-loaded config, for use without a watcher.
    pub fn from_config(config: Config) -> Self {
        Self::new(Arc::new(RwLock::new(config)))
    }

    pub fn lock_all(&self) -> Result<std::sync::RwLockReadGuard<'_, Config>, ConfigErr> {
        self.config.read().map_err(|_| ConfigErr::LockFailed)
    }

    #[cfg(test)]
    pub fn load_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Config>, ConfigErr> {
        self.config.write().map_err(|_| ConfigErr::LockFailed)
    }
}

/// Max number of pending filesystem events from the config file
const FILE_MONITOR_EVENT_BUFFER: usize = 32;

/// Monitor service for watching the config file for changes
pub struct ConfigWatcher {
    /// Current config data
    pub config: ConfigLock,
    /// monitor task handle
    _monitor: JoinHandle<Result<()>>,
}

impl ConfigWatcher {
    /// Initialize a new config watcher and handle
    pub async fn new(config_path: &Path) -> Result<Self> {
        let initial_config = Config::load(config_path).await?;
        let config = Arc::new(RwLock::new(initial_config));
        let config_copy = config.clone();
        let config_path_copy = config_path.to_path_buf();

        let startup_notification = Arc::new(tokio::sync::Notify::new());
        let startup_notification_copy = startup_notification.clone();

        let monitor = tokio::spawn(async move {
            let (tx, mut rx) = tokio::sync::mpsc::channel(FILE_MONITOR_EVENT_BUFFER);

            let mut watcher = notify::recommended_watcher(move |res| match res {
                Ok(event) => {
                    if let Err(err) = tx.try_send(event) {
                        tracing::debug!("Failed to send filesystem event to channel: {err:?}");
                    }
                }
                Err(err) => tracing::error!("Failed to watch config file: {err:?}"),
            })
            .context("Failed to construct watcher")?;

            watcher
                .watch(&config_path_copy, notify::RecursiveMode::NonRecursive)
                .context("Failed to start watcher")?;
            startup_notification_copy.notify_one();

            while let Some(event) = rx.recv().await {
                match event.kind {
                    EventKind::Modify(_) => {
                        tracing::debug!("Reloading modified config file");
                        let new_config = match Config::load(&config_path_copy).await {
                            Ok(val) => val,
                            Err(err) => {
                                tracing::error!("Failed to load modified config: {err:?}");
                                continue;
                            }
                        };
                        let mut config = match config_copy.write() {
                            Ok(val) => val,
                            Err(err) => {
                                tracing::error!(
                                    "Failed to lock config, previously poisoned? {err:?}"
                                );
                                continue;
                            }
                        };
                        *config = new_config;
                    }
                    _ => {
                        tracing::debug!("unsupported config file event: {event:?}");
                    }
                }
            }

            watcher.unwatch(&config_path_copy).context("Failed to stop watching config")?;

            Ok(())
        });

        // Wait for successful start up, if failed return the Result
        if let Err(err) = timeout(Duration::from_secs(1), startup_notification.notified()).await {
            tracing::error!("Failed to get notification from config monitor startup in: {err}");
            let task_res = monitor.await.context("Config watcher startup failed")?;
            match task_res {
                Ok(_) => unreachable!("Startup failed to notify in timeout but exited cleanly"),
                Err(err) => return Err(err),
            }
        }
        tracing::debug!("Successful startup");

        Ok(Self { config: ConfigLock::new(config), _monitor: monitor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;
    use tracing_test::traced_test;

    const CONFIG_TEMPL: &str = r#"
[chain]
staking_address = "0x00000000000000000000000000000000000000aa"
token_address_fallback = "0xefec53fa6759fcdd49c3e084b69286a8967c7db2"

[sync]
lookback_blocks = 100
events_poll_ms = 2500
refresh_interval_secs = 15
"#;

    #[tokio::test]
    #[traced_test]
    async fn load_config_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CONFIG_TEMPL.as_bytes()).unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(
            config.chain.staking_address,
            "0x00000000000000000000000000000000000000aa".parse::<Address>().unwrap()
        );
        assert_eq!(config.sync.lookback_blocks, 100);
        assert_eq!(config.sync.events_poll_ms, 2500);
        // untouched fields come from defaults
        assert_eq!(config.sync.events_poll_blocks, defaults::events_poll_blocks());
        assert_eq!(config.sync.settle_delay_ms, defaults::settle_delay_ms());
    }

    #[tokio::test]
    #[traced_test]
    async fn refresh_interval_clamped() {
        let config = SyncConfig { refresh_interval_secs: 2, ..Default::default() };
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));

        let config = SyncConfig { refresh_interval_secs: 300, ..Default::default() };
        assert_eq!(config.refresh_interval(), Duration::from_secs(30));

        let config = SyncConfig { refresh_interval_secs: 15, ..Default::default() };
        assert_eq!(config.refresh_interval(), Duration::from_secs(15));
    }

    #[tokio::test]
    #[traced_test]
    async fn watcher_loads_initial_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CONFIG_TEMPL.as_bytes()).unwrap();

        let watcher = ConfigWatcher::new(file.path()).await.unwrap();
        let config = watcher.config.lock_all().unwrap();
        assert_eq!(config.sync.refresh_interval_secs, 15);
    }
}
