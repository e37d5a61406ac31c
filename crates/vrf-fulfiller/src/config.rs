// Copyright 2026 Boundless Foundation, Inc.
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
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration as StdDuration,
};

use crate::errors::{impl_coded_debug, CodedError};
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
    pub const fn min_incoming_confirmations() -> u32 {
        3
    }

    pub const fn requested_confs_delay() -> u64 {
        0
    }

    pub const fn request_timeout_secs() -> u64 {
        // 24 hours
        60 * 60 * 24
    }

    pub const fn backoff_initial_delay_ms() -> u64 {
        0
    }

    pub const fn backoff_max_delay_ms() -> u64 {
        // 1 hour
        60 * 60 * 1000
    }

    pub const fn chunk_size() -> u32 {
        20
    }

    pub const fn poll_period_ms() -> u64 {
        5000
    }

    pub const fn events_poll_blocks() -> u64 {
        1000
    }

    pub const fn finality_depth() -> u64 {
        50
    }

    pub const fn batch_fulfillment_gas_multiplier() -> f64 {
        1.15
    }

    pub const fn reverted_txns_lookback_blocks() -> u64 {
        1000
    }

    pub const fn limit_default() -> u64 {
        500_000
    }

    pub const fn price_max_default() -> u64 {
        // 500 gwei
        500_000_000_000
    }
}

/// Scheduling and polling behavior of the fulfillment listener
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ListenerConfig {
    /// Node level minimum confirmations applied to every request.
    ///
    /// The effective confirmation count is the larger of this value and the
    /// confirmations requested on-chain (plus `requested_confs_delay`).
    #[serde(default = "defaults::min_incoming_confirmations")]
    pub min_incoming_confirmations: u32,
    /// Additional confirmations added on top of the requested confirmations.
    #[serde(default = "defaults::requested_confs_delay")]
    pub requested_confs_delay: u64,
    /// Requests first seen longer ago than this are dropped (in seconds)
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Initial retry backoff for requests that could not be processed (in millisecs)
    ///
    /// Zero disables backoff and every ready request is retried on each poll.
    #[serde(default = "defaults::backoff_initial_delay_ms")]
    pub backoff_initial_delay_ms: u64,
    /// Upper bound on the retry backoff (in millisecs)
    #[serde(default = "defaults::backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
    /// Number of requests simulated concurrently per subscription
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: u32,
    /// Polling interval of the request loop (in millisecs)
    #[serde(default = "defaults::poll_period_ms")]
    pub poll_period_ms: u64,
    /// Max block range of a single log query
    #[serde(default = "defaults::events_poll_blocks")]
    pub events_poll_blocks: u64,
    /// Number of blocks after which a chain is considered final for consumer validity checks
    #[serde(default = "defaults::finality_depth")]
    pub finality_depth: u64,
    /// Submit fulfillments through the batch coordinator
    #[serde(default)]
    pub batch_fulfillment_enabled: bool,
    /// Multiplier applied to the gas limit of batch fulfillment transactions
    #[serde(default = "defaults::batch_fulfillment_gas_multiplier")]
    pub batch_fulfillment_gas_multiplier: f64,
    /// Enables the reverted transaction recovery task
    #[serde(default)]
    pub custom_reverts_pipeline_enabled: bool,
    /// How far back (in blocks) the recovery task looks for reverted transactions
    #[serde(default = "defaults::reverted_txns_lookback_blocks")]
    pub reverted_txns_lookback_blocks: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            min_incoming_confirmations: defaults::min_incoming_confirmations(),
            requested_confs_delay: defaults::requested_confs_delay(),
            request_timeout_secs: defaults::request_timeout_secs(),
            backoff_initial_delay_ms: defaults::backoff_initial_delay_ms(),
            backoff_max_delay_ms: defaults::backoff_max_delay_ms(),
            chunk_size: defaults::chunk_size(),
            poll_period_ms: defaults::poll_period_ms(),
            events_poll_blocks: defaults::events_poll_blocks(),
            finality_depth: defaults::finality_depth(),
            batch_fulfillment_enabled: false,
            batch_fulfillment_gas_multiplier: defaults::batch_fulfillment_gas_multiplier(),
            custom_reverts_pipeline_enabled: false,
            reverted_txns_lookback_blocks: defaults::reverted_txns_lookback_blocks(),
        }
    }
}

impl ListenerConfig {
    pub fn request_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_period(&self) -> StdDuration {
        StdDuration::from_millis(self.poll_period_ms)
    }
}

/// Gas limits and price caps
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GasConfig {
    /// Default gas limit for transactions
    #[serde(default = "defaults::limit_default")]
    pub limit_default: u64,
    /// Gas limit override for VRF fulfillment transactions
    pub limit_vrf: Option<u64>,
    /// Default max gas price (in wei)
    #[serde(default = "defaults::price_max_default")]
    pub price_max_default: u64,
    /// Per sending key max gas price (in wei)
    #[serde(default)]
    pub price_max_key: HashMap<Address, u64>,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            limit_default: defaults::limit_default(),
            limit_vrf: None,
            price_max_default: defaults::price_max_default(),
            price_max_key: HashMap::new(),
        }
    }
}

impl GasConfig {
    /// Max gas price to simulate and submit with for a given sending key
    pub fn price_max_key(&self, key: &Address) -> u64 {
        self.price_max_key.get(key).copied().unwrap_or(self.price_max_default)
    }

    /// Gas limit configured for VRF jobs
    pub fn vrf_gas_limit(&self) -> u64 {
        self.limit_vrf.unwrap_or(self.limit_default)
    }
}

/// Top level config for the fulfiller service
#[derive(Deserialize, Serialize, Default, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub gas: GasConfig,
}

impl Config {
    /// Load the config from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .await
            .context(format!("Failed to read config file from {path:?}"))?;
        toml::from_str(&data).context(format!("Failed to parse toml file from {path:?}"))
    }
}

#[derive(Error)]
pub enum ConfigErr {
    #[error("{code} Failed to lock internal config structure", code = self.code())]
    LockFailed,

    #[error("{code} Invalid configuration: {0}", code = self.code())]
    InvalidConfig(String),
}

impl_coded_debug!(ConfigErr);

impl CodedError for ConfigErr {
    fn code(&self) -> &str {
        match self {
            ConfigErr::LockFailed => "[V-CON-3012]",
            ConfigErr::InvalidConfig(_) => "[V-CON-3013]",
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct ConfigLock {
    config: Arc<RwLock<Config>>,
}

impl ConfigLock {
    fn new(config: Arc<RwLock<Config>>) -> Self {
        Self { config }
    }

    pub fn lock_all(&self) -> Result<std::sync::RwLockReadGuard<'_, Config>, ConfigErr> {
        self.config.read().map_err(|_| ConfigErr::LockFailed)
    }

    /// Snapshot of the listener section, validated for use by a polling pass
    pub fn listener(&self) -> Result<ListenerConfig, ConfigErr> {
        let listener = self.lock_all()?.listener.clone();
        if listener.chunk_size == 0 {
            return Err(ConfigErr::InvalidConfig("listener.chunk_size must be non-zero".into()));
        }
        Ok(listener)
    }

    pub fn gas(&self) -> Result<GasConfig, ConfigErr> {
        Ok(self.lock_all()?.gas.clone())
    }

    #[cfg(test)]
    pub fn load_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Config>, ConfigErr> {
        self.config.write().map_err(|_| ConfigErr::LockFailed)
    }
}

impl From<Config> for ConfigLock {
    fn from(config: Config) -> Self {
        Self::new(Arc::new(RwLock::new(config)))
    }
}

/// Max number of pending filesystem events from the config file
const FILE_MONITOR_EVENT_BUFFER: usize = 32;

/// Monitor service for watching config files for changes
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
                Ok(_) => anyhow::bail!("Config watcher exited before signaling startup"),
                Err(err) => return Err(err),
            }
        }
        tracing::debug!("Successful startup");

        Ok(Self { config: ConfigLock::new(config), _monitor: monitor })
    }
}
