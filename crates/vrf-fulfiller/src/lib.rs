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

use std::{path::PathBuf, sync::Arc, time::Duration};

use alloy::{
    network::Ethereum,
    primitives::{Address, Bytes, B256},
    providers::Provider,
    transports::{
        layers::{RateLimitRetryPolicy, RetryPolicy as TransportRetryPolicy},
        RpcError, TransportError,
    },
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    chain_monitor::ChainMonitorService,
    classifier::LogClassifier,
    config::ConfigWatcher,
    coordinator::{AggregatorPriceFeed, AlloyChainClient, AlloyCoordinator},
    db::SqliteDb,
    events::CoordinatorVersion,
    force_fulfill::ForceFulfiller,
    listener::Listener,
    log_source::{AlloyLogSource, LogSource},
    pipeline::{HttpProofPipeline, JobSpecVars},
    reverted::RevertedTxnTask,
    scheduler::{FromAddresses, Scheduler},
    simulation::Simulator,
    state::SchedulerState,
    task::{RetryPolicy, Supervisor},
};

pub mod batch;
pub mod chain_monitor;
pub mod checker;
pub mod classifier;
pub mod config;
pub mod confirmation;
pub mod contracts;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod events;
pub mod fees;
pub mod force_fulfill;
pub mod listener;
pub mod log_source;
pub mod pipeline;
pub mod reverted;
pub mod scheduler;
pub mod simulation;
pub mod state;
pub mod task;
pub mod txm;
pub mod watermark;

/// Time given to tasks to finish after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// RPC URL
    #[clap(long, env = "VRF_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Additional RPC URLs, comma separated. Several URLs enable the fallback transport.
    #[clap(long, env = "VRF_RPC_URLS", value_delimiter = ',')]
    pub rpc_urls: Vec<String>,

    /// sqlite database connection url
    #[clap(short = 's', long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    pub db_url: String,

    /// Config file path
    #[clap(short, long, default_value = "vrf-fulfiller.toml")]
    pub config_file: PathBuf,

    /// VRF coordinator address
    #[clap(long, env = "VRF_COORDINATOR_ADDRESS")]
    pub coordinator_address: Address,

    /// Coordinator protocol version
    #[clap(long, value_enum, default_value_t = CoordinatorVersion::V2)]
    pub coordinator_version: CoordinatorVersion,

    /// Batch coordinator address, required for batch fulfillment
    #[clap(long, env = "VRF_BATCH_COORDINATOR_ADDRESS")]
    pub batch_coordinator_address: Option<Address>,

    /// VRF owner address, required for force fulfillment
    #[clap(long, env = "VRF_OWNER_ADDRESS")]
    pub vrf_owner_address: Option<Address>,

    /// LINK/native price feed address
    #[clap(long, env = "VRF_LINK_NATIVE_FEED_ADDRESS")]
    pub link_native_feed_address: Address,

    /// Key hash of the proving key served by this fulfiller
    #[clap(long, env = "VRF_KEY_HASH")]
    pub key_hash: B256,

    /// Compressed public key of the proving key
    #[clap(long, env = "VRF_PUBLIC_KEY")]
    pub public_key: Bytes,

    /// Sending addresses, comma separated, used round robin
    #[clap(long, env = "VRF_FROM_ADDRESSES", value_delimiter = ',', required = true)]
    pub from_addresses: Vec<Address>,

    /// Proof pipeline endpoint
    #[clap(long, env = "VRF_PIPELINE_URL")]
    pub pipeline_url: Url,

    /// Job ID handed to the proof pipeline
    #[clap(long, default_value_t = 1)]
    pub job_id: i64,

    /// External job ID handed to the proof pipeline
    #[clap(long, default_value_t = Uuid::nil())]
    pub external_job_id: Uuid,

    /// Job name handed to the proof pipeline
    #[clap(long, default_value = "vrf")]
    pub job_name: String,

    /// RPC HTTP retry attempts
    #[clap(long, default_value_t = 3)]
    pub rpc_retry_max: u32,

    /// RPC HTTP retry backoff (in ms)
    #[clap(long, default_value_t = 200)]
    pub rpc_retry_backoff: u64,

    /// RPC HTTP retry compute-unit per second
    #[clap(long, default_value_t = 100)]
    pub rpc_retry_cu: u64,

    /// Log JSON
    #[clap(long, env, default_value_t = false)]
    pub log_json: bool,
}

/// Retries rate limits like the alloy default and, on top, transport level failures
#[derive(Debug, Copy, Clone, Default)]
pub struct CustomRetryPolicy;

impl TransportRetryPolicy for CustomRetryPolicy {
    fn should_retry(&self, error: &TransportError) -> bool {
        if RateLimitRetryPolicy::default().should_retry(error) {
            return true;
        }
        matches!(error, RpcError::Transport(_))
    }

    fn backoff_hint(&self, error: &TransportError) -> Option<Duration> {
        RateLimitRetryPolicy::default().backoff_hint(error)
    }
}

pub(crate) fn now_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

pub struct FulfillerService<P> {
    args: Args,
    provider: P,
    config_watcher: ConfigWatcher,
    db: Arc<SqliteDb>,
}

impl<P> FulfillerService<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub async fn new(args: Args, provider: P, config_watcher: ConfigWatcher) -> Result<Self> {
        let db = Arc::new(
            SqliteDb::new(&args.db_url).await.context("Failed to connect to sqlite DB")?,
        );
        Ok(Self { args, provider, config_watcher, db })
    }

    pub async fn start_service(&self) -> Result<()> {
        let config = self.config_watcher.config.clone();
        let version = self.args.coordinator_version;
        let cancel_token = CancellationToken::new();
        let mut supervisor_tasks: JoinSet<Result<()>> = JoinSet::new();

        let provider = Arc::new(self.provider.clone());
        let chain_monitor = Arc::new(ChainMonitorService::new(provider.clone(), config.clone()));
        let chain_monitor_task = Supervisor::new(chain_monitor.clone(), cancel_token.clone())
            .with_retry_policy(RetryPolicy::CRITICAL_SERVICE);
        supervisor_tasks.spawn(async move {
            chain_monitor_task.spawn().await.context("Failed to start chain monitor")?;
            Ok(())
        });

        let log_source = Arc::new(AlloyLogSource::new(
            provider,
            chain_monitor,
            self.args.coordinator_address,
            version.event_signatures().to_vec(),
            config.clone(),
        ));
        let chain_id = log_source.chain_id().await.context("Failed to get chain id")?;
        tracing::info!(
            "Serving {version} coordinator {} on chain {chain_id} for key hash {}",
            self.args.coordinator_address,
            self.args.key_hash
        );

        let coordinator = Arc::new(AlloyCoordinator::new(
            self.provider.clone(),
            self.args.coordinator_address,
            version,
        ));
        let chain = Arc::new(AlloyChainClient::new(self.provider.clone()));
        let price_feed = Arc::new(AggregatorPriceFeed::new(
            self.provider.clone(),
            self.args.link_native_feed_address,
        ));
        let pipeline = Arc::new(
            HttpProofPipeline::new(self.args.pipeline_url.clone())
                .context("Failed to build pipeline client")?,
        );
        let job = JobSpecVars {
            database_id: self.args.job_id,
            external_job_id: self.args.external_job_id,
            name: self.args.job_name.clone(),
            public_key: self.args.public_key.clone(),
            max_gas_price: String::new(),
            evm_chain_id: chain_id.to_string(),
        };
        let simulator = Simulator::new(version, pipeline, price_feed, job);

        let state = Arc::new(SchedulerState::new());
        let force = ForceFulfiller::new(self.args.vrf_owner_address, chain.clone(), self.db.clone());
        let from_addresses = Arc::new(
            FromAddresses::new(self.args.from_addresses.clone())
                .context("Invalid from addresses")?,
        );
        if self.config_watcher.config.listener()?.batch_fulfillment_enabled
            && self.args.batch_coordinator_address.is_none()
        {
            tracing::warn!("Batch fulfillment enabled without a batch coordinator address, fulfilling singly");
        }
        let scheduler = Scheduler::new(
            coordinator.clone(),
            self.args.batch_coordinator_address,
            chain.clone(),
            self.db.clone(),
            simulator,
            force.clone(),
            state.clone(),
            config.clone(),
            from_addresses,
        );

        let listener = Arc::new(Listener::new(
            log_source,
            LogClassifier::new(version, self.args.key_hash),
            coordinator.clone(),
            scheduler,
            state.clone(),
            config.clone(),
        ));
        let listener_task = Supervisor::new(listener, cancel_token.clone())
            .with_retry_policy(RetryPolicy::CRITICAL_SERVICE);
        supervisor_tasks.spawn(async move {
            listener_task.spawn().await.context("Failed to start listener")?;
            Ok(())
        });

        if RevertedTxnTask::enabled(version, &force, &config.listener()?) {
            let reverted = Arc::new(RevertedTxnTask::new(
                coordinator,
                chain,
                self.db.clone(),
                force,
                state,
                config.clone(),
            ));
            let reverted_task = Supervisor::new(reverted, cancel_token.clone());
            supervisor_tasks.spawn(async move {
                reverted_task.spawn().await.context("Failed to start reverted txn recovery")?;
                Ok(())
            });
        } else {
            tracing::info!("Reverted txn recovery disabled");
        }

        let res = loop {
            tokio::select! {
                Some(res) = supervisor_tasks.join_next() => {
                    match res {
                        Ok(Ok(())) => tracing::debug!("Supervised task exited"),
                        Ok(Err(err)) => {
                            tracing::error!("Critical task failed: {err:?}");
                            break Err(err);
                        }
                        Err(err) => {
                            tracing::error!("Task join failed: {err:?}");
                            break Err(err.into());
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received ctrl-c, shutting down");
                    break Ok(());
                }
            }
        };

        cancel_token.cancel();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(task_res) = supervisor_tasks.join_next().await {
                if let Ok(Err(err)) = task_res {
                    tracing::warn!("Task failed during shutdown: {err:?}");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Tasks did not stop within {SHUTDOWN_GRACE:?}, aborting");
            supervisor_tasks.abort_all();
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from([
            "vrf-fulfiller",
            "--coordinator-address",
            "0x0000000000000000000000000000000000000001",
            "--coordinator-version",
            "v2plus",
            "--link-native-feed-address",
            "0x0000000000000000000000000000000000000002",
            "--key-hash",
            "0x0101010101010101010101010101010101010101010101010101010101010101",
            "--public-key",
            "0x0203",
            "--from-addresses",
            "0x00000000000000000000000000000000000000f1,0x00000000000000000000000000000000000000f2",
            "--pipeline-url",
            "http://localhost:6688",
        ])
        .unwrap();
        assert_eq!(args.coordinator_version, CoordinatorVersion::V2Plus);
        assert_eq!(args.from_addresses.len(), 2);
        assert_eq!(args.db_url, "sqlite::memory:");
        assert!(args.vrf_owner_address.is_none());
    }

    #[test]
    fn transport_errors_are_retried() {
        let err: TransportError = RpcError::Transport(
            alloy::transports::TransportErrorKind::BackendGone,
        );
        assert!(CustomRetryPolicy.should_retry(&err));
        // Empty responses are retried by the rate limit policy already
        assert!(CustomRetryPolicy.should_retry(&RpcError::NullResp));

        let ser: TransportError =
            RpcError::SerError(serde_json::from_str::<u8>("not a number").unwrap_err());
        assert!(!CustomRetryPolicy.should_retry(&ser));
    }
}
