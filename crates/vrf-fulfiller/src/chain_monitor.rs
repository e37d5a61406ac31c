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

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::sync::RwLock;

use alloy::{eips::BlockNumberOrTag, network::Ethereum, providers::Provider};
use anyhow::{Context, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigLock,
    errors::{impl_coded_debug, CodedError},
    task::{RetryRes, RetryTask, SupervisorErr},
};

/// Latest and latest finalized block numbers, observed together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainHead {
    pub latest: u64,
    pub finalized: u64,
}

#[derive(Error)]
pub enum ChainMonitorErr {
    #[error("{code} RPC error: {0:?}", code = self.code())]
    RpcErr(anyhow::Error),

    #[error("{code} Unexpected error: {0:?}", code = self.code())]
    UnexpectedErr(#[from] anyhow::Error),
}

impl_coded_debug!(ChainMonitorErr);

impl CodedError for ChainMonitorErr {
    fn code(&self) -> &str {
        match self {
            ChainMonitorErr::RpcErr(_) => "[V-CHM-400]",
            ChainMonitorErr::UnexpectedErr(_) => "[V-CHM-500]",
        }
    }
}

#[derive(Clone)]
pub struct ChainMonitorService<P> {
    provider: Arc<P>,
    config: ConfigLock,
    head: watch::Sender<ChainHead>,
    update_notifier: Arc<Notify>,
    next_update: Arc<RwLock<Instant>>,
}

impl<P> ChainMonitorService<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub fn new(provider: Arc<P>, config: ConfigLock) -> Self {
        let (head, _) = watch::channel(ChainHead::default());

        Self {
            provider,
            config,
            head,
            update_notifier: Arc::new(Notify::new()),
            next_update: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Returns the latest heads, triggering an update if enough time has passed
    pub async fn current_head(&self) -> Result<ChainHead> {
        if Instant::now() > *self.next_update.read().await {
            let mut rx = self.head.subscribe();
            self.update_notifier.notify_one();
            rx.changed().await.context("failed to query heads from chain monitor")?;
            let head = *rx.borrow();
            Ok(head)
        } else {
            Ok(*self.head.borrow())
        }
    }

    async fn fetch_head(&self, finality_depth: u64) -> Result<ChainHead, ChainMonitorErr> {
        let latest = self
            .provider
            .get_block_number()
            .await
            .context("Failed to get block number")
            .map_err(ChainMonitorErr::RpcErr)?;

        let finalized = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Finalized)
            .await
            .context("Failed to get finalized block")
            .map_err(ChainMonitorErr::RpcErr)?
            .map(|block| block.header.number);

        // Chains without a finality tag fall back to a fixed depth
        let finalized = match finalized {
            Some(number) => number.min(latest),
            None => latest.saturating_sub(finality_depth),
        };

        Ok(ChainHead { latest, finalized })
    }
}

impl<P> RetryTask for ChainMonitorService<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    type Error = ChainMonitorErr;

    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
        let self_clone = self.clone();

        Box::pin(async move {
            tracing::info!("Starting ChainMonitor service");
            let (poll_time_ms, finality_depth) = {
                let listener = self_clone
                    .config
                    .listener()
                    .context("Failed to read listener config")
                    .map_err(|err| SupervisorErr::Fault(ChainMonitorErr::UnexpectedErr(err)))?;
                (listener.poll_period_ms, listener.finality_depth)
            };

            loop {
                tokio::select! {
                    _ = self_clone.update_notifier.notified() => {}
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Chain monitor received cancellation");
                        return Ok(());
                    }
                }
                // Needs update, lock next update value to avoid unnecessary notifications.
                let mut next_update = self_clone.next_update.write().await;

                let head =
                    self_clone.fetch_head(finality_depth).await.map_err(SupervisorErr::Recover)?;
                tracing::trace!("Chain head updated: {head:?}");
                let _ = self_clone.head.send_replace(head);

                *next_update = Instant::now() + Duration::from_millis(poll_time_ms);
            }
        })
    }
}
