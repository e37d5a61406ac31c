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

use alloy::{
    eips::BlockNumberOrTag,
    network::Ethereum,
    primitives::{Address, B256},
    providers::Provider,
    rpc::types::{Filter, Log},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::{
    chain_monitor::{ChainHead, ChainMonitorService},
    config::{ConfigErr, ConfigLock},
    errors::{impl_coded_debug, CodedError},
};

#[derive(Error)]
pub enum LogSourceErr {
    #[error("{code} RPC error: {0:?}", code = self.code())]
    RpcErr(anyhow::Error),

    #[error("{code} Block {0} not found", code = self.code())]
    BlockNotFound(u64),

    #[error("{code} Config error: {0}", code = self.code())]
    ConfigErr(#[from] ConfigErr),
}

impl_coded_debug!(LogSourceErr);

impl CodedError for LogSourceErr {
    fn code(&self) -> &str {
        match self {
            LogSourceErr::RpcErr(_) => "[V-LOG-400]",
            LogSourceErr::BlockNotFound(_) => "[V-LOG-404]",
            LogSourceErr::ConfigErr(_) => "[V-LOG-500]",
        }
    }
}

/// Ordered coordinator logs and chain heads
#[async_trait]
pub trait LogSource {
    /// Coordinator logs in the inclusive block range, ordered by position
    async fn logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, LogSourceErr>;
    async fn heads(&self) -> Result<ChainHead, LogSourceErr>;
    async fn block_timestamp(&self, block_number: u64) -> Result<u64, LogSourceErr>;
    async fn chain_id(&self) -> Result<u64, LogSourceErr>;
}

pub type LogSourceObj = Arc<dyn LogSource + Send + Sync>;

/// [LogSource] backed by `eth_getLogs`, split into `events_poll_blocks` sized queries
pub struct AlloyLogSource<P> {
    provider: Arc<P>,
    chain_monitor: Arc<ChainMonitorService<P>>,
    address: Address,
    signatures: Vec<B256>,
    config: ConfigLock,
}

impl<P> AlloyLogSource<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub fn new(
        provider: Arc<P>,
        chain_monitor: Arc<ChainMonitorService<P>>,
        address: Address,
        signatures: Vec<B256>,
        config: ConfigLock,
    ) -> Self {
        Self { provider, chain_monitor, address, signatures, config }
    }
}

/// Splits an inclusive range into inclusive chunks of at most `size` blocks
pub(crate) fn block_chunks(from_block: u64, to_block: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut chunks = vec![];
    let mut start = from_block;
    while start <= to_block {
        let end = start.saturating_add(size - 1).min(to_block);
        chunks.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    chunks
}

#[async_trait]
impl<P> LogSource for AlloyLogSource<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    async fn logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, LogSourceErr> {
        let chunk_size = self.config.listener()?.events_poll_blocks;
        let mut out = vec![];
        for (start, end) in block_chunks(from_block, to_block, chunk_size) {
            let filter = Filter::new()
                .address(self.address)
                .from_block(start)
                .to_block(end)
                .event_signature(self.signatures.clone());
            let logs = self
                .provider
                .get_logs(&filter)
                .await
                .with_context(|| format!("Failed to get logs for blocks {start}..={end}"))
                .map_err(LogSourceErr::RpcErr)?;
            tracing::trace!("Fetched {} logs from block {start} to block {end}", logs.len());
            out.extend(logs);
        }
        Ok(out)
    }

    async fn heads(&self) -> Result<ChainHead, LogSourceErr> {
        self.chain_monitor.current_head().await.map_err(LogSourceErr::RpcErr)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, LogSourceErr> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .context("Failed to get block by number")
            .map_err(LogSourceErr::RpcErr)?
            .ok_or(LogSourceErr::BlockNotFound(block_number))?;
        Ok(block.header.timestamp)
    }

    async fn chain_id(&self) -> Result<u64, LogSourceErr> {
        self.provider
            .get_chain_id()
            .await
            .context("Failed to get chain id")
            .map_err(LogSourceErr::RpcErr)
    }
}
