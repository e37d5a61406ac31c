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

//! Tracks the lowest block that still has to be scanned for outstanding requests.

use std::{collections::HashMap, time::Duration};

use alloy::rpc::types::Log;
use thiserror::Error;

use crate::{
    classifier::{ClassifiedWindow, LogClassifier},
    errors::{impl_coded_debug, CodedError},
    log_source::{LogSourceErr, LogSourceObj},
};

/// Approximate block time in seconds for known chains. Unknown chains assume 1s blocks.
pub fn block_time_secs(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet, Sepolia, Holesky
        1 | 11155111 | 17000 => 12,
        // Polygon, Polygon Amoy, Base, Base Sepolia, Optimism, OP Sepolia, Avalanche, Fuji
        137 | 80002 | 8453 | 84532 | 10 | 11155420 | 43114 | 43113 => 2,
        // Arbitrum One, Arbitrum Sepolia
        42161 | 421614 => 1,
        _ => 1,
    }
}

/// Number of blocks to replay at startup to cover `timeout` of history
pub fn replay_window_blocks(chain_id: u64, timeout: Duration) -> u64 {
    timeout.as_secs() / block_time_secs(chain_id)
}

#[derive(Error)]
pub enum WatermarkErr {
    #[error("{code} Log source error: {0}", code = self.code())]
    LogSourceErr(#[from] LogSourceErr),
}

impl_coded_debug!(WatermarkErr);

impl CodedError for WatermarkErr {
    fn code(&self) -> &str {
        match self {
            WatermarkErr::LogSourceErr(_) => "[V-WMK-400]",
        }
    }
}

pub struct WatermarkTracker {
    source: LogSourceObj,
    classifier: LogClassifier,
}

impl WatermarkTracker {
    pub fn new(source: LogSourceObj, classifier: LogClassifier) -> Self {
        Self { source, classifier }
    }

    /// Startup watermark: replays `timeout` worth of blocks behind `finalized`.
    pub async fn initial(
        &self,
        finalized: u64,
        timeout: Duration,
        now: u64,
    ) -> Result<u64, WatermarkErr> {
        let chain_id = self.source.chain_id().await?;
        let window = replay_window_blocks(chain_id, timeout);
        let from_block = finalized.saturating_sub(window);
        tracing::info!(
            "Replaying {window} blocks from {from_block} to finalized block {finalized} for outstanding requests"
        );

        let logs = self.source.logs(from_block, finalized).await?;
        let cutoff = now.saturating_sub(timeout.as_secs());
        let recent = self.logs_newer_than(logs, cutoff).await?;
        let classified = self.classifier.classify(&recent);

        Ok(Self::watermark(&classified, finalized))
    }

    /// Steady state watermark: scans `[low, finalized]` and drops abandoned requests.
    pub async fn advance(
        &self,
        low: u64,
        finalized: u64,
        timeout: Duration,
        now: u64,
    ) -> Result<u64, WatermarkErr> {
        if low > finalized {
            return Ok(finalized);
        }

        let logs = self.source.logs(low, finalized).await?;
        let mut classified = self.classifier.classify(&logs);

        let cutoff = now.saturating_sub(timeout.as_secs());
        let mut timestamps = HashMap::new();
        let mut outstanding = Vec::with_capacity(classified.unfulfilled.len());
        for req in classified.unfulfilled.drain(..) {
            let ts = self.timestamp_of(&req.log, &mut timestamps).await?;
            if ts < cutoff {
                tracing::debug!(
                    "Request 0x{:x} from block {} exceeded the request timeout, abandoning",
                    req.request_id(),
                    req.block_number()
                );
                continue;
            }
            outstanding.push(req);
        }
        classified.unfulfilled = outstanding;

        let watermark = Self::watermark(&classified, finalized);
        tracing::debug!("Advanced watermark from {low} to {watermark} (finalized {finalized})");
        Ok(watermark)
    }

    fn watermark(classified: &ClassifiedWindow, finalized: u64) -> u64 {
        classified.min_unfulfilled_block().map_or(finalized, |block| block.min(finalized))
    }

    async fn logs_newer_than(&self, logs: Vec<Log>, cutoff: u64) -> Result<Vec<Log>, WatermarkErr> {
        let mut timestamps = HashMap::new();
        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            if self.timestamp_of(&log, &mut timestamps).await? >= cutoff {
                out.push(log);
            }
        }
        Ok(out)
    }

    async fn timestamp_of(
        &self,
        log: &Log,
        cache: &mut HashMap<u64, u64>,
    ) -> Result<u64, WatermarkErr> {
        if let Some(ts) = log.block_timestamp {
            return Ok(ts);
        }
        let Some(block_number) = log.block_number else {
            return Ok(0);
        };
        if let Some(ts) = cache.get(&block_number) {
            return Ok(*ts);
        }
        let ts = self.source.block_timestamp(block_number).await?;
        cache.insert(block_number, ts);
        Ok(ts)
    }
}
