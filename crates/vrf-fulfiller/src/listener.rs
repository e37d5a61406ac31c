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

//! The polling loop: logs in, ready requests out to the scheduler.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    classifier::LogClassifier,
    config::{ConfigErr, ConfigLock},
    confirmation::{ConfirmationGuard, PendingRequest},
    coordinator::CoordinatorObj,
    errors::{impl_coded_debug, CodedError},
    events::LogPosition,
    fees::GAS_PROOF_VERIFICATION,
    log_source::{LogSourceErr, LogSourceObj},
    scheduler::Scheduler,
    state::SchedulerState,
    task::{RetryRes, RetryTask, SupervisorErr},
    watermark::{WatermarkErr, WatermarkTracker},
};

/// Bound on the startup read of the coordinator config
const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error)]
pub enum ListenerErr {
    #[error("{code} Log source error: {0}", code = self.code())]
    LogSourceErr(#[from] LogSourceErr),

    #[error("{code} Watermark error: {0}", code = self.code())]
    WatermarkErr(#[from] WatermarkErr),

    #[error("{code} Config error: {0}", code = self.code())]
    ConfigErr(#[from] ConfigErr),
}

impl_coded_debug!(ListenerErr);

impl CodedError for ListenerErr {
    fn code(&self) -> &str {
        match self {
            ListenerErr::LogSourceErr(_) => "[V-LSN-001]",
            ListenerErr::WatermarkErr(_) => "[V-LSN-002]",
            ListenerErr::ConfigErr(_) => "[V-LSN-003]",
        }
    }
}

/// State carried between ticks
#[derive(Debug, Default)]
struct PollState {
    /// Lowest block still to scan, unset until the startup replay ran
    watermark: Option<u64>,
    pending: HashMap<LogPosition, PendingRequest>,
}

/// Outcome of one tick, for logging and tests
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub pending: usize,
    pub ready: usize,
    pub processed: usize,
    /// Queued fulfillments dropped because their request was already fulfilled
    pub abandoned: usize,
    pub watermark: u64,
}

#[derive(Clone)]
pub struct Listener {
    log_source: LogSourceObj,
    classifier: LogClassifier,
    watermark: Arc<WatermarkTracker>,
    coordinator: CoordinatorObj,
    scheduler: Scheduler,
    state: Arc<SchedulerState>,
    config: ConfigLock,
    poll: Arc<Mutex<PollState>>,
}

impl Listener {
    pub fn new(
        log_source: LogSourceObj,
        classifier: LogClassifier,
        coordinator: CoordinatorObj,
        scheduler: Scheduler,
        state: Arc<SchedulerState>,
        config: ConfigLock,
    ) -> Self {
        let watermark = Arc::new(WatermarkTracker::new(log_source.clone(), classifier));
        Self {
            log_source,
            classifier,
            watermark,
            coordinator,
            scheduler,
            state,
            config,
            poll: Arc::new(Mutex::new(PollState::default())),
        }
    }

    /// Warns when the configured gas limit cannot cover the coordinator's max callback gas
    pub async fn check_gas_limit(&self) -> Result<(), ListenerErr> {
        let configured = self.config.gas()?.vrf_gas_limit();
        match tokio::time::timeout(STARTUP_CHECK_TIMEOUT, self.coordinator.max_gas_limit()).await {
            Ok(Ok(max_gas_limit)) => {
                let required = max_gas_limit.saturating_add(GAS_PROOF_VERIFICATION);
                if configured < required {
                    tracing::error!(
                        "CRITICAL: gas limit {configured} is below the coordinator max gas limit {max_gas_limit} plus proof verification, set gas.limit_vrf to at least {required}"
                    );
                }
            }
            Ok(Err(err)) => {
                tracing::warn!("Failed to read coordinator config for gas limit check: {err}");
            }
            Err(_) => {
                tracing::warn!(
                    "Timed out reading coordinator config for gas limit check after {STARTUP_CHECK_TIMEOUT:?}"
                );
            }
        }
        Ok(())
    }

    /// One polling pass
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, ListenerErr> {
        let listener = self.config.listener()?;
        let guard = ConfirmationGuard::from_config(&listener);
        let timeout = listener.request_timeout();
        let now_secs = now.timestamp().max(0) as u64;

        let head = self.log_source.heads().await?;
        self.state.set_latest_head(head.latest);
        let abandoned = self.scheduler.screen_queued().await;

        let mut poll = self.poll.lock().await;
        let low = match poll.watermark {
            Some(low) => low,
            None => {
                let low = self.watermark.initial(head.finalized, timeout, now_secs).await?;
                poll.watermark = Some(low);
                low
            }
        };

        let logs = self.log_source.logs(low, head.latest).await?;
        let window = self.classifier.classify(&logs);
        for ful in &window.fulfillment_logs {
            self.state.record_fulfillment(ful.request_id, ful.position);
        }

        // Rebuilt from the window, requests that were fulfilled or reorged out drop here
        let mut previous = std::mem::take(&mut poll.pending);
        for req in window.unfulfilled {
            if self.state.is_inflight(&req.position) {
                continue;
            }
            let confirmed_at =
                guard.confirmed_at_for(&req, self.state.response_count(&req.request_id()));
            let pending = match previous.remove(&req.position) {
                Some(mut pending) => {
                    pending.confirmed_at_block = confirmed_at;
                    pending
                }
                None => PendingRequest::new(req, confirmed_at, now),
            };
            poll.pending.insert(pending.req.position, pending);
        }

        let ready: Vec<PendingRequest> = poll
            .pending
            .values()
            .filter(|pending| guard.ready(pending, head.latest, now))
            .cloned()
            .collect();
        let ready_positions: Vec<LogPosition> = ready.iter().map(|p| p.req.position).collect();
        tracing::debug!(
            "{} pending requests, {} ready at head {} (finalized {})",
            poll.pending.len(),
            ready.len(),
            head.latest,
            head.finalized
        );

        let processed = self.scheduler.process(ready, now).await;

        let mut done = vec![];
        for position in &ready_positions {
            let Some(pending) = poll.pending.get_mut(position) else {
                continue;
            };
            if processed.contains(&pending.req.request_id()) {
                done.push(*position);
            } else {
                pending.record_attempt(now);
            }
        }
        for position in &done {
            poll.pending.remove(position);
        }
        self.state.mark_inflight(done.iter().copied());

        let watermark = self.watermark.advance(low, head.finalized, timeout, now_secs).await?;
        poll.watermark = Some(watermark);
        let evicted = self.state.evict_inflight_below(watermark);
        let pruned = self.state.prune_responses();
        tracing::trace!("Evicted {evicted} inflight positions, pruned {pruned} response counts");

        Ok(TickSummary {
            pending: poll.pending.len(),
            ready: ready_positions.len(),
            processed: done.len(),
            abandoned,
            watermark,
        })
    }
}

impl RetryTask for Listener {
    type Error = ListenerErr;

    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
        let self_clone = self.clone();

        Box::pin(async move {
            tracing::info!("Starting VRF listener");
            self_clone.check_gas_limit().await.map_err(SupervisorErr::Recover)?;

            loop {
                let poll_period = self_clone
                    .config
                    .listener()
                    .map_err(|err| SupervisorErr::Recover(ListenerErr::from(err)))?
                    .poll_period();

                match self_clone.tick(Utc::now()).await {
                    Ok(summary) => tracing::debug!("Listener tick finished: {summary:?}"),
                    Err(err) => tracing::warn!("Listener tick failed, retrying next tick: {err}"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_period) => {}
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Listener received cancellation");
                        return Ok(());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain_monitor::ChainHead,
        events::{
            test_utils::{key_hash, position, v2_fulfillment_log, V2RequestBuilder},
            CoordinatorVersion, SubId,
        },
        log_source::test_utils::MockLogSource,
        scheduler::test_utils::Harness,
        simulation::test_utils::{success_run, v2_payload},
    };
    use tracing_test::traced_test;

    struct Setup {
        h: Harness,
        source: Arc<MockLogSource>,
        listener: Listener,
    }

    async fn setup(head: ChainHead) -> Setup {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        let source = Arc::new(MockLogSource::new(1, head));
        let listener = Listener::new(
            source.clone(),
            LogClassifier::new(CoordinatorVersion::V2, key_hash()),
            h.coordinator.clone(),
            h.scheduler.clone(),
            h.state.clone(),
            h.config.clone(),
        );
        Setup { h, source, listener }
    }

    /// Time of block `n` on the mock chain
    fn at_block(n: u64) -> DateTime<Utc> {
        DateTime::from_timestamp((n * 12) as i64, 0).unwrap()
    }

    #[tokio::test]
    async fn ready_request_enqueued_once() {
        let s = setup(ChainHead { latest: 110, finalized: 90 }).await;
        s.h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        s.source.push(V2RequestBuilder::new(1, 100).log());
        s.h.pipeline.set_run(1, success_run(v2_payload(1, 1, 100_000), 300_000, 100));

        let summary = s.listener.tick(at_block(110)).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.pending, 0);
        assert_eq!(summary.watermark, 90);
        assert!(s.h.state.is_inflight(&position(100, 1)));

        // The same log position is not handed out again
        let summary = s.listener.tick(at_block(111)).await.unwrap();
        assert_eq!(summary.ready, 0);
        assert_eq!(s.h.reserved_txes("1").await.len(), 1);
        assert_eq!(s.h.pipeline.call_count(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn queued_fulfillment_dropped_once_fulfilled() {
        let s = setup(ChainHead { latest: 110, finalized: 90 }).await;
        s.h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        s.source.push(V2RequestBuilder::new(1, 100).log());
        s.h.pipeline.set_run(1, success_run(v2_payload(1, 1, 100_000), 300_000, 100));

        let summary = s.listener.tick(at_block(110)).await.unwrap();
        assert_eq!((summary.processed, summary.abandoned), (1, 0));
        assert_eq!(s.h.reserved_txes("1").await.len(), 1);

        // Fulfilled by another node before the tx was picked up for broadcast
        s.h.coordinator.mark_fulfilled(1);
        let summary = s.listener.tick(at_block(111)).await.unwrap();
        assert_eq!(summary.abandoned, 1);
        assert!(s.h.reserved_txes("1").await.is_empty());
        assert!(logs_contain("already fulfilled, abandoned queued tx"));
    }

    #[tokio::test]
    async fn waits_for_confirmations() {
        let s = setup(ChainHead { latest: 102, finalized: 90 }).await;
        s.h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        s.source.push(V2RequestBuilder::new(1, 100).log());
        s.h.pipeline.set_run(1, success_run(v2_payload(1, 1, 100_000), 300_000, 100));

        let summary = s.listener.tick(at_block(102)).await.unwrap();
        assert_eq!((summary.pending, summary.ready), (1, 0));

        s.source.set_head(ChainHead { latest: 103, finalized: 90 });
        let summary = s.listener.tick(at_block(103)).await.unwrap();
        assert_eq!(summary.processed, 1);
    }

    #[tokio::test]
    async fn fulfilled_requests_are_not_pending() {
        let s = setup(ChainHead { latest: 110, finalized: 105 }).await;
        s.source.push(V2RequestBuilder::new(1, 100).log());
        s.source.push(v2_fulfillment_log(1, true, position(106, 0)));

        let summary = s.listener.tick(at_block(110)).await.unwrap();
        assert_eq!(summary.pending, 0);
        // The fulfillment is not finalized yet, the request block stays the low mark
        assert_eq!(summary.watermark, 100);
        assert_eq!(s.h.state.response_count(&alloy::primitives::U256::from(1)), 1);
    }

    #[tokio::test]
    async fn unprocessed_requests_back_off() {
        let s = setup(ChainHead { latest: 110, finalized: 90 }).await;
        s.h.config.load_write().unwrap().listener.backoff_initial_delay_ms = 60_000;
        // No subscription balance, the request stays pending
        s.h.coordinator.set_sub(SubId::V2(1), 0, 0);
        s.source.push(V2RequestBuilder::new(1, 100).log());
        s.h.pipeline.set_run(1, success_run(v2_payload(1, 1, 100_000), 300_000, 100));

        let now = at_block(110);
        let summary = s.listener.tick(now).await.unwrap();
        assert_eq!((summary.ready, summary.processed, summary.pending), (1, 0, 1));
        assert_eq!(summary.watermark, 90);

        let summary = s.listener.tick(now + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(summary.ready, 0);

        let summary = s.listener.tick(now + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(summary.ready, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn gas_limit_check() {
        let s = setup(ChainHead::default()).await;
        *s.h.coordinator.max_gas_limit.lock().unwrap() = Some(2_500_000);
        s.listener.check_gas_limit().await.unwrap();
        assert!(logs_contain("CRITICAL: gas limit 500000"));

        *s.h.coordinator.max_gas_limit.lock().unwrap() = None;
        s.listener.check_gas_limit().await.unwrap();
        assert!(logs_contain("Failed to read coordinator config"));
    }
}
