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

//! Request eligibility: reorg-aware confirmation depth and retry backoff.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    time::Duration,
};

use alloy::primitives::U256;
use chrono::{DateTime, Utc};

use crate::{
    config::ListenerConfig,
    events::{LogPosition, RequestEvent},
};

/// Upper bound on required confirmations, kept well inside the 256 block blockhash window
pub const MAX_CONFIRMATIONS: u64 = 200;

/// Fulfillment counts are retained for this many blocks behind the head
pub const RESPONSE_RETENTION_BLOCKS: u64 = 10_000;

const BACKOFF_FACTOR: f64 = 1.3;

/// A request waiting to become eligible for fulfillment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub req: RequestEvent,
    pub confirmed_at_block: u64,
    pub attempts: u32,
    pub last_try: Option<DateTime<Utc>>,
    /// First time this log position was seen
    pub utc_timestamp: DateTime<Utc>,
}

impl PendingRequest {
    pub fn new(req: RequestEvent, confirmed_at_block: u64, now: DateTime<Utc>) -> Self {
        Self { req, confirmed_at_block, attempts: 0, last_try: None, utc_timestamp: now }
    }

    /// True once the request has been outstanding longer than `timeout`
    pub fn expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| self.utc_timestamp.checked_add_signed(timeout))
            .is_some_and(|deadline| deadline < now)
    }

    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_try = Some(now);
    }
}

/// Decides when requests are confirmed deep enough and due for another try
#[derive(Debug, Clone)]
pub struct ConfirmationGuard {
    node_min_confs: u64,
    requested_confs_delay: u64,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl ConfirmationGuard {
    pub fn new(
        node_min_confs: u64,
        requested_confs_delay: u64,
        backoff_initial: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self { node_min_confs, requested_confs_delay, backoff_initial, backoff_max }
    }

    pub fn from_config(config: &ListenerConfig) -> Self {
        Self::new(
            config.min_incoming_confirmations.into(),
            config.requested_confs_delay,
            Duration::from_millis(config.backoff_initial_delay_ms),
            Duration::from_millis(config.backoff_max_delay_ms),
        )
    }

    /// Block at which a request becomes eligible.
    ///
    /// Every fulfillment already seen for the request doubles the required depth, capped at
    /// [MAX_CONFIRMATIONS].
    pub fn confirmed_at(&self, request_block: u64, requested_confs: u64, dupe_count: u64) -> u64 {
        let min_confs =
            self.node_min_confs.max(requested_confs.saturating_add(self.requested_confs_delay));
        let shift = u32::try_from(dupe_count).unwrap_or(u32::MAX);
        let confs = match 1u64.checked_shl(shift) {
            Some(multiplier) => min_confs.saturating_mul(multiplier).min(MAX_CONFIRMATIONS),
            None if min_confs == 0 => 0,
            None => MAX_CONFIRMATIONS,
        };
        request_block.saturating_add(confs)
    }

    /// Eligibility of a request observed with `dupe_count` prior fulfillments
    pub fn confirmed_at_for(&self, req: &RequestEvent, dupe_count: u64) -> u64 {
        let confirmed_at = self.confirmed_at(
            req.block_number(),
            req.min_request_confirmations().into(),
            dupe_count,
        );
        if dupe_count > 0 {
            tracing::warn!(
                "Duplicate request 0x{:x} found after fulfillment in tx {} (block {}), doubling incoming confirmations to block {confirmed_at}",
                req.request_id(),
                req.position.tx_hash,
                req.block_number()
            );
        }
        confirmed_at
    }

    /// Earliest time a request may be retried after `attempts` tries
    pub fn next_try(&self, attempts: u32, last: DateTime<Utc>) -> DateTime<Utc> {
        let factor = BACKOFF_FACTOR.powi(attempts.saturating_sub(1) as i32);
        let max_factor = self.backoff_max.as_secs_f64() / self.backoff_initial.as_secs_f64();
        let delay = if factor > max_factor {
            self.backoff_max
        } else {
            self.backoff_initial.mul_f64(factor)
        };
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| last.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the request is confirmed at `latest_head` and its backoff has elapsed.
    /// A retry becomes due at exactly [Self::next_try].
    pub fn ready(&self, pending: &PendingRequest, latest_head: u64, now: DateTime<Utc>) -> bool {
        if pending.confirmed_at_block > latest_head {
            return false;
        }

        if self.backoff_initial.is_zero() || pending.attempts == 0 {
            return true;
        }

        match pending.last_try {
            Some(last) => now >= self.next_try(pending.attempts, last),
            None => true,
        }
    }
}

/// On-chain fulfillment counts per request ID, pruned by block age
#[derive(Debug, Default)]
pub struct ResponseCounts {
    counts: HashMap<U256, u64>,
    seen: HashSet<LogPosition>,
    by_block: BinaryHeap<Reverse<(u64, U256, LogPosition)>>,
}

impl ResponseCounts {
    /// Records a fulfillment log. Returns false if the log position was already counted.
    pub fn record(&mut self, request_id: U256, position: LogPosition) -> bool {
        if !self.seen.insert(position) {
            return false;
        }
        *self.counts.entry(request_id).or_default() += 1;
        self.by_block.push(Reverse((position.block_number, request_id, position)));
        true
    }

    pub fn count(&self, request_id: &U256) -> u64 {
        self.counts.get(request_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Drops every entry recorded at or before `latest_head - RESPONSE_RETENTION_BLOCKS`
    pub fn prune(&mut self, latest_head: u64) -> usize {
        let threshold = latest_head.saturating_sub(RESPONSE_RETENTION_BLOCKS);
        let mut pruned = 0;
        while let Some(Reverse((block, _, _))) = self.by_block.peek() {
            if *block > threshold {
                break;
            }
            let Some(Reverse((_, request_id, position))) = self.by_block.pop() else {
                break;
            };
            self.counts.remove(&request_id);
            self.seen.remove(&position);
            pruned += 1;
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_utils::*;
    use proptest::prelude::*;

    fn guard(node_min_confs: u64, delay: u64) -> ConfirmationGuard {
        ConfirmationGuard::new(node_min_confs, delay, Duration::ZERO, Duration::from_secs(3600))
    }

    #[test]
    fn confirmed_at_uses_requested_confs() {
        assert_eq!(guard(10, 10).confirmed_at(100, 100, 0), 210);
        assert_eq!(guard(10, 0).confirmed_at(100, 100, 0), 200);
        assert_eq!(guard(10, 0).confirmed_at(100, 3, 0), 110);
    }

    #[test]
    fn confirmed_at_doubles_per_duplicate() {
        let guard = guard(3, 0);
        assert_eq!(guard.confirmed_at(100, 3, 0), 103);
        assert_eq!(guard.confirmed_at(100, 3, 1), 106);
        assert_eq!(guard.confirmed_at(100, 3, 2), 112);
        assert_eq!(guard.confirmed_at(100, 3, 10), 300);
        assert_eq!(guard.confirmed_at(100, 3, 100), 300);
        assert_eq!(guard.confirmed_at(u64::MAX - 1, 3, 0), u64::MAX);
    }

    #[test]
    fn backoff_schedule() {
        let guard = ConfirmationGuard::new(
            3,
            0,
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let last = DateTime::<Utc>::from_timestamp(1_000_000, 0).unwrap();
        assert_eq!(guard.next_try(1, last), last + chrono::Duration::seconds(10));
        assert_eq!(guard.next_try(2, last), last + chrono::Duration::seconds(13));
        assert_eq!(guard.next_try(20, last), last + chrono::Duration::seconds(60));
    }

    #[test]
    fn ready_respects_backoff() {
        let guard = ConfirmationGuard::new(
            3,
            0,
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let now = DateTime::<Utc>::from_timestamp(1_000_000, 0).unwrap();
        let mut pending = PendingRequest::new(V2RequestBuilder::new(1, 100).build(), 103, now);
        assert!(!guard.ready(&pending, 102, now));
        assert!(guard.ready(&pending, 103, now));

        pending.record_attempt(now);
        assert!(!guard.ready(&pending, 103, now + chrono::Duration::seconds(9)));
        assert!(guard.ready(&pending, 103, now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn retry_due_at_next_try() {
        let guard = ConfirmationGuard::new(
            3,
            0,
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let now = DateTime::<Utc>::from_timestamp(1_000_000, 0).unwrap();
        let mut pending = PendingRequest::new(V2RequestBuilder::new(1, 100).build(), 103, now);
        pending.record_attempt(now);
        pending.record_attempt(now);

        let due = guard.next_try(pending.attempts, now);
        assert_eq!(due, now + chrono::Duration::seconds(13));
        assert!(!guard.ready(&pending, 103, due - chrono::Duration::milliseconds(1)));
        assert!(guard.ready(&pending, 103, due));
    }

    #[test]
    fn expiry() {
        let now = DateTime::<Utc>::from_timestamp(1_000_000, 0).unwrap();
        let pending = PendingRequest::new(V2RequestBuilder::new(1, 100).build(), 103, now);
        let timeout = Duration::from_secs(60);
        assert!(!pending.expired(timeout, now + chrono::Duration::seconds(60)));
        assert!(pending.expired(timeout, now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn response_counts_dedup_and_prune() {
        let mut counts = ResponseCounts::default();
        let id = U256::from(1);
        assert!(counts.record(id, position(100, 0)));
        assert!(!counts.record(id, position(100, 0)));
        assert!(counts.record(id, position(200, 0)));
        assert!(counts.record(U256::from(2), position(20_000, 0)));
        assert_eq!(counts.count(&id), 2);

        // Nothing old enough yet
        assert_eq!(counts.prune(10_099), 0);
        assert_eq!(counts.prune(10_100), 1);
        assert_eq!(counts.count(&id), 0);
        assert_eq!(counts.count(&U256::from(2)), 1);

        // Early heads never underflow into pruning everything
        let mut counts = ResponseCounts::default();
        counts.record(id, position(5, 0));
        assert_eq!(counts.prune(50), 0);
        assert_eq!(counts.len(), 1);
    }

    proptest! {
        #[test]
        fn ready_without_backoff_matches_depth(
            block in 0u64..1_000_000,
            confs in 0u64..300,
            node_confs in 0u64..300,
            dupes in 0u64..10,
            head in 0u64..1_001_000,
        ) {
            let guard = guard(node_confs, 0);
            let confirmed_at = guard.confirmed_at(block, confs, dupes);
            let now = Utc::now();
            let pending = PendingRequest {
                req: V2RequestBuilder::new(1, block).build(),
                confirmed_at_block: confirmed_at,
                attempts: 0,
                last_try: None,
                utc_timestamp: now,
            };
            prop_assert_eq!(guard.ready(&pending, head, now), confirmed_at <= head);
        }

        #[test]
        fn confirmations_monotonic_and_capped(
            block in 0u64..1_000_000,
            confs in 0u64..300,
            node_confs in 1u64..300,
            dupes in 0u64..70,
        ) {
            let guard = guard(node_confs, 0);
            let a = guard.confirmed_at(block, confs, dupes);
            let b = guard.confirmed_at(block, confs, dupes + 1);
            prop_assert!(a <= b);
            prop_assert!(b - block <= MAX_CONFIRMATIONS);
            if dupes >= 8 {
                prop_assert_eq!(b - block, MAX_CONFIRMATIONS);
            }
        }
    }
}
