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

//! Balance aware scheduling of ready requests, per subscription and payment currency.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use alloy::primitives::{Address, Bytes, U256};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    batch::{BatchBuilder, BatchErr, BatchItem},
    checker::VrfTransmitChecker,
    config::{ConfigErr, ConfigLock, ListenerConfig},
    confirmation::PendingRequest,
    coordinator::{ChainClientObj, CoordinatorErr, CoordinatorObj, Subscription},
    db::DbError,
    errors::{impl_coded_debug, CodedError},
    events::{CoordinatorVersion, SubId},
    fees,
    force_fulfill::{ForceFulfiller, ForceFulfillment},
    simulation::{Simulated, SimulationError, SimulationResult, Simulator},
    state::SchedulerState,
    txm::{
        request_id_hash, SendStrategy, TransmitCheckerSpec, Tx, TxManagerObj, TxMeta, TxRequest,
        TxState,
    },
};

/// Blocks behind the head used for commitment reads, the newest blocks are often not indexed yet
pub(crate) const COMMITMENT_READ_LAG: u64 = 5;

#[derive(Error)]
pub enum SchedulerErr {
    #[error("{code} No from addresses configured", code = self.code())]
    NoFromAddresses,

    #[error("{code} Failed to read reserved funds: {0}", code = self.code())]
    Reservation(#[from] DbError),

    #[error("{code} Invalid reserved fee in tx meta: {0}", code = self.code())]
    InvalidReservedFee(String),

    #[error("{code} Config error: {0}", code = self.code())]
    Config(#[from] ConfigErr),
}

impl_coded_debug!(SchedulerErr);

impl CodedError for SchedulerErr {
    fn code(&self) -> &str {
        match self {
            SchedulerErr::NoFromAddresses => "[V-SCH-001]",
            SchedulerErr::Reservation(_) => "[V-SCH-002]",
            SchedulerErr::InvalidReservedFee(_) => "[V-SCH-003]",
            SchedulerErr::Config(_) => "[V-SCH-004]",
        }
    }
}

/// Sending keys, handed out round robin
#[derive(Debug)]
pub struct FromAddresses {
    addresses: Vec<Address>,
    next: AtomicUsize,
}

impl FromAddresses {
    pub fn new(addresses: Vec<Address>) -> Result<Self, SchedulerErr> {
        if addresses.is_empty() {
            return Err(SchedulerErr::NoFromAddresses);
        }
        Ok(Self { addresses, next: AtomicUsize::new(0) })
    }

    /// All keys share the key specific max gas price of the first one
    pub fn first(&self) -> Address {
        self.addresses[0]
    }

    pub fn next(&self) -> Address {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.addresses[idx % self.addresses.len()]
    }
}

/// Balance state of one currency of a subscription during a scheduling pass
#[derive(Debug, Clone)]
struct Subset {
    sub_id: SubId,
    active: bool,
    native: bool,
    start_balance: U256,
    spendable: U256,
}

impl Subset {
    fn currency(&self) -> &'static str {
        if self.native {
            "native"
        } else {
            "LINK"
        }
    }
}

/// Config snapshot for one scheduling pass
struct Tick {
    listener: ListenerConfig,
    max_gas_price: U256,
}

enum Step {
    Processed,
    Batched,
    Pending,
    /// Out of balance, stop admitting requests of this subset
    Stop,
}

/// Schedules ready requests for fulfillment
#[derive(Clone)]
pub struct Scheduler {
    coordinator: CoordinatorObj,
    batch_coordinator: Option<Address>,
    chain: ChainClientObj,
    txm: TxManagerObj,
    simulator: Simulator,
    force: ForceFulfiller,
    state: Arc<SchedulerState>,
    config: ConfigLock,
    from_addresses: Arc<FromAddresses>,
    checker: VrfTransmitChecker,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: CoordinatorObj,
        batch_coordinator: Option<Address>,
        chain: ChainClientObj,
        txm: TxManagerObj,
        simulator: Simulator,
        force: ForceFulfiller,
        state: Arc<SchedulerState>,
        config: ConfigLock,
        from_addresses: Arc<FromAddresses>,
    ) -> Self {
        let checker = VrfTransmitChecker::new(coordinator.clone(), state.clone());
        Self {
            coordinator,
            batch_coordinator,
            chain,
            txm,
            simulator,
            force,
            state,
            config,
            from_addresses,
            checker,
        }
    }

    fn version(&self) -> CoordinatorVersion {
        self.coordinator.version()
    }

    /// Abandons queued single fulfillments whose request was fulfilled since they were enqueued
    pub async fn screen_queued(&self) -> usize {
        match self.checker.screen(&self.txm).await {
            Ok(abandoned) => abandoned,
            Err(err) => {
                tracing::error!("Failed to check queued fulfillments before broadcast: {err}");
                0
            }
        }
    }

    /// Processes ready requests and returns the IDs of those that need no further attention
    pub async fn process(&self, ready: Vec<PendingRequest>, now: DateTime<Utc>) -> HashSet<U256> {
        let mut processed = HashSet::new();
        if ready.is_empty() {
            tracing::info!("No pending requests ready for processing");
            return processed;
        }

        let tick = match self.tick_config() {
            Ok(tick) => tick,
            Err(err) => {
                tracing::error!("Failed to read config, skipping scheduling pass: {err}");
                return processed;
            }
        };

        let mut by_sub: BTreeMap<SubId, Vec<PendingRequest>> = BTreeMap::new();
        for pending in ready {
            by_sub.entry(pending.req.sub_id()).or_default().push(pending);
        }

        for (sub_id, mut reqs) in by_sub {
            // Active subscriptions may legitimately hold a zero balance
            let sub = match self.coordinator.get_subscription(sub_id).await {
                Ok(sub) => sub,
                Err(CoordinatorErr::SubscriptionNotFound(_)) => {
                    tracing::warn!(
                        "Subscription {sub_id} not found, setting start balance to zero"
                    );
                    Subscription::canceled()
                }
                Err(err) => {
                    tracing::error!("Unable to read subscription balance of {sub_id}: {err}");
                    break;
                }
            };

            // Cheapest first, as many requests as possible get serviced before funds run out
            reqs.sort_by_key(|pending| pending.req.callback_gas_limit());
            processed.extend(self.process_sub(sub_id, sub, reqs, &tick, now).await);
        }

        processed
    }

    fn tick_config(&self) -> Result<Tick, SchedulerErr> {
        let listener = self.config.listener()?;
        let gas = self.config.gas()?;
        let max_gas_price = U256::from(gas.price_max_key(&self.from_addresses.first()));
        Ok(Tick { listener, max_gas_price })
    }

    /// Sum of max fees of transactions that may still charge the subscription, (LINK, native)
    async fn reserved(&self, sub_id: SubId) -> Result<(U256, U256), SchedulerErr> {
        let txes = self
            .txm
            .find_txes_by_meta_field_and_states(
                sub_id.meta_key(),
                &sub_id.to_string(),
                &TxState::RESERVED,
            )
            .await?;

        let mut link = U256::ZERO;
        let mut native = U256::ZERO;
        for tx in &txes {
            if let Some(max_link) = &tx.meta.max_link {
                link = link.saturating_add(parse_fee(tx, max_link)?);
            }
            if self.version() == CoordinatorVersion::V2Plus {
                if let Some(max_eth) = &tx.meta.max_eth {
                    native = native.saturating_add(parse_fee(tx, max_eth)?);
                }
            }
        }
        Ok((link, native))
    }

    async fn process_sub(
        &self,
        sub_id: SubId,
        sub: Subscription,
        reqs: Vec<PendingRequest>,
        tick: &Tick,
        now: DateTime<Utc>,
    ) -> HashSet<U256> {
        let (reserved_link, reserved_native) = match self.reserved(sub_id).await {
            Ok(reserved) => reserved,
            Err(err) => {
                tracing::error!("Couldn't get reserved funds for subscription {sub_id}: {err}");
                return HashSet::new();
            }
        };

        let (native, link): (Vec<_>, Vec<_>) = reqs
            .into_iter()
            .filter(|pending| {
                let inflight = self.state.is_inflight(&pending.req.position);
                if inflight {
                    tracing::debug!(
                        "Skipping request 0x{:x}, already inflight",
                        pending.req.request_id()
                    );
                }
                !inflight
            })
            .partition(|pending| pending.req.native_payment());

        let native_subset = Subset {
            sub_id,
            active: sub.active,
            native: true,
            start_balance: sub.native_balance,
            spendable: sub.native_balance.saturating_sub(reserved_native),
        };
        let link_subset = Subset {
            sub_id,
            active: sub.active,
            native: false,
            start_balance: sub.balance,
            spendable: sub.balance.saturating_sub(reserved_link),
        };

        let (mut processed, link_processed) = tokio::join!(
            self.process_subset(native_subset, native, tick, now),
            self.process_subset(link_subset, link, tick, now)
        );
        processed.extend(link_processed);
        processed
    }

    async fn process_subset(
        &self,
        mut subset: Subset,
        reqs: Vec<PendingRequest>,
        tick: &Tick,
        now: DateTime<Utc>,
    ) -> HashSet<U256> {
        let mut processed = HashSet::new();
        if reqs.is_empty() {
            return processed;
        }
        let start = Instant::now();

        let batch_ceiling = match (tick.listener.batch_fulfillment_enabled, self.batch_coordinator)
        {
            (true, Some(_)) => match self.coordinator.max_gas_limit().await {
                Ok(max_gas_limit) => Some(fees::batch_gas_ceiling(max_gas_limit)),
                Err(err) => {
                    tracing::error!(
                        "Couldn't get config from coordinator, skipping {} requests of sub {}: {err}",
                        subset.currency(),
                        subset.sub_id
                    );
                    return processed;
                }
            },
            _ => None,
        };

        tracing::info!(
            "Processing {} {} requests for subscription {} (start balance {}, spendable {}, active {}, batch ceiling {:?})",
            reqs.len(),
            subset.currency(),
            subset.sub_id,
            subset.start_balance,
            subset.spendable,
            subset.active,
            batch_ceiling
        );

        let timeout = tick.listener.request_timeout();
        let (expired, ready): (Vec<_>, Vec<_>) =
            reqs.into_iter().partition(|pending| pending.expired(timeout, now));
        for pending in &expired {
            tracing::info!(
                "Request 0x{:x} (tx {}) expired, first seen {}",
                pending.req.request_id(),
                pending.req.position.tx_hash,
                pending.utc_timestamp
            );
            processed.insert(pending.req.request_id());
        }

        let chunk_size = (tick.listener.chunk_size as usize).max(1);
        for chunk in ready.chunks(chunk_size) {
            let unfulfilled = self.filter_fulfilled(chunk, &mut processed).await;
            let results = self.simulator.simulate_all(tick.max_gas_price, unfulfilled).await;

            let mut batches = batch_ceiling.map(|ceiling| BatchBuilder::new(self.version(), ceiling));
            let mut out_of_balance = false;
            for res in results {
                let request_id = res.req.req.request_id();
                let from = self.from_addresses.next();
                match self.handle_result(&mut subset, res, from, tick, batches.as_mut()).await {
                    Step::Processed => {
                        processed.insert(request_id);
                    }
                    Step::Batched | Step::Pending => {}
                    Step::Stop => {
                        out_of_balance = true;
                        break;
                    }
                }
            }

            if let Some(builder) = batches {
                processed.extend(self.submit_batches(&subset, builder, tick).await);
            }
            if out_of_balance {
                break;
            }
        }

        tracing::info!(
            "Finished processing {} requests for subscription {}: end balance {}, processed {}, took {:?}",
            subset.currency(),
            subset.sub_id,
            subset.spendable,
            processed.len(),
            start.elapsed()
        );
        processed
    }

    /// Drops requests whose commitment is already gone on chain, marking them processed
    async fn filter_fulfilled(
        &self,
        chunk: &[PendingRequest],
        processed: &mut HashSet<U256>,
    ) -> Vec<PendingRequest> {
        let read_block = self.state.latest_head().saturating_sub(COMMITMENT_READ_LAG);
        let queries: Vec<(U256, u64)> = chunk
            .iter()
            .map(|pending| (pending.req.request_id(), pending.req.block_number().max(read_block)))
            .collect();
        let commitments = self.coordinator.commitments(&queries).await;

        let mut unfulfilled = Vec::with_capacity(chunk.len());
        for (pending, commitment) in chunk.iter().zip(commitments) {
            match commitment {
                Ok(commitment) if commitment.is_zero() => {
                    tracing::info!(
                        "Request 0x{:x} (tx {}) already fulfilled, attempts {}",
                        pending.req.request_id(),
                        pending.req.position.tx_hash,
                        pending.attempts
                    );
                    processed.insert(pending.req.request_id());
                }
                Ok(_) => unfulfilled.push(pending.clone()),
                Err(err) => {
                    tracing::error!(
                        "Error checking whether request 0x{:x} (tx {}) is fulfilled, proceeding anyway: {err}",
                        pending.req.request_id(),
                        pending.req.position.tx_hash
                    );
                    unfulfilled.push(pending.clone());
                }
            }
        }
        unfulfilled
    }

    async fn handle_result(
        &self,
        subset: &mut Subset,
        res: SimulationResult,
        from: Address,
        tick: &Tick,
        batches: Option<&mut BatchBuilder>,
    ) -> Step {
        let SimulationResult { req: pending, funds_needed, outcome } = res;
        let request_id = pending.req.request_id();

        let simulated = match outcome {
            Ok(simulated) => simulated,
            Err(err) => {
                return self
                    .handle_failure(subset, &pending, funds_needed, err, from, tick)
                    .await
            }
        };

        if subset.spendable < simulated.max_fee {
            tracing::info!(
                "Insufficient balance to fulfill request 0x{request_id:x}: max fee {}, spendable {}",
                simulated.max_fee,
                subset.spendable
            );
            return Step::Stop;
        }

        let max_fee = simulated.max_fee;
        let simulated = match batches {
            Some(builder) => {
                let item = BatchItem {
                    request_id,
                    request_tx_hash: pending.req.position.tx_hash,
                    callback_gas_limit: pending.req.callback_gas_limit(),
                    simulated,
                };
                match builder.add(&item, from) {
                    Ok(()) => {
                        subset.spendable -= max_fee;
                        return Step::Batched;
                    }
                    Err(err @ BatchErr::ExceedsCeiling(..)) => {
                        tracing::info!(
                            "Request 0x{request_id:x} does not fit in a batch, fulfilling alone: {err}"
                        );
                        item.simulated
                    }
                    Err(err) => {
                        tracing::error!("Failed to batch request 0x{request_id:x}: {err}");
                        return Step::Pending;
                    }
                }
            }
            None => simulated,
        };

        match self.enqueue_single(subset.sub_id, &pending, simulated, from).await {
            Ok(tx) => {
                tracing::info!(
                    "Enqueued fulfillment of request 0x{request_id:x} as tx {} from {from}",
                    tx.id
                );
                subset.spendable -= max_fee;
                Step::Processed
            }
            Err(err) => {
                tracing::error!(
                    "Error enqueuing fulfillment of request 0x{request_id:x}, requeuing: {err}"
                );
                Step::Pending
            }
        }
    }

    async fn handle_failure(
        &self,
        subset: &Subset,
        pending: &PendingRequest,
        funds_needed: U256,
        err: SimulationError,
        from: Address,
        tick: &Tick,
    ) -> Step {
        let req = &pending.req;
        let request_id = req.request_id();
        match &err {
            SimulationError::BlockhashNotInStore(_) => {
                tracing::error!(
                    "CRITICAL: pipeline error for request 0x{request_id:x} (tx {}, block {}), blockhash backfill required: {err}",
                    req.position.tx_hash,
                    req.block_number()
                );
                return Step::Pending;
            }
            SimulationError::ProofVerificationFailed(_) => {
                tracing::info!(
                    "Proof reverted in simulation for request 0x{request_id:x}, likely stale blockhash"
                );
                return Step::Processed;
            }
            _ => {}
        }

        tracing::error!(
            "Pipeline error for request 0x{request_id:x} (tx {}, block {}, attempts {}): {err}",
            req.position.tx_hash,
            req.block_number(),
            pending.attempts
        );

        if !subset.active {
            tracing::warn!(
                "Force fulfilling request 0x{request_id:x} of canceled subscription {}",
                subset.sub_id
            );
            let (payload, gas_limit) = match &err {
                SimulationError::PossiblyInsufficientFunds { vrf, gas_limit, .. } => (
                    vrf.as_ref().map(|vrf| vrf.payload.clone()).unwrap_or_default(),
                    *gas_limit,
                ),
                _ => (Bytes::new(), 0),
            };
            let fulfillment = ForceFulfillment {
                request_id,
                sub_id: req.sub_id(),
                request_tx_hash: req.position.tx_hash,
                payload,
                gas_limit,
                attempt: None,
            };
            return match self.force.enqueue(fulfillment, from).await {
                Ok(tx) => {
                    tracing::info!(
                        "Enqueued force fulfillment of request 0x{request_id:x} as tx {}",
                        tx.id
                    );
                    Step::Processed
                }
                Err(err) => {
                    tracing::error!(
                        "Error enqueuing force fulfillment of request 0x{request_id:x}, requeuing: {err}"
                    );
                    Step::Pending
                }
            };
        }

        if matches!(err, SimulationError::PossiblyInsufficientFunds { .. })
            && subset.spendable < funds_needed
        {
            tracing::info!(
                "Insufficient balance to fulfill request 0x{request_id:x} based on estimate: needed {funds_needed}, spendable {}",
                subset.spendable
            );
            return Step::Stop;
        }

        if !self.consumer_valid(pending, tick.listener.finality_depth).await {
            tracing::info!(
                "Dropping request 0x{request_id:x} made by invalid consumer {} (block {}, block hash {})",
                req.sender(),
                req.block_number(),
                req.position.block_hash
            );
            return Step::Processed;
        }

        Step::Pending
    }

    /// A consumer without code is invalid, but only once the request is past finality
    async fn consumer_valid(&self, pending: &PendingRequest, finality_depth: u64) -> bool {
        let head = self.state.latest_head();
        if head.saturating_sub(pending.req.block_number()) <= finality_depth {
            return true;
        }
        match self.chain.code_at(pending.req.sender(), head).await {
            Ok(code) => !code.is_empty(),
            Err(err) => {
                tracing::warn!(
                    "Failed to fetch contract code of consumer {}: {err}",
                    pending.req.sender()
                );
                true
            }
        }
    }

    async fn enqueue_single(
        &self,
        sub_id: SubId,
        pending: &PendingRequest,
        simulated: Simulated,
        from: Address,
    ) -> Result<Tx, DbError> {
        let meta = TxMeta {
            request_id: Some(request_id_hash(pending.req.request_id())),
            request_tx_hash: Some(pending.req.position.tx_hash),
            ..Default::default()
        }
        .with_sub_id(sub_id)
        .with_max_fee(simulated.max_fee, simulated.vrf.fulfillment.native_payment());

        self.txm
            .create_transaction(TxRequest {
                from,
                to: self.coordinator.address(),
                payload: simulated.vrf.payload,
                fee_limit: simulated.gas_limit,
                strategy: SendStrategy::SendEvery,
                meta,
                checker: Some(TransmitCheckerSpec::vrf(
                    self.version(),
                    self.coordinator.address(),
                    pending.req.block_number(),
                )),
            })
            .await
    }

    /// Enqueues every built batch, returns the request IDs of enqueued batches
    async fn submit_batches(
        &self,
        subset: &Subset,
        builder: BatchBuilder,
        tick: &Tick,
    ) -> Vec<U256> {
        let mut enqueued = vec![];
        let Some(batch_coordinator) = self.batch_coordinator else {
            return enqueued;
        };

        for batch in builder.into_batches() {
            tracing::debug!(
                "Processing batch of {} fulfillments, total gas {}",
                batch.len(),
                batch.total_gas_limit
            );
            let req = match batch.tx_request(
                batch_coordinator,
                subset.sub_id,
                subset.native,
                tick.listener.batch_fulfillment_gas_multiplier,
            ) {
                Ok(req) => req,
                Err(err) => {
                    tracing::error!("Failed to build batch transaction: {err}");
                    continue;
                }
            };
            match self.txm.create_transaction(req).await {
                Ok(tx) => {
                    tracing::info!(
                        "Enqueued batch fulfillment tx {} for {} requests of subscription {}",
                        tx.id,
                        batch.len(),
                        subset.sub_id
                    );
                    enqueued.extend(batch.request_ids);
                }
                Err(err) => {
                    tracing::error!(
                        "Error enqueuing batch fulfillment of {} requests, requeuing: {err}",
                        batch.len()
                    );
                }
            }
        }
        enqueued
    }
}

fn parse_fee(tx: &Tx, value: &str) -> Result<U256, SchedulerErr> {
    value
        .parse::<U256>()
        .map_err(|err| SchedulerErr::InvalidReservedFee(format!("tx {}: {value}: {err}", tx.id)))
}


#[cfg(test)]
mod tests {
    use super::{test_utils::*, *};
    use crate::{
        contracts::v2,
        events::test_utils::{position, v2plus_request, V2RequestBuilder},
        simulation::test_utils::{failed_run, success_run, v2_payload},
        txm::TxManager,
    };
    use alloy::sol_types::SolCall;
    use tracing_test::traced_test;

    fn pending(id: u64, callback_gas_limit: u32) -> PendingRequest {
        PendingRequest::new(
            V2RequestBuilder::new(id, 100).gas(callback_gas_limit).build(),
            103,
            Utc::now(),
        )
    }

    fn succeed(h: &Harness, id: u64, gas_limit: u64, max_fee: u128) {
        h.pipeline.set_run(id, success_run(v2_payload(id, 1, 100_000), gas_limit, max_fee));
    }

    #[test]
    fn round_robin_from_addresses() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let from = FromAddresses::new(vec![a, b]).unwrap();
        assert_eq!([from.next(), from.next(), from.next()], [a, b, a]);
        assert_eq!(from.first(), a);
        assert!(matches!(FromAddresses::new(vec![]), Err(SchedulerErr::NoFromAddresses)));
    }

    #[tokio::test]
    async fn single_fulfillments_enqueued() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        succeed(&h, 1, 300_000, 100);
        succeed(&h, 2, 310_000, 200);

        let processed =
            h.scheduler.process(vec![pending(1, 100_000), pending(2, 120_000)], Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(1), U256::from(2)]));

        let txes = h.reserved_txes("1").await;
        assert_eq!(txes.len(), 2);
        let tx = &txes[0];
        assert_eq!(tx.to, crate::events::test_utils::COORDINATOR);
        assert_eq!(tx.from, FROM);
        assert_eq!(tx.fee_limit, 300_000);
        assert_eq!(tx.meta.request_id, Some(request_id_hash(U256::from(1))));
        assert_eq!(tx.meta.max_link.as_deref(), Some("100"));
        assert_eq!(tx.meta.request_tx_hash, Some(position(100, 1).tx_hash));
        assert_eq!(
            tx.checker,
            Some(TransmitCheckerSpec::vrf(
                CoordinatorVersion::V2,
                crate::events::test_utils::COORDINATOR,
                100
            ))
        );

        // Commitments are read a few blocks behind the head
        let queries = h.coordinator.commitment_queries.lock().unwrap().clone();
        assert_eq!(queries[0], (U256::from(1), 105));
    }

    #[tokio::test]
    #[traced_test]
    async fn stops_when_balance_runs_out() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.coordinator.set_sub(SubId::V2(1), 250, 0);
        succeed(&h, 1, 300_000, 100);
        succeed(&h, 2, 300_000, 100);
        succeed(&h, 3, 300_000, 100);

        // Listed out of order, the cheapest callbacks go first
        let reqs = vec![pending(3, 150_000), pending(1, 100_000), pending(2, 110_000)];
        let processed = h.scheduler.process(reqs, Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(1), U256::from(2)]));
        assert!(logs_contain("Insufficient balance to fulfill request 0x3"));
    }

    #[tokio::test]
    async fn reserved_funds_reduce_balance() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.coordinator.set_sub(SubId::V2(1), 250, 0);
        h.db.create_transaction(TxRequest {
            from: FROM,
            to: Address::ZERO,
            payload: Bytes::new(),
            fee_limit: 1,
            strategy: SendStrategy::SendEvery,
            meta: TxMeta::default().with_sub_id(SubId::V2(1)).with_max_fee(U256::from(200), false),
            checker: None,
        })
        .await
        .unwrap();
        succeed(&h, 1, 300_000, 100);

        let processed = h.scheduler.process(vec![pending(1, 100_000)], Utc::now()).await;
        assert!(processed.is_empty());
        assert_eq!(h.reserved_txes("1").await.len(), 1);
    }

    #[tokio::test]
    async fn fulfilled_and_expired_requests_skip_simulation() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        h.coordinator.mark_fulfilled(1);

        let mut expired = pending(2, 100_000);
        expired.utc_timestamp = Utc::now() - chrono::Duration::days(2);

        let processed = h.scheduler.process(vec![pending(1, 100_000), expired], Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(1), U256::from(2)]));
        assert_eq!(h.pipeline.call_count(), 0);
    }

    #[tokio::test]
    async fn commitment_check_failure_proceeds() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        *h.coordinator.commitment_failure.lock().unwrap() = true;
        succeed(&h, 1, 300_000, 100);

        let processed = h.scheduler.process(vec![pending(1, 100_000)], Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(1)]));
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_classes() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.coordinator.set_sub(SubId::V2(1), 1_000_000_000_000_000_000, 0);
        h.pipeline.set_run(1, failed_run("blockhash not found in store", None));
        h.pipeline.set_run(2, failed_run("execution reverted: invalid proof", None));
        h.pipeline.set_run(3, failed_run("connection refused", None));

        let reqs = vec![pending(1, 100_000), pending(2, 100_000), pending(3, 100_000)];
        let processed = h.scheduler.process(reqs, Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(2)]));
        assert!(logs_contain("CRITICAL: pipeline error for request 0x1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn insufficient_funds_estimate_stops() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        // Estimate at the default 500 gwei is 0.15 LINK
        h.coordinator.set_sub(SubId::V2(1), 100_000_000_000_000_000, 0);
        h.pipeline.set_run(1, failed_run("execution reverted", None));
        succeed(&h, 2, 300_000, 1);

        let processed =
            h.scheduler.process(vec![pending(1, 100_000), pending(2, 110_000)], Utc::now()).await;
        assert!(processed.is_empty());
        assert!(logs_contain("based on estimate"));
    }

    #[tokio::test]
    async fn invalid_consumer_dropped_after_finality() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        h.chain.eoas.lock().unwrap().insert(Address::repeat_byte(0x5e));
        h.pipeline.set_run(1, failed_run("connection refused", None));

        // Within the finality depth the request stays pending
        let processed = h.scheduler.process(vec![pending(1, 100_000)], Utc::now()).await;
        assert!(processed.is_empty());

        h.state.set_latest_head(200);
        let processed = h.scheduler.process(vec![pending(1, 100_000)], Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(1)]));
    }

    #[tokio::test]
    async fn canceled_sub_force_fulfilled() {
        let h = Harness::new(CoordinatorVersion::V2, Some(VRF_OWNER)).await;
        let payload = v2_payload(1, 1, 100_000);
        let mut run = failed_run("estimategas: execution reverted", Some(payload.clone()));
        run.gas_limit = Some(500_000);
        h.pipeline.set_run(1, run);
        h.pipeline.set_run(2, failed_run("execution reverted", None));

        let processed =
            h.scheduler.process(vec![pending(1, 100_000), pending(2, 100_000)], Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(1)]));

        let txes = h.reserved_txes("1").await;
        assert_eq!(txes.len(), 1);
        assert_eq!(txes[0].to, VRF_OWNER);
        assert_eq!(txes[0].payload, payload);
        assert_eq!(txes[0].fee_limit, 500_000);
        assert!(txes[0].meta.max_link.is_none());
    }

    #[tokio::test]
    async fn canceled_sub_without_owner_stays_pending() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.pipeline.set_run(1, failed_run("execution reverted", Some(v2_payload(1, 1, 100_000))));
        let processed = h.scheduler.process(vec![pending(1, 100_000)], Utc::now()).await;
        assert!(processed.is_empty());
    }

    #[tokio::test]
    async fn subscription_rpc_failure_aborts_pass() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        *h.coordinator.sub_rpc_failure.lock().unwrap() = true;
        let processed = h.scheduler.process(vec![pending(1, 100_000)], Utc::now()).await;
        assert!(processed.is_empty());
        assert_eq!(h.pipeline.call_count(), 0);
    }

    #[tokio::test]
    async fn native_and_link_balances_are_separate() {
        let h = Harness::new(CoordinatorVersion::V2Plus, None).await;
        let sub = U256::from(9);
        h.coordinator.set_sub(SubId::V2Plus(sub), 0, 1_000);
        for id in 1..=2u64 {
            let payload = crate::contracts::v2plus::IVRFCoordinatorV2Plus::fulfillRandomWordsCall {
                proof: crate::contracts::v2plus::Proof { seed: U256::from(id), ..Default::default() },
                rc: crate::contracts::v2plus::RequestCommitment {
                    subId: sub,
                    extraArgs: v2plus_request(id, sub, id == 1, 1, position(1, 0))
                        .extra_args()
                        .cloned()
                        .unwrap_or_default(),
                    ..Default::default()
                },
                onlyPremium: false,
            }
            .abi_encode();
            h.pipeline.set_run(id, success_run(payload.into(), 300_000, 500));
        }

        let reqs = vec![
            PendingRequest::new(
                v2plus_request(1, sub, true, 100_000, position(100, 1)),
                103,
                Utc::now(),
            ),
            PendingRequest::new(
                v2plus_request(2, sub, false, 100_000, position(100, 2)),
                103,
                Utc::now(),
            ),
        ];
        let processed = h.scheduler.process(reqs, Utc::now()).await;
        // Only the native request is covered by the native balance
        assert_eq!(processed, HashSet::from([U256::from(1)]));

        let txes = h
            .db
            .find_txes_by_meta_field_and_states("GlobalSubId", "9", &TxState::RESERVED)
            .await
            .unwrap();
        assert_eq!(txes.len(), 1);
        assert_eq!(txes[0].meta.max_eth.as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn batched_fulfillments() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.config.load_write().unwrap().listener.batch_fulfillment_enabled = true;
        // Ceiling of 500k gas, two 200k fulfillments per batch
        *h.coordinator.max_gas_limit.lock().unwrap() = Some(100_000);
        h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        for id in 1..=3 {
            succeed(&h, id, 200_000, 100);
        }

        let reqs = vec![pending(1, 100_000), pending(2, 100_000), pending(3, 100_000)];
        let processed = h.scheduler.process(reqs, Utc::now()).await;
        assert_eq!(processed.len(), 3);

        let txes = h.reserved_txes("1").await;
        assert_eq!(txes.len(), 2);
        assert!(txes.iter().all(|tx| tx.to == BATCH_COORDINATOR));
        assert_eq!(txes[0].meta.request_ids.as_ref().map(Vec::len), Some(2));
        assert_eq!(txes[0].meta.max_link.as_deref(), Some("200"));
        assert_eq!(txes[1].meta.request_ids.as_ref().map(Vec::len), Some(1));

        let call =
            v2::IBatchVRFCoordinatorV2::fulfillRandomWordsCall::abi_decode(&txes[0].payload)
                .unwrap();
        assert_eq!(call.proofs.len(), 2);
    }

    #[tokio::test]
    async fn oversize_fulfillment_sent_alone() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.config.load_write().unwrap().listener.batch_fulfillment_enabled = true;
        // Ceiling of 500k gas
        *h.coordinator.max_gas_limit.lock().unwrap() = Some(100_000);
        h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        succeed(&h, 1, 200_000, 100);
        succeed(&h, 2, 600_000, 100);
        succeed(&h, 3, 200_000, 100);

        let reqs = vec![pending(1, 100_000), pending(2, 100_000), pending(3, 100_000)];
        let processed = h.scheduler.process(reqs, Utc::now()).await;
        assert_eq!(processed.len(), 3);

        let txes = h.reserved_txes("1").await;
        assert_eq!(txes.len(), 2);
        let single =
            txes.iter().find(|tx| tx.to == crate::events::test_utils::COORDINATOR).unwrap();
        assert_eq!(single.fee_limit, 600_000);
        assert_eq!(single.meta.request_id, Some(request_id_hash(U256::from(2))));

        let batch = txes.iter().find(|tx| tx.to == BATCH_COORDINATOR).unwrap();
        assert_eq!(
            batch.meta.request_ids,
            Some(vec![request_id_hash(U256::from(1)), request_id_hash(U256::from(3))])
        );
        assert!(batch.checker.is_none());
    }

    #[tokio::test]
    async fn batch_flushed_when_balance_runs_out() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.config.load_write().unwrap().listener.batch_fulfillment_enabled = true;
        h.coordinator.set_sub(SubId::V2(1), 150, 0);
        succeed(&h, 1, 400, 100);
        succeed(&h, 2, 400, 100);

        let processed =
            h.scheduler.process(vec![pending(1, 100_000), pending(2, 100_000)], Utc::now()).await;
        assert_eq!(processed, HashSet::from([U256::from(1)]));
        assert_eq!(h.reserved_txes("1").await.len(), 1);
    }

    #[tokio::test]
    async fn batch_ceiling_unavailable_skips_subset() {
        let h = Harness::new(CoordinatorVersion::V2, None).await;
        h.config.load_write().unwrap().listener.batch_fulfillment_enabled = true;
        *h.coordinator.max_gas_limit.lock().unwrap() = None;
        h.coordinator.set_sub(SubId::V2(1), 1_000, 0);
        succeed(&h, 1, 400, 100);

        let processed = h.scheduler.process(vec![pending(1, 100_000)], Utc::now()).await;
        assert!(processed.is_empty());
        assert_eq!(h.pipeline.call_count(), 0);
    }
}
