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

//! Recovery of fulfillments that reverted for lack of subscription balance.
//!
//! Mined fulfillment transactions are replayed against their block. Those that failed with
//! `InsufficientBalance()` are resubmitted through the VRF owner, with an attempt counter.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use alloy::{
    primitives::{Bytes, B256, U256},
    sol_types::SolCall,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigErr, ConfigLock, ListenerConfig},
    contracts::{key_hash_of, request_id_from_seed, v2, INSUFFICIENT_BALANCE_SELECTOR},
    coordinator::{CallOutcome, ChainClientObj, CoordinatorErr, CoordinatorObj, TxInfo},
    db::DbError,
    errors::{impl_coded_debug, CodedError},
    events::{CoordinatorVersion, SubId},
    fees,
    force_fulfill::{ForceFulfillErr, ForceFulfiller, ForceFulfillment},
    state::SchedulerState,
    task::{RetryRes, RetryTask, SupervisorErr},
    txm::{RevertedTxKind, RevertedTxnRecord, Tx, TxManagerObj},
};

/// Force fulfillment attempts per request before giving up
pub const MAX_FORCE_FULFILLMENT_ATTEMPTS: u64 = 15;

/// Added to the listener poll period to get the scan interval
const SCAN_MARGIN: Duration = Duration::from_secs(10);

#[derive(Error)]
pub enum RevertedTxnErr {
    #[error("{code} DB error: {0}", code = self.code())]
    DbErr(#[from] DbError),

    #[error("{code} Chain error: {0}", code = self.code())]
    ChainErr(#[from] CoordinatorErr),

    #[error("{code} Config error: {0}", code = self.code())]
    ConfigErr(#[from] ConfigErr),

    #[error("{code} Failed to decode fulfillment calldata: {0}", code = self.code())]
    MalformedCall(String),

    #[error("{code} Request 0x{0:x} not found in batch calldata", code = self.code())]
    NotInBatch(U256),

    #[error("{code} Force fulfillment failed: {0}", code = self.code())]
    ForceFulfillErr(#[from] ForceFulfillErr),
}

impl_coded_debug!(RevertedTxnErr);

impl CodedError for RevertedTxnErr {
    fn code(&self) -> &str {
        match self {
            RevertedTxnErr::DbErr(_) => "[V-REV-001]",
            RevertedTxnErr::ChainErr(_) => "[V-REV-002]",
            RevertedTxnErr::ConfigErr(_) => "[V-REV-003]",
            RevertedTxnErr::MalformedCall(_) => "[V-REV-004]",
            RevertedTxnErr::NotInBatch(_) => "[V-REV-005]",
            RevertedTxnErr::ForceFulfillErr(_) => "[V-REV-006]",
        }
    }
}

/// One request of a mined fulfillment transaction that may need a force fulfillment
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub(crate) request_id: U256,
    pub(crate) record: RevertedTxnRecord,
    pub(crate) kind: RevertedTxKind,
    /// Underfunding already recorded by a `RawErrorReturned` batch log
    pub(crate) logged_revert: bool,
}

impl Candidate {
    fn attempt(&self) -> u64 {
        self.record.force_fulfillment_attempt()
    }

    fn request_tx_hash(&self) -> B256 {
        let meta = &self.record.tx.meta;
        if let Some(hash) = meta.request_tx_hash {
            return hash;
        }
        // Batch meta lists request tx hashes in request ID order
        meta.request_ids
            .iter()
            .flatten()
            .position(|id| U256::from_be_bytes(id.0) == self.request_id)
            .and_then(|idx| meta.request_tx_hashes.as_ref()?.get(idx).copied())
            .unwrap_or_default()
    }
}

/// Keeps the highest attempt per request ID and drops requests with a force fulfillment in flight
pub(crate) fn unique_by_request_id(
    candidates: Vec<Candidate>,
    pending_force: &HashSet<U256>,
) -> Vec<Candidate> {
    let mut unique: BTreeMap<U256, Candidate> = BTreeMap::new();
    for candidate in candidates {
        if pending_force.contains(&candidate.request_id) {
            tracing::debug!(
                "Skipping request 0x{:x}, force fulfillment already pending",
                candidate.request_id
            );
            continue;
        }
        match unique.get(&candidate.request_id) {
            Some(existing) if existing.attempt() >= candidate.attempt() => {}
            _ => {
                unique.insert(candidate.request_id, candidate);
            }
        }
    }
    unique.into_values().collect()
}

/// Expands a batch record into the requests that failed for lack of balance
fn batch_candidates(record: RevertedTxnRecord) -> Vec<Candidate> {
    let request_ids: Vec<U256> = record
        .tx
        .meta
        .request_ids
        .iter()
        .flatten()
        .map(|id| U256::from_be_bytes(id.0))
        .collect();

    // A reverted batch is replayed as a whole
    if !record.receipt.status {
        return request_ids
            .into_iter()
            .map(|request_id| Candidate {
                request_id,
                record: record.clone(),
                kind: RevertedTxKind::Batch,
                logged_revert: false,
            })
            .collect();
    }

    let underfunded: HashSet<U256> = record
        .receipt
        .logs
        .iter()
        .filter_map(|log| log.log_decode::<v2::IBatchVRFCoordinatorV2::RawErrorReturned>().ok())
        .map(|log| log.inner.data)
        .filter(|ev| ev.lowLevelData.as_ref() == INSUFFICIENT_BALANCE_SELECTOR.as_slice())
        .map(|ev| ev.requestId)
        .collect();

    request_ids
        .into_iter()
        .filter(|id| underfunded.contains(id))
        .map(|request_id| Candidate {
            request_id,
            record: record.clone(),
            kind: RevertedTxKind::Batch,
            logged_revert: true,
        })
        .collect()
}

/// Proof and commitment of `request_id` in the calldata of a mined fulfillment
fn decode_fulfillment(
    kind: RevertedTxKind,
    input: &[u8],
    request_id: U256,
) -> Result<(v2::Proof, v2::RequestCommitment), RevertedTxnErr> {
    match kind {
        // Owner and coordinator entry points share a selector and layout
        RevertedTxKind::Single | RevertedTxKind::ForceFulfilled => {
            let call = v2::IVRFOwner::fulfillRandomWordsCall::abi_decode(input)
                .map_err(|err| RevertedTxnErr::MalformedCall(err.to_string()))?;
            Ok((call.proof, call.rc))
        }
        RevertedTxKind::Batch => {
            let call = v2::IBatchVRFCoordinatorV2::fulfillRandomWordsCall::abi_decode(input)
                .map_err(|err| RevertedTxnErr::MalformedCall(err.to_string()))?;
            call.proofs
                .into_iter()
                .zip(call.rcs)
                .find(|(proof, _)| {
                    request_id_from_seed(key_hash_of(&proof.pk), proof.seed) == request_id
                })
                .ok_or(RevertedTxnErr::NotInBatch(request_id))
        }
    }
}

/// Periodically resubmits fulfillments that reverted with `InsufficientBalance()`
#[derive(Clone)]
pub struct RevertedTxnTask {
    coordinator: CoordinatorObj,
    chain: ChainClientObj,
    txm: TxManagerObj,
    force: ForceFulfiller,
    state: Arc<SchedulerState>,
    config: ConfigLock,
}

impl RevertedTxnTask {
    pub fn new(
        coordinator: CoordinatorObj,
        chain: ChainClientObj,
        txm: TxManagerObj,
        force: ForceFulfiller,
        state: Arc<SchedulerState>,
        config: ConfigLock,
    ) -> Self {
        Self { coordinator, chain, txm, force, state, config }
    }

    /// Recovery only applies to V2 coordinators behind a VRF owner
    pub fn enabled(
        version: CoordinatorVersion,
        force: &ForceFulfiller,
        listener: &ListenerConfig,
    ) -> bool {
        version == CoordinatorVersion::V2
            && force.vrf_owner().is_some()
            && listener.custom_reverts_pipeline_enabled
    }

    async fn candidates(&self, from_block: u64) -> Result<Vec<Candidate>, RevertedTxnErr> {
        let mut candidates = vec![];
        for kind in [RevertedTxKind::Single, RevertedTxKind::ForceFulfilled] {
            for record in self.txm.find_reverted_txes(kind, from_block).await? {
                let Some(request_id) = record.tx.meta.request_id else {
                    tracing::warn!("Reverted tx {} has no request ID in meta", record.tx.id);
                    continue;
                };
                candidates.push(Candidate {
                    request_id: U256::from_be_bytes(request_id.0),
                    record,
                    kind,
                    logged_revert: false,
                });
            }
        }
        for record in self.txm.find_reverted_txes(RevertedTxKind::Batch, from_block).await? {
            candidates.extend(batch_candidates(record));
        }
        Ok(candidates)
    }

    async fn pending_force_fulfillments(&self) -> Result<HashSet<U256>, RevertedTxnErr> {
        Ok(self
            .txm
            .find_pending_force_fulfillments()
            .await?
            .iter()
            .filter_map(|tx| tx.meta.request_id)
            .map(|id| U256::from_be_bytes(id.0))
            .collect())
    }

    /// Replays `tx` at its receipt block, true when it reverts with `InsufficientBalance()`
    async fn insufficient_balance(
        &self,
        tx: &TxInfo,
        fallback_to: alloy::primitives::Address,
        block: u64,
    ) -> Result<bool, RevertedTxnErr> {
        let to = tx.to.unwrap_or(fallback_to);
        match self.chain.call_at(tx.from, to, tx.input.clone(), block).await? {
            CallOutcome::Reverted(data) => Ok(data.starts_with(&INSUFFICIENT_BALANCE_SELECTOR)),
            CallOutcome::Success(_) => Ok(false),
        }
    }

    async fn already_fulfilled(&self, request_id: U256, head: u64) -> bool {
        match self.coordinator.commitments(&[(request_id, head)]).await.pop() {
            Some(Ok(commitment)) => commitment.is_zero(),
            Some(Err(err)) => {
                tracing::warn!(
                    "Failed to read commitment of request 0x{request_id:x}, proceeding: {err}"
                );
                false
            }
            None => false,
        }
    }

    async fn recover(
        &self,
        candidate: &Candidate,
        head: u64,
        replays: &mut HashMap<B256, bool>,
    ) -> Result<Option<Tx>, RevertedTxnErr> {
        let request_id = candidate.request_id;
        let attempt = candidate.attempt();
        if attempt >= MAX_FORCE_FULFILLMENT_ATTEMPTS {
            tracing::warn!(
                "Request 0x{request_id:x} reached {attempt} force fulfillment attempts, giving up"
            );
            return Ok(None);
        }

        let receipt = &candidate.record.receipt;
        let tx = self.chain.transaction(receipt.tx_hash).await?;

        if !candidate.logged_revert {
            let underfunded = match replays.get(&receipt.tx_hash) {
                Some(underfunded) => *underfunded,
                None => {
                    let underfunded = self
                        .insufficient_balance(&tx, candidate.record.tx.to, receipt.block_number)
                        .await?;
                    replays.insert(receipt.tx_hash, underfunded);
                    underfunded
                }
            };
            if !underfunded {
                tracing::debug!(
                    "Tx {} of request 0x{request_id:x} did not revert for lack of balance, skipping",
                    receipt.tx_hash
                );
                return Ok(None);
            }
        }

        let (proof, rc) = decode_fulfillment(candidate.kind, &tx.input, request_id)?;

        if self.already_fulfilled(request_id, head).await {
            tracing::debug!("Request 0x{request_id:x} already fulfilled, skipping");
            return Ok(None);
        }

        let gas_limit = match candidate.kind {
            RevertedTxKind::Batch => {
                u64::from(rc.callbackGasLimit).saturating_add(fees::GAS_PROOF_VERIFICATION)
            }
            RevertedTxKind::Single | RevertedTxKind::ForceFulfilled => tx.gas_limit,
        };
        let sub_id = SubId::V2(rc.subId);
        let payload: Bytes = v2::IVRFOwner::fulfillRandomWordsCall { proof, rc }.abi_encode().into();

        let fulfillment = ForceFulfillment {
            request_id,
            sub_id,
            request_tx_hash: candidate.request_tx_hash(),
            payload,
            gas_limit,
            attempt: Some(attempt + 1),
        };
        Ok(Some(self.force.enqueue(fulfillment, tx.from).await?))
    }

    /// Runs one recovery pass, returns the number of force fulfillments enqueued
    pub async fn scan(&self) -> Result<usize, RevertedTxnErr> {
        let lookback = self.config.listener()?.reverted_txns_lookback_blocks;
        let head = self.state.latest_head();
        if head == 0 {
            tracing::debug!("No chain head observed yet, skipping reverted txn scan");
            return Ok(0);
        }
        let from_block = head.saturating_sub(lookback);

        let candidates = self.candidates(from_block).await?;
        let pending_force = self.pending_force_fulfillments().await?;
        let candidates = unique_by_request_id(candidates, &pending_force);
        if candidates.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            "Found {} reverted fulfillment candidates since block {from_block}",
            candidates.len()
        );

        let mut replays = HashMap::new();
        let mut enqueued = 0;
        for candidate in &candidates {
            match self.recover(candidate, head, &mut replays).await {
                Ok(Some(tx)) => {
                    tracing::info!(
                        "Enqueued force fulfillment tx {} for reverted request 0x{:x}, attempt {}",
                        tx.id,
                        candidate.request_id,
                        candidate.attempt() + 1
                    );
                    enqueued += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        "Failed to recover reverted fulfillment of request 0x{:x} (tx {}): {err}",
                        candidate.request_id,
                        candidate.record.receipt.tx_hash
                    );
                }
            }
        }
        Ok(enqueued)
    }
}

impl RetryTask for RevertedTxnTask {
    type Error = RevertedTxnErr;

    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
        let self_clone = self.clone();

        Box::pin(async move {
            tracing::info!("Starting reverted txn recovery");
            loop {
                let interval = self_clone
                    .config
                    .listener()
                    .map_err(|err| SupervisorErr::Recover(RevertedTxnErr::from(err)))?
                    .poll_period()
                    + SCAN_MARGIN;

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Reverted txn recovery received cancellation");
                        return Ok(());
                    }
                }

                if let Err(err) = self_clone.scan().await {
                    tracing::warn!("Error scanning reverted txns: {err}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::test_utils::{position, wrap_log},
        scheduler::test_utils::{Harness, FROM, VRF_OWNER},
        simulation::test_utils::v2_payload,
        txm::{request_id_hash, SendStrategy, TxManager, TxMeta, TxReceipt, TxRequest},
    };
    use alloy::{
        primitives::Address,
        rpc::types::Log,
        sol_types::{SolError, SolEvent},
    };
    use tracing_test::traced_test;

    const TX_HASH: B256 = B256::repeat_byte(0xaa);

    fn task(h: &Harness) -> RevertedTxnTask {
        let force = ForceFulfiller::new(Some(VRF_OWNER), h.chain.clone(), h.db.clone());
        RevertedTxnTask::new(
            h.coordinator.clone(),
            h.chain.clone(),
            h.db.clone(),
            force,
            h.state.clone(),
            h.config.clone(),
        )
    }

    fn underfunded() -> CallOutcome {
        CallOutcome::Reverted(v2::IVRFCoordinatorV2::InsufficientBalance {}.abi_encode().into())
    }

    fn record(request_id: u64, attempt: Option<u64>) -> Candidate {
        let mut meta = TxMeta {
            request_id: Some(request_id_hash(U256::from(request_id))),
            ..Default::default()
        };
        meta.force_fulfillment_attempt = attempt;
        Candidate {
            request_id: U256::from(request_id),
            record: RevertedTxnRecord {
                tx: Tx {
                    id: 1,
                    from: FROM,
                    to: Address::ZERO,
                    payload: Bytes::new(),
                    fee_limit: 0,
                    strategy: SendStrategy::SendEvery,
                    state: crate::txm::TxState::Confirmed,
                    meta,
                    checker: None,
                    created_at: 0,
                },
                receipt: TxReceipt { tx_hash: TX_HASH, block_number: 1, status: false, logs: vec![] },
            },
            kind: RevertedTxKind::ForceFulfilled,
            logged_revert: false,
        }
    }

    /// Mines a fulfillment tx with a receipt at block 100 and registers it with the chain
    async fn mined(h: &Harness, meta: TxMeta, payload: Bytes, status: bool, logs: Vec<Log>) -> Tx {
        let tx = h
            .db
            .create_transaction(TxRequest {
                from: FROM,
                to: crate::events::test_utils::COORDINATOR,
                payload: payload.clone(),
                fee_limit: 300_000,
                strategy: SendStrategy::SendEvery,
                meta,
                checker: None,
            })
            .await
            .unwrap();
        h.db.insert_receipt(
            tx.id,
            &TxReceipt { tx_hash: TX_HASH, block_number: 100, status, logs },
        )
        .await
        .unwrap();
        h.chain.add_tx(TxInfo {
            hash: TX_HASH,
            from: FROM,
            to: Some(crate::events::test_utils::COORDINATOR),
            input: payload,
            gas_limit: 300_000,
            block_number: Some(100),
        });
        tx
    }

    fn single_meta(request_id: u64) -> TxMeta {
        TxMeta {
            request_id: Some(request_id_hash(U256::from(request_id))),
            request_tx_hash: Some(B256::repeat_byte(0x77)),
            ..Default::default()
        }
        .with_sub_id(SubId::V2(1))
    }

    #[test]
    fn keeps_highest_attempt() {
        let candidates =
            vec![record(1, Some(1)), record(1, Some(2)), record(1, None), record(2, None)];
        let unique = unique_by_request_id(candidates, &HashSet::from([U256::from(2)]));
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].request_id, U256::from(1));
        assert_eq!(unique[0].attempt(), 2);
    }

    #[tokio::test]
    async fn resubmits_underfunded_single() {
        let h = Harness::new(CoordinatorVersion::V2, Some(VRF_OWNER)).await;
        h.state.set_latest_head(110);
        let payload = v2_payload(5, 1, 100_000);
        mined(&h, single_meta(5), payload.clone(), false, vec![]).await;
        h.chain.call_results.lock().unwrap().insert(payload.clone(), underfunded());

        let task = task(&h);
        assert_eq!(task.scan().await.unwrap(), 1);

        let pending = h.db.find_pending_force_fulfillments().await.unwrap();
        assert_eq!(pending.len(), 1);
        let forced = &pending[0];
        assert_eq!(forced.to, VRF_OWNER);
        assert_eq!(forced.from, FROM);
        assert_eq!(forced.payload, payload);
        assert_eq!(forced.fee_limit, 400_000);
        assert_eq!(forced.meta.force_fulfillment_attempt, Some(1));
        assert_eq!(forced.meta.request_tx_hash, Some(B256::repeat_byte(0x77)));
        assert_eq!(h.chain.calls.lock().unwrap()[0].2, 100);

        // Not raced while the first attempt is in flight
        assert_eq!(task.scan().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn other_revert_reasons_skipped() {
        let h = Harness::new(CoordinatorVersion::V2, Some(VRF_OWNER)).await;
        let payload = v2_payload(5, 1, 100_000);
        mined(&h, single_meta(5), payload.clone(), false, vec![]).await;
        h.chain
            .call_results
            .lock()
            .unwrap()
            .insert(payload, CallOutcome::Reverted(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])));

        assert_eq!(task(&h).scan().await.unwrap(), 0);
        assert!(h.db.find_pending_force_fulfillments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn already_fulfilled_skipped() {
        let h = Harness::new(CoordinatorVersion::V2, Some(VRF_OWNER)).await;
        let payload = v2_payload(5, 1, 100_000);
        mined(&h, single_meta(5), payload.clone(), false, vec![]).await;
        h.chain.call_results.lock().unwrap().insert(payload, underfunded());
        h.coordinator.mark_fulfilled(5);

        assert_eq!(task(&h).scan().await.unwrap(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn attempts_capped() {
        let h = Harness::new(CoordinatorVersion::V2, Some(VRF_OWNER)).await;
        let payload = v2_payload(5, 1, 100_000);
        let mut meta = single_meta(5);
        meta.force_fulfilled = Some(true);
        meta.force_fulfillment_attempt = Some(MAX_FORCE_FULFILLMENT_ATTEMPTS);
        mined(&h, meta, payload.clone(), false, vec![]).await;
        h.chain.call_results.lock().unwrap().insert(payload, underfunded());

        assert_eq!(task(&h).scan().await.unwrap(), 0);
        assert!(logs_contain("giving up"));
    }

    #[tokio::test]
    async fn batch_raw_error_recovered_from_logs() {
        let h = Harness::new(CoordinatorVersion::V2, Some(VRF_OWNER)).await;
        let pk = [U256::from(1), U256::from(2)];
        let key_hash = key_hash_of(&pk);
        let proofs: Vec<v2::Proof> = (1..=2u64)
            .map(|seed| v2::Proof { pk, seed: U256::from(seed), ..Default::default() })
            .collect();
        let rcs: Vec<v2::RequestCommitment> = (1..=2u32)
            .map(|n| v2::RequestCommitment {
                subId: 4,
                callbackGasLimit: 100_000 * n,
                ..Default::default()
            })
            .collect();
        let ids: Vec<U256> =
            proofs.iter().map(|proof| request_id_from_seed(key_hash, proof.seed)).collect();
        let payload: Bytes = v2::IBatchVRFCoordinatorV2::fulfillRandomWordsCall {
            proofs: proofs.clone(),
            rcs: rcs.clone(),
        }
        .abi_encode()
        .into();

        let raw_error = v2::IBatchVRFCoordinatorV2::RawErrorReturned {
            requestId: ids[1],
            lowLevelData: INSUFFICIENT_BALANCE_SELECTOR.to_vec().into(),
        };
        let other_error = v2::IBatchVRFCoordinatorV2::RawErrorReturned {
            requestId: ids[0],
            lowLevelData: Bytes::from_static(&[1, 2, 3, 4]),
        };
        let logs = vec![
            wrap_log(other_error.encode_log_data(), position(100, 0)),
            wrap_log(raw_error.encode_log_data(), position(100, 1)),
        ];
        let meta = TxMeta {
            request_ids: Some(ids.iter().map(|id| request_id_hash(*id)).collect()),
            request_tx_hashes: Some(vec![B256::repeat_byte(1), B256::repeat_byte(2)]),
            ..Default::default()
        }
        .with_sub_id(SubId::V2(4));
        mined(&h, meta, payload, true, logs).await;

        assert_eq!(task(&h).scan().await.unwrap(), 1);
        assert!(h.chain.calls.lock().unwrap().is_empty());

        let pending = h.db.find_pending_force_fulfillments().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].meta.request_id, Some(request_id_hash(ids[1])));
        assert_eq!(pending[0].meta.request_tx_hash, Some(B256::repeat_byte(2)));
        let call = v2::IVRFOwner::fulfillRandomWordsCall::abi_decode(&pending[0].payload).unwrap();
        assert_eq!(call.proof, proofs[1]);
        assert_eq!(call.rc, rcs[1]);
    }

    #[test]
    fn enabled_only_for_v2_with_owner() {
        let h = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(Harness::new(CoordinatorVersion::V2, Some(VRF_OWNER)));
        let force = ForceFulfiller::new(Some(VRF_OWNER), h.chain.clone(), h.db.clone());
        let no_owner = ForceFulfiller::new(None, h.chain.clone(), h.db.clone());
        let mut listener = ListenerConfig::default();
        assert!(!RevertedTxnTask::enabled(CoordinatorVersion::V2, &force, &listener));

        listener.custom_reverts_pipeline_enabled = true;
        assert!(RevertedTxnTask::enabled(CoordinatorVersion::V2, &force, &listener));
        assert!(!RevertedTxnTask::enabled(CoordinatorVersion::V2Plus, &force, &listener));
        assert!(!RevertedTxnTask::enabled(CoordinatorVersion::V2, &no_owner, &listener));
    }
}
