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

//! Greedy packing of simulated fulfillments into gas bounded batch transactions.

use alloy::{
    primitives::{Address, Bytes, B256, U256},
    sol_types::SolCall,
};
use thiserror::Error;

use crate::{
    contracts::{v2, v2plus},
    errors::{impl_coded_debug, CodedError},
    events::{CoordinatorVersion, SubId},
    fees,
    simulation::{Fulfillment, Simulated},
    txm::{request_id_hash, SendStrategy, TxMeta, TxRequest},
};

#[derive(Error)]
pub enum BatchErr {
    #[error("{code} Cannot pack a {0} fulfillment into a {1} batch", code = self.code())]
    VersionMismatch(CoordinatorVersion, CoordinatorVersion),

    #[error("{code} Batch is empty", code = self.code())]
    Empty,

    #[error("{code} Fulfillment gas {0} reaches the batch gas ceiling {1}", code = self.code())]
    ExceedsCeiling(u64, u64),
}

impl_coded_debug!(BatchErr);

impl CodedError for BatchErr {
    fn code(&self) -> &str {
        match self {
            BatchErr::VersionMismatch(..) => "[V-BAT-001]",
            BatchErr::Empty => "[V-BAT-002]",
            BatchErr::ExceedsCeiling(..) => "[V-BAT-003]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchCalls {
    V2 { proofs: Vec<v2::Proof>, commitments: Vec<v2::RequestCommitment> },
    V2Plus { proofs: Vec<v2plus::Proof>, commitments: Vec<v2plus::RequestCommitment> },
}

impl BatchCalls {
    fn new(version: CoordinatorVersion) -> Self {
        match version {
            CoordinatorVersion::V2 => BatchCalls::V2 { proofs: vec![], commitments: vec![] },
            CoordinatorVersion::V2Plus => {
                BatchCalls::V2Plus { proofs: vec![], commitments: vec![] }
            }
        }
    }

    fn version(&self) -> CoordinatorVersion {
        match self {
            BatchCalls::V2 { .. } => CoordinatorVersion::V2,
            BatchCalls::V2Plus { .. } => CoordinatorVersion::V2Plus,
        }
    }

    fn accepts(&self, fulfillment: &Fulfillment) -> Result<(), BatchErr> {
        match (self, fulfillment) {
            (BatchCalls::V2 { .. }, Fulfillment::V2 { .. })
            | (BatchCalls::V2Plus { .. }, Fulfillment::V2Plus { .. }) => Ok(()),
            (_, Fulfillment::V2 { .. }) => {
                Err(BatchErr::VersionMismatch(CoordinatorVersion::V2, self.version()))
            }
            (_, Fulfillment::V2Plus { .. }) => {
                Err(BatchErr::VersionMismatch(CoordinatorVersion::V2Plus, self.version()))
            }
        }
    }

    fn push(&mut self, fulfillment: &Fulfillment) {
        match (self, fulfillment) {
            (
                BatchCalls::V2 { proofs, commitments },
                Fulfillment::V2 { proof, commitment },
            ) => {
                proofs.push(proof.clone());
                commitments.push(commitment.clone());
            }
            (
                BatchCalls::V2Plus { proofs, commitments },
                Fulfillment::V2Plus { proof, commitment, .. },
            ) => {
                proofs.push(proof.clone());
                commitments.push(commitment.clone());
            }
            _ => {}
        }
    }

    fn encode(&self) -> Bytes {
        match self {
            BatchCalls::V2 { proofs, commitments } => {
                v2::IBatchVRFCoordinatorV2::fulfillRandomWordsCall {
                    proofs: proofs.clone(),
                    rcs: commitments.clone(),
                }
                .abi_encode()
                .into()
            }
            BatchCalls::V2Plus { proofs, commitments } => {
                v2plus::IBatchVRFCoordinatorV2Plus::fulfillRandomWordsCall {
                    proofs: proofs.clone(),
                    rcs: commitments.clone(),
                }
                .abi_encode()
                .into()
            }
        }
    }
}

/// Fulfillments sharing one batch transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFulfillment {
    calls: BatchCalls,
    pub request_ids: Vec<U256>,
    pub request_tx_hashes: Vec<B256>,
    pub max_fees: Vec<U256>,
    /// Sum of the simulated gas limits
    pub total_gas_limit: u64,
    pub max_callback_gas_limit: u64,
    pub from: Address,
}

impl BatchFulfillment {
    fn new(version: CoordinatorVersion, from: Address) -> Self {
        Self {
            calls: BatchCalls::new(version),
            request_ids: vec![],
            request_tx_hashes: vec![],
            max_fees: vec![],
            total_gas_limit: 0,
            max_callback_gas_limit: 0,
            from,
        }
    }

    fn push(&mut self, item: &BatchItem) {
        self.calls.push(&item.simulated.vrf.fulfillment);
        self.request_ids.push(item.request_id);
        self.request_tx_hashes.push(item.request_tx_hash);
        self.max_fees.push(item.simulated.max_fee);
        self.total_gas_limit = self.total_gas_limit.saturating_add(item.simulated.gas_limit);
        self.max_callback_gas_limit =
            self.max_callback_gas_limit.max(item.callback_gas_limit.into());
    }

    pub fn len(&self) -> usize {
        self.request_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_ids.is_empty()
    }

    pub fn total_max_fee(&self) -> U256 {
        self.max_fees.iter().fold(U256::ZERO, |acc, fee| acc.saturating_add(*fee))
    }

    /// Batch coordinator calldata
    pub fn payload(&self) -> Bytes {
        self.calls.encode()
    }

    /// Transaction request for this batch against the batch coordinator at `to`.
    ///
    /// The summed max fee is reserved under `MaxEth` or `MaxLink` depending on `native_payment`.
    pub fn tx_request(
        &self,
        to: Address,
        sub_id: SubId,
        native_payment: bool,
        gas_multiplier: f64,
    ) -> Result<TxRequest, BatchErr> {
        if self.is_empty() {
            return Err(BatchErr::Empty);
        }
        let meta = TxMeta {
            request_ids: Some(self.request_ids.iter().copied().map(request_id_hash).collect()),
            request_tx_hashes: Some(self.request_tx_hashes.clone()),
            ..Default::default()
        }
        .with_sub_id(sub_id)
        .with_max_fee(self.total_max_fee(), native_payment);

        Ok(TxRequest {
            from: self.from,
            to,
            payload: self.payload(),
            fee_limit: fees::batch_fee_limit(gas_multiplier, self.max_callback_gas_limit, self.len()),
            strategy: SendStrategy::SendEvery,
            meta,
            checker: None,
        })
    }
}

/// A simulated fulfillment ready to be packed
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub request_id: U256,
    pub request_tx_hash: B256,
    pub callback_gas_limit: u32,
    pub simulated: Simulated,
}

/// Packs fulfillments in arrival order. A batch is closed as soon as the next item would reach
/// the gas ceiling; closed batches are never revisited. Items that reach the ceiling on their own
/// are rejected and must be sent as single fulfillments.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    version: CoordinatorVersion,
    gas_ceiling: u64,
    batches: Vec<BatchFulfillment>,
}

impl BatchBuilder {
    pub fn new(version: CoordinatorVersion, gas_ceiling: u64) -> Self {
        Self { version, gas_ceiling, batches: vec![] }
    }

    pub fn gas_ceiling(&self) -> u64 {
        self.gas_ceiling
    }

    pub fn add(&mut self, item: &BatchItem, from: Address) -> Result<(), BatchErr> {
        if item.simulated.gas_limit >= self.gas_ceiling {
            return Err(BatchErr::ExceedsCeiling(item.simulated.gas_limit, self.gas_ceiling));
        }
        let fulfillment = &item.simulated.vrf.fulfillment;
        let needs_new = match self.batches.last() {
            Some(current) => {
                current.calls.accepts(fulfillment)?;
                current.total_gas_limit.saturating_add(item.simulated.gas_limit)
                    >= self.gas_ceiling
            }
            None => true,
        };
        if needs_new {
            let batch = BatchFulfillment::new(self.version, from);
            batch.calls.accepts(fulfillment)?;
            self.batches.push(batch);
        }
        // Just pushed or checked above
        if let Some(current) = self.batches.last_mut() {
            current.push(item);
        }
        Ok(())
    }

    pub fn batches(&self) -> &[BatchFulfillment] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<BatchFulfillment> {
        self.batches
    }
}
