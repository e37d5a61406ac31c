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

//! Pre-broadcast commitment check for queued fulfillments.

use std::sync::Arc;

use alloy::primitives::U256;
use thiserror::Error;

use crate::{
    coordinator::CoordinatorObj,
    db::DbError,
    errors::{impl_coded_debug, CodedError},
    scheduler::COMMITMENT_READ_LAG,
    state::SchedulerState,
    txm::{TransmitCheckerType, Tx, TxManagerObj},
};

#[derive(Error)]
pub enum TransmitCheckErr {
    #[error("{code} Failed to read queued transactions: {0}", code = self.code())]
    DbErr(#[from] DbError),
}

impl_coded_debug!(TransmitCheckErr);

impl CodedError for TransmitCheckErr {
    fn code(&self) -> &str {
        match self {
            TransmitCheckErr::DbErr(_) => "[V-CHK-001]",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Transmit,
    /// The request has no commitment left on chain
    AlreadyFulfilled(U256),
}

/// Re-reads the request commitment of a queued single fulfillment right before it is sent.
///
/// Anything the check cannot decide is transmitted.
#[derive(Clone)]
pub struct VrfTransmitChecker {
    coordinator: CoordinatorObj,
    state: Arc<SchedulerState>,
}

impl VrfTransmitChecker {
    pub fn new(coordinator: CoordinatorObj, state: Arc<SchedulerState>) -> Self {
        Self { coordinator, state }
    }

    pub async fn check(&self, tx: &Tx) -> CheckOutcome {
        let Some(spec) = tx.checker else {
            return CheckOutcome::Transmit;
        };
        if spec.checker_type != TransmitCheckerType::from(self.coordinator.version()) {
            tracing::warn!(
                "Tx {} has checker {:?} for another coordinator version, transmitting",
                tx.id,
                spec.checker_type
            );
            return CheckOutcome::Transmit;
        }
        if spec.vrf_coordinator_address.is_some_and(|addr| addr != self.coordinator.address()) {
            tracing::warn!("Tx {} targets another coordinator, transmitting", tx.id);
            return CheckOutcome::Transmit;
        }
        // Batches carry several requests and are not checked
        let (Some(request_id), Some(request_block)) =
            (tx.meta.request_id, spec.vrf_request_block_number)
        else {
            return CheckOutcome::Transmit;
        };
        let request_id = U256::from_be_bytes(request_id.0);

        let block = self.state.latest_head().saturating_sub(COMMITMENT_READ_LAG).max(request_block);
        match self.coordinator.commitments(&[(request_id, block)]).await.pop() {
            Some(Ok(commitment)) if commitment.is_zero() => {
                CheckOutcome::AlreadyFulfilled(request_id)
            }
            Some(Ok(_)) => CheckOutcome::Transmit,
            Some(Err(err)) => {
                tracing::error!(
                    "Failed to check request 0x{request_id:x} commitment at block {block}, transmitting tx {}: {err}",
                    tx.id
                );
                CheckOutcome::Transmit
            }
            None => CheckOutcome::Transmit,
        }
    }

    /// Abandons unstarted transactions whose request was fulfilled in the meantime.
    ///
    /// Returns the number of abandoned transactions.
    pub async fn screen(&self, txm: &TxManagerObj) -> Result<usize, TransmitCheckErr> {
        let mut abandoned = 0;
        for tx in txm.find_unstarted_checked_txes().await? {
            let CheckOutcome::AlreadyFulfilled(request_id) = self.check(&tx).await else {
                continue;
            };
            if txm.abandon_unstarted(tx.id).await? {
                tracing::info!(
                    "Request 0x{request_id:x} already fulfilled, abandoned queued tx {}",
                    tx.id
                );
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }
}
