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

//! Fulfillment through the VRF owner contract for requests of canceled subscriptions.

use alloy::primitives::{Address, Bytes, B256, U256};
use thiserror::Error;

use crate::{
    coordinator::{ChainClientObj, CoordinatorErr},
    db::DbError,
    errors::{impl_coded_debug, CodedError},
    events::SubId,
    txm::{request_id_hash, SendStrategy, Tx, TxManagerObj, TxMeta, TxRequest},
};

#[derive(Error)]
pub enum ForceFulfillErr {
    #[error("{code} VRF owner address not configured, cannot force fulfill", code = self.code())]
    OwnerNotConfigured,

    #[error("{code} Empty VRF payload for request 0x{0:x}", code = self.code())]
    EmptyPayload(U256),

    #[error("{code} Force fulfillment is not supported for subscription {0}", code = self.code())]
    UnsupportedSubscription(SubId),

    #[error("{code} Failed to estimate gas on VRFOwner.fulfillRandomWords: {0}", code = self.code())]
    GasEstimate(CoordinatorErr),

    #[error("{code} Failed to enqueue force fulfillment: {0}", code = self.code())]
    Enqueue(#[from] DbError),
}

impl_coded_debug!(ForceFulfillErr);

impl CodedError for ForceFulfillErr {
    fn code(&self) -> &str {
        match self {
            ForceFulfillErr::OwnerNotConfigured => "[V-FF-001]",
            ForceFulfillErr::EmptyPayload(_) => "[V-FF-002]",
            ForceFulfillErr::UnsupportedSubscription(_) => "[V-FF-003]",
            ForceFulfillErr::GasEstimate(_) => "[V-FF-004]",
            ForceFulfillErr::Enqueue(_) => "[V-FF-005]",
        }
    }
}

/// A fulfillment to push through the VRF owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceFulfillment {
    pub request_id: U256,
    pub sub_id: SubId,
    pub request_tx_hash: B256,
    /// `fulfillRandomWords(proof, rc)` calldata
    pub payload: Bytes,
    /// Gas limit from the pipeline, a floor for the estimate
    pub gas_limit: u64,
    /// Set when resubmitting a reverted transaction
    pub attempt: Option<u64>,
}

/// Enqueues force fulfillments against the VRF owner contract
#[derive(Clone)]
pub struct ForceFulfiller {
    vrf_owner: Option<Address>,
    chain: ChainClientObj,
    txm: TxManagerObj,
}

impl ForceFulfiller {
    pub fn new(vrf_owner: Option<Address>, chain: ChainClientObj, txm: TxManagerObj) -> Self {
        Self { vrf_owner, chain, txm }
    }

    pub fn vrf_owner(&self) -> Option<Address> {
        self.vrf_owner
    }

    /// Re-estimates gas against the owner entry point and enqueues the transaction.
    ///
    /// No max fee is reserved, the subscription is not charged.
    pub async fn enqueue(
        &self,
        fulfillment: ForceFulfillment,
        from: Address,
    ) -> Result<Tx, ForceFulfillErr> {
        let vrf_owner = self.vrf_owner.ok_or(ForceFulfillErr::OwnerNotConfigured)?;
        if fulfillment.payload.is_empty() {
            return Err(ForceFulfillErr::EmptyPayload(fulfillment.request_id));
        }
        if !matches!(fulfillment.sub_id, SubId::V2(_)) {
            return Err(ForceFulfillErr::UnsupportedSubscription(fulfillment.sub_id));
        }

        let estimate = self
            .chain
            .estimate_gas(from, vrf_owner, fulfillment.payload.clone())
            .await
            .map_err(ForceFulfillErr::GasEstimate)?;
        tracing::info!(
            "Estimated gas limit on force fulfillment of request 0x{:x}: estimate {estimate}, pipeline {}",
            fulfillment.request_id,
            fulfillment.gas_limit
        );
        let fee_limit = estimate.max(fulfillment.gas_limit);

        let mut meta = TxMeta {
            request_id: Some(request_id_hash(fulfillment.request_id)),
            request_tx_hash: Some(fulfillment.request_tx_hash),
            ..Default::default()
        }
        .with_sub_id(fulfillment.sub_id);
        if let Some(attempt) = fulfillment.attempt {
            meta.force_fulfilled = Some(true);
            meta.force_fulfillment_attempt = Some(attempt);
        }

        let tx = self
            .txm
            .create_transaction(TxRequest {
                from,
                to: vrf_owner,
                payload: fulfillment.payload,
                fee_limit,
                strategy: SendStrategy::SendEvery,
                meta,
                checker: None,
            })
            .await?;
        Ok(tx)
    }
}
