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

//! Boundary to the transaction manager that broadcasts and confirms fulfillments.

use std::{fmt, str::FromStr, sync::Arc};

use alloy::{
    primitives::{Address, Bytes, B256, U256},
    rpc::types::Log,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    db::DbError,
    events::{CoordinatorVersion, SubId},
};

/// Lifecycle state of a queued transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    InProgress,
    Unconfirmed,
    Confirmed,
    FatalError,
}

impl TxState {
    /// States whose fee is still reserved against the subscription balance
    pub const RESERVED: [TxState; 3] =
        [TxState::Unconfirmed, TxState::Unstarted, TxState::InProgress];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::InProgress => "in_progress",
            TxState::Unconfirmed => "unconfirmed",
            TxState::Confirmed => "confirmed",
            TxState::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(TxState::Unstarted),
            "in_progress" => Ok(TxState::InProgress),
            "unconfirmed" => Ok(TxState::Unconfirmed),
            "confirmed" => Ok(TxState::Confirmed),
            "fatal_error" => Ok(TxState::FatalError),
            other => Err(DbError::InvalidRow(format!("unknown tx state {other}"))),
        }
    }
}

/// How the transaction manager treats a transaction that is replaced or dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStrategy {
    /// Broadcast every queued transaction, never drop older ones for the same subject
    #[default]
    SendEvery,
}

/// Metadata attached to fulfillment transactions.
///
/// Key names are shared with other readers of the transaction store and must not change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    #[serde(rename = "RequestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<B256>,
    #[serde(rename = "RequestIDs", default, skip_serializing_if = "Option::is_none")]
    pub request_ids: Option<Vec<B256>>,
    /// Decimal juels reserved by the transaction
    #[serde(rename = "MaxLink", default, skip_serializing_if = "Option::is_none")]
    pub max_link: Option<String>,
    /// Decimal wei reserved by the transaction
    #[serde(rename = "MaxEth", default, skip_serializing_if = "Option::is_none")]
    pub max_eth: Option<String>,
    #[serde(rename = "SubId", default, skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<u64>,
    #[serde(rename = "GlobalSubId", default, skip_serializing_if = "Option::is_none")]
    pub global_sub_id: Option<String>,
    #[serde(rename = "RequestTxHash", default, skip_serializing_if = "Option::is_none")]
    pub request_tx_hash: Option<B256>,
    #[serde(rename = "RequestTxHashes", default, skip_serializing_if = "Option::is_none")]
    pub request_tx_hashes: Option<Vec<B256>>,
    #[serde(rename = "ForceFulfilled", default, skip_serializing_if = "Option::is_none")]
    pub force_fulfilled: Option<bool>,
    #[serde(rename = "ForceFulfillmentAttempt", default, skip_serializing_if = "Option::is_none")]
    pub force_fulfillment_attempt: Option<u64>,
}

impl TxMeta {
    /// Tags the meta with a subscription under the key its version uses
    pub fn with_sub_id(mut self, sub_id: SubId) -> Self {
        match sub_id {
            SubId::V2(id) => self.sub_id = Some(id),
            SubId::V2Plus(id) => self.global_sub_id = Some(id.to_string()),
        }
        self
    }

    /// Sets the reserved fee under `MaxEth` or `MaxLink`
    pub fn with_max_fee(mut self, max_fee: U256, native_payment: bool) -> Self {
        if native_payment {
            self.max_eth = Some(max_fee.to_string());
        } else {
            self.max_link = Some(max_fee.to_string());
        }
        self
    }
}

/// Pre-broadcast check the transaction manager runs against a queued fulfillment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmitCheckerType {
    #[serde(rename = "vrf_v2")]
    VrfV2,
    #[serde(rename = "vrf_v2plus")]
    VrfV2Plus,
}

impl From<CoordinatorVersion> for TransmitCheckerType {
    fn from(version: CoordinatorVersion) -> Self {
        match version {
            CoordinatorVersion::V2 => TransmitCheckerType::VrfV2,
            CoordinatorVersion::V2Plus => TransmitCheckerType::VrfV2Plus,
        }
    }
}

/// Stored next to the transaction, key names are shared with the transaction manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitCheckerSpec {
    #[serde(rename = "CheckerType")]
    pub checker_type: TransmitCheckerType,
    #[serde(rename = "VRFCoordinatorAddress", default, skip_serializing_if = "Option::is_none")]
    pub vrf_coordinator_address: Option<Address>,
    #[serde(rename = "VRFRequestBlockNumber", default, skip_serializing_if = "Option::is_none")]
    pub vrf_request_block_number: Option<u64>,
}

impl TransmitCheckerSpec {
    pub fn vrf(version: CoordinatorVersion, coordinator: Address, request_block: u64) -> Self {
        Self {
            checker_type: version.into(),
            vrf_coordinator_address: Some(coordinator),
            vrf_request_block_number: Some(request_block),
        }
    }
}

/// Request ID as stored in meta (32 byte big endian)
pub fn request_id_hash(request_id: U256) -> B256 {
    B256::from(request_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub payload: Bytes,
    pub fee_limit: u64,
    pub strategy: SendStrategy,
    pub meta: TxMeta,
    pub checker: Option<TransmitCheckerSpec>,
}

/// A queued transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub id: i64,
    pub from: Address,
    pub to: Address,
    pub payload: Bytes,
    pub fee_limit: u64,
    pub strategy: SendStrategy,
    pub state: TxState,
    pub meta: TxMeta,
    pub checker: Option<TransmitCheckerSpec>,
    /// Unix seconds
    pub created_at: i64,
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    /// False when the transaction reverted
    pub status: bool,
    pub logs: Vec<Log>,
}

/// Kinds of mined fulfillment transactions scanned for reverts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevertedTxKind {
    /// Single fulfillments with a failed receipt, not yet force fulfilled
    Single,
    /// Batch fulfillments. Successful batches are included, a packed fulfillment may still
    /// have failed inside.
    Batch,
    /// Force fulfillments with a failed receipt
    ForceFulfilled,
}

/// A mined fulfillment transaction that may need recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertedTxnRecord {
    pub tx: Tx,
    pub receipt: TxReceipt,
}

impl RevertedTxnRecord {
    pub fn force_fulfillment_attempt(&self) -> u64 {
        self.tx.meta.force_fulfillment_attempt.unwrap_or(0)
    }
}

#[async_trait]
pub trait TxManager {
    async fn create_transaction(&self, req: TxRequest) -> Result<Tx, DbError>;

    /// Transactions whose meta `field` equals `value` (compared as text) in any of `states`
    async fn find_txes_by_meta_field_and_states(
        &self,
        field: &str,
        value: &str,
        states: &[TxState],
    ) -> Result<Vec<Tx>, DbError>;

    /// Mined transactions of `kind` with a receipt at or after `from_block`
    async fn find_reverted_txes(
        &self,
        kind: RevertedTxKind,
        from_block: u64,
    ) -> Result<Vec<RevertedTxnRecord>, DbError>;

    /// Force fulfillments that have not been mined yet
    async fn find_pending_force_fulfillments(&self) -> Result<Vec<Tx>, DbError>;

    /// Unstarted transactions carrying a transmit checker
    async fn find_unstarted_checked_txes(&self) -> Result<Vec<Tx>, DbError>;

    /// Moves `id` to [TxState::FatalError] if it is still unstarted, false if it was picked up
    async fn abandon_unstarted(&self, id: i64) -> Result<bool, DbError>;
}

pub type TxManagerObj = Arc<dyn TxManager + Send + Sync>;
