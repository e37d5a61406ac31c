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

//! Typed coordinator events decoded from raw chain logs.

use std::fmt;

use alloy::{
    primitives::{Address, Bytes, B256, U256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    contracts::{
        native_payment_from_extra_args,
        v2::IVRFCoordinatorV2,
        v2plus::IVRFCoordinatorV2Plus,
    },
    errors::{impl_coded_debug, CodedError},
};

/// Coordinator protocol version served by this fulfiller
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorVersion {
    V2,
    #[value(name = "v2plus")]
    V2Plus,
}

impl CoordinatorVersion {
    /// Request and fulfillment event signatures for this version
    pub fn event_signatures(&self) -> [B256; 2] {
        match self {
            Self::V2 => [
                IVRFCoordinatorV2::RandomWordsRequested::SIGNATURE_HASH,
                IVRFCoordinatorV2::RandomWordsFulfilled::SIGNATURE_HASH,
            ],
            Self::V2Plus => [
                IVRFCoordinatorV2Plus::RandomWordsRequested::SIGNATURE_HASH,
                IVRFCoordinatorV2Plus::RandomWordsFulfilled::SIGNATURE_HASH,
            ],
        }
    }
}

impl fmt::Display for CoordinatorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2 => write!(f, "v2"),
            Self::V2Plus => write!(f, "v2plus"),
        }
    }
}

/// Physical location of a log on chain.
///
/// A reorg that replays a request produces a new position for the same request ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogPosition {
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl LogPosition {
    /// Extracts the position of a mined log, `None` for pending logs
    pub fn from_log(log: &Log) -> Option<Self> {
        Some(Self {
            block_number: log.block_number?,
            block_hash: log.block_hash?,
            tx_hash: log.transaction_hash?,
            log_index: log.log_index?,
        })
    }
}

/// Subscription identifier, numeric on V2 and 256 bit on V2Plus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubId {
    V2(u64),
    V2Plus(U256),
}

impl SubId {
    /// Transaction meta key that carries this subscription ID
    pub fn meta_key(&self) -> &'static str {
        match self {
            Self::V2(_) => "SubId",
            Self::V2Plus(_) => "GlobalSubId",
        }
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2(id) => write!(f, "{id}"),
            Self::V2Plus(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    V2(IVRFCoordinatorV2::RandomWordsRequested),
    V2Plus(IVRFCoordinatorV2Plus::RandomWordsRequested),
}

/// A randomness request observed on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub kind: RequestKind,
    pub position: LogPosition,
    /// Raw log, handed to the proof pipeline
    pub log: Log,
}

impl RequestEvent {
    pub fn version(&self) -> CoordinatorVersion {
        match self.kind {
            RequestKind::V2(_) => CoordinatorVersion::V2,
            RequestKind::V2Plus(_) => CoordinatorVersion::V2Plus,
        }
    }

    pub fn request_id(&self) -> U256 {
        match &self.kind {
            RequestKind::V2(ev) => ev.requestId,
            RequestKind::V2Plus(ev) => ev.requestId,
        }
    }

    pub fn sub_id(&self) -> SubId {
        match &self.kind {
            RequestKind::V2(ev) => SubId::V2(ev.subId),
            RequestKind::V2Plus(ev) => SubId::V2Plus(ev.subId),
        }
    }

    pub fn key_hash(&self) -> B256 {
        match &self.kind {
            RequestKind::V2(ev) => ev.keyHash,
            RequestKind::V2Plus(ev) => ev.keyHash,
        }
    }

    pub fn pre_seed(&self) -> U256 {
        match &self.kind {
            RequestKind::V2(ev) => ev.preSeed,
            RequestKind::V2Plus(ev) => ev.preSeed,
        }
    }

    pub fn num_words(&self) -> u32 {
        match &self.kind {
            RequestKind::V2(ev) => ev.numWords,
            RequestKind::V2Plus(ev) => ev.numWords,
        }
    }

    pub fn callback_gas_limit(&self) -> u32 {
        match &self.kind {
            RequestKind::V2(ev) => ev.callbackGasLimit,
            RequestKind::V2Plus(ev) => ev.callbackGasLimit,
        }
    }

    pub fn min_request_confirmations(&self) -> u16 {
        match &self.kind {
            RequestKind::V2(ev) => ev.minimumRequestConfirmations,
            RequestKind::V2Plus(ev) => ev.minimumRequestConfirmations,
        }
    }

    pub fn sender(&self) -> Address {
        match &self.kind {
            RequestKind::V2(ev) => ev.sender,
            RequestKind::V2Plus(ev) => ev.sender,
        }
    }

    /// True when the request pays in the native token. V2 is always LINK paid.
    pub fn native_payment(&self) -> bool {
        match &self.kind {
            RequestKind::V2(_) => false,
            RequestKind::V2Plus(ev) => native_payment_from_extra_args(&ev.extraArgs),
        }
    }

    /// `extraArgs` are only carried by V2Plus requests
    pub fn extra_args(&self) -> Option<&Bytes> {
        match &self.kind {
            RequestKind::V2(_) => None,
            RequestKind::V2Plus(ev) => Some(&ev.extraArgs),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.position.block_number
    }
}

/// A fulfillment of a request, successful or reverted-but-mined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentEvent {
    pub request_id: U256,
    pub success: bool,
    pub payment: U256,
    /// Only reported by V2Plus coordinators
    pub native_payment: Option<bool>,
    pub position: LogPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Request(RequestEvent),
    Fulfillment(FulfillmentEvent),
}

#[derive(Error)]
pub enum EventErr {
    #[error("{code} Log is missing its block position", code = self.code())]
    MissingPosition,

    #[error("{code} Failed to decode {name} log: {source}", code = self.code())]
    Decode { name: &'static str, source: alloy::sol_types::Error },
}

impl_coded_debug!(EventErr);

impl CodedError for EventErr {
    fn code(&self) -> &str {
        match self {
            EventErr::MissingPosition => "[V-EVT-001]",
            EventErr::Decode { .. } => "[V-EVT-002]",
        }
    }
}

fn decode<E: SolEvent>(log: &Log) -> Result<E, EventErr> {
    log.log_decode::<E>()
        .map(|decoded| decoded.inner.data)
        .map_err(|source| EventErr::Decode { name: E::SIGNATURE, source })
}

/// Decodes a coordinator log of the given version.
///
/// Returns `Ok(None)` for logs that carry neither event signature.
pub fn decode_log(version: CoordinatorVersion, log: &Log) -> Result<Option<ChainEvent>, EventErr> {
    let Some(topic0) = log.topic0().copied() else {
        return Ok(None);
    };

    let event = match version {
        CoordinatorVersion::V2 => {
            if topic0 == IVRFCoordinatorV2::RandomWordsRequested::SIGNATURE_HASH {
                let ev = decode::<IVRFCoordinatorV2::RandomWordsRequested>(log)?;
                ChainEvent::Request(RequestEvent {
                    kind: RequestKind::V2(ev),
                    position: LogPosition::from_log(log).ok_or(EventErr::MissingPosition)?,
                    log: log.clone(),
                })
            } else if topic0 == IVRFCoordinatorV2::RandomWordsFulfilled::SIGNATURE_HASH {
                let ev = decode::<IVRFCoordinatorV2::RandomWordsFulfilled>(log)?;
                ChainEvent::Fulfillment(FulfillmentEvent {
                    request_id: ev.requestId,
                    success: ev.success,
                    payment: U256::from(ev.payment),
                    native_payment: None,
                    position: LogPosition::from_log(log).ok_or(EventErr::MissingPosition)?,
                })
            } else {
                return Ok(None);
            }
        }
        CoordinatorVersion::V2Plus => {
            if topic0 == IVRFCoordinatorV2Plus::RandomWordsRequested::SIGNATURE_HASH {
                let ev = decode::<IVRFCoordinatorV2Plus::RandomWordsRequested>(log)?;
                ChainEvent::Request(RequestEvent {
                    kind: RequestKind::V2Plus(ev),
                    position: LogPosition::from_log(log).ok_or(EventErr::MissingPosition)?,
                    log: log.clone(),
                })
            } else if topic0 == IVRFCoordinatorV2Plus::RandomWordsFulfilled::SIGNATURE_HASH {
                let ev = decode::<IVRFCoordinatorV2Plus::RandomWordsFulfilled>(log)?;
                ChainEvent::Fulfillment(FulfillmentEvent {
                    request_id: ev.requestId,
                    success: ev.success,
                    payment: U256::from(ev.payment),
                    native_payment: Some(ev.nativePayment),
                    position: LogPosition::from_log(log).ok_or(EventErr::MissingPosition)?,
                })
            } else {
                return Ok(None);
            }
        }
    };

    Ok(Some(event))
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::contracts::EXTRA_ARGS_V1_TAG;
    use alloy::{primitives::Uint, sol_types::SolValue};

    pub(crate) const COORDINATOR: Address = Address::repeat_byte(0xc0);

    pub(crate) fn key_hash() -> B256 {
        B256::repeat_byte(0x11)
    }

    pub(crate) fn position(block_number: u64, log_index: u64) -> LogPosition {
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&block_number.to_be_bytes());
        let mut tx = [0xaau8; 32];
        tx[..8].copy_from_slice(&block_number.to_be_bytes());
        LogPosition {
            block_number,
            block_hash: B256::from(hash),
            tx_hash: B256::from(tx),
            log_index,
        }
    }

    pub(crate) fn wrap_log(data: alloy::primitives::LogData, pos: LogPosition) -> Log {
        Log {
            inner: alloy::primitives::Log { address: COORDINATOR, data },
            block_hash: Some(pos.block_hash),
            block_number: Some(pos.block_number),
            block_timestamp: None,
            transaction_hash: Some(pos.tx_hash),
            transaction_index: Some(0),
            log_index: Some(pos.log_index),
            removed: false,
        }
    }

    pub(crate) struct V2RequestBuilder {
        pub(crate) request_id: U256,
        pub(crate) sub_id: u64,
        pub(crate) key_hash: B256,
        pub(crate) confs: u16,
        pub(crate) callback_gas_limit: u32,
        pub(crate) sender: Address,
        pub(crate) position: LogPosition,
    }

    impl V2RequestBuilder {
        pub(crate) fn new(request_id: u64, block_number: u64) -> Self {
            Self {
                request_id: U256::from(request_id),
                sub_id: 1,
                key_hash: key_hash(),
                confs: 3,
                callback_gas_limit: 100_000,
                sender: Address::repeat_byte(0x5e),
                position: position(block_number, request_id),
            }
        }

        pub(crate) fn sub_id(mut self, sub_id: u64) -> Self {
            self.sub_id = sub_id;
            self
        }

        pub(crate) fn key_hash(mut self, key_hash: B256) -> Self {
            self.key_hash = key_hash;
            self
        }

        pub(crate) fn confs(mut self, confs: u16) -> Self {
            self.confs = confs;
            self
        }

        pub(crate) fn gas(mut self, callback_gas_limit: u32) -> Self {
            self.callback_gas_limit = callback_gas_limit;
            self
        }

        pub(crate) fn position(mut self, position: LogPosition) -> Self {
            self.position = position;
            self
        }

        pub(crate) fn log(&self) -> Log {
            let ev = IVRFCoordinatorV2::RandomWordsRequested {
                keyHash: self.key_hash,
                requestId: self.request_id,
                preSeed: self.request_id + U256::from(1),
                subId: self.sub_id,
                minimumRequestConfirmations: self.confs,
                callbackGasLimit: self.callback_gas_limit,
                numWords: 1,
                sender: self.sender,
            };
            wrap_log(ev.encode_log_data(), self.position)
        }

        pub(crate) fn build(&self) -> RequestEvent {
            match decode_log(CoordinatorVersion::V2, &self.log()).unwrap().unwrap() {
                ChainEvent::Request(req) => req,
                ChainEvent::Fulfillment(_) => unreachable!(),
            }
        }
    }

    pub(crate) fn v2plus_request(
        request_id: u64,
        sub_id: U256,
        native: bool,
        callback_gas_limit: u32,
        pos: LogPosition,
    ) -> RequestEvent {
        let mut extra_args = EXTRA_ARGS_V1_TAG.to_vec();
        extra_args.extend_from_slice(&native.abi_encode());
        let ev = IVRFCoordinatorV2Plus::RandomWordsRequested {
            keyHash: key_hash(),
            requestId: U256::from(request_id),
            preSeed: U256::from(request_id + 1),
            subId: sub_id,
            minimumRequestConfirmations: 3,
            callbackGasLimit: callback_gas_limit,
            numWords: 2,
            extraArgs: extra_args.into(),
            sender: Address::repeat_byte(0x5e),
        };
        match decode_log(CoordinatorVersion::V2Plus, &wrap_log(ev.encode_log_data(), pos))
            .unwrap()
            .unwrap()
        {
            ChainEvent::Request(req) => req,
            ChainEvent::Fulfillment(_) => unreachable!(),
        }
    }

    pub(crate) fn v2_fulfillment_log(request_id: u64, success: bool, pos: LogPosition) -> Log {
        let ev = IVRFCoordinatorV2::RandomWordsFulfilled {
            requestId: U256::from(request_id),
            outputSeed: U256::from(42),
            payment: Uint::<96, 2>::from(1000u64),
            success,
        };
        wrap_log(ev.encode_log_data(), pos)
    }
}
