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

use std::collections::HashMap;

use alloy::{
    primitives::{B256, U256},
    rpc::types::Log,
};

use crate::events::{decode_log, ChainEvent, CoordinatorVersion, FulfillmentEvent, RequestEvent};

/// Result of classifying one window of coordinator logs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassifiedWindow {
    /// Requests for this key hash without a fulfillment in the window, in log order
    pub unfulfilled: Vec<RequestEvent>,
    /// Last fulfillment seen per request ID
    pub fulfillments: HashMap<U256, FulfillmentEvent>,
    /// Every fulfillment log of the window, in log order
    pub fulfillment_logs: Vec<FulfillmentEvent>,
}

impl ClassifiedWindow {
    /// Lowest block among the unfulfilled requests
    pub fn min_unfulfilled_block(&self) -> Option<u64> {
        self.unfulfilled.iter().map(|req| req.block_number()).min()
    }
}

/// Splits coordinator logs into fulfilled and unfulfilled requests for one key hash
#[derive(Debug, Clone, Copy)]
pub struct LogClassifier {
    version: CoordinatorVersion,
    key_hash: B256,
}

impl LogClassifier {
    pub fn new(version: CoordinatorVersion, key_hash: B256) -> Self {
        Self { version, key_hash }
    }

    pub fn version(&self) -> CoordinatorVersion {
        self.version
    }

    pub fn key_hash(&self) -> B256 {
        self.key_hash
    }

    /// Decodes a single log, dropping requests for other key hashes.
    ///
    /// Undecodable logs are logged and dropped.
    pub fn classify_log(&self, log: &Log) -> Option<ChainEvent> {
        match decode_log(self.version, log) {
            Ok(Some(ChainEvent::Request(req))) if req.key_hash() != self.key_hash => {
                tracing::trace!(
                    "Skipping request 0x{:x} for key hash {}",
                    req.request_id(),
                    req.key_hash()
                );
                None
            }
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                tracing::debug!("Skipping unknown topic0 log: {:?}", log.topic0());
                None
            }
            Err(err) => {
                tracing::error!(
                    "Failed to decode coordinator log in tx {:?}: {err:?}",
                    log.transaction_hash
                );
                None
            }
        }
    }

    /// Classifies a window of logs. Pure function of its input.
    pub fn classify(&self, logs: &[Log]) -> ClassifiedWindow {
        let mut requests: HashMap<U256, RequestEvent> = HashMap::new();
        let mut order: Vec<U256> = Vec::new();
        let mut window = ClassifiedWindow::default();

        for log in logs {
            match self.classify_log(log) {
                Some(ChainEvent::Request(req)) => {
                    let id = req.request_id();
                    if requests.insert(id, req).is_none() {
                        order.push(id);
                    }
                }
                Some(ChainEvent::Fulfillment(ful)) => {
                    window.fulfillments.insert(ful.request_id, ful.clone());
                    window.fulfillment_logs.push(ful);
                }
                None => {}
            }
        }

        window.unfulfilled = order
            .into_iter()
            .filter(|id| !window.fulfillments.contains_key(id))
            .filter_map(|id| requests.remove(&id))
            .collect();

        tracing::trace!(
            "Classified {} logs: {} unfulfilled requests, {} fulfillments",
            logs.len(),
            window.unfulfilled.len(),
            window.fulfillment_logs.len()
        );

        window
    }
}
