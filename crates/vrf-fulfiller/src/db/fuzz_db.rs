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

use alloy::primitives::{Address, Bytes, B256, U256};
use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::HashMap;
use tokio::runtime::Runtime;

use super::SqliteDb;
use crate::{
    events::SubId,
    txm::{request_id_hash, SendStrategy, TxManager, TxMeta, TxReceipt, TxRequest, TxState},
};

#[derive(Debug, Arbitrary, Clone)]
enum DbOperation {
    Create {
        #[proptest(strategy = "0u64..3")]
        sub: u64,
        max_link: u32,
    },
    Broadcast(u8),
    Mine { idx: u8, success: bool },
    Fail(u8),
}

fn tx_request(sub: u64, request_id: u64, max_link: u32) -> TxRequest {
    TxRequest {
        from: Address::repeat_byte(1),
        to: Address::repeat_byte(2),
        payload: Bytes::new(),
        fee_limit: 100_000,
        strategy: SendStrategy::SendEvery,
        meta: TxMeta { request_id: Some(request_id_hash(U256::from(request_id))), ..Default::default() }
            .with_sub_id(SubId::V2(sub))
            .with_max_fee(U256::from(max_link), false),
        checker: None,
    }
}

// Reserved fees read back from the store always match the fees of transactions not yet final
proptest! {
    #[test]
    fn fuzz_reservations(operations in prop::collection::vec(any::<DbOperation>(), 1..60)) {
        let rt = Runtime::new().unwrap();

        rt.block_on(async {
            let db = SqliteDb::new("sqlite::memory:").await.unwrap();
            // id -> (sub, max_link, reserved)
            let mut model: Vec<(i64, u64, u32, bool)> = vec![];

            for (n, op) in operations.into_iter().enumerate() {
                match op {
                    DbOperation::Create { sub, max_link } => {
                        let tx = db.create_transaction(tx_request(sub, n as u64, max_link)).await.unwrap();
                        model.push((tx.id, sub, max_link, true));
                    }
                    DbOperation::Broadcast(idx) if !model.is_empty() => {
                        let pos = idx as usize % model.len();
                        let entry = &model[pos];
                        if entry.3 {
                            db.set_tx_state(entry.0, TxState::Unconfirmed).await.unwrap();
                        }
                    }
                    DbOperation::Mine { idx, success } if !model.is_empty() => {
                        let pos = idx as usize % model.len();
                        let entry = &mut model[pos];
                        let receipt = TxReceipt {
                            tx_hash: B256::repeat_byte(idx),
                            block_number: n as u64,
                            status: success,
                            logs: vec![],
                        };
                        db.insert_receipt(entry.0, &receipt).await.unwrap();
                        entry.3 = false;
                    }
                    DbOperation::Fail(idx) if !model.is_empty() => {
                        let pos = idx as usize % model.len();
                        let entry = &mut model[pos];
                        db.set_tx_state(entry.0, TxState::FatalError).await.unwrap();
                        entry.3 = false;
                    }
                    _ => {}
                }
            }

            let mut expected: HashMap<u64, U256> = HashMap::new();
            for (_, sub, max_link, reserved) in &model {
                if *reserved {
                    *expected.entry(*sub).or_default() += U256::from(*max_link);
                }
            }

            for sub in 0..3u64 {
                let txes = db
                    .find_txes_by_meta_field_and_states("SubId", &sub.to_string(), &TxState::RESERVED)
                    .await
                    .unwrap();
                let reserved = txes
                    .iter()
                    .filter_map(|tx| tx.meta.max_link.as_deref())
                    .map(|v| v.parse::<U256>().unwrap())
                    .fold(U256::ZERO, |acc, v| acc + v);
                assert_eq!(reserved, expected.get(&sub).copied().unwrap_or_default(), "sub {sub}");
            }
        });
    }
}
