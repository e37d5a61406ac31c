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

//! Read access to the coordinator contract and the chain around it.

use std::{sync::Arc, time::Duration};

use alloy::{
    consensus::Transaction as _,
    eips::BlockId,
    network::{Ethereum, TransactionResponse},
    primitives::{Address, Bytes, B256, U256},
    providers::Provider,
    rpc::types::{TransactionInput, TransactionRequest},
    transports::TransportError,
};
use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;

use crate::{
    contracts::{v2::IVRFCoordinatorV2, v2plus::IVRFCoordinatorV2Plus, AggregatorV3Interface},
    errors::{impl_coded_debug, CodedError},
    events::{CoordinatorVersion, SubId},
};

const PRICE_FEED_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error)]
pub enum CoordinatorErr {
    #[error("{code} RPC error: {0:?}", code = self.code())]
    RpcErr(anyhow::Error),

    #[error("{code} Subscription {0} not found", code = self.code())]
    SubscriptionNotFound(SubId),

    #[error("{code} Subscription {0} does not belong to a {1} coordinator", code = self.code())]
    VersionMismatch(SubId, CoordinatorVersion),

    #[error("{code} Timed out after {0:?}", code = self.code())]
    Timeout(Duration),

    #[error("{code} Invalid feed answer: {0}", code = self.code())]
    InvalidFeedAnswer(String),

    #[error("{code} Transaction {0} not found", code = self.code())]
    TxNotFound(B256),
}

impl_coded_debug!(CoordinatorErr);

impl CodedError for CoordinatorErr {
    fn code(&self) -> &str {
        match self {
            CoordinatorErr::RpcErr(_) => "[V-COR-400]",
            CoordinatorErr::SubscriptionNotFound(_) => "[V-COR-404]",
            CoordinatorErr::VersionMismatch(..) => "[V-COR-409]",
            CoordinatorErr::Timeout(_) => "[V-COR-408]",
            CoordinatorErr::InvalidFeedAnswer(_) => "[V-COR-422]",
            CoordinatorErr::TxNotFound(_) => "[V-COR-405]",
        }
    }
}

fn is_execution_reverted(err: &impl std::fmt::Display) -> bool {
    err.to_string().contains("execution reverted")
}

/// On-chain subscription balances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    /// LINK balance (juels)
    pub balance: U256,
    /// Native balance (wei), always zero on V2
    pub native_balance: U256,
    /// False once the subscription was canceled
    pub active: bool,
}

impl Subscription {
    /// Balance state of a subscription that no longer exists on chain
    pub fn canceled() -> Self {
        Self { balance: U256::ZERO, native_balance: U256::ZERO, active: false }
    }
}

#[async_trait]
pub trait Coordinator {
    fn version(&self) -> CoordinatorVersion;
    fn address(&self) -> Address;

    /// Reads a subscription. A reverting read returns [CoordinatorErr::SubscriptionNotFound].
    async fn get_subscription(&self, sub_id: SubId) -> Result<Subscription, CoordinatorErr>;

    /// Max callback gas limit from the coordinator config
    async fn max_gas_limit(&self) -> Result<u64, CoordinatorErr>;

    /// Stored commitment of each `(request_id, block)` pair, read at that block.
    ///
    /// A zero commitment means the request was fulfilled or never existed.
    async fn commitments(&self, requests: &[(U256, u64)]) -> Vec<Result<B256, CoordinatorErr>>;
}

pub type CoordinatorObj = Arc<dyn Coordinator + Send + Sync>;

/// Outcome of an `eth_call`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success(Bytes),
    /// Revert data returned by the node, empty if it reported none
    Reverted(Bytes),
}

/// Fields of a mined transaction needed to replay it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub gas_limit: u64,
    pub block_number: Option<u64>,
}

#[async_trait]
pub trait ChainClient {
    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> Result<u64, CoordinatorErr>;

    async fn code_at(&self, address: Address, block: u64) -> Result<Bytes, CoordinatorErr>;

    async fn transaction(&self, hash: B256) -> Result<TxInfo, CoordinatorErr>;

    async fn call_at(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        block: u64,
    ) -> Result<CallOutcome, CoordinatorErr>;
}

pub type ChainClientObj = Arc<dyn ChainClient + Send + Sync>;

/// LINK price in the native token, used to convert fee estimates into juels
#[async_trait]
pub trait PriceFeed {
    async fn wei_per_unit_link(&self) -> Result<U256, CoordinatorErr>;
}

pub type PriceFeedObj = Arc<dyn PriceFeed + Send + Sync>;

/// [Coordinator] bound to a deployed V2 or V2Plus coordinator
pub struct AlloyCoordinator<P> {
    provider: P,
    address: Address,
    version: CoordinatorVersion,
}

impl<P> AlloyCoordinator<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub fn new(provider: P, address: Address, version: CoordinatorVersion) -> Self {
        Self { provider, address, version }
    }

    async fn commitment(&self, request_id: U256, block: u64) -> Result<B256, CoordinatorErr> {
        let block = BlockId::number(block);
        let res = match self.version {
            CoordinatorVersion::V2 => {
                IVRFCoordinatorV2::new(self.address, &self.provider)
                    .getCommitment(request_id)
                    .block(block)
                    .call()
                    .await
            }
            CoordinatorVersion::V2Plus => {
                IVRFCoordinatorV2Plus::new(self.address, &self.provider)
                    .s_requestCommitments(request_id)
                    .block(block)
                    .call()
                    .await
            }
        };
        res.map_err(|err| CoordinatorErr::RpcErr(err.into()))
    }
}

#[async_trait]
impl<P> Coordinator for AlloyCoordinator<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    fn version(&self) -> CoordinatorVersion {
        self.version
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn get_subscription(&self, sub_id: SubId) -> Result<Subscription, CoordinatorErr> {
        let res = match (self.version, sub_id) {
            (CoordinatorVersion::V2, SubId::V2(id)) => {
                IVRFCoordinatorV2::new(self.address, &self.provider)
                    .getSubscription(id)
                    .call()
                    .await
                    .map(|sub| Subscription {
                        balance: U256::from(sub.balance),
                        native_balance: U256::ZERO,
                        active: true,
                    })
            }
            (CoordinatorVersion::V2Plus, SubId::V2Plus(id)) => {
                IVRFCoordinatorV2Plus::new(self.address, &self.provider)
                    .getSubscription(id)
                    .call()
                    .await
                    .map(|sub| Subscription {
                        balance: U256::from(sub.balance),
                        native_balance: U256::from(sub.nativeBalance),
                        active: true,
                    })
            }
            (version, sub_id) => return Err(CoordinatorErr::VersionMismatch(sub_id, version)),
        };

        res.map_err(|err| {
            if is_execution_reverted(&err) {
                CoordinatorErr::SubscriptionNotFound(sub_id)
            } else {
                CoordinatorErr::RpcErr(err.into())
            }
        })
    }

    async fn max_gas_limit(&self) -> Result<u64, CoordinatorErr> {
        let limit = match self.version {
            CoordinatorVersion::V2 => IVRFCoordinatorV2::new(self.address, &self.provider)
                .getConfig()
                .call()
                .await
                .map(|config| config.maxGasLimit),
            CoordinatorVersion::V2Plus => IVRFCoordinatorV2Plus::new(self.address, &self.provider)
                .s_config()
                .call()
                .await
                .map(|config| config.maxGasLimit),
        }
        .map_err(|err| CoordinatorErr::RpcErr(err.into()))?;
        Ok(limit.into())
    }

    async fn commitments(&self, requests: &[(U256, u64)]) -> Vec<Result<B256, CoordinatorErr>> {
        join_all(requests.iter().map(|(id, block)| self.commitment(*id, *block))).await
    }
}

/// [ChainClient] over an alloy provider
pub struct AlloyChainClient<P> {
    provider: P,
}

impl<P> AlloyChainClient<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

fn call_request(from: Address, to: Address, data: Bytes) -> TransactionRequest {
    TransactionRequest::default().from(from).to(to).input(TransactionInput::new(data))
}

fn rpc_err(err: TransportError) -> CoordinatorErr {
    CoordinatorErr::RpcErr(err.into())
}

#[async_trait]
impl<P> ChainClient for AlloyChainClient<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> Result<u64, CoordinatorErr> {
        self.provider.estimate_gas(call_request(from, to, data)).await.map_err(rpc_err)
    }

    async fn code_at(&self, address: Address, block: u64) -> Result<Bytes, CoordinatorErr> {
        self.provider
            .get_code_at(address)
            .block_id(BlockId::number(block))
            .await
            .map_err(rpc_err)
    }

    async fn transaction(&self, hash: B256) -> Result<TxInfo, CoordinatorErr> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(rpc_err)?
            .ok_or(CoordinatorErr::TxNotFound(hash))?;
        Ok(TxInfo {
            hash,
            from: TransactionResponse::from(&tx),
            to: tx.to(),
            input: tx.input().clone(),
            gas_limit: tx.gas_limit(),
            block_number: tx.block_number,
        })
    }

    async fn call_at(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        block: u64,
    ) -> Result<CallOutcome, CoordinatorErr> {
        match self.provider.call(call_request(from, to, data)).block(BlockId::number(block)).await {
            Ok(output) => Ok(CallOutcome::Success(output)),
            Err(err) => match err.as_error_resp() {
                Some(payload) if is_execution_reverted(&payload.message) => {
                    Ok(CallOutcome::Reverted(payload.as_revert_data().unwrap_or_default()))
                }
                _ => Err(rpc_err(err)),
            },
        }
    }
}

/// [PriceFeed] reading a LINK/native aggregator
pub struct AggregatorPriceFeed<P> {
    provider: P,
    address: Address,
}

impl<P> AggregatorPriceFeed<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    pub fn new(provider: P, address: Address) -> Self {
        Self { provider, address }
    }
}

#[async_trait]
impl<P> PriceFeed for AggregatorPriceFeed<P>
where
    P: Provider<Ethereum> + 'static + Clone,
{
    async fn wei_per_unit_link(&self) -> Result<U256, CoordinatorErr> {
        let feed = AggregatorV3Interface::new(self.address, &self.provider);
        let round = tokio::time::timeout(PRICE_FEED_TIMEOUT, feed.latestRoundData().call())
            .await
            .map_err(|_| CoordinatorErr::Timeout(PRICE_FEED_TIMEOUT))?
            .map_err(|err| CoordinatorErr::RpcErr(err.into()))?;

        if round.answer.is_negative() {
            return Err(CoordinatorErr::InvalidFeedAnswer(round.answer.to_string()));
        }
        Ok(round.answer.into_raw())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use alloy::{
        node_bindings::Anvil,
        primitives::{address, I256},
        providers::ProviderBuilder,
        sol_types::{SolCall, SolValue},
    };
    use httpmock::prelude::*;

    fn rpc_result(server: &MockServer, method: &str, result: serde_json::Value) {
        server.mock(|when, then| {
            when.method(POST).path("/").body_contains(method);
            then.status(200).header("content-type", "application/json").json_body(
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": result
                }),
            );
        });
    }

    fn rpc_error(server: &MockServer, message: &str) {
        server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200).header("content-type", "application/json").json_body(
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": { "code": 3, "message": message, "data": "0xf4d678b8" }
                }),
            );
        });
    }

    fn hex_result(data: Vec<u8>) -> serde_json::Value {
        serde_json::Value::String(format!("0x{}", hex::encode(data)))
    }

    #[tokio::test]
    async fn price_feed_answer() {
        let server = MockServer::start();
        let encoded = (
            U256::from(1234),
            I256::try_from(5_898_160_000_000_000i128).unwrap(),
            U256::from(1706547100),
            U256::from(1706547200),
            U256::from(1234),
        )
            .abi_encode();
        rpc_result(&server, "eth_call", hex_result(encoded));

        let provider = ProviderBuilder::new().connect_http(server.base_url().parse().unwrap());
        let feed = AggregatorPriceFeed::new(
            provider,
            address!("0x5f4eC3Df9cbd43714FE2740f5E3616155c5b8419"),
        );
        assert_eq!(feed.wei_per_unit_link().await.unwrap(), U256::from(5_898_160_000_000_000u64));
    }

    #[tokio::test]
    async fn price_feed_negative_answer() {
        let server = MockServer::start();
        let encoded = (U256::from(1), I256::MINUS_ONE, U256::ZERO, U256::ZERO, U256::from(1))
            .abi_encode();
        rpc_result(&server, "eth_call", hex_result(encoded));

        let provider = ProviderBuilder::new().connect_http(server.base_url().parse().unwrap());
        let feed = AggregatorPriceFeed::new(provider, Address::ZERO);
        let err = feed.wei_per_unit_link().await.unwrap_err();
        assert!(matches!(err, CoordinatorErr::InvalidFeedAnswer(_)));
    }

    #[tokio::test]
    async fn v2plus_subscription_balances() {
        let server = MockServer::start();
        let encoded = IVRFCoordinatorV2Plus::getSubscriptionCall::abi_encode_returns(
            &IVRFCoordinatorV2Plus::getSubscriptionReturn {
                balance: alloy::primitives::Uint::from(10u64),
                nativeBalance: alloy::primitives::Uint::from(20u64),
                reqCount: 3,
                owner: Address::repeat_byte(1),
                consumers: vec![],
            },
        );
        rpc_result(&server, "eth_call", hex_result(encoded));

        let provider = ProviderBuilder::new().connect_http(server.base_url().parse().unwrap());
        let coordinator =
            AlloyCoordinator::new(provider, Address::ZERO, CoordinatorVersion::V2Plus);
        let sub = coordinator.get_subscription(SubId::V2Plus(U256::from(7))).await.unwrap();
        assert_eq!(
            sub,
            Subscription { balance: U256::from(10), native_balance: U256::from(20), active: true }
        );
    }

    #[tokio::test]
    async fn reverted_subscription_read_is_not_found() {
        let server = MockServer::start();
        rpc_error(&server, "execution reverted");

        let provider = ProviderBuilder::new().connect_http(server.base_url().parse().unwrap());
        let coordinator = AlloyCoordinator::new(provider, Address::ZERO, CoordinatorVersion::V2);
        let err = coordinator.get_subscription(SubId::V2(1)).await.unwrap_err();
        assert!(matches!(err, CoordinatorErr::SubscriptionNotFound(SubId::V2(1))));

        let err = coordinator.get_subscription(SubId::V2Plus(U256::from(1))).await.unwrap_err();
        assert!(matches!(err, CoordinatorErr::VersionMismatch(..)));
    }

    #[tokio::test]
    async fn call_at_surfaces_revert_data() {
        let server = MockServer::start();
        rpc_error(&server, "execution reverted");

        let provider = ProviderBuilder::new().connect_http(server.base_url().parse().unwrap());
        let client = AlloyChainClient::new(provider);
        let outcome =
            client.call_at(Address::ZERO, Address::ZERO, Bytes::new(), 10).await.unwrap();
        assert_eq!(outcome, CallOutcome::Reverted(Bytes::from_static(&[0xf4, 0xd6, 0x78, 0xb8])));
    }

    #[tokio::test]
    async fn chain_client_against_anvil() {
        let anvil = Anvil::new().spawn();
        let provider = ProviderBuilder::new().connect_http(anvil.endpoint_url());
        let client = AlloyChainClient::new(provider);

        let code = client.code_at(anvil.addresses()[0], 0).await.unwrap();
        assert!(code.is_empty());

        let gas = client
            .estimate_gas(anvil.addresses()[0], anvil.addresses()[1], Bytes::new())
            .await
            .unwrap();
        assert_eq!(gas, 21_000);

        let err = client.transaction(B256::repeat_byte(1)).await.unwrap_err();
        assert!(matches!(err, CoordinatorErr::TxNotFound(_)));
    }
}
