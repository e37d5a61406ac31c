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

//! Boundary to the external proof generation pipeline.

use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::{Bytes, B256},
    rpc::types::Log,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::errors::{impl_coded_debug, CodedError};

const PIPELINE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error)]
pub enum PipelineErr {
    #[error("{code} Pipeline request failed: {0}", code = self.code())]
    Http(#[from] reqwest::Error),

    #[error("{code} Pipeline returned status {0}", code = self.code())]
    BadStatus(reqwest::StatusCode),

    #[error("{code} Log is missing field {0}", code = self.code())]
    IncompleteLog(&'static str),
}

impl_coded_debug!(PipelineErr);

impl CodedError for PipelineErr {
    fn code(&self) -> &str {
        match self {
            PipelineErr::Http(_) => "[V-PIPE-001]",
            PipelineErr::BadStatus(_) => "[V-PIPE-002]",
            PipelineErr::IncompleteLog(_) => "[V-PIPE-003]",
        }
    }
}

/// Job level context handed to every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecVars {
    #[serde(rename = "databaseID")]
    pub database_id: i64,
    #[serde(rename = "externalJobID")]
    pub external_job_id: Uuid,
    pub name: String,
    #[serde(rename = "publicKey")]
    pub public_key: Bytes,
    /// Decimal wei
    #[serde(rename = "maxGasPrice")]
    pub max_gas_price: String,
    #[serde(rename = "evmChainID")]
    pub evm_chain_id: String,
}

/// The request log being proven
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunVars {
    #[serde(rename = "logBlockHash")]
    pub log_block_hash: B256,
    #[serde(rename = "logBlockNumber")]
    pub log_block_number: u64,
    #[serde(rename = "logTxHash")]
    pub log_tx_hash: B256,
    #[serde(rename = "logTopics")]
    pub log_topics: Vec<B256>,
    #[serde(rename = "logData")]
    pub log_data: Bytes,
}

impl JobRunVars {
    pub fn from_log(log: &Log) -> Result<Self, PipelineErr> {
        Ok(Self {
            log_block_hash: log.block_hash.ok_or(PipelineErr::IncompleteLog("block_hash"))?,
            log_block_number: log.block_number.ok_or(PipelineErr::IncompleteLog("block_number"))?,
            log_tx_hash: log
                .transaction_hash
                .ok_or(PipelineErr::IncompleteLog("transaction_hash"))?,
            log_topics: log.topics().to_vec(),
            log_data: log.data().data.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineVars {
    #[serde(rename = "jobSpec")]
    pub job_spec: JobSpecVars,
    #[serde(rename = "jobRun")]
    pub job_run: JobRunVars,
}

/// Output of the VRF proving task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VrfTaskResult {
    /// ABI encoded `fulfillRandomWords` calldata carrying the proof and commitment
    Output(Bytes),
    Error(String),
}

/// Result of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Option<Uuid>,
    /// Task level errors of the run, empty on success
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub vrf: Option<VrfTaskResult>,
    /// Gas limit from the estimation task
    #[serde(default)]
    pub gas_limit: Option<u64>,
    /// Final values of the run, a successful simulation yields the max fee as bytes
    #[serde(default)]
    pub final_values: Vec<Bytes>,
}

impl PipelineRun {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_text(&self) -> String {
        self.errors.join("; ")
    }
}

#[async_trait]
pub trait ProofPipeline {
    async fn execute(&self, vars: PipelineVars) -> Result<PipelineRun, PipelineErr>;
}

pub type PipelineObj = Arc<dyn ProofPipeline + Send + Sync>;

/// [ProofPipeline] reached over HTTP, the run is posted as JSON
#[derive(Clone, Debug)]
pub struct HttpProofPipeline {
    client: Client,
    url: Url,
}

impl HttpProofPipeline {
    pub fn new(url: Url) -> Result<Self, PipelineErr> {
        let client = Client::builder().timeout(PIPELINE_TIMEOUT).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ProofPipeline for HttpProofPipeline {
    async fn execute(&self, vars: PipelineVars) -> Result<PipelineRun, PipelineErr> {
        tracing::trace!(
            "Executing pipeline run for log {} in block {}",
            vars.job_run.log_tx_hash,
            vars.job_run.log_block_number
        );
        let response = self.client.post(self.url.clone()).json(&vars).send().await?;
        if !response.status().is_success() {
            return Err(PipelineErr::BadStatus(response.status()));
        }
        Ok(response.json().await?)
    }
}
