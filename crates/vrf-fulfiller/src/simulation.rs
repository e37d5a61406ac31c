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

//! Simulates fulfillments through the proof pipeline and classifies the outcome.
//!
//! Pipeline task errors arrive as free text. They are matched against known revert messages
//! here, once, and everything downstream works on [SimulationError] variants.

use std::time::Instant;

use alloy::{
    primitives::{Bytes, U256},
    sol_types::SolCall,
};
use futures::future::join_all;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    confirmation::PendingRequest,
    contracts::{v2, v2plus},
    coordinator::{CoordinatorErr, PriceFeedObj},
    errors::{impl_coded_debug, CodedError},
    events::CoordinatorVersion,
    fees::{self, FeeErr},
    pipeline::{JobRunVars, JobSpecVars, PipelineObj, PipelineRun, PipelineVars, VrfTaskResult},
};

const BLOCKHASH_NOT_IN_STORE: &str = "blockhash not found in store";
const EXECUTION_REVERTED: &str = "execution reverted";

/// Revert messages of the on-chain proof verifier
const PROOF_VERIFICATION_ERRORS: [&str; 8] = [
    "invalid proof",
    "public key is not on curve",
    "gamma is not on curve",
    "cGammaWitness is not on curve",
    "sHashWitness is not on curve",
    "addr(c*pk+s*g)!=_uWitness",
    "invalid zPoint",
    "bad y-coord",
];

fn is_proof_verification_error(msg: &str) -> bool {
    PROOF_VERIFICATION_ERRORS.iter().any(|needle| msg.contains(needle))
}

/// Proof and commitment of a fulfillment, per coordinator version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fulfillment {
    V2 { proof: v2::Proof, commitment: v2::RequestCommitment },
    V2Plus { proof: v2plus::Proof, commitment: v2plus::RequestCommitment, only_premium: bool },
}

impl Fulfillment {
    /// Decodes the coordinator `fulfillRandomWords` calldata produced by the VRF task
    pub fn decode(version: CoordinatorVersion, payload: &[u8]) -> Result<Self, SimulationError> {
        let decoded = match version {
            CoordinatorVersion::V2 => v2::IVRFCoordinatorV2::fulfillRandomWordsCall::abi_decode(
                payload,
            )
            .map(|call| Fulfillment::V2 { proof: call.proof, commitment: call.rc }),
            CoordinatorVersion::V2Plus => {
                v2plus::IVRFCoordinatorV2Plus::fulfillRandomWordsCall::abi_decode(payload).map(
                    |call| Fulfillment::V2Plus {
                        proof: call.proof,
                        commitment: call.rc,
                        only_premium: call.onlyPremium,
                    },
                )
            }
        };
        decoded.map_err(|err| SimulationError::MalformedOutput(err.to_string()))
    }

    pub fn seed(&self) -> U256 {
        match self {
            Fulfillment::V2 { proof, .. } => proof.seed,
            Fulfillment::V2Plus { proof, .. } => proof.seed,
        }
    }

    /// Payment currency recorded in the commitment
    pub fn native_payment(&self) -> bool {
        match self {
            Fulfillment::V2 { .. } => false,
            Fulfillment::V2Plus { commitment, .. } => {
                crate::contracts::native_payment_from_extra_args(&commitment.extraArgs)
            }
        }
    }
}

/// Output of the VRF task, kept on reverted simulations so the request can be force fulfilled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfOutput {
    /// Coordinator `fulfillRandomWords` calldata
    pub payload: Bytes,
    pub fulfillment: Fulfillment,
}

#[derive(Error, Clone)]
pub enum SimulationError {
    #[error("{code} Blockhash not found in store: {0}", code = self.code())]
    BlockhashNotInStore(String),

    #[error("{code} Proof verification failed: {0}", code = self.code())]
    ProofVerificationFailed(String),

    #[error("{code} Simulation reverted, possibly insufficient funds: {reason}", code = self.code())]
    PossiblyInsufficientFunds { reason: String, vrf: Option<Box<VrfOutput>>, gas_limit: u64 },

    #[error("{code} Simulation failed: {0}", code = self.code())]
    Unclassified(String),

    #[error("{code} Malformed pipeline output: {0}", code = self.code())]
    MalformedOutput(String),
}

impl_coded_debug!(SimulationError);

impl CodedError for SimulationError {
    fn code(&self) -> &str {
        match self {
            SimulationError::BlockhashNotInStore(_) => "[V-SIM-001]",
            SimulationError::ProofVerificationFailed(_) => "[V-SIM-002]",
            SimulationError::PossiblyInsufficientFunds { .. } => "[V-SIM-003]",
            SimulationError::Unclassified(_) => "[V-SIM-004]",
            SimulationError::MalformedOutput(_) => "[V-SIM-005]",
        }
    }
}

/// A successful simulation, ready to be enqueued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Simulated {
    pub run_id: Option<Uuid>,
    pub vrf: VrfOutput,
    pub gas_limit: u64,
    /// Max fee the coordinator may charge, in the request's payment currency
    pub max_fee: U256,
}

/// Simulation of one pending request
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub req: PendingRequest,
    /// Worst case cost estimate, zero when the estimate failed
    pub funds_needed: U256,
    pub outcome: Result<Simulated, SimulationError>,
}

/// Classifies a finished pipeline run
pub fn classify_run(
    version: CoordinatorVersion,
    run: &PipelineRun,
) -> Result<Simulated, SimulationError> {
    if run.has_errors() {
        let text = run.error_text();
        if text.contains(BLOCKHASH_NOT_IN_STORE) {
            return Err(SimulationError::BlockhashNotInStore(text));
        }
        if is_proof_verification_error(&text) {
            return Err(SimulationError::ProofVerificationFailed(text));
        }
        if text.contains(EXECUTION_REVERTED) {
            let vrf = match &run.vrf {
                Some(VrfTaskResult::Output(payload)) => {
                    match Fulfillment::decode(version, payload) {
                        Ok(fulfillment) => {
                            Some(Box::new(VrfOutput { payload: payload.clone(), fulfillment }))
                        }
                        Err(err) => {
                            tracing::error!("CRITICAL: failed to decode VRF output: {err}");
                            None
                        }
                    }
                }
                Some(VrfTaskResult::Error(err)) => {
                    tracing::error!("CRITICAL: failed to generate VRF proof: {err}");
                    None
                }
                None => None,
            };
            return Err(SimulationError::PossiblyInsufficientFunds {
                reason: text,
                vrf,
                gas_limit: run.gas_limit.unwrap_or_default(),
            });
        }
        return Err(SimulationError::Unclassified(text));
    }

    let [max_fee] = run.final_values.as_slice() else {
        return Err(SimulationError::Unclassified(format!(
            "unexpected number of outputs, expected 1, was {}",
            run.final_values.len()
        )));
    };
    if max_fee.len() > 32 {
        return Err(SimulationError::MalformedOutput(format!(
            "max fee is {} bytes long",
            max_fee.len()
        )));
    }
    let max_fee = U256::from_be_slice(max_fee);

    let payload = match &run.vrf {
        Some(VrfTaskResult::Output(payload)) => payload.clone(),
        Some(VrfTaskResult::Error(err)) => {
            return Err(SimulationError::MalformedOutput(format!("VRF task failed: {err}")))
        }
        None => return Err(SimulationError::MalformedOutput("missing VRF task output".into())),
    };
    let fulfillment = Fulfillment::decode(version, &payload)?;
    let gas_limit = run
        .gas_limit
        .ok_or_else(|| SimulationError::MalformedOutput("missing gas limit".into()))?;

    Ok(Simulated { run_id: run.run_id, vrf: VrfOutput { payload, fulfillment }, gas_limit, max_fee })
}

/// Runs fee estimation and pipeline simulation for pending requests
#[derive(Clone)]
pub struct Simulator {
    version: CoordinatorVersion,
    pipeline: PipelineObj,
    price_feed: PriceFeedObj,
    job: JobSpecVars,
}

impl Simulator {
    /// `job` is the template handed to every run, its max gas price is set per call.
    pub fn new(
        version: CoordinatorVersion,
        pipeline: PipelineObj,
        price_feed: PriceFeedObj,
        job: JobSpecVars,
    ) -> Self {
        Self { version, pipeline, price_feed, job }
    }

    async fn estimate_fee(
        &self,
        req: &PendingRequest,
        max_gas_price_wei: U256,
    ) -> Result<U256, EstimateErr> {
        let callback_gas_limit = req.req.callback_gas_limit();
        if req.req.native_payment() {
            return Ok(fees::estimate_fee_wei(callback_gas_limit, max_gas_price_wei)?);
        }
        let wei_per_unit_link = self.price_feed.wei_per_unit_link().await?;
        Ok(fees::estimate_fee_juels(callback_gas_limit, max_gas_price_wei, wei_per_unit_link)?)
    }

    /// Simulates a single request
    pub async fn simulate(&self, max_gas_price_wei: U256, req: PendingRequest) -> SimulationResult {
        let funds_needed = match self.estimate_fee(&req, max_gas_price_wei).await {
            Ok(fee) => fee,
            Err(err) => {
                tracing::warn!(
                    "Unable to estimate funds needed for request 0x{:x}, continuing anyway: {err}",
                    req.req.request_id()
                );
                U256::ZERO
            }
        };

        let outcome = self.run_pipeline(max_gas_price_wei, &req).await;
        SimulationResult { req, funds_needed, outcome }
    }

    async fn run_pipeline(
        &self,
        max_gas_price_wei: U256,
        req: &PendingRequest,
    ) -> Result<Simulated, SimulationError> {
        let job_run = JobRunVars::from_log(&req.req.log)
            .map_err(|err| SimulationError::Unclassified(err.to_string()))?;
        let mut job_spec = self.job.clone();
        job_spec.max_gas_price = max_gas_price_wei.to_string();

        let run = self
            .pipeline
            .execute(PipelineVars { job_spec, job_run })
            .await
            .map_err(|err| SimulationError::Unclassified(format!("executing run: {err}")))?;
        classify_run(self.version, &run)
    }

    /// Simulates a chunk concurrently. Results are in input order.
    pub async fn simulate_all(
        &self,
        max_gas_price_wei: U256,
        reqs: Vec<PendingRequest>,
    ) -> Vec<SimulationResult> {
        let start = Instant::now();
        let count = reqs.len();
        let results =
            join_all(reqs.into_iter().map(|req| self.simulate(max_gas_price_wei, req))).await;
        tracing::debug!("Finished running {count} pipelines in {:?}", start.elapsed());
        results
    }
}

#[derive(Error, Debug)]
enum EstimateErr {
    #[error("get aggregator latest answer: {0}")]
    Feed(#[from] CoordinatorErr),
    #[error("{0}")]
    Fee(#[from] FeeErr),
}
