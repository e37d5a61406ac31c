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

//! Gas constants and worst case fee estimates for fulfillments.

use alloy::primitives::U256;
use thiserror::Error;

use crate::errors::{impl_coded_debug, CodedError};

/// Upper bound on the gas spent verifying a VRF proof on chain
pub const GAS_PROOF_VERIFICATION: u64 = 200_000;

/// Gas consumed by the batch coordinator per packed fulfillment
pub const BATCH_FULFILLMENT_ITERATION_GAS_COST: u64 = 52_000;

/// Fixed overhead on top of the coordinator max gas limit for batch transactions
pub const BATCH_GAS_OVERHEAD: u64 = 400_000;

/// 1e18, juels per LINK
const JUELS_PER_LINK: u128 = 1_000_000_000_000_000_000;

#[derive(Error)]
pub enum FeeErr {
    #[error("{code} wei per unit link is zero", code = self.code())]
    ZeroLinkPrice,

    #[error("{code} fee estimate overflowed", code = self.code())]
    Overflow,
}

impl_coded_debug!(FeeErr);

impl CodedError for FeeErr {
    fn code(&self) -> &str {
        match self {
            FeeErr::ZeroLinkPrice => "[V-FEE-001]",
            FeeErr::Overflow => "[V-FEE-002]",
        }
    }
}

/// Worst case native cost of fulfilling a request with `callback_gas_limit` at `max_gas_price_wei`
pub fn estimate_fee_wei(callback_gas_limit: u32, max_gas_price_wei: U256) -> Result<U256, FeeErr> {
    let max_gas_used = U256::from(u64::from(callback_gas_limit) + GAS_PROOF_VERIFICATION);
    max_gas_used.checked_mul(max_gas_price_wei).ok_or(FeeErr::Overflow)
}

/// Worst case LINK (juels) cost of fulfilling a request, converted with the LINK/native feed
pub fn estimate_fee_juels(
    callback_gas_limit: u32,
    max_gas_price_wei: U256,
    wei_per_unit_link: U256,
) -> Result<U256, FeeErr> {
    if wei_per_unit_link.is_zero() {
        return Err(FeeErr::ZeroLinkPrice);
    }
    let cost_wei = estimate_fee_wei(callback_gas_limit, max_gas_price_wei)?;
    // Scale before dividing to keep precision
    let numerator = cost_wei.checked_mul(U256::from(JUELS_PER_LINK)).ok_or(FeeErr::Overflow)?;
    Ok(numerator / wei_per_unit_link)
}

/// Gas ceiling for a single batch transaction
pub fn batch_gas_ceiling(coordinator_max_gas_limit: u64) -> u64 {
    coordinator_max_gas_limit.saturating_add(BATCH_GAS_OVERHEAD)
}

/// Fee limit of a batch transaction of `batch_size` fulfillments
pub fn batch_fee_limit(multiplier: f64, max_callback_gas_limit: u64, batch_size: usize) -> u64 {
    let gas = max_callback_gas_limit
        .saturating_add(BATCH_GAS_OVERHEAD)
        .saturating_add((batch_size as u64).saturating_mul(BATCH_FULFILLMENT_ITERATION_GAS_COST));
    (multiplier * gas as f64) as u64
}
