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

//! Contract bindings for the coordinators and their satellite contracts.

use alloy::{
    primitives::{keccak256, B256, U256},
    sol,
    sol_types::SolValue,
};

pub mod v2 {
    use alloy::sol;

    sol! {
        #![sol(rpc, all_derives)]

        struct Proof {
            uint256[2] pk;
            uint256[2] gamma;
            uint256 c;
            uint256 s;
            uint256 seed;
            address uWitness;
            uint256[2] cGammaWitness;
            uint256[2] sHashWitness;
            uint256 zInv;
        }

        struct RequestCommitment {
            uint64 blockNum;
            uint64 subId;
            uint32 callbackGasLimit;
            uint32 numWords;
            address sender;
        }

        interface IVRFCoordinatorV2 {
            event RandomWordsRequested(
                bytes32 indexed keyHash,
                uint256 requestId,
                uint256 preSeed,
                uint64 indexed subId,
                uint16 minimumRequestConfirmations,
                uint32 callbackGasLimit,
                uint32 numWords,
                address indexed sender
            );

            event RandomWordsFulfilled(
                uint256 indexed requestId,
                uint256 outputSeed,
                uint96 payment,
                bool success
            );

            error InsufficientBalance();

            function getSubscription(uint64 subId)
                external
                view
                returns (uint96 balance, uint64 reqCount, address owner, address[] memory consumers);

            function getConfig()
                external
                view
                returns (
                    uint16 minimumRequestConfirmations,
                    uint32 maxGasLimit,
                    uint32 stalenessSeconds,
                    uint32 gasAfterPaymentCalculation
                );

            function getCommitment(uint256 requestId) external view returns (bytes32);

            function fulfillRandomWords(Proof memory proof, RequestCommitment memory rc)
                external
                returns (uint96);
        }

        interface IBatchVRFCoordinatorV2 {
            event ErrorReturned(uint256 indexed requestId, string reason);
            event RawErrorReturned(uint256 indexed requestId, bytes lowLevelData);

            function fulfillRandomWords(Proof[] memory proofs, RequestCommitment[] memory rcs)
                external;
        }

        interface IVRFOwner {
            function fulfillRandomWords(Proof memory proof, RequestCommitment memory rc)
                external;
        }
    }
}

pub mod v2plus {
    use alloy::sol;

    sol! {
        #![sol(rpc, all_derives)]

        struct Proof {
            uint256[2] pk;
            uint256[2] gamma;
            uint256 c;
            uint256 s;
            uint256 seed;
            address uWitness;
            uint256[2] cGammaWitness;
            uint256[2] sHashWitness;
            uint256 zInv;
        }

        struct RequestCommitment {
            uint64 blockNum;
            uint256 subId;
            uint32 callbackGasLimit;
            uint32 numWords;
            address sender;
            bytes extraArgs;
        }

        interface IVRFCoordinatorV2Plus {
            event RandomWordsRequested(
                bytes32 indexed keyHash,
                uint256 requestId,
                uint256 preSeed,
                uint256 indexed subId,
                uint16 minimumRequestConfirmations,
                uint32 callbackGasLimit,
                uint32 numWords,
                bytes extraArgs,
                address indexed sender
            );

            event RandomWordsFulfilled(
                uint256 indexed requestId,
                uint256 outputSeed,
                uint256 indexed subId,
                uint96 payment,
                bool nativePayment,
                bool success,
                bool onlyPremium
            );

            function getSubscription(uint256 subId)
                external
                view
                returns (
                    uint96 balance,
                    uint96 nativeBalance,
                    uint64 reqCount,
                    address owner,
                    address[] memory consumers
                );

            function s_config()
                external
                view
                returns (
                    uint16 minimumRequestConfirmations,
                    uint32 maxGasLimit,
                    bool reentrancyLock,
                    uint32 stalenessSeconds,
                    uint32 gasAfterPaymentCalculation,
                    uint32 fulfillmentFlatFeeNativePPM,
                    uint32 fulfillmentFlatFeeLinkDiscountPPM,
                    uint8 nativePremiumPercentage,
                    uint8 linkPremiumPercentage
                );

            function s_requestCommitments(uint256 requestId) external view returns (bytes32);

            function fulfillRandomWords(
                Proof memory proof,
                RequestCommitment memory rc,
                bool onlyPremium
            ) external returns (uint96 payment);
        }

        interface IBatchVRFCoordinatorV2Plus {
            function fulfillRandomWords(Proof[] memory proofs, RequestCommitment[] memory rcs)
                external;
        }
    }
}

sol! {
    #![sol(rpc, all_derives)]

    interface AggregatorV3Interface {
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
    }
}

/// Tag prefixing V2Plus `extraArgs` (`bytes4(keccak256("VRF ExtraArgsV1"))`)
pub const EXTRA_ARGS_V1_TAG: [u8; 4] = [0x92, 0xfd, 0x13, 0x38];

/// Selector of the coordinator's `InsufficientBalance()` custom error
pub const INSUFFICIENT_BALANCE_SELECTOR: [u8; 4] = [0xf4, 0xd6, 0x78, 0xb8];

/// Decodes the native payment flag from V2Plus `extraArgs`.
///
/// Empty or untagged args default to LINK payment, matching the coordinator.
pub fn native_payment_from_extra_args(extra_args: &[u8]) -> bool {
    if extra_args.len() < 4 + 32 || extra_args[..4] != EXTRA_ARGS_V1_TAG {
        return false;
    }
    <bool>::abi_decode(&extra_args[4..4 + 32]).unwrap_or(false)
}

/// Key hash of an uncompressed VRF public key, as computed by the coordinator.
pub fn key_hash_of(pk: &[U256; 2]) -> B256 {
    keccak256(pk.abi_encode())
}

/// Request ID derived from a proof seed and the key hash that served it.
pub fn request_id_from_seed(key_hash: B256, seed: U256) -> U256 {
    U256::from_be_bytes(keccak256((key_hash, seed).abi_encode()).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::{SolCall, SolError};

    #[test]
    fn insufficient_balance_selector() {
        assert_eq!(
            v2::IVRFCoordinatorV2::InsufficientBalance::SELECTOR,
            INSUFFICIENT_BALANCE_SELECTOR
        );
    }

    #[test]
    fn extra_args_native_flag() {
        let mut args = EXTRA_ARGS_V1_TAG.to_vec();
        args.extend_from_slice(&true.abi_encode());
        assert!(native_payment_from_extra_args(&args));

        let mut args = EXTRA_ARGS_V1_TAG.to_vec();
        args.extend_from_slice(&false.abi_encode());
        assert!(!native_payment_from_extra_args(&args));

        assert!(!native_payment_from_extra_args(&[]));
        assert!(!native_payment_from_extra_args(&[0u8; 36]));
    }

    #[test]
    fn owner_and_coordinator_calldata_share_layout() {
        let proof = v2::Proof { seed: U256::from(7), ..Default::default() };
        let rc = v2::RequestCommitment { subId: 3, ..Default::default() };
        let owner = v2::IVRFOwner::fulfillRandomWordsCall { proof: proof.clone(), rc: rc.clone() }
            .abi_encode();
        let coordinator =
            v2::IVRFCoordinatorV2::fulfillRandomWordsCall { proof, rc }.abi_encode();
        assert_eq!(owner, coordinator);
    }

    #[test]
    fn request_id_derivation() {
        let key_hash = key_hash_of(&[U256::from(1), U256::from(2)]);
        let a = request_id_from_seed(key_hash, U256::from(10));
        let b = request_id_from_seed(key_hash, U256::from(11));
        assert_ne!(a, b);
        assert_eq!(a, request_id_from_seed(key_hash, U256::from(10)));
    }
}
