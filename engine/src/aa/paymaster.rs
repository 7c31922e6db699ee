// Copyright 2025 Chainflip Labs GmbH
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
//
// SPDX-License-Identifier: Apache-2.0

//! Gas sponsorship through `alchemy_requestGasAndPaymasterAndData`. The sponsor
//! simulates the operation and returns refined gas values together with the
//! paymaster fields; a missing or malformed input field surfaces as an AA23.

use ethers::{
	providers::{Http, Provider},
	types::{Address, Bytes, U256},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{classify_provider_error, AaError};

/// The user-operation subset the sponsor requires. Every field here is mandatory on
/// the wire: sender, nonce, initCode and callData identify the operation, and the
/// initial gas estimates seed the simulation. Omitting the gas fields produces AA23.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorUserOperation {
	pub sender: Address,
	pub nonce: U256,
	pub init_code: Bytes,
	pub call_data: Bytes,
	pub call_gas_limit: U256,
	pub verification_gas_limit: U256,
	pub pre_verification_gas: U256,
	pub max_fee_per_gas: U256,
	pub max_priority_fee_per_gas: U256,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GasAndPaymasterRequest<'a> {
	policy_id: &'a str,
	entry_point: Address,
	dummy_signature: Bytes,
	user_operation: &'a SponsorUserOperation,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GasAndPaymasterData {
	pub paymaster: Address,
	pub paymaster_data: Bytes,
	pub paymaster_verification_gas_limit: U256,
	pub paymaster_post_op_gas_limit: U256,
	pub call_gas_limit: U256,
	pub verification_gas_limit: U256,
	pub pre_verification_gas: U256,
	pub max_fee_per_gas: U256,
	pub max_priority_fee_per_gas: U256,
}

#[derive(Clone)]
pub struct PaymasterClient {
	provider: Arc<Provider<Http>>,
	policy_id: String,
	entry_point: Address,
}

impl PaymasterClient {
	pub fn new(provider: Arc<Provider<Http>>, policy_id: String, entry_point: Address) -> Self {
		Self { provider, policy_id, entry_point }
	}

	pub async fn request_gas_and_paymaster_data(
		&self,
		user_operation: &SponsorUserOperation,
		dummy_signature: Bytes,
	) -> Result<GasAndPaymasterData, AaError> {
		self.provider
			.request(
				"alchemy_requestGasAndPaymasterAndData",
				[GasAndPaymasterRequest {
					policy_id: &self.policy_id,
					entry_point: self.entry_point,
					dummy_signature,
					user_operation,
				}],
			)
			.await
			.map_err(classify_provider_error)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn sponsor_request_carries_every_required_field() {
		let op = SponsorUserOperation {
			sender: Address::repeat_byte(0x01),
			nonce: U256::zero(),
			init_code: Bytes::default(),
			call_data: Bytes::from_str("0xdeadbeef").unwrap(),
			call_gas_limit: U256::from(300_000u64),
			verification_gas_limit: U256::from(500_000u64),
			pre_verification_gas: U256::from(100_000u64),
			max_fee_per_gas: U256::from(2_000_000_000u64),
			max_priority_fee_per_gas: U256::from(1_000_000_000u64),
		};

		let request = GasAndPaymasterRequest {
			policy_id: "policy-123",
			entry_point: Address::from_str("0x0000000071727De22E5E9d8baF0edAc6f37da032")
				.unwrap(),
			dummy_signature: super::super::user_op::dummy_signature(),
			user_operation: &op,
		};

		let json = serde_json::to_value(&request).unwrap();
		assert_eq!(json["policyId"], "policy-123");
		let op_json = &json["userOperation"];
		// A prior engine version dropped the gas estimates from this payload, which the
		// sponsor rejects with AA23. They are part of the wire contract.
		for field in [
			"sender",
			"nonce",
			"initCode",
			"callData",
			"callGasLimit",
			"verificationGasLimit",
			"preVerificationGas",
			"maxFeePerGas",
			"maxPriorityFeePerGas",
		] {
			assert!(op_json.get(field).is_some(), "missing required sponsor field {field}");
		}
	}

	#[test]
	fn gas_and_paymaster_response_deserialises() {
		let response: GasAndPaymasterData = serde_json::from_value(serde_json::json!({
			"paymaster": "0x1111111111111111111111111111111111111111",
			"paymasterData": "0xaabb",
			"paymasterVerificationGasLimit": "0x5208",
			"paymasterPostOpGasLimit": "0x2710",
			"callGasLimit": "0x30d40",
			"verificationGasLimit": "0x7a120",
			"preVerificationGas": "0x186a0",
			"maxFeePerGas": "0x77359400",
			"maxPriorityFeePerGas": "0x3b9aca00"
		}))
		.unwrap();

		assert_eq!(response.paymaster, Address::repeat_byte(0x11));
		assert_eq!(response.call_gas_limit, U256::from(200_000u64));
	}
}
