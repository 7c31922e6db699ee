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

use ethers::{
	providers::{Http, Provider},
	types::{Address, TransactionReceipt, H256, U256},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utilities::make_periodic_tick;

use super::{classify_provider_error, user_op::UserOperation, AaError};
use crate::constants::{USER_OP_RECEIPT_POLL_INTERVAL, USER_OP_RECEIPT_TIMEOUT};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
	pub user_op_hash: H256,
	pub sender: Address,
	pub nonce: U256,
	pub success: bool,
	#[serde(default)]
	pub actual_gas_cost: Option<U256>,
	#[serde(default)]
	pub actual_gas_used: Option<U256>,
	pub receipt: TransactionReceipt,
}

#[derive(Clone)]
pub struct BundlerClient {
	provider: Arc<Provider<Http>>,
	entry_point: Address,
}

impl BundlerClient {
	pub fn new(provider: Arc<Provider<Http>>, entry_point: Address) -> Self {
		Self { provider, entry_point }
	}

	/// Submits the signed operation, returning the userOpHash the bundler accepted it
	/// under.
	pub async fn send_user_operation(&self, user_op: &UserOperation) -> Result<H256, AaError> {
		self.provider
			.request(
				"eth_sendUserOperation",
				(user_op.clone(), self.entry_point),
			)
			.await
			.map_err(classify_provider_error)
	}

	pub async fn user_operation_receipt(
		&self,
		user_op_hash: H256,
	) -> Result<Option<UserOperationReceipt>, AaError> {
		self.provider
			.request("eth_getUserOperationReceipt", [user_op_hash])
			.await
			.map_err(classify_provider_error)
	}

	/// Polls for the receipt until the operation is mined or the timeout elapses.
	pub async fn wait_for_user_operation_receipt(
		&self,
		user_op_hash: H256,
	) -> Result<UserOperationReceipt, AaError> {
		let mut poll_interval = make_periodic_tick(USER_OP_RECEIPT_POLL_INTERVAL, false);
		tokio::time::timeout(USER_OP_RECEIPT_TIMEOUT, async {
			loop {
				poll_interval.tick().await;
				if let Some(receipt) = self.user_operation_receipt(user_op_hash).await? {
					break Ok(receipt)
				}
			}
		})
		.await
		.map_err(|_| AaError::ReceiptTimeout(USER_OP_RECEIPT_TIMEOUT))?
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_operation_receipt_deserialises_from_bundler_shape() {
		let receipt: UserOperationReceipt = serde_json::from_value(serde_json::json!({
			"userOpHash": "0x4242424242424242424242424242424242424242424242424242424242424242",
			"entryPoint": "0x0000000071727De22E5E9d8baF0edAc6f37da032",
			"sender": "0x1111111111111111111111111111111111111111",
			"nonce": "0x7",
			"success": true,
			"actualGasCost": "0x5208",
			"actualGasUsed": "0x5208",
			"receipt": {
				"transactionHash": "0xdededededededededededededededededededededededededededededededede",
				"transactionIndex": "0x0",
				"blockHash": "0xabababababababababababababababababababababababababababababababab",
				"blockNumber": "0x10",
				"from": "0x1111111111111111111111111111111111111111",
				"to": "0x0000000071727De22E5E9d8baF0edAc6f37da032",
				"contractAddress": null,
				"cumulativeGasUsed": "0x5208",
				"gasUsed": "0x5208",
				"logs": [],
				"logsBloom": format!("0x{}", "00".repeat(256)),
				"status": "0x1",
				"effectiveGasPrice": "0x3b9aca00",
				"type": "0x2"
			}
		}))
		.unwrap();

		assert!(receipt.success);
		assert_eq!(receipt.sender, Address::repeat_byte(0x11));
		assert_eq!(receipt.nonce, U256::from(7u64));
		assert_eq!(receipt.receipt.block_number, Some(0x10u64.into()));
	}
}
