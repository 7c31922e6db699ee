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

use ethers::prelude::*;
use futures::Future;
use utilities::task_scope::Scope;

use crate::{
	constants::{MAX_CONCURRENT_SUBMISSIONS, RPC_TIMEOUT},
	retrier::{RequestLog, RetrierClient},
};
use anyhow::Result;

use super::rpc::{EvmRpcApi, EvmRpcClient};

/// Broadcasts are not blindly retried: a second submission of the same raw transaction
/// is at best a nonce error.
const MAX_BROADCAST_ATTEMPTS: u32 = 2;

#[derive(Clone)]
pub struct EvmRetryRpcClient<Rpc: EvmRpcApi> {
	rpc_retry_client: RetrierClient<Rpc>,
}

impl<Rpc: EvmRpcApi> EvmRetryRpcClient<Rpc> {
	pub fn from_inner_client<ClientFut: Future<Output = Rpc> + Send + 'static>(
		scope: &Scope<'_, anyhow::Error>,
		rpc_client: ClientFut,
		rpc_client_name: &'static str,
	) -> Self {
		Self {
			rpc_retry_client: RetrierClient::new(
				scope,
				rpc_client_name,
				rpc_client,
				RPC_TIMEOUT,
				MAX_CONCURRENT_SUBMISSIONS,
			),
		}
	}
}

impl EvmRetryRpcClient<EvmRpcClient> {
	pub fn new(
		scope: &Scope<'_, anyhow::Error>,
		http_endpoint: utilities::SecretUrl,
		expected_chain_id: u64,
		network_name: String,
	) -> Result<Self> {
		let rpc_client = EvmRpcClient::new(http_endpoint, expected_chain_id, network_name)?;
		Ok(Self::from_inner_client(scope, rpc_client, "evm_rpc"))
	}
}

#[async_trait::async_trait]
pub trait EvmRetryRpcApi: Clone + Send + Sync + 'static {
	async fn block_number(&self) -> Result<u64>;

	async fn get_logs_range(
		&self,
		range: std::ops::RangeInclusive<u64>,
		contract_address: H160,
	) -> Result<Vec<Log>>;

	async fn chain_id(&self) -> Result<U256>;

	async fn get_code(&self, address: H160) -> Result<Bytes>;

	async fn transaction_count(&self, address: H160) -> Result<U256>;

	async fn gas_price(&self) -> Result<U256>;

	async fn eth_call(&self, to: H160, data: Bytes) -> Result<Bytes>;

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;
}

#[async_trait::async_trait]
impl<Rpc: EvmRpcApi> EvmRetryRpcApi for EvmRetryRpcClient<Rpc> {
	async fn block_number(&self) -> Result<u64> {
		self.rpc_retry_client
			.request(
				RequestLog::new("block_number".to_string(), None),
				Box::pin(move |client| {
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { Ok(client.block_number().await?.as_u64()) })
				}),
			)
			.await
	}

	async fn get_logs_range(
		&self,
		range: std::ops::RangeInclusive<u64>,
		contract_address: H160,
	) -> Result<Vec<Log>> {
		assert!(!range.is_empty());
		self.rpc_retry_client
			.request(
				RequestLog::new(
					"get_logs_range".to_string(),
					Some(format!("{range:?}, {contract_address:?}")),
				),
				Box::pin(move |client| {
					let range = range.clone();
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move {
						client
							.get_logs(
								// The `from_block` and `to_block` are inclusive
								Filter::new()
									.address(contract_address)
									.from_block(*range.start())
									.to_block(*range.end()),
							)
							.await
					})
				}),
			)
			.await
	}

	async fn chain_id(&self) -> Result<U256> {
		self.rpc_retry_client
			.request(
				RequestLog::new("chain_id".to_string(), None),
				Box::pin(move |client| {
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { client.chain_id().await })
				}),
			)
			.await
	}

	async fn get_code(&self, address: H160) -> Result<Bytes> {
		self.rpc_retry_client
			.request(
				RequestLog::new("get_code".to_string(), Some(format!("{address:?}"))),
				Box::pin(move |client| {
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { client.get_code(address).await })
				}),
			)
			.await
	}

	async fn transaction_count(&self, address: H160) -> Result<U256> {
		self.rpc_retry_client
			.request(
				RequestLog::new("transaction_count".to_string(), Some(format!("{address:?}"))),
				Box::pin(move |client| {
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { client.transaction_count(address).await })
				}),
			)
			.await
	}

	async fn gas_price(&self) -> Result<U256> {
		self.rpc_retry_client
			.request(
				RequestLog::new("gas_price".to_string(), None),
				Box::pin(move |client| {
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { client.gas_price().await })
				}),
			)
			.await
	}

	async fn eth_call(&self, to: H160, data: Bytes) -> Result<Bytes> {
		self.rpc_retry_client
			.request(
				RequestLog::new("eth_call".to_string(), Some(format!("{to:?}"))),
				Box::pin(move |client| {
					let data = data.clone();
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { client.call(to, data).await })
				}),
			)
			.await
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
		self.rpc_retry_client
			.request_with_limit(
				RequestLog::new("send_raw_transaction".to_string(), None),
				Box::pin(move |client| {
					let raw = raw.clone();
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { client.send_raw_transaction(raw).await })
				}),
				MAX_BROADCAST_ATTEMPTS,
			)
			.await
	}

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
		self.rpc_retry_client
			.request(
				RequestLog::new("transaction_receipt".to_string(), Some(format!("{tx_hash:?}"))),
				Box::pin(move |client| {
					#[allow(clippy::redundant_async_block)]
					Box::pin(async move { client.transaction_receipt(tx_hash).await })
				}),
			)
			.await
	}
}

#[cfg(test)]
pub mod mocks {
	use super::*;
	use mockall::mock;

	mock! {
		pub EvmRetryRpcClient {}

		impl Clone for EvmRetryRpcClient {
			fn clone(&self) -> Self;
		}

		#[async_trait::async_trait]
		impl EvmRetryRpcApi for EvmRetryRpcClient {
			async fn block_number(&self) -> Result<u64>;

			async fn get_logs_range(
				&self,
				range: std::ops::RangeInclusive<u64>,
				contract_address: H160,
			) -> Result<Vec<Log>>;

			async fn chain_id(&self) -> Result<U256>;

			async fn get_code(&self, address: H160) -> Result<Bytes>;

			async fn transaction_count(&self, address: H160) -> Result<U256>;

			async fn gas_price(&self) -> Result<U256>;

			async fn eth_call(&self, to: H160, data: Bytes) -> Result<Bytes>;

			async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;

			async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::FutureExt;
	use utilities::task_scope::task_scope;

	#[tokio::test]
	#[ignore = "requires a local node"]
	async fn test_evm_retry_rpc() {
		task_scope(|scope| {
			async move {
				let retry_client = EvmRetryRpcClient::<EvmRpcClient>::new(
					scope,
					utilities::SecretUrl::from("http://localhost:8545"),
					31337,
					"localnet".to_string(),
				)
				.unwrap();

				let chain_id = retry_client.chain_id().await.unwrap();
				println!("chain_id: {chain_id}");

				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}
}
