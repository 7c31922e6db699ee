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

use anyhow::Result;
use ethers::{
	prelude::*,
	providers::RpcError,
	types::transaction::eip2718::TypedTransaction,
};
use futures::Future;
use std::sync::Arc;
use utilities::{make_periodic_tick, SecretUrl};

use crate::{constants::RPC_RETRY_CONNECTION_INTERVAL, retrier::no_retry};

/// A node that answered with a JSON-RPC error rejected the request outright (bad
/// params, revert, nonce conflict); backing off and resubmitting the same request
/// cannot help, so these bypass the retrier.
fn classify(error: ProviderError) -> anyhow::Error {
	if RpcError::as_error_response(&error).is_some() {
		no_retry(anyhow::Error::new(error))
	} else {
		anyhow::Error::new(error)
	}
}

#[derive(Clone)]
pub struct EvmRpcClient {
	provider: Arc<Provider<Http>>,
	network_name: String,
}

impl EvmRpcClient {
	pub fn new(
		http_endpoint: SecretUrl,
		expected_chain_id: u64,
		network_name: String,
	) -> Result<impl Future<Output = Self>> {
		let provider = Arc::new(Provider::<Http>::try_from(http_endpoint.as_ref())?);

		let client = EvmRpcClient { provider, network_name: network_name.clone() };

		Ok(async move {
			// We don't want to return an error here. Returning an error would take the
			// whole engine down, so on client creation we wait until we can successfully
			// connect to this network's node. The other networks are unaffected.
			let mut poll_interval = make_periodic_tick(RPC_RETRY_CONNECTION_INTERVAL, true);
			loop {
				poll_interval.tick().await;
				match client.chain_id().await {
					Ok(chain_id) if chain_id == expected_chain_id.into() => break client,
					Ok(chain_id) => {
						tracing::error!(
							"Connected to {network_name} node but with incorrect chain_id {chain_id}, expected {expected_chain_id} from {http_endpoint}. \
							Please check your engine configuration...",
						);
					},
					Err(e) => tracing::error!(
						"Cannot connect to a {network_name} node at {http_endpoint} with error: {e}. \
							Please check your engine configuration. Retrying in {:?}...",
						poll_interval.period()
					),
				}
			}
		})
	}

	pub fn raw(&self) -> Arc<Provider<Http>> {
		self.provider.clone()
	}
}

#[async_trait::async_trait]
pub trait EvmRpcApi: Send + Sync + Clone + 'static {
	async fn block_number(&self) -> Result<U64>;

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>>;

	async fn chain_id(&self) -> Result<U256>;

	async fn get_code(&self, address: H160) -> Result<Bytes>;

	/// Transaction count at the pending block, i.e. the next usable nonce.
	async fn transaction_count(&self, address: H160) -> Result<U256>;

	async fn gas_price(&self) -> Result<U256>;

	async fn call(&self, to: H160, data: Bytes) -> Result<Bytes>;

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;
}

#[async_trait::async_trait]
impl EvmRpcApi for EvmRpcClient {
	async fn block_number(&self) -> Result<U64> {
		Ok(self.provider.get_block_number().await?)
	}

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>> {
		Ok(self.provider.get_logs(&filter).await?)
	}

	async fn chain_id(&self) -> Result<U256> {
		Ok(self.provider.get_chainid().await?)
	}

	async fn get_code(&self, address: H160) -> Result<Bytes> {
		Ok(self.provider.get_code(address, None).await?)
	}

	async fn transaction_count(&self, address: H160) -> Result<U256> {
		Ok(self
			.provider
			.get_transaction_count(address, Some(BlockNumber::Pending.into()))
			.await?)
	}

	async fn gas_price(&self) -> Result<U256> {
		Ok(self.provider.get_gas_price().await?)
	}

	async fn call(&self, to: H160, data: Bytes) -> Result<Bytes> {
		let tx = TypedTransaction::Legacy(TransactionRequest::new().to(to).data(data));
		self.provider.call(&tx, None).await.map_err(classify).map_err(|e| {
			e.context(format!("eth_call against {to:?} on {} failed", self.network_name))
		})
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
		Ok(self.provider.send_raw_transaction(raw).await.map_err(classify)?.tx_hash())
	}

	async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
		Ok(self.provider.get_transaction_receipt(tx_hash).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	#[ignore = "requires a local node"]
	async fn evm_rpc_test() {
		let client = EvmRpcClient::new(
			SecretUrl::from("http://localhost:8545"),
			31337,
			"localnet".to_string(),
		)
		.unwrap()
		.await;

		let chain_id = client.chain_id().await.unwrap();
		println!("{chain_id:?}");

		let block_number = client.block_number().await.unwrap();
		println!("{block_number:?}");
	}
}
