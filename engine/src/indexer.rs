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

//! Gateway event indexer. Per network, scans logs in bounded block windows resuming
//! from the persisted `last_indexed_block`; re-entering a window after a crash only
//! re-applies idempotent state changes.

use anyhow::Result;
use ethers::{
	contract::{EthEvent, EthLogDecode},
	types::Log,
};
use std::fmt::Debug;

use crate::{
	constants::INDEXER_BLOCK_WINDOW,
	evm::{
		contracts::gateway::{OrderCreatedFilter, OrderRefundedFilter, OrderSettledFilter},
		event::Event,
		parse_address,
		retry_rpc::EvmRetryRpcApi,
	},
	orders::{NetworkRuntime, OrderEngine},
	store::{networks, Store},
};

#[derive(Clone)]
pub struct Indexer<Rpc: EvmRetryRpcApi> {
	store: Store,
	engine: OrderEngine<Rpc>,
}

fn decode_matching<Params: EthEvent + EthLogDecode + Debug>(logs: &[Log]) -> Vec<Event<Params>> {
	logs.iter()
		.filter(|log| log.topics.first() == Some(&Params::signature()))
		.filter_map(|log| match Event::<Params>::new_from_unparsed_logs(log.clone()) {
			Ok(event) => Some(event),
			Err(error) => {
				tracing::error!("Undecodable {} log: {error:#}", Params::name());
				None
			},
		})
		.collect()
}

impl<Rpc: EvmRetryRpcApi> Indexer<Rpc> {
	pub fn new(store: Store, engine: OrderEngine<Rpc>) -> Self {
		Self { store, engine }
	}

	/// One indexing step for one network: scan the next block window of Gateway logs
	/// and hand the decoded events to the engine.
	pub async fn tick(&self, runtime: &NetworkRuntime<Rpc>) -> Result<()> {
		// Progress lives in the DB, not in the runtime snapshot.
		let network = {
			let mut db = self.store.acquire().await?;
			networks::single(&mut db, runtime.network.id)
				.await?
				.ok_or_else(|| anyhow::anyhow!("Network {} vanished", runtime.network.id))?
		};

		let head = runtime.rpc.block_number().await?;
		let last_indexed = if network.last_indexed_block <= 0 {
			head.saturating_sub(1)
		} else {
			network.last_indexed_block as u64
		};

		let from_block = last_indexed + 1;
		let to_block = std::cmp::min(head, last_indexed + INDEXER_BLOCK_WINDOW);
		if from_block > to_block {
			return Ok(())
		}

		let gateway_address = parse_address(&network.gateway_contract_address)?;
		let logs = runtime.rpc.get_logs_range(from_block..=to_block, gateway_address).await?;

		let created = decode_matching::<OrderCreatedFilter>(&logs);
		let settled = decode_matching::<OrderSettledFilter>(&logs);
		let refunded = decode_matching::<OrderRefundedFilter>(&logs);

		if !created.is_empty() || !settled.is_empty() || !refunded.is_empty() {
			tracing::info!(
				"Indexed blocks {from_block}..={to_block} on {}: {} created, {} settled, {} refunded",
				network.identifier,
				created.len(),
				settled.len(),
				refunded.len()
			);
		}

		self.engine.process_created_orders(&network, created).await?;
		self.engine.process_settled_orders(&network, settled).await?;
		self.engine.process_refunded_orders(&network, refunded).await?;

		let mut db = self.store.acquire().await?;
		networks::update_last_indexed_block(&mut db, network.id, to_block as i64).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ethers::{
		abi::Token,
		types::{Bytes, H256, U256},
	};

	fn gateway_log(topic0: H256, order_id: [u8; 32], data: Vec<Token>) -> Log {
		Log {
			address: Default::default(),
			topics: vec![topic0, H256(order_id)],
			data: Bytes::from(ethers::abi::encode(&data)),
			block_hash: None,
			block_number: Some(77u64.into()),
			transaction_hash: Some(H256::repeat_byte(0x77)),
			transaction_index: None,
			log_index: Some(U256::zero()),
			transaction_log_index: None,
			log_type: None,
			removed: None,
		}
	}

	#[test]
	fn decode_matching_partitions_by_topic() {
		let logs = vec![
			gateway_log(
				OrderSettledFilter::signature(),
				[1u8; 32],
				vec![Token::Uint(100u64.into())],
			),
			gateway_log(
				OrderRefundedFilter::signature(),
				[2u8; 32],
				vec![Token::Uint(5u64.into())],
			),
		];

		let settled = decode_matching::<OrderSettledFilter>(&logs);
		let refunded = decode_matching::<OrderRefundedFilter>(&logs);
		let created = decode_matching::<OrderCreatedFilter>(&logs);

		assert_eq!(settled.len(), 1);
		assert_eq!(settled[0].event_parameters.order_id, [1u8; 32]);
		assert_eq!(refunded.len(), 1);
		assert_eq!(refunded[0].event_parameters.fee, U256::from(5u64));
		assert!(created.is_empty());
	}

	#[test]
	fn undecodable_logs_are_dropped_not_fatal() {
		let mut log = gateway_log(
			OrderSettledFilter::signature(),
			[1u8; 32],
			vec![Token::Uint(100u64.into())],
		);
		log.data = Bytes::from(vec![0x01]); // truncated payload

		assert!(decode_matching::<OrderSettledFilter>(&[log]).is_empty());
	}
}
