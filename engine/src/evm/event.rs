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

use anyhow::{anyhow, Result};
use ethers::{
	abi::RawLog,
	types::{Log, H256, U256},
};
use std::fmt::Debug;

/// Type for storing common (i.e. tx_hash) and specific event information
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Event<EventParameters: Debug> {
	/// The transaction hash of the transaction that emitted this event
	pub tx_hash: H256,
	/// The index number of this particular log, in the list of logs emitted by the tx_hash
	pub log_index: U256,
	/// The block this event was emitted in
	pub block_number: u64,
	/// The event specific parameters
	pub event_parameters: EventParameters,
}

impl<EventParameters: Debug> std::fmt::Display for Event<EventParameters> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "EventParameters: {:?}; tx_hash: {:#x}", self.event_parameters, self.tx_hash)
	}
}

impl<EventParameters: Debug + ethers::contract::EthLogDecode> Event<EventParameters> {
	pub fn new_from_unparsed_logs(log: Log) -> Result<Self> {
		Ok(Self {
			tx_hash: log
				.transaction_hash
				.ok_or_else(|| anyhow!("Could not get transaction hash from log"))?,
			log_index: log
				.log_index
				.ok_or_else(|| anyhow!("Could not get log index from log"))?,
			block_number: log
				.block_number
				.ok_or_else(|| anyhow!("Could not get block number from log"))?
				.as_u64(),
			event_parameters: EventParameters::decode_log(&RawLog {
				topics: log.topics.into_iter().collect(),
				data: log.data.to_vec(),
			})?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::evm::contracts::gateway::OrderSettledFilter;
	use ethers::{contract::EthEvent, types::Bytes};

	#[test]
	fn decodes_events_from_raw_logs() {
		let order_id = [3u8; 32];

		let log = Log {
			address: Default::default(),
			topics: vec![OrderSettledFilter::signature(), H256(order_id)],
			data: Bytes::from(ethers::abi::encode(&[ethers::abi::Token::Uint(100u64.into())])),
			block_hash: None,
			block_number: Some(1234u64.into()),
			transaction_hash: Some(H256::repeat_byte(0xde)),
			transaction_index: None,
			log_index: Some(U256::zero()),
			transaction_log_index: None,
			log_type: None,
			removed: None,
		};

		let event = Event::<OrderSettledFilter>::new_from_unparsed_logs(log).unwrap();
		assert_eq!(event.tx_hash, H256::repeat_byte(0xde));
		assert_eq!(event.block_number, 1234);
		assert_eq!(event.event_parameters.order_id, order_id);
		assert_eq!(event.event_parameters.settle_percent, 100);
	}

	#[test]
	fn rejects_logs_missing_context() {
		let log = Log {
			address: Default::default(),
			topics: vec![OrderSettledFilter::signature(), H256::zero()],
			data: Bytes::from(ethers::abi::encode(&[ethers::abi::Token::Uint(1u64.into())])),
			block_hash: None,
			block_number: None,
			transaction_hash: None,
			transaction_index: None,
			log_index: None,
			transaction_log_index: None,
			log_type: None,
			removed: None,
		};

		assert!(Event::<OrderSettledFilter>::new_from_unparsed_logs(log).is_err());
	}
}
