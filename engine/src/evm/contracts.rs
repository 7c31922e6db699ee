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

//! ABI bindings for the contracts the engine talks to. The Gateway escrow is a fixed
//! external collaborator; only the subset of its surface the engine drives is bound.

use ethers::prelude::abigen;

abigen!(
	Gateway,
	r#"[
		function createOrder(address token, uint256 amount, uint96 rate, address senderFeeRecipient, uint256 senderFee, address refundAddress, string messageHash) returns (bytes32 orderId)
		function settle(bytes32 orderId, address provider, uint96 settlePercent)
		function refund(uint256 fee, bytes32 orderId)
		event OrderCreated(bytes32 indexed orderId, address indexed token, uint256 amount, uint96 rate, string messageHash)
		event OrderSettled(bytes32 indexed orderId, uint96 settlePercent)
		event OrderRefunded(bytes32 indexed orderId, uint256 fee)
	]"#
);

abigen!(
	Erc20,
	r#"[
		function balanceOf(address owner) view returns (uint256)
		function approve(address spender, uint256 amount) returns (bool)
		function transfer(address to, uint256 amount) returns (bool)
		event Transfer(address indexed from, address indexed to, uint256 value)
	]"#
);

abigen!(
	LightAccountFactory,
	r#"[
		function createAccount(address owner, uint256 salt) returns (address account)
		function getAddress(address owner, uint256 salt) view returns (address account)
	]"#
);

abigen!(
	EntryPoint,
	r#"[
		function getNonce(address sender, uint192 key) view returns (uint256 nonce)
	]"#
);

#[cfg(test)]
mod tests {
	use super::*;
	use ethers::{
		abi::AbiEncode,
		contract::{EthCall, EthEvent},
		types::{H256, U256},
		utils::keccak256,
	};
	use std::str::FromStr;

	#[test]
	fn factory_selectors_match_the_deployed_factory() {
		assert_eq!(
			light_account_factory::CreateAccountCall::selector(),
			[0x5f, 0xbf, 0xb9, 0xcf]
		);
		assert_eq!(light_account_factory::GetAddressCall::selector(), [0x8c, 0xb8, 0x4e, 0x18]);
	}

	#[test]
	fn erc20_selectors_and_topics() {
		assert_eq!(erc_20::BalanceOfCall::selector(), [0x70, 0xa0, 0x82, 0x31]);
		assert_eq!(
			erc_20::TransferFilter::signature(),
			H256::from_str("0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
				.unwrap()
		);
	}

	#[test]
	fn gateway_event_topics_derive_from_their_signatures() {
		assert_eq!(
			gateway::OrderCreatedFilter::signature(),
			H256(keccak256("OrderCreated(bytes32,address,uint256,uint96,string)"))
		);
		assert_eq!(
			gateway::OrderSettledFilter::signature(),
			H256(keccak256("OrderSettled(bytes32,uint96)"))
		);
		assert_eq!(
			gateway::OrderRefundedFilter::signature(),
			H256(keccak256("OrderRefunded(bytes32,uint256)"))
		);
	}

	#[test]
	fn create_order_calldata_starts_with_its_selector() {
		let call = gateway::CreateOrderCall {
			token: Default::default(),
			amount: U256::from(1u64),
			rate: 148_230,
			sender_fee_recipient: Default::default(),
			sender_fee: U256::zero(),
			refund_address: Default::default(),
			message_hash: "deadbeef".to_string(),
		};

		let calldata = call.encode();
		assert_eq!(&calldata[..4], gateway::CreateOrderCall::selector().as_slice());
	}
}
