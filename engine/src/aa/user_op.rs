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

//! ERC-4337 v0.7 user operations: the unpacked wire form sent to bundlers, the packed
//! encoding the EntryPoint hashes, and signing for Light Account v2 (signature type
//! byte 0x00 = EOA owner signature).

use anyhow::Result;
use ethers::{
	abi::{self, Token},
	signers::{LocalWallet, Signer},
	types::{Address, Bytes, H256, U256},
	utils::keccak256,
};
use serde::{Deserialize, Serialize};

/// The v0.7 wire format. All numeric fields are 0x-prefixed hex in JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
	pub sender: Address,
	pub nonce: U256,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub factory: Option<Address>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub factory_data: Option<Bytes>,
	pub call_data: Bytes,
	pub call_gas_limit: U256,
	pub verification_gas_limit: U256,
	pub pre_verification_gas: U256,
	pub max_fee_per_gas: U256,
	pub max_priority_fee_per_gas: U256,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub paymaster: Option<Address>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub paymaster_verification_gas_limit: Option<U256>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub paymaster_post_op_gas_limit: Option<U256>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub paymaster_data: Option<Bytes>,
	pub signature: Bytes,
}

/// Packs two 128-bit gas values into the single 32-byte slot the EntryPoint uses:
/// `hi(16 bytes) ‖ lo(16 bytes)`.
fn pack_pair(hi: U256, lo: U256) -> [u8; 32] {
	let mut out = [0u8; 32];
	let mut buf = [0u8; 32];
	hi.to_big_endian(&mut buf);
	out[..16].copy_from_slice(&buf[16..]);
	lo.to_big_endian(&mut buf);
	out[16..].copy_from_slice(&buf[16..]);
	out
}

/// `accountGasLimits = verificationGasLimit(16B) ‖ callGasLimit(16B)`.
pub fn pack_account_gas_limits(verification_gas_limit: U256, call_gas_limit: U256) -> [u8; 32] {
	pack_pair(verification_gas_limit, call_gas_limit)
}

/// `gasFees = maxPriorityFeePerGas(16B) ‖ maxFeePerGas(16B)`.
pub fn pack_gas_fees(max_priority_fee_per_gas: U256, max_fee_per_gas: U256) -> [u8; 32] {
	pack_pair(max_priority_fee_per_gas, max_fee_per_gas)
}

impl UserOperation {
	/// `factory ‖ factoryData`, empty for an already-deployed sender.
	pub fn init_code(&self) -> Bytes {
		match (&self.factory, &self.factory_data) {
			(Some(factory), Some(factory_data)) => {
				let mut out = factory.as_bytes().to_vec();
				out.extend_from_slice(factory_data);
				Bytes::from(out)
			},
			_ => Bytes::default(),
		}
	}

	/// `paymaster(20B) ‖ paymasterVerificationGasLimit(16B) ‖ paymasterPostOpGasLimit(16B)
	/// ‖ paymasterData`, empty when unsponsored.
	pub fn paymaster_and_data(&self) -> Bytes {
		match self.paymaster {
			Some(paymaster) => {
				let mut out = paymaster.as_bytes().to_vec();
				out.extend_from_slice(&pack_pair(
					self.paymaster_verification_gas_limit.unwrap_or_default(),
					self.paymaster_post_op_gas_limit.unwrap_or_default(),
				));
				if let Some(paymaster_data) = &self.paymaster_data {
					out.extend_from_slice(paymaster_data);
				}
				Bytes::from(out)
			},
			None => Bytes::default(),
		}
	}

	/// The v0.7 userOpHash that is signed: the hash of the packed op, bound to the
	/// EntryPoint and chain.
	pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
		let packed = abi::encode(&[
			Token::Address(self.sender),
			Token::Uint(self.nonce),
			Token::FixedBytes(keccak256(self.init_code()).to_vec()),
			Token::FixedBytes(keccak256(&self.call_data).to_vec()),
			Token::FixedBytes(
				pack_account_gas_limits(self.verification_gas_limit, self.call_gas_limit).to_vec(),
			),
			Token::Uint(self.pre_verification_gas),
			Token::FixedBytes(
				pack_gas_fees(self.max_priority_fee_per_gas, self.max_fee_per_gas).to_vec(),
			),
			Token::FixedBytes(keccak256(self.paymaster_and_data()).to_vec()),
		]);

		H256(keccak256(abi::encode(&[
			Token::FixedBytes(keccak256(packed).to_vec()),
			Token::Address(entry_point),
			Token::Uint(U256::from(chain_id)),
		])))
	}
}

/// Placeholder handed to the paymaster for gas simulation: the signature type byte
/// followed by a 65-byte ECDSA-shaped filler.
pub fn dummy_signature() -> Bytes {
	let mut sig = vec![0x00u8];
	sig.extend_from_slice(&[0xff; 65]);
	Bytes::from(sig)
}

fn normalise_v(v: u64) -> u8 {
	match v {
		0 | 1 => (v + 27) as u8,
		27 | 28 => v as u8,
		// EIP-155 style recovery ids fold back to the raw parity.
		v => (((v - 35) % 2) + 27) as u8,
	}
}

/// Signs the final userOpHash with the account owner's key and prepends the EOA
/// signature type byte expected by Light Account v2.
pub fn sign_user_op_hash(hash: H256, owner: &LocalWallet) -> Result<Bytes> {
	let signature = owner.sign_hash(hash)?;

	let mut out = Vec::with_capacity(66);
	out.push(0x00);
	let mut word = [0u8; 32];
	signature.r.to_big_endian(&mut word);
	out.extend_from_slice(&word);
	signature.s.to_big_endian(&mut word);
	out.extend_from_slice(&word);
	out.push(normalise_v(signature.v));
	Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	fn test_op() -> UserOperation {
		UserOperation {
			sender: Address::from_str("0x541f563237a309b3a61e33bdf07a8930bdba8d99").unwrap(),
			nonce: U256::from(7u64),
			factory: None,
			factory_data: None,
			call_data: Bytes::from_str("0xdeadbeef").unwrap(),
			call_gas_limit: U256::from(300_000u64),
			verification_gas_limit: U256::from(500_000u64),
			pre_verification_gas: U256::from(100_000u64),
			max_fee_per_gas: U256::from(2_000_000_000u64),
			max_priority_fee_per_gas: U256::from(1_000_000_000u64),
			paymaster: None,
			paymaster_verification_gas_limit: None,
			paymaster_post_op_gas_limit: None,
			paymaster_data: None,
			signature: dummy_signature(),
		}
	}

	#[test]
	fn packs_gas_pairs_big_endian() {
		assert_eq!(
			hex::encode(pack_account_gas_limits(U256::from(1u64), U256::from(2u64))),
			"0000000000000000000000000000000100000000000000000000000000000002"
		);
		assert_eq!(
			hex::encode(pack_gas_fees(U256::from(0xabu64), U256::from(0xcdu64))),
			"000000000000000000000000000000ab000000000000000000000000000000cd"
		);
	}

	#[test]
	fn init_code_concatenates_factory_and_data() {
		let mut op = test_op();
		assert!(op.init_code().is_empty());

		op.factory = Some(Address::from_str("0x0000000000400CdFef5E2714E63d8040b700BC24").unwrap());
		op.factory_data = Some(Bytes::from_str("0x5fbfb9cf").unwrap());

		let init_code = op.init_code();
		assert_eq!(init_code.len(), 24);
		assert_eq!(&init_code[..20], op.factory.unwrap().as_bytes());
		assert_eq!(&init_code[20..], [0x5f, 0xbf, 0xb9, 0xcf]);
	}

	#[test]
	fn paymaster_and_data_layout() {
		let mut op = test_op();
		assert!(op.paymaster_and_data().is_empty());

		op.paymaster = Some(Address::repeat_byte(0x11));
		op.paymaster_verification_gas_limit = Some(U256::from(1u64));
		op.paymaster_post_op_gas_limit = Some(U256::from(2u64));
		op.paymaster_data = Some(Bytes::from_str("0xaabb").unwrap());

		let packed = op.paymaster_and_data();
		assert_eq!(packed.len(), 20 + 32 + 2);
		assert_eq!(&packed[..20], Address::repeat_byte(0x11).as_bytes());
		assert_eq!(packed[35], 0x01);
		assert_eq!(packed[51], 0x02);
		assert_eq!(&packed[52..], [0xaa, 0xbb]);
	}

	#[test]
	fn hash_is_sensitive_to_every_field() {
		let entry_point =
			Address::from_str("0x0000000071727De22E5E9d8baF0edAc6f37da032").unwrap();
		let base = test_op().hash(entry_point, 84532);

		let mut op = test_op();
		op.nonce = U256::from(8u64);
		assert_ne!(op.hash(entry_point, 84532), base);

		let mut op = test_op();
		op.call_data = Bytes::from_str("0xdeadbeee").unwrap();
		assert_ne!(op.hash(entry_point, 84532), base);

		let mut op = test_op();
		op.max_fee_per_gas = U256::from(1u64);
		assert_ne!(op.hash(entry_point, 84532), base);

		// Chain binding.
		assert_ne!(test_op().hash(entry_point, 8453), base);
		// The signature is NOT part of the hash.
		let mut op = test_op();
		op.signature = Bytes::default();
		assert_eq!(op.hash(entry_point, 84532), base);
	}

	#[test]
	fn dummy_signature_is_typed_and_sized() {
		let sig = dummy_signature();
		assert_eq!(sig.len(), 66);
		assert_eq!(sig[0], 0x00);
	}

	#[test]
	fn signatures_carry_the_type_byte_and_a_canonical_v() {
		let wallet = LocalWallet::from_str(
			"0101010101010101010101010101010101010101010101010101010101010101",
		)
		.unwrap();

		let signature = sign_user_op_hash(H256::repeat_byte(0x42), &wallet).unwrap();
		assert_eq!(signature.len(), 66);
		assert_eq!(signature[0], 0x00);
		assert!(matches!(signature[65], 27 | 28));
	}

	#[test]
	fn normalises_recovery_ids() {
		assert_eq!(normalise_v(0), 27);
		assert_eq!(normalise_v(1), 28);
		assert_eq!(normalise_v(27), 27);
		assert_eq!(normalise_v(28), 28);
		assert_eq!(normalise_v(35), 27);
		assert_eq!(normalise_v(36), 28);
	}

	#[test]
	fn wire_format_is_camel_case_hex() {
		let json = serde_json::to_value(test_op()).unwrap();
		assert_eq!(json["sender"], "0x541f563237a309b3a61e33bdf07a8930bdba8d99");
		assert_eq!(json["callData"], "0xdeadbeef");
		assert_eq!(json["callGasLimit"], "0x493e0");
		assert!(json.get("factory").is_none());
		assert!(json.get("paymaster").is_none());
	}
}
