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

//! Receive-address allocation: claim from the pre-deployed pool first, fall back to
//! minting a fresh deterministic CREATE2 account. The factory is the authority on the
//! fallback address; it is read with `getAddress` via `eth_call`, never derived
//! locally.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use ethers::{
	types::{Address, U256},
	utils::keccak256,
};
use sqlx::types::Uuid;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
	aa::SponsoredExecutionApi,
	constants::LIGHT_ACCOUNT_FACTORY_ADDRESS,
	crypto::Cipher,
	evm::address_to_string,
	store::{addresses, models::ReceiveAddress, Store},
};

/// 32-byte CREATE2 salt: `keccak256(unix_nanos ‖ keccak256(unix_micros))`.
pub fn generate_salt() -> [u8; 32] {
	let since_epoch =
		SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch");
	let nanos = (since_epoch.as_nanos() as u128).to_be_bytes();
	let micros = (since_epoch.as_micros() as u128).to_be_bytes();

	let mut preimage = nanos.to_vec();
	preimage.extend_from_slice(&keccak256(micros));
	keccak256(preimage)
}

#[derive(Clone)]
pub struct AddressPool {
	store: Store,
	cipher: Cipher,
	/// Operator address: the owner of every smart account the pool mints.
	owner: Address,
	/// Validity window applied to fallback-minted addresses; pool addresses never
	/// expire by time.
	fallback_validity: Duration,
}

impl AddressPool {
	pub fn new(store: Store, cipher: Cipher, owner: Address, fallback_validity: Duration) -> Self {
		Self { store, cipher, owner, fallback_validity }
	}

	/// Allocates a receive address for a new order on `network_id`: the oldest
	/// `pool_ready` address if one exists, else a freshly minted counterfactual
	/// account whose encrypted salt permits deployment later.
	pub async fn allocate(
		&self,
		network_id: Uuid,
		executor: &dyn SponsoredExecutionApi,
	) -> Result<ReceiveAddress> {
		let mut db = self.store.acquire().await?;

		if let Some(address) = addresses::pick_pool_ready(&mut db, network_id).await? {
			tracing::debug!("Assigned pool receive address {}", address.address);
			return Ok(address)
		}

		// Pool exhausted: mint. The address comes back from the factory in its own
		// casing; lookups are case-insensitive either way.
		let salt = generate_salt();
		let address =
			executor.create_smart_account(self.owner, U256::from_big_endian(&salt)).await?;

		let salt_encrypted = self.cipher.encrypt_to_hex(&salt)?;
		let id = addresses::insert(
			&mut db,
			&addresses::NewReceiveAddress {
				address: &address_to_string(address),
				salt_encrypted: Some(&salt_encrypted),
				status: "pool_assigned",
				valid_until: Some(
					Utc::now() +
						chrono::Duration::from_std(self.fallback_validity)
							.expect("validity fits in chrono range"),
				),
				is_deployed: false,
				factory_address: Some(LIGHT_ACCOUNT_FACTORY_ADDRESS),
				owner_address: Some(&address_to_string(self.owner)),
				network_id,
			},
		)
		.await?;

		tracing::info!("Minted fallback receive address {address:?}");
		addresses::single(&mut db, id)
			.await?
			.ok_or_else(|| anyhow!("Receive address {id} vanished after insert"))
	}

	/// Recovers the CREATE2 salt of an address for initCode assembly.
	pub fn decrypt_salt(&self, address: &ReceiveAddress) -> Result<Option<U256>> {
		match &address.salt_encrypted {
			None => Ok(None),
			Some(salt_encrypted) => {
				let salt = self
					.cipher
					.decrypt_from_hex(salt_encrypted)
					.with_context(|| format!("Bad salt for receive address {}", address.id))?;
				if salt.len() != 32 {
					return Err(anyhow!(
						"Decrypted salt for {} has length {}",
						address.id,
						salt.len()
					))
				}
				Ok(Some(U256::from_big_endian(&salt)))
			},
		}
	}
}

/// Local CREATE2 pre-image, kept for self-tests only. The factory's `getAddress` is
/// authoritative at runtime.
#[cfg(test)]
fn create2_address(factory: Address, salt: [u8; 32], init_code_hash: [u8; 32]) -> Address {
	let mut preimage = vec![0xffu8];
	preimage.extend_from_slice(factory.as_bytes());
	preimage.extend_from_slice(&salt);
	preimage.extend_from_slice(&init_code_hash);
	Address::from_slice(&keccak256(preimage)[12..])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn salts_are_unique() {
		let a = generate_salt();
		std::thread::sleep(std::time::Duration::from_micros(10));
		let b = generate_salt();
		assert_ne!(a, b);
	}

	#[test]
	fn create2_preimage_is_deterministic_and_pinned_to_inputs() {
		let factory: Address = LIGHT_ACCOUNT_FACTORY_ADDRESS.parse().unwrap();
		let salt = [1u8; 32];
		let init_code_hash = keccak256(b"init code");

		let address = create2_address(factory, salt, init_code_hash);
		assert_eq!(address, create2_address(factory, salt, init_code_hash));
		assert_ne!(address, create2_address(factory, [2u8; 32], init_code_hash));
		assert_ne!(address, create2_address(factory, salt, keccak256(b"other")));
	}

	#[test]
	fn salt_decryption_round_trips() {
		let cipher = Cipher::from_hex_key(
			"0101010101010101010101010101010101010101010101010101010101010101",
		)
		.unwrap();
		let salt = generate_salt();
		let encrypted = cipher.encrypt_to_hex(&salt).unwrap();

		let decrypted = cipher.decrypt_from_hex(&encrypted).unwrap();
		assert_eq!(U256::from_big_endian(&decrypted), U256::from_big_endian(&salt));
	}
}
