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

//! Symmetric encryption of secrets that have to live in the database: CREATE2 salts
//! of pooled smart accounts and private keys of linked EOAs. Ciphertexts are stored
//! hex-encoded with the nonce prepended.

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::{
	aead::{Aead, AeadCore, KeyInit, OsRng},
	ChaCha20Poly1305, Nonce,
};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct Cipher {
	cipher: ChaCha20Poly1305,
}

impl Cipher {
	/// `hex_key` is the 32-byte `ENCRYPTION_KEY` from the settings.
	pub fn from_hex_key(hex_key: &str) -> Result<Self> {
		let key_bytes =
			hex::decode(hex_key.trim_start_matches("0x")).context("Encryption key is not hex")?;
		if key_bytes.len() != 32 {
			return Err(anyhow!(
				"Encryption key must be 32 bytes, got {} bytes",
				key_bytes.len()
			))
		}
		Ok(Self {
			cipher: ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key_bytes)),
		})
	}

	pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
		let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
		let ciphertext = self
			.cipher
			.encrypt(&nonce, plaintext)
			.map_err(|_| anyhow!("Encryption failed"))?;
		let mut out = nonce.to_vec();
		out.extend_from_slice(&ciphertext);
		Ok(out)
	}

	pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
		if data.len() < NONCE_LEN {
			return Err(anyhow!("Ciphertext too short"))
		}
		let (nonce, ciphertext) = data.split_at(NONCE_LEN);
		self.cipher
			.decrypt(Nonce::from_slice(nonce), ciphertext)
			.map_err(|_| anyhow!("Decryption failed, wrong key or corrupt ciphertext"))
	}

	pub fn encrypt_to_hex(&self, plaintext: &[u8]) -> Result<String> {
		Ok(hex::encode(self.encrypt(plaintext)?))
	}

	pub fn decrypt_from_hex(&self, hex_data: &str) -> Result<Vec<u8>> {
		self.decrypt(&hex::decode(hex_data).context("Stored ciphertext is not hex")?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const TEST_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

	#[test]
	fn round_trips() {
		let cipher = Cipher::from_hex_key(TEST_KEY).unwrap();
		let salt = [7u8; 32];

		let stored = cipher.encrypt_to_hex(&salt).unwrap();
		assert_eq!(cipher.decrypt_from_hex(&stored).unwrap(), salt.to_vec());
	}

	#[test]
	fn nonces_are_unique_per_encryption() {
		let cipher = Cipher::from_hex_key(TEST_KEY).unwrap();
		assert_ne!(cipher.encrypt(b"same").unwrap(), cipher.encrypt(b"same").unwrap());
	}

	#[test]
	fn wrong_key_fails_decryption() {
		let cipher = Cipher::from_hex_key(TEST_KEY).unwrap();
		let other = Cipher::from_hex_key(
			"0202020202020202020202020202020202020202020202020202020202020202",
		)
		.unwrap();

		let data = cipher.encrypt(b"secret").unwrap();
		assert!(other.decrypt(&data).is_err());
	}

	#[test]
	fn rejects_bad_keys() {
		assert!(Cipher::from_hex_key("abcd").is_err());
		assert!(Cipher::from_hex_key("not hex at all").is_err());
	}
}
