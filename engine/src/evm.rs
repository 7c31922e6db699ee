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

pub mod contracts;
pub mod event;
pub mod retry_rpc;
pub mod rpc;

use anyhow::{anyhow, Context, Result};
use bigdecimal::{num_bigint::BigInt, BigDecimal};
use ethers::types::{H160, U256};
use std::str::FromStr;
use utilities::SecretUrl;

/// The canonical form for address comparisons, index keys and DB lookups. The
/// original case is kept only for display.
pub fn canonical_address(address: &str) -> String {
	address.to_lowercase()
}

pub fn parse_address(address: &str) -> Result<H160> {
	H160::from_str(address.trim()).map_err(|_| anyhow!("Invalid EVM address: {address}"))
}

pub fn address_to_string(address: H160) -> String {
	format!("{address:#x}")
}

/// Composes the JSON-RPC endpoint from the base URL persisted per network and the API
/// key taken from the environment. The key is never persisted and the resulting URL
/// redacts it when logged.
pub fn compose_rpc_url(base: &str, api_key: &str) -> SecretUrl {
	if api_key.is_empty() {
		SecretUrl::from(base.trim_end_matches('/'))
	} else {
		SecretUrl::from(format!("{}/{}", base.trim_end_matches('/'), api_key))
	}
}

/// Scales a decimal token amount into integer token units.
pub fn to_token_units(amount: &BigDecimal, decimals: u8) -> Result<U256> {
	if amount.sign() == bigdecimal::num_bigint::Sign::Minus {
		return Err(anyhow!("Cannot convert negative amount {amount} to token units"))
	}
	if decimals > 18 {
		return Err(anyhow!("Unsupported token decimals: {decimals}"))
	}
	let scaled = (amount * BigDecimal::from(10u64.pow(decimals as u32))).with_scale(0);
	let (units, _) = scaled.into_bigint_and_exponent();
	U256::from_dec_str(&units.to_string())
		.with_context(|| format!("Amount {amount} does not fit into a uint256"))
}

/// The inverse of [to_token_units].
pub fn from_token_units(value: U256, decimals: u8) -> Result<BigDecimal> {
	let units = BigInt::from_str(&value.to_string()).context("uint256 out of BigInt range")?;
	Ok(BigDecimal::new(units, decimals as i64))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn canonicalises_addresses() {
		assert_eq!(
			canonical_address("0x541f563237A309B3A61E33BDf07a8930Bdba8D99"),
			"0x541f563237a309b3a61e33bdf07a8930bdba8d99"
		);
	}

	#[test]
	fn composes_rpc_urls() {
		assert_eq!(
			compose_rpc_url("https://base-sepolia.g.alchemy.com/v2", "testkey").as_ref(),
			"https://base-sepolia.g.alchemy.com/v2/testkey"
		);
		assert_eq!(
			compose_rpc_url("https://base-sepolia.g.alchemy.com/v2/", "testkey").as_ref(),
			"https://base-sepolia.g.alchemy.com/v2/testkey"
		);
		assert_eq!(compose_rpc_url("http://localhost:8545", "").as_ref(), "http://localhost:8545");
	}

	#[test]
	fn scales_amounts_to_token_units() {
		let half = BigDecimal::from_str("0.5").unwrap();
		assert_eq!(to_token_units(&half, 6).unwrap(), U256::from(500_000u64));
		assert_eq!(
			to_token_units(&half, 18).unwrap(),
			U256::from_dec_str("500000000000000000").unwrap()
		);

		// Sub-unit dust is truncated.
		let dusty = BigDecimal::from_str("0.0000001").unwrap();
		assert_eq!(to_token_units(&dusty, 6).unwrap(), U256::zero());

		assert!(to_token_units(&BigDecimal::from(-1), 6).is_err());
	}

	#[test]
	fn token_units_round_trip() {
		let amount = BigDecimal::from_str("1482.3").unwrap();
		let units = to_token_units(&amount, 6).unwrap();
		assert_eq!(units, U256::from(1_482_300_000u64));
		assert_eq!(from_token_units(units, 6).unwrap(), amount);
	}
}
