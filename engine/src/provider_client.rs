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

//! HTTP client for provision nodes. Requests are authenticated with an HMAC-SHA256
//! over `clientID:timestamp` using the provider's secret key; the timestamp rides as
//! a UNIX-seconds query parameter on GETs and inside the signed headers on POSTs.

use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::types::{BigDecimal, Uuid};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::PROVIDER_NODE_TIMEOUT;

type HmacSha256 = Hmac<Sha256>;

pub fn auth_signature(client_id: &str, timestamp: u64, secret_key: &[u8]) -> String {
	let mut hmac = HmacSha256::new_from_slice(secret_key).expect("hmac accepts any key length");
	hmac.update(format!("{client_id}:{timestamp}").as_bytes());
	hex::encode(hmac.finalize().into_bytes())
}

fn unix_timestamp() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProviderCurrencyInfo {
	pub currency: String,
	pub available_balance: BigDecimal,
}

/// The provider's declared state from `GET /info`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProviderInfo {
	#[serde(default)]
	pub service_info: Option<String>,
	pub currencies: Vec<ProviderCurrencyInfo>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OrderAssignment<'a> {
	pub lock_order_id: Uuid,
	pub amount: &'a BigDecimal,
	pub rate: &'a BigDecimal,
	pub token_symbol: &'a str,
	pub currency_code: &'a str,
	pub institution_code: &'a str,
	pub account_identifier: &'a str,
	pub account_name: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub memo: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssignmentOutcome {
	Accepted,
	/// The provider turned the order down; the lock's cancellation count advances.
	Declined { reason: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SettleProof {
	pub lock_order_id: Uuid,
	/// Opaque off-chain payment reference from the provider's PSP.
	pub payment_reference: String,
	/// Portion of the lock fulfilled, in percent.
	pub settle_percent: u8,
}

#[derive(Clone)]
pub struct ProviderClient {
	client: reqwest::Client,
}

impl Default for ProviderClient {
	fn default() -> Self {
		Self::new()
	}
}

impl ProviderClient {
	pub fn new() -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(PROVIDER_NODE_TIMEOUT)
				.build()
				.expect("reqwest client construction cannot fail with static config"),
		}
	}

	fn signed_get(&self, host: &str, path: &str, client_id: &str, secret_key: &[u8]) -> reqwest::RequestBuilder {
		let timestamp = unix_timestamp();
		self.client
			.get(format!("{}{path}", host.trim_end_matches('/')))
			.query(&[("timestamp", timestamp.to_string())])
			.header("X-Client-Id", client_id)
			.header("X-Request-Signature", auth_signature(client_id, timestamp, secret_key))
	}

	fn signed_post(&self, host: &str, path: &str, client_id: &str, secret_key: &[u8]) -> reqwest::RequestBuilder {
		let timestamp = unix_timestamp();
		self.client
			.post(format!("{}{path}", host.trim_end_matches('/')))
			.header("X-Client-Id", client_id)
			.header("X-Request-Timestamp", timestamp.to_string())
			.header("X-Request-Signature", auth_signature(client_id, timestamp, secret_key))
	}

	pub async fn health(&self, host: &str) -> Result<bool> {
		let response = self
			.client
			.get(format!("{}/health", host.trim_end_matches('/')))
			.send()
			.await
			.context("Provider node unreachable")?;
		Ok(response.status().is_success())
	}

	pub async fn info(
		&self,
		host: &str,
		client_id: &str,
		secret_key: &[u8],
	) -> Result<ProviderInfo> {
		self.signed_get(host, "/info", client_id, secret_key)
			.send()
			.await
			.context("Provider /info request failed")?
			.error_for_status()
			.context("Provider /info returned an error status")?
			.json()
			.await
			.context("Provider /info returned malformed JSON")
	}

	/// Offers a lock order to the provider. A 2xx is an acceptance; a 4xx with a body
	/// is a decline with a machine-readable reason.
	pub async fn assign_order(
		&self,
		host: &str,
		client_id: &str,
		secret_key: &[u8],
		assignment: &OrderAssignment<'_>,
	) -> Result<AssignmentOutcome> {
		let response = self
			.signed_post(host, "/orders", client_id, secret_key)
			.json(assignment)
			.send()
			.await
			.context("Provider /orders request failed")?;

		let status = response.status();
		if status.is_success() {
			Ok(AssignmentOutcome::Accepted)
		} else if status.is_client_error() {
			Ok(AssignmentOutcome::Declined {
				reason: response.text().await.unwrap_or_else(|_| status.to_string()),
			})
		} else {
			Err(anyhow!("Provider /orders returned {status}"))
		}
	}

	/// Asks the provider for the off-chain payment proof of an assigned lock. `None`
	/// while the fiat leg is still in flight.
	pub async fn settle_proof(
		&self,
		host: &str,
		client_id: &str,
		secret_key: &[u8],
		lock_order_id: Uuid,
	) -> Result<Option<SettleProof>> {
		let response = self
			.signed_post(host, "/settle-proof", client_id, secret_key)
			.json(&serde_json::json!({ "lock_order_id": lock_order_id }))
			.send()
			.await
			.context("Provider /settle-proof request failed")?;

		let status = response.status();
		if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NOT_FOUND {
			// Fiat leg not paid out yet.
			Ok(None)
		} else if status.is_success() {
			Ok(Some(response.json().await.context("Provider settle proof is malformed")?))
		} else {
			Err(anyhow!("Provider /settle-proof returned {status}"))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signature_is_deterministic_hex() {
		let signature = auth_signature("P1001", 1_700_000_000, b"secret");
		assert_eq!(signature, auth_signature("P1001", 1_700_000_000, b"secret"));
		assert_eq!(signature.len(), 64);
		assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));

		// Any input change produces a different signature.
		assert_ne!(signature, auth_signature("P1002", 1_700_000_000, b"secret"));
		assert_ne!(signature, auth_signature("P1001", 1_700_000_001, b"secret"));
		assert_ne!(signature, auth_signature("P1001", 1_700_000_000, b"other"));
	}

	#[test]
	fn settle_proof_deserialises() {
		let proof: SettleProof = serde_json::from_value(serde_json::json!({
			"lock_order_id": "8f14e45f-ceea-467f-a8cb-4e6f2fb76a11",
			"payment_reference": "PSP-12345",
			"settle_percent": 100
		}))
		.unwrap();

		assert_eq!(proof.payment_reference, "PSP-12345");
		assert_eq!(proof.settle_percent, 100);
	}
}
