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

//! Address-activity webhook ingest. The handler verifies the HMAC signature, fans
//! the activity entries into the detector's channel and answers 200 immediately;
//! order progression is asynchronous.

use ethers::types::U256;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use warp::{http::StatusCode, Filter};

use super::{DepositObservation, DepositSource};
use crate::settings;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContract {
	#[serde(default)]
	pub address: Option<String>,
	#[serde(default)]
	pub decimals: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
	pub from_address: String,
	pub to_address: String,
	#[serde(default)]
	pub block_num: Option<String>,
	pub hash: String,
	/// Raw integer token units as a decimal string.
	pub value: String,
	#[serde(default)]
	pub asset: Option<String>,
	#[serde(default)]
	pub category: Option<String>,
	#[serde(default)]
	pub raw_contract: Option<RawContract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
	pub network: String,
	pub activity: Vec<Activity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressActivityPayload {
	#[serde(default)]
	pub webhook_id: Option<String>,
	#[serde(default)]
	pub id: Option<String>,
	#[serde(rename = "type")]
	pub payload_type: String,
	pub event: ActivityEvent,
}

/// Constant-time verification of `X-Alchemy-Signature` = HMAC-SHA256(body) hex.
pub fn verify_signature(body: &[u8], signature_hex: &str, signing_key: &str) -> bool {
	let Ok(signature) = hex::decode(signature_hex) else { return false };
	let mut hmac =
		HmacSha256::new_from_slice(signing_key.as_bytes()).expect("hmac accepts any key length");
	hmac.update(body);
	hmac.verify_slice(&signature).is_ok()
}

fn parse_block_num(block_num: Option<&str>) -> Option<i64> {
	let block_num = block_num?;
	i64::from_str_radix(block_num.trim_start_matches("0x"), 16).ok()
}

fn observations_from_payload(payload: AddressActivityPayload) -> Vec<DepositObservation> {
	if payload.payload_type != "ADDRESS_ACTIVITY" {
		return Vec::new()
	}
	let network = payload.event.network;
	payload
		.event
		.activity
		.into_iter()
		.filter(|activity| {
			// Only token transfers move order state; native-ETH and NFT activity is
			// not ours.
			activity
				.category
				.as_deref()
				.map(|category| matches!(category, "token" | "erc20"))
				.unwrap_or(true)
		})
		.filter_map(|activity| {
			let value = U256::from_dec_str(&activity.value).ok()?;
			let decimals =
				activity.raw_contract.as_ref().and_then(|contract| contract.decimals);
			Some(DepositObservation {
				network_identifier: network.clone(),
				to_address: activity.to_address,
				from_address: Some(activity.from_address),
				tx_hash: Some(activity.hash.to_lowercase()),
				block_number: parse_block_num(activity.block_num.as_deref()),
				token_contract: activity.raw_contract.and_then(|contract| contract.address),
				value,
				decimals,
				source: DepositSource::Webhook,
			})
		})
		.collect()
}

pub fn routes(
	signing_key: String,
	sender: mpsc::Sender<DepositObservation>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
	warp::path!("webhooks" / "deposits")
		.and(warp::post())
		.and(warp::header::optional::<String>("x-alchemy-signature"))
		.and(warp::body::bytes())
		.map(move |signature: Option<String>, body: warp::hyper::body::Bytes| {
			if !signing_key.is_empty() {
				let Some(signature) = signature else {
					return warp::reply::with_status(
						warp::reply::json(&serde_json::json!({"error": "missing signature"})),
						StatusCode::UNAUTHORIZED,
					)
				};
				if !verify_signature(&body, &signature, &signing_key) {
					return warp::reply::with_status(
						warp::reply::json(&serde_json::json!({"error": "bad signature"})),
						StatusCode::UNAUTHORIZED,
					)
				}
			}

			let payload: AddressActivityPayload = match serde_json::from_slice(&body) {
				Ok(payload) => payload,
				Err(error) => {
					tracing::warn!("Malformed webhook payload: {error}");
					return warp::reply::with_status(
						warp::reply::json(&serde_json::json!({"error": "malformed payload"})),
						StatusCode::BAD_REQUEST,
					)
				},
			};

			for observation in observations_from_payload(payload) {
				// Backpressure: never block the webhook response on a full queue.
				if let Err(error) = sender.try_send(observation) {
					tracing::warn!("Deposit queue full, dropping webhook observation: {error}");
				}
			}

			warp::reply::with_status(
				warp::reply::json(&serde_json::json!({"received": true})),
				StatusCode::OK,
			)
		})
}

pub async fn start(
	webhook_settings: settings::Webhook,
	sender: mpsc::Sender<DepositObservation>,
) -> anyhow::Result<()> {
	let address: std::net::IpAddr = webhook_settings
		.hostname
		.parse()
		.unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));

	tracing::info!(
		"Webhook listener on {}:{}",
		webhook_settings.hostname,
		webhook_settings.port
	);
	warp::serve(routes(webhook_settings.signing_key, sender))
		.run((address, webhook_settings.port))
		.await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn signed(body: &str, key: &str) -> String {
		let mut hmac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
		hmac.update(body.as_bytes());
		hex::encode(hmac.finalize().into_bytes())
	}

	const PAYLOAD: &str = r#"{
		"webhookId": "wh_abc",
		"id": "evt_123",
		"createdAt": "2024-01-01T00:00:00Z",
		"type": "ADDRESS_ACTIVITY",
		"event": {
			"network": "base-sepolia",
			"activity": [{
				"fromAddress": "0x00000000000000000000000000000000000000aa",
				"toAddress": "0x541f563237A309B3A61E33BDf07a8930Bdba8D99",
				"blockNum": "0x10",
				"hash": "0xDEADBEEFdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
				"value": "500000",
				"asset": "USDC",
				"category": "token",
				"rawContract": {
					"address": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
					"decimals": 6
				}
			}]
		}
	}"#;

	#[test]
	fn signature_verification_round_trips() {
		assert!(verify_signature(b"body", &signed("body", "key"), "key"));
		assert!(!verify_signature(b"body", &signed("body", "other-key"), "key"));
		assert!(!verify_signature(b"tampered", &signed("body", "key"), "key"));
		assert!(!verify_signature(b"body", "not hex", "key"));
	}

	#[test]
	fn payload_parses_into_observations() {
		let payload: AddressActivityPayload = serde_json::from_str(PAYLOAD).unwrap();
		let observations = observations_from_payload(payload);

		assert_eq!(observations.len(), 1);
		let observation = &observations[0];
		assert_eq!(observation.network_identifier, "base-sepolia");
		assert_eq!(observation.value, U256::from(500_000u64));
		assert_eq!(observation.decimals, Some(6));
		assert_eq!(observation.block_number, Some(16));
		assert_eq!(
			observation.tx_hash.as_deref(),
			Some("0xdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
		);
		assert_eq!(observation.source, DepositSource::Webhook);
	}

	#[test]
	fn non_token_activity_is_filtered_out() {
		let payload: AddressActivityPayload =
			serde_json::from_str(&PAYLOAD.replace("\"token\"", "\"external\"")).unwrap();
		assert!(observations_from_payload(payload).is_empty());
	}

	#[test]
	fn non_address_activity_payloads_are_ignored() {
		let payload: AddressActivityPayload =
			serde_json::from_str(&PAYLOAD.replace("ADDRESS_ACTIVITY", "MINED_TRANSACTION"))
				.unwrap();
		assert!(observations_from_payload(payload).is_empty());
	}
}
