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

//! Append-only audit log. `tx_hash` is unique and doubles as the deduplication key
//! for every deposit- and event-detection path.

use sqlx::{types::Uuid, PgConnection};

pub struct NewTransactionLog<'a> {
	pub payment_order_id: Option<Uuid>,
	pub gateway_id: Option<&'a str>,
	pub status: &'a str,
	pub tx_hash: &'a str,
	pub network: &'a str,
	pub metadata: serde_json::Value,
}

/// Inserts the log entry, or returns `false` when an entry with this tx_hash already
/// exists. The conflict is the signal that a concurrent detection path got there
/// first; callers roll back their transaction on `false`.
pub async fn insert_once(
	ex: &mut PgConnection,
	log: &NewTransactionLog<'_>,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
INSERT INTO transaction_logs (payment_order_id, gateway_id, status, tx_hash, network, metadata)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (tx_hash) DO NOTHING
"#;
	Ok(sqlx::query(QUERY)
		.bind(log.payment_order_id)
		.bind(log.gateway_id)
		.bind(log.status)
		.bind(log.tx_hash)
		.bind(log.network)
		.bind(&log.metadata)
		.execute(ex)
		.await?
		.rows_affected() >
		0)
}

pub async fn exists(ex: &mut PgConnection, tx_hash: &str) -> Result<bool, sqlx::Error> {
	const QUERY: &str = "SELECT EXISTS(SELECT 1 FROM transaction_logs WHERE tx_hash = $1)";
	sqlx::query_scalar(QUERY).bind(tx_hash).fetch_one(ex).await
}
