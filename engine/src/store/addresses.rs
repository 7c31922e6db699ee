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

use super::models::{LinkedAddress, ReceiveAddress};
use sqlx::{
	types::{
		chrono::{DateTime, Utc},
		Uuid,
	},
	PgConnection,
};

pub struct NewReceiveAddress<'a> {
	pub address: &'a str,
	pub salt_encrypted: Option<&'a str>,
	pub status: &'a str,
	pub valid_until: Option<DateTime<Utc>>,
	pub is_deployed: bool,
	pub factory_address: Option<&'a str>,
	pub owner_address: Option<&'a str>,
	pub network_id: Uuid,
}

pub async fn insert(
	ex: &mut PgConnection,
	address: &NewReceiveAddress<'_>,
) -> Result<Uuid, sqlx::Error> {
	const QUERY: &str = r#"
INSERT INTO receive_addresses (
    address, salt_encrypted, status, valid_until, is_deployed, factory_address, owner_address, network_id
)
VALUES ($1, $2, $3::receive_address_status, $4, $5, $6, $7, $8)
RETURNING id
"#;
	sqlx::query_scalar(QUERY)
		.bind(address.address)
		.bind(address.salt_encrypted)
		.bind(address.status)
		.bind(address.valid_until)
		.bind(address.is_deployed)
		.bind(address.factory_address)
		.bind(address.owner_address)
		.bind(address.network_id)
		.fetch_one(ex)
		.await
}

pub async fn single(
	ex: &mut PgConnection,
	id: Uuid,
) -> Result<Option<ReceiveAddress>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM receive_addresses WHERE id = $1";
	sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

/// Atomically claims the oldest ready pool address for a network. The inner pick uses
/// `FOR UPDATE SKIP LOCKED` so concurrent order creations can never claim the same
/// row.
pub async fn pick_pool_ready(
	ex: &mut PgConnection,
	network_id: Uuid,
) -> Result<Option<ReceiveAddress>, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE receive_addresses
SET status = 'pool_assigned', assigned_at = now(), times_used = times_used + 1, updated_at = now()
WHERE id = (
    SELECT id FROM receive_addresses
    WHERE status = 'pool_ready' AND network_id = $1
    ORDER BY created_at ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING *
"#;
	sqlx::query_as(QUERY).bind(network_id).fetch_optional(ex).await
}

pub async fn mark_used(
	ex: &mut PgConnection,
	id: Uuid,
	tx_hash: &str,
	last_indexed_block: Option<i64>,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE receive_addresses
SET status = 'used', last_used = now(), tx_hash = $2, last_indexed_block = $3, updated_at = now()
WHERE id = $1 AND status = 'pool_assigned'
"#;
	Ok(sqlx::query(QUERY)
		.bind(id)
		.bind(tx_hash)
		.bind(last_indexed_block)
		.execute(ex)
		.await?
		.rows_affected() >
		0)
}

/// Returns a pool address to circulation after its order settled. Fallback-minted
/// addresses (those with a validity deadline) and addresses without a persisted
/// deployable salt are never recycled.
pub async fn recycle(ex: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE receive_addresses
SET status = 'pool_ready', recycled_at = now(), updated_at = now()
WHERE id = $1
  AND status = 'used'
  AND valid_until IS NULL
  AND salt_encrypted IS NOT NULL
"#;
	Ok(sqlx::query(QUERY).bind(id).execute(ex).await?.rows_affected() > 0)
}

pub async fn mark_expired(ex: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE receive_addresses
SET status = 'expired', updated_at = now()
WHERE id = $1 AND status IN ('unused', 'pool_assigned')
"#;
	Ok(sqlx::query(QUERY).bind(id).execute(ex).await?.rows_affected() > 0)
}

pub async fn mark_deployed(
	ex: &mut PgConnection,
	id: Uuid,
	deployment_tx_hash: &str,
) -> Result<(), sqlx::Error> {
	const QUERY: &str = r#"
UPDATE receive_addresses
SET is_deployed = true, deployment_tx_hash = $2, updated_at = now()
WHERE id = $1
"#;
	sqlx::query(QUERY).bind(id).bind(deployment_tx_hash).execute(ex).await?;
	Ok(())
}

/// The most recently assigned row for this address. Addresses recycle, so the match
/// is deliberately not unique; the latest assignment wins.
pub async fn by_address(
	ex: &mut PgConnection,
	address_lowercase: &str,
) -> Result<Option<ReceiveAddress>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM receive_addresses
WHERE LOWER(address) = $1
ORDER BY assigned_at DESC NULLS LAST
LIMIT 1
"#;
	sqlx::query_as(QUERY).bind(address_lowercase).fetch_optional(ex).await
}

// ===== Linked addresses =====

pub async fn linked_by_id(
	ex: &mut PgConnection,
	id: Uuid,
) -> Result<Option<LinkedAddress>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM linked_addresses WHERE id = $1";
	sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

pub async fn linked_by_address(
	ex: &mut PgConnection,
	address_lowercase: &str,
) -> Result<Option<LinkedAddress>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM linked_addresses WHERE LOWER(address) = $1";
	sqlx::query_as(QUERY).bind(address_lowercase).fetch_optional(ex).await
}

pub async fn update_linked_index(
	ex: &mut PgConnection,
	id: Uuid,
	last_indexed_block: i64,
	tx_hash: &str,
) -> Result<(), sqlx::Error> {
	const QUERY: &str = r#"
UPDATE linked_addresses SET last_indexed_block = $2, tx_hash = $3 WHERE id = $1
"#;
	sqlx::query(QUERY).bind(id).bind(last_indexed_block).bind(tx_hash).execute(ex).await?;
	Ok(())
}
