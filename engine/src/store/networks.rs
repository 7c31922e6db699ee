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

use super::models::{Network, Token};
use sqlx::{types::Uuid, PgConnection};

pub async fn all(ex: &mut PgConnection) -> Result<Vec<Network>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM networks ORDER BY identifier";
	sqlx::query_as(QUERY).fetch_all(ex).await
}

pub async fn by_identifier(
	ex: &mut PgConnection,
	identifier: &str,
) -> Result<Option<Network>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM networks WHERE identifier = $1";
	sqlx::query_as(QUERY).bind(identifier).fetch_optional(ex).await
}

pub async fn single(ex: &mut PgConnection, id: Uuid) -> Result<Option<Network>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM networks WHERE id = $1";
	sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

/// Indexer progress. Only ever moves forward.
pub async fn update_last_indexed_block(
	ex: &mut PgConnection,
	id: Uuid,
	block: i64,
) -> Result<(), sqlx::Error> {
	const QUERY: &str = r#"
UPDATE networks SET last_indexed_block = GREATEST(last_indexed_block, $2) WHERE id = $1
"#;
	sqlx::query(QUERY).bind(id).bind(block).execute(ex).await?;
	Ok(())
}

pub async fn token_by_id(ex: &mut PgConnection, id: Uuid) -> Result<Option<Token>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM tokens WHERE id = $1";
	sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

pub async fn token_for_network_by_contract(
	ex: &mut PgConnection,
	network_id: Uuid,
	contract_address_lowercase: &str,
) -> Result<Option<Token>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM tokens WHERE network_id = $1 AND LOWER(contract_address) = $2 AND is_enabled
"#;
	sqlx::query_as(QUERY)
		.bind(network_id)
		.bind(contract_address_lowercase)
		.fetch_optional(ex)
		.await
}

pub async fn token_for_network_by_symbol(
	ex: &mut PgConnection,
	network_id: Uuid,
	symbol: &str,
) -> Result<Option<Token>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM tokens WHERE network_id = $1 AND symbol = $2 AND is_enabled
"#;
	sqlx::query_as(QUERY).bind(network_id).bind(symbol).fetch_optional(ex).await
}
