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

//! Postgres access. Individual table areas are free functions over a `PgConnection`
//! so they compose into transactions; [Store] owns the pool and carries the
//! multi-row operations that must be atomic.

pub mod addresses;
pub mod models;
pub mod networks;
pub mod orders;
pub mod providers;
pub mod tx_logs;

use anyhow::{Context, Result};
use sqlx::{pool::PoolConnection, postgres::PgPoolOptions, Executor, PgPool, Postgres, Transaction};

const SCHEMA: &str = include_str!("store/schema.sql");

/// Unique-constraint violation, the idempotency signal across all detection paths.
pub fn is_duplicate_record_error(err: &sqlx::Error) -> bool {
	matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[derive(Clone)]
pub struct Store {
	pool: PgPool,
}

impl Store {
	pub async fn connect(url: &str) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.max_connections(10)
			.connect(url)
			.await
			.context("Failed to connect to postgres")?;
		Ok(Self { pool })
	}

	/// Applies the schema idempotently. Migration tooling is a deployment concern,
	/// not an engine one.
	pub async fn ensure_schema(&self) -> Result<()> {
		self.pool.execute(SCHEMA).await.context("Failed to apply schema")?;
		Ok(())
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	pub async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
		Ok(self.pool.acquire().await?)
	}

	pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
		Ok(self.pool.begin().await?)
	}
}
