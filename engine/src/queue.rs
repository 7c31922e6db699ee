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

//! Provision queues: one circular Redis list per `(currency, amount-range)` bucket,
//! ordered by rate, consumed round-robin for order assignment, plus a per
//! `(token, currency)` sorted-set for rate queries. Rebuilt periodically from the DB;
//! the rebuild is pure with respect to DB state.

use anyhow::{anyhow, Context, Result};
use bigdecimal::{BigDecimal, ToPrimitive};
use redis::{aio::MultiplexedConnection, AsyncCommands};
use std::{fmt, str::FromStr};

use crate::store::{models::ConversionRateType, providers, Store};

/// `bucket_<CCY>_<MIN>_<MAX>`
pub fn bucket_key(currency_code: &str, min_amount: &BigDecimal, max_amount: &BigDecimal) -> String {
	format!("bucket_{}_{}_{}", currency_code, min_amount.normalized(), max_amount.normalized())
}

/// `rates_<TOKEN>_<CCY>`
pub fn rates_key(token_symbol: &str, currency_code: &str) -> String {
	format!("rates_{token_symbol}_{currency_code}")
}

/// One provider position in a bucket queue, serialised as
/// `<providerID>:<tokenSymbol>:<rate>:<minOrderAmt>:<maxOrderAmt>`.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
	pub provider_id: String,
	pub token_symbol: String,
	pub rate: BigDecimal,
	pub min_order_amount: BigDecimal,
	pub max_order_amount: BigDecimal,
}

impl QueueEntry {
	pub fn covers(&self, amount: &BigDecimal) -> bool {
		&self.min_order_amount <= amount && amount <= &self.max_order_amount
	}
}

impl fmt::Display for QueueEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}:{}:{}:{}:{}",
			self.provider_id,
			self.token_symbol,
			self.rate.normalized(),
			self.min_order_amount.normalized(),
			self.max_order_amount.normalized()
		)
	}
}

impl FromStr for QueueEntry {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self> {
		let parts: Vec<&str> = s.split(':').collect();
		let [provider_id, token_symbol, rate, min_order_amount, max_order_amount] = parts[..]
		else {
			return Err(anyhow!("Malformed queue entry: {s}"))
		};
		Ok(QueueEntry {
			provider_id: provider_id.to_string(),
			token_symbol: token_symbol.to_string(),
			rate: BigDecimal::from_str(rate).context("Bad rate in queue entry")?,
			min_order_amount: BigDecimal::from_str(min_order_amount)
				.context("Bad min amount in queue entry")?,
			max_order_amount: BigDecimal::from_str(max_order_amount)
				.context("Bad max amount in queue entry")?,
		})
	}
}

/// Fixed-rate providers quote their configured rate; floating providers track the
/// currency market rate with a configured offset in percent.
pub fn effective_rate(
	rate_type: ConversionRateType,
	fixed_rate: &BigDecimal,
	floating_percent: &BigDecimal,
	market_rate: &BigDecimal,
) -> BigDecimal {
	match rate_type {
		ConversionRateType::Fixed => fixed_rate.clone(),
		ConversionRateType::Floating =>
			market_rate * (BigDecimal::from(1) + floating_percent / BigDecimal::from(100)),
	}
}

/// The median of the given rates; the caller falls back to the market rate on `None`.
pub fn median_rate(rates: &mut Vec<BigDecimal>) -> Option<BigDecimal> {
	if rates.is_empty() {
		return None
	}
	rates.sort();
	let mid = rates.len() / 2;
	Some(if rates.len() % 2 == 1 {
		rates[mid].clone()
	} else {
		(&rates[mid - 1] + &rates[mid]) / BigDecimal::from(2)
	})
}

#[derive(Clone)]
pub struct ProvisionQueue {
	redis: MultiplexedConnection,
	store: Store,
}

impl ProvisionQueue {
	pub fn new(redis: MultiplexedConnection, store: Store) -> Self {
		Self { redis, store }
	}

	/// Drops and repopulates every enabled bucket's queue from current DB state, best
	/// rate first, and refreshes the per-(token, currency) rate sorted-sets.
	pub async fn rebuild(&self) -> Result<()> {
		let mut db = self.store.acquire().await?;
		let mut redis = self.redis.clone();

		let buckets = providers::active_buckets(&mut db).await?;
		for bucket in buckets {
			let market_rate = providers::currency(&mut db, &bucket.currency_code)
				.await?
				.map(|currency| currency.market_rate)
				.unwrap_or_default();

			let rows = providers::eligible_providers_for_bucket(
				&mut db,
				bucket.id,
				&bucket.currency_code,
				&bucket.min_amount,
			)
			.await?;

			let mut entries: Vec<QueueEntry> = rows
				.into_iter()
				.map(|row| QueueEntry {
					rate: effective_rate(
						row.conversion_rate_type,
						&row.fixed_conversion_rate,
						&row.floating_conversion_rate,
						&market_rate,
					),
					provider_id: row.provider_id,
					token_symbol: row.token_symbol,
					min_order_amount: row.min_order_amount,
					max_order_amount: row.max_order_amount,
				})
				.collect();
			entries.sort_by(|a, b| a.rate.cmp(&b.rate));

			let key = bucket_key(&bucket.currency_code, &bucket.min_amount, &bucket.max_amount);
			let _: () = redis.del(&key).await?;
			for entry in &entries {
				let _: () = redis.rpush(&key, entry.to_string()).await?;
				let score = entry.rate.to_f64().unwrap_or_default();
				let _: () = redis
					.zadd(
						rates_key(&entry.token_symbol, &bucket.currency_code),
						&entry.provider_id,
						score,
					)
					.await?;
			}
			tracing::debug!("Rebuilt {key} with {} provider(s)", entries.len());
		}
		Ok(())
	}

	/// Rotates the bucket queue (LPOP + RPUSH) and returns the provider that was at
	/// its head.
	pub async fn rotate_next(&self, bucket_queue_key: &str) -> Result<Option<QueueEntry>> {
		let mut redis = self.redis.clone();
		let raw: Option<String> = redis.lpop(bucket_queue_key, None).await?;
		let Some(raw) = raw else { return Ok(None) };
		let _: () = redis.rpush(bucket_queue_key, &raw).await?;
		Ok(Some(raw.parse()?))
	}

	pub async fn entries(&self, bucket_queue_key: &str) -> Result<Vec<QueueEntry>> {
		let mut redis = self.redis.clone();
		let raw: Vec<String> = redis.lrange(bucket_queue_key, 0, -1).await?;
		raw.iter().map(|entry| entry.parse()).collect()
	}

	/// The rate an order of `amount` in `token` would get: the median over queued
	/// providers covering the amount, falling back to the market rate when the queues
	/// are empty.
	pub async fn get_token_rate_from_queue(
		&self,
		token_symbol: &str,
		amount: &BigDecimal,
		currency_code: &str,
		market_rate: &BigDecimal,
	) -> Result<BigDecimal> {
		let mut redis = self.redis.clone();
		let keys: Vec<String> = redis.keys(format!("bucket_{currency_code}_*")).await?;

		let mut rates = Vec::new();
		for key in keys {
			for entry in self.entries(&key).await? {
				if entry.token_symbol == token_symbol && entry.covers(amount) {
					rates.push(entry.rate);
				}
			}
		}

		Ok(median_rate(&mut rates).unwrap_or_else(|| market_rate.clone()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn decimal(s: &str) -> BigDecimal {
		BigDecimal::from_str(s).unwrap()
	}

	#[test]
	fn bucket_keys_use_normalised_amounts() {
		assert_eq!(
			bucket_key("NGN", &decimal("0.50"), &decimal("100.00")),
			"bucket_NGN_0.5_100"
		);
		assert_eq!(bucket_key("KES", &decimal("100"), &decimal("5000")), "bucket_KES_100_5000");
	}

	#[test]
	fn queue_entries_round_trip() {
		let entry = QueueEntry {
			provider_id: "P1001".to_string(),
			token_symbol: "USDT".to_string(),
			rate: decimal("1482.3"),
			min_order_amount: decimal("0.5"),
			max_order_amount: decimal("600"),
		};

		let serialised = entry.to_string();
		assert_eq!(serialised, "P1001:USDT:1482.3:0.5:600");
		assert_eq!(serialised.parse::<QueueEntry>().unwrap(), entry);
	}

	#[test]
	fn rejects_malformed_entries() {
		assert!("P1001:USDT:1482.3".parse::<QueueEntry>().is_err());
		assert!("P1001:USDT:abc:0.5:600".parse::<QueueEntry>().is_err());
	}

	#[test]
	fn entry_range_cover_is_inclusive() {
		let entry: QueueEntry = "P1:USDT:1500:0.5:600".parse().unwrap();
		assert!(entry.covers(&decimal("0.5")));
		assert!(entry.covers(&decimal("600")));
		assert!(!entry.covers(&decimal("0.49")));
		assert!(!entry.covers(&decimal("600.01")));
	}

	#[test]
	fn effective_rates() {
		assert_eq!(
			effective_rate(
				ConversionRateType::Fixed,
				&decimal("1500"),
				&decimal("2"),
				&decimal("1480")
			),
			decimal("1500")
		);
		assert_eq!(
			effective_rate(
				ConversionRateType::Floating,
				&decimal("0"),
				&decimal("2"),
				&decimal("1500")
			),
			decimal("1530")
		);
		assert_eq!(
			effective_rate(
				ConversionRateType::Floating,
				&decimal("0"),
				&decimal("-1"),
				&decimal("1500")
			),
			decimal("1485")
		);
	}

	#[test]
	fn median_of_odd_and_even_sets() {
		assert_eq!(
			median_rate(&mut vec![decimal("3"), decimal("1"), decimal("2")]),
			Some(decimal("2"))
		);
		assert_eq!(
			median_rate(&mut vec![decimal("4"), decimal("1"), decimal("3"), decimal("2")]),
			Some(decimal("2.5"))
		);
		assert_eq!(median_rate(&mut Vec::new()), None);
	}
}
