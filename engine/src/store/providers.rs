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

use super::models::{
	EligibleProviderRow, FiatCurrency, Institution, ProviderProfile, ProvisionBucket,
};
use sqlx::{
	types::{BigDecimal, Uuid},
	PgConnection,
};

pub async fn active_buckets(ex: &mut PgConnection) -> Result<Vec<ProvisionBucket>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM provision_buckets WHERE is_enabled ORDER BY currency_code, min_amount";
	sqlx::query_as(QUERY).fetch_all(ex).await
}

/// The narrowest enabled bucket covering `amount` in `currency`.
pub async fn bucket_for_amount(
	ex: &mut PgConnection,
	currency_code: &str,
	amount: &BigDecimal,
) -> Result<Option<ProvisionBucket>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM provision_buckets
WHERE currency_code = $1 AND is_enabled AND min_amount <= $2 AND max_amount >= $2
ORDER BY max_amount ASC
LIMIT 1
"#;
	sqlx::query_as(QUERY).bind(currency_code).bind(amount).fetch_optional(ex).await
}

/// Providers eligible for a bucket's queue: active, KYB-verified with an approved
/// owning user, publicly visible, available right now, with enough declared float in
/// the bucket's currency, configured for a token that is enabled on some network.
pub async fn eligible_providers_for_bucket(
	ex: &mut PgConnection,
	bucket_id: Uuid,
	currency_code: &str,
	bucket_min_amount: &BigDecimal,
) -> Result<Vec<EligibleProviderRow>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT DISTINCT
       pot.provider_id AS provider_id,
       pot.token_symbol,
       pot.conversion_rate_type,
       pot.fixed_conversion_rate,
       pot.floating_conversion_rate,
       pot.min_order_amount,
       pot.max_order_amount
FROM provision_bucket_providers bp
JOIN provider_profiles pp ON pp.id = bp.provider_id
JOIN provider_currencies pc ON pc.provider_id = pp.id AND pc.currency_code = $2
JOIN provider_order_tokens pot ON pot.provider_id = pp.id AND pot.currency_code = $2
JOIN tokens t ON t.symbol = pot.token_symbol AND t.is_enabled
WHERE bp.provision_bucket_id = $1
  AND pp.is_active
  AND pp.is_kyb_verified
  AND pp.kyb_status = 'approved'
  AND pp.visibility_mode = 'public'
  AND pp.is_available
  AND pc.is_available
  AND pc.available_balance >= $3
"#;
	sqlx::query_as(QUERY)
		.bind(bucket_id)
		.bind(currency_code)
		.bind(bucket_min_amount)
		.fetch_all(ex)
		.await
}

pub async fn single(
	ex: &mut PgConnection,
	provider_id: &str,
) -> Result<Option<ProviderProfile>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM provider_profiles WHERE id = $1";
	sqlx::query_as(QUERY).bind(provider_id).fetch_optional(ex).await
}

pub async fn all_active(ex: &mut PgConnection) -> Result<Vec<ProviderProfile>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM provider_profiles WHERE is_active";
	sqlx::query_as(QUERY).fetch_all(ex).await
}

pub async fn currency(
	ex: &mut PgConnection,
	code: &str,
) -> Result<Option<FiatCurrency>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM fiat_currencies WHERE code = $1";
	sqlx::query_as(QUERY).bind(code).fetch_optional(ex).await
}

pub async fn institution(
	ex: &mut PgConnection,
	code: &str,
) -> Result<Option<Institution>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM institutions WHERE code = $1";
	sqlx::query_as(QUERY).bind(code).fetch_optional(ex).await
}

pub async fn update_provider_balance(
	ex: &mut PgConnection,
	provider_id: &str,
	currency_code: &str,
	available_balance: &BigDecimal,
) -> Result<(), sqlx::Error> {
	const QUERY: &str = r#"
UPDATE provider_currencies
SET available_balance = $3, updated_at = now()
WHERE provider_id = $1 AND currency_code = $2
"#;
	sqlx::query(QUERY)
		.bind(provider_id)
		.bind(currency_code)
		.bind(available_balance)
		.execute(ex)
		.await?;
	Ok(())
}

pub async fn set_provider_available(
	ex: &mut PgConnection,
	provider_id: &str,
	is_available: bool,
) -> Result<(), sqlx::Error> {
	const QUERY: &str = r#"
UPDATE provider_profiles SET is_available = $2, updated_at = now() WHERE id = $1
"#;
	sqlx::query(QUERY).bind(provider_id).bind(is_available).execute(ex).await?;
	Ok(())
}
