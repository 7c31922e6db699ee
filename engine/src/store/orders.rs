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

use super::models::{DepositPollTarget, LockPaymentOrder, PaymentOrder, Recipient};
use sqlx::{
	types::{BigDecimal, Uuid},
	PgConnection,
};

pub struct NewPaymentOrder {
	pub token_id: Uuid,
	pub amount: BigDecimal,
	pub rate: BigDecimal,
	pub sender_fee: BigDecimal,
	pub network_fee: BigDecimal,
	pub protocol_fee: BigDecimal,
	pub receive_address_id: Option<Uuid>,
	pub receive_address_text: String,
	pub linked_address_id: Option<Uuid>,
	pub return_address: Option<String>,
	pub sender_fee_recipient: Option<String>,
	pub message_hash: String,
	pub memo: Option<String>,
}

pub async fn insert(
	ex: &mut PgConnection,
	order: &NewPaymentOrder,
) -> Result<Uuid, sqlx::Error> {
	const QUERY: &str = r#"
INSERT INTO payment_orders (
    token_id,
    amount,
    rate,
    sender_fee,
    network_fee,
    protocol_fee,
    receive_address_id,
    receive_address_text,
    linked_address_id,
    return_address,
    sender_fee_recipient,
    message_hash,
    memo
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
RETURNING id
"#;
	sqlx::query_scalar(QUERY)
		.bind(order.token_id)
		.bind(&order.amount)
		.bind(&order.rate)
		.bind(&order.sender_fee)
		.bind(&order.network_fee)
		.bind(&order.protocol_fee)
		.bind(order.receive_address_id)
		.bind(&order.receive_address_text)
		.bind(order.linked_address_id)
		.bind(&order.return_address)
		.bind(&order.sender_fee_recipient)
		.bind(&order.message_hash)
		.bind(&order.memo)
		.fetch_one(ex)
		.await
}

pub async fn insert_recipient(
	ex: &mut PgConnection,
	recipient: &Recipient,
) -> Result<(), sqlx::Error> {
	const QUERY: &str = r#"
INSERT INTO payment_order_recipients (
    payment_order_id, institution_code, account_identifier, account_name, currency_code, memo
)
VALUES ($1, $2, $3, $4, $5, $6)
"#;
	sqlx::query(QUERY)
		.bind(recipient.payment_order_id)
		.bind(&recipient.institution_code)
		.bind(&recipient.account_identifier)
		.bind(&recipient.account_name)
		.bind(&recipient.currency_code)
		.bind(&recipient.memo)
		.execute(ex)
		.await?;
	Ok(())
}

pub async fn single(
	ex: &mut PgConnection,
	id: Uuid,
) -> Result<Option<PaymentOrder>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM payment_orders WHERE id = $1";
	sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

pub async fn recipient(
	ex: &mut PgConnection,
	order_id: Uuid,
) -> Result<Option<Recipient>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM payment_order_recipients WHERE payment_order_id = $1";
	sqlx::query_as(QUERY).bind(order_id).fetch_optional(ex).await
}

/// The order a deposit to `address` can fund: still awaiting its deposit, and either
/// hashless or already bound to this same transaction.
pub async fn deposit_candidate(
	ex: &mut PgConnection,
	address_lowercase: &str,
	tx_hash: Option<&str>,
) -> Result<Option<PaymentOrder>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM payment_orders
WHERE status = 'initiated'
  AND LOWER(receive_address_text) = $1
  AND (tx_hash IS NULL OR tx_hash = $2)
ORDER BY created_at ASC
LIMIT 1
"#;
	sqlx::query_as(QUERY)
		.bind(address_lowercase)
		.bind(tx_hash)
		.fetch_optional(ex)
		.await
}

/// The single deposit-crediting update. `new_amount` rewrites the order amount for
/// under-pays. Guarded by the `initiated` status so it applies at most once.
#[allow(clippy::too_many_arguments)]
pub async fn apply_deposit(
	ex: &mut PgConnection,
	order_id: Uuid,
	amount_paid: &BigDecimal,
	new_amount: Option<&BigDecimal>,
	tx_hash: &str,
	from_address: Option<&str>,
	block_number: Option<i64>,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE payment_orders
SET amount_paid = $2,
    amount = COALESCE($3, amount),
    status = 'pending',
    tx_hash = $4,
    from_address = $5,
    block_number = $6,
    updated_at = now()
WHERE id = $1 AND status = 'initiated'
"#;
	Ok(sqlx::query(QUERY)
		.bind(order_id)
		.bind(amount_paid)
		.bind(new_amount)
		.bind(tx_hash)
		.bind(from_address)
		.bind(block_number)
		.execute(ex)
		.await?
		.rows_affected() >
		0)
}

pub async fn set_message_hash(
	ex: &mut PgConnection,
	order_id: Uuid,
	message_hash: &str,
) -> Result<(), sqlx::Error> {
	const QUERY: &str =
		"UPDATE payment_orders SET message_hash = $2, updated_at = now() WHERE id = $1";
	sqlx::query(QUERY).bind(order_id).bind(message_hash).execute(ex).await?;
	Ok(())
}

pub async fn mark_processing(ex: &mut PgConnection, order_id: Uuid) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE payment_orders SET status = 'processing', updated_at = now()
WHERE id = $1 AND status = 'pending'
"#;
	Ok(sqlx::query(QUERY).bind(order_id).execute(ex).await?.rows_affected() > 0)
}

/// Links the on-chain order id to the order carrying `message_hash`. Returns the
/// order id, or `None` when the hash is unknown (an orphaned event).
pub async fn set_gateway_id(
	ex: &mut PgConnection,
	message_hash: &str,
	gateway_id: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE payment_orders SET gateway_id = $2, updated_at = now()
WHERE message_hash = $1 AND gateway_id IS NULL
RETURNING id
"#;
	sqlx::query_scalar(QUERY).bind(message_hash).bind(gateway_id).fetch_optional(ex).await
}

pub async fn by_gateway_id(
	ex: &mut PgConnection,
	gateway_id: &str,
) -> Result<Option<PaymentOrder>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM payment_orders WHERE gateway_id = $1";
	sqlx::query_as(QUERY).bind(gateway_id).fetch_optional(ex).await
}

pub async fn mark_validated(ex: &mut PgConnection, order_id: Uuid) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE payment_orders SET status = 'validated', validated_at = now(), updated_at = now()
WHERE id = $1 AND status = 'processing'
"#;
	Ok(sqlx::query(QUERY).bind(order_id).execute(ex).await?.rows_affected() > 0)
}

pub async fn mark_settled(ex: &mut PgConnection, order_id: Uuid) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE payment_orders SET status = 'settled', updated_at = now()
WHERE id = $1 AND status IN ('processing', 'validated')
"#;
	Ok(sqlx::query(QUERY).bind(order_id).execute(ex).await?.rows_affected() > 0)
}

pub async fn mark_refunded(
	ex: &mut PgConnection,
	order_id: Uuid,
	amount_returned: &BigDecimal,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE payment_orders SET status = 'refunded', amount_returned = $2, updated_at = now()
WHERE id = $1 AND status IN ('pending', 'processing', 'validated')
"#;
	Ok(sqlx::query(QUERY)
		.bind(order_id)
		.bind(amount_returned)
		.execute(ex)
		.await?
		.rows_affected() >
		0)
}

pub async fn mark_expired(ex: &mut PgConnection, order_id: Uuid) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE payment_orders SET status = 'expired', updated_at = now()
WHERE id = $1 AND status = 'initiated'
"#;
	Ok(sqlx::query(QUERY).bind(order_id).execute(ex).await?.rows_affected() > 0)
}

pub async fn refresh_rate(
	ex: &mut PgConnection,
	order_id: Uuid,
	rate: &BigDecimal,
) -> Result<(), sqlx::Error> {
	const QUERY: &str = "UPDATE payment_orders SET rate = $2, updated_at = now() WHERE id = $1";
	sqlx::query(QUERY).bind(order_id).bind(rate).execute(ex).await?;
	Ok(())
}

pub async fn deposit_poll_targets(
	ex: &mut PgConnection,
	min_age_seconds: f64,
) -> Result<Vec<DepositPollTarget>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT p.id AS order_id,
       p.receive_address_text,
       t.contract_address AS token_contract_address,
       t.decimals AS token_decimals,
       n.identifier AS network_identifier,
       p.amount_paid
FROM payment_orders p
JOIN tokens t ON t.id = p.token_id
JOIN networks n ON n.id = t.network_id
WHERE p.status = 'initiated'
  AND p.created_at <= now() - make_interval(secs => $1)
"#;
	sqlx::query_as(QUERY).bind(min_age_seconds).fetch_all(ex).await
}

/// Orders that received their deposit but whose on-chain creation has not gone out
/// yet (or failed and is due a retry on the next tick).
pub async fn pending_orders(ex: &mut PgConnection) -> Result<Vec<PaymentOrder>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM payment_orders WHERE status = 'pending'";
	sqlx::query_as(QUERY).fetch_all(ex).await
}

/// Escrowed orders still waiting for a provider: no lock rows yet, typically because
/// no eligible provider was queued when `OrderCreated` arrived.
pub async fn processing_orders_without_locks(
	ex: &mut PgConnection,
) -> Result<Vec<PaymentOrder>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT p.* FROM payment_orders p
WHERE p.status = 'processing'
  AND p.gateway_id IS NOT NULL
  AND NOT EXISTS (SELECT 1 FROM lock_payment_orders l WHERE l.payment_order_id = p.id)
"#;
	sqlx::query_as(QUERY).fetch_all(ex).await
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ExpiredOrderRow {
	pub order_id: Uuid,
	pub receive_address_id: Uuid,
}

/// Orders whose fallback-minted receive address ran out of validity with no deposit.
pub async fn initiated_orders_with_expired_addresses(
	ex: &mut PgConnection,
) -> Result<Vec<ExpiredOrderRow>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT p.id AS order_id, r.id AS receive_address_id
FROM payment_orders p
JOIN receive_addresses r ON r.id = p.receive_address_id
WHERE p.status = 'initiated'
  AND r.valid_until IS NOT NULL
  AND r.valid_until < now()
"#;
	sqlx::query_as(QUERY).fetch_all(ex).await
}

// ===== Lock payment orders =====

pub struct NewLockPaymentOrder {
	pub payment_order_id: Uuid,
	pub gateway_id: String,
	pub split_index: i32,
	pub amount: BigDecimal,
	pub rate: BigDecimal,
	pub provider_id: Option<String>,
	pub provision_bucket_id: Option<Uuid>,
	pub message_hash: String,
}

pub async fn insert_lock(
	ex: &mut PgConnection,
	lock: &NewLockPaymentOrder,
) -> Result<Uuid, sqlx::Error> {
	const QUERY: &str = r#"
INSERT INTO lock_payment_orders (
    payment_order_id, gateway_id, split_index, amount, rate, provider_id, provision_bucket_id, message_hash
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING id
"#;
	sqlx::query_scalar(QUERY)
		.bind(lock.payment_order_id)
		.bind(&lock.gateway_id)
		.bind(lock.split_index)
		.bind(&lock.amount)
		.bind(&lock.rate)
		.bind(&lock.provider_id)
		.bind(lock.provision_bucket_id)
		.bind(&lock.message_hash)
		.fetch_one(ex)
		.await
}

pub async fn single_lock(
	ex: &mut PgConnection,
	lock_id: Uuid,
) -> Result<Option<LockPaymentOrder>, sqlx::Error> {
	const QUERY: &str = "SELECT * FROM lock_payment_orders WHERE id = $1";
	sqlx::query_as(QUERY).bind(lock_id).fetch_optional(ex).await
}

pub async fn locks_for_order(
	ex: &mut PgConnection,
	payment_order_id: Uuid,
) -> Result<Vec<LockPaymentOrder>, sqlx::Error> {
	const QUERY: &str =
		"SELECT * FROM lock_payment_orders WHERE payment_order_id = $1 ORDER BY split_index";
	sqlx::query_as(QUERY).bind(payment_order_id).fetch_all(ex).await
}

pub async fn locks_for_gateway(
	ex: &mut PgConnection,
	gateway_id: &str,
) -> Result<Vec<LockPaymentOrder>, sqlx::Error> {
	const QUERY: &str =
		"SELECT * FROM lock_payment_orders WHERE gateway_id = $1 ORDER BY split_index";
	sqlx::query_as(QUERY).bind(gateway_id).fetch_all(ex).await
}

pub async fn mark_lock_validated(
	ex: &mut PgConnection,
	lock_id: Uuid,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE lock_payment_orders SET status = 'validated', updated_at = now()
WHERE id = $1 AND status = 'pending'
"#;
	Ok(sqlx::query(QUERY).bind(lock_id).execute(ex).await?.rows_affected() > 0)
}

pub async fn mark_lock_settled(ex: &mut PgConnection, lock_id: Uuid) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE lock_payment_orders SET status = 'settled', updated_at = now()
WHERE id = $1 AND status IN ('pending', 'validated')
"#;
	Ok(sqlx::query(QUERY).bind(lock_id).execute(ex).await?.rows_affected() > 0)
}

pub async fn mark_lock_cancelled(
	ex: &mut PgConnection,
	lock_id: Uuid,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE lock_payment_orders SET status = 'cancelled', updated_at = now()
WHERE id = $1 AND status = 'pending'
"#;
	Ok(sqlx::query(QUERY).bind(lock_id).execute(ex).await?.rows_affected() > 0)
}

pub async fn mark_locks_refunded_for_gateway(
	ex: &mut PgConnection,
	gateway_id: &str,
) -> Result<u64, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE lock_payment_orders SET status = 'refunded', updated_at = now()
WHERE gateway_id = $1 AND status NOT IN ('settled', 'refunded')
"#;
	Ok(sqlx::query(QUERY).bind(gateway_id).execute(ex).await?.rows_affected())
}

/// Re-assigns a cancelled lock to the next provider and puts it back in flight.
pub async fn reassign_lock(
	ex: &mut PgConnection,
	lock_id: Uuid,
	provider_id: &str,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE lock_payment_orders SET status = 'pending', provider_id = $2, updated_at = now()
WHERE id = $1 AND status = 'cancelled'
"#;
	Ok(sqlx::query(QUERY).bind(lock_id).bind(provider_id).execute(ex).await?.rows_affected() > 0)
}

pub async fn increment_cancellation(
	ex: &mut PgConnection,
	lock_id: Uuid,
) -> Result<i32, sqlx::Error> {
	const QUERY: &str = r#"
UPDATE lock_payment_orders
SET cancellation_count = cancellation_count + 1, updated_at = now()
WHERE id = $1
RETURNING cancellation_count
"#;
	sqlx::query_scalar(QUERY).bind(lock_id).fetch_one(ex).await
}

pub async fn stale_pending_locks(
	ex: &mut PgConnection,
	validity_seconds: f64,
) -> Result<Vec<LockPaymentOrder>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM lock_payment_orders
WHERE status = 'pending' AND updated_at <= now() - make_interval(secs => $1)
"#;
	sqlx::query_as(QUERY).bind(validity_seconds).fetch_all(ex).await
}

/// Cancelled locks whose order is still in flight and whose cancellation budget is
/// not yet spent; candidates for re-offering to the next provider.
pub async fn reofferable_cancelled_locks(
	ex: &mut PgConnection,
	max_cancellations: i32,
) -> Result<Vec<LockPaymentOrder>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT l.* FROM lock_payment_orders l
JOIN payment_orders p ON p.id = l.payment_order_id
WHERE l.status = 'cancelled'
  AND l.cancellation_count <= $1
  AND p.status IN ('processing', 'validated')
"#;
	sqlx::query_as(QUERY).bind(max_cancellations).fetch_all(ex).await
}

pub async fn pending_locks_with_provider(
	ex: &mut PgConnection,
) -> Result<Vec<LockPaymentOrder>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM lock_payment_orders
WHERE status = 'pending' AND provider_id IS NOT NULL
"#;
	sqlx::query_as(QUERY).fetch_all(ex).await
}

pub async fn oldest_validated_lock_for_gateway(
	ex: &mut PgConnection,
	gateway_id: &str,
) -> Result<Option<LockPaymentOrder>, sqlx::Error> {
	const QUERY: &str = r#"
SELECT * FROM lock_payment_orders
WHERE gateway_id = $1 AND status = 'validated'
ORDER BY split_index ASC
LIMIT 1
"#;
	sqlx::query_as(QUERY).bind(gateway_id).fetch_optional(ex).await
}

/// True when every lock of the order is settled (and there is at least one).
pub async fn all_locks_settled(
	ex: &mut PgConnection,
	payment_order_id: Uuid,
) -> Result<bool, sqlx::Error> {
	const QUERY: &str = r#"
SELECT COALESCE(bool_and(status = 'settled'), false) FROM lock_payment_orders
WHERE payment_order_id = $1
"#;
	sqlx::query_scalar(QUERY).bind(payment_order_id).fetch_one(ex).await
}

pub async fn settled_lock_amount(
	ex: &mut PgConnection,
	payment_order_id: Uuid,
) -> Result<BigDecimal, sqlx::Error> {
	const QUERY: &str = r#"
SELECT COALESCE(SUM(amount) FILTER (WHERE status = 'settled'), 0) FROM lock_payment_orders
WHERE payment_order_id = $1
"#;
	sqlx::query_scalar(QUERY).bind(payment_order_id).fetch_one(ex).await
}
