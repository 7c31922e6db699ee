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

use sqlx::types::{
	chrono::{DateTime, Utc},
	BigDecimal, Uuid,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "payment_order_status")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentOrderStatus {
	#[default]
	Initiated,
	Pending,
	Validated,
	Processing,
	Settled,
	Refunded,
	Expired,
}

impl PaymentOrderStatus {
	/// Refunded and expired are terminal; settled only transitions out via nothing.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Settled | Self::Refunded | Self::Expired)
	}
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "receive_address_status")]
#[sqlx(rename_all = "snake_case")]
pub enum ReceiveAddressStatus {
	#[default]
	Unused,
	PoolReady,
	PoolAssigned,
	Used,
	Expired,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "lock_order_status")]
#[sqlx(rename_all = "snake_case")]
pub enum LockOrderStatus {
	#[default]
	Pending,
	Cancelled,
	Validated,
	Settled,
	Refunded,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "provider_visibility")]
#[sqlx(rename_all = "snake_case")]
pub enum ProviderVisibility {
	#[default]
	Public,
	Private,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "conversion_rate_type")]
#[sqlx(rename_all = "snake_case")]
pub enum ConversionRateType {
	Fixed,
	#[default]
	Floating,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "institution_type")]
#[sqlx(rename_all = "snake_case")]
pub enum InstitutionType {
	#[default]
	Bank,
	MobileMoney,
}

/// One row in the `payment_orders` table.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct PaymentOrder {
	pub id: Uuid,
	pub token_id: Uuid,
	pub amount: BigDecimal,
	pub amount_paid: BigDecimal,
	pub amount_returned: BigDecimal,
	pub sender_fee: BigDecimal,
	pub network_fee: BigDecimal,
	pub protocol_fee: BigDecimal,
	pub rate: BigDecimal,
	pub status: PaymentOrderStatus,
	pub from_address: Option<String>,
	pub tx_hash: Option<String>,
	pub block_number: Option<i64>,
	pub receive_address_id: Option<Uuid>,
	pub receive_address_text: String,
	pub linked_address_id: Option<Uuid>,
	pub return_address: Option<String>,
	pub sender_fee_recipient: Option<String>,
	pub message_hash: String,
	pub gateway_id: Option<String>,
	pub memo: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub validated_at: Option<DateTime<Utc>>,
}

impl PaymentOrder {
	/// The total the sender is expected to deposit.
	pub fn required_amount(&self) -> BigDecimal {
		&self.amount + &self.sender_fee + &self.network_fee + &self.protocol_fee
	}

	pub fn total_fees(&self) -> BigDecimal {
		&self.sender_fee + &self.network_fee + &self.protocol_fee
	}
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ReceiveAddress {
	pub id: Uuid,
	pub address: String,
	pub salt_encrypted: Option<String>,
	pub status: ReceiveAddressStatus,
	pub valid_until: Option<DateTime<Utc>>,
	pub is_deployed: bool,
	pub factory_address: Option<String>,
	pub owner_address: Option<String>,
	pub deployment_tx_hash: Option<String>,
	pub network_id: Uuid,
	pub times_used: i32,
	pub assigned_at: Option<DateTime<Utc>>,
	pub last_used: Option<DateTime<Utc>>,
	pub recycled_at: Option<DateTime<Utc>>,
	pub last_indexed_block: Option<i64>,
	pub tx_hash: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl ReceiveAddress {
	/// Pool addresses never expire by time; only fallback-minted ones carry a
	/// deadline.
	pub fn is_pool_address(&self) -> bool {
		self.valid_until.is_none()
	}
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct LinkedAddress {
	pub id: Uuid,
	pub address: String,
	pub owner_address: String,
	pub salt_encrypted: Option<String>,
	pub private_key_encrypted: Option<String>,
	pub network_id: Uuid,
	pub institution_code: String,
	pub account_identifier: String,
	pub account_name: String,
	pub last_indexed_block: Option<i64>,
	pub tx_hash: Option<String>,
	pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct LockPaymentOrder {
	pub id: Uuid,
	pub payment_order_id: Uuid,
	pub gateway_id: String,
	pub split_index: i32,
	pub amount: BigDecimal,
	pub rate: BigDecimal,
	pub status: LockOrderStatus,
	pub provider_id: Option<String>,
	pub provision_bucket_id: Option<Uuid>,
	pub cancellation_count: i32,
	pub message_hash: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ProviderProfile {
	pub id: String,
	pub host_identifier: String,
	pub settlement_address: Option<String>,
	pub secret_key_encrypted: Option<String>,
	pub is_active: bool,
	pub is_available: bool,
	pub is_kyb_verified: bool,
	pub kyb_status: String,
	pub visibility_mode: ProviderVisibility,
	pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ProvisionBucket {
	pub id: Uuid,
	pub currency_code: String,
	pub min_amount: BigDecimal,
	pub max_amount: BigDecimal,
	pub is_enabled: bool,
	pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Network {
	pub id: Uuid,
	pub chain_id: i64,
	pub identifier: String,
	pub rpc_endpoint: String,
	pub gateway_contract_address: String,
	pub bundler_url: Option<String>,
	pub paymaster_url: Option<String>,
	pub fee: BigDecimal,
	pub block_time_seconds: i64,
	pub last_indexed_block: i64,
	pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Token {
	pub id: Uuid,
	pub symbol: String,
	pub contract_address: String,
	pub decimals: i16,
	pub base_currency: String,
	pub is_enabled: bool,
	pub network_id: Uuid,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct FiatCurrency {
	pub id: Uuid,
	pub code: String,
	pub name: String,
	pub market_rate: BigDecimal,
	pub is_enabled: bool,
	pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Institution {
	pub id: Uuid,
	pub code: String,
	pub name: String,
	#[sqlx(rename = "type")]
	pub institution_type: InstitutionType,
	pub currency_code: String,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Recipient {
	pub payment_order_id: Uuid,
	pub institution_code: String,
	pub account_identifier: String,
	pub account_name: String,
	pub currency_code: String,
	pub memo: Option<String>,
}

/// Eligible queue material for one provider in one bucket: the flattened join of
/// profile, currency float and token configuration.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct EligibleProviderRow {
	pub provider_id: String,
	pub token_symbol: String,
	pub conversion_rate_type: ConversionRateType,
	pub fixed_conversion_rate: BigDecimal,
	pub floating_conversion_rate: BigDecimal,
	pub min_order_amount: BigDecimal,
	pub max_order_amount: BigDecimal,
}

/// What the deposit poller needs to check one order with a single `eth_call`.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct DepositPollTarget {
	pub order_id: Uuid,
	pub receive_address_text: String,
	pub token_contract_address: String,
	pub token_decimals: i16,
	pub network_identifier: String,
	pub amount_paid: BigDecimal,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn terminal_statuses() {
		assert!(PaymentOrderStatus::Settled.is_terminal());
		assert!(PaymentOrderStatus::Refunded.is_terminal());
		assert!(PaymentOrderStatus::Expired.is_terminal());
		assert!(!PaymentOrderStatus::Processing.is_terminal());
		assert!(!PaymentOrderStatus::Initiated.is_terminal());
	}

	#[test]
	fn required_amount_sums_amount_and_fees() {
		let order = PaymentOrder {
			id: Uuid::nil(),
			token_id: Uuid::nil(),
			amount: BigDecimal::from(100),
			amount_paid: BigDecimal::from(0),
			amount_returned: BigDecimal::from(0),
			sender_fee: BigDecimal::from(2),
			network_fee: BigDecimal::from(1),
			protocol_fee: BigDecimal::from(1),
			rate: BigDecimal::from(1500),
			status: PaymentOrderStatus::Initiated,
			from_address: None,
			tx_hash: None,
			block_number: None,
			receive_address_id: None,
			receive_address_text: String::new(),
			linked_address_id: None,
			return_address: None,
			sender_fee_recipient: None,
			message_hash: String::new(),
			gateway_id: None,
			memo: None,
			created_at: Utc::now(),
			updated_at: Utc::now(),
			validated_at: None,
		};

		assert_eq!(order.required_amount(), BigDecimal::from(104));
		assert_eq!(order.total_fees(), BigDecimal::from(4));
	}
}
