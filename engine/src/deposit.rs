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

//! Deposit detection. Two independent paths — the address-activity webhook and the
//! balance poller — funnel into one guarded update that credits an order at most once
//! per deposit hash, with the unique transaction-log hash as the gate.

pub mod poller;
pub mod webhook;

use anyhow::{anyhow, Result};
use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use ethers::types::U256;
use tokio::sync::mpsc;

use crate::{
	constants::P2P_RATE_REFRESH_AGE,
	evm::{canonical_address, from_token_units, retry_rpc::EvmRetryRpcApi},
	orders::OrderEngine,
	store::{
		addresses,
		models::{LinkedAddress, PaymentOrder},
		networks, orders, providers, tx_logs, Store,
	},
};

/// Memo prefix marking peer-to-peer orders whose rate is re-quoted on late over-pays.
const P2P_MEMO_PREFIX: &str = "P#P";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepositSource {
	Webhook,
	Poll,
}

/// A normalised observation of tokens arriving at a watched address, from either
/// detection path.
#[derive(Clone, Debug)]
pub struct DepositObservation {
	pub network_identifier: String,
	pub to_address: String,
	pub from_address: Option<String>,
	pub tx_hash: Option<String>,
	pub block_number: Option<i64>,
	/// Token contract that moved, when the path knows it.
	pub token_contract: Option<String>,
	/// Raw integer token units.
	pub value: U256,
	/// Token decimals, when the path knows them; resolved from the DB otherwise.
	pub decimals: Option<u8>,
	pub source: DepositSource,
}

/// How an observed amount relates to what the order asked for.
#[derive(Clone, Debug, PartialEq)]
pub enum DepositOutcome {
	/// Within ±tolerance of the expected total: credited as exactly the required
	/// amount.
	WithinTolerance,
	/// Short, but still worth more than the fees: the order shrinks to what arrived.
	Underpaid { reduced_amount: BigDecimal },
	/// More than expected: credited in full, recorded as an over-pay.
	Overpaid,
	/// Not even covering fees; the order is left waiting.
	TooSmall,
}

pub fn tolerance(required: &BigDecimal) -> BigDecimal {
	required / BigDecimal::from(100)
}

pub fn classify_deposit(
	required: &BigDecimal,
	tolerance: &BigDecimal,
	fees: &BigDecimal,
	observed: &BigDecimal,
) -> DepositOutcome {
	if observed >= &(required - tolerance) && observed <= &(required + tolerance) {
		DepositOutcome::WithinTolerance
	} else if observed > required {
		DepositOutcome::Overpaid
	} else if observed > fees {
		DepositOutcome::Underpaid { reduced_amount: observed - fees }
	} else {
		DepositOutcome::TooSmall
	}
}

#[derive(Clone)]
pub struct DepositDetector<Rpc: EvmRetryRpcApi> {
	store: Store,
	engine: OrderEngine<Rpc>,
}

impl<Rpc: EvmRetryRpcApi> DepositDetector<Rpc> {
	pub fn new(store: Store, engine: OrderEngine<Rpc>) -> Self {
		Self { store, engine }
	}

	/// Worker loop draining the webhook channel. The webhook handler replies 200 as
	/// soon as the observation is queued; everything slow happens here.
	pub async fn run(self, mut receiver: mpsc::Receiver<DepositObservation>) -> Result<()> {
		while let Some(observation) = receiver.recv().await {
			if let Err(error) = self.process(observation).await {
				tracing::error!("Deposit observation failed: {error:#}");
			}
		}
		Ok(())
	}

	pub async fn process(&self, observation: DepositObservation) -> Result<()> {
		let address = canonical_address(&observation.to_address);

		// Fast dedup before any further work.
		if let Some(tx_hash) = &observation.tx_hash {
			let mut db = self.store.acquire().await?;
			if tx_logs::exists(&mut db, tx_hash).await? {
				return Ok(())
			}
		}

		let order = {
			let mut db = self.store.acquire().await?;
			orders::deposit_candidate(&mut db, &address, observation.tx_hash.as_deref()).await?
		};

		if let Some(order) = order {
			return self.credit_order(&order, &observation).await
		}

		let linked = {
			let mut db = self.store.acquire().await?;
			addresses::linked_by_address(&mut db, &address).await?
		};
		if let Some(linked) = linked {
			return self.ingest_linked_deposit(&linked, &observation).await
		}

		tracing::debug!("Deposit to unknown address {address}, ignoring");
		Ok(())
	}

	async fn observed_amount(
		&self,
		order: &PaymentOrder,
		observation: &DepositObservation,
	) -> Result<BigDecimal> {
		let mut db = self.store.acquire().await?;
		let token = networks::token_by_id(&mut db, order.token_id)
			.await?
			.ok_or_else(|| anyhow!("Order {} references unknown token", order.id))?;

		// A transfer of some other token into the receive address must not credit the
		// order.
		if let Some(contract) = &observation.token_contract {
			if canonical_address(contract) != canonical_address(&token.contract_address) {
				return Err(anyhow!(
					"Deposit is {} but order {} expects {}",
					contract,
					order.id,
					token.contract_address
				))
			}
		}

		let decimals = observation.decimals.unwrap_or(token.decimals as u8);
		from_token_units(observation.value, decimals)
	}

	/// The single guarded update shared by both detection paths.
	async fn credit_order(
		&self,
		order: &PaymentOrder,
		observation: &DepositObservation,
	) -> Result<()> {
		let observed = self.observed_amount(order, observation).await?;
		if observed <= order.amount_paid {
			// The poller reports whole balances; nothing new arrived.
			return Ok(())
		}

		let required = order.required_amount();
		let fees = order.total_fees();
		let tolerance = tolerance(&required);
		let outcome = classify_deposit(&required, &tolerance, &fees, &observed);

		let (amount_paid, new_amount) = match &outcome {
			DepositOutcome::WithinTolerance => (required.clone(), None),
			DepositOutcome::Underpaid { reduced_amount } =>
				(observed.clone(), Some(reduced_amount.clone())),
			DepositOutcome::Overpaid => (observed.clone(), None),
			DepositOutcome::TooSmall => {
				tracing::warn!(
					"Deposit of {observed} to order {} does not cover fees {fees}",
					order.id
				);
				return Ok(())
			},
		};

		// The poll path has no transfer hash; a deterministic surrogate keyed by the
		// observed balance dedups replays all the same.
		let tx_hash = observation
			.tx_hash
			.clone()
			.unwrap_or_else(|| format!("balance:{}:{}", order.id, observed.normalized()));

		let mut txn = self.store.begin().await?;
		if !tx_logs::insert_once(
			&mut *txn,
			&tx_logs::NewTransactionLog {
				payment_order_id: Some(order.id),
				gateway_id: None,
				status: "crypto_deposited",
				tx_hash: &tx_hash,
				network: &observation.network_identifier,
				metadata: serde_json::json!({
					"source": format!("{:?}", observation.source),
					"observed": observed.to_string(),
					"outcome": format!("{outcome:?}"),
				}),
			},
		)
		.await?
		{
			// A concurrent path already credited this deposit.
			txn.rollback().await?;
			return Ok(())
		}

		if !orders::apply_deposit(
			&mut *txn,
			order.id,
			&amount_paid,
			new_amount.as_ref(),
			&tx_hash,
			observation.from_address.as_deref(),
			observation.block_number,
		)
		.await?
		{
			txn.rollback().await?;
			return Ok(())
		}

		if let Some(receive_address_id) = order.receive_address_id {
			addresses::mark_used(&mut *txn, receive_address_id, &tx_hash, observation.block_number)
				.await?;
		}
		txn.commit().await?;

		tracing::info!(
			"Deposit of {observed} credited to order {} ({outcome:?})",
			order.id
		);

		if matches!(outcome, DepositOutcome::Overpaid) &&
			Utc::now().signed_duration_since(order.created_at).to_std().unwrap_or_default() >
				P2P_RATE_REFRESH_AGE &&
			order.memo.as_deref().is_some_and(|memo| memo.starts_with(P2P_MEMO_PREFIX))
		{
			if let Err(error) = self.engine.refresh_p2p_rate(order.id).await {
				tracing::warn!("P2P rate refresh for {} failed: {error:#}", order.id);
			}
		}

		// Hand off to the order engine; failure leaves the order pending for retry.
		if let Err(error) = self.engine.create_order(order.id).await {
			tracing::error!("createOrder handoff for {} failed: {error:#}", order.id);
		}
		Ok(())
	}

	/// A transfer into a linked address opens a brand-new order against its bound
	/// recipient. Deduplication runs on `(from_address, amount, last_indexed_block)`
	/// on top of the usual hash gate.
	async fn ingest_linked_deposit(
		&self,
		linked: &LinkedAddress,
		observation: &DepositObservation,
	) -> Result<()> {
		let mut db = self.store.acquire().await?;

		let Some(contract) = &observation.token_contract else {
			return Err(anyhow!("Linked deposit without a token contract"))
		};
		let Some(token) = networks::token_for_network_by_contract(
			&mut db,
			linked.network_id,
			&canonical_address(contract),
		)
		.await?
		else {
			tracing::debug!("Linked deposit in unsupported token {contract}, ignoring");
			return Ok(())
		};

		if observation.block_number.is_some() &&
			observation.block_number <= linked.last_indexed_block &&
			observation.tx_hash == linked.tx_hash
		{
			return Ok(())
		}

		let decimals = observation.decimals.unwrap_or(token.decimals as u8);
		let amount = from_token_units(observation.value, decimals)?;
		if amount <= BigDecimal::zero() {
			return Ok(())
		}

		let Some(institution) =
			providers::institution(&mut db, &linked.institution_code).await?
		else {
			return Err(anyhow!(
				"Linked address {} references unknown institution {}",
				linked.id,
				linked.institution_code
			))
		};
		let market_rate = providers::currency(&mut db, &institution.currency_code)
			.await?
			.map(|currency| currency.market_rate)
			.unwrap_or_else(BigDecimal::zero);
		let rate = self
			.engine
			.queue()
			.get_token_rate_from_queue(
				&token.symbol,
				&amount,
				&institution.currency_code,
				&market_rate,
			)
			.await?;

		let order_id = orders::insert(
			&mut db,
			&orders::NewPaymentOrder {
				token_id: token.id,
				amount: amount.clone(),
				rate,
				sender_fee: BigDecimal::zero(),
				network_fee: BigDecimal::zero(),
				protocol_fee: BigDecimal::zero(),
				receive_address_id: None,
				receive_address_text: linked.address.clone(),
				linked_address_id: Some(linked.id),
				return_address: Some(linked.address.clone()),
				sender_fee_recipient: None,
				message_hash: String::new(),
				memo: None,
			},
		)
		.await?;
		orders::insert_recipient(
			&mut db,
			&crate::store::models::Recipient {
				payment_order_id: order_id,
				institution_code: linked.institution_code.clone(),
				account_identifier: linked.account_identifier.clone(),
				account_name: linked.account_name.clone(),
				currency_code: institution.currency_code.clone(),
				memo: None,
			},
		)
		.await?;

		if let (Some(block), Some(tx_hash)) = (observation.block_number, &observation.tx_hash) {
			addresses::update_linked_index(&mut db, linked.id, block, tx_hash).await?;
		}
		drop(db);

		let order = {
			let mut db = self.store.acquire().await?;
			orders::single(&mut db, order_id)
				.await?
				.ok_or_else(|| anyhow!("Linked order {order_id} vanished"))?
		};
		self.credit_order(&order, observation).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	fn decimal(s: &str) -> BigDecimal {
		BigDecimal::from_str(s).unwrap()
	}

	#[test]
	fn exact_payment_is_within_tolerance() {
		let required = decimal("1.00");
		let tol = tolerance(&required);
		assert_eq!(
			classify_deposit(&required, &tol, &decimal("0.05"), &decimal("1.00")),
			DepositOutcome::WithinTolerance
		);
	}

	#[test]
	fn boundary_exactly_required_minus_tolerance_is_accepted() {
		let required = decimal("1.00");
		let tol = tolerance(&required);
		assert_eq!(tol, decimal("0.01"));
		assert_eq!(
			classify_deposit(&required, &tol, &decimal("0.05"), &decimal("0.99")),
			DepositOutcome::WithinTolerance
		);
	}

	#[test]
	fn boundary_one_wei_above_tolerance_is_an_overpay() {
		let required = decimal("1.00");
		let tol = tolerance(&required);
		assert_eq!(
			classify_deposit(
				&required,
				&tol,
				&decimal("0.05"),
				&decimal("1.010000000000000001")
			),
			DepositOutcome::Overpaid
		);
	}

	#[test]
	fn underpay_becomes_a_smaller_order() {
		// required = 1.00, observed = 0.50: the order shrinks to observed - fees.
		let required = decimal("1.00");
		let tol = tolerance(&required);
		assert_eq!(
			classify_deposit(&required, &tol, &decimal("0.05"), &decimal("0.50")),
			DepositOutcome::Underpaid { reduced_amount: decimal("0.45") }
		);
	}

	#[test]
	fn fees_plus_one_unit_is_still_an_order() {
		// required > 2*fees + 1 wei, observed = fees + 1 wei.
		let required = decimal("1.00");
		let tol = tolerance(&required);
		let fees = decimal("0.05");
		assert_eq!(
			classify_deposit(&required, &tol, &fees, &decimal("0.050000000000000001")),
			DepositOutcome::Underpaid { reduced_amount: decimal("0.000000000000000001") }
		);
	}

	#[test]
	fn dust_below_fees_is_too_small() {
		let required = decimal("1.00");
		let tol = tolerance(&required);
		assert_eq!(
			classify_deposit(&required, &tol, &decimal("0.05"), &decimal("0.04")),
			DepositOutcome::TooSmall
		);
	}
}
