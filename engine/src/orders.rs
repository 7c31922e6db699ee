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

//! The order lifecycle engine: deposit → on-chain escrow → provider locks →
//! settlement or refund. Per-order ordering is enforced by the unique transaction-log
//! hash, status-guarded row updates, and the unique gateway id; the engine itself is
//! free to process different orders concurrently.

pub mod split;

use anyhow::{anyhow, Context, Result};
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use ethers::{
	abi::AbiEncode,
	signers::{LocalWallet, Signer},
	types::{Bytes, U256},
	utils::keccak256,
};
use sqlx::types::Uuid;
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
	aa::{ContractCall, ExecutionSender, SponsoredExecutionApi},
	address_pool::AddressPool,
	crypto::Cipher,
	evm::{
		canonical_address,
		contracts::{erc_20 as erc20, gateway},
		event::Event,
		from_token_units, parse_address,
		retry_rpc::EvmRetryRpcApi,
		to_token_units,
	},
	provider_client::{AssignmentOutcome, OrderAssignment, ProviderClient, SettleProof},
	queue::{bucket_key, ProvisionQueue, QueueEntry},
	store::{
		addresses, is_duplicate_record_error,
		models::{
			LockOrderStatus, LockPaymentOrder, Network, PaymentOrder, PaymentOrderStatus,
			ProviderProfile, Token,
		},
		networks, orders, providers, tx_logs, Store,
	},
};
use gateway::{OrderCreatedFilter, OrderRefundedFilter, OrderSettledFilter};
use split::plan_locks;

/// The Gateway carries rates as uint96 with two implied decimals.
const RATE_DECIMALS: u32 = 2;

/// How many heads are pulled from a bucket rotation before giving up on covering an
/// order.
const MAX_SPLIT_PROVIDERS: usize = 10;

pub fn gateway_id_hex(order_id: [u8; 32]) -> String {
	format!("0x{}", hex::encode(order_id))
}

pub fn parse_gateway_id(gateway_id: &str) -> Result<[u8; 32]> {
	let bytes = hex::decode(gateway_id.trim_start_matches("0x"))
		.with_context(|| format!("Gateway id {gateway_id} is not hex"))?;
	bytes.try_into().map_err(|_| anyhow!("Gateway id {gateway_id} is not 32 bytes"))
}

pub fn rate_to_uint96(rate: &BigDecimal) -> Result<u128> {
	(rate * BigDecimal::from(10u64.pow(RATE_DECIMALS)))
		.with_scale(0)
		.to_u128()
		.ok_or_else(|| anyhow!("Rate {rate} does not fit on-chain"))
}

/// The message hash binding a PaymentOrder to its on-chain order.
pub fn compute_message_hash(order_id: Uuid, receive_address: &str) -> String {
	let mut preimage = order_id.as_bytes().to_vec();
	preimage.extend_from_slice(canonical_address(receive_address).as_bytes());
	hex::encode(keccak256(preimage))
}

/// Everything the engine needs to act on one network.
#[derive(Clone)]
pub struct NetworkRuntime<Rpc: EvmRetryRpcApi> {
	pub network: Network,
	pub rpc: Rpc,
	pub executor: Arc<dyn SponsoredExecutionApi>,
}

#[derive(Clone)]
pub struct EngineConfig {
	pub order_fulfillment_validity: Duration,
	pub refund_cancellation_count: i32,
}

#[derive(Clone)]
pub struct OrderEngine<Rpc: EvmRetryRpcApi> {
	store: Store,
	queue: ProvisionQueue,
	provider_client: ProviderClient,
	address_pool: AddressPool,
	cipher: Cipher,
	operator: LocalWallet,
	networks: Arc<HashMap<Uuid, NetworkRuntime<Rpc>>>,
	config: EngineConfig,
}

impl<Rpc: EvmRetryRpcApi> OrderEngine<Rpc> {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Store,
		queue: ProvisionQueue,
		provider_client: ProviderClient,
		address_pool: AddressPool,
		cipher: Cipher,
		operator: LocalWallet,
		networks: Arc<HashMap<Uuid, NetworkRuntime<Rpc>>>,
		config: EngineConfig,
	) -> Self {
		Self { store, queue, provider_client, address_pool, cipher, operator, networks, config }
	}

	pub fn address_pool(&self) -> &AddressPool {
		&self.address_pool
	}

	pub fn queue(&self) -> &ProvisionQueue {
		&self.queue
	}

	pub fn networks(&self) -> &HashMap<Uuid, NetworkRuntime<Rpc>> {
		&self.networks
	}

	fn runtime(&self, network_id: Uuid) -> Result<&NetworkRuntime<Rpc>> {
		self.networks
			.get(&network_id)
			.ok_or_else(|| anyhow!("No runtime wired for network {network_id}"))
	}

	fn operator_sender(&self) -> ExecutionSender {
		ExecutionSender::Eoa { wallet: self.operator.clone() }
	}

	async fn order_context(&self, order: &PaymentOrder) -> Result<(Token, Network)> {
		let mut db = self.store.acquire().await?;
		let token = networks::token_by_id(&mut db, order.token_id)
			.await?
			.ok_or_else(|| anyhow!("Order {} references unknown token", order.id))?;
		let network = networks::single(&mut db, token.network_id)
			.await?
			.ok_or_else(|| anyhow!("Token {} references unknown network", token.id))?;
		Ok((token, network))
	}

	/// Classifies how a receive address signs: an encrypted salt marks a smart
	/// account even before deployment; a deployed account without a salt is still a
	/// smart account. An undeployed address without a salt cannot sign anything and
	/// is quarantined for manual review.
	fn execution_sender_for_receive_address(
		&self,
		receive: &crate::store::models::ReceiveAddress,
	) -> Result<ExecutionSender> {
		let address = parse_address(&receive.address)?;
		match self.address_pool.decrypt_salt(receive)? {
			Some(salt) =>
				Ok(ExecutionSender::SmartAccount { address, owner: self.operator.clone(), salt }),
			None if receive.is_deployed => Ok(ExecutionSender::SmartAccount {
				address,
				owner: self.operator.clone(),
				salt: U256::zero(),
			}),
			None => Err(anyhow!(
				"Receive address {} has no salt and no deployment; cannot sign",
				receive.id
			)),
		}
	}

	/// Linked addresses escrow from their own raw key.
	fn execution_sender_for_linked_address(
		&self,
		linked: &crate::store::models::LinkedAddress,
	) -> Result<ExecutionSender> {
		let Some(encrypted) = linked.private_key_encrypted.as_deref() else {
			return Err(anyhow!("Linked address {} has no signing key", linked.id))
		};
		let key = self
			.cipher
			.decrypt_from_hex(encrypted)
			.with_context(|| format!("Bad key for linked address {}", linked.id))?;
		let wallet = LocalWallet::from_bytes(&key)
			.with_context(|| format!("Invalid key for linked address {}", linked.id))?;
		Ok(ExecutionSender::Eoa { wallet })
	}

	// ===== pending → processing =====

	/// Moves a funded order into on-chain escrow: approve + createOrder batched from
	/// the receive address. Failures leave the order `pending` for the next tick.
	pub async fn create_order(&self, order_id: Uuid) -> Result<()> {
		let mut db = self.store.acquire().await?;
		let Some(order) = orders::single(&mut db, order_id).await? else {
			return Err(anyhow!("Unknown order {order_id}"))
		};
		if order.status != PaymentOrderStatus::Pending {
			return Ok(())
		}

		let (token, network) = self.order_context(&order).await?;
		let runtime = self.runtime(network.id)?;

		let mut undeployed_receive_address = None;
		let sender = if let Some(id) = order.receive_address_id {
			let receive = addresses::single(&mut db, id)
				.await?
				.ok_or_else(|| anyhow!("Order {order_id} references unknown receive address"))?;
			if !receive.is_deployed {
				undeployed_receive_address = Some(receive.id);
			}
			self.execution_sender_for_receive_address(&receive)?
		} else if let Some(linked_id) = order.linked_address_id {
			let linked = addresses::linked_by_id(&mut db, linked_id)
				.await?
				.ok_or_else(|| anyhow!("Order {order_id} references unknown linked address"))?;
			self.execution_sender_for_linked_address(&linked)?
		} else {
			return Err(anyhow!("Order {order_id} has no source address"))
		};

		let message_hash = if order.message_hash.is_empty() {
			let message_hash = compute_message_hash(order.id, &order.receive_address_text);
			orders::set_message_hash(&mut db, order.id, &message_hash).await?;
			message_hash
		} else {
			order.message_hash.clone()
		};

		let decimals = token.decimals as u8;
		let amount_units = to_token_units(&order.amount, decimals)?;
		let sender_fee_units = to_token_units(&order.sender_fee, decimals)?;
		let escrow_units = amount_units + sender_fee_units;

		let token_address = parse_address(&token.contract_address)?;
		let gateway_address = parse_address(&network.gateway_contract_address)?;
		let refund_address = order
			.return_address
			.as_deref()
			.map(parse_address)
			.transpose()?
			.unwrap_or_else(|| self.operator.address());
		let sender_fee_recipient = order
			.sender_fee_recipient
			.as_deref()
			.map(parse_address)
			.transpose()?
			.unwrap_or_else(|| self.operator.address());

		let calls = vec![
			ContractCall::new(
				token_address,
				Bytes::from(
					erc20::ApproveCall { spender: gateway_address, amount: escrow_units }
						.encode(),
				),
			),
			ContractCall::new(
				gateway_address,
				Bytes::from(
					gateway::CreateOrderCall {
						token: token_address,
						amount: amount_units,
						rate: rate_to_uint96(&order.rate)?,
						sender_fee_recipient,
						sender_fee: sender_fee_units,
						refund_address,
						message_hash: message_hash.clone(),
					}
					.encode(),
				),
			),
		];

		let submission = runtime
			.executor
			.submit(&sender, calls)
			.await
			.with_context(|| format!("createOrder submission failed for order {order_id}"))?;

		// The submission id is logged before we have confirmation, so a crash between
		// here and the receipt leaves an auditable trace.
		tx_logs::insert_once(
			&mut db,
			&tx_logs::NewTransactionLog {
				payment_order_id: Some(order.id),
				gateway_id: None,
				status: "order_created",
				tx_hash: &format!("{:#x}", submission.id),
				network: &network.identifier,
				metadata: serde_json::json!({
					"kind": format!("{:?}", submission.kind),
					"message_hash": message_hash,
				}),
			},
		)
		.await?;

		orders::mark_processing(&mut db, order.id).await?;

		match runtime.executor.wait_mined(submission).await {
			Ok(tx_hash) => {
				tracing::info!("Order {order_id} escrowed in {tx_hash:#x}");
				// A counterfactual smart account deploys itself with its first
				// operation.
				if let Some(receive_address_id) = undeployed_receive_address {
					addresses::mark_deployed(
						&mut db,
						receive_address_id,
						&format!("{tx_hash:#x}"),
					)
					.await?;
				}
			},
			Err(error) => {
				// The indexer picks the order up anyway if it eventually mines.
				tracing::warn!("createOrder for {order_id} unconfirmed: {error}");
			},
		}
		Ok(())
	}

	/// Retry driver for orders whose escrow submission failed earlier.
	pub async fn retry_pending_orders(&self) -> Result<()> {
		let pending = {
			let mut db = self.store.acquire().await?;
			orders::pending_orders(&mut db).await?
		};
		for order in pending {
			if let Err(error) = self.create_order(order.id).await {
				tracing::error!("Retrying createOrder for {} failed: {error:#}", order.id);
			}
		}
		Ok(())
	}

	// ===== OrderCreated → locks =====

	pub async fn process_created_orders(
		&self,
		network: &Network,
		events: Vec<Event<OrderCreatedFilter>>,
	) -> Result<()> {
		for event in events {
			let gateway_id = gateway_id_hex(event.event_parameters.order_id);
			let mut db = self.store.acquire().await?;

			let linked = match orders::set_gateway_id(
				&mut db,
				&event.event_parameters.message_hash,
				&gateway_id,
			)
			.await
			{
				Ok(linked) => linked,
				Err(error) if is_duplicate_record_error(&error) => {
					// Re-indexed window; this on-chain order is already linked.
					continue
				},
				Err(error) => return Err(error.into()),
			};

			let Some(order_id) = linked else {
				if orders::by_gateway_id(&mut db, &gateway_id).await?.is_some() {
					continue
				}
				// Unknown messageHash: keep the event, don't act on it.
				tracing::error!(
					"Orphaned OrderCreated {gateway_id} with messageHash {}",
					event.event_parameters.message_hash
				);
				tx_logs::insert_once(
					&mut db,
					&tx_logs::NewTransactionLog {
						payment_order_id: None,
						gateway_id: Some(&gateway_id),
						status: "orphaned_order_created",
						tx_hash: &format!("{:#x}", event.tx_hash),
						network: &network.identifier,
						metadata: serde_json::json!({
							"message_hash": event.event_parameters.message_hash,
						}),
					},
				)
				.await?;
				continue
			};

			if let Err(error) = self.assign_order_locks(order_id).await {
				tracing::error!("Provider assignment for order {order_id} failed: {error:#}");
			}
		}
		Ok(())
	}

	/// Creates and assigns the lock set for an escrowed order. No eligible provider
	/// is not an error: the order stays `processing` until the queue changes or the
	/// refund timer fires.
	pub async fn assign_order_locks(&self, order_id: Uuid) -> Result<()> {
		let mut db = self.store.acquire().await?;
		let Some(order) = orders::single(&mut db, order_id).await? else {
			return Err(anyhow!("Unknown order {order_id}"))
		};
		let Some(gateway_id) = order.gateway_id.clone() else {
			return Err(anyhow!("Order {order_id} has no gateway id yet"))
		};
		if !orders::locks_for_order(&mut db, order_id).await?.is_empty() {
			return Ok(())
		}

		let (token, _network) = self.order_context(&order).await?;
		let Some(recipient) = orders::recipient(&mut db, order_id).await? else {
			return Err(anyhow!("Order {order_id} has no recipient"))
		};

		let Some(bucket) =
			providers::bucket_for_amount(&mut db, &recipient.currency_code, &order.amount)
				.await?
		else {
			tracing::warn!(
				"No provision bucket covers {} {} for order {order_id}",
				order.amount,
				recipient.currency_code
			);
			return Ok(())
		};

		let key = bucket_key(&bucket.currency_code, &bucket.min_amount, &bucket.max_amount);
		let mut entries: Vec<QueueEntry> = Vec::new();
		for _ in 0..MAX_SPLIT_PROVIDERS {
			match self.queue.rotate_next(&key).await? {
				Some(entry)
					if entry.token_symbol == token.symbol &&
						!entries.iter().any(|seen| seen.provider_id == entry.provider_id) =>
					entries.push(entry),
				Some(_) => {},
				None => break,
			}
		}

		let Some(plan) = plan_locks(&order.amount, &entries) else {
			tracing::warn!(
				"Queued providers cannot cover order {order_id} ({} {})",
				order.amount,
				token.symbol
			);
			return Ok(())
		};

		for (index, planned) in plan.iter().enumerate() {
			let lock_id = orders::insert_lock(
				&mut db,
				&orders::NewLockPaymentOrder {
					payment_order_id: order.id,
					gateway_id: gateway_id.clone(),
					split_index: index as i32,
					amount: planned.amount.clone(),
					rate: planned.entry.rate.clone(),
					provider_id: Some(planned.entry.provider_id.clone()),
					provision_bucket_id: Some(bucket.id),
					message_hash: order.message_hash.clone(),
				},
			)
			.await?;

			if let Err(error) = self
				.offer_lock_to_provider(lock_id, &planned.entry.provider_id, &order, &planned.amount, &planned.entry.rate, &token, &recipient)
				.await
			{
				tracing::error!("Offering lock {lock_id} to {} failed: {error:#}", planned.entry.provider_id);
			}
		}
		Ok(())
	}

	fn provider_secret(&self, provider: &ProviderProfile) -> Vec<u8> {
		provider
			.secret_key_encrypted
			.as_deref()
			.and_then(|encrypted| self.cipher.decrypt_from_hex(encrypted).ok())
			.unwrap_or_default()
	}

	#[allow(clippy::too_many_arguments)]
	async fn offer_lock_to_provider(
		&self,
		lock_id: Uuid,
		provider_id: &str,
		order: &PaymentOrder,
		amount: &BigDecimal,
		rate: &BigDecimal,
		token: &Token,
		recipient: &crate::store::models::Recipient,
	) -> Result<()> {
		let mut db = self.store.acquire().await?;
		let Some(provider) = providers::single(&mut db, provider_id).await? else {
			return Err(anyhow!("Lock {lock_id} assigned to unknown provider {provider_id}"))
		};
		let secret = self.provider_secret(&provider);

		let outcome = self
			.provider_client
			.assign_order(
				&provider.host_identifier,
				&provider.id,
				&secret,
				&OrderAssignment {
					lock_order_id: lock_id,
					amount,
					rate,
					token_symbol: &token.symbol,
					currency_code: &recipient.currency_code,
					institution_code: &recipient.institution_code,
					account_identifier: &recipient.account_identifier,
					account_name: &recipient.account_name,
					memo: recipient.memo.as_deref(),
				},
			)
			.await?;

		if let AssignmentOutcome::Declined { reason } = outcome {
			tracing::warn!("Provider {provider_id} declined lock {lock_id}: {reason}");
			self.record_cancellation(lock_id, order).await?;
		}
		Ok(())
	}

	// ===== fulfilment & settlement =====

	/// Polls assigned locks' providers for off-chain payment proofs and settles the
	/// fulfilled ones on-chain.
	pub async fn poll_settle_proofs(&self) -> Result<()> {
		let locks = {
			let mut db = self.store.acquire().await?;
			orders::pending_locks_with_provider(&mut db).await?
		};

		for lock in locks {
			let proof = {
				let mut db = self.store.acquire().await?;
				let Some(provider) =
					providers::single(&mut db, lock.provider_id.as_deref().unwrap_or_default())
						.await?
				else {
					continue
				};
				let secret = self.provider_secret(&provider);
				self.provider_client
					.settle_proof(&provider.host_identifier, &provider.id, &secret, lock.id)
					.await
			};

			match proof {
				Ok(Some(proof)) =>
					if let Err(error) = self.settle_lock(&lock, proof).await {
						tracing::error!("Settling lock {} failed: {error:#}", lock.id);
					},
				Ok(None) => {},
				Err(error) => tracing::warn!(
					"Settle-proof poll for lock {} failed: {error:#}",
					lock.id
				),
			}
		}
		Ok(())
	}

	/// Provider proved the fiat leg: validate the lock and call `settle` on the
	/// Gateway from the operator account.
	pub async fn settle_lock(&self, lock: &LockPaymentOrder, proof: SettleProof) -> Result<()> {
		let mut db = self.store.acquire().await?;
		if !orders::mark_lock_validated(&mut db, lock.id).await? {
			// Already past pending; a concurrent path won.
			return Ok(())
		}

		let Some(order) = orders::single(&mut db, lock.payment_order_id).await? else {
			return Err(anyhow!("Lock {} references unknown order", lock.id))
		};
		orders::mark_validated(&mut db, order.id).await?;

		let (_token, network) = self.order_context(&order).await?;
		let runtime = self.runtime(network.id)?;

		let Some(provider_id) = lock.provider_id.as_deref() else {
			return Err(anyhow!("Lock {} validated without a provider", lock.id))
		};
		let Some(provider) = providers::single(&mut db, provider_id).await? else {
			return Err(anyhow!("Lock {} references unknown provider", lock.id))
		};
		let settlement_address = provider
			.settlement_address
			.as_deref()
			.map(parse_address)
			.transpose()?
			.unwrap_or_else(|| self.operator.address());

		let gateway_address = parse_address(&network.gateway_contract_address)?;
		let submission = runtime
			.executor
			.submit(
				&self.operator_sender(),
				vec![ContractCall::new(
					gateway_address,
					Bytes::from(
						gateway::SettleCall {
							order_id: parse_gateway_id(&lock.gateway_id)?,
							provider: settlement_address,
							settle_percent: proof.settle_percent as u128,
						}
						.encode(),
					),
				)],
			)
			.await?;

		tx_logs::insert_once(
			&mut db,
			&tx_logs::NewTransactionLog {
				payment_order_id: Some(order.id),
				gateway_id: Some(&lock.gateway_id),
				status: "settle_submitted",
				tx_hash: &format!("{:#x}", submission.id),
				network: &network.identifier,
				metadata: serde_json::json!({
					"lock_order_id": lock.id,
					"payment_reference": proof.payment_reference,
				}),
			},
		)
		.await?;

		if let Err(error) = runtime.executor.wait_mined(submission).await {
			tracing::warn!("settle for lock {} unconfirmed: {error}", lock.id);
		}
		Ok(())
	}

	pub async fn process_settled_orders(
		&self,
		network: &Network,
		events: Vec<Event<OrderSettledFilter>>,
	) -> Result<()> {
		for event in events {
			let gateway_id = gateway_id_hex(event.event_parameters.order_id);
			let mut db = self.store.acquire().await?;

			let Some(order) = orders::by_gateway_id(&mut db, &gateway_id).await? else {
				tracing::error!("Orphaned OrderSettled for {gateway_id}");
				continue
			};
			if order.status.is_terminal() {
				// Re-indexed window.
				continue
			}

			let lock = match orders::oldest_validated_lock_for_gateway(&mut db, &gateway_id)
				.await?
			{
				Some(lock) => Some(lock),
				None => orders::locks_for_gateway(&mut db, &gateway_id)
					.await?
					.into_iter()
					.find(|lock| {
						matches!(lock.status, LockOrderStatus::Pending | LockOrderStatus::Validated)
					}),
			};
			if let Some(lock) = lock {
				orders::mark_lock_settled(&mut db, lock.id).await?;
			}

			if orders::all_locks_settled(&mut db, order.id).await? {
				orders::mark_settled(&mut db, order.id).await?;
				if let Some(receive_address_id) = order.receive_address_id {
					// Back into the pool; fallback mints are filtered out in SQL.
					addresses::recycle(&mut db, receive_address_id).await?;
				}
				tx_logs::insert_once(
					&mut db,
					&tx_logs::NewTransactionLog {
						payment_order_id: Some(order.id),
						gateway_id: Some(&gateway_id),
						status: "order_settled",
						tx_hash: &format!("{:#x}", event.tx_hash),
						network: &network.identifier,
						metadata: serde_json::json!({
							"settle_percent": event.event_parameters.settle_percent,
						}),
					},
				)
				.await?;
				tracing::info!("Order {} fully settled", order.id);
			}
		}
		Ok(())
	}

	// ===== cancellation & refunds =====

	/// Advances a lock's cancellation count and, past the budget, escalates to an
	/// on-chain refund. Re-offering happens on the next cancelled-lock sweep.
	async fn record_cancellation(&self, lock_id: Uuid, order: &PaymentOrder) -> Result<()> {
		let mut db = self.store.acquire().await?;
		let count = orders::increment_cancellation(&mut db, lock_id).await?;
		orders::mark_lock_cancelled(&mut db, lock_id).await?;

		if count > self.config.refund_cancellation_count {
			tracing::warn!(
				"Lock {lock_id} exceeded {} cancellations; refunding order {}",
				self.config.refund_cancellation_count,
				order.id
			);
			return self.initiate_refund(order).await
		}
		Ok(())
	}

	/// Locks that nobody fulfilled within the validity window are cancelled (and
	/// possibly escalated).
	pub async fn sweep_stale_locks(&self) -> Result<()> {
		let stale = {
			let mut db = self.store.acquire().await?;
			orders::stale_pending_locks(
				&mut db,
				self.config.order_fulfillment_validity.as_secs_f64(),
			)
			.await?
		};

		for lock in stale {
			let order = {
				let mut db = self.store.acquire().await?;
				orders::single(&mut db, lock.payment_order_id).await?
			};
			let Some(order) = order else { continue };
			tracing::warn!("Lock {} timed out waiting for fulfilment", lock.id);
			if let Err(error) = self.record_cancellation(lock.id, &order).await {
				tracing::error!("Cancelling stale lock {} failed: {error:#}", lock.id);
			}
		}
		Ok(())
	}

	/// Re-offers cancelled locks to the next head of their bucket queue. A
	/// single-provider queue rotates back onto the same provider; repeated declines
	/// then walk the cancellation count up to the refund escalation.
	pub async fn reoffer_cancelled_locks(&self) -> Result<()> {
		let cancelled = {
			let mut db = self.store.acquire().await?;
			orders::reofferable_cancelled_locks(&mut db, self.config.refund_cancellation_count)
				.await?
		};

		for lock in cancelled {
			if let Err(error) = self.reoffer_lock(&lock).await {
				tracing::error!("Re-offering lock {} failed: {error:#}", lock.id);
			}
		}
		Ok(())
	}

	async fn reoffer_lock(&self, lock: &LockPaymentOrder) -> Result<()> {
		let mut db = self.store.acquire().await?;
		let Some(order) = orders::single(&mut db, lock.payment_order_id).await? else {
			return Err(anyhow!("Lock {} references unknown order", lock.id))
		};
		let Some(bucket_id) = lock.provision_bucket_id else { return Ok(()) };
		let bucket = providers::active_buckets(&mut db)
			.await?
			.into_iter()
			.find(|bucket| bucket.id == bucket_id)
			.ok_or_else(|| anyhow!("Lock {} references unknown bucket", lock.id))?;

		let key = bucket_key(&bucket.currency_code, &bucket.min_amount, &bucket.max_amount);
		let Some(entry) = self.queue.rotate_next(&key).await? else {
			tracing::warn!("No provider left to re-offer lock {}", lock.id);
			return Ok(())
		};

		if !orders::reassign_lock(&mut db, lock.id, &entry.provider_id).await? {
			return Ok(())
		}

		let (token, _network) = self.order_context(&order).await?;
		let Some(recipient) = orders::recipient(&mut db, order.id).await? else {
			return Err(anyhow!("Order {} has no recipient", order.id))
		};
		self.offer_lock_to_provider(
			lock.id,
			&entry.provider_id,
			&order,
			&lock.amount,
			&lock.rate,
			&token,
			&recipient,
		)
		.await
	}

	/// Calls `refund(fee, orderId)` on the Gateway from the operator account.
	pub async fn initiate_refund(&self, order: &PaymentOrder) -> Result<()> {
		let Some(gateway_id) = order.gateway_id.as_deref() else {
			return Err(anyhow!("Order {} has no gateway id to refund", order.id))
		};
		let (token, network) = self.order_context(order).await?;
		let runtime = self.runtime(network.id)?;

		let fee_units = to_token_units(&network.fee, token.decimals as u8)?;
		let gateway_address = parse_address(&network.gateway_contract_address)?;

		let submission = runtime
			.executor
			.submit(
				&self.operator_sender(),
				vec![ContractCall::new(
					gateway_address,
					Bytes::from(
						gateway::RefundCall {
							fee: fee_units,
							order_id: parse_gateway_id(gateway_id)?,
						}
						.encode(),
					),
				)],
			)
			.await?;

		let mut db = self.store.acquire().await?;
		tx_logs::insert_once(
			&mut db,
			&tx_logs::NewTransactionLog {
				payment_order_id: Some(order.id),
				gateway_id: Some(gateway_id),
				status: "refund_submitted",
				tx_hash: &format!("{:#x}", submission.id),
				network: &network.identifier,
				metadata: serde_json::json!({}),
			},
		)
		.await?;

		if let Err(error) = runtime.executor.wait_mined(submission).await {
			tracing::warn!("refund for order {} unconfirmed: {error}", order.id);
		}
		Ok(())
	}

	pub async fn process_refunded_orders(
		&self,
		network: &Network,
		events: Vec<Event<OrderRefundedFilter>>,
	) -> Result<()> {
		for event in events {
			let gateway_id = gateway_id_hex(event.event_parameters.order_id);
			let mut db = self.store.acquire().await?;

			let Some(order) = orders::by_gateway_id(&mut db, &gateway_id).await? else {
				tracing::error!("Orphaned OrderRefunded for {gateway_id}");
				continue
			};
			if order.status == PaymentOrderStatus::Refunded {
				continue
			}

			let (token, _network) = self.order_context(&order).await?;
			let fee = from_token_units(event.event_parameters.fee, token.decimals as u8)?;
			let amount_returned = if order.amount_paid > fee {
				&order.amount_paid - &fee
			} else {
				order.amount_paid.clone()
			};

			orders::mark_locks_refunded_for_gateway(&mut db, &gateway_id).await?;
			orders::mark_refunded(&mut db, order.id, &amount_returned).await?;
			// The receive address is deliberately NOT recycled on the refund path.
			tx_logs::insert_once(
				&mut db,
				&tx_logs::NewTransactionLog {
					payment_order_id: Some(order.id),
					gateway_id: Some(&gateway_id),
					status: "order_refunded",
					tx_hash: &format!("{:#x}", event.tx_hash),
					network: &network.identifier,
					metadata: serde_json::json!({ "fee": fee.to_string() }),
				},
			)
			.await?;
			tracing::info!("Order {} refunded to {}", order.id, order.return_address.as_deref().unwrap_or("operator"));
		}
		Ok(())
	}

	// ===== sweeps =====

	/// Fallback-minted receive addresses that outlived their validity with no deposit
	/// expire their order; nothing ever hit the chain for these.
	pub async fn sweep_expired_receive_addresses(&self) -> Result<()> {
		let mut db = self.store.acquire().await?;
		for row in orders::initiated_orders_with_expired_addresses(&mut db).await? {
			orders::mark_expired(&mut db, row.order_id).await?;
			addresses::mark_expired(&mut db, row.receive_address_id).await?;
			tracing::info!("Order {} expired with no deposit", row.order_id);
		}
		Ok(())
	}

	/// Catch-up driver for orders escrowed while no provider was eligible.
	pub async fn assign_unmatched_orders(&self) -> Result<()> {
		let unmatched = {
			let mut db = self.store.acquire().await?;
			orders::processing_orders_without_locks(&mut db).await?
		};
		for order in unmatched {
			if let Err(error) = self.assign_order_locks(order.id).await {
				tracing::error!("Assigning order {} failed: {error:#}", order.id);
			}
		}
		Ok(())
	}

	/// Pulls each active provider's declared float from its node and mirrors it into
	/// `provider_currencies`.
	pub async fn refresh_provider_balances(&self) -> Result<()> {
		let providers_list = {
			let mut db = self.store.acquire().await?;
			providers::all_active(&mut db).await?
		};

		for provider in providers_list {
			let secret = self.provider_secret(&provider);
			match self
				.provider_client
				.info(&provider.host_identifier, &provider.id, &secret)
				.await
			{
				Ok(info) => {
					let mut db = self.store.acquire().await?;
					for currency in info.currencies {
						providers::update_provider_balance(
							&mut db,
							&provider.id,
							&currency.currency,
							&currency.available_balance,
						)
						.await?;
					}
					providers::set_provider_available(&mut db, &provider.id, true).await?;
				},
				Err(error) => {
					tracing::warn!(
						"Provider {} /info unreachable, marking unavailable: {error:#}",
						provider.id
					);
					let mut db = self.store.acquire().await?;
					providers::set_provider_available(&mut db, &provider.id, false).await?;
				},
			}
		}
		Ok(())
	}

	/// Over-paid P2P orders get their rate re-quoted from the live queue before
	/// escrow.
	pub async fn refresh_p2p_rate(&self, order_id: Uuid) -> Result<()> {
		let mut db = self.store.acquire().await?;
		let Some(order) = orders::single(&mut db, order_id).await? else { return Ok(()) };
		let (token, _network) = self.order_context(&order).await?;
		let Some(recipient) = orders::recipient(&mut db, order_id).await? else {
			return Ok(())
		};
		let market_rate = providers::currency(&mut db, &recipient.currency_code)
			.await?
			.map(|currency| currency.market_rate)
			.unwrap_or_else(BigDecimal::zero);

		let rate = self
			.queue
			.get_token_rate_from_queue(
				&token.symbol,
				&order.amount,
				&recipient.currency_code,
				&market_rate,
			)
			.await?;
		if rate > BigDecimal::zero() {
			orders::refresh_rate(&mut db, order_id, &rate).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn gateway_ids_round_trip() {
		let id = [0xabu8; 32];
		let hex_form = gateway_id_hex(id);
		assert_eq!(hex_form.len(), 66);
		assert_eq!(parse_gateway_id(&hex_form).unwrap(), id);
	}

	#[test]
	fn rejects_malformed_gateway_ids() {
		assert!(parse_gateway_id("0xabcd").is_err());
		assert!(parse_gateway_id("not hex").is_err());
	}

	#[test]
	fn rates_scale_to_two_on_chain_decimals() {
		use std::str::FromStr;
		assert_eq!(rate_to_uint96(&BigDecimal::from_str("1482.3").unwrap()).unwrap(), 148_230);
		assert_eq!(rate_to_uint96(&BigDecimal::from(1500)).unwrap(), 150_000);
		// Sub-cent precision is truncated, never rounded up.
		assert_eq!(rate_to_uint96(&BigDecimal::from_str("0.019").unwrap()).unwrap(), 1);
	}

	#[test]
	fn message_hash_is_stable_and_case_insensitive() {
		let order_id = Uuid::from_u128(7);
		let a = compute_message_hash(order_id, "0xABCDEF0123456789abcdef0123456789ABCDEF01");
		let b = compute_message_hash(order_id, "0xabcdef0123456789abcdef0123456789abcdef01");
		assert_eq!(a, b);
		assert_eq!(a.len(), 64);

		assert_ne!(a, compute_message_hash(Uuid::from_u128(8), "0xabcdef0123456789abcdef0123456789abcdef01"));
	}
}
