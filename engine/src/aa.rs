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

//! Outbound execution. Every on-chain write the engine performs goes through the
//! [SponsoredExecutionApi] seam: either as an ERC-4337 v0.7 user operation with
//! sponsored gas (smart-account senders), or as a legacy signed transaction (EOA
//! senders). The concrete implementation is selected at wiring time.

pub mod bundler;
pub mod paymaster;
pub mod user_op;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::{
	abi::{self, AbiDecode, AbiEncode, Token},
	providers::{Http, Provider, ProviderError, RpcError},
	signers::{LocalWallet, Signer},
	types::{
		transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, H256, U256,
	},
};
use std::{sync::Arc, time::Duration};
use utilities::{make_periodic_tick, SecretUrl};

use crate::{
	constants::{
		ENTRY_POINT_ADDRESS, EOA_GAS_LIMIT, EXECUTE_BATCH_SELECTOR, EXECUTE_SELECTOR,
		INITIAL_CALL_GAS_LIMIT, INITIAL_PRE_VERIFICATION_GAS, INITIAL_VERIFICATION_GAS_LIMIT,
		LIGHT_ACCOUNT_FACTORY_ADDRESS, PAYMASTER_TIMEOUT, USER_OP_RECEIPT_POLL_INTERVAL,
		USER_OP_RECEIPT_TIMEOUT,
	},
	evm::{
		contracts::{entry_point, light_account_factory},
		retry_rpc::EvmRetryRpcApi,
	},
};
use bundler::BundlerClient;
use paymaster::{PaymasterClient, SponsorUserOperation};
use user_op::{dummy_signature, sign_user_op_hash, UserOperation};

#[derive(Debug, thiserror::Error)]
pub enum AaError {
	/// A paymaster or bundler validation rejection (AA23 and friends). Not retryable;
	/// the decoded reason is kept for the logs.
	#[error("user operation rejected ({code}): {message}{}", reason.as_ref().map(|reason| format!(" [{reason}]")).unwrap_or_default())]
	Validation { code: i64, message: String, reason: Option<String> },

	#[error("user operation receipt not found within {0:?}")]
	ReceiptTimeout(Duration),

	#[error("sponsored execution is disabled for this network")]
	SponsorshipDisabled,

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl AaError {
	pub fn is_validation(&self) -> bool {
		matches!(self, AaError::Validation { .. })
	}
}

pub(crate) fn classify_provider_error(error: ProviderError) -> AaError {
	match error.as_error_response() {
		Some(json_rpc_error) => AaError::Validation {
			code: json_rpc_error.code,
			message: json_rpc_error.message.clone(),
			reason: json_rpc_error
				.data
				.as_ref()
				.and_then(|data| data.get("reason"))
				.and_then(|reason| reason.as_str())
				.map(String::from),
		},
		None => AaError::Other(anyhow::Error::new(error)),
	}
}

/// One contract call to be executed from a sender account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractCall {
	pub to: Address,
	pub value: U256,
	pub data: Bytes,
}

impl ContractCall {
	pub fn new(to: Address, data: Bytes) -> Self {
		Self { to, value: U256::zero(), data }
	}
}

/// How an outbound operation is signed and submitted. Classification: a sender with a
/// known CREATE2 salt is a smart account even before deployment (deployment piggybacks
/// on the first user operation); a sender with on-chain code is a smart account; all
/// others are EOAs with a raw key.
#[derive(Clone)]
pub enum ExecutionSender {
	SmartAccount { address: Address, owner: LocalWallet, salt: U256 },
	Eoa { wallet: LocalWallet },
}

impl ExecutionSender {
	pub fn address(&self) -> Address {
		match self {
			ExecutionSender::SmartAccount { address, .. } => *address,
			ExecutionSender::Eoa { wallet } => wallet.address(),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionKind {
	UserOperation,
	Transaction,
}

/// The identifier of a submitted execution: a userOpHash for the smart-account path,
/// a transaction hash for the EOA path. Recorded in the transaction log before
/// confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmittedExecution {
	pub id: H256,
	pub kind: ExecutionKind,
}

/// LightAccount `execute(address,uint256,bytes)`.
pub fn encode_execute(call: &ContractCall) -> Bytes {
	let mut data = EXECUTE_SELECTOR.to_vec();
	data.extend(abi::encode(&[
		Token::Address(call.to),
		Token::Uint(call.value),
		Token::Bytes(call.data.to_vec()),
	]));
	Bytes::from(data)
}

/// LightAccount `executeBatch((address,uint256,bytes)[])`.
pub fn encode_execute_batch(calls: &[ContractCall]) -> Bytes {
	let mut data = EXECUTE_BATCH_SELECTOR.to_vec();
	data.extend(abi::encode(&[Token::Array(
		calls
			.iter()
			.map(|call| {
				Token::Tuple(vec![
					Token::Address(call.to),
					Token::Uint(call.value),
					Token::Bytes(call.data.to_vec()),
				])
			})
			.collect(),
	)]));
	Bytes::from(data)
}

fn encode_execution(calls: &[ContractCall]) -> Bytes {
	match calls {
		[call] => encode_execute(call),
		calls => encode_execute_batch(calls),
	}
}

#[async_trait]
pub trait SponsoredExecutionApi: Send + Sync {
	/// Computes the counterfactual smart-account address for `(owner, salt)`. The
	/// factory is authoritative: the address is read with `getAddress` via `eth_call`,
	/// never derived locally.
	async fn create_smart_account(&self, owner: Address, salt: U256) -> Result<Address>;

	/// Signs and submits `calls` from `sender`, returning the submission id without
	/// waiting for confirmation.
	async fn submit(
		&self,
		sender: &ExecutionSender,
		calls: Vec<ContractCall>,
	) -> Result<SubmittedExecution, AaError>;

	/// Waits for the submission to be mined and returns the on-chain transaction hash.
	async fn wait_mined(&self, submission: SubmittedExecution) -> Result<H256, AaError>;
}

pub fn entry_point_address() -> Address {
	ENTRY_POINT_ADDRESS.parse().expect("const entry point address is valid")
}

pub fn light_account_factory_address() -> Address {
	LIGHT_ACCOUNT_FACTORY_ADDRESS.parse().expect("const factory address is valid")
}

fn provider_with_timeout(url: &SecretUrl, timeout: Duration) -> Result<Arc<Provider<Http>>> {
	let client = reqwest::Client::builder().timeout(timeout).build()?;
	Ok(Arc::new(Provider::new(Http::new_with_client(
		url::Url::parse(url.as_ref()).context("Invalid bundler/paymaster URL")?,
		client,
	))))
}

async fn send_eoa_batch<Rpc: EvmRetryRpcApi>(
	rpc: &Rpc,
	wallet: &LocalWallet,
	chain_id: u64,
	calls: &[ContractCall],
) -> Result<H256, AaError> {
	let mut nonce = rpc.transaction_count(wallet.address()).await?;
	let gas_price = rpc.gas_price().await?;

	let mut last_tx_hash = H256::zero();
	for call in calls {
		let tx = TransactionRequest::new()
			.from(wallet.address())
			.to(call.to)
			.value(call.value)
			.data(call.data.clone())
			.nonce(nonce)
			.gas(EOA_GAS_LIMIT)
			.gas_price(gas_price)
			.chain_id(chain_id);

		let typed = TypedTransaction::Legacy(tx);
		let signature = wallet
			.sign_transaction(&typed)
			.await
			.context("Failed to sign EOA transaction")?;
		last_tx_hash = rpc.send_raw_transaction(typed.rlp_signed(&signature)).await?;
		nonce = nonce + U256::one();
	}
	Ok(last_tx_hash)
}

/// Alchemy-backed implementation: gas sponsorship through the gas manager, submission
/// through the bundler endpoint.
#[derive(Clone)]
pub struct AlchemyExecutor<Rpc: EvmRetryRpcApi> {
	rpc: Rpc,
	bundler: BundlerClient,
	paymaster: PaymasterClient,
	entry_point: Address,
	factory: Address,
	chain_id: u64,
}

impl<Rpc: EvmRetryRpcApi> AlchemyExecutor<Rpc> {
	pub fn new(
		rpc: Rpc,
		bundler_url: &SecretUrl,
		paymaster_url: &SecretUrl,
		gas_policy_id: String,
		chain_id: u64,
	) -> Result<Self> {
		let entry_point = entry_point_address();
		Ok(Self {
			rpc,
			bundler: BundlerClient::new(
				provider_with_timeout(bundler_url, USER_OP_RECEIPT_TIMEOUT)?,
				entry_point,
			),
			paymaster: PaymasterClient::new(
				provider_with_timeout(paymaster_url, PAYMASTER_TIMEOUT)?,
				gas_policy_id,
				entry_point,
			),
			entry_point,
			factory: light_account_factory_address(),
			chain_id,
		})
	}

	async fn entry_point_nonce(&self, sender: Address) -> Result<U256> {
		let raw = self
			.rpc
			.eth_call(
				self.entry_point,
				Bytes::from(
					entry_point::GetNonceCall { sender, key: U256::zero() }.encode(),
				),
			)
			.await?;
		Ok(entry_point::GetNonceReturn::decode(&raw)
			.context("Failed to decode EntryPoint.getNonce return")?
			.nonce)
	}

	async fn build_user_operation(
		&self,
		sender: Address,
		owner: &LocalWallet,
		salt: U256,
		calls: &[ContractCall],
	) -> Result<UserOperation, AaError> {
		let nonce = self.entry_point_nonce(sender).await?;

		// An undeployed account deploys itself through the initCode of its first
		// operation.
		let (factory, factory_data) = if self.rpc.get_code(sender).await?.is_empty() {
			(
				Some(self.factory),
				Some(Bytes::from(
					light_account_factory::CreateAccountCall { owner: owner.address(), salt }
						.encode(),
				)),
			)
		} else {
			(None, None)
		};

		let gas_price = self.rpc.gas_price().await?;
		let mut user_op = UserOperation {
			sender,
			nonce,
			factory,
			factory_data,
			call_data: encode_execution(calls),
			call_gas_limit: U256::from(INITIAL_CALL_GAS_LIMIT),
			verification_gas_limit: U256::from(INITIAL_VERIFICATION_GAS_LIMIT),
			pre_verification_gas: U256::from(INITIAL_PRE_VERIFICATION_GAS),
			max_fee_per_gas: gas_price.saturating_mul(U256::from(2u64)),
			max_priority_fee_per_gas: std::cmp::max(gas_price / 10u64, U256::one()),
			paymaster: None,
			paymaster_verification_gas_limit: None,
			paymaster_post_op_gas_limit: None,
			paymaster_data: None,
			signature: dummy_signature(),
		};

		let sponsored = self
			.paymaster
			.request_gas_and_paymaster_data(
				&SponsorUserOperation {
					sender: user_op.sender,
					nonce: user_op.nonce,
					init_code: user_op.init_code(),
					call_data: user_op.call_data.clone(),
					call_gas_limit: user_op.call_gas_limit,
					verification_gas_limit: user_op.verification_gas_limit,
					pre_verification_gas: user_op.pre_verification_gas,
					max_fee_per_gas: user_op.max_fee_per_gas,
					max_priority_fee_per_gas: user_op.max_priority_fee_per_gas,
				},
				dummy_signature(),
			)
			.await?;

		user_op.paymaster = Some(sponsored.paymaster);
		user_op.paymaster_data = Some(sponsored.paymaster_data);
		user_op.paymaster_verification_gas_limit = Some(sponsored.paymaster_verification_gas_limit);
		user_op.paymaster_post_op_gas_limit = Some(sponsored.paymaster_post_op_gas_limit);
		user_op.call_gas_limit = sponsored.call_gas_limit;
		user_op.verification_gas_limit = sponsored.verification_gas_limit;
		user_op.pre_verification_gas = sponsored.pre_verification_gas;
		user_op.max_fee_per_gas = sponsored.max_fee_per_gas;
		user_op.max_priority_fee_per_gas = sponsored.max_priority_fee_per_gas;

		let hash = user_op.hash(self.entry_point, self.chain_id);
		user_op.signature = sign_user_op_hash(hash, owner)?;
		Ok(user_op)
	}
}

#[async_trait]
impl<Rpc: EvmRetryRpcApi> SponsoredExecutionApi for AlchemyExecutor<Rpc> {
	async fn create_smart_account(&self, owner: Address, salt: U256) -> Result<Address> {
		let raw = self
			.rpc
			.eth_call(
				self.factory,
				Bytes::from(light_account_factory::GetAddressCall { owner, salt }.encode()),
			)
			.await?;
		Ok(light_account_factory::GetAddressReturn::decode(&raw)
			.context("Failed to decode factory.getAddress return")?
			.account)
	}

	async fn submit(
		&self,
		sender: &ExecutionSender,
		calls: Vec<ContractCall>,
	) -> Result<SubmittedExecution, AaError> {
		if calls.is_empty() {
			return Err(AaError::Other(anyhow!("Nothing to execute")))
		}
		match sender {
			ExecutionSender::SmartAccount { address, owner, salt } => {
				let user_op =
					self.build_user_operation(*address, owner, *salt, &calls).await?;
				let user_op_hash = self.bundler.send_user_operation(&user_op).await?;
				Ok(SubmittedExecution { id: user_op_hash, kind: ExecutionKind::UserOperation })
			},
			ExecutionSender::Eoa { wallet } => {
				let tx_hash = send_eoa_batch(&self.rpc, wallet, self.chain_id, &calls).await?;
				Ok(SubmittedExecution { id: tx_hash, kind: ExecutionKind::Transaction })
			},
		}
	}

	async fn wait_mined(&self, submission: SubmittedExecution) -> Result<H256, AaError> {
		match submission.kind {
			ExecutionKind::UserOperation => {
				let receipt =
					self.bundler.wait_for_user_operation_receipt(submission.id).await?;
				if !receipt.success {
					return Err(AaError::Other(anyhow!(
						"User operation {:?} reverted in tx {:?}",
						submission.id,
						receipt.receipt.transaction_hash
					)))
				}
				Ok(receipt.receipt.transaction_hash)
			},
			ExecutionKind::Transaction => {
				let mut poll_interval = make_periodic_tick(USER_OP_RECEIPT_POLL_INTERVAL, false);
				tokio::time::timeout(USER_OP_RECEIPT_TIMEOUT, async {
					loop {
						poll_interval.tick().await;
						if let Some(receipt) =
							self.rpc.transaction_receipt(submission.id).await?
						{
							if receipt.status == Some(0u64.into()) {
								break Err(AaError::Other(anyhow!(
									"Transaction {:?} reverted",
									submission.id
								)))
							}
							break Ok(receipt.transaction_hash)
						}
					}
				})
				.await
				.map_err(|_| AaError::ReceiptTimeout(USER_OP_RECEIPT_TIMEOUT))?
			},
		}
	}
}

/// Fallback when no sponsorship service is configured: raw EOA submission only.
#[derive(Clone)]
pub struct DirectExecutor<Rpc: EvmRetryRpcApi> {
	rpc: Rpc,
	factory: Address,
	chain_id: u64,
}

impl<Rpc: EvmRetryRpcApi> DirectExecutor<Rpc> {
	pub fn new(rpc: Rpc, chain_id: u64) -> Self {
		Self { rpc, factory: light_account_factory_address(), chain_id }
	}
}

#[async_trait]
impl<Rpc: EvmRetryRpcApi> SponsoredExecutionApi for DirectExecutor<Rpc> {
	async fn create_smart_account(&self, owner: Address, salt: U256) -> Result<Address> {
		let raw = self
			.rpc
			.eth_call(
				self.factory,
				Bytes::from(light_account_factory::GetAddressCall { owner, salt }.encode()),
			)
			.await?;
		Ok(light_account_factory::GetAddressReturn::decode(&raw)
			.context("Failed to decode factory.getAddress return")?
			.account)
	}

	async fn submit(
		&self,
		sender: &ExecutionSender,
		calls: Vec<ContractCall>,
	) -> Result<SubmittedExecution, AaError> {
		match sender {
			ExecutionSender::SmartAccount { .. } => Err(AaError::SponsorshipDisabled),
			ExecutionSender::Eoa { wallet } => {
				let tx_hash = send_eoa_batch(&self.rpc, wallet, self.chain_id, &calls).await?;
				Ok(SubmittedExecution { id: tx_hash, kind: ExecutionKind::Transaction })
			},
		}
	}

	async fn wait_mined(&self, submission: SubmittedExecution) -> Result<H256, AaError> {
		let mut poll_interval = make_periodic_tick(USER_OP_RECEIPT_POLL_INTERVAL, false);
		tokio::time::timeout(USER_OP_RECEIPT_TIMEOUT, async {
			loop {
				poll_interval.tick().await;
				if let Some(receipt) = self.rpc.transaction_receipt(submission.id).await? {
					break Ok(receipt.transaction_hash)
				}
			}
		})
		.await
		.map_err(|_| AaError::ReceiptTimeout(USER_OP_RECEIPT_TIMEOUT))?
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	fn word(encoded: &[u8], index: usize) -> &[u8] {
		&encoded[4 + index * 32..4 + (index + 1) * 32]
	}

	#[test]
	fn encodes_execute_with_the_pinned_selector() {
		let call = ContractCall::new(
			Address::from_str("0x541f563237a309b3a61e33bdf07a8930bdba8d99").unwrap(),
			Bytes::from_str("0xdeadbeef").unwrap(),
		);

		let encoded = encode_execute(&call);
		assert_eq!(&encoded[..4], EXECUTE_SELECTOR);
		// address is right-aligned in its word
		assert_eq!(&word(&encoded, 0)[12..], call.to.as_bytes());
	}

	#[test]
	fn encodes_execute_batch_as_a_dynamic_struct_array() {
		let call = ContractCall {
			to: Address::repeat_byte(0x11),
			value: U256::from(5u64),
			data: Bytes::default(),
		};

		let encoded = encode_execute_batch(std::slice::from_ref(&call));
		assert_eq!(&encoded[..4], EXECUTE_BATCH_SELECTOR);

		// Layout: array head offset, length, per-struct offset, then the struct fields
		// with the inner bytes as a tail.
		assert_eq!(U256::from_big_endian(word(&encoded, 0)), U256::from(0x20u64));
		assert_eq!(U256::from_big_endian(word(&encoded, 1)), U256::one());
		assert_eq!(U256::from_big_endian(word(&encoded, 2)), U256::from(0x20u64));
		assert_eq!(&word(&encoded, 3)[12..], call.to.as_bytes());
		assert_eq!(U256::from_big_endian(word(&encoded, 4)), U256::from(5u64));
		assert_eq!(U256::from_big_endian(word(&encoded, 5)), U256::from(0x60u64));
		assert_eq!(U256::from_big_endian(word(&encoded, 6)), U256::zero());
	}

	#[test]
	fn single_call_uses_execute_and_batches_use_execute_batch() {
		let call = ContractCall::new(Address::repeat_byte(0x22), Bytes::default());

		assert_eq!(&encode_execution(std::slice::from_ref(&call))[..4], EXECUTE_SELECTOR);
		assert_eq!(
			&encode_execution(&[call.clone(), call])[..4],
			EXECUTE_BATCH_SELECTOR
		);
	}

	#[test]
	fn const_addresses_parse() {
		assert_eq!(
			entry_point_address(),
			Address::from_str("0x0000000071727De22E5E9d8baF0edAc6f37da032").unwrap()
		);
		assert_eq!(
			light_account_factory_address(),
			Address::from_str("0x0000000000400CdFef5E2714E63d8040b700BC24").unwrap()
		);
	}
}
