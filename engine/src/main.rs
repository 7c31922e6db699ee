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

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use futures::FutureExt;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use utilities::{read_clean_and_decode_hex_str_file, task_scope};

use offramp_engine::{
	aa::{AlchemyExecutor, DirectExecutor, SponsoredExecutionApi},
	address_pool::AddressPool,
	crypto::Cipher,
	deposit::{poller::DepositPoller, webhook, DepositDetector},
	evm::{compose_rpc_url, retry_rpc::EvmRetryRpcClient, rpc::EvmRpcClient},
	health::HealthChecker,
	indexer::Indexer,
	orders::{EngineConfig, NetworkRuntime, OrderEngine},
	provider_client::ProviderClient,
	queue::ProvisionQueue,
	scheduler,
	settings::{CommandLineOptions, Settings},
	store::{networks, Store},
};

const DEPOSIT_CHANNEL_BUFFER: usize = 1024;

async fn start(
	scope: &task_scope::Scope<'_, anyhow::Error>,
	settings: Settings,
) -> Result<()> {
	if let Some(health_check_settings) = &settings.health_check {
		scope.spawn(HealthChecker::new(health_check_settings).await?.run());
	}

	// Startup-time failures here are the only fatal ones: without config, DB or
	// Redis there is no engine to run.
	let store = Store::connect(&settings.database.url).await?;
	store.ensure_schema().await?;

	let redis_client =
		redis::Client::open(settings.redis.url.clone()).context("Invalid redis url")?;
	let redis_connection = redis_client
		.get_multiplexed_tokio_connection()
		.await
		.context("Failed to connect to redis")?;

	let cipher = Cipher::from_hex_key(&settings.encryption_key)?;
	let operator = read_clean_and_decode_hex_str_file(
		&settings.operator_private_key_file,
		"operator private key",
		|key| key.parse::<LocalWallet>().map_err(anyhow::Error::new),
	)?;

	let network_rows = {
		let mut db = store.acquire().await?;
		networks::all(&mut db).await?
	};
	if network_rows.is_empty() {
		return Err(anyhow!("No networks configured; seed the networks table first"))
	}

	let mut runtimes = HashMap::new();
	for network in network_rows {
		let chain_id = network.chain_id as u64;
		let rpc_url = compose_rpc_url(&network.rpc_endpoint, &settings.alchemy_api_key);
		let rpc = EvmRetryRpcClient::<EvmRpcClient>::new(
			scope,
			rpc_url.clone(),
			chain_id,
			network.identifier.clone(),
		)?;

		let executor: Arc<dyn SponsoredExecutionApi> = if settings.use_alchemy_service {
			let bundler_url = network
				.bundler_url
				.as_deref()
				.map(|url| compose_rpc_url(url, &settings.alchemy_api_key))
				.unwrap_or_else(|| rpc_url.clone());
			let paymaster_url = network
				.paymaster_url
				.as_deref()
				.map(|url| compose_rpc_url(url, &settings.alchemy_api_key))
				.unwrap_or_else(|| bundler_url.clone());
			Arc::new(AlchemyExecutor::new(
				rpc.clone(),
				&bundler_url,
				&paymaster_url,
				settings.alchemy_gas_policy_id.clone(),
				chain_id,
			)?)
		} else {
			Arc::new(DirectExecutor::new(rpc.clone(), chain_id))
		};

		tracing::info!("Wired network {} (chain id {chain_id})", network.identifier);
		runtimes.insert(network.id, NetworkRuntime { network, rpc, executor });
	}
	let runtimes = Arc::new(runtimes);

	let queue = ProvisionQueue::new(redis_connection, store.clone());
	let address_pool = AddressPool::new(
		store.clone(),
		cipher.clone(),
		operator.address(),
		settings.receive_address_validity(),
	);
	let engine = OrderEngine::new(
		store.clone(),
		queue.clone(),
		ProviderClient::new(),
		address_pool,
		cipher,
		operator,
		runtimes.clone(),
		EngineConfig {
			order_fulfillment_validity: settings.order_fulfillment_validity(),
			refund_cancellation_count: settings.refund_cancellation_count,
		},
	);

	let detector = DepositDetector::new(store.clone(), engine.clone());
	let (deposit_sender, deposit_receiver) = mpsc::channel(DEPOSIT_CHANNEL_BUFFER);
	scope.spawn(webhook::start(settings.webhook.clone(), deposit_sender));
	{
		let detector = detector.clone();
		scope.spawn(detector.run(deposit_receiver));
	}

	let poller = settings.enable_polling_fallback.then(|| {
		DepositPoller::new(
			store.clone(),
			detector,
			runtimes
				.values()
				.map(|runtime| (runtime.network.identifier.clone(), runtime.rpc.clone()))
				.collect(),
			settings.polling_min_age(),
		)
	});

	let indexer = Indexer::new(store, engine.clone());
	scheduler::start(scope, &settings, engine, queue, poller, indexer);

	let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
		.context("Failed to install SIGTERM handler")?;
	tokio::select! {
		result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
		_ = sigterm.recv() => {},
	}
	tracing::info!("Shutdown signal received, stopping");
	Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
	let settings = match Settings::load(CommandLineOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {error}");
			return Err(error.into())
		},
	};

	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init()
		.expect("setting default subscriber failed");

	task_scope::task_scope(|scope| async move { start(scope, settings).await }.boxed()).await
}
