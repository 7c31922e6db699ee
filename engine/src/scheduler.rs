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

//! Periodic job drivers. All jobs are singleton per process; running one engine
//! instance per network (or an external leader lock) is a deployment concern. A
//! failing tick is logged and retried on the next one, never fatal.

use std::time::Duration;

use utilities::{make_periodic_tick, task_scope::Scope};

use crate::{
	constants::POLLER_METRICS_INTERVAL,
	deposit::poller::DepositPoller,
	evm::retry_rpc::EvmRetryRpcApi,
	indexer::Indexer,
	orders::OrderEngine,
	queue::ProvisionQueue,
	settings::Settings,
};

const PROVIDER_BALANCE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Multiple of a network's block time between indexer ticks.
const INDEXER_TICK_BLOCK_FACTOR: u64 = 2;

pub fn start<Rpc: EvmRetryRpcApi>(
	scope: &Scope<'_, anyhow::Error>,
	settings: &Settings,
	engine: OrderEngine<Rpc>,
	queue: ProvisionQueue,
	poller: Option<DepositPoller<Rpc>>,
	indexer: Indexer<Rpc>,
) {
	// Queue rebuild; outside production also once immediately on startup.
	{
		let queue = queue.clone();
		let interval = settings.bucket_queue_rebuild_interval();
		let rebuild_on_startup = !settings.is_production();
		scope.spawn(async move {
			let mut tick = make_periodic_tick(interval, rebuild_on_startup);
			loop {
				tick.tick().await;
				if let Err(error) = queue.rebuild().await {
					tracing::error!("Provision queue rebuild failed: {error:#}");
				}
			}
		});
	}

	// Deposit polling fallback plus its metrics summary.
	if let Some(poller) = poller {
		let interval = settings.polling_interval();
		let metrics = poller.metrics();
		scope.spawn(async move {
			let mut tick = make_periodic_tick(interval, false);
			loop {
				tick.tick().await;
				if let Err(error) = poller.tick().await {
					tracing::error!("Deposit poll failed: {error:#}");
				}
			}
		});
		scope.spawn(async move {
			let mut tick = make_periodic_tick(POLLER_METRICS_INTERVAL, false);
			loop {
				tick.tick().await;
				metrics.log_and_reset();
			}
		});
	}

	// Settle-proof polling keeps lock fulfilment moving between indexer events.
	{
		let engine = engine.clone();
		let interval = settings.polling_interval();
		scope.spawn(async move {
			let mut tick = make_periodic_tick(interval, false);
			loop {
				tick.tick().await;
				if let Err(error) = engine.poll_settle_proofs().await {
					tracing::error!("Settle-proof poll failed: {error:#}");
				}
			}
		});
	}

	// Stale-order sweep: lock timeouts, receive-address expiry, and catch-up work
	// for orders stuck before escrow or before assignment.
	{
		let engine = engine.clone();
		let interval = settings.order_refund_timeout();
		scope.spawn(async move {
			let mut tick = make_periodic_tick(interval, false);
			loop {
				tick.tick().await;
				if let Err(error) = engine.sweep_stale_locks().await {
					tracing::error!("Stale lock sweep failed: {error:#}");
				}
				if let Err(error) = engine.reoffer_cancelled_locks().await {
					tracing::error!("Cancelled-lock re-offer failed: {error:#}");
				}
				if let Err(error) = engine.sweep_expired_receive_addresses().await {
					tracing::error!("Receive-address expiry sweep failed: {error:#}");
				}
				if let Err(error) = engine.retry_pending_orders().await {
					tracing::error!("Pending-order retry failed: {error:#}");
				}
				if let Err(error) = engine.assign_unmatched_orders().await {
					tracing::error!("Unmatched-order assignment failed: {error:#}");
				}
			}
		});
	}

	// Provider balance refresh from each node's /info.
	{
		let engine = engine.clone();
		scope.spawn(async move {
			let mut tick = make_periodic_tick(PROVIDER_BALANCE_REFRESH_INTERVAL, true);
			loop {
				tick.tick().await;
				if let Err(error) = engine.refresh_provider_balances().await {
					tracing::error!("Provider balance refresh failed: {error:#}");
				}
			}
		});
	}

	// One indexer driver per network, paced by that network's block time.
	for runtime in engine.networks().values() {
		let indexer = indexer.clone();
		let runtime = runtime.clone();
		let interval = Duration::from_secs(
			(runtime.network.block_time_seconds.max(1) as u64) * INDEXER_TICK_BLOCK_FACTOR,
		);
		scope.spawn(async move {
			let mut tick = make_periodic_tick(interval, true);
			loop {
				tick.tick().await;
				if let Err(error) = indexer.tick(&runtime).await {
					tracing::error!(
						"Indexer tick on {} failed: {error:#}",
						runtime.network.identifier
					);
				}
			}
		});
	}
}
