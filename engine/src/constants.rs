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

use std::time::Duration;

// ======= Rpc clients =======

/// Per-call timeout applied by the retrier before backing off.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Duration between connection attempts while waiting for an EVM node at startup.
pub const RPC_RETRY_CONNECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Transient failures are retried with exponential backoff up to this many attempts.
pub const MAX_RPC_ATTEMPTS: u32 = 3;

pub const MAX_CONCURRENT_SUBMISSIONS: u32 = 100;

// ======= Account abstraction =======

/// EntryPoint v0.7.
pub const ENTRY_POINT_ADDRESS: &str = "0x0000000071727De22E5E9d8baF0edAc6f37da032";

/// Light-Account-Factory v2.
pub const LIGHT_ACCOUNT_FACTORY_ADDRESS: &str = "0x0000000000400CdFef5E2714E63d8040b700BC24";

/// LightAccount `execute(address,uint256,bytes)`.
pub const EXECUTE_SELECTOR: [u8; 4] = [0xb6, 0x1d, 0x27, 0xf6];

/// LightAccount `executeBatch((address,uint256,bytes)[])`.
pub const EXECUTE_BATCH_SELECTOR: [u8; 4] = [0x18, 0xdf, 0xb3, 0xc7];

pub const PAYMASTER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long we poll `eth_getUserOperationReceipt` before giving up on a submission.
pub const USER_OP_RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);

pub const USER_OP_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Gas limit used for EOA-path transactions.
pub const EOA_GAS_LIMIT: u64 = 300_000;

// Initial gas estimates handed to the paymaster for simulation. The sponsor refines
// these; omitting them entirely is an AA23.
pub const INITIAL_CALL_GAS_LIMIT: u64 = 300_000;
pub const INITIAL_VERIFICATION_GAS_LIMIT: u64 = 500_000;
pub const INITIAL_PRE_VERIFICATION_GAS: u64 = 100_000;

// ======= Indexer =======

/// Maximum block window scanned per indexer tick.
pub const INDEXER_BLOCK_WINDOW: u64 = 2_000;

/// How far back the deposit poller searches for the funding transfer when it has
/// no indexed block to resume from.
pub const DEPOSIT_LOOKBACK_BLOCKS: u64 = 10_000;

// ======= Provider nodes =======

pub const PROVIDER_NODE_TIMEOUT: Duration = Duration::from_secs(10);

// ======= Deposit detection =======

/// Accepted deviation between the observed deposit and the expected total, in percent.
pub const DEPOSIT_TOLERANCE_PERCENT: u64 = 1;

/// Over-paid orders older than this with a `P#P` memo get their rate refreshed.
pub const P2P_RATE_REFRESH_AGE: Duration = Duration::from_secs(30 * 60);

/// Interval between deposit-poller metrics summaries.
pub const POLLER_METRICS_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ======= Settings environment variables =======

pub const DEFAULT_CONFIG_ROOT: &str = "/etc/offramp";
pub const CONFIG_ROOT: &str = "OFFRAMP_CONFIG_ROOT";
