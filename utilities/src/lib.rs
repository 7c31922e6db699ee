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

pub mod redact_endpoint_secret;
pub mod task_scope;

pub use redact_endpoint_secret::SecretUrl;

use anyhow::{anyhow, Context, Result};
use futures::Stream;
use futures_util::StreamExt;
use std::{path::Path, time::Duration};

/// Makes a tick that outputs every `interval` but if ticks are "missed" (as tick() wasn't called)
/// the ticks do not "burst" to catch up.
pub fn make_periodic_tick(interval: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() + if yield_immediately { Duration::ZERO } else { interval },
		interval,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}

/// Returns the stream's next item, or a future that never resolves if the stream is exhausted.
/// Intended for use inside `tokio::select!` loops where an empty stream should simply not be
/// selected rather than terminate the loop.
pub trait UnendingStream: Stream + Unpin {
	fn next_or_pending(&mut self) -> impl std::future::Future<Output = Self::Item> + Send
	where
		Self: Send,
		Self::Item: Send,
	{
		async move {
			match self.next().await {
				Some(item) => item,
				None => futures::future::pending().await,
			}
		}
	}
}

impl<S: Stream + Unpin> UnendingStream for S {}

/// Decodes a hex string into a fixed-width byte type, accepting an optional `0x` prefix.
pub fn clean_hex_address<A: TryFrom<Vec<u8>>>(address_str: &str) -> Result<A> {
	let address_hex_str = address_str.strip_prefix("0x").unwrap_or(address_str);
	let hex_decoded = hex::decode(address_hex_str).context("Invalid hex")?;
	A::try_from(hex_decoded).map_err(|_| anyhow!("Invalid address length"))
}

/// Reads a hex-encoded secret from a file, stripping whitespace and any `0x` prefix before
/// handing the cleaned string to `t`.
pub fn read_clean_and_decode_hex_str_file<V, T: FnOnce(&str) -> Result<V>>(
	file: &Path,
	context: &str,
	t: T,
) -> Result<V> {
	std::fs::read_to_string(file)
		.with_context(|| format!("Failed to read {context} file at {}", file.display()))
		.and_then(|string| {
			let mut str = string.as_str();
			str = str.trim();
			str = str.trim_matches(['"', '\'']);
			str = str.strip_prefix("0x").unwrap_or(str);
			// Verify the hex decodes before passing it on, so the caller's error doesn't
			// have to explain itself.
			hex::decode(str).with_context(|| format!("Invalid hex in {context} file"))?;
			t(str)
		})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[tokio::test]
	async fn make_periodic_tick_not_bursty() {
		let mut tick = make_periodic_tick(Duration::from_millis(10), false);
		tokio::time::sleep(Duration::from_millis(50)).await;
		tick.tick().await;
		// A second tick must wait a full period rather than fire immediately.
		assert!(
			tokio::time::timeout(Duration::from_millis(2), tick.tick()).await.is_err(),
			"missed ticks should not burst"
		);
	}

	#[tokio::test]
	async fn make_periodic_tick_yields_immediately_when_asked() {
		let mut tick = make_periodic_tick(Duration::from_secs(100), true);
		tokio::time::timeout(Duration::from_millis(10), tick.tick())
			.await
			.expect("first tick should be immediate");
	}

	#[test]
	fn cleans_hex_addresses() {
		let expected: [u8; 20] = hex::decode("541f563237a309b3a61e33bdf07a8930bdba8d99")
			.unwrap()
			.try_into()
			.unwrap();

		assert_eq!(
			clean_hex_address::<[u8; 20]>("0x541f563237A309B3A61E33BDf07a8930Bdba8D99").unwrap(),
			expected
		);
		assert_eq!(
			clean_hex_address::<[u8; 20]>("541f563237A309B3A61E33BDf07a8930Bdba8D99").unwrap(),
			expected
		);
		assert!(clean_hex_address::<[u8; 20]>("0x541f").is_err());
		assert!(clean_hex_address::<[u8; 20]>("not hex").is_err());
	}

	#[test]
	fn reads_and_cleans_hex_str_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "  0xdeadbeef  ").unwrap();

		let decoded = read_clean_and_decode_hex_str_file(file.path(), "test secret", |str| {
			Ok(hex::decode(str).unwrap())
		})
		.unwrap();

		assert_eq!(decoded, vec![0xde, 0xad, 0xbe, 0xef]);
	}

	#[test]
	fn rejects_non_hex_file_contents() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "certainly not hex").unwrap();

		assert!(
			read_clean_and_decode_hex_str_file(file.path(), "test secret", |str| Ok(str.to_owned()))
				.is_err()
		);
	}
}
