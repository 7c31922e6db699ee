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

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

const MAX_SECRET_CHARS_REVEALED: usize = 4;

/// A wrapper around a `String` representing a URL that may carry a secret (typically an
/// API key in a path segment). `Display` and `Debug` redact the secret, so endpoints can
/// be logged freely. Use [SecretUrl::as_ref] to get at the unredacted string.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(transparent)]
pub struct SecretUrl(String);

impl SecretUrl {
	pub fn into_inner(self) -> String {
		self.0
	}
}

impl AsRef<str> for SecretUrl {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

impl From<String> for SecretUrl {
	fn from(url: String) -> Self {
		SecretUrl(url)
	}
}

impl From<&str> for SecretUrl {
	fn from(url: &str) -> Self {
		SecretUrl(url.to_string())
	}
}

impl fmt::Display for SecretUrl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", redact_secret_endpoint(&self.0))
	}
}

impl fmt::Debug for SecretUrl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", redact_secret_endpoint(&self.0))
	}
}

fn redact_segment(segment: &str) -> String {
	if segment.len() > MAX_SECRET_CHARS_REVEALED {
		format!("{}****", &segment[..MAX_SECRET_CHARS_REVEALED])
	} else {
		segment.to_string()
	}
}

/// Keeps the scheme and host of `endpoint` intact and truncates every path segment to
/// at most [MAX_SECRET_CHARS_REVEALED] visible characters. Unparseable endpoints are
/// redacted wholesale.
pub fn redact_secret_endpoint(endpoint: &str) -> String {
	match Url::parse(endpoint) {
		Ok(url) if url.host_str().is_some() => {
			let mut redacted = format!(
				"{}://{}{}",
				url.scheme(),
				url.host_str().expect("checked above"),
				url.port().map(|port| format!(":{port}")).unwrap_or_default()
			);
			if let Some(segments) = url.path_segments() {
				for segment in segments.filter(|segment| !segment.is_empty()) {
					redacted.push('/');
					redacted.push_str(&redact_segment(segment));
				}
			}
			redacted
		},
		_ => redact_segment(endpoint),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn redacts_api_key_path_segment() {
		let secret: SecretUrl =
			"https://eth-sepolia.g.alchemy.com/v2/4nK2PdrVZGbRdqMrYOhQMIBvFDeGqVaV".into();
		assert_eq!(secret.to_string(), "https://eth-sepolia.g.alchemy.com/v2/4nK2****");
		assert_eq!(format!("{secret:?}"), "\"https://eth-sepolia.g.alchemy.com/v2/4nK2****\"");
	}

	#[test]
	fn keeps_short_segments_and_ports() {
		let secret: SecretUrl = "http://localhost:8545/rpc".into();
		assert_eq!(secret.to_string(), "http://localhost:8545/rpc");
	}

	#[test]
	fn redacts_unparseable_endpoints() {
		let secret: SecretUrl = "definitely-not-a-url-with-a-secret".into();
		assert_eq!(secret.to_string(), "defi****");
	}

	#[test]
	fn as_ref_is_unredacted() {
		let secret: SecretUrl = "https://example.com/secretsecret".into();
		assert_eq!(secret.as_ref(), "https://example.com/secretsecret");
	}
}
