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

//! Health endpoint for the engine, allowing external services to check it is online.
//! Returns a HTTP 200 response to any request on {hostname}:{port}/health

use anyhow::Context;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
};

use crate::settings;

pub struct HealthChecker {
	listener: TcpListener,
}

// Split into new and run so the listener is known to be bound before tests proceed.
impl HealthChecker {
	pub async fn new(health_check_settings: &settings::HealthCheck) -> anyhow::Result<Self> {
		let bind_address =
			format!("{}:{}", health_check_settings.hostname, health_check_settings.port);

		tracing::info!("Starting health check server on {bind_address}");

		Ok(Self {
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind TCP listener to {bind_address}"))?,
		})
	}

	pub async fn run(self) -> anyhow::Result<()> {
		loop {
			match self.listener.accept().await {
				Ok((mut stream, _address)) => {
					let mut buffer = [0; 1024];
					stream
						.read(&mut buffer)
						.await
						.context("Couldn't read stream into buffer")?;

					let mut headers = [httparse::EMPTY_HEADER; 16];
					let mut request = httparse::Request::new(&mut headers);
					match request.parse(&buffer) {
						Ok(_) =>
							if request.path.eq(&Some("/health")) {
								let http_200_response = "HTTP/1.1 200 OK\r\n\r\n";
								stream
									.write_all(http_200_response.as_bytes())
									.await
									.context("Could not write to health check stream")?;
								stream
									.flush()
									.await
									.context("Could not flush health check TCP stream")?;
							} else {
								tracing::warn!(
									"Requested health at invalid path: {:?}",
									request.path
								);
							},
						Err(error) => {
							tracing::warn!(
								"Invalid health check request, could not parse: {error}"
							);
						},
					}
				},
				Err(error) => {
					tracing::error!("Could not open health check TCP stream: {error}");
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn health_check_test() {
		let health_check =
			settings::HealthCheck { hostname: "127.0.0.1".to_string(), port: 5556 };

		tokio::spawn(HealthChecker::new(&health_check).await.unwrap().run());

		let request_test = |path: &'static str, expected_status: Option<reqwest::StatusCode>| {
			let health_check = health_check.clone();
			async move {
				assert_eq!(
					expected_status,
					reqwest::get(&format!(
						"http://{}:{}/{}",
						&health_check.hostname, &health_check.port, path
					))
					.await
					.ok()
					.map(|x| x.status()),
				);
			}
		};

		request_test("health", Some(reqwest::StatusCode::from_u16(200).unwrap())).await;
		request_test("invalid", None).await;
	}
}
