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

//! Generic request retrier.
//!
//! Applies a timeout to each submission so requests cannot hang, and exponential
//! backoff with jitter between attempts. Attempts are bounded: once the limit is
//! reached the last error is returned to the caller. Errors wrapped in [NoRetry]
//! short-circuit the backoff entirely, for failures that are known to be permanent
//! (4xx responses, validation rejections).

use std::{
	any::Any,
	collections::{BTreeMap, VecDeque},
	fmt,
	pin::Pin,
	time::Duration,
};

use anyhow::Result;
use core::cmp::min;
use futures::Future;
use futures_util::stream::FuturesUnordered;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use utilities::{task_scope::Scope, UnendingStream};

use crate::constants::MAX_RPC_ATTEMPTS;

pub type TypedFutureGenerator<T, Client> = Pin<
	Box<dyn Fn(Client) -> Pin<Box<dyn Future<Output = Result<T, anyhow::Error>> + Send>> + Send>,
>;

type FutureAnyGenerator<Client> = TypedFutureGenerator<BoxAny, Client>;

// The id per *request* from the external caller. This is not tracking *submissions*.
type RequestId = u64;

pub type Attempt = u32;

type SubmissionFutureOutput = (RequestId, Result<BoxAny, (anyhow::Error, Attempt)>);
type SubmissionFuture = Pin<Box<dyn Future<Output = SubmissionFutureOutput> + Send + 'static>>;
type SubmissionFutures = FuturesUnordered<SubmissionFuture>;

type RetryDelays =
	FuturesUnordered<Pin<Box<dyn Future<Output = (RequestId, Attempt)> + Send + 'static>>>;

type BoxAny = Box<dyn Any + Send>;

type ResponseSender = oneshot::Sender<Result<BoxAny, anyhow::Error>>;

type RequestPackage<Client> = (ResponseSender, RequestLog, FutureAnyGenerator<Client>, Attempt);

type RequestSent<Client> = (ResponseSender, RequestLog, FutureAnyGenerator<Client>, Attempt);

/// Marker wrapper: an error that must not be retried. The retrier unwraps it before
/// handing the inner error back to the caller.
#[derive(Debug)]
pub struct NoRetry(pub anyhow::Error);

impl fmt::Display for NoRetry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::error::Error for NoRetry {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		Some(self.0.as_ref())
	}
}

/// Wraps `error` so the retrier returns it to the caller without further attempts.
pub fn no_retry(error: anyhow::Error) -> anyhow::Error {
	anyhow::Error::new(NoRetry(error))
}

#[derive(Clone, Debug)]
pub struct RequestLog {
	request_name: String,
	request_params: Option<String>,
}

impl RequestLog {
	pub fn new(request_name: String, request_params: Option<String>) -> Self {
		Self { request_name, request_params }
	}
}

impl fmt::Display for RequestLog {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.request_params {
			Some(params) => write!(f, "{}({params})", self.request_name),
			None => write!(f, "{}", self.request_name),
		}
	}
}

/// Tracks all the retries
#[derive(Clone)]
pub struct RetrierClient<Client> {
	request_sender: mpsc::Sender<RequestSent<Client>>,
}

struct RequestHolder<Client> {
	last_request_id: RequestId,
	stored_requests: BTreeMap<RequestId, RequestPackage<Client>>,
}

impl<Client> RequestHolder<Client> {
	fn new() -> Self {
		Self { last_request_id: 0, stored_requests: BTreeMap::new() }
	}

	fn insert(&mut self, request_id: RequestId, request: RequestPackage<Client>) {
		assert!(self.stored_requests.insert(request_id, request).is_none());
	}

	fn next_request_id(&mut self) -> RequestId {
		self.last_request_id += 1;
		self.last_request_id
	}

	fn remove(&mut self, request_id: &RequestId) -> Option<RequestPackage<Client>> {
		self.stored_requests.remove(request_id)
	}

	fn get(&self, request_id: &RequestId) -> Option<&RequestPackage<Client>> {
		self.stored_requests.get(request_id)
	}
}

// Buffers the number of futures that are currently running. And pushes to the buffer when
// a slot is available on a next() call.
struct SubmissionHolder {
	running_submissions: SubmissionFutures,
	maximum_submissions: u32,
	submissions_buffer: VecDeque<SubmissionFuture>,
}

impl SubmissionHolder {
	fn new(maximum_submissions: u32) -> Self {
		Self {
			running_submissions: SubmissionFutures::new(),
			maximum_submissions,
			submissions_buffer: Default::default(),
		}
	}

	fn push(&mut self, submission: SubmissionFuture) {
		if (self.running_submissions.len() as u32) < self.maximum_submissions {
			self.running_submissions.push(submission);
		} else {
			self.submissions_buffer.push_back(submission);
		}
	}

	async fn next_or_pending(&mut self) -> SubmissionFutureOutput {
		let next_output = self.running_submissions.next_or_pending().await;
		if let Some(buffered_submission) = self.submissions_buffer.pop_front() {
			self.running_submissions.push(buffered_submission);
		}
		next_output
	}
}

const MAX_DELAY_TIME: Duration = Duration::from_secs(10 * 60);

fn max_sleep_duration(initial_request_timeout: Duration, attempt: u32) -> Duration {
	min(MAX_DELAY_TIME, initial_request_timeout.saturating_mul(2u32.saturating_pow(attempt)))
}

// Creates a future of a particular submission.
fn submission_future<Client: Clone>(
	client: Client,
	retrier_name: &'static str,
	log: &RequestLog,
	submission_fn: &FutureAnyGenerator<Client>,
	request_id: RequestId,
	initial_request_timeout: Duration,
	attempt: Attempt,
) -> SubmissionFuture {
	let submission_fut = submission_fn(client);
	let log = log.clone();
	Box::pin(async move {
		(
			request_id,
			match tokio::time::timeout(
				max_sleep_duration(initial_request_timeout, attempt),
				submission_fut,
			)
			.await
			{
				Ok(Ok(t)) => Ok(t),
				Ok(Err(e)) => Err(e),
				Err(_) => Err(anyhow::anyhow!(
					"Retrier {retrier_name}: Request {request_id} of {log} timed out"
				)),
			}
			.map_err(|e| (e, attempt)),
		)
	})
}

/// Requests submitted to this client are retried with exponentially increasing delays
/// until they succeed, exhaust their attempt limit, or fail with a [NoRetry] error.
impl<Client: Clone + Send + Sync + 'static> RetrierClient<Client> {
	pub fn new<ClientFut: Future<Output = Client> + Send + 'static>(
		scope: &Scope<'_, anyhow::Error>,
		// The name of the retrier that appears in the logs.
		name: &'static str,
		client_fut: ClientFut,
		initial_request_timeout: Duration,
		maximum_concurrent_submissions: u32,
	) -> Self {
		let (request_sender, mut request_receiver) = mpsc::channel::<RequestSent<Client>>(1);

		let mut request_holder = RequestHolder::new();

		let mut retry_delays = RetryDelays::new();

		// This holds any submissions that are waiting for a slot to open up.
		let mut submission_holder = SubmissionHolder::new(maximum_concurrent_submissions);

		scope.spawn(async move {
			let primary_client = client_fut.await;
			loop {
				tokio::select! {
					Some((response_sender, log, closure, max_attempts)) = request_receiver.recv() => {
						let request_id = request_holder.next_request_id();
						submission_holder.push(submission_future(primary_client.clone(), name, &log, &closure, request_id, initial_request_timeout, 0));
						request_holder.insert(request_id, (response_sender, log, closure, max_attempts));
					},
					(request_id, result) = submission_holder.next_or_pending() => {
						match result {
							Ok(value) => {
								if let Some((response_sender, _, _, _)) = request_holder.remove(&request_id) {
									let _result = response_sender.send(Ok(value));
								}
							},
							Err((error, attempt)) => {
								let next_attempt = attempt.saturating_add(1);
								let exhausted = request_holder
									.get(&request_id)
									.is_some_and(|(_, _, _, max_attempts)| next_attempt >= *max_attempts);

								if error.downcast_ref::<NoRetry>().is_some() || exhausted {
									if let Some((response_sender, log, _, _)) = request_holder.remove(&request_id) {
										tracing::warn!("Retrier {name}: Request {request_id} of {log} failed after {next_attempt} attempt(s): {error:#}");
										let error = match error.downcast::<NoRetry>() {
											Ok(no_retry) => no_retry.0,
											Err(error) => error,
										};
										let _result = response_sender.send(Err(error));
									}
								} else {
									// Apply exponential back off with jitter to the retries.
									// We avoid small delays by always having a time of at least half.
									let half_max = max_sleep_duration(initial_request_timeout, attempt) / 2;
									let sleep_duration = half_max + rand::thread_rng().gen_range(Duration::default()..half_max);
									if let Some((_, log, _, _)) = request_holder.get(&request_id) {
										tracing::error!("Retrier {name}: Error for request_id {request_id} of {log}, attempt {attempt}: {error}. Delaying for {}ms", sleep_duration.as_millis());
									}

									// Delay the request before the next retry.
									retry_delays.push(Box::pin(
										async move {
											tokio::time::sleep(sleep_duration).await;
											(request_id, attempt)
										}
									));
								}
							},
						}
					},
					(request_id, attempt) = retry_delays.next_or_pending() => {
						let next_attempt = attempt.saturating_add(1);
						tracing::trace!("Retrier {name}: Retrying request_id: {request_id} for attempt: {next_attempt}");

						if let Some((response_sender, log, closure, _)) = request_holder.get(&request_id) {
							// If the receiver has been dropped, we don't need to retry.
							if !response_sender.is_closed() {
								submission_holder.push(submission_future(primary_client.clone(), name, log, closure, request_id, initial_request_timeout, next_attempt));
							} else {
								tracing::trace!("Retrier {name}: Dropped request_id: {request_id} not retrying.");
								request_holder.remove(&request_id);
							}
						}
					},
				}
			}
		});

		Self { request_sender }
	}

	// Separate function so we can more easily test.
	async fn send_request<T: Send + 'static>(
		&self,
		log: RequestLog,
		specific_closure: TypedFutureGenerator<T, Client>,
		max_attempts: Attempt,
	) -> oneshot::Receiver<Result<BoxAny, anyhow::Error>> {
		let future_any_fn: FutureAnyGenerator<Client> = Box::pin(move |client| {
			let future = specific_closure(client);
			Box::pin(async move {
				let result = future.await?;
				let result: BoxAny = Box::new(result);
				Ok(result)
			})
		});
		let (tx, rx) = oneshot::channel();
		let _result = self.request_sender.send((tx, log, future_any_fn, max_attempts)).await;
		rx
	}

	/// Requests something to be retried by the retry client, with the default attempt
	/// limit.
	pub async fn request<T: Send + 'static>(
		&self,
		log: RequestLog,
		specific_closure: TypedFutureGenerator<T, Client>,
	) -> Result<T, anyhow::Error> {
		self.request_with_limit(log, specific_closure, MAX_RPC_ATTEMPTS).await
	}

	pub async fn request_with_limit<T: Send + 'static>(
		&self,
		log: RequestLog,
		specific_closure: TypedFutureGenerator<T, Client>,
		max_attempts: Attempt,
	) -> Result<T, anyhow::Error> {
		let rx = self.send_request(log, specific_closure, max_attempts).await;
		let result = rx.await.map_err(|_| anyhow::anyhow!("Retrier dropped the request"))??;
		Ok(*result.downcast::<T>().expect(
			"We know we cast the T into an any, and it is a T that we are receiving. Hitting this is a programmer error.",
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures_util::FutureExt;
	use std::sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	};
	use tokio::time::timeout;
	use utilities::task_scope::task_scope;

	fn specific_fut_closure<T: Send + Sync + Clone + 'static, Client>(
		value: T,
		delay: Duration,
	) -> TypedFutureGenerator<T, Client> {
		Box::pin(move |_client| {
			let value = value.clone();
			Box::pin(async move {
				// We need to delay in the tests, else we'll resolve immediately, meaning the
				// channel is sent down, and can theoretically be replaced using the same
				// request id and the tests will still work despite there potentially being a
				// bug in the implementation.
				tokio::time::sleep(delay).await;
				Ok(value)
			})
		})
	}

	#[tokio::test]
	async fn requests_pulled_in_different_order_works() {
		task_scope(|scope| {
			async move {
				const INITIAL_TIMEOUT: Duration = Duration::from_millis(100);

				let retrier_client =
					RetrierClient::new(scope, "test", futures::future::ready(()), INITIAL_TIMEOUT, 100);

				const REQUEST_1: u32 = 32;
				let rx1 = retrier_client
					.send_request(
						RequestLog::new("request 1".to_string(), None),
						specific_fut_closure(REQUEST_1, INITIAL_TIMEOUT),
						MAX_RPC_ATTEMPTS,
					)
					.await;

				const REQUEST_2: u64 = 64;
				let rx2 = retrier_client
					.send_request(
						RequestLog::new("request 2".to_string(), None),
						specific_fut_closure(REQUEST_2, INITIAL_TIMEOUT),
						MAX_RPC_ATTEMPTS,
					)
					.await;

				// Receive items in a different order to sending
				assert_eq!(
					*rx2.await.unwrap().unwrap().downcast::<u64>().unwrap(),
					REQUEST_2
				);
				assert_eq!(
					*rx1.await.unwrap().unwrap().downcast::<u32>().unwrap(),
					REQUEST_1
				);

				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn using_the_request_interface_works() {
		task_scope(|scope| {
			async move {
				const INITIAL_TIMEOUT: Duration = Duration::from_millis(100);

				let retrier_client =
					RetrierClient::new(scope, "test", futures::future::ready(()), INITIAL_TIMEOUT, 100);

				const REQUEST_1: u32 = 32;
				assert_eq!(
					REQUEST_1,
					retrier_client
						.request(
							RequestLog::new("request 1".to_string(), None),
							specific_fut_closure(REQUEST_1, INITIAL_TIMEOUT),
						)
						.await
						.unwrap()
				);

				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap();
	}

	fn counting_failure_closure<Client>(
		attempts: Arc<AtomicU32>,
		permanent: bool,
	) -> TypedFutureGenerator<(), Client> {
		Box::pin(move |_client| {
			let attempts = attempts.clone();
			Box::pin(async move {
				attempts.fetch_add(1, Ordering::SeqCst);
				if permanent {
					Err(no_retry(anyhow::anyhow!("rejected")))
				} else {
					Err(anyhow::anyhow!("transient failure"))
				}
			})
		})
	}

	#[tokio::test]
	async fn attempts_are_bounded() {
		task_scope(|scope| {
			async move {
				const INITIAL_TIMEOUT: Duration = Duration::from_millis(5);

				let retrier_client =
					RetrierClient::new(scope, "test", futures::future::ready(()), INITIAL_TIMEOUT, 100);

				let attempts = Arc::new(AtomicU32::new(0));
				let result = retrier_client
					.request_with_limit(
						RequestLog::new("always fails".to_string(), None),
						counting_failure_closure(attempts.clone(), false),
						3,
					)
					.await;

				assert!(result.is_err());
				assert_eq!(attempts.load(Ordering::SeqCst), 3);

				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn no_retry_errors_fail_immediately() {
		task_scope(|scope| {
			async move {
				const INITIAL_TIMEOUT: Duration = Duration::from_millis(5);

				let retrier_client =
					RetrierClient::new(scope, "test", futures::future::ready(()), INITIAL_TIMEOUT, 100);

				let attempts = Arc::new(AtomicU32::new(0));
				let result = retrier_client
					.request_with_limit(
						RequestLog::new("permanent".to_string(), None),
						counting_failure_closure(attempts.clone(), true),
						10,
					)
					.await;

				assert_eq!(result.unwrap_err().to_string(), "rejected");
				assert_eq!(attempts.load(Ordering::SeqCst), 1);

				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn once_at_max_concurrent_submissions_cannot_submit_more() {
		task_scope(|scope| {
			async move {
				const DELAY: Duration = Duration::from_millis(200);
				const INITIAL_TIMEOUT: Duration = Duration::from_millis(1000);

				let retrier_client =
					RetrierClient::new(scope, "test", futures::future::ready(()), INITIAL_TIMEOUT, 2);

				// Requests 1 and 2 fill the future buffer.
				const REQUEST_1: u32 = 32;
				let _rx1 = retrier_client
					.send_request(
						RequestLog::new("request 1".to_string(), None),
						specific_fut_closure(REQUEST_1, DELAY),
						MAX_RPC_ATTEMPTS,
					)
					.await;

				const REQUEST_2: u64 = 64;
				let _rx2 = retrier_client
					.send_request(
						RequestLog::new("request 2".to_string(), None),
						specific_fut_closure(REQUEST_2, DELAY),
						MAX_RPC_ATTEMPTS,
					)
					.await;

				// The submission buffer is full with the first two requests, so a request
				// that would otherwise resolve instantly must wait for a free slot.
				const REQUEST_3: u128 = 128;
				timeout(
					Duration::from_millis(100),
					retrier_client.request(
						RequestLog::new("request 3".to_string(), None),
						specific_fut_closure(REQUEST_3, Duration::default()),
					),
				)
				.await
				.unwrap_err();

				assert_eq!(
					timeout(
						Duration::from_millis(600),
						retrier_client.request(
							RequestLog::new("request 3".to_string(), None),
							specific_fut_closure(REQUEST_3, Duration::default()),
						),
					)
					.await
					.unwrap()
					.unwrap(),
					REQUEST_3,
				);

				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap();
	}
}
