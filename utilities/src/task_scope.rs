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

//! Structured concurrency for the engine's long-lived tasks.
//!
//! A scope ties the lifetime of a set of spawned tasks to a parent future. If any
//! spawned task returns an error the whole scope is torn down and the error is
//! returned from [task_scope]; when the parent future completes, all still-running
//! tasks are cancelled. Panics in spawned tasks are propagated.

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use std::marker::PhantomData;
use tokio::{
	sync::mpsc,
	task::{JoinError, JoinHandle},
};

/// Handle used to spawn tasks into the enclosing scope.
pub struct Scope<'env, Error: Send + 'static> {
	sender: mpsc::UnboundedSender<JoinHandle<Result<(), Error>>>,
	/// Invariant over 'env, so a Scope cannot outlive the task_scope call it was made by.
	_phantom: PhantomData<&'env mut &'env ()>,
}

impl<'env, Error: Send + 'static> Scope<'env, Error> {
	pub fn spawn<F>(&self, task: F)
	where
		F: std::future::Future<Output = Result<(), Error>> + Send + 'static,
	{
		let handle = tokio::spawn(task);
		if let Err(mpsc::error::SendError(handle)) = self.sender.send(handle) {
			// The scope is already shutting down.
			handle.abort();
		}
	}
}

fn propagate_panics<Error>(join_result: Result<Result<(), Error>, JoinError>) -> Option<Error> {
	match join_result {
		Ok(Ok(())) => None,
		Ok(Err(error)) => Some(error),
		Err(join_error) => match join_error.try_into_panic() {
			Ok(panic) => std::panic::resume_unwind(panic),
			Err(_cancelled) => None,
		},
	}
}

/// Runs `scoped_fn` with a [Scope] that its tasks are spawned into, and drives those
/// tasks alongside it.
///
/// Returns the parent future's result once it completes, after aborting and draining
/// any tasks that are still running. If a spawned task errors first, its error is
/// returned instead.
pub async fn task_scope<'env, T, Error, ScopedFn>(scoped_fn: ScopedFn) -> Result<T, Error>
where
	Error: Send + 'static,
	ScopedFn: for<'scope> FnOnce(&'scope Scope<'env, Error>) -> BoxFuture<'scope, Result<T, Error>>,
{
	let (sender, mut receiver) = mpsc::unbounded_channel();
	let scope = Scope { sender, _phantom: PhantomData };

	let mut handles: FuturesUnordered<JoinHandle<Result<(), Error>>> = FuturesUnordered::new();

	let result = {
		let mut parent = scoped_fn(&scope);
		loop {
			tokio::select! {
				result = &mut parent => break result,
				Some(handle) = receiver.recv() => handles.push(handle),
				Some(join_result) = handles.next() => {
					if let Some(error) = propagate_panics(join_result) {
						break Err(error)
					}
				},
			}
		}
	};

	// Tear down: no new spawns are accepted, all remaining tasks are cancelled and
	// awaited so nothing outlives the scope.
	drop(scope);
	while let Ok(handle) = receiver.try_recv() {
		handles.push(handle);
	}
	for handle in handles.iter() {
		handle.abort();
	}
	while let Some(join_result) = handles.next().await {
		propagate_panics(join_result);
	}

	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::FutureExt;
	use std::time::Duration;

	#[tokio::test]
	async fn parent_result_is_returned() {
		let result: Result<u32, anyhow::Error> =
			task_scope(|_scope| async move { Ok(42) }.boxed()).await;
		assert_eq!(result.unwrap(), 42);
	}

	#[tokio::test]
	async fn task_error_cancels_scope() {
		let result: Result<(), anyhow::Error> = task_scope(|scope| {
			async move {
				scope.spawn(async move { Err(anyhow::anyhow!("task failed")) });
				// The parent would otherwise run forever.
				futures::future::pending::<()>().await;
				Ok(())
			}
			.boxed()
		})
		.await;

		assert_eq!(result.unwrap_err().to_string(), "task failed");
	}

	#[tokio::test]
	async fn running_tasks_are_cancelled_when_parent_completes() {
		let (sender, receiver) = tokio::sync::oneshot::channel::<()>();

		let result: Result<(), anyhow::Error> = task_scope(|scope| {
			async move {
				scope.spawn(async move {
					futures::future::pending::<()>().await;
					// Unreachable: dropping the sender signals cancellation instead.
					let _ = sender.send(());
					Ok(())
				});
				tokio::time::sleep(Duration::from_millis(10)).await;
				Ok(())
			}
			.boxed()
		})
		.await;

		assert!(result.is_ok());
		assert!(receiver.await.is_err(), "task should have been cancelled, not completed");
	}

	#[tokio::test]
	#[should_panic(expected = "scoped task panicked")]
	async fn task_panic_propagates() {
		let _result: Result<(), anyhow::Error> = task_scope(|scope| {
			async move {
				scope.spawn(async move { panic!("scoped task panicked") });
				futures::future::pending::<()>().await;
				Ok(())
			}
			.boxed()
		})
		.await;
	}
}
