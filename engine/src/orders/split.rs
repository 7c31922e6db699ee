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

//! Lock planning: how one escrowed order is distributed over providers pulled from
//! the head of a bucket queue. When the head provider cannot carry the full amount,
//! consecutive heads each take their maximum until the order is covered.

use bigdecimal::{BigDecimal, Zero};

use crate::queue::QueueEntry;

/// One planned lock: the provider and the portion of the order it carries.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedLock {
	pub entry: QueueEntry,
	pub amount: BigDecimal,
}

/// Plans the lock set for `amount` over `entries`, in the order the queue rotation
/// produced them. Returns `None` when the queued providers cannot cover the amount;
/// the order then stays unassigned until the queue changes or the refund timer fires.
pub fn plan_locks(amount: &BigDecimal, entries: &[QueueEntry]) -> Option<Vec<PlannedLock>> {
	if amount <= &BigDecimal::zero() {
		return None
	}

	let mut remaining = amount.clone();
	let mut planned = Vec::new();

	for entry in entries {
		if remaining <= BigDecimal::zero() {
			break
		}
		if entry.max_order_amount <= BigDecimal::zero() {
			continue
		}

		if entry.covers(&remaining) {
			planned.push(PlannedLock { entry: entry.clone(), amount: remaining.clone() });
			remaining = BigDecimal::zero();
			break
		}

		// Provider too small for the remainder: it takes its maximum and the next
		// head continues. Providers whose minimum exceeds the remainder are skipped.
		if entry.max_order_amount < remaining {
			planned.push(PlannedLock {
				entry: entry.clone(),
				amount: entry.max_order_amount.clone(),
			});
			remaining = remaining - &entry.max_order_amount;
		}
	}

	if remaining > BigDecimal::zero() {
		None
	} else {
		Some(planned)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	fn entry(provider: &str, min: &str, max: &str) -> QueueEntry {
		QueueEntry {
			provider_id: provider.to_string(),
			token_symbol: "USDT".to_string(),
			rate: BigDecimal::from_str("1500").unwrap(),
			min_order_amount: BigDecimal::from_str(min).unwrap(),
			max_order_amount: BigDecimal::from_str(max).unwrap(),
		}
	}

	fn decimal(s: &str) -> BigDecimal {
		BigDecimal::from_str(s).unwrap()
	}

	#[test]
	fn single_provider_covers_the_whole_order() {
		let plan = plan_locks(&decimal("0.5"), &[entry("P1", "0.1", "600")]).unwrap();
		assert_eq!(plan.len(), 1);
		assert_eq!(plan[0].entry.provider_id, "P1");
		assert_eq!(plan[0].amount, decimal("0.5"));
	}

	#[test]
	fn splits_across_consecutive_heads() {
		let plan = plan_locks(
			&decimal("1000"),
			&[entry("P1", "1", "600"), entry("P2", "1", "500")],
		)
		.unwrap();

		assert_eq!(plan.len(), 2);
		assert_eq!(plan[0].amount, decimal("600"));
		assert_eq!(plan[1].entry.provider_id, "P2");
		assert_eq!(plan[1].amount, decimal("400"));
	}

	#[test]
	fn skips_providers_whose_minimum_exceeds_the_remainder() {
		// P2's minimum is above the 400 remainder, so P3 picks it up.
		let plan = plan_locks(
			&decimal("1000"),
			&[entry("P1", "1", "600"), entry("P2", "450", "500"), entry("P3", "1", "500")],
		)
		.unwrap();

		assert_eq!(plan.len(), 2);
		assert_eq!(plan[1].entry.provider_id, "P3");
		assert_eq!(plan[1].amount, decimal("400"));
	}

	#[test]
	fn insufficient_capacity_yields_no_plan() {
		assert_eq!(plan_locks(&decimal("1000"), &[entry("P1", "1", "600")]), None);
		assert_eq!(plan_locks(&decimal("1000"), &[]), None);
	}

	#[test]
	fn zero_amount_yields_no_plan() {
		assert_eq!(plan_locks(&decimal("0"), &[entry("P1", "1", "600")]), None);
	}

	#[test]
	fn planned_amounts_always_sum_to_the_order_amount() {
		let entries =
			[entry("P1", "1", "300"), entry("P2", "1", "300"), entry("P3", "1", "500")];
		let amount = decimal("900");

		let plan = plan_locks(&amount, &entries).unwrap();
		let total = plan
			.iter()
			.fold(BigDecimal::zero(), |total, lock| total + &lock.amount);
		assert_eq!(total, amount);
	}
}
