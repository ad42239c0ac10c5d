// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconnect delay state for data sources.
//!
//! The state is an explicit value owned by the reconnect loop. After `N`
//! delays have been handed out since the last reset, the next delay is
//! `min(initial * 2^N, max)` scaled by a jitter factor in `[0.5, 1.0]`.

use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	attempt: u32,
	jitter: bool,
}

impl Backoff {
	/// Creates a jittered backoff. `max` is raised to `initial` if smaller.
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self {
			initial,
			max: max.max(initial),
			attempt: 0,
			jitter: true,
		}
	}

	/// Creates a backoff that always returns the unjittered delay.
	pub fn without_jitter(initial: Duration, max: Duration) -> Self {
		Self {
			jitter: false,
			..Self::new(initial, max)
		}
	}

	/// Number of delays handed out since the last reset.
	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	/// The capped delay for the current attempt, before jitter.
	pub fn base_delay(&self) -> Duration {
		// Overflow means the product is past any representable max.
		2u32
			.checked_pow(self.attempt)
			.and_then(|factor| self.initial.checked_mul(factor))
			.map_or(self.max, |delay| delay.min(self.max))
	}

	/// Returns the delay to wait before the next attempt and advances the
	/// failure count.
	pub fn next_delay(&mut self) -> Duration {
		let base = self.base_delay();
		self.attempt = self.attempt.saturating_add(1);

		if !self.jitter {
			return base;
		}
		let jitter_factor = 0.5 + fastrand::f64() * 0.5;
		base.mul_f64(jitter_factor).min(base)
	}

	/// Forgets every failure so the next delay is the initial one again.
	pub fn reset(&mut self) {
		self.attempt = 0;
	}
}
