// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The data source contract and the offline source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_flags_core::DataSourceState;
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;
use crate::updates::DataSourceUpdates;

/// A component that keeps the store up to date.
///
/// Sources push data through a [`DataSourceUpdates`] sink and report their
/// state on it. `start` spawns the background work and returns immediately;
/// `close` stops it and may be called any number of times.
#[async_trait]
pub trait DataSource: Send + Sync {
	/// Starts the background task. Later calls are ignored.
	fn start(&self) -> Result<()>;

	/// Returns true once the first full data set has been stored.
	fn is_initialized(&self) -> bool;

	/// Waits until the source is initialized, has shut down, or `timeout`
	/// elapses. Returns true only in the first case.
	async fn wait_for_initialization(&self, timeout: Duration) -> bool;

	/// Stops the source and reports [`DataSourceState::Off`].
	async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
	Pending,
	Ready,
	Failed,
}

/// One-shot initialization outcome shared between a source's background
/// task and callers of `wait_for_initialization`.
#[derive(Debug)]
pub(crate) struct ReadySignal {
	tx: watch::Sender<Readiness>,
}

impl ReadySignal {
	pub(crate) fn new() -> Self {
		let (tx, _rx) = watch::channel(Readiness::Pending);
		Self { tx }
	}

	/// Records success. Returns true the first time only.
	pub(crate) fn mark_ready(&self) -> bool {
		self.settle(Readiness::Ready)
	}

	/// Records that the source stopped before initializing.
	pub(crate) fn mark_failed(&self) -> bool {
		self.settle(Readiness::Failed)
	}

	fn settle(&self, outcome: Readiness) -> bool {
		self.tx.send_if_modified(|state| {
			if *state != Readiness::Pending {
				return false;
			}
			*state = outcome;
			true
		})
	}

	pub(crate) fn is_ready(&self) -> bool {
		*self.tx.borrow() == Readiness::Ready
	}

	pub(crate) async fn wait(&self, timeout: Duration) -> bool {
		let mut rx = self.tx.subscribe();
		let settled =
			tokio::time::timeout(timeout, rx.wait_for(|state| *state != Readiness::Pending)).await;
		match settled {
			Ok(Ok(state)) => *state == Readiness::Ready,
			_ => false,
		}
	}
}

/// A source that never connects anywhere.
///
/// It reports itself valid and initialized straight away, leaving the store
/// with whatever data it already holds. Used for offline clients and for
/// deployments where another process populates a shared persistent store.
#[derive(Debug)]
pub struct OfflineDataSource {
	updates: Arc<DataSourceUpdates>,
	started: AtomicBool,
	ready: ReadySignal,
}

impl OfflineDataSource {
	pub fn new(updates: Arc<DataSourceUpdates>) -> Self {
		Self {
			updates,
			started: AtomicBool::new(false),
			ready: ReadySignal::new(),
		}
	}
}

#[async_trait]
impl DataSource for OfflineDataSource {
	fn start(&self) -> Result<()> {
		if self.started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		info!("Starting in offline mode; no flag data will be fetched");
		self.updates.update_status(DataSourceState::Valid, None);
		self.ready.mark_ready();
		Ok(())
	}

	fn is_initialized(&self) -> bool {
		self.ready.is_ready()
	}

	async fn wait_for_initialization(&self, timeout: Duration) -> bool {
		self.ready.wait(timeout).await
	}

	async fn close(&self) {
		self.ready.mark_failed();
		self.updates.update_status(DataSourceState::Off, None);
	}
}
