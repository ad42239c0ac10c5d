// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Update sinks connecting stores and data sources to status listeners.
//!
//! [`DataStoreUpdates`] is handed to a store so it can report availability.
//! [`DataSourceUpdates`] is handed to a data source: it forwards data into the
//! store in call order and relays the source's own state.

use std::sync::Arc;

use loom_flags_core::{
	DataKind, DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus,
	FullDataSet, Item, StoreStatus,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::broadcast::{StatusBroadcaster, StatusListener};
use crate::error::Result;
use crate::store::DataStore;

/// Sink through which a store reports its availability.
#[derive(Debug)]
pub struct DataStoreUpdates {
	status: Mutex<StoreStatus>,
	broadcaster: StatusBroadcaster<StoreStatus>,
}

impl DataStoreUpdates {
	/// Creates a sink that starts out available.
	pub fn new(broadcaster: StatusBroadcaster<StoreStatus>) -> Self {
		Self {
			status: Mutex::new(StoreStatus::available()),
			broadcaster,
		}
	}

	/// Returns the last reported status.
	pub fn status(&self) -> StoreStatus {
		*self.status.lock()
	}

	/// Records a new status and broadcasts it if it differs from the last one.
	pub fn update_status(&self, new_status: StoreStatus) {
		let mut status = self.status.lock();
		if *status == new_status {
			return;
		}
		*status = new_status;
		debug!(
			available = new_status.available,
			refresh_needed = new_status.refresh_needed,
			"Data store status changed"
		);
		self.broadcaster.broadcast(new_status);
	}

	/// Subscribes to store status changes.
	pub fn add_listener(&self) -> StatusListener<StoreStatus> {
		self.broadcaster.add_listener()
	}
}

/// Sink through which a data source pushes data and reports its state.
///
/// Calls are applied in the order received with no batching. Out-of-order
/// and duplicate data is left to the store's version check.
pub struct DataSourceUpdates {
	store: Arc<dyn DataStore>,
	status: Mutex<DataSourceStatus>,
	broadcaster: StatusBroadcaster<DataSourceStatus>,
	store_status: Arc<DataStoreUpdates>,
}

impl DataSourceUpdates {
	pub fn new(
		store: Arc<dyn DataStore>,
		broadcaster: StatusBroadcaster<DataSourceStatus>,
		store_status: Arc<DataStoreUpdates>,
	) -> Self {
		Self {
			store,
			status: Mutex::new(DataSourceStatus::initializing()),
			broadcaster,
			store_status,
		}
	}

	/// Replaces the store's contents. Returns false if the store failed.
	pub async fn init(&self, data: FullDataSet) -> bool {
		let count = data.len();
		match self.store.init(data).await {
			Ok(()) => {
				info!(items = count, "Data store initialized");
				true
			}
			Err(e) => {
				error!(error = %e, "Failed to initialize data store");
				self.update_status(
					DataSourceState::Interrupted,
					Some(DataSourceErrorInfo::new(
						DataSourceErrorKind::StoreError,
						e.to_string(),
					)),
				);
				false
			}
		}
	}

	/// Upserts a single item. Returns `Ok(true)` only if the write was
	/// applied; a stale item is `Ok(false)`.
	///
	/// # Errors
	///
	/// Returns the store's error after reporting it as a `StoreError`
	/// interruption.
	pub async fn upsert(&self, kind: DataKind, key: &str, item: Item) -> Result<bool> {
		let version = item.version;
		match self.store.upsert(kind, key, item).await {
			Ok(applied) => {
				debug!(
					kind = %kind,
					key = key,
					version = version,
					applied = applied,
					"Applied item update"
				);
				Ok(applied)
			}
			Err(e) => {
				error!(kind = %kind, key = key, error = %e, "Failed to update data store");
				self.update_status(
					DataSourceState::Interrupted,
					Some(DataSourceErrorInfo::new(
						DataSourceErrorKind::StoreError,
						e.to_string(),
					)),
				);
				Err(e)
			}
		}
	}

	/// Reports a data source state change.
	///
	/// See [`DataSourceStatus::apply`] for the transition rules. Accepted
	/// changes are broadcast to source status listeners.
	pub fn update_status(&self, state: DataSourceState, error: Option<DataSourceErrorInfo>) {
		let mut status = self.status.lock();
		if let Some(e) = &error {
			warn!(state = %state, kind = ?e.kind, message = %e.message, "Data source error");
		}
		if status.apply(state, error) {
			debug!(state = %status.state, "Data source status changed");
			self.broadcaster.broadcast(status.clone());
		}
	}

	/// Returns the current data source status.
	pub fn status(&self) -> DataSourceStatus {
		self.status.lock().clone()
	}

	/// Subscribes to data source status changes.
	pub fn add_listener(&self) -> StatusListener<DataSourceStatus> {
		self.broadcaster.add_listener()
	}

	/// Returns the store's current availability.
	pub fn data_store_status(&self) -> StoreStatus {
		self.store_status.status()
	}

	/// Subscribes to store availability changes.
	pub fn add_store_status_listener(&self) -> StatusListener<StoreStatus> {
		self.store_status.add_listener()
	}
}

impl std::fmt::Debug for DataSourceUpdates {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DataSourceUpdates")
			.field("status", &*self.status.lock())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::FlagsError;
	use crate::memory::InMemoryDataStore;
	use serde_json::json;

	fn source_updates(store: Arc<dyn DataStore>) -> DataSourceUpdates {
		DataSourceUpdates::new(
			store,
			StatusBroadcaster::new(),
			Arc::new(DataStoreUpdates::new(StatusBroadcaster::new())),
		)
	}

	#[test]
	fn test_store_status_starts_available() {
		let updates = DataStoreUpdates::new(StatusBroadcaster::new());
		assert_eq!(updates.status(), StoreStatus::available());

		updates.update_status(StoreStatus::available());
		assert_eq!(updates.status(), StoreStatus::available());
	}

	#[test]
	fn test_store_status_is_broadcast() {
		let broadcaster = StatusBroadcaster::new();
		let mut listener = broadcaster.add_listener();
		let updates = DataStoreUpdates::new(broadcaster.clone());

		updates.update_status(StoreStatus::unavailable());

		assert_eq!(listener.try_recv(), Some(StoreStatus::unavailable()));
		broadcaster.close();
	}

	#[test]
	fn test_store_status_broadcast_once_per_transition() {
		let updates = DataStoreUpdates::new(StatusBroadcaster::new());
		let mut listener = updates.add_listener();

		updates.update_status(StoreStatus::unavailable());
		updates.update_status(StoreStatus::unavailable());
		updates.update_status(StoreStatus::recovered());
		updates.update_status(StoreStatus::recovered());

		assert_eq!(listener.try_recv(), Some(StoreStatus::unavailable()));
		assert_eq!(listener.try_recv(), Some(StoreStatus::recovered()));
		assert_eq!(listener.try_recv(), None);
	}

	#[tokio::test]
	async fn test_init_and_upsert_forward_to_store() {
		let store = InMemoryDataStore::new();
		let updates = source_updates(Arc::new(store.clone()));

		assert!(
			updates
				.init(FullDataSet::new().with_item(DataKind::Flags, Item::new("a", 1, json!({}))))
				.await
		);
		assert!(
			updates
				.upsert(DataKind::Flags, "a", Item::new("a", 2, json!({})))
				.await
				.unwrap()
		);
		assert!(
			!updates
				.upsert(DataKind::Flags, "a", Item::new("a", 2, json!({})))
				.await
				.unwrap()
		);

		let stored = store.get(DataKind::Flags, "a").await.unwrap().unwrap();
		assert_eq!(stored.version, 2);
	}

	#[tokio::test]
	async fn test_store_failure_reports_store_error() {
		let store = InMemoryDataStore::new();
		store.close().await.unwrap();
		let updates = source_updates(Arc::new(store));
		updates.update_status(DataSourceState::Valid, None);
		let mut listener = updates.add_listener();

		let result = updates
			.upsert(DataKind::Flags, "a", Item::new("a", 1, json!({})))
			.await;

		assert!(matches!(result, Err(FlagsError::StoreClosed)));
		let status = listener.try_recv().unwrap();
		assert_eq!(status.state, DataSourceState::Interrupted);
		assert_eq!(
			status.last_error.unwrap().kind,
			DataSourceErrorKind::StoreError
		);
	}

	#[test]
	fn test_source_status_transitions_are_broadcast() {
		let updates = source_updates(Arc::new(InMemoryDataStore::new()));
		let mut listener = updates.add_listener();

		updates.update_status(DataSourceState::Valid, None);
		updates.update_status(DataSourceState::Valid, None);
		updates.update_status(DataSourceState::Off, None);

		assert_eq!(listener.try_recv().unwrap().state, DataSourceState::Valid);
		assert_eq!(listener.try_recv().unwrap().state, DataSourceState::Off);
		assert!(listener.try_recv().is_none());
		assert_eq!(updates.status().state, DataSourceState::Off);
	}
}
