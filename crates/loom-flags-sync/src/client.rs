// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client that wires a data source, a store and the status broadcasters
//! together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loom_flags_core::{DataKind, DataSourceState, DataSourceStatus, Item, StoreStatus};
use tracing::{error, info, warn};

use crate::broadcast::{ListenerId, StatusBroadcaster, StatusListener};
use crate::caching::CachingStoreWrapper;
use crate::config::{CacheTtl, DataSourceConfig, PollingConfig, StreamingConfig};
use crate::error::{FlagsError, Result};
use crate::memory::InMemoryDataStore;
use crate::polling::PollingDataSource;
use crate::source::{DataSource, OfflineDataSource};
use crate::store::{DataStore, PersistentBackend};
use crate::streaming::StreamingDataSource;
use crate::updates::{DataSourceUpdates, DataStoreUpdates};

/// Default time [`SyncClientBuilder::build`] waits for the first data set.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for constructing a [`SyncClient`].
pub struct SyncClientBuilder {
	sdk_key: Option<String>,
	data_source: DataSourceConfig,
	cache_ttl: CacheTtl,
	init_timeout: Duration,
	backend: Option<Arc<dyn PersistentBackend>>,
}

impl SyncClientBuilder {
	/// Creates a builder that streams into an in-memory store.
	pub fn new() -> Self {
		Self {
			sdk_key: None,
			data_source: DataSourceConfig::default(),
			cache_ttl: CacheTtl::default(),
			init_timeout: DEFAULT_INIT_TIMEOUT,
			backend: None,
		}
	}

	/// Sets the SDK key sent with every request.
	pub fn sdk_key(mut self, key: impl Into<String>) -> Self {
		self.sdk_key = Some(key.into());
		self
	}

	/// Receives updates over a streaming connection.
	pub fn streaming(mut self, config: StreamingConfig) -> Self {
		self.data_source = DataSourceConfig::Streaming(config);
		self
	}

	/// Receives updates by polling.
	pub fn polling(mut self, config: PollingConfig) -> Self {
		self.data_source = DataSourceConfig::Polling(config);
		self
	}

	/// Makes no network connections.
	pub fn offline(mut self) -> Self {
		self.data_source = DataSourceConfig::Offline;
		self
	}

	pub fn data_source(mut self, config: DataSourceConfig) -> Self {
		self.data_source = config;
		self
	}

	/// Sets the cache TTL used in front of a persistent backend.
	pub fn cache_ttl(mut self, ttl: CacheTtl) -> Self {
		self.cache_ttl = ttl;
		self
	}

	/// Sets how long `build` waits for the first data set.
	pub fn init_timeout(mut self, timeout: Duration) -> Self {
		self.init_timeout = timeout;
		self
	}

	/// Stores flag data in `backend` behind a caching wrapper instead of in
	/// memory.
	pub fn persistent_backend<B: PersistentBackend + 'static>(mut self, backend: B) -> Self {
		self.backend = Some(Arc::new(backend));
		self
	}

	/// Builds the client, starts its data source and waits up to the
	/// initialization timeout for the first data set.
	///
	/// A source that has not initialized in time keeps trying in the
	/// background; this is logged, not returned as an error.
	///
	/// # Errors
	///
	/// Returns [`FlagsError::InvalidConfig`] when the SDK key is missing or
	/// the data source configuration is rejected.
	pub async fn build(self) -> Result<SyncClient> {
		let sdk_key = self
			.sdk_key
			.filter(|key| !key.is_empty())
			.ok_or_else(|| FlagsError::InvalidConfig("SDK key is required".to_string()))?;

		let store_broadcaster = StatusBroadcaster::new();
		let source_broadcaster = StatusBroadcaster::new();
		let store_updates = Arc::new(DataStoreUpdates::new(store_broadcaster.clone()));

		let store: Arc<dyn DataStore> = match self.backend {
			Some(backend) => Arc::new(CachingStoreWrapper::new(
				backend,
				self.cache_ttl,
				Arc::clone(&store_updates),
			)),
			None => Arc::new(InMemoryDataStore::new()),
		};

		let updates = Arc::new(DataSourceUpdates::new(
			Arc::clone(&store),
			source_broadcaster.clone(),
			Arc::clone(&store_updates),
		));

		let source: Box<dyn DataSource> = match self.data_source {
			DataSourceConfig::Streaming(config) => Box::new(StreamingDataSource::new(
				sdk_key,
				config,
				Arc::clone(&updates),
			)?),
			DataSourceConfig::Polling(config) => Box::new(PollingDataSource::new(
				sdk_key,
				config,
				Arc::clone(&updates),
			)?),
			DataSourceConfig::Offline => Box::new(OfflineDataSource::new(Arc::clone(&updates))),
		};

		let client = SyncClient {
			store,
			source,
			updates,
			store_updates,
			store_broadcaster,
			source_broadcaster,
			closed: AtomicBool::new(false),
		};

		client.source.start()?;
		if client
			.source
			.wait_for_initialization(self.init_timeout)
			.await
		{
			info!("Sync client initialized");
		} else if client.updates.status().state == DataSourceState::Off {
			error!("Data source shut down before initializing");
		} else {
			warn!(
				timeout_ms = self.init_timeout.as_millis() as u64,
				"Data source not initialized yet, continuing in the background"
			);
		}

		Ok(client)
	}
}

impl Default for SyncClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Keeps a local mirror of flag data up to date.
///
/// Owns one store, one data source and the two status broadcasters. Each
/// client is independent; nothing is shared between instances.
pub struct SyncClient {
	store: Arc<dyn DataStore>,
	source: Box<dyn DataSource>,
	updates: Arc<DataSourceUpdates>,
	store_updates: Arc<DataStoreUpdates>,
	store_broadcaster: StatusBroadcaster<StoreStatus>,
	source_broadcaster: StatusBroadcaster<DataSourceStatus>,
	closed: AtomicBool,
}

impl SyncClient {
	/// Creates a new builder for constructing a SyncClient.
	pub fn builder() -> SyncClientBuilder {
		SyncClientBuilder::new()
	}

	/// Returns the live item for `key`. Deleted items read as absent.
	pub async fn get(&self, kind: DataKind, key: &str) -> Result<Option<Item>> {
		self.check_closed()?;
		let item = self.store.get(kind, key).await?;
		Ok(item.filter(|item| !item.deleted))
	}

	/// Returns every live item of `kind`.
	pub async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, Item>> {
		self.check_closed()?;
		let mut items = self.store.get_all(kind).await?;
		items.retain(|_, item| !item.deleted);
		Ok(items)
	}

	/// Returns true once the data source has delivered its first data set.
	pub fn is_initialized(&self) -> bool {
		self.source.is_initialized()
	}

	/// Waits up to `timeout` for the data source to deliver its first data
	/// set.
	///
	/// # Errors
	///
	/// Returns [`FlagsError::InitializationTimeout`] when the source is not
	/// ready in time or has shut down, and [`FlagsError::ClientClosed`] after
	/// [`close`](Self::close).
	pub async fn wait_for_initialization(&self, timeout: Duration) -> Result<()> {
		self.check_closed()?;
		if self.source.wait_for_initialization(timeout).await {
			Ok(())
		} else {
			Err(FlagsError::InitializationTimeout)
		}
	}

	/// The underlying store, for evaluation code.
	pub fn store(&self) -> Arc<dyn DataStore> {
		Arc::clone(&self.store)
	}

	pub fn data_store_status(&self) -> StoreStatus {
		self.store_updates.status()
	}

	pub fn add_data_store_status_listener(&self) -> StatusListener<StoreStatus> {
		self.store_broadcaster.add_listener()
	}

	pub fn remove_data_store_status_listener(&self, id: ListenerId) {
		self.store_broadcaster.remove_listener(id);
	}

	pub fn data_source_status(&self) -> DataSourceStatus {
		self.updates.status()
	}

	pub fn add_data_source_status_listener(&self) -> StatusListener<DataSourceStatus> {
		self.source_broadcaster.add_listener()
	}

	pub fn remove_data_source_status_listener(&self, id: ListenerId) {
		self.source_broadcaster.remove_listener(id);
	}

	/// Stops the data source, closes the store and ends every listener.
	///
	/// Later reads fail with [`FlagsError::ClientClosed`]. Calling this again
	/// does nothing.
	pub async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		info!("Closing sync client");

		self.source.close().await;
		let result = self.store.close().await;
		if let Err(e) = &result {
			warn!(error = %e, "Failed to close data store");
		}
		self.source_broadcaster.close();
		self.store_broadcaster.close();
		result
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	fn check_closed(&self) -> Result<()> {
		if self.is_closed() {
			return Err(FlagsError::ClientClosed);
		}
		Ok(())
	}
}

impl std::fmt::Debug for SyncClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SyncClient")
			.field("source_status", &self.updates.status().state)
			.field("store_status", &self.store_updates.status())
			.field("closed", &self.is_closed())
			.finish()
	}
}
