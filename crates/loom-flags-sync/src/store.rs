// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Data store contracts.
//!
//! [`DataStore`] is what evaluation code and data sources talk to.
//! [`PersistentBackend`] is what a database integration implements; it is
//! never used directly but always behind a
//! [`CachingStoreWrapper`](crate::caching::CachingStoreWrapper).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use loom_flags_core::{DataKind, FullDataSet, Item};

use crate::error::Result;

/// Versioned key/value storage for flag data.
///
/// # Invariants
///
/// - `upsert` applies an item only if its version is strictly greater than
///   the stored one, and reports whether it did.
/// - Deleted items are kept as tombstones and returned by `get`/`get_all`.
/// - `init` replaces every kind at once; readers never see a mix of old and
///   new snapshots.
/// - Implementations must be `Send + Sync` and safe under concurrent calls.
#[async_trait]
pub trait DataStore: Send + Sync {
	/// Replaces the entire contents of the store.
	async fn init(&self, data: FullDataSet) -> Result<()>;

	/// Returns the item for `key`, including tombstones.
	async fn get(&self, kind: DataKind, key: &str) -> Result<Option<Item>>;

	/// Returns every item of `kind`, including tombstones.
	async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, Item>>;

	/// Stores `item` if it is newer than the current one.
	async fn upsert(&self, kind: DataKind, key: &str, item: Item) -> Result<bool>;

	/// Returns true once `init` has succeeded at least once.
	async fn is_initialized(&self) -> bool;

	/// Releases resources. Later operations fail with
	/// [`FlagsError::StoreClosed`](crate::FlagsError::StoreClosed).
	async fn close(&self) -> Result<()>;
}

/// The capability set a persistent database integration provides.
///
/// Several processes may share one backend, so `upsert` must perform the
/// version comparison atomically inside the database (a conditional write)
/// and return `Ok(false)` when a newer or equal version is already stored.
#[async_trait]
pub trait PersistentBackend: Send + Sync {
	/// Replaces the entire contents of the backend.
	async fn init(&self, data: FullDataSet) -> Result<()>;

	async fn get(&self, kind: DataKind, key: &str) -> Result<Option<Item>>;

	async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, Item>>;

	/// Conditional write keyed on version.
	async fn upsert(&self, kind: DataKind, key: &str, item: Item) -> Result<bool>;

	async fn is_initialized(&self) -> Result<bool>;

	/// Cheap check used to detect recovery after an outage.
	async fn is_available(&self) -> bool;

	async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<B: PersistentBackend + ?Sized> PersistentBackend for Arc<B> {
	async fn init(&self, data: FullDataSet) -> Result<()> {
		(**self).init(data).await
	}

	async fn get(&self, kind: DataKind, key: &str) -> Result<Option<Item>> {
		(**self).get(kind, key).await
	}

	async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, Item>> {
		(**self).get_all(kind).await
	}

	async fn upsert(&self, kind: DataKind, key: &str, item: Item) -> Result<bool> {
		(**self).upsert(kind, key, item).await
	}

	async fn is_initialized(&self) -> Result<bool> {
		(**self).is_initialized().await
	}

	async fn is_available(&self) -> bool {
		(**self).is_available().await
	}

	async fn close(&self) -> Result<()> {
		(**self).close().await
	}
}
