// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Default in-memory data store.
//!
//! Holds every kind in a map of maps behind one reader/writer lock. The store
//! is process-local and small, so a single lock is enough.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_flags_core::{DataKind, FullDataSet, Item};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{FlagsError, Result};
use crate::store::DataStore;

/// In-memory store for flag data.
///
/// Clones share the same underlying data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataStore {
	inner: Arc<RwLock<StoreInner>>,
}

#[derive(Debug, Default)]
struct StoreInner {
	/// Items keyed by kind, then by key.
	items: HashMap<DataKind, HashMap<String, Item>>,
	/// When the store was last written.
	last_updated: Option<DateTime<Utc>>,
	initialized: bool,
	closed: bool,
}

impl StoreInner {
	fn ensure_open(&self) -> Result<()> {
		if self.closed {
			return Err(FlagsError::StoreClosed);
		}
		Ok(())
	}
}

impl InMemoryDataStore {
	/// Creates a new empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the timestamp of the last accepted write.
	pub async fn last_updated(&self) -> Option<DateTime<Utc>> {
		self.inner.read().await.last_updated
	}

	/// Returns the number of items of `kind`, tombstones included.
	pub async fn len(&self, kind: DataKind) -> usize {
		self
			.inner
			.read()
			.await
			.items
			.get(&kind)
			.map(HashMap::len)
			.unwrap_or(0)
	}
}

#[async_trait]
impl DataStore for InMemoryDataStore {
	async fn init(&self, data: FullDataSet) -> Result<()> {
		let mut inner = self.inner.write().await;
		inner.ensure_open()?;

		inner.items = data.into_kinds();
		for kind in DataKind::ALL {
			inner.items.entry(kind).or_default();
		}
		inner.last_updated = Some(Utc::now());
		inner.initialized = true;
		Ok(())
	}

	async fn get(&self, kind: DataKind, key: &str) -> Result<Option<Item>> {
		let inner = self.inner.read().await;
		inner.ensure_open()?;
		Ok(inner.items.get(&kind).and_then(|items| items.get(key)).cloned())
	}

	async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, Item>> {
		let inner = self.inner.read().await;
		inner.ensure_open()?;
		Ok(inner.items.get(&kind).cloned().unwrap_or_default())
	}

	async fn upsert(&self, kind: DataKind, key: &str, item: Item) -> Result<bool> {
		let mut inner = self.inner.write().await;
		inner.ensure_open()?;

		let items = inner.items.entry(kind).or_default();
		if !item.supersedes(items.get(key)) {
			debug!(
				kind = %kind,
				key = key,
				version = item.version,
				"Ignoring stale upsert"
			);
			return Ok(false);
		}

		items.insert(key.to_string(), item);
		inner.last_updated = Some(Utc::now());
		Ok(true)
	}

	async fn is_initialized(&self) -> bool {
		self.inner.read().await.initialized
	}

	async fn close(&self) -> Result<()> {
		let mut inner = self.inner.write().await;
		inner.closed = true;
		inner.items.clear();
		Ok(())
	}
}
