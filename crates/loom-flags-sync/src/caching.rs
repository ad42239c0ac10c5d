// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read-through cache in front of a persistent backend.
//!
//! Reads are served from a TTL cache and fall through to the backend on a
//! miss. Concurrent misses for the same key share one backend fetch. Writes
//! always go to the backend first and only touch the cache once the backend
//! has answered.
//!
//! # Availability
//!
//! Any backend error marks the store unavailable and starts a background task that
//! polls [`PersistentBackend::is_available`] every [`RECOVERY_CHECK_INTERVAL`]. While
//! unavailable, reads fall back to expired cache entries when they exist. On
//! recovery the cache is dropped and [`StoreStatus::recovered`] is reported so
//! a data source can fetch a fresh snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_flags_core::{DataKind, FullDataSet, Item, StoreStatus};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheTtl;
use crate::error::{FlagsError, Result};
use crate::store::{DataStore, PersistentBackend};
use crate::updates::DataStoreUpdates;

/// How often an unavailable backend is checked for recovery.
pub const RECOVERY_CHECK_INTERVAL: Duration = Duration::from_millis(500);

type ItemKey = (DataKind, String);

/// In-flight fetches keyed by what they fetch. Callers that find a slot
/// already present wait on it instead of issuing their own request.
type FetchSlots<K, T> = Mutex<HashMap<K, Arc<OnceCell<T>>>>;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
	value: T,
	cached_at: Instant,
}

impl<T> CacheEntry<T> {
	fn new(value: T) -> Self {
		Self {
			value,
			cached_at: Instant::now(),
		}
	}
}

#[derive(Debug, Default)]
struct CacheState {
	/// `None` values record keys the backend does not have.
	items: HashMap<ItemKey, CacheEntry<Option<Item>>>,
	all: HashMap<DataKind, CacheEntry<HashMap<String, Item>>>,
	/// When the backend last reported itself uninitialized.
	init_checked: Option<Instant>,
	/// Bumped by every write so fetches that started earlier do not cache
	/// what they read.
	generation: u64,
}

impl CacheState {
	fn clear(&mut self) {
		self.items.clear();
		self.all.clear();
		self.init_checked = None;
		self.generation += 1;
	}
}

/// Caching [`DataStore`] over any [`PersistentBackend`].
pub struct CachingStoreWrapper<B: PersistentBackend + 'static> {
	inner: Arc<WrapperInner<B>>,
}

struct WrapperInner<B> {
	backend: B,
	ttl: CacheTtl,
	cache: Mutex<CacheState>,
	item_fetches: FetchSlots<ItemKey, Option<Item>>,
	all_fetches: FetchSlots<DataKind, HashMap<String, Item>>,
	inited: AtomicBool,
	available: AtomicBool,
	watching: AtomicBool,
	closed: AtomicBool,
	status: Arc<DataStoreUpdates>,
	cancel: CancellationToken,
}

impl<B: PersistentBackend + 'static> CachingStoreWrapper<B> {
	/// Wraps `backend`, reporting availability changes through `status`.
	pub fn new(backend: B, ttl: CacheTtl, status: Arc<DataStoreUpdates>) -> Self {
		debug!(ttl = ?ttl, "Creating caching store wrapper");
		Self {
			inner: Arc::new(WrapperInner {
				backend,
				ttl,
				cache: Mutex::new(CacheState::default()),
				item_fetches: Mutex::new(HashMap::new()),
				all_fetches: Mutex::new(HashMap::new()),
				inited: AtomicBool::new(false),
				available: AtomicBool::new(true),
				watching: AtomicBool::new(false),
				closed: AtomicBool::new(false),
				status,
				cancel: CancellationToken::new(),
			}),
		}
	}

	/// Returns true unless the last backend operation failed.
	pub fn is_available(&self) -> bool {
		self.inner.available.load(Ordering::SeqCst)
	}

	/// Returns the last reported store status.
	pub fn status(&self) -> StoreStatus {
		self.inner.status.status()
	}

	pub fn cache_ttl(&self) -> CacheTtl {
		self.inner.ttl
	}
}

#[async_trait]
impl<B: PersistentBackend + 'static> DataStore for CachingStoreWrapper<B> {
	async fn init(&self, data: FullDataSet) -> Result<()> {
		self.inner.init(data).await
	}

	async fn get(&self, kind: DataKind, key: &str) -> Result<Option<Item>> {
		self.inner.get(kind, key).await
	}

	async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, Item>> {
		self.inner.get_all(kind).await
	}

	async fn upsert(&self, kind: DataKind, key: &str, item: Item) -> Result<bool> {
		self.inner.upsert(kind, key, item).await
	}

	async fn is_initialized(&self) -> bool {
		self.inner.is_initialized().await
	}

	async fn close(&self) -> Result<()> {
		self.inner.close().await
	}
}

impl<B: PersistentBackend + 'static> Drop for CachingStoreWrapper<B> {
	fn drop(&mut self) {
		self.inner.cancel.cancel();
	}
}

impl<B: PersistentBackend + 'static> std::fmt::Debug for CachingStoreWrapper<B> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CachingStoreWrapper")
			.field("ttl", &self.inner.ttl)
			.field("available", &self.is_available())
			.finish()
	}
}

/// Runs `fetch` unless a fetch for `key` is already in flight, in which case
/// the caller waits for that one. A failed fetch is not shared: the next
/// waiter runs its own.
async fn coalesce<K, T, F, Fut>(slots: &FetchSlots<K, T>, key: K, fetch: F) -> Result<T>
where
	K: Eq + Hash + Clone,
	T: Clone,
	F: FnOnce() -> Fut,
	Fut: Future<Output = Result<T>>,
{
	let slot = Arc::clone(slots.lock().entry(key.clone()).or_default());
	let result = slot.get_or_try_init(fetch).await.cloned();

	let mut slots = slots.lock();
	if slots
		.get(&key)
		.is_some_and(|current| Arc::ptr_eq(current, &slot))
	{
		slots.remove(&key);
	}
	result
}

impl<B: PersistentBackend + 'static> WrapperInner<B> {
	fn check_open(&self) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(FlagsError::StoreClosed);
		}
		Ok(())
	}

	async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		self.cancel.cancel();
		self.item_fetches.lock().clear();
		self.all_fetches.lock().clear();
		self.cache.lock().clear();
		debug!("Closing caching store wrapper");
		self.backend.close().await
	}

	async fn init(self: &Arc<Self>, data: FullDataSet) -> Result<()> {
		self.check_open()?;
		let cached = self.ttl.is_enabled().then(|| data.clone());
		if let Err(e) = self.backend.init(data).await {
			self.mark_unavailable(&e);
			return Err(e);
		}
		self.mark_available();
		self.inited.store(true, Ordering::SeqCst);

		self.item_fetches.lock().clear();
		self.all_fetches.lock().clear();
		let mut cache = self.cache.lock();
		cache.clear();
		if let Some(data) = cached {
			for (kind, items) in data.into_kinds() {
				for (key, item) in &items {
					cache
						.items
						.insert((kind, key.clone()), CacheEntry::new(Some(item.clone())));
				}
				cache.all.insert(kind, CacheEntry::new(items));
			}
		}
		Ok(())
	}

	async fn get(self: &Arc<Self>, kind: DataKind, key: &str) -> Result<Option<Item>> {
		self.check_open()?;
		if let Some(item) = self.fresh_item(kind, key) {
			return Ok(item);
		}

		let fetched = coalesce(&self.item_fetches, (kind, key.to_string()), || {
			self.fetch_item(kind, key)
		})
		.await;

		match fetched {
			Ok(item) => Ok(item),
			Err(e) => match self.stale_item(kind, key) {
				Some(item) => {
					warn!(kind = %kind, key = key, error = %e, "Serving stale cached item");
					Ok(item)
				}
				None => Err(e),
			},
		}
	}

	async fn get_all(self: &Arc<Self>, kind: DataKind) -> Result<HashMap<String, Item>> {
		self.check_open()?;
		if let Some(items) = self.fresh_all(kind) {
			return Ok(items);
		}

		let fetched = coalesce(&self.all_fetches, kind, || self.fetch_all(kind)).await;

		match fetched {
			Ok(items) => Ok(items),
			Err(e) => match self.stale_all(kind) {
				Some(items) => {
					warn!(kind = %kind, error = %e, "Serving stale cached items");
					Ok(items)
				}
				None => Err(e),
			},
		}
	}

	async fn fetch_item(self: &Arc<Self>, kind: DataKind, key: &str) -> Result<Option<Item>> {
		if let Some(item) = self.fresh_item(kind, key) {
			return Ok(item);
		}
		let generation = self.cache.lock().generation;
		match self.backend.get(kind, key).await {
			Ok(item) => {
				self.mark_available();
				self.cache_item(generation, kind, key, item.clone());
				Ok(item)
			}
			Err(e) => {
				self.mark_unavailable(&e);
				Err(e)
			}
		}
	}

	async fn fetch_all(self: &Arc<Self>, kind: DataKind) -> Result<HashMap<String, Item>> {
		if let Some(items) = self.fresh_all(kind) {
			return Ok(items);
		}
		let generation = self.cache.lock().generation;
		match self.backend.get_all(kind).await {
			Ok(items) => {
				self.mark_available();
				if self.ttl.is_enabled() {
					let mut cache = self.cache.lock();
					if cache.generation == generation {
						for (key, item) in &items {
							cache
								.items
								.insert((kind, key.clone()), CacheEntry::new(Some(item.clone())));
						}
						cache.all.insert(kind, CacheEntry::new(items.clone()));
					}
				}
				Ok(items)
			}
			Err(e) => {
				self.mark_unavailable(&e);
				Err(e)
			}
		}
	}

	async fn upsert(self: &Arc<Self>, kind: DataKind, key: &str, item: Item) -> Result<bool> {
		self.check_open()?;
		let version = item.version;
		let written = self.ttl.is_enabled().then(|| item.clone());

		match self.backend.upsert(kind, key, item).await {
			Ok(true) => {
				self.mark_available();
				self.after_write(kind, key, written);
				Ok(true)
			}
			Ok(false) => {
				self.mark_available();
				debug!(
					kind = %kind,
					key = key,
					version = version,
					"Backend kept a newer version, refreshing cached item"
				);
				self.after_write(kind, key, None);
				if self.ttl.is_enabled() {
					self.refresh_item(kind, key).await;
				}
				Ok(false)
			}
			Err(e) => {
				self.mark_unavailable(&e);
				Err(e)
			}
		}
	}

	async fn is_initialized(self: &Arc<Self>) -> bool {
		if self.inited.load(Ordering::SeqCst) {
			return true;
		}
		if self.closed.load(Ordering::SeqCst) {
			return false;
		}
		let init_checked = self.cache.lock().init_checked;
		if init_checked.is_some_and(|checked| self.ttl.is_fresh(checked.elapsed())) {
			return false;
		}

		match self.backend.is_initialized().await {
			Ok(initialized) => {
				self.mark_available();
				if initialized {
					self.inited.store(true, Ordering::SeqCst);
				} else if self.ttl.is_enabled() {
					self.cache.lock().init_checked = Some(Instant::now());
				}
				initialized
			}
			Err(e) => {
				self.mark_unavailable(&e);
				false
			}
		}
	}

	/// Drops in-flight fetches and cached lists for `kind`, then records the
	/// written value for `key` or forgets it when `written` is `None`.
	fn after_write(&self, kind: DataKind, key: &str, written: Option<Item>) {
		let item_key = (kind, key.to_string());
		self.item_fetches.lock().remove(&item_key);
		self.all_fetches.lock().remove(&kind);

		let mut cache = self.cache.lock();
		cache.generation += 1;
		cache.all.remove(&kind);
		match written {
			Some(item) => {
				cache.items.insert(item_key, CacheEntry::new(Some(item)));
			}
			None => {
				cache.items.remove(&item_key);
			}
		}
	}

	async fn refresh_item(self: &Arc<Self>, kind: DataKind, key: &str) {
		let generation = self.cache.lock().generation;
		match self.backend.get(kind, key).await {
			Ok(item) => self.cache_item(generation, kind, key, item),
			Err(e) => {
				debug!(kind = %kind, key = key, error = %e, "Failed to refresh cached item");
				self.mark_unavailable(&e);
			}
		}
	}

	fn cache_item(&self, generation: u64, kind: DataKind, key: &str, item: Option<Item>) {
		if !self.ttl.is_enabled() {
			return;
		}
		let mut cache = self.cache.lock();
		if cache.generation == generation {
			cache
				.items
				.insert((kind, key.to_string()), CacheEntry::new(item));
		}
	}

	fn fresh_item(&self, kind: DataKind, key: &str) -> Option<Option<Item>> {
		let cache = self.cache.lock();
		let entry = cache.items.get(&(kind, key.to_string()))?;
		self
			.ttl
			.is_fresh(entry.cached_at.elapsed())
			.then(|| entry.value.clone())
	}

	fn stale_item(&self, kind: DataKind, key: &str) -> Option<Option<Item>> {
		let cache = self.cache.lock();
		cache
			.items
			.get(&(kind, key.to_string()))
			.map(|entry| entry.value.clone())
	}

	fn fresh_all(&self, kind: DataKind) -> Option<HashMap<String, Item>> {
		let cache = self.cache.lock();
		let entry = cache.all.get(&kind)?;
		self
			.ttl
			.is_fresh(entry.cached_at.elapsed())
			.then(|| entry.value.clone())
	}

	fn stale_all(&self, kind: DataKind) -> Option<HashMap<String, Item>> {
		self
			.cache
			.lock()
			.all
			.get(&kind)
			.map(|entry| entry.value.clone())
	}

	fn mark_available(&self) {
		if self.closed.load(Ordering::SeqCst) || self.available.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("Persistent data store is available again");
		self.item_fetches.lock().clear();
		self.all_fetches.lock().clear();
		self.cache.lock().clear();
		self.status.update_status(StoreStatus::recovered());
	}

	fn mark_unavailable(self: &Arc<Self>, error: &FlagsError) {
		if self.closed.load(Ordering::SeqCst) || !self.available.swap(false, Ordering::SeqCst) {
			return;
		}
		warn!(error = %error, "Persistent data store is unavailable");
		self.status.update_status(StoreStatus::unavailable());

		if !self.watching.swap(true, Ordering::SeqCst) && !self.cancel.is_cancelled() {
			tokio::spawn(Arc::clone(self).watch_for_recovery());
		}
	}

	async fn watch_for_recovery(self: Arc<Self>) {
		debug!("Starting data store recovery watch");
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => {
					debug!("Recovery watch cancelled");
					return;
				}
				_ = tokio::time::sleep(RECOVERY_CHECK_INTERVAL) => {}
			}

			if !self.available.load(Ordering::SeqCst) {
				if !self.backend.is_available().await {
					continue;
				}
				self.mark_available();
			}

			self.watching.store(false, Ordering::SeqCst);
			// A failure that raced with recovery found `watching` still set.
			if self.available.load(Ordering::SeqCst) || self.watching.swap(true, Ordering::SeqCst) {
				return;
			}
		}
	}
}
