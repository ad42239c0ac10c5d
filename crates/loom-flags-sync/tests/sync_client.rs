// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end tests for the sync client.
//!
//! This test suite covers:
//! - Streaming and polling sources feeding the default store
//! - Persistent backends behind the caching wrapper
//! - Several clients sharing one backend
//! - Store outage, recovery and the stream refresh it triggers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_flags_sync::{
	CacheTtl, DataKind, DataSourceState, DataStore, FlagsError, FullDataSet, Item,
	PersistentBackend, PollingConfig, Result, StoreStatus, StreamEvent, StreamingConfig, SyncClient,
};
use parking_lot::Mutex;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A shared database stand-in with an atomic conditional write.
#[derive(Default)]
struct SharedBackend {
	data: Mutex<HashMap<DataKind, HashMap<String, Item>>>,
	initialized: AtomicBool,
	failing: AtomicBool,
}

impl SharedBackend {
	fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	fn check(&self) -> Result<()> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(FlagsError::Backend("connection refused".to_string()));
		}
		Ok(())
	}

	fn version_of(&self, kind: DataKind, key: &str) -> Option<u64> {
		self
			.data
			.lock()
			.get(&kind)
			.and_then(|items| items.get(key))
			.map(|item| item.version)
	}
}

#[async_trait]
impl PersistentBackend for SharedBackend {
	async fn init(&self, data: FullDataSet) -> Result<()> {
		self.check()?;
		*self.data.lock() = data.into_kinds();
		self.initialized.store(true, Ordering::SeqCst);
		Ok(())
	}

	async fn get(&self, kind: DataKind, key: &str) -> Result<Option<Item>> {
		self.check()?;
		Ok(self
			.data
			.lock()
			.get(&kind)
			.and_then(|items| items.get(key))
			.cloned())
	}

	async fn get_all(&self, kind: DataKind) -> Result<HashMap<String, Item>> {
		self.check()?;
		Ok(self.data.lock().get(&kind).cloned().unwrap_or_default())
	}

	async fn upsert(&self, kind: DataKind, key: &str, item: Item) -> Result<bool> {
		self.check()?;
		let mut data = self.data.lock();
		let items = data.entry(kind).or_default();
		if !item.supersedes(items.get(key)) {
			return Ok(false);
		}
		items.insert(key.to_string(), item);
		Ok(true)
	}

	async fn is_initialized(&self) -> Result<bool> {
		self.check()?;
		Ok(self.initialized.load(Ordering::SeqCst))
	}

	async fn is_available(&self) -> bool {
		!self.failing.load(Ordering::SeqCst)
	}

	async fn close(&self) -> Result<()> {
		Ok(())
	}
}

fn flag(key: &str, version: u64) -> Item {
	Item::new(key, version, json!({ "on": true, "variation": version }))
}

fn put(version: u64) -> StreamEvent {
	StreamEvent::Put(FullDataSet::new().with_item(DataKind::Flags, flag("a", version)))
}

fn sse_body(events: &[StreamEvent]) -> ResponseTemplate {
	let body: String = events.iter().map(StreamEvent::to_sse_frame).collect();
	ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream")
}

async fn wait_until<F>(mut check: F)
where
	F: FnMut() -> bool,
{
	for _ in 0..500 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not met within 5s");
}

/// Tests the streaming path from the wire to client reads.
///
/// Purpose: Verify that a `put` initializes the client during `build` and
/// that later `patch` and `delete` events are visible through the client.
#[tokio::test]
async fn test_streaming_client_applies_events() {
	let server = MockServer::start().await;
	let events = [
		put(1),
		StreamEvent::Patch {
			kind: DataKind::Flags,
			key: "b".to_string(),
			item: flag("b", 1),
		},
		StreamEvent::Delete {
			kind: DataKind::Flags,
			key: "a".to_string(),
			version: 2,
		},
	];
	Mock::given(method("GET"))
		.and(path("/sdk/stream/all"))
		.respond_with(sse_body(&events))
		.up_to_n_times(1)
		.with_priority(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/sdk/stream/all"))
		.respond_with(ResponseTemplate::new(503))
		.mount(&server)
		.await;

	let client = SyncClient::builder()
		.sdk_key("sdk-test-key")
		.streaming(StreamingConfig::new().base_uri(server.uri()))
		.init_timeout(Duration::from_secs(5))
		.build()
		.await
		.unwrap();
	assert!(client.is_initialized());

	let store = client.store();
	let mut deleted = false;
	for _ in 0..500 {
		if let Ok(Some(item)) = store.get(DataKind::Flags, "a").await {
			if item.deleted {
				deleted = true;
				break;
			}
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(deleted);

	assert!(client.get(DataKind::Flags, "a").await.unwrap().is_none());
	assert!(client.get(DataKind::Flags, "b").await.unwrap().is_some());
	assert_eq!(client.get_all(DataKind::Flags).await.unwrap().len(), 1);

	client.close().await.unwrap();
	assert_eq!(client.data_source_status().state, DataSourceState::Off);
}

/// Tests a rejected SDK key.
///
/// Purpose: Verify that `build` still returns a client, and that the client
/// reports `Off` without retrying.
#[tokio::test]
async fn test_rejected_key_turns_client_off() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/sdk/stream/all"))
		.respond_with(ResponseTemplate::new(401))
		.expect(1)
		.mount(&server)
		.await;

	let client = SyncClient::builder()
		.sdk_key("sdk-revoked")
		.streaming(StreamingConfig::new().base_uri(server.uri()))
		.init_timeout(Duration::from_secs(5))
		.build()
		.await
		.unwrap();

	assert!(!client.is_initialized());
	let status = client.data_source_status();
	assert_eq!(status.state, DataSourceState::Off);
	assert_eq!(status.last_error.unwrap().status_code, Some(401));

	client.close().await.unwrap();
}

/// Tests polling into a persistent backend.
///
/// Purpose: Verify that the first poll writes through the caching wrapper
/// into the backend.
#[tokio::test]
async fn test_polling_client_writes_through_to_backend() {
	let server = MockServer::start().await;
	let body = FullDataSet::new()
		.with_item(DataKind::Flags, flag("a", 4))
		.with_item(DataKind::Segments, Item::new("beta", 1, json!({ "included": ["u1"] })))
		.to_wire();
	Mock::given(method("GET"))
		.and(path("/sdk/latest-all"))
		.respond_with(ResponseTemplate::new(200).set_body_json(body))
		.mount(&server)
		.await;

	let backend = Arc::new(SharedBackend::default());
	let client = SyncClient::builder()
		.sdk_key("sdk-test-key")
		.polling(PollingConfig::new().base_uri(server.uri()))
		.persistent_backend(Arc::clone(&backend))
		.cache_ttl(CacheTtl::Infinite)
		.init_timeout(Duration::from_secs(5))
		.build()
		.await
		.unwrap();

	assert!(client.is_initialized());
	assert_eq!(backend.version_of(DataKind::Flags, "a"), Some(4));
	assert!(client
		.get(DataKind::Segments, "beta")
		.await
		.unwrap()
		.is_some());

	client.close().await.unwrap();
}

/// Tests several clients sharing one backend.
///
/// Purpose: Verify that racing writers are resolved by version, and that
/// both clients read the same winner afterwards.
#[tokio::test]
async fn test_clients_sharing_backend_converge() {
	let backend = Arc::new(SharedBackend::default());
	let build = || {
		SyncClient::builder()
			.sdk_key("sdk-test-key")
			.offline()
			.persistent_backend(Arc::clone(&backend))
			.cache_ttl(CacheTtl::Finite(Duration::from_secs(60)))
			.build()
	};
	let first = build().await.unwrap();
	let second = build().await.unwrap();

	let first_store = first.store();
	let second_store = second.store();
	for version in 1..=10u64 {
		let (a, b) = tokio::join!(
			first_store.upsert(DataKind::Flags, "k", flag("k", version)),
			second_store.upsert(
				DataKind::Flags,
				"k",
				Item::new("k", version, json!({ "writer": "second" }))
			),
		);
		let (a, b) = (a.unwrap(), b.unwrap());
		assert!(a != b, "exactly one write applies per version");
	}

	let a = first.get(DataKind::Flags, "k").await.unwrap().unwrap();
	let b = second.get(DataKind::Flags, "k").await.unwrap().unwrap();
	assert_eq!(a, b);
	assert_eq!(a.version, 10);
	assert_eq!(backend.version_of(DataKind::Flags, "k"), Some(10));

	first.close().await.unwrap();
	second.close().await.unwrap();
}

/// Tests recovery from a backend outage.
///
/// Purpose: Verify that an outage and the recovery are each broadcast once,
/// and that recovery makes the stream fetch a fresh data set straight away.
#[tokio::test]
async fn test_backend_recovery_refreshes_stream() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/sdk/stream/all"))
		.respond_with(sse_body(&[put(1)]))
		.up_to_n_times(1)
		.with_priority(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/sdk/stream/all"))
		.respond_with(sse_body(&[put(2)]))
		.mount(&server)
		.await;

	let backend = Arc::new(SharedBackend::default());
	let client = SyncClient::builder()
		.sdk_key("sdk-test-key")
		.streaming(
			StreamingConfig::new()
				.base_uri(server.uri())
				.initial_reconnect_delay(Duration::from_secs(60)),
		)
		.persistent_backend(Arc::clone(&backend))
		.cache_ttl(CacheTtl::Disabled)
		.init_timeout(Duration::from_secs(5))
		.build()
		.await
		.unwrap();
	assert_eq!(backend.version_of(DataKind::Flags, "a"), Some(1));
	let mut store_status = client.add_data_store_status_listener();

	backend.set_failing(true);
	assert!(client.get(DataKind::Flags, "a").await.is_err());
	assert_eq!(store_status.recv().await, Some(StoreStatus::unavailable()));
	assert!(!client.data_store_status().available);

	backend.set_failing(false);
	let recovered = tokio::time::timeout(Duration::from_secs(5), store_status.recv())
		.await
		.unwrap();
	assert_eq!(recovered, Some(StoreStatus::recovered()));

	let backend_ref = Arc::clone(&backend);
	wait_until(move || backend_ref.version_of(DataKind::Flags, "a") == Some(2)).await;
	assert_eq!(
		client.get(DataKind::Flags, "a").await.unwrap().unwrap().version,
		2
	);

	client.close().await.unwrap();
}
