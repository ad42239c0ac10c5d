// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Polling data source.
//!
//! Fetches the full data set on a fixed interval and replaces the store with
//! it. Requests are conditional on the last `ETag`, so an unchanged data set
//! costs a `304` and no store write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_flags_core::sse::parse_polling_payload;
use loom_flags_core::DataSourceState;
use parking_lot::Mutex;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PollingConfig, MIN_POLL_INTERVAL};
use crate::error::{FlagsError, Result};
use crate::http;
use crate::source::{DataSource, ReadySignal};
use crate::updates::DataSourceUpdates;

/// Path of the polling endpoint, relative to the base URI.
pub const POLLING_PATH: &str = "/sdk/latest-all";

/// Data source that periodically fetches the whole data set.
pub struct PollingDataSource {
	inner: Arc<PollInner>,
	started: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

struct PollInner {
	sdk_key: String,
	config: PollingConfig,
	poll_uri: String,
	client: Client,
	updates: Arc<DataSourceUpdates>,
	ready: ReadySignal,
	cancel: CancellationToken,
	etag: Mutex<Option<String>>,
}

impl PollingDataSource {
	/// Creates a polling source. Intervals below [`MIN_POLL_INTERVAL`] are
	/// raised to it.
	///
	/// # Errors
	///
	/// Returns [`FlagsError::InvalidConfig`] for an empty payload filter or an
	/// unparseable base URI.
	pub fn new(
		sdk_key: impl Into<String>,
		config: PollingConfig,
		updates: Arc<DataSourceUpdates>,
	) -> Result<Self> {
		Self::with_min_interval(sdk_key, config, updates, MIN_POLL_INTERVAL)
	}

	pub(crate) fn with_min_interval(
		sdk_key: impl Into<String>,
		config: PollingConfig,
		updates: Arc<DataSourceUpdates>,
		min_interval: Duration,
	) -> Result<Self> {
		let config = config.validated_with_floor(min_interval)?;
		let client = http::builder()
			.timeout(config.request_timeout)
			.build()
			.map_err(FlagsError::ConnectionFailed)?;
		let poll_uri = format!("{}{}", config.base_uri, POLLING_PATH);

		Ok(Self {
			inner: Arc::new(PollInner {
				sdk_key: sdk_key.into(),
				config,
				poll_uri,
				client,
				updates,
				ready: ReadySignal::new(),
				cancel: CancellationToken::new(),
				etag: Mutex::new(None),
			}),
			started: AtomicBool::new(false),
			task: Mutex::new(None),
		})
	}

	/// Effective interval after clamping.
	pub fn poll_interval(&self) -> Duration {
		self.inner.config.poll_interval
	}

	pub fn base_uri(&self) -> &str {
		&self.inner.config.base_uri
	}

	pub fn payload_filter(&self) -> Option<&str> {
		self.inner.config.payload_filter.as_deref()
	}
}

#[async_trait]
impl DataSource for PollingDataSource {
	fn start(&self) -> Result<()> {
		if self.inner.cancel.is_cancelled() {
			return Err(FlagsError::SourceClosed);
		}
		if self.started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
			FlagsError::InvalidConfig(format!("polling requires a tokio runtime: {e}"))
		})?;
		info!(
			interval_secs = self.inner.config.poll_interval.as_secs(),
			"Starting polling data source"
		);
		let inner = Arc::clone(&self.inner);
		*self.task.lock() = Some(runtime.spawn(inner.run()));
		Ok(())
	}

	fn is_initialized(&self) -> bool {
		self.inner.ready.is_ready()
	}

	async fn wait_for_initialization(&self, timeout: Duration) -> bool {
		self.inner.ready.wait(timeout).await
	}

	async fn close(&self) {
		self.inner.cancel.cancel();
		let task = self.task.lock().take();
		if let Some(handle) = task {
			if let Err(e) = handle.await {
				warn!(error = %e, "Polling task ended abnormally");
			}
			info!("Polling data source closed");
		}
		self.inner.ready.mark_failed();
		self.inner.updates.update_status(DataSourceState::Off, None);
	}
}

impl Drop for PollingDataSource {
	fn drop(&mut self) {
		self.inner.cancel.cancel();
	}
}

impl std::fmt::Debug for PollingDataSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PollingDataSource")
			.field("poll_uri", &self.inner.poll_uri)
			.field("poll_interval", &self.inner.config.poll_interval)
			.field("initialized", &self.inner.ready.is_ready())
			.finish()
	}
}

impl PollInner {
	async fn run(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.config.poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				_ = ticker.tick() => {}
			}

			let result = tokio::select! {
				_ = self.cancel.cancelled() => return,
				result = self.poll() => result,
			};

			match result {
				Ok(()) => {}
				Err(err) if !err.is_retryable() => {
					error!(error = %err, "Polling stopped by unrecoverable error");
					self.updates
						.update_status(DataSourceState::Off, Some(err.to_error_info()));
					self.ready.mark_failed();
					return;
				}
				Err(err) => {
					warn!(error = %err, "Poll failed, will retry on next interval");
					self.updates
						.update_status(DataSourceState::Interrupted, Some(err.to_error_info()));
				}
			}
		}
	}

	async fn poll(&self) -> Result<()> {
		debug!(uri = %self.poll_uri, "Polling for flag data");

		let mut request = http::authorize(
			self.client.get(&self.poll_uri),
			&self.sdk_key,
			self.config.payload_filter.as_deref(),
		);
		let etag = self.etag.lock().clone();
		if let Some(etag) = etag {
			request = request.header(IF_NONE_MATCH, etag);
		}

		let response = request.send().await.map_err(|e| {
			if e.is_connect() {
				FlagsError::ConnectionFailed(e)
			} else {
				FlagsError::RequestFailed(e)
			}
		})?;

		let status = response.status();
		if status == StatusCode::NOT_MODIFIED {
			debug!("Flag data not modified since last poll");
			self.mark_valid();
			return Ok(());
		}
		if !status.is_success() {
			return Err(FlagsError::ServerError {
				status: status.as_u16(),
				message: response.text().await.unwrap_or_default(),
			});
		}

		let etag = response
			.headers()
			.get(ETAG)
			.and_then(|value| value.to_str().ok())
			.map(str::to_string);
		let body = response.text().await.map_err(FlagsError::RequestFailed)?;
		let data = parse_polling_payload(&body)?;

		if !self.updates.init(data).await {
			return Ok(());
		}
		*self.etag.lock() = etag;
		self.mark_valid();
		Ok(())
	}

	fn mark_valid(&self) {
		self.updates.update_status(DataSourceState::Valid, None);
		if self.ready.mark_ready() {
			info!("Polling data source initialized");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::broadcast::StatusBroadcaster;
	use crate::memory::InMemoryDataStore;
	use crate::store::DataStore;
	use crate::updates::DataStoreUpdates;
	use loom_flags_core::{DataKind, DataSourceErrorKind, FullDataSet, Item};
	use serde_json::json;
	use wiremock::matchers::{header, method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	const SDK_KEY: &str = "sdk-test-key";
	const FAST_FLOOR: Duration = Duration::from_millis(50);

	struct Harness {
		store: InMemoryDataStore,
		updates: Arc<DataSourceUpdates>,
	}

	impl Harness {
		fn new() -> Self {
			let store = InMemoryDataStore::new();
			let updates = Arc::new(DataSourceUpdates::new(
				Arc::new(store.clone()),
				StatusBroadcaster::new(),
				Arc::new(DataStoreUpdates::new(StatusBroadcaster::new())),
			));
			Self { store, updates }
		}

		fn source(&self, config: PollingConfig) -> PollingDataSource {
			PollingDataSource::with_min_interval(
				SDK_KEY,
				config,
				Arc::clone(&self.updates),
				FAST_FLOOR,
			)
			.unwrap()
		}
	}

	fn config(server: &MockServer) -> PollingConfig {
		PollingConfig::new()
			.base_uri(server.uri())
			.poll_interval(FAST_FLOOR)
	}

	fn payload(version: u64) -> serde_json::Value {
		FullDataSet::new()
			.with_item(
				DataKind::Flags,
				Item::new("a", version, json!({ "on": true })),
			)
			.with_item(DataKind::Segments, Item::new("s", 1, json!({ "included": [] })))
			.to_wire()
	}

	#[test]
	fn test_interval_below_floor_is_clamped() {
		let harness = Harness::new();
		let source = PollingDataSource::new(
			SDK_KEY,
			PollingConfig::new().poll_interval(Duration::from_secs(1)),
			Arc::clone(&harness.updates),
		)
		.unwrap();
		assert_eq!(source.poll_interval(), MIN_POLL_INTERVAL);
		assert_eq!(source.base_uri(), "https://sdk.loom.dev");
	}

	#[test]
	fn test_empty_filter_rejected_at_construction() {
		let harness = Harness::new();
		let result = PollingDataSource::new(
			SDK_KEY,
			PollingConfig::new().payload_filter(""),
			Arc::clone(&harness.updates),
		);
		assert!(matches!(result, Err(FlagsError::InvalidConfig(_))));
	}

	#[tokio::test]
	async fn test_first_poll_initializes_store() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.and(header("authorization", "Bearer sdk-test-key"))
			.respond_with(ResponseTemplate::new(200).set_body_json(payload(1)))
			.mount(&server)
			.await;

		let harness = Harness::new();
		let source = harness.source(config(&server));
		source.start().unwrap();

		assert!(source.wait_for_initialization(Duration::from_secs(5)).await);
		assert_eq!(harness.updates.status().state, DataSourceState::Valid);
		let flag = harness.store.get(DataKind::Flags, "a").await.unwrap().unwrap();
		assert_eq!(flag.version, 1);
		assert!(harness
			.store
			.get(DataKind::Segments, "s")
			.await
			.unwrap()
			.is_some());

		source.close().await;
		assert_eq!(harness.updates.status().state, DataSourceState::Off);
	}

	#[tokio::test]
	async fn test_unauthorized_turns_source_off() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.respond_with(ResponseTemplate::new(403))
			.expect(1)
			.mount(&server)
			.await;

		let harness = Harness::new();
		let source = harness.source(config(&server));
		source.start().unwrap();

		assert!(!source.wait_for_initialization(Duration::from_secs(5)).await);
		tokio::time::sleep(FAST_FLOOR * 4).await;

		let status = harness.updates.status();
		assert_eq!(status.state, DataSourceState::Off);
		assert_eq!(status.last_error.unwrap().status_code, Some(403));
		source.close().await;
	}

	#[tokio::test]
	async fn test_server_error_keeps_retrying() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let harness = Harness::new();
		let source = harness.source(config(&server));
		source.start().unwrap();

		assert!(!source.wait_for_initialization(FAST_FLOOR * 5).await);

		let status = harness.updates.status();
		assert_eq!(status.state, DataSourceState::Initializing);
		let error = status.last_error.unwrap();
		assert_eq!(error.kind, DataSourceErrorKind::ErrorResponse);
		assert_eq!(error.status_code, Some(500));
		let requests = server.received_requests().await.unwrap();
		assert!(requests.len() >= 2, "expected retries, saw {}", requests.len());

		source.close().await;
	}

	#[tokio::test]
	async fn test_invalid_payload_is_reported() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.respond_with(ResponseTemplate::new(200).set_body_string("{\"flags\": 42}"))
			.mount(&server)
			.await;

		let harness = Harness::new();
		let source = harness.source(config(&server));
		source.start().unwrap();

		assert!(!source.wait_for_initialization(FAST_FLOOR * 4).await);
		let error = harness.updates.status().last_error.unwrap();
		assert_eq!(error.kind, DataSourceErrorKind::InvalidData);

		source.close().await;
	}

	#[tokio::test]
	async fn test_not_modified_keeps_existing_data() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.and(header("if-none-match", "\"v1\""))
			.respond_with(ResponseTemplate::new(304))
			.with_priority(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("etag", "\"v1\"")
					.set_body_json(payload(1)),
			)
			.mount(&server)
			.await;

		let harness = Harness::new();
		let source = harness.source(config(&server));
		source.start().unwrap();
		assert!(source.wait_for_initialization(Duration::from_secs(5)).await);

		tokio::time::sleep(FAST_FLOOR * 4).await;

		let requests = server.received_requests().await.unwrap();
		let conditional = requests
			.iter()
			.filter(|r| r.headers.contains_key("if-none-match"))
			.count();
		assert!(conditional >= 1);
		assert_eq!(requests.len() - conditional, 1);
		assert_eq!(harness.updates.status().state, DataSourceState::Valid);
		assert!(harness.store.get(DataKind::Flags, "a").await.unwrap().is_some());

		source.close().await;
	}

	#[tokio::test]
	async fn test_payload_filter_is_sent() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.and(query_param("filter", "mobile"))
			.respond_with(ResponseTemplate::new(200).set_body_json(payload(1)))
			.mount(&server)
			.await;

		let harness = Harness::new();
		let source = harness.source(config(&server).payload_filter("mobile"));
		assert_eq!(source.payload_filter(), Some("mobile"));
		source.start().unwrap();

		assert!(source.wait_for_initialization(Duration::from_secs(5)).await);
		source.close().await;
	}

	#[tokio::test]
	async fn test_later_polls_replace_data() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.respond_with(ResponseTemplate::new(200).set_body_json(payload(1)))
			.up_to_n_times(1)
			.with_priority(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path(POLLING_PATH))
			.respond_with(ResponseTemplate::new(200).set_body_json(payload(2)))
			.mount(&server)
			.await;

		let harness = Harness::new();
		let source = harness.source(config(&server));
		source.start().unwrap();
		assert!(source.wait_for_initialization(Duration::from_secs(5)).await);

		let mut version = 0;
		for _ in 0..100 {
			version = harness
				.store
				.get(DataKind::Flags, "a")
				.await
				.unwrap()
				.map(|item| item.version)
				.unwrap_or(0);
			if version == 2 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert_eq!(version, 2);

		source.close().await;
	}
}
