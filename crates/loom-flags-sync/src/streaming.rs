// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Streaming data source.
//!
//! Holds one long-lived SSE connection and applies `put`, `patch` and
//! `delete` events to the store as they arrive. Retryable failures are
//! followed by a jittered exponential backoff; authentication failures and
//! other terminal responses turn the source off for good.
//!
//! The source also listens to the store's status. When a persistent store
//! comes back after an outage and asks for a refresh, the connection is
//! restarted at once so the server sends a fresh `put`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures::StreamExt;
use loom_flags_core::{
	DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, Item, StoreStatus, StreamEvent,
};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::broadcast::StatusListener;
use crate::config::StreamingConfig;
use crate::error::{FlagsError, Result};
use crate::http;
use crate::source::{DataSource, ReadySignal};
use crate::updates::DataSourceUpdates;

/// Path of the streaming endpoint, relative to the base URI.
pub const STREAM_PATH: &str = "/sdk/stream/all";

/// Data source backed by a server-sent event stream.
pub struct StreamingDataSource {
	inner: Arc<StreamInner>,
	started: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

struct StreamInner {
	sdk_key: String,
	config: StreamingConfig,
	stream_uri: String,
	client: Client,
	updates: Arc<DataSourceUpdates>,
	ready: ReadySignal,
	cancel: CancellationToken,
}

/// Why a connection ended.
#[derive(Debug)]
enum StreamOutcome {
	/// The server closed the stream cleanly.
	Ended,
	/// The store asked for fresh data; reconnect without delay.
	Restart,
	Failed(FlagsError),
}

impl StreamingDataSource {
	/// Creates a streaming source. Nothing connects until
	/// [`start`](DataSource::start) is called.
	///
	/// # Errors
	///
	/// Returns [`FlagsError::InvalidConfig`] for an empty payload filter or an
	/// unparseable base URI.
	pub fn new(
		sdk_key: impl Into<String>,
		config: StreamingConfig,
		updates: Arc<DataSourceUpdates>,
	) -> Result<Self> {
		let config = config.validated()?;
		let client = http::builder()
			.connect_timeout(config.connect_timeout)
			.build()
			.map_err(FlagsError::ConnectionFailed)?;
		let stream_uri = format!("{}{}", config.base_uri, STREAM_PATH);

		Ok(Self {
			inner: Arc::new(StreamInner {
				sdk_key: sdk_key.into(),
				config,
				stream_uri,
				client,
				updates,
				ready: ReadySignal::new(),
				cancel: CancellationToken::new(),
			}),
			started: AtomicBool::new(false),
			task: Mutex::new(None),
		})
	}

	pub fn base_uri(&self) -> &str {
		&self.inner.config.base_uri
	}

	/// Full URI the source connects to.
	pub fn stream_uri(&self) -> &str {
		&self.inner.stream_uri
	}

	/// Initial reconnect delay after defaults have been applied.
	pub fn initial_reconnect_delay(&self) -> Duration {
		self.inner.config.initial_reconnect_delay
	}

	pub fn payload_filter(&self) -> Option<&str> {
		self.inner.config.payload_filter.as_deref()
	}
}

#[async_trait]
impl DataSource for StreamingDataSource {
	fn start(&self) -> Result<()> {
		if self.inner.cancel.is_cancelled() {
			return Err(FlagsError::SourceClosed);
		}
		if self.started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
			FlagsError::InvalidConfig(format!("streaming requires a tokio runtime: {e}"))
		})?;
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
				warn!(error = %e, "Streaming task ended abnormally");
			}
			info!("Streaming data source closed");
		}
		self.inner.ready.mark_failed();
		self.inner.updates.update_status(DataSourceState::Off, None);
	}
}

impl Drop for StreamingDataSource {
	fn drop(&mut self) {
		self.inner.cancel.cancel();
	}
}

impl std::fmt::Debug for StreamingDataSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StreamingDataSource")
			.field("stream_uri", &self.inner.stream_uri)
			.field("payload_filter", &self.inner.config.payload_filter)
			.field("initialized", &self.inner.ready.is_ready())
			.finish()
	}
}

/// Waits for the next store status. Once the broadcaster is closed this
/// never resolves.
async fn next_store_status(listener: &mut Option<StatusListener<StoreStatus>>) -> StoreStatus {
	if let Some(current) = listener {
		if let Some(status) = current.recv().await {
			return status;
		}
		*listener = None;
	}
	std::future::pending().await
}

fn needs_refresh(status: StoreStatus) -> bool {
	status.available && status.refresh_needed
}

impl StreamInner {
	async fn run(self: Arc<Self>) {
		let mut backoff = Backoff::new(
			self.config.initial_reconnect_delay,
			self.config.max_reconnect_delay,
		);
		let mut store_status = Some(self.updates.add_store_status_listener());

		loop {
			let outcome = tokio::select! {
				_ = self.cancel.cancelled() => return,
				outcome = self.connect_and_process(&mut backoff, &mut store_status) => outcome,
			};

			match outcome {
				StreamOutcome::Restart => {
					info!("Data store needs a refresh, restarting stream");
					continue;
				}
				StreamOutcome::Ended => {
					self.updates.update_status(
						DataSourceState::Interrupted,
						Some(DataSourceErrorInfo::new(
							DataSourceErrorKind::NetworkError,
							"stream closed by server",
						)),
					);
				}
				StreamOutcome::Failed(err) if !err.is_retryable() => {
					error!(error = %err, "Streaming stopped by unrecoverable error");
					self.updates
						.update_status(DataSourceState::Off, Some(err.to_error_info()));
					self.ready.mark_failed();
					return;
				}
				StreamOutcome::Failed(err) => {
					self.updates
						.update_status(DataSourceState::Interrupted, Some(err.to_error_info()));
				}
			}

			let delay = backoff.next_delay();
			warn!(
				delay_ms = delay.as_millis() as u64,
				attempt = backoff.attempt(),
				"Reconnecting to stream"
			);

			let sleep = tokio::time::sleep(delay);
			tokio::pin!(sleep);
			loop {
				tokio::select! {
					_ = self.cancel.cancelled() => return,
					_ = &mut sleep => break,
					status = next_store_status(&mut store_status) => {
						if needs_refresh(status) {
							info!("Data store needs a refresh, reconnecting now");
							break;
						}
					}
				}
			}
		}
	}

	async fn connect_and_process(
		&self,
		backoff: &mut Backoff,
		store_status: &mut Option<StatusListener<StoreStatus>>,
	) -> StreamOutcome {
		info!(uri = %self.stream_uri, "Connecting to stream");

		let request = http::authorize(
			self.client.get(&self.stream_uri),
			&self.sdk_key,
			self.config.payload_filter.as_deref(),
		)
		.header(reqwest::header::ACCEPT, "text/event-stream")
		.header(reqwest::header::CACHE_CONTROL, "no-cache");

		let response = match tokio::time::timeout(self.config.read_timeout, request.send()).await {
			Ok(Ok(response)) => response,
			Ok(Err(e)) => return StreamOutcome::Failed(FlagsError::ConnectionFailed(e)),
			Err(_) => return StreamOutcome::Failed(FlagsError::ReadTimeout(self.config.read_timeout)),
		};

		let status = response.status();
		if !status.is_success() {
			return StreamOutcome::Failed(FlagsError::ServerError {
				status: status.as_u16(),
				message: response.text().await.unwrap_or_default(),
			});
		}
		info!("Stream connection established");

		let mut events = response.bytes_stream().eventsource();
		loop {
			let next = tokio::select! {
				status = next_store_status(store_status) => {
					if needs_refresh(status) {
						return StreamOutcome::Restart;
					}
					continue;
				}
				next = tokio::time::timeout(self.config.read_timeout, events.next()) => next,
			};

			match next {
				Err(_) => return StreamOutcome::Failed(FlagsError::ReadTimeout(self.config.read_timeout)),
				Ok(None) => return StreamOutcome::Ended,
				Ok(Some(Err(e))) => {
					return StreamOutcome::Failed(FlagsError::SseStreamError(e.to_string()))
				}
				Ok(Some(Ok(event))) => {
					if self.handle_event(&event).await {
						backoff.reset();
					}
				}
			}
		}
	}

	/// Applies one event. Returns true if it was decoded and dispatched.
	async fn handle_event(&self, event: &Event) -> bool {
		let parsed = match StreamEvent::parse(&event.event, &event.data) {
			Ok(Some(parsed)) => parsed,
			Ok(None) => {
				debug!(event = %event.event, "Ignoring unknown stream event");
				return false;
			}
			Err(e) => {
				warn!(event = %event.event, error = %e, "Dropping malformed stream event");
				return false;
			}
		};
		debug!(event = parsed.event_type(), "Processing stream event");

		match parsed {
			StreamEvent::Put(data) => {
				if !self.updates.init(data).await {
					return false;
				}
				self.updates.update_status(DataSourceState::Valid, None);
				if self.ready.mark_ready() {
					info!("Streaming data source initialized");
				}
			}
			StreamEvent::Patch { kind, key, item } => {
				if self.updates.upsert(kind, &key, item).await.is_err() {
					return false;
				}
			}
			StreamEvent::Delete { kind, key, version } => {
				let tombstone = Item::tombstone(key.clone(), version);
				if self.updates.upsert(kind, &key, tombstone).await.is_err() {
					return false;
				}
			}
		}
		true
	}
}
