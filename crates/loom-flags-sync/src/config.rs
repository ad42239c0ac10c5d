// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for data sources and the caching wrapper.

use std::time::Duration;

use crate::error::{FlagsError, Result};

/// Default base URI of the streaming service.
pub const DEFAULT_STREAM_BASE_URI: &str = "https://stream.loom.dev";
/// Default base URI of the polling service.
pub const DEFAULT_POLLING_BASE_URI: &str = "https://sdk.loom.dev";
/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Default cap on the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Lowest polling interval accepted; smaller values are clamped up to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default cache TTL for the caching wrapper.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15);

/// How long the caching wrapper may serve a value without asking the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
	/// No caching: every read goes to the backend.
	Disabled,
	/// Entries expire after the given duration.
	Finite(Duration),
	/// Entries never expire. Misses still read through, and recovery from an
	/// outage still drops the cache.
	Infinite,
}

impl CacheTtl {
	/// Maps the signed-seconds convention: zero disables caching and any
	/// negative value caches forever.
	pub fn from_secs_signed(secs: i64) -> Self {
		match secs {
			0 => CacheTtl::Disabled,
			s if s < 0 => CacheTtl::Infinite,
			s => CacheTtl::Finite(Duration::from_secs(s.unsigned_abs())),
		}
	}

	pub fn is_enabled(&self) -> bool {
		match self {
			CacheTtl::Disabled => false,
			CacheTtl::Finite(ttl) => !ttl.is_zero(),
			CacheTtl::Infinite => true,
		}
	}

	pub fn is_infinite(&self) -> bool {
		matches!(self, CacheTtl::Infinite)
	}

	/// Returns true if an entry cached for `age` may still be served.
	pub fn is_fresh(&self, age: Duration) -> bool {
		match self {
			CacheTtl::Disabled => false,
			CacheTtl::Finite(ttl) => age < *ttl,
			CacheTtl::Infinite => true,
		}
	}
}

impl Default for CacheTtl {
	fn default() -> Self {
		CacheTtl::Finite(DEFAULT_CACHE_TTL)
	}
}

fn validate_filter(filter: &Option<String>) -> Result<()> {
	match filter {
		Some(f) if f.is_empty() => Err(FlagsError::InvalidConfig(
			"payload filter must not be empty".to_string(),
		)),
		_ => Ok(()),
	}
}

fn validate_base_uri(uri: &str) -> Result<()> {
	reqwest::Url::parse(uri)
		.map(|_| ())
		.map_err(|e| FlagsError::InvalidConfig(format!("invalid base URI {uri:?}: {e}")))
}

/// Configuration for the streaming data source.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
	/// Base URI of the streaming service.
	pub base_uri: String,
	/// Delay before the first reconnect. Zero selects the default.
	pub initial_reconnect_delay: Duration,
	/// Upper bound for the reconnect delay.
	pub max_reconnect_delay: Duration,
	/// Server-side payload filter key.
	pub payload_filter: Option<String>,
	/// Timeout for establishing the connection.
	pub connect_timeout: Duration,
	/// Longest silence tolerated before the connection is considered dead.
	pub read_timeout: Duration,
}

impl Default for StreamingConfig {
	fn default() -> Self {
		Self {
			base_uri: DEFAULT_STREAM_BASE_URI.to_string(),
			initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
			max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
			payload_filter: None,
			connect_timeout: Duration::from_secs(10),
			read_timeout: Duration::from_secs(300),
		}
	}
}

impl StreamingConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
		self.base_uri = uri.into();
		self
	}

	pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
		self.initial_reconnect_delay = delay;
		self
	}

	pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
		self.max_reconnect_delay = delay;
		self
	}

	pub fn payload_filter(mut self, filter: impl Into<String>) -> Self {
		self.payload_filter = Some(filter.into());
		self
	}

	pub fn connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	pub fn read_timeout(mut self, timeout: Duration) -> Self {
		self.read_timeout = timeout;
		self
	}

	/// Checks the configuration and returns it with defaults filled in.
	///
	/// A zero initial delay is replaced by the default and a trailing slash
	/// is stripped from the base URI.
	pub fn validated(mut self) -> Result<Self> {
		validate_filter(&self.payload_filter)?;
		validate_base_uri(&self.base_uri)?;
		if self.initial_reconnect_delay.is_zero() {
			self.initial_reconnect_delay = DEFAULT_INITIAL_RECONNECT_DELAY;
		}
		self.base_uri = self.base_uri.trim_end_matches('/').to_string();
		Ok(self)
	}
}

/// Configuration for the polling data source.
#[derive(Debug, Clone)]
pub struct PollingConfig {
	/// Base URI of the polling service.
	pub base_uri: String,
	/// Time between polls. Values below [`MIN_POLL_INTERVAL`] are clamped.
	pub poll_interval: Duration,
	/// Server-side payload filter key.
	pub payload_filter: Option<String>,
	/// Timeout for each poll request.
	pub request_timeout: Duration,
}

impl Default for PollingConfig {
	fn default() -> Self {
		Self {
			base_uri: DEFAULT_POLLING_BASE_URI.to_string(),
			poll_interval: MIN_POLL_INTERVAL,
			payload_filter: None,
			request_timeout: Duration::from_secs(10),
		}
	}
}

impl PollingConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
		self.base_uri = uri.into();
		self
	}

	pub fn poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	pub fn payload_filter(mut self, filter: impl Into<String>) -> Self {
		self.payload_filter = Some(filter.into());
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	/// Checks the configuration and clamps the interval to `floor`.
	pub(crate) fn validated_with_floor(mut self, floor: Duration) -> Result<Self> {
		validate_filter(&self.payload_filter)?;
		validate_base_uri(&self.base_uri)?;
		if self.poll_interval < floor {
			self.poll_interval = floor;
		}
		self.base_uri = self.base_uri.trim_end_matches('/').to_string();
		Ok(self)
	}

	/// Checks the configuration and clamps the interval to [`MIN_POLL_INTERVAL`].
	pub fn validated(self) -> Result<Self> {
		self.validated_with_floor(MIN_POLL_INTERVAL)
	}
}

/// Which data source a client runs.
#[derive(Debug, Clone)]
pub enum DataSourceConfig {
	Streaming(StreamingConfig),
	Polling(PollingConfig),
	/// No network activity; the store keeps whatever it already holds.
	Offline,
}

impl Default for DataSourceConfig {
	fn default() -> Self {
		DataSourceConfig::Streaming(StreamingConfig::default())
	}
}
