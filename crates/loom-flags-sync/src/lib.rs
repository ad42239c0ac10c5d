// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag data synchronization engine for Loom.
//!
//! This crate keeps a local, eventually consistent mirror of remote flag and
//! segment data so that evaluation never waits on the network. A data source
//! (streaming or polling) pushes updates through an update sink into a
//! [`DataStore`]; health changes of both are fanned out to listeners through
//! [`StatusBroadcaster`]s.
//!
//! # Features
//!
//! - **Versioned writes**: a stale or duplicate update never overwrites newer
//!   data, whatever order updates arrive in
//! - **Real-time Updates**: SSE streaming with jittered exponential backoff
//! - **Polling fallback**: conditional full fetches on a fixed interval
//! - **Persistent stores**: any [`PersistentBackend`] behind a read-through
//!   cache with per-key fetch coalescing
//! - **Status listeners**: bounded per-listener queues that never block the
//!   publisher
//!
//! # Example
//!
//! ```ignore
//! use loom_flags_sync::{DataKind, StreamingConfig, SyncClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SyncClient::builder()
//!         .sdk_key("loom_sdk_server_prod_xxx")
//!         .streaming(StreamingConfig::new().payload_filter("backend"))
//!         .build()
//!         .await?;
//!
//!     let mut statuses = client.add_data_source_status_listener();
//!     tokio::spawn(async move {
//!         while let Some(status) = statuses.recv().await {
//!             println!("data source is {}", status.state);
//!         }
//!     });
//!
//!     if let Some(flag) = client.get(DataKind::Flags, "feature.new_flow").await? {
//!         println!("{} at version {}", flag.key, flag.version);
//!     }
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod broadcast;
pub mod caching;
mod client;
pub mod config;
mod error;
pub mod http;
mod memory;
pub mod polling;
pub mod source;
mod store;
pub mod streaming;
pub mod updates;

pub use backoff::Backoff;
pub use broadcast::{ListenerId, StatusBroadcaster, StatusListener};
pub use caching::CachingStoreWrapper;
pub use client::{SyncClient, SyncClientBuilder, DEFAULT_INIT_TIMEOUT};
pub use config::{CacheTtl, DataSourceConfig, PollingConfig, StreamingConfig};
pub use error::{FlagsError, Result};
pub use memory::InMemoryDataStore;
pub use polling::PollingDataSource;
pub use source::{DataSource, OfflineDataSource};
pub use store::{DataStore, PersistentBackend};
pub use streaming::StreamingDataSource;
pub use updates::{DataSourceUpdates, DataStoreUpdates};

// Re-export core types for convenience
pub use loom_flags_core::{
	DataKind, DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus,
	FullDataSet, Item, StoreStatus, StreamEvent,
};
