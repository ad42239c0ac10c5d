// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom feature flags sync engine.
//!
//! This crate holds the data model shared by every store backend and data
//! source: versioned [`Item`]s grouped by [`DataKind`], atomic
//! [`FullDataSet`] snapshots, health reports, and the streaming/polling wire
//! shapes. It performs no I/O; the `loom-flags-sync` crate drives it.
//!
//! # Example
//!
//! ```
//! use loom_flags_core::{DataKind, FullDataSet, Item};
//! use serde_json::json;
//!
//! let set = FullDataSet::new()
//!     .with_item(DataKind::Flags, Item::new("a", 1, json!({"value": "x"})));
//!
//! let stale = Item::new("a", 1, json!({"value": "y"}));
//! let current = &set.items(DataKind::Flags).unwrap()["a"];
//! assert!(!stale.supersedes(Some(current)));
//! ```

pub mod error;
pub mod item;
pub mod kind;
pub mod sse;
pub mod status;

pub use error::{CoreError, Result};
pub use item::{FullDataSet, Item, RawDataSet};
pub use kind::DataKind;
pub use sse::StreamEvent;
pub use status::{
	DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus, StoreStatus,
};
