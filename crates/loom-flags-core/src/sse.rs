// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SSE (Server-Sent Events) payloads for flag data streaming.
//!
//! # Events
//!
//! - `put` - Full data set, replaces everything in the store
//! - `patch` - Single item upsert: `{kind, key, item}`
//! - `delete` - Single item tombstone: `{kind, key, version}`
//!
//! Any other event name is ignored. The polling endpoint returns the same
//! shape as the `data` field of a `put` event.
//!
//! # Example
//!
//! ```
//! use loom_flags_core::sse::StreamEvent;
//! use loom_flags_core::DataKind;
//!
//! let event = StreamEvent::parse("delete", r#"{"kind":"flags","key":"a","version":5}"#)
//!     .unwrap()
//!     .unwrap();
//!
//! match event {
//!     StreamEvent::Delete { kind, key, version } => {
//!         assert_eq!(kind, DataKind::Flags);
//!         assert_eq!(key, "a");
//!         assert_eq!(version, 5);
//!     }
//!     _ => unreachable!(),
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, Result};
use crate::item::{FullDataSet, Item, RawDataSet};
use crate::kind::DataKind;

/// Event names understood by the streaming client.
pub const PUT_EVENT: &str = "put";
pub const PATCH_EVENT: &str = "patch";
pub const DELETE_EVENT: &str = "delete";

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
	/// Replace the whole store.
	Put(FullDataSet),
	/// Upsert a single item.
	Patch {
		kind: DataKind,
		key: String,
		item: Item,
	},
	/// Tombstone a single item at `version`.
	Delete {
		kind: DataKind,
		key: String,
		version: u64,
	},
}

#[derive(Debug, Deserialize, Serialize)]
struct PutData {
	data: RawDataSet,
}

#[derive(Debug, Deserialize)]
struct PatchData {
	kind: String,
	key: String,
	item: Value,
}

#[derive(Debug, Deserialize)]
struct DeleteData {
	kind: String,
	key: String,
	version: u64,
}

impl StreamEvent {
	/// Returns the event name as sent on the wire.
	pub fn event_type(&self) -> &'static str {
		match self {
			StreamEvent::Put(_) => PUT_EVENT,
			StreamEvent::Patch { .. } => PATCH_EVENT,
			StreamEvent::Delete { .. } => DELETE_EVENT,
		}
	}

	/// Decodes an SSE event by name.
	///
	/// Returns `Ok(None)` for event names this client does not handle, and an
	/// error when a known event carries data that cannot be decoded.
	pub fn parse(event_name: &str, data: &str) -> Result<Option<StreamEvent>> {
		let malformed = |message: String| CoreError::MalformedEvent {
			event: event_name.to_string(),
			message,
		};

		match event_name {
			PUT_EVENT => {
				let put: PutData =
					serde_json::from_str(data).map_err(|e| malformed(e.to_string()))?;
				let set = FullDataSet::from_raw(put.data).map_err(|e| malformed(e.to_string()))?;
				Ok(Some(StreamEvent::Put(set)))
			}
			PATCH_EVENT => {
				let patch: PatchData =
					serde_json::from_str(data).map_err(|e| malformed(e.to_string()))?;
				let kind = patch.kind.parse::<DataKind>()?;
				let item = kind
					.decode_item(Some(&patch.key), patch.item)
					.map_err(|e| malformed(e.to_string()))?;
				Ok(Some(StreamEvent::Patch {
					kind,
					key: patch.key,
					item,
				}))
			}
			DELETE_EVENT => {
				let delete: DeleteData =
					serde_json::from_str(data).map_err(|e| malformed(e.to_string()))?;
				let kind = delete.kind.parse::<DataKind>()?;
				Ok(Some(StreamEvent::Delete {
					kind,
					key: delete.key,
					version: delete.version,
				}))
			}
			_ => Ok(None),
		}
	}

	/// Renders the JSON `data` field for this event.
	pub fn to_data(&self) -> Value {
		match self {
			StreamEvent::Put(set) => json!({ "data": set.to_wire() }),
			StreamEvent::Patch { kind, key, item } => json!({
				"kind": kind.name(),
				"key": key,
				"item": item.to_wire(),
			}),
			StreamEvent::Delete { kind, key, version } => json!({
				"kind": kind.name(),
				"key": key,
				"version": version,
			}),
		}
	}

	/// Renders the event as an SSE frame, including the trailing blank line.
	pub fn to_sse_frame(&self) -> String {
		format!("event: {}\ndata: {}\n\n", self.event_type(), self.to_data())
	}
}

/// Decodes a polling response body.
pub fn parse_polling_payload(body: &str) -> Result<FullDataSet> {
	let raw: RawDataSet = serde_json::from_str(body)?;
	FullDataSet::from_raw(raw)
}
