// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Categories of stored entities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::item::Item;

/// A category of stored entities.
///
/// Each kind knows how to pull the stable key and the version out of a raw
/// payload, so the store never has to understand the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
	/// Feature flag definitions.
	Flags,
	/// User segment definitions.
	Segments,
}

impl DataKind {
	/// Every kind, in the order a full data set is written.
	///
	/// Segments come first so that flags referencing them never land in a
	/// store that lacks them.
	pub const ALL: [DataKind; 2] = [DataKind::Segments, DataKind::Flags];

	/// Returns the wire name of this kind.
	pub fn name(&self) -> &'static str {
		match self {
			DataKind::Flags => "flags",
			DataKind::Segments => "segments",
		}
	}

	/// Looks a kind up by its wire name.
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"flags" => Some(DataKind::Flags),
			"segments" => Some(DataKind::Segments),
			_ => None,
		}
	}

	/// Decodes a raw payload into an [`Item`] of this kind.
	///
	/// The key is taken from `key` when supplied (map-keyed wire shapes),
	/// otherwise from the payload's `key` field. `version` is required and
	/// `deleted` defaults to `false`. The whole raw object is kept as the
	/// opaque payload.
	pub fn decode_item(&self, key: Option<&str>, raw: Value) -> Result<Item> {
		let obj = match raw.as_object() {
			Some(obj) => obj,
			None => return Err(CoreError::NotAnObject(key.unwrap_or_default().to_string())),
		};

		let key = match key {
			Some(k) => k.to_string(),
			None => obj
				.get("key")
				.and_then(Value::as_str)
				.map(str::to_string)
				.ok_or_else(|| CoreError::MissingField {
					key: String::new(),
					field: "key",
				})?,
		};

		let version = obj
			.get("version")
			.and_then(Value::as_u64)
			.ok_or_else(|| CoreError::MissingField {
				key: key.clone(),
				field: "version",
			})?;

		let deleted = obj.get("deleted").and_then(Value::as_bool).unwrap_or(false);

		Ok(Item {
			key,
			version,
			deleted,
			payload: raw,
		})
	}
}

impl fmt::Display for DataKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for DataKind {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self> {
		DataKind::from_name(s).ok_or_else(|| CoreError::UnknownKind(s.to_string()))
	}
}
