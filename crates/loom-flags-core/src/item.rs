// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stored items and full data set snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::kind::DataKind;

/// A versioned entity held in the store.
///
/// Identity is `(kind, key)`. A deleted item is a tombstone: it keeps its
/// version so that older data can never resurrect the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
	/// Stable key within its kind.
	pub key: String,
	/// Server-assigned version. Higher wins.
	pub version: u64,
	/// Whether this item is a tombstone.
	#[serde(default)]
	pub deleted: bool,
	/// Opaque serialized payload.
	#[serde(default)]
	pub payload: Value,
}

impl Item {
	/// Creates a live item.
	pub fn new(key: impl Into<String>, version: u64, payload: Value) -> Self {
		Self {
			key: key.into(),
			version,
			deleted: false,
			payload,
		}
	}

	/// Creates a tombstone at the given version.
	pub fn tombstone(key: impl Into<String>, version: u64) -> Self {
		Self {
			key: key.into(),
			version,
			deleted: true,
			payload: Value::Null,
		}
	}

	/// Returns true if this item should replace `current`.
	///
	/// Equal versions are treated as stale so that replays are no-ops.
	pub fn supersedes(&self, current: Option<&Item>) -> bool {
		match current {
			Some(current) => self.version > current.version,
			None => true,
		}
	}

	/// Renders the item in its wire shape: the payload object with `key`,
	/// `version` and `deleted` stamped on top.
	pub fn to_wire(&self) -> Value {
		let mut obj = match &self.payload {
			Value::Object(obj) => obj.clone(),
			_ => Map::new(),
		};
		obj.insert("key".to_string(), Value::String(self.key.clone()));
		obj.insert("version".to_string(), Value::from(self.version));
		if self.deleted {
			obj.insert("deleted".to_string(), Value::Bool(true));
		}
		Value::Object(obj)
	}
}

/// Raw wire shape of a full data set: kind name, then key, then item object.
pub type RawDataSet = HashMap<String, HashMap<String, Value>>;

/// One atomic snapshot of every kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullDataSet {
	kinds: HashMap<DataKind, HashMap<String, Item>>,
}

impl FullDataSet {
	/// Creates an empty data set. Every kind is present and empty.
	pub fn new() -> Self {
		let mut kinds = HashMap::new();
		for kind in DataKind::ALL {
			kinds.insert(kind, HashMap::new());
		}
		Self { kinds }
	}

	/// Adds an item, returning the set for chaining.
	pub fn with_item(mut self, kind: DataKind, item: Item) -> Self {
		self.insert(kind, item);
		self
	}

	/// Adds or replaces an item.
	pub fn insert(&mut self, kind: DataKind, item: Item) {
		self
			.kinds
			.entry(kind)
			.or_default()
			.insert(item.key.clone(), item);
	}

	/// Returns the items of one kind.
	pub fn items(&self, kind: DataKind) -> Option<&HashMap<String, Item>> {
		self.kinds.get(&kind)
	}

	/// Iterates over kinds in write order.
	pub fn iter(&self) -> impl Iterator<Item = (DataKind, &HashMap<String, Item>)> {
		DataKind::ALL
			.into_iter()
			.filter_map(|kind| self.kinds.get(&kind).map(|items| (kind, items)))
	}

	/// Consumes the set into per-kind maps.
	pub fn into_kinds(self) -> HashMap<DataKind, HashMap<String, Item>> {
		self.kinds
	}

	/// Total number of items across all kinds.
	pub fn len(&self) -> usize {
		self.kinds.values().map(HashMap::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Decodes the raw wire shape. Unknown kinds are skipped so that newer
	/// servers can add categories without breaking older clients.
	pub fn from_raw(raw: RawDataSet) -> Result<Self> {
		let mut set = FullDataSet::new();
		for (kind_name, items) in raw {
			let Some(kind) = DataKind::from_name(&kind_name) else {
				continue;
			};
			for (key, value) in items {
				let item = kind.decode_item(Some(&key), value)?;
				set.insert(kind, item);
			}
		}
		Ok(set)
	}

	/// Renders the set in its raw wire shape.
	pub fn to_wire(&self) -> Value {
		let mut root = Map::new();
		for (kind, items) in self.iter() {
			let mut by_key = Map::new();
			for (key, item) in items {
				by_key.insert(key.clone(), item.to_wire());
			}
			root.insert(kind.name().to_string(), Value::Object(by_key));
		}
		Value::Object(root)
	}
}

impl FromIterator<(DataKind, Item)> for FullDataSet {
	fn from_iter<I: IntoIterator<Item = (DataKind, Item)>>(iter: I) -> Self {
		let mut set = FullDataSet::new();
		for (kind, item) in iter {
			set.insert(kind, item);
		}
		set
	}
}
