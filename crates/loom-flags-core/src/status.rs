// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Health reports for data stores and data sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability of the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
	/// False while the backend is failing I/O.
	pub available: bool,
	/// Set when the store has just recovered and may have missed updates
	/// while it was unavailable.
	pub refresh_needed: bool,
}

impl StoreStatus {
	pub fn available() -> Self {
		Self {
			available: true,
			refresh_needed: false,
		}
	}

	pub fn unavailable() -> Self {
		Self {
			available: false,
			refresh_needed: false,
		}
	}

	/// Back online after an outage; data may be stale.
	pub fn recovered() -> Self {
		Self {
			available: true,
			refresh_needed: true,
		}
	}
}

impl Default for StoreStatus {
	fn default() -> Self {
		Self::available()
	}
}

/// Lifecycle state of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceState {
	/// Not yet received a full payload.
	Initializing,
	/// Connected and up to date.
	Valid,
	/// Connection lost; retrying.
	Interrupted,
	/// Permanently stopped.
	Off,
}

impl DataSourceState {
	pub fn as_str(&self) -> &'static str {
		match self {
			DataSourceState::Initializing => "initializing",
			DataSourceState::Valid => "valid",
			DataSourceState::Interrupted => "interrupted",
			DataSourceState::Off => "off",
		}
	}
}

impl std::fmt::Display for DataSourceState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Broad category of a data source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceErrorKind {
	Unknown,
	/// Connect failure, reset, or read timeout.
	NetworkError,
	/// The server answered with an error status.
	ErrorResponse,
	/// The server sent data that could not be decoded.
	InvalidData,
	/// Writing received data into the store failed.
	StoreError,
}

/// Details of the most recent data source failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceErrorInfo {
	pub kind: DataSourceErrorKind,
	/// HTTP status, for [`DataSourceErrorKind::ErrorResponse`].
	pub status_code: Option<u16>,
	pub message: String,
	pub time: DateTime<Utc>,
}

impl DataSourceErrorInfo {
	pub fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			status_code: None,
			message: message.into(),
			time: Utc::now(),
		}
	}

	pub fn http(status_code: u16, message: impl Into<String>) -> Self {
		Self {
			kind: DataSourceErrorKind::ErrorResponse,
			status_code: Some(status_code),
			message: message.into(),
			time: Utc::now(),
		}
	}
}

/// Current data source state plus the last error seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceStatus {
	pub state: DataSourceState,
	/// When `state` was entered.
	pub state_since: DateTime<Utc>,
	pub last_error: Option<DataSourceErrorInfo>,
}

impl DataSourceStatus {
	pub fn initializing() -> Self {
		Self {
			state: DataSourceState::Initializing,
			state_since: Utc::now(),
			last_error: None,
		}
	}

	/// Applies a reported state change, returning true if anything changed.
	///
	/// - `Off` is terminal.
	/// - `Interrupted` while still `Initializing` stays `Initializing`; the
	///   source has never been valid, so nothing was interrupted.
	/// - The same state with no new error is not a change.
	pub fn apply(&mut self, state: DataSourceState, error: Option<DataSourceErrorInfo>) -> bool {
		if self.state == DataSourceState::Off {
			return false;
		}

		let state = if state == DataSourceState::Interrupted
			&& self.state == DataSourceState::Initializing
		{
			DataSourceState::Initializing
		} else {
			state
		};

		if state == self.state && error.is_none() {
			return false;
		}

		if state != self.state {
			self.state = state;
			self.state_since = Utc::now();
		}
		if error.is_some() {
			self.last_error = error;
		}
		true
	}
}

impl Default for DataSourceStatus {
	fn default() -> Self {
		Self::initializing()
	}
}


#[cfg(test)]
mod proptests {
	use super::*;
	use proptest::prelude::*;

	fn arb_state() -> impl Strategy<Value = DataSourceState> {
		prop_oneof![
			Just(DataSourceState::Initializing),
			Just(DataSourceState::Valid),
			Just(DataSourceState::Interrupted),
			Just(DataSourceState::Off),
		]
	}

	proptest! {
		#[test]
		fn off_absorbs_every_later_report(
			before in prop::collection::vec(arb_state(), 0..10),
			after in prop::collection::vec(arb_state(), 1..10),
		) {
			let mut status = DataSourceStatus::initializing();
			for state in before {
				status.apply(state, None);
			}
			status.apply(DataSourceState::Off, None);
			for state in after {
				prop_assert!(!status.apply(state, None));
			}
			prop_assert_eq!(status.state, DataSourceState::Off);
		}

		#[test]
		fn never_interrupted_before_first_valid(
			reports in prop::collection::vec(
				prop_oneof![Just(DataSourceState::Interrupted), Just(DataSourceState::Initializing)],
				1..10,
			),
		) {
			let mut status = DataSourceStatus::initializing();
			for state in reports {
				status.apply(state, None);
				prop_assert_eq!(status.state, DataSourceState::Initializing);
			}
		}
	}
}
