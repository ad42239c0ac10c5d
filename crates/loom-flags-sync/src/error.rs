// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the flag sync engine.

use std::time::Duration;

use loom_flags_core::{CoreError, DataSourceErrorInfo, DataSourceErrorKind};
use thiserror::Error;

use crate::http::is_http_error_recoverable;

/// Result type alias for the flag sync engine.
pub type Result<T> = std::result::Result<T, FlagsError>;

/// Errors that can occur while synchronizing flag data.
#[derive(Error, Debug)]
pub enum FlagsError {
	/// Configuration rejected at construction time.
	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),

	/// Failed to connect to the server.
	#[error("Failed to connect to server: {0}")]
	ConnectionFailed(#[source] reqwest::Error),

	/// HTTP request failed after connecting.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[source] reqwest::Error),

	/// Server returned an error response.
	#[error("Server returned an error: {status} - {message}")]
	ServerError {
		/// HTTP status code.
		status: u16,
		/// Error message from server.
		message: String,
	},

	/// SSE stream became unreadable.
	#[error("SSE stream error: {0}")]
	SseStreamError(String),

	/// No traffic on the stream within the read timeout.
	#[error("No data received from stream within {0:?}")]
	ReadTimeout(Duration),

	/// Failed to decode a server payload.
	#[error("Failed to parse server response: {0}")]
	ParseFailed(#[from] CoreError),

	/// The persistent backend failed an I/O operation.
	#[error("Data store backend error: {0}")]
	Backend(String),

	/// The data store has been closed.
	#[error("Data store has been closed")]
	StoreClosed,

	/// The data source has been closed.
	#[error("Data source has been closed")]
	SourceClosed,

	/// Client already closed.
	#[error("Client has been closed")]
	ClientClosed,

	/// Initialization did not complete in time.
	#[error("Client initialization timed out")]
	InitializationTimeout,
}

impl FlagsError {
	/// Returns true if a data source should reconnect after this error.
	///
	/// Authentication and other non-recoverable HTTP statuses, configuration
	/// errors and closed components are terminal.
	pub fn is_retryable(&self) -> bool {
		match self {
			FlagsError::ConnectionFailed(_)
			| FlagsError::RequestFailed(_)
			| FlagsError::SseStreamError(_)
			| FlagsError::ReadTimeout(_)
			| FlagsError::ParseFailed(_)
			| FlagsError::Backend(_)
			| FlagsError::InitializationTimeout => true,
			FlagsError::ServerError { status, .. } => is_http_error_recoverable(*status),
			FlagsError::InvalidConfig(_)
			| FlagsError::StoreClosed
			| FlagsError::SourceClosed
			| FlagsError::ClientClosed => false,
		}
	}

	/// Converts this error into the detail attached to a data source status.
	pub fn to_error_info(&self) -> DataSourceErrorInfo {
		match self {
			FlagsError::ServerError { status, message } => {
				DataSourceErrorInfo::http(*status, message.clone())
			}
			FlagsError::ConnectionFailed(_)
			| FlagsError::RequestFailed(_)
			| FlagsError::SseStreamError(_)
			| FlagsError::ReadTimeout(_) => {
				DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, self.to_string())
			}
			FlagsError::ParseFailed(_) => {
				DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, self.to_string())
			}
			FlagsError::Backend(_) | FlagsError::StoreClosed => {
				DataSourceErrorInfo::new(DataSourceErrorKind::StoreError, self.to_string())
			}
			_ => DataSourceErrorInfo::new(DataSourceErrorKind::Unknown, self.to_string()),
		}
	}
}
