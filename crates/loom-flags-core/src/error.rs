// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Errors raised while decoding stored items or wire payloads.
#[derive(Debug, Error)]
pub enum CoreError {
	#[error("malformed {event} event: {message}")]
	MalformedEvent { event: String, message: String },

	#[error("unknown data kind: {0}")]
	UnknownKind(String),

	#[error("item {key:?} is missing required field `{field}`")]
	MissingField { key: String, field: &'static str },

	#[error("item payload must be a JSON object (key {0:?})")]
	NotAnObject(String),

	#[error("serialization error: {0}")]
	Serialization(String),
}

impl From<serde_json::Error> for CoreError {
	fn from(err: serde_json::Error) -> Self {
		CoreError::Serialization(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, CoreError>;
