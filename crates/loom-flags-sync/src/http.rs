// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared HTTP client construction and status classification.

use reqwest::{Client, ClientBuilder, RequestBuilder};

/// Returns the User-Agent sent with every request.
///
/// Format: `loom-flags-sync/{version}`
pub fn user_agent() -> String {
	format!("loom-flags-sync/{}", env!("CARGO_PKG_VERSION"))
}

/// Creates an HTTP client builder with the standard User-Agent header.
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Returns true if a request that failed with `status` is worth retrying.
///
/// 400, 408 and 429 are transient; every other 4xx (notably 401 and 403)
/// means retrying will not help. Everything else, including 5xx, is retried.
pub fn is_http_error_recoverable(status: u16) -> bool {
	match status {
		400 | 408 | 429 => true,
		400..=499 => false,
		_ => true,
	}
}

/// Adds SDK key authentication and the optional payload filter.
pub(crate) fn authorize(
	request: RequestBuilder,
	sdk_key: &str,
	payload_filter: Option<&str>,
) -> RequestBuilder {
	let request = request.header(
		reqwest::header::AUTHORIZATION,
		format!("Bearer {}", sdk_key),
	);
	match payload_filter {
		Some(filter) => request.query(&[("filter", filter)]),
		None => request,
	}
}
