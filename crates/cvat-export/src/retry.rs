// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! Retry and polling policies.
//!
//! Two separate mechanisms keep an export moving:
//!
//! - **HTTP retries** ([`create_retry_policy`]) are installed on the reqwest
//!   client and transparently repeat a single request after transient
//!   transport failures or server errors.
//! - **Export polling** ([`PollPolicy`]) is the application-level loop that
//!   keeps asking the server whether an export is ready. A pending export is
//!   a successful HTTP exchange (202 Accepted), so it is never retried by the
//!   HTTP layer.
//!
//! # HTTP Classification
//!
//! URLs are classified by path:
//!
//! - **Api**: `/api` or `/api/...` on the CVAT server. Authentication
//!   failures (401, 403) fail fast; 408, 429 and 5xx are retried.
//! - **FileIO**: anything else (static files, redirects to storage). Also
//!   retries 409 and 423.
//!
//! # Configuration
//!
//! - `CVAT_MAX_RETRIES`: maximum HTTP retries per request (default: 3)
//! - `CVAT_TIMEOUT`: request timeout in seconds (default: 30)

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Retry scope classification for URL-based retry policies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryScope {
    /// CVAT REST API calls under `/api`.
    Api,
    /// Any other request, typically archive or file transfers.
    FileIO,
}

/// Classifies a URL to determine which retry policy to apply.
///
/// Only HTTP(S) URLs whose path is exactly `/api` or starts with `/api/`
/// are API calls. Unparseable URLs fall back to [`RetryScope::FileIO`].
///
/// ```rust
/// use cvat_export::{RetryScope, classify_url};
///
/// assert_eq!(
///     classify_url("https://app.cvat.ai/api/tasks/12/dataset?format=COCO%201.0"),
///     RetryScope::Api
/// );
/// assert_eq!(classify_url("http://localhost:8080/api"), RetryScope::Api);
/// assert_eq!(
///     classify_url("https://app.cvat.ai/apis/other"),
///     RetryScope::FileIO
/// );
/// ```
pub fn classify_url(url: &str) -> RetryScope {
    if let Ok(parsed) = Url::parse(url) {
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return RetryScope::FileIO;
        }

        let path = parsed.path();
        if path == "/api" || path.starts_with("/api/") {
            return RetryScope::Api;
        }
    }

    RetryScope::FileIO
}

/// Creates the reqwest retry policy used by [`Client`](crate::Client).
///
/// | Scope  | Never retried | Retried                          |
/// |--------|---------------|----------------------------------|
/// | Api    | 401, 403      | 408, 429, 5xx, transport errors  |
/// | FileIO | -             | 408, 409, 423, 429, 5xx, transport errors |
///
/// The retry count comes from `CVAT_MAX_RETRIES` (default 3) and applies to
/// both scopes.
pub fn create_retry_policy() -> reqwest::retry::Builder {
    let max_retries = std::env::var("CVAT_MAX_RETRIES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    reqwest::retry::for_host("*")
        .max_retries_per_request(max_retries)
        .classify_fn(|req_rep| {
            let url = req_rep.uri().to_string();

            match classify_url(&url) {
                RetryScope::Api => match req_rep.status() {
                    Some(status) => match status.as_u16() {
                        401 | 403 => req_rep.success(),
                        429 | 408 | 500..=599 => req_rep.retryable(),
                        _ => req_rep.success(),
                    },
                    None if req_rep.error().is_some() => req_rep.retryable(),
                    None => req_rep.success(),
                },
                RetryScope::FileIO => match req_rep.status() {
                    Some(status) => match status.as_u16() {
                        429 | 408 | 500..=599 | 409 | 423 => req_rep.retryable(),
                        _ => req_rep.success(),
                    },
                    None if req_rep.error().is_some() => req_rep.retryable(),
                    None => req_rep.success(),
                },
            }
        })
}

pub fn log_retry_configuration() {
    let max_retries = std::env::var("CVAT_MAX_RETRIES").unwrap_or_else(|_| "3".to_string());
    let timeout = std::env::var("CVAT_TIMEOUT").unwrap_or_else(|_| "30".to_string());
    log::debug!(
        "Retry configuration - max_retries={}, timeout={}s",
        max_retries,
        timeout
    );
}

/// Bounds the export poll loop.
///
/// Each export issues at most `max_attempts` prepare requests to the server,
/// sleeping `interval` between consecutive requests. When the budget is
/// spent the job fails with [`Error::ExportTimeout`](crate::Error). An
/// accepted export gets the same budget again for its download requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            max_attempts: 20,
            interval: Duration::from_secs(1),
        }
    }
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        PollPolicy {
            max_attempts,
            interval,
        }
    }

    /// Longest time a single export may spend sleeping between polls.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Sleeps for one poll interval.
    ///
    /// Returns `false` if the token was cancelled before the interval
    /// elapsed.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }
}
