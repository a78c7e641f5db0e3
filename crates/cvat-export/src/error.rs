// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

use crate::TaskId;
use tokio::sync::AcquireError;

/// Error type for every CVAT export operation.
///
/// Setup problems (unknown format, bad configuration) are raised before any
/// job is started. Everything else is scoped to a single task and is
/// reported through the error log and [`ExportReport`](crate::ExportReport)
/// rather than aborting the run.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred while reading or writing files.
    IoError(std::io::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization, deserialization or validation error.
    JsonError(serde_json::Error),
    /// HTTP request error from the reqwest client.
    HttpError(reqwest::Error),
    /// URL parsing error.
    UrlParseError(url::ParseError),
    /// The downloaded archive could not be read.
    ZipError(zip::result::ZipError),
    /// An image entry could not be decoded or re-encoded.
    ImageError(image::ImageError),
    /// A text entry in the archive is not valid UTF-8.
    Utf8Error(std::string::FromUtf8Error),
    /// Integer parsing error.
    ParseIntError(std::num::ParseIntError),
    /// Async task join error.
    JoinError(tokio::task::JoinError),
    /// Semaphore acquisition error for the worker pool.
    SemaphoreError(AcquireError),
    /// The export format token is not one of the supported formats.
    UnsupportedFormat(String),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// The archive does not contain the expected annotation file.
    MissingAnnotations(String),
    /// Server returned an invalid or unexpected response.
    InvalidResponse,
    /// The server rejected the credentials.
    Unauthorized,
    /// The export was not ready after the configured number of polls.
    ExportTimeout {
        /// Task whose export never became ready.
        task_id: TaskId,
        /// Number of requests issued before giving up.
        attempts: u32,
    },
    /// The server accepted the export but never delivered the archive.
    DownloadIncomplete {
        /// Task whose archive was not delivered.
        task_id: TaskId,
        /// Number of download requests issued before giving up.
        attempts: u32,
    },
    /// The export was cancelled before it completed.
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpError(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParseError(err)
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::ZipError(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err)
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Utf8Error(err)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::ParseIntError(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::JoinError(err)
    }
}

impl From<AcquireError> for Error {
    fn from(err: AcquireError) -> Self {
        Error::SemaphoreError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::HttpError(e) => write!(f, "HTTP error: {}", e),
            Error::UrlParseError(e) => write!(f, "URL parse error: {}", e),
            Error::ZipError(e) => write!(f, "Archive error: {}", e),
            Error::ImageError(e) => write!(f, "Image error: {}", e),
            Error::Utf8Error(e) => write!(f, "Invalid UTF-8 text: {}", e),
            Error::ParseIntError(e) => write!(f, "Integer parse error: {}", e),
            Error::JoinError(e) => write!(f, "Task join error: {}", e),
            Error::SemaphoreError(e) => write!(f, "Semaphore error: {}", e),
            Error::UnsupportedFormat(s) => {
                write!(f, "Unsupported format: {} (expected coco or yolo)", s)
            }
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            Error::MissingAnnotations(s) => write!(f, "Missing annotations: {}", s),
            Error::InvalidResponse => write!(f, "Invalid server response"),
            Error::Unauthorized => write!(f, "Unauthorized access"),
            Error::ExportTimeout { task_id, attempts } => write!(
                f,
                "Export of task {} not ready after {} attempts",
                task_id, attempts
            ),
            Error::DownloadIncomplete { task_id, attempts } => write!(
                f,
                "Export of task {} was ready but not downloaded after {} attempts",
                task_id, attempts
            ),
            Error::Cancelled => write!(f, "Export cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::HttpError(e) => Some(e),
            Error::UrlParseError(e) => Some(e),
            Error::ZipError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::Utf8Error(e) => Some(e),
            Error::ParseIntError(e) => Some(e),
            Error::JoinError(e) => Some(e),
            Error::SemaphoreError(e) => Some(e),
            _ => None,
        }
    }
}
