// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

use crate::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Identifier of an annotation task on the CVAT server.
///
/// Task ids are positive integers and are displayed without any prefix,
/// which is also how they appear in batch files, the error log and output
/// directory names (`task_<id>`).
///
/// # Examples
///
/// ```rust
/// use cvat_export::TaskId;
/// use std::str::FromStr;
///
/// let id = TaskId::try_from(42u64).unwrap();
/// assert_eq!(id.to_string(), "42");
///
/// let id = TaskId::from_str("1337").unwrap();
/// assert_eq!(id.value(), 1337);
///
/// assert!(TaskId::from_str("0").is_err());
/// ```
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u64", into = "u64")]
pub struct TaskId(u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for TaskId {
    type Error = Error;

    fn try_from(id: u64) -> Result<Self, Self::Error> {
        if id == 0 {
            return Err(Error::InvalidParameters(
                "Task ID must be a positive integer".to_string(),
            ));
        }
        Ok(TaskId(id))
    }
}

impl From<TaskId> for u64 {
    fn from(val: TaskId) -> Self {
        val.0
    }
}

impl TaskId {
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Name of the per-task output directory.
    pub fn dir_name(&self) -> String {
        format!("task_{}", self.0)
    }
}

impl TryFrom<&str> for TaskId {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        TaskId::from_str(s)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u64 = s.trim().parse()?;
        TaskId::try_from(id)
    }
}

/// Annotation format requested from the server.
///
/// The format is chosen once when the export is configured. The lowercase
/// token (`coco`, `yolo`) is what users type, while the wire name is what
/// the server expects in the `format` query parameter.
///
/// ```rust
/// use cvat_export::ExportFormat;
///
/// let format: ExportFormat = "yolo".parse().unwrap();
/// assert_eq!(format.wire_name(), "YOLO 1.1");
/// assert!("pascal".parse::<ExportFormat>().is_err());
/// ```
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[serde(try_from = "String", into = "String")]
pub enum ExportFormat {
    /// COCO 1.0: one JSON document for the whole task.
    #[default]
    Coco,
    /// YOLO 1.1: one text label file per image.
    Yolo,
}

impl ExportFormat {
    /// Format identifier sent to the server.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ExportFormat::Coco => "COCO 1.0",
            ExportFormat::Yolo => "YOLO 1.1",
        }
    }

    /// Short token used on the command line and in configuration files.
    pub fn token(&self) -> &'static str {
        match self {
            ExportFormat::Coco => "coco",
            ExportFormat::Yolo => "yolo",
        }
    }
}

impl Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coco" => Ok(ExportFormat::Coco),
            "yolo" => Ok(ExportFormat::Yolo),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl TryFrom<String> for ExportFormat {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ExportFormat::from_str(&s)
    }
}

impl From<ExportFormat> for String {
    fn from(format: ExportFormat) -> Self {
        format.token().to_string()
    }
}

/// Which phase of the export a request belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportAction {
    /// Ask the server to prepare the export (or report its progress).
    Prepare,
    /// Fetch the prepared archive.
    Download,
}

/// A single export request for one task.
///
/// `with_images` is part of every request: it selects whether the server
/// packs the task's images into the archive or only the annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportRequest {
    pub task_id: TaskId,
    pub format: ExportFormat,
    pub with_images: bool,
    pub action: ExportAction,
}

/// Server answer to an [`ExportRequest`].
#[derive(Clone, PartialEq, Eq)]
pub enum ExportStatus {
    /// The export is still being prepared, ask again later.
    Pending,
    /// The export has been prepared and can be downloaded.
    Accepted,
    /// The archive is available and included in the response.
    Ready(Vec<u8>),
}

impl std::fmt::Debug for ExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportStatus::Pending => f.write_str("Pending"),
            ExportStatus::Accepted => f.write_str("Accepted"),
            ExportStatus::Ready(body) => write!(f, "Ready({} bytes)", body.len()),
        }
    }
}

/// One page of the task catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskPage {
    pub ids: Vec<TaskId>,
    pub has_next: bool,
}

/// Remote operations the exporter needs from the annotation server.
///
/// [`Client`](crate::Client) implements this trait against the CVAT REST
/// API. The orchestrator and the task index only talk to this trait, which
/// keeps them independent from HTTP and lets tests script the server.
#[async_trait]
pub trait ExportApi: Send + Sync {
    /// Submit or poll an export, or download a prepared archive.
    async fn request_export(&self, request: &ExportRequest) -> Result<ExportStatus, Error>;

    /// Fetch one page (starting at 1) of the task catalog.
    async fn list_tasks(&self, page: u32, page_size: u32) -> Result<TaskPage, Error>;
}
