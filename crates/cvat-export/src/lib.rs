// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! # CVAT Bulk Export Library
//!
//! Exports the annotations (and optionally the images) of many CVAT tasks
//! concurrently and writes them to disk as plain files, one `task_<id>`
//! directory per task.
//!
//! ## Features
//!
//! - **Export state machine**: each task is polled until the server has
//!   prepared the export, then downloaded, decoded and written
//! - **Bounded worker pool**: a fixed number of tasks are exported at once
//! - **Failure isolation**: a failing task never stops the others; failed ids
//!   are appended to an error log that can be fed back in to retry
//! - **COCO 1.0 and YOLO 1.1**: archives are decoded by name, images are
//!   re-encoded as RGB JPEG and annotation files are copied verbatim
//! - **Task catalog**: list every task of a server and split the ids into
//!   batch files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cvat_export::{Client, Error, ExportConfig, ExportFormat, ExportOrchestrator, TaskIndex};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let client = Client::new()?
//!         .with_server("http://localhost:8080")?
//!         .with_login("username", "password")
//!         .await?;
//!     let client = Arc::new(client);
//!
//!     let ids = TaskIndex::new(client.clone()).list_all().await?;
//!
//!     let config = ExportConfig::new(ExportFormat::Coco).with_output_dir("exports");
//!     let orchestrator = ExportOrchestrator::new(client, config)?;
//!     orchestrator.submit(ids);
//!     let report = orchestrator.shutdown().await?;
//!
//!     println!(
//!         "{} tasks exported, {} failed",
//!         report.succeeded.len(),
//!         report.failed.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `profiling`: emits `tracing` spans around the poll and export stages

mod api;
mod archive;
mod client;
mod dataset;
mod error;
mod error_log;
mod export;
mod retry;
pub mod task_index;

#[cfg(test)]
mod test_utils;

pub use crate::{
    api::{ExportAction, ExportApi, ExportFormat, ExportRequest, ExportStatus, TaskId, TaskPage},
    archive::{
        ArchiveDecoder, ArchiveEntry, CocoDecoder, IMAGE_EXTENSIONS, YOLO_CONTROL_FILES,
        YoloDecoder, decoder_for, read_entries,
    },
    client::{Client, DEFAULT_SERVER},
    dataset::{CocoDataset, Dataset, ImageRecord, OutputLayout, TextRecord, YoloDataset},
    error::Error,
    error_log::{ErrorLog, ErrorRecorder},
    export::{
        DEFAULT_WORKERS, ENV_PREFIX, ExportConfig, ExportOrchestrator, ExportReport, ExportedTask,
        FailedTask, JobState, Progress,
    },
    retry::{PollPolicy, RetryScope, classify_url, create_retry_policy, log_retry_configuration},
    task_index::{Batch, DEFAULT_PAGE_SIZE, TaskIndex},
};
