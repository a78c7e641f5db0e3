// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! Append-only log of failed task ids.
//!
//! Workers never touch the file directly. They send ids over a bounded
//! channel to a single writer task, which appends one id per line and
//! flushes after every record, so concurrent failures cannot interleave.

use crate::{Error, TaskId};
use log::{debug, error};
use std::path::{Path, PathBuf};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt as _,
    sync::mpsc::{self, Sender},
    task::JoinHandle,
};

const CHANNEL_CAPACITY: usize = 64;

/// Handle to the error log writer.
///
/// Must be opened from within a Tokio runtime. Call [`close`](Self::close)
/// to flush outstanding records and surface write errors.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    tx: Sender<TaskId>,
    writer: JoinHandle<Result<usize, Error>>,
}

impl ErrorLog {
    /// Starts the writer task appending to `path`.
    ///
    /// The file is created on the first failure, so a run without failures
    /// leaves no (or an unchanged) error log behind.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let (tx, mut rx) = mpsc::channel::<TaskId>(CHANNEL_CAPACITY);
        let writer_path = path.clone();

        let writer = tokio::spawn(async move {
            let mut file = None;
            let mut written = 0;

            while let Some(task_id) = rx.recv().await {
                if file.is_none() {
                    if let Some(parent) = writer_path.parent()
                        && !parent.as_os_str().is_empty()
                    {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    file = Some(
                        OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&writer_path)
                            .await?,
                    );
                }

                if let Some(file) = file.as_mut() {
                    file.write_all(format!("{}\n", task_id).as_bytes()).await?;
                    file.flush().await?;
                    written += 1;
                }
            }

            Ok::<usize, Error>(written)
        });

        ErrorLog { path, tx, writer }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a sender that workers use to record failures.
    pub fn recorder(&self) -> ErrorRecorder {
        ErrorRecorder {
            tx: self.tx.clone(),
        }
    }

    /// Waits until every recorded id has been written.
    ///
    /// Returns the number of ids appended by this log. Recorders that are
    /// still alive keep the writer open, so drop them first.
    pub async fn close(self) -> Result<usize, Error> {
        drop(self.tx);
        let written = self.writer.await??;
        debug!("error log {:?} closed, {} ids appended", self.path, written);
        Ok(written)
    }
}

/// Cloneable sending side of an [`ErrorLog`].
#[derive(Clone, Debug)]
pub struct ErrorRecorder {
    tx: Sender<TaskId>,
}

impl ErrorRecorder {
    pub async fn record(&self, task_id: TaskId) {
        if self.tx.send(task_id).await.is_err() {
            error!("error log writer stopped, task {} was not recorded", task_id);
        }
    }
}
