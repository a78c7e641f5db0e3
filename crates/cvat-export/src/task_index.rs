// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! Task catalog listing and batch files.
//!
//! Large exports are usually split into batches that are run one at a time.
//! A batch file holds one batch per line with the ids separated by spaces:
//!
//! ```text
//! 101 102 103 104
//! 105 106 107 108
//! 109
//! ```
//!
//! [`restore`] reads such a file back as a single flat list; the batch
//! boundaries are only kept by [`restore_batches`].

use crate::{Error, ExportApi, TaskId};
use itertools::Itertools as _;
use log::debug;
use std::{
    collections::BTreeSet,
    fmt::Display,
    fs,
    path::Path,
    str::FromStr,
    sync::Arc,
};

/// Page size used when listing the task catalog.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// An ordered run of task ids exported together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch(Vec<TaskId>);

impl Batch {
    pub fn ids(&self) -> &[TaskId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_ids(self) -> Vec<TaskId> {
        self.0
    }
}

impl From<Vec<TaskId>> for Batch {
    fn from(ids: Vec<TaskId>) -> Self {
        Batch(ids)
    }
}

impl Display for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().join(" "))
    }
}

/// Pages through the task catalog of the server.
#[derive(Clone)]
pub struct TaskIndex {
    api: Arc<dyn ExportApi>,
    page_size: u32,
}

impl TaskIndex {
    pub fn new(api: Arc<dyn ExportApi>) -> Self {
        TaskIndex {
            api,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(self, page_size: u32) -> Self {
        TaskIndex {
            page_size: page_size.max(1),
            ..self
        }
    }

    /// Lists every task id visible to the client, in the order the server
    /// reports them.
    ///
    /// Pages are requested starting at 1 until the server reports that no
    /// further page exists. The order is not guaranteed to be stable
    /// between calls.
    pub async fn list_all(&self) -> Result<Vec<TaskId>, Error> {
        let mut ids = Vec::new();
        let mut page = 1;

        loop {
            let result = self.api.list_tasks(page, self.page_size).await?;
            debug!("task page {}: {} ids", page, result.ids.len());
            ids.extend(result.ids);

            if !result.has_next {
                break;
            }
            page += 1;
        }

        Ok(ids)
    }
}

/// Splits `ids` into contiguous batches of exactly `size` ids; the last
/// batch may be shorter.
///
/// ```rust
/// use cvat_export::{TaskId, task_index::batch};
///
/// let ids: Vec<TaskId> = (1..=5u64).map(|id| TaskId::try_from(id).unwrap()).collect();
/// let batches = batch(&ids, 2).unwrap();
/// assert_eq!(batches.len(), 3);
/// assert_eq!(batches[2].to_string(), "5");
/// ```
pub fn batch(ids: &[TaskId], size: usize) -> Result<Vec<Batch>, Error> {
    if size == 0 {
        return Err(Error::InvalidParameters(
            "Batch size must be at least 1".to_string(),
        ));
    }

    Ok(ids
        .chunks(size)
        .map(|chunk| Batch(chunk.to_vec()))
        .collect())
}

/// Writes one batch per line to `path`, replacing any existing file.
pub fn persist(batches: &[Batch], path: &Path) -> Result<(), Error> {
    let mut contents = String::new();
    for batch in batches {
        contents.push_str(&batch.to_string());
        contents.push('\n');
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Reads every id from a batch file into one flat list.
///
/// Line boundaries are not preserved: persisting batches and restoring them
/// yields the concatenation of the batches.
pub fn restore(path: &Path) -> Result<Vec<TaskId>, Error> {
    parse_ids(&fs::read_to_string(path)?)
}

/// Reads a batch file keeping one [`Batch`] per non-empty line.
pub fn restore_batches(path: &Path) -> Result<Vec<Batch>, Error> {
    fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_ids(line).map(Batch))
        .collect()
}

/// Parses whitespace-separated task ids.
pub fn parse_ids(text: &str) -> Result<Vec<TaskId>, Error> {
    text.split_whitespace().map(TaskId::from_str).collect()
}

/// Extracts every run of digits in `text` as a task id.
///
/// Useful for id lists that were edited by hand or copied from other tools,
/// e.g. `"[12, 13], task 14"` gives `12 13 14`. Runs equal to zero and runs
/// too large for a task id are skipped.
pub fn extract_ids(text: &str) -> Vec<TaskId> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .filter_map(|run| TaskId::from_str(run).ok())
        .collect()
}

/// Returns the ids of `all` that are missing from `done`, sorted and
/// without duplicates.
///
/// This is the work left after a partial run, e.g. every listed task minus
/// the task directories that already exist.
pub fn subtract(all: &[TaskId], done: &[TaskId]) -> Vec<TaskId> {
    let done: BTreeSet<_> = done.iter().collect();
    all.iter()
        .filter(|id| !done.contains(id))
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
