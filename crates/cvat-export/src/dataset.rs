// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! Decoded export archives and their on-disk materialization.
//!
//! A [`Dataset`] is produced by an [`ArchiveDecoder`](crate::ArchiveDecoder)
//! and consumed once by the orchestrator, which writes the images and the
//! annotation files below the task's output directory:
//!
//! ```text
//! task_<id>/
//! ├── images/   (only when images were requested)
//! │   ├── frame_000000.jpg
//! │   └── frame_000001.jpg
//! └── labels/
//!     ├── instances_default.json   (COCO)
//!     └── frame_000000.txt         (YOLO, one per image)
//! ```

use crate::Error;
use image::ImageFormat;
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Component, Path, PathBuf},
};

/// How archive entry names are mapped to output files.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// Keep only the final path segment of each entry. Entries with the same
    /// base name in different archive folders overwrite each other.
    #[default]
    Flat,
    /// Keep the archive-relative path of each entry.
    Nested,
}

/// An image entry taken from the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRecord {
    /// Full entry name inside the archive.
    pub name: String,
    /// Encoded image bytes (PNG, JPEG or BMP).
    pub data: Vec<u8>,
}

/// A text entry taken from the archive (COCO JSON or YOLO label).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextRecord {
    /// Full entry name inside the archive.
    pub name: String,
    pub text: String,
}

/// Contents of a COCO 1.0 export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CocoDataset {
    pub images: Vec<ImageRecord>,
    /// The instances JSON document, kept verbatim.
    pub annotations: TextRecord,
}

/// Contents of a YOLO 1.1 export.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct YoloDataset {
    pub images: Vec<ImageRecord>,
    pub labels: Vec<TextRecord>,
}

/// A decoded export archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dataset {
    Coco(CocoDataset),
    Yolo(YoloDataset),
}

impl Dataset {
    pub fn images(&self) -> &[ImageRecord] {
        match self {
            Dataset::Coco(coco) => &coco.images,
            Dataset::Yolo(yolo) => &yolo.images,
        }
    }

    /// Annotation files that [`write_annotations`](Self::write_annotations)
    /// will produce, in archive order.
    pub fn annotation_records(&self) -> Vec<&TextRecord> {
        match self {
            Dataset::Coco(coco) => vec![&coco.annotations],
            Dataset::Yolo(yolo) => yolo.labels.iter().collect(),
        }
    }

    /// Converts every image to an RGB JPEG and writes it into `dir`.
    ///
    /// The output file keeps the entry's name with its extension replaced by
    /// `jpg`. Returns the number of images written.
    pub fn write_images(&self, dir: &Path, layout: OutputLayout) -> Result<usize, Error> {
        let mut tracker = WriteTracker::default();

        for image in self.images() {
            let path = output_path(dir, &image.name, layout)?.with_extension("jpg");
            tracker.claim(&path, &image.name);
            ensure_parent(&path)?;
            write_jpeg(&image.data, &path)?;
            trace!("wrote image {:?} from {}", path, image.name);
        }

        Ok(self.images().len())
    }

    /// Writes the annotation payload verbatim into `dir`.
    ///
    /// Returns the number of annotation files written.
    pub fn write_annotations(&self, dir: &Path, layout: OutputLayout) -> Result<usize, Error> {
        let mut tracker = WriteTracker::default();
        let records = self.annotation_records();

        for record in &records {
            let path = output_path(dir, &record.name, layout)?;
            tracker.claim(&path, &record.name);
            ensure_parent(&path)?;
            fs::write(&path, record.text.as_bytes())?;
            trace!("wrote annotations {:?} from {}", path, record.name);
        }

        Ok(records.len())
    }
}

/// Detects entries that map to the same output file.
#[derive(Default)]
struct WriteTracker {
    written: HashSet<PathBuf>,
}

impl WriteTracker {
    fn claim(&mut self, path: &Path, entry: &str) {
        if !self.written.insert(path.to_path_buf()) {
            warn!(
                "archive entry {} overwrites {:?} written by an earlier entry",
                entry, path
            );
        }
    }
}

/// Maps an archive entry name to a file below `dir`.
///
/// Only normal path components are used, so names such as `../x.txt` or
/// `/etc/x.txt` can never leave `dir`.
pub(crate) fn output_path(dir: &Path, name: &str, layout: OutputLayout) -> Result<PathBuf, Error> {
    let components: Vec<_> = Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();

    let relative: PathBuf = match layout {
        OutputLayout::Flat => components.last().map(PathBuf::from).unwrap_or_default(),
        OutputLayout::Nested => components.iter().collect(),
    };

    if relative.as_os_str().is_empty() {
        return Err(Error::InvalidParameters(format!(
            "Archive entry has no usable file name: {:?}",
            name
        )));
    }

    Ok(dir.join(relative))
}

fn ensure_parent(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_jpeg(data: &[u8], path: &Path) -> Result<(), Error> {
    let rgb = image::load_from_memory(data)?.to_rgb8();
    rgb.save_with_format(path, ImageFormat::Jpeg)?;
    Ok(())
}
