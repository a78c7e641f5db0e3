// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! Export archive decoding.
//!
//! The server answers an export with a zip archive whose layout depends on
//! the requested format. An [`ArchiveDecoder`] turns those bytes into a
//! [`Dataset`]. Entries are selected by name only, never by inspecting
//! their contents:
//!
//! | Format   | Images                    | Annotations                    |
//! |----------|---------------------------|--------------------------------|
//! | COCO 1.0 | `*.png *.jpg *.jpeg *.bmp` | the `*.json` entry             |
//! | YOLO 1.1 | `*.png *.jpg *.jpeg *.bmp` | every other `*.txt` entry      |
//!
//! YOLO archives also carry control files (`obj.names`, `obj.data`,
//! `train.txt`, `label_colors.txt`) which are skipped.

use crate::{
    Error, ExportFormat,
    dataset::{CocoDataset, Dataset, ImageRecord, TextRecord, YoloDataset},
};
use log::{debug, warn};
use serde::de::IgnoredAny;
use std::io::{Cursor, Read};

/// Image file extensions recognised in export archives.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// YOLO control files that are neither images nor labels.
pub const YOLO_CONTROL_FILES: &[&str] = &["label_colors.txt", "obj.names", "obj.data", "train.txt"];

/// A named file read from an export archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    /// True when the entry name ends in one of [`IMAGE_EXTENSIONS`],
    /// compared case-insensitively.
    pub fn is_image(&self) -> bool {
        IMAGE_EXTENSIONS
            .iter()
            .any(|ext| has_extension(&self.name, ext))
    }

    pub fn has_extension(&self, ext: &str) -> bool {
        has_extension(&self.name, ext)
    }

    fn into_image(self) -> ImageRecord {
        ImageRecord {
            name: self.name,
            data: self.data,
        }
    }

    fn into_text(self) -> Result<TextRecord, Error> {
        Ok(TextRecord {
            text: String::from_utf8(self.data)?,
            name: self.name,
        })
    }
}

fn has_extension(name: &str, ext: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, suffix)| suffix.eq_ignore_ascii_case(ext))
}

/// Reads every file entry of an in-memory zip archive, in archive order.
///
/// Directory entries are skipped.
pub fn read_entries(archive: &[u8]) -> Result<Vec<ArchiveEntry>, Error> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive))?;
    let mut entries = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        entries.push(ArchiveEntry { name, data });
    }

    Ok(entries)
}

/// Turns a downloaded export archive into a [`Dataset`].
///
/// One implementation exists per [`ExportFormat`]; use
/// [`decoder_for`] to pick it. Implementations are stateless and shared
/// read-only between workers.
pub trait ArchiveDecoder: Send + Sync {
    /// The format this decoder understands.
    fn format(&self) -> ExportFormat;

    /// Decodes the raw archive bytes.
    fn decode(&self, archive: &[u8]) -> Result<Dataset, Error>;
}

/// Returns the decoder for `format`.
pub fn decoder_for(format: ExportFormat) -> Box<dyn ArchiveDecoder> {
    match format {
        ExportFormat::Coco => Box::new(CocoDecoder),
        ExportFormat::Yolo => Box::new(YoloDecoder),
    }
}

/// Decoder for COCO 1.0 archives.
#[derive(Clone, Copy, Debug, Default)]
pub struct CocoDecoder;

impl ArchiveDecoder for CocoDecoder {
    fn format(&self) -> ExportFormat {
        ExportFormat::Coco
    }

    fn decode(&self, archive: &[u8]) -> Result<Dataset, Error> {
        let mut images = Vec::new();
        let mut annotations: Option<TextRecord> = None;

        for entry in read_entries(archive)? {
            if entry.is_image() {
                images.push(entry.into_image());
            } else if entry.has_extension("json") {
                let record = entry.into_text()?;
                serde_json::from_str::<IgnoredAny>(&record.text)?;

                if let Some(previous) = &annotations {
                    warn!(
                        "archive contains several JSON files, {} replaces {}",
                        record.name, previous.name
                    );
                }
                annotations = Some(record);
            }
        }

        let annotations = annotations.ok_or_else(|| {
            Error::MissingAnnotations("COCO archive has no JSON annotation file".to_string())
        })?;

        debug!(
            "decoded COCO archive: {} images, annotations {}",
            images.len(),
            annotations.name
        );

        Ok(Dataset::Coco(CocoDataset {
            images,
            annotations,
        }))
    }
}

/// Decoder for YOLO 1.1 archives.
#[derive(Clone, Copy, Debug, Default)]
pub struct YoloDecoder;

impl ArchiveDecoder for YoloDecoder {
    fn format(&self) -> ExportFormat {
        ExportFormat::Yolo
    }

    fn decode(&self, archive: &[u8]) -> Result<Dataset, Error> {
        let mut dataset = YoloDataset::default();

        for entry in read_entries(archive)? {
            if YOLO_CONTROL_FILES.contains(&entry.name.as_str()) {
                continue;
            }

            if entry.is_image() {
                dataset.images.push(entry.into_image());
            } else if entry.has_extension("txt") {
                dataset.labels.push(entry.into_text()?);
            }
        }

        debug!(
            "decoded YOLO archive: {} images, {} labels",
            dataset.images.len(),
            dataset.labels.len()
        );

        Ok(Dataset::Yolo(dataset))
    }
}
