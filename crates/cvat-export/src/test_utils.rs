// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

//! Fixtures shared by the unit tests.

use image::{ImageFormat, Rgba, RgbaImage};
use std::io::{Cursor, Write as _};
use zip::{CompressionMethod, write::SimpleFileOptions};

pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

/// Encodes a semi-transparent RGBA image as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 10, 128]));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png)
        .expect("PNG encoding should succeed");
    buffer.into_inner()
}

/// Builds an in-memory zip archive with the entries in the given order.
pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, data) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options)
                .expect("zip directory should be added");
            continue;
        }
        zip.start_file(*name, options)
            .expect("zip entry should start");
        zip.write_all(data).expect("zip entry should be written");
    }

    zip.finish().expect("zip should finish").into_inner()
}
