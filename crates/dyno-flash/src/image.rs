//! Firmware image sizing and load helpers.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::error;

use crate::{FULL_IMAGE_SIZE, MAIN_SIZE, SHADOW_SIZE};

/// Byte offset of shadow flash B within a full image (and within the
/// backup file); shadow A follows it.
pub const SHADOW_B_IMAGE_OFFSET: u64 = MAIN_SIZE as u64;
pub const SHADOW_A_IMAGE_OFFSET: u64 = MAIN_SIZE as u64 + SHADOW_SIZE as u64;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("{path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("{path}: size {size:#x} matches neither main flash ({MAIN_SIZE:#x}) nor main+shadows ({FULL_IMAGE_SIZE:#x})")]
    BadSize { path: String, size: u64 },
}

/// Shape of a firmware file, decided purely by size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareImage {
    /// Exactly the 4 MiB main array.
    MainOnly,
    /// Main array followed by shadow B then shadow A.
    MainAndShadows,
}

/// Classify `path` as a loadable firmware image. A wrong-sized file is
/// reported and rejected; the caller falls back to erased flash.
pub fn classify_firmware(path: &Path) -> Result<FirmwareImage, ImageError> {
    let meta = fs::metadata(path).map_err(|source| ImageError::Io {
        path: path.display().to_string(),
        source,
    })?;
    match meta.len() {
        len if len == MAIN_SIZE as u64 => Ok(FirmwareImage::MainOnly),
        len if len == FULL_IMAGE_SIZE as u64 => Ok(FirmwareImage::MainAndShadows),
        size => {
            error!(
                path = %path.display(),
                size = format_args!("{size:#x}"),
                "firmware image has no recognized layout, ignoring"
            );
            Err(ImageError::BadSize {
                path: path.display().to_string(),
                size,
            })
        }
    }
}

/// Build a device image of exactly `size` bytes from `data`, placing it at
/// `dest_offset` and padding with erased flash on both sides. Source data
/// beyond the device size is dropped.
pub fn image_from_bytes(data: &[u8], dest_offset: usize, size: usize) -> Vec<u8> {
    let mut image = vec![0xFFu8; size];
    if dest_offset < size {
        let take = data.len().min(size - dest_offset);
        image[dest_offset..dest_offset + take].copy_from_slice(&data[..take]);
    }
    image
}

/// Read `size` bytes of `path` starting at `src_offset`, padded with
/// erased flash if the file runs short.
pub fn image_from_file(path: &Path, src_offset: u64, size: usize) -> io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(src_offset))?;
    let mut data = Vec::with_capacity(size);
    file.take(size as u64).read_to_end(&mut data)?;
    data.resize(size, 0xFF);
    Ok(data)
}
