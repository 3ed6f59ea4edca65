//! Grayscale image decoding and encoding via the `image` crate.

use crate::types::{FaceImage, FaceImageError};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("image codec: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoded image unusable: {0}")]
    Layout(#[from] FaceImageError),
}

/// Decode any supported format and convert it to 8-bit luma.
pub fn load_grayscale(path: &Path) -> Result<FaceImage, CodecError> {
    let luma = image::open(path)?.to_luma8();
    Ok(FaceImage::from_luma(luma)?)
}

/// Encode `image` to a new file at `path`; the format follows the extension.
///
/// Fails with `AlreadyExists` instead of overwriting. The data is fsynced
/// before returning.
pub fn save_grayscale_new(image: &FaceImage, path: &Path) -> Result<(), CodecError> {
    let format = image::ImageFormat::from_path(path)?;
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    remove_on_error(path, encode_and_sync(image, format, file))
}

fn encode_and_sync(
    image: &FaceImage,
    format: image::ImageFormat,
    file: File,
) -> Result<(), CodecError> {
    let mut writer = BufWriter::new(file);
    image.to_luma().write_to(&mut writer, format)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Don't leave a truncated record behind: any failure after the file was
/// created removes it.
fn remove_on_error(path: &Path, result: Result<(), CodecError>) -> Result<(), CodecError> {
    if let Err(e) = &result {
        if let Err(rm) = std::fs::remove_file(path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                remove_error = %rm,
                "failed to remove partial image"
            );
        }
    }
    result
}
