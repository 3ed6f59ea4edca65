use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,
    #[error("identity {0:?} contains characters outside [A-Za-z0-9_-]")]
    InvalidCharacters(String),
}

/// Label a face is associated with (e.g. a student number).
///
/// The string form is embedded verbatim in corpus file names, so it is
/// restricted to ASCII alphanumerics, `-` and `_`. That keeps
/// `identity<ID>.<SEQ>.<EXT>` unambiguous to parse back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdentityError::Empty);
        }
        let valid = value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(IdentityError::InvalidCharacters(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl From<u32> for Identity {
    fn from(n: u32) -> Self {
        Self(n.to_string())
    }
}

impl From<u64> for Identity {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Axis-aligned face rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width` x `height` image. `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(FaceRect::new(self.x, self.y, w, h))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaceImageError {
    #[error("image has zero extent ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("stride {stride} is narrower than width {width}")]
    Stride { stride: usize, width: u32 },
    #[error("buffer holds {actual} bytes, layout needs {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("crop {rect:?} exceeds {width}x{height} image")]
    OutOfBounds { rect: FaceRect, width: u32, height: u32 },
}

/// Single-channel 8-bit grayscale pixel buffer.
///
/// Rows are `stride` bytes apart; only the first `width` bytes of each row
/// are pixels. Layout is validated at construction so accessors never
/// index out of bounds.
#[derive(Clone, PartialEq, Eq)]
pub struct FaceImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: usize,
}

impl FaceImage {
    /// Build a tightly packed image (`stride == width`).
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FaceImageError> {
        Self::with_stride(data, width, height, width as usize)
    }

    pub fn with_stride(
        data: Vec<u8>,
        width: u32,
        height: u32,
        stride: usize,
    ) -> Result<Self, FaceImageError> {
        if width == 0 || height == 0 {
            return Err(FaceImageError::Empty { width, height });
        }
        if stride < width as usize {
            return Err(FaceImageError::Stride { stride, width });
        }
        // The last row only needs `width` bytes.
        let expected = stride * (height as usize - 1) + width as usize;
        if data.len() < expected {
            return Err(FaceImageError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
        })
    }

    /// Uniform image, mostly useful for fixtures.
    pub fn filled(width: u32, height: u32, value: u8) -> Result<Self, FaceImageError> {
        Self::new(vec![value; width as usize * height as usize], width, height)
    }

    /// Build from a per-pixel function `f(x, y)`.
    pub fn from_fn(
        width: u32,
        height: u32,
        f: impl Fn(u32, u32) -> u8,
    ) -> Result<Self, FaceImageError> {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self::new(data, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The pixels of row `y` (exactly `width` bytes).
    ///
    /// Panics if `y >= height`.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize]
    }

    /// Panics if `(x, y)` lies outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.row(y)[x as usize]
    }

    pub fn bounds(&self) -> FaceRect {
        FaceRect::new(0, 0, self.width, self.height)
    }

    /// Copy out a tightly packed sub-image. The rectangle must lie inside.
    pub fn crop(&self, rect: &FaceRect) -> Result<FaceImage, FaceImageError> {
        let fits = rect.width > 0
            && rect.height > 0
            && rect.x as u64 + rect.width as u64 <= self.width as u64
            && rect.y as u64 + rect.height as u64 <= self.height as u64;
        if !fits {
            return Err(FaceImageError::OutOfBounds {
                rect: *rect,
                width: self.width,
                height: self.height,
            });
        }

        let mut data = Vec::with_capacity(rect.area() as usize);
        for y in rect.y..rect.y + rect.height {
            let row = self.row(y);
            data.extend_from_slice(&row[rect.x as usize..(rect.x + rect.width) as usize]);
        }
        FaceImage::new(data, rect.width, rect.height)
    }

    pub fn from_luma(img: image::GrayImage) -> Result<Self, FaceImageError> {
        let (width, height) = img.dimensions();
        Self::new(img.into_raw(), width, height)
    }

    pub fn to_luma(&self) -> image::GrayImage {
        let mut out = image::GrayImage::new(self.width, self.height);
        for y in 0..self.height {
            for (x, &p) in self.row(y).iter().enumerate() {
                out.put_pixel(x as u32, y, image::Luma([p]));
            }
        }
        out
    }
}

impl fmt::Debug for FaceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

/// One face found in an image together with the model's best guess for it.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    /// Tight crop of the detected face.
    pub face: FaceImage,
    /// Where the crop came from in the source image.
    pub rect: FaceRect,
    pub identity: Identity,
    /// Distance to the closest trained sample. Lower is a better match.
    pub confidence: f64,
}
