//! Image decoding and transformation pipeline

mod decode;
mod transform;

pub use decode::decode;
pub use transform::{convert_channels, resize_and_crop, transform};

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use strum::Display;

use crate::error::Result;
use crate::params::ImageParams;

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Encoded image format, detected from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Unknown,
}

impl ImageFormat {
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(JPEG_MAGIC) {
            ImageFormat::Jpeg
        } else if data.starts_with(PNG_MAGIC) {
            ImageFormat::Png
        } else {
            ImageFormat::Unknown
        }
    }
}

/// Encoded bytes of a single image along with where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    /// Source id, plus the record index for multi-image containers.
    pub origin: String,
}

impl EncodedImage {
    pub fn new(data: Vec<u8>, origin: impl Into<String>) -> Self {
        let format = ImageFormat::detect(&data);
        Self {
            data,
            format,
            origin: origin.into(),
        }
    }
}

/// Interleaved channel layout of a decoded pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ChannelOrder {
    Gray,
    GrayAlpha,
    Bgr,
    Bgra,
    Rgb,
    Rgba,
}

impl ChannelOrder {
    pub fn channels(self) -> u32 {
        match self {
            ChannelOrder::Gray => 1,
            ChannelOrder::GrayAlpha => 2,
            ChannelOrder::Bgr | ChannelOrder::Rgb => 3,
            ChannelOrder::Bgra | ChannelOrder::Rgba => 4,
        }
    }
}

/// Raw 8-bit pixels, row-major and channel-last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
    pub origin: String,
}

impl DecodedImage {
    pub fn channels(&self) -> u32 {
        self.order.channels()
    }

    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.channels() as usize
    }
}

/// Decode and transform one image to the configured shape.
pub fn process(encoded: &EncodedImage, params: &ImageParams) -> Result<DecodedImage> {
    let img = decode(encoded)?;
    transform(img, params)
}

/// Decode and transform a batch in parallel, keeping input order.
///
/// When several images fail, the error of the first one in order wins.
pub fn process_batch(images: Vec<EncodedImage>, params: &ImageParams) -> Result<Vec<DecodedImage>> {
    log::trace!("Processing {} images", images.len());

    let results: Vec<Result<DecodedImage>> = images
        .into_par_iter()
        .map(|encoded| process(&encoded, params))
        .collect();

    results.into_iter().collect()
}
