//! Batched image reading: encoded JPEG and PNG images, loose or framed in
//! RecordIO and ZIP containers, decoded into fixed-shape `u8` tensors.

pub mod batch;
pub mod container;
pub mod error;
pub mod image;
pub mod params;
pub mod reader;
pub mod recordio;
pub mod source;
pub mod tensor;

// Re-export commonly used types
pub use error::{Error, Result};
pub use image::{DecodedImage, EncodedImage};
pub use params::{ImageFrame, ImageParams, LastBatchHandling, ReaderParams};
pub use reader::{ImageReader, ReaderState};
pub use source::{list_files, FileListOptions, Source};
pub use tensor::{Example, Tensor};

/// Whether this build can decode images.
///
/// The decoder sits behind the `image-reader` feature; without it every
/// attempt to build an [`ImageReader`] fails with [`Error::UnsupportedFeature`].
pub const fn supports_image_reader() -> bool {
    cfg!(feature = "image-reader")
}
