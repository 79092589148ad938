//! Batch assembly: transformed images into one contiguous tensor

use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use rayon::slice::ParallelSliceMut;

use crate::error::{Error, Result};
use crate::image::DecodedImage;
use crate::params::ImageParams;
use crate::tensor::{Example, Tensor};

/// Collects images into a `(batch, height, width, channels)` buffer.
///
/// The buffer is allocated once, up front. Image `i` lands at byte offset
/// `i * image_size`.
#[derive(Debug)]
pub struct BatchAssembler {
    batch_size: usize,
    channels: u32,
    height: u32,
    width: u32,
    buffer: Vec<u8>,
    filled: usize,
    padding: usize,
}

impl BatchAssembler {
    pub fn new(batch_size: usize, params: &ImageParams) -> Self {
        Self {
            batch_size,
            channels: params.channels(),
            height: params.height(),
            width: params.width(),
            buffer: vec![0; batch_size * params.image_size()],
            filled: 0,
            padding: 0,
        }
    }

    fn image_size(&self) -> usize {
        self.channels as usize * self.height as usize * self.width as usize
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.batch_size
    }

    /// Copy the next image into its slot.
    pub fn push(&mut self, img: &DecodedImage) -> Result<()> {
        if self.is_full() {
            return Err(Error::BatchSize {
                expected: self.batch_size,
                actual: self.batch_size + 1,
                partial: None,
            });
        }
        self.check(img)?;

        let size = self.image_size();
        let offset = self.filled * size;
        self.buffer[offset..offset + size].copy_from_slice(&img.data);
        self.filled += 1;
        Ok(())
    }

    /// Fill every remaining slot with zeros. Returns how many were added.
    pub fn pad(&mut self) -> usize {
        let added = self.batch_size - self.filled;
        // the buffer starts zeroed and slots past `filled` were never written
        self.filled = self.batch_size;
        self.padding += added;
        added
    }

    /// Turn the filled buffer into an example.
    ///
    /// A batch that is not full yields a short-batch error carrying the
    /// images collected so far.
    pub fn finish(mut self) -> Result<Example> {
        let shape = |n: usize| {
            vec![
                n,
                self.height as usize,
                self.width as usize,
                self.channels as usize,
            ]
        };

        if !self.is_full() {
            let actual = self.filled;
            let shape = shape(actual);
            log::warn!("Short batch: {actual} of {} images", self.batch_size);

            let len = actual * self.image_size();
            self.buffer.truncate(len);
            let partial = Tensor::from_vec(self.buffer, shape)
                .map(|t| Box::new(Example::new(t)))
                .filter(|_| actual > 0);
            return Err(Error::BatchSize {
                expected: self.batch_size,
                actual,
                partial,
            });
        }

        let shape = shape(self.batch_size);
        let tensor = Tensor::from_vec(self.buffer, shape)
            .ok_or_else(|| Error::config("batch buffer does not match its shape"))?;

        let mut example = Example::new(tensor);
        example.padding = self.padding;
        Ok(example)
    }

    fn check(&self, img: &DecodedImage) -> Result<()> {
        if img.channels() != self.channels {
            return Err(Error::ChannelMismatch {
                origin: img.origin.clone(),
                expected: self.channels,
                actual: img.channels(),
            });
        }
        if img.height != self.height || img.width != self.width {
            return Err(Error::ShapeMismatch {
                origin: img.origin.clone(),
                expected_height: self.height,
                expected_width: self.width,
                actual_height: img.height,
                actual_width: img.width,
            });
        }
        Ok(())
    }
}

/// Assemble a full batch, copying images into their slots in parallel.
pub fn assemble(
    images: &[DecodedImage],
    batch_size: usize,
    params: &ImageParams,
) -> Result<Example> {
    if images.len() > batch_size {
        return Err(Error::BatchSize {
            expected: batch_size,
            actual: images.len(),
            partial: None,
        });
    }

    let mut assembler = BatchAssembler::new(batch_size, params);
    for img in images {
        assembler.check(img)?;
    }

    let size = assembler.image_size();
    if size > 0 {
        assembler.buffer[..images.len() * size]
            .par_chunks_mut(size)
            .zip(images.par_iter())
            .for_each(|(slot, img)| slot.copy_from_slice(&img.data));
    }
    assembler.filled = images.len();

    log::debug!("Assembled batch of {} images", images.len());
    assembler.finish()
}
