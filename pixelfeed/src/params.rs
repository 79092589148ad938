use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};
use crate::source::Source;

/// How images are framed inside each source.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ImageFrame {
    /// The whole source is one encoded image.
    #[default]
    None,
    /// MXNet-style RecordIO file, one image per record.
    RecordIo,
    /// ZIP archive, one image per file entry.
    Zip,
}

/// What to do when the dataset runs out in the middle of a batch.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LastBatchHandling {
    /// Fail with a short-batch error carrying the partial example.
    #[default]
    None,
    /// Discard the partial batch and report end of data.
    Drop,
    /// Fill the rest of the batch with zeroed images.
    Pad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageParams {
    pub image_frame: ImageFrame,
    /// Shorter-edge length to scale to before center-cropping.
    pub resize: Option<u32>,
    /// `[channels, height, width]` of every emitted image.
    pub image_dimensions: [u32; 3],
    pub to_rgb: bool,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            image_frame: ImageFrame::None,
            resize: None,
            image_dimensions: [3, 224, 224],
            to_rgb: false,
        }
    }
}

impl ImageParams {
    pub fn new(image_dimensions: [u32; 3]) -> Self {
        Self {
            image_dimensions,
            ..Default::default()
        }
    }

    pub fn image_frame(mut self, frame: ImageFrame) -> Self {
        self.image_frame = frame;
        self
    }

    pub fn resize(mut self, edge: u32) -> Self {
        self.resize = Some(edge);
        self
    }

    pub fn to_rgb(mut self, to_rgb: bool) -> Self {
        self.to_rgb = to_rgb;
        self
    }

    pub fn channels(&self) -> u32 {
        self.image_dimensions[0]
    }

    pub fn height(&self) -> u32 {
        self.image_dimensions[1]
    }

    pub fn width(&self) -> u32 {
        self.image_dimensions[2]
    }

    /// Bytes taken by one transformed image.
    pub fn image_size(&self) -> usize {
        self.image_dimensions.iter().map(|&d| d as usize).product()
    }

    /// Byte size of a batch of `batch_size` images, or `None` when it cannot
    /// be allocated.
    pub fn batch_bytes(&self, batch_size: usize) -> Option<usize> {
        self.image_dimensions
            .iter()
            .try_fold(batch_size, |acc, &d| acc.checked_mul(d as usize))
            .filter(|&bytes| bytes <= isize::MAX as usize)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_dimensions.contains(&0) {
            return Err(Error::config(format!(
                "image dimensions must be positive, got {:?}",
                self.image_dimensions
            )));
        }
        if self.resize == Some(0) {
            return Err(Error::config("resize must be positive"));
        }
        if self.batch_bytes(1).is_none() {
            return Err(Error::config(format!(
                "image dimensions {:?} are too large",
                self.image_dimensions
            )));
        }
        Ok(())
    }

    /// Read parameters from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|error| Error::Io {
            source_id: path.display().to_string(),
            error,
        })?;
        let params: Self = serde_json::from_str(&contents)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        params.validate()?;
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::config(format!("cannot serialize image params: {e}")))?;
        fs::write(path, json).map_err(|error| Error::Io {
            source_id: path.display().to_string(),
            error,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReaderParams {
    pub dataset: Vec<Source>,
    pub batch_size: usize,
    pub num_instances_to_skip: usize,
    pub num_instances_to_read: Option<usize>,
    pub shard_index: usize,
    pub num_shards: usize,
    pub last_batch_handling: LastBatchHandling,
    /// 0 reads synchronously, 1 decodes the next example in the background.
    pub num_prefetched_examples: usize,
}

impl ReaderParams {
    pub fn new(dataset: Vec<Source>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size,
            num_instances_to_skip: 0,
            num_instances_to_read: None,
            shard_index: 0,
            num_shards: 1,
            last_batch_handling: LastBatchHandling::None,
            num_prefetched_examples: 0,
        }
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.num_instances_to_skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.num_instances_to_read = Some(n);
        self
    }

    pub fn shard(mut self, index: usize, count: usize) -> Self {
        self.shard_index = index;
        self.num_shards = count;
        self
    }

    pub fn last_batch(mut self, handling: LastBatchHandling) -> Self {
        self.last_batch_handling = handling;
        self
    }

    pub fn prefetch(mut self, enabled: bool) -> Self {
        self.num_prefetched_examples = usize::from(enabled);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }
        if self.num_shards == 0 {
            return Err(Error::config("number of shards must be at least 1"));
        }
        if self.shard_index >= self.num_shards {
            return Err(Error::config(format!(
                "shard index {} out of range for {} shards",
                self.shard_index, self.num_shards
            )));
        }
        if self.num_prefetched_examples > 1 {
            return Err(Error::config(
                "at most one example can be prefetched ahead of the caller",
            ));
        }
        Ok(())
    }
}
