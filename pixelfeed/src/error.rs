use crate::tensor::Example;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while reading a dataset.
///
/// [`Error::EndOfData`] is the normal termination signal of a reader, every
/// other variant is a real failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Corrupt, truncated or unsupported encoded image.
    #[error("cannot decode image {origin}: {reason}")]
    Decode { origin: String, reason: String },

    /// Malformed container framing (e.g. a RecordIO length past end of file).
    #[error("malformed container {source_id}: {reason}")]
    Container { source_id: String, reason: String },

    #[error(
        "image {origin} is {actual_height}x{actual_width}, expected {expected_height}x{expected_width}"
    )]
    ShapeMismatch {
        origin: String,
        expected_height: u32,
        expected_width: u32,
        actual_height: u32,
        actual_width: u32,
    },

    #[error("image {origin} has {actual} channels, expected {expected}")]
    ChannelMismatch {
        origin: String,
        expected: u32,
        actual: u32,
    },

    /// The dataset ran dry before a full batch was collected. The partially
    /// filled example is attached so the caller can decide what to do with it.
    #[error("short batch: expected {expected} images, got {actual}")]
    BatchSize {
        expected: usize,
        actual: usize,
        partial: Option<Box<Example>>,
    },

    #[error("end of data")]
    EndOfData,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{0} support is not compiled in")]
    UnsupportedFeature(&'static str),

    #[error("cannot read {source_id}: {error}")]
    Io {
        source_id: String,
        #[source]
        error: std::io::Error,
    },
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn decode(origin: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Decode {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn container(source_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Container {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the expected end-of-dataset signal.
    pub fn is_end_of_data(&self) -> bool {
        matches!(self, Error::EndOfData)
    }

    /// Take the partial example out of a short-batch error.
    pub fn into_partial_example(self) -> Option<Example> {
        match self {
            Error::BatchSize { partial, .. } => partial.map(|b| *b),
            _ => None,
        }
    }
}
