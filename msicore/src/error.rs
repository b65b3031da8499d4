use thiserror::Error;

/// Error taxonomy shared by image handling, registration orchestration and stack assembly.
#[derive(Error, Debug)]
pub enum MsiError {
    /// A required input (image, executable argument, slice) is absent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Only 2D, 3D with unit depth and full 3D images are supported.
    #[error("unsupported image dimensionality: shape {shape:?} (3D+t images are not supported)")]
    DimensionalityUnsupported { shape: Vec<usize> },

    /// Image and mask (or two images expected to share a grid) disagree in size, spacing or origin.
    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// In-plane element counts of a source layer and a destination volume differ.
    #[error("dimension mismatch: expected {expected} in-plane elements, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// A slice image does not expose the spectral-image capability.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("no transformation available, run the registration first")]
    MissingTransform,

    #[error("stack slot {0} is already occupied")]
    SlotOccupied(usize),

    #[error("stack slot {0} is empty")]
    EmptySlot(usize),

    /// Malformed parameter or transform-parameter text.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Malformed image or point-set file.
    #[error("format error: {0}")]
    Format(String),

    /// An external engine run did not finish successfully.
    #[error("{tool} failed: {outcome}")]
    Subprocess { tool: String, outcome: String },

    #[error("thread pool error: {0}")]
    ThreadPool(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MsiError>;

impl MsiError {
    pub fn parameter(msg: impl Into<String>) -> Self {
        MsiError::Parameter(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        MsiError::Format(msg.into())
    }
}
