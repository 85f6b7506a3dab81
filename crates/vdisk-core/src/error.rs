use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, VdError>;

#[derive(Debug, Error)]
pub enum VdError {
    #[error("io error: {0}")]
    Io(String),

    #[error("corrupt structure: {0}")]
    Corrupt(&'static str),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("stream is not writable")]
    NotWritable,

    #[error("stream is not resizable")]
    NotResizable,

    #[error("record has no on-disk writer")]
    WriteNotSupported,

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("slice too short: need {needed} bytes, have {actual}")]
    SliceTooShort { needed: usize, actual: usize },

    #[error("parent mismatch: expected {expected}, found {found} in {path}")]
    ChainMismatch {
        expected: Uuid,
        found: Uuid,
        path: String,
    },

    #[error("no parent found for {path} (tried {tried:?})")]
    ParentNotFound { path: String, tried: Vec<String> },

    #[error("extent missing from overflow index: file={file_id} at block {blocks_seen}")]
    MissingExtent { file_id: u32, blocks_seen: u64 },

    #[error("read beyond the last mapped extent")]
    BeyondEof,

    #[error("operation cancelled")]
    Cancelled,
}

impl VdError {
    /// Short stable name of the error kind, used by the trace line format.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "Io",
            Self::Corrupt(_) => "Corrupt",
            Self::NotSupported(_) => "NotSupported",
            Self::NotWritable => "NotWritable",
            Self::NotResizable => "NotResizable",
            Self::WriteNotSupported => "WriteNotSupported",
            Self::OutOfBounds { .. } => "OutOfBounds",
            Self::OffsetOverflow => "OffsetOverflow",
            Self::SliceTooShort { .. } => "SliceTooShort",
            Self::ChainMismatch { .. } => "ChainMismatch",
            Self::ParentNotFound { .. } => "ParentNotFound",
            Self::MissingExtent { .. } => "MissingExtent",
            Self::BeyondEof => "BeyondEof",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl From<std::io::Error> for VdError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
