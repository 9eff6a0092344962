pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid settings: {message}")]
    InvalidSettings { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk parked out of order: ts={ts} field={field} index={index}")]
    OutOfOrder {
        ts: String,
        field: String,
        index: u32,
    },

    #[error("reorder buffer has no parked chunks")]
    EmptyBuffer,

    #[error("chunk index does not match table: ts={ts} field={field} index={index} expected={expected}")]
    MismatchedIndex {
        ts: String,
        field: String,
        index: u32,
        expected: u32,
    },

    #[error("no open file handle: ts={ts} field={field}")]
    MissingHandle { ts: String, field: String },

    #[error("invalid frame: {message}")]
    InvalidFrame { message: String },
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidSettings { .. } => "settings.invalid",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::OutOfOrder { .. } => "chunk.out_of_order",
            Error::EmptyBuffer => "buffer.empty",
            Error::MismatchedIndex { .. } => "chunk.mismatched_index",
            Error::MissingHandle { .. } => "sink.missing_handle",
            Error::InvalidFrame { .. } => "frame.invalid",
        }
    }

    // Informational diagnostics never abort an ingress call.
    pub fn is_informational(&self) -> bool {
        matches!(self, Error::OutOfOrder { .. } | Error::EmptyBuffer)
    }
}
