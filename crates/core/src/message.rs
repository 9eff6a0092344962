/// One ingress message of a multipart submission. A submission is the set of
/// messages sharing a `ts` token; each text field arrives as a single
/// `Unary`, each streamed file field as a `StreamInfo` followed by
/// `StreamData` chunks with ascending zero-based indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Unary {
        ts: String,
        field: String,
        filename: Option<String>,
        bytes: Vec<u8>,
        is_first: bool,
        is_last: bool,
    },
    StreamInfo {
        ts: String,
        field: String,
        filename: String,
        is_first: bool,
    },
    StreamData {
        ts: String,
        field: String,
        index: u32,
        bytes: Vec<u8>,
        is_last: bool,
    },
}

impl Message {
    pub fn ts(&self) -> &str {
        match self {
            Message::Unary { ts, .. }
            | Message::StreamInfo { ts, .. }
            | Message::StreamData { ts, .. } => ts,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Message::Unary { field, .. }
            | Message::StreamInfo { field, .. }
            | Message::StreamData { field, .. } => field,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match self {
            Message::Unary { filename, .. } => filename.as_deref(),
            Message::StreamInfo { filename, .. } => Some(filename),
            Message::StreamData { .. } => None,
        }
    }

    /// Chunk index; 0 for the non-chunk cases.
    pub fn index(&self) -> u32 {
        match self {
            Message::StreamData { index, .. } => *index,
            _ => 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Message::Unary { bytes, .. } | Message::StreamData { bytes, .. } => bytes,
            Message::StreamInfo { .. } => &[],
        }
    }

    pub fn is_first(&self) -> bool {
        match self {
            Message::Unary { is_first, .. } | Message::StreamInfo { is_first, .. } => *is_first,
            Message::StreamData { .. } => false,
        }
    }

    pub fn is_last(&self) -> bool {
        match self {
            Message::Unary { is_last, .. } | Message::StreamData { is_last, .. } => *is_last,
            Message::StreamInfo { .. } => false,
        }
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, Message::Unary { .. })
    }

    pub fn is_stream_info(&self) -> bool {
        matches!(self, Message::StreamInfo { .. })
    }

    pub fn is_stream_data(&self) -> bool {
        matches!(self, Message::StreamData { .. })
    }
}
