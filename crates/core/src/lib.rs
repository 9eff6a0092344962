mod buffer;
mod coordinator;
mod error;
mod logging;
mod manifest;
mod message;
mod settings;
mod sink;
mod wire;

pub const APP_NAME: &str = "formsaver";

pub use buffer::ReorderBuffer;
pub use coordinator::{Coordinator, DEFAULT_CLOSE_GRACE};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use manifest::{ManifestEntry, ManifestTable};
pub use message::Message;
pub use settings::{
    DEFAULT_CLOSE_GRACE_MS, DEFAULT_ROOT_DIR, DEFAULT_SOCKET_PATH, Settings,
};
pub use sink::{FileSink, FsSink, MemoryFile, MemorySink};
pub use wire::{SubmitError, SubmitFrame, SubmitResponse};
