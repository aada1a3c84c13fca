pub mod analysis;
pub mod config;
pub mod engine;
pub mod entries;
pub mod format;
pub mod logger;
pub mod ring_buffer;
pub mod writer;

pub use analysis::{TraceHeader, TraceReader};
pub use config::UploadConfig;
pub use engine::{EngineConfig, EngineError, TraceEngine};
pub use entries::{
    BytesEntry, Entry, EntryType, FramesEntry, StandardEntry, MAX_STACK_DEPTH,
    MAX_VARIABLE_LENGTH_ENTRY,
};
pub use logger::{Logger, NO_MATCH, TRACING_DISABLED};
pub use ring_buffer::{Cursor, ReadResult, RingBuffer};
pub use writer::{
    AbortReason, EntryVisitor, TraceCallbacks, TraceLifecycleVisitor, TraceSetupError,
    TraceWriter,
};
