//! Typed trace entries.
//!
//! An [`Entry`] is one discrete recorded event. Producers build entries and
//! hand them to the [`Logger`](crate::trace::Logger); the drain side decodes
//! them back out of the ring buffer and runs them through the visitor chain.
//!
//! The `Serialize` impls here are for tooling convenience only. The on-the-wire
//! packed layout lives in [`format`](crate::trace::format) and is hand-packed.

use serde::Serialize;
use smallvec::SmallVec;

/// Upper bound on the payload of a [`BytesEntry`]. Longer input is truncated
/// at the logger boundary before it ever reaches the shared buffer.
pub const MAX_VARIABLE_LENGTH_ENTRY: usize = 1024;

/// Upper bound on the number of frames in a single [`FramesEntry`].
pub const MAX_STACK_DEPTH: usize = 255;

/// Inline capacity for frame batches. Deeper stacks spill to the heap, which
/// is acceptable on the drain side but producers packing from a raw slice
/// never go through this type.
pub type FrameList = SmallVec<[i64; 16]>;

/// Discriminant for every entry kind the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum EntryType {
    Unknown = 0,
    TraceStart = 1,
    TraceEnd = 2,
    TraceAbort = 3,
    TraceTimeout = 4,
    TraceBackwards = 5,
    MethodEnter = 6,
    MethodExit = 7,
    TraceAnnotation = 8,
    Counter = 9,
    Mark = 10,
    StackFrame = 11,
    StringKey = 12,
    StringValue = 13,
}

impl EntryType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => EntryType::TraceStart,
            2 => EntryType::TraceEnd,
            3 => EntryType::TraceAbort,
            4 => EntryType::TraceTimeout,
            5 => EntryType::TraceBackwards,
            6 => EntryType::MethodEnter,
            7 => EntryType::MethodExit,
            8 => EntryType::TraceAnnotation,
            9 => EntryType::Counter,
            10 => EntryType::Mark,
            11 => EntryType::StackFrame,
            12 => EntryType::StringKey,
            13 => EntryType::StringValue,
            _ => EntryType::Unknown,
        }
    }

    /// Stable text name used by the emission stage and the trace reader.
    pub fn name(self) -> &'static str {
        match self {
            EntryType::Unknown => "unknown",
            EntryType::TraceStart => "trace_start",
            EntryType::TraceEnd => "trace_end",
            EntryType::TraceAbort => "trace_abort",
            EntryType::TraceTimeout => "trace_timeout",
            EntryType::TraceBackwards => "trace_backwards",
            EntryType::MethodEnter => "method_enter",
            EntryType::MethodExit => "method_exit",
            EntryType::TraceAnnotation => "trace_annotation",
            EntryType::Counter => "counter",
            EntryType::Mark => "mark",
            EntryType::StackFrame => "stack_frame",
            EntryType::StringKey => "string_key",
            EntryType::StringValue => "string_value",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "unknown" => EntryType::Unknown,
            "trace_start" => EntryType::TraceStart,
            "trace_end" => EntryType::TraceEnd,
            "trace_abort" => EntryType::TraceAbort,
            "trace_timeout" => EntryType::TraceTimeout,
            "trace_backwards" => EntryType::TraceBackwards,
            "method_enter" => EntryType::MethodEnter,
            "method_exit" => EntryType::MethodExit,
            "trace_annotation" => EntryType::TraceAnnotation,
            "counter" => EntryType::Counter,
            "mark" => EntryType::Mark,
            "stack_frame" => EntryType::StackFrame,
            "string_key" => EntryType::StringKey,
            "string_value" => EntryType::StringValue,
            _ => return None,
        })
    }

    /// True for the entry kinds that drive the trace lifecycle state machine.
    pub fn is_trace_control(self) -> bool {
        matches!(
            self,
            EntryType::TraceStart
                | EntryType::TraceEnd
                | EntryType::TraceAbort
                | EntryType::TraceTimeout
                | EntryType::TraceBackwards
        )
    }
}

impl Default for EntryType {
    fn default() -> Self {
        EntryType::Unknown
    }
}

/// Fixed-size entry: the common case for method markers, counters, and the
/// lifecycle control records.
///
/// For control entries `extra` carries the trace id and `matchid` carries the
/// start flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StandardEntry {
    /// Assigned by the logger; unique within one logger instance modulo
    /// wraparound.
    pub id: i32,
    pub entry_type: EntryType,
    /// Monotonic nanoseconds.
    pub timestamp: i64,
    pub tid: i32,
    /// Type-dependent argument (method id, counter key, annotation key).
    pub callid: i32,
    /// Correlates related entries, e.g. a start/end pair.
    pub matchid: i32,
    /// Type-dependent wide argument (trace id, counter value).
    pub extra: i64,
}

/// A batch of stack-frame identifiers captured on one thread.
/// Frames are stored in unwinder order (leaf first); the stack-inverting
/// visitor flips them to root-first before emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FramesEntry {
    pub id: i32,
    pub entry_type: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub frames: FrameList,
}

/// Variable-length opaque payload, bounded by [`MAX_VARIABLE_LENGTH_ENTRY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BytesEntry {
    pub id: i32,
    pub entry_type: EntryType,
    /// Correlation argument linking the blob to another entry.
    pub matchid: i32,
    pub bytes: Vec<u8>,
}

/// Closed tagged union over the entry variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "entry")]
pub enum Entry {
    Standard(StandardEntry),
    Frames(FramesEntry),
    Bytes(BytesEntry),
}

impl Entry {
    pub fn id(&self) -> i32 {
        match self {
            Entry::Standard(e) => e.id,
            Entry::Frames(e) => e.id,
            Entry::Bytes(e) => e.id,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            Entry::Standard(e) => e.entry_type,
            Entry::Frames(e) => e.entry_type,
            Entry::Bytes(e) => e.entry_type,
        }
    }

    /// Returns the timestamp, if this variant carries one.
    /// [`BytesEntry`] is a metadata record without a timestamp.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            Entry::Standard(e) => Some(e.timestamp),
            Entry::Frames(e) => Some(e.timestamp),
            Entry::Bytes(_) => None,
        }
    }
}

/// Get the OS thread ID (tid) of the calling thread via `gettid()`.
pub fn current_tid() -> i32 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds; unsafe is
    // required because syscall() is a raw FFI function with no type checking.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Read the monotonic clock. This is a vDSO call on Linux, no actual syscall.
pub fn monotonic_time_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, initialized timespec on the stack.
    // CLOCK_MONOTONIC is always available on Linux and always succeeds.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}
