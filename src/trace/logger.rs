//! Logger facade: the single entry point producers use to append entries.
//!
//! A `Logger` is constructed explicitly and shared by `Arc`; there is no
//! process-global instance. Every write assigns a fresh entry id, packs the
//! entry into a stack scratch buffer, and appends it to the ring buffer.
//! Apart from [`Logger::write_bytes`] building on a caller-provided slice,
//! nothing on this path allocates or blocks, so it is safe to call from
//! signal-handler context.

use crate::trace::entries::{
    current_tid, monotonic_time_nanos, EntryType, StandardEntry, MAX_VARIABLE_LENGTH_ENTRY,
};
use crate::trace::format::{self, MAX_PACKET_SIZE};
use crate::trace::ring_buffer::{Cursor, RingBuffer};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Sentinel id meaning tracing is off; never issued by the allocator.
pub const TRACING_DISABLED: i32 = -1;
/// Sentinel id meaning "no correlation"; never issued by the allocator.
pub const NO_MATCH: i32 = 0;

pub struct Logger {
    entry_id: AtomicI32,
    buffer: Arc<RingBuffer>,
}

impl Logger {
    pub fn new(buffer: Arc<RingBuffer>) -> Self {
        Self {
            entry_id: AtomicI32::new(0),
            buffer,
        }
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// Advance the shared counter by `step` and return the previous value,
    /// retrying past the two reserved sentinels. Lock-free, allocation-free,
    /// and bounded: at most two retries can hit a sentinel per wrap.
    pub fn next_id(&self, step: u16) -> i32 {
        loop {
            let id = self.entry_id.fetch_add(step as i32, Ordering::Relaxed);
            if id != TRACING_DISABLED && id != NO_MATCH {
                return id;
            }
        }
    }

    /// Append a standard entry. Returns the assigned id.
    pub fn write(&self, entry: StandardEntry) -> i32 {
        self.write_with_step(entry, 1)
    }

    /// Append a standard entry, advancing the id counter by `id_step` so a
    /// caller can reserve a correlation window of ids.
    pub fn write_with_step(&self, mut entry: StandardEntry, id_step: u16) -> i32 {
        entry.id = self.next_id(id_step);
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let n = format::pack_standard(&entry, &mut scratch);
        self.buffer.append(&scratch[..n]);
        entry.id
    }

    /// Append a standard entry and return the buffer position it landed at,
    /// for callers that need a synchronization point to resume draining from
    /// exactly this entry.
    pub fn write_and_get_cursor(&self, mut entry: StandardEntry) -> (i32, Cursor) {
        entry.id = self.next_id(1);
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let n = format::pack_standard(&entry, &mut scratch);
        let cursor = self.buffer.append(&scratch[..n]);
        (entry.id, cursor)
    }

    /// Append a variable-length byte blob. Payloads beyond
    /// [`MAX_VARIABLE_LENGTH_ENTRY`] are truncated at this boundary; the
    /// shared buffer never sees oversized input. Returns the assigned id.
    pub fn write_bytes(&self, entry_type: EntryType, arg1: i32, bytes: &[u8]) -> i32 {
        let len = bytes.len().min(MAX_VARIABLE_LENGTH_ENTRY);
        let id = self.next_id(1);
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let n = format::pack_bytes(id, entry_type, arg1, &bytes[..len], &mut scratch);
        self.buffer.append(&scratch[..n]);
        id
    }

    /// Append a batch of stack frames captured on `tid` at `time` (frames in
    /// unwinder order, leaf first). Depth is capped at the format's maximum.
    pub fn write_stack_frames(
        &self,
        tid: i32,
        time: i64,
        frames: &[i64],
        entry_type: EntryType,
    ) -> i32 {
        let id = self.next_id(1);
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let n = format::pack_frames(id, entry_type, time, tid, frames, &mut scratch);
        self.buffer.append(&scratch[..n]);
        id
    }

    /// Append a key/value trace annotation stamped with the current thread
    /// and time.
    pub fn write_trace_annotation(&self, key: i32, value: i64) -> i32 {
        self.write(StandardEntry {
            id: 0,
            entry_type: EntryType::TraceAnnotation,
            timestamp: monotonic_time_nanos(),
            tid: current_tid(),
            callid: key,
            matchid: NO_MATCH,
            extra: value,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_next_entry_id(&self, value: i32) {
        self.entry_id.store(value, Ordering::Relaxed);
    }
}
