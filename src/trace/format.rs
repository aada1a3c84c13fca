//! Packed entry layout for the ring buffer.
//!
//! ## Packet layout
//! ```text
//! Wire codes:
//!   0: Standard → code(u8) + id(i32) + type(u8) + timestamp(i64) + tid(i32)
//!                 + callid(i32) + matchid(i32) + extra(i64)          = 34 bytes
//!   1: Frames   → code(u8) + id(i32) + type(u8) + timestamp(i64) + tid(i32)
//!                 + depth(u8) + frames(N * i64)                      = 19 + 8N bytes
//!   2: Bytes    → code(u8) + id(i32) + type(u8) + matchid(i32)
//!                 + len(u16) + bytes(N)                              = 12 + N bytes
//! ```
//!
//! All multi-byte fields are little-endian. `pack_*` never allocates so the
//! producer path can serialize into a stack scratch buffer; `unpack` is only
//! used on the drain side and may allocate for variable payloads.

use crate::trace::entries::{
    BytesEntry, Entry, EntryType, FrameList, FramesEntry, StandardEntry, MAX_STACK_DEPTH,
    MAX_VARIABLE_LENGTH_ENTRY,
};
use std::io::{Error, ErrorKind, Result};

const WIRE_STANDARD: u8 = 0;
const WIRE_FRAMES: u8 = 1;
const WIRE_BYTES: u8 = 2;

pub const STANDARD_SIZE: usize = 34;
const FRAMES_FIXED: usize = 19;
const BYTES_FIXED: usize = 12;

/// Largest packet any entry can produce: a full-depth frames batch.
/// Ring-buffer slots are sized to this.
pub const MAX_PACKET_SIZE: usize = FRAMES_FIXED + 8 * MAX_STACK_DEPTH;

/// Returns the packed size of an entry. Must agree with what `pack` writes.
pub fn packed_size(entry: &Entry) -> usize {
    match entry {
        Entry::Standard(_) => STANDARD_SIZE,
        Entry::Frames(e) => FRAMES_FIXED + 8 * e.frames.len().min(MAX_STACK_DEPTH),
        Entry::Bytes(e) => BYTES_FIXED + e.bytes.len().min(MAX_VARIABLE_LENGTH_ENTRY),
    }
}

struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn put_i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.put(&v.to_le_bytes());
    }
}

/// Pack a standard entry. `buf` must hold at least [`STANDARD_SIZE`] bytes.
/// Returns the number of bytes written.
pub fn pack_standard(entry: &StandardEntry, buf: &mut [u8]) -> usize {
    let mut w = FieldWriter::new(buf);
    w.put_u8(WIRE_STANDARD);
    w.put_i32(entry.id);
    w.put_u8(entry.entry_type as u8);
    w.put_i64(entry.timestamp);
    w.put_i32(entry.tid);
    w.put_i32(entry.callid);
    w.put_i32(entry.matchid);
    w.put_i64(entry.extra);
    w.pos
}

/// Pack a frames batch straight from a borrowed slice. Frames beyond
/// [`MAX_STACK_DEPTH`] are dropped. `buf` must hold [`MAX_PACKET_SIZE`] bytes.
pub fn pack_frames(
    id: i32,
    entry_type: EntryType,
    timestamp: i64,
    tid: i32,
    frames: &[i64],
    buf: &mut [u8],
) -> usize {
    let depth = frames.len().min(MAX_STACK_DEPTH);
    let mut w = FieldWriter::new(buf);
    w.put_u8(WIRE_FRAMES);
    w.put_i32(id);
    w.put_u8(entry_type as u8);
    w.put_i64(timestamp);
    w.put_i32(tid);
    w.put_u8(depth as u8);
    for &frame in &frames[..depth] {
        w.put_i64(frame);
    }
    w.pos
}

/// Pack a byte blob straight from a borrowed slice. Payloads beyond
/// [`MAX_VARIABLE_LENGTH_ENTRY`] are truncated.
pub fn pack_bytes(
    id: i32,
    entry_type: EntryType,
    matchid: i32,
    bytes: &[u8],
    buf: &mut [u8],
) -> usize {
    let len = bytes.len().min(MAX_VARIABLE_LENGTH_ENTRY);
    let mut w = FieldWriter::new(buf);
    w.put_u8(WIRE_BYTES);
    w.put_i32(id);
    w.put_u8(entry_type as u8);
    w.put_i32(matchid);
    w.put(&(len as u16).to_le_bytes());
    w.put(&bytes[..len]);
    w.pos
}

/// Pack any entry. Returns the number of bytes written.
pub fn pack(entry: &Entry, buf: &mut [u8]) -> usize {
    match entry {
        Entry::Standard(e) => pack_standard(e, buf),
        Entry::Frames(e) => pack_frames(e.id, e.entry_type, e.timestamp, e.tid, &e.frames, buf),
        Entry::Bytes(e) => pack_bytes(e.id, e.entry_type, e.matchid, &e.bytes, buf),
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::new(ErrorKind::UnexpectedEof, "truncated packet"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }
}

/// Decode one packet. Rejects truncated or malformed input without panicking.
pub fn unpack(buf: &[u8]) -> Result<Entry> {
    let mut r = FieldReader::new(buf);
    match r.u8()? {
        WIRE_STANDARD => {
            let id = r.i32()?;
            let entry_type = EntryType::from_u8(r.u8()?);
            let timestamp = r.i64()?;
            let tid = r.i32()?;
            let callid = r.i32()?;
            let matchid = r.i32()?;
            let extra = r.i64()?;
            Ok(Entry::Standard(StandardEntry {
                id,
                entry_type,
                timestamp,
                tid,
                callid,
                matchid,
                extra,
            }))
        }
        WIRE_FRAMES => {
            let id = r.i32()?;
            let entry_type = EntryType::from_u8(r.u8()?);
            let timestamp = r.i64()?;
            let tid = r.i32()?;
            let depth = r.u8()? as usize;
            let mut frames = FrameList::with_capacity(depth);
            for _ in 0..depth {
                frames.push(r.i64()?);
            }
            Ok(Entry::Frames(FramesEntry {
                id,
                entry_type,
                timestamp,
                tid,
                frames,
            }))
        }
        WIRE_BYTES => {
            let id = r.i32()?;
            let entry_type = EntryType::from_u8(r.u8()?);
            let matchid = r.i32()?;
            let len = r.u16()? as usize;
            if len > MAX_VARIABLE_LENGTH_ENTRY {
                return Err(Error::new(ErrorKind::InvalidData, "oversized byte payload"));
            }
            let bytes = r.take(len)?.to_vec();
            Ok(Entry::Bytes(BytesEntry {
                id,
                entry_type,
                matchid,
                bytes,
            }))
        }
        code => Err(Error::new(
            ErrorKind::InvalidData,
            format!("unknown wire code {code}"),
        )),
    }
}
