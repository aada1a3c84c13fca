//! Timestamp truncation stage.

use crate::trace::entries::Entry;
use crate::trace::writer::EntryVisitor;
use std::io;

/// Rewrites absolute nanosecond timestamps into reduced-precision units
/// before they reach the delta stage, so deltas are computed over the values
/// that actually get emitted. Precision `p` keeps `p` decimal digits of a
/// second: units of `10^(9-p)` nanoseconds.
pub struct TimestampTruncatingVisitor {
    delegate: Box<dyn EntryVisitor>,
    denominator: i64,
}

impl TimestampTruncatingVisitor {
    pub fn new(delegate: Box<dyn EntryVisitor>, precision: u32) -> Self {
        debug_assert!(precision <= 9);
        Self {
            delegate,
            denominator: 10i64.pow(9 - precision.min(9)),
        }
    }
}

impl EntryVisitor for TimestampTruncatingVisitor {
    fn visit(&mut self, entry: &Entry) {
        match entry {
            Entry::Standard(e) => {
                let mut out = *e;
                out.timestamp = e.timestamp / self.denominator;
                self.delegate.visit(&Entry::Standard(out));
            }
            Entry::Frames(e) => {
                let mut out = e.clone();
                out.timestamp = e.timestamp / self.denominator;
                self.delegate.visit(&Entry::Frames(out));
            }
            // No timestamp to truncate.
            Entry::Bytes(_) => self.delegate.visit(entry),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.delegate.finish()
    }
}
