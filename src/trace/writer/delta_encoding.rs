//! Delta encoding stage.

use crate::trace::entries::Entry;
use crate::trace::writer::EntryVisitor;
use std::io;

/// Emits each entry's id and timestamp as the difference from the previously
/// emitted entry, shrinking the serialized representation. State is scoped
/// to one trace: the chain is rebuilt on every trace start, so the first
/// entry of a trace encodes against zero (the trace-start baseline).
pub struct DeltaEncodingVisitor {
    delegate: Box<dyn EntryVisitor>,
    last_id: i32,
    last_timestamp: i64,
}

impl DeltaEncodingVisitor {
    pub fn new(delegate: Box<dyn EntryVisitor>) -> Self {
        Self {
            delegate,
            last_id: 0,
            last_timestamp: 0,
        }
    }
}

impl EntryVisitor for DeltaEncodingVisitor {
    fn visit(&mut self, entry: &Entry) {
        match entry {
            Entry::Standard(e) => {
                let mut out = *e;
                out.id = e.id.wrapping_sub(self.last_id);
                out.timestamp = e.timestamp - self.last_timestamp;
                self.last_id = e.id;
                self.last_timestamp = e.timestamp;
                self.delegate.visit(&Entry::Standard(out));
            }
            Entry::Frames(e) => {
                let mut out = e.clone();
                out.id = e.id.wrapping_sub(self.last_id);
                out.timestamp = e.timestamp - self.last_timestamp;
                self.last_id = e.id;
                self.last_timestamp = e.timestamp;
                self.delegate.visit(&Entry::Frames(out));
            }
            Entry::Bytes(e) => {
                let mut out = e.clone();
                out.id = e.id.wrapping_sub(self.last_id);
                self.last_id = e.id;
                self.delegate.visit(&Entry::Bytes(out));
            }
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.delegate.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::entries::{BytesEntry, EntryType, StandardEntry};
    use std::sync::{Arc, Mutex};

    struct Capture(Arc<Mutex<Vec<Entry>>>);

    impl EntryVisitor for Capture {
        fn visit(&mut self, entry: &Entry) {
            self.0.lock().unwrap().push(entry.clone());
        }
        fn finish(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn standard(id: i32, timestamp: i64) -> Entry {
        Entry::Standard(StandardEntry {
            id,
            timestamp,
            entry_type: EntryType::Mark,
            ..Default::default()
        })
    }

    #[test]
    fn test_first_entry_encodes_against_zero() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut v = DeltaEncodingVisitor::new(Box::new(Capture(seen.clone())));
        v.visit(&standard(10, 500));
        match &seen.lock().unwrap()[0] {
            Entry::Standard(e) => {
                assert_eq!(e.id, 10);
                assert_eq!(e.timestamp, 500);
            }
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn test_subsequent_entries_are_deltas() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut v = DeltaEncodingVisitor::new(Box::new(Capture(seen.clone())));
        v.visit(&standard(10, 500));
        v.visit(&standard(12, 750));
        v.visit(&standard(13, 750));
        let seen = seen.lock().unwrap();
        match (&seen[1], &seen[2]) {
            (Entry::Standard(a), Entry::Standard(b)) => {
                assert_eq!((a.id, a.timestamp), (2, 250));
                assert_eq!((b.id, b.timestamp), (1, 0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bytes_delta_ids_but_keeps_timestamp_state() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut v = DeltaEncodingVisitor::new(Box::new(Capture(seen.clone())));
        v.visit(&standard(1, 100));
        v.visit(&Entry::Bytes(BytesEntry {
            id: 2,
            entry_type: EntryType::StringKey,
            matchid: 1,
            bytes: b"k".to_vec(),
        }));
        v.visit(&standard(3, 150));
        let seen = seen.lock().unwrap();
        match &seen[1] {
            Entry::Bytes(e) => assert_eq!(e.id, 1),
            other => panic!("unexpected {other:?}"),
        }
        match &seen[2] {
            // Timestamp baseline was untouched by the bytes record.
            Entry::Standard(e) => assert_eq!((e.id, e.timestamp), (1, 50)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
