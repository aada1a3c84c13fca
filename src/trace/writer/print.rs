//! Emission stage: formats entries as pipe-delimited text lines.

use crate::trace::entries::Entry;
use crate::trace::writer::EntryVisitor;
use std::io::{self, Write};
use tracing::warn;

/// Terminal stage of the chain. Owns the output stream (in production, the
/// compressed trace file) and renders one line per entry. After the first
/// write error the visitor goes quiet instead of spamming a dead stream;
/// `finish` surfaces the failure.
pub struct PrintEntryVisitor<W> {
    output: W,
    failed: bool,
}

impl<W: Write + Send> PrintEntryVisitor<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            failed: false,
        }
    }

    fn emit(&mut self, entry: &Entry) -> io::Result<()> {
        match entry {
            Entry::Standard(e) => writeln!(
                self.output,
                "{}|{}|{}|{}|{}|{}|{}",
                e.id,
                e.entry_type.name(),
                e.timestamp,
                e.tid,
                e.callid,
                e.matchid,
                e.extra
            ),
            Entry::Frames(e) => {
                write!(
                    self.output,
                    "{}|{}|{}|{}|",
                    e.id,
                    e.entry_type.name(),
                    e.timestamp,
                    e.tid
                )?;
                for (i, frame) in e.frames.iter().enumerate() {
                    if i > 0 {
                        self.output.write_all(b" ")?;
                    }
                    write!(self.output, "{frame}")?;
                }
                self.output.write_all(b"\n")
            }
            Entry::Bytes(e) => {
                write!(
                    self.output,
                    "{}|{}|{}|",
                    e.id,
                    e.entry_type.name(),
                    e.matchid
                )?;
                // Field and record separators inside the payload would
                // corrupt the line structure.
                let mut sanitized = e.bytes.clone();
                for b in &mut sanitized {
                    if *b == b'|' || *b == b'\n' || *b == b'\r' {
                        *b = b'_';
                    }
                }
                self.output.write_all(&sanitized)?;
                self.output.write_all(b"\n")
            }
        }
    }
}

impl<W: Write + Send> EntryVisitor for PrintEntryVisitor<W> {
    fn visit(&mut self, entry: &Entry) {
        if self.failed {
            return;
        }
        if let Err(err) = self.emit(entry) {
            warn!(%err, "trace output write failed, dropping remaining entries");
            self.failed = true;
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "trace output stream failed mid-trace",
            ));
        }
        self.output.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::entries::{BytesEntry, EntryType, FramesEntry, StandardEntry};
    use smallvec::smallvec;

    fn render(entries: &[Entry]) -> String {
        let mut out = Vec::new();
        {
            let mut v = PrintEntryVisitor::new(&mut out);
            for e in entries {
                v.visit(e);
            }
            v.finish().unwrap();
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_standard_line() {
        let out = render(&[Entry::Standard(StandardEntry {
            id: 3,
            entry_type: EntryType::Counter,
            timestamp: 120,
            tid: 9,
            callid: 44,
            matchid: 0,
            extra: -7,
        })]);
        assert_eq!(out, "3|counter|120|9|44|0|-7\n");
    }

    #[test]
    fn test_frames_line() {
        let out = render(&[Entry::Frames(FramesEntry {
            id: 4,
            entry_type: EntryType::StackFrame,
            timestamp: 50,
            tid: 2,
            frames: smallvec![16, 32, 48],
        })]);
        assert_eq!(out, "4|stack_frame|50|2|16 32 48\n");
    }

    #[test]
    fn test_bytes_line_sanitizes_separators() {
        let out = render(&[Entry::Bytes(BytesEntry {
            id: 5,
            entry_type: EntryType::StringValue,
            matchid: 4,
            bytes: b"a|b\nc".to_vec(),
        })]);
        assert_eq!(out, "5|string_value|4|a_b_c\n");
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_error_sticks_and_fails_finish() {
        let mut v = PrintEntryVisitor::new(FailingWriter);
        v.visit(&Entry::Standard(StandardEntry::default()));
        v.visit(&Entry::Standard(StandardEntry::default()));
        assert!(v.finish().is_err());
    }
}
