//! Stack inversion stage.

use crate::trace::entries::Entry;
use crate::trace::writer::EntryVisitor;
use std::io;

/// Reorders captured call stacks from unwinder order (leaf first) into
/// root-first order before emission. Pure per-entry transformation with no
/// cross-entry state.
pub struct StackTraceInvertingVisitor {
    delegate: Box<dyn EntryVisitor>,
}

impl StackTraceInvertingVisitor {
    pub fn new(delegate: Box<dyn EntryVisitor>) -> Self {
        Self { delegate }
    }
}

impl EntryVisitor for StackTraceInvertingVisitor {
    fn visit(&mut self, entry: &Entry) {
        match entry {
            Entry::Frames(e) => {
                let mut out = e.clone();
                out.frames.reverse();
                self.delegate.visit(&Entry::Frames(out));
            }
            _ => self.delegate.visit(entry),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.delegate.finish()
    }
}
