//! Entry encoding pipeline.
//!
//! Entries drained from the ring buffer flow through an ordered chain of
//! stream-transforming stages into the compressed trace file. Each stage
//! owns its delegate (the next stage toward the file); the emission stage is
//! constructed first and is the only stage that touches the file handle.
//! A stage that does not recognize an entry variant passes it through
//! unchanged.

mod delta_encoding;
mod lifecycle;
mod print;
mod stack_inverting;
mod timestamp_truncating;
mod trace_loop;

pub use delta_encoding::DeltaEncodingVisitor;
pub use lifecycle::{
    encode_trace_id, sanitize, AbortReason, TraceCallbacks, TraceLifecycleVisitor,
    TraceSetupError, TIMESTAMP_PRECISION, TRACE_FORMAT_VERSION,
};
pub use print::PrintEntryVisitor;
pub use stack_inverting::StackTraceInvertingVisitor;
pub use timestamp_truncating::TimestampTruncatingVisitor;
pub use trace_loop::TraceWriter;

use crate::trace::entries::Entry;
use std::io;

/// One stage of the encoding chain.
///
/// Stages may be stateful across calls within one trace; the chain is
/// rebuilt on every trace start and torn down on every terminal transition,
/// so no state leaks between traces.
pub trait EntryVisitor: Send {
    fn visit(&mut self, entry: &Entry);

    /// Flush and finalize any owned output. Wrapper stages forward to their
    /// delegate; the emission stage finishes the compressed stream.
    fn finish(&mut self) -> io::Result<()>;
}

/// Assemble the standard chain around an output stream, innermost first:
/// print (emission) ← delta ← timestamp truncation ← stack inversion.
/// Entries enter at the stack-inversion stage, so the output time for each
/// entry is `truncate(current) - truncate(previous)`.
pub fn build_chain<W>(output: W) -> Box<dyn EntryVisitor>
where
    W: io::Write + Send + 'static,
{
    let print = PrintEntryVisitor::new(output);
    let delta = DeltaEncodingVisitor::new(Box::new(print));
    let truncating = TimestampTruncatingVisitor::new(Box::new(delta), TIMESTAMP_PRECISION);
    Box::new(StackTraceInvertingVisitor::new(Box::new(truncating)))
}
