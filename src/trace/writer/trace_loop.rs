//! Drain loop: moves packed entries from the ring buffer into the
//! lifecycle visitor on a dedicated thread.

use crate::trace::format::{self, MAX_PACKET_SIZE};
use crate::trace::ring_buffer::{Cursor, ReadResult, RingBuffer};
use crate::trace::writer::{AbortReason, TraceLifecycleVisitor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// How long the loop sleeps when it catches up with producers.
const IDLE_BACKOFF: Duration = Duration::from_micros(500);

/// One trace session's consumer. The visitor sits behind a mutex so the
/// control surface can abort the session from another thread while the
/// loop is mid-drain.
#[derive(Clone)]
pub struct TraceWriter {
    buffer: Arc<RingBuffer>,
    visitor: Arc<Mutex<TraceLifecycleVisitor>>,
    stop: Arc<AtomicBool>,
}

impl TraceWriter {
    pub fn new(buffer: Arc<RingBuffer>, visitor: TraceLifecycleVisitor) -> Self {
        Self {
            buffer,
            visitor: Arc::new(Mutex::new(visitor)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn visitor(&self) -> &Arc<Mutex<TraceLifecycleVisitor>> {
        &self.visitor
    }

    /// Ask the loop to wind down even if no terminal entry arrives. The
    /// open session, if any, is aborted so the file is finalized.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Drain from `cursor` until the session reaches a terminal state or a
    /// stop is requested. Regions overwritten before we got to them are
    /// skipped and counted; they never kill the session.
    pub fn loop_from(&self, cursor: Cursor) {
        let mut cursor = cursor;
        let mut lost_regions: u64 = 0;
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            match self.buffer.read_into(cursor, &mut buf) {
                ReadResult::Payload(n) => {
                    match format::unpack(&buf[..n]) {
                        Ok(entry) => {
                            let mut visitor = self.visitor.lock().unwrap();
                            if let Err(err) = visitor.visit(&entry) {
                                warn!(%err, "trace setup failed, session stays idle");
                            }
                            if visitor.is_done() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "undecodable packet skipped");
                        }
                    }
                    cursor = cursor.next();
                }
                ReadResult::Lost => {
                    lost_regions += 1;
                    let oldest = self.buffer.oldest();
                    warn!(
                        from = cursor.ticket(),
                        to = oldest.ticket(),
                        "entries overwritten before drain, skipping to oldest"
                    );
                    cursor = oldest;
                }
                ReadResult::NotReady => {
                    // The stop flag is only honored once the drain has
                    // caught up, so a terminal entry appended before the
                    // stop request still gets processed. The re-read after
                    // the acquire load catches entries whose append raced
                    // the stop request.
                    if self.stop.load(Ordering::Acquire) {
                        if matches!(
                            self.buffer.read_into(cursor, &mut buf),
                            ReadResult::NotReady
                        ) {
                            let mut visitor = self.visitor.lock().unwrap();
                            if !visitor.is_done() {
                                visitor.abort(AbortReason::Unknown);
                            }
                            break;
                        }
                        continue;
                    }
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }
        }

        debug!(lost_regions, "trace drain loop finished");
    }
}
