//! Process-scoped control surface.
//!
//! `TraceEngine` ties the pieces together: it owns the shared `Logger`,
//! starts one drain thread per trace session, and turns control requests
//! into control entries in the stream. It is constructed explicitly and
//! passed around; there is no process-global instance.

use crate::trace::config::UploadConfig;
use crate::trace::entries::{current_tid, monotonic_time_nanos, EntryType, StandardEntry};
use crate::trace::logger::Logger;
use crate::trace::ring_buffer::{RingBuffer, DEFAULT_CAPACITY};
use crate::trace::writer::{TraceCallbacks, TraceLifecycleVisitor, TraceWriter};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub buffer_capacity: usize,
    pub folder: PathBuf,
    pub trace_prefix: String,
    /// Extra `key|value` lines for the trace file header.
    pub trace_headers: Vec<(String, String)>,
    pub upload: UploadConfig,
}

impl EngineConfig {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            folder: folder.into(),
            trace_prefix: "trace".to_string(),
            trace_headers: Vec::new(),
            upload: UploadConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a trace session is already active (trace id {0})")]
    SessionActive(i64),
    #[error("no active trace session for trace id {0}")]
    NoSuchSession(i64),
    #[error("could not spawn trace writer thread: {0}")]
    Spawn(#[source] io::Error),
}

struct Session {
    trace_id: i64,
    writer: TraceWriter,
    thread: thread::JoinHandle<()>,
}

pub struct TraceEngine {
    logger: Arc<Logger>,
    config: EngineConfig,
    callbacks: Option<Arc<dyn TraceCallbacks>>,
    session: Option<Session>,
}

impl TraceEngine {
    pub fn new(config: EngineConfig, callbacks: Option<Arc<dyn TraceCallbacks>>) -> Self {
        let buffer = Arc::new(RingBuffer::with_capacity(config.buffer_capacity));
        Self {
            logger: Arc::new(Logger::new(buffer)),
            config,
            callbacks,
            session: None,
        }
    }

    /// Shared producer handle. Cheap to clone, safe to hand to any thread.
    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn upload_config(&self) -> &UploadConfig {
        &self.config.upload
    }

    /// Begin a trace session: logs the start entry and spawns a drain
    /// thread that consumes the stream from exactly that entry.
    pub fn start_trace(&mut self, trace_id: i64, flags: i32) -> Result<(), EngineError> {
        if let Some(session) = &self.session {
            if !session.thread.is_finished() {
                return Err(EngineError::SessionActive(session.trace_id));
            }
            // Previous session already terminated on its own; reap it.
            self.reap_session();
        }

        let visitor = TraceLifecycleVisitor::new(
            self.config.folder.clone(),
            self.config.trace_prefix.clone(),
            self.config.trace_headers.clone(),
            trace_id,
            self.callbacks.clone(),
        );
        let writer = TraceWriter::new(self.logger.buffer().clone(), visitor);

        let (_, cursor) = self
            .logger
            .write_and_get_cursor(control_entry(EntryType::TraceStart, trace_id, flags));

        let thread = thread::Builder::new()
            .name("trace-writer".to_string())
            .spawn({
                let writer = writer.clone();
                move || writer.loop_from(cursor)
            })
            .map_err(EngineError::Spawn)?;

        debug!(trace_id, "trace session started");
        self.session = Some(Session {
            trace_id,
            writer,
            thread,
        });
        Ok(())
    }

    /// End the session normally. The end entry flows through the stream so
    /// every entry logged before this call makes it into the file.
    pub fn stop_trace(&mut self, trace_id: i64) -> Result<(), EngineError> {
        self.finish_session(trace_id, EntryType::TraceEnd)
    }

    pub fn abort_trace(&mut self, trace_id: i64) -> Result<(), EngineError> {
        self.finish_session(trace_id, EntryType::TraceAbort)
    }

    pub fn timeout_trace(&mut self, trace_id: i64) -> Result<(), EngineError> {
        self.finish_session(trace_id, EntryType::TraceTimeout)
    }

    fn finish_session(&mut self, trace_id: i64, entry_type: EntryType) -> Result<(), EngineError> {
        match &self.session {
            Some(session) if session.trace_id == trace_id => {}
            _ => return Err(EngineError::NoSuchSession(trace_id)),
        }
        self.logger.write(control_entry(entry_type, trace_id, 0));
        self.reap_session();
        debug!(trace_id, ?entry_type, "trace session finished");
        Ok(())
    }

    fn reap_session(&mut self) {
        if let Some(session) = self.session.take() {
            // The terminal entry already in the stream ends the loop; the
            // stop flag covers sessions that never opened successfully.
            session.writer.request_stop();
            let _ = session.thread.join();
        }
    }
}

impl Drop for TraceEngine {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            self.logger
                .write(control_entry(EntryType::TraceAbort, session.trace_id, 0));
        }
        self.reap_session();
    }
}

fn control_entry(entry_type: EntryType, trace_id: i64, flags: i32) -> StandardEntry {
    StandardEntry {
        id: 0,
        entry_type,
        timestamp: monotonic_time_nanos(),
        tid: current_tid(),
        callid: 0,
        matchid: flags,
        extra: trace_id,
    }
}
