//! Trace lifecycle state machine.
//!
//! One `TraceLifecycleVisitor` exists per trace session. It sits in front of
//! the encoding chain and interprets control entries: a start entry for its
//! expected trace id opens the output file and builds the chain, terminal
//! entries tear the chain down and fire callbacks. Control entries carrying
//! a different trace id, and any entry arriving while no trace is open, are
//! dropped silently.

use crate::trace::entries::{Entry, EntryType};
use crate::trace::writer::{build_chain, EntryVisitor};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub const TRACE_FORMAT_VERSION: u32 = 1;
pub const TIMESTAMP_PRECISION: u32 = 6;

const TRACE_ID_STRING_LEN: usize = 11;
const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    Unknown,
    ControllerInitiated,
    Timeout,
    NewStart,
}

impl AbortReason {
    pub fn name(self) -> &'static str {
        match self {
            AbortReason::Unknown => "unknown",
            AbortReason::ControllerInitiated => "controller_initiated",
            AbortReason::Timeout => "timeout",
            AbortReason::NewStart => "new_start",
        }
    }
}

/// Session observers. Callbacks fire on the drain thread, after the file
/// state for the transition has been settled.
pub trait TraceCallbacks: Send + Sync {
    fn on_trace_start(&self, _trace_id: i64, _flags: i32, _path: &Path) {}
    fn on_trace_end(&self, _trace_id: i64) {}
    fn on_trace_abort(&self, _trace_id: i64, _reason: AbortReason) {}
}

/// Failure while materializing the trace output. Folder failures snapshot
/// ownership of the base folder and the process credentials, which is what
/// is needed to diagnose permission problems on shared storage.
#[derive(Debug, Error)]
pub enum TraceSetupError {
    #[error("trace id {0} is negative and cannot be encoded")]
    InvalidTraceId(i64),
    #[error("could not stat trace base folder {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "could not create trace folder {path}; base {base} has uid={uid} gid={gid}, \
         process euid={euid} egid={egid}: {source}"
    )]
    CreateFolder {
        path: PathBuf,
        base: PathBuf,
        uid: u32,
        gid: u32,
        euid: u32,
        egid: u32,
        #[source]
        source: io::Error,
    },
    #[error("could not create trace file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fixed-width base64 rendering of a trace id. Ids are non-negative, so
/// eleven digits cover the full i64 range.
pub fn encode_trace_id(trace_id: i64) -> Result<String, TraceSetupError> {
    if trace_id < 0 {
        return Err(TraceSetupError::InvalidTraceId(trace_id));
    }
    let mut out = [0u8; TRACE_ID_STRING_LEN];
    let mut rest = trace_id;
    for slot in out.iter_mut().rev() {
        *slot = BASE64_ALPHABET[(rest % 64) as usize];
        rest /= 64;
    }
    // Alphabet bytes are ASCII.
    Ok(String::from_utf8(out.to_vec()).unwrap())
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`. Applied to
/// every path component derived from external input.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn trace_filename(trace_prefix: &str, trace_id_string: &str) -> String {
    // SAFETY: getpid has no failure modes.
    let pid = unsafe { libc::getpid() };

    // SAFETY: localtime_r writes only into the provided tm and is the
    // thread-safe variant; a null return falls back to the epoch fields of
    // the zeroed tm rather than failing trace setup.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        libc::localtime_r(&now, &mut tm);
    }

    format!(
        "{}-{}-{}-{}-{}T{}-{}-{}-{}.tmp",
        trace_prefix,
        pid,
        1900 + tm.tm_year,
        1 + tm.tm_mon,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        trace_id_string
    )
}

/// Create `folder` if missing. A concurrent creation racing us is success.
fn ensure_folder(folder: &Path, base: &Path) -> Result<(), TraceSetupError> {
    match fs::create_dir_all(folder) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => {
            let meta = fs::metadata(base).map_err(|stat_err| TraceSetupError::Stat {
                path: base.to_path_buf(),
                source: stat_err,
            })?;
            // SAFETY: geteuid/getegid have no failure modes.
            let (euid, egid) = unsafe { (libc::geteuid(), libc::getegid()) };
            Err(TraceSetupError::CreateFolder {
                path: folder.to_path_buf(),
                base: base.to_path_buf(),
                uid: meta.uid(),
                gid: meta.gid(),
                euid,
                egid,
                source: err,
            })
        }
    }
}

pub struct TraceLifecycleVisitor {
    folder: PathBuf,
    trace_prefix: String,
    trace_headers: Vec<(String, String)>,
    expected_trace: i64,
    callbacks: Option<Arc<dyn TraceCallbacks>>,
    chain: Option<Box<dyn EntryVisitor>>,
    done: bool,
}

impl TraceLifecycleVisitor {
    pub fn new(
        folder: impl Into<PathBuf>,
        trace_prefix: impl Into<String>,
        trace_headers: Vec<(String, String)>,
        expected_trace: i64,
        callbacks: Option<Arc<dyn TraceCallbacks>>,
    ) -> Self {
        Self {
            folder: folder.into(),
            trace_prefix: trace_prefix.into(),
            trace_headers,
            expected_trace,
            callbacks,
            chain: None,
            done: false,
        }
    }

    /// True once a terminal transition has been observed; the session's
    /// drain loop uses this to know when to exit.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn expected_trace(&self) -> i64 {
        self.expected_trace
    }

    /// Feed one drained entry through the state machine. Only trace setup
    /// can fail; a setup failure leaves the visitor idle so a later start
    /// is not blocked.
    pub fn visit(&mut self, entry: &Entry) -> Result<(), TraceSetupError> {
        match entry {
            Entry::Standard(e) => match e.entry_type {
                EntryType::TraceEnd => {
                    if e.extra != self.expected_trace {
                        return Ok(());
                    }
                    // Emit the terminal entry before tearing down.
                    self.forward(entry);
                    self.on_trace_end(e.extra);
                    Ok(())
                }
                EntryType::TraceTimeout | EntryType::TraceAbort => {
                    if e.extra != self.expected_trace {
                        return Ok(());
                    }
                    let reason = if e.entry_type == EntryType::TraceTimeout {
                        AbortReason::Timeout
                    } else {
                        AbortReason::ControllerInitiated
                    };
                    self.forward(entry);
                    self.on_trace_abort(e.extra, reason);
                    Ok(())
                }
                EntryType::TraceStart | EntryType::TraceBackwards => {
                    self.on_trace_start(e.extra, e.matchid)?;
                    self.forward(entry);
                    Ok(())
                }
                _ => {
                    self.forward(entry);
                    Ok(())
                }
            },
            _ => {
                self.forward(entry);
                Ok(())
            }
        }
    }

    /// Abort the session from outside the entry stream, e.g. when the
    /// control surface is torn down with a trace still open.
    pub fn abort(&mut self, reason: AbortReason) {
        self.on_trace_abort(self.expected_trace, reason);
    }

    fn forward(&mut self, entry: &Entry) {
        if let Some(chain) = self.chain.as_mut() {
            chain.visit(entry);
        }
    }

    fn on_trace_start(&mut self, trace_id: i64, flags: i32) -> Result<(), TraceSetupError> {
        if trace_id != self.expected_trace {
            return Ok(());
        }
        if self.chain.is_some() {
            // A second start for an already-open trace is anomalous;
            // treat it as a restart request and bail out of this session.
            self.abort(AbortReason::NewStart);
            return Ok(());
        }

        let trace_id_string = encode_trace_id(trace_id)?;
        let trace_folder = self.folder.join(sanitize(&trace_id_string));
        ensure_folder(&trace_folder, &self.folder)?;

        let trace_file =
            trace_folder.join(sanitize(&trace_filename(&self.trace_prefix, &trace_id_string)));
        let file = File::create(&trace_file).map_err(|err| TraceSetupError::CreateFile {
            path: trace_file.clone(),
            source: err,
        })?;

        let mut output = GzEncoder::new(BufWriter::new(file), Compression::default());
        self.write_headers(&mut output, &trace_id_string)
            .map_err(|err| TraceSetupError::CreateFile {
                path: trace_file.clone(),
                source: err,
            })?;

        self.chain = Some(build_chain(output));

        if let Some(callbacks) = &self.callbacks {
            callbacks.on_trace_start(trace_id, flags, &trace_file);
        }
        self.done = false;
        Ok(())
    }

    fn on_trace_end(&mut self, trace_id: i64) {
        self.done = true;
        self.cleanup_state();
        if let Some(callbacks) = &self.callbacks {
            callbacks.on_trace_end(trace_id);
        }
    }

    fn on_trace_abort(&mut self, trace_id: i64, reason: AbortReason) {
        self.done = true;
        self.cleanup_state();
        if let Some(callbacks) = &self.callbacks {
            callbacks.on_trace_abort(trace_id, reason);
        }
    }

    fn cleanup_state(&mut self) {
        if let Some(mut chain) = self.chain.take() {
            if let Err(err) = chain.finish() {
                warn!(%err, trace_id = self.expected_trace, "trace output finalize failed");
            }
            // Dropping the chain drops the gzip encoder, which writes the
            // stream trailer.
        }
    }

    fn write_headers<W: Write>(&self, output: &mut W, id: &str) -> io::Result<()> {
        write!(
            output,
            "dt\nver|{TRACE_FORMAT_VERSION}\nid|{id}\nprec|{TIMESTAMP_PRECISION}\n"
        )?;
        for (key, value) in &self.trace_headers {
            writeln!(output, "{key}|{value}")?;
        }
        output.write_all(b"\n")
    }
}

impl Drop for TraceLifecycleVisitor {
    fn drop(&mut self) {
        if self.chain.is_some() {
            self.abort(AbortReason::Unknown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::entries::StandardEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingCallbacks {
        starts: AtomicUsize,
        ends: AtomicUsize,
        aborts: Mutex<Vec<AbortReason>>,
        paths: Mutex<Vec<PathBuf>>,
    }

    impl TraceCallbacks for RecordingCallbacks {
        fn on_trace_start(&self, _trace_id: i64, _flags: i32, path: &Path) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.paths.lock().unwrap().push(path.to_path_buf());
        }
        fn on_trace_end(&self, _trace_id: i64) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
        fn on_trace_abort(&self, _trace_id: i64, reason: AbortReason) {
            self.aborts.lock().unwrap().push(reason);
        }
    }

    fn control(entry_type: EntryType, trace_id: i64) -> Entry {
        Entry::Standard(StandardEntry {
            id: 1,
            entry_type,
            timestamp: 100,
            tid: 1,
            extra: trace_id,
            ..Default::default()
        })
    }

    fn visitor(
        dir: &TempDir,
        trace_id: i64,
        callbacks: Arc<RecordingCallbacks>,
    ) -> TraceLifecycleVisitor {
        TraceLifecycleVisitor::new(dir.path(), "trace", Vec::new(), trace_id, Some(callbacks))
    }

    #[test]
    fn test_encode_trace_id_fixed_width() {
        assert_eq!(encode_trace_id(0).unwrap(), "AAAAAAAAAAA");
        assert_eq!(encode_trace_id(1).unwrap(), "AAAAAAAAAAB");
        assert_eq!(encode_trace_id(64).unwrap(), "AAAAAAAAABA");
        assert_eq!(encode_trace_id(i64::MAX).unwrap().len(), 11);
        assert!(encode_trace_id(-1).is_err());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a+b/c d.e-f_g"), "a_b_c_d.e-f_g");
        assert_eq!(sanitize("AZaz09"), "AZaz09");
    }

    #[test]
    fn test_start_creates_file_and_fires_callback() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut v = visitor(&dir, 5, callbacks.clone());

        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        assert_eq!(callbacks.starts.load(Ordering::SeqCst), 1);
        assert!(!v.is_done());

        let path = callbacks.paths.lock().unwrap()[0].clone();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("trace-"));
        assert!(name.ends_with(".tmp"));
        assert!(path
            .parent()
            .unwrap()
            .ends_with(encode_trace_id(5).unwrap()));
    }

    #[test]
    fn test_end_for_expected_trace_finishes_session() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut v = visitor(&dir, 5, callbacks.clone());

        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        v.visit(&control(EntryType::TraceEnd, 5)).unwrap();
        assert!(v.is_done());
        assert_eq!(callbacks.ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mismatched_control_ids_ignored() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut v = visitor(&dir, 5, callbacks.clone());

        v.visit(&control(EntryType::TraceStart, 9)).unwrap();
        assert_eq!(callbacks.starts.load(Ordering::SeqCst), 0);

        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        v.visit(&control(EntryType::TraceEnd, 9)).unwrap();
        v.visit(&control(EntryType::TraceAbort, 9)).unwrap();
        assert!(!v.is_done());
        assert_eq!(callbacks.ends.load(Ordering::SeqCst), 0);
        assert!(callbacks.aborts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_start_aborts_with_new_start() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut v = visitor(&dir, 5, callbacks.clone());

        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        assert!(v.is_done());
        assert_eq!(
            callbacks.aborts.lock().unwrap().as_slice(),
            &[AbortReason::NewStart]
        );
    }

    #[test]
    fn test_timeout_aborts_with_timeout_reason() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut v = visitor(&dir, 5, callbacks.clone());

        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        v.visit(&control(EntryType::TraceTimeout, 5)).unwrap();
        assert!(v.is_done());
        assert_eq!(
            callbacks.aborts.lock().unwrap().as_slice(),
            &[AbortReason::Timeout]
        );
    }

    #[test]
    fn test_entries_while_idle_dropped() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut v = visitor(&dir, 5, callbacks.clone());

        // No start yet: nothing to write to, nothing happens.
        v.visit(&Entry::Standard(StandardEntry {
            entry_type: EntryType::Mark,
            ..Default::default()
        }))
        .unwrap();
        assert!(!v.is_done());
        assert!(dir.path().read_dir().unwrap().next().is_none());
    }

    #[test]
    fn test_existing_trace_folder_is_fine() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        fs::create_dir(dir.path().join(encode_trace_id(5).unwrap())).unwrap();

        let mut v = visitor(&dir, 5, callbacks.clone());
        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        assert_eq!(callbacks.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_external_abort() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut v = visitor(&dir, 5, callbacks.clone());

        v.visit(&control(EntryType::TraceStart, 5)).unwrap();
        v.abort(AbortReason::ControllerInitiated);
        assert!(v.is_done());
        assert_eq!(
            callbacks.aborts.lock().unwrap().as_slice(),
            &[AbortReason::ControllerInitiated]
        );
    }
}
