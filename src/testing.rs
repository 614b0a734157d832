//! Test doubles shared by the unit tests.

use crate::job::{AbortCause, AbortError, Abortable, Job, JobId, OutputSink};
use crate::node::Workspace;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An in-memory `Write` whose contents stay inspectable after it is moved.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn sink(&self) -> OutputSink {
        Arc::new(Mutex::new(self.clone()))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct FakeAbortable {
    running: Arc<AtomicBool>,
    transitions: Arc<AtomicUsize>,
    causes: Arc<Mutex<Vec<AbortCause>>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl Abortable for FakeAbortable {
    fn request_abort(&self, cause: &AbortCause) -> Result<bool, AbortError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AbortError::Unsupported("fake executor refuses".to_string()));
        }
        if self.running.swap(false, Ordering::SeqCst) {
            self.transitions.fetch_add(1, Ordering::SeqCst);
            self.causes.lock().unwrap().push(cause.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// A scriptable job: liveness, log file and workspaces are set by the test.
pub struct FakeJob {
    id: JobId,
    running: Arc<AtomicBool>,
    liveness_checks: AtomicUsize,
    transitions: Arc<AtomicUsize>,
    causes: Arc<Mutex<Vec<AbortCause>>>,
    log_file: Mutex<Option<PathBuf>>,
    current_workspace: Mutex<Option<Workspace>>,
    assigned_workspace: Mutex<Option<Workspace>>,
    executor: Option<Arc<FakeAbortable>>,
    interrupt: Option<Arc<FakeAbortable>>,
}

impl FakeJob {
    /// A running job with a working executor.
    pub fn new(id: &str) -> Self {
        let mut job = Self {
            id: JobId::new(id),
            running: Arc::new(AtomicBool::new(true)),
            liveness_checks: AtomicUsize::new(0),
            transitions: Arc::new(AtomicUsize::new(0)),
            causes: Arc::new(Mutex::new(Vec::new())),
            log_file: Mutex::new(None),
            current_workspace: Mutex::new(None),
            assigned_workspace: Mutex::new(None),
            executor: None,
            interrupt: None,
        };
        job.executor = Some(job.abortable(false));
        job
    }

    fn abortable(&self, fail: bool) -> Arc<FakeAbortable> {
        Arc::new(FakeAbortable {
            running: Arc::clone(&self.running),
            transitions: Arc::clone(&self.transitions),
            causes: Arc::clone(&self.causes),
            attempts: AtomicUsize::new(0),
            fail,
        })
    }

    pub fn without_executor(mut self) -> Self {
        self.executor = None;
        self
    }

    pub fn with_failing_executor(mut self) -> Self {
        self.executor = Some(self.abortable(true));
        self
    }

    pub fn with_interrupt_handle(mut self) -> Self {
        self.interrupt = Some(self.abortable(false));
        self
    }

    pub fn with_log_file(self, path: impl Into<PathBuf>) -> Self {
        *self.log_file.lock().unwrap() = Some(path.into());
        self
    }

    pub fn with_workspace(self, ws: Workspace) -> Self {
        *self.current_workspace.lock().unwrap() = Some(ws);
        self
    }

    pub fn with_assigned_workspace(self, ws: Workspace) -> Self {
        *self.assigned_workspace.lock().unwrap() = Some(ws);
        self
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn liveness_checks(&self) -> usize {
        self.liveness_checks.load(Ordering::SeqCst)
    }

    /// Number of transitions to aborted.
    pub fn abort_count(&self) -> usize {
        self.transitions.load(Ordering::SeqCst)
    }

    pub fn causes(&self) -> Vec<AbortCause> {
        self.causes.lock().unwrap().clone()
    }

    pub fn executor_attempts(&self) -> usize {
        self.executor
            .as_ref()
            .map_or(0, |e| e.attempts.load(Ordering::SeqCst))
    }

    pub fn interrupt_attempts(&self) -> usize {
        self.interrupt
            .as_ref()
            .map_or(0, |e| e.attempts.load(Ordering::SeqCst))
    }
}

impl Job for FakeJob {
    fn id(&self) -> JobId {
        self.id.clone()
    }

    fn is_running(&self) -> bool {
        self.liveness_checks.fetch_add(1, Ordering::SeqCst);
        self.running.load(Ordering::SeqCst)
    }

    fn log_file(&self) -> Option<PathBuf> {
        self.log_file.lock().unwrap().clone()
    }

    fn current_workspace(&self) -> Option<Workspace> {
        self.current_workspace.lock().unwrap().clone()
    }

    fn assigned_workspace(&self) -> Option<Workspace> {
        self.assigned_workspace.lock().unwrap().clone()
    }

    fn executor(&self) -> Option<Arc<dyn Abortable>> {
        self.executor
            .clone()
            .map(|e| e as Arc<dyn Abortable>)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Abortable>> {
        self.interrupt
            .clone()
            .map(|e| e as Arc<dyn Abortable>)
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
