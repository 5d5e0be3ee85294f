use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::watch;

use crate::utils::error::Result;

/// Counts live solver processes and scratch directories.
///
/// Every acquisition hands out a guard that decrements on drop, so the counters return to
/// zero on every exit path.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    processes: Arc<AtomicUsize>,
    work_dirs: Arc<AtomicUsize>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_processes(&self) -> usize {
        self.processes.load(Ordering::SeqCst)
    }

    pub fn live_work_dirs(&self) -> usize {
        self.work_dirs.load(Ordering::SeqCst)
    }

    pub fn is_clean(&self) -> bool {
        self.live_processes() == 0 && self.live_work_dirs() == 0
    }

    pub fn track_process(&self, pid: Option<u32>) -> ProcessGuard {
        self.processes.fetch_add(1, Ordering::SeqCst);
        ProcessGuard {
            counter: Arc::clone(&self.processes),
            pid,
        }
    }

    fn track_work_dir(&self) -> Arc<AtomicUsize> {
        self.work_dirs.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&self.work_dirs)
    }
}

#[derive(Debug)]
pub struct ProcessGuard {
    counter: Arc<AtomicUsize>,
    pid: Option<u32>,
}

impl ProcessGuard {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scratch directory removed when dropped.
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
    counter: Arc<AtomicUsize>,
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a solver run may touch outside the process: scratch space, tool locations
/// and environment.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: String,
    root: TempDir,
    executables: BTreeMap<String, PathBuf>,
    env: BTreeMap<String, String>,
    ledger: ResourceLedger,
}

impl ExecutionContext {
    /// Creates the context root inside `base`, or the system temp dir.
    pub fn init(run_id: impl Into<String>, base: Option<&Path>) -> Result<Self> {
        let run_id = run_id.into();
        let mut builder = tempfile::Builder::new();
        builder.prefix(&run_id);
        let root = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!("Execution context '{}' at {}", run_id, root.path().display());
        Ok(Self {
            run_id,
            root,
            executables: BTreeMap::new(),
            env: BTreeMap::new(),
            ledger: ResourceLedger::new(),
        })
    }

    pub fn with_executable(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.executables.insert(name.into(), path.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_ledger(mut self, ledger: ResourceLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Configured location of a tool, or the bare name for a `PATH` lookup.
    pub fn resolve_executable(&self, name: &str) -> PathBuf {
        self.executables
            .get(name)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn scratch_dir(&self, label: &str) -> Result<WorkDir> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_", label))
            .tempdir_in(self.root.path())?;
        Ok(WorkDir {
            dir,
            counter: self.ledger.track_work_dir(),
        })
    }

    /// Removes the context root. Anything still tracked by the ledger at this point leaked.
    pub fn teardown(self) -> Result<()> {
        if !self.ledger.is_clean() {
            tracing::warn!(
                "⚠️ Context '{}' torn down with {} live processes and {} work dirs",
                self.run_id,
                self.ledger.live_processes(),
                self.ledger.live_work_dirs()
            );
        }
        self.root.close()?;
        Ok(())
    }
}

/// Sending half of a cancellation channel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_scratch_dirs_are_tracked_and_removed() {
        let ctx = ExecutionContext::init("ctx_test", None).unwrap();
        let path = {
            let dir = ctx.scratch_dir("solver").unwrap();
            assert_eq!(ctx.ledger().live_work_dirs(), 1);
            assert!(dir.path().starts_with(ctx.root()));
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(ctx.ledger().is_clean());
        ctx.teardown().unwrap();
    }

    #[test]
    fn test_process_guard_releases_on_drop() {
        let ledger = ResourceLedger::new();
        let guard = ledger.track_process(Some(42));
        assert_eq!(guard.pid(), Some(42));
        assert_eq!(ledger.live_processes(), 1);
        drop(guard);
        assert!(ledger.is_clean());
    }

    #[test]
    fn test_resolve_executable_falls_back_to_name() {
        let ctx = ExecutionContext::init("ctx_exe", None)
            .unwrap()
            .with_executable("openems", "/opt/openems/bin/openEMS");
        assert_eq!(ctx.resolve_executable("openems"), PathBuf::from("/opt/openems/bin/openEMS"));
        assert_eq!(ctx.resolve_executable("python3"), PathBuf::from("python3"));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let (handle, signal) = cancellation();
        assert!(!signal.is_cancelled());
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let signal = CancelSignal::never();
        let outcome = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(outcome.is_err());
    }
}
