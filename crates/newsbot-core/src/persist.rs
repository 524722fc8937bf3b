//! Debounced persistence shared by the subscription and role-config stores.
//!
//! A mutation marks its store dirty and calls [`DebouncedFlush::schedule`].
//! Any pending deferred flush is cancelled and a fresh one is spawned, so a
//! burst of mutations ends up as a single write once the store has been quiet
//! for the configured delay.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Something that can write its in-memory state to disk.
#[async_trait]
pub trait Flush: Send + Sync + 'static {
    /// Persist if dirty. Errors are reported to the caller, who decides
    /// whether to log or propagate.
    async fn flush(&self) -> Result<()>;

    /// Short name used in log lines.
    fn label(&self) -> &'static str;
}

struct PendingFlush {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns at most one pending deferred flush.
pub struct DebouncedFlush {
    delay: Duration,
    pending: Mutex<Option<PendingFlush>>,
}

impl DebouncedFlush {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancel the pending flush (if any) and schedule a new one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F: Flush>(&self, target: Arc<F>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            tokio::select! {
              _ = token.cancelled() => {}
              _ = sleep(delay) => {
                if let Err(e) = target.flush().await {
                  tracing::warn!("[{}] deferred flush failed, will retry on next change: {e}", target.label());
                }
              }
            }
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(PendingFlush { cancel, handle });
        if let Some(prev) = previous {
            prev.cancel.cancel();
        }
    }

    /// Cancel the pending flush without writing. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match pending {
            Some(p) => {
                let was_running = !p.handle.is_finished();
                p.cancel.cancel();
                was_running
            }
            None => false,
        }
    }
}

impl Drop for DebouncedFlush {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so a
/// crash mid-write leaves the previous file intact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read a JSON store file. Missing, empty or corrupt files yield `None` (the
/// store then starts empty); corruption is logged.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path, label: &str) -> Option<T> {
    let txt = match std::fs::read_to_string(path) {
        Ok(txt) => txt,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::error!("[{label}] cannot read {}: {e}; starting empty", path.display());
            return None;
        }
    };
    if txt.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&txt) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::error!("[{label}] {} is corrupt: {e}; starting empty", path.display());
            None
        }
    }
}

#[cfg(test)]
pub(crate) fn tmp_file(prefix: &str) -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static SEQ: AtomicUsize = AtomicUsize::new(0);

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    let pid = std::process::id();
    let seq = SEQ.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("{prefix}-{pid}-{ts}-{seq}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTarget {
        flushes: AtomicUsize,
    }

    #[async_trait]
    impl Flush for CountingTarget {
        async fn flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn label(&self) -> &'static str {
            "test"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_schedules_flushes_once() {
        let target = Arc::new(CountingTarget::default());
        let debounce = DebouncedFlush::new(Duration::from_millis(1500));

        for _ in 0..5 {
            debounce.schedule(target.clone());
            sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(target.flushes.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_flush() {
        let target = Arc::new(CountingTarget::default());
        let debounce = DebouncedFlush::new(Duration::from_millis(100));

        debounce.schedule(target.clone());
        assert!(debounce.cancel());
        sleep(Duration::from_millis(500)).await;
        assert_eq!(target.flushes.load(Ordering::SeqCst), 0);
        assert!(!debounce.cancel());
    }

    #[test]
    fn atomic_write_replaces_file() {
        let path = tmp_file("newsbot-atomic");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!tmp_sibling(&path).exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_json_reads_as_none() {
        let path = tmp_file("newsbot-corrupt");
        std::fs::write(&path, "{ not json").unwrap();
        let v: Option<serde_json::Value> = read_json(&path, "test");
        assert!(v.is_none());
        let _ = std::fs::remove_file(&path);
    }
}
