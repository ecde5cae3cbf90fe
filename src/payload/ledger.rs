//! Ledger of temporary directories created during a run.

use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::TempDir;
use tracing::{debug, warn};

/// Owns every temporary directory a run creates and releases them together.
///
/// Directories are appended as they are created and drained by
/// [`cleanup`](TempLedger::cleanup). Dropping the ledger cleans up whatever
/// is still registered.
#[derive(Debug, Default)]
pub struct TempLedger {
    dirs: Mutex<Vec<TempDir>>,
    keep: bool,
}

impl TempLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger that leaves directories on disk for inspection.
    pub fn keeping() -> Self {
        Self {
            dirs: Mutex::new(Vec::new()),
            keep: true,
        }
    }

    /// Creates and registers a new temporary directory.
    pub fn create(&self, prefix: &str) -> std::io::Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        Ok(self.register(dir))
    }

    /// Takes ownership of `dir` and returns its path.
    pub fn register(&self, dir: TempDir) -> PathBuf {
        let path = dir.path().to_path_buf();
        self.lock().push(dir);
        path
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every registered directory. Returns how many were released.
    pub fn cleanup(&self) -> usize {
        let drained: Vec<TempDir> = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for dir in drained {
            if self.keep {
                let path = dir.keep();
                debug!("Keeping temporary directory {}", path.display());
                continue;
            }
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove temporary directory {}: {}", path.display(), e);
            }
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TempDir>> {
        self.dirs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TempLedger {
    fn drop(&mut self) {
        let remaining = self.cleanup();
        if remaining > 0 {
            debug!("Released {} temporary directories on drop", remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_removes_directories() {
        let ledger = TempLedger::new();
        let a = ledger.create("ledger_test_").unwrap();
        let b = ledger.create("ledger_test_").unwrap();
        assert!(a.exists() && b.exists());
        assert_eq!(ledger.len(), 2);

        assert_eq!(ledger.cleanup(), 2);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(ledger.is_empty());
        assert_eq!(ledger.cleanup(), 0);
    }

    #[test]
    fn test_drop_releases_directories() {
        let path = {
            let ledger = TempLedger::new();
            ledger.create("ledger_drop_").unwrap()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_keeping_ledger_leaves_directories() {
        let ledger = TempLedger::keeping();
        let path = ledger.create("ledger_keep_").unwrap();
        ledger.cleanup();
        assert!(path.exists());
        std::fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn test_concurrent_registration() {
        let ledger = std::sync::Arc::new(TempLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = std::sync::Arc::clone(&ledger);
                std::thread::spawn(move || ledger.create("ledger_conc_").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.len(), 8);
        assert_eq!(ledger.cleanup(), 8);
    }
}
