//! Advisory per-path read/write locks.
//!
//! Loads hold a read lock and saves a write lock on the file path for the
//! whole operation, so concurrent access to one file from several worker
//! threads is ordered. The locks are process-local; nothing is taken at
//! the file-system level.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

type PathLock = Arc<RwLock<()>>;

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, PathLock>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, PathLock>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

// A save target may not exist yet, so fall back to the canonical parent.
fn key_for(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

fn acquire(path: &Path) -> (PathBuf, PathLock) {
    let key = key_for(path);
    let lock = registry()
        .lock()
        .entry(key.clone())
        .or_insert_with(|| Arc::new(RwLock::new(())))
        .clone();
    (key, lock)
}

/// Drop the registry entry once no locker references it any more.
fn release(key: &Path) {
    let mut map = registry().lock();
    if let Some(lock) = map.get(key) {
        // Only the registry itself still holds it.
        if Arc::strong_count(lock) == 1 {
            map.remove(key);
        }
    }
}

/// Number of paths with a live lock entry.
pub fn active_lock_count() -> usize {
    registry().lock().len()
}

/// Shared lock on a path, released on drop.
pub struct FileReadLocker {
    key: PathBuf,
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
}

impl FileReadLocker {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let (key, lock) = acquire(path.as_ref());
        let guard = lock.read_arc();
        Self {
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for FileReadLocker {
    fn drop(&mut self) {
        self.guard.take();
        release(&self.key);
    }
}

/// Exclusive lock on a path, released on drop.
pub struct FileWriteLocker {
    key: PathBuf,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
}

impl FileWriteLocker {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let (key, lock) = acquire(path.as_ref());
        let guard = lock.write_arc();
        Self {
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for FileWriteLocker {
    fn drop(&mut self) {
        self.guard.take();
        release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    #[serial]
    fn test_readers_share_and_entry_is_pruned() {
        let path = Path::new("/nonexistent/dimg-lock-test-a.png");
        {
            let _a = FileReadLocker::new(path);
            let _b = FileReadLocker::new(path);
            assert!(registry().lock().contains_key(&key_for(path)));
        }
        assert!(!registry().lock().contains_key(&key_for(path)));
    }

    #[test]
    #[serial]
    fn test_writer_excludes_reader() {
        let path = PathBuf::from("/nonexistent/dimg-lock-test-b.png");
        let writer = FileWriteLocker::new(&path);
        let acquired = Arc::new(AtomicBool::new(false));

        let flag = acquired.clone();
        let reader_path = path.clone();
        let handle = std::thread::spawn(move || {
            let _r = FileReadLocker::new(&reader_path);
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(writer);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
