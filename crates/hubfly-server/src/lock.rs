//! Advisory file locks shared with every hubfly process on the host
//!
//! A CLI invocation and a running `reconcile --watch` each build their own
//! control plane over the same directories. In-process mutexes only order
//! the callers inside one of them; these locks order all of them.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// An open lock file holding an exclusive lock until dropped
#[derive(Debug)]
pub struct ExclusiveFile {
    file: File,
}

impl ExclusiveFile {
    /// Block the calling thread until the lock is ours
    pub fn acquire_blocking(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    /// Wait for the lock on the blocking pool
    pub async fn acquire(path: PathBuf) -> io::Result<Self> {
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&path))
            .await
            .map_err(io::Error::other)?
    }
}

impl Drop for ExclusiveFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock file: {}", e);
        }
    }
}

#[derive(Default)]
struct Held {
    file: Option<ExclusiveFile>,
    depth: usize,
}

/// Reentrant lock over a lock file, for short synchronous critical sections
///
/// A thread already holding the lock may take it again, so a store write
/// inside an admission check does not wait on itself.
pub struct RecordLock {
    path: PathBuf,
    held: ReentrantMutex<RefCell<Held>>,
}

pub struct RecordLockGuard<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<Held>>,
}

impl RecordLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: ReentrantMutex::new(RefCell::new(Held::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> io::Result<RecordLockGuard<'_>> {
        let guard = self.held.lock();
        {
            let mut held = guard.borrow_mut();
            if held.depth == 0 {
                held.file = Some(ExclusiveFile::acquire_blocking(&self.path)?);
            }
            held.depth += 1;
        }
        Ok(RecordLockGuard { guard })
    }
}

impl Drop for RecordLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.guard.borrow_mut();
        held.depth -= 1;
        if held.depth == 0 {
            held.file = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_lock_is_reentrant_on_one_thread() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RecordLock::new(dir.path().join(".lock"));

        let outer = lock.lock().unwrap();
        let inner = lock.lock().unwrap();
        drop(inner);
        drop(outer);

        // released: a separate handle on the same file gets it at once
        let other = ExclusiveFile::acquire_blocking(lock.path()).unwrap();
        drop(other);
    }

    #[test]
    fn test_separate_handles_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(".lock");
        // two handles stand in for two processes
        let first = RecordLock::new(&path);
        let second = Arc::new(RecordLock::new(&path));
        let released = Arc::new(AtomicBool::new(false));

        let guard = first.lock().unwrap();
        let waiter = {
            let second = Arc::clone(&second);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let _guard = second.lock().unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        released.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(waiter.join().unwrap(), "second holder got in while the first held the lock");
    }

    #[tokio::test]
    async fn test_async_acquire_waits_for_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".apply.lock");
        let held = ExclusiveFile::acquire(path.clone()).await.unwrap();

        let pending = tokio::spawn(ExclusiveFile::acquire(path));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        drop(held);
        pending.await.unwrap().unwrap();
    }
}
