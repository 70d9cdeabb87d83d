//! A bounded pool of [`Controller`]s. `fuser::Filesystem` calls are synchronous and can arrive
//! from several kernel threads at once; this hands each call exclusive use of one controller
//! and blocks callers once the pool is exhausted, the same way the thing it's grounded on uses
//! a condition variable rather than an async runtime.

use std::sync::{Condvar, Mutex};

use crate::controller::Controller;
use crate::source::Source;

/// Default number of controllers (and therefore concurrent remote connections) a pool holds.
pub const DEFAULT_POOL_SIZE: usize = 4;

struct Inner<S: Source> {
    idle: Vec<Controller<S>>,
    outstanding: usize,
    closed: bool,
}

/// Hands out exclusive, blocking access to one of a fixed set of [`Controller`]s.
pub struct ControllerPool<S: Source> {
    state: Mutex<Inner<S>>,
    available: Condvar,
    capacity: usize,
}

/// An acquired controller. Returns itself to the pool when dropped.
pub struct Lease<'p, S: Source> {
    pool: &'p ControllerPool<S>,
    controller: Option<Controller<S>>,
}

impl<S: Source> ControllerPool<S> {
    /// Build a pool that starts empty and grows lazily up to `capacity`, minting a fresh
    /// controller via `factory` whenever a lease is requested and none are idle.
    pub fn new(capacity: usize) -> Self {
        ControllerPool {
            state: Mutex::new(Inner { idle: Vec::new(), outstanding: 0, closed: false }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Seed the pool with an already-constructed controller (used for the first acquire, which
    /// needs the bootstrap-time source URI check to have already run).
    pub fn seed(&self, controller: Controller<S>) {
        let mut state = self.state.lock().unwrap();
        state.idle.push(controller);
    }

    /// Block until a controller is available, constructing one with `factory` if the pool has
    /// spare capacity and none are idle.
    pub fn acquire<F>(&self, factory: F) -> crate::error::Result<Lease<'_, S>>
    where
        F: FnOnce() -> crate::error::Result<Controller<S>>,
    {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(controller) = state.idle.pop() {
                state.outstanding += 1;
                return Ok(Lease { pool: self, controller: Some(controller) });
            }
            if state.outstanding < self.capacity {
                state.outstanding += 1;
                drop(state);
                return match factory() {
                    Ok(controller) => Ok(Lease { pool: self, controller: Some(controller) }),
                    Err(err) => {
                        let mut state = self.state.lock().unwrap();
                        state.outstanding -= 1;
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }
            state = self.available.wait(state).unwrap();
        }
    }

    fn release(&self, controller: Controller<S>) {
        let mut state = self.state.lock().unwrap();
        state.outstanding -= 1;
        if state.closed {
            drop(state);
            let _ = controller.close();
        } else {
            state.idle.push(controller);
            drop(state);
        }
        self.available.notify_one();
    }

    /// Block until every outstanding instance is back, mark the pool closed so any controller
    /// released later is closed immediately instead of being recycled, then close each idle
    /// controller.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        while state.outstanding > 0 {
            state = self.available.wait(state).unwrap();
        }
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        drop(state);
        for controller in idle {
            if let Err(err) = controller.close() {
                tracing::warn!(error = %err, "error closing controller during pool shutdown");
            }
        }
        self.available.notify_all();
    }
}

impl<'p, S: Source> std::ops::Deref for Lease<'p, S> {
    type Target = Controller<S>;
    fn deref(&self) -> &Controller<S> {
        self.controller.as_ref().expect("controller taken only on drop")
    }
}

impl<'p, S: Source> std::ops::DerefMut for Lease<'p, S> {
    fn deref_mut(&mut self) -> &mut Controller<S> {
        self.controller.as_mut().expect("controller taken only on drop")
    }
}

impl<'p, S: Source> Drop for Lease<'p, S> {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            self.pool.release(controller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::metadata::MetadataStore;
    use crate::source::{RemoteDirEntry, RemoteEntry};
    use crate::target::Target;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct EmptySource;
    impl Source for EmptySource {
        fn get_entry(&mut self, path: &str) -> Result<Option<RemoteEntry>> {
            if path == "/" {
                Ok(Some(RemoteEntry { mode: libc::S_IFDIR | 0o755, size: 0, atime: 0, mtime: 0 }))
            } else {
                Ok(None)
            }
        }
        fn get_directory_entries(&mut self, _path: &str) -> Result<Vec<RemoteDirEntry>> {
            Ok(vec![])
        }
        fn get_link_target(&mut self, path: &str) -> Result<String> {
            Err(crate::error::Error::NotFound(path.to_string()))
        }
        fn read_data(&mut self, _path: &str, _offset: u64, _size: usize) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn make_controller(dir: &TempDir) -> Controller<EmptySource> {
        let target = Target::open(dir.path()).unwrap();
        let metadata = MetadataStore::open(&target.db_path()).unwrap();
        Controller::new(EmptySource, target, metadata, Some("fake://pool/")).unwrap()
    }

    #[test]
    fn acquire_reuses_released_controllers() {
        let dir = TempDir::new().unwrap();
        let pool: ControllerPool<EmptySource> = ControllerPool::new(2);
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let calls = calls.clone();
            let dir_ref = &dir;
            let _lease = pool
                .acquire(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(make_controller(dir_ref))
                })
                .unwrap();
        }

        let calls2 = calls.clone();
        let dir_ref = &dir;
        let _lease = pool
            .acquire(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(make_controller(dir_ref))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acquire_respects_capacity() {
        let dir = TempDir::new().unwrap();
        let pool: Arc<ControllerPool<EmptySource>> = Arc::new(ControllerPool::new(1));
        let lease = pool.acquire(|| Ok(make_controller(&dir))).unwrap();

        let pool2 = pool.clone();
        let dir_path = dir.path().to_path_buf();
        let handle = std::thread::spawn(move || {
            let _second = pool2
                .acquire(|| {
                    let target = Target::open(&dir_path)?;
                    let metadata = MetadataStore::open(&target.db_path())?;
                    Controller::new(EmptySource, target, metadata, Some("fake://pool/"))
                })
                .unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(lease);
        handle.join().unwrap();
    }
}
