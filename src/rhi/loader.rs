use std::{ops::Deref, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use super::error::RhiResult;

/// Process-wide native state (loaded libraries, debug layers). Initialized on
/// the first `acquire` and torn down when the last reference is dropped.
#[derive(Debug)]
pub struct SharedLibrary<T: 'static> {
    name: &'static str,
    slot: Mutex<Option<Entry<T>>>,
}

#[derive(Debug)]
struct Entry<T> {
    value: Arc<T>,
    refs: usize,
}

impl<T: 'static> SharedLibrary<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    pub fn acquire(
        &'static self,
        init: impl FnOnce() -> RhiResult<T>,
    ) -> RhiResult<LibraryRef<T>> {
        let mut guard = self.slot.lock();

        let value = match guard.as_mut() {
            Some(entry) => {
                entry.refs += 1;
                Arc::clone(&entry.value)
            }
            None => {
                debug!("Loading {}", self.name);
                let value = Arc::new(init()?);
                *guard = Some(Entry {
                    value: Arc::clone(&value),
                    refs: 1,
                });
                value
            }
        };

        Ok(LibraryRef { owner: self, value })
    }

    pub fn ref_count(&self) -> usize {
        self.slot.lock().as_ref().map_or(0, |e| e.refs)
    }

    fn release(&self) {
        let mut guard = self.slot.lock();

        if let Some(entry) = guard.as_mut() {
            entry.refs -= 1;

            if entry.refs == 0 {
                debug!("Unloading {}", self.name);
                *guard = None;
            }
        }
    }
}

pub struct LibraryRef<T: 'static> {
    owner: &'static SharedLibrary<T>,
    value: Arc<T>,
}

impl<T> Deref for LibraryRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for LibraryRef<T> {
    fn clone(&self) -> Self {
        if let Some(entry) = self.owner.slot.lock().as_mut() {
            entry.refs += 1;
        }

        Self {
            owner: self.owner,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Drop for LibraryRef<T> {
    fn drop(&mut self) {
        self.owner.release();
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LibraryRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryRef")
            .field("name", &self.owner.name)
            .field("value", &self.value)
            .finish()
    }
}
