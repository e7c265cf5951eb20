use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// A consumer holding a log file open outside the store, such as a
/// lagging replica or a backup.
pub trait ExternalReaderHandle: Send + Sync {
    /// Asks the reader to stop; called when its registration is terminated.
    fn terminate(&self);
}

/// Per-version registry of external readers.
///
/// The same handle may be registered several times for one version; each
/// registration is revoked separately.
#[derive(Default)]
pub struct ExternalReaders {
    by_version: Mutex<BTreeMap<u64, Vec<Arc<dyn ExternalReaderHandle>>>>,
}

impl ExternalReaders {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one registration per `(version, handle)` pair.
    pub fn register<I>(&self, readers: I)
    where
        I: IntoIterator<Item = (u64, Arc<dyn ExternalReaderHandle>)>,
    {
        let mut map = self.by_version.lock();
        for (version, handle) in readers {
            map.entry(version).or_default().push(handle);
        }
    }

    /// Removes one registration of `handle`; the version entry goes away
    /// with its last handle.
    pub fn unregister(&self, version: u64, handle: &Arc<dyn ExternalReaderHandle>) -> bool {
        let mut map = self.by_version.lock();
        let Some(handles) = map.get_mut(&version) else {
            return false;
        };
        let Some(index) = handles.iter().position(|h| Arc::ptr_eq(h, handle)) else {
            return false;
        };
        handles.remove(index);
        if handles.is_empty() {
            map.remove(&version);
        }
        true
    }

    /// Drops every registration strictly below `below_version` and
    /// terminates those readers. Returns how many were terminated.
    pub fn terminate_below(&self, below_version: u64) -> usize {
        let terminated: Vec<Arc<dyn ExternalReaderHandle>> = {
            let mut map = self.by_version.lock();
            let kept = map.split_off(&below_version);
            let dropped = std::mem::replace(&mut *map, kept);
            dropped.into_values().flatten().collect()
        };
        for handle in &terminated {
            handle.terminate();
        }
        if !terminated.is_empty() {
            debug!(below_version, count = terminated.len(), "txlog.readers.terminate");
        }
        terminated.len()
    }

    /// Number of registrations for `version`.
    pub fn count(&self, version: u64) -> usize {
        self.by_version
            .lock()
            .get(&version)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// True if `version` has at least one registration.
    pub fn contains(&self, version: u64) -> bool {
        self.count(version) > 0
    }

    /// Versions with at least one registration, ascending.
    pub fn versions(&self) -> Vec<u64> {
        self.by_version.lock().keys().copied().collect()
    }
}
