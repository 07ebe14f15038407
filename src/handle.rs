//! Open-file state tracking keyed by opaque handle identifiers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// In-memory state for one open file.
///
/// Owned by the [`HandleMap`]; callers hold an opaque `Arc` reference and
/// never mutate fields directly. The cached size changes only after the
/// service acknowledges a mutation, so it tracks the last authoritative
/// value rather than a local guess.
#[derive(Debug)]
pub struct Handle {
    id: u64,
    path: String,
    size: AtomicU64,
    dirty: AtomicBool,
}

impl Handle {
    fn new(id: u64, path: String, size: u64) -> Self {
        Self {
            id,
            path,
            size: AtomicU64::new(size),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last size acknowledged by the backing service.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }
}

/// Tracks every open handle for one backend instance.
pub struct HandleMap {
    handles: DashMap<u64, Arc<Handle>>,
    next_id: AtomicU64,
}

impl HandleMap {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a newly opened file and hand back its handle.
    pub fn open(&self, path: &str, size: u64) -> Arc<Handle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(Handle::new(id, path.to_string(), size));
        self.handles.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: u64) -> Option<Arc<Handle>> {
        self.handles.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a handle from the map, returning it if it was present.
    pub fn release(&self, id: u64) -> Option<Arc<Handle>> {
        self.handles.remove(&id).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&self) {
        self.handles.clear();
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_get_release() {
        let map = HandleMap::new();
        let h = map.open("dir/file.txt", 9);
        assert_eq!(h.path(), "dir/file.txt");
        assert_eq!(h.size(), 9);
        assert!(!h.is_dirty());

        let again = map.get(h.id()).expect("handle registered");
        assert_eq!(again.id(), h.id());
        assert_eq!(map.len(), 1);

        assert!(map.release(h.id()).is_some());
        assert!(map.get(h.id()).is_none());
        assert!(map.release(h.id()).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let map = HandleMap::new();
        let a = map.open("a", 0);
        let b = map.open("a", 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn size_updates_are_visible_through_the_map() {
        let map = HandleMap::new();
        let h = map.open("f", 0);
        h.set_size(17);
        h.set_dirty(true);
        let again = map.get(h.id()).unwrap();
        assert_eq!(again.size(), 17);
        assert!(again.is_dirty());
    }
}
