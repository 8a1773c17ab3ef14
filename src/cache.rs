use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Cache metadata for one logical path: where the whole-file copy lives,
/// the last version fetched from the authoritative store, and whether the
/// copy carries writes that have not been pushed back yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub cache_path: PathBuf,
    pub known_version: u64,
    pub modified: bool,
}

impl CacheEntry {
    pub fn new(cache_path: PathBuf, known_version: u64) -> Self {
        CacheEntry {
            cache_path,
            known_version,
            modified: false,
        }
    }
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: String,
    entry: CacheEntry,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
enum Slot {
    Occupied(Node),
    /// Freed slot, holding the index of the next free slot.
    Free(usize),
}

#[derive(Debug)]
struct CacheInner {
    capacity: NonZeroUsize,
    slots: Vec<Slot>,
    index: FxHashMap<String, usize>,
    head: usize,
    tail: usize,
    free: usize,
}

/// Fixed-capacity least-recently-used map from logical path to [`CacheEntry`],
/// shared by every client session.
///
/// Recency is a doubly linked list threaded through an arena of indexed
/// slots; a hash map gives O(1) key lookup. Every operation takes the one
/// mutex for its whole read-modify-write sequence, so concurrent callers
/// never observe a torn list.
///
/// Eviction drops metadata only. It never flushes and never deletes the
/// cached file on disk, because open descriptors may still reference it.
#[derive(Debug)]
pub struct EvictionCache {
    inner: Mutex<CacheInner>,
}

impl EvictionCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        EvictionCache {
            inner: Mutex::new(CacheInner {
                capacity,
                slots: Vec::with_capacity(capacity.get()),
                index: FxHashMap::default(),
                head: NIL,
                tail: NIL,
                free: NIL,
            }),
        }
    }

    /// Full cache access: a hit relinks the entry at the most-recently-used
    /// end and returns a copy; a miss leaves the ordering untouched.
    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(path)?;
        inner.detach(idx);
        inner.push_front(idx);
        Some(inner.node(idx).entry.clone())
    }

    /// Insert or replace. An existing key takes the new value and moves to
    /// the most-recently-used end; a new key at capacity first evicts the
    /// least-recently-used entry.
    pub fn set(&self, path: &str, entry: CacheEntry) {
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.index.get(path) {
            inner.node_mut(idx).entry = entry;
            inner.detach(idx);
            inner.push_front(idx);
            return;
        }

        if inner.index.len() >= inner.capacity.get() {
            let victim = inner.tail;
            let node = inner.node(victim);
            if node.entry.modified {
                // close always flushes before an entry can age out, so a
                // dirty victim means a writer is still open on this path.
                tracing::warn!(
                    "evicting {:?} with unflushed writes (cached copy kept at {})",
                    node.key,
                    node.entry.cache_path.display()
                );
            } else {
                tracing::debug!("evicting {:?}", node.key);
            }
            inner.detach(victim);
            inner.release(victim);
        }

        let idx = inner.acquire(path.to_string(), entry);
        inner.push_front(idx);
    }

    /// Atomic read-modify-write of an existing entry; counts as an access.
    /// Returns false when the path is not cached.
    pub fn update<F: FnOnce(&mut CacheEntry)>(&self, path: &str, f: F) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(path) else {
            return false;
        };
        f(&mut inner.node_mut(idx).entry);
        inner.detach(idx);
        inner.push_front(idx);
        true
    }

    /// Explicit removal (unlink); returns the dropped entry.
    pub fn remove(&self, path: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(path)?;
        inner.detach(idx);
        let entry = inner.node(idx).entry.clone();
        inner.release(idx);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn node(&self, idx: usize) -> &Node {
        match &self.slots[idx] {
            Slot::Occupied(node) => node,
            Slot::Free(_) => unreachable!("index points at a free slot"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        match &mut self.slots[idx] {
            Slot::Occupied(node) => node,
            Slot::Free(_) => unreachable!("index points at a free slot"),
        }
    }

    /// Unlink a node from the recency list. Head, tail, sole, and interior
    /// nodes all take the same path: each neighbor (or list end) is patched
    /// from the node's own links.
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }

        let node = self.node_mut(idx);
        node.prev = NIL;
        node.next = NIL;
    }

    /// Link a detached node in at the most-recently-used end.
    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Take a slot from the free list (or grow the arena) for a new node.
    fn acquire(&mut self, key: String, entry: CacheEntry) -> usize {
        let node = Node {
            key: key.clone(),
            entry,
            prev: NIL,
            next: NIL,
        };

        let idx = if self.free != NIL {
            let idx = self.free;
            self.free = match self.slots[idx] {
                Slot::Free(next) => next,
                Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
            };
            self.slots[idx] = Slot::Occupied(node);
            idx
        } else {
            self.slots.push(Slot::Occupied(node));
            self.slots.len() - 1
        };

        self.index.insert(key, idx);
        idx
    }

    /// Return a detached node's slot to the free list and drop it from the
    /// index.
    fn release(&mut self, idx: usize) {
        let key = std::mem::take(&mut self.node_mut(idx).key);
        self.index.remove(&key);
        self.slots[idx] = Slot::Free(self.free);
        self.free = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> EvictionCache {
        EvictionCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn entry(version: u64) -> CacheEntry {
        CacheEntry::new(PathBuf::from(format!("/cache/v{}", version)), version)
    }

    #[test]
    fn get_misses_without_disturbing_order() {
        let c = cache(2);
        c.set("a", entry(1));
        assert!(c.get("missing").is_none());
        assert_eq!(c.get("a").unwrap().known_version, 1);
    }

    #[test]
    fn oldest_insert_is_evicted_first() {
        let c = cache(3);
        c.set("a", entry(1));
        c.set("b", entry(2));
        c.set("c", entry(3));
        c.set("d", entry(4));

        assert!(c.get("a").is_none(), "first-inserted key should be evicted");
        assert!(c.get("b").is_some());
        assert!(c.get("c").is_some());
        assert!(c.get("d").is_some());
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn get_promotes_so_second_oldest_is_evicted() {
        let c = cache(3);
        c.set("a", entry(1));
        c.set("b", entry(2));
        c.set("c", entry(3));

        // Touch "a": "b" becomes least recently used.
        assert!(c.get("a").is_some());
        c.set("d", entry(4));

        assert!(c.get("b").is_none(), "second-inserted key should be evicted");
        assert!(c.get("a").is_some());
        assert!(c.get("c").is_some());
        assert!(c.get("d").is_some());
    }

    #[test]
    fn set_on_existing_key_replaces_and_promotes() {
        let c = cache(2);
        c.set("a", entry(1));
        c.set("b", entry(2));
        c.set("a", entry(9));
        c.set("c", entry(3));

        // "b" was least recently used after "a" got re-set.
        assert!(c.get("b").is_none());
        assert_eq!(c.get("a").unwrap().known_version, 9);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn update_mutates_in_place_and_promotes() {
        let c = cache(2);
        c.set("a", entry(1));
        c.set("b", entry(2));

        assert!(c.update("a", |e| e.modified = true));
        assert!(c.get("a").unwrap().modified);

        // "a" was promoted by the update, so "b" goes first.
        c.set("c", entry(3));
        assert!(c.get("b").is_none());
        assert!(c.get("a").is_some());
    }

    #[test]
    fn update_on_absent_key_reports_false() {
        let c = cache(2);
        assert!(!c.update("nope", |e| e.modified = true));
    }

    #[test]
    fn remove_frees_a_slot_for_reuse() {
        let c = cache(2);
        c.set("a", entry(1));
        c.set("b", entry(2));

        assert_eq!(c.remove("a").unwrap().known_version, 1);
        assert!(c.get("a").is_none());
        assert_eq!(c.len(), 1);

        // The freed slot is reusable without evicting "b".
        c.set("c", entry(3));
        c.set("d", entry(4));
        assert!(c.get("b").is_none(), "b should now be the eviction victim");
        assert!(c.get("c").is_some());
        assert!(c.get("d").is_some());
    }

    #[test]
    fn capacity_one_churns_through_sole_entry() {
        let c = cache(1);
        c.set("a", entry(1));
        c.set("b", entry(2));
        assert!(c.get("a").is_none());
        assert_eq!(c.get("b").unwrap().known_version, 2);

        assert!(c.remove("b").is_some());
        assert!(c.is_empty());
        c.set("c", entry(3));
        assert_eq!(c.get("c").unwrap().known_version, 3);
    }

    #[test]
    fn dirty_entry_is_still_evicted() {
        let c = cache(1);
        c.set("a", entry(1));
        c.update("a", |e| e.modified = true);
        c.set("b", entry(2));
        assert!(c.get("a").is_none());
        assert!(c.get("b").is_some());
    }
}
