//! Class representation cache.
//!
//! Records are stored against the schema version (representation) that was
//! current when they were written, so readers constantly resolve (class id,
//! repr id) pairs. This cache keeps decoded representations pinned in an
//! arena so the catalog is consulted once per class, not once per record.
//!
//! Entries are reference counted through `PinnedRepr` guards. Unpinned
//! entries sit on an intrusive LRU list threaded through the arena by
//! index; eviction only ever takes the unpinned tail. Concurrent misses on
//! the same class are collapsed to a single catalog load by a per-class
//! load mutex that is discarded once the load finishes.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ClassId, ReprId};

const NIL: usize = usize::MAX;

/// One attribute of a representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReprAttribute {
    pub id: i32,
    pub name: String,
    /// Fixed-width attributes store in the fixed region; `None` means
    /// variable width.
    pub fixed_len: Option<usize>,
}

/// A class schema version. Records written under it carry its id in their
/// MVCC header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRepr {
    pub class_id: ClassId,
    pub repr_id: ReprId,
    pub attributes: Vec<ReprAttribute>,
}

/// Catalog access seam. The real implementation reads the class object
/// from its own heap; tests supply a map.
pub trait ClassReprLoader: Send + Sync {
    /// All representations of a class, every repr id it ever had.
    fn load(&self, class_id: ClassId) -> Result<Vec<Arc<ClassRepr>>>;
}

struct Entry {
    class_id: ClassId,
    reprs: Vec<Arc<ClassRepr>>,
    pins: usize,
    /// Invalidated while pinned; freed on last unpin instead of returning
    /// to the LRU.
    stale: bool,
    prev: usize,
    next: usize,
    occupied: bool,
}

impl Entry {
    fn vacant() -> Self {
        Entry {
            class_id: ClassId::NULL,
            reprs: Vec::new(),
            pins: 0,
            stale: false,
            prev: NIL,
            next: NIL,
            occupied: false,
        }
    }
}

struct Inner {
    arena: Vec<Entry>,
    by_class: HashMap<ClassId, usize>,
    /// Free-list head, threaded through `next`.
    free_head: usize,
    /// Unpinned entries, most recently released first.
    lru_head: usize,
    lru_tail: usize,
    hits: u64,
    misses: u64,
}

impl Inner {
    fn alloc_slot(&mut self) -> usize {
        if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.arena[idx].next;
            self.arena[idx] = Entry::vacant();
            idx
        } else {
            self.arena.push(Entry::vacant());
            self.arena.len() - 1
        }
    }

    fn free_slot(&mut self, idx: usize) {
        let class_id = self.arena[idx].class_id;
        self.by_class.remove(&class_id);
        self.arena[idx] = Entry::vacant();
        self.arena[idx].next = self.free_head;
        self.free_head = idx;
    }

    fn lru_unlink(&mut self, idx: usize) {
        let (prev, next) = (self.arena[idx].prev, self.arena[idx].next);
        match prev {
            NIL => self.lru_head = next,
            p => self.arena[p].next = next,
        }
        match next {
            NIL => self.lru_tail = prev,
            n => self.arena[n].prev = prev,
        }
        self.arena[idx].prev = NIL;
        self.arena[idx].next = NIL;
    }

    fn lru_push_front(&mut self, idx: usize) {
        self.arena[idx].prev = NIL;
        self.arena[idx].next = self.lru_head;
        match self.lru_head {
            NIL => self.lru_tail = idx,
            h => self.arena[h].prev = idx,
        }
        self.lru_head = idx;
    }

    fn lru_pop_tail(&mut self) -> Option<usize> {
        let idx = self.lru_tail;
        if idx == NIL {
            return None;
        }
        self.lru_unlink(idx);
        Some(idx)
    }

    fn occupied_count(&self) -> usize {
        self.by_class.len()
    }
}

pub struct ClassReprCache {
    inner: Mutex<Inner>,
    /// Collapses concurrent catalog loads of the same class.
    loading: Mutex<HashMap<ClassId, Arc<Mutex<()>>>>,
    loader: Arc<dyn ClassReprLoader>,
    capacity: usize,
}

impl ClassReprCache {
    pub fn new(capacity: usize, loader: Arc<dyn ClassReprLoader>) -> Self {
        ClassReprCache {
            inner: Mutex::new(Inner {
                arena: Vec::new(),
                by_class: HashMap::new(),
                free_head: NIL,
                lru_head: NIL,
                lru_tail: NIL,
                hits: 0,
                misses: 0,
            }),
            loading: Mutex::new(HashMap::new()),
            loader,
            capacity,
        }
    }

    /// Pin a representation of `class_id`: a specific repr id, or the
    /// latest when `repr_id` is `None`. Loads from the catalog on miss.
    pub fn get(
        self: &Arc<Self>,
        class_id: ClassId,
        repr_id: Option<ReprId>,
    ) -> Result<PinnedRepr> {
        if let Some(pinned) = self.try_pin(class_id, repr_id, true)? {
            return Ok(pinned);
        }

        // Miss. Take the per-class load mutex so racing readers issue one
        // catalog read between them; the loser finds the entry on re-check.
        let load_lock = {
            let mut loading = self.loading.lock();
            Arc::clone(loading.entry(class_id).or_default())
        };
        let _guard = load_lock.lock();

        if let Some(pinned) = self.try_pin(class_id, repr_id, false)? {
            self.forget_load_lock(class_id, &load_lock);
            return Ok(pinned);
        }

        let reprs = match self.loader.load(class_id) {
            Ok(reprs) => reprs,
            Err(e) => {
                self.forget_load_lock(class_id, &load_lock);
                return Err(e);
            }
        };
        if reprs.is_empty() {
            self.forget_load_lock(class_id, &load_lock);
            return Err(Error::InvalidOperation(format!(
                "class {} has no representations",
                class_id
            )));
        }
        debug!(%class_id, count = reprs.len(), "loaded class representations");

        let mut inner = self.inner.lock();
        let idx = match inner.by_class.get(&class_id) {
            // Lost a race after the load lock was recycled.
            Some(&idx) => {
                if inner.arena[idx].pins == 0 {
                    inner.lru_unlink(idx);
                }
                idx
            }
            None => {
                if inner.occupied_count() >= self.capacity {
                    if let Some(victim) = inner.lru_pop_tail() {
                        inner.free_slot(victim);
                    }
                }
                let idx = inner.alloc_slot();
                inner.arena[idx].class_id = class_id;
                inner.arena[idx].reprs = reprs;
                inner.arena[idx].occupied = true;
                inner.by_class.insert(class_id, idx);
                idx
            }
        };
        inner.arena[idx].pins += 1;
        let selected = select_repr(&inner.arena[idx].reprs, repr_id, class_id);
        drop(inner);
        // The entry is published; the load lock goes away only now, so a
        // racing miss re-checks against the cache instead of reloading.
        self.forget_load_lock(class_id, &load_lock);
        let repr = match selected {
            Ok(repr) => repr,
            Err(e) => {
                self.unpin(idx);
                return Err(e);
            }
        };
        Ok(PinnedRepr { cache: Arc::clone(self), idx, repr })
    }

    fn try_pin(
        self: &Arc<Self>,
        class_id: ClassId,
        repr_id: Option<ReprId>,
        count_stats: bool,
    ) -> Result<Option<PinnedRepr>> {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.by_class.get(&class_id) else {
            if count_stats {
                inner.misses += 1;
            }
            return Ok(None);
        };
        if count_stats {
            inner.hits += 1;
        }
        if inner.arena[idx].pins == 0 {
            inner.lru_unlink(idx);
        }
        inner.arena[idx].pins += 1;
        let repr = match select_repr(&inner.arena[idx].reprs, repr_id, class_id) {
            Ok(repr) => repr,
            Err(e) => {
                drop(inner);
                self.unpin(idx);
                return Err(e);
            }
        };
        drop(inner);
        Ok(Some(PinnedRepr { cache: Arc::clone(self), idx, repr }))
    }

    fn forget_load_lock(&self, class_id: ClassId, lock: &Arc<Mutex<()>>) {
        let mut loading = self.loading.lock();
        if let Some(current) = loading.get(&class_id) {
            if Arc::ptr_eq(current, lock) {
                loading.remove(&class_id);
            }
        }
    }

    fn unpin(&self, idx: usize) {
        let mut inner = self.inner.lock();
        inner.arena[idx].pins -= 1;
        if inner.arena[idx].pins > 0 {
            return;
        }
        if inner.arena[idx].stale {
            inner.free_slot(idx);
        } else {
            inner.lru_push_front(idx);
        }
    }

    /// Drop the cached representations of a class after a schema change.
    /// Pinned entries are marked and freed on last unpin; new `get` calls
    /// reload from the catalog either way.
    pub fn invalidate(&self, class_id: ClassId) {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.by_class.get(&class_id) else {
            return;
        };
        if inner.arena[idx].pins == 0 {
            inner.lru_unlink(idx);
            inner.free_slot(idx);
        } else {
            inner.arena[idx].stale = true;
            // Unreachable through the map from now on.
            inner.by_class.remove(&class_id);
        }
    }

    pub fn stats(&self) -> ClassReprStats {
        let inner = self.inner.lock();
        ClassReprStats {
            entries: inner.occupied_count(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassReprStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

fn select_repr(
    reprs: &[Arc<ClassRepr>],
    repr_id: Option<ReprId>,
    class_id: ClassId,
) -> Result<Arc<ClassRepr>> {
    let found = match repr_id {
        Some(id) => reprs.iter().find(|r| r.repr_id == id),
        None => reprs.iter().max_by_key(|r| r.repr_id),
    };
    found.cloned().ok_or_else(|| {
        Error::InvalidOperation(format!(
            "class {} has no representation {:?}",
            class_id, repr_id
        ))
    })
}

/// Pin guard over a cached representation. The entry cannot be evicted
/// while any guard is alive; dropping the last guard returns it to the LRU.
pub struct PinnedRepr {
    cache: Arc<ClassReprCache>,
    idx: usize,
    repr: Arc<ClassRepr>,
}

impl Deref for PinnedRepr {
    type Target = ClassRepr;

    fn deref(&self) -> &ClassRepr {
        &self.repr
    }
}

impl Drop for PinnedRepr {
    fn drop(&mut self) {
        self.cache.unpin(self.idx);
    }
}
