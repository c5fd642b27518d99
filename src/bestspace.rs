//! Process-wide best-space cache.
//!
//! Hash cache of pages believed to have room for an insert, shared by all
//! heaps, consulted before the header's hint rings and before appending a
//! fresh page. Entries are hints, never authority: every candidate is
//! re-probed under a page latch before use, and stale entries are dropped
//! or refreshed on the way.
//!
//! Two indices live under one mutex: vpid -> entry for point updates, and
//! hfid -> vpid set so a heap's candidates (and `remove_heap`) never scan
//! the whole table. The two must always cover the same entries.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{Hfid, Vpid};

#[derive(Debug, Clone, Copy)]
struct Entry {
    hfid: Hfid,
    freespace: usize,
}

/// Probe outcome for one candidate page, reported by the caller's closure.
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    /// Page latch is contended right now; skip, do not wait.
    Busy,
    /// Page is gone (deallocated since it was cached).
    Gone,
    /// Actual insertable space measured under the latch.
    Space(usize),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BestSpaceStats {
    pub entries: usize,
    pub rejections: u64,
}

struct Inner {
    by_vpid: HashMap<Vpid, Entry>,
    by_hfid: HashMap<Hfid, HashSet<Vpid>>,
    rejections: u64,
}

impl Inner {
    fn insert(&mut self, hfid: Hfid, vpid: Vpid, freespace: usize) {
        self.by_vpid.insert(vpid, Entry { hfid, freespace });
        self.by_hfid.entry(hfid).or_default().insert(vpid);
    }

    fn remove(&mut self, vpid: Vpid) -> bool {
        let Some(entry) = self.by_vpid.remove(&vpid) else {
            return false;
        };
        if let Some(set) = self.by_hfid.get_mut(&entry.hfid) {
            set.remove(&vpid);
            if set.is_empty() {
                self.by_hfid.remove(&entry.hfid);
            }
        }
        true
    }

    fn check_indices(&self) {
        debug_assert_eq!(
            self.by_vpid.len(),
            self.by_hfid.values().map(HashSet::len).sum::<usize>(),
            "best-space indices out of sync"
        );
    }
}

pub struct BestSpaceCache {
    inner: Mutex<Inner>,
    capacity: usize,
    min_freespace: usize,
    find_probe_limit: usize,
}

impl BestSpaceCache {
    pub fn new(capacity: usize, min_freespace: usize, find_probe_limit: usize) -> Self {
        BestSpaceCache {
            inner: Mutex::new(Inner {
                by_vpid: HashMap::new(),
                by_hfid: HashMap::new(),
                rejections: 0,
            }),
            capacity,
            min_freespace,
            find_probe_limit,
        }
    }

    /// Record (or refresh) a page's free space. Entries below the caching
    /// threshold are dropped instead. At capacity the worst resident entry
    /// is evicted when the newcomer beats it; otherwise the newcomer is
    /// rejected and heap search degrades to header hints only.
    pub fn upsert(&self, hfid: Hfid, vpid: Vpid, freespace: usize) {
        let mut inner = self.inner.lock();
        if freespace < self.min_freespace {
            inner.remove(vpid);
            inner.check_indices();
            return;
        }
        if inner.by_vpid.contains_key(&vpid) || inner.by_vpid.len() < self.capacity {
            inner.insert(hfid, vpid, freespace);
            inner.check_indices();
            return;
        }

        let victim = inner
            .by_vpid
            .iter()
            .min_by_key(|(_, e)| e.freespace)
            .map(|(v, e)| (*v, e.freespace));
        match victim {
            Some((victim_vpid, victim_space)) if victim_space < freespace => {
                inner.remove(victim_vpid);
                inner.insert(hfid, vpid, freespace);
            }
            _ => {
                inner.rejections += 1;
                if inner.rejections.is_power_of_two() {
                    warn!(
                        rejections = inner.rejections,
                        capacity = self.capacity,
                        "best-space cache full, rejecting hints"
                    );
                }
            }
        }
        inner.check_indices();
    }

    /// Drop the entry for a page (deallocated or observed stale).
    pub fn remove_page(&self, vpid: Vpid) {
        let mut inner = self.inner.lock();
        inner.remove(vpid);
        inner.check_indices();
    }

    /// Drop every entry of a heap. Called when the heap file is destroyed.
    pub fn remove_heap(&self, hfid: Hfid) -> usize {
        let mut inner = self.inner.lock();
        let vpids: Vec<Vpid> = inner
            .by_hfid
            .get(&hfid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for vpid in &vpids {
            inner.remove(*vpid);
        }
        inner.check_indices();
        vpids.len()
    }

    /// Cached free space for a page, if any.
    pub fn cached_space(&self, vpid: Vpid) -> Option<usize> {
        self.inner.lock().by_vpid.get(&vpid).map(|e| e.freespace)
    }

    /// Find a page of `hfid` with at least `needed` insertable bytes.
    ///
    /// Candidates come from the cache; each is verified through `probe`,
    /// which the caller implements as a conditional-latch page inspection.
    /// Busy pages are skipped without waiting, gone and shrunk pages are
    /// corrected in the cache, and the search gives up after the probe
    /// limit so a polluted cache cannot stall inserts.
    pub fn find<F>(&self, hfid: Hfid, needed: usize, mut probe: F) -> Option<Vpid>
    where
        F: FnMut(Vpid) -> Probe,
    {
        // Snapshot candidates so page latches are never taken under the
        // cache mutex.
        let mut candidates: Vec<(Vpid, usize)> = {
            let inner = self.inner.lock();
            let Some(set) = inner.by_hfid.get(&hfid) else {
                return None;
            };
            set.iter()
                .filter_map(|vpid| {
                    let e = inner.by_vpid.get(vpid)?;
                    (e.freespace >= needed).then_some((*vpid, e.freespace))
                })
                .collect()
        };
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        for (vpid, _) in candidates.into_iter().take(self.find_probe_limit) {
            match probe(vpid) {
                Probe::Busy => {
                    debug!(%vpid, "best-space candidate busy, skipping");
                }
                Probe::Gone => {
                    self.remove_page(vpid);
                }
                Probe::Space(actual) if actual >= needed => {
                    self.upsert(hfid, vpid, actual);
                    return Some(vpid);
                }
                Probe::Space(actual) => {
                    self.upsert(hfid, vpid, actual);
                }
            }
        }
        None
    }

    pub fn stats(&self) -> BestSpaceStats {
        let inner = self.inner.lock();
        BestSpaceStats { entries: inner.by_vpid.len(), rejections: inner.rejections }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hfid(n: i32) -> Hfid {
        Hfid::new(0, n, n)
    }

    #[test]
    fn test_find_returns_verified_candidate() {
        let cache = BestSpaceCache::new(16, 64, 10);
        cache.upsert(hfid(1), Vpid::new(0, 1), 100);
        cache.upsert(hfid(1), Vpid::new(0, 2), 500);

        let found = cache.find(hfid(1), 400, |vpid| {
            assert_eq!(vpid, Vpid::new(0, 2), "largest hint probed first");
            Probe::Space(480)
        });
        assert_eq!(found, Some(Vpid::new(0, 2)));
        // Probe result refreshed the entry.
        assert_eq!(cache.cached_space(Vpid::new(0, 2)), Some(480));
    }

    #[test]
    fn test_find_skips_busy_and_corrects_stale() {
        let cache = BestSpaceCache::new(16, 64, 10);
        cache.upsert(hfid(1), Vpid::new(0, 1), 900);
        cache.upsert(hfid(1), Vpid::new(0, 2), 800);
        cache.upsert(hfid(1), Vpid::new(0, 3), 700);

        let found = cache.find(hfid(1), 600, |vpid| match vpid.pageid {
            1 => Probe::Busy,
            2 => Probe::Space(90), // shrunk since cached
            _ => Probe::Space(650),
        });
        assert_eq!(found, Some(Vpid::new(0, 3)));
        // The shrunk page's entry was corrected from the probe.
        assert_eq!(cache.cached_space(Vpid::new(0, 2)), Some(90));
        assert_eq!(cache.cached_space(Vpid::new(0, 1)), Some(900));
    }

    #[test]
    fn test_find_respects_probe_limit() {
        let cache = BestSpaceCache::new(16, 64, 2);
        for i in 0..5 {
            cache.upsert(hfid(1), Vpid::new(0, i), 1000);
        }
        let mut probes = 0;
        let found = cache.find(hfid(1), 500, |_| {
            probes += 1;
            Probe::Busy
        });
        assert_eq!(found, None);
        assert_eq!(probes, 2);
    }

    #[test]
    fn test_capacity_evicts_worse_or_rejects() {
        let cache = BestSpaceCache::new(2, 64, 10);
        cache.upsert(hfid(1), Vpid::new(0, 1), 100);
        cache.upsert(hfid(1), Vpid::new(0, 2), 200);

        // Better than the worst resident: evicts it.
        cache.upsert(hfid(1), Vpid::new(0, 3), 300);
        assert_eq!(cache.cached_space(Vpid::new(0, 1)), None);
        assert_eq!(cache.cached_space(Vpid::new(0, 3)), Some(300));

        // Worse than everything resident: rejected.
        cache.upsert(hfid(1), Vpid::new(0, 4), 150);
        assert_eq!(cache.cached_space(Vpid::new(0, 4)), None);
        assert_eq!(cache.stats().rejections, 1);
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_below_threshold_drops_entry() {
        let cache = BestSpaceCache::new(16, 64, 10);
        cache.upsert(hfid(1), Vpid::new(0, 1), 500);
        cache.upsert(hfid(1), Vpid::new(0, 1), 10);
        assert_eq!(cache.cached_space(Vpid::new(0, 1)), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_remove_heap_clears_only_that_heap() {
        let cache = BestSpaceCache::new(16, 64, 10);
        cache.upsert(hfid(1), Vpid::new(0, 1), 500);
        cache.upsert(hfid(1), Vpid::new(0, 2), 500);
        cache.upsert(hfid(2), Vpid::new(0, 3), 500);

        assert_eq!(cache.remove_heap(hfid(1)), 2);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.cached_space(Vpid::new(0, 3)), Some(500));
        assert_eq!(cache.find(hfid(1), 10, |_| Probe::Space(500)), None);
    }
}
