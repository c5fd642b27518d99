//! Heap file manager.
//!
//! A heap file stores the records of one class as an unordered collection
//! of slotted pages chained off a header page. Records are addressed by
//! OID (volume, page, slot) and the OID survives every relocation the
//! record's body goes through. `HeapManager` is the public surface; the
//! page-level machinery lives in the submodules:
//!
//! - `header`: the on-disk heap header and per-page chain records
//! - `alloc`: page allocation, chain maintenance, free-space search
//! - `placement`: the insert/update/delete slot-kind state machine
//! - `scan`: scan caches, ordered traversal, range scans
//! - `context`: the per-operation carrier

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bestspace::{BestSpaceCache, BestSpaceStats};
use crate::classrepr::{ClassReprCache, ClassReprLoader, ClassReprStats, PinnedRepr};
use crate::config::HeapConfig;
use crate::error::{Error, Result, ScanCode, corrupted};
use crate::log::{LogRecordKind, RecoveryLog, RedoImage};
use crate::mvcc::{MvccRecHeader, Snapshot};
use crate::overflow::OverflowStore;
use crate::page::PageBuffer;
use crate::slotted::{HEADER_CHAIN_SLOT, RecordKind, SlottedPage};
use crate::types::{Chn, ClassId, Hfid, MvccId, Oid, ReprId};

mod alloc;
mod context;
mod header;
mod placement;
mod scan;

pub use alloc::page_capacity;
pub use context::{OperationContext, OperationKind};
pub use header::{BEST_RING_LEN, BestHint, BestUpdate, ChainHeader, HeapHeader,
    SECOND_BEST_RING_LEN};
pub use scan::{ScanCache, ScanRange};

/// Shared collaborators every heap operation runs against.
pub(crate) struct HeapCore {
    pub(crate) buffer: Arc<PageBuffer>,
    pub(crate) log: Arc<RecoveryLog>,
    pub(crate) bestspace: BestSpaceCache,
    pub(crate) overflow: OverflowStore,
    pub(crate) config: HeapConfig,
}

/// How `get` treats record versions.
#[derive(Clone)]
pub enum FetchMode {
    /// Head version bytes, no visibility applied.
    Plain,
    /// Newest version visible to the snapshot; older versions come from
    /// the previous-version chain when the head is too new.
    Visible(Arc<dyn Snapshot>),
    /// Head of the version chain, but a delete-stamped head reads as
    /// gone.
    LastVersion,
}

/// Running estimates from the heap header. Approximate by design; exact
/// numbers come from `count_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEstimate {
    pub num_pages: u32,
    pub num_recs: u64,
    pub avg_reclen: u64,
}

pub struct HeapManager {
    core: Arc<HeapCore>,
    classrepr: Arc<ClassReprCache>,
    heaps_by_class: Mutex<HashMap<ClassId, Hfid>>,
    next_fileid: AtomicI32,
}

impl HeapManager {
    pub fn new(
        buffer: Arc<PageBuffer>,
        log: Arc<RecoveryLog>,
        config: HeapConfig,
        loader: Arc<dyn ClassReprLoader>,
    ) -> Self {
        let bestspace = BestSpaceCache::new(
            config.bestspace_capacity,
            config.min_cached_freespace,
            config.find_probe_limit,
        );
        let overflow = OverflowStore::new(Arc::clone(&buffer), Arc::clone(&log));
        let classrepr = Arc::new(ClassReprCache::new(config.classrepr_capacity, loader));
        HeapManager {
            core: Arc::new(HeapCore { buffer, log, bestspace, overflow, config }),
            classrepr,
            heaps_by_class: Mutex::new(HashMap::new()),
            next_fileid: AtomicI32::new(1),
        }
    }

    pub fn buffer(&self) -> &Arc<PageBuffer> {
        &self.core.buffer
    }

    pub fn log(&self) -> &Arc<RecoveryLog> {
        &self.core.log
    }

    // ---- heap lifecycle ----

    /// Create an empty heap file for `class_id` and remember the mapping.
    pub fn create_heap(&self, volid: i16, class_id: ClassId) -> Result<Hfid> {
        let vpid = self.core.buffer.alloc_page(volid)?;
        let fileid = self.next_fileid.fetch_add(1, Ordering::Relaxed);
        let hfid = Hfid::new(volid, fileid, vpid.pageid);
        let unfill = self.core.config.unfill_space(page_capacity()) as u16;
        let header = HeapHeader::new(class_id, volid, unfill);
        {
            let mut guard = self.core.buffer.fix_write_blocking(vpid)?;
            let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
            page.init();
            if page
                .insert_at(HEADER_CHAIN_SLOT, RecordKind::Home, &header.encode())
                .is_none()
            {
                return Err(Error::Page { vpid, why: "heap header does not fit" });
            }
        }
        self.core.log.append_single(
            LogRecordKind::NewPageInit,
            RedoImage::PageInit { vpid, chain: header.encode() },
            None,
        );
        self.heaps_by_class.lock().insert(class_id, hfid);
        info!(heap = %hfid, class = %class_id, "created heap file");
        Ok(hfid)
    }

    /// Create a heap with `initial_pages` data pages appended up front.
    pub fn create_heap_with_pages(
        &self,
        volid: i16,
        class_id: ClassId,
        initial_pages: usize,
    ) -> Result<Hfid> {
        let hfid = self.create_heap(volid, class_id)?;
        self.core.preallocate(hfid, initial_pages)?;
        Ok(hfid)
    }

    /// Release every page of the heap, its overflow chains included. The
    /// deallocation is logged so a replay tears the heap down again
    /// instead of rebuilding it from the older page images.
    pub fn destroy_heap(&self, hfid: Hfid) -> Result<()> {
        let header = self.core.read_header(hfid)?;
        let op = self.core.log.begin_sysop();

        let mut pages = Vec::new();
        let mut vpid = header.next;
        while !vpid.is_null() {
            let chain = self.core.read_chain(vpid)?;
            pages.push(vpid);
            vpid = chain.next;
        }

        for &page_vpid in &pages {
            let fwds: Vec<Oid> = {
                let guard = self.core.buffer.fix_read(page_vpid)?;
                let page = SlottedPage::new(guard.data().as_slice());
                page.iter()
                    .filter(|(slot, kind, _)| {
                        *slot != HEADER_CHAIN_SLOT && *kind == RecordKind::BigOne
                    })
                    .map(|(_, _, bytes)| Oid::read_from(bytes))
                    .collect()
            };
            for fwd in fwds {
                self.core.overflow.delete(&op, fwd)?;
            }
            self.core.buffer.dealloc_page(page_vpid)?;
        }
        self.core.buffer.dealloc_page(hfid.header_vpid())?;
        self.core.bestspace.remove_heap(hfid);
        pages.push(hfid.header_vpid());
        let total = pages.len();
        self.core.log.append(
            &op,
            LogRecordKind::MarkFileDeleted,
            RedoImage::FileDeleted { hfid, pages },
            None,
        );
        op.commit();

        let mut map = self.heaps_by_class.lock();
        if map.get(&header.class_id) == Some(&hfid) {
            map.remove(&header.class_id);
        }
        info!(heap = %hfid, pages = total, "destroyed heap file");
        Ok(())
    }

    /// Heap registered for a class, if any.
    pub fn heap_for_class(&self, class_id: ClassId) -> Option<Hfid> {
        self.heaps_by_class.lock().get(&class_id).copied()
    }

    // ---- record operations ----

    /// Run one prepared operation context.
    pub fn execute(&self, ctx: &mut OperationContext) -> Result<ScanCode> {
        self.core.execute(ctx)
    }

    pub fn insert(
        &self,
        hfid: Hfid,
        class_id: ClassId,
        repr_id: ReprId,
        mvccid: Option<MvccId>,
        payload: &[u8],
    ) -> Result<Oid> {
        let mut ctx = OperationContext::insert(hfid, class_id, repr_id, mvccid, payload.to_vec());
        self.core.execute(&mut ctx)?;
        Ok(ctx.oid)
    }

    /// Reserve a permanent OID with no content yet.
    pub fn assign_address(&self, hfid: Hfid, class_id: ClassId) -> Result<Oid> {
        let mut ctx = OperationContext::assign_address(hfid, class_id);
        self.core.execute(&mut ctx)?;
        Ok(ctx.oid)
    }

    /// Update the record at `oid`. Non-versioned updates keep the OID; an
    /// MVCC update returns the new version's OID alongside the code.
    pub fn update(
        &self,
        hfid: Hfid,
        class_id: ClassId,
        repr_id: ReprId,
        mvccid: Option<MvccId>,
        oid: Oid,
        payload: &[u8],
    ) -> Result<(ScanCode, Oid)> {
        let mut ctx =
            OperationContext::update(hfid, class_id, repr_id, mvccid, oid, payload.to_vec());
        let code = self.core.execute(&mut ctx)?;
        Ok((code, ctx.oid))
    }

    pub fn delete(
        &self,
        hfid: Hfid,
        class_id: ClassId,
        mvccid: Option<MvccId>,
        oid: Oid,
    ) -> Result<ScanCode> {
        let mut ctx = OperationContext::delete(hfid, class_id, mvccid, oid);
        self.core.execute(&mut ctx)
    }

    /// Fetch the record behind `oid`. `cached_chn` lets callers holding a
    /// cached copy skip the payload when nothing changed.
    pub fn get(
        &self,
        oid: Oid,
        mode: FetchMode,
        cached_chn: Option<Chn>,
    ) -> Result<(ScanCode, Option<Vec<u8>>)> {
        match mode {
            FetchMode::Plain => self.quick_scan().get(oid, cached_chn),
            FetchMode::Visible(snapshot) => {
                let mut sc = ScanCache::new(
                    Arc::clone(&self.core),
                    Hfid::NULL,
                    ClassId::NULL,
                    Some(snapshot),
                    false,
                    false,
                );
                sc.get(oid, cached_chn)
            }
            FetchMode::LastVersion => {
                let (code, bytes) = self.quick_scan().get(oid, cached_chn)?;
                if let Some(record) = &bytes {
                    let (header, _) = MvccRecHeader::parse(record)?;
                    if header.is_deleted() {
                        return Ok((ScanCode::DoesNotExist, None));
                    }
                }
                Ok((code, bytes))
            }
        }
    }

    /// Whether an OID currently resolves to a record body.
    pub fn does_exist(&self, oid: Oid) -> Result<bool> {
        Ok(self.core.fetch(oid)?.is_some())
    }

    // ---- scans ----

    /// Open a read scan over a heap. The last fixed page stays pinned
    /// between calls.
    pub fn scan_start(
        &self,
        hfid: Hfid,
        class_id: ClassId,
        snapshot: Option<Arc<dyn Snapshot>>,
    ) -> ScanCache {
        ScanCache::new(Arc::clone(&self.core), hfid, class_id, snapshot, true, false)
    }

    /// Open a scan that will interleave modifications; no page pinning.
    pub fn scan_start_modify(
        &self,
        hfid: Hfid,
        class_id: ClassId,
        snapshot: Option<Arc<dyn Snapshot>>,
    ) -> ScanCache {
        ScanCache::new(Arc::clone(&self.core), hfid, class_id, snapshot, false, true)
    }

    /// Minimal scan cache for one-off fetches, bound to no heap.
    pub fn quick_scan(&self) -> ScanCache {
        ScanCache::new(Arc::clone(&self.core), Hfid::NULL, ClassId::NULL, None, false, false)
    }

    // ---- statistics ----

    /// Header estimates: cheap, approximate.
    pub fn estimate(&self, hfid: Hfid) -> Result<HeapEstimate> {
        let header = self.core.read_header(hfid)?;
        let avg = if header.num_recs == 0 { 0 } else { header.sum_reclen / header.num_recs };
        Ok(HeapEstimate {
            num_pages: header.num_pages,
            num_recs: header.num_recs,
            avg_reclen: avg,
        })
    }

    /// Exact live-record count by a full chain walk. The walk doubles as a
    /// best-space sync: every page's free space is recollected into the
    /// cache on the way through.
    pub fn count_all(&self, hfid: Hfid) -> Result<u64> {
        let (_, records) = self.core.sync_all(hfid)?;
        Ok(records)
    }

    pub fn bestspace_stats(&self) -> BestSpaceStats {
        self.core.bestspace.stats()
    }

    pub fn classrepr_stats(&self) -> ClassReprStats {
        self.classrepr.stats()
    }

    // ---- class representations ----

    pub fn get_class_repr(
        &self,
        class_id: ClassId,
        repr_id: Option<ReprId>,
    ) -> Result<PinnedRepr> {
        self.classrepr.get(class_id, repr_id)
    }

    pub fn invalidate_class_repr(&self, class_id: ClassId) {
        self.classrepr.invalidate(class_id);
    }

    // ---- maintenance ----

    /// Turn reusable tombstones back into free slots and release pages the
    /// reclamation emptied. Pages whose latches are contended are left for
    /// the next pass.
    pub fn reclaim_addresses(&self, hfid: Hfid) -> Result<usize> {
        let header = self.core.read_header(hfid)?;
        let mut reclaimed = 0usize;
        let mut vpid = header.next;
        while !vpid.is_null() {
            let next;
            let emptied;
            {
                let mut guard = self.core.buffer.fix_write_blocking(vpid)?;
                next = self.core.read_chain_on(guard.data().as_slice(), vpid)?.next;
                let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
                for slot in 1..page.slot_count() {
                    if page.kind(slot) == Some(RecordKind::DeletedWillReuse) {
                        page.delete(slot, None);
                        self.core.log.append_single(
                            LogRecordKind::MarkReusableSlot,
                            RedoImage::SlotFreed { vpid, slot_id: slot, tombstone: 0 },
                            None,
                        );
                        reclaimed += 1;
                    }
                }
                emptied = page.live_count() <= 1;
            }
            if emptied && !self.core.try_deallocate_page(hfid, vpid)? {
                debug!(page = %vpid, "empty page contended, left for next pass");
            }
            vpid = next;
        }
        debug!(heap = %hfid, reclaimed, "address reclamation pass finished");
        Ok(reclaimed)
    }

    /// Re-apply every committed log record against the buffer. Idempotent;
    /// used after a crash to bring pages back to their logged state.
    pub fn replay_log(&self) -> Result<()> {
        self.core.log.replay(&self.core.buffer)
    }

    /// Walk the whole chain and verify structural invariants: chain links
    /// are mutually consistent and every slot kind is well formed. Returns
    /// the number of pages checked.
    pub fn check(&self, hfid: Hfid) -> Result<usize> {
        let header = self.core.read_header(hfid)?;
        let mut checked = 0usize;
        let mut expected_prev = hfid.header_vpid();
        let mut vpid = header.next;
        while !vpid.is_null() {
            let chain = self.core.read_chain(vpid)?;
            if chain.prev != expected_prev {
                corrupted!(
                    "page {} chain prev {} does not match expected {}",
                    vpid,
                    chain.prev,
                    expected_prev
                );
            }
            if chain.class_id != header.class_id {
                corrupted!("page {} belongs to class {}", vpid, chain.class_id);
            }
            checked += 1;
            expected_prev = vpid;
            vpid = chain.next;
        }
        if !header.last_vpid.is_null() && header.last_vpid != expected_prev {
            corrupted!("heap {} last page hint {} is stale", hfid, header.last_vpid);
        }
        Ok(checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classrepr::{ClassRepr, ReprAttribute};

    struct OneClassLoader;

    impl ClassReprLoader for OneClassLoader {
        fn load(&self, class_id: ClassId) -> Result<Vec<Arc<ClassRepr>>> {
            Ok(vec![Arc::new(ClassRepr {
                class_id,
                repr_id: 1,
                attributes: vec![ReprAttribute { id: 1, name: "v".into(), fixed_len: None }],
            })])
        }
    }

    fn manager() -> HeapManager {
        HeapManager::new(
            Arc::new(PageBuffer::new()),
            Arc::new(RecoveryLog::new()),
            HeapConfig::default(),
            Arc::new(OneClassLoader),
        )
    }

    #[test]
    fn test_create_insert_get_roundtrip() {
        let mgr = manager();
        let class = ClassId::new(0, 1, 0);
        let hfid = mgr.create_heap(0, class).unwrap();
        assert_eq!(mgr.heap_for_class(class), Some(hfid));

        let oid = mgr.insert(hfid, class, 1, None, b"hello heap").unwrap();
        let (code, bytes) = mgr.get(oid, FetchMode::Plain, None).unwrap();
        assert_eq!(code, ScanCode::Found);
        let bytes = bytes.unwrap();
        let (_, payload) = MvccRecHeader::parse(&bytes).unwrap();
        assert_eq!(payload, b"hello heap");
        assert!(mgr.does_exist(oid).unwrap());
    }

    #[test]
    fn test_assign_address_then_deliver() {
        let mgr = manager();
        let class = ClassId::new(0, 1, 0);
        let hfid = mgr.create_heap(0, class).unwrap();

        let oid = mgr.assign_address(hfid, class).unwrap();
        // Reserved slots do not read as records.
        assert!(!mgr.does_exist(oid).unwrap());
        let (code, _) = mgr.get(oid, FetchMode::Plain, None).unwrap();
        assert_eq!(code, ScanCode::DoesNotExist);

        let (code, updated) = mgr.update(hfid, class, 1, None, oid, b"delivered").unwrap();
        assert_eq!(code, ScanCode::Found);
        assert_eq!(updated, oid);
        assert!(mgr.does_exist(oid).unwrap());
    }

    #[test]
    fn test_estimate_tracks_inserts() {
        let mgr = manager();
        let class = ClassId::new(0, 1, 0);
        let hfid = mgr.create_heap(0, class).unwrap();
        for i in 0..20 {
            mgr.insert(hfid, class, 1, None, format!("record-{i}").as_bytes()).unwrap();
        }
        let est = mgr.estimate(hfid).unwrap();
        assert_eq!(est.num_recs, 20);
        assert!(est.avg_reclen > 0);
        assert_eq!(mgr.count_all(hfid).unwrap(), 20);
    }

    #[test]
    fn test_preallocated_chain_is_consistent() {
        let mgr = manager();
        let class = ClassId::new(0, 1, 0);
        let hfid = mgr.create_heap_with_pages(0, class, 4).unwrap();
        assert_eq!(mgr.check(hfid).unwrap(), 4);
        assert_eq!(mgr.estimate(hfid).unwrap().num_pages, 4);
    }

    #[test]
    fn test_destroy_heap_releases_pages() {
        let mgr = manager();
        let class = ClassId::new(0, 1, 0);
        let hfid = mgr.create_heap_with_pages(0, class, 2).unwrap();
        let oid = mgr.insert(hfid, class, 1, None, b"short lived").unwrap();
        mgr.destroy_heap(hfid).unwrap();
        assert_eq!(mgr.buffer().page_count(0), 0);
        assert!(!mgr.does_exist(oid).unwrap());
        assert_eq!(mgr.heap_for_class(class), None);
    }
}
