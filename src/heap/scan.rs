//! Scan cache and range scans.
//!
//! A `ScanCache` carries the per-scan state a sequence of fetches shares:
//! the heap identity, the snapshot deciding visibility, and optionally the
//! last fixed page kept pinned so sequential access does not re-fix the
//! same page slot by slot.
//!
//! Scans yield home OIDs only. Newhome bodies, reserved addresses, and
//! tombstones are skipped; with a snapshot attached, invisible versions
//! are either skipped or replaced by the newest visible version from the
//! previous-version chain in the recovery log.

use std::sync::Arc;

use crate::error::{Result, ScanCode};
use crate::mvcc::{MvccRecHeader, Snapshot};
use crate::page::PageReadGuard;
use crate::slotted::{RecordKind, SlottedPage};
use crate::types::{Chn, ClassId, Hfid, NULL_LOG_ADDR, Oid, Vpid};

use super::HeapCore;

/// Contiguous range of home slots on one page, scanned as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub first: Oid,
    pub last: Oid,
}

enum Candidate {
    Inline(u16, Vec<u8>),
    Forward(u16, RecordKind, Oid),
}

pub struct ScanCache {
    core: Arc<HeapCore>,
    hfid: Hfid,
    class_id: ClassId,
    snapshot: Option<Arc<dyn Snapshot>>,
    /// Keep the last fixed page pinned between calls.
    cache_last_page: bool,
    pinned: Option<PageReadGuard>,
    for_modify: bool,
}

impl ScanCache {
    pub(crate) fn new(
        core: Arc<HeapCore>,
        hfid: Hfid,
        class_id: ClassId,
        snapshot: Option<Arc<dyn Snapshot>>,
        cache_last_page: bool,
        for_modify: bool,
    ) -> Self {
        ScanCache { core, hfid, class_id, snapshot, cache_last_page, pinned: None, for_modify }
    }

    pub fn hfid(&self) -> Hfid {
        self.hfid
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn is_for_modify(&self) -> bool {
        self.for_modify
    }

    /// Release the pinned page and close the scan.
    pub fn end(mut self) {
        self.pinned = None;
    }

    fn fix(&mut self, vpid: Vpid) -> Result<PageReadGuard> {
        if let Some(guard) = self.pinned.take() {
            if guard.vpid() == vpid {
                return Ok(guard);
            }
        }
        self.core.buffer.fix_read(vpid)
    }

    fn stash(&mut self, guard: PageReadGuard) {
        if self.cache_last_page {
            self.pinned = Some(guard);
        }
    }

    /// Newest version of `record` visible to this scan's snapshot, walking
    /// the previous-version chain in the log when the head is too new.
    /// Scans without a snapshot see the head version as-is.
    fn visible_version(&self, record: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(Some(record.to_vec()));
        };
        let (header, _) = MvccRecHeader::parse(record)?;
        if snapshot.is_visible(&header) {
            return Ok(Some(record.to_vec()));
        }
        let mut addr = header.prev_version_addr();
        while addr != NULL_LOG_ADDR {
            let Some(log_record) = self.core.log.read(addr) else {
                break;
            };
            let Some(old) = log_record.undo else {
                break;
            };
            let (old_header, _) = MvccRecHeader::parse(&old)?;
            if snapshot.is_visible(&old_header) {
                return Ok(Some(old));
            }
            addr = old_header.prev_version_addr();
        }
        Ok(None)
    }

    fn resolve(&self, vpid: Vpid, candidate: Candidate) -> Result<Option<(Oid, Vec<u8>)>> {
        let (slot, record) = match candidate {
            Candidate::Inline(slot, bytes) => (slot, Some(bytes)),
            Candidate::Forward(slot, RecordKind::Relocation, fwd) => {
                (slot, self.core.read_forward(fwd)?)
            }
            Candidate::Forward(slot, _, fwd) => (slot, Some(self.core.overflow.get(fwd)?)),
        };
        let Some(record) = record else {
            return Ok(None);
        };
        let oid = Oid::new(vpid.volid, vpid.pageid, slot);
        Ok(self.visible_version(&record)?.map(|bytes| (oid, bytes)))
    }

    fn collect_page(
        &mut self,
        vpid: Vpid,
        range: impl Iterator<Item = u16>,
    ) -> Result<(Vec<Candidate>, Vpid, Vpid)> {
        let guard = self.fix(vpid)?;
        let mut candidates = Vec::new();
        let (prev, next) = {
            let page = SlottedPage::new(guard.data().as_slice());
            for slot in range {
                match page.read(slot) {
                    Some((RecordKind::Home, bytes)) => {
                        candidates.push(Candidate::Inline(slot, bytes.to_vec()));
                    }
                    Some((kind @ (RecordKind::Relocation | RecordKind::BigOne), bytes)) => {
                        candidates.push(Candidate::Forward(slot, kind, Oid::read_from(bytes)));
                    }
                    // Newhome bodies, reserved slots, and tombstones are
                    // not scan results.
                    _ => {}
                }
            }
            let chain = self.core.read_chain_on(guard.data().as_slice(), vpid)?;
            (chain.prev, chain.next)
        };
        self.stash(guard);
        Ok((candidates, prev, next))
    }

    /// Next visible record after `prev` in heap order. `Oid::NULL` starts
    /// from the beginning.
    pub fn next(&mut self, prev: Oid) -> Result<Option<(Oid, Vec<u8>)>> {
        let (mut vpid, mut after) = if prev.is_null() {
            (self.core.read_header(self.hfid)?.next, None)
        } else {
            (prev.vpid(), Some(prev.slotid))
        };

        while !vpid.is_null() {
            let slot_count = {
                let guard = self.fix(vpid)?;
                let count = SlottedPage::new(guard.data().as_slice()).slot_count();
                self.stash(guard);
                count
            };
            let start = after.map_or(1, |s| s + 1);
            let (candidates, _, next) = self.collect_page(vpid, start..slot_count)?;
            for candidate in candidates {
                if let Some(found) = self.resolve(vpid, candidate)? {
                    return Ok(Some(found));
                }
            }
            vpid = next;
            after = None;
        }
        Ok(None)
    }

    /// Previous visible record before `next`. `Oid::NULL` starts from the
    /// end of the heap.
    pub fn prev(&mut self, next: Oid) -> Result<Option<(Oid, Vec<u8>)>> {
        let (mut vpid, mut before) = if next.is_null() {
            (self.core.read_header(self.hfid)?.last_vpid, None)
        } else {
            (next.vpid(), Some(next.slotid))
        };

        while !vpid.is_null() {
            let end = match before {
                Some(s) => s,
                None => {
                    let guard = self.fix(vpid)?;
                    let count = SlottedPage::new(guard.data().as_slice()).slot_count();
                    self.stash(guard);
                    count
                }
            };
            let (candidates, prev, _) = self.collect_page(vpid, (1..end).rev())?;
            for candidate in candidates {
                if let Some(found) = self.resolve(vpid, candidate)? {
                    return Ok(Some(found));
                }
            }
            vpid = if prev == self.hfid.header_vpid() { Vpid::NULL } else { prev };
            before = None;
        }
        Ok(None)
    }

    /// Fetch one record by OID. `cached_chn` short-circuits unchanged
    /// records: when the visible version still carries that coherency
    /// number, no bytes come back.
    pub fn get(&mut self, oid: Oid, cached_chn: Option<Chn>) -> Result<(ScanCode, Option<Vec<u8>>)> {
        let Some(record) = self.core.fetch(oid)? else {
            return Ok((ScanCode::DoesNotExist, None));
        };
        let Some(visible) = self.visible_version(&record)? else {
            return Ok((ScanCode::Invisible, None));
        };
        if let Some(chn) = cached_chn {
            let (header, _) = MvccRecHeader::parse(&visible)?;
            if header.chn == chn {
                return Ok((ScanCode::Unchanged, None));
            }
        }
        Ok((ScanCode::Found, Some(visible)))
    }

    /// Open a scan range: the first visible record after `start` together
    /// with the last visible record on that same page.
    pub fn scanrange_to_following(&mut self, start: Oid) -> Result<Option<ScanRange>> {
        let Some((first, _)) = self.next(start)? else {
            return Ok(None);
        };
        let mut last = first;
        let mut cursor = first;
        while let Some((oid, _)) = self.next(cursor)? {
            if oid.vpid() != first.vpid() {
                break;
            }
            last = oid;
            cursor = oid;
        }
        Ok(Some(ScanRange { first, last }))
    }

    /// Open a scan range ending at the last visible record before `end`,
    /// extending back to the first visible record on that same page.
    pub fn scanrange_to_prior(&mut self, end: Oid) -> Result<Option<ScanRange>> {
        let Some((last, _)) = self.prev(end)? else {
            return Ok(None);
        };
        let mut first = last;
        let mut cursor = last;
        while let Some((oid, _)) = self.prev(cursor)? {
            if oid.vpid() != last.vpid() {
                break;
            }
            first = oid;
            cursor = oid;
        }
        Ok(Some(ScanRange { first, last }))
    }

    /// Step forward within a range. `Oid::NULL` yields the range's first
    /// record.
    pub fn range_next(&mut self, range: &ScanRange, cur: Oid) -> Result<Option<(Oid, Vec<u8>)>> {
        let probe = if cur.is_null() {
            // Step back once so `next` lands on `first` itself.
            let mut before_first = range.first;
            before_first.slotid = before_first.slotid.saturating_sub(1);
            before_first
        } else {
            cur
        };
        match self.next(probe)? {
            Some((oid, bytes))
                if oid.vpid() == range.first.vpid() && oid.slotid <= range.last.slotid =>
            {
                Ok(Some((oid, bytes)))
            }
            _ => Ok(None),
        }
    }

    /// Step backward within a range. `Oid::NULL` yields the range's last
    /// record.
    pub fn range_prev(&mut self, range: &ScanRange, cur: Oid) -> Result<Option<(Oid, Vec<u8>)>> {
        let probe = if cur.is_null() {
            let mut after_last = range.last;
            after_last.slotid += 1;
            after_last
        } else {
            cur
        };
        match self.prev(probe)? {
            Some((oid, bytes))
                if oid.vpid() == range.first.vpid() && oid.slotid >= range.first.slotid =>
            {
                Ok(Some((oid, bytes)))
            }
            _ => Ok(None),
        }
    }
}
