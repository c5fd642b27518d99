//! Heap page allocation, chain maintenance, and insert-page search.
//!
//! The search for a page with room runs cheapest-first: the header's best
//! ring, then the process-wide best-space cache, then the header's
//! second-best ring, then a bounded sync scan over the page chain, and
//! only then a fresh page from the file allocator. Every probe uses a
//! conditional latch; a contended page is skipped, never awaited.

use tracing::debug;

use crate::bestspace::Probe;
use crate::error::{Error, Result, corrupted};
use crate::log::{LogRecordKind, RedoImage, SystemOp};
use crate::page::{LatchWait, PageWriteGuard};
use crate::slotted::{HEADER_CHAIN_SLOT, RecordKind, SLOT_SIZE, SLOTTED_HEADER_SIZE, SlottedPage};
use crate::types::{Hfid, PAGE_SIZE, Vpid};

use super::HeapCore;
use super::header::{BestUpdate, ChainHeader, HeapHeader};

/// Record bytes a fresh heap page can hold once its chain record is in.
pub fn page_capacity() -> usize {
    PAGE_SIZE - SLOTTED_HEADER_SIZE - 2 * SLOT_SIZE - ChainHeader::ENCODED_LEN
}

pub(crate) fn insertable(guard: &PageWriteGuard) -> usize {
    SlottedPage::new(guard.data().as_slice()).insertable_space()
}

impl HeapCore {
    /// Decode the heap header record from the header page.
    pub(crate) fn read_header(&self, hfid: Hfid) -> Result<HeapHeader> {
        let guard = self.buffer.fix_read(hfid.header_vpid())?;
        let page = SlottedPage::new(guard.data().as_slice());
        match page.read(HEADER_CHAIN_SLOT) {
            Some((_, bytes)) => HeapHeader::decode(bytes),
            None => corrupted!("heap {} header page has no header record", hfid),
        }
    }

    /// Volume hosting this heap's overflow chains.
    pub(crate) fn overflow_volid(&self, hfid: Hfid) -> Result<i16> {
        Ok(self.read_header(hfid)?.ovf_volid)
    }

    /// Rewrite the header record on an already latched header page and log
    /// the after-image.
    pub(crate) fn write_header_on(
        &self,
        guard: &mut PageWriteGuard,
        header: &HeapHeader,
        op: Option<&SystemOp>,
    ) -> Result<()> {
        let vpid = guard.vpid();
        let bytes = header.encode();
        let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
        if page.update(HEADER_CHAIN_SLOT, &bytes).is_none() {
            return Err(Error::Page { vpid, why: "header record rewrite failed" });
        }
        let redo = RedoImage::Slot {
            vpid,
            slot_id: HEADER_CHAIN_SLOT,
            kind: RecordKind::Home as u8,
            data: bytes,
        };
        match op {
            Some(op) => self.log.append(op, LogRecordKind::HeaderStatsDelta, redo, None),
            None => self.log.append_single(LogRecordKind::HeaderStatsDelta, redo, None),
        };
        Ok(())
    }

    /// Decode the chain record of a non-header page already latched.
    pub(crate) fn read_chain_on(&self, data: &[u8], vpid: Vpid) -> Result<ChainHeader> {
        let page = SlottedPage::new(data);
        match page.read(HEADER_CHAIN_SLOT) {
            Some((_, bytes)) => ChainHeader::decode(bytes),
            None => corrupted!("heap page {} has no chain record", vpid),
        }
    }

    pub(crate) fn read_chain(&self, vpid: Vpid) -> Result<ChainHeader> {
        let guard = self.buffer.fix_read(vpid)?;
        self.read_chain_on(guard.data().as_slice(), vpid)
    }

    /// Rewrite a page's chain record and log the after-image.
    pub(crate) fn write_chain_on(
        &self,
        guard: &mut PageWriteGuard,
        chain: &ChainHeader,
        op: Option<&SystemOp>,
    ) -> Result<()> {
        let vpid = guard.vpid();
        let bytes = chain.encode();
        let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
        if page.update(HEADER_CHAIN_SLOT, &bytes).is_none() {
            return Err(Error::Page { vpid, why: "chain record rewrite failed" });
        }
        let redo = RedoImage::Slot {
            vpid,
            slot_id: HEADER_CHAIN_SLOT,
            kind: RecordKind::Home as u8,
            data: bytes,
        };
        match op {
            Some(op) => self.log.append(op, LogRecordKind::ChainLinkDelta, redo, None),
            None => self.log.append_single(LogRecordKind::ChainLinkDelta, redo, None),
        };
        Ok(())
    }

    /// Append a fresh page to the heap's chain. Crash-atomic: the page
    /// init, the tail link, and the header update commit together, and the
    /// commit is independent of the caller's operation so an aborted
    /// insert still keeps the page.
    pub(crate) fn allocate_page(&self, hfid: Hfid) -> Result<Vpid> {
        let op = self.log.begin_sysop();
        let header_vpid = hfid.header_vpid();
        let mut header_guard = self.buffer.fix_write_blocking(header_vpid)?;
        let mut header = {
            let page = SlottedPage::new(header_guard.data().as_slice());
            match page.read(HEADER_CHAIN_SLOT) {
                Some((_, bytes)) => HeapHeader::decode(bytes)?,
                None => corrupted!("heap {} header page has no header record", hfid),
            }
        };

        // Verify the recorded tail really is the tail; a crash between the
        // link write and the header write can leave it one page behind.
        let mut tail = if header.last_vpid.is_null() { header_vpid } else { header.last_vpid };
        while tail != header_vpid {
            let next = self.read_chain(tail)?.next;
            if next.is_null() {
                break;
            }
            debug!(heap = %hfid, stale_tail = %tail, "heap tail hint was stale");
            tail = next;
        }

        let new_vpid = self.buffer.alloc_page(hfid.volid)?;
        let chain = ChainHeader::new(header.class_id, tail, Vpid::NULL);
        let attach = (|| -> Result<()> {
            {
                let mut guard = self.buffer.fix_write_blocking(new_vpid)?;
                let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
                page.init();
                if page.insert_at(HEADER_CHAIN_SLOT, RecordKind::Home, &chain.encode()).is_none() {
                    return Err(Error::Page { vpid: new_vpid, why: "chain record does not fit" });
                }
            }
            self.log.append(
                &op,
                LogRecordKind::NewPageInit,
                RedoImage::PageInit { vpid: new_vpid, chain: chain.encode() },
                None,
            );

            // Link the old tail forward.
            if tail == header_vpid {
                header.next = new_vpid;
            } else {
                let mut guard = self.buffer.fix_write_blocking(tail)?;
                let mut tail_chain = self.read_chain_on(guard.data().as_slice(), tail)?;
                tail_chain.next = new_vpid;
                self.write_chain_on(&mut guard, &tail_chain, Some(&op))?;
            }

            header.last_vpid = new_vpid;
            header.num_pages += 1;
            if let BestUpdate::Displaced(old) = header.offer_best(new_vpid, page_capacity() as u32)
            {
                if header.take_second_best_sample(self.config.second_best_sample_rate) {
                    header.second_best_push(old);
                }
            }
            self.write_header_on(&mut header_guard, &header, Some(&op))
        })();
        if let Err(e) = attach {
            // The page never joined the chain; hand it back.
            let _ = self.buffer.dealloc_page(new_vpid);
            return Err(e);
        }
        op.commit();

        self.bestspace.upsert(hfid, new_vpid, page_capacity());
        debug!(heap = %hfid, page = %new_vpid, "appended heap page");
        Ok(new_vpid)
    }

    /// Append `count` pages to the chain in one crash-atomic scope with a
    /// single bulk log record. Used when a heap is created with an
    /// expected initial size.
    pub(crate) fn preallocate(&self, hfid: Hfid, count: usize) -> Result<Vec<Vpid>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let op = self.log.begin_sysop();
        let header_vpid = hfid.header_vpid();
        let mut header_guard = self.buffer.fix_write_blocking(header_vpid)?;
        let mut header = {
            let page = SlottedPage::new(header_guard.data().as_slice());
            match page.read(HEADER_CHAIN_SLOT) {
                Some((_, bytes)) => HeapHeader::decode(bytes)?,
                None => corrupted!("heap {} header page has no header record", hfid),
            }
        };
        let tail = if header.last_vpid.is_null() { header_vpid } else { header.last_vpid };

        let mut vpids: Vec<Vpid> = Vec::with_capacity(count);
        for _ in 0..count {
            match self.buffer.alloc_page(hfid.volid) {
                Ok(vpid) => vpids.push(vpid),
                Err(e) => {
                    for vpid in &vpids {
                        let _ = self.buffer.dealloc_page(*vpid);
                    }
                    return Err(e);
                }
            }
        }
        let attach = (|| -> Result<()> {
            let mut images = Vec::with_capacity(count);
            for (i, vpid) in vpids.iter().enumerate() {
                let prev = if i == 0 { tail } else { vpids[i - 1] };
                let next = vpids.get(i + 1).copied().unwrap_or(Vpid::NULL);
                let chain = ChainHeader::new(header.class_id, prev, next);
                let mut guard = self.buffer.fix_write_blocking(*vpid)?;
                let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
                page.init();
                if page.insert_at(HEADER_CHAIN_SLOT, RecordKind::Home, &chain.encode()).is_none()
                {
                    return Err(Error::Page { vpid: *vpid, why: "chain record does not fit" });
                }
                images.push((*vpid, chain.encode()));
            }
            self.log.append(
                &op,
                LogRecordKind::ChainAppendBulk,
                RedoImage::PageInitBulk { pages: images },
                None,
            );

            if tail == header_vpid {
                header.next = vpids[0];
            } else {
                let mut guard = self.buffer.fix_write_blocking(tail)?;
                let mut tail_chain = self.read_chain_on(guard.data().as_slice(), tail)?;
                tail_chain.next = vpids[0];
                self.write_chain_on(&mut guard, &tail_chain, Some(&op))?;
            }
            header.last_vpid = vpids[count - 1];
            header.num_pages += count as u32;
            for vpid in &vpids {
                if let BestUpdate::Displaced(old) = header.offer_best(*vpid, page_capacity() as u32)
                {
                    if header.take_second_best_sample(self.config.second_best_sample_rate) {
                        header.second_best_push(old);
                    }
                }
            }
            self.write_header_on(&mut header_guard, &header, Some(&op))
        })();
        if let Err(e) = attach {
            // None of the pages joined the chain; hand them back.
            for vpid in &vpids {
                let _ = self.buffer.dealloc_page(*vpid);
            }
            return Err(e);
        }
        op.commit();

        for vpid in &vpids {
            self.bestspace.upsert(hfid, *vpid, page_capacity());
        }
        debug!(heap = %hfid, count, "preallocated heap pages");
        Ok(vpids)
    }

    /// Unlink and release an empty page with conditional latches only.
    /// `Ok(false)` means some latch was contended and the page stays; the
    /// caller retries on a later pass.
    pub(crate) fn try_deallocate_page(&self, hfid: Hfid, vpid: Vpid) -> Result<bool> {
        self.deallocate_inner(hfid, vpid, LatchWait::NonBlocking)
    }

    fn deallocate_inner(&self, hfid: Hfid, vpid: Vpid, wait: LatchWait) -> Result<bool> {
        let op = self.log.begin_sysop();
        let header_vpid = hfid.header_vpid();
        if vpid == header_vpid {
            return Err(Error::InvalidOperation(format!(
                "cannot deallocate header page of heap {}",
                hfid
            )));
        }

        let Some(mut header_guard) = self.buffer.fix_write(header_vpid, wait)? else {
            return Ok(false);
        };
        let mut header = {
            let page = SlottedPage::new(header_guard.data().as_slice());
            match page.read(HEADER_CHAIN_SLOT) {
                Some((_, bytes)) => HeapHeader::decode(bytes)?,
                None => corrupted!("heap {} header page has no header record", hfid),
            }
        };

        let Some(victim_guard) = self.buffer.fix_write(vpid, wait)? else {
            return Ok(false);
        };
        {
            let page = SlottedPage::new(victim_guard.data().as_slice());
            if page.live_count() > 1 {
                return Err(Error::InvalidOperation(format!(
                    "page {} still holds records",
                    vpid
                )));
            }
        }
        let chain = self.read_chain_on(victim_guard.data().as_slice(), vpid)?;

        // Latch both neighbours before mutating anything, so a contended
        // latch backs out with no page touched and no half-applied links.
        let mut prev_guard = if chain.prev == header_vpid {
            None
        } else {
            match self.buffer.fix_write(chain.prev, wait)? {
                Some(guard) => Some(guard),
                None => return Ok(false),
            }
        };
        let mut next_guard = if chain.next.is_null() {
            None
        } else {
            match self.buffer.fix_write(chain.next, wait)? {
                Some(guard) => Some(guard),
                None => return Ok(false),
            }
        };

        if let Some(guard) = prev_guard.as_mut() {
            let mut prev_chain = self.read_chain_on(guard.data().as_slice(), chain.prev)?;
            prev_chain.next = chain.next;
            self.write_chain_on(guard, &prev_chain, Some(&op))?;
        } else {
            header.next = chain.next;
        }
        if let Some(guard) = next_guard.as_mut() {
            let mut next_chain = self.read_chain_on(guard.data().as_slice(), chain.next)?;
            next_chain.prev = chain.prev;
            self.write_chain_on(guard, &next_chain, Some(&op))?;
        }

        if header.last_vpid == vpid {
            header.last_vpid = if chain.prev == header_vpid { Vpid::NULL } else { chain.prev };
        }
        if header.full_search_vpid == vpid {
            header.full_search_vpid = chain.next;
        }
        header.num_pages = header.num_pages.saturating_sub(1);
        header.drop_best(vpid);
        self.write_header_on(&mut header_guard, &header, Some(&op))?;
        self.log.append(
            &op,
            LogRecordKind::ReusePage,
            RedoImage::PagesDealloc { pages: vec![vpid] },
            None,
        );
        op.commit();

        drop(victim_guard);
        self.bestspace.remove_page(vpid);
        self.buffer.dealloc_page(vpid)?;
        debug!(heap = %hfid, page = %vpid, "released empty heap page");
        Ok(true)
    }

    /// Find (and exclusively latch) a page with at least `needed` bytes of
    /// insertable space, appending a fresh page if nothing resident fits.
    pub(crate) fn acquire_insert_page(&self, hfid: Hfid, needed: usize) -> Result<PageWriteGuard> {
        let capacity = page_capacity();
        if needed > capacity {
            return Err(Error::InvalidOperation(format!(
                "record of {} bytes exceeds page capacity",
                needed
            )));
        }
        // Steady-state inserts respect the unfill reserve so records keep
        // room to grow in place; it is waived when the record alone is
        // close to a full page.
        let unfill = self.config.unfill_space(capacity);
        let want = if needed + unfill > capacity { needed } else { needed + unfill };

        loop {
            if let Some(guard) = self.probe_header_hints(hfid, needed, want)? {
                return Ok(guard);
            }
            if let Some(guard) = self.probe_bestspace(hfid, needed, want, None) {
                return Ok(guard);
            }
            if let Some(guard) = self.second_best_and_sync_scan(hfid, needed)? {
                return Ok(guard);
            }

            let fresh = self.allocate_page(hfid)?;
            match self.buffer.fix_write(fresh, LatchWait::NonBlocking)? {
                Some(guard) if insertable(&guard) >= needed => return Ok(guard),
                // Another inserter claimed the fresh page first; search
                // again rather than wait on it.
                _ => debug!(heap = %hfid, page = %fresh, "fresh page contended, retrying"),
            }
        }
    }

    fn probe_one(&self, hfid: Hfid, vpid: Vpid, needed: usize) -> Result<Option<PageWriteGuard>> {
        match self.buffer.fix_write(vpid, LatchWait::NonBlocking) {
            Err(_) => {
                self.bestspace.remove_page(vpid);
                Ok(None)
            }
            Ok(None) => Ok(None),
            Ok(Some(guard)) => {
                let space = insertable(&guard);
                self.bestspace.upsert(hfid, vpid, space);
                if space >= needed {
                    Ok(Some(guard))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn probe_header_hints(
        &self,
        hfid: Hfid,
        needed: usize,
        want: usize,
    ) -> Result<Option<PageWriteGuard>> {
        let header = self.read_header(hfid)?;
        let candidates: Vec<Vpid> = header
            .best_candidates()
            .filter(|h| h.freespace as usize >= want)
            .map(|h| h.vpid)
            .collect();
        for vpid in candidates {
            if let Some(guard) = self.probe_one(hfid, vpid, needed)? {
                return Ok(Some(guard));
            }
        }
        Ok(None)
    }

    /// Probe the process-wide cache for a page with room, grabbing the
    /// latch when a candidate verifies. `exclude` keeps a page the caller
    /// already holds out of the search.
    pub(crate) fn probe_bestspace(
        &self,
        hfid: Hfid,
        needed: usize,
        want: usize,
        exclude: Option<Vpid>,
    ) -> Option<PageWriteGuard> {
        let mut grabbed: Option<PageWriteGuard> = None;
        self.bestspace.find(hfid, want, |vpid| {
            if Some(vpid) == exclude {
                return Probe::Busy;
            }
            match self.buffer.fix_write(vpid, LatchWait::NonBlocking) {
                Err(_) => Probe::Gone,
                Ok(None) => Probe::Busy,
                Ok(Some(guard)) => {
                    let space = insertable(&guard);
                    if space >= needed {
                        grabbed = Some(guard);
                        // Report enough space so the search stops here.
                        Probe::Space(space.max(want))
                    } else {
                        Probe::Space(space)
                    }
                }
            }
        });
        grabbed
    }

    /// The slow path: drain second-best candidates, then advance the
    /// rotating sync scan over the page chain, all bounded. Runs under the
    /// header latch so the cursor and rings update consistently.
    fn second_best_and_sync_scan(
        &self,
        hfid: Hfid,
        needed: usize,
    ) -> Result<Option<PageWriteGuard>> {
        let header_vpid = hfid.header_vpid();
        let mut header_guard = self.buffer.fix_write_blocking(header_vpid)?;
        let mut header = {
            let page = SlottedPage::new(header_guard.data().as_slice());
            match page.read(HEADER_CHAIN_SLOT) {
                Some((_, bytes)) => HeapHeader::decode(bytes)?,
                None => corrupted!("heap {} header page has no header record", hfid),
            }
        };
        header.advance_best_cursor();

        let mut found: Option<PageWriteGuard> = None;
        while found.is_none() {
            let Some(vpid) = header.second_best_pop() else {
                break;
            };
            if vpid.is_null() {
                continue;
            }
            found = self.probe_one(hfid, vpid, needed)?;
            if let Some(guard) = &found {
                header.offer_best(guard.vpid(), insertable(guard) as u32);
            }
        }

        if found.is_none() {
            let bound = self.config.sync_scan_bound(header.num_pages as usize);
            let mut cursor = if header.full_search_vpid.is_null() {
                header.next
            } else {
                header.full_search_vpid
            };
            for _ in 0..bound {
                if cursor.is_null() {
                    cursor = header.next; // wrap to the start of the chain
                    if cursor.is_null() {
                        break;
                    }
                }
                let vpid = cursor;
                match self.buffer.fix_write(vpid, LatchWait::NonBlocking)? {
                    None => {
                        // Contended page: step past it using a shared probe
                        // of the chain link if possible, else stop here.
                        match self.buffer.try_fix_read(vpid)? {
                            Some(guard) => {
                                cursor = self
                                    .read_chain_on(guard.data().as_slice(), vpid)?
                                    .next;
                            }
                            None => break,
                        }
                    }
                    Some(guard) => {
                        let space = insertable(&guard);
                        self.bestspace.upsert(hfid, vpid, space);
                        cursor = self.read_chain_on(guard.data().as_slice(), vpid)?.next;
                        if space >= needed {
                            header.offer_best(vpid, space as u32);
                            found = Some(guard);
                            break;
                        }
                    }
                }
            }
            header.full_search_vpid = cursor;
        }

        self.write_header_on(&mut header_guard, &header, None)?;
        Ok(found)
    }

    /// Walk the entire chain once, refreshing the best-space cache from
    /// every page and counting live records as it goes. Returns
    /// (pages, records).
    pub(crate) fn sync_all(&self, hfid: Hfid) -> Result<(usize, u64)> {
        let header = self.read_header(hfid)?;
        let mut pages = 0usize;
        let mut records = 0u64;
        let mut vpid = header.next;
        while !vpid.is_null() {
            let guard = self.buffer.fix_read(vpid)?;
            let page = SlottedPage::new(guard.data().as_slice());
            records += page
                .iter()
                .filter(|(slot, kind, _)| {
                    *slot != HEADER_CHAIN_SLOT
                        && matches!(
                            *kind,
                            RecordKind::Home | RecordKind::Relocation | RecordKind::BigOne
                        )
                })
                .count() as u64;
            let space = page.insertable_space();
            let next = self.read_chain_on(guard.data().as_slice(), vpid)?.next;
            drop(guard);
            self.bestspace.upsert(hfid, vpid, space);
            pages += 1;
            vpid = next;
        }
        Ok((pages, records))
    }
}
