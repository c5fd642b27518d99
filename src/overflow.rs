//! Overflow store collaborator.
//!
//! Records too large for one heap page live here as a chain of dedicated
//! pages. The heap keeps a BigOne forwarding slot whose payload is the OID
//! of the first chain page; that OID stays stable across updates, so
//! updates always reuse the first page and grow or shrink the tail.
//!
//! Each chain page is a slotted page with two slots: slot 0 holds the link
//! to the next page (null VPID at the tail), slot 1 holds this page's
//! chunk of the record. The first page's chunk starts with the record's
//! MVCC header, reserved at worst-case size so delete stamps never grow it.

use std::sync::Arc;

use crate::error::{Error, Result, corrupted};
use crate::log::{LogRecordKind, RecoveryLog, RedoImage, SystemOp};
use crate::mvcc::MvccRecHeader;
use crate::page::PageBuffer;
use crate::slotted::{HEADER_CHAIN_SLOT, RecordKind, SLOT_SIZE, SLOTTED_HEADER_SIZE, SlottedPage};
use crate::types::{Oid, PAGE_SIZE, Vpid};

/// Slot holding the record chunk on every chain page.
const DATA_SLOT: u16 = 1;

/// Record bytes one chain page can carry.
pub const CHUNK_CAPACITY: usize =
    PAGE_SIZE - SLOTTED_HEADER_SIZE - 2 * SLOT_SIZE - Vpid::ENCODED_LEN;

pub struct OverflowStore {
    buffer: Arc<PageBuffer>,
    log: Arc<RecoveryLog>,
}

impl OverflowStore {
    pub fn new(buffer: Arc<PageBuffer>, log: Arc<RecoveryLog>) -> Self {
        OverflowStore { buffer, log }
    }

    /// Store `record` as a fresh chain in `volid`. Returns the OID of the
    /// first chain page, the target of the heap's BigOne forwarding slot.
    pub fn insert(&self, op: &SystemOp, volid: i16, record: &[u8]) -> Result<Oid> {
        let chunks: Vec<&[u8]> = record.chunks(CHUNK_CAPACITY).collect();
        let vpids: Vec<Vpid> = (0..chunks.len().max(1))
            .map(|_| self.buffer.alloc_page(volid))
            .collect::<Result<_>>()?;

        for (i, vpid) in vpids.iter().enumerate() {
            let next = vpids.get(i + 1).copied().unwrap_or(Vpid::NULL);
            let chunk = chunks.get(i).copied().unwrap_or(&[]);
            self.write_chain_page(op, *vpid, next, chunk)?;
        }
        Ok(Oid::new(vpids[0].volid, vpids[0].pageid, DATA_SLOT))
    }

    /// Reassemble the whole record, walking the chain from `oid`.
    pub fn get(&self, oid: Oid) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut vpid = oid.vpid();
        while !vpid.is_null() {
            let guard = self.buffer.fix_read(vpid)?;
            let page = SlottedPage::new(guard.data().as_slice());
            let link = match page.read(HEADER_CHAIN_SLOT) {
                Some((_, bytes)) if bytes.len() >= Vpid::ENCODED_LEN => Vpid::read_from(bytes),
                _ => corrupted!("overflow page {} has no chain link", vpid),
            };
            match page.read(DATA_SLOT) {
                Some((_, bytes)) => out.extend_from_slice(bytes),
                None => corrupted!("overflow page {} has no data chunk", vpid),
            }
            vpid = link;
        }
        Ok(out)
    }

    /// Rewrite the record behind `oid`. The first chain page is reused so
    /// the forwarding OID in the heap stays valid; tail pages are allocated
    /// or released as the new length requires.
    pub fn update(&self, op: &SystemOp, oid: Oid, record: &[u8]) -> Result<()> {
        let old_pages = self.chain_pages(oid.vpid())?;
        let chunks: Vec<&[u8]> = record.chunks(CHUNK_CAPACITY).collect();
        let needed = chunks.len().max(1);

        let mut vpids: Vec<Vpid> = old_pages.iter().take(needed).copied().collect();
        while vpids.len() < needed {
            vpids.push(self.buffer.alloc_page(oid.volid)?);
        }

        for (i, vpid) in vpids.iter().enumerate() {
            let next = vpids.get(i + 1).copied().unwrap_or(Vpid::NULL);
            let chunk = chunks.get(i).copied().unwrap_or(&[]);
            if i < old_pages.len() {
                self.rewrite_chain_page(op, *vpid, next, chunk)?;
            } else {
                self.write_chain_page(op, *vpid, next, chunk)?;
            }
        }

        let freed: Vec<Vpid> = old_pages.into_iter().skip(needed).collect();
        if !freed.is_empty() {
            for vpid in &freed {
                self.buffer.dealloc_page(*vpid)?;
            }
            self.log.append(
                op,
                LogRecordKind::OverflowDelete,
                RedoImage::PagesDealloc { pages: freed },
                None,
            );
        }
        Ok(())
    }

    /// Release every page of the chain starting at `oid` and log the
    /// deallocation so replay does not rebuild the chain.
    pub fn delete(&self, op: &SystemOp, oid: Oid) -> Result<()> {
        let pages = self.chain_pages(oid.vpid())?;
        for vpid in &pages {
            self.buffer.dealloc_page(*vpid)?;
        }
        self.log.append(
            op,
            LogRecordKind::OverflowDelete,
            RedoImage::PagesDealloc { pages },
            None,
        );
        Ok(())
    }

    /// MVCC header stored at the front of the first chunk.
    pub fn mvcc_header(&self, oid: Oid) -> Result<MvccRecHeader> {
        let guard = self.buffer.fix_read(oid.vpid())?;
        let page = SlottedPage::new(guard.data().as_slice());
        match page.read(DATA_SLOT) {
            Some((_, bytes)) => Ok(MvccRecHeader::read_from(bytes)?.0),
            None => corrupted!("overflow page {} has no data chunk", oid.vpid()),
        }
    }

    /// Overwrite the MVCC header in place. The chain is written with a
    /// worst-case header, so a stamped header never changes the encoding
    /// size; anything else is corruption.
    pub fn set_mvcc_header(&self, op: &SystemOp, oid: Oid, header: &MvccRecHeader) -> Result<()> {
        let vpid = oid.vpid();
        let mut guard = self.buffer.fix_write_blocking(vpid)?;
        let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
        let (old_len, mut chunk) = match page.read(DATA_SLOT) {
            Some((_, bytes)) => (MvccRecHeader::read_from(bytes)?.1, bytes.to_vec()),
            None => corrupted!("overflow page {} has no data chunk", vpid),
        };
        if header.encoded_len() != old_len {
            corrupted!(
                "overflow header at {} not reserved at worst case ({} -> {} bytes)",
                vpid,
                old_len,
                header.encoded_len()
            );
        }
        header.write_to(&mut chunk);
        if page.update(DATA_SLOT, &chunk).is_none() {
            return Err(Error::Page { vpid, why: "overflow chunk rewrite failed" });
        }
        self.log.append(
            op,
            LogRecordKind::MvccDeleteOverflow,
            RedoImage::Slot { vpid, slot_id: DATA_SLOT, kind: RecordKind::Home as u8, data: chunk },
            None,
        );
        Ok(())
    }

    fn chain_pages(&self, first: Vpid) -> Result<Vec<Vpid>> {
        let mut vpids = Vec::new();
        let mut vpid = first;
        while !vpid.is_null() {
            let guard = self.buffer.fix_read(vpid)?;
            let page = SlottedPage::new(guard.data().as_slice());
            let link = match page.read(HEADER_CHAIN_SLOT) {
                Some((_, bytes)) if bytes.len() >= Vpid::ENCODED_LEN => Vpid::read_from(bytes),
                _ => corrupted!("overflow page {} has no chain link", vpid),
            };
            vpids.push(vpid);
            vpid = link;
        }
        Ok(vpids)
    }

    fn write_chain_page(&self, op: &SystemOp, vpid: Vpid, next: Vpid, chunk: &[u8]) -> Result<()> {
        let mut link = [0u8; Vpid::ENCODED_LEN];
        next.write_to(&mut link);
        {
            let mut guard = self.buffer.fix_write_blocking(vpid)?;
            let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
            page.init();
            if page.insert_at(HEADER_CHAIN_SLOT, RecordKind::Home, &link).is_none()
                || page.insert_at(DATA_SLOT, RecordKind::Home, chunk).is_none()
            {
                return Err(Error::Page { vpid, why: "overflow chunk does not fit" });
            }
        }
        self.log.append(
            op,
            LogRecordKind::NewPageInit,
            RedoImage::PageInit { vpid, chain: link.to_vec() },
            None,
        );
        self.log.append(
            op,
            LogRecordKind::Insert,
            RedoImage::Slot {
                vpid,
                slot_id: DATA_SLOT,
                kind: RecordKind::Home as u8,
                data: chunk.to_vec(),
            },
            None,
        );
        Ok(())
    }

    fn rewrite_chain_page(&self, op: &SystemOp, vpid: Vpid, next: Vpid, chunk: &[u8]) -> Result<()> {
        let mut link = [0u8; Vpid::ENCODED_LEN];
        next.write_to(&mut link);
        {
            let mut guard = self.buffer.fix_write_blocking(vpid)?;
            let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
            if page.update(HEADER_CHAIN_SLOT, &link).is_none() {
                return Err(Error::Page { vpid, why: "overflow link rewrite failed" });
            }
            // Shrink-then-grow keeps room for the new chunk.
            if page.update(DATA_SLOT, &[]).is_none()
                || page.update(DATA_SLOT, chunk).is_none()
            {
                return Err(Error::Page { vpid, why: "overflow chunk rewrite failed" });
            }
        }
        self.log.append(
            op,
            LogRecordKind::OverflowUpdate,
            RedoImage::Slot {
                vpid,
                slot_id: HEADER_CHAIN_SLOT,
                kind: RecordKind::Home as u8,
                data: link.to_vec(),
            },
            None,
        );
        self.log.append(
            op,
            LogRecordKind::OverflowUpdate,
            RedoImage::Slot {
                vpid,
                slot_id: DATA_SLOT,
                kind: RecordKind::Home as u8,
                data: chunk.to_vec(),
            },
            None,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (OverflowStore, Arc<PageBuffer>, Arc<RecoveryLog>) {
        let buffer = Arc::new(PageBuffer::new());
        let log = Arc::new(RecoveryLog::new());
        (OverflowStore::new(Arc::clone(&buffer), Arc::clone(&log)), buffer, log)
    }

    fn versioned_record(len: usize) -> Vec<u8> {
        let mut header = MvccRecHeader::for_insert(1, 0, 10, true);
        header.reserve_worst_case();
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        header.compose(&payload)
    }

    #[test]
    fn test_insert_get_multi_page() {
        let (store, buffer, log) = store();
        let op = log.begin_sysop();
        let record = versioned_record(3 * CHUNK_CAPACITY + 100);
        let oid = store.insert(&op, 0, &record).unwrap();
        op.commit();
        assert_eq!(buffer.page_count(0), 4);
        assert_eq!(store.get(oid).unwrap(), record);
    }

    #[test]
    fn test_update_reuses_first_page_and_frees_tail() {
        let (store, buffer, log) = store();
        let op = log.begin_sysop();
        let big = versioned_record(3 * CHUNK_CAPACITY);
        let oid = store.insert(&op, 0, &big).unwrap();
        op.commit();
        let pages_before = buffer.page_count(0);

        let op = log.begin_sysop();
        let small = versioned_record(10);
        store.update(&op, oid, &small).unwrap();
        op.commit();

        assert!(buffer.page_count(0) < pages_before);
        assert_eq!(store.get(oid).unwrap(), small);
    }

    #[test]
    fn test_update_can_grow_the_chain() {
        let (store, _, log) = store();
        let op = log.begin_sysop();
        let oid = store.insert(&op, 0, &versioned_record(10)).unwrap();
        let big = versioned_record(2 * CHUNK_CAPACITY + 50);
        store.update(&op, oid, &big).unwrap();
        op.commit();
        assert_eq!(store.get(oid).unwrap(), big);
    }

    #[test]
    fn test_delete_releases_all_pages() {
        let (store, buffer, log) = store();
        let op = log.begin_sysop();
        let oid = store.insert(&op, 0, &versioned_record(2 * CHUNK_CAPACITY)).unwrap();
        op.commit();

        let op = log.begin_sysop();
        store.delete(&op, oid).unwrap();
        op.commit();
        assert_eq!(buffer.page_count(0), 0);
        assert!(store.get(oid).is_err());

        // Replay must not rebuild the released chain.
        let cold = PageBuffer::new();
        log.replay(&cold).unwrap();
        assert_eq!(cold.page_count(0), 0);
    }

    #[test]
    fn test_mvcc_header_stamp_in_place() {
        let (store, _, log) = store();
        let op = log.begin_sysop();
        let oid = store.insert(&op, 0, &versioned_record(CHUNK_CAPACITY + 5)).unwrap();

        let mut header = store.mvcc_header(oid).unwrap();
        assert!(!header.is_deleted());
        header.stamp_delete(22);
        store.set_mvcc_header(&op, oid, &header).unwrap();
        op.commit();

        let read_back = store.mvcc_header(oid).unwrap();
        assert!(read_back.is_deleted());
        assert_eq!(read_back.delete_id(), 22);
        // Payload survives the stamp.
        let record = store.get(oid).unwrap();
        let (_, payload) = MvccRecHeader::parse(&record).unwrap();
        assert_eq!(payload.len(), CHUNK_CAPACITY + 5);
    }
}
