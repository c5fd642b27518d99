//! Slotted-page record codec collaborator.
//!
//! Variable-length records addressed by slot id within one 4KB page.
//! Layout: an 8-byte page header, a slot directory growing downward, and
//! record bytes growing upward from the page end. Each slot carries a
//! record-kind tag byte; the kind discriminants are part of the on-disk
//! format and must not change.
//!
//! The heap manager reserves slot 0 of every page for its own header or
//! chain record.

use crate::types::PAGE_SIZE;

/// Page header size in bytes.
pub const SLOTTED_HEADER_SIZE: usize = 8;

/// Size of one slot directory entry.
pub const SLOT_SIZE: usize = 6;

/// Slot id of the heap header / chain record on every heap page.
pub const HEADER_CHAIN_SLOT: u16 = 0;

/// On-disk record kind tag. Discriminants are persisted; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Reserved, dataless slot: an address handed out before its content.
    AssignAddress = 1,
    /// Record data stored inline on this page.
    Home = 2,
    /// The relocated body of a record whose home is elsewhere.
    Newhome = 3,
    /// Forwarding slot: payload is exactly one OID pointing at a Newhome.
    Relocation = 4,
    /// Forwarding slot: payload is exactly one OID pointing into an
    /// overflow chain.
    BigOne = 5,
    /// Deleted; the slot id is never reused (OID uniqueness).
    MarkDeleted = 6,
    /// Deleted; the slot id may be reused after reclamation.
    DeletedWillReuse = 7,
}

impl RecordKind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(RecordKind::AssignAddress),
            2 => Some(RecordKind::Home),
            3 => Some(RecordKind::Newhome),
            4 => Some(RecordKind::Relocation),
            5 => Some(RecordKind::BigOne),
            6 => Some(RecordKind::MarkDeleted),
            7 => Some(RecordKind::DeletedWillReuse),
            _ => None,
        }
    }

    /// Tombstones are slots deletes left behind; they carry no data and
    /// scans skip them.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, RecordKind::MarkDeleted | RecordKind::DeletedWillReuse)
    }

    /// Kinds whose payload is a single forwarding OID.
    pub fn is_forwarding(&self) -> bool {
        matches!(self, RecordKind::Relocation | RecordKind::BigOne)
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    offset: u16,
    length: u16,
    kind: u8,
}

impl SlotEntry {
    const EMPTY: SlotEntry = SlotEntry { offset: 0, length: 0, kind: 0 };

    fn is_empty(&self) -> bool {
        self.kind == 0
    }

    fn read_from(buf: &[u8]) -> Self {
        SlotEntry {
            offset: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
            kind: buf[4],
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.offset.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4] = self.kind;
        buf[5] = 0;
    }
}

#[derive(Debug, Clone, Copy)]
struct SlottedHeader {
    slot_count: u16,
    free_start: u16,
    free_end: u16,
}

impl SlottedHeader {
    fn read_from(buf: &[u8]) -> Self {
        SlottedHeader {
            slot_count: u16::from_le_bytes([buf[0], buf[1]]),
            free_start: u16::from_le_bytes([buf[2], buf[3]]),
            free_end: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[2..4].copy_from_slice(&self.free_start.to_le_bytes());
        buf[4..6].copy_from_slice(&self.free_end.to_le_bytes());
        buf[6] = 0;
        buf[7] = 0;
    }
}

/// Slotted page view over page bytes; `&[u8]`, `&mut [u8]`, owned buffers
/// all work through `AsRef`/`AsMut`.
pub struct SlottedPage<T> {
    data: T,
}

impl<T: AsRef<[u8]>> SlottedPage<T> {
    /// # Panics
    /// Panics if the backing buffer is not exactly one page.
    pub fn new(data: T) -> Self {
        assert_eq!(data.as_ref().len(), PAGE_SIZE, "SlottedPage requires one full page");
        SlottedPage { data }
    }

    fn header(&self) -> SlottedHeader {
        SlottedHeader::read_from(&self.data.as_ref()[..SLOTTED_HEADER_SIZE])
    }

    fn slot(&self, slot_id: u16) -> SlotEntry {
        let off = SLOTTED_HEADER_SIZE + slot_id as usize * SLOT_SIZE;
        SlotEntry::read_from(&self.data.as_ref()[off..off + SLOT_SIZE])
    }

    pub fn slot_count(&self) -> u16 {
        self.header().slot_count
    }

    /// Contiguous free space between the slot directory and record area.
    pub fn free_space(&self) -> usize {
        let h = self.header();
        (h.free_end - h.free_start) as usize
    }

    /// Total reclaimable free space, counting holes left by deletes.
    pub fn total_free_space(&self) -> usize {
        let h = self.header();
        let mut used = 0usize;
        for slot_id in 0..h.slot_count {
            used += self.slot(slot_id).length as usize;
        }
        PAGE_SIZE - SLOTTED_HEADER_SIZE - h.slot_count as usize * SLOT_SIZE - used
    }

    /// Space available to an insert that must allocate a new slot.
    pub fn insertable_space(&self) -> usize {
        self.total_free_space().saturating_sub(SLOT_SIZE)
    }

    pub fn kind(&self, slot_id: u16) -> Option<RecordKind> {
        if slot_id >= self.header().slot_count {
            return None;
        }
        RecordKind::from_u8(self.slot(slot_id).kind)
    }

    /// Record bytes at `slot_id`; `None` for unknown or empty slots.
    /// Tombstones and reserved slots read as empty payloads.
    pub fn read(&self, slot_id: u16) -> Option<(RecordKind, &[u8])> {
        if slot_id >= self.header().slot_count {
            return None;
        }
        let slot = self.slot(slot_id);
        let kind = RecordKind::from_u8(slot.kind)?;
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        Some((kind, &self.data.as_ref()[start..end]))
    }

    /// Iterate live slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, RecordKind, &[u8])> {
        (0..self.header().slot_count)
            .filter_map(move |slot_id| self.read(slot_id).map(|(k, d)| (slot_id, k, d)))
    }

    /// Number of slots holding a live (non-tombstone) record.
    pub fn live_count(&self) -> usize {
        self.iter().filter(|(_, kind, _)| !kind.is_tombstone()).count()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<T> {
    fn set_header(&mut self, h: &SlottedHeader) {
        h.write_to(&mut self.data.as_mut()[..SLOTTED_HEADER_SIZE]);
    }

    fn set_slot(&mut self, slot_id: u16, entry: &SlotEntry) {
        let off = SLOTTED_HEADER_SIZE + slot_id as usize * SLOT_SIZE;
        entry.write_to(&mut self.data.as_mut()[off..off + SLOT_SIZE]);
    }

    /// Initialize an empty page.
    pub fn init(&mut self) {
        self.data.as_mut().fill(0);
        let h = SlottedHeader {
            slot_count: 0,
            free_start: SLOTTED_HEADER_SIZE as u16,
            free_end: PAGE_SIZE as u16,
        };
        self.set_header(&h);
    }

    fn place(&mut self, data: &[u8]) -> Option<u16> {
        let mut h = self.header();
        if self.free_space() < data.len() {
            return None;
        }
        h.free_end -= data.len() as u16;
        let offset = h.free_end;
        let start = offset as usize;
        self.data.as_mut()[start..start + data.len()].copy_from_slice(data);
        self.set_header(&h);
        Some(offset)
    }

    /// Insert a record, reusing an empty slot when one exists. Returns the
    /// slot id, or `None` when the page cannot hold the record even after
    /// compaction.
    pub fn insert(&mut self, kind: RecordKind, data: &[u8]) -> Option<u16> {
        let h = self.header();
        let reuse = (0..h.slot_count).find(|&id| self.slot(id).is_empty());
        let slot_overhead = if reuse.is_some() { 0 } else { SLOT_SIZE };

        if self.free_space() < data.len() + slot_overhead {
            if self.total_free_space() < data.len() + slot_overhead {
                return None;
            }
            self.compact();
        }

        let slot_id = match reuse {
            Some(id) => id,
            None => {
                let mut h = self.header();
                let id = h.slot_count;
                h.slot_count += 1;
                h.free_start += SLOT_SIZE as u16;
                self.set_header(&h);
                id
            }
        };

        let offset = self.place(data)?;
        self.set_slot(slot_id, &SlotEntry { offset, length: data.len() as u16, kind: kind as u8 });
        Some(slot_id)
    }

    /// Insert at a fixed slot id, extending the directory as needed.
    /// Used by recovery redo (which must reproduce exact addresses) and by
    /// reclamation refilling reserved slots. Fails if the slot is occupied.
    pub fn insert_at(&mut self, slot_id: u16, kind: RecordKind, data: &[u8]) -> Option<u16> {
        let mut h = self.header();
        if slot_id < h.slot_count && !self.slot(slot_id).is_empty() {
            return None;
        }
        if slot_id >= h.slot_count {
            let grow = (slot_id + 1 - h.slot_count) as usize * SLOT_SIZE;
            if self.free_space() < data.len() + grow {
                return None;
            }
            for id in h.slot_count..slot_id {
                self.set_slot(id, &SlotEntry::EMPTY);
            }
            h.slot_count = slot_id + 1;
            h.free_start += grow as u16;
            self.set_header(&h);
        } else if self.free_space() < data.len() {
            if self.total_free_space() < data.len() {
                return None;
            }
            self.compact();
        }

        let offset = self.place(data)?;
        self.set_slot(slot_id, &SlotEntry { offset, length: data.len() as u16, kind: kind as u8 });
        Some(slot_id)
    }

    /// Rewrite a record in place, relocating within the page when it grew.
    /// `None` when the slot is dead or the page is out of room.
    pub fn update(&mut self, slot_id: u16, data: &[u8]) -> Option<()> {
        if slot_id >= self.header().slot_count {
            return None;
        }
        let slot = self.slot(slot_id);
        if slot.is_empty() {
            return None;
        }

        if data.len() <= slot.length as usize {
            let start = slot.offset as usize;
            self.data.as_mut()[start..start + data.len()].copy_from_slice(data);
            self.set_slot(
                slot_id,
                &SlotEntry { offset: slot.offset, length: data.len() as u16, kind: slot.kind },
            );
            return Some(());
        }

        let grow = data.len() - slot.length as usize;
        if self.total_free_space() < grow {
            return None;
        }
        // Drop the old copy first so compaction can reclaim it.
        let kind = slot.kind;
        self.set_slot(slot_id, &SlotEntry { offset: 0, length: 0, kind });
        if self.free_space() < data.len() {
            self.compact();
        }
        let offset = self.place(data)?;
        self.set_slot(slot_id, &SlotEntry { offset, length: data.len() as u16, kind });
        Some(())
    }

    /// Change a slot's record kind tag without touching its payload.
    pub fn set_kind(&mut self, slot_id: u16, kind: RecordKind) -> Option<()> {
        if slot_id >= self.header().slot_count {
            return None;
        }
        let slot = self.slot(slot_id);
        if slot.is_empty() {
            return None;
        }
        self.set_slot(slot_id, &SlotEntry { kind: kind as u8, ..slot });
        Some(())
    }

    /// Free a record's bytes. With `Some(tombstone)` the slot survives as a
    /// dataless marker (pending reuse or permanently dead); with `None` the
    /// slot becomes empty and reusable by later inserts.
    pub fn delete(&mut self, slot_id: u16, tombstone: Option<RecordKind>) -> Option<()> {
        if slot_id >= self.header().slot_count {
            return None;
        }
        let slot = self.slot(slot_id);
        if slot.is_empty() {
            return None;
        }
        let kind = match tombstone {
            Some(k) => {
                debug_assert!(k.is_tombstone());
                k as u8
            }
            None => 0,
        };
        self.set_slot(slot_id, &SlotEntry { offset: 0, length: 0, kind });
        Some(())
    }

    /// Squeeze out holes left by deletes and shrunk updates.
    pub fn compact(&mut self) {
        let h = self.header();
        let mut records: Vec<(u16, SlotEntry, Vec<u8>)> = Vec::new();
        for slot_id in 0..h.slot_count {
            let slot = self.slot(slot_id);
            if slot.length > 0 {
                let start = slot.offset as usize;
                let end = start + slot.length as usize;
                records.push((slot_id, slot, self.data.as_ref()[start..end].to_vec()));
            }
        }

        let mut free_end = PAGE_SIZE as u16;
        for (slot_id, slot, bytes) in records {
            free_end -= bytes.len() as u16;
            let start = free_end as usize;
            self.data.as_mut()[start..start + bytes.len()].copy_from_slice(&bytes);
            self.set_slot(slot_id, &SlotEntry { offset: free_end, ..slot });
        }

        let mut h = self.header();
        h.free_end = free_end;
        self.set_header(&h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        SlottedPage::new(&mut data).init();
        data
    }

    #[test]
    fn test_insert_read_roundtrip() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let s0 = p.insert(RecordKind::Home, b"alpha").unwrap();
        let s1 = p.insert(RecordKind::Home, b"beta").unwrap();
        assert_eq!(p.read(s0), Some((RecordKind::Home, b"alpha".as_slice())));
        assert_eq!(p.read(s1), Some((RecordKind::Home, b"beta".as_slice())));
    }

    #[test]
    fn test_forwarding_slot_holds_only_an_oid() {
        use crate::types::Oid;
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let fwd = Oid::new(0, 5, 3);
        let mut buf = [0u8; Oid::ENCODED_LEN];
        fwd.write_to(&mut buf);
        let sid = p.insert(RecordKind::Relocation, &buf).unwrap();
        let (kind, bytes) = p.read(sid).unwrap();
        assert!(kind.is_forwarding());
        assert_eq!(bytes.len(), Oid::ENCODED_LEN);
        assert_eq!(Oid::read_from(bytes), fwd);
    }

    #[test]
    fn test_delete_empty_slot_is_reused() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let s0 = p.insert(RecordKind::Home, b"gone").unwrap();
        p.insert(RecordKind::Home, b"stays").unwrap();
        p.delete(s0, None).unwrap();
        assert!(p.read(s0).is_none());
        let s2 = p.insert(RecordKind::Home, b"replacement").unwrap();
        assert_eq!(s2, s0);
    }

    #[test]
    fn test_tombstone_survives_and_reads_empty() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let s0 = p.insert(RecordKind::Home, b"victim").unwrap();
        p.delete(s0, Some(RecordKind::DeletedWillReuse)).unwrap();
        let (kind, bytes) = p.read(s0).unwrap();
        assert_eq!(kind, RecordKind::DeletedWillReuse);
        assert!(bytes.is_empty());
        // Tombstoned slots are not handed out by plain inserts.
        let s1 = p.insert(RecordKind::Home, b"next").unwrap();
        assert_ne!(s1, s0);
    }

    #[test]
    fn test_update_in_place_and_grown() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let sid = p.insert(RecordKind::Home, b"shortish").unwrap();
        p.update(sid, b"tiny").unwrap();
        assert_eq!(p.read(sid).unwrap().1, b"tiny");
        p.update(sid, b"considerably longer than before").unwrap();
        assert_eq!(p.read(sid).unwrap().1, b"considerably longer than before".as_slice());
    }

    #[test]
    fn test_insert_compacts_fragmented_page() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let big = vec![7u8; 1200];
        let a = p.insert(RecordKind::Home, &big).unwrap();
        let b = p.insert(RecordKind::Home, &big).unwrap();
        let c = p.insert(RecordKind::Home, &big).unwrap();
        p.delete(b, None).unwrap();
        // Contiguous space is short, total space is not.
        assert!(p.free_space() < 1200);
        assert!(p.total_free_space() >= 1200);
        let again = p.insert(RecordKind::Home, &big).unwrap();
        assert_eq!(again, b);
        assert_eq!(p.read(a).unwrap().1, big.as_slice());
        assert_eq!(p.read(c).unwrap().1, big.as_slice());
    }

    #[test]
    fn test_insert_at_extends_directory() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        p.insert_at(4, RecordKind::Home, b"anchored").unwrap();
        assert_eq!(p.slot_count(), 5);
        assert_eq!(p.read(4).unwrap().1, b"anchored");
        assert!(p.read(2).is_none());
        // Occupied slots refuse anchored inserts.
        assert!(p.insert_at(4, RecordKind::Home, b"clobber").is_none());
        // Interior empty slots accept them.
        p.insert_at(2, RecordKind::Home, b"filled").unwrap();
        assert_eq!(p.read(2).unwrap().1, b"filled");
    }

    #[test]
    fn test_set_kind_preserves_payload() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let sid = p.insert(RecordKind::Home, b"payload").unwrap();
        p.set_kind(sid, RecordKind::Newhome).unwrap();
        assert_eq!(p.read(sid), Some((RecordKind::Newhome, b"payload".as_slice())));
    }

    #[test]
    fn test_insert_fills_page_to_the_last_byte() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let exact = p.insertable_space();
        assert!(p.insert(RecordKind::Home, &vec![3u8; exact + 1]).is_none());
        let sid = p.insert(RecordKind::Home, &vec![3u8; exact]).unwrap();
        assert_eq!(p.free_space(), 0);
        assert_eq!(p.read(sid).unwrap().1.len(), exact);
    }

    #[test]
    fn test_page_full() {
        let mut data = page();
        let mut p = SlottedPage::new(&mut data);
        let chunk = vec![1u8; 900];
        let mut n = 0;
        while p.insert(RecordKind::Home, &chunk).is_some() {
            n += 1;
        }
        assert!(n >= 4);
        assert!(p.insert(RecordKind::Home, &chunk).is_none());
    }
}
