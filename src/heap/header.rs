//! On-disk heap header and page chain records.
//!
//! Slot 0 of the heap's header page holds a `HeapHeader`; slot 0 of every
//! other heap page holds a `ChainHeader`. Both are fixed-size little-endian
//! records; their layout is on-disk format and must not change shape.

use crate::error::{Error, Result};
use crate::mvcc::VacuumStatus;
use crate::types::{ClassId, MvccId, NULL_MVCCID, Oid, Vpid};

/// Entries in the header's best-space hint ring.
pub const BEST_RING_LEN: usize = 10;

/// Entries in the header's second-best ring.
pub const SECOND_BEST_RING_LEN: usize = 10;

/// One best-space hint: a page and the free space last seen on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestHint {
    pub vpid: Vpid,
    pub freespace: u32,
}

impl BestHint {
    pub const NULL: BestHint = BestHint { vpid: Vpid::NULL, freespace: 0 };

    fn write_to(&self, buf: &mut [u8]) {
        self.vpid.write_to(&mut buf[0..6]);
        buf[6..10].copy_from_slice(&self.freespace.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        BestHint {
            vpid: Vpid::read_from(&buf[0..6]),
            freespace: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
        }
    }
}

/// Outcome of offering a page to the best ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestUpdate {
    /// The page was recorded (fresh slot or refreshed entry).
    Recorded,
    /// The page replaced a worse hint; the displaced page is a second-best
    /// sampling candidate.
    Displaced(Vpid),
    /// The page is worse than every resident hint.
    Ignored,
}

/// Heap header record: identity, running estimates, and the two hint rings
/// used by insert placement before the process-wide cache is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapHeader {
    pub class_id: ClassId,
    /// Volume where overflow chains for this heap are placed.
    pub ovf_volid: i16,
    /// Bytes inserts leave free on each page for future record growth.
    pub unfill_space: u16,
    /// First data page (the header page's forward chain link).
    pub next: Vpid,
    /// Last page of the chain; appends verify and extend here.
    pub last_vpid: Vpid,
    /// Rotating cursor of the background-style free-space sync scan.
    pub full_search_vpid: Vpid,
    /// Estimates, maintained as logged deltas. Approximate by design.
    pub num_pages: u32,
    pub num_recs: u64,
    pub sum_reclen: u64,
    best_cursor: u16,
    best: [BestHint; BEST_RING_LEN],
    sb_head: u16,
    sb_count: u16,
    sb_counter: u32,
    second_best: [Vpid; SECOND_BEST_RING_LEN],
}

impl HeapHeader {
    pub const ENCODED_LEN: usize = 8 + 2 + 2 + 6 + 6 + 6 + 4 + 8 + 8 + 2
        + BEST_RING_LEN * 10
        + 2 + 2 + 4
        + SECOND_BEST_RING_LEN * 6;

    pub fn new(class_id: ClassId, ovf_volid: i16, unfill_space: u16) -> Self {
        HeapHeader {
            class_id,
            ovf_volid,
            unfill_space,
            next: Vpid::NULL,
            last_vpid: Vpid::NULL,
            full_search_vpid: Vpid::NULL,
            num_pages: 0,
            num_recs: 0,
            sum_reclen: 0,
            best_cursor: 0,
            best: [BestHint::NULL; BEST_RING_LEN],
            sb_head: 0,
            sb_count: 0,
            sb_counter: 0,
            second_best: [Vpid::NULL; SECOND_BEST_RING_LEN],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        let mut at = 0;
        self.class_id.write_to(&mut buf[at..at + 8]);
        at += 8;
        buf[at..at + 2].copy_from_slice(&self.ovf_volid.to_le_bytes());
        at += 2;
        buf[at..at + 2].copy_from_slice(&self.unfill_space.to_le_bytes());
        at += 2;
        for vpid in [self.next, self.last_vpid, self.full_search_vpid] {
            vpid.write_to(&mut buf[at..at + 6]);
            at += 6;
        }
        buf[at..at + 4].copy_from_slice(&self.num_pages.to_le_bytes());
        at += 4;
        buf[at..at + 8].copy_from_slice(&self.num_recs.to_le_bytes());
        at += 8;
        buf[at..at + 8].copy_from_slice(&self.sum_reclen.to_le_bytes());
        at += 8;
        buf[at..at + 2].copy_from_slice(&self.best_cursor.to_le_bytes());
        at += 2;
        for hint in &self.best {
            hint.write_to(&mut buf[at..at + 10]);
            at += 10;
        }
        buf[at..at + 2].copy_from_slice(&self.sb_head.to_le_bytes());
        at += 2;
        buf[at..at + 2].copy_from_slice(&self.sb_count.to_le_bytes());
        at += 2;
        buf[at..at + 4].copy_from_slice(&self.sb_counter.to_le_bytes());
        at += 4;
        for vpid in &self.second_best {
            vpid.write_to(&mut buf[at..at + 6]);
            at += 6;
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::Corrupted("short heap header record".into()));
        }
        let mut at = 0;
        let class_id = Oid::read_from(&buf[at..at + 8]);
        at += 8;
        let ovf_volid = i16::from_le_bytes([buf[at], buf[at + 1]]);
        at += 2;
        let unfill_space = u16::from_le_bytes([buf[at], buf[at + 1]]);
        at += 2;
        let next = Vpid::read_from(&buf[at..at + 6]);
        at += 6;
        let last_vpid = Vpid::read_from(&buf[at..at + 6]);
        at += 6;
        let full_search_vpid = Vpid::read_from(&buf[at..at + 6]);
        at += 6;
        let num_pages = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        at += 4;
        let num_recs = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        at += 8;
        let sum_reclen = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        at += 8;
        let best_cursor = u16::from_le_bytes([buf[at], buf[at + 1]]);
        at += 2;
        let mut best = [BestHint::NULL; BEST_RING_LEN];
        for hint in &mut best {
            *hint = BestHint::read_from(&buf[at..at + 10]);
            at += 10;
        }
        let sb_head = u16::from_le_bytes([buf[at], buf[at + 1]]);
        at += 2;
        let sb_count = u16::from_le_bytes([buf[at], buf[at + 1]]);
        at += 2;
        let sb_counter = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        at += 4;
        let mut second_best = [Vpid::NULL; SECOND_BEST_RING_LEN];
        for vpid in &mut second_best {
            *vpid = Vpid::read_from(&buf[at..at + 6]);
            at += 6;
        }
        Ok(HeapHeader {
            class_id,
            ovf_volid,
            unfill_space,
            next,
            last_vpid,
            full_search_vpid,
            num_pages,
            num_recs,
            sum_reclen,
            best_cursor,
            best,
            sb_head,
            sb_count,
            sb_counter,
            second_best,
        })
    }

    /// Offer a page to the best ring. An existing entry for the page is
    /// refreshed in place; otherwise the worst hint gives way when the
    /// newcomer beats it, and its page becomes a second-best candidate.
    pub fn offer_best(&mut self, vpid: Vpid, freespace: u32) -> BestUpdate {
        if let Some(hint) = self.best.iter_mut().find(|h| h.vpid == vpid) {
            hint.freespace = freespace;
            return BestUpdate::Recorded;
        }
        if let Some(hint) = self.best.iter_mut().find(|h| h.vpid.is_null()) {
            *hint = BestHint { vpid, freespace };
            return BestUpdate::Recorded;
        }
        let worst = self
            .best
            .iter_mut()
            .min_by_key(|h| h.freespace)
            .filter(|h| h.freespace < freespace);
        match worst {
            Some(hint) => {
                let displaced = hint.vpid;
                *hint = BestHint { vpid, freespace };
                BestUpdate::Displaced(displaced)
            }
            None => BestUpdate::Ignored,
        }
    }

    /// Drop a page from the best ring (deallocated, or observed full).
    pub fn drop_best(&mut self, vpid: Vpid) {
        for hint in &mut self.best {
            if hint.vpid == vpid {
                *hint = BestHint::NULL;
            }
        }
    }

    /// Hints in rotating order starting at the cursor, so concurrent
    /// inserters spread over different pages instead of converging on the
    /// same hot hint.
    pub fn best_candidates(&self) -> impl Iterator<Item = BestHint> + '_ {
        let start = self.best_cursor as usize % BEST_RING_LEN;
        (0..BEST_RING_LEN)
            .map(move |i| self.best[(start + i) % BEST_RING_LEN])
            .filter(|h| !h.vpid.is_null())
    }

    pub fn advance_best_cursor(&mut self) {
        self.best_cursor = (self.best_cursor + 1) % BEST_RING_LEN as u16;
    }

    /// Whether this displacement should be pushed to the second-best ring.
    /// Only every Nth displacement is, to keep the ring varied.
    pub fn take_second_best_sample(&mut self, sample_rate: u32) -> bool {
        self.sb_counter = self.sb_counter.wrapping_add(1);
        sample_rate != 0 && self.sb_counter % sample_rate == 0
    }

    /// Push onto the second-best ring, overwriting the oldest entry when
    /// full.
    pub fn second_best_push(&mut self, vpid: Vpid) {
        let len = SECOND_BEST_RING_LEN as u16;
        let tail = (self.sb_head + self.sb_count) % len;
        self.second_best[tail as usize] = vpid;
        if self.sb_count < len {
            self.sb_count += 1;
        } else {
            self.sb_head = (self.sb_head + 1) % len;
        }
    }

    /// Pop the oldest second-best entry.
    pub fn second_best_pop(&mut self) -> Option<Vpid> {
        if self.sb_count == 0 {
            return None;
        }
        let vpid = self.second_best[self.sb_head as usize];
        self.second_best[self.sb_head as usize] = Vpid::NULL;
        self.sb_head = (self.sb_head + 1) % SECOND_BEST_RING_LEN as u16;
        self.sb_count -= 1;
        Some(vpid)
    }

    pub fn second_best_len(&self) -> usize {
        self.sb_count as usize
    }
}

/// Chain record on every non-header heap page: identity check, doubly
/// linked page chain, and the page-local MVCC bookkeeping vacuum reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHeader {
    pub class_id: ClassId,
    pub prev: Vpid,
    pub next: Vpid,
    /// Largest MVCCID ever stamped on this page.
    pub max_mvccid: MvccId,
    pub vacuum_status: VacuumStatus,
}

impl ChainHeader {
    pub const ENCODED_LEN: usize = 8 + 6 + 6 + 8 + 1;

    pub fn new(class_id: ClassId, prev: Vpid, next: Vpid) -> Self {
        ChainHeader {
            class_id,
            prev,
            next,
            max_mvccid: NULL_MVCCID,
            vacuum_status: VacuumStatus::None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        self.class_id.write_to(&mut buf[0..8]);
        self.prev.write_to(&mut buf[8..14]);
        self.next.write_to(&mut buf[14..20]);
        buf[20..28].copy_from_slice(&self.max_mvccid.to_le_bytes());
        buf[28] = self.vacuum_status as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::Corrupted("short chain header record".into()));
        }
        Ok(ChainHeader {
            class_id: Oid::read_from(&buf[0..8]),
            prev: Vpid::read_from(&buf[8..14]),
            next: Vpid::read_from(&buf[14..20]),
            max_mvccid: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            vacuum_status: VacuumStatus::from_u8(buf[28]),
        })
    }

    /// Account for an MVCC stamp on this page: bump the watermark and
    /// ratchet the vacuum status.
    pub fn note_mvcc_op(&mut self, mvccid: MvccId) {
        if mvccid > self.max_mvccid {
            self.max_mvccid = mvccid;
        }
        self.vacuum_status = self.vacuum_status.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> ClassId {
        ClassId::new(0, 3, 1)
    }

    #[test]
    fn test_heap_header_codec_roundtrip() {
        let mut h = HeapHeader::new(class(), 0, 400);
        h.next = Vpid::new(0, 1);
        h.last_vpid = Vpid::new(0, 9);
        h.full_search_vpid = Vpid::new(0, 4);
        h.num_pages = 9;
        h.num_recs = 1234;
        h.sum_reclen = 99_000;
        h.offer_best(Vpid::new(0, 2), 800);
        h.second_best_push(Vpid::new(0, 7));

        let bytes = h.encode();
        assert_eq!(bytes.len(), HeapHeader::ENCODED_LEN);
        assert_eq!(HeapHeader::decode(&bytes).unwrap(), h);
        assert!(HeapHeader::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_chain_header_codec_roundtrip() {
        let mut c = ChainHeader::new(class(), Vpid::new(0, 1), Vpid::new(0, 3));
        c.note_mvcc_op(55);
        let bytes = c.encode();
        assert_eq!(bytes.len(), ChainHeader::ENCODED_LEN);
        let back = ChainHeader::decode(&bytes).unwrap();
        assert_eq!(back, c);
        assert_eq!(back.max_mvccid, 55);
        assert_eq!(back.vacuum_status, VacuumStatus::Once);
    }

    #[test]
    fn test_offer_best_refresh_displace_ignore() {
        let mut h = HeapHeader::new(class(), 0, 0);
        for i in 0..BEST_RING_LEN as i32 {
            assert_eq!(h.offer_best(Vpid::new(0, i), 100 + i as u32), BestUpdate::Recorded);
        }
        // Refresh in place.
        assert_eq!(h.offer_best(Vpid::new(0, 0), 50), BestUpdate::Recorded);
        // Better than the worst resident (now page 0 at 50): displaces it.
        assert_eq!(h.offer_best(Vpid::new(0, 99), 60), BestUpdate::Displaced(Vpid::new(0, 0)));
        // Worse than everything resident: ignored.
        assert_eq!(h.offer_best(Vpid::new(0, 98), 10), BestUpdate::Ignored);
    }

    #[test]
    fn test_best_candidates_rotate_with_cursor() {
        let mut h = HeapHeader::new(class(), 0, 0);
        h.offer_best(Vpid::new(0, 1), 100);
        h.offer_best(Vpid::new(0, 2), 100);
        let first: Vec<Vpid> = h.best_candidates().map(|b| b.vpid).collect();
        h.advance_best_cursor();
        let second: Vec<Vpid> = h.best_candidates().map(|b| b.vpid).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn test_second_best_ring_overwrites_oldest() {
        let mut h = HeapHeader::new(class(), 0, 0);
        for i in 0..(SECOND_BEST_RING_LEN + 3) as i32 {
            h.second_best_push(Vpid::new(0, i));
        }
        assert_eq!(h.second_best_len(), SECOND_BEST_RING_LEN);
        // Oldest surviving entry is the fourth pushed.
        assert_eq!(h.second_best_pop(), Some(Vpid::new(0, 3)));
    }

    #[test]
    fn test_second_best_sampling_every_nth() {
        let mut h = HeapHeader::new(class(), 0, 0);
        let samples: Vec<bool> = (0..8).map(|_| h.take_second_best_sample(4)).collect();
        assert_eq!(samples.iter().filter(|s| **s).count(), 2);
        assert!(samples[3] && samples[7]);
    }
}
