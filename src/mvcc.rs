//! MVCC record header: the versioning metadata embedded at the front of
//! every record payload, and the adjuster rules that maintain it across
//! insert/update/delete.
//!
//! On-disk layout (little-endian, bit-compatible — consumed by external
//! tooling):
//!
//! ```text
//! repid_and_flags  u32   low 24 bits repr id, high 8 bits flags
//! chn              i32   cache coherency number
//! ins_id           u64   present when FLAG_INSID
//! del_id           u64   present when FLAG_DELID
//! prev_version     u64   present when FLAG_PREV_VERSION (log address)
//! ```
//!
//! The attribute encoding follows immediately after; this component treats
//! it as opaque bytes.

use crate::error::{Error, Result};
use crate::types::{Chn, LogAddr, MvccId, NULL_LOG_ADDR, NULL_MVCCID, ReprId};

const FLAG_INSID: u8 = 0x01;
const FLAG_DELID: u8 = 0x02;
const FLAG_PREV_VERSION: u8 = 0x04;
const FLAG_ALL: u8 = FLAG_INSID | FLAG_DELID | FLAG_PREV_VERSION;

const REPR_ID_MASK: u32 = 0x00FF_FFFF;

/// MVCC record header. Optional fields are present on disk only when the
/// matching flag bit is set; a present field holding the null id means
/// "reserved, not stamped".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MvccRecHeader {
    pub repr_id: ReprId,
    pub chn: Chn,
    pub ins_id: Option<MvccId>,
    pub del_id: Option<MvccId>,
    pub prev_version: Option<LogAddr>,
}

impl MvccRecHeader {
    /// Smallest encoding: flags word + chn.
    pub const MIN_LEN: usize = 8;
    /// Largest encoding: all three optional fields present.
    pub const MAX_LEN: usize = 32;

    /// Header for a freshly inserted version. Non-versioned classes strip
    /// all MVCC bits so the header shrinks to its minimum.
    pub fn for_insert(repr_id: ReprId, chn: Chn, ins_id: MvccId, versioned: bool) -> Self {
        MvccRecHeader {
            repr_id,
            chn,
            ins_id: versioned.then_some(ins_id),
            del_id: None,
            prev_version: None,
        }
    }

    pub fn is_versioned(&self) -> bool {
        self.ins_id.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.del_id.is_some_and(|id| id != NULL_MVCCID)
    }

    pub fn insert_id(&self) -> MvccId {
        self.ins_id.unwrap_or(NULL_MVCCID)
    }

    pub fn delete_id(&self) -> MvccId {
        self.del_id.unwrap_or(NULL_MVCCID)
    }

    pub fn prev_version_addr(&self) -> LogAddr {
        self.prev_version.unwrap_or(NULL_LOG_ADDR)
    }

    /// Whether a delete stamp fits without growing the encoding.
    pub fn has_delete_room(&self) -> bool {
        self.del_id.is_some()
    }

    /// Reserve the worst-case header ahead of a physical write, so later
    /// in-place stamping never grows the record (relocation/overflow
    /// capable records pay this up front).
    pub fn reserve_worst_case(&mut self) {
        if self.ins_id.is_none() {
            return; // non-versioned classes carry no MVCC fields at all
        }
        self.del_id.get_or_insert(NULL_MVCCID);
        self.prev_version.get_or_insert(NULL_LOG_ADDR);
    }

    /// Stamp the delete MVCCID. In place when room was reserved; otherwise
    /// the encoding grows and the caller must have made room (relocation).
    pub fn stamp_delete(&mut self, mvccid: MvccId) {
        self.del_id = Some(mvccid);
    }

    /// Record the previous-version log address on an updated version.
    pub fn set_prev_version(&mut self, addr: LogAddr) {
        self.prev_version = Some(addr);
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = Self::MIN_LEN;
        if self.ins_id.is_some() {
            len += 8;
        }
        if self.del_id.is_some() {
            len += 8;
        }
        if self.prev_version.is_some() {
            len += 8;
        }
        len
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.ins_id.is_some() {
            flags |= FLAG_INSID;
        }
        if self.del_id.is_some() {
            flags |= FLAG_DELID;
        }
        if self.prev_version.is_some() {
            flags |= FLAG_PREV_VERSION;
        }
        flags
    }

    /// Encode into `buf`, returning bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        let word = (self.repr_id as u32 & REPR_ID_MASK) | ((self.flags() as u32) << 24);
        buf[0..4].copy_from_slice(&word.to_le_bytes());
        buf[4..8].copy_from_slice(&self.chn.to_le_bytes());
        let mut at = 8;
        for field in [self.ins_id, self.del_id, self.prev_version].into_iter().flatten() {
            buf[at..at + 8].copy_from_slice(&field.to_le_bytes());
            at += 8;
        }
        at
    }

    /// Decode from the front of `buf`, returning the header and the number
    /// of bytes it occupied.
    pub fn read_from(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < Self::MIN_LEN {
            return Err(Error::Corrupted("record shorter than MVCC header".into()));
        }
        let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let flags = (word >> 24) as u8;
        if flags & !FLAG_ALL != 0 {
            return Err(Error::Corrupted(format!("unknown MVCC flag bits {:#04x}", flags)));
        }
        let chn = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut at = 8;
        let mut take = |on: bool| -> Result<Option<u64>> {
            if !on {
                return Ok(None);
            }
            if buf.len() < at + 8 {
                return Err(Error::Corrupted("truncated MVCC header field".into()));
            }
            let v = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
            at += 8;
            Ok(Some(v))
        };
        let ins_id = take(flags & FLAG_INSID != 0)?;
        let del_id = take(flags & FLAG_DELID != 0)?;
        let prev_version = take(flags & FLAG_PREV_VERSION != 0)?;
        Ok((
            MvccRecHeader {
                repr_id: (word & REPR_ID_MASK) as ReprId,
                chn,
                ins_id,
                del_id,
                prev_version,
            },
            at,
        ))
    }

    /// Header bytes followed by the attribute payload.
    pub fn compose(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len() + payload.len()];
        let n = self.write_to(&mut out);
        out[n..].copy_from_slice(payload);
        out
    }

    /// Split a stored record into its header and attribute payload.
    pub fn parse(record: &[u8]) -> Result<(Self, &[u8])> {
        let (header, n) = Self::read_from(record)?;
        Ok((header, &record[n..]))
    }
}

/// Per-page vacuum status ratchet: advances NONE → ONCE → UNKNOWN on each
/// delete and never regresses except by explicit reset (vacuum's job).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VacuumStatus {
    None = 0,
    Once = 1,
    Unknown = 2,
}

impl VacuumStatus {
    pub fn from_u8(val: u8) -> Self {
        match val & 0x03 {
            0 => VacuumStatus::None,
            1 => VacuumStatus::Once,
            _ => VacuumStatus::Unknown,
        }
    }

    pub fn advance(self) -> Self {
        match self {
            VacuumStatus::None => VacuumStatus::Once,
            VacuumStatus::Once | VacuumStatus::Unknown => VacuumStatus::Unknown,
        }
    }
}

/// Answer to "may this transaction delete the row?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatisfiesDelete {
    Ok,
    AlreadyDeleted,
}

/// Pluggable snapshot-visibility predicate. The transaction system owns
/// the real implementation; the heap only asks the two questions below.
pub trait Snapshot: Send + Sync {
    fn is_visible(&self, header: &MvccRecHeader) -> bool;
    fn can_delete(&self, header: &MvccRecHeader) -> SatisfiesDelete;
}

/// Horizon snapshot: everything committed at or below `horizon` is in the
/// past. Sufficient for single-writer tests and tooling.
#[derive(Debug, Clone, Copy)]
pub struct HorizonSnapshot {
    pub horizon: MvccId,
}

impl HorizonSnapshot {
    pub fn new(horizon: MvccId) -> Self {
        HorizonSnapshot { horizon }
    }
}

impl Snapshot for HorizonSnapshot {
    fn is_visible(&self, header: &MvccRecHeader) -> bool {
        if !header.is_versioned() {
            return true;
        }
        if header.insert_id() > self.horizon {
            return false;
        }
        let del = header.delete_id();
        del == NULL_MVCCID || del > self.horizon
    }

    fn can_delete(&self, header: &MvccRecHeader) -> SatisfiesDelete {
        if header.is_deleted() {
            SatisfiesDelete::AlreadyDeleted
        } else {
            SatisfiesDelete::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_header_layout_is_bit_exact() {
        let h = MvccRecHeader::for_insert(5, 0, 0x0102_0304_0506_0708, true);
        let mut buf = [0u8; MvccRecHeader::MAX_LEN];
        let n = h.write_to(&mut buf);
        assert_eq!(n, 16);
        // repr id 5 in the low 24 bits, FLAG_INSID in the top byte.
        assert_eq!(&buf[0..4], &[0x05, 0x00, 0x00, 0x01]);
        // chn 0.
        assert_eq!(&buf[4..8], &[0x00; 4]);
        // insert id little-endian.
        assert_eq!(&buf[8..16], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_non_versioned_header_is_minimal() {
        let h = MvccRecHeader::for_insert(1, 7, 42, false);
        assert_eq!(h.encoded_len(), MvccRecHeader::MIN_LEN);
        assert!(!h.is_versioned());
        let mut reserved = h;
        reserved.reserve_worst_case();
        assert_eq!(reserved, h, "non-versioned headers never grow");
    }

    #[test]
    fn test_reserved_header_stamps_delete_in_place() {
        let mut h = MvccRecHeader::for_insert(1, 0, 10, true);
        h.reserve_worst_case();
        let before = h.encoded_len();
        assert_eq!(before, MvccRecHeader::MAX_LEN);
        assert!(h.has_delete_room());
        assert!(!h.is_deleted());
        h.stamp_delete(11);
        assert!(h.is_deleted());
        assert_eq!(h.encoded_len(), before);
    }

    #[test]
    fn test_unreserved_delete_stamp_grows_header() {
        let mut h = MvccRecHeader::for_insert(1, 0, 10, true);
        assert!(!h.has_delete_room());
        let before = h.encoded_len();
        h.stamp_delete(11);
        assert_eq!(h.encoded_len(), before + 8);
    }

    #[test]
    fn test_compose_parse_roundtrip() {
        let mut h = MvccRecHeader::for_insert(9, 3, 77, true);
        h.reserve_worst_case();
        h.set_prev_version(1234);
        let record = h.compose(b"attribute bytes");
        let (parsed, payload) = MvccRecHeader::parse(&record).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(payload, b"attribute bytes");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MvccRecHeader::parse(&[1, 2, 3]).is_err());
        // Unknown flag bit set.
        let mut buf = [0u8; 8];
        buf[3] = 0x80;
        assert!(MvccRecHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_vacuum_ratchet_never_regresses() {
        let mut s = VacuumStatus::None;
        s = s.advance();
        assert_eq!(s, VacuumStatus::Once);
        s = s.advance();
        assert_eq!(s, VacuumStatus::Unknown);
        s = s.advance();
        assert_eq!(s, VacuumStatus::Unknown);
    }

    #[test]
    fn test_horizon_visibility() {
        let snap = HorizonSnapshot::new(10);
        let mut h = MvccRecHeader::for_insert(1, 0, 5, true);
        assert!(snap.is_visible(&h));
        h.stamp_delete(8);
        assert!(!snap.is_visible(&h), "deleted before the horizon");
        h.stamp_delete(15);
        assert!(snap.is_visible(&h), "delete is in the snapshot's future");
        let young = MvccRecHeader::for_insert(1, 0, 11, true);
        assert!(!snap.is_visible(&young));
        let plain = MvccRecHeader::for_insert(1, 0, 0, false);
        assert!(snap.is_visible(&plain));
    }
}
