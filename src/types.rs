use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Page size used by the buffer collaborator (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Transaction-version identifier for multi-version visibility.
///
/// Monotonically increasing; `MvccId::NULL` (0) means "not stamped".
pub type MvccId = u64;

/// Reserved null MVCCID.
pub const NULL_MVCCID: MvccId = 0;

/// Representation (schema version) identifier within a class.
pub type ReprId = i32;

/// Cache coherency number: per-object version counter for client-side
/// cache invalidation. Distinct from MVCCID.
pub type Chn = i32;

/// Null cache coherency number.
pub const NULL_CHN: Chn = -1;

/// Recovery log sequence address.
pub type LogAddr = u64;

/// Reserved null log address.
pub const NULL_LOG_ADDR: LogAddr = 0;

/// Physical volume + page locator (VPID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Vpid {
    pub volid: i16,
    pub pageid: i32,
}

impl Vpid {
    pub const NULL: Vpid = Vpid { volid: -1, pageid: -1 };

    pub fn new(volid: i16, pageid: i32) -> Self {
        Vpid { volid, pageid }
    }

    pub fn is_null(&self) -> bool {
        self.pageid == -1
    }

    /// Serialized size in bytes (volid + pageid).
    pub const ENCODED_LEN: usize = 6;

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.volid.to_le_bytes());
        buf[2..6].copy_from_slice(&self.pageid.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Vpid {
            volid: i16::from_le_bytes([buf[0], buf[1]]),
            pageid: i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
        }
    }
}

impl std::fmt::Display for Vpid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}|{})", self.volid, self.pageid)
    }
}

/// Stable logical address of a record: volume, page, slot (OID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Oid {
    pub volid: i16,
    pub pageid: i32,
    pub slotid: u16,
}

impl Oid {
    pub const NULL: Oid = Oid { volid: -1, pageid: -1, slotid: 0 };

    pub fn new(volid: i16, pageid: i32, slotid: u16) -> Self {
        Oid { volid, pageid, slotid }
    }

    pub fn is_null(&self) -> bool {
        self.pageid == -1
    }

    pub fn vpid(&self) -> Vpid {
        Vpid::new(self.volid, self.pageid)
    }

    /// Serialized size in bytes (volid + pageid + slotid).
    pub const ENCODED_LEN: usize = 8;

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.volid.to_le_bytes());
        buf[2..6].copy_from_slice(&self.pageid.to_le_bytes());
        buf[6..8].copy_from_slice(&self.slotid.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Oid {
            volid: i16::from_le_bytes([buf[0], buf[1]]),
            pageid: i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            slotid: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}|{}|{})", self.volid, self.pageid, self.slotid)
    }
}

/// Class (schema owner) identifier. Classes are themselves heap objects,
/// so a class id is an object id.
pub type ClassId = Oid;

/// Heap file identifier: the owning file plus its header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Hfid {
    pub volid: i16,
    pub fileid: i32,
    /// Page id of the heap header page.
    pub hpgid: i32,
}

impl Hfid {
    pub const NULL: Hfid = Hfid { volid: -1, fileid: -1, hpgid: -1 };

    pub fn new(volid: i16, fileid: i32, hpgid: i32) -> Self {
        Hfid { volid, fileid, hpgid }
    }

    pub fn is_null(&self) -> bool {
        self.fileid == -1
    }

    /// VPID of the heap header page.
    pub fn header_vpid(&self) -> Vpid {
        Vpid::new(self.volid, self.hpgid)
    }
}

impl std::fmt::Display for Hfid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}|{}|{})", self.volid, self.fileid, self.hpgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpid_codec_roundtrip() {
        let vpid = Vpid::new(3, 0x1234_5678);
        let mut buf = [0u8; Vpid::ENCODED_LEN];
        vpid.write_to(&mut buf);
        assert_eq!(Vpid::read_from(&buf), vpid);
    }

    #[test]
    fn test_oid_codec_roundtrip() {
        let oid = Oid::new(-1, -1, 0);
        let mut buf = [0u8; Oid::ENCODED_LEN];
        oid.write_to(&mut buf);
        assert_eq!(Oid::read_from(&buf), oid);
        assert!(oid.is_null());

        let oid = Oid::new(2, 99, 7);
        oid.write_to(&mut buf);
        assert_eq!(Oid::read_from(&buf), oid);
        assert_eq!(oid.vpid(), Vpid::new(2, 99));
    }

    #[test]
    fn test_hfid_header_vpid() {
        let hfid = Hfid::new(0, 10, 42);
        assert_eq!(hfid.header_vpid(), Vpid::new(0, 42));
    }
}
