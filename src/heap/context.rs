//! Per-operation carrier for the record placement paths.
//!
//! One context describes one logical heap mutation. The placement code
//! threads it through the page-level steps and fills in the result OID,
//! so callers never touch pages or slots directly.

use crate::types::{ClassId, Hfid, MvccId, Oid, ReprId};

/// What the operation does. Record payloads are attribute bytes only; the
/// placement code composes and maintains the MVCC header.
#[derive(Debug, Clone)]
pub enum OperationKind {
    /// Store a new record and return its OID.
    Insert { payload: Vec<u8> },
    /// Reserve an OID now, deliver the record later.
    AssignAddress,
    /// Replace the record at `oid`. The OID never changes, however the
    /// body moves between pages.
    Update { oid: Oid, payload: Vec<u8> },
    /// Remove the record at `oid` (tombstone, or MVCC delete stamp).
    Delete { oid: Oid },
}

#[derive(Debug, Clone)]
pub struct OperationContext {
    pub hfid: Hfid,
    pub class_id: ClassId,
    /// Representation the payload was encoded under.
    pub repr_id: ReprId,
    /// Acting transaction's MVCCID. `None` runs the non-versioned path:
    /// headers carry no MVCC fields and deletes are physical.
    pub mvccid: Option<MvccId>,
    pub kind: OperationKind,
    /// Output: the OID created or affected.
    pub oid: Oid,
}

impl OperationContext {
    pub fn insert(
        hfid: Hfid,
        class_id: ClassId,
        repr_id: ReprId,
        mvccid: Option<MvccId>,
        payload: Vec<u8>,
    ) -> Self {
        OperationContext {
            hfid,
            class_id,
            repr_id,
            mvccid,
            kind: OperationKind::Insert { payload },
            oid: Oid::NULL,
        }
    }

    pub fn assign_address(hfid: Hfid, class_id: ClassId) -> Self {
        OperationContext {
            hfid,
            class_id,
            repr_id: 0,
            mvccid: None,
            kind: OperationKind::AssignAddress,
            oid: Oid::NULL,
        }
    }

    pub fn update(
        hfid: Hfid,
        class_id: ClassId,
        repr_id: ReprId,
        mvccid: Option<MvccId>,
        oid: Oid,
        payload: Vec<u8>,
    ) -> Self {
        OperationContext {
            hfid,
            class_id,
            repr_id,
            mvccid,
            kind: OperationKind::Update { oid, payload },
            oid: Oid::NULL,
        }
    }

    pub fn delete(hfid: Hfid, class_id: ClassId, mvccid: Option<MvccId>, oid: Oid) -> Self {
        OperationContext {
            hfid,
            class_id,
            repr_id: 0,
            mvccid,
            kind: OperationKind::Delete { oid },
            oid: Oid::NULL,
        }
    }
}
