//! Record placement: the slot-kind state machine behind insert, update,
//! and delete.
//!
//! A record's OID never changes once handed out. What moves is the body:
//! a Home slot holds it inline; when it outgrows its page the home slot
//! degenerates to a Relocation forward and the body lives in a Newhome
//! slot elsewhere; past page capacity it moves to an overflow chain behind
//! a BigOne forward. Updates and deletes walk these transitions in both
//! directions.
//!
//! Latch discipline: the home page is always latched first, any second
//! page only through a conditional attempt. When no second page can be
//! grabbed without waiting, the home latch is released, space is made, and
//! the operation re-reads the slot from scratch.

use tracing::debug;

use crate::error::{Error, Result, ScanCode, corrupted};
use crate::log::{LogRecordKind, RedoImage, SystemOp};
use crate::mvcc::MvccRecHeader;
use crate::page::{LatchWait, PageWriteGuard};
use crate::slotted::{RecordKind, SlottedPage};
use crate::types::{Hfid, MvccId, NULL_CHN, NULL_MVCCID, Oid, Vpid};

use super::HeapCore;
use super::alloc::{insertable, page_capacity};
use super::context::{OperationContext, OperationKind};

impl HeapCore {
    /// Run one logical heap mutation. Domain outcomes (missing OID,
    /// already-deleted row) come back as scan codes, not errors.
    pub(crate) fn execute(&self, ctx: &mut OperationContext) -> Result<ScanCode> {
        let kind = ctx.kind.clone();
        match kind {
            OperationKind::Insert { payload } => self.insert_record(ctx, &payload),
            OperationKind::AssignAddress => self.assign_address(ctx),
            OperationKind::Update { oid, payload } => match ctx.mvccid {
                Some(mvccid) => self.mvcc_update(ctx, oid, &payload, mvccid),
                None => self.update_record(ctx, oid, &payload),
            },
            OperationKind::Delete { oid } => match ctx.mvccid {
                Some(mvccid) => self.mvcc_delete_in(ctx.hfid, oid, mvccid),
                None => self.delete_record(ctx.hfid, oid),
            },
        }
    }

    fn insert_record(&self, ctx: &mut OperationContext, payload: &[u8]) -> Result<ScanCode> {
        let versioned = ctx.mvccid.is_some();
        let mvccid = ctx.mvccid.unwrap_or(NULL_MVCCID);
        let mut header = MvccRecHeader::for_insert(ctx.repr_id, 0, mvccid, versioned);
        let record = header.compose(payload);

        let op = self.log.begin_sysop();
        if record.len() > page_capacity() {
            // Overflow chains are stamped in place later, so the header is
            // reserved at worst case before the chain is written.
            header.reserve_worst_case();
            let big = header.compose(payload);
            let ovf_oid = self.overflow.insert(&op, self.overflow_volid(ctx.hfid)?, &big)?;
            let mut fwd = [0u8; Oid::ENCODED_LEN];
            ovf_oid.write_to(&mut fwd);
            ctx.oid = self.put_new_slot(
                ctx.hfid,
                RecordKind::BigOne,
                &fwd,
                &op,
                LogRecordKind::Insert,
                ctx.mvccid,
            )?;
        } else {
            let log_kind = if versioned { LogRecordKind::MvccInsert } else { LogRecordKind::Insert };
            ctx.oid =
                self.put_new_slot(ctx.hfid, RecordKind::Home, &record, &op, log_kind, ctx.mvccid)?;
        }
        self.stats_delta(ctx.hfid, 1, record.len() as i64, Some(&op))?;
        op.commit();
        debug!(heap = %ctx.hfid, oid = %ctx.oid, len = record.len(), "inserted record");
        Ok(ScanCode::Found)
    }

    /// Hand out a permanent OID with no content yet. The slot is delivered
    /// later through an update.
    fn assign_address(&self, ctx: &mut OperationContext) -> Result<ScanCode> {
        let op = self.log.begin_sysop();
        ctx.oid = self.put_new_slot(
            ctx.hfid,
            RecordKind::AssignAddress,
            &[],
            &op,
            LogRecordKind::Insert,
            None,
        )?;
        op.commit();
        Ok(ScanCode::Found)
    }

    /// Physical (non-versioned) update in place at `oid`.
    fn update_record(&self, ctx: &mut OperationContext, oid: Oid, payload: &[u8]) -> Result<ScanCode> {
        let home_vpid = oid.vpid();
        // The overflow volume never changes after create; reading it here
        // keeps the header page out of every home-latched section below.
        let ovf_volid = self.overflow_volid(ctx.hfid)?;
        let op = self.log.begin_sysop();

        loop {
            let Some(home) = self.fix_home(home_vpid)? else {
                return Ok(ScanCode::DoesNotExist);
            };
            let (slot_kind, old_bytes) = {
                let page = SlottedPage::new(home.data().as_slice());
                match page.read(oid.slotid) {
                    Some((k, d)) => (k, d.to_vec()),
                    None => return Ok(ScanCode::DoesNotExist),
                }
            };

            let old_chn = match slot_kind {
                RecordKind::AssignAddress => NULL_CHN,
                RecordKind::Home => MvccRecHeader::parse(&old_bytes)?.0.chn,
                RecordKind::Relocation => {
                    let fwd = Oid::read_from(&old_bytes);
                    match self.read_forward(fwd)? {
                        Some(bytes) => MvccRecHeader::parse(&bytes)?.0.chn,
                        None => corrupted!("dangling relocation at {}", oid),
                    }
                }
                RecordKind::BigOne => {
                    let fwd = Oid::read_from(&old_bytes);
                    self.overflow.mvcc_header(fwd)?.chn
                }
                RecordKind::Newhome => {
                    return Err(Error::InvalidOperation(format!(
                        "oid {} addresses a relocated body, not a record",
                        oid
                    )));
                }
                RecordKind::MarkDeleted | RecordKind::DeletedWillReuse => {
                    return Ok(ScanCode::DoesNotExist);
                }
            };
            let header = MvccRecHeader::for_insert(ctx.repr_id, old_chn.wrapping_add(1), 0, false);
            let record = header.compose(payload);
            let old_len = self.current_record_len(oid, slot_kind, &old_bytes)?;

            let done = match slot_kind {
                RecordKind::AssignAddress | RecordKind::Home => {
                    self.replace_home_body(ctx.hfid, ovf_volid, &op, oid, home, slot_kind, &record)?
                }
                RecordKind::Relocation => {
                    let fwd = Oid::read_from(&old_bytes);
                    self.replace_relocated_body(ctx.hfid, ovf_volid, &op, oid, home, fwd, &record)?
                }
                RecordKind::BigOne => {
                    let fwd = Oid::read_from(&old_bytes);
                    self.replace_big_body(ctx.hfid, &op, oid, home, fwd, &record)?
                }
                _ => unreachable!(),
            };
            if done {
                self.stats_delta(ctx.hfid, 0, record.len() as i64 - old_len as i64, Some(&op))?;
                op.commit();
                ctx.oid = oid;
                return Ok(ScanCode::Found);
            }
            // A second page was needed and could not be grabbed without
            // waiting: the home latch was released, retry from a fresh
            // read of the slot.
        }
    }

    /// MVCC update: the old version is stamped deleted, the new version is
    /// inserted at a fresh OID whose header points back at the logged old
    /// image. One crash-atomic scope covers all of it.
    fn mvcc_update(
        &self,
        ctx: &mut OperationContext,
        oid: Oid,
        payload: &[u8],
        mvccid: MvccId,
    ) -> Result<ScanCode> {
        let op = self.log.begin_sysop();

        let Some((site, site_kind, old_record)) = self.fetch_with_site(oid)? else {
            return Ok(ScanCode::DoesNotExist);
        };
        let (old_header, old_payload) = MvccRecHeader::parse(&old_record)?;
        if old_header.is_deleted() {
            return Ok(ScanCode::DoesNotExist);
        }

        // Log the superseded version before anything moves. The record's
        // address becomes the new version's previous-version pointer; the
        // undo image is the version a visibility walk reads back, and the
        // redo is the stamped body at its current site (for chains, the
        // head chunk only).
        let mut stamped = old_header;
        stamped.stamp_delete(mvccid);
        let mut stamped_bytes = stamped.compose(old_payload);
        let redo_slot_kind = match site_kind {
            RecordKind::BigOne => {
                stamped_bytes.truncate(crate::overflow::CHUNK_CAPACITY);
                RecordKind::Home
            }
            kind => kind,
        };
        let prev_addr = self.log.append(
            &op,
            LogRecordKind::MvccUpdate,
            RedoImage::Slot {
                vpid: site.vpid(),
                slot_id: site.slotid,
                kind: redo_slot_kind as u8,
                data: stamped_bytes,
            },
            Some(old_record.clone()),
        );

        let mut new_header =
            MvccRecHeader::for_insert(ctx.repr_id, old_header.chn.wrapping_add(1), mvccid, true);
        new_header.set_prev_version(prev_addr);
        let new_record = new_header.compose(payload);
        ctx.oid = if new_record.len() > page_capacity() {
            new_header.reserve_worst_case();
            let big = new_header.compose(payload);
            let ovf_oid = self.overflow.insert(&op, self.overflow_volid(ctx.hfid)?, &big)?;
            let mut fwd = [0u8; Oid::ENCODED_LEN];
            ovf_oid.write_to(&mut fwd);
            self.put_new_slot(
                ctx.hfid,
                RecordKind::BigOne,
                &fwd,
                &op,
                LogRecordKind::MvccInsert,
                Some(mvccid),
            )?
        } else {
            self.put_new_slot(
                ctx.hfid,
                RecordKind::Home,
                &new_record,
                &op,
                LogRecordKind::MvccInsert,
                Some(mvccid),
            )?
        };

        // Now stamp the old version physically.
        let code = self.mvcc_stamp_delete(ctx.hfid, oid, mvccid, &op)?;
        if code != ScanCode::Found {
            return Ok(code);
        }
        self.stats_delta(ctx.hfid, 0, new_record.len() as i64, Some(&op))?;
        op.commit();
        debug!(old = %oid, new = %ctx.oid, "mvcc update chained new version");
        Ok(ScanCode::Found)
    }

    /// Physical delete: the body is freed and the home slot survives as a
    /// reusable tombstone so the OID is never resurrected by accident.
    fn delete_record(&self, hfid: Hfid, oid: Oid) -> Result<ScanCode> {
        let home_vpid = oid.vpid();
        let op = self.log.begin_sysop();

        loop {
            let Some(mut home) = self.fix_home(home_vpid)? else {
                return Ok(ScanCode::DoesNotExist);
            };
            let (slot_kind, bytes) = {
                let page = SlottedPage::new(home.data().as_slice());
                match page.read(oid.slotid) {
                    Some((k, d)) => (k, d.to_vec()),
                    None => return Ok(ScanCode::DoesNotExist),
                }
            };
            let old_len = match slot_kind {
                RecordKind::MarkDeleted | RecordKind::DeletedWillReuse => {
                    return Ok(ScanCode::DoesNotExist);
                }
                RecordKind::Newhome => {
                    return Err(Error::InvalidOperation(format!(
                        "oid {} addresses a relocated body, not a record",
                        oid
                    )));
                }
                _ => self.current_record_len(oid, slot_kind, &bytes)?,
            };

            match slot_kind {
                RecordKind::Relocation => {
                    let fwd = Oid::read_from(&bytes);
                    // Forward pages only through a conditional grab; on
                    // contention the home latch goes first.
                    let Some(mut fwd_guard) =
                        self.buffer.fix_write(fwd.vpid(), LatchWait::NonBlocking)?
                    else {
                        drop(home);
                        continue;
                    };
                    let mut page = SlottedPage::new(fwd_guard.data_mut().as_mut_slice());
                    if page.delete(fwd.slotid, None).is_none() {
                        corrupted!("dangling relocation at {}", oid);
                    }
                    self.log.append(
                        &op,
                        LogRecordKind::DeleteNewhome,
                        RedoImage::SlotFreed { vpid: fwd.vpid(), slot_id: fwd.slotid, tombstone: 0 },
                        None,
                    );
                }
                RecordKind::BigOne => {
                    let fwd = Oid::read_from(&bytes);
                    self.overflow.delete(&op, fwd)?;
                }
                _ => {}
            }

            {
                let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
                page.delete(oid.slotid, Some(RecordKind::DeletedWillReuse));
            }
            self.log.append(
                &op,
                LogRecordKind::Delete,
                RedoImage::SlotFreed {
                    vpid: home_vpid,
                    slot_id: oid.slotid,
                    tombstone: RecordKind::DeletedWillReuse as u8,
                },
                None,
            );
            let space = insertable(&home);
            drop(home);
            self.bestspace.upsert(hfid, home_vpid, space);
            self.stats_delta(hfid, -1, -(old_len as i64), Some(&op))?;
            op.commit();
            return Ok(ScanCode::Found);
        }
    }

    /// MVCC delete: stamp the delete MVCCID on the current version and
    /// leave the body in place for concurrent snapshots and vacuum.
    pub(crate) fn mvcc_delete_in(&self, hfid: Hfid, oid: Oid, mvccid: MvccId) -> Result<ScanCode> {
        let op = self.log.begin_sysop();
        let code = self.mvcc_stamp_delete(hfid, oid, mvccid, &op)?;
        if code != ScanCode::Found {
            return Ok(code);
        }
        self.stats_delta(hfid, -1, 0, Some(&op))?;
        op.commit();
        Ok(code)
    }

    fn mvcc_stamp_delete(
        &self,
        hfid: Hfid,
        oid: Oid,
        mvccid: MvccId,
        op: &SystemOp,
    ) -> Result<ScanCode> {
        let home_vpid = oid.vpid();
        loop {
            let Some(mut home) = self.fix_home(home_vpid)? else {
                return Ok(ScanCode::DoesNotExist);
            };
            let (slot_kind, bytes) = {
                let page = SlottedPage::new(home.data().as_slice());
                match page.read(oid.slotid) {
                    Some((k, d)) => (k, d.to_vec()),
                    None => return Ok(ScanCode::DoesNotExist),
                }
            };

            match slot_kind {
                RecordKind::MarkDeleted | RecordKind::DeletedWillReuse
                | RecordKind::AssignAddress => {
                    return Ok(ScanCode::DoesNotExist);
                }
                RecordKind::Newhome => {
                    return Err(Error::InvalidOperation(format!(
                        "oid {} addresses a relocated body, not a record",
                        oid
                    )));
                }
                RecordKind::Home => {
                    let (mut header, payload) = MvccRecHeader::parse(&bytes)?;
                    if header.is_deleted() {
                        return Ok(ScanCode::DoesNotExist);
                    }
                    header.stamp_delete(mvccid);
                    let stamped = header.compose(payload);
                    let fits = {
                        let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
                        page.update(oid.slotid, &stamped).is_some()
                    };
                    if fits {
                        self.log.append(
                            op,
                            LogRecordKind::MvccDeleteHome,
                            RedoImage::Slot {
                                vpid: home_vpid,
                                slot_id: oid.slotid,
                                kind: RecordKind::Home as u8,
                                data: stamped,
                            },
                            Some(bytes),
                        );
                        self.note_mvcc_on(&mut home, mvccid, op)?;
                        return Ok(ScanCode::Found);
                    }
                    // No room to grow the header in place: the stamped
                    // body relocates and the home slot becomes a forward.
                    match self.grab_target(hfid, stamped.len(), home)? {
                        Some((mut home, mut target)) => {
                            let fwd_oid = self.insert_on(
                                &mut target,
                                RecordKind::Newhome,
                                &stamped,
                                op,
                                LogRecordKind::MvccDeleteNewhome,
                            )?;
                            self.note_mvcc_on(&mut target, mvccid, op)?;
                            drop(target);
                            let mut fwd = [0u8; Oid::ENCODED_LEN];
                            fwd_oid.write_to(&mut fwd);
                            {
                                let mut page =
                                    SlottedPage::new(home.data_mut().as_mut_slice());
                                if page.update(oid.slotid, &fwd).is_none()
                                    || page.set_kind(oid.slotid, RecordKind::Relocation).is_none()
                                {
                                    return Err(Error::Page {
                                        vpid: home_vpid,
                                        why: "home slot could not shrink to a forward",
                                    });
                                }
                            }
                            self.log.append(
                                op,
                                LogRecordKind::MvccDeleteHome,
                                RedoImage::Slot {
                                    vpid: home_vpid,
                                    slot_id: oid.slotid,
                                    kind: RecordKind::Relocation as u8,
                                    data: fwd.to_vec(),
                                },
                                Some(bytes),
                            );
                            self.note_mvcc_on(&mut home, mvccid, op)?;
                            return Ok(ScanCode::Found);
                        }
                        None => continue,
                    }
                }
                RecordKind::Relocation => {
                    let fwd = Oid::read_from(&bytes);
                    let Some(mut fwd_guard) =
                        self.buffer.fix_write(fwd.vpid(), LatchWait::NonBlocking)?
                    else {
                        drop(home);
                        continue;
                    };
                    let body = {
                        let page = SlottedPage::new(fwd_guard.data().as_slice());
                        match page.read(fwd.slotid) {
                            Some((RecordKind::Newhome, d)) => d.to_vec(),
                            _ => corrupted!("dangling relocation at {}", oid),
                        }
                    };
                    let (mut header, payload) = MvccRecHeader::parse(&body)?;
                    if header.is_deleted() {
                        return Ok(ScanCode::DoesNotExist);
                    }
                    header.stamp_delete(mvccid);
                    let stamped = header.compose(payload);
                    let fits = {
                        let mut page = SlottedPage::new(fwd_guard.data_mut().as_mut_slice());
                        page.update(fwd.slotid, &stamped).is_some()
                    };
                    if !fits {
                        // Even the relocated body has no room; move it
                        // again with both latches dropped first.
                        drop(fwd_guard);
                        drop(home);
                        return self.mvcc_stamp_relocate_again(hfid, oid, fwd, mvccid, op);
                    }
                    self.log.append(
                        op,
                        LogRecordKind::MvccDeleteNewhome,
                        RedoImage::Slot {
                            vpid: fwd.vpid(),
                            slot_id: fwd.slotid,
                            kind: RecordKind::Newhome as u8,
                            data: stamped,
                        },
                        Some(body),
                    );
                    self.note_mvcc_on(&mut fwd_guard, mvccid, op)?;
                    return Ok(ScanCode::Found);
                }
                RecordKind::BigOne => {
                    let fwd = Oid::read_from(&bytes);
                    let mut header = self.overflow.mvcc_header(fwd)?;
                    if header.is_deleted() {
                        return Ok(ScanCode::DoesNotExist);
                    }
                    header.stamp_delete(mvccid);
                    self.overflow.set_mvcc_header(op, fwd, &header)?;
                    self.note_mvcc_on(&mut home, mvccid, op)?;
                    return Ok(ScanCode::Found);
                }
            }
        }
    }

    /// Slow path of the relocated MVCC delete: the Newhome page is full,
    /// so the stamped body moves to a third page and the home forward is
    /// repointed.
    fn mvcc_stamp_relocate_again(
        &self,
        hfid: Hfid,
        oid: Oid,
        old_fwd: Oid,
        mvccid: MvccId,
        op: &SystemOp,
    ) -> Result<ScanCode> {
        loop {
            let Some(mut home) = self.fix_home(oid.vpid())? else {
                return Ok(ScanCode::DoesNotExist);
            };
            let bytes = {
                let page = SlottedPage::new(home.data().as_slice());
                match page.read(oid.slotid) {
                    Some((RecordKind::Relocation, d)) => d.to_vec(),
                    // The slot changed while unlatched; start over.
                    _ => {
                        drop(home);
                        return self.mvcc_stamp_delete(hfid, oid, mvccid, op);
                    }
                }
            };
            let fwd = Oid::read_from(&bytes);
            if fwd != old_fwd {
                drop(home);
                return self.mvcc_stamp_delete(hfid, oid, mvccid, op);
            }

            let Some(mut fwd_guard) = self.buffer.fix_write(fwd.vpid(), LatchWait::NonBlocking)?
            else {
                drop(home);
                continue;
            };
            let body = {
                let page = SlottedPage::new(fwd_guard.data().as_slice());
                match page.read(fwd.slotid) {
                    Some((RecordKind::Newhome, d)) => d.to_vec(),
                    _ => corrupted!("dangling relocation at {}", oid),
                }
            };
            let (mut header, payload) = MvccRecHeader::parse(&body)?;
            header.stamp_delete(mvccid);
            let stamped = header.compose(payload);

            let target = self.probe_bestspace(
                hfid,
                stamped.len(),
                stamped.len(),
                Some(oid.vpid()),
            );
            let Some(mut target) = target else {
                drop(fwd_guard);
                drop(home);
                let fresh = self.allocate_page(hfid)?;
                debug!(page = %fresh, "allocated page for relocated delete stamp");
                continue;
            };

            let new_fwd_oid = self.insert_on(
                &mut target,
                RecordKind::Newhome,
                &stamped,
                op,
                LogRecordKind::MvccDeleteNewhome,
            )?;
            self.note_mvcc_on(&mut target, mvccid, op)?;
            drop(target);

            {
                let mut page = SlottedPage::new(fwd_guard.data_mut().as_mut_slice());
                page.delete(fwd.slotid, None);
            }
            self.log.append(
                op,
                LogRecordKind::DeleteNewhome,
                RedoImage::SlotFreed { vpid: fwd.vpid(), slot_id: fwd.slotid, tombstone: 0 },
                None,
            );
            drop(fwd_guard);

            let mut fwd_bytes = [0u8; Oid::ENCODED_LEN];
            new_fwd_oid.write_to(&mut fwd_bytes);
            {
                let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
                if page.update(oid.slotid, &fwd_bytes).is_none() {
                    return Err(Error::Page {
                        vpid: oid.vpid(),
                        why: "forward slot rewrite failed",
                    });
                }
            }
            self.log.append(
                op,
                LogRecordKind::MvccDeleteHome,
                RedoImage::Slot {
                    vpid: oid.vpid(),
                    slot_id: oid.slotid,
                    kind: RecordKind::Relocation as u8,
                    data: fwd_bytes.to_vec(),
                },
                Some(bytes),
            );
            self.note_mvcc_on(&mut home, mvccid, op)?;
            return Ok(ScanCode::Found);
        }
    }

    // ---- body replacement used by the physical update path ----

    /// Replace the body of a Home (or undelivered AssignAddress) slot.
    /// Returns false when a relocation target was needed and the home
    /// latch had to be released.
    fn replace_home_body(
        &self,
        hfid: Hfid,
        ovf_volid: i16,
        op: &SystemOp,
        oid: Oid,
        mut home: PageWriteGuard,
        slot_kind: RecordKind,
        record: &[u8],
    ) -> Result<bool> {
        let home_vpid = oid.vpid();
        if record.len() > page_capacity() {
            // Home -> BigOne.
            let mut header = MvccRecHeader::parse(record)?.0;
            header.reserve_worst_case();
            let payload = MvccRecHeader::parse(record)?.1.to_vec();
            let big = header.compose(&payload);
            let ovf_oid = self.overflow.insert(op, ovf_volid, &big)?;
            let mut fwd = [0u8; Oid::ENCODED_LEN];
            ovf_oid.write_to(&mut fwd);
            let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
            if page.update(oid.slotid, &fwd).is_none()
                || page.set_kind(oid.slotid, RecordKind::BigOne).is_none()
            {
                return Err(Error::Page { vpid: home_vpid, why: "forward slot rewrite failed" });
            }
            self.log.append(
                op,
                LogRecordKind::Update,
                RedoImage::Slot {
                    vpid: home_vpid,
                    slot_id: oid.slotid,
                    kind: RecordKind::BigOne as u8,
                    data: fwd.to_vec(),
                },
                None,
            );
            return Ok(true);
        }

        let updated = {
            let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
            let ok = page.update(oid.slotid, record).is_some();
            if ok && slot_kind == RecordKind::AssignAddress {
                page.set_kind(oid.slotid, RecordKind::Home);
            }
            ok
        };
        if updated {
            self.log.append(
                op,
                LogRecordKind::Update,
                RedoImage::Slot {
                    vpid: home_vpid,
                    slot_id: oid.slotid,
                    kind: RecordKind::Home as u8,
                    data: record.to_vec(),
                },
                None,
            );
            let space = insertable(&home);
            drop(home);
            self.bestspace.upsert(hfid, home_vpid, space);
            return Ok(true);
        }

        // Home -> Relocation.
        match self.grab_target(hfid, record.len(), home)? {
            None => Ok(false),
            Some((mut home, mut target)) => {
                let fwd_oid = self.insert_on(
                    &mut target,
                    RecordKind::Newhome,
                    record,
                    op,
                    LogRecordKind::InsertNewhome,
                )?;
                drop(target);
                let mut fwd = [0u8; Oid::ENCODED_LEN];
                fwd_oid.write_to(&mut fwd);
                let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
                if page.update(oid.slotid, &fwd).is_none()
                    || page.set_kind(oid.slotid, RecordKind::Relocation).is_none()
                {
                    return Err(Error::Page {
                        vpid: home_vpid,
                        why: "home slot could not shrink to a forward",
                    });
                }
                self.log.append(
                    op,
                    LogRecordKind::Update,
                    RedoImage::Slot {
                        vpid: home_vpid,
                        slot_id: oid.slotid,
                        kind: RecordKind::Relocation as u8,
                        data: fwd.to_vec(),
                    },
                    None,
                );
                Ok(true)
            }
        }
    }

    /// Replace the body behind a Relocation forward. Collapses back to a
    /// plain Home record whenever the new body fits the home page again.
    fn replace_relocated_body(
        &self,
        hfid: Hfid,
        ovf_volid: i16,
        op: &SystemOp,
        oid: Oid,
        mut home: PageWriteGuard,
        fwd: Oid,
        record: &[u8],
    ) -> Result<bool> {
        let home_vpid = oid.vpid();
        // Every branch below touches the newhome page, so it is grabbed up
        // front through a conditional attempt. Nothing is mutated before
        // both latches are held; on contention the caller retries with a
        // fresh read of the slot.
        let Some(mut fwd_guard) = self.buffer.fix_write(fwd.vpid(), LatchWait::NonBlocking)?
        else {
            drop(home);
            return Ok(false);
        };

        if record.len() > page_capacity() {
            // Relocation -> BigOne: the newhome body is dropped and the
            // home forward repoints into overflow.
            let mut header = MvccRecHeader::parse(record)?.0;
            header.reserve_worst_case();
            let payload = MvccRecHeader::parse(record)?.1.to_vec();
            let big = header.compose(&payload);
            let ovf_oid = self.overflow.insert(op, ovf_volid, &big)?;
            let mut fwd_bytes = [0u8; Oid::ENCODED_LEN];
            ovf_oid.write_to(&mut fwd_bytes);

            {
                let mut page = SlottedPage::new(fwd_guard.data_mut().as_mut_slice());
                page.delete(fwd.slotid, None);
            }
            self.log.append(
                op,
                LogRecordKind::DeleteNewhome,
                RedoImage::SlotFreed { vpid: fwd.vpid(), slot_id: fwd.slotid, tombstone: 0 },
                None,
            );
            drop(fwd_guard);

            let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
            if page.update(oid.slotid, &fwd_bytes).is_none()
                || page.set_kind(oid.slotid, RecordKind::BigOne).is_none()
            {
                return Err(Error::Page { vpid: home_vpid, why: "forward slot rewrite failed" });
            }
            self.log.append(
                op,
                LogRecordKind::Update,
                RedoImage::Slot {
                    vpid: home_vpid,
                    slot_id: oid.slotid,
                    kind: RecordKind::BigOne as u8,
                    data: fwd_bytes.to_vec(),
                },
                None,
            );
            return Ok(true);
        }

        // Try collapsing home first: fits when the home page can grow the
        // 8-byte forward back into a full record.
        let collapsed = {
            let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
            let ok = page.update(oid.slotid, record).is_some();
            if ok {
                page.set_kind(oid.slotid, RecordKind::Home);
            }
            ok
        };
        if collapsed {
            self.log.append(
                op,
                LogRecordKind::Update,
                RedoImage::Slot {
                    vpid: home_vpid,
                    slot_id: oid.slotid,
                    kind: RecordKind::Home as u8,
                    data: record.to_vec(),
                },
                None,
            );
            {
                let mut page = SlottedPage::new(fwd_guard.data_mut().as_mut_slice());
                page.delete(fwd.slotid, None);
            }
            self.log.append(
                op,
                LogRecordKind::DeleteNewhome,
                RedoImage::SlotFreed { vpid: fwd.vpid(), slot_id: fwd.slotid, tombstone: 0 },
                None,
            );
            return Ok(true);
        }

        // Update the newhome in place when it fits there.
        let fits = {
            let mut page = SlottedPage::new(fwd_guard.data_mut().as_mut_slice());
            page.update(fwd.slotid, record).is_some()
        };
        if fits {
            self.log.append(
                op,
                LogRecordKind::Update,
                RedoImage::Slot {
                    vpid: fwd.vpid(),
                    slot_id: fwd.slotid,
                    kind: RecordKind::Newhome as u8,
                    data: record.to_vec(),
                },
                None,
            );
            return Ok(true);
        }

        // Move the body to a third page; new target is written before the
        // old body is removed.
        let target = self.probe_bestspace(hfid, record.len(), record.len(), Some(home_vpid));
        let Some(mut target) = target else {
            drop(fwd_guard);
            drop(home);
            let fresh = self.allocate_page(hfid)?;
            debug!(page = %fresh, "allocated page for relocated body");
            return Ok(false);
        };
        let new_fwd_oid =
            self.insert_on(&mut target, RecordKind::Newhome, record, op, LogRecordKind::InsertNewhome)?;
        drop(target);

        {
            let mut page = SlottedPage::new(fwd_guard.data_mut().as_mut_slice());
            page.delete(fwd.slotid, None);
        }
        self.log.append(
            op,
            LogRecordKind::DeleteNewhome,
            RedoImage::SlotFreed { vpid: fwd.vpid(), slot_id: fwd.slotid, tombstone: 0 },
            None,
        );
        drop(fwd_guard);

        let mut fwd_bytes = [0u8; Oid::ENCODED_LEN];
        new_fwd_oid.write_to(&mut fwd_bytes);
        {
            let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
            if page.update(oid.slotid, &fwd_bytes).is_none() {
                return Err(Error::Page { vpid: home_vpid, why: "forward slot rewrite failed" });
            }
        }
        self.log.append(
            op,
            LogRecordKind::Update,
            RedoImage::Slot {
                vpid: home_vpid,
                slot_id: oid.slotid,
                kind: RecordKind::Relocation as u8,
                data: fwd_bytes.to_vec(),
            },
            None,
        );
        Ok(true)
    }

    /// Replace the body behind a BigOne forward.
    fn replace_big_body(
        &self,
        hfid: Hfid,
        op: &SystemOp,
        oid: Oid,
        mut home: PageWriteGuard,
        fwd: Oid,
        record: &[u8],
    ) -> Result<bool> {
        let home_vpid = oid.vpid();
        if record.len() > page_capacity() {
            // Still big: rewrite the chain, forward OID unchanged.
            let mut header = MvccRecHeader::parse(record)?.0;
            header.reserve_worst_case();
            let payload = MvccRecHeader::parse(record)?.1.to_vec();
            self.overflow.update(op, fwd, &header.compose(&payload))?;
            return Ok(true);
        }

        // Shrunk below a page: bring it back inline.
        let back_inline = {
            let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
            let ok = page.update(oid.slotid, record).is_some();
            if ok {
                page.set_kind(oid.slotid, RecordKind::Home);
            }
            ok
        };
        if back_inline {
            self.log.append(
                op,
                LogRecordKind::Update,
                RedoImage::Slot {
                    vpid: home_vpid,
                    slot_id: oid.slotid,
                    kind: RecordKind::Home as u8,
                    data: record.to_vec(),
                },
                None,
            );
            self.overflow.delete(op, fwd)?;
            return Ok(true);
        }

        // Home page cannot take it: BigOne -> Relocation.
        match self.grab_target(hfid, record.len(), home)? {
            None => Ok(false),
            Some((mut home, mut target)) => {
                let new_fwd_oid = self.insert_on(
                    &mut target,
                    RecordKind::Newhome,
                    record,
                    op,
                    LogRecordKind::InsertNewhome,
                )?;
                drop(target);
                let mut fwd_bytes = [0u8; Oid::ENCODED_LEN];
                new_fwd_oid.write_to(&mut fwd_bytes);
                {
                    let mut page = SlottedPage::new(home.data_mut().as_mut_slice());
                    if page.update(oid.slotid, &fwd_bytes).is_none()
                        || page.set_kind(oid.slotid, RecordKind::Relocation).is_none()
                    {
                        return Err(Error::Page {
                            vpid: home_vpid,
                            why: "forward slot rewrite failed",
                        });
                    }
                }
                self.log.append(
                    op,
                    LogRecordKind::Update,
                    RedoImage::Slot {
                        vpid: home_vpid,
                        slot_id: oid.slotid,
                        kind: RecordKind::Relocation as u8,
                        data: fwd_bytes.to_vec(),
                    },
                    None,
                );
                self.overflow.delete(op, fwd)?;
                Ok(true)
            }
        }
    }

    // ---- shared plumbing ----

    /// Fix the home page for writing; `None` when the page is gone.
    fn fix_home(&self, vpid: Vpid) -> Result<Option<PageWriteGuard>> {
        match self.buffer.fix_write_blocking(vpid) {
            Ok(guard) => Ok(Some(guard)),
            Err(Error::Page { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Conditionally grab a relocation target while `home` stays latched.
    /// On failure the home latch is released, a page with room is made
    /// available, and `None` tells the caller to retry from the top.
    fn grab_target(
        &self,
        hfid: Hfid,
        needed: usize,
        home: PageWriteGuard,
    ) -> Result<Option<(PageWriteGuard, PageWriteGuard)>> {
        let home_vpid = home.vpid();
        if let Some(target) = self.probe_bestspace(hfid, needed, needed, Some(home_vpid)) {
            return Ok(Some((home, target)));
        }
        drop(home);
        // Make room while holding nothing, then let the caller re-read.
        let guard = self.acquire_insert_page(hfid, needed)?;
        let vpid = guard.vpid();
        let space = insertable(&guard);
        drop(guard);
        self.bestspace.upsert(hfid, vpid, space);
        Ok(None)
    }

    /// Insert a record on an already latched page and log it.
    fn insert_on(
        &self,
        guard: &mut PageWriteGuard,
        kind: RecordKind,
        bytes: &[u8],
        op: &SystemOp,
        log_kind: LogRecordKind,
    ) -> Result<Oid> {
        let vpid = guard.vpid();
        let slot = {
            let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
            page.insert(kind, bytes)
        };
        let Some(slot) = slot else {
            return Err(Error::Page { vpid, why: "insert on verified page failed" });
        };
        self.log.append(
            op,
            log_kind,
            RedoImage::Slot { vpid, slot_id: slot, kind: kind as u8, data: bytes.to_vec() },
            None,
        );
        Ok(Oid::new(vpid.volid, vpid.pageid, slot))
    }

    /// Find a page, insert, maintain the chain's MVCC bookkeeping, release
    /// and refresh the space cache.
    fn put_new_slot(
        &self,
        hfid: Hfid,
        kind: RecordKind,
        bytes: &[u8],
        op: &SystemOp,
        log_kind: LogRecordKind,
        mvccid: Option<MvccId>,
    ) -> Result<Oid> {
        loop {
            let mut guard = self.acquire_insert_page(hfid, bytes.len())?;
            let vpid = guard.vpid();
            let slot = {
                let mut page = SlottedPage::new(guard.data_mut().as_mut_slice());
                page.insert(kind, bytes)
            };
            let Some(slot) = slot else {
                // Lost the space between verification and insert.
                continue;
            };
            self.log.append(
                op,
                log_kind,
                RedoImage::Slot { vpid, slot_id: slot, kind: kind as u8, data: bytes.to_vec() },
                None,
            );
            if let Some(mvccid) = mvccid {
                self.note_mvcc_on(&mut guard, mvccid, op)?;
            }
            let space = insertable(&guard);
            drop(guard);
            self.bestspace.upsert(hfid, vpid, space);
            return Ok(Oid::new(vpid.volid, vpid.pageid, slot));
        }
    }

    /// Bump the page's MVCC watermark and vacuum ratchet.
    fn note_mvcc_on(&self, guard: &mut PageWriteGuard, mvccid: MvccId, op: &SystemOp) -> Result<()> {
        let vpid = guard.vpid();
        let mut chain = self.read_chain_on(guard.data().as_slice(), vpid)?;
        chain.note_mvcc_op(mvccid);
        self.write_chain_on(guard, &chain, Some(op))
    }

    /// Resolve the site actually holding the record body: the OID itself
    /// for Home records, the Newhome OID behind a Relocation, or the chain
    /// head behind a BigOne. Returns the site, the slot kind stored there,
    /// and the raw record bytes.
    pub(crate) fn fetch_with_site(&self, oid: Oid) -> Result<Option<(Oid, RecordKind, Vec<u8>)>> {
        let guard = match self.buffer.fix_read(oid.vpid()) {
            Ok(guard) => guard,
            Err(Error::Page { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let page = SlottedPage::new(guard.data().as_slice());
        let Some((kind, bytes)) = page.read(oid.slotid) else {
            return Ok(None);
        };
        match kind {
            RecordKind::Home => Ok(Some((oid, RecordKind::Home, bytes.to_vec()))),
            RecordKind::Relocation => {
                let fwd = Oid::read_from(bytes);
                match self.read_forward(fwd)? {
                    Some(body) => Ok(Some((fwd, RecordKind::Newhome, body))),
                    None => corrupted!("dangling relocation at {}", oid),
                }
            }
            RecordKind::BigOne => {
                let fwd = Oid::read_from(bytes);
                Ok(Some((fwd, RecordKind::BigOne, self.overflow.get(fwd)?)))
            }
            RecordKind::AssignAddress
            | RecordKind::Newhome
            | RecordKind::MarkDeleted
            | RecordKind::DeletedWillReuse => Ok(None),
        }
    }

    /// Latest raw record bytes (MVCC header included) behind an OID, with
    /// forwards resolved. `None` for missing, pending, and tombstoned
    /// slots.
    pub(crate) fn fetch(&self, oid: Oid) -> Result<Option<Vec<u8>>> {
        Ok(self.fetch_with_site(oid)?.map(|(_, _, bytes)| bytes))
    }

    pub(crate) fn read_forward(&self, fwd: Oid) -> Result<Option<Vec<u8>>> {
        let guard = self.buffer.fix_read(fwd.vpid())?;
        let page = SlottedPage::new(guard.data().as_slice());
        match page.read(fwd.slotid) {
            Some((RecordKind::Newhome, bytes)) => Ok(Some(bytes.to_vec())),
            _ => Ok(None),
        }
    }

    fn current_record_len(&self, oid: Oid, kind: RecordKind, bytes: &[u8]) -> Result<usize> {
        match kind {
            RecordKind::Home | RecordKind::Newhome => Ok(bytes.len()),
            RecordKind::AssignAddress => Ok(0),
            RecordKind::Relocation => {
                let fwd = Oid::read_from(bytes);
                match self.read_forward(fwd)? {
                    Some(body) => Ok(body.len()),
                    None => corrupted!("dangling relocation at {}", oid),
                }
            }
            RecordKind::BigOne => {
                let fwd = Oid::read_from(bytes);
                Ok(self.overflow.get(fwd)?.len())
            }
            RecordKind::MarkDeleted | RecordKind::DeletedWillReuse => Ok(0),
        }
    }

    /// Header stats estimates, maintained as logged deltas.
    pub(crate) fn stats_delta(
        &self,
        hfid: Hfid,
        d_recs: i64,
        d_reclen: i64,
        op: Option<&SystemOp>,
    ) -> Result<()> {
        if d_recs == 0 && d_reclen == 0 {
            return Ok(());
        }
        let mut guard = self.buffer.fix_write_blocking(hfid.header_vpid())?;
        let mut header = {
            let page = SlottedPage::new(guard.data().as_slice());
            match page.read(crate::slotted::HEADER_CHAIN_SLOT) {
                Some((_, bytes)) => super::header::HeapHeader::decode(bytes)?,
                None => corrupted!("heap {} header page has no header record", hfid),
            }
        };
        header.num_recs = header.num_recs.saturating_add_signed(d_recs);
        header.sum_reclen = header.sum_reclen.saturating_add_signed(d_reclen);
        self.write_header_on(&mut guard, &header, op)
    }

}
