//! The INSERT contract: initial inserts that materialise a fresh row in
//! its slot, and inserts chained behind a same-transaction DELETE whose
//! image stays in the copy until commit.

use crate::chain::{self, OpFlags, OpType};
use crate::disk::DiskResult;
use crate::interp::Program;
use crate::page::FixedPage;
use crate::rowcodec::{shrink, AttrWrite, CopyRow, HeaderBits, RowMut, VarRef};
use crate::{checksum, fault, RowId, TupError};

use super::{
    apply_defaults, check_not_null, fetch_fix_page, BaseRow, CopyAttrs, ExecCtx, ExecResult,
    TupKeyConf, TupKeyRequest,
};

pub(crate) fn execute(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
) -> Result<ExecResult, TupError> {
    let _ticket = ctx.frag.lock.write_key();
    let table = ctx.frag.table.clone();
    let with_disk = table.has_diskpart();

    // Build and populate the copy before anything is allocated, so a
    // schema failure leaves no trace.
    let mut copy = CopyRow::empty(&table, with_disk);
    {
        let mut hdr = copy.header_mut();
        let mut bits = HeaderBits::COPY_TUPLE | HeaderBits::ALLOC;
        if with_disk {
            bits |= HeaderBits::DISK_ALLOC | HeaderBits::DISK_INLINE;
        }
        hdr.set_bits(bits);
        if let Some(gci) = req.gci {
            hdr.set_gci(gci);
        }
    }
    let mut conf = TupKeyConf::default();
    {
        let mut attrs = CopyAttrs::new(&table, &mut copy, false);
        apply_defaults(&table, &mut attrs)?;
        let writes = if req.flags.interpreted {
            // an interpreted insert overlays only the final-update region
            let program = Program::parse(req.attrinfo)?;
            AttrWrite::parse_all(program.final_update)?
        } else {
            AttrWrite::parse_all(req.attrinfo)?
        };
        attrs.apply_writes(&writes)?;
        check_not_null(&table, &attrs.written, false)?;
        conf.log = std::mem::take(&mut attrs.log);
    }

    // Does the target slot already hold a row (insert behind a DELETE)?
    let existing = if req.flags.use_rowid {
        match ctx.frag.alloc.fix_map.realpid(req.rowid.page_no) {
            Some(_) => {
                let page = fetch_fix_page(ctx, req.rowid)?;
                let base = BaseRow::capture(&page, req.rowid, &table);
                (!base.bits.contains(HeaderBits::FREE)).then_some(base)
            }
            None => None,
        }
    } else {
        None
    };

    let op = ctx
        .arena
        .seize(OpType::Insert, req.rowid, req.trans, req.savepoint);
    let fail = |ctx: &mut ExecCtx<'_>, op| {
        chain::unprepare(ctx.arena, op);
        ctx.arena.release(op);
    };

    // Join the chain before any reservation: prepare establishes the
    // inherited accounting the reservations then add to.
    let base_op_ptr = match &existing {
        Some(base) => {
            if base.op_ptr == crate::RNIL {
                ctx.arena.release(op);
                return Err(fault!(crate::SeqError::AlreadyExists));
            }
            base.op_ptr
        }
        None => crate::RNIL,
    };
    if let Err(e) = chain::prepare(ctx.arena, op, base_op_ptr) {
        fail(ctx, op);
        return Err(e);
    }
    super::stamp_request(ctx.arena, op, req);

    // UNDO space for the Alloc record: the only call here that can
    // suspend, and nothing durable has happened yet.
    if with_disk {
        match ctx
            .disk
            .reserve_for_alloc(ctx.arena.get_mut(op), ctx.frag.logfile_group_id)
        {
            Ok(DiskResult::Ready(())) => {}
            Ok(DiskResult::Pending(token)) => {
                fail(ctx, op);
                return Ok(ExecResult::Suspended(token));
            }
            Err(e) => {
                fail(ctx, op);
                return Err(e);
            }
        }
    }

    match existing {
        Some(base) => insert_after_delete(ctx, req, op, base, copy, conf),
        None => initial_insert(ctx, req, op, copy, conf),
    }
}

/// A fresh row: allocate its slots and materialise the image in place,
/// ALLOC-marked until commit.
fn initial_insert(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
    op: crate::chain::OpRef,
    mut copy: CopyRow,
    mut conf: TupKeyConf,
) -> Result<ExecResult, TupError> {
    let table = ctx.frag.table.clone();
    copy.header_mut().set_tuple_version(1);
    let sizes = shrink(&table, &mut copy)?;

    let rowid = if req.flags.use_rowid {
        if let Err(e) = ctx.frag.alloc.alloc_fixed_at(req.rowid) {
            ctx.arena.release(op);
            return Err(e);
        }
        req.rowid
    } else {
        match ctx.frag.alloc.alloc_fixed() {
            Ok(r) => r,
            Err(e) => {
                ctx.arena.release(op);
                return Err(e);
            }
        }
    };

    // varpart slot, sized exactly to the shrunken image
    let mut var_ref = None;
    if sizes.mm > 0 {
        match ctx.frag.alloc.alloc_var(sizes.mm as u16) {
            Ok(vref) => var_ref = Some(vref),
            Err(e) => {
                let _ = ctx.frag.alloc.free_fixed(rowid);
                ctx.arena.release(op);
                return Err(e);
            }
        }
    }

    // disk location for the disk part
    let mut disk_ref = None;
    if sizes.dd > 0 {
        match ctx.disk.cache().prealloc(table.disk_var(), sizes.dd) {
            Ok(dref) => {
                disk_ref = Some(dref);
                let rec = ctx.arena.get_mut(op);
                rec.flags |= OpFlags::DISK_PREALLOCATED;
                rec.uncommitted_used_space = sizes.dd;
            }
            Err(e) => {
                if let Some(vref) = var_ref {
                    let _ = ctx.frag.alloc.free_var(vref);
                }
                let _ = ctx.frag.alloc.free_fixed(rowid);
                ctx.arena.release(op);
                return Err(e);
            }
        }
    }

    // stamp the part references into the copy's fixed part
    write_part_refs(&table, &mut copy, var_ref, disk_ref);

    // write the varpart content
    if let (Some(vref), true) = (var_ref, sizes.mm > 0) {
        let fix_bytes = table.fix_row_words as usize * 4;
        let var = copy.buf[fix_bytes..fix_bytes + sizes.mm as usize * 4].to_vec();
        if let Err(e) = ctx.frag.alloc.write_var(vref, &var) {
            let _ = ctx.frag.alloc.free_var(vref);
            let _ = ctx.frag.alloc.free_fixed(rowid);
            ctx.arena.release(op);
            return Err(e);
        }
    }

    // publish: the base slot gets the image, FREE cleared last
    {
        let page = fetch_fix_page(ctx, rowid)?;
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let slot = fixed_page.row_mut(rowid.page_idx);
        let fix_bytes = table.fix_row_words as usize * 4;
        slot[..fix_bytes].copy_from_slice(&copy.buf[..fix_bytes]);
        let mut row = RowMut(slot);
        let bits = (copy.header().bits() & !HeaderBits::COPY_TUPLE) & !HeaderBits::FREE;
        row.set_bits(bits);
        checksum::set(row.0, table.fix_row_words);

        let rec = ctx.arena.get_mut(op);
        rec.tuple_location = rowid;
        rec.tup_version = 1;
        rec.bits_before = HeaderBits::FREE;
        rec.sizes = sizes;
        rec.copy = Some(copy);
        let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
        chain::publish(ctx.arena, op, &mut row);
    }

    ctx.frag.note_changed_row();
    conf.rowid_created = Some(rowid);
    conf.op_ref = Some(op);
    fire_hooks(ctx, req, op, rowid, 0, 1, &mut conf)?;
    Ok(ExecResult::Confirm(conf))
}

/// Insert behind a same-transaction DELETE: the new image stays in the
/// copy; only the chain changes now. The checksum reset of the base row
/// is deferred until after publish at commit.
fn insert_after_delete(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
    op: crate::chain::OpRef,
    base: BaseRow,
    mut copy: CopyRow,
    mut conf: TupKeyConf,
) -> Result<ExecResult, TupError> {
    let table = ctx.frag.table.clone();
    let pred_version = ctx.arena.get(base.op_ptr).tup_version;
    let new_version = pred_version.wrapping_add(1);
    copy.header_mut().set_tuple_version(new_version);

    // keep the committed part references: commit reuses the slots
    let var_ref = base.var_ref(&table);
    let disk_ref = base.disk_ref(&table);
    write_part_refs(&table, &mut copy, var_ref, disk_ref);

    let sizes = match shrink(&table, &mut copy) {
        Ok(s) => s,
        Err(e) => {
            chain::unprepare(ctx.arena, op);
            ctx.arena.release(op);
            return Err(e);
        }
    };
    {
        let rec = ctx.arena.get_mut(op);
        rec.tup_version = new_version;
        rec.bits_before = base.bits;
        rec.sizes = sizes;
        rec.copy = Some(copy);
    }
    {
        let page = fetch_fix_page(ctx, req.rowid)?;
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let mut row = RowMut(fixed_page.row_mut(req.rowid.page_idx));
        chain::publish(ctx.arena, op, &mut row);
    }

    ctx.frag.note_changed_row();
    conf.op_ref = Some(op);
    fire_hooks(ctx, req, op, req.rowid, pred_version, new_version, &mut conf)?;
    Ok(ExecResult::Confirm(conf))
}

pub(crate) fn write_part_refs(
    table: &crate::schema::TableDescriptor,
    copy: &mut CopyRow,
    var_ref: Option<VarRef>,
    disk_ref: Option<crate::rowcodec::DiskRef>,
) {
    use byteorder::{ByteOrder, LittleEndian};
    let mut bits = copy.header().bits();
    if table.has_varpart() {
        let off = crate::rowcodec::var_ref_off(table);
        let vref = var_ref.unwrap_or(VarRef::NIL);
        LittleEndian::write_u32(&mut copy.buf[off..off + 4], vref.encode());
        if var_ref.is_some() {
            bits |= HeaderBits::VAR_PART;
        }
    }
    if table.has_diskpart() {
        let off = crate::rowcodec::disk_ref_off(table);
        disk_ref
            .unwrap_or(crate::rowcodec::DiskRef::NIL)
            .write(&mut copy.buf[off..off + 8]);
        if disk_ref.is_some() {
            bits |= HeaderBits::DISK_PART;
            if table.disk_var() {
                bits |= HeaderBits::DISK_VAR_PART;
            }
        }
    }
    copy.header_mut().set_bits(bits);
}

/// Ordered-index maintenance then immediate triggers; a failure aborts
/// the freshly published op.
pub(crate) fn fire_hooks(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
    op: crate::chain::OpRef,
    rowid: RowId,
    old_version: u16,
    new_version: u16,
    conf: &mut TupKeyConf,
) -> Result<(), TupError> {
    if req.flags.no_triggers {
        return Ok(());
    }
    let index_result = ctx
        .index
        .row_changed(ctx.frag.id, rowid, old_version, new_version);
    let trigger_result = index_result.and_then(|()| {
        ctx.triggers
            .fire(ctx.frag.id, req.op_type, rowid, req.flags.disable_fk)
    });
    match trigger_result {
        Ok(n) => {
            conf.triggers_fired = n;
            Ok(())
        }
        Err(e) => {
            log::debug!("hook failure, aborting op: {e}");
            super::abort::abort_published_op(ctx, op)?;
            conf.op_ref = None;
            Err(e)
        }
    }
}
