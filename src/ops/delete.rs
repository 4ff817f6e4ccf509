//! The DELETE and REFRESH contracts.

use crate::chain::{self, OpType};
use crate::disk::DiskResult;
use crate::error::ErrorKind;
use crate::fragment::KeepEntry;
use crate::page::FixedPage;
use crate::rowcodec::{expand, shrink, AttrWrite, HeaderBits, RowMut, RowRef};
use crate::{checksum, fault, TupError, RNIL};

use super::{
    check_not_null, fetch_fix_page, BaseRow, CopyAttrs, ExecCtx, ExecResult, TupKeyConf,
    TupKeyRequest,
};
use super::insert::fire_hooks;

pub(crate) fn execute_delete(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
) -> Result<ExecResult, TupError> {
    let _ticket = ctx.frag.lock.write_key();
    let table = ctx.frag.table.clone();
    let page = fetch_fix_page(ctx, req.rowid)?;

    let base = BaseRow::capture(&page, req.rowid, &table);
    if base.bits.contains(HeaderBits::FREE) {
        return Err(fault!(ErrorKind::TupleNotFound));
    }
    checksum::verify(
        &base.fixed,
        table.fix_row_words,
        ctx.opts.corrupt_policy,
        req.rowid,
    )?;

    let head = base.op_ptr;
    let op = ctx
        .arena
        .seize(OpType::Delete, req.rowid, req.trans, req.savepoint);
    if let Err(e) = chain::prepare(ctx.arena, op, head) {
        chain::unprepare(ctx.arena, op);
        ctx.arena.release(op);
        return Err(e);
    }
    super::stamp_request(ctx.arena, op, req);

    // the copy carries the pre-delete state to commit and the keep list
    let (mut copy, pred_version, pred_dd) = {
        let r: Result<_, TupError> = (|| {
            if head == RNIL {
                let var_bytes = match base.var_ref(&table) {
                    Some(vref) => Some(ctx.frag.alloc.read_var(vref)?),
                    None => None,
                };
                let copy = expand(
                    &table,
                    &base.fixed,
                    var_bytes.as_deref(),
                    None,
                    table.has_diskpart(),
                )?;
                let version = RowRef(&base.fixed).tuple_version();
                Ok((copy, version, None))
            } else {
                let rec = ctx.arena.get(head);
                let pred_copy = rec
                    .copy
                    .as_ref()
                    .ok_or_else(|| fault!(ErrorKind::NoCopyTupleMemory))?;
                let sizes = pred_copy
                    .packed
                    .ok_or_else(|| fault!(ErrorKind::NoCopyTupleMemory))?;
                let (fixed, var, disk) = crate::rowcodec::packed_parts(&table, pred_copy, sizes);
                let copy = expand(&table, fixed, var, disk, table.has_diskpart())?;
                Ok((copy, rec.tup_version, Some(sizes.dd)))
            }
        })();
        match r {
            Ok(v) => v,
            Err(e) => {
                chain::unprepare(ctx.arena, op);
                ctx.arena.release(op);
                return Err(e);
            }
        }
    };

    // a delete inherits its predecessor's version; no bump
    copy.header_mut().set_tuple_version(pred_version);

    // UNDO space from the existing row's disk length
    if base.bits.contains(HeaderBits::DISK_PART) && ctx.arena.get(op).undo_buffer_space == 0 {
        let existing_dd =
            pred_dd.unwrap_or(table.disk_fix_words + table.max_disk_varpart_words);
        match ctx.disk.reserve_for_delete(
            ctx.arena.get_mut(op),
            ctx.frag.logfile_group_id,
            existing_dd,
        ) {
            Ok(DiskResult::Ready(())) => {}
            Ok(DiskResult::Pending(token)) => {
                chain::unprepare(ctx.arena, op);
                ctx.arena.release(op);
                return Ok(ExecResult::Suspended(token));
            }
            Err(e) => {
                chain::unprepare(ctx.arena, op);
                ctx.arena.release(op);
                return Err(e);
            }
        }
    }

    let sizes = match shrink(&table, &mut copy) {
        Ok(s) => s,
        Err(e) => {
            chain::unprepare(ctx.arena, op);
            ctx.arena.release(op);
            return Err(e);
        }
    };

    // checkpoint interaction: rows still ahead of the scan park their
    // pre-delete image before LCP_SKIP goes up
    let mut new_bits = base.bits;
    if ctx.frag.lcp_covers(req.rowid) && !base.bits.contains(HeaderBits::LCP_SKIP) {
        let mut image = base.fixed.clone();
        if let Some(vref) = base.var_ref(&table) {
            image.extend_from_slice(&ctx.frag.alloc.read_var(vref)?);
        }
        ctx.frag.push_keep_entry(KeepEntry {
            rowid: req.rowid,
            image,
        });
        new_bits |= HeaderBits::LCP_SKIP;
    }

    {
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        {
            let mut row = RowMut(fixed_page.row_mut(req.rowid.page_idx));
            if new_bits != base.bits {
                row.set_bits(new_bits);
                checksum::update(row.0, base.bits.bits(), new_bits.bits());
            }
        }
        let rec = ctx.arena.get_mut(op);
        rec.tup_version = pred_version;
        rec.bits_before = base.bits;
        rec.gci_before = RowRef(&base.fixed).gci();
        rec.sizes = sizes;
        rec.copy = Some(copy);
        let mut row = RowMut(fixed_page.row_mut(req.rowid.page_idx));
        chain::publish(ctx.arena, op, &mut row);
    }
    ctx.frag.note_changed_row();

    let mut conf = TupKeyConf::default();
    conf.op_ref = Some(op);
    fire_hooks(ctx, req, op, req.rowid, pred_version, pred_version, &mut conf)?;
    Ok(ExecResult::Confirm(conf))
}

/// REFRESH: a delete-then-insert collapsed into one chained op, run with
/// exclusive fragment access during node recovery. A refresh of a row
/// that does not exist materialises it from the primary key alone.
pub(crate) fn execute_refresh(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
) -> Result<ExecResult, TupError> {
    let table = ctx.frag.table.clone();

    let exists = match ctx.frag.alloc.fix_map.realpid(req.rowid.page_no) {
        None => false,
        Some(_) => {
            let page = fetch_fix_page(ctx, req.rowid)?;
            let base = BaseRow::capture(&page, req.rowid, &table);
            !base.bits.contains(HeaderBits::FREE)
        }
    };

    if !exists {
        // refresh-of-nothing: an insert that only needs the primary key
        let ticket = ctx.frag.lock.write_key();
        let excl = ticket.upgrade();
        let mut copy = crate::rowcodec::CopyRow::empty(&table, false);
        {
            let mut hdr = copy.header_mut();
            hdr.set_bits(HeaderBits::COPY_TUPLE | HeaderBits::ALLOC);
            hdr.set_tuple_version(1);
            if let Some(gci) = req.gci {
                hdr.set_gci(gci);
            }
        }
        let writes = AttrWrite::parse_all(req.attrinfo)?;
        {
            let mut attrs = CopyAttrs::new(&table, &mut copy, false);
            attrs.apply_writes(&writes)?;
            check_not_null(&table, &attrs.written, true)?;
        }
        let sizes = shrink(&table, &mut copy)?;

        ctx.frag.alloc.alloc_fixed_at(req.rowid)?;
        let mut var_ref = None;
        if sizes.mm > 0 {
            let vref = ctx.frag.alloc.alloc_var(sizes.mm as u16)?;
            let fix_bytes = table.fix_row_words as usize * 4;
            ctx.frag
                .alloc
                .write_var(vref, &copy.buf[fix_bytes..fix_bytes + sizes.mm as usize * 4])?;
            var_ref = Some(vref);
        }
        super::insert::write_part_refs(&table, &mut copy, var_ref, None);

        let op = ctx
            .arena
            .seize(OpType::Refresh, req.rowid, req.trans, req.savepoint);
        {
            let page = fetch_fix_page(ctx, req.rowid)?;
            let mut guard = page.lock();
            let mut fixed_page = FixedPage::new(guard.bytes_mut());
            let slot = fixed_page.row_mut(req.rowid.page_idx);
            let fix_bytes = table.fix_row_words as usize * 4;
            slot[..fix_bytes].copy_from_slice(&copy.buf[..fix_bytes]);
            let mut row = RowMut(slot);
            let bits = (copy.header().bits() & !HeaderBits::COPY_TUPLE) & !HeaderBits::FREE;
            row.set_bits(bits);
            checksum::set(row.0, table.fix_row_words);

            let rec = ctx.arena.get_mut(op);
            rec.tup_version = 1;
            rec.bits_before = HeaderBits::FREE;
            rec.sizes = sizes;
            rec.copy = Some(copy);
            chain::prepare(ctx.arena, op, RNIL)?;
            let mut row = RowMut(fixed_page.row_mut(req.rowid.page_idx));
            chain::publish(ctx.arena, op, &mut row);
        }
        drop(excl);

        let mut conf = TupKeyConf::default();
        conf.rowid_created = Some(req.rowid);
        conf.op_ref = Some(op);
        return Ok(ExecResult::Confirm(conf));
    }

    // existing row: run the delete-then-insert pattern in one op
    let ticket = ctx.frag.lock.write_key();
    let excl = ticket.upgrade();
    let page = fetch_fix_page(ctx, req.rowid)?;
    let base = BaseRow::capture(&page, req.rowid, &table);
    checksum::verify(
        &base.fixed,
        table.fix_row_words,
        ctx.opts.corrupt_policy,
        req.rowid,
    )?;

    let op = ctx
        .arena
        .seize(OpType::Refresh, req.rowid, req.trans, req.savepoint);
    if let Err(e) = chain::prepare(ctx.arena, op, base.op_ptr) {
        chain::unprepare(ctx.arena, op);
        ctx.arena.release(op);
        return Err(e);
    }

    let var_bytes = match base.var_ref(&table) {
        Some(vref) => Some(ctx.frag.alloc.read_var(vref)?),
        None => None,
    };
    let mut copy = expand(&table, &base.fixed, var_bytes.as_deref(), None, false)?;
    let pred_version = RowRef(&base.fixed).tuple_version();
    let new_version = pred_version.wrapping_add(1);
    copy.header_mut().set_tuple_version(new_version);
    if let Some(gci) = req.gci {
        copy.header_mut().set_gci(gci);
    }
    {
        let writes = AttrWrite::parse_all(req.attrinfo)?;
        let mut attrs = CopyAttrs::new(&table, &mut copy, false);
        attrs.apply_writes(&writes)?;
    }
    let sizes = shrink(&table, &mut copy)?;

    {
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let rec = ctx.arena.get_mut(op);
        rec.tup_version = new_version;
        rec.bits_before = base.bits;
        rec.gci_before = RowRef(&base.fixed).gci();
        rec.sizes = sizes;
        rec.copy = Some(copy);
        let mut row = RowMut(fixed_page.row_mut(req.rowid.page_idx));
        chain::publish(ctx.arena, op, &mut row);
    }
    drop(excl);

    let mut conf = TupKeyConf::default();
    conf.op_ref = Some(op);
    Ok(ExecResult::Confirm(conf))
}
