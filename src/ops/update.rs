//! The UPDATE contract: expand the predecessor image, apply plain or
//! interpreted writes, shrink, resolve main-memory and disk size
//! changes, publish, fire hooks.

use byteorder::{ByteOrder, LittleEndian};

use crate::chain::{self, OpFlags, OpType};
use crate::disk::{DiskResult, SizeChange};
use crate::error::ErrorKind;
use crate::interp::{Interp, Outcome, Program};
use crate::page::FixedPage;
use crate::rowcodec::{
    expand, packed_parts, read_attr_into, shrink, AttrWrite, CopyRow, HeaderBits, RowMut, VarRef,
};
use crate::{checksum, fault, TupError, RNIL};

use super::insert::{fire_hooks, write_part_refs};
use super::{
    fetch_fix_page, BaseRow, CopyAttrs, ExecCtx, ExecResult, TupKeyConf, TupKeyRequest,
    PSEUDO_OUTPUT_BASE,
};

pub(crate) fn execute(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
) -> Result<ExecResult, TupError> {
    let mut ticket = Some(ctx.frag.lock.write_key());
    let table = ctx.frag.table.clone();
    let include_disk = table.has_diskpart();
    let page = fetch_fix_page(ctx, req.rowid)?;

    // the capture itself runs under the page mutex; the snapshot is
    // consistent, so the verify can run on it directly
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
        .seize(OpType::Update, req.rowid, req.trans, req.savepoint);
    if let Err(e) = chain::prepare(ctx.arena, op, head) {
        chain::unprepare(ctx.arena, op);
        ctx.arena.release(op);
        return Err(e);
    }
    super::stamp_request(ctx.arena, op, req);
    let unwind = |ctx: &mut ExecCtx<'_>, op| {
        chain::unprepare(ctx.arena, op);
        ctx.arena.release(op);
    };

    // expand the predecessor image into this op's working copy
    let (mut copy, pred_version) = match predecessor_image(ctx, &base, head, include_disk) {
        Ok(v) => v,
        Err(e) => {
            unwind(ctx, op);
            return Err(e);
        }
    };

    // a disk-bearing row needs its UNDO reservation before any write
    let base_disk_ref = base.disk_ref(&table);
    if let Some(_dref) = base_disk_ref {
        if ctx.arena.get(op).undo_buffer_space == 0 {
            let r = ctx.disk.reserve_for_update(
                ctx.arena.get_mut(op),
                &table,
                ctx.frag.logfile_group_id,
                table.disk_fix_words + table.max_disk_varpart_words,
            );
            match r {
                Ok(DiskResult::Ready(())) => {}
                Ok(DiskResult::Pending(token)) => {
                    unwind(ctx, op);
                    return Ok(ExecResult::Suspended(token));
                }
                Err(e) => {
                    unwind(ctx, op);
                    return Err(e);
                }
            }
        }
    }

    // apply the writes
    let mut conf = TupKeyConf::default();
    let apply = apply_update_writes(ctx, req, &table, &mut copy, &mut conf);
    if let Err(e) = apply {
        unwind(ctx, op);
        return Err(e);
    }
    if conf.refused.is_some() {
        unwind(ctx, op);
        return Ok(ExecResult::Confirm(conf));
    }

    let new_version = pred_version.wrapping_add(1);
    copy.header_mut().set_tuple_version(new_version);
    if let Some(gci) = req.gci {
        copy.header_mut().set_gci(gci);
        ctx.arena.get_mut(op).flags |= OpFlags::GCI_WRITTEN;
    }

    let sizes = match shrink(&table, &mut copy) {
        Ok(s) => s,
        Err(e) => {
            unwind(ctx, op);
            return Err(e);
        }
    };

    // disk part first: it is the only remaining step that can suspend
    let mut new_bits = base.bits;
    if let (Some(dref), true) = (base_disk_ref, sizes.dd > 0) {
        let r = ctx.disk.handle_size_change(
            ctx.arena.get_mut(op),
            &table,
            ctx.frag.logfile_group_id,
            dref,
            sizes.dd,
        );
        match r {
            Ok(DiskResult::Ready(SizeChange::InPlace { .. })) => {}
            Ok(DiskResult::Ready(SizeChange::Reorg { new_ref, .. })) => {
                new_bits |= HeaderBits::DISK_REORG;
                write_part_refs(&table, &mut copy, base.var_ref(&table), Some(new_ref));
            }
            Ok(DiskResult::Pending(token)) => {
                unwind(ctx, op);
                return Ok(ExecResult::Suspended(token));
            }
            Err(e) => {
                unwind(ctx, op);
                return Err(e);
            }
        }
    }

    // main-memory size change
    let mut published_var_ref = base.var_ref(&table);
    if table.has_varpart() {
        match published_var_ref {
            Some(vref) => {
                let old_words = (ctx.frag.alloc.read_var(vref)?.len() / 4) as u32;
                if sizes.mm > old_words {
                    // grow: needs exclusive fragment access; page mutexes
                    // are not held here
                    let excl = ticket.take().expect("write-key ticket live").upgrade();
                    let grown = match grow_varpart(ctx, vref, old_words, sizes.mm) {
                        Ok(r) => r,
                        Err(e) => {
                            drop(excl);
                            unwind(ctx, op);
                            return Err(e);
                        }
                    };
                    ticket = Some(excl.downgrade());
                    // commit reads the final slot location out of the copy
                    let off = crate::rowcodec::var_ref_off(&table);
                    LittleEndian::write_u32(&mut copy.buf[off..off + 4], grown.encode());
                    published_var_ref = Some(grown);
                    new_bits |= HeaderBits::MM_GROWN;
                }
            }
            None => {
                if sizes.mm > 0 {
                    // the committed row had no varpart; give the copy a
                    // fresh slot that only commit will reveal
                    let vref = match ctx.frag.alloc.alloc_var(sizes.mm as u16) {
                        Ok(v) => v,
                        Err(e) => {
                            unwind(ctx, op);
                            return Err(e);
                        }
                    };
                    let fix_bytes = table.fix_row_words as usize * 4;
                    let var =
                        copy.buf[fix_bytes..fix_bytes + sizes.mm as usize * 4].to_vec();
                    ctx.frag.alloc.write_var(vref, &var)?;
                    write_part_refs(&table, &mut copy, Some(vref), base_disk_ref);
                }
            }
        }
    }

    // publish: header-bit diff, var reference and checksum under the
    // page mutex, then the chain pointer
    {
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let slot = fixed_page.row_mut(req.rowid.page_idx);
        {
            let mut row = RowMut(slot);
            row.set_bits(new_bits);
            if let (Some(vref), true) =
                (published_var_ref, new_bits.contains(HeaderBits::MM_GROWN))
            {
                let off = crate::rowcodec::var_ref_off(&table);
                LittleEndian::write_u32(&mut row.0[off..off + 4], vref.encode());
            }
            checksum::set(row.0, table.fix_row_words);
        }
        let rec = ctx.arena.get_mut(op);
        rec.tup_version = new_version;
        rec.bits_before = base.bits;
        rec.gci_before = crate::rowcodec::RowRef(&base.fixed).gci();
        rec.sizes = sizes;
        rec.copy = Some(copy);
        let mut row = RowMut(fixed_page.row_mut(req.rowid.page_idx));
        chain::publish(ctx.arena, op, &mut row);
    }
    ctx.frag.note_changed_row();

    conf.op_ref = Some(op);
    fire_hooks(ctx, req, op, req.rowid, pred_version, new_version, &mut conf)?;
    drop(ticket);
    Ok(ExecResult::Confirm(conf))
}

/// Expand whichever image precedes this op: the chain head's copy, or
/// the committed base row.
fn predecessor_image(
    ctx: &ExecCtx<'_>,
    base: &BaseRow,
    head: u32,
    include_disk: bool,
) -> Result<(CopyRow, u16), TupError> {
    let table = &*ctx.frag.table;
    if head == RNIL {
        let var_bytes = match base.var_ref(table) {
            Some(vref) => Some(ctx.frag.alloc.read_var(vref)?),
            None => None,
        };
        let copy = expand(table, &base.fixed, var_bytes.as_deref(), None, include_disk)?;
        let version = crate::rowcodec::RowRef(&base.fixed).tuple_version();
        Ok((copy, version))
    } else {
        let rec = ctx.arena.get(head);
        let pred_copy = rec
            .copy
            .as_ref()
            .ok_or_else(|| fault!(ErrorKind::NoCopyTupleMemory))?;
        let sizes = pred_copy
            .packed
            .ok_or_else(|| fault!(ErrorKind::NoCopyTupleMemory))?;
        let (fixed, var, disk) = packed_parts(table, pred_copy, sizes);
        let copy = expand(table, fixed, var, disk, include_disk)?;
        Ok((copy, rec.tup_version))
    }
}

/// Interpreted or plain writes into the working copy. For an interpreted
/// update, initial-read results are emitted before exec runs, and writes
/// made by the bytecode land in the replication log.
fn apply_update_writes(
    ctx: &ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
    table: &crate::schema::TableDescriptor,
    copy: &mut CopyRow,
    conf: &mut TupKeyConf,
) -> Result<(), TupError> {
    if !req.flags.interpreted {
        let writes = AttrWrite::parse_all(req.attrinfo)?;
        let mut attrs = CopyAttrs::new(table, copy, false);
        attrs.apply_writes(&writes)?;
        conf.log = std::mem::take(&mut attrs.log);
        return Ok(());
    }

    let program = Program::parse(req.attrinfo)?;
    {
        let attrs = CopyAttrs::new(table, copy, false);
        let img = attrs.copy.image();
        for &attr_id in program.initial_read {
            if attr_id < PSEUDO_OUTPUT_BASE {
                read_attr_into(table, &img, attr_id, &mut conf.read)?;
            }
        }
    }
    let mut machine = Interp::new(ctx.opts.max_interp_instructions);
    let mut attrs = CopyAttrs::new(table, copy, false);
    let outcome = machine.run(&program, &mut attrs)?;
    conf.interp_instructions = machine.executed();
    match outcome {
        Outcome::Refuse(reason) => {
            conf.read.clear();
            conf.refused = Some(reason);
            return Ok(());
        }
        Outcome::OkLast => conf.last_row = true,
        Outcome::Ok => {}
    }
    let writes = AttrWrite::parse_all(program.final_update)?;
    attrs.apply_writes(&writes)?;
    conf.log = std::mem::take(&mut attrs.log);
    let img = copy.image();
    for &attr_id in program.final_read {
        if attr_id < PSEUDO_OUTPUT_BASE {
            read_attr_into(table, &img, attr_id, &mut conf.read)?;
        }
    }
    Ok(())
}

/// Grow a varpart slot to `new_words` plus the pre-grow length word, and
/// stamp the pre-grow length into the slot's last word.
fn grow_varpart(
    ctx: &ExecCtx<'_>,
    vref: VarRef,
    old_words: u32,
    new_words: u32,
) -> Result<VarRef, TupError> {
    let grown = ctx.frag.alloc.realloc_var(vref, (new_words + 1) as u16)?;
    let mut bytes = ctx.frag.alloc.read_var(grown)?;
    let len = bytes.len();
    LittleEndian::write_u32(&mut bytes[len - 4..], old_words);
    ctx.frag.alloc.write_var(grown, &bytes)?;
    log::debug!("varpart grew {old_words} -> {new_words} words, MM_GROWN set");
    Ok(grown)
}
