//! Inverse actions: aborting a freshly published op, and the
//! whole-chain commit/abort the operation chain is structured to
//! support. The transaction engine drives these; the row-level
//! mechanics live here.

use byteorder::{ByteOrder, LittleEndian};

use crate::chain::{chain_iter, unpublish, OpFlags, OpRef, OpType};
use crate::page::FixedPage;
use crate::rowcodec::{HeaderBits, RowMut, RowRef, VarRef};
use crate::{checksum, RowId, TupError, RNIL};

use super::{fetch_fix_page, BaseRow, ExecCtx};

/// Abort one just-published chain leader: unpublish, replay the base
/// row's header bits and checksum backwards, and undo an initial
/// insert's allocations. Reserved UNDO space stays put; the
/// transaction's global abort returns it.
pub(crate) fn abort_published_op(ctx: &mut ExecCtx<'_>, op: OpRef) -> Result<(), TupError> {
    let table = ctx.frag.table.clone();
    let rowid = ctx.arena.get(op).tuple_location;
    let bits_before = ctx.arena.get(op).bits_before;
    let gci_before = ctx.arena.get(op).gci_before;
    let was_initial_insert = bits_before.contains(HeaderBits::FREE);

    let page = fetch_fix_page(ctx, rowid)?;
    {
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let slot = fixed_page.row_mut(rowid.page_idx);
        let current_bits = RowRef(slot).bits();
        {
            let mut row = RowMut(slot);
            unpublish(ctx.arena, op, &mut row);
        }

        if was_initial_insert {
            let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
            row.set_bits(bits_before);
        } else {
            // undo a varpart grow: the pre-grow length sits in the
            // slot's last word
            if current_bits.contains(HeaderBits::MM_GROWN)
                && !bits_before.contains(HeaderBits::MM_GROWN)
            {
                let base = BaseRow::capture_locked(&fixed_page, rowid, &table);
                if let Some(vref) = base.var_ref(&table) {
                    shrink_to_pre_grow(ctx, vref)?;
                }
            }
            let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
            row.set_bits(bits_before);
            row.set_gci(gci_before);
            checksum::set(row.0, table.fix_row_words);
        }
    }

    if was_initial_insert {
        free_row_slots(ctx, op, rowid)?;
    }
    release_disk_preallocs(ctx, op);
    ctx.arena.release(op);
    Ok(())
}

/// Restore a varpart slot to its pre-grow size using the stored length.
fn shrink_to_pre_grow(ctx: &ExecCtx<'_>, vref: VarRef) -> Result<(), TupError> {
    let bytes = ctx.frag.alloc.read_var(vref)?;
    let pre_grow = LittleEndian::read_u32(&bytes[bytes.len() - 4..]);
    ctx.frag.alloc.realloc_var(vref, pre_grow as u16)?;
    Ok(())
}

fn free_row_slots(ctx: &mut ExecCtx<'_>, op: OpRef, rowid: RowId) -> Result<(), TupError> {
    let table = ctx.frag.table.clone();
    // slots referenced by the op's copy, not the base: the base is being
    // released
    let var_ref = {
        let rec = ctx.arena.get(op);
        rec.copy.as_ref().and_then(|copy| {
            if !table.has_varpart() {
                return None;
            }
            let off = crate::rowcodec::var_ref_off(&table);
            let vref = VarRef::decode(LittleEndian::read_u32(&copy.buf[off..off + 4]));
            (!vref.is_nil()).then_some(vref)
        })
    };
    if let Some(vref) = var_ref {
        ctx.frag.alloc.free_var(vref)?;
    }
    {
        let page = fetch_fix_page(ctx, rowid)?;
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
        row.set_bits(HeaderBits::FREE);
        row.set_op_ptr(RNIL);
    }
    ctx.frag.alloc.free_fixed(rowid)?;
    Ok(())
}

fn release_disk_preallocs(ctx: &mut ExecCtx<'_>, op: OpRef) {
    let table = ctx.frag.table.clone();
    let rec = ctx.arena.get(op);
    if let Some(nref) = rec.disk_reorg_ref {
        ctx.disk.cache().release_prealloc(nref, rec.sizes.dd);
    }
    if rec.flags.contains(OpFlags::DISK_PREALLOCATED) {
        if let Some(copy) = rec.copy.as_ref() {
            let off = crate::rowcodec::disk_ref_off(&table);
            let dref = crate::rowcodec::DiskRef::read(&copy.buf[off..off + 8]);
            if !dref.is_nil() {
                ctx.disk
                    .cache()
                    .release_prealloc(dref, rec.uncommitted_used_space);
            }
        }
    }
}

impl BaseRow {
    /// Capture variant for callers already holding the page mutex.
    pub(crate) fn capture_locked(
        page: &FixedPage<'_>,
        rowid: RowId,
        table: &crate::schema::TableDescriptor,
    ) -> Self {
        let row = page.row(rowid.page_idx);
        let fixed = row[..table.fix_row_words as usize * 4].to_vec();
        let r = RowRef(&fixed);
        BaseRow {
            bits: r.bits(),
            op_ptr: r.op_ptr(),
            fixed,
        }
    }
}

/// Abort every in-flight op on a row: the transaction-level rollback for
/// this row. Restores the committed image, returns reserved UNDO space
/// and disk preallocations, and releases the op records.
pub(crate) fn abort_row(ctx: &mut ExecCtx<'_>, rowid: RowId) -> Result<(), TupError> {
    let table = ctx.frag.table.clone();
    let page = fetch_fix_page(ctx, rowid)?;
    let head = {
        let base = BaseRow::capture(&page, rowid, &table);
        base.op_ptr
    };
    if head == RNIL {
        return Ok(());
    }

    let ops: Vec<OpRef> = chain_iter(ctx.arena, head).collect();
    let oldest = *ops.last().expect("non-empty chain");
    let undo_total = ctx.arena.get(head).undo_buffer_space;
    if undo_total > 0 {
        ctx.disk
            .log()
            .release_undo(ctx.frag.logfile_group_id, undo_total);
    }
    for &op in &ops {
        release_disk_preallocs(ctx, op);
    }

    let original_bits = ctx.arena.get(oldest).bits_before;
    let original_gci = ctx.arena.get(oldest).gci_before;
    let created_here = original_bits.contains(HeaderBits::FREE);

    if created_here {
        // the row never existed: drop everything it allocated
        let base_var = {
            let base = BaseRow::capture(&page, rowid, &table);
            base.var_ref(&table)
        };
        if let Some(vref) = base_var {
            ctx.frag.alloc.free_var(vref)?;
        }
        {
            let mut guard = page.lock();
            let mut fixed_page = FixedPage::new(guard.bytes_mut());
            let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
            row.set_bits(HeaderBits::FREE);
            row.set_op_ptr(RNIL);
        }
        ctx.frag.alloc.free_fixed(rowid)?;
    } else {
        let base = BaseRow::capture(&page, rowid, &table);
        if base.bits.contains(HeaderBits::MM_GROWN)
            && !original_bits.contains(HeaderBits::MM_GROWN)
        {
            if let Some(vref) = base.var_ref(&table) {
                shrink_to_pre_grow(ctx, vref)?;
            }
        }
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
        row.set_bits(original_bits);
        row.set_gci(original_gci);
        row.set_op_ptr(RNIL);
        checksum::set(row.0, table.fix_row_words);
    }

    for op in ops {
        ctx.arena.release(op);
    }
    log::trace!("chain aborted on row ({}, {})", rowid.page_no, rowid.page_idx);
    Ok(())
}

/// Commit every in-flight op on a row by coalescing the chain leader's
/// image into the base slot, then releasing the chain.
pub(crate) fn commit_row(ctx: &mut ExecCtx<'_>, rowid: RowId) -> Result<(), TupError> {
    let table = ctx.frag.table.clone();
    let page = fetch_fix_page(ctx, rowid)?;
    let head = {
        let base = BaseRow::capture(&page, rowid, &table);
        base.op_ptr
    };
    if head == RNIL {
        return Ok(());
    }

    let ops: Vec<OpRef> = chain_iter(ctx.arena, head).collect();
    let oldest = *ops.last().expect("non-empty chain");
    let undo_total = ctx.arena.get(head).undo_buffer_space;
    if undo_total > 0 {
        ctx.disk
            .log()
            .release_undo(ctx.frag.logfile_group_id, undo_total);
    }
    let existed_at_start = !ctx.arena.get(oldest).bits_before.contains(HeaderBits::FREE);
    let head_type = ctx.arena.get(head).op_type;

    match head_type {
        OpType::Delete => {
            let base_var = {
                let base = BaseRow::capture(&page, rowid, &table);
                base.var_ref(&table)
            };
            if let Some(vref) = base_var {
                ctx.frag.alloc.free_var(vref)?;
            }
            {
                let mut guard = page.lock();
                let mut fixed_page = FixedPage::new(guard.bytes_mut());
                let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
                row.set_bits(HeaderBits::FREE);
                row.set_op_ptr(RNIL);
            }
            ctx.frag.alloc.free_fixed(rowid)?;
            if existed_at_start {
                ctx.frag.dec_row_count();
            }
        }
        _ => {
            // apply the leader's packed copy
            let (fixed_image, var_image, sizes) = {
                let rec = ctx.arena.get(head);
                let copy = rec.copy.as_ref().expect("write op carries a copy");
                let sizes = copy.packed.expect("published copy is packed");
                let fix_bytes = table.fix_row_words as usize * 4;
                let fixed = copy.buf[..fix_bytes].to_vec();
                let var = (sizes.mm > 0)
                    .then(|| copy.buf[fix_bytes..fix_bytes + sizes.mm as usize * 4].to_vec());
                (fixed, var, sizes)
            };

            // old committed slot, before the fixed image is replaced
            let old_var = {
                let base = BaseRow::capture(&page, rowid, &table);
                base.var_ref(&table)
            };
            // the copy's fixed part knows where the final varpart lives
            let new_var = {
                let r = BaseRow {
                    bits: RowRef(&fixed_image).bits() | HeaderBits::VAR_PART,
                    op_ptr: RNIL,
                    fixed: fixed_image.clone(),
                };
                if table.has_varpart() {
                    r.var_ref(&table)
                } else {
                    None
                }
            };

            // reconcile var slots: the grown/moved slot is authoritative
            // when the base was updated in place, the base slot otherwise
            let target = new_var.or(old_var);
            if let Some(var) = &var_image {
                let target = match target {
                    Some(t) => t,
                    None => ctx.frag.alloc.alloc_var(sizes.mm as u16)?,
                };
                if let Some(old) = old_var {
                    if old != target {
                        ctx.frag.alloc.free_var(old)?;
                    }
                }
                let target = ctx.frag.alloc.realloc_var(target, sizes.mm as u16)?;
                ctx.frag.alloc.write_var(target, var)?;
                write_var_ref(&table, &page, rowid, target);
            } else if let Some(old) = old_var {
                ctx.frag.alloc.free_var(old)?;
            }

            {
                let mut guard = page.lock();
                let mut fixed_page = FixedPage::new(guard.bytes_mut());
                let slot = fixed_page.row_mut(rowid.page_idx);
                let fix_bytes = table.fix_row_words as usize * 4;
                // keep the reconciled var reference in place
                let var_word = if table.has_varpart() {
                    let off = crate::rowcodec::var_ref_off(&table);
                    Some(LittleEndian::read_u32(&slot[off..off + 4]))
                } else {
                    None
                };
                slot[..fix_bytes].copy_from_slice(&fixed_image);
                if let Some(word) = var_word {
                    let off = crate::rowcodec::var_ref_off(&table);
                    LittleEndian::write_u32(&mut slot[off..off + 4], word);
                }
                let mut row = RowMut(slot);
                let mut bits = row.bits();
                bits.remove(
                    HeaderBits::COPY_TUPLE
                        | HeaderBits::ALLOC
                        | HeaderBits::MM_GROWN
                        | HeaderBits::DISK_REORG
                        | HeaderBits::DISK_ALLOC
                        | HeaderBits::DISK_INLINE,
                );
                if var_image.is_some() {
                    bits |= HeaderBits::VAR_PART;
                } else {
                    bits.remove(HeaderBits::VAR_PART);
                }
                row.set_bits(bits);
                row.set_op_ptr(RNIL);
                checksum::set(row.0, table.fix_row_words);
            }
            if !existed_at_start {
                ctx.frag.inc_row_count();
            }
        }
    }

    for op in ops {
        ctx.arena.release(op);
    }
    log::trace!(
        "chain committed on row ({}, {})",
        rowid.page_no,
        rowid.page_idx
    );
    Ok(())
}

fn write_var_ref(
    table: &crate::schema::TableDescriptor,
    page: &std::sync::Arc<crate::store::PageSlot>,
    rowid: RowId,
    vref: VarRef,
) {
    let mut guard = page.lock();
    let mut fixed_page = FixedPage::new(guard.bytes_mut());
    let slot = fixed_page.row_mut(rowid.page_idx);
    let off = crate::rowcodec::var_ref_off(table);
    LittleEndian::write_u32(&mut slot[off..off + 4], vref.encode());
}
