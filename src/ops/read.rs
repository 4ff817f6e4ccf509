//! The READ contract: visibility resolution, checksum-verified capture,
//! optional condition pushdown, result emission.

use crate::chain::{find_visible, ReadCtx, Visible};
use crate::error::ErrorKind;
use crate::interp::{Interp, Outcome, Program};
use crate::rowcodec::{
    attr_header, prepare_read, read_attr_into, HeaderBits, RowImage,
};
use crate::{checksum, fault, SeqError, TupError};

use super::{
    fetch_fix_page, reorg_filter, BaseRow, ExecCtx, ExecResult, TupKeyConf, TupKeyRequest,
    PSEUDO_OUTPUT_BASE,
};

pub(crate) fn execute(
    ctx: &mut ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
) -> Result<ExecResult, TupError> {
    let _ticket = ctx.frag.lock.read();
    let table = &*ctx.frag.table;
    let page = fetch_fix_page(ctx, req.rowid)?;

    // capture the fixed part and verify it under the page mutex
    let base = {
        let base = BaseRow::capture(&page, req.rowid, table);
        if base.bits.contains(HeaderBits::FREE) {
            return Err(fault!(ErrorKind::TupleNotFound));
        }
        checksum::verify(
            &base.fixed,
            table.fix_row_words,
            ctx.opts.corrupt_policy,
            req.rowid,
        )?;
        base
    };
    reorg_filter(base.bits, req.flags.reorg)?;

    let visible = find_visible(
        ctx.arena,
        base.op_ptr,
        base.bits,
        &ReadCtx {
            savepoint: req.savepoint,
            trans: req.trans,
            dirty: req.flags.dirty,
        },
    );

    // Base reads capture the varpart by reference under the var page
    // mutex; here that collapses to a bounded copy of the slot bytes.
    let var_bytes;
    let copy_image;
    let image: RowImage<'_> = match visible {
        Visible::Invisible => return Err(fault!(SeqError::TupleDeleted)),
        Visible::Base => {
            var_bytes = match base.var_ref(table) {
                Some(vref) => Some(ctx.frag.alloc.read_var(vref)?),
                None => None,
            };
            prepare_read(table, &base.fixed, var_bytes.as_deref(), None)?
        }
        Visible::Op(op) => {
            let rec = ctx.arena.get(op);
            let copy = rec
                .copy
                .as_ref()
                .ok_or_else(|| fault!(ErrorKind::NoCopyTupleMemory))?;
            copy_image = copy.clone();
            copy_image.read_image(table)?
        }
    };

    let mut conf = TupKeyConf::default();
    if req.flags.interpreted {
        run_interpreted_read(ctx, req, table, &image, &mut conf)?;
    } else {
        for &attr_id in req.attrinfo {
            read_attr_into(table, &image, attr_id, &mut conf.read)?;
        }
    }
    Ok(ExecResult::Confirm(conf))
}

/// Interpreted read: exec runs first so the filter can refuse before any
/// read bytes are emitted; the initial-read and final-read regions follow
/// only on a hit.
fn run_interpreted_read(
    ctx: &ExecCtx<'_>,
    req: &TupKeyRequest<'_>,
    table: &crate::schema::TableDescriptor,
    image: &RowImage<'_>,
    conf: &mut TupKeyConf,
) -> Result<(), TupError> {
    let program = Program::parse(req.attrinfo)?;
    let mut machine = Interp::new(ctx.opts.max_interp_instructions);

    let mut attrs = ImageAttrs { table, image };
    let outcome = machine.run(&program, &mut attrs)?;
    conf.interp_instructions = machine.executed();
    match outcome {
        Outcome::Refuse(reason) => {
            // filter miss: zero bytes of read data, reason to the caller
            conf.read.clear();
            conf.refused = Some(reason);
            return Ok(());
        }
        Outcome::OkLast => conf.last_row = true,
        Outcome::Ok => {}
    }

    for region in [program.initial_read, program.final_read] {
        for &attr_id in region {
            if attr_id >= PSEUDO_OUTPUT_BASE {
                emit_output(ctx, &machine, attr_id, conf)?;
            } else {
                read_attr_into(table, image, attr_id, &mut conf.read)?;
            }
        }
    }
    Ok(())
}

/// Surface an interpreter output register as a pseudo-column.
fn emit_output(
    ctx: &ExecCtx<'_>,
    machine: &Interp,
    attr_id: u32,
    conf: &mut TupKeyConf,
) -> Result<(), TupError> {
    if !ctx.outputs_enabled {
        return Err(fault!(ErrorKind::UnknownAttr(attr_id)));
    }
    let slot = (attr_id - PSEUDO_OUTPUT_BASE) as usize;
    if slot >= crate::interp::OUTPUT_SLOTS {
        return Err(fault!(ErrorKind::UnknownAttr(attr_id)));
    }
    if machine.output_mask() & (1 << slot) == 0 {
        // unwritten slot reads as NULL
        conf.read.push(attr_header(attr_id, 0));
    } else {
        conf.read.push(attr_header(attr_id, 4));
        conf.read.push(machine.outputs()[slot]);
    }
    Ok(())
}

/// Read-only [`crate::interp::AttrAccess`] over a resolved row image.
struct ImageAttrs<'a> {
    table: &'a crate::schema::TableDescriptor,
    image: &'a RowImage<'a>,
}

impl crate::interp::AttrAccess for ImageAttrs<'_> {
    fn descr(&self, attr_id: u32) -> Result<&crate::schema::AttrDescr, TupError> {
        self.table.attr(attr_id)
    }

    fn read(&self, attr_id: u32) -> Result<Option<Vec<u8>>, TupError> {
        Ok(crate::rowcodec::read_attr(self.table, self.image, attr_id)?.map(|v| v.to_vec()))
    }

    fn write(&mut self, attr_id: u32, _value: Option<&[u8]>) -> Result<(), TupError> {
        Err(fault!(ErrorKind::UnsupportedType(attr_id)))
    }
}
