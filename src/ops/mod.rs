//! Orchestration of READ / INSERT / UPDATE / DELETE / REFRESH against one
//! row: validation, copy management, codec and interpreter invocation,
//! checksum upkeep, chain publication and the trigger/index hooks.

mod abort;
mod delete;
mod insert;
mod read;
mod update;

pub(crate) use abort::{abort_row, commit_row};

use std::collections::HashSet;
use std::sync::Arc;

use crate::chain::{OpArena, OpFlags, OpRef, OpType};
use crate::config::EngineOptions;
use crate::disk::{CallbackToken, DiskPartCoordinator};
use crate::error::ErrorKind;
use crate::fragment::Fragment;
use crate::interp::AttrAccess;
use crate::rowcodec::{
    read_attr, update_attr, AttrWrite, CopyRow, HeaderBits, RowRef, VarRef,
};
use crate::schema::{AttrDescr, TableDescriptor};
use crate::store::{PageSlot, PageStore};
use crate::{fault, RowId, TransId, TupError};

/// Reads of attribute ids at or above this point address the
/// interpreter's output array instead of the schema.
pub const PSEUDO_OUTPUT_BASE: u32 = 0xFF00;

/// Row filtering during a table reorganisation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReorgKind {
    #[default]
    All,
    /// Only rows without REORG_MOVE.
    NotMoved,
    /// Only rows carrying REORG_MOVE.
    Moved,
}

/// Request flags, mirroring the wire protocol's bit field.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReqFlags {
    pub interpreted: bool,
    /// Write targets the exact rowid in the request.
    pub use_rowid: bool,
    pub dirty: bool,
    pub reorg: ReorgKind,
    pub no_triggers: bool,
    /// Node-recovery copy or redo replay; bypasses visibility.
    pub nr_copy_or_redo: bool,
    pub disable_fk: bool,
    pub deferred_constraints: bool,
}

/// One key operation against a fragment.
#[derive(Clone, Debug)]
pub struct TupKeyRequest<'a> {
    pub frag_id: u64,
    pub op_type: OpType,
    pub rowid: RowId,
    /// Attribute-info section: plain attribute ids for simple reads,
    /// attribute writes for simple writes, or a five-region interpreted
    /// program.
    pub attrinfo: &'a [u32],
    pub trans: TransId,
    pub savepoint: u64,
    pub flags: ReqFlags,
    pub gci: Option<u32>,
    pub user_ptr: u64,
    pub any_value: u32,
}

/// Success outputs of one operation.
#[derive(Clone, Debug, Default)]
pub struct TupKeyConf {
    /// Read result, attribute-info encoded.
    pub read: Vec<u32>,
    /// Attribute writes to append to the replication log.
    pub log: Vec<u32>,
    pub triggers_fired: u32,
    pub interp_instructions: u32,
    pub last_row: bool,
    /// Interpreted filter miss: the program's refusal reason. The read
    /// payload is empty.
    pub refused: Option<u16>,
    /// Set when an insert created this rowid.
    pub rowid_created: Option<RowId>,
    /// The op now pending commit or abort; unset for plain reads.
    pub op_ref: Option<crate::chain::OpRef>,
}

/// Confirm, or park awaiting a disk/log callback.
#[derive(Debug)]
pub enum ExecResult {
    Confirm(TupKeyConf),
    /// The op could not proceed without I/O; nothing was published.
    Suspended(CallbackToken),
}

/// Immediate-trigger port; ordered-index maintenance travels separately.
pub trait TriggerSink: Send + Sync {
    fn fire(
        &self,
        frag_id: u64,
        op_type: OpType,
        rowid: RowId,
        disable_fk: bool,
    ) -> Result<u32, TupError>;
}

/// Ordered-index (TUX) maintenance port. Called with exclusive fragment
/// access after the row image is stable.
pub trait OrderedIndexSink: Send + Sync {
    fn row_changed(
        &self,
        frag_id: u64,
        rowid: RowId,
        old_version: u16,
        new_version: u16,
    ) -> Result<(), TupError>;
}

/// Default no-op collaborators.
pub struct NoHooks;

impl TriggerSink for NoHooks {
    fn fire(&self, _: u64, _: OpType, _: RowId, _: bool) -> Result<u32, TupError> {
        Ok(0)
    }
}

impl OrderedIndexSink for NoHooks {
    fn row_changed(&self, _: u64, _: RowId, _: u16, _: u16) -> Result<(), TupError> {
        Ok(())
    }
}

/// Everything one op execution needs from the engine.
pub(crate) struct ExecCtx<'a> {
    pub frag: &'a Fragment,
    pub store: &'a Arc<PageStore>,
    pub arena: &'a mut OpArena,
    pub disk: &'a DiskPartCoordinator,
    pub opts: &'a EngineOptions,
    pub triggers: &'a dyn TriggerSink,
    pub index: &'a dyn OrderedIndexSink,
    pub outputs_enabled: bool,
}

/// Dispatch one request.
pub(crate) fn execute(ctx: &mut ExecCtx<'_>, req: &TupKeyRequest<'_>) -> Result<ExecResult, TupError> {
    log::trace!(
        "frag {} {:?} at ({}, {})",
        req.frag_id,
        req.op_type,
        req.rowid.page_no,
        req.rowid.page_idx
    );
    match req.op_type {
        OpType::Read => read::execute(ctx, req),
        OpType::Insert => insert::execute(ctx, req),
        OpType::Update => update::execute(ctx, req),
        OpType::Delete => delete::execute_delete(ctx, req),
        OpType::Refresh => delete::execute_refresh(ctx, req),
    }
}

/// Fetch the fixed page holding a rowid.
pub(crate) fn fetch_fix_page(
    ctx: &ExecCtx<'_>,
    rowid: RowId,
) -> Result<Arc<PageSlot>, TupError> {
    ctx.store.fetch_logical(&ctx.frag.alloc.fix_map, rowid.page_no)
}

/// Snapshot of a base row's fixed part, captured under its page mutex.
pub(crate) struct BaseRow {
    pub fixed: Vec<u8>,
    pub bits: HeaderBits,
    pub op_ptr: u32,
}

impl BaseRow {
    pub fn capture(page: &Arc<PageSlot>, rowid: RowId, table: &TableDescriptor) -> Self {
        let mut guard = page.lock();
        let fixed_page = crate::page::FixedPage::new(guard.bytes_mut());
        let row = fixed_page.row(rowid.page_idx);
        let fixed = row[..table.fix_row_words as usize * 4].to_vec();
        let r = RowRef(&fixed);
        BaseRow {
            bits: r.bits(),
            op_ptr: r.op_ptr(),
            fixed,
        }
    }

    pub fn var_ref(&self, table: &TableDescriptor) -> Option<VarRef> {
        if !self.bits.contains(HeaderBits::VAR_PART) {
            return None;
        }
        let off = crate::rowcodec::var_ref_off(table);
        let word = byteorder::LittleEndian::read_u32(&self.fixed[off..off + 4]);
        let vref = VarRef::decode(word);
        (!vref.is_nil()).then_some(vref)
    }

    pub fn disk_ref(&self, table: &TableDescriptor) -> Option<crate::rowcodec::DiskRef> {
        if !self.bits.contains(HeaderBits::DISK_PART) {
            return None;
        }
        let off = crate::rowcodec::disk_ref_off(table);
        let dref = crate::rowcodec::DiskRef::read(&self.fixed[off..off + 8]);
        (!dref.is_nil()).then_some(dref)
    }
}

use byteorder::ByteOrder;

/// Reorg-scan filtering: outside REORG_ALL a row must match the wanted
/// moved/not-moved side or it reads as deleted.
pub(crate) fn reorg_filter(bits: HeaderBits, reorg: ReorgKind) -> Result<(), TupError> {
    let moved = bits.contains(HeaderBits::REORG_MOVE);
    let ok = match reorg {
        ReorgKind::All => true,
        ReorgKind::NotMoved => !moved,
        ReorgKind::Moved => moved,
    };
    if ok {
        Ok(())
    } else {
        Err(fault!(crate::SeqError::TupleDeleted))
    }
}

/// [`AttrAccess`] over an op's expanded working copy. Writes are applied
/// to the copy, recorded for the replication log, and tracked for the
/// insert-time NOT NULL sweep.
pub(crate) struct CopyAttrs<'a> {
    pub table: &'a TableDescriptor,
    pub copy: &'a mut CopyRow,
    pub log: Vec<u32>,
    pub written: HashSet<u32>,
    /// Reads-only mode for condition pushdown on READ ops.
    pub read_only: bool,
}

impl<'a> CopyAttrs<'a> {
    pub fn new(table: &'a TableDescriptor, copy: &'a mut CopyRow, read_only: bool) -> Self {
        Self {
            table,
            copy,
            log: Vec::new(),
            written: HashSet::new(),
            read_only,
        }
    }

    pub fn apply_writes(&mut self, writes: &[AttrWrite]) -> Result<(), TupError> {
        for w in writes {
            self.write(w.attr_id, w.value.as_deref())?;
        }
        Ok(())
    }
}

impl AttrAccess for CopyAttrs<'_> {
    fn descr(&self, attr_id: u32) -> Result<&AttrDescr, TupError> {
        self.table.attr(attr_id)
    }

    fn read(&self, attr_id: u32) -> Result<Option<Vec<u8>>, TupError> {
        let img = self.copy.image();
        Ok(read_attr(self.table, &img, attr_id)?.map(|v| v.to_vec()))
    }

    fn write(&mut self, attr_id: u32, value: Option<&[u8]>) -> Result<(), TupError> {
        if self.read_only {
            return Err(fault!(ErrorKind::UnsupportedType(attr_id)));
        }
        update_attr(
            self.table,
            &mut self.copy.buf,
            self.copy.mm_words,
            self.copy.dd_words,
            attr_id,
            value,
        )?;
        self.written.insert(attr_id);
        AttrWrite {
            attr_id,
            value: value.map(|v| v.to_vec()),
        }
        .encode_into(&mut self.log);
        Ok(())
    }
}

/// Carry the request's per-op state onto the op record. Runs after
/// chain preparation so an explicit any-value overrides the inherited
/// one.
pub(crate) fn stamp_request(arena: &mut OpArena, op: OpRef, req: &TupKeyRequest<'_>) {
    let rec = arena.get_mut(op);
    rec.user_ptr = req.user_ptr;
    if req.any_value != 0 {
        rec.any_value = req.any_value;
    }
    if req.flags.disable_fk {
        rec.flags |= OpFlags::DISABLE_FK;
    }
    if req.flags.deferred_constraints {
        rec.flags |= OpFlags::DEFERRED_CONSTRAINTS;
    }
    if !req.flags.no_triggers {
        rec.flags |= OpFlags::TRIGGERS;
    }
}

/// Insert-time NOT NULL sweep: every non-nullable attribute must have
/// been assigned by defaults or writes. A refresh of a non-existent row
/// only needs its primary key.
pub(crate) fn check_not_null(
    table: &TableDescriptor,
    written: &HashSet<u32>,
    pk_only: bool,
) -> Result<(), TupError> {
    for attr in &table.attrs {
        if attr.nullable {
            continue;
        }
        if pk_only && !attr.pk {
            continue;
        }
        if !written.contains(&attr.id) {
            return Err(fault!(ErrorKind::NotNullViolation(attr.id)));
        }
    }
    Ok(())
}

/// Apply schema defaults to a fresh insert copy.
pub(crate) fn apply_defaults(
    table: &TableDescriptor,
    attrs: &mut CopyAttrs<'_>,
) -> Result<(), TupError> {
    for attr in &table.attrs {
        if let Some(default) = attr.default.clone() {
            attrs.write(attr.id, Some(&default))?;
        }
    }
    // defaults do not go to the replication log
    attrs.log.clear();
    Ok(())
}
