//! The driver-facing surface: fragment management, request execution
//! with park/resume around disk and log I/O, row commit/abort, and the
//! node-recovery entry points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::chain::{OpArena, OpType};
use crate::config::EngineOptions;
use crate::disk::{
    CallbackToken, DiskPartCoordinator, DiskPageCache, DiskResult, LogManager, MemDiskCache,
    MemLogManager,
};
use crate::error::ErrorKind;
use crate::fragment::Fragment;
use crate::ops::{
    self, ExecCtx, ExecResult, NoHooks, OrderedIndexSink, ReqFlags, TriggerSink, TupKeyRequest,
};
use crate::page::FixedPage;
use crate::rowcodec::{prepare_read, read_attr_into, HeaderBits, RowMut, RowRef};
use crate::schema::TableDescriptor;
use crate::store::{pool::PagePool, PageStore};
use crate::{checksum, fault, RowId, TransId, TupError};

/// A request parked on a disk or log callback.
enum Parked {
    Exec(OwnedRequest),
    NrDelete { frag_id: u64, rowid: RowId },
}

/// Owned form of a [`TupKeyRequest`], held while an op is parked.
struct OwnedRequest {
    frag_id: u64,
    op_type: OpType,
    rowid: RowId,
    attrinfo: Vec<u32>,
    trans: TransId,
    savepoint: u64,
    flags: ReqFlags,
    gci: Option<u32>,
    user_ptr: u64,
    any_value: u32,
}

impl OwnedRequest {
    fn of(req: &TupKeyRequest<'_>) -> Self {
        Self {
            frag_id: req.frag_id,
            op_type: req.op_type,
            rowid: req.rowid,
            attrinfo: req.attrinfo.to_vec(),
            trans: req.trans,
            savepoint: req.savepoint,
            flags: req.flags,
            gci: req.gci,
            user_ptr: req.user_ptr,
            any_value: req.any_value,
        }
    }

    fn as_req(&self) -> TupKeyRequest<'_> {
        TupKeyRequest {
            frag_id: self.frag_id,
            op_type: self.op_type,
            rowid: self.rowid,
            attrinfo: &self.attrinfo,
            trans: self.trans,
            savepoint: self.savepoint,
            flags: self.flags,
            gci: self.gci,
            user_ptr: self.user_ptr,
            any_value: self.any_value,
        }
    }
}

/// The row-execution engine for a set of fragments.
pub struct Engine {
    opts: EngineOptions,
    store: Arc<PageStore>,
    fragments: RwLock<HashMap<u64, Arc<Fragment>>>,
    arena: Mutex<OpArena>,
    disk: DiskPartCoordinator,
    triggers: Arc<dyn TriggerSink>,
    index: Arc<dyn OrderedIndexSink>,
    outputs_enabled: AtomicBool,
    parked: Mutex<HashMap<CallbackToken, Parked>>,
}

impl Engine {
    /// Open with in-memory log and disk-cache collaborators and no-op
    /// trigger/index hooks.
    pub fn open(opts: EngineOptions) -> Result<Self, TupError> {
        Self::open_with_ports(
            opts,
            Arc::new(MemLogManager::new(1 << 24)),
            Arc::new(MemDiskCache::new(1 << 13)),
            Arc::new(NoHooks),
            Arc::new(NoHooks),
        )
    }

    /// Open against caller-provided collaborators.
    pub fn open_with_ports(
        opts: EngineOptions,
        log: Arc<dyn LogManager>,
        cache: Arc<dyn DiskPageCache>,
        triggers: Arc<dyn TriggerSink>,
        index: Arc<dyn OrderedIndexSink>,
    ) -> Result<Self, TupError> {
        let pool = match &opts.backing_file {
            Some(path) => PagePool::open(path, opts.pool_bytes),
            None => PagePool::open_anon(opts.pool_bytes),
        }
        .map_err(|e| fault!(ErrorKind::Pool(e)))?;
        Ok(Self {
            opts,
            store: Arc::new(PageStore::new(Arc::new(pool))),
            fragments: RwLock::new(HashMap::new()),
            arena: Mutex::new(OpArena::new()),
            disk: DiskPartCoordinator::new(log, cache),
            triggers,
            index,
            outputs_enabled: AtomicBool::new(false),
            parked: Mutex::new(HashMap::new()),
        })
    }

    pub fn create_fragment(
        &self,
        frag_id: u64,
        table: TableDescriptor,
        logfile_group_id: u32,
    ) -> Result<Arc<Fragment>, TupError> {
        let frag = Arc::new(Fragment::new(
            frag_id,
            Arc::new(table),
            self.store.clone(),
            logfile_group_id,
            self.opts.var_bucket_bounds,
        ));
        self.fragments
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(frag_id, frag.clone());
        Ok(frag)
    }

    pub fn fragment(&self, frag_id: u64) -> Result<Arc<Fragment>, TupError> {
        self.fragments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&frag_id)
            .cloned()
            .ok_or_else(|| fault!(ErrorKind::FragmentNotFound(frag_id)))
    }

    /// Surface the interpreter's output array as pseudo-columns on reads.
    pub fn register_interpreter_output_reader(&self) {
        self.outputs_enabled.store(true, Ordering::Relaxed);
    }

    fn with_ctx<R>(
        &self,
        frag: &Fragment,
        f: impl FnOnce(&mut ExecCtx<'_>) -> R,
    ) -> R {
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        let mut ctx = ExecCtx {
            frag,
            store: &self.store,
            arena: &mut *arena,
            disk: &self.disk,
            opts: &self.opts,
            triggers: &*self.triggers,
            index: &*self.index,
            outputs_enabled: self.outputs_enabled.load(Ordering::Relaxed),
        };
        f(&mut ctx)
    }

    /// Prime page handles for an upcoming key operation. Idempotent
    /// within one op.
    pub fn prepare_tuple_key(
        &self,
        frag_id: u64,
        page_no: u32,
        _page_idx: u16,
    ) -> Result<(), TupError> {
        let frag = self.fragment(frag_id)?;
        let _ = self.store.fetch_logical(&frag.alloc.fix_map, page_no)?;
        Ok(())
    }

    /// Execute one key request, confirming or parking it.
    pub fn execute_tuple_request(
        &self,
        req: &TupKeyRequest<'_>,
    ) -> Result<ExecResult, TupError> {
        let frag = self.fragment(req.frag_id)?;
        let result = self.with_ctx(&frag, |ctx| ops::execute(ctx, req))?;
        if let ExecResult::Suspended(token) = &result {
            self.parked
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(*token, Parked::Exec(OwnedRequest::of(req)));
        }
        Ok(result)
    }

    /// Resume an op parked on a disk-page or log-buffer callback.
    /// Re-enters execution from its recorded state.
    pub fn resume(&self, token: CallbackToken) -> Result<ExecResult, TupError> {
        let parked = self
            .parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&token)
            .ok_or_else(|| fault!(ErrorKind::UnknownCallback(token)))?;
        match parked {
            Parked::Exec(owned) => self.execute_tuple_request(&owned.as_req()),
            Parked::NrDelete { frag_id, rowid } => {
                self.nr_delete_finish(frag_id, rowid)?;
                Ok(ExecResult::Confirm(Default::default()))
            }
        }
    }

    /// Disk-page-resident callback.
    pub fn on_page_loaded(&self, token: CallbackToken) -> Result<ExecResult, TupError> {
        self.resume(token)
    }

    /// Reorg-target-page-resident callback.
    pub fn on_extra_page_loaded(&self, token: CallbackToken) -> Result<ExecResult, TupError> {
        self.resume(token)
    }

    /// Log-buffer-space callback.
    pub fn on_log_buffer_ready(&self, token: CallbackToken) -> Result<ExecResult, TupError> {
        self.resume(token)
    }

    /// Pre-step for a disk-bearing key op: make the row's disk pages
    /// resident. Returns 1 when synchronous, 0 when pending (a callback
    /// fires later).
    pub fn load_diskpage(&self, frag_id: u64, rowid: RowId) -> Result<i32, TupError> {
        let frag = self.fragment(frag_id)?;
        let table = frag.table.clone();
        if !table.has_diskpart() {
            return Ok(1);
        }
        let page = self.store.fetch_logical(&frag.alloc.fix_map, rowid.page_no)?;
        let dref = {
            let base = ops::BaseRow::capture(&page, rowid, &table);
            if base.bits.contains(HeaderBits::FREE) {
                return Err(fault!(ErrorKind::TupleNotFound));
            }
            base.disk_ref(&table)
        };
        let Some(dref) = dref else { return Ok(1) };
        match self.disk.cache().request_page(dref.file_no, dref.page_no)? {
            DiskResult::Ready(()) => Ok(1),
            DiskResult::Pending(_) => Ok(0),
        }
    }

    /// Scan variant of [`Engine::load_diskpage`].
    pub fn load_diskpage_scan(&self, frag_id: u64, rowid: RowId) -> Result<i32, TupError> {
        self.load_diskpage(frag_id, rowid)
    }

    /// Commit every in-flight op on a row, coalescing the chain leader's
    /// image into the base slot.
    pub fn commit_row(&self, frag_id: u64, rowid: RowId) -> Result<(), TupError> {
        let frag = self.fragment(frag_id)?;
        self.with_ctx(&frag, |ctx| ops::commit_row(ctx, rowid))
    }

    /// Abort every in-flight op on a row, restoring the committed image.
    pub fn abort_row(&self, frag_id: u64, rowid: RowId) -> Result<(), TupError> {
        let frag = self.fragment(frag_id)?;
        self.with_ctx(&frag, |ctx| ops::abort_row(ctx, rowid))
    }

    /// Node-recovery read: emit the primary-key columns of the row at
    /// `rowid`. Returns the byte length of the emitted values.
    pub fn nr_read_pk(
        &self,
        frag_id: u64,
        rowid: RowId,
        out: &mut Vec<u32>,
    ) -> Result<u32, TupError> {
        let frag = self.fragment(frag_id)?;
        let table = frag.table.clone();
        let page = self.store.fetch_logical(&frag.alloc.fix_map, rowid.page_no)?;
        let base = ops::BaseRow::capture(&page, rowid, &table);
        if base.bits.contains(HeaderBits::FREE) {
            return Err(fault!(ErrorKind::TupleNotFound));
        }
        checksum::verify(
            &base.fixed,
            table.fix_row_words,
            self.opts.corrupt_policy,
            rowid,
        )?;
        let image = prepare_read(&table, &base.fixed, None, None)?;
        let mut bytes = 0;
        for &pk in &table.pk_order {
            bytes += read_attr_into(&table, &image, pk, out)?;
        }
        Ok(bytes)
    }

    /// Node-recovery GCI maintenance on a row slot.
    pub fn nr_update_gci(
        &self,
        frag_id: u64,
        rowid: RowId,
        gci: u32,
        tuple_exists: bool,
    ) -> Result<(), TupError> {
        let frag = self.fragment(frag_id)?;
        let table = frag.table.clone();
        let page = self.store.fetch_logical(&frag.alloc.fix_map, rowid.page_no)?;
        let mut guard = page.lock();
        let mut fixed_page = FixedPage::new(guard.bytes_mut());
        let slot = fixed_page.row_mut(rowid.page_idx);
        let free = RowRef(slot).bits().contains(HeaderBits::FREE);
        if free != !tuple_exists {
            return Err(fault!(ErrorKind::TupleNotFound));
        }
        if tuple_exists {
            let mut row = RowMut(slot);
            row.set_gci(gci);
            checksum::set(row.0, table.fix_row_words);
        }
        Ok(())
    }

    /// Node-recovery delete of a committed row. Returns 0 when complete,
    /// 1 when parked on a disk page or log buffer; the matching
    /// callbacks finish it.
    pub fn nr_delete(&self, frag_id: u64, rowid: RowId, _gci: u32) -> Result<i32, TupError> {
        let frag = self.fragment(frag_id)?;
        let table = frag.table.clone();
        let page = self.store.fetch_logical(&frag.alloc.fix_map, rowid.page_no)?;
        let dref = {
            let base = ops::BaseRow::capture(&page, rowid, &table);
            if base.bits.contains(HeaderBits::FREE) {
                return Err(fault!(ErrorKind::TupleNotFound));
            }
            base.disk_ref(&table)
        };
        if let Some(dref) = dref {
            if let DiskResult::Pending(token) =
                self.disk.cache().request_page(dref.file_no, dref.page_no)?
            {
                self.parked
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(token, Parked::NrDelete { frag_id, rowid });
                return Ok(1);
            }
        }
        self.nr_delete_finish(frag_id, rowid)?;
        Ok(0)
    }

    /// Page-resident callback for a parked recovery delete.
    pub fn nr_delete_page_callback(&self, token: CallbackToken) -> Result<(), TupError> {
        self.resume(token).map(|_| ())
    }

    /// Log-buffer callback for a parked recovery delete.
    pub fn nr_delete_log_buffer_callback(&self, token: CallbackToken) -> Result<(), TupError> {
        self.resume(token).map(|_| ())
    }

    fn nr_delete_finish(&self, frag_id: u64, rowid: RowId) -> Result<(), TupError> {
        let frag = self.fragment(frag_id)?;
        let table = frag.table.clone();
        let page = self.store.fetch_logical(&frag.alloc.fix_map, rowid.page_no)?;
        let var_ref = {
            let base = ops::BaseRow::capture(&page, rowid, &table);
            base.var_ref(&table)
        };
        if let Some(vref) = var_ref {
            frag.alloc.free_var(vref)?;
        }
        {
            let mut guard = page.lock();
            let mut fixed_page = FixedPage::new(guard.bytes_mut());
            let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
            row.set_bits(HeaderBits::FREE);
            row.set_op_ptr(crate::RNIL);
        }
        frag.alloc.free_fixed(rowid)?;
        frag.dec_row_count();
        Ok(())
    }

    /// Compact variable pages with at least `min_dead_words` reclaimable.
    pub fn optimize_fragment(&self, frag_id: u64, min_dead_words: u16) -> Result<u32, TupError> {
        let frag = self.fragment(frag_id)?;
        let _excl = frag.lock.write_key().upgrade();
        frag.alloc.optimize(min_dead_words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{CondCode, NullSemantics, Op, Program, ProgramBuilder};
    use crate::rowcodec::{parse_attr_header, value_bytes, AttrWrite};
    use crate::schema::{AttrDescr, AttrStorage, ColType};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pk_b_c_table() -> TableDescriptor {
        TableDescriptor::build(
            1,
            vec![
                AttrDescr::new(0, "a", ColType::Uint32, AttrStorage::FixedMem).pk(),
                AttrDescr::new(1, "b", ColType::Varchar, AttrStorage::VarMem).max_bytes(16),
                AttrDescr::new(2, "c", ColType::Uint32, AttrStorage::FixedMem),
            ],
        )
        .unwrap()
    }

    fn engine() -> Engine {
        init_logging();
        let mut opts = EngineOptions::new();
        opts.pool_bytes(64 * crate::PAGE_BYTES);
        let engine = Engine::open(opts).unwrap();
        engine
            .create_fragment(1, pk_b_c_table(), 1)
            .unwrap();
        engine
    }

    fn writes_attrinfo(writes: &[(u32, Option<&[u8]>)]) -> Vec<u32> {
        let mut words = Vec::new();
        for (id, v) in writes {
            AttrWrite {
                attr_id: *id,
                value: v.map(|v| v.to_vec()),
            }
            .encode_into(&mut words);
        }
        words
    }

    fn exec(
        e: &Engine,
        op_type: OpType,
        rowid: RowId,
        attrinfo: &[u32],
        trans: TransId,
        savepoint: u64,
        flags: ReqFlags,
    ) -> Result<ExecResult, TupError> {
        e.execute_tuple_request(&TupKeyRequest {
            frag_id: 1,
            op_type,
            rowid,
            attrinfo,
            trans,
            savepoint,
            flags,
            gci: None,
            user_ptr: 0,
            any_value: 0,
        })
    }

    fn confirm(r: Result<ExecResult, TupError>) -> crate::ops::TupKeyConf {
        match r.unwrap() {
            ExecResult::Confirm(c) => c,
            ExecResult::Suspended(t) => panic!("unexpected suspension, token {t}"),
        }
    }

    /// Insert a committed row {a, b, c}; returns its rowid.
    fn seed_row(e: &Engine, a: u32, b: &[u8], c: u32) -> RowId {
        let trans = TransId::new(77, a);
        let attrinfo = writes_attrinfo(&[
            (0, Some(&a.to_le_bytes())),
            (1, Some(b)),
            (2, Some(&c.to_le_bytes())),
        ]);
        let conf = confirm(exec(
            e,
            OpType::Insert,
            RowId::new(0, 0),
            &attrinfo,
            trans,
            1,
            ReqFlags::default(),
        ));
        let rowid = conf.rowid_created.unwrap();
        e.commit_row(1, rowid).unwrap();
        rowid
    }

    fn read_values(conf: &crate::ops::TupKeyConf) -> Vec<(u32, Option<Vec<u8>>)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < conf.read.len() {
            let (id, size, _) = parse_attr_header(conf.read[pos]);
            pos += 1;
            if size == 0 {
                out.push((id, None));
                continue;
            }
            let words = (size as usize).div_ceil(4);
            out.push((
                id,
                Some(value_bytes(&conf.read[pos..pos + words], size as usize)),
            ));
            pos += words;
        }
        out
    }

    #[test]
    fn pk_read_returns_values() {
        let e = engine();
        let rowid = seed_row(&e, 7, b"hello", 42);

        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[1, 2],
            TransId::new(9, 9),
            1,
            ReqFlags::default(),
        ));
        let vals = read_values(&conf);
        assert_eq!(vals[0], (1, Some(b"hello".to_vec())));
        assert_eq!(vals[1], (2, Some(42u32.to_le_bytes().to_vec())));
        assert!(conf.log.is_empty());
        assert_eq!(e.fragment(1).unwrap().row_count(), 1);
    }

    #[test]
    fn insert_then_update_same_transaction() {
        let e = engine();
        let trans = TransId::new(5, 5);

        let attrinfo = writes_attrinfo(&[
            (0, Some(&1u32.to_le_bytes())),
            (1, Some(b"x")),
            (2, Some(&0u32.to_le_bytes())),
        ]);
        let conf = confirm(exec(
            &e,
            OpType::Insert,
            RowId::new(0, 0),
            &attrinfo,
            trans,
            1,
            ReqFlags::default(),
        ));
        let rowid = conf.rowid_created.unwrap();
        let ins_op = conf.op_ref.unwrap();
        {
            let arena = e.arena.lock().unwrap();
            assert_eq!(arena.get(ins_op).tup_version, 1);
        }

        let attrinfo = writes_attrinfo(&[(1, Some(b"xy"))]);
        let conf = confirm(exec(
            &e,
            OpType::Update,
            rowid,
            &attrinfo,
            trans,
            2,
            ReqFlags::default(),
        ));
        let upd_op = conf.op_ref.unwrap();
        {
            let arena = e.arena.lock().unwrap();
            assert_eq!(arena.get(upd_op).tup_version, 2);
        }

        // same-transaction read at a later savepoint sees the update
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[1],
            trans,
            3,
            ReqFlags::default(),
        ));
        assert_eq!(read_values(&conf)[0], (1, Some(b"xy".to_vec())));

        // foreign reader sees nothing: the insert is uncommitted
        let r = exec(
            &e,
            OpType::Read,
            rowid,
            &[1],
            TransId::new(8, 8),
            9,
            ReqFlags {
                dirty: true,
                ..Default::default()
            },
        );
        assert!(r.is_err());

        e.commit_row(1, rowid).unwrap();
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[1],
            TransId::new(8, 8),
            1,
            ReqFlags::default(),
        ));
        assert_eq!(read_values(&conf)[0], (1, Some(b"xy".to_vec())));
    }

    #[test]
    fn mm_grown_on_word_crossing_growth() {
        let e = engine();
        let rowid = seed_row(&e, 3, b"ab", 0);
        let trans = TransId::new(6, 6);

        let attrinfo = writes_attrinfo(&[(1, Some(b"abcdefghijkl"))]);
        confirm(exec(
            &e,
            OpType::Update,
            rowid,
            &attrinfo,
            trans,
            1,
            ReqFlags::default(),
        ));

        // the base row carries MM_GROWN with the pre-grow length stored
        let frag = e.fragment(1).unwrap();
        let page = e
            .store
            .fetch_logical(&frag.alloc.fix_map, rowid.page_no)
            .unwrap();
        let base = ops::BaseRow::capture(&page, rowid, &frag.table);
        assert!(base.bits.contains(HeaderBits::MM_GROWN));
        let vref = base.var_ref(&frag.table).unwrap();
        let slot = frag.alloc.read_var(vref).unwrap();
        let pre_grow = u32::from_le_bytes(slot[slot.len() - 4..].try_into().unwrap());
        assert!(pre_grow as usize * 4 < slot.len());

        // abort restores the original image and clears the flag
        e.abort_row(1, rowid).unwrap();
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[1],
            TransId::new(9, 9),
            1,
            ReqFlags::default(),
        ));
        assert_eq!(read_values(&conf)[0], (1, Some(b"ab".to_vec())));
        let base = ops::BaseRow::capture(&page, rowid, &frag.table);
        assert!(!base.bits.contains(HeaderBits::MM_GROWN));
    }

    #[test]
    fn delete_then_insert_same_rowid() {
        let e = engine();
        let rowid = seed_row(&e, 5, b"q", 9);
        let trans = TransId::new(4, 4);

        let conf = confirm(exec(
            &e,
            OpType::Delete,
            rowid,
            &[],
            trans,
            1,
            ReqFlags::default(),
        ));
        let del_op = conf.op_ref.unwrap();

        let attrinfo = writes_attrinfo(&[
            (0, Some(&5u32.to_le_bytes())),
            (1, Some(b"r")),
            (2, Some(&9u32.to_le_bytes())),
        ]);
        let conf = confirm(exec(
            &e,
            OpType::Insert,
            rowid,
            &attrinfo,
            trans,
            2,
            ReqFlags {
                use_rowid: true,
                ..Default::default()
            },
        ));
        let ins_op = conf.op_ref.unwrap();
        {
            use crate::chain::OpFlags;
            let arena = e.arena.lock().unwrap();
            assert!(arena.get(del_op).flags.contains(OpFlags::DELETE_INSERT));
            assert!(arena.get(ins_op).flags.contains(OpFlags::DELETE_INSERT));
        }

        // abort restores b="q"
        e.abort_row(1, rowid).unwrap();
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[1],
            TransId::new(9, 9),
            1,
            ReqFlags::default(),
        ));
        assert_eq!(read_values(&conf)[0], (1, Some(b"q".to_vec())));

        // redo and commit yields b="r"
        confirm(exec(&e, OpType::Delete, rowid, &[], trans, 1, ReqFlags::default()));
        let attrinfo = writes_attrinfo(&[
            (0, Some(&5u32.to_le_bytes())),
            (1, Some(b"r")),
            (2, Some(&9u32.to_le_bytes())),
        ]);
        confirm(exec(
            &e,
            OpType::Insert,
            rowid,
            &attrinfo,
            trans,
            2,
            ReqFlags {
                use_rowid: true,
                ..Default::default()
            },
        ));
        e.commit_row(1, rowid).unwrap();
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[1],
            TransId::new(9, 9),
            1,
            ReqFlags::default(),
        ));
        assert_eq!(read_values(&conf)[0], (1, Some(b"r".to_vec())));
        assert_eq!(e.fragment(1).unwrap().row_count(), 1);
    }

    #[test]
    fn interpreted_filter_hit_and_miss() {
        let e = engine();
        let rowid = seed_row(&e, 7, b"hi", 5);

        // refuse unless c > 100
        let mut b = ProgramBuilder::new();
        let keep = b.label();
        b.read_attr_to_reg(0, 2);
        b.branch_const(Op::BranchGtConst, 0, 100, keep);
        b.exit_refuse(626);
        b.bind(keep);
        b.exit_ok();
        let program = Program::assemble(&[], &b.finish(), &[], &[1], &[]);

        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &program,
            TransId::new(9, 9),
            1,
            ReqFlags {
                interpreted: true,
                ..Default::default()
            },
        ));
        assert_eq!(conf.refused, Some(626));
        assert!(conf.read.is_empty());
        assert!(conf.interp_instructions > 0);

        // a row passing the filter emits its final-read data
        let rowid2 = seed_row(&e, 8, b"yo", 200);
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid2,
            &program,
            TransId::new(9, 9),
            1,
            ReqFlags {
                interpreted: true,
                ..Default::default()
            },
        ));
        assert_eq!(conf.refused, None);
        assert_eq!(read_values(&conf)[0], (1, Some(b"yo".to_vec())));
    }

    #[test]
    fn interpreted_varchar_append() {
        let e = engine();
        let rowid = seed_row(&e, 2, b"abc", 0);
        let trans = TransId::new(3, 3);

        let mut b = ProgramBuilder::new();
        b.load_const_mem(0, 10, b"de");
        b.append_attr_from_mem(0, 10, 1);
        b.exit_ok();
        let program = Program::assemble(&[], &b.finish(), &[], &[], &[]);

        let conf = confirm(exec(
            &e,
            OpType::Update,
            rowid,
            &program,
            trans,
            1,
            ReqFlags {
                interpreted: true,
                ..Default::default()
            },
        ));
        // the scripted write went to the replication log
        let logged = AttrWrite::parse_all(&conf.log).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].value.as_deref(), Some(&b"abcde"[..]));

        e.commit_row(1, rowid).unwrap();
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[1],
            TransId::new(9, 9),
            1,
            ReqFlags::default(),
        ));
        assert_eq!(read_values(&conf)[0], (1, Some(b"abcde".to_vec())));
    }

    fn disk_table() -> TableDescriptor {
        TableDescriptor::build(
            2,
            vec![
                AttrDescr::new(0, "pk", ColType::Uint32, AttrStorage::FixedMem).pk(),
                AttrDescr::new(1, "dv", ColType::Varbinary, AttrStorage::VarDisk)
                    .max_bytes(1024)
                    .nullable(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn disk_growth_moves_row_to_new_page() {
        init_logging();
        let mut opts = EngineOptions::new();
        opts.pool_bytes(64 * crate::PAGE_BYTES);
        let log = Arc::new(MemLogManager::new(1 << 20));
        let cache = Arc::new(MemDiskCache::new(120));
        let e = Engine::open_with_ports(
            opts,
            log.clone(),
            cache.clone(),
            Arc::new(NoHooks),
            Arc::new(NoHooks),
        )
        .unwrap();
        e.create_fragment(1, disk_table(), 1).unwrap();

        let trans = TransId::new(2, 2);
        let attrinfo = writes_attrinfo(&[
            (0, Some(&1u32.to_le_bytes())),
            (1, Some(&[7u8; 200])),
        ]);
        let conf = confirm(exec(
            &e,
            OpType::Insert,
            RowId::new(0, 0),
            &attrinfo,
            trans,
            1,
            ReqFlags::default(),
        ));
        let rowid = conf.rowid_created.unwrap();
        e.commit_row(1, rowid).unwrap();

        // grow the disk part past what its page can absorb
        let trans2 = TransId::new(3, 3);
        assert_eq!(e.load_diskpage(1, rowid).unwrap(), 1);
        let attrinfo = writes_attrinfo(&[(1, Some(&[8u8; 250]))]);
        let conf = confirm(exec(
            &e,
            OpType::Update,
            rowid,
            &attrinfo,
            trans2,
            1,
            ReqFlags::default(),
        ));
        let op = conf.op_ref.unwrap();
        {
            let arena = e.arena.lock().unwrap();
            let rec = arena.get(op);
            assert!(rec.disk_reorg_ref.is_some());
            assert_eq!(rec.uncommitted_used_space, 0);
            // UNDO covers the update record plus the alloc record
            assert!(rec.undo_buffer_space > crate::disk::UNDO_ALLOC_WORDS);
        }
        let frag = e.fragment(1).unwrap();
        let page = e
            .store
            .fetch_logical(&frag.alloc.fix_map, rowid.page_no)
            .unwrap();
        let base = ops::BaseRow::capture(&page, rowid, &frag.table);
        assert!(base.bits.contains(HeaderBits::DISK_REORG));
    }

    #[test]
    fn suspension_and_resume_on_log_pressure() {
        init_logging();
        let mut opts = EngineOptions::new();
        opts.pool_bytes(64 * crate::PAGE_BYTES);
        let log = Arc::new(MemLogManager::new(1 << 20));
        let cache = Arc::new(MemDiskCache::new(4096));
        let e = Engine::open_with_ports(
            opts,
            log.clone(),
            cache.clone(),
            Arc::new(NoHooks),
            Arc::new(NoHooks),
        )
        .unwrap();
        e.create_fragment(1, disk_table(), 1).unwrap();

        let attrinfo = writes_attrinfo(&[
            (0, Some(&1u32.to_le_bytes())),
            (1, Some(&[7u8; 100])),
        ]);
        let conf = confirm(exec(
            &e,
            OpType::Insert,
            RowId::new(0, 0),
            &attrinfo,
            TransId::new(2, 2),
            1,
            ReqFlags::default(),
        ));
        let rowid = conf.rowid_created.unwrap();
        e.commit_row(1, rowid).unwrap();

        log.set_pending(1);
        let attrinfo = writes_attrinfo(&[(1, Some(&[9u8; 120]))]);
        let r = exec(
            &e,
            OpType::Update,
            rowid,
            &attrinfo,
            TransId::new(3, 3),
            1,
            ReqFlags::default(),
        )
        .unwrap();
        let token = match r {
            ExecResult::Suspended(t) => t,
            other => panic!("expected suspension, got {other:?}"),
        };
        // the callback resumes the op from scratch and it completes
        let resumed = e.on_log_buffer_ready(token).unwrap();
        assert!(matches!(resumed, ExecResult::Confirm(_)));
        e.commit_row(1, rowid).unwrap();
    }

    #[test]
    fn interpreter_outputs_surface_as_pseudo_columns() {
        let e = engine();
        e.register_interpreter_output_reader();
        let rowid = seed_row(&e, 4, b"zz", 11);

        let mut b = ProgramBuilder::new();
        b.read_attr_to_reg(0, 2);
        b.arith_const(Op::MulConstReg, 1, 0, 3);
        b.write_output(1, 2);
        b.exit_ok();
        let program = Program::assemble(
            &[],
            &b.finish(),
            &[],
            &[ops::PSEUDO_OUTPUT_BASE + 2],
            &[],
        );
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &program,
            TransId::new(9, 9),
            1,
            ReqFlags {
                interpreted: true,
                ..Default::default()
            },
        ));
        let vals = read_values(&conf);
        assert_eq!(
            vals[0],
            (
                ops::PSEUDO_OUTPUT_BASE + 2,
                Some(33u32.to_le_bytes().to_vec())
            )
        );
    }

    #[test]
    fn nr_recovery_surface() {
        let e = engine();
        let rowid = seed_row(&e, 21, b"rec", 1);

        let mut out = Vec::new();
        let bytes = e.nr_read_pk(1, rowid, &mut out).unwrap();
        assert_eq!(bytes, 4);
        let vals = {
            let conf = crate::ops::TupKeyConf {
                read: out,
                ..Default::default()
            };
            read_values(&conf)
        };
        assert_eq!(vals[0], (0, Some(21u32.to_le_bytes().to_vec())));

        e.nr_update_gci(1, rowid, 900, true).unwrap();
        let frag = e.fragment(1).unwrap();
        let page = e
            .store
            .fetch_logical(&frag.alloc.fix_map, rowid.page_no)
            .unwrap();
        let base = ops::BaseRow::capture(&page, rowid, &frag.table);
        assert_eq!(RowRef(&base.fixed).gci(), 900);
        checksum::verify(
            &base.fixed,
            frag.table.fix_row_words,
            crate::config::CorruptPolicy::Error,
            rowid,
        )
        .unwrap();

        assert_eq!(e.nr_delete(1, rowid, 901).unwrap(), 0);
        assert!(e.nr_read_pk(1, rowid, &mut Vec::new()).is_err());
        assert_eq!(frag.row_count(), 0);
    }

    #[test]
    fn refresh_materialises_missing_row() {
        let e = engine();
        let trans = TransId::new(11, 11);
        let rowid = RowId::new(0, 3);
        let attrinfo = writes_attrinfo(&[(0, Some(&77u32.to_le_bytes()))]);
        let conf = confirm(exec(
            &e,
            OpType::Refresh,
            rowid,
            &attrinfo,
            trans,
            1,
            ReqFlags {
                use_rowid: true,
                ..Default::default()
            },
        ));
        assert_eq!(conf.rowid_created, Some(rowid));
        e.commit_row(1, rowid).unwrap();

        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[0, 1],
            TransId::new(9, 9),
            1,
            ReqFlags::default(),
        ));
        let vals = read_values(&conf);
        assert_eq!(vals[0], (0, Some(77u32.to_le_bytes().to_vec())));
    }

    #[test]
    fn delete_parks_keep_entry_before_lcp_skip() {
        let e = engine();
        let rowid = seed_row(&e, 31, b"keep", 0);
        let frag = e.fragment(1).unwrap();
        frag.start_lcp_scan(RowId::new(0, 0));

        confirm(exec(
            &e,
            OpType::Delete,
            rowid,
            &[],
            TransId::new(12, 12),
            1,
            ReqFlags::default(),
        ));
        assert_eq!(frag.keep_list_len(), 1);
        let page = e
            .store
            .fetch_logical(&frag.alloc.fix_map, rowid.page_no)
            .unwrap();
        let base = ops::BaseRow::capture(&page, rowid, &frag.table);
        assert!(base.bits.contains(HeaderBits::LCP_SKIP));

        let entries = frag.take_keep_entries();
        assert_eq!(entries[0].rowid, rowid);
        // the parked image is the pre-delete fixed part
        assert!(!RowRef(&entries[0].image).bits().contains(HeaderBits::FREE));
    }

    #[test]
    fn sequencing_errors_reported() {
        let e = engine();
        let rowid = seed_row(&e, 41, b"s", 0);
        let trans = TransId::new(13, 13);

        // update after delete in the same transaction
        confirm(exec(&e, OpType::Delete, rowid, &[], trans, 1, ReqFlags::default()));
        let attrinfo = writes_attrinfo(&[(1, Some(b"t"))]);
        let err = exec(&e, OpType::Update, rowid, &attrinfo, trans, 2, ReqFlags::default())
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Seq(crate::SeqError::TupleDeleted)
        ));
        e.abort_row(1, rowid).unwrap();

        // insert on an existing committed row
        let attrinfo = writes_attrinfo(&[
            (0, Some(&41u32.to_le_bytes())),
            (1, Some(b"u")),
            (2, Some(&0u32.to_le_bytes())),
        ]);
        let err = exec(
            &e,
            OpType::Insert,
            rowid,
            &attrinfo,
            trans,
            3,
            ReqFlags {
                use_rowid: true,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Seq(crate::SeqError::AlreadyExists)
        ));
    }

    #[test]
    fn undo_reservation_monotonic_until_reorg() {
        init_logging();
        let mut opts = EngineOptions::new();
        opts.pool_bytes(64 * crate::PAGE_BYTES);
        let log = Arc::new(MemLogManager::new(1 << 20));
        let cache = Arc::new(MemDiskCache::new(4096));
        let e = Engine::open_with_ports(
            opts,
            log.clone(),
            cache,
            Arc::new(NoHooks),
            Arc::new(NoHooks),
        )
        .unwrap();
        e.create_fragment(1, disk_table(), 1).unwrap();

        let trans = TransId::new(2, 2);
        let attrinfo = writes_attrinfo(&[
            (0, Some(&1u32.to_le_bytes())),
            (1, Some(&[7u8; 40])),
        ]);
        let conf = confirm(exec(
            &e,
            OpType::Insert,
            RowId::new(0, 0),
            &attrinfo,
            trans,
            1,
            ReqFlags::default(),
        ));
        let rowid = conf.rowid_created.unwrap();
        let mut last = {
            let arena = e.arena.lock().unwrap();
            arena.get(conf.op_ref.unwrap()).undo_buffer_space
        };
        assert!(last > 0);

        for (sp, len) in [(2u64, 60usize), (3, 80)] {
            let attrinfo = writes_attrinfo(&[(1, Some(&vec![9u8; len]))]);
            let conf = confirm(exec(
                &e,
                OpType::Update,
                rowid,
                &attrinfo,
                trans,
                sp,
                ReqFlags::default(),
            ));
            let arena = e.arena.lock().unwrap();
            let now = arena.get(conf.op_ref.unwrap()).undo_buffer_space;
            assert!(now >= last, "undo reservation shrank: {now} < {last}");
            last = now;
        }
        e.commit_row(1, rowid).unwrap();
    }

    #[test]
    fn recorded_sizes_match_shrink() {
        let e = engine();
        let rowid = seed_row(&e, 51, b"abc", 1);
        let trans = TransId::new(14, 14);
        let attrinfo = writes_attrinfo(&[(1, Some(b"abcdefgh"))]);
        let conf = confirm(exec(
            &e,
            OpType::Update,
            rowid,
            &attrinfo,
            trans,
            1,
            ReqFlags::default(),
        ));
        let arena = e.arena.lock().unwrap();
        let rec = arena.get(conf.op_ref.unwrap());
        let copy = rec.copy.as_ref().unwrap();
        assert_eq!(Some(rec.sizes), copy.packed);
        assert!(rec.sizes.mm > 0);
    }

    #[test]
    fn reorg_scan_filtering() {
        let e = engine();
        let rowid = seed_row(&e, 61, b"m", 0);

        // mark the row as moved
        {
            let frag = e.fragment(1).unwrap();
            let page = e
                .store
                .fetch_logical(&frag.alloc.fix_map, rowid.page_no)
                .unwrap();
            let mut guard = page.lock();
            let mut fixed_page = FixedPage::new(guard.bytes_mut());
            let mut row = RowMut(fixed_page.row_mut(rowid.page_idx));
            let old = row.bits();
            let new = old | HeaderBits::REORG_MOVE;
            row.set_bits(new);
            checksum::update(row.0, old.bits(), new.bits());
        }

        let read = |reorg| {
            exec(
                &e,
                OpType::Read,
                rowid,
                &[0],
                TransId::new(9, 9),
                1,
                ReqFlags {
                    reorg,
                    ..Default::default()
                },
            )
        };
        assert!(read(crate::ops::ReorgKind::All).is_ok());
        assert!(read(crate::ops::ReorgKind::Moved).is_ok());
        let err = read(crate::ops::ReorgKind::NotMoved).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Seq(crate::SeqError::TupleDeleted)
        ));
    }

    #[test]
    fn interpreted_update_with_typed_branch() {
        let e = engine();
        let rowid = seed_row(&e, 71, b"hello", 10);
        let trans = TransId::new(15, 15);

        // only rows whose b matches "hel%" get c rewritten
        let mut b = ProgramBuilder::new();
        let hit = b.label();
        b.branch_attr_arg(1, CondCode::Like, NullSemantics::Legacy, b"hel%", hit);
        b.exit_refuse(3);
        b.bind(hit);
        b.exit_ok();
        let upd = writes_attrinfo(&[(2, Some(&99u32.to_le_bytes()))]);
        let program = Program::assemble(&[], &b.finish(), &upd, &[], &[]);

        confirm(exec(
            &e,
            OpType::Update,
            rowid,
            &program,
            trans,
            1,
            ReqFlags {
                interpreted: true,
                ..Default::default()
            },
        ));
        e.commit_row(1, rowid).unwrap();
        let conf = confirm(exec(
            &e,
            OpType::Read,
            rowid,
            &[2],
            TransId::new(9, 9),
            1,
            ReqFlags::default(),
        ));
        assert_eq!(read_values(&conf)[0], (2, Some(99u32.to_le_bytes().to_vec())));
    }
}
