//! Slot allocation for rows: fixed-slot pages for the fixed parts,
//! slot-directory pages with free-space buckets for the variable parts.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::config::BUCKET_COUNT;
use crate::error::ErrorKind;
use crate::page::PageKind;
use crate::rowcodec::VarRef;
use crate::store::{PageMap, PageStore, PageSlot};
use crate::{fault, PageNo, RowId, TupError};

/// The overflow bucket: pages that should not be offered allocations.
pub const BUCKET_MAX: u16 = BUCKET_COUNT as u16;

struct AllocState {
    /// Fixed pages known to have at least one free slot.
    free_fixed: BTreeSet<PageNo>,
    /// Var pages per free-space bucket; the last entry is BUCKET_MAX.
    var_buckets: [BTreeSet<u16>; BUCKET_COUNT + 1],
    next_fix_page: PageNo,
    next_var_page: u32,
}

/// Per-fragment slot allocator.
///
/// All mutation runs in the fragment's writer context; the internal mutex
/// only guards against engine-level accessors racing page creation.
pub struct TupleAllocator {
    store: Arc<PageStore>,
    /// Rowid space: logical fixed pages.
    pub fix_map: PageMap,
    /// Var space: logical var pages, addressed by the 16-bit half of a
    /// [`VarRef`].
    pub var_map: PageMap,
    row_words: u16,
    bucket_bounds: [u16; BUCKET_COUNT],
    state: Mutex<AllocState>,
}

impl TupleAllocator {
    pub fn new(store: Arc<PageStore>, row_words: u16, bucket_bounds: [u16; BUCKET_COUNT]) -> Self {
        Self {
            store,
            fix_map: PageMap::new(),
            var_map: PageMap::new(),
            row_words,
            bucket_bounds,
            state: Mutex::new(AllocState {
                free_fixed: BTreeSet::new(),
                var_buckets: Default::default(),
                next_fix_page: 0,
                next_var_page: 0,
            }),
        }
    }

    pub fn row_words(&self) -> u16 {
        self.row_words
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Which bucket a page with `contiguous` free words belongs in.
    fn bucket_for(&self, contiguous: u16) -> u16 {
        if contiguous == 0 {
            return BUCKET_MAX;
        }
        for (i, &bound) in self.bucket_bounds.iter().enumerate() {
            if contiguous >= bound {
                return i as u16;
            }
        }
        BUCKET_MAX
    }

    fn fetch_fix(&self, page_no: PageNo) -> Result<Arc<PageSlot>, TupError> {
        self.store.fetch_logical(&self.fix_map, page_no)
    }

    fn fetch_var(&self, page_no: u16) -> Result<Arc<PageSlot>, TupError> {
        self.store.fetch_logical(&self.var_map, page_no as PageNo)
    }

    fn add_fix_page(&self, state: &mut AllocState) -> Result<PageNo, TupError> {
        let logical = state.next_fix_page;
        state.next_fix_page += 1;
        let (phys, _) = self
            .store
            .alloc_page(PageKind::Fixed, logical, self.row_words)?;
        self.fix_map.insert(logical, phys);
        state.free_fixed.insert(logical);
        Ok(logical)
    }

    fn add_var_page(&self, state: &mut AllocState) -> Result<u16, TupError> {
        if state.next_var_page >= u16::MAX as u32 {
            return Err(fault!(ErrorKind::VarPartLimit));
        }
        let logical = state.next_var_page as u16;
        state.next_var_page += 1;
        let (phys, _) = self.store.alloc_page(PageKind::Var, logical as PageNo, 0)?;
        self.var_map.insert(logical as PageNo, phys);
        state.var_buckets[0].insert(logical);
        Ok(logical)
    }

    /// Allocate a fixed slot anywhere in the fragment.
    pub fn alloc_fixed(&self) -> Result<RowId, TupError> {
        let mut state = self.lock_state();
        loop {
            let page_no = match state.free_fixed.iter().next().copied() {
                Some(p) => p,
                None => self.add_fix_page(&mut state)?,
            };
            let slot_arc = self.fetch_fix(page_no)?;
            let mut guard = slot_arc.lock();
            let mut page = guard.fixed();
            match page.alloc() {
                Some(idx) => {
                    if page.free_slots() == 0 {
                        state.free_fixed.remove(&page_no);
                    }
                    return Ok(RowId::new(page_no, idx));
                }
                None => {
                    // stale entry; drop it and retry
                    state.free_fixed.remove(&page_no);
                }
            }
        }
    }

    /// Allocate the exact rowid, creating intermediate pages as needed.
    /// Used by node-recovery copy, which replays rows at their home
    /// locations.
    pub fn alloc_fixed_at(&self, rowid: RowId) -> Result<(), TupError> {
        let mut state = self.lock_state();
        while state.next_fix_page <= rowid.page_no {
            self.add_fix_page(&mut state)?;
        }
        let slot_arc = self.fetch_fix(rowid.page_no)?;
        let mut guard = slot_arc.lock();
        let mut page = guard.fixed();
        if !page.alloc_at(rowid.page_idx) {
            return Err(fault!(ErrorKind::InvalidRowId));
        }
        if page.free_slots() == 0 {
            state.free_fixed.remove(&rowid.page_no);
        }
        Ok(())
    }

    pub fn free_fixed(&self, rowid: RowId) -> Result<(), TupError> {
        let slot_arc = self.fetch_fix(rowid.page_no)?;
        let mut state = self.lock_state();
        let mut guard = slot_arc.lock();
        let mut page = guard.fixed();
        page.free(rowid.page_idx);
        state.free_fixed.insert(rowid.page_no);
        Ok(())
    }

    fn requeue_var(&self, state: &mut AllocState, page_no: u16, old_bucket: u16, new_bucket: u16) {
        if old_bucket != new_bucket {
            state.var_buckets[old_bucket as usize].remove(&page_no);
            state.var_buckets[new_bucket as usize].insert(page_no);
            log::trace!("var page {page_no} bucket {old_bucket} -> {new_bucket}");
        }
    }

    /// Allocate `words` on some var page, compacting a fragmented page
    /// rather than growing the fragment when that suffices.
    pub fn alloc_var(&self, words: u16) -> Result<VarRef, TupError> {
        let mut state = self.lock_state();
        // tightest bucket first: the page least likely to be useful for
        // bigger requests later
        let mut candidates: Vec<u16> = Vec::new();
        for b in (0..BUCKET_COUNT).rev() {
            candidates.extend(state.var_buckets[b].iter().copied());
        }
        for page_no in candidates {
            let slot_arc = self.fetch_var(page_no)?;
            let mut guard = slot_arc.lock();
            let mut page = guard.var();
            let old_bucket = page.list_index();
            // one extra word pays for a possible new directory entry
            if page.contiguous_free() < words + 1 && page.free_words() >= words + 1 {
                page.compact();
            }
            if let Some(idx) = page.alloc(words, false) {
                let new_bucket = self.bucket_for(page.contiguous_free());
                page.set_list_index(new_bucket);
                self.requeue_var(&mut state, page_no, old_bucket, new_bucket);
                return Ok(VarRef {
                    page_no,
                    page_idx: idx,
                });
            }
            let new_bucket = self.bucket_for(page.contiguous_free());
            page.set_list_index(new_bucket);
            self.requeue_var(&mut state, page_no, old_bucket, new_bucket);
        }
        // nothing fits: grow the fragment
        let page_no = self.add_var_page(&mut state)?;
        let slot_arc = self.fetch_var(page_no)?;
        let mut guard = slot_arc.lock();
        let mut page = guard.var();
        let idx = page
            .alloc(words, false)
            .ok_or_else(|| fault!(ErrorKind::NoVarSlot(words as u32)))?;
        let new_bucket = self.bucket_for(page.contiguous_free());
        page.set_list_index(new_bucket);
        self.requeue_var(&mut state, page_no, 0, new_bucket);
        Ok(VarRef {
            page_no,
            page_idx: idx,
        })
    }

    /// Recovery path: allocate a var slot at an exact reference.
    pub fn alloc_var_at(&self, vref: VarRef, words: u16) -> Result<(), TupError> {
        let mut state = self.lock_state();
        while state.next_var_page <= vref.page_no as u32 {
            self.add_var_page(&mut state)?;
        }
        let slot_arc = self.fetch_var(vref.page_no)?;
        let mut guard = slot_arc.lock();
        let mut page = guard.var();
        let old_bucket = page.list_index();
        if page.contiguous_free() < words + 1 && page.free_words() >= words + 1 {
            page.compact();
        }
        if !page.alloc_at(vref.page_idx, words, false) {
            return Err(fault!(ErrorKind::NoVarSlot(words as u32)));
        }
        let new_bucket = self.bucket_for(page.contiguous_free());
        page.set_list_index(new_bucket);
        self.requeue_var(&mut state, vref.page_no, old_bucket, new_bucket);
        Ok(())
    }

    pub fn free_var(&self, vref: VarRef) -> Result<(), TupError> {
        let slot_arc = self.fetch_var(vref.page_no)?;
        let mut state = self.lock_state();
        let mut guard = slot_arc.lock();
        let mut page = guard.var();
        let old_bucket = page.list_index();
        page.free(vref.page_idx);
        let new_bucket = self.bucket_for(page.contiguous_free());
        page.set_list_index(new_bucket);
        self.requeue_var(&mut state, vref.page_no, old_bucket, new_bucket);
        Ok(())
    }

    /// Resize a var slot, relocating it when it cannot grow in place. The
    /// caller must hold exclusive fragment access when relocation is
    /// possible, and must rewrite the owning row's reference if the
    /// returned location differs.
    pub fn realloc_var(&self, vref: VarRef, new_words: u16) -> Result<VarRef, TupError> {
        {
            let slot_arc = self.fetch_var(vref.page_no)?;
            let mut state = self.lock_state();
            let mut guard = slot_arc.lock();
            let mut page = guard.var();
            let old_bucket = page.list_index();
            if page.resize_in_place(vref.page_idx, new_words) {
                let new_bucket = self.bucket_for(page.contiguous_free());
                page.set_list_index(new_bucket);
                self.requeue_var(&mut state, vref.page_no, old_bucket, new_bucket);
                return Ok(vref);
            }
            // try again with the dead space compacted away
            if page.free_words() >= new_words.saturating_sub(page.slot_words(vref.page_idx)) {
                page.compact();
                if page.resize_in_place(vref.page_idx, new_words) {
                    let new_bucket = self.bucket_for(page.contiguous_free());
                    page.set_list_index(new_bucket);
                    self.requeue_var(&mut state, vref.page_no, old_bucket, new_bucket);
                    return Ok(vref);
                }
            }
        }
        // relocate: stash the bytes, free, allocate elsewhere
        let old_bytes = {
            let slot_arc = self.fetch_var(vref.page_no)?;
            let mut guard = slot_arc.lock();
            let page = guard.var();
            page.slot(vref.page_idx).to_vec()
        };
        self.free_var(vref)?;
        let new_ref = self.alloc_var(new_words)?;
        let slot_arc = self.fetch_var(new_ref.page_no)?;
        let mut guard = slot_arc.lock();
        let mut page = guard.var();
        let dst = page.slot_mut(new_ref.page_idx);
        let n = old_bytes.len().min(dst.len());
        dst[..n].copy_from_slice(&old_bytes[..n]);
        log::debug!(
            "var slot moved ({}, {}) -> ({}, {})",
            vref.page_no,
            vref.page_idx,
            new_ref.page_no,
            new_ref.page_idx
        );
        Ok(new_ref)
    }

    /// Copy a var slot's current bytes.
    pub fn read_var(&self, vref: VarRef) -> Result<Vec<u8>, TupError> {
        let slot_arc = self.fetch_var(vref.page_no)?;
        let mut guard = slot_arc.lock();
        let page = guard.var();
        Ok(page.slot(vref.page_idx).to_vec())
    }

    /// Overwrite a var slot's bytes (must fit the slot).
    pub fn write_var(&self, vref: VarRef, bytes: &[u8]) -> Result<(), TupError> {
        let slot_arc = self.fetch_var(vref.page_no)?;
        let mut guard = slot_arc.lock();
        let mut page = guard.var();
        let dst = page.slot_mut(vref.page_idx);
        if bytes.len() > dst.len() {
            return Err(fault!(ErrorKind::NoVarSlot((bytes.len() / 4) as u32)));
        }
        dst[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Explicit maintenance entry point: compact every var page whose
    /// dead space exceeds `min_dead_words`.
    pub fn optimize(&self, min_dead_words: u16) -> Result<u32, TupError> {
        let mut compacted = 0;
        let pages = self.var_map.logical_pages();
        for page_no in pages {
            let slot_arc = self.store.fetch_logical(&self.var_map, page_no)?;
            let mut state = self.lock_state();
            let mut guard = slot_arc.lock();
            let mut page = guard.var();
            let dead = page.free_words().saturating_sub(page.contiguous_free());
            if dead >= min_dead_words {
                let old_bucket = page.list_index();
                page.compact();
                compacted += 1;
                let new_bucket = self.bucket_for(page.contiguous_free());
                page.set_list_index(new_bucket);
                self.requeue_var(&mut state, page_no as u16, old_bucket, new_bucket);
            }
        }
        Ok(compacted)
    }
}
