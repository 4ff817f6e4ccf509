//! Coordination between a row's in-memory part and its optional disk
//! part: original-page loads, UNDO log-space reservation, and the
//! grow-in-page versus move-to-new-page (DISK_REORG) decision.
//!
//! The log-group manager and the page cache manager live outside the
//! engine; this module talks to them through the [`LogManager`] and
//! [`DiskPageCache`] ports. Any call that may need disk I/O returns
//! either a synchronous result or `Pending` with a callback token; a
//! pending op parks and is resumed when the callback fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::chain::{OpFlags, OpRecord};
use crate::error::ErrorKind;
use crate::rowcodec::DiskRef;
use crate::schema::TableDescriptor;
use crate::{fault, TupError};

/// Token identifying a pending disk or log completion.
pub type CallbackToken = u64;

/// Outcome of a call that may suspend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskResult<T> {
    Ready(T),
    Pending(CallbackToken),
}

/// UNDO record header sizes, in words.
pub const UNDO_UPDATE_HEADER_WORDS: u32 = 3;
pub const UNDO_ALLOC_WORDS: u32 = 2;

/// Port to the log-group manager owning UNDO persistence.
pub trait LogManager: Send + Sync {
    /// Reserve `words` of UNDO log space. Atomic under the manager's own
    /// mutex; once granted, the space is held until the owning
    /// transaction commits or aborts.
    fn reserve_undo(&self, logfile_group: u32, words: u32) -> Result<DiskResult<()>, TupError>;
    /// Return reserved space at transaction end (or at the irreversible
    /// DISK_REORG transition, for the superseded in-page reservation).
    fn release_undo(&self, logfile_group: u32, words: u32);
}

/// Port to the page cache manager owning disk page residency.
pub trait DiskPageCache: Send + Sync {
    /// Make a disk page resident. Ready(()) when already in memory.
    fn request_page(&self, file_no: u16, page_no: u32) -> Result<DiskResult<()>, TupError>;
    /// Preallocate `words` on some disk page and return the location.
    fn prealloc(&self, var_part: bool, words: u32) -> Result<DiskRef, TupError>;
    /// Extend a reservation on a specific page (in-place row growth).
    fn reserve_in_page(&self, dref: DiskRef, words: u32);
    /// Release a preallocation that will not be committed.
    fn release_prealloc(&self, dref: DiskRef, words: u32);
    /// Free words currently available on the referenced page.
    fn page_free_words(&self, dref: DiskRef) -> u32;
    /// Mark the page header dirty so the buffer manager persists it.
    fn dirty_header(&self, file_no: u16, page_no: u32);
}

/// How a disk-part size change was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeChange {
    /// The new row fits the original page; `grown` words were added to
    /// the op's uncommitted reservation.
    InPlace { grown: u32 },
    /// The part moves to a freshly preallocated location on commit. The
    /// old in-page reservation of `released` words was returned - the
    /// one mid-transaction release, safe because the transition is
    /// irreversible.
    Reorg { new_ref: DiskRef, released: u32 },
}

pub struct DiskPartCoordinator {
    log: Arc<dyn LogManager>,
    cache: Arc<dyn DiskPageCache>,
}

impl DiskPartCoordinator {
    pub fn new(log: Arc<dyn LogManager>, cache: Arc<dyn DiskPageCache>) -> Self {
        Self { log, cache }
    }

    pub fn cache(&self) -> &dyn DiskPageCache {
        &*self.cache
    }

    pub fn log(&self) -> &dyn LogManager {
        &*self.log
    }

    /// First-op page residency: request the original disk page, and the
    /// reorg target page when one exists. `Ready` means both pages are
    /// resident.
    pub fn load(&self, op: &mut OpRecord, dref: DiskRef) -> Result<DiskResult<()>, TupError> {
        match self.cache.request_page(dref.file_no, dref.page_no)? {
            DiskResult::Ready(()) => {}
            DiskResult::Pending(t) => {
                log::debug!(
                    "disk page ({}, {}) not resident, op parked",
                    dref.file_no,
                    dref.page_no
                );
                return Ok(DiskResult::Pending(t));
            }
        }
        op.flags |= OpFlags::LOAD_DISKPAGE_ON_COMMIT;
        if let Some(extra) = op.disk_reorg_ref {
            match self.cache.request_page(extra.file_no, extra.page_no)? {
                DiskResult::Ready(()) => {
                    op.flags |= OpFlags::LOAD_EXTRA_DISKPAGE_ON_COMMIT;
                }
                DiskResult::Pending(t) => return Ok(DiskResult::Pending(t)),
            }
        }
        Ok(DiskResult::Ready(()))
    }

    /// UNDO reservation for an UPDATE of a disk-bearing row.
    pub fn reserve_for_update(
        &self,
        op: &mut OpRecord,
        table: &TableDescriptor,
        logfile_group: u32,
        new_dd_words: u32,
    ) -> Result<DiskResult<()>, TupError> {
        let varpart_words = new_dd_words.saturating_sub(table.disk_fix_words);
        let words = UNDO_UPDATE_HEADER_WORDS + (table.disk_fix_words - 1) + varpart_words;
        self.reserve(op, logfile_group, words)
    }

    /// UNDO reservation for a DELETE, sized from the existing row's disk
    /// part.
    pub fn reserve_for_delete(
        &self,
        op: &mut OpRecord,
        logfile_group: u32,
        existing_dd_words: u32,
    ) -> Result<DiskResult<()>, TupError> {
        let words = UNDO_UPDATE_HEADER_WORDS + existing_dd_words.saturating_sub(1);
        self.reserve(op, logfile_group, words)
    }

    /// UNDO reservation for the Alloc record of an initial insert.
    pub fn reserve_for_alloc(
        &self,
        op: &mut OpRecord,
        logfile_group: u32,
    ) -> Result<DiskResult<()>, TupError> {
        self.reserve(op, logfile_group, UNDO_ALLOC_WORDS)
    }

    fn reserve(
        &self,
        op: &mut OpRecord,
        logfile_group: u32,
        words: u32,
    ) -> Result<DiskResult<()>, TupError> {
        match self.log.reserve_undo(logfile_group, words)? {
            DiskResult::Ready(()) => {
                op.undo_buffer_space += words;
                op.flags |= OpFlags::WAIT_LOG_BUFFER;
                Ok(DiskResult::Ready(()))
            }
            DiskResult::Pending(t) => {
                log::debug!("undo reservation of {words} words pending, op parked");
                Ok(DiskResult::Pending(t))
            }
        }
    }

    /// Resolve a disk-part size change after an update produced
    /// `new_dd_words`. Either the original page absorbs the growth, or
    /// the part transitions to DISK_REORG with a new preallocation plus
    /// the Alloc UNDO record, returning the superseded in-page
    /// reservation.
    pub fn handle_size_change(
        &self,
        op: &mut OpRecord,
        table: &TableDescriptor,
        logfile_group: u32,
        dref: DiskRef,
        new_dd_words: u32,
    ) -> Result<DiskResult<SizeChange>, TupError> {
        if op.disk_reorg_ref.is_some() {
            // Already reorganising: the new location was sized for the
            // row's maximum, so nothing more to do.
            return Ok(DiskResult::Ready(SizeChange::InPlace { grown: 0 }));
        }
        let free = self.cache.page_free_words(dref);
        let have = free + op.uncommitted_used_space;
        if new_dd_words <= have {
            let grown = new_dd_words.saturating_sub(op.uncommitted_used_space);
            if grown > 0 {
                op.uncommitted_used_space += grown;
                self.cache.reserve_in_page(dref, grown);
                self.cache.dirty_header(dref.file_no, dref.page_no);
            }
            return Ok(DiskResult::Ready(SizeChange::InPlace { grown }));
        }

        // The row will not fit its page again: move it. Reserve the
        // Alloc record first so the transition cannot half-happen.
        match self.log.reserve_undo(logfile_group, UNDO_ALLOC_WORDS)? {
            DiskResult::Ready(()) => op.undo_buffer_space += UNDO_ALLOC_WORDS,
            DiskResult::Pending(t) => return Ok(DiskResult::Pending(t)),
        }
        let new_ref = self.cache.prealloc(table.disk_var(), new_dd_words)?;
        let released = op.uncommitted_used_space;
        if released > 0 {
            self.cache.release_prealloc(dref, released);
        }
        op.uncommitted_used_space = 0;
        op.disk_reorg_ref = Some(new_ref);
        self.cache.dirty_header(dref.file_no, dref.page_no);
        self.cache.dirty_header(new_ref.file_no, new_ref.page_no);
        log::debug!(
            "disk part ({}, {}) -> ({}, {}), {released} uncommitted words returned",
            dref.file_no,
            dref.page_no,
            new_ref.file_no,
            new_ref.page_no
        );
        Ok(DiskResult::Ready(SizeChange::Reorg { new_ref, released }))
    }
}

/// In-memory log manager: a bounded word budget with optional forced
/// `Pending` responses for exercising the suspension path.
pub struct MemLogManager {
    budget: Mutex<u64>,
    pending_next: Mutex<u32>,
    next_token: AtomicU64,
}

impl MemLogManager {
    pub fn new(budget_words: u64) -> Self {
        Self {
            budget: Mutex::new(budget_words),
            pending_next: Mutex::new(0),
            next_token: AtomicU64::new(1),
        }
    }

    /// Force the next `n` reservations to come back `Pending`.
    pub fn set_pending(&self, n: u32) {
        *self.pending_next.lock().unwrap_or_else(|e| e.into_inner()) = n;
    }

    pub fn reserved_words(&self, initial_budget: u64) -> u64 {
        initial_budget - *self.budget.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LogManager for MemLogManager {
    fn reserve_undo(&self, _logfile_group: u32, words: u32) -> Result<DiskResult<()>, TupError> {
        {
            let mut pending = self.pending_next.lock().unwrap_or_else(|e| e.into_inner());
            if *pending > 0 {
                *pending -= 1;
                return Ok(DiskResult::Pending(
                    self.next_token.fetch_add(1, Ordering::Relaxed),
                ));
            }
        }
        let mut budget = self.budget.lock().unwrap_or_else(|e| e.into_inner());
        if (words as u64) > *budget {
            return Err(fault!(ErrorKind::NoLogSpace(words)));
        }
        *budget -= words as u64;
        Ok(DiskResult::Ready(()))
    }

    fn release_undo(&self, _logfile_group: u32, words: u32) {
        *self.budget.lock().unwrap_or_else(|e| e.into_inner()) += words as u64;
    }
}

struct MemDiskPage {
    free_words: u32,
    dirty: bool,
}

/// In-memory page cache double: free-space accounting per (file, page),
/// optional forced `Pending` responses.
pub struct MemDiskCache {
    page_words: u32,
    pages: Mutex<HashMap<(u16, u32), MemDiskPage>>,
    next_page: Mutex<u32>,
    pending_next: Mutex<u32>,
    next_token: AtomicU64,
}

impl MemDiskCache {
    pub fn new(page_words: u32) -> Self {
        Self {
            page_words,
            pages: Mutex::new(HashMap::new()),
            next_page: Mutex::new(0),
            pending_next: Mutex::new(0),
            next_token: AtomicU64::new(1 << 32),
        }
    }

    /// Force the next `n` page requests to come back `Pending`.
    pub fn set_pending(&self, n: u32) {
        *self.pending_next.lock().unwrap_or_else(|e| e.into_inner()) = n;
    }

    /// Seed a page with a given amount of free space.
    pub fn seed_page(&self, file_no: u16, page_no: u32, free_words: u32) {
        self.pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (file_no, page_no),
                MemDiskPage {
                    free_words,
                    dirty: false,
                },
            );
    }

    pub fn is_dirty(&self, file_no: u16, page_no: u32) -> bool {
        self.pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(file_no, page_no))
            .map(|p| p.dirty)
            .unwrap_or(false)
    }
}

impl DiskPageCache for MemDiskCache {
    fn request_page(&self, file_no: u16, page_no: u32) -> Result<DiskResult<()>, TupError> {
        {
            let mut pending = self.pending_next.lock().unwrap_or_else(|e| e.into_inner());
            if *pending > 0 {
                *pending -= 1;
                return Ok(DiskResult::Pending(
                    self.next_token.fetch_add(1, Ordering::Relaxed),
                ));
            }
        }
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        pages.entry((file_no, page_no)).or_insert(MemDiskPage {
            free_words: self.page_words,
            dirty: false,
        });
        Ok(DiskResult::Ready(()))
    }

    fn prealloc(&self, _var_part: bool, words: u32) -> Result<DiskRef, TupError> {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        for ((file_no, page_no), page) in pages.iter_mut() {
            if page.free_words >= words {
                page.free_words -= words;
                return Ok(DiskRef {
                    file_no: *file_no,
                    page_idx: 0,
                    page_no: *page_no,
                });
            }
        }
        if words > self.page_words {
            return Err(fault!(ErrorKind::NoDiskPrealloc));
        }
        let mut next = self.next_page.lock().unwrap_or_else(|e| e.into_inner());
        let page_no = *next;
        *next += 1;
        pages.insert(
            (0, page_no),
            MemDiskPage {
                free_words: self.page_words - words,
                dirty: false,
            },
        );
        Ok(DiskRef {
            file_no: 0,
            page_idx: 0,
            page_no,
        })
    }

    fn reserve_in_page(&self, dref: DiskRef, words: u32) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(page) = pages.get_mut(&(dref.file_no, dref.page_no)) {
            page.free_words = page.free_words.saturating_sub(words);
        }
    }

    fn release_prealloc(&self, dref: DiskRef, words: u32) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(page) = pages.get_mut(&(dref.file_no, dref.page_no)) {
            page.free_words += words;
        }
    }

    fn page_free_words(&self, dref: DiskRef) -> u32 {
        self.pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(dref.file_no, dref.page_no))
            .map(|p| p.free_words)
            .unwrap_or(0)
    }

    fn dirty_header(&self, file_no: u16, page_no: u32) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(page) = pages.get_mut(&(file_no, page_no)) {
            page.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{OpArena, OpType};
    use crate::schema::{AttrDescr, AttrStorage, ColType};
    use crate::{RowId, TransId};

    fn disk_table() -> TableDescriptor {
        TableDescriptor::build(
            2,
            vec![
                AttrDescr::new(0, "pk", ColType::Uint32, AttrStorage::FixedMem).pk(),
                AttrDescr::new(1, "dfix", ColType::Uint64, AttrStorage::FixedDisk),
                AttrDescr::new(2, "dvar", ColType::Varbinary, AttrStorage::VarDisk)
                    .max_bytes(256)
                    .nullable(),
            ],
        )
        .unwrap()
    }

    fn coordinator(free_on_page: u32) -> (DiskPartCoordinator, Arc<MemLogManager>, Arc<MemDiskCache>, DiskRef)
    {
        let log = Arc::new(MemLogManager::new(100_000));
        let cache = Arc::new(MemDiskCache::new(1000));
        cache.seed_page(0, 5, free_on_page);
        let dref = DiskRef {
            file_no: 0,
            page_idx: 3,
            page_no: 5,
        };
        (
            DiskPartCoordinator::new(log.clone(), cache.clone()),
            log,
            cache,
            dref,
        )
    }

    fn op(arena: &mut OpArena) -> crate::chain::OpRef {
        arena.seize(OpType::Update, RowId::new(0, 0), TransId::new(1, 1), 1)
    }

    #[test]
    fn grow_in_place_when_page_has_room() {
        let (coord, _log, cache, dref) = coordinator(100);
        let mut arena = OpArena::new();
        let o = op(&mut arena);
        let table = disk_table();
        let r = coord
            .handle_size_change(arena.get_mut(o), &table, 1, dref, 60)
            .unwrap();
        assert_eq!(r, DiskResult::Ready(SizeChange::InPlace { grown: 60 }));
        assert_eq!(arena.get(o).uncommitted_used_space, 60);
        assert!(cache.is_dirty(0, 5));

        // growing further consumes only the delta
        let r = coord
            .handle_size_change(arena.get_mut(o), &table, 1, dref, 90)
            .unwrap();
        assert_eq!(r, DiskResult::Ready(SizeChange::InPlace { grown: 30 }));
        assert_eq!(arena.get(o).uncommitted_used_space, 90);
    }

    #[test]
    fn reorg_when_page_cannot_hold_the_row() {
        let (coord, _log, cache, dref) = coordinator(60);
        let mut arena = OpArena::new();
        let o = op(&mut arena);
        let table = disk_table();

        // first fits in page free space
        let r = coord
            .handle_size_change(arena.get_mut(o), &table, 1, dref, 50)
            .unwrap();
        assert_eq!(r, DiskResult::Ready(SizeChange::InPlace { grown: 50 }));
        assert_eq!(cache.page_free_words(dref), 10);

        // then outgrows page free plus the reservation
        let r = coord
            .handle_size_change(arena.get_mut(o), &table, 1, dref, 120)
            .unwrap();
        match r {
            DiskResult::Ready(SizeChange::Reorg { new_ref, released }) => {
                assert_eq!(released, 50);
                assert_eq!(arena.get(o).uncommitted_used_space, 0);
                assert_eq!(arena.get(o).disk_reorg_ref, Some(new_ref));
                assert!(cache.is_dirty(new_ref.file_no, new_ref.page_no));
            }
            other => panic!("expected reorg, got {other:?}"),
        }
        // the alloc UNDO record was added on top
        assert_eq!(arena.get(o).undo_buffer_space, UNDO_ALLOC_WORDS);

        // further size changes are absorbed by the reorg target
        let r = coord
            .handle_size_change(arena.get_mut(o), &table, 1, dref, 200)
            .unwrap();
        assert_eq!(r, DiskResult::Ready(SizeChange::InPlace { grown: 0 }));
    }

    #[test]
    fn undo_reservation_sizes() {
        let (coord, log, _cache, _dref) = coordinator(0);
        let mut arena = OpArena::new();
        let o = op(&mut arena);
        let table = disk_table();
        // disk fixed part: 1 hdr + 1 null word + 2 words attr = 4 words
        assert_eq!(table.disk_fix_words, 4);
        coord
            .reserve_for_update(arena.get_mut(o), &table, 1, 20)
            .unwrap();
        // 3 + (4-1) + (20-4) = 22
        assert_eq!(arena.get(o).undo_buffer_space, 22);
        assert_eq!(log.reserved_words(100_000), 22);

        let o2 = op(&mut arena);
        coord.reserve_for_delete(arena.get_mut(o2), 1, 20).unwrap();
        assert_eq!(arena.get(o2).undo_buffer_space, 3 + 19);
    }

    #[test]
    fn pending_log_reservation_parks() {
        let (coord, log, _cache, _dref) = coordinator(0);
        log.set_pending(1);
        let mut arena = OpArena::new();
        let o = op(&mut arena);
        let table = disk_table();
        let r = coord
            .reserve_for_update(arena.get_mut(o), &table, 1, 20)
            .unwrap();
        assert!(matches!(r, DiskResult::Pending(_)));
        // nothing was recorded on the op
        assert_eq!(arena.get(o).undo_buffer_space, 0);
    }

    #[test]
    fn load_requests_both_pages() {
        let (coord, _log, cache, dref) = coordinator(10);
        let mut arena = OpArena::new();
        let o = op(&mut arena);
        arena.get_mut(o).disk_reorg_ref = Some(DiskRef {
            file_no: 0,
            page_idx: 0,
            page_no: 77,
        });
        let r = coord.load(arena.get_mut(o), dref).unwrap();
        assert_eq!(r, DiskResult::Ready(()));
        assert!(arena
            .get(o)
            .flags
            .contains(OpFlags::LOAD_DISKPAGE_ON_COMMIT | OpFlags::LOAD_EXTRA_DISKPAGE_ON_COMMIT));

        cache.set_pending(1);
        let o2 = op(&mut arena);
        let r = coord.load(arena.get_mut(o2), dref).unwrap();
        assert!(matches!(r, DiskResult::Pending(_)));
    }
}
