//! Page ownership: frames, typed page handles, page mutexes and the
//! logical-to-physical page maps.

pub mod pool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::ErrorKind;
use crate::page::{FixedPage, PageKind, VarPage};
use crate::{fault, PageNo, TupError};
use pool::{Frame, PagePool, PoolError};

/// A 64-bit physical page id, unique within a [`PageStore`].
pub type PhysPageId = u64;

/// One resident page: its frame plus the mutex used to publish row state.
///
/// The mutex is the page-granular lock from the concurrency model: any
/// mutation of header bits or checksum on a row visible to readers happens
/// while holding it, and readers hold it around checksum-verified capture.
pub struct PageSlot {
    frame: Frame,
    kind: PageKind,
    lock: Mutex<()>,
}

impl PageSlot {
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Take the page mutex and get at the bytes.
    pub fn lock(&self) -> PageGuard<'_> {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        PageGuard {
            _guard: guard,
            frame: self.frame,
            kind: self.kind,
        }
    }
}

/// Exclusive access to one page's bytes, held for the duration of a row
/// publish or a key read.
pub struct PageGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    frame: Frame,
    kind: PageKind,
}

impl<'a> PageGuard<'a> {
    pub fn bytes(&self) -> &[u8] {
        // Safety: the slot mutex is held for the guard's lifetime and the
        // pool outlives every store handle.
        unsafe { self.frame.bytes() }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and the mutex guarantees exclusivity.
        unsafe { self.frame.bytes_mut() }
    }

    pub fn fixed(&mut self) -> FixedPage<'_> {
        debug_assert!(matches!(self.kind, PageKind::Fixed | PageKind::DiskFix));
        FixedPage::new(self.bytes_mut())
    }

    pub fn var(&mut self) -> VarPage<'_> {
        debug_assert!(matches!(self.kind, PageKind::Var | PageKind::DiskVar));
        VarPage::new(self.bytes_mut())
    }
}

/// The logical-to-physical page mapping of one fragment. Stable except on
/// page add/remove, which happen under the write lock.
#[derive(Default)]
pub struct PageMap {
    inner: RwLock<HashMap<PageNo, PhysPageId>>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn realpid(&self, logical: PageNo) -> Option<PhysPageId> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&logical)
            .copied()
    }

    pub fn insert(&self, logical: PageNo, phys: PhysPageId) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(logical, phys);
    }

    pub fn remove(&self, logical: PageNo) -> Option<PhysPageId> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&logical)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the logical page numbers, for scans and teardown.
    pub fn logical_pages(&self) -> Vec<PageNo> {
        let mut v: Vec<PageNo> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        v.sort_unstable();
        v
    }
}

/// Owns all resident pages and mediates access to them.
pub struct PageStore {
    pool: Arc<PagePool>,
    pages: RwLock<HashMap<PhysPageId, Arc<PageSlot>>>,
    next_id: Mutex<PhysPageId>,
}

impl PageStore {
    pub fn new(pool: Arc<PagePool>) -> Self {
        Self {
            pool,
            pages: RwLock::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Allocate and format a page of the given kind. `row_words` is only
    /// meaningful for fixed pages.
    pub fn alloc_page(
        &self,
        kind: PageKind,
        logical_page_no: PageNo,
        row_words: u16,
    ) -> Result<(PhysPageId, Arc<PageSlot>), TupError> {
        let frame = self
            .pool
            .allocate()
            .map_err(|e: PoolError| fault!(ErrorKind::Pool(e)))?;
        // Safety: the frame was just allocated; nobody else references it.
        let bytes = unsafe { frame.bytes_mut() };
        match kind {
            PageKind::Fixed | PageKind::DiskFix => {
                FixedPage::format(bytes, kind, logical_page_no, row_words);
            }
            PageKind::Var | PageKind::DiskVar => {
                VarPage::format(bytes, kind, logical_page_no);
            }
            PageKind::Free => return Err(fault!(ErrorKind::Pool(PoolError::Other(
                "cannot allocate a Free page"
            )))),
        }
        let slot = Arc::new(PageSlot {
            frame,
            kind,
            lock: Mutex::new(()),
        });
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        self.pages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, slot.clone());
        log::trace!("allocated {kind:?} page phys={id} logical={logical_page_no}");
        Ok((id, slot))
    }

    /// Typed handle for a resident page.
    pub fn fetch_page(&self, id: PhysPageId) -> Result<Arc<PageSlot>, TupError> {
        self.pages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| fault!(ErrorKind::PageNotFound(id)))
    }

    /// Resolve a fragment-logical page to a typed handle.
    pub fn fetch_logical(
        &self,
        map: &PageMap,
        logical: PageNo,
    ) -> Result<Arc<PageSlot>, TupError> {
        let phys = map
            .realpid(logical)
            .ok_or_else(|| fault!(ErrorKind::PageNotFound(logical as u64)))?;
        self.fetch_page(phys)
    }

    /// Drop a page and recycle its frame. The caller must have removed it
    /// from any page map first.
    pub fn free_page(&self, id: PhysPageId) {
        let slot = self
            .pages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(slot) = slot {
            self.pool.release(slot.frame.no);
        }
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
