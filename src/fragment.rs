//! Per-fragment state: schema binding, page spaces, counters, the
//! checkpoint-scan handle and its keep list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::alloc::TupleAllocator;
use crate::config::BUCKET_COUNT;
use crate::fraglock::FragmentAccessLock;
use crate::schema::TableDescriptor;
use crate::store::PageStore;
use crate::RowId;

/// An active checkpoint scan over the fragment. The scan proceeds in
/// rowid order; rows at or past the position are its remaining set.
#[derive(Clone, Copy, Debug)]
pub struct LcpScan {
    pub position: RowId,
}

/// A pre-delete row image parked for an in-flight checkpoint scan.
#[derive(Clone, Debug)]
pub struct KeepEntry {
    pub rowid: RowId,
    /// Packed fixed part followed by the packed varpart.
    pub image: Vec<u8>,
}

/// One locally owned shard of a table.
pub struct Fragment {
    pub id: u64,
    pub table: Arc<TableDescriptor>,
    pub alloc: TupleAllocator,
    pub lock: FragmentAccessLock,
    pub logfile_group_id: u32,
    row_count: AtomicU64,
    changed_rows: AtomicU64,
    lcp_scan: Mutex<Option<LcpScan>>,
    keep_list: Mutex<Vec<KeepEntry>>,
}

impl Fragment {
    pub fn new(
        id: u64,
        table: Arc<TableDescriptor>,
        store: Arc<PageStore>,
        logfile_group_id: u32,
        bucket_bounds: [u16; BUCKET_COUNT],
    ) -> Self {
        let row_words = table.fix_row_words as u16;
        Self {
            id,
            table,
            alloc: TupleAllocator::new(store, row_words, bucket_bounds),
            lock: FragmentAccessLock::new(),
            logfile_group_id,
            row_count: AtomicU64::new(0),
            changed_rows: AtomicU64::new(0),
            lcp_scan: Mutex::new(None),
            keep_list: Mutex::new(Vec::new()),
        }
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Relaxed)
    }

    pub fn inc_row_count(&self) {
        self.row_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_row_count(&self) {
        self.row_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn changed_rows_since_lcp(&self) -> u64 {
        self.changed_rows.load(Ordering::Relaxed)
    }

    pub fn note_changed_row(&self) {
        self.changed_rows.fetch_add(1, Ordering::Relaxed);
    }

    /// Begin a checkpoint scan at the given position; resets the changed
    /// counter.
    pub fn start_lcp_scan(&self, position: RowId) {
        *self.lcp_scan.lock().unwrap_or_else(|e| e.into_inner()) = Some(LcpScan { position });
        self.changed_rows.store(0, Ordering::Relaxed);
    }

    /// Advance the scan position as pages complete.
    pub fn advance_lcp_scan(&self, position: RowId) {
        if let Some(scan) = self
            .lcp_scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            scan.position = position;
        }
    }

    pub fn end_lcp_scan(&self) {
        *self.lcp_scan.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether `rowid` still lies ahead of the active checkpoint scan.
    pub fn lcp_covers(&self, rowid: RowId) -> bool {
        match *self.lcp_scan.lock().unwrap_or_else(|e| e.into_inner()) {
            None => false,
            Some(scan) => {
                (rowid.page_no, rowid.page_idx)
                    >= (scan.position.page_no, scan.position.page_idx)
            }
        }
    }

    /// Park a pre-delete image for the checkpoint scan. Called before
    /// LCP_SKIP is set on the base row.
    pub fn push_keep_entry(&self, entry: KeepEntry) {
        log::trace!(
            "keep-list entry for row ({}, {})",
            entry.rowid.page_no,
            entry.rowid.page_idx
        );
        self.keep_list
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    /// Drain parked images; the checkpoint scan consumes these first.
    pub fn take_keep_entries(&self) -> Vec<KeepEntry> {
        std::mem::take(&mut *self.keep_list.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn keep_list_len(&self) -> usize {
        self.keep_list.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
