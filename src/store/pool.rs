use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions, MmapRaw};
use thiserror::Error;

use crate::PAGE_BYTES;

/// Faults raised by the page frame pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Couldn't open the backing file
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file
    #[error("Synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file
    #[error("Can't resize the backing file to 0x{requested:x} bytes")]
    ResizeFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// Couldn't allocate any more space
    #[error("Can't map any more page frames. Tried to get 0x{requested:x} bytes")]
    AllocFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// The host page size doesn't divide the frame size
    #[error("Host page size {0} does not divide the page frame size")]
    PageSizeMismatch(usize),
    /// Other, miscellaneous errors
    #[error("Other: {0}")]
    Other(&'static str),
}

/// How many frames each expansion adds.
const GROW_FRAMES: usize = 64;

struct PoolInner {
    /// All mapped regions, in allocation order. Existing maps are never
    /// moved or dropped while the pool lives, so frame addresses are
    /// stable for the pool's lifetime.
    maps: Vec<MmapRaw>,
    file: Option<File>,
    /// Freed frame numbers available for reuse.
    free: Vec<u32>,
    /// Frames handed out so far from the mapped area.
    next_unused: u32,
    frames_mapped: u32,
}

impl PoolInner {
    fn frame_ptr(&self, frame_no: u32) -> Option<*mut u8> {
        let mut base = 0u32;
        for map in &self.maps {
            let frames = (map.len() / PAGE_BYTES) as u32;
            if frame_no < base + frames {
                let off = (frame_no - base) as usize * PAGE_BYTES;
                // Safety: off is within this map by the check above.
                return Some(unsafe { map.as_mut_ptr().add(off) });
            }
            base += frames;
        }
        None
    }

    /// Map `bytes` more, growing the backing file first when present.
    fn expand(&mut self, bytes: usize) -> Result<(), PoolError> {
        if let Some(file) = self.file.as_ref() {
            let current = file.metadata().map_err(PoolError::Open)?.len();
            file.set_len(current + bytes as u64)
                .map_err(|e| PoolError::ResizeFailed {
                    requested: current as usize + bytes,
                    source: e,
                })?;
            file.sync_all().map_err(PoolError::Sync)?;
            let map = MmapOptions::new()
                .offset(current)
                .len(bytes)
                .map_raw(file)
                .map_err(|e| PoolError::AllocFailed {
                    requested: bytes,
                    source: e,
                })?;
            self.maps.push(map);
        } else {
            let map = MmapRaw::from(MmapMut::map_anon(bytes).map_err(|e| {
                PoolError::AllocFailed {
                    requested: bytes,
                    source: e,
                }
            })?);
            self.maps.push(map);
        }
        self.frames_mapped += (bytes / PAGE_BYTES) as u32;
        Ok(())
    }
}

/// A pool of 32 kiB page frames carved out of one or more memory maps,
/// anonymous or file-backed.
pub struct PagePool {
    inner: Mutex<PoolInner>,
}

impl PagePool {
    /// Open an anonymous pool of at least `bytes`.
    pub fn open_anon(bytes: usize) -> Result<Self, PoolError> {
        let bytes = bytes.max(PAGE_BYTES).next_multiple_of(PAGE_BYTES);
        let map = MmapRaw::from(MmapMut::map_anon(bytes).map_err(|e| PoolError::AllocFailed {
            requested: bytes,
            source: e,
        })?);
        let frames = (bytes / PAGE_BYTES) as u32;
        Ok(Self {
            inner: Mutex::new(PoolInner {
                maps: vec![map],
                file: None,
                free: Vec::new(),
                next_unused: 0,
                frames_mapped: frames,
            }),
        })
    }

    /// Open a file-backed pool, locking the file for exclusive use.
    pub fn open<P: AsRef<Path>>(path: P, bytes: usize) -> Result<Self, PoolError> {
        use fs4::fs_std::FileExt;

        if PAGE_BYTES % page_size::get() != 0 {
            return Err(PoolError::PageSizeMismatch(page_size::get()));
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(PoolError::Open)?;
        file.try_lock_exclusive().map_err(PoolError::Lock)?;

        let file_size = file.metadata().map_err(PoolError::Open)?.len() as usize;
        let wanted = bytes
            .max(file_size)
            .max(PAGE_BYTES)
            .next_multiple_of(PAGE_BYTES);
        if wanted != file_size {
            file.set_len(wanted as u64).map_err(|e| PoolError::ResizeFailed {
                requested: wanted,
                source: e,
            })?;
        }

        let map = MmapOptions::new()
            .len(wanted)
            .map_raw(&file)
            .map_err(|e| PoolError::AllocFailed {
                requested: wanted,
                source: e,
            })?;
        let frames = (wanted / PAGE_BYTES) as u32;
        Ok(Self {
            inner: Mutex::new(PoolInner {
                maps: vec![map],
                file: Some(file),
                free: Vec::new(),
                next_unused: 0,
                frames_mapped: frames,
            }),
        })
    }

    /// Allocate a frame, expanding the mapped area if the pool ran dry.
    /// The frame's previous contents are garbage.
    pub fn allocate(&self) -> Result<Frame, PoolError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PoolError::Other("page pool mutex poisoned"))?;
        let frame_no = if let Some(no) = inner.free.pop() {
            no
        } else {
            if inner.next_unused == inner.frames_mapped {
                let add = GROW_FRAMES * PAGE_BYTES;
                inner.expand(add)?;
                log::debug!("page pool grown by {GROW_FRAMES} frames");
            }
            let no = inner.next_unused;
            inner.next_unused += 1;
            no
        };
        let ptr = inner
            .frame_ptr(frame_no)
            .ok_or(PoolError::Other("allocated frame out of mapped range"))?;
        Ok(Frame { no: frame_no, ptr })
    }

    /// Return a frame for reuse. The caller must no longer touch it.
    pub fn release(&self, frame_no: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            debug_assert!(frame_no < inner.next_unused);
            inner.free.push(frame_no);
        }
    }

    /// Flush file-backed frames to disk. A no-op for anonymous pools.
    pub fn flush(&self) -> Result<(), PoolError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| PoolError::Other("page pool mutex poisoned"))?;
        if inner.file.is_some() {
            for map in &inner.maps {
                map.flush().map_err(PoolError::Sync)?;
            }
        }
        Ok(())
    }
}

/// A page frame checked out of the pool.
///
/// The pointer stays valid for the pool's lifetime: maps are only ever
/// appended, never moved or unmapped.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub no: u32,
    ptr: *mut u8,
}

// Frames are plain memory; exclusive access is arbitrated by the page
// mutex in the store layer.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    /// Borrow the frame bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold whatever lock arbitrates access to this frame
    /// and must not let the slice outlive the pool.
    pub unsafe fn bytes(&self) -> &'static [u8] {
        std::slice::from_raw_parts(self.ptr, PAGE_BYTES)
    }

    /// Borrow the frame bytes mutably.
    ///
    /// # Safety
    ///
    /// As [`Frame::bytes`], plus the access must be exclusive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &'static mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, PAGE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_pool_allocates_and_grows() {
        let pool = PagePool::open_anon(2 * PAGE_BYTES).unwrap();
        let mut frames = Vec::new();
        for _ in 0..5 {
            frames.push(pool.allocate().unwrap());
        }
        // distinct frames, all writable
        for (i, f) in frames.iter().enumerate() {
            unsafe { f.bytes_mut()[0] = i as u8 };
        }
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(unsafe { f.bytes()[0] }, i as u8);
        }
        let no = frames[2].no;
        pool.release(no);
        let again = pool.allocate().unwrap();
        assert_eq!(again.no, no);
    }

    #[test]
    fn file_pool_roundtrip() {
        let dir = std::env::temp_dir().join("rowcore-pool-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(format!("pool-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let pool = PagePool::open(&path, PAGE_BYTES).unwrap();
            let f = pool.allocate().unwrap();
            unsafe { f.bytes_mut()[..4].copy_from_slice(b"rows") };
            pool.flush().unwrap();
        }
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..4], b"rows");
        let _ = std::fs::remove_file(&path);
    }
}
