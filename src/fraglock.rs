//! Read-write discipline for cross-thread access to one fragment.
//!
//! Three ticket levels: shared read (query threads), write-key (the
//! fragment's writer, excluding other writers but not readers), and
//! exclusive (no other access at all). Row-content changes under page
//! mutexes need only write-key; page reorganisation, ordered-index
//! maintenance and the DISK_REORG flip upgrade to exclusive for the
//! minimum span. Callers drop page mutexes before upgrading.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct LockState {
    readers: u32,
    write_key: bool,
    exclusive: bool,
    /// An upgrader announces itself so new readers queue behind it.
    upgrade_waiting: bool,
}

/// The fragment-wide access lock.
#[derive(Default)]
pub struct FragmentAccessLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

impl FragmentAccessLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared read ticket. Blocks while exclusive access is held or an
    /// upgrade is in progress.
    pub fn read(&self) -> ReadTicket<'_> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while s.exclusive || s.upgrade_waiting {
            s = self.cv.wait(s).unwrap_or_else(|e| e.into_inner());
        }
        s.readers += 1;
        ReadTicket { lock: self }
    }

    /// Write-key ticket: exclusive against other writers, shared with
    /// readers.
    pub fn write_key(&self) -> WriteKeyTicket<'_> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while s.write_key || s.exclusive {
            s = self.cv.wait(s).unwrap_or_else(|e| e.into_inner());
        }
        s.write_key = true;
        WriteKeyTicket { lock: self }
    }
}

pub struct ReadTicket<'a> {
    lock: &'a FragmentAccessLock,
}

impl Drop for ReadTicket<'_> {
    fn drop(&mut self) {
        let mut s = self
            .lock
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        s.readers -= 1;
        drop(s);
        self.lock.cv.notify_all();
    }
}

pub struct WriteKeyTicket<'a> {
    lock: &'a FragmentAccessLock,
}

impl<'a> WriteKeyTicket<'a> {
    /// Upgrade to exclusive, draining current readers. New readers queue
    /// until the exclusive span ends.
    pub fn upgrade(self) -> ExclusiveTicket<'a> {
        let lock = self.lock;
        {
            let mut s = lock.state.lock().unwrap_or_else(|e| e.into_inner());
            s.upgrade_waiting = true;
            while s.readers > 0 {
                s = lock.cv.wait(s).unwrap_or_else(|e| e.into_inner());
            }
            s.upgrade_waiting = false;
            s.exclusive = true;
        }
        std::mem::forget(self);
        ExclusiveTicket { lock }
    }
}

impl Drop for WriteKeyTicket<'_> {
    fn drop(&mut self) {
        let mut s = self
            .lock
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        s.write_key = false;
        drop(s);
        self.lock.cv.notify_all();
    }
}

pub struct ExclusiveTicket<'a> {
    lock: &'a FragmentAccessLock,
}

impl<'a> ExclusiveTicket<'a> {
    /// Downgrade back to write-key so read-key operations may proceed.
    pub fn downgrade(self) -> WriteKeyTicket<'a> {
        let lock = self.lock;
        {
            let mut s = lock.state.lock().unwrap_or_else(|e| e.into_inner());
            s.exclusive = false;
        }
        lock.cv.notify_all();
        std::mem::forget(self);
        WriteKeyTicket { lock }
    }
}

impl Drop for ExclusiveTicket<'_> {
    fn drop(&mut self) {
        let mut s = self
            .lock
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        s.exclusive = false;
        s.write_key = false;
        drop(s);
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn readers_share_writer_excludes_writer() {
        let lock = FragmentAccessLock::new();
        let r1 = lock.read();
        let r2 = lock.read();
        let w = lock.write_key();
        drop(r1);
        drop(r2);
        drop(w);
    }

    #[test]
    fn upgrade_waits_for_readers() {
        let lock = Arc::new(FragmentAccessLock::new());
        let seen = Arc::new(AtomicU32::new(0));

        let r = lock.read();

        let l2 = lock.clone();
        let s2 = seen.clone();
        let th = std::thread::spawn(move || {
            let w = l2.write_key();
            let _excl = w.upgrade();
            s2.store(1, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), 0, "upgrade before reader drop");
        drop(r);
        th.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        // the exclusive span ended with the thread; a new reader proceeds
        drop(lock.read());
    }

    #[test]
    fn downgrade_reopens_reads() {
        let lock = FragmentAccessLock::new();
        let w = lock.write_key();
        let excl = w.upgrade();
        let w = excl.downgrade();
        let r = lock.read();
        drop(r);
        drop(w);
    }
}
