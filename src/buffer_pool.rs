use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::heap_file::HeapFile;
use crate::heap_page::HeapPage;
use crate::tuple::Tuple;
use crate::{PageId, StorageConfig, StorageError, TransactionId};

/// The access level a transaction requests when fetching a page.
/// The heap-file scan path only ever asks for [`Permissions::ReadOnly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
}

#[derive(Default)]
struct LockState {
    readers: HashSet<TransactionId>, //  transactions holding a shared lock on this page
    writer: Option<TransactionId>,   //  the transaction holding the exclusive lock, if any
    upgrade_request: Option<TransactionId>, //  pending reader-to-writer upgrade, to stop writer starvation
}

/// Page-granularity shared/exclusive locks shared by every transaction.
///
/// A transaction that cannot be granted a lock within the configured timeout
/// is treated as aborted: the wait surfaces as
/// [`StorageError::TransactionAborted`], which callers must propagate rather
/// than mask.
struct LockTable {
    table: Mutex<HashMap<PageId, LockState>>,
    cond: Condvar,
    timeout: Duration,
}

impl LockTable {
    fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            timeout,
        }
    }

    /// Acquire a shared lock on `page_id` for `tx`
    fn lock_shared(&self, tx: TransactionId, page_id: PageId) -> Result<(), StorageError> {
        let mut guard = self.table.lock().unwrap();
        guard.entry(page_id).or_default();

        //  early return when the txn already holds this page in any mode
        let state = guard.get(&page_id).unwrap();
        if state.readers.contains(&tx) || state.writer == Some(tx) {
            return Ok(());
        }

        //  wait until there is no writer and no pending upgrade, or give up
        let deadline = Instant::now() + self.timeout;
        loop {
            let state = guard.get(&page_id).unwrap();
            if state.writer.is_none() && state.upgrade_request.is_none() {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StorageError::TransactionAborted { tx });
            }
            let (next_guard, wait) = self.cond.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
            if wait.timed_out() {
                return Err(StorageError::TransactionAborted { tx });
            }
        }
        guard.get_mut(&page_id).unwrap().readers.insert(tx);
        Ok(())
    }

    /// Acquire an exclusive lock on `page_id` for `tx`, upgrading an existing
    /// shared lock if the transaction holds one
    fn lock_exclusive(&self, tx: TransactionId, page_id: PageId) -> Result<(), StorageError> {
        let mut guard = self.table.lock().unwrap();
        guard.entry(page_id).or_default();

        let state = guard.get(&page_id).unwrap();
        if state.writer == Some(tx) {
            return Ok(());
        }

        let is_upgrade = state.readers.contains(&tx);
        if is_upgrade {
            //  only one upgrade may be pending per page
            if state.upgrade_request.is_some() {
                return Err(StorageError::TransactionAborted { tx });
            }
            guard.get_mut(&page_id).unwrap().upgrade_request = Some(tx);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let state = guard.get(&page_id).unwrap();
            let should_wait = if is_upgrade {
                //  wait for the other readers to drain; our own shared lock stays
                state.readers.len() > 1 || state.writer.is_some()
            } else {
                state.readers.len() > 0
                    || state.writer.is_some()
                    || state.upgrade_request.is_some()
            };
            if !should_wait {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let timed_out = if remaining.is_zero() {
                true
            } else {
                let (next_guard, wait) = self.cond.wait_timeout(guard, remaining).unwrap();
                guard = next_guard;
                wait.timed_out()
            };
            if timed_out {
                if is_upgrade {
                    guard.get_mut(&page_id).unwrap().upgrade_request = None;
                }
                return Err(StorageError::TransactionAborted { tx });
            }
        }

        let state = guard.get_mut(&page_id).unwrap();
        if is_upgrade {
            state.readers.remove(&tx);
            state.upgrade_request = None;
        }
        state.writer = Some(tx);
        Ok(())
    }

    /// Release every lock `tx` holds and wake any waiters
    fn release_all(&self, tx: TransactionId) {
        let mut guard = self.table.lock().unwrap();
        for state in guard.values_mut() {
            state.readers.remove(&tx);
            if state.writer == Some(tx) {
                state.writer = None;
            }
            if state.upgrade_request == Some(tx) {
                state.upgrade_request = None;
            }
        }
        guard.retain(|_, state| {
            !state.readers.is_empty() || state.writer.is_some() || state.upgrade_request.is_some()
        });
        self.cond.notify_all();
    }
}

/// Pin accounting shared between the pool and the page handles it gives out
struct PoolShared {
    num_available: Mutex<usize>,
    cond: Condvar,
}

impl PoolShared {
    /// Drop one pin on `frame`, waking any transaction waiting for a frame
    /// when the pin count reaches zero
    fn release_pin(&self, frame: &Arc<Mutex<Frame>>) {
        //  lock order matches pin_frame: num_available before the frame
        let mut num_available = self.num_available.lock().unwrap();
        let mut frame_guard = frame.lock().unwrap();
        frame_guard.unpin();
        if !frame_guard.is_pinned() {
            *num_available += 1;
            self.cond.notify_all();
        }
    }
}

/// One slot of the page cache: a decoded page plus its pin count
struct Frame {
    page: Option<HeapPage>,
    pins: usize,
}

impl Frame {
    fn new() -> Self {
        Self {
            page: None,
            pins: 0,
        }
    }

    fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    fn pin(&mut self) {
        self.pins += 1;
    }

    fn unpin(&mut self) {
        assert!(self.pins > 0); //  sanity check that the count cannot go negative
        self.pins -= 1;
    }

    fn holds(&self, page_id: PageId) -> bool {
        self.page
            .as_ref()
            .map_or(false, |page| page.page_id() == page_id)
    }
}

/// The page cache: a fixed set of frames pinning pages in memory, plus the
/// lock table arbitrating transactional access to them.
///
/// Heap files register themselves here at open time so cache misses can be
/// routed back to the owning file's raw read path. Since the write path of
/// this core is unsupported, frames are never dirty and eviction is a plain
/// reassignment of the first unpinned frame.
pub struct BufferPool {
    frames: Vec<Arc<Mutex<Frame>>>,
    shared: Arc<PoolShared>,
    lock_table: LockTable,
    files: Mutex<HashMap<u64, Weak<HeapFile>>>,
    timeout: Duration,
}

impl BufferPool {
    pub fn new(config: &StorageConfig) -> Self {
        let timeout = Duration::from_millis(config.lock_timeout_ms);
        Self {
            frames: (0..config.buffer_capacity)
                .map(|_| Arc::new(Mutex::new(Frame::new())))
                .collect(),
            shared: Arc::new(PoolShared {
                num_available: Mutex::new(config.buffer_capacity),
                cond: Condvar::new(),
            }),
            lock_table: LockTable::new(timeout),
            files: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Make `file` reachable for cache misses, keyed by its identity. Only a
    /// weak reference is kept; a dropped file reads as unknown.
    pub fn register_file(&self, file: &Arc<HeapFile>) {
        self.files
            .lock()
            .unwrap()
            .insert(file.id(), Arc::downgrade(file));
    }

    /// Fetch `page_id` for `tx` with the requested permission, pinning its
    /// frame until the returned [`PinnedPage`] is dropped.
    ///
    /// The lock is taken first and held until the transaction releases it
    /// via [`BufferPool::release_transaction`]; the pin only lasts as long
    /// as the handle.
    pub fn get_page(
        &self,
        tx: TransactionId,
        page_id: PageId,
        perm: Permissions,
    ) -> Result<PinnedPage, StorageError> {
        match perm {
            Permissions::ReadOnly => self.lock_table.lock_shared(tx, page_id)?,
            Permissions::ReadWrite => self.lock_table.lock_exclusive(tx, page_id)?,
        }
        let frame = self.pin_frame(page_id)?;
        Ok(PinnedPage {
            shared: Arc::clone(&self.shared),
            frame,
        })
    }

    /// Release every lock held by `tx`. Pins are released by dropping the
    /// page handles; cached pages stay resident for the next transaction.
    pub fn release_transaction(&self, tx: TransactionId) {
        self.lock_table.release_all(tx);
    }

    /// The number of frames with no pins on them
    pub fn available(&self) -> usize {
        *self.shared.num_available.lock().unwrap()
    }

    /// Find or load a frame for `page_id` and pin it, waiting for another
    /// transaction to unpin something when every frame is in use
    fn pin_frame(&self, page_id: PageId) -> Result<Arc<Mutex<Frame>>, StorageError> {
        let deadline = Instant::now() + self.timeout;
        let mut num_available = self.shared.num_available.lock().unwrap();
        loop {
            match self.try_to_pin(page_id)? {
                Some(frame) => {
                    let mut frame_guard = frame.lock().unwrap();
                    if !frame_guard.is_pinned() {
                        *num_available -= 1;
                    }
                    frame_guard.pin();
                    drop(frame_guard);
                    return Ok(frame);
                }
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(StorageError::BufferUnavailable);
                    }
                    let (guard, wait) = self
                        .shared
                        .cond
                        .wait_timeout(num_available, remaining)
                        .unwrap();
                    num_available = guard;
                    if wait.timed_out() {
                        return Err(StorageError::BufferUnavailable);
                    }
                }
            }
        }
    }

    /// Find an existing frame for this page, or evict the first unpinned
    /// frame and load the page into it from the owning heap file
    fn try_to_pin(&self, page_id: PageId) -> Result<Option<Arc<Mutex<Frame>>>, StorageError> {
        if let Some(frame) = self.find_existing_frame(page_id) {
            return Ok(Some(frame));
        }
        let Some(frame) = self.choose_unpinned_frame() else {
            return Ok(None);
        };
        let file = self
            .files
            .lock()
            .unwrap()
            .get(&page_id.file_id)
            .and_then(Weak::upgrade)
            .ok_or(StorageError::UnknownFile {
                file_id: page_id.file_id,
            })?;
        let page = file.read_page(page_id)?;
        frame.lock().unwrap().page = Some(page);
        Ok(Some(frame))
    }

    fn find_existing_frame(&self, page_id: PageId) -> Option<Arc<Mutex<Frame>>> {
        for frame in &self.frames {
            if frame.lock().unwrap().holds(page_id) {
                return Some(Arc::clone(frame));
            }
        }
        None
    }

    fn choose_unpinned_frame(&self) -> Option<Arc<Mutex<Frame>>> {
        for frame in &self.frames {
            if !frame.lock().unwrap().is_pinned() {
                return Some(Arc::clone(frame));
            }
        }
        None
    }
}

/// A page held resident in the cache. Dropping the handle unpins the frame;
/// the page itself stays cached until evicted.
pub struct PinnedPage {
    shared: Arc<PoolShared>,
    frame: Arc<Mutex<Frame>>,
}

impl PinnedPage {
    pub fn page_id(&self) -> PageId {
        self.with_page(|page| page.page_id())
    }

    /// Clone out the live tuples of this page, in slot order
    pub fn live_tuples(&self) -> Vec<Tuple> {
        self.with_page(|page| page.live_tuples().cloned().collect())
    }

    pub fn live_count(&self) -> usize {
        self.with_page(|page| page.live_count())
    }

    /// Run `f` against the decoded page while holding the frame latch
    pub fn with_page<R>(&self, f: impl FnOnce(&HeapPage) -> R) -> R {
        let guard = self.frame.lock().unwrap();
        f(guard.page.as_ref().expect("pinned frame holds a page"))
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.shared.release_pin(&self.frame);
    }
}
