use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer_pool::{BufferPool, Permissions, PinnedPage};
use crate::heap_page::HeapPage;
use crate::schema::Schema;
use crate::tuple::Tuple;
use crate::{PageId, StorageConfig, StorageError, TransactionId};

/// The on-disk representation of one table: an unordered collection of
/// fixed-size pages in a single flat file.
///
/// Page `n` occupies bytes `[n * page_size, (n + 1) * page_size)`. The file
/// length is expected to be an exact multiple of the page size; a trailing
/// partial page is silently ignored by the page count rather than rejected.
///
/// A heap file only ever reads its backing store. The write path
/// ([`HeapFile::write_page`], tuple insert/delete) belongs to a later stage
/// and fails with [`StorageError::Unsupported`] instead of pretending to
/// succeed.
pub struct HeapFile {
    path: PathBuf,
    schema: Schema,
    page_size: usize,
    page_count: usize,
    pool: Arc<BufferPool>,
    //  set only by tests that need to force an identity collision
    id_override: Option<u64>,
}

impl HeapFile {
    /// Open the heap file backing `path` and register it with the page cache.
    ///
    /// The page count is computed once here, as `file length / page size`
    /// rounded down. It is not refreshed if the file grows afterwards; one
    /// heap file instance is expected to live for the whole session over a
    /// file whose length only changes through (unsupported) writes.
    pub fn open<P: AsRef<Path>>(
        path: P,
        schema: Schema,
        config: &StorageConfig,
        pool: Arc<BufferPool>,
    ) -> Result<Arc<HeapFile>, StorageError> {
        Self::open_inner(path, schema, config, pool, None)
    }

    #[cfg(test)]
    pub(crate) fn open_with_id<P: AsRef<Path>>(
        path: P,
        schema: Schema,
        config: &StorageConfig,
        pool: Arc<BufferPool>,
        forced_id: u64,
    ) -> Result<Arc<HeapFile>, StorageError> {
        Self::open_inner(path, schema, config, pool, Some(forced_id))
    }

    fn open_inner<P: AsRef<Path>>(
        path: P,
        schema: Schema,
        config: &StorageConfig,
        pool: Arc<BufferPool>,
        id_override: Option<u64>,
    ) -> Result<Arc<HeapFile>, StorageError> {
        let path = fs::canonicalize(path.as_ref()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound(path.as_ref().to_path_buf())
            } else {
                StorageError::Setup(e)
            }
        })?;
        let file_len = fs::metadata(&path).map_err(StorageError::Setup)?.len();
        let page_count = (file_len / config.page_size as u64) as usize;

        let file = Arc::new(HeapFile {
            path,
            schema,
            page_size: config.page_size,
            page_count,
            pool,
            id_override,
        });
        file.pool.register_file(&file);
        Ok(file)
    }

    /// The identity of this heap file, recomputed from the canonical path so
    /// it is stable across process restarts. The hash is not claimed to be
    /// collision free; pages are keyed by the full [`PageId`], and reads
    /// always go through this file's own path.
    pub fn id(&self) -> u64 {
        match self.id_override {
            Some(id) => id,
            None => fnv1a64(self.path.to_string_lossy().as_bytes()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The page count computed at open time
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The [`PageId`] of page `page_no` of this file
    pub fn page_id(&self, page_no: usize) -> PageId {
        PageId::new(self.id(), page_no)
    }

    /// Read one page's raw bytes straight from disk, bypassing the cache.
    ///
    /// This is the cache-miss path: the page cache calls it to load frames,
    /// and query-level consumers are expected to go through the cache
    /// instead. Each call opens its own read handle, which is released on
    /// every exit path when it drops.
    ///
    /// There is deliberately no bounds check against [`HeapFile::page_count`]:
    /// a page number past the end of the store computes an offset past the
    /// file length and surfaces as [`StorageError::Io`] with that offset,
    /// never as a zero-filled page.
    pub fn read_page(&self, page_id: PageId) -> Result<HeapPage, StorageError> {
        if page_id.file_id != self.id() {
            return Err(StorageError::FileIdentityMismatch {
                expected: self.id(),
                requested: page_id.file_id,
            });
        }

        let offset = page_id.page_no as u64 * self.page_size as u64;
        let mut file = File::open(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound(self.path.clone())
            } else {
                StorageError::Io { offset, source: e }
            }
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::Io { offset, source: e })?;

        //  the store must hold a whole page at this offset; a short read is a fault
        let mut bytes = vec![0u8; self.page_size];
        file.read_exact(&mut bytes)
            .map_err(|e| StorageError::Io { offset, source: e })?;

        Ok(HeapPage::parse(page_id, &self.schema, bytes))
    }

    /// Persisting a page is not part of this storage core.
    pub fn write_page(&self, _page: &HeapPage) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("HeapFile::write_page"))
    }

    /// Open a cross-page tuple scan over this file under `tx`. Pages are
    /// fetched through the page cache with read-only permission.
    pub fn scan(&self, tx: TransactionId) -> HeapFileScan {
        HeapFileScan {
            tx,
            file_id: self.id(),
            schema: self.schema.clone(),
            page_count: self.page_count,
            pool: Arc::clone(&self.pool),
            page_no: 0,
            cursor: None,
        }
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A resumable cursor over every live tuple of a heap file, in page order
/// and slot order within a page.
///
/// The cursor owns the facts it needs: the file identity, schema and page
/// count captured at construction, the transaction it runs under and a
/// handle to the page cache. It holds at most one page pinned at a time and
/// pulls the next page only once the current one is exhausted.
///
/// The page-then-slot ordering is an artifact of the storage layout. It is
/// reproduced deterministically, but heap files are unordered and callers
/// must not build correctness on it.
pub struct HeapFileScan {
    tx: TransactionId,
    file_id: u64,
    schema: Schema,
    page_count: usize,
    pool: Arc<BufferPool>,
    page_no: usize,
    cursor: Option<Cursor>,
}

struct Cursor {
    //  keeps the page pinned in the cache while we drain its tuples
    _page: PinnedPage,
    tuples: std::vec::IntoIter<Tuple>,
}

impl HeapFileScan {
    /// Position the scan on page 0. An empty file has no page 0, so opening
    /// a scan over one fails here with [`StorageError::PageOutOfRange`];
    /// iteration afterwards reports exhaustion instead of failing again.
    pub fn open(&mut self) -> Result<(), StorageError> {
        self.page_no = 0;
        self.cursor = Some(self.fetch_page(0)?);
        Ok(())
    }

    /// Whether another tuple is available, pulling pages from the cache as
    /// needed. Pages holding no live tuples are skipped; a lock-wait abort
    /// from the cache propagates as an error rather than reading as
    /// end-of-scan.
    pub fn has_next(&mut self) -> Result<bool, StorageError> {
        loop {
            let Some(cursor) = self.cursor.as_ref() else {
                return Ok(false);
            };
            if !cursor.tuples.as_slice().is_empty() {
                return Ok(true);
            }
            if self.page_no + 1 >= self.page_count {
                return Ok(false);
            }
            //  unpin the drained page before pinning its successor
            self.cursor = None;
            self.page_no += 1;
            self.cursor = Some(self.fetch_page(self.page_no)?);
        }
    }

    /// The next tuple of the scan. Fails with [`StorageError::Exhausted`]
    /// when the scan is unopened or every tuple has been produced.
    pub fn next(&mut self) -> Result<Tuple, StorageError> {
        self.has_next()?;
        self.cursor
            .as_mut()
            .and_then(|cursor| cursor.tuples.next())
            .ok_or(StorageError::Exhausted)
    }

    /// Restart the scan from page 0; equivalent to `close` followed by `open`
    pub fn rewind(&mut self) -> Result<(), StorageError> {
        self.close();
        self.open()
    }

    /// Drop the cursor state and unpin the current page. Evicting anything
    /// is the page cache's business, not the scan's.
    pub fn close(&mut self) {
        self.cursor = None;
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn fetch_page(&self, page_no: usize) -> Result<Cursor, StorageError> {
        if page_no >= self.page_count {
            return Err(StorageError::PageOutOfRange {
                page_no,
                page_count: self.page_count,
            });
        }
        let page_id = PageId::new(self.file_id, page_no);
        let pinned = self
            .pool
            .get_page(self.tx, page_id, Permissions::ReadOnly)?;
        let tuples = pinned.live_tuples().into_iter();
        Ok(Cursor {
            _page: pinned,
            tuples,
        })
    }
}

#[cfg(test)]
mod heap_file_tests {
    use super::*;
    use crate::heap_page::encode_heap_page;
    use crate::schema::FieldType;
    use crate::test_utils::{test_dir, TestDir};
    use crate::tuple::Value;

    fn demo_schema() -> Schema {
        Schema::with_names(&[FieldType::Int, FieldType::Text], &["id", "name"]).unwrap()
    }

    fn demo_tuple(id: i32) -> Tuple {
        Tuple::new(vec![Value::Int(id), Value::text(&format!("user{}", id))])
    }

    /// Write a heap file whose pages hold `rows_per_page[i]` tuples each,
    /// with ids numbered consecutively across pages
    fn seed_file(dir: &TestDir, name: &str, rows_per_page: &[usize], page_size: usize) -> PathBuf {
        let schema = demo_schema();
        let mut bytes = Vec::with_capacity(rows_per_page.len() * page_size);
        let mut next_id = 0;
        for rows in rows_per_page {
            let tuples: Vec<Tuple> = (0..*rows)
                .map(|_| {
                    let tuple = demo_tuple(next_id);
                    next_id += 1;
                    tuple
                })
                .collect();
            bytes.extend(encode_heap_page(&schema, &tuples, page_size).unwrap());
        }
        let path = dir.as_ref().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn pool(config: &StorageConfig) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(config))
    }

    #[test]
    fn test_page_count_from_file_length() {
        let dir = test_dir("heap_file_page_count");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "three_pages", &[1, 1, 1], config.page_size);

        let file = HeapFile::open(&path, demo_schema(), &config, pool(&config)).unwrap();
        assert_eq!(file.page_count(), 3);
    }

    #[test]
    fn test_partial_trailing_page_is_silently_dropped() {
        let dir = test_dir("heap_file_partial_page");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "partial", &[1, 1], config.page_size);

        //  grow the file by half a page; open must not error and the count
        //  must floor to 2
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend(vec![0u8; config.page_size / 2]);
        fs::write(&path, bytes).unwrap();

        let file = HeapFile::open(&path, demo_schema(), &config, pool(&config)).unwrap();
        assert_eq!(file.page_count(), 2);
    }

    #[test]
    fn test_identity_is_deterministic_per_path() {
        let dir = test_dir("heap_file_identity");
        let config = StorageConfig::default();
        let path_a = seed_file(&dir, "a", &[1], config.page_size);
        let path_b = seed_file(&dir, "b", &[1], config.page_size);

        let first = HeapFile::open(&path_a, demo_schema(), &config, pool(&config)).unwrap();
        let second = HeapFile::open(&path_a, demo_schema(), &config, pool(&config)).unwrap();
        let other = HeapFile::open(&path_b, demo_schema(), &config, pool(&config)).unwrap();

        //  same path, same id, however many times the file is opened
        assert_eq!(first.id(), second.id());
        assert_ne!(first.id(), other.id());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = test_dir("heap_file_missing");
        let config = StorageConfig::default();
        let missing = dir.as_ref().join("nope");
        assert!(matches!(
            HeapFile::open(&missing, demo_schema(), &config, pool(&config)),
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_read_page_returns_live_tuples() {
        let dir = test_dir("heap_file_read_page");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "data", &[4], config.page_size);

        let file = HeapFile::open(&path, demo_schema(), &config, pool(&config)).unwrap();
        let page = file.read_page(file.page_id(0)).unwrap();
        assert_eq!(page.live_count(), 4);
        let ids: Vec<i32> = page
            .live_tuples()
            .map(|tuple| match tuple.value(0) {
                Some(Value::Int(id)) => *id,
                _ => panic!("expected int id"),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_read_page_past_eof_is_an_io_error_with_offset() {
        let dir = test_dir("heap_file_read_past_eof");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "two_pages", &[1, 1], config.page_size);

        let file = HeapFile::open(&path, demo_schema(), &config, pool(&config)).unwrap();
        let expected_offset = 5 * config.page_size as u64;
        match file.read_page(file.page_id(5)) {
            Err(StorageError::Io { offset, .. }) => assert_eq!(offset, expected_offset),
            other => panic!("expected Io error, got {:?}", other.map(|p| p.page_id())),
        }
    }

    #[test]
    fn test_read_page_after_store_vanishes_is_not_found() {
        let dir = test_dir("heap_file_vanished");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "doomed", &[1], config.page_size);

        let file = HeapFile::open(&path, demo_schema(), &config, pool(&config)).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(matches!(
            file.read_page(file.page_id(0)),
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_read_page_rejects_foreign_page_id() {
        let dir = test_dir("heap_file_foreign_pid");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "data", &[1], config.page_size);

        let file = HeapFile::open(&path, demo_schema(), &config, pool(&config)).unwrap();
        let foreign = PageId::new(file.id().wrapping_add(1), 0);
        assert!(matches!(
            file.read_page(foreign),
            Err(StorageError::FileIdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_write_page_is_unsupported() {
        let dir = test_dir("heap_file_write");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "data", &[1], config.page_size);

        let file = HeapFile::open(&path, demo_schema(), &config, pool(&config)).unwrap();
        let page = file.read_page(file.page_id(0)).unwrap();
        assert!(matches!(
            file.write_page(&page),
            Err(StorageError::Unsupported("HeapFile::write_page"))
        ));
    }

    #[test]
    fn test_colliding_identities_still_read_their_own_bytes() {
        let dir = test_dir("heap_file_collision");
        let config = StorageConfig::default();
        let path_a = seed_file(&dir, "alpha", &[2], config.page_size);
        let path_b = seed_file(&dir, "beta", &[3], config.page_size);

        //  force both files onto the same identity; the hash is not claimed
        //  to be collision free and page ids alone cannot tell them apart,
        //  but every read goes through the file's own path
        let shared_pool = pool(&config);
        let file_a = HeapFile::open_with_id(
            &path_a,
            demo_schema(),
            &config,
            Arc::clone(&shared_pool),
            42,
        )
        .unwrap();
        let file_b =
            HeapFile::open_with_id(&path_b, demo_schema(), &config, shared_pool, 42).unwrap();

        let page_id = PageId::new(42, 0);
        assert_eq!(file_a.page_id(0), file_b.page_id(0));
        assert_eq!(file_a.read_page(page_id).unwrap().live_count(), 2);
        assert_eq!(file_b.read_page(page_id).unwrap().live_count(), 3);
    }
}

#[cfg(test)]
mod heap_file_scan_tests {
    use super::*;
    use crate::heap_page::encode_heap_page;
    use crate::schema::FieldType;
    use crate::test_utils::{test_dir, TestDir};
    use crate::tuple::Value;

    fn demo_schema() -> Schema {
        Schema::with_names(&[FieldType::Int, FieldType::Text], &["id", "name"]).unwrap()
    }

    fn seed_file(dir: &TestDir, name: &str, rows_per_page: &[usize], page_size: usize) -> PathBuf {
        let schema = demo_schema();
        let mut bytes = Vec::new();
        let mut next_id = 0;
        for rows in rows_per_page {
            let tuples: Vec<Tuple> = (0..*rows)
                .map(|_| {
                    let tuple = Tuple::new(vec![
                        Value::Int(next_id),
                        Value::text(&format!("user{}", next_id)),
                    ]);
                    next_id += 1;
                    tuple
                })
                .collect();
            bytes.extend(encode_heap_page(&schema, &tuples, page_size).unwrap());
        }
        let path = dir.as_ref().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn open_file(path: &Path, config: &StorageConfig) -> Arc<HeapFile> {
        let pool = Arc::new(BufferPool::new(config));
        HeapFile::open(path, demo_schema(), config, pool).unwrap()
    }

    fn collect_ids(scan: &mut HeapFileScan) -> Vec<i32> {
        let mut ids = Vec::new();
        while scan.has_next().unwrap() {
            match scan.next().unwrap().value(0) {
                Some(Value::Int(id)) => ids.push(*id),
                _ => panic!("expected int id"),
            }
        }
        ids
    }

    #[test]
    fn test_scan_crosses_pages_and_skips_empty_ones() {
        let dir = test_dir("scan_cross_pages");
        let config = StorageConfig::default();
        //  page 1 holds no live tuples at all; the scan must hop over it
        let path = seed_file(&dir, "table", &[5, 0, 2], config.page_size);
        let file = open_file(&path, &config);

        let mut scan = file.scan(TransactionId::new());
        scan.open().unwrap();
        let ids = collect_ids(&mut scan);
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6]);

        //  tuples come out in page order, then slot order within the page
        scan.rewind().unwrap();
        let first = scan.next().unwrap();
        let record_id = first.record_id().unwrap();
        assert_eq!(record_id.page_id.page_no, 0);
        assert_eq!(record_id.slot, 0);
    }

    #[test]
    fn test_rewind_mid_scan_reproduces_the_sequence() {
        let dir = test_dir("scan_rewind");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "table", &[5, 0, 2], config.page_size);
        let file = open_file(&path, &config);

        let mut scan = file.scan(TransactionId::new());
        scan.open().unwrap();
        let full = collect_ids(&mut scan);

        scan.rewind().unwrap();
        for _ in 0..3 {
            scan.next().unwrap();
        }
        scan.rewind().unwrap();
        let replay = collect_ids(&mut scan);
        assert_eq!(full, replay);
    }

    #[test]
    fn test_empty_file_fails_in_open_not_during_iteration() {
        let dir = test_dir("scan_empty_file");
        let config = StorageConfig::default();
        let path = dir.as_ref().join("empty");
        fs::write(&path, []).unwrap();
        let file = open_file(&path, &config);
        assert_eq!(file.page_count(), 0);

        let mut scan = file.scan(TransactionId::new());
        assert!(matches!(
            scan.open(),
            Err(StorageError::PageOutOfRange {
                page_no: 0,
                page_count: 0
            })
        ));
        //  the boundary check itself never throws during iteration
        assert!(!scan.has_next().unwrap());
        assert!(matches!(scan.next(), Err(StorageError::Exhausted)));
    }

    #[test]
    fn test_next_before_open_and_past_end_is_exhausted() {
        let dir = test_dir("scan_exhausted");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "table", &[1], config.page_size);
        let file = open_file(&path, &config);

        let mut scan = file.scan(TransactionId::new());
        assert!(matches!(scan.next(), Err(StorageError::Exhausted)));

        scan.open().unwrap();
        scan.next().unwrap();
        assert!(!scan.has_next().unwrap());
        assert!(matches!(scan.next(), Err(StorageError::Exhausted)));
    }

    #[test]
    fn test_close_resets_to_unopened() {
        let dir = test_dir("scan_close");
        let config = StorageConfig::default();
        let path = seed_file(&dir, "table", &[3], config.page_size);
        let file = open_file(&path, &config);

        let mut scan = file.scan(TransactionId::new());
        scan.open().unwrap();
        scan.next().unwrap();
        scan.close();

        assert!(!scan.has_next().unwrap());
        assert!(matches!(scan.next(), Err(StorageError::Exhausted)));

        //  reopening starts over from page 0
        scan.open().unwrap();
        assert_eq!(collect_ids(&mut scan), vec![0, 1, 2]);
    }

    #[test]
    fn test_cache_abort_propagates_through_the_scan() {
        let dir = test_dir("scan_abort");
        let config = StorageConfig {
            lock_timeout_ms: 50,
            ..StorageConfig::default()
        };
        let path = seed_file(&dir, "table", &[2, 2], config.page_size);

        let pool = Arc::new(BufferPool::new(&config));
        let file = HeapFile::open(&path, demo_schema(), &config, Arc::clone(&pool)).unwrap();

        //  a writer parks itself on page 1 and never lets go
        let writer = TransactionId::new();
        let _held = pool
            .get_page(writer, file.page_id(1), Permissions::ReadWrite)
            .unwrap();

        let reader = TransactionId::new();
        let mut scan = file.scan(reader);
        scan.open().unwrap();
        //  page 0 drains fine; the hop to page 1 hits the writer's lock and
        //  must surface the abort, not end-of-scan
        scan.next().unwrap();
        scan.next().unwrap();
        assert!(matches!(
            scan.has_next(),
            Err(StorageError::TransactionAborted { tx }) if tx == reader
        ));

        //  once the writer's locks are gone the same scan can be rerun
        pool.release_transaction(writer);
        drop(_held);
        scan.rewind().unwrap();
        assert_eq!(collect_ids(&mut scan).len(), 4);
    }
}
