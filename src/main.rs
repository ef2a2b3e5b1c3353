//! heapstore: a page-oriented heap-file storage layer for relational tables.
//!
//! A table lives in one flat file of fixed-size pages. [`HeapFile`] computes
//! page offsets and performs raw page I/O, [`Schema`] describes the
//! fixed-width tuple layout, and [`HeapFileScan`] walks every live tuple page
//! by page through the [`BufferPool`], which pins pages in memory and
//! arbitrates transactional access with page-granularity locks.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

mod buffer_pool;
mod heap_file;
mod heap_page;
mod schema;
#[cfg(test)]
mod test_utils;
mod tuple;

pub use buffer_pool::{BufferPool, Permissions, PinnedPage};
pub use heap_file::{HeapFile, HeapFileScan};
pub use heap_page::{encode_heap_page, HeapPage};
pub use schema::{FieldType, Schema, TEXT_LEN};
pub use tuple::{RecordId, Tuple, Value};

#[cfg(test)]
use test_utils::TestDir;

/// Storage settings fixed at startup and threaded explicitly through every
/// component that needs them. The page size in particular is a single value
/// shared by all heap files and the buffer pool; the two reading different
/// sizes would be a fatal layout inconsistency.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Size of one page in bytes, for both file layout and cache frames
    pub page_size: usize,
    /// Number of frames in the buffer pool
    pub buffer_capacity: usize,
    /// How long a transaction waits for a page lock or a free frame before
    /// giving up
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            buffer_capacity: 8,
            lock_timeout_ms: 10_000,
        }
    }
}

/// The monotonic generator handing out transaction ids process-wide
struct TxIdGenerator {
    next_id: AtomicU64,
}

static TX_ID_GENERATOR: OnceLock<TxIdGenerator> = OnceLock::new();

/// An opaque transaction identifier.
///
/// This crate does not manage transactions; it only tags page requests with
/// the id so the buffer pool can enforce lock ownership. Ids are unique for
/// the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let generator = TX_ID_GENERATOR.get_or_init(|| TxIdGenerator {
            next_id: AtomicU64::new(0),
        });
        TransactionId(
            generator
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        )
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// The cache key for one page: the owning file's identity plus the page
/// number within that file. Pages of different files never collide in the
/// cache because the file identity is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub file_id: u64,
    pub page_no: usize,
}

impl PageId {
    pub fn new(file_id: u64, page_no: usize) -> Self {
        Self { file_id, page_no }
    }
}

/// Everything that can go wrong in the storage layer, split so callers can
/// tell the kinds apart instead of parsing message strings.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("schema must contain at least one field")]
    EmptySchema,
    #[error("field index {index} out of range for schema with {field_count} fields")]
    FieldIndexOutOfRange { index: usize, field_count: usize },
    #[error("no field named {0} in schema")]
    FieldNotFound(String),
    #[error("heap file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("no heap file with identity {file_id:#018x} is registered with the page cache")]
    UnknownFile { file_id: u64 },
    #[error("page id belongs to file {requested:#018x}, not this file {expected:#018x}")]
    FileIdentityMismatch { expected: u64, requested: u64 },
    #[error("page {page_no} out of range for heap file with {page_count} pages")]
    PageOutOfRange { page_no: usize, page_count: usize },
    #[error("i/o failure at byte offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("storage setup failed: {0}")]
    Setup(#[source] std::io::Error),
    #[error("{tx} aborted while waiting for a page lock")]
    TransactionAborted { tx: TransactionId },
    #[error("timed out waiting for a free buffer pool frame")]
    BufferUnavailable,
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("scan exhausted")]
    Exhausted,
    #[error("{tuples} tuples do not fit in a page with {capacity} slots")]
    PageCapacityExceeded { tuples: usize, capacity: usize },
    #[error("tuple does not match schema {0}")]
    TupleSchemaMismatch(String),
}

/// A raw fixed-size page buffer with typed accessors.
///
/// Integers are stored big endian; text is stored as a 4-byte big-endian
/// length followed by a fixed payload region padded with zeroes. Offsets are
/// the caller's responsibility; the page layout code computes them from the
/// schema.
pub struct Page {
    pub contents: Vec<u8>,
}

impl Page {
    pub const INT_BYTES: usize = 4;

    pub fn new(page_size: usize) -> Self {
        Self {
            contents: vec![0; page_size],
        }
    }

    /// Wrap existing page bytes without copying
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { contents: bytes }
    }

    /// Get an integer from the page at the given offset
    pub fn get_int(&self, offset: usize) -> i32 {
        let bytes: [u8; Self::INT_BYTES] = self.contents[offset..offset + Self::INT_BYTES]
            .try_into()
            .unwrap();
        i32::from_be_bytes(bytes)
    }

    /// Set an integer at the given offset
    pub fn set_int(&mut self, offset: usize, n: i32) {
        self.contents[offset..offset + Self::INT_BYTES].copy_from_slice(&n.to_be_bytes());
    }

    /// Get a text value at the given offset: read the length prefix, clamp it
    /// to the fixed payload width, then read that many bytes
    pub fn get_text(&self, offset: usize, max_len: usize) -> String {
        let len = (self.get_int(offset).max(0) as usize).min(max_len);
        let start = offset + Self::INT_BYTES;
        String::from_utf8_lossy(&self.contents[start..start + len]).into_owned()
    }

    /// Set a text value at the given offset: write the length prefix, the
    /// bytes, and zero the rest of the fixed payload region
    pub fn set_text(&mut self, offset: usize, s: &str, max_len: usize) {
        let bytes = s.as_bytes();
        let len = bytes.len().min(max_len);
        self.set_int(offset, len as i32);
        let start = offset + Self::INT_BYTES;
        self.contents[start..start + len].copy_from_slice(&bytes[..len]);
        self.contents[start + len..start + max_len].fill(0);
    }
}

/// The top-level storage handle: one database directory, one configuration,
/// one shared buffer pool.
pub struct HeapStore {
    db_directory: PathBuf,
    config: StorageConfig,
    buffer_pool: Arc<BufferPool>,
}

impl HeapStore {
    pub fn new<P: AsRef<Path>>(path: P, config: StorageConfig) -> Result<Self, StorageError> {
        let db_directory = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&db_directory).map_err(StorageError::Setup)?;
        let buffer_pool = Arc::new(BufferPool::new(&config));
        Ok(Self {
            db_directory,
            config,
            buffer_pool,
        })
    }

    #[cfg(test)]
    fn new_for_test(config: StorageConfig) -> (Self, TestDir) {
        let test_dir = test_utils::test_dir("heap_store");
        let store = Self::new(&test_dir, config).unwrap();
        (store, test_dir)
    }

    /// Open the heap file for `file_name` inside the database directory,
    /// creating an empty file first if none exists, and register it with the
    /// buffer pool
    pub fn open_table(
        &self,
        file_name: &str,
        schema: Schema,
    ) -> Result<Arc<HeapFile>, StorageError> {
        let path = self.db_directory.join(file_name);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(StorageError::Setup)?;
        HeapFile::open(path, schema, &self.config, Arc::clone(&self.buffer_pool))
    }

    /// Hand out a fresh transaction id
    pub fn begin_tx(&self) -> TransactionId {
        TransactionId::new()
    }

    /// Release every page lock held by `tx`
    pub fn release_transaction(&self, tx: TransactionId) {
        self.buffer_pool.release_transaction(tx);
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn db_directory(&self) -> &Path {
        &self.db_directory
    }
}
