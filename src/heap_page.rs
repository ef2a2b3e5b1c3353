use crate::schema::{FieldType, Schema, TEXT_LEN};
use crate::tuple::{RecordId, Tuple, Value};
use crate::{Page, PageId, StorageError};

/// An in-memory view of one slotted heap page.
///
/// # Page layout
///
/// A heap page is a fixed-size byte array holding an occupancy bitmap header
/// followed by a dense array of fixed-width tuple slots:
///
/// ```text
/// +-----------------+----------+----------+-----+----------+---------+
/// | header (bitmap) | slot 0   | slot 1   | ... | slot N-1 | padding |
/// +-----------------+----------+----------+-----+----------+---------+
/// ```
///
/// - `N = (page_size * 8) / (tuple_size * 8 + 1)`, floored: each slot costs
///   its tuple bytes plus one header bit
/// - the header is `ceil(N / 8)` bytes; slot `i`'s used flag is bit `i % 8`
///   (least significant first) of header byte `i / 8`
/// - slot `i`'s tuple starts at byte `header_len + i * tuple_size`
///
/// Parsing decodes every used slot eagerly; unused slots stay `None`.
pub struct HeapPage {
    page_id: PageId,
    slot_count: usize,
    header: Vec<u8>,
    tuples: Vec<Option<Tuple>>,
}

impl HeapPage {
    /// Number of tuple slots a page of `page_size` bytes can hold for tuples
    /// of `tuple_size` bytes
    pub fn slot_capacity(page_size: usize, tuple_size: usize) -> usize {
        (page_size * 8) / (tuple_size * 8 + 1)
    }

    /// Number of header bytes needed for a bitmap over `slot_count` slots
    pub fn header_len(slot_count: usize) -> usize {
        (slot_count + 7) / 8
    }

    /// Decode a raw page image into a [`HeapPage`]. `bytes` must be exactly
    /// one page as read from the backing store.
    pub fn parse(page_id: PageId, schema: &Schema, bytes: Vec<u8>) -> HeapPage {
        let page_size = bytes.len();
        let tuple_size = schema.byte_size();
        let slot_count = Self::slot_capacity(page_size, tuple_size);
        let header_len = Self::header_len(slot_count);

        let page = Page::from_bytes(bytes);
        let header = page.contents[..header_len].to_vec();

        let mut tuples = Vec::with_capacity(slot_count);
        for slot in 0..slot_count {
            if !bitmap_bit(&header, slot) {
                tuples.push(None);
                continue;
            }
            let mut offset = header_len + slot * tuple_size;
            let mut values = Vec::with_capacity(schema.field_count());
            for (field_type, _) in schema.iter() {
                match field_type {
                    FieldType::Int => values.push(Value::Int(page.get_int(offset))),
                    FieldType::Text => values.push(Value::Text(page.get_text(offset, TEXT_LEN))),
                }
                offset += field_type.byte_len();
            }
            tuples.push(Some(Tuple::with_record_id(
                values,
                RecordId::new(page_id, slot),
            )));
        }

        HeapPage {
            page_id,
            slot_count,
            header,
            tuples,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The number of slots this page holds, used or not
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Whether slot `slot` holds a live tuple. Out-of-range slots read as unused.
    pub fn is_slot_used(&self, slot: usize) -> bool {
        slot < self.slot_count && bitmap_bit(&self.header, slot)
    }

    /// The live tuples of this page, in slot order
    pub fn live_tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter().flatten()
    }

    pub fn live_count(&self) -> usize {
        self.tuples.iter().flatten().count()
    }

    /// Tuple insertion is not part of this storage core. Fails fast so a
    /// caller can never mistake the result for "nothing to do".
    pub fn insert_tuple(&mut self, _tuple: &Tuple) -> Result<RecordId, StorageError> {
        Err(StorageError::Unsupported("HeapPage::insert_tuple"))
    }

    /// Tuple deletion is not part of this storage core. Fails fast, never a
    /// silent no-op.
    pub fn delete_tuple(&mut self, _record_id: &RecordId) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("HeapPage::delete_tuple"))
    }
}

fn bitmap_bit(header: &[u8], slot: usize) -> bool {
    (header[slot / 8] >> (slot % 8)) & 1 == 1
}

/// Build a raw page image holding `tuples` in slots `0..tuples.len()`.
///
/// This is how read-only heap files come to exist: the test suite, the CLI
/// seeder and the benches lay pages out with it and write them to disk. It is
/// not a transactional write path.
pub fn encode_heap_page(
    schema: &Schema,
    tuples: &[Tuple],
    page_size: usize,
) -> Result<Vec<u8>, StorageError> {
    let tuple_size = schema.byte_size();
    let slot_count = HeapPage::slot_capacity(page_size, tuple_size);
    let header_len = HeapPage::header_len(slot_count);

    if tuples.len() > slot_count {
        return Err(StorageError::PageCapacityExceeded {
            tuples: tuples.len(),
            capacity: slot_count,
        });
    }

    let mut page = Page::new(page_size);
    for (slot, tuple) in tuples.iter().enumerate() {
        if !tuple.matches_schema(schema) {
            return Err(StorageError::TupleSchemaMismatch(schema.to_string()));
        }
        page.contents[slot / 8] |= 1 << (slot % 8);

        let mut offset = header_len + slot * tuple_size;
        for value in tuple.values() {
            match value {
                Value::Int(i) => page.set_int(offset, *i),
                Value::Text(s) => page.set_text(offset, s, TEXT_LEN),
            }
            offset += value.field_type().byte_len();
        }
    }
    Ok(page.contents)
}
