//! Block and page identifiers.

use clippy_utilities::OverflowArithmetic;
use smallvec::SmallVec;

/// The id of a block, globally unique across the cluster.
pub type BlockId = u64;

/// The id of a session that scopes lock ownership.
pub type SessionId = u64;

/// The id of a page: the file it belongs to plus its zero-based index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId {
    /// The id of the file this page belongs to.
    pub file_id: String,
    /// The zero-based index of this page within the file.
    pub page_index: u64,
}

impl PageId {
    /// Creates a new `PageId`.
    #[must_use]
    pub fn new(file_id: impl Into<String>, page_index: u64) -> Self {
        PageId {
            file_id: file_id.into(),
            page_index,
        }
    }
}

/// The file id of a committed block, derived from the block id and its
/// final length.
#[must_use]
#[inline]
pub fn block_file_id(block_id: BlockId, block_size: u64) -> String {
    format!("{block_id:x}-{block_size:x}")
}

/// The file id of a temp block, derived from the block id alone.
#[must_use]
#[inline]
pub fn temp_file_id(block_id: BlockId) -> String {
    format!("tmp-{block_id:x}")
}

/// Recovers the block id from a block or temp file id.
#[must_use]
pub fn block_id_of_file(file_id: &str) -> Option<BlockId> {
    let hex = file_id
        .strip_prefix("tmp-")
        .or_else(|| file_id.split('-').next())?;
    BlockId::from_str_radix(hex, 16).ok()
}

/// The number of pages covering a block of `block_size` bytes.
#[must_use]
#[inline]
pub fn page_count(block_size: u64, page_size: u64) -> u64 {
    block_size
        .overflow_add(page_size.overflow_sub(1))
        .overflow_div(page_size)
}

/// A slice of a single page.
///
/// A `PageSlice` contains the page index, the offset within the page, and
/// the size of the slice.
#[derive(Debug, Clone, Copy)]
pub struct PageSlice {
    /// The page index.
    pub page_index: u64,
    /// The offset within the page.
    pub offset: u64,
    /// The size of the slice.
    pub size: u64,
}

/// Converts an offset and length into a sequence of `PageSlice`s covering
/// the range, clamped to `block_size`.
#[must_use]
pub fn offset_to_slices(
    page_size: u64,
    block_size: u64,
    offset: u64,
    len: u64,
) -> SmallVec<[PageSlice; 2]> {
    let mut slices = SmallVec::new();
    let end = offset.overflow_add(len).min(block_size);
    let mut current_offset = offset.min(block_size);

    while current_offset < end {
        let page_index = current_offset.overflow_div(page_size);
        let offset_in_page = current_offset.overflow_rem(page_size);
        let space_in_page = page_size.overflow_sub(offset_in_page);
        let size = space_in_page.min(end.overflow_sub(current_offset));

        slices.push(PageSlice {
            page_index,
            offset: offset_in_page,
            size,
        });
        current_offset = current_offset.overflow_add(size);
    }

    slices
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_round_trip() {
        let file_id = block_file_id(42, 9000);
        assert_eq!(block_id_of_file(&file_id), Some(42));
        let temp_id = temp_file_id(42);
        assert_eq!(block_id_of_file(&temp_id), Some(42));
        assert_ne!(file_id, temp_id);
    }

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(0, 4096), 0);
        assert_eq!(page_count(4096, 4096), 1);
        assert_eq!(page_count(5000, 4096), 2);
        assert_eq!(page_count(9192, 4096), 3);
    }

    #[test]
    fn test_offset_to_slices() {
        // A read at offset 8000 over a 9192-byte block with 4096-byte pages
        // covers the tail of page 1 and the whole of page 2.
        let slices = offset_to_slices(4096, 9192, 8000, 2000);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].page_index, 1);
        assert_eq!(slices[0].offset, 3904);
        assert_eq!(slices[0].size, 192);
        assert_eq!(slices[1].page_index, 2);
        assert_eq!(slices[1].offset, 0);
        assert_eq!(slices[1].size, 1000);
    }

    #[test]
    fn test_offset_beyond_block() {
        let slices = offset_to_slices(4096, 5000, 6000, 10);
        assert!(slices.is_empty());
    }
}
