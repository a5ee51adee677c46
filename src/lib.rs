#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

mod append;
mod bitmap;
pub mod error;
mod layout;
pub mod platform;
mod raw;
mod read;
mod reclaim;

pub use raw::{BLOCK_SIZE, MAX_PARTITIONS, PAGE_SIZE, PAGES_PER_BLOCK, PageState};

extern crate alloc;

use crate::bitmap::BitmapRecord;
use crate::error::{Error, PartialWrite};
use crate::platform::Platform;
use crate::raw::BITMAP_WORD_SIZE;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;

/// Partitions known to the layout. `Bitmap` is created implicitly by `format` and is always the
/// first entry, `Data` is appended last and takes all remaining blocks.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum PartitionId {
    Bitmap = 0,
    Data = 1,
    Crashlog = 2,
    SensorData = 3,
    Settings = 4,
}

/// A partition as recorded in the partition table, in units of 4k blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub block_offset: u32,
    pub block_count: u32,
}

/// A partition to be created by `format`. Offsets are assigned in the order of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionRequest {
    pub id: PartitionId,
    pub block_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChipConfig {
    pub block_size: usize,
    pub page_size: usize,
    pub pages_per_block: usize,
    pub total_blocks: u32,
}

/// Position of a single page: `ptr` is the flash address of the bitmap word describing the
/// block, `element` (0..16) selects the page within that block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cursor {
    pub ptr: u32,
    pub element: u8,
}

impl Cursor {
    pub const fn new(ptr: u32, element: u8) -> Self {
        Self { ptr, element }
    }

    /// The following slot, possibly one past the end of the bitmap range.
    pub(crate) fn next(self) -> Self {
        if self.element as usize + 1 == PAGES_PER_BLOCK {
            Cursor::new(self.ptr + BITMAP_WORD_SIZE as u32, 0)
        } else {
            Cursor::new(self.ptr, self.element + 1)
        }
    }

    pub(crate) fn next_wrapping(self, bitmap: &Range<u32>) -> Self {
        let next = self.next();
        if next.ptr >= bitmap.end {
            Cursor::new(bitmap.start, 0)
        } else {
            next
        }
    }
}

/// Token linking a `read` to a later `mark_dirty`. Keep passing the same token to `read` to continue
/// where the previous call stopped, pass it to `mark_dirty` once the data has been processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageRange {
    pub(crate) valid: bool,
    pub(crate) start: Cursor,
    pub(crate) end: Cursor,
    // `None` until at least one byte was delivered, `Some(255)` if the last page was read completely
    pub(crate) last_byte_pos: Option<u8>,
    // set once reading went past the partition end, `start` is then the hard stop
    pub(crate) wrapped: bool,
}

impl PageRange {
    pub const fn new() -> Self {
        Self {
            valid: false,
            start: Cursor::new(0, 0),
            end: Cursor::new(0, 0),
            last_byte_pos: None,
            wrapped: false,
        }
    }

    /// Forget the position, the next `read` starts at the partition's read cursor again.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn start(&self) -> Cursor {
        self.start
    }

    pub fn end(&self) -> Cursor {
        self.end
    }

    pub fn last_byte_pos(&self) -> Option<u8> {
        self.last_byte_pos
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageStatistics {
    pub free: u32,
    pub used: u32,
    pub dirty: u32,
    pub bad: u32,
    pub min_free_bytes: u32,
}

/// Owns the flash driver, the partition catalog and the per partition bitmap records. Records are
/// built lazily by scanning the bitmap on first access to a partition, no cursor is ever persisted.
///
/// There is no internal locking. All calls for a partition have to be serialized by the caller.
pub struct Storage<T: Platform> {
    pub(crate) hal: T,
    pub(crate) chip: ChipConfig,

    // set after a successful init or format
    pub(crate) partitions: Option<Vec<PartitionInfo>>,
    pub(crate) records: BTreeMap<PartitionId, BitmapRecord>,
}

impl<T: Platform> Storage<T> {
    /// Wraps the driver without touching the flash. Call `init` to load an existing layout or
    /// `format` to create one.
    pub fn new(hal: T) -> Result<Storage<T>, Error> {
        if T::ERASE_SIZE != BLOCK_SIZE {
            return Err(Error::InvalidGeometry);
        }

        // bitmap words are programmed one at a time
        if !BITMAP_WORD_SIZE.is_multiple_of(T::WRITE_SIZE) {
            return Err(Error::InvalidGeometry);
        }

        let capacity = hal.capacity();
        if capacity == 0 || !capacity.is_multiple_of(BLOCK_SIZE) {
            return Err(Error::InvalidGeometry);
        }

        let total_blocks = capacity / BLOCK_SIZE;
        if total_blocks > u32::MAX as usize / BLOCK_SIZE {
            return Err(Error::InvalidGeometry);
        }

        Ok(Self {
            hal,
            chip: ChipConfig {
                block_size: BLOCK_SIZE,
                page_size: PAGE_SIZE,
                pages_per_block: PAGES_PER_BLOCK,
                total_blocks: total_blocks as u32,
            },
            partitions: None,
            records: BTreeMap::new(),
        })
    }

    pub fn chip_config(&self) -> ChipConfig {
        self.chip
    }

    /// Returns the driver, dropping all cached state.
    pub fn release(self) -> T {
        self.hal
    }

    /// Reads the layout header and the partition table. Fails with `NotInitialized` if the
    /// magic doesn't match.
    pub fn init(&mut self) -> Result<(), Error> {
        self.load_layout()
    }

    /// Writes a new layout: a bitmap partition sized for the whole chip, the requested partitions
    /// in order and a trailing `Data` partition with all remaining blocks. Requests for `Bitmap` or
    /// `Data` are ignored.
    ///
    /// Erases the layout block and the bitmap, data blocks are left as they are.
    pub fn format(&mut self, partitions: &[PartitionRequest], force: bool) -> Result<(), Error> {
        self.format_layout(partitions, force)
    }

    pub fn partition_info(&self, id: PartitionId) -> Result<PartitionInfo, Error> {
        self.get_partition_info(id)
    }

    pub fn partitions(&self) -> Result<&[PartitionInfo], Error> {
        self.partitions.as_deref().ok_or(Error::NotInitialized)
    }

    /// Total number of pages of the partition.
    pub fn page_count(&self, id: PartitionId) -> Result<u32, Error> {
        let info = self.get_partition_info(id)?;
        Ok(info.block_count * PAGES_PER_BLOCK as u32)
    }

    /// Flash address range of the bitmap words describing the partition.
    pub fn bitmap_range(&self, id: PartitionId) -> Result<Range<u32>, Error> {
        self.get_partition_bitmap_range(id)
    }

    /// Flash address of the page at `cursor` or `None` if the cursor is outside of the partition.
    pub fn physical_address(&mut self, id: PartitionId, cursor: Cursor) -> Result<Option<u32>, Error> {
        self.calc_physical_address(id, cursor)
    }

    /// Appends `data` page by page at the write cursor, verifying every page after programming it.
    ///
    /// Fails upfront with `NotEnoughSpace` if the partition doesn't have enough free pages. Errors
    /// after the first page carry the number of bytes which were written and marked as used.
    pub fn append(&mut self, id: PartitionId, data: &[u8]) -> Result<usize, PartialWrite> {
        self.append_data(id, data)
    }

    /// Reads up to `buf.len()` bytes of not yet invalidated data, oldest first. Returns less than
    /// requested if no more data is available, which is not an error.
    pub fn read(
        &mut self,
        id: PartitionId,
        buf: &mut [u8],
        range: &mut PageRange,
    ) -> Result<usize, Error> {
        self.read_data(id, buf, range)
    }

    /// Marks every page delivered through `range` as dirty and moves the read cursor past them.
    /// A partially read last page stays used. Returns the number of pages marked.
    pub fn mark_dirty(&mut self, id: PartitionId, range: &mut PageRange) -> Result<usize, Error> {
        self.mark_dirty_range(id, range)
    }

    pub fn statistics(&mut self, id: PartitionId) -> Result<PageStatistics, Error> {
        let record = self.get_partition_record(id)?;
        Ok(record.statistics())
    }

    /// Counts the free pages of the partition by scanning its bitmap.
    pub fn free_page_count(&mut self, id: PartitionId) -> Result<u32, Error> {
        self.count_free_pages(id)
    }

    pub fn read_cursor(&mut self, id: PartitionId) -> Result<Cursor, Error> {
        Ok(self.get_partition_record(id)?.read)
    }

    /// `None` if the partition has no free page left.
    pub fn write_cursor(&mut self, id: PartitionId) -> Result<Option<Cursor>, Error> {
        Ok(self.get_partition_record(id)?.write)
    }

    /// Takes a free page out of service.
    pub fn mark_bad(&mut self, id: PartitionId, cursor: Cursor) -> Result<(), Error> {
        self.mark_page_bad(id, cursor)
    }

    /// Erases every block of the partition which only holds dirty or bad pages and returns the
    /// number of blocks reclaimed.
    ///
    /// Resetting the bitmap words requires erasing and rewriting the bitmap block holding them.
    /// A power loss in that window loses the bitmap state of every partition sharing the block.
    pub fn reclaim(&mut self, id: PartitionId) -> Result<u32, Error> {
        self.reclaim_blocks(id)
    }
}
