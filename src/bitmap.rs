use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    BITMAP_WORD_SIZE, BLOCK_SIZE, BitmapWord, PAGE_SIZE, PAGES_PER_BLOCK, PageState, read_aligned,
    write_aligned,
};
use crate::{Cursor, PageStatistics, PartitionId, Storage};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::{debug, trace};

/// Cached bitmap state of one partition, rebuilt by scanning the bitmap after every restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BitmapRecord {
    pub(crate) id: PartitionId,
    pub(crate) bitmap_start: u32,
    pub(crate) bitmap_end: u32,
    /// Oldest used page not yet handed out by a fresh read.
    pub(crate) read: Cursor,
    /// Next free page, `None` once the partition is full.
    pub(crate) write: Option<Cursor>,
    /// Indexed by the raw `PageState` value.
    pub(crate) page_stats: [u32; 4],
    pub(crate) min_free_bytes: u32,
}

impl BitmapRecord {
    pub(crate) fn range(&self) -> Range<u32> {
        self.bitmap_start..self.bitmap_end
    }

    pub(crate) fn contains(&self, cursor: Cursor) -> bool {
        cursor.ptr >= self.bitmap_start
            && cursor.ptr < self.bitmap_end
            && (cursor.ptr - self.bitmap_start).is_multiple_of(BITMAP_WORD_SIZE as u32)
            && (cursor.element as usize) < PAGES_PER_BLOCK
    }

    pub(crate) fn statistics(&self) -> PageStatistics {
        PageStatistics {
            free: self.page_stats[PageState::Free as usize],
            used: self.page_stats[PageState::Used as usize],
            dirty: self.page_stats[PageState::Dirty as usize],
            bad: self.page_stats[PageState::Bad as usize],
            min_free_bytes: self.min_free_bytes,
        }
    }
}

/// Page states of a whole partition, addressed by slot index (`word * 16 + element`).
pub(crate) struct Slots<'a> {
    words: &'a [BitmapWord],
}

impl<'a> Slots<'a> {
    pub(crate) fn new(words: &'a [BitmapWord]) -> Self {
        Self { words }
    }

    fn len(&self) -> usize {
        self.words.len() * PAGES_PER_BLOCK
    }

    fn get(&self, slot: usize) -> PageState {
        self.words[slot / PAGES_PER_BLOCK].get((slot % PAGES_PER_BLOCK) as u8)
    }

    fn iter(&self) -> impl Iterator<Item = PageState> + '_ {
        self.words.iter().flat_map(|word| word.states())
    }

    fn position_from(&self, from: usize, state: PageState) -> Option<usize> {
        (from..self.len()).find(|&slot| self.get(slot) == state)
    }

    fn rposition(&self, predicate: impl Fn(PageState) -> bool) -> Option<usize> {
        (0..self.len()).rev().find(|&slot| predicate(self.get(slot)))
    }
}

/// How the live data is laid out in a partition. Writing and invalidating both move forward and
/// wrap at the end, so the slots always form a rotation of `dirty* used* free*`, with bad pages
/// sprinkled anywhere.
///
/// ```text
/// UsedPrefixFreeSuffix  |xxxxxxxxxxxxxxxxxxxFFFFFFFFFFFFFFFFFF|
/// UsedPrefixMixedTail   |xxxxxxxxxxxxxxxxxxxFFFFFFFFFFFFFFFFxx|
/// FreePrefixUsedMiddle  |FFFFFFFFFFFFFFFFxxxxxxxxxxxxxxxFFFFFF|
/// AllFree               |FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF|
/// ```
///
/// `x` is a used page, `F` any page without live data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Topology {
    UsedPrefixFreeSuffix,
    /// The data wrapped around, its oldest part is the used run ending the partition.
    UsedPrefixMixedTail { tail_start: usize },
    FreePrefixUsedMiddle { first_used: usize },
    /// No used page at all, dirty pages may still be around.
    AllFree,
}

impl Topology {
    pub(crate) fn classify(slots: &Slots) -> Topology {
        let is_used = |state: PageState| state == PageState::Used;
        let Some(head) = (0..slots.len()).find(|&slot| slots.get(slot) != PageState::Bad) else {
            return Topology::AllFree;
        };
        let Some(first_used) = slots.position_from(head, PageState::Used) else {
            return Topology::AllFree;
        };

        if first_used != head {
            return Topology::FreePrefixUsedMiddle { first_used };
        }

        // head is used and there is at least one non-bad slot, so this can't miss
        let last = slots
            .rposition(|state| state != PageState::Bad)
            .unwrap_or(head);
        if !is_used(slots.get(last)) {
            return Topology::UsedPrefixFreeSuffix;
        }

        // walk back over the trailing run, stopping at the partition start
        let mut tail_start = last;
        while tail_start > 0 {
            match slots.get(tail_start - 1) {
                PageState::Used | PageState::Bad => tail_start -= 1,
                PageState::Free | PageState::Dirty => break,
            }
        }

        Topology::UsedPrefixMixedTail { tail_start }
    }

    /// Read and write slot for the classified layout.
    pub(crate) fn cursors(self, slots: &Slots) -> (usize, Option<usize>) {
        let first_free = slots.position_from(0, PageState::Free);
        match self {
            Topology::UsedPrefixFreeSuffix => {
                let read = slots.position_from(0, PageState::Used).unwrap_or(0);
                (read, first_free)
            }
            Topology::UsedPrefixMixedTail { tail_start } => {
                let read = slots
                    .position_from(tail_start, PageState::Used)
                    .unwrap_or(tail_start);
                (read, first_free)
            }
            Topology::FreePrefixUsedMiddle { first_used } => {
                let write = slots
                    .position_from(first_used, PageState::Free)
                    .or(first_free);
                (first_used, write)
            }
            Topology::AllFree => {
                // continue behind the last written page
                let write = slots
                    .rposition(|state| state != PageState::Free)
                    .and_then(|last| slots.position_from(last + 1, PageState::Free))
                    .or(first_free);
                (write.unwrap_or(0), write)
            }
        }
    }
}

pub(crate) enum UsedScan {
    Found(Cursor),
    /// A free or dirty page was hit before the next used one.
    RunEnded,
}

impl<T: Platform> Storage<T> {
    /// Bitmap address range of a partition. Bitmap words are laid out for every block following
    /// the bitmap partition, 4 bytes per block.
    pub(crate) fn get_partition_bitmap_range(&self, id: PartitionId) -> Result<Range<u32>, Error> {
        let info = self.get_partition_info(id)?;
        // the bitmap doesn't map itself
        if id == PartitionId::Bitmap {
            return Err(Error::InvalidParameter);
        }

        let bitmap = self.get_partition_info(PartitionId::Bitmap)?;

        let first_mapped_block = bitmap.block_offset + bitmap.block_count;
        let relative_block = info
            .block_offset
            .checked_sub(first_mapped_block)
            .ok_or(Error::InvalidParameter)?;

        let bitmap_base = bitmap.block_offset * BLOCK_SIZE as u32;
        let start = bitmap_base + relative_block * BITMAP_WORD_SIZE as u32;
        let end = start + info.block_count * BITMAP_WORD_SIZE as u32;

        Ok(start..end)
    }

    pub(crate) fn get_partition_record(&mut self, id: PartitionId) -> Result<BitmapRecord, Error> {
        if let Some(record) = self.records.get(&id) {
            return Ok(*record);
        }

        let record = self.load_partition_record(id)?;
        self.records.insert(id, record);
        Ok(record)
    }

    pub(crate) fn partition_record_mut(
        &mut self,
        id: PartitionId,
    ) -> Result<&mut BitmapRecord, Error> {
        self.get_partition_record(id)?;
        self.records.get_mut(&id).ok_or(Error::NotFound)
    }

    /// Reads the bitmap range of the partition once and recovers cursors and page statistics from it.
    fn load_partition_record(&mut self, id: PartitionId) -> Result<BitmapRecord, Error> {
        #[cfg(feature = "defmt")]
        trace!("load_partition_record: {}", id);

        let (bitmap_start, words) = self.read_bitmap_words(id)?;
        let bitmap_end = bitmap_start + (words.len() * BITMAP_WORD_SIZE) as u32;

        let slots = Slots::new(&words);
        let topology = Topology::classify(&slots);
        let (read, write) = topology.cursors(&slots);

        let mut page_stats = [0u32; 4];
        for state in slots.iter() {
            page_stats[state as usize] += 1;
        }

        let to_cursor = |slot: usize| {
            Cursor::new(
                bitmap_start + ((slot / PAGES_PER_BLOCK) * BITMAP_WORD_SIZE) as u32,
                (slot % PAGES_PER_BLOCK) as u8,
            )
        };

        let record = BitmapRecord {
            id,
            bitmap_start,
            bitmap_end,
            read: to_cursor(read),
            write: write.map(to_cursor),
            page_stats,
            min_free_bytes: PAGE_SIZE as u32 * page_stats[PageState::Free as usize],
        };

        #[cfg(feature = "defmt")]
        debug!(
            "partition {} ({}): read {}, write {}, stats {}",
            id, topology, record.read, record.write, record.page_stats
        );

        #[cfg(feature = "debug-logs")]
        println!("bitmap: load_partition_record: {topology:?}: {record:?}");

        Ok(record)
    }

    /// Start address and content of the partition's bitmap range.
    pub(crate) fn read_bitmap_words(&mut self, id: PartitionId) -> Result<(u32, Vec<BitmapWord>), Error> {
        let range = self.get_partition_bitmap_range(id)?;

        let mut raw = vec![0u8; (range.end - range.start) as usize];
        read_aligned(&mut self.hal, range.start, &mut raw).map_err(|_| Error::MediaError)?;

        let words = raw
            .chunks_exact(BITMAP_WORD_SIZE)
            .map(|chunk| BitmapWord::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok((range.start, words))
    }

    pub(crate) fn read_bitmap_word(&mut self, ptr: u32) -> Result<BitmapWord, Error> {
        let mut buf = [0u8; BITMAP_WORD_SIZE];
        read_aligned(&mut self.hal, ptr, &mut buf).map_err(|_| Error::MediaError)?;
        Ok(BitmapWord::from_le_bytes(buf))
    }

    pub(crate) fn get_page_state(&mut self, id: PartitionId, cursor: Cursor) -> Result<PageState, Error> {
        let record = self.get_partition_record(id)?;
        if !record.contains(cursor) {
            return Err(Error::InvalidParameter);
        }

        Ok(self.read_bitmap_word(cursor.ptr)?.get(cursor.element))
    }

    /// Programs the new state of a single page and keeps the statistics in sync. Only transitions
    /// NOR flash can do in place are accepted, anything else means the bitmap and our
    /// expectations diverged.
    pub(crate) fn update_page_state(
        &mut self,
        id: PartitionId,
        cursor: Cursor,
        state: PageState,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("update_page_state: {}: {} -> {}", id, cursor, state);

        let record = self.get_partition_record(id)?;
        if !record.contains(cursor) {
            return Err(Error::InvalidParameter);
        }

        let word = self.read_bitmap_word(cursor.ptr)?;
        let old_state = word.get(cursor.element);
        if !old_state.can_become(state) {
            #[cfg(feature = "debug-logs")]
            println!("bitmap: illegal transition {old_state} -> {state} @{cursor:?}");

            return Err(Error::MediaError);
        }

        let new_word = word.set(cursor.element, state);

        #[cfg(feature = "debug-logs")]
        println!("bitmap: update_page_state: {word:?} -> {new_word:?}");

        write_aligned(&mut self.hal, cursor.ptr, &new_word.to_le_bytes())
            .map_err(|_| Error::MediaError)?;
        self.hal.wait_completion();

        let record = self.partition_record_mut(id)?;
        debug_assert_eq!(record.id, id);
        record.page_stats[old_state as usize] -= 1;
        record.page_stats[state as usize] += 1;
        if old_state == PageState::Free {
            record.min_free_bytes -= PAGE_SIZE as u32;
        }

        Ok(())
    }

    /// First free page at or after `from`, not wrapping around.
    pub(crate) fn find_next_free(&mut self, from: Cursor, end: u32) -> Result<Cursor, Error> {
        let mut cursor = from;
        while cursor.ptr < end {
            let word = self.read_bitmap_word(cursor.ptr)?;
            if let Some(element) = word.position_from(cursor.element, PageState::Free) {
                return Ok(Cursor::new(cursor.ptr, element));
            }
            cursor = Cursor::new(cursor.ptr + BITMAP_WORD_SIZE as u32, 0);
        }

        Err(Error::NotFound)
    }

    /// First used page at or after `from`, skipping bad pages. With `abort_on_non_used` the scan
    /// gives up at the first free or dirty page as the run of data ended there.
    pub(crate) fn find_next_used(
        &mut self,
        from: Cursor,
        end: u32,
        abort_on_non_used: bool,
    ) -> Result<UsedScan, Error> {
        let mut cursor = from;
        while cursor.ptr < end {
            let word = self.read_bitmap_word(cursor.ptr)?;
            for element in cursor.element..PAGES_PER_BLOCK as u8 {
                match word.get(element) {
                    PageState::Used => return Ok(UsedScan::Found(Cursor::new(cursor.ptr, element))),
                    PageState::Bad => {}
                    PageState::Free | PageState::Dirty if abort_on_non_used => {
                        return Ok(UsedScan::RunEnded);
                    }
                    PageState::Free | PageState::Dirty => {}
                }
            }
            cursor = Cursor::new(cursor.ptr + BITMAP_WORD_SIZE as u32, 0);
        }

        Err(Error::NotFound)
    }

    /// Moves the write cursor to the next free page behind `from`, wrapping around to the start
    /// of the partition. Clears it and fails with `NotFound` if the partition is full.
    pub(crate) fn advance_write_cursor(&mut self, id: PartitionId, from: Cursor) -> Result<(), Error> {
        let record = self.get_partition_record(id)?;

        let next = match self.find_next_free(from.next(), record.bitmap_end) {
            Err(Error::NotFound) => {
                self.find_next_free(Cursor::new(record.bitmap_start, 0), record.bitmap_end)
            }
            other => other,
        };

        let record = self.partition_record_mut(id)?;
        match next {
            Ok(cursor) => {
                record.write = Some(cursor);
                Ok(())
            }
            Err(Error::NotFound) => {
                #[cfg(feature = "defmt")]
                debug!("partition {} is full", id);

                record.write = None;
                Err(Error::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// `None` if the cursor lies outside of the partition's bitmap range.
    pub(crate) fn calc_physical_address(
        &mut self,
        id: PartitionId,
        cursor: Cursor,
    ) -> Result<Option<u32>, Error> {
        let info = self.get_partition_info(id)?;
        let record = self.get_partition_record(id)?;

        if !record.contains(cursor) {
            return Ok(None);
        }

        let block = (cursor.ptr - record.bitmap_start) / BITMAP_WORD_SIZE as u32;
        Ok(Some(
            info.block_offset * BLOCK_SIZE as u32
                + block * BLOCK_SIZE as u32
                + cursor.element as u32 * PAGE_SIZE as u32,
        ))
    }
}
