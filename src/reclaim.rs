use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{BITMAP_WORD_SIZE, BLOCK_SIZE, BitmapWord, PageState, read_aligned, write_aligned};
use crate::{Cursor, PartitionId, Storage};
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{debug, trace, warn};

impl<T: Platform> Storage<T> {
    /// Counts from the bitmap itself instead of trusting the cached statistics.
    pub(crate) fn count_free_pages(&mut self, id: PartitionId) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("count_free_pages: {}", id);

        let (_, words) = self.read_bitmap_words(id)?;
        let free = words
            .iter()
            .flat_map(|word| word.states())
            .filter(|&state| state == PageState::Free)
            .count();

        Ok(free as u32)
    }

    pub(crate) fn mark_page_bad(&mut self, id: PartitionId, cursor: Cursor) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("mark_page_bad: {}: {}", id, cursor);

        #[cfg(feature = "debug-logs")]
        println!("reclaim: mark_page_bad: {id}: {cursor:?}");

        self.get_partition_info(id)?;
        self.update_page_state(id, cursor, PageState::Bad)?;

        let record = self.get_partition_record(id)?;
        if record.write == Some(cursor) {
            match self.advance_write_cursor(id, cursor) {
                // nothing left to write to, the write cursor is cleared
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub(crate) fn reclaim_blocks(&mut self, id: PartitionId) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("reclaim_blocks: {}", id);

        #[cfg(feature = "debug-logs")]
        println!("reclaim: reclaim_blocks: {id}");

        let info = self.get_partition_info(id)?;
        let (bitmap_start, words) = self.read_bitmap_words(id)?;

        // blocks of nothing but bad pages too, Bad only goes back to Free through an erase
        let reclaimable = words
            .iter()
            .enumerate()
            .filter(|(_, word)| {
                word.states()
                    .all(|state| matches!(state, PageState::Dirty | PageState::Bad))
            })
            .map(|(index, _)| index as u32)
            .collect::<Vec<_>>();

        if reclaimable.is_empty() {
            return Ok(0);
        }

        for &index in &reclaimable {
            self.erase_blocks(info.block_offset + index..info.block_offset + index + 1)?;
        }

        // bitmap words can only go back to free by erasing the bitmap block holding them
        let mut pending = reclaimable
            .iter()
            .map(|&index| bitmap_start + index * BITMAP_WORD_SIZE as u32)
            .peekable();
        while let Some(&ptr) = pending.peek() {
            let block = ptr / BLOCK_SIZE as u32;
            let block_start = block * BLOCK_SIZE as u32;

            let mut raw = vec![0u8; BLOCK_SIZE];
            read_aligned(&mut self.hal, block_start, &mut raw).map_err(|_| Error::MediaError)?;

            while let Some(ptr) = pending.next_if(|&ptr| ptr / BLOCK_SIZE as u32 == block) {
                let offset = (ptr - block_start) as usize;
                raw[offset..offset + BITMAP_WORD_SIZE]
                    .copy_from_slice(&BitmapWord::ALL_FREE.to_le_bytes());
            }

            #[cfg(feature = "defmt")]
            warn!("rewriting bitmap block {}", block);

            self.erase_blocks(block..block + 1)?;
            write_aligned(&mut self.hal, block_start, &raw).map_err(|_| Error::MediaError)?;
            self.hal.wait_completion();
        }

        // cursors and statistics are recovered from the new bitmap on next access
        self.records.remove(&id);

        #[cfg(feature = "defmt")]
        debug!("partition {}: reclaimed {} blocks", id, reclaimable.len());

        #[cfg(feature = "debug-logs")]
        println!("reclaim: reclaimed blocks {reclaimable:?}");

        Ok(reclaimable.len() as u32)
    }
}
