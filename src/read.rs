use crate::bitmap::{BitmapRecord, UsedScan};
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{PAGE_SIZE, PageState, read_aligned};
use crate::{Cursor, PageRange, PartitionId, Storage};
use core::cmp;
#[cfg(feature = "defmt")]
use defmt::trace;

const LAST_BYTE_IN_PAGE: u8 = (PAGE_SIZE - 1) as u8;

impl<T: Platform> Storage<T> {
    pub(crate) fn read_data(
        &mut self,
        id: PartitionId,
        buf: &mut [u8],
        range: &mut PageRange,
    ) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("read_data: {}: [{}] {}", id, buf.len(), range);

        #[cfg(feature = "debug-logs")]
        println!("read: read_data: {id}: [{}] {range:?}", buf.len());

        self.get_partition_info(id)?;
        let record = self.get_partition_record(id)?;

        if range.valid && (!record.contains(range.start) || !record.contains(range.end)) {
            return Err(Error::InvalidParameter);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        if !range.valid {
            range.valid = true;
            range.start = record.read;
            range.end = record.read;
            range.last_byte_pos = None;
        }

        let (mut cursor, mut offset) = match range.last_byte_pos {
            // nothing delivered so far, the first page may be bad or not written yet
            None => {
                let found = self.next_readable(&record, range.start, range)?;
                // the run only starts here, a wrap while looking for it doesn't count
                range.wrapped = false;
                match found {
                    Some(cursor) => {
                        range.start = cursor;
                        range.end = cursor;
                        (cursor, 0)
                    }
                    None => return Ok(0),
                }
            }
            Some(LAST_BYTE_IN_PAGE) => {
                match self.next_readable(&record, range.end.next(), range)? {
                    Some(cursor) => (cursor, 0),
                    None => return Ok(0),
                }
            }
            Some(pos) => {
                // the page may have been reclaimed since the token was handed out
                if self.get_page_state(id, range.end)? != PageState::Used {
                    return Ok(0);
                }
                (range.end, pos as usize + 1)
            }
        };

        let mut bytes_read = 0;
        while bytes_read < buf.len() {
            let Some(address) = self.calc_physical_address(id, cursor)? else {
                break;
            };

            let to_read = cmp::min(buf.len() - bytes_read, PAGE_SIZE - offset);
            let target = &mut buf[bytes_read..bytes_read + to_read];
            if read_aligned(&mut self.hal, address + offset as u32, target).is_err() {
                // hand out what we have, the token still points behind the last good page
                if bytes_read > 0 {
                    break;
                }
                return Err(Error::MediaError);
            }

            bytes_read += to_read;
            range.end = cursor;
            range.last_byte_pos = Some((offset + to_read - 1) as u8);
            offset = 0;

            if bytes_read < buf.len() {
                match self.next_readable(&record, cursor.next(), range)? {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
        }

        #[cfg(feature = "debug-logs")]
        println!("read: read {bytes_read} bytes, token now {range:?}");

        Ok(bytes_read)
    }

    /// Next used page of the run starting at `range.start`, searching from `from`. Follows the run
    /// across the partition end once and stops in front of `range.start` after that.
    fn next_readable(
        &mut self,
        record: &BitmapRecord,
        from: Cursor,
        range: &mut PageRange,
    ) -> Result<Option<Cursor>, Error> {
        let mut from = from;
        loop {
            match self.find_next_used(from, record.bitmap_end, true) {
                Ok(UsedScan::Found(cursor)) => {
                    return Ok((!range.wrapped || cursor < range.start).then_some(cursor));
                }
                Ok(UsedScan::RunEnded) => return Ok(None),
                Err(Error::NotFound) if !range.wrapped => {
                    range.wrapped = true;
                    from = Cursor::new(record.bitmap_start, 0);
                }
                Err(Error::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn mark_dirty_range(
        &mut self,
        id: PartitionId,
        range: &mut PageRange,
    ) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("mark_dirty_range: {}: {}", id, range);

        #[cfg(feature = "debug-logs")]
        println!("read: mark_dirty_range: {id}: {range:?}");

        self.get_partition_info(id)?;
        if !range.valid {
            return Err(Error::InvalidParameter);
        }

        let record = self.get_partition_record(id)?;
        if !record.contains(range.start) || !record.contains(range.end) {
            return Err(Error::InvalidParameter);
        }

        let Some(last_byte_pos) = range.last_byte_pos else {
            return Ok(0);
        };
        let fully_read = last_byte_pos == LAST_BYTE_IN_PAGE;
        if range.start == range.end && !fully_read {
            // the only page touched was not read to its end
            return Ok(0);
        }

        // a partially read last page keeps its data
        let bitmap = record.range();
        let stop = if fully_read {
            range.end.next_wrapping(&bitmap)
        } else {
            range.end
        };

        let mut count = 0;
        let mut cursor = range.start;
        loop {
            // bad pages were skipped while reading
            if self.get_page_state(id, cursor)? != PageState::Bad {
                self.update_page_state(id, cursor, PageState::Dirty)?;
                count += 1;
            }

            cursor = cursor.next_wrapping(&bitmap);
            if cursor == stop {
                break;
            }
        }

        self.partition_record_mut(id)?.read = stop;
        range.reset();

        Ok(count)
    }
}
