use crate::error::{Error, PartialWrite};
use crate::platform::Platform;
use crate::raw::{PAGE_SIZE, PageState, read_aligned, write_aligned};
use crate::{PartitionId, Storage};
use core::cmp;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

impl<T: Platform> Storage<T> {
    pub(crate) fn append_data(&mut self, id: PartitionId, data: &[u8]) -> Result<usize, PartialWrite> {
        #[cfg(feature = "defmt")]
        trace!("append_data: {}: [{}]", id, data.len());

        #[cfg(feature = "debug-logs")]
        println!("append: append_data: {id}: [{}]", data.len());

        if data.is_empty() {
            return Ok(0);
        }

        self.get_partition_info(id)?;
        let record = self.get_partition_record(id)?;

        if data.len() > record.min_free_bytes as usize {
            #[cfg(feature = "debug-logs")]
            println!(
                "append: not enough space for {} bytes, {} available",
                data.len(),
                record.min_free_bytes
            );

            return Err(Error::NotEnoughSpace.into());
        }

        let mut written = 0;
        let mut verify_buf = [0u8; PAGE_SIZE];

        while written < data.len() {
            let partial = move |error: Error| PartialWrite { error, written };

            let cursor = self
                .get_partition_record(id)
                .map_err(partial)?
                .write
                .ok_or(partial(Error::NotFound))?;
            let address = self
                .calc_physical_address(id, cursor)
                .map_err(partial)?
                .ok_or(partial(Error::NotFound))?;

            // A page the bitmap claims to be free but which holds data was programmed before a
            // power loss hit ahead of its bitmap update. It can't be written again.
            read_aligned(&mut self.hal, address, &mut verify_buf)
                .map_err(|_| partial(Error::MediaError))?;
            if verify_buf.iter().any(|&byte| byte != 0xFF) {
                #[cfg(feature = "defmt")]
                warn!("append: page @{:#08x} is not blank, marking as bad", address);

                #[cfg(feature = "debug-logs")]
                println!("append: page @{address:#08x} is not blank, marking as bad");

                self.update_page_state(id, cursor, PageState::Bad)
                    .map_err(partial)?;
                self.advance_write_cursor(id, cursor).map_err(partial)?;
                continue;
            }

            let chunk = &data[written..cmp::min(written + PAGE_SIZE, data.len())];

            #[cfg(feature = "debug-logs")]
            println!("append: writing {} bytes to {address:#08x}", chunk.len());

            write_aligned(&mut self.hal, address, chunk).map_err(|_| partial(Error::MediaError))?;
            self.hal.wait_completion();

            read_aligned(&mut self.hal, address, &mut verify_buf[..chunk.len()])
                .map_err(|_| partial(Error::MediaError))?;
            if verify_buf[..chunk.len()] != *chunk {
                #[cfg(feature = "defmt")]
                warn!("append: verification of page @{:#08x} failed", address);

                #[cfg(feature = "debug-logs")]
                println!("append: verification of page @{address:#08x} failed");

                return Err(partial(Error::MediaError));
            }

            self.update_page_state(id, cursor, PageState::Used)
                .map_err(partial)?;

            written += chunk.len();
            let partial = move |error: Error| PartialWrite { error, written };

            self.advance_write_cursor(id, cursor).map_err(partial)?;
        }

        Ok(written)
    }
}
