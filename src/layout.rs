use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    BLOCK_SIZE, LAYOUT_HEADER_SIZE, LayoutHeader, LayoutHeaderRaw, MAX_PARTITIONS,
    PARTITION_DESCRIPTOR_SIZE, PAGES_PER_BLOCK, PartitionDescriptor, PartitionDescriptorRaw,
    SLOTS_PER_BYTE, read_aligned, write_aligned,
};
use crate::{PartitionId, PartitionInfo, PartitionRequest, Storage};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
#[cfg(feature = "defmt")]
use defmt::{debug, trace, warn};

/// Block 0 is reserved for the layout header and the partition table.
const LAYOUT_BLOCKS: u32 = 1;

/// Number of blocks needed to hold two bits for every page of the chip.
pub(crate) const fn bitmap_block_count(total_blocks: u32) -> u32 {
    let total_pages = total_blocks as usize * PAGES_PER_BLOCK;
    let bitmap_bytes = total_pages.div_ceil(SLOTS_PER_BYTE);
    bitmap_bytes.div_ceil(BLOCK_SIZE) as u32
}

impl<T: Platform> Storage<T> {
    fn read_header(&mut self) -> Result<LayoutHeader, Error> {
        let mut raw = [0u8; LAYOUT_HEADER_SIZE];
        read_aligned(&mut self.hal, 0, &mut raw).map_err(|_| Error::MediaError)?;

        // Safety: every bit pattern is a valid header, validity is checked by the magic
        Ok(unsafe { LayoutHeaderRaw { raw }.header })
    }

    pub(crate) fn load_layout(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load_layout");

        #[cfg(feature = "debug-logs")]
        println!("layout: load_layout");

        self.partitions = None;
        self.records.clear();

        let header = self.read_header()?;
        if !header.is_valid() {
            return Err(Error::NotInitialized);
        }

        let partition_count = header.partition_count as usize;
        if partition_count == 0 || partition_count > MAX_PARTITIONS {
            return Err(Error::NotInitialized);
        }

        #[cfg(feature = "defmt")]
        debug!("number of flash partitions: {}", partition_count);

        let mut raw = vec![0u8; partition_count * PARTITION_DESCRIPTOR_SIZE];
        read_aligned(&mut self.hal, LAYOUT_HEADER_SIZE as u32, &mut raw)
            .map_err(|_| Error::MediaError)?;

        let mut partitions = Vec::with_capacity(partition_count);
        for chunk in raw.chunks_exact(PARTITION_DESCRIPTOR_SIZE) {
            let mut bytes = [0u8; PARTITION_DESCRIPTOR_SIZE];
            bytes.copy_from_slice(chunk);
            // Safety: plain integers, the id is converted with a check below
            let descriptor = unsafe { PartitionDescriptorRaw { raw: bytes }.descriptor };

            let id = PartitionId::from_repr(descriptor.id).ok_or(Error::NotInitialized)?;
            let info = PartitionInfo {
                id,
                block_offset: descriptor.block_offset,
                block_count: descriptor.block_count,
            };

            #[cfg(feature = "defmt")]
            debug!("partition {}: {}", partitions.len(), info);

            #[cfg(feature = "debug-logs")]
            println!("layout: partition #{}: {:?}", partitions.len(), info);

            partitions.push(info);
        }

        self.validate_partitions(&partitions)?;
        self.partitions = Some(partitions);

        Ok(())
    }

    /// A table we didn't write ourselves is treated like a missing one.
    fn validate_partitions(&self, partitions: &[PartitionInfo]) -> Result<(), Error> {
        match partitions.first() {
            Some(bitmap) if bitmap.id == PartitionId::Bitmap => {}
            _ => return Err(Error::NotInitialized),
        }

        let mut expected_offset = LAYOUT_BLOCKS;
        for (index, info) in partitions.iter().enumerate() {
            if info.block_offset != expected_offset || info.block_count == 0 {
                return Err(Error::NotInitialized);
            }
            if partitions[..index].iter().any(|other| other.id == info.id) {
                return Err(Error::NotInitialized);
            }
            expected_offset = expected_offset
                .checked_add(info.block_count)
                .ok_or(Error::NotInitialized)?;
        }

        if expected_offset > self.chip.total_blocks {
            return Err(Error::NotInitialized);
        }

        Ok(())
    }

    pub(crate) fn format_layout(
        &mut self,
        requests: &[PartitionRequest],
        force: bool,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("format_layout: {} partitions, force: {}", requests.len(), force);

        #[cfg(feature = "debug-logs")]
        println!("layout: format_layout: {requests:?}, force: {force}");

        // don't nuke an existing layout unless told to
        if !force && self.read_header()?.is_valid() {
            return Err(Error::AlreadyValid);
        }

        if self.hal.in_secure_mode() {
            #[cfg(feature = "defmt")]
            warn!("flash still in secure mode");

            self.hal.exit_secure_mode();
        }

        let partitions = self.plan_partitions(requests)?;

        self.partitions = None;
        self.records.clear();

        let bitmap = &partitions[0];
        self.erase_blocks(0..bitmap.block_offset + bitmap.block_count)?;

        let mut raw =
            Vec::with_capacity(LAYOUT_HEADER_SIZE + partitions.len() * PARTITION_DESCRIPTOR_SIZE);
        let header = LayoutHeaderRaw {
            header: LayoutHeader::new(partitions.len() as u32),
        };
        raw.extend_from_slice(unsafe { &header.raw });
        for info in &partitions {
            let descriptor = PartitionDescriptorRaw {
                descriptor: PartitionDescriptor {
                    id: info.id as u32,
                    block_offset: info.block_offset,
                    block_count: info.block_count,
                },
            };
            raw.extend_from_slice(unsafe { &descriptor.raw });
        }

        write_aligned(&mut self.hal, 0, &raw).map_err(|_| Error::MediaError)?;
        self.hal.wait_completion();

        self.partitions = Some(partitions);

        Ok(())
    }

    fn plan_partitions(&self, requests: &[PartitionRequest]) -> Result<Vec<PartitionInfo>, Error> {
        let total_blocks = self.chip.total_blocks;
        let bitmap_blocks = bitmap_block_count(total_blocks);

        let mut partitions = Vec::with_capacity(MAX_PARTITIONS);
        partitions.push(PartitionInfo {
            id: PartitionId::Bitmap,
            block_offset: LAYOUT_BLOCKS,
            block_count: bitmap_blocks,
        });
        let mut blocks_used = LAYOUT_BLOCKS + bitmap_blocks;

        for request in requests
            .iter()
            .filter(|request| !matches!(request.id, PartitionId::Bitmap | PartitionId::Data))
        {
            // one slot is kept for the trailing data partition
            if request.block_count == 0 || partitions.len() + 1 >= MAX_PARTITIONS {
                return Err(Error::InvalidParameter);
            }
            if partitions.iter().any(|info| info.id == request.id) {
                return Err(Error::InvalidParameter);
            }

            partitions.push(PartitionInfo {
                id: request.id,
                block_offset: blocks_used,
                block_count: request.block_count,
            });
            blocks_used = blocks_used
                .checked_add(request.block_count)
                .ok_or(Error::InvalidParameter)?;
        }

        if blocks_used >= total_blocks {
            return Err(Error::InvalidParameter);
        }

        partitions.push(PartitionInfo {
            id: PartitionId::Data,
            block_offset: blocks_used,
            block_count: total_blocks - blocks_used,
        });

        Ok(partitions)
    }

    pub(crate) fn erase_blocks(&mut self, blocks: Range<u32>) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_blocks: {}..{}", blocks.start, blocks.end);

        for block in blocks {
            let from = block * BLOCK_SIZE as u32;
            self.hal
                .erase(from, from + BLOCK_SIZE as u32)
                .map_err(|_| Error::MediaError)?;
            self.hal.wait_completion();
        }

        Ok(())
    }

    pub(crate) fn get_partition_info(&self, id: PartitionId) -> Result<PartitionInfo, Error> {
        let partitions = self.partitions.as_ref().ok_or(Error::NotInitialized)?;

        // linear search, there are at most MAX_PARTITIONS entries
        partitions
            .iter()
            .find(|info| info.id == id)
            .copied()
            .ok_or(Error::NotFound)
    }
}
