use crate::platform::{AlignedOps, Platform};
use alloc::vec;
use core::fmt::{Debug, Formatter};
use core::mem::size_of;
#[cfg(feature = "defmt")]
use defmt::trace;

pub const BLOCK_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 256;
pub const PAGES_PER_BLOCK: usize = BLOCK_SIZE / PAGE_SIZE;
pub const MAX_PARTITIONS: usize = 8;

pub(crate) const PAGE_STATE_BITS: usize = 2;
pub(crate) const SLOTS_PER_BYTE: usize = 8 / PAGE_STATE_BITS;
/// One bitmap word covers the pages of exactly one block.
pub(crate) const BITMAP_WORD_SIZE: usize = PAGES_PER_BLOCK / SLOTS_PER_BYTE;

pub(crate) const LAYOUT_MAGIC: [u8; 8] = *b"NORLOG01";

const _: () = assert!(
    BITMAP_WORD_SIZE == size_of::<u32>(),
    "A bitmap word has to hold the states of one block"
);

const _: () = assert!(
    size_of::<LayoutHeader>() + MAX_PARTITIONS * size_of::<PartitionDescriptor>() <= BLOCK_SIZE,
    "The partition table has to fit into the layout block"
);

/// State of a single 256 byte page. Every legal transition only clears bits, so it can be
/// programmed in place. Getting back to `Free` requires a block erase.
///
/// ```text
/// Free (11) ──write──> Used (10) ──mark_dirty──> Dirty (00)
///     └──────────────> Bad (01)
/// ```
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PageState {
    Free = 0b11,
    Used = 0b10,
    Dirty = 0b00,
    Bad = 0b01,
}

impl PageState {
    pub(crate) fn from_bits(bits: u32) -> Self {
        // all four 2-bit patterns are assigned, the fallback is unreachable
        PageState::from_repr((bits & 0b11) as u8).unwrap_or(PageState::Bad)
    }

    /// Whether NOR flash can move a page from `self` to `next` without an erase and the
    /// transition is one we ever intend to make.
    pub(crate) fn can_become(self, next: PageState) -> bool {
        matches!(
            (self, next),
            (PageState::Free, PageState::Used)
                | (PageState::Free, PageState::Bad)
                | (PageState::Used, PageState::Dirty)
        )
    }
}

/// The 16 page states of one block, packed two bits per page. Stored little endian on flash,
/// page `n` of the block occupies bits `2n..2n+2`.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct BitmapWord(pub(crate) u32);

impl BitmapWord {
    pub(crate) const ALL_FREE: BitmapWord = BitmapWord(u32::MAX);

    pub(crate) fn from_le_bytes(bytes: [u8; BITMAP_WORD_SIZE]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    pub(crate) fn to_le_bytes(self) -> [u8; BITMAP_WORD_SIZE] {
        self.0.to_le_bytes()
    }

    pub(crate) fn get(self, element: u8) -> PageState {
        PageState::from_bits(self.0 >> (element as usize * PAGE_STATE_BITS))
    }

    pub(crate) fn set(self, element: u8, state: PageState) -> Self {
        let shift = element as usize * PAGE_STATE_BITS;
        let mask = 0b11u32 << shift;
        Self((self.0 & !mask) | ((state as u32) << shift))
    }

    /// First element at or after `from` which is in `state`.
    pub(crate) fn position_from(self, from: u8, state: PageState) -> Option<u8> {
        (from..PAGES_PER_BLOCK as u8).find(|&element| self.get(element) == state)
    }

    pub(crate) fn states(self) -> impl Iterator<Item = PageState> {
        (0..PAGES_PER_BLOCK as u8).map(move |element| self.get(element))
    }
}

impl Debug for BitmapWord {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("BitmapWord(0x{:0>8x})", self.0))
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct LayoutHeader {
    pub(crate) magic: [u8; 8],
    pub(crate) partition_count: u32,
}

pub(crate) union LayoutHeaderRaw {
    pub(crate) header: LayoutHeader,
    pub(crate) raw: [u8; size_of::<LayoutHeader>()],
}

impl LayoutHeader {
    pub(crate) fn new(partition_count: u32) -> Self {
        Self {
            magic: LAYOUT_MAGIC,
            partition_count,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic == LAYOUT_MAGIC
    }
}

impl Debug for LayoutHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let magic = self.magic;
        let partition_count = self.partition_count;
        f.write_fmt(format_args!(
            "LayoutHeader {{ magic: {magic:02x?}, partition_count: {partition_count} }}"
        ))
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct PartitionDescriptor {
    pub(crate) id: u32,
    pub(crate) block_offset: u32,
    pub(crate) block_count: u32,
}

pub(crate) union PartitionDescriptorRaw {
    pub(crate) descriptor: PartitionDescriptor,
    pub(crate) raw: [u8; size_of::<PartitionDescriptor>()],
}

pub(crate) const LAYOUT_HEADER_SIZE: usize = size_of::<LayoutHeader>();
pub(crate) const PARTITION_DESCRIPTOR_SIZE: usize = size_of::<PartitionDescriptor>();

#[inline(always)]
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        hal.write(offset, bytes)
    } else {
        let pivot = T::align_write_floor(bytes.len());
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(offset, header)?;
        }

        // no need to write the trailer if remaining data is all ones - this the default state of the flash
        if trailer.iter().any(|&e| e != 0xFF) {
            let mut buf = vec![0xFFu8; T::WRITE_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf)?
        }

        Ok(())
    }
}

/// Reads `bytes.len()` bytes from an arbitrary offset by fetching the surrounding window that
/// satisfies the driver's read alignment.
#[inline(always)]
pub(crate) fn read_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("read_aligned @{:#08x}: [{}]", offset, bytes.len());

    let start = T::align_read_floor(offset as usize);
    let end = T::align_read_ceil(offset as usize + bytes.len());
    if start == offset as usize && end == offset as usize + bytes.len() {
        return hal.read(offset, bytes);
    }

    let mut buf = vec![0u8; end - start];
    hal.read(start as u32, &mut buf)?;
    let skip = offset as usize - start;
    bytes.copy_from_slice(&buf[skip..skip + bytes.len()]);
    Ok(())
}
