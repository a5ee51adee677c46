#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use core::ops::Range;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

pub const FLASH_BLOCK_SIZE: usize = 4096;
// Taken from https://github.com/esp-rs/esp-hal/blob/main/esp-storage/src/stub.rs
pub const WORD_SIZE: usize = 4;
pub const PAGE_SIZE: usize = 256;

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Bytes written into this range end up as zero, as if the cells were worn out.
    pub corrupt_range: Option<Range<u32>>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(blocks: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_BLOCK_SIZE * blocks],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(blocks: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_BLOCK_SIZE * blocks],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn erased_blocks(&self) -> Vec<u32> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Erase { offset, .. } => Some(offset / FLASH_BLOCK_SIZE as u32),
                _ => None,
            })
            .collect()
    }

    pub fn bitmap_word(&self, ptr: u32) -> u32 {
        let ptr = ptr as usize;
        u32::from_le_bytes([
            self.buf[ptr],
            self.buf[ptr + 1],
            self.buf[ptr + 2],
            self.buf[ptr + 3],
        ])
    }

    /// Pokes a bitmap word directly, bypassing the NOR programming rules.
    pub fn set_bitmap_word(&mut self, ptr: u32, word: u32) {
        let ptr = ptr as usize;
        self.buf[ptr..ptr + 4].copy_from_slice(&word.to_le_bytes());
    }

    pub fn page(&self, address: u32) -> &[u8] {
        let address = address as usize;
        &self.buf[address..address + PAGE_SIZE]
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }
}

/// Packs 16 page states into a bitmap word, index 0 is the first page of the block.
pub fn word(states: [u32; 16]) -> u32 {
    states
        .iter()
        .enumerate()
        .fold(0, |word, (element, &bits)| word | (bits << (element * 2)))
}

pub const F: u32 = 0b11;
pub const U: u32 = 0b10;
pub const D: u32 = 0b00;
pub const B: u32 = 0b01;

pub const ALL_FREE: u32 = u32::MAX;
pub const ALL_USED: u32 = 0xAAAA_AAAA;
pub const ALL_DIRTY: u32 = 0;

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        println!(
            "    flash: read:  0x{offset:05X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_BLOCK_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:05X} - {to:05X} #{:>2}",
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));

        println!(
            "    flash: write: 0x{offset:05X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        assert!(!bytes.is_empty());

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        for (i, &val) in bytes.iter().enumerate() {
            let addr = offset as usize + i;
            let corrupt = self
                .corrupt_range
                .as_ref()
                .is_some_and(|range| range.contains(&(addr as u32)));

            // NOR flash can only flip bits from 1 to 0
            self.buf[addr] &= if corrupt { 0 } else { val };
        }
        Ok(())
    }
}

impl norlog::platform::Platform for Flash {}
