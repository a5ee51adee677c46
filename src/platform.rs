use embedded_storage::nor_flash::NorFlash;

/// The flash driver. Reading, programming and erasing come from [`NorFlash`], the hooks below
/// cover what SPI NOR chips need on top of that. All of them default to no-ops which is correct
/// for drivers that only return once an operation has finished.
///
/// See README.md for an example implementation.
pub trait Platform: NorFlash {
    /// Blocks until the last program or erase operation has completed.
    fn wait_completion(&mut self) {}

    /// Whether the chip is still in its secure (OTP) access mode.
    fn in_secure_mode(&mut self) -> bool {
        false
    }

    fn exit_secure_mode(&mut self) {}
}

impl<T: Platform> Platform for &mut T {
    fn wait_completion(&mut self) {
        T::wait_completion(self)
    }

    fn in_secure_mode(&mut self) -> bool {
        T::in_secure_mode(self)
    }

    fn exit_secure_mode(&mut self) {
        T::exit_secure_mode(self)
    }
}

pub trait AlignedOps: Platform {
    fn align_read_floor(size: usize) -> usize {
        align_floor(size, Self::READ_SIZE)
    }

    fn align_read_ceil(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use esp_storage::FlashStorage;

    use crate::platform::Platform;

    // FlashStorage only returns once the SPI transaction has finished, the defaults are fine.
    impl Platform for FlashStorage<'_> {}
}
