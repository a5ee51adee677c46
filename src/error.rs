use thiserror::Error;

pub use crate::raw::PageState;

/// Errors that can occur during storage operations. Marked as non-exhaustive to allow for future
/// additions without breaking the API. A caller would mostly handle NotFound and NotEnoughSpace,
/// everything else points at a broken layout or a broken chip.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The internal error value is returned from the provided `impl NorFlash`, a write could not be
    /// verified or the bitmap holds a page state transition that NOR flash can't produce.
    #[error("media error")]
    MediaError,

    /// The layout header at offset 0 does not carry the expected magic or its partition table is
    /// malformed. Call `format` first.
    #[error("storage not initialized")]
    NotInitialized,

    /// Out of range bitmap address or element, a malformed read token or an unusable partition request.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The partition is not part of the layout or a bitmap scan came up empty. The latter means
    /// "partition full" for writes and "nothing left to read" for reads.
    #[error("not found")]
    NotFound,

    /// The data passed to `append` exceeds the free space left in the partition.
    #[error("not enough space")]
    NotEnoughSpace,

    /// `format` was called on a chip which already holds a valid layout without forcing it.
    #[error("layout already valid")]
    AlreadyValid,

    /// Erase size has to be 4k and the capacity a non-zero multiple of it.
    #[error("unsupported flash geometry")]
    InvalidGeometry,
}

/// An append that stopped after some pages were already programmed and marked as used. Those bytes
/// stay durable and readable, the caller decides whether to retry the remainder.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("{error} after writing {written} bytes")]
pub struct PartialWrite {
    pub error: Error,
    pub written: usize,
}

impl From<Error> for PartialWrite {
    fn from(error: Error) -> Self {
        Self { error, written: 0 }
    }
}

impl From<PartialWrite> for Error {
    fn from(val: PartialWrite) -> Self {
        val.error
    }
}
