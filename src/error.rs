//! Error types for the device protocol engine.

use thiserror::Error;

/// An access into a [`ShmRegion`](crate::shm::ShmRegion) that the region
/// cannot satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShmError {
    #[error("{len} bytes at offset {offset:#x} fall outside a region of {size:#x} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("offset {offset:#x} is not aligned for an atomic access")]
    Misaligned { offset: usize },
}

/// Misuse of the [`MemoryPool`](crate::pool::MemoryPool).
///
/// Apart from `TooLarge`, these all mean the allocator discipline was broken
/// somewhere: a double free, a stale handle, or an identifier the peer made up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("block at offset {offset:#x} is not allocated")]
    NotAllocated { offset: usize },
    #[error("block at offset {offset:#x} was invalidated by a pool reset")]
    Stale { offset: usize },
    #[error("offset {offset:#x} is outside the pool")]
    OutOfRange { offset: usize },
    #[error("freed extent at {offset:#x} ({size} bytes) overlaps a free extent")]
    Overlap { offset: usize, size: usize },
    #[error("request of {size} bytes can never fit a pool of {capacity} bytes")]
    TooLarge { size: usize, capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring is full ({capacity} entries in flight)")]
    Full { capacity: u32 },
    #[error("ring capacity {capacity} is not a non-zero power of two")]
    BadCapacity { capacity: u32 },
    #[error("ring indices are inconsistent (producer {producer}, consumer {consumer})")]
    Corrupt { producer: u32, consumer: u32 },
    #[error("ring slot holds unknown command type {kind}")]
    UnknownCommand { kind: u32 },
    #[error(transparent)]
    Shm(#[from] ShmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("rectangle {width}x{height} at ({x}, {y}) is outside the pixel source")]
    OutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    },
    #[error("image of {width}x{height} at {bytes_per_pixel} bytes per pixel overflows")]
    Overflow {
        width: usize,
        height: usize,
        bytes_per_pixel: usize,
    },
    #[error("image at offset {offset:#x} is not known to the cache")]
    Unknown { offset: usize },
    #[error("{bytes_per_pixel} bytes per pixel is not a bitmap format the device takes")]
    UnsupportedFormat { bytes_per_pixel: usize },
    #[error("pixels have {found} bytes per pixel but the screen has {expected}")]
    FormatMismatch { found: usize, expected: usize },
}

#[cfg(feature = "use_libc")]
#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot open device memory: {0}")]
    Io(#[from] std::io::Error),
    #[error("mmap failed: {0}")]
    Mmap(errno::Errno),
    #[error("mapping of {len} bytes is not a whole number of {page_size}-byte pages")]
    Unaligned { len: usize, page_size: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("device address {address:#x} is outside shared memory")]
    BadAddress { address: u64 },
    #[error("protocol corruption: {0}")]
    Corruption(String),
    #[error("bad magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },
    #[error("out of device memory for {requested} bytes after {attempts} unproductive attempts")]
    OutOfMemory { requested: usize, attempts: u32 },
    #[cfg(feature = "use_libc")]
    #[error(transparent)]
    Map(#[from] MapError),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
