//! The protocol engine of a paravirtual display device.
//!
//! Drawing commands are built in memory shared with the device, handed to it
//! over producer/consumer rings, and freed when the device hands them back.
//! The pieces, bottom up:
//!
//! ### [`ShmRegion`](shm::ShmRegion)
//!
//! A view of memory the device can also read and write. All access is by
//! offset, through raw pointers.
//!
//! ### [`MemoryPool`](pool::MemoryPool)
//!
//! A first-fit allocator over one fixed range of device memory, keeping its
//! free list ([`BlockList`](blocklist::BlockList)) out of the device's reach.
//! Allocations are [`Block`](pool::Block) handles with single ownership.
//!
//! ### [`Ring`](ring::Ring)
//!
//! A fixed-capacity FIFO over a shared header and slot array.
//!
//! ### [`ImageCache`](image::ImageCache)
//!
//! Reference-counted, content-addressed de-duplication of uploaded bitmaps.
//!
//! ### [`collect`](release::collect)
//!
//! Drains the release ring and frees every record the device is done with.
//!
//! ### [`Session`](session::Session)
//!
//! Owns all of the above for one device, builds drawing and cursor commands,
//! and recovers from memory exhaustion by cooperating with the device.
//!
//! Logging goes through the [`log`](https://docs.rs/log) facade; the host
//! picks the logger.

pub mod blocklist;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod layout;
pub mod pool;
pub mod release;
pub mod ring;
pub mod session;
pub mod shm;

pub use config::SessionConfig;
pub use device::{DeviceIo, IoCommand, PortIo, RingId, Rom};
pub use error::{Error, ImageError, PoolError, Result, RingError, ShmError};
pub use image::{ImageCache, ImageRef, PixelSource};
pub use layout::Rect;
pub use pool::{Block, MemoryPool};
pub use release::{InFlight, ReleaseId, Submitted};
pub use ring::Ring;
pub use session::{CursorImage, LockedSession, Session};
pub use shm::{AddressMap, ShmRegion};
