//! Memory shared with the device.
//!
//! A [`ShmRegion`] is a cheaply clonable view of one contiguous byte range
//! that the device can read and write behind our back. Every access goes
//! through a raw pointer; no Rust reference into the region is ever handed
//! out, since the peer may change any byte at any time.
//!
//! Record fields are read and written unaligned and little-endian, the way the
//! device lays them out. Ring indices, the only words both sides race on, use
//! [`load_u32`](ShmRegion::load_u32) / [`store_u32`](ShmRegion::store_u32),
//! which are atomic and require 4-byte alignment.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, ShmError};

enum Backing {
    // Heap memory we allocated ourselves, stored as u64s for alignment.
    Owned { words: usize },
    // Memory somebody else keeps alive, e.g. a BAR mapped by the host glue.
    Borrowed,
    #[cfg(feature = "use_libc")]
    Mapped,
}

struct Mapping {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        match self.backing {
            Backing::Owned { words } => unsafe {
                let slice = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr() as *mut u64, words);
                drop(Box::from_raw(slice));
            },
            Backing::Borrowed => {}
            #[cfg(feature = "use_libc")]
            Backing::Mapped => unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            },
        }
    }
}

// The mapping is shared with a device that ignores Rust's aliasing rules
// anyway; all access is through raw pointers with explicit orderings.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[derive(Clone)]
pub struct ShmRegion {
    inner: Arc<Mapping>,
}

impl core::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("base", &self.inner.base)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl ShmRegion {
    /// Allocate a zeroed, 8-byte aligned region on the heap.
    ///
    /// This is what tests and in-process device models use in place of a
    /// real BAR mapping.
    pub fn new(len: usize) -> ShmRegion {
        let words = (len + 7) / 8;
        let boxed: Box<[u64]> = vec![0u64; words.max(1)].into_boxed_slice();
        let words = boxed.len();
        let raw = Box::into_raw(boxed) as *mut u64 as *mut u8;
        let base = NonNull::new(raw).unwrap_or(NonNull::dangling());
        ShmRegion {
            inner: Arc::new(Mapping {
                base,
                len,
                backing: Backing::Owned { words },
            }),
        }
    }

    /// Wrap memory that is already mapped.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// any clone of the returned region exists, and must not be accessed
    /// through Rust references elsewhere.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> ShmRegion {
        ShmRegion {
            inner: Arc::new(Mapping {
                base: ptr,
                len,
                backing: Backing::Borrowed,
            }),
        }
    }

    /// Map a file shared with the device, such as a PCI resource file
    /// (`/sys/bus/pci/devices/.../resource0`) or a `/dev/shm` segment.
    #[cfg(feature = "use_libc")]
    pub fn map_file(path: &std::path::Path) -> Result<ShmRegion, crate::error::MapError> {
        use crate::error::MapError;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let page_size = sysconf::page::pagesize();
        if len == 0 || len % page_size != 0 {
            return Err(MapError::Unaligned { len, page_size });
        }

        let ptr = unsafe {
            libc::mmap(
                // We don't care where the mapping lands.
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                // MAP_SHARED: the whole point is that the device sees our writes.
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MapError::Mmap(errno::errno()));
        }

        // The mapping outlives the file descriptor.
        let base = NonNull::new(ptr as *mut u8).ok_or(MapError::Mmap(errno::errno()))?;
        log::info!("mapped {} bytes of {} at {:?}", len, path.display(), base);
        Ok(ShmRegion {
            inner: Arc::new(Mapping {
                base,
                len,
                backing: Backing::Mapped,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Check that `len` bytes at `offset` are inside the region.
    pub fn check(&self, offset: usize, len: usize) -> Result<(), ShmError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.inner.len => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.inner.len,
            }),
        }
    }

    fn ptr(&self, offset: usize, len: usize) -> Result<*mut u8, ShmError> {
        self.check(offset, len)?;
        Ok(unsafe { self.inner.base.as_ptr().add(offset) })
    }

    fn atomic(&self, offset: usize) -> Result<&AtomicU32, ShmError> {
        let ptr = self.ptr(offset, 4)?;
        if (ptr as usize) % core::mem::align_of::<AtomicU32>() != 0 {
            return Err(ShmError::Misaligned { offset });
        }
        // AtomicU32 has the same layout as u32, and the pointer is in bounds
        // and aligned for as long as `self` lives.
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    pub fn load_u32(&self, offset: usize, order: Ordering) -> Result<u32, ShmError> {
        Ok(self.atomic(offset)?.load(order))
    }

    pub fn store_u32(&self, offset: usize, value: u32, order: Ordering) -> Result<(), ShmError> {
        self.atomic(offset)?.store(value, order);
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError> {
        let src = self.ptr(offset, out.len())?;
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        let dst = self.ptr(offset, data.len())?;
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&self, offset: usize, len: usize) -> Result<(), ShmError> {
        let dst = self.ptr(offset, len)?;
        unsafe { core::ptr::write_bytes(dst, 0, len) };
        Ok(())
    }

    /// Compare the bytes at `offset` against `expected`, a few at a time
    /// through a stack buffer.
    pub fn bytes_eq(&self, offset: usize, expected: &[u8]) -> Result<bool, ShmError> {
        self.check(offset, expected.len())?;
        let mut buf = [0u8; 64];
        let mut at = offset;
        for want in expected.chunks(buf.len()) {
            let found = &mut buf[..want.len()];
            self.read_bytes(at, found)?;
            if found != want {
                return Ok(false);
            }
            at += want.len();
        }
        Ok(true)
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, ShmError> {
        let mut buf = [0u8; 1];
        self.read_bytes(offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16, ShmError> {
        let mut buf = [0u8; 2];
        self.read_bytes(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, ShmError> {
        let mut buf = [0u8; 4];
        self.read_bytes(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, ShmError> {
        let mut buf = [0u8; 8];
        self.read_bytes(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u8(&self, offset: usize, value: u8) -> Result<(), ShmError> {
        self.write_bytes(offset, &[value])
    }

    pub fn write_u16(&self, offset: usize, value: u16) -> Result<(), ShmError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), ShmError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<(), ShmError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }
}

/// Translation between offsets into device RAM and the 64-bit addresses the
/// device uses to refer to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMap {
    physical_base: u64,
    len: usize,
}

impl AddressMap {
    pub fn new(physical_base: u64, len: usize) -> AddressMap {
        AddressMap { physical_base, len }
    }

    pub fn physical_base(&self) -> u64 {
        self.physical_base
    }

    pub fn to_device(&self, offset: usize) -> u64 {
        self.physical_base + offset as u64
    }

    pub fn to_offset(&self, address: u64) -> Result<usize, Error> {
        match address.checked_sub(self.physical_base) {
            Some(offset) if offset < self.len as u64 => Ok(offset as usize),
            _ => Err(Error::BadAddress { address }),
        }
    }
}
