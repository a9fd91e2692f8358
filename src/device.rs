//! The two narrow channels to the device besides the rings: port writes that
//! poke it, and the ROM it describes itself in.

use core::sync::atomic::Ordering;

use log::trace;

use crate::error::{Error, Result};
use crate::layout::{rom, IoPort, Rect, LEGACY_MODE, ROM_MAGIC};
use crate::shm::ShmRegion;

/// The rings that carry work to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingId {
    Command,
    Cursor,
}

/// A fire-and-forget notification to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCommand {
    /// New entries on a ring.
    Notify(RingId),
    /// Redraw `Rect`; everything sent before may be dropped.
    UpdateArea(Rect),
    /// We are out of device memory; release whatever can be released.
    OutOfMemory,
    Reset,
    SetMode(u32),
}

impl IoCommand {
    pub fn port(&self) -> IoPort {
        match self {
            IoCommand::Notify(RingId::Command) => IoPort::NotifyCommand,
            IoCommand::Notify(RingId::Cursor) => IoPort::NotifyCursor,
            IoCommand::UpdateArea(_) => IoPort::UpdateArea,
            IoCommand::OutOfMemory => IoPort::NotifyOom,
            IoCommand::Reset => IoPort::Reset,
            IoCommand::SetMode(_) => IoPort::SetMode,
        }
    }
}

/// Something that can deliver [`IoCommand`]s to the device.
///
/// Only `send` is required; the `notify_*` helpers are what the session
/// calls.
pub trait DeviceIo {
    fn send(&mut self, command: IoCommand);

    fn notify_producer(&mut self, ring: RingId) {
        self.send(IoCommand::Notify(ring))
    }

    /// The rectangle has already been written to the RAM header by the time
    /// this is called.
    fn notify_update_area(&mut self, area: Rect) {
        self.send(IoCommand::UpdateArea(area))
    }

    fn notify_out_of_memory(&mut self) {
        self.send(IoCommand::OutOfMemory)
    }

    fn notify_reset(&mut self) {
        self.send(IoCommand::Reset)
    }

    fn notify_set_mode(&mut self, mode_id: u32) {
        self.send(IoCommand::SetMode(mode_id))
    }
}

impl<D: DeviceIo + ?Sized> DeviceIo for &mut D {
    fn send(&mut self, command: IoCommand) {
        (**self).send(command)
    }
}

/// Port-mapped I/O: each command is a byte written to `io_base` plus the
/// command's port. The write itself is left to a closure, since it needs
/// privileges only the host glue has.
pub struct PortIo<F> {
    io_base: u16,
    out: F,
}

impl<F: FnMut(u16, u8)> PortIo<F> {
    pub fn new(io_base: u16, out: F) -> PortIo<F> {
        PortIo { io_base, out }
    }
}

impl<F: FnMut(u16, u8)> DeviceIo for PortIo<F> {
    fn send(&mut self, command: IoCommand) {
        let port = self.io_base.wrapping_add(command.port() as u16);
        let value = match command {
            // The device only looks at the low byte of the mode id
            IoCommand::SetMode(mode) => mode as u8,
            _ => 0,
        };
        trace!("out {:#06x} <- {:#04x} ({:?})", port, value, command);
        (self.out)(port, value)
    }
}

/// Read-only view of the device ROM.
#[derive(Debug, Clone)]
pub struct Rom {
    shm: ShmRegion,
}

impl Rom {
    pub fn open(shm: ShmRegion) -> Result<Rom> {
        shm.check(0, rom::SIZE)?;
        let found = shm.read_u32(rom::MAGIC)?;
        if found != ROM_MAGIC {
            return Err(Error::BadMagic {
                found,
                expected: ROM_MAGIC,
            });
        }
        Ok(Rom { shm })
    }

    fn field(&self, offset: usize) -> Result<u32> {
        Ok(self.shm.read_u32(offset)?)
    }

    /// The mode the device is in right now; the device changes this behind
    /// our back when it falls back to VGA.
    pub fn mode(&self) -> Result<u32> {
        Ok(self.shm.load_u32(rom::MODE, Ordering::Acquire)?)
    }

    pub fn is_legacy_mode(&self) -> Result<bool> {
        Ok(self.mode()? == LEGACY_MODE)
    }

    /// Multimedia clock, in milliseconds.
    pub fn mm_clock(&self) -> Result<u32> {
        Ok(self.shm.load_u32(rom::MM_CLOCK, Ordering::Relaxed)?)
    }

    pub fn ram_header_offset(&self) -> Result<usize> {
        Ok(self.field(rom::RAM_HEADER_OFFSET)? as usize)
    }

    pub fn pages_offset(&self) -> Result<usize> {
        Ok(self.field(rom::PAGES_OFFSET)? as usize)
    }

    pub fn num_io_pages(&self) -> Result<usize> {
        Ok(self.field(rom::NUM_IO_PAGES)? as usize)
    }

    pub fn draw_area_offset(&self) -> Result<usize> {
        Ok(self.field(rom::DRAW_AREA_OFFSET)? as usize)
    }

    pub fn draw_area_size(&self) -> Result<usize> {
        Ok(self.field(rom::DRAW_AREA_SIZE)? as usize)
    }
}
