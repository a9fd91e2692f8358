//! A `Session` owns everything needed to talk to one device: its memory, the
//! allocator over it, the three rings, the image cache and the I/O channel.
//!
//! All drawing goes through here. Each command is built in memory taken from
//! the pool, fully written, and only then published on a ring; it comes back
//! through the release ring when the device is done with it, at which point
//! the garbage collector frees it.
//!
//! Allocation never fails in the common case. When the pool is exhausted
//! [`Session::alloc_or_recover`] asks the device to drop everything it holds
//! and waits for the release ring to give memory back, giving up only after
//! many consecutive rounds in which nothing came back.

use std::time::Duration;

use log::{debug, error, info, trace, warn};
use spin::{Mutex, MutexGuard};

use crate::config::SessionConfig;
use crate::device::{DeviceIo, RingId, Rom};
use crate::error::{Error, ImageError, PoolError, Result};
use crate::image::{CacheStats, ImageCache, ImageRef, Lookup, PixelSource};
use crate::layout::{
    cursor_shape, encode_chunk_header, ram, BitmapFormat, Command, CommandType, CursorCommand,
    CursorOp, DrawBody, Drawable, ImageHeader, Rect, COMMAND_RING_CAPACITY,
    CURSOR_RING_CAPACITY, RAM_MAGIC, RELEASE_RING_CAPACITY,
};
use crate::pool::{Block, MemoryPool, PoolStats};
use crate::release::{self, InFlight, ReleaseId, Submitted};
use crate::ring::Ring;
use crate::shm::{AddressMap, ShmRegion};

/// Largest cursor the device accepts, in either dimension.
pub const MAX_CURSOR_SIZE: u16 = 64;

/// An ARGB cursor, one `u32` per pixel, rows top to bottom.
#[derive(Debug, Clone, Copy)]
pub struct CursorImage<'a> {
    pub width: u16,
    pub height: u16,
    pub hot_x: u16,
    pub hot_y: u16,
    pub argb: &'a [u32],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CursorState {
    x: i32,
    y: i32,
    hot_x: i32,
    hot_y: i32,
}

impl CursorState {
    // The device positions the cursor by its hot spot, in 16 bits.
    fn position(&self) -> (i16, i16) {
        let clamp = |v: i32| v.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        (
            clamp(self.x.saturating_add(self.hot_x)),
            clamp(self.y.saturating_add(self.hot_y)),
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub pool: PoolStats,
    pub cache: CacheStats,
    /// Records pushed and not yet released.
    pub in_flight: usize,
    /// Out-of-memory recovery rounds since the session was opened.
    pub oom_rounds: u64,
}

pub struct Session<D> {
    shm: ShmRegion,
    map: AddressMap,
    rom: Rom,
    io: D,
    config: SessionConfig,
    ram_header: usize,
    pool: MemoryPool,
    cache: ImageCache,
    in_flight: InFlight,
    command_ring: Ring<Command>,
    cursor_ring: Ring<Command>,
    release_ring: Ring<u64>,
    bytes_per_pixel: usize,
    mode: Option<u32>,
    cursor: CursorState,
    oom_rounds: u64,
}

impl<D: DeviceIo> Session<D> {
    /// Take over a freshly reset device whose RAM is `shm`.
    pub fn open(shm: ShmRegion, rom: Rom, io: D, config: SessionConfig) -> Result<Session<D>> {
        check_format(config.bytes_per_pixel)?;
        let ram_header = rom.ram_header_offset()?;
        shm.check(ram_header, ram::SIZE)?;
        let found = shm.read_u32(ram_header + ram::MAGIC)?;
        if found != RAM_MAGIC {
            return Err(Error::BadMagic {
                found,
                expected: RAM_MAGIC,
            });
        }

        let pool_base = rom.pages_offset()?;
        let pool_size = rom
            .num_io_pages()?
            .checked_mul(config.page_size)
            .ok_or_else(|| Error::Corruption("ROM page count overflows".into()))?;
        shm.check(pool_base, pool_size)?;

        let command_ring = Ring::create(
            shm.clone(),
            ram_header + ram::COMMAND_RING,
            COMMAND_RING_CAPACITY,
            config.command_notify_threshold,
        )?;
        let cursor_ring = Ring::create(
            shm.clone(),
            ram_header + ram::CURSOR_RING,
            CURSOR_RING_CAPACITY,
            config.cursor_notify_threshold,
        )?;
        let release_ring = Ring::create(
            shm.clone(),
            ram_header + ram::RELEASE_RING,
            RELEASE_RING_CAPACITY,
            0,
        )?;

        info!(
            "session open: RAM header at {:#x}, {} bytes of pool at {:#x}",
            ram_header, pool_size, pool_base
        );
        Ok(Session {
            map: AddressMap::new(config.ram_physical_base, shm.len()),
            pool: MemoryPool::new(pool_base, pool_size),
            cache: ImageCache::new(config.image_cache_buckets, config.max_cached_image_bytes),
            in_flight: InFlight::new(),
            bytes_per_pixel: config.bytes_per_pixel,
            shm,
            rom,
            io,
            config,
            ram_header,
            command_ring,
            cursor_ring,
            release_ring,
            mode: None,
            cursor: CursorState::default(),
            oom_rounds: 0,
        })
    }

    pub fn shm(&self) -> &ShmRegion {
        &self.shm
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.map
    }

    pub fn rom(&self) -> &Rom {
        &self.rom
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn io(&self) -> &D {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut D {
        &mut self.io
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    /// The last mode set with [`switch_mode`](Session::switch_mode).
    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            pool: self.pool.stats().1,
            cache: self.cache.stats(),
            in_flight: self.in_flight.len(),
            oom_rounds: self.oom_rounds,
        }
    }

    pub fn dump_stats(&self, label: &str) -> SessionStats {
        self.pool.dump_stats(label);
        let cache = self.cache.stats();
        info!(
            "  image cache: {} entries, {} hits, {} misses, {} collisions, {} uncached",
            cache.entries, cache.hits, cache.misses, cache.collisions, cache.uncached
        );
        info!("  {} records in flight", self.in_flight.len());
        self.stats()
    }

    /// Free everything the device has handed back. Returns whether anything
    /// was freed.
    pub fn collect_garbage(&mut self) -> Result<bool> {
        release::collect(
            &mut self.release_ring,
            &mut self.in_flight,
            &mut self.pool,
            &mut self.cache,
            &self.shm,
            &self.map,
        )
    }

    /// Allocate `size` bytes of device memory, waiting for the device to
    /// release memory if need be.
    ///
    /// Garbage is collected before every allocation. If the pool is still
    /// full, each recovery round asks the device to redraw the whole screen,
    /// signals out-of-memory, sleeps, and collects again. After
    /// `oom_retry_limit` consecutive rounds that free nothing the device is
    /// taken to be wedged: statistics are logged and the process exits, or
    /// [`Error::OutOfMemory`] is returned if `abort_on_exhaustion` is off.
    pub fn alloc_or_recover(&mut self, size: usize) -> Result<Block> {
        let capacity = self.pool.capacity();
        if MemoryPool::block_size(size) > capacity {
            return Err(PoolError::TooLarge { size, capacity }.into());
        }

        self.collect_garbage()?;

        let mut attempts = 0;
        loop {
            if let Some(block) = self.pool.alloc(size) {
                return Ok(block);
            }
            if attempts >= self.config.oom_retry_limit {
                return self.exhausted(size, attempts);
            }

            // Rather than run out of memory, tell the device to dump
            // everything it holds.
            self.request_redraw(self.config.update_area)?;
            self.oom_rounds += 1;
            warn!("eliminated memory ({})", self.oom_rounds);
            self.io.notify_out_of_memory();
            sleep(self.config.oom_retry_interval);

            if self.collect_garbage()? {
                attempts = 0;
            } else {
                attempts += 1;
            }
        }
    }

    fn exhausted(&mut self, requested: usize, attempts: u32) -> Result<Block> {
        error!(
            "out of device memory: {} bytes wanted, nothing released in {} rounds",
            requested, attempts
        );
        self.dump_stats("out of device memory");
        if self.config.abort_on_exhaustion {
            std::process::exit(1);
        }
        Err(Error::OutOfMemory {
            requested,
            attempts,
        })
    }

    /// Return a block obtained from [`alloc_or_recover`](Session::alloc_or_recover)
    /// that was never handed to the device.
    pub fn free(&mut self, block: Block) -> Result<usize> {
        Ok(self.pool.free(block)?)
    }

    /// Ask the device to redraw `area` from its own state.
    pub fn request_redraw(&mut self, area: Rect) -> Result<()> {
        area.encode(&self.shm, self.ram_header + ram::UPDATE_AREA)?;
        self.io.notify_update_area(area);
        Ok(())
    }

    // Allocate a record and fill it in; the block is freed again if writing
    // fails.
    fn build<F>(&mut self, size: usize, write: F) -> Result<Block>
    where
        F: FnOnce(&ShmRegion, usize) -> Result<()>,
    {
        let block = self.alloc_or_recover(size)?;
        match write(&self.shm, block.offset()) {
            Ok(()) => Ok(block),
            Err(e) => {
                self.pool.free(block)?;
                Err(e)
            }
        }
    }

    // Publish a fully written record. The block belongs to the device from
    // here on, unless the push fails, in which case it is freed. `shape` and
    // `image` are what the record keeps alive until it is released.
    fn push_command(
        &mut self,
        ring: RingId,
        block: Block,
        kind: CommandType,
        shape: Option<usize>,
        image: Option<ImageRef>,
    ) -> Result<()> {
        let legacy = match self.rom.is_legacy_mode() {
            Ok(legacy) => legacy,
            Err(e) => {
                self.pool.free(block)?;
                return Err(e);
            }
        };
        if legacy {
            // Commands queued in VGA mode crash the device at the next mode
            // set. The record stays allocated until the pool is reset.
            warn!(
                "device is in legacy mode, not pushing {:?} at {:#x}",
                kind,
                block.offset()
            );
            block.into_offset();
            return Ok(());
        }

        let id = match ring {
            RingId::Command => ReleaseId::Drawing(block.offset()),
            RingId::Cursor => ReleaseId::Cursor(block.offset()),
        };
        let submitted = Submitted { id, shape, image };
        if let Err(e) = self.in_flight.insert(submitted) {
            self.pool.free(block)?;
            return Err(e);
        }

        let command = Command {
            data: self.map.to_device(block.offset()),
            kind,
        };
        let pushed = match ring {
            RingId::Command => self.command_ring.push(&command),
            RingId::Cursor => self.cursor_ring.push(&command),
        };
        match pushed {
            Ok(notify) => {
                block.into_offset();
                if notify {
                    self.io.notify_producer(ring);
                }
                Ok(())
            }
            Err(e) => {
                self.in_flight.remove(id);
                self.pool.free(block)?;
                Err(e.into())
            }
        }
    }

    fn submit_drawable(
        &mut self,
        bbox: Rect,
        body: DrawBody,
        image: Option<ImageRef>,
    ) -> Result<()> {
        let mm_time = self.rom.mm_clock()?;
        let map = self.map;
        let block = self.build(Drawable::SIZE, |shm, offset| {
            let drawable = Drawable {
                release_id: ReleaseId::Drawing(offset).encode(&map),
                bbox,
                mm_time,
                body,
            };
            Ok(drawable.encode(shm, offset)?)
        })?;
        debug!("{:?} drawable at {:#x}, bbox {:?}", body.kind(), block.offset(), bbox);
        self.push_command(RingId::Command, block, CommandType::Draw, None, image)
    }

    /// Fill `rect` with a solid colour.
    pub fn submit_fill(&mut self, rect: Rect, color: u32) -> Result<()> {
        if rect.is_empty() {
            return Ok(());
        }
        self.submit_drawable(rect, DrawBody::Fill { color }, None)
    }

    pub fn submit_fills<I>(&mut self, rects: I, color: u32) -> Result<()>
    where
        I: IntoIterator<Item = Rect>,
    {
        for rect in rects {
            self.submit_fill(rect, color)?;
        }
        Ok(())
    }

    /// Upload `rect` of `source` (de-duplicated through the image cache) and
    /// draw it at the same position on screen.
    pub fn submit_copy(&mut self, source: &PixelSource<'_>, rect: Rect) -> Result<()> {
        if rect.is_empty() {
            trace!("skipping empty copy {:?}", rect);
            return Ok(());
        }
        let out_of_bounds = ImageError::OutOfBounds {
            x: rect.left.max(0) as usize,
            y: rect.top.max(0) as usize,
            width: rect.width() as usize,
            height: rect.height() as usize,
        };
        let x = usize::try_from(rect.left).map_err(|_| out_of_bounds)?;
        let y = usize::try_from(rect.top).map_err(|_| out_of_bounds)?;

        let image = self.image_create(source, x, y, rect.width() as usize, rect.height() as usize)?;
        let body = DrawBody::Copy {
            src_bitmap: image.device_address(&self.map),
            src_area: rect.at_origin(),
        };
        if let Err(e) = self.submit_drawable(rect, body, Some(image)) {
            self.cache.release(&mut self.pool, image)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn submit_copies<I>(&mut self, source: &PixelSource<'_>, rects: I) -> Result<()>
    where
        I: IntoIterator<Item = Rect>,
    {
        for rect in rects {
            self.submit_copy(source, rect)?;
        }
        Ok(())
    }

    /// Copy on-screen pixels from (`src_x`, `src_y`) to `dest`.
    pub fn submit_copy_bits(&mut self, src_x: i32, src_y: i32, dest: Rect) -> Result<()> {
        if dest.is_empty() {
            return Ok(());
        }
        self.submit_drawable(dest, DrawBody::CopyBits { src_x, src_y }, None)
    }

    /// Find or upload an image. The caller owns one reference to it, to be
    /// dropped through a released copy drawable.
    pub fn image_create(
        &mut self,
        source: &PixelSource<'_>,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<ImageRef> {
        if source.bytes_per_pixel() != self.bytes_per_pixel {
            return Err(ImageError::FormatMismatch {
                found: source.bytes_per_pixel(),
                expected: self.bytes_per_pixel,
            }
            .into());
        }
        let upload = match self.cache.lookup(&self.shm, source, x, y, width, height)? {
            Lookup::Hit(image) => return Ok(image),
            Lookup::Upload(upload) => upload,
        };

        let chunk = self.alloc_or_recover(upload.size.chunk_bytes())?;
        let descriptor = match self.alloc_or_recover(ImageHeader::SIZE) {
            Ok(block) => block,
            Err(e) => {
                self.pool.free(chunk)?;
                return Err(e);
            }
        };
        self.cache
            .upload(&self.shm, &self.map, chunk, descriptor, source, x, y, upload)
    }

    fn push_cursor(&mut self, op: CursorOp, shape: Option<usize>) -> Result<()> {
        let map = self.map;
        let block = self.build(CursorCommand::SIZE, |shm, offset| {
            let command = CursorCommand {
                release_id: ReleaseId::Cursor(offset).encode(&map),
                op,
            };
            Ok(command.encode(shm, offset)?)
        })?;
        trace!("cursor {:?} at {:#x}", op, block.offset());
        self.push_command(RingId::Cursor, block, CommandType::Cursor, shape, None)
    }

    /// Load a new cursor shape and show it at the current position.
    pub fn cursor_set(&mut self, image: &CursorImage<'_>) -> Result<()> {
        let pixels = image.width as usize * image.height as usize;
        if image.width > MAX_CURSOR_SIZE
            || image.height > MAX_CURSOR_SIZE
            || image.argb.len() != pixels
        {
            return Err(ImageError::OutOfBounds {
                x: 0,
                y: 0,
                width: image.width as usize,
                height: image.height as usize,
            }
            .into());
        }

        let data_size = pixels * 4;
        let shape = self.build(cursor_shape::HEADER_SIZE + data_size, |shm, offset| {
            write_cursor_shape(shm, offset, image, data_size)
        })?;

        self.cursor.hot_x = image.hot_x as i32;
        self.cursor.hot_y = image.hot_y as i32;
        let (x, y) = self.cursor.position();
        let shape_offset = shape.into_offset();
        let op = CursorOp::Set {
            x,
            y,
            visible: true,
            shape: self.map.to_device(shape_offset),
        };
        if let Err(e) = self.push_cursor(op, Some(shape_offset)) {
            self.pool.free_offset(shape_offset)?;
            return Err(e);
        }
        Ok(())
    }

    pub fn cursor_move(&mut self, x: i32, y: i32) -> Result<()> {
        self.cursor.x = x;
        self.cursor.y = y;
        let (x, y) = self.cursor.position();
        self.push_cursor(CursorOp::Move { x, y }, None)
    }

    pub fn cursor_hide(&mut self) -> Result<()> {
        self.push_cursor(CursorOp::Hide, None)
    }

    /// There is no show command; moving the cursor to where it already is
    /// makes the device show it.
    pub fn cursor_show(&mut self) -> Result<()> {
        let CursorState { x, y, .. } = self.cursor;
        self.cursor_move(x, y)
    }

    /// Current cursor position, not counting the hot spot.
    pub fn cursor_position(&self) -> (i32, i32) {
        (self.cursor.x, self.cursor.y)
    }

    /// Reset the device into `mode_id`. Everything in device memory is
    /// forgotten: the device drops it on reset.
    pub fn switch_mode(&mut self, mode_id: u32, bytes_per_pixel: usize) -> Result<()> {
        check_format(bytes_per_pixel)?;
        info!(
            "setting mode {} ({} bytes per pixel)",
            mode_id, bytes_per_pixel
        );
        self.io.notify_reset();
        self.io.notify_set_mode(mode_id);
        self.mode = Some(mode_id);
        self.bytes_per_pixel = bytes_per_pixel;

        self.pool.free_all();
        self.cache.clear();
        self.in_flight.clear();
        self.command_ring
            .reset(self.config.command_notify_threshold)?;
        self.cursor_ring
            .reset(self.config.cursor_notify_threshold)?;
        self.release_ring.reset(0)?;
        Ok(())
    }

    /// If the device has fallen back to legacy VGA mode behind our back, set
    /// the last mode again. Returns whether a mode set was needed.
    pub fn check_mode(&mut self) -> Result<bool> {
        if !self.rom.is_legacy_mode()? {
            return Ok(false);
        }
        match self.mode {
            Some(mode_id) => {
                warn!("device jumped back to legacy mode, setting mode {} again", mode_id);
                let bytes_per_pixel = self.bytes_per_pixel;
                self.switch_mode(mode_id, bytes_per_pixel)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait for the device to consume every pushed command and cursor
    /// update.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.rom.is_legacy_mode()? {
            info!("device is in legacy mode, not waiting for it");
            return Ok(());
        }
        self.command_ring.wait_idle()?;
        self.cursor_ring.wait_idle()?;
        self.collect_garbage()?;
        self.dump_stats("session shutdown");
        Ok(())
    }
}

fn write_cursor_shape(
    shm: &ShmRegion,
    offset: usize,
    image: &CursorImage<'_>,
    data_size: usize,
) -> Result<()> {
    shm.zero(offset, cursor_shape::HEADER_SIZE)?;
    shm.write_u64(offset + cursor_shape::UNIQUE, 0)?;
    shm.write_u16(offset + cursor_shape::TYPE, cursor_shape::TYPE_ALPHA)?;
    shm.write_u16(offset + cursor_shape::WIDTH, image.width)?;
    shm.write_u16(offset + cursor_shape::HEIGHT, image.height)?;
    shm.write_u16(offset + cursor_shape::HOT_SPOT_X, image.hot_x)?;
    shm.write_u16(offset + cursor_shape::HOT_SPOT_Y, image.hot_y)?;
    shm.write_u32(offset + cursor_shape::DATA_SIZE, data_size as u32)?;
    encode_chunk_header(shm, offset + cursor_shape::CHUNK, data_size as u32)?;

    let bytes: Vec<u8> = image.argb.iter().flat_map(|p| p.to_le_bytes()).collect();
    shm.write_bytes(offset + cursor_shape::HEADER_SIZE, &bytes)?;
    Ok(())
}

fn check_format(bytes_per_pixel: usize) -> Result<()> {
    match BitmapFormat::from_bytes_per_pixel(bytes_per_pixel) {
        Some(_) => Ok(()),
        None => Err(ImageError::UnsupportedFormat { bytes_per_pixel }.into()),
    }
}

fn sleep(interval: Duration) {
    if interval.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(interval);
    }
}

/// A [`Session`] behind a spin lock, for host glue that reaches the device
/// from more than one callback context.
pub struct LockedSession<D> {
    inner: Mutex<Session<D>>,
}

impl<D: DeviceIo> LockedSession<D> {
    pub fn new(session: Session<D>) -> LockedSession<D> {
        LockedSession {
            inner: Mutex::new(session),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Session<D>> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Session<D>>> {
        self.inner.try_lock()
    }

    pub fn into_inner(self) -> Session<D> {
        self.inner.into_inner()
    }
}

impl<D: DeviceIo> From<Session<D>> for LockedSession<D> {
    fn from(session: Session<D>) -> Self {
        LockedSession::new(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_cursor_position_is_clamped() {
        let mut cursor = CursorState {
            x: 10,
            y: 20,
            hot_x: 3,
            hot_y: 4,
        };
        assert_eq!(cursor.position(), (13, 24));

        cursor.x = i32::MAX;
        cursor.y = i32::MIN;
        assert_eq!(cursor.position(), (i16::MAX, i16::MIN));

        cursor.x = 40_000;
        cursor.y = -40_000;
        assert_eq!(cursor.position(), (i16::MAX, i16::MIN));
    }
}
