//! Wire layout of the device's shared memory.
//!
//! Everything the device reads is byte-packed and little-endian. Records are
//! described by field-offset constants and written with explicit encoders
//! rather than `#[repr(packed)]` structs, so no reference to a packed field
//! is ever taken.

use static_assertions::const_assert_eq;

use crate::error::ShmError;
use crate::shm::ShmRegion;

/// "QXRO", little-endian.
pub const ROM_MAGIC: u32 = 0x4f52_5851;
/// "QXRA", little-endian.
pub const RAM_MAGIC: u32 = 0x4152_5851;

/// The value of the ROM's mode field while the device runs in legacy VGA mode.
pub const LEGACY_MODE: u32 = !0;

pub const COMMAND_RING_CAPACITY: u32 = 32;
pub const CURSOR_RING_CAPACITY: u32 = 32;
pub const RELEASE_RING_CAPACITY: u32 = 8;

pub const LOG_BUF_SIZE: usize = 4096;

/// Field offsets in the ROM descriptor.
pub mod rom {
    pub const MAGIC: usize = 0;
    pub const ID: usize = 4;
    pub const UPDATE_ID: usize = 8;
    pub const COMPRESSION_LEVEL: usize = 12;
    pub const LOG_LEVEL: usize = 16;
    pub const MODE: usize = 20;
    pub const MODES_OFFSET: usize = 24;
    pub const NUM_IO_PAGES: usize = 28;
    pub const PAGES_OFFSET: usize = 32;
    pub const DRAW_AREA_OFFSET: usize = 36;
    pub const DRAW_AREA_SIZE: usize = 40;
    pub const RAM_HEADER_OFFSET: usize = 44;
    pub const MM_CLOCK: usize = 48;
    pub const SIZE: usize = 52;
}

/// Field offsets in a ring header.
pub mod ring_header {
    pub const NUM_ITEMS: usize = 0;
    pub const PROD: usize = 4;
    pub const NOTIFY_ON_PROD: usize = 8;
    pub const CONS: usize = 12;
    pub const NOTIFY_ON_CONS: usize = 16;
    pub const SIZE: usize = 20;
}

/// Field offsets in the RAM header, relative to the ROM's `ram_header_offset`.
pub mod ram {
    use super::{
        ring_header, Command, Rect, COMMAND_RING_CAPACITY, CURSOR_RING_CAPACITY, LOG_BUF_SIZE,
        RELEASE_RING_CAPACITY,
    };

    pub const MAGIC: usize = 0;
    pub const INT_PENDING: usize = 4;
    pub const INT_MASK: usize = 8;
    pub const LOG_BUF: usize = 12;
    pub const COMMAND_RING: usize = LOG_BUF + LOG_BUF_SIZE;
    pub const CURSOR_RING: usize =
        COMMAND_RING + ring_header::SIZE + COMMAND_RING_CAPACITY as usize * Command::SIZE;
    pub const RELEASE_RING: usize =
        CURSOR_RING + ring_header::SIZE + CURSOR_RING_CAPACITY as usize * Command::SIZE;
    pub const UPDATE_AREA: usize = RELEASE_RING + ring_header::SIZE + RELEASE_RING_CAPACITY as usize * 8;
    pub const SIZE: usize = UPDATE_AREA + Rect::SIZE;
}

const_assert_eq!(ram::COMMAND_RING, 4108);
const_assert_eq!(ram::CURSOR_RING, 4640);
const_assert_eq!(ram::RELEASE_RING, 5172);
const_assert_eq!(ram::SIZE, 5272);
// Ring indices are accessed atomically.
const_assert_eq!(ram::COMMAND_RING % 4, 0);
const_assert_eq!(ram::CURSOR_RING % 4, 0);
const_assert_eq!(ram::RELEASE_RING % 4, 0);

/// I/O port offsets from the device's I/O base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IoPort {
    NotifyCommand = 0,
    NotifyCursor = 1,
    UpdateArea = 2,
    UpdateIrq = 3,
    NotifyOom = 4,
    Reset = 5,
    SetMode = 6,
    Log = 7,
}

/// A rectangle; right and bottom are exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const SIZE: usize = 16;

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Rect {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> u32 {
        (self.right as i64 - self.left as i64).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom as i64 - self.top as i64).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    /// The same rectangle moved to the origin.
    pub fn at_origin(&self) -> Rect {
        Rect::new(0, 0, self.width() as i32, self.height() as i32)
    }

    pub fn encode(&self, shm: &ShmRegion, offset: usize) -> Result<(), ShmError> {
        shm.write_u32(offset, self.top as u32)?;
        shm.write_u32(offset + 4, self.left as u32)?;
        shm.write_u32(offset + 8, self.bottom as u32)?;
        shm.write_u32(offset + 12, self.right as u32)
    }

    pub fn decode(shm: &ShmRegion, offset: usize) -> Result<Rect, ShmError> {
        Ok(Rect {
            top: shm.read_u32(offset)? as i32,
            left: shm.read_u32(offset + 4)? as i32,
            bottom: shm.read_u32(offset + 8)? as i32,
            right: shm.read_u32(offset + 12)? as i32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    Nop = 0,
    Draw = 1,
    Update = 2,
    Cursor = 3,
    Message = 4,
}

impl CommandType {
    pub fn from_u32(value: u32) -> Option<CommandType> {
        Some(match value {
            0 => CommandType::Nop,
            1 => CommandType::Draw,
            2 => CommandType::Update,
            3 => CommandType::Cursor,
            4 => CommandType::Message,
            _ => return None,
        })
    }
}

/// A ring slot on the command and cursor rings: the device address of a
/// record, and what kind of record it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub data: u64,
    pub kind: CommandType,
}

impl Command {
    pub const SIZE: usize = 16;
}

/// Every record the device hands back starts with this 8-byte field. It holds
/// the record's release id when submitted; the device overwrites it with the
/// id of the next record in a release batch.
pub const RELEASE_INFO: usize = 0;

/// Drawable record.
pub mod drawable {
    pub const RELEASE_INFO: usize = 0;
    pub const EFFECT: usize = 8;
    pub const TYPE: usize = 9;
    pub const BITMAP_OFFSET: usize = 10;
    pub const BITMAP_AREA: usize = 12;
    pub const BBOX: usize = 28;
    pub const CLIP_TYPE: usize = 44;
    pub const CLIP_ADDRESS: usize = 48;
    pub const MM_TIME: usize = 56;
    pub const BODY: usize = 60;
    pub const SIZE: usize = 128;

    pub const FILL_BRUSH_TYPE: usize = BODY;
    pub const FILL_BRUSH_COLOR: usize = BODY + 4;
    pub const FILL_ROP: usize = BODY + 20;
    pub const FILL_MASK: usize = BODY + 22;

    pub const COPY_SRC_BITMAP: usize = BODY;
    pub const COPY_SRC_AREA: usize = BODY + 8;
    pub const COPY_ROP: usize = BODY + 24;
    pub const COPY_SCALE_MODE: usize = BODY + 26;
    pub const COPY_MASK: usize = BODY + 27;

    pub const COPY_BITS_SRC_X: usize = BODY;
    pub const COPY_BITS_SRC_Y: usize = BODY + 4;

    pub const EFFECT_OPAQUE: u8 = 1;
    pub const CLIP_NONE: u32 = 0;
    pub const BRUSH_SOLID: u32 = 1;
    /// Raster operation descriptor: plain put.
    pub const ROP_PUT: u16 = 1 << 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrawType {
    Nop = 0,
    Fill = 1,
    Opaque = 2,
    Copy = 3,
    CopyBits = 4,
}

impl DrawType {
    pub fn from_u8(value: u8) -> Option<DrawType> {
        Some(match value {
            0 => DrawType::Nop,
            1 => DrawType::Fill,
            2 => DrawType::Opaque,
            3 => DrawType::Copy,
            4 => DrawType::CopyBits,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawBody {
    Fill { color: u32 },
    Copy { src_bitmap: u64, src_area: Rect },
    CopyBits { src_x: i32, src_y: i32 },
}

impl DrawBody {
    pub fn kind(&self) -> DrawType {
        match self {
            DrawBody::Fill { .. } => DrawType::Fill,
            DrawBody::Copy { .. } => DrawType::Copy,
            DrawBody::CopyBits { .. } => DrawType::CopyBits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drawable {
    pub release_id: u64,
    pub bbox: Rect,
    pub mm_time: u32,
    pub body: DrawBody,
}

impl Drawable {
    pub const SIZE: usize = drawable::SIZE;

    /// Write the whole record. Masks, clip and bitmap area are left zeroed:
    /// opaque effect, no clipping.
    pub fn encode(&self, shm: &ShmRegion, offset: usize) -> Result<(), ShmError> {
        shm.zero(offset, Self::SIZE)?;
        shm.write_u64(offset + drawable::RELEASE_INFO, self.release_id)?;
        shm.write_u8(offset + drawable::EFFECT, drawable::EFFECT_OPAQUE)?;
        shm.write_u8(offset + drawable::TYPE, self.body.kind() as u8)?;
        self.bbox.encode(shm, offset + drawable::BBOX)?;
        shm.write_u32(offset + drawable::CLIP_TYPE, drawable::CLIP_NONE)?;
        shm.write_u32(offset + drawable::MM_TIME, self.mm_time)?;

        match self.body {
            DrawBody::Fill { color } => {
                shm.write_u32(offset + drawable::FILL_BRUSH_TYPE, drawable::BRUSH_SOLID)?;
                shm.write_u32(offset + drawable::FILL_BRUSH_COLOR, color)?;
                shm.write_u16(offset + drawable::FILL_ROP, drawable::ROP_PUT)
            }
            DrawBody::Copy {
                src_bitmap,
                src_area,
            } => {
                shm.write_u64(offset + drawable::COPY_SRC_BITMAP, src_bitmap)?;
                src_area.encode(shm, offset + drawable::COPY_SRC_AREA)?;
                shm.write_u16(offset + drawable::COPY_ROP, drawable::ROP_PUT)
            }
            DrawBody::CopyBits { src_x, src_y } => {
                shm.write_u32(offset + drawable::COPY_BITS_SRC_X, src_x as u32)?;
                shm.write_u32(offset + drawable::COPY_BITS_SRC_Y, src_y as u32)
            }
        }
    }
}

/// Image record: a descriptor followed by a bitmap header.
pub mod image {
    pub const ID: usize = 0;
    pub const TYPE: usize = 8;
    pub const FLAGS: usize = 9;
    pub const WIDTH: usize = 10;
    pub const HEIGHT: usize = 14;
    pub const BITMAP_FORMAT: usize = 18;
    pub const BITMAP_FLAGS: usize = 19;
    pub const BITMAP_X: usize = 20;
    pub const BITMAP_Y: usize = 24;
    pub const BITMAP_STRIDE: usize = 28;
    pub const BITMAP_PALETTE: usize = 32;
    pub const BITMAP_DATA: usize = 40;
    pub const SIZE: usize = 48;

    pub const TYPE_BITMAP: u8 = 0;
    /// The device may keep the image in its own cache under `ID`.
    pub const FLAG_CACHE: u8 = 1 << 0;
    pub const BITMAP_TOP_DOWN: u8 = 1 << 2;
    pub const FORMAT_16BIT: u8 = 6;
    pub const FORMAT_32BIT: u8 = 8;
}

/// Pixel formats the device takes for uploaded bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitmapFormat {
    Rgb16,
    Rgb32,
}

impl BitmapFormat {
    pub fn from_bytes_per_pixel(bytes_per_pixel: usize) -> Option<BitmapFormat> {
        match bytes_per_pixel {
            2 => Some(BitmapFormat::Rgb16),
            4 => Some(BitmapFormat::Rgb32),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            BitmapFormat::Rgb16 => 2,
            BitmapFormat::Rgb32 => 4,
        }
    }

    fn code(self) -> u8 {
        match self {
            BitmapFormat::Rgb16 => image::FORMAT_16BIT,
            BitmapFormat::Rgb32 => image::FORMAT_32BIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub id: u64,
    pub cacheable: bool,
    pub width: u32,
    pub height: u32,
    pub format: BitmapFormat,
    /// Device address of the data chunk.
    pub data: u64,
}

impl ImageHeader {
    pub const SIZE: usize = image::SIZE;

    pub fn encode(&self, shm: &ShmRegion, offset: usize) -> Result<(), ShmError> {
        shm.zero(offset, Self::SIZE)?;
        shm.write_u64(offset + image::ID, self.id)?;
        shm.write_u8(offset + image::TYPE, image::TYPE_BITMAP)?;
        let flags = if self.cacheable { image::FLAG_CACHE } else { 0 };
        shm.write_u8(offset + image::FLAGS, flags)?;
        shm.write_u32(offset + image::WIDTH, self.width)?;
        shm.write_u32(offset + image::HEIGHT, self.height)?;

        shm.write_u8(offset + image::BITMAP_FORMAT, self.format.code())?;
        shm.write_u8(offset + image::BITMAP_FLAGS, image::BITMAP_TOP_DOWN)?;
        shm.write_u32(offset + image::BITMAP_X, self.width)?;
        shm.write_u32(offset + image::BITMAP_Y, self.height)?;
        shm.write_u32(
            offset + image::BITMAP_STRIDE,
            self.width * self.format.bytes_per_pixel() as u32,
        )?;
        shm.write_u64(offset + image::BITMAP_DATA, self.data)
    }
}

/// Data chunk: a header followed by the payload.
pub mod chunk {
    pub const DATA_SIZE: usize = 0;
    pub const PREV_CHUNK: usize = 4;
    pub const NEXT_CHUNK: usize = 12;
    pub const DATA: usize = 20;
    pub const HEADER_SIZE: usize = DATA;
}

/// Write a single, unlinked chunk header.
pub fn encode_chunk_header(shm: &ShmRegion, offset: usize, data_size: u32) -> Result<(), ShmError> {
    shm.write_u32(offset + chunk::DATA_SIZE, data_size)?;
    shm.write_u64(offset + chunk::PREV_CHUNK, 0)?;
    shm.write_u64(offset + chunk::NEXT_CHUNK, 0)
}

/// Cursor command record.
pub mod cursor_cmd {
    pub const RELEASE_INFO: usize = 0;
    pub const TYPE: usize = 8;
    pub const POSITION_X: usize = 9;
    pub const POSITION_Y: usize = 11;
    pub const SET_VISIBLE: usize = 13;
    pub const SET_SHAPE: usize = 14;
    pub const DEVICE_DATA: usize = 22;
    pub const DEVICE_DATA_SIZE: usize = 128;
    pub const SIZE: usize = DEVICE_DATA + DEVICE_DATA_SIZE;

    pub const SET: u8 = 0;
    pub const MOVE: u8 = 1;
    pub const HIDE: u8 = 2;
}

const_assert_eq!(cursor_cmd::SIZE, 150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    Set {
        x: i16,
        y: i16,
        visible: bool,
        /// Device address of the cursor shape.
        shape: u64,
    },
    Move {
        x: i16,
        y: i16,
    },
    Hide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorCommand {
    pub release_id: u64,
    pub op: CursorOp,
}

impl CursorCommand {
    pub const SIZE: usize = cursor_cmd::SIZE;

    pub fn encode(&self, shm: &ShmRegion, offset: usize) -> Result<(), ShmError> {
        shm.zero(offset, Self::SIZE)?;
        shm.write_u64(offset + cursor_cmd::RELEASE_INFO, self.release_id)?;
        match self.op {
            CursorOp::Set {
                x,
                y,
                visible,
                shape,
            } => {
                shm.write_u8(offset + cursor_cmd::TYPE, cursor_cmd::SET)?;
                shm.write_u16(offset + cursor_cmd::POSITION_X, x as u16)?;
                shm.write_u16(offset + cursor_cmd::POSITION_Y, y as u16)?;
                shm.write_u8(offset + cursor_cmd::SET_VISIBLE, visible as u8)?;
                shm.write_u64(offset + cursor_cmd::SET_SHAPE, shape)
            }
            CursorOp::Move { x, y } => {
                shm.write_u8(offset + cursor_cmd::TYPE, cursor_cmd::MOVE)?;
                shm.write_u16(offset + cursor_cmd::POSITION_X, x as u16)?;
                shm.write_u16(offset + cursor_cmd::POSITION_Y, y as u16)
            }
            CursorOp::Hide => shm.write_u8(offset + cursor_cmd::TYPE, cursor_cmd::HIDE),
        }
    }
}

/// Cursor shape record: header, then a single data chunk.
pub mod cursor_shape {
    pub const UNIQUE: usize = 0;
    pub const TYPE: usize = 8;
    pub const WIDTH: usize = 10;
    pub const HEIGHT: usize = 12;
    pub const HOT_SPOT_X: usize = 14;
    pub const HOT_SPOT_Y: usize = 16;
    pub const DATA_SIZE: usize = 18;
    pub const CHUNK: usize = 22;
    pub const HEADER_SIZE: usize = CHUNK + super::chunk::HEADER_SIZE;

    pub const TYPE_ALPHA: u16 = 0;
}

const_assert_eq!(cursor_shape::HEADER_SIZE, 42);
