//! Release ids, and the collector that frees what the device hands back.
//!
//! Every record we submit starts with an 8-byte release id: the record's
//! device address with a type tag in the two low bits (records are 16-byte
//! aligned, so those bits are otherwise zero). When the device is done with a
//! batch of records it threads them into a list through that same field,
//! each holding the id of the next and the last holding zero, and pushes the
//! id of the first onto the release ring.
//!
//! Ids are decoded into [`ReleaseId`] as soon as they are read and looked up
//! in the [`InFlight`] table of records we actually pushed. Anything not in
//! the table, or carrying the wrong tag, is corruption and nothing is freed.
//! What a record references (a cursor shape, a copy's source image) comes
//! from the table too, never from memory the device can write.

use std::collections::HashMap;

use log::{debug, error};

use crate::error::{Error, Result};
use crate::image::{ImageCache, ImageRef};
use crate::layout::RELEASE_INFO;
use crate::pool::MemoryPool;
use crate::ring::Ring;
use crate::shm::{AddressMap, ShmRegion};

/// The low bits of a raw release id hold the record type.
pub const TAG_MASK: u64 = 3;

const TAG_DRAWING: u64 = 0;
const TAG_CURSOR: u64 = 1;

/// A record the device may hand back, by offset into device RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseId {
    Drawing(usize),
    Cursor(usize),
}

impl ReleaseId {
    pub fn offset(&self) -> usize {
        match *self {
            ReleaseId::Drawing(offset) | ReleaseId::Cursor(offset) => offset,
        }
    }

    /// The raw id written into the record and seen by the device.
    pub fn encode(&self, map: &AddressMap) -> u64 {
        match *self {
            ReleaseId::Drawing(offset) => map.to_device(offset) | TAG_DRAWING,
            ReleaseId::Cursor(offset) => map.to_device(offset) | TAG_CURSOR,
        }
    }

    /// Decode a raw id; zero ends a release list.
    pub fn decode(raw: u64, map: &AddressMap) -> Result<Option<ReleaseId>> {
        if raw == 0 {
            return Ok(None);
        }
        let offset = map.to_offset(raw & !TAG_MASK)?;
        match raw & TAG_MASK {
            TAG_DRAWING => Ok(Some(ReleaseId::Drawing(offset))),
            TAG_CURSOR => Ok(Some(ReleaseId::Cursor(offset))),
            tag => Err(Error::Corruption(format!(
                "release id {:#x} has unknown tag {}",
                raw, tag
            ))),
        }
    }
}

/// A record handed to the device, and what it keeps alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub id: ReleaseId,
    /// Offset of the shape a cursor set carries.
    pub shape: Option<usize>,
    /// The image a copy drawable holds a reference to.
    pub image: Option<ImageRef>,
}

impl Submitted {
    pub fn new(id: ReleaseId) -> Submitted {
        Submitted {
            id,
            shape: None,
            image: None,
        }
    }

    pub fn with_shape(mut self, shape: usize) -> Submitted {
        self.shape = Some(shape);
        self
    }

    pub fn with_image(mut self, image: ImageRef) -> Submitted {
        self.image = Some(image);
        self
    }
}

/// Records on their way through the device, by offset.
#[derive(Debug, Default)]
pub struct InFlight {
    records: HashMap<usize, Submitted>,
}

impl InFlight {
    pub fn new() -> InFlight {
        InFlight::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: ReleaseId) -> bool {
        self.records.get(&id.offset()).map(|r| r.id) == Some(id)
    }

    pub fn insert(&mut self, record: Submitted) -> Result<()> {
        let offset = record.id.offset();
        if self.records.contains_key(&offset) {
            return Err(Error::Corruption(format!(
                "record at {:#x} is already in flight",
                offset
            )));
        }
        self.records.insert(offset, record);
        Ok(())
    }

    /// Forget a record that never reached the device.
    pub fn remove(&mut self, id: ReleaseId) -> Option<Submitted> {
        self.take(id).ok()
    }

    /// Take back a record the device released. The table is left untouched
    /// if `id` does not name a record we pushed.
    pub fn take(&mut self, id: ReleaseId) -> Result<Submitted> {
        match self.records.remove(&id.offset()) {
            Some(record) if record.id == id => Ok(record),
            Some(record) => {
                let submitted = record.id;
                self.records.insert(id.offset(), record);
                Err(Error::Corruption(format!(
                    "release id {:?} does not match submitted {:?}",
                    id, submitted
                )))
            }
            None => Err(Error::Corruption(format!(
                "release id {:?} names no record in flight",
                id
            ))),
        }
    }

    /// Forget everything; for use right after the pool is reset.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Drain the release ring, freeing every record in every batch along with
/// what it references: the shape of a cursor set, the source image of a copy.
///
/// Returns whether anything was freed.
pub fn collect(
    ring: &mut Ring<u64>,
    in_flight: &mut InFlight,
    pool: &mut MemoryPool,
    cache: &mut ImageCache,
    shm: &ShmRegion,
    map: &AddressMap,
) -> Result<bool> {
    let mut collected = false;
    while let Some(raw) = ring.pop()? {
        let mut next = ReleaseId::decode(raw, map)?;
        let mut batch = 0;
        while let Some(id) = next {
            next = release_one(id, in_flight, pool, cache, shm, map).map_err(|e| {
                error!("releasing {:?}: {}", id, e);
                e
            })?;
            batch += 1;
        }
        debug!("released a batch of {} records", batch);
        collected |= batch > 0;
    }
    Ok(collected)
}

// Free one record and return the next id in its batch.
fn release_one(
    id: ReleaseId,
    in_flight: &mut InFlight,
    pool: &mut MemoryPool,
    cache: &mut ImageCache,
    shm: &ShmRegion,
    map: &AddressMap,
) -> Result<Option<ReleaseId>> {
    let record = in_flight.take(id)?;
    let next = shm.read_u64(id.offset() + RELEASE_INFO)?;

    if let Some(shape) = record.shape {
        pool.free_offset(shape)?;
    }
    if let Some(image) = record.image {
        cache.release(pool, image)?;
    }
    pool.free_offset(id.offset())?;
    ReleaseId::decode(next, map)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::image::PixelSource;
    use crate::layout::{cursor_cmd, drawable, CursorCommand, CursorOp, DrawBody, Drawable, Rect};

    const RING: usize = 0;
    const POOL: usize = 256;
    const BASE: u64 = 0x1_0000_0000;

    struct Fixture {
        shm: ShmRegion,
        map: AddressMap,
        pool: MemoryPool,
        cache: ImageCache,
        in_flight: InFlight,
        ring: Ring<u64>,
        device: Ring<u64>,
    }

    fn fixture() -> Fixture {
        let shm = ShmRegion::new(POOL + 16 * 1024);
        Fixture {
            map: AddressMap::new(BASE, shm.len()),
            pool: MemoryPool::new(POOL, 16 * 1024),
            cache: ImageCache::new(16, None),
            in_flight: InFlight::new(),
            ring: Ring::create(shm.clone(), RING, 8, 0).unwrap(),
            device: Ring::attach(shm.clone(), RING, 8).unwrap(),
            shm,
        }
    }

    impl Fixture {
        fn drawing(&mut self, body: DrawBody) -> ReleaseId {
            let block = self.pool.alloc(Drawable::SIZE).unwrap();
            let id = ReleaseId::Drawing(block.offset());
            Drawable {
                release_id: id.encode(&self.map),
                bbox: Rect::new(0, 0, 4, 4),
                mm_time: 0,
                body,
            }
            .encode(&self.shm, block.offset())
            .unwrap();
            block.into_offset();
            id
        }

        fn fill(&mut self) -> ReleaseId {
            let id = self.drawing(DrawBody::Fill { color: 0 });
            self.in_flight.insert(Submitted::new(id)).unwrap();
            id
        }

        fn copy(&mut self, image: ImageRef) -> ReleaseId {
            let id = self.drawing(DrawBody::Copy {
                src_bitmap: image.device_address(&self.map),
                src_area: Rect::new(0, 0, 4, 4),
            });
            self.in_flight
                .insert(Submitted::new(id).with_image(image))
                .unwrap();
            id
        }

        fn cursor_set(&mut self) -> ReleaseId {
            let shape = self.pool.alloc(64).unwrap().into_offset();
            let block = self.pool.alloc(CursorCommand::SIZE).unwrap();
            let id = ReleaseId::Cursor(block.offset());
            CursorCommand {
                release_id: id.encode(&self.map),
                op: CursorOp::Set {
                    x: 0,
                    y: 0,
                    visible: true,
                    shape: self.map.to_device(shape),
                },
            }
            .encode(&self.shm, block.offset())
            .unwrap();
            block.into_offset();
            self.in_flight
                .insert(Submitted::new(id).with_shape(shape))
                .unwrap();
            id
        }

        fn image(&mut self) -> ImageRef {
            let pixels = vec![0x5au8; 4 * 4 * 4];
            let source = PixelSource::new(&pixels, 16, 4);
            self.cache
                .get_or_create(&mut self.pool, &self.shm, &self.map, &source, 0, 0, 4, 4)
                .unwrap()
                .unwrap()
        }

        // What the device does: link the batch and post its head.
        fn release(&mut self, batch: &[ReleaseId]) {
            for pair in batch.windows(2) {
                let next = pair[1].encode(&self.map);
                self.shm.write_u64(pair[0].offset() + RELEASE_INFO, next).unwrap();
            }
            if let Some(last) = batch.last() {
                self.shm.write_u64(last.offset() + RELEASE_INFO, 0).unwrap();
            }
            self.device.push(&batch[0].encode(&self.map)).unwrap();
        }

        fn collect(&mut self) -> Result<bool> {
            collect(
                &mut self.ring,
                &mut self.in_flight,
                &mut self.pool,
                &mut self.cache,
                &self.shm,
                &self.map,
            )
        }
    }

    #[test]
    fn test_tags() {
        let map = AddressMap::new(BASE, 4096);
        let drawing = ReleaseId::Drawing(0x40);
        let cursor = ReleaseId::Cursor(0x80);
        assert_eq!(drawing.encode(&map), BASE + 0x40);
        assert_eq!(cursor.encode(&map), BASE + 0x81);
        assert_eq!(ReleaseId::decode(BASE + 0x81, &map).unwrap(), Some(cursor));
        assert_eq!(ReleaseId::decode(0, &map).unwrap(), None);
        assert!(matches!(
            ReleaseId::decode(BASE + 0x42, &map),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            ReleaseId::decode(0x40, &map),
            Err(Error::BadAddress { .. })
        ));
    }

    #[test]
    fn test_in_flight_table() {
        let mut table = InFlight::new();
        let id = ReleaseId::Drawing(0x40);
        table.insert(Submitted::new(id)).unwrap();
        assert!(table.contains(id));
        assert!(!table.contains(ReleaseId::Cursor(0x40)));
        assert!(matches!(
            table.insert(Submitted::new(ReleaseId::Cursor(0x40))),
            Err(Error::Corruption(_))
        ));

        // A wrong tag leaves the record where it was
        assert!(table.take(ReleaseId::Cursor(0x40)).is_err());
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(id).unwrap(), Submitted::new(id));
        assert!(table.take(id).is_err());
        assert!(table.is_empty());
        assert_eq!(table.remove(id), None);
    }

    #[test]
    fn test_empty_ring_is_a_no_op() {
        let mut fx = fixture();
        assert!(!fx.collect().unwrap());
        assert!(!fx.collect().unwrap());
    }

    #[test]
    fn test_batch_is_freed_once() {
        let mut fx = fixture();
        let batch = [fx.fill(), fx.cursor_set(), fx.fill()];
        assert_eq!(fx.pool.live_blocks(), 4);

        fx.release(&batch);
        assert!(fx.collect().unwrap());
        assert_eq!(fx.pool.live_blocks(), 0);
        assert!(fx.in_flight.is_empty());
        assert!(!fx.collect().unwrap());
        assert!(fx.pool.stats().0.is_valid());
    }

    #[test]
    fn test_copy_releases_image_reference() {
        let mut fx = fixture();
        let image = fx.image();
        assert_eq!(fx.image(), image);

        let first = fx.copy(image);
        let second = fx.copy(image);
        fx.release(&[first]);
        fx.collect().unwrap();
        assert_eq!(fx.cache.ref_count(image), Some(1));

        fx.release(&[second]);
        fx.collect().unwrap();
        assert_eq!(fx.cache.ref_count(image), None);
        assert_eq!(fx.pool.live_blocks(), 0);
    }

    #[test]
    fn test_repeated_id_is_refused() {
        let mut fx = fixture();
        let id = fx.fill();
        fx.release(&[id]);
        fx.collect().unwrap();

        fx.device.push(&id.encode(&fx.map)).unwrap();
        assert!(matches!(fx.collect(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_image_address_is_not_a_release_id() {
        let mut fx = fixture();
        let image = fx.image();
        let copy = fx.copy(image);
        let live = fx.pool.live_blocks();

        // An image descriptor is a live block, but was never pushed.
        fx.shm.write_u64(image.offset() + RELEASE_INFO, 0).unwrap();
        fx.device.push(&image.device_address(&fx.map)).unwrap();
        assert!(matches!(fx.collect(), Err(Error::Corruption(_))));
        assert_eq!(fx.pool.live_blocks(), live);
        assert_eq!(fx.cache.ref_count(image), Some(1));

        // The real copy still releases cleanly afterwards
        fx.release(&[copy]);
        assert!(fx.collect().unwrap());
        assert_eq!(fx.cache.ref_count(image), None);
        assert_eq!(fx.pool.live_blocks(), 0);
    }

    #[test]
    fn test_wrong_tag_is_refused() {
        let mut fx = fixture();
        let fill = fx.fill();
        fx.device
            .push(&ReleaseId::Cursor(fill.offset()).encode(&fx.map))
            .unwrap();
        assert!(matches!(fx.collect(), Err(Error::Corruption(_))));
        assert!(fx.in_flight.contains(fill));
        assert_eq!(fx.pool.live_blocks(), 1);
    }

    #[test]
    fn test_references_come_from_our_side() {
        let mut fx = fixture();
        let image = fx.image();
        let other = fx.pool.alloc(32).unwrap().into_offset();
        let copy = fx.copy(image);
        let cursor = fx.cursor_set();

        // The device scribbles over the pointers in both records.
        let scribble = fx.map.to_device(other);
        fx.shm
            .write_u64(copy.offset() + drawable::COPY_SRC_BITMAP, scribble)
            .unwrap();
        fx.shm
            .write_u64(cursor.offset() + cursor_cmd::SET_SHAPE, scribble)
            .unwrap();

        fx.release(&[copy, cursor]);
        assert!(fx.collect().unwrap());
        assert_eq!(fx.cache.ref_count(image), None);
        // Only the unrelated block is left
        assert_eq!(fx.pool.live_blocks(), 1);
        fx.pool.free_offset(other).unwrap();
    }

    #[test]
    fn test_multiple_batches() {
        let mut fx = fixture();
        let a = [fx.fill(), fx.fill()];
        let b = [fx.cursor_set()];
        let c = [fx.fill(), fx.fill(), fx.fill()];
        fx.release(&a);
        fx.release(&b);
        fx.release(&c);
        assert!(fx.collect().unwrap());
        assert_eq!(fx.pool.live_blocks(), 0);
    }
}
