//! Content-addressed cache of uploaded bitmaps.
//!
//! Applications redraw the same pixels over and over: toolbar icons, glyph
//! runs, window decorations. Each upload costs device memory and bandwidth,
//! so bitmaps are keyed by a hash of their pixels and reference counted. A
//! second request for identical pixels returns the image already in device
//! memory and bumps its count; the image is freed when the last drawable
//! using it is released.
//!
//! The hash is only a hint. A candidate with an equal hash and equal
//! dimensions is compared byte for byte against the source before it is
//! reused; if the bytes differ, the request is uploaded again as a private,
//! uncached image. The device is told to cache an image under its hash, so
//! letting two different bitmaps share one hash would corrupt its cache too.
//!
//! Bookkeeping lives entirely on our side, keyed by the offset of each image
//! descriptor, so releasing an image never trusts what the device may have
//! written into shared memory.

use std::collections::HashMap;

use log::{debug, warn};
use xxhash_rust::xxh32::Xxh32;

use crate::error::{Error, ImageError, Result};
use crate::layout::{chunk, encode_chunk_header, BitmapFormat, ImageHeader};
use crate::pool::{Block, MemoryPool};
use crate::shm::{AddressMap, ShmRegion};

/// A rectangle of pixels somewhere in host memory.
#[derive(Debug, Clone, Copy)]
pub struct PixelSource<'a> {
    data: &'a [u8],
    stride: usize,
    bytes_per_pixel: usize,
}

impl<'a> PixelSource<'a> {
    /// `stride` is the distance in bytes between the starts of two rows.
    pub fn new(data: &'a [u8], stride: usize, bytes_per_pixel: usize) -> PixelSource<'a> {
        PixelSource {
            data,
            stride,
            bytes_per_pixel,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    /// The rows of the `width` x `height` sub-rectangle at (`x`, `y`), each
    /// exactly `width * bytes_per_pixel` bytes long.
    pub fn rows(
        &self,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<impl Iterator<Item = &'a [u8]> + 'a, ImageError> {
        let out_of_bounds = ImageError::OutOfBounds {
            x,
            y,
            width,
            height,
        };
        if width == 0 || height == 0 {
            return Err(out_of_bounds);
        }
        let overflow = ImageError::Overflow {
            width,
            height,
            bytes_per_pixel: self.bytes_per_pixel,
        };

        let row_bytes = width
            .checked_mul(self.bytes_per_pixel)
            .ok_or(overflow)?;
        let first = y
            .checked_mul(self.stride)
            .and_then(|o| o.checked_add(x.checked_mul(self.bytes_per_pixel)?))
            .ok_or(overflow)?;
        let last_end = (height - 1)
            .checked_mul(self.stride)
            .and_then(|o| o.checked_add(first))
            .and_then(|o| o.checked_add(row_bytes))
            .ok_or(overflow)?;
        if last_end > self.data.len() || (height > 1 && row_bytes > self.stride) {
            return Err(out_of_bounds);
        }

        let data = self.data;
        let stride = self.stride;
        Ok((0..height).map(move |row| {
            let start = first + row * stride;
            &data[start..start + row_bytes]
        }))
    }
}

/// Hash the sub-rectangle one scanline at a time.
pub fn hash_pixels<'a>(rows: impl Iterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = Xxh32::new(0);
    for row in rows {
        hasher.update(row);
    }
    hasher.digest()
}

/// An image descriptor in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRef {
    offset: usize,
}

impl ImageRef {
    /// Rebuild a reference from the address a drawable carried.
    pub fn from_device(map: &AddressMap, address: u64) -> Result<ImageRef> {
        Ok(ImageRef {
            offset: map.to_offset(address)?,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn device_address(&self, map: &AddressMap) -> u64 {
        map.to_device(self.offset)
    }
}

/// Sizes of an image upload, checked for overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
    pub format: BitmapFormat,
    /// Bytes of pixel data; what the chunk carries after its header.
    pub data_bytes: usize,
}

impl ImageSize {
    pub fn new(width: usize, height: usize, bytes_per_pixel: usize) -> Result<ImageSize, ImageError> {
        let format = BitmapFormat::from_bytes_per_pixel(bytes_per_pixel)
            .ok_or(ImageError::UnsupportedFormat { bytes_per_pixel })?;
        let data_bytes = width
            .checked_mul(bytes_per_pixel)
            .and_then(|row| row.checked_mul(height))
            .filter(|&n| n <= u32::MAX as usize - chunk::HEADER_SIZE)
            .ok_or(ImageError::Overflow {
                width,
                height,
                bytes_per_pixel,
            })?;
        Ok(ImageSize {
            width,
            height,
            format,
            data_bytes,
        })
    }

    pub fn row_bytes(&self) -> usize {
        self.width * self.format.bytes_per_pixel()
    }

    pub fn chunk_bytes(&self) -> usize {
        chunk::HEADER_SIZE + self.data_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    hash: u32,
    size: ImageSize,
    ref_count: u32,
    image: usize,
    chunk: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Cached { hash: u32 },
    Uncached { chunk: usize },
}

/// What a lookup found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The pixels are already in device memory; the reference is counted.
    Hit(ImageRef),
    /// The pixels must be uploaded.
    Upload(Upload),
}

/// An upload the cache has agreed to, to be passed back to
/// [`ImageCache::upload`] with freshly allocated blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upload {
    pub hash: u32,
    pub size: ImageSize,
    /// Whether the image goes into the cache. False after a collision or
    /// for images over the size limit.
    pub cacheable: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Equal hash and dimensions, different pixels.
    pub collisions: u64,
    /// Images uploaded without a cache entry.
    pub uncached: u64,
}

pub struct ImageCache {
    buckets: Vec<Vec<CacheEntry>>,
    owners: HashMap<usize, Slot>,
    max_cached_bytes: Option<usize>,
    stats: CacheStats,
}

impl ImageCache {
    pub fn new(buckets: usize, max_cached_bytes: Option<usize>) -> ImageCache {
        let mut table = Vec::with_capacity(buckets.max(1));
        table.resize_with(buckets.max(1), Vec::new);
        ImageCache {
            buckets: table,
            owners: HashMap::new(),
            max_cached_bytes,
            stats: CacheStats::default(),
        }
    }

    fn bucket(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    /// Number of cache entries.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live images, cached or not.
    pub fn live_images(&self) -> usize {
        self.owners.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            ..self.stats.clone()
        }
    }

    /// How many drawables hold this image, or `None` if it is not cached.
    pub fn ref_count(&self, image: ImageRef) -> Option<u32> {
        match self.owners.get(&image.offset)? {
            Slot::Cached { hash } => self.buckets[self.bucket(*hash)]
                .iter()
                .find(|e| e.image == image.offset)
                .map(|e| e.ref_count),
            Slot::Uncached { .. } => None,
        }
    }

    /// Look for the pixels in the cache. A hit counts as a new reference.
    pub fn lookup(
        &mut self,
        shm: &ShmRegion,
        source: &PixelSource<'_>,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<Lookup> {
        let size = ImageSize::new(width, height, source.bytes_per_pixel())?;
        let hash = hash_pixels(source.rows(x, y, width, height)?);

        let cacheable = self
            .max_cached_bytes
            .map_or(true, |limit| size.data_bytes <= limit);
        if !cacheable {
            debug!("image {}x{} too large to cache", width, height);
            return Ok(Lookup::Upload(Upload {
                hash,
                size,
                cacheable,
            }));
        }

        let bucket = self.bucket(hash);
        let mut collided = false;
        for entry in self.buckets[bucket].iter_mut() {
            if entry.hash != hash || entry.size != size {
                continue;
            }
            if stored_pixels_match(shm, entry, source.rows(x, y, width, height)?)? {
                entry.ref_count += 1;
                self.stats.hits += 1;
                debug!(
                    "image cache hit {:#010x} ({}x{}), {} refs",
                    hash, width, height, entry.ref_count
                );
                return Ok(Lookup::Hit(ImageRef {
                    offset: entry.image,
                }));
            }
            collided = true;
        }

        if collided {
            self.stats.collisions += 1;
            warn!(
                "image hash collision on {:#010x} ({}x{}), uploading uncached",
                hash, width, height
            );
        } else {
            self.stats.misses += 1;
            debug!("image cache miss {:#010x} ({}x{})", hash, width, height);
        }
        Ok(Lookup::Upload(Upload {
            hash,
            size,
            cacheable: !collided,
        }))
    }

    /// Copy the pixels into `chunk`, describe them in `descriptor`, and
    /// record the image. Both blocks become owned by the cache until
    /// [`release`](ImageCache::release).
    #[allow(clippy::too_many_arguments)]
    pub fn upload(
        &mut self,
        shm: &ShmRegion,
        map: &AddressMap,
        chunk_block: Block,
        descriptor: Block,
        source: &PixelSource<'_>,
        x: usize,
        y: usize,
        upload: Upload,
    ) -> Result<ImageRef> {
        let size = upload.size;
        let chunk_offset = chunk_block.offset();
        let image_offset = descriptor.offset();
        if chunk_block.size() < size.chunk_bytes() || descriptor.size() < ImageHeader::SIZE {
            return Err(Error::Corruption(format!(
                "blocks too small for a {}x{} image",
                size.width, size.height
            )));
        }

        encode_chunk_header(shm, chunk_offset, size.data_bytes as u32)?;
        let mut hasher = Xxh32::new(0);
        let mut dest = chunk_offset + chunk::DATA;
        for row in source.rows(x, y, size.width, size.height)? {
            hasher.update(row);
            shm.write_bytes(dest, row)?;
            dest += size.row_bytes();
        }

        // The key has to describe the pixels the device actually got.
        let cacheable = upload.cacheable && hasher.digest() == upload.hash;
        if upload.cacheable && !cacheable {
            warn!(
                "pixels of {}x{} image changed since lookup, uploading uncached",
                size.width, size.height
            );
        }

        ImageHeader {
            id: if cacheable {
                upload.hash as u64
            } else {
                0
            },
            cacheable,
            width: size.width as u32,
            height: size.height as u32,
            format: size.format,
            data: map.to_device(chunk_offset),
        }
        .encode(shm, image_offset)?;

        // From here on the cache tracks both blocks by offset.
        let chunk_offset = chunk_block.into_offset();
        let image_offset = descriptor.into_offset();

        if cacheable {
            let bucket = self.bucket(upload.hash);
            self.buckets[bucket].push(CacheEntry {
                hash: upload.hash,
                size,
                ref_count: 1,
                image: image_offset,
                chunk: chunk_offset,
            });
            self.owners.insert(image_offset, Slot::Cached { hash: upload.hash });
            debug!(
                "cached image {:#x} under {:#010x} ({}x{})",
                image_offset, upload.hash, size.width, size.height
            );
        } else {
            self.owners.insert(
                image_offset,
                Slot::Uncached {
                    chunk: chunk_offset,
                },
            );
            self.stats.uncached += 1;
        }

        Ok(ImageRef {
            offset: image_offset,
        })
    }

    /// Find or upload an image, allocating straight from `pool`.
    ///
    /// Returns `Ok(None)` if the pool cannot fit the upload; nothing is
    /// leaked in that case.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create(
        &mut self,
        pool: &mut MemoryPool,
        shm: &ShmRegion,
        map: &AddressMap,
        source: &PixelSource<'_>,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<Option<ImageRef>> {
        let upload = match self.lookup(shm, source, x, y, width, height)? {
            Lookup::Hit(image) => return Ok(Some(image)),
            Lookup::Upload(upload) => upload,
        };

        let chunk_block = match pool.alloc(upload.size.chunk_bytes()) {
            Some(block) => block,
            None => return Ok(None),
        };
        let descriptor = match pool.alloc(ImageHeader::SIZE) {
            Some(block) => block,
            None => {
                pool.free(chunk_block)?;
                return Ok(None);
            }
        };

        self.upload(shm, map, chunk_block, descriptor, source, x, y, upload)
            .map(Some)
    }

    /// Drop one reference to `image`, freeing its memory with the last one.
    /// Uncached images are freed at once.
    pub fn release(&mut self, pool: &mut MemoryPool, image: ImageRef) -> Result<()> {
        let slot = *self
            .owners
            .get(&image.offset)
            .ok_or(ImageError::Unknown {
                offset: image.offset,
            })?;

        let chunk_offset = match slot {
            Slot::Uncached { chunk } => chunk,
            Slot::Cached { hash } => {
                let bucket = self.bucket(hash);
                let chain = &mut self.buckets[bucket];
                let index = chain
                    .iter()
                    .position(|e| e.image == image.offset)
                    .ok_or_else(|| {
                        Error::Corruption(format!(
                            "image {:#x} is missing from its hash chain",
                            image.offset
                        ))
                    })?;

                chain[index].ref_count -= 1;
                if chain[index].ref_count > 0 {
                    return Ok(());
                }
                let entry = chain.swap_remove(index);
                debug!("evicted image {:#x} ({:#010x})", entry.image, entry.hash);
                entry.chunk
            }
        };

        self.owners.remove(&image.offset);
        pool.free_offset(chunk_offset)?;
        pool.free_offset(image.offset)?;
        Ok(())
    }

    /// Forget every image without freeing anything. Only for use right after
    /// the pool itself has been reset.
    pub fn clear(&mut self) {
        for chain in self.buckets.iter_mut() {
            chain.clear();
        }
        self.owners.clear();
    }
}

fn stored_pixels_match<'a>(
    shm: &ShmRegion,
    entry: &CacheEntry,
    rows: impl Iterator<Item = &'a [u8]>,
) -> Result<bool> {
    let mut offset = entry.chunk + chunk::DATA;
    for row in rows {
        if !shm.bytes_eq(offset, row)? {
            return Ok(false);
        }
        offset += row.len();
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::layout::image;

    struct Fixture {
        shm: ShmRegion,
        map: AddressMap,
        pool: MemoryPool,
        cache: ImageCache,
    }

    fn fixture(pool_size: usize) -> Fixture {
        let shm = ShmRegion::new(pool_size);
        Fixture {
            map: AddressMap::new(0x8000_0000, pool_size),
            shm,
            pool: MemoryPool::new(0, pool_size),
            cache: ImageCache::new(64, None),
        }
    }

    impl Fixture {
        fn get(&mut self, source: &PixelSource<'_>, w: usize, h: usize) -> ImageRef {
            self.cache
                .get_or_create(&mut self.pool, &self.shm, &self.map, source, 0, 0, w, h)
                .unwrap()
                .expect("pool should have room")
        }
    }

    fn solid(width: usize, height: usize, pixel: u32) -> Vec<u8> {
        (0..width * height).flat_map(|_| pixel.to_le_bytes()).collect()
    }

    #[test]
    fn test_rows_of_sub_rectangle() {
        // 4x3 pixels, one byte each, stride 5
        let data: Vec<u8> = (0..15).collect();
        let source = PixelSource::new(&data, 5, 1);
        let rows: Vec<&[u8]> = source.rows(1, 1, 2, 2).unwrap().collect();
        assert_eq!(rows, vec![&[6u8, 7][..], &[11, 12][..]]);

        assert!(source.rows(3, 2, 3, 1).is_err());
        assert!(source.rows(0, 0, 0, 1).is_err());
        assert!(source.rows(0, 0, 6, 2).is_err());
        assert!(matches!(
            source.rows(usize::MAX, 0, 1, 1),
            Err(ImageError::Overflow { .. })
        ));
    }

    #[test]
    fn test_hash_is_per_content() {
        let a = solid(4, 4, 0xff00_00ff);
        let b = solid(4, 4, 0xff00_00fe);
        let ha = hash_pixels(PixelSource::new(&a, 16, 4).rows(0, 0, 4, 4).unwrap());
        let hb = hash_pixels(PixelSource::new(&b, 16, 4).rows(0, 0, 4, 4).unwrap());
        assert_ne!(ha, hb);

        // Same pixels at a different stride hash the same
        let mut wide = vec![0u8; 4 * 32];
        for row in 0..4 {
            wide[row * 32..row * 32 + 16].copy_from_slice(&a[row * 16..row * 16 + 16]);
        }
        let hw = hash_pixels(PixelSource::new(&wide, 32, 4).rows(0, 0, 4, 4).unwrap());
        assert_eq!(ha, hw);
    }

    #[test]
    fn test_same_block_hundred_times() {
        let mut fx = fixture(64 * 1024);
        let pixels = solid(16, 16, 0x00ab_cdef);
        let source = PixelSource::new(&pixels, 64, 4);

        let first = fx.get(&source, 16, 16);
        let live = fx.pool.live_blocks();
        assert_eq!(live, 2);
        for _ in 1..100 {
            assert_eq!(fx.get(&source, 16, 16), first);
        }
        assert_eq!(fx.pool.live_blocks(), live);
        assert_eq!(fx.cache.ref_count(first), Some(100));

        let stats = fx.cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 99);

        // The descriptor tells the device to cache it under the hash
        let offset = first.offset();
        assert_eq!(fx.shm.read_u8(offset + image::FLAGS).unwrap(), image::FLAG_CACHE);
        let hash = fx.shm.read_u64(offset + image::ID).unwrap();
        assert_ne!(hash, 0);
        let data = fx.shm.read_u64(offset + image::BITMAP_DATA).unwrap();
        let chunk_offset = fx.map.to_offset(data).unwrap();
        assert_eq!(fx.shm.read_u32(chunk_offset).unwrap(), 16 * 16 * 4);
        assert!(fx.shm.bytes_eq(chunk_offset + chunk::DATA, &pixels[..64]).unwrap());
    }

    #[test]
    fn test_release_lifecycle() {
        let mut fx = fixture(16 * 1024);
        let pixels = solid(8, 8, 7);
        let source = PixelSource::new(&pixels, 32, 4);
        let free_before = fx.pool.stats().1.free.size;

        let n = 5;
        let image = fx.get(&source, 8, 8);
        for _ in 1..n {
            fx.get(&source, 8, 8);
        }
        for _ in 0..n - 1 {
            fx.cache.release(&mut fx.pool, image).unwrap();
        }
        assert_eq!(fx.cache.ref_count(image), Some(1));
        assert_eq!(fx.cache.len(), 1);

        fx.cache.release(&mut fx.pool, image).unwrap();
        assert_eq!(fx.cache.ref_count(image), None);
        assert!(fx.cache.is_empty());
        assert_eq!(fx.pool.live_blocks(), 0);
        assert_eq!(fx.pool.stats().1.free.size, free_before);

        // Once more is an error, not a double free
        assert!(matches!(
            fx.cache.release(&mut fx.pool, image),
            Err(Error::Image(ImageError::Unknown { .. }))
        ));
    }

    #[test]
    fn test_collision_uploads_fresh_copy() {
        let mut fx = fixture(16 * 1024);
        let pixels = solid(4, 4, 0x1234_5678);
        let source = PixelSource::new(&pixels, 16, 4);
        let cached = fx.get(&source, 4, 4);

        // Make the stored copy differ from the source without touching the
        // cache's idea of its hash.
        let data = fx.shm.read_u64(cached.offset() + image::BITMAP_DATA).unwrap();
        let chunk_offset = fx.map.to_offset(data).unwrap();
        fx.shm.write_u8(chunk_offset + chunk::DATA + 5, 0).unwrap();

        let fresh = fx.get(&source, 4, 4);
        assert_ne!(fresh, cached);
        assert_eq!(fx.cache.ref_count(cached), Some(1));
        assert_eq!(fx.cache.ref_count(fresh), None);
        assert_eq!(fx.shm.read_u8(fresh.offset() + image::FLAGS).unwrap(), 0);
        assert_eq!(fx.shm.read_u64(fresh.offset() + image::ID).unwrap(), 0);

        let stats = fx.cache.stats();
        assert_eq!(stats.collisions, 1);
        assert_eq!(stats.uncached, 1);
        assert_eq!(stats.entries, 1);

        fx.cache.release(&mut fx.pool, fresh).unwrap();
        fx.cache.release(&mut fx.pool, cached).unwrap();
        assert_eq!(fx.pool.live_blocks(), 0);
    }

    #[test]
    fn test_same_hash_different_size_is_a_miss() {
        let mut fx = fixture(16 * 1024);
        let pixels = solid(8, 2, 0);
        // 8x2 and 4x4 of identical bytes hash alike
        let wide = PixelSource::new(&pixels, 32, 4);
        let square = PixelSource::new(&pixels, 16, 4);
        let a = fx.get(&wide, 8, 2);
        let b = fx.get(&square, 4, 4);
        assert_ne!(a, b);
        assert_eq!(fx.cache.len(), 2);
        assert_eq!(fx.cache.stats().collisions, 0);
    }

    #[test]
    fn test_large_images_bypass_cache() {
        let mut fx = fixture(16 * 1024);
        fx.cache = ImageCache::new(64, Some(256));
        let pixels = solid(16, 16, 1);
        let source = PixelSource::new(&pixels, 64, 4);
        let a = fx.get(&source, 16, 16);
        let b = fx.get(&source, 16, 16);
        assert_ne!(a, b);
        assert!(fx.cache.is_empty());
        assert_eq!(fx.cache.live_images(), 2);
        // Small ones still hit
        let c = fx.get(&source, 4, 4);
        assert_eq!(fx.get(&source, 4, 4), c);
    }

    #[test]
    fn test_exhausted_pool_leaks_nothing() {
        let mut fx = fixture(256);
        let pixels = solid(8, 8, 3);
        let source = PixelSource::new(&pixels, 32, 4);
        let result = fx
            .cache
            .get_or_create(&mut fx.pool, &fx.shm, &fx.map, &source, 0, 0, 8, 8)
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(fx.pool.live_blocks(), 0);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut fx = fixture(16 * 1024);
        let pixels = solid(4, 4, 9);
        let source = PixelSource::new(&pixels, 16, 4);
        let image = fx.get(&source, 4, 4);
        fx.pool.free_all();
        fx.cache.clear();
        assert!(fx.cache.is_empty());
        assert_eq!(fx.cache.ref_count(image), None);
        assert!(fx.cache.release(&mut fx.pool, image).is_err());
    }

    #[test]
    fn test_only_device_formats_upload() {
        let mut fx = fixture(16 * 1024);
        let pixels = vec![0x33u8; 4 * 4 * 3];
        let source = PixelSource::new(&pixels, 12, 3);
        assert!(matches!(
            fx.cache.get_or_create(&mut fx.pool, &fx.shm, &fx.map, &source, 0, 0, 4, 4),
            Err(Error::Image(ImageError::UnsupportedFormat { bytes_per_pixel: 3 }))
        ));
        assert_eq!(fx.pool.live_blocks(), 0);

        let pixels = vec![0x33u8; 4 * 4 * 2];
        let source = PixelSource::new(&pixels, 8, 2);
        let image = fx.get(&source, 4, 4);
        assert_eq!(
            fx.shm.read_u8(image.offset() + image::BITMAP_FORMAT).unwrap(),
            image::FORMAT_16BIT
        );
        assert_eq!(fx.shm.read_u32(image.offset() + image::BITMAP_STRIDE).unwrap(), 8);
    }

    #[test]
    fn test_upload_keys_by_copied_pixels() {
        let mut fx = fixture(16 * 1024);
        let before = solid(4, 4, 0x0101_0101);
        let after = solid(4, 4, 0x0202_0202);
        let looked_up = PixelSource::new(&before, 16, 4);
        let copied = PixelSource::new(&after, 16, 4);

        let upload = match fx.cache.lookup(&fx.shm, &looked_up, 0, 0, 4, 4).unwrap() {
            Lookup::Upload(upload) => upload,
            Lookup::Hit(_) => panic!("empty cache hit"),
        };
        assert!(upload.cacheable);
        let chunk_block = fx.pool.alloc(upload.size.chunk_bytes()).unwrap();
        let descriptor = fx.pool.alloc(ImageHeader::SIZE).unwrap();
        let image = fx
            .cache
            .upload(&fx.shm, &fx.map, chunk_block, descriptor, &copied, 0, 0, upload)
            .unwrap();

        // The pixels changed under us, so they must not be cached under the
        // old hash.
        assert_eq!(fx.cache.ref_count(image), None);
        assert!(fx.cache.is_empty());
        assert_eq!(fx.shm.read_u64(image.offset() + image::ID).unwrap(), 0);

        let data = fx.shm.read_u64(image.offset() + image::BITMAP_DATA).unwrap();
        let chunk_offset = fx.map.to_offset(data).unwrap();
        assert_eq!(
            fx.shm.read_u32(chunk_offset + chunk::DATA).unwrap(),
            0x0202_0202
        );

        fx.cache.release(&mut fx.pool, image).unwrap();
        assert_eq!(fx.pool.live_blocks(), 0);
    }
}
