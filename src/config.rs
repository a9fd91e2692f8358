use std::time::Duration;

use crate::layout::Rect;

/// Tunables for a [`Session`](crate::session::Session).
///
/// Everything about where things live in device memory comes from the ROM;
/// this only covers policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Device-visible address of offset 0 of device RAM.
    pub ram_physical_base: u64,
    /// Bytes per pixel of the current mode; 2 or 4.
    pub bytes_per_pixel: usize,
    /// Size of the pages counted by the ROM's `num_io_pages`.
    pub page_size: usize,
    pub image_cache_buckets: usize,
    /// Images bigger than this are uploaded without caching.
    pub max_cached_image_bytes: Option<usize>,
    /// Consecutive unproductive recovery rounds before giving up.
    pub oom_retry_limit: u32,
    pub oom_retry_interval: Duration,
    /// Exit the process on fatal exhaustion instead of returning
    /// [`Error::OutOfMemory`](crate::error::Error::OutOfMemory).
    pub abort_on_exhaustion: bool,
    /// Area the device is asked to redraw when memory runs out.
    pub update_area: Rect,
    pub command_notify_threshold: u32,
    pub cursor_notify_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ram_physical_base: 0,
            bytes_per_pixel: 4,
            page_size: 4096,
            image_cache_buckets: 4096,
            max_cached_image_bytes: None,
            oom_retry_limit: 1000,
            oom_retry_interval: Duration::from_millis(10),
            abort_on_exhaustion: true,
            update_area: Rect::new(0, 0, 800, 1280),
            command_notify_threshold: 1,
            cursor_notify_threshold: 1,
        }
    }
}

impl SessionConfig {
    pub fn with_ram_physical_base(mut self, base: u64) -> Self {
        self.ram_physical_base = base;
        self
    }

    pub fn with_bytes_per_pixel(mut self, bytes_per_pixel: usize) -> Self {
        self.bytes_per_pixel = bytes_per_pixel;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_image_cache_buckets(mut self, buckets: usize) -> Self {
        self.image_cache_buckets = buckets.max(1);
        self
    }

    pub fn with_max_cached_image_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_cached_image_bytes = limit;
        self
    }

    pub fn with_oom_retry(mut self, limit: u32, interval: Duration) -> Self {
        self.oom_retry_limit = limit;
        self.oom_retry_interval = interval;
        self
    }

    pub fn with_abort_on_exhaustion(mut self, abort: bool) -> Self {
        self.abort_on_exhaustion = abort;
        self
    }

    pub fn with_update_area(mut self, area: Rect) -> Self {
        self.update_area = area;
        self
    }

    pub fn with_notify_thresholds(mut self, command: u32, cursor: u32) -> Self {
        self.command_notify_threshold = command;
        self.cursor_notify_threshold = cursor;
        self
    }
}
