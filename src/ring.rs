//! Producer/consumer rings in shared memory.
//!
//! A ring is a 20-byte header followed directly by `capacity` fixed-size
//! slots. The producer and consumer indices are free-running `u32` counters;
//! a slot is addressed by `index & (capacity - 1)`, so the capacity must be a
//! power of two. The ring is empty when the two indices are equal and full
//! when they are `capacity` apart.
//!
//! The same type serves both directions. We push onto the command and cursor
//! rings and pop off the release ring; an in-process device model attaches to
//! the same memory and does the opposite.
//!
//! Slot contents are always written before the producer index that publishes
//! them (a `Release` store), and read only after the index has been observed
//! with an `Acquire` load.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;

use log::trace;

use crate::error::{RingError, ShmError};
use crate::layout::{ring_header, Command, CommandType};
use crate::shm::ShmRegion;

/// A fixed-size value that can live in a ring slot.
pub trait RingElement: Sized {
    /// Slot size in bytes.
    const SIZE: usize;

    fn store(&self, shm: &ShmRegion, offset: usize) -> Result<(), ShmError>;
    fn load(shm: &ShmRegion, offset: usize) -> Result<Self, RingError>;
}

impl RingElement for Command {
    const SIZE: usize = Command::SIZE;

    fn store(&self, shm: &ShmRegion, offset: usize) -> Result<(), ShmError> {
        shm.write_u64(offset, self.data)?;
        shm.write_u32(offset + 8, self.kind as u32)?;
        shm.write_u32(offset + 12, 0)
    }

    fn load(shm: &ShmRegion, offset: usize) -> Result<Self, RingError> {
        let data = shm.read_u64(offset)?;
        let kind = shm.read_u32(offset + 8)?;
        let kind = CommandType::from_u32(kind).ok_or(RingError::UnknownCommand { kind })?;
        Ok(Command { data, kind })
    }
}

/// Release ring slots hold a bare release id.
impl RingElement for u64 {
    const SIZE: usize = 8;

    fn store(&self, shm: &ShmRegion, offset: usize) -> Result<(), ShmError> {
        shm.write_u64(offset, *self)
    }

    fn load(shm: &ShmRegion, offset: usize) -> Result<Self, RingError> {
        Ok(shm.read_u64(offset)?)
    }
}

pub struct Ring<T> {
    shm: ShmRegion,
    header: usize,
    slots: usize,
    capacity: u32,
    _element: PhantomData<T>,
}

impl<T: RingElement> core::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("header", &self.header)
            .field("capacity", &self.capacity)
            .field("producer", &self.producer().ok())
            .field("consumer", &self.consumer().ok())
            .finish()
    }
}

impl<T: RingElement> Ring<T> {
    /// Bytes taken by a ring of `capacity` elements, header included.
    pub const fn footprint(capacity: u32) -> usize {
        ring_header::SIZE + capacity as usize * T::SIZE
    }

    /// Use the ring whose header is at `header`, without touching it.
    pub fn attach(shm: ShmRegion, header: usize, capacity: u32) -> Result<Ring<T>, RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::BadCapacity { capacity });
        }
        shm.check(header, Self::footprint(capacity))?;
        if header % 4 != 0 {
            return Err(ShmError::Misaligned { offset: header }.into());
        }

        Ok(Ring {
            shm,
            header,
            slots: header + ring_header::SIZE,
            capacity,
            _element: PhantomData,
        })
    }

    /// Initialise an empty ring at `header`.
    ///
    /// The peer is asked for a notification when the producer index reaches
    /// `notify_threshold`; zero disables notification.
    pub fn create(
        shm: ShmRegion,
        header: usize,
        capacity: u32,
        notify_threshold: u32,
    ) -> Result<Ring<T>, RingError> {
        let ring = Self::attach(shm, header, capacity)?;
        ring.shm
            .store_u32(header + ring_header::NUM_ITEMS, capacity, Ordering::Relaxed)?;
        ring.reset(notify_threshold)?;
        Ok(ring)
    }

    /// Empty the ring. Only meaningful while the peer is not using it, e.g.
    /// right after a device reset.
    pub fn reset(&self, notify_threshold: u32) -> Result<(), RingError> {
        let h = self.header;
        self.shm.store_u32(h + ring_header::CONS, 0, Ordering::Relaxed)?;
        self.shm
            .store_u32(h + ring_header::NOTIFY_ON_PROD, notify_threshold, Ordering::Relaxed)?;
        self.shm.store_u32(h + ring_header::NOTIFY_ON_CONS, 0, Ordering::Relaxed)?;
        self.shm.store_u32(h + ring_header::PROD, 0, Ordering::Release)?;
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn header(&self) -> usize {
        self.header
    }

    pub fn producer(&self) -> Result<u32, ShmError> {
        self.shm
            .load_u32(self.header + ring_header::PROD, Ordering::Acquire)
    }

    pub fn consumer(&self) -> Result<u32, ShmError> {
        self.shm
            .load_u32(self.header + ring_header::CONS, Ordering::Acquire)
    }

    // Read both indices and check they make sense.
    fn indices(&self) -> Result<(u32, u32), RingError> {
        let producer = self.producer()?;
        let consumer = self.consumer()?;
        if producer.wrapping_sub(consumer) > self.capacity {
            return Err(RingError::Corrupt { producer, consumer });
        }
        Ok((producer, consumer))
    }

    fn slot(&self, index: u32) -> usize {
        self.slots + (index & (self.capacity - 1)) as usize * T::SIZE
    }

    /// Entries pushed but not yet popped.
    pub fn len(&self) -> Result<u32, RingError> {
        let (producer, consumer) = self.indices()?;
        Ok(producer.wrapping_sub(consumer))
    }

    pub fn is_empty(&self) -> Result<bool, RingError> {
        Ok(self.len()? == 0)
    }

    pub fn is_full(&self) -> Result<bool, RingError> {
        Ok(self.len()? == self.capacity)
    }

    /// Append an element. Returns whether the peer asked to be notified of
    /// this push.
    ///
    /// A full ring is refused with [`RingError::Full`]; nothing is
    /// overwritten.
    pub fn push(&mut self, element: &T) -> Result<bool, RingError> {
        let (producer, consumer) = self.indices()?;
        if producer.wrapping_sub(consumer) == self.capacity {
            return Err(RingError::Full {
                capacity: self.capacity,
            });
        }

        element.store(&self.shm, self.slot(producer))?;
        let producer = producer.wrapping_add(1);
        // Publishes the slot written above.
        self.shm
            .store_u32(self.header + ring_header::PROD, producer, Ordering::Release)?;

        let notify_on = self
            .shm
            .load_u32(self.header + ring_header::NOTIFY_ON_PROD, Ordering::Acquire)?;
        let notify = notify_on != 0 && producer == notify_on;
        trace!(
            "ring@{:#x}: push -> prod {} cons {}{}",
            self.header,
            producer,
            consumer,
            if notify { " (notify)" } else { "" }
        );
        Ok(notify)
    }

    /// Take the oldest element, or `None` if the ring is empty. Never blocks.
    pub fn pop(&mut self) -> Result<Option<T>, RingError> {
        let (producer, consumer) = self.indices()?;
        if producer == consumer {
            return Ok(None);
        }

        let element = T::load(&self.shm, self.slot(consumer))?;
        let consumer = consumer.wrapping_add(1);
        self.shm
            .store_u32(self.header + ring_header::CONS, consumer, Ordering::Release)?;
        trace!(
            "ring@{:#x}: pop -> prod {} cons {}",
            self.header,
            producer,
            consumer
        );
        Ok(Some(element))
    }

    /// Block until the peer has consumed everything pushed so far.
    pub fn wait_idle(&self) -> Result<(), RingError> {
        while !self.is_empty()? {
            std::thread::yield_now();
        }
        Ok(())
    }
}
