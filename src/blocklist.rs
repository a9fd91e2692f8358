use core::fmt;
use core::ops::Range;

use crate::error::PoolError;

/// A free extent of the pool: `size` bytes starting at `start`.
///
/// Extents describe device memory by offset only. Nothing is written into
/// the free memory itself, since the device can scribble over any byte of
/// its RAM; the free list has to live where only we can reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    start: usize,
    size: usize,
}

/// An enum for easy comparison of extents and their order
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

impl FreeExtent {
    pub fn new(start: usize, size: usize) -> FreeExtent {
        FreeExtent { start, size }
    }

    /// The offset range covered by this extent.
    pub fn as_range(&self) -> Range<usize> {
        self.start..(self.start + self.size)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// The size of the extent, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Compare two extents to see how they are ordered.
    fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    /// Split `size` bytes off the end of this extent, and return the range
    /// split off.
    ///
    /// Handing out the tail keeps `start` fixed, so the list stays sorted
    /// without moving anything.
    fn split(&mut self, size: usize) -> Range<usize> {
        debug_assert!(size < self.size);
        self.size -= size;
        let start = self.start + self.size;
        start..(start + size)
    }
}

/// A `BlockList` is the sorted list of free extents of a pool.
///
/// It maintains a few internal invariants:
///
/// - Extents are sorted by offset.
/// - No two extents overlap.
/// - No two extents are precisely adjacent (those are merged on insertion).
#[derive(Default)]
pub struct BlockList {
    extents: Vec<FreeExtent>,
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for extent in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "FreeExtent({:#x}, {})", extent.start, extent.size)?;
        }

        write!(f, ")")
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = &'list FreeExtent;
    type IntoIter = core::slice::Iter<'list, FreeExtent>;

    fn into_iter(self) -> Self::IntoIter {
        self.extents.iter()
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of extents overlapping other extents.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of extents that are directly adjacent to each other, and not
    /// merged. This shouldn't happen, but isn't totally corrupt.
    pub adjacents: usize,
    /// Number of extents that do not start before their successor.
    pub out_of_orders: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.out_of_orders == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of free extents.
    pub length: usize,
    /// Total free bytes.
    pub size: usize,
    /// The largest single allocation that could succeed right now.
    pub largest: usize,
}

impl BlockList {
    /// A list with one extent covering `range`.
    pub fn with_range(range: Range<usize>) -> BlockList {
        let mut list = BlockList::default();
        list.reset(range);
        list
    }

    /// Forget every extent and make `range` the only free one.
    pub fn reset(&mut self, range: Range<usize>) {
        self.extents.clear();
        if !range.is_empty() {
            self.extents.push(FreeExtent::new(range.start, range.len()));
        }
    }

    pub fn iter(&self) -> core::slice::Iter<'_, FreeExtent> {
        self.extents.iter()
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<&FreeExtent> = None;
        for next in self.iter() {
            match previous.map(|p| p.relation(next)) {
                Some(Relation::Before) => {
                    // This is valid, do nothing.
                }
                Some(Relation::AdjacentBefore) => {
                    // Right order, but these should be merged.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) => {
                    // Wrong order, and these should be merged.
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    // This is the first in the list. Valid, do nothing.
                }
            }

            stats.length += 1;
            stats.size += next.size();
            stats.largest = stats.largest.max(next.size());
            previous = Some(next);
        }

        (validity, stats)
    }

    /// Find and remove a range of `size` bytes from the list, first fit.
    pub fn pop_size(&mut self, size: usize) -> Option<Range<usize>> {
        let index = self.extents.iter().position(|e| e.size() >= size)?;

        if self.extents[index].size() == size {
            // This extent is just right - take it out of the list entirely
            log::trace!("  Found exactly sized extent at {:#x}", self.extents[index].start);
            return Some(self.extents.remove(index).as_range());
        }

        // This extent is bigger than we need, split it
        let split = self.extents[index].split(size);
        log::trace!(
            "  Split {} bytes off extent at {:#x} to get {:?}",
            size,
            self.extents[index].start,
            split,
        );
        Some(split)
    }

    /// Return a range to the list, merging with its neighbours where they
    /// touch. Returns the number of merges performed.
    pub fn add_block(&mut self, range: Range<usize>) -> Result<usize, PoolError> {
        let new_extent = FreeExtent::new(range.start, range.len());
        let overlap = PoolError::Overlap {
            offset: range.start,
            size: range.len(),
        };

        // We keep the list sorted by offset, so the new extent goes right
        // before the first extent that starts after it.
        let index = self.extents.partition_point(|e| e.start < new_extent.start);

        let merge_previous = match index.checked_sub(1).map(|i| self.extents[i].relation(&new_extent)) {
            None | Some(Relation::Before) => false,
            Some(Relation::AdjacentBefore) => true,
            // The previous extent starts first, so anything else overlaps
            Some(_) => return Err(overlap),
        };

        let merge_next = match self.extents.get(index).map(|next| new_extent.relation(next)) {
            None | Some(Relation::Before) => false,
            Some(Relation::AdjacentBefore) => true,
            Some(_) => return Err(overlap),
        };

        match (merge_previous, merge_next) {
            (true, true) => {
                // The new extent exactly fills the gap between two free
                // extents; all three become one.
                let next = self.extents.remove(index);
                self.extents[index - 1].size += new_extent.size + next.size;
                Ok(2)
            }
            (true, false) => {
                self.extents[index - 1].size += new_extent.size;
                Ok(1)
            }
            (false, true) => {
                let next = &mut self.extents[index];
                next.start = new_extent.start;
                next.size += new_extent.size;
                Ok(1)
            }
            (false, false) => {
                self.extents.insert(index, new_extent);
                Ok(0)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}
