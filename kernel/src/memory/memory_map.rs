//! Boot memory layout
//!
//! - Reduces the bootloader memory map to the bounds the frame allocator
//!   bootstraps over: the end of the kernel image, the top of usable memory,
//!   and the unusable holes in between
//! - Runs before the kernel heap exists, so nothing here allocates

use arrayvec::ArrayVec;
use limine::memory_map::{Entry, EntryType};
use x86_64::PhysAddr;

use crate::{
    constants::memory::{FRAME_SIZE, MAX_MEMORY_HOLES},
    warn,
};

/// A physical range above the kernel image that must never be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    pub base: PhysAddr,
    pub length: u64,
}

impl Hole {
    pub fn end(&self) -> PhysAddr {
        self.base + self.length
    }
}

/// Physical memory as seen by the frame allocator.
///
/// * `first_free`: first frame past the kernel image
/// * `total_size`: top of usable memory; every frame index is below `total_size / FRAME_SIZE`
/// * `holes`: unusable ranges between `first_free` and `total_size`, ascending
#[derive(Debug, Clone)]
pub struct MemoryLayout {
    pub first_free: PhysAddr,
    pub total_size: u64,
    pub holes: ArrayVec<Hole, MAX_MEMORY_HOLES>,
}

impl MemoryLayout {
    /// Builds the layout from the entries of the Limine memory map response.
    pub fn from_limine(entries: &[&Entry], kernel_end: PhysAddr) -> Option<Self> {
        Self::from_regions(
            entries.iter().map(|entry| {
                (
                    entry.base,
                    entry.length,
                    entry.entry_type == EntryType::USABLE,
                )
            }),
            kernel_end,
        )
    }

    /// Builds the layout from `(base, length, usable)` triples sorted by base.
    ///
    /// # Returns
    /// `None` if no usable frame lies above `kernel_end`
    pub fn from_regions<I>(regions: I, kernel_end: PhysAddr) -> Option<Self>
    where
        I: IntoIterator<Item = (u64, u64, bool)>,
    {
        let frame = FRAME_SIZE as u64;
        let mut first_free = kernel_end.align_up(frame);
        let mut holes = ArrayVec::new();
        let mut covered = first_free.as_u64();
        let mut found_usable = false;

        for (base, length, usable) in regions {
            if !usable {
                continue;
            }
            // usable ranges shrink to whole frames
            let start = base.next_multiple_of(frame);
            let end = (base + length) / frame * frame;
            if end <= covered || start >= end {
                continue;
            }

            if !found_usable && start > covered {
                // nothing usable directly above the kernel image
                first_free = PhysAddr::new(start);
                covered = start;
            }
            if start > covered {
                let hole = Hole {
                    base: PhysAddr::new(covered),
                    length: start - covered,
                };
                if holes.try_push(hole).is_err() {
                    warn!("Too many memory holes, ignoring memory above {:#x}", covered);
                    break;
                }
            }

            found_usable = true;
            covered = end;
        }

        if !found_usable {
            return None;
        }

        Some(MemoryLayout {
            first_free,
            total_size: covered,
            holes,
        })
    }

    /// End of the contiguous usable run that starts at `first_free`.
    ///
    /// The early-boot stealer hands out frames below this address only.
    pub fn boot_limit(&self) -> PhysAddr {
        self.holes
            .first()
            .map(|hole| hole.base)
            .unwrap_or(PhysAddr::new(self.total_size))
    }

    /// Usable `[start, end)` runs from `first_free` up, in ascending order.
    pub fn usable_runs(&self) -> impl Iterator<Item = (PhysAddr, PhysAddr)> + '_ {
        let starts = core::iter::once(self.first_free).chain(self.holes.iter().map(Hole::end));
        let ends = self
            .holes
            .iter()
            .map(|hole| hole.base)
            .chain(core::iter::once(PhysAddr::new(self.total_size)));
        starts.zip(ends).filter(|(start, end)| start < end)
    }

    /// Number of frames tracked by the allocator.
    pub fn frame_count(&self) -> usize {
        self.total_size as usize / FRAME_SIZE
    }
}
