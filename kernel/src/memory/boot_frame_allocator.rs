//! Boot Frame Allocator
//!
//! - Provides a method to allocate physical memory before the frame map exists
//! - Steals contiguous PhysFrames upward from the end of the kernel image
//! - Stolen frames are never returned; once the frame map is built they sit
//!   below `first_free` and are permanently fixed

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::constants::memory::FRAME_SIZE;

/// Boot frame allocator, necessary to hand out frames before bookkeeping is set up
///
/// * `next`: the next frame to steal
/// * `limit`: end of the contiguous usable run the stealer may consume
/// * `stolen_count`: the number of frames stolen so far
#[derive(Debug)]
pub struct BootFrameAllocator {
    next: PhysAddr,
    limit: PhysAddr,
    stolen_count: usize,
}

impl BootFrameAllocator {
    /// Creates a stealer over `[first_free, limit)`.
    pub fn new(first_free: PhysAddr, limit: PhysAddr) -> Self {
        BootFrameAllocator {
            next: first_free.align_up(FRAME_SIZE as u64),
            limit,
            stolen_count: 0,
        }
    }

    /// Steals `count` contiguous frames
    ///
    /// # Returns
    /// The first stolen frame, or None if the run does not fit below `limit`
    pub fn steal(&mut self, count: usize) -> Option<PhysFrame> {
        if count == 0 {
            return None;
        }
        let bytes = (count * FRAME_SIZE) as u64;
        let end = self.next.as_u64().checked_add(bytes)?;
        if end > self.limit.as_u64() {
            return None;
        }

        let frame = PhysFrame::containing_address(self.next);
        self.next = PhysAddr::new(end);
        self.stolen_count += count;
        Some(frame)
    }

    /// First address that has not been stolen; the frame map starts here.
    pub fn first_free(&self) -> PhysAddr {
        self.next
    }

    pub fn stolen_count(&self) -> usize {
        self.stolen_count
    }

    /// Number of frames left between `next` and `limit`.
    pub fn remaining(&self) -> usize {
        (self.limit.as_u64().saturating_sub(self.next.as_u64()) as usize) / FRAME_SIZE
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    /// Steal the single next available frame
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.steal(1)
    }
}

impl FrameDeallocator<Size4KiB> for BootFrameAllocator {
    /// Stolen memory is gone for good
    unsafe fn deallocate_frame(&mut self, _frame: PhysFrame<Size4KiB>) {
        panic!("Cannot deallocate frames for boot frame allocator")
    }
}
