//! Host memory posing as physical RAM for unit tests
//!
//! Physical address 0 maps to the start of a leaked, page-aligned buffer, so
//! the buffer address doubles as the direct-map offset. Frame 0 stands in for
//! the kernel image.

use alloc::{boxed::Box, vec};
use x86_64::{structures::paging::PhysFrame, PhysAddr, VirtAddr};

use crate::{
    constants::memory::FRAME_SIZE,
    memory::{frame_allocator::FrameAllocator, memory_map::MemoryLayout},
};

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct RamFrame([u8; FRAME_SIZE]);

pub struct TestRam {
    base: VirtAddr,
    frames: usize,
}

impl TestRam {
    pub fn new(frames: usize) -> Self {
        let ram: &'static mut [RamFrame] =
            Box::leak(vec![RamFrame([0; FRAME_SIZE]); frames].into_boxed_slice());
        TestRam {
            base: VirtAddr::new(ram.as_mut_ptr() as u64),
            frames,
        }
    }

    pub fn hhdm_offset(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        (self.frames * FRAME_SIZE) as u64
    }

    pub fn frame(&self, index: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((index * FRAME_SIZE) as u64))
    }

    pub fn layout(&self) -> MemoryLayout {
        MemoryLayout::from_regions([(0, self.size(), true)], PhysAddr::new(FRAME_SIZE as u64))
            .expect("test RAM has usable frames")
    }

    /// A frame allocator already bootstrapped over this RAM.
    pub fn frame_allocator(&self) -> FrameAllocator {
        let layout = self.layout();
        let frames = FrameAllocator::new(self.base, &layout);
        unsafe { frames.bootstrap(&layout) };
        frames
    }
}
