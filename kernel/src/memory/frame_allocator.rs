//! Physical frame allocator
//!
//! - Tracks every physical frame in a frame map stored in the first usable
//!   physical run above the kernel image that can hold it
//! - Hands out contiguous runs of frames (first fit) and reclaims them by
//!   their head frame
//! - Delegates to the boot stealer until the frame map has been built
//!
//! One lock covers every operation: two allocations may never overlap, and
//! the allocator is shared by every process.

use core::{mem::size_of, ptr};

use spin::{Mutex, MutexGuard};
use x86_64::{
    structures::paging::{
        FrameAllocator as PagingFrameAllocator, FrameDeallocator, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::FRAME_SIZE,
    info,
    memory::{boot_frame_allocator::BootFrameAllocator, memory_map::MemoryLayout},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    Free,
    /// Kernel image, frame map, firmware holes. Never allocated or freed.
    Fixed,
    InUse,
}

/// Frame map entry, one per physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub state: FrameState,
    pub is_block_head: bool,
    /// Frames in the allocation this frame belongs to, 0 when not allocated.
    pub block_size: usize,
    pub kernel_address: VirtAddr,
}

/// Frame map over all of physical memory, index `i` describing the frame at `i * FRAME_SIZE`.
pub struct FrameMap {
    frames: &'static mut [Frame],
    free_count: usize,
}

impl FrameMap {
    /// Frames needed to hold the map for `frame_count` frames.
    pub fn frames_needed(frame_count: usize) -> usize {
        (frame_count * size_of::<Frame>()).div_ceil(FRAME_SIZE)
    }

    /// Builds the frame map in place at `map_base`
    ///
    /// Frames below `first_free` and the frames under the map are fixed.
    ///
    /// # Safety
    /// `[0, total_size)` must be RAM mapped at `hhdm_offset`, and nothing at or
    /// above `first_free` may be in use.
    unsafe fn init(
        hhdm_offset: VirtAddr,
        first_free: PhysAddr,
        map_base: PhysAddr,
        total_size: u64,
    ) -> Self {
        let frame_count = total_size as usize / FRAME_SIZE;
        let first_free_index = frame_index_of(first_free.align_up(FRAME_SIZE as u64));
        let map_index = frame_index_of(map_base);
        let map_end = map_index + Self::frames_needed(frame_count);

        assert!(
            map_end <= frame_count,
            "Frame map for {} frames does not fit above {:#x}",
            frame_count,
            map_base.as_u64()
        );

        let map_ptr: *mut Frame = (hhdm_offset + map_base.as_u64()).as_mut_ptr();
        let mut free_count = 0;
        for index in 0..frame_count {
            let state = if index < first_free_index || (map_index..map_end).contains(&index) {
                FrameState::Fixed
            } else {
                free_count += 1;
                FrameState::Free
            };
            map_ptr.add(index).write(Frame {
                state,
                is_block_head: false,
                block_size: 0,
                kernel_address: hhdm_offset + (index * FRAME_SIZE) as u64,
            });
        }

        FrameMap {
            frames: core::slice::from_raw_parts_mut(map_ptr, frame_count),
            free_count,
        }
    }

    /// First-fit scan for `count` consecutive free frames
    ///
    /// # Returns
    /// The head frame of the run, or None if no run is long enough
    fn allocate(&mut self, count: usize) -> Option<PhysFrame> {
        if count == 0 || count > self.free_count {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for (index, frame) in self.frames.iter().enumerate() {
            if frame.state != FrameState::Free {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = index;
            }
            run_len += 1;
            if run_len == count {
                break;
            }
        }
        if run_len != count {
            return None;
        }

        for (offset, frame) in self.frames[run_start..run_start + count]
            .iter_mut()
            .enumerate()
        {
            frame.state = FrameState::InUse;
            frame.block_size = count;
            frame.is_block_head = offset == 0;
        }
        self.free_count -= count;

        Some(frame_at(run_start))
    }

    /// Returns the whole block headed by `head` to the free pool.
    fn free(&mut self, head: PhysFrame) {
        let index = frame_index(head);
        let entry = self.frames.get(index);
        assert!(
            matches!(entry, Some(f) if f.state == FrameState::InUse && f.is_block_head),
            "Freeing {:#x}, which is not the head of an allocated block",
            head.start_address().as_u64()
        );

        // exactly block_size frames, starting at the head
        let block_size = self.frames[index].block_size;
        for frame in &mut self.frames[index..index + block_size] {
            frame.state = FrameState::Free;
            frame.block_size = 0;
            frame.is_block_head = false;
        }
        self.free_count += block_size;
    }

    /// Marks every free frame in `[base, base + length)` as fixed.
    fn reserve(&mut self, base: PhysAddr, length: u64) {
        let first = base.as_u64() as usize / FRAME_SIZE;
        let last = (base.as_u64() + length).div_ceil(FRAME_SIZE as u64) as usize;
        let last = last.min(self.frames.len());

        for frame in self.frames.iter_mut().take(last).skip(first) {
            match frame.state {
                FrameState::Free => {
                    frame.state = FrameState::Fixed;
                    self.free_count -= 1;
                }
                FrameState::Fixed => {}
                FrameState::InUse => panic!(
                    "Reserving in-use frame at {:#x}",
                    frame.kernel_address.as_u64()
                ),
            }
        }
    }

    fn entry(&self, frame: PhysFrame) -> Option<Frame> {
        self.frames.get(frame_index(frame)).copied()
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

fn frame_index(frame: PhysFrame) -> usize {
    frame_index_of(frame.start_address())
}

fn frame_index_of(addr: PhysAddr) -> usize {
    addr.as_u64() as usize / FRAME_SIZE
}

fn frame_at(index: usize) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new((index * FRAME_SIZE) as u64))
}

/// Where frames come from: the boot stealer first, the frame map once built
pub enum FrameSource {
    Boot(BootFrameAllocator),
    Map(FrameMap),
}

impl FrameSource {
    fn allocate(&mut self, count: usize) -> Option<PhysFrame> {
        match self {
            FrameSource::Boot(ref mut boot_alloc) => boot_alloc.steal(count),
            FrameSource::Map(ref mut map) => map.allocate(count),
        }
    }

    fn free(&mut self, head: PhysFrame) {
        match self {
            FrameSource::Boot(ref mut boot_alloc) => unsafe {
                boot_alloc.deallocate_frame(head)
            },
            FrameSource::Map(ref mut map) => map.free(head),
        }
    }
}

unsafe impl PagingFrameAllocator<Size4KiB> for FrameSource {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.allocate(1)
    }
}

impl FrameDeallocator<Size4KiB> for FrameSource {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free(frame)
    }
}

/// The physical frame allocator, constructed once at boot and shared by reference
///
/// * `hhdm_offset`: base of the kernel's direct map of physical memory
/// * `source`: the active backend, behind the allocator lock
pub struct FrameAllocator {
    hhdm_offset: VirtAddr,
    source: Mutex<FrameSource>,
}

impl FrameAllocator {
    /// Creates an allocator in early-boot mode, stealing frames from `layout`.
    pub fn new(hhdm_offset: VirtAddr, layout: &MemoryLayout) -> Self {
        FrameAllocator {
            hhdm_offset,
            source: Mutex::new(FrameSource::Boot(BootFrameAllocator::new(
                layout.first_free,
                layout.boot_limit(),
            ))),
        }
    }

    /// Builds the frame map and switches away from the boot stealer
    ///
    /// Frames below `first_free` and the frames holding the map itself become
    /// fixed; everything else up to `total_size` is free.
    ///
    /// # Safety
    /// `[0, total_size)` must be RAM mapped at the direct-map offset, and no
    /// memory at or above `first_free` may be in use.
    pub unsafe fn initialize(&self, first_free: PhysAddr, total_size: u64) {
        let map_base = first_free.align_up(FRAME_SIZE as u64);
        self.install(map_base, map_base, total_size);
    }

    /// Initializes over `layout` past whatever the boot stealer handed out,
    /// then fixes the layout's holes
    ///
    /// The map goes into the first usable run above the stolen frames that
    /// is long enough to hold it, so it never lands in a hole.
    ///
    /// # Safety
    /// Same contract as [`FrameAllocator::initialize`], for `layout`.
    pub unsafe fn bootstrap(&self, layout: &MemoryLayout) {
        let first_free = match *self.source.lock() {
            FrameSource::Boot(ref boot_alloc) => boot_alloc.first_free(),
            FrameSource::Map(_) => panic!("Frame allocator already initialized"),
        };
        let map_bytes = (FrameMap::frames_needed(layout.frame_count()) * FRAME_SIZE) as u64;
        let map_base = layout
            .usable_runs()
            .map(|(start, end)| (start.max(first_free), end))
            .find(|&(start, end)| start.as_u64() + map_bytes <= end.as_u64())
            .map(|(start, _)| start);
        let Some(map_base) = map_base else {
            panic!(
                "Frame map for {} frames does not fit in usable memory",
                layout.frame_count()
            );
        };

        self.install(first_free, map_base, layout.total_size);
        for hole in &layout.holes {
            self.reserve(hole.base, hole.length);
        }
    }

    unsafe fn install(&self, first_free: PhysAddr, map_base: PhysAddr, total_size: u64) {
        let mut source = self.source.lock();
        if let FrameSource::Boot(ref boot_alloc) = *source {
            assert!(
                first_free >= boot_alloc.first_free(),
                "Frame map would overlap stolen boot frames"
            );
        } else {
            panic!("Frame allocator already initialized");
        }

        let map = FrameMap::init(self.hhdm_offset, first_free, map_base, total_size);
        info!(
            "Frame map ready at {:#x}: {} frames, {} free",
            map_base.as_u64(),
            map.len(),
            map.free_count
        );
        *source = FrameSource::Map(map);
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.source.lock(), FrameSource::Map(_))
    }

    /// Allocates `count` contiguous frames
    ///
    /// # Returns
    /// The first frame of the block, or None when memory is exhausted
    pub fn allocate(&self, count: usize) -> Option<PhysFrame> {
        self.source.lock().allocate(count)
    }

    /// Frees the block whose head is `head`. Panics if `head` does not start a live block.
    pub fn free(&self, head: PhysFrame) {
        self.source.lock().free(head)
    }

    /// Permanently removes `[base, base + length)` from the free pool.
    pub fn reserve(&self, base: PhysAddr, length: u64) {
        match *self.source.lock() {
            FrameSource::Map(ref mut map) => map.reserve(base, length),
            FrameSource::Boot(_) => panic!("Cannot reserve memory before the frame map exists"),
        }
    }

    /// Exposed function to allocate one frame through the active backend
    pub fn alloc_frame(&self) -> Option<PhysFrame> {
        self.with_source(|source| source.allocate_frame())
    }

    /// Exposed function to free one frame through the active backend
    pub fn dealloc_frame(&self, frame: PhysFrame) {
        self.with_source(|source| unsafe { source.deallocate_frame(frame) })
    }

    /// Allocates `count` contiguous frames and returns their direct-mapped address.
    pub fn alloc_kpages(&self, count: usize) -> Option<VirtAddr> {
        self.allocate(count).map(|frame| self.kernel_address(frame))
    }

    /// Frees a block previously returned by [`FrameAllocator::alloc_kpages`].
    pub fn free_kpages(&self, addr: VirtAddr) {
        let phys = addr - self.hhdm_offset;
        let frame = PhysFrame::from_start_address(PhysAddr::new(phys))
            .expect("free_kpages on an address that is not frame aligned");
        self.free(frame)
    }

    /// Direct-mapped kernel address of `frame`.
    pub fn kernel_address(&self, frame: PhysFrame) -> VirtAddr {
        self.hhdm_offset + frame.start_address().as_u64()
    }

    /// Fills `frame` with zeroes
    ///
    /// # Safety
    /// The caller must own `frame`.
    pub unsafe fn zero_frame(&self, frame: PhysFrame) {
        ptr::write_bytes(
            self.kernel_address(frame).as_mut_ptr::<u8>(),
            0,
            FRAME_SIZE,
        );
    }

    /// Copies the contents of `src` into `dst`
    ///
    /// # Safety
    /// The caller must own `dst`, and `src` must not be written concurrently.
    pub unsafe fn copy_frame(&self, dst: PhysFrame, src: PhysFrame) {
        ptr::copy_nonoverlapping(
            self.kernel_address(src).as_ptr::<u8>(),
            self.kernel_address(dst).as_mut_ptr::<u8>(),
            FRAME_SIZE,
        );
    }

    /// Frames currently available, counting what the boot stealer has left.
    pub fn free_frames(&self) -> usize {
        match *self.source.lock() {
            FrameSource::Boot(ref boot_alloc) => boot_alloc.remaining(),
            FrameSource::Map(ref map) => map.free_count,
        }
    }

    /// Frame map entry for `frame`, None before initialization or past the end of memory.
    pub fn frame(&self, frame: PhysFrame) -> Option<Frame> {
        match *self.source.lock() {
            FrameSource::Boot(_) => None,
            FrameSource::Map(ref map) => map.entry(frame),
        }
    }

    pub fn frame_state(&self, frame: PhysFrame) -> Option<FrameState> {
        self.frame(frame).map(|entry| entry.state)
    }

    fn with_source<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut MutexGuard<'_, FrameSource>) -> R,
    {
        let mut guard = self.source.lock();
        f(&mut guard)
    }
}
