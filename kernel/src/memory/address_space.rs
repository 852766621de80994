//! Per-process address space
//!
//! - Owns the declared regions, the page table and the stack/heap bounds
//! - Drives the load protocol: define regions, prepare (eager, writable
//!   backing), write program bytes, complete (final permissions)
//! - Duplicates itself for fork by allocating fresh frames and copying
//!   contents; frames are never shared between address spaces

use core::ptr;

use x86_64::{
    structures::paging::{Page, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{DEFAULT_HEAP_START, PAGE_SIZE, USERSTACK, USER_SPACE_END},
    debug,
    interrupts::without_interrupts,
    memory::{
        error::VmError,
        frame_allocator::FrameAllocator,
        page_table::PageTable,
        region::{Region, RegionList},
        tlb::{AsId, TranslationCache},
    },
    warn,
};

/// Flags every page gets while the loader fills it.
pub const LOAD_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Flags for stack and heap pages.
pub const SEGMENT_FLAGS: PageTableFlags = LOAD_FLAGS.union(PageTableFlags::NO_EXECUTE);

/// What makes a faulting address legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Region(Region),
    Stack,
    Heap,
}

impl Coverage {
    /// Flags for a page faulted in under this coverage.
    pub fn flags(&self) -> PageTableFlags {
        match self {
            Coverage::Region(region) => region.flags(),
            Coverage::Stack | Coverage::Heap => SEGMENT_FLAGS,
        }
    }
}

/// Address space of one process
///
/// Stack and heap bounds are page addresses, inclusive on both ends. They
/// stay zero until [`AddressSpace::prepare_load`].
#[derive(Debug)]
pub struct AddressSpace {
    id: AsId,
    regions: RegionList,
    page_table: PageTable,
    stack_start: VirtAddr,
    stack_end: VirtAddr,
    heap_start: VirtAddr,
    heap_end: VirtAddr,
    loaded: bool,
}

impl AddressSpace {
    /// Creates an empty address space.
    ///
    /// # Returns
    /// `OutOfMemory` if the region list or page table cannot be allocated
    pub fn create() -> Result<Self, VmError> {
        let regions = RegionList::new()?;
        let page_table = PageTable::new()?;
        Ok(Self::with_parts(regions, page_table))
    }

    fn with_parts(regions: RegionList, page_table: PageTable) -> Self {
        AddressSpace {
            id: AsId::next(),
            regions,
            page_table,
            stack_start: VirtAddr::zero(),
            stack_end: VirtAddr::zero(),
            heap_start: VirtAddr::zero(),
            heap_end: VirtAddr::zero(),
            loaded: false,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn stack_start(&self) -> VirtAddr {
        self.stack_start
    }

    pub fn stack_end(&self) -> VirtAddr {
        self.stack_end
    }

    pub fn heap_start(&self) -> VirtAddr {
        self.heap_start
    }

    pub fn heap_end(&self) -> VirtAddr {
        self.heap_end
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Declares `[vaddr, vaddr + size)` with the given permissions
    ///
    /// Panics if called after [`AddressSpace::prepare_load`].
    ///
    /// # Returns
    /// `AddressingFault` if the range leaves the user half, `OutOfMemory` if
    /// the region list cannot grow
    pub fn define_region(
        &mut self,
        vaddr: VirtAddr,
        size: u64,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<(), VmError> {
        assert!(!self.loaded, "define_region after prepare_load");

        let region = Region::new(vaddr, size, readable, writable, executable)?;
        debug!(
            "Region {:#x} +{} pages ({}{}{})",
            region.start().as_u64(),
            region.page_count,
            if readable { 'r' } else { '-' },
            if writable { 'w' } else { '-' },
            if executable { 'x' } else { '-' },
        );
        self.regions.push(region)
    }

    /// Backs every region page with a zeroed, writable frame and sets up the
    /// initial stack and heap pages
    ///
    /// # Returns
    /// `OutOfMemory` if a frame or page table slot cannot be had. Pages mapped
    /// before the failure stay mapped; destroying the address space reclaims them.
    pub fn prepare_load(&mut self, frames: &FrameAllocator) -> Result<(), VmError> {
        self.loaded = true;

        for region in self.regions.iter() {
            for page in region.pages() {
                if self.page_table.lookup(page.start_address()).is_none() {
                    map_zeroed(&mut self.page_table, frames, page, LOAD_FLAGS)?;
                }
            }
        }

        let stack: Page = Page::containing_address(VirtAddr::new(USERSTACK - PAGE_SIZE));
        if self.page_table.lookup(stack.start_address()).is_none() {
            map_zeroed(&mut self.page_table, frames, stack, SEGMENT_FLAGS)?;
        }
        self.stack_start = stack.start_address();
        self.stack_end = stack.start_address();

        // a region reaching the top of the user half leaves no room above it
        let heap_base = match self.regions.highest_end() {
            Some(end) if end < USER_SPACE_END => end,
            _ => DEFAULT_HEAP_START,
        };
        let heap: Page = Page::containing_address(VirtAddr::new(heap_base));
        if self.page_table.lookup(heap.start_address()).is_none() {
            map_zeroed(&mut self.page_table, frames, heap, SEGMENT_FLAGS)?;
        }
        self.heap_start = heap.start_address();
        self.heap_end = heap.start_address();

        debug!(
            "Prepared address space {}: {} pages",
            self.id.as_u64(),
            self.page_table.len()
        );
        Ok(())
    }

    /// Rewrites the flags of every region page to the region's declared
    /// permissions. Where regions share a page, the later region wins.
    pub fn complete_load(&mut self) {
        for region in self.regions.iter() {
            let flags = region.flags();
            for page in region.pages() {
                self.page_table.set_flags(page, flags);
            }
        }
    }

    /// Initial user stack pointer.
    pub fn define_stack(&self) -> VirtAddr {
        VirtAddr::new(USERSTACK)
    }

    /// Duplicates this address space into fresh frames
    ///
    /// Regions, every mapped page (including pages added by stack or heap
    /// growth), final permissions and bounds are reproduced. The copy gets its
    /// own [`AsId`].
    ///
    /// # Returns
    /// `OutOfMemory` if any step fails; the partial copy is already destroyed
    pub fn copy(&self, frames: &FrameAllocator) -> Result<AddressSpace, VmError> {
        let regions = self.regions.try_clone()?;
        let page_table = PageTable::with_capacity(self.page_table.capacity())?;
        let mut copy = Self::with_parts(regions, page_table);

        match copy.copy_from(self, frames) {
            Ok(()) => {
                debug!(
                    "Copied address space {} into {}",
                    self.id.as_u64(),
                    copy.id.as_u64()
                );
                Ok(copy)
            }
            Err(err) => {
                warn!("Address space copy failed: {}", err);
                copy.destroy(frames);
                Err(err)
            }
        }
    }

    fn copy_from(&mut self, source: &AddressSpace, frames: &FrameAllocator) -> Result<(), VmError> {
        if source.loaded {
            self.prepare_load(frames)?;
        }

        for entry in source.page_table.iter() {
            let mapped = self.page_table.lookup(entry.page.start_address()).map(|e| e.frame);
            let frame = match mapped {
                Some(frame) => frame,
                None => map_zeroed(&mut self.page_table, frames, entry.page, entry.flags)?,
            };
            // SAFETY: `frame` belongs to this copy and `source` is not running
            unsafe { frames.copy_frame(frame, entry.frame) };
            self.page_table.set_flags(entry.page, entry.flags);
        }

        self.stack_start = source.stack_start;
        self.stack_end = source.stack_end;
        self.heap_start = source.heap_start;
        self.heap_end = source.heap_end;
        self.loaded = source.loaded;
        Ok(())
    }

    /// Returns every mapped frame to `frames` and frees the bookkeeping.
    ///
    /// Translations cached for a space that has run must be dropped first
    /// with [`AddressSpace::deactivate`]; they point at the frames freed here.
    pub fn destroy(self, frames: &FrameAllocator) {
        debug!("Destroying address space {}", self.id.as_u64());
        self.page_table.remove_all(frames);
    }

    /// Drops translations cached for this address space before it runs.
    pub fn activate<T: TranslationCache>(&self, tlb: &mut T) {
        without_interrupts(|| tlb.invalidate_matching(self.id));
    }

    /// Drops translations cached for this address space after it stops running.
    pub fn deactivate<T: TranslationCache>(&self, tlb: &mut T) {
        without_interrupts(|| tlb.invalidate_matching(self.id));
    }

    /// Decides whether `addr` may be faulted in
    ///
    /// Regions are consulted first, then the stack and heap bounds. A page in
    /// the gap between heap and stack is claimed by the nearer of the two
    /// (the stack on a tie). The bound moves only once the page is mapped by
    /// [`AddressSpace::map_covered`].
    pub fn coverage(&self, addr: VirtAddr) -> Option<Coverage> {
        if let Some(region) = self.regions.find(addr) {
            return Some(Coverage::Region(*region));
        }
        if !self.loaded {
            return None;
        }

        let page = addr.align_down(PAGE_SIZE);
        if page >= self.stack_start && page <= self.stack_end {
            return Some(Coverage::Stack);
        }
        if page >= self.heap_start && page <= self.heap_end {
            return Some(Coverage::Heap);
        }

        if page > self.heap_end && page < self.stack_start {
            if self.stack_start - page <= page - self.heap_end {
                return Some(Coverage::Stack);
            }
            return Some(Coverage::Heap);
        }

        None
    }

    /// Backs `page` with a zeroed frame using `coverage`'s flags, then extends
    /// the stack or heap bound down or up to `page`.
    pub(crate) fn map_covered(
        &mut self,
        frames: &FrameAllocator,
        page: Page,
        coverage: Coverage,
    ) -> Result<PhysFrame, VmError> {
        let frame = map_zeroed(&mut self.page_table, frames, page, coverage.flags())?;

        let addr = page.start_address();
        match coverage {
            Coverage::Stack if addr < self.stack_start => self.stack_start = addr,
            Coverage::Heap if addr > self.heap_end => self.heap_end = addr,
            _ => {}
        }
        Ok(frame)
    }

    /// Physical address currently backing `addr`.
    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.page_table
            .lookup(addr)
            .map(|entry| entry.frame.start_address() + (addr.as_u64() & (PAGE_SIZE - 1)))
    }

    /// Copies mapped user memory at `addr` into `buf`, ignoring page permissions
    ///
    /// # Returns
    /// `AddressingFault` at the first unmapped byte
    pub fn read_bytes(
        &self,
        frames: &FrameAllocator,
        addr: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let (src, chunk) = self.kernel_window(frames, addr + done as u64, buf.len() - done)?;
            // SAFETY: the frame is mapped by this address space and `chunk`
            // stays within it
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr::<u8>(), buf[done..].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies `bytes` into mapped user memory at `addr`, ignoring page permissions
    ///
    /// # Returns
    /// `AddressingFault` at the first unmapped byte
    pub fn write_bytes(
        &mut self,
        frames: &FrameAllocator,
        addr: VirtAddr,
        bytes: &[u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < bytes.len() {
            let (dst, chunk) =
                self.kernel_window(frames, addr + done as u64, bytes.len() - done)?;
            // SAFETY: the frame is owned by this address space and `chunk`
            // stays within it
            unsafe {
                ptr::copy_nonoverlapping(bytes[done..].as_ptr(), dst.as_mut_ptr::<u8>(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Direct-mapped address of `addr` and how many bytes remain in its page.
    fn kernel_window(
        &self,
        frames: &FrameAllocator,
        addr: VirtAddr,
        remaining: usize,
    ) -> Result<(VirtAddr, usize), VmError> {
        let entry = self
            .page_table
            .lookup(addr)
            .ok_or(VmError::AddressingFault(addr))?;
        let offset = addr.as_u64() & (PAGE_SIZE - 1);
        let chunk = remaining.min((PAGE_SIZE - offset) as usize);
        Ok((frames.kernel_address(entry.frame) + offset, chunk))
    }
}

/// Allocates a zeroed frame and maps `page` to it; the frame is returned to
/// the allocator if the table cannot take the entry.
fn map_zeroed(
    page_table: &mut PageTable,
    frames: &FrameAllocator,
    page: Page,
    flags: PageTableFlags,
) -> Result<PhysFrame, VmError> {
    let frame = frames.allocate(1).ok_or(VmError::OutOfMemory)?;
    // SAFETY: freshly allocated, nobody else holds it
    unsafe { frames.zero_frame(frame) };

    if let Err(err) = page_table.insert(page, frame, flags) {
        frames.free(frame);
        return Err(err);
    }
    Ok(frame)
}
