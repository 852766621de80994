//! Declared virtual regions of an address space
//!
//! Regions carry intent only: a base, a length in pages, and the permissions
//! the program asked for. Nothing is backed until the address space is
//! prepared for load or a fault touches the region.

use alloc::vec::Vec;
use x86_64::{
    structures::paging::{Page, PageTableFlags},
    VirtAddr,
};

use crate::{
    constants::memory::{INITIAL_REGION_CAPACITY, PAGE_SIZE, USER_SPACE_END},
    memory::error::VmError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: Page,
    pub page_count: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl Region {
    /// Page-aligns `[vaddr, vaddr + size)`: the offset of `vaddr` into its page
    /// is folded into the size, then the size is rounded up to whole pages
    ///
    /// # Returns
    /// `AddressingFault` if the aligned range does not fit below [`USER_SPACE_END`]
    pub fn new(
        vaddr: VirtAddr,
        size: u64,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<Self, VmError> {
        let offset = vaddr.as_u64() & (PAGE_SIZE - 1);
        let base = vaddr.as_u64() - offset;
        let end = size
            .checked_add(offset)
            .and_then(|len| len.checked_next_multiple_of(PAGE_SIZE))
            .and_then(|len| len.checked_add(base))
            .filter(|&end| end <= USER_SPACE_END)
            .ok_or(VmError::AddressingFault(vaddr))?;

        Ok(Region {
            base: Page::containing_address(vaddr),
            page_count: (end - base) / PAGE_SIZE,
            readable,
            writable,
            executable,
        })
    }

    pub fn start(&self) -> VirtAddr {
        self.base.start_address()
    }

    /// First address past the region. May be [`USER_SPACE_END`], which is not canonical.
    pub fn end(&self) -> u64 {
        self.start().as_u64() + self.page_count * PAGE_SIZE
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        let addr = addr.as_u64();
        addr >= self.start().as_u64() && addr < self.end()
    }

    pub fn pages(&self) -> impl Iterator<Item = Page> {
        let base = self.base;
        (0..self.page_count).map(move |index| base + index)
    }

    /// Page table flags matching the declared permissions.
    ///
    /// A region with no permission at all maps to non-present pages.
    pub fn flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::USER_ACCESSIBLE;

        if self.readable || self.writable || self.executable {
            flags |= PageTableFlags::PRESENT;
        }
        if self.writable {
            flags |= PageTableFlags::WRITABLE;
        }
        if !self.executable {
            flags |= PageTableFlags::NO_EXECUTE;
        }

        flags
    }
}

/// Ordered list of regions with an explicitly tracked, doubling capacity.
#[derive(Debug)]
pub struct RegionList {
    regions: Vec<Region>,
    capacity: usize,
}

impl RegionList {
    pub fn new() -> Result<Self, VmError> {
        Self::with_capacity(INITIAL_REGION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, VmError> {
        let mut regions = Vec::new();
        regions
            .try_reserve_exact(capacity)
            .map_err(|_| VmError::OutOfMemory)?;
        Ok(RegionList { regions, capacity })
    }

    /// Appends `region`, doubling the list first if it is full.
    pub fn push(&mut self, region: Region) -> Result<(), VmError> {
        if self.regions.len() == self.capacity {
            self.grow()?;
        }
        self.regions.push(region);
        Ok(())
    }

    /// The first declared region covering `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// End of the highest region, where the heap begins.
    pub fn highest_end(&self) -> Option<u64> {
        self.regions.iter().map(Region::end).max()
    }

    /// Deep copy with the same capacity.
    pub fn try_clone(&self) -> Result<Self, VmError> {
        let mut copy = Self::with_capacity(self.capacity)?;
        copy.regions.extend_from_slice(&self.regions);
        Ok(copy)
    }

    fn grow(&mut self) -> Result<(), VmError> {
        let new_capacity = (self.capacity * 2).max(INITIAL_REGION_CAPACITY);

        let mut regions = Vec::new();
        regions
            .try_reserve_exact(new_capacity)
            .map_err(|_| VmError::OutOfMemory)?;
        regions.extend_from_slice(&self.regions);

        self.regions = regions;
        self.capacity = new_capacity;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use x86_64::{structures::paging::PageTableFlags, VirtAddr};

    use super::*;

    #[test]
    fn test_region_alignment() {
        // 0x1234 + 0x2000 spans pages 0x1000, 0x2000 and 0x3000
        let region = Region::new(VirtAddr::new(0x1234), 0x2000, true, false, true).expect("region");

        assert_eq!(region.start(), VirtAddr::new(0x1000));
        assert_eq!(region.page_count, 3);
        assert_eq!(region.end(), 0x4000);
        assert!(region.contains(VirtAddr::new(0x3fff)));
        assert!(!region.contains(VirtAddr::new(0x4000)));
        assert_eq!(region.pages().count(), 3);
    }

    #[test]
    fn test_region_ending_at_user_space_end() {
        let top = VirtAddr::new(USER_SPACE_END - PAGE_SIZE);
        let region = Region::new(top, PAGE_SIZE, true, true, false).expect("region");

        assert_eq!(region.end(), USER_SPACE_END);
        assert!(region.contains(top + 8u64));
        assert!(!region.contains(VirtAddr::new(0xffff_8000_0000_0000)));
        assert_eq!(region.pages().collect::<Vec<_>>(), [Page::containing_address(top)]);
    }

    #[test]
    fn test_region_past_user_space_is_rejected() {
        let top = VirtAddr::new(USER_SPACE_END - PAGE_SIZE);
        assert_eq!(
            Region::new(top, PAGE_SIZE + 1, true, true, false),
            Err(VmError::AddressingFault(top))
        );

        let unaligned = VirtAddr::new(0x1fff);
        assert_eq!(
            Region::new(unaligned, u64::MAX, true, false, false),
            Err(VmError::AddressingFault(unaligned))
        );

        let kernel = VirtAddr::new(0xffff_8000_0000_0000);
        assert!(Region::new(kernel, PAGE_SIZE, true, false, false).is_err());
    }

    #[test]
    fn test_aligned_region_keeps_size() {
        let region =
            Region::new(VirtAddr::new(0x40_0000), 0x2000, true, true, false).expect("region");
        assert_eq!(region.page_count, 2);
    }

    #[test]
    fn test_region_flags() {
        let text =
            Region::new(VirtAddr::new(0x40_0000), 0x1000, true, false, true).expect("region");
        assert!(text.flags().contains(PageTableFlags::PRESENT));
        assert!(!text.flags().contains(PageTableFlags::WRITABLE));
        assert!(!text.flags().contains(PageTableFlags::NO_EXECUTE));

        let data =
            Region::new(VirtAddr::new(0x60_0000), 0x1000, true, true, false).expect("region");
        assert!(data.flags().contains(
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE
        ));

        let guard =
            Region::new(VirtAddr::new(0x80_0000), 0x1000, false, false, false).expect("region");
        assert!(!guard.flags().contains(PageTableFlags::PRESENT));
    }

    #[test]
    fn test_growth_preserves_regions() {
        let mut list = RegionList::with_capacity(1).expect("list");
        for i in 0..5u64 {
            let base = VirtAddr::new(0x10_0000 * (i + 1));
            let region = Region::new(base, 0x1000, true, i % 2 == 0, false).expect("region");
            list.push(region).expect("push");
        }

        assert_eq!(list.len(), 5);
        assert_eq!(list.capacity(), 8);
        for (i, region) in list.iter().enumerate() {
            assert_eq!(region.start(), VirtAddr::new(0x10_0000 * (i as u64 + 1)));
            assert_eq!(region.writable, i % 2 == 0);
        }
    }

    #[test]
    fn test_find_and_highest_end() {
        let mut list = RegionList::new().expect("list");
        assert!(list.highest_end().is_none());

        for (base, size) in [(0x40_0000, 0x3000), (0x10_0000, 0x1000)] {
            let region = Region::new(VirtAddr::new(base), size, true, false, true).expect("region");
            list.push(region).expect("push");
        }

        assert_eq!(
            list.find(VirtAddr::new(0x40_2fff)).map(Region::start),
            Some(VirtAddr::new(0x40_0000))
        );
        assert!(list.find(VirtAddr::new(0x40_3000)).is_none());
        assert_eq!(list.highest_end(), Some(0x40_3000));
    }

    #[test]
    fn test_try_clone_is_deep() {
        let mut list = RegionList::new().expect("list");
        let region = Region::new(VirtAddr::new(0x1000), 0x1000, true, true, false).expect("region");
        list.push(region).expect("push");

        let mut copy = list.try_clone().expect("clone");
        let region = Region::new(VirtAddr::new(0x9000), 0x1000, true, true, false).expect("region");
        copy.push(region).expect("push");

        assert_eq!(list.len(), 1);
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.capacity(), list.capacity());
    }
}
