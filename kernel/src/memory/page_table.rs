//! Per-address-space page table
//!
//! A flat array of translations, searched linearly. Working sets in this
//! kernel are small; an O(entries) lookup is the scalability ceiling of the
//! design. Capacity and occupancy are tracked explicitly and the array only
//! ever doubles.

use alloc::vec::Vec;
use x86_64::{
    structures::paging::{Page, PageTableFlags, PhysFrame},
    VirtAddr,
};

use crate::{
    constants::memory::INITIAL_PAGE_TABLE_CAPACITY,
    debug,
    memory::{error::VmError, frame_allocator::FrameAllocator},
};

/// One virtual page to physical frame translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub page: Page,
    pub frame: PhysFrame,
    pub flags: PageTableFlags,
}

impl PageTableEntry {
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageTableFlags::WRITABLE)
    }
}

/// Growable array of translations owned by one address space
///
/// * `slots`: `capacity` slots; `None` is an invalid entry free for reuse
/// * `in_use`: number of valid entries
#[derive(Debug)]
pub struct PageTable {
    slots: Vec<Option<PageTableEntry>>,
    capacity: usize,
    in_use: usize,
}

impl PageTable {
    pub fn new() -> Result<Self, VmError> {
        Self::with_capacity(INITIAL_PAGE_TABLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, VmError> {
        Ok(PageTable {
            slots: empty_slots(capacity)?,
            capacity,
            in_use: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Finds the translation for the page containing `addr`.
    pub fn lookup(&self, addr: VirtAddr) -> Option<&PageTableEntry> {
        let page: Page = Page::containing_address(addr);
        self.iter().find(|entry| entry.page == page)
    }

    pub fn lookup_mut(&mut self, addr: VirtAddr) -> Option<&mut PageTableEntry> {
        let page: Page = Page::containing_address(addr);
        self.slots
            .iter_mut()
            .flatten()
            .find(|entry| entry.page == page)
    }

    /// Records `page -> frame`, doubling the table first when every slot is taken
    ///
    /// # Returns
    /// `OutOfMemory` if the table had to grow and could not
    ///
    /// Panics if `page` is already mapped.
    pub fn insert(
        &mut self,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), VmError> {
        assert!(
            self.lookup(page.start_address()).is_none(),
            "Page {:#x} is already mapped",
            page.start_address().as_u64()
        );

        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                let slot = self.capacity;
                self.grow()?;
                slot
            }
        };

        self.slots[slot] = Some(PageTableEntry { page, frame, flags });
        self.in_use += 1;
        Ok(())
    }

    /// Rewrites the permission flags of the translation for `page`.
    ///
    /// # Returns
    /// false if `page` has no translation
    pub fn set_flags(&mut self, page: Page, flags: PageTableFlags) -> bool {
        match self.lookup_mut(page.start_address()) {
            Some(entry) => {
                entry.flags = flags;
                true
            }
            None => false,
        }
    }

    /// Valid entries, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.slots.iter().flatten()
    }

    /// Returns every mapped frame to `frames` and releases the table.
    pub fn remove_all(self, frames: &FrameAllocator) {
        for entry in self.iter() {
            frames.free(entry.frame);
        }
        debug!("Released page table with {} entries", self.in_use);
    }

    /// Swaps in a table twice the size; entries keep their slots.
    fn grow(&mut self) -> Result<(), VmError> {
        let new_capacity = if self.capacity == 0 {
            INITIAL_PAGE_TABLE_CAPACITY
        } else {
            self.capacity * 2
        };

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(new_capacity)
            .map_err(|_| VmError::OutOfMemory)?;
        slots.extend_from_slice(&self.slots);
        slots.resize(new_capacity, None);

        self.slots = slots;
        self.capacity = new_capacity;
        debug!("Page table grown to {} slots", new_capacity);
        Ok(())
    }
}

fn empty_slots(capacity: usize) -> Result<Vec<Option<PageTableEntry>>, VmError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(capacity)
        .map_err(|_| VmError::OutOfMemory)?;
    slots.resize(capacity, None);
    Ok(slots)
}
