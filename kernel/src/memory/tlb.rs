//! Translation cache
//!
//! The fault handler installs translations into a small fixed set of slots.
//! There is no replacement policy: once every slot holds a valid entry,
//! further installs fail until an address space switch clears some.

use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use x86_64::{
    structures::paging::{Page, PageTableFlags, PhysFrame},
    VirtAddr,
};

use crate::{constants::memory::NUM_TLB, memory::error::VmError, trace};

// 64 bits never wrap, so a tag is never reissued while an older space lives
static NEXT_ASID: AtomicU64 = AtomicU64::new(1);

/// Address-space identifier used to tag cached translations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(u64);

impl AsId {
    pub fn next() -> Self {
        AsId(NEXT_ASID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub asid: AsId,
    pub page: Page,
    pub frame: PhysFrame,
    pub flags: PageTableFlags,
}

impl TlbEntry {
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageTableFlags::WRITABLE)
    }
}

/// Operations the VM layer needs from the processor's translation cache.
///
/// Callers run every read-modify-write sequence with local interrupts masked.
pub trait TranslationCache {
    /// Drops every cached translation.
    fn invalidate_all(&mut self);

    /// Installs `entry`, replacing a cached translation for the same page and
    /// address space if there is one, otherwise taking the first free slot
    ///
    /// # Returns
    /// The slot used, or `TranslationCacheFull` when every slot is valid
    fn insert_if_slot_free(&mut self, entry: TlbEntry) -> Result<usize, VmError>;

    /// Drops every cached translation tagged with `asid`.
    fn invalidate_matching(&mut self, asid: AsId);

    /// Looks up the cached translation of `addr` for `asid`.
    fn lookup(&self, asid: AsId, addr: VirtAddr) -> Option<TlbEntry>;
}

/// Software model of the translation cache with `SLOTS` entries.
///
/// With the `hardware` feature, invalidations are mirrored into the x86_64
/// TLB as well.
#[derive(Debug)]
pub struct SoftTlb<const SLOTS: usize = NUM_TLB> {
    slots: [Option<TlbEntry>; SLOTS],
}

impl<const SLOTS: usize> Default for SoftTlb<SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SLOTS: usize> SoftTlb<SLOTS> {
    pub const fn new() -> Self {
        SoftTlb {
            slots: [None; SLOTS],
        }
    }

    /// Valid entries, in slot order.
    pub fn entries(&self) -> ArrayVec<TlbEntry, SLOTS> {
        self.slots.iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const SLOTS: usize> TranslationCache for SoftTlb<SLOTS> {
    fn invalidate_all(&mut self) {
        self.slots = [None; SLOTS];

        #[cfg(all(feature = "hardware", target_arch = "x86_64"))]
        x86_64::instructions::tlb::flush_all();
    }

    fn insert_if_slot_free(&mut self, entry: TlbEntry) -> Result<usize, VmError> {
        let existing = self.slots.iter().position(|slot| {
            slot.is_some_and(|cached| cached.asid == entry.asid && cached.page == entry.page)
        });
        let slot = existing
            .or_else(|| self.slots.iter().position(Option::is_none))
            .ok_or(VmError::TranslationCacheFull)?;

        self.slots[slot] = Some(entry);
        trace!(
            "TLB slot {}: {:#x} -> {:#x}",
            slot,
            entry.page.start_address().as_u64(),
            entry.frame.start_address().as_u64()
        );
        Ok(slot)
    }

    fn invalidate_matching(&mut self, asid: AsId) {
        for slot in self.slots.iter_mut() {
            let Some(entry) = *slot else { continue };
            if entry.asid == asid {
                #[cfg(all(feature = "hardware", target_arch = "x86_64"))]
                x86_64::instructions::tlb::flush(entry.page.start_address());

                *slot = None;
            }
        }
    }

    fn lookup(&self, asid: AsId, addr: VirtAddr) -> Option<TlbEntry> {
        let page: Page = Page::containing_address(addr);
        self.slots
            .iter()
            .flatten()
            .find(|entry| entry.asid == asid && entry.page == page)
            .copied()
    }
}
