//! Page fault resolution
//!
//! Turns a translation miss into an installed translation, or into the error
//! that terminates the faulting process. Frames are allocated on first touch
//! and zero-filled; nothing is ever paged out.

use x86_64::{
    structures::{
        idt::PageFaultErrorCode,
        paging::{Page, PageTableFlags},
    },
    VirtAddr,
};

use crate::{
    debug, error,
    interrupts::without_interrupts,
    memory::{
        error::VmError,
        frame_allocator::FrameAllocator,
        tlb::{TlbEntry, TranslationCache},
    },
    processes::process::CurrentProcess,
    trace, warn,
};

/// Access that caused the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Read or instruction fetch from an unmapped page
    Read,
    /// Write to an unmapped page
    Write,
    /// Write to a page the hardware holds as read-only
    ReadOnly,
}

impl FaultKind {
    pub fn from_error_code(code: PageFaultErrorCode) -> Self {
        let write = code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
        if write && code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            FaultKind::ReadOnly
        } else if write {
            FaultKind::Write
        } else {
            FaultKind::Read
        }
    }
}

/// Resolves a fault at `addr` for the current process
///
/// # Arguments
/// * `frames` - Frame allocator backing new pages
/// * `tlb` - Translation cache that receives the resolved translation
/// * `current` - The running process, if any
/// * `kind` - Access that faulted
/// * `addr` - Faulting virtual address
///
/// # Returns
/// * `AddressingFault` - no region, stack or heap covers `addr`
/// * `ProtectionViolation` - the access is not permitted by the page
/// * `OutOfMemory` - no frame for a new page
/// * `TranslationCacheFull` - every cache slot is taken
/// * `NoProcess` / `NoAddressSpace` - nothing to fault against
pub fn handle_page_fault<P, T>(
    frames: &FrameAllocator,
    tlb: &mut T,
    current: Option<&mut P>,
    kind: FaultKind,
    addr: VirtAddr,
) -> Result<(), VmError>
where
    P: CurrentProcess + ?Sized,
    T: TranslationCache,
{
    trace!("Page fault ({:?}) at {:#x}", kind, addr.as_u64());

    if kind == FaultKind::ReadOnly {
        warn!("Write to read-only page at {:#x}", addr.as_u64());
        return Err(VmError::ProtectionViolation(addr));
    }

    let process = current.ok_or(VmError::NoProcess)?;
    let space = process.address_space().ok_or(VmError::NoAddressSpace)?;
    let page: Page = Page::containing_address(addr);

    let Some(coverage) = space.coverage(addr) else {
        warn!("Segmentation fault at {:#x}", addr.as_u64());
        return Err(VmError::AddressingFault(addr));
    };

    let (frame, flags) = match space.page_table().lookup(addr).copied() {
        Some(entry) => {
            // translation was evicted from the cache; the mapping survives
            trace!("Page {:#x} already mapped", page.start_address().as_u64());
            (entry.frame, entry.flags)
        }
        None => {
            let flags = coverage.flags();
            check_access(kind, flags, addr)?;

            let frame = space.map_covered(frames, page, coverage).inspect_err(|_| {
                warn!("Out of memory resolving fault at {:#x}", addr.as_u64());
            })?;
            debug!(
                "Mapped {:#x} -> {:#x} ({:?})",
                page.start_address().as_u64(),
                frame.start_address().as_u64(),
                coverage
            );
            (frame, flags)
        }
    };
    check_access(kind, flags, addr)?;

    let entry = TlbEntry {
        asid: space.id(),
        page,
        frame,
        flags,
    };
    without_interrupts(|| tlb.insert_if_slot_free(entry)).inspect_err(|_| {
        error!("Translation cache full at {:#x}", addr.as_u64());
    })?;

    Ok(())
}

fn check_access(kind: FaultKind, flags: PageTableFlags, addr: VirtAddr) -> Result<(), VmError> {
    let present = flags.contains(PageTableFlags::PRESENT);
    let writable = flags.contains(PageTableFlags::WRITABLE);

    if !present || (kind == FaultKind::Write && !writable) {
        warn!("Protection violation ({:?}) at {:#x}", kind, addr.as_u64());
        return Err(VmError::ProtectionViolation(addr));
    }
    Ok(())
}
