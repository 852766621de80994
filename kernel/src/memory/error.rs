use x86_64::VirtAddr;

pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;

/// Failures surfaced by the virtual memory subsystem.
///
/// Everything here is recoverable by the caller. Corrupted shared state
/// (freeing a non-head frame, mapping a page twice) panics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A frame or a bookkeeping allocation could not be satisfied.
    OutOfMemory,
    /// Access outside every region and the stack/heap bounds.
    AddressingFault(VirtAddr),
    /// Write to a read-only mapping.
    ProtectionViolation(VirtAddr),
    /// Fault taken with no current process (early boot).
    NoProcess,
    /// Fault taken by a process that has no address space yet.
    NoAddressSpace,
    /// Every translation cache slot holds a valid entry.
    TranslationCacheFull,
}

impl VmError {
    /// Error code handed back to user space by the syscall layer.
    pub fn errno(&self) -> i32 {
        match self {
            VmError::OutOfMemory => ENOMEM,
            _ => EFAULT,
        }
    }

    /// Whether the faulting process should be terminated rather than the
    /// triggering call failed.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            VmError::AddressingFault(_) | VmError::ProtectionViolation(_)
        )
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "Out of memory"),
            VmError::AddressingFault(addr) => {
                write!(f, "Segmentation fault at {:#x}", addr.as_u64())
            }
            VmError::ProtectionViolation(addr) => {
                write!(f, "Write to read-only page at {:#x}", addr.as_u64())
            }
            VmError::NoProcess => write!(f, "Fault with no current process"),
            VmError::NoAddressSpace => write!(f, "Fault with no address space"),
            VmError::TranslationCacheFull => write!(f, "Ran out of TLB entries"),
        }
    }
}
