use core::sync::atomic::{AtomicU32, Ordering};

use x86_64::VirtAddr;

use crate::{
    debug,
    memory::{
        address_space::AddressSpace, error::VmError, frame_allocator::FrameAllocator,
        tlb::TranslationCache,
    },
};

// process counter must be thread-safe
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// What the VM layer needs to know about the running process.
pub trait CurrentProcess {
    fn address_space(&mut self) -> Option<&mut AddressSpace>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug)]
pub struct Process {
    pub pid: u32,
    state: ProcessState,
    address_space: Option<AddressSpace>,
    entry_point: VirtAddr,
    stack_pointer: VirtAddr,
    exit_status: Option<i32>,
}

impl Process {
    pub fn new(
        address_space: AddressSpace,
        entry_point: VirtAddr,
        stack_pointer: VirtAddr,
    ) -> Self {
        let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
        debug!("Process {} created", pid);

        Process {
            pid,
            state: ProcessState::New,
            address_space: Some(address_space),
            entry_point,
            stack_pointer,
            exit_status: None,
        }
    }

    /// A child sharing this process's entry and stack pointer, running in `address_space`.
    pub fn fork_with(&self, address_space: AddressSpace) -> Self {
        let mut child = Process::new(address_space, self.entry_point, self.stack_pointer);
        child.state = ProcessState::Ready;
        child
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn entry_point(&self) -> VirtAddr {
        self.entry_point
    }

    pub fn stack_pointer(&self) -> VirtAddr {
        self.stack_pointer
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Makes this process the one the processor translates for.
    pub fn run<T: TranslationCache>(&mut self, tlb: &mut T) {
        if let Some(space) = &self.address_space {
            space.activate(tlb);
        }
        self.state = ProcessState::Running;
    }

    /// Takes the processor away from this process.
    pub fn preempt<T: TranslationCache>(&mut self, tlb: &mut T) {
        if let Some(space) = &self.address_space {
            space.deactivate(tlb);
        }
        self.state = ProcessState::Ready;
    }

    /// Terminates the process with `status`, dropping its cached
    /// translations and releasing its memory.
    pub fn exit<T: TranslationCache>(&mut self, status: i32, frames: &FrameAllocator, tlb: &mut T) {
        if let Some(space) = self.address_space.take() {
            space.deactivate(tlb);
            space.destroy(frames);
        }
        self.state = ProcessState::Terminated;
        self.exit_status = Some(status);
        debug!("Process {} exited with {}", self.pid, status);
    }

    /// Terminates the process if `err` is fatal to it.
    ///
    /// # Returns
    /// true if the process was terminated
    pub fn kill_on_fault<T: TranslationCache>(
        &mut self,
        err: VmError,
        frames: &FrameAllocator,
        tlb: &mut T,
    ) -> bool {
        if !err.is_fatal_to_process() {
            return false;
        }
        debug!("Process {}: {}", self.pid, err);
        self.exit(-err.errno(), frames, tlb);
        true
    }
}

impl CurrentProcess for Process {
    fn address_space(&mut self) -> Option<&mut AddressSpace> {
        self.address_space.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        error::EFAULT,
        fault::{handle_page_fault, FaultKind},
        test_support::TestRam,
        tlb::{SoftTlb, TlbEntry},
    };
    use x86_64::structures::paging::{Page, PageTableFlags};

    fn idle() -> Process {
        let space = AddressSpace::create().expect("space");
        Process::new(space, VirtAddr::zero(), VirtAddr::zero())
    }

    #[test]
    fn test_pids_are_unique() {
        let a = idle();
        let b = idle();

        assert_ne!(a.pid, b.pid);
        assert_eq!(a.state(), ProcessState::New);
    }

    #[test]
    fn test_exit_releases_memory() {
        let ram = TestRam::new(16);
        let frames = ram.frame_allocator();
        let before = frames.free_frames();
        let mut space = AddressSpace::create().expect("space");
        space.prepare_load(&frames).expect("prepare");
        let mut process = Process::new(space, VirtAddr::new(0x40_0000), VirtAddr::zero());
        assert!(frames.free_frames() < before);

        process.exit(3, &frames, &mut SoftTlb::<4>::new());

        assert_eq!(frames.free_frames(), before);
        assert_eq!(process.state(), ProcessState::Terminated);
        assert_eq!(process.exit_status(), Some(3));
        assert!(process.address_space().is_none());
    }

    #[test]
    fn test_fatal_faults_kill() {
        let ram = TestRam::new(16);
        let frames = ram.frame_allocator();
        let mut tlb = SoftTlb::<4>::new();
        let mut process = idle();

        assert!(!process.kill_on_fault(VmError::OutOfMemory, &frames, &mut tlb));
        assert_ne!(process.state(), ProcessState::Terminated);

        let err = VmError::AddressingFault(VirtAddr::new(0xdead));
        assert!(process.kill_on_fault(err, &frames, &mut tlb));
        assert_eq!(process.exit_status(), Some(-EFAULT));
    }

    #[test]
    fn test_run_and_preempt_flush_own_translations() {
        let ram = TestRam::new(16);
        let frames = ram.frame_allocator();
        let mut tlb = SoftTlb::<4>::new();
        let mut process = idle();
        let asid = process.address_space().expect("space").id();
        let entry = TlbEntry {
            asid,
            page: Page::containing_address(VirtAddr::new(0x1000)),
            frame: ram.frame(2),
            flags: PageTableFlags::PRESENT,
        };

        tlb.insert_if_slot_free(entry).expect("slot");
        process.run(&mut tlb);
        assert!(tlb.is_empty());
        assert_eq!(process.state(), ProcessState::Running);

        tlb.insert_if_slot_free(entry).expect("slot");
        process.preempt(&mut tlb);
        assert!(tlb.is_empty());
        assert_eq!(process.state(), ProcessState::Ready);

        process.exit(0, &frames, &mut tlb);
    }

    #[test]
    fn test_blocked_process_keeps_its_memory() {
        let ram = TestRam::new(16);
        let frames = ram.frame_allocator();
        let mut process = idle();

        process.set_state(ProcessState::Blocked);
        assert_eq!(process.state(), ProcessState::Blocked);
        assert!(process.address_space().is_some());

        process.set_state(ProcessState::Ready);
        assert_eq!(process.state(), ProcessState::Ready);
        process.exit(0, &frames, &mut SoftTlb::<4>::new());
    }

    #[test]
    fn test_exit_frees_translation_cache_slots() {
        let ram = TestRam::new(16);
        let frames = ram.frame_allocator();
        let mut tlb = SoftTlb::<2>::new();
        let program = |base: u64| {
            let mut space = AddressSpace::create().expect("space");
            space
                .define_region(VirtAddr::new(base), 2 * 0x1000, true, true, false)
                .expect("region");
            Process::new(space, VirtAddr::new(base), VirtAddr::zero())
        };

        let mut first = program(0x40_0000);
        first.run(&mut tlb);
        for addr in [0x40_0000, 0x40_1000] {
            let addr = VirtAddr::new(addr);
            handle_page_fault(&frames, &mut tlb, Some(&mut first), FaultKind::Read, addr)
                .expect("fault");
        }
        assert_eq!(tlb.len(), 2);

        first.exit(0, &frames, &mut tlb);
        assert!(tlb.is_empty());

        let mut second = program(0x80_0000);
        second.run(&mut tlb);
        for addr in [0x80_0000, 0x80_1000] {
            let addr = VirtAddr::new(addr);
            handle_page_fault(&frames, &mut tlb, Some(&mut second), FaultKind::Read, addr)
                .expect("fault");
        }
        assert_eq!(tlb.len(), 2);

        second.exit(0, &frames, &mut tlb);
    }
}
