use crate::{
    debug,
    memory::{error::VmError, frame_allocator::FrameAllocator},
    processes::process::{CurrentProcess, Process},
};

/// Duplicates `parent` into a new ready process with its own copy of memory.
///
/// # Returns
/// The child, or the error that stopped the copy; nothing is leaked on failure
pub fn sys_fork(parent: &mut Process, frames: &FrameAllocator) -> Result<Process, VmError> {
    let space = parent.address_space().ok_or(VmError::NoAddressSpace)?;
    let child_space = space.copy(frames)?;

    let child = parent.fork_with(child_space);
    debug!("Process {} forked child {}", parent.pid, child.pid);
    Ok(child)
}

#[cfg(test)]
mod tests {
    use x86_64::VirtAddr;

    use super::*;
    use crate::{
        constants::memory::PAGE_SIZE,
        memory::{test_support::TestRam, tlb::SoftTlb},
        processes::{
            loader::{create_process, Segment},
            process::ProcessState,
        },
    };

    fn data_segment(bytes: &[u8], pages: u64) -> Segment<'_> {
        Segment {
            vaddr: VirtAddr::new(0x60_0000),
            data: bytes,
            mem_size: pages * PAGE_SIZE,
            readable: true,
            writable: true,
            executable: false,
        }
    }

    #[test]
    fn test_fork_copies_memory() {
        let ram = TestRam::new(32);
        let frames = ram.frame_allocator();
        let mut tlb = SoftTlb::<4>::new();
        let mut parent =
            create_process(&frames, &[data_segment(b"parent", 1)], VirtAddr::new(0x60_0000))
                .expect("parent");

        let mut child = sys_fork(&mut parent, &frames).expect("fork");

        assert_ne!(child.pid, parent.pid);
        assert_eq!(child.state(), ProcessState::Ready);
        assert_eq!(child.entry_point(), parent.entry_point());

        let child_space = child.address_space().expect("space");
        child_space
            .write_bytes(&frames, VirtAddr::new(0x60_0000), b"child!")
            .expect("write");

        let mut buf = [0u8; 6];
        parent
            .address_space()
            .expect("space")
            .read_bytes(&frames, VirtAddr::new(0x60_0000), &mut buf)
            .expect("read");
        assert_eq!(&buf, b"parent");

        child.exit(0, &frames, &mut tlb);
        parent.exit(0, &frames, &mut tlb);
    }

    #[test]
    fn test_fork_out_of_memory() {
        let ram = TestRam::new(16);
        let frames = ram.frame_allocator();
        let mut tlb = SoftTlb::<4>::new();
        let pages = frames.free_frames() as u64 / 2;
        let mut parent =
            create_process(&frames, &[data_segment(&[], pages)], VirtAddr::new(0x60_0000))
                .expect("parent");
        let before = frames.free_frames();

        assert_eq!(sys_fork(&mut parent, &frames).err(), Some(VmError::OutOfMemory));
        assert_eq!(frames.free_frames(), before);

        parent.exit(0, &frames, &mut tlb);
    }

    #[test]
    fn test_fork_after_exit() {
        let ram = TestRam::new(16);
        let frames = ram.frame_allocator();
        let mut tlb = SoftTlb::<4>::new();
        let mut parent = create_process(&frames, &[], VirtAddr::zero()).expect("parent");
        parent.exit(0, &frames, &mut tlb);

        assert_eq!(sys_fork(&mut parent, &frames).err(), Some(VmError::NoAddressSpace));
    }
}
