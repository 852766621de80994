//! Program loading
//!
//! Runs the load protocol against a fresh address space: declare every
//! segment, back them all with writable frames, copy the file bytes in, then
//! drop to the declared permissions.

use x86_64::VirtAddr;

use crate::{
    debug,
    memory::{address_space::AddressSpace, error::VmError, frame_allocator::FrameAllocator},
    processes::process::Process,
};

/// One loadable segment of a program image.
///
/// Bytes past `data.len()` up to `mem_size` read as zero.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub vaddr: VirtAddr,
    pub data: &'a [u8],
    pub mem_size: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// Loads `segments` into `space`
///
/// # Returns
/// The initial stack pointer
pub fn load_segments(
    space: &mut AddressSpace,
    frames: &FrameAllocator,
    segments: &[Segment],
) -> Result<VirtAddr, VmError> {
    for segment in segments {
        let size = segment.mem_size.max(segment.data.len() as u64);
        space.define_region(
            segment.vaddr,
            size,
            segment.readable,
            segment.writable,
            segment.executable,
        )?;
    }

    space.prepare_load(frames)?;
    for segment in segments {
        space.write_bytes(frames, segment.vaddr, segment.data)?;
    }
    space.complete_load();

    Ok(space.define_stack())
}

/// Builds a process running `segments` from `entry_point`.
///
/// On failure the half-built address space is destroyed.
pub fn create_process(
    frames: &FrameAllocator,
    segments: &[Segment],
    entry_point: VirtAddr,
) -> Result<Process, VmError> {
    let mut space = AddressSpace::create()?;

    match load_segments(&mut space, frames, segments) {
        Ok(stack_pointer) => {
            let process = Process::new(space, entry_point, stack_pointer);
            debug!(
                "Loaded process {}: entry {:#x}",
                process.pid,
                entry_point.as_u64()
            );
            Ok(process)
        }
        Err(err) => {
            space.destroy(frames);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::memory::{PAGE_SIZE, USERSTACK},
        memory::{test_support::TestRam, tlb::SoftTlb},
        processes::process::CurrentProcess,
    };

    const CODE: [u8; 6] = [0x48, 0x31, 0xc0, 0x0f, 0x05, 0xc3];

    fn image(data: &[u8]) -> [Segment<'_>; 2] {
        [
            Segment {
                vaddr: VirtAddr::new(0x40_0000),
                data: &CODE,
                mem_size: CODE.len() as u64,
                readable: true,
                writable: false,
                executable: true,
            },
            Segment {
                vaddr: VirtAddr::new(0x60_0010),
                data,
                mem_size: 2 * PAGE_SIZE,
                readable: true,
                writable: true,
                executable: false,
            },
        ]
    }

    #[test]
    fn test_create_process_loads_image() {
        let ram = TestRam::new(32);
        let frames = ram.frame_allocator();
        let segments = image(b"data");

        let mut process =
            create_process(&frames, &segments, VirtAddr::new(0x40_0000)).expect("process");
        assert_eq!(process.stack_pointer(), VirtAddr::new(USERSTACK));

        let space = process.address_space().expect("space");
        let mut code = [0u8; 6];
        space
            .read_bytes(&frames, VirtAddr::new(0x40_0000), &mut code)
            .expect("read");
        assert_eq!(code, CODE);

        // bss after the file bytes is zero
        let mut data = [0xffu8; 8];
        space
            .read_bytes(&frames, VirtAddr::new(0x60_0010), &mut data)
            .expect("read");
        assert_eq!(&data, b"data\0\0\0\0");

        let text = space
            .page_table()
            .lookup(VirtAddr::new(0x40_0000))
            .expect("text");
        assert!(!text.is_writable());

        process.exit(0, &frames, &mut SoftTlb::<4>::new());
    }

    #[test]
    fn test_failed_load_releases_frames() {
        let ram = TestRam::new(8);
        let frames = ram.frame_allocator();
        let before = frames.free_frames();
        let huge = Segment {
            vaddr: VirtAddr::new(0x40_0000),
            data: &[],
            mem_size: (before as u64 + 1) * PAGE_SIZE,
            readable: true,
            writable: true,
            executable: false,
        };

        let result = create_process(&frames, &[huge], VirtAddr::new(0x40_0000));

        assert_eq!(result.err(), Some(VmError::OutOfMemory));
        assert_eq!(frames.free_frames(), before);
    }
}
