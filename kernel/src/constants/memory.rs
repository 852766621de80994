pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// First address past the lower canonical half; user regions end at or below it.
pub const USER_SPACE_END: u64 = 0x8000_0000_0000;
/// Top of every user stack; the initial stack pointer handed to new processes.
pub const USERSTACK: u64 = 0x7000_0000_0000;
/// Heap base for an address space that declares no regions.
pub const DEFAULT_HEAP_START: u64 = 0x1000_0000;

/// Slots in the software-refilled translation cache.
pub const NUM_TLB: usize = 64;

pub const INITIAL_PAGE_TABLE_CAPACITY: usize = 64;
pub const INITIAL_REGION_CAPACITY: usize = 4;

// Firmware holes tracked at boot; memory past the last trackable hole is dropped
pub const MAX_MEMORY_HOLES: usize = 32;
