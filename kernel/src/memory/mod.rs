//! Demand-paged virtual memory
//!
//! - `frame_allocator`: physical frames, contiguous blocks, bootstrapped from
//!   the boot memory map through the early-boot stealer
//! - `page_table` / `region`: per-address-space translations and declared ranges
//! - `address_space`: load protocol, fork copies, teardown
//! - `fault`: first-touch allocation and translation cache install
//!
//! The frame allocator is constructed once at boot and passed by reference
//! to everything that needs frames.

pub mod address_space;
pub mod boot_frame_allocator;
pub mod error;
pub mod fault;
pub mod frame_allocator;
pub mod memory_map;
pub mod page_table;
pub mod region;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::VmError;
pub use frame_allocator::FrameAllocator;
