#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod syscalls;

pub use memory::{FrameAllocator, VmError};
