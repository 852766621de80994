//! Process-layer collaborators of the VM subsystem

pub mod loader;
pub mod process;
