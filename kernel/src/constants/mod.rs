//! System-wide constants and hardware-specific values.

pub mod memory;
