//! System calls backed by the VM subsystem

use crate::memory::error::VmError;

pub mod fork;

/// Encodes a syscall result for user space: the value on success, `-errno` on failure.
pub fn syscall_return(result: Result<u64, VmError>) -> i64 {
    match result {
        Ok(value) => value as i64,
        Err(err) => -(err.errno() as i64),
    }
}
