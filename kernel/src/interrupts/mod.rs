//! Local interrupt masking
//!
//! The translation cache has no lock of its own; its read-modify-write
//! sequences run with interrupts disabled on the current CPU. Hosted builds
//! have no interrupts to mask and run the closure directly.

/// Executes a closure with interrupts disabled, restoring the previous state after.
///
/// # Arguments
/// * `f` - The closure to execute
///
/// # Returns
/// Returns the result of the closure
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    #[cfg(all(feature = "hardware", target_arch = "x86_64"))]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }

    #[cfg(not(all(feature = "hardware", target_arch = "x86_64")))]
    {
        f()
    }
}
