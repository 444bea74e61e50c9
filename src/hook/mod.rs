//! # Hook
//!
//! Transfers that send execution of an intercepted routine somewhere else. [`native`] puts them
//! together with [`trampoline`] into a [`CodeWriter`](crate::host::CodeWriter) for code mapped
//! in the current process.

pub mod jmphook;
pub mod native;
pub mod trampoline;

/// Writes a transfer from one routine to another
///
/// # Safety
///
/// Implementors overwrite the start of `source`; nothing else may be touched
pub unsafe trait Hook {
    /// Error returned when the transfer can't be written
    type Error;
    /// Keeps the transfer installed while alive
    type Guard<'a>: HookGuard + 'a
    where
        Self: 'a;

    /// Sends execution of `source` to `destination`
    ///
    /// # Safety
    ///
    /// - `source` must be the start of a routine that is long enough for the transfer
    /// - `destination` must be executable code with the same calling convention
    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard<'_>, Self::Error>;
}

/// An installed transfer
///
/// # Safety
///
/// Dropping the guard or calling `unhook` must restore the routine. `commit` must leave it
/// redirected.
pub unsafe trait HookGuard: Sized {
    /// Restores the routine now
    fn unhook(self) {
        // dropping does the work
    }

    /// Keeps the transfer for the rest of the process
    fn commit(self);
}
