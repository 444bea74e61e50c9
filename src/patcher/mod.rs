//! # Patcher
//!
//! In-place byte writes that remember what they replaced. Module code is rewritten through a
//! [`PermissionWrapper`](mem::PermissionWrapper) around a [`BytePatcher`](byte::BytePatcher).

pub mod byte;
pub mod mem;

/// Overwrites memory and hands back a guard holding the old contents
///
/// # Safety
///
/// Implementors must write exactly `patch.len()` bytes at the target
pub unsafe trait Patcher {
    /// Error returned when the write can't be done. `()` for patchers that can't fail.
    type Error;
    /// Restores the old contents when dropped
    type Guard<'a>: PatchGuard + 'a
    where
        Self: 'a;

    /// Writes `patch` to `target`
    ///
    /// # Safety
    ///
    /// `target` must be valid for `patch.len()` bytes as far as the patcher requires
    unsafe fn patch<'a>(
        &'a self,
        target: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error>;
}

/// Old contents of a patched location
///
/// # Safety
///
/// Dropping the guard must restore the location unless `commit` was called
pub unsafe trait PatchGuard: Sized {
    /// Restores the old contents now
    fn restore(self) {
        // dropping does the work
    }

    /// Keeps the new contents for good. The old bytes are leaked.
    fn commit(self) {
        std::mem::forget(self)
    }
}
