//! This module contains a patcher which adjusts memory permissions to patch read-only data

use region::Protection;
use thiserror::Error;
use tracing::warn;

use super::{PatchGuard, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0:?}")]
    CustomError(E),
}
impl From<()> for PermissionError<()> {
    fn from(e: ()) -> Self {
        Self::CustomError(e)
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard<'a> = PermissionWrapperGuard<P::Guard<'a>> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        // executable code must stay executable while it is being rewritten
        let _guard =
            region::protect_with_handle(location, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        self.patcher
            .patch(location, patch)
            .map(|g| PermissionWrapperGuard::guard(g, location, patch.len()))
            .map_err(Into::into)
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Location of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, location: *const u8, len: usize) -> Self {
        Self {
            guard: Some(guard),
            location,
            len,
        }
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        // Safety: the same range was made writable when the patch was applied
        match unsafe {
            region::protect_with_handle(self.location, self.len, Protection::READ_WRITE_EXECUTE)
        } {
            Ok(_protection) => guard.restore(),
            Err(e) => {
                warn!(
                    location = ?self.location,
                    len = self.len,
                    "unable to restore patch: {e}"
                );
                guard.commit();
            }
        }
    }
}
