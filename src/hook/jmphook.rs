//! # Jump Hook
//!
//! Redirects a routine with a 14 byte `jmp [rip+0]` followed by the absolute destination, so the
//! hook can live anywhere in the address space

use crate::{
    code::x64::jmp_abs,
    patcher::{PatchGuard, Patcher},
};

use super::{Hook, HookGuard};

/// Absolute jump hook
pub struct JmpHook<P> {
    /// Writes the jump
    patcher: P,
}
impl<P: Patcher> JmpHook<P> {
    /// Creates a hook that writes through `patcher`
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}
unsafe impl<P: Patcher> Hook for JmpHook<P> {
    type Error = P::Error;
    type Guard<'a> = JmpHookGuard<P::Guard<'a>>
    where
        Self: 'a;

    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard<'_>, Self::Error> {
        let patch = self
            .patcher
            .patch(source as _, &jmp_abs(destination as _))?;

        Ok(JmpHookGuard::new(patch))
    }
}

/// An installed jump
pub struct JmpHookGuard<G: PatchGuard> {
    /// Bytes the jump replaced
    guard: G,
}
impl<G: PatchGuard> JmpHookGuard<G> {
    /// Wraps the guard of the written jump
    fn new(guard: G) -> Self {
        Self { guard }
    }
    /// Guard of the written jump
    pub fn patch(&self) -> &G {
        &self.guard
    }
}
unsafe impl<G: PatchGuard> HookGuard for JmpHookGuard<G> {
    fn commit(self) {
        self.guard.commit()
    }
}
