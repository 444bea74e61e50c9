//! # Native
//!
//! A [`CodeWriter`] for code mapped into the current address space. Bytes are written through a
//! [`PermissionWrapper`] so read-only code pages can be patched, and routines are intercepted
//! with an absolute [`JmpHook`] backed by a relocated prologue.

use thiserror::Error;
use tracing::debug;

use crate::code::x64::JMP_ABS_LEN;
use crate::host::{CodeWriter, HostError, Trampoline};
use crate::patcher::byte::BytePatcher;
use crate::patcher::mem::{PermissionError, PermissionWrapper};
use crate::patcher::{PatchGuard, Patcher};

use super::jmphook::JmpHook;
use super::trampoline::{relocate_prologue, TrampolineError, MAX_INSTR_LEN};
use super::{Hook, HookGuard};

/// Errors while installing a native transfer
#[derive(Debug, Error)]
pub enum InstallError {
    /// The original routine could not be copied
    #[error("{0}")]
    Trampoline(#[from] TrampolineError),
    /// The jump into the hook could not be written
    #[error("{0}")]
    Patch(#[from] PermissionError<()>),
}

/// Reads and patches code in the current process
pub struct NativeWriter {
    /// Patcher used for every write
    patcher: PermissionWrapper<BytePatcher>,
}

impl NativeWriter {
    /// Creates a writer for the current process
    ///
    /// # Safety
    ///
    /// The writer trusts every address it is given. Callers must only pass addresses of mapped
    /// module code (as reported by the host) and hooks that are valid routines.
    pub unsafe fn new() -> Self {
        Self {
            patcher: PermissionWrapper::new(BytePatcher::new()),
        }
    }

    /// Checks that `address..address + len` is mapped and readable
    fn readable(address: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let Ok(regions) = region::query_range(address as *const u8, len) else {
            return false;
        };
        let mut end = address;
        for region in regions {
            match region {
                Ok(region) if region.is_readable() && region.as_range().start <= end => {
                    end = region.as_range().end;
                }
                _ => return false,
            }
        }
        end >= address + len
    }

    /// Redirects `address` to `hook`, returning the trampoline on success
    ///
    /// # Safety
    ///
    /// See [`NativeWriter::new`]
    unsafe fn route(&self, address: usize, hook: usize) -> Result<Trampoline, InstallError> {
        let buffer = relocate_prologue(address, JMP_ABS_LEN)?;
        debug!(
            address,
            moved = buffer.moved(),
            trampoline = buffer.address(),
            "relocated prologue"
        );

        let trampoline = buffer.trampoline()?;

        // the buffer is freed if the jump cannot be written
        let jmp = JmpHook::new(PermissionWrapper::new(BytePatcher::new()));
        let guard = jmp.hook(address as *const u8, hook as *const u8)?;
        guard.commit();
        buffer.keep();
        Ok(trampoline)
    }
}

impl CodeWriter for NativeWriter {
    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>, HostError> {
        if !Self::readable(address, len) {
            return Err(HostError::Read { address, len });
        }
        // Safety: the range was checked to be mapped and readable
        Ok(unsafe { std::slice::from_raw_parts(address as *const u8, len) }.to_vec())
    }

    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<(), HostError> {
        // Safety: the caller of `NativeWriter::new` vouched for the addresses we are given
        unsafe { self.patcher.patch(address as *mut u8, bytes) }
            .map(PatchGuard::commit)
            .map_err(|_| HostError::Write {
                address,
                len: bytes.len(),
            })
    }

    fn install_transfer(&self, address: usize, hook: usize) -> Result<Trampoline, HostError> {
        if !Self::readable(address, JMP_ABS_LEN + MAX_INSTR_LEN - 1) {
            return Err(HostError::Read {
                address,
                len: JMP_ABS_LEN + MAX_INSTR_LEN - 1,
            });
        }
        // Safety: see `NativeWriter::new`
        unsafe { self.route(address, hook) }.map_err(|e| HostError::Route {
            address,
            reason: e.to_string(),
        })
    }
}
