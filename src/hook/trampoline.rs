//! # Trampoline
//!
//! Builds callable copies of a routine's entry. The instructions that are about to be
//! overwritten by a hook are re-encoded into executable memory and followed by an absolute jump
//! back to the rest of the original routine.

use std::ptr;
use std::sync::{Mutex, PoisonError};

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, IcedError,
    Instruction, InstructionBlock,
};
use lazy_static::lazy_static;
use region::Protection;
use thiserror::Error;

use crate::code::x64::{jmp_abs, JMP_ABS_LEN};
use crate::host::Trampoline;

/// Longest possible x86-64 instruction
pub const MAX_INSTR_LEN: usize = 15;

/// Errors while building a trampoline
#[derive(Debug, Error)]
pub enum TrampolineError {
    /// The entry of the routine could not be decoded
    #[error("undecodable instruction at {0:#x}")]
    Decode(usize),
    /// The entry leaves the routine before enough bytes could be moved
    #[error("instruction at {0:#x} changes control flow inside the hooked prologue")]
    ControlFlow(usize),
    /// The moved instructions could not be re-encoded at the new location
    #[error("{0}")]
    Encode(#[from] IcedError),
    /// Executable memory could not be allocated
    #[error("{0}")]
    Alloc(#[from] region::Error),
    /// The re-encoded code did not fit the allocation
    #[error("relocated prologue of {0} bytes does not fit its buffer")]
    TooLarge(usize),
    /// The allocation landed at address zero
    #[error("trampoline allocated at null")]
    Null,
}

/// Allocation that keeps trampoline code alive
#[allow(dead_code)]
struct Slot(region::Allocation);

// Safety: the allocation is never accessed through the pool, it only keeps the mapping alive
unsafe impl Send for Slot {}

lazy_static! {
    /// Trampolines that have been handed out. They are never freed since hooks are never removed.
    static ref POOL: Mutex<Vec<Slot>> = Mutex::new(Vec::new());
}

/// A relocated prologue that has not been handed out yet. Dropping it frees the code.
pub struct TrampolineBuffer {
    /// Executable memory holding the code
    memory: region::Allocation,
    /// Number of bytes of code
    len: usize,
    /// Number of bytes of the original routine that were moved
    moved: usize,
}

impl TrampolineBuffer {
    /// Address of the first instruction
    pub fn address(&self) -> usize {
        self.memory.as_ptr::<u8>() as usize
    }

    /// Code of the trampoline
    pub fn code(&self) -> &[u8] {
        // Safety: `len` bytes were written into the allocation when it was built
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr::<u8>(), self.len) }
    }

    /// Number of bytes taken from the original routine
    pub fn moved(&self) -> usize {
        self.moved
    }

    /// Entry of the trampoline
    pub fn trampoline(&self) -> Result<Trampoline, TrampolineError> {
        Trampoline::new(self.address()).ok_or(TrampolineError::Null)
    }

    /// Keeps the code alive for the rest of the process
    pub fn keep(self) {
        POOL.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Slot(self.memory));
    }
}

/// Decodes whole instructions from `location` until at least `min_len` bytes are covered
///
/// # Safety
///
/// `location` must be readable for `min_len + MAX_INSTR_LEN - 1` bytes
unsafe fn decode_prologue(
    location: usize,
    min_len: usize,
) -> Result<(Vec<Instruction>, usize), TrampolineError> {
    // Add MAX_INSTR_LEN - 1 in case we end on the first byte of the longest instruction
    let data = std::slice::from_raw_parts(location as *const u8, min_len + MAX_INSTR_LEN - 1);
    let mut decoder = Decoder::with_ip(64, data, location as u64, DecoderOptions::NONE);

    let mut instructions = vec![];
    let mut covered = 0;
    while covered < min_len {
        let instr = decoder.decode();
        let ip = instr.ip() as usize;
        if instr.is_invalid() {
            return Err(TrampolineError::Decode(ip));
        }
        // anything but straight-line code and calls could jump back into the bytes we replace
        if !matches!(instr.flow_control(), FlowControl::Next | FlowControl::Call) {
            return Err(TrampolineError::ControlFlow(ip));
        }
        covered += instr.len();
        instructions.push(instr);
    }
    Ok((instructions, covered))
}

/// Copies enough of the routine at `location` to make room for a `min_len` byte patch.
///
/// # Safety
///
/// `location` must point to the start of a routine and be readable for
/// `min_len + MAX_INSTR_LEN - 1` bytes
pub unsafe fn relocate_prologue(
    location: usize,
    min_len: usize,
) -> Result<TrampolineBuffer, TrampolineError> {
    let (instructions, moved) = decode_prologue(location, min_len)?;

    // Re-encoding can grow instructions (rel8 branches, far rip-relative operands), so leave
    // headroom for every moved instruction to reach the maximum length
    let capacity = instructions.len() * MAX_INSTR_LEN + JMP_ABS_LEN;
    let mut memory = region::alloc(capacity, Protection::READ_WRITE_EXECUTE)?;
    let rip = memory.as_ptr::<u8>() as u64;

    let block = InstructionBlock::new(&instructions, rip);
    let mut code = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?.code_buffer;
    code.extend_from_slice(&jmp_abs(location + moved));
    if code.len() > capacity {
        return Err(TrampolineError::TooLarge(code.len()));
    }

    ptr::copy_nonoverlapping(code.as_ptr(), memory.as_mut_ptr::<u8>(), code.len());
    Ok(TrampolineBuffer {
        memory,
        len: code.len(),
        moved,
    })
}
