//! # x86-64
//!
//! Encoding helpers for the transfers written into patched code: absolute jumps for function
//! interception and rel32 displacement relocation for in-place call/jump rewrites.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, OpKind};
use thiserror::Error;

/// Size of the absolute jump generated by [`jmp_abs`]
pub const JMP_ABS_LEN: usize = 14;

/// Size of a rel32 displacement field
pub const REL32_LEN: usize = 4;

/// Errors while encoding a relative transfer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The bytes at the given offset could not be decoded
    #[error("no valid instruction at template offset {0}")]
    Invalid(usize),
    /// The instruction is not a near call/jmp/jcc with a 32-bit displacement
    #[error("instruction at template offset {0} is not a rel32 transfer")]
    NotRel32(usize),
    /// The instruction extends past the end of the template
    #[error("template of {len} bytes is too short for the instruction at offset {offset}")]
    TemplateTooShort {
        /// Offset of the instruction
        offset: usize,
        /// Length of the template
        len: usize,
    },
    /// The displacement does not fit in a signed 32-bit field
    #[error("displacement {0:#x} does not fit in 32 bits")]
    OutOfRange(i128),
}

/// Generates an absolute jump (`jmp [rip + 0]` followed by the 64-bit target) and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

/// Decodes a single rel32 near transfer from `bytes`, as if it was located at `ip`
fn decode_rel32(bytes: &[u8], ip: u64, offset: usize) -> Result<Instruction, EncodeError> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Err(EncodeError::Invalid(offset));
    }
    let is_transfer = matches!(
        instr.flow_control(),
        FlowControl::Call | FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch
    );
    if !is_transfer || instr.op0_kind() != OpKind::NearBranch64 || instr.len() < 1 + REL32_LEN {
        return Err(EncodeError::NotRel32(offset));
    }

    // rel8 forms with prefixes can be long enough to pass the length check, so make sure the
    // trailing four bytes really are the displacement
    let field = &bytes[instr.len() - REL32_LEN..instr.len()];
    let rel = i32::from_le_bytes([field[0], field[1], field[2], field[3]]);
    if instr.next_ip().wrapping_add(rel as i64 as u64) != instr.near_branch_target() {
        return Err(EncodeError::NotRel32(offset));
    }
    Ok(instr)
}

/// Computes the displacement for a relative transfer whose encoding starts at
/// `source + insn_offset` and is `insn_len` bytes long, so that it lands on `target`
pub fn displacement(
    source: usize,
    insn_offset: usize,
    insn_len: usize,
    target: usize,
) -> Result<i32, EncodeError> {
    let next_ip = source as i128 + insn_offset as i128 + insn_len as i128;
    let value = target as i128 - next_ip;
    i32::try_from(value).map_err(|_| EncodeError::OutOfRange(value))
}

/// Rewrites the rel32 call/jmp/jcc at `insn_offset` in `template` so that, once the template is
/// written at `source`, the transfer lands on `target`.
///
/// The computed value is `target - (source + insn_offset + insn_len)`. Nothing is produced if
/// that does not fit in the 32-bit field.
pub fn relocate(
    template: &[u8],
    insn_offset: usize,
    source: usize,
    target: usize,
) -> Result<Vec<u8>, EncodeError> {
    let bytes = template
        .get(insn_offset..)
        .filter(|bytes| !bytes.is_empty())
        .ok_or(EncodeError::TemplateTooShort {
            offset: insn_offset,
            len: template.len(),
        })?;
    let ip = (source as u64).wrapping_add(insn_offset as u64);
    let instr = decode_rel32(bytes, ip, insn_offset)?;
    if insn_offset + instr.len() > template.len() {
        return Err(EncodeError::TemplateTooShort {
            offset: insn_offset,
            len: template.len(),
        });
    }

    let rel = displacement(source, insn_offset, instr.len(), target)?;
    let field = insn_offset + instr.len() - REL32_LEN;
    let mut out = template.to_vec();
    out[field..field + REL32_LEN].copy_from_slice(&rel.to_le_bytes());
    Ok(out)
}

/// Returns the destination of the rel32 call/jmp/jcc encoded at the start of `bytes`, which
/// lives at `address`
pub fn branch_target(bytes: &[u8], address: usize) -> Result<usize, EncodeError> {
    decode_rel32(bytes, address as u64, 0).map(|instr| instr.near_branch_target() as usize)
}
