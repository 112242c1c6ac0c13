//! C1: decode/encode/disassembly wrapper around `iced-x86`.
//!
//! This is the one place the engine talks to an external decoder/encoder;
//! everything above this crate works with `iced_x86::Instruction` values
//! rather than raw bytes.

use dbi_core::InstMetadata;
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, Formatter, Instruction,
    InstructionBlock, IntelFormatter,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid opcode at address {addr:#x}")]
    InvalidOpcode { addr: u64 },
    #[error("instruction at {addr:#x} decoded as zero bytes")]
    ZeroLength { addr: u64 },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("block encoder failed: {0}")]
    Iced(#[from] iced_x86::IcedError),
}

pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Decode a single instruction at `address` from `code`. `code` must have
/// at least `MAX_INSTRUCTION_LEN` bytes available past `address`'s offset
/// unless the caller knows the buffer ends exactly at a valid boundary.
pub fn decode_one(code: &[u8], address: u64) -> Result<InstMetadata, DecodeError> {
    let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(DecodeError::InvalidOpcode { addr: address });
    }
    let inst = decoder.decode();
    if inst.is_invalid() {
        return Err(DecodeError::InvalidOpcode { addr: address });
    }
    let len = inst.len() as u32;
    if len == 0 {
        return Err(DecodeError::ZeroLength { addr: address });
    }
    Ok(InstMetadata::new(inst, address, len))
}

/// Decode every instruction in `code` until exhausted or an invalid
/// opcode is hit, starting instructions at `address`.
pub fn decode_block(code: &[u8], address: u64) -> Result<Vec<InstMetadata>, DecodeError> {
    let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        let ip = decoder.ip();
        let inst = decoder.decode();
        if inst.is_invalid() {
            return Err(DecodeError::InvalidOpcode { addr: ip });
        }
        out.push(InstMetadata::new(inst, ip, inst.len() as u32));
    }
    Ok(out)
}

/// Re-encode a sequence of (already address-relocated) instructions at
/// `new_base`, relocating any RIP-relative references as needed. Used
/// when a patch's `ModifyInstruction` generator rewrites an operand but
/// the instruction itself (e.g. a RIP-relative `lea`) still needs
/// re-encoding rather than a byte-for-byte copy.
pub fn encode_block(insts: &[Instruction], new_base: u64) -> Result<Vec<u8>, EncodeError> {
    let block = InstructionBlock::new(insts, new_base);
    let result = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
    Ok(result.code_buffer)
}

/// Render an instruction as Intel-syntax text, for diagnostics
/// (`patchdump`, log lines, panics on `UnreachableInvariant`).
pub fn disassemble(inst: &Instruction) -> String {
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    formatter.format(inst, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nop() {
        let code = [0x90u8];
        let meta = decode_one(&code, 0x1000).unwrap();
        assert_eq!(meta.inst_size, 1);
        assert_eq!(meta.address, 0x1000);
    }

    #[test]
    fn decodes_mov_eax_imm32() {
        // mov eax, 0x2a
        let code = [0xb8, 0x2a, 0x00, 0x00, 0x00];
        let meta = decode_one(&code, 0x2000).unwrap();
        assert_eq!(meta.inst_size, 5);
    }

    #[test]
    fn rejects_empty_buffer() {
        let code: [u8; 0] = [];
        assert!(decode_one(&code, 0x3000).is_err());
    }

    #[test]
    fn decode_block_stops_at_exhaustion() {
        // two single-byte nops
        let code = [0x90u8, 0x90u8];
        let insts = decode_block(&code, 0x4000).unwrap();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].address, 0x4000);
        assert_eq!(insts[1].address, 0x4001);
    }
}
