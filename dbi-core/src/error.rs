use thiserror::Error;

/// Errors produced by `dbi-core`'s own bookkeeping. Decode failures live in
/// `dbi-asm::DecodeError`, arena/transfer failures in `dbi-exec::ExecError` —
/// this enum only covers things that can go wrong while building a `Patch`
/// or allocating a `Temp` before any host code has been emitted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("temp manager exhausted free general-purpose registers")]
    NoFreeRegister,

    #[error("operand index {0} out of range for instruction")]
    OperandOutOfRange(u8),

    #[error("label {0} referenced before being placed")]
    UnresolvedLabel(u32),
}
