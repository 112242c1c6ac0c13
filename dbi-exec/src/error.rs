use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("decode failed at {addr:#x}")]
    DecodeFailure { addr: u64 },
    #[error("exec block arena is full")]
    ArenaFull,
    #[error("failed to re-encode relocated instruction for write at {addr:#x}")]
    EncodeFailure { addr: u64 },
    #[error("execution transfer to {addr:#x} refused: {reason}")]
    TransferRefused { addr: u64, reason: &'static str },
}
