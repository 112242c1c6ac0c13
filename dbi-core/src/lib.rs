//! Core data model for the instrumentation engine: the state a patched
//! instruction sequence runs against (`Context`), the bookkeeping that
//! survives one instruction through decode, patch, and relocation
//! (`InstMetadata`, `Patch`, `RelocatableInst`), and the address-space
//! locators used by the code cache (`SeqLoc`, `InstLoc`).
//!
//! This crate has no unsafe code and no I/O: it describes *what* a patch
//! is, not how it gets written into executable memory (that's `dbi-exec`)
//! or how host instructions are chosen (that's `dbi-backend`).

pub mod context;
pub mod error;
pub mod generator;
pub mod inst_info;
pub mod label;
pub mod loc;
pub mod metadata;
pub mod patch;
pub mod reloc;
pub mod temp;

pub use context::{Context, FPRState, GPRState, HostState};
pub use error::Error;
pub use generator::{ContextField, Generator, OperandPatch};
pub use inst_info::{MemAccessInfo, MemoryAccess};
pub use label::{Label, LabelUse, RelocKind};
pub use loc::{InstLoc, SeqLoc};
pub use metadata::InstMetadata;
pub use patch::Patch;
pub use reloc::RelocatableInst;
pub use temp::{GprId, Temp, TempManager};

/// Native machine word. On the only target this repo builds for (x86-64)
/// this is `u64`; kept as a named alias so call sites read like the
/// address-sized quantity they are, not an arbitrary integer width.
pub type Rword = u64;
