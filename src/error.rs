// error.rs - Error kinds used by the decoder cache and binary translator
//
// Setup-time failures surface as `MachineError`; runtime faults inside
// translated code are delivered through the callback table instead.

use thiserror::Error;

/// Errors raised while building decoder caches or translations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("invalid program: {0}")]
    InvalidProgram(&'static str),

    #[error("illegal operation: {0}")]
    IllegalOperation(&'static str),

    #[error("not enough instruction handler space ({0} handlers)")]
    MaxInstructionsReached(usize),

    #[error("misaligned instruction at 0x{0:x}")]
    MisalignedInstruction(u64),

    #[error("illegal opcode at 0x{0:x}")]
    IllegalOpcode(u64),
}

pub type Result<T> = std::result::Result<T, MachineError>;

/// Exception kind codes shared with generated code via `api.exception()`.
/// The numeric values are part of the translation ABI.
pub mod exception {
    pub const ILLEGAL_OPCODE: i32 = 0;
    pub const ILLEGAL_OPERATION: i32 = 1;
    pub const INVALID_PROGRAM: i32 = 2;
    pub const MISALIGNED_INSTRUCTION: i32 = 3;
    pub const MAX_INSTRUCTIONS_REACHED: i32 = 4;
}
