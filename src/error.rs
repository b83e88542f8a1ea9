//! Machine failure conditions
//!
//! Every fault the engine can raise while loading or executing a guest.
//! Instruction handlers and memory accessors surface these immediately;
//! `simulate` aborts with the error and the machine stays in its trapped
//! state for inspection.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("memory protection fault at 0x{addr:x}")]
    ProtectionFault { addr: u64 },

    #[error("execution space protection fault at 0x{pc:x}")]
    ExecutionSpaceProtectionFault { pc: u64 },

    #[error("misaligned {size}-byte access at 0x{addr:x}")]
    MisalignedAccess { addr: u64, size: u32 },

    #[error("invalid stack alignment: {align}")]
    InvalidAlignment { align: u8 },

    #[error("unimplemented instruction 0x{bits:08x} at 0x{pc:x}")]
    UnimplementedInstruction { pc: u64, bits: u32 },

    #[error("unimplemented instruction length {len} at 0x{pc:x}")]
    UnimplementedInstructionLength { pc: u64, len: u32 },

    #[error("unhandled system call {number}")]
    UnhandledSyscall { number: u64 },

    #[error("unknown relocation type {rtype}")]
    UnknownRelocation { rtype: u32 },

    #[error("invalid argument: {what}")]
    InvalidArgument { what: &'static str },

    #[error("string at 0x{addr:x} exceeds {maxlen} bytes")]
    StringOverLimit { addr: u64, maxlen: usize },

    #[error("out of guest memory: {requested} bytes requested, {limit} byte limit")]
    OutOfMemory { requested: u64, limit: u64 },

    #[error("invalid ELF binary: {reason}")]
    InvalidBinary { reason: &'static str },

    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: &'static str },
}
