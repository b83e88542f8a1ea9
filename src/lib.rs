//! User-mode RISC-V emulator
//!
//! Loads a statically linked RV32/RV64 ELF binary into a paged guest
//! address space and interprets it to completion, trapping guest system
//! calls out to host-registered handlers. Supports the compressed (C)
//! extension and, behind cargo features, atomics (A) and floating point
//! (F/D). Machines are single-threaded and self-contained; independent
//! machines may run on separate host threads.
//!
//! ```no_run
//! use rvum::{Machine32, MachineOptions};
//!
//! let binary = std::fs::read("guest.elf").unwrap();
//! let mut machine = Machine32::new(binary, MachineOptions::default()).unwrap();
//! machine.install_syscall_handler(93, Box::new(|m| {
//!     m.stop();
//!     Ok(m.sysarg(0))
//! }));
//! machine.simulate(0).unwrap();
//! ```

mod arch;
pub mod cpu;
pub mod elf;
mod error;
pub mod machine;
pub mod memory;
pub mod snapshot;

pub use arch::{Arch, RV32, RV64};
pub use cpu::decode::{decode, Handler, InstrFormat};
pub use cpu::{Cpu, CpuEvent, REG_ARG0, REG_RA, REG_RETVAL, REG_SP, REG_SYSNO};
pub use elf::Callsite;
pub use error::MachineError;
pub use machine::{Machine, MachineOptions, SyscallHandler};
pub use memory::{
    Memory, MmioHandler, MmioOp, Page, PageAttributes, PageFaultHandler, PageWriteHandler,
    PAGE_SIZE,
};
pub use snapshot::{read_snapshot_header, SnapshotHeader, SNAPSHOT_MAGIC};

/// Synthetic system call number used to dispatch `EBREAK` through the
/// syscall table. Its handler must not expect a return value in `a0`.
pub const SYSCALL_EBREAK: u64 = 0;

/// 32-bit machine (RV32I).
pub type Machine32 = Machine<RV32>;
/// 64-bit machine (RV64I).
pub type Machine64 = Machine<RV64>;
