//! Machine facade
//!
//! Owns the CPU and the address space, drives the execution loop, and
//! dispatches guest system calls to host-registered handlers. This is the
//! embedder-facing surface: construct a machine from a binary, install
//! syscall handlers, simulate, introspect, snapshot.

use std::collections::HashMap;

use crate::arch::Arch;
use crate::cpu::decode::{decode, Handler};
use crate::cpu::{Cpu, CpuEvent, REG_ARG0, REG_RA, REG_RETVAL, REG_SP};
use crate::elf::{self, Callsite, SymbolInfo};
use crate::error::MachineError;
use crate::memory::{Memory, DIVISOR, PAGE_MASK};
use crate::SYSCALL_EBREAK;

/// Value written to `a0` for unhandled system calls when the machine is not
/// configured to fail instead.
const ENOSYS: i64 = -38;

/// Construction-time configuration. The defaults mirror a plain user-mode
/// sandbox: protected segments, decoder cache on, unhandled syscalls return
/// `-ENOSYS`.
#[derive(Clone, Debug)]
pub struct MachineOptions {
    /// Guest memory ceiling in bytes; also where the stack is placed.
    pub memory_max: u64,
    /// Default stack size in bytes (page-rounded).
    pub stack_size: u64,
    /// Run the ELF loader at construction.
    pub load_program: bool,
    /// Apply segment permissions to pages; off widens everything to RW.
    pub protect_segments: bool,
    /// Log each loaded segment at info level.
    pub verbose_loader: bool,
    /// Fail `simulate` with `UnhandledSyscall` instead of returning -ENOSYS.
    pub throw_on_unhandled_syscall: bool,
    /// Allocate the decoder cache over the execute segment.
    pub enable_decoder_cache: bool,
    /// Pre-decode the whole execute segment at construction.
    pub pregen_decoder_cache: bool,
    /// Back the read-only segment with pages shareable between machines.
    pub shared_rodata: bool,
    /// Fail misaligned accesses instead of taking the byte-wise fallback.
    pub enforce_alignment: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            memory_max: 64 << 20,
            stack_size: 256 << 10,
            load_program: true,
            protect_segments: true,
            verbose_loader: false,
            throw_on_unhandled_syscall: false,
            enable_decoder_cache: true,
            pregen_decoder_cache: false,
            shared_rodata: false,
            enforce_alignment: false,
        }
    }
}

/// A host-side system call implementation. The returned value lands in the
/// ABI return register, except for `SYSCALL_EBREAK`.
pub type SyscallHandler<A> =
    Box<dyn FnMut(&mut Machine<A>) -> Result<<A as Arch>::Addr, MachineError> + Send>;

pub struct Machine<A: Arch> {
    pub cpu: Cpu<A>,
    pub memory: Memory,
    binary: Vec<u8>,
    options: MachineOptions,
    pub(crate) stopped: bool,
    symbols: Option<SymbolInfo>,
    symbol_cache: HashMap<String, Option<u64>>,
    syscall_handlers: HashMap<u64, SyscallHandler<A>>,
}

impl<A: Arch> Machine<A> {
    /// Construct a machine from an ELF image. With `load_program` unset or
    /// an empty binary the address space starts empty and the embedder maps
    /// memory by hand.
    pub fn new(binary: Vec<u8>, options: MachineOptions) -> Result<Self, MachineError> {
        let mut memory = Memory::new(options.memory_max, options.enforce_alignment);
        let mut symbols = None;
        if options.load_program && !binary.is_empty() {
            let image = elf::load::<A>(&mut memory, &binary, &options)?;
            debug_assert_eq!(image.start_address, memory.start_address());
            symbols = image.symbols;
        }
        let mut cpu = Cpu::new();
        cpu.pc = A::from_u64(memory.start_address());

        let mut machine = Machine {
            cpu,
            memory,
            binary,
            options,
            stopped: false,
            symbols,
            symbol_cache: HashMap::new(),
            syscall_handlers: HashMap::new(),
        };
        if machine.options.enable_decoder_cache && machine.options.pregen_decoder_cache {
            machine.generate_decoder_cache();
        }
        Ok(machine)
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    /// Request the run loop to exit at the next instruction boundary.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Reload the program and return the machine to its entry state.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        self.stopped = false;
        self.memory.clear();
        if self.options.load_program && !self.binary.is_empty() {
            elf::load::<A>(&mut self.memory, &self.binary, &self.options)?;
        }
        self.cpu.reset(A::from_u64(self.memory.start_address()));
        if self.options.enable_decoder_cache && self.options.pregen_decoder_cache {
            self.generate_decoder_cache();
        }
        Ok(())
    }

    /// Run until stopped, trapped, or `max_instructions` more instructions
    /// have retired. Zero means unbounded.
    pub fn simulate(&mut self, max_instructions: u64) -> Result<(), MachineError> {
        self.stopped = false;
        if max_instructions != 0 {
            let end = self.cpu.counter + max_instructions;
            while !self.stopped {
                self.step()?;
                if self.cpu.counter >= end {
                    break;
                }
            }
        } else {
            while !self.stopped {
                self.step()?;
            }
        }
        Ok(())
    }

    /// Execute exactly one instruction (dispatching a system call if it
    /// performs one).
    pub fn step(&mut self) -> Result<(), MachineError> {
        match self.cpu.step(&mut self.memory)? {
            CpuEvent::Retired => Ok(()),
            CpuEvent::Syscall(number) => self.system_call(number),
        }
    }

    // ------------------------------------------------------------------
    // System calls
    // ------------------------------------------------------------------

    pub fn install_syscall_handler(&mut self, number: u64, handler: SyscallHandler<A>) {
        self.syscall_handlers.insert(number, handler);
    }

    pub fn get_syscall_handler(&self, number: u64) -> Option<&SyscallHandler<A>> {
        self.syscall_handlers.get(&number)
    }

    /// Read integer syscall argument `index` (a0..a7).
    pub fn sysarg(&self, index: u32) -> A::Addr {
        self.cpu.reg(REG_ARG0 + (index & 0x7))
    }

    /// Dispatch system call `number` through the handler table. The return
    /// value lands in `a0` unless the call is `SYSCALL_EBREAK`, which must
    /// not clobber registers.
    pub fn system_call(&mut self, number: u64) -> Result<(), MachineError> {
        // The handler is taken out for the call so it can borrow the
        // machine; a handler that reinstalls itself wins over the putback.
        if let Some(mut handler) = self.syscall_handlers.remove(&number) {
            let result = handler(self);
            self.syscall_handlers.entry(number).or_insert(handler);
            let value = result?;
            if number != SYSCALL_EBREAK {
                self.cpu.set_reg(REG_RETVAL, value);
            }
            return Ok(());
        }
        if self.options.throw_on_unhandled_syscall {
            return Err(MachineError::UnhandledSyscall { number });
        }
        log::warn!("unhandled system call {}", number);
        if number != SYSCALL_EBREAK {
            self.cpu.set_reg(REG_RETVAL, A::from_i64(ENOSYS));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Guest calls
    // ------------------------------------------------------------------

    /// Resolve `name`, arrange a call returning to the exit address, and
    /// (optionally) run it to completion, returning `a0`.
    pub fn vmcall(
        &mut self,
        name: &str,
        args: &[A::Addr],
        exec: bool,
        max_instructions: u64,
    ) -> Result<A::Addr, MachineError> {
        let call_addr = self
            .address_of(name)
            .ok_or(MachineError::InvalidArgument { what: "unknown function name" })?;
        let retn_addr = A::from_u64(self.memory.exit_address());
        self.setup_call(call_addr, retn_addr, args)?;
        if exec {
            self.simulate(max_instructions)?;
            return Ok(self.cpu.reg(REG_RETVAL));
        }
        Ok(A::from_u64(0))
    }

    /// Load up to 8 integer arguments, set the return address, and jump.
    pub fn setup_call(
        &mut self,
        call_addr: A::Addr,
        retn_addr: A::Addr,
        args: &[A::Addr],
    ) -> Result<(), MachineError> {
        if args.len() > 8 {
            return Err(MachineError::InvalidArgument { what: "more than 8 call arguments" });
        }
        self.cpu.set_reg(REG_RA, retn_addr);
        for (i, arg) in args.iter().enumerate() {
            self.cpu.set_reg(REG_ARG0 + i as u32, *arg);
        }
        self.cpu.jump(call_addr)
    }

    /// Mask the stack pointer down to a 4, 8 or 16-byte boundary.
    pub fn realign_stack(&mut self, align: u8) -> Result<(), MachineError> {
        let mask: u64 = match align {
            4 => 0x3,
            8 => 0x7,
            16 => 0xf,
            _ => return Err(MachineError::InvalidAlignment { align }),
        };
        let sp = A::to_u64(self.cpu.reg(REG_SP)) & !mask;
        self.cpu.set_reg(REG_SP, A::from_u64(sp));
        Ok(())
    }

    /// Copy a host buffer into the guest, returning the end address.
    pub fn copy_to_guest(&mut self, dst: A::Addr, buf: &[u8]) -> Result<A::Addr, MachineError> {
        self.memory.memcpy(A::to_u64(dst), buf)?;
        Ok(A::from_u64(A::to_u64(dst).wrapping_add(buf.len() as u64)))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Address of a named symbol; scanned once, then served from a cache.
    pub fn address_of(&mut self, name: &str) -> Option<A::Addr> {
        if let Some(cached) = self.symbol_cache.get(name) {
            return cached.map(A::from_u64);
        }
        let resolved = self
            .symbols
            .as_ref()
            .and_then(|info| elf::resolve_symbol::<A>(&self.binary, info, name))
            .map(|(value, _)| value);
        self.symbol_cache.insert(name.to_string(), resolved);
        resolved.map(A::from_u64)
    }

    /// The symbol enclosing `addr`, for backtraces.
    pub fn lookup(&self, addr: A::Addr) -> Option<Callsite> {
        let info = self.symbols.as_ref()?;
        elf::lookup_symbol::<A>(&self.binary, info, A::to_u64(addr))
    }

    /// Print the current call site and return site through `printer`.
    pub fn print_backtrace(&mut self, mut printer: impl FnMut(&str)) {
        let frames = [("pc", self.cpu.pc), ("ra", self.cpu.reg(REG_RA))];
        for (label, addr) in frames {
            let line = match self.lookup(addr) {
                Some(site) => format!(
                    "[{}] 0x{:08x} + 0x{:03x}: {}",
                    label, site.address, site.offset, site.name
                ),
                None => format!("[{}] 0x{:08x}", label, A::to_u64(addr)),
            };
            printer(&line);
        }
    }

    // ------------------------------------------------------------------
    // Decoder cache pregeneration
    // ------------------------------------------------------------------

    /// Walk the execute segment in instruction steps and fill every
    /// decoder-cache slot. Slots outside real code resolve to the illegal
    /// handler.
    pub fn generate_decoder_cache(&mut self) {
        let (base, len) = match self.memory.exec_segment() {
            Some(range) => range,
            None => return,
        };
        let pbase = base & !PAGE_MASK;
        let pend = (base + len + PAGE_MASK) & !PAGE_MASK;
        let mut dst = pbase;
        while dst < pend {
            if dst >= base && dst < base + len {
                match self.memory.fetch_instruction(dst) {
                    Ok((raw, ilen)) => {
                        let fmt = crate::cpu::format_of::<A>(raw, ilen);
                        let handler = decode::<A>(fmt);
                        self.memory.decoder_set(dst, handler.index());
                        dst += ilen as u64;
                    }
                    Err(_) => {
                        self.memory.decoder_set(dst, Handler::Illegal.index());
                        dst += DIVISOR as u64;
                    }
                }
            } else {
                self.memory.decoder_set(dst, Handler::Illegal.index());
                dst += DIVISOR as u64;
            }
        }
    }
}
