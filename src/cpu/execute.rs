//! Integer instruction execution
//!
//! One pure dispatch over the handler tag; the compiler lowers the match to
//! a jump table, which is the tag-based equivalent of a function-pointer
//! handler table. Handlers that do not set the PC themselves fall through
//! to the default advance by instruction length.

use super::decode::{Handler, InstrFormat};
use super::{Cpu, CpuEvent, REG_SYSNO};
use crate::arch::Arch;
use crate::error::MachineError;
use crate::memory::Memory;

#[cfg(feature = "atomics")]
use super::decode::{
    FUNCT5_AMOADD, FUNCT5_AMOAND, FUNCT5_AMOMAX, FUNCT5_AMOMAXU, FUNCT5_AMOMIN,
    FUNCT5_AMOMINU, FUNCT5_AMOOR, FUNCT5_AMOSWAP, FUNCT5_AMOXOR,
};

/// Truncate an address computation to the guest word size, producing the
/// wrap-around RV32 expects.
#[inline(always)]
fn trunc<A: Arch>(v: u64) -> u64 {
    A::to_u64(A::from_u64(v))
}

impl<A: Arch> Cpu<A> {
    pub(crate) fn execute(
        &mut self,
        handler: Handler,
        fmt: InstrFormat,
        mem: &mut Memory,
    ) -> Result<CpuEvent, MachineError> {
        let pc = A::to_u64(self.pc);
        let mut next_pc = trunc::<A>(pc.wrapping_add(fmt.len as u64));
        let mut event = CpuEvent::Retired;

        match handler {
            Handler::Empty | Handler::Illegal => {
                return Err(MachineError::UnimplementedInstruction { pc, bits: fmt.bits });
            }

            Handler::Lui => {
                self.set_reg(fmt.rd(), A::from_i64(fmt.imm_u() as i64));
            }
            Handler::Auipc => {
                let value = trunc::<A>(pc.wrapping_add(fmt.imm_u() as i64 as u64));
                self.set_reg(fmt.rd(), A::from_u64(value));
            }

            Handler::Jal => {
                let target = trunc::<A>(pc.wrapping_add(fmt.imm_j() as i64 as u64));
                self.set_reg(fmt.rd(), A::from_u64(next_pc));
                next_pc = self.branch_to(target)?;
            }
            Handler::Jalr => {
                let base = A::to_u64(self.reg(fmt.rs1()));
                let target = trunc::<A>(base.wrapping_add(fmt.imm_i() as i64 as u64)) & !1;
                self.set_reg(fmt.rd(), A::from_u64(next_pc));
                next_pc = self.branch_to(target)?;
            }

            Handler::Beq | Handler::Bne | Handler::Blt | Handler::Bge | Handler::Bltu
            | Handler::Bgeu => {
                let rs1 = self.reg(fmt.rs1());
                let rs2 = self.reg(fmt.rs2());
                let taken = match handler {
                    Handler::Beq => rs1 == rs2,
                    Handler::Bne => rs1 != rs2,
                    Handler::Blt => A::to_i64(rs1) < A::to_i64(rs2),
                    Handler::Bge => A::to_i64(rs1) >= A::to_i64(rs2),
                    Handler::Bltu => A::to_u64(rs1) < A::to_u64(rs2),
                    _ => A::to_u64(rs1) >= A::to_u64(rs2),
                };
                if taken {
                    let target = trunc::<A>(pc.wrapping_add(fmt.imm_b() as i64 as u64));
                    next_pc = self.branch_to(target)?;
                }
            }

            Handler::Lb | Handler::Lh | Handler::Lw | Handler::Lbu | Handler::Lhu
            | Handler::Lwu | Handler::Ld => {
                let base = A::to_u64(self.reg(fmt.rs1()));
                let addr = trunc::<A>(base.wrapping_add(fmt.imm_i() as i64 as u64));
                let value = match handler {
                    Handler::Lb => A::from_i64(mem.read_u8(addr)? as i8 as i64),
                    Handler::Lh => A::from_i64(mem.read_u16(addr)? as i16 as i64),
                    Handler::Lw => A::from_i64(mem.read_u32(addr)? as i32 as i64),
                    Handler::Lbu => A::from_u64(mem.read_u8(addr)? as u64),
                    Handler::Lhu => A::from_u64(mem.read_u16(addr)? as u64),
                    Handler::Lwu => A::from_u64(mem.read_u32(addr)? as u64),
                    _ => A::from_u64(mem.read_u64(addr)?),
                };
                self.set_reg(fmt.rd(), value);
            }

            Handler::Sb | Handler::Sh | Handler::Sw | Handler::Sd => {
                let base = A::to_u64(self.reg(fmt.rs1()));
                let addr = trunc::<A>(base.wrapping_add(fmt.imm_s() as i64 as u64));
                let value = A::to_u64(self.reg(fmt.rs2()));
                match handler {
                    Handler::Sb => mem.write_u8(addr, value as u8)?,
                    Handler::Sh => mem.write_u16(addr, value as u16)?,
                    Handler::Sw => mem.write_u32(addr, value as u32)?,
                    _ => mem.write_u64(addr, value)?,
                }
                #[cfg(feature = "atomics")]
                {
                    self.reservation = None;
                }
            }

            Handler::Addi => {
                let rs1 = A::to_u64(self.reg(fmt.rs1()));
                let value = trunc::<A>(rs1.wrapping_add(fmt.imm_i() as i64 as u64));
                self.set_reg(fmt.rd(), A::from_u64(value));
            }
            Handler::Slti => {
                let lt = A::to_i64(self.reg(fmt.rs1())) < fmt.imm_i() as i64;
                self.set_reg(fmt.rd(), A::from_u64(lt as u64));
            }
            Handler::Sltiu => {
                let imm = A::to_u64(A::from_i64(fmt.imm_i() as i64));
                let lt = A::to_u64(self.reg(fmt.rs1())) < imm;
                self.set_reg(fmt.rd(), A::from_u64(lt as u64));
            }
            Handler::Xori => {
                let value = A::to_u64(self.reg(fmt.rs1())) ^ fmt.imm_i() as i64 as u64;
                self.set_reg(fmt.rd(), A::from_u64(value));
            }
            Handler::Ori => {
                let value = A::to_u64(self.reg(fmt.rs1())) | fmt.imm_i() as i64 as u64;
                self.set_reg(fmt.rd(), A::from_u64(value));
            }
            Handler::Andi => {
                let value = A::to_u64(self.reg(fmt.rs1())) & fmt.imm_i() as i64 as u64;
                self.set_reg(fmt.rd(), A::from_u64(value));
            }
            Handler::Slli => {
                let shamt = fmt.shamt() & A::SHIFT_MASK;
                let value = A::to_u64(self.reg(fmt.rs1())) << shamt;
                self.set_reg(fmt.rd(), A::from_u64(value));
            }
            Handler::Srli => {
                let shamt = fmt.shamt() & A::SHIFT_MASK;
                let value = A::to_u64(self.reg(fmt.rs1())) >> shamt;
                self.set_reg(fmt.rd(), A::from_u64(value));
            }
            Handler::Srai => {
                let shamt = fmt.shamt() & A::SHIFT_MASK;
                let value = A::to_i64(self.reg(fmt.rs1())) >> shamt;
                self.set_reg(fmt.rd(), A::from_i64(value));
            }

            Handler::Add | Handler::Sub | Handler::Sll | Handler::Slt | Handler::Sltu
            | Handler::Xor | Handler::Srl | Handler::Sra | Handler::Or | Handler::And => {
                let rs1 = self.reg(fmt.rs1());
                let rs2 = self.reg(fmt.rs2());
                let shamt = (A::to_u64(rs2) as u32) & A::SHIFT_MASK;
                let value = match handler {
                    Handler::Add => A::from_u64(A::to_u64(rs1).wrapping_add(A::to_u64(rs2))),
                    Handler::Sub => A::from_u64(A::to_u64(rs1).wrapping_sub(A::to_u64(rs2))),
                    Handler::Sll => A::from_u64(A::to_u64(rs1) << shamt),
                    Handler::Slt => A::from_u64((A::to_i64(rs1) < A::to_i64(rs2)) as u64),
                    Handler::Sltu => A::from_u64((A::to_u64(rs1) < A::to_u64(rs2)) as u64),
                    Handler::Xor => A::from_u64(A::to_u64(rs1) ^ A::to_u64(rs2)),
                    Handler::Srl => A::from_u64(A::to_u64(rs1) >> shamt),
                    Handler::Sra => A::from_i64(A::to_i64(rs1) >> shamt),
                    Handler::Or => A::from_u64(A::to_u64(rs1) | A::to_u64(rs2)),
                    _ => A::from_u64(A::to_u64(rs1) & A::to_u64(rs2)),
                };
                self.set_reg(fmt.rd(), value);
            }

            // RV64 word operations: 32-bit result, sign-extended.
            Handler::Addiw => {
                let value = (A::to_u64(self.reg(fmt.rs1())) as u32).wrapping_add(fmt.imm_i() as u32);
                self.set_reg(fmt.rd(), A::from_i64(value as i32 as i64));
            }
            Handler::Slliw => {
                let shamt = fmt.shamt() & 0x1f;
                let value = (A::to_u64(self.reg(fmt.rs1())) as u32) << shamt;
                self.set_reg(fmt.rd(), A::from_i64(value as i32 as i64));
            }
            Handler::Srliw => {
                let shamt = fmt.shamt() & 0x1f;
                let value = (A::to_u64(self.reg(fmt.rs1())) as u32) >> shamt;
                self.set_reg(fmt.rd(), A::from_i64(value as i32 as i64));
            }
            Handler::Sraiw => {
                let shamt = fmt.shamt() & 0x1f;
                let value = (A::to_u64(self.reg(fmt.rs1())) as u32 as i32) >> shamt;
                self.set_reg(fmt.rd(), A::from_i64(value as i64));
            }
            Handler::Addw | Handler::Subw | Handler::Sllw | Handler::Srlw | Handler::Sraw => {
                let rs1 = A::to_u64(self.reg(fmt.rs1())) as u32;
                let rs2 = A::to_u64(self.reg(fmt.rs2())) as u32;
                let shamt = rs2 & 0x1f;
                let value = match handler {
                    Handler::Addw => rs1.wrapping_add(rs2) as i32,
                    Handler::Subw => rs1.wrapping_sub(rs2) as i32,
                    Handler::Sllw => (rs1 << shamt) as i32,
                    Handler::Srlw => (rs1 >> shamt) as i32,
                    _ => (rs1 as i32) >> shamt,
                };
                self.set_reg(fmt.rd(), A::from_i64(value as i64));
            }

            // No memory reordering to fence in a single-threaded interpreter.
            Handler::Fence => {}

            Handler::Ecall => {
                event = CpuEvent::Syscall(A::to_u64(self.reg(REG_SYSNO)));
            }
            Handler::Ebreak => {
                event = CpuEvent::Syscall(crate::SYSCALL_EBREAK);
            }

            #[cfg(feature = "atomics")]
            Handler::LrW | Handler::ScW | Handler::AmoW => {
                self.execute_atomic(handler, fmt, mem, 4)?;
            }
            #[cfg(feature = "atomics")]
            Handler::LrD | Handler::ScD | Handler::AmoD => {
                self.execute_atomic(handler, fmt, mem, 8)?;
            }
            #[cfg(not(feature = "atomics"))]
            Handler::LrW | Handler::ScW | Handler::AmoW | Handler::LrD | Handler::ScD
            | Handler::AmoD => {
                return Err(MachineError::UnimplementedInstruction { pc, bits: fmt.bits });
            }

            #[cfg(feature = "float")]
            Handler::FpLoadW | Handler::FpLoadD | Handler::FpStoreW | Handler::FpStoreD
            | Handler::FpOp | Handler::FpMadd | Handler::FpMsub | Handler::FpNmsub
            | Handler::FpNmadd => {
                self.execute_fp(handler, fmt, mem)?;
            }
            #[cfg(not(feature = "float"))]
            Handler::FpLoadW | Handler::FpLoadD | Handler::FpStoreW | Handler::FpStoreD
            | Handler::FpOp | Handler::FpMadd | Handler::FpMsub | Handler::FpNmsub
            | Handler::FpNmadd => {
                return Err(MachineError::UnimplementedInstruction { pc, bits: fmt.bits });
            }
        }

        self.pc = A::from_u64(next_pc);
        self.counter += 1;
        Ok(event)
    }

    /// LR/SC and AMO execution. Sequentially consistent by construction:
    /// the interpreter is the only thread touching guest memory.
    #[cfg(feature = "atomics")]
    fn execute_atomic(
        &mut self,
        handler: Handler,
        fmt: InstrFormat,
        mem: &mut Memory,
        size: u32,
    ) -> Result<(), MachineError> {
        let addr = A::to_u64(self.reg(fmt.rs1()));
        if addr & (size as u64 - 1) != 0 {
            return Err(MachineError::MisalignedAccess { addr, size });
        }
        let read = |mem: &mut Memory| -> Result<u64, MachineError> {
            if size == 4 {
                Ok(mem.read_u32(addr)? as u64)
            } else {
                mem.read_u64(addr)
            }
        };
        let sext = |v: u64| -> A::Addr {
            if size == 4 {
                A::from_i64(v as u32 as i32 as i64)
            } else {
                A::from_u64(v)
            }
        };

        match handler {
            Handler::LrW | Handler::LrD => {
                let value = read(mem)?;
                self.set_reg(fmt.rd(), sext(value));
                self.reservation = Some((addr, size as u8));
            }
            Handler::ScW | Handler::ScD => {
                if self.reservation == Some((addr, size as u8)) {
                    let value = A::to_u64(self.reg(fmt.rs2()));
                    if size == 4 {
                        mem.write_u32(addr, value as u32)?;
                    } else {
                        mem.write_u64(addr, value)?;
                    }
                    self.set_reg(fmt.rd(), A::from_u64(0));
                } else {
                    self.set_reg(fmt.rd(), A::from_u64(1));
                }
                self.reservation = None;
            }
            _ => {
                let old = read(mem)?;
                let rs2 = A::to_u64(self.reg(fmt.rs2()));
                let (old_s, rs2_s) = if size == 4 {
                    (old as u32 as i32 as i64, rs2 as u32 as i32 as i64)
                } else {
                    (old as i64, rs2 as i64)
                };
                let new = match fmt.funct5() {
                    FUNCT5_AMOSWAP => rs2,
                    FUNCT5_AMOADD => old.wrapping_add(rs2),
                    FUNCT5_AMOXOR => old ^ rs2,
                    FUNCT5_AMOAND => old & rs2,
                    FUNCT5_AMOOR => old | rs2,
                    FUNCT5_AMOMIN => old_s.min(rs2_s) as u64,
                    FUNCT5_AMOMAX => old_s.max(rs2_s) as u64,
                    FUNCT5_AMOMINU => {
                        if size == 4 {
                            (old as u32).min(rs2 as u32) as u64
                        } else {
                            old.min(rs2)
                        }
                    }
                    FUNCT5_AMOMAXU => {
                        if size == 4 {
                            (old as u32).max(rs2 as u32) as u64
                        } else {
                            old.max(rs2)
                        }
                    }
                    _ => {
                        return Err(MachineError::UnimplementedInstruction {
                            pc: A::to_u64(self.pc),
                            bits: fmt.bits,
                        })
                    }
                };
                if size == 4 {
                    mem.write_u32(addr, new as u32)?;
                } else {
                    mem.write_u64(addr, new)?;
                }
                self.set_reg(fmt.rd(), sext(old));
                self.reservation = None;
            }
        }
        Ok(())
    }
}
