//! Compressed (C) extension
//!
//! Every 16-bit instruction is expanded to its 32-bit equivalent and runs
//! through the regular handlers; only the recorded length differs, so the
//! PC advances by 2. Quadrant slots that change meaning between RV32 and
//! RV64 (C.JAL vs C.ADDIW, C.LD vs the RV32 float forms) are resolved by
//! the architecture parameter at expansion time.

use super::decode::*;
use crate::arch::Arch;

/// Expand a compressed instruction, or `None` for reserved encodings.
pub(crate) fn expand<A: Arch>(inst: u16) -> Option<u32> {
    let opcode = inst & 0b11;
    let funct3 = (inst >> 13) & 0b111;

    match (funct3, opcode) {
        (0b000, 0b00) => c_addi4spn(inst),
        (0b010, 0b00) => c_lw(inst),
        (0b011, 0b00) if A::XLEN == 64 => c_ld(inst),
        (0b110, 0b00) => c_sw(inst),
        (0b111, 0b00) if A::XLEN == 64 => c_sd(inst),

        (0b000, 0b01) => c_addi(inst),
        (0b001, 0b01) => {
            if A::XLEN == 64 {
                c_addiw(inst)
            } else {
                // C.JAL only exists on RV32.
                Some(encode_j(OP_JAL, 1, cj_imm(inst)))
            }
        }
        (0b010, 0b01) => c_li(inst),
        (0b011, 0b01) => c_addi16sp_lui(inst),
        (0b100, 0b01) => c_alu_imm::<A>(inst),
        (0b101, 0b01) => Some(encode_j(OP_JAL, 0, cj_imm(inst))),
        (0b110, 0b01) => c_branch(inst, FUNCT3_BEQ),
        (0b111, 0b01) => c_branch(inst, FUNCT3_BNE),

        (0b000, 0b10) => c_slli(inst),
        (0b010, 0b10) => c_lwsp(inst),
        (0b011, 0b10) if A::XLEN == 64 => c_ldsp(inst),
        (0b100, 0b10) => c_jr_mv_add(inst),
        (0b110, 0b10) => c_swsp(inst),
        (0b111, 0b10) if A::XLEN == 64 => c_sdsp(inst),
        _ => None,
    }
}

/// The three-bit register fields address x8-x15.
fn reg_prime(val: u16) -> u32 {
    8 + (val as u32 & 0x7)
}

fn sign_extend(val: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((val << shift) as i32) >> shift
}

fn encode_i(op: u32, rd: u32, rs1: u32, funct3: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

fn encode_u(op: u32, rd: u32, imm: i32) -> u32 {
    (imm as u32 & 0xffff_f000) | (rd << 7) | op
}

fn encode_r(op: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

fn encode_s(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5 & 0x7f) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1f) << 7) | op
}

fn encode_b(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 12 & 1) << 31)
        | ((imm >> 5 & 0x3f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm >> 1 & 0xf) << 8)
        | ((imm >> 11 & 1) << 7)
        | op
}

fn encode_j(op: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20 & 1) << 31)
        | ((imm >> 1 & 0x3ff) << 21)
        | ((imm >> 11 & 1) << 20)
        | ((imm >> 12 & 0xff) << 12)
        | (rd << 7)
        | op
}

fn c_addi4spn(inst: u16) -> Option<u32> {
    let rd = reg_prime((inst >> 2) & 0x7);
    let i = inst as u32;
    let imm = (i >> 12 & 1) << 5 | (i >> 11 & 1) << 4 | (i >> 7 & 0xf) << 6
        | (i >> 6 & 1) << 2 | (i >> 5 & 1) << 3;
    if imm == 0 {
        return None;
    }
    Some(encode_i(OP_OP_IMM, rd, 2, FUNCT3_ADD_SUB, imm as i32))
}

fn c_lw(inst: u16) -> Option<u32> {
    let rd = reg_prime((inst >> 2) & 0x7);
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let i = inst as u32;
    let imm = (i >> 10 & 0x7) << 3 | (i >> 6 & 1) << 2 | (i >> 5 & 1) << 6;
    Some(encode_i(OP_LOAD, rd, rs1, FUNCT3_LW, imm as i32))
}

fn c_ld(inst: u16) -> Option<u32> {
    let rd = reg_prime((inst >> 2) & 0x7);
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let i = inst as u32;
    let imm = (i >> 10 & 0x7) << 3 | (i >> 5 & 0x3) << 6;
    Some(encode_i(OP_LOAD, rd, rs1, FUNCT3_LD, imm as i32))
}

fn c_sw(inst: u16) -> Option<u32> {
    let rs2 = reg_prime((inst >> 2) & 0x7);
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let i = inst as u32;
    let imm = (i >> 10 & 0x7) << 3 | (i >> 6 & 1) << 2 | (i >> 5 & 1) << 6;
    Some(encode_s(OP_STORE, rs1, rs2, FUNCT3_LW, imm as i32))
}

fn c_sd(inst: u16) -> Option<u32> {
    let rs2 = reg_prime((inst >> 2) & 0x7);
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let i = inst as u32;
    let imm = (i >> 10 & 0x7) << 3 | (i >> 5 & 0x3) << 6;
    Some(encode_s(OP_STORE, rs1, rs2, FUNCT3_LD, imm as i32))
}

fn c_addi(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    let imm = sign_extend((inst as u32 >> 2 & 0x1f) | (inst as u32 >> 12 & 1) << 5, 6);
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_ADD_SUB, imm))
}

fn c_addiw(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    if rd == 0 {
        return None;
    }
    let imm = sign_extend((inst as u32 >> 2 & 0x1f) | (inst as u32 >> 12 & 1) << 5, 6);
    Some(encode_i(OP_OP_IMM_32, rd, rd, FUNCT3_ADD_SUB, imm))
}

fn c_li(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    let imm = sign_extend((inst as u32 >> 2 & 0x1f) | (inst as u32 >> 12 & 1) << 5, 6);
    Some(encode_i(OP_OP_IMM, rd, 0, FUNCT3_ADD_SUB, imm))
}

fn c_addi16sp_lui(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    let i = inst as u32;
    if rd == 2 {
        let imm = (i >> 12 & 1) << 9 | (i >> 3 & 0x3) << 7 | (i >> 5 & 1) << 6
            | (i >> 2 & 1) << 5 | (i >> 6 & 1) << 4;
        let imm = sign_extend(imm, 10);
        if imm == 0 {
            return None;
        }
        Some(encode_i(OP_OP_IMM, 2, 2, FUNCT3_ADD_SUB, imm))
    } else {
        let imm = sign_extend((i >> 12 & 1) << 5 | (i >> 2 & 0x1f), 6);
        if imm == 0 {
            return None;
        }
        Some(encode_u(OP_LUI, rd, imm << 12))
    }
}

fn c_alu_imm<A: Arch>(inst: u16) -> Option<u32> {
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let shamt = (inst as u32 >> 2 & 0x1f) | (inst as u32 >> 12 & 1) << 5;
    match (inst >> 10) & 0x3 {
        0b00 => {
            if A::XLEN == 32 && shamt >= 32 {
                return None;
            }
            Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_SRL_SRA, shamt as i32))
        }
        0b01 => {
            if A::XLEN == 32 && shamt >= 32 {
                return None;
            }
            Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_SRL_SRA, (0x400 | shamt) as i32))
        }
        0b10 => {
            let imm = sign_extend((inst as u32 >> 2 & 0x1f) | (inst as u32 >> 12 & 1) << 5, 6);
            Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_AND, imm))
        }
        _ => c_alu_reg::<A>(inst),
    }
}

fn c_alu_reg<A: Arch>(inst: u16) -> Option<u32> {
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let rs2 = reg_prime((inst >> 2) & 0x7);
    if (inst >> 12) & 1 == 0 {
        let (funct3, funct7) = match (inst >> 5) & 0x3 {
            0b00 => (FUNCT3_ADD_SUB, 0b0100000),
            0b01 => (FUNCT3_XOR, 0),
            0b10 => (FUNCT3_OR, 0),
            _ => (FUNCT3_AND, 0),
        };
        Some(encode_r(OP_OP, rs1, rs1, rs2, funct3, funct7))
    } else {
        // C.SUBW / C.ADDW, RV64 only.
        if A::XLEN != 64 {
            return None;
        }
        let funct7 = match (inst >> 5) & 0x3 {
            0b00 => 0b0100000,
            0b01 => 0,
            _ => return None,
        };
        Some(encode_r(OP_OP_32, rs1, rs1, rs2, FUNCT3_ADD_SUB, funct7))
    }
}

fn c_branch(inst: u16, funct3: u32) -> Option<u32> {
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let i = inst as u32;
    let imm = (i >> 12 & 1) << 8 | (i >> 5 & 0x3) << 6 | (i >> 2 & 1) << 5
        | (i >> 10 & 0x3) << 3 | (i >> 3 & 0x3) << 1;
    Some(encode_b(OP_BRANCH, rs1, 0, funct3, sign_extend(imm, 9)))
}

fn c_slli(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    let shamt = (inst as u32 >> 2 & 0x1f) | (inst as u32 >> 12 & 1) << 5;
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_SLL, shamt as i32))
}

fn c_lwsp(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    if rd == 0 {
        return None;
    }
    let i = inst as u32;
    let imm = (i >> 12 & 1) << 5 | (i >> 4 & 0x7) << 2 | (i >> 2 & 0x3) << 6;
    Some(encode_i(OP_LOAD, rd, 2, FUNCT3_LW, imm as i32))
}

fn c_ldsp(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    if rd == 0 {
        return None;
    }
    let i = inst as u32;
    let imm = (i >> 12 & 1) << 5 | (i >> 5 & 0x3) << 3 | (i >> 2 & 0x7) << 6;
    Some(encode_i(OP_LOAD, rd, 2, FUNCT3_LD, imm as i32))
}

fn c_jr_mv_add(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1f) as u32;
    let rs2 = ((inst >> 2) & 0x1f) as u32;
    if (inst >> 12) & 1 == 0 {
        if rs2 == 0 {
            // C.JR
            if rd == 0 {
                None
            } else {
                Some(encode_i(OP_JALR, 0, rd, 0, 0))
            }
        } else {
            // C.MV
            Some(encode_r(OP_OP, rd, 0, rs2, FUNCT3_ADD_SUB, 0))
        }
    } else if rs2 == 0 {
        if rd == 0 {
            // C.EBREAK
            Some(0x0010_0073)
        } else {
            // C.JALR
            Some(encode_i(OP_JALR, 1, rd, 0, 0))
        }
    } else {
        // C.ADD
        Some(encode_r(OP_OP, rd, rd, rs2, FUNCT3_ADD_SUB, 0))
    }
}

fn c_swsp(inst: u16) -> Option<u32> {
    let rs2 = ((inst >> 2) & 0x1f) as u32;
    let i = inst as u32;
    let imm = (i >> 9 & 0xf) << 2 | (i >> 7 & 0x3) << 6;
    Some(encode_s(OP_STORE, 2, rs2, FUNCT3_LW, imm as i32))
}

fn c_sdsp(inst: u16) -> Option<u32> {
    let rs2 = ((inst >> 2) & 0x1f) as u32;
    let i = inst as u32;
    let imm = (i >> 10 & 0x7) << 3 | (i >> 7 & 0x7) << 6;
    Some(encode_s(OP_STORE, 2, rs2, FUNCT3_LD, imm as i32))
}

fn cj_imm(inst: u16) -> i32 {
    let i = inst as u32;
    let imm = (i >> 12 & 1) << 11 | (i >> 8 & 1) << 10 | (i >> 9 & 0x3) << 8
        | (i >> 6 & 1) << 7 | (i >> 7 & 1) << 6 | (i >> 2 & 1) << 5
        | (i >> 11 & 1) << 4 | (i >> 3 & 0x7) << 1;
    sign_extend(imm, 12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{RV32, RV64};

    #[test]
    fn test_c_nop_expands_to_addi() {
        // c.nop == c.addi x0, 0
        assert_eq!(expand::<RV32>(0x0001), Some(0x00000013));
    }

    #[test]
    fn test_c_li_expands() {
        // c.li a0, 1 => addi a0, x0, 1
        let expanded = expand::<RV32>(0x4505).unwrap();
        assert_eq!(expanded, encode_i(OP_OP_IMM, 10, 0, FUNCT3_ADD_SUB, 1));
    }

    #[test]
    fn test_quadrant1_slot_differs_by_width() {
        // funct3=001/op=01 is C.JAL on RV32, C.ADDIW on RV64.
        let inst = 0x2001u16;
        let rv32 = expand::<RV32>(inst).unwrap();
        let rv64 = expand::<RV64>(inst).unwrap();
        assert_eq!(rv32 & 0x7f, OP_JAL);
        assert_eq!(rv64 & 0x7f, OP_OP_IMM_32);
    }

    #[test]
    fn test_c_ebreak() {
        assert_eq!(expand::<RV32>(0x9002), Some(0x0010_0073));
    }

    #[test]
    fn test_c_ld_is_rv64_only() {
        let inst = 0x6188u16; // c.ld a0, 0(a1)
        assert!(expand::<RV64>(inst).is_some());
        assert!(expand::<RV32>(inst).is_none());
    }

    #[test]
    fn test_reserved_addi4spn_zero_imm() {
        assert_eq!(expand::<RV32>(0x0000), None);
    }
}
