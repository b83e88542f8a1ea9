//! Shared test support: a small instruction assembler, raw program setup
//! on an empty machine, and an in-memory ELF32 image builder for loader
//! and symbol tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rvum::{Machine32, Machine64, MachineOptions, PageAttributes, PAGE_SIZE};

pub const SYS_EXIT: u64 = 93;

// ----------------------------------------------------------------------
// Instruction encoders
// ----------------------------------------------------------------------

pub fn encode_r(op: u32, rd: u32, funct3: u32, rs1: u32, rs2: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

pub fn encode_i(op: u32, rd: u32, funct3: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

pub fn encode_s(op: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5 & 0x7f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm & 0x1f) << 7)
        | op
}

pub fn encode_b(op: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
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

pub fn encode_u(op: u32, rd: u32, imm: u32) -> u32 {
    (imm & 0xffff_f000) | (rd << 7) | op
}

pub fn encode_j(op: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20 & 1) << 31)
        | ((imm >> 1 & 0x3ff) << 21)
        | ((imm >> 11 & 1) << 20)
        | ((imm >> 12 & 0xff) << 12)
        | (rd << 7)
        | op
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    encode_i(0b0010011, rd, 0b000, rs1, imm)
}

pub fn addiw(rd: u32, rs1: u32, imm: i32) -> u32 {
    encode_i(0b0011011, rd, 0b000, rs1, imm)
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    encode_r(0b0110011, rd, 0b000, rs1, rs2, 0)
}

pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
    encode_r(0b0110011, rd, 0b000, rs1, rs2, 0b0100000)
}

pub fn lui(rd: u32, imm: u32) -> u32 {
    encode_u(0b0110111, rd, imm)
}

pub fn jal(rd: u32, imm: i32) -> u32 {
    encode_j(0b1101111, rd, imm)
}

pub fn jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
    encode_i(0b1100111, rd, 0b000, rs1, imm)
}

pub fn beq(rs1: u32, rs2: u32, imm: i32) -> u32 {
    encode_b(0b1100011, 0b000, rs1, rs2, imm)
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    encode_i(0b0000011, rd, 0b010, rs1, imm)
}

pub fn sw(rs1: u32, rs2: u32, imm: i32) -> u32 {
    encode_s(0b0100011, 0b010, rs1, rs2, imm)
}

pub fn ecall() -> u32 {
    0x0000_0073
}

pub fn ebreak() -> u32 {
    0x0010_0073
}

/// `li rd, value` as a lui/addi pair.
pub fn li_pair(rd: u32, value: u32) -> [u32; 2] {
    let hi = value.wrapping_add(0x800) & 0xffff_f000;
    let lo = (value.wrapping_sub(hi)) as i32;
    [lui(rd, hi), addi(rd, rd, lo)]
}

pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

// ----------------------------------------------------------------------
// Raw-program machines (no ELF)
// ----------------------------------------------------------------------

/// Map `code` at `at` on an empty machine, mark it executable, and point
/// the PC at it.
pub fn machine32_with_program(code: &[u8], at: u32) -> Machine32 {
    let mut m = Machine32::new(Vec::new(), MachineOptions::default()).unwrap();
    let end = at as u64 + code.len() as u64;
    for pageno in (at as u64 >> 12)..(end + (PAGE_SIZE as u64 - 1)) >> 12 {
        m.memory.create_page(pageno).unwrap();
    }
    m.memory.memcpy(at as u64, code).unwrap();
    m.memory
        .set_page_attr(at as u64, code.len(), PageAttributes::new(true, true, true))
        .unwrap();
    m.memory.define_exec_segment(at as u64, code.len() as u64, true).unwrap();
    m.cpu.jump(at).unwrap();
    m
}

pub fn machine64_with_program(code: &[u8], at: u64) -> Machine64 {
    let mut m = Machine64::new(Vec::new(), MachineOptions::default()).unwrap();
    let end = at + code.len() as u64;
    for pageno in (at >> 12)..(end + (PAGE_SIZE as u64 - 1)) >> 12 {
        m.memory.create_page(pageno).unwrap();
    }
    m.memory.memcpy(at, code).unwrap();
    m.memory
        .set_page_attr(at, code.len(), PageAttributes::new(true, true, true))
        .unwrap();
    m.memory.define_exec_segment(at, code.len() as u64, true).unwrap();
    m.cpu.jump(at).unwrap();
    m
}

/// Install an exit(2)-style handler: records `a0`, stops the machine.
pub fn install_exit32(m: &mut Machine32) -> Arc<Mutex<Option<u32>>> {
    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    m.install_syscall_handler(
        SYS_EXIT,
        Box::new(move |m| {
            let code = m.sysarg(0);
            *slot.lock().unwrap() = Some(code);
            m.stop();
            Ok(code)
        }),
    );
    result
}

pub fn install_exit64(m: &mut Machine64) -> Arc<Mutex<Option<u64>>> {
    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    m.install_syscall_handler(
        SYS_EXIT,
        Box::new(move |m| {
            let code = m.sysarg(0);
            *slot.lock().unwrap() = Some(code);
            m.stop();
            Ok(code)
        }),
    );
    result
}

// ----------------------------------------------------------------------
// In-memory ELF32 builder
// ----------------------------------------------------------------------

fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Build a minimal static ELF32 RISC-V executable: one RX `LOAD` segment
/// containing `code` at `vaddr`, plus `.symtab`/`.strtab` entries for the
/// given `(name, value, size)` function symbols.
pub fn build_elf32(code: &[u8], vaddr: u32, entry: u32, syms: &[(&str, u32, u32)]) -> Vec<u8> {
    const EHSIZE: usize = 52;
    const PHSIZE: usize = 32;
    const SHSIZE: usize = 40;
    let code_off = EHSIZE + PHSIZE;

    // .strtab: leading NUL, then the names
    let mut strtab = vec![0u8];
    let mut name_offs = Vec::new();
    for (name, _, _) in syms {
        name_offs.push(strtab.len() as u32);
        strtab.extend(name.bytes());
        strtab.push(0);
    }

    // .symtab: null entry, then STT_FUNC globals
    let mut symtab = vec![0u8; 16];
    for (i, (_, value, size)) in syms.iter().enumerate() {
        let mut entry = [0u8; 16];
        put32(&mut entry, 0, name_offs[i]);
        put32(&mut entry, 4, *value);
        put32(&mut entry, 8, *size);
        entry[12] = 0x12; // GLOBAL | FUNC
        put16(&mut entry, 14, 1);
        symtab.extend(entry);
    }

    let shstrtab: &[u8] = b"\0.symtab\0.strtab\0.shstrtab\0";
    let strtab_off = code_off + code.len();
    let symtab_off = strtab_off + strtab.len();
    let shstr_off = symtab_off + symtab.len();
    let shoff = shstr_off + shstrtab.len();

    let mut out = vec![0u8; shoff + 4 * SHSIZE];

    // ELF header
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 1; // ELFCLASS32
    out[5] = 1; // little-endian
    out[6] = 1; // EV_CURRENT
    put16(&mut out, 16, 2); // ET_EXEC
    put16(&mut out, 18, 243); // EM_RISCV
    put32(&mut out, 20, 1);
    put32(&mut out, 24, entry);
    put32(&mut out, 28, EHSIZE as u32); // e_phoff
    put32(&mut out, 32, shoff as u32); // e_shoff
    put16(&mut out, 40, EHSIZE as u16);
    put16(&mut out, 42, PHSIZE as u16);
    put16(&mut out, 44, 1); // e_phnum
    put16(&mut out, 46, SHSIZE as u16);
    put16(&mut out, 48, 4); // e_shnum
    put16(&mut out, 50, 3); // e_shstrndx

    // Program header: one RX LOAD segment
    let ph = EHSIZE;
    put32(&mut out, ph, 1); // PT_LOAD
    put32(&mut out, ph + 4, code_off as u32);
    put32(&mut out, ph + 8, vaddr);
    put32(&mut out, ph + 12, vaddr);
    put32(&mut out, ph + 16, code.len() as u32);
    put32(&mut out, ph + 20, code.len() as u32);
    put32(&mut out, ph + 24, 0b101); // R | X
    put32(&mut out, ph + 28, 0x1000);

    out[code_off..code_off + code.len()].copy_from_slice(code);
    out[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);
    out[symtab_off..symtab_off + symtab.len()].copy_from_slice(&symtab);
    out[shstr_off..shstr_off + shstrtab.len()].copy_from_slice(shstrtab);

    // Section headers: null, .symtab, .strtab, .shstrtab
    let sh1 = shoff + SHSIZE;
    put32(&mut out, sh1, 1); // sh_name
    put32(&mut out, sh1 + 4, 2); // SHT_SYMTAB
    put32(&mut out, sh1 + 16, symtab_off as u32);
    put32(&mut out, sh1 + 20, symtab.len() as u32);
    put32(&mut out, sh1 + 24, 2); // link: .strtab
    put32(&mut out, sh1 + 36, 16); // entsize

    let sh2 = shoff + 2 * SHSIZE;
    put32(&mut out, sh2, 9);
    put32(&mut out, sh2 + 4, 3); // SHT_STRTAB
    put32(&mut out, sh2 + 16, strtab_off as u32);
    put32(&mut out, sh2 + 20, strtab.len() as u32);

    let sh3 = shoff + 3 * SHSIZE;
    put32(&mut out, sh3, 17);
    put32(&mut out, sh3 + 4, 3); // SHT_STRTAB
    put32(&mut out, sh3 + 16, shstr_off as u32);
    put32(&mut out, sh3 + 20, shstrtab.len() as u32);

    out
}
