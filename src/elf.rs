//! ELF program loader
//!
//! Parses a statically linked little-endian RISC-V ELF image of the class
//! matching the architecture width, maps its `LOAD` segments into the paged
//! address space, fixes the execute segment, allocates the default stack,
//! and records where the symbol tables live for later name/address lookups.

use std::sync::Arc;

use crate::arch::Arch;
use crate::error::MachineError;
use crate::machine::MachineOptions;
use crate::memory::{Memory, Page, PageAttributes, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const SHT_SYMTAB: u32 = 2;
const SHT_RELA: u32 = 4;

const R_RISCV_NONE: u32 = 0;
const R_RISCV_32: u32 = 1;
const R_RISCV_64: u32 = 2;
const R_RISCV_RELATIVE: u32 = 3;

/// Where the symbol machinery finds `.symtab` and `.strtab` inside the
/// retained binary.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SymbolInfo {
    symtab_off: usize,
    symtab_len: usize,
    strtab_off: usize,
    strtab_len: usize,
}

/// An enclosing symbol for an address, used by backtraces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Callsite {
    pub name: String,
    pub address: u64,
    pub offset: u32,
    pub size: u64,
}

pub(crate) struct LoadedImage {
    pub start_address: u64,
    pub symbols: Option<SymbolInfo>,
}

fn read_u16(b: &[u8], off: usize) -> Result<u16, MachineError> {
    b.get(off..off + 2)
        .map(|s| u16::from_le_bytes(s.try_into().unwrap()))
        .ok_or(MachineError::InvalidBinary { reason: "truncated image" })
}

fn read_u32(b: &[u8], off: usize) -> Result<u32, MachineError> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or(MachineError::InvalidBinary { reason: "truncated image" })
}

fn read_u64(b: &[u8], off: usize) -> Result<u64, MachineError> {
    b.get(off..off + 8)
        .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
        .ok_or(MachineError::InvalidBinary { reason: "truncated image" })
}

/// Class-dependent word read (u32 for ELF32, u64 for ELF64).
fn read_word<A: Arch>(b: &[u8], off: usize) -> Result<u64, MachineError> {
    if A::WIDTH == 8 {
        read_u64(b, off)
    } else {
        read_u32(b, off).map(|v| v as u64)
    }
}

struct ProgramHeader {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

fn program_header<A: Arch>(b: &[u8], off: usize) -> Result<ProgramHeader, MachineError> {
    if A::WIDTH == 8 {
        Ok(ProgramHeader {
            p_type: read_u32(b, off)?,
            flags: read_u32(b, off + 4)?,
            offset: read_u64(b, off + 8)?,
            vaddr: read_u64(b, off + 16)?,
            filesz: read_u64(b, off + 32)?,
            memsz: read_u64(b, off + 40)?,
        })
    } else {
        Ok(ProgramHeader {
            p_type: read_u32(b, off)?,
            offset: read_u32(b, off + 4)? as u64,
            vaddr: read_u32(b, off + 8)? as u64,
            filesz: read_u32(b, off + 16)? as u64,
            memsz: read_u32(b, off + 20)? as u64,
            flags: read_u32(b, off + 24)?,
        })
    }
}

struct SectionHeader {
    sh_type: u32,
    offset: u64,
    size: u64,
    link: u32,
}

fn section_header<A: Arch>(b: &[u8], off: usize) -> Result<SectionHeader, MachineError> {
    if A::WIDTH == 8 {
        Ok(SectionHeader {
            sh_type: read_u32(b, off + 4)?,
            offset: read_u64(b, off + 24)?,
            size: read_u64(b, off + 32)?,
            link: read_u32(b, off + 40)?,
        })
    } else {
        Ok(SectionHeader {
            sh_type: read_u32(b, off + 4)?,
            offset: read_u32(b, off + 16)? as u64,
            size: read_u32(b, off + 20)? as u64,
            link: read_u32(b, off + 24)?,
        })
    }
}

struct Symbol {
    name_off: u32,
    value: u64,
    size: u64,
}

fn sym_entry_size<A: Arch>() -> usize {
    if A::WIDTH == 8 {
        24
    } else {
        16
    }
}

fn symbol<A: Arch>(b: &[u8], off: usize) -> Result<Symbol, MachineError> {
    if A::WIDTH == 8 {
        Ok(Symbol {
            name_off: read_u32(b, off)?,
            value: read_u64(b, off + 8)?,
            size: read_u64(b, off + 16)?,
        })
    } else {
        Ok(Symbol {
            name_off: read_u32(b, off)?,
            value: read_u32(b, off + 4)? as u64,
            size: read_u32(b, off + 8)? as u64,
        })
    }
}

/// Load `binary` into `mem` and return the entry state.
pub(crate) fn load<A: Arch>(
    mem: &mut Memory,
    binary: &[u8],
    options: &MachineOptions,
) -> Result<LoadedImage, MachineError> {
    if binary.len() < 0x40 || binary[0..4] != ELF_MAGIC {
        return Err(MachineError::InvalidBinary { reason: "not an ELF image" });
    }
    if binary[4] != A::ELF_CLASS {
        return Err(MachineError::InvalidBinary { reason: "ELF class does not match machine width" });
    }
    // Big-endian images are rejected outright; the engine is little-endian.
    if binary[5] != ELFDATA2LSB {
        return Err(MachineError::InvalidBinary { reason: "big-endian ELF not supported" });
    }
    if read_u16(binary, 16)? != ET_EXEC {
        return Err(MachineError::InvalidBinary { reason: "only static executables are supported" });
    }
    if read_u16(binary, 18)? != EM_RISCV {
        return Err(MachineError::InvalidBinary { reason: "not a RISC-V binary" });
    }

    let entry = read_word::<A>(binary, 24)?;
    let (phoff, phentsize, phnum) = if A::WIDTH == 8 {
        (read_u64(binary, 32)?, read_u16(binary, 54)?, read_u16(binary, 56)?)
    } else {
        (read_u32(binary, 28)? as u64, read_u16(binary, 42)?, read_u16(binary, 44)?)
    };

    let mut exec_base = u64::MAX;
    let mut exec_end = 0u64;
    let mut segment_attrs: Vec<(u64, usize, PageAttributes)> = Vec::new();
    let mut shared_segments: Vec<(u64, u64, PageAttributes)> = Vec::new();

    for i in 0..phnum as u64 {
        let ph = program_header::<A>(binary, (phoff + i * phentsize as u64) as usize)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.filesz > ph.memsz {
            return Err(MachineError::InvalidBinary { reason: "segment file size exceeds memory size" });
        }
        let file_end = ph
            .offset
            .checked_add(ph.filesz)
            .filter(|&e| e <= binary.len() as u64)
            .ok_or(MachineError::InvalidBinary { reason: "segment data out of bounds" })?;
        let bytes = &binary[ph.offset as usize..file_end as usize];

        if options.verbose_loader {
            log::info!(
                "loading segment at 0x{:x} ({} bytes file, {} bytes mem, flags {}{}{})",
                ph.vaddr,
                ph.filesz,
                ph.memsz,
                if ph.flags & PF_R != 0 { "r" } else { "-" },
                if ph.flags & PF_W != 0 { "w" } else { "-" },
                if ph.flags & PF_X != 0 { "x" } else { "-" },
            );
        } else {
            log::debug!("loading segment at 0x{:x}, {} bytes", ph.vaddr, ph.memsz);
        }

        // Segment permissions apply when protection is on; otherwise they
        // are widened to read-write (keeping the exec bit).
        let attr = if options.protect_segments {
            PageAttributes::new(ph.flags & PF_R != 0, ph.flags & PF_W != 0, ph.flags & PF_X != 0)
        } else {
            PageAttributes::new(true, true, ph.flags & PF_X != 0)
        };

        // Materialize the covered pages, copy the file bytes, and let
        // the zero-allocated tail stand in for .bss.
        let first = ph.vaddr >> PAGE_SHIFT;
        let last = (ph.vaddr + ph.memsz + PAGE_MASK) >> PAGE_SHIFT;
        for pageno in first..last {
            mem.create_page(pageno)?;
        }
        mem.memcpy(ph.vaddr, bytes)?;
        if options.shared_rodata && ph.flags == PF_R && ph.vaddr & PAGE_MASK == 0 {
            // Converted to shared backing only after relocation, so the
            // fixups can still write into the segment.
            shared_segments.push((ph.vaddr, ph.memsz, attr));
        } else {
            segment_attrs.push((ph.vaddr, ph.memsz as usize, attr));
        }

        if ph.flags & PF_X != 0 {
            exec_base = exec_base.min(ph.vaddr);
            exec_end = exec_end.max(ph.vaddr + ph.memsz);
        }
    }

    apply_relocations::<A>(mem, binary)?;

    // Permissions land after relocation so the fixups can still write.
    for (vaddr, len, attr) in segment_attrs {
        mem.set_page_attr(vaddr, len, attr)?;
    }
    for (vaddr, memsz, attr) in shared_segments {
        install_shared_segment(mem, vaddr, memsz, attr)?;
    }

    if exec_base < exec_end {
        mem.define_exec_segment(exec_base, exec_end - exec_base, options.enable_decoder_cache)?;
        if options.verbose_loader {
            log::info!("execute segment: 0x{:x} + {} bytes", exec_base, exec_end - exec_base);
        }
    }

    // Default stack: RW pages just below the top of guest memory, with the
    // initial SP 16-byte aligned at the top.
    let stack_top = mem.memory_max() & !PAGE_MASK;
    let stack_base = stack_top.saturating_sub(options.stack_size & !PAGE_MASK);
    for pageno in stack_base >> PAGE_SHIFT..stack_top >> PAGE_SHIFT {
        mem.create_page(pageno)?;
    }
    mem.set_start_address(entry);
    mem.set_stack_address(stack_top);

    let symbols = find_symbol_tables::<A>(binary)?;
    if let Some(info) = &symbols {
        if let Some((value, _)) = resolve_symbol::<A>(binary, info, "_exit") {
            mem.set_exit_address(value);
        }
    }

    Ok(LoadedImage { start_address: entry, symbols })
}

/// Replace the owned pages of a read-only segment with shared backing
/// other machines can reference. Runs after relocation, so the shared
/// bytes include any fixups applied to the segment.
fn install_shared_segment(
    mem: &mut Memory,
    vaddr: u64,
    memsz: u64,
    attr: PageAttributes,
) -> Result<(), MachineError> {
    let n_pages = ((memsz + PAGE_MASK) >> PAGE_SHIFT) as usize;
    let mut pages = Vec::with_capacity(n_pages);
    for i in 0..n_pages {
        let mut data = [0u8; PAGE_SIZE];
        mem.memcpy_out(&mut data, vaddr + (i * PAGE_SIZE) as u64)?;
        pages.push(Page::shared(Arc::new(data), attr));
    }
    mem.free_pages(vaddr, n_pages * PAGE_SIZE);
    mem.install_ro_segment(vaddr >> PAGE_SHIFT, Arc::new(pages));
    Ok(())
}

/// Apply the relocations a static executable may still carry. Anything
/// beyond the handful of absolute types is refused.
fn apply_relocations<A: Arch>(mem: &mut Memory, binary: &[u8]) -> Result<(), MachineError> {
    let sections = section_headers::<A>(binary)?;
    let entsize = if A::WIDTH == 8 { 24 } else { 12 };

    for shdr in &sections {
        if shdr.sh_type != SHT_RELA {
            continue;
        }
        let symtab = sections
            .get(shdr.link as usize)
            .ok_or(MachineError::InvalidBinary { reason: "dangling rela link" })?;
        let count = shdr.size / entsize;
        for i in 0..count {
            let off = (shdr.offset + i * entsize) as usize;
            let (r_offset, rtype, symidx, addend) = if A::WIDTH == 8 {
                let info = read_u64(binary, off + 8)?;
                (
                    read_u64(binary, off)?,
                    info as u32,
                    (info >> 32) as u32,
                    read_u64(binary, off + 16)? as i64,
                )
            } else {
                let info = read_u32(binary, off + 4)?;
                (
                    read_u32(binary, off)? as u64,
                    info & 0xff,
                    info >> 8,
                    read_u32(binary, off + 8)? as i32 as i64,
                )
            };
            match rtype {
                R_RISCV_NONE => {}
                R_RISCV_RELATIVE => {
                    // Static executables load at their linked address, so
                    // the relative base is zero.
                    write_reloc::<A>(mem, r_offset, addend as u64)?;
                }
                R_RISCV_32 | R_RISCV_64 => {
                    let sym_off = symtab.offset as usize + symidx as usize * sym_entry_size::<A>();
                    let sym = symbol::<A>(binary, sym_off)?;
                    let value = sym.value.wrapping_add(addend as u64);
                    if rtype == R_RISCV_32 {
                        mem.write_u32(r_offset, value as u32)?;
                    } else {
                        mem.write_u64(r_offset, value)?;
                    }
                }
                other => return Err(MachineError::UnknownRelocation { rtype: other }),
            }
        }
    }
    Ok(())
}

fn write_reloc<A: Arch>(mem: &mut Memory, offset: u64, value: u64) -> Result<(), MachineError> {
    if A::WIDTH == 8 {
        mem.write_u64(offset, value)
    } else {
        mem.write_u32(offset, value as u32)
    }
}

fn section_headers<A: Arch>(binary: &[u8]) -> Result<Vec<SectionHeader>, MachineError> {
    let (shoff, shentsize, shnum) = if A::WIDTH == 8 {
        (read_u64(binary, 40)?, read_u16(binary, 58)?, read_u16(binary, 60)?)
    } else {
        (read_u32(binary, 32)? as u64, read_u16(binary, 46)?, read_u16(binary, 48)?)
    };
    let mut sections = Vec::with_capacity(shnum as usize);
    for i in 0..shnum as u64 {
        sections.push(section_header::<A>(binary, (shoff + i * shentsize as u64) as usize)?);
    }
    Ok(sections)
}

/// Locate `.symtab` and its linked string table.
pub(crate) fn find_symbol_tables<A: Arch>(
    binary: &[u8],
) -> Result<Option<SymbolInfo>, MachineError> {
    let sections = section_headers::<A>(binary)?;
    for shdr in &sections {
        if shdr.sh_type != SHT_SYMTAB {
            continue;
        }
        let strtab = match sections.get(shdr.link as usize) {
            Some(s) => s,
            None => continue,
        };
        return Ok(Some(SymbolInfo {
            symtab_off: shdr.offset as usize,
            symtab_len: shdr.size as usize,
            strtab_off: strtab.offset as usize,
            strtab_len: strtab.size as usize,
        }));
    }
    Ok(None)
}

fn symbol_name<'a>(binary: &'a [u8], info: &SymbolInfo, name_off: u32) -> Option<&'a str> {
    let start = info.strtab_off + name_off as usize;
    let end = info.strtab_off + info.strtab_len;
    let bytes = binary.get(start..end.min(binary.len()))?;
    let nul = bytes.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&bytes[..nul]).ok()
}

/// Scan the symbol table for `name`, returning its value and size.
pub(crate) fn resolve_symbol<A: Arch>(
    binary: &[u8],
    info: &SymbolInfo,
    name: &str,
) -> Option<(u64, u64)> {
    let entsize = sym_entry_size::<A>();
    let count = info.symtab_len / entsize;
    for i in 0..count {
        let sym = symbol::<A>(binary, info.symtab_off + i * entsize).ok()?;
        if symbol_name(binary, info, sym.name_off) == Some(name) {
            return Some((sym.value, sym.size));
        }
    }
    None
}

/// The enclosing symbol for `addr`: the largest start address at or below
/// it with nonzero size.
pub(crate) fn lookup_symbol<A: Arch>(
    binary: &[u8],
    info: &SymbolInfo,
    addr: u64,
) -> Option<Callsite> {
    let entsize = sym_entry_size::<A>();
    let count = info.symtab_len / entsize;
    let mut best: Option<Symbol> = None;
    for i in 0..count {
        let sym = symbol::<A>(binary, info.symtab_off + i * entsize).ok()?;
        if sym.size == 0 || sym.value > addr || addr >= sym.value + sym.size {
            continue;
        }
        if best.as_ref().map_or(true, |b| sym.value > b.value) {
            best = Some(sym);
        }
    }
    best.map(|sym| Callsite {
        name: symbol_name(binary, info, sym.name_off).unwrap_or("(null)").to_string(),
        address: sym.value,
        offset: (addr - sym.value) as u32,
        size: sym.size,
    })
}
