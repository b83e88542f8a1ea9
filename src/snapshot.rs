//! Machine snapshots
//!
//! Serializes the full guest-visible state: a fixed header, the dense
//! register block, and one record per active page. The byte encoding is
//! bincode compressed with zstd. Snapshots are portable between hosts of
//! the same endianness; the magic carries the format version, and restore
//! targets a machine constructed from the same binary (shared rodata and
//! the execute segment are rebuilt by the loader, non-owned and trap pages
//! must be re-registered by the embedder).

use serde::{Deserialize, Serialize};

use crate::arch::Arch;
use crate::error::MachineError;
use crate::machine::Machine;
use crate::memory::{Page, PageAttributes};

pub const SNAPSHOT_VERSION: u8 = 1;
pub const SNAPSHOT_MAGIC: u32 = 0x5256_4d00 | SNAPSHOT_VERSION as u32;

/// Fixed-layout snapshot header.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: u32,
    /// Address width in bytes (4 or 8).
    pub width: u8,
    pub counter: u64,
    pub pc: u64,
    pub start_address: u64,
    pub stack_address: u64,
    pub exit_address: u64,
    pub n_pages: u32,
}

#[derive(Serialize, Deserialize)]
struct PageRecord {
    page_number: u64,
    attr: u8,
    variant: u8,
    /// Backing bytes; absent for non-owned and trap pages.
    data: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct MachineState {
    header: SnapshotHeader,
    regs: Vec<u64>,
    fregs: Vec<u64>,
    fcsr: u32,
    pages: Vec<PageRecord>,
}

fn decode_state(data: &[u8]) -> Result<MachineState, MachineError> {
    let decompressed = zstd::stream::decode_all(data)
        .map_err(|_| MachineError::InvalidSnapshot { reason: "decompression failed" })?;
    bincode::deserialize(&decompressed)
        .map_err(|_| MachineError::InvalidSnapshot { reason: "malformed snapshot" })
}

/// Read just the header of a serialized snapshot.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, MachineError> {
    let decompressed = zstd::stream::decode_all(data)
        .map_err(|_| MachineError::InvalidSnapshot { reason: "decompression failed" })?;
    // The header is the leading field of the state record.
    bincode::deserialize(&decompressed)
        .map_err(|_| MachineError::InvalidSnapshot { reason: "malformed snapshot" })
}

impl<A: Arch> Machine<A> {
    /// Serialize the machine state into `out`.
    pub fn serialize_to(&self, out: &mut Vec<u8>) -> Result<(), MachineError> {
        let mut pages: Vec<PageRecord> = self
            .memory
            .iter_pages()
            .map(|(page_number, page)| {
                let variant = page.variant_tag();
                let data = match variant {
                    // Owned and shared pages carry their bytes; non-owned
                    // and trap backing belongs to the embedder.
                    0 | 1 => page.bytes().map(|b| b.to_vec()),
                    _ => None,
                };
                PageRecord { page_number, attr: page.attr.to_bits(), variant, data }
            })
            .collect();
        pages.sort_by_key(|r| r.page_number);

        let header = SnapshotHeader {
            magic: SNAPSHOT_MAGIC,
            width: A::WIDTH,
            counter: self.cpu.counter,
            pc: A::to_u64(self.cpu.pc),
            start_address: self.memory.start_address(),
            stack_address: self.memory.stack_address(),
            exit_address: self.memory.exit_address(),
            n_pages: pages.len() as u32,
        };

        #[cfg(feature = "float")]
        let (fregs, fcsr) = (self.cpu.fpu.fregs.to_vec(), self.cpu.fpu.read_fcsr());
        #[cfg(not(feature = "float"))]
        let (fregs, fcsr) = (Vec::new(), 0);

        let state = MachineState {
            header,
            regs: self.cpu.registers().iter().map(|r| A::to_u64(*r)).collect(),
            fregs,
            fcsr,
            pages,
        };

        let encoded = bincode::serialize(&state)
            .map_err(|_| MachineError::InvalidSnapshot { reason: "encoding failed" })?;
        let compressed = zstd::stream::encode_all(&encoded[..], 3)
            .map_err(|_| MachineError::InvalidSnapshot { reason: "compression failed" })?;
        out.extend_from_slice(&compressed);
        Ok(())
    }

    /// Restore machine state from a snapshot taken of the same binary and
    /// width. `header` is the value from `read_snapshot_header`.
    pub fn deserialize_from(
        &mut self,
        data: &[u8],
        header: &SnapshotHeader,
    ) -> Result<(), MachineError> {
        if header.magic != SNAPSHOT_MAGIC {
            return Err(MachineError::InvalidSnapshot { reason: "unsupported snapshot version" });
        }
        if header.width != A::WIDTH {
            return Err(MachineError::InvalidSnapshot { reason: "snapshot width mismatch" });
        }
        let state = decode_state(data)?;
        if state.header != *header {
            return Err(MachineError::InvalidSnapshot { reason: "header does not match snapshot" });
        }
        if state.regs.len() != 32 || state.pages.len() as u32 != state.header.n_pages {
            return Err(MachineError::InvalidSnapshot { reason: "inconsistent snapshot contents" });
        }

        self.memory.reset_pages();
        self.memory.set_start_address(header.start_address);
        self.memory.set_stack_address(header.stack_address);
        self.memory.set_exit_address(header.exit_address);

        for record in state.pages {
            let attr = PageAttributes::from_bits(record.attr);
            match record.variant {
                0 | 1 => {
                    let data = record
                        .data
                        .ok_or(MachineError::InvalidSnapshot { reason: "missing page data" })?;
                    self.memory
                        .insert_restored_page(record.page_number, Page::from_bytes(&data, attr))?;
                }
                // Non-owned mappings must be re-established by the embedder.
                2 => {}
                3 => {
                    // Trap page; the MMIO handler must be re-registered.
                    self.memory.insert_restored_page(record.page_number, Page::trapped(attr))?;
                }
                _ => return Err(MachineError::InvalidSnapshot { reason: "unknown page variant" }),
            }
        }
        self.memory.invalidate_exec_all();

        for (i, value) in state.regs.iter().enumerate() {
            self.cpu.registers_mut()[i] = A::from_u64(*value);
        }
        self.cpu.pc = A::from_u64(header.pc);
        self.cpu.counter = header.counter;
        #[cfg(feature = "atomics")]
        {
            self.cpu.reservation = None;
        }
        #[cfg(feature = "float")]
        {
            for (i, value) in state.fregs.iter().take(32).enumerate() {
                self.cpu.fpu.fregs[i] = *value;
            }
            self.cpu.fpu.write_fcsr(state.fcsr);
        }
        self.stopped = false;
        Ok(())
    }
}
