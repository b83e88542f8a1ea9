//! Address-width parameterization
//!
//! The engine is generic over the guest word size. `RV32` and `RV64` are the
//! two supported architectures; both share the same CPU, decoder and memory
//! code. All width-dependent arithmetic goes through the conversion pairs
//! below, which monomorphize to plain truncation/extension (or nothing at
//! all for RV64), so the hot path carries no runtime width dispatch.

use std::fmt;
use std::hash::Hash;

pub trait Arch: Copy + Default + Eq + fmt::Debug + Send + Sync + 'static {
    /// Unsigned machine word, also the guest address type.
    type Addr: Copy
        + Default
        + Eq
        + Ord
        + Hash
        + fmt::Debug
        + fmt::Display
        + fmt::LowerHex
        + Send
        + Sync
        + 'static;

    /// Register width in bits (32 or 64).
    const XLEN: u32;
    /// Register width in bytes (4 or 8).
    const WIDTH: u8;
    /// Expected EI_CLASS of guest binaries (ELFCLASS32 / ELFCLASS64).
    const ELF_CLASS: u8;
    /// Mask applied to shift amounts (XLEN - 1).
    const SHIFT_MASK: u32;

    fn to_u64(v: Self::Addr) -> u64;
    /// Truncating conversion; this is where 32-bit address wrap-around happens.
    fn from_u64(v: u64) -> Self::Addr;
    /// Sign-extending conversion.
    fn to_i64(v: Self::Addr) -> i64;
    fn from_i64(v: i64) -> Self::Addr {
        Self::from_u64(v as u64)
    }
}

/// 32-bit RISC-V (RV32I base).
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct RV32;

/// 64-bit RISC-V (RV64I base).
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct RV64;

impl Arch for RV32 {
    type Addr = u32;
    const XLEN: u32 = 32;
    const WIDTH: u8 = 4;
    const ELF_CLASS: u8 = 1;
    const SHIFT_MASK: u32 = 0x1f;

    #[inline(always)]
    fn to_u64(v: u32) -> u64 {
        v as u64
    }
    #[inline(always)]
    fn from_u64(v: u64) -> u32 {
        v as u32
    }
    #[inline(always)]
    fn to_i64(v: u32) -> i64 {
        v as i32 as i64
    }
}

impl Arch for RV64 {
    type Addr = u64;
    const XLEN: u32 = 64;
    const WIDTH: u8 = 8;
    const ELF_CLASS: u8 = 2;
    const SHIFT_MASK: u32 = 0x3f;

    #[inline(always)]
    fn to_u64(v: u64) -> u64 {
        v
    }
    #[inline(always)]
    fn from_u64(v: u64) -> u64 {
        v
    }
    #[inline(always)]
    fn to_i64(v: u64) -> i64 {
        v as i64
    }
}
