//! Physical address space and MMIO dispatch for a big-endian 32-bit SoC.
//!
//! The bus partitions the 4 GiB physical space into non-overlapping regions:
//! bus-owned RAM blocks (SRAM, flash images exposed read-only, ...) and MMIO
//! windows dispatched to peripheral handlers. All multi-byte accesses are
//! big-endian and must be naturally aligned; violations surface as typed
//! [`BusFault`] values that the instruction executor translates into
//! architectural exceptions.

mod bus;
mod fault;

pub use bus::{MemoryBus, MmioCtx, MmioHandler, SupervisorGuard};
pub use fault::BusFault;

use bitflags::bitflags;

/// 32-bit physical address.
pub type PhysAddr = u32;

bitflags! {
    /// Region access permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perms: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

/// Privilege of a bus access, taken from the core's MSR by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Supervisor,
    User,
}

/// Assemble a big-endian value from the first `size` bytes of `bytes`.
pub fn be_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

/// Serialize the low `size` bytes of `value` big-endian into a fixed buffer.
/// Only the first `size` bytes of the result are meaningful.
pub fn be_bytes(value: u32, size: usize) -> [u8; 4] {
    debug_assert!(matches!(size, 1 | 2 | 4));
    let mut out = [0u8; 4];
    for (i, slot) in out.iter_mut().take(size).enumerate() {
        *slot = (value >> (8 * (size - 1 - i))) as u8;
    }
    out
}
