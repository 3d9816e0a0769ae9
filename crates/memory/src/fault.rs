use thiserror::Error;

/// Typed bus access failures.
///
/// These are guest-visible events, not emulator bugs: the executor converts
/// them into alignment or machine-check exceptions. Writes never partially
/// commit; a faulted write has written zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("unaligned {size}-byte access at {addr:#010x}")]
    Alignment { addr: u32, size: usize },

    #[error("data read bus error at {addr:#010x} (pc {pc:#010x})")]
    DataRead { addr: u32, pc: u32 },

    #[error("data write bus error at {addr:#010x} (pc {pc:#010x}, data {data:#010x})")]
    DataWrite { addr: u32, pc: u32, data: u32 },
}

impl BusFault {
    /// The faulting physical address.
    pub fn addr(&self) -> u32 {
        match *self {
            BusFault::Alignment { addr, .. }
            | BusFault::DataRead { addr, .. }
            | BusFault::DataWrite { addr, .. } => addr,
        }
    }
}
