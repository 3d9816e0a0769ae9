//! Machine assembly for the MPC5674F-class SoC.
//!
//! Builds the physical memory map (flash, SRAM, peripheral windows), owns
//! the shared peripheral instances, and drives the boot and reset
//! orchestration: the BAM reset-configuration-half-word scan, the
//! standby-preserving SRAM reset, and the instruction-boundary exception
//! poll the executor calls between instructions.

mod bam;
mod config;
mod core_state;
mod machine;

pub use bam::{scan_rchw, BOOT_CANDIDATES, RCHW_BOOT_ID};
pub use config::{MachineConfig, SramConfig};
pub use core_state::CoreState;
pub use machine::Machine;
