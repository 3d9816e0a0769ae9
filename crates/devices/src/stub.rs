//! Placeholder peripheral windows.
//!
//! Windows for peripherals the emulator does not model functionally (eSCI,
//! FlexCAN, eQADC, timers, ...) read as zeros and swallow writes, so guest
//! configuration code runs through them without machine checks.

use memory::{BusFault, MmioCtx, MmioHandler};
use tracing::trace;

use crate::Peripheral;

pub struct StubWindow {
    name: &'static str,
}

impl StubWindow {
    pub fn new(name: &'static str) -> StubWindow {
        StubWindow { name }
    }
}

impl MmioHandler for StubWindow {
    fn read(&mut self, _ctx: &MmioCtx, _offset: u32, _size: usize) -> Result<u32, BusFault> {
        Ok(0)
    }

    fn write(&mut self, _ctx: &MmioCtx, offset: u32, _size: usize, value: u32) -> Result<(), BusFault> {
        trace!(stub = self.name, offset = format_args!("{offset:#x}"), value = format_args!("{value:#x}"), "write ignored");
        Ok(())
    }
}

impl Peripheral for StubWindow {
    fn name(&self) -> &'static str {
        self.name
    }

    fn reset(&mut self) {}
}
