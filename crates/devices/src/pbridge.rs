//! Peripheral bridge (PBRIDGE) access-control register files.
//!
//! The bridge only carries configuration state in this model; the actual
//! gating of peripheral accesses is performed by the bus router. PBRIDGE_A
//! carries one PACR register, PBRIDGE_B three; both carry the MPCR and four
//! OPACR registers.

use dyno_regs::{rw_init, FieldDef, Register, RegisterBlock};
use memory::{BusFault, MmioCtx, MmioHandler};

use crate::Peripheral;

const MPCR_LAYOUT: &[FieldDef] = &[rw_init("acr", 32, 0x7777_7777)];
const ACR_LAYOUT: &[FieldDef] = &[rw_init("acr", 32, 0x4444_4444)];

pub struct Pbridge {
    name: &'static str,
    regs: RegisterBlock,
}

impl Pbridge {
    /// `pacr_count` is 1 for PBRIDGE_A and 3 for PBRIDGE_B.
    pub fn new(name: &'static str, pacr_count: usize) -> Pbridge {
        let mut regs = RegisterBlock::new();
        regs.insert(0x0000, Register::new(MPCR_LAYOUT));
        for i in 0..pacr_count {
            regs.insert(0x0020 + 4 * i as u32, Register::new(ACR_LAYOUT));
        }
        for i in 0..4 {
            regs.insert(0x0040 + 4 * i as u32, Register::new(ACR_LAYOUT));
        }
        Pbridge { name, regs }
    }
}

impl MmioHandler for Pbridge {
    fn read(&mut self, ctx: &MmioCtx, offset: u32, size: usize) -> Result<u32, BusFault> {
        self.regs.read(offset, size).ok_or(BusFault::DataRead {
            addr: ctx.addr,
            pc: ctx.pc,
        })
    }

    fn write(&mut self, ctx: &MmioCtx, offset: u32, size: usize, value: u32) -> Result<(), BusFault> {
        self.regs
            .write(offset, size, value)
            .map(|_| ())
            .ok_or(BusFault::DataWrite {
                addr: ctx.addr,
                pc: ctx.pc,
                data: value,
            })
    }
}

impl Peripheral for Pbridge {
    fn name(&self) -> &'static str {
        self.name
    }

    fn reset(&mut self) {
        self.regs.reset();
    }
}
