//! System Information Module: factory calibration and unique-ID constants.

use dyno_regs::{ro_init, FieldDef, Register, RegisterBlock};
use memory::{BusFault, MmioCtx, MmioHandler};

use crate::Peripheral;

const TEMP_CAL_1: &[FieldDef] = &[ro_init("value", 32, 0x9F03_171C)];
const TEMP_CAL_2: &[FieldDef] = &[ro_init("value", 32, 0xCFBC_FFFF)];
const DEV_ID_1: &[FieldDef] = &[ro_init("value", 32, 0x01FF_FFFF)];
const DEV_ID_2: &[FieldDef] = &[ro_init("value", 32, 0xFF44_4534)];
const DEV_ID_3: &[FieldDef] = &[ro_init("value", 32, 0x3338_3837)];
const DEV_ID_4: &[FieldDef] = &[ro_init("value", 32, 0x1101_1014)];

pub struct Sim {
    regs: RegisterBlock,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    pub fn new() -> Sim {
        let mut regs = RegisterBlock::new();
        regs.insert(0x00, Register::new(TEMP_CAL_1));
        regs.insert(0x04, Register::new(TEMP_CAL_2));
        regs.insert(0x10, Register::new(DEV_ID_1));
        regs.insert(0x14, Register::new(DEV_ID_2));
        regs.insert(0x18, Register::new(DEV_ID_3));
        regs.insert(0x1C, Register::new(DEV_ID_4));
        Sim { regs }
    }
}

impl MmioHandler for Sim {
    fn read(&mut self, ctx: &MmioCtx, offset: u32, size: usize) -> Result<u32, BusFault> {
        self.regs.read(offset, size).ok_or(BusFault::DataRead {
            addr: ctx.addr,
            pc: ctx.pc,
        })
    }

    fn write(&mut self, ctx: &MmioCtx, offset: u32, size: usize, value: u32) -> Result<(), BusFault> {
        // All SIM registers are read-only constants; writes to them are
        // discarded by the parse rules.
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

impl Peripheral for Sim {
    fn name(&self) -> &'static str {
        "SIM"
    }

    fn reset(&mut self) {
        self.regs.reset();
    }
}
