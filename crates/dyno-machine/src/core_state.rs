//! The narrow core-facing state block.
//!
//! The instruction executor owns the full register file; the machine only
//! tracks what boot, reset and exception vectoring touch: PC, MSR, the
//! stack pointer, and the three class-specific saved-state pairs.

use dyno_interrupts::{msr, ExceptionClass};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreState {
    pub pc: u32,
    pub msr: u32,
    /// GPR1, the PowerPC stack pointer.
    pub r1: u32,

    pub srr0: u32,
    pub srr1: u32,
    pub csrr0: u32,
    pub csrr1: u32,
    pub mcsrr0: u32,
    pub mcsrr1: u32,
}

impl CoreState {
    /// Save `pc`/`msr` into the class-specific pair and mask the class's
    /// enable bit, as the vectoring hardware does.
    pub fn enter_exception(&mut self, class: ExceptionClass) {
        match class {
            ExceptionClass::Standard => {
                self.srr0 = self.pc;
                self.srr1 = self.msr;
                self.msr &= !msr::EE;
            }
            ExceptionClass::Critical => {
                self.csrr0 = self.pc;
                self.csrr1 = self.msr;
                self.msr &= !(msr::CE | msr::EE);
            }
            ExceptionClass::MachineCheck => {
                self.mcsrr0 = self.pc;
                self.mcsrr1 = self.msr;
                self.msr &= !(msr::ME | msr::CE | msr::EE);
            }
            ExceptionClass::Reset => {}
        }
    }

    /// Restore the class's saved pair into PC/MSR (`rfi`/`rfci`/`rfmci`).
    pub fn leave_exception(&mut self, class: ExceptionClass) {
        match class {
            ExceptionClass::Standard => {
                self.pc = self.srr0;
                self.msr = self.srr1;
            }
            ExceptionClass::Critical => {
                self.pc = self.csrr0;
                self.msr = self.csrr1;
            }
            ExceptionClass::MachineCheck => {
                self.pc = self.mcsrr0;
                self.msr = self.mcsrr1;
            }
            ExceptionClass::Reset => {}
        }
    }
}
