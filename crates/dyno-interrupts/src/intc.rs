use std::collections::VecDeque;

use dyno_regs::{resv, ro, rw, FieldDef, Register};
use memory::{BusFault, MmioCtx, MmioHandler};
use tracing::{debug, trace};

use crate::exception::{Exception, ExceptionClass};
use crate::msr;

/// Number of external interrupt sources the controller tracks.
pub const INTC_SOURCES: usize = 512;

/// Sources 0..=7 are the software-settable interrupts (SSCIR0..7).
pub const INTC_SOFT_SOURCES: u32 = 8;

const MCR_OFFSET: u32 = 0x0000;
const CPR_OFFSET: u32 = 0x0008;
const IACKR_OFFSET: u32 = 0x0010;
const EOIR_OFFSET: u32 = 0x0018;
const SSCIR_OFFSET: u32 = 0x0020;
const PSR_OFFSET: u32 = 0x0040;

const MCR_LAYOUT: &[FieldDef] = &[
    resv(26),
    rw("vtes", 1),
    resv(4),
    rw("hven", 1),
];

const CPR_LAYOUT: &[FieldDef] = &[resv(28), rw("pri", 4)];

const IACKR_LAYOUT: &[FieldDef] = &[rw("vtba", 21), ro("intvec", 9), resv(2)];

/// Interrupt controller plus the four class exception queues.
///
/// The controller itself is a normal MMIO peripheral (`0xFFF48000`): software
/// manipulates `CPR`, the per-source `PSR` priorities, the software-set
/// interrupts and the end-of-interrupt register through the bus. The queue
/// side is reached directly by peripherals (`post`) and the executor
/// (`next_pending` / `acknowledge` / `rfi`).
pub struct Intc {
    mcr: Register,
    cpr: Register,
    iackr: Register,
    psr: [u8; INTC_SOURCES],
    sscir: [bool; INTC_SOFT_SOURCES as usize],

    /// One FIFO per class, `ExceptionClass` order (reset first).
    queues: [VecDeque<Exception>; 4],
    /// LIFO of preempted priorities, pushed on acknowledge, popped by EOIR.
    priority_stack: Vec<u8>,
    /// Exceptions vectored but not yet retired by RFI, per class.
    in_service: [u32; 4],
}

impl Default for Intc {
    fn default() -> Self {
        Self::new()
    }
}

impl Intc {
    pub fn new() -> Intc {
        Intc {
            mcr: Register::new(MCR_LAYOUT),
            cpr: Register::new(CPR_LAYOUT),
            iackr: Register::new(IACKR_LAYOUT),
            psr: [0; INTC_SOURCES],
            sscir: [false; INTC_SOFT_SOURCES as usize],
            queues: Default::default(),
            priority_stack: Vec::new(),
            in_service: [0; 4],
        }
    }

    pub fn reset(&mut self) {
        self.mcr.reset();
        self.cpr.reset();
        self.iackr.reset();
        self.psr = [0; INTC_SOURCES];
        self.sscir = [false; INTC_SOFT_SOURCES as usize];
        for q in &mut self.queues {
            q.clear();
        }
        self.priority_stack.clear();
        self.in_service = [0; 4];
    }

    /// Current priority (`CPR[PRI]`).
    pub fn current_priority(&self) -> u8 {
        self.cpr.get_by_name("pri") as u8
    }

    pub fn set_current_priority(&mut self, pri: u8) {
        self.cpr.set_by_name("pri", u32::from(pri));
    }

    /// Priority of an external source (`PSRn`).
    pub fn source_priority(&self, source: u32) -> u8 {
        self.psr[source as usize]
    }

    pub fn set_source_priority(&mut self, source: u32, pri: u8) {
        self.psr[source as usize] = pri & 0xF;
    }

    /// Queue an exception. Queueing is infallible; the FIFOs are unbounded.
    pub fn post(&mut self, exc: Exception) {
        trace!(?exc, "exception posted");
        self.queues[exc.class() as usize].push_back(exc);
    }

    fn class_gate_open(&self, class: ExceptionClass, msr_value: u32) -> bool {
        match class {
            ExceptionClass::Reset => true,
            ExceptionClass::MachineCheck => msr_value & msr::ME != 0,
            ExceptionClass::Critical => msr_value & msr::CE != 0,
            ExceptionClass::Standard => msr_value & msr::EE != 0,
        }
    }

    /// The next exception that may vector under the given MSR, without
    /// removing it. Classes are scanned highest first; within the standard
    /// class, FIFO order among sources whose priority beats `CPR`; gated
    /// entries stay latched in place.
    pub fn next_pending(&self, msr_value: u32) -> Option<Exception> {
        for (idx, queue) in self.queues.iter().enumerate() {
            let class = CLASSES[idx];
            if !self.class_gate_open(class, msr_value) {
                continue;
            }
            if class == ExceptionClass::Standard {
                let cpr = self.current_priority();
                if let Some(exc) = queue.iter().find(|exc| match exc {
                    Exception::External { source } => self.source_priority(*source) > cpr,
                    _ => true,
                }) {
                    return Some(*exc);
                }
            } else if let Some(exc) = queue.front() {
                return Some(*exc);
            }
        }
        None
    }

    /// Remove `exc` from its queue and mark it in service. For external
    /// sources the preempted priority is pushed and `CPR` is raised to the
    /// source's priority, so equal-or-lower sources stay latched until EOIR.
    pub fn acknowledge(&mut self, exc: &Exception) {
        let queue = &mut self.queues[exc.class() as usize];
        let pos = queue
            .iter()
            .position(|e| e == exc)
            .expect("acknowledged exception is not pending");
        queue.remove(pos);
        self.in_service[exc.class() as usize] += 1;

        if let Exception::External { source } = exc {
            let old = self.current_priority();
            let new = self.source_priority(*source);
            self.priority_stack.push(old);
            self.set_current_priority(new);
            self.iackr.set_by_name("intvec", *source);
            debug!(source, old, new, "external interrupt acknowledged");
        }
    }

    /// End-of-interrupt: restore the preempted priority. A spurious EOIR
    /// with an empty stack is ignored, as on the real controller.
    pub fn end_of_interrupt(&mut self) {
        if let Some(pri) = self.priority_stack.pop() {
            self.set_current_priority(pri);
        }
    }

    /// Retire the most recent in-service exception of `class`. RFI with no
    /// matching in-service exception means the emulator lost track of its
    /// own exception stack; that is fatal.
    pub fn rfi(&mut self, class: ExceptionClass) {
        let slot = &mut self.in_service[class as usize];
        if *slot == 0 {
            panic!("RFI for {class:?} with no exception in service");
        }
        *slot -= 1;
    }

    pub fn in_service(&self, class: ExceptionClass) -> u32 {
        self.in_service[class as usize]
    }

    /// Pending count across all classes (diagnostics).
    pub fn pending_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn sscir_write(&mut self, idx: usize, value: u8) {
        // Bit 1 = SET, bit 0 = CLR; set wins the same write on real silicon
        // only if CLR is zero.
        if value & 0x01 != 0 {
            self.sscir[idx] = false;
        } else if value & 0x02 != 0 && !self.sscir[idx] {
            self.sscir[idx] = true;
            self.post(Exception::External { source: idx as u32 });
        }
    }
}

const CLASSES: [ExceptionClass; 4] = [
    ExceptionClass::Reset,
    ExceptionClass::MachineCheck,
    ExceptionClass::Critical,
    ExceptionClass::Standard,
];

impl MmioHandler for Intc {
    fn read(&mut self, ctx: &MmioCtx, offset: u32, size: usize) -> Result<u32, BusFault> {
        let word = offset & !3;
        let value = match word {
            MCR_OFFSET => self.mcr.emit(),
            CPR_OFFSET => self.cpr.emit(),
            IACKR_OFFSET => self.iackr.emit(),
            EOIR_OFFSET => 0,
            o if (SSCIR_OFFSET..SSCIR_OFFSET + INTC_SOFT_SOURCES).contains(&o) => {
                let mut v = 0u32;
                for i in 0..4 {
                    let idx = (o - SSCIR_OFFSET) as usize + i;
                    if idx < self.sscir.len() && self.sscir[idx] {
                        v |= 1 << (8 * (3 - i));
                    }
                }
                v
            }
            o if (PSR_OFFSET..PSR_OFFSET + INTC_SOURCES as u32).contains(&o) => {
                let mut v = 0u32;
                for i in 0..4 {
                    let idx = (o - PSR_OFFSET) as usize + i;
                    if idx < INTC_SOURCES {
                        v |= u32::from(self.psr[idx]) << (8 * (3 - i));
                    }
                }
                v
            }
            _ => {
                return Err(BusFault::DataRead {
                    addr: ctx.addr,
                    pc: ctx.pc,
                })
            }
        };
        let start = (offset & 3) as usize;
        let bytes = value.to_be_bytes();
        Ok(bytes[start..start + size]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
    }

    fn write(&mut self, ctx: &MmioCtx, offset: u32, size: usize, value: u32) -> Result<(), BusFault> {
        let word = offset & !3;
        match word {
            MCR_OFFSET => self.mcr.parse(value),
            CPR_OFFSET => {
                self.cpr.parse(value);
                // Lowering CPR re-opens the gate; the executor observes the
                // change at the next instruction boundary poll.
                trace!(pri = self.current_priority(), "CPR written");
            }
            IACKR_OFFSET => self.iackr.parse(value),
            EOIR_OFFSET => self.end_of_interrupt(),
            o if o >= SSCIR_OFFSET && o < SSCIR_OFFSET + INTC_SOFT_SOURCES => {
                // Byte-lane writes; each byte is one SSCIR register.
                for i in 0..size {
                    let idx = (offset - SSCIR_OFFSET) as usize + i;
                    if idx < self.sscir.len() {
                        let byte = (value >> (8 * (size - 1 - i))) as u8;
                        self.sscir_write(idx, byte);
                    }
                }
            }
            o if (PSR_OFFSET..PSR_OFFSET + INTC_SOURCES as u32).contains(&o) => {
                for i in 0..size {
                    let idx = (offset - PSR_OFFSET) as usize + i;
                    if idx < INTC_SOURCES {
                        let byte = (value >> (8 * (size - 1 - i))) as u8;
                        self.psr[idx] = byte & 0xF;
                    }
                }
            }
            _ => {
                return Err(BusFault::DataWrite {
                    addr: ctx.addr,
                    pc: ctx.pc,
                    data: value,
                })
            }
        }
        Ok(())
    }
}
