//! DSPI (deserial/serial peripheral interface) controller.
//!
//! Models the SPI half of the NXP DSPI block: the mode machine, the 4-deep
//! Tx command FIFO behind PUSHR, the 4+1-deep Rx FIFO behind POPR (four
//! visible slots plus the shift register), CTAR-selected frame widths, and
//! the end-of-queue transmit semantics. The DSI and CSI chaining modes are
//! deliberately loud gaps.

use std::cell::RefCell;
use std::rc::Rc;

use dyno_interrupts::{Exception, Intc};
use dyno_regs::{resv, ro, ro_init, rw, rw_init, w1c, w1c_init, FieldDef, Register};
use memory::{BusFault, MmioCtx, MmioHandler};
use tracing::{debug, error, trace};

use crate::io::IoConnection;
use crate::spi::SpiBus;
use crate::Peripheral;

const MCR_OFFSET: u32 = 0x0000;
const TCR_OFFSET: u32 = 0x0008;
const CTAR_OFFSET: u32 = 0x000C;
const SR_OFFSET: u32 = 0x002C;
const RSER_OFFSET: u32 = 0x0030;
const PUSHR_OFFSET: u32 = 0x0034;
const POPR_OFFSET: u32 = 0x0038;
const TXFR_OFFSET: u32 = 0x003C;
const RXFR_OFFSET: u32 = 0x007C;
const DSICR_OFFSET: u32 = 0x00BC;
const SDR_OFFSET: u32 = 0x00C0;
const ASDR_OFFSET: u32 = 0x00C4;
const COMPR_OFFSET: u32 = 0x00C8;
const DDR_OFFSET: u32 = 0x00CC;
const DSICR1_OFFSET: u32 = 0x00D0;

/// Number of clock-and-transfer-attribute registers.
pub const CTAR_COUNT: usize = 8;
/// Tx FIFO depth (1 when `MCR[DIS_TXF]` is set).
pub const TX_FIFO_DEPTH: usize = 4;
/// Rx FIFO depth including the shift-register slot.
pub const RX_FIFO_DEPTH: usize = 5;

// PUSHR command word decode.
const PUSHR_CONT_MASK: u32 = 0x8000_0000;
const PUSHR_CTAS_MASK: u32 = 0x7000_0000;
const PUSHR_CTAS_SHIFT: u32 = 28;
const PUSHR_EOQ_MASK: u32 = 0x0800_0000;
const PUSHR_CTCNT_MASK: u32 = 0x0400_0000;
const PUSHR_PCS_MASK: u32 = 0x003F_0000;
const PUSHR_PCS_SHIFT: u32 = 16;

const MAX_TCNT: u32 = 0xFFFF;

const MCR_LAYOUT: &[FieldDef] = &[
    rw("mstr", 1),
    rw("cont_scke", 1),
    rw("dconf", 2),
    rw("frz", 1),
    rw("mtfe", 1),
    rw("pcsse", 1),
    rw("rooe", 1),
    resv(2),
    rw("pcsis", 6),
    rw("doze", 1),
    rw("mdis", 1),
    rw("dis_txf", 1),
    rw("dis_rxf", 1),
    rw("clr_txf", 1),
    rw("clr_rxf", 1),
    rw("smpl_pt", 2),
    resv(7),
    rw_init("halt", 1, 1),
];

const TCR_LAYOUT: &[FieldDef] = &[rw("spi_tcnt", 16), resv(16)];

const CTAR_LAYOUT: &[FieldDef] = &[
    rw("dbr", 1),
    rw_init("fmsz", 4, 0xF),
    rw("cpol", 1),
    rw("cpha", 1),
    rw("lsbfe", 1),
    rw("pcssck", 2),
    rw("pasc", 2),
    rw("pdt", 2),
    rw("pbr", 2),
    rw("cssck", 4),
    rw("asc", 4),
    rw("dt", 4),
    rw("br", 4),
];

const SR_LAYOUT: &[FieldDef] = &[
    w1c("tcf", 1),
    ro("txrxs", 1),
    resv(1),
    w1c("eoqf", 1),
    w1c("tfuf", 1),
    resv(1),
    w1c_init("tfff", 1, 1),
    resv(5),
    w1c("rfof", 1),
    resv(1),
    w1c("rfdf", 1),
    resv(1),
    ro("txctr", 4),
    ro("txnxtptr", 4),
    ro("rxctr", 4),
    ro("popnxtptr", 4),
];

const RSER_LAYOUT: &[FieldDef] = &[
    rw("tcf", 1),
    resv(2),
    rw("eoqf", 1),
    rw("tfuf", 1),
    resv(1),
    rw("tfff", 1),
    rw("tfff_dirs", 1),
    resv(4),
    rw("rfof", 1),
    resv(1),
    rw("rfdf", 1),
    rw("rfdf_dirs", 1),
    resv(16),
];

const DSICR_LAYOUT: &[FieldDef] = &[
    rw("mtoe", 1),
    resv(1),
    rw("mtocnt", 6),
    resv(3),
    rw("tsbc", 1),
    rw("txss", 1),
    rw("tpol", 1),
    rw("trre", 1),
    rw("cid", 1),
    rw("dcont", 1),
    rw("dsictas", 3),
    resv(6),
    rw("dpcs", 6),
];

const DSICR1_LAYOUT: &[FieldDef] = &[
    resv(3),
    rw("tsbcnt", 5),
    resv(6),
    rw("dse", 2),
    resv(8),
    rw("dpcs1", 8),
];

const CONST_DATA_LAYOUT: &[FieldDef] = &[ro_init("data", 32, 0)];
const RW_DATA_LAYOUT: &[FieldDef] = &[rw("data", 32)];

/// Operating mode, derived from `MCR[MDIS]`, `MCR[DCONF]` and `MCR[MSTR]`
/// on every MCR write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspiMode {
    Disable,
    SpiController,
    SpiPeripheral,
    DsiController,
    DsiPeripheral,
    CsiController,
    CsiPeripheral,
}

/// External interrupt sources per SR event, "Table 9-8. Interrupt Request
/// Sources": the per-device base plus a fixed event offset. `TFUF` and
/// `RFOF` share a source.
const EVENT_SOURCE_OFFSETS: [(&str, u32); 6] = [
    ("tfuf", 0),
    ("rfof", 0),
    ("eoqf", 1),
    ("tfff", 2),
    ("tcf", 3),
    ("rfdf", 4),
];
const SOURCE_BASES: [u32; 4] = [275, 131, 136, 141];

/// Frame returned by an empty POPR read. These match what the target board
/// reads from the real buses; DSPI_D is the empirically-observed odd one.
const POPR_EMPTY: [u32; 4] = [0x0000_FFFF, 0x0000_FFFF, 0x0000_FFFF, 0x0000_87AD];

pub struct Dspi {
    name: &'static str,
    index: usize,

    mcr: Register,
    tcr: Register,
    ctar: [Register; CTAR_COUNT],
    sr: Register,
    rser: Register,
    dsicr: Register,
    sdr: Register,
    asdr: Register,
    compr: Register,
    ddr: Register,
    dsicr1: Register,

    mode: DspiMode,
    // Newest frame at index 0; TXNXTPTR (count - 1) indexes the oldest.
    // Popped slots keep their stale bytes, as the hardware FIFO does.
    tx_fifo: [u32; TX_FIFO_DEPTH],
    tx_count: usize,
    // Oldest frame at index 0; slot 4 is the shift register.
    rx_fifo: [u32; RX_FIFO_DEPTH],
    rx_count: usize,

    pub bus: SpiBus,
    intc: Rc<RefCell<Intc>>,
    io: Option<IoConnection>,
    popr_empty: u32,
}

impl Dspi {
    /// `index` selects the interrupt source base and the empty-POPR filler
    /// (0 = DSPI_A .. 3 = DSPI_D).
    pub fn new(name: &'static str, index: usize, intc: Rc<RefCell<Intc>>) -> Dspi {
        let mut dspi = Dspi {
            name,
            index,
            mcr: Register::new(MCR_LAYOUT),
            tcr: Register::new(TCR_LAYOUT),
            ctar: std::array::from_fn(|_| Register::new(CTAR_LAYOUT)),
            sr: Register::new(SR_LAYOUT),
            rser: Register::new(RSER_LAYOUT),
            dsicr: Register::new(DSICR_LAYOUT),
            sdr: Register::new(CONST_DATA_LAYOUT),
            asdr: Register::new(RW_DATA_LAYOUT),
            compr: Register::new(CONST_DATA_LAYOUT),
            ddr: Register::new(CONST_DATA_LAYOUT),
            dsicr1: Register::new(DSICR1_LAYOUT),
            mode: DspiMode::Disable,
            tx_fifo: [0; TX_FIFO_DEPTH],
            tx_count: 0,
            rx_fifo: [0; RX_FIFO_DEPTH],
            rx_count: 0,
            bus: SpiBus::new(name),
            intc,
            io: None,
            popr_empty: POPR_EMPTY[index],
        };
        dspi.update_mode();
        dspi
    }

    pub fn mode(&self) -> DspiMode {
        self.mode
    }

    pub fn sr(&self) -> &Register {
        &self.sr
    }

    pub fn tcr(&self) -> &Register {
        &self.tcr
    }

    /// Attach an external frame transport; inbound frames are merged at
    /// [`Dspi::poll_io`], transmitted frames are mirrored outbound.
    pub fn attach_io(&mut self, io: IoConnection) {
        self.io = Some(io);
    }

    /// Drain inbound frames from the I/O worker into the Rx path. Called by
    /// the machine between instructions.
    pub fn poll_io(&mut self) {
        let Some(io) = &self.io else { return };
        let frames: Vec<u32> = std::iter::from_fn(|| io.try_recv()).collect();
        for frame in frames {
            self.receive(frame);
        }
    }

    fn source_for(&self, field: &str) -> u32 {
        let (_, offset) = EVENT_SOURCE_OFFSETS
            .iter()
            .find(|(name, _)| *name == field)
            .expect("unknown DSPI event");
        SOURCE_BASES[self.index] + offset
    }

    /// Latch or clear an SR event bit; a rising edge posts the external
    /// source when the matching RSER bit is set.
    fn event(&mut self, field: &'static str, active: bool) {
        let idx = self.sr.field(field);
        let rising = active && self.sr.get(idx) == 0;
        self.sr.set(idx, active as u32);
        if rising && self.rser.get_by_name(field) != 0 {
            let source = self.source_for(field);
            self.intc
                .borrow_mut()
                .post(Exception::External { source });
        }
    }

    fn tx_capacity(&self) -> usize {
        if self.mcr.get_by_name("dis_txf") == 0 {
            TX_FIFO_DEPTH
        } else {
            1
        }
    }

    fn rx_capacity(&self) -> usize {
        if self.mcr.get_by_name("dis_rxf") == 0 {
            RX_FIFO_DEPTH
        } else {
            2
        }
    }

    fn tx_fifo_full(&self) -> bool {
        self.tx_count >= self.tx_capacity()
    }

    /// Decode and transmit one staged command word. Returns true when the
    /// frame carried EOQ and the drain must stop.
    fn transmit_frame(&mut self, frame: u32) -> bool {
        let ctas = ((frame & PUSHR_CTAS_MASK) >> PUSHR_CTAS_SHIFT) as usize;
        let eoq = frame & PUSHR_EOQ_MASK != 0;
        let ctcnt = frame & PUSHR_CTCNT_MASK != 0;
        let pcs = ((frame & PUSHR_PCS_MASK) >> PUSHR_PCS_SHIFT) as u8;
        let _cont = frame & PUSHR_CONT_MASK != 0; // advisory continuous CS

        // Frame width comes from the selected transfer-attribute register.
        let bits = self.ctar[ctas].get_by_name("fmsz") + 1;
        let value = frame & (((1u64 << bits) - 1) as u32);

        let count = if ctcnt {
            0
        } else {
            self.tcr.get_by_name("spi_tcnt")
        };

        let reply = self.bus.transmit(pcs, value);
        if let Some(io) = &self.io {
            io.send(value);
        }

        self.tcr.set_by_name("spi_tcnt", (count + 1) & MAX_TCNT);
        self.event("tcf", true);
        self.event("eoqf", eoq);

        if eoq {
            // End of queue: stop the state machine until software unhalts.
            self.sr.set_by_name("txrxs", 0);
            self.mcr.set_by_name("halt", 1);
        }
        if let Some(r) = reply {
            self.receive(r);
        }
        eoq
    }

    /// Stage a command word written through the PUSHR window.
    fn push_tx(&mut self, frame: u32) {
        if self.sr.get_by_name("txrxs") == 1 {
            // Running: the frame goes straight to the shifter and the FIFO
            // stays available.
            self.transmit_frame(frame);
            self.event("tfff", true);
            return;
        }
        let cap = self.tx_capacity();
        if self.tx_count < cap {
            self.tx_fifo.copy_within(0..TX_FIFO_DEPTH - 1, 1);
            self.tx_fifo[0] = frame;
            self.tx_count += 1;
            self.sr.set_by_name("txctr", self.tx_count as u32);
            self.sr
                .set_by_name("txnxtptr", self.tx_count.saturating_sub(1) as u32);
            self.event("tfff", self.tx_count != cap);
        }
        // A push to a full FIFO is dropped; the staged commands are kept.
    }

    fn pop_tx(&mut self) -> Option<u32> {
        if self.tx_count == 0 {
            return None;
        }
        let frame = self.tx_fifo[self.tx_count - 1];
        self.tx_count -= 1;
        self.sr.set_by_name("txctr", self.tx_count as u32);
        self.sr
            .set_by_name("txnxtptr", self.tx_count.saturating_sub(1) as u32);
        self.event("tfff", true);
        Some(frame)
    }

    /// Straight-line Tx drain: runs when TXRXS rises with frames staged,
    /// until the FIFO empties or an EOQ frame was sent.
    fn drain_tx(&mut self) {
        while let Some(frame) = self.pop_tx() {
            if self.transmit_frame(frame) {
                break;
            }
        }
    }

    /// Merge one received frame into the Rx FIFO.
    pub fn receive(&mut self, frame: u32) {
        if self.mode == DspiMode::Disable || self.sr.get_by_name("txrxs") == 0 {
            debug!(dspi = self.name, frame = format_args!("{frame:#x}"), "rx frame discarded");
            return;
        }
        self.push_rx(frame);
    }

    fn push_rx(&mut self, frame: u32) {
        let cap = self.rx_capacity();
        if self.rx_count < cap {
            self.rx_fifo[self.rx_count] = frame;
            self.rx_count += 1;
            // RXCTR counts the visible slots only, never the shift register.
            if self.rx_count < cap {
                self.sr.set_by_name("rxctr", self.rx_count as u32);
            }
            self.event("rfdf", true);
        } else {
            self.event("rfof", true);
            if self.mcr.get_by_name("rooe") == 1 {
                // Overrun-overwrite: the newest frame replaces the shift
                // register contents.
                self.rx_fifo[self.rx_count - 1] = frame;
                debug!(dspi = self.name, frame = format_args!("{frame:#x}"), "rx overflow, shift register overwritten");
            } else {
                debug!(dspi = self.name, frame = format_args!("{frame:#x}"), "rx overflow, frame dropped");
            }
        }
    }

    fn pop_rx(&mut self) -> u32 {
        if self.rx_count == 0 {
            return self.popr_empty;
        }
        let frame = self.rx_fifo[0];
        self.rx_fifo.copy_within(1..RX_FIFO_DEPTH, 0);
        self.rx_count -= 1;
        self.sr.set_by_name("rxctr", self.rx_count.min(4) as u32);
        self.event("rfdf", self.rx_count != 0);
        frame
    }

    /// Post-write hook for MCR: service the self-clearing FIFO-clear
    /// commands, then re-derive the mode and the TXRXS state.
    fn mcr_update(&mut self) {
        if self.mcr.get_by_name("clr_txf") == 1 {
            self.tx_count = 0;
            self.sr.set_by_name("txctr", 0);
            self.sr.set_by_name("txnxtptr", 0);
            self.mcr.set_by_name("clr_txf", 0);
            self.event("tfff", true);
        }
        if self.mcr.get_by_name("clr_rxf") == 1 {
            self.rx_count = 0;
            self.sr.set_by_name("rxctr", 0);
            self.sr.set_by_name("popnxtptr", 0);
            self.mcr.set_by_name("clr_rxf", 0);
        }
        self.update_mode();
    }

    fn update_mode(&mut self) {
        let mode = if self.mcr.get_by_name("mdis") == 1 {
            DspiMode::Disable
        } else {
            let controller = self.mcr.get_by_name("mstr") == 1;
            match self.mcr.get_by_name("dconf") {
                0b00 if controller => DspiMode::SpiController,
                0b00 => DspiMode::SpiPeripheral,
                0b01 if controller => DspiMode::DsiController,
                0b01 => DspiMode::DsiPeripheral,
                0b10 if controller => DspiMode::CsiController,
                0b10 => DspiMode::CsiPeripheral,
                _ => DspiMode::Disable,
            }
        };

        if self.mode != mode {
            self.mode = mode;
            debug!(dspi = self.name, ?mode, "mode change");
        }

        match self.mode {
            DspiMode::DsiController | DspiMode::DsiPeripheral => {
                error!(dspi = self.name, "DSI mode selected");
                panic!("{}: DSPI DSI mode is not implemented", self.name);
            }
            DspiMode::CsiController | DspiMode::CsiPeripheral => {
                error!(dspi = self.name, "CSI mode selected");
                panic!("{}: DSPI CSI mode is not implemented", self.name);
            }
            _ => {}
        }

        let was_running = self.sr.get_by_name("txrxs") == 1;
        let running = self.mode != DspiMode::Disable && self.mcr.get_by_name("halt") == 0;
        self.sr.set_by_name("txrxs", running as u32);
        if running && !was_running {
            trace!(dspi = self.name, staged = self.tx_count, "tx/rx enabled");
            if self.tx_count > 0 {
                self.drain_tx();
            }
        }
    }

    /// Post-write hook for SR: W1C-clearing TFFF while the Tx FIFO still
    /// has room immediately re-raises it.
    fn sr_update(&mut self) {
        if self.sr.get_by_name("tfff") == 0 && !self.tx_fifo_full() {
            self.event("tfff", true);
        }
    }

    fn fifo_word(&self, base: u32, offset: u32, fifo: &[u32]) -> u32 {
        let idx = ((offset - base) / 4) as usize;
        fifo.get(idx).copied().unwrap_or(0)
    }

    fn reg_at(&self, offset: u32) -> Option<&Register> {
        match offset {
            MCR_OFFSET => Some(&self.mcr),
            TCR_OFFSET => Some(&self.tcr),
            o if (CTAR_OFFSET..SR_OFFSET).contains(&o) => {
                Some(&self.ctar[((o - CTAR_OFFSET) / 4) as usize])
            }
            SR_OFFSET => Some(&self.sr),
            RSER_OFFSET => Some(&self.rser),
            DSICR_OFFSET => Some(&self.dsicr),
            SDR_OFFSET => Some(&self.sdr),
            ASDR_OFFSET => Some(&self.asdr),
            COMPR_OFFSET => Some(&self.compr),
            DDR_OFFSET => Some(&self.ddr),
            DSICR1_OFFSET => Some(&self.dsicr1),
            _ => None,
        }
    }
}

/// Big-endian sub-word slice of a 32-bit value.
fn slice_word(value: u32, byte_offset: usize, size: usize) -> u32 {
    let bytes = value.to_be_bytes();
    bytes[byte_offset..byte_offset + size]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

impl MmioHandler for Dspi {
    fn read(&mut self, ctx: &MmioCtx, offset: u32, size: usize) -> Result<u32, BusFault> {
        let word = offset & !3;
        let byte = (offset & 3) as usize;

        let value = match word {
            PUSHR_OFFSET => slice_word(self.tx_fifo[0], byte, size),
            POPR_OFFSET => {
                // Any-width POPR read pops; narrow reads take the low bytes.
                let frame = self.pop_rx();
                frame & (((1u64 << (8 * size)) - 1) as u32)
            }
            o if (TXFR_OFFSET..TXFR_OFFSET + 16).contains(&o) => {
                slice_word(self.fifo_word(TXFR_OFFSET, o, &self.tx_fifo), byte, size)
            }
            o if (RXFR_OFFSET..RXFR_OFFSET + 16).contains(&o) => {
                slice_word(self.fifo_word(RXFR_OFFSET, o, &self.rx_fifo[..4]), byte, size)
            }
            o => match self.reg_at(o) {
                Some(reg) => slice_word(reg.emit(), byte, size),
                None => {
                    return Err(BusFault::DataRead {
                        addr: ctx.addr,
                        pc: ctx.pc,
                    })
                }
            },
        };
        Ok(value)
    }

    fn write(&mut self, ctx: &MmioCtx, offset: u32, size: usize, value: u32) -> Result<(), BusFault> {
        let word = offset & !3;
        let byte = (offset & 3) as usize;
        trace!(dspi = self.name, offset = format_args!("{offset:#x}"), value = format_args!("{value:#x}"), "mmio write");

        if word == PUSHR_OFFSET {
            // Sub-word pushes land at their byte lanes, zero-padded.
            let frame = value << (8 * (4 - byte - size));
            self.push_tx(frame);
            return Ok(());
        }

        let Some(reg) = self.reg_at(word) else {
            return Err(BusFault::DataWrite {
                addr: ctx.addr,
                pc: ctx.pc,
                data: value,
            });
        };

        // Compose the incoming bytes with the current word so field kinds
        // keep their meaning for narrow writes, then parse.
        let mut bytes = reg.emit_bytes();
        for i in 0..size {
            bytes[byte + i] = (value >> (8 * (size - 1 - i))) as u8;
        }
        let incoming = u32::from_be_bytes(bytes);
        match word {
            MCR_OFFSET => {
                self.mcr.parse(incoming);
                self.mcr_update();
            }
            SR_OFFSET => {
                self.sr.parse(incoming);
                self.sr_update();
            }
            TCR_OFFSET => self.tcr.parse(incoming),
            o if (CTAR_OFFSET..SR_OFFSET).contains(&o) => {
                self.ctar[((o - CTAR_OFFSET) / 4) as usize].parse(incoming)
            }
            RSER_OFFSET => self.rser.parse(incoming),
            DSICR_OFFSET => self.dsicr.parse(incoming),
            ASDR_OFFSET => self.asdr.parse(incoming),
            SDR_OFFSET | COMPR_OFFSET | DDR_OFFSET => {} // read-only data
            DSICR1_OFFSET => self.dsicr1.parse(incoming),
            _ => unreachable!(),
        }
        Ok(())
    }
}

impl Peripheral for Dspi {
    fn name(&self) -> &'static str {
        self.name
    }

    fn reset(&mut self) {
        self.mcr.reset();
        self.tcr.reset();
        for ctar in &mut self.ctar {
            ctar.reset();
        }
        self.sr.reset();
        self.rser.reset();
        self.dsicr.reset();
        self.sdr.reset();
        self.asdr.reset();
        self.compr.reset();
        self.ddr.reset();
        self.dsicr1.reset();
        self.tx_fifo = [0; TX_FIFO_DEPTH];
        self.tx_count = 0;
        self.rx_fifo = [0; RX_FIFO_DEPTH];
        self.rx_count = 0;
        self.update_mode();
    }
}
