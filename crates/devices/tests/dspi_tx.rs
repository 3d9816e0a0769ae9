use std::cell::RefCell;
use std::rc::Rc;

use dyno_devices::dspi::{Dspi, DspiMode};
use dyno_devices::spi::SpiDevice;
use dyno_interrupts::{msr, Intc};
use memory::{Access, MemoryBus, Perms};

const DSPI_B_BASE: u32 = 0xFFF9_4000;

const MCR: u32 = DSPI_B_BASE + 0x00;
const TCR: u32 = DSPI_B_BASE + 0x08;
const CTAR0: u32 = DSPI_B_BASE + 0x0C;
const SR: u32 = DSPI_B_BASE + 0x2C;
const RSER: u32 = DSPI_B_BASE + 0x30;
const PUSHR: u32 = DSPI_B_BASE + 0x34;
const TXFR0: u32 = DSPI_B_BASE + 0x3C;

const MCR_MSTR: u32 = 0x8000_0000;
const MCR_CLR_TXF: u32 = 0x0000_0800;
const MCR_HALT: u32 = 0x0000_0001;

const SR_TCF: u32 = 0x8000_0000;
const SR_TXRXS: u32 = 0x4000_0000;
const SR_EOQF: u32 = 0x1000_0000;
const SR_TFFF: u32 = 0x0200_0000;

const PUSHR_EOQ: u32 = 0x0800_0000;
const PUSHR_CTCNT: u32 = 0x0400_0000;

const ALL_ENABLED: u32 = msr::EE | msr::CE | msr::ME;

/// DSPI_B external interrupt sources ("Table 9-8", base 131).
const SRC_EOQF: u32 = 131 + 1;
const SRC_TFFF: u32 = 131 + 2;
const SRC_TCF: u32 = 131 + 3;

fn setup() -> (MemoryBus, Rc<RefCell<Dspi>>, Rc<RefCell<Intc>>) {
    let intc = Rc::new(RefCell::new(Intc::new()));
    let dspi = Rc::new(RefCell::new(Dspi::new("DSPI_B", 1, intc.clone())));
    let mut bus = MemoryBus::new();
    bus.map_mmio("DSPI_B", DSPI_B_BASE, 0x4000, Perms::RW, true, dspi.clone());
    // Let every external priority through the CPR gate.
    for src in 131..=136 {
        intc.borrow_mut().set_source_priority(src, 1);
    }
    (bus, dspi, intc)
}

fn rd(bus: &MemoryBus, addr: u32) -> u32 {
    bus.read(addr, 4, Access::Supervisor).unwrap()
}

fn wr(bus: &mut MemoryBus, addr: u32, value: u32) {
    bus.write(addr, value, 4, Access::Supervisor).unwrap();
}

fn drain_sources(intc: &Rc<RefCell<Intc>>) -> Vec<u32> {
    let mut sources = Vec::new();
    loop {
        let mut i = intc.borrow_mut();
        let Some(exc) = i.next_pending(ALL_ENABLED) else {
            break;
        };
        i.acknowledge(&exc);
        i.end_of_interrupt();
        if let dyno_interrupts::Exception::External { source } = exc {
            sources.push(source);
        }
    }
    sources
}

struct Recorder {
    frames: Vec<u32>,
    reply: Option<u32>,
}

impl SpiDevice for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn exchange(&mut self, value: u32) -> Option<u32> {
        self.frames.push(value);
        self.reply
    }
}

fn recorder_on_cs0(dspi: &Rc<RefCell<Dspi>>) -> Rc<RefCell<Recorder>> {
    let rec = Rc::new(RefCell::new(Recorder {
        frames: Vec::new(),
        reply: None,
    }));
    dspi.borrow_mut().bus.register_device(0, rec.clone());
    rec
}

#[test]
fn register_defaults_match_the_silicon() {
    let (bus, dspi, _intc) = setup();

    assert_eq!(rd(&bus, MCR), 0x0000_0001);
    assert_eq!(rd(&bus, TCR), 0);
    for i in 0..8 {
        assert_eq!(rd(&bus, CTAR0 + 4 * i), 0x7800_0000);
    }
    assert_eq!(rd(&bus, SR), 0x0200_0000);
    assert_eq!(rd(&bus, RSER), 0);
    assert_eq!(dspi.borrow().mode(), DspiMode::SpiPeripheral);
}

#[test]
fn mode_machine_follows_mcr() {
    let (mut bus, dspi, _intc) = setup();

    wr(&mut bus, MCR, 0x0000_4000 | MCR_HALT);
    assert_eq!(dspi.borrow().mode(), DspiMode::Disable);

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    assert_eq!(dspi.borrow().mode(), DspiMode::SpiController);
    assert_eq!(rd(&bus, SR) & SR_TXRXS, 0);

    wr(&mut bus, MCR, MCR_MSTR);
    assert_eq!(dspi.borrow().mode(), DspiMode::SpiController);
    assert_ne!(rd(&bus, SR) & SR_TXRXS, 0);

    wr(&mut bus, MCR, MCR_HALT);
    assert_eq!(dspi.borrow().mode(), DspiMode::SpiPeripheral);
    assert_eq!(rd(&bus, SR) & SR_TXRXS, 0);
}

#[test]
#[should_panic(expected = "DSI mode is not implemented")]
fn dsi_mode_is_a_loud_gap() {
    let (mut bus, _dspi, _intc) = setup();
    wr(&mut bus, MCR, MCR_MSTR | 0x1000_0000 | MCR_HALT);
}

#[test]
#[should_panic(expected = "CSI mode is not implemented")]
fn csi_mode_is_a_loud_gap() {
    let (mut bus, _dspi, _intc) = setup();
    wr(&mut bus, MCR, 0x2000_0000 | MCR_HALT);
}

#[test]
fn queued_frames_drain_until_end_of_queue() {
    let (mut bus, dspi, _intc) = setup();
    let rec = recorder_on_cs0(&dspi);

    // Controller mode, halted, 16-bit frames on CTAR0.
    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    wr(&mut bus, CTAR0, 15 << 27);

    wr(&mut bus, PUSHR, 0x0000_0001);
    wr(&mut bus, PUSHR, PUSHR_EOQ | 0x0000_0002);
    wr(&mut bus, PUSHR, 0x0000_0003);
    assert_eq!(rd(&bus, SR) & 0xF000, 3 << 12, "TXCTR");

    // Unhalt: control returns only after the drain stopped at the EOQ frame.
    wr(&mut bus, MCR, MCR_MSTR);

    assert_eq!(rec.borrow().frames, vec![0x0001, 0x0002]);
    let sr = rd(&bus, SR);
    assert_ne!(sr & SR_EOQF, 0, "EOQF set");
    assert_ne!(sr & SR_TCF, 0, "TCF set");
    assert_eq!(sr & SR_TXRXS, 0, "TXRXS cleared by EOQ");
    assert_eq!(sr & 0xF000, 1 << 12, "one frame left staged");
    assert_eq!(rd(&bus, TCR), 2 << 16, "SPI_TCNT counted both frames");
    assert_eq!(rd(&bus, MCR) & MCR_HALT, MCR_HALT, "EOQ re-halts");
}

#[test]
fn drain_without_eoq_leaves_the_controller_running() {
    let (mut bus, dspi, _intc) = setup();
    let rec = recorder_on_cs0(&dspi);

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    wr(&mut bus, PUSHR, 0x0000_00AA);
    wr(&mut bus, PUSHR, 0x0000_00BB);
    wr(&mut bus, MCR, MCR_MSTR);

    assert_eq!(rec.borrow().frames, vec![0xAA, 0xBB]);
    let sr = rd(&bus, SR);
    assert_ne!(sr & SR_TXRXS, 0);
    assert_eq!(sr & SR_EOQF, 0);
    assert_eq!(sr & 0xF000, 0, "FIFO drained");
    assert_eq!(rd(&bus, MCR) & MCR_HALT, 0);

    // While running, pushes transmit synchronously.
    wr(&mut bus, PUSHR, 0x0000_00CC);
    assert_eq!(rec.borrow().frames, vec![0xAA, 0xBB, 0xCC]);
    assert_eq!(rd(&bus, TCR), 3 << 16);
}

#[test]
fn frames_are_masked_to_the_selected_ctar_width() {
    let (mut bus, dspi, _intc) = setup();
    let rec = recorder_on_cs0(&dspi);

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    // CTAR2: 8-bit frames.
    wr(&mut bus, CTAR0 + 2 * 4, 7 << 27);
    wr(&mut bus, PUSHR, (2 << 28) | 0x0000_A7B8);
    wr(&mut bus, MCR, MCR_MSTR);

    assert_eq!(rec.borrow().frames, vec![0xB8]);
}

#[test]
fn ctcnt_clears_the_transfer_count_before_the_frame() {
    let (mut bus, dspi, _intc) = setup();
    recorder_on_cs0(&dspi);

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    // Preload a transfer count near the wrap point.
    wr(&mut bus, TCR, 0xFFFF_0000);
    wr(&mut bus, PUSHR, 0x0000_0001);
    wr(&mut bus, PUSHR, 0x0000_0002);
    wr(&mut bus, MCR, MCR_MSTR);
    // 0xFFFF + 2 wraps modulo 2^16 to 1.
    assert_eq!(rd(&bus, TCR), 1 << 16);

    wr(&mut bus, PUSHR, PUSHR_CTCNT | 0x0000_0003);
    assert_eq!(rd(&bus, TCR), 1 << 16, "CTCNT restarted the count");
}

#[test]
fn pushr_reads_back_the_newest_frame_and_txfr_exposes_the_fifo() {
    let (mut bus, _dspi, _intc) = setup();

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    let frames = [0x1111_0001, 0x2222_0002, 0x3333_0003, 0x4444_0004];
    for f in frames {
        wr(&mut bus, PUSHR, f);
    }

    assert_eq!(rd(&bus, PUSHR), frames[3]);
    // TXFR0 holds the newest staged frame, TXFR3 the oldest.
    for (i, f) in frames.iter().rev().enumerate() {
        assert_eq!(rd(&bus, TXFR0 + 4 * i as u32), *f);
    }

    // A push to the full FIFO is dropped.
    wr(&mut bus, PUSHR, 0x5555_0005);
    assert_eq!(rd(&bus, PUSHR), frames[3]);
    assert_eq!(rd(&bus, SR) & 0xF000, 4 << 12);
}

#[test]
fn sub_word_pushes_land_right_aligned() {
    let (mut bus, dspi, _intc) = setup();
    let rec = recorder_on_cs0(&dspi);

    wr(&mut bus, MCR, MCR_MSTR);
    // 2-byte write at the data half of PUSHR.
    bus.write(PUSHR + 2, 0xBEEF, 2, Access::Supervisor).unwrap();
    assert_eq!(rec.borrow().frames, vec![0xBEEF]);
}

#[test]
fn tfff_w1c_rearms_while_the_fifo_has_room() {
    let (mut bus, _dspi, _intc) = setup();

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    // Clearing TFFF with an empty FIFO re-raises it immediately.
    wr(&mut bus, SR, SR_TFFF);
    assert_ne!(rd(&bus, SR) & SR_TFFF, 0);

    // Fill the FIFO; the fourth push drops TFFF for good.
    for i in 0..4 {
        wr(&mut bus, PUSHR, i);
    }
    wr(&mut bus, SR, SR_TFFF);
    assert_eq!(rd(&bus, SR) & SR_TFFF, 0);
}

#[test]
fn clr_txf_empties_the_fifo_and_rearms_tfff() {
    let (mut bus, _dspi, _intc) = setup();

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    for i in 0..4 {
        wr(&mut bus, PUSHR, i);
    }
    assert_eq!(rd(&bus, SR) & SR_TFFF, 0);

    wr(&mut bus, MCR, MCR_MSTR | MCR_CLR_TXF | MCR_HALT);
    let sr = rd(&bus, SR);
    assert_eq!(sr & 0xFF00, 0, "TXCTR and TXNXTPTR cleared");
    assert_ne!(sr & SR_TFFF, 0);
    // The command bit self-clears.
    assert_eq!(rd(&bus, MCR) & MCR_CLR_TXF, 0);
}

#[test]
fn unmasked_events_post_their_interrupt_sources_once_per_edge() {
    let (mut bus, dspi, intc) = setup();
    recorder_on_cs0(&dspi);

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    wr(&mut bus, RSER, 0x9A0A_0000); // tcf | eoqf | tfuf | tfff | rfof | rfdf
    assert_eq!(drain_sources(&intc), Vec::<u32>::new());

    // Stage three frames, the second carrying EOQ, then unhalt. TFFF was
    // left set from reset so no edge fires for it until it has dropped.
    wr(&mut bus, SR, SR_TFFF);
    assert_eq!(drain_sources(&intc), vec![SRC_TFFF], "W1C re-arm posts an edge");

    for i in 0..4u32 {
        let frame = if i == 1 { PUSHR_EOQ | 1 } else { i };
        wr(&mut bus, PUSHR, frame);
    }
    assert_eq!(drain_sources(&intc), Vec::<u32>::new(), "no edges while filling");

    wr(&mut bus, MCR, MCR_MSTR);
    // The drain pops frames (TFFF rises once) and transmits two of them
    // (TCF rises once, EOQF rises at the EOQ frame).
    assert_eq!(drain_sources(&intc), vec![SRC_TFFF, SRC_TCF, SRC_EOQF]);
}

#[test]
fn reset_restores_defaults_and_clears_the_fifos() {
    let (mut bus, dspi, _intc) = setup();

    wr(&mut bus, MCR, MCR_MSTR | MCR_HALT);
    wr(&mut bus, PUSHR, 0xAB);
    wr(&mut bus, TCR, 0x1234_0000);

    dyno_devices::Peripheral::reset(&mut *dspi.borrow_mut());
    assert_eq!(rd(&bus, MCR), 0x0000_0001);
    assert_eq!(rd(&bus, TCR), 0);
    assert_eq!(rd(&bus, SR), 0x0200_0000);
    assert_eq!(dspi.borrow().mode(), DspiMode::SpiPeripheral);
}
