use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::rc::Rc;

use dyno_devices::dspi::Dspi;
use dyno_devices::pbridge::Pbridge;
use dyno_devices::sim::Sim;
use dyno_devices::stub::StubWindow;
use dyno_devices::Peripheral;
use dyno_flash::{
    classify_firmware, FirmwareImage, FlashController, FlashDevice, FlashMmio,
    SHADOW_A_IMAGE_OFFSET, SHADOW_B_IMAGE_OFFSET,
};
use dyno_interrupts::{Exception, ExceptionClass, Intc, ResetSource};
use dyno_time::{Timebase, TimeSource, WallClock};
use memory::{Access, BusFault, MemoryBus, Perms};
use tracing::{error, info};

use crate::bam::scan_rchw;
use crate::config::MachineConfig;
use crate::core_state::CoreState;

/// PowerPC stack frames are 16 bytes; the reset stack pointer sits one
/// frame below the end of SRAM.
const STACK_FRAME_ALIGN: u32 = 16;

const FLASH_MAIN_BASE: u32 = 0x0000_0000;
const FLASH_SHADOW_B_BASE: u32 = 0x00EF_C000;
const FLASH_SHADOW_A_BASE: u32 = 0x00FF_C000;
const FLASH_CONFIG_A_BASE: u32 = 0xC3F8_8000;
const FLASH_CONFIG_B_BASE: u32 = 0xC3F8_C000;
const INTC_BASE: u32 = 0xFFF4_8000;
const DSPI_BASE: u32 = 0xFFF9_0000;
const DSPI_STRIDE: u32 = 0x4000;

/// Peripheral windows without a functional model; 16 KiB each.
const STUB_WINDOWS: &[(&str, u32)] = &[
    ("FMPLL", 0xC3F8_0000),
    ("EBI", 0xC3F8_4000),
    ("SIU", 0xC3F9_0000),
    ("eMIOS200", 0xC3FA_0000),
    ("eTPU2", 0xC3FC_0000),
    ("PIT", 0xC3FF_0000),
    ("XBAR", 0xFFF0_4000),
    ("SWT", 0xFFF3_8000),
    ("ECSM", 0xFFF4_0000),
    ("eDMA_A", 0xFFF4_4000),
    ("eDMA_B", 0xFFF5_4000),
    ("eQADC_A", 0xFFF8_0000),
    ("eQADC_B", 0xFFF8_4000),
    ("DECFILT", 0xFFF8_8000),
    ("eSCI_A", 0xFFFB_0000),
    ("eSCI_B", 0xFFFB_4000),
    ("eSCI_C", 0xFFFB_8000),
    ("FlexCAN_A", 0xFFFC_0000),
    ("FlexCAN_B", 0xFFFC_4000),
    ("FlexCAN_C", 0xFFFC_8000),
    ("FlexCAN_D", 0xFFFC_C000),
    ("SIM", 0xFFFE_C000),
    ("BAM", 0xFFFF_C000),
];

pub struct Machine {
    pub bus: MemoryBus,
    pub flash: Rc<RefCell<FlashController>>,
    pub intc: Rc<RefCell<Intc>>,
    pub dspi: [Rc<RefCell<Dspi>>; 4],
    pub timebase: Timebase,
    pub time: TimeSource,
    pub core: CoreState,

    cfg: MachineConfig,
    peripherals: Vec<Rc<RefCell<dyn Peripheral>>>,
    external_boot: bool,
}

impl Machine {
    /// Build the SoC, load firmware per the configuration, attach the
    /// backup, and cold-reset into the boot state.
    pub fn new(cfg: MachineConfig) -> io::Result<Machine> {
        Self::with_backup_dir(cfg, None)
    }

    /// As [`Machine::new`], resolving the backup prefix inside `project_dir`.
    pub fn with_backup_dir(cfg: MachineConfig, project_dir: Option<&Path>) -> io::Result<Machine> {
        let mut bus = MemoryBus::new();
        let flash = Rc::new(RefCell::new(FlashController::new()));
        let intc = Rc::new(RefCell::new(Intc::new()));

        for (name, base, device, perms) in [
            ("FLASH_MAIN", FLASH_MAIN_BASE, FlashDevice::Main, Perms::RWX),
            ("FLASH_B_SHADOW", FLASH_SHADOW_B_BASE, FlashDevice::ShadowB, Perms::RWX),
            ("FLASH_A_SHADOW", FLASH_SHADOW_A_BASE, FlashDevice::ShadowA, Perms::RWX),
            ("FLASH_A_CONFIG", FLASH_CONFIG_A_BASE, FlashDevice::ConfigA, Perms::RW),
            ("FLASH_B_CONFIG", FLASH_CONFIG_B_BASE, FlashDevice::ConfigB, Perms::RW),
        ] {
            bus.map_mmio(
                name,
                base,
                device.size(),
                perms,
                false,
                Rc::new(RefCell::new(FlashMmio::new(flash.clone(), device))),
            );
        }

        bus.map_ram("SRAM", cfg.sram.addr, cfg.sram.size, Perms::RWX);
        bus.map_mmio("INTC", INTC_BASE, 0x4000, Perms::RW, true, intc.clone());

        let mut peripherals: Vec<Rc<RefCell<dyn Peripheral>>> = Vec::new();

        let dspi: [Rc<RefCell<Dspi>>; 4] =
            ["DSPI_A", "DSPI_B", "DSPI_C", "DSPI_D"]
                .into_iter()
                .enumerate()
                .map(|(i, name)| {
                    let dev = Rc::new(RefCell::new(Dspi::new(name, i, intc.clone())));
                    bus.map_mmio(
                        name,
                        DSPI_BASE + DSPI_STRIDE * i as u32,
                        DSPI_STRIDE,
                        Perms::RW,
                        true,
                        dev.clone(),
                    );
                    peripherals.push(dev.clone() as Rc<RefCell<dyn Peripheral>>);
                    dev
                })
                .collect::<Vec<_>>()
                .try_into()
                .map_err(|_| ())
                .expect("four DSPI devices");

        let pbridge_a = Rc::new(RefCell::new(Pbridge::new("PBRIDGE_A", 1)));
        bus.map_mmio("PBRIDGE_A", 0xC3F0_0000, 0x4000, Perms::RW, true, pbridge_a.clone());
        peripherals.push(pbridge_a);
        let pbridge_b = Rc::new(RefCell::new(Pbridge::new("PBRIDGE_B", 3)));
        bus.map_mmio("PBRIDGE_B", 0xFFF0_0000, 0x4000, Perms::RW, true, pbridge_b.clone());
        peripherals.push(pbridge_b);

        for &(name, base) in STUB_WINDOWS {
            if name == "SIM" {
                let sim = Rc::new(RefCell::new(Sim::new()));
                bus.map_mmio(name, base, 0x4000, Perms::RW, true, sim.clone());
                peripherals.push(sim);
            } else {
                let stub = Rc::new(RefCell::new(StubWindow::new(name)));
                bus.map_mmio(name, base, 0x4000, Perms::RW, true, stub.clone());
                peripherals.push(stub);
            }
        }

        let mut machine = Machine {
            bus,
            flash,
            intc,
            dspi,
            timebase: Timebase::new(),
            time: TimeSource::new(std::sync::Arc::new(WallClock::new())),
            core: CoreState::default(),
            cfg,
            peripherals,
            external_boot: false,
        };

        machine.load_firmware()?;
        let backup = machine.cfg.backup.clone().map(|name| match project_dir {
            Some(dir) => dir.join(name),
            None => name,
        });
        machine
            .flash
            .borrow_mut()
            .load_complete(backup.as_deref())?;
        machine.cold_reset();
        Ok(machine)
    }

    fn load_firmware(&mut self) -> io::Result<()> {
        let Some(path) = self.cfg.firmware.clone() else {
            error!("no flash image configured, starting from erased flash");
            return Ok(());
        };
        let layout = match classify_firmware(&path) {
            Ok(layout) => layout,
            Err(_) => return Ok(()), // reported; fall back to erased flash
        };
        info!(path = %path.display(), ?layout, "loading firmware");
        let mut flash = self.flash.borrow_mut();
        flash.load_file(FlashDevice::Main, &path, 0)?;
        if layout == FirmwareImage::MainAndShadows {
            flash.load_file(FlashDevice::ShadowB, &path, SHADOW_B_IMAGE_OFFSET)?;
            flash.load_file(FlashDevice::ShadowA, &path, SHADOW_A_IMAGE_OFFSET)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &MachineConfig {
        &self.cfg
    }

    /// True when the RCHW scan found no boot descriptor and the part would
    /// fall into serial/external boot.
    pub fn external_boot(&self) -> bool {
        self.external_boot
    }

    fn reset_common(&mut self) {
        self.flash.borrow_mut().reset();
        self.intc.borrow_mut().reset();
        for p in &self.peripherals {
            p.borrow_mut().reset();
        }
        self.timebase.reset();

        self.core = CoreState::default();
        // The boot-assist scan establishes the entry point; a registered
        // loader entry point overrides it.
        match scan_rchw(&mut self.flash.borrow_mut()) {
            Some(pc) => {
                self.core.pc = pc;
                self.external_boot = false;
            }
            None => {
                info!("no RCHW found, external boot");
                self.external_boot = true;
            }
        }
        if let Some(entry) = self.cfg.entry_override {
            info!(
                from = format_args!("{:#010x}", self.core.pc),
                to = format_args!("{entry:#010x}"),
                "overriding entry point"
            );
            self.core.pc = entry;
            self.external_boot = false;
        }
        self.core.r1 = self.cfg.sram.addr + self.cfg.sram.size - STACK_FRAME_ALIGN;
    }

    /// Power-on reset: all of SRAM is cleared.
    pub fn cold_reset(&mut self) {
        info!("cold reset");
        self.bus
            .fill_physical(self.cfg.sram.addr, self.cfg.sram.size as usize, 0);
        self.reset_common();
    }

    /// Warm reset: the standby region of SRAM survives, the rest clears.
    pub fn warm_reset(&mut self) {
        info!("warm reset");
        let standby = self.cfg.sram.standby_size.min(self.cfg.sram.size);
        self.bus.fill_physical(
            self.cfg.sram.addr + standby,
            (self.cfg.sram.size - standby) as usize,
            0,
        );
        self.reset_common();
    }

    /// Guest reset request (e.g. watchdog): queued like any exception and
    /// consumed at the next boundary poll.
    pub fn request_reset(&mut self, source: ResetSource) {
        self.intc.borrow_mut().post(Exception::Reset(source));
    }

    // ----- instruction-boundary services ---------------------------------

    /// Merge external I/O frames; called after each instruction retires,
    /// before the next fetch.
    pub fn poll_io(&mut self) {
        for dspi in &self.dspi {
            dspi.borrow_mut().poll_io();
        }
    }

    /// The exception that would vector now, if any.
    pub fn pending_exception(&self) -> Option<Exception> {
        self.intc.borrow().next_pending(self.core.msr)
    }

    /// Vector the next eligible exception: retire it from the pending set,
    /// save PC/MSR into the class pair, and report it to the executor,
    /// which jumps to the class handler. Reset requests short-circuit into
    /// a warm reset.
    pub fn vector_next(&mut self) -> Option<Exception> {
        let exc = self.pending_exception()?;
        self.intc.borrow_mut().acknowledge(&exc);
        if let Exception::Reset(source) = exc {
            info!(?source, "reset exception vectored");
            self.intc.borrow_mut().rfi(ExceptionClass::Reset);
            self.warm_reset();
            return Some(exc);
        }
        self.core.enter_exception(exc.class());
        Some(exc)
    }

    /// Return-from-interrupt for `class`; restores the saved pair.
    pub fn rfi(&mut self, class: ExceptionClass) {
        self.intc.borrow_mut().rfi(class);
        self.core.leave_exception(class);
    }

    // ----- loader/debugger access ----------------------------------------

    /// Supervisor-privileged word read used by loaders and tests.
    pub fn read_word(&self, addr: u32) -> Result<u32, BusFault> {
        let _scope = self.bus.supervisor_scope();
        self.bus.read(addr, 4, Access::User)
    }

    /// Supervisor-privileged word write used by loaders and tests.
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<(), BusFault> {
        let _scope = self.bus.supervisor_scope();
        self.bus.write(addr, value, 4, Access::User)
    }
}
