//! Flash controller: two interleaved arrays, shadow blocks, the
//! program/erase state machine, and host-file-backed persistence.
//!
//! The controller owns five MMIO windows: the 4 MiB main array, the two
//! 16 KiB shadow blocks, and one configuration register window per array.
//! Programming follows the real part's interlock protocol: software arms
//! `MCR[PGM]` or `MCR[ERS]`, writes the target flash range (the first write
//! selects the block; program writes accumulate into a staged buffer), and
//! commits with `MCR[EHV]`. Committed bytes are mirrored into a backup file
//! keyed by the MD5 of the initially-loaded image, so flash contents survive
//! across runs.

mod array;
mod blocks;
mod image;
mod shadow;

pub use array::{FlashArray, Staged, HLR_UNLOCK, LMLR_UNLOCK, SLMLR_UNLOCK};
pub use blocks::{array_blocks, block_extent, resolve_main, ArrayId, BlockKind, FlashBlock};
pub use image::{
    classify_firmware, FirmwareImage, ImageError, SHADOW_A_IMAGE_OFFSET, SHADOW_B_IMAGE_OFFSET,
};
pub use shadow::ShadowParam;

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use memory::{be_bytes, be_value, BusFault, MmioCtx, MmioHandler};
use tracing::{debug, error, info};

/// Main flash array size.
pub const MAIN_SIZE: usize = 0x0040_0000;
/// Shadow block size (per array).
pub const SHADOW_SIZE: usize = 0x0000_4000;
/// Size of a full firmware image and of the backup file:
/// main ∥ shadow B ∥ shadow A.
pub const FULL_IMAGE_SIZE: usize = MAIN_SIZE + 2 * SHADOW_SIZE;
/// Size of each MMIO config window.
pub const CONFIG_WINDOW_SIZE: u32 = 0x4000;

/// The five MMIO windows the controller serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashDevice {
    Main,
    ShadowA,
    ShadowB,
    ConfigA,
    ConfigB,
}

impl FlashDevice {
    pub fn size(&self) -> u32 {
        match self {
            FlashDevice::Main => MAIN_SIZE as u32,
            _ => CONFIG_WINDOW_SIZE,
        }
    }
}

// Config window register offsets.
const MCR_OFFSET: u32 = 0x0000;
const LMLR_OFFSET: u32 = 0x0004;
const HLR_OFFSET: u32 = 0x0008;
const SLMLR_OFFSET: u32 = 0x000C;
const LMSR_OFFSET: u32 = 0x0010;
const HSR_OFFSET: u32 = 0x0014;
const AR_OFFSET: u32 = 0x0018;
const BIUCR_OFFSET: u32 = 0x001C;
const BIUAPR_OFFSET: u32 = 0x0020;
const BIUCR2_OFFSET: u32 = 0x0024;
const UT0_OFFSET: u32 = 0x003C;
const UT1_OFFSET: u32 = 0x0040;
const UT2_OFFSET: u32 = 0x0044;

pub struct FlashController {
    /// Main array contents; `None` until loaded or defaulted, which the
    /// backup logic uses to tell "no firmware" from "erased firmware".
    main: Option<Vec<u8>>,
    pub a: FlashArray,
    pub b: FlashArray,
    backup: Option<File>,
}

impl Default for FlashController {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashController {
    pub fn new() -> FlashController {
        FlashController {
            main: None,
            a: FlashArray::new(ArrayId::A),
            b: FlashArray::new(ArrayId::B),
            backup: None,
        }
    }

    fn array(&self, which: ArrayId) -> &FlashArray {
        match which {
            ArrayId::A => &self.a,
            ArrayId::B => &self.b,
        }
    }

    fn array_mut(&mut self, which: ArrayId) -> &mut FlashArray {
        match which {
            ArrayId::A => &mut self.a,
            ArrayId::B => &mut self.b,
        }
    }

    fn main_bytes(&mut self) -> &mut Vec<u8> {
        self.main.get_or_insert_with(|| vec![0xFF; MAIN_SIZE])
    }

    /// Reset both arrays' configuration registers from shadow flash.
    pub fn reset(&mut self) {
        self.a.reset();
        self.b.reset();
    }

    // ----- loading and persistence ---------------------------------------

    /// Load a device image from raw bytes, placed at `dest_offset` and
    /// padded with erased flash.
    pub fn load_bytes(&mut self, device: FlashDevice, data: &[u8], dest_offset: usize) {
        let size = device.size() as usize;
        let filled = image::image_from_bytes(data, dest_offset, size);
        match device {
            FlashDevice::Main => self.main = Some(filled),
            FlashDevice::ShadowA => self.a.shadow = Some(filled),
            FlashDevice::ShadowB => self.b.shadow = Some(filled),
            _ => panic!("cannot load {device:?} from bytes"),
        }
        self.save_device(device);
    }

    /// Load a device image from `path`, reading `device.size()` bytes
    /// starting at `src_offset` (shadow regions live inside full images).
    pub fn load_file(
        &mut self,
        device: FlashDevice,
        path: &Path,
        src_offset: u64,
    ) -> std::io::Result<()> {
        debug!(?device, path = %path.display(), src_offset, "loading flash image");
        let data = image::image_from_file(path, src_offset, device.size() as usize)?;
        match device {
            FlashDevice::Main => self.main = Some(data),
            FlashDevice::ShadowA => self.a.shadow = Some(data),
            FlashDevice::ShadowB => self.b.shadow = Some(data),
            _ => panic!("cannot load {device:?} from a file"),
        }
        self.save_device(device);
        Ok(())
    }

    /// MD5 over main ∥ shadow B ∥ shadow A, the key that ties a backup file
    /// to the firmware it was created from.
    pub fn content_hash(&self) -> String {
        let mut ctx = md5::Context::new();
        if let Some(main) = &self.main {
            ctx.consume(main);
        }
        if let Some(shadow) = &self.b.shadow {
            ctx.consume(shadow);
        }
        if let Some(shadow) = &self.a.shadow {
            ctx.consume(shadow);
        }
        format!("{:x}", ctx.compute())
    }

    /// Remove any backup files derived from `prefix` (the `--reset-backup`
    /// path). The hash suffix is unknown here, so every `<prefix>.*`
    /// sibling goes.
    pub fn delete_backup(prefix: &Path) -> std::io::Result<()> {
        let Some(parent) = prefix.parent() else {
            return Ok(());
        };
        let Some(stem) = prefix.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        if !parent.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(stem) {
                    info!(file = %entry.path().display(), "deleting flash backup");
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Signal that all initial flash images are loaded.
    ///
    /// Defaults any missing shadow, then either restores state from an
    /// existing matching backup file (`<backup>.<md5-hex>`, opened `r+` so
    /// it is never truncated) or creates and seeds a new one from the
    /// loaded image. Run without a backup path, flash writes stay
    /// RAM-only.
    pub fn load_complete(&mut self, backup: Option<&Path>) -> std::io::Result<()> {
        if self.b.shadow.is_none() {
            debug!("generating default shadow B");
            self.b.load_default_shadow();
        }
        if self.a.shadow.is_none() {
            debug!("generating default shadow A");
            self.a.load_default_shadow();
        }

        let mut restored = false;
        if self.main.is_some() {
            if let Some(prefix) = backup {
                let path = prefix.with_file_name(format!(
                    "{}.{}",
                    prefix.file_name().unwrap_or_default().to_string_lossy(),
                    self.content_hash()
                ));
                if path.exists() {
                    debug!(path = %path.display(), "opening flash backup");
                    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
                    let mut contents = Vec::with_capacity(FULL_IMAGE_SIZE);
                    file.read_to_end(&mut contents)?;
                    if contents.len() == FULL_IMAGE_SIZE {
                        self.main = Some(contents[..MAIN_SIZE].to_vec());
                        self.b.shadow = Some(contents[MAIN_SIZE..MAIN_SIZE + SHADOW_SIZE].to_vec());
                        self.a.shadow = Some(contents[MAIN_SIZE + SHADOW_SIZE..].to_vec());
                        restored = true;
                        info!(path = %path.display(), "flash restored from backup");
                    } else {
                        error!(
                            path = %path.display(),
                            size = contents.len(),
                            "backup file has the wrong size, reseeding"
                        );
                    }
                    self.backup = Some(file);
                } else {
                    self.backup = Some(
                        OpenOptions::new()
                            .read(true)
                            .write(true)
                            .create(true)
                            .truncate(true)
                            .open(&path)?,
                    );
                }
            }
        } else {
            debug!("generating default (erased) main flash");
            self.main = Some(vec![0xFF; MAIN_SIZE]);
        }

        if !restored {
            self.save_device(FlashDevice::Main);
            self.save_device(FlashDevice::ShadowB);
            self.save_device(FlashDevice::ShadowA);
        }
        Ok(())
    }

    fn save_device(&mut self, device: FlashDevice) {
        self.save(device, 0, device.size());
    }

    /// Commit `[start, start + size)` of `device` into the backup file in
    /// place, with an explicit flush so a crash cannot lose an acknowledged
    /// program or erase.
    fn save(&mut self, device: FlashDevice, start: u32, size: u32) {
        let data = match device {
            FlashDevice::Main => self.main.as_deref(),
            FlashDevice::ShadowB => self.b.shadow.as_deref(),
            FlashDevice::ShadowA => self.a.shadow.as_deref(),
            _ => panic!("cannot back up {device:?}"),
        };
        let (Some(backup), Some(data)) = (&mut self.backup, data) else {
            return;
        };
        let file_offset = match device {
            FlashDevice::Main => u64::from(start),
            FlashDevice::ShadowB => SHADOW_B_IMAGE_OFFSET + u64::from(start),
            FlashDevice::ShadowA => SHADOW_A_IMAGE_OFFSET + u64::from(start),
            _ => unreachable!(),
        };
        debug!(
            ?device,
            start = format_args!("{start:#x}"),
            size = format_args!("{size:#x}"),
            "saving flash range"
        );
        let range = &data[start as usize..(start + size) as usize];
        // Persistence failures are emulator-environment problems, not guest
        // behavior; surface them loudly and keep running.
        let result = backup
            .seek(SeekFrom::Start(file_offset))
            .and_then(|_| backup.write_all(range))
            .and_then(|_| backup.flush());
        if let Err(err) = result {
            error!(%err, "flash backup write failed");
        }
    }

    /// Typed accessor other peripherals use for shadow-A boot parameters.
    pub fn read_shadow_param(&self, param: ShadowParam) -> u64 {
        let (offset, size) = param.extent();
        let shadow = self
            .a
            .shadow
            .as_ref()
            .expect("shadow A initialized before parameter reads");
        shadow[offset..offset + size]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    /// Raw main-array bytes (boot scan, loaders). Materializes erased flash
    /// if nothing has been loaded.
    pub fn main_slice(&mut self, offset: usize, len: usize) -> &[u8] {
        &self.main_bytes()[offset..offset + len]
    }

    /// Raw main-array update, bypassing the program/erase machine (loader
    /// overlays).
    pub fn write_main_raw(&mut self, offset: usize, bytes: &[u8]) {
        let main = self.main_bytes();
        main[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    // ----- program / erase ------------------------------------------------

    /// `MCR[EHV]` hook: run the armed operation across the staged state.
    fn commit(&mut self, which: ArrayId) {
        let array = self.array_mut(which);
        let pgm = array.mcr.get_by_name("pgm") == 1;
        let ers = array.mcr.get_by_name("ers") == 1;

        array.mcr.set_by_name("done", 0);
        array.mcr.set_by_name("peg", 0);

        if pgm {
            self.commit_program(which);
        } else if ers {
            self.commit_erase(which);
        }

        let array = self.array_mut(which);
        array.mcr.set_by_name("peas", 0);
        array.mcr.set_by_name("pgm", 0);
        array.mcr.set_by_name("ers", 0);
        array.mcr.set_by_name("done", 1);
        array.mcr.set_by_name("peg", 1);
        array.mcr.set_by_name("ehv", 0);
    }

    fn commit_program(&mut self, which: ArrayId) {
        // No interlock write, no operation.
        let Some(staged) = self.array_mut(which).staged.take() else {
            return;
        };
        let Staged {
            block,
            data: Some(data),
        } = staged
        else {
            return;
        };
        let extent = block_extent(which, block).expect("staged block belongs to array");

        if !self.array(which).block_writable(block) {
            error!(
                array = which.name(),
                block = %block.name(),
                "flash program failed, block locked"
            );
            return;
        }

        match block.kind {
            BlockKind::High => {
                self.write_interleaved(which, extent.offset, &data);
                self.save(FlashDevice::Main, extent.offset, extent.size * 2);
            }
            _ => {
                let start = extent.offset as usize;
                let len = extent.size as usize;
                match extent.device {
                    FlashDevice::Main => {
                        self.main_bytes()[start..start + len].copy_from_slice(&data)
                    }
                    FlashDevice::ShadowA => self.a.shadow.as_mut().expect("shadow A initialized")
                        [start..start + len]
                        .copy_from_slice(&data),
                    FlashDevice::ShadowB => self.b.shadow.as_mut().expect("shadow B initialized")
                        [start..start + len]
                        .copy_from_slice(&data),
                    _ => unreachable!(),
                }
                self.save(extent.device, extent.offset, extent.size);
            }
        }
    }

    fn commit_erase(&mut self, which: ArrayId) {
        // Erase also requires the interlock write; the staged payload stays
        // empty and the selection registers pick the victims.
        if self.array_mut(which).staged.take().is_none() {
            return;
        }

        for block in self.array(which).selected_blocks() {
            let extent = block_extent(which, block).expect("selected block belongs to array");
            if !self.array(which).block_writable(block) {
                error!(
                    array = which.name(),
                    block = %block.name(),
                    "flash erase failed, block locked"
                );
                continue;
            }
            match block.kind {
                BlockKind::High => {
                    let erased = vec![0xFF; extent.size as usize];
                    self.write_interleaved(which, extent.offset, &erased);
                    self.save(FlashDevice::Main, extent.offset, extent.size * 2);
                }
                _ => {
                    let start = extent.offset as usize;
                    let len = extent.size as usize;
                    match extent.device {
                        FlashDevice::Main => self.main_bytes()[start..start + len].fill(0xFF),
                        FlashDevice::ShadowA => {
                            self.a.shadow.as_mut().expect("shadow A initialized")
                                [start..start + len]
                                .fill(0xFF)
                        }
                        FlashDevice::ShadowB => {
                            self.b.shadow.as_mut().expect("shadow B initialized")
                                [start..start + len]
                                .fill(0xFF)
                        }
                        _ => unreachable!(),
                    }
                    self.save(extent.device, extent.offset, extent.size);
                }
            }
        }
    }

    /// Scatter an array's 256 KiB high-block half into the shared region:
    /// array A owns bytes 0..16 of each 32-byte group, array B bytes 16..32.
    fn write_interleaved(&mut self, which: ArrayId, region_offset: u32, data: &[u8]) {
        let base = region_offset + if which == ArrayId::B { 0x10 } else { 0 };
        let main = self.main_bytes();
        for (group, chunk) in data.chunks(16).enumerate() {
            let start = base as usize + group * 32;
            main[start..start + chunk.len()].copy_from_slice(chunk);
        }
    }

    // ----- MMIO dispatch --------------------------------------------------

    fn mmio_read(
        &mut self,
        device: FlashDevice,
        ctx: &MmioCtx,
        offset: u32,
        size: usize,
    ) -> Result<u32, BusFault> {
        match device {
            FlashDevice::Main => {
                let start = offset as usize;
                Ok(be_value(&self.main_bytes()[start..start + size]))
            }
            FlashDevice::ShadowA | FlashDevice::ShadowB => {
                let array = match device {
                    FlashDevice::ShadowA => &mut self.a,
                    _ => &mut self.b,
                };
                let shadow = array.shadow.get_or_insert_with(|| vec![0xFF; SHADOW_SIZE]);
                let start = offset as usize;
                Ok(be_value(&shadow[start..start + size]))
            }
            FlashDevice::ConfigA => Self::config_read(&self.a, ctx, offset, size),
            FlashDevice::ConfigB => Self::config_read(&self.b, ctx, offset, size),
        }
    }

    fn mmio_write(
        &mut self,
        device: FlashDevice,
        ctx: &MmioCtx,
        offset: u32,
        size: usize,
        value: u32,
    ) -> Result<(), BusFault> {
        match device {
            FlashDevice::Main => {
                let (which, block, in_array) = resolve_main(offset);
                let bytes = be_bytes(value, size);
                debug!(
                    array = which.name(),
                    block = %block.name(),
                    offset = format_args!("{offset:#x}"),
                    "flash write"
                );
                self.array_mut(which)
                    .stage_write(block, in_array, &bytes[..size]);
                Ok(())
            }
            FlashDevice::ShadowA => {
                let bytes = be_bytes(value, size);
                self.a.stage_shadow_write(offset, &bytes[..size]);
                Ok(())
            }
            FlashDevice::ShadowB => {
                let bytes = be_bytes(value, size);
                self.b.stage_shadow_write(offset, &bytes[..size]);
                Ok(())
            }
            FlashDevice::ConfigA => self.config_write(ArrayId::A, ctx, offset, size, value),
            FlashDevice::ConfigB => self.config_write(ArrayId::B, ctx, offset, size, value),
        }
    }

    fn config_read(
        array: &FlashArray,
        ctx: &MmioCtx,
        offset: u32,
        size: usize,
    ) -> Result<u32, BusFault> {
        let word = offset & !3;
        let reg = match word {
            MCR_OFFSET => &array.mcr,
            LMLR_OFFSET => &array.lmlr,
            HLR_OFFSET => &array.hlr,
            SLMLR_OFFSET => &array.slmlr,
            LMSR_OFFSET => &array.lmsr,
            HSR_OFFSET => &array.hsr,
            AR_OFFSET => &array.ar,
            BIUCR_OFFSET => &array.biucr,
            BIUAPR_OFFSET => &array.biuapr,
            BIUCR2_OFFSET => &array.biucr2,
            UT0_OFFSET => &array.ut0,
            UT1_OFFSET => &array.ut1,
            UT2_OFFSET => &array.ut2,
            // Reserved offsets bus-error on the real part.
            _ => {
                return Err(BusFault::DataRead {
                    addr: ctx.addr,
                    pc: ctx.pc,
                })
            }
        };
        let bytes = reg.emit_bytes();
        let start = (offset & 3) as usize;
        Ok(bytes[start..start + size]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
    }

    fn config_write(
        &mut self,
        which: ArrayId,
        ctx: &MmioCtx,
        offset: u32,
        size: usize,
        value: u32,
    ) -> Result<(), BusFault> {
        let word = offset & !3;
        let array = self.array_mut(which);

        // Compose narrow writes with the current word.
        let compose = |reg: &dyno_regs::Register| {
            let mut bytes = reg.emit_bytes();
            let start = (offset & 3) as usize;
            for i in 0..size {
                bytes[start + i] = (value >> (8 * (size - 1 - i))) as u8;
            }
            u32::from_be_bytes(bytes)
        };

        match word {
            MCR_OFFSET => {
                let incoming = compose(&array.mcr);
                array.mcr.parse(incoming);
                if array.mcr.get_by_name("ehv") == 1 {
                    self.commit(which);
                }
            }
            LMLR_OFFSET => {
                let incoming = compose(&array.lmlr);
                array.lmlr_write(incoming);
            }
            HLR_OFFSET => {
                let incoming = compose(&array.hlr);
                array.hlr_write(incoming);
            }
            SLMLR_OFFSET => {
                let incoming = compose(&array.slmlr);
                array.slmlr_write(incoming);
            }
            LMSR_OFFSET => {
                let incoming = compose(&array.lmsr);
                array.lmsr.parse(incoming);
            }
            HSR_OFFSET => {
                let incoming = compose(&array.hsr);
                array.hsr.parse(incoming);
            }
            // Writes to the address register are accepted and discarded.
            AR_OFFSET => {}
            BIUCR_OFFSET => {
                let incoming = compose(&array.biucr);
                array.biucr.parse(incoming);
            }
            BIUAPR_OFFSET => {
                let incoming = compose(&array.biuapr);
                array.biuapr.parse(incoming);
            }
            BIUCR2_OFFSET => {
                let incoming = compose(&array.biucr2);
                array.biucr2.parse(incoming);
            }
            UT0_OFFSET => {
                let incoming = compose(&array.ut0);
                array.ut0.parse(incoming);
            }
            UT1_OFFSET => {
                let incoming = compose(&array.ut1);
                array.ut1.parse(incoming);
            }
            UT2_OFFSET => {
                let incoming = compose(&array.ut2);
                array.ut2.parse(incoming);
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

/// MMIO adapter binding one controller window to the bus.
pub struct FlashMmio {
    ctl: Rc<RefCell<FlashController>>,
    device: FlashDevice,
}

impl FlashMmio {
    pub fn new(ctl: Rc<RefCell<FlashController>>, device: FlashDevice) -> FlashMmio {
        FlashMmio { ctl, device }
    }
}

impl MmioHandler for FlashMmio {
    fn read(&mut self, ctx: &MmioCtx, offset: u32, size: usize) -> Result<u32, BusFault> {
        self.ctl
            .borrow_mut()
            .mmio_read(self.device, ctx, offset, size)
    }

    fn write(
        &mut self,
        ctx: &MmioCtx,
        offset: u32,
        size: usize,
        value: u32,
    ) -> Result<(), BusFault> {
        self.ctl
            .borrow_mut()
            .mmio_write(self.device, ctx, offset, size, value)
    }
}
