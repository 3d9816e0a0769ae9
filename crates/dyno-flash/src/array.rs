//! Per-array configuration registers, lock enforcement, and write staging.

use dyno_regs::{resv, ro, ro_init, rw, rw_init, w1c, FieldDef, Register};
use tracing::debug;

use crate::blocks::{array_blocks, block_extent, ArrayId, BlockKind, FlashBlock, SHADOW_BLOCK};
use crate::shadow;
use crate::SHADOW_SIZE;

const MCR_LAYOUT: &[FieldDef] = &[
    resv(5),
    ro_init("size", 3, 0b101),
    resv(1),
    ro("las", 3),
    resv(3),
    ro("mas", 1),
    w1c("eer", 1),
    w1c("rwe", 1),
    w1c("sbc", 1),
    resv(1),
    ro("peas", 1),
    ro_init("done", 1, 1),
    ro_init("peg", 1, 1),
    resv(4),
    rw("pgm", 1),
    rw("psus", 1),
    rw("ers", 1),
    rw("esus", 1),
    rw("ehv", 1),
];

const LMLR_LAYOUT: &[FieldDef] = &[
    ro("lme", 1),
    resv(10),
    rw("slock", 1),
    resv(2),
    rw("mlock", 2),
    resv(6),
    rw("llock", 10),
];

const HLR_LAYOUT: &[FieldDef] = &[ro("hbe", 1), resv(21), rw("hlock", 10)];

const SLMLR_LAYOUT: &[FieldDef] = &[
    ro("sle", 1),
    resv(10),
    rw("sslock", 1),
    resv(2),
    rw("smlock", 2),
    resv(6),
    rw("sllock", 10),
];

const LMSR_LAYOUT: &[FieldDef] = &[resv(14), rw("msel", 2), resv(6), rw("lsel", 10)];

const HSR_LAYOUT: &[FieldDef] = &[resv(26), rw("hsel", 6)];

const AR_LAYOUT: &[FieldDef] = &[ro("sad", 1), resv(13), rw("addr", 15), resv(3)];

const BIUCR_LAYOUT: &[FieldDef] = &[
    resv(7),
    rw("m8pfe", 1),
    resv(1),
    rw("m6pfe", 1),
    rw("m5pfe", 1),
    rw("m4pfe", 1),
    resv(3),
    rw("m0pfe", 1),
    rw_init("apc", 3, 0b111),
    rw_init("wwsc", 2, 0b11),
    rw_init("rwsc", 3, 0b111),
    resv(1),
    rw("dpfen", 1),
    resv(1),
    rw("ifpfen", 1),
    resv(1),
    rw("pflim", 2),
    rw("bfen", 1),
];

// The pad bits read as ones after a shadow erase, so they are plain RW
// fields with all-ones resets rather than reserved constants.
const BIUAPR_LAYOUT: &[FieldDef] = &[
    rw_init("pad0", 14, 0x3FFF),
    rw_init("m8ap", 2, 0b11),
    rw_init("pad1", 2, 0b11),
    rw_init("m6ap", 2, 0b11),
    rw_init("m5ap", 2, 0b11),
    rw_init("m4ap", 2, 0b11),
    rw_init("pad2", 6, 0x3F),
    rw_init("m0ap", 2, 0b11),
];

const BIUCR2_LAYOUT: &[FieldDef] = &[rw("lbcfg", 2), rw("pad0", 30)];

const UT0_LAYOUT: &[FieldDef] = &[
    rw("ute", 1),
    rw("scbe", 1),
    resv(6),
    rw("dsi", 8),
    resv(8),
    rw_init("ea", 1, 1),
    resv(1),
    rw("mre", 1),
    rw("mrv", 1),
    rw("eie", 1),
    rw("ais", 1),
    rw("aie", 1),
    ro_init("aid", 1, 1),
];

const UT_DATA_LAYOUT: &[FieldDef] = &[rw("dai", 32)];

/// Magic unlock words; the lock registers stay write-protected until their
/// enable bit is set by the matching word.
pub const LMLR_UNLOCK: u32 = 0xA1A1_1111;
pub const HLR_UNLOCK: u32 = 0xB2B2_2222;
pub const SLMLR_UNLOCK: u32 = 0xC3C3_3333;

/// Write-interlock state: the block selected by the first flash write after
/// arming, plus the staged program payload (`None` while an erase is
/// pending, which needs no data).
pub struct Staged {
    pub block: FlashBlock,
    pub data: Option<Vec<u8>>,
}

pub struct FlashArray {
    pub which: ArrayId,
    pub mcr: Register,
    pub lmlr: Register,
    pub hlr: Register,
    pub slmlr: Register,
    pub lmsr: Register,
    pub hsr: Register,
    pub ar: Register,
    pub biucr: Register,
    pub biuapr: Register,
    pub biucr2: Register,
    pub ut0: Register,
    pub ut1: Register,
    pub ut2: Register,

    /// Shadow block contents; `None` until loaded or defaulted.
    pub shadow: Option<Vec<u8>>,
    pub staged: Option<Staged>,
}

impl FlashArray {
    pub fn new(which: ArrayId) -> FlashArray {
        let mut mcr = Register::new(MCR_LAYOUT);
        // Array geometry advertised through MCR: A carries the low/mid
        // partitions, B is the mid-array-space part.
        match which {
            ArrayId::A => {
                mcr.set_reset(mcr.field("las"), 0b100);
                mcr.set_reset(mcr.field("mas"), 0b0);
            }
            ArrayId::B => {
                mcr.set_reset(mcr.field("las"), 0b000);
                mcr.set_reset(mcr.field("mas"), 0b1);
            }
        }
        FlashArray {
            which,
            mcr,
            lmlr: Register::new(LMLR_LAYOUT),
            hlr: Register::new(HLR_LAYOUT),
            slmlr: Register::new(SLMLR_LAYOUT),
            lmsr: Register::new(LMSR_LAYOUT),
            hsr: Register::new(HSR_LAYOUT),
            ar: Register::new(AR_LAYOUT),
            biucr: Register::new(BIUCR_LAYOUT),
            biuapr: Register::new(BIUAPR_LAYOUT),
            biucr2: Register::new(BIUCR2_LAYOUT),
            ut0: Register::new(UT0_LAYOUT),
            ut1: Register::new(UT_DATA_LAYOUT),
            ut2: Register::new(UT_DATA_LAYOUT),
            shadow: None,
            staged: None,
        }
    }

    /// Populate the shadow block from scratch: erased flash plus, for array
    /// A, the canonical boot constants ("Table 11-2. Shadow Block Memory
    /// Map").
    pub fn load_default_shadow(&mut self) {
        let mut data = vec![0xFFu8; SHADOW_SIZE];
        if self.which == ArrayId::A {
            for (offset, value) in shadow::SHADOW_A_DEFAULTS {
                data[*offset..*offset + value.len()].copy_from_slice(value);
            }
        }
        self.shadow = Some(data);
    }

    /// Reset the configuration registers, then reload the lock registers
    /// (and the A-side BIUCR2) from their shadow-flash reset words.
    pub fn reset(&mut self) {
        self.lmlr.reset();
        self.hlr.reset();
        self.slmlr.reset();
        self.lmsr.reset();
        self.hsr.reset();
        self.ar.reset();
        self.biucr.reset();
        self.biuapr.reset();
        self.biucr2.reset();
        self.ut0.reset();
        self.ut1.reset();
        self.ut2.reset();

        let Some(shadow) = &self.shadow else { return };
        let word =
            |offset: usize| u32::from_be_bytes(shadow[offset..offset + 4].try_into().unwrap());
        match self.which {
            ArrayId::A => {
                self.lmlr.parse(word(shadow::FLASH_A_LMLR_DEFAULT_OFFSET));
                self.hlr.parse(word(shadow::FLASH_A_HLR_DEFAULT_OFFSET));
                self.slmlr.parse(word(shadow::FLASH_A_SLMLR_DEFAULT_OFFSET));
                self.biucr2
                    .parse(word(shadow::FLASH_A_BIUCR2_DEFAULT_OFFSET));
            }
            ArrayId::B => {
                self.lmlr.parse(word(shadow::FLASH_B_LMLR_DEFAULT_OFFSET));
                self.hlr.parse(word(shadow::FLASH_B_HLR_DEFAULT_OFFSET));
                self.slmlr.parse(word(shadow::FLASH_B_SLMLR_DEFAULT_OFFSET));
            }
        }
    }

    /// Lock-register write protocols: the magic word sets the enable bit;
    /// with the enable bit set, writes reach the lock fields.
    pub fn lmlr_write(&mut self, value: u32) {
        if value == LMLR_UNLOCK {
            self.lmlr.set_by_name("lme", 1);
        } else if self.lmlr.get_by_name("lme") == 1 {
            self.lmlr.parse(value);
        }
    }

    pub fn hlr_write(&mut self, value: u32) {
        if value == HLR_UNLOCK {
            self.hlr.set_by_name("hbe", 1);
        } else if self.hlr.get_by_name("hbe") == 1 {
            self.hlr.parse(value);
        }
    }

    pub fn slmlr_write(&mut self, value: u32) {
        if value == SLMLR_UNLOCK {
            self.slmlr.set_by_name("sle", 1);
        } else if self.slmlr.get_by_name("sle") == 1 {
            self.slmlr.parse(value);
        }
    }

    /// A block may be programmed or erased only while every lock bit that
    /// covers it is clear.
    pub fn block_writable(&self, block: FlashBlock) -> bool {
        let locked = match block.kind {
            BlockKind::Shadow => {
                (self.lmlr.get_by_name("slock") | self.slmlr.get_by_name("sslock")) & 1
            }
            BlockKind::Low => {
                (self.lmlr.get_by_name("llock") | self.slmlr.get_by_name("sllock")) & block.mask()
            }
            BlockKind::Mid => {
                (self.lmlr.get_by_name("mlock") | self.slmlr.get_by_name("smlock")) & block.mask()
            }
            BlockKind::High => self.hlr.get_by_name("hlock") & block.mask(),
        };
        locked == 0
    }

    /// Blocks selected for erase by `LMSR`/`HSR` and `MCR[PEAS]`, in block
    /// order, restricted to the blocks this array actually has.
    pub fn selected_blocks(&self) -> Vec<FlashBlock> {
        let lsel = self.lmsr.get_by_name("lsel");
        let msel = self.lmsr.get_by_name("msel");
        let hsel = self.hsr.get_by_name("hsel");
        let peas = self.mcr.get_by_name("peas");

        array_blocks(self.which)
            .iter()
            .filter(|(block, _)| match block.kind {
                BlockKind::Low => lsel & block.mask() != 0,
                BlockKind::Mid => msel & block.mask() != 0,
                BlockKind::High => hsel & block.mask() != 0,
                BlockKind::Shadow => peas != 0,
            })
            .map(|(block, _)| *block)
            .collect()
    }

    /// Record a flash write while a program or erase is armed. The first
    /// write selects the block (the "write interlock"); program writes also
    /// accumulate into the staged payload, which starts erased.
    pub fn stage_write(&mut self, block: FlashBlock, offset: u32, bytes: &[u8]) {
        let pgm = self.mcr.get_by_name("pgm") == 1;
        let ers = self.mcr.get_by_name("ers") == 1;

        if self.staged.is_none() {
            if pgm {
                let size = block_extent(self.which, block)
                    .expect("staged block exists in this array")
                    .size as usize;
                self.staged = Some(Staged {
                    block,
                    data: Some(vec![0xFF; size]),
                });
            } else if ers {
                // Erasing the shadow block is flagged through MCR[PEAS].
                let peas = (block.kind == BlockKind::Shadow) as u32;
                self.mcr.set_by_name("peas", peas);
                self.staged = Some(Staged { block, data: None });
            } else {
                // No interlock armed; writes to the flash window are
                // silently ignored.
                debug!(
                    array = self.which.name(),
                    "flash write without PGM/ERS armed"
                );
                return;
            }
        }

        if pgm {
            if let Some(Staged {
                data: Some(data), ..
            }) = &mut self.staged
            {
                let start = offset as usize;
                data[start..start + bytes.len()].copy_from_slice(bytes);
            }
        }
    }

    /// Shadow write helper used by the shadow MMIO windows.
    pub fn stage_shadow_write(&mut self, offset: u32, bytes: &[u8]) {
        self.stage_write(SHADOW_BLOCK, offset, bytes);
    }
}
