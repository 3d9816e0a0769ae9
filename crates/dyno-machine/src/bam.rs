//! Boot-assist module: locate the reset configuration half-word.

use dyno_flash::FlashController;
use tracing::{debug, info};

/// Candidate RCHW offsets for internal boot, "Table 3-4. RCHW Location".
pub const BOOT_CANDIDATES: [u32; 6] = [0x0000, 0x4000, 0x1_0000, 0x1_C000, 0x2_0000, 0x3_0000];

/// A valid boot descriptor carries this byte in the low half of the RCHW
/// half-word.
pub const RCHW_BOOT_ID: u8 = 0x5A;

/// Scan the candidate offsets for a valid RCHW; the word following a match
/// is the initial program counter. `None` means no internal boot image was
/// found and the part would fall back to external boot.
pub fn scan_rchw(flash: &mut FlashController) -> Option<u32> {
    for offset in BOOT_CANDIDATES {
        let rchw: [u8; 4] = flash.main_slice(offset as usize, 4).try_into().unwrap();
        if rchw[1] == RCHW_BOOT_ID {
            let entry: [u8; 4] = flash.main_slice(offset as usize + 4, 4).try_into().unwrap();
            let pc = u32::from_be_bytes(entry);
            info!(
                offset = format_args!("{offset:#x}"),
                pc = format_args!("{pc:#010x}"),
                "RCHW found"
            );
            return Some(pc);
        }
        debug!(offset = format_args!("{offset:#x}"), "no RCHW at candidate");
    }
    None
}
