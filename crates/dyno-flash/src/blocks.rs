//! Static geometry of the two flash arrays.
//!
//! The 4 MiB main window is carved into low/mid/high blocks split between
//! array A and array B; each array additionally owns a 16 KiB shadow block.
//! The six high blocks are physically interleaved: every 32-byte group holds
//! 16 bytes of array A followed by 16 bytes of array B, so both arrays see a
//! 256 KiB half of each 512 KiB high region.

use crate::FlashDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayId {
    A,
    B,
}

impl ArrayId {
    pub fn name(&self) -> &'static str {
        match self {
            ArrayId::A => "A",
            ArrayId::B => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Shadow,
    Low,
    Mid,
    High,
}

/// Block identity within one array. Select and lock bits are ordered
/// high:low, so `L0` is the least significant bit of `LMSR[LSEL]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashBlock {
    pub kind: BlockKind,
    pub index: u8,
}

impl FlashBlock {
    pub const fn new(kind: BlockKind, index: u8) -> FlashBlock {
        FlashBlock { kind, index }
    }

    /// Bit within the kind-specific select/lock field.
    pub fn mask(&self) -> u32 {
        1 << self.index
    }

    pub fn name(&self) -> String {
        let prefix = match self.kind {
            BlockKind::Shadow => "S",
            BlockKind::Low => "L",
            BlockKind::Mid => "M",
            BlockKind::High => "H",
        };
        format!("{prefix}{}", self.index)
    }
}

const fn low(index: u8) -> FlashBlock {
    FlashBlock::new(BlockKind::Low, index)
}

const fn mid(index: u8) -> FlashBlock {
    FlashBlock::new(BlockKind::Mid, index)
}

const fn high(index: u8) -> FlashBlock {
    FlashBlock::new(BlockKind::High, index)
}

pub const SHADOW_BLOCK: FlashBlock = FlashBlock::new(BlockKind::Shadow, 0);

/// Backing location of one block: which device window holds it, and where.
/// For high blocks the offset/size describe the array's 256 KiB half; the
/// data is interleaved into the shared 512 KiB region on commit.
#[derive(Debug, Clone, Copy)]
pub struct BlockExtent {
    pub device: FlashDevice,
    pub offset: u32,
    pub size: u32,
}

const fn ext(device: FlashDevice, offset: u32, size: u32) -> BlockExtent {
    BlockExtent {
        device,
        offset,
        size,
    }
}

const KIB: u32 = 1024;

const ARRAY_A_BLOCKS: &[(FlashBlock, BlockExtent)] = &[
    (low(0), ext(FlashDevice::Main, 0x0000_0000, 16 * KIB)),
    (low(1), ext(FlashDevice::Main, 0x0000_4000, 16 * KIB)),
    (low(2), ext(FlashDevice::Main, 0x0000_8000, 16 * KIB)),
    (low(3), ext(FlashDevice::Main, 0x0000_C000, 16 * KIB)),
    (low(4), ext(FlashDevice::Main, 0x0001_0000, 16 * KIB)),
    (low(5), ext(FlashDevice::Main, 0x0001_4000, 16 * KIB)),
    (low(6), ext(FlashDevice::Main, 0x0001_8000, 16 * KIB)),
    (low(7), ext(FlashDevice::Main, 0x0001_C000, 16 * KIB)),
    (low(8), ext(FlashDevice::Main, 0x0002_0000, 64 * KIB)),
    (low(9), ext(FlashDevice::Main, 0x0003_0000, 64 * KIB)),
    (mid(0), ext(FlashDevice::Main, 0x0004_0000, 128 * KIB)),
    (mid(1), ext(FlashDevice::Main, 0x0006_0000, 128 * KIB)),
    (
        SHADOW_BLOCK,
        ext(FlashDevice::ShadowA, 0x0000_0000, 16 * KIB),
    ),
    (high(0), ext(FlashDevice::Main, 0x0010_0000, 256 * KIB)),
    (high(1), ext(FlashDevice::Main, 0x0018_0000, 256 * KIB)),
    (high(2), ext(FlashDevice::Main, 0x0020_0000, 256 * KIB)),
    (high(3), ext(FlashDevice::Main, 0x0028_0000, 256 * KIB)),
    (high(4), ext(FlashDevice::Main, 0x0030_0000, 256 * KIB)),
    (high(5), ext(FlashDevice::Main, 0x0038_0000, 256 * KIB)),
];

const ARRAY_B_BLOCKS: &[(FlashBlock, BlockExtent)] = &[
    (low(0), ext(FlashDevice::Main, 0x0008_0000, 256 * KIB)),
    (mid(0), ext(FlashDevice::Main, 0x000C_0000, 256 * KIB)),
    (
        SHADOW_BLOCK,
        ext(FlashDevice::ShadowB, 0x0000_0000, 16 * KIB),
    ),
    (high(0), ext(FlashDevice::Main, 0x0010_0000, 256 * KIB)),
    (high(1), ext(FlashDevice::Main, 0x0018_0000, 256 * KIB)),
    (high(2), ext(FlashDevice::Main, 0x0020_0000, 256 * KIB)),
    (high(3), ext(FlashDevice::Main, 0x0028_0000, 256 * KIB)),
    (high(4), ext(FlashDevice::Main, 0x0030_0000, 256 * KIB)),
    (high(5), ext(FlashDevice::Main, 0x0038_0000, 256 * KIB)),
];

/// All blocks of one array, "Table 11-1. Memory Map" geometry.
pub fn array_blocks(array: ArrayId) -> &'static [(FlashBlock, BlockExtent)] {
    match array {
        ArrayId::A => ARRAY_A_BLOCKS,
        ArrayId::B => ARRAY_B_BLOCKS,
    }
}

/// Extent of `block` within `array`, if the array has that block.
pub fn block_extent(array: ArrayId, block: FlashBlock) -> Option<BlockExtent> {
    array_blocks(array)
        .iter()
        .find(|(b, _)| *b == block)
        .map(|(_, e)| *e)
}

/// Routing of the main flash window: which array/block owns each offset.
/// High regions are owned by both arrays and are resolved per 16-byte
/// stripe.
const MAIN_MAP: &[(u32, u32, Option<ArrayId>, FlashBlock)] = &[
    (0x0000_0000, 0x0000_4000, Some(ArrayId::A), low(0)),
    (0x0000_4000, 0x0000_8000, Some(ArrayId::A), low(1)),
    (0x0000_8000, 0x0000_C000, Some(ArrayId::A), low(2)),
    (0x0000_C000, 0x0001_0000, Some(ArrayId::A), low(3)),
    (0x0001_0000, 0x0001_4000, Some(ArrayId::A), low(4)),
    (0x0001_4000, 0x0001_8000, Some(ArrayId::A), low(5)),
    (0x0001_8000, 0x0001_C000, Some(ArrayId::A), low(6)),
    (0x0001_C000, 0x0002_0000, Some(ArrayId::A), low(7)),
    (0x0002_0000, 0x0003_0000, Some(ArrayId::A), low(8)),
    (0x0003_0000, 0x0004_0000, Some(ArrayId::A), low(9)),
    (0x0004_0000, 0x0006_0000, Some(ArrayId::A), mid(0)),
    (0x0006_0000, 0x0008_0000, Some(ArrayId::A), mid(1)),
    (0x0008_0000, 0x000C_0000, Some(ArrayId::B), low(0)),
    (0x000C_0000, 0x0010_0000, Some(ArrayId::B), mid(0)),
    (0x0010_0000, 0x0018_0000, None, high(0)),
    (0x0018_0000, 0x0020_0000, None, high(1)),
    (0x0020_0000, 0x0028_0000, None, high(2)),
    (0x0028_0000, 0x0030_0000, None, high(3)),
    (0x0030_0000, 0x0038_0000, None, high(4)),
    (0x0038_0000, 0x0040_0000, None, high(5)),
];

/// Resolve a main-window offset to the owning array, its block, and the
/// in-array offset. In the interleaved high regions bit 4 of the in-block
/// offset selects the array (B owns the odd stripes), and the in-array
/// offset collapses the foreign stripes away. Aligned accesses never
/// straddle a stripe, so a single resolution covers the whole access.
pub fn resolve_main(offset: u32) -> (ArrayId, FlashBlock, u32) {
    for &(start, end, array, block) in MAIN_MAP {
        if (start..end).contains(&offset) {
            let block_offset = offset - start;
            return match array {
                Some(array) => (array, block, block_offset),
                None => {
                    let group = block_offset / 32;
                    let in_array = group * 16 + block_offset % 16;
                    if block_offset & 0x10 != 0 {
                        (ArrayId::B, block, in_array)
                    } else {
                        (ArrayId::A, block, in_array)
                    }
                }
            };
        }
    }
    panic!("offset {offset:#x} outside the main flash window");
}
