use dyno_machine::{Machine, MachineConfig};
use pretty_assertions::assert_eq;

fn machine() -> Machine {
    Machine::new(MachineConfig::default()).unwrap()
}

#[test]
fn regions_do_not_overlap_and_cover_the_documented_bases() {
    let m = machine();

    let regions: Vec<_> = m.bus.regions().collect();
    for pair in regions.windows(2) {
        let (name_a, base_a, size_a) = pair[0];
        let (name_b, base_b, _) = pair[1];
        assert!(
            base_a + (size_a - 1) < base_b,
            "{name_a} overlaps {name_b}"
        );
    }

    let bases: Vec<(&str, u32)> = regions.iter().map(|&(n, b, _)| (n, b)).collect();
    for expected in [
        ("FLASH_MAIN", 0x0000_0000),
        ("FLASH_B_SHADOW", 0x00EF_C000),
        ("FLASH_A_SHADOW", 0x00FF_C000),
        ("SRAM", 0x4000_0000),
        ("PBRIDGE_A", 0xC3F0_0000),
        ("FMPLL", 0xC3F8_0000),
        ("EBI", 0xC3F8_4000),
        ("FLASH_A_CONFIG", 0xC3F8_8000),
        ("FLASH_B_CONFIG", 0xC3F8_C000),
        ("SIU", 0xC3F9_0000),
        ("eMIOS200", 0xC3FA_0000),
        ("eTPU2", 0xC3FC_0000),
        ("PIT", 0xC3FF_0000),
        ("PBRIDGE_B", 0xFFF0_0000),
        ("XBAR", 0xFFF0_4000),
        ("SWT", 0xFFF3_8000),
        ("ECSM", 0xFFF4_0000),
        ("eDMA_A", 0xFFF4_4000),
        ("INTC", 0xFFF4_8000),
        ("eDMA_B", 0xFFF5_4000),
        ("eQADC_A", 0xFFF8_0000),
        ("eQADC_B", 0xFFF8_4000),
        ("DECFILT", 0xFFF8_8000),
        ("DSPI_A", 0xFFF9_0000),
        ("DSPI_B", 0xFFF9_4000),
        ("DSPI_C", 0xFFF9_8000),
        ("DSPI_D", 0xFFF9_C000),
        ("eSCI_A", 0xFFFB_0000),
        ("eSCI_B", 0xFFFB_4000),
        ("eSCI_C", 0xFFFB_8000),
        ("FlexCAN_A", 0xFFFC_0000),
        ("FlexCAN_B", 0xFFFC_4000),
        ("FlexCAN_C", 0xFFFC_8000),
        ("FlexCAN_D", 0xFFFC_C000),
        ("SIM", 0xFFFE_C000),
        ("BAM", 0xFFFF_C000),
    ] {
        assert!(bases.contains(&expected), "missing region {expected:?}");
    }
}

#[test]
fn documented_constants_read_back_through_the_map() {
    let m = machine();

    // SIM device-identification constants.
    assert_eq!(m.read_word(0xFFFE_C010).unwrap(), 0x01FF_FFFF);
    // PBRIDGE master privilege resets.
    assert_eq!(m.read_word(0xC3F0_0000).unwrap(), 0x7777_7777);
    assert_eq!(m.read_word(0xFFF0_0000).unwrap(), 0x7777_7777);
    // DSPI status out of reset.
    assert_eq!(m.read_word(0xFFF9_002C).unwrap(), 0x0200_0000);
    // Erased flash reads all ones.
    assert_eq!(m.read_word(0x0010_0000).unwrap(), 0xFFFF_FFFF);
    // Shadow A boot constants.
    assert_eq!(m.read_word(0x00FF_C000 + 0x3DE0).unwrap(), 0x55AA_55AA);
    // SRAM starts cleared.
    assert_eq!(m.read_word(0x4000_0000).unwrap(), 0);
}
