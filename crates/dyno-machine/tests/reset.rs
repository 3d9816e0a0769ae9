use dyno_interrupts::ResetSource;
use dyno_machine::{Machine, MachineConfig};

const SRAM_BASE: u32 = 0x4000_0000;
const STANDBY_SIZE: u32 = 0x8000;

fn machine() -> Machine {
    Machine::new(MachineConfig::default()).unwrap()
}

#[test]
fn warm_reset_preserves_the_standby_region() {
    let mut m = machine();

    m.write_word(SRAM_BASE, 0xCAFE_BABE).unwrap();
    m.write_word(SRAM_BASE + STANDBY_SIZE, 0xDEAD_BEEF).unwrap();

    m.warm_reset();

    assert_eq!(m.read_word(SRAM_BASE).unwrap(), 0xCAFE_BABE);
    assert_eq!(m.read_word(SRAM_BASE + STANDBY_SIZE).unwrap(), 0x0000_0000);
}

#[test]
fn cold_reset_clears_all_of_sram() {
    let mut m = machine();

    m.write_word(SRAM_BASE, 0xCAFE_BABE).unwrap();
    m.write_word(SRAM_BASE + STANDBY_SIZE, 0xDEAD_BEEF).unwrap();

    m.cold_reset();

    assert_eq!(m.read_word(SRAM_BASE).unwrap(), 0);
    assert_eq!(m.read_word(SRAM_BASE + STANDBY_SIZE).unwrap(), 0);
}

#[test]
fn reset_restores_peripheral_state_to_match_a_fresh_machine() {
    let mut m = machine();

    // Disturb observable state across the SoC.
    m.write_word(0xFFF9_0000, 0x8000_0001).unwrap(); // DSPI_A MCR
    m.write_word(0xFFF9_0008, 0x1234_0000).unwrap(); // DSPI_A TCR
    m.write_word(0xFFF4_8008, 7).unwrap(); // INTC CPR
    m.write_word(SRAM_BASE + 0x100, 0x5555_5555).unwrap();
    m.timebase.enable();
    m.timebase.advance(1000);

    m.cold_reset();

    let fresh = machine();
    for addr in [0xFFF9_0000u32, 0xFFF9_0008, 0xFFF9_002C, 0xFFF4_8008] {
        assert_eq!(
            m.read_word(addr).unwrap(),
            fresh.read_word(addr).unwrap(),
            "mismatch at {addr:#010x}"
        );
    }
    assert_eq!(m.read_word(SRAM_BASE + 0x100).unwrap(), 0);
    assert_eq!(m.timebase.systicks(), 0);
}

#[test]
fn guest_reset_request_vectors_into_a_warm_reset() {
    let mut m = machine();

    m.write_word(SRAM_BASE, 0xCAFE_BABE).unwrap();
    m.write_word(SRAM_BASE + STANDBY_SIZE, 0xDEAD_BEEF).unwrap();

    m.request_reset(ResetSource::Watchdog);
    let exc = m.vector_next().expect("reset exception pending");
    assert!(matches!(exc, dyno_interrupts::Exception::Reset(ResetSource::Watchdog)));

    // The reset channel behaves as a warm reset: standby SRAM survives.
    assert_eq!(m.read_word(SRAM_BASE).unwrap(), 0xCAFE_BABE);
    assert_eq!(m.read_word(SRAM_BASE + STANDBY_SIZE).unwrap(), 0);
}

#[test]
fn flash_lock_registers_reload_from_shadow_on_reset() {
    let mut m = machine();

    // Unlock and clear the A-side low/mid locks.
    m.write_word(0xC3F8_8004, 0xA1A1_1111).unwrap();
    m.write_word(0xC3F8_8004, 0).unwrap();
    assert_eq!(m.read_word(0xC3F8_8004).unwrap(), 0x8000_0000);

    // Reset reloads the shadow-defined default (fully locked, LME clear).
    m.warm_reset();
    assert_eq!(m.read_word(0xC3F8_8004).unwrap(), 0x0013_03FF);
}
