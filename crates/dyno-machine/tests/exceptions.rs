use dyno_interrupts::{msr, Exception, ExceptionClass, McCause};
use dyno_machine::{Machine, MachineConfig};
use memory::{Access, BusFault};

fn machine() -> Machine {
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.core.msr = msr::EE | msr::CE | msr::ME;
    m
}

#[test]
fn standard_exception_is_gated_by_cpr_until_lowered() {
    let mut m = machine();
    m.core.pc = 0x0000_4000;

    {
        let mut intc = m.intc.borrow_mut();
        intc.set_source_priority(300, 5);
        intc.set_current_priority(7);
        intc.post(Exception::External { source: 300 });
    }

    // Priority 5 against CPR 7: latched, not vectored.
    assert_eq!(m.pending_exception(), None);
    assert!(m.vector_next().is_none());

    // Lowering CPR re-evaluates at the next boundary.
    m.write_word(0xFFF4_8008, 4).unwrap();
    let exc = m.vector_next().expect("vectored after CPR drop");
    assert_eq!(exc, Exception::External { source: 300 });

    // The class pair captured the interrupted context.
    assert_eq!(m.core.srr0, 0x0000_4000);
    assert_eq!(m.core.srr1, msr::EE | msr::CE | msr::ME);
    assert_eq!(m.core.msr & msr::EE, 0, "EE masked while in handler");
}

#[test]
fn rfi_restores_the_saved_pair() {
    let mut m = machine();
    m.core.pc = 0x0000_4000;

    m.intc.borrow_mut().set_source_priority(300, 5);
    m.intc.borrow_mut().post(Exception::External { source: 300 });
    m.vector_next().unwrap();

    // The handler runs somewhere else entirely.
    m.core.pc = 0x0000_9000;
    m.rfi(ExceptionClass::Standard);

    assert_eq!(m.core.pc, 0x0000_4000);
    assert_eq!(m.core.msr, msr::EE | msr::CE | msr::ME);
}

#[test]
fn machine_check_uses_its_own_saved_pair_and_preempts() {
    let mut m = machine();
    m.core.pc = 0x0000_4000;

    m.intc.borrow_mut().set_source_priority(300, 5);
    m.intc.borrow_mut().post(Exception::External { source: 300 });
    m.intc
        .borrow_mut()
        .post(Exception::MachineCheck(McCause::Nmi));

    let exc = m.vector_next().unwrap();
    assert_eq!(exc.class(), ExceptionClass::MachineCheck);
    assert_eq!(m.core.mcsrr0, 0x0000_4000);

    // The standard source is still pending underneath (EE was masked by
    // the machine-check entry, so it stays latched until rfi).
    m.rfi(ExceptionClass::MachineCheck);
    let exc = m.vector_next().unwrap();
    assert_eq!(exc, Exception::External { source: 300 });
}

#[test]
fn bus_fault_converts_to_a_machine_check_exception() {
    let mut m = machine();
    m.bus.set_program_counter(0x0000_4000);

    let fault = m
        .bus
        .read(0x9000_0000, 4, Access::Supervisor)
        .expect_err("unmapped");
    assert_eq!(
        fault,
        BusFault::DataRead {
            addr: 0x9000_0000,
            pc: 0x0000_4000
        }
    );

    // The executor queues the translated exception; it vectors as a
    // machine check with the fault syndrome attached.
    m.intc.borrow_mut().post(Exception::from_bus_fault(fault));
    let exc = m.vector_next().unwrap();
    assert_eq!(
        exc,
        Exception::MachineCheck(McCause::DataReadBusError {
            addr: 0x9000_0000,
            pc: 0x0000_4000
        })
    );
}

#[test]
fn dspi_event_reaches_the_core_through_the_intc() {
    let mut m = machine();

    // DSPI_A TFFF maps to external source 277; give it a priority and
    // unmask it in RSER.
    m.intc.borrow_mut().set_source_priority(277, 3);
    m.write_word(0xFFF9_0030, 0x0200_0000).unwrap(); // RSER[TFFF]

    // TFFF is set out of reset; clearing it with the FIFO empty re-arms it
    // and posts the rising edge.
    m.write_word(0xFFF9_002C, 0x0200_0000).unwrap();

    let exc = m.vector_next().expect("TFFF interrupt");
    assert_eq!(exc, Exception::External { source: 277 });
}

#[test]
fn user_mode_cannot_reach_supervisor_peripherals() {
    let mut m = machine();

    assert!(matches!(
        m.bus.read(0xFFF4_8008, 4, Access::User),
        Err(BusFault::DataRead { .. })
    ));
    assert!(m.bus.read(0xFFF4_8008, 4, Access::Supervisor).is_ok());

    // The machine's loader path goes through the supervisor override.
    m.write_word(0xFFF4_8008, 3).unwrap();
    assert_eq!(m.bus.read(0xFFF4_8008, 4, Access::Supervisor).unwrap(), 3);
}
