use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

/// A device sitting on a DSPI chip-select line.
///
/// `exchange` models one full-duplex frame: the controller shifts `value`
/// out and the device may shift a reply back, which the controller pushes
/// onto its Rx FIFO.
pub trait SpiDevice {
    fn name(&self) -> &str;
    fn exchange(&mut self, value: u32) -> Option<u32>;
}

/// Chip-select–keyed bus façade.
///
/// The DSPI controller resolves each transmitted frame's PCS mask against
/// the registered devices. Frames with no registered target still count as
/// transmitted (the pins wiggle, nothing listens); every frame is recorded
/// so tests and trace tooling can observe the committed sequence.
pub struct SpiBus {
    name: &'static str,
    devices: Vec<(u8, Rc<RefCell<dyn SpiDevice>>)>,
    sent: Vec<(u8, u32)>,
}

impl SpiBus {
    pub fn new(name: &'static str) -> SpiBus {
        SpiBus {
            name,
            devices: Vec::new(),
            sent: Vec::new(),
        }
    }

    /// Register `device` behind the chip-select mask `cs`.
    pub fn register_device(&mut self, cs: u8, device: Rc<RefCell<dyn SpiDevice>>) {
        self.devices.retain(|(mask, _)| *mask != cs);
        self.devices.push((cs, device));
    }

    /// Deliver one frame; returns the target's reply, if any.
    pub fn transmit(&mut self, pcs: u8, value: u32) -> Option<u32> {
        self.sent.push((pcs, value));
        match self.devices.iter().find(|(mask, _)| *mask == pcs) {
            Some((_, device)) => {
                let mut device = device.borrow_mut();
                trace!(bus = self.name, device = device.name(), value = format_args!("{value:#x}"), "spi frame");
                device.exchange(value)
            }
            None => {
                debug!(bus = self.name, pcs, value = format_args!("{value:#x}"), "spi frame with no target");
                None
            }
        }
    }

    /// Drain the committed-frame log (oldest first).
    pub fn take_sent(&mut self) -> Vec<(u8, u32)> {
        std::mem::take(&mut self.sent)
    }
}
