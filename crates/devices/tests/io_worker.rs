use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::mpsc;
use std::time::Duration;

use dyno_devices::dspi::Dspi;
use dyno_devices::io::{Frame, FrameTransport, IoConnection};
use dyno_interrupts::Intc;
use memory::{Access, MemoryBus, Perms};

/// Channel-backed transport standing in for a socket peer.
struct ChannelTransport {
    rx: Receiver<Frame>,
    tx: Sender<Frame>,
}

impl FrameTransport for ChannelTransport {
    fn recv(&mut self, timeout: Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn send(&mut self, frame: Frame) {
        let _ = self.tx.send(frame);
    }
}

fn channel_pair() -> (ChannelTransport, Sender<Frame>, Receiver<Frame>) {
    let (to_worker_tx, to_worker_rx) = mpsc::channel();
    let (from_worker_tx, from_worker_rx) = mpsc::channel();
    (
        ChannelTransport {
            rx: to_worker_rx,
            tx: from_worker_tx,
        },
        to_worker_tx,
        from_worker_rx,
    )
}

#[test]
fn inbound_frames_surface_at_the_poll_point() {
    let (transport, peer_tx, _peer_rx) = channel_pair();
    let io = IoConnection::spawn("test", Box::new(transport));

    peer_tx.send(0x1234).unwrap();
    peer_tx.send(0x5678).unwrap();

    // The worker delivers asynchronously; poll until both frames arrive.
    let mut got = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while got.len() < 2 && std::time::Instant::now() < deadline {
        while let Some(f) = io.try_recv() {
            got.push(f);
        }
        std::thread::yield_now();
    }
    assert_eq!(got, vec![0x1234, 0x5678]);
}

#[test]
fn transmitted_frames_are_mirrored_to_the_transport() {
    let (transport, _peer_tx, peer_rx) = channel_pair();
    let io = IoConnection::spawn("test", Box::new(transport));

    let intc = Rc::new(RefCell::new(Intc::new()));
    let dspi = Rc::new(RefCell::new(Dspi::new("DSPI_C", 2, intc)));
    dspi.borrow_mut().attach_io(io);

    let mut bus = MemoryBus::new();
    bus.map_mmio("DSPI_C", 0xFFF9_8000, 0x4000, Perms::RW, true, dspi.clone());

    // Controller mode, running: a push transmits synchronously and the
    // frame is handed to the worker.
    bus.write(0xFFF9_8000, 0x8000_0000, 4, Access::Supervisor)
        .unwrap();
    bus.write(0xFFF9_8034, 0x0000_0BEE, 4, Access::Supervisor)
        .unwrap();

    let frame = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(frame, 0x0BEE);
}

#[test]
fn worker_stops_on_shutdown() {
    let (transport, _peer_tx, _peer_rx) = channel_pair();
    let mut io = IoConnection::spawn("test", Box::new(transport));
    io.shutdown();
    // Dropping after an explicit shutdown must not hang or double-join.
    drop(io);
}
