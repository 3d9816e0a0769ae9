//! Worker-thread plumbing for peripherals that speak to external I/O.
//!
//! The core thread never blocks: a dedicated worker per connection blocks on
//! the transport with a short timeout and exchanges 32-bit frames with the
//! core through bounded thread-safe queues. The core drains the inbound
//! queue between instructions; the worker observes a cooperative stop flag
//! whenever its receive times out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

/// One frame on an external link.
pub type Frame = u32;

/// Queue depth per direction; a slow transport backpressures rather than
/// growing without bound.
const QUEUE_DEPTH: usize = 256;

/// Poll interval for the worker's blocking receive.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// The external side of a connection, driven from the worker thread.
pub trait FrameTransport: Send + 'static {
    /// Block up to `timeout` for one inbound frame.
    fn recv(&mut self, timeout: Duration) -> Option<Frame>;
    /// Deliver one outbound frame.
    fn send(&mut self, frame: Frame);
}

/// Core-side handle: inbound frames to deliver to the peripheral, outbound
/// frames the peripheral produced. Dropping the handle stops the worker.
pub struct IoConnection {
    inbound: Receiver<Frame>,
    outbound: SyncSender<Frame>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl IoConnection {
    /// Spawn a worker around `transport`.
    pub fn spawn(name: &'static str, mut transport: Box<dyn FrameTransport>) -> IoConnection {
        let (inbound_tx, inbound_rx) = mpsc::sync_channel::<Frame>(QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::sync_channel::<Frame>(QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();

        let worker = std::thread::Builder::new()
            .name(format!("{name}-io"))
            .spawn(move || {
                while !worker_stop.load(Ordering::Relaxed) {
                    while let Ok(frame) = outbound_rx.try_recv() {
                        transport.send(frame);
                    }
                    if let Some(frame) = transport.recv(RECV_TIMEOUT) {
                        if inbound_tx.try_send(frame).is_err() {
                            warn!(worker = name, "inbound frame queue full, frame dropped");
                        }
                    }
                }
            })
            .expect("spawn io worker");

        IoConnection {
            inbound: inbound_rx,
            outbound: outbound_tx,
            stop,
            worker: Some(worker),
        }
    }

    /// Non-blocking inbound poll, called from the core thread.
    pub fn try_recv(&self) -> Option<Frame> {
        self.inbound.try_recv().ok()
    }

    /// Hand a frame to the worker for transmission.
    pub fn send(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!("outbound frame queue full, frame dropped");
            }
        }
    }

    /// Signal the worker to exit and wait for it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for IoConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
