//! Guest timebase and pausable wall-clock source.
//!
//! The emulated machine keeps a monotonic 64-bit `systicks` counter that the
//! instruction executor advances at retirement. Tick reads are lock-free so
//! peripherals can timestamp events from any context. The wall-clock side is
//! pausable: while the interactive UI holds a prompt the guest-visible clock
//! stands still, so host time spent at the prompt is never charged to the
//! emulated machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Monotonic instruction-driven tick counter.
#[derive(Debug, Default)]
pub struct Timebase {
    ticks: AtomicU64,
    enabled: AtomicBool,
}

impl Timebase {
    pub fn new() -> Timebase {
        Timebase {
            ticks: AtomicU64::new(0),
            // The real core's timebase only counts once HID0[TBEN] is set;
            // the executor enables it during early boot.
            enabled: AtomicBool::new(false),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Advance the counter by `n` retired-instruction ticks.
    pub fn advance(&self, n: u64) {
        if self.is_enabled() {
            self.ticks.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Lock-free read of the current tick count.
    pub fn systicks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.enabled.store(false, Ordering::Relaxed);
    }
}

/// Host time provider, swappable for tests.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Real host clock anchored at construction.
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> WallClock {
        WallClock {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for WallClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually-advanced clock for deterministic tests.
pub struct FakeHostClock {
    ns: AtomicU64,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> FakeHostClock {
        FakeHostClock {
            ns: AtomicU64::new(start_ns),
        }
    }

    pub fn advance_ns(&self, ns: u64) {
        self.ns.fetch_add(ns, Ordering::Relaxed);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::Relaxed)
    }
}

struct TimeState {
    /// Guest nanoseconds accumulated up to `anchor`.
    accumulated_ns: u64,
    /// Host timestamp of the last pause/resume transition.
    anchor_ns: u64,
    paused: bool,
}

/// Pausable guest-time view over a [`HostClock`].
pub struct TimeSource {
    host: Arc<dyn HostClock>,
    state: Mutex<TimeState>,
}

impl TimeSource {
    pub fn new(host: Arc<dyn HostClock>) -> TimeSource {
        let anchor_ns = host.now_ns();
        TimeSource {
            host,
            state: Mutex::new(TimeState {
                accumulated_ns: 0,
                anchor_ns,
                paused: false,
            }),
        }
    }

    /// Guest-visible nanoseconds since construction, excluding paused spans.
    pub fn now_ns(&self) -> u64 {
        let state = self.state.lock().unwrap();
        if state.paused {
            state.accumulated_ns
        } else {
            state.accumulated_ns + (self.host.now_ns() - state.anchor_ns)
        }
    }

    /// Stop charging host time to the guest. Idempotent.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.paused {
            state.accumulated_ns += self.host.now_ns() - state.anchor_ns;
            state.paused = true;
        }
    }

    /// Resume charging host time to the guest. Idempotent.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if state.paused {
            state.anchor_ns = self.host.now_ns();
            state.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }
}
