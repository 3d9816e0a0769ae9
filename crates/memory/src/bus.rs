use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;

use crate::{be_bytes, be_value, Access, BusFault, Perms};

/// Context handed to an MMIO handler for one access: the full physical
/// address and the program counter of the instruction that issued it (used
/// when the handler reports a bus error).
#[derive(Debug, Clone, Copy)]
pub struct MmioCtx {
    pub addr: u32,
    pub pc: u32,
}

/// A memory-mapped peripheral window.
///
/// `offset` is relative to the region base; `size` is 1, 2 or 4 and the
/// access is already aligned when the handler is invoked. Values are plain
/// integers; the bus performs the big-endian (de)serialization.
pub trait MmioHandler {
    fn read(&mut self, ctx: &MmioCtx, offset: u32, size: usize) -> Result<u32, BusFault>;
    fn write(&mut self, ctx: &MmioCtx, offset: u32, size: usize, value: u32)
        -> Result<(), BusFault>;
}

enum Backing {
    Ram(Vec<u8>),
    Mmio(Rc<RefCell<dyn MmioHandler>>),
}

struct Region {
    name: &'static str,
    base: u32,
    size: u32,
    perms: Perms,
    supervisor_only: bool,
    backing: Backing,
}

impl Region {
    fn contains(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }
}

/// Restores the previous supervisor-override depth when dropped, on all exit
/// paths. Obtained from [`MemoryBus::supervisor_scope`]; the guard shares
/// the depth counter so it can outlive a borrow of the bus itself.
pub struct SupervisorGuard {
    depth: Rc<Cell<u32>>,
}

impl Drop for SupervisorGuard {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

/// The address-routed MMIO bus.
///
/// Region lookup is a binary search over a base-sorted interval list. RAM
/// blocks are owned by the bus; MMIO windows dispatch to shared handlers.
pub struct MemoryBus {
    regions: Vec<Region>,
    pc: Cell<u32>,
    supervisor_depth: Rc<Cell<u32>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus {
            regions: Vec::new(),
            pc: Cell::new(0),
            supervisor_depth: Rc::new(Cell::new(0)),
        }
    }

    /// Record the current guest program counter; bus faults raised by later
    /// accesses carry this value.
    pub fn set_program_counter(&self, pc: u32) {
        self.pc.set(pc);
    }

    pub fn program_counter(&self) -> u32 {
        self.pc.get()
    }

    /// Force supervisor privilege for the lifetime of the returned guard.
    /// Used by the emulator itself (firmware preload, shadow initialization)
    /// to reach supervisor-only windows without touching the core's MSR.
    pub fn supervisor_scope(&self) -> SupervisorGuard {
        self.supervisor_depth.set(self.supervisor_depth.get() + 1);
        SupervisorGuard {
            depth: self.supervisor_depth.clone(),
        }
    }

    fn insert_region(&mut self, region: Region) {
        let end = region
            .base
            .checked_add(region.size - 1)
            .unwrap_or_else(|| panic!("region {} wraps the address space", region.name));
        for existing in &self.regions {
            let existing_end = existing.base + (existing.size - 1);
            if region.base <= existing_end && existing.base <= end {
                panic!(
                    "region {} [{:#010x}, {:#010x}] overlaps {} [{:#010x}, {:#010x}]",
                    region.name, region.base, end, existing.name, existing.base, existing_end
                );
            }
        }
        let idx = self.regions.partition_point(|r| r.base < region.base);
        self.regions.insert(idx, region);
    }

    /// Map a zero-filled RAM block owned by the bus.
    pub fn map_ram(&mut self, name: &'static str, base: u32, size: u32, perms: Perms) {
        assert!(size > 0, "empty RAM region {name}");
        self.insert_region(Region {
            name,
            base,
            size,
            perms,
            supervisor_only: false,
            backing: Backing::Ram(vec![0u8; size as usize]),
        });
    }

    /// Map a peripheral window onto a shared handler.
    pub fn map_mmio(
        &mut self,
        name: &'static str,
        base: u32,
        size: u32,
        perms: Perms,
        supervisor_only: bool,
        handler: Rc<RefCell<dyn MmioHandler>>,
    ) {
        assert!(size > 0, "empty MMIO region {name}");
        self.insert_region(Region {
            name,
            base,
            size,
            perms,
            supervisor_only,
            backing: Backing::Mmio(handler),
        });
    }

    fn lookup(&self, addr: u32) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.base <= addr);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        self.regions[idx].contains(addr).then_some(idx)
    }

    fn effective(&self, mode: Access) -> Access {
        if self.supervisor_depth.get() > 0 {
            Access::Supervisor
        } else {
            mode
        }
    }

    fn check(&self, addr: u32, size: usize, mode: Access, write: bool) -> Result<usize, BusFault> {
        if !matches!(size, 1 | 2 | 4) || addr as usize % size != 0 {
            return Err(BusFault::Alignment { addr, size });
        }
        let fault = || {
            if write {
                BusFault::DataWrite {
                    addr,
                    pc: self.pc.get(),
                    data: 0,
                }
            } else {
                BusFault::DataRead {
                    addr,
                    pc: self.pc.get(),
                }
            }
        };
        let Some(idx) = self.lookup(addr) else {
            trace!(addr = format_args!("{addr:#010x}"), "unmapped access");
            return Err(fault());
        };
        let region = &self.regions[idx];
        let needed = if write { Perms::W } else { Perms::R };
        if !region.perms.contains(needed) {
            return Err(fault());
        }
        if region.supervisor_only && self.effective(mode) != Access::Supervisor {
            return Err(fault());
        }
        Ok(idx)
    }

    /// Naturally-aligned big-endian read of 1, 2 or 4 bytes.
    pub fn read(&self, addr: u32, size: usize, mode: Access) -> Result<u32, BusFault> {
        let idx = self.check(addr, size, mode, false)?;
        let region = &self.regions[idx];
        let offset = addr - region.base;
        match &region.backing {
            Backing::Ram(data) => {
                let start = offset as usize;
                Ok(be_value(&data[start..start + size]))
            }
            Backing::Mmio(handler) => {
                let ctx = MmioCtx {
                    addr,
                    pc: self.pc.get(),
                };
                handler.borrow_mut().read(&ctx, offset, size)
            }
        }
    }

    /// Naturally-aligned big-endian write of 1, 2 or 4 bytes.
    pub fn write(&mut self, addr: u32, value: u32, size: usize, mode: Access) -> Result<(), BusFault> {
        let idx = self.check(addr, size, mode, true).map_err(|f| match f {
            BusFault::DataWrite { addr, pc, .. } => BusFault::DataWrite { addr, pc, data: value },
            other => other,
        })?;
        let pc = self.pc.get();
        let region = &mut self.regions[idx];
        let offset = addr - region.base;
        match &mut region.backing {
            Backing::Ram(data) => {
                let start = offset as usize;
                data[start..start + size].copy_from_slice(&be_bytes(value, size)[..size]);
                Ok(())
            }
            Backing::Mmio(handler) => {
                let ctx = MmioCtx { addr, pc };
                handler.borrow_mut().write(&ctx, offset, size, value)
            }
        }
    }

    pub fn read_u32(&self, addr: u32, mode: Access) -> Result<u32, BusFault> {
        self.read(addr, 4, mode)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32, mode: Access) -> Result<(), BusFault> {
        self.write(addr, value, 4, mode)
    }

    /// Copy raw bytes out of a bus-owned RAM block. This is the emulator's
    /// own low-level view (loaders, reset logic); crossing a region boundary
    /// or touching an MMIO window is an emulator bug and panics.
    pub fn read_physical(&self, addr: u32, buf: &mut [u8]) {
        let (data, start) = self.ram_slice(addr, buf.len());
        buf.copy_from_slice(&data[start..start + buf.len()]);
    }

    /// Raw-byte counterpart of [`MemoryBus::read_physical`] for writes.
    pub fn write_physical(&mut self, addr: u32, bytes: &[u8]) {
        let idx = self
            .lookup(addr)
            .unwrap_or_else(|| panic!("write_physical outside any region: {addr:#010x}"));
        let region = &mut self.regions[idx];
        let offset = (addr - region.base) as usize;
        match &mut region.backing {
            Backing::Ram(data) => {
                assert!(
                    offset + bytes.len() <= data.len(),
                    "write_physical crosses region {} end",
                    region.name
                );
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
            Backing::Mmio(_) => panic!("write_physical into MMIO region {}", region.name),
        }
    }

    /// Zero-fill `[addr, addr + len)` of a RAM block (reset support).
    pub fn fill_physical(&mut self, addr: u32, len: usize, value: u8) {
        if len == 0 {
            return;
        }
        let idx = self
            .lookup(addr)
            .unwrap_or_else(|| panic!("fill_physical outside any region: {addr:#010x}"));
        let region = &mut self.regions[idx];
        let offset = (addr - region.base) as usize;
        match &mut region.backing {
            Backing::Ram(data) => {
                assert!(offset + len <= data.len(), "fill_physical crosses region end");
                data[offset..offset + len].fill(value);
            }
            Backing::Mmio(_) => panic!("fill_physical into MMIO region {}", region.name),
        }
    }

    fn ram_slice(&self, addr: u32, len: usize) -> (&Vec<u8>, usize) {
        let idx = self
            .lookup(addr)
            .unwrap_or_else(|| panic!("read_physical outside any region: {addr:#010x}"));
        let region = &self.regions[idx];
        let offset = (addr - region.base) as usize;
        match &region.backing {
            Backing::Ram(data) => {
                assert!(
                    offset + len <= data.len(),
                    "read_physical crosses region {} end",
                    region.name
                );
                (data, offset)
            }
            Backing::Mmio(_) => panic!("read_physical from MMIO region {}", region.name),
        }
    }

    /// Sum of mapped bytes across all regions (diagnostics and tests).
    pub fn mapped_bytes(&self) -> u64 {
        self.regions.iter().map(|r| u64::from(r.size)).sum()
    }

    /// `(name, base, size)` of every mapped region, base-ordered.
    pub fn regions(&self) -> impl Iterator<Item = (&'static str, u32, u32)> + '_ {
        self.regions.iter().map(|r| (r.name, r.base, r.size))
    }
}
