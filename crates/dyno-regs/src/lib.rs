//! Declarative 32-bit peripheral registers.
//!
//! A register is a static layout of named fields, declared MSB-first in the
//! device's documented bit order, with widths summing to 32. Each field has a
//! kind that controls what a guest write through the bus may do to it:
//! read/write fields take the incoming bits, read-only and reserved fields
//! are preserved, and write-one-to-clear fields clear exactly the bits the
//! incoming word has set. The peripheral itself mutates fields with
//! [`Register::set`], which bypasses those rules.

mod block;

pub use block::{RegId, RegisterBlock};

/// Guest-write semantics of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Software read/write.
    Rw,
    /// Read-only; hardware updates it via [`Register::set`].
    Ro,
    /// Reserved; reads back its constant reset value.
    Resv,
    /// Write-one-to-clear event flag.
    W1c,
}

/// One field of a register layout.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub width: u32,
    pub kind: Kind,
    pub reset: u32,
}

/// Layout constructors, usable in `const` tables.
pub const fn rw(name: &'static str, width: u32) -> FieldDef {
    FieldDef { name, width, kind: Kind::Rw, reset: 0 }
}

pub const fn rw_init(name: &'static str, width: u32, reset: u32) -> FieldDef {
    FieldDef { name, width, kind: Kind::Rw, reset }
}

pub const fn ro(name: &'static str, width: u32) -> FieldDef {
    FieldDef { name, width, kind: Kind::Ro, reset: 0 }
}

pub const fn ro_init(name: &'static str, width: u32, reset: u32) -> FieldDef {
    FieldDef { name, width, kind: Kind::Ro, reset }
}

pub const fn resv(width: u32) -> FieldDef {
    FieldDef { name: "_", width, kind: Kind::Resv, reset: 0 }
}

pub const fn resv_init(width: u32, reset: u32) -> FieldDef {
    FieldDef { name: "_", width, kind: Kind::Resv, reset }
}

pub const fn w1c(name: &'static str, width: u32) -> FieldDef {
    FieldDef { name, width, kind: Kind::W1c, reset: 0 }
}

pub const fn w1c_init(name: &'static str, width: u32, reset: u32) -> FieldDef {
    FieldDef { name, width, kind: Kind::W1c, reset }
}

/// A 32-bit register instance: a static layout plus the packed current value
/// and per-instance reset values (some devices override a field's documented
/// reset, e.g. the flash MCR array-geometry fields).
#[derive(Clone)]
pub struct Register {
    layout: &'static [FieldDef],
    value: u32,
    resets: Vec<u32>,
}

impl Register {
    pub fn new(layout: &'static [FieldDef]) -> Register {
        let total: u32 = layout.iter().map(|f| f.width).sum();
        assert_eq!(total, 32, "register layout widths must sum to 32");
        let resets: Vec<u32> = layout.iter().map(|f| f.reset & mask(f.width)).collect();
        let mut reg = Register {
            layout,
            value: 0,
            resets,
        };
        reg.reset();
        reg
    }

    /// Shift of field `idx` within the packed word (fields are MSB-first).
    fn shift(&self, idx: usize) -> u32 {
        let consumed: u32 = self.layout[..=idx].iter().map(|f| f.width).sum();
        32 - consumed
    }

    /// Index of the named field. Panics on an unknown name: layouts are
    /// static and a miss is a programming error.
    pub fn field(&self, name: &str) -> usize {
        self.layout
            .iter()
            .position(|f| f.name == name)
            .unwrap_or_else(|| panic!("no field {name:?} in register layout"))
    }

    pub fn get(&self, idx: usize) -> u32 {
        (self.value >> self.shift(idx)) & mask(self.layout[idx].width)
    }

    pub fn get_by_name(&self, name: &str) -> u32 {
        self.get(self.field(name))
    }

    /// Internal (hardware-side) field update; ignores the field kind.
    pub fn set(&mut self, idx: usize, value: u32) {
        let m = mask(self.layout[idx].width);
        let shift = self.shift(idx);
        self.value = (self.value & !(m << shift)) | ((value & m) << shift);
    }

    pub fn set_by_name(&mut self, name: &str, value: u32) {
        self.set(self.field(name), value)
    }

    /// Override the value a later [`Register::reset`] restores for `idx`,
    /// and apply it immediately.
    pub fn set_reset(&mut self, idx: usize, value: u32) {
        self.resets[idx] = value & mask(self.layout[idx].width);
        self.set(idx, value);
    }

    /// The packed 32-bit word as the guest reads it.
    pub fn emit(&self) -> u32 {
        self.value
    }

    pub fn emit_bytes(&self) -> [u8; 4] {
        self.value.to_be_bytes()
    }

    /// Apply a guest write, honoring field kinds.
    pub fn parse(&mut self, incoming: u32) {
        let layout = self.layout;
        let mut shift = 32;
        for (idx, f) in layout.iter().enumerate() {
            shift -= f.width;
            let m = mask(f.width);
            let new = (incoming >> shift) & m;
            match f.kind {
                Kind::Rw => self.set(idx, new),
                Kind::Ro | Kind::Resv => {}
                Kind::W1c => {
                    let cur = self.get(idx);
                    self.set(idx, cur & !new);
                }
            }
        }
    }

    /// Restore every field to its (possibly overridden) reset value.
    pub fn reset(&mut self) {
        let mut value = 0u32;
        let mut shift = 32;
        for (f, reset) in self.layout.iter().zip(&self.resets) {
            shift -= f.width;
            value |= (reset & mask(f.width)) << shift;
        }
        self.value = value;
    }
}

fn mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &[FieldDef] = &[
        w1c("evt", 1),
        ro_init("status", 3, 0b101),
        resv(4),
        rw_init("ctl", 8, 0xAB),
        rw("data", 16),
    ];

    #[test]
    fn emit_packs_msb_first() {
        let reg = Register::new(LAYOUT);
        // status = 0b101 in bits 30:28, ctl = 0xAB in bits 23:16.
        assert_eq!(reg.emit(), 0x50AB_0000);
    }

    #[test]
    fn parse_honors_field_kinds() {
        let mut reg = Register::new(LAYOUT);
        reg.set_by_name("evt", 1);

        // RW fields take the new bits, RO/reserved are preserved, W1C clears
        // only where the incoming word has ones.
        reg.parse(0x8312_3456);
        assert_eq!(reg.get_by_name("evt"), 0);
        assert_eq!(reg.get_by_name("status"), 0b101);
        assert_eq!(reg.get_by_name("ctl"), 0x12);
        assert_eq!(reg.get_by_name("data"), 0x3456);

        // Writing zero to a W1C field leaves it latched.
        reg.set_by_name("evt", 1);
        reg.parse(0x0000_0000);
        assert_eq!(reg.get_by_name("evt"), 1);
        assert_eq!(reg.get_by_name("ctl"), 0);
    }

    #[test]
    fn reset_honors_per_instance_overrides() {
        let mut reg = Register::new(LAYOUT);
        reg.set_reset(reg.field("ctl"), 0x7F);
        reg.set_by_name("data", 0xFFFF);
        reg.reset();
        assert_eq!(reg.get_by_name("ctl"), 0x7F);
        assert_eq!(reg.get_by_name("data"), 0);
    }
}
