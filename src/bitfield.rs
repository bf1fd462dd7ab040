//! Bit-exact peripheral register models.
//!
//! A [`PeriphRegister`] is a 32-bit register carved into named fields, each
//! with one of a small set of write semantics (plain, constant,
//! write-one-to-clear). A [`RegisterSet`] is a sparse, offset-keyed
//! collection of registers and byte arrays forming a peripheral's
//! programming model: reads and writes land on whole fields, straddling
//! accesses fault, reads/writes outside any field fault, and `reset()`
//! restores every recorded default.
//!
//! Field-level parse callbacks are reported as *write effects*: `write()`
//! returns the list of registers (and array element ranges) that were
//! touched so the owning peripheral can react, which replaces the dynamic
//! callback table of a looser language.

use byteorder::{BigEndian, ByteOrder};

/// Write semantics of a register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Read/write; reset restores the default.
    Plain,
    /// Ignores writes; mutated only through `override_field`.
    Const,
    /// Write-one-to-clear.
    W1c,
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: &'static str,
    shift: u32,
    width: u32,
    kind: FieldKind,
    default: u32,
}

impl FieldSpec {
    fn mask(&self) -> u32 {
        (((1u64 << self.width) - 1) as u32) << self.shift
    }
}

/// A 32-bit register split into named bit fields, declared MSB-first.
#[derive(Debug, Clone)]
pub struct PeriphRegister {
    fields: Vec<FieldSpec>,
    value: u32,
    reset_value: u32,
    plain_mask: u32,
    w1c_mask: u32,
}

/// Builder for [`PeriphRegister`]; fields are consumed from bit 31 down.
pub struct RegBuilder {
    fields: Vec<FieldSpec>,
    remaining: u32,
}

impl RegBuilder {
    fn push(mut self, name: &'static str, width: u32, kind: FieldKind, default: u32) -> Self {
        assert!(width <= self.remaining, "register field overflow: {}", name);
        let shift = self.remaining - width;
        assert!(default < (1u64 << width) as u32 || width == 32);
        self.fields.push(FieldSpec { name, shift, width, kind, default });
        self.remaining = shift;
        self
    }

    /// Plain read/write field with a zero default.
    pub fn bits(self, name: &'static str, width: u32) -> Self {
        self.push(name, width, FieldKind::Plain, 0)
    }

    /// Plain field with a non-zero reset default.
    pub fn bits_default(self, name: &'static str, width: u32, default: u32) -> Self {
        self.push(name, width, FieldKind::Plain, default)
    }

    /// Constant field; write-immune.
    pub fn constant(self, name: &'static str, width: u32, value: u32) -> Self {
        self.push(name, width, FieldKind::Const, value)
    }

    /// Write-one-to-clear field.
    pub fn w1c(self, name: &'static str, width: u32) -> Self {
        self.push(name, width, FieldKind::W1c, 0)
    }

    /// Reserved padding (reads zero, ignores writes).
    pub fn pad(self, width: u32) -> Self {
        self.push("_", width, FieldKind::Const, 0)
    }

    pub fn build(self) -> PeriphRegister {
        assert_eq!(self.remaining, 0, "register fields must cover 32 bits");
        let mut reset_value = 0u32;
        let mut plain_mask = 0u32;
        let mut w1c_mask = 0u32;
        for f in &self.fields {
            reset_value |= f.default << f.shift;
            match f.kind {
                FieldKind::Plain => plain_mask |= f.mask(),
                FieldKind::W1c => w1c_mask |= f.mask(),
                FieldKind::Const => {}
            }
        }
        PeriphRegister {
            fields: self.fields,
            value: reset_value,
            reset_value,
            plain_mask,
            w1c_mask,
        }
    }
}

impl PeriphRegister {
    pub fn builder() -> RegBuilder {
        RegBuilder { fields: Vec::new(), remaining: 32 }
    }

    /// A register that is a single 32-bit plain field.
    pub fn plain32(name: &'static str, default: u32) -> Self {
        Self::builder().bits_default(name, 32, default).build()
    }

    pub fn read(&self) -> u32 {
        self.value
    }

    /// Apply a programmed write with per-field semantics.
    pub fn write(&mut self, val: u32) {
        let mut v = self.value;
        v = (v & !self.plain_mask) | (val & self.plain_mask);
        v &= !(val & self.w1c_mask);
        self.value = v;
    }

    fn spec(&self, name: &'static str) -> &FieldSpec {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("no field named {}", name))
    }

    /// Current value of a named field.
    pub fn field(&self, name: &'static str) -> u32 {
        let f = self.spec(name);
        (self.value >> f.shift) & (f.mask() >> f.shift)
    }

    /// Internal state update that bypasses write semantics.
    pub fn override_field(&mut self, name: &'static str, val: u32) {
        let f = self.spec(name);
        let mask = f.mask();
        let shift = f.shift;
        self.value = (self.value & !mask) | ((val << shift) & mask);
    }

    /// Restore every field to its recorded default.
    pub fn reset(&mut self) {
        self.value = self.reset_value;
    }
}

/// One slot of a register set.
#[derive(Debug, Clone)]
pub enum Slot {
    /// Normal read/write register.
    Reg(PeriphRegister),
    /// Register that rejects programmed writes.
    ReadOnly(PeriphRegister),
    /// Raw byte storage with a recorded default image.
    Bytes { data: Vec<u8>, default: Vec<u8> },
    /// Register that exists in the memory map but is not implemented.
    Placeholder { size: u32 },
}

impl Slot {
    fn len(&self) -> u32 {
        match self {
            Slot::Reg(_) | Slot::ReadOnly(_) => 4,
            Slot::Bytes { data, .. } => data.len() as u32,
            Slot::Placeholder { size } => *size,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: &'static str,
    offset: u32,
    slot: Slot,
}

/// Faults raised by register-set access; `transferred` counts the bytes
/// moved before the fault, as the bus-error records require.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessFault {
    /// No field at the touched offset.
    Reserved { transferred: usize },
    /// Write landed on a read-only register.
    ReadOnly { transferred: usize },
    /// Access straddles a field boundary in an unsupported way.
    Unaligned { transferred: usize },
    /// Placeholder register touched.
    Unimplemented { transferred: usize },
}

/// A register (or array element range) touched by a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touched {
    pub reg: &'static str,
    /// `Some((first_index, len))` when an element range of a byte array was
    /// written; `None` for whole-register writes.
    pub elements: Option<(usize, usize)>,
}

/// The effect report of a successful write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteEffects {
    pub touched: Vec<Touched>,
}

impl WriteEffects {
    pub fn touched_reg(&self, name: &'static str) -> bool {
        self.touched.iter().any(|t| t.reg == name)
    }
}

/// Sparse, offset-keyed register container for one peripheral.
#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    entries: Vec<Entry>,
}

impl RegisterSet {
    pub fn new() -> Self {
        RegisterSet { entries: Vec::new() }
    }

    fn insert(&mut self, name: &'static str, offset: u32, slot: Slot) {
        let end = offset + slot.len();
        for e in &self.entries {
            let e_end = e.offset + e.slot.len();
            assert!(
                end <= e.offset || offset >= e_end,
                "register {} overlaps {}",
                name,
                e.name
            );
        }
        self.entries.push(Entry { name, offset, slot });
        self.entries.sort_by_key(|e| e.offset);
    }

    pub fn add_reg(&mut self, offset: u32, name: &'static str, reg: PeriphRegister) {
        self.insert(name, offset, Slot::Reg(reg));
    }

    pub fn add_ro_reg(&mut self, offset: u32, name: &'static str, reg: PeriphRegister) {
        self.insert(name, offset, Slot::ReadOnly(reg));
    }

    pub fn add_bytes(&mut self, offset: u32, name: &'static str, default: Vec<u8>) {
        self.insert(name, offset, Slot::Bytes { data: default.clone(), default });
    }

    pub fn add_placeholder(&mut self, offset: u32, name: &'static str, size: u32) {
        self.insert(name, offset, Slot::Placeholder { size });
    }

    fn entry_at(&self, offset: u32) -> Option<(usize, u32)> {
        for (i, e) in self.entries.iter().enumerate() {
            if offset >= e.offset && offset < e.offset + e.slot.len() {
                return Some((i, offset - e.offset));
            }
        }
        None
    }

    /// Borrow a register by name (panics on unknown name; peripherals own
    /// their schemas).
    pub fn reg(&self, name: &'static str) -> &PeriphRegister {
        match self.entries.iter().find(|e| e.name == name).map(|e| &e.slot) {
            Some(Slot::Reg(r)) | Some(Slot::ReadOnly(r)) => r,
            _ => panic!("no register named {}", name),
        }
    }

    pub fn reg_mut(&mut self, name: &'static str) -> &mut PeriphRegister {
        match self
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .map(|e| &mut e.slot)
        {
            Some(Slot::Reg(r)) | Some(Slot::ReadOnly(r)) => r,
            _ => panic!("no register named {}", name),
        }
    }

    pub fn bytes(&self, name: &'static str) -> &[u8] {
        match self.entries.iter().find(|e| e.name == name).map(|e| &e.slot) {
            Some(Slot::Bytes { data, .. }) => data,
            _ => panic!("no byte array named {}", name),
        }
    }

    pub fn bytes_mut(&mut self, name: &'static str) -> &mut Vec<u8> {
        match self
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .map(|e| &mut e.slot)
        {
            Some(Slot::Bytes { data, .. }) => data,
            _ => panic!("no byte array named {}", name),
        }
    }

    /// Shorthand for `reg(name).field(field)`.
    pub fn field(&self, name: &'static str, field: &'static str) -> u32 {
        self.reg(name).field(field)
    }

    /// Read `size` bytes starting at `offset`, emitting consecutive whole
    /// fields big-endian.
    pub fn read(&self, offset: u32, size: usize) -> Result<Vec<u8>, AccessFault> {
        let mut out = Vec::with_capacity(size);
        let mut pos = offset;
        while out.len() < size {
            let (i, sub) = self
                .entry_at(pos)
                .ok_or(AccessFault::Reserved { transferred: out.len() })?;
            let e = &self.entries[i];
            match &e.slot {
                Slot::Reg(r) | Slot::ReadOnly(r) => {
                    if sub != 0 {
                        return Err(AccessFault::Unaligned { transferred: out.len() });
                    }
                    let mut buf = [0u8; 4];
                    BigEndian::write_u32(&mut buf, r.read());
                    out.extend_from_slice(&buf);
                    pos += 4;
                }
                Slot::Bytes { data, .. } => {
                    let avail = data.len() - sub as usize;
                    let take = avail.min(size - out.len());
                    out.extend_from_slice(&data[sub as usize..sub as usize + take]);
                    pos += take as u32;
                }
                Slot::Placeholder { .. } => {
                    return Err(AccessFault::Unimplemented { transferred: out.len() });
                }
            }
        }
        if out.len() > size {
            return Err(AccessFault::Unaligned { transferred: 0 });
        }
        Ok(out)
    }

    /// Write `bytes` starting at `offset`, parsing consecutive whole fields
    /// with their per-field semantics. Returns the touched-field report.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<WriteEffects, AccessFault> {
        let mut effects = WriteEffects::default();
        let mut done = 0usize;
        let mut pos = offset;
        while done < bytes.len() {
            let (i, sub) = self
                .entry_at(pos)
                .ok_or(AccessFault::Reserved { transferred: done })?;
            let e = &mut self.entries[i];
            let name = e.name;
            match &mut e.slot {
                Slot::Reg(r) => {
                    if sub != 0 || bytes.len() - done < 4 {
                        return Err(AccessFault::Unaligned { transferred: done });
                    }
                    let val = BigEndian::read_u32(&bytes[done..done + 4]);
                    r.write(val);
                    effects.touched.push(Touched { reg: name, elements: None });
                    done += 4;
                    pos += 4;
                }
                Slot::ReadOnly(_) => {
                    return Err(AccessFault::ReadOnly { transferred: done });
                }
                Slot::Bytes { data, .. } => {
                    let avail = data.len() - sub as usize;
                    let take = avail.min(bytes.len() - done);
                    data[sub as usize..sub as usize + take]
                        .copy_from_slice(&bytes[done..done + take]);
                    effects.touched.push(Touched {
                        reg: name,
                        elements: Some((sub as usize, take)),
                    });
                    done += take;
                    pos += take as u32;
                }
                Slot::Placeholder { .. } => {
                    return Err(AccessFault::Unimplemented { transferred: done });
                }
            }
        }
        Ok(effects)
    }

    /// Restore every register and byte array to its recorded default.
    pub fn reset(&mut self) {
        for e in &mut self.entries {
            match &mut e.slot {
                Slot::Reg(r) | Slot::ReadOnly(r) => r.reset(),
                Slot::Bytes { data, default } => data.copy_from_slice(default),
                Slot::Placeholder { .. } => {}
            }
        }
    }
}
