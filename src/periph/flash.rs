//! MPC5674F flash controller: two arrays (A and B) sharing a 4 MB main
//! address space plus a 16 KB shadow block each.
//!
//! Block map (main flash):
//!
//! | range                     | blocks        | array |
//! |---------------------------|---------------|-------|
//! | 0x000000 - 0x03FFFF       | L0-L9 (LMSR)  | A     |
//! | 0x040000 - 0x07FFFF       | M0-M1 (LMSR)  | A     |
//! | 0x080000 - 0x0FFFFF       | L0, M0 (LMSR) | B     |
//! | 0x100000 - 0x3FFFFF       | H0-H5 (HSR)   | A + B interleaved |
//!
//! High blocks interleave the two arrays on 16-byte granularity: array A
//! owns the first 16 bytes of each 32-byte line, array B the second.
//!
//! Programming: set MCR[PGM], write 4-byte words into the target block
//! (captured as pending data when the block is unlocked, silently
//! discarded when locked), then set MCR[EHV] to commit. Erasing: set
//! MCR[ERS], select blocks in LMSR/HSR, write anywhere in the same array
//! *outside* the selected blocks (the interlock write), then set MCR[EHV].
//! Lock registers only accept writes after a one-shot magic unlock
//! (LMLR 0xA1A11111, HLR 0xB2B22222, SLMLR 0xC3C33333); reset re-arms the
//! write protection and ANDs the shadow-resident default words back into
//! the lock registers.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::bitfield::{AccessFault, PeriphRegister, RegisterSet};
use crate::exc::{ExcKind, ExcResult, Exception};
use crate::periph::Peripheral;

pub const MAIN_SIZE: usize = 0x0040_0000;
pub const SHADOW_SIZE: usize = 0x4000;

/// Physical base addresses of the flash windows.
pub const MAIN_ADDR: u32 = 0x0000_0000;
pub const SHADOW_A_ADDR: u32 = 0x00FF_C000;
pub const SHADOW_B_ADDR: u32 = 0x00EF_C000;

/// Shadow A configuration block: serial passcode, censorship control,
/// serial boot control.
pub const SHADOW_DEFAULTS_OFFSET: usize = 0x3DD8;
pub const SHADOW_DEFAULTS: [u8; 12] = [
    0xFE, 0xED, 0xFA, 0xCE, 0xCA, 0xFE, 0xBE, 0xEF, 0x55, 0xAA, 0x55, 0xAA,
];

// Shadow-resident default words ANDed into the lock registers at reset.
const A_LMLR_DEFAULT_OFFSET: usize = 0x3DE8;
const A_HLR_DEFAULT_OFFSET: usize = 0x3DF0;
const A_SLMLR_DEFAULT_OFFSET: usize = 0x3DF8;
const A_BIUCR2_DEFAULT_OFFSET: usize = 0x3E00;
const B_LMLR_DEFAULT_OFFSET: usize = 0x1DE8;
const B_HLR_DEFAULT_OFFSET: usize = 0x1DF0;
const B_SLMLR_DEFAULT_OFFSET: usize = 0x1DF8;

/// Magic values arming the lock-register write enables.
pub const LMLR_UNLOCK: u32 = 0xA1A1_1111;
pub const HLR_UNLOCK: u32 = 0xB2B2_2222;
pub const SLMLR_UNLOCK: u32 = 0xC3C3_3333;

/// Which flash array a register access or block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashBank {
    A,
    B,
}

/// Storage addressed by a main-array offset plus owning array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    /// Low/mid block selected by an LMSR bit.
    LowMid { lmsr_bit: u32 },
    /// High block selected by an HSR bit, interleaved across arrays.
    High { hsr_bit: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Block {
    start: u32,
    end: u32,
    bank: Option<FlashBank>,
    kind: BlockKind,
}

/// Main-flash block map. High blocks carry `bank: None`; ownership within
/// them is decided per 16-byte line.
const BLOCKS: &[Block] = &[
    Block { start: 0x0000_0000, end: 0x0000_4000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0001 } },
    Block { start: 0x0000_4000, end: 0x0000_8000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0002 } },
    Block { start: 0x0000_8000, end: 0x0000_C000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0004 } },
    Block { start: 0x0000_C000, end: 0x0001_0000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0008 } },
    Block { start: 0x0001_0000, end: 0x0001_4000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0010 } },
    Block { start: 0x0001_4000, end: 0x0001_8000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0020 } },
    Block { start: 0x0001_8000, end: 0x0001_C000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0040 } },
    Block { start: 0x0001_C000, end: 0x0002_0000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0080 } },
    Block { start: 0x0002_0000, end: 0x0003_0000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0100 } },
    Block { start: 0x0003_0000, end: 0x0004_0000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0200 } },
    Block { start: 0x0004_0000, end: 0x0006_0000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0001_0000 } },
    Block { start: 0x0006_0000, end: 0x0008_0000, bank: Some(FlashBank::A), kind: BlockKind::LowMid { lmsr_bit: 0x0002_0000 } },
    Block { start: 0x0008_0000, end: 0x000C_0000, bank: Some(FlashBank::B), kind: BlockKind::LowMid { lmsr_bit: 0x0000_0001 } },
    Block { start: 0x000C_0000, end: 0x0010_0000, bank: Some(FlashBank::B), kind: BlockKind::LowMid { lmsr_bit: 0x0001_0000 } },
    Block { start: 0x0010_0000, end: 0x0018_0000, bank: None, kind: BlockKind::High { hsr_bit: 0x0000_0001 } },
    Block { start: 0x0018_0000, end: 0x0020_0000, bank: None, kind: BlockKind::High { hsr_bit: 0x0000_0002 } },
    Block { start: 0x0020_0000, end: 0x0028_0000, bank: None, kind: BlockKind::High { hsr_bit: 0x0000_0004 } },
    Block { start: 0x0028_0000, end: 0x0030_0000, bank: None, kind: BlockKind::High { hsr_bit: 0x0000_0008 } },
    Block { start: 0x0030_0000, end: 0x0038_0000, bank: None, kind: BlockKind::High { hsr_bit: 0x0000_0010 } },
    Block { start: 0x0038_0000, end: 0x0040_0000, bank: None, kind: BlockKind::High { hsr_bit: 0x0000_0020 } },
];

fn find_block(offset: u32) -> &'static Block {
    BLOCKS
        .iter()
        .find(|b| offset >= b.start && offset < b.end)
        .expect("offset outside main flash")
}

/// Array that services a main-flash write at `offset`; high blocks
/// interleave on 16-byte lines.
fn owner(offset: u32) -> FlashBank {
    match find_block(offset).bank {
        Some(bank) => bank,
        None => {
            if offset & 0x10 == 0 {
                FlashBank::A
            } else {
                FlashBank::B
            }
        }
    }
}

fn mcr_reg(bank: FlashBank) -> PeriphRegister {
    // A: LAS=0b100; B: LAS=0b000, MAS=1
    let (las, mas) = match bank {
        FlashBank::A => (0b100, 0),
        FlashBank::B => (0b000, 1),
    };
    PeriphRegister::builder()
        .pad(5)
        .constant("size", 3, 0b101)
        .pad(1)
        .constant("las", 3, las)
        .pad(3)
        .constant("mas", 1, mas)
        .w1c("eer", 1)
        .w1c("rwe", 1)
        .w1c("sbc", 1)
        .pad(1)
        .constant("peas", 1, 0)
        .constant("done", 1, 1)
        .constant("peg", 1, 1)
        .pad(4)
        .bits("pgm", 1)
        .bits("psus", 1)
        .bits("ers", 1)
        .bits("esus", 1)
        .bits("ehv", 1)
        .build()
}

fn lmlr_reg() -> PeriphRegister {
    PeriphRegister::builder()
        .constant("lme", 1, 0)
        .pad(10)
        .bits_default("slock", 1, 1)
        .pad(2)
        .bits_default("mlock", 2, 0b11)
        .pad(6)
        .bits_default("llock", 10, 0x3FF)
        .build()
}

fn hlr_reg() -> PeriphRegister {
    PeriphRegister::builder()
        .constant("hbe", 1, 0)
        .pad(21)
        .bits_default("hlock", 10, 0x3FF)
        .build()
}

fn slmlr_reg() -> PeriphRegister {
    PeriphRegister::builder()
        .constant("sle", 1, 0)
        .pad(10)
        .bits_default("sslock", 1, 1)
        .pad(2)
        .bits_default("smlock", 2, 0b11)
        .pad(6)
        .bits_default("sllock", 10, 0x3FF)
        .build()
}

/// Per-array controller state.
struct FlashArray {
    bank: FlashBank,
    regs: RegisterSet,
    lmlr_we: bool,
    hlr_we: bool,
    slmlr_we: bool,
    /// 4-byte words captured while MCR[PGM] is set, keyed by absolute
    /// physical address.
    pending: Vec<(u32, [u8; 4])>,
    /// Set by a valid interlock write during an erase setup.
    interlock: bool,
}

impl FlashArray {
    fn new(bank: FlashBank) -> Self {
        let mut regs = RegisterSet::new();
        regs.add_reg(0x00, "mcr", mcr_reg(bank));
        regs.add_reg(0x04, "lmlr", lmlr_reg());
        regs.add_reg(0x08, "hlr", hlr_reg());
        regs.add_reg(0x0C, "slmlr", slmlr_reg());
        regs.add_reg(0x10, "lmsr", PeriphRegister::builder().pad(14).bits("msel", 2).pad(6).bits("lsel", 10).build());
        regs.add_reg(0x14, "hsr", PeriphRegister::builder().pad(26).bits("hsel", 6).build());
        regs.add_ro_reg(0x18, "ar", PeriphRegister::builder().constant("sad", 1, 0).constant("addr", 31, 0).build());
        if bank == FlashBank::A {
            regs.add_reg(
                0x1C,
                "biucr",
                PeriphRegister::builder()
                    .pad(11)
                    .bits("m8pfe", 1)
                    .bits("m6pfe", 1)
                    .bits("m5pfe", 1)
                    .bits("m4pfe", 1)
                    .bits("m0pfe", 1)
                    .bits_default("apc", 3, 0b111)
                    .bits_default("wwsc", 2, 0b11)
                    .bits_default("rwsc", 3, 0b111)
                    .pad(1)
                    .bits("dpfen", 1)
                    .pad(1)
                    .bits("ifpfen", 1)
                    .pad(1)
                    .bits("pflim", 2)
                    .bits("bfen", 1)
                    .build(),
            );
            regs.add_reg(
                0x20,
                "biuapr",
                PeriphRegister::builder()
                    .constant("_ones0", 14, 0x3FFF)
                    .bits_default("m8ap", 2, 0b11)
                    .constant("_ones1", 2, 0b11)
                    .bits_default("m6ap", 2, 0b11)
                    .bits_default("m5ap", 2, 0b11)
                    .bits_default("m4ap", 2, 0b11)
                    .constant("_ones2", 6, 0x3F)
                    .bits_default("m0ap", 2, 0b11)
                    .build(),
            );
            regs.add_reg(
                0x24,
                "biucr2",
                PeriphRegister::builder().bits_default("lbcfg", 2, 0b11).constant("ones", 30, 0x3FFF_FFFF).build(),
            );
        }
        regs.add_reg(
            0x3C,
            "ut0",
            PeriphRegister::builder()
                .bits("ute", 1)
                .bits("scbe", 1)
                .pad(6)
                .bits("dsi", 8)
                .pad(8)
                .bits_default("ea", 1, 1)
                .pad(1)
                .bits("mre", 1)
                .bits("mrv", 1)
                .bits("eie", 1)
                .bits("ais", 1)
                .bits("aie", 1)
                .bits_default("aid", 1, 1)
                .build(),
        );
        regs.add_reg(0x40, "ut1", PeriphRegister::plain32("dai", 0));
        regs.add_reg(0x44, "ut2", PeriphRegister::plain32("dai", 0));

        FlashArray {
            bank,
            regs,
            lmlr_we: false,
            hlr_we: false,
            slmlr_we: false,
            pending: Vec::new(),
            interlock: false,
        }
    }

    /// Selected-block test for an erase in progress.
    fn block_selected(&self, offset: u32) -> bool {
        let block = find_block(offset);
        match block.kind {
            BlockKind::LowMid { lmsr_bit } => {
                block.bank == Some(self.bank) && self.regs.reg("lmsr").read() & lmsr_bit != 0
            }
            BlockKind::High { hsr_bit } => self.regs.reg("hsr").read() & hsr_bit != 0,
        }
    }

    /// Lock check for a main-array offset: a block can be modified only
    /// when both its LMLR and SLMLR bits (or its HLR bit) are clear.
    fn block_locked(&self, offset: u32) -> bool {
        let block = find_block(offset);
        match block.kind {
            BlockKind::LowMid { lmsr_bit } => {
                let (lock_field, bit) = if lmsr_bit >= 0x1_0000 {
                    ("mlock", lmsr_bit >> 16)
                } else {
                    ("llock", lmsr_bit)
                };
                let lmlr = self.regs.reg("lmlr");
                let slmlr = self.regs.reg("slmlr");
                let primary = match lock_field {
                    "mlock" => lmlr.field("mlock") & bit != 0,
                    _ => lmlr.field("llock") & bit != 0,
                };
                let secondary = match lock_field {
                    "mlock" => slmlr.field("smlock") & bit != 0,
                    _ => slmlr.field("sllock") & bit != 0,
                };
                primary || secondary
            }
            BlockKind::High { hsr_bit } => self.regs.reg("hlr").field("hlock") & hsr_bit != 0,
        }
    }

    fn shadow_locked(&self) -> bool {
        self.regs.field("lmlr", "slock") != 0 || self.regs.field("slmlr", "sslock") != 0
    }
}

/// The flash controller: both arrays plus the backing storage.
pub struct FlashController {
    /// Main array bytes (shared 4 MB address space).
    pub main: Vec<u8>,
    pub shadow_a: Vec<u8>,
    pub shadow_b: Vec<u8>,
    a: FlashArray,
    b: FlashArray,
}

/// Storage target of a flash load or program operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashDevice {
    Main,
    ShadowA,
    ShadowB,
}

impl FlashController {
    pub fn new() -> Self {
        let mut fc = FlashController {
            main: vec![0xFF; MAIN_SIZE],
            shadow_a: vec![0xFF; SHADOW_SIZE],
            shadow_b: vec![0xFF; SHADOW_SIZE],
            a: FlashArray::new(FlashBank::A),
            b: FlashArray::new(FlashBank::B),
        };
        fc.install_shadow_defaults();
        fc
    }

    fn install_shadow_defaults(&mut self) {
        let start = SHADOW_DEFAULTS_OFFSET;
        self.shadow_a[start..start + SHADOW_DEFAULTS.len()].copy_from_slice(&SHADOW_DEFAULTS);
    }

    fn array(&self, bank: FlashBank) -> &FlashArray {
        match bank {
            FlashBank::A => &self.a,
            FlashBank::B => &self.b,
        }
    }

    fn array_mut(&mut self, bank: FlashBank) -> &mut FlashArray {
        match bank {
            FlashBank::A => &mut self.a,
            FlashBank::B => &mut self.b,
        }
    }

    /// Load a firmware blob into the selected storage at `offset`.
    pub fn load(&mut self, dev: FlashDevice, data: &[u8], offset: usize) {
        let target = match dev {
            FlashDevice::Main => &mut self.main,
            FlashDevice::ShadowA => &mut self.shadow_a,
            FlashDevice::ShadowB => &mut self.shadow_b,
        };
        target[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_main(&self, offset: u32, size: usize) -> Vec<u8> {
        self.main[offset as usize..offset as usize + size].to_vec()
    }

    pub fn read_shadow(&self, bank: FlashBank, offset: u32, size: usize) -> Vec<u8> {
        let shadow = match bank {
            FlashBank::A => &self.shadow_a,
            FlashBank::B => &self.shadow_b,
        };
        shadow[offset as usize..offset as usize + size].to_vec()
    }

    /// Register state helpers used by tests and the BAM.
    pub fn field(&self, bank: FlashBank, reg: &'static str, field: &'static str) -> u32 {
        self.array(bank).regs.field(reg, field)
    }

    pub fn reg_value(&self, bank: FlashBank, reg: &'static str) -> u32 {
        self.array(bank).regs.reg(reg).read()
    }

    /// CPU write into the main flash window. Routed to the owning array's
    /// program/erase state machine; the backing bytes only change at the
    /// EHV commit. Supervisor-scope writes (the opcode writer, flash
    /// internals) land directly in the backing.
    pub fn write_main(
        &mut self,
        offset: u32,
        bytes: &[u8],
        pc: u32,
        va: u32,
        supervisor: bool,
    ) -> ExcResult<()> {
        if supervisor {
            let off = offset as usize;
            self.main[off..off + bytes.len()].copy_from_slice(bytes);
            return Ok(());
        }
        let bank = owner(offset);
        let selected = self.array(bank).block_selected(offset);
        let locked = self.array(bank).block_locked(offset);
        let arr = self.array_mut(bank);

        if arr.regs.field("mcr", "ers") != 0 {
            // erase interlock: any write in the same array outside the
            // selected blocks arms the erase; a write inside the target
            // block is illegal and does not arm it
            if !selected {
                debug!("flash {:?}: erase interlock at 0x{:08x}", bank, va);
                arr.interlock = true;
            } else {
                warn!("flash {:?}: interlock inside selected block 0x{:08x}", bank, va);
            }
            return Ok(());
        }
        if arr.regs.field("mcr", "pgm") != 0 {
            if bytes.len() != 4 || offset % 4 != 0 {
                return Err(Exception::new(ExcKind::Alignment { pc, va, transferred: 0 }));
            }
            if locked {
                debug!("flash {:?}: discarding program data for locked block", bank);
                return Ok(());
            }
            let mut word = [0u8; 4];
            word.copy_from_slice(bytes);
            arr.pending.push((offset, word));
            return Ok(());
        }
        // no program or erase sequence active: NOR flash ignores the write
        warn!("flash {:?}: write 0x{:08x} outside program/erase sequence", bank, va);
        Ok(())
    }

    /// CPU write into a shadow block window.
    pub fn write_shadow(
        &mut self,
        bank: FlashBank,
        offset: u32,
        bytes: &[u8],
        pc: u32,
        va: u32,
        supervisor: bool,
    ) -> ExcResult<()> {
        if supervisor {
            let off = offset as usize;
            match bank {
                FlashBank::A => self.shadow_a[off..off + bytes.len()].copy_from_slice(bytes),
                FlashBank::B => self.shadow_b[off..off + bytes.len()].copy_from_slice(bytes),
            }
            return Ok(());
        }
        let locked = self.array(bank).shadow_locked();
        let arr = self.array_mut(bank);
        if arr.regs.field("mcr", "pgm") != 0 {
            if bytes.len() != 4 || offset % 4 != 0 {
                return Err(Exception::new(ExcKind::Alignment { pc, va, transferred: 0 }));
            }
            if locked {
                return Ok(());
            }
            let mut word = [0u8; 4];
            word.copy_from_slice(bytes);
            // tag shadow words with the block base so commit can route them
            let base = match bank {
                FlashBank::A => SHADOW_A_ADDR,
                FlashBank::B => SHADOW_B_ADDR,
            };
            arr.pending.push((base + offset, word));
            return Ok(());
        }
        warn!("flash {:?}: shadow write outside program sequence", bank);
        Ok(())
    }

    /// Register-file read for one array.
    pub fn regs_read(&mut self, bank: FlashBank, offset: u32, size: usize, pc: u32, va: u32) -> ExcResult<Vec<u8>> {
        self.array(bank).regs.read(offset, size).map_err(|fault| {
            let transferred = match fault {
                AccessFault::Reserved { transferred }
                | AccessFault::ReadOnly { transferred }
                | AccessFault::Unaligned { transferred }
                | AccessFault::Unimplemented { transferred } => transferred,
            };
            Exception::new(ExcKind::DataReadBusError { pc, va, data: vec![0; transferred] })
        })
    }

    /// Register-file write for one array. Returns the physical ranges
    /// whose backing bytes changed (program/erase commits) so the caller
    /// can invalidate cached opcodes.
    pub fn regs_write(
        &mut self,
        bank: FlashBank,
        offset: u32,
        bytes: &[u8],
        pc: u32,
        va: u32,
    ) -> ExcResult<Vec<(u32, u32)>> {
        if bytes.len() != 4 || offset % 4 != 0 {
            return Err(Exception::new(ExcKind::Alignment { pc, va, transferred: 0 }));
        }
        let val = BigEndian::read_u32(bytes);
        match offset {
            0x00 => return self.mcr_write(bank, val),
            0x04 => {
                let arr = self.array_mut(bank);
                if !arr.lmlr_we {
                    if val == LMLR_UNLOCK {
                        arr.lmlr_we = true;
                        arr.regs.reg_mut("lmlr").override_field("lme", 1);
                    }
                } else {
                    arr.regs.reg_mut("lmlr").write(val);
                }
            }
            0x08 => {
                let arr = self.array_mut(bank);
                if !arr.hlr_we {
                    if val == HLR_UNLOCK {
                        arr.hlr_we = true;
                        arr.regs.reg_mut("hlr").override_field("hbe", 1);
                    }
                } else {
                    arr.regs.reg_mut("hlr").write(val);
                }
            }
            0x0C => {
                let arr = self.array_mut(bank);
                if !arr.slmlr_we {
                    if val == SLMLR_UNLOCK {
                        arr.slmlr_we = true;
                        arr.regs.reg_mut("slmlr").override_field("sle", 1);
                    }
                } else {
                    arr.regs.reg_mut("slmlr").write(val);
                }
            }
            _ => {
                let arr = self.array_mut(bank);
                arr.regs.write(offset, bytes).map_err(|fault| {
                    let transferred = match fault {
                        AccessFault::Reserved { transferred }
                        | AccessFault::ReadOnly { transferred }
                        | AccessFault::Unaligned { transferred }
                        | AccessFault::Unimplemented { transferred } => transferred,
                    };
                    Exception::new(ExcKind::DataWriteBusError { pc, va, written: transferred })
                })?;
            }
        }
        Ok(Vec::new())
    }

    fn mcr_write(&mut self, bank: FlashBank, val: u32) -> ExcResult<Vec<(u32, u32)>> {
        let ehv_before = self.array(bank).regs.field("mcr", "ehv");
        self.array_mut(bank).regs.reg_mut("mcr").write(val);
        let arr = self.array(bank);
        let ehv = arr.regs.field("mcr", "ehv");
        let pgm = arr.regs.field("mcr", "pgm");
        let ers = arr.regs.field("mcr", "ers");

        let mut changed = Vec::new();
        if ehv != 0 && ehv_before == 0 {
            if pgm != 0 {
                changed = self.commit_program(bank);
            } else if ers != 0 {
                changed = self.commit_erase(bank);
            }
            let mcr = self.array_mut(bank).regs.reg_mut("mcr");
            mcr.override_field("done", 1);
            mcr.override_field("peg", 1);
        }
        if pgm == 0 && ers == 0 {
            let arr = self.array_mut(bank);
            arr.pending.clear();
            arr.interlock = false;
        }
        Ok(changed)
    }

    /// Apply the captured program words to the backing bytes. NOR
    /// programming can only clear bits.
    fn commit_program(&mut self, bank: FlashBank) -> Vec<(u32, u32)> {
        let pending = std::mem::take(&mut self.array_mut(bank).pending);
        let mut changed = Vec::with_capacity(pending.len());
        for (addr, word) in pending {
            let (target, base): (&mut Vec<u8>, u32) =
                if (SHADOW_A_ADDR..SHADOW_A_ADDR + SHADOW_SIZE as u32).contains(&addr) {
                    (&mut self.shadow_a, SHADOW_A_ADDR)
                } else if (SHADOW_B_ADDR..SHADOW_B_ADDR + SHADOW_SIZE as u32).contains(&addr) {
                    (&mut self.shadow_b, SHADOW_B_ADDR)
                } else {
                    (&mut self.main, MAIN_ADDR)
                };
            let off = (addr - base) as usize;
            for (i, &b) in word.iter().enumerate() {
                target[off + i] &= b;
            }
            changed.push((addr, 4));
        }
        debug!("flash {:?}: committed {} program words", bank, changed.len());
        changed
    }

    /// Erase every selected block back to 0xFF. Requires the interlock
    /// write; high blocks only erase the halves owned by this array.
    fn commit_erase(&mut self, bank: FlashBank) -> Vec<(u32, u32)> {
        if !std::mem::take(&mut self.array_mut(bank).interlock) {
            warn!("flash {:?}: EHV set without interlock write, no erase", bank);
            return Vec::new();
        }
        let lmsr = self.array(bank).regs.reg("lmsr").read();
        let hsr = self.array(bank).regs.reg("hsr").read();
        let mut changed = Vec::new();
        for block in BLOCKS {
            let erase = match block.kind {
                BlockKind::LowMid { lmsr_bit } => {
                    block.bank == Some(bank) && lmsr & lmsr_bit != 0
                }
                BlockKind::High { hsr_bit } => hsr & hsr_bit != 0,
            };
            if !erase || self.array(bank).block_locked(block.start) {
                continue;
            }
            match block.kind {
                BlockKind::LowMid { .. } => {
                    self.main[block.start as usize..block.end as usize].fill(0xFF);
                    changed.push((block.start, block.end - block.start));
                }
                BlockKind::High { .. } => {
                    // interleave: this array owns every other 16-byte line
                    let own = if bank == FlashBank::A { 0 } else { 0x10 };
                    let mut line = block.start;
                    while line < block.end {
                        let start = (line + own) as usize;
                        self.main[start..start + 0x10].fill(0xFF);
                        line += 0x20;
                    }
                    changed.push((block.start, block.end - block.start));
                }
            }
            debug!("flash {:?}: erased block 0x{:08x}-0x{:08x}", bank, block.start, block.end);
        }
        changed
    }
}

impl Default for FlashController {
    fn default() -> Self {
        Self::new()
    }
}

impl Peripheral for FlashController {
    fn name(&self) -> &'static str {
        "FLASH"
    }

    fn reset(&mut self) {
        for bank in [FlashBank::A, FlashBank::B] {
            let arr = self.array_mut(bank);
            arr.regs.reset();
            arr.lmlr_we = false;
            arr.hlr_we = false;
            arr.slmlr_we = false;
            arr.pending.clear();
            arr.interlock = false;
        }

        // the hardware's censorship/lock defaults: shadow words are ANDed
        // into the control registers at reset
        let a_words = [
            ("lmlr", A_LMLR_DEFAULT_OFFSET),
            ("hlr", A_HLR_DEFAULT_OFFSET),
            ("slmlr", A_SLMLR_DEFAULT_OFFSET),
            ("biucr2", A_BIUCR2_DEFAULT_OFFSET),
        ];
        for (reg, off) in a_words {
            let word = BigEndian::read_u32(&self.shadow_a[off..off + 4]);
            let merged = self.a.regs.reg(reg).read() & word;
            // the write-enable bits are const fields, so a plain write
            // merges exactly the lock bits
            self.a.regs.reg_mut(reg).write(merged);
        }
        let b_words = [
            ("lmlr", B_LMLR_DEFAULT_OFFSET),
            ("hlr", B_HLR_DEFAULT_OFFSET),
            ("slmlr", B_SLMLR_DEFAULT_OFFSET),
        ];
        for (reg, off) in b_words {
            let word = BigEndian::read_u32(&self.shadow_b[off..off + 4]);
            let merged = self.b.regs.reg(reg).read() & word;
            self.b.regs.reg_mut(reg).write(merged);
        }
    }
}
