//! e200z7 MMU: a single 32-entry, fully-associative TLB with variable page
//! sizes from 1KB to 4GB.
//!
//! The zen core always operates on TLB 1 regardless of MAS0[TBSEL], so only
//! one TLB array is modelled. TLB maintenance instructions stage their
//! operands through the MAS0-MAS6 SPRs; translation matches on the
//! (address-space, translation-ID) pair with TID 0 acting as a global
//! wildcard.

use bitflags::bitflags;
use log::debug;

use crate::exc::{ExcKind, Exception};
use crate::regs::{msr_bits, spr, RegisterFile};

bitflags! {
    /// TLB entry attribute flags, arranged VLE | W | I | M | G | E.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TlbFlags: u32 {
        const E = 0b000001;
        const G = 0b000010;
        const M = 0b000100;
        const I = 0b001000;
        const W = 0b010000;
        const VLE = 0b100000;
    }
}

bitflags! {
    /// TLB entry permission bits, arranged SX | UX | SW | UW | SR | UR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TlbPerm: u32 {
        const UR = 0b000001;
        const SR = 0b000010;
        const UW = 0b000100;
        const SW = 0b001000;
        const UX = 0b010000;
        const SX = 0b100000;
    }
}

impl TlbFlags {
    pub const IG: TlbFlags = TlbFlags::I.union(TlbFlags::G);
    pub const WG: TlbFlags = TlbFlags::W.union(TlbFlags::G);
}

impl TlbPerm {
    pub const SU_RWX: TlbPerm = TlbPerm::from_bits_truncate(0b111111);
    pub const S_RWX: TlbPerm = TlbPerm::SX.union(TlbPerm::SW).union(TlbPerm::SR);
    pub const SU_RX: TlbPerm = TlbPerm::SX
        .union(TlbPerm::UX)
        .union(TlbPerm::SR)
        .union(TlbPerm::UR);
}

/// TLB page size codes (MAS1[TSIZ]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PageSize {
    Size1K = 0,
    Size2K = 1,
    Size4K = 2,
    Size8K = 3,
    Size16K = 4,
    Size32K = 5,
    Size64K = 6,
    Size128K = 7,
    Size256K = 8,
    Size512K = 9,
    Size1M = 10,
    Size2M = 11,
    Size4M = 12,
    Size8M = 13,
    Size16M = 14,
    Size32M = 15,
    Size64M = 16,
    Size128M = 17,
    Size256M = 18,
    Size512M = 19,
    Size1G = 20,
    Size2G = 21,
    Size4G = 22,
}

impl PageSize {
    pub fn from_code(code: u32) -> PageSize {
        match code & 0x1F {
            0 => PageSize::Size1K,
            1 => PageSize::Size2K,
            2 => PageSize::Size4K,
            3 => PageSize::Size8K,
            4 => PageSize::Size16K,
            5 => PageSize::Size32K,
            6 => PageSize::Size64K,
            7 => PageSize::Size128K,
            8 => PageSize::Size256K,
            9 => PageSize::Size512K,
            10 => PageSize::Size1M,
            11 => PageSize::Size2M,
            12 => PageSize::Size4M,
            13 => PageSize::Size8M,
            14 => PageSize::Size16M,
            15 => PageSize::Size32M,
            16 => PageSize::Size64M,
            17 => PageSize::Size128M,
            18 => PageSize::Size256M,
            19 => PageSize::Size512M,
            20 => PageSize::Size1G,
            21 => PageSize::Size2G,
            _ => PageSize::Size4G,
        }
    }

    /// Address comparison mask for this page size.
    pub fn mask(self) -> u32 {
        match self {
            PageSize::Size4G => 0,
            _ => !((1u32 << (10 + self as u32)) - 1),
        }
    }

    pub fn bytes(self) -> u64 {
        1u64 << (10 + self as u32)
    }
}

// MAS register field masks and shifts
pub const MAS0_TBSEL_MASK: u32 = 0x3000_0000;
pub const MAS0_ESEL_MASK: u32 = 0x001F_0000;
pub const MAS0_NV_MASK: u32 = 0x0000_001F;
pub const MAS0_TBSEL_SHIFT: u32 = 28;
pub const MAS0_ESEL_SHIFT: u32 = 16;

pub const MAS1_VALID_MASK: u32 = 0x8000_0000;
pub const MAS1_IPROT_MASK: u32 = 0x4000_0000;
pub const MAS1_TID_MASK: u32 = 0x007F_0000;
pub const MAS1_TS_MASK: u32 = 0x0000_1000;
pub const MAS1_TSIZ_MASK: u32 = 0x0000_0F80;
pub const MAS1_VALID_SHIFT: u32 = 31;
pub const MAS1_IPROT_SHIFT: u32 = 30;
pub const MAS1_TID_SHIFT: u32 = 16;
pub const MAS1_TS_SHIFT: u32 = 12;
pub const MAS1_TSIZ_SHIFT: u32 = 7;

/// EPN and RPN live in the top 22 bits of MAS2/MAS3.
pub const EPN_MASK: u32 = 0xFFFF_FC00;
pub const MAS2_FLAGS_MASK: u32 = 0x0000_003F;
pub const MAS3_USER_MASK: u32 = 0x0000_03C0;
pub const MAS3_PERM_MASK: u32 = 0x0000_003F;
pub const MAS3_USER_SHIFT: u32 = 6;

pub const MAS4_TLBSELD_MASK: u32 = 0x3000_0000;
pub const MAS4_TSIZED_MASK: u32 = 0x0000_0F80;
pub const MAS4_FLAGSD_MASK: u32 = 0x0000_003F;

pub const MAS6_SPID_MASK: u32 = 0x001F_0000;
pub const MAS6_SAS_MASK: u32 = 0x0000_0001;
pub const MAS6_SPID_SHIFT: u32 = 16;

/// Capability constants reported by the read-only configuration SPRs.
pub const MMUCFG_VALUE: u32 = (0b0100000 << 17) | (0b0001 << 11) | (0b00111 << 6) | (0b01 << 2);
pub const TLB0CFG_VALUE: u32 = 0;
pub const TLB1CFG_VALUE: u32 =
    (0x20 << 24) | (0x0 << 20) | (0xB << 16) | (1 << 15) | (1 << 14) | (1 << 13) | 0x20;

/// One TLB entry. The entry-select index is fixed at construction.
#[derive(Debug, Clone)]
pub struct TlbEntry {
    pub esel: u32,
    pub valid: bool,
    pub iprot: bool,
    pub tid: u32,
    pub ts: u32,
    pub tsiz: PageSize,
    pub epn: u32,
    pub flags: TlbFlags,
    pub rpn: u32,
    pub user: u32,
    pub perm: TlbPerm,
    /// Derived from `tsiz` whenever the entry is configured.
    pub mask: u32,
    /// Cached VLE attribute.
    pub vle: bool,
}

impl TlbEntry {
    fn new(esel: u32) -> Self {
        let mut e = TlbEntry {
            esel,
            valid: false,
            iprot: false,
            tid: 0,
            ts: 0,
            tsiz: PageSize::Size1K,
            epn: 0,
            flags: TlbFlags::empty(),
            rpn: 0,
            user: 0,
            perm: TlbPerm::empty(),
            mask: 0,
            vle: false,
        };
        e.config(false, false, 0, 0, PageSize::Size1K, 0, TlbFlags::empty(), 0, 0, TlbPerm::empty());
        e
    }

    #[allow(clippy::too_many_arguments)]
    pub fn config(
        &mut self,
        valid: bool,
        iprot: bool,
        tid: u32,
        ts: u32,
        tsiz: PageSize,
        epn: u32,
        flags: TlbFlags,
        rpn: u32,
        user: u32,
        perm: TlbPerm,
    ) {
        self.valid = valid;
        self.iprot = iprot;
        self.tid = tid & 0x7F;
        self.ts = ts & 1;
        self.tsiz = tsiz;
        self.epn = epn & EPN_MASK;
        self.flags = flags;
        self.rpn = rpn & EPN_MASK;
        self.user = user & 0xF;
        self.perm = perm;
        self.mask = tsiz.mask();
        self.vle = flags.contains(TlbFlags::VLE);
    }

    /// Encode this entry as (MAS1, MAS2, MAS3).
    pub fn encode(&self) -> (u32, u32, u32) {
        let mas1 = ((self.valid as u32) << MAS1_VALID_SHIFT)
            | ((self.iprot as u32) << MAS1_IPROT_SHIFT)
            | (self.tid << MAS1_TID_SHIFT)
            | (self.ts << MAS1_TS_SHIFT)
            | ((self.tsiz as u32) << MAS1_TSIZ_SHIFT);
        let mas2 = self.epn | self.flags.bits();
        let mas3 = self.rpn | (self.user << MAS3_USER_SHIFT) | self.perm.bits();
        (mas1, mas2, mas3)
    }

    /// Fully reconfigure this entry from (MAS1, MAS2, MAS3). IPROT does not
    /// protect an entry from being overwritten, only from invalidation.
    pub fn decode(&mut self, mas1: u32, mas2: u32, mas3: u32) {
        self.config(
            mas1 & MAS1_VALID_MASK != 0,
            mas1 & MAS1_IPROT_MASK != 0,
            (mas1 & MAS1_TID_MASK) >> MAS1_TID_SHIFT,
            (mas1 & MAS1_TS_MASK) >> MAS1_TS_SHIFT,
            PageSize::from_code((mas1 & MAS1_TSIZ_MASK) >> MAS1_TSIZ_SHIFT),
            mas2 & EPN_MASK,
            TlbFlags::from_bits_truncate(mas2 & MAS2_FLAGS_MASK),
            mas3 & EPN_MASK,
            (mas3 & MAS3_USER_MASK) >> MAS3_USER_SHIFT,
            TlbPerm::from_bits_truncate(mas3 & MAS3_PERM_MASK),
        );
    }

    /// Clear the valid bit unless the entry is invalidation-protected.
    pub fn invalidate(&mut self) {
        if !self.iprot {
            self.valid = false;
        }
    }

    fn matches(&self, va: u32, ts: u32, tid: u32) -> bool {
        self.valid
            && self.ts == ts
            && (self.tid == 0 || self.tid == tid)
            && (va & self.mask) == (self.epn & self.mask)
    }
}

/// The software TLB.
pub struct Mmu {
    tlb: Vec<TlbEntry>,
}

pub const TLB_ENTRIES: usize = 32;

impl Mmu {
    pub fn new() -> Self {
        Mmu { tlb: (0..TLB_ENTRIES as u32).map(TlbEntry::new).collect() }
    }

    /// Install the hardware reset mapping: entry 0 covers the boot page.
    pub fn reset(&mut self) {
        for e in &mut self.tlb {
            e.config(
                false,
                false,
                0,
                0,
                PageSize::Size1K,
                0,
                TlbFlags::empty(),
                0,
                0,
                TlbPerm::empty(),
            );
        }
        self.config_entry(
            0,
            PageSize::Size4K,
            0xFFFF_F000,
            0xFFFF_F000,
            TlbFlags::empty(),
            TlbPerm::SU_RWX,
        );
    }

    pub fn entry(&self, esel: usize) -> &TlbEntry {
        &self.tlb[esel]
    }

    pub fn entry_mut(&mut self, esel: usize) -> &mut TlbEntry {
        &mut self.tlb[esel]
    }

    /// Programmatic entry configuration used during boot: valid,
    /// invalidation-protected, global, AS 0.
    pub fn config_entry(
        &mut self,
        esel: usize,
        tsiz: PageSize,
        epn: u32,
        rpn: u32,
        flags: TlbFlags,
        perm: TlbPerm,
    ) {
        self.tlb[esel].config(true, true, 0, 0, tsiz, epn, flags, rpn, 0, perm);
        debug!(
            "MMU: configured mapping {}: 0x{:08x} -> 0x{:08x} ({:?} {})",
            esel,
            rpn,
            epn,
            tsiz,
            if self.tlb[esel].vle { "VLE" } else { "BookE" },
        );
    }

    /// First valid entry matching `(va, ts, tid)`; TID 0 entries are global.
    pub fn find_entry(&self, va: u32, ts: u32, tid: u32) -> Option<&TlbEntry> {
        self.tlb.iter().find(|e| e.matches(va, ts, tid))
    }

    fn data_tag(regs: &RegisterFile) -> (u32, u32) {
        let ts = (regs.msr & msr_bits::DS != 0) as u32;
        (ts, regs.get_spr32(spr::PID0) & 0x7F)
    }

    fn instr_tag(regs: &RegisterFile) -> (u32, u32) {
        let ts = (regs.msr & msr_bits::IS != 0) as u32;
        (ts, regs.get_spr32(spr::PID0) & 0x7F)
    }

    /// Translate a data access address.
    pub fn translate_data(&self, regs: &RegisterFile, va: u32) -> Result<u32, Exception> {
        let (ts, tid) = Self::data_tag(regs);
        match self.find_entry(va, ts, tid) {
            Some(e) => Ok(e.rpn | (va & !e.mask)),
            None => Err(Exception::new(ExcKind::DataTlbMiss { va })),
        }
    }

    /// Translate an instruction fetch address; also reports the entry's VLE
    /// attribute.
    pub fn translate_instr(&self, regs: &RegisterFile, va: u32) -> Result<(u32, bool), Exception> {
        let (ts, tid) = Self::instr_tag(regs);
        match self.find_entry(va, ts, tid) {
            Some(e) => Ok((e.rpn | (va & !e.mask), e.vle)),
            None => Err(Exception::new(ExcKind::InstrTlbMiss { va })),
        }
    }

    /// tlbre: load MAS1-MAS3 from the entry selected by MAS0[ESEL].
    pub fn tlbre(&self, regs: &mut RegisterFile) {
        let esel = ((regs.get_spr32(spr::MAS0) & MAS0_ESEL_MASK) >> MAS0_ESEL_SHIFT) as usize;
        let entry = &self.tlb[esel % TLB_ENTRIES];
        let (mas1, mas2, mas3) = entry.encode();
        debug!(
            "MMU: read mapping {}: 0x{:08x} -> 0x{:08x} ({:?})",
            esel, entry.rpn, entry.epn, entry.tsiz
        );
        regs.set_spr32(spr::MAS1, mas1);
        regs.set_spr32(spr::MAS2, mas2);
        regs.set_spr32(spr::MAS3, mas3);
    }

    /// tlbwe: reconfigure the entry selected by MAS0[ESEL] from MAS1-MAS3.
    pub fn tlbwe(&mut self, regs: &mut RegisterFile) {
        let esel = ((regs.get_spr32(spr::MAS0) & MAS0_ESEL_MASK) >> MAS0_ESEL_SHIFT) as usize;
        let mas1 = regs.get_spr32(spr::MAS1);
        let mas2 = regs.get_spr32(spr::MAS2);
        let mas3 = regs.get_spr32(spr::MAS3);
        let entry = &mut self.tlb[esel % TLB_ENTRIES];
        entry.decode(mas1, mas2, mas3);
        debug!(
            "MMU: write mapping {}: 0x{:08x} -> 0x{:08x} ({:?} {})",
            esel,
            entry.rpn,
            entry.epn,
            entry.tsiz,
            if entry.vle { "VLE" } else { "BookE" },
        );
    }

    /// tlbsx: probe for `ea` using MAS6 (SAS, SPID). Hit loads MAS0-MAS3;
    /// miss stages a "potential next" entry from MAS0[NV] and MAS4.
    pub fn tlbsx(&self, regs: &mut RegisterFile, ea: u32) {
        let mas6 = regs.get_spr32(spr::MAS6);
        let spid = (mas6 & MAS6_SPID_MASK) >> MAS6_SPID_SHIFT;
        let sas = mas6 & MAS6_SAS_MASK;

        if let Some(entry) = self.find_entry(ea, sas, spid) {
            let (mas1, mas2, mas3) = entry.encode();
            debug!(
                "MMU: search found mapping {}: 0x{:08x} -> 0x{:08x}",
                entry.esel, entry.rpn, entry.epn
            );
            let mas0 = (1 << MAS0_TBSEL_SHIFT) | (entry.esel << MAS0_ESEL_SHIFT);
            regs.set_spr32(spr::MAS0, mas0);
            regs.set_spr32(spr::MAS1, mas1);
            regs.set_spr32(spr::MAS2, mas2);
            regs.set_spr32(spr::MAS3, mas3);
        } else {
            self.tlb_miss(regs, ea, sas, spid);
        }
    }

    /// Stage MAS0-MAS3 for a miss at `va`: ESEL from MAS0[NV], MAS1/MAS2
    /// defaults from MAS4, MAS3 zero.
    pub fn tlb_miss(&self, regs: &mut RegisterFile, va: u32, ts: u32, tid: u32) {
        let mas0 = regs.get_spr32(spr::MAS0);
        let mas4 = regs.get_spr32(spr::MAS4);
        let nv = mas0 & MAS0_NV_MASK;

        let new_mas0 = (mas4 & MAS4_TLBSELD_MASK) | (nv << MAS0_ESEL_SHIFT) | nv;
        regs.set_spr32(spr::MAS0, new_mas0);

        // VALID and IPROT stay clear; TID comes from the current PID
        let new_mas1 = (tid << MAS1_TID_SHIFT) | (ts << MAS1_TS_SHIFT) | (mas4 & MAS4_TSIZED_MASK);
        regs.set_spr32(spr::MAS1, new_mas1);

        let new_mas2 = (va & EPN_MASK) | (mas4 & MAS4_FLAGSD_MASK);
        regs.set_spr32(spr::MAS2, new_mas2);

        regs.set_spr32(spr::MAS3, 0);
    }

    /// tlbivax: EA bit 29 set invalidates everything (iprot permitting),
    /// otherwise every entry whose page covers `ea`, ignoring TS and TID.
    pub fn tlbivax(&mut self, ea: u32) {
        if ea & 0x0000_0004 != 0 {
            for e in &mut self.tlb {
                e.invalidate();
            }
        } else {
            for e in &mut self.tlb {
                if (ea & e.mask) == (e.epn & e.mask) {
                    debug!("MMU: invalidating mapping {}: 0x{:08x}", e.esel, e.epn);
                    e.invalidate();
                }
            }
        }
    }

    /// tlbsync is a no-op on a single-core system.
    pub fn tlbsync(&self) {}

    /// MMUCSR0 write: bit 30 (0x2) invalidates all non-protected entries.
    pub fn mmucsr0_write(&mut self, val: u32) {
        if val & 0x0000_0002 != 0 {
            for e in &mut self.tlb {
                e.invalidate();
            }
        }
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
