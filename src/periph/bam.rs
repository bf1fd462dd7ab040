//! BAM: the boot assist module.
//!
//! Runs on every reset. It scans six fixed flash offsets for a Reset
//! Configuration Half-Word, programs the five TLB entries that open up the
//! MPC5674F memory map (BookE or VLE flavored, per the RCHW), points the PC
//! at the firmware entry and forces the SWT enable to the RCHW's choice.
//! The BAM window itself reads as zeroes and rejects writes.

use byteorder::{BigEndian, ByteOrder};
use log::{info, warn};

use crate::exc::{ExcKind, ExcResult, Exception};
use crate::mem::MemoryMap;
use crate::mmu::{Mmu, PageSize, TlbFlags, TlbPerm};
use crate::periph::flash::FlashController;
use crate::periph::swt::Swt;
use crate::periph::Peripheral;
use crate::regs::RegisterFile;

/// Valid RCHW signature: the upper nibble of the reserved byte is zero and
/// the boot identifier byte is 0x5A.
pub const RCHW_MASK: u16 = 0xF0FF;
pub const RCHW_VALUE: u16 = 0x005A;

/// Candidate RCHW locations in main flash (internal boot).
pub const RCHW_OFFSETS: [u32; 6] = [0x0000, 0x4000, 0x1_0000, 0x1_C000, 0x2_0000, 0x3_0000];

/// Parsed Reset Configuration Half-Word block: 16 signature bits, 16
/// reserved bits, then the 32-bit entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rchw {
    pub swt: bool,
    pub wte: bool,
    pub ps0: bool,
    pub vle: bool,
    pub bootid: u8,
    pub entry_point: u32,
}

impl Rchw {
    /// Decode the 8-byte RCHW block.
    pub fn parse(bytes: &[u8]) -> Rchw {
        let hw = BigEndian::read_u16(bytes);
        Rchw {
            swt: hw & 0x0800 != 0,
            wte: hw & 0x0400 != 0,
            ps0: hw & 0x0200 != 0,
            vle: hw & 0x0100 != 0,
            bootid: (hw & 0xFF) as u8,
            entry_point: BigEndian::read_u32(&bytes[4..8]),
        }
    }
}

/// The boot assist module.
pub struct Bam {
    /// RCHW found by the last boot scan, if any.
    pub rchw: Option<Rchw>,
    /// Flash offset the RCHW was found at.
    pub rchw_addr: Option<u32>,
}

impl Bam {
    pub fn new() -> Self {
        Bam { rchw: None, rchw_addr: None }
    }

    /// The BAM ROM contents are not modelled; reads return zeroes.
    pub fn read(&self, _offset: u32, size: usize) -> Vec<u8> {
        vec![0; size]
    }

    /// None of the BAM window is writable.
    pub fn write(&self, offset: u32, pc: u32, va: u32) -> ExcResult<()> {
        let _ = offset;
        Err(Exception::new(ExcKind::DataWriteBusError { pc, va, written: 0 }))
    }

    /// Scan the candidate offsets for a valid RCHW. Flash contents can
    /// change between resets, so every boot re-scans.
    pub fn analyze(&mut self, flash: &FlashController) -> bool {
        for offset in RCHW_OFFSETS {
            let sig = BigEndian::read_u16(&flash.read_main(offset, 2));
            info!("BAM: analyzing 0x{:x}: 0x{:04x}", offset, sig);
            if sig & RCHW_MASK == RCHW_VALUE {
                let block = flash.read_main(offset, 8);
                self.rchw = Some(Rchw::parse(&block));
                self.rchw_addr = Some(offset);
                return true;
            }
        }
        warn!("BAM: no valid RCHW identified");
        self.rchw = None;
        self.rchw_addr = None;
        false
    }

    /// Boot: locate the RCHW, build the initial TLB, set the PC and the
    /// SWT enable. With no valid RCHW the PC stays at zero and only the
    /// hardware-default TLB entry remains.
    pub fn boot(
        &mut self,
        map: &MemoryMap,
        mmu: &mut Mmu,
        regs: &mut RegisterFile,
        flash: &FlashController,
        swt: &mut Swt,
    ) {
        let _supervisor = map.supervisor();

        if !self.analyze(flash) {
            regs.pc = 0;
            self.apply_swt(swt, false);
            return;
        }
        let rchw = self.rchw.unwrap();
        info!(
            "BAM: booting from 0x{:x}, entry 0x{:08x} ({})",
            self.rchw_addr.unwrap(),
            rchw.entry_point,
            if rchw.vle { "VLE" } else { "BookE" },
        );

        // "BAM Program Operation" TLB setup; VLE in the RCHW flavors the
        // flash, EBI and SRAM entries.
        let code_flags = if rchw.vle { TlbFlags::VLE } else { TlbFlags::empty() };

        // Peripheral Bridge B (1MB)
        mmu.config_entry(0, PageSize::Size1M, 0xFFF0_0000, 0xFFF0_0000, TlbFlags::IG, TlbPerm::SU_RWX);
        // Peripheral Bridge A (1MB)
        mmu.config_entry(4, PageSize::Size1M, 0xC3F0_0000, 0xC3F0_0000, TlbFlags::IG, TlbPerm::SU_RWX);
        // Flash incl. shadow blocks (16MB)
        mmu.config_entry(1, PageSize::Size16M, 0x0000_0000, 0x0000_0000, code_flags, TlbPerm::SU_RWX);
        // EBI external/development memory (16MB)
        mmu.config_entry(2, PageSize::Size16M, 0x2000_0000, 0x2000_0000, code_flags, TlbPerm::SU_RWX);
        // SRAM (256KB)
        mmu.config_entry(
            3,
            PageSize::Size256K,
            0x4000_0000,
            0x4000_0000,
            TlbFlags::I | code_flags,
            TlbPerm::SU_RWX,
        );

        regs.pc = rchw.entry_point;
        self.apply_swt(swt, rchw.swt);
    }

    /// Force the SWT enable flag and re-run its timer update so the
    /// countdown state matches.
    fn apply_swt(&self, swt: &mut Swt, enable: bool) {
        let wen = if enable { 1 } else { 0 };
        if swt.regs.field("mcr", "wen") != wen {
            info!("BAM: {} SWT", if enable { "enabling" } else { "disabling" });
            swt.regs.reg_mut("mcr").override_field("wen", wen);
            swt.update_watchdog();
        }
    }
}

impl Default for Bam {
    fn default() -> Self {
        Self::new()
    }
}

impl Peripheral for Bam {
    fn name(&self) -> &'static str {
        "BAM"
    }

    fn reset(&mut self) {
        self.rchw = None;
        self.rchw_addr = None;
    }
}
