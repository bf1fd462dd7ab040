//! Debug boundary consumed by an external GDB remote-serial stub.
//!
//! The stub lives outside the core; this module supplies the narrow
//! surface it drives: halt/resume through the run gate, raw memory and
//! register access, and breakpoint management. Breakpoints substitute the
//! target trap instruction (4-byte `dnh` for BookE, 2- or 4-byte debug
//! trap for VLE) through the supervisor opcode-write path, remembering the
//! original bytes and decoded instruction. Memory reads that would
//! bus-error are reported as zero bytes so a connecting client cannot
//! crash the target.

use log::debug;

use crate::cpu::decode::trap_bytes;
use crate::cpu::{Breakpoint, Core};
use crate::exc::ExcResult;
use crate::regs::spr;

/// Register index mapping used by the debug surface: r0-r31, then PC,
/// MSR, CR, LR, CTR, XER.
pub const REG_PC: usize = 32;
pub const REG_MSR: usize = 33;
pub const REG_CR: usize = 34;
pub const REG_LR: usize = 35;
pub const REG_CTR: usize = 36;
pub const REG_XER: usize = 37;

/// The core's contract with the debug stub.
pub trait DebugInterface {
    fn halt(&mut self);
    fn resume(&mut self);
    fn read_mem(&mut self, va: u32, size: usize) -> Vec<u8>;
    fn write_mem(&mut self, va: u32, bytes: &[u8]) -> ExcResult<()>;
    fn read_reg(&mut self, idx: usize) -> u32;
    fn write_reg(&mut self, idx: usize, val: u32);
    fn parse_opcode(&mut self, va: u32) -> ExcResult<crate::cpu::decode::Op>;
    fn write_opcode(&mut self, va: u32, bytes: &[u8]) -> ExcResult<()>;
    fn install_breakpoint(&mut self, va: u32) -> ExcResult<()>;
    fn uninstall_breakpoint(&mut self, va: u32) -> ExcResult<()>;
}

impl DebugInterface for Core {
    fn halt(&mut self) {
        self.do_halt();
    }

    fn resume(&mut self) {
        self.resume_exec();
    }

    /// Raw memory read; errors surface as zero bytes rather than faults.
    fn read_mem(&mut self, va: u32, size: usize) -> Vec<u8> {
        Core::read_mem(self, va, size).unwrap_or_else(|_| vec![0; size])
    }

    fn write_mem(&mut self, va: u32, bytes: &[u8]) -> ExcResult<()> {
        Core::write_mem(self, va, bytes)
    }

    fn read_reg(&mut self, idx: usize) -> u32 {
        match idx {
            0..=31 => self.regs.gpr[idx],
            REG_PC => self.regs.pc,
            REG_MSR => self.regs.msr,
            REG_CR => self.regs.cr,
            REG_LR => self.regs.get_spr32(spr::LR),
            REG_CTR => self.regs.get_spr32(spr::CTR),
            REG_XER => self.regs.get_spr32(spr::XER),
            _ => 0,
        }
    }

    fn write_reg(&mut self, idx: usize, val: u32) {
        match idx {
            0..=31 => self.regs.gpr[idx] = val,
            REG_PC => self.regs.pc = val,
            REG_MSR => self.set_msr(val),
            REG_CR => self.regs.cr = val,
            REG_LR => self.regs.set_spr32(spr::LR, val),
            REG_CTR => self.regs.set_spr32(spr::CTR, val),
            REG_XER => self.regs.set_spr32(spr::XER, val),
            _ => {}
        }
    }

    fn parse_opcode(&mut self, va: u32) -> ExcResult<crate::cpu::decode::Op> {
        Core::parse_opcode(self, va)
    }

    fn write_opcode(&mut self, va: u32, bytes: &[u8]) -> ExcResult<()> {
        Core::write_opcode(self, va, bytes)
    }

    /// Substitute the trap instruction at `va`, remembering the original
    /// bytes and decoded op for restore and step-over.
    fn install_breakpoint(&mut self, va: u32) -> ExcResult<()> {
        if self.breakpoints.contains_key(&va) {
            return Ok(());
        }
        let (_, vle) = self.mmu.translate_instr(&self.regs, va)?;
        let orig_op = Core::parse_opcode(self, va)?;
        let size = orig_op.size as usize;
        let orig = {
            let ea = self.mmu.translate_instr(&self.regs, va)?.0;
            let guard = self.map.supervisor();
            let bytes = self.phys_read(ea, size, va);
            drop(guard);
            bytes?
        };
        let trap = trap_bytes(vle, size);
        Core::write_opcode(self, va, trap)?;
        debug!("installed breakpoint at 0x{:08x} ({} bytes)", va, size);
        self.breakpoints.insert(va, Breakpoint { orig, orig_op, vle });
        Ok(())
    }

    /// Restore the original instruction bytes at `va`.
    fn uninstall_breakpoint(&mut self, va: u32) -> ExcResult<()> {
        if let Some(bp) = self.breakpoints.remove(&va) {
            Core::write_opcode(self, va, &bp.orig)?;
            debug!("removed breakpoint at 0x{:08x}", va);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::OpKind;
    use crate::mmu::{PageSize, TlbFlags, TlbPerm};
    use crate::Config;

    fn core_with_sram_code() -> Core {
        let mut core = Core::new(Config { test_mode: true, ..Config::default() });
        core.mmu.config_entry(
            3,
            PageSize::Size256K,
            0x4000_0000,
            0x4000_0000,
            TlbFlags::I,
            TlbPerm::SU_RWX,
        );
        // b .+0 at 0x40000000, nop-ish ori after it
        core.write_opcode(0x4000_0000, &[0x48, 0x00, 0x00, 0x08]).unwrap();
        core.write_opcode(0x4000_0008, &[0x60, 0x00, 0x00, 0x00]).unwrap();
        core
    }

    #[test]
    fn test_read_reg_mapping() {
        let mut core = core_with_sram_code();
        core.regs.gpr[3] = 0x1234;
        core.regs.pc = 0x4000_0000;
        core.regs.set_spr32(spr::LR, 0xCAFE_0000);
        assert_eq!(DebugInterface::read_reg(&mut core, 3), 0x1234);
        assert_eq!(DebugInterface::read_reg(&mut core, REG_PC), 0x4000_0000);
        assert_eq!(DebugInterface::read_reg(&mut core, REG_LR), 0xCAFE_0000);
    }

    #[test]
    fn test_read_mem_errors_as_zeroes() {
        let mut core = core_with_sram_code();
        // no mapping at this address: report zeroes, not a fault
        let data = DebugInterface::read_mem(&mut core, 0x9999_0000, 8);
        assert_eq!(data, vec![0; 8]);
    }

    #[test]
    fn test_breakpoint_install_swaps_trap() {
        let mut core = core_with_sram_code();
        core.install_breakpoint(0x4000_0000).unwrap();

        // the parsed op is now the trap
        let op = Core::parse_opcode(&mut core, 0x4000_0000).unwrap();
        assert_eq!(op.kind, OpKind::Dnh);

        // and the stored original decodes back to the branch
        let bp = core.breakpoints.get(&0x4000_0000).unwrap();
        assert_eq!(bp.orig, vec![0x48, 0x00, 0x00, 0x08]);
        assert!(matches!(bp.orig_op.kind, OpKind::Branch { .. }));
        assert!(!bp.vle);
    }

    #[test]
    fn test_breakpoint_uninstall_restores() {
        let mut core = core_with_sram_code();
        core.install_breakpoint(0x4000_0000).unwrap();
        core.uninstall_breakpoint(0x4000_0000).unwrap();
        let op = Core::parse_opcode(&mut core, 0x4000_0000).unwrap();
        assert!(matches!(op.kind, OpKind::Branch { target: 8, .. }));
        assert!(core.breakpoints.is_empty());
    }

    #[test]
    fn test_halt_resume_gate() {
        let mut core = core_with_sram_code();
        assert!(!core.is_halted());
        DebugInterface::halt(&mut core);
        assert!(core.is_halted());
        DebugInterface::resume(&mut core);
        assert!(!core.is_halted());
    }
}
