//! The e200z7 core: register state, subsystems, and the instruction-level
//! step loop.
//!
//! [`Core`] owns every subsystem as a field (MMU, memory map, interrupt
//! controller, time base, peripherals); `read_mem`/`write_mem` are the
//! single entry points that sequence translate, dispatch and access
//! callbacks. One `step()` drains one external-IO item, runs one queued
//! extra-processing closure, gives the interrupt controller a dispatch
//! opportunity, then fetches, decodes and executes one instruction.
//! Execution-time faults surface as `Exception` values which the step loop
//! classifies: resets restart the whole processor, debug traps halt, and
//! everything else is queued for prioritized dispatch.

pub mod decode;
mod exec;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::bitfield::PeriphRegister;
use crate::clock::{EmuTimer, TimeBase};
use crate::exc::{ExcKind, ExcResult, Exception, ResetSource};
use crate::intc::IntController;
use crate::mem::{DeviceId, MemoryMap, Perm, ReadAccess, WriteAccess};
use crate::mmu::Mmu;
use crate::periph::{Bam, FlashBank, FlashController, Peripheral, Swt};
use crate::regs::{spr, RegisterFile, SprHook};
use crate::Config;

use decode::{decode, Op};

/// One frame delivered by an external IO task.
pub struct IoEvent {
    pub device: DeviceId,
    pub data: Vec<u8>,
}

/// Deferred work executed one item per step, before the fetch.
pub type ExtraFn = Box<dyn FnOnce(&mut Core) + Send>;

/// Decoded-instruction context kept for exception reporting.
#[derive(Debug, Clone, Copy)]
pub struct CurInstr {
    pub op: Op,
    pub va: u32,
    pub next_va: u32,
    pub vle: bool,
}

/// Per-mode opcode cache keyed by physical address.
struct OpCache {
    booke: BTreeMap<u32, Op>,
    vle: BTreeMap<u32, Op>,
}

impl OpCache {
    fn new() -> Self {
        OpCache { booke: BTreeMap::new(), vle: BTreeMap::new() }
    }

    fn get(&self, vle: bool, ea: u32) -> Option<Op> {
        let map = if vle { &self.vle } else { &self.booke };
        map.get(&ea).copied()
    }

    fn insert(&mut self, vle: bool, ea: u32, op: Op) {
        let map = if vle { &mut self.vle } else { &mut self.booke };
        map.insert(ea, op);
    }

    /// Invalidate everything decoded from `[ea, ea+size)`; the scan backs
    /// up 16 bytes to catch instructions that overlap the written range.
    fn clear_range(&mut self, ea: u32, size: u32) {
        let lo = ea.saturating_sub(16);
        let hi = ea.saturating_add(size);
        for map in [&mut self.booke, &mut self.vle] {
            let stale: Vec<u32> = map.range(lo..hi).map(|(&k, _)| k).collect();
            for k in stale {
                map.remove(&k);
            }
        }
    }

    fn clear_all(&mut self) {
        self.booke.clear();
        self.vle.clear();
    }
}

/// Installed-breakpoint record: the original bytes and the decoded
/// instruction they held.
pub struct Breakpoint {
    pub orig: Vec<u8>,
    pub orig_op: Op,
    pub vle: bool,
}

/// Callback fired after a successful physical access in its range.
pub type MemCallback = Box<dyn FnMut(u32, &[u8], bool) + Send>;

/// The emulated processor.
pub struct Core {
    pub cfg: Config,
    pub regs: RegisterFile,
    pub mmu: Mmu,
    pub map: MemoryMap,
    pub intc: IntController,
    pub time: TimeBase,
    pub swt: Swt,
    pub bam: Bam,
    pub flash: FlashController,

    // bitfield SPRs; TCR/TSR are shared with the MCU timer callbacks
    pub hid0: PeriphRegister,
    pub hid1: PeriphRegister,
    pub tcr: Arc<Mutex<PeriphRegister>>,
    pub tsr: Arc<Mutex<PeriphRegister>>,
    pub mcsr: PeriphRegister,

    opcache: OpCache,
    cur_instr: Option<CurInstr>,
    io_rx: Receiver<IoEvent>,
    io_tx: Sender<IoEvent>,
    extra: Arc<Mutex<Vec<ExtraFn>>>,
    run_gate: Arc<(Mutex<bool>, Condvar)>,

    /// PPC time base offset; `None` while HID0[TBEN] is clear.
    tb_offset: Option<u64>,
    mcu_wdt: EmuTimer,
    mcu_fit: EmuTimer,
    mcu_dec: EmuTimer,
    decar_shadow: Arc<AtomicU32>,

    pub reset_source: ResetSource,
    pub(crate) breakpoints: BTreeMap<u32, Breakpoint>,
    read_callbacks: Vec<(u32, u32, MemCallback)>,
    write_callbacks: Vec<(u32, u32, MemCallback)>,
    ticks: u64,
}

fn hid0_reg() -> PeriphRegister {
    PeriphRegister::builder()
        .bits("emcp", 1)
        .pad(7)
        .bits("doze", 1)
        .bits("nap", 1)
        .bits("sleep", 1)
        .pad(3)
        .bits("icr", 1)
        .bits("nhr", 1)
        .pad(1)
        .bits("tben", 1)
        .bits("sel_tbclk", 1)
        .bits("dclree", 1)
        .bits("dclrce", 1)
        .bits("ciclerde", 1)
        .bits("mcclrde", 1)
        .bits("dapuen", 1)
        .pad(7)
        .bits("nopti", 1)
        .build()
}

fn hid1_reg() -> PeriphRegister {
    PeriphRegister::builder().pad(16).bits("sysctl", 8).bits("ats", 1).pad(7).build()
}

fn tcr_reg() -> PeriphRegister {
    PeriphRegister::builder()
        .bits("wp", 2)
        .bits("wrc", 2)
        .bits("wie", 1)
        .bits("die", 1)
        .bits("fp", 2)
        .bits("fie", 1)
        .bits("are", 1)
        .pad(1)
        .bits("wpext", 4)
        .bits("fpext", 4)
        .pad(13)
        .build()
}

fn tsr_reg() -> PeriphRegister {
    PeriphRegister::builder()
        .w1c("enw", 1)
        .w1c("wis", 1)
        .w1c("wrs", 2)
        .w1c("dis", 1)
        .w1c("fis", 1)
        .pad(26)
        .build()
}

fn mcsr_reg() -> PeriphRegister {
    PeriphRegister::builder().w1c("flags", 32).build()
}

impl Core {
    /// Build a core with the MPC5674F memory map and run the power-on
    /// reset (which ends in BAM).
    pub fn new(cfg: Config) -> Self {
        let time = TimeBase::new(cfg.systime_scale);
        let intc = IntController::new();
        let queue = intc.queue_handle();

        let mut swt = Swt::new(cfg.extal as f64, cfg.periph_clock());
        swt.attach(&time, queue.clone());

        let mut map = MemoryMap::new();
        map.add_mmio(0x0000_0000, 0x0040_0000, "flash", DeviceId::FlashMain, Perm::RWX);
        map.add_mmio(0x00EF_C000, 0x4000, "flash_shadow_b", DeviceId::FlashShadowB, Perm::RWX);
        map.add_mmio(0x00FF_C000, 0x4000, "flash_shadow_a", DeviceId::FlashShadowA, Perm::RWX);
        map.add_region(0x4000_0000, Perm::RWX, "sram", vec![0u8; 0x4_0000], None);
        map.add_mmio(0xC3F8_8000, 0x4000, "flash_a_regs", DeviceId::FlashRegsA, Perm::RW);
        map.add_mmio(0xC3F8_C000, 0x4000, "flash_b_regs", DeviceId::FlashRegsB, Perm::RW);
        map.add_mmio(0xFFF3_8000, 0x4000, "swt", DeviceId::Swt, Perm::RW);
        map.add_mmio(0xFFFF_C000, 0x4000, "bam", DeviceId::Bam, Perm::RX);

        let tcr = Arc::new(Mutex::new(tcr_reg()));
        let tsr = Arc::new(Mutex::new(tsr_reg()));
        let decar_shadow = Arc::new(AtomicU32::new(0));

        let mcu_wdt = Self::spawn_wdt_timer(&time, &tcr, &tsr, &queue);
        let mcu_fit = Self::spawn_fit_timer(&time, &tsr, &queue);
        let mcu_dec = Self::spawn_dec_timer(&time, &tcr, &tsr, &queue, &decar_shadow);

        let (io_tx, io_rx) = channel();

        let mut regs = RegisterFile::new();
        Self::install_spr_hooks(&mut regs);

        let mut core = Core {
            cfg,
            regs,
            mmu: Mmu::new(),
            map,
            intc,
            time,
            swt,
            bam: Bam::new(),
            flash: FlashController::new(),
            hid0: hid0_reg(),
            hid1: hid1_reg(),
            tcr,
            tsr,
            mcsr: mcsr_reg(),
            opcache: OpCache::new(),
            cur_instr: None,
            io_rx,
            io_tx,
            extra: Arc::new(Mutex::new(Vec::new())),
            run_gate: Arc::new((Mutex::new(true), Condvar::new())),
            tb_offset: None,
            mcu_wdt,
            mcu_fit,
            mcu_dec,
            decar_shadow,
            reset_source: ResetSource::PowerOn,
            breakpoints: BTreeMap::new(),
            read_callbacks: Vec::new(),
            write_callbacks: Vec::new(),
            ticks: 0,
        };
        core.reset();
        core
    }

    fn install_spr_hooks(regs: &mut RegisterFile) {
        regs.add_spr_read_hook(spr::TB, SprHook::TimeBaseLower);
        regs.add_spr_write_hook(spr::TB, SprHook::TimeBaseLower);
        regs.add_spr_read_hook(spr::TBU, SprHook::TimeBaseUpper);
        regs.add_spr_write_hook(spr::TBU, SprHook::TimeBaseUpper);
        regs.add_spr_read_hook(spr::TBL_WO, SprHook::TimeBaseLowerWo);
        regs.add_spr_write_hook(spr::TBL_WO, SprHook::TimeBaseLowerWo);
        regs.add_spr_read_hook(spr::TBU_WO, SprHook::TimeBaseUpperWo);
        regs.add_spr_write_hook(spr::TBU_WO, SprHook::TimeBaseUpperWo);
        regs.add_spr_read_hook(spr::DEC, SprHook::Decrementer);
        regs.add_spr_write_hook(spr::DEC, SprHook::Decrementer);
        regs.add_spr_read_hook(spr::HID0, SprHook::Hid0);
        regs.add_spr_write_hook(spr::HID0, SprHook::Hid0);
        regs.add_spr_read_hook(spr::HID1, SprHook::Hid1);
        regs.add_spr_write_hook(spr::HID1, SprHook::Hid1);
        regs.add_spr_read_hook(spr::TCR, SprHook::Tcr);
        regs.add_spr_write_hook(spr::TCR, SprHook::Tcr);
        regs.add_spr_read_hook(spr::TSR, SprHook::Tsr);
        regs.add_spr_write_hook(spr::TSR, SprHook::Tsr);
        regs.add_spr_read_hook(spr::MCSR, SprHook::Mcsr);
        regs.add_spr_write_hook(spr::MCSR, SprHook::Mcsr);
        regs.add_spr_read_hook(spr::MMUCFG, SprHook::MmuCfg);
        regs.add_spr_read_hook(spr::TLB0CFG, SprHook::Tlb0Cfg);
        regs.add_spr_read_hook(spr::TLB1CFG, SprHook::Tlb1Cfg);
        regs.add_spr_write_hook(spr::L1CSR0, SprHook::L1Csr0);
        regs.add_spr_write_hook(spr::L1CSR1, SprHook::L1Csr1);
        regs.add_spr_write_hook(spr::MMUCSR0, SprHook::MmuCsr0);
    }

    fn spawn_wdt_timer(
        time: &TimeBase,
        tcr: &Arc<Mutex<PeriphRegister>>,
        tsr: &Arc<Mutex<PeriphRegister>>,
        queue: &crate::intc::ExcQueue,
    ) -> EmuTimer {
        let tcr = tcr.clone();
        let tsr = tsr.clone();
        let queue = queue.clone();
        let slot: Arc<Mutex<Option<EmuTimer>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let timer = time.register_timer(
            "MCU_WDT",
            Box::new(move || {
                // EREF watchdog state machine: ENW, then WIS + exception,
                // then reset if TCR[WRC] is armed
                let restart = {
                    let mut t = tsr.lock().unwrap();
                    if t.field("enw") == 0 {
                        t.override_field("enw", 1);
                        true
                    } else if t.field("wis") == 0 {
                        t.override_field("wis", 1);
                        queue.push(Exception::new(ExcKind::WatchdogTimer));
                        true
                    } else {
                        let wrc = tcr.lock().unwrap().field("wrc");
                        if wrc != 0 {
                            queue.push(Exception::new(ExcKind::Reset(ResetSource::CoreWatchdog)));
                        }
                        false
                    }
                };
                if restart {
                    if let Some(t) = slot2.lock().unwrap().as_ref() {
                        t.start();
                    }
                }
            }),
            None,
            None,
        );
        *slot.lock().unwrap() = Some(timer.clone());
        timer
    }

    fn spawn_fit_timer(
        time: &TimeBase,
        tsr: &Arc<Mutex<PeriphRegister>>,
        queue: &crate::intc::ExcQueue,
    ) -> EmuTimer {
        let tsr = tsr.clone();
        let queue = queue.clone();
        let slot: Arc<Mutex<Option<EmuTimer>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let timer = time.register_timer(
            "MCU_FIT",
            Box::new(move || {
                tsr.lock().unwrap().override_field("fis", 1);
                queue.push(Exception::new(ExcKind::FixedInterval));
                if let Some(t) = slot2.lock().unwrap().as_ref() {
                    t.start();
                }
            }),
            None,
            None,
        );
        *slot.lock().unwrap() = Some(timer.clone());
        timer
    }

    fn spawn_dec_timer(
        time: &TimeBase,
        tcr: &Arc<Mutex<PeriphRegister>>,
        tsr: &Arc<Mutex<PeriphRegister>>,
        queue: &crate::intc::ExcQueue,
        decar: &Arc<AtomicU32>,
    ) -> EmuTimer {
        let tcr = tcr.clone();
        let tsr = tsr.clone();
        let queue = queue.clone();
        let decar = decar.clone();
        let slot: Arc<Mutex<Option<EmuTimer>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let timer = time.register_timer(
            "MCU_DEC",
            Box::new(move || {
                tsr.lock().unwrap().override_field("dis", 1);
                queue.push(Exception::new(ExcKind::Decrementer));
                // auto-reload from DECAR when TCR[ARE] is set
                if tcr.lock().unwrap().field("are") != 0 {
                    let reload = decar.load(Ordering::SeqCst);
                    if let Some(t) = slot2.lock().unwrap().as_ref() {
                        t.start_with(None, Some(reload as u64));
                    }
                }
            }),
            None,
            None,
        );
        *slot.lock().unwrap() = Some(timer.clone());
        timer
    }

    /// Sender handle for external IO tasks.
    pub fn io_sender(&self) -> Sender<IoEvent> {
        self.io_tx.clone()
    }

    /// Queue a closure to run at the top of an upcoming step.
    pub fn add_extra_processing(&self, f: ExtraFn) {
        self.extra.lock().unwrap().push(f);
    }

    pub fn queue_exception(&mut self, exc: Exception) {
        self.intc.queue(exc, self.regs.msr);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn cur_instr(&self) -> Option<CurInstr> {
        self.cur_instr
    }

    // ------------------------------------------------------------------
    // SPR access with hook dispatch
    // ------------------------------------------------------------------

    /// PPC time base value: elapsed system ticks adjusted by the TB
    /// write offset; zero while the time base is disabled.
    pub fn timebase(&self) -> u64 {
        match self.tb_offset {
            Some(off) => self.time.sys_ticks().wrapping_sub(off),
            None => 0,
        }
    }

    pub fn read_spr(&mut self, idx: u16) -> u32 {
        match self.regs.spr_read_hook(idx) {
            Some(SprHook::TimeBaseLower) => self.timebase() as u32,
            Some(SprHook::TimeBaseUpper) => (self.timebase() >> 32) as u32,
            Some(SprHook::TimeBaseLowerWo) | Some(SprHook::TimeBaseUpperWo) => 0,
            Some(SprHook::Decrementer) => self.mcu_dec.ticks_left() as u32,
            Some(SprHook::Hid0) => self.hid0.read(),
            Some(SprHook::Hid1) => self.hid1.read(),
            Some(SprHook::Tcr) => self.tcr.lock().unwrap().read(),
            Some(SprHook::Tsr) => self.tsr.lock().unwrap().read(),
            Some(SprHook::Mcsr) => self.mcsr.read(),
            Some(SprHook::MmuCfg) => crate::mmu::MMUCFG_VALUE,
            Some(SprHook::Tlb0Cfg) => crate::mmu::TLB0CFG_VALUE,
            Some(SprHook::Tlb1Cfg) => crate::mmu::TLB1CFG_VALUE,
            _ => self.regs.get_spr32(idx),
        }
    }

    pub fn write_spr(&mut self, idx: u16, val: u32) {
        match self.regs.spr_write_hook(idx) {
            Some(SprHook::TimeBaseLower) | Some(SprHook::TimeBaseUpper) => {
                // TB/TBU are read-only; the WO pair rebases instead
            }
            Some(SprHook::TimeBaseLowerWo) => {
                let tbu = (self.timebase() >> 32) & 0xFFFF_FFFF;
                let tb = (tbu << 32) | val as u64;
                self.tb_offset = Some(self.time.sys_ticks().wrapping_sub(tb));
            }
            Some(SprHook::TimeBaseUpperWo) => {
                let tbl = self.timebase() & 0xFFFF_FFFF;
                let tb = ((val as u64) << 32) | tbl;
                self.tb_offset = Some(self.time.sys_ticks().wrapping_sub(tb));
            }
            Some(SprHook::Decrementer) => {
                self.regs.set_spr32(spr::DEC, val);
                if self.tcr.lock().unwrap().field("die") != 0 {
                    self.mcu_dec.start_with(None, Some(val as u64));
                }
            }
            Some(SprHook::Hid0) => {
                self.hid0.write(val);
                self.hid0_updated();
            }
            Some(SprHook::Hid1) => self.hid1.write(val),
            Some(SprHook::Tcr) => {
                self.tcr.lock().unwrap().write(val);
                self.tcr_updated();
            }
            Some(SprHook::Tsr) => self.tsr.lock().unwrap().write(val),
            Some(SprHook::Mcsr) => self.mcsr.write(val),
            Some(SprHook::L1Csr0) | Some(SprHook::L1Csr1) => {
                // the cache invalidate bit always reads back as zero
                self.regs.set_spr32(idx, val & !0x0000_0002);
            }
            Some(SprHook::MmuCsr0) => {
                self.mmu.mmucsr0_write(val);
                self.regs.set_spr32(idx, 0);
            }
            _ => {
                self.regs.set_spr32(idx, val);
                if idx == spr::DECAR {
                    self.decar_shadow.store(val, Ordering::SeqCst);
                }
            }
        }
    }

    /// MSR update path shared by mtmsr and the rfi family; re-evaluates
    /// pending interrupt eligibility.
    pub fn set_msr(&mut self, val: u32) {
        self.regs.msr = val;
        self.intc.msr_updated();
    }

    // ------------------------------------------------------------------
    // MCU timers (TCR/TSR/DEC)
    // ------------------------------------------------------------------

    fn hid0_updated(&mut self) {
        let tben = self.hid0.field("tben") != 0;
        if tben && self.tb_offset.is_none() {
            self.tb_offset = Some(self.time.sys_ticks());
            let (wie, fie, die) = {
                let t = self.tcr.lock().unwrap();
                (t.field("wie") != 0, t.field("fie") != 0, t.field("die") != 0)
            };
            if wie {
                self.start_mcu_wdt();
            }
            if fie {
                self.start_mcu_fit();
            }
            if die {
                self.start_mcu_dec();
            }
        } else if !tben && self.tb_offset.is_some() {
            self.tb_offset = None;
            self.mcu_wdt.stop();
            self.mcu_fit.stop();
            self.mcu_dec.stop();
        }
    }

    fn tcr_updated(&mut self) {
        let (wie, fie, die) = {
            let t = self.tcr.lock().unwrap();
            (t.field("wie") != 0, t.field("fie") != 0, t.field("die") != 0)
        };
        let running = self.time.running();
        if wie && running {
            self.start_mcu_wdt();
        } else {
            self.mcu_wdt.stop();
        }
        if fie && running {
            self.start_mcu_fit();
        } else {
            self.mcu_fit.stop();
        }
        if die && running {
            self.start_mcu_dec();
        } else {
            self.mcu_dec.stop();
        }
    }

    /// The watchdog period selects a bit of the time base: WP‖WPEXT names
    /// the bit, 0 being the MSB.
    fn start_mcu_wdt(&mut self) {
        let bit = {
            let t = self.tcr.lock().unwrap();
            (t.field("wp") << 4) | t.field("wpext")
        };
        let period = (1u64 << (63 - bit.min(63))).saturating_sub(1).max(1);
        self.mcu_wdt.start_with(Some(self.time.system_freq()), Some(period));
    }

    fn start_mcu_fit(&mut self) {
        let bit = {
            let t = self.tcr.lock().unwrap();
            (t.field("fp") << 4) | t.field("fpext")
        };
        let period = (1u64 << (63 - bit.min(63))).saturating_sub(1).max(1);
        self.mcu_fit.start_with(Some(self.time.system_freq()), Some(period));
    }

    fn start_mcu_dec(&mut self) {
        let ticks = self.regs.get_spr32(spr::DEC) as u64;
        let timer = self.mcu_dec.clone();
        // a pending decrementer exception restarts the timer on rfi
        // instead of immediately
        let attached = self.intc.attach_cleanup(
            |k| matches!(k, ExcKind::Decrementer),
            Box::new(move || timer.start()),
        );
        if !attached {
            self.mcu_dec
                .start_with(Some(self.time.system_freq()), Some(ticks.max(1)));
        }
    }

    // ------------------------------------------------------------------
    // Memory access
    // ------------------------------------------------------------------

    fn read_bus_error(&self, va: u32, transferred: usize) -> Exception {
        Exception::new(ExcKind::DataReadBusError {
            pc: self.regs.pc,
            va,
            data: vec![0; transferred],
        })
    }

    fn write_bus_error(&self, va: u32) -> Exception {
        Exception::new(ExcKind::DataWriteBusError { pc: self.regs.pc, va, written: 0 })
    }

    /// Physical read with MMIO dispatch.
    pub fn phys_read(&mut self, ea: u32, size: usize, va: u32) -> ExcResult<Vec<u8>> {
        let (dev, offset) = match self.map.read(ea, size as u32) {
            Ok(ReadAccess::Bytes(b)) => return Ok(b.to_vec()),
            Ok(ReadAccess::Mmio { dev, offset }) => (dev, offset),
            Err(_) => return Err(self.read_bus_error(va, 0)),
        };
        let pc = self.regs.pc;
        match dev {
            DeviceId::Swt => self.swt.read(offset, size, pc, va),
            DeviceId::Bam => Ok(self.bam.read(offset, size)),
            DeviceId::FlashMain => Ok(self.flash.read_main(offset, size)),
            DeviceId::FlashShadowA => Ok(self.flash.read_shadow(FlashBank::A, offset, size)),
            DeviceId::FlashShadowB => Ok(self.flash.read_shadow(FlashBank::B, offset, size)),
            DeviceId::FlashRegsA => self.flash.regs_read(FlashBank::A, offset, size, pc, va),
            DeviceId::FlashRegsB => self.flash.regs_read(FlashBank::B, offset, size, pc, va),
        }
    }

    /// Physical write with MMIO dispatch and opcode-cache maintenance.
    pub fn phys_write(&mut self, ea: u32, bytes: &[u8], va: u32) -> ExcResult<()> {
        let pc = self.regs.pc;
        let supervisor = self.map.in_supervisor();
        let access = match self.map.write(ea, bytes) {
            Ok(a) => a,
            Err(_) => return Err(self.write_bus_error(va)),
        };
        match access {
            WriteAccess::Done { exec } => {
                if exec {
                    self.opcache.clear_range(ea, bytes.len() as u32);
                }
                Ok(())
            }
            WriteAccess::Mmio { dev, offset } => match dev {
                DeviceId::Swt => self.swt.write(offset, bytes, pc, va),
                DeviceId::Bam => self.bam.write(offset, pc, va),
                DeviceId::FlashMain => {
                    self.flash.write_main(offset, bytes, pc, va, supervisor)?;
                    if supervisor {
                        self.opcache.clear_range(ea, bytes.len() as u32);
                    }
                    Ok(())
                }
                DeviceId::FlashShadowA | DeviceId::FlashShadowB => {
                    let bank = if dev == DeviceId::FlashShadowA { FlashBank::A } else { FlashBank::B };
                    self.flash.write_shadow(bank, offset, bytes, pc, va, supervisor)?;
                    if supervisor {
                        self.opcache.clear_range(ea, bytes.len() as u32);
                    }
                    Ok(())
                }
                DeviceId::FlashRegsA | DeviceId::FlashRegsB => {
                    let bank = if dev == DeviceId::FlashRegsA { FlashBank::A } else { FlashBank::B };
                    let changed = self.flash.regs_write(bank, offset, bytes, pc, va)?;
                    for (start, len) in changed {
                        self.opcache.clear_range(start, len);
                    }
                    Ok(())
                }
            },
        }
    }

    /// Data read through the MMU.
    pub fn read_mem(&mut self, va: u32, size: usize) -> ExcResult<Vec<u8>> {
        let ea = self.mmu.translate_data(&self.regs, va)?;
        let data = self.phys_read(ea, size, va)?;
        self.fire_callbacks(false, ea, &data, false);
        Ok(data)
    }

    /// Data write through the MMU.
    pub fn write_mem(&mut self, va: u32, bytes: &[u8]) -> ExcResult<()> {
        let ea = self.mmu.translate_data(&self.regs, va)?;
        self.phys_write(ea, bytes, va)?;
        self.fire_callbacks(true, ea, bytes, false);
        Ok(())
    }

    /// Big-endian value read of up to 8 bytes.
    pub fn read_mem_value(&mut self, va: u32, size: usize) -> ExcResult<u64> {
        let data = self.read_mem(va, size)?;
        let mut val = 0u64;
        for b in data {
            val = (val << 8) | b as u64;
        }
        Ok(val)
    }

    pub fn write_mem_value(&mut self, va: u32, val: u64, size: usize) -> ExcResult<()> {
        let mut bytes = vec![0u8; size];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (val >> (8 * (size - 1 - i))) as u8;
        }
        self.write_mem(va, &bytes)
    }

    /// Register a callback over a physical range, fired after successful
    /// reads (and instruction fetches) in that range.
    pub fn install_read_callback(&mut self, start: u32, end: u32, cb: MemCallback) {
        self.read_callbacks.push((start, end, cb));
    }

    pub fn install_write_callback(&mut self, start: u32, end: u32, cb: MemCallback) {
        self.write_callbacks.push((start, end, cb));
    }

    pub fn remove_read_callback(&mut self, start: u32) {
        self.read_callbacks.retain(|(s, _, _)| *s != start);
    }

    pub fn remove_write_callback(&mut self, start: u32) {
        self.write_callbacks.retain(|(s, _, _)| *s != start);
    }

    fn fire_callbacks(&mut self, write: bool, ea: u32, data: &[u8], instr: bool) {
        let list = if write { &mut self.write_callbacks } else { &mut self.read_callbacks };
        for (start, end, cb) in list.iter_mut() {
            if ea >= *start && ea < *end {
                cb(ea, data, instr);
            }
        }
    }

    // ------------------------------------------------------------------
    // Fetch, decode, execute
    // ------------------------------------------------------------------

    /// Bytes backing an executable physical address, for the decoder.
    fn fetch_bytes(&self, ea: u32, len: usize) -> Option<Vec<u8>> {
        match self.map.exec_bytes(ea, len as u32) {
            Ok(ReadAccess::Bytes(b)) => Some(b.to_vec()),
            Ok(ReadAccess::Mmio { dev, offset }) => match dev {
                DeviceId::FlashMain => Some(self.flash.read_main(offset, len)),
                DeviceId::FlashShadowA => Some(self.flash.read_shadow(FlashBank::A, offset, len)),
                DeviceId::FlashShadowB => Some(self.flash.read_shadow(FlashBank::B, offset, len)),
                DeviceId::Bam => Some(vec![0; len]),
                _ => None,
            },
            Err(_) => None,
        }
    }

    /// Translate, consult the opcode cache, decode on a miss.
    pub fn parse_opcode(&mut self, va: u32) -> ExcResult<Op> {
        let (ea, vle) = self.mmu.translate_instr(&self.regs, va)?;
        if let Some(op) = self.opcache.get(vle, ea) {
            self.cur_instr = Some(CurInstr { op, va, next_va: va.wrapping_add(op.size as u32), vle });
            return Ok(op);
        }
        let bytes = self
            .fetch_bytes(ea, 4)
            .or_else(|| if vle { self.fetch_bytes(ea, 2) } else { None })
            .ok_or_else(|| self.read_bus_error(va, 0))?;
        let op = decode(&bytes, vle)
            .map_err(|_| Exception::new(ExcKind::InvalidInstruction { pc: va }))?;
        self.opcache.insert(vle, ea, op);
        self.cur_instr = Some(CurInstr { op, va, next_va: va.wrapping_add(op.size as u32), vle });
        let consumed = bytes[..op.size as usize].to_vec();
        self.fire_callbacks(false, ea, &consumed, true);
        Ok(op)
    }

    /// Supervisor-mode instruction write (breakpoints, code patching);
    /// clears overlapping opcode-cache entries.
    pub fn write_opcode(&mut self, va: u32, bytes: &[u8]) -> ExcResult<()> {
        let (ea, _vle) = self.mmu.translate_instr(&self.regs, va)?;
        let guard = self.map.supervisor();
        let result = self.phys_write(ea, bytes, va);
        drop(guard);
        result?;
        self.opcache.clear_range(ea, bytes.len() as u32);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step loop
    // ------------------------------------------------------------------

    fn process_io(&mut self) {
        // one item per step keeps peripherals fair to each other
        if let Ok(ev) = self.io_rx.try_recv() {
            match ev.device {
                DeviceId::Swt => self.swt.process_received(ev.data),
                DeviceId::Bam => self.bam.process_received(ev.data),
                _ => self.flash.process_received(ev.data),
            }
        }
    }

    fn run_extra(&mut self) {
        let f = {
            let mut extra = self.extra.lock().unwrap();
            if extra.is_empty() {
                None
            } else {
                Some(extra.remove(0))
            }
        };
        if let Some(f) = f {
            f(self);
        }
    }

    /// Drain asynchronous enqueues, then give the interrupt controller a
    /// dispatch opportunity. Pending resets short-circuit the queue.
    pub fn check_exception(&mut self) -> ExcResult<()> {
        self.intc.drain_inbox(self.regs.msr);
        if let Some(src) = self.intc.take_pending_reset() {
            return Err(Exception::new(ExcKind::Reset(src)));
        }
        self.intc.check_exception(&mut self.regs);
        Ok(())
    }

    /// Execute one instruction. External IO, extra processing and the
    /// interrupt check run first; faults are classified afterwards.
    /// Returns `Err` only for the administrative GDB-halt event.
    pub fn step(&mut self) -> ExcResult<()> {
        self.process_io();
        self.run_extra();
        match self.step_inner() {
            Ok(()) => Ok(()),
            Err(exc) => self.classify_fault(exc),
        }
    }

    fn step_inner(&mut self) -> ExcResult<()> {
        self.check_exception()?;
        let op = self.parse_opcode(self.regs.pc)?;
        self.execute(op)?;
        self.ticks += 1;
        Ok(())
    }

    fn classify_fault(&mut self, exc: Exception) -> ExcResult<()> {
        match &exc.kind {
            ExcKind::Reset(src) => {
                let src = *src;
                self.reset();
                self.notify_reset_source(src);
                Ok(())
            }
            ExcKind::GdbHalt => Err(exc),
            ExcKind::Debug => {
                if self.cfg.gdb_enabled {
                    self.do_halt();
                } else {
                    self.queue_exception(exc);
                }
                Ok(())
            }
            ExcKind::InvalidInstruction { pc } | ExcKind::UnsupportedInstruction { pc } => {
                debug!("invalid instruction at 0x{:08x}", pc);
                self.queue_exception(Exception::new(ExcKind::Program));
                Ok(())
            }
            _ => {
                self.queue_exception(exc);
                Ok(())
            }
        }
    }

    /// Run until a GDB halt propagates out.
    pub fn run(&mut self) -> Exception {
        loop {
            if let Err(exc) = self.step() {
                return exc;
            }
        }
    }

    fn notify_reset_source(&mut self, src: ResetSource) {
        self.reset_source = src;
        self.swt.set_reset_source(src);
        self.flash.set_reset_source(src);
        self.bam.set_reset_source(src);
    }

    /// Full processor reset: registers, TLB, peripherals (insertion
    /// order), then BAM re-evaluates flash and takes the boot decision.
    pub fn reset(&mut self) {
        self.time.disable();
        self.tb_offset = None;
        self.mcu_wdt.stop();
        self.mcu_fit.stop();
        self.mcu_dec.stop();

        self.regs.reset();
        self.hid0.reset();
        self.hid1.reset();
        self.tcr.lock().unwrap().reset();
        self.tsr.lock().unwrap().reset();
        self.mcsr.reset();

        self.cur_instr = None;
        self.opcache.clear_all();
        self.extra.lock().unwrap().clear();
        self.intc.reset();
        self.mmu.reset();

        self.swt.reset();
        self.flash.reset();
        self.bam.reset();

        self.time.set_system_freq(self.cfg.sysclk as f64);
        self.bam.boot(&self.map, &mut self.mmu, &mut self.regs, &self.flash, &mut self.swt);

        self.time.enable(false);
    }

    /// Deterministic teardown: stops the time-base thread and all timers.
    pub fn shutdown(&mut self) {
        self.swt.shutdown();
        self.flash.shutdown();
        self.bam.shutdown();
        self.time.shutdown();
    }

    // ------------------------------------------------------------------
    // Halt gate
    // ------------------------------------------------------------------

    /// Ask the execution thread to pause at the next step boundary.
    pub fn halt_exec(&mut self) {
        self.queue_exception(Exception::new(ExcKind::Debug));
    }

    pub(crate) fn do_halt(&mut self) {
        self.time.halt();
        let (lock, _cvar) = &*self.run_gate;
        *lock.lock().unwrap() = false;
    }

    pub fn is_halted(&self) -> bool {
        let (lock, _cvar) = &*self.run_gate;
        !*lock.lock().unwrap()
    }

    /// Reopen the gate and resume emulated time.
    pub fn resume_exec(&mut self) {
        let (lock, cvar) = &*self.run_gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        self.time.resume();
    }

    /// Block until the gate reopens.
    pub fn wait_resume(&self) {
        let (lock, cvar) = &*self.run_gate;
        let mut running = lock.lock().unwrap();
        while !*running {
            running = cvar.wait(running).unwrap();
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown();
    }
}
