//! SWT: the MPC5674F software watchdog timer.
//!
//! Memory-mapped at 0xFFF3_8000. Register layout:
//!
//! | offset | register | notes |
//! |--------|----------|-------|
//! | 0x00   | MCR      | control; MAP bits reset to 0xFF, RIA/CSL/FRZ set |
//! | 0x04   | IR       | TIF, write-one-to-clear |
//! | 0x08   | TO       | timeout in clock ticks, resets to 0x0005_FCD0 |
//! | 0x0C   | WN       | service window (not enforced) |
//! | 0x10   | SR       | service/unlock key entry, reads zero |
//! | 0x14   | CO       | live countdown value, read-only |
//! | 0x18   | SK       | service key seed for MCR[KEY] mode |
//!
//! The rest of the 16KB window is reserved: touching it while the
//! watchdog is enabled with MCR[RIA] set escalates straight to a system
//! reset, otherwise it is a bus error. The same policy covers writes to
//! the locked register set and to read-only registers.
//!
//! Unlocking MCR[SLK] requires writing 0xC520 then 0xD928 to SR; the
//! service sequence is 0xA602 then 0xB480 (or the generated pair when
//! MCR[KEY] is set: next = 17 * key + 3). The two sequences are tracked
//! independently and unrecognized SR values are ignored.

use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};

use crate::bitfield::{PeriphRegister, RegisterSet};
use crate::clock::{EmuTimer, TimeBase};
use crate::exc::{ExcKind, ExcResult, Exception, ExternalSource, ResetSource};
use crate::intc::ExcQueue;
use crate::periph::Peripheral;

/// First/second soft-lock unlock keys.
pub const UNLOCK_KEYS: (u32, u32) = (0xC520, 0xD928);
/// Fixed service key pair used when MCR[KEY] is clear.
pub const SERVICE_KEYS: (u32, u32) = (0xA602, 0xB480);

/// Offset of the first reserved byte after the register file.
const RESERVED_START: u32 = 0x1C;

fn mcr_reg() -> PeriphRegister {
    PeriphRegister::builder()
        .bits_default("map", 8, 0xFF)
        .pad(14)
        .bits("key", 1)
        .bits_default("ria", 1, 1)
        .bits("wnd", 1)
        .bits("itr", 1)
        .bits("hlk", 1)
        .bits("slk", 1)
        .bits_default("csl", 1, 1)
        .bits("stp", 1)
        .bits_default("frz", 1, 1)
        .bits("wen", 1)
        .build()
}

fn ir_reg() -> PeriphRegister {
    PeriphRegister::builder().pad(31).w1c("tif", 1).build()
}

/// State shared with the expiry callback on the timer thread.
struct SwtShared {
    /// Snapshot of MCR[ITR].
    itr: bool,
    /// Set on the first expiry; the second expiry (or the first with
    /// ITR clear) escalates to a reset.
    tif: bool,
    queue: Option<ExcQueue>,
    timer: Option<EmuTimer>,
}

/// The watchdog peripheral.
pub struct Swt {
    pub regs: RegisterSet,
    slk_idx: u8,
    sk_idx: u8,
    timer: Option<EmuTimer>,
    shared: Arc<Mutex<SwtShared>>,
    /// External oscillator frequency (MCR[CSL] = 1).
    extal: f64,
    /// Peripheral clock frequency (MCR[CSL] = 0).
    periph_clock: f64,
}

impl Swt {
    pub fn new(extal: f64, periph_clock: f64) -> Self {
        let mut regs = RegisterSet::new();
        regs.add_reg(0x00, "mcr", mcr_reg());
        regs.add_reg(0x04, "ir", ir_reg());
        regs.add_reg(0x08, "to", PeriphRegister::plain32("wto", 0x0005_FCD0));
        regs.add_reg(0x0C, "wn", PeriphRegister::plain32("wst", 0));
        regs.add_reg(0x10, "sr", PeriphRegister::plain32("wsc", 0));
        regs.add_ro_reg(0x14, "co", PeriphRegister::plain32("cnt", 0));
        regs.add_reg(0x18, "sk", PeriphRegister::plain32("sk", 0));
        Swt {
            regs,
            slk_idx: 0,
            sk_idx: 0,
            timer: None,
            shared: Arc::new(Mutex::new(SwtShared {
                itr: false,
                tif: false,
                queue: None,
                timer: None,
            })),
            extal,
            periph_clock,
        }
    }

    /// Wire the expiry timer and exception queue. Called once.
    pub fn attach(&mut self, time: &TimeBase, queue: ExcQueue) {
        let shared = self.shared.clone();
        let timer = time.register_timer(
            "SWT",
            Box::new(move || {
                let mut s = shared.lock().unwrap();
                let q = s.queue.clone();
                if s.itr && !s.tif {
                    s.tif = true;
                    if let Some(t) = s.timer.clone() {
                        t.start();
                    }
                    drop(s);
                    if let Some(q) = q {
                        q.push(Exception::new(ExcKind::ExternalInput(
                            ExternalSource::SwtTimeout,
                        )));
                    }
                } else {
                    drop(s);
                    if let Some(q) = q {
                        q.push(Exception::new(ExcKind::Reset(ResetSource::Watchdog)));
                    }
                }
            }),
            None,
            None,
        );
        let mut s = self.shared.lock().unwrap();
        s.queue = Some(queue);
        s.timer = Some(timer.clone());
        drop(s);
        self.timer = Some(timer);
    }

    pub fn locked(&self) -> bool {
        self.regs.field("mcr", "slk") != 0 || self.regs.field("mcr", "hlk") != 0
    }

    pub fn enabled(&self) -> bool {
        self.regs.field("mcr", "wen") != 0
    }

    pub fn timer_running(&self) -> bool {
        self.timer.as_ref().map(|t| t.running()).unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn sequence_state(&self) -> (u8, u8) {
        (self.slk_idx, self.sk_idx)
    }

    fn clock_freq(&self) -> f64 {
        if self.regs.field("mcr", "csl") != 0 {
            self.extal
        } else {
            self.periph_clock
        }
    }

    /// Start or stop the countdown to match MCR[WEN], TO and the selected
    /// clock. Must be called after any direct MCR[WEN] override.
    pub fn update_watchdog(&mut self) {
        self.shared.lock().unwrap().itr = self.regs.field("mcr", "itr") != 0;
        let timer = match &self.timer {
            Some(t) => t,
            None => return,
        };
        if self.enabled() {
            let period = self.regs.field("to", "wto") as u64;
            debug!("SWT: watchdog armed, {} ticks @ {} Hz", period, self.clock_freq());
            timer.start_with(Some(self.clock_freq()), Some(period));
        } else {
            debug!("SWT: watchdog stopped");
            timer.stop();
        }
    }

    /// Policy for reserved/locked/read-only access violations: reset when
    /// RIA is set and the watchdog is enabled, bus error otherwise.
    fn invalid_access(&self, write: bool, pc: u32, va: u32) -> Exception {
        if self.regs.field("mcr", "ria") != 0 && self.enabled() {
            Exception::new(ExcKind::Reset(ResetSource::Watchdog))
        } else if write {
            Exception::new(ExcKind::DataWriteBusError { pc, va, written: 0 })
        } else {
            Exception::new(ExcKind::DataReadBusError { pc, va, data: Vec::new() })
        }
    }

    /// Current service key pair: fixed, or generated from SK.
    fn service_keys(&self) -> (u32, u32) {
        if self.regs.field("mcr", "key") == 0 {
            SERVICE_KEYS
        } else {
            let k1 = next_key(self.regs.field("sk", "sk"));
            (k1, next_key(k1))
        }
    }

    fn service_complete(&mut self) {
        if self.regs.field("mcr", "key") != 0 {
            let (_, k2) = self.service_keys();
            self.regs.reg_mut("sk").override_field("sk", k2);
        }
        if self.enabled() {
            debug!("SWT: serviced, restarting countdown");
            self.update_watchdog();
        }
    }

    fn sr_write(&mut self, val: u32) {
        let (u1, u2) = UNLOCK_KEYS;
        let (k1, k2) = self.service_keys();

        // the unlock and service sequences progress independently;
        // unrecognized values are ignored
        if val == u1 && self.slk_idx == 0 {
            self.slk_idx = 1;
        } else if val == u2 && self.slk_idx == 1 {
            self.slk_idx = 0;
            self.sk_idx = 0;
            if self.regs.field("mcr", "slk") != 0 {
                info!("SWT: soft lock cleared");
                self.regs.reg_mut("mcr").override_field("slk", 0);
            }
            return;
        }

        if val == k1 && self.sk_idx == 0 {
            self.sk_idx = 1;
        } else if val == k2 && self.sk_idx == 1 {
            self.sk_idx = 0;
            self.service_complete();
        }
    }

    fn mcr_write(&mut self, val: u32, pc: u32, va: u32) -> ExcResult<()> {
        if self.locked() {
            return Err(self.invalid_access(true, pc, va));
        }
        // HLK can be set by software but never cleared by it
        let hlk = self.regs.field("mcr", "hlk");
        self.regs.reg_mut("mcr").write(val);
        if hlk != 0 {
            self.regs.reg_mut("mcr").override_field("hlk", 1);
        }
        self.update_watchdog();
        Ok(())
    }

    /// MMIO read at `offset` into the SWT window.
    pub fn read(&mut self, offset: u32, size: usize, pc: u32, va: u32) -> ExcResult<Vec<u8>> {
        if offset >= RESERVED_START {
            return Err(self.invalid_access(false, pc, va));
        }
        // compose the live state the register file mirrors
        match offset {
            0x04 => {
                let tif = self.shared.lock().unwrap().tif as u32;
                self.regs.reg_mut("ir").override_field("tif", tif);
            }
            0x14 => {
                let cnt = if self.enabled() {
                    self.timer.as_ref().map(|t| t.ticks_left()).unwrap_or(0) as u32
                } else {
                    0
                };
                self.regs.reg_mut("co").override_field("cnt", cnt);
            }
            _ => {}
        }
        self.regs.read(offset, size).map_err(|_| self.invalid_access(false, pc, va))
    }

    /// MMIO write at `offset` into the SWT window.
    pub fn write(&mut self, offset: u32, bytes: &[u8], pc: u32, va: u32) -> ExcResult<()> {
        if offset >= RESERVED_START {
            return Err(self.invalid_access(true, pc, va));
        }
        if bytes.len() != 4 || offset % 4 != 0 {
            return Err(Exception::new(ExcKind::Alignment { pc, va, transferred: 0 }));
        }
        let val = BigEndian::read_u32(bytes);
        match offset {
            0x00 => self.mcr_write(val, pc, va)?,
            0x04 => {
                self.regs.reg_mut("ir").write(val);
                if val & 1 != 0 {
                    self.shared.lock().unwrap().tif = false;
                }
            }
            0x08 => {
                if self.locked() {
                    return Err(self.invalid_access(true, pc, va));
                }
                self.regs.reg_mut("to").write(val);
                if self.enabled() {
                    self.update_watchdog();
                }
            }
            0x0C => {
                if self.locked() {
                    return Err(self.invalid_access(true, pc, va));
                }
                self.regs.reg_mut("wn").write(val);
            }
            0x10 => self.sr_write(val),
            0x14 => return Err(self.invalid_access(true, pc, va)),
            0x18 => {
                if self.locked() {
                    return Err(self.invalid_access(true, pc, va));
                }
                self.regs.reg_mut("sk").write(val & 0xFFFF);
            }
            _ => return Err(self.invalid_access(true, pc, va)),
        }
        Ok(())
    }
}

/// SWT pseudo-random service key step.
fn next_key(key: u32) -> u32 {
    (key.wrapping_mul(17).wrapping_add(3)) & 0xFFFF
}

impl Peripheral for Swt {
    fn name(&self) -> &'static str {
        "SWT"
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.slk_idx = 0;
        self.sk_idx = 0;
        {
            let mut s = self.shared.lock().unwrap();
            s.tif = false;
            s.itr = false;
        }
        self.update_watchdog();
    }

    fn shutdown(&mut self) {
        if let Some(t) = &self.timer {
            t.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intc::IntController;

    const MCR_DEFAULT: u32 = 0xFF00_010A;
    const MCR_ENABLE: u32 = 0xFF00_010B;
    const TO_DEFAULT: u32 = 0x0005_FCD0;

    fn wr32(v: u32) -> [u8; 4] {
        v.to_be_bytes()
    }

    struct Rig {
        time: TimeBase,
        intc: IntController,
        swt: Swt,
    }

    fn rig() -> Rig {
        let time = TimeBase::new(1.0);
        time.enable(false);
        let intc = IntController::new();
        let mut swt = Swt::new(40_000_000.0, 60_000_000.0);
        swt.attach(&time, intc.queue_handle());
        swt.reset();
        Rig { time, intc, swt }
    }

    /// Poll until at least one exception lands in the pending list; the
    /// expiry may be serviced here or on the reaper thread.
    fn wait_pending(r: &mut Rig) -> usize {
        for _ in 0..2000 {
            r.time.process_expired();
            r.intc.drain_inbox(u32::MAX);
            if r.intc.pending_len() > 0 {
                return r.intc.pending_len();
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("watchdog never expired");
    }

    #[test]
    fn test_mcr_defaults() {
        let mut r = rig();
        let v = r.swt.read(0x00, 4, 0, 0xFFF3_8000).unwrap();
        assert_eq!(BigEndian::read_u32(&v), MCR_DEFAULT);
        assert_eq!(r.swt.regs.field("mcr", "ria"), 1);
        assert_eq!(r.swt.regs.field("mcr", "csl"), 1);
        assert_eq!(r.swt.regs.field("mcr", "frz"), 1);
        assert_eq!(r.swt.regs.field("mcr", "wen"), 0);
        assert!(!r.swt.timer_running());
    }

    #[test]
    fn test_to_default_and_enable() {
        let mut r = rig();
        let v = r.swt.read(0x08, 4, 0, 0).unwrap();
        assert_eq!(BigEndian::read_u32(&v), TO_DEFAULT);

        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();
        assert!(r.swt.enabled());
        assert!(r.swt.timer_running());

        // disable stops the countdown
        r.swt.write(0x00, &wr32(MCR_DEFAULT), 0, 0).unwrap();
        assert!(!r.swt.timer_running());
    }

    #[test]
    fn test_co_counts_down_only_while_enabled() {
        let mut r = rig();
        let v = r.swt.read(0x14, 4, 0, 0).unwrap();
        assert_eq!(BigEndian::read_u32(&v), 0);

        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();
        let v = BigEndian::read_u32(&r.swt.read(0x14, 4, 0, 0).unwrap());
        assert!(v > 0 && v <= TO_DEFAULT, "CO = {:#x}", v);

        r.swt.write(0x00, &wr32(MCR_DEFAULT), 0, 0).unwrap();
        let v = BigEndian::read_u32(&r.swt.read(0x14, 4, 0, 0).unwrap());
        assert_eq!(v, 0);
    }

    #[test]
    fn test_ir_write_one_to_clear() {
        let mut r = rig();
        r.swt.shared.lock().unwrap().tif = true;
        let v = BigEndian::read_u32(&r.swt.read(0x04, 4, 0, 0).unwrap());
        assert_eq!(v, 1);

        // writing zero does not clear
        r.swt.write(0x04, &wr32(0), 0, 0).unwrap();
        let v = BigEndian::read_u32(&r.swt.read(0x04, 4, 0, 0).unwrap());
        assert_eq!(v, 1);

        r.swt.write(0x04, &wr32(1), 0, 0).unwrap();
        let v = BigEndian::read_u32(&r.swt.read(0x04, 4, 0, 0).unwrap());
        assert_eq!(v, 0);
    }

    #[test]
    fn test_soft_lock_blocks_mcr_and_unlock_sequence_clears() {
        let mut r = rig();
        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();
        r.swt.write(0x00, &wr32(MCR_ENABLE | 0x10), 0, 0).unwrap();
        assert!(r.swt.locked());

        // a locked MCR write escalates to a watchdog reset (RIA set)
        let err = r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap_err();
        assert_eq!(err.kind, ExcKind::Reset(ResetSource::Watchdog));

        // unrecognized SR values are ignored entirely
        for junk in [0u32, 0xFFFF, 0xB480, 0xD928, 0x1234_5678] {
            r.swt.write(0x10, &wr32(junk), 0, 0).unwrap();
            assert_eq!(r.swt.sequence_state(), (0, 0));
        }

        // the first service key is accepted in parallel with the unlock
        r.swt.write(0x10, &wr32(0xA602), 0, 0).unwrap();
        assert_eq!(r.swt.sequence_state(), (0, 1));
        r.swt.write(0x10, &wr32(0xC520), 0, 0).unwrap();
        assert_eq!(r.swt.sequence_state(), (1, 1));

        // still locked until the second unlock key
        assert!(r.swt.locked());
        r.swt.write(0x10, &wr32(0xD928), 0, 0).unwrap();
        assert_eq!(r.swt.sequence_state(), (0, 0));
        assert!(!r.swt.locked());

        // now MCR writes work again
        r.swt.write(0x00, &wr32(MCR_DEFAULT), 0, 0).unwrap();
        assert!(!r.swt.enabled());
    }

    #[test]
    fn test_hard_lock_survives_unlock_sequence() {
        let mut r = rig();
        r.swt.write(0x00, &wr32(MCR_ENABLE | 0x20), 0, 0).unwrap();
        assert_eq!(r.swt.regs.field("mcr", "hlk"), 1);
        assert!(r.swt.locked());

        r.swt.write(0x10, &wr32(0xC520), 0, 0).unwrap();
        r.swt.write(0x10, &wr32(0xD928), 0, 0).unwrap();
        assert_eq!(r.swt.regs.field("mcr", "hlk"), 1);
        assert!(r.swt.locked());
    }

    #[test]
    fn test_service_sequence_restarts_timer() {
        let mut r = rig();
        // widen the window to 1 second so wall-clock drift is noise
        r.swt.write(0x08, &wr32(40_000_000), 0, 0).unwrap();
        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();

        // run the clock down a little
        r.time.advance(0.1);
        let before = r.swt.timer.as_ref().unwrap().ticks_left();
        assert!(before < 40_000_000);

        r.swt.write(0x10, &wr32(0xA602), 0, 0).unwrap();
        r.swt.write(0x10, &wr32(0xB480), 0, 0).unwrap();
        assert_eq!(r.swt.sequence_state(), (0, 0));
        let after = r.swt.timer.as_ref().unwrap().ticks_left();
        assert!(after > before, "{} > {}", after, before);
    }

    #[test]
    fn test_keyed_service_sequence() {
        let mut r = rig();
        // enable with KEY set; SK seeds the generator
        r.swt.write(0x00, &wr32(MCR_ENABLE | 0x200), 0, 0).unwrap();
        r.swt.write(0x18, &wr32(0x0100), 0, 0).unwrap();
        let k1 = next_key(0x0100);
        let k2 = next_key(k1);

        // the fixed keys no longer advance the sequence
        r.swt.write(0x10, &wr32(0xA602), 0, 0).unwrap();
        assert_eq!(r.swt.sequence_state(), (0, 0));

        r.swt.write(0x10, &wr32(k1), 0, 0).unwrap();
        assert_eq!(r.swt.sequence_state(), (0, 1));
        r.swt.write(0x10, &wr32(k2), 0, 0).unwrap();
        assert_eq!(r.swt.sequence_state(), (0, 0));
        // SK advanced so the next pair differs
        assert_eq!(r.swt.regs.field("sk", "sk"), k2);
    }

    #[test]
    fn test_expiry_interrupt_then_reset() {
        let mut r = rig();
        // 10 second timeout keeps wall-clock drift out of the picture
        r.swt.write(0x08, &wr32(400_000_000), 0, 0).unwrap();
        // ITR set: first expiry raises the external interrupt
        r.swt.write(0x00, &wr32(MCR_ENABLE | 0x40), 0, 0).unwrap();

        r.time.advance(10.5);
        assert_eq!(wait_pending(&mut r), 1);
        assert!(r.intc.is_exception_active(|k| matches!(k, ExcKind::ExternalInput(_))));
        let v = BigEndian::read_u32(&r.swt.read(0x04, 4, 0, 0).unwrap());
        assert_eq!(v, 1, "IR[TIF] set after first expiry");
        assert!(r.swt.timer_running(), "restarted for the second window");

        // second expiry escalates to reset
        r.intc.reset();
        r.time.advance(10.5);
        wait_pending(&mut r);
        assert!(r
            .intc
            .is_exception_active(|k| *k == ExcKind::Reset(ResetSource::Watchdog)));
    }

    #[test]
    fn test_expiry_straight_to_reset_without_itr() {
        let mut r = rig();
        r.swt.write(0x08, &wr32(400_000_000), 0, 0).unwrap();
        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();

        r.time.advance(10.5);
        assert_eq!(wait_pending(&mut r), 1);
        assert!(r
            .intc
            .is_exception_active(|k| *k == ExcKind::Reset(ResetSource::Watchdog)));
        assert!(!r.swt.timer_running());
    }

    #[test]
    fn test_reserved_access_policy() {
        let mut r = rig();
        // watchdog disabled: bus error even with RIA set
        let err = r.swt.read(0x100, 4, 0x1000, 0xFFF3_8100).unwrap_err();
        assert_eq!(
            err.kind,
            ExcKind::DataReadBusError { pc: 0x1000, va: 0xFFF3_8100, data: vec![] }
        );

        // enabled with RIA: escalate to reset
        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();
        let err = r.swt.write(0x100, &wr32(0), 0, 0xFFF3_8100).unwrap_err();
        assert_eq!(err.kind, ExcKind::Reset(ResetSource::Watchdog));

        // enabled with RIA clear: bus error
        r.swt.write(0x00, &wr32(MCR_ENABLE & !0x100), 0, 0).unwrap();
        let err = r.swt.write(0x100, &wr32(0), 0x20, 0xFFF3_8100).unwrap_err();
        assert_eq!(
            err.kind,
            ExcKind::DataWriteBusError { pc: 0x20, va: 0xFFF3_8100, written: 0 }
        );
    }

    #[test]
    fn test_co_is_read_only() {
        let mut r = rig();
        assert!(r.swt.write(0x14, &wr32(5), 0, 0).is_err());
    }

    #[test]
    fn test_csl_switches_clock() {
        let mut r = rig();
        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();
        assert_eq!(r.swt.timer.as_ref().unwrap().freq(), Some(40_000_000.0));
        // clear CSL: peripheral clock drives the countdown
        r.swt.write(0x00, &wr32(MCR_ENABLE & !0x8), 0, 0).unwrap();
        assert_eq!(r.swt.timer.as_ref().unwrap().freq(), Some(60_000_000.0));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut r = rig();
        r.swt.write(0x00, &wr32(MCR_ENABLE), 0, 0).unwrap();
        r.swt.write(0x10, &wr32(0xA602), 0, 0).unwrap();
        r.swt.reset();
        assert_eq!(r.swt.sequence_state(), (0, 0));
        assert!(!r.swt.enabled());
        assert!(!r.swt.timer_running());
        let v = BigEndian::read_u32(&r.swt.read(0x00, 4, 0, 0).unwrap());
        assert_eq!(v, MCR_DEFAULT);
    }
}
