//! Priority-stacked interrupt controller for the e200 core.
//!
//! Exceptions queued here wait in a priority-sorted pending list. Between
//! instructions the execution loop asks whether the head of the list
//! preempts the current level; if so it is popped, pushed onto the active
//! stack, its context registers are written and the PC moves to
//! IVPR + IVOR (or to an external sub-controller's computed handler for
//! EXTERNAL_INPUT, which supports hardware vectoring). Return-from-interrupt
//! unwinds the active stack and restores the preempted priority level.
//!
//! Timer callbacks and IO threads enqueue through a guarded inbox which the
//! execution thread drains at the next `check` boundary, so the pending
//! list itself stays single-threaded.

use std::mem;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::exc::{ExcKind, Exception, ExternalSource, SaveClass, LEVEL_NONE};
use crate::regs::{msr_bits, spr, RegisterFile};

/// External interrupt controller hook for the EXTERNAL_INPUT vector.
pub trait ExternalIntc: Send {
    /// Handler address for the given source (hardware vector mode computes
    /// it from the INTC tables and raises the current priority).
    fn handler(&mut self, regs: &RegisterFile, src: ExternalSource) -> u32;

    /// Best-effort notification that a return-from-interrupt retired an
    /// exception. Not a contract; default is a no-op.
    fn rfi(&mut self) {}
}

/// Cloneable handle used by timer callbacks and IO threads to queue
/// exceptions from outside the execution thread.
#[derive(Clone)]
pub struct ExcQueue {
    inbox: Arc<Mutex<Vec<Exception>>>,
}

impl ExcQueue {
    pub fn push(&self, exc: Exception) {
        self.inbox.lock().unwrap().push(exc);
    }
}

/// Observer invoked when an exception of a matching kind is dispatched.
type DispatchObserver = Box<dyn FnMut(&ExcKind) + Send>;

pub struct IntController {
    pending: Vec<Exception>,
    inbox: Arc<Mutex<Vec<Exception>>>,
    stack: Vec<Exception>,
    /// True when the head of the pending list preempts the current level.
    pub has_interrupt: bool,
    cur_lvl: u8,
    external: Option<Box<dyn ExternalIntc>>,
    observers: Vec<(u8, DispatchObserver)>,
}

impl IntController {
    pub fn new() -> Self {
        IntController {
            pending: Vec::new(),
            inbox: Arc::new(Mutex::new(Vec::new())),
            stack: Vec::new(),
            has_interrupt: false,
            cur_lvl: LEVEL_NONE,
            external: None,
            observers: Vec::new(),
        }
    }

    /// Handle for cross-thread enqueues.
    pub fn queue_handle(&self) -> ExcQueue {
        ExcQueue { inbox: self.inbox.clone() }
    }

    /// Register the external sub-controller for EXTERNAL_INPUT vectoring.
    /// Panics if one is already registered.
    pub fn register_external(&mut self, ctrl: Box<dyn ExternalIntc>) {
        assert!(self.external.is_none(), "external interrupt controller already registered");
        self.external = Some(ctrl);
    }

    /// Observe dispatches whose kind has the given priority ordinal.
    pub fn add_observer(&mut self, prio: u8, f: DispatchObserver) {
        self.observers.push((prio, f));
    }

    /// Clear all pending and active state back to the post-reset default.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.inbox.lock().unwrap().clear();
        self.stack.clear();
        self.has_interrupt = false;
        self.cur_lvl = LEVEL_NONE;
    }

    pub fn current_level(&self) -> u8 {
        self.cur_lvl
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue an exception. Exceptions masked by the current MSR are dropped
    /// rather than left pending.
    pub fn queue(&mut self, exc: Exception, msr: u32) {
        if !exc.kind.should_handle(msr) {
            warn!("not handling masked exception: {:?}", exc.kind);
            return;
        }
        debug!("queuing exception: {:?}", exc.kind);
        self.pending.push(exc);
        self.pending.sort_by_key(|e| e.priority());
        self.has_interrupt = self.cur_lvl > self.pending[0].priority();
    }

    /// Drain cross-thread enqueues into the pending list. Called by the
    /// execution loop before each eligibility check.
    pub fn drain_inbox(&mut self, msr: u32) {
        let drained: Vec<Exception> = mem::take(&mut *self.inbox.lock().unwrap());
        for exc in drained {
            // the decrementer never stacks a second exception behind one
            // that is already pending or being handled
            if matches!(exc.kind, ExcKind::Decrementer)
                && self.is_exception_active(|k| matches!(k, ExcKind::Decrementer))
            {
                continue;
            }
            self.queue(exc, msr);
        }
    }

    /// Resets never vector through IVPR; the step loop pulls them out of
    /// the queue and restarts the processor instead.
    pub fn take_pending_reset(&mut self) -> Option<crate::exc::ResetSource> {
        if let Some(ExcKind::Reset(src)) = self.pending.first().map(|e| &e.kind) {
            let src = *src;
            self.pending.remove(0);
            self.msr_updated();
            return Some(src);
        }
        None
    }

    /// MSR changed: re-evaluate whether the head preempts.
    pub fn msr_updated(&mut self) {
        self.has_interrupt =
            !self.pending.is_empty() && self.cur_lvl > self.pending[0].priority();
    }

    /// Whether any active or pending exception matches `pred`.
    pub fn is_exception_active(&self, pred: impl Fn(&ExcKind) -> bool) -> bool {
        self.stack.iter().any(|e| pred(&e.kind)) || self.pending.iter().any(|e| pred(&e.kind))
    }

    /// Attach a cleanup closure to the first active or pending exception
    /// matching `pred`. Returns false if none matched.
    pub fn attach_cleanup(
        &mut self,
        pred: impl Fn(&ExcKind) -> bool,
        f: Box<dyn FnOnce() + Send>,
    ) -> bool {
        if let Some(e) = self
            .stack
            .iter_mut()
            .chain(self.pending.iter_mut())
            .find(|e| pred(&e.kind))
        {
            e.set_cleanup(f);
            return true;
        }
        false
    }

    /// If an eligible exception is pending, dispatch it: push it on the
    /// active stack, write the save/restore pair, mask MSR bits and move PC
    /// to the handler. Returns the dispatched priority.
    pub fn check_exception(&mut self, regs: &mut RegisterFile) -> Option<u8> {
        if !self.has_interrupt {
            return None;
        }
        let exc = self.pending.remove(0);
        let prio = exc.priority();
        let kind = exc.kind.clone();

        self.setup_context(regs, &kind);

        let new_pc = self.handler_pc(regs, &kind);
        debug!(
            "PC: 0x{:08x} ({:?})  LVL: {} -> {}  NEWPC: 0x{:08x}",
            regs.pc, kind, self.cur_lvl, prio, new_pc
        );
        regs.pc = new_pc;

        self.stack.push(exc);
        self.cur_lvl = prio;

        for (p, f) in &mut self.observers {
            if *p == prio {
                f(&kind);
            }
        }

        self.has_interrupt =
            !self.pending.is_empty() && self.cur_lvl > self.pending[0].priority();
        Some(prio)
    }

    fn handler_pc(&mut self, regs: &RegisterFile, kind: &ExcKind) -> u32 {
        if let ExcKind::ExternalInput(src) = kind {
            if let Some(ext) = self.external.as_mut() {
                return ext.handler(regs, *src);
            }
        }
        let ivpr = regs.get_spr32(spr::IVPR);
        let ivor = kind.ivor().map(|r| regs.get_spr32(r)).unwrap_or(0);
        ivpr.wrapping_add(ivor)
    }

    /// Write the save/restore registers and update MSR for a dispatch.
    fn setup_context(&self, regs: &mut RegisterFile, kind: &ExcKind) {
        // check_exception runs between instructions, so PC already names
        // the next instruction for asynchronous interrupts and the restart
        // point for synchronous faults.
        let saved_pc = regs.pc;
        let saved_msr = regs.msr;

        let base_clear =
            msr_bits::EE | msr_bits::PR | msr_bits::FP | msr_bits::FE0 | msr_bits::FE1
                | msr_bits::IS | msr_bits::DS | msr_bits::WE | msr_bits::SPE | msr_bits::UCLE;

        match kind.save_class() {
            SaveClass::Base => {
                regs.set_spr32(spr::SRR0, saved_pc);
                regs.set_spr32(spr::SRR1, saved_msr);
                regs.msr &= !base_clear;
            }
            SaveClass::Critical => {
                regs.set_spr32(spr::CSRR0, saved_pc);
                regs.set_spr32(spr::CSRR1, saved_msr);
                regs.msr &= !(base_clear | msr_bits::CE);
            }
            SaveClass::MachineCheck => {
                regs.set_spr32(spr::MCSRR0, saved_pc);
                regs.set_spr32(spr::MCSRR1, saved_msr);
                regs.msr &= !(base_clear | msr_bits::CE | msr_bits::ME | msr_bits::DE);
            }
            SaveClass::Debug => {
                regs.set_spr32(spr::DSRR0, saved_pc);
                regs.set_spr32(spr::DSRR1, saved_msr);
                regs.msr &= !(base_clear | msr_bits::DE);
            }
            SaveClass::None => {}
        }

        // fault context registers
        match kind {
            ExcKind::DataReadBusError { va, .. }
            | ExcKind::DataWriteBusError { va, .. }
            | ExcKind::Alignment { va, .. }
            | ExcKind::DataTlbMiss { va } => {
                regs.set_spr32(spr::DEAR, *va);
            }
            ExcKind::MachineCheck => {
                regs.set_spr32(spr::MCAR, saved_pc);
            }
            _ => {}
        }
    }

    /// Return-from-interrupt bookkeeping: pop the active stack, run its
    /// cleanup, restore the preempted level. The instruction itself has
    /// already restored PC and MSR from the SRR pair.
    pub fn return_from_interrupt(&mut self) {
        match self.stack.pop() {
            Some(mut old) => {
                old.do_cleanup();
            }
            None => {
                warn!("return-from-interrupt with empty active stack");
            }
        }
        self.cur_lvl = match self.stack.last() {
            Some(top) => top.priority(),
            None => LEVEL_NONE,
        };
        if let Some(ext) = self.external.as_mut() {
            ext.rfi();
        }
        self.has_interrupt =
            !self.pending.is_empty() && self.cur_lvl > self.pending[0].priority();
    }
}

impl Default for IntController {
    fn default() -> Self {
        Self::new()
    }
}
