//! Exception and interrupt records for the e200z7 core.
//!
//! Every execution-time fault in the emulator is an [`Exception`] value.
//! Exceptions travel as the error arm of a `Result` until the step loop
//! catches them and hands them to the interrupt controller, which orders
//! them by the e200z7 priority table and dispatches through IVPR+IVOR.

use std::fmt;

use crate::regs::spr;

/// Sources that can force a system reset.
///
/// RSR/MRSR status bits in the SIU and ECSM are derived from this value by
/// the peripherals that care; the core only records the most recent source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetSource {
    PowerOn,
    External,
    SoftwareSystem,
    SoftwareExternal,
    LossOfLock,
    LossOfClock,
    /// e200z7 core watchdog (TSR/TCR machinery)
    CoreWatchdog,
    Debug,
    /// SWT peripheral
    Watchdog,
}

/// External interrupt request sources routed through the INTC.
///
/// The numeric value is the MPC5674F INTC vector number for the source.
/// Only the sources the core subsystems raise are named here; the enum is
/// closed on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ExternalSource {
    SwtTimeout = 18,
    EcsmEccError = 9,
    FlexCanABuf0 = 155,
    FlexCanABuf1 = 156,
    DspiARxDrain = 132,
    DspiATxFill = 131,
}

/// Priority level used when no exception is being handled.
pub const LEVEL_NONE: u8 = 100;

/// Typed exception kinds.
///
/// Context payloads follow the original bus-fault records: the PC and
/// virtual address of the access plus however much data had been
/// transferred when the fault fired.
#[derive(Debug, Clone, PartialEq)]
pub enum ExcKind {
    Reset(ResetSource),
    MachineCheck,
    CriticalInput,
    /// Data read hit no TLB entry / no region / no permission.
    DataReadBusError { pc: u32, va: u32, data: Vec<u8> },
    /// Data write rejected; `written` counts bytes accepted before the fault.
    DataWriteBusError { pc: u32, va: u32, written: usize },
    /// Multi-field peripheral access straddling a field boundary.
    Alignment { pc: u32, va: u32, transferred: usize },
    /// No matching TLB entry for a data access.
    DataTlbMiss { va: u32 },
    /// No matching TLB entry for an instruction fetch.
    InstrTlbMiss { va: u32 },
    Program,
    SystemCall,
    ExternalInput(ExternalSource),
    FixedInterval,
    Decrementer,
    /// e200z7 core watchdog interrupt (IVOR12), not the SWT peripheral.
    WatchdogTimer,
    Debug,
    PerformanceMonitor,
    /// Decoder rejected the encoding. Converted to `Program` by the loop.
    InvalidInstruction { pc: u32 },
    /// Decoder recognized but cannot execute the encoding.
    UnsupportedInstruction { pc: u32 },
    /// Administrative: the GDB stub wants control back in the driver.
    GdbHalt,
}

/// Dispatch class selecting the save/restore register pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveClass {
    /// SRR0/SRR1
    Base,
    /// CSRR0/CSRR1
    Critical,
    /// MCSRR0/MCSRR1
    MachineCheck,
    /// DSRR0/DSRR1
    Debug,
    /// No context save (reset and administrative kinds).
    None,
}

impl ExcKind {
    /// Priority ordinal, smaller is higher priority. Matches the e200z7
    /// interrupt priority table.
    pub fn priority(&self) -> u8 {
        match self {
            ExcKind::Reset(_) => 0,
            ExcKind::MachineCheck => 1,
            ExcKind::Debug => 3,
            ExcKind::CriticalInput => 4,
            ExcKind::WatchdogTimer => 5,
            ExcKind::ExternalInput(_) => 6,
            ExcKind::FixedInterval => 7,
            ExcKind::Decrementer => 8,
            ExcKind::PerformanceMonitor => 9,
            ExcKind::InstrTlbMiss { .. } => 11,
            ExcKind::Program => 13,
            ExcKind::InvalidInstruction { .. } => 16,
            ExcKind::UnsupportedInstruction { .. } => 16,
            ExcKind::SystemCall => 18,
            ExcKind::DataTlbMiss { .. } => 21,
            ExcKind::DataReadBusError { .. } => 22,
            ExcKind::DataWriteBusError { .. } => 22,
            ExcKind::Alignment { .. } => 23,
            ExcKind::GdbHalt => LEVEL_NONE,
        }
    }

    /// SPR index of the IVOR register for this kind, `None` for reset and
    /// administrative kinds (reset does not vector through IVPR).
    pub fn ivor(&self) -> Option<u16> {
        match self {
            ExcKind::Reset(_) | ExcKind::GdbHalt => None,
            ExcKind::CriticalInput => Some(spr::IVOR0),
            ExcKind::MachineCheck => Some(spr::IVOR1),
            ExcKind::DataReadBusError { .. } | ExcKind::DataWriteBusError { .. } => {
                Some(spr::IVOR2)
            }
            ExcKind::InstrTlbMiss { .. } => Some(spr::IVOR14),
            ExcKind::ExternalInput(_) => Some(spr::IVOR4),
            ExcKind::Alignment { .. } => Some(spr::IVOR5),
            ExcKind::Program
            | ExcKind::InvalidInstruction { .. }
            | ExcKind::UnsupportedInstruction { .. } => Some(spr::IVOR6),
            ExcKind::SystemCall => Some(spr::IVOR8),
            ExcKind::Decrementer => Some(spr::IVOR10),
            ExcKind::FixedInterval => Some(spr::IVOR11),
            ExcKind::WatchdogTimer => Some(spr::IVOR12),
            ExcKind::DataTlbMiss { .. } => Some(spr::IVOR13),
            ExcKind::Debug => Some(spr::IVOR15),
            ExcKind::PerformanceMonitor => Some(spr::IVOR35),
        }
    }

    /// Which save/restore register pair a dispatch of this kind uses.
    pub fn save_class(&self) -> SaveClass {
        match self {
            ExcKind::Reset(_) | ExcKind::GdbHalt => SaveClass::None,
            ExcKind::MachineCheck => SaveClass::MachineCheck,
            ExcKind::CriticalInput | ExcKind::WatchdogTimer => SaveClass::Critical,
            ExcKind::Debug => SaveClass::Debug,
            _ => SaveClass::Base,
        }
    }

    /// Whether the exception is an asynchronous interrupt (context saves the
    /// next PC) rather than a synchronous fault (context saves the faulting
    /// PC).
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            ExcKind::ExternalInput(_)
                | ExcKind::CriticalInput
                | ExcKind::WatchdogTimer
                | ExcKind::FixedInterval
                | ExcKind::Decrementer
                | ExcKind::PerformanceMonitor
                | ExcKind::Debug
        )
    }

    /// MSR gating: masked exceptions are dropped at queue time rather than
    /// left pending.
    pub fn should_handle(&self, msr: u32) -> bool {
        use crate::regs::msr_bits;
        match self {
            ExcKind::ExternalInput(_) | ExcKind::FixedInterval | ExcKind::Decrementer => {
                msr & msr_bits::EE != 0
            }
            ExcKind::CriticalInput | ExcKind::WatchdogTimer => msr & msr_bits::CE != 0,
            ExcKind::MachineCheck => msr & msr_bits::ME != 0,
            ExcKind::Debug => msr & msr_bits::DE != 0,
            _ => true,
        }
    }
}

/// Cleanup hook run when the exception is retired by a return-from-interrupt.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// An exception instance: a kind plus an optional cleanup closure.
pub struct Exception {
    pub kind: ExcKind,
    cleanup: Option<CleanupFn>,
}

impl Exception {
    pub fn new(kind: ExcKind) -> Self {
        Exception { kind, cleanup: None }
    }

    /// Attach (or replace) the cleanup closure.
    pub fn set_cleanup(&mut self, f: CleanupFn) {
        self.cleanup = Some(f);
    }

    pub fn with_cleanup(kind: ExcKind, f: CleanupFn) -> Self {
        Exception { kind, cleanup: Some(f) }
    }

    /// Run the attached cleanup closure, if any.
    pub fn do_cleanup(&mut self) {
        if let Some(f) = self.cleanup.take() {
            f();
        }
    }

    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }
}

impl From<ExcKind> for Exception {
    fn from(kind: ExcKind) -> Self {
        Exception::new(kind)
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exception({:?})", self.kind)
    }
}

impl PartialEq for Exception {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

/// Result alias used on every execution path that can fault.
pub type ExcResult<T> = Result<T, Exception>;
