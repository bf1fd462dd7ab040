//! Peripheral models owned by the core.
//!
//! Each peripheral implements [`Peripheral`]: `init` runs once when the
//! emulator is constructed, `reset` returns the model to its power-on
//! register state, and `shutdown` releases any timers or worker state.
//! The core invokes these in insertion order (SWT, flash, BAM). Peripherals
//! fed by external IO tasks receive frames through `process_received`,
//! dispatched one item per step from the core's IO queue.

pub mod bam;
pub mod flash;
pub mod swt;

pub use bam::Bam;
pub use flash::{FlashBank, FlashController};
pub use swt::Swt;

use crate::exc::ResetSource;

/// Lifecycle contract every peripheral model implements.
pub trait Peripheral {
    /// Short identifier used in the module registry and log lines.
    fn name(&self) -> &'static str;

    /// One-time wiring after construction (timers, queue handles).
    fn init(&mut self) {}

    /// Restore the power-on register state.
    fn reset(&mut self);

    /// Stop timers and worker state before teardown.
    fn shutdown(&mut self) {}

    /// Reset-cause notification delivered after a reset is processed.
    fn set_reset_source(&mut self, _src: ResetSource) {}

    /// Deliver one frame from the external IO queue.
    fn process_received(&mut self, _data: Vec<u8>) {}
}
