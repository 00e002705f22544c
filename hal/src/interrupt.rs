//! Interrupt line control
//!
//! Partitions own interrupt lines through their manifests. The partition
//! manager masks, unmasks and acknowledges those lines through an
//! [`InterruptHal`]; it never touches an interrupt controller directly.

use core_types::IrqSource;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Controller operations on a single interrupt line
///
/// Lines start masked.
pub trait InterruptHal: Send + Sync {
    /// Unmasks `source`
    ///
    /// Returns true if an interrupt was latched while the line was masked;
    /// the latch is consumed and the caller must deliver it.
    fn enable(&self, source: IrqSource) -> bool;

    /// Masks `source`, returning whether it was unmasked before
    fn disable(&self, source: IrqSource) -> bool;

    /// Drops an interrupt latched on `source`
    fn clear_pending(&self, source: IrqSource);

    /// Raises `source`
    ///
    /// Returns true if the interrupt should be taken now. A masked line
    /// latches the interrupt instead.
    fn trigger(&self, source: IrqSource) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
struct Line {
    enabled: bool,
    pending: bool,
}

/// Interrupt controller simulated in software
#[derive(Debug, Default)]
pub struct SimulatedInterrupts {
    lines: Mutex<HashMap<IrqSource, Line>>,
}

impl SimulatedInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, source: IrqSource) -> bool {
        self.lines
            .lock()
            .get(&source)
            .map_or(false, |line| line.enabled)
    }

    pub fn is_pending(&self, source: IrqSource) -> bool {
        self.lines
            .lock()
            .get(&source)
            .map_or(false, |line| line.pending)
    }
}

impl InterruptHal for SimulatedInterrupts {
    fn enable(&self, source: IrqSource) -> bool {
        let mut lines = self.lines.lock();
        let line = lines.entry(source).or_default();
        line.enabled = true;
        std::mem::take(&mut line.pending)
    }

    fn disable(&self, source: IrqSource) -> bool {
        let mut lines = self.lines.lock();
        let line = lines.entry(source).or_default();
        std::mem::replace(&mut line.enabled, false)
    }

    fn clear_pending(&self, source: IrqSource) {
        if let Some(line) = self.lines.lock().get_mut(&source) {
            line.pending = false;
        }
    }

    fn trigger(&self, source: IrqSource) -> bool {
        let mut lines = self.lines.lock();
        let line = lines.entry(source).or_default();
        if !line.enabled {
            log::debug!("{} latched while masked", source);
            line.pending = true;
        }
        line.enabled
    }
}
