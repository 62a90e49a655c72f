//! The Executive / Real-time Clock collaborator. The core only ever reads
//! the tick count and tick resolution; it never calls back into the
//! executive beyond that.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tick count and tick resolution, as the simulation executive would
/// provide them to a scheduled job.
pub trait Executive: Send + Sync {
    /// Current tick count at the executive's clock resolution.
    fn current_tics(&self) -> u64;

    /// Tics per second (the "tic value").
    fn tic_value(&self) -> f64;

    fn current_seconds(&self) -> f64 {
        self.current_tics() as f64 / self.tic_value()
    }
}

/// A free-running tick counter driven by an external caller (a ticking
/// thread in the CLI demo, or a test harness advancing ticks by hand).
pub struct ManualExecutive {
    tics: AtomicU64,
    tic_value: f64,
}

impl ManualExecutive {
    pub fn new(tic_value: f64) -> Self {
        Self { tics: AtomicU64::new(0), tic_value }
    }

    pub fn advance(&self, delta_tics: u64) -> u64 {
        self.tics.fetch_add(delta_tics, Ordering::SeqCst) + delta_tics
    }

    pub fn set(&self, tics: u64) {
        self.tics.store(tics, Ordering::SeqCst);
    }
}

impl Executive for ManualExecutive {
    fn current_tics(&self) -> u64 {
        self.tics.load(Ordering::SeqCst)
    }

    fn tic_value(&self) -> f64 {
        self.tic_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_increments_monotonically() {
        let exec = ManualExecutive::new(1000.0);
        assert_eq!(exec.current_tics(), 0);
        exec.advance(1000);
        assert_eq!(exec.current_tics(), 1000);
        assert!((exec.current_seconds() - 1.0).abs() < 1e-9);
    }
}
