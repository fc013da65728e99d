use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Snapshot of a task's progress as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub operation: String,
    pub amount: f64,
}

#[derive(Debug)]
struct ProgressState {
    operation: String,
    amount: f64,
    modified: bool,
}

/// Progress shared between the worker writing it and the poll cycle
/// reading it.
///
/// Amounts are kept in `[0, 1]`. Every write that changes the operation or
/// the amount marks the progress as modified; [`Progress::take_modified`]
/// returns a snapshot and clears the flag, so unchanged progress is not
/// broadcast twice.
#[derive(Debug, Clone)]
pub struct Progress {
    state: Arc<Mutex<ProgressState>>,
}

impl Progress {
    pub fn new(operation: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProgressState {
                operation: operation.to_owned(),
                amount: 0.0,
                modified: true,
            })),
        }
    }

    /// Set operation and absolute amount.
    pub fn update(&self, operation: &str, amount: f64) {
        let mut state = self.lock();
        Self::set(&mut state, operation, amount);
    }

    /// Set operation and add `delta` to the amount.
    ///
    /// Receiving the next file and loading the previous one run at the same
    /// time, so both sides only ever add their own share.
    pub fn increment(&self, operation: &str, delta: f64) {
        let mut state = self.lock();
        let amount = state.amount + delta;
        Self::set(&mut state, operation, amount);
    }

    pub fn snapshot(&self) -> ProgressReport {
        let state = self.lock();
        ProgressReport {
            operation: state.operation.clone(),
            amount: state.amount,
        }
    }

    /// Snapshot and clear the modified flag, `None` if nothing changed.
    pub fn take_modified(&self) -> Option<ProgressReport> {
        let mut state = self.lock();
        if !state.modified {
            return None;
        }
        state.modified = false;
        Some(ProgressReport {
            operation: state.operation.clone(),
            amount: state.amount,
        })
    }

    /// A slice of this progress worth `weight` of the whole.
    pub fn phase(&self, weight: f64) -> ProgressPhase {
        ProgressPhase {
            progress: self.clone(),
            weight: weight.clamp(0.0, 1.0),
            reached: Mutex::new(0.0),
        }
    }

    fn set(state: &mut ProgressState, operation: &str, amount: f64) {
        let amount = amount.clamp(0.0, 1.0);
        if state.operation != operation {
            state.operation = operation.to_owned();
            state.modified = true;
        }
        if state.amount != amount {
            state.amount = amount;
            state.modified = true;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Weighted sub-range of a [`Progress`].
///
/// Fractions reported here are local to the phase (`0.0..=1.0`) and never
/// go backwards: a lower fraction only updates the operation text.
#[derive(Debug)]
pub struct ProgressPhase {
    progress: Progress,
    weight: f64,
    reached: Mutex<f64>,
}

impl ProgressPhase {
    pub fn report(&self, operation: &str, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut reached = self
            .reached
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if fraction > *reached {
            let delta = self.weight * (fraction - *reached);
            *reached = fraction;
            self.progress.increment(operation, delta);
        } else {
            self.progress.increment(operation, 0.0);
        }
    }

    pub fn finish(&self, operation: &str) {
        self.report(operation, 1.0);
    }

    pub fn reached(&self) -> f64 {
        *self
            .reached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_modified_clears_flag() {
        let progress = Progress::new("Scheduling task ...");
        assert!(progress.take_modified().is_some());
        assert!(progress.take_modified().is_none());

        progress.update("Scheduling task ...", 0.0);
        assert!(progress.take_modified().is_none());

        progress.increment("Receiving ...", 0.25);
        let report = progress.take_modified().unwrap();
        assert_eq!(report.operation, "Receiving ...");
        assert_eq!(report.amount, 0.25);
    }

    #[test]
    fn amount_is_clamped() {
        let progress = Progress::new("");
        progress.increment("a", 0.75);
        progress.increment("a", 0.75);
        assert_eq!(progress.snapshot().amount, 1.0);
        progress.update("a", -1.0);
        assert_eq!(progress.snapshot().amount, 0.0);
    }

    #[test]
    fn phases_add_their_weight_only() {
        let progress = Progress::new("");
        progress.increment("Receiving", 0.5);

        let first = progress.phase(0.25);
        let second = progress.phase(0.25);
        first.report("Loading a", 0.5);
        second.report("Loading b", 1.0);
        first.report("Loading a", 0.2);
        assert_eq!(first.reached(), 0.5);
        first.finish("Done");

        assert_eq!(progress.snapshot().amount, 1.0);
        assert_eq!(progress.snapshot().operation, "Done");
    }
}
