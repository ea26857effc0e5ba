//! Read-only walkers over live runtimes.
//!
//! Used by [`Host::observe`](crate::Host::observe) and
//! [`RuntimePool::observe`](crate::RuntimePool::observe).

use crate::runtime::Runtime;

/// Visits runtimes one at a time. Returning `false` stops the walk.
pub trait RuntimeObserver {
    fn observe(&mut self, runtime: &Runtime) -> bool;
}

impl<F> RuntimeObserver for F
where
    F: FnMut(&Runtime) -> bool,
{
    fn observe(&mut self, runtime: &Runtime) -> bool {
        self(runtime)
    }
}

/// Per-runtime counter an [`AverageStatistic`] samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    References,
    WeakReferences,
    CallbackContexts,
    Modules,
}

impl Statistic {
    fn sample(self, runtime: &Runtime) -> usize {
        let stats = runtime.statistics();
        match self {
            Statistic::References => stats.reference_count,
            Statistic::WeakReferences => stats.weak_reference_count,
            Statistic::CallbackContexts => stats.callback_context_count,
            Statistic::Modules => stats.module_count,
        }
    }
}

/// Averages one [`Statistic`] over every runtime it observes.
#[derive(Debug, Clone)]
pub struct AverageStatistic {
    statistic: Statistic,
    total: usize,
    samples: usize,
}

impl AverageStatistic {
    pub fn new(statistic: Statistic) -> Self {
        Self {
            statistic,
            total: 0,
            samples: 0,
        }
    }

    pub fn statistic(&self) -> Statistic {
        self.statistic
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Mean over observed runtimes; `0.0` before the first sample.
    pub fn average(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.total as f64 / self.samples as f64
    }
}

impl RuntimeObserver for AverageStatistic {
    fn observe(&mut self, runtime: &Runtime) -> bool {
        if runtime.is_closed() {
            return true;
        }
        self.total += self.statistic.sample(runtime);
        self.samples += 1;
        true
    }
}
