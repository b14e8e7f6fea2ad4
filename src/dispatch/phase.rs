//! Per-phase completion accounting.
//!
//! A phase is one batch of `chains` chains of `ops_per_chain` operations each. The phase is over
//! exactly when `chains × ops_per_chain` completions have been recorded for it, since every
//! operation of a linked chain completes exactly once, canceled or not.

use std::fmt::{self, Display};

/// One batch of chains with a known number of operations each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    /// A name for logs and errors.
    pub name: &'static str,
    /// The number of chains staged for this phase.
    pub chains: usize,
    /// The number of operations in every chain of this phase.
    pub ops_per_chain: usize,
}

impl PhaseSpec {
    /// Creates a new phase description.
    pub fn new(name: &'static str, chains: usize, ops_per_chain: usize) -> Self {
        Self {
            name,
            chains,
            ops_per_chain,
        }
    }

    /// The number of completions that ends this phase.
    pub fn expected(&self) -> usize {
        self.chains * self.ops_per_chain
    }
}

impl Display for PhaseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} phase ({} chains x {} ops)",
            self.name, self.chains, self.ops_per_chain
        )
    }
}

/// The effect of recording one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The current phase still expects more completions.
    Pending,
    /// The completion ended phase `from`. Phase `to` is now current and must be staged.
    Advanced {
        /// The phase that just ended.
        from: usize,
        /// The phase that is now current.
        to: usize,
    },
    /// The completion ended the final phase.
    Finished,
}

/// A violation of the accounting protocol. Always fatal: it means a completion was lost or
/// counted twice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountingError {
    /// A completion arrived after every phase had finished.
    #[error("Completion observed after all {expected} expected completions were recorded")]
    Overrun {
        /// The total number of completions across all phases.
        expected: usize,
    },
    /// The ring ran out of in-flight work before the current phase saw all its completions.
    #[error("{phase} phase stalled after {observed} of {expected} completions")]
    Underrun {
        /// The name of the phase that stalled.
        phase: &'static str,
        /// The number of completions recorded in that phase.
        observed: usize,
        /// The number of completions the phase expects.
        expected: usize,
    },
}

/// Counts completions against a fixed list of phases.
///
/// Phases that expect no completions at all are skipped, so [`current`](Self::current) always
/// names a phase that can make progress.
#[derive(Debug, Clone)]
pub struct PhaseAccounting {
    /// Every phase, in order.
    phases: Vec<PhaseSpec>,
    /// The index of the current phase, or `phases.len()` once finished.
    current: usize,
    /// Completions recorded in the current phase.
    observed: usize,
}

impl PhaseAccounting {
    /// Starts accounting at the first phase that expects any completions.
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        let mut accounting = Self {
            phases,
            current: 0,
            observed: 0,
        };
        accounting.current = accounting.next_nonempty(0);
        accounting
    }

    fn next_nonempty(&self, from: usize) -> usize {
        (from..self.phases.len())
            .find(|&i| self.phases[i].expected() > 0)
            .unwrap_or(self.phases.len())
    }

    /// Records one completion in the current phase.
    ///
    /// # Errors
    ///
    /// Returns [`AccountingError::Overrun`] if every phase has already finished.
    pub fn record(&mut self) -> Result<Transition, AccountingError> {
        let Some(spec) = self.phases.get(self.current) else {
            return Err(AccountingError::Overrun {
                expected: self.total_expected(),
            });
        };

        self.observed += 1;
        if self.observed < spec.expected() {
            return Ok(Transition::Pending);
        }

        let from = self.current;
        self.observed = 0;
        self.current = self.next_nonempty(from + 1);

        if self.is_finished() {
            Ok(Transition::Finished)
        } else {
            Ok(Transition::Advanced {
                from,
                to: self.current,
            })
        }
    }

    /// The index of the current phase, or `None` once every phase has finished.
    pub fn current(&self) -> Option<usize> {
        (!self.is_finished()).then_some(self.current)
    }

    /// The description of the current phase.
    pub fn current_spec(&self) -> Option<&PhaseSpec> {
        self.phases.get(self.current)
    }

    /// Completions recorded so far in the current phase.
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Completions still expected before the current phase ends.
    pub fn remaining(&self) -> usize {
        self.current_spec()
            .map_or(0, |spec| spec.expected() - self.observed)
    }

    /// Returns true once the final phase has seen all its completions.
    pub fn is_finished(&self) -> bool {
        self.current >= self.phases.len()
    }

    /// The total number of completions across every phase.
    pub fn total_expected(&self) -> usize {
        self.phases.iter().map(PhaseSpec::expected).sum()
    }

    /// Every phase, in order.
    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// Builds the error for a current phase that can no longer finish.
    pub fn underrun(&self) -> AccountingError {
        match self.current_spec() {
            Some(spec) => AccountingError::Underrun {
                phase: spec.name,
                observed: self.observed,
                expected: spec.expected(),
            },
            None => AccountingError::Underrun {
                phase: "final",
                observed: 0,
                expected: 0,
            },
        }
    }
}
