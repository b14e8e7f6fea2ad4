//! Draining a [`Ring`] and counting its completions phase by phase.
//!
//! A [`PhasePlan`] describes a fixed pipeline of phases and knows how to stage each one. The
//! [`CompletionDispatcher`] stages the first phase, routes every completion back to the plan,
//! counts it with a [`PhaseAccounting`], and stages the next phase exactly when the current one
//! has seen all of its completions.
//!
//! Completions can be collected two ways. [`CompletionDispatcher::run_blocking`] waits on the ring
//! once per phase. [`CompletionDispatcher::run_event_driven`] registers an [`EventFd`] with the
//! ring, and a listener future forwards its readiness to the owning task over a channel. Only the
//! owning task ever touches the ring.

mod phase;

pub use phase::{AccountingError, PhaseAccounting, PhaseSpec, Transition};

use crate::error::RingError;
use crate::io::{Completion, EventFd, Outcome, Readiness, Ring};
use async_channel::Receiver;
use std::io;
use tracing::{debug, error, info, trace, warn};

/// How the dispatcher reacts to an operation that failed on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Abort on the first failed operation.
    Strict,
    /// Log the failure and keep counting.
    #[default]
    BestEffort,
}

/// A fixed sequence of phases of linked chains.
pub trait PhasePlan {
    /// The phases, in order. Called once when the dispatcher is created.
    fn phases(&self) -> Vec<PhaseSpec>;

    /// Stages every chain of `phase` on the ring. The dispatcher submits them afterwards.
    ///
    /// # Errors
    ///
    /// Returns the ring's error if a chain cannot be staged.
    fn stage(&mut self, phase: usize, ring: &mut Ring) -> Result<(), RingError>;

    /// Inspects one completion of `phase`, including failed and canceled ones.
    ///
    /// # Errors
    ///
    /// Returns the ring's error if the completion's buffer cannot be read.
    fn observe(&mut self, phase: usize, completion: &Completion, ring: &Ring)
        -> Result<(), RingError>;
}

/// Errors that stop a dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The ring failed to stage, submit or wait.
    #[error(transparent)]
    Ring(#[from] RingError),
    /// An operation failed under [`ErrorPolicy::Strict`].
    #[error("Operation failed: {0}")]
    OperationFailed(Completion),
    /// Completions did not add up.
    #[error(transparent)]
    Accounting(#[from] AccountingError),
    /// The readiness descriptor or its listener failed.
    #[error("Readiness notification failed: {0}")]
    Io(#[from] io::Error),
}

/// Drives a [`PhasePlan`] to completion on a ring.
#[derive(Debug)]
pub struct CompletionDispatcher<P> {
    /// The plan being driven.
    plan: P,
    /// Completion counts for the plan's phases.
    accounting: PhaseAccounting,
    /// What to do about failed operations.
    policy: ErrorPolicy,
    /// Operations that failed on their own.
    failed: usize,
    /// Operations skipped because an earlier operation of their chain failed.
    canceled: usize,
}

impl<P: PhasePlan> CompletionDispatcher<P> {
    /// Creates a dispatcher for `plan`. Nothing is staged until one of the `run` methods or
    /// [`start`](Self::start) is called.
    pub fn new(plan: P, policy: ErrorPolicy) -> Self {
        let accounting = PhaseAccounting::new(plan.phases());
        Self {
            plan,
            accounting,
            policy,
            failed: 0,
            canceled: 0,
        }
    }

    /// Stages and submits the first phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan cannot stage its chains or the ring cannot submit them.
    pub fn start(&mut self, ring: &mut Ring) -> Result<(), DispatchError> {
        match self.accounting.current() {
            Some(phase) => self.stage_phase(phase, ring),
            None => Ok(()),
        }
    }

    fn stage_phase(&mut self, phase: usize, ring: &mut Ring) -> Result<(), DispatchError> {
        let spec = &self.accounting.phases()[phase];
        debug!(%spec, "staging phase");

        self.plan.stage(phase, ring)?;
        let submitted = ring.submit()?;

        debug!(phase = spec.name, submitted, "submitted phase");
        Ok(())
    }

    /// Applies the error policy, hands the completion to the plan and counts it.
    fn handle(&mut self, completion: &Completion, ring: &Ring) -> Result<Transition, DispatchError> {
        let Some(phase) = self.accounting.current() else {
            return Err(AccountingError::Overrun {
                expected: self.accounting.total_expected(),
            }
            .into());
        };

        match completion.outcome() {
            Outcome::Done(_) => {}
            Outcome::Canceled => {
                self.canceled += 1;
                debug!(%completion, "skipped after an earlier failure in its chain");
            }
            Outcome::Failed(_) => {
                self.failed += 1;
                match self.policy {
                    ErrorPolicy::Strict => {
                        error!(%completion, "operation failed, aborting");
                        return Err(DispatchError::OperationFailed(completion.clone()));
                    }
                    ErrorPolicy::BestEffort => warn!(%completion, "operation failed, continuing"),
                }
            }
        }

        self.plan.observe(phase, completion, ring)?;
        Ok(self.accounting.record()?)
    }

    fn on_transition(&mut self, transition: Transition, ring: &mut Ring) -> Result<(), DispatchError> {
        match transition {
            Transition::Pending => Ok(()),
            Transition::Advanced { from, to } => {
                debug!(from, to, "phase complete");
                self.stage_phase(to, ring)
            }
            Transition::Finished => {
                info!(
                    completions = self.accounting.total_expected(),
                    failed = self.failed,
                    canceled = self.canceled,
                    "all phases complete"
                );
                Ok(())
            }
        }
    }

    /// Routes a single completion, staging the next phase if it ended the current one.
    ///
    /// # Errors
    ///
    /// Returns an error for a failed operation under [`ErrorPolicy::Strict`], for a completion
    /// that arrives after the final phase, or if the next phase cannot be staged.
    pub fn dispatch(
        &mut self,
        completion: &Completion,
        ring: &mut Ring,
    ) -> Result<Transition, DispatchError> {
        let transition = self.handle(completion, ring)?;
        self.on_transition(transition, ring)?;
        Ok(transition)
    }

    /// Dispatches every completion that is available right now, without blocking.
    ///
    /// Returns the number of completions drained. Zero is a spurious wake-up, not an error.
    ///
    /// # Errors
    ///
    /// As [`dispatch`](Self::dispatch).
    pub fn drain(&mut self, ring: &mut Ring) -> Result<usize, DispatchError> {
        let mut drained = 0;
        while let Some(completion) = ring.try_consume_completion() {
            self.dispatch(&completion, ring)?;
            drained += 1;
        }
        Ok(drained)
    }

    /// Runs every phase by blocking on the ring for exactly the completions each phase expects.
    ///
    /// # Errors
    ///
    /// Returns [`AccountingError::Underrun`] if the ring runs dry before a phase is complete, and
    /// any error from [`dispatch`](Self::dispatch) or from waiting on the ring.
    pub fn run_blocking(&mut self, ring: &mut Ring) -> Result<(), DispatchError> {
        self.start(ring)?;

        while !self.accounting.is_finished() {
            let remaining = self.accounting.remaining();
            let mut transition = Transition::Pending;

            let consumed = ring.blocking_consume_completions::<_, DispatchError>(
                remaining,
                |completion, ring, _| {
                    transition = self.handle(&completion, ring)?;
                    Ok(())
                },
            );

            match consumed {
                Ok(_) => {}
                Err(DispatchError::Ring(RingError::Starved { .. })) => {
                    return Err(self.accounting.underrun().into());
                }
                Err(e) => return Err(e),
            }

            self.on_transition(transition, ring)?;
        }

        Ok(())
    }

    /// Runs every phase, draining the ring each time its eventfd signals readiness.
    ///
    /// Must be awaited on a `tokio` runtime with I/O enabled. The ring must not already have an
    /// eventfd registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the eventfd cannot be created or registered, if the listener fails,
    /// if the ring runs out of in-flight work before every phase is complete, and any error from
    /// [`dispatch`](Self::dispatch).
    pub async fn run_event_driven(&mut self, ring: &mut Ring) -> Result<(), DispatchError> {
        let event_fd = EventFd::new()?;
        ring.register_event_fd(&event_fd)?;

        // A single queued message is enough: every message triggers a full drain.
        let (tx, rx) = async_channel::bounded(1);
        let listener = event_fd.forward_readiness(tx);

        let result = tokio::select! {
            result = self.drain_on_readiness(ring, &rx) => result,
            stopped = listener => Err(DispatchError::Io(stopped.err().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "readiness listener stopped")
            }))),
        };

        let unregistered = ring.unregister_event_fd();
        result?;
        unregistered?;
        Ok(())
    }

    async fn drain_on_readiness(
        &mut self,
        ring: &mut Ring,
        readiness: &Receiver<Readiness>,
    ) -> Result<(), DispatchError> {
        self.start(ring)?;

        loop {
            let drained = self.drain(ring)?;
            if self.accounting.is_finished() {
                return Ok(());
            }
            if drained == 0 {
                trace!("spurious wake-up");
            }
            if ring.in_flight() == 0 {
                return Err(self.accounting.underrun().into());
            }

            let Ok(Readiness { signals }) = readiness.recv().await else {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "readiness listener stopped",
                )
                .into());
            };
            trace!(signals, in_flight = ring.in_flight(), "ring ready");
        }
    }

    /// The plan being driven.
    pub fn plan(&self) -> &P {
        &self.plan
    }

    /// Consumes the dispatcher, returning its plan.
    pub fn into_plan(self) -> P {
        self.plan
    }

    /// The completion counts.
    pub fn accounting(&self) -> &PhaseAccounting {
        &self.accounting
    }

    /// The error policy.
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// The number of operations that failed on their own so far.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// The number of operations canceled by an earlier failure in their chain so far.
    pub fn canceled(&self) -> usize {
        self.canceled
    }
}
