mod common;

use linked_uring::{
    dispatch::{
        AccountingError, CompletionDispatcher, DispatchError, ErrorPolicy, PhasePlan, PhaseSpec,
    },
    io::{
        AccessMode, Completion, CreationFlags, OpKind, Permissions, Request, RequestChain, Ring,
        RingConfig, Token,
    },
    registry::{FileSlot, RegisteredBuffer},
    RingError,
};
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::runtime::Builder;

/// Writes and reads back a set of files, recording the running count of completions each phase
/// had seen whenever the next phase was staged.
struct CountingPlan {
    dir: TempDir,
    files: usize,
    slots: Vec<FileSlot>,
    buffers: Vec<RegisteredBuffer>,
    /// The number of operations each read chain claims to have.
    claimed_read_ops: usize,
    /// Whether the write chains open files that do not exist.
    broken_writes: bool,
    /// Completions observed per phase.
    observed: Vec<usize>,
    /// Completions per phase at the moment the next phase was staged.
    staged_after: Vec<usize>,
}

impl CountingPlan {
    fn new(ring: &mut Ring, files: usize) -> Self {
        let slots = ring.register_file_slots(files).unwrap();
        let buffers = ring
            .register_buffers((0..files).map(|_| vec![1u8; 512].into_boxed_slice()))
            .unwrap();
        Self {
            dir: tempfile::tempdir().unwrap(),
            files,
            slots,
            buffers,
            claimed_read_ops: 4,
            broken_writes: false,
            observed: vec![0, 0],
            staged_after: Vec::new(),
        }
    }

    fn path(&self, i: usize) -> PathBuf {
        self.dir.path().join(format!("file{i}"))
    }
}

impl PhasePlan for CountingPlan {
    fn phases(&self) -> Vec<PhaseSpec> {
        vec![
            PhaseSpec::new("write", self.files, 3),
            PhaseSpec::new("read", self.files, self.claimed_read_ops),
        ]
    }

    fn stage(&mut self, phase: usize, ring: &mut Ring) -> Result<(), RingError> {
        if phase > 0 {
            self.staged_after.push(self.observed[phase - 1]);
        }

        for i in 0..self.files {
            let (slot, buffer, path) = (self.slots[i], self.buffers[i], self.path(i));
            let token = Token(i as u64 + 1);
            let chain = match phase {
                0 => {
                    let creation = if self.broken_writes {
                        CreationFlags::empty()
                    } else {
                        CreationFlags::CREATE
                    };
                    RequestChain::new()
                        .then(
                            Request::open(path, slot)
                                .access(AccessMode::WriteOnly)
                                .creation(creation)
                                .permissions(Permissions::OWNER_READ_WRITE),
                        )
                        .then(Request::write(buffer, slot).with_token(token))
                        .then(Request::close(slot))
                }
                _ => RequestChain::new()
                    .then(Request::open(&path, slot))
                    .then(Request::read(slot, buffer).len(512).with_token(token))
                    .then(Request::close(slot))
                    .then(Request::unlink(&path)),
            };
            ring.prepare(chain)?;
        }
        Ok(())
    }

    fn observe(
        &mut self,
        phase: usize,
        completion: &Completion,
        _ring: &Ring,
    ) -> Result<(), RingError> {
        self.observed[phase] += 1;
        if completion.kind == OpKind::Write || completion.kind == OpKind::Read {
            assert!(!completion.token.is_none());
        }
        Ok(())
    }
}

fn ring_for(files: usize) -> Option<Ring> {
    common::ring(RingConfig::new(files as u32 * 7).with_file_slots(files as u32))
}

#[test]
fn test_blocking_accounting_is_exact() {
    const FILES: usize = 32;
    let Some(mut ring) = ring_for(FILES) else {
        return;
    };

    let plan = CountingPlan::new(&mut ring, FILES);
    let mut dispatcher = CompletionDispatcher::new(plan, ErrorPolicy::Strict);
    dispatcher.run_blocking(&mut ring).unwrap();

    assert!(dispatcher.accounting().is_finished());
    assert_eq!(dispatcher.failed(), 0);
    let plan = dispatcher.into_plan();
    assert_eq!(plan.observed, [3 * FILES, 4 * FILES]);
    assert_eq!(plan.staged_after, [3 * FILES]);
    assert_eq!(ring.in_flight(), 0);
}

#[test]
fn test_event_driven_accounting_is_exact() {
    const FILES: usize = 32;
    let Some(mut ring) = ring_for(FILES) else {
        return;
    };

    let plan = CountingPlan::new(&mut ring, FILES);
    let mut dispatcher = CompletionDispatcher::new(plan, ErrorPolicy::Strict);

    let runtime = Builder::new_current_thread().enable_all().build().unwrap();
    runtime
        .block_on(dispatcher.run_event_driven(&mut ring))
        .unwrap();

    assert!(!ring.has_event_fd());
    let plan = dispatcher.into_plan();
    assert_eq!(plan.observed, [3 * FILES, 4 * FILES]);
    assert_eq!(plan.staged_after, [3 * FILES]);
    assert_eq!(ring.in_flight(), 0);
}

#[test]
fn test_underrun_is_fatal() {
    const FILES: usize = 4;

    for event_driven in [false, true] {
        let Some(mut ring) = ring_for(FILES) else {
            return;
        };
        let mut plan = CountingPlan::new(&mut ring, FILES);
        plan.claimed_read_ops = 5;
        let mut dispatcher = CompletionDispatcher::new(plan, ErrorPolicy::BestEffort);

        let result = if event_driven {
            let runtime = Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(dispatcher.run_event_driven(&mut ring))
        } else {
            dispatcher.run_blocking(&mut ring)
        };

        match result {
            Err(DispatchError::Accounting(AccountingError::Underrun {
                phase,
                observed,
                expected,
            })) => {
                assert_eq!(phase, "read");
                assert_eq!(observed, 4 * FILES);
                assert_eq!(expected, 5 * FILES);
            }
            other => panic!("expected an underrun, got {other:?}"),
        }
    }
}

#[test]
fn test_strict_policy_aborts_on_first_failure() {
    const FILES: usize = 4;
    let Some(mut ring) = ring_for(FILES) else {
        return;
    };

    let mut plan = CountingPlan::new(&mut ring, FILES);
    plan.broken_writes = true;
    let mut dispatcher = CompletionDispatcher::new(plan, ErrorPolicy::Strict);

    match dispatcher.run_blocking(&mut ring) {
        Err(DispatchError::OperationFailed(completion)) => {
            assert_eq!(completion.kind, OpKind::Open);
            assert_eq!(completion.error().unwrap().raw_os_error(), Some(libc::ENOENT));
        }
        other => panic!("expected a failed operation, got {other:?}"),
    }
    assert_eq!(dispatcher.failed(), 1);
}

#[test]
fn test_best_effort_policy_keeps_counting() {
    const FILES: usize = 4;
    let Some(mut ring) = ring_for(FILES) else {
        return;
    };

    let mut plan = CountingPlan::new(&mut ring, FILES);
    plan.broken_writes = true;
    let mut dispatcher = CompletionDispatcher::new(plan, ErrorPolicy::BestEffort);
    dispatcher.run_blocking(&mut ring).unwrap();

    // Every write chain fails at its open, and so does every read chain.
    assert_eq!(dispatcher.failed(), 2 * FILES);
    assert_eq!(dispatcher.canceled(), 2 * FILES + 3 * FILES);
    assert_eq!(dispatcher.into_plan().observed, [3 * FILES, 4 * FILES]);
}
