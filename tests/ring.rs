mod common;

use linked_uring::{
    io::{
        AccessMode, Completion, CreationFlags, DirRef, EventFd, OpKind, Outcome, Permissions,
        Request, RequestChain, Ring, RingConfig, RingFlags, Token,
    },
    registry::{FileSlot, RegisteredBuffer, SlotState},
    verify::{ChecksumAccumulator, FillPattern},
    RingError,
};
use rand::seq::SliceRandom;
use std::{os::fd::RawFd, path::Path, thread, time::Duration};

fn boxed(len: usize, fill: u8) -> Box<[u8]> {
    vec![fill; len].into_boxed_slice()
}

/// Collects exactly `n` completions.
fn consume(ring: &mut Ring, n: usize) -> Vec<Completion> {
    let mut completions = Vec::with_capacity(n);
    ring.blocking_consume_completions(n, |completion, _, _| {
        completions.push(completion);
        Ok::<(), RingError>(())
    })
    .unwrap();
    completions
}

fn write_chain(path: &Path, slot: FileSlot, buffer: RegisteredBuffer, token: u64) -> RequestChain {
    RequestChain::new()
        .then(
            Request::open(path, slot)
                .access(AccessMode::ReadWrite)
                .creation(CreationFlags::CREATE | CreationFlags::TRUNCATE)
                .permissions(Permissions::OWNER_READ_WRITE),
        )
        .then(Request::write(buffer, slot).with_token(Token(token)))
        .then(Request::close(slot))
}

#[test]
fn test_invalid_depth() {
    assert!(matches!(
        Ring::new(0, RingFlags::empty()),
        Err(RingError::CapacityInvalid { requested: 0, .. })
    ));
    assert!(matches!(
        Ring::new(40_000, RingFlags::empty()),
        Err(RingError::CapacityInvalid {
            requested: 40_000,
            ..
        })
    ));
}

#[test]
fn test_write_read_unlink_round_trip() {
    let Some(mut ring) = common::ring(RingConfig::new(16).with_file_slots(4)) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("round_trip.txt");

    let slot = ring.register_file_slots(1).unwrap()[0];
    let buffers = ring
        .register_buffers([boxed(4096, 7), boxed(4096, 0)])
        .unwrap();
    let (source, target) = (buffers[0], buffers[1]);
    assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));

    ring.prepare(write_chain(&path, slot, source, 1)).unwrap();
    assert_eq!(ring.staged(), 3);
    assert!(ring.is_buffer_busy(source));
    assert!(matches!(ring.buffer(source), Err(RingError::BufferBusy(_))));

    assert_eq!(ring.submit().unwrap(), 3);
    let completions = consume(&mut ring, 3);
    for completion in &completions {
        assert!(
            matches!(completion.outcome(), Outcome::Done(_)),
            "{completion}"
        );
    }
    let write = completions
        .iter()
        .find(|c| c.kind == OpKind::Write)
        .unwrap();
    assert_eq!(write.token, Token(1));
    assert_eq!(write.bytes(), Some(4096));
    assert_eq!(write.buffer, Some(source));
    assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

    let read = RequestChain::new()
        .then(Request::open(&path, slot))
        .then(Request::read(slot, target).len(4096).with_token(Token(2)))
        .then(Request::close(slot))
        .then(Request::unlink(&path));
    ring.prepare(read).unwrap();
    ring.submit().unwrap();

    let completions = consume(&mut ring, 4);
    assert!(completions.iter().all(|c| c.outcome() != Outcome::Canceled));
    let read = completions.iter().find(|c| c.token == Token(2)).unwrap();
    assert_eq!(read.kind, OpKind::Read);
    assert_eq!(read.position, 1);

    assert!(ring.buffer(target).unwrap().iter().all(|&b| b == 7));
    assert!(!path.exists());
    assert_eq!(ring.in_flight(), 0);
}

#[test]
fn test_failure_cancels_rest_of_chain() {
    let Some(mut ring) = common::ring(RingConfig::new(8).with_file_slots(1)) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.txt");

    let slot = ring.register_file_slots(1).unwrap()[0];
    let buffer = ring.register_buffers([boxed(64, 0)]).unwrap()[0];

    let chain = RequestChain::new()
        .then(Request::open(&missing, slot))
        .then(Request::read(slot, buffer).len(64).with_token(Token(5)))
        .then(Request::close(slot));
    let id = ring.prepare(chain).unwrap();
    ring.submit().unwrap();

    let mut completions = consume(&mut ring, 3);
    completions.sort_by_key(|c| c.position);

    assert!(completions.iter().all(|c| c.chain == id));
    assert_eq!(completions[0].outcome(), Outcome::Failed(libc::ENOENT));
    assert_eq!(completions[1].outcome(), Outcome::Canceled);
    assert_eq!(completions[2].outcome(), Outcome::Canceled);
    assert_eq!(completions[1].result, -libc::ECANCELED);

    // Nothing was read, and the slot never got bound.
    assert!(ring.buffer(buffer).unwrap().iter().all(|&b| b == 0));
    assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));
}

#[test]
fn test_open_through_bad_directory_cancels_write() {
    let Some(mut ring) = common::ring(RingConfig::new(8).with_file_slots(1)) else {
        return;
    };
    let pattern = FillPattern::Byte(2);
    let checksum = ChecksumAccumulator::new();

    let slot = ring.register_file_slots(1).unwrap()[0];
    let buffer = ring.register_buffers([boxed(64, 2)]).unwrap()[0];

    // No process has a descriptor this large, so the open fails before touching the disk.
    let chain = RequestChain::new()
        .then(
            Request::open("never_created.txt", slot)
                .in_dir(DirRef::Fd(RawFd::MAX))
                .access(AccessMode::WriteOnly)
                .creation(CreationFlags::CREATE | CreationFlags::TRUNCATE)
                .permissions(Permissions::OWNER_READ_WRITE),
        )
        .then(Request::write(buffer, slot).with_token(Token(1)))
        .then(Request::close(slot));
    ring.prepare(chain).unwrap();
    ring.submit().unwrap();

    let mut completions = consume(&mut ring, 3);
    completions.sort_by_key(|c| c.position);
    assert_eq!(completions[0].kind, OpKind::Open);
    assert_eq!(completions[0].outcome(), Outcome::Failed(libc::EBADF));
    assert_eq!(completions[1].outcome(), Outcome::Canceled);
    assert_eq!(completions[2].outcome(), Outcome::Canceled);

    for completion in &completions {
        if completion.kind == OpKind::Write && completion.bytes().is_some() {
            checksum.add(pattern.measure(ring.buffer(buffer).unwrap()));
        }
    }
    assert_eq!(checksum.get(), 0);
    assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));
    assert_eq!(ring.slot_pending(slot), Some(0));
    assert!(!Path::new("never_created.txt").exists());
}

#[test]
fn test_short_read_breaks_chain() {
    let Some(mut ring) = common::ring(RingConfig::new(8).with_file_slots(1)) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.txt");
    std::fs::write(&path, [3u8; 100]).unwrap();

    let slot = ring.register_file_slots(1).unwrap()[0];
    let buffer = ring.register_buffers([boxed(4096, 0)]).unwrap()[0];

    let chain = RequestChain::new()
        .then(Request::open(&path, slot))
        .then(Request::read(slot, buffer))
        .then(Request::close(slot));
    ring.prepare(chain).unwrap();
    ring.submit().unwrap();

    let mut completions = consume(&mut ring, 3);
    completions.sort_by_key(|c| c.position);
    assert_eq!(completions[1].outcome(), Outcome::Done(100));
    assert!(completions[2].is_canceled());
    assert_eq!(ring.slot_state(slot), Some(SlotState::Bound));

    // The close never ran, so the file is still installed.
    ring.prepare(
        RequestChain::new()
            .then(Request::close(slot))
            .then(Request::unlink(&path)),
    )
    .unwrap();
    ring.submit().unwrap();
    let completions = consume(&mut ring, 2);
    assert!(completions.iter().all(|c| c.bytes().is_some()));
    assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));
    assert_eq!(&ring.buffer(buffer).unwrap()[..100], &[3u8; 100]);
}

#[test]
fn test_queue_full_is_atomic() {
    let Some(mut ring) = common::ring(RingConfig::new(4).with_file_slots(0)) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let unlinks = |tag: &str| -> RequestChain {
        (0..3)
            .map(|i| Request::unlink(dir.path().join(format!("{tag}{i}"))))
            .collect()
    };

    assert_eq!(ring.sq_capacity(), 4);
    ring.prepare(unlinks("a")).unwrap();

    let err = ring.prepare(unlinks("b")).unwrap_err();
    assert!(matches!(
        err,
        RingError::QueueFull {
            needed: 3,
            available: 1
        }
    ));
    assert!(err.is_transient());
    assert_eq!(ring.staged(), 3);
    assert_eq!(ring.in_flight(), 3);

    ring.submit().unwrap();
    // A failed unlink does not cancel its successors, so each one may report its own ENOENT.
    let mut completions = consume(&mut ring, 3);
    completions.sort_by_key(|c| c.position);
    assert_eq!(completions[0].outcome(), Outcome::Failed(libc::ENOENT));
    assert!(completions[1..]
        .iter()
        .all(|c| c.is_canceled() || c.outcome() == Outcome::Failed(libc::ENOENT)));
    assert_eq!(ring.in_flight(), 0);

    // With the queue empty again the chain fits.
    ring.prepare(unlinks("b")).unwrap();
    ring.submit().unwrap();
    consume(&mut ring, 3);
}

#[test]
fn test_staging_validation() {
    let Some(mut ring) = common::ring(RingConfig::new(8).with_file_slots(2)) else {
        return;
    };

    assert!(matches!(
        ring.prepare(RequestChain::new().then(Request::unlink("x"))),
        Err(RingError::InvalidChain(1))
    ));

    let slots = ring.register_file_slots(2).unwrap();
    assert!(matches!(
        ring.register_file_slots(1),
        Err(RingError::ResourceExhausted {
            requested: 1,
            available: 0,
            ..
        })
    ));

    let buffer = ring.register_buffers([boxed(16, 0)]).unwrap()[0];
    let too_long = RequestChain::new()
        .then(Request::open("x", slots[0]))
        .then(Request::read(slots[0], buffer).len(32));
    assert!(matches!(
        ring.prepare(too_long),
        Err(RingError::InvalidLength {
            requested: 32,
            capacity: 16,
            ..
        })
    ));

    assert!(matches!(
        ring.register_buffers([boxed(0, 0)]),
        Err(RingError::InvalidBuffer { index: 0, .. })
    ));
    assert_eq!(ring.buffer_count(), 1);
    assert_eq!(ring.staged(), 0);
    assert_eq!(ring.in_flight(), 0);
}

#[test]
fn test_buffers_cannot_be_reregistered_while_busy() {
    let Some(mut ring) = common::ring(RingConfig::new(8).with_file_slots(1)) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.txt");

    let slot = ring.register_file_slots(1).unwrap()[0];
    let buffer = ring.register_buffers([boxed(512, 1)]).unwrap()[0];

    ring.prepare(write_chain(&path, slot, buffer, 1)).unwrap();
    assert!(matches!(
        ring.register_buffers([boxed(512, 2)]),
        Err(RingError::BuffersInUse(1))
    ));

    ring.submit().unwrap();
    consume(&mut ring, 3);

    let more = ring
        .register_slab(boxed(1024, 2), [0..512, 512..1024])
        .unwrap();
    assert_eq!(more.len(), 2);
    assert_eq!(ring.buffer_count(), 3);
    assert_eq!(ring.buffer(buffer).unwrap()[0], 1);
    assert_eq!(ring.buffer(more[1]).unwrap()[0], 2);
}

#[test]
fn test_slot_reuse_across_rounds() {
    const FILES: usize = 8;

    let Some(mut ring) = common::ring(RingConfig::new(64).with_file_slots(FILES as u32)) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();

    let mut slots = ring.register_file_slots(FILES).unwrap();
    let buffers = ring
        .register_buffers((0..FILES).map(|i| boxed(256, i as u8)))
        .unwrap();
    let mut rng = rand::thread_rng();

    for round in 0..4 {
        slots.shuffle(&mut rng);
        for (i, (&slot, &buffer)) in slots.iter().zip(&buffers).enumerate() {
            let path = dir.path().join(format!("{round}-{i}"));
            ring.prepare(write_chain(&path, slot, buffer, i as u64 + 1))
                .unwrap();
        }
        ring.submit().unwrap();

        let completions = consume(&mut ring, FILES * 3);
        assert!(completions.iter().all(|c| c.bytes().is_some()));
        for &slot in &slots {
            assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));
            assert_eq!(ring.slot_pending(slot), Some(0));
        }
    }

    for i in 0..FILES {
        let contents = std::fs::read(dir.path().join(format!("3-{i}"))).unwrap();
        assert_eq!(contents, vec![i as u8; 256]);
    }
}

#[test]
fn test_slot_reused_while_close_in_flight() {
    let Some(mut ring) = common::ring(RingConfig::new(16).with_file_slots(1)) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = (dir.path().join("first"), dir.path().join("second"));

    let slot = ring.register_file_slots(1).unwrap()[0];
    let buffers = ring
        .register_buffers([boxed(256, 1), boxed(256, 2)])
        .unwrap();

    ring.prepare(write_chain(&first, slot, buffers[0], 1))
        .unwrap();
    ring.submit().unwrap();

    // Observe the open and the write, but leave the close unconsumed.
    let completions = consume(&mut ring, 2);
    assert!(completions.iter().all(|c| c.bytes().is_some()));
    assert_eq!(ring.slot_state(slot), Some(SlotState::Bound));
    assert_eq!(ring.slot_pending(slot), Some(1));

    // Let the kernel finish the close so the second chain's open finds the slot empty.
    for _ in 0..5000 {
        if ring.ready() > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(ring.ready(), 1);

    ring.prepare(write_chain(&second, slot, buffers[1], 2))
        .unwrap();
    assert_eq!(ring.slot_pending(slot), Some(4));
    ring.submit().unwrap();

    let completions = consume(&mut ring, 4);
    assert!(completions.iter().all(|c| c.bytes().is_some()));
    assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));
    assert_eq!(ring.slot_pending(slot), Some(0));
    assert_eq!(ring.file_slots_allocated(), 1);
    assert_eq!(std::fs::read(&first).unwrap(), vec![1u8; 256]);
    assert_eq!(std::fs::read(&second).unwrap(), vec![2u8; 256]);

    // The slot is still usable after being reused.
    ring.prepare(
        RequestChain::new()
            .then(Request::open(&first, slot))
            .then(Request::close(slot)),
    )
    .unwrap();
    ring.submit().unwrap();
    assert!(consume(&mut ring, 2).iter().all(|c| c.bytes().is_some()));
    assert_eq!(ring.slot_state(slot), Some(SlotState::Unbound));
}

#[test]
fn test_drop_discards_staged_chains() {
    let dir = tempfile::tempdir().unwrap();
    let staged: Vec<_> = ["a", "b"].iter().map(|n| dir.path().join(n)).collect();
    let submitted: Vec<_> = ["c", "d"].iter().map(|n| dir.path().join(n)).collect();
    for path in staged.iter().chain(&submitted) {
        std::fs::write(path, b"keep").unwrap();
    }
    let unlinks = |paths: &[std::path::PathBuf]| -> RequestChain {
        paths.iter().map(Request::unlink).collect()
    };

    {
        let Some(mut ring) = common::ring(RingConfig::new(8)) else {
            return;
        };
        ring.prepare(unlinks(&submitted)).unwrap();
        ring.submit().unwrap();
        ring.prepare(unlinks(&staged)).unwrap();
        assert_eq!(ring.staged(), 2);
        assert_eq!(ring.in_flight(), 4);
    }

    // Submitted work is drained on drop, staged work never runs.
    assert!(submitted.iter().all(|p| !p.exists()));
    assert!(staged.iter().all(|p| p.exists()));
}

#[test]
fn test_single_event_fd() {
    let Some(mut ring) = common::ring(RingConfig::new(8)) else {
        return;
    };
    let first = EventFd::new().unwrap();
    let second = EventFd::new().unwrap();

    ring.register_event_fd(&first).unwrap();
    assert!(ring.has_event_fd());
    assert!(matches!(
        ring.register_event_fd(&second),
        Err(RingError::EventFdAlreadyRegistered)
    ));

    ring.unregister_event_fd().unwrap();
    ring.register_event_fd(&second).unwrap();
}

#[test]
fn test_event_fd_signals_on_completion() {
    let Some(mut ring) = common::ring(RingConfig::new(8)) else {
        return;
    };
    let event_fd = EventFd::new().unwrap();
    ring.register_event_fd(&event_fd).unwrap();

    let dir = tempfile::tempdir().unwrap();
    ring.prepare(
        RequestChain::new()
            .then(Request::unlink(dir.path().join("a")))
            .then(Request::unlink(dir.path().join("b"))),
    )
    .unwrap();
    ring.submit().unwrap();
    consume(&mut ring, 2);

    assert!(event_fd.reset().unwrap() > 0);
}

#[test]
fn test_starved_instead_of_blocking_forever() {
    let Some(mut ring) = common::ring(RingConfig::new(8)) else {
        return;
    };
    let result = ring.blocking_consume_completions(1, |_, _, _| Ok::<(), RingError>(()));
    assert!(matches!(
        result,
        Err(RingError::Starved {
            wanted: 1,
            delivered: 0
        })
    ));
    assert!(ring.try_consume_completion().is_none());
}
