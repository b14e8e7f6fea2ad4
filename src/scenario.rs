//! The file round trip: write a set of files through linked chains, read them back, and check
//! the checksum.
//!
//! The write phase stages one `open → write → close` chain per file. Once all of its completions
//! are in, the read phase stages one `open → read → close [→ unlink]` chain per file into zeroed
//! buffers. Every file gets its own file slot and its own region of a single registered slab.

use crate::dispatch::{CompletionDispatcher, DispatchError, ErrorPolicy, PhasePlan, PhaseSpec};
use crate::error::{RingError, MAX_QUEUE_DEPTH};
use crate::io::{
    AccessMode, Completion, CreationFlags, OpKind, Outcome, Permissions, Request, RequestChain,
    Ring, RingConfig, Token, MAX_REGISTERED_BUFFERS,
};
use crate::registry::{FileSlot, RegisteredBuffer};
use crate::verify::{ChecksumAccumulator, FillPattern, Verdict};
use std::{fs, io, path::PathBuf};
use tokio::runtime::Builder;
use tracing::{debug, info, trace, warn};

/// How completions are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Drain whenever the ring's eventfd becomes readable.
    #[default]
    EventDriven,
    /// Block on the ring once per phase.
    Blocking,
}

/// Errors that stop a scenario before it can produce a [`Verdict`].
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// The configuration cannot be run.
    #[error("Invalid scenario configuration: {0}")]
    Config(String),
    /// The ring could not be created or its resources could not be registered.
    #[error(transparent)]
    Ring(#[from] RingError),
    /// Dispatch stopped early.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// A filesystem or runtime error outside the ring.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A baseline worker thread panicked.
    #[error("A worker thread panicked")]
    WorkerPanicked,
}

/// Configuration for one round trip.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Number of files.
    pub file_count: usize,
    /// Size of every file, and of every buffer.
    pub file_size: usize,
    /// Directory the files are created in. Created if missing.
    pub dir: PathBuf,
    /// Buffer contents and checksum rule.
    pub pattern: FillPattern,
    /// Whether the read chains end with an unlink of their file.
    pub unlink: bool,
    /// Whether reads go into their own buffers instead of the zeroed write buffers.
    pub separate_read_buffers: bool,
    /// How completions are collected.
    pub mode: DispatchMode,
    /// What to do about failed operations.
    pub policy: ErrorPolicy,
    /// Ring depth. Defaults to seven entries per file.
    pub queue_depth: Option<u32>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            file_count: 64,
            file_size: 16 * 1024 * 1024,
            dir: PathBuf::from("."),
            pattern: FillPattern::Byte(2),
            unlink: true,
            separate_read_buffers: false,
            mode: DispatchMode::EventDriven,
            policy: ErrorPolicy::BestEffort,
            queue_depth: None,
        }
    }
}

impl ScenarioConfig {
    /// Creates a configuration for `file_count` files of `file_size` bytes.
    #[must_use]
    pub fn new(file_count: usize, file_size: usize) -> Self {
        Self {
            file_count,
            file_size,
            ..Default::default()
        }
    }

    /// Sets the directory.
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Sets the fill pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: FillPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Sets whether read chains unlink their file.
    #[must_use]
    pub fn with_unlink(mut self, unlink: bool) -> Self {
        self.unlink = unlink;
        self
    }

    /// Sets whether reads use their own buffers.
    #[must_use]
    pub fn with_separate_read_buffers(mut self, separate: bool) -> Self {
        self.separate_read_buffers = separate;
        self
    }

    /// Sets the dispatch mode.
    #[must_use]
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the error policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the ring depth.
    #[must_use]
    pub fn with_queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = Some(queue_depth);
        self
    }

    /// The path of file `index`.
    pub fn file_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("testdatafile{index}.txt"))
    }

    /// The number of operations in each read chain.
    pub fn read_ops(&self) -> usize {
        if self.unlink {
            4
        } else {
            3
        }
    }

    /// The ring depth that will be used. Defaults to seven entries per file, capped at the
    /// largest depth a ring accepts.
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth.unwrap_or_else(|| {
            u32::try_from(self.file_count.saturating_mul(7))
                .unwrap_or(u32::MAX)
                .min(MAX_QUEUE_DEPTH)
        })
    }

    /// The number of registered buffers the scenario needs.
    pub fn buffer_count(&self) -> usize {
        if self.separate_read_buffers {
            self.file_count * 2
        } else {
            self.file_count
        }
    }

    /// The checksum a correct run produces.
    pub fn expected(&self) -> u64 {
        self.pattern.expected(self.file_size, self.file_count)
    }

    /// The ring configuration for this scenario.
    pub fn ring_config(&self) -> RingConfig {
        RingConfig::new(self.queue_depth())
            .with_file_slots(self.file_count as u32)
            .with_max_buffers(self.buffer_count())
    }

    /// Checks the file count and size, which both the ring and the baseline need.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Config`] describing the first problem found.
    pub fn validate_files(&self) -> Result<(), ScenarioError> {
        if self.file_count == 0 {
            return Err(ScenarioError::Config("file count must be at least 1".into()));
        }
        if self.file_size < self.pattern.min_size() {
            return Err(ScenarioError::Config(format!(
                "{} byte files cannot hold the {} pattern (needs {} bytes)",
                self.file_size,
                self.pattern,
                self.pattern.min_size()
            )));
        }
        if u32::try_from(self.file_size).is_err() {
            return Err(ScenarioError::Config(format!(
                "file size {} does not fit a single read",
                self.file_size
            )));
        }
        Ok(())
    }

    /// Checks everything the ring needs on top of [`validate_files`](Self::validate_files).
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Config`] describing the first problem found, and the ring's error
    /// for an invalid ring configuration.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        self.validate_files()?;

        if self.buffer_count() > MAX_REGISTERED_BUFFERS {
            return Err(ScenarioError::Config(format!(
                "{} buffers exceed the registration limit of {MAX_REGISTERED_BUFFERS}",
                self.buffer_count()
            )));
        }
        if u32::try_from(self.file_count).is_err() {
            return Err(ScenarioError::Config(format!(
                "{} files exceed the file slot table",
                self.file_count
            )));
        }

        // A whole phase is staged before it is submitted.
        let phase_ops = self.file_count * self.read_ops();
        let depth = self.queue_depth();
        if (depth as usize).next_power_of_two() < phase_ops {
            return Err(ScenarioError::Config(format!(
                "queue depth {depth} cannot hold a phase of {phase_ops} operations"
            )));
        }

        self.ring_config().validate()?;
        Ok(())
    }
}

/// The two-phase file round trip as a [`PhasePlan`].
#[derive(Debug)]
pub struct FileScenario {
    /// Buffer contents and checksum rule.
    pattern: FillPattern,
    /// Bytes per file.
    file_size: usize,
    /// Whether read chains unlink their file.
    unlink: bool,
    /// One path per file.
    paths: Vec<PathBuf>,
    /// One slot per file.
    slots: Vec<FileSlot>,
    /// The buffer each file is written from.
    sources: Vec<RegisteredBuffer>,
    /// The buffer each file is read into. Same as `sources` unless reads use their own buffers.
    targets: Vec<RegisteredBuffer>,
    /// The running checksum.
    checksum: ChecksumAccumulator,
}

/// The index of the write phase.
const WRITE_PHASE: usize = 0;
/// The index of the read phase.
const READ_PHASE: usize = 1;

impl FileScenario {
    /// Registers one file slot per file and a slab holding every buffer.
    ///
    /// # Errors
    ///
    /// Returns the ring's error if the slots or buffers cannot be registered.
    pub fn new(config: &ScenarioConfig, ring: &mut Ring) -> Result<Self, RingError> {
        let count = config.file_count;
        let size = config.file_size;

        let slots = ring.register_file_slots(count)?;

        let buffers = config.buffer_count();
        let slab = vec![0u8; buffers * size].into_boxed_slice();
        let handles = ring.register_slab(slab, (0..buffers).map(|i| i * size..(i + 1) * size))?;

        let sources = handles[..count].to_vec();
        let targets = if config.separate_read_buffers {
            handles[count..].to_vec()
        } else {
            sources.clone()
        };

        debug!(files = count, buffers, "registered scenario resources");

        Ok(Self {
            pattern: config.pattern,
            file_size: size,
            unlink: config.unlink,
            paths: (0..count).map(|i| config.file_path(i)).collect(),
            slots,
            sources,
            targets,
            checksum: ChecksumAccumulator::new(),
        })
    }

    /// The accumulator that collects the observed checksum.
    pub fn checksum(&self) -> &ChecksumAccumulator {
        &self.checksum
    }

    fn stage_writes(&self, ring: &mut Ring) -> Result<(), RingError> {
        for (i, ((path, &slot), &buffer)) in
            self.paths.iter().zip(&self.slots).zip(&self.sources).enumerate()
        {
            self.pattern.seed(i, ring.buffer_mut(buffer)?);

            let chain = RequestChain::new()
                .then(
                    Request::open(path, slot)
                        .access(AccessMode::ReadWrite)
                        .creation(CreationFlags::CREATE | CreationFlags::TRUNCATE)
                        .permissions(Permissions::OWNER_READ_WRITE),
                )
                .then(Request::write(buffer, slot).with_token(token(i)))
                .then(Request::close(slot));
            ring.prepare(chain)?;
        }
        Ok(())
    }

    fn stage_reads(&self, ring: &mut Ring) -> Result<(), RingError> {
        for (i, ((path, &slot), &buffer)) in
            self.paths.iter().zip(&self.slots).zip(&self.targets).enumerate()
        {
            ring.buffer_mut(buffer)?.fill(0);

            let mut chain = RequestChain::new()
                .then(Request::open(path, slot))
                .then(
                    Request::read(slot, buffer)
                        .len(self.file_size as u32)
                        .with_token(token(i)),
                )
                .then(Request::close(slot));
            if self.unlink {
                chain.push(Request::unlink(path));
            }
            ring.prepare(chain)?;
        }
        Ok(())
    }
}

/// The token of file `index`. Zero is reserved for requests without a payload.
fn token(index: usize) -> Token {
    Token(index as u64 + 1)
}

impl PhasePlan for FileScenario {
    fn phases(&self) -> Vec<PhaseSpec> {
        let files = self.paths.len();
        vec![
            PhaseSpec::new("write", files, 3),
            PhaseSpec::new("read", files, if self.unlink { 4 } else { 3 }),
        ]
    }

    fn stage(&mut self, phase: usize, ring: &mut Ring) -> Result<(), RingError> {
        match phase {
            WRITE_PHASE => self.stage_writes(ring),
            READ_PHASE => self.stage_reads(ring),
            _ => Ok(()),
        }
    }

    fn observe(
        &mut self,
        _phase: usize,
        completion: &Completion,
        ring: &Ring,
    ) -> Result<(), RingError> {
        let Outcome::Done(n) = completion.outcome() else {
            return Ok(());
        };
        let Some(index) = completion.token.0.checked_sub(1) else {
            return Ok(());
        };

        let buffers = match completion.kind {
            OpKind::Write if self.pattern.counts_writes() => &self.sources,
            OpKind::Read => &self.targets,
            _ => return Ok(()),
        };
        let Some(&buffer) = buffers.get(index as usize) else {
            return Ok(());
        };

        let bytes = ring.buffer(buffer)?;
        let value = self.pattern.measure(&bytes[..(n as usize).min(bytes.len())]);
        self.checksum.add(value);

        trace!(index, kind = %completion.kind, value, "measured buffer");
        Ok(())
    }
}

/// Runs the round trip on a ring and compares the checksum.
///
/// The files are removed afterwards whether or not the run succeeded.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the ring cannot be set up, or dispatch
/// stops early. A checksum mismatch is not an error; it is reported through the [`Verdict`].
pub fn run(config: &ScenarioConfig) -> Result<Verdict, ScenarioError> {
    config.validate()?;
    fs::create_dir_all(&config.dir)?;

    info!(
        files = config.file_count,
        file_size = config.file_size,
        pattern = %config.pattern,
        mode = ?config.mode,
        policy = ?config.policy,
        queue_depth = config.queue_depth(),
        "starting ring round trip"
    );

    let observed = run_ring(config);
    remove_files(config);

    let verdict = Verdict {
        expected: config.expected(),
        observed: observed?,
    };
    info!(%verdict, passed = verdict.passed(), "round trip finished");
    Ok(verdict)
}

/// Runs both phases. The ring is dropped, and with it every in-flight operation drained, before
/// this returns.
fn run_ring(config: &ScenarioConfig) -> Result<u64, ScenarioError> {
    let mut ring = Ring::with_config(config.ring_config())?;
    let scenario = FileScenario::new(config, &mut ring)?;
    let checksum = scenario.checksum().clone();

    let mut dispatcher = CompletionDispatcher::new(scenario, config.policy);
    match config.mode {
        DispatchMode::Blocking => dispatcher.run_blocking(&mut ring)?,
        DispatchMode::EventDriven => {
            let runtime = Builder::new_current_thread().enable_io().build()?;
            runtime.block_on(dispatcher.run_event_driven(&mut ring))?;
        }
    }

    if dispatcher.failed() > 0 {
        warn!(
            failed = dispatcher.failed(),
            canceled = dispatcher.canceled(),
            "some operations failed"
        );
    }
    Ok(checksum.get())
}

/// Removes every scenario file that still exists.
pub(crate) fn remove_files(config: &ScenarioConfig) {
    for i in 0..config.file_count {
        let path = config.file_path(i);
        match fs::remove_file(&path) {
            Ok(()) => trace!(path = %path.display(), "removed leftover file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), %e, "failed to remove file"),
        }
    }
}
