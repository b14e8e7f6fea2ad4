//! The synchronous reference: the same round trip with blocking `std::fs` calls on a pool of
//! pinned worker threads.
//!
//! Its checksum follows the same rules as the ring scenario, so the two are interchangeable as far
//! as the [`Verdict`] is concerned.

use crate::scenario::{remove_files, ScenarioConfig, ScenarioError};
use crate::verify::{ChecksumAccumulator, Verdict};
use std::{
    fs::{self, File},
    io::{self, Read},
    thread,
};
use tracing::{debug, info};

/// Runs the round trip with one worker per core, at most one per file.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, a file operation fails, or a worker panics.
pub fn run(config: &ScenarioConfig) -> Result<Verdict, ScenarioError> {
    config.validate_files()?;
    fs::create_dir_all(&config.dir)?;

    let cores = core_affinity::get_core_ids().unwrap_or_default();
    let workers = cores.len().clamp(1, config.file_count);
    info!(
        files = config.file_count,
        file_size = config.file_size,
        pattern = %config.pattern,
        workers,
        "starting synchronous round trip"
    );

    let checksum = ChecksumAccumulator::new();
    let result = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let core = cores.get(worker).copied();
                let checksum = checksum.clone();
                s.spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    round_trip(config, worker, workers, &checksum)
                })
            })
            .collect();

        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .map_err(|_| ScenarioError::WorkerPanicked)?
                .map_err(ScenarioError::from)
        })
    });

    remove_files(config);
    result?;

    let verdict = Verdict {
        expected: config.expected(),
        observed: checksum.get(),
    };
    info!(%verdict, passed = verdict.passed(), "synchronous round trip finished");
    Ok(verdict)
}

/// Writes, reads back and (optionally) removes every `stride`-th file starting at `first`.
fn round_trip(
    config: &ScenarioConfig,
    first: usize,
    stride: usize,
    checksum: &ChecksumAccumulator,
) -> io::Result<()> {
    let mut buf = vec![0u8; config.file_size];

    for index in (first..config.file_count).step_by(stride) {
        let path = config.file_path(index);

        config.pattern.seed(index, &mut buf);
        fs::write(&path, &buf)?;
        if config.pattern.counts_writes() {
            checksum.add(config.pattern.measure(&buf));
        }

        buf.fill(0);
        File::open(&path)?.read_exact(&mut buf)?;
        checksum.add(config.pattern.measure(&buf));

        if config.unlink {
            fs::remove_file(&path)?;
        }
        debug!(index, "file round trip complete");
    }

    Ok(())
}
