use linked_uring::{
    baseline,
    dispatch::ErrorPolicy,
    scenario::{self, DispatchMode, ScenarioConfig, ScenarioError},
    verify::Verdict,
};
use std::{env, process::ExitCode};
use tracing::error;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: linked-uring [--sync] [--blocking] [--strict] [--files N] [--size BYTES]
                    [--pattern byte:V|index] [--dir PATH] [--no-unlink] [--depth N]";

/// What the process was asked to do.
struct Options {
    /// Run the synchronous baseline instead of the ring.
    sync: bool,
    /// The round trip to run.
    config: ScenarioConfig,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut sync = false;
    let mut config = ScenarioConfig::default();

    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().ok_or_else(|| format!("{name} needs a value"));

        match arg.as_str() {
            "--sync" => sync = true,
            "--blocking" => config.mode = DispatchMode::Blocking,
            "--strict" => config.policy = ErrorPolicy::Strict,
            "--no-unlink" => config.unlink = false,
            "--files" => config.file_count = parse(&value("--files")?)?,
            "--size" => config.file_size = parse(&value("--size")?)?,
            "--depth" => config.queue_depth = Some(parse(&value("--depth")?)?),
            "--dir" => config.dir = value("--dir")?.into(),
            "--pattern" => {
                config.pattern = value("--pattern")?.parse().map_err(|e| format!("{e}"))?;
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }

    Ok(Options { sync, config })
}

fn parse<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid number {value:?}"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = match parse_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let result: Result<Verdict, ScenarioError> = if options.sync {
        baseline::run(&options.config)
    } else {
        scenario::run(&options.config)
    };

    match result {
        Ok(verdict) => {
            println!("{verdict}");
            if verdict.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!(%e, "round trip failed");
            ExitCode::from(2)
        }
    }
}
