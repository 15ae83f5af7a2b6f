//! Logging bootstrap.
//!
//! The console shows what the operator asked for. A trace-level copy of the
//! run goes to `undertow-last-run.log`, replaced on every start, so a failed
//! demo can be inspected after the fact.

use std::fmt;
use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt as tracing_fmt};

pub const LOG_FILE_NAME: &str = "undertow-last-run.log";

/// Creates `logs_dir` if needed and truncates the run log inside it.
///
/// # Errors
///
/// - `std::io::Error` - The directory or the file could not be created
pub fn prepare_log_file(logs_dir: &Path) -> std::io::Result<(File, PathBuf)> {
    create_dir_all(logs_dir)?;
    let path = logs_dir.join(LOG_FILE_NAME);
    let file = File::create(&path)?;
    Ok((file, path))
}

/// `RUST_LOG` wins over `level` when it is set and parses.
fn console_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Installs the global subscriber. `logs_dir` defaults to `./logs`.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - The run log could not be prepared, or a global subscriber was already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (run_log, run_log_path) = prepare_log_file(logs_dir.unwrap_or(Path::new("logs")))?;

    let console = tracing_fmt::layer()
        .with_target(true)
        .without_time()
        .with_filter(console_filter(console_level));

    // Thread names matter here: the fallback alert thread logs as undertow-alerts
    let run_file = tracing_fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(run_log)
        .with_filter(LevelFilter::TRACE);

    tracing_subscriber::registry()
        .with(console)
        .with(run_file)
        .try_init()?;

    tracing::info!(
        "Logging at {} to console, full trace in {}",
        console_level,
        run_log_path.display()
    );
    Ok(())
}

/// Console verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogLevel {
    Error,
    /// Includes stalled-subscriber warnings
    Warn,
    Info,
    /// Includes every alert the driver dispatches
    Debug,
    /// Includes subscription registration
    Trace,
}

impl CliLogLevel {
    /// ```
    /// use undertow_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Debug.as_tracing_level(), tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        Level::from(self)
    }
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

impl fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}
