//! Logging initialisation driven by the LOG_* environment variables.
//!
//! `LOG_HCDM`, `LOG_SCDM` and `LOG_IODM` are integer verbosity levels; any
//! non-zero value enables file logging and raises the filter (`LOG_HCDM`
//! and `LOG_IODM` to trace, `LOG_SCDM` to debug). `LOG_FILE` names the log
//! file, `rdist.log` by default.

use std::env;
use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// The default log file name.
pub const LOG_FILENAME: &str = "rdist.log";

fn env_level(name: &str) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Installs the tracing subscriber.
///
/// Without any LOG_* variable set, warnings and errors go to stderr
/// (honouring `RUST_LOG` when present). With one set, everything at the
/// selected level goes to the log file; a file open failure falls back to
/// stderr.
pub fn init() {
    let hcdm = env_level("LOG_HCDM");
    let scdm = env_level("LOG_SCDM");
    let iodm = env_level("LOG_IODM");
    let explicit = env::var("LOG_FILE").ok();

    if hcdm <= 0 && scdm <= 0 && iodm <= 0 && explicit.is_none() {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return;
    }

    let level = if hcdm > 0 || iodm > 0 { "trace" } else { "debug" };
    let path = explicit.unwrap_or_else(|| LOG_FILENAME.to_owned());

    match File::create(&path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(level))
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(err) => {
            eprintln!("File({path}): open failure: {err}");
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(level))
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
