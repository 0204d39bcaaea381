//! File transfer server.
//!
//! Used in conjunction with `rdclient` for file distribution. The server
//! exposes its working directory read-only and spawns one session per
//! accepted connection.

use std::process::ExitCode;

use clap::Parser;

use rdsync::server::{self, ServerOptions};
use rdsync::{logging, registry, SERVER_PORT};

/// Serves this host's working directory to replication clients.
#[derive(Parser)]
#[command(name = "rdserver", version)]
struct Args {
    /// Override the default port number.
    #[arg(short = 'p', long = "port", default_value_t = SERVER_PORT)]
    port: u16,

    /// Use checksum difference verification.
    #[arg(short = 'V', long = "verify")]
    verify: bool,

    /// Suppress informative messages.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    let _signals = registry::spawn_signal_reader();

    let opts = ServerOptions {
        port: args.port,
        root: None,
        verify: args.verify,
        quiet: args.quiet,
    };

    match server::serve(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rdserver: {err}");
            ExitCode::FAILURE
        }
    }
}
