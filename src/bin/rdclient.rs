//! File transfer client.
//!
//! Used in conjunction with `rdserver` for file distribution. If a
//! `!const` file exists, an attempt to update it terminates this client.

use std::process::ExitCode;

use clap::Parser;

use rdsync::client::{self, ClientOptions};
use rdsync::{logging, registry, SERVER_PORT};

/// Replicates a server directory subtree onto this host.
#[derive(Parser)]
#[command(name = "rdclient", version)]
struct Args {
    /// Remove client files that do not exist in the server tree.
    #[arg(short = 'E', long = "erase")]
    erase: bool,

    /// Update client files even when the server copy is older.
    #[arg(short = 'O', long = "older")]
    older: bool,

    /// Skip the working-directory name match verification.
    #[arg(short = 'U', long = "unsafe")]
    unsafe_cwd: bool,

    /// Use checksum difference verification.
    #[arg(short = 'V', long = "verify")]
    verify: bool,

    /// Suppress informative messages.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Server host, optionally with a port (host[:port]).
    host: Option<String>,

    /// Initial path to replicate.
    path: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    let (host, port) = match split_host(args.host.as_deref()) {
        Ok(pair) => pair,
        Err(message) => {
            eprintln!("rdclient: {message}");
            return ExitCode::from(2);
        }
    };

    let _signals = registry::spawn_signal_reader();

    let opts = ClientOptions {
        path: args.path.unwrap_or_else(|| ".".to_owned()),
        base: None,
        erase: args.erase,
        older: args.older,
        unsafe_cwd: args.unsafe_cwd,
        verify: args.verify,
        quiet: args.quiet,
    };

    match client::run(&host, port, opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rdclient: {err}");
            ExitCode::FAILURE
        }
    }
}

fn split_host(arg: Option<&str>) -> Result<(String, u16), String> {
    let Some(arg) = arg else {
        return Ok(("127.0.0.1".to_owned(), SERVER_PORT));
    };
    match arg.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| format!("invalid port number '{port}'"))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((arg.to_owned(), SERVER_PORT)),
    }
}
