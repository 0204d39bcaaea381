//! rdsync - remote directory-tree replication in Rust.
//!
//! One side (`rdserver`) exposes a directory subtree read-only; the other
//! (`rdclient`) walks both trees in lockstep over a length-prefixed
//! request/response protocol and installs, removes or updates local items
//! until the local subtree matches the remote one in content, type and
//! metadata.

pub mod caps;
pub mod client;
pub mod entry;
pub mod listing;
pub mod logging;
pub mod registry;
pub mod server;
pub mod wire;

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Largest size of a file or directory name part, excluding the terminator.
pub const MAX_DIRNAME: usize = 512;

/// Size of the per-session transfer buffer.
pub const MAX_TRANSFER: usize = 0x0010_0000;

/// Largest number of bytes handed to a single send call. This is a tuning
/// knob, not a protocol field: larger payloads are split.
pub const MAX_SENDSIZE: usize = 1500;

/// The "well-known" server port.
#[cfg(windows)]
pub const SERVER_PORT: u16 = 0xfefc;
#[cfg(not(windows))]
pub const SERVER_PORT: u16 = 0xfefe;

/// Reserved file name marking a file as immutable to this tool.
pub const CONST_FILE: &str = "!const";

/// Modification times earlier than this floor (2000-01-01 UTC) are raised
/// to the current time when applied.
pub const MTIME_FLOOR: i64 = 946_684_800;

/// Result alias for session-level operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that terminate a replication session.
#[derive(Debug)]
pub enum SessionError {
    /// Protocol-level failure: framing, unexpected bytes, transport I/O.
    Wire(wire::Error),
    /// Local failure that cannot be confined to a single item.
    Io(io::Error),
    /// The two sides run different protocol versions.
    VersionMismatch { local: String, remote: String },
    /// Working directory names do not match and unsafe mode is off.
    CwdMismatch { client: String, server: String },
    /// The peer sent a request that is invalid in the current state.
    UnexpectedRequest(wire::Request),
    /// The peer answered an operation with an impossible response.
    UnexpectedResponse {
        op: &'static str,
        response: wire::Response,
    },
    /// An action would modify a `!const` file.
    ConstFile(PathBuf),
}

impl From<wire::Error> for SessionError {
    fn from(err: wire::Error) -> Self {
        SessionError::Wire(err)
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Io(err)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Wire(err) => write!(f, "protocol error: {err:?}"),
            SessionError::Io(err) => write!(f, "I/O error: {err}"),
            SessionError::VersionMismatch { local, remote } => {
                write!(f, "version mismatch: here({local}) peer({remote})")
            }
            SessionError::CwdMismatch { client, server } => {
                write!(
                    f,
                    "working directory mismatch: client({client}) server({server})"
                )
            }
            SessionError::UnexpectedRequest(request) => {
                write!(f, "unexpected request {request:?}")
            }
            SessionError::UnexpectedResponse { op, response } => {
                write!(f, "unexpected response {response:?} to {op}")
            }
            SessionError::ConstFile(path) => {
                write!(
                    f,
                    "attempt to modify {} (this must be done manually)",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for SessionError {}
