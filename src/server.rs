//! The directory server: a listener spawning one session per connection.
//!
//! A server session never modifies the local tree and never changes
//! permissions during a transfer. A concurrent session could observe a
//! temporary permission change and make it permanent.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::caps::{SessionCaps, VersionInfo, VERSION_INFO_LEN};
use crate::entry::{Entry, FileKind, INFO_RUSR, INFO_XUSR};
use crate::listing::{join_name, Listing};
use crate::registry::{Lifecycle, Registry, SessionKind, Ticket};
use crate::wire::{Connection, Request, Response};
use crate::{Result, SessionError, MAX_DIRNAME, MAX_TRANSFER, SERVER_PORT};

/// Operating switches for the server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub port: u16,
    /// Directory subtree to expose; the working directory when absent.
    pub root: Option<PathBuf>,
    /// Compute checksums for served listings.
    pub verify: bool,
    /// Suppress informative messages.
    pub quiet: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: SERVER_PORT,
            root: None,
            verify: false,
            quiet: false,
        }
    }
}

/// Binds the listener and serves until shut down.
pub async fn serve(opts: ServerOptions) -> Result<()> {
    let root = match &opts.root {
        Some(path) => path.clone(),
        None => std::env::current_dir().map_err(SessionError::Io)?,
    };

    let listener = TcpListener::bind(("0.0.0.0", opts.port))
        .await
        .map_err(SessionError::Io)?;
    if !opts.quiet {
        println!("Server: Host(0.0.0.0:{}) Path({})", opts.port, root.display());
    }

    let registry = Registry::global();
    let mut ticket = registry.register(SessionKind::Listener, None);
    registry.set_state(ticket.id, Lifecycle::Ready);

    let result = tokio::select! {
        _ = ticket.shutdown.changed() => Ok(()),
        result = accept_loop(&listener, &root, &opts) => result,
    };

    registry.set_state(ticket.id, Lifecycle::Final);
    registry.deregister(ticket.id);
    result
}

async fn accept_loop(listener: &TcpListener, root: &Path, opts: &ServerOptions) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.map_err(SessionError::Io)?;
        stream.set_nodelay(true).map_err(SessionError::Io)?;

        let ticket = Registry::global().register(SessionKind::Server, Some(peer));
        let id = ticket.id;
        let handle = tokio::spawn(session_task(
            stream,
            peer,
            ticket,
            root.to_path_buf(),
            opts.verify,
            opts.quiet,
        ));
        Registry::global().attach(id, handle);
    }
}

/// Runs one spawned session, racing it against the shutdown signal so a
/// shutdown drops the session future and with it the transport.
async fn session_task(
    stream: TcpStream,
    peer: SocketAddr,
    mut ticket: Ticket,
    root: PathBuf,
    verify: bool,
    quiet: bool,
) {
    let registry = Registry::global();
    registry.set_state(ticket.id, Lifecycle::Ready);
    if !quiet {
        println!("Server: Connected... Host({peer})");
    }

    let mut session = ServerSession::new(stream, root, verify);
    tokio::select! {
        _ = ticket.shutdown.changed() => {
            registry.set_state(ticket.id, Lifecycle::Closing);
            if !quiet {
                println!("Server: ...Cancelled Host({peer})");
            }
        }
        result = session.run() => match result {
            Ok(()) => {
                if !quiet {
                    println!("Server: ...Completed Host({peer})");
                }
            }
            Err(err) => {
                eprintln!("Server: session error: {err}");
                tracing::error!(%peer, %err, "session failed");
            }
        }
    }

    registry.set_state(ticket.id, Lifecycle::Final);
    registry.deregister(ticket.id);
}

/// One server session answering client requests in a directory context.
pub struct ServerSession<S> {
    conn: Connection<S>,
    buffer: Vec<u8>,
    root: PathBuf,
    verify: bool,
    caps: SessionCaps,
    validated: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ServerSession<S> {
    pub fn new(stream: S, root: PathBuf, verify: bool) -> ServerSession<S> {
        ServerSession {
            conn: Connection::new(stream),
            buffer: vec![0u8; MAX_TRANSFER],
            root,
            verify,
            caps: SessionCaps::pending(VersionInfo::local(verify)),
            validated: false,
        }
    }

    /// Runs the top-level request loop until the client quits.
    ///
    /// Until a successful capability exchange only version, working
    /// directory and quit requests are honoured, and a completed directory
    /// walk requires a fresh exchange before the next one.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.conn.recv_request().await? {
                Request::Version => {
                    self.validated = self.exchange_version().await?;
                    let response = if self.validated {
                        Response::Yes
                    } else {
                        Response::No
                    };
                    self.conn.send_response(response).await?;
                }
                Request::Cwd => {
                    self.conn.send_response(Response::Yes).await?;
                    let cwd = self.root.to_string_lossy().into_owned();
                    self.conn.send_string(&cwd).await?;
                }
                Request::Quit => {
                    self.conn.send_response(Response::Yes).await?;
                    return Ok(());
                }
                Request::Goto if self.validated => {
                    let name = self.conn.recv_string(MAX_DIRNAME).await?;
                    let path = join_name(&self.root, &name);
                    self.conn.send_response(Response::Yes).await?;
                    self.serve_directory(&path).await?;
                    self.validated = false;
                }
                _ => {
                    self.conn.send_response(Response::No).await?;
                }
            }
        }
    }

    async fn exchange_version(&mut self) -> Result<bool> {
        let raw = self.conn.recv_bytes(40).await?;
        let local = VersionInfo::local(self.verify);
        self.conn.send_bytes(&local.encode()).await?;

        let Some(remote) = VersionInfo::decode(&raw) else {
            println!(
                "Server: Version length: Got({}) Expected({})",
                raw.len(),
                VERSION_INFO_LEN
            );
            return Ok(false);
        };
        if remote.version != local.version {
            println!(
                "Server: Version mismatch: Here({}) Peer({})",
                local.version_string(),
                remote.version_string()
            );
            return Ok(false);
        }

        self.caps = SessionCaps::new(local, remote);
        Ok(true)
    }

    /// Serves one directory: sends its manifest, then answers file and
    /// descent requests until the client leaves it.
    async fn serve_directory(&mut self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "serve directory");
        let caps = self.caps;
        let mut listing = Listing::from_disk(path.to_path_buf(), &caps).await?;
        self.conn.send_listing(&listing).await?;
        listing.load_children(&caps).await?;

        loop {
            match self.conn.recv_request().await? {
                Request::File => {
                    let name = self.conn.recv_string(MAX_DIRNAME).await?;
                    match listing.locate(&name) {
                        Some(entry)
                            if entry.kind() == FileKind::Regular
                                && entry.info & INFO_RUSR != 0 =>
                        {
                            self.serve_file(path, entry).await?;
                        }
                        _ => {
                            tracing::warn!(%name, "file request refused");
                            self.conn.send_response(Response::No).await?;
                        }
                    }
                }
                Request::Goto => {
                    let name = self.conn.recv_string(MAX_DIRNAME).await?;
                    match listing.locate(&name) {
                        Some(entry)
                            if entry.kind() == FileKind::Directory
                                && entry.info & INFO_RUSR != 0
                                && entry.info & INFO_XUSR != 0 =>
                        {
                            let child = path.join(&entry.name);
                            self.conn.send_response(Response::Yes).await?;
                            Box::pin(self.serve_directory(&child)).await?;
                        }
                        _ => {
                            tracing::warn!(%name, "descent refused");
                            self.conn.send_response(Response::No).await?;
                        }
                    }
                }
                Request::Quit => {
                    self.conn.send_response(Response::Yes).await?;
                    return Ok(());
                }
                other => return Err(SessionError::UnexpectedRequest(other)),
            }
        }
    }

    /// Streams one file body exactly as declared by its listing entry.
    /// A local read failure after acceptance is unrecoverable.
    async fn serve_file(&mut self, dir: &Path, entry: &Entry) -> Result<()> {
        let path = dir.join(&entry.name);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot open file");
                self.conn.send_response(Response::No).await?;
                return Ok(());
            }
        };

        self.conn.send_response(Response::Yes).await?;

        let mut left = entry.size;
        while left > 0 {
            let take = left.min(self.buffer.len() as u64) as usize;
            file.read_exact(&mut self.buffer[..take])
                .await
                .map_err(SessionError::Io)?;
            self.conn.send_body(&self.buffer[..take]).await?;
            left -= take as u64;
        }

        Ok(())
    }
}
