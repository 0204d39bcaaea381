//! The client engine: capability negotiation and the recursive merge walk
//! that drives the server.

mod install;

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::caps::{name_part, normalize_cwd, SessionCaps, VersionInfo, VERSION_INFO_LEN};
use crate::entry::{compare_names, fold_eq, Entry, FileKind, INFO_DIRECTORY, INFO_PERMITS, INFO_TYPE};
use crate::listing::{join_name, Listing};
use crate::registry::{Lifecycle, Registry, SessionKind};
use crate::wire::{Connection, Request, Response};
use crate::{Result, SessionError, CONST_FILE, MAX_TRANSFER};

/// Operating switches for a client session.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Initial path to replicate, relative to the base directory.
    pub path: String,
    /// Base directory; the working directory when absent.
    pub base: Option<PathBuf>,
    /// Remove client items that do not exist on the server.
    pub erase: bool,
    /// Update even when the server copy is older.
    pub older: bool,
    /// Skip the working-directory name match verification.
    pub unsafe_cwd: bool,
    /// Use checksum difference verification.
    pub verify: bool,
    /// Suppress informative messages.
    pub quiet: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            path: ".".to_owned(),
            base: None,
            erase: false,
            older: false,
            unsafe_cwd: false,
            verify: false,
            quiet: false,
        }
    }
}

/// Connects to a server, registers the session, and replicates.
pub async fn run(host: &str, port: u16, opts: ClientOptions) -> Result<()> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(SessionError::Io)?;
    stream.set_nodelay(true).map_err(SessionError::Io)?;
    let peer = stream.peer_addr().ok();

    let quiet = opts.quiet;
    if !quiet {
        println!("Client: Started...");
    }

    let registry = Registry::global();
    let mut ticket = registry.register(SessionKind::Client, peer);
    registry.set_state(ticket.id, Lifecycle::Ready);

    let mut session = ClientSession::new(stream, opts);
    let result = tokio::select! {
        _ = ticket.shutdown.changed() => {
            registry.set_state(ticket.id, Lifecycle::Closing);
            if !quiet {
                println!("Client: ...Terminated");
            }
            Ok(())
        }
        result = session.run() => result,
    };

    if result.is_ok() && !quiet {
        println!("Client: ...Complete");
    }
    registry.set_state(ticket.id, Lifecycle::Final);
    registry.deregister(ticket.id);
    result
}

/// One client session driving a server.
pub struct ClientSession<S> {
    pub(crate) conn: Connection<S>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) caps: SessionCaps,
    pub(crate) opts: ClientOptions,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    pub fn new(stream: S, opts: ClientOptions) -> ClientSession<S> {
        let caps = SessionCaps::pending(VersionInfo::local(opts.verify));
        ClientSession {
            conn: Connection::new(stream),
            buffer: vec![0u8; MAX_TRANSFER],
            caps,
            opts,
        }
    }

    /// Runs the session: capability exchange, recursive walk, final quit.
    pub async fn run(&mut self) -> Result<()> {
        match self.exchange_version().await {
            Ok(()) => {
                let base = self.base_dir()?;
                let path = self.opts.path.clone();
                let listing = Listing::from_disk(join_name(&base, &path), &self.caps).await?;
                let mut top = Entry {
                    name: path,
                    info: INFO_DIRECTORY,
                    size: 0,
                    mtime: 0,
                    ksum: 0,
                    link_target: String::new(),
                    children: Some(listing),
                };
                self.update_directory(&base, &mut top).await?;
                self.quit("QUIT").await
            }
            Err(err) => {
                // End the session in an orderly way before reporting.
                let _ = self.quit("QUIT").await;
                Err(err)
            }
        }
    }

    fn base_dir(&self) -> Result<PathBuf> {
        match &self.opts.base {
            Some(path) => Ok(path.clone()),
            None => std::env::current_dir().map_err(SessionError::Io),
        }
    }

    async fn quit(&mut self, op: &'static str) -> Result<()> {
        self.conn.send_request(Request::Quit).await?;
        match self.conn.recv_response().await? {
            Response::Yes => Ok(()),
            response => Err(SessionError::UnexpectedResponse { op, response }),
        }
    }

    /// Exchanges capability vectors and, unless unsafe mode was requested,
    /// verifies that the two working directory names agree.
    async fn exchange_version(&mut self) -> Result<()> {
        let local = VersionInfo::local(self.opts.verify);
        self.conn.send_request(Request::Version).await?;
        self.conn.send_bytes(&local.encode()).await?;
        let raw = self.conn.recv_bytes(40).await?;
        let response = self.conn.recv_response().await?;

        let remote = match VersionInfo::decode(&raw) {
            Some(remote) if remote.version == local.version => remote,
            Some(remote) => {
                println!(
                    "Client: Version mismatch: Here({}) Peer({})",
                    local.version_string(),
                    remote.version_string()
                );
                return Err(SessionError::VersionMismatch {
                    local: local.version_string(),
                    remote: remote.version_string(),
                });
            }
            None => {
                println!(
                    "Client: Version length: Got({}) Expected({})",
                    raw.len(),
                    VERSION_INFO_LEN
                );
                return Err(SessionError::VersionMismatch {
                    local: local.version_string(),
                    remote: String::new(),
                });
            }
        };
        if response != Response::Yes {
            return Err(SessionError::UnexpectedResponse {
                op: "VERSION",
                response,
            });
        }
        self.caps = SessionCaps::new(local, remote);

        if !self.opts.unsafe_cwd {
            self.verify_cwd().await?;
        }
        Ok(())
    }

    /// Compares the final path component of each side's working directory
    /// after host-specific normalisation.
    async fn verify_cwd(&mut self) -> Result<()> {
        let base = self.base_dir()?;

        self.conn.send_request(Request::Cwd).await?;
        match self.conn.recv_response().await? {
            Response::Yes => {}
            response => {
                return Err(SessionError::UnexpectedResponse {
                    op: "GETCWD",
                    response,
                })
            }
        }
        let server_cwd = self.conn.recv_string(4096).await?;

        let client_cwd = normalize_cwd(&self.caps.local, &base.to_string_lossy());
        let server_cwd = normalize_cwd(&self.caps.remote, &server_cwd);
        let client_name = name_part(&client_cwd);
        let server_name = name_part(&server_cwd);
        if client_name != server_name {
            println!("Error: CWD name mismatch: server({server_name}) client({client_name})");
            println!("Use -U for unsafe operation");
            return Err(SessionError::CwdMismatch {
                client: client_name.to_owned(),
                server: server_name.to_owned(),
            });
        }

        if self.caps.mixed_os() && self.caps.any_windows() {
            println!(
                "WARNING: OS mismatch: server({}) client({})",
                if self.caps.remote.is_windows() { "WIN" } else { "POSIX" },
                if self.caps.local.is_windows() { "WIN" } else { "POSIX" },
            );
        }
        Ok(())
    }

    /// Replicates one directory level against the server's manifest, then
    /// recurses into the surviving subdirectories.
    async fn update_directory(&mut self, base: &Path, dir_entry: &mut Entry) -> Result<()> {
        let path = join_name(base, &dir_entry.name);
        tracing::debug!(path = %path.display(), "update directory");

        self.conn.send_request(Request::Goto).await?;
        self.conn.send_string(&dir_entry.name).await?;
        match self.conn.recv_response().await? {
            Response::Yes => {}
            Response::No => {
                let shadow = Entry {
                    name: path.display().to_string(),
                    info: INFO_DIRECTORY,
                    size: 0,
                    mtime: 0,
                    ksum: 0,
                    link_target: String::new(),
                    children: None,
                };
                let mut printed = false;
                self.print_path(&mut printed, &path);
                self.report("skipped", &shadow, "[Disallowed by SERVER]");
                return Ok(());
            }
        }

        let server_l = self.conn.recv_listing(path.clone()).await?;
        let mut client_l = match dir_entry.children.take() {
            Some(listing) => listing,
            None => Listing::from_disk(path.clone(), &self.caps).await?,
        };

        let mut printed = false;
        self.merge(&path, &mut printed, &mut client_l, &server_l.entries)
            .await?;

        // Dive into each remaining subdirectory, reapplying the recorded
        // directory attributes afterwards so child installs cannot clobber
        // them.
        client_l.load_children(&self.caps).await?;
        for entry in client_l.entries.iter_mut() {
            if entry.kind() == FileKind::Directory {
                Box::pin(self.update_directory(&path, entry)).await?;
                let recorded = entry.duplicate();
                self.update_attr(&path, &recorded, entry).await;
            }
        }

        self.quit("QUIT").await
    }

    /// The directory merge over two sorted cursors.
    async fn merge(
        &mut self,
        path: &Path,
        printed: &mut bool,
        client_l: &mut Listing,
        server: &[Entry],
    ) -> Result<()> {
        let case_sensitive = self.caps.case_sensitive();
        let client = &mut client_l.entries;
        let mut ci = 0usize;
        let mut si = 0usize;

        loop {
            let client_done = ci >= client.len();
            let server_done = si >= server.len();
            if client_done && server_done {
                break;
            }

            let position = if client_done {
                Ordering::Greater
            } else if server_done {
                Ordering::Less
            } else {
                compare_names(case_sensitive, &client[ci].name, &server[si].name)
            };

            // An item exists remotely but not locally: install it.
            if position == Ordering::Greater {
                let mut fresh = server[si].duplicate();
                self.print_path(printed, path);
                let installed = self.install_item(path, &server[si], &mut fresh).await?;
                if installed {
                    self.report("installed", &fresh, "");
                    client.insert(ci, fresh);
                    self.advance_pair(printed, path, client, server, &mut ci, &mut si);
                } else {
                    si += 1;
                }
                continue;
            }

            // Disallow any update of a constant file.
            if compare_names(case_sensitive, &client[ci].name, CONST_FILE) == Ordering::Equal {
                let server_entry = if server_done || position == Ordering::Less {
                    None
                } else {
                    Some(&server[si])
                };
                self.check_const(path, &client[ci], server_entry)?;
            }

            // An item exists locally but not remotely: remove it, or keep
            // it when erasure was not requested.
            if position == Ordering::Less {
                self.print_path(printed, path);
                if self.opts.erase {
                    if client[ci].kind() == FileKind::Directory {
                        self.remove_directory(path, &client[ci]).await?;
                    }
                    if self.remove_item(path, &client[ci]).await? {
                        self.report("removed", &client[ci], "");
                    } else {
                        self.report("kept", &client[ci], "[unable to remove]");
                    }
                } else {
                    self.report("kept", &client[ci], "[-E parameter not specified]");
                }
                // Either way the entry leaves the in-memory listing so the
                // subdirectory pass will not descend into it.
                client.remove(ci);
                continue;
            }

            // Names match under the session comparator. When exactly one
            // side folds case, a duplicate sibling on the case-preserving
            // side makes the pairing ambiguous.
            let local_case = self.caps.local.case_sensitive();
            let remote_case = self.caps.remote.case_sensitive();
            if !case_sensitive
                && local_case != remote_case
                && client[ci].name != server[si].name
            {
                if local_case
                    && ci + 1 < client.len()
                    && fold_eq(&client[ci].name, &client[ci + 1].name)
                {
                    self.print_path(printed, path);
                    self.report("skipped", &client[ci], "[ambiguous]");
                    client.remove(ci);
                    continue;
                }
                if remote_case
                    && si + 1 < server.len()
                    && fold_eq(&server[si].name, &server[si + 1].name)
                {
                    self.print_path(printed, path);
                    self.report("skipped", &server[si], "[ambiguous]");
                    si += 1;
                    continue;
                }
            }

            // An identically positioned item is of differing type, or the
            // names differ in case only. It must be removed before the
            // server's item can be installed.
            if client[ci].kind() != server[si].kind() || client[ci].name != server[si].name {
                self.print_path(printed, path);
                if !self.opts.erase {
                    self.report("kept", &client[ci], "[-E parameter not specified]");
                    if client[ci].kind() != server[si].kind() {
                        self.report("remote", &server[si], "[type differs]");
                    } else {
                        self.report("remote", &server[si], "[name differs]");
                    }
                    // Block the subdirectory scan of the kept item.
                    client[ci].info &= !INFO_TYPE;
                } else {
                    if client[ci].kind() == FileKind::Directory {
                        self.remove_directory(path, &client[ci]).await?;
                    }
                    if self.remove_item(path, &client[ci]).await? {
                        self.report("removed", &client[ci], "");
                    }
                    client[ci] = server[si].duplicate();
                    let installed = self.install_item(path, &server[si], &mut client[ci]).await?;
                    if !installed {
                        client.remove(ci);
                        continue;
                    }
                    self.report("installed", &server[si], "");
                }
                self.advance_pair(printed, path, client, server, &mut ci, &mut si);
                continue;
            }

            // An identically named and typed item exists on both sides.
            self.resolve(path, printed, client, server, ci, si).await?;
            self.advance_pair(printed, path, client, server, &mut ci, &mut si);
        }

        Ok(())
    }

    /// Decides what to do with a pair of identically named, identically
    /// typed entries.
    async fn resolve(
        &mut self,
        path: &Path,
        printed: &mut bool,
        client: &mut [Entry],
        server: &[Entry],
        ci: usize,
        si: usize,
    ) -> Result<()> {
        let caps = self.caps;
        match client[ci].kind() {
            FileKind::Directory => {
                if client[ci].attrs_differ(&server[si], &caps) {
                    self.print_path(printed, path);
                    self.update_attr(path, &server[si], &mut client[ci]).await;
                    self.report("attributes", &client[ci], "");
                }
            }
            FileKind::Symlink => {
                if client[ci].link_target != server[si].link_target {
                    self.print_path(printed, path);
                    if self.update_item(path, &server[si], &mut client[ci]).await? {
                        self.report("updated", &client[ci], "");
                    }
                }
            }
            FileKind::Regular => {
                let content_equal = server[si].size == client[ci].size
                    && server[si].ksum == client[ci].ksum
                    && server[si].compare_mtime(&client[ci]) == Ordering::Equal;
                if content_equal {
                    if client[ci].attrs_differ(&server[si], &caps) {
                        self.print_path(printed, path);
                        self.update_attr(path, &server[si], &mut client[ci]).await;
                        self.report("attributes", &client[ci], "");
                    }
                } else if server[si].compare_mtime(&client[ci]) == Ordering::Less
                    && !self.opts.older
                {
                    self.print_path(printed, path);
                    self.report("kept", &client[ci], "[-O parameter not specified]");
                } else {
                    self.print_path(printed, path);
                    if self.update_item(path, &server[si], &mut client[ci]).await? {
                        self.report("updated", &server[si], "");
                    }
                }
            }
            FileKind::Fifo => {
                if (server[si].info & INFO_PERMITS) != (client[ci].info & INFO_PERMITS)
                    || server[si].mtime != client[ci].mtime
                {
                    self.print_path(printed, path);
                    self.update_attr(path, &server[si], &mut client[ci]).await;
                    self.report("attributes", &client[ci], "");
                }
            }
            FileKind::Unknown => {}
        }
        Ok(())
    }

    /// Advances both cursors past a matched pair, skipping (and reporting)
    /// duplicate-by-fold siblings on whichever side preserves case when
    /// the other does not.
    fn advance_pair(
        &self,
        printed: &mut bool,
        path: &Path,
        client: &[Entry],
        server: &[Entry],
        ci: &mut usize,
        si: &mut usize,
    ) {
        let local_case = self.caps.local.case_sensitive();
        let remote_case = self.caps.remote.case_sensitive();

        if local_case && !remote_case {
            while *ci + 1 < client.len() && fold_eq(&client[*ci].name, &client[*ci + 1].name) {
                *ci += 1;
                self.print_path(printed, path);
                self.report("skipped", &client[*ci], "[ambiguous]");
            }
        }
        if !local_case && remote_case {
            while *si + 1 < server.len() && fold_eq(&server[*si].name, &server[*si + 1].name) {
                *si += 1;
                self.print_path(printed, path);
                self.report("skipped", &server[*si], "[ambiguous]");
            }
        }

        *ci += 1;
        *si += 1;
    }

    /// A `!const` entry must be exactly matched by the server; anything
    /// else would require modifying it, which is fatal.
    fn check_const(&self, path: &Path, client: &Entry, server: Option<&Entry>) -> Result<()> {
        let fail = || Err(SessionError::ConstFile(path.join(CONST_FILE)));
        let Some(server) = server else {
            return fail();
        };
        if server.kind() != client.kind() || server.name != client.name {
            return fail();
        }
        if server.size != client.size || server.ksum != client.ksum || server.mtime != client.mtime
        {
            return fail();
        }
        if client.attrs_differ(server, &self.caps) {
            return fail();
        }
        Ok(())
    }

    /// Writes a per-item action report, or logs it in quiet mode.
    pub(crate) fn report(&self, action: &str, entry: &Entry, reason: &str) {
        if self.opts.quiet {
            tracing::info!(action, kind = %entry.kind().code(), name = %entry.name, reason);
        } else {
            println!(
                "  {:<10} {} {:<32} {}",
                action,
                entry.kind().code(),
                entry.name,
                reason
            );
        }
    }

    /// Prints the directory path before its first report.
    pub(crate) fn print_path(&self, printed: &mut bool, path: &Path) {
        if !*printed && !self.opts.quiet {
            println!("\n{}", path.display());
        }
        *printed = true;
    }
}
