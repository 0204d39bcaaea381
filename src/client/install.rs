//! Install, update and remove operations on the client tree.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::ClientSession;
use crate::entry::{Entry, FileKind, INFO_RUSR, INFO_WUSR, INFO_XUSR};
use crate::listing::Listing;
use crate::wire::{Request, Response};
use crate::{Result, SessionError, CONST_FILE};

/// Scoped owner of the responsibility to delete a partially written file.
///
/// While armed, dropping the guard removes the half-written target; a
/// completed transfer disarms it first.
pub(crate) struct BackoutGuard {
    target: Option<(PathBuf, String)>,
}

impl BackoutGuard {
    pub(crate) fn new(path: PathBuf, name: String) -> BackoutGuard {
        BackoutGuard {
            target: Some((path, name)),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.target = None;
    }
}

impl Drop for BackoutGuard {
    fn drop(&mut self) {
        if let Some((path, name)) = self.target.take() {
            println!("  {:<10} {} {:<32} {}", "removed", 'F', name, "[Backout action]");
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::error!(path = %path.display(), %err, "backout removal failed");
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    /// Installs one item of any kind. Returns whether the client now
    /// holds it; per-item failures are reported and absorbed.
    pub(crate) async fn install_item(
        &mut self,
        dir: &Path,
        server: &Entry,
        client: &mut Entry,
    ) -> Result<bool> {
        let path = dir.join(&server.name);
        tracing::debug!(path = %path.display(), kind = ?server.kind(), "install");

        let installed = match server.kind() {
            FileKind::Directory => {
                // Created with owner r/w/x so nested installs can succeed;
                // the recorded attributes are applied after the children.
                match tokio::fs::create_dir(&path).await {
                    Ok(()) => {
                        set_owner_mode(&path, 0o700).await;
                        return Ok(true);
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "mkdir failed");
                        false
                    }
                }
            }
            FileKind::Symlink => {
                if make_symlink(&server.link_target, &path).await {
                    client.link_target = server.link_target.clone();
                    true
                } else {
                    self.report("skipped", server, "[Cannot create link]");
                    false
                }
            }
            FileKind::Regular => self.fetch_file(dir, server).await?,
            FileKind::Fifo => {
                client.info = server.info;
                if !self.make_fifo(&path, server) {
                    return Ok(false);
                }
                true
            }
            FileKind::Unknown => {
                self.report("ignored", client, "[What kind of thing is it?]");
                false
            }
        };

        if installed {
            self.update_attr(dir, server, client).await;
        }
        Ok(installed)
    }

    /// Requests a file body from the server and streams it into a
    /// temp-committed target under a backout guard.
    ///
    /// When the local open fails the declared body is still consumed so
    /// the exchange stays balanced.
    async fn fetch_file(&mut self, dir: &Path, server: &Entry) -> Result<bool> {
        let path = dir.join(&server.name);

        self.conn.send_request(Request::File).await?;
        self.conn.send_string(&server.name).await?;
        match self.conn.recv_response().await? {
            Response::Yes => {}
            Response::No => {
                self.report("skipped", server, "[Disallowed by SERVER]");
                return Ok(false);
            }
        }

        let mut file = match open_target(&path).await {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "open failed");
                self.report("aborted", server, "[Open failure]");
                None
            }
        };

        let mut guard = BackoutGuard::new(path.clone(), server.name.clone());
        if file.is_none() {
            guard.disarm();
        }

        let mut left = server.size;
        while left > 0 {
            let take = left.min(self.buffer.len() as u64) as usize;
            self.conn.recv_body(&mut self.buffer[..take]).await?;
            if let Some(file) = file.as_mut() {
                file.write_all(&self.buffer[..take])
                    .await
                    .map_err(SessionError::Io)?;
            }
            left -= take as u64;
        }

        // Transfer complete; the guard no longer owns the file's fate.
        guard.disarm();

        let Some(mut file) = file else {
            return Ok(false);
        };
        if let Err(err) = file.flush().await {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            tracing::warn!(path = %path.display(), %err, "close failed");
            self.report("aborted", server, "[I/O error]");
            return Ok(false);
        }

        Ok(true)
    }

    #[cfg(unix)]
    fn make_fifo(&self, path: &Path, server: &Entry) -> bool {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
            return false;
        };
        let rc = unsafe { libc::mkfifo(cpath.as_ptr(), server.mode_bits() as libc::mode_t) };
        if rc != 0 {
            tracing::warn!(path = %path.display(), "mkfifo failed");
            return false;
        }
        true
    }

    #[cfg(not(unix))]
    fn make_fifo(&self, path: &Path, server: &Entry) -> bool {
        let _ = path;
        self.report("skipped", server, "[mkfifo not supported]");
        false
    }

    /// Copies the server attributes onto the client entry and applies
    /// them to the local object. Symlink attributes are never updated.
    pub(crate) async fn update_attr(&mut self, dir: &Path, server: &Entry, client: &mut Entry) {
        if server.kind() == FileKind::Symlink {
            return;
        }
        client.size = server.size;
        client.mtime = server.mtime;
        client.info = server.info;
        client.ksum = server.ksum;
        if let Err(err) = client.apply_attributes(dir).await {
            tracing::warn!(name = %client.name, %err, "cannot apply attributes");
        }
    }

    /// Replaces an existing item: remove, then install.
    pub(crate) async fn update_item(
        &mut self,
        dir: &Path,
        server: &Entry,
        client: &mut Entry,
    ) -> Result<bool> {
        match client.kind() {
            FileKind::Fifo | FileKind::Directory => Ok(true),
            FileKind::Regular | FileKind::Symlink => {
                if !self.remove_item(dir, client).await? {
                    return Ok(false);
                }
                self.install_item(dir, server, client).await
            }
            FileKind::Unknown => Ok(false),
        }
    }

    /// Removes one item. A `!const` target refuses fatally; any other
    /// failure is confined to the item.
    pub(crate) async fn remove_item(&mut self, dir: &Path, entry: &Entry) -> Result<bool> {
        if entry.name == CONST_FILE {
            return Err(SessionError::ConstFile(dir.join(CONST_FILE)));
        }

        let path = dir.join(&entry.name);
        tracing::debug!(path = %path.display(), kind = ?entry.kind(), "remove");

        let outcome = match entry.kind() {
            FileKind::Directory => tokio::fs::remove_dir(&path).await,
            FileKind::Regular | FileKind::Symlink | FileKind::Fifo => {
                tokio::fs::remove_file(&path).await
            }
            FileKind::Unknown => {
                self.report("ignored", entry, "[What kind of thing is it?]");
                return Ok(false);
            }
        };

        match outcome {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "remove failed");
                Ok(false)
            }
        }
    }

    /// Removes a directory subtree, contents first. Permissions the owner
    /// lacks are granted for the traversal and restored afterwards.
    pub(crate) async fn remove_directory(&mut self, dir: &Path, entry: &Entry) -> Result<()> {
        let path = dir.join(&entry.name);
        tracing::debug!(path = %path.display(), "remove directory");

        let owner_bits = INFO_RUSR | INFO_WUSR | INFO_XUSR;
        let lacking = entry.info & owner_bits != owner_bits;
        if lacking {
            grant_owner_mode(&path, entry.mode_bits() | 0o700).await?;
        }

        let caps = self.caps;
        let listing = Listing::from_disk(path.clone(), &caps)
            .await
            .map_err(SessionError::Io)?;
        for child in &listing.entries {
            if child.kind() == FileKind::Directory {
                Box::pin(self.remove_directory(&path, child)).await?;
            }
            self.remove_item(&path, child).await?;
        }

        if lacking {
            grant_owner_mode(&path, entry.mode_bits()).await?;
        }
        Ok(())
    }
}

async fn open_target(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    options.open(path).await
}

#[cfg(unix)]
async fn make_symlink(target: &str, path: &Path) -> bool {
    match tokio::fs::symlink(target, path).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "symlink failed");
            false
        }
    }
}

#[cfg(not(unix))]
async fn make_symlink(_target: &str, path: &Path) -> bool {
    tracing::warn!(path = %path.display(), "symlink not supported");
    false
}

/// Best-effort owner mode change used right after creating a directory.
async fn set_owner_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = tokio::fs::set_permissions(path, Permissions::from_mode(mode)).await {
            tracing::warn!(path = %path.display(), %err, "chmod failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

/// Mode change that must succeed for subtree removal to proceed.
async fn grant_owner_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, Permissions::from_mode(mode))
            .await
            .map_err(SessionError::Io)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}
