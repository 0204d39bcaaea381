//! Sorted directory listings.

use std::io;
use std::path::{Path, PathBuf};

use crate::caps::SessionCaps;
use crate::entry::{compare_names, Entry, FileKind};

/// A directory's entries plus the absolute local path they were read from.
///
/// Entries are kept sorted by the session comparator: byte order when the
/// session is case sensitive, ASCII case-folded order otherwise. `.` and
/// `..` never appear, and on mixed-OS sessions `*.lnk` names are excluded
/// as well.
#[derive(Debug)]
pub struct Listing {
    pub path: PathBuf,
    pub entries: Vec<Entry>,
}

impl Listing {
    /// An empty listing for `path`.
    pub fn new(path: PathBuf) -> Listing {
        Listing {
            path,
            entries: Vec::new(),
        }
    }

    /// Reads and sorts the directory at `path`.
    ///
    /// An unreadable directory yields an empty listing; a stat failure on
    /// an individual entry is an error.
    pub async fn from_disk(path: PathBuf, caps: &SessionCaps) -> io::Result<Listing> {
        let mut entries = Vec::new();

        let mut dir = match tokio::fs::read_dir(&path).await {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot read directory");
                return Ok(Listing { path, entries });
            }
        };

        while let Some(item) = dir.next_entry().await? {
            let name = match item.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    tracing::warn!(name = ?raw, "ignored: non-UTF-8 name");
                    continue;
                }
            };

            // Unless both sides run the same O/S family, skip .lnk files.
            if caps.mixed_os() && is_lnk(&name) {
                continue;
            }

            entries.push(Entry::from_file(&path, &name, caps).await?);
        }

        let case_sensitive = caps.case_sensitive();
        entries.sort_by(|a, b| compare_names(case_sensitive, &a.name, &b.name));

        Ok(Listing { path, entries })
    }

    /// Locates an entry by exact name.
    pub fn locate(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Populates the child listing of every directory entry, one level
    /// deep. Children must be loaded before the recursive walk consumes
    /// them.
    pub async fn load_children(&mut self, caps: &SessionCaps) -> io::Result<()> {
        for entry in self.entries.iter_mut() {
            if entry.kind() == FileKind::Directory && entry.children.is_none() {
                let child_path = self.path.join(&entry.name);
                entry.children = Some(Listing::from_disk(child_path, caps).await?);
            }
        }
        Ok(())
    }
}

/// Joins a directory path and a name, treating `.` as the path itself.
pub fn join_name(path: &Path, name: &str) -> PathBuf {
    if name == "." {
        path.to_path_buf()
    } else {
        path.join(name)
    }
}

fn is_lnk(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() > 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b".lnk")
}
