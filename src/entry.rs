//! Directory entries and the attribute word that travels with them.
//!
//! Every filesystem object is described by a 64-bit info word packing the
//! object type, the POSIX permission and mode bits, and the Windows
//! archive/system/hidden/read-only attributes, so either host family can
//! reconstruct the parts it understands.

use std::cmp::Ordering;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::caps::{SessionCaps, OS_POSIX};
use crate::listing::Listing;
use crate::{MAX_TRANSFER, MTIME_FLOOR};

/// Mask for the object-type nibble of the info word.
pub const INFO_TYPE: u64 = 0xf000_0000;
pub const INFO_REGULAR: u64 = 0x1000_0000;
pub const INFO_SYMLINK: u64 = 0x2000_0000;
pub const INFO_DIRECTORY: u64 = 0x3000_0000;
pub const INFO_FIFO: u64 = 0x4000_0000;

// Windows-only attributes.
pub const INFO_ATTR_ARCHIVE: u64 = 0x0008_0000;
pub const INFO_ATTR_SYSTEM: u64 = 0x0004_0000;
pub const INFO_ATTR_HIDDEN: u64 = 0x0002_0000;
pub const INFO_ATTR_READONLY: u64 = 0x0001_0000;

// Mode bits beyond plain permissions.
pub const INFO_SETUID: u64 = 0x0000_8000;
pub const INFO_SETGID: u64 = 0x0000_4000;
pub const INFO_STICKY: u64 = 0x0000_2000;

// Permissions, user/group/other read/write/execute.
pub const INFO_RUSR: u64 = 0x0000_0400;
pub const INFO_WUSR: u64 = 0x0000_0200;
pub const INFO_XUSR: u64 = 0x0000_0100;
pub const INFO_RGRP: u64 = 0x0000_0040;
pub const INFO_WGRP: u64 = 0x0000_0020;
pub const INFO_XGRP: u64 = 0x0000_0010;
pub const INFO_ROTH: u64 = 0x0000_0004;
pub const INFO_WOTH: u64 = 0x0000_0002;
pub const INFO_XOTH: u64 = 0x0000_0001;

/// Subset of the info word meaningful to a Windows host.
pub const INFO_WINDOWS: u64 = 0xf000_0600;

/// All permission and attribute bits.
pub const INFO_PERMITS: u64 = 0x000f_f777;

/// Kind of filesystem object described by an [`Entry`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileKind {
    Unknown,
    Regular,
    Directory,
    Symlink,
    Fifo,
}

impl FileKind {
    /// Extracts the kind from an info word.
    pub fn from_info(info: u64) -> FileKind {
        match info & INFO_TYPE {
            INFO_REGULAR => FileKind::Regular,
            INFO_SYMLINK => FileKind::Symlink,
            INFO_DIRECTORY => FileKind::Directory,
            INFO_FIFO => FileKind::Fifo,
            _ => FileKind::Unknown,
        }
    }

    /// The type nibble for this kind.
    pub fn info_bits(self) -> u64 {
        match self {
            FileKind::Unknown => 0,
            FileKind::Regular => INFO_REGULAR,
            FileKind::Symlink => INFO_SYMLINK,
            FileKind::Directory => INFO_DIRECTORY,
            FileKind::Fifo => INFO_FIFO,
        }
    }

    /// Single-character code used in per-item reports.
    pub fn code(self) -> char {
        match self {
            FileKind::Unknown => 'U',
            FileKind::Regular => 'F',
            FileKind::Directory => 'D',
            FileKind::Symlink => 'L',
            FileKind::Fifo => 'P',
        }
    }
}

/// One filesystem object inside a [`Listing`].
#[derive(Debug)]
pub struct Entry {
    pub name: String,
    pub info: u64,
    pub size: u64,
    /// Whole seconds since the Unix epoch.
    pub mtime: i64,
    /// Additive 64-bit checksum of the file body; zero unless checksumming
    /// was enabled for the session.
    pub ksum: u64,
    /// Target path for symlinks, empty otherwise.
    pub link_target: String,
    /// Lazily populated listing of this directory.
    pub children: Option<Listing>,
}

impl Entry {
    pub fn kind(&self) -> FileKind {
        FileKind::from_info(self.info)
    }

    /// Copy of this entry without the child listing.
    pub fn duplicate(&self) -> Entry {
        Entry {
            name: self.name.clone(),
            info: self.info,
            size: self.size,
            mtime: self.mtime,
            ksum: self.ksum,
            link_target: self.link_target.clone(),
            children: None,
        }
    }

    /// Reads the filesystem metadata of `name` under `dir` into an entry.
    ///
    /// The metadata of the object itself is read (symlinks are not
    /// followed). When either side opted into checksums the body of a
    /// regular file is summed as well; a checksum failure leaves the field
    /// zero rather than failing the listing.
    pub async fn from_file(dir: &Path, name: &str, caps: &SessionCaps) -> io::Result<Entry> {
        let path = dir.join(name);
        let meta = tokio::fs::symlink_metadata(&path).await?;

        let mut info = type_bits(&meta.file_type());
        info |= mode_to_info(&meta);

        let size = meta.len();
        let mtime = mtime_of(&meta);

        let mut link_target = String::new();
        if FileKind::from_info(info) == FileKind::Symlink {
            let target = tokio::fs::read_link(&path).await?;
            link_target = target.into_os_string().into_string().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 link target")
            })?;
        }

        let mut ksum = 0;
        if FileKind::from_info(info) == FileKind::Regular && caps.wants_ksum() {
            ksum = match Entry::checksum(&path, size).await {
                Ok(sum) => sum,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "checksum failed");
                    0
                }
            };
        }

        Ok(Entry {
            name: name.to_owned(),
            info,
            size,
            mtime,
            ksum,
            link_target,
            children: None,
        })
    }

    /// Applies the stored attributes back onto the local object: the
    /// modification time first (times below the floor are raised to now),
    /// then the permission bits.
    pub async fn apply_attributes(&self, dir: &Path) -> io::Result<()> {
        let path = dir.join(&self.name);

        let mut mtime = self.mtime;
        if mtime < MTIME_FLOOR {
            mtime = now_seconds();
        }
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0))?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, Permissions::from_mode(self.mode_bits())).await?;
        }

        Ok(())
    }

    /// The chmod parameter equivalent of the info word.
    pub fn mode_bits(&self) -> u32 {
        let mut mode = 0;
        if self.info & INFO_RUSR != 0 {
            mode |= 0o400;
        }
        if self.info & INFO_WUSR != 0 {
            mode |= 0o200;
        }
        if self.info & INFO_XUSR != 0 {
            mode |= 0o100;
        }
        if self.info & INFO_RGRP != 0 {
            mode |= 0o040;
        }
        if self.info & INFO_WGRP != 0 {
            mode |= 0o020;
        }
        if self.info & INFO_XGRP != 0 {
            mode |= 0o010;
        }
        if self.info & INFO_ROTH != 0 {
            mode |= 0o004;
        }
        if self.info & INFO_WOTH != 0 {
            mode |= 0o002;
        }
        if self.info & INFO_XOTH != 0 {
            mode |= 0o001;
        }
        if self.info & INFO_SETUID != 0 {
            mode |= 0o4000;
        }
        if self.info & INFO_SETGID != 0 {
            mode |= 0o2000;
        }
        if self.info & INFO_STICKY != 0 {
            mode |= 0o1000;
        }
        mode
    }

    /// Compares modification times, masking the low-order bit to absorb
    /// one-second filesystem rounding.
    pub fn compare_mtime(&self, other: &Entry) -> Ordering {
        (self.mtime & !1).cmp(&(other.mtime & !1))
    }

    /// Whether attributes differ enough to need an update, `self` being
    /// the local entry and `server` the remote one.
    ///
    /// The modification time takes part only when both sides run a pure
    /// POSIX system. Under a mixed session with a Windows side the info
    /// words are masked to the Windows-compatible subset, keeping the
    /// owner execute bit for directories so they stay enterable.
    pub fn attrs_differ(&self, server: &Entry, caps: &SessionCaps) -> bool {
        if caps.global.os() == OS_POSIX && self.mtime != server.mtime {
            return true;
        }

        let mut client_info = self.info;
        let mut server_info = server.info;
        if caps.mixed_os() && caps.any_windows() {
            client_info &= INFO_WINDOWS;
            server_info &= INFO_WINDOWS;
            // Directories must stay enterable on the POSIX side no matter
            // what the Windows side reports.
            let owner = INFO_RUSR | INFO_WUSR | INFO_XUSR;
            if self.kind() == FileKind::Directory {
                client_info |= owner;
            }
            if server.kind() == FileKind::Directory {
                server_info |= owner;
            }
        }

        client_info != server_info
    }

    /// Sums the file body in big-endian 8-byte words with natural wrap,
    /// zero-filling the bytes past the end of a short final word.
    pub async fn checksum(path: &Path, size: u64) -> io::Result<u64> {
        let mut file = File::open(path).await?;
        let mut buffer = vec![0u8; MAX_TRANSFER.min(size as usize)];

        let mut ksum = 0u64;
        let mut left = size;
        while left > 0 {
            let take = left.min(buffer.len() as u64) as usize;
            file.read_exact(&mut buffer[..take]).await?;

            for chunk in buffer[..take].chunks(8) {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                ksum = ksum.wrapping_add(u64::from_be_bytes(word));
            }

            left -= take as u64;
        }

        Ok(ksum)
    }
}

/// Orders names the way the session comparator dictates: byte order when
/// case sensitive, ASCII case-folded order otherwise.
pub fn compare_names(case_sensitive: bool, a: &str, b: &str) -> Ordering {
    if case_sensitive {
        a.as_bytes().cmp(b.as_bytes())
    } else {
        let folded_a = a.bytes().map(|byte| byte.to_ascii_lowercase());
        let folded_b = b.bytes().map(|byte| byte.to_ascii_lowercase());
        folded_a.cmp(folded_b)
    }
}

/// Case-folded equality used for duplicate detection.
pub fn fold_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn type_bits(file_type: &std::fs::FileType) -> u64 {
    if file_type.is_symlink() {
        INFO_SYMLINK
    } else if file_type.is_file() {
        INFO_REGULAR
    } else if file_type.is_dir() {
        INFO_DIRECTORY
    } else if is_fifo(file_type) {
        INFO_FIFO
    } else {
        0
    }
}

#[cfg(unix)]
fn is_fifo(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_file_type: &std::fs::FileType) -> bool {
    false
}

#[cfg(unix)]
fn mode_to_info(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;

    let mode = meta.mode();
    let mut info = 0;
    if mode & 0o400 != 0 {
        info |= INFO_RUSR;
    }
    if mode & 0o200 != 0 {
        info |= INFO_WUSR;
    }
    if mode & 0o100 != 0 {
        info |= INFO_XUSR;
    }
    if mode & 0o040 != 0 {
        info |= INFO_RGRP;
    }
    if mode & 0o020 != 0 {
        info |= INFO_WGRP;
    }
    if mode & 0o010 != 0 {
        info |= INFO_XGRP;
    }
    if mode & 0o004 != 0 {
        info |= INFO_ROTH;
    }
    if mode & 0o002 != 0 {
        info |= INFO_WOTH;
    }
    if mode & 0o001 != 0 {
        info |= INFO_XOTH;
    }
    if mode & 0o4000 != 0 {
        info |= INFO_SETUID;
    }
    if mode & 0o2000 != 0 {
        info |= INFO_SETGID;
    }
    if mode & 0o1000 != 0 {
        info |= INFO_STICKY;
    }
    info
}

#[cfg(not(unix))]
fn mode_to_info(meta: &std::fs::Metadata) -> u64 {
    let mut info = INFO_RUSR | INFO_XUSR;
    if meta.permissions().readonly() {
        info |= INFO_ATTR_READONLY;
    } else {
        info |= INFO_WUSR;
    }
    info
}

#[cfg(unix)]
fn mtime_of(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

#[cfg(not(unix))]
fn mtime_of(meta: &std::fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_secs() as i64,
            Err(_) => 0,
        },
        Err(_) => 0,
    }
}

fn now_seconds() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(_) => 0,
    }
}
