//! Capability vectors exchanged when a session starts.
//!
//! Each side advertises a 16-byte version identifier and 8 flag bytes.
//! After the exchange the session operates under the byte-wise AND of the
//! two vectors (the "global" vector), so a capability is in effect only
//! when both sides carry it.

/// Version identifier carried in every capability vector. Sessions between
/// differing identifiers are refused.
pub const VERSION_ID: &[u8] = b"3.20130101";

/// Length of an encoded [`VersionInfo`] on the wire.
pub const VERSION_INFO_LEN: usize = 24;

// Flag byte 0: supported attribute families and name semantics.
pub const ATTR_WINDOWS: u8 = 0x80;
pub const ATTR_POSIX: u8 = 0x40;
/// Names with differing case are unique on this side.
pub const CASE_SENSITIVE: u8 = 0x01;

// Flag byte 1: operating system family. The AND of two differing kinds
// degrades to [`OS_MIXED`].
pub const OS_MIXED: u8 = 0;
pub const OS_POSIX: u8 = 1;
pub const OS_CYGWIN: u8 = 2;
pub const OS_WINDOWS: u8 = 4;

// Flag byte 7: operational opt-ins.
/// Compute checksums for all regular files.
pub const OPT_KSUM: u8 = 0x01;

/// One side's capability vector: version identifier plus flag bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: [u8; 16],
    pub flags: [u8; 8],
}

impl VersionInfo {
    /// Builds the local capability vector for this host.
    pub fn local(verify: bool) -> Self {
        let mut version = [0u8; 16];
        version[..VERSION_ID.len()].copy_from_slice(VERSION_ID);

        let mut flags = [0u8; 8];
        #[cfg(windows)]
        {
            flags[0] |= ATTR_WINDOWS;
            flags[1] |= OS_WINDOWS;
        }
        #[cfg(not(windows))]
        {
            flags[0] |= ATTR_POSIX | CASE_SENSITIVE;
            flags[1] |= OS_POSIX;
        }
        if verify {
            flags[7] |= OPT_KSUM;
        }

        Self { version, flags }
    }

    /// Byte-wise AND of two vectors. The version identifier is taken from
    /// `self`; the two must already have been checked for equality.
    pub fn intersect(&self, other: &Self) -> Self {
        let mut flags = [0u8; 8];
        for (i, flag) in flags.iter_mut().enumerate() {
            *flag = self.flags[i] & other.flags[i];
        }
        Self {
            version: self.version,
            flags,
        }
    }

    /// The version identifier as printable text.
    pub fn version_string(&self) -> String {
        let end = self
            .version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.version.len());
        String::from_utf8_lossy(&self.version[..end]).into_owned()
    }

    pub fn case_sensitive(&self) -> bool {
        self.flags[0] & CASE_SENSITIVE != 0
    }

    pub fn os(&self) -> u8 {
        self.flags[1]
    }

    pub fn is_windows(&self) -> bool {
        self.flags[1] == OS_WINDOWS
    }

    pub fn wants_ksum(&self) -> bool {
        self.flags[7] & OPT_KSUM != 0
    }

    /// Serializes the vector into its wire form.
    pub fn encode(&self) -> [u8; VERSION_INFO_LEN] {
        let mut raw = [0u8; VERSION_INFO_LEN];
        raw[..16].copy_from_slice(&self.version);
        raw[16..].copy_from_slice(&self.flags);
        raw
    }

    /// Decodes a received vector. Anything but exactly
    /// [`VERSION_INFO_LEN`] bytes is refused.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != VERSION_INFO_LEN {
            return None;
        }
        let mut version = [0u8; 16];
        let mut flags = [0u8; 8];
        version.copy_from_slice(&raw[..16]);
        flags.copy_from_slice(&raw[16..]);
        Some(Self { version, flags })
    }
}

/// The three vectors a session operates with.
#[derive(Debug, Clone, Copy)]
pub struct SessionCaps {
    pub local: VersionInfo,
    pub remote: VersionInfo,
    pub global: VersionInfo,
}

impl SessionCaps {
    pub fn new(local: VersionInfo, remote: VersionInfo) -> Self {
        let global = local.intersect(&remote);
        Self {
            local,
            remote,
            global,
        }
    }

    /// Caps used before the exchange has completed.
    pub fn pending(local: VersionInfo) -> Self {
        Self::new(local, local)
    }

    /// Whether name comparison is case sensitive for this session.
    pub fn case_sensitive(&self) -> bool {
        self.global.case_sensitive()
    }

    /// Whether the two sides run differing operating system families.
    pub fn mixed_os(&self) -> bool {
        self.global.os() == OS_MIXED
    }

    pub fn any_windows(&self) -> bool {
        self.local.is_windows() || self.remote.is_windows()
    }

    /// Checksums are computed when either side asked for them.
    pub fn wants_ksum(&self) -> bool {
        self.local.wants_ksum() || self.remote.wants_ksum()
    }
}

/// Strips host-specific prefixes from a working directory name so the two
/// sides can be compared: the `/cygdrive/X` header for Cygwin peers, the
/// drive letter and backslashes for Windows peers.
pub fn normalize_cwd(info: &VersionInfo, path: &str) -> String {
    match info.os() {
        OS_CYGWIN => {
            let bytes = path.as_bytes();
            if bytes.len() > 11 && path.starts_with("/cygdrive/") && bytes[11] == b'/' {
                path[11..].to_owned()
            } else {
                path.to_owned()
            }
        }
        OS_WINDOWS => {
            let stripped = match path.as_bytes() {
                [_, b':', ..] => &path[2..],
                _ => path,
            };
            stripped.replace('\\', "/")
        }
        _ => path.to_owned(),
    }
}

/// Final component of a directory name.
pub fn name_part(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}
