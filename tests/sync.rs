//! End-to-end replication scenarios: a real server session and a real
//! client session talking over an in-memory transport.

#![cfg(unix)]

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tempfile::TempDir;

use rdsync::caps::{VersionInfo, ATTR_POSIX, OPT_KSUM, OS_POSIX};
use rdsync::client::{ClientOptions, ClientSession};
use rdsync::entry::{Entry, INFO_REGULAR, INFO_RGRP, INFO_ROTH, INFO_RUSR, INFO_WUSR};
use rdsync::listing::Listing;
use rdsync::server::ServerSession;
use rdsync::wire::{Connection, Request, Response};
use rdsync::{SessionError, MAX_TRANSFER};

struct Fixture {
    server: TempDir,
    client: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            server: TempDir::new().expect("create server dir"),
            client: TempDir::new().expect("create client dir"),
        }
    }

    fn server_path(&self, name: &str) -> PathBuf {
        self.server.path().join(name)
    }

    fn client_path(&self, name: &str) -> PathBuf {
        self.client.path().join(name)
    }

    fn opts(&self) -> ClientOptions {
        ClientOptions {
            base: Some(self.client.path().to_path_buf()),
            unsafe_cwd: true,
            ..ClientOptions::default()
        }
    }

    /// Runs one full session against a real server session rooted at the
    /// server fixture directory.
    async fn sync(&self, opts: ClientOptions, server_verify: bool) -> rdsync::Result<()> {
        let (near, far) = tokio::io::duplex(1 << 20);
        let root = self.server.path().to_path_buf();
        let server =
            tokio::spawn(
                async move { ServerSession::new(far, root, server_verify).run().await },
            );

        let mut session = ClientSession::new(near, opts);
        let result = session.run().await;

        // A fatal client error ends the session without the final quit;
        // the server then sees EOF and reports its own failure.
        drop(session);
        let server_result = server.await.expect("server task");
        if result.is_ok() {
            server_result.expect("server session");
        }
        result
    }
}

fn write_file(path: &Path, data: &[u8]) {
    std::fs::write(path, data).expect("write fixture file");
}

fn set_mode(path: &Path, mode: u32) {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).expect("chmod");
}

fn set_mtime(path: &Path, seconds: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(seconds, 0)).expect("set mtime");
}

fn mode(path: &Path) -> u32 {
    std::fs::symlink_metadata(path).expect("stat").mode() & 0o7777
}

fn mtime(path: &Path) -> i64 {
    std::fs::symlink_metadata(path).expect("stat").mtime()
}

#[tokio::test]
async fn test_install_tree_converges() {
    let fx = Fixture::new();

    write_file(&fx.server_path("a"), b"ABC");
    set_mode(&fx.server_path("a"), 0o644);
    set_mtime(&fx.server_path("a"), 1_600_000_000);

    std::fs::create_dir(fx.server_path("b")).expect("mkdir");
    write_file(&fx.server_path("b/c"), b"");
    set_mtime(&fx.server_path("b/c"), 1_600_000_002);
    set_mode(&fx.server_path("b"), 0o750);
    set_mtime(&fx.server_path("b"), 1_600_000_100);

    fx.sync(fx.opts(), false).await.expect("session");

    assert_eq!(std::fs::read(fx.client_path("a")).expect("read a"), b"ABC");
    assert_eq!(mode(&fx.client_path("a")), 0o644);
    assert_eq!(mtime(&fx.client_path("a")), 1_600_000_000);

    assert!(fx.client_path("b").is_dir());
    assert_eq!(mode(&fx.client_path("b")), 0o750);
    assert_eq!(mtime(&fx.client_path("b")), 1_600_000_100);

    assert_eq!(std::fs::read(fx.client_path("b/c")).expect("read c"), b"");
    assert_eq!(mtime(&fx.client_path("b/c")), 1_600_000_002);

    // A second identical session converges to the same state.
    fx.sync(fx.opts(), false).await.expect("second session");
    assert_eq!(mtime(&fx.client_path("a")), 1_600_000_000);
    assert_eq!(mtime(&fx.client_path("b")), 1_600_000_100);
}

#[tokio::test]
async fn test_no_erase_without_flag() {
    let fx = Fixture::new();
    write_file(&fx.server_path("a"), b"server");
    write_file(&fx.client_path("x"), b"local only");

    fx.sync(fx.opts(), false).await.expect("session");
    assert!(fx.client_path("x").exists());
    assert_eq!(
        std::fs::read(fx.client_path("x")).expect("read x"),
        b"local only"
    );

    let opts = ClientOptions {
        erase: true,
        ..fx.opts()
    };
    fx.sync(opts, false).await.expect("erase session");
    assert!(!fx.client_path("x").exists());
    assert!(fx.client_path("a").exists());
}

#[tokio::test]
async fn test_erase_removes_subtree() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.client_path("gone/deeper")).expect("mkdir");
    write_file(&fx.client_path("gone/deeper/file"), b"x");

    let opts = ClientOptions {
        erase: true,
        ..fx.opts()
    };
    fx.sync(opts, false).await.expect("session");
    assert!(!fx.client_path("gone").exists());
}

#[tokio::test]
async fn test_newer_client_kept_unless_older_flag() {
    let fx = Fixture::new();
    write_file(&fx.server_path("a"), b"SRV");
    set_mtime(&fx.server_path("a"), 1_600_000_000);
    write_file(&fx.client_path("a"), b"CLIENT");
    set_mtime(&fx.client_path("a"), 1_600_001_000);

    fx.sync(fx.opts(), false).await.expect("session");
    assert_eq!(
        std::fs::read(fx.client_path("a")).expect("read"),
        b"CLIENT"
    );

    let opts = ClientOptions {
        older: true,
        ..fx.opts()
    };
    fx.sync(opts, false).await.expect("older session");
    assert_eq!(std::fs::read(fx.client_path("a")).expect("read"), b"SRV");
    assert_eq!(mtime(&fx.client_path("a")), 1_600_000_000);
}

#[tokio::test]
async fn test_type_mismatch_needs_erase() {
    let fx = Fixture::new();
    std::os::unix::fs::symlink("a", fx.server_path("L")).expect("symlink");
    write_file(&fx.client_path("L"), b"plain file");

    fx.sync(fx.opts(), false).await.expect("session");
    let meta = std::fs::symlink_metadata(fx.client_path("L")).expect("stat");
    assert!(meta.file_type().is_file());

    let opts = ClientOptions {
        erase: true,
        ..fx.opts()
    };
    fx.sync(opts, false).await.expect("erase session");
    let meta = std::fs::symlink_metadata(fx.client_path("L")).expect("stat");
    assert!(meta.file_type().is_symlink());
    assert_eq!(
        std::fs::read_link(fx.client_path("L")).expect("read link"),
        PathBuf::from("a")
    );
}

#[tokio::test]
async fn test_checksum_catches_silent_divergence() {
    let fx = Fixture::new();
    // Same size, same mtime: without checksums the files look identical.
    write_file(&fx.server_path("a"), b"AAAA");
    write_file(&fx.client_path("a"), b"BBBB");
    set_mtime(&fx.server_path("a"), 1_600_000_000);
    set_mtime(&fx.client_path("a"), 1_600_000_000);

    fx.sync(fx.opts(), false).await.expect("blind session");
    assert_eq!(std::fs::read(fx.client_path("a")).expect("read"), b"BBBB");

    let opts = ClientOptions {
        verify: true,
        ..fx.opts()
    };
    fx.sync(opts, false).await.expect("verify session");
    assert_eq!(std::fs::read(fx.client_path("a")).expect("read"), b"AAAA");
}

#[tokio::test]
async fn test_const_file_mismatch_is_fatal() {
    let fx = Fixture::new();
    write_file(&fx.client_path("!const"), b"immutable");

    let result = fx.sync(fx.opts(), false).await;
    assert!(matches!(result, Err(SessionError::ConstFile(_))));
    assert_eq!(
        std::fs::read(fx.client_path("!const")).expect("read"),
        b"immutable"
    );
}

#[tokio::test]
async fn test_const_file_matching_is_quiet() {
    let fx = Fixture::new();
    write_file(&fx.server_path("!const"), b"same");
    write_file(&fx.client_path("!const"), b"same");
    set_mode(&fx.server_path("!const"), 0o644);
    set_mode(&fx.client_path("!const"), 0o644);
    set_mtime(&fx.server_path("!const"), 1_600_000_000);
    set_mtime(&fx.client_path("!const"), 1_600_000_000);

    fx.sync(fx.opts(), false).await.expect("session");
    assert_eq!(
        std::fs::read(fx.client_path("!const")).expect("read"),
        b"same"
    );
}

#[tokio::test]
async fn test_cwd_verification() {
    // Matching final path components pass the verification.
    let fx = Fixture::new();
    std::fs::create_dir(fx.server_path("tree")).expect("mkdir");
    std::fs::create_dir(fx.client_path("tree")).expect("mkdir");
    write_file(&fx.server_path("tree/f"), b"data");

    let (near, far) = tokio::io::duplex(1 << 20);
    let root = fx.server_path("tree");
    let server = tokio::spawn(async move { ServerSession::new(far, root, false).run().await });

    let opts = ClientOptions {
        base: Some(fx.client_path("tree")),
        ..ClientOptions::default()
    };
    let mut session = ClientSession::new(near, opts);
    session.run().await.expect("session");
    server.await.expect("server task").expect("server session");
    assert!(fx.client_path("tree/f").exists());

    // Differing names are refused.
    let (near, far) = tokio::io::duplex(1 << 20);
    let root = fx.server_path("tree");
    let server = tokio::spawn(async move { ServerSession::new(far, root, false).run().await });

    let opts = ClientOptions {
        base: Some(fx.client.path().to_path_buf()),
        ..ClientOptions::default()
    };
    let mut session = ClientSession::new(near, opts);
    let result = session.run().await;
    assert!(matches!(result, Err(SessionError::CwdMismatch { .. })));
    server.await.expect("server task").expect("server session");
}

/// A fake peer advertising a case-insensitive filesystem, used to drive
/// the reconciliation paths a homogeneous test host cannot reach.
fn case_folding_peer() -> VersionInfo {
    let mut info = VersionInfo::local(false);
    info.flags = [ATTR_POSIX, OS_POSIX, 0, 0, 0, 0, 0, 0];
    info
}

async fn fake_exchange(conn: &mut Connection<tokio::io::DuplexStream>, peer: VersionInfo) {
    assert_eq!(conn.recv_request().await.expect("request"), Request::Version);
    conn.recv_bytes(40).await.expect("client vector");
    conn.send_bytes(&peer.encode()).await.expect("send vector");
    conn.send_response(Response::Yes).await.expect("send yes");
}

#[tokio::test]
async fn test_ambiguous_case_fold_pair_is_skipped() {
    let client_dir = TempDir::new().expect("client dir");
    write_file(&client_dir.path().join("A"), b"upper");
    write_file(&client_dir.path().join("a"), b"lower");
    set_mode(&client_dir.path().join("a"), 0o644);
    set_mtime(&client_dir.path().join("a"), 1_600_000_000);

    let (near, far) = tokio::io::duplex(1 << 20);
    let base = client_dir.path().to_path_buf();

    let fake_server = tokio::spawn(async move {
        let mut conn = Connection::new(far);
        fake_exchange(&mut conn, case_folding_peer()).await;

        assert_eq!(conn.recv_request().await.expect("request"), Request::Goto);
        assert_eq!(conn.recv_string(512).await.expect("name"), ".");
        conn.send_response(Response::Yes).await.expect("accept");

        let mut listing = Listing::new(PathBuf::from("."));
        listing.entries.push(Entry {
            name: "a".to_owned(),
            info: INFO_REGULAR | INFO_RUSR | INFO_WUSR | INFO_RGRP | INFO_ROTH,
            size: 5,
            mtime: 1_600_000_000,
            ksum: 0,
            link_target: String::new(),
            children: None,
        });
        conn.send_listing(&listing).await.expect("send listing");

        // The ambiguous "A"/"a" pair must not produce a file request.
        assert_eq!(conn.recv_request().await.expect("request"), Request::Quit);
        conn.send_response(Response::Yes).await.expect("quit");
        assert_eq!(conn.recv_request().await.expect("request"), Request::Quit);
        conn.send_response(Response::Yes).await.expect("final quit");
    });

    let opts = ClientOptions {
        base: Some(base),
        unsafe_cwd: true,
        ..ClientOptions::default()
    };
    let mut session = ClientSession::new(near, opts);
    session.run().await.expect("session");
    fake_server.await.expect("fake server");

    // Both local files survive untouched.
    assert_eq!(
        std::fs::read(client_dir.path().join("A")).expect("read"),
        b"upper"
    );
    assert_eq!(
        std::fs::read(client_dir.path().join("a")).expect("read"),
        b"lower"
    );
}

#[tokio::test]
async fn test_backout_removes_partial_file() {
    let client_dir = TempDir::new().expect("client dir");
    let (near, far) = tokio::io::duplex(1 << 20);
    let base = client_dir.path().to_path_buf();

    let fake_server = tokio::spawn(async move {
        let mut conn = Connection::new(far);
        fake_exchange(&mut conn, VersionInfo::local(false)).await;

        assert_eq!(conn.recv_request().await.expect("request"), Request::Goto);
        conn.recv_string(512).await.expect("name");
        conn.send_response(Response::Yes).await.expect("accept");

        let mut listing = Listing::new(PathBuf::from("."));
        listing.entries.push(Entry {
            name: "big".to_owned(),
            info: INFO_REGULAR | INFO_RUSR | INFO_WUSR,
            size: MAX_TRANSFER as u64,
            mtime: 1_600_000_000,
            ksum: 0,
            link_target: String::new(),
            children: None,
        });
        conn.send_listing(&listing).await.expect("send listing");

        assert_eq!(conn.recv_request().await.expect("request"), Request::File);
        assert_eq!(conn.recv_string(512).await.expect("name"), "big");
        conn.send_response(Response::Yes).await.expect("accept");

        // Deliver a fraction of the declared body, then drop the
        // transport.
        conn.send_body(&[0u8; 1000]).await.expect("partial body");
    });

    let opts = ClientOptions {
        base: Some(base),
        unsafe_cwd: true,
        ..ClientOptions::default()
    };
    let mut session = ClientSession::new(near, opts);
    let result = session.run().await;
    fake_server.await.expect("fake server");

    assert!(matches!(result, Err(SessionError::Wire(_))));
    assert!(!client_dir.path().join("big").exists());
}

#[tokio::test]
async fn test_version_mismatch_refused() {
    let client_dir = TempDir::new().expect("client dir");
    let (near, far) = tokio::io::duplex(1 << 20);

    let fake_server = tokio::spawn(async move {
        let mut conn = Connection::new(far);
        assert_eq!(conn.recv_request().await.expect("request"), Request::Version);
        conn.recv_bytes(40).await.expect("client vector");

        let mut stale = VersionInfo::local(false);
        stale.version = *b"0.19990101\0\0\0\0\0\0";
        conn.send_bytes(&stale.encode()).await.expect("send vector");
        conn.send_response(Response::No).await.expect("refuse");

        assert_eq!(conn.recv_request().await.expect("request"), Request::Quit);
        conn.send_response(Response::Yes).await.expect("quit");
    });

    let opts = ClientOptions {
        base: Some(client_dir.path().to_path_buf()),
        unsafe_cwd: true,
        ..ClientOptions::default()
    };
    let mut session = ClientSession::new(near, opts);
    let result = session.run().await;
    fake_server.await.expect("fake server");
    assert!(matches!(result, Err(SessionError::VersionMismatch { .. })));
}

#[tokio::test]
async fn test_checksum_opt_in_is_advertised() {
    let client_dir = TempDir::new().expect("client dir");
    let (near, far) = tokio::io::duplex(1 << 20);

    let fake_server = tokio::spawn(async move {
        let mut conn = Connection::new(far);
        assert_eq!(conn.recv_request().await.expect("request"), Request::Version);
        let raw = conn.recv_bytes(40).await.expect("client vector");
        let client_info = VersionInfo::decode(&raw).expect("decode");
        assert_eq!(client_info.flags[7] & OPT_KSUM, OPT_KSUM);

        conn.send_bytes(&VersionInfo::local(false).encode())
            .await
            .expect("send vector");
        conn.send_response(Response::Yes).await.expect("accept");

        assert_eq!(conn.recv_request().await.expect("request"), Request::Goto);
        conn.recv_string(512).await.expect("name");
        conn.send_response(Response::Yes).await.expect("accept");
        conn.send_listing(&Listing::new(PathBuf::from(".")))
            .await
            .expect("empty listing");
        assert_eq!(conn.recv_request().await.expect("request"), Request::Quit);
        conn.send_response(Response::Yes).await.expect("quit");
        assert_eq!(conn.recv_request().await.expect("request"), Request::Quit);
        conn.send_response(Response::Yes).await.expect("final quit");
    });

    let opts = ClientOptions {
        base: Some(client_dir.path().to_path_buf()),
        unsafe_cwd: true,
        verify: true,
        ..ClientOptions::default()
    };
    let mut session = ClientSession::new(near, opts);
    session.run().await.expect("session");
    fake_server.await.expect("fake server");
}
