#![cfg(test)]

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;

use crate::entry::{Entry, INFO_DIRECTORY, INFO_REGULAR, INFO_RUSR, INFO_SYMLINK, INFO_WUSR};
use crate::listing::Listing;
use crate::wire::{Connection, Error, Request, Response};

fn entry(name: &str, info: u64, size: u64) -> Entry {
    Entry {
        name: name.to_owned(),
        info,
        size,
        mtime: 1_700_000_000,
        ksum: 0,
        link_target: String::new(),
        children: None,
    }
}

#[tokio::test]
async fn test_request_response_roundtrip() {
    let (near, far) = tokio::io::duplex(4096);
    let mut sender = Connection::new(near);
    let mut receiver = Connection::new(far);

    for request in [
        Request::File,
        Request::Goto,
        Request::Quit,
        Request::Version,
        Request::Cwd,
    ] {
        sender.send_request(request).await.unwrap();
        assert_eq!(receiver.recv_request().await.unwrap(), request);
    }

    receiver.send_response(Response::Yes).await.unwrap();
    assert_eq!(sender.recv_response().await.unwrap(), Response::Yes);
    receiver.send_response(Response::No).await.unwrap();
    assert_eq!(sender.recv_response().await.unwrap(), Response::No);
}

#[tokio::test]
async fn test_request_bytes_are_ascii_codes() {
    let (near, mut far) = tokio::io::duplex(64);
    let mut sender = Connection::new(near);

    sender.send_request(Request::Goto).await.unwrap();
    sender.send_response(Response::No).await.unwrap();
    drop(sender);

    let mut raw = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut far, &mut raw)
        .await
        .unwrap();
    assert_eq!(raw, b"GN");
}

#[tokio::test]
async fn test_bad_opcode() {
    let (near, mut far) = tokio::io::duplex(64);
    let mut receiver = Connection::new(near);

    far.write_all(b"X").await.unwrap();
    let result = receiver.recv_request().await;
    assert!(matches!(result, Err(Error::BadOpcode(b'X'))));
}

#[tokio::test]
async fn test_string_roundtrip() {
    let (near, far) = tokio::io::duplex(4096);
    let mut sender = Connection::new(near);
    let mut receiver = Connection::new(far);

    sender.send_string("some name").await.unwrap();
    let result = receiver.recv_string(512).await.unwrap();
    assert_eq!(result, "some name");
}

#[tokio::test]
async fn test_string_eof_mid_read() {
    let (near, mut far) = tokio::io::duplex(64);
    let mut receiver = Connection::new(near);

    // Announce ten bytes, deliver three, close.
    far.write_all(&10u16.to_be_bytes()).await.unwrap();
    far.write_all(b"abc").await.unwrap();
    drop(far);

    let result = receiver.recv_string(512).await;
    assert!(matches!(result, Err(Error::Io(_))));
}

#[tokio::test]
async fn test_listing_roundtrip() {
    let (near, far) = tokio::io::duplex(1 << 20);
    let mut sender = Connection::new(near);
    let mut receiver = Connection::new(far);

    let mut listing = Listing::new(PathBuf::from("/tmp/x"));
    listing
        .entries
        .push(entry("alpha", INFO_REGULAR | INFO_RUSR | INFO_WUSR, 42));
    listing
        .entries
        .push(entry("beta", INFO_DIRECTORY | INFO_RUSR, 0));
    let mut link = entry("gamma", INFO_SYMLINK | INFO_RUSR, 0);
    link.link_target = "alpha".to_owned();
    listing.entries.push(link);

    let send = tokio::spawn(async move {
        sender.send_listing(&listing).await.unwrap();
        sender
    });
    let received = receiver.recv_listing(PathBuf::from("/tmp/y")).await.unwrap();
    send.await.unwrap();

    assert_eq!(received.path, PathBuf::from("/tmp/y"));
    assert_eq!(received.entries.len(), 3);
    assert_eq!(received.entries[0].name, "alpha");
    assert_eq!(received.entries[0].size, 42);
    assert_eq!(received.entries[1].name, "beta");
    assert_eq!(received.entries[2].name, "gamma");
    assert_eq!(received.entries[2].link_target, "alpha");
    assert!(received.entries[2].children.is_none());
}

#[tokio::test]
async fn test_listing_name_overflow() {
    let (near, mut far) = tokio::io::duplex(4096);
    let mut receiver = Connection::new(near);

    far.write_all(&1u32.to_be_bytes()).await.unwrap();
    far.write_all(&[0u8; 32]).await.unwrap();
    far.write_all(&600u16.to_be_bytes()).await.unwrap();

    let result = receiver.recv_listing(PathBuf::from("/tmp")).await;
    assert!(matches!(result, Err(Error::StringOverflow { .. })));
}

#[tokio::test]
async fn test_body_roundtrip_split_sends() {
    let (near, far) = tokio::io::duplex(1 << 20);
    let mut sender = Connection::new(near);
    let mut receiver = Connection::new(far);

    // Larger than one send batch so the chunking path is exercised.
    let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let expected = body.clone();

    let send = tokio::spawn(async move {
        sender.send_body(&body).await.unwrap();
    });

    let mut buf = vec![0u8; expected.len()];
    receiver.recv_body(&mut buf).await.unwrap();
    send.await.unwrap();
    assert_eq!(buf, expected);
}
