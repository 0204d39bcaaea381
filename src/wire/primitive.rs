//! Primitive wire data type encode/decode utilities.
//!
//! All integers travel in big-endian (network) byte order. Strings are
//! length-prefixed with a 16-bit length and carry no terminator; the
//! receiver appends its own.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{EntryDesc, Error, Result};

/// Parses a `u8` from the `Read` source.
pub fn get_u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(Error::Io)
}

/// Parses a `u16` from the `Read` source, in big-endian format.
pub fn get_u16(src: &mut impl Read) -> Result<u16> {
    src.read_u16::<BigEndian>().map_err(Error::Io)
}

/// Parses a `u32` from the `Read` source, in big-endian format.
pub fn get_u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(Error::Io)
}

/// Parses a `u64` from the `Read` source, in big-endian format.
pub fn get_u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(Error::Io)
}

/// Parses an `i64` from the `Read` source, in big-endian format.
pub fn get_i64(src: &mut impl Read) -> Result<i64> {
    src.read_i64::<BigEndian>().map_err(Error::Io)
}

/// Serializes a `u8`.
pub fn put_u8(dest: &mut impl Write, value: u8) -> Result<()> {
    dest.write_u8(value).map_err(Error::Io)
}

/// Serializes a `u16` in big-endian format.
pub fn put_u16(dest: &mut impl Write, value: u16) -> Result<()> {
    dest.write_u16::<BigEndian>(value).map_err(Error::Io)
}

/// Serializes a `u32` in big-endian format.
pub fn put_u32(dest: &mut impl Write, value: u32) -> Result<()> {
    dest.write_u32::<BigEndian>(value).map_err(Error::Io)
}

/// Serializes a `u64` in big-endian format.
pub fn put_u64(dest: &mut impl Write, value: u64) -> Result<()> {
    dest.write_u64::<BigEndian>(value).map_err(Error::Io)
}

/// Serializes an `i64` in big-endian format.
pub fn put_i64(dest: &mut impl Write, value: i64) -> Result<()> {
    dest.write_i64::<BigEndian>(value).map_err(Error::Io)
}

/// Parses a length-prefixed byte string with a maximum allowed size.
pub fn get_bytes(src: &mut impl Read, limit: usize) -> Result<Vec<u8>> {
    let length = get_u16(src)? as usize;
    if length >= limit {
        return Err(Error::StringOverflow { length, limit });
    }
    let mut vec = vec![0u8; length];
    src.read_exact(vec.as_mut_slice()).map_err(Error::Io)?;
    Ok(vec)
}

/// Parses a length-prefixed UTF-8 string with a maximum allowed size.
pub fn get_string(src: &mut impl Read, limit: usize) -> Result<String> {
    String::from_utf8(get_bytes(src, limit)?).map_err(Error::BadString)
}

/// Serializes a length-prefixed byte string. No terminator goes on the
/// wire.
pub fn put_bytes(dest: &mut impl Write, bytes: &[u8]) -> Result<()> {
    let length = u16::try_from(bytes.len()).map_err(|_| Error::StringOverflow {
        length: bytes.len(),
        limit: u16::MAX as usize,
    })?;
    put_u16(dest, length)?;
    dest.write_all(bytes).map_err(Error::Io)
}

/// Parses the fixed 32-byte descriptor that precedes each entry name.
pub fn get_entry_desc(src: &mut impl Read) -> Result<EntryDesc> {
    Ok(EntryDesc {
        size: get_u64(src)?,
        info: get_u64(src)?,
        mtime: get_i64(src)?,
        ksum: get_u64(src)?,
    })
}

/// Serializes the fixed 32-byte entry descriptor.
pub fn put_entry_desc(dest: &mut impl Write, desc: &EntryDesc) -> Result<()> {
    put_u64(dest, desc.size)?;
    put_u64(dest, desc.info)?;
    put_i64(dest, desc.mtime)?;
    put_u64(dest, desc.ksum)
}
