//! A length-prefixed framing for serde records over stdin/stdout.
//!
//! Every record is a 4-byte little-endian length prefix followed by that
//! many bytes of MessagePack. There is no record-type tag on the wire: the
//! caller (the verb being invoked) determines which record type to decode,
//! matching the one-record-per-invocation shape of each verb's stdin/stdout
//! contract (see SPEC_FULL.md §4.10/§6).

mod record;

pub use record::*;

use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("empty record frame")]
    EmptyFrame,

    #[error("malformed record: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Read one length-prefixed record from `r`.
pub fn read<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, Error> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Err(Error::EmptyFrame);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(rmp_serde::from_slice(&buf)?)
}

/// Write one length-prefixed record to `w`, flushing afterward so the
/// reading end (the agent, or the next verb in a pipeline) sees it promptly.
pub fn write<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<(), Error> {
    let buf = rmp_serde::to_vec(value)?;
    let len = buf.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}
