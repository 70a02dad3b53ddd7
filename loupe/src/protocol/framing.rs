//! Length-prefixed message framing
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────┐
//! │ length (u32, LE)     │ bincode payload (length bytes)   │
//! └──────────────────────┴──────────────────────────────────┘
//! ```
//!
//! End of input exactly at a message boundary is the normal end of a stream. End
//! of input anywhere else is a truncated message.

use serde::{de::DeserializeOwned, Serialize};
use std::io::{ErrorKind, Read, Write};

use crate::domain::FrameError;
use loupe_common::{LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE};

/// Encode `message` and write it with its length prefix.
///
/// Returns the number of bytes written, prefix included.
///
/// # Errors
/// Returns an error if encoding or writing fails, or if the payload exceeds
/// [`MAX_MESSAGE_SIZE`]
pub fn write_message<W: Write, T: Serialize + ?Sized>(
    writer: &mut W,
    message: &T,
) -> Result<usize, FrameError> {
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_MESSAGE_SIZE)
        .ok_or(FrameError::TooLarge(payload.len(), MAX_MESSAGE_SIZE))?;

    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(LENGTH_PREFIX_SIZE + payload.len())
}

/// Read and decode the next message.
///
/// Returns `Ok(None)` at a clean end of stream.
///
/// # Errors
/// Returns an error if the stream ends inside a message, the declared length is
/// too large, or the payload does not decode to exactly one `T`
pub fn read_message<R: Read, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, FrameError> {
    let Some(length) = read_length_prefix(reader)? else {
        return Ok(None);
    };
    if length > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(length, MAX_MESSAGE_SIZE));
    }

    // Bounded by what is actually in the stream, not by the declared length
    let mut payload = Vec::new();
    reader.by_ref().take(length as u64).read_to_end(&mut payload)?;
    if payload.len() < length {
        return Err(FrameError::Truncated { expected: length, actual: payload.len() });
    }

    let (message, consumed) =
        bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
    if consumed != payload.len() {
        return Err(FrameError::TrailingBytes(payload.len() - consumed));
    }
    Ok(Some(message))
}

fn read_length_prefix<R: Read>(reader: &mut R) -> Result<Option<usize>, FrameError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    match filled {
        0 => Ok(None),
        LENGTH_PREFIX_SIZE => Ok(Some(u32::from_le_bytes(prefix) as usize)),
        actual => Err(FrameError::Truncated { expected: LENGTH_PREFIX_SIZE, actual }),
    }
}
