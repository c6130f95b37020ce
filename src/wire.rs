//! Socket framing for [`crate::protocol::Command`]/[`crate::protocol::Reply`].
//!
//! Each frame is a 4-byte big-endian length prefix followed by that many
//! bytes of JSON. A session is one command frame in, one reply frame out,
//! synchronously -- matching `protocol`'s doc comment on how this layer is
//! meant to be driven from a real socket.

use std::io::{Read, Write};

use anyhow::{bail, Context as _, Error};
use serde::{de::DeserializeOwned, Serialize};

/// Frames larger than this are rejected before any allocation happens, so
/// a corrupt or hostile length prefix can't be used to exhaust memory.
pub const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub fn write_frame<W: Write, T: Serialize>(mut w: W, value: &T) -> Result<(), Error> {
    let body = serde_json::to_vec(value).context("encoding frame body")?;
    if body.len() > MAX_FRAME_BYTES as usize {
        bail!("frame of {} bytes exceeds the {} byte limit", body.len(), MAX_FRAME_BYTES);
    }
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(mut r: R) -> Result<T, Error> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).context("reading frame length")?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        bail!("incoming frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_BYTES);
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).context("reading frame body")?;
    serde_json::from_slice(&body).context("decoding frame body")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, LoginFlags};

    #[test]
    fn round_trips_a_command_through_a_frame() {
        let cmd = Command::Login { account_id: 7, flags: LoginFlags::READ_ONLY };
        let mut buf = Vec::new();
        write_frame(&mut buf, &cmd).unwrap();

        let decoded: Command = read_frame(&buf[..]).unwrap();
        match decoded {
            Command::Login { account_id, flags } => {
                assert_eq!(account_id, 7);
                assert_eq!(flags, LoginFlags::READ_ONLY);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_a_length_prefix_over_the_cap() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let result: Result<Command, Error> = read_frame(&buf[..]);
        assert!(result.is_err());
    }
}
