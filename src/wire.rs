//! Length-framed wire protocol shared by the server and the client pool.
//!
//! Every message on the wire is a 4-byte big-endian length prefix followed
//! by that many bytes of payload (spec §6, "Wire protocol"). Command
//! messages carry a JSON header; `df:update`/`set` carry an additional raw
//! body frame; responses are a JSON status envelope, optionally followed by
//! a binary body frame.
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CacheError;
use crate::key::Key;

/// Reads one framed message: a 4-byte big-endian length, then that many
/// payload bytes. Returns `Ok(None)` on a clean EOF at a frame boundary,
/// mirroring the original's `recv_msg` returning `None` on a closed socket.
pub fn recv_frame(stream: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(stream, &mut len_buf)? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 && !read_exact_or_eof(stream, &mut payload)? {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Writes one framed message.
pub fn send_frame(stream: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Like `Read::read_exact`, but reports a clean EOF at the start of the read
/// (no bytes consumed yet) as `Ok(false)` instead of an error, and a partial
/// read followed by EOF as `UnexpectedEof`.
fn read_exact_or_eof(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// One decoded command header (spec §6, "Command messages").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub key_path: Vec<String>,
    #[serde(default)]
    pub range_start: Option<i64>,
    #[serde(default)]
    pub range_end: Option<i64>,
    #[serde(default)]
    pub range_type: Option<String>,
    #[serde(default)]
    pub level: Option<u8>,
}

impl Command {
    pub fn key(&self) -> Result<Key, CacheError> {
        Key::new(self.key_path.clone())
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Command serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CacheError::ProtocolError(format!("malformed command: {e}")))
    }
}

/// The `{success, err?}` status envelope sent after every command other than
/// `load`/`stats`, which reply with their own JSON body instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl StatusEnvelope {
    pub fn ok() -> Self {
        Self { success: true, err: None }
    }

    pub fn failure(err: impl std::fmt::Display) -> Self {
        Self { success: false, err: Some(err.to_string()) }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("StatusEnvelope serializes")
    }
}

/// Sends a bare JSON value as a single frame, used for `load`'s
/// `{"length": N}` reply and for `stats`.
pub fn send_json(stream: &mut impl Write, value: &Value) -> io::Result<()> {
    let bytes = serde_json::to_vec(value).expect("Value serializes");
    send_frame(stream, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        let got = recv_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn empty_frame_is_some_empty_vec() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"").unwrap();
        let mut cursor = Cursor::new(buf);
        let got = recv_frame(&mut cursor).unwrap().unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn eof_at_boundary_is_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(recv_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn command_round_trips_through_json() {
        let cmd = Command {
            name: "df:filter".into(),
            key_path: vec!["a".into(), "b".into()],
            range_start: Some(1),
            range_end: None,
            range_type: Some("timestamp".into()),
            level: None,
        };
        let bytes = cmd.encode();
        let back = Command::decode(&bytes).unwrap();
        assert_eq!(back.name, "df:filter");
        assert_eq!(back.key_path, vec!["a", "b"]);
        assert_eq!(back.range_start, Some(1));
    }
}
