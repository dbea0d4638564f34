//! Typed client wrappers over a pooled connection (spec §4.4), the
//! Rust-native counterpart of `dfs/df_client.py::DataFrameClient`.
pub mod pool;

use tokio::sync::SemaphorePermit;

use crate::dataframe::TabularValue;
use crate::error::CacheError;
use crate::key::Key;
use crate::wire::{self, Command, StatusEnvelope};
use pool::{ConnectionPool, PooledConnection};

fn io_err(e: std::io::Error) -> CacheError {
    CacheError::ConnectionError(e.to_string())
}

fn key_command(name: &str, key: &Key) -> Command {
    Command { name: name.into(), key_path: key.segments().to_vec(), range_start: None, range_end: None, range_type: None, level: None }
}

/// An acquired connection plus the command surface the original exposed on
/// `DataFrameClient`. Releases its connection back to the pool on `Drop`
/// (the original's context-manager `__exit__`), unless [`Client::close`]
/// already consumed it.
pub struct Client<'pool> {
    pool: &'pool ConnectionPool,
    connection: Option<PooledConnection>,
    _permit: SemaphorePermit<'pool>,
}

impl<'pool> Client<'pool> {
    pub async fn acquire(pool: &'pool ConnectionPool) -> Result<Self, CacheError> {
        let (connection, permit) = pool.acquire().await?;
        Ok(Self { pool, connection: Some(connection), _permit: permit })
    }

    fn stream(&mut self) -> &mut std::net::TcpStream {
        &mut self.connection.as_mut().expect("connection already closed").stream
    }

    fn send_command(&mut self, command: &Command) -> Result<(), CacheError> {
        wire::send_frame(self.stream(), &command.encode()).map_err(io_err)
    }

    fn recv_status(&mut self) -> Result<(), CacheError> {
        let frame = wire::recv_frame(self.stream())
            .map_err(io_err)?
            .ok_or_else(|| CacheError::ConnectionError("connection closed awaiting status".into()))?;
        let status: StatusEnvelope = serde_json::from_slice(&frame)
            .map_err(|e| CacheError::ProtocolError(format!("malformed status envelope: {e}")))?;
        if status.success {
            Ok(())
        } else {
            Err(CacheError::Remote(status.err.unwrap_or_default()))
        }
    }

    fn recv_body(&mut self) -> Result<Vec<u8>, CacheError> {
        wire::recv_frame(self.stream())
            .map_err(io_err)?
            .ok_or_else(|| CacheError::ConnectionError("connection closed awaiting body".into()))
    }

    fn recv_json(&mut self) -> Result<serde_json::Value, CacheError> {
        let frame = self.recv_body()?;
        serde_json::from_slice(&frame).map_err(|e| CacheError::ProtocolError(format!("malformed json: {e}")))
    }

    /// `get` and `load` share a single response frame that is a raw body on
    /// success but a `StatusEnvelope` on failure (spec §7: `NotFound`/
    /// `LoadError` are reported as failure envelopes, not a dropped
    /// connection). Since there is no separate status frame to read first,
    /// peek the frame as a `StatusEnvelope` and surface it as `Remote` when
    /// it parses with `success: false`; anything else is the real body.
    fn body_or_remote_error(body: Vec<u8>) -> Result<Vec<u8>, CacheError> {
        match serde_json::from_slice::<StatusEnvelope>(&body) {
            Ok(status) if !status.success => Err(CacheError::Remote(status.err.unwrap_or_default())),
            _ => Ok(body),
        }
    }

    /// `get` (opaque).
    pub fn get_file(&mut self, key: &Key) -> Result<Vec<u8>, CacheError> {
        self.send_command(&key_command("get", key))?;
        let body = self.recv_body()?;
        Self::body_or_remote_error(body)
    }

    /// `set` (opaque).
    pub fn set_file(&mut self, key: &Key, data: Vec<u8>) -> Result<(), CacheError> {
        self.send_command(&key_command("set", key))?;
        wire::send_frame(self.stream(), &data).map_err(io_err)?;
        self.recv_status()
    }

    /// `load`: warms the server-side cache without transferring the body,
    /// returning its byte length.
    pub fn load(&mut self, key: &Key) -> Result<u64, CacheError> {
        self.send_command(&key_command("load", key))?;
        let frame = self.recv_body()?;
        let frame = Self::body_or_remote_error(frame)?;
        let value: serde_json::Value = serde_json::from_slice(&frame)
            .map_err(|e| CacheError::ProtocolError(format!("malformed json: {e}")))?;
        value
            .get("length")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CacheError::ProtocolError("load response missing length".into()))
    }

    pub fn unload(&mut self, key: &Key) -> Result<(), CacheError> {
        self.send_command(&key_command("unload", key))?;
        self.recv_status()
    }

    /// `df:update` — merges `incremental` into the server's cached value.
    pub fn append(&mut self, key: &Key, incremental: &TabularValue) -> Result<(), CacheError> {
        self.send_command(&key_command("df:update", key))?;
        let encoded = incremental.encode()?;
        wire::send_frame(self.stream(), &encoded).map_err(io_err)?;
        self.recv_status()
    }

    /// `df:filter`.
    pub fn get_dataframe(
        &mut self,
        key: &Key,
        range_start: Option<i64>,
        range_end: Option<i64>,
        range_type: Option<&str>,
    ) -> Result<Option<TabularValue>, CacheError> {
        let command = Command {
            name: "df:filter".into(),
            key_path: key.segments().to_vec(),
            range_start,
            range_end,
            range_type: range_type.map(|s| s.to_string()),
            level: None,
        };
        self.send_command(&command)?;
        let body = self.recv_body()?;
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(TabularValue::decode(&body)?))
        }
    }

    pub fn stats(&mut self, level: u8) -> Result<serde_json::Value, CacheError> {
        let command = Command { name: "stats".into(), key_path: vec![], range_start: None, range_end: None, range_type: None, level: Some(level) };
        self.send_command(&command)?;
        self.recv_json()
    }

    /// Proactively tells the server to close the connection and consumes
    /// `self` without returning the socket to the pool.
    pub fn close(mut self) -> Result<(), CacheError> {
        let command = Command { name: "close".into(), key_path: vec![], range_start: None, range_end: None, range_type: None, level: None };
        self.send_command(&command)?;
        self.recv_status()?;
        self.connection.take();
        Ok(())
    }
}

impl Drop for Client<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
