//! Bounded connection pool with exponential-backoff reconnect (spec §4.4),
//! the Rust-native counterpart of `dfs/df_client.py::DataFrameConnectionPool`.
use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::info;

use crate::config::PoolConfig;
use crate::error::CacheError;
use crate::wire::{self, Command};

/// A pooled connection, checked out via [`ConnectionPool::acquire`] and
/// returned via [`ConnectionPool::release`] (or dropped by
/// [`crate::client::Client`] on scope exit).
pub struct PooledConnection {
    pub(crate) stream: TcpStream,
}

impl PooledConnection {
    /// Liveness probe: a non-zero `SO_ERROR` means the peer reset or
    /// otherwise broke the connection since it was last used (spec §4.4,
    /// "a socket-level `SO_ERROR` non-zero" check).
    fn is_healthy(&self) -> bool {
        matches!(self.stream.take_error(), Ok(None))
    }
}

struct Idle {
    connections: VecDeque<PooledConnection>,
}

/// Bounded pool of up to `max_connections` reusable TCP connections. A
/// counting semaphore gates acquisition; an idle FIFO is consulted first,
/// falling back to a freshly dialed connection on an empty pool or a dead
/// peer.
pub struct ConnectionPool {
    config: PoolConfig,
    semaphore: Semaphore,
    idle: Mutex<Idle>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        info!(max_connections = config.max_connections, "creating connection pool");
        let semaphore = Semaphore::new(config.max_connections);
        Self { config, semaphore, idle: Mutex::new(Idle { connections: VecDeque::new() }) }
    }

    /// Acquires a permit, then either reuses an idle connection or dials a
    /// fresh one with exponential-backoff retries (spec §4.4).
    pub async fn acquire(&self) -> Result<(PooledConnection, SemaphorePermit<'_>), CacheError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("pool semaphore is never closed");

        let reused = {
            let mut idle = self.idle.lock().expect("pool mutex poisoned");
            idle.connections.pop_front()
        };
        if let Some(conn) = reused {
            if conn.is_healthy() {
                return Ok((conn, permit));
            }
            info!("releasing closed connection");
        }

        let conn = self.dial().await?;
        Ok((conn, permit))
    }

    async fn dial(&self) -> Result<PooledConnection, CacheError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let mut attempt = 1u32;
        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    info!(attempt, "connection created");
                    return Ok(PooledConnection { stream });
                }
                Err(e) if attempt >= self.config.max_retries => {
                    return Err(CacheError::ConnectionError(format!(
                        "connection failed after {attempt} attempts: {e}"
                    )));
                }
                Err(_) => {
                    info!(attempt, "connection failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Returns a connection to the idle FIFO. The semaphore permit is
    /// released automatically when it is dropped by the caller.
    pub fn release(&self, connection: PooledConnection) {
        self.idle.lock().expect("pool mutex poisoned").connections.push_back(connection);
    }

    /// Drains the idle FIFO, sending a best-effort `close` to each
    /// connection before closing its socket (spec §4.4, "Shutdown").
    pub fn shutdown(&self) {
        let mut idle = self.idle.lock().expect("pool mutex poisoned");
        while let Some(mut conn) = idle.connections.pop_front() {
            let close = Command { name: "close".into(), key_path: vec![], range_start: None, range_end: None, range_type: None, level: None };
            if wire::send_frame(&mut conn.stream, &close.encode()).is_ok() {
                let _ = wire::recv_frame(&mut conn.stream);
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[tokio::test]
    async fn acquire_dials_when_idle_pool_is_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = std::thread::spawn(move || listener.accept().unwrap());

        let config = PoolConfig { host: addr.ip().to_string(), port: addr.port(), max_connections: 2, max_retries: 3 };
        let pool = ConnectionPool::new(config);
        let (conn, permit) = pool.acquire().await.unwrap();
        accept.join().unwrap();
        drop(permit);
        pool.release(conn);
    }

    #[tokio::test]
    async fn acquire_blocks_when_saturated() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || loop {
            if listener.accept().is_err() {
                break;
            }
        });

        let config = PoolConfig { host: addr.ip().to_string(), port: addr.port(), max_connections: 1, max_retries: 3 };
        let pool = ConnectionPool::new(config);
        let (conn, permit) = pool.acquire().await.unwrap();

        let available = pool.semaphore.try_acquire();
        assert!(available.is_err());

        drop(permit);
        pool.release(conn);
        assert!(pool.semaphore.try_acquire().is_ok());
    }
}
