//! Plain configuration structs. No config-file format is specified; callers
//! construct these directly or parse them from whatever their own CLI does
//! (CLI entry points are out of scope, see spec §1).
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root_path: PathBuf,
    pub max_memory_bytes: usize,
}

impl CacheConfig {
    pub fn new(root_path: impl Into<PathBuf>, max_memory_bytes: usize) -> Self {
        Self {
            root_path: root_path.into(),
            max_memory_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cache: CacheConfig,
}

impl ServerConfig {
    pub fn new(cache: CacheConfig) -> Self {
        Self { host: "127.0.0.1".into(), port: 8000, cache }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            max_connections: 8,
            max_retries: 3,
        }
    }
}
