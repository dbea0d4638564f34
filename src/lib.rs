//! A network-accessible bounded-memory file cache with a typed overlay for
//! tabular data (see `SPEC_FULL.md`). Clients issue commands over a
//! length-framed TCP protocol to get, set, append, and evict named blobs
//! keyed by hierarchical paths; the server maintains an in-memory working
//! set bounded by a configured byte budget, evicting by least-recently-used
//! while persisting every write durably to a backing directory.
//!
//! No CLI binary is built here — entry points, setup/packaging, and the
//! abandoned `explore/` reinforcement-learning prototypes are out of scope
//! (`spec.md` §1).
pub mod cache;
pub mod client;
pub mod config;
pub mod dataframe;
pub mod error;
pub mod future;
pub mod key;
pub mod server;
pub mod stats;
pub mod wire;

pub use cache::dataframe::DataFrameCache;
pub use cache::FileCache;
pub use config::{CacheConfig, PoolConfig, ServerConfig};
pub use error::{CacheError, Result};
pub use key::Key;
