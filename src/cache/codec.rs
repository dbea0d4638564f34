//! The `process_contents` extension point (spec §4.1), expressed as a trait
//! rather than a subclass hook since Rust has no inheritance. `OpaqueCodec`
//! is the cache's default identity behavior; `TabularCodec`
//! (`src/cache/dataframe.rs`) is the overlay's override.
use crate::error::CacheError;

/// Decides how raw bytes become an in-memory value, how much memory that
/// value costs against the budget, and which filesystem suffix its
/// namespace uses (spec §3, "an implementation-chosen suffix per
/// namespace").
pub trait Codec: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    const SUFFIX: &'static str;

    /// Decodes `bytes` into a value and reports its in-memory footprint.
    /// For opaque blobs the footprint is the byte length; tabular blobs
    /// report the deep memory footprint of the decoded structure.
    fn decode(bytes: &[u8]) -> Result<(Self::Value, usize), CacheError>;

    fn encode(value: &Self::Value) -> Result<Vec<u8>, CacheError>;
}

/// The base, no-op codec: `process_contents(bytes) = (bytes, len(bytes))`.
pub struct OpaqueCodec;

impl Codec for OpaqueCodec {
    type Value = Vec<u8>;

    const SUFFIX: &'static str = "";

    fn decode(bytes: &[u8]) -> Result<(Self::Value, usize), CacheError> {
        Ok((bytes.to_vec(), bytes.len()))
    }

    fn encode(value: &Self::Value) -> Result<Vec<u8>, CacheError> {
        Ok(value.clone())
    }
}
