use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid cache magic")]
    InvalidMagic,

    #[error("unsupported cache version {0}")]
    UnsupportedVersion(u32),

    #[error("feature flags mismatch (cache {cached:#x}, host {host:#x})")]
    FeatureMismatch { cached: u64, host: u64 },

    #[error("payload digest mismatch")]
    DigestMismatch,

    #[error("corrupt cache: {0}")]
    Corrupt(&'static str),

    /// A `Symbol` with kind `None` carries no payload; reading its value is a
    /// caller error, not a recoverable decode failure.
    #[error("relocation symbol carries no payload")]
    EmptySymbol,

    #[error("unexpected relocation symbol kind {0}")]
    UnexpectedSymbol(u8),

    #[error("delegate table has no entry for index {0}")]
    DelegateLookupMiss(u64),

    #[error("segment cursors not exhausted after materialization")]
    SegmentCursorMismatch,

    #[error("translation failed at {address:#x}: {reason}")]
    Translate { address: u64, reason: String },

    #[error("executable mapping failed: {0}")]
    Map(String),

    #[error("worker pool: {0}")]
    WorkerPool(String),
}
