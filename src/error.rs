use thiserror::Error;

/// Errors surfaced by the node's core engine.
///
/// Variants are split along the fatal/recoverable boundary described in the
/// design doc: anything reachable from [`crate::config`] is fatal at startup,
/// everything else is local to a single peer and handled in place.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("frame exceeds maximum length ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("peers file `{path}` not found")]
    PeersFileMissing { path: String },

    #[error("peers file `{path}` is not valid JSON: {source}")]
    PeersFileMalformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("node id {0} is not present in the peers file")]
    UnknownSelfId(u32),

    #[error("connection to node {0} timed out")]
    ConnectTimeout(u32),

    #[error("node {0} is not a known peer")]
    UnknownPeer(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
