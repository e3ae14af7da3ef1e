//! Peers-file loading (C8).
//!
//! The file is a JSON object mapping stringified node ids to `{ip, port}`.
//! Loading happens exactly once, at startup; the resulting [`PeerTable`] is
//! immutable for the lifetime of the process.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Address of a single peer, as written in the peers file.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerAddress {
    pub ip: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn to_socket_addr(&self, id: u32) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| Error::UnknownPeer(id))
    }
}

/// Immutable `node_id -> address` mapping, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: HashMap<u32, PeerAddress>,
}

impl PeerTable {
    /// Load and validate a peers file, failing fast (§7) if it is missing,
    /// malformed, or does not contain `self_id`.
    pub fn load(path: &Path, self_id: u32) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|_| Error::PeersFileMissing {
            path: path.display().to_string(),
        })?;

        let parsed: HashMap<String, PeerAddress> =
            serde_json::from_str(&raw).map_err(|source| Error::PeersFileMalformed {
                path: path.display().to_string(),
                source,
            })?;

        let peers: HashMap<u32, PeerAddress> = parsed
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (id, v)))
            .collect();

        if !peers.contains_key(&self_id) {
            return Err(Error::UnknownSelfId(self_id));
        }

        Ok(Self { peers })
    }

    pub fn get(&self, id: u32) -> Option<&PeerAddress> {
        self.peers.get(&id)
    }

    /// All peer ids other than `self_id`.
    pub fn others(&self, self_id: u32) -> impl Iterator<Item = u32> + '_ {
        self.peers.keys().copied().filter(move |id| *id != self_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.peers.contains_key(&id)
    }
}
