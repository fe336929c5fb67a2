//! Endpoints
//!
//! An `Endpoint` is a fully qualified reference to an index shard on a
//! specific node. Two endpoints are the same shard iff they agree on
//! `(node_name, path)`; scheme, port and mastery level do not participate
//! in identity. `EndpointSet` keeps a deterministic iteration order so that
//! request routing and replication fan-out are stable across nodes.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

pub const DEFAULT_SCHEME: &str = "search";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Index path, always with a leading slash.
    pub path: String,
    pub node_name: String,
    pub mastery_level: i32,
}

impl Endpoint {
    pub fn new(node_name: &str, host: &str, port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: host.to_string(),
            port,
            path,
            node_name: node_name.to_string(),
            mastery_level: -1,
        }
    }

    /// Endpoint for an index held by the local node.
    pub fn local(node_name: &str, path: &str) -> Self {
        Self::new(node_name, "127.0.0.1", 0, path)
    }

    pub fn as_url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.node_name == other.node_name && self.path == other.path
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_name.hash(state);
        self.path.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.node_name, &self.path).cmp(&(&other.node_name, &other.path))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_name, self.path)
    }
}

/// Ordered set of endpoints a request is routed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSet {
    endpoints: BTreeSet<Endpoint>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(endpoint: Endpoint) -> Self {
        let mut set = Self::new();
        set.insert(endpoint);
        set
    }

    pub fn insert(&mut self, endpoint: Endpoint) {
        self.endpoints.insert(endpoint);
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn first(&self) -> Option<&Endpoint> {
        self.endpoints.iter().next()
    }

    /// Stable identity string, used as the key for pool slots and
    /// write-intent locks.
    pub fn key(&self) -> String {
        let parts: Vec<String> = self.endpoints.iter().map(|e| e.to_string()).collect();
        parts.join(";")
    }
}

impl fmt::Display for EndpointSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromIterator<Endpoint> for EndpointSet {
    fn from_iter<T: IntoIterator<Item = Endpoint>>(iter: T) -> Self {
        Self {
            endpoints: iter.into_iter().collect(),
        }
    }
}
