use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Discovery wire format version. Datagrams carrying a different version
/// are dropped on the floor.
pub const DISCOVERY_VERSION: u16 = 1;

/// Cluster-unique node name. Configured by the operator or generated from a
/// UUID at boot; endpoints and pool slots key on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn generated() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// A member of the cluster. The node runtime only reads these records;
/// discovery owns them. Liveness is not stored: a node is alive while its
/// announcements keep refreshing `touched_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    /// UDP address the discovery protocol reaches this node at.
    pub addr: SocketAddr,
    pub http_port: u16,
    pub binary_port: u16,
    pub region: i32,

    /// When this node was last heard from, local clock only.
    #[serde(skip)]
    pub touched_at: Option<Instant>,
}

impl Node {
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.http_port)
    }

    pub fn binary_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.binary_port)
    }
}

/// One-byte message type prefixing every datagram.
pub const MSG_HELLO: u8 = 0;
pub const MSG_ROSTER: u8 = 1;
pub const MSG_ANNOUNCE: u8 = 2;
/// Ceiling: any type at or above this is rejected.
pub const MAX_TYPE: u8 = 3;

/// Discovery payloads, bincode-encoded after the `[type][version]` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// A booting node introducing itself to a seed.
    Hello { node: Node },

    /// Reply to a Hello: everyone the responder currently knows, so a
    /// joiner converges in one round trip.
    Roster { members: Vec<Node> },

    /// Periodic ownership heartbeat: the sender's record plus the full set
    /// of index paths it holds. `seq` orders reordered datagrams; a fresh
    /// announcement is also what keeps the sender alive.
    Announce {
        node: Node,
        seq: u64,
        holds: Vec<String>,
    },
}

impl DiscoveryMessage {
    pub fn type_byte(&self) -> u8 {
        match self {
            DiscoveryMessage::Hello { .. } => MSG_HELLO,
            DiscoveryMessage::Roster { .. } => MSG_ROSTER,
            DiscoveryMessage::Announce { .. } => MSG_ANNOUNCE,
        }
    }
}
