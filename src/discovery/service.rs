use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::info;

use super::types::{DISCOVERY_VERSION, DiscoveryMessage, MAX_TYPE, Node, NodeName};

/// Announcement heartbeat period. An announcement is both the ownership
/// update and the liveness signal.
const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(1000);
/// A peer whose announcements stop for this long leaves resolution.
const STALE_TIMEOUT: Duration = Duration::from_secs(5);
/// A peer silent for this long is forgotten entirely.
const EVICT_TIMEOUT: Duration = Duration::from_secs(15);
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// What we know about one peer: its record, the ordering counter of its
/// last announcement, and the index paths that announcement claimed.
struct Member {
    node: Node,
    seq: u64,
    holds: HashSet<String>,
}

pub struct DiscoveryService {
    pub local_node: Node,
    members: DashMap<NodeName, Member>,
    /// Index paths this node holds and announces.
    held: std::sync::RwLock<HashSet<String>>,
    /// Woken whenever any holder set changes, so resolver timeouts wait for
    /// convergence instead of polling.
    index_updates: Notify,
    socket: Arc<UdpSocket>,
    seq: AtomicU64,
}

fn encode_datagram(msg: &DiscoveryMessage) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    let mut buf = Vec::with_capacity(3 + payload.len());
    buf.push(msg.type_byte());
    buf.extend_from_slice(&DISCOVERY_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_datagram(buf: &[u8]) -> Result<DiscoveryMessage> {
    if buf.len() < 3 {
        anyhow::bail!("short datagram ({} bytes)", buf.len());
    }
    let type_byte = buf[0];
    if type_byte >= MAX_TYPE {
        anyhow::bail!("datagram type {} out of range", type_byte);
    }
    let version = u16::from_le_bytes([buf[1], buf[2]]);
    if version != DISCOVERY_VERSION {
        anyhow::bail!("datagram version {} != {}", version, DISCOVERY_VERSION);
    }
    let msg: DiscoveryMessage = bincode::deserialize(&buf[3..])?;
    if msg.type_byte() != type_byte {
        anyhow::bail!("datagram type byte disagrees with payload");
    }
    Ok(msg)
}

fn is_fresh(node: &Node) -> bool {
    node.touched_at
        .map(|at| at.elapsed() < STALE_TIMEOUT)
        .unwrap_or(false)
}

impl DiscoveryService {
    pub async fn new(
        name: NodeName,
        bind_addr: SocketAddr,
        http_port: u16,
        binary_port: u16,
        region: i32,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let bound = socket.local_addr()?;
        let local_node = Node {
            name,
            addr: bound,
            http_port,
            binary_port,
            region,
            touched_at: Some(Instant::now()),
        };

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());
            let hello = DiscoveryMessage::Hello {
                node: local_node.clone(),
            };
            let encoded = encode_datagram(&hello)?;
            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent hello to {}", seed_node);
            }
        }

        Ok(Arc::new(Self {
            local_node,
            members: DashMap::new(),
            held: std::sync::RwLock::new(HashSet::new()),
            index_updates: Notify::new(),
            socket: Arc::new(socket),
            seq: AtomicU64::new(0),
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting discovery service...");

        let service = self.clone();
        tokio::spawn(async move {
            service.announce_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.receive_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.sweep_loop().await;
        });

        tracing::info!("All discovery background tasks started");
    }

    // ── Cluster view ─────────────────────────────────────────────────────

    /// The local node plus every peer whose announcements are current.
    pub fn get_alive_members(&self) -> Vec<Node> {
        let mut alive = vec![self.local_node.clone()];
        alive.extend(
            self.members
                .iter()
                .filter(|entry| is_fresh(&entry.value().node))
                .map(|entry| entry.value().node.clone()),
        );
        alive
    }

    pub fn get_member(&self, name: &NodeName) -> Option<Node> {
        if *name == self.local_node.name {
            return Some(self.local_node.clone());
        }
        self.members.get(name).map(|entry| entry.value().node.clone())
    }

    pub fn is_single_node(&self) -> bool {
        !self.members.iter().any(|entry| is_fresh(&entry.value().node))
    }

    /// Refresh a node's touched-at timestamp and return its record, or
    /// `None` when the name is unknown.
    pub fn touch_node(&self, name: &NodeName) -> Option<Node> {
        if *name == self.local_node.name {
            return Some(self.local_node.clone());
        }
        let mut entry = self.members.get_mut(name)?;
        entry.node.touched_at = Some(Instant::now());
        Some(entry.node.clone())
    }

    // ── Index ownership ──────────────────────────────────────────────────

    /// Record that `holder` has the index at `path`. Called for the local
    /// node when the pool spawns an index; peer ownership normally arrives
    /// through announcements.
    pub fn announce_index(&self, holder: NodeName, path: &str) {
        if holder == self.local_node.name {
            if let Ok(mut held) = self.held.write() {
                held.insert(path.to_string());
            }
        } else if let Some(mut member) = self.members.get_mut(&holder) {
            member.holds.insert(path.to_string());
        } else {
            tracing::debug!("Ignoring index claim from unknown node {:?}", holder);
            return;
        }
        self.index_updates.notify_waiters();
    }

    /// Claim `path` locally and push an immediate announcement so peers
    /// learn about it ahead of the next heartbeat.
    pub async fn broadcast_index(&self, path: &str) {
        self.announce_index(self.local_node.name.clone(), path);
        self.send_announcement().await;
    }

    /// Alive holders of the index at `path`, waiting up to `timeout` for
    /// the cluster view to converge when nothing is known yet.
    pub async fn resolve_index(&self, path: &str, timeout: Duration) -> Vec<Node> {
        let deadline = Instant::now() + timeout;
        loop {
            let holders = self.known_holders(path);
            if !holders.is_empty() {
                return holders;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            if tokio::time::timeout(remaining, self.index_updates.notified())
                .await
                .is_err()
            {
                return self.known_holders(path);
            }
        }
    }

    fn known_holders(&self, path: &str) -> Vec<Node> {
        let mut holders = Vec::new();
        let locally_held = self
            .held
            .read()
            .map(|held| held.contains(path))
            .unwrap_or(false);
        if locally_held {
            holders.push(self.local_node.clone());
        }
        holders.extend(
            self.members
                .iter()
                .filter(|entry| {
                    entry.value().holds.contains(path) && is_fresh(&entry.value().node)
                })
                .map(|entry| entry.value().node.clone()),
        );
        holders
    }

    // ── Protocol loops ───────────────────────────────────────────────────

    async fn announce_loop(self: Arc<Self>) {
        loop {
            // Jitter keeps a restarted cluster from announcing in lockstep.
            let jitter = Duration::from_millis(rand::random::<u64>() % 100);
            tokio::time::sleep(ANNOUNCE_INTERVAL + jitter).await;
            self.send_announcement().await;
        }
    }

    async fn send_announcement(&self) {
        let peers: Vec<SocketAddr> = self
            .members
            .iter()
            .map(|entry| entry.value().node.addr)
            .collect();
        if peers.is_empty() {
            return;
        }

        let holds: Vec<String> = self
            .held
            .read()
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default();
        let msg = DiscoveryMessage::Announce {
            node: self.local_node.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            holds,
        };

        let encoded = match encode_datagram(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to encode announcement: {}", e);
                return;
            }
        };
        for addr in peers {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to announce to {}: {}", addr, e);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match decode_datagram(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping datagram from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: DiscoveryMessage, src: SocketAddr) -> Result<()> {
        match msg {
            DiscoveryMessage::Hello { node } => self.handle_hello(node, src).await,
            DiscoveryMessage::Roster { members } => {
                self.handle_roster(members);
                Ok(())
            }
            DiscoveryMessage::Announce { node, seq, holds } => {
                self.handle_announce(node, seq, holds);
                Ok(())
            }
        }
    }

    /// A joiner introduced itself: remember it and send back everyone we
    /// know so it converges in one round trip.
    async fn handle_hello(&self, mut node: Node, src: SocketAddr) -> Result<()> {
        if node.name == self.local_node.name {
            return Ok(());
        }
        info!("Node {:?} joining cluster at {}", node.name, node.addr);
        node.touched_at = Some(Instant::now());
        match self.members.entry(node.name.clone()) {
            dashmap::Entry::Occupied(mut occupied) => {
                occupied.get_mut().node = node;
            }
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(Member {
                    node,
                    seq: 0,
                    holds: HashSet::new(),
                });
            }
        }

        let mut roster = vec![self.local_node.clone()];
        roster.extend(self.members.iter().map(|entry| entry.value().node.clone()));
        let reply = encode_datagram(&DiscoveryMessage::Roster { members: roster })?;
        self.socket.send_to(&reply, src).await?;
        Ok(())
    }

    /// A roster only introduces names and addresses; each peer proves
    /// itself alive (and states what it holds) with its own announcements.
    fn handle_roster(&self, members: Vec<Node>) {
        for node in members {
            if node.name == self.local_node.name || self.members.contains_key(&node.name) {
                continue;
            }
            tracing::info!("Discovered member {:?} at {}", node.name, node.addr);
            self.members.insert(
                node.name.clone(),
                Member {
                    node,
                    seq: 0,
                    holds: HashSet::new(),
                },
            );
        }
    }

    /// The ownership heartbeat. The newest announcement wins; anything
    /// reordered below the last seen `seq` is dropped.
    fn handle_announce(&self, mut node: Node, seq: u64, holds: Vec<String>) {
        if node.name == self.local_node.name {
            return;
        }
        node.touched_at = Some(Instant::now());
        let name = node.name.clone();

        match self.members.get_mut(&name) {
            Some(mut member) => {
                if seq < member.seq {
                    tracing::trace!("Stale announcement from {:?} ({} < {})", name, seq, member.seq);
                    return;
                }
                member.node = node;
                member.seq = seq;
                member.holds = holds.into_iter().collect();
            }
            None => {
                tracing::info!("Discovered member {:?} via announcement", name);
                self.members.insert(
                    name,
                    Member {
                        node,
                        seq,
                        holds: holds.into_iter().collect(),
                    },
                );
            }
        }
        self.index_updates.notify_waiters();
    }

    /// Forget peers that have been silent past the eviction window. Peers
    /// between stale and evicted stay known (so a late announcement
    /// revives them) but resolve nothing.
    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.members.retain(|name, member| {
                let silent_for = member
                    .node
                    .touched_at
                    .map(|at| at.elapsed())
                    .unwrap_or(EVICT_TIMEOUT);
                if silent_for >= EVICT_TIMEOUT {
                    tracing::warn!("Evicting silent node {:?} ({:?})", name, silent_for);
                    false
                } else {
                    true
                }
            });
        }
    }
}
