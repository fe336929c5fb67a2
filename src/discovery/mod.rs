//! Discovery Module
//!
//! The cluster view the node runtime reads: which peers exist, where their
//! HTTP and binary ports live, and which index paths each peer currently
//! holds. It answers exactly what the runtime asks of it: resolve an index
//! path to its holders, and touch a node name to its address.
//!
//! ## Core Mechanisms
//! - **Announcements**: every node periodically broadcasts its record plus
//!   the full set of index paths it holds. The announcement is both the
//!   ownership update and the liveness signal; there is no separate
//!   ping/ack exchange.
//! - **Freshness**: a peer whose announcements stop refreshing goes stale
//!   (excluded from resolution) and is eventually evicted. A late
//!   announcement revives a stale peer; a `seq` counter drops reordered
//!   datagrams.
//! - **Joining**: a booting node sends `Hello` to its seeds and receives a
//!   `Roster` of known members, after which announcements converge the
//!   ownership view.
//!
//! Datagrams are `[type: u8][version: u16 LE][bincode payload]`. A type at
//! or above `MAX_TYPE`, or a version mismatch, drops the datagram.

pub mod service;
pub mod types;
