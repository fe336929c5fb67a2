//! Binary Protocol Module
//!
//! The persistent framed connection between nodes, carrying two
//! sub-protocols over one socket:
//!
//! - **remote**: query dispatch against a locally held shard;
//! - **replication**: pulling changesets and whole storage files between
//!   peers.
//!
//! Frames are `[type: u8][length: varint][payload]`. Two sentinels escape
//! the framing: `SWITCH_TO_REPL` flips a serving connection into the
//! replication protocol, and `FILE_FOLLOWS` switches the reader into a
//! compressed file stream that lands in a temp file.
//!
//! ## Submodules
//! - **`codec`**: message types, varint lengths, payload encode/decode.
//! - **`compress`**: identity and LZ4 block compressors for file streams.
//! - **`connection`**: per-socket state machine, bounded write queue,
//!   message queue and runner scheduling.
//! - **`remote`**: the remote search protocol server.
//! - **`replication`**: replication server and client.

pub mod codec;
pub mod compress;
pub mod connection;
pub mod remote;
pub mod replication;

#[cfg(test)]
mod tests;
