//! Storage Module
//!
//! The node's index engine and the pool that arbitrates access to it.
//!
//! ## Core Concepts
//! - **Shards**: each index path maps to an `IndexShard` holding documents,
//!   an inverted index, an inferred field schema, and a bounded changeset
//!   log. Commits bump a monotonic revision and persist a snapshot.
//! - **Single-writer**: a per-index lock file (`lock`) excludes other
//!   processes; the pool's write-intent locks serialise writers inside the
//!   process.
//! - **Pool discipline**: `pool` maps endpoint-sets to database slots with
//!   writable/readable flags, LRU eviction of idle slots, and
//!   reopen-on-divergence coordination.

pub mod index;
pub mod lock;
pub mod pool;

#[cfg(test)]
mod tests;
