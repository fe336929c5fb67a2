//! Search Module
//!
//! The retrieval pipeline that executes a parsed query descriptor against
//! an index shard.
//!
//! ## Responsibilities
//! - **Tokenization**: normalizing document text and query strings into
//!   searchable tokens.
//! - **Matching & Ranking**: term-overlap scoring over the inverted index,
//!   with prefix (`partial`) matching, exact `terms` filters, and
//!   relevance-feedback expansion for `fuzzy` and `nearest` queries.
//! - **Shaping**: sorting, collapsing, facet counting and pagination.
//!
//! ## Submodules
//! - **`engine`**: matching, scoring and result shaping.
//! - **`tokenizer`**: text normalization utilities.
//! - **`types`**: the query descriptor and result types shared by the HTTP
//!   surface and the remote binary protocol.

pub mod engine;
pub mod tokenizer;
pub mod types;

#[cfg(test)]
mod tests;
