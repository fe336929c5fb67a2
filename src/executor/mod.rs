//! Task Executor Module
//!
//! A fixed-size pool of runners draining one bounded work queue. Request
//! execution (database work, response rendering, binary protocol dispatch)
//! happens here, never on connection I/O paths.
//!
//! ## Behaviour
//! - **Submission** is non-blocking: a full queue is an immediate
//!   `QuotaExceeded` that callers translate into backpressure (HTTP 503,
//!   binary connection drop).
//! - **Cancellation** is cooperative: shutdown flips an atomic flag, new
//!   submissions are refused, and the runners are joined once the queue
//!   drains.

pub mod pool;

pub use pool::TaskPool;

#[cfg(test)]
mod tests;
