//! Shared node context handed to every server and client task: the
//! discovery view, the resolver, the database pool, the runner pool, the
//! stats counters and the shutdown signal.

use std::sync::Arc;

use tokio::sync::watch;

use crate::discovery::service::DiscoveryService;
use crate::executor::TaskPool;
use crate::resolver::EndpointResolver;
use crate::stats::Stats;
use crate::storage::pool::DatabasePool;

/// Two-phase shutdown. `Asap` stops accepting and lets idle connections
/// drain; `Now` force-destroys whatever is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    Asap,
    Now,
}

#[derive(Clone)]
pub struct NodeContext {
    pub discovery: Arc<DiscoveryService>,
    pub resolver: Arc<EndpointResolver>,
    pub pool: Arc<DatabasePool>,
    pub executor: Arc<TaskPool>,
    pub stats: Arc<Stats>,
    pub shutdown: watch::Receiver<ShutdownPhase>,
}

impl NodeContext {
    pub fn shutdown_phase(&self) -> ShutdownPhase {
        *self.shutdown.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_phase() != ShutdownPhase::Running
    }
}
