//! Manager
//!
//! Root of the worker tree: builds the shared services, binds the HTTP and
//! binary sockets, runs the accept loops and orchestrates the two-phase
//! shutdown. `Asap` stops accepting and drains idle connections; `Now`
//! force-destroys what's left after rolling back uncommitted writable
//! batches.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::binary::connection::BinaryConnection;
use crate::context::{NodeContext, ShutdownPhase};
use crate::discovery::service::DiscoveryService;
use crate::discovery::types::NodeName;
use crate::executor::TaskPool;
use crate::http;
use crate::resolver::EndpointResolver;
use crate::stats::Stats;
use crate::storage::pool::DatabasePool;

/// How long `Asap` gets to drain before the manager escalates to `Now`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: Option<String>,
    pub database: PathBuf,
    pub bind: IpAddr,
    pub http_port: u16,
    pub binary_port: u16,
    pub discovery_port: u16,
    pub seeds: Vec<SocketAddr>,
    pub region: i32,
    pub workers: usize,
    pub queue_bound: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: None,
            database: PathBuf::from("./data"),
            bind: "0.0.0.0".parse().unwrap(),
            http_port: 8880,
            binary_port: 8890,
            discovery_port: 8860,
            seeds: Vec::new(),
            region: 0,
            workers: 8,
            queue_bound: 256,
        }
    }
}

pub struct Manager {
    pub ctx: NodeContext,
    config: Config,
    shutdown_tx: watch::Sender<ShutdownPhase>,
}

impl Manager {
    pub async fn new(config: Config) -> Result<Self> {
        let name = config
            .node_name
            .clone()
            .map(NodeName)
            .unwrap_or_else(NodeName::generated);

        let discovery = DiscoveryService::new(
            name,
            SocketAddr::new(config.bind, config.discovery_port),
            config.http_port,
            config.binary_port,
            config.region,
            config.seeds.clone(),
        )
        .await?;
        let resolver = EndpointResolver::new(discovery.clone());

        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let pool = DatabasePool::new(config.database.clone(), announce_tx);
        Self::spawn_announcer(discovery.clone(), announce_rx);

        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownPhase::Running);

        let ctx = NodeContext {
            discovery,
            resolver,
            pool,
            executor: TaskPool::new(config.workers, config.queue_bound),
            stats: Arc::new(Stats::new()),
            shutdown: shutdown_rx,
        };

        Ok(Self {
            ctx,
            config,
            shutdown_tx,
        })
    }

    /// Forward index spawns from the pool to cluster-wide announcements.
    fn spawn_announcer(
        discovery: Arc<DiscoveryService>,
        mut announce_rx: mpsc::UnboundedReceiver<String>,
    ) {
        tokio::spawn(async move {
            while let Some(index_path) = announce_rx.recv().await {
                discovery.broadcast_index(&index_path).await;
            }
        });
    }

    pub fn shutdown(&self, phase: ShutdownPhase) {
        let _ = self.shutdown_tx.send(phase);
    }

    pub async fn run(self) -> Result<()> {
        self.ctx.discovery.clone().start().await;

        let http_addr = SocketAddr::new(self.config.bind, self.config.http_port);
        let binary_addr = SocketAddr::new(self.config.bind, self.config.binary_port);

        let http_listener = TcpListener::bind(http_addr).await?;
        let binary_listener = TcpListener::bind(binary_addr).await?;
        tracing::info!("HTTP server listening on {}", http_addr);
        tracing::info!("Binary server listening on {}", binary_addr);

        // Binary accept loop.
        let binary_ctx = self.ctx.clone();
        let mut binary_shutdown = self.ctx.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = binary_listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if *binary_shutdown.borrow() != ShutdownPhase::Running {
                                tracing::debug!("Refusing {} during shutdown", peer);
                                continue;
                            }
                            BinaryConnection::spawn(stream, binary_ctx.clone());
                        }
                        Err(e) => {
                            tracing::error!("Binary accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = binary_shutdown.changed() => {
                        if *binary_shutdown.borrow() != ShutdownPhase::Running {
                            tracing::info!("Binary server stopped accepting");
                            break;
                        }
                    }
                }
            }
        });

        // Signal handling: first signal drains, second one forces.
        let signal_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("Shutdown requested, draining (signal again to force)");
            let _ = signal_tx.send(ShutdownPhase::Asap);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Forcing shutdown");
                }
                _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                    tracing::warn!("Drain period elapsed, forcing shutdown");
                }
            }
            let _ = signal_tx.send(ShutdownPhase::Now);
        });

        // HTTP server with graceful drain on Asap.
        let app = http::router(self.ctx.clone());
        let mut http_shutdown = self.ctx.shutdown.clone();
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move {
                while *http_shutdown.borrow() == ShutdownPhase::Running {
                    if http_shutdown.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await?;

        // Past this point we are in Asap at least; make it Now and release
        // everything that is still held.
        let _ = self.shutdown_tx.send(ShutdownPhase::Now);
        self.ctx.pool.rollback_all().await;
        self.ctx.executor.initiate_shutdown();
        self.ctx.executor.join().await;

        tracing::info!("Shutdown complete");
        Ok(())
    }
}
