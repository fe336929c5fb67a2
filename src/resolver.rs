//! Endpoint Resolver
//!
//! Translates what a request names (an index path, possibly an explicit
//! `@node` qualifier) into the `EndpointSet` the operation runs against,
//! using the discovery service's cluster view. Resolution is bounded:
//! writes wait up to 2 s for the holders map to converge, reads 1 s, and
//! both fall back to the local node when nothing answers.

use std::sync::Arc;
use std::time::Duration;

use crate::discovery::service::DiscoveryService;
use crate::discovery::types::NodeName;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{Error, Result};

pub const RESOLVE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const RESOLVE_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct EndpointResolver {
    discovery: Arc<DiscoveryService>,
}

impl EndpointResolver {
    pub fn new(discovery: Arc<DiscoveryService>) -> Arc<Self> {
        Arc::new(Self { discovery })
    }

    fn local_endpoint(&self, index_path: &str) -> Endpoint {
        let local = &self.discovery.local_node;
        Endpoint::new(
            &local.name.0,
            &local.addr.ip().to_string(),
            local.binary_port,
            index_path,
        )
    }

    /// Resolve an explicit `@host` qualifier to that exact node.
    pub fn resolve_host(&self, node_name: &str, index_path: &str) -> Result<Endpoint> {
        let name = NodeName(node_name.to_string());
        let node = self
            .discovery
            .touch_node(&name)
            .ok_or_else(|| Error::EndpointResolution(format!("Unknown host {}", node_name)))?;
        Ok(Endpoint::new(
            &node.name.0,
            &node.addr.ip().to_string(),
            node.binary_port,
            index_path,
        ))
    }

    /// Resolve an index path to the set of nodes holding it. Falls back to
    /// the local node when the cluster doesn't answer within the timeout.
    pub async fn resolve_index(&self, index_path: &str, writable: bool) -> Result<EndpointSet> {
        let timeout = if writable {
            RESOLVE_WRITE_TIMEOUT
        } else {
            RESOLVE_READ_TIMEOUT
        };

        if self.discovery.is_single_node() {
            return Ok(EndpointSet::single(self.local_endpoint(index_path)));
        }

        let holders = self.discovery.resolve_index(index_path, timeout).await;
        if holders.is_empty() {
            tracing::debug!("No holders for {}, using local node", index_path);
            return Ok(EndpointSet::single(self.local_endpoint(index_path)));
        }

        Ok(holders
            .into_iter()
            .map(|node| {
                Endpoint::new(
                    &node.name.0,
                    &node.addr.ip().to_string(),
                    node.binary_port,
                    index_path,
                )
            })
            .collect())
    }

    pub fn local_node_name(&self) -> String {
        self.discovery.local_node.name.0.clone()
    }
}
