//! Operator commands addressed to one node.
//!
//! Unlike the invoker, nothing here re-resolves a stale location: the operator
//! picked the node and gets that node's answer.

use super::exchange;
use super::invoker::{archive_envelope, connection_manager, read_archive, resource_info_at};
use crate::config::ClientConfig;
use crate::locator::Locator;
use crate::network::{ConnectionManager, LocationCache, Peer};
use crate::wire::{Deactivation, Framer, RelocationRequest, ResourceQuery};
use crate::Result;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Administrative client bound to one node's kernel.
#[derive(Debug, Clone)]
pub struct AdminFacade {
    connections: Arc<ConnectionManager>,
    node_id: Option<String>,
}

impl AdminFacade {
    /// Facade for the local kernel, with its own cache.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_cache(config, LocationCache::shared())
    }

    /// Facade for the local kernel, sharing `cache` with invokers.
    pub fn with_cache(config: &ClientConfig, cache: Arc<LocationCache>) -> Self {
        Self::from_manager(Arc::new(connection_manager(config, cache)))
    }

    pub fn from_manager(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            node_id: None,
        }
    }

    /// The same facade addressed to `node_id`'s kernel.
    pub fn on_node(&self, node_id: impl Into<String>) -> Self {
        Self {
            connections: self.connections.clone(),
            node_id: Some(node_id.into()),
        }
    }

    /// Node this facade talks to; `None` for the local kernel.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        self.connections.cache()
    }

    fn framer(&self) -> &Arc<dyn Framer> {
        self.connections.framer()
    }

    fn target(&self) -> Peer {
        match &self.node_id {
            Some(node_id) => self.cache().peer_for(node_id),
            None => Peer::LocalKernel,
        }
    }

    fn target_name(&self) -> &str {
        self.node_id.as_deref().unwrap_or("local kernel")
    }

    // Relocation

    /// Move one instance to `dest_node_id`.
    pub async fn migrate(&self, instance_id: &str, dest_node_id: &str) -> Result<()> {
        self.relocate(RelocationRequest::Migrate {
            instance_id: instance_id.to_string(),
            dest_node_id: dest_node_id.to_string(),
        })
        .await?;
        self.cache().record_location(instance_id, dest_node_id);
        Ok(())
    }

    /// Move every instance hosted by the target node to `dest_node_id`.
    pub async fn migrate_all(&self, dest_node_id: &str) -> Result<()> {
        self.relocate(RelocationRequest::MigrateAll {
            dest_node_id: dest_node_id.to_string(),
        })
        .await?;
        let source = match &self.node_id {
            Some(node_id) => Some(node_id.as_str()),
            None => self.cache().local_node_id(),
        };
        if let Some(source) = source {
            self.cache().move_all(source, dest_node_id);
        }
        Ok(())
    }

    /// Recreate an instance on the target node from captured state.
    pub async fn restore(
        &self,
        instance_id: &str,
        service_name: &str,
        state: Bytes,
        container_name: Option<&str>,
    ) -> Result<()> {
        self.relocate(RelocationRequest::Restore {
            instance_id: instance_id.to_string(),
            service_name: service_name.to_string(),
            state,
            container_name: container_name.map(str::to_string),
        })
        .await?;

        let host = match &self.node_id {
            Some(node_id) => Some(node_id.as_str()),
            None => self.cache().local_node_id(),
        };
        match host {
            Some(node_id) => self.cache().record_location(instance_id, node_id),
            None => {
                self.cache().forget_location(instance_id);
            }
        }
        Ok(())
    }

    async fn relocate(&self, request: RelocationRequest) -> Result<()> {
        let framer = self.framer();
        let request = &request;
        exchange(
            &self.connections,
            "relocate",
            &self.target(),
            |mut conn| async move { framer.relocate(&mut conn, request).await },
        )
        .await?;
        info!("{} accepted by {}", request.action_type(), self.target_name());
        Ok(())
    }

    // Explicit-node service operations

    /// Activate a service on the target node.
    pub async fn activate_on(&self, service_name: &str, local_only: bool) -> Result<Locator> {
        let framer = self.framer();
        let node_id = self.node_id.as_deref();
        let locator = exchange(
            &self.connections,
            "activate",
            &self.target(),
            |mut conn| async move {
                framer
                    .activate(&mut conn, node_id, service_name, local_only)
                    .await
            },
        )
        .await?;
        self.cache()
            .record_location(&locator.instance_id, &locator.node_id);
        Ok(locator)
    }

    pub async fn deactivate_on(&self, instance_id: &str) -> Result<Deactivation> {
        let framer = self.framer();
        let node_id = self.node_id.as_deref();
        let outcome = exchange(
            &self.connections,
            "deactivate",
            &self.target(),
            |mut conn| async move { framer.deactivate(&mut conn, node_id, instance_id).await },
        )
        .await?;
        self.cache().forget_location(instance_id);
        Ok(outcome)
    }

    pub async fn resource_info_on(
        &self,
        query: ResourceQuery,
        service_name: &str,
        method_signature: Option<&str>,
    ) -> Result<f32> {
        resource_info_at(
            &self.connections,
            &self.target(),
            query,
            service_name,
            method_signature,
        )
        .await
    }

    /// Deploy an archive to the target node.
    pub async fn deploy_to(&self, name: &str, archive: Bytes) -> Result<()> {
        let framer = self.framer();
        let envelope = archive_envelope(name, archive);
        let envelope = &envelope;
        exchange(
            &self.connections,
            "deploy",
            &self.target(),
            |mut conn| async move { framer.deploy(&mut conn, name, envelope).await },
        )
        .await?;
        info!("Deployed {} to {}", name, self.target_name());
        Ok(())
    }

    pub async fn deploy_file_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let (name, archive) = read_archive(path.as_ref()).await?;
        self.deploy_to(&name, archive).await
    }
}
