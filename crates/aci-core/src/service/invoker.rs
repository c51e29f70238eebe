//! Cache-aware service client.

use super::exchange;
use crate::codec::{request_envelope, result_value, JsonCodec, ObjectCodec};
use crate::config::{ClientConfig, WireProtocol};
use crate::envelope::{Envelope, FILE_TYPE};
use crate::locator::NodeAddress;
use crate::network::{ConnectionManager, LocationCache, Peer, RetryConfig};
use crate::wire::{framer_for, Deactivation, Framer, InvokeCall, ResourceQuery};
use crate::{AciError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An activated instance, as seen by the caller that activated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    /// Requestor id the instance was activated under.
    pub caller_id: String,
    pub instance_id: String,
    /// Node last known to host the instance.
    pub node_id: String,
}

/// Client for activating, invoking and locating services.
///
/// Invocations go straight to the node that hosts the instance, found through
/// the shared [`LocationCache`]. Everything else goes through the local kernel.
pub struct ServiceInvoker {
    connections: Arc<ConnectionManager>,
    codec: Arc<dyn ObjectCodec>,
}

impl std::fmt::Debug for ServiceInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInvoker")
            .field("kernel", self.connections.kernel_address())
            .field("protocol", &self.protocol())
            .field("codec", &self.codec.name())
            .finish()
    }
}

impl ServiceInvoker {
    /// Build an invoker with its own cache.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_cache(config, LocationCache::shared())
    }

    /// Build an invoker that shares `cache` with other invokers and admin facades.
    pub fn with_cache(config: &ClientConfig, cache: Arc<LocationCache>) -> Self {
        Self::from_manager(Arc::new(connection_manager(config, cache)))
    }

    pub fn from_manager(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            codec: Arc::new(JsonCodec),
        }
    }

    /// Replace the codec used by [`invoke_object`](Self::invoke_object).
    pub fn with_codec(mut self, codec: Arc<dyn ObjectCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        self.connections.cache()
    }

    pub fn protocol(&self) -> WireProtocol {
        self.framer().protocol()
    }

    pub fn requestor_id(&self) -> String {
        self.framer().requestor_id()
    }

    /// Change the `RequestorUUID` sent from now on.
    pub fn set_requestor_id(&self, id: impl Into<String>) {
        self.framer().set_requestor_id(id.into());
    }

    /// Read timeout for connections opened from now on. Existing connections
    /// keep theirs until they are reopened.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.connections.set_read_timeout(timeout);
    }

    fn framer(&self) -> &Arc<dyn Framer> {
        self.connections.framer()
    }

    /// Activate a service through the local kernel and cache where it landed.
    pub async fn activate(&self, service_name: &str, local_only: bool) -> Result<ServiceHandle> {
        let framer = self.framer();
        let locator = exchange(
            &self.connections,
            "activate",
            &Peer::LocalKernel,
            |mut conn| async move { framer.activate(&mut conn, None, service_name, local_only).await },
        )
        .await?;

        info!(
            "Activated {} as {} on {}",
            service_name, locator.instance_id, locator.node_id
        );
        self.cache()
            .record_location(&locator.instance_id, &locator.node_id);
        Ok(ServiceHandle {
            caller_id: self.requestor_id(),
            instance_id: locator.instance_id,
            node_id: locator.node_id,
        })
    }

    /// Deactivate an instance. The cache entry is dropped whatever the kernel says.
    pub async fn deactivate(&self, instance_id: &str) -> Result<Deactivation> {
        let framer = self.framer();
        let node_hint = self.cache().node_for(instance_id);
        let node_hint = node_hint.as_deref();
        let outcome = exchange(
            &self.connections,
            "deactivate",
            &Peer::LocalKernel,
            |mut conn| async move { framer.deactivate(&mut conn, node_hint, instance_id).await },
        )
        .await?;

        self.cache().forget_location(instance_id);
        match outcome {
            Deactivation::Removed => info!("Deactivated {}", instance_id),
            Deactivation::AlreadyAbsent => info!("Instance {} was already gone", instance_id),
        }
        Ok(outcome)
    }

    pub async fn deactivate_handle(&self, handle: ServiceHandle) -> Result<Deactivation> {
        self.deactivate(&handle.instance_id).await
    }

    /// Deploy a service archive under `name`.
    pub async fn deploy(&self, name: &str, archive: Bytes) -> Result<()> {
        let framer = self.framer();
        let envelope = archive_envelope(name, archive);
        let envelope = &envelope;
        exchange(
            &self.connections,
            "deploy",
            &Peer::LocalKernel,
            |mut conn| async move { framer.deploy(&mut conn, name, envelope).await },
        )
        .await?;
        info!("Deployed {}", name);
        Ok(())
    }

    /// Deploy an archive file, named after its file name.
    pub async fn deploy_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let (name, archive) = read_archive(path.as_ref()).await?;
        self.deploy(&name, archive).await
    }

    /// Invoke a method with a prepared argument envelope.
    ///
    /// Returns `None` for asynchronous calls. When the cached node reports the
    /// instance gone, the instance is looked up again and the call is retried
    /// once on the node returned.
    pub async fn invoke(
        &self,
        instance_id: &str,
        method: &str,
        args: &Envelope,
        asynchronous: bool,
    ) -> Result<Option<Envelope>> {
        let node_id = match self.cache().node_for(instance_id) {
            Some(node_id) => node_id,
            None => {
                debug!("No cached location for {}, looking it up", instance_id);
                self.lookup(instance_id, None).await?
            }
        };

        let err = match self
            .invoke_on(&node_id, instance_id, method, args, asynchronous)
            .await
        {
            Err(e) if e.is_stale_location() => e,
            other => return other,
        };

        info!(
            "Instance {} is no longer on {} ({}), looking it up again",
            instance_id, node_id, err
        );
        self.cache().forget_location(instance_id);
        let new_node = self
            .lookup(instance_id, Some(&node_id))
            .await
            .map_err(|e| AciError::StaleLocation {
                instance_id: instance_id.to_string(),
                node_id: node_id.clone(),
                message: format!("re-resolution failed: {}", e),
            })?;

        self.invoke_on(&new_node, instance_id, method, args, asynchronous)
            .await
            .map_err(|e| {
                if e.is_stale_location() {
                    warn!("Instance {} also unavailable on {}", instance_id, new_node);
                    self.cache().forget_location(instance_id);
                    AciError::StaleLocation {
                        instance_id: instance_id.to_string(),
                        node_id: new_node.clone(),
                        message: e.to_string(),
                    }
                } else {
                    e
                }
            })
    }

    /// Invoke with native arguments, marshalled by the invoker's codec.
    pub async fn invoke_object(&self, instance_id: &str, method: &str, params: &[Value]) -> Result<Value> {
        let args = request_envelope(self.codec.as_ref(), method, params)?;
        let result = self
            .invoke(instance_id, method, &args, false)
            .await?
            .ok_or_else(|| AciError::EmptyOrCorruptResult {
                instance_id: instance_id.to_string(),
                method: method.to_string(),
            })?;
        result_value(self.codec.as_ref(), &result)
    }

    /// Invoke through a handle, refreshing its node if the instance moved.
    pub async fn invoke_handle(
        &self,
        handle: &mut ServiceHandle,
        method: &str,
        args: &Envelope,
        asynchronous: bool,
    ) -> Result<Option<Envelope>> {
        if self.cache().node_for(&handle.instance_id).is_none() {
            self.cache()
                .record_location(&handle.instance_id, &handle.node_id);
        }
        let result = self
            .invoke(&handle.instance_id, method, args, asynchronous)
            .await;
        if let Some(node_id) = self.cache().node_for(&handle.instance_id) {
            handle.node_id = node_id;
        }
        result
    }

    /// Ask the local kernel where an instance runs now, and cache the answer.
    pub async fn lookup(&self, instance_id: &str, old_node_id: Option<&str>) -> Result<String> {
        let framer = self.framer();
        let node_id = exchange(
            &self.connections,
            "lookup",
            &Peer::LocalKernel,
            |mut conn| async move { framer.lookup(&mut conn, instance_id, old_node_id).await },
        )
        .await?;

        self.cache().record_location(instance_id, &node_id);
        Ok(node_id)
    }

    /// Address of a node, as known to the local kernel.
    pub async fn node_location(&self, node_id: &str) -> Result<NodeAddress> {
        let framer = self.framer();
        exchange(
            &self.connections,
            "locate",
            &Peer::LocalKernel,
            |mut conn| async move { framer.node_location(&mut conn, node_id).await },
        )
        .await
    }

    /// Usage statistic for a service, from the local kernel.
    pub async fn resource_info(
        &self,
        query: ResourceQuery,
        service_name: &str,
        method_signature: Option<&str>,
    ) -> Result<f32> {
        resource_info_at(
            &self.connections,
            &Peer::LocalKernel,
            query,
            service_name,
            method_signature,
        )
        .await
    }

    async fn invoke_on(
        &self,
        node_id: &str,
        instance_id: &str,
        method: &str,
        args: &Envelope,
        asynchronous: bool,
    ) -> Result<Option<Envelope>> {
        let framer = self.framer();
        let peer = self.cache().peer_for(node_id);
        let call = InvokeCall {
            node_id: Some(node_id),
            instance_id,
            method,
            args,
            asynchronous,
        };
        debug!("Invoking {}.{} on {:?}", instance_id, method, peer);
        exchange(&self.connections, "invoke", &peer, |mut conn| async move {
            framer.invoke(&mut conn, &call).await
        })
        .await
    }
}

pub(crate) fn connection_manager(config: &ClientConfig, cache: Arc<LocationCache>) -> ConnectionManager {
    let framer = framer_for(config.protocol, config.resolve_requestor_id());
    let retry = RetryConfig::reconnect_once()
        .with_base_delay(config.reconnect_delay())
        .with_jitter(config.reconnect_jitter);
    ConnectionManager::new(cache, framer, config.kernel_address())
        .with_read_timeout(config.read_timeout())
        .with_retry(retry)
}

pub(crate) fn archive_envelope(name: &str, archive: Bytes) -> Envelope {
    Envelope::single(FILE_TYPE, name, archive)
}

pub(crate) async fn read_archive(path: &Path) -> Result<(String, Bytes)> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AciError::Validation {
            field: "path".into(),
            message: format!("{} has no file name", path.display()),
        })?
        .to_string();
    let archive = tokio::fs::read(path)
        .await
        .map_err(|e| AciError::io_with_path(e, path))?;
    Ok((name, Bytes::from(archive)))
}

pub(crate) async fn resource_info_at(
    connections: &ConnectionManager,
    peer: &Peer,
    query: ResourceQuery,
    service_name: &str,
    method_signature: Option<&str>,
) -> Result<f32> {
    if query.requires_method_signature() && method_signature.is_none() {
        return Err(AciError::Validation {
            field: "method_signature".into(),
            message: format!("{} needs a method signature", query),
        });
    }
    let framer = connections.framer();
    exchange(connections, "resinfo", peer, |mut conn| async move {
        framer
            .resource_info(&mut conn, query, service_name, method_signature)
            .await
    })
    .await
}
