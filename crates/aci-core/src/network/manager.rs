//! Lazy per-peer connections.
//!
//! The manager hands out exclusive guards on a peer's cached connection,
//! opening and authenticating one on first use or when a reconnect is forced.
//! Remote nodes are located through the local kernel's `getNodeLocation`.

use super::connection::{Connection, ConnectionState, Endpoint, Peer};
use super::registry::{ConnectionLease, LocationCache};
use super::retry::{retry_async, RetryConfig};
use crate::locator::NodeAddress;
use crate::wire::Framer;
use crate::{AciError, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Exclusive use of one authenticated connection for an exchange.
pub type ConnectionGuard = OwnedMappedMutexGuard<Option<Connection>, Connection>;

/// Owns the connection side of the location cache.
#[derive(Debug)]
pub struct ConnectionManager {
    cache: Arc<LocationCache>,
    framer: Arc<dyn Framer>,
    kernel: NodeAddress,
    read_timeout: RwLock<Option<Duration>>,
    retry: RetryConfig,
}

impl ConnectionManager {
    pub fn new(cache: Arc<LocationCache>, framer: Arc<dyn Framer>, kernel: NodeAddress) -> Self {
        Self {
            cache,
            framer,
            kernel,
            read_timeout: RwLock::new(None),
            retry: RetryConfig::reconnect_once(),
        }
    }

    pub fn with_read_timeout(self, timeout: Option<Duration>) -> Self {
        self.set_read_timeout(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Read timeout for connections opened from now on.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.write().unwrap_or_else(|e| e.into_inner()) = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        &self.cache
    }

    pub fn framer(&self) -> &Arc<dyn Framer> {
        &self.framer
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn kernel_address(&self) -> &NodeAddress {
        &self.kernel
    }

    /// Guarded connection to a node, opened if missing or when `force` is set.
    ///
    /// The local node id short-cuts to the local kernel connection.
    pub async fn connect(&self, node_id: &str, force: bool) -> Result<ConnectionGuard> {
        let peer = self.cache.peer_for(node_id);
        self.checkout(&peer, force).await
    }

    /// Guarded connection to the local kernel.
    pub async fn connect_local(&self, force: bool) -> Result<ConnectionGuard> {
        self.checkout_local(force).await
    }

    pub async fn checkout(&self, peer: &Peer, force: bool) -> Result<ConnectionGuard> {
        match peer {
            Peer::LocalKernel => self.checkout_local(force).await,
            Peer::Node(node_id) => self.checkout_node(node_id, force).await,
        }
    }

    /// Locate a node through the local kernel.
    pub async fn resolve(&self, node_id: &str) -> Result<NodeAddress> {
        let (result, stats) = retry_async(
            &self.retry,
            |attempt| async move {
                let mut conn = self.checkout_local(attempt > 0).await?;
                self.framer.node_location(&mut conn, node_id).await
            },
            AciError::is_transport,
        )
        .await;

        match result {
            Ok(address) => {
                debug!("Node {} is at {}", node_id, address);
                Ok(address)
            }
            Err(e) => {
                warn!(
                    "Could not locate node {} after {} attempts: {}",
                    node_id, stats.attempts, e
                );
                Err(AciError::ResolutionFailed {
                    node_id: node_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Close and forget a peer's connection.
    pub async fn disconnect(&self, peer: &Peer) {
        let mut lease = self.cache.lease(peer).await;
        retire(&mut lease).await;
        self.cache.invalidate(peer);
    }

    async fn checkout_local(&self, force: bool) -> Result<ConnectionGuard> {
        let peer = Peer::LocalKernel;
        let mut lease = self.cache.lease(&peer).await;
        if force || !is_live(&lease) {
            retire(&mut lease).await;
            let endpoint = Endpoint::local(self.kernel.clone());
            *lease = Some(self.open(endpoint, force).await?);
        }
        into_guard(lease, &peer)
    }

    async fn checkout_node(&self, node_id: &str, force: bool) -> Result<ConnectionGuard> {
        let peer = Peer::Node(node_id.to_string());
        let mut lease = self.cache.lease(&peer).await;
        if force || !is_live(&lease) {
            retire(&mut lease).await;
            let address = self.resolve(node_id).await?;
            let endpoint = Endpoint::node(node_id, address);
            *lease = Some(self.open(endpoint, force).await?);
        }
        into_guard(lease, &peer)
    }

    async fn open(&self, endpoint: Endpoint, forced: bool) -> Result<Connection> {
        if forced {
            info!("Reconnecting to {}", endpoint);
        }
        let mut conn = Connection::open(endpoint, self.read_timeout()).await?;
        let node_id = conn.authenticate().await?;
        self.cache.observe_local_node(&node_id);
        Ok(conn)
    }
}

/// A connection abandoned after a failed exchange is not live and gets replaced.
fn is_live(lease: &ConnectionLease) -> bool {
    matches!(lease.as_ref(), Some(conn) if conn.state() == ConnectionState::Authenticated)
}

async fn retire(lease: &mut ConnectionLease) {
    if let Some(mut old) = lease.take() {
        debug!("Dropping connection to {}", old.endpoint());
        old.close().await;
    }
}

fn into_guard(lease: ConnectionLease, peer: &Peer) -> Result<ConnectionGuard> {
    OwnedMutexGuard::try_map(lease, |slot| slot.as_mut()).map_err(|_| AciError::Transport {
        op: "connect".into(),
        endpoint: format!("{:?}", peer),
        message: "connection slot is empty".into(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::framer_for;
    use crate::WireProtocol;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// A kernel that greets every connection and answers `locate` requests.
    async fn greeting_kernel(node_id: &'static str, locate_reply: Option<String>) -> (NodeAddress, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let reply = locate_reply.clone();
                tokio::spawn(async move {
                    let mut io = BufReader::new(stream);
                    let mut line = String::new();
                    io.read_line(&mut line).await.unwrap();
                    io.get_mut()
                        .write_all(format!("WELCOME to {}\r\n", node_id).as_bytes())
                        .await
                        .unwrap();
                    loop {
                        line.clear();
                        if io.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        if line.trim() == "END_NODEINFO" {
                            let answer = match &reply {
                                Some(address) => format!(
                                    "NODEINFO_VALID\r\nSTART_LOCATION_RESULT\r\n{}\r\nEND_LOCATION_RESULT\r\n",
                                    address
                                ),
                                None => "NODEINFO_FAILED unknown node\r\n".to_string(),
                            };
                            io.get_mut().write_all(answer.as_bytes()).await.unwrap();
                        }
                    }
                });
            }
        });

        (NodeAddress::new("127.0.0.1", port), accepted)
    }

    fn manager(kernel: NodeAddress) -> ConnectionManager {
        ConnectionManager::new(
            LocationCache::shared(),
            framer_for(WireProtocol::Line, "C1"),
            kernel,
        )
        .with_read_timeout(Some(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_connect_local_is_lazy_and_cached() {
        let (kernel, accepted) = greeting_kernel("K0", None).await;
        let manager = manager(kernel);

        {
            let conn = manager.connect_local(false).await.unwrap();
            assert_eq!(conn.state(), ConnectionState::Authenticated);
            assert_eq!(conn.peer_node_id(), Some("K0"));
        }
        drop(manager.connect_local(false).await.unwrap());
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.cache().local_node_id(), Some("K0"));

        drop(manager.connect_local(true).await.unwrap());
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_node_resolves_through_local_kernel() {
        let (node, node_accepted) = greeting_kernel("N1", None).await;
        let (kernel, _) = greeting_kernel("K0", Some(node.to_string())).await;
        let manager = manager(kernel);

        let conn = manager.connect("N1", false).await.unwrap();
        assert_eq!(conn.peer_node_id(), Some("N1"));
        assert_eq!(conn.endpoint().address, node);
        drop(conn);

        drop(manager.connect("N1", false).await.unwrap());
        assert_eq!(node_accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_node_id_short_cuts_to_kernel() {
        let (kernel, accepted) = greeting_kernel("K0", None).await;
        let manager = manager(kernel.clone());

        drop(manager.connect_local(false).await.unwrap());
        let conn = manager.connect("K0", false).await.unwrap();
        assert_eq!(conn.endpoint().address, kernel);
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_node_is_resolution_failure() {
        let (kernel, _) = greeting_kernel("K0", None).await;
        let manager = manager(kernel);

        assert!(matches!(
            manager.connect("N404", false).await,
            Err(AciError::ResolutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_greeting_is_authentication_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut io = BufReader::new(stream);
            let mut line = String::new();
            io.read_line(&mut line).await.unwrap();
            io.get_mut().write_all(b"HELLO stranger\r\n").await.unwrap();
            // Hold the socket open until the client gives up
            io.read_line(&mut line).await.ok();
        });

        let manager = manager(NodeAddress::new("127.0.0.1", port));
        assert!(matches!(
            manager.connect_local(false).await,
            Err(AciError::AuthenticationFailed { .. })
        ));
    }
}
