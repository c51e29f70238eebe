//! Service operations over the connection layer.
//!
//! [`ServiceInvoker`] resolves instances through the location cache and chases
//! relocations; [`AdminFacade`] addresses one node explicitly and issues
//! relocation orders.

mod admin;
mod invoker;

pub use admin::AdminFacade;
pub use invoker::{ServiceHandle, ServiceInvoker};

use crate::network::{retry_async, ConnectionGuard, ConnectionManager, Peer};
use crate::{AciError, Result};
use std::future::Future;
use tracing::warn;

/// Run one exchange with a peer, reconnecting and retrying once on a
/// transport failure.
///
/// `call` gets exclusive use of the connection for the whole exchange.
pub(crate) async fn exchange<T, F, Fut>(
    connections: &ConnectionManager,
    op: &'static str,
    peer: &Peer,
    call: F,
) -> Result<T>
where
    F: Fn(ConnectionGuard) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let call = &call;
    let (result, stats) = retry_async(
        connections.retry_config(),
        |attempt| async move {
            let conn = connections.checkout(peer, attempt > 0).await?;
            call(conn).await
        },
        AciError::is_transport,
    )
    .await;

    if let Err(e) = &result {
        if e.is_transport() {
            warn!("{} to {:?} failed after {} attempts: {}", op, peer, stats.attempts, e);
        }
    }
    result
}
