//! ACI Core - client-side RPC and service location for the agile-computing fabric.
//!
//! A client talks to its local kernel to activate, deploy and locate services,
//! and to the hosting node's kernel to invoke them. Instances may migrate
//! between nodes; the invoker caches where each instance lives and recovers
//! once, through a kernel lookup, when a node reports the instance gone.
//!
//! Requests travel either as CRLF-delimited field blocks (`line`) or as
//! HTTP/1.1 `POST`s (`http`), with binary payloads packed in DIME envelopes.
//!
//! # Example
//!
//! ```rust,ignore
//! use aci_core::{ClientConfig, ServiceInvoker};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> aci_core::Result<()> {
//!     let invoker = ServiceInvoker::new(&ClientConfig::default());
//!
//!     let handle = invoker.activate("Calculator", false).await?;
//!     let sum = invoker
//!         .invoke_object(&handle.instance_id, "add", &[json!(2), json!(3)])
//!         .await?;
//!     println!("2 + 3 = {}", sum);
//!
//!     invoker.deactivate(&handle.instance_id).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod locator;
pub mod network;
pub mod service;
pub mod wire;

// Re-export commonly used types
pub use codec::{JsonCodec, ObjectCodec};
pub use config::{ClientConfig, WireProtocol};
pub use envelope::{Envelope, EnvelopeRecord};
pub use error::{AciError, Result};
pub use locator::{Locator, NodeAddress};
pub use network::{ConnectionManager, LocationCache, Peer, RetryConfig};
pub use service::{AdminFacade, ServiceHandle, ServiceInvoker};
pub use wire::{
    framer_for, Deactivation, Framer, QueryScope, RelocationRequest, ResourceMetric,
    ResourceQuery,
};
