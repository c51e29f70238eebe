//! Wire framings of the kernel operation set.
//!
//! [`LineFramer`] speaks the line-oriented `SPEAK <op>/1.0` protocol;
//! [`HttpFramer`] carries the same field blocks as HTTP/1.1 headers. Both
//! implement [`Framer`] and run over an authenticated [`Connection`].

mod http;
mod line;

pub use http::HttpFramer;
pub use line::LineFramer;

use crate::config::WireProtocol;
use crate::envelope::Envelope;
use crate::locator::{Locator, NodeAddress};
use crate::network::Connection;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// The operation set every framing implements.
#[async_trait]
pub trait Framer: Send + Sync + std::fmt::Debug {
    fn protocol(&self) -> WireProtocol;

    /// Caller identity sent as `RequestorUUID`.
    fn requestor_id(&self) -> String;

    fn set_requestor_id(&self, id: String);

    /// Resolve or instantiate a service; returns the reference the kernel issued.
    async fn activate(
        &self,
        conn: &mut Connection,
        node_id: Option<&str>,
        service_name: &str,
        local_only: bool,
    ) -> Result<Locator>;

    async fn deactivate(
        &self,
        conn: &mut Connection,
        node_id: Option<&str>,
        instance_id: &str,
    ) -> Result<Deactivation>;

    async fn deploy(&self, conn: &mut Connection, name: &str, archive: &Envelope) -> Result<()>;

    /// Returns `None` for asynchronous calls, which do not read a reply.
    async fn invoke(&self, conn: &mut Connection, call: &InvokeCall<'_>)
        -> Result<Option<Envelope>>;

    async fn lookup(
        &self,
        conn: &mut Connection,
        instance_id: &str,
        old_node_id: Option<&str>,
    ) -> Result<String>;

    async fn node_location(&self, conn: &mut Connection, node_id: &str) -> Result<NodeAddress>;

    async fn resource_info(
        &self,
        conn: &mut Connection,
        query: ResourceQuery,
        service_name: &str,
        method_signature: Option<&str>,
    ) -> Result<f32>;

    async fn relocate(&self, conn: &mut Connection, request: &RelocationRequest) -> Result<()>;
}

/// Build the framer for a protocol.
pub fn framer_for(protocol: WireProtocol, requestor_id: impl Into<String>) -> Arc<dyn Framer> {
    match protocol {
        WireProtocol::Line => Arc::new(LineFramer::new(requestor_id)),
        WireProtocol::Http => Arc::new(HttpFramer::new(requestor_id)),
    }
}

/// Arguments of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct InvokeCall<'a> {
    pub node_id: Option<&'a str>,
    pub instance_id: &'a str,
    pub method: &'a str,
    pub args: &'a Envelope,
    pub asynchronous: bool,
}

/// Outcome of a deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deactivation {
    /// The kernel confirmed the instance was removed.
    Removed,
    /// The kernel did not confirm; the instance was already gone.
    AlreadyAbsent,
}

impl Deactivation {
    pub fn removed(&self) -> bool {
        matches!(self, Deactivation::Removed)
    }
}

/// Usage statistic measured by a resource query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceMetric {
    Bytecode = 0,
    ParameterSize = 1,
    ReturnDataSize = 2,
    InvocationRate = 3,
}

/// What a resource query averages over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryScope {
    Service = 0,
    Method = 1,
    Client = 2,
}

/// A resource query type. The numeric code is passed through unchanged, so
/// codes outside the known catalogue can still be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceQuery(i32);

const METRICS: [ResourceMetric; 4] = [
    ResourceMetric::Bytecode,
    ResourceMetric::ParameterSize,
    ResourceMetric::ReturnDataSize,
    ResourceMetric::InvocationRate,
];
const SCOPES: [QueryScope; 3] = [QueryScope::Service, QueryScope::Method, QueryScope::Client];

impl ResourceQuery {
    pub fn new(metric: ResourceMetric, scope: QueryScope) -> Self {
        Self(metric as i32 * SCOPES.len() as i32 + scope as i32)
    }

    pub fn from_code(code: i32) -> Self {
        Self(code)
    }

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn metric(&self) -> Option<ResourceMetric> {
        usize::try_from(self.0 / SCOPES.len() as i32)
            .ok()
            .filter(|_| self.0 >= 0)
            .and_then(|index| METRICS.get(index).copied())
    }

    pub fn scope(&self) -> Option<QueryScope> {
        self.metric()?;
        SCOPES.get((self.0 % SCOPES.len() as i32) as usize).copied()
    }

    /// Method-scoped queries need a method signature.
    pub fn requires_method_signature(&self) -> bool {
        self.scope() == Some(QueryScope::Method)
    }
}

impl std::fmt::Display for ResourceQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.metric(), self.scope()) {
            (Some(metric), Some(scope)) => write!(f, "{:?}/{:?} ({})", metric, scope, self.0),
            _ => write!(f, "query {}", self.0),
        }
    }
}

/// A relocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationRequest {
    /// Move one instance to `dest_node_id`.
    Migrate {
        instance_id: String,
        dest_node_id: String,
    },
    /// Move every instance off the receiving node.
    MigrateAll { dest_node_id: String },
    /// Recreate an instance from captured state on the receiving node.
    Restore {
        instance_id: String,
        service_name: String,
        state: Bytes,
        container_name: Option<String>,
    },
}

impl RelocationRequest {
    pub fn action_type(&self) -> &'static str {
        match self {
            RelocationRequest::Migrate { .. } => "migrate",
            RelocationRequest::MigrateAll { .. } => "migrateAll",
            RelocationRequest::Restore { .. } => "restore",
        }
    }

    /// The field block for this order, in wire order.
    pub(crate) fn field_block(&self, requestor_id: &str) -> FieldBlock {
        let block = FieldBlock::new("relocate", "RELOCATEINFO").field("ActionType", self.action_type());
        let block = match self {
            RelocationRequest::Migrate {
                instance_id,
                dest_node_id,
            } => block
                .field("ServiceInstanceUUID", instance_id)
                .field("DestNodeUUID", dest_node_id),
            RelocationRequest::MigrateAll { dest_node_id } => {
                block.field("DestNodeUUID", dest_node_id)
            }
            RelocationRequest::Restore {
                service_name,
                state,
                container_name,
                ..
            } => block
                .field("ServiceName", service_name)
                .field("StateSize", state.len().to_string())
                .opt_field("VMContainerName", container_name.as_deref()),
        };
        block.field("RequestorUUID", requestor_id)
    }

    /// Captured state wrapped for the wire, for restore orders.
    pub(crate) fn state_envelope(&self) -> Option<Envelope> {
        match self {
            RelocationRequest::Restore {
                instance_id, state, ..
            } => Some(Envelope::single(
                crate::envelope::SERVICE_STATE_TYPE,
                instance_id.as_str(),
                state.clone(),
            )),
            _ => None,
        }
    }
}

/// One `Key value` entry of a field block. Flags carry no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Field {
    pub key: &'static str,
    pub value: Option<String>,
}

/// A request's named field block, rendered as lines or as HTTP headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldBlock {
    pub op: &'static str,
    pub name: &'static str,
    pub fields: Vec<Field>,
}

impl FieldBlock {
    pub fn new(op: &'static str, name: &'static str) -> Self {
        Self {
            op,
            name,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.push(Field {
            key,
            value: Some(value.into()),
        });
        self
    }

    pub fn opt_field(self, key: &'static str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }

    pub fn flag(mut self, key: &'static str, set: bool) -> Self {
        if set {
            self.fields.push(Field { key, value: None });
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.key == key)
            .and_then(|f| f.value.as_deref())
    }
}

/// Requestor id shared by a framer's calls.
#[derive(Debug)]
pub(crate) struct RequestorId(RwLock<String>);

impl RequestorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(RwLock::new(id.into()))
    }

    pub fn get(&self) -> String {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, id: String) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = id;
    }
}

// Field blocks shared by both framings.

pub(crate) fn activate_block(
    requestor: &str,
    node_id: Option<&str>,
    service_name: &str,
    local_only: bool,
) -> FieldBlock {
    FieldBlock::new("activate", "SERVICEINFO")
        .field("ServiceName", service_name)
        .opt_field("NodeUUID", node_id)
        .field("RequestorUUID", requestor)
        .flag("OnLocalNodeOnly", local_only)
}

pub(crate) fn deactivate_block(requestor: &str, node_id: Option<&str>, instance_id: &str) -> FieldBlock {
    FieldBlock::new("deactivate", "DEACTIVATEINFO")
        .field("ServiceInstanceUUID", instance_id)
        .opt_field("NodeUUID", node_id)
        .field("RequestorUUID", requestor)
}

pub(crate) fn deploy_block(requestor: &str, name: &str) -> FieldBlock {
    FieldBlock::new("deploy", "DEPLOYINFO")
        .field("FileName", name)
        .field("RequestorUUID", requestor)
}

pub(crate) fn invoke_block(requestor: &str, call: &InvokeCall<'_>) -> FieldBlock {
    FieldBlock::new("invoke", "INVOKEINFO")
        .field("ServiceInstanceUUID", call.instance_id)
        .field("MethodName", call.method)
        .opt_field("NodeUUID", call.node_id)
        .field("RequestorUUID", requestor)
        .flag("Asynchronous", call.asynchronous)
}

pub(crate) fn lookup_block(requestor: &str, instance_id: &str, old_node_id: Option<&str>) -> FieldBlock {
    FieldBlock::new("lookup", "LOOKUPINFO")
        .field("ServiceInstanceUUID", instance_id)
        .opt_field("OldNodeUUID", old_node_id)
        .field("RequestorUUID", requestor)
}

pub(crate) fn locate_block(requestor: &str, node_id: &str) -> FieldBlock {
    FieldBlock::new("locate", "NODEINFO")
        .field("NodeUUID", node_id)
        .field("RequestorUUID", requestor)
}

pub(crate) fn resinfo_block(
    requestor: &str,
    query: ResourceQuery,
    service_name: &str,
    method_signature: Option<&str>,
) -> FieldBlock {
    FieldBlock::new("resinfo", "RESINFO")
        .field("ServiceName", service_name)
        .field("ResInfoQueryType", query.code().to_string())
        .opt_field("MethodSignature", method_signature)
        .field("RequestorUUID", requestor)
}

/// Interpret a resource-info reply; negative values mean the kernel rejected the query.
pub(crate) fn parse_resource_value(
    conn: &mut Connection,
    text: &str,
    query: ResourceQuery,
    service_name: &str,
) -> Result<f32> {
    let value = match text.trim().parse::<f32>() {
        Ok(value) if value.is_finite() => value,
        _ => return Err(conn.violation("a finite decimal value", text)),
    };
    if value < 0.0 {
        return Err(crate::AciError::InvalidQuery {
            code: query.code(),
            service: service_name.to_string(),
        });
    }
    Ok(value)
}

/// Interpret a node-id reply.
pub(crate) fn parse_node_id(conn: &mut Connection, text: &str) -> Result<String> {
    let node_id = text.trim();
    if node_id.is_empty() {
        return Err(conn.violation("a node id", text));
    }
    Ok(node_id.to_string())
}
