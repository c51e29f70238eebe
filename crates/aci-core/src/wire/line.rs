//! Line-oriented framing.
//!
//! ```text
//! SPEAK invoke/1.0
//! START_INVOKEINFO
//! ServiceInstanceUUID S1
//! MethodName add
//! RequestorUUID C1
//! END_INVOKEINFO
//!                         <- INVOKEINFO_VALID
//! DimeLength 40
//! <40 bytes>
//!                         <- INVOKE_OK
//!                         <- DimeLength 36
//!                         <- <36 bytes>
//! ```

use super::{
    activate_block, deactivate_block, deploy_block, invoke_block, locate_block, lookup_block,
    parse_node_id, parse_resource_value, resinfo_block, Deactivation, FieldBlock, Framer,
    InvokeCall, RelocationRequest, RequestorId, ResourceQuery,
};
use crate::config::{WireConfig, WireProtocol};
use crate::envelope::Envelope;
use crate::locator::{Locator, NodeAddress};
use crate::network::Connection;
use crate::{AciError, Result};
use async_trait::async_trait;
use tracing::debug;

/// Framer for the line protocol.
#[derive(Debug)]
pub struct LineFramer {
    requestor: RequestorId,
}

impl LineFramer {
    pub fn new(requestor_id: impl Into<String>) -> Self {
        Self {
            requestor: RequestorId::new(requestor_id),
        }
    }

    /// Send the command line and field block, then wait for `<NAME>_VALID`.
    async fn send_request(&self, conn: &mut Connection, block: &FieldBlock) -> Result<()> {
        conn.begin(block.op)?;
        conn.send_line(&format!("SPEAK {}/{}", block.op, WireConfig::REQUEST_VERSION))
            .await?;
        conn.send_line(&format!("START_{}", block.name)).await?;
        for field in &block.fields {
            match &field.value {
                Some(value) => conn.send_line(&format!("{} {}", field.key, value)).await?,
                None => conn.send_line(field.key).await?,
            }
        }
        conn.send_line(&format!("END_{}", block.name)).await?;
        conn.receive_match(&format!("{}_VALID", block.name)).await
    }
}

#[async_trait]
impl Framer for LineFramer {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::Line
    }

    fn requestor_id(&self) -> String {
        self.requestor.get()
    }

    fn set_requestor_id(&self, id: String) {
        self.requestor.set(id);
    }

    async fn activate(
        &self,
        conn: &mut Connection,
        node_id: Option<&str>,
        service_name: &str,
        local_only: bool,
    ) -> Result<Locator> {
        let block = activate_block(&self.requestor.get(), node_id, service_name, local_only);
        self.send_request(conn, &block).await?;
        let reference = conn.receive_result_block("ACTIVATION_RESULT").await?;
        Locator::parse(&reference)
    }

    async fn deactivate(
        &self,
        conn: &mut Connection,
        node_id: Option<&str>,
        instance_id: &str,
    ) -> Result<Deactivation> {
        let block = deactivate_block(&self.requestor.get(), node_id, instance_id);
        self.send_request(conn, &block).await?;
        let outcome = conn.receive_line().await?;
        if outcome == "DEACTIVATE_OK" {
            Ok(Deactivation::Removed)
        } else {
            debug!("Deactivation of {} not confirmed: {}", instance_id, outcome);
            Ok(Deactivation::AlreadyAbsent)
        }
    }

    async fn deploy(&self, conn: &mut Connection, name: &str, archive: &Envelope) -> Result<()> {
        let encoded = archive.encode()?;
        let block = deploy_block(&self.requestor.get(), name);
        self.send_request(conn, &block).await?;
        conn.send_blob(&encoded).await?;
        conn.receive_match("DEPLOY_OK").await
    }

    async fn invoke(
        &self,
        conn: &mut Connection,
        call: &InvokeCall<'_>,
    ) -> Result<Option<Envelope>> {
        let encoded = call.args.encode()?;
        let block = invoke_block(&self.requestor.get(), call);
        self.send_request(conn, &block).await?;
        conn.send_blob(&encoded).await?;

        if call.asynchronous {
            conn.flush().await?;
            return Ok(None);
        }

        conn.receive_match("INVOKE_OK").await?;
        let result = conn.receive_blob().await?;
        if result.is_empty() {
            return Err(AciError::EmptyOrCorruptResult {
                instance_id: call.instance_id.to_string(),
                method: call.method.to_string(),
            });
        }
        Ok(Some(result))
    }

    async fn lookup(
        &self,
        conn: &mut Connection,
        instance_id: &str,
        old_node_id: Option<&str>,
    ) -> Result<String> {
        let block = lookup_block(&self.requestor.get(), instance_id, old_node_id);
        self.send_request(conn, &block).await?;
        let node_id = conn.receive_result_block("LOOKUP_RESULT").await?;
        parse_node_id(conn, &node_id)
    }

    async fn node_location(&self, conn: &mut Connection, node_id: &str) -> Result<NodeAddress> {
        let block = locate_block(&self.requestor.get(), node_id);
        self.send_request(conn, &block).await?;
        let address = conn.receive_result_block("LOCATION_RESULT").await?;
        NodeAddress::parse(&address).map_err(|_| conn.violation("host:port", address))
    }

    async fn resource_info(
        &self,
        conn: &mut Connection,
        query: ResourceQuery,
        service_name: &str,
        method_signature: Option<&str>,
    ) -> Result<f32> {
        let block = resinfo_block(&self.requestor.get(), query, service_name, method_signature);
        self.send_request(conn, &block).await?;
        let value = conn.receive_result_block("RESINFO_RESULT").await?;
        parse_resource_value(conn, &value, query, service_name)
    }

    async fn relocate(&self, conn: &mut Connection, request: &RelocationRequest) -> Result<()> {
        let state = match request.state_envelope() {
            Some(envelope) => Some(envelope.encode()?),
            None => None,
        };
        let block = request.field_block(&self.requestor.get());
        self.send_request(conn, &block).await?;

        if let Some(encoded) = state {
            conn.send_line("START_RELOCATESERVICE").await?;
            conn.send_blob(&encoded).await?;
            conn.send_line("END_RELOCATESERVICE").await?;
        }
        conn.receive_match("RELOCATE_OK").await
    }
}
