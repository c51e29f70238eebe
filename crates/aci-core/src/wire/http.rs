//! HTTP/1.1 framing of the operation set.
//!
//! Each exchange is a POST whose path names the service, instance or
//! operation. Field-block entries travel as headers (flags as `true`); a
//! `100 Continue` stands in for `<NAME>_VALID` and `200 OK` for `<OP>_OK`.
//! Text results arrive as an XML-ish body whose markup is stripped.

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
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("markup tag regex must compile"));

const STATUS_CONTINUE: u16 = 100;
const STATUS_OK: u16 = 200;

/// Most headers accepted on one response.
const MAX_HEADERS: usize = 32;

/// Content type of a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body<'a> {
    None,
    Dime(&'a [u8]),
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResponseHead {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Framer for the HTTP encapsulation.
#[derive(Debug)]
pub struct HttpFramer {
    requestor: RequestorId,
}

impl HttpFramer {
    pub fn new(requestor_id: impl Into<String>) -> Self {
        Self {
            requestor: RequestorId::new(requestor_id),
        }
    }

    /// Send the request head and, when there is a body, pass the `100` gate and
    /// queue the body.
    async fn send_request(
        &self,
        conn: &mut Connection,
        block: &FieldBlock,
        action: &str,
        path: &str,
        body: Body<'_>,
    ) -> Result<()> {
        conn.begin(block.op)?;
        conn.send_line(&format!("POST /{} HTTP/1.1", urlencoding::encode(path)))
            .await?;
        conn.send_line(&format!("Host: {}", conn.endpoint().address))
            .await?;
        conn.send_line(&format!("Action: {}", action)).await?;
        for field in &block.fields {
            let value = field.value.as_deref().unwrap_or("true");
            conn.send_line(&format!("{}: {}", field.key, value)).await?;
        }

        match body {
            Body::None => {
                conn.send_line("Content-Length: 0").await?;
                conn.send_line("").await
            }
            Body::Dime(bytes) => {
                conn.send_line("Content-Type: dime").await?;
                conn.send_line(&format!("Content-Length: {}", bytes.len()))
                    .await?;
                conn.send_line("Expect: 100-continue").await?;
                conn.send_line("").await?;
                expect_status(conn, STATUS_CONTINUE).await?;
                conn.write_bytes(bytes).await
            }
        }
    }

    /// Await `200 OK` and return its body as text with markup stripped.
    async fn text_result(&self, conn: &mut Connection) -> Result<String> {
        let head = expect_status(conn, STATUS_OK).await?;
        let body = read_body(conn, &head).await?;
        Ok(strip_markup(&String::from_utf8_lossy(&body)))
    }
}

#[async_trait]
impl Framer for HttpFramer {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::Http
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
        let action = if local_only { "activate_locally" } else { "activate" };
        self.send_request(conn, &block, action, service_name, Body::None)
            .await?;
        let reference = self.text_result(conn).await?;
        Locator::parse(&reference)
    }

    async fn deactivate(
        &self,
        conn: &mut Connection,
        node_id: Option<&str>,
        instance_id: &str,
    ) -> Result<Deactivation> {
        let block = deactivate_block(&self.requestor.get(), node_id, instance_id);
        self.send_request(conn, &block, "deactivate", instance_id, Body::None)
            .await?;
        let head = read_head(conn).await?;
        read_body(conn, &head).await?;
        if head.status == STATUS_OK {
            Ok(Deactivation::Removed)
        } else {
            debug!(
                "Deactivation of {} not confirmed: {} {}",
                instance_id, head.status, head.reason
            );
            Ok(Deactivation::AlreadyAbsent)
        }
    }

    async fn deploy(&self, conn: &mut Connection, name: &str, archive: &Envelope) -> Result<()> {
        let encoded = archive.encode()?;
        let block = deploy_block(&self.requestor.get(), name);
        self.send_request(conn, &block, "deploy", name, Body::Dime(&encoded))
            .await?;
        let head = expect_status(conn, STATUS_OK).await?;
        read_body(conn, &head).await?;
        Ok(())
    }

    async fn invoke(
        &self,
        conn: &mut Connection,
        call: &InvokeCall<'_>,
    ) -> Result<Option<Envelope>> {
        let encoded = call.args.encode()?;
        let block = invoke_block(&self.requestor.get(), call);
        self.send_request(conn, &block, "invoke", call.instance_id, Body::Dime(&encoded))
            .await?;

        if call.asynchronous {
            conn.flush().await?;
            return Ok(None);
        }

        let head = expect_status(conn, STATUS_OK).await?;
        let len = content_length(conn, &head)?;
        if len > WireConfig::MAX_ENVELOPE_SIZE {
            return Err(conn.violation(
                format!("a result of at most {} bytes", WireConfig::MAX_ENVELOPE_SIZE),
                format!("Content-Length {}", len),
            ));
        }
        let result = conn.read_envelope(len).await?;
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
        self.send_request(conn, &block, "lookup", "lookupService", Body::None)
            .await?;
        let node_id = self.text_result(conn).await?;
        parse_node_id(conn, &node_id)
    }

    async fn node_location(&self, conn: &mut Connection, node_id: &str) -> Result<NodeAddress> {
        let block = locate_block(&self.requestor.get(), node_id);
        self.send_request(conn, &block, "locate", "getNodeLocation", Body::None)
            .await?;
        let address = self.text_result(conn).await?;
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
        self.send_request(conn, &block, "resinfo", "getResourceInfo", Body::None)
            .await?;
        let value = self.text_result(conn).await?;
        parse_resource_value(conn, &value, query, service_name)
    }

    async fn relocate(&self, conn: &mut Connection, request: &RelocationRequest) -> Result<()> {
        let block = request.field_block(&self.requestor.get());
        let path = match request {
            RelocationRequest::Migrate { instance_id, .. }
            | RelocationRequest::Restore { instance_id, .. } => instance_id.as_str(),
            RelocationRequest::MigrateAll { .. } => "relocate",
        };

        match request.state_envelope() {
            Some(envelope) => {
                let encoded = envelope.encode()?;
                self.send_request(conn, &block, "relocate", path, Body::Dime(&encoded))
                    .await?
            }
            None => {
                self.send_request(conn, &block, "relocate", path, Body::None)
                    .await?
            }
        }

        let head = expect_status(conn, STATUS_OK).await?;
        read_body(conn, &head).await?;
        Ok(())
    }
}

/// Read a status line and header block.
///
/// Lines are fed to `httparse` as they arrive, so a stream that is not HTTP
/// fails on its first line rather than at the read timeout.
async fn read_head(conn: &mut Connection) -> Result<ResponseHead> {
    let mut raw = Vec::new();
    loop {
        let line = conn.receive_line().await?;
        raw.extend_from_slice(line.as_bytes());
        raw.extend_from_slice(b"\r\n");
        match parse_head(&raw) {
            Ok(Some(head)) => return Ok(head),
            Ok(None) => continue,
            Err(e) => {
                let received = format!("{:?} ({})", String::from_utf8_lossy(&raw).trim_end(), e);
                return Err(conn.violation("an HTTP response head", received));
            }
        }
    }
}

/// Parse a buffered head; `None` until the blank line has arrived.
fn parse_head(raw: &[u8]) -> std::result::Result<Option<ResponseHead>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    if response.parse(raw)?.is_partial() {
        return Ok(None);
    }
    Ok(Some(ResponseHead {
        status: response.code.unwrap_or_default(),
        reason: response.reason.unwrap_or_default().to_string(),
        headers: response
            .headers
            .iter()
            .map(|h| {
                let value = String::from_utf8_lossy(h.value).trim().to_string();
                (h.name.to_string(), value)
            })
            .collect(),
    }))
}

/// Read a response head that must carry `expected`; any other status is
/// surfaced as a remote failure carrying code, reason and body text.
async fn expect_status(conn: &mut Connection, expected: u16) -> Result<ResponseHead> {
    let head = read_head(conn).await?;
    if head.status == expected {
        return Ok(head);
    }

    if head.status < 400 {
        return Err(conn.violation(
            format!("HTTP {}", expected),
            format!("HTTP {} {}", head.status, head.reason),
        ));
    }

    let body = read_body(conn, &head).await?;
    let detail = strip_markup(&String::from_utf8_lossy(&body));
    let message = if detail.is_empty() {
        format!("{} {}", head.status, head.reason)
    } else {
        format!("{} {}: {}", head.status, head.reason, detail)
    };
    Err(conn.remote(message))
}

fn content_length(conn: &mut Connection, head: &ResponseHead) -> Result<usize> {
    match head.header("Content-Length") {
        None => Ok(0),
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| conn.violation("a numeric Content-Length", value)),
    }
}

/// Read a text body; these carry a reference, a value or an error message.
async fn read_body(conn: &mut Connection, head: &ResponseHead) -> Result<Vec<u8>> {
    let len = content_length(conn, head)?;
    if len == 0 {
        return Ok(Vec::new());
    }
    conn.read_exact_bytes(len, WireConfig::MAX_LINE_LENGTH).await
}

fn strip_markup(text: &str) -> String {
    MARKUP_TAG.replace_all(text, "").trim().to_string()
}
