//! One authenticated byte stream to a kernel.
//!
//! A [`Connection`] is bound to a single endpoint and carries the line and blob
//! primitives both wire framings are built from. Every read honours the
//! optional read timeout; expiry surfaces as [`AciError::Timeout`].
//!
//! Any failure that can leave unread bytes on the stream (an I/O error, a
//! timeout, a protocol violation) drops the connection to
//! [`ConnectionState::Disconnected`]. The manager then opens a fresh one on the
//! next checkout instead of reading a reply meant for an earlier request.
//!
//! # Thread Safety
//!
//! A connection serves one request/response exchange at a time. The
//! connection manager hands it out behind a tokio `Mutex` held for the whole
//! exchange.

use crate::config::{KernelConfig, NetworkConfig, WireConfig};
use crate::envelope::Envelope;
use crate::locator::NodeAddress;
use crate::{AciError, Result};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Any bidirectional byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Transport for T {}

/// Which kernel a connection talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    /// The kernel at the configured default address.
    LocalKernel,
    /// A node resolved through the local kernel.
    Node(String),
}

/// A peer together with the address it was reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub peer: Peer,
    pub address: NodeAddress,
}

impl Endpoint {
    pub fn local(address: NodeAddress) -> Self {
        Self {
            peer: Peer::LocalKernel,
            address,
        }
    }

    pub fn node(node_id: impl Into<String>, address: NodeAddress) -> Self {
        Self {
            peer: Peer::Node(node_id.into()),
            address,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.peer {
            Peer::LocalKernel => write!(f, "local kernel at {}", self.address),
            Peer::Node(id) => write!(f, "node {} at {}", id, self.address),
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Authenticated,
}

/// A transport connection to one kernel.
pub struct Connection {
    endpoint: Endpoint,
    stream: BufStream<Box<dyn Transport>>,
    state: ConnectionState,
    read_timeout: Option<Duration>,
    peer_node_id: Option<String>,
    op: &'static str,
    unflushed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("read_timeout", &self.read_timeout)
            .field("peer_node_id", &self.peer_node_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a TCP connection to an endpoint.
    ///
    /// Uses the configured connection timeout from `NetworkConfig`.
    pub async fn open(endpoint: Endpoint, read_timeout: Option<Duration>) -> Result<Self> {
        let target = (endpoint.address.host.as_str(), endpoint.address.port);
        let stream = tokio::time::timeout(NetworkConfig::CONNECT_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| AciError::Timeout {
                op: "connect".into(),
                endpoint: endpoint.to_string(),
                timeout: NetworkConfig::CONNECT_TIMEOUT,
            })?
            .map_err(|e| AciError::Transport {
                op: "connect".into(),
                endpoint: endpoint.to_string(),
                message: e.to_string(),
                source: Some(e),
            })?;
        stream.set_nodelay(true).ok();

        debug!("Connected to {}", endpoint);
        Ok(Self::from_stream(endpoint, stream, read_timeout))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(
        endpoint: Endpoint,
        stream: impl Transport + 'static,
        read_timeout: Option<Duration>,
    ) -> Self {
        let boxed: Box<dyn Transport> = Box::new(stream);
        Self {
            endpoint,
            stream: BufStream::new(boxed),
            state: ConnectionState::Connected,
            read_timeout,
            peer_node_id: None,
            op: "connect",
            unflushed: false,
        }
    }

    /// Run the one-shot greeting exchange and return the peer's node id.
    pub async fn authenticate(&mut self) -> Result<String> {
        if self.state == ConnectionState::Authenticated {
            if let Some(id) = &self.peer_node_id {
                return Ok(id.clone());
            }
        }
        self.op = "authenticate";
        self.send_line(KernelConfig::PROTOCOL_VERSION).await?;
        let greeting = self.receive_line().await?;

        let node_id = greeting
            .strip_prefix(KernelConfig::WELCOME_PREFIX)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AciError::AuthenticationFailed {
                endpoint: self.endpoint.to_string(),
                message: format!(
                    "expected a greeting starting with {:?}, received {:?}",
                    KernelConfig::WELCOME_PREFIX,
                    greeting
                ),
            })?
            .to_string();

        debug!("Authenticated with {} (peer node {})", self.endpoint, node_id);
        self.state = ConnectionState::Authenticated;
        self.peer_node_id = Some(node_id.clone());
        Ok(node_id)
    }

    /// Start an application exchange; fails unless authenticated.
    pub fn begin(&mut self, op: &'static str) -> Result<()> {
        if self.state != ConnectionState::Authenticated {
            return Err(AciError::AuthenticationFailed {
                endpoint: self.endpoint.to_string(),
                message: format!("connection is {:?}, cannot run {}", self.state, op),
            });
        }
        self.op = op;
        trace!("{} on {}", op, self.endpoint);
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_node_id(&self) -> Option<&str> {
        self.peer_node_id.as_deref()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Name of the exchange in progress, used for error context.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Shut the stream down. Errors are ignored; the connection is dropped anyway.
    pub async fn close(&mut self) {
        self.stream.shutdown().await.ok();
        self.state = ConnectionState::Disconnected;
    }

    /// Stop trusting the stream; the next checkout reconnects.
    pub fn abandon(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!("Abandoning connection to {} after a failed {}", self.endpoint, self.op);
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Pass a result through, abandoning the connection on failure.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.abandon();
        }
        result
    }

    // Writing

    /// Queue a CRLF-terminated line.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("-> {}", line);
        let mut framed = Vec::with_capacity(line.len() + 2);
        framed.extend_from_slice(line.as_bytes());
        framed.extend_from_slice(b"\r\n");
        self.write_bytes(&framed).await
    }

    /// Queue raw bytes.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(e) = self.stream.write_all(bytes).await {
            let err = self.transport_error(e);
            return self.check(Err(err));
        }
        self.unflushed = true;
        Ok(())
    }

    /// Push queued bytes to the peer.
    pub async fn flush(&mut self) -> Result<()> {
        if let Err(e) = self.stream.flush().await {
            let err = self.transport_error(e);
            return self.check(Err(err));
        }
        self.unflushed = false;
        Ok(())
    }

    /// Send `DimeLength <n>` followed by the encoded envelope.
    pub async fn send_blob(&mut self, encoded: &[u8]) -> Result<()> {
        self.send_line(&format!("DimeLength {}", encoded.len())).await?;
        self.write_bytes(encoded).await
    }

    // Reading

    /// Read one line, without its terminator.
    pub async fn receive_line(&mut self) -> Result<String> {
        self.flush_pending().await?;

        let mut raw = Vec::new();
        let limit = WireConfig::MAX_LINE_LENGTH as u64;
        let read = with_deadline(
            &self.endpoint,
            self.op,
            self.read_timeout,
            (&mut self.stream).take(limit).read_until(b'\n', &mut raw),
        )
        .await;
        let read = self.check(read)?;

        if read == 0 {
            let err = self.closed_error();
            return self.check(Err(err));
        }
        if raw.last() != Some(&b'\n') {
            if raw.len() as u64 >= limit {
                return Err(self.violation(
                    "a line terminator",
                    format!("a line longer than {} bytes", limit),
                ));
            }
            let err = self.closed_error();
            return self.check(Err(err));
        }

        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        trace!("<- {}", line);
        Ok(line)
    }

    /// Read a line that must equal `expected`.
    ///
    /// A failure token from the peer becomes [`AciError::Remote`]; any other
    /// mismatch is a protocol violation.
    pub async fn receive_match(&mut self, expected: &str) -> Result<()> {
        let line = self.receive_line().await?;
        if line == expected {
            return Ok(());
        }
        Err(self.unexpected(expected, line))
    }

    /// Read `START_<name>`, one value line and `END_<name>`.
    pub async fn receive_result_block(&mut self, name: &str) -> Result<String> {
        self.receive_match(&format!("START_{}", name)).await?;
        let value = self.receive_line().await?;
        self.receive_match(&format!("END_{}", name)).await?;
        Ok(value)
    }

    /// Read `DimeLength <n>` and the envelope that follows.
    pub async fn receive_blob(&mut self) -> Result<Envelope> {
        let line = self.receive_line().await?;
        let len = line
            .strip_prefix("DimeLength")
            .and_then(|n| n.trim().parse::<usize>().ok());
        match len {
            Some(len) => self.read_envelope(len).await,
            None => Err(self.unexpected("DimeLength <n>", line)),
        }
    }

    /// Read exactly `len` bytes holding an encoded envelope.
    pub async fn read_envelope(&mut self, len: usize) -> Result<Envelope> {
        self.flush_pending().await?;
        if len > WireConfig::MAX_ENVELOPE_SIZE {
            return self.check(Err(AciError::Envelope {
                message: format!(
                    "declared envelope length {} exceeds maximum {}",
                    len,
                    WireConfig::MAX_ENVELOPE_SIZE
                ),
            }));
        }

        let mut body = (&mut self.stream).take(len as u64);
        let decoded = with_deadline(&self.endpoint, self.op, self.read_timeout, async {
            let envelope = Envelope::read_from(&mut body, len).await?;
            // Skip anything the declared length covers past the final record
            tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            if body.limit() > 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside an envelope",
                ));
            }
            Ok(envelope)
        })
        .await;
        self.check(decoded)
    }

    /// Read exactly `len` raw bytes, at most `limit`.
    pub async fn read_exact_bytes(&mut self, len: usize, limit: usize) -> Result<Vec<u8>> {
        self.flush_pending().await?;
        if len > limit {
            return Err(self.violation(
                format!("a body of at most {} bytes", limit),
                format!("a declared length of {} bytes", len),
            ));
        }
        let mut buf = vec![0u8; len];
        let read = with_deadline(
            &self.endpoint,
            self.op,
            self.read_timeout,
            self.stream.read_exact(&mut buf),
        )
        .await;
        self.check(read)?;
        Ok(buf)
    }

    async fn flush_pending(&mut self) -> Result<()> {
        if self.unflushed {
            self.flush().await?;
        }
        Ok(())
    }

    // Error construction

    pub(crate) fn transport_error(&self, e: io::Error) -> AciError {
        io_error(&self.endpoint, self.op, e)
    }

    fn closed_error(&self) -> AciError {
        AciError::Transport {
            op: self.op.to_string(),
            endpoint: self.endpoint.to_string(),
            message: "connection closed by peer".into(),
            source: None,
        }
    }

    /// A protocol violation naming what was expected and what arrived. The
    /// stream is out of step with the grammar, so the connection is abandoned.
    pub fn violation(&mut self, expected: impl Into<String>, received: impl Into<String>) -> AciError {
        self.abandon();
        AciError::ProtocolViolation {
            op: self.op.to_string(),
            endpoint: self.endpoint.to_string(),
            expected: expected.into(),
            received: received.into(),
        }
    }

    /// A failure reported by the peer.
    pub fn remote(&self, message: impl Into<String>) -> AciError {
        AciError::Remote {
            op: self.op.to_string(),
            endpoint: self.endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Classify a line that did not match the grammar.
    pub fn unexpected(&mut self, expected: &str, received: String) -> AciError {
        if is_failure_line(&received) {
            self.remote(received)
        } else {
            self.violation(expected, received)
        }
    }
}

/// Whether a reply line is a failure token (`ERROR ...` or `<OP>_FAILED ...`).
pub fn is_failure_line(line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or_default();
    first.starts_with("ERROR") || first.ends_with("_FAILED")
}

fn io_error(endpoint: &Endpoint, op: &str, e: io::Error) -> AciError {
    if e.kind() == io::ErrorKind::InvalidData {
        return AciError::Envelope {
            message: format!("{} from {}: {}", op, endpoint, e),
        };
    }
    AciError::Transport {
        op: op.to_string(),
        endpoint: endpoint.to_string(),
        message: e.to_string(),
        source: Some(e),
    }
}

async fn with_deadline<T>(
    endpoint: &Endpoint,
    op: &str,
    timeout: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(AciError::Timeout {
                    op: op.to_string(),
                    endpoint: endpoint.to_string(),
                    timeout: limit,
                })
            }
        },
        None => fut.await,
    };
    outcome.map_err(|e| io_error(endpoint, op, e))
}
