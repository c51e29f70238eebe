//! In-process fake fabric for integration tests.
//!
//! Every node is a TCP listener speaking the line protocol, or HTTP for a
//! fabric built with [`Fabric::http`]. All nodes share one placement table, so
//! moving an instance between nodes is a table update.

#![allow(dead_code)]

use aci_core::envelope::OBJECT_TYPE;
use aci_core::{ClientConfig, Envelope, NodeAddress, WireProtocol};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// One request as the kernel saw it.
#[derive(Debug, Clone)]
pub struct Request {
    pub node: String,
    pub op: String,
    pub fields: Vec<(String, String)>,
    /// Request path, for HTTP requests.
    pub path: Option<String>,
}

impl Request {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_flag(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }
}

#[derive(Debug, Default)]
struct FabricState {
    http: bool,
    placements: HashMap<String, String>,
    addresses: HashMap<String, String>,
    lookup_overrides: HashMap<String, String>,
    activation_node: Option<String>,
    next_instance: usize,
    requests: Vec<Request>,
    lookups: Vec<(String, Option<String>)>,
    connections: HashMap<String, usize>,
    drop_next: HashMap<String, usize>,
    dropped: HashMap<String, usize>,
    delay_next: HashMap<String, (usize, Duration)>,
    deployed: Vec<(String, usize)>,
    restored: Vec<(String, Vec<u8>)>,
}

/// Shared state of every fake node.
#[derive(Debug, Clone, Default)]
pub struct Fabric {
    state: Arc<Mutex<FabricState>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fabric whose nodes speak HTTP.
    pub fn http() -> Self {
        let fabric = Self::default();
        fabric.state().http = true;
        fabric
    }

    pub fn protocol(&self) -> WireProtocol {
        if self.state().http {
            WireProtocol::Http
        } else {
            WireProtocol::Line
        }
    }

    /// Start a node and register its address for `locate`.
    pub async fn spawn_node(&self, node_id: &str) -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = NodeAddress::new("127.0.0.1", port);
        self.state()
            .addresses
            .insert(node_id.to_string(), address.to_string());

        let fabric = self.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let fabric = fabric.clone();
                let node_id = node_id.clone();
                tokio::spawn(async move {
                    fabric.serve(stream, &node_id).await;
                });
            }
        });
        address
    }

    pub fn place(&self, instance_id: &str, node_id: &str) {
        self.state()
            .placements
            .insert(instance_id.to_string(), node_id.to_string());
    }

    pub fn placement(&self, instance_id: &str) -> Option<String> {
        self.state().placements.get(instance_id).cloned()
    }

    /// Make `lookup` answer `node_id` for an instance, wherever it runs.
    pub fn override_lookup(&self, instance_id: &str, node_id: &str) {
        self.state()
            .lookup_overrides
            .insert(instance_id.to_string(), node_id.to_string());
    }

    /// Node that receives activations made without an explicit node.
    pub fn activate_on(&self, node_id: &str) {
        self.state().activation_node = Some(node_id.to_string());
    }

    /// Close the connection after reading the command line of the next `count`
    /// requests to `node_id`.
    pub fn drop_next(&self, node_id: &str, count: usize) {
        self.state().drop_next.insert(node_id.to_string(), count);
    }

    /// Hold the reply to the next `count` requests to `node_id` for `delay`.
    pub fn delay_next(&self, node_id: &str, count: usize, delay: Duration) {
        self.state()
            .delay_next
            .insert(node_id.to_string(), (count, delay));
    }

    pub fn dropped(&self, node_id: &str) -> usize {
        self.state().dropped.get(node_id).copied().unwrap_or(0)
    }

    pub fn connections_to(&self, node_id: &str) -> usize {
        self.state().connections.get(node_id).copied().unwrap_or(0)
    }

    pub fn lookups(&self) -> Vec<(String, Option<String>)> {
        self.state().lookups.clone()
    }

    pub fn requests_to(&self, node_id: &str) -> Vec<Request> {
        self.state()
            .requests
            .iter()
            .filter(|r| r.node == node_id)
            .cloned()
            .collect()
    }

    pub fn ops_on(&self, node_id: &str) -> Vec<String> {
        self.requests_to(node_id).into_iter().map(|r| r.op).collect()
    }

    pub fn deployed(&self) -> Vec<(String, usize)> {
        self.state().deployed.clone()
    }

    pub fn restored(&self) -> Vec<(String, Vec<u8>)> {
        self.state().restored.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FabricState> {
        self.state.lock().unwrap()
    }

    async fn serve(&self, stream: TcpStream, node_id: &str) {
        let http = {
            let mut state = self.state();
            *state.connections.entry(node_id.to_string()).or_default() += 1;
            state.http
        };

        let mut io = BufReader::new(stream);
        if read_line(&mut io).await.as_deref() != Some("ACI/1.0") {
            return;
        }
        write(&mut io, &format!("WELCOME to {}\r\n", node_id)).await;

        if http {
            self.serve_http(&mut io, node_id).await
        } else {
            self.serve_line(&mut io, node_id).await
        }
    }

    async fn serve_line(&self, io: &mut BufReader<TcpStream>, node_id: &str) {
        while let Some(command) = read_line(io).await {
            if self.take_drop(node_id) {
                return;
            }
            let op = match command
                .strip_prefix("SPEAK ")
                .and_then(|rest| rest.strip_suffix("/1.0"))
            {
                Some(op) => op.to_string(),
                None => {
                    write(io, "ERROR unknown command\r\n").await;
                    continue;
                }
            };
            let Some(start) = read_line(io).await else {
                return;
            };
            let name = start.trim_start_matches("START_").to_string();
            let end = format!("END_{}", name);
            let mut fields = Vec::new();
            loop {
                let Some(line) = read_line(io).await else {
                    return;
                };
                if line == end {
                    break;
                }
                let (key, value) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                fields.push((key.to_string(), value.to_string()));
            }

            let request = Request {
                node: node_id.to_string(),
                op,
                fields,
                path: None,
            };
            self.receive(&request).await;
            if !self.answer_line(io, &request, &name).await {
                return;
            }
        }
    }

    async fn serve_http(&self, io: &mut BufReader<TcpStream>, node_id: &str) {
        while let Some(request_line) = read_line(io).await {
            if request_line.is_empty() {
                continue;
            }
            if self.take_drop(node_id) {
                return;
            }
            let path = request_line.split(' ').nth(1).unwrap_or_default().to_string();
            let mut headers = Vec::new();
            loop {
                let Some(line) = read_line(io).await else {
                    return;
                };
                if line.is_empty() {
                    break;
                }
                let (key, value) = line.split_once(": ").unwrap_or((line.as_str(), ""));
                headers.push((key.to_string(), value.to_string()));
            }

            let header = |name: &str| {
                headers
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.clone())
            };
            let op = match header("Action").as_deref() {
                Some("activate_locally") => "activate".to_string(),
                Some(action) => action.to_string(),
                None => String::new(),
            };
            let length: usize = header("Content-Length")
                .and_then(|len| len.parse().ok())
                .unwrap_or(0);
            let fields = headers
                .iter()
                .filter(|(key, _)| {
                    !matches!(
                        key.as_str(),
                        "Host" | "Action" | "Content-Type" | "Content-Length" | "Expect"
                    )
                })
                .cloned()
                .collect();

            let request = Request {
                node: node_id.to_string(),
                op,
                fields,
                path: Some(path),
            };
            self.receive(&request).await;
            if !self.answer_http(io, &request, length).await {
                return;
            }
        }
    }

    /// Log a request and hold it if a delay is pending.
    async fn receive(&self, request: &Request) {
        let delay = {
            let mut state = self.state();
            state.requests.push(request.clone());
            match state.delay_next.get_mut(&request.node) {
                Some((remaining, delay)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*delay)
                }
                _ => None,
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_drop(&self, node_id: &str) -> bool {
        let mut state = self.state();
        let remaining = state.drop_next.get(node_id).copied().unwrap_or(0);
        if remaining == 0 {
            return false;
        }
        state.drop_next.insert(node_id.to_string(), remaining - 1);
        *state.dropped.entry(node_id.to_string()).or_default() += 1;
        true
    }

    // What each node does, independent of framing

    fn activate(&self, request: &Request) -> String {
        let mut state = self.state();
        state.next_instance += 1;
        let instance = format!("S{}", state.next_instance);
        let host = request
            .field("NodeUUID")
            .map(str::to_string)
            .or_else(|| state.activation_node.clone())
            .unwrap_or_else(|| request.node.clone());
        state.placements.insert(instance.clone(), host.clone());
        format!("acil://{}|{}|", instance, host)
    }

    fn deactivate(&self, instance: &str) -> bool {
        self.state().placements.remove(instance).is_some()
    }

    fn hosts(&self, instance: &str, node: &str) -> bool {
        self.placement(instance).as_deref() == Some(node)
    }

    fn lookup(&self, request: &Request, instance: &str) -> Option<String> {
        let mut state = self.state();
        let old = request.field("OldNodeUUID").map(str::to_string);
        state.lookups.push((instance.to_string(), old));
        state
            .lookup_overrides
            .get(instance)
            .or_else(|| state.placements.get(instance))
            .cloned()
    }

    fn locate(&self, request: &Request) -> Option<String> {
        let target = request.field("NodeUUID").unwrap_or_default();
        self.state().addresses.get(target).cloned()
    }

    fn resinfo(request: &Request) -> &'static str {
        let code: i32 = request
            .field("ResInfoQueryType")
            .and_then(|c| c.parse().ok())
            .unwrap_or(-1);
        if (0..12).contains(&code) {
            "0.5"
        } else {
            "-1"
        }
    }

    fn deploy(&self, request: &Request, archive: &Envelope) {
        let size = archive.records().first().map(|r| r.payload.len()).unwrap_or(0);
        let file = request.field("FileName").unwrap_or_default().to_string();
        self.state().deployed.push((file, size));
    }

    fn invoke(request: &Request, args: &Envelope) -> Envelope {
        let method = request.field("MethodName").unwrap_or_default();
        if method == "empty" {
            return Envelope::new();
        }
        let value = evaluate(method, args, &request.node);
        Envelope::single(OBJECT_TYPE, method, serde_json::to_vec(&value).unwrap())
    }

    fn migrate(&self, request: &Request) -> bool {
        let instance = request.field("ServiceInstanceUUID").unwrap_or_default();
        let dest = request.field("DestNodeUUID").unwrap_or_default().to_string();
        match self.state().placements.get_mut(instance) {
            Some(host) => {
                *host = dest;
                true
            }
            None => false,
        }
    }

    fn migrate_all(&self, request: &Request) {
        let dest = request.field("DestNodeUUID").unwrap_or_default();
        let mut state = self.state();
        for host in state.placements.values_mut().filter(|h| **h == request.node) {
            *host = dest.to_string();
        }
    }

    fn restore(&self, request: &Request, state: &Envelope) -> bool {
        let Some(record) = state.records().first() else {
            return false;
        };
        let mut fabric = self.state();
        fabric.placements.insert(record.id.clone(), request.node.clone());
        fabric
            .restored
            .push((record.id.clone(), record.payload.to_vec()));
        true
    }

    // Line framing

    /// Reply to one request. Returns false when the stream is unusable.
    async fn answer_line(&self, io: &mut BufReader<TcpStream>, request: &Request, name: &str) -> bool {
        let instance = request.field("ServiceInstanceUUID").unwrap_or_default().to_string();

        match request.op.as_str() {
            "activate" => {
                let reference = self.activate(request);
                write(io, &format!("{}_VALID\r\n", name)).await;
                write(io, &result_block("ACTIVATION_RESULT", &reference)).await;
            }
            "deactivate" => {
                let outcome = if self.deactivate(&instance) {
                    "DEACTIVATE_OK"
                } else {
                    "DEACTIVATE_FAILED instance not found"
                };
                write(io, &format!("{}_VALID\r\n{}\r\n", name, outcome)).await;
            }
            "deploy" => {
                write(io, &format!("{}_VALID\r\n", name)).await;
                let Some(archive) = read_blob(io).await else {
                    return false;
                };
                self.deploy(request, &archive);
                write(io, "DEPLOY_OK\r\n").await;
            }
            "invoke" => {
                if !self.hosts(&instance, &request.node) {
                    write(io, &format!("{}_FAILED 404 instance {} not found\r\n", name, instance)).await;
                    return true;
                }
                write(io, &format!("{}_VALID\r\n", name)).await;
                let Some(args) = read_blob(io).await else {
                    return false;
                };
                if request.has_flag("Asynchronous") {
                    return true;
                }
                let encoded = Self::invoke(request, &args).encode().unwrap();
                write(io, &format!("INVOKE_OK\r\nDimeLength {}\r\n", encoded.len())).await;
                io.get_mut().write_all(&encoded).await.unwrap();
            }
            "lookup" => match self.lookup(request, &instance) {
                Some(host) => {
                    write(io, &format!("{}_VALID\r\n", name)).await;
                    write(io, &result_block("LOOKUP_RESULT", &host)).await;
                }
                None => write(io, &format!("{}_FAILED instance not found\r\n", name)).await,
            },
            "locate" => match self.locate(request) {
                Some(address) => {
                    write(io, &format!("{}_VALID\r\n", name)).await;
                    write(io, &result_block("LOCATION_RESULT", &address)).await;
                }
                None => write(io, &format!("{}_FAILED unknown node\r\n", name)).await,
            },
            "resinfo" => {
                write(io, &format!("{}_VALID\r\n", name)).await;
                write(io, &result_block("RESINFO_RESULT", Self::resinfo(request))).await;
            }
            "relocate" => return self.relocate_line(io, request, name).await,
            _ => write(io, &format!("{}_FAILED unsupported\r\n", name)).await,
        }
        true
    }

    async fn relocate_line(&self, io: &mut BufReader<TcpStream>, request: &Request, name: &str) -> bool {
        match request.field("ActionType").unwrap_or_default() {
            "migrate" => {
                if !self.migrate(request) {
                    let instance = request.field("ServiceInstanceUUID").unwrap_or_default();
                    write(io, &format!("{}_FAILED instance {} not found\r\n", name, instance)).await;
                    return true;
                }
                write(io, &format!("{}_VALID\r\n", name)).await;
            }
            "migrateAll" => {
                self.migrate_all(request);
                write(io, &format!("{}_VALID\r\n", name)).await;
            }
            "restore" => {
                write(io, &format!("{}_VALID\r\n", name)).await;
                if read_line(io).await.as_deref() != Some("START_RELOCATESERVICE") {
                    return false;
                }
                let Some(state) = read_blob(io).await else {
                    return false;
                };
                if read_line(io).await.as_deref() != Some("END_RELOCATESERVICE") {
                    return false;
                }
                if !self.restore(request, &state) {
                    write(io, "RELOCATE_FAILED empty state\r\n").await;
                    return true;
                }
            }
            other => {
                write(io, &format!("{}_FAILED unknown action {}\r\n", name, other)).await;
                return true;
            }
        }
        write(io, "RELOCATE_OK\r\n").await;
        true
    }

    // HTTP framing

    /// Reply to one request. Returns false when the stream is unusable.
    async fn answer_http(&self, io: &mut BufReader<TcpStream>, request: &Request, length: usize) -> bool {
        let instance = request.field("ServiceInstanceUUID").unwrap_or_default().to_string();

        match request.op.as_str() {
            "activate" => {
                let reference = self.activate(request);
                respond(io, "200 OK", &format!("<reference>{}</reference>", reference)).await;
            }
            "deactivate" => {
                if self.deactivate(&instance) {
                    respond(io, "200 OK", "").await;
                } else {
                    respond(io, "404 Not Found", "<error>instance not found</error>").await;
                }
            }
            "deploy" => {
                let Some(archive) = accept_body(io, length).await else {
                    return false;
                };
                self.deploy(request, &archive);
                respond(io, "200 OK", "").await;
            }
            "invoke" => {
                if !self.hosts(&instance, &request.node) {
                    let error = format!("<error>instance {} not found</error>", instance);
                    respond(io, "404 Not Found", &error).await;
                    return true;
                }
                let Some(args) = accept_body(io, length).await else {
                    return false;
                };
                if request.has_flag("Asynchronous") {
                    return true;
                }
                let encoded = Self::invoke(request, &args).encode().unwrap();
                write(
                    io,
                    &format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: dime\r\nContent-Length: {}\r\n\r\n",
                        encoded.len()
                    ),
                )
                .await;
                io.get_mut().write_all(&encoded).await.unwrap();
            }
            "lookup" => match self.lookup(request, &instance) {
                Some(host) => respond(io, "200 OK", &format!("<node>{}</node>", host)).await,
                None => respond(io, "404 Not Found", "<error>instance not found</error>").await,
            },
            "locate" => match self.locate(request) {
                Some(address) => {
                    respond(io, "200 OK", &format!("<location>{}</location>", address)).await
                }
                None => respond(io, "404 Not Found", "<error>unknown node</error>").await,
            },
            "resinfo" => {
                let value = format!("<value>{}</value>", Self::resinfo(request));
                respond(io, "200 OK", &value).await;
            }
            "relocate" => match request.field("ActionType").unwrap_or_default() {
                "migrate" if self.migrate(request) => respond(io, "200 OK", "").await,
                "migrate" => respond(io, "404 Not Found", "<error>instance not found</error>").await,
                "migrateAll" => {
                    self.migrate_all(request);
                    respond(io, "200 OK", "").await;
                }
                "restore" => {
                    let Some(state) = accept_body(io, length).await else {
                        return false;
                    };
                    if self.restore(request, &state) {
                        respond(io, "200 OK", "").await;
                    } else {
                        respond(io, "400 Bad Request", "<error>empty state</error>").await;
                    }
                }
                _ => respond(io, "400 Bad Request", "<error>unknown action</error>").await,
            },
            _ => respond(io, "400 Bad Request", "<error>unsupported</error>").await,
        }
        true
    }
}

/// `add` sums its JSON arguments; anything else answers with the node it ran on.
fn evaluate(method: &str, args: &Envelope, node: &str) -> Value {
    let params: Vec<Value> = args
        .records()
        .first()
        .and_then(|r| serde_json::from_slice(&r.payload).ok())
        .unwrap_or_default();
    match method {
        "add" => json!(params.iter().filter_map(Value::as_i64).sum::<i64>()),
        _ => json!(node),
    }
}

async fn read_line(io: &mut BufReader<TcpStream>) -> Option<String> {
    let mut line = String::new();
    match io.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

async fn read_blob(io: &mut BufReader<TcpStream>) -> Option<Envelope> {
    let header = read_line(io).await?;
    let len: usize = header.strip_prefix("DimeLength ")?.trim().parse().ok()?;
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await.ok()?;
    Envelope::decode(&buf).ok()
}

async fn write(io: &mut BufReader<TcpStream>, text: &str) {
    io.get_mut().write_all(text.as_bytes()).await.ok();
}

fn result_block(name: &str, value: &str) -> String {
    format!("START_{}\r\n{}\r\nEND_{}\r\n", name, value, name)
}

async fn respond(io: &mut BufReader<TcpStream>, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: xml\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    write(io, &response).await;
}

/// Pass the `100 Continue` gate and read a DIME body.
async fn accept_body(io: &mut BufReader<TcpStream>, length: usize) -> Option<Envelope> {
    write(io, "HTTP/1.1 100 Continue\r\n\r\n").await;
    let mut buf = vec![0u8; length];
    io.read_exact(&mut buf).await.ok()?;
    Envelope::decode(&buf).ok()
}

/// Client configuration pointing at a fake kernel.
pub fn client_config(kernel: &NodeAddress) -> ClientConfig {
    ClientConfig::default()
        .with_kernel(kernel.host.clone(), kernel.port)
        .with_requestor_id("C1")
        .with_read_timeout(Some(Duration::from_secs(5)))
}

/// Client configuration matching a fabric's protocol.
pub fn fabric_config(fabric: &Fabric, kernel: &NodeAddress) -> ClientConfig {
    client_config(kernel).with_protocol(fabric.protocol())
}
