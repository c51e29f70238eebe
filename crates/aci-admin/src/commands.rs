//! Subcommands and their execution.

use aci_core::codec::{request_envelope, JsonCodec};
use aci_core::{AdminFacade, ClientConfig, LocationCache, ResourceQuery, ServiceInvoker};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Subcommand;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Activate a service and print its reference
    Activate {
        service: String,
        /// Only instantiate on the kernel's own node
        #[arg(long)]
        local_only: bool,
        /// Activate on this node instead of through the local kernel
        #[arg(long)]
        node: Option<String>,
    },
    /// Deactivate an instance
    Deactivate {
        instance: String,
        #[arg(long)]
        node: Option<String>,
    },
    /// Invoke a method with JSON parameters
    Invoke {
        instance: String,
        method: String,
        /// JSON array of parameters
        #[arg(default_value = "[]")]
        params: String,
        /// Node believed to host the instance (looked up otherwise)
        #[arg(long)]
        node: Option<String>,
        /// Do not wait for a result
        #[arg(long = "async")]
        asynchronous: bool,
    },
    /// Find the node currently hosting an instance
    Lookup {
        instance: String,
        /// Node the instance was last seen on
        #[arg(long)]
        old_node: Option<String>,
    },
    /// Print a node's address
    Locate { node: String },
    /// Query a usage statistic
    ResourceInfo {
        service: String,
        /// Numeric query code (0-11)
        #[arg(long)]
        query: i32,
        /// Method signature, for method-scoped queries
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        node: Option<String>,
    },
    /// Deploy a service archive
    Deploy {
        path: PathBuf,
        #[arg(long)]
        node: Option<String>,
    },
    /// Move an instance to another node
    Migrate {
        instance: String,
        dest: String,
        /// Node to send the order to (local kernel by default)
        #[arg(long)]
        node: Option<String>,
    },
    /// Move every instance off a node
    MigrateAll {
        dest: String,
        #[arg(long)]
        node: Option<String>,
    },
    /// Recreate an instance from a captured state file
    Restore {
        instance: String,
        service: String,
        state_file: PathBuf,
        #[arg(long)]
        container: Option<String>,
        #[arg(long)]
        node: Option<String>,
    },
}

/// Run one command and return what it produced.
pub async fn run(config: &ClientConfig, command: Command) -> Result<Value> {
    let cache = LocationCache::shared();
    let invoker = ServiceInvoker::with_cache(config, cache.clone());
    let admin = AdminFacade::with_cache(config, cache);
    let admin_on = |node: &Option<String>| match node {
        Some(node) => admin.on_node(node.clone()),
        None => admin.clone(),
    };

    let output = match command {
        Command::Activate {
            service,
            local_only,
            node: Some(node),
        } => {
            let locator = admin.on_node(node).activate_on(&service, local_only).await?;
            json!({
                "reference": locator.to_string(),
                "instance_id": locator.instance_id,
                "node_id": locator.node_id,
            })
        }
        Command::Activate {
            service,
            local_only,
            node: None,
        } => {
            let handle = invoker.activate(&service, local_only).await?;
            json!({
                "instance_id": handle.instance_id,
                "node_id": handle.node_id,
                "caller_id": handle.caller_id,
            })
        }
        Command::Deactivate { instance, node } => {
            let outcome = match node {
                Some(node) => admin.on_node(node).deactivate_on(&instance).await?,
                None => invoker.deactivate(&instance).await?,
            };
            json!({ "instance_id": instance, "outcome": outcome })
        }
        Command::Invoke {
            instance,
            method,
            params,
            node,
            asynchronous,
        } => {
            let params = parse_params(&params)?;
            if let Some(node) = node {
                invoker.cache().record_location(&instance, &node);
            }
            if asynchronous {
                let args = request_envelope(&JsonCodec, &method, &params)?;
                invoker.invoke(&instance, &method, &args, true).await?;
                json!({ "dispatched": true })
            } else {
                let result = invoker.invoke_object(&instance, &method, &params).await?;
                json!({ "result": result })
            }
        }
        Command::Lookup { instance, old_node } => {
            let node_id = invoker.lookup(&instance, old_node.as_deref()).await?;
            json!({ "instance_id": instance, "node_id": node_id })
        }
        Command::Locate { node } => {
            let address = invoker.node_location(&node).await?;
            json!({ "node_id": node, "host": address.host, "port": address.port })
        }
        Command::ResourceInfo {
            service,
            query,
            method,
            node,
        } => {
            let query = ResourceQuery::from_code(query);
            let value = admin_on(&node)
                .resource_info_on(query, &service, method.as_deref())
                .await?;
            json!({ "query": query.code(), "service": service, "value": value })
        }
        Command::Deploy { path, node } => {
            admin_on(&node).deploy_file_to(&path).await?;
            json!({ "deployed": path.display().to_string() })
        }
        Command::Migrate {
            instance,
            dest,
            node,
        } => {
            admin_on(&node).migrate(&instance, &dest).await?;
            json!({ "instance_id": instance, "node_id": dest })
        }
        Command::MigrateAll { dest, node } => {
            admin_on(&node).migrate_all(&dest).await?;
            json!({ "node_id": dest })
        }
        Command::Restore {
            instance,
            service,
            state_file,
            container,
            node,
        } => {
            let state = tokio::fs::read(&state_file)
                .await
                .with_context(|| format!("reading {}", state_file.display()))?;
            info!("Restoring {} from {} bytes of state", instance, state.len());
            admin_on(&node)
                .restore(&instance, &service, Bytes::from(state), container.as_deref())
                .await?;
            json!({ "instance_id": instance, "restored": true })
        }
    };
    Ok(output)
}

/// Parse a JSON parameter list; a single non-array value is one parameter.
fn parse_params(text: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(text).context("parameters must be JSON")?;
    match value {
        Value::Array(params) => Ok(params),
        Value::Object(_) | Value::Null => bail!("parameters must be a JSON array or scalar"),
        scalar => Ok(vec![scalar]),
    }
}
