//! `hub`, `worker` and `call` commands.

use crate::cli::NodeArgs;
use crate::{demo, ui};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use switchyard_node::{create_node, load_config, MethodTable, Node};
use switchyard_types::NodeConfig;
use tracing::info;

/// Config file, then `PORT`/`REMOTE_HUB`, then command-line flags.
fn resolve_config(path: Option<&Path>, node: &NodeArgs) -> Result<NodeConfig> {
    let mut config = load_config(path);
    config.apply_env().context("invalid environment override")?;
    if let Some(kind) = node.transport {
        config.settings.transport = Some(kind);
    }
    Ok(config)
}

/// Parse a command-line argument as JSON, falling back to a plain string.
pub fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Serve until Ctrl+C or until something sets `exit` on the context.
async fn serve_until_exit(node: &Node) {
    let ctx = node.context();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            ctx.set_exit(true);
        }
        _ = ctx.exited() => {}
    }
    node.stopped().await;
}

pub async fn cmd_hub(
    config_path: Option<&Path>,
    args: NodeArgs,
    port: Option<u16>,
    address: Option<String>,
    invoke_timeout: Option<u64>,
) -> Result<()> {
    let mut config = resolve_config(config_path, &args)?;
    config.settings.hub = true;
    if port.is_some() {
        config.settings.port = port;
    }
    if address.is_some() {
        config.settings.address = address;
    }
    if invoke_timeout.is_some() {
        config.settings.invoke_timeout_secs = invoke_timeout;
    }

    let name = args.name.unwrap_or_else(|| "hub".to_string());
    let node = create_node(&name, &config, MethodTable::new())
        .await
        .context("failed to start hub")?;
    if let Some(hub) = node.as_hub() {
        ui::success(&format!("Hub '{name}' is up"));
        ui::kv("Transport", hub.transport().as_str());
        ui::kv("Listening", hub.local_addr());
        ui::hint("Press Ctrl+C to stop");
    }
    serve_until_exit(&node).await;
    Ok(())
}

pub async fn cmd_worker(
    config_path: Option<&Path>,
    args: NodeArgs,
    remote_hub: Option<String>,
    no_invoke_fallback: bool,
) -> Result<()> {
    let mut config = resolve_config(config_path, &args)?;
    config.settings.hub = false;
    if remote_hub.is_some() {
        config.settings.remote_hub = remote_hub;
    }
    if no_invoke_fallback {
        config.settings.invoke_fallback = false;
    }

    let name = args.name.unwrap_or_else(|| "worker".to_string());
    let methods = demo::methods();
    let offered = methods.names().join(", ");
    let node = create_node(&name, &config, methods)
        .await
        .context("failed to start worker")?;
    if let Some(worker) = node.as_worker() {
        ui::success(&format!("Worker '{name}' started"));
        ui::kv("Hub", worker.remote_hub());
        ui::kv("Methods", &offered);
    }
    serve_until_exit(&node).await;
    Ok(())
}

pub async fn cmd_call(
    config_path: Option<&Path>,
    args: NodeArgs,
    remote_hub: Option<String>,
    timeout: u64,
    method: String,
    raw_args: Vec<String>,
) -> Result<()> {
    let mut config = resolve_config(config_path, &args)?;
    config.settings.hub = false;
    if remote_hub.is_some() {
        config.settings.remote_hub = remote_hub;
    }

    let name = args.name.unwrap_or_else(|| "switchyard-call".to_string());
    let node = create_node(&name, &config, MethodTable::new())
        .await
        .context("failed to connect")?;
    let params: Vec<Value> = raw_args.iter().map(|a| parse_arg(a)).collect();

    let outcome = tokio::time::timeout(
        Duration::from_secs(timeout),
        node.remote_call(&method, params),
    )
    .await;
    node.terminate();

    match outcome {
        Err(_) => bail!("'{method}' did not complete within {timeout}s"),
        Ok(Err(e)) => bail!("'{method}' failed: {e}"),
        Ok(Ok(value)) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("3"), json!(3));
        assert_eq!(parse_arg("[1,2]"), json!([1, 2]));
        assert_eq!(parse_arg("\"quoted\""), json!("quoted"));
        assert_eq!(parse_arg("plain words"), json!("plain words"));
    }
}
