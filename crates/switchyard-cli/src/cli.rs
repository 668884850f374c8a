//! Clap CLI definitions for Switchyard.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use switchyard_types::TransportKind;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  switchyard hub --port 7000                    Run a hub on port 7000
  switchyard worker --remote-hub http://hub:7000 Run a demo worker
  switchyard call add 2 3 --remote-hub http://hub:7000
  switchyard compose --mesh mesh.toml           Render docker-compose services
  switchyard dockerfile --mesh mesh.toml        Render Dockerfile EXPOSE lines

\x1b[1;36mEnvironment:\x1b[0m
  PORT         Overrides the hub port from the config file
  REMOTE_HUB   Overrides the worker's hub address from the config file
  RUST_LOG     Log filter (default: info)";

/// Switchyard: hub-and-spoke JSON-RPC mesh.
#[derive(Parser)]
#[command(name = "switchyard", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.switchyard/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Settings shared by every command that runs a node.
#[derive(Args, Clone, Debug, Default)]
pub struct NodeArgs {
    /// Service name announced to the mesh.
    #[arg(long)]
    pub name: Option<String>,
    /// Transport: tcp, unix, websocket or socket.io.
    #[arg(long)]
    pub transport: Option<TransportKind>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hub.
    Hub {
        #[command(flatten)]
        node: NodeArgs,
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,
        /// Bind host, or socket path for the unix transport.
        #[arg(long)]
        address: Option<String>,
        /// Seconds an `invoke` may wait for a capable worker.
        #[arg(long)]
        invoke_timeout: Option<u64>,
    },
    /// Run a worker serving the demo methods (echo, add, whoami).
    Worker {
        #[command(flatten)]
        node: NodeArgs,
        /// Hub address to connect to.
        #[arg(long)]
        remote_hub: Option<String>,
        /// Do not retry method-not-found calls through the hub's invoke.
        #[arg(long)]
        no_invoke_fallback: bool,
    },
    /// Call a method through the mesh and print the result as JSON.
    Call {
        #[command(flatten)]
        node: NodeArgs,
        /// Hub address to connect to.
        #[arg(long)]
        remote_hub: Option<String>,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Method name.
        method: String,
        /// Positional arguments; each is parsed as JSON, falling back to a string.
        args: Vec<String>,
    },
    /// Render docker-compose services for a mesh file.
    Compose {
        /// Mesh file with one [services.<name>.settings] table per service.
        #[arg(long)]
        mesh: PathBuf,
        /// Image every service runs.
        #[arg(long)]
        image: Option<String>,
    },
    /// Render Dockerfile lines for a mesh file.
    Dockerfile {
        /// Mesh file with one [services.<name>.settings] table per service.
        #[arg(long)]
        mesh: PathBuf,
        /// Insertion point: before-builder, after-builder, before-runner or after-runner.
        #[arg(long, default_value = "after-runner")]
        place: String,
    },
}
