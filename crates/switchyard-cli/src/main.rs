//! Switchyard CLI: run hubs and workers, call methods, render deployment files.

mod cli;
mod cmd;
mod demo;
mod ui;

use clap::Parser;
use cli::{Cli, Commands};
use std::future::Future;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn block_on<F>(fut: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(fut)
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Hub {
            node,
            port,
            address,
            invoke_timeout,
        } => block_on(cmd::node::cmd_hub(
            config,
            node,
            port,
            address,
            invoke_timeout,
        )),
        Commands::Worker {
            node,
            remote_hub,
            no_invoke_fallback,
        } => block_on(cmd::node::cmd_worker(
            config,
            node,
            remote_hub,
            no_invoke_fallback,
        )),
        Commands::Call {
            node,
            remote_hub,
            timeout,
            method,
            args,
        } => block_on(cmd::node::cmd_call(
            config, node, remote_hub, timeout, method, args,
        )),
        Commands::Compose { mesh, image } => cmd::deploy::cmd_compose(&mesh, image.as_deref()),
        Commands::Dockerfile { mesh, place } => cmd::deploy::cmd_dockerfile(&mesh, &place),
    };

    if let Err(e) = result {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
