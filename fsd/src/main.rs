use std::time::Duration;

use clap::Parser;
use fsd::cli::{Cli, Command};
use fsd::client::FsdClient;
use fsd::config;
use fsd::error::Error;
use fsd::listener::ListenerAddr;
use fsd::server::{Server, ServerOptions};
use fsd::shutdown::Disposition;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Daemon { listen, exit_after } => run_daemon(listen, exit_after).await?,
        Command::Mount { host, guest, host_config, guest_config } => {
            run_mount(cli.server, host, guest, host_config, guest_config).await?
        }
        Command::Unmount { name } => run_unmount(cli.server, name).await?,
        Command::Listeners => run_listeners(cli.server).await?,
        Command::Shutdown { disposition } => run_shutdown(cli.server, disposition).await?,
    }
    Ok(())
}

async fn run_daemon(listen: Vec<String>, exit_after: Option<u64>) -> anyhow::Result<()> {
    let mut addrs = Vec::new();
    if listen.is_empty() {
        addrs.push(config::default_listener()?);
    }
    for raw in listen {
        addrs.push(ListenerAddr::parse(&raw)?);
    }

    let server = Server::new()?;
    let options = ServerOptions { listen: addrs, idle_timeout: exit_after.map(Duration::from_secs) };
    server.run(options).await?;
    Ok(())
}

async fn connect(server: Option<String>) -> Result<FsdClient, Error> {
    let addr = match server {
        Some(raw) => ListenerAddr::parse(&raw)?,
        None => config::default_listener()?,
    };
    match addr {
        ListenerAddr::Tcp(socket_addr) => FsdClient::attach_tcp(&socket_addr.to_string()).await,
        ListenerAddr::Unix(path) => FsdClient::attach_unix(&path).await,
    }
}

async fn run_mount(
    server: Option<String>,
    host: String,
    guest: String,
    host_config: Option<std::path::PathBuf>,
    guest_config: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let client = connect(server).await?;
    let host_config = read_config(host_config)?;
    let guest_config = read_config(guest_config)?;
    let name = client.mount(&host, host_config, &guest, guest_config).await?;
    println!("{name}");
    Ok(())
}

fn read_config(path: Option<std::path::PathBuf>) -> anyhow::Result<serde_json::Value> {
    match path {
        Some(path) => Ok(serde_json::from_slice(&std::fs::read(path)?)?),
        None => Ok(serde_json::Value::Object(Default::default())),
    }
}

async fn run_unmount(server: Option<String>, name: String) -> anyhow::Result<()> {
    let client = connect(server).await?;
    client.unmount(&name).await?;
    Ok(())
}

async fn run_listeners(server: Option<String>) -> anyhow::Result<()> {
    let client = connect(server).await?;
    for addr in client.listeners().await? {
        println!("{addr}");
    }
    Ok(())
}

async fn run_shutdown(server: Option<String>, disposition: String) -> anyhow::Result<()> {
    let disposition = match disposition.as_str() {
        "patient" => Disposition::Patient,
        "short" => Disposition::Short,
        "immediate" => Disposition::Immediate,
        other => anyhow::bail!("unknown disposition {other:?}, expected patient/short/immediate"),
    };
    let client = connect(server).await?;
    client.shutdown(disposition).await?;
    Ok(())
}
