use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use zorkd::registry::Registry;
use zorkd::session::{self, BrokerConfig};

#[derive(Parser, Debug)]
#[command(name = "zorkd", about = "Peer-to-peer SOCKS5-over-WebRTC proxy broker")]
struct Cli {
    /// TCP port for the Zork control channel.
    #[arg(value_name = "ZORK_PORT", default_value_t = 9000)]
    zork_port: u16,

    /// Port the first getter's local SOCKS5 server binds.
    #[arg(value_name = "SOCKS_PORT", default_value_t = 9999)]
    socks_port: u16,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: zorkd [ZORK_PORT] [SOCKS_PORT]");
            std::process::exit(1);
        }
    };
    if let Err(err) = run(cli).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::new());
    let config = BrokerConfig {
        socks_port: cli.socks_port,
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.zork_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind zork control port {addr}"))?;
    info!(%addr, "zork control channel listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "control connection accepted");
                    let registry = registry.clone();
                    let config = config.clone();
                    tokio::spawn(session::run(stream, registry, config));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }
    Ok(())
}
