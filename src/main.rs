use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use icmptun::tunnel::{run_tunnel, TunnelConfig, TunnelRole, ENCAPSULATION_OVERHEAD};

/// Tunnel IP traffic through ICMP echo requests and replies.
#[derive(Parser)]
#[command(name = "icmptun", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the client end, tunnelling towards a relay.
    Client {
        /// Hostname or IPv4 address of the relay.
        server: String,
        /// Echo identifier for this session; random by default.
        #[arg(long)]
        id: Option<u16>,
        #[command(flatten)]
        opts: TunnelOpts,
    },
    /// Run the relay end, serving the last validated client.
    Server {
        #[command(flatten)]
        opts: TunnelOpts,
    },
}

#[derive(Args)]
struct TunnelOpts {
    /// Name for the tunnel interface; the platform picks one if omitted.
    #[arg(long)]
    tun: Option<String>,

    /// MTU of the link the echo datagrams traverse.
    #[arg(long, default_value_t = 1500)]
    mtu: usize,

    /// Punch-through interval in seconds.
    #[arg(long, default_value_t = 1)]
    interval: u64,

    /// Drop datagrams that travelled more than this many hops.
    #[arg(long)]
    ttl_guard: Option<u8>,
}

impl TunnelOpts {
    fn into_config(self, role: TunnelRole, ident: u16) -> anyhow::Result<TunnelConfig> {
        anyhow::ensure!(
            self.mtu > ENCAPSULATION_OVERHEAD,
            "MTU must exceed the {ENCAPSULATION_OVERHEAD}-byte encapsulation overhead"
        );
        Ok(TunnelConfig {
            role,
            tun_name: self.tun,
            link_mtu: self.mtu,
            ident,
            interval: Duration::from_secs(self.interval.max(1)),
            ttl_guard: self.ttl_guard,
        })
    }
}

/// Resolves the relay argument to an IPv4 address.
async fn resolve(server: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(addr) = server.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let addrs = tokio::net::lookup_host((server, 0))
        .await
        .with_context(|| format!("unable to resolve {server}"))?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    anyhow::bail!("{server} has no IPv4 address");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.command {
        Command::Client { server, id, opts } => {
            let server = resolve(&server).await?;
            let ident = id.unwrap_or_else(rand::random);
            opts.into_config(TunnelRole::Client { server }, ident)?
        }
        Command::Server { opts } => opts.into_config(TunnelRole::Server, 0)?,
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    run_tunnel(config, shutdown)
        .await
        .context("tunnel terminated")?;
    Ok(())
}
