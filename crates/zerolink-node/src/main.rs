//! zerolink node - hosts the math service in a supervised container.
//!
//! Prints `RPC_PORT=<port>` on stdout once the service is reachable, so a
//! parent process can discover an auto-assigned port.

mod config;
mod math;

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zerolink::{Container, ContainerRunner};

use config::{NodeConfig, Overrides};

#[derive(Parser, Debug)]
#[command(name = "zerolink-node")]
#[command(about = "Math service node for zerolink")]
struct Args {
    /// Host to bind to (`*` for every interface)
    #[arg(long, env = "ZEROLINK_HOST")]
    host: Option<String>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, env = "ZEROLINK_PORT")]
    port: Option<u16>,

    /// Number of requests served concurrently
    #[arg(short, long)]
    workers: Option<usize>,

    /// Host of the publisher to subscribe to
    #[arg(long)]
    event_host: Option<String>,

    /// Port of the publisher to subscribe to
    #[arg(long)]
    event_port: Option<u16>,

    /// Publish `math:sum` events on this port
    #[arg(long)]
    publish_port: Option<u16>,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            workers: self.workers,
            event_host: self.event_host.clone(),
            event_port: self.event_port,
            publish_port: self.publish_port,
        }
    }
}

fn init_logging(debug: bool) {
    let builder = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    if std::env::var_os("RUST_LOG").is_some() {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        let level = if debug { Level::DEBUG } else { Level::INFO };
        builder.with_max_level(level).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    info!("Starting zerolink node");

    let node = NodeConfig::load_or_default(args.config.as_deref())?.with_overrides(args.overrides());

    if let Some(publish) = &node.publish {
        info!("Publishing math events on {}", publish.endpoint());
    }
    let settings = math::MathSettings {
        publish: node.publish.clone(),
    };

    let container =
        Arc::new(Container::new(math::methods()).with_settings(serde_json::to_value(&settings)?));
    let runner = ContainerRunner::new();
    runner.register("math", container.clone(), node.container.clone());

    let supervisor = runner.clone();
    let mut supervised = tokio::spawn(async move { supervisor.start().await });

    let endpoint = tokio::select! {
        ready = container.ready() => ready?,
        finished = &mut supervised => {
            finished??;
            bail!("Container runner exited before the service was ready");
        }
    };

    // Print port for parent processes to read (intentional stdout)
    println!("RPC_PORT={}", endpoint.port());
    info!("RPC server running on {}", endpoint);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, stopping containers");
            runner.stop().await?;
            supervised.await??;
        }
        finished = &mut supervised => {
            finished??;
        }
    }

    info!("zerolink node exited");
    Ok(())
}
