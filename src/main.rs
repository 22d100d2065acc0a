use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::Level;

use udpfs::httpfs::file_server::FileServer;
use udpfs::httpfs::request::{build_get, build_post, RequestUrl};
use udpfs::router::{Router, RouterConfig};
use udpfs::transport::client::Client;
use udpfs::transport::server::Server;

#[derive(Parser)]
#[command(name = "udpfs", about = "file transfer over a reliable stop-and-wait UDP transport")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// relay packets between client and server, dropping and delaying them
    Router {
        #[clap(long, default_value_t = 3000)]
        port: u16,
        /// probability 0..1 of discarding a packet
        #[clap(long, default_value_t = 0.0)]
        drop_rate: f64,
        /// upper bound of the random per-packet delay
        #[clap(long, default_value_t = 0)]
        max_delay_ms: u64,
        /// RNG seed for a reproducible run (default: current time)
        #[clap(long)]
        seed: Option<u64>,
    },
    /// serve a directory over the transport
    Serve {
        #[clap(long, default_value_t = 8007)]
        port: u16,
        #[clap(long, default_value = ".")]
        dir: PathBuf,
    },
    /// fetch a file or directory listing
    Get {
        /// http://host[:port]/path - only the path matters for lookup
        url: String,
        #[clap(long)]
        server: SocketAddrV4,
        #[clap(long)]
        router: SocketAddr,
        #[clap(long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
    },
    /// create or overwrite a file
    Post {
        url: String,
        #[clap(long)]
        data: String,
        #[clap(long)]
        server: SocketAddrV4,
        #[clap(long)]
        router: SocketAddr,
        #[clap(long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .init();

    match args.command {
        Command::Router {
            port,
            drop_rate,
            max_delay_ms,
            seed,
        } => {
            let mut config = RouterConfig::new(SocketAddr::from(([127, 0, 0, 1], port)));
            config.drop_rate = drop_rate;
            config.max_delay = Duration::from_millis(max_delay_ms);
            config.seed = seed;

            let router = Router::bind(config).await?;
            router.run().await
        }
        Command::Serve { port, dir } => {
            let handler = Arc::new(FileServer::new(dir));
            let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], port)), handler, None).await?;
            server.serve().await
        }
        Command::Get {
            url,
            server,
            router,
            bind,
        } => {
            let url: RequestUrl = url.parse()?;
            run_exchange(bind, server, router, build_get(&url)).await
        }
        Command::Post {
            url,
            data,
            server,
            router,
            bind,
        } => {
            let url: RequestUrl = url.parse()?;
            run_exchange(bind, server, router, build_post(&url, &data)).await
        }
    }
}

async fn run_exchange(
    bind: SocketAddr,
    server: SocketAddrV4,
    router: SocketAddr,
    request: String,
) -> anyhow::Result<()> {
    let client = Client::bind(bind, server, router).await?;
    let response = client.execute(request.as_bytes()).await?;
    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
