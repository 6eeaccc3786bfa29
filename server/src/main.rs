use clap::Parser;
use log::{error, info};
use server::acceptor::{ListenerSpec, ServerAcceptors};
use server::echo::EchoDelegate;
use server::scheduler::Scheduler;
use server::Server;
use shared::ProtocolConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Runs the echo server until Ctrl+C or until the server gives up on its own.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// IP address to listen on
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// TCP port to listen on
        #[clap(short, long, default_value = "33060")]
        port: u16,
        /// Also listen on this unix domain socket
        #[clap(short, long)]
        socket: Option<PathBuf>,
        /// Do not listen on TCP
        #[clap(long)]
        skip_networking: bool,
        /// Do not resolve client host names
        #[clap(long)]
        skip_name_resolve: bool,
        /// Threads accepting connections
        #[clap(long, default_value = "2")]
        accept_threads: usize,
        /// Threads running clients
        #[clap(long, default_value = "8")]
        worker_threads: usize,
        /// Clients served at once before new ones are turned away
        #[clap(long, default_value = "64")]
        max_connections: usize,
        /// JSON protocol config; defaults are used when omitted
        #[clap(short, long)]
        config: Option<PathBuf>,
    }

    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ProtocolConfig::load(path)?,
        None => ProtocolConfig::default(),
    };

    let mut listeners = vec![ListenerSpec::Tcp(
        format!("{}:{}", args.host, args.port).parse()?,
    )];
    if let Some(path) = &args.socket {
        listeners.push(ListenerSpec::LocalSocket(path.clone()));
    }

    let server = Server::new(
        Arc::new(config),
        Arc::new(Scheduler::new("accept", args.accept_threads)?),
        Arc::new(Scheduler::new("worker", args.worker_threads)?),
        Arc::new(ServerAcceptors::new(listeners)),
        Arc::new(EchoDelegate::new(args.max_connections)),
    );

    server.prepare(
        None,
        args.skip_networking,
        args.skip_name_resolve,
        args.socket.is_some(),
    )?;
    if let Err(e) = server.start() {
        server.start_failed();
        return Err(e.into());
    }
    for addr in server.local_addrs() {
        info!("Echo server listening on {}", addr);
    }

    // Wait for Ctrl+C or for the server to fail by itself
    let mut check = interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
            _ = check.tick() => {
                if server.is_terminating() {
                    error!("Server stopped unexpectedly in state {:?}", server.state());
                    break;
                }
            }
        }
    }

    // stop() blocks until every client has closed
    let stopping = Arc::clone(&server);
    tokio::task::spawn_blocking(move || stopping.stop(false)).await?;

    Ok(())
}
