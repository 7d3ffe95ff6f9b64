use clap::{Parser, Subcommand};
use gridlink::server::{MemberServer, TcpMemberServer};
use gridlink::{
    ClientConfig, ConnectionManager, InvocationOptions, LifecycleEvent, Member, MemberId, Request,
    StaticMembership, TcpConnector,
};
use slog::{error, info, o, warn, Drain, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "gridlink")]
#[command(about = "Multi-channel data grid client transport", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an echo member server
    Serve {
        /// Address to listen on (e.g., 127.0.0.1:5701)
        #[arg(short, long)]
        listen: String,
    },
    /// Connect to members and send test requests spread over partitions
    Probe {
        /// Member addresses (e.g., 127.0.0.1:5701,127.0.0.1:5702)
        #[arg(short, long, value_delimiter = ',', required = true)]
        member: Vec<String>,

        /// Partition channels per connection
        #[arg(short, long)]
        partition_channels: Option<usize>,

        /// Number of requests to send
        #[arg(short, long, default_value_t = 10)]
        requests: u32,

        /// JSON client configuration file
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn create_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let logger = create_logger();

    match args.command {
        Command::Serve { listen } => serve(&listen, &logger).await,
        Command::Probe { member, partition_channels, requests, config } => {
            let mut client_config = match config {
                Some(path) => ClientConfig::from_json_file(path)?,
                None => ClientConfig::default(),
            };
            if let Some(count) = partition_channels {
                client_config = client_config.with_partition_channels(count);
            }
            probe(member, client_config, requests, &logger).await
        }
    }
}

async fn serve(listen: &str, logger: &Logger) -> Result<(), Box<dyn std::error::Error>> {
    let server = MemberServer::echo(MemberId::new_random(), logger);
    let listener = TcpMemberServer::bind(listen, server, logger).await?;
    info!(logger, "Press Ctrl+C to shutdown gracefully");

    signal::ctrl_c().await?;
    info!(logger, "Shutting down"; "channels" => listener.server().active_channels());
    listener.shutdown();
    Ok(())
}

async fn probe(
    addresses: Vec<String>,
    config: ClientConfig,
    requests: u32,
    logger: &Logger,
) -> Result<(), Box<dyn std::error::Error>> {
    let members: Vec<Member> = addresses
        .into_iter()
        .map(|address| Member::new(MemberId::new_random(), address))
        .collect();
    let expected = members.len();

    let manager = ConnectionManager::new(config, Arc::new(TcpConnector::new()), logger)?;
    let mut events = manager.subscribe();
    let event_logger = logger.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LifecycleEvent::Connected { member, address, partition_channels } => {
                    info!(event_logger, "Connected"; "member" => %member, "address" => address, "partition_channels" => partition_channels);
                }
                LifecycleEvent::Disconnected { member, reason } => {
                    warn!(event_logger, "Disconnected"; "member" => %member, "reason" => %reason);
                }
                LifecycleEvent::ReconnectFailed { member, attempts } => {
                    error!(event_logger, "Reconnect failed"; "member" => %member, "attempts" => attempts);
                }
            }
        }
    });

    manager.start(Arc::new(StaticMembership::new(members)));

    let wait = tokio::time::timeout(manager.config().connect_timeout, async {
        while manager.connection_count() < expected {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });
    if wait.await.is_err() {
        warn!(logger, "Not every member connected";
            "connected" => manager.connection_count(),
            "expected" => expected
        );
    }

    let mut succeeded = 0;
    for i in 0..requests {
        let payload = format!("probe-{}", i);
        let request = Request::with_options(payload.clone(), InvocationOptions::new().with_partition(i));
        match manager.send(request).await {
            Ok(response) if response == payload.as_bytes() => succeeded += 1,
            Ok(response) => {
                warn!(logger, "Unexpected response"; "partition" => i, "bytes" => response.len());
            }
            Err(e) => warn!(logger, "Request failed"; "partition" => i, "error" => %e),
        }
    }
    info!(logger, "Probe finished"; "requests" => requests, "succeeded" => succeeded);

    manager.stop().await;
    Ok(())
}
