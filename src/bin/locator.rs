use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use watchpost::actors::locator::{self, LocatorCheckpoint, LocatorHandle};
use watchpost::checkpoint;
use watchpost::config::read_config_file;
use watchpost::locator::{Locator, LocatorMode};
use watchpost::proto::{self, Message};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("watchpost", LevelFilter::TRACE),
        ("watchpost_locator", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let mut directory = Locator::new(LocatorMode::Distributed);
    if let Some(saved) = checkpoint::read_if_exists(&config.checkpoint.locator_servers_path)? {
        directory.load_servers(&saved)?;
    }
    if let Some(saved) = checkpoint::read_if_exists(&config.checkpoint.locator_hosts_path)? {
        directory.load_hosts(&saved)?;
    }

    let handle = LocatorHandle::spawn(
        directory,
        Some(LocatorCheckpoint {
            servers_path: config.checkpoint.locator_servers_path.clone(),
            hosts_path: config.checkpoint.locator_hosts_path.clone(),
            interval: Duration::from_secs(config.checkpoint.interval_secs),
        }),
    );

    let addr = SocketAddr::new(config.listener.bind, config.listener.port);
    let listener = TcpListener::bind(addr).await?;
    info!("locator listening on {addr}");

    let read_timeout = Duration::from_secs(config.listener.read_timeout_secs);
    let accept_handle = handle.clone();
    let server = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    trace!("connection from {peer}");
                    let handle = accept_handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &handle, read_timeout).await {
                            debug!("connection from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    server.abort();
    handle.save_now().await;
    handle.shutdown().await;

    Ok(())
}

/// The standalone daemon speaks only the locator protocol; anything else
/// is refused with a terse error and the connection stays open.
async fn handle_connection(
    stream: TcpStream,
    handle: &LocatorHandle,
    read_timeout: Duration,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut chunk = String::new();

    loop {
        let mut line = String::new();
        let bytes = match time::timeout(read_timeout, reader.read_line(&mut line)).await {
            Err(_) => {
                trace!("read timeout, closing connection");
                break;
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(n)) => n,
        };

        let eof = bytes == 0;
        let boundary = eof || line.trim().is_empty();
        if !boundary {
            chunk.push_str(&line);
        }

        if boundary && !chunk.trim().is_empty() {
            let response = match proto::parse_message(&chunk) {
                Ok(Message::Locator(request)) => locator::handle_request(handle, request).await,
                Ok(_) => "ERROR only locator messages are accepted here".to_string(),
                Err(e) => format!("ERROR {e}"),
            };
            write_half.write_all(response.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
            write_half.flush().await?;
            chunk.clear();
        }

        if eof {
            break;
        }
    }

    Ok(())
}
