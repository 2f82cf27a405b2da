use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use watchpost::actors::alert::{AlertCheckpoint, AlertHandle};
use watchpost::actors::board::{BoardHandle, OwnershipCheck};
use watchpost::actors::locator::{LocatorAccess, LocatorCheckpoint, LocatorHandle};
use watchpost::alert::{AlertEngine, HostMeta};
use watchpost::board::Board;
use watchpost::config::{Config, LocatorConfig, RegistrationConfig, read_config_file};
use watchpost::locator::{Locator, LocatorMode, Stickiness};
use watchpost::notify::WebhookDispatcher;
use watchpost::rules::{Calendars, CompiledRules};
use watchpost::server::{ServerContext, run_listener};
use watchpost::{AlertColors, checkpoint};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("watchpost", LevelFilter::TRACE),
        ("watchpost_hub", LevelFilter::TRACE),
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

    let hosts = config.hosts.clone().unwrap_or_default();
    let host_meta: HashMap<String, HostMeta> = hosts
        .iter()
        .map(|h| (h.hostname.clone(), HostMeta::from_config(h)))
        .collect();

    let board = Board::new(
        hosts,
        config.validity_minutes,
        config.accept_ghosts,
    );

    let (locator_handle, ownership) = setup_locator(&config).await?;

    let rules = CompiledRules::compile(&config.alerts)?;
    if rules.is_empty() {
        warn!("no alert rules configured, problems will sit in norecip");
    }
    let calendars = Calendars::from_config(&config.calendars)?;
    let alert_colors = config
        .alerts
        .colors
        .as_deref()
        .map(AlertColors::new)
        .unwrap_or_default();

    let mut engine = AlertEngine::new(
        rules,
        calendars,
        host_meta,
        alert_colors,
        config.alerts.notify_recovered,
    );
    if let Some(saved) = checkpoint::read_if_exists(&config.checkpoint.alerts_path)? {
        engine.load(&saved)?;
        info!("restored {} active alerts from checkpoint", engine.len());
    }

    let board_handle = BoardHandle::spawn(board, ownership);

    let alert_handle = AlertHandle::spawn(
        engine,
        Arc::new(WebhookDispatcher::new()),
        board_handle.subscribe(),
        Some(AlertCheckpoint {
            path: config.checkpoint.alerts_path.clone(),
            interval: Duration::from_secs(config.checkpoint.interval_secs),
        }),
    );

    let addr = SocketAddr::new(config.listener.bind, config.listener.port);
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let ctx = ServerContext {
        board: board_handle.clone(),
        alert: Some(alert_handle.clone()),
        locator: locator_handle.clone(),
        read_timeout: Duration::from_secs(config.listener.read_timeout_secs),
    };
    let server = tokio::spawn(run_listener(listener, ctx));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    server.abort();
    alert_handle.save_now().await;
    alert_handle.shutdown().await;
    if let Some(locator) = &locator_handle {
        locator.save_now().await;
        locator.shutdown().await;
    }
    board_handle.shutdown().await;

    Ok(())
}

/// Build the locator side of the deployment: nothing to check in
/// single-server mode, an embedded directory, or a remote daemon.
async fn setup_locator(
    config: &Config,
) -> anyhow::Result<(Option<LocatorHandle>, Option<OwnershipCheck>)> {
    match &config.locator {
        LocatorConfig::Single { server } => {
            debug!("single-server deployment, all assignments go to '{server}'");
            let locator = Locator::new(LocatorMode::SingleServer(server.clone()));
            let handle = LocatorHandle::spawn(locator, None);
            Ok((Some(handle), None))
        }

        LocatorConfig::Distributed {
            server,
            locator: Some(addr),
            register,
        } => {
            info!("distributed mode, using locator at {addr}");
            register_with_remote(*addr, server, register).await;
            let access = LocatorAccess::Remote {
                addr: *addr,
                timeout: Duration::from_secs(2),
            };
            Ok((
                None,
                Some(OwnershipCheck {
                    locator: access,
                    server: server.clone(),
                }),
            ))
        }

        LocatorConfig::Distributed {
            server,
            locator: None,
            register,
        } => {
            info!("distributed mode with embedded locator");
            let mut locator = Locator::new(LocatorMode::Distributed);
            if let Some(saved) = checkpoint::read_if_exists(&config.checkpoint.locator_servers_path)? {
                locator.load_servers(&saved)?;
            }
            if let Some(saved) = checkpoint::read_if_exists(&config.checkpoint.locator_hosts_path)? {
                locator.load_hosts(&saved)?;
            }

            let handle = LocatorHandle::spawn(
                locator,
                Some(LocatorCheckpoint {
                    servers_path: config.checkpoint.locator_servers_path.clone(),
                    hosts_path: config.checkpoint.locator_hosts_path.clone(),
                    interval: Duration::from_secs(config.checkpoint.interval_secs),
                }),
            );

            join_all(
                register
                    .iter()
                    .map(|reg| handle.register(server, reg.service, reg.weight, reg.sticky)),
            )
            .await;

            let ownership = OwnershipCheck {
                locator: LocatorAccess::Embedded(handle.clone()),
                server: server.clone(),
            };
            Ok((Some(handle), Some(ownership)))
        }
    }
}

/// Announce this hub's services to a remote locator daemon. Failures are
/// logged and tolerated; the locator may simply not be up yet.
async fn register_with_remote(addr: SocketAddr, server: &str, registrations: &[RegistrationConfig]) {
    for reg in registrations {
        let sticky = if reg.sticky == Stickiness::Sticky { 1 } else { 0 };
        let request = format!(
            "locator register|{}|{}|{}|{}\n\n",
            server, reg.service, reg.weight, sticky
        );

        let result = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(request.as_bytes()).await?;
            let mut response = String::new();
            stream.read_to_string(&mut response).await?;
            Ok::<String, std::io::Error>(response)
        }
        .await;

        match result {
            Ok(response) if response.trim() == "OK" => {
                debug!("registered {} for {}", server, reg.service);
            }
            Ok(response) => {
                warn!("locator refused registration for {}: {}", reg.service, response.trim());
            }
            Err(e) => {
                warn!("could not register with locator at {addr}: {e}");
            }
        }
    }
}
