//! CLI for mqttsocket
//!
//! Subcommands:
//! - `server`: run the gateway (default)
//! - `client`: send one topic request to a running gateway (smoke test)

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mqttsocket::broker::{BrokerLifecycle, LoggingHooks, PublishGateway};
use mqttsocket::client::{BusClient, LastMessageSlot};
use mqttsocket::config::{Settings, load_config, load_config_from};
use mqttsocket::transport::http::{self, AppState};
use mqttsocket::utils::error::AppError;
use mqttsocket::utils::logging;

#[derive(Parser)]
#[command(name = "mqttsocket", about = "MQTT to WebSocket gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway
    Server {
        /// Config file, with or without extension (default: config/default)
        #[arg(long)]
        config: Option<String>,
    },
    /// Send one topic request and print the reply
    Client {
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        #[arg(long, default_value = "sensors/temp")]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Server { config: None }) {
        Command::Server { config } => run_server(config.as_deref()).await,
        Command::Client { url, topic } => {
            logging::init("info");
            run_client(&url, &topic).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::init("info");
            error!("mqttsocket failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn settings(config_path: Option<&str>) -> Result<Settings, AppError> {
    let settings = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(settings)
}

async fn run_server(config_path: Option<&str>) -> Result<(), AppError> {
    let settings = settings(config_path)?;
    logging::init(&settings.log.level);
    info!("application starting");

    let lifecycle = Arc::new(BrokerLifecycle::new(Arc::new(LoggingHooks)));
    lifecycle.start(&settings.broker).await?;

    let slot = Arc::new(LastMessageSlot::new());
    let bus = match BusClient::connect(&settings.bus_client, slot.delivery_callback()).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            let _ = lifecycle.stop().await;
            return Err(e.into());
        }
    };

    let http_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = match TcpListener::bind(&http_addr).await {
        Ok(listener) => listener,
        Err(source) => {
            bus.disconnect().await;
            let _ = lifecycle.stop().await;
            return Err(AppError::HttpBind {
                addr: http_addr,
                source,
            });
        }
    };

    let shutdown = CancellationToken::new();
    let state = AppState {
        bus: bus.clone(),
        slot,
        gateway: PublishGateway::new(lifecycle.clone()),
        shutdown: shutdown.clone(),
    };
    let mut server = tokio::spawn(http::serve(listener, state));
    info!(http = %http_addr, "application started");

    let mut outcome = Ok(());
    let server_done = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            false
        }
        joined = &mut server => {
            match joined {
                Ok(Ok(())) => warn!("http server exited unexpectedly"),
                Ok(Err(e)) => outcome = Err(AppError::Io(e)),
                Err(e) => error!("http server task failed: {e}"),
            }
            true
        }
    };

    info!("application stopping");
    shutdown.cancel();

    if !server_done {
        let grace = settings.server.shutdown_grace();
        match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Err(e))) => warn!("http server error during shutdown: {e}"),
            Ok(_) => {}
            Err(_) => {
                warn!(?grace, "shutdown grace period elapsed, aborting open connections");
                server.abort();
            }
        }
    }

    bus.disconnect().await;
    if let Err(e) = lifecycle.stop().await {
        warn!("broker stop failed: {e}");
    }

    info!("application stopped");
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_client(url: &str, topic: &str) -> Result<(), AppError> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let io_err = |e: tokio_tungstenite::tungstenite::Error| {
        AppError::Io(std::io::Error::other(e.to_string()))
    };

    let (mut ws_stream, _response) = connect_async(url).await.map_err(io_err)?;
    info!(url, "connected");

    let request = json!({ "topic": topic });
    ws_stream
        .send(WsMessage::Text(request.to_string().into()))
        .await
        .map_err(io_err)?;

    match ws_stream.next().await {
        Some(Ok(WsMessage::Text(reply))) => println!("{reply}"),
        Some(Ok(other)) => println!("{other:?}"),
        Some(Err(e)) => return Err(io_err(e)),
        None => warn!("connection closed before a reply"),
    }

    ws_stream.close(None).await.map_err(io_err)?;
    Ok(())
}
