//! taskwire CLI - serve the control channel, issue one call, or watch events.
//!
//! This is the main binary entry point. See the `taskwire` library for the
//! core functionality.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde_json::Value;
use taskwire::config::DEFAULT_HOST;
use taskwire::{
    Client, ClientNotice, CommandName, Config, EventName, InMemoryEngine, Server, TaskApi,
    TaskCommand, TransportConfig, WsServer,
};

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "taskwire")]
#[command(version)]
#[command(about = "Command/event control channel for assistant task sessions")]
struct Cli {
    /// Local socket path (overrides config)
    #[arg(long, global = true, conflicts_with_all = ["host", "port"])]
    socket: Option<PathBuf>,
    /// TCP host (requires --port)
    #[arg(long, global = true)]
    host: Option<String>,
    /// TCP port
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server with the in-memory engine until Ctrl-C
    Serve {
        /// Also serve the WebSocket dialect on this port
        #[arg(long)]
        ws_port: Option<u16>,
    },
    /// Send one command and print its response payload
    Call {
        /// Command name, e.g. IsReady or isReady
        command: String,
        /// Command data as JSON (bare strings are accepted as-is)
        #[arg(long)]
        data: Option<String>,
    },
    /// Print task events as JSON lines
    Watch {
        /// Only this event, e.g. taskStarted
        #[arg(long)]
        event: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if cli.socket.is_some() || cli.host.is_some() || cli.port.is_some() {
        config.transport = Some(TransportConfig::from_parts(cli.socket, cli.host, cli.port)?);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Serve { ws_port } => {
                if ws_port.is_some() {
                    config.ws_port = ws_port;
                }
                config.validate()?;
                serve(config).await
            }
            Commands::Call { command, data } => call(config, &command, data.as_deref()).await,
            Commands::Watch { event } => watch(config, event.as_deref()).await,
        }
    })
}

async fn serve(config: Config) -> Result<()> {
    let (engine, events) = InMemoryEngine::new();
    let api: Arc<dyn TaskApi> = Arc::new(engine);

    let mut server = Server::bind(config.server_config(), Arc::clone(&api)).await?;
    server.listen();

    let ws_server = match config.ws_port {
        Some(port) => {
            let mut ws_server = WsServer::start(DEFAULT_HOST, port, Arc::clone(&api)).await?;
            // Both bindings see every engine event.
            let (ws_tx, ws_rx) = tokio::sync::mpsc::unbounded_channel();
            let (control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel();
            ws_server.forward_events(ws_rx);
            server.forward_events(control_rx);
            tokio::spawn(async move {
                let mut events = events;
                while let Some(event) = events.recv().await {
                    let _ = ws_tx.send(event.clone());
                    if control_tx.send(event).is_err() {
                        break;
                    }
                }
            });
            Some(ws_server)
        }
        None => {
            server.forward_events(events);
            None
        }
    };

    println!("taskwire listening on {}", server.local_addr());
    if let Some(ws_server) = &ws_server {
        println!("WebSocket binding on ws://{}", ws_server.local_addr());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down");

    server.shutdown();
    if let Some(ws_server) = ws_server {
        ws_server.shutdown();
    }
    Ok(())
}

async fn call(config: Config, command: &str, data: Option<&str>) -> Result<()> {
    let name: CommandName = match CommandName::from_ws_name(command) {
        Some(name) => name,
        None => command.parse()?,
    };
    let data = data.map(|raw| {
        serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    });
    let command = TaskCommand::from_parts(name, data.as_ref())?;

    let client = Client::new(config.client_config())?;
    client.connect().await?;
    let result = client.send_command(command).await;
    client.disconnect().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn watch(config: Config, event: Option<&str>) -> Result<()> {
    let client = Client::new(config.client_config())?;
    let mut events = match event {
        Some(name) => client.subscribe(name.parse::<EventName>()?),
        None => client.subscribe_all(),
    };
    let mut notices = client.notices();
    let ack = client.connect().await?;
    log::info!("Watching as {}", ack.client_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", event.to_value()),
                None => break,
            },
            notice = notices.recv() => match notice {
                Some(ClientNotice::Disconnected) | None => {
                    log::warn!("Server closed the connection");
                    break;
                }
                Some(other) => log::debug!("{other:?}"),
            },
        }
    }
    client.disconnect().await;
    Ok(())
}
