use clap::Parser;
use log::{error, info};
use sabledns::cli::{Cli, Commands};
use sabledns::config::{ConfigFile, setup_logging};
use sabledns::engine::{Engine, tcp_server};
use sabledns::error::SableError;
use sabledns::db;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let cli = Cli::parse();
    let config_path = cli.config();

    let config = ConfigFile::try_as_cowcell(config_path.as_ref())?;
    let config_check_mode = matches!(cli.command, Some(Commands::ConfigCheck { .. }));

    if let Some(Commands::ExportConfig { .. }) = cli.command {
        let snapshot = config.read().await;
        match snapshot.as_json_pretty() {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("Failed to serialize config: {err}"),
        }
        return Ok(());
    }

    let logger = setup_logging(config.read().await, config_check_mode).await?;

    let snapshot = config.read().await;
    info!("Configuration: {}", *snapshot);

    if config_check_mode {
        match run_config_check(&snapshot).await {
            Ok(()) => {
                info!("Config check passed");
                logger.flush();
                return Ok(());
            }
            Err(err) => {
                error!("Config check failed: {err}");
                logger.flush();
                return Err(std::io::Error::other(err.to_string()));
            }
        }
    }

    if let Err(err) = run_server((*snapshot).clone()).await {
        error!("Fatal: {err}");
        logger.flush();
        return Err(std::io::Error::other(err.to_string()));
    }
    logger.flush();
    Ok(())
}

/// Validate the bits of config that can fail without starting listeners.
async fn run_config_check(config: &ConfigFile) -> Result<(), SableError> {
    config.dns_listener_address()?;
    config.upstream_addrs()?;
    let pool = db::get_conn(config).await?;
    db::create_tables(&pool).await?;
    Ok(())
}

/// Bind everything, spawn the engine and the TCP listener, then supervise.
async fn run_server(config: ConfigFile) -> Result<(), SableError> {
    let pool = db::get_conn(&config).await?;
    db::create_tables(&pool).await?;

    let listen_addr = config.dns_listener_address()?;
    let tcp_listener = TcpListener::bind(listen_addr).await.map_err(|err| {
        SableError::Startup(format!("Failed to bind TCP listener on {listen_addr}: {err:?}"))
    })?;

    let (engine, event_rx) = Engine::build(config, pool).await?;
    let event_tx = engine.event_sender();

    let engine_handle = tokio::spawn(engine.run(event_rx));
    let tcp_handle = tokio::spawn(tcp_server(tcp_listener, event_tx));

    tokio::select! {
        result = engine_handle => {
            match result {
                Ok(Ok(())) => info!("Engine loop finished"),
                Ok(Err(err)) => error!("Engine loop failed: {err}"),
                Err(err) => error!("Engine task panicked: {err:?}"),
            }
        }
        result = tcp_handle => {
            match result {
                Ok(Ok(())) => info!("TCP listener finished"),
                Ok(Err(err)) => error!("TCP listener failed: {err}"),
                Err(err) => error!("TCP listener task panicked: {err:?}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
    }

    Ok(())
}
