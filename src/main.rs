//! Sesame - door buzzer gateway
//!
//! "Open sesame"

use clap::Parser;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sesame::{
    auth::{self, password::passlib_line, SessionSigner},
    bus::BusHandler,
    config::{AuthConfig, Command, LoggingConfig},
    keys::Keys,
    server, AppState, Args, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    if let Some(Command::HashPassword { password }) = &args.command {
        println!("{}", passlib_line(password)?);
        return Ok(());
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&args, &config.logging);

    info!("======================================");
    info!("  Sesame - door buzzer gateway");
    info!("======================================");
    info!("Config: {}", args.config.display());
    info!("Listen: {}", config.server.listen);
    info!("Bus: {}", config.bus.url);
    info!("Status topic: {}", config.bus.status_topic);
    match &config.auth {
        AuthConfig::Online(online) => info!("Auth: online ({})", online.wiki_base_url),
        AuthConfig::Local(local) => info!("Auth: local ({})", local.user_directory.display()),
    }
    info!("======================================");

    let keys = match Keys::load_or_create(&config.server.keys_file) {
        Ok(keys) => keys,
        Err(e) => {
            error!("Could not load key store: {}", e);
            std::process::exit(1);
        }
    };

    let authenticator = match auth::build_authenticator(&config.auth) {
        Ok(authenticator) => authenticator,
        Err(e) => {
            error!("Could not set up authentication: {}", e);
            std::process::exit(1);
        }
    };

    let (bus, bus_task) = match BusHandler::connect(&config.bus).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("Message bus connection failed: {}", e);
            std::process::exit(1);
        }
    };

    // both lifetimes were checked by Config::validate
    let sessions = SessionSigner::new(
        &keys,
        config.server.session_ttl()?,
        config.server.remember_ttl()?,
    );
    drop(keys);

    let state = Arc::new(AppState {
        bus,
        auth: authenticator,
        sessions,
        login_delay: Duration::from_millis(config.server.login_delay_ms),
    });

    tokio::select! {
        result = server::run(config.server.listen, state) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        result = bus_task => {
            match result {
                Ok(Ok(())) => error!("Message bus task ended"),
                Ok(Err(e)) => error!("Fatal message bus error: {}", e),
                Err(e) => error!("Message bus task panicked: {}", e),
            }
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

fn init_tracing(args: &Args, logging: &LoggingConfig) {
    let level = if logging.debug {
        "debug"
    } else {
        args.log_level.as_str()
    };
    let mut default_filter = format!("sesame={level},info");
    if args.debug_bus {
        default_filter.push_str(",rumqttc=debug,async_nats=debug");
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let logfile = logging.logfile.as_ref().map(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| (path, e))
    });

    match logfile {
        Some(Ok(file)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        Some(Err((path, e))) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            warn!("Could not open log file {}, logging to stdout: {}", path.display(), e);
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
