use anyhow::Result;
use clap::Parser;
use proxy_relay::{
    Args, Config, Dashboard, EventEmitter, ProxyListener, Relay, proxy::log_startup, run_reporter,
    serve,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config = Config::from_args(args)?;
    let listener = ProxyListener::bind(config.local_addr.as_str(), config.header_timeout).await?;
    log_startup(listener.local_addr()?, &config.upstream_addr, &config.filter);

    let dashboard = Arc::new(Dashboard::new());
    let emitter = Arc::new(EventEmitter::stdout());
    let relay = Arc::new(Relay::new(
        config.upstream_addr,
        config.upstream_timeout,
        config.filter,
        dashboard.clone(),
        emitter.clone(),
    ));

    tokio::spawn(run_reporter(dashboard, emitter, config.status_interval));

    tokio::select! {
        () = serve(listener, relay) => {},
        () = shutdown_signal() => info!("Shutting down"),
    }

    Ok(())
}
