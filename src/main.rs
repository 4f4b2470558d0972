use std::sync::Arc;

use delegate_broker::api;
use delegate_broker::clock::SystemClock;
use delegate_broker::store::LibSqlBackend;
use delegate_broker::{BrokerConfig, BrokerDeps, DelegateBroker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BrokerConfig::from_env()?;

    eprintln!("Delegate Broker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   REST:     http://0.0.0.0:{}/api", config.http_port);
    eprintln!("   Waits:    http://0.0.0.0:{}/api/waits/{{wait_id}}", config.http_port);
    eprintln!("   Stream:   ws://0.0.0.0:{}/stream/delegate/{{account}}", config.http_port);
    eprintln!("   Database: {}", config.db_path.display());

    let store = Arc::new(LibSqlBackend::new_local(&config.db_path).await.map_err(|e| {
        eprintln!("Error: Failed to open database at {}: {}", config.db_path.display(), e);
        e
    })?);

    let (deps, services) = BrokerDeps::local(store, &config, Arc::new(SystemClock));
    let broker = Arc::new(DelegateBroker::new(config.clone(), deps));
    let _background = broker.spawn_background();

    let app = api::router(broker, services.push, services.waiters);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Delegate broker listening");
    axum::serve(listener, app).await?;

    Ok(())
}
