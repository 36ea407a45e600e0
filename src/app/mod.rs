use crate::actuator::ActuatorLink;
use crate::catalog::FixtureCatalog;
use crate::config::Config;
use crate::hub::FixtureHub;
use crate::server::ServerSettings;
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "catalog-check" {
            return handle_catalog_check();
        }
    }

    let config = Config::load()?;

    let catalog = FixtureCatalog::load(&config.catalog.path)?;
    tracing::info!(
        path = %config.catalog.path,
        fixtures = catalog.len(),
        "fixture catalog loaded"
    );

    let link = Arc::new(ActuatorLink::new(config.actuator.queue));
    let hub = Arc::new(FixtureHub::new(
        Arc::new(catalog),
        link.clone(),
        config.snapshot.expose_holders,
    ));

    let actuator_token = match config.actuator.token.clone() {
        Some(token) => token,
        None => {
            let token = generate_token(32);
            tracing::warn!(
                token = %token,
                "no actuator.token configured, generated one for this run"
            );
            token
        }
    };

    let settings = ServerSettings {
        client_token: config.server.client_token.clone(),
        actuator_token,
        allowed_origins: config.server.allowed_origins.clone(),
        outbound_queue: config.server.outbound_queue,
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = crate::server::router(hub, link, settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
        }
    });

    crate::server::start(addr, app, shutdown_rx).await
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_catalog_check() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let catalog = FixtureCatalog::load(&config.catalog.path)?;
    for fixture in catalog.iter() {
        println!(
            "{}\t{}",
            fixture.id,
            fixture.name.as_deref().unwrap_or("-")
        );
    }
    println!("{} fixtures", catalog.len());
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
