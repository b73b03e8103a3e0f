use appgate::api::ApiServer;
use appgate::config::Config;
use appgate::lifecycle::AppManager;
use appgate::proxy::ProxyServer;
use appgate::registry::{AppRepository, JsonFileRegistry};
use appgate::routes::RouteCache;
use appgate::runtime::{RuntimeProvider, RuntimeSelector};
use appgate::settings::SettingsStore;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "appgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("appgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = if Path::new(&config_path).exists() {
        info!(path = %config_path, "Loading configuration");
        Config::load(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        let config = Config::default();
        config.validate()?;
        config
    };

    std::fs::create_dir_all(config.storage.apps_dir())?;

    let registry: Arc<dyn AppRepository> =
        Arc::new(JsonFileRegistry::open(config.storage.registry_path())?);
    let settings = Arc::new(SettingsStore::new(config.storage.settings_path()));
    let runtimes: Arc<dyn RuntimeProvider> = Arc::new(RuntimeSelector::new(
        config.runtime.clone(),
        Arc::clone(&settings),
    ));
    let routes = Arc::new(RouteCache::new());

    let manager = Arc::new(AppManager::new(
        &config,
        Arc::clone(&registry),
        runtimes,
        Arc::clone(&routes),
    ));

    let changed = manager.reconcile().await;
    info!(
        apps = manager.list().len(),
        changed, "Reconciled app registry with container runtime"
    );

    let auth_token = match config.server.api_token.clone() {
        Some(token) => token,
        None => {
            let token = uuid::Uuid::new_v4().to_string();
            warn!(token = %token, "No api_token configured, generated one for this run");
            token
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api = Arc::new(ApiServer::new(
        config.server.api_bind,
        Arc::clone(&manager),
        settings,
        auth_token,
        config.server.max_upload_bytes,
        shutdown_rx.clone(),
    ));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "Management API error");
        }
    });

    let proxy = ProxyServer::new(&config, registry, routes, shutdown_rx);
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    info!(
        proxy = %config.server.proxy_bind,
        api = %config.server.api_bind,
        prefix = %config.proxy.path_prefix,
        "appgate started"
    );

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // App containers keep running; reconcile picks them up on the next start
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(api_handle, proxy_handle);

    info!("Shutdown complete");
    Ok(())
}
