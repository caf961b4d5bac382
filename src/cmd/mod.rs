use anyhow::{Context, Result};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::Client;
use crate::catalog::{Catalog, ScanOptions};
use crate::config::Config;
use crate::envconfig;
use crate::events::{Event, EventBus, NotificationHandler};
use crate::format::{human_bytes, human_duration_since};
use crate::server;
use crate::supervisor::Supervisor;

/// Delay before `autoLoadModels` kick in, so the control API is reachable first.
pub const AUTO_LOAD_DELAY: Duration = Duration::from_secs(1);

/// How long a fatal startup notification gets to render before exit.
const FATAL_EXIT_DELAY: Duration = Duration::from_secs(2);

pub fn init_logging() {
    let filter = EnvFilter::try_new(envconfig::log_filter())
        .unwrap_or_else(|_| EnvFilter::new("lmvisor=info"));

    // a second init (tests, embedding) is not an error worth reporting
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

pub async fn serve() -> Result<()> {
    let config_path = envconfig::config_path();

    let config = match Config::load_or_create(&config_path) {
        Ok(config) => config,
        Err(e) => return fatal(format!("Failed to load config: {}", e)).await,
    };

    let scan = match ScanOptions::from_config(&config) {
        Ok(scan) => scan,
        Err(e) => return fatal(format!("Failed to load config: {}", e)).await,
    };

    let model_dir = config.model_dir_path();
    let catalog = match Catalog::load(&model_dir, &scan) {
        Ok(catalog) => catalog,
        Err(e) => return fatal(format!("Error scanning model files: {}", e)).await,
    };
    let model_count = catalog.len();

    let supervisor = Supervisor::builder(config.clone(), catalog)
        .config_path(config_path)
        .scan_options(scan)
        .build()?;

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => return fatal(format!("Failed to bind control API on {}: {}", addr, e)).await,
    };

    tracing::info!(
        models = model_count,
        port_policy = ?config.port_policy,
        "Control API listening on {}",
        addr
    );
    supervisor.events().publish(Event::ServerStarted {
        address: addr,
        models: model_count,
    });

    if !config.auto_load_models.is_empty() {
        let auto = supervisor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AUTO_LOAD_DELAY).await;
            auto.auto_load().await;
        });
    }

    let result = server::serve(listener, supervisor.clone(), shutdown_signal()).await;

    tracing::info!("Shutting down, stopping all models");
    supervisor.shutdown().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Reports a startup failure to the operator, gives the notification time
/// to show, and exits with status 1.
async fn fatal<T>(message: String) -> T {
    tracing::error!("{}", message);

    let bus = EventBus::new();
    bus.subscribe(NotificationHandler::new(Arc::new(AtomicBool::new(true))));
    bus.publish(Event::Fatal { message });

    tokio::time::sleep(FATAL_EXIT_DELAY).await;
    std::process::exit(1)
}

async fn with_client<F, Fut>(f: F) -> Result<()>
where
    F: FnOnce(Client) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let client = Client::from_env()?;
    f(client).await
}

pub async fn models() -> Result<()> {
    with_client(|client| async move {
        let models = client.models().await.context("Failed to list models")?;

        println!("{:<6} {:<48} {:>10}  PATH", "INDEX", "NAME", "SIZE");
        for model in models {
            println!(
                "{:<6} {:<48} {:>10}  {}",
                model.index,
                model.name,
                human_bytes(model.size_bytes),
                model.path.display()
            );
        }
        Ok(())
    })
    .await
}

pub async fn reload() -> Result<()> {
    with_client(|client| async move {
        let count = client.reload_models().await.context("Failed to reload models")?;
        println!("Model list reloaded: {} models", count);
        Ok(())
    })
    .await
}

pub async fn status() -> Result<()> {
    with_client(|client| async move {
        let status = client.status().await.context("Failed to get status")?;

        match &status.model {
            Some(model) => println!(
                "Loaded: {} ({}) on port {}",
                model.base_name,
                model.path.display(),
                status.server_port
            ),
            None => println!("No model loaded"),
        }

        if !status.instances.is_empty() {
            println!();
            println!("{:<6} {:<40} {:<7} {:<10} UP", "ID", "NAME", "PORT", "STATE");
            for instance in &status.instances {
                println!(
                    "{:<6} {:<40} {:<7} {:<10} {}",
                    instance.id,
                    instance.name,
                    instance.port,
                    format!("{:?}", instance.state).to_lowercase(),
                    human_duration_since(instance.started_at)
                );
            }
        }
        Ok(())
    })
    .await
}

pub async fn load(index: i64) -> Result<()> {
    with_client(|client| async move {
        let (message, data) = client.load(index).await.context("Failed to load model")?;
        println!(
            "{}: {} on port {} (instance {})",
            message,
            data.base_name,
            data.port,
            data.instance
        );
        Ok(())
    })
    .await
}

pub async fn unload(instance: Option<u64>) -> Result<()> {
    with_client(|client| async move {
        let (message, data) = client.unload(instance).await.context("Failed to unload model")?;
        if data.stopped.is_empty() {
            println!("{} (nothing was running)", message);
        } else {
            let ids: Vec<String> = data.stopped.iter().map(u64::to_string).collect();
            println!("{} (stopped instance {})", message, ids.join(", "));
        }
        Ok(())
    })
    .await
}

pub async fn events() -> Result<()> {
    with_client(|client| async move {
        for event in client.events().await.context("Failed to fetch events")? {
            println!(
                "{}  {:<22} {}: {}",
                event.time.format("%Y-%m-%d %H:%M:%S"),
                event.kind,
                event.title,
                event.message.replace('\n', " | ")
            );
        }
        Ok(())
    })
    .await
}

pub async fn health() -> Result<()> {
    with_client(|client| async move {
        let health = client.health().await?;
        println!("{}: {}", client.base_url(), health.status);
        Ok(())
    })
    .await
}

pub async fn version() -> Result<()> {
    println!("lmvisor version {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

pub async fn init_config(force: bool) -> Result<()> {
    let path = envconfig::config_path();
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    let config = Config::default_template()?;
    config.save(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
