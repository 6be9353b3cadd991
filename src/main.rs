mod backend;
mod cache;
mod cli;
mod config;
mod cursor;
#[cfg(feature = "semantic")]
mod embeddings;
mod errors;
#[cfg(test)]
mod mcp_compliance_tests;
mod middleware;
mod providers;
mod registry;
mod resources;
mod runner;
mod sandbox;
mod secrets;
mod server;
mod skills;
#[cfg(test)]
mod testutil;
mod tools;
mod toolsets;
mod tracker;
mod transport;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::TransportKind;
use skills::SkillSpec;
use toolsets::Toolset;

/// Everything produced by shared initialization, ready to be served over
/// whichever transport was selected.
pub struct InitializedGateway {
    pub registry: Arc<registry::ToolRegistry>,
    pub backend_manager: Arc<backend::BackendManager>,
    pub tracker: Arc<tracker::CallTracker>,
    pub cache_path: PathBuf,
    pub config: config::Config,
    pub shutdown_notify: Arc<tokio::sync::Notify>,
}

/// Shared initialization: config, tracing, secrets, registry, backends, health, watcher.
pub async fn initialize(config_path: &Path) -> Result<InitializedGateway> {
    // Load ~/.env into process environment (once, before any concurrent work).
    config::load_dotenv();

    // Ensure ~/.metatools directory exists
    let metatools_home = cli::metatools_home();
    if !metatools_home.exists() {
        std::fs::create_dir_all(&metatools_home)?;
        // Note: tracing not initialized yet, so use eprintln
        eprintln!(
            "created metatools home directory: {}",
            metatools_home.display()
        );
    }

    // Load config (env var expansion + YAML parse)
    let mut config = config::Config::load(config_path)?;

    // Initialize tracing (logs to stderr so stdio transport is clean)
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Resolve secrets (requires tokio runtime + network for BWS SDK)
    config.resolve_secrets_async().await?;

    info!(
        config_path = %config_path.display(),
        backends = config.backends.len(),
        "metatools starting"
    );

    // Create shared state
    let registry = {
        #[cfg(feature = "semantic")]
        {
            // Direct HuggingFace model downloads to ~/.metatools/models/
            let models_dir = config
                .semantic
                .as_ref()
                .and_then(|s| s.cache_dir.clone())
                .unwrap_or_else(|| cli::metatools_home().join("models"));
            if !models_dir.exists() {
                std::fs::create_dir_all(&models_dir)?;
            }
            // SAFETY: no concurrent env reads at this point — tokio worker threads
            // exist but no user tasks have been spawned yet.
            unsafe { std::env::set_var("HF_HOME", &models_dir) };

            let model_path = config
                .semantic
                .as_ref()
                .map(|s| s.model_path.as_str())
                .unwrap_or("minishlab/potion-base-8M");

            match embeddings::EmbeddingIndex::new(model_path) {
                Ok(index) => {
                    info!("semantic search enabled");
                    registry::ToolRegistry::new_with_embeddings(index)
                }
                Err(e) => {
                    warn!(error = %e, "failed to load embedding model, falling back to BM25-only");
                    registry::ToolRegistry::new()
                }
            }
        }
        #[cfg(not(feature = "semantic"))]
        {
            registry::ToolRegistry::new()
        }
    };
    let backend_manager = backend::BackendManager::new_with_config(&config.health);
    let tracker = Arc::new(tracker::CallTracker::new());

    // Load tool cache for instant availability before backends connect
    let cache_path = config
        .cache_path
        .clone()
        .unwrap_or_else(cache::default_cache_path);
    let config_backend_names: Vec<String> = config.backends.keys().cloned().collect();
    let cached = cache::load(&cache_path, &registry, &config_backend_names, Some(&tracker)).await;
    if cached > 0 {
        info!(tools = cached, "tools available from cache");
    }

    // Start all backends in the background
    {
        let manager = Arc::clone(&backend_manager);
        let reg = Arc::clone(&registry);
        let trk = Arc::clone(&tracker);
        let cfg = config.clone();
        let cp = cache_path.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start_all(&cfg, &reg).await {
                tracing::error!(error = %e, "backend startup failed");
            }
            info!(
                tools = reg.tool_count(),
                backends = reg.backend_count(),
                "tool discovery complete"
            );
            cache::save(&cp, &reg, Some(&trk)).await;
        });
    }

    // Shared config for hot-reload
    let shared_config = Arc::new(arc_swap::ArcSwap::from_pointee(config.clone()));

    // Start health checker in background
    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    {
        let manager = Arc::clone(&backend_manager);
        let reg = Arc::clone(&registry);
        let trk = Arc::clone(&tracker);
        let health_config = config.health.clone();
        let shutdown = Arc::clone(&shutdown_notify);
        let cp = cache_path.clone();
        tokio::spawn(async move {
            backend::health::run_health_checker(manager, reg, trk, health_config, shutdown, cp)
                .await;
        });
    }

    // Start config file watcher in background
    {
        let config_path = config_path.to_path_buf();
        let shared = Arc::clone(&shared_config);
        let mgr = Arc::clone(&backend_manager);
        let reg = Arc::clone(&registry);
        let trk = Arc::clone(&tracker);
        let cp = cache_path.clone();
        let shutdown = Arc::clone(&shutdown_notify);
        tokio::spawn(async move {
            config::watch_config(config_path, shared, mgr, reg, trk, cp, shutdown).await;
        });
    }

    Ok(InitializedGateway {
        registry,
        backend_manager,
        tracker,
        cache_path,
        config,
        shutdown_notify,
    })
}

fn build_toolsets(specs: &[toolsets::ToolsetSpec]) -> Arc<HashMap<String, Toolset>> {
    let mut map = HashMap::new();
    for spec in specs {
        let toolset = Toolset::from_spec(spec.clone());
        map.insert(toolset.id.clone(), toolset);
    }
    Arc::new(map)
}

fn build_skills(specs: &[SkillSpec]) -> Arc<HashMap<String, SkillSpec>> {
    let mut map = HashMap::new();
    for spec in specs {
        map.insert(skills::skill_id(&spec.name), spec.clone());
    }
    Arc::new(map)
}

/// Resolve the transport to serve over: CLI flag overrides env var overrides
/// config file default.
fn resolve_transport(gw: &InitializedGateway, cli: &cli::Cli) -> config::TransportConfig {
    let mut transport = gw.config.transport.clone();

    if let Ok(kind) = std::env::var("METATOOLS_TRANSPORT") {
        match kind.to_ascii_lowercase().as_str() {
            "stdio" => transport.kind = TransportKind::Stdio,
            "sse" => transport.kind = TransportKind::Sse,
            "streamable" => transport.kind = TransportKind::Streamable,
            other => warn!(value = other, "unrecognized METATOOLS_TRANSPORT, ignoring"),
        }
    }
    if let Ok(host) = std::env::var("METATOOLS_HOST") {
        transport.host = host;
    }
    if let Ok(port) = std::env::var("METATOOLS_PORT")
        && let Ok(port) = port.parse()
    {
        transport.port = port;
    }

    if let Some(cli::Command::Serve {
        transport: kind,
        host,
        port,
    }) = &cli.command
    {
        if let Some(kind) = kind {
            transport.kind = (*kind).into();
        }
        if let Some(host) = host {
            transport.host = host.clone();
        }
        if let Some(port) = port {
            transport.port = *port;
        }
    }

    transport
}

/// Serve over stdio: a single Claude Code session, 1:1 with this process.
async fn run_stdio(server: server::BrokerServer, gw: InitializedGateway) -> Result<()> {
    info!("serving MCP over stdio");
    let service = server.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    warn!(error = %e, "MCP service exited with error");
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    info!("shutting down");
    gw.shutdown_notify.notify_waiters();
    gw.backend_manager.stop_all().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = cli::Cli::parse();
    if let Ok(path) = std::env::var("METATOOLS_CONFIG") {
        cli.config = PathBuf::from(path);
    }

    let gw = initialize(&cli.config).await?;
    let transport_config = resolve_transport(&gw, &cli);

    let sandbox_semaphore = Arc::new(tokio::sync::Semaphore::new(
        gw.config.sandbox.max_concurrent_sandboxes as usize,
    ));
    let toolsets = build_toolsets(&gw.config.toolsets);
    let skills = build_skills(&gw.config.skills);

    let server = server::BrokerServer::new(
        Arc::clone(&gw.registry),
        Arc::clone(&gw.backend_manager),
        Arc::clone(&gw.tracker),
        gw.cache_path.clone(),
        gw.config.allow_runtime_registration,
        gw.config.max_dynamic_backends,
        sandbox_semaphore,
        toolsets,
        skills,
    );

    match transport_config.kind {
        TransportKind::Stdio => run_stdio(server, gw).await,
        TransportKind::Sse => {
            let result = transport::serve_sse(
                server,
                &transport_config,
                Arc::clone(&gw.shutdown_notify),
            )
            .await;
            gw.shutdown_notify.notify_waiters();
            gw.backend_manager.stop_all().await;
            result
        }
        TransportKind::Streamable => {
            let result = transport::serve_streamable_http(
                server,
                &transport_config,
                Arc::clone(&gw.shutdown_notify),
            )
            .await;
            gw.shutdown_notify.notify_waiters();
            gw.backend_manager.stop_all().await;
            result
        }
    }
}
