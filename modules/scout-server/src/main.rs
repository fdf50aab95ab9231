use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ai_client::Claude;
use scout::processor::TaskProcessor;
use scout::reclaim::{self, StaleClaimStore};
use scout::reddit::analyzer::ClaudeAnalyzer;
use scout::reddit::client::Client as RedditClient;
use scout::reddit::crawler::Crawler;
use scout::reddit::enricher::Enricher;
use scout::reddit::scheduler::Scheduler;
use scout::reddit::store::PgRedditStorage;
use scout::reddit::toolkit::Toolkit;
use scout::scout::SourceToolkit;
use scout::store::{PgRequestsStorage, PgScoutStorage, PgTaskStorage, ServiceRequestsLog};
use scout::Scout;
use scout_common::{Credentials, Settings};
use scout_server::{build_router, AppState};

#[derive(Parser)]
#[command(name = "scout-server", about = "Content analysis pipeline for forum sources")]
struct Cli {
    /// Path to the settings file (JSON or YAML).
    #[arg(long, default_value = "settings.yaml")]
    settings: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.settings)?;
    let credentials = Credentials::from_env()?;

    info!("scout starting");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&credentials.database_url)
        .await
        .context("connect to postgres")?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("run migrations")?;
    info!("migrations complete");

    // Stores
    let scout_storage = Arc::new(PgScoutStorage::new(pool.clone()));
    let task_storage = Arc::new(PgTaskStorage::new(
        pool.clone(),
        settings.task_processor.error_backoff(),
    ));
    let requests_storage = Arc::new(PgRequestsStorage::new(pool.clone()));
    let reddit_storage = Arc::new(PgRedditStorage::new(pool.clone()));

    // Reddit source: client, analyzer, toolkit
    let reddit_client = Arc::new(RedditClient::new(
        credentials.reddit_base_url.clone(),
        credentials.reddit_user_agent.clone(),
        Arc::new(ServiceRequestsLog::new(
            requests_storage.clone(),
            "reddit_client",
        )),
    ));

    let claude = Claude::new(
        credentials.anthropic_api_key.clone(),
        settings.claude.model.clone(),
    )
    .with_temperature(settings.claude.temperature);
    let analyzer = Arc::new(ClaudeAnalyzer::new(
        claude,
        settings.claude.max_comments,
        Arc::new(ServiceRequestsLog::new(
            requests_storage.clone(),
            "reddit_claude_analyzer",
        )),
    ));

    let reddit_toolkit = Arc::new(Toolkit::new(reddit_storage.clone(), analyzer));

    // Core service
    let mut toolkits: HashMap<String, Arc<dyn SourceToolkit>> = HashMap::new();
    toolkits.insert(scout::reddit::SOURCE.to_string(), reddit_toolkit.clone());

    let scout_service = Arc::new(Scout::new(
        toolkits,
        scout_storage,
        task_storage.clone(),
    ));

    // Pipeline loops
    let crawler = Crawler::new(
        reddit_client.clone(),
        reddit_storage.clone(),
        settings.reddit.scraper.clone(),
    );
    let enricher = Enricher::new(
        reddit_client,
        reddit_storage.clone(),
        settings.reddit.enricher.clone(),
    );
    let scheduler = Scheduler::new(
        reddit_storage.clone(),
        scout_service.clone(),
        settings.reddit.scheduler.clone(),
    );
    let processor = Arc::new(TaskProcessor::new(
        task_storage.clone(),
        scout_service.clone(),
        settings.task_processor.clone(),
    ));

    // Shared shutdown signal; flips on SIGINT/SIGTERM.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_shutdown(shutdown_tx));

    let mut services = JoinSet::new();

    {
        let store: Arc<dyn StaleClaimStore> = task_storage.clone();
        let settings = settings.task_reclaimer.clone();
        let rx = shutdown_rx.clone();
        services.spawn(async move { reclaim::run_reclaimer(store, settings, rx).await });
    }

    if !settings.reddit.scraper.disabled {
        let rx = shutdown_rx.clone();
        services.spawn(async move { crawler.run(rx).await });
    }

    if !settings.reddit.enricher.disabled {
        let rx = shutdown_rx.clone();
        services.spawn(async move { enricher.run(rx).await });
    }

    if !settings.reddit.scheduler.disabled {
        let rx = shutdown_rx.clone();
        services.spawn(async move { scheduler.run(rx).await });
    }

    if !settings.task_processor.disabled {
        let rx = shutdown_rx.clone();
        services.spawn(async move { processor.run(rx).await });
    }

    if !settings.api.disabled {
        let state = Arc::new(AppState {
            scout: scout_service,
            reddit: reddit_toolkit,
        });
        let app = build_router(state);
        let addr = format!("0.0.0.0:{}", settings.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        info!(addr = addr.as_str(), "api listening");

        let mut rx = shutdown_rx.clone();
        services.spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %err, "api server error");
            }
        });
    }

    while services.join_next().await.is_some() {}

    info!("gracefully shut down");
    Ok(())
}

async fn wait_for_shutdown(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
