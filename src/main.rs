use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use axum::{response::Html, routing::get, Extension, Router};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use mongodb::{options::ClientOptions, Client as MongoClient, Database};
use tokio_cron_scheduler::{Job, JobScheduler};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

use post_import_service::cli::{run_import, Cli, Command};
use post_import_service::config::{Config, StoreBackend};
use post_import_service::migrations::ensure_indexes;
use post_import_service::processing::{HttpImageFetcher, S3AttachmentStore};
use post_import_service::schema::{build_schema, ImportSchema};
use post_import_service::storage::{
    AttachmentStore, ContentStore, MemoryAttachmentStore, MemoryContentStore, MemorySessionStore,
    MongoContentStore, MongoSessionStore, SessionStore,
};
use post_import_service::sync::ImportEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load this crate's .env regardless of current working directory
    let _ = dotenvy::from_filename(concat!(env!("CARGO_MANIFEST_DIR"), "/.env"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .init();

    let cfg = Config::from_env();
    let command = Cli::parse().command();

    tracing::info!(
        database = %cfg.database_name,
        store_backend = ?cfg.store_backend,
        batch_size = cfg.default_batch_size,
        scheduler_enabled = cfg.enable_scheduler,
        "Loaded configuration"
    );

    let db = match cfg.store_backend {
        StoreBackend::Mongodb => Some(connect_mongo(&cfg).await?),
        StoreBackend::Memory => None,
    };

    if command == Command::Migrate {
        let db = db.ok_or_else(|| anyhow::anyhow!("migrate requires STORE_BACKEND=mongodb"))?;
        ensure_indexes(&db).await?;
        tracing::info!("Indexes are up to date");
        return Ok(());
    }

    if let (Some(db), true) = (&db, cfg.auto_migrate) {
        tracing::info!("Ensuring indexes on startup...");
        if let Err(e) = ensure_indexes(db).await {
            tracing::warn!(error = %e, "Failed to ensure indexes on startup");
        }
    }

    let engine = build_engine(&cfg, db).await?;

    if let Command::Import(import) = command {
        let progress = run_import(&engine, import).await?;
        println!(
            "done={} imported={} skipped={} failed={} total={}",
            progress.done, progress.imported, progress.skipped, progress.failed, progress.total
        );
        return Ok(());
    }

    let schema = build_schema(engine.clone());

    let scheduler = JobScheduler::new().await?;
    if cfg.enable_scheduler {
        start_eviction_scheduler(&scheduler, engine.clone(), cfg.session_ttl()).await?;
        scheduler.start().await?;
        tracing::info!(ttl_hours = cfg.session_ttl_hours, "Session eviction scheduler started");
    }

    let app = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .route("/health", get(health_check))
        .layer(Extension(schema))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.port).parse()?;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                tracing::error!(port = cfg.port, "Port is already in use. Try changing PORT env var or stop the other process.");
            }
            return Err(e.into());
        }
    };
    tracing::info!(port = cfg.port, "Post import service listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn connect_mongo(cfg: &Config) -> anyhow::Result<Database> {
    // Some deployments require retryWrites=false explicitly in the URI
    let mut effective_uri = cfg.mongodb_uri.clone();
    if !cfg.mongodb_retry_writes {
        if effective_uri.contains("retryWrites=") {
            effective_uri = effective_uri
                .replace("retryWrites=true", "retryWrites=false")
                .replace("retryWrites=1", "retryWrites=false");
        } else if effective_uri.contains('?') {
            effective_uri.push_str("&retryWrites=false");
        } else {
            effective_uri.push_str("?retryWrites=false");
        }
    }
    let mut client_options = ClientOptions::parse(&effective_uri).await?;
    client_options.retry_writes = Some(cfg.mongodb_retry_writes);
    let client = MongoClient::with_options(client_options)?;
    Ok(client.database(&cfg.database_name))
}

async fn build_engine(cfg: &Config, db: Option<Database>) -> anyhow::Result<ImportEngine> {
    let (sessions, content, attachments): (Arc<dyn SessionStore>, Arc<dyn ContentStore>, Arc<dyn AttachmentStore>) =
        match db {
            Some(db) => (
                Arc::new(MongoSessionStore::with_db(db.clone())),
                Arc::new(MongoContentStore::with_db(db.clone())),
                Arc::new(S3AttachmentStore::new(cfg, db).await?),
            ),
            None => (
                Arc::new(MemorySessionStore::new()),
                Arc::new(MemoryContentStore::new()),
                Arc::new(MemoryAttachmentStore::new()),
            ),
        };
    let fetcher = Arc::new(HttpImageFetcher::new(cfg)?);
    Ok(ImportEngine::from_config(cfg, sessions, content, attachments, fetcher)?)
}

async fn start_eviction_scheduler(
    scheduler: &JobScheduler,
    engine: ImportEngine,
    ttl: Duration,
) -> anyhow::Result<()> {
    // Top of every hour
    let eviction_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            if let Err(e) = engine.evict_stale_sessions(ttl).await {
                tracing::error!(error = %e, "Error evicting stale import sessions");
            }
        })
    })?;

    scheduler.add(eviction_job).await?;
    Ok(())
}

async fn graphql_playground() -> Html<String> {
    Html(async_graphql::http::playground_source(
        async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
    ))
}

async fn graphql_handler(
    Extension(schema): Extension<ImportSchema>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

async fn health_check() -> &'static str {
    "OK"
}
