use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mail_triage::api::{ApiState, api_routes};
use mail_triage::channels::{EmailSource, ImapMailbox, MockMailbox};
use mail_triage::config::AppConfig;
use mail_triage::llm::create_provider;
use mail_triage::pipeline::heuristics::KeywordHeuristics;
use mail_triage::pipeline::{DecisionEngine, Pipeline};
use mail_triage::store::{AttachmentStore, LibSqlBackend, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let _log_guard = init_tracing();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    eprintln!("Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    if config.llm.mock_mode {
        eprintln!("   LLM: mock mode (keyword heuristics)");
    } else {
        eprintln!("   LLM: {} / {}", config.llm.backend.as_str(), config.llm.model);
    }
    eprintln!("   Database: {}", config.storage.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.server.port);

    // ── Storage ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.storage.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.storage.db_path.display()))?,
    );
    let attachments = Arc::new(AttachmentStore::new(&config.storage.attachments_dir));

    // ── Decision Engine ─────────────────────────────────────────────────
    let provider = create_provider(
        &config.llm,
        KeywordHeuristics::new(&config.decision.urgent_keywords),
    )?;
    let engine = Arc::new(DecisionEngine::new(provider, config.decision.clone()));

    // ── Email source ────────────────────────────────────────────────────
    let source: Arc<dyn EmailSource> = match config.mailbox.clone() {
        Some(mailbox) => {
            eprintln!("   Mailbox: {} ({})", mailbox.imap_host, mailbox.username);
            Arc::new(ImapMailbox::new(mailbox))
        }
        None => {
            eprintln!("   Mailbox: mock (EMAIL_IMAP_HOST not set)");
            Arc::new(MockMailbox::new())
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        engine,
        source,
        store,
        attachments,
        config.workflow.clone(),
        config.pipeline.clone(),
    ));

    // ── HTTP ────────────────────────────────────────────────────────────
    let cancel = Arc::new(AtomicBool::new(false));
    let app = api_routes(ApiState {
        pipeline,
        cancel: Arc::clone(&cancel),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;
    tracing::info!(port = config.server.port, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutting down; running batches stop after the current email");
            cancel.store(true, Ordering::SeqCst);
        })
        .await?;
    Ok(())
}

/// Console logging, plus a daily-rolling file when `MAIL_TRIAGE_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match std::env::var("MAIL_TRIAGE_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
