use std::sync::Arc;

use anyhow::Context;
use outreach_engine::config::OutreachConfig;
use outreach_engine::mailer::create_mailer;
use outreach_engine::server::{AppState, outreach_routes};
use outreach_engine::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OutreachConfig::from_env().context("Invalid configuration")?;

    eprintln!("📨 Outreach Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.bind);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Mailer: {}", config.mailer.provider());
    eprintln!("   Batch size: {}\n", config.batch_size);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Mailer ───────────────────────────────────────────────────────────
    let mailer = create_mailer(&config.mailer).context("Failed to configure mailer")?;

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = outreach_routes(AppState::new(&config, db, mailer));
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "Outreach server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}
