use std::sync::Arc;

use clf_core::{
    config::Config,
    formatter::FormatterService,
    quota::{QuotaTracker, SystemClock},
    store::JsonFileStore,
};
use clf_gigachat::{GigaChatClient, GigaChatConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clf_core::logging::init("clf")?;

    let cfg = Arc::new(Config::load()?);

    let store = Arc::new(JsonFileStore::new(cfg.stats_file.clone()));
    let quota = Arc::new(QuotaTracker::new(
        cfg.limits(),
        cfg.thresholds(),
        Arc::new(SystemClock),
        store,
    )?);

    let client = Arc::new(GigaChatClient::new(GigaChatConfig {
        auth_url: cfg.auth_url.clone(),
        api_url: cfg.api_url.clone(),
        client_id: cfg.client_id.clone(),
        client_secret: cfg.client_secret.clone(),
        oauth_scope: cfg.oauth_scope.clone(),
        model: cfg.model.clone(),
        temperature: cfg.temperature,
        timeout: cfg.api_timeout,
        accept_invalid_certs: cfg.accept_invalid_certs,
    }));

    let service = FormatterService::new(cfg.clone(), client, quota.clone());

    log_stats("token usage", &quota).await;

    if std::env::args().any(|a| a == "--watch") {
        let cancel = CancellationToken::new();
        let cancel_on_signal = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            cancel_on_signal.cancel();
        });

        service.run_watch(cancel).await?;
    } else {
        let summary = service.run_once().await?;
        info!(
            "run complete: {} formatted, {} skipped, {} denied, {} failed",
            summary.formatted, summary.skipped, summary.denied, summary.failed
        );
    }

    log_stats("updated token usage", &quota).await;

    let history = quota.history_since(7).await;
    if !history.is_empty() {
        let total: u64 = history.iter().map(|e| e.tokens).sum();
        info!(
            "last 7 days: {total} tokens total, {:.1} per day",
            total as f64 / 7.0
        );
    }

    Ok(())
}

async fn log_stats(label: &str, quota: &QuotaTracker) {
    let stats = quota.stats().await;
    info!(
        "{label}: daily {}/{} ({:.1}%), monthly {}/{} ({:.1}%)",
        stats.daily.used,
        stats.daily.limit,
        stats.daily.percent(),
        stats.monthly.used,
        stats.monthly.limit,
        stats.monthly.percent()
    );
}
