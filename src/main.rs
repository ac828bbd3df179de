use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use autorip::activity::ActivityLog;
use autorip::api::{ApiServer, AppState};
use autorip::config::AppConfig;
use autorip::engine::RipEngine;
use autorip::identify::MetadataServiceIdentifier;
use autorip::notify::{LibraryNotifier, NoopNotifier, WebhookNotifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = AppConfig::path_from_env();
    let config = AppConfig::load(&config_path)?;

    let _log_guard = autorip::logging::init_logging(&config.paths.log_dir)?;
    let shutdown = CancellationToken::new();
    autorip::logging::start_retention_cleanup(config.paths.log_dir.clone(), shutdown.clone());

    let identifier = Arc::new(MetadataServiceIdentifier::new(
        config.identification.service_url.clone(),
        config.identification.api_key.clone(),
    )?);
    let notifier: Arc<dyn LibraryNotifier> = if config.notifications.rescan_url.is_empty() {
        Arc::new(NoopNotifier)
    } else {
        Arc::new(WebhookNotifier::new(config.notifications.rescan_url.clone())?)
    };
    let activity = Arc::new(ActivityLog::new());

    let server_config = config.server.clone();
    let engine = RipEngine::new(config, identifier, notifier, activity);

    // Pick up anything a crash left behind before accepting requests
    engine.recover().await;

    tracing::info!("autorip initialized");

    let server = ApiServer::new(server_config, AppState::new(engine));
    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            cancel.cancel();
        }
    });
    server.run().await?;

    shutdown.cancel();
    Ok(())
}
