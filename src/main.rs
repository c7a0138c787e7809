use actix::prelude::*;
use actix_web::middleware::TrailingSlash;
use actix_web::{web::Data, App, HttpServer};
use anyhow::Context as AnyhowContext;
use catalog_client::CatalogClient;
use fbt_publisher::{
    config::Settings,
    control,
    mapping::SqliteMappingRepository,
    orchestrator::Orchestrator,
    service::PublishService,
    transaction::SqliteTransactionRepository,
};
use indicatif::ProgressStyle;
use log_error::LogError;
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;

fn show_progress() -> bool {
    match std::env::var("FBT_PROGRESS_BAR") {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    match std::fs::File::open(".env") {
        Ok(_) => envmnt::load_file(".env")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(".env")?;
            envmnt::load_file(".env")?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to open .env file: {err}"));
        }
    }
    let settings = Settings::from_env()?;

    if let Some(dir) = settings.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create {}", dir.display()))?;
    }
    // Each repository owns its connection; WAL lets them share the file.
    let conn = Connection::open(&settings.db_path).await?;
    let mapping_repository = Arc::new(SqliteMappingRepository::init(conn).await?);
    let conn = Connection::open(&settings.db_path).await?;
    let transaction_repository = Arc::new(SqliteTransactionRepository::init(conn).await?);

    let client = CatalogClient::new(settings.catalog.clone())?;
    log::info!("Publishing to catalog at {}", client.base_url());
    let orchestrator = Orchestrator::new(
        mapping_repository,
        transaction_repository,
        Arc::new(client.clone()),
        settings.batch,
    );

    let pb_style = if show_progress() {
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos:>7}/{len:7} {msg}")
            .log_error("Unable to initialize progress bar")
            .map(|p| p.progress_chars("=-"))
    } else {
        None
    };

    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async {
        let token = t;
        match signal::ctrl_c().await {
            Ok(_) => {
                log::info!("Shutdown requested, cancelling running pushes");
                token.cancel()
            }
            Err(err) => log::error!("Unable to listen to shutdown: {err}"),
        }
    });

    let publish_service = PublishService::new(
        Arc::new(orchestrator),
        client,
        settings.overrides_path.clone(),
        settings.sync_page_size,
        token.clone(),
        pb_style,
    )
    .start();

    let bind_addr = settings.bind_addr.clone();
    log::info!("Listening on {bind_addr}");
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::NormalizePath::new(TrailingSlash::Trim))
            .app_data(Data::new(Arc::new(publish_service.clone())))
            .configure(control::configure)
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind server to {bind_addr}. Is the port already in use?"))?
    .run()
    .await?;
    Ok(())
}
