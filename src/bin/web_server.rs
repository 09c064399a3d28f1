use std::{path::PathBuf, sync::Arc, time::Duration};

use cert_server::{
    api::{ApiDoc, router},
    config::{Config, Secrets},
    db,
    server::Server,
    utils::init_log,
};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "cert-server.toml")]
    config: PathBuf,
    /// Overrides the database path from the config file.
    #[arg(short, long)]
    database: Option<PathBuf>,
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    #[arg(short, long, default_value = "8080")]
    port: u16,
    /// Directory for daily-rotated log files; stdout when absent.
    #[arg(short, long)]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_log(args.log_dir.clone())?;

    let mut config = Config::load(&args.config)?;
    if let Some(database) = args.database {
        config.database = database;
    }
    let secrets = Secrets::from_env()?;
    let database = db::open(&config.database).await?;
    let server = Arc::new(Server::new(database, config, &secrets)?);

    let app = router(server)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TimeoutLayer::new(Duration::from_secs(args.request_timeout_secs)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("listening on http://{}", listener.local_addr()?);
    info!(
        "Swagger UI available at http://{}:{}/swagger-ui/",
        args.host, args.port
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
