//! # torvid-server
//!
//! Progressive torrent-to-HLS streaming server.
//!
//! One binary hosts three task trees, selectable with `--role` so they can
//! also run as separate processes sharing Postgres, Redis, and the media
//! filesystem:
//!
//! - the HTTP serving surface (axum),
//! - the download monitor,
//! - the transcode worker (plus its heartbeat).

mod errors;
mod hls_handlers;
mod media_handlers;
mod routes;
mod state;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torvid_core::Settings;
use torvid_core::downloader::JsonRpcDownloader;
use torvid_core::monitor::DownloadMonitor;
use torvid_core::queue::{RedisJobQueue, RedisLiveStatusStore};
use torvid_core::records::PostgresMediaRecordStore;
use torvid_core::transcode::TranscodeWorker;

use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "torvid-server")]
#[command(about = "Progressive torrent-to-HLS streaming server")]
struct Args {
    /// Server bind host
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 8000)]
    port: u16,

    /// Which task trees to run in this process
    #[arg(long, env = "TORVID_ROLE", value_enum, default_value_t = Role::All)]
    role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// HTTP surface only
    Server,
    /// Download monitor only
    Monitor,
    /// Transcode worker only
    Worker,
    /// Everything in one process
    All,
}

impl Role {
    fn serves_http(self) -> bool {
        matches!(self, Self::Server | Self::All)
    }

    fn runs_monitor(self) -> bool {
        matches!(self, Self::Monitor | Self::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "torvid_server=debug,torvid_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env());
    info!("media root: {:?}", settings.media_root);

    tokio::fs::create_dir_all(&settings.media_root)
        .await
        .context("failed to create media root")?;
    tokio::fs::create_dir_all(&settings.download_root)
        .await
        .context("failed to create download root")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let records = Arc::new(PostgresMediaRecordStore::new(pool).await?);

    let queue = Arc::new(RedisJobQueue::new(&settings.redis_url).await?);
    let live = Arc::new(RedisLiveStatusStore::new(&settings.redis_url).await?);
    let downloader = Arc::new(JsonRpcDownloader::new(&settings.downloader)?);

    let monitor = args.role.runs_monitor().then(|| {
        let monitor = Arc::new(DownloadMonitor::new(
            downloader.clone(),
            records.clone(),
            queue.clone(),
            live.clone(),
            settings.as_ref().clone(),
        ));
        let handle = monitor.clone().start();
        (monitor, handle)
    });

    let worker = args.role.runs_worker().then(|| {
        let worker = Arc::new(TranscodeWorker::new(
            queue.clone(),
            records.clone(),
            live.clone(),
            settings.transcode.clone(),
            settings.media_root.clone(),
        ));
        let handle = worker.clone().start();
        let heartbeat = TranscodeWorker::spawn_heartbeat(live.clone());
        (worker, handle, heartbeat)
    });

    if args.role.serves_http() {
        let app_state = AppState {
            records,
            live,
            queue,
            downloader,
            settings: settings.clone(),
        };
        let app = routes::build_router(app_state);

        let addr: SocketAddr = format!("{}:{}", args.host, args.port)
            .parse()
            .context("invalid host/port")?;
        info!("torvid listening on http://{addr}");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind")?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    info!("shutting down");
    if let Some((monitor, handle)) = monitor {
        monitor.stop().await;
        handle.abort();
    }
    if let Some((worker, handle, heartbeat)) = worker {
        worker.stop().await;
        heartbeat.abort();
        let _ = heartbeat.await;
        handle.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}
