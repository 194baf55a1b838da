use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use diffci::config::{AppConfig, ExecutorKind, QueueKind};
use diffci::db::{self, PgStore, Store};
use diffci::executor::{DockerExecutorFactory, ExecutorFactory, FileSystemExecutorFactory};
use diffci::forge::GitHubClient;
use diffci::models::job::QueuedJob;
use diffci::queue::{
    self, GcpPubSubTransport, MemoryQueue, PubSubQueue, PubSubTransport, Queue,
};
use diffci::routes;
use diffci::services::dispatch::Dispatcher;
use diffci::AppState;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

enum QueueBacking {
    Memory(tokio::sync::mpsc::Receiver<QueuedJob>),
    PubSub(Arc<dyn PubSubTransport>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "diffci=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!("configuration: {e}"))?;

    // One token reaches everything long-running: the HTTP server, the
    // queue worker, and every executor session.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    tracing::info!(executor = ?config.executor, "initialising executor");
    let factory: Arc<dyn ExecutorFactory> = match config.executor {
        ExecutorKind::Filesystem => {
            let root = config
                .executor_filesystem_path
                .clone()
                .expect("checked by AppConfig::from_env");
            Arc::new(FileSystemExecutorFactory::new(root))
        }
        ExecutorKind::Docker => {
            Arc::new(DockerExecutorFactory::new(config.executor_docker_image.clone()))
        }
    };

    let forge = Arc::new(GitHubClient::from_key_file(
        config.github_app_id,
        &config.github_private_key_path,
    )?);

    tracing::info!(queue = ?config.queue, "initialising queue");
    let (job_queue, backing): (Arc<dyn Queue>, QueueBacking) = match config.queue {
        QueueKind::Memory => {
            let (q, rx) = MemoryQueue::new(64);
            (Arc::new(q), QueueBacking::Memory(rx))
        }
        QueueKind::PubSub => {
            let project = config
                .pubsub_project_id
                .clone()
                .expect("checked by AppConfig::from_env");
            let topic = config
                .pubsub_topic
                .clone()
                .expect("checked by AppConfig::from_env");
            let transport: Arc<dyn PubSubTransport> =
                Arc::new(GcpPubSubTransport::new(&project, &topic));
            (
                Arc::new(PubSubQueue::new(transport.clone())),
                QueueBacking::PubSub(transport),
            )
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        forge,
        factory,
        job_queue,
        config.base_url.clone(),
        cancel.clone(),
    ));

    let handler_dispatcher = dispatcher.clone();
    let handler = move |job: QueuedJob| {
        let dispatcher = handler_dispatcher.clone();
        async move { dispatcher.process(job).await }
    };
    let worker = match backing {
        QueueBacking::Memory(rx) => queue::memory::wait(rx, cancel.clone(), handler),
        QueueBacking::PubSub(transport) => queue::pubsub::wait(transport, cancel.clone(), handler),
    };

    let state = AppState {
        store,
        dispatcher,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/gh/webhook", post(routes::webhook::receive))
        .route("/gh/callback", get(routes::callback::callback))
        .route("/analysis/{id}", get(routes::analysis::show))
        .route("/health-check", get(routes::health::check))
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "listening");

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await?;

    // The worker finishes its in-flight job before we exit.
    tracing::info!("waiting for queue worker to finish");
    cancel.cancel();
    worker.await?;
    tracing::info!("exiting gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
