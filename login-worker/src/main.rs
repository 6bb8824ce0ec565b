//! Drain the login queue into `user_logins`, quarantining what can't be stored.
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use login_common::{
    health::HealthRegistry,
    metrics::{serve, setup_metrics_router},
    pgstore::PgStore,
    retry::RetryPolicy,
    sqs::SqsQueue,
};
use login_worker::config::Config;
use login_worker::error::WorkerError;
use login_worker::worker::LoginWorker;

/// Flip `shutdown` to true on SIGTERM or SIGINT.
async fn listen_for_shutdown(shutdown: watch::Sender<bool>) {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully...");
    _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    // The drain loop checks in at least once per queue call, so it is stalled once a queue
    // call outlives its timeout twice over.
    let deadline = config.queue_timeout.0.max(config.poll_interval.0) * 2;
    let drain_liveness = liveness
        .register(
            "drain_loop".to_string(),
            time::Duration::try_from(deadline).unwrap_or(time::Duration::minutes(1)),
        )
        .await;

    let bind = config.bind();
    let router = setup_metrics_router(liveness);
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    let store = PgStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.database_timeout.0,
    )
    .await?;

    let queue = SqsQueue::new(
        config.queue_url.as_str(),
        &config.aws_region,
        config.aws_endpoint_url.as_ref().map(|url| url.as_str()),
        config.batch_size,
        config.receive_wait_seconds,
    )
    .await;

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::task::spawn(listen_for_shutdown(shutdown_tx));

    let worker = LoginWorker::new(
        &queue,
        &store,
        config.poll_interval.0,
        config.queue_timeout.0,
        retry_policy,
        config.max_receive_count,
        drain_liveness,
    );
    worker.run_until(shutdown_rx).await;

    drop(worker);
    store.close().await;
    info!("login store closed");

    Ok(())
}
