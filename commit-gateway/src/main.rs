//! The actor entry point (C7): polls a `JobSource` for commit jobs, drives
//! each through `commit_core::CommitEngine`, and serves a metrics/liveness
//! HTTP surface alongside the poll loop.

mod broker;
mod config;
mod observability;

use std::sync::Arc;

use commit_core::commit::phase1::Phase1;
use commit_core::commit::phase2::Phase2;
use commit_core::commit::{CommitContext, CommitEngine, NullAutoindexEnricher};
use commit_core::config::Settings;
use commit_core::flusher::NullVendorClient;
use commit_core::kv::{DynamoKvStore, KvStore};
use commit_core::types::CommitMode;
use envconfig::Envconfig;
use futures::future::{select, Either};
use sqlx::postgres::PgPoolOptions;

use broker::{CommitJob, InMemoryJobSource, JobSource};
use config::GatewayConfig;
use observability::Liveness;

async fn listen(app: axum::Router, bind: String) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await
}

async fn poll_loop(
    source: Arc<dyn JobSource>,
    pool: sqlx::PgPool,
    settings: Arc<Settings>,
    kv_store: Arc<dyn KvStore>,
    poll_interval: std::time::Duration,
    liveness: Arc<Liveness>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;
        liveness.report_healthy();

        let Some(job) = source.next_job().await else {
            continue;
        };
        run_job(job, &pool, settings.clone(), kv_store.clone()).await;
    }
}

#[tracing::instrument(skip(pool, settings, kv_store), fields(task_id = %job.task_id, publish_id = %job.publish_id))]
async fn run_job(job: CommitJob, pool: &sqlx::PgPool, settings: Arc<Settings>, kv_store: Arc<dyn KvStore>) {
    let env_config = match settings.environment(&job.env) {
        Ok(cfg) => cfg.clone(),
        Err(err) => {
            tracing::error!(error = %err, "unknown environment, dropping job");
            return;
        }
    };

    let ctx = CommitContext {
        publish_id: job.publish_id,
        env: job.env.clone(),
        env_config,
        task_id: job.task_id.clone(),
        from_date: job.from_date,
        settings: settings.clone(),
        pool: pool.clone(),
        kv_store,
        vendor: Arc::new(NullVendorClient),
    };

    let engine = match job.commit_mode {
        CommitMode::Phase1 => CommitEngine::new(ctx, Box::new(Phase1)),
        CommitMode::Phase2 => CommitEngine::new(ctx, Box::new(Phase2::new(Arc::new(NullAutoindexEnricher)))),
    };

    engine.run().await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = GatewayConfig::init_from_env().expect("failed to load configuration from env");
    let settings = Arc::new(
        Settings::load(config.settings_path.as_deref()).expect("failed to load engine settings"),
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let kv_store: Arc<dyn KvStore> = Arc::new(DynamoKvStore::new(aws_sdk_dynamodb::Client::new(&aws_config)));

    let source: Arc<dyn JobSource> = Arc::new(InMemoryJobSource::new());
    let liveness = Arc::new(Liveness::new(config.poll_interval_secs as i64 * 3));

    let poll = Box::pin(poll_loop(
        source,
        pool,
        settings,
        kv_store,
        std::time::Duration::from_secs(config.poll_interval_secs),
        liveness.clone(),
    ));

    let app = observability::router(liveness);
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, poll).await {
        Either::Left((Ok(()), _)) => {}
        Either::Left((Err(err), _)) => tracing::error!(error = %err, "http server exited"),
        Either::Right(((), _)) => tracing::error!("poll loop exited"),
    }
}
