//! Merge staged customer imports into the registry.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use futures::future::{select, Either};
use tracing_subscriber::EnvFilter;

use merge_common::address::{AddressResolver, Geocode, OgcGeocoder, PgReferenceLookup};
use merge_common::health::HealthRegistry;
use merge_common::metrics::{serve, setup_metrics_router};
use merge_common::pool::connect;
use merge_common::runs::PgRunStore;
use merge_common::staging::PgStagingSource;
use merge_common::writer::PgCustomerWriter;
use merge_worker::config::Config;
use merge_worker::error::WorkerError;
use merge_worker::merger::Merger;
use merge_worker::worker::MergeWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register(
            &config.worker_name,
            time::Duration::try_from(config.stalled_run_timeout.0)
                .unwrap_or(time::Duration::HOUR),
        )
        .await;

    let pool = connect(&config.database_url, config.max_pg_connections).await?;

    let geocoder: Option<Arc<dyn Geocode + Send + Sync>> = if config.geocoder_enabled {
        let ogc: Arc<dyn Geocode + Send + Sync> = Arc::new(OgcGeocoder::new(
            config.geocoder_url.as_str(),
            config.geocoder_timeout.0,
        )?);
        Some(ogc)
    } else {
        tracing::warn!("geocoder disabled, unmatched addresses stay without coordinates");
        None
    };
    let resolver = AddressResolver::new(Arc::new(PgReferenceLookup::new(pool.clone())), geocoder);

    let runs = Arc::new(PgRunStore::new(pool.clone()));
    let merger = Merger::new(
        Arc::new(PgStagingSource::new(pool.clone())),
        resolver,
        Arc::new(PgCustomerWriter::new(pool)),
        runs.clone(),
        config.batch_size,
    );
    let worker = MergeWorker::new(
        &config.worker_name,
        merger,
        runs,
        config.poll_interval.0,
        config.stalled_run_timeout.0,
        worker_liveness,
    );

    let router = setup_metrics_router()?
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let bind = config.bind();
    let http_server = Box::pin(serve(router, &bind));
    let worker_loop = Box::pin(worker.run());

    match select(http_server, worker_loop).await {
        Either::Left((Err(e), _)) => tracing::error!("failed to serve metrics and liveness, {}", e),
        Either::Left((Ok(_), _)) => tracing::error!("metrics and liveness server exited"),
        Either::Right((_, _)) => tracing::error!("merge worker loop exited"),
    };

    Ok(())
}
