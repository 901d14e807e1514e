mod analysis;
mod config;
mod db;
mod orchestration;
mod routes;
mod storage;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use analysis::artifacts::ArtifactPublisher;
use analysis::kernel::AnalysisKernel;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use config::AppConfig;
use db::dynamodb_repository::DynamoDbRepository;
use orchestration::batch_orchestrator::BatchOrchestrator;
use orchestration::persistence::PersistenceCoordinator;
use orchestration::worker;
use routes::{AppState, configure_routes};
use std::env;
use std::sync::Arc;
use storage::s3_service::S3Service;
use tokio::sync::mpsc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = AppConfig::from_env().map_err(|e| std::io::Error::other(e.to_string()))?;
    let analysis_config = config
        .analysis_config()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let model = analysis::classifier::load_model(
        config.model_path.as_deref(),
        config.model_input_size,
        config.model_output_logits,
    )
    .map_err(|e| std::io::Error::other(e.to_string()))?;
    let kernel = Arc::new(AnalysisKernel::new(&analysis_config, model));
    if !kernel.has_model() {
        log::warn!("No disease model loaded, results will carry severity only");
    }

    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws_region.clone()))
        .load()
        .await;
    let repository = Arc::new(DynamoDbRepository::new(
        DynamoDbClient::new(&aws_config),
        config.results_table.clone(),
    ));
    let store = Arc::new(S3Service::from_config(&config).await);

    let publisher = config
        .publish_artifacts
        .then(|| ArtifactPublisher::new(store.clone(), config.analysis_bucket.clone()));
    let orchestrator = Arc::new(BatchOrchestrator::new(
        kernel,
        store.clone(),
        config.source_buckets.clone(),
        config.analysis_bucket.clone(),
        publisher,
        PersistenceCoordinator::new(repository.clone(), config.retry_policy),
    ));

    let (events, receiver) = mpsc::channel(config.event_queue_capacity.max(1));
    actix_web::rt::spawn(worker::run(
        orchestrator.clone(),
        receiver,
        config.submission_providers.clone(),
    ));

    let state = web::Data::new(AppState {
        orchestrator,
        store,
        repository,
        source_buckets: config.source_buckets.clone(),
        analysis_bucket: config.analysis_bucket.clone(),
        presigned_url_ttl: config.presigned_url_ttl,
        events,
        max_upload_bytes: config.max_upload_bytes,
    });

    let bind_address = format!("0.0.0.0:{}", config.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(state.clone())
            .configure(configure_routes::<S3Service, DynamoDbRepository>)
    })
    .bind(&bind_address)?
    .run()
    .await
}
