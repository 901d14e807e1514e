use std::sync::Arc;
use std::time::Duration;

use actix_multipart::Multipart;
use actix_web::{Error, HttpResponse, web};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::{AiResultDto, AnalysisImagesDto, ApiResponse, ImageUrlDto, SubmissionEvent};
use tokio::sync::mpsc;

use crate::db::ResultRepository;
use crate::db::models::{AiResult, compute_statistics};
use crate::orchestration::batch_orchestrator::BatchOrchestrator;
use crate::storage::{
    ObjectStore, StorageError, extract_file_extension, generate_upload_key, presign_from_candidates,
};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(mut builder: actix_web::HttpResponseBuilder, message: &str) -> HttpResponse {
    builder.json(ErrorResponse {
        error: message.to_string(),
    })
}

/// Everything the handlers share, generic over the storage backends.
pub struct AppState<S: ObjectStore, R: ResultRepository> {
    pub orchestrator: Arc<BatchOrchestrator<S, R>>,
    pub store: Arc<S>,
    pub repository: Arc<R>,
    pub source_buckets: Vec<String>,
    pub analysis_bucket: String,
    pub presigned_url_ttl: Duration,
    pub events: mpsc::Sender<Vec<u8>>,
    pub max_upload_bytes: usize,
}

#[derive(Deserialize)]
pub struct StatisticsQuery {
    application_id: Option<String>,
}

pub fn configure_routes<S: ObjectStore, R: ResultRepository>(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/ai").route(web::get().to(get_results::<S, R>)))
        .service(web::resource("/ai/predict").route(web::post().to(predict::<S, R>)))
        .service(web::resource("/ai/events").route(web::post().to(enqueue_event::<S, R>)))
        .service(web::resource("/ai/statistics").route(web::get().to(get_statistics::<S, R>)))
        .service(
            web::resource("/ai/applications/{application_id}")
                .route(web::get().to(get_result_by_application::<S, R>)),
        )
        .service(web::resource("/ai/{id}").route(web::get().to(get_result::<S, R>)))
        .service(web::resource("/ai/{id}/image").route(web::get().to(get_result_image::<S, R>)))
        .service(
            web::resource("/ai/{id}/analysis-images").route(web::get().to(get_analysis_images::<S, R>)),
        );
}

/// Wire form of a stored result with freshly minted presigned URLs.
async fn format_result<S: ObjectStore, R: ResultRepository>(
    state: &AppState<S, R>,
    result: AiResult,
) -> AiResultDto {
    let mut dto = result.into_dto();
    if let Some(image_path) = &dto.image_path {
        dto.original_image_url = presign_from_candidates(
            state.store.as_ref(),
            &state.source_buckets,
            image_path,
            state.presigned_url_ttl,
        )
        .await;
    }
    for image in &mut dto.leaf_analysis_images {
        image.presigned_url = state
            .store
            .presigned_url(&state.analysis_bucket, &image.image_path, state.presigned_url_ttl)
            .await;
    }
    dto
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

struct UploadedFile {
    data: Vec<u8>,
    file_name: Option<String>,
    content_type: String,
}

async fn predict<S: ObjectStore, R: ResultRepository>(
    state: web::Data<AppState<S, R>>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let mut file = None;
    let mut application_id = None;
    let mut user_id = None;

    while let Some(mut field) = payload.try_next().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let content_type = field.content_type().map(|m| m.essence_str().to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if data.len() + chunk.len() > state.max_upload_bytes {
                log::warn!("Rejecting upload field {} over {} bytes", name, state.max_upload_bytes);
                return Ok(error_response(
                    HttpResponse::PayloadTooLarge(),
                    &StorageError::FileTooLarge.to_string(),
                ));
            }
            data.extend_from_slice(&chunk);
        }

        match name.as_str() {
            "file" => {
                file = Some(UploadedFile {
                    data,
                    file_name,
                    content_type: content_type.unwrap_or_default(),
                })
            }
            "application_id" => application_id = Some(String::from_utf8_lossy(&data).trim().to_string()),
            "user_id" => user_id = Some(String::from_utf8_lossy(&data).trim().to_string()),
            _ => {}
        }
    }

    let (Some(file), Some(application_id), Some(user_id)) = (file, application_id, user_id) else {
        return Ok(error_response(
            HttpResponse::BadRequest(),
            "file, application_id and user_id are required",
        ));
    };
    if !file.content_type.starts_with("image/") {
        return Ok(error_response(HttpResponse::BadRequest(), "File must be an image"));
    }
    let extension = match extract_file_extension(&file.content_type) {
        Ok(extension) => extension,
        Err(e) => return Ok(error_response(HttpResponse::BadRequest(), &e.to_string())),
    };

    let image_key = generate_upload_key(&application_id, file.file_name.as_deref(), &file.data, extension);
    log::info!("Predicting disease for application {} from {}", application_id, image_key);
    match state
        .orchestrator
        .predict_upload(&application_id, &user_id, &image_key, file.data, &file.content_type)
        .await
    {
        Ok(stored) => {
            let dto = format_result(&state, stored).await;
            Ok(HttpResponse::Ok().json(ApiResponse::ok(dto, "Disease prediction completed successfully")))
        }
        Err(e) => {
            log::error!("Prediction failed for application {}: {}", application_id, e);
            Ok(error_response(HttpResponse::InternalServerError(), "Prediction failed"))
        }
    }
}

async fn enqueue_event<S: ObjectStore, R: ResultRepository>(
    state: web::Data<AppState<S, R>>,
    body: web::Bytes,
) -> HttpResponse {
    let event: SubmissionEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => return error_response(HttpResponse::BadRequest(), &format!("Invalid submission event: {}", e)),
    };
    match state.events.try_send(body.to_vec()) {
        Ok(()) => {
            log::info!("Queued submission {}", event.submission_id);
            HttpResponse::Accepted().json(ApiResponse::ok(event.submission_id, "Submission queued for analysis"))
        }
        Err(e) => {
            log::error!("Failed to queue submission {}: {}", event.submission_id, e);
            error_response(HttpResponse::ServiceUnavailable(), "Submission queue unavailable")
        }
    }
}

async fn get_results<S: ObjectStore, R: ResultRepository>(state: web::Data<AppState<S, R>>) -> HttpResponse {
    match state.repository.list_results(None).await {
        Ok(results) => {
            let mut formatted = Vec::with_capacity(results.len());
            for result in results {
                formatted.push(format_result(&state, result).await);
            }
            let message = format!("Retrieved {} AI results successfully", formatted.len());
            HttpResponse::Ok().json(ApiResponse::ok(formatted, message))
        }
        Err(e) => {
            log::error!("Failed to list results: {}", e);
            error_response(HttpResponse::InternalServerError(), "Failed to get results")
        }
    }
}

async fn get_statistics<S: ObjectStore, R: ResultRepository>(
    state: web::Data<AppState<S, R>>,
    query: web::Query<StatisticsQuery>,
) -> HttpResponse {
    match state.repository.list_results(query.application_id.as_deref()).await {
        Ok(results) => HttpResponse::Ok().json(ApiResponse::ok(
            compute_statistics(&results),
            "Statistics retrieved successfully",
        )),
        Err(e) => {
            log::error!("Failed to get prediction statistics: {}", e);
            error_response(HttpResponse::InternalServerError(), "Failed to get statistics")
        }
    }
}

/// The stored result for `id`, or the response to send instead.
async fn find_result<S: ObjectStore, R: ResultRepository>(
    state: &AppState<S, R>,
    id: &str,
) -> Result<AiResult, HttpResponse> {
    match state.repository.get_by_id(id).await {
        Ok(Some(result)) => Ok(result),
        Ok(None) => Err(error_response(HttpResponse::NotFound(), "Result not found")),
        Err(e) => {
            log::error!("Failed to get result {}: {}", id, e);
            Err(error_response(HttpResponse::InternalServerError(), "Failed to get result"))
        }
    }
}

async fn get_result<S: ObjectStore, R: ResultRepository>(
    state: web::Data<AppState<S, R>>,
    path: web::Path<String>,
) -> HttpResponse {
    match find_result(&state, &path).await {
        Ok(result) => {
            let dto = format_result(&state, result).await;
            HttpResponse::Ok().json(ApiResponse::ok(dto, "AI result retrieved successfully"))
        }
        Err(response) => response,
    }
}

async fn get_result_image<S: ObjectStore, R: ResultRepository>(
    state: web::Data<AppState<S, R>>,
    path: web::Path<String>,
) -> HttpResponse {
    let result = match find_result(&state, &path).await {
        Ok(result) => result,
        Err(response) => return response,
    };
    let Some(image_path) = result.image_path.clone() else {
        return error_response(HttpResponse::NotFound(), "No image associated with this result");
    };
    let Some(image_url) = presign_from_candidates(
        state.store.as_ref(),
        &state.source_buckets,
        &image_path,
        state.presigned_url_ttl,
    )
    .await
    else {
        return error_response(HttpResponse::InternalServerError(), "Failed to generate image URL");
    };

    let result_info = format_result(&state, result).await;
    HttpResponse::Ok().json(ApiResponse::ok(
        ImageUrlDto {
            image_url,
            expires_in: state.presigned_url_ttl.as_secs(),
            image_path,
            result_info,
        },
        "Image URL retrieved successfully",
    ))
}

async fn get_analysis_images<S: ObjectStore, R: ResultRepository>(
    state: web::Data<AppState<S, R>>,
    path: web::Path<String>,
) -> HttpResponse {
    let result = match find_result(&state, &path).await {
        Ok(result) => result,
        Err(response) => return response,
    };
    let dto = format_result(&state, result).await;
    HttpResponse::Ok().json(ApiResponse::ok(
        AnalysisImagesDto {
            result_id: dto.id,
            total_images: dto.leaf_analysis_images.len(),
            analysis_images: dto.leaf_analysis_images,
        },
        "Analysis images retrieved successfully",
    ))
}

async fn get_result_by_application<S: ObjectStore, R: ResultRepository>(
    state: web::Data<AppState<S, R>>,
    path: web::Path<String>,
) -> HttpResponse {
    let application_id = path.into_inner();
    match state.repository.get_by_application_id(&application_id).await {
        Ok(Some(result)) => {
            let dto = format_result(&state, result).await;
            let message = format!("Retrieved AI result for application ID {} successfully", application_id);
            HttpResponse::Ok().json(ApiResponse::ok(dto, message))
        }
        Ok(None) => error_response(HttpResponse::NotFound(), "Result not found"),
        Err(e) => {
            log::error!("Failed to get result for application {}: {}", application_id, e);
            error_response(HttpResponse::InternalServerError(), "Failed to get results")
        }
    }
}
