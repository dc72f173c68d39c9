//service/mod.rs
pub mod decision;
pub mod executor;
pub mod ledger;
pub mod lifecycle_service;
pub mod response;
pub mod sweeper;
pub mod user_context;

use actix_web::error::ErrorBadRequest;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::LifecycleError;
use crate::metadata::FileId;
use crate::service::sweeper::SweepTotals;
use crate::service::user_context::CallerContext;

fn header_handler(req: &HttpRequest) -> Result<CallerContext, Error> {
    let caller_id = req
        .headers()
        .get("User")
        .ok_or_else(|| ErrorBadRequest("Missing User header"))?
        .to_str()
        .map_err(|_| ErrorBadRequest("Invalid User header value"))?
        .trim()
        .to_string();
    if caller_id.is_empty() {
        return Err(ErrorBadRequest("Empty User header"));
    }

    let mut context = match req.headers().get("X-Request-Id").and_then(|h| h.to_str().ok()) {
        Some(request_id) => CallerContext::with_request_id(caller_id, request_id),
        None => CallerContext::new(caller_id),
    };

    log_mdc::insert("user", &context.caller_id);
    log_mdc::insert("request_id", &context.request_id);

    if let Some(agent) = req.headers().get("User-Agent").and_then(|h| h.to_str().ok()) {
        context.set_metadata("user-agent".to_string(), agent.to_string());
    }

    Ok(context)
}

fn parse_file_id(raw: &str) -> Result<FileId, LifecycleError> {
    let file_id = Uuid::parse_str(raw)
        .map_err(|_| LifecycleError::InvalidInput(format!("invalid file id: {}", raw)))?;
    log_mdc::insert("file_id", file_id.to_string());
    Ok(file_id)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchDeleteRequest {
    pub file_ids: Vec<FileId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sweeper: SweepTotals,
}

pub async fn delete_file_service(
    file_id: String,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let file_id = parse_file_id(&file_id)?;
    debug!(
        "DELETE requested by {} for file {} (request {})",
        context.caller_id, file_id, context.request_id
    );

    let response = app_state
        .lifecycle
        .request_deletion(file_id, &context.caller_id)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn batch_delete_service(
    body: web::Json<BatchDeleteRequest>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let request = body.into_inner();
    info!(
        "Batch delete of {} files requested by {}",
        request.file_ids.len(),
        context.caller_id
    );

    let response = app_state
        .lifecycle
        .request_batch_deletion(&request.file_ids, &context.caller_id)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_file_service(
    file_id: String,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let file_id = parse_file_id(&file_id)?;
    debug!("GET file {} by {}", file_id, context.caller_id);

    let file = app_state.lifecycle.get_file(&file_id).await?;
    Ok(HttpResponse::Ok().json(file))
}

pub async fn get_references_service(
    file_id: String,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let file_id = parse_file_id(&file_id)?;
    debug!("GET references of file {} by {}", file_id, context.caller_id);

    let summary = app_state.lifecycle.get_references(&file_id).await?;
    Ok(HttpResponse::Ok().json(summary))
}

pub async fn upload_service(
    body: web::Bytes,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let mime_type = req
        .headers()
        .get("Content-Type")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    info!(
        "Upload of {} bytes ({}) by {}",
        body.len(),
        mime_type,
        context.caller_id
    );

    let file = app_state
        .lifecycle
        .ingest_file(Some(context.caller_id), &mime_type, body, false)
        .await?;
    Ok(HttpResponse::Created().json(file))
}

pub async fn health_service(app_state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        sweeper: app_state.lifecycle.sweep_totals(),
    })
}
