//! HTTP routes

use actix_web::{delete, get, post, web, Error, HttpRequest, HttpResponse};

use crate::app_state::AppState;
use crate::service::{
    batch_delete_service, delete_file_service, get_file_service, get_references_service,
    health_service, upload_service, BatchDeleteRequest,
};

#[post("/files")]
pub async fn upload(
    body: web::Bytes,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    upload_service(body, req, app_state).await
}

#[post("/files/batch-delete")]
pub async fn batch_delete(
    body: web::Json<BatchDeleteRequest>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    batch_delete_service(body, req, app_state).await
}

#[delete("/files/{file_id}")]
pub async fn delete_file(
    path: web::Path<String>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    delete_file_service(path.into_inner(), req, app_state).await
}

#[get("/files/{file_id}")]
pub async fn get_file(
    path: web::Path<String>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    get_file_service(path.into_inner(), req, app_state).await
}

#[get("/files/{file_id}/references")]
pub async fn get_references(
    path: web::Path<String>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    get_references_service(path.into_inner(), req, app_state).await
}

#[get("/health")]
pub async fn health(app_state: web::Data<AppState>) -> HttpResponse {
    health_service(app_state).await
}

/// Register every route on an app or scope
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(upload)
        .service(batch_delete)
        .service(delete_file)
        .service(get_references)
        .service(get_file)
        .service(health);
}
