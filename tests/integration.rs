use actix_web::{http::StatusCode, test, web, App};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;

use file_lifecycle::api;
use file_lifecycle::app_state::AppState;
use file_lifecycle::config::AppConfig;
use file_lifecycle::metadata::mock_store::MockMetadataStore;
use file_lifecycle::metadata::{EntityType, FileId};
use file_lifecycle::service::ledger::AssumeLiveResolver;
use file_lifecycle::service::HealthResponse;
use file_lifecycle::storage::mock_store::MockBlobStore;

fn test_state() -> (AppState, MockMetadataStore, MockBlobStore) {
    let store = MockMetadataStore::new();
    let blobs = MockBlobStore::new();
    let state = AppState::with_backends(
        Arc::new(store.clone()),
        Arc::new(blobs.clone()),
        Arc::new(AssumeLiveResolver),
        AppConfig::default(),
    );
    (state, store, blobs)
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state))
                .configure(api::configure),
        )
        .await
    };
}

macro_rules! upload_file {
    ($app:expr, $user:expr, $data:expr) => {{
        let req = test::TestRequest::post()
            .uri("/files")
            .insert_header(("content-type", "image/png"))
            .insert_header(("user", $user))
            .set_payload(Bytes::from_static($data))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["state"], "active");
        assert_eq!(body["mime_type"], "image/png");
        let file_id: FileId = body["id"].as_str().unwrap().parse().unwrap();
        file_id
    }};
}

#[actix_web::test]
async fn test_upload_delete_then_not_found() {
    let (state, _, blobs) = test_state();
    let app = app!(state);
    let file_id = upload_file!(app, "testuser1", b"1234");
    assert_eq!(blobs.object_count(), 1);

    let req = test::TestRequest::delete()
        .uri(&format!("/files/{}", file_id))
        .insert_header(("user", "testuser1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["operation"], "hard_deleted");
    assert_eq!(body["storage_freed"], 4);
    assert_eq!(body["file_id"], file_id.to_string());
    assert!(body["references_count"].is_null());

    let req = test::TestRequest::get()
        .uri(&format!("/files/{}", file_id))
        .insert_header(("user", "testuser1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "NOT_FOUND");
}

#[actix_web::test]
async fn test_referenced_file_is_soft_detached() {
    let (state, _, _) = test_state();
    let lifecycle = Arc::clone(&state.lifecycle);
    let app = app!(state);
    let file_id = upload_file!(app, "u1", b"story art");
    lifecycle.add_reference(&file_id, EntityType::Story, "s1").await.unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/files/{}/references", file_id))
        .insert_header(("user", "u1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["types"], json!(["story"]));
    assert_eq!(body["by_type"][0]["count"], 1);

    let req = test::TestRequest::delete()
        .uri(&format!("/files/{}", file_id))
        .insert_header(("user", "u1"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["operation"], "soft_detached");
    assert_eq!(body["references_count"], 1);
    assert_eq!(body["reference_types"], json!(["story"]));

    // repeating the request is a no-op
    let req = test::TestRequest::delete()
        .uri(&format!("/files/{}", file_id))
        .insert_header(("user", "u1"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["operation"], "already_processed");

    // the detached file is still served to renderers
    let req = test::TestRequest::get()
        .uri(&format!("/files/{}", file_id))
        .insert_header(("user", "reader"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["state"], "detached");
    assert!(body["owner_id"].is_null());
}

#[actix_web::test]
async fn test_non_owner_gets_forbidden() {
    let (state, store, _) = test_state();
    let app = app!(state);
    let file_id = upload_file!(app, "owner", b"private");

    let req = test::TestRequest::delete()
        .uri(&format!("/files/{}", file_id))
        .insert_header(("user", "intruder"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert_eq!(store.file_count(), 1);
}

#[actix_web::test]
async fn test_missing_user_header_and_bad_id() {
    let (state, _, _) = test_state();
    let app = app!(state);

    let req = test::TestRequest::delete()
        .uri(&format!("/files/{}", uuid::Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::delete()
        .uri("/files/not-a-uuid")
        .insert_header(("user", "u1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "INVALID_INPUT");

    let req = test::TestRequest::post()
        .uri("/files")
        .insert_header(("user", "u1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_batch_delete() {
    let (state, _, _) = test_state();
    let lifecycle = Arc::clone(&state.lifecycle);
    let app = app!(state);
    let free = upload_file!(app, "u1", b"12345");
    let used = upload_file!(app, "u1", b"abc");
    let foreign = upload_file!(app, "u2", b"xyz");
    lifecycle
        .add_reference(&used, EntityType::MarketplaceListing, "m1")
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri("/files/batch-delete")
        .insert_header(("user", "u1"))
        .set_json(json!({ "file_ids": [free, used, foreign] }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["total_processed"], 3);
    assert_eq!(body["total_storage_freed"], 5);
    assert_eq!(body["summary"]["hard_deleted"], 1);
    assert_eq!(body["summary"]["soft_detached"], 1);
    assert_eq!(body["summary"]["failed"], 1);
    assert_eq!(body["results"][2]["operation"], "failed");
}

#[actix_web::test]
async fn test_protected_file_over_http() {
    let (state, _, _) = test_state();
    let lifecycle = Arc::clone(&state.lifecycle);
    let app = app!(state);
    let system = lifecycle
        .ingest_file(None, "image/png", Bytes::from_static(b"default avatar"), true)
        .await
        .unwrap();

    for user in ["u1", "u2"] {
        let req = test::TestRequest::delete()
            .uri(&format!("/files/{}", system.id))
            .insert_header(("user", user))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["operation"], "protected");
    }
}

#[actix_web::test]
async fn test_health_reports_sweeper_totals() {
    let (state, _, _) = test_state();
    let sweeper = state.sweeper();
    let app = app!(state);
    sweeper.run_cycle().await.unwrap();

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sweeper"]["cycles"], 1);
}

#[actix_web::test]
async fn test_health_body_parses_as_typed_response() {
    let (state, _, _) = test_state();
    let sweeper = state.sweeper();
    let app = app!(state);
    sweeper.run_cycle().await.unwrap();
    sweeper.run_cycle().await.unwrap();

    let req = test::TestRequest::get().uri("/health").to_request();
    let health: HealthResponse = test::call_and_read_body_json(&app, req).await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.sweeper.cycles, 2);
    assert_eq!(health.sweeper.files_finalized, 0);
}
