//! JSON HTTP API.
//!
//! Endpoints:
//! - GET    /                    - service banner
//! - GET    /status              - model, threshold, roster size
//! - POST   /recognize           - identify every face in one image
//! - POST   /add-person          - enroll a person from one or more photos
//! - GET    /persons             - list enrolled persons
//! - DELETE /delete-person/{id}  - remove a person by current positional id

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine as _;
use image::RgbImage;
use kinface_core::{EnrollmentError, RecognitionError, RosterStore, StoreError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    engine: EngineHandle,
    store: Arc<RosterStore>,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(engine: EngineHandle, store: Arc<RosterStore>, config: Arc<Config>) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }
}

/// `POST /recognize` body.
#[derive(Debug, Deserialize)]
pub struct RecognizeRequest {
    /// Base64 image, optionally as a `data:image/...;base64,` URL.
    pub image: String,
}

/// `POST /add-person` body.
#[derive(Debug, Deserialize)]
pub struct AddPersonRequest {
    pub name: String,
    pub relation: String,
    /// Base64 images, optionally as data URLs.
    pub images: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unreadable image: {0}")]
    Image(#[from] image::ImageError),
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/recognize", post(recognize))
        .route("/add-person", post(add_person))
        .route("/persons", get(list_persons))
        .route("/delete-person/{id}", delete(delete_person))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Decode a base64 (or data-URL) payload into an RGB image.
pub fn decode_image(payload: &str) -> Result<RgbImage, DecodeError> {
    let data = match payload.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => payload,
    };
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD.decode(compact)?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

fn failure(status: StatusCode, field: &str, message: impl Into<String>) -> Response {
    let message = message.into();
    (status, Json(json!({ "success": false, field: message }))).into_response()
}

fn reject(rejection: JsonRejection) -> Response {
    tracing::debug!(error = %rejection.body_text(), "malformed request body");
    failure(StatusCode::BAD_REQUEST, "error", rejection.body_text())
}

fn engine_failure(err: &EngineError) -> Response {
    match err {
        EngineError::Timeout(_) => failure(StatusCode::GATEWAY_TIMEOUT, "message", err.to_string()),
        EngineError::ChannelClosed | EngineError::Spawn(_) => {
            failure(StatusCode::SERVICE_UNAVAILABLE, "message", err.to_string())
        }
        _ => failure(StatusCode::INTERNAL_SERVER_ERROR, "message", err.to_string()),
    }
}

async fn index() -> impl IntoResponse {
    Json(json!({
        "message": "kinface face recognition API",
        "endpoints": {
            "/recognize": "POST - recognize faces in an image",
            "/add-person": "POST - enroll a new person",
            "/persons": "GET - list enrolled persons",
            "/delete-person/{id}": "DELETE - remove a person",
            "/status": "GET - service status",
        }
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let profile = state.store.profile();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "model": profile.model,
        "dimension": profile.dimension,
        "match_threshold": state.config.match_threshold,
        "persons": state.store.len(),
        "roster_path": state.store.path().display().to_string(),
    }))
}

async fn recognize(
    State(state): State<AppState>,
    payload: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return reject(rejection),
    };
    if req.image.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "message", "image data is missing");
    }

    let decoded = tokio::task::spawn_blocking(move || decode_image(&req.image)).await;
    let image = match decoded {
        Ok(Ok(image)) => image,
        Ok(Err(e)) => return failure(StatusCode::BAD_REQUEST, "message", e.to_string()),
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, "message", e.to_string()),
    };
    tracing::debug!(width = image.width(), height = image.height(), "recognize: image decoded");

    match state.engine.recognize(image).await {
        Ok(faces) => Json(json!({ "success": true, "faces": faces })).into_response(),
        Err(EngineError::Recognize(RecognitionError::NoFaceDetected)) => Json(json!({
            "success": false,
            "reason": "no_face_detected",
            "message": "no face found in the image",
        }))
        .into_response(),
        Err(EngineError::Recognize(RecognitionError::EmptyRoster)) => Json(json!({
            "success": false,
            "reason": "empty_roster",
            "message": "no persons are enrolled",
        }))
        .into_response(),
        Err(EngineError::Recognize(RecognitionError::Cancelled)) => {
            failure(StatusCode::GATEWAY_TIMEOUT, "message", "recognition cancelled")
        }
        Err(e) => {
            tracing::error!(error = %e, "recognize failed");
            engine_failure(&e)
        }
    }
}

async fn add_person(
    State(state): State<AppState>,
    payload: Result<Json<AddPersonRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return reject(rejection),
    };
    if req.name.trim().is_empty() || req.relation.trim().is_empty() || req.images.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "error", "name, relation and images are required");
    }
    if req.images.len() > state.config.max_enroll_images {
        return failure(
            StatusCode::BAD_REQUEST,
            "error",
            format!("at most {} images per enrollment", state.config.max_enroll_images),
        );
    }

    let submitted = req.images.len();
    let images = req.images;
    let decoded = tokio::task::spawn_blocking(move || {
        images
            .iter()
            .enumerate()
            .filter_map(|(i, data)| match decode_image(data) {
                Ok(image) => Some(image),
                Err(e) => {
                    tracing::warn!(image = i, error = %e, "add-person: skipping undecodable image");
                    None
                }
            })
            .collect::<Vec<_>>()
    })
    .await;
    let images = match decoded {
        Ok(images) => images,
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, "error", e.to_string()),
    };
    if images.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "error", "none of the images could be read");
    }
    let undecodable = submitted - images.len();
    tracing::info!(name = %req.name, relation = %req.relation, images = images.len(), undecodable, "add-person requested");

    match state.engine.enroll(images, req.name, req.relation).await {
        Ok(receipt) => Json(json!({
            "success": true,
            "message": format!("{} enrolled with {} photo(s)", receipt.name, receipt.embeddings),
            "person_id": receipt.person_id,
            "embeddings": receipt.embeddings,
            "skipped": receipt.skipped + undecodable,
        }))
        .into_response(),
        Err(EngineError::Enroll(e)) if e.is_input_validation() => {
            failure(StatusCode::BAD_REQUEST, "error", e.to_string())
        }
        Err(EngineError::Enroll(e @ EnrollmentError::NoFaceDetected { .. })) => {
            failure(StatusCode::BAD_REQUEST, "error", e.to_string())
        }
        Err(EngineError::Enroll(EnrollmentError::Cancelled)) => {
            failure(StatusCode::GATEWAY_TIMEOUT, "error", "enrollment cancelled")
        }
        Err(e) => {
            tracing::error!(error = %e, "add-person failed");
            let status = match e {
                EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                EngineError::ChannelClosed | EngineError::Spawn(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            failure(status, "error", e.to_string())
        }
    }
}

async fn list_persons(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "success": true, "persons": state.store.list() }))
}

async fn delete_person(
    State(state): State<AppState>,
    id: Result<Path<usize>, PathRejection>,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "delete-person: unparsable id");
            return failure(
                StatusCode::NOT_FOUND,
                "message",
                format!("invalid person id: {}", rejection.body_text()),
            );
        }
    };
    let store = state.store.clone();
    let removed = tokio::task::spawn_blocking(move || store.remove(id)).await;
    match removed {
        Ok(Ok(person)) => Json(json!({
            "success": true,
            "message": format!("{} removed", person.name),
        }))
        .into_response(),
        Ok(Err(e @ StoreError::InvalidId { .. })) => failure(StatusCode::NOT_FOUND, "message", e.to_string()),
        Ok(Err(e)) => {
            tracing::error!(id, error = %e, "delete-person failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "message", e.to_string())
        }
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, "message", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use kinface_core::testing::{face_image, faceless_image, photo, ScriptedEmbedder};
    use kinface_core::{Embedder, EnrollmentService, RecognitionService};
    use serde_json::Value;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _dir: TempDir,
        router: Router,
        store: Arc<RosterStore>,
    }

    fn app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(ScriptedEmbedder::new());
        let store = Arc::new(
            RosterStore::open(dir.path().join("roster.json"), embedder.profile()).unwrap(),
        );
        let engine = spawn_engine(
            EnrollmentService::new(embedder.clone(), store.clone()),
            RecognitionService::new(embedder, store.clone()),
            Duration::from_secs(5),
        )
        .unwrap();
        let config = Arc::new(Config {
            max_enroll_images: 4,
            ..Config::default()
        });
        TestApp {
            router: router(AppState::new(engine, store.clone(), config)),
            store,
            _dir: dir,
        }
    }

    fn png_base64(image: &RgbImage) -> String {
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf)
    }

    async fn call(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn enroll(app: &TestApp, name: &str, relation: &str, images: &[RgbImage]) -> (StatusCode, Value) {
        let images: Vec<String> = images.iter().map(png_base64).collect();
        call(
            app,
            Method::POST,
            "/add-person",
            Some(json!({ "name": name, "relation": relation, "images": images })),
        )
        .await
    }

    #[test]
    fn test_decode_image_accepts_data_url_and_plain() {
        let img = face_image(2);
        let plain = png_base64(&img);
        assert_eq!(decode_image(&plain).unwrap(), img);
        let url = format!("data:image/png;base64,{plain}");
        assert_eq!(decode_image(&url).unwrap(), img);
        assert!(matches!(decode_image("%%%"), Err(DecodeError::Base64(_))));
        assert!(matches!(decode_image("aGVsbG8="), Err(DecodeError::Image(_))));
    }

    #[tokio::test]
    async fn test_enroll_recognize_list_delete_flow() {
        let app = app();

        let (status, body) = enroll(&app, "Alice", "daughter", &[photo(1, 1), faceless_image(), photo(1, 2)]).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["embeddings"], 2);
        assert_eq!(body["skipped"], 1);

        let (status, _) = enroll(&app, "Bob", "son", &[face_image(2)]).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            Method::POST,
            "/recognize",
            Some(json!({ "image": format!("data:image/png;base64,{}", png_base64(&photo(1, 3))) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["faces"][0]["name"], "Alice");
        assert_eq!(body["faces"][0]["relation"], "daughter");
        assert!(body["faces"][0]["confidence"].as_f64().unwrap() > 60.0);

        let (_, body) = call(&app, Method::GET, "/persons", None).await;
        assert_eq!(
            body["persons"],
            json!([
                { "id": 0, "name": "Alice", "relation": "daughter" },
                { "id": 1, "name": "Bob", "relation": "son" },
            ])
        );

        let (status, body) = call(&app, Method::DELETE, "/delete-person/0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = call(&app, Method::GET, "/persons", None).await;
        assert_eq!(body["persons"], json!([{ "id": 0, "name": "Bob", "relation": "son" }]));
    }

    #[tokio::test]
    async fn test_recognize_reports_empty_roster_and_no_face() {
        let app = app();
        let image = json!({ "image": png_base64(&face_image(1)) });
        let (status, body) = call(&app, Method::POST, "/recognize", Some(image)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["reason"], "empty_roster");

        enroll(&app, "Alice", "daughter", &[face_image(1)]).await;
        let image = json!({ "image": png_base64(&faceless_image()) });
        let (status, body) = call(&app, Method::POST, "/recognize", Some(image)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"], "no_face_detected");
    }

    #[tokio::test]
    async fn test_recognize_stranger_is_unknown() {
        let app = app();
        enroll(&app, "Alice", "daughter", &[face_image(1)]).await;
        let image = json!({ "image": png_base64(&face_image(5)) });
        let (_, body) = call(&app, Method::POST, "/recognize", Some(image)).await;
        assert_eq!(body["faces"][0]["name"], "unknown");
        assert_eq!(body["faces"][0]["relation"], "");
        assert!(body["faces"][0]["confidence"].as_f64().unwrap() < 60.0);
    }

    #[tokio::test]
    async fn test_malformed_requests_are_rejected() {
        let app = app();

        let (status, body) = call(&app, Method::POST, "/add-person", Some(json!({ "name": "Alice" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            &app,
            Method::POST,
            "/add-person",
            Some(json!({ "name": "", "relation": "son", "images": ["x"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::POST, "/recognize", Some(json!({ "img": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::POST, "/recognize", Some(json!({ "image": "not base64!" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(app.store.is_empty());
    }

    #[tokio::test]
    async fn test_enroll_failures() {
        let app = app();

        let (status, body) = enroll(&app, "Alice", "daughter", &[faceless_image()]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no face"));

        let too_many = vec![face_image(1); 5];
        let (status, _) = enroll(&app, "Alice", "daughter", &too_many).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::POST,
            "/add-person",
            Some(json!({ "name": "Alice", "relation": "daughter", "images": ["@@@"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(app.store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_invalid_id() {
        let app = app();
        let (status, body) = call(&app, Method::DELETE, "/delete-person/3", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_delete_unparsable_id_is_json() {
        let app = app();
        enroll(&app, "Alice", "daughter", &[face_image(1)]).await;

        for uri in ["/delete-person/-1", "/delete-person/abc"] {
            let (status, body) = call(&app, Method::DELETE, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body["success"], false, "{uri}");
            assert!(body["message"].as_str().unwrap().contains("invalid person id"));
        }
        assert_eq!(app.store.len(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_profile() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], ScriptedEmbedder::MODEL);
        assert_eq!(body["dimension"], ScriptedEmbedder::DIMENSION);
        assert_eq!(body["persons"], 0);
    }
}
