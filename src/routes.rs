use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    error::ServiceError,
    model::{rank, Classifier, ModelError},
    storage::UploadStore,
    tags::{NoTags, TagAssigner},
};

const IMAGE_FIELD: &str = "image";
const SUCCESS_MESSAGE: &str = "Image uploaded and processed successfully";

#[derive(Clone)]
pub struct AppState {
    /// `None` when the model failed to load at startup.
    pub classifier: Option<Arc<dyn Classifier>>,
    pub uploads: UploadStore,
    pub tagger: Arc<dyn TagAssigner>,
}

impl AppState {
    pub fn new(classifier: Option<Arc<dyn Classifier>>, uploads: UploadStore) -> Self {
        Self {
            classifier,
            uploads,
            tagger: Arc::new(NoTags),
        }
    }

    pub fn with_tagger(mut self, tagger: Arc<dyn TagAssigner>) -> Self {
        self.tagger = tagger;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub prediction: String,
    pub probability: f32,
}

pub fn router(state: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upload_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ServiceError> {
    let mut multipart = multipart.map_err(|err| ServiceError::InvalidForm(err.to_string()))?;
    let mut image = None;

    // Read the whole form so an oversized payload is rejected even when the
    // image field comes first.
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ServiceError::InvalidForm(err.to_string()))?
    {
        let is_image = image.is_none()
            && field.name() == Some(IMAGE_FIELD)
            && field.file_name().is_some();
        let filename = field.file_name().map(str::to_owned);
        let data = field
            .bytes()
            .await
            .map_err(|err| ServiceError::InvalidForm(err.to_string()))?;

        if is_image {
            image = Some((filename, data));
        }
    }

    let (filename, data) = image.ok_or(ServiceError::MissingImage)?;
    let upload = state
        .uploads
        .save(filename.as_deref(), data.clone())
        .await
        .map_err(ServiceError::Save)?;
    tracing::debug!(path = %upload.path().display(), bytes = data.len(), "upload saved");

    let classifier = state
        .classifier
        .clone()
        .ok_or(ServiceError::ModelUnavailable)?;
    let probabilities =
        tokio::task::spawn_blocking(move || classifier.classify(&data)).await??;

    let top = rank(&probabilities)
        .into_iter()
        .next()
        .ok_or(ModelError::EmptyOutput)?;
    if !top.probability.is_finite() {
        return Err(ModelError::NonFiniteOutput(top.probability).into());
    }

    let tags = state.tagger.assign(upload.path(), &top);
    tracing::debug!(
        class_id = top.class_id,
        probability = top.probability,
        ?tags,
        "image classified"
    );
    drop(upload);

    Ok(Json(UploadResponse {
        message: SUCCESS_MESSAGE,
        prediction: top.label(),
        probability: top.probability,
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "model_loaded": state.classifier.is_some(),
    }))
}
