use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tokio::task::JoinError;

use crate::model::ModelError;

/// Every way an upload request can fail. Clients only ever see the generic
/// message for the failing step; the cause goes to the log.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid multipart form: {0}")]
    InvalidForm(String),
    #[error("no file in the 'image' field")]
    MissingImage,
    #[error("failed to save upload: {0}")]
    Save(#[source] io::Error),
    #[error("model is not loaded")]
    ModelUnavailable,
    #[error("failed to prepare model input: {0}")]
    Preprocess(#[source] ModelError),
    #[error("inference failed: {0}")]
    Inference(#[source] ModelError),
    #[error("inference task aborted: {0}")]
    TaskAborted(#[from] JoinError),
}

impl From<ModelError> for ServiceError {
    fn from(err: ModelError) -> Self {
        if err.is_preprocess() {
            ServiceError::Preprocess(err)
        } else {
            ServiceError::Inference(err)
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidForm(_) | ServiceError::MissingImage => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn public_message(&self) -> &'static str {
        match self {
            ServiceError::InvalidForm(_) => "Unable to process the uploaded image",
            ServiceError::MissingImage => "Error retrieving the image file",
            ServiceError::Save(_) => "Error saving the uploaded image",
            ServiceError::ModelUnavailable => "Failed to load the EfficientNet model",
            ServiceError::Preprocess(_) => "Error loading the image for prediction",
            ServiceError::Inference(_) | ServiceError::TaskAborted(_) => {
                "Error performing the image prediction"
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "upload failed");
        } else {
            tracing::warn!(error = %self, "upload rejected");
        }

        (status, self.public_message()).into_response()
    }
}
