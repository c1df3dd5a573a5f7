pub mod config;
pub mod error;
pub mod model;
pub mod routes;
pub mod storage;
pub mod tags;

pub use config::Config;
pub use model::{rank, Classifier, ModelError, Prediction, SavedModelClassifier};
pub use routes::{router, AppState};
pub use storage::UploadStore;
