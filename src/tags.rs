use std::path::Path;

use crate::model::Prediction;

/// Hook run after classification while the upload is still on disk.
/// Returned tags are logged; they are not part of the response.
pub trait TagAssigner: Send + Sync {
    fn assign(&self, image_path: &Path, top: &Prediction) -> Vec<String>;
}

/// Assigns nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTags;

impl TagAssigner for NoTags {
    fn assign(&self, _image_path: &Path, _top: &Prediction) -> Vec<String> {
        Vec::new()
    }
}
