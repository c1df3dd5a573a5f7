use std::{cmp::Ordering, path::Path, sync::Arc};

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageBuffer, Rgb};
use serde::Serialize;
use tensorflow::{Graph, SavedModelBundle, SessionOptions, SessionRunArgs, Status, Tensor};
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load saved model from {path}: {source}")]
    Load { path: String, source: Status },
    #[error("operation '{0}' not found in graph")]
    MissingOperation(String),
    #[error("failed to decode image: {0}")]
    Preprocess(#[from] image::ImageError),
    #[error("session run failed: {0}")]
    Inference(#[from] Status),
    #[error("model returned an empty probability vector")]
    EmptyOutput,
    #[error("model returned a non-finite top probability: {0}")]
    NonFiniteOutput(f32),
}

impl ModelError {
    /// Whether the failure happened before the input tensor reached the model.
    pub fn is_preprocess(&self) -> bool {
        matches!(self, ModelError::Preprocess(_))
    }
}

/// A loaded classification model. Implementations must be safe to call from
/// several requests at once; the service shares a single instance.
pub trait Classifier: Send + Sync {
    /// Returns one probability per class for a single encoded image.
    fn classify(&self, image_data: &[u8]) -> Result<Vec<f32>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub class_id: usize,
    pub probability: f32,
}

impl Prediction {
    pub fn label(&self) -> String {
        format!("Class {}", self.class_id)
    }
}

/// Pairs every output index with its probability and sorts the result
/// descending. NaN scores sort last.
pub fn rank(probabilities: &[f32]) -> Vec<Prediction> {
    let mut predictions: Vec<Prediction> = probabilities
        .iter()
        .enumerate()
        .map(|(class_id, &probability)| Prediction {
            class_id,
            probability,
        })
        .collect();

    predictions.sort_by(|a, b| match (a.probability.is_nan(), b.probability.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b
            .probability
            .partial_cmp(&a.probability)
            .unwrap_or(Ordering::Equal),
    });

    predictions
}

pub struct SavedModelClassifier {
    bundle: SavedModelBundle,
    graph: Graph,
    input_name: String,
    output_name: String,
    image_size: u32,
}

impl SavedModelClassifier {
    pub fn load(
        model_dir: &Path,
        tag: &str,
        input_name: &str,
        output_name: &str,
        image_size: u32,
    ) -> Result<Self, ModelError> {
        let mut graph = Graph::new();
        let bundle = SavedModelBundle::load(&SessionOptions::new(), [tag], &mut graph, model_dir)
            .map_err(|source| ModelError::Load {
                path: model_dir.display().to_string(),
                source,
            })?;

        let classifier = SavedModelClassifier {
            bundle,
            graph,
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            image_size,
        };

        // Fail at startup rather than on the first request if the exported
        // signature does not carry the expected tensors.
        classifier.operation(&classifier.input_name)?;
        classifier.operation(&classifier.output_name)?;

        Ok(classifier)
    }

    fn operation(&self, name: &str) -> Result<tensorflow::Operation, ModelError> {
        self.graph
            .operation_by_name(name)
            .map_err(Status::from)?
            .ok_or_else(|| ModelError::MissingOperation(name.to_string()))
    }

    fn input_tensor(&self, image_data: &[u8]) -> Result<Tensor<f32>, ModelError> {
        let size = u64::from(self.image_size);
        let pixels = preprocess_image(image_data, self.image_size)?;

        let mut tensor = Tensor::new(&[1, size, size, 3]);
        tensor.copy_from_slice(&pixels);

        Ok(tensor)
    }
}

impl Classifier for SavedModelClassifier {
    fn classify(&self, image_data: &[u8]) -> Result<Vec<f32>, ModelError> {
        let input_tensor = self.input_tensor(image_data)?;

        let input_operation = self.operation(&self.input_name)?;
        let output_operation = self.operation(&self.output_name)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_operation, 0, &input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        self.bundle.session.run(&mut args)?;

        let output_tensor: Tensor<f32> = args.fetch(output_token)?;
        let classes = output_tensor.dims().last().copied().unwrap_or(0) as usize;
        if classes == 0 || output_tensor.len() < classes {
            return Err(ModelError::EmptyOutput);
        }

        // Batch size is one; keep the first row only.
        Ok(output_tensor[..classes].to_vec())
    }
}

/// Loads the configured SavedModel once for the lifetime of the process. A
/// failed load is logged and yields `None`; the server keeps running and
/// answers uploads with 500.
pub fn load_shared(config: &Config) -> Option<Arc<dyn Classifier>> {
    tracing::info!(model_dir = %config.model_dir.display(), "Loading model...");
    match SavedModelClassifier::load(
        &config.model_dir,
        &config.model_tag,
        &config.input_tensor,
        &config.output_tensor,
        config.image_size,
    ) {
        Ok(model) => {
            tracing::info!("Model loaded");
            let model: Arc<dyn Classifier> = Arc::new(model);
            Some(model)
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to load model; uploads will fail");
            None
        }
    }
}

/// Decodes an encoded image and lays it out as a `size x size x 3` buffer of
/// `0..=255` floats, aspect-resized and centred on a black square.
pub fn preprocess_image(image_data: &[u8], size: u32) -> Result<Vec<f32>, image::ImageError> {
    let img = image::load_from_memory(image_data)?;
    let resized = img.resize(size, size, FilterType::Lanczos3);
    let padded = pad_to_square(&resized, size);

    let side = size as usize;
    let mut flat_img = Vec::with_capacity(side * side * 3);
    for pixel in padded.pixels() {
        flat_img.push(pixel[0] as f32);
        flat_img.push(pixel[1] as f32);
        flat_img.push(pixel[2] as f32);
    }

    Ok(flat_img)
}

fn pad_to_square(image: &DynamicImage, target_size: u32) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let (width, height) = image.dimensions();
    let mut output = ImageBuffer::from_pixel(target_size, target_size, Rgb([0, 0, 0]));

    let x_offset = (target_size.saturating_sub(width) / 2) as i64;
    let y_offset = (target_size.saturating_sub(height) / 2) as i64;

    image::imageops::overlay(&mut output, &image.to_rgb8(), x_offset, y_offset);

    output
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::ImageOutputFormat;

    use super::*;

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, Rgb(color));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn rank_orders_descending_and_keeps_every_class() {
        let ranked = rank(&[0.1, 0.7, 0.2]);

        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].class_id, 1);
        assert_eq!(ranked[0].probability, 0.7);
        assert_eq!(ranked[0].label(), "Class 1");
        assert_eq!(ranked[1].class_id, 2);
        assert_eq!(ranked[2].class_id, 0);
    }

    #[test]
    fn rank_top_is_the_maximum() {
        let probs = [0.01, 0.02, 0.005, 0.9, 0.065];
        let max = probs.iter().cloned().fold(f32::MIN, f32::max);

        assert_eq!(rank(&probs)[0].probability, max);
    }

    #[test]
    fn rank_puts_nan_last() {
        let ranked = rank(&[f32::NAN, 0.3, 0.6]);

        assert_eq!(ranked[0].class_id, 2);
        assert_eq!(ranked[1].class_id, 1);
        assert!(ranked[2].probability.is_nan());
    }

    #[test]
    fn rank_of_empty_output_is_empty() {
        assert!(rank(&[]).is_empty());
    }

    #[test]
    fn preprocess_produces_square_rgb_buffer() {
        let pixels = preprocess_image(&png(40, 20, [255, 0, 0]), 16).unwrap();

        assert_eq!(pixels.len(), 16 * 16 * 3);
        // Wide image: the top row is padding, the middle row is image.
        assert_eq!(&pixels[0..3], &[0.0, 0.0, 0.0]);
        let middle = (8 * 16 + 8) * 3;
        assert_eq!(pixels[middle], 255.0);
        assert_eq!(pixels[middle + 1], 0.0);
    }

    #[test]
    fn loading_from_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("efficientnet");

        let result = SavedModelClassifier::load(&missing, "serve", "input_1", "probs", 224);
        assert!(matches!(result, Err(ModelError::Load { .. })));
    }

    #[test]
    fn shared_model_is_absent_when_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            model_dir: dir.path().join("efficientnet"),
            ..Config::default()
        };

        assert!(load_shared(&config).is_none());
    }

    #[test]
    fn shared_model_is_absent_when_directory_is_not_a_saved_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("saved_model.pb"), b"garbage").unwrap();
        let config = Config {
            model_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        assert!(load_shared(&config).is_none());
    }

    #[test]
    fn preprocess_rejects_non_images() {
        let err = preprocess_image(b"definitely not a picture", 16).unwrap_err();
        assert!(ModelError::from(err).is_preprocess());
    }
}
