//! Image → face detections: decode, detect, align, embed, annotate.
//!
//! [`OnnxFaceAnalyzer`] loads its ONNX sessions on first use and keeps them
//! for its lifetime. A failed load is not remembered, so restoring the model
//! files recovers without a restart.

use crate::attributes::AttributeEstimator;
use crate::detector::{DetectorError, FaceDetector};
use crate::image_io::{self, DecodeError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";
pub const GENDERAGE_MODEL_FILE: &str = "genderage.onnx";
pub const EXPRESSION_MODEL_FILE: &str = "emotion-ferplus-8.onnx";

#[derive(Error, Debug)]
pub enum AnalyzeError {
    /// Model assets are missing or unloadable. Not the same as "no faces".
    #[error("face analysis unavailable: {0}")]
    ModelUnavailable(String),
    #[error("unreadable image: {0}")]
    Decode(#[from] DecodeError),
    #[error("face analysis failed: {0}")]
    Inference(String),
}

impl From<DetectorError> for AnalyzeError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(_) => AnalyzeError::ModelUnavailable(e.to_string()),
            other => AnalyzeError::Inference(other.to_string()),
        }
    }
}

impl From<RecognizerError> for AnalyzeError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(_) => AnalyzeError::ModelUnavailable(e.to_string()),
            other => AnalyzeError::Inference(other.to_string()),
        }
    }
}

/// Locations of the model files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub genderage: PathBuf,
    pub expression: PathBuf,
}

impl ModelPaths {
    /// Standard filenames inside one model directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            recognizer: dir.join(RECOGNIZER_MODEL_FILE),
            genderage: dir.join(GENDERAGE_MODEL_FILE),
            expression: dir.join(EXPRESSION_MODEL_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerStatus {
    pub models_loaded: bool,
    pub models: ModelPaths,
    pub genderage_installed: bool,
    pub expression_installed: bool,
}

/// Converts raw image bytes into face detections.
///
/// Implementations are driven from a single thread at a time; `&mut self`
/// lets them own non-shareable inference sessions.
pub trait FaceAnalyzer: Send {
    /// Detect every face in the image. `Ok(vec![])` means no faces.
    fn analyze(&mut self, bytes: &[u8], mime: Option<&str>) -> Result<Vec<Detection>, AnalyzeError>;

    fn status(&self) -> AnalyzerStatus;
}

struct LoadedModels {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    attributes: AttributeEstimator,
}

impl LoadedModels {
    fn load(paths: &ModelPaths, intra_threads: usize) -> Result<Self, AnalyzeError> {
        let detector = FaceDetector::load(&paths.detector, intra_threads)?;
        let recognizer = FaceRecognizer::load(&paths.recognizer, intra_threads)?;
        let attributes = AttributeEstimator::load(&paths.genderage, &paths.expression, intra_threads);
        Ok(Self { detector, recognizer, attributes })
    }
}

/// SCRFD + ArcFace analyzer with lazily loaded sessions.
pub struct OnnxFaceAnalyzer {
    paths: ModelPaths,
    intra_threads: usize,
    models: Option<LoadedModels>,
}

impl OnnxFaceAnalyzer {
    pub fn new(paths: ModelPaths, intra_threads: usize) -> Self {
        Self {
            paths,
            intra_threads: intra_threads.max(1),
            models: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.models.is_some()
    }

    /// Load the models now instead of on the first request.
    pub fn preload(&mut self) -> Result<(), AnalyzeError> {
        self.ensure_loaded().map(|_| ())
    }

    fn ensure_loaded(&mut self) -> Result<&mut LoadedModels, AnalyzeError> {
        let models = match self.models.take() {
            Some(models) => models,
            None => {
                let models = LoadedModels::load(&self.paths, self.intra_threads)?;
                tracing::info!(
                    genderage = models.attributes.has_genderage(),
                    expression = models.attributes.has_expression(),
                    "face models loaded"
                );
                models
            }
        };
        Ok(self.models.insert(models))
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, bytes: &[u8], mime: Option<&str>) -> Result<Vec<Detection>, AnalyzeError> {
        let models = self.ensure_loaded()?;
        let image = image_io::decode_rgb(bytes, mime)?;

        let boxes = models.detector.detect(&image)?;
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            faces = boxes.len(),
            "detection complete"
        );

        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            if bbox.landmarks.is_none() {
                tracing::debug!(confidence = bbox.confidence, "face without landmarks skipped");
                continue;
            }

            let embedding = models.recognizer.extract(&image, &bbox)?;
            let attributes = match models.attributes.estimate(&image, &bbox) {
                Ok(attrs) => attrs,
                Err(e) => {
                    tracing::warn!(error = %e, "attribute estimation failed; leaving attributes empty");
                    Default::default()
                }
            };

            detections.push(Detection {
                confidence: bbox.confidence,
                bbox,
                embedding,
                attributes,
            });
        }

        Ok(detections)
    }

    fn status(&self) -> AnalyzerStatus {
        AnalyzerStatus {
            models_loaded: self.is_loaded(),
            models: self.paths.clone(),
            genderage_installed: self.paths.genderage.exists(),
            expression_installed: self.paths.expression.exists(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_models() -> OnnxFaceAnalyzer {
        OnnxFaceAnalyzer::new(ModelPaths::in_dir(Path::new("/nonexistent/truly-models")), 1)
    }

    #[test]
    fn test_model_paths_in_dir() {
        let paths = ModelPaths::in_dir(Path::new("/opt/models"));
        assert_eq!(paths.detector, PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(paths.recognizer, PathBuf::from("/opt/models/w600k_r50.onnx"));
    }

    #[test]
    fn test_missing_models_is_unavailable_not_empty() {
        let mut analyzer = missing_models();
        let err = analyzer.analyze(b"irrelevant", Some("image/jpeg")).unwrap_err();
        assert!(matches!(err, AnalyzeError::ModelUnavailable(_)), "got {err:?}");
        assert!(!analyzer.is_loaded());
    }

    #[test]
    fn test_failed_load_is_retried() {
        let mut analyzer = missing_models();
        assert!(analyzer.preload().is_err());
        assert!(matches!(analyzer.preload(), Err(AnalyzeError::ModelUnavailable(_))));
    }

    #[test]
    fn test_status_reports_unloaded() {
        let status = missing_models().status();
        assert!(!status.models_loaded);
        assert!(!status.genderage_installed);
        assert!(!status.expression_installed);
    }

    #[test]
    fn test_error_classification() {
        let e: AnalyzeError = DetectorError::InferenceFailed("boom".into()).into();
        assert!(matches!(e, AnalyzeError::Inference(_)));
        let e: AnalyzeError = RecognizerError::NoLandmarks.into();
        assert!(matches!(e, AnalyzeError::Inference(_)));
        let e: AnalyzeError = RecognizerError::ModelNotFound("x".into()).into();
        assert!(matches!(e, AnalyzeError::ModelUnavailable(_)));
    }
}
