//! Advisory face attributes: age and gender (InsightFace `genderage`) and
//! dominant expression (FER+). Both models are optional.

use crate::alignment::crop_square;
use crate::types::{BoundingBox, Expression, FaceAttributes, Gender};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const GENDERAGE_INPUT_SIZE: u32 = 96;
const FERPLUS_INPUT_SIZE: u32 = 64;
/// Crop margin on each side of the detector box (1.5× square side overall).
const CROP_MARGIN: f32 = 0.25;

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("unexpected output: {0}")]
    UnexpectedOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Best-effort attribute estimator. Either model may be absent.
pub struct AttributeEstimator {
    genderage: Option<Session>,
    expression: Option<Session>,
}

fn load_optional(path: &Path, intra_threads: usize, what: &str) -> Option<Session> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "{what} model not installed; attribute disabled");
        return None;
    }
    match build_session(path, intra_threads) {
        Ok(s) => {
            tracing::info!(path = %path.display(), "loaded {what} model");
            Some(s)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "{what} model failed to load; attribute disabled");
            None
        }
    }
}

fn build_session(path: &Path, intra_threads: usize) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

impl AttributeEstimator {
    pub fn load(genderage_path: &Path, expression_path: &Path, intra_threads: usize) -> Self {
        Self {
            genderage: load_optional(genderage_path, intra_threads, "genderage"),
            expression: load_optional(expression_path, intra_threads, "expression"),
        }
    }

    pub fn disabled() -> Self {
        Self { genderage: None, expression: None }
    }

    pub fn has_genderage(&self) -> bool {
        self.genderage.is_some()
    }

    pub fn has_expression(&self) -> bool {
        self.expression.is_some()
    }

    /// Estimate whatever attributes the installed models provide.
    pub fn estimate(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceAttributes, AttributeError> {
        let mut attrs = FaceAttributes::default();
        if self.genderage.is_none() && self.expression.is_none() {
            return Ok(attrs);
        }

        let crop = crop_square(image, face.x, face.y, face.width, face.height, CROP_MARGIN);

        if let Some(session) = self.genderage.as_mut() {
            let input = genderage_tensor(&crop);
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;
            let (gender, age) = decode_genderage(raw)?;
            attrs.gender = Some(gender);
            attrs.age = Some(age);
        }

        if let Some(session) = self.expression.as_mut() {
            let input = ferplus_tensor(&crop);
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, raw) = outputs[0].try_extract_tensor::<f32>()?;
            attrs.expression = Some(decode_expression(raw)?);
        }

        Ok(attrs)
    }
}

/// 96×96 RGB, raw 0–255 values (the genderage model normalizes internally).
fn genderage_tensor(crop: &RgbImage) -> Array4<f32> {
    let size = GENDERAGE_INPUT_SIZE as usize;
    let resized = image::imageops::resize(crop, GENDERAGE_INPUT_SIZE, GENDERAGE_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, p) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = p.0[c] as f32;
        }
    }
    tensor
}

/// 64×64 single-channel luma, raw 0–255 values.
fn ferplus_tensor(crop: &RgbImage) -> Array4<f32> {
    let size = FERPLUS_INPUT_SIZE as usize;
    let gray = image::imageops::grayscale(crop);
    let resized = image::imageops::resize(&gray, FERPLUS_INPUT_SIZE, FERPLUS_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 1, size, size));
    for (x, y, p) in resized.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = p.0[0] as f32;
    }
    tensor
}

/// genderage output: [female_score, male_score, age / 100].
fn decode_genderage(raw: &[f32]) -> Result<(Gender, u8), AttributeError> {
    let [female, male, age] = raw
        .get(..3)
        .and_then(|s| <[f32; 3]>::try_from(s).ok())
        .ok_or_else(|| AttributeError::UnexpectedOutput(format!("genderage: {} values", raw.len())))?;
    let gender = if male > female { Gender::Male } else { Gender::Female };
    let age = (age * 100.0).round().clamp(0.0, 120.0) as u8;
    Ok((gender, age))
}

/// FER+ output: 8 class scores; the argmax wins.
fn decode_expression(raw: &[f32]) -> Result<Expression, AttributeError> {
    raw.iter()
        .take(Expression::ALL.len())
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .and_then(|(i, _)| Expression::from_index(i))
        .ok_or_else(|| AttributeError::UnexpectedOutput("expression: no scores".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_decode_genderage() {
        assert_eq!(decode_genderage(&[0.2, 0.8, 0.34]).unwrap(), (Gender::Male, 34));
        assert_eq!(decode_genderage(&[0.9, 0.1, 0.071]).unwrap(), (Gender::Female, 7));
        assert_eq!(decode_genderage(&[0.9, 0.1, 3.0]).unwrap().1, 120);
        assert!(decode_genderage(&[0.5]).is_err());
    }

    #[test]
    fn test_decode_expression() {
        let scores = [0.1, 2.5, 0.3, -1.0, 0.0, 0.0, 0.0, 0.2];
        assert_eq!(decode_expression(&scores).unwrap(), Expression::Happy);
        assert!(decode_expression(&[]).is_err());
    }

    #[test]
    fn test_tensor_shapes() {
        let crop = RgbImage::from_pixel(40, 30, Rgb([10, 20, 30]));
        assert_eq!(genderage_tensor(&crop).shape(), &[1, 3, 96, 96]);
        assert_eq!(ferplus_tensor(&crop).shape(), &[1, 1, 64, 64]);
    }

    #[test]
    fn test_disabled_estimator_returns_empty() {
        let mut est = AttributeEstimator::disabled();
        let image = RgbImage::new(10, 10);
        let face = BoundingBox {
            x: 0.0, y: 0.0, width: 5.0, height: 5.0, confidence: 0.9, landmarks: None,
        };
        assert_eq!(est.estimate(&image, &face).unwrap(), FaceAttributes::default());
    }

    #[test]
    fn test_missing_model_files_disable_attributes() {
        let est = AttributeEstimator::load(
            Path::new("/nonexistent/genderage.onnx"),
            Path::new("/nonexistent/emotion.onnx"),
            1,
        );
        assert!(!est.has_genderage());
        assert!(!est.has_expression());
    }
}
