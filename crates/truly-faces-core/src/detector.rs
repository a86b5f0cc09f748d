//! Face localisation with the SCRFD `det_10g` model.
//!
//! The photo is letterboxed into the network's square input, the three
//! anchor-free stride heads are decoded back into photo pixels and
//! overlapping boxes are suppressed. Every box carries five landmarks.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::{DynValue, TensorRef};
use std::path::Path;
use thiserror::Error;

/// Square network input, in pixels.
const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 128.0;
/// Minimum face score kept before suppression.
const SCORE_THRESHOLD: f32 = 0.5;
const IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model missing at {0}; install det_10g.onnx from the insightface buffalo_l pack")]
    ModelNotFound(String),
    #[error("detector output unusable: {0}")]
    InferenceFailed(String),
    #[error("onnx runtime: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a photo into the network input.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl LetterboxInfo {
    fn for_image(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            offset_x: ((INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            offset_y: ((INPUT_SIZE as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Letterboxed (network) coordinates → original image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.offset_x) / self.scale, (y - self.offset_y) / self.scale)
    }
}

/// Positions of one stride's (score, box, landmark) outputs.
type HeadSlots = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    /// Output slots per entry of `STRIDES`, resolved once at load.
    heads: [HeadSlots; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 output heads, model has {}",
                names.len()
            )));
        }

        let heads = resolve_heads(&names);
        tracing::info!(path = %model_path.display(), ?heads, "face detector loaded");

        Ok(Self { session, heads })
    }

    /// Detect faces in an RGB image, returning boxes sorted by confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_slot, box_slot, kps_slot)) in STRIDES.iter().zip(self.heads.iter()) {
            let head = StrideOutputs {
                scores: head_tensor(&outputs[score_slot], "score", stride)?,
                bboxes: head_tensor(&outputs[box_slot], "bbox", stride)?,
                kps: head_tensor(&outputs[kps_slot], "kps", stride)?,
            };
            candidates.extend(decode_stride(head, stride, &letterbox, SCORE_THRESHOLD));
        }

        // Suppression output is already in descending score order.
        let faces = nms(candidates, IOU_THRESHOLD)
            .into_iter()
            .map(|b| clamp_to_image(b, image.width() as f32, image.height() as f32))
            .filter(|b| b.width > 0.0 && b.height > 0.0)
            .collect();

        Ok(faces)
    }
}

/// Letterbox an RGB image into a 640×640 NCHW float tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let letterbox = LetterboxInfo::for_image(image.width(), image.height());
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE as u32);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE as u32);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding is zero after normalization (pixel == PIXEL_MEAN).
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    let (offset_x, offset_y) = (letterbox.offset_x as usize, letterbox.offset_y as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + offset_x, y as usize + offset_y);
        if tx >= INPUT_SIZE || ty >= INPUT_SIZE {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - PIXEL_MEAN) / PIXEL_SCALE;
        }
    }

    (tensor, letterbox)
}

fn head_tensor<'a>(value: &'a DynValue, kind: &str, stride: usize) -> Result<&'a [f32], DetectorError> {
    let (_, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::InferenceFailed(format!("{kind} head for stride {stride}: {e}")))?;
    Ok(data)
}

fn clamp_to_image(mut b: BoundingBox, width: f32, height: f32) -> BoundingBox {
    let x1 = b.x.clamp(0.0, width);
    let y1 = b.y.clamp(0.0, height);
    let x2 = (b.x + b.width).clamp(0.0, width);
    let y2 = (b.y + b.height).clamp(0.0, height);
    b.x = x1;
    b.y = y1;
    b.width = x2 - x1;
    b.height = y2 - y1;
    b
}

/// Map output heads to strides. Exports that name heads `score_8`,
/// `bbox_16`, `kps_32` and so on are matched by name; anything else is
/// taken in the usual order of three score, three box, then three landmark
/// heads.
fn resolve_heads(names: &[String]) -> [HeadSlots; 3] {
    let slot = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut heads = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (i, &stride) in STRIDES.iter().enumerate() {
        match (slot("score", stride), slot("bbox", stride), slot("kps", stride)) {
            (Some(s), Some(b), Some(k)) => heads[i] = (s, b, k),
            _ => {
                tracing::debug!(?names, "detector heads not named by stride, using positional layout");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    heads
}

/// Raw per-stride tensors as flat slices.
struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Turn one stride head into photo-space boxes above `min_score`.
fn decode_stride(out: StrideOutputs<'_>, stride: usize, letterbox: &LetterboxInfo, min_score: f32) -> Vec<BoundingBox> {
    let grid_w = INPUT_SIZE / stride;
    let grid_h = INPUT_SIZE / stride;
    let s = stride as f32;

    let mut boxes = Vec::new();
    for idx in 0..grid_h * grid_w * ANCHORS_PER_CELL {
        let score = out.scores.get(idx).copied().unwrap_or(0.0);
        if score <= min_score {
            continue;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid_w) as f32 * s;
        let anchor_cy = (cell / grid_w) as f32 * s;

        // bbox: [left, top, right, bottom] distances in stride units
        let Some(d) = out.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = letterbox.unmap(anchor_cx - d[0] * s, anchor_cy - d[1] * s);
        let (x2, y2) = letterbox.unmap(anchor_cx + d[2] * s, anchor_cy + d[3] * s);

        let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(anchor_cx + k[i * 2] * s, anchor_cy + k[i * 2 + 1] * s))
        });

        boxes.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    boxes
}

/// Greedy suppression: highest score first, drop anything overlapping a
/// kept box by more than `max_iou`.
fn nms(mut boxes: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let overlap = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - overlap;
    if union <= 0.0 {
        return 0.0;
    }
    overlap / union
}
