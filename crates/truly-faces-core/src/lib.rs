//! truly-faces-core: face detection, embedding and contact matching for
//! the YoursTruly photo library.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both running via
//! ONNX Runtime on CPU. Matching is a pure Euclidean nearest-neighbour ranking.

pub mod alignment;
pub mod analyzer;
pub mod attributes;
pub mod detector;
pub mod image_io;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzeError, AnalyzerStatus, FaceAnalyzer, ModelPaths, OnnxFaceAnalyzer};
pub use matcher::{Candidate, EuclideanMatcher, MatchError, Matcher, Suggestion};
pub use types::{BoundingBox, Detection, Embedding, Expression, FaceAttributes, FaceRecord, Gender};
