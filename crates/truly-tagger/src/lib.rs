//! truly-tagger: face tagging for the YoursTruly photo library.
//!
//! Analysis runs on a dedicated engine thread that owns the ONNX sessions;
//! the [`TaggingService`] persists detections and produces contact
//! suggestions for untagged faces.

pub mod config;
pub mod engine;
pub mod tagging;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use tagging::{AnalysisOutcome, FaceView, TagError, TaggingService};
