use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use truly_faces_core::{AnalyzeError, AnalyzerStatus, Detection, FaceAnalyzer};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Analyze(#[from] AnalyzeError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Analyze {
        bytes: Vec<u8>,
        mime: Option<String>,
        reply: oneshot::Sender<Result<Vec<Detection>, AnalyzeError>>,
    },
    Status {
        reply: oneshot::Sender<AnalyzerStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Queue one image for analysis and wait for its detections.
    ///
    /// Dropping the returned future abandons the reply; the engine finishes
    /// the inference and discards the result.
    pub async fn analyze(&self, bytes: Vec<u8>, mime: Option<String>) -> Result<Vec<Detection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                bytes,
                mime,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn status(&self) -> Result<AnalyzerStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the analyzer, so inference requests are served one at a
/// time in arrival order. Models load lazily on the first analysis.
pub fn spawn_engine<A>(mut analyzer: A, queue_depth: usize) -> Result<EngineHandle, EngineError>
where
    A: FaceAnalyzer + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("truly-face-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { bytes, mime, reply } => {
                        if reply.is_closed() {
                            tracing::debug!("analysis request cancelled before start");
                            continue;
                        }
                        let result = analyzer.analyze(&bytes, mime.as_deref());
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, bytes = bytes.len(), "analysis failed");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(analyzer.status());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use truly_faces_core::{BoundingBox, Embedding, FaceAttributes, ModelPaths};

    struct CountingAnalyzer {
        calls: Arc<AtomicUsize>,
    }

    impl FaceAnalyzer for CountingAnalyzer {
        fn analyze(&mut self, bytes: &[u8], _mime: Option<&str>) -> Result<Vec<Detection>, AnalyzeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..bytes.len())
                .map(|i| Detection {
                    bbox: BoundingBox {
                        x: i as f32, y: 0.0, width: 1.0, height: 1.0,
                        confidence: 0.9, landmarks: None,
                    },
                    embedding: Embedding::new(vec![i as f32]),
                    confidence: 0.9,
                    attributes: FaceAttributes::default(),
                })
                .collect())
        }

        fn status(&self) -> AnalyzerStatus {
            AnalyzerStatus {
                models_loaded: true,
                models: ModelPaths::in_dir(Path::new("/fake")),
                genderage_installed: false,
                expression_installed: false,
            }
        }
    }

    #[tokio::test]
    async fn test_engine_serves_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = spawn_engine(CountingAnalyzer { calls: calls.clone() }, 4).unwrap();

        let faces = engine.analyze(vec![0, 0, 0], None).await.unwrap();
        assert_eq!(faces.len(), 3);
        assert!(engine.analyze(vec![], None).await.unwrap().is_empty());
        assert!(engine.status().await.unwrap().models_loaded);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_engine_handles_concurrent_callers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = spawn_engine(CountingAnalyzer { calls: calls.clone() }, 2).unwrap();

        let tasks: Vec<_> = (1..=8)
            .map(|n| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.analyze(vec![0; n], None).await.map(|f| f.len()) })
            })
            .collect();

        for (n, task) in (1..=8).zip(tasks) {
            assert_eq!(task.await.unwrap().unwrap(), n);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_model_unavailable_propagates() {
        let analyzer = truly_faces_core::OnnxFaceAnalyzer::new(
            ModelPaths::in_dir(Path::new("/nonexistent/models")),
            1,
        );
        let engine = spawn_engine(analyzer, 1).unwrap();
        let err = engine.analyze(b"x".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::Analyze(AnalyzeError::ModelUnavailable(_))));
        assert!(!engine.status().await.unwrap().models_loaded);
    }
}
