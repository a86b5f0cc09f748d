//! Face tagging flows: analyze an image, list its faces with contact
//! suggestions, confirm or remove tags.
//!
//! Suggestion failures never fail a listing: a face whose embedding cannot
//! be matched simply has no suggestions and is tagged by hand.

use crate::config::Config;
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use truly_faces_core::{
    AnalyzeError, AnalyzerStatus, BoundingBox, Candidate, Embedding, EuclideanMatcher, FaceAttributes, FaceRecord,
    Matcher, OnnxFaceAnalyzer, Suggestion,
};
use truly_faces_store::{FaceStore, StoreError};

/// Pending analyses allowed before callers wait on the queue.
const ENGINE_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum TagError {
    /// Face models are not installed; photo management continues without
    /// face features until an operator restores them.
    #[error("face recognition temporarily unavailable: {0}")]
    FeatureUnavailable(String),
    #[error("image analysis failed: {0}")]
    AnalysisFailed(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("face store lock poisoned")]
    StorePoisoned,
    #[error("face engine is not running")]
    EngineClosed,
}

impl From<EngineError> for TagError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Analyze(AnalyzeError::ModelUnavailable(msg)) => TagError::FeatureUnavailable(msg),
            EngineError::Analyze(other) => TagError::AnalysisFailed(other.to_string()),
            EngineError::Spawn(_) | EngineError::ChannelClosed => TagError::EngineClosed,
        }
    }
}

/// One face as shown to the user, with suggestions when untagged.
#[derive(Debug, Clone, Serialize)]
pub struct FaceView {
    pub id: String,
    pub media_id: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub attributes: FaceAttributes,
    pub contact_id: Option<String>,
    pub is_confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub suggestions: Vec<Suggestion>,
}

impl FaceView {
    fn new(face: FaceRecord, suggestions: Vec<Suggestion>) -> Self {
        Self {
            id: face.id,
            media_id: face.media_id,
            bbox: face.bbox,
            confidence: face.confidence,
            attributes: face.attributes,
            contact_id: face.contact_id,
            is_confirmed: face.is_confirmed,
            confirmed_at: face.confirmed_at,
            suggestions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub media_id: String,
    /// Newly stored unconfirmed faces. Empty when the image has no faces.
    pub faces: Vec<FaceView>,
}

pub struct TaggingService {
    engine: EngineHandle,
    store: Arc<Mutex<FaceStore>>,
    matcher: EuclideanMatcher,
    suggestion_limit: usize,
    min_suggestion_confidence: f32,
}

impl TaggingService {
    pub fn new(engine: EngineHandle, store: FaceStore, config: &Config) -> Self {
        Self {
            engine,
            store: Arc::new(Mutex::new(store)),
            matcher: EuclideanMatcher,
            suggestion_limit: config.suggestion_limit,
            min_suggestion_confidence: config.min_suggestion_confidence,
        }
    }

    /// Open the database and start the ONNX engine. Models are not loaded
    /// until the first analysis, so this succeeds without them.
    pub fn open(config: &Config) -> Result<Self, TagError> {
        let analyzer = OnnxFaceAnalyzer::new(config.model_paths(), config.intra_threads);
        let engine = spawn_engine(analyzer, ENGINE_QUEUE_DEPTH)?;
        let store = FaceStore::open(&config.db_path)?;
        tracing::info!(db = %config.db_path.display(), models = %config.model_dir.display(), "tagging service ready");
        Ok(Self::new(engine, store, config))
    }

    fn store(&self) -> Result<MutexGuard<'_, FaceStore>, TagError> {
        self.store.lock().map_err(|_| TagError::StorePoisoned)
    }

    /// Detect faces in an uploaded image and store them as unconfirmed.
    ///
    /// Earlier unconfirmed faces of the image are replaced. If analysis
    /// fails nothing is written.
    pub async fn analyze_media(
        &self,
        owner_id: &str,
        media_id: &str,
        bytes: Vec<u8>,
        mime: Option<String>,
    ) -> Result<AnalysisOutcome, TagError> {
        let detections = self.engine.analyze(bytes, mime).await.map_err(|e| {
            let err = TagError::from(e);
            match &err {
                TagError::FeatureUnavailable(msg) => {
                    tracing::error!(owner_id, media_id, reason = %msg, "face models unavailable")
                }
                other => tracing::warn!(owner_id, media_id, error = %other, "image analysis failed"),
            }
            err
        })?;

        let stored = self.store()?.replace_unconfirmed(owner_id, media_id, &detections)?;
        tracing::info!(owner_id, media_id, faces = stored.len(), "image analyzed");

        Ok(AnalysisOutcome {
            media_id: media_id.to_string(),
            faces: stored.into_iter().map(|f| FaceView::new(f, Vec::new())).collect(),
        })
    }

    /// Every face of one image; unconfirmed faces carry ranked suggestions.
    pub fn faces_with_suggestions(&self, owner_id: &str, media_id: &str) -> Result<Vec<FaceView>, TagError> {
        let (faces, known) = {
            let store = self.store()?;
            let faces = store.faces_for_media(owner_id, media_id)?;
            let known = if faces.iter().any(|f| !f.is_confirmed) {
                store.collect_known_embeddings(owner_id)?.candidates
            } else {
                Vec::new()
            };
            (faces, known)
        };

        Ok(faces
            .into_iter()
            .map(|face| {
                let suggestions = if face.is_confirmed {
                    Vec::new()
                } else {
                    self.suggest(&face.id, &face.embedding, &known)
                };
                FaceView::new(face, suggestions)
            })
            .collect())
    }

    /// Rank compatible match targets for one face, applying the display
    /// threshold. Any matching problem yields no suggestions.
    fn suggest(&self, face_id: &str, query: &Embedding, known: &[Candidate]) -> Vec<Suggestion> {
        let (compatible, excluded): (Vec<&Candidate>, Vec<&Candidate>) =
            known.iter().partition(|c| is_comparable(query, &c.embedding));
        if !excluded.is_empty() {
            tracing::debug!(face_id, excluded = excluded.len(), "incompatible match targets excluded");
        }
        let compatible: Vec<Candidate> = compatible.into_iter().cloned().collect();

        match self.matcher.rank(query, &compatible, self.suggestion_limit) {
            Ok(ranked) => ranked
                .into_iter()
                .filter(|s| s.confidence >= self.min_suggestion_confidence)
                .collect(),
            Err(e) => {
                tracing::warn!(face_id, error = %e, "no suggestions for face");
                Vec::new()
            }
        }
    }

    /// Tag a face with a contact (directly or by accepting a suggestion).
    pub fn tag_face(&self, owner_id: &str, face_id: &str, contact_id: &str) -> Result<FaceView, TagError> {
        let face = self.store()?.confirm(owner_id, face_id, contact_id)?;
        Ok(FaceView::new(face, Vec::new()))
    }

    pub fn accept_suggestion(&self, owner_id: &str, face_id: &str, suggestion: &Suggestion) -> Result<FaceView, TagError> {
        self.tag_face(owner_id, face_id, &suggestion.contact_id)
    }

    /// Remove a face's tag, keeping the detection for later suggestions.
    pub fn untag_face(&self, owner_id: &str, face_id: &str) -> Result<FaceView, TagError> {
        let face = self.store()?.remove_tag(owner_id, face_id)?;
        Ok(FaceView::new(face, Vec::new()))
    }

    /// Confirmed faces of one contact across the owner's library.
    pub fn faces_of_contact(&self, owner_id: &str, contact_id: &str) -> Result<Vec<FaceView>, TagError> {
        let faces = self.store()?.faces_for_contact(owner_id, contact_id)?;
        Ok(faces.into_iter().map(|f| FaceView::new(f, Vec::new())).collect())
    }

    /// Contacts that currently have a usable match target.
    pub fn known_contacts(&self, owner_id: &str) -> Result<Vec<String>, TagError> {
        let known = self.store()?.collect_known_embeddings(owner_id)?;
        Ok(known.candidates.into_iter().map(|c| c.contact_id).collect())
    }

    /// Forget all faces of an image deleted from the library.
    pub fn forget_media(&self, owner_id: &str, media_id: &str) -> Result<usize, TagError> {
        Ok(self.store()?.delete_media(owner_id, media_id)?)
    }

    pub async fn status(&self) -> Result<AnalyzerStatus, TagError> {
        Ok(self.engine.status().await?)
    }
}

/// Same dimensionality and, when both are tagged, the same model.
fn is_comparable(query: &Embedding, target: &Embedding) -> bool {
    if query.dim() != target.dim() {
        return false;
    }
    match (&query.model_version, &target.model_version) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use std::collections::HashMap;
    use std::path::Path;
    use truly_faces_core::image_io;
    use truly_faces_core::{Detection, FaceAnalyzer, ModelPaths};

    /// Returns scripted faces for known payloads; anything else goes
    /// through the real decoder and fails as an unreadable image.
    struct ScriptedAnalyzer {
        scripts: HashMap<Vec<u8>, Vec<Vec<f32>>>,
        available: bool,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, bytes: &[u8], mime: Option<&str>) -> Result<Vec<Detection>, AnalyzeError> {
            if !self.available {
                return Err(AnalyzeError::ModelUnavailable("det_10g.onnx missing".into()));
            }
            let Some(faces) = self.scripts.get(bytes) else {
                return match image_io::decode_rgb(bytes, mime) {
                    Err(e) => Err(AnalyzeError::Decode(e)),
                    Ok(_) => Ok(Vec::new()),
                };
            };
            Ok(faces
                .iter()
                .enumerate()
                .map(|(i, values)| Detection {
                    bbox: BoundingBox {
                        x: 10.0 * i as f32, y: 5.0, width: 8.0, height: 8.0,
                        confidence: 0.95, landmarks: None,
                    },
                    embedding: Embedding {
                        values: values.clone(),
                        model_version: Some("w600k_r50".into()),
                    },
                    confidence: 0.95,
                    attributes: FaceAttributes::default(),
                })
                .collect())
        }

        fn status(&self) -> AnalyzerStatus {
            AnalyzerStatus {
                models_loaded: self.available,
                models: ModelPaths::in_dir(Path::new("/fake")),
                genderage_installed: false,
                expression_installed: false,
            }
        }
    }

    fn service(scripts: &[(&str, Vec<Vec<f32>>)], available: bool) -> TaggingService {
        let analyzer = ScriptedAnalyzer {
            scripts: scripts
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
                .collect(),
            available,
        };
        let engine = spawn_engine(analyzer, 4).unwrap();
        let store = FaceStore::open_in_memory().unwrap();
        let config = Config {
            min_suggestion_confidence: 0.3,
            ..Config::default()
        };
        TaggingService::new(engine, store, &config)
    }

    async fn analyze(svc: &TaggingService, media: &str, payload: &str) -> Result<AnalysisOutcome, TagError> {
        svc.analyze_media("u1", media, payload.as_bytes().to_vec(), Some("image/jpeg".into()))
            .await
    }

    #[tokio::test]
    async fn test_suggestions_after_confirmation() {
        let svc = service(
            &[
                ("family.jpg", vec![vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0]]),
                ("party.jpg", vec![vec![0.1, 0.0, 0.0], vec![9.0, 9.0, 9.0]]),
            ],
            true,
        );

        let family = analyze(&svc, "m1", "family.jpg").await.unwrap();
        assert_eq!(family.faces.len(), 2);
        svc.tag_face("u1", &family.faces[0].id, "alice").unwrap();
        svc.tag_face("u1", &family.faces[1].id, "bob").unwrap();

        analyze(&svc, "m2", "party.jpg").await.unwrap();
        let faces = svc.faces_with_suggestions("u1", "m2").unwrap();
        assert_eq!(faces.len(), 2);

        let near = &faces[0];
        assert_eq!(near.suggestions[0].contact_id, "alice");
        assert!(near.suggestions.windows(2).all(|w| w[0].confidence >= w[1].confidence));

        // Far from everyone: below the display threshold.
        assert!(faces[1].suggestions.is_empty());

        // Confirmed faces carry no suggestions.
        let m1 = svc.faces_with_suggestions("u1", "m1").unwrap();
        assert!(m1.iter().all(|f| f.is_confirmed && f.suggestions.is_empty()));
    }

    #[tokio::test]
    async fn test_accept_suggestion_then_untag() {
        let svc = service(
            &[("a.jpg", vec![vec![0.0, 1.0]]), ("b.jpg", vec![vec![0.0, 0.9]])],
            true,
        );
        let a = analyze(&svc, "m1", "a.jpg").await.unwrap();
        svc.tag_face("u1", &a.faces[0].id, "carol").unwrap();

        analyze(&svc, "m2", "b.jpg").await.unwrap();
        let face = svc.faces_with_suggestions("u1", "m2").unwrap().remove(0);
        let accepted = svc.accept_suggestion("u1", &face.id, &face.suggestions[0]).unwrap();
        assert_eq!(accepted.contact_id.as_deref(), Some("carol"));
        assert_eq!(svc.faces_of_contact("u1", "carol").unwrap().len(), 2);

        let untagged = svc.untag_face("u1", &face.id).unwrap();
        assert!(!untagged.is_confirmed);
        assert_eq!(untagged.contact_id, None);
        assert_eq!(untagged.bbox, face.bbox);

        // The detection survives and is suggested again.
        let again = svc.faces_with_suggestions("u1", "m2").unwrap();
        assert_eq!(again[0].suggestions[0].contact_id, "carol");
    }

    #[tokio::test]
    async fn test_unreadable_image_persists_nothing() {
        let svc = service(&[("ok.jpg", vec![vec![0.5, 0.5]])], true);
        analyze(&svc, "m1", "ok.jpg").await.unwrap();

        let err = analyze(&svc, "m1", "garbage bytes").await.unwrap_err();
        assert!(matches!(err, TagError::AnalysisFailed(_)), "got {err:?}");
        assert_eq!(svc.faces_with_suggestions("u1", "m1").unwrap().len(), 1);

        assert!(analyze(&svc, "m2", "garbage bytes").await.is_err());
        assert!(svc.faces_with_suggestions("u1", "m2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_unavailable_is_distinct_from_no_faces() {
        let svc = service(&[("empty.jpg", vec![])], false);
        let err = analyze(&svc, "m1", "empty.jpg").await.unwrap_err();
        assert!(matches!(err, TagError::FeatureUnavailable(_)));
        assert!(!svc.status().await.unwrap().models_loaded);

        let svc = service(&[("empty.jpg", vec![])], true);
        let outcome = analyze(&svc, "m1", "empty.jpg").await.unwrap();
        assert!(outcome.faces.is_empty());
    }

    #[tokio::test]
    async fn test_reanalysis_replaces_unconfirmed_only() {
        let svc = service(
            &[
                ("v1.jpg", vec![vec![0.0, 0.0], vec![1.0, 0.0]]),
                ("v2.jpg", vec![vec![0.0, 0.1], vec![1.0, 0.1], vec![2.0, 2.0]]),
            ],
            true,
        );
        let v1 = analyze(&svc, "m1", "v1.jpg").await.unwrap();
        svc.tag_face("u1", &v1.faces[0].id, "dan").unwrap();

        let v2 = analyze(&svc, "m1", "v2.jpg").await.unwrap();
        assert_eq!(v2.faces.len(), 3);
        let faces = svc.faces_with_suggestions("u1", "m1").unwrap();
        assert_eq!(faces.len(), 4);
        assert!(faces.iter().any(|f| f.id == v1.faces[0].id && f.is_confirmed));
        assert!(!faces.iter().any(|f| f.id == v1.faces[1].id));
    }

    #[tokio::test]
    async fn test_incompatible_targets_and_bad_queries_degrade_quietly() {
        let svc = service(
            &[
                ("three.jpg", vec![vec![0.0, 0.0, 0.0]]),
                ("two.jpg", vec![vec![0.0, 0.0]]),
                ("pair.jpg", vec![vec![0.0, 0.1], vec![]]),
            ],
            true,
        );
        let three = analyze(&svc, "m1", "three.jpg").await.unwrap();
        svc.tag_face("u1", &three.faces[0].id, "erin").unwrap();
        let two = analyze(&svc, "m2", "two.jpg").await.unwrap();
        svc.tag_face("u1", &two.faces[0].id, "fay").unwrap();

        analyze(&svc, "m3", "pair.jpg").await.unwrap();
        let faces = svc.faces_with_suggestions("u1", "m3").unwrap();
        assert_eq!(faces.len(), 2);

        // The 3-d target is skipped; the 2-d one still ranks.
        let ids: Vec<&str> = faces[0].suggestions.iter().map(|s| s.contact_id.as_str()).collect();
        assert_eq!(ids, vec!["fay"]);
        // Empty embedding: listed, no suggestions.
        assert!(faces[1].suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_target_does_not_hide_others() {
        let svc = service(
            &[
                ("known.jpg", vec![vec![3e38, 3e38], vec![0.0, 0.1]]),
                ("new.jpg", vec![vec![0.0, 0.0]]),
            ],
            true,
        );
        let known = analyze(&svc, "m1", "known.jpg").await.unwrap();
        svc.tag_face("u1", &known.faces[0].id, "huge").unwrap();
        svc.tag_face("u1", &known.faces[1].id, "alice").unwrap();

        analyze(&svc, "m2", "new.jpg").await.unwrap();
        let faces = svc.faces_with_suggestions("u1", "m2").unwrap();
        let ids: Vec<&str> = faces[0].suggestions.iter().map(|s| s.contact_id.as_str()).collect();
        assert_eq!(ids, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_known_contacts_and_forget_media() {
        let svc = service(&[("a.jpg", vec![vec![0.0], vec![3.0]])], true);
        let a = analyze(&svc, "m1", "a.jpg").await.unwrap();
        svc.tag_face("u1", &a.faces[0].id, "gus").unwrap();
        svc.tag_face("u1", &a.faces[1].id, "gus").unwrap();
        assert_eq!(svc.known_contacts("u1").unwrap(), vec!["gus".to_string()]);

        assert_eq!(svc.forget_media("u1", "m1").unwrap(), 2);
        assert!(svc.known_contacts("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tag_unknown_face() {
        let svc = service(&[], true);
        let err = svc.tag_face("u1", "missing", "hal").unwrap_err();
        assert!(matches!(err, TagError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_open_without_models() {
        let dir = std::env::temp_dir().join(format!("truly-tagger-{}", std::process::id()));
        let config = Config {
            model_dir: dir.join("models"),
            db_path: dir.join("nested/faces.db"),
            ..Config::default()
        };
        let svc = TaggingService::open(&config).unwrap();
        assert!(config.db_path.exists());
        assert!(!svc.status().await.unwrap().models_loaded);

        let err = svc
            .analyze_media("u1", "m1", vec![0xff, 0xd8], Some("image/jpeg".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TagError::FeatureUnavailable(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_is_comparable() {
        let a = Embedding { values: vec![0.0, 1.0], model_version: Some("w600k_r50".into()) };
        let b = Embedding { values: vec![0.0, 1.0], model_version: Some("other".into()) };
        let c = Embedding::new(vec![0.0, 1.0]);
        let d = Embedding::new(vec![0.0]);
        assert!(is_comparable(&a, &a));
        assert!(!is_comparable(&a, &b));
        assert!(is_comparable(&a, &c));
        assert!(!is_comparable(&a, &d));
    }
}
