//! SQLite-backed face record store.
//!
//! Every query is scoped by `owner_id`; one owner's faces are never visible
//! to another owner.

use crate::codec;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use truly_faces_core::{
    BoundingBox, Candidate, Detection, Embedding, Expression, FaceAttributes, FaceRecord, Gender,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("face not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS faces (
    id            TEXT PRIMARY KEY,
    owner_id      TEXT NOT NULL,
    media_id      TEXT NOT NULL,
    bbox_x        REAL NOT NULL,
    bbox_y        REAL NOT NULL,
    bbox_width    REAL NOT NULL,
    bbox_height   REAL NOT NULL,
    landmarks     TEXT,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    confidence    REAL NOT NULL,
    age           INTEGER,
    gender        TEXT,
    expression    TEXT,
    contact_id    TEXT,
    is_confirmed  INTEGER NOT NULL DEFAULT 0,
    confirmed_at  TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_faces_owner_media ON faces(owner_id, media_id);
CREATE INDEX IF NOT EXISTS idx_faces_owner_contact ON faces(owner_id, contact_id, is_confirmed);
"#;

const FACE_COLUMNS: &str = "id, owner_id, media_id, bbox_x, bbox_y, bbox_width, bbox_height, landmarks, \
     embedding, model_version, confidence, age, gender, expression, contact_id, is_confirmed, \
     confirmed_at, created_at";

/// Match targets for one owner: one embedding per confirmed contact.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KnownEmbeddings {
    pub candidates: Vec<Candidate>,
    /// Confirmed faces whose stored embedding could not be decoded.
    pub skipped: usize,
}

pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        tracing::info!(path = %path.display(), "opened face store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Replace the provisional faces of one image with a fresh analysis.
    ///
    /// Runs in a single transaction: either every new record is stored and
    /// the stale unconfirmed ones are gone, or nothing changes. Confirmed
    /// faces of the image are kept.
    pub fn replace_unconfirmed(
        &mut self,
        owner_id: &str,
        media_id: &str,
        detections: &[Detection],
    ) -> Result<Vec<FaceRecord>, StoreError> {
        require_id("owner_id", owner_id)?;
        require_id("media_id", media_id)?;

        let now = Utc::now();
        let records: Vec<FaceRecord> = detections
            .iter()
            .map(|d| FaceRecord {
                id: uuid::Uuid::new_v4().to_string(),
                media_id: media_id.to_string(),
                owner_id: owner_id.to_string(),
                bbox: d.bbox.clone(),
                embedding: d.embedding.clone(),
                confidence: d.confidence,
                attributes: d.attributes.clone(),
                contact_id: None,
                is_confirmed: false,
                confirmed_at: None,
                created_at: now,
            })
            .collect();

        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM faces WHERE owner_id = ?1 AND media_id = ?2 AND is_confirmed = 0",
            params![owner_id, media_id],
        )?;
        for record in &records {
            insert_record(&tx, record)?;
        }
        tx.commit()?;

        tracing::debug!(owner_id, media_id, removed, inserted = records.len(), "replaced unconfirmed faces");
        Ok(records)
    }

    pub fn get(&self, owner_id: &str, face_id: &str) -> Result<Option<FaceRecord>, StoreError> {
        let sql = format!("SELECT {FACE_COLUMNS} FROM faces WHERE owner_id = ?1 AND id = ?2");
        let record = self
            .conn
            .query_row(&sql, params![owner_id, face_id], read_record)
            .optional()?;
        Ok(record)
    }

    /// All faces of one image, in detection order.
    pub fn faces_for_media(&self, owner_id: &str, media_id: &str) -> Result<Vec<FaceRecord>, StoreError> {
        let sql = format!("SELECT {FACE_COLUMNS} FROM faces WHERE owner_id = ?1 AND media_id = ?2 ORDER BY rowid");
        self.query_records(&sql, owner_id, media_id)
    }

    /// Confirmed faces tagged with one contact, oldest first.
    pub fn faces_for_contact(&self, owner_id: &str, contact_id: &str) -> Result<Vec<FaceRecord>, StoreError> {
        let sql = format!(
            "SELECT {FACE_COLUMNS} FROM faces \
             WHERE owner_id = ?1 AND contact_id = ?2 AND is_confirmed = 1 ORDER BY rowid"
        );
        self.query_records(&sql, owner_id, contact_id)
    }

    fn query_records(&self, sql: &str, owner_id: &str, key: &str) -> Result<Vec<FaceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![owner_id, key], read_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Associate a face with a contact, making it a match target.
    ///
    /// `confirmed_at` records the first confirmation; retagging an already
    /// confirmed face keeps it.
    pub fn confirm(&self, owner_id: &str, face_id: &str, contact_id: &str) -> Result<FaceRecord, StoreError> {
        require_id("contact_id", contact_id)?;
        let changed = self.conn.execute(
            "UPDATE faces SET contact_id = ?3, \
             confirmed_at = CASE WHEN is_confirmed = 1 THEN confirmed_at ELSE ?4 END, \
             is_confirmed = 1 \
             WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, face_id, contact_id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(face_id.to_string()));
        }
        tracing::info!(owner_id, face_id, contact_id, "face confirmed");
        self.get(owner_id, face_id)?
            .ok_or_else(|| StoreError::NotFound(face_id.to_string()))
    }

    /// Clear a face's tag. The embedding and bounding box are kept so the
    /// face can be suggested again without re-running detection.
    pub fn remove_tag(&self, owner_id: &str, face_id: &str) -> Result<FaceRecord, StoreError> {
        let changed = self.conn.execute(
            "UPDATE faces SET contact_id = NULL, is_confirmed = 0, confirmed_at = NULL \
             WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, face_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(face_id.to_string()));
        }
        tracing::info!(owner_id, face_id, "face tag removed");
        self.get(owner_id, face_id)?
            .ok_or_else(|| StoreError::NotFound(face_id.to_string()))
    }

    /// Drop every face of an image that was deleted upstream.
    pub fn delete_media(&self, owner_id: &str, media_id: &str) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM faces WHERE owner_id = ?1 AND media_id = ?2",
            params![owner_id, media_id],
        )?;
        tracing::debug!(owner_id, media_id, removed, "deleted media faces");
        Ok(removed)
    }

    /// One match target per confirmed contact: the first confirmed face (in
    /// insertion order) whose embedding decodes. Which face wins when a
    /// contact has several is arbitrary.
    pub fn collect_known_embeddings(&self, owner_id: &str) -> Result<KnownEmbeddings, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, contact_id, embedding, model_version FROM faces \
             WHERE owner_id = ?1 AND is_confirmed = 1 AND contact_id IS NOT NULL ORDER BY rowid",
        )?;
        let mut rows = stmt.query(params![owner_id])?;

        let mut known = KnownEmbeddings::default();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(row) = rows.next()? {
            let contact_id: String = row.get(1)?;
            if seen.contains(&contact_id) {
                continue;
            }
            match codec::embedding_from_sql(row.get_ref(2)?) {
                Some(values) => {
                    seen.insert(contact_id.clone());
                    known.candidates.push(Candidate {
                        contact_id,
                        embedding: Embedding {
                            values,
                            model_version: row.get(3)?,
                        },
                    });
                }
                None => {
                    let face_id: String = row.get(0)?;
                    tracing::warn!(owner_id, face_id, contact_id, "confirmed face has unreadable embedding; skipped");
                    known.skipped += 1;
                }
            }
        }

        if known.skipped > 0 {
            tracing::warn!(
                owner_id,
                skipped = known.skipped,
                contacts = known.candidates.len(),
                "match targets degraded by corrupt embeddings"
            );
        }
        Ok(known)
    }
}

fn require_id(field: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

fn insert_record(conn: &Connection, r: &FaceRecord) -> Result<(), StoreError> {
    let landmarks = r
        .bbox
        .landmarks
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::InvalidInput(format!("landmarks: {e}")))?;

    conn.execute(
        &format!(
            "INSERT INTO faces ({FACE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        ),
        params![
            r.id,
            r.owner_id,
            r.media_id,
            r.bbox.x,
            r.bbox.y,
            r.bbox.width,
            r.bbox.height,
            landmarks,
            codec::encode_blob(&r.embedding.values),
            r.embedding.model_version,
            r.confidence,
            r.attributes.age,
            r.attributes.gender.map(|g| g.as_str()),
            r.attributes.expression.map(|e| e.as_str()),
            r.contact_id,
            r.is_confirmed,
            r.confirmed_at.map(|t| t.to_rfc3339()),
            r.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<FaceRecord> {
    let id: String = row.get(0)?;

    let landmarks = row
        .get::<_, Option<String>>(7)?
        .and_then(|raw| serde_json::from_str::<[(f32, f32); 5]>(&raw).ok());

    // An unreadable embedding degrades this face's suggestions only.
    let values = codec::embedding_from_sql(row.get_ref(8)?).unwrap_or_else(|| {
        tracing::warn!(face_id = %id, "stored embedding unreadable");
        Vec::new()
    });

    let confirmed_at = row
        .get::<_, Option<String>>(16)?
        .map(|raw| parse_timestamp(16, &raw))
        .transpose()?;
    let created_at = parse_timestamp(17, &row.get::<_, String>(17)?)?;

    Ok(FaceRecord {
        id,
        owner_id: row.get(1)?,
        media_id: row.get(2)?,
        bbox: BoundingBox {
            x: row.get(3)?,
            y: row.get(4)?,
            width: row.get(5)?,
            height: row.get(6)?,
            confidence: row.get(10)?,
            landmarks,
        },
        embedding: Embedding {
            values,
            model_version: row.get(9)?,
        },
        confidence: row.get(10)?,
        attributes: FaceAttributes {
            age: row.get(11)?,
            gender: row.get::<_, Option<String>>(12)?.as_deref().and_then(Gender::parse),
            expression: row.get::<_, Option<String>>(13)?.as_deref().and_then(Expression::parse),
        },
        contact_id: row.get(14)?,
        is_confirmed: row.get(15)?,
        confirmed_at,
        created_at,
    })
}
