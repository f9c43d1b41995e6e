use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use tandem_db::Database;
use tandem_types::models::CapturedImage;

use crate::error::MomentError;

/// Hash equality is treated as certain.
pub const EXACT_MATCH_CONFIDENCE: f32 = 1.0;

/// Result of a couple-scoped duplicate check.
#[derive(Debug)]
pub struct DedupOutcome {
    /// Lowercase hex SHA-256 over the raw upload bytes. The caller persists
    /// this alongside a fresh capture record.
    pub digest: String,
    /// The already-stored capture with identical content, if any.
    pub existing: Option<CapturedImage>,
    /// 1.0 for a digest hit, 0.0 otherwise.
    pub confidence: f32,
}

impl DedupOutcome {
    pub fn is_duplicate(&self) -> bool {
        self.existing.is_some()
    }
}

/// Content-digest deduplication, scoped per couple.
///
/// The check itself is a read; registration happens when the caller persists
/// the capture row, where `UNIQUE(couple_id, digest)` plus the single-writer
/// transaction make check-then-register atomic. A concurrent byte-identical
/// upload that passes this check still loses at the insert and is handed the
/// existing reference.
#[derive(Clone)]
pub struct DeduplicationService {
    db: Arc<Database>,
}

impl DeduplicationService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Lowercase hex SHA-256 of the raw bytes.
    pub fn digest(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn check_and_register(
        &self,
        couple_id: Uuid,
        bytes: &[u8],
    ) -> Result<DedupOutcome, MomentError> {
        let digest = Self::digest(bytes);
        let existing = self.db.find_capture_by_digest(couple_id, &digest)?;
        let confidence = if existing.is_some() {
            EXACT_MATCH_CONFIDENCE
        } else {
            0.0
        };
        Ok(DedupOutcome {
            digest,
            existing,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = DeduplicationService::digest(b"frame one");
        let b = DeduplicationService::digest(b"frame one");
        let c = DeduplicationService::digest(b"frame two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
