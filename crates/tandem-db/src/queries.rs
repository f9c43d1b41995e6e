use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use tandem_types::models::{CapturedImage, Couple, Moment, MomentStatus, Notification};

use crate::Database;
use crate::models::{
    CapturedImageRow, CoupleRow, MomentRow, NotificationRow, fmt_ts, parse_uuid,
};

/// Outcome of the capture write primitive.
#[derive(Debug)]
pub enum CaptureWrite {
    /// Status update and capture insert both landed.
    Applied,
    /// The stored version no longer matches what the caller read.
    VersionConflict,
    /// Byte-identical content already registered for this couple; nothing
    /// was written.
    DuplicateContent { existing: CapturedImage },
}

const NON_TERMINAL: &str = "('pending', 'partner1_captured', 'partner2_captured')";

impl Database {
    // -- Couples --

    pub fn create_couple(&self, couple: &Couple) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO couples (id, partner1_id, partner2_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    couple.id.to_string(),
                    couple.partner1_id.to_string(),
                    couple.partner2_id.to_string(),
                    fmt_ts(&couple.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_couple(&self, id: Uuid) -> Result<Option<Couple>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, partner1_id, partner2_id, created_at
                     FROM couples WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(CoupleRow {
                            id: row.get(0)?,
                            partner1_id: row.get(1)?,
                            partner2_id: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            row.map(Couple::try_from).transpose()
        })
    }

    // -- Moments --

    /// Insert a new Moment unless the couple is already at its active-Moment
    /// ceiling. The count and the insert run in one transaction on the writer
    /// connection, so two racing initiations cannot both slip under the cap.
    pub fn create_moment_checked(&self, moment: &Moment, max_active: u32) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let active: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM moments
                     WHERE couple_id = ?1 AND status IN {NON_TERMINAL}"
                ),
                [moment.couple_id.to_string()],
                |r| r.get(0),
            )?;
            if active >= i64::from(max_active) {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO moments
                    (id, couple_id, initiator_id, participant_id, memory_id,
                     status, captured_by, created_at, expires_at, completed_at,
                     combined_image_path, fusion_meta, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, NULL, NULL, NULL, 0)",
                params![
                    moment.id.to_string(),
                    moment.couple_id.to_string(),
                    moment.initiator_id.to_string(),
                    moment.participant_id.map(|u| u.to_string()),
                    moment.memory_id.map(|u| u.to_string()),
                    moment.status.as_str(),
                    fmt_ts(&moment.created_at),
                    fmt_ts(&moment.expires_at),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn get_moment(&self, id: Uuid) -> Result<Option<Moment>> {
        self.with_conn(|conn| query_moment(conn, id))
    }

    /// Non-terminal Moments for a couple, newest first.
    pub fn active_moments(&self, couple_id: Uuid) -> Result<Vec<Moment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MOMENT_COLS} FROM moments
                 WHERE couple_id = ?1 AND status IN {NON_TERMINAL}
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt
                .query_map([couple_id.to_string()], map_moment_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(Moment::try_from).collect()
        })
    }

    /// The conditional status write. Applies only if the stored `version`
    /// still equals `expected_version`; bumps the version on success.
    /// Returns false when the write lost the race.
    pub fn transition_moment(
        &self,
        id: Uuid,
        expected_version: i64,
        next: MomentStatus,
        captured_by: Option<Uuid>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE moments
                 SET status = ?1,
                     captured_by = COALESCE(?2, captured_by),
                     completed_at = COALESCE(?3, completed_at),
                     version = version + 1
                 WHERE id = ?4 AND version = ?5",
                params![
                    next.as_str(),
                    captured_by.map(|u| u.to_string()),
                    completed_at.as_ref().map(fmt_ts),
                    id.to_string(),
                    expected_version,
                ],
            )?;
            Ok(changed == 1)
        })
    }

    /// Capture write primitive: the conditional status update plus the
    /// capture-row insert, in one transaction. A version conflict or a
    /// digest collision rolls the whole thing back.
    pub fn apply_capture(
        &self,
        moment_id: Uuid,
        expected_version: i64,
        next: MomentStatus,
        captured_by: Uuid,
        completed_at: Option<DateTime<Utc>>,
        image: &CapturedImage,
    ) -> Result<CaptureWrite> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let changed = tx.execute(
                "UPDATE moments
                 SET status = ?1, captured_by = ?2,
                     completed_at = COALESCE(?3, completed_at),
                     version = version + 1
                 WHERE id = ?4 AND version = ?5",
                params![
                    next.as_str(),
                    captured_by.to_string(),
                    completed_at.as_ref().map(fmt_ts),
                    moment_id.to_string(),
                    expected_version,
                ],
            )?;
            if changed == 0 {
                return Ok(CaptureWrite::VersionConflict);
            }

            let inserted = tx.execute(
                "INSERT INTO captured_images
                    (id, moment_id, couple_id, user_id, path, digest,
                     width, height, exif, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    image.id.to_string(),
                    image.moment_id.to_string(),
                    image.couple_id.to_string(),
                    image.user_id.to_string(),
                    image.path,
                    image.digest,
                    i64::from(image.width),
                    i64::from(image.height),
                    image
                        .exif
                        .as_ref()
                        .map(|v| serde_json::to_string(v))
                        .transpose()?,
                    fmt_ts(&image.captured_at),
                ],
            );

            match inserted {
                Ok(_) => {
                    tx.commit()?;
                    Ok(CaptureWrite::Applied)
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    // UNIQUE(couple_id, digest): a byte-identical upload beat
                    // us past the read check. Roll back and hand the caller
                    // the existing reference.
                    drop(tx);
                    let existing =
                        query_capture_by_digest(conn, image.couple_id, &image.digest)?
                            .context("constraint fired but no existing capture found")?;
                    Ok(CaptureWrite::DuplicateContent { existing })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Attach the fused artifact. Conditioned on the Moment still being
    /// `completed` with no artifact yet, so fusion lands exactly once.
    pub fn set_combined_image(
        &self,
        moment_id: Uuid,
        path: &str,
        meta_json: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE moments
                 SET combined_image_path = ?1, fusion_meta = ?2, version = version + 1
                 WHERE id = ?3 AND status = 'completed' AND combined_image_path IS NULL",
                params![path, meta_json, moment_id.to_string()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Non-terminal Moments whose deadline has passed, for the expiry sweep.
    pub fn expired_moment_ids(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM moments
                 WHERE expires_at < ?1 AND status IN {NON_TERMINAL}"
            ))?;
            let ids = stmt
                .query_map([fmt_ts(&now)], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.iter().map(|s| parse_uuid(s)).collect()
        })
    }

    // -- Captured images --

    pub fn find_capture_by_digest(
        &self,
        couple_id: Uuid,
        digest: &str,
    ) -> Result<Option<CapturedImage>> {
        self.with_conn(|conn| query_capture_by_digest(conn, couple_id, digest))
    }

    /// Captures for a Moment, ordered by capture time.
    pub fn captures_for_moment(&self, moment_id: Uuid) -> Result<Vec<CapturedImage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CAPTURE_COLS} FROM captured_images
                 WHERE moment_id = ?1 ORDER BY captured_at ASC"
            ))?;
            let rows = stmt
                .query_map([moment_id.to_string()], map_capture_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(CapturedImage::try_from).collect()
        })
    }

    // -- Notifications --

    pub fn insert_notification(&self, n: &Notification) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notifications
                    (id, user_id, kind, title, body, data, created_at, read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
                params![
                    n.id.to_string(),
                    n.user_id.to_string(),
                    n.kind,
                    n.title,
                    n.body,
                    serde_json::to_string(&n.data)?,
                    fmt_ts(&n.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn notifications_for_user(&self, user_id: Uuid, limit: u32) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, title, body, data, created_at, read_at
                 FROM notifications
                 WHERE user_id = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![user_id.to_string(), limit], |row| {
                    Ok(NotificationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: row.get(2)?,
                        title: row.get(3)?,
                        body: row.get(4)?,
                        data: row.get(5)?,
                        created_at: row.get(6)?,
                        read_at: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(Notification::try_from).collect()
        })
    }

    pub fn mark_notification_read(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET read_at = ?1
                 WHERE id = ?2 AND user_id = ?3 AND read_at IS NULL",
                params![fmt_ts(&at), id.to_string(), user_id.to_string()],
            )?;
            Ok(changed == 1)
        })
    }
}

const MOMENT_COLS: &str = "id, couple_id, initiator_id, participant_id, memory_id, status, \
     captured_by, created_at, expires_at, completed_at, combined_image_path, fusion_meta, version";

const CAPTURE_COLS: &str =
    "id, moment_id, couple_id, user_id, path, digest, width, height, exif, captured_at";

fn map_moment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MomentRow> {
    Ok(MomentRow {
        id: row.get(0)?,
        couple_id: row.get(1)?,
        initiator_id: row.get(2)?,
        participant_id: row.get(3)?,
        memory_id: row.get(4)?,
        status: row.get(5)?,
        captured_by: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        completed_at: row.get(9)?,
        combined_image_path: row.get(10)?,
        fusion_meta: row.get(11)?,
        version: row.get(12)?,
    })
}

fn map_capture_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CapturedImageRow> {
    Ok(CapturedImageRow {
        id: row.get(0)?,
        moment_id: row.get(1)?,
        couple_id: row.get(2)?,
        user_id: row.get(3)?,
        path: row.get(4)?,
        digest: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        exif: row.get(8)?,
        captured_at: row.get(9)?,
    })
}

fn query_moment(conn: &Connection, id: Uuid) -> Result<Option<Moment>> {
    let row = conn
        .query_row(
            &format!("SELECT {MOMENT_COLS} FROM moments WHERE id = ?1"),
            [id.to_string()],
            map_moment_row,
        )
        .optional()?;
    row.map(Moment::try_from).transpose()
}

fn query_capture_by_digest(
    conn: &Connection,
    couple_id: Uuid,
    digest: &str,
) -> Result<Option<CapturedImage>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {CAPTURE_COLS} FROM captured_images
                 WHERE couple_id = ?1 AND digest = ?2"
            ),
            params![couple_id.to_string(), digest],
            map_capture_row,
        )
        .optional()?;
    row.map(CapturedImage::try_from).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::open(&dir.path().join("tandem.db")).unwrap()
    }

    fn seed_couple(db: &Database) -> Couple {
        let couple = Couple {
            id: Uuid::new_v4(),
            partner1_id: Uuid::new_v4(),
            partner2_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        db.create_couple(&couple).unwrap();
        couple
    }

    fn new_moment(couple: &Couple) -> Moment {
        Moment {
            id: Uuid::new_v4(),
            couple_id: couple.id,
            initiator_id: couple.partner1_id,
            participant_id: Some(couple.partner2_id),
            memory_id: None,
            status: MomentStatus::Pending,
            captured_by: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
            completed_at: None,
            combined_image_path: None,
            fusion_meta: None,
            version: 0,
        }
    }

    fn new_capture(moment: &Moment, user: Uuid, digest: &str) -> CapturedImage {
        CapturedImage {
            id: Uuid::new_v4(),
            moment_id: moment.id,
            couple_id: moment.couple_id,
            user_id: user,
            path: format!("couples/{}/captures/{digest}.jpg", moment.couple_id),
            digest: digest.to_string(),
            width: 640,
            height: 480,
            exif: None,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn moment_round_trips_with_version() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let couple = seed_couple(&db);
        let m = new_moment(&couple);

        assert!(db.create_moment_checked(&m, 3).unwrap());
        let loaded = db.get_moment(m.id).unwrap().unwrap();
        assert_eq!(loaded.status, MomentStatus::Pending);
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.participant_id, Some(couple.partner2_id));
    }

    #[test]
    fn capacity_check_is_enforced_in_the_insert() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let couple = seed_couple(&db);

        assert!(db.create_moment_checked(&new_moment(&couple), 2).unwrap());
        assert!(db.create_moment_checked(&new_moment(&couple), 2).unwrap());
        assert!(!db.create_moment_checked(&new_moment(&couple), 2).unwrap());
    }

    #[test]
    fn stale_version_loses_the_conditional_write() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let couple = seed_couple(&db);
        let m = new_moment(&couple);
        db.create_moment_checked(&m, 3).unwrap();

        assert!(
            db.transition_moment(m.id, 0, MomentStatus::Expired, None, None)
                .unwrap()
        );
        // Same token again: the row moved on, the write must not.
        assert!(
            !db.transition_moment(m.id, 0, MomentStatus::Expired, None, None)
                .unwrap()
        );
        let loaded = db.get_moment(m.id).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn capture_write_rolls_back_whole_tx_on_conflict() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let couple = seed_couple(&db);
        let m = new_moment(&couple);
        db.create_moment_checked(&m, 3).unwrap();

        let img = new_capture(&m, couple.partner1_id, "aa11");
        let write = db
            .apply_capture(m.id, 99, MomentStatus::Partner1Captured, couple.partner1_id, None, &img)
            .unwrap();
        assert!(matches!(write, CaptureWrite::VersionConflict));
        assert!(db.captures_for_moment(m.id).unwrap().is_empty());
    }

    #[test]
    fn duplicate_digest_reports_existing_capture_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let couple = seed_couple(&db);
        let m = new_moment(&couple);
        db.create_moment_checked(&m, 3).unwrap();

        let first = new_capture(&m, couple.partner1_id, "d1gest");
        let write = db
            .apply_capture(m.id, 0, MomentStatus::Partner1Captured, couple.partner1_id, None, &first)
            .unwrap();
        assert!(matches!(write, CaptureWrite::Applied));

        let second = new_capture(&m, couple.partner2_id, "d1gest");
        let write = db
            .apply_capture(m.id, 1, MomentStatus::Partner2Captured, couple.partner2_id, None, &second)
            .unwrap();
        match write {
            CaptureWrite::DuplicateContent { existing } => {
                assert_eq!(existing.id, first.id);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        // The losing transaction must not have advanced the Moment.
        let loaded = db.get_moment(m.id).unwrap().unwrap();
        assert_eq!(loaded.status, MomentStatus::Partner1Captured);
        assert_eq!(loaded.version, 1);
        assert_eq!(db.captures_for_moment(m.id).unwrap().len(), 1);
    }

    #[test]
    fn combined_image_attaches_exactly_once() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let couple = seed_couple(&db);
        let m = new_moment(&couple);
        db.create_moment_checked(&m, 3).unwrap();
        db.transition_moment(m.id, 0, MomentStatus::Completed, None, Some(Utc::now()))
            .unwrap();

        assert!(db.set_combined_image(m.id, "a/fused.jpg", "{}").unwrap());
        assert!(!db.set_combined_image(m.id, "b/fused.jpg", "{}").unwrap());

        let loaded = db.get_moment(m.id).unwrap().unwrap();
        assert_eq!(loaded.combined_image_path.as_deref(), Some("a/fused.jpg"));
    }

    #[test]
    fn expiry_scan_only_sees_non_terminal_past_deadline() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let couple = seed_couple(&db);

        let mut stale = new_moment(&couple);
        stale.expires_at = Utc::now() - Duration::seconds(10);
        let mut fresh = new_moment(&couple);
        fresh.expires_at = Utc::now() + Duration::hours(1);

        db.create_moment_checked(&stale, 3).unwrap();
        db.create_moment_checked(&fresh, 3).unwrap();

        let ids = db.expired_moment_ids(Utc::now()).unwrap();
        assert_eq!(ids, vec![stale.id]);

        db.transition_moment(stale.id, 0, MomentStatus::Expired, None, None)
            .unwrap();
        assert!(db.expired_moment_ids(Utc::now()).unwrap().is_empty());
    }
}
