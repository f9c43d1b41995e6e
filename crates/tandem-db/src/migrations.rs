use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE couples (
                id            TEXT PRIMARY KEY,
                partner1_id   TEXT NOT NULL,
                partner2_id   TEXT NOT NULL,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE moments (
                id                  TEXT PRIMARY KEY,
                couple_id           TEXT NOT NULL REFERENCES couples(id),
                initiator_id        TEXT NOT NULL,
                participant_id      TEXT,
                memory_id           TEXT,
                status              TEXT NOT NULL DEFAULT 'pending',
                captured_by         TEXT,
                created_at          TEXT NOT NULL,
                expires_at          TEXT NOT NULL,
                completed_at        TEXT,
                combined_image_path TEXT,
                fusion_meta         TEXT,
                version             INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_moments_couple_status
                ON moments(couple_id, status);
            CREATE INDEX idx_moments_expiry
                ON moments(expires_at, status);

            CREATE TABLE captured_images (
                id          TEXT PRIMARY KEY,
                moment_id   TEXT NOT NULL REFERENCES moments(id) ON DELETE CASCADE,
                couple_id   TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                path        TEXT NOT NULL,
                digest      TEXT NOT NULL,
                width       INTEGER NOT NULL,
                height      INTEGER NOT NULL,
                exif        TEXT,
                captured_at TEXT NOT NULL,
                UNIQUE(couple_id, digest)
            );

            CREATE INDEX idx_captures_moment
                ON captured_images(moment_id, captured_at);

            CREATE TABLE notifications (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                kind        TEXT NOT NULL,
                title       TEXT NOT NULL,
                body        TEXT NOT NULL,
                data        TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                read_at     TEXT
            );

            CREATE INDEX idx_notifications_user
                ON notifications(user_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}
