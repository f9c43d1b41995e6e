use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tandem_types::models::{CapturedImage, Couple, Moment, MomentStatus, Notification};

/// Raw moment row as stored; converted to the typed model via `TryFrom`.
#[derive(Debug, Clone)]
pub struct MomentRow {
    pub id: String,
    pub couple_id: String,
    pub initiator_id: String,
    pub participant_id: Option<String>,
    pub memory_id: Option<String>,
    pub status: String,
    pub captured_by: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub completed_at: Option<String>,
    pub combined_image_path: Option<String>,
    pub fusion_meta: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct CapturedImageRow {
    pub id: String,
    pub moment_id: String,
    pub couple_id: String,
    pub user_id: String,
    pub path: String,
    pub digest: String,
    pub width: i64,
    pub height: i64,
    pub exif: Option<String>,
    pub captured_at: String,
}

#[derive(Debug, Clone)]
pub struct CoupleRow {
    pub id: String,
    pub partner1_id: String,
    pub partner2_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: String,
    pub created_at: String,
    pub read_at: Option<String>,
}

pub fn parse_uuid(s: &str) -> Result<Uuid> {
    s.parse::<Uuid>().with_context(|| format!("bad uuid '{s}'"))
}

/// Fixed-width UTC text form. Lexicographic order equals chronological order,
/// which the expiry sweep's range scan relies on.
pub fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp '{s}'"))?
        .with_timezone(&Utc))
}

fn parse_opt_uuid(s: &Option<String>) -> Result<Option<Uuid>> {
    s.as_deref().map(parse_uuid).transpose()
}

fn parse_opt_ts(s: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_opt_json(s: &Option<String>) -> Result<Option<serde_json::Value>> {
    s.as_deref()
        .map(|v| serde_json::from_str(v).context("bad json column"))
        .transpose()
}

impl TryFrom<MomentRow> for Moment {
    type Error = anyhow::Error;

    fn try_from(row: MomentRow) -> Result<Self> {
        let status = MomentStatus::parse(&row.status)
            .with_context(|| format!("unknown moment status '{}'", row.status))?;
        Ok(Moment {
            id: parse_uuid(&row.id)?,
            couple_id: parse_uuid(&row.couple_id)?,
            initiator_id: parse_uuid(&row.initiator_id)?,
            participant_id: parse_opt_uuid(&row.participant_id)?,
            memory_id: parse_opt_uuid(&row.memory_id)?,
            status,
            captured_by: parse_opt_uuid(&row.captured_by)?,
            created_at: parse_ts(&row.created_at)?,
            expires_at: parse_ts(&row.expires_at)?,
            completed_at: parse_opt_ts(&row.completed_at)?,
            combined_image_path: row.combined_image_path,
            fusion_meta: parse_opt_json(&row.fusion_meta)?,
            version: row.version,
        })
    }
}

impl TryFrom<CapturedImageRow> for CapturedImage {
    type Error = anyhow::Error;

    fn try_from(row: CapturedImageRow) -> Result<Self> {
        Ok(CapturedImage {
            id: parse_uuid(&row.id)?,
            moment_id: parse_uuid(&row.moment_id)?,
            couple_id: parse_uuid(&row.couple_id)?,
            user_id: parse_uuid(&row.user_id)?,
            path: row.path,
            digest: row.digest,
            width: u32::try_from(row.width).context("negative width")?,
            height: u32::try_from(row.height).context("negative height")?,
            exif: parse_opt_json(&row.exif)?,
            captured_at: parse_ts(&row.captured_at)?,
        })
    }
}

impl TryFrom<CoupleRow> for Couple {
    type Error = anyhow::Error;

    fn try_from(row: CoupleRow) -> Result<Self> {
        Ok(Couple {
            id: parse_uuid(&row.id)?,
            partner1_id: parse_uuid(&row.partner1_id)?,
            partner2_id: parse_uuid(&row.partner2_id)?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

impl TryFrom<NotificationRow> for Notification {
    type Error = anyhow::Error;

    fn try_from(row: NotificationRow) -> Result<Self> {
        Ok(Notification {
            id: parse_uuid(&row.id)?,
            user_id: parse_uuid(&row.user_id)?,
            kind: row.kind,
            title: row.title,
            body: row.body,
            data: serde_json::from_str(&row.data).context("bad notification data")?,
            created_at: parse_ts(&row.created_at)?,
            read_at: parse_opt_ts(&row.read_at)?,
        })
    }
}
