use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pairing of two users. Couples own Moments and scope deduplication
/// and capacity rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Couple {
    pub id: Uuid,
    pub partner1_id: Uuid,
    pub partner2_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Couple {
    pub fn is_member(&self, user_id: Uuid) -> bool {
        user_id == self.partner1_id || user_id == self.partner2_id
    }

    /// The partner who is not `user_id`, if `user_id` belongs to this couple.
    pub fn other_partner(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.partner1_id {
            Some(self.partner2_id)
        } else if user_id == self.partner2_id {
            Some(self.partner1_id)
        } else {
            None
        }
    }
}

/// Lifecycle states of a Moment. `Completed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentStatus {
    Pending,
    Partner1Captured,
    Partner2Captured,
    Completed,
    Expired,
}

impl MomentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partner1Captured => "partner1_captured",
            Self::Partner2Captured => "partner2_captured",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "partner1_captured" => Some(Self::Partner1Captured),
            "partner2_captured" => Some(Self::Partner2Captured),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }

    /// The transition table. Everything not listed here is invalid.
    pub fn allowed_next(&self) -> &'static [MomentStatus] {
        use MomentStatus::*;
        match self {
            Pending => &[Partner1Captured, Partner2Captured, Expired],
            Partner1Captured => &[Partner2Captured, Completed, Expired],
            Partner2Captured => &[Partner1Captured, Completed, Expired],
            Completed | Expired => &[],
        }
    }

    pub fn can_transition_to(&self, next: MomentStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

/// Which side of the couple a user is on, relative to a Moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Participant,
}

impl Role {
    /// The capture state this role's photo lands the Moment in.
    pub fn captured_status(&self) -> MomentStatus {
        match self {
            Self::Initiator => MomentStatus::Partner1Captured,
            Self::Participant => MomentStatus::Partner2Captured,
        }
    }
}

/// The shared record coordinating a two-party synchronized capture.
///
/// `version` is the optimistic-concurrency token: every status write is
/// conditioned on it and bumps it by one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Moment {
    pub id: Uuid,
    pub couple_id: Uuid,
    pub initiator_id: Uuid,
    pub participant_id: Option<Uuid>,
    pub memory_id: Option<Uuid>,
    pub status: MomentStatus,
    pub captured_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub combined_image_path: Option<String>,
    pub fusion_meta: Option<serde_json::Value>,
    pub version: i64,
}

impl Moment {
    /// Resolve a user to their role on this Moment, checking both fields.
    pub fn role_of(&self, user_id: Uuid) -> Option<Role> {
        if user_id == self.initiator_id {
            Some(Role::Initiator)
        } else if self.participant_id == Some(user_id) {
            Some(Role::Participant)
        } else {
            None
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }
}

/// One photo submitted against a Moment. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedImage {
    pub id: Uuid,
    pub moment_id: Uuid,
    pub couple_id: Uuid,
    pub user_id: Uuid,
    pub path: String,
    pub digest: String,
    pub width: u32,
    pub height: u32,
    pub exif: Option<serde_json::Value>,
    pub captured_at: DateTime<Utc>,
}

/// How the two captures are arranged on the fused canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionLayout {
    Horizontal,
    Vertical,
}

/// Per-source provenance recorded in the fusion envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionProvenance {
    pub user_id: Uuid,
    pub role: Role,
    pub source_path: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub exif: Option<serde_json::Value>,
}

/// Metadata envelope stored alongside `combined_image_path` once fusion
/// succeeds. Created exactly once per completed Moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionArtifactMeta {
    pub moment_id: Uuid,
    pub layout: FusionLayout,
    pub width: u32,
    pub height: u32,
    pub thumbnail_path: String,
    pub created_at: DateTime<Utc>,
    pub sources: Vec<FusionProvenance>,
}

/// Durable notification record for a user who was offline at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moment(initiator: Uuid, participant: Option<Uuid>) -> Moment {
        Moment {
            id: Uuid::new_v4(),
            couple_id: Uuid::new_v4(),
            initiator_id: initiator,
            participant_id: participant,
            memory_id: None,
            status: MomentStatus::Pending,
            captured_by: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
            completed_at: None,
            combined_image_path: None,
            fusion_meta: None,
            version: 0,
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        assert!(MomentStatus::Completed.allowed_next().is_empty());
        assert!(MomentStatus::Expired.allowed_next().is_empty());
    }

    #[test]
    fn transition_table_matches_protocol() {
        use MomentStatus::*;
        assert!(Pending.can_transition_to(Partner1Captured));
        assert!(Pending.can_transition_to(Partner2Captured));
        assert!(Pending.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Completed));

        assert!(Partner1Captured.can_transition_to(Partner2Captured));
        assert!(Partner1Captured.can_transition_to(Completed));
        assert!(!Partner1Captured.can_transition_to(Partner1Captured));
        assert!(!Partner1Captured.can_transition_to(Pending));

        assert!(Partner2Captured.can_transition_to(Partner1Captured));
        assert!(Partner2Captured.can_transition_to(Completed));
        assert!(!Partner2Captured.can_transition_to(Partner2Captured));
    }

    #[test]
    fn role_lookup_checks_both_fields() {
        let (u1, u2, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let m = moment(u1, Some(u2));
        assert_eq!(m.role_of(u1), Some(Role::Initiator));
        assert_eq!(m.role_of(u2), Some(Role::Participant));
        assert_eq!(m.role_of(stranger), None);

        let unset = moment(u1, None);
        assert_eq!(unset.role_of(u2), None);
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for s in [
            MomentStatus::Pending,
            MomentStatus::Partner1Captured,
            MomentStatus::Partner2Captured,
            MomentStatus::Completed,
            MomentStatus::Expired,
        ] {
            assert_eq!(MomentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(MomentStatus::parse("bogus"), None);
    }

    #[test]
    fn lazy_expiry_only_applies_to_non_terminal_states() {
        let mut m = moment(Uuid::new_v4(), None);
        m.expires_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(m.is_expired_at(Utc::now()));

        m.status = MomentStatus::Completed;
        assert!(!m.is_expired_at(Utc::now()));
    }
}
