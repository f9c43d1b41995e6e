use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Realtime events published on a couple's channel.
///
/// One channel per couple, named by [`couple_channel`]. Every successful
/// Moment transition produces exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MomentEvent {
    /// A new Moment was opened by one partner.
    #[serde(rename = "moment:initiated")]
    Initiated {
        moment_id: Uuid,
        couple_id: Uuid,
        initiator: Uuid,
        expires_at: DateTime<Utc>,
    },

    /// One partner's photo landed; the Moment is waiting on the other.
    #[serde(rename = "moment:partner_captured")]
    PartnerCaptured {
        moment_id: Uuid,
        couple_id: Uuid,
        actor_id: Uuid,
    },

    /// Both photos landed. `combined_image` is `None` until the async
    /// fusion job finishes.
    #[serde(rename = "moment:completed")]
    Completed {
        moment_id: Uuid,
        couple_id: Uuid,
        combined_image: Option<String>,
    },

    /// The capture window elapsed with at most one photo.
    #[serde(rename = "moment:expired")]
    Expired { moment_id: Uuid, couple_id: Uuid },
}

impl MomentEvent {
    /// The couple whose channel this event belongs on.
    pub fn couple_id(&self) -> Uuid {
        match self {
            Self::Initiated { couple_id, .. }
            | Self::PartnerCaptured { couple_id, .. }
            | Self::Completed { couple_id, .. }
            | Self::Expired { couple_id, .. } => *couple_id,
        }
    }

    pub fn moment_id(&self) -> Uuid {
        match self {
            Self::Initiated { moment_id, .. }
            | Self::PartnerCaptured { moment_id, .. }
            | Self::Completed { moment_id, .. }
            | Self::Expired { moment_id, .. } => *moment_id,
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initiated { .. } => "moment:initiated",
            Self::PartnerCaptured { .. } => "moment:partner_captured",
            Self::Completed { .. } => "moment:completed",
            Self::Expired { .. } => "moment:expired",
        }
    }
}

/// Deterministic channel name for a couple's realtime stream.
pub fn couple_channel(couple_id: Uuid) -> String {
    format!("couple:{couple_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_matches_wire_tag() {
        let ev = MomentEvent::Expired {
            moment_id: Uuid::new_v4(),
            couple_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.kind());
    }

    #[test]
    fn channel_name_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(couple_channel(id), couple_channel(id));
        assert!(couple_channel(id).starts_with("couple:"));
    }

    #[test]
    fn completed_event_allows_pending_artifact() {
        let ev = MomentEvent::Completed {
            moment_id: Uuid::new_v4(),
            couple_id: Uuid::new_v4(),
            combined_image: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: MomentEvent = serde_json::from_str(&json).unwrap();
        match back {
            MomentEvent::Completed { combined_image, .. } => assert!(combined_image.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
