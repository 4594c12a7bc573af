use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discrete priority level. Higher levels admit before lower ones;
/// within a level, admission is strictly FIFO by enqueue score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Normal = 0,
    Elevated = 1,
    Vip = 2,
    Premium = 3,
}

impl Priority {
    /// All priorities in admission order (highest first).
    pub const ADMISSION_ORDER: [Priority; 4] = [
        Priority::Premium,
        Priority::Vip,
        Priority::Elevated,
        Priority::Normal,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Priorities strictly above this one, i.e. those whose whole backlog
    /// precedes any position at this level.
    pub fn higher(self) -> impl Iterator<Item = Priority> {
        Priority::ADMISSION_ORDER
            .into_iter()
            .filter(move |p| *p > self)
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Normal),
            1 => Ok(Priority::Elevated),
            2 => Ok(Priority::Vip),
            3 => Ok(Priority::Premium),
            other => Err(format!("priority out of range: {other}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Lifecycle state of a position.
///
/// Transitions form a DAG and are never reversed:
/// `waiting -> {admitted, expired, cancelled}`, `admitted -> completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Waiting,
    Admitted,
    Expired,
    Completed,
    Cancelled,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Waiting => "waiting",
            PositionStatus::Admitted => "admitted",
            PositionStatus::Expired => "expired",
            PositionStatus::Completed => "completed",
            PositionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(PositionStatus::Waiting),
            "admitted" => Some(PositionStatus::Admitted),
            "expired" => Some(PositionStatus::Expired),
            "completed" => Some(PositionStatus::Completed),
            "cancelled" => Some(PositionStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Waiting, Admitted) | (Waiting, Expired) | (Waiting, Cancelled) | (Admitted, Completed)
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client's slot in a queue. The canonical representation is the metadata
/// hash in the store; this struct is the typed view of that hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: String,
    pub queue_id: String,
    pub priority: Priority,
    pub status: PositionStatus,
    /// Enqueue score, microseconds. Strictly unique per queue.
    pub enqueued_at_us: u64,
    /// Last proof-of-life, whole seconds.
    pub heartbeat_at_s: u64,
    pub fingerprint: String,
    pub ua_hash: Option<String>,
    /// Opaque caller-supplied JSON, carried through unmodified.
    pub metadata: Option<String>,
    /// Set by the admission path once a session has been carved out.
    pub session_id: Option<String>,
    /// Metadata lifetime while waiting (heartbeat timeout + grace), seconds.
    pub ttl_s: u64,
    /// Retention after a terminal transition, seconds.
    pub grace_s: u64,
}

impl Position {
    /// Mint a time-ordered position id.
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Field pairs for the metadata hash. Shared by both store backends so
    /// they stay byte-compatible.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("queue_id", self.queue_id.clone()),
            ("priority", self.priority.as_u8().to_string()),
            ("status", self.status.as_str().to_string()),
            ("enqueued_at_us", self.enqueued_at_us.to_string()),
            ("heartbeat_at_s", self.heartbeat_at_s.to_string()),
            ("fingerprint", self.fingerprint.clone()),
            ("ttl_s", self.ttl_s.to_string()),
            ("grace_s", self.grace_s.to_string()),
        ];
        if let Some(ref ua) = self.ua_hash {
            fields.push(("ua_hash", ua.clone()));
        }
        if let Some(ref meta) = self.metadata {
            fields.push(("metadata", meta.clone()));
        }
        if let Some(ref sid) = self.session_id {
            fields.push(("session_id", sid.clone()));
        }
        fields
    }

    /// Rebuild a position from its metadata hash. Returns `None` when a
    /// required field is absent or malformed.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let priority = Priority::try_from(fields.get("priority")?.parse::<u8>().ok()?).ok()?;
        Some(Position {
            id: id.to_string(),
            queue_id: fields.get("queue_id")?.clone(),
            priority,
            status: PositionStatus::parse(fields.get("status")?)?,
            enqueued_at_us: fields.get("enqueued_at_us")?.parse().ok()?,
            heartbeat_at_s: fields.get("heartbeat_at_s")?.parse().ok()?,
            fingerprint: fields.get("fingerprint")?.clone(),
            ua_hash: fields.get("ua_hash").cloned(),
            metadata: fields.get("metadata").cloned(),
            session_id: fields.get("session_id").cloned(),
            ttl_s: fields.get("ttl_s")?.parse().ok()?,
            grace_s: fields.get("grace_s")?.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_admission_order_is_descending() {
        let levels: Vec<u8> = Priority::ADMISSION_ORDER
            .iter()
            .map(|p| p.as_u8())
            .collect();
        assert_eq!(levels, vec![3, 2, 1, 0]);
    }

    #[test]
    fn priority_higher_excludes_self() {
        let above: Vec<Priority> = Priority::Vip.higher().collect();
        assert_eq!(above, vec![Priority::Premium]);

        assert_eq!(Priority::Premium.higher().count(), 0);
        assert_eq!(Priority::Normal.higher().count(), 3);
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::try_from(4).is_err());
    }

    #[test]
    fn status_transitions_are_one_way() {
        use PositionStatus::*;
        assert!(Waiting.can_transition_to(Admitted));
        assert!(Waiting.can_transition_to(Expired));
        assert!(Waiting.can_transition_to(Cancelled));
        assert!(Admitted.can_transition_to(Completed));

        // No transition is ever reversed.
        for from in [Admitted, Expired, Completed, Cancelled] {
            assert!(!from.can_transition_to(Waiting));
        }
        assert!(!Expired.can_transition_to(Admitted));
        assert!(!Cancelled.can_transition_to(Admitted));
    }

    #[test]
    fn field_roundtrip_preserves_position() {
        let pos = Position {
            id: Position::new_id(),
            queue_id: "launch".to_string(),
            priority: Priority::Vip,
            status: PositionStatus::Waiting,
            enqueued_at_us: 1_700_000_000_000_123,
            heartbeat_at_s: 1_700_000_000,
            fingerprint: "abc123".to_string(),
            ua_hash: Some("ua".to_string()),
            metadata: Some(r#"{"cart":"xl"}"#.to_string()),
            session_id: None,
            ttl_s: 90,
            grace_s: 30,
        };

        let map: HashMap<String, String> = pos
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = Position::from_fields(&pos.id, &map).expect("roundtrip");
        assert_eq!(back, pos);
    }

    #[test]
    fn from_fields_rejects_missing_required() {
        let map = HashMap::from([("queue_id".to_string(), "q".to_string())]);
        assert!(Position::from_fields("id", &map).is_none());
    }

    #[test]
    fn position_ids_are_time_ordered() {
        let a = Position::new_id();
        let b = Position::new_id();
        assert!(a <= b, "v7 ids should sort by creation time");
    }
}
