use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            "terminated" => Some(SessionStatus::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admitted client holding a slot in a queue's active pool.
///
/// The record references its originating position by id only; the position
/// references the session by id only. No back-pointers.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub id: String,
    pub queue_id: String,
    pub position_id: String,
    pub issued_at_s: u64,
    pub expires_at_s: u64,
    pub last_activity_s: u64,
    pub view_count: u64,
    pub status: SessionStatus,
    /// The admitted credential, minted at admission and held here until the
    /// client's next poll picks it up.
    pub token: String,
}

impl ActiveSession {
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("queue_id", self.queue_id.clone()),
            ("position_id", self.position_id.clone()),
            ("issued_at_s", self.issued_at_s.to_string()),
            ("expires_at_s", self.expires_at_s.to_string()),
            ("last_activity_s", self.last_activity_s.to_string()),
            ("view_count", self.view_count.to_string()),
            ("status", self.status.as_str().to_string()),
            ("token", self.token.clone()),
        ]
    }

    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        Some(ActiveSession {
            id: id.to_string(),
            queue_id: fields.get("queue_id")?.clone(),
            position_id: fields.get("position_id")?.clone(),
            issued_at_s: fields.get("issued_at_s")?.parse().ok()?,
            expires_at_s: fields.get("expires_at_s")?.parse().ok()?,
            last_activity_s: fields.get("last_activity_s")?.parse().ok()?,
            view_count: fields.get("view_count")?.parse().ok()?,
            status: SessionStatus::parse(fields.get("status")?)?,
            token: fields.get("token")?.clone(),
        })
    }
}
