use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Administrative state of a queue.
///
/// Anything but `Active` refuses new entrants; `Paused` and `Maintenance`
/// also stop the admission loop, but waiting positions keep heartbeating and
/// do not expire any faster than normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Active,
    Paused,
    Maintenance,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Active => "active",
            QueueState::Paused => "paused",
            QueueState::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(QueueState::Active),
            "paused" => Some(QueueState::Paused),
            "maintenance" => Some(QueueState::Maintenance),
            _ => None,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue configuration, stored as a hash in the store and cached
/// read-through by [`crate::catalog::QueueCatalog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    /// Where admitted clients are redirected.
    pub target_url: String,
    /// Admitted-pool capacity; also the admission bucket capacity.
    pub max_active: u64,
    /// Queued cap. 0 = unbounded.
    pub max_size: u64,
    /// Steady-state admissions per second. May be fractional; <= 0 parks the
    /// admission loop entirely.
    pub admission_rate: f64,
    pub heartbeat_interval_s: u64,
    pub heartbeat_timeout_s: u64,
    /// Retention of terminal position metadata, for observability.
    pub grace_period_s: u64,
    /// Lifetime of an admitted session.
    pub session_ttl_s: u64,
    pub status: QueueState,
}

impl QueueDescriptor {
    pub const DEFAULT_MAX_ACTIVE: u64 = 100;
    pub const DEFAULT_ADMISSION_RATE: f64 = 1.0;
    pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 10;
    pub const DEFAULT_HEARTBEAT_TIMEOUT_S: u64 = 60;
    pub const DEFAULT_GRACE_PERIOD_S: u64 = 30;
    pub const DEFAULT_SESSION_TTL_S: u64 = 3_600;

    pub fn new(name: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_url: target_url.into(),
            max_active: Self::DEFAULT_MAX_ACTIVE,
            max_size: 0,
            admission_rate: Self::DEFAULT_ADMISSION_RATE,
            heartbeat_interval_s: Self::DEFAULT_HEARTBEAT_INTERVAL_S,
            heartbeat_timeout_s: Self::DEFAULT_HEARTBEAT_TIMEOUT_S,
            grace_period_s: Self::DEFAULT_GRACE_PERIOD_S,
            session_ttl_s: Self::DEFAULT_SESSION_TTL_S,
            status: QueueState::Active,
        }
    }

    /// Lifetime of waiting-position metadata: a position that stops
    /// heartbeating is reaped after the timeout and its metadata lingers for
    /// the grace window beyond that.
    pub fn position_ttl_s(&self) -> u64 {
        self.heartbeat_timeout_s + self.grace_period_s
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("target_url", self.target_url.clone()),
            ("max_active", self.max_active.to_string()),
            ("max_size", self.max_size.to_string()),
            ("admission_rate", self.admission_rate.to_string()),
            (
                "heartbeat_interval_s",
                self.heartbeat_interval_s.to_string(),
            ),
            ("heartbeat_timeout_s", self.heartbeat_timeout_s.to_string()),
            ("grace_period_s", self.grace_period_s.to_string()),
            ("session_ttl_s", self.session_ttl_s.to_string()),
            ("status", self.status.as_str().to_string()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(QueueDescriptor {
            name: fields.get("name")?.clone(),
            target_url: fields.get("target_url")?.clone(),
            max_active: fields.get("max_active")?.parse().ok()?,
            max_size: fields.get("max_size")?.parse().ok()?,
            admission_rate: fields.get("admission_rate")?.parse().ok()?,
            heartbeat_interval_s: fields.get("heartbeat_interval_s")?.parse().ok()?,
            heartbeat_timeout_s: fields.get("heartbeat_timeout_s")?.parse().ok()?,
            grace_period_s: fields.get("grace_period_s")?.parse().ok()?,
            session_ttl_s: fields.get("session_ttl_s")?.parse().ok()?,
            status: QueueState::parse(fields.get("status")?)?,
        })
    }
}

/// Partial update applied by the admin surface. Absent fields are left
/// untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueuePatch {
    pub target_url: Option<String>,
    pub max_active: Option<u64>,
    pub max_size: Option<u64>,
    pub admission_rate: Option<f64>,
    pub heartbeat_interval_s: Option<u64>,
    pub heartbeat_timeout_s: Option<u64>,
    pub grace_period_s: Option<u64>,
    pub session_ttl_s: Option<u64>,
    pub status: Option<QueueState>,
}

impl QueuePatch {
    pub fn apply(&self, desc: &mut QueueDescriptor) {
        if let Some(ref url) = self.target_url {
            desc.target_url = url.clone();
        }
        if let Some(v) = self.max_active {
            desc.max_active = v;
        }
        if let Some(v) = self.max_size {
            desc.max_size = v;
        }
        if let Some(v) = self.admission_rate {
            desc.admission_rate = v;
        }
        if let Some(v) = self.heartbeat_interval_s {
            desc.heartbeat_interval_s = v;
        }
        if let Some(v) = self.heartbeat_timeout_s {
            desc.heartbeat_timeout_s = v;
        }
        if let Some(v) = self.grace_period_s {
            desc.grace_period_s = v;
        }
        if let Some(v) = self.session_ttl_s {
            desc.session_ttl_s = v;
        }
        if let Some(v) = self.status {
            desc.status = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_descriptor_values() {
        let desc = QueueDescriptor::new("launch", "https://shop.example/checkout");
        assert_eq!(desc.max_active, 100);
        assert_eq!(desc.max_size, 0);
        assert_eq!(desc.admission_rate, 1.0);
        assert_eq!(desc.heartbeat_interval_s, 10);
        assert_eq!(desc.heartbeat_timeout_s, 60);
        assert_eq!(desc.grace_period_s, 30);
        assert_eq!(desc.session_ttl_s, 3_600);
        assert_eq!(desc.status, QueueState::Active);
        assert_eq!(desc.position_ttl_s(), 90);
    }

    #[test]
    fn field_roundtrip_preserves_descriptor() {
        let mut desc = QueueDescriptor::new("launch", "https://shop.example");
        desc.admission_rate = 0.5;
        desc.max_size = 5_000;
        desc.status = QueueState::Paused;

        let map: HashMap<String, String> = desc
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(QueueDescriptor::from_fields(&map), Some(desc));
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut desc = QueueDescriptor::new("launch", "https://shop.example");
        let patch = QueuePatch {
            admission_rate: Some(2.5),
            status: Some(QueueState::Maintenance),
            ..Default::default()
        };
        patch.apply(&mut desc);

        assert_eq!(desc.admission_rate, 2.5);
        assert_eq!(desc.status, QueueState::Maintenance);
        assert_eq!(desc.max_active, QueueDescriptor::DEFAULT_MAX_ACTIVE);
        assert_eq!(desc.target_url, "https://shop.example");
    }
}
