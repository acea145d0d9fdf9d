//! The persisted key-value snapshot.
//!
//! A [`Snapshot`] is a flat JSON object. It is used both for the full state
//! document and for partial updates handed to
//! [`StateStore::merge`](crate::store::StateStore::merge): a patch is just a
//! snapshot holding only the keys to overwrite.
//!
//! Timestamps are written as integer epoch milliseconds. Readers also accept
//! RFC 3339 strings left behind by older builds.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names in the persisted document.
pub mod fields {
    pub const IDENTITY: &str = "identity";
    pub const LAST_HEARTBEAT_AT: &str = "lastHeartbeatAt";
    pub const LAST_PING_AT: &str = "lastPingAt";
    pub const POINTS_TOTAL: &str = "pointsTotal";
    pub const POINTS_TODAY: &str = "pointsToday";
    pub const POTENTIAL_POINTS: &str = "potentialPoints";
    pub const COUNTDOWN: &str = "countdown";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(Map<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, for assembling patches.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder-style insert of a timestamp in the canonical encoding.
    #[must_use]
    pub fn with_timestamp(self, key: &str, at: DateTime<Utc>) -> Self {
        self.with(key, at.timestamp_millis())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shallow merge-patch: every key in `patch` overwrites the same key
    /// here; keys absent from `patch` are left untouched.
    pub fn apply(&mut self, patch: &Snapshot) {
        for (key, value) in &patch.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn identity(&self) -> Option<&str> {
        self.get(fields::IDENTITY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|identity| !identity.is_empty())
    }

    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(fields::LAST_HEARTBEAT_AT)
    }

    pub fn last_ping_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(fields::LAST_PING_AT)
    }

    pub fn points_total(&self) -> Option<i64> {
        self.get(fields::POINTS_TOTAL).and_then(Value::as_i64)
    }

    pub fn points_today(&self) -> Option<i64> {
        self.get(fields::POINTS_TODAY).and_then(Value::as_i64)
    }

    pub fn potential_points(&self) -> Option<f64> {
        self.get(fields::POTENTIAL_POINTS).and_then(Value::as_f64)
    }

    pub fn countdown(&self) -> Option<&str> {
        self.get(fields::COUNTDOWN).and_then(Value::as_str)
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.get(key)? {
            Value::Number(number) => number
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for Snapshot {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
