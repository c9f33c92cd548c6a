//! Feedback events published by the fleet health monitor.
//!
//! ```json
//! {"droplet": "3f2a…", "op": "START", "version": "9c1e…",
//!  "last_updated": "2026-01-05T10:00:00Z", "indices": [1, 2], "flapping": true}
//! ```
//!
//! STOP carries the instance indices under `instances` instead of `indices`.
//! `last_updated` may be `null` or absent when the monitor does not know it.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackOp {
    /// Instances are missing and should be started.
    Start,
    /// Extra instances are running and should be stopped.
    Stop,
    /// The workload should be shut down entirely.
    Spindown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    #[serde(rename = "droplet", deserialize_with = "non_blank")]
    pub subject_id: String,
    pub op: FeedbackOp,
    /// Version of the record the monitor based its decision on.
    #[serde(rename = "version", default)]
    pub reported_version: Option<String>,
    #[serde(rename = "last_updated", default)]
    pub reported_last_updated: Option<DateTime<Utc>>,
    /// START: indices to start.
    #[serde(default)]
    pub indices: Vec<u32>,
    /// STOP: indices to stop.
    #[serde(default)]
    pub instances: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flapping: Option<bool>,
}

impl FeedbackEvent {
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// A blank droplet names no workload; treating it as one would stop "".
fn non_blank<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let id = String::deserialize(deserializer)?;
    if id.trim().is_empty() {
        return Err(D::Error::custom("droplet must not be blank"));
    }
    Ok(id)
}
