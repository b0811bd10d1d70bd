//! Core domain model and interval partitioning for VCAP.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vcap-core";

/// Source label stamped on every persisted composite document.
pub const SOURCE: &str = "youtube";

/// Upstream platform identifier for a single video, stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition key naming one interval's intermediate artifacts.
///
/// Derived from the window end, compact enough for blob names, and ordered
/// so that lexicographic comparison equals chronological comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntervalKey(String);

impl IntervalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IntervalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open UTC window `[start, end)` addressed by one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl IntervalWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of `hours` length whose end is `end` truncated to the hour.
    ///
    /// Scheduled and backfilled runs both align this way, so equal instants
    /// always address the same partition.
    pub fn ending_at(end: DateTime<Utc>, hours: u32) -> Self {
        let end = truncate_to_hour(end);
        Self {
            start: end - Duration::hours(i64::from(hours.max(1))),
            end,
        }
    }

    pub fn key(&self) -> IntervalKey {
        IntervalKey(self.end.format("%Y%m%dT%H%M%S").to_string())
    }
}

/// Consecutive aligned windows of `hours` length covering `[from, to]`,
/// oldest first.
pub fn windows_between(from: DateTime<Utc>, to: DateTime<Utc>, hours: u32) -> Vec<IntervalWindow> {
    let step = Duration::hours(i64::from(hours.max(1)));
    let last = truncate_to_hour(to);
    let mut end = truncate_to_hour(from) + step;
    let mut windows = Vec::new();
    while end <= last {
        windows.push(IntervalWindow {
            start: end - step,
            end,
        });
        end += step;
    }
    windows
}

fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroed minute/second/nanosecond are always valid")
}

/// One enriched video: identity, title, and the projected metadata maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: VideoId,
    pub title: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub statistics: BTreeMap<String, u64>,
}

/// One normalized timed-text span within a caption track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuePoint {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Composite document persisted to the destination store, keyed by
/// `(source, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionedVideo {
    #[serde(flatten)]
    pub record: VideoRecord,
    pub source: String,
    pub captions: Vec<CuePoint>,
}

impl CaptionedVideo {
    pub fn new(record: VideoRecord, captions: Vec<CuePoint>) -> Self {
        Self {
            record,
            source: SOURCE.to_string(),
            captions,
        }
    }
}

/// Blob key builders shared by producing and consuming stages.
///
/// A stage never spells out a blob name; producer and consumer both go
/// through these so the addressing scheme has a single definition.
pub mod keys {
    use super::{IntervalKey, VideoId, SOURCE};

    pub fn id_list(interval: &IntervalKey) -> String {
        format!("{SOURCE}/id-lists/{interval}.json")
    }

    pub fn video_list(interval: &IntervalKey) -> String {
        format!("{SOURCE}/video-lists/{interval}.json")
    }

    pub fn caption_prefix(interval: &IntervalKey) -> String {
        format!("{SOURCE}/captions/{interval}/")
    }

    pub fn caption(interval: &IntervalKey, id: &VideoId) -> String {
        format!("{}{}.json", caption_prefix(interval), id)
    }

    pub fn captioned_list(interval: &IntervalKey) -> String {
        format!("{SOURCE}/captioned-lists/{interval}.json")
    }

    /// Recovers the video id encoded in a caption blob key.
    pub fn caption_video_id(key: &str) -> Option<VideoId> {
        let name = key.rsplit('/').next()?;
        let id = name.strip_suffix(".json")?;
        if id.is_empty() {
            return None;
        }
        Some(VideoId::new(id))
    }
}
