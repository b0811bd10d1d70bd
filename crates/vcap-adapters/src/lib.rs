//! Source adapters for VCAP: the video platform's Data API and the
//! subtitle download tool, plus WebVTT cue parsing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;
use vcap_core::{IntervalWindow, VideoId};
use vcap_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vcap-adapters";

/// The Data API caps `id`-filtered listing requests at this many ids.
pub const MAX_IDS_PER_REQUEST: usize = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("malformed api response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(err) => err.is_transient(),
            ApiError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("caption tool failed for {id}: {detail}")]
    Tool { id: String, detail: String },
    #[error("caption workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

/// Finds ids of videos published inside a time window.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search_window(&self, window: &IntervalWindow) -> Result<Vec<VideoId>, ApiError>;
}

/// Fetches full detail records for known video ids.
#[async_trait]
pub trait VideoApi: Send + Sync {
    async fn list_videos(&self, ids: &[VideoId]) -> Result<Vec<DetailRecord>, ApiError>;
}

/// Fetches the raw subtitle track for one video, if the video has one.
#[async_trait]
pub trait CaptionSource: Send + Sync {
    async fn fetch_captions(&self, id: &VideoId) -> Result<Option<String>, CaptionError>;
}

/// Geographic and language filters applied to every search request.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub location: Option<String>,
    pub location_radius: Option<String>,
    pub relevance_language: String,
    pub region_code: String,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            location: Some("-23.533773, -46.625290".to_string()),
            location_radius: Some("1000km".to_string()),
            relevance_language: "pt".to_string(),
            region_code: "BR".to_string(),
        }
    }
}

/// One video as the Data API reports it: nested metadata sections keyed
/// by field name, values kept as raw JSON until projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub snippet: BTreeMap<String, serde_json::Value>,
    #[serde(default, rename = "contentDetails")]
    pub content_details: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub statistics: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    id: SearchItemId,
}

#[derive(Debug, Default, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    items: Vec<DetailRecord>,
}

/// Client for the platform's Data API v3.
///
/// The API key travels as a query parameter, so request URLs must never
/// reach logs; errors carry an endpoint label instead.
#[derive(Debug)]
pub struct DataApiClient {
    http: Arc<HttpFetcher>,
    base_url: Url,
    api_key: String,
    filters: SearchFilters,
}

impl DataApiClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: &str,
        api_key: impl Into<String>,
        filters: SearchFilters,
    ) -> anyhow::Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|err| anyhow::anyhow!("invalid api base url: {err}"))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
            filters,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        self.base_url
            .join(path)
            .expect("relative endpoint joins onto base url")
    }
}

#[async_trait]
impl SearchApi for DataApiClient {
    async fn search_window(&self, window: &IntervalWindow) -> Result<Vec<VideoId>, ApiError> {
        let mut url = self.endpoint("search");
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("key", &self.api_key)
                .append_pair("part", "snippet")
                .append_pair("type", "video")
                .append_pair("maxResults", &MAX_IDS_PER_REQUEST.to_string())
                .append_pair("order", "date");
            if let Some(location) = &self.filters.location {
                pairs.append_pair("location", location);
            }
            if let Some(radius) = &self.filters.location_radius {
                pairs.append_pair("locationRadius", radius);
            }
            pairs
                .append_pair(
                    "publishedAfter",
                    &window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair(
                    "publishedBefore",
                    &window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair("safeSearch", "none")
                .append_pair("videoCaption", "closedCaption")
                .append_pair("relevanceLanguage", &self.filters.relevance_language)
                .append_pair("regionCode", &self.filters.region_code);
        }

        let response = self.http.fetch_bytes("search", url).await?;
        let parsed: SearchResponse = serde_json::from_slice(&response.body)
            .map_err(|err| ApiError::Malformed(format!("search response: {err}")))?;

        let mut ids = Vec::with_capacity(parsed.items.len());
        for item in parsed.items {
            let id = item
                .id
                .video_id
                .ok_or_else(|| ApiError::Malformed("search item without videoId".to_string()))?;
            ids.push(VideoId::new(id));
        }
        Ok(ids)
    }
}

#[async_trait]
impl VideoApi for DataApiClient {
    async fn list_videos(&self, ids: &[VideoId]) -> Result<Vec<DetailRecord>, ApiError> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_REQUEST) {
            let joined = chunk
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(",");

            let mut url = self.endpoint("videos");
            url.query_pairs_mut()
                .append_pair("key", &self.api_key)
                .append_pair("part", "snippet,contentDetails,statistics")
                .append_pair("id", &joined);

            let response = self.http.fetch_bytes("videos", url).await?;
            let parsed: VideosResponse = serde_json::from_slice(&response.body)
                .map_err(|err| ApiError::Malformed(format!("videos response: {err}")))?;
            records.extend(parsed.items);
        }
        Ok(records)
    }
}

/// Caption fetcher shelling out to yt-dlp with subtitles-only flags.
///
/// Each fetch runs in its own temp directory; the tool names the track
/// file `<video id>.<lang>.<ext>`, so any file with the id prefix is the
/// downloaded track.
#[derive(Debug, Clone)]
pub struct YtDlpCaptionSource {
    binary: PathBuf,
    language: String,
}

impl YtDlpCaptionSource {
    pub fn new(binary: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }
}

fn watch_url(id: &VideoId) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

async fn find_track(dir: &Path, id: &VideoId) -> Result<Option<String>, CaptionError> {
    let prefix = format!("{id}.");
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) {
            let raw = fs::read_to_string(entry.path()).await?;
            return Ok(Some(raw));
        }
    }
    Ok(None)
}

#[async_trait]
impl CaptionSource for YtDlpCaptionSource {
    async fn fetch_captions(&self, id: &VideoId) -> Result<Option<String>, CaptionError> {
        let workdir = tempfile::tempdir()?;
        let template = workdir.path().join("%(id)s.%(ext)s");

        let output = Command::new(&self.binary)
            .arg("--skip-download")
            .arg("--write-subs")
            .arg("--sub-langs")
            .arg(&self.language)
            .arg("--output")
            .arg(&template)
            .arg(watch_url(id))
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CaptionError::Tool {
                id: id.to_string(),
                detail,
            });
        }

        let track = find_track(workdir.path(), id).await?;
        if track.is_none() {
            debug!(video_id = %id, "caption tool produced no track");
        }
        Ok(track)
    }
}

pub mod vtt {
    //! WebVTT parsing tuned to auto-generated subtitle tracks: inline
    //! timing tags, entities, and header blocks all normalized away.

    use thiserror::Error;
    use vcap_core::CuePoint;

    #[derive(Debug, Error, PartialEq)]
    pub enum VttError {
        #[error("invalid cue timing line: {0}")]
        InvalidTiming(String),
        #[error("invalid timestamp: {0}")]
        InvalidTimestamp(String),
    }

    /// Parses a raw track into cue points with second-precision floats.
    ///
    /// Cues whose text is empty after normalization are dropped, so a
    /// track of pure formatting noise parses to an empty list.
    pub fn parse_cues(raw: &str) -> Result<Vec<CuePoint>, VttError> {
        let mut cues = Vec::new();
        let mut lines = raw.lines().peekable();

        while let Some(line) = lines.next() {
            let line = line.trim_start_matches('\u{feff}').trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("WEBVTT")
                || line.starts_with("NOTE")
                || line.starts_with("STYLE")
                || line.starts_with("REGION")
            {
                skip_block(&mut lines);
                continue;
            }
            if !line.contains("-->") {
                // cue identifier line
                continue;
            }

            let (start, end) = parse_timing(line)?;
            let mut text_lines = Vec::new();
            while let Some(next) = lines.peek() {
                if next.trim().is_empty() {
                    break;
                }
                text_lines.push(lines.next().expect("peeked line exists"));
            }

            let text = normalize_cue_text(&text_lines.join(" "));
            if !text.is_empty() {
                cues.push(CuePoint { start, end, text });
            }
        }

        Ok(cues)
    }

    fn skip_block<'a, I: Iterator<Item = &'a str>>(lines: &mut std::iter::Peekable<I>) {
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                return;
            }
        }
    }

    fn parse_timing(line: &str) -> Result<(f64, f64), VttError> {
        let (start_part, rest) = line
            .split_once("-->")
            .ok_or_else(|| VttError::InvalidTiming(line.to_string()))?;
        // settings after the end timestamp are ignored
        let end_part = rest
            .split_whitespace()
            .next()
            .ok_or_else(|| VttError::InvalidTiming(line.to_string()))?;
        let start = parse_timestamp(start_part.trim())?;
        let end = parse_timestamp(end_part)?;
        Ok((start, end))
    }

    /// Parses `HH:MM:SS.mmm` or `MM:SS.mmm` into fractional seconds.
    pub fn parse_timestamp(raw: &str) -> Result<f64, VttError> {
        let parts: Vec<&str> = raw.split(':').collect();
        let (hours, minutes_str, seconds_str) = match parts.as_slice() {
            [minutes, seconds] => (0u64, *minutes, *seconds),
            [hours, minutes, seconds] => {
                let hours = hours
                    .parse::<u64>()
                    .map_err(|_| VttError::InvalidTimestamp(raw.to_string()))?;
                (hours, *minutes, *seconds)
            }
            _ => return Err(VttError::InvalidTimestamp(raw.to_string())),
        };

        let minutes = minutes_str
            .parse::<u64>()
            .map_err(|_| VttError::InvalidTimestamp(raw.to_string()))?;
        if minutes >= 60 {
            return Err(VttError::InvalidTimestamp(raw.to_string()));
        }

        if seconds_str.is_empty()
            || !seconds_str.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(VttError::InvalidTimestamp(raw.to_string()));
        }
        let seconds = seconds_str
            .parse::<f64>()
            .map_err(|_| VttError::InvalidTimestamp(raw.to_string()))?;
        if !(0.0..60.0).contains(&seconds) {
            return Err(VttError::InvalidTimestamp(raw.to_string()));
        }

        // Hours are unbounded untrusted input; the arithmetic must not wrap.
        let whole = hours
            .checked_mul(3600)
            .and_then(|h| h.checked_add(minutes * 60))
            .ok_or_else(|| VttError::InvalidTimestamp(raw.to_string()))?;
        Ok(whole as f64 + seconds)
    }

    /// Strips inline tags, decodes character entities, and collapses
    /// whitespace runs to single spaces.
    pub fn normalize_cue_text(text: &str) -> String {
        let stripped = strip_tags(text);
        let decoded = decode_entities(&stripped);
        decoded.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    // Inline timing tags split words mid-way ("Hel<00:00:01.500>lo"),
    // so tags are removed without leaving a space behind.
    fn strip_tags(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut in_tag = false;
        for ch in text.chars() {
            match ch {
                '<' => in_tag = true,
                '>' if in_tag => in_tag = false,
                _ if in_tag => {}
                _ => out.push(ch),
            }
        }
        out
    }

    fn decode_entities(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(amp) = rest.find('&') {
            out.push_str(&rest[..amp]);
            let tail = &rest[amp..];
            match tail[1..].find(';') {
                Some(semi_offset) if semi_offset <= 8 => {
                    let name = &tail[1..1 + semi_offset];
                    match decode_entity(name) {
                        Some(decoded) => {
                            out.push(decoded);
                            rest = &tail[semi_offset + 2..];
                        }
                        None => {
                            out.push('&');
                            rest = &tail[1..];
                        }
                    }
                }
                _ => {
                    out.push('&');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn decode_entity(name: &str) -> Option<char> {
        match name {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => {
                let code = name.strip_prefix('#')?;
                let value = if let Some(hex) =
                    code.strip_prefix('x').or_else(|| code.strip_prefix('X'))
                {
                    u32::from_str_radix(hex, 16).ok()?
                } else {
                    code.parse::<u32>().ok()?
                };
                char::from_u32(value)
            }
        }
    }

}
