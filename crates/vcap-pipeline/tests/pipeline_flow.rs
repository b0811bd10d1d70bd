use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::tempdir;
use vcap_adapters::{
    ApiError, CaptionError, CaptionSource, DetailRecord, SearchApi, SearchFilters, VideoApi,
};
use vcap_core::{keys, CaptionedVideo, IntervalWindow, VideoId};
use vcap_pipeline::{build_scheduler, Pipeline, PipelineConfig, PolitenessPolicy, Stage};
use vcap_storage::{BlobStore, ContentStore, FetchError, UpsertSummary};

struct FakeSearch {
    ids: Vec<VideoId>,
    failures: AtomicUsize,
}

impl FakeSearch {
    fn new(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|id| VideoId::new(*id)).collect(),
            failures: AtomicUsize::new(0),
        }
    }

    fn with_failures(self, failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..self
        }
    }
}

#[async_trait]
impl SearchApi for FakeSearch {
    async fn search_window(&self, _window: &IntervalWindow) -> Result<Vec<VideoId>, ApiError> {
        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ApiError::Transport(FetchError::HttpStatus {
                status: 503,
                endpoint: "search".to_string(),
            }));
        }
        Ok(self.ids.clone())
    }
}

struct FakeVideos {
    records: Mutex<HashMap<String, DetailRecord>>,
}

impl FakeVideos {
    fn with(ids: &[&str]) -> Self {
        let records = ids
            .iter()
            .map(|id| ((*id).to_string(), detail(id, &format!("Título {id}"))))
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    fn set_title(&self, id: &str, title: &str) {
        self.records
            .lock()
            .expect("videos lock")
            .get_mut(id)
            .expect("record exists")
            .snippet
            .insert("title".to_string(), json!(title));
    }

    fn remove_title(&self, id: &str) {
        self.records
            .lock()
            .expect("videos lock")
            .get_mut(id)
            .expect("record exists")
            .snippet
            .remove("title");
    }
}

#[async_trait]
impl VideoApi for FakeVideos {
    async fn list_videos(&self, ids: &[VideoId]) -> Result<Vec<DetailRecord>, ApiError> {
        let records = self.records.lock().expect("videos lock");
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id.as_str()).cloned())
            .collect())
    }
}

struct FakeCaptions {
    tracks: HashMap<String, String>,
    broken: HashSet<String>,
}

impl FakeCaptions {
    fn with(tracks: &[(&str, String)]) -> Self {
        Self {
            tracks: tracks
                .iter()
                .map(|(id, track)| ((*id).to_string(), track.clone()))
                .collect(),
            broken: HashSet::new(),
        }
    }

    fn failing(mut self, ids: &[&str]) -> Self {
        self.broken = ids.iter().map(|id| (*id).to_string()).collect();
        self
    }
}

#[async_trait]
impl CaptionSource for FakeCaptions {
    async fn fetch_captions(&self, id: &VideoId) -> Result<Option<String>, CaptionError> {
        if self.broken.contains(id.as_str()) {
            return Err(CaptionError::Tool {
                id: id.to_string(),
                detail: "simulated tool failure".to_string(),
            });
        }
        Ok(self.tracks.get(id.as_str()).cloned())
    }
}

#[derive(Default)]
struct MemoryContent {
    rows: Mutex<BTreeMap<(String, String), serde_json::Value>>,
}

impl MemoryContent {
    fn rows(&self) -> BTreeMap<(String, String), serde_json::Value> {
        self.rows.lock().expect("content lock").clone()
    }
}

#[async_trait]
impl ContentStore for MemoryContent {
    async fn upsert_many(&self, items: &[CaptionedVideo]) -> anyhow::Result<UpsertSummary> {
        let mut rows = self.rows.lock().expect("content lock");
        let mut summary = UpsertSummary {
            attempted: items.len(),
            written: 0,
        };
        for item in items {
            let key = (item.source.clone(), item.record.id.as_str().to_string());
            let document = serde_json::to_value(item)?;
            if rows.get(&key) != Some(&document) {
                rows.insert(key, document);
                summary.written += 1;
            }
        }
        Ok(summary)
    }
}

fn detail(id: &str, title: &str) -> DetailRecord {
    let mut record = DetailRecord {
        id: id.to_string(),
        ..DetailRecord::default()
    };
    record.snippet.insert("title".to_string(), json!(title));
    record
        .snippet
        .insert("channelTitle".to_string(), json!("Canal SP"));
    record
        .statistics
        .insert("viewCount".to_string(), json!("10"));
    record
}

fn vtt_track(text: &str) -> String {
    format!("WEBVTT\n\n00:00:00.000 --> 00:00:02.000\n{text}\n")
}

fn test_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        database_url: "postgres://unused".to_string(),
        data_root: root.to_path_buf(),
        api_base_url: "http://127.0.0.1:9/".to_string(),
        api_key: "unused".to_string(),
        window_hours: 4,
        search_filters: SearchFilters::default(),
        ytdlp_bin: PathBuf::from("yt-dlp"),
        subtitle_lang: "pt".to_string(),
        caption_concurrency: 2,
        caption_timeout: Duration::from_secs(5),
        politeness: PolitenessPolicy {
            min_secs: 0,
            max_secs: 0,
        },
        stage_attempts: 3,
        stage_retry_delay: Duration::ZERO,
        http_timeout_secs: 5,
        schedule_cron: "0 0 */4 * * *".to_string(),
    }
}

fn window_0800_1200() -> IntervalWindow {
    IntervalWindow::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
            .single()
            .expect("valid timestamp"),
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp"),
    )
}

struct Harness {
    pipeline: Pipeline,
    blobs: BlobStore,
    videos: Arc<FakeVideos>,
    content: Arc<MemoryContent>,
}

fn harness(root: &Path, search: FakeSearch, videos: FakeVideos, captions: FakeCaptions) -> Harness {
    let blobs = BlobStore::new(root);
    let videos = Arc::new(videos);
    let content = Arc::new(MemoryContent::default());
    let pipeline = Pipeline::with_collaborators(
        test_config(root),
        blobs.clone(),
        Arc::new(search),
        videos.clone(),
        Arc::new(captions),
        content.clone(),
    );
    Harness {
        pipeline,
        blobs,
        videos,
        content,
    }
}

#[tokio::test]
async fn full_interval_flow_lands_captioned_documents() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["v1", "v2"]),
        FakeVideos::with(&["v1", "v2"]),
        FakeCaptions::with(&[("v1", vtt_track("olá mundo"))]),
    );

    let summary = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("run");

    assert_eq!(summary.discovered, 2);
    assert_eq!(summary.enriched, 2);
    assert_eq!(summary.captions_found, 1);
    assert_eq!(summary.captions_missing, 1);
    assert_eq!(summary.captions_failed, 0);
    assert_eq!(summary.joined, 1);
    assert_eq!(summary.join_anomalies, 0);
    assert_eq!(summary.upsert_attempted, 1);
    assert_eq!(summary.upsert_written, 1);

    let rows = h.content.rows();
    assert_eq!(rows.len(), 1);
    let doc = rows
        .get(&("youtube".to_string(), "v1".to_string()))
        .expect("v1 stored");
    assert_eq!(doc["id"], json!("v1"));
    assert_eq!(doc["title"], json!("Título v1"));
    assert_eq!(doc["source"], json!("youtube"));
    assert_eq!(doc["details"]["channelTitle"], json!("Canal SP"));
    assert_eq!(doc["statistics"]["viewCount"], json!(10));
    assert_eq!(doc["captions"][0]["text"], json!("olá mundo"));
    assert_eq!(doc["captions"][0]["start"], json!(0.0));
}

#[tokio::test]
async fn join_matches_by_id_and_counts_unmatched_captions() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["a", "b", "c"]),
        FakeVideos::with(&["a", "b", "c"]),
        FakeCaptions::with(&[("b", vtt_track("fala b")), ("c", vtt_track("fala c"))]),
    );

    // leftover caption blob from an earlier run of the same interval whose
    // video no longer appears in search results
    let stale_key = keys::caption(&window_0800_1200().key(), &VideoId::new("d"));
    h.blobs
        .put(&stale_key, br#"[{"start":0.0,"end":1.0,"text":"stale"}]"#)
        .await
        .expect("seed stale caption");

    let summary = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("run");

    assert_eq!(summary.joined, 2);
    assert_eq!(summary.join_anomalies, 1);

    let rows = h.content.rows();
    assert!(rows.contains_key(&("youtube".to_string(), "b".to_string())));
    assert!(rows.contains_key(&("youtube".to_string(), "c".to_string())));
    assert!(!rows.contains_key(&("youtube".to_string(), "a".to_string())));
    assert!(!rows.contains_key(&("youtube".to_string(), "d".to_string())));
}

#[tokio::test]
async fn one_broken_caption_fetch_does_not_fail_the_interval() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["x", "y", "z"]),
        FakeVideos::with(&["x", "y", "z"]),
        FakeCaptions::with(&[("y", vtt_track("y fala")), ("z", vtt_track("z fala"))])
            .failing(&["x"]),
    );

    let summary = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("run");

    assert_eq!(summary.captions_failed, 1);
    assert_eq!(summary.captions_found, 2);
    assert_eq!(summary.joined, 2);
    assert_eq!(summary.upsert_written, 2);
}

#[tokio::test]
async fn rerunning_an_interval_rewrites_nothing_when_unchanged() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["v1", "v2"]),
        FakeVideos::with(&["v1", "v2"]),
        FakeCaptions::with(&[
            ("v1", vtt_track("primeira")),
            ("v2", vtt_track("segunda")),
        ]),
    );

    let first = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("first run");
    assert_eq!(first.upsert_written, 2);

    let second = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("second run");
    assert_eq!(second.upsert_attempted, 2);
    assert_eq!(second.upsert_written, 0);
    assert_eq!(h.content.rows().len(), 2);
}

#[tokio::test]
async fn rerun_replaces_documents_whose_upstream_content_changed() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["v1", "v2"]),
        FakeVideos::with(&["v1", "v2"]),
        FakeCaptions::with(&[
            ("v1", vtt_track("primeira")),
            ("v2", vtt_track("segunda")),
        ]),
    );

    let first = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("first run");
    assert_eq!(first.upsert_written, 2);

    h.videos.set_title("v1", "Título v1 (editado)");

    let second = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("second run");
    assert_eq!(second.upsert_attempted, 2);
    assert_eq!(second.upsert_written, 1);

    let rows = h.content.rows();
    let edited = rows
        .get(&("youtube".to_string(), "v1".to_string()))
        .expect("v1 stored");
    assert_eq!(edited["title"], json!("Título v1 (editado)"));
    let untouched = rows
        .get(&("youtube".to_string(), "v2".to_string()))
        .expect("v2 stored");
    assert_eq!(untouched["title"], json!("Título v2"));
}

#[tokio::test]
async fn empty_window_completes_without_downstream_writes() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&[]),
        FakeVideos::with(&[]),
        FakeCaptions::with(&[]),
    );

    let summary = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("run");

    assert_eq!(summary.discovered, 0);
    assert_eq!(summary.enriched, 0);
    assert_eq!(summary.joined, 0);
    assert_eq!(summary.upsert_attempted, 0);
    assert!(h.content.rows().is_empty());

    let interval = window_0800_1200().key();
    let id_list = h
        .blobs
        .get(&keys::id_list(&interval))
        .await
        .expect("get")
        .expect("id list written");
    assert_eq!(id_list, b"[]");
    assert!(h
        .blobs
        .get(&keys::captioned_list(&interval))
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn transient_search_failures_are_retried_within_budget() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["v1"]).with_failures(2),
        FakeVideos::with(&["v1"]),
        FakeCaptions::with(&[]),
    );

    let summary = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("succeeds on third attempt");
    assert_eq!(summary.discovered, 1);
}

#[tokio::test]
async fn persistent_transient_failures_exhaust_the_attempt_budget() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["v1"]).with_failures(10),
        FakeVideos::with(&["v1"]),
        FakeCaptions::with(&[]),
    );

    let err = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect_err("attempts exhausted");
    assert_eq!(err.stage, Stage::Discovery);
    assert_eq!(err.attempts, 3);
}

#[tokio::test]
async fn detail_without_title_fails_enrichment_immediately() {
    let dir = tempdir().expect("tempdir");
    let videos = FakeVideos::with(&["v1"]);
    videos.remove_title("v1");

    let h = harness(
        dir.path(),
        FakeSearch::new(&["v1"]),
        videos,
        FakeCaptions::with(&[]),
    );

    let err = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect_err("enrichment fails");
    assert_eq!(err.stage, Stage::Enrichment);
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn scheduler_accepts_the_recurring_interval_job() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&[]),
        FakeVideos::with(&[]),
        FakeCaptions::with(&[]),
    );

    let _scheduler = build_scheduler(Arc::new(h.pipeline))
        .await
        .expect("scheduler built with the configured cron");
}

#[tokio::test]
async fn duplicate_search_results_are_deduplicated_in_order() {
    let dir = tempdir().expect("tempdir");
    let h = harness(
        dir.path(),
        FakeSearch::new(&["v2", "v1", "v2", "v1"]),
        FakeVideos::with(&["v1", "v2"]),
        FakeCaptions::with(&[]),
    );

    let summary = h
        .pipeline
        .run_interval(&window_0800_1200())
        .await
        .expect("run");
    assert_eq!(summary.discovered, 2);

    let bytes = h
        .blobs
        .get(&keys::id_list(&window_0800_1200().key()))
        .await
        .expect("get")
        .expect("id list written");
    let ids: Vec<VideoId> = serde_json::from_slice(&bytes).expect("decode id list");
    assert_eq!(ids, vec![VideoId::new("v2"), VideoId::new("v1")]);
}
