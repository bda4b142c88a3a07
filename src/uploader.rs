use crate::config::UploaderConfig;
use crate::encoder::FinishedSegment;
use crate::geometry::Rect;
use crate::recovery::{self, PendingSegment};
use crate::scanner::ScanResult;
use crate::surface::BackgroundTasks;
use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{info, warn};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Video,
    Hierarchy,
}

impl ArtifactKind {
    fn wire_name(self) -> &'static str {
        match self {
            ArtifactKind::Video => "video",
            ArtifactKind::Hierarchy => "hierarchy",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            ArtifactKind::Video => "video/mp4",
            ArtifactKind::Hierarchy => "application/gzip",
        }
    }
}

/// One frame's worth of hierarchy side-channel data; the per-segment journal
/// is an array of these, gzipped before upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyRecord {
    pub timestamp_ms: i64,
    pub layout_signature: String,
    pub text_input_rects: Vec<[f32; 4]>,
    pub blocked_rects: Vec<[f32; 4]>,
    pub occluded_rects: Vec<[f32; 4]>,
    pub scroll_active: bool,
    pub map_active: bool,
    pub animation_area_ratio: f32,
}

impl HierarchyRecord {
    pub fn from_scan(scan: &ScanResult, timestamp_ms: i64) -> Self {
        fn flatten(rects: &[Rect]) -> Vec<[f32; 4]> {
            rects.iter().map(|r| [r.x, r.y, r.w, r.h]).collect()
        }
        let mut blocked = flatten(&scan.camera_rects);
        blocked.extend(flatten(&scan.webview_rects));
        blocked.extend(flatten(&scan.video_rects));
        Self {
            timestamp_ms,
            layout_signature: format!("{:016x}", scan.layout_signature),
            text_input_rects: flatten(&scan.text_input_rects),
            blocked_rects: blocked,
            occluded_rects: flatten(&scan.occluded_rects),
            scroll_active: scan.scroll_active,
            map_active: scan.map_active,
            animation_area_ratio: scan.animation_area_ratio,
        }
    }
}

/// Ingest endpoint coordinates; all three fields are required before a
/// session may start.
#[derive(Debug, Clone)]
pub struct UploaderEndpoint {
    pub base_url: String,
    pub project_key: String,
    pub project_id: String,
}

/// Transient presign response; lives only between presign and PUT.
#[derive(Debug, Clone)]
struct PresignRecord {
    presigned_url: String,
    segment_id: String,
    #[allow(dead_code)]
    s3_key: String,
}

/// Outcome report delivered to the engine's event stream.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub kind: ArtifactKind,
    pub session_id: String,
    pub segment_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct PendingUploads {
    count: AtomicUsize,
    drained: Notify,
}

/// Moves finalised segments and hierarchy journals to object storage via the
/// presign / PUT / complete protocol, with bounded retries and background
/// task continuity. At most two uploads run concurrently.
pub struct SegmentUploader {
    client: Client,
    endpoint: UploaderEndpoint,
    upload_token: std::sync::Mutex<Option<String>>,
    config: UploaderConfig,
    slots: Arc<Semaphore>,
    pending: Arc<PendingUploads>,
    background: Arc<dyn BackgroundTasks>,
}

impl SegmentUploader {
    pub fn new(
        endpoint: UploaderEndpoint,
        config: UploaderConfig,
        background: Arc<dyn BackgroundTasks>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            upload_token: std::sync::Mutex::new(None),
            config,
            slots: Arc::new(Semaphore::new(2)),
            pending: Arc::new(PendingUploads::default()),
            background,
        })
    }

    /// Installs (or clears) the host-managed device upload token. The token
    /// is forwarded opaquely; the uploader never validates it.
    pub fn set_upload_token(&self, token: Option<String>) {
        *self.upload_token.lock().expect("upload token mutex poisoned") = token;
    }

    pub fn pending_uploads(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Blocks the termination path until in-flight uploads drain or the
    /// timeout expires. Returns true when everything drained.
    pub async fn wait_for_pending_uploads(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending_uploads() > 0 {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::select! {
                _ = self.pending.drained.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        true
    }

    /// Queues a finalised video segment. The file is read into memory up
    /// front so the upload survives file deletion during termination.
    pub fn spawn_upload_segment(
        self: &Arc<Self>,
        segment: FinishedSegment,
        report_tx: Option<mpsc::UnboundedSender<UploadReport>>,
    ) -> JoinHandle<()> {
        let uploader = self.clone();
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let session_id = segment.session_id.clone();
            let outcome = uploader.upload_segment(&segment).await;
            uploader.finish_task(ArtifactKind::Video, session_id, outcome, report_tx);
        })
    }

    /// Queues a gzipped hierarchy journal covering one segment's span.
    pub fn spawn_upload_hierarchy(
        self: &Arc<Self>,
        segment: FinishedSegment,
        records: Vec<HierarchyRecord>,
        report_tx: Option<mpsc::UnboundedSender<UploadReport>>,
    ) -> JoinHandle<()> {
        let uploader = self.clone();
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let session_id = segment.session_id.clone();
            let outcome = uploader.upload_hierarchy(&segment, &records).await;
            uploader.finish_task(ArtifactKind::Hierarchy, session_id, outcome, report_tx);
        })
    }

    /// Replays the segment left behind by a crash, then clears the recovery
    /// metadata on success.
    pub fn spawn_recover_pending(
        self: &Arc<Self>,
        caches_dir: &Path,
        report_tx: Option<mpsc::UnboundedSender<UploadReport>>,
    ) -> Option<JoinHandle<()>> {
        let pending = recovery::pending_crash_segment_metadata(caches_dir)?;
        if !pending.segment_path.exists() {
            recovery::clear_pending_crash_segment_metadata(caches_dir);
            return None;
        }
        info!(
            "replaying crash-recovered segment {} ({} frames, finalized={})",
            pending.segment_path.display(),
            pending.frame_count,
            pending.finalized
        );

        let uploader = self.clone();
        let caches_dir = caches_dir.to_path_buf();
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        Some(tokio::spawn(async move {
            let PendingSegment {
                segment_path,
                session_id,
                start_ms,
                end_ms,
                frame_count,
                ..
            } = pending;
            let segment = FinishedSegment {
                path: segment_path,
                session_id: session_id.clone(),
                start_ms,
                end_ms,
                frame_count,
            };
            let outcome = uploader.upload_segment(&segment).await;
            if outcome.is_ok() {
                recovery::clear_pending_crash_segment_metadata(&caches_dir);
            }
            uploader.finish_task(ArtifactKind::Video, session_id, outcome, None);
        }))
    }

    fn finish_task(
        &self,
        kind: ArtifactKind,
        session_id: String,
        outcome: Result<String>,
        report_tx: Option<mpsc::UnboundedSender<UploadReport>>,
    ) {
        let report = match outcome {
            Ok(segment_id) => UploadReport {
                kind,
                session_id,
                segment_id: Some(segment_id),
                error: None,
            },
            Err(err) => {
                warn!("{} upload dropped: {err:#}", kind.wire_name());
                UploadReport {
                    kind,
                    session_id,
                    segment_id: None,
                    error: Some(format!("{err:#}")),
                }
            }
        };
        if let Some(tx) = report_tx {
            let _ = tx.send(report);
        }
        self.pending.count.fetch_sub(1, Ordering::SeqCst);
        self.pending.drained.notify_waiters();
    }

    async fn upload_segment(&self, segment: &FinishedSegment) -> Result<String> {
        let _slot = self.slots.clone().acquire_owned().await.expect("slots closed");
        let scope = self.background.begin("rj-upload-segment");

        let result = async {
            let bytes = tokio::fs::read(&segment.path)
                .await
                .with_context(|| format!("failed to read segment {}", segment.path.display()))?;
            let presign = self
                .presign(ArtifactKind::Video, segment, bytes.len() as u64, None)
                .await?;
            self.put_with_retries(&presign.presigned_url, bytes, ArtifactKind::Video)
                .await?;
            self.complete_with_retries(&presign.segment_id, &segment.session_id, segment.frame_count)
                .await?;

            if self.config.delete_after_upload
                && let Err(err) = tokio::fs::remove_file(&segment.path).await
            {
                warn!("failed to delete uploaded segment {}: {err}", segment.path.display());
            }
            Ok(presign.segment_id)
        }
        .await;

        self.background.end(scope);
        result
    }

    async fn upload_hierarchy(
        &self,
        segment: &FinishedSegment,
        records: &[HierarchyRecord],
    ) -> Result<String> {
        let _slot = self.slots.clone().acquire_owned().await.expect("slots closed");
        let scope = self.background.begin("rj-upload-hierarchy");

        let result = async {
            let payload = gzip_json(records)?;
            let presign = self
                .presign(
                    ArtifactKind::Hierarchy,
                    segment,
                    payload.len() as u64,
                    Some("gzip"),
                )
                .await?;
            self.put_with_retries(&presign.presigned_url, payload, ArtifactKind::Hierarchy)
                .await?;
            self.complete_with_retries(&presign.segment_id, &segment.session_id, segment.frame_count)
                .await?;
            Ok(presign.segment_id)
        }
        .await;

        self.background.end(scope);
        result
    }

    /// Step 1: presign. HTTP >= 400 is fatal for the artifact; no retry.
    async fn presign(
        &self,
        kind: ArtifactKind,
        segment: &FinishedSegment,
        size_bytes: u64,
        compression: Option<&str>,
    ) -> Result<PresignRecord> {
        let mut body = json!({
            "sessionId": segment.session_id,
            "kind": kind.wire_name(),
            "sizeBytes": size_bytes,
            "startTime": segment.start_ms,
            "endTime": segment.end_ms,
            "frameCount": segment.frame_count,
        });
        if let Some(compression) = compression {
            body["compression"] = json!(compression);
        }

        let mut request = self
            .client
            .post(format!("{}/api/ingest/segment/presign", self.endpoint.base_url))
            .json(&body);
        request = self.apply_auth_headers(request);

        let response = request.send().await.context("presign request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("presign rejected with {status}: {body}");
        }

        let json: Value = response.json().await.context("presign response was not JSON")?;
        let field = |name: &str| -> Result<String> {
            json.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .with_context(|| format!("presign response missing {name}"))
        };
        Ok(PresignRecord {
            presigned_url: field("presignedUrl")?,
            segment_id: field("segmentId")?,
            s3_key: field("s3Key")?,
        })
    }

    /// Step 2: PUT the bytes, retrying on any error with 2^attempt backoff.
    async fn put_with_retries(
        &self,
        url: &str,
        bytes: Vec<u8>,
        kind: ArtifactKind,
    ) -> Result<()> {
        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            let outcome = self
                .client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, kind.content_type())
                .header(reqwest::header::CONTENT_LENGTH, bytes.len() as u64)
                .body(bytes.clone())
                .send()
                .await;

            match outcome {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    if attempt == attempts {
                        bail!("storage PUT failed with {status} after {attempts} attempts");
                    }
                    warn!("storage PUT attempt {attempt} got {status}, retrying");
                }
                Err(err) => {
                    if attempt == attempts {
                        return Err(err).context(format!("storage PUT failed after {attempts} attempts"));
                    }
                    warn!("storage PUT attempt {attempt} errored ({err}), retrying");
                }
            }
            tokio::time::sleep(self.config.backoff_base * 2u32.pow(attempt)).await;
        }
        unreachable!("retry loop always returns")
    }

    /// Step 3: complete, retrying with backoff capped at 8 s.
    async fn complete_with_retries(
        &self,
        segment_id: &str,
        session_id: &str,
        frame_count: u32,
    ) -> Result<()> {
        let body = json!({
            "segmentId": segment_id,
            "sessionId": session_id,
            "frameCount": frame_count,
        });

        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            let mut request = self
                .client
                .post(format!("{}/api/ingest/segment/complete", self.endpoint.base_url))
                .json(&body);
            request = self.apply_auth_headers(request);

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status();
                    if attempt == attempts {
                        bail!("complete rejected with {status} after {attempts} attempts");
                    }
                    warn!("complete attempt {attempt} got {status}, retrying");
                }
                Err(err) => {
                    if attempt == attempts {
                        return Err(err).context(format!("complete failed after {attempts} attempts"));
                    }
                    warn!("complete attempt {attempt} errored ({err}), retrying");
                }
            }
            let backoff = self.config.backoff_base * 2u32.pow(attempt);
            tokio::time::sleep(backoff.min(self.config.complete_backoff_cap)).await;
        }
        unreachable!("retry loop always returns")
    }

    /// Device-token auth wins; the project public key is the fallback.
    fn apply_auth_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.upload_token.lock().expect("upload token mutex poisoned").clone();
        match token {
            Some(token) => request
                .header("x-upload-token", token)
                .header("x-rejourney-key", &self.endpoint.project_key),
            None => request.header("x-api-key", &self.endpoint.project_key),
        }
    }

    /// Deletes segment files that never uploaded, run once at startup.
    pub fn sweep_orphans(&self, segment_dir: &Path) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.config.orphan_max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0usize;
        let entries = std::fs::read_dir(segment_dir)
            .with_context(|| format!("failed to inspect {} for orphans", segment_dir.display()))?;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!("orphan sweep deleted {deleted} stale segment files");
        }
        Ok(deleted)
    }
}

fn gzip_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value).context("failed to encode hierarchy payload")?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).context("failed to gzip hierarchy payload")?;
    encoder.finish().context("failed to finish gzip stream")
}

#[cfg(test)]
mod tests {
    use super::{
        ArtifactKind, HierarchyRecord, SegmentUploader, UploaderEndpoint, gzip_json,
    };
    use crate::config::UploaderConfig;
    use crate::encoder::FinishedSegment;
    use crate::surface::NoopBackgroundTasks;
    use serde_json::Value;
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Recorded {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    struct MockIngest {
        base_url: String,
        requests: Arc<Mutex<Vec<Recorded>>>,
    }

    /// Single-connection-at-a-time HTTP responder; enough for the uploader's
    /// serial request pattern. `respond` maps (per-path attempt index,
    /// request) to an HTTP status plus body.
    async fn start_mock_ingest(
        respond: impl Fn(usize, &Recorded, &str) -> (u16, String) + Send + Sync + 'static,
    ) -> MockIngest {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let base_url = format!("http://{addr}");
        let requests: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        let base = base_url.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        break None;
                    };
                    if n == 0 {
                        break None;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break Some(at + 4);
                    }
                };
                let Some(header_end) = header_end else {
                    continue;
                };

                let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let mut lines = header_text.lines();
                let request_line = lines.next().unwrap_or_default();
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();
                let headers: Vec<(String, String)> = lines
                    .filter_map(|line| {
                        line.split_once(':')
                            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    })
                    .collect();
                let content_length = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        break;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }

                let recorded = Recorded {
                    method,
                    path: path.clone(),
                    headers,
                    body: buf[header_end..].to_vec(),
                };
                let attempt = {
                    let mut log = log.lock().expect("request log poisoned");
                    let attempt = log.iter().filter(|r| r.path == path).count();
                    log.push(recorded.clone());
                    attempt
                };
                let (status, body) = respond(attempt, &recorded, &base);
                let reason = match status {
                    200 => "OK",
                    503 => "Service Unavailable",
                    _ => "Error",
                };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        MockIngest { base_url, requests }
    }

    fn fast_config() -> UploaderConfig {
        UploaderConfig {
            max_retries: 3,
            backoff_base: Duration::from_millis(10),
            complete_backoff_cap: Duration::from_millis(80),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            delete_after_upload: true,
            orphan_max_age: Duration::from_secs(3600),
        }
    }

    fn uploader(base_url: &str) -> Arc<SegmentUploader> {
        Arc::new(
            SegmentUploader::new(
                UploaderEndpoint {
                    base_url: base_url.to_string(),
                    project_key: "pk_test".to_string(),
                    project_id: "proj_1".to_string(),
                },
                fast_config(),
                Arc::new(NoopBackgroundTasks),
            )
            .expect("uploader"),
        )
    }

    fn presign_body(base: &str) -> String {
        format!(
            r#"{{"presignedUrl":"{base}/put/seg-1","segmentId":"seg-1","s3Key":"sessions/a/seg-1"}}"#
        )
    }

    fn segment(path: std::path::PathBuf) -> FinishedSegment {
        FinishedSegment {
            path,
            session_id: "sess-a".to_string(),
            start_ms: 1_000,
            end_ms: 11_000,
            frame_count: 10,
        }
    }

    #[tokio::test]
    async fn full_protocol_retries_put_and_deletes_the_file() {
        let mock = start_mock_ingest(|attempt, req, base| match req.path.as_str() {
            "/api/ingest/segment/presign" => (200, presign_body(base)),
            "/put/seg-1" => {
                // Two 503s, then success (S5 shape).
                if attempt < 2 { (503, String::new()) } else { (200, String::new()) }
            }
            "/api/ingest/segment/complete" => (200, "{}".to_string()),
            _ => (404, String::new()),
        })
        .await;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("seg_sess-a_1000.mp4");
        std::fs::write(&path, b"fake mp4 bytes").expect("write segment");

        let up = uploader(&mock.base_url);
        let handle = up.spawn_upload_segment(segment(path.clone()), None);
        handle.await.expect("upload task");

        assert!(!path.exists(), "file deleted only after complete succeeded");
        assert_eq!(up.pending_uploads(), 0);
        assert!(up.wait_for_pending_uploads(Duration::from_millis(50)).await);

        let requests = mock.requests.lock().expect("log");
        let puts: Vec<_> = requests.iter().filter(|r| r.path == "/put/seg-1").collect();
        assert_eq!(puts.len(), 3);
        assert_eq!(puts[0].header("content-type"), Some("video/mp4"));
        assert_eq!(puts[0].body, b"fake mp4 bytes");

        let presign = requests
            .iter()
            .find(|r| r.path == "/api/ingest/segment/presign")
            .expect("presign request");
        assert_eq!(presign.header("x-api-key"), Some("pk_test"));
        let body: Value = serde_json::from_slice(&presign.body).expect("presign body");
        assert_eq!(body["sessionId"], "sess-a");
        assert_eq!(body["kind"], "video");
        assert_eq!(body["frameCount"], 10);

        let complete = requests
            .iter()
            .find(|r| r.path == "/api/ingest/segment/complete")
            .expect("complete request");
        let body: Value = serde_json::from_slice(&complete.body).expect("complete body");
        assert_eq!(body["segmentId"], "seg-1");
        assert_eq!(body["frameCount"], 10);
    }

    #[tokio::test]
    async fn exhausted_put_retries_keep_the_local_file() {
        let mock = start_mock_ingest(|_attempt, req, base| match req.path.as_str() {
            "/api/ingest/segment/presign" => (200, presign_body(base)),
            "/put/seg-1" => (503, String::new()),
            _ => (404, String::new()),
        })
        .await;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("seg_sess-a_1000.mp4");
        std::fs::write(&path, b"bytes").expect("write segment");

        let up = uploader(&mock.base_url);
        let (report_tx, mut report_rx) = tokio::sync::mpsc::unbounded_channel();
        up.spawn_upload_segment(segment(path.clone()), Some(report_tx))
            .await
            .expect("upload task");

        let report = report_rx.recv().await.expect("report");
        assert!(report.error.is_some());
        assert_eq!(report.kind, ArtifactKind::Video);
        assert!(path.exists(), "failed uploads never delete the artifact");
        assert_eq!(up.pending_uploads(), 0);

        let requests = mock.requests.lock().expect("log");
        assert_eq!(requests.iter().filter(|r| r.path == "/put/seg-1").count(), 3);
        assert!(
            !requests.iter().any(|r| r.path == "/api/ingest/segment/complete"),
            "complete is never attempted after a failed PUT"
        );
    }

    #[tokio::test]
    async fn fatal_presign_gives_up_without_retrying() {
        let mock = start_mock_ingest(|_attempt, req, _base| match req.path.as_str() {
            "/api/ingest/segment/presign" => (403, r#"{"error":"bad key"}"#.to_string()),
            _ => (404, String::new()),
        })
        .await;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("seg_sess-a_1000.mp4");
        std::fs::write(&path, b"bytes").expect("write segment");

        let up = uploader(&mock.base_url);
        up.spawn_upload_segment(segment(path.clone()), None)
            .await
            .expect("upload task");

        let requests = mock.requests.lock().expect("log");
        assert_eq!(requests.len(), 1, "presign failures are fatal per artifact");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn device_token_takes_header_precedence() {
        let mock = start_mock_ingest(|_attempt, req, base| match req.path.as_str() {
            "/api/ingest/segment/presign" => (200, presign_body(base)),
            "/put/seg-1" => (200, String::new()),
            "/api/ingest/segment/complete" => (200, "{}".to_string()),
            _ => (404, String::new()),
        })
        .await;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("seg_sess-a_1000.mp4");
        std::fs::write(&path, b"bytes").expect("write segment");

        let up = uploader(&mock.base_url);
        up.set_upload_token(Some("eyJ0b2tlbiJ9.deadbeef".to_string()));
        up.spawn_upload_segment(segment(path), None).await.expect("upload task");

        let requests = mock.requests.lock().expect("log");
        let presign = requests
            .iter()
            .find(|r| r.path == "/api/ingest/segment/presign")
            .expect("presign request");
        assert_eq!(presign.header("x-upload-token"), Some("eyJ0b2tlbiJ9.deadbeef"));
        assert_eq!(presign.header("x-rejourney-key"), Some("pk_test"));
        assert_eq!(presign.header("x-api-key"), None);
    }

    #[tokio::test]
    async fn hierarchy_uploads_are_gzipped_json() {
        let mock = start_mock_ingest(|_attempt, req, base| match req.path.as_str() {
            "/api/ingest/segment/presign" => (200, presign_body(base)),
            "/put/seg-1" => (200, String::new()),
            "/api/ingest/segment/complete" => (200, "{}".to_string()),
            _ => (404, String::new()),
        })
        .await;

        let temp = tempfile::tempdir().expect("tempdir");
        let seg = segment(temp.path().join("unused.mp4"));
        let records = vec![HierarchyRecord {
            timestamp_ms: 1_000,
            layout_signature: "00000000deadbeef".to_string(),
            text_input_rects: vec![[10.0, 20.0, 100.0, 44.0]],
            blocked_rects: vec![],
            occluded_rects: vec![],
            scroll_active: false,
            map_active: false,
            animation_area_ratio: 0.0,
        }];

        let up = uploader(&mock.base_url);
        up.spawn_upload_hierarchy(seg, records, None)
            .await
            .expect("upload task");

        let requests = mock.requests.lock().expect("log");
        let presign = requests
            .iter()
            .find(|r| r.path == "/api/ingest/segment/presign")
            .expect("presign request");
        let body: Value = serde_json::from_slice(&presign.body).expect("presign body");
        assert_eq!(body["kind"], "hierarchy");
        assert_eq!(body["compression"], "gzip");

        let put = requests.iter().find(|r| r.path == "/put/seg-1").expect("put");
        assert_eq!(put.header("content-type"), Some("application/gzip"));
        assert_eq!(&put.body[..2], &[0x1f, 0x8b], "gzip magic");

        let mut decoder = flate2::read::GzDecoder::new(put.body.as_slice());
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).expect("gunzip");
        let parsed: Value = serde_json::from_str(&decoded).expect("payload json");
        assert_eq!(parsed[0]["layoutSignature"], "00000000deadbeef");
        assert_eq!(parsed[0]["textInputRects"][0][2], 100.0);
    }

    #[test]
    fn gzip_json_produces_a_valid_stream() {
        let payload = gzip_json(&vec![1, 2, 3]).expect("gzip");
        assert_eq!(&payload[..2], &[0x1f, 0x8b]);
        let mut decoder = flate2::read::GzDecoder::new(payload.as_slice());
        let mut text = String::new();
        decoder.read_to_string(&mut text).expect("gunzip");
        assert_eq!(text, "[1,2,3]");
    }

    #[tokio::test]
    async fn orphan_sweep_deletes_only_stale_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stale = temp.path().join("seg_old_1.mp4");
        let fresh = temp.path().join("seg_new_2.mp4");
        std::fs::write(&stale, b"old").expect("write");

        let mut config = fast_config();
        config.orphan_max_age = Duration::from_millis(30);
        let up = SegmentUploader::new(
            UploaderEndpoint {
                base_url: "http://127.0.0.1:1".to_string(),
                project_key: "pk".to_string(),
                project_id: "proj".to_string(),
            },
            config,
            Arc::new(NoopBackgroundTasks),
        )
        .expect("uploader");

        std::thread::sleep(Duration::from_millis(60));
        std::fs::write(&fresh, b"new").expect("write");

        let deleted = up.sweep_orphans(temp.path()).expect("sweep");
        assert_eq!(deleted, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }
}
