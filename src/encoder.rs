use crate::buffer_pool::{PixelBuffer, PixelBufferPool};
use crate::config::CaptureConfig;
use crate::downscale::{Downscaler, ResampleQuality, output_dimensions};
use crate::mask::apply_privacy_mask;
use crate::mp4::Mp4SegmentWriter;
use crate::recovery::{PendingSegment, persist_pending_segment};
use crate::scanner::ScanResult;
use crate::uploader::HierarchyRecord;
use log::{debug, warn};
use openh264::OpenH264API;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate};
use openh264::formats::YUVSlices;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub fps: f32,
    pub frames_per_segment: u32,
    pub keyframe_interval: u32,
    pub target_bitrate: u32,
    pub segment_dir: PathBuf,
}

impl EncoderSettings {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            fps: config.video_fps,
            frames_per_segment: config.frames_per_segment.max(1),
            keyframe_interval: config.keyframe_interval(),
            target_bitrate: config.target_bitrate,
            segment_dir: config.segment_dir.clone(),
        }
    }
}

/// Bitrate scaled by pixel count against a 720p reference, clamped to
/// [200 kbps, 8 Mbps].
pub fn bitrate_for(target_bitrate: u32, width: u32, height: u32) -> u32 {
    let scaled =
        target_bitrate as f64 * (width as f64 * height as f64) / (1280.0 * 720.0);
    scaled.clamp(200_000.0, 8_000_000.0) as u32
}

/// A finalised segment, handed to the uploader in finish order.
#[derive(Debug, Clone)]
pub struct FinishedSegment {
    pub path: PathBuf,
    pub session_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub frame_count: u32,
}

/// A finished segment plus the hierarchy journal covering its span.
#[derive(Debug)]
pub struct FinishedArtifacts {
    pub segment: FinishedSegment,
    pub hierarchy: Vec<HierarchyRecord>,
}

/// Container-side state of the open segment, shared with the emergency
/// flush handle. The openh264 encoder itself stays on the worker thread.
#[derive(Default)]
pub struct SegmentState {
    writer: Option<Mp4SegmentWriter>,
    session_id: String,
    start_ms: i64,
    last_ts_ms: i64,
}

impl SegmentState {
    fn pending_record(&self, finalized: bool) -> Option<PendingSegment> {
        let writer = self.writer.as_ref()?;
        Some(PendingSegment {
            segment_path: writer.path().to_path_buf(),
            session_id: self.session_id.clone(),
            start_ms: self.start_ms,
            end_ms: self.last_ts_ms,
            frame_count: writer.sample_count(),
            finalized,
        })
    }
}

/// Handles shared between the encoding worker and the emergency flush: the
/// container state plus a low-contention shadow of the recovery record,
/// refreshed after every append, for the case where the segment lock cannot
/// be taken inside the crash budget.
#[derive(Clone, Default)]
pub struct EncoderShared {
    state: Arc<Mutex<SegmentState>>,
    shadow: Arc<Mutex<Option<PendingSegment>>>,
}

impl EncoderShared {
    pub fn new() -> Self {
        Self::default()
    }
}

/// H.264 segment encoder: converts BGRA frames to I420, encodes with
/// openh264, and writes rotating MP4 segments.
///
/// A fresh openh264 encoder is instantiated at each segment start and every
/// `keyframe_interval` frames, which forces an IDR with in-band parameter
/// sets; segments are therefore always self-contained.
pub struct VideoEncoder {
    settings: EncoderSettings,
    shared: EncoderShared,
    h264: Option<Encoder>,
    encoder_dims: (u32, u32),
    frames_since_keyframe: u32,
    frame_duration_ms: u64,
    yuv: Vec<u8>,
    accepting: bool,
}

impl VideoEncoder {
    pub fn new(settings: EncoderSettings, shared: EncoderShared) -> Self {
        let frame_duration_ms = if settings.fps > 0.0 {
            (1000.0 / settings.fps as f64).round() as u64
        } else {
            1000
        };
        Self {
            settings,
            shared,
            h264: None,
            encoder_dims: (0, 0),
            frames_since_keyframe: 0,
            frame_duration_ms,
            yuv: Vec::new(),
            accepting: true,
        }
    }

    pub fn begin_session(&mut self, session_id: String) {
        self.cancel_segment();
        self.shared.state.lock().expect("segment state mutex poisoned").session_id = session_id;
        self.accepting = true;
    }

    /// Forces codec initialisation off the capture hot path.
    pub fn prepare(&mut self, width: u32, height: u32) -> Result<(), EncoderError> {
        if self.h264.is_some() && self.encoder_dims == (width, height) {
            return Ok(());
        }
        let bitrate = bitrate_for(self.settings.target_bitrate, width, height);
        let api = OpenH264API::from_source();
        let config = EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(self.settings.fps.max(1.0)))
            .bitrate(BitRate::from_bps(bitrate));
        let encoder = Encoder::with_api_config(api, config)
            .map_err(|e| EncoderError::Fatal(format!("encoder init failed: {e}")))?;
        self.h264 = Some(encoder);
        self.encoder_dims = (width, height);
        self.frames_since_keyframe = 0;
        debug!("prepared H.264 encoder {width}x{height} @ {bitrate} bps");
        Ok(())
    }

    pub fn prewarm(&mut self, width: u32, height: u32) {
        if let Err(err) = self.prepare(width, height) {
            warn!("encoder prewarm failed: {err}");
        }
    }

    /// Appends one BGRA frame. Returns `Ok(false)` when input is not being
    /// accepted (backpressure); the caller drops the frame.
    pub fn append_pixel_buffer(
        &mut self,
        frame: &PixelBuffer,
        ts_ms: i64,
    ) -> Result<bool, EncoderError> {
        if !self.accepting || frame.is_empty() {
            return Ok(false);
        }
        let (width, height) = (frame.width(), frame.height());

        // Keyframe cadence: a rebuilt encoder emits IDR + SPS/PPS first.
        if self.frames_since_keyframe >= self.settings.keyframe_interval {
            self.h264 = None;
        }
        self.prepare(width, height)?;

        {
            let mut state = self.shared.state.lock().expect("segment state mutex poisoned");
            if state.writer.is_none() {
                let path = self
                    .settings
                    .segment_dir
                    .join(format!("seg_{}_{}.mp4", state.session_id, ts_ms));
                let writer = Mp4SegmentWriter::create(&path, width, height, self.frame_duration_ms)
                    .map_err(|e| EncoderError::Fatal(format!("segment create failed: {e}")))?;
                state.writer = Some(writer);
                state.start_ms = ts_ms;
                state.last_ts_ms = ts_ms;
            }
        }

        bgra_to_i420(frame.data(), width as usize, height as usize, &mut self.yuv);
        let y_size = (width * height) as usize;
        let c_size = y_size / 4;
        let (y_plane, chroma) = self.yuv.split_at(y_size);
        let (u_plane, v_plane) = chroma.split_at(c_size);
        let slices = YUVSlices::new(
            (y_plane, u_plane, v_plane),
            (width as usize, height as usize),
            (width as usize, (width / 2) as usize, (width / 2) as usize),
        );

        let encoder = self.h264.as_mut().expect("encoder prepared above");
        let bitstream = encoder
            .encode(&slices)
            .map_err(|e| EncoderError::Fatal(format!("encode failed: {e}")))?;
        let annexb = to_annex_b(bitstream.to_vec());

        let saw_idr = crate::mp4::split_annexb(&annexb)
            .iter()
            .any(|nal| !nal.is_empty() && nal[0] & 0x1F == 5);
        if saw_idr {
            self.frames_since_keyframe = 0;
        }
        self.frames_since_keyframe += 1;

        let mut state = self.shared.state.lock().expect("segment state mutex poisoned");
        let ts = ts_ms.max(state.last_ts_ms);
        let rel_ts = (ts - state.start_ms).max(0) as u64;
        let writer = state.writer.as_mut().expect("writer opened above");
        writer
            .append_sample(&annexb, rel_ts)
            .map_err(|e| EncoderError::Fatal(format!("sample append failed: {e}")))?;
        state.last_ts_ms = ts;

        let record = state.pending_record(false);
        drop(state);
        *self.shared.shadow.lock().expect("shadow mutex poisoned") = record;
        Ok(true)
    }

    pub fn segment_is_full(&self) -> bool {
        let state = self.shared.state.lock().expect("segment state mutex poisoned");
        state
            .writer
            .as_ref()
            .is_some_and(|w| w.sample_count() >= self.settings.frames_per_segment)
    }

    pub fn segment_open(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("segment state mutex poisoned")
            .writer
            .is_some()
    }

    /// Finalises the open segment. With `start_next` the encoder stays ready
    /// and the next appended frame opens a new segment (with a fresh IDR).
    pub fn finish_segment(
        &mut self,
        start_next: bool,
    ) -> Result<Option<FinishedSegment>, EncoderError> {
        *self.shared.shadow.lock().expect("shadow mutex poisoned") = None;
        let mut state = self.shared.state.lock().expect("segment state mutex poisoned");
        let Some(mut writer) = state.writer.take() else {
            self.accepting = start_next;
            return Ok(None);
        };
        if writer.sample_count() == 0 {
            writer.abort();
            self.accepting = start_next;
            return Ok(None);
        }
        if let Err(err) = writer.finalize() {
            let path = writer.path().to_path_buf();
            writer.abort();
            return Err(EncoderError::Fatal(format!(
                "failed to finalize segment {}: {err}",
                path.display()
            )));
        }

        let finished = FinishedSegment {
            path: writer.path().to_path_buf(),
            session_id: state.session_id.clone(),
            start_ms: state.start_ms,
            end_ms: state.last_ts_ms,
            frame_count: writer.sample_count(),
        };
        drop(state);

        // The next segment must open with a keyframe.
        self.h264 = None;
        self.accepting = start_next;
        Ok(Some(finished))
    }

    /// Deletes the partial segment and resets writer state.
    pub fn cancel_segment(&mut self) {
        *self.shared.shadow.lock().expect("shadow mutex poisoned") = None;
        let mut state = self.shared.state.lock().expect("segment state mutex poisoned");
        if let Some(writer) = state.writer.take() {
            writer.abort();
        }
        drop(state);
        self.h264 = None;
    }
}

fn to_annex_b(buf: Vec<u8>) -> Vec<u8> {
    // openh264 emits Annex-B in the builds we ship, but the API does not
    // promise it; rewrite AVCC length prefixes into start codes when seen.
    let is_annex_b = buf.len() >= 4
        && buf[0] == 0
        && buf[1] == 0
        && (buf[2] == 1 || (buf[2] == 0 && buf[3] == 1));
    if is_annex_b {
        return buf;
    }
    let mut out = Vec::with_capacity(buf.len() + 64);
    let mut i = 0;
    while i + 4 <= buf.len() {
        let nalu_size = u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]) as usize;
        i += 4;
        if nalu_size == 0 || i + nalu_size > buf.len() {
            break;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&buf[i..i + nalu_size]);
        i += nalu_size;
    }
    out
}

fn bgra_to_i420(src: &[u8], width: usize, height: usize, dst: &mut Vec<u8>) {
    let y_size = width * height;
    let c_size = y_size / 4;
    dst.resize(y_size + 2 * c_size, 0);
    let (y_plane, chroma) = dst.split_at_mut(y_size);
    let (u_plane, v_plane) = chroma.split_at_mut(c_size);

    for row in 0..height {
        for col in 0..width {
            let at = (row * width + col) * 4;
            let b = src[at] as i32;
            let g = src[at + 1] as i32;
            let r = src[at + 2] as i32;
            let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[row * width + col] = y.clamp(0, 255) as u8;
        }
    }

    let chroma_width = width / 2;
    for row in (0..height).step_by(2) {
        for col in (0..width).step_by(2) {
            let mut b = 0i32;
            let mut g = 0i32;
            let mut r = 0i32;
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let at = ((row + dy).min(height - 1) * width + (col + dx).min(width - 1)) * 4;
                b += src[at] as i32;
                g += src[at + 1] as i32;
                r += src[at + 2] as i32;
            }
            b /= 4;
            g /= 4;
            r /= 4;
            let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
            let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
            let c_at = (row / 2) * chroma_width + col / 2;
            u_plane[c_at] = u.clamp(0, 255) as u8;
            v_plane[c_at] = v.clamp(0, 255) as u8;
        }
    }
}

/// Crash-handler entry point. Holds only the container state, so it can run
/// while the worker thread is wedged mid-encode.
#[derive(Clone)]
pub struct EmergencyFlushHandle {
    shared: EncoderShared,
    caches_dir: PathBuf,
    budget: Duration,
}

impl EmergencyFlushHandle {
    pub fn new(shared: EncoderShared, caches_dir: PathBuf, budget: Duration) -> Self {
        Self {
            shared,
            caches_dir,
            budget,
        }
    }

    /// Best-effort synchronous finalisation, for use from a fatal-signal
    /// handler only. Tries to take the segment lock within the budget and
    /// write the container index; whatever the outcome, recovery metadata is
    /// persisted so the segment can be replayed on the next launch.
    pub fn emergency_flush_sync(&self) {
        let deadline = std::time::Instant::now() + self.budget;
        loop {
            if let Ok(mut state) = self.shared.state.try_lock() {
                let Some(writer) = state.writer.as_mut() else {
                    return;
                };
                if writer.sample_count() == 0 {
                    return;
                }
                let finalized = writer.finalize().is_ok();
                if let Some(record) = state.pending_record(finalized)
                    && let Err(err) = persist_pending_segment(&self.caches_dir, &record)
                {
                    warn!("emergency flush could not persist recovery metadata: {err}");
                }
                return;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        // The worker is wedged holding the segment lock; fall back to the
        // shadow record so the segment is still replayed, unfinalized.
        warn!("emergency flush could not take segment lock within budget");
        if let Ok(shadow) = self.shared.shadow.try_lock()
            && let Some(record) = shadow.as_ref()
            && let Err(err) = persist_pending_segment(&self.caches_dir, record)
        {
            warn!("emergency flush could not persist shadow metadata: {err}");
        }
    }
}

/// Work items for the encoding worker; a dedicated serial queue.
pub enum EncodeMsg {
    BeginSession {
        session_id: String,
    },
    Prewarm {
        width: u32,
        height: u32,
    },
    Job(Box<EncodeJob>),
    FinishSegment {
        start_next: bool,
        done: Option<oneshot::Sender<()>>,
    },
    CancelSegment,
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// One frame to downscale, mask and append, with the scan that produced it.
pub struct EncodeJob {
    pub frame: Arc<PixelBuffer>,
    pub scan: Arc<ScanResult>,
    pub timestamp_ms: i64,
    pub scale: f32,
    pub quality: ResampleQuality,
    /// Target surface size in points, for converting mask rects to pixels.
    pub surface_size: (f32, f32),
}

#[derive(Debug)]
pub enum EncodeFeedback {
    Appended { timestamp_ms: i64 },
    Dropped { backpressure: bool },
    AppendFailed { message: String },
    SegmentFinished(FinishedSegment),
}

pub struct EncodeWorker {
    pub tx: mpsc::UnboundedSender<EncodeMsg>,
    pub handle: std::thread::JoinHandle<()>,
}

/// Spawns the serial encoding queue. Downscale, privacy mask, encoder append
/// and segment file I/O all happen here, never on the engine context.
pub fn spawn_encode_worker(
    settings: EncoderSettings,
    shared: EncoderShared,
    native_pool: Arc<PixelBufferPool>,
    encode_pool: Arc<PixelBufferPool>,
    min_dimension: u32,
    feedback_tx: mpsc::UnboundedSender<EncodeFeedback>,
    segment_tx: mpsc::UnboundedSender<FinishedArtifacts>,
) -> EncodeWorker {
    let (tx, mut rx) = mpsc::unbounded_channel::<EncodeMsg>();
    let handle = std::thread::Builder::new()
        .name("rj-encode".to_string())
        .spawn(move || {
            let mut encoder = VideoEncoder::new(settings, shared);
            let mut downscaler = Downscaler::new();
            let mut hierarchy: Vec<HierarchyRecord> = Vec::new();
            let mut last_dims: Option<(u32, u32)> = None;

            let flush_finished =
                |encoder: &mut VideoEncoder, hierarchy: &mut Vec<HierarchyRecord>, start_next: bool| {
                    match encoder.finish_segment(start_next) {
                        Ok(Some(segment)) => {
                            let _ = feedback_tx.send(EncodeFeedback::SegmentFinished(segment.clone()));
                            let _ = segment_tx.send(FinishedArtifacts {
                                segment,
                                hierarchy: std::mem::take(hierarchy),
                            });
                        }
                        Ok(None) => {
                            hierarchy.clear();
                        }
                        Err(err) => {
                            hierarchy.clear();
                            let _ = feedback_tx.send(EncodeFeedback::AppendFailed {
                                message: err.to_string(),
                            });
                        }
                    }
                };

            while let Some(msg) = rx.blocking_recv() {
                match msg {
                    EncodeMsg::BeginSession { session_id } => {
                        hierarchy.clear();
                        encoder.begin_session(session_id);
                    }
                    EncodeMsg::Prewarm { width, height } => {
                        encoder.prewarm(width, height);
                    }
                    EncodeMsg::Job(job) => {
                        let (out_w, out_h) = output_dimensions(
                            job.frame.width(),
                            job.frame.height(),
                            job.scale,
                            min_dimension,
                        );
                        // A performance-level scale change mid-segment
                        // rotates the segment; one file keeps one size.
                        if last_dims.is_some_and(|dims| dims != (out_w, out_h))
                            && encoder.segment_open()
                        {
                            flush_finished(&mut encoder, &mut hierarchy, true);
                        }
                        last_dims = Some((out_w, out_h));
                        let mut encode_buf = encode_pool.acquire(out_w, out_h);
                        let downscale_result =
                            downscaler.downscale(&job.frame, &mut encode_buf, job.quality);
                        if let Err(err) = downscale_result {
                            encode_pool.recycle(encode_buf);
                            let _ = feedback_tx.send(EncodeFeedback::AppendFailed {
                                message: format!("downscale failed: {err}"),
                            });
                            continue;
                        }

                        // Privacy rects come from the scan cached with this
                        // exact frame, at the encode buffer's scale.
                        let mask_scale = if job.surface_size.0 > 0.0 {
                            out_w as f32 / job.surface_size.0
                        } else {
                            1.0
                        };
                        apply_privacy_mask(&mut encode_buf, job.scan.privacy_rects(), mask_scale);

                        match encoder.append_pixel_buffer(&encode_buf, job.timestamp_ms) {
                            Ok(true) => {
                                hierarchy.push(HierarchyRecord::from_scan(
                                    &job.scan,
                                    job.timestamp_ms,
                                ));
                                let _ = feedback_tx.send(EncodeFeedback::Appended {
                                    timestamp_ms: job.timestamp_ms,
                                });
                                if encoder.segment_is_full() {
                                    flush_finished(&mut encoder, &mut hierarchy, true);
                                }
                            }
                            Ok(false) => {
                                let _ = feedback_tx.send(EncodeFeedback::Dropped {
                                    backpressure: true,
                                });
                            }
                            Err(err) => {
                                encoder.cancel_segment();
                                hierarchy.clear();
                                let _ = feedback_tx.send(EncodeFeedback::AppendFailed {
                                    message: err.to_string(),
                                });
                            }
                        }

                        encode_pool.recycle(encode_buf);
                        if let Ok(frame) = Arc::try_unwrap(job.frame) {
                            native_pool.recycle(frame);
                        }
                    }
                    EncodeMsg::FinishSegment { start_next, done } => {
                        flush_finished(&mut encoder, &mut hierarchy, start_next);
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                    EncodeMsg::CancelSegment => {
                        hierarchy.clear();
                        encoder.cancel_segment();
                    }
                    EncodeMsg::Shutdown { done } => {
                        flush_finished(&mut encoder, &mut hierarchy, false);
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn encode worker");

    EncodeWorker { tx, handle }
}
