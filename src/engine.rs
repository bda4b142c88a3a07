use crate::buffer_pool::{PixelBuffer, PixelBufferPool};
use crate::config::CaptureConfig;
use crate::downscale::ResampleQuality;
use crate::encoder::{
    EmergencyFlushHandle, EncodeFeedback, EncodeJob, EncodeMsg, EncoderSettings, EncoderShared,
    FinishedArtifacts, spawn_encode_worker,
};
use crate::heuristics::{CaptureHeuristics, Decision, RenderReason, ReuseReason};
use crate::intent::{CaptureIntent, Importance, IntentClock, intent_grace};
use crate::performance::{PerformanceLevel, spawn_performance_manager};
use crate::scanner::{ScanDepth, ScanResult, Scanner};
use crate::surface::{
    BackgroundTasks, ClassProbe, ClassResolver, FrameRenderer, RenderOptions, SurfaceSnapshot,
    WindowProvider,
};
use crate::uploader::{ArtifactKind, SegmentUploader, UploadReport, UploaderEndpoint};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Errors the engine surfaces to the host; everything else is recovered
/// internally and reported through the event stream.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("uploader is not configured: base URL, project key and project id are required")]
    MisconfiguredUploader,
    #[error("encoder entered a failed state: {0}")]
    EncoderFatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureKind {
    Tap,
    Pan,
    Pinch,
    Swipe,
    Drag,
    Scroll,
    LongPress,
}

impl GestureKind {
    fn is_map_candidate(self) -> bool {
        matches!(
            self,
            GestureKind::Pan | GestureKind::Pinch | GestureKind::Swipe | GestureKind::Drag
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    LevelPaused,
    NoPriorFrame,
    BlockedSurfaceUnsafe,
    RenderFailed,
}

#[derive(Debug)]
pub enum EngineCommand {
    StartSession { session_id: String },
    StopSession { sync: bool },
    Pause { sync: bool },
    Resume,
    NotifyNavigation { screen_name: String },
    NotifyGesture { kind: GestureKind },
    NotifyKeyboard { animating: bool },
    NotifyUiReady,
    NotifyCommit,
    Shutdown { sync: bool },
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionStarted {
        session_id: String,
    },
    SessionStopped {
        session_id: String,
    },
    Paused,
    Resumed,
    FrameRendered {
        reason: RenderReason,
        timestamp_ms: i64,
    },
    FrameReused {
        reason: ReuseReason,
        timestamp_ms: i64,
    },
    IntentDropped {
        reason: DropReason,
    },
    SegmentFinished {
        path: PathBuf,
        frame_count: u32,
        start_ms: i64,
        end_ms: i64,
    },
    UploadCompleted {
        kind: ArtifactKind,
        segment_id: String,
    },
    UploadFailed {
        kind: ArtifactKind,
        message: String,
    },
    LevelChanged {
        level: PerformanceLevel,
    },
    EncoderError {
        message: String,
    },
    SessionError {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub ticks: u64,
    pub rendered: u64,
    pub reused: u64,
    pub dropped: u64,
    pub segments: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
}

/// Host integrations the engine is constructed over.
pub struct CaptureHost {
    pub windows: Arc<dyn WindowProvider>,
    pub renderer: Arc<dyn FrameRenderer>,
    pub signals: Arc<dyn crate::performance::DeviceSignals>,
    pub background: Arc<dyn BackgroundTasks>,
    pub probe: Box<dyn ClassProbe>,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
    screen_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Warming { until: Instant },
    Recording,
    Paused,
}

/// The last rendered frame together with the scan that produced it; privacy
/// rects for a reused frame always come from this cached scan.
#[derive(Debug)]
pub(crate) struct CachedFrame {
    pub(crate) buffer: Arc<PixelBuffer>,
    pub(crate) scan: Arc<ScanResult>,
    /// Target surface size in points when this frame was rendered.
    pub(crate) surface_size: (f32, f32),
}

/// Picks the buffer for a ReuseLast emission. A cached frame containing a
/// camera/web/video surface is never reused once the live tree no longer has
/// one; the separately retained "safe" frame stands in, or the emit drops.
pub(crate) fn select_reuse_frame<'a>(
    current_scan: &ScanResult,
    last: Option<&'a CachedFrame>,
    safe: Option<&'a CachedFrame>,
) -> std::result::Result<(&'a CachedFrame, bool), DropReason> {
    let Some(last) = last else {
        return Err(DropReason::NoPriorFrame);
    };
    if last.scan.has_blocked_surfaces() && !current_scan.has_blocked_surfaces() {
        return safe.map(|safe| (safe, true)).ok_or(DropReason::BlockedSurfaceUnsafe);
    }
    Ok((last, false))
}

/// The capture engine: owns session state, drives the intent clock, and
/// sequences scan -> decide -> render -> downscale -> mask -> encode.
///
/// Modeled as a single task consuming commands and publishing events; capture
/// work happens between command deliveries so it can never preempt the host's
/// UI updates. Encoding and upload I/O run elsewhere (worker thread, upload
/// tasks) and report back over channels.
pub struct CaptureEngine {
    config: CaptureConfig,
    windows: Arc<dyn WindowProvider>,
    renderer: Arc<dyn FrameRenderer>,
    background: Arc<dyn BackgroundTasks>,
    scanner: Scanner,
    heuristics: CaptureHeuristics,
    native_pool: Arc<PixelBufferPool>,
    shared: EncoderShared,
    worker_tx: mpsc::UnboundedSender<EncodeMsg>,
    feedback_rx: Option<mpsc::UnboundedReceiver<EncodeFeedback>>,
    segment_rx: Option<mpsc::UnboundedReceiver<FinishedArtifacts>>,
    level_rx: Option<watch::Receiver<PerformanceLevel>>,
    perf_handle: Option<tokio::task::JoinHandle<()>>,
    uploader: Option<Arc<SegmentUploader>>,

    state: EngineState,
    session: Option<Session>,
    clock: IntentClock,
    intent: Option<CaptureIntent>,
    scheduled: Option<(Instant, Importance)>,
    generation: u64,
    last_frame: Option<CachedFrame>,
    safe_frame: Option<CachedFrame>,
    consecutive_encode_failures: u32,
    current_level: PerformanceLevel,
    summary: SessionSummary,
}

impl CaptureEngine {
    /// Builds the engine with its real pipeline: a dedicated encoding worker
    /// thread and a performance sampler task. Must be called on a runtime.
    pub fn new(host: CaptureHost, config: CaptureConfig) -> Self {
        let resolver = Arc::new(ClassResolver::new(host.probe));
        let scanner = Scanner::new(
            resolver,
            config.scan.clone(),
            config.masked_identifiers.clone(),
            config.min_masked_area,
        );
        let heuristics = CaptureHeuristics::new(&config);
        let native_pool = Arc::new(PixelBufferPool::new(config.pool_capacity));
        let encode_pool = Arc::new(PixelBufferPool::new(config.pool_capacity));
        let shared = EncoderShared::new();

        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let worker = spawn_encode_worker(
            EncoderSettings::from_config(&config),
            shared.clone(),
            native_pool.clone(),
            encode_pool,
            config.min_dimension,
            feedback_tx,
            segment_tx,
        );
        let (level_rx, perf_handle) =
            spawn_performance_manager(host.signals, config.performance.clone());

        Self::assemble(
            host.windows,
            host.renderer,
            host.background,
            config,
            scanner,
            heuristics,
            native_pool,
            shared,
            worker.tx,
            feedback_rx,
            segment_rx,
            level_rx,
            Some(perf_handle),
        )
    }

    /// Test seam: identical wiring with caller-provided pipeline channels
    /// and performance level source.
    #[cfg(test)]
    pub(crate) fn with_parts(
        windows: Arc<dyn WindowProvider>,
        renderer: Arc<dyn FrameRenderer>,
        background: Arc<dyn BackgroundTasks>,
        probe: Box<dyn ClassProbe>,
        config: CaptureConfig,
        worker_tx: mpsc::UnboundedSender<EncodeMsg>,
        feedback_rx: mpsc::UnboundedReceiver<EncodeFeedback>,
        segment_rx: mpsc::UnboundedReceiver<FinishedArtifacts>,
        level_rx: watch::Receiver<PerformanceLevel>,
    ) -> Self {
        let resolver = Arc::new(ClassResolver::new(probe));
        let scanner = Scanner::new(
            resolver,
            config.scan.clone(),
            config.masked_identifiers.clone(),
            config.min_masked_area,
        );
        let heuristics = CaptureHeuristics::new(&config);
        let native_pool = Arc::new(PixelBufferPool::new(config.pool_capacity));
        Self::assemble(
            windows,
            renderer,
            background,
            config,
            scanner,
            heuristics,
            native_pool,
            EncoderShared::new(),
            worker_tx,
            feedback_rx,
            segment_rx,
            level_rx,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        windows: Arc<dyn WindowProvider>,
        renderer: Arc<dyn FrameRenderer>,
        background: Arc<dyn BackgroundTasks>,
        config: CaptureConfig,
        scanner: Scanner,
        heuristics: CaptureHeuristics,
        native_pool: Arc<PixelBufferPool>,
        shared: EncoderShared,
        worker_tx: mpsc::UnboundedSender<EncodeMsg>,
        feedback_rx: mpsc::UnboundedReceiver<EncodeFeedback>,
        segment_rx: mpsc::UnboundedReceiver<FinishedArtifacts>,
        level_rx: watch::Receiver<PerformanceLevel>,
        perf_handle: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        let clock = IntentClock::new(config.video_fps, Instant::now());
        Self {
            config,
            windows,
            renderer,
            background,
            scanner,
            heuristics,
            native_pool,
            shared,
            worker_tx,
            feedback_rx: Some(feedback_rx),
            segment_rx: Some(segment_rx),
            level_rx: Some(level_rx),
            perf_handle,
            uploader: None,
            state: EngineState::Idle,
            session: None,
            clock,
            intent: None,
            scheduled: None,
            generation: 0,
            last_frame: None,
            safe_frame: None,
            consecutive_encode_failures: 0,
            current_level: PerformanceLevel::Normal,
            summary: SessionSummary::default(),
        }
    }

    /// Must precede the first `StartSession`; sessions refuse to start with
    /// `MisconfiguredUploader` otherwise.
    pub fn configure_uploader(
        &mut self,
        base_url: impl Into<String>,
        project_key: impl Into<String>,
        project_id: impl Into<String>,
    ) -> std::result::Result<(), CaptureError> {
        let endpoint = UploaderEndpoint {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_key: project_key.into(),
            project_id: project_id.into(),
        };
        if endpoint.base_url.is_empty()
            || endpoint.project_key.is_empty()
            || endpoint.project_id.is_empty()
        {
            return Err(CaptureError::MisconfiguredUploader);
        }
        let uploader = SegmentUploader::new(
            endpoint,
            self.config.uploader.clone(),
            self.background.clone(),
        )
        .map_err(|_| CaptureError::MisconfiguredUploader)?;
        self.uploader = Some(Arc::new(uploader));
        Ok(())
    }

    /// Installs the host-managed device upload token on the uploader.
    pub fn set_upload_token(&self, token: Option<String>) {
        if let Some(uploader) = &self.uploader {
            uploader.set_upload_token(token);
        }
    }

    /// Handle for the host's crash handler; see
    /// [`EmergencyFlushHandle::emergency_flush_sync`].
    pub fn emergency_flush_handle(&self) -> EmergencyFlushHandle {
        EmergencyFlushHandle::new(
            self.shared.clone(),
            self.config.caches_dir.clone(),
            self.config.emergency_flush_budget,
        )
    }

    /// Runs the engine loop until a `Shutdown` command arrives (or the
    /// command channel closes) and returns the session counters.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<EngineCommand>,
        event_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
    ) -> Result<SessionSummary> {
        let mut feedback_rx = self.feedback_rx.take().expect("run called twice");
        let mut level_rx = self.level_rx.take().expect("run called twice");
        let segment_rx = self.segment_rx.take().expect("run called twice");

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<UploadReport>();
        let _dispatcher = spawn_upload_dispatcher(segment_rx, self.uploader.clone(), report_tx);

        if let Some(uploader) = &self.uploader {
            if let Err(err) = uploader.sweep_orphans(&self.config.segment_dir) {
                warn!("orphan sweep failed: {err:#}");
            }
            uploader.spawn_recover_pending(&self.config.caches_dir, None);
        }

        let mut level_open = true;
        loop {
            let now = Instant::now();
            self.current_level = *level_rx.borrow();
            let delay = self
                .next_wakeup()
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or(Duration::from_millis(200))
                .min(Duration::from_millis(200));

            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command, &event_tx).await {
                                break;
                            }
                        }
                        None => {
                            self.do_stop(false, &event_tx).await;
                            break;
                        }
                    }
                }
                feedback = feedback_rx.recv() => {
                    match feedback {
                        Some(feedback) => self.handle_feedback(feedback, &event_tx).await,
                        None => {
                            send_event(&event_tx, EngineEvent::SessionError {
                                message: "encoding worker terminated".to_string(),
                            });
                            break;
                        }
                    }
                }
                changed = level_rx.changed(), if level_open => {
                    match changed {
                        Ok(()) => {
                            let level = *level_rx.borrow_and_update();
                            self.current_level = level;
                            send_event(&event_tx, EngineEvent::LevelChanged { level });
                        }
                        Err(_) => level_open = false,
                    }
                }
                Some(report) = report_rx.recv() => {
                    self.handle_upload_report(report, &event_tx);
                }
                _ = tokio::time::sleep(delay) => {
                    self.on_timer(Instant::now(), &event_tx);
                }
            }
        }

        let _ = self.worker_tx.send(EncodeMsg::Shutdown { done: None });
        if let Some(handle) = self.perf_handle.take() {
            handle.abort();
        }
        Ok(self.summary)
    }

    fn next_wakeup(&self) -> Option<Instant> {
        match self.state {
            EngineState::Idle | EngineState::Paused => None,
            EngineState::Warming { until } => Some(until),
            EngineState::Recording => {
                let mut wake = Some(self.clock.next_due());
                let mut fold = |candidate: Option<Instant>| {
                    if let Some(candidate) = candidate {
                        wake = Some(wake.map_or(candidate, |w: Instant| w.min(candidate)));
                    }
                };
                if let Some(intent) = &self.intent {
                    fold(Some(intent.poll_at));
                    fold(Some(intent.deadline));
                }
                fold(self.scheduled.map(|(at, _)| at));
                fold(self.heuristics.bonus_due_at());
                wake
            }
        }
    }

    /// Returns true when the engine should shut down.
    async fn handle_command(
        &mut self,
        command: EngineCommand,
        event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>,
    ) -> bool {
        let now = Instant::now();
        match command {
            EngineCommand::StartSession { session_id } => {
                self.start_session(session_id, now, event_tx).await;
            }
            EngineCommand::StopSession { sync } => {
                self.do_stop(sync, event_tx).await;
            }
            EngineCommand::Pause { sync } => {
                self.do_pause(sync, event_tx).await;
            }
            EngineCommand::Resume => {
                if self.state == EngineState::Paused {
                    self.state = EngineState::Recording;
                    self.clock.align_next_due(now);
                    send_event(event_tx, EngineEvent::Resumed);
                }
            }
            EngineCommand::NotifyNavigation { screen_name } => {
                if let Some(session) = &mut self.session {
                    session.screen_name = Some(screen_name);
                }
                self.heuristics.note_navigation(now);
                self.schedule_capture(now + self.config.navigation_capture_delay, Importance::High);
            }
            EngineCommand::NotifyGesture { kind } => {
                if kind.is_map_candidate() && self.heuristics.map_recently_seen(now) {
                    self.heuristics.note_map_gesture(now);
                    self.schedule_capture(
                        now + self.config.map_gesture_capture_delay,
                        Importance::Low,
                    );
                } else if kind == GestureKind::Scroll {
                    self.heuristics.note_scroll(now);
                    self.schedule_capture(now + self.config.scroll_capture_delay, Importance::Low);
                } else {
                    self.heuristics.note_touch(now);
                    self.schedule_capture(
                        now + self.config.interaction_capture_delay,
                        Importance::Low,
                    );
                }
            }
            EngineCommand::NotifyKeyboard { animating } => {
                self.heuristics.note_keyboard(now, animating);
            }
            EngineCommand::NotifyUiReady => {
                if matches!(self.state, EngineState::Warming { .. }) {
                    self.state = EngineState::Recording;
                    self.clock.align_next_due(now);
                }
            }
            EngineCommand::NotifyCommit => {
                self.schedule_capture(now, Importance::High);
            }
            EngineCommand::Shutdown { sync } => {
                self.do_stop(sync, event_tx).await;
                return true;
            }
        }
        false
    }

    async fn start_session(
        &mut self,
        session_id: String,
        now: Instant,
        event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>,
    ) {
        if self.uploader.is_none() {
            send_event(
                event_tx,
                EngineEvent::SessionError {
                    message: CaptureError::MisconfiguredUploader.to_string(),
                },
            );
            return;
        }
        if self.session.is_some() {
            self.do_stop(false, event_tx).await;
        }

        let warm_until = now + self.config.warmup;
        self.state = EngineState::Warming { until: warm_until };
        self.session = Some(Session {
            id: session_id.clone(),
            started_at: Utc::now(),
            screen_name: None,
        });
        self.clock = IntentClock::new(self.config.video_fps, warm_until);
        self.heuristics.reset();
        self.scanner.reset();
        self.intent = None;
        self.scheduled = None;
        self.last_frame = None;
        self.safe_frame = None;
        self.consecutive_encode_failures = 0;
        self.summary = SessionSummary::default();

        let _ = self.worker_tx.send(EncodeMsg::BeginSession {
            session_id: session_id.clone(),
        });
        // Warm the codec against the current surface size off the hot path.
        let surfaces = self.windows.surfaces();
        if let Some(target) = surfaces.get(self.windows.target_index()) {
            let scale = self.effective_scale(self.current_level);
            let (w, h) = crate::downscale::output_dimensions(
                (target.bounds.w * target.scale) as u32,
                (target.bounds.h * target.scale) as u32,
                scale,
                self.config.min_dimension,
            );
            let _ = self.worker_tx.send(EncodeMsg::Prewarm { width: w, height: h });
        }

        send_event(event_tx, EngineEvent::SessionStarted { session_id });
    }

    async fn do_stop(&mut self, sync: bool, event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.drain_intent(event_tx);

        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.worker_tx.send(EncodeMsg::FinishSegment {
            start_next: false,
            done: Some(done_tx),
        });
        if sync {
            if tokio::time::timeout(self.config.stop_timeout, done_rx).await.is_err() {
                warn!("segment finish did not complete within the stop timeout");
            }
            if let Some(uploader) = &self.uploader
                && !uploader.wait_for_pending_uploads(self.config.stop_timeout).await
            {
                warn!(
                    "{} uploads still pending after the stop timeout",
                    uploader.pending_uploads()
                );
            }
        }

        self.state = EngineState::Idle;
        self.intent = None;
        self.scheduled = None;
        self.heuristics.reset();
        self.last_frame = None;
        self.safe_frame = None;
        send_event(event_tx, EngineEvent::SessionStopped { session_id: session.id });
    }

    async fn do_pause(&mut self, sync: bool, event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>) {
        if self.session.is_none() || self.state == EngineState::Paused {
            return;
        }
        self.drain_intent(event_tx);

        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.worker_tx.send(EncodeMsg::FinishSegment {
            start_next: true,
            done: Some(done_tx),
        });
        if sync && tokio::time::timeout(self.config.stop_timeout, done_rx).await.is_err() {
            warn!("segment finish did not complete within the pause timeout");
        }

        self.state = EngineState::Paused;
        self.intent = None;
        self.scheduled = None;
        self.heuristics.reset();
        self.safe_frame = None;
        send_event(event_tx, EngineEvent::Paused);
    }

    /// Emits a pending intent (reuse path) before it is abandoned, so a
    /// stop/pause never loses the frame the intent promised.
    fn drain_intent(&mut self, event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>) {
        if self.intent.take().is_some()
            && let Some(scan) = self.last_frame.as_ref().map(|f| f.scan.clone())
        {
            self.emit_reuse(&scan, ReuseReason::DeadlineExpired, event_tx);
        }
    }

    fn schedule_capture(&mut self, at: Instant, importance: Importance) {
        self.scheduled = Some(match self.scheduled {
            Some((existing_at, existing_imp)) => {
                if importance > existing_imp || (importance == existing_imp && at < existing_at) {
                    (at, importance)
                } else {
                    (existing_at, existing_imp)
                }
            }
            None => (at, importance),
        });
    }

    fn on_timer(&mut self, now: Instant, event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>) {
        match self.state {
            EngineState::Idle | EngineState::Paused => {}
            EngineState::Warming { until } => {
                if now >= until {
                    self.state = EngineState::Recording;
                    self.on_timer(now, event_tx);
                }
            }
            EngineState::Recording => {
                // A previous intent past its deadline force-emits on the
                // reuse path before anything new is considered.
                if let Some(intent) = self.intent
                    && intent.past_deadline(now)
                {
                    self.intent = None;
                    if let Some(scan) = self.last_frame.as_ref().map(|f| f.scan.clone()) {
                        self.emit_reuse(&scan, ReuseReason::DeadlineExpired, event_tx);
                    }
                }

                let mut importance: Option<Importance> = None;
                if self.clock.should_tick(now) {
                    self.clock.mark_ticked(now);
                    self.summary.ticks += 1;
                    if self.intent.is_none() {
                        importance = Some(Importance::Low);
                    }
                }
                if let Some((at, scheduled_importance)) = self.scheduled
                    && now >= at
                {
                    self.scheduled = None;
                    importance = Some(match importance {
                        Some(existing) => existing.max(scheduled_importance),
                        None => scheduled_importance,
                    });
                }
                if importance.is_none()
                    && self.intent.is_none()
                    && self.heuristics.bonus_due_at().is_some_and(|due| now >= due)
                {
                    importance = Some(Importance::Low);
                }

                if let Some(importance) = importance {
                    // A newer intent supersedes the prior one after draining.
                    if self.intent.is_some() {
                        self.drain_intent(event_tx);
                    }
                    self.generation += 1;
                    let grace = intent_grace(
                        &self.config,
                        importance,
                        self.heuristics.is_in_motion(now),
                    );
                    self.intent =
                        Some(CaptureIntent::new(now, self.generation, importance, grace));
                }

                if let Some(intent) = self.intent
                    && now >= intent.poll_at
                {
                    self.process_intent(intent, now, event_tx);
                }
            }
        }
    }

    fn process_intent(
        &mut self,
        intent: CaptureIntent,
        now: Instant,
        event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>,
    ) {
        self.intent = None;

        if self.current_level == PerformanceLevel::Paused && intent.importance < Importance::High {
            self.summary.dropped += 1;
            send_event(event_tx, EngineEvent::IntentDropped { reason: DropReason::LevelPaused });
            return;
        }

        let surfaces = self.windows.surfaces();
        let target_index = self.windows.target_index();
        if surfaces.get(target_index).is_none() {
            self.summary.dropped += 1;
            send_event(event_tx, EngineEvent::IntentDropped { reason: DropReason::RenderFailed });
            return;
        }

        // High/Critical intents pay for the deep traversal budget; routine
        // ticks stay on the fast path.
        let depth = if intent.importance >= Importance::High {
            ScanDepth::Deep
        } else {
            ScanDepth::Fast
        };
        let scan = self.scanner.scan(&surfaces, target_index, depth, now);
        self.heuristics.update_with_scan(&scan, now);

        match self
            .heuristics
            .decide(intent.importance, scan.has_blocked_surfaces(), now)
        {
            Decision::RenderNow(reason) => {
                self.emit_render(&surfaces[target_index], scan, reason, event_tx);
            }
            Decision::Defer { until, reason } => {
                if until > intent.deadline {
                    debug!("defer ({reason:?}) exceeds deadline, reusing last frame");
                    self.emit_reuse(&Arc::new(scan), ReuseReason::DeadlineExpired, event_tx);
                } else {
                    let mut deferred = intent;
                    deferred.poll_at = now + self.config.poll_interval;
                    self.intent = Some(deferred);
                }
            }
            Decision::ReuseLast(reason) => {
                self.emit_reuse(&Arc::new(scan), reason, event_tx);
            }
        }
    }

    fn effective_scale(&self, level: PerformanceLevel) -> f32 {
        match level {
            PerformanceLevel::Normal => self.config.scale,
            PerformanceLevel::Reduced => self.config.scale.min(self.config.reduced_scale_cap),
            PerformanceLevel::Minimal | PerformanceLevel::Paused => {
                self.config.scale.min(self.config.minimal_scale_cap)
            }
        }
    }

    fn resample_quality(&self, level: PerformanceLevel, scale: f32) -> ResampleQuality {
        match level {
            PerformanceLevel::Normal if scale >= 0.5 => ResampleQuality::High,
            PerformanceLevel::Minimal | PerformanceLevel::Paused => ResampleQuality::Nearest,
            _ => ResampleQuality::Balanced,
        }
    }

    fn emit_render(
        &mut self,
        target: &SurfaceSnapshot,
        scan: ScanResult,
        reason: RenderReason,
        event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>,
    ) {
        let level = self.current_level;
        let native_w = (target.bounds.w * target.scale).round().max(2.0) as u32;
        let native_h = (target.bounds.h * target.scale).round().max(2.0) as u32;
        let mut buffer = self.native_pool.acquire(native_w, native_h);

        let options = RenderOptions {
            antialias: level < PerformanceLevel::Minimal,
        };
        if let Err(err) = self.renderer.render(target, options, &mut buffer) {
            debug!("render failed ({err}), falling back to reuse");
            self.native_pool.recycle(buffer);
            let scan = Arc::new(scan);
            let reusable = select_reuse_frame(&scan, self.last_frame.as_ref(), self.safe_frame.as_ref())
                .is_ok();
            if reusable {
                self.emit_reuse(&scan, ReuseReason::RenderFailed, event_tx);
            } else {
                // No prior frame: drop silently and try again shortly.
                self.summary.dropped += 1;
                send_event(
                    event_tx,
                    EngineEvent::IntentDropped { reason: DropReason::RenderFailed },
                );
                self.schedule_capture(Instant::now() + self.config.poll_interval, Importance::Low);
            }
            return;
        }

        let now = Instant::now();
        let signature = scan.layout_signature;
        let scan = Arc::new(scan);
        let frame = Arc::new(buffer);

        let surface_size = (target.bounds.w, target.bounds.h);
        let cached = CachedFrame {
            buffer: frame.clone(),
            scan: scan.clone(),
            surface_size,
        };
        if !scan.has_blocked_surfaces() {
            self.safe_frame = Some(CachedFrame {
                buffer: frame.clone(),
                scan: scan.clone(),
                surface_size,
            });
        }
        self.last_frame = Some(cached);
        self.heuristics.mark_rendered(signature, now);

        let scale = self.effective_scale(level);
        let timestamp_ms = Utc::now().timestamp_millis();
        let job = EncodeJob {
            frame,
            scan,
            timestamp_ms,
            scale,
            quality: self.resample_quality(level, scale),
            surface_size,
        };
        let _ = self.worker_tx.send(EncodeMsg::Job(Box::new(job)));

        self.summary.rendered += 1;
        send_event(event_tx, EngineEvent::FrameRendered { reason, timestamp_ms });
    }

    fn emit_reuse(
        &mut self,
        current_scan: &Arc<ScanResult>,
        reason: ReuseReason,
        event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>,
    ) {
        let selected =
            select_reuse_frame(current_scan, self.last_frame.as_ref(), self.safe_frame.as_ref());
        let (cached, reason) = match selected {
            Ok((cached, swapped)) => (cached, if swapped { ReuseReason::SafeSwap } else { reason }),
            Err(drop_reason) => {
                self.summary.dropped += 1;
                send_event(event_tx, EngineEvent::IntentDropped { reason: drop_reason });
                return;
            }
        };

        // Privacy rects on a reused frame come from the scan cached with it.
        let level = self.current_level;
        let scale = self.effective_scale(level);
        let timestamp_ms = Utc::now().timestamp_millis();
        let job = EncodeJob {
            frame: cached.buffer.clone(),
            scan: cached.scan.clone(),
            timestamp_ms,
            scale,
            quality: self.resample_quality(level, scale),
            surface_size: cached.surface_size,
        };
        let _ = self.worker_tx.send(EncodeMsg::Job(Box::new(job)));

        self.summary.reused += 1;
        send_event(event_tx, EngineEvent::FrameReused { reason, timestamp_ms });
    }

    async fn handle_feedback(
        &mut self,
        feedback: EncodeFeedback,
        event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>,
    ) {
        match feedback {
            EncodeFeedback::Appended { .. } => {
                self.consecutive_encode_failures = 0;
            }
            EncodeFeedback::Dropped { .. } => {}
            EncodeFeedback::AppendFailed { message } => {
                self.consecutive_encode_failures += 1;
                send_event(event_tx, EngineEvent::EncoderError { message: message.clone() });
                if self.consecutive_encode_failures >= 3 && self.session.is_some() {
                    send_event(
                        event_tx,
                        EngineEvent::SessionError {
                            message: CaptureError::EncoderFatal(message).to_string(),
                        },
                    );
                    self.do_stop(false, event_tx).await;
                }
            }
            EncodeFeedback::SegmentFinished(segment) => {
                self.summary.segments += 1;
                send_event(
                    event_tx,
                    EngineEvent::SegmentFinished {
                        path: segment.path,
                        frame_count: segment.frame_count,
                        start_ms: segment.start_ms,
                        end_ms: segment.end_ms,
                    },
                );
            }
        }
    }

    fn handle_upload_report(
        &mut self,
        report: UploadReport,
        event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>,
    ) {
        match report.error {
            None => {
                self.summary.uploads_completed += 1;
                send_event(
                    event_tx,
                    EngineEvent::UploadCompleted {
                        kind: report.kind,
                        segment_id: report.segment_id.unwrap_or_default(),
                    },
                );
            }
            Some(message) => {
                self.summary.uploads_failed += 1;
                send_event(event_tx, EngineEvent::UploadFailed { kind: report.kind, message });
            }
        }
    }
}

fn spawn_upload_dispatcher(
    mut segment_rx: mpsc::UnboundedReceiver<FinishedArtifacts>,
    uploader: Option<Arc<SegmentUploader>>,
    report_tx: mpsc::UnboundedSender<UploadReport>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(FinishedArtifacts { segment, hierarchy }) = segment_rx.recv().await {
            let Some(uploader) = &uploader else {
                warn!("segment finished with no uploader configured; leaving file in place");
                continue;
            };
            uploader.spawn_upload_segment(segment.clone(), Some(report_tx.clone()));
            if !hierarchy.is_empty() {
                uploader.spawn_upload_hierarchy(segment, hierarchy, Some(report_tx.clone()));
            }
        }
    })
}

fn send_event(event_tx: &Option<mpsc::UnboundedSender<EngineEvent>>, event: EngineEvent) {
    if let Some(tx) = event_tx {
        let _ = tx.send(event);
    }
}
