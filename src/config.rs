use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Quiet windows the heuristics wait out after each kind of motion before a
/// render is considered safe.
#[derive(Debug, Clone)]
pub struct QuietWindows {
    pub touch: Duration,
    pub scroll: Duration,
    pub bounce: Duration,
    pub refresh: Duration,
    pub transition: Duration,
    pub keyboard: Duration,
    pub map: Duration,
    pub animation: Duration,
    pub map_settle: Duration,
}

impl Default for QuietWindows {
    fn default() -> Self {
        Self {
            touch: Duration::from_millis(120),
            scroll: Duration::from_millis(200),
            bounce: Duration::from_millis(200),
            refresh: Duration::from_millis(220),
            transition: Duration::from_millis(100),
            keyboard: Duration::from_millis(250),
            map: Duration::from_millis(550),
            animation: Duration::from_millis(250),
            map_settle: Duration::from_millis(800),
        }
    }
}

/// Traversal ceilings for the view hierarchy scanner.
#[derive(Debug, Clone)]
pub struct ScanBudgets {
    pub fast_max_depth: u32,
    pub deep_max_depth: u32,
    pub fast_max_views: u32,
    pub deep_max_views: u32,
    pub max_scan_time: Duration,
    pub sweep_time: Duration,
    pub sweep_max_views: u32,
    /// Elapsed time is checked once per this many visited views.
    pub time_check_interval: u32,
}

impl Default for ScanBudgets {
    fn default() -> Self {
        Self {
            fast_max_depth: 8,
            deep_max_depth: 25,
            fast_max_views: 500,
            deep_max_views: 2000,
            max_scan_time: Duration::from_millis(30),
            sweep_time: Duration::from_millis(10),
            sweep_max_views: 2000,
            time_check_interval: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub max_retries: u32,
    /// Backoff unit; the n-th retry waits `backoff_base * 2^n`.
    pub backoff_base: Duration,
    pub complete_backoff_cap: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub delete_after_upload: bool,
    pub orphan_max_age: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            complete_backoff_cap: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
            delete_after_upload: true,
            orphan_max_age: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub sample_interval: Duration,
    pub memory_resident_limit_bytes: u64,
    pub battery_low_fraction: f32,
    pub cpu_ema_alpha: f32,
    pub cpu_critical_percent: f32,
    pub cpu_high_percent: f32,
    pub cpu_normal_percent: f32,
    /// Consecutive high samples required before a CPU-driven promotion.
    pub cpu_promote_samples: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            memory_resident_limit_bytes: 200 * 1024 * 1024,
            battery_low_fraction: 0.20,
            cpu_ema_alpha: 0.3,
            cpu_critical_percent: 90.0,
            cpu_high_percent: 60.0,
            cpu_normal_percent: 40.0,
            cpu_promote_samples: 3,
        }
    }
}

/// Everything tunable about a capture session. Defaults match production.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Intent clock rate. Replay is low-rate by design.
    pub video_fps: f32,
    /// Downscale applied to the native surface before encoding, further
    /// capped by the performance level.
    pub scale: f32,
    pub reduced_scale_cap: f32,
    pub minimal_scale_cap: f32,
    /// Grace after `start_session` before the first capture.
    pub warmup: Duration,
    pub poll_interval: Duration,
    pub grace_baseline: Duration,
    pub grace_motion: Duration,
    pub grace_high: Duration,
    pub max_stale: Duration,
    pub navigation_capture_delay: Duration,
    pub scroll_capture_delay: Duration,
    pub interaction_capture_delay: Duration,
    pub map_gesture_capture_delay: Duration,
    /// A pan/pinch/swipe/drag counts as a map gesture if a map surface was
    /// seen within this window.
    pub map_recent_window: Duration,
    pub keyframe_min_spacing: Duration,
    pub keyframe_bonus_delay: Duration,
    pub max_pending_keyframes: u32,
    pub churn_window: Duration,
    pub quiet: QuietWindows,
    pub scan: ScanBudgets,
    /// Privacy rects smaller than this (pt^2) are dropped.
    pub min_masked_area: f32,
    pub frames_per_segment: u32,
    /// Bitrate at 1280x720; scaled by actual pixel count and clamped.
    pub target_bitrate: u32,
    pub min_dimension: u32,
    pub pool_capacity: usize,
    pub stop_timeout: Duration,
    pub emergency_flush_budget: Duration,
    pub uploader: UploaderConfig,
    pub performance: PerformanceConfig,
    /// Accessibility identifiers that must always be masked.
    pub masked_identifiers: HashSet<String>,
    pub segment_dir: std::path::PathBuf,
    pub caches_dir: std::path::PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            video_fps: 1.0,
            scale: 0.5,
            reduced_scale_cap: 0.25,
            minimal_scale_cap: 0.15,
            warmup: Duration::from_millis(300),
            poll_interval: Duration::from_millis(80),
            grace_baseline: Duration::from_millis(900),
            grace_motion: Duration::from_millis(300),
            grace_high: Duration::from_millis(100),
            max_stale: Duration::from_secs(5),
            navigation_capture_delay: Duration::from_millis(200),
            scroll_capture_delay: Duration::from_millis(200),
            interaction_capture_delay: Duration::from_millis(150),
            map_gesture_capture_delay: Duration::from_millis(550),
            map_recent_window: Duration::from_secs(2),
            keyframe_min_spacing: Duration::from_millis(250),
            keyframe_bonus_delay: Duration::from_millis(150),
            max_pending_keyframes: 3,
            churn_window: Duration::from_millis(250),
            quiet: QuietWindows::default(),
            scan: ScanBudgets::default(),
            min_masked_area: 100.0,
            frames_per_segment: 60,
            target_bitrate: 1_000_000,
            min_dimension: 100,
            pool_capacity: 10,
            stop_timeout: Duration::from_secs(5),
            emergency_flush_budget: Duration::from_millis(500),
            uploader: UploaderConfig::default(),
            performance: PerformanceConfig::default(),
            masked_identifiers: HashSet::new(),
            segment_dir: crate::paths::default_segment_dir(),
            caches_dir: crate::paths::default_caches_dir(),
        }
    }
}

impl CaptureConfig {
    /// Keyframe cadence in frames (one IDR roughly every 10 s).
    pub fn keyframe_interval(&self) -> u32 {
        ((self.video_fps * 10.0).round() as u32).max(1)
    }

    /// Applies an on-disk TOML overlay if one exists at `path`.
    ///
    /// Only the fields operators actually tune are exposed; everything else
    /// keeps its default. A missing file is not an error.
    pub fn with_overlay(mut self, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(self);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config overlay {}", path.display()))?;
        let overlay: ConfigOverlay = toml::from_str(&text)
            .with_context(|| format!("failed to parse config overlay {} (expected TOML)", path.display()))?;

        if let Some(fps) = overlay.video_fps {
            self.video_fps = fps;
        }
        if let Some(scale) = overlay.scale {
            self.scale = scale.clamp(0.05, 1.0);
        }
        if let Some(frames) = overlay.frames_per_segment {
            self.frames_per_segment = frames.max(1);
        }
        if let Some(bitrate) = overlay.target_bitrate {
            self.target_bitrate = bitrate;
        }
        if let Some(retries) = overlay.max_upload_retries {
            self.uploader.max_retries = retries;
        }
        if let Some(delete) = overlay.delete_after_upload {
            self.uploader.delete_after_upload = delete;
        }
        if !overlay.masked_identifiers.is_empty() {
            self.masked_identifiers.extend(overlay.masked_identifiers);
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigOverlay {
    #[serde(default)]
    video_fps: Option<f32>,
    #[serde(default)]
    scale: Option<f32>,
    #[serde(default)]
    frames_per_segment: Option<u32>,
    #[serde(default)]
    target_bitrate: Option<u32>,
    #[serde(default)]
    max_upload_retries: Option<u32>,
    #[serde(default)]
    delete_after_upload: Option<bool>,
    #[serde(default)]
    masked_identifiers: Vec<String>,
}
