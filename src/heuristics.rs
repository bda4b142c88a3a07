use crate::config::CaptureConfig;
use crate::intent::Importance;
use crate::scanner::ScanResult;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderReason {
    SignatureChanged,
    Stale,
    KeyframeDue,
    Importance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseReason {
    Unchanged,
    StaleSuppressed,
    DeadlineExpired,
    RenderFailed,
    SafeSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    Touch,
    Scroll,
    Bounce,
    Refresh,
    Transition,
    Keyboard,
    Map,
    MapSettle,
    Animation,
    Churn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RenderNow(RenderReason),
    Defer { until: Instant, reason: DeferReason },
    ReuseLast(ReuseReason),
}

#[derive(Debug, Clone)]
struct Tuning {
    quiet_touch: Duration,
    quiet_scroll: Duration,
    quiet_bounce: Duration,
    quiet_refresh: Duration,
    quiet_transition: Duration,
    quiet_keyboard: Duration,
    quiet_map: Duration,
    quiet_animation: Duration,
    map_settle: Duration,
    map_recent_window: Duration,
    keyframe_min_spacing: Duration,
    keyframe_bonus_delay: Duration,
    max_pending_keyframes: u32,
    churn_window: Duration,
    max_stale: Duration,
    poll_interval: Duration,
}

/// Decides, per intent, whether to render a fresh frame, wait, or reuse the
/// previous one. Pure state machine over injected timestamps so decisions are
/// reproducible in tests.
///
/// Event timestamps come from two places: host notifications (touch, scroll,
/// navigation, keyboard, map gestures) and scan observations (bounce,
/// refresh, map camera movement, animations). Scroll is deliberately only
/// event-driven; while a scan reports a live scroll the decision defers
/// outright, and the quiet window counts from the last scroll notification.
pub struct CaptureHeuristics {
    tuning: Tuning,

    last_touch: Option<Instant>,
    last_scroll: Option<Instant>,
    last_bounce: Option<Instant>,
    last_refresh: Option<Instant>,
    last_map: Option<Instant>,
    last_transition: Option<Instant>,
    last_keyboard: Option<Instant>,
    last_animation: Option<Instant>,
    map_settle_until: Option<Instant>,
    map_recent_until: Option<Instant>,

    last_rendered_time: Option<Instant>,
    last_rendered_signature: Option<u64>,
    last_observed_signature: Option<u64>,
    last_signature_change: Option<Instant>,
    signature_churn_count: u32,
    churn_until: Option<Instant>,

    bonus_due: Option<Instant>,
    pending_keyframes: u32,
    last_keyframe_render: Option<Instant>,

    keyboard_animating: bool,
    scroll_active: bool,
    bounce_active: bool,
    refresh_active: bool,
    map_active: bool,
    animation_active: bool,
    prev_animation_ratio: f32,
}

impl CaptureHeuristics {
    pub fn new(config: &CaptureConfig) -> Self {
        Self::with_tuning(Tuning {
            quiet_touch: config.quiet.touch,
            quiet_scroll: config.quiet.scroll,
            quiet_bounce: config.quiet.bounce,
            quiet_refresh: config.quiet.refresh,
            quiet_transition: config.quiet.transition,
            quiet_keyboard: config.quiet.keyboard,
            quiet_map: config.quiet.map,
            quiet_animation: config.quiet.animation,
            map_settle: config.quiet.map_settle,
            map_recent_window: config.map_recent_window,
            keyframe_min_spacing: config.keyframe_min_spacing,
            keyframe_bonus_delay: config.keyframe_bonus_delay,
            max_pending_keyframes: config.max_pending_keyframes,
            churn_window: config.churn_window,
            max_stale: config.max_stale,
            poll_interval: config.poll_interval,
        })
    }

    fn with_tuning(tuning: Tuning) -> Self {
        Self {
            tuning,
            last_touch: None,
            last_scroll: None,
            last_bounce: None,
            last_refresh: None,
            last_map: None,
            last_transition: None,
            last_keyboard: None,
            last_animation: None,
            map_settle_until: None,
            map_recent_until: None,
            last_rendered_time: None,
            last_rendered_signature: None,
            last_observed_signature: None,
            last_signature_change: None,
            signature_churn_count: 0,
            churn_until: None,
            bonus_due: None,
            pending_keyframes: 0,
            last_keyframe_render: None,
            keyboard_animating: false,
            scroll_active: false,
            bounce_active: false,
            refresh_active: false,
            map_active: false,
            animation_active: false,
            prev_animation_ratio: 0.0,
        }
    }

    /// Clears all motion and signature state, e.g. across pause/resume.
    pub fn reset(&mut self) {
        *self = Self::with_tuning(self.tuning.clone());
    }

    pub fn note_touch(&mut self, now: Instant) {
        self.last_touch = Some(now);
        self.schedule_bonus(now);
    }

    pub fn note_scroll(&mut self, now: Instant) {
        self.last_scroll = Some(now);
        self.last_touch = Some(now);
    }

    pub fn note_map_gesture(&mut self, now: Instant) {
        self.last_map = Some(now);
        self.map_settle_until = Some(now + self.tuning.map_settle);
    }

    /// Navigation invalidates the signature; the engine's defensive High
    /// capture is the navigation keyframe, so no bonus is queued here.
    pub fn note_navigation(&mut self, now: Instant) {
        self.last_transition = Some(now);
        self.invalidate_signature();
    }

    pub fn note_keyboard(&mut self, now: Instant, animating: bool) {
        self.last_keyboard = Some(now);
        let ended = self.keyboard_animating && !animating;
        self.keyboard_animating = animating;
        if ended {
            self.schedule_bonus(now);
        }
    }

    pub fn invalidate_signature(&mut self) {
        self.last_rendered_signature = None;
    }

    /// True when a map surface appeared in a recent scan; the engine uses
    /// this to classify pan/pinch/swipe/drag gestures as map gestures.
    pub fn map_recently_seen(&self, now: Instant) -> bool {
        self.map_recent_until.is_some_and(|until| now <= until)
    }

    /// True while motion is live enough that intent deadlines should shrink.
    pub fn is_in_motion(&self, now: Instant) -> bool {
        self.scroll_active
            || self.keyboard_animating
            || self.animation_active
            || self.churn_until.is_some_and(|until| now < until)
    }

    pub fn pending_keyframes(&self) -> u32 {
        self.pending_keyframes
    }

    pub fn signature_churn_count(&self) -> u32 {
        self.signature_churn_count
    }

    /// Next moment a bonus keyframe wants an intent, for scheduler wakeups.
    /// Pushed past the minimum keyframe spacing so an overdue bonus cannot
    /// re-trigger before it is allowed to render.
    pub fn bonus_due_at(&self) -> Option<Instant> {
        if self.pending_keyframes == 0 {
            return None;
        }
        let due = self.bonus_due?;
        Some(match self.last_keyframe_render {
            Some(at) => due.max(at + self.tuning.keyframe_min_spacing),
            None => due,
        })
    }

    /// Folds one scan into the motion state. Safe to call repeatedly with
    /// the same scan; only transitions have side effects.
    pub fn update_with_scan(&mut self, scan: &ScanResult, now: Instant) {
        let scroll_ended = self.scroll_active && !scan.scroll_active;
        let refresh_ended = self.refresh_active && !scan.refresh_active;
        let map_ended = self.map_active && !scan.map_active;
        let large_animation_ended =
            self.animation_active && !scan.has_any_animations && self.prev_animation_ratio > 0.2;

        self.scroll_active = scan.scroll_active;
        self.bounce_active = scan.bounce_active;
        self.refresh_active = scan.refresh_active;
        self.map_active = scan.map_active;
        self.animation_active = scan.has_any_animations;

        if scan.bounce_active {
            self.last_bounce = Some(now);
        }
        if scan.refresh_active {
            self.last_refresh = Some(now);
        }
        if scan.map_active {
            self.last_map = Some(now);
        }
        if scan.has_any_animations {
            self.last_animation = Some(now);
            self.prev_animation_ratio = scan.animation_area_ratio;
        }
        if !scan.map_view_handles.is_empty() {
            self.map_recent_until = Some(now + self.tuning.map_recent_window);
        }

        if scroll_ended || refresh_ended || map_ended || large_animation_ended {
            self.schedule_bonus(now);
        }

        // Signature churn: two changes inside the window flag the layout as
        // thrashing; rendering waits until it stops. Live scrolls mutate the
        // signature by nature and are governed by the scroll gate instead.
        if self.last_observed_signature != Some(scan.layout_signature) {
            if !scan.scroll_active
                && let Some(previous_change) = self.last_signature_change
                && now.duration_since(previous_change) <= self.tuning.churn_window
            {
                self.signature_churn_count += 1;
                self.churn_until = Some(now + self.tuning.churn_window);
            }
            self.last_signature_change = Some(now);
            self.last_observed_signature = Some(scan.layout_signature);
        }

        if scan.did_bail_out_early && self.churn_until.is_some_and(|until| now < until) {
            // A thrashing tree that also blew the scan budget is treated as
            // an active animation.
            self.last_animation = Some(now);
            self.animation_active = true;
        }
    }

    fn schedule_bonus(&mut self, now: Instant) {
        if self.pending_keyframes < self.tuning.max_pending_keyframes {
            self.pending_keyframes += 1;
        }
        let due = now + self.tuning.keyframe_bonus_delay;
        self.bonus_due = Some(match self.bonus_due {
            Some(existing) if existing > now && existing < due => existing,
            _ => due,
        });
    }

    fn quiet_blockers(&self, importance: Importance, now: Instant) -> Option<(Instant, DeferReason)> {
        let mut worst: Option<(Instant, DeferReason)> = None;
        let mut consider = |until: Option<Instant>, reason: DeferReason| {
            if let Some(until) = until
                && until > now
                && worst.map_or(true, |(existing, _)| until > existing)
            {
                worst = Some((until, reason));
            }
        };

        let window = |last: Option<Instant>, quiet: Duration| last.map(|at| at + quiet);
        let live = Some(now + self.tuning.poll_interval);

        // Scroll blocks every importance; map settling blocks all but High.
        if self.scroll_active {
            consider(live, DeferReason::Scroll);
        }
        consider(window(self.last_scroll, self.tuning.quiet_scroll), DeferReason::Scroll);
        if importance == Importance::High {
            return worst;
        }

        consider(self.map_settle_until, DeferReason::MapSettle);
        if importance == Importance::Critical {
            return worst;
        }

        consider(window(self.last_touch, self.tuning.quiet_touch), DeferReason::Touch);
        if self.bounce_active {
            consider(live, DeferReason::Bounce);
        }
        consider(window(self.last_bounce, self.tuning.quiet_bounce), DeferReason::Bounce);
        if self.refresh_active {
            consider(live, DeferReason::Refresh);
        }
        consider(window(self.last_refresh, self.tuning.quiet_refresh), DeferReason::Refresh);
        if self.map_active {
            consider(live, DeferReason::Map);
        }
        consider(window(self.last_map, self.tuning.quiet_map), DeferReason::Map);
        consider(window(self.last_transition, self.tuning.quiet_transition), DeferReason::Transition);
        if self.keyboard_animating {
            consider(live, DeferReason::Keyboard);
        }
        consider(window(self.last_keyboard, self.tuning.quiet_keyboard), DeferReason::Keyboard);
        consider(window(self.last_animation, self.tuning.quiet_animation), DeferReason::Animation);
        consider(self.churn_until, DeferReason::Churn);
        worst
    }

    /// The per-intent decision. `has_live_blocked` reflects whether the scan
    /// that accompanies this intent saw a camera/web/video surface.
    pub fn decide(&self, importance: Importance, has_live_blocked: bool, now: Instant) -> Decision {
        if let Some((until, reason)) = self.quiet_blockers(importance, now) {
            return Decision::Defer { until, reason };
        }

        let signature_changed = match (self.last_rendered_signature, self.last_observed_signature) {
            (Some(rendered), Some(observed)) => rendered != observed,
            _ => true,
        };
        let stale = self
            .last_rendered_time
            .is_none_or(|at| now.duration_since(at) >= self.tuning.max_stale);
        let keyframe_due = self.pending_keyframes > 0
            && self.bonus_due.is_some_and(|due| now >= due)
            && self
                .last_keyframe_render
                .is_none_or(|at| now.duration_since(at) >= self.tuning.keyframe_min_spacing);

        if signature_changed {
            return Decision::RenderNow(RenderReason::SignatureChanged);
        }
        if importance >= Importance::High {
            return Decision::RenderNow(RenderReason::Importance);
        }
        if keyframe_due {
            return Decision::RenderNow(RenderReason::KeyframeDue);
        }
        if stale {
            if has_live_blocked {
                // Live video/web/camera already shows motion; re-rendering an
                // otherwise unchanged tree just adds flicker.
                return Decision::ReuseLast(ReuseReason::StaleSuppressed);
            }
            return Decision::RenderNow(RenderReason::Stale);
        }
        Decision::ReuseLast(ReuseReason::Unchanged)
    }

    /// Records an emitted render.
    pub fn mark_rendered(&mut self, signature: u64, now: Instant) {
        self.last_rendered_signature = Some(signature);
        self.last_rendered_time = Some(now);
        self.last_keyframe_render = Some(now);
        if self.pending_keyframes > 0 {
            self.pending_keyframes -= 1;
            self.bonus_due = if self.pending_keyframes > 0 {
                Some(now + self.tuning.keyframe_bonus_delay)
            } else {
                None
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CaptureHeuristics, Decision, DeferReason, RenderReason, ReuseReason};
    use crate::config::CaptureConfig;
    use crate::intent::Importance;
    use crate::scanner::ScanResult;
    use std::time::Duration;
    use tokio::time::Instant;

    fn quiet_scan(signature: u64, now: Instant) -> ScanResult {
        let mut scan = blank_scan(now);
        scan.layout_signature = signature;
        scan
    }

    fn blank_scan(now: Instant) -> ScanResult {
        ScanResult {
            layout_signature: 0,
            text_input_rects: Vec::new(),
            camera_rects: Vec::new(),
            webview_rects: Vec::new(),
            video_rects: Vec::new(),
            occluded_rects: Vec::new(),
            map_view_rects: Vec::new(),
            map_view_handles: Vec::new(),
            scroll_view_handles: Vec::new(),
            animated_view_handles: Vec::new(),
            scroll_active: false,
            bounce_active: false,
            refresh_active: false,
            map_active: false,
            has_any_animations: false,
            animation_area_ratio: 0.0,
            did_bail_out_early: false,
            total_views_scanned: 1,
            scan_timestamp: now,
        }
    }

    fn heuristics() -> CaptureHeuristics {
        CaptureHeuristics::new(&CaptureConfig::default())
    }

    #[test]
    fn first_intent_renders_then_unchanged_signature_reuses() {
        let mut h = heuristics();
        let t0 = Instant::now();
        h.update_with_scan(&quiet_scan(0xABCD, t0), t0);
        assert_eq!(
            h.decide(Importance::Low, false, t0),
            Decision::RenderNow(RenderReason::SignatureChanged)
        );
        h.mark_rendered(0xABCD, t0);

        let t1 = t0 + Duration::from_secs(1);
        h.update_with_scan(&quiet_scan(0xABCD, t1), t1);
        assert_eq!(
            h.decide(Importance::Low, false, t1),
            Decision::ReuseLast(ReuseReason::Unchanged)
        );
    }

    #[test]
    fn stale_frames_force_a_render_unless_a_live_surface_suppresses() {
        let mut h = heuristics();
        let t0 = Instant::now();
        h.update_with_scan(&quiet_scan(7, t0), t0);
        h.mark_rendered(7, t0);

        let later = t0 + Duration::from_secs(5);
        h.update_with_scan(&quiet_scan(7, later), later);
        assert_eq!(
            h.decide(Importance::Low, false, later),
            Decision::RenderNow(RenderReason::Stale)
        );
        assert_eq!(
            h.decide(Importance::Low, true, later),
            Decision::ReuseLast(ReuseReason::StaleSuppressed)
        );
    }

    #[test]
    fn live_scroll_defers_and_quiet_window_counts_from_the_gesture() {
        let mut h = heuristics();
        let t0 = Instant::now();
        h.note_scroll(t0);

        let mut scrolling = quiet_scan(9, t0);
        scrolling.scroll_active = true;
        h.update_with_scan(&scrolling, t0);

        match h.decide(Importance::Low, false, t0 + Duration::from_millis(500)) {
            Decision::Defer { reason: DeferReason::Scroll, .. } => {}
            other => panic!("expected scroll defer, got {other:?}"),
        }

        // Scroll stops being observed; the gesture quiet window has passed.
        let settled_at = t0 + Duration::from_millis(800);
        h.update_with_scan(&quiet_scan(9, settled_at), settled_at);
        assert!(matches!(
            h.decide(Importance::Low, false, settled_at),
            Decision::RenderNow(_)
        ));
    }

    #[test]
    fn importance_bypasses_everything_but_scroll_and_map_settle() {
        let mut h = heuristics();
        let t0 = Instant::now();
        h.note_touch(t0);
        h.note_keyboard(t0, true);
        h.note_map_gesture(t0);

        let shortly = t0 + Duration::from_millis(10);
        // Low importance is blocked.
        assert!(matches!(h.decide(Importance::Low, false, shortly), Decision::Defer { .. }));
        // High skips every gate except scroll, map settle included.
        assert!(matches!(h.decide(Importance::High, false, shortly), Decision::RenderNow(_)));
        // Critical still waits for the map camera to settle.
        match h.decide(Importance::Critical, false, shortly) {
            Decision::Defer { reason: DeferReason::MapSettle, .. } => {}
            other => panic!("expected map-settle defer, got {other:?}"),
        }

        // A live scroll blocks every importance; for High it is the only
        // gate, so the defer reason is the scroll itself.
        let mut scrolling = blank_scan(shortly);
        scrolling.scroll_active = true;
        h.update_with_scan(&scrolling, shortly);
        assert!(matches!(
            h.decide(Importance::High, false, shortly),
            Decision::Defer { reason: DeferReason::Scroll, .. }
        ));
        assert!(matches!(
            h.decide(Importance::Critical, false, shortly),
            Decision::Defer { .. }
        ));
    }

    #[test]
    fn signature_churn_blocks_until_the_window_expires() {
        let mut h = heuristics();
        let t0 = Instant::now();
        h.update_with_scan(&quiet_scan(1, t0), t0);
        h.mark_rendered(1, t0);

        let t1 = t0 + Duration::from_millis(100);
        h.update_with_scan(&quiet_scan(2, t1), t1);
        let t2 = t1 + Duration::from_millis(100);
        h.update_with_scan(&quiet_scan(3, t2), t2);
        assert!(h.signature_churn_count() >= 1);

        match h.decide(Importance::Low, false, t2) {
            Decision::Defer { reason: DeferReason::Churn, .. } => {}
            other => panic!("expected churn defer, got {other:?}"),
        }

        let calm = t2 + Duration::from_millis(300);
        h.update_with_scan(&quiet_scan(3, calm), calm);
        assert!(matches!(h.decide(Importance::Low, false, calm), Decision::RenderNow(_)));
    }

    #[test]
    fn bailed_scan_during_churn_asserts_animation_blocking() {
        let mut h = heuristics();
        let t0 = Instant::now();
        h.update_with_scan(&quiet_scan(1, t0), t0);
        let t1 = t0 + Duration::from_millis(50);
        h.update_with_scan(&quiet_scan(2, t1), t1);
        let t2 = t1 + Duration::from_millis(50);
        let mut bailed = quiet_scan(3, t2);
        bailed.did_bail_out_early = true;
        h.update_with_scan(&bailed, t2);

        assert!(h.is_in_motion(t2));
        match h.decide(Importance::Low, false, t2 + Duration::from_millis(1)) {
            Decision::Defer { .. } => {}
            other => panic!("expected defer, got {other:?}"),
        }
    }

    #[test]
    fn bonus_keyframes_cap_at_three_and_drain_per_render() {
        let mut h = heuristics();
        let t0 = Instant::now();
        for _ in 0..5 {
            h.note_touch(t0);
        }
        assert_eq!(h.pending_keyframes(), 3);

        let due = t0 + Duration::from_millis(200);
        h.update_with_scan(&quiet_scan(4, due), due);
        h.mark_rendered(4, due);
        assert_eq!(h.pending_keyframes(), 2);
        assert!(h.bonus_due_at().is_some());
    }

    #[test]
    fn keyframe_due_renders_despite_unchanged_signature() {
        let mut h = heuristics();
        let t0 = Instant::now();
        h.update_with_scan(&quiet_scan(5, t0), t0);
        h.mark_rendered(5, t0);

        h.note_touch(t0);
        // Past the touch quiet window, past the bonus delay, same signature.
        let due = t0 + Duration::from_millis(300);
        h.update_with_scan(&quiet_scan(5, due), due);
        assert_eq!(
            h.decide(Importance::Low, false, due),
            Decision::RenderNow(RenderReason::KeyframeDue)
        );
    }

    #[test]
    fn update_with_scan_is_idempotent_for_identical_input() {
        let mut h = heuristics();
        let t0 = Instant::now();
        let scan = quiet_scan(6, t0);
        h.update_with_scan(&scan, t0);
        let first = h.decide(Importance::Low, false, t0);
        h.update_with_scan(&scan, t0);
        let second = h.decide(Importance::Low, false, t0);
        assert_eq!(first, second);
        assert_eq!(h.signature_churn_count(), 0);
    }

    #[test]
    fn map_recency_classification_window() {
        let mut h = heuristics();
        let t0 = Instant::now();
        let mut scan = quiet_scan(8, t0);
        scan.map_view_handles.push(44);
        h.update_with_scan(&scan, t0);

        assert!(h.map_recently_seen(t0 + Duration::from_secs(1)));
        assert!(!h.map_recently_seen(t0 + Duration::from_secs(3)));
    }
}
