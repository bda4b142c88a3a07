use crate::config::ScanBudgets;
use crate::geometry::Rect;
use crate::surface::{
    BlockedSurfaceKind, ClassResolver, GesturePhase, SurfaceSnapshot, ViewNode,
};
use log::debug;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

/// Accessibility hint reserved for host apps to force-mask a view.
pub const OCCLUDE_HINT: &str = "occlude";

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Order-stable FNV-1a accumulator for layout signatures.
struct SigHasher(u64);

impl SigHasher {
    fn new() -> Self {
        Self(FNV_OFFSET)
    }

    fn mix_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn mix_u64(&mut self, v: u64) {
        self.mix_bytes(&v.to_le_bytes());
    }

    fn mix_i32(&mut self, v: i32) {
        self.mix_bytes(&v.to_le_bytes());
    }

    fn finish(self) -> u64 {
        self.0
    }
}

fn fnv1a_str(s: &str) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in s.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Output of a single scan pass over the visible surfaces. All rects are in
/// the target surface's point space.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub layout_signature: u64,
    pub text_input_rects: Vec<Rect>,
    pub camera_rects: Vec<Rect>,
    pub webview_rects: Vec<Rect>,
    pub video_rects: Vec<Rect>,
    pub occluded_rects: Vec<Rect>,
    pub map_view_rects: Vec<Rect>,
    pub map_view_handles: Vec<u64>,
    pub scroll_view_handles: Vec<u64>,
    pub animated_view_handles: Vec<u64>,
    pub scroll_active: bool,
    pub bounce_active: bool,
    pub refresh_active: bool,
    pub map_active: bool,
    pub has_any_animations: bool,
    pub animation_area_ratio: f32,
    pub did_bail_out_early: bool,
    pub total_views_scanned: u32,
    pub scan_timestamp: Instant,
}

impl ScanResult {
    fn empty(now: Instant) -> Self {
        Self {
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
            total_views_scanned: 0,
            scan_timestamp: now,
        }
    }

    /// Every region that must be opaquely masked before encoding.
    pub fn privacy_rects(&self) -> impl Iterator<Item = &Rect> {
        self.text_input_rects
            .iter()
            .chain(self.camera_rects.iter())
            .chain(self.webview_rects.iter())
            .chain(self.video_rects.iter())
            .chain(self.occluded_rects.iter())
    }

    pub fn has_privacy_regions(&self) -> bool {
        self.privacy_rects().next().is_some()
    }

    /// True when the frame contains a surface whose pixels change outside the
    /// view tree (camera preview, web content, video playback).
    pub fn has_blocked_surfaces(&self) -> bool {
        !self.camera_rects.is_empty() || !self.webview_rects.is_empty() || !self.video_rects.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDepth {
    Fast,
    Deep,
}

#[derive(Debug, Clone, Copy)]
struct ScrollSample {
    offset: (f32, f32),
    insets: (f32, f32, f32, f32),
}

/// Single-pass view hierarchy scanner.
///
/// One instance per engine; it keeps per-handle motion state (previous scroll
/// offsets, previous map camera signatures) across scans and a shared class
/// capability cache. Traversal is bounded by depth, view count and wall time;
/// a bailed-out pass that found no privacy regions is followed by a tighter
/// privacy-only sweep so masking fails closed.
pub struct Scanner {
    resolver: Arc<ClassResolver>,
    masked_identifiers: HashSet<String>,
    budgets: ScanBudgets,
    min_masked_area: f32,
    prev_scroll: HashMap<u64, ScrollSample>,
    prev_map_sigs: HashMap<u64, u64>,
}

struct Walk<'a> {
    result: ScanResult,
    sig: SigHasher,
    target_bounds: Rect,
    started: std::time::Instant,
    budget_depth: u32,
    budget_views: u32,
    time_check_interval: u32,
    max_scan_time: std::time::Duration,
    animated_area: f32,
    next_scroll: HashMap<u64, ScrollSample>,
    next_map_sigs: HashMap<u64, u64>,
    scanner: &'a Scanner,
}

impl Scanner {
    pub fn new(
        resolver: Arc<ClassResolver>,
        budgets: ScanBudgets,
        masked_identifiers: HashSet<String>,
        min_masked_area: f32,
    ) -> Self {
        Self {
            resolver,
            masked_identifiers,
            budgets,
            min_masked_area,
            prev_scroll: HashMap::new(),
            prev_map_sigs: HashMap::new(),
        }
    }

    /// Drops all cross-scan motion state, e.g. on pause/resume.
    pub fn reset(&mut self) {
        self.prev_scroll.clear();
        self.prev_map_sigs.clear();
    }

    pub fn scan(
        &mut self,
        surfaces: &[SurfaceSnapshot],
        target_index: usize,
        depth: ScanDepth,
        now: Instant,
    ) -> ScanResult {
        let Some(target) = surfaces.get(target_index) else {
            return ScanResult::empty(now);
        };

        let (budget_depth, budget_views) = match depth {
            ScanDepth::Fast => (self.budgets.fast_max_depth, self.budgets.fast_max_views),
            ScanDepth::Deep => (self.budgets.deep_max_depth, self.budgets.deep_max_views),
        };

        let mut walk = Walk {
            result: ScanResult::empty(now),
            sig: SigHasher::new(),
            target_bounds: target.bounds,
            started: std::time::Instant::now(),
            budget_depth,
            budget_views,
            time_check_interval: self.budgets.time_check_interval.max(1),
            max_scan_time: self.budgets.max_scan_time,
            animated_area: 0.0,
            next_scroll: HashMap::new(),
            next_map_sigs: HashMap::new(),
            scanner: self,
        };

        let target_origin = target.screen_origin;
        'surfaces: for surface in surfaces {
            let dx = surface.screen_origin.0 - target_origin.0;
            let dy = surface.screen_origin.1 - target_origin.1;
            if !walk.visit(&surface.root, 0, dx, dy) {
                break 'surfaces;
            }
        }

        let Walk {
            mut result,
            sig,
            target_bounds,
            animated_area,
            next_scroll,
            next_map_sigs,
            ..
        } = walk;
        result.layout_signature = sig.finish();
        result.animation_area_ratio = if target_bounds.area() > 0.0 {
            (animated_area / target_bounds.area()).clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.prev_scroll = next_scroll;
        self.prev_map_sigs = next_map_sigs;

        if result.did_bail_out_early && !result.has_privacy_regions() {
            debug!(
                "scan bailed out after {} views with no privacy regions; running privacy sweep",
                result.total_views_scanned
            );
            self.privacy_sweep(surfaces, target_index, &mut result);
        }

        result
    }

    /// Breadth-first fail-closed pass collecting only privacy regions, run
    /// when the main scan bailed out before recording any.
    fn privacy_sweep(&self, surfaces: &[SurfaceSnapshot], target_index: usize, result: &mut ScanResult) {
        let Some(target) = surfaces.get(target_index) else {
            return;
        };
        let target_bounds = target.bounds;
        let started = std::time::Instant::now();
        let mut visited: u32 = 0;

        let mut queue: VecDeque<(&ViewNode, f32, f32)> = VecDeque::new();
        for surface in surfaces {
            let dx = surface.screen_origin.0 - target.screen_origin.0;
            let dy = surface.screen_origin.1 - target.screen_origin.1;
            queue.push_back((&surface.root, dx, dy));
        }

        while let Some((node, dx, dy)) = queue.pop_front() {
            visited += 1;
            if visited >= self.budgets.sweep_max_views {
                break;
            }
            if visited % self.budgets.time_check_interval.max(1) == 0
                && started.elapsed() > self.budgets.sweep_time
            {
                break;
            }
            if node.hidden {
                continue;
            }

            let frame = node.frame.sanitized().offset(dx, dy);
            let caps = self.resolver.resolve(node.class);
            if let Some(rect) = self.accepted_rect(frame, &target_bounds) {
                if caps.is_text_input || node.text.is_some_and(|t| t.editable) {
                    result.text_input_rects.push(rect);
                }
                match caps.blocked_surface {
                    Some(BlockedSurfaceKind::Camera) => result.camera_rects.push(rect),
                    Some(BlockedSurfaceKind::WebView) => result.webview_rects.push(rect),
                    Some(BlockedSurfaceKind::Video) => result.video_rects.push(rect),
                    None => {}
                }
                if self.is_occluded(node) {
                    result.occluded_rects.push(rect);
                }
            }

            for child in &node.children {
                queue.push_back((child, dx, dy));
            }
        }
    }

    fn is_occluded(&self, node: &ViewNode) -> bool {
        node.accessibility_hint.as_deref() == Some(OCCLUDE_HINT)
            || node
                .accessibility_identifier
                .as_ref()
                .is_some_and(|id| self.masked_identifiers.contains(id))
    }

    fn accepted_rect(&self, frame: Rect, target_bounds: &Rect) -> Option<Rect> {
        if !frame.is_finite() {
            return None;
        }
        let frame = frame.sanitized();
        if frame.area() <= self.min_masked_area || !frame.intersects(target_bounds) {
            return None;
        }
        Some(frame)
    }
}

impl<'a> Walk<'a> {
    /// Visits one node and its children. Returns false when the pass must
    /// stop (count or time budget exhausted).
    fn visit(&mut self, node: &ViewNode, depth: u32, dx: f32, dy: f32) -> bool {
        if self.result.total_views_scanned >= self.budget_views {
            self.result.did_bail_out_early = true;
            return false;
        }
        self.result.total_views_scanned += 1;
        if self.result.total_views_scanned % self.time_check_interval == 0
            && self.started.elapsed() > self.max_scan_time
        {
            self.result.did_bail_out_early = true;
            return false;
        }

        let frame = node.frame.sanitized().offset(dx, dy);

        // Signature mix, fixed field order. Class identity rather than name
        // keeps the per-node cost O(1).
        self.sig.mix_u64(depth as u64);
        self.sig.mix_u64(node.class.0);
        self.sig.mix_i32(frame.x.round() as i32);
        self.sig.mix_i32(frame.y.round() as i32);
        self.sig.mix_i32(frame.w.round() as i32);
        self.sig.mix_i32(frame.h.round() as i32);
        if let Some(scroll) = &node.scroll {
            self.sig.mix_i32((scroll.offset.0 * 100.0) as i32);
            self.sig.mix_i32((scroll.offset.1 * 100.0) as i32);
            self.sig.mix_i32((scroll.insets.0 * 100.0) as i32);
            self.sig.mix_i32((scroll.insets.1 * 100.0) as i32);
            self.sig.mix_i32((scroll.insets.2 * 100.0) as i32);
            self.sig.mix_i32((scroll.insets.3 * 100.0) as i32);
        }
        if let Some(text) = &node.text {
            self.sig.mix_u64(text.len as u64);
            if !text.editable {
                self.sig.mix_u64(text.hash);
            }
        }
        if let Some(label) = &node.accessibility_label {
            self.sig.mix_u64(fnv1a_str(label));
        }
        if let Some(image) = node.image_id {
            self.sig.mix_u64(image);
        }
        if let Some(bg) = node.background_rgba {
            self.sig.mix_u64(bg as u64);
        }
        if let Some(tint) = node.tint_rgba {
            self.sig.mix_u64(tint as u64);
        }
        self.sig.mix_i32((node.alpha * 100.0) as i32);
        self.sig.mix_u64(node.hidden as u64);
        if let Some(map) = &node.map
            && let Some(camera) = &map.camera
        {
            self.sig.mix_u64(camera.signature());
        }

        // Hidden subtrees contribute identity to the signature but nothing
        // else, matching what actually reaches the screen.
        if node.hidden {
            return true;
        }

        let caps = self.scanner.resolver.resolve(node.class);
        let accepted = self.scanner.accepted_rect(frame, &self.target_bounds);

        if let Some(rect) = accepted {
            if caps.is_text_input || node.text.is_some_and(|t| t.editable) {
                self.result.text_input_rects.push(rect);
            }
            match caps.blocked_surface {
                Some(BlockedSurfaceKind::Camera) => self.result.camera_rects.push(rect),
                Some(BlockedSurfaceKind::WebView) => self.result.webview_rects.push(rect),
                Some(BlockedSurfaceKind::Video) => self.result.video_rects.push(rect),
                None => {}
            }
            if self.scanner.is_occluded(node) {
                self.result.occluded_rects.push(rect);
            }
        }

        if let Some(scroll) = &node.scroll {
            self.result.scroll_view_handles.push(node.id);
            let sample = ScrollSample {
                offset: scroll.offset,
                insets: scroll.insets,
            };
            let prev = self.scanner.prev_scroll.get(&node.id).copied();
            self.next_scroll.insert(node.id, sample);

            let moved = prev.is_some_and(|p| {
                (p.offset.0 - scroll.offset.0).abs() > 0.5 || (p.offset.1 - scroll.offset.1).abs() > 0.5
            });
            if scroll.tracking || scroll.dragging || scroll.decelerating || moved {
                self.result.scroll_active = true;
            }

            let past_insets = scroll.offset.1 < -(scroll.insets.0 + 0.5)
                || scroll.offset.0 < -(scroll.insets.1 + 0.5);
            let insets_changed = prev.is_some_and(|p| {
                (p.insets.0 - scroll.insets.0).abs() > 0.5
                    || (p.insets.1 - scroll.insets.1).abs() > 0.5
                    || (p.insets.2 - scroll.insets.2).abs() > 0.5
                    || (p.insets.3 - scroll.insets.3).abs() > 0.5
            });
            if past_insets || insets_changed {
                self.result.bounce_active = true;
            }
        }

        if let Some(refresh) = &node.refresh {
            let indicator_visible = refresh
                .indicator_frame
                .map(|f| f.sanitized().offset(dx, dy))
                .is_some_and(|f| f.intersects(&self.target_bounds));
            if refresh.refreshing || indicator_visible {
                self.result.refresh_active = true;
            }
        }

        if caps.is_map || node.map.is_some() {
            self.result.map_view_handles.push(node.id);
            if let Some(rect) = accepted {
                self.result.map_view_rects.push(rect);
            }
            if let Some(map) = &node.map {
                if matches!(
                    map.gesture,
                    GesturePhase::Began | GesturePhase::Changed | GesturePhase::Ended
                ) {
                    self.result.map_active = true;
                }
                if let Some(camera) = &map.camera {
                    let sig = camera.signature();
                    if self.scanner.prev_map_sigs.get(&node.id).is_some_and(|&p| p != sig) {
                        self.result.map_active = true;
                    }
                    self.next_map_sigs.insert(node.id, sig);
                }
            }
        }

        if node.animation.presentation_delta > 1.0 || node.animation.active_keys > 0 {
            self.result.has_any_animations = true;
            self.result.animated_view_handles.push(node.id);
            if let Some(visible) = frame.intersection(&self.target_bounds) {
                self.animated_area += visible.area();
            }
        }

        if depth >= self.budget_depth {
            self.result.did_bail_out_early = true;
            return true;
        }
        for child in &node.children {
            if !self.visit(child, depth + 1, dx, dy) {
                return false;
            }
        }
        true
    }
}
