use crate::buffer_pool::PixelBuffer;
use crate::geometry::Rect;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Stable identity of a host view class. The host assigns one id per class
/// object; the scanner mixes the id into signatures and caches capability
/// answers against it, never against class names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClassId(pub u64);

/// Out-of-band surfaces whose pixels change without any view-tree mutation.
/// Frames containing one must never be reused once the surface is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedSurfaceKind {
    Camera,
    WebView,
    Video,
}

/// Capability answers for one view class, resolved once and cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCaps {
    pub is_text_input: bool,
    pub blocked_surface: Option<BlockedSurfaceKind>,
    pub is_scrollable: bool,
    pub is_map: bool,
}

/// Host-side capability probe. Each question is asked at most once per class
/// identity; the resolver caches the combined answer.
pub trait ClassProbe: Send + Sync {
    fn probe(&self, class: ClassId) -> ClassCaps;
}

/// Per-class capability cache in front of a [`ClassProbe`].
pub struct ClassResolver {
    probe: Box<dyn ClassProbe>,
    cache: Mutex<HashMap<ClassId, ClassCaps>>,
}

impl ClassResolver {
    pub fn new(probe: Box<dyn ClassProbe>) -> Self {
        Self {
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, class: ClassId) -> ClassCaps {
        let mut cache = self.cache.lock().expect("class cache mutex poisoned");
        *cache.entry(class).or_insert_with(|| self.probe.probe(class))
    }

    /// Seeds the cache ahead of the first scan so probe cost never lands on
    /// the capture hot path.
    pub fn prewarm(&self, classes: &[ClassId]) {
        let mut cache = self.cache.lock().expect("class cache mutex poisoned");
        for class in classes {
            cache.entry(*class).or_insert_with(|| self.probe.probe(*class));
        }
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().expect("class cache mutex poisoned").len()
    }
}

/// Per-frame text payload. Content never crosses the boundary: only length
/// and a host-computed hash do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextInfo {
    pub len: u32,
    pub hash: u64,
    pub editable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollInfo {
    pub offset: (f32, f32),
    /// Adjusted content insets: top, left, bottom, right.
    pub insets: (f32, f32, f32, f32),
    pub tracking: bool,
    pub dragging: bool,
    pub decelerating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RefreshInfo {
    pub refreshing: bool,
    pub indicator_frame: Option<Rect>,
}

/// Exposed map camera state, present only when the host's map type supports
/// the probe. Absence degrades map-activity detection to gesture phase only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapCamera {
    pub center: (f64, f64),
    pub zoom: f64,
    pub heading: f64,
}

impl MapCamera {
    /// Order-stable content signature, mixed into the layout signature and
    /// compared across scans for map activity.
    pub fn signature(&self) -> u64 {
        let mut sig = 0xcbf29ce484222325u64;
        for bits in [
            self.center.0.to_bits(),
            self.center.1.to_bits(),
            self.zoom.to_bits(),
            self.heading.to_bits(),
        ] {
            for byte in bits.to_le_bytes() {
                sig ^= byte as u64;
                sig = sig.wrapping_mul(0x100000001b3);
            }
        }
        sig
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GesturePhase {
    #[default]
    Idle,
    Began,
    Changed,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MapInfo {
    pub camera: Option<MapCamera>,
    pub gesture: GesturePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnimationInfo {
    /// Magnitude of the presentation-layer offset from the model layer, pt.
    pub presentation_delta: f32,
    pub active_keys: u32,
}

/// One visible view in a host snapshot. Frames are absolute within the
/// owning surface's coordinate space.
#[derive(Debug, Clone, Default)]
pub struct ViewNode {
    /// Host-stable handle; carried in scan results instead of references.
    pub id: u64,
    pub class: ClassId,
    pub frame: Rect,
    pub alpha: f32,
    pub hidden: bool,
    pub background_rgba: Option<u32>,
    pub tint_rgba: Option<u32>,
    pub image_id: Option<u64>,
    pub text: Option<TextInfo>,
    pub accessibility_label: Option<String>,
    pub accessibility_identifier: Option<String>,
    pub accessibility_hint: Option<String>,
    pub scroll: Option<ScrollInfo>,
    pub refresh: Option<RefreshInfo>,
    pub map: Option<MapInfo>,
    pub animation: AnimationInfo,
    pub children: Vec<ViewNode>,
}

/// One top-level surface captured in a scan pass.
#[derive(Debug, Clone)]
pub struct SurfaceSnapshot {
    pub root: ViewNode,
    /// Surface bounds in its own point space (origin at 0,0).
    pub bounds: Rect,
    /// Surface origin in global screen coordinates, used to convert rects
    /// from secondary surfaces into the target surface's space.
    pub screen_origin: (f32, f32),
    /// Points-to-pixels factor for rendering.
    pub scale: f32,
}

/// Supplies the current set of visible top-level surfaces plus the index of
/// the primary target surface for coordinate conversion.
pub trait WindowProvider: Send + Sync {
    fn surfaces(&self) -> Vec<SurfaceSnapshot>;
    fn target_index(&self) -> usize {
        0
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("host draw returned failure")]
    DrawFailed,
    #[error("host produced an empty frame")]
    EmptyFrame,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub antialias: bool,
}

/// Off-screen draw of a surface into a BGRA buffer at native pixel size.
/// Runs on the engine's scheduling context, so it must not block on the
/// host's own frame production ("after screen updates" stays off).
pub trait FrameRenderer: Send + Sync {
    fn render(
        &self,
        surface: &SurfaceSnapshot,
        options: RenderOptions,
        dest: &mut PixelBuffer,
    ) -> Result<(), RenderError>;
}

/// Host begin/end primitives keeping the process alive across one upload.
pub trait BackgroundTasks: Send + Sync {
    fn begin(&self, label: &str) -> u64;
    fn end(&self, token: u64);
}

/// Default scope provider for hosts without background-task semantics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackgroundTasks;

impl BackgroundTasks for NoopBackgroundTasks {
    fn begin(&self, _label: &str) -> u64 {
        0
    }

    fn end(&self, _token: u64) {}
}

/// Static probe backed by explicit class sets; also the test double.
pub struct TableClassProbe {
    pub text_inputs: Vec<ClassId>,
    pub camera_layers: Vec<ClassId>,
    pub web_views: Vec<ClassId>,
    pub video_layers: Vec<ClassId>,
    pub scrollables: Vec<ClassId>,
    pub maps: Vec<ClassId>,
}

impl ClassProbe for TableClassProbe {
    fn probe(&self, class: ClassId) -> ClassCaps {
        let blocked = if self.camera_layers.contains(&class) {
            Some(BlockedSurfaceKind::Camera)
        } else if self.web_views.contains(&class) {
            Some(BlockedSurfaceKind::WebView)
        } else if self.video_layers.contains(&class) {
            Some(BlockedSurfaceKind::Video)
        } else {
            None
        };
        ClassCaps {
            is_text_input: self.text_inputs.contains(&class),
            blocked_surface: blocked,
            is_scrollable: self.scrollables.contains(&class),
            is_map: self.maps.contains(&class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        calls: std::sync::Arc<AtomicUsize>,
    }

    impl ClassProbe for CountingProbe {
        fn probe(&self, class: ClassId) -> ClassCaps {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ClassCaps {
                is_text_input: class.0 == 7,
                ..ClassCaps::default()
            }
        }
    }

    #[test]
    fn resolver_probes_each_class_once() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let resolver = ClassResolver::new(Box::new(CountingProbe { calls: calls.clone() }));

        assert!(resolver.resolve(ClassId(7)).is_text_input);
        assert!(resolver.resolve(ClassId(7)).is_text_input);
        assert!(!resolver.resolve(ClassId(8)).is_text_input);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prewarm_seeds_the_cache() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let resolver = ClassResolver::new(Box::new(CountingProbe { calls: calls.clone() }));

        resolver.prewarm(&[ClassId(1), ClassId(2), ClassId(3)]);
        assert_eq!(resolver.cached_count(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        resolver.resolve(ClassId(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn map_camera_signature_tracks_every_component() {
        let base = MapCamera {
            center: (37.7749, -122.4194),
            zoom: 12.0,
            heading: 0.0,
        };
        let mut moved = base;
        moved.center.0 += 0.0001;
        let mut zoomed = base;
        zoomed.zoom = 12.5;

        assert_eq!(base.signature(), base.signature());
        assert_ne!(base.signature(), moved.signature());
        assert_ne!(base.signature(), zoomed.signature());
    }
}
