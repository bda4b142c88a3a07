use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use rejourney_capture::buffer_pool::PixelBuffer;
use rejourney_capture::config::CaptureConfig;
use rejourney_capture::engine::{CaptureEngine, CaptureHost, EngineCommand, EngineEvent};
use rejourney_capture::geometry::Rect;
use rejourney_capture::paths::{default_caches_dir, default_config_overlay_path, default_segment_dir};
use rejourney_capture::performance::{
    BatteryState, DeviceSignals, MemoryPressure, ThermalState,
};
use rejourney_capture::recovery::pending_crash_segment_metadata;
use rejourney_capture::surface::{
    ClassId, FrameRenderer, NoopBackgroundTasks, RenderError, RenderOptions, SurfaceSnapshot,
    TableClassProbe, TextInfo, ViewNode, WindowProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "rejourney")]
#[command(about = "Session-replay capture client: record a synthetic session and stream segments to an ingest backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a capture session against a synthetic host UI.
    Run(RunArgs),
    /// Print capture paths, pending crash segments and configuration.
    Doctor,
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[arg(long, default_value = "http://localhost:3000")]
    base_url: String,

    #[arg(long, default_value = "pk_dev")]
    project_key: String,

    #[arg(long, default_value = "dev-project")]
    project_id: String,

    #[arg(long, help = "Session identifier; derived from the clock when omitted.")]
    session_id: Option<String>,

    #[arg(long = "for", default_value = "30s", value_parser = parse_duration)]
    run_for: Duration,

    #[arg(long, default_value_t = 1.0)]
    fps: f32,

    #[arg(long, default_value_t = 0.5)]
    scale: f32,

    #[arg(
        long,
        value_name = "PATH",
        help = "TOML overlay for capture tunables. Defaults to the app cache dir."
    )]
    config: Option<PathBuf>,

    #[arg(long, action = ArgAction::SetTrue, help = "Keep segment files on disk after upload.")]
    keep_segments: bool,
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_session(args).await,
        Commands::Doctor => {
            print_doctor();
            Ok(())
        }
    }
}

const DEMO_TEXT_INPUT: ClassId = ClassId(10);
const DEMO_LABEL: ClassId = ClassId(11);
const DEMO_CONTAINER: ClassId = ClassId(12);

/// A synthetic two-screen app: a heading that rewrites itself every few
/// seconds plus a text input the privacy mask must cover.
struct DemoWindows;

impl WindowProvider for DemoWindows {
    fn surfaces(&self) -> Vec<SurfaceSnapshot> {
        let phase = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            / 4;

        let mut root = ViewNode {
            id: 1,
            class: DEMO_CONTAINER,
            frame: Rect::new(0.0, 0.0, 390.0, 844.0),
            alpha: 1.0,
            background_rgba: Some(0xF5F5F7FF),
            ..ViewNode::default()
        };
        root.children.push(ViewNode {
            id: 2,
            class: DEMO_LABEL,
            frame: Rect::new(24.0, 80.0, 342.0, 34.0),
            alpha: 1.0,
            text: Some(TextInfo {
                len: 20,
                hash: 0x9E37_79B9 ^ phase,
                editable: false,
            }),
            ..ViewNode::default()
        });
        root.children.push(ViewNode {
            id: 3,
            class: DEMO_TEXT_INPUT,
            frame: Rect::new(24.0, 160.0, 342.0, 44.0),
            alpha: 1.0,
            text: Some(TextInfo {
                len: 12,
                hash: 0,
                editable: true,
            }),
            accessibility_identifier: Some("email-field".to_string()),
            ..ViewNode::default()
        });

        vec![SurfaceSnapshot {
            root,
            bounds: Rect::new(0.0, 0.0, 390.0, 844.0),
            screen_origin: (0.0, 0.0),
            scale: 2.0,
        }]
    }
}

/// Paints a flat gradient; stands in for the host's off-screen draw.
struct DemoRenderer;

impl FrameRenderer for DemoRenderer {
    fn render(
        &self,
        _surface: &SurfaceSnapshot,
        _options: RenderOptions,
        dest: &mut PixelBuffer,
    ) -> std::result::Result<(), RenderError> {
        let width = dest.width() as usize;
        for (i, px) in dest.data_mut().chunks_exact_mut(4).enumerate() {
            let x = (i % width) as u8;
            let y = (i / width) as u8;
            px.copy_from_slice(&[x, y, 0x80, 0xFF]);
        }
        Ok(())
    }
}

struct DemoSignals;

impl DeviceSignals for DemoSignals {
    fn thermal_state(&self) -> ThermalState {
        ThermalState::Nominal
    }

    fn battery(&self) -> BatteryState {
        BatteryState {
            level: 0.8,
            charging: true,
        }
    }

    fn resident_memory_bytes(&self) -> u64 {
        64 * 1024 * 1024
    }

    fn memory_pressure(&self) -> MemoryPressure {
        MemoryPressure::Normal
    }

    fn cpu_usage_percent(&self) -> f32 {
        5.0
    }
}

fn demo_probe() -> Box<TableClassProbe> {
    Box::new(TableClassProbe {
        text_inputs: vec![DEMO_TEXT_INPUT],
        camera_layers: vec![],
        web_views: vec![],
        video_layers: vec![],
        scrollables: vec![],
        maps: vec![],
    })
}

async fn run_session(args: RunArgs) -> Result<()> {
    let overlay = args.config.clone().unwrap_or_else(default_config_overlay_path);
    let mut config = CaptureConfig::default().with_overlay(&overlay)?;
    config.video_fps = args.fps;
    config.scale = args.scale.clamp(0.05, 1.0);
    config.uploader.delete_after_upload = !args.keep_segments;

    let host = CaptureHost {
        windows: Arc::new(DemoWindows),
        renderer: Arc::new(DemoRenderer),
        signals: Arc::new(DemoSignals),
        background: Arc::new(NoopBackgroundTasks),
        probe: demo_probe(),
    };

    let mut engine = CaptureEngine::new(host, config);
    engine
        .configure_uploader(
            args.base_url.as_str(),
            args.project_key.as_str(),
            args.project_id.as_str(),
        )
        .context("uploader configuration rejected")?;

    let session_id = args.session_id.clone().unwrap_or_else(|| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("cli-{now}")
    });

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                EngineEvent::SessionStarted { session_id } => {
                    println!("session started: {session_id}")
                }
                EngineEvent::SessionStopped { session_id } => {
                    println!("session stopped: {session_id}")
                }
                EngineEvent::Paused => println!("capture paused"),
                EngineEvent::Resumed => println!("capture resumed"),
                EngineEvent::FrameRendered { reason, .. } => {
                    println!("frame rendered ({reason:?})")
                }
                EngineEvent::FrameReused { reason, .. } => println!("frame reused ({reason:?})"),
                EngineEvent::IntentDropped { reason } => {
                    eprintln!("capture intent dropped ({reason:?})")
                }
                EngineEvent::SegmentFinished {
                    path, frame_count, ..
                } => println!("segment finished: {} ({frame_count} frames)", path.display()),
                EngineEvent::UploadCompleted { kind, segment_id } => {
                    println!("upload completed ({kind:?}): {segment_id}")
                }
                EngineEvent::UploadFailed { kind, message } => {
                    eprintln!("upload failed ({kind:?}): {message}")
                }
                EngineEvent::LevelChanged { level } => println!("performance level: {level:?}"),
                EngineEvent::EncoderError { message } => eprintln!("encoder error: {message}"),
                EngineEvent::SessionError { message } => eprintln!("session error: {message}"),
            }
        }
    });

    let engine_task = tokio::spawn(engine.run(command_rx, Some(event_tx)));

    command_tx
        .send(EngineCommand::StartSession {
            session_id: session_id.clone(),
        })
        .context("engine stopped before the session could start")?;

    tokio::select! {
        _ = tokio::time::sleep(args.run_for) => {}
        _ = tokio::signal::ctrl_c() => eprintln!("interrupted, finishing the open segment"),
    }

    command_tx
        .send(EngineCommand::Shutdown { sync: true })
        .context("engine stopped before shutdown")?;

    let summary = engine_task.await.context("engine task failed")??;
    printer.await.context("event printer failed")?;

    println!(
        "done: {} ticks, {} rendered, {} reused, {} dropped, {} segments, {} uploads ({} failed)",
        summary.ticks,
        summary.rendered,
        summary.reused,
        summary.dropped,
        summary.segments,
        summary.uploads_completed,
        summary.uploads_failed
    );
    Ok(())
}

fn print_doctor() {
    println!("Rejourney capture doctor");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));

    let segment_dir = default_segment_dir();
    let caches_dir = default_caches_dir();
    println!("Segment dir: {}", segment_dir.display());
    println!("Caches dir: {}", caches_dir.display());
    println!("Config overlay: {}", default_config_overlay_path().display());

    let segments = std::fs::read_dir(&segment_dir)
        .map(|dir| dir.filter_map(|e| e.ok()).count())
        .unwrap_or(0);
    println!("Local segment files awaiting upload: {segments}");

    match pending_crash_segment_metadata(&caches_dir) {
        Some(pending) => println!(
            "Pending crash segment: {} ({} frames, finalized={})",
            pending.segment_path.display(),
            pending.frame_count,
            pending.finalized
        ),
        None => println!("Pending crash segment: none"),
    }

    let config = CaptureConfig::default();
    println!(
        "Defaults: {} fps, scale {}, {} frames/segment, keyframe every {} frames",
        config.video_fps,
        config.scale,
        config.frames_per_segment,
        config.keyframe_interval()
    );
}
