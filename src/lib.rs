//! On-device session-replay capture pipeline.
//!
//! The crate records a host application's UI as compact H.264 MP4 segments
//! with a synchronized view-hierarchy side-channel, and ships both to an
//! ingestion backend in short self-contained units. The host supplies
//! surfaces, rendering, device signals and background-task scopes through
//! the traits in [`surface`] and [`performance`]. Everything else lives
//! here: intent scheduling, hierarchy scanning, privacy masking, encoding,
//! uploading and adaptive quality.

pub mod buffer_pool;
pub mod config;
pub mod downscale;
pub mod encoder;
pub mod engine;
pub mod geometry;
pub mod heuristics;
pub mod intent;
pub mod mask;
pub mod mp4;
pub mod paths;
pub mod performance;
pub mod recovery;
pub mod scanner;
pub mod surface;
pub mod uploader;
