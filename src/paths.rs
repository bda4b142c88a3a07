use std::path::PathBuf;

/// Directory holding in-flight and finalised segment files before upload.
pub fn default_segment_dir() -> PathBuf {
    let path = std::env::temp_dir().join("rj_segments");
    let _ = std::fs::create_dir_all(&path);
    path
}

/// Cache directory for state that must survive a relaunch (crash recovery
/// metadata). Falls back to the temp dir when no home directory exists.
pub fn default_caches_dir() -> PathBuf {
    let base = match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("rejourney"),
        None => std::env::temp_dir().join("rejourney-caches"),
    };
    let _ = std::fs::create_dir_all(&base);
    base
}

pub fn default_config_overlay_path() -> PathBuf {
    default_caches_dir().join("capture.toml")
}
