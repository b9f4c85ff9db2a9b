//! Configuration file discovery

use std::path::{Path, PathBuf};

use tracing::debug;

/// Configuration file locations (in order of precedence)
pub const CONFIG_LOCATIONS: &[&str] = &[
    "./mesh-kube.yaml",
    "./.mesh-kube.yaml",
    "~/.config/mesh-kube/config.yaml",
];

/// First existing file among [`CONFIG_LOCATIONS`]
pub fn find_config_file() -> Option<PathBuf> {
    find_in(CONFIG_LOCATIONS)
}

fn find_in(locations: &[&str]) -> Option<PathBuf> {
    let found = locations.iter().map(|l| expand_path(l)).find(|p| p.exists());
    if let Some(path) = &found {
        debug!(path = %path.display(), "Found config file");
    }
    found
}

/// Expand ~ to home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Check if file is YAML based on extension
pub(super) fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
