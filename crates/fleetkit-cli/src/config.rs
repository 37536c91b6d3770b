//! Configuration file discovery

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use fleetkit_core::FleetConfig;

/// Load configuration from file
///
/// # Errors
/// Returns error if file cannot be read or parsed
pub fn load(path: &Path) -> eyre::Result<FleetConfig> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let config = FleetConfig::from_toml(&content)
        .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

/// Candidate locations, most specific first
fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("fleetkit.toml"),
        PathBuf::from("/etc/fleetkit/fleetkit.toml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("fleetkit/fleetkit.toml"));
    }
    paths
}

/// Load from `$FLEETKIT_CONFIG` or the first default path that exists
///
/// Returns `None` if there is no config file anywhere.
///
/// # Errors
/// Returns error if a file was found but cannot be read or parsed
pub fn load_default() -> eyre::Result<Option<(FleetConfig, PathBuf)>> {
    if let Ok(path) = std::env::var("FLEETKIT_CONFIG") {
        let path = PathBuf::from(path);
        return Ok(Some((load(&path)?, path)));
    }

    for path in default_paths() {
        if path.exists() {
            return Ok(Some((load(&path)?, path)));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetkit.toml");
        std::fs::write(&path, "log_level = \"warn\"\n[[host]]\nname = \"web1\"\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.hosts.len(), 1);
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[[host]\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }

    #[test]
    fn test_missing_file() {
        assert!(load(Path::new("/nonexistent/fleetkit.toml")).is_err());
    }
}
