//! Platform-specific config and log-root directory helpers.
//!
//! Uses the `dirs` crate to resolve platform-appropriate directories:
//! - Linux:   `~/.config/robocurse/` (config), `~/.local/share/robocurse/` (logs)
//! - Windows: `%APPDATA%\robocurse\` (config), `%APPDATA%\robocurse\` (logs)
//! - macOS:   `~/Library/Application Support/robocurse/` (both)

use std::path::PathBuf;

use crate::error::RobocurseError;

/// Get the Robocurse config directory, creating it if needed.
///
/// If the `ROBOCURSE_CONFIG_DIR` environment variable is set, it overrides
/// the default location. This enables test isolation and custom deployments.
pub fn robocurse_config_dir() -> Result<PathBuf, RobocurseError> {
    if let Ok(override_dir) = std::env::var("ROBOCURSE_CONFIG_DIR") {
        let dir = PathBuf::from(override_dir);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        return Ok(dir);
    }
    let base = dirs::config_dir().ok_or_else(|| RobocurseError::ConfigInvalid {
        field: "config_dir".to_string(),
        reason: "could not determine platform config directory".to_string(),
    })?;
    let dir = base.join("robocurse");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }
    Ok(dir)
}

/// Get the Robocurse log root, creating it if needed.
///
/// If the `ROBOCURSE_LOG_DIR` environment variable is set, it overrides the
/// default location.
pub fn robocurse_log_dir() -> Result<PathBuf, RobocurseError> {
    if let Ok(override_dir) = std::env::var("ROBOCURSE_LOG_DIR") {
        let dir = PathBuf::from(override_dir);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        return Ok(dir);
    }
    let base = dirs::data_dir().ok_or_else(|| RobocurseError::ConfigInvalid {
        field: "log_dir".to_string(),
        reason: "could not determine platform data directory".to_string(),
    })?;
    let dir = base.join("robocurse").join("logs");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_dir_override_is_honored() {
        let dir = tempdir().unwrap();
        std::env::set_var("ROBOCURSE_CONFIG_DIR", dir.path());
        let resolved = robocurse_config_dir().unwrap();
        assert_eq!(resolved, dir.path());
        std::env::remove_var("ROBOCURSE_CONFIG_DIR");
    }

    #[test]
    fn log_dir_override_is_honored() {
        let dir = tempdir().unwrap();
        std::env::set_var("ROBOCURSE_LOG_DIR", dir.path());
        let resolved = robocurse_log_dir().unwrap();
        assert_eq!(resolved, dir.path());
        std::env::remove_var("ROBOCURSE_LOG_DIR");
    }
}
