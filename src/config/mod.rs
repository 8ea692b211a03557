pub mod paths;
pub mod types;

use std::path::Path;

use crate::error::RobocurseError;
pub use types::{ProfileConfig, RobocurseConfig, Settings, Verbosity};

/// Shell metacharacters an adapter must reject before a config path ever
/// reaches the core (spec §6: "the adapter MUST reject config paths
/// containing shell metacharacters"). Mirrors the teacher's
/// `config::aliases::validate_alias_name` posture of rejecting a small,
/// explicit character set rather than allow-listing.
const REJECTED_PATH_CHARS: &[char] = &[';', '`', '$'];

/// Rejects a config path containing a shell metacharacter before it is
/// read. Does not check whether the path exists; that is surfaced later as
/// `ConfigInvalid`/`Io` from `load_config`.
pub fn validate_config_path(path: &str) -> Result<(), RobocurseError> {
    if let Some(c) = path.chars().find(|c| REJECTED_PATH_CHARS.contains(c)) {
        return Err(RobocurseError::ConfigInvalid {
            field: "config_path".to_string(),
            reason: format!("path contains disallowed character '{}'", c),
        });
    }
    Ok(())
}

/// Loads and parses the TOML config file at `path`.
pub fn load_config(path: &Path) -> Result<RobocurseConfig, RobocurseError> {
    let contents = std::fs::read_to_string(path)?;
    let config: RobocurseConfig = toml::from_str(&contents)?;
    for profile in &config.profiles {
        // ChunkMaxSizeBytes is the only cap validated at the caps level;
        // wrap it here so a malformed profile fails at config-load time
        // rather than at first-plan time.
        crate::model::chunk::ChunkCaps {
            max_size_bytes: profile.chunk_max_size_bytes,
            max_files: profile.chunk_max_files,
            max_depth: profile.chunk_max_depth,
            min_size_bytes: profile.min_size_bytes,
        }
        .validate()?;
        for pattern in profile.include_patterns.iter().chain(profile.exclude_patterns.iter()) {
            globset::Glob::new(pattern).map_err(|e| RobocurseError::ConfigInvalid {
                field: format!("profile '{}' include/exclude pattern", profile.name),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(config)
}
