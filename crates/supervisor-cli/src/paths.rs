//! Resolves the `SecurityConfig` file to load, following a priority chain:
//! `--config` flag, `MCP_PROCESS_CONFIG_PATH` env, `./mcp-process-config.json`,
//! `./config/mcp-process.json`, falling back to built-in defaults (an empty
//! allowlist a `SecurityConfig::validate` call will reject).

use std::path::{Path, PathBuf};

pub const ENV_VAR: &str = "MCP_PROCESS_CONFIG_PATH";

/// Resolves the config path to load, in priority order. Returns `None`
/// only when nothing on the chain exists, meaning built-in defaults apply.
pub fn resolve_config_path(flag: Option<&str>) -> Option<PathBuf> {
    if let Some(flag) = flag {
        return Some(PathBuf::from(flag));
    }
    if let Ok(env_path) = std::env::var(ENV_VAR) {
        if !env_path.is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }
    for candidate in ["mcp-process-config.json", "config/mcp-process.json"] {
        if Path::new(candidate).is_file() {
            return Some(PathBuf::from(candidate));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_takes_priority_over_everything() {
        assert_eq!(
            resolve_config_path(Some("explicit.json")),
            Some(PathBuf::from("explicit.json"))
        );
    }

    #[test]
    fn missing_candidates_resolve_to_none() {
        // Relies on no ./mcp-process-config.json existing in the test cwd
        // and the env var being unset; both are true in a clean sandbox.
        if std::env::var(ENV_VAR).is_err()
            && !Path::new("mcp-process-config.json").exists()
            && !Path::new("config/mcp-process.json").exists()
        {
            assert_eq!(resolve_config_path(None), None);
        }
    }
}
