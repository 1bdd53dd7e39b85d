//! Configuration file management for stackpilot.
//!
//! The orchestrator reads a TOML file at `~/.config/stackpilot/config.toml`.
//! Which file is used follows the chain: CLI flag > `STACKPILOT_CONFIG` env
//! var > XDG config file > built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use stackpilot_core::OrchestratorConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "STACKPILOT_CONFIG";

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the stackpilot config directory.
///
/// Uses XDG layout on every platform: `$XDG_CONFIG_HOME/stackpilot` or
/// `~/.config/stackpilot`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("stackpilot");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("stackpilot")
}

/// Return the path to the default config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Where `init` writes: the explicit flag or env var if given, else XDG.
pub fn target_path(cli_path: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_path {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_path(),
    }
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Resolve the orchestrator configuration.
///
/// An explicitly named file (flag or env var) must exist. The XDG file is
/// optional; without it the defaults apply.
pub fn resolve(cli_path: Option<&Path>) -> Result<OrchestratorConfig> {
    if let Some(path) = cli_path {
        debug!(path = %path.display(), "using config file from --config");
        return OrchestratorConfig::load(path);
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            debug!(%path, "using config file from {CONFIG_ENV}");
            return OrchestratorConfig::load(Path::new(&path));
        }
    }

    let default_path = config_path();
    if default_path.exists() {
        debug!(path = %default_path.display(), "using default config file");
        return OrchestratorConfig::load(&default_path);
    }

    debug!("no config file found, using built-in defaults");
    Ok(OrchestratorConfig::default())
}

// -----------------------------------------------------------------------
// Write
// -----------------------------------------------------------------------

/// Write `config` to `path`, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(path: &Path, config: &OrchestratorConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = config
        .to_toml_string()
        .context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
