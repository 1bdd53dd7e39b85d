//! Orchestrator configuration.
//!
//! Every field has a default, so a partial TOML document only overrides
//! what it names. Resolution of *which* file to read lives in the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kernel::KernelConfig;

/// Top-level configuration for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub kernel: KernelSection,
    pub runtime: RuntimeSection,
    pub logs: LogSection,
    pub hot_reload: HotReloadSection,
}

/// Execution kernel limits and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    /// Wall-clock budget for ordinary commands.
    pub default_timeout_secs: u64,
    /// Budget for compiler and bundler invocations.
    pub build_timeout_secs: u64,
    /// Budget for package installs and toolchain probes.
    pub install_timeout_secs: u64,
    /// Resident memory ceiling for one process tree.
    pub memory_limit_mb: u64,
    pub memory_sample_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL when tearing down a tree.
    pub kill_grace_secs: u64,
    pub allowed_programs: Vec<String>,
    /// Hosts reachable under the `restricted` network policy.
    pub allowed_hosts: Vec<String>,
}

/// Provider-facing runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// How long `run` waits for a readiness signal.
    pub readiness_timeout_secs: u64,
    /// Desktop apps print nothing reliable on window-shown; a process still
    /// alive after this long counts as ready.
    pub desktop_settle_secs: u64,
    /// Dev servers listen on `base_port + app_id % 10000`.
    pub dev_server_base_port: u16,
    pub prerequisite_cache_ttl_secs: u64,
    /// External template repository used by `scaffold`.
    pub template_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Events retained per `(app, role)` sink.
    pub sink_capacity: usize,
}

/// The file watcher behind hot-reload sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadSection {
    pub watch_program: String,
    pub watch_args: Vec<String>,
    /// Append `--configuration`, `--framework` and verbosity flags.
    pub dotnet_flags: bool,
    /// Build once before the watcher starts, so compile errors surface
    /// as a failed start rather than a silent watcher.
    pub prebuild: bool,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            build_timeout_secs: 600,
            install_timeout_secs: 300,
            memory_limit_mb: 4096,
            memory_sample_interval_ms: 500,
            kill_grace_secs: 5,
            allowed_programs: [
                "npm", "pnpm", "yarn", "npx", "dotnet", "msbuild", "nuget", "cargo", "rustc",
                "node", "deno", "git", "tsc", "vite",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            allowed_hosts: [
                "registry.npmjs.org",
                "registry.yarnpkg.com",
                "api.nuget.org",
                "crates.io",
                "index.crates.io",
                "static.crates.io",
                "github.com",
                "codeload.github.com",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 120,
            desktop_settle_secs: 5,
            dev_server_base_port: 3000,
            prerequisite_cache_ttl_secs: 300,
            template_dir: None,
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            sink_capacity: 5000,
        }
    }
}

impl Default for HotReloadSection {
    fn default() -> Self {
        Self {
            watch_program: "dotnet".into(),
            watch_args: vec!["watch".into()],
            dotnet_flags: true,
            prebuild: true,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document, filling unspecified fields with defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Kernel configuration derived from the `[kernel]` section.
    pub fn kernel_config(&self) -> KernelConfig {
        let k = &self.kernel;
        KernelConfig {
            default_timeout: Duration::from_secs(k.default_timeout_secs),
            default_memory_limit_mb: k.memory_limit_mb,
            memory_sample_interval: Duration::from_millis(k.memory_sample_interval_ms.max(50)),
            kill_grace: Duration::from_secs(k.kill_grace_secs),
            allowed_programs: k.allowed_programs.iter().cloned().collect(),
            allowed_hosts: k.allowed_hosts.clone(),
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.kernel.build_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.kernel.install_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.readiness_timeout_secs)
    }

    pub fn desktop_settle(&self) -> Duration {
        Duration::from_secs(self.runtime.desktop_settle_secs)
    }

    pub fn prerequisite_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.runtime.prerequisite_cache_ttl_secs)
    }
}
