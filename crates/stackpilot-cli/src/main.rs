mod app_cmds;
mod config;
mod run_cmd;
mod runtime_cmds;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use stackpilot_core::Orchestrator;
use stackpilot_core::logs::{LogRole, RunMode};
use stackpilot_core::provider::{Architecture, BuildConfiguration, PackageFormat};

#[derive(Parser)]
#[command(name = "stackpilot", about = "Build, run and preview apps across runtimes")]
struct Cli {
    /// Config file (overrides STACKPILOT_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// List registered runtimes and the stacks they serve
    Runtimes,
    /// Probe the toolchain for a stack type
    Check {
        /// Stack type (e.g. react, wpf, tauri)
        stack: String,
    },
    /// Create a new app from a template
    Scaffold {
        /// Project name
        name: String,
        /// Stack type (e.g. react, wpf, tauri)
        #[arg(long)]
        stack: String,
        /// Directory to create the app in
        #[arg(long)]
        path: PathBuf,
        /// Template to use (defaults to the stack type)
        #[arg(long)]
        template: Option<String>,
    },
    /// Compile an app and report diagnostics
    Build {
        /// App directory
        path: PathBuf,
        #[arg(long)]
        stack: String,
        /// Debug or Release
        #[arg(long, default_value = "debug")]
        configuration: BuildConfiguration,
    },
    /// Run an app and stream its logs until Ctrl-C
    Run {
        /// App directory
        path: PathBuf,
        #[arg(long)]
        stack: String,
        /// fullstack, frontend-only or backend-only
        #[arg(long, value_parser = parse_run_mode)]
        mode: Option<RunMode>,
        /// Log sink to follow: system, frontend or backend
        #[arg(long, default_value = "system")]
        logs: LogRole,
        /// Identifier for the app within this session
        #[arg(long, default_value_t = 1)]
        app_id: u64,
    },
    /// Check a source file the way edits are checked before writing
    Validate {
        /// File to validate (.xaml, .axaml, .cs)
        file: PathBuf,
    },
    /// Report whether a stack type supports hot reload
    HotReloadSupport {
        stack: String,
    },
    /// Produce a distributable artifact
    Package {
        /// App directory
        path: PathBuf,
        #[arg(long)]
        stack: String,
        /// exe, msi, msix or single-file
        #[arg(long, default_value = "exe")]
        format: PackageFormat,
        /// x64, x86 or arm64
        #[arg(long, default_value = "x64")]
        arch: Architecture,
    },
}

fn parse_run_mode(s: &str) -> Result<RunMode, String> {
    match s {
        "fullstack" => Ok(RunMode::Fullstack),
        "frontend-only" => Ok(RunMode::FrontendOnly),
        "backend-only" => Ok(RunMode::BackendOnly),
        other => Err(format!("unknown run mode {other:?}")),
    }
}

/// Build an orchestrator from the resolved config.
fn orchestrator(cli_config: Option<&std::path::Path>) -> anyhow::Result<Orchestrator> {
    let resolved = config::resolve(cli_config)?;
    Ok(Orchestrator::new(resolved)?)
}

/// Execute the `stackpilot init` command: write a default config file.
fn cmd_init(cli_config: Option<&std::path::Path>, force: bool) -> anyhow::Result<()> {
    let path = config::target_path(cli_config);
    config::save_config(&path, &stackpilot_core::OrchestratorConfig::default(), force)?;
    println!("Config written to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cli_config = cli.config.as_deref();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(cli_config, force)?;
        }
        Commands::Runtimes => {
            runtime_cmds::run_runtimes(&orchestrator(cli_config)?)?;
        }
        Commands::Check { stack } => {
            runtime_cmds::run_check(&orchestrator(cli_config)?, &stack).await?;
        }
        Commands::HotReloadSupport { stack } => {
            runtime_cmds::run_hot_reload_support(&orchestrator(cli_config)?, &stack)?;
        }
        Commands::Scaffold {
            name,
            stack,
            path,
            template,
        } => {
            let orch = orchestrator(cli_config)?;
            let request = stackpilot_core::provider::ScaffoldRequest {
                project_name: name,
                target_path: path,
                stack_type: stack,
                template_id: template,
            };
            app_cmds::run_scaffold(&orch, &request).await?;
        }
        Commands::Build {
            path,
            stack,
            configuration,
        } => {
            let orch = orchestrator(cli_config)?;
            app_cmds::run_build(&orch, path, stack, configuration).await?;
        }
        Commands::Run {
            path,
            stack,
            mode,
            logs,
            app_id,
        } => {
            let orch = orchestrator(cli_config)?;
            let mut request = stackpilot_core::provider::RunRequest::new(app_id, path, stack);
            request.mode = mode;
            let result = run_cmd::run_and_follow(&orch, request, logs).await;
            orch.shutdown().await;
            result?;
        }
        Commands::Validate { file } => {
            app_cmds::run_validate(&file)?;
        }
        Commands::Package {
            path,
            stack,
            format,
            arch,
        } => {
            let orch = orchestrator(cli_config)?;
            let options = stackpilot_core::provider::PackageOptions {
                app_id: 1,
                app_path: path,
                stack_type: stack,
                output_format: format,
                architecture: arch,
            };
            app_cmds::run_package(&orch, &options).await?;
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_mode_and_log_role() {
        let cli = Cli::try_parse_from([
            "stackpilot",
            "run",
            "./app",
            "--stack",
            "react",
            "--mode",
            "fullstack",
            "--logs",
            "frontend",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { mode, logs, app_id, .. } => {
                assert_eq!(mode, Some(RunMode::Fullstack));
                assert_eq!(logs, LogRole::Frontend);
                assert_eq!(app_id, 1);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn build_parses_configuration_case_insensitively() {
        let cli = Cli::try_parse_from(["stackpilot", "build", ".", "--stack", "wpf", "--configuration", "Release"])
            .unwrap();
        match cli.command {
            Commands::Build { configuration, .. } => {
                assert_eq!(configuration, BuildConfiguration::Release);
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn unknown_package_format_is_rejected() {
        let result = Cli::try_parse_from(["stackpilot", "package", ".", "--stack", "wpf", "--format", "dmg"]);
        assert!(result.is_err());
    }

    #[test]
    fn global_config_flag_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from(["stackpilot", "runtimes", "--config", "/tmp/sp.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sp.toml")));
    }
}
