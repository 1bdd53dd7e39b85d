//! Implementation of the one-shot app commands: `scaffold`, `build`,
//! `package`, and `validate`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use stackpilot_core::Orchestrator;
use stackpilot_core::provider::{BuildConfiguration, BuildRequest, PackageOptions, ScaffoldRequest};
use stackpilot_core::validator;

pub async fn run_scaffold(orchestrator: &Orchestrator, request: &ScaffoldRequest) -> Result<()> {
    let result = orchestrator.scaffold_app(request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!(
            "scaffold failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Build the app and print the result, including every diagnostic.
pub async fn run_build(
    orchestrator: &Orchestrator,
    app_path: PathBuf,
    stack_type: String,
    configuration: BuildConfiguration,
) -> Result<()> {
    let request = BuildRequest {
        app_id: 1,
        app_path,
        stack_type,
        configuration,
    };
    let result = orchestrator.build_app(&request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!("build failed with {} error(s)", result.errors.len());
    }
    Ok(())
}

pub async fn run_package(orchestrator: &Orchestrator, options: &PackageOptions) -> Result<()> {
    let result = orchestrator.package_app(options).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!(
            "package failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Validate a file with the checker its extension selects.
pub fn run_validate(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    match validator::validate_for_path(file, &content) {
        Ok(()) => {
            println!("{}: ok", file.display());
            Ok(())
        }
        Err(failure) => bail!("{}: {failure}", file.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_well_formed_markup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("MainWindow.xaml");
        std::fs::write(
            &path,
            r#"<Window x:Class="Demo.MainWindow"
        xmlns="http://schemas.microsoft.com/winfx/2006/xaml/presentation"
        xmlns:x="http://schemas.microsoft.com/winfx/2006/xaml">
    <Grid>
        <TextBlock Text="Hello" />
    </Grid>
</Window>
"#,
        )
        .unwrap();
        run_validate(&path).unwrap();
    }

    #[test]
    fn validate_reports_the_failure_reason() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("Broken.xaml");
        std::fs::write(&path, "<Window><Grid></Grid></Window>").unwrap();

        let err = run_validate(&path).unwrap_err();
        assert!(err.to_string().contains("Missing XML namespaces"));
    }

    #[test]
    fn validate_errors_on_a_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = run_validate(&tmp.path().join("absent.cs")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
