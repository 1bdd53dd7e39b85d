//! Shared scaffolding steps: target checks and template copies.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};

/// Directories never copied out of a template.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "bin", "obj", "target"];

/// Scaffolding is only idempotent on an empty target; anything else is an
/// error. Creates the directory if absent.
pub async fn prepare_target(path: &Path) -> RuntimeResult<()> {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => {
            let first = entries
                .next_entry()
                .await
                .map_err(|e| RuntimeError::io(path, e))?;
            if first.is_some() {
                return Err(RuntimeError::Scaffold(format!(
                    "target path {} is not empty",
                    path.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| RuntimeError::io(path, e)),
        Err(e) => Err(RuntimeError::io(path, e)),
    }
}

/// `template_dir/<template>`, if it exists.
pub fn template_source(template_dir: Option<&Path>, template: &str) -> Option<PathBuf> {
    let dir = template_dir?.join(template);
    dir.is_dir().then_some(dir)
}

/// Recursively copy `src` into `dst`, returning the number of files copied.
pub async fn copy_template(src: &Path, dst: &Path) -> RuntimeResult<usize> {
    let mut copied = 0;
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to)
            .await
            .map_err(|e| RuntimeError::io(&to, e))?;
        let mut entries = tokio::fs::read_dir(&from)
            .await
            .map_err(|e| RuntimeError::io(&from, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RuntimeError::io(&from, e))?
        {
            let name = entry.file_name();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| RuntimeError::io(entry.path(), e))?;
            if file_type.is_dir() {
                if SKIP_DIRS.iter().any(|skip| name == *skip) {
                    continue;
                }
                pending.push((entry.path(), to.join(&name)));
            } else {
                let target = to.join(&name);
                tokio::fs::copy(entry.path(), &target)
                    .await
                    .map_err(|e| RuntimeError::io(&target, e))?;
                copied += 1;
            }
        }
    }
    debug!(from = %src.display(), to = %dst.display(), files = copied, "copied template");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_or_missing_targets_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        prepare_target(dir.path()).await.unwrap();

        let nested = dir.path().join("a/b");
        prepare_target(&nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn non_empty_target_is_a_scaffold_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let err = prepare_target(dir.path()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Scaffold(_)));
    }

    #[tokio::test]
    async fn copies_nested_files_and_skips_build_output() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("src/components")).unwrap();
        std::fs::create_dir_all(src.path().join("node_modules/react")).unwrap();
        std::fs::write(src.path().join("package.json"), "{}").unwrap();
        std::fs::write(src.path().join("src/components/App.tsx"), "export {}").unwrap();
        std::fs::write(src.path().join("node_modules/react/index.js"), "").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let copied = copy_template(src.path(), dst.path()).await.unwrap();

        assert_eq!(copied, 2);
        assert!(dst.path().join("src/components/App.tsx").is_file());
        assert!(!dst.path().join("node_modules").exists());
    }

    #[test]
    fn template_source_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("react")).unwrap();
        assert!(template_source(Some(dir.path()), "react").is_some());
        assert!(template_source(Some(dir.path()), "vue").is_none());
        assert!(template_source(None, "react").is_none());
    }
}
