//! `.csproj` maintenance: keep the declared source list in step with the
//! file tree, and keep XAML `x:Class` attributes in step with file paths.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::edit;
use crate::error::{RuntimeError, RuntimeResult};

const SYNC_LABEL: &str = "SyncedSources";
const SKIP_DIRS: &[&str] = &["bin", "obj", ".git", ".vs", "node_modules", "publish"];
const TARGET_FRAMEWORK: &str = "net8.0-windows";

static X_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"x:Class="([^"]*)""#).expect("valid regex"));
static ROOT_ELEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([A-Za-z][\w.:]*)").expect("valid regex"));
static SYNCED_ITEMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)[ \t]*<ItemGroup Label="SyncedSources">.*?</ItemGroup>\r?\n?"#).expect("valid regex")
});
static SYNCED_PROPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)[ \t]*<PropertyGroup Label="SyncedSources">.*?</PropertyGroup>\r?\n?"#)
        .expect("valid regex")
});

static TARGET_FRAMEWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<TargetFrameworks?>\s*([^<;\s]+)").expect("valid regex")
});

/// MSBuild item type for a project file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    ApplicationDefinition,
    Page,
    Compile,
    Resource,
    None,
}

impl ItemKind {
    /// `None` for files the project should not declare at all.
    pub fn for_path(relative: &Path) -> Option<Self> {
        let name = relative.file_name()?.to_str()?;
        let ext = relative
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)?;
        match ext.as_str() {
            "xaml" | "axaml" if name.eq_ignore_ascii_case("App.xaml") || name.eq_ignore_ascii_case("App.axaml") => {
                Some(Self::ApplicationDefinition)
            }
            "xaml" | "axaml" => Some(Self::Page),
            "cs" => Some(Self::Compile),
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "ico" | "svg" | "ttf" | "otf" => Some(Self::Resource),
            "json" | "config" | "settings" | "manifest" => Some(Self::None),
            _ => None,
        }
    }

    pub fn element(self) -> &'static str {
        match self {
            Self::ApplicationDefinition => "ApplicationDefinition",
            Self::Page => "Page",
            Self::Compile => "Compile",
            Self::Resource => "Resource",
            Self::None => "None",
        }
    }
}

/// One `<Kind Include="..." />` entry, path in MSBuild's backslash form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProjectItem {
    pub kind: ItemKind,
    pub include: String,
}

impl ProjectItem {
    pub fn new(kind: ItemKind, relative: &Path) -> Self {
        let include = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("\\");
        Self { kind, include }
    }
}

/// Replace characters C# rejects in identifiers; a leading digit gets an
/// underscore prefix.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Project names used in file names and `dotnet new -n`: invalid
/// characters dropped, must start with a letter.
pub fn sanitize_project_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.starts_with(|c: char| c.is_ascii_alphabetic()) {
        cleaned
    } else {
        format!("App{cleaned}")
    }
}

/// `Project.Sub.Dir` for a file at `Sub/Dir/File.cs`.
pub fn generate_namespace(project_name: &str, relative: &Path) -> String {
    let mut parts = vec![sanitize_identifier(project_name)];
    if let Some(dir) = relative.parent() {
        parts.extend(
            dir.components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(part) => Some(sanitize_identifier(&part.to_string_lossy())),
                    _ => None,
                }),
        );
    }
    parts.join(".")
}

/// Rewrite (or insert) the root element's `x:Class` so it names the class
/// the code-behind for `relative` declares.
pub fn pair_xaml<'a>(content: &'a str, project_name: &str, relative: &Path) -> Cow<'a, str> {
    let Some(stem) = relative.file_stem().and_then(|s| s.to_str()) else {
        return Cow::Borrowed(content);
    };
    let expected = format!("{}.{}", generate_namespace(project_name, relative), sanitize_identifier(stem));

    if let Some(caps) = X_CLASS_RE.captures(content) {
        if &caps[1] == expected {
            return Cow::Borrowed(content);
        }
        return X_CLASS_RE.replace(content, format!(r#"x:Class="{expected}""#).as_str());
    }
    match ROOT_ELEMENT_RE.find(content) {
        Some(root) => {
            let mut out = String::with_capacity(content.len() + expected.len() + 12);
            out.push_str(&content[..root.end()]);
            out.push_str(&format!(r#" x:Class="{expected}""#));
            out.push_str(&content[root.end()..]);
            Cow::Owned(out)
        }
        None => Cow::Borrowed(content),
    }
}

/// Every declarable file under `root`, sorted by kind then path.
pub async fn collect_items(root: &Path) -> RuntimeResult<Vec<ProjectItem>> {
    let mut items = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel_dir) = pending.pop() {
        let dir = root.join(&rel_dir);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| RuntimeError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RuntimeError::io(&dir, e))?
        {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            // Editor temp files and dotfiles.
            if name_str.starts_with('.') {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| RuntimeError::io(entry.path(), e))?;
            let rel = rel_dir.join(&name);
            if file_type.is_dir() {
                if !SKIP_DIRS.iter().any(|skip| name_str.eq_ignore_ascii_case(skip)) {
                    pending.push(rel);
                }
            } else if let Some(kind) = ItemKind::for_path(&rel) {
                items.push(ProjectItem::new(kind, &rel));
            }
        }
    }
    items.sort();
    Ok(items)
}

/// Rewrite the labeled item group in `project` to declare exactly `items`.
///
/// Items the project already declares outside the labeled group are left
/// to that declaration. Returns `None` when nothing changes; applying the
/// result again is a no-op.
pub fn sync_project_text(project: &str, items: &[ProjectItem]) -> Result<Option<String>, String> {
    let stripped = SYNCED_PROPS_RE.replace_all(project, "");
    let stripped = SYNCED_ITEMS_RE.replace_all(&stripped, "").into_owned();
    let close = stripped
        .rfind("</Project>")
        .ok_or_else(|| "project file has no closing </Project> element".to_owned())?;

    let mut block = format!(
        "  <PropertyGroup Label=\"{SYNC_LABEL}\">\n    <EnableDefaultItems>false</EnableDefaultItems>\n  </PropertyGroup>\n  <ItemGroup Label=\"{SYNC_LABEL}\">\n"
    );
    for item in items {
        if stripped.contains(&format!("Include=\"{}\"", item.include)) {
            continue;
        }
        block.push_str(&format!("    <{} Include=\"{}\" />\n", item.kind.element(), item.include));
    }
    block.push_str("  </ItemGroup>\n");

    let mut synced = String::with_capacity(stripped.len() + block.len());
    synced.push_str(&stripped[..close]);
    synced.push_str(&block);
    synced.push_str(&stripped[close..]);
    Ok((synced != project).then_some(synced))
}

/// The project's target framework; the first one for multi-targeted
/// projects.
pub fn target_framework(project: &str) -> Option<String> {
    TARGET_FRAMEWORK_RE
        .captures(project)
        .map(|caps| caps[1].to_owned())
}

/// `<project_name>.csproj` when it exists, else the first `.csproj` in `root`.
pub async fn find_project_file(root: &Path, project_name: Option<&str>) -> Option<PathBuf> {
    if let Some(name) = project_name {
        let named = root.join(format!("{name}.csproj"));
        if named.is_file() {
            return Some(named);
        }
    }
    let mut entries = tokio::fs::read_dir(root).await.ok()?;
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csproj")) {
            found.push(path);
        }
    }
    found.sort();
    found.into_iter().next()
}

/// A project file rewrite computed but not yet written.
#[derive(Debug, Clone)]
pub struct PendingSync {
    pub csproj: PathBuf,
    /// `None` when the project file already declares everything.
    pub synced: Option<String>,
    pub items: usize,
}

impl PendingSync {
    pub async fn commit(&self) -> RuntimeResult<bool> {
        let Some(synced) = &self.synced else {
            return Ok(false);
        };
        edit::write_atomic(&self.csproj, synced.as_bytes()).await?;
        debug!(project = %self.csproj.display(), items = self.items, "synced project file");
        Ok(true)
    }
}

/// Compute the project file sync for `root` as if `extra` already existed
/// on disk. Nothing is written; `None` when there is no project file.
pub async fn plan_sync(
    root: &Path,
    project_name: Option<&str>,
    extra: Option<ProjectItem>,
) -> RuntimeResult<Option<PendingSync>> {
    let Some(csproj) = find_project_file(root, project_name).await else {
        debug!(root = %root.display(), "no project file to sync");
        return Ok(None);
    };
    let text = tokio::fs::read_to_string(&csproj)
        .await
        .map_err(|e| RuntimeError::io(&csproj, e))?;
    let mut items = collect_items(root).await?;
    if let Some(item) = extra {
        if !items.contains(&item) {
            items.push(item);
            items.sort();
        }
    }
    match sync_project_text(&text, &items) {
        Ok(synced) => Ok(Some(PendingSync {
            csproj,
            synced,
            items: items.len(),
        })),
        Err(reason) => Err(RuntimeError::Build {
            errors: vec![format!("{}: {reason}", csproj.display())],
        }),
    }
}

/// Sync the project file under `root` with its file tree. Returns whether
/// the project file was rewritten; `false` when there is no project file.
pub async fn sync_project(root: &Path, project_name: Option<&str>) -> RuntimeResult<bool> {
    match plan_sync(root, project_name, None).await? {
        Some(pending) => pending.commit().await,
        None => Ok(false),
    }
}

/// Fill `{{ProjectName}}`, `{{Namespace}}` and `{{TargetFramework}}` in a
/// freshly copied template, including file names.
pub async fn instantiate_placeholders(root: &Path, project_name: &str) -> RuntimeResult<usize> {
    const TEXT_EXTENSIONS: &[&str] = &[
        "cs", "xaml", "axaml", "csproj", "sln", "json", "config", "xml", "props", "targets", "md",
        "razor", "cshtml", "manifest",
    ];
    let replace = |text: &str| {
        text.replace("{{ProjectName}}", project_name)
            .replace("{{Namespace}}", project_name)
            .replace("{{TargetFramework}}", TARGET_FRAMEWORK)
    };

    let mut touched = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| RuntimeError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RuntimeError::io(&dir, e))?
        {
            let mut path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains("{{") {
                let renamed = dir.join(replace(&name));
                tokio::fs::rename(&path, &renamed)
                    .await
                    .map_err(|e| RuntimeError::io(&renamed, e))?;
                path = renamed;
            }
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let is_text = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| TEXT_EXTENSIONS.iter().any(|t| e.eq_ignore_ascii_case(t)));
            if !is_text {
                continue;
            }
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RuntimeError::io(&path, e))?;
            if text.contains("{{") {
                let filled = replace(&text);
                if filled != text {
                    tokio::fs::write(&path, filled)
                        .await
                        .map_err(|e| RuntimeError::io(&path, e))?;
                    touched += 1;
                }
            }
        }
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDK_PROJECT: &str = r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup>
    <OutputType>WinExe</OutputType>
    <TargetFramework>net8.0-windows</TargetFramework>
    <UseWPF>true</UseWPF>
  </PropertyGroup>
</Project>
"#;

    #[test]
    fn classifies_project_items() {
        assert_eq!(ItemKind::for_path(Path::new("App.xaml")), Some(ItemKind::ApplicationDefinition));
        assert_eq!(ItemKind::for_path(Path::new("Views/Main.xaml")), Some(ItemKind::Page));
        assert_eq!(ItemKind::for_path(Path::new("Views/Main.xaml.cs")), Some(ItemKind::Compile));
        assert_eq!(ItemKind::for_path(Path::new("Assets/logo.PNG")), Some(ItemKind::Resource));
        assert_eq!(ItemKind::for_path(Path::new("appsettings.json")), Some(ItemKind::None));
        assert_eq!(ItemKind::for_path(Path::new("Demo.csproj")), None);
        assert_eq!(ItemKind::for_path(Path::new("README")), None);
    }

    #[test]
    fn reads_target_framework() {
        assert_eq!(target_framework(SDK_PROJECT).as_deref(), Some("net8.0-windows"));
        assert_eq!(
            target_framework("<TargetFrameworks>net8.0;net48</TargetFrameworks>").as_deref(),
            Some("net8.0")
        );
        assert_eq!(target_framework("<Project></Project>"), None);
    }

    #[test]
    fn namespaces_follow_directories() {
        assert_eq!(generate_namespace("My App", Path::new("MainWindow.xaml")), "My_App");
        assert_eq!(
            generate_namespace("Demo", Path::new("Views/2024-ui/Main.xaml")),
            "Demo.Views._2024_ui"
        );
    }

    #[test]
    fn project_names_start_with_a_letter() {
        assert_eq!(sanitize_project_name("my-app"), "myapp");
        assert_eq!(sanitize_project_name("3d viewer"), "App3dviewer");
    }

    #[test]
    fn pairs_existing_x_class() {
        let xaml = r#"<Window x:Class="Wrong.Name" xmlns="http://schemas.microsoft.com/winfx/2006/xaml/presentation"></Window>"#;
        let paired = pair_xaml(xaml, "Demo", Path::new("Views/Main.xaml"));
        assert!(paired.contains(r#"x:Class="Demo.Views.Main""#));
        assert!(!paired.contains("Wrong.Name"));
    }

    #[test]
    fn inserts_x_class_after_xml_declaration() {
        let xaml = "<?xml version=\"1.0\"?>\n<UserControl xmlns=\"x\"></UserControl>";
        let paired = pair_xaml(xaml, "Demo", Path::new("Card.xaml"));
        assert_eq!(
            paired,
            "<?xml version=\"1.0\"?>\n<UserControl x:Class=\"Demo.Card\" xmlns=\"x\"></UserControl>"
        );
    }

    #[test]
    fn matching_x_class_is_untouched() {
        let xaml = r#"<Window x:Class="Demo.MainWindow"></Window>"#;
        assert!(matches!(pair_xaml(xaml, "Demo", Path::new("MainWindow.xaml")), Cow::Borrowed(_)));
    }

    #[test]
    fn sync_declares_items_and_is_idempotent() {
        let items = vec![
            ProjectItem::new(ItemKind::ApplicationDefinition, Path::new("App.xaml")),
            ProjectItem::new(ItemKind::Page, Path::new("Views/Main.xaml")),
            ProjectItem::new(ItemKind::Compile, Path::new("Views/Main.xaml.cs")),
        ];
        let synced = sync_project_text(SDK_PROJECT, &items).unwrap().unwrap();
        assert!(synced.contains("<EnableDefaultItems>false</EnableDefaultItems>"));
        assert!(synced.contains(r#"<Page Include="Views\Main.xaml" />"#));
        assert!(synced.contains(r#"<Compile Include="Views\Main.xaml.cs" />"#));
        assert!(synced.trim_end().ends_with("</Project>"));

        assert_eq!(sync_project_text(&synced, &items).unwrap(), None);
    }

    #[test]
    fn sync_replaces_stale_entries() {
        let before = vec![ProjectItem::new(ItemKind::Compile, Path::new("Old.cs"))];
        let after = vec![ProjectItem::new(ItemKind::Compile, Path::new("New.cs"))];
        let first = sync_project_text(SDK_PROJECT, &before).unwrap().unwrap();
        let second = sync_project_text(&first, &after).unwrap().unwrap();
        assert!(!second.contains("Old.cs"));
        assert!(second.contains(r#"Include="New.cs""#));
        assert_eq!(second.matches("SyncedSources").count(), 2);
    }

    #[test]
    fn user_declared_items_are_not_duplicated() {
        let project = SDK_PROJECT.replace(
            "</Project>",
            "  <ItemGroup>\n    <Compile Include=\"Shared.cs\" />\n  </ItemGroup>\n</Project>",
        );
        let items = vec![ProjectItem::new(ItemKind::Compile, Path::new("Shared.cs"))];
        let synced = sync_project_text(&project, &items).unwrap().unwrap();
        assert_eq!(synced.matches(r#"Include="Shared.cs""#).count(), 1);
    }

    #[test]
    fn missing_project_close_is_an_error() {
        assert!(sync_project_text("<Project>", &[]).is_err());
    }

    #[tokio::test]
    async fn collects_tree_and_syncs_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("Demo.csproj"), SDK_PROJECT).unwrap();
        std::fs::create_dir_all(root.join("Views")).unwrap();
        std::fs::create_dir_all(root.join("bin/Debug")).unwrap();
        std::fs::write(root.join("App.xaml"), "<Application/>").unwrap();
        std::fs::write(root.join("Views/Main.xaml.cs"), "class Main {}").unwrap();
        std::fs::write(root.join("bin/Debug/Generated.cs"), "").unwrap();
        std::fs::write(root.join(".Main.xaml.cs.tmp"), "").unwrap();

        let items = collect_items(root).await.unwrap();
        let includes: Vec<&str> = items.iter().map(|i| i.include.as_str()).collect();
        assert_eq!(includes, vec!["App.xaml", r"Views\Main.xaml.cs"]);

        assert!(sync_project(root, Some("Demo")).await.unwrap());
        assert!(!sync_project(root, Some("Demo")).await.unwrap());
    }

    #[tokio::test]
    async fn fills_template_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("{{ProjectName}}.csproj"),
            "<TargetFramework>{{TargetFramework}}</TargetFramework>",
        )
        .unwrap();
        std::fs::write(dir.path().join("App.xaml.cs"), "namespace {{Namespace}};").unwrap();

        let touched = instantiate_placeholders(dir.path(), "Demo").await.unwrap();
        assert_eq!(touched, 2);
        let csproj = std::fs::read_to_string(dir.path().join("Demo.csproj")).unwrap();
        assert!(csproj.contains("net8.0-windows"));
        let code = std::fs::read_to_string(dir.path().join("App.xaml.cs")).unwrap();
        assert_eq!(code, "namespace Demo;");
    }
}
