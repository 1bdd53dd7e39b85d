//! MSBuild and NuGet output parsing.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// `path(line,col): error CODE: message [project]`
static POSITIONED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<file>.+?)\((?P<line>\d+),(?P<col>\d+)\):\s+(?P<sev>error|warning)\s+(?P<code>[A-Z]+\d+):\s+(?P<msg>.+?)(?:\s+\[[^\]]+\])?\s*$",
    )
    .expect("valid regex")
});
/// `path : error CODE: message [project]`
static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<file>\S.*?)\s+:\s+(?P<sev>error|warning)\s+(?P<code>[A-Z]+\d+):\s+(?P<msg>.+?)(?:\s+\[[^\]]+\])?\s*$",
    )
    .expect("valid regex")
});
/// `error CODE: message`
static BARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<sev>error|warning)\s+(?P<code>[A-Z]+\d+):\s+(?P<msg>.+?)(?:\s+\[[^\]]+\])?\s*$")
        .expect("valid regex")
});

static NUGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(error|failed).*\bNU\d{4}\b").expect("valid regex"));
static NUGET_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bNU\d{4}\b").expect("valid regex"));
static PACKAGE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:package|reference)\s+['"]?([A-Za-z][\w.\-]*)"#).expect("valid regex")
});
static NOT_FOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(could not|unable to|package).*(not found|does not exist)").expect("valid regex")
});
static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)((error|failed|unable|could not).*(network|connection|ssl|certificate|proxy|firewall))|((network|connection|ssl|certificate|proxy).*(refused|timed out|failed|error))",
    )
    .expect("valid regex")
});
static ACCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)access is denied|forbidden|permission denied|\b401\b|unauthorized").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One compiler or MSBuild diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line, self.column) {
            (Some(file), Some(line), Some(col)) => {
                write!(f, "{file}({line},{col}): {}: {}", self.code, self.message)
            }
            (Some(file), _, _) => write!(f, "{file}: {}: {}", self.code, self.message),
            _ => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl Diagnostic {
    pub fn parse(line: &str) -> Option<Self> {
        let severity = |s: &str| if s == "error" { Severity::Error } else { Severity::Warning };
        if let Some(c) = POSITIONED_RE.captures(line) {
            return Some(Self {
                severity: severity(&c["sev"]),
                code: c["code"].to_owned(),
                message: c["msg"].to_owned(),
                file: Some(c["file"].trim().to_owned()),
                line: c["line"].parse().ok(),
                column: c["col"].parse().ok(),
            });
        }
        if let Some(c) = BARE_RE.captures(line) {
            return Some(Self {
                severity: severity(&c["sev"]),
                code: c["code"].to_owned(),
                message: c["msg"].to_owned(),
                file: None,
                line: None,
                column: None,
            });
        }
        FILE_RE.captures(line).map(|c| Self {
            severity: severity(&c["sev"]),
            code: c["code"].to_owned(),
            message: c["msg"].to_owned(),
            file: Some(c["file"].trim().to_owned()),
            line: None,
            column: None,
        })
    }
}

/// Errors and warnings from build output. MSBuild repeats every diagnostic
/// in its summary; duplicates are dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildDiagnostics {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl BuildDiagnostics {
    pub fn parse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = Self::default();
        for diagnostic in lines.into_iter().filter_map(Diagnostic::parse) {
            let bucket = match diagnostic.severity {
                Severity::Error => &mut out.errors,
                Severity::Warning => &mut out.warnings,
            };
            if !bucket.contains(&diagnostic) {
                bucket.push(diagnostic);
            }
        }
        out
    }

    pub fn error_strings(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    pub fn warning_strings(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }
}

/// Why a restore failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyIssueKind {
    /// A NuGet `NUxxxx` code.
    NuGet(String),
    PackageNotFound,
    Network,
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyIssue {
    pub kind: DependencyIssueKind,
    pub message: String,
    pub package: Option<String>,
}

impl fmt::Display for DependencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match &self.kind {
            DependencyIssueKind::NuGet(code) => code.as_str(),
            DependencyIssueKind::PackageNotFound => "PACKAGE_NOT_FOUND",
            DependencyIssueKind::Network => "NETWORK_ERROR",
            DependencyIssueKind::AccessDenied => "ACCESS_DENIED",
        };
        write!(f, "{code}: {}", self.message)
    }
}

/// Restore problems found in `lines`, one per offending line.
///
/// Any issue fails the restore, even when `dotnet` exited with 0.
pub fn parse_dependency_issues<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<DependencyIssue> {
    let mut issues: Vec<DependencyIssue> = Vec::new();
    for line in lines {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        let package = || {
            PACKAGE_NAME_RE
                .captures(message)
                .map(|c| c[1].trim_end_matches('.').to_owned())
        };
        let issue = if NUGET_RE.is_match(message) {
            let code = NUGET_CODE_RE
                .find(message)
                .map_or_else(|| "NU_UNKNOWN".to_owned(), |m| m.as_str().to_ascii_uppercase());
            DependencyIssue {
                kind: DependencyIssueKind::NuGet(code),
                message: message.to_owned(),
                package: package(),
            }
        } else if NOT_FOUND_RE.is_match(message) {
            DependencyIssue {
                kind: DependencyIssueKind::PackageNotFound,
                message: message.to_owned(),
                package: package(),
            }
        } else if NETWORK_RE.is_match(message) {
            DependencyIssue {
                kind: DependencyIssueKind::Network,
                message: message.to_owned(),
                package: None,
            }
        } else if ACCESS_RE.is_match(message) {
            DependencyIssue {
                kind: DependencyIssueKind::AccessDenied,
                message: message.to_owned(),
                package: None,
            }
        } else {
            continue;
        };
        if !issues.contains(&issue) {
            issues.push(issue);
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positioned_msbuild_errors() {
        let line = r"C:\src\Demo\MainWindow.xaml.cs(12,9): error CS0103: The name 'foo' does not exist in the current context [C:\src\Demo\Demo.csproj]";
        let d = Diagnostic::parse(line).unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.code, "CS0103");
        assert_eq!(d.line, Some(12));
        assert_eq!(d.column, Some(9));
        assert_eq!(d.message, "The name 'foo' does not exist in the current context");
        assert_eq!(
            d.to_string(),
            r"C:\src\Demo\MainWindow.xaml.cs(12,9): CS0103: The name 'foo' does not exist in the current context"
        );
    }

    #[test]
    fn parses_file_level_and_bare_diagnostics() {
        let file = Diagnostic::parse("/src/Demo/Demo.csproj : error NU1101: Unable to find package Foo.Bar").unwrap();
        assert_eq!(file.file.as_deref(), Some("/src/Demo/Demo.csproj"));
        assert_eq!(file.code, "NU1101");

        let bare = Diagnostic::parse("warning MSB3245: Could not resolve this reference.").unwrap();
        assert_eq!(bare.severity, Severity::Warning);
        assert!(bare.file.is_none());

        assert!(Diagnostic::parse("Build succeeded.").is_none());
        assert!(Diagnostic::parse("    0 Error(s)").is_none());
    }

    #[test]
    fn summary_repeats_are_deduplicated() {
        let output = "\
Program.cs(3,1): warning CS8321: unused [Demo.csproj]
Program.cs(5,1): error CS1002: ; expected [Demo.csproj]
Build FAILED.
Program.cs(3,1): warning CS8321: unused [Demo.csproj]
Program.cs(5,1): error CS1002: ; expected [Demo.csproj]";
        let diagnostics = BuildDiagnostics::parse(output.lines());
        assert_eq!(diagnostics.error_strings(), vec!["Program.cs(5,1): CS1002: ; expected"]);
        assert_eq!(diagnostics.warnings.len(), 1);
    }

    #[test]
    fn classifies_restore_failures() {
        let output = "\
  Determining projects to restore...
/src/Demo.csproj : error NU1101: Unable to find package Contoso.Widgets. No packages exist with this id
  GET https://api.nuget.org/v3-flatcontainer/newtonsoft.json/index.json
error: Unable to load the service index for source: connection refused
Package 'Foo.Bar' was not found
Response status code does not indicate success: 401 (Unauthorized).";
        let issues = parse_dependency_issues(output.lines());
        let kinds: Vec<_> = issues.iter().map(|i| i.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                DependencyIssueKind::NuGet("NU1101".into()),
                DependencyIssueKind::Network,
                DependencyIssueKind::PackageNotFound,
                DependencyIssueKind::AccessDenied,
            ]
        );
        assert_eq!(issues[0].package.as_deref(), Some("Contoso.Widgets"));
        assert_eq!(issues[2].package.as_deref(), Some("Foo.Bar"));
    }

    #[test]
    fn clean_restore_has_no_issues() {
        let output = "  Determining projects to restore...\n  Restored /src/Demo.csproj (in 1.2 sec).";
        assert!(parse_dependency_issues(output.lines()).is_empty());
    }
}
