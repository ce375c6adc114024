use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use anyhow::{Context, Result};
use wharf_core::check::{CheckRequest, Checker};
use wharf_core::diag::{TypeDiag, TypesSummary};

/// Type checking over the Go toolchain: compile the candidate file
/// selection with `go build -gcflags=-e` (report every error) and classify
/// the diagnostics. Dependency types are resolved by the toolchain itself;
/// the engine's cached summaries are used for bookkeeping only.
pub struct GoBuildChecker {
    workfile: PathBuf,
}

impl GoBuildChecker {
    pub fn new(workfile: &Path) -> Self {
        Self {
            workfile: workfile.to_path_buf(),
        }
    }
}

impl Checker for GoBuildChecker {
    fn check(&mut self, req: &CheckRequest) -> Result<(Rc<TypesSummary>, Vec<TypeDiag>)> {
        let null_device = if cfg!(windows) { "NUL" } else { "/dev/null" };
        let mut cmd = Command::new("go");
        cmd.args(["build", "-o", null_device, "-gcflags=-e"])
            .env("GOWORK", &self.workfile);
        for file in &req.files {
            cmd.arg(file.path);
        }
        let out = cmd
            .output()
            .with_context(|| format!("exec go build for {}", req.import_path))?;

        let types = Rc::new(TypesSummary {
            name: req.pkg_name.to_string(),
            exports: Default::default(),
        });
        if out.status.success() {
            return Ok((types, Vec::new()));
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        let mut diags = Vec::new();
        for line in stderr.lines() {
            if let Some(diag) = classify_line(line, req) {
                diags.push(diag);
            }
        }
        if diags.is_empty() {
            // The build failed for a reason other than type errors
            // (toolchain setup, missing go.sum, ...). Surface it.
            anyhow::bail!(
                "go build failed for {} without diagnostics: {}",
                req.import_path,
                stderr.trim()
            );
        }
        Ok((types, diags))
    }
}

/// Parse one `file:line:col: message` diagnostic, if that is what the line
/// is, and classify it the way the porting engine expects.
fn classify_line(line: &str, req: &CheckRequest) -> Option<TypeDiag> {
    let (location, message) = split_location(line)?;
    let file = req
        .files
        .iter()
        .map(|f| f.name)
        .find(|name| location.ends_with(name))?
        .to_string();
    let message = message.trim();

    let soft = message.contains("declared and not used")
        || message.contains("imported and not used");

    if let Some(ident) = message.strip_prefix("undefined: ") {
        let ident = ident.trim();
        if let Some((alias, name)) = ident.split_once('.') {
            // The alias may be declared in any file of the package; a file
            // excluded from this selection is handled by the engine's
            // backup name lookup.
            if req.files.iter().any(|f| f.imports.contains_key(alias)) {
                return Some(TypeDiag::bad_import_name(&file, alias, name));
            }
        }
        if ident.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Some(TypeDiag::bad_name(&file, ident));
        }
    }

    Some(TypeDiag::other(&file, message, soft))
}

/// Split `path/to/file.go:12:3: message` into location and message.
fn split_location(line: &str) -> Option<(&str, &str)> {
    let go = line.find(".go:")?;
    let rest = &line[go + 4..];
    let msg = rest.find(": ")?;
    let location = &line[..go + 3];
    Some((location, &rest[msg + 2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wharf_core::check::CheckFile;
    use wharf_core::diag::DiagReason;

    fn request<'a>(imports: &'a BTreeMap<String, String>) -> CheckRequest<'a> {
        CheckRequest {
            import_path: "example.com/app",
            pkg_name: "app",
            files: vec![CheckFile {
                name: "main.go",
                path: Path::new("/src/example.com/app/main.go"),
                source: "",
                imports,
            }],
            dep_types: BTreeMap::new(),
            ignore_func_bodies: false,
        }
    }

    #[test]
    fn classifies_bad_import_names() {
        let imports: BTreeMap<String, String> =
            [("unix".to_string(), "golang.org/x/sys/unix".to_string())].into();
        let req = request(&imports);
        let diag =
            classify_line("./main.go:10:5: undefined: unix.Syscall", &req).unwrap();
        assert_eq!(
            diag.reason,
            DiagReason::BadImportName {
                pkg_alias: "unix".to_string(),
                name: "Syscall".to_string()
            }
        );
        assert!(!diag.soft);
    }

    #[test]
    fn classifies_bad_names_and_soft_errors() {
        let imports = BTreeMap::new();
        let req = request(&imports);

        let diag = classify_line("./main.go:4:2: undefined: epollWait", &req).unwrap();
        assert_eq!(
            diag.reason,
            DiagReason::BadName {
                name: "epollWait".to_string()
            }
        );

        let diag =
            classify_line("./main.go:7:6: x declared and not used", &req).unwrap();
        assert_eq!(diag.reason, DiagReason::Other);
        assert!(diag.soft);

        assert!(classify_line("# example.com/app", &req).is_none());
        assert!(classify_line("./other.go:1:1: undefined: y", &req).is_none());
    }
}
