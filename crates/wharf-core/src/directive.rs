use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How an export substitution rewrites a use site `pkg.symbol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    /// Rewrite to `pkg.<replace>`.
    Export,
    /// Rewrite to the literal `<replace>`.
    Constant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDirective {
    pub kind: ExportKind,
    pub replace: String,
}

impl ExportDirective {
    /// The replacement text for a use site qualified with `alias`.
    pub fn replacement(&self, alias: &str) -> String {
        match self.kind {
            ExportKind::Export => format!("{alias}.{}", self.replace),
            ExportKind::Constant => self.replace.clone(),
        }
    }
}

/// A full-file override supplied by the directive file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDirective {
    /// Target filename within the package.
    pub name: String,
    /// Replacement source payload.
    pub source: String,
    /// Platform tag the override is placed under.
    pub platform: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDirectives {
    #[serde(default)]
    pub exports: BTreeMap<String, ExportDirective>,
    #[serde(default)]
    pub files: Vec<FileDirective>,
}

/// Per-import-path porting directives. Read-only during porting.
#[derive(Debug, Clone, Default)]
pub struct Directives {
    by_path: BTreeMap<String, PackageDirectives>,
}

impl Directives {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let by_path: BTreeMap<String, PackageDirectives> =
            serde_json::from_slice(raw).context("parse directive file")?;
        for (path, directives) in &by_path {
            if path.trim().is_empty() {
                anyhow::bail!("directive import path must be non-empty");
            }
            for (symbol, export) in &directives.exports {
                if symbol.trim().is_empty() || export.replace.trim().is_empty() {
                    anyhow::bail!("directive for {path:?} has an empty symbol or replacement");
                }
            }
            for file in &directives.files {
                if !file.name.ends_with(".go") {
                    anyhow::bail!(
                        "file directive for {path:?} must target a .go file, got {:?}",
                        file.name
                    );
                }
                if file.platform.trim().is_empty() {
                    anyhow::bail!("file directive {:?} for {path:?} has no platform", file.name);
                }
            }
        }
        Ok(Self { by_path })
    }

    /// Substitution for a bad reference `(import path, symbol)`, if any.
    pub fn export(&self, import_path: &str, symbol: &str) -> Option<&ExportDirective> {
        self.by_path.get(import_path)?.exports.get(symbol)
    }

    /// Full-file overrides registered for a package.
    pub fn files(&self, import_path: &str) -> &[FileDirective] {
        self.by_path
            .get(import_path)
            .map(|d| d.files.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exports_and_files() {
        let raw = br#"{
            "example.com/bad": {
                "exports": {
                    "Sym": {"kind": "export", "replace": "GoodSym"},
                    "Flag": {"kind": "constant", "replace": "0x10"}
                },
                "files": [
                    {"name": "io_other.go", "source": "package bad\n", "platform": "zos"}
                ]
            }
        }"#;
        let d = Directives::parse(raw).unwrap();
        let sym = d.export("example.com/bad", "Sym").unwrap();
        assert_eq!(sym.replacement("bad"), "bad.GoodSym");
        let flag = d.export("example.com/bad", "Flag").unwrap();
        assert_eq!(flag.replacement("bad"), "0x10");
        assert_eq!(d.files("example.com/bad").len(), 1);
        assert!(d.export("example.com/bad", "Missing").is_none());
        assert!(d.files("example.com/other").is_empty());
    }

    #[test]
    fn rejects_non_go_file_overrides() {
        let raw = br#"{"p": {"files": [{"name": "x.txt", "source": "", "platform": "zos"}]}}"#;
        let err = Directives::parse(raw).unwrap_err();
        assert!(format!("{err:#}").contains("must target a .go file"));
    }
}
