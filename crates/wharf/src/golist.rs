use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;
use wharf_core::controller::Lister;
use wharf_core::package::{BuildConfig, GoFile, Module, ModuleReplace, RawPackage};
use wharf_core::tags;

/// Package discovery over `go list`. Alternative build configurations are
/// synthesized by evaluating each file's build constraint against platform
/// tags harvested from the package's excluded files.
pub struct GoLister {
    workfile: PathBuf,
    goos: String,
    goarch: String,
    build_tags: Vec<String>,
    load_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedModule {
    path: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    main: bool,
    #[serde(default)]
    replace: Option<Box<ListedModule>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedPackage {
    import_path: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    go_files: Vec<String>,
    #[serde(default)]
    ignored_go_files: Vec<String>,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    standard: bool,
    #[serde(default)]
    goroot: bool,
    #[serde(default)]
    module: Option<ListedModule>,
}

impl GoLister {
    pub fn new(workfile: &Path, goos: &str, goarch: &str, build_tags: &[String]) -> Self {
        Self {
            workfile: workfile.to_path_buf(),
            goos: goos.to_string(),
            goarch: goarch.to_string(),
            build_tags: build_tags.to_vec(),
            load_count: 0,
        }
    }

    fn go_list(&self, args: &[&str], paths: &[String]) -> Result<Vec<ListedPackage>> {
        let out = Command::new("go")
            .arg("list")
            .args(args)
            .args(paths)
            .env("GOWORK", &self.workfile)
            .output()
            .context("exec go list")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            anyhow::bail!("go list failed: {stderr}");
        }
        let mut packages = Vec::new();
        let stream = serde_json::Deserializer::from_slice(&out.stdout);
        for pkg in stream.into_iter::<ListedPackage>() {
            packages.push(pkg.context("parse go list output")?);
        }
        Ok(packages)
    }

    fn resolve_targets(&self, paths: &[String]) -> Result<BTreeSet<String>> {
        let targets = self.go_list(&["-json"], paths)?;
        let mut out = BTreeSet::new();
        for target in targets {
            let in_main = target.module.as_ref().map_or(false, |m| m.main);
            if !in_main {
                anyhow::bail!(
                    "{}: target package must be included in a main module",
                    target.import_path
                );
            }
            out.insert(target.import_path);
        }
        Ok(out)
    }

    fn convert(&self, listed: ListedPackage, targets: &BTreeSet<String>) -> Result<RawPackage> {
        let dir = PathBuf::from(&listed.dir);
        let included = targets.contains(&listed.import_path);
        let system = listed.goroot || listed.standard;

        let module = match listed.module {
            Some(m) => Module {
                replace: m.replace.as_deref().map(|r| ModuleReplace {
                    path: r.path.clone(),
                    version: r.version.clone(),
                }),
                path: m.path,
                version: m.version,
                dir: PathBuf::from(m.dir),
                main: m.main,
            },
            // Standard-library packages carry no module; they are pinned
            // exhausted at load and never reach a module decision.
            None => Module {
                path: "std".to_string(),
                version: String::new(),
                dir: dir.clone(),
                main: true,
                replace: None,
            },
        };

        let mut files: BTreeMap<String, GoFile> = BTreeMap::new();
        let mut builds = vec![BuildConfig {
            files: Vec::new(),
            platforms: vec![self.goos.clone()],
        }];

        if !system {
            let mut constraints: BTreeMap<String, Option<tags::Constraint>> = BTreeMap::new();
            for (name, active) in listed
                .go_files
                .iter()
                .map(|f| (f, true))
                .chain(listed.ignored_go_files.iter().map(|f| (f, false)))
            {
                if name.ends_with("_test.go") {
                    continue;
                }
                let path = dir.join(name);
                let source = std::fs::read_to_string(&path)
                    .with_context(|| format!("read source: {}", path.display()))?;
                let constraint = tags::file_constraint(name, Some(&source))
                    .with_context(|| format!("parse build constraint: {}", path.display()))?;
                constraints.insert(name.clone(), constraint);
                files.insert(
                    name.clone(),
                    GoFile {
                        name: name.clone(),
                        path,
                        imports: parse_file_imports(&source),
                        source: Some(source),
                        replaced: None,
                    },
                );
                if active {
                    builds[0].files.push(name.clone());
                }
            }

            // Harvest candidate platforms from the excluded files and
            // synthesize one configuration per candidate.
            let mut candidates: BTreeSet<String> = BTreeSet::new();
            for name in &listed.ignored_go_files {
                if let Some(Some(constraint)) = constraints.get(name) {
                    let mut mentioned = BTreeSet::new();
                    constraint.tags(&mut mentioned);
                    for tag in mentioned {
                        if tags::KNOWN_GOOS.contains(tag.as_str()) && tag != self.goos {
                            candidates.insert(tag);
                        }
                    }
                }
            }

            let default_files: BTreeSet<String> = builds[0].files.iter().cloned().collect();
            for candidate in candidates {
                let selected = self.select_files(&constraints, &candidate);
                let selected_set: BTreeSet<String> = selected.iter().cloned().collect();
                if selected.is_empty() || selected_set == default_files {
                    continue;
                }
                builds.push(BuildConfig {
                    files: selected,
                    platforms: vec![candidate],
                });
            }
        }

        Ok(RawPackage {
            import_path: listed.import_path,
            name: listed.name,
            dir,
            module,
            files,
            builds,
            imports: listed
                .imports
                .into_iter()
                .filter(|i| i != "C")
                .collect(),
            included,
            goroot: listed.goroot,
            standard: listed.standard,
            dirty: self.load_count == 1 || !system,
            dep_dirty: false,
        })
    }

    /// Files whose constraints are satisfied when building for `goos`.
    fn select_files(
        &self,
        constraints: &BTreeMap<String, Option<tags::Constraint>>,
        goos: &str,
    ) -> Vec<String> {
        let mut satisfied: BTreeSet<&str> = BTreeSet::new();
        satisfied.insert(goos);
        satisfied.insert(&self.goarch);
        for tag in tags::implied_tags(goos) {
            satisfied.insert(tag);
        }
        for tag in &self.build_tags {
            satisfied.insert(tag);
        }

        constraints
            .iter()
            .filter(|(_, constraint)| match constraint {
                None => true,
                Some(c) => c.eval(&|tag| satisfied.contains(tag)),
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Lister for GoLister {
    fn list(&mut self, paths: &[String]) -> Result<Vec<RawPackage>> {
        self.load_count += 1;
        let targets = self.resolve_targets(paths)?;
        let listed = self.go_list(&["-e", "-deps", "-json"], paths)?;
        listed
            .into_iter()
            .map(|pkg| self.convert(pkg, &targets))
            .collect()
    }
}

/// Extract the alias table from a file's import declarations. The default
/// alias for an unnamed import is the last path segment, which is the
/// common case; packages whose name differs from their directory are still
/// resolvable through the backup name lookup.
fn parse_file_imports(source: &str) -> BTreeMap<String, String> {
    let mut imports = BTreeMap::new();
    let mut in_block = false;
    for line in source.lines() {
        let line = line.trim();
        if in_block {
            if line.starts_with(')') {
                in_block = false;
                continue;
            }
            parse_import_spec(line, &mut imports);
        } else if let Some(rest) = line.strip_prefix("import ") {
            let rest = rest.trim();
            if rest.starts_with('(') {
                in_block = true;
            } else {
                parse_import_spec(rest, &mut imports);
            }
        } else if line == "import (" {
            in_block = true;
        }
    }
    imports
}

fn parse_import_spec(spec: &str, imports: &mut BTreeMap<String, String>) {
    let spec = spec.split("//").next().unwrap_or("").trim();
    if spec.is_empty() {
        return;
    }
    let (alias, path) = match spec.split_once(' ') {
        Some((alias, path)) => (Some(alias.trim()), path.trim()),
        None => (None, spec),
    };
    let Some(path) = path.strip_prefix('"').and_then(|p| p.strip_suffix('"')) else {
        return;
    };
    let alias = match alias {
        Some("_") | Some(".") => return,
        Some(alias) => alias.to_string(),
        None => default_alias(path),
    };
    imports.insert(alias, path.to_string());
}

fn default_alias(path: &str) -> String {
    let last = path.rsplit('/').next().unwrap_or(path);
    // Versioned module paths import under the preceding segment.
    if last.len() > 1 && last.starts_with('v') && last[1..].chars().all(|c| c.is_ascii_digit()) {
        let mut segments = path.rsplit('/');
        segments.next();
        if let Some(prev) = segments.next() {
            return prev.to_string();
        }
    }
    last.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_block_imports() {
        let src = r#"package p

import "fmt"
import sys "example.com/sys"

import (
    "os"
    unix "golang.org/x/sys/unix"
    _ "embed"
    "example.com/mod/v2"
)

func f() {}
"#;
        let imports = parse_file_imports(src);
        assert_eq!(imports["fmt"], "fmt");
        assert_eq!(imports["sys"], "example.com/sys");
        assert_eq!(imports["os"], "os");
        assert_eq!(imports["unix"], "golang.org/x/sys/unix");
        assert_eq!(imports["mod"], "example.com/mod/v2");
        assert!(!imports.contains_key("_"));
        assert!(!imports.contains_key("embed"));
    }
}
