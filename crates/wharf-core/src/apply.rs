use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::PortOptions;
use crate::gotool::{self, GoTool};
use crate::journal::{Journal, ModAction};
use crate::package::{GoFile, Tree};
use crate::state::StateTable;
use crate::tags;

fn tag_notice(tag: &str) -> String {
    format!("Tags altered by Wharf (added {tag})")
}

fn file_notice(original: &str) -> String {
    format!("This file was generated by Wharf (original {original})")
}

/// Machine-readable record of what happened to one module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleAction {
    pub path: String,
    /// Version the run started from.
    pub version: String,
    /// Version the workspace now pins.
    pub fixed: String,
    pub imported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileAction {
    pub name: String,
    /// The file this one was generated from, for override copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_file: Option<String>,
    /// Whether the file is part of the build on the target platform.
    pub build: bool,
}

/// One symbol substitution performed in a generated file.
#[derive(Debug, Clone, Serialize)]
pub struct TokenAction {
    pub file: String,
    pub token: String,
    pub change: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageAction {
    pub path: String,
    pub module: String,
    pub dir: PathBuf,
    pub tags: Vec<String>,
    pub files: Vec<FileAction>,
    pub tokens: Vec<TokenAction>,
}

/// Everything the applier did (or, under dry-run, would do).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortReport {
    pub modules: Vec<ModuleAction>,
    pub packages: Vec<PackageAction>,
}

/// Materialize the journal and every per-package patch decision. Under
/// dry-run nothing on disk and no workspace state is touched; the report is
/// still produced in full.
pub(crate) fn apply(
    opts: &PortOptions,
    tree: &mut Tree,
    states: &StateTable,
    journal: &Journal,
    patchable: &BTreeSet<String>,
    gotool: &mut dyn GoTool,
) -> Result<PortReport> {
    let show_actions = opts.verbose || opts.dry_run;
    let make_diff = !opts.dry_run && opts.generate_patches;
    let mut report = PortReport::default();
    let mut diffs: BTreeSet<PathBuf> = BTreeSet::new();

    for (module_path, decision) in journal.iter() {
        let imported = decision.action == ModAction::Imported;
        report.modules.push(ModuleAction {
            path: module_path.to_string(),
            version: decision.original.clone(),
            fixed: decision.version.clone(),
            imported,
            dir: imported.then(|| opts.module_import_dir(module_path)),
        });
        let action = match decision.action {
            ModAction::Updated => "UPDATED",
            ModAction::Locked => "LOCKED",
            ModAction::Imported => "IMPORTED",
        };
        println!("{module_path} {} ({action})", decision.version);
    }

    for import_path in patchable {
        let id = tree
            .lookup(import_path)
            .unwrap_or_else(|| panic!("patchable package {import_path} missing from tree"));
        println!("# {import_path}");

        let slot = states.slot(import_path);
        if slot.cfg_idx == 0 {
            panic!("trying to patch using default config (no changes)");
        }

        let module = tree.module_of(id).clone();
        let mut action = PackageAction {
            path: import_path.clone(),
            module: module.path.clone(),
            dir: tree.pkg(id).dir.clone(),
            tags: Vec::new(),
            files: Vec::new(),
            tokens: Vec::new(),
        };

        // Clone the enclosing module into the workspace import directory
        // so the patched sources are editable and take precedence.
        let dir = if module.main {
            tree.pkg(id).dir.clone()
        } else {
            let dest = opts.module_import_dir(&module.path);
            action.dir = dest.clone();
            if make_diff {
                diffs.insert(dest.clone());
            }
            if !opts.dry_run {
                if opts.use_vcs {
                    let version = module.version.trim_end_matches("+incompatible");
                    gotool.clone_module_from_vcs(&dest, &module.path, version)?;
                } else {
                    gotool.clone_module_from_cache(&module.dir, &dest, &module.path)?;
                }
                gotool.work_edit_drop_replace(&module.path)?;
                gotool.work_use(&dest)?;
                // `work use` is silent on a missing go.mod; re-query to
                // verify the module now resolves as a main module.
                if let Err(err) = gotool.list_mod_main(&module.path) {
                    if !gotool::is_excludable(&err) {
                        return Err(err);
                    }
                }
                let module_id = tree.pkg(id).module;
                tree.module_mut(module_id).main = true;

                match gotool.list_pkg_dir(import_path) {
                    Ok(resolved) => resolved,
                    Err(err) if gotool::is_excludable(&err) => dest,
                    Err(err) => return Err(err),
                }
            } else {
                dest
            }
        };

        let dcfg = tree.pkg(id).builds[0].clone();
        let pcfg = tree.pkg(id).builds[slot.cfg_idx].clone();

        if pcfg.is_manual() {
            // A manual patch only swaps in the directive overrides.
            println!("Applied manual patch");
            for name in &pcfg.files {
                let file = &tree.pkg(id).files[name];
                let Some(replaced) = &file.replaced else {
                    continue;
                };
                action.files.push(FileAction {
                    name: name.clone(),
                    base_file: None,
                    build: true,
                });
                if show_actions {
                    println!("{name}: replaced with directive override");
                }
                if !opts.dry_run {
                    std::fs::copy(&replaced.path, dir.join(name)).with_context(|| {
                        format!("copy override {} into {}", replaced.path.display(), dir.display())
                    })?;
                }
            }
        } else {
            action.tags = pcfg.platforms.clone();
            println!(
                "Applying tags to match platform(s): {}",
                pcfg.platforms.join(", ")
            );

            // Files active under the default configuration.
            let mut current: BTreeSet<String> = dcfg.files.iter().cloned().collect();

            for name in &pcfg.files {
                let file = &tree.pkg(id).files[name];
                if let Some(replaced) = file.replaced.clone() {
                    // Copy the override in under a platform-tagged name; if
                    // the original is also active by default, exclude it on
                    // the target platform.
                    let new_name = platform_file_name(name, &opts.goos);
                    action.files.push(FileAction {
                        name: new_name.clone(),
                        base_file: Some(name.clone()),
                        build: true,
                    });
                    if show_actions {
                        println!("{name}: copied to {new_name}");
                    }

                    if current.contains(name) {
                        action.files.push(FileAction {
                            name: name.clone(),
                            base_file: None,
                            build: false,
                        });
                        if show_actions {
                            println!("{name}: added tag '!{}'", opts.goos);
                        }
                        if !opts.dry_run {
                            let src = source_of(file)?;
                            let not_goos = format!("!{}", opts.goos);
                            let out = tags::append_build_tag(
                                &src,
                                &not_goos,
                                "&&",
                                &tag_notice(&not_goos),
                            );
                            std::fs::write(dir.join(name), out)
                                .with_context(|| format!("write {}", dir.join(name).display()))?;
                        }
                    }

                    if !opts.dry_run {
                        let src = std::fs::read_to_string(&replaced.path).with_context(|| {
                            format!("read override: {}", replaced.path.display())
                        })?;
                        let out = tags::append_build_tag(&src, &opts.goos, "", &file_notice(name));
                        std::fs::write(dir.join(&new_name), out)
                            .with_context(|| format!("write {}", dir.join(&new_name).display()))?;
                    }
                    if show_actions {
                        println!("{new_name}: added tag '{}'", opts.goos);
                    }

                    for (alias, symbols) in &replaced.edits {
                        for (symbol, directive) in symbols {
                            let change = directive.replacement(alias);
                            if show_actions {
                                println!("{new_name}: replaced {alias}.{symbol} with {change}");
                            }
                            action.tokens.push(TokenAction {
                                file: new_name.clone(),
                                token: format!("{alias}.{symbol}"),
                                change,
                            });
                        }
                    }
                    if !show_actions {
                        println!("{name}: fixed imports");
                    }
                } else if !current.contains(name) {
                    // Previously excluded file joins the build on the
                    // target platform.
                    action.files.push(FileAction {
                        name: name.clone(),
                        base_file: None,
                        build: true,
                    });
                    println!("{name}: added {} tag", opts.goos);

                    // When the default configuration selected no files at
                    // all, or the file name itself carries a platform
                    // constraint, the tagged copy goes under a new name.
                    let target_name = if dcfg.files.is_empty()
                        || tags::filename_constraint(name).is_some()
                    {
                        platform_file_name(name, &opts.goos)
                    } else {
                        name.clone()
                    };
                    if target_name != *name && show_actions {
                        println!("{name}: copied to {target_name}");
                    }
                    if !opts.dry_run {
                        let src = source_of(file)?;
                        let out =
                            tags::append_build_tag(&src, &opts.goos, "||", &tag_notice(&opts.goos));
                        std::fs::write(dir.join(&target_name), out).with_context(|| {
                            format!("write {}", dir.join(&target_name).display())
                        })?;
                    }
                }
                current.remove(name);
            }

            // Files active by default but not in the patched configuration
            // are excluded on the target platform.
            for name in &current {
                let file = &tree.pkg(id).files[name];
                action.files.push(FileAction {
                    name: name.clone(),
                    base_file: None,
                    build: false,
                });
                if show_actions {
                    println!("{name}: added !{} tag", opts.goos);
                }
                if !opts.dry_run {
                    let src = source_of(file)?;
                    let not_goos = format!("!{}", opts.goos);
                    let out = tags::append_build_tag(&src, &not_goos, "&&", &tag_notice(&not_goos));
                    std::fs::write(dir.join(name), out)
                        .with_context(|| format!("write {}", dir.join(name).display()))?;
                }
            }
        }

        report.packages.push(action);
    }

    if make_diff && !diffs.is_empty() {
        let out_dir = opts
            .gowork
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        for repo in &diffs {
            let base = repo
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "module".to_string());
            let out = out_dir.join(format!("{base}.patch"));
            if let Err(err) = gotool.git_diff(repo, &out) {
                println!(
                    "Unable to produce patch file for repo located at {}: {err:#}",
                    repo.display()
                );
            }
        }
    }

    Ok(report)
}

fn source_of(file: &GoFile) -> Result<String> {
    match &file.source {
        Some(src) => Ok(src.clone()),
        None => std::fs::read_to_string(&file.path)
            .with_context(|| format!("read source: {}", file.path.display())),
    }
}

fn platform_file_name(name: &str, goos: &str) -> String {
    let stem = name.strip_suffix(".go").unwrap_or(name);
    format!("{stem}_{goos}.go")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_file_names() {
        assert_eq!(platform_file_name("io.go", "zos"), "io_zos.go");
        assert_eq!(platform_file_name("io_linux.go", "zos"), "io_linux_zos.go");
    }
}
