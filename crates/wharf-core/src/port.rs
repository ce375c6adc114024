use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::check::Harness;
use crate::config::PortOptions;
use crate::diag::{DiagReason, TypeDiag};
use crate::directive::Directives;
use crate::filter::{filter_configs, ConfigVisitor};
use crate::gotool::{self, GoTool};
use crate::journal::{Journal, ModAction};
use crate::package::{BuildConfig, FileEdits, PatchArtifacts, PkgId, Replaced, Tree};
use crate::state::{PortState, StateTable};

/// Result of driving the state machine on one package.
#[derive(Debug)]
pub enum PortOutcome {
    Done,
    /// Exhaustion-class failure: the package was marked `Exhausted` and the
    /// run continues; the reason is reported per package.
    ManualPortRequired(String),
}

/// Per-package driver borrowing the controller's working set. Everything
/// here is one step of the sweep; the controller owns the loop.
pub(crate) struct Porter<'a> {
    pub tree: &'a mut Tree,
    pub states: &'a mut StateTable,
    pub harness: &'a mut Harness,
    pub journal: &'a mut Journal,
    pub gotool: &'a mut dyn GoTool,
    pub directives: &'a Directives,
    pub opts: &'a PortOptions,
    pub tree_dirty: &'a mut bool,
    /// Patch state that must survive reloads, keyed by import path.
    pub artifacts: &'a mut BTreeMap<String, PatchArtifacts>,
}

impl Porter<'_> {
    /// Run the build + port process on one package.
    pub fn port(&mut self, id: PkgId) -> Result<PortOutcome> {
        let path = self.tree.pkg(id).import_path.clone();

        let mut imports: BTreeSet<PkgId> = BTreeSet::new();
        let mut need_tag = self.states.slot(&path).ps == PortState::BrokeParent;

        // Entry classification: make sure the package actually has errors
        // before we begin our investigation. A package already marked
        // BrokeParent re-uses the errors cached at load time.
        if self.states.slot(&path).ps == PortState::Unknown {
            let cfg_idx = self.states.slot(&path).cfg_idx;
            self.tree.load_sources(id, cfg_idx)?;
            let (types, errs) = self.harness.check(self.tree, self.states, id, false)?;
            let slot = self.states.slot_mut(&path);
            slot.types = Some(types);
            slot.errs = errs;
            slot.ps = PortState::Built;
        }

        if self.states.slot(&path).ps == PortState::Built {
            let errs = self.states.slot(&path).errs.clone();
            if !errs.is_empty() {
                println!("Build errors occurred in: {path}");
            }

            let mut ill: Vec<TypeDiag> = Vec::new();
            for diag in &errs {
                match &diag.reason {
                    DiagReason::BadImportName { pkg_alias, .. } => {
                        imports.insert(self.resolve_bad_import(id, &diag.file, pkg_alias));
                    }
                    DiagReason::BadName { .. } => need_tag = true,
                    DiagReason::Other => ill.push(diag.clone()),
                }
                if self.opts.verbose {
                    println!("\t{}", diag.message);
                }
            }

            // Never try porting a package with unknown type errors.
            if !ill.is_empty() {
                let messages: Vec<&str> = ill.iter().map(|d| d.message.as_str()).collect();
                anyhow::bail!(
                    "unknown type error(s) occurred in {path}: {}",
                    messages.join("; ")
                );
            }

            // No work required.
            if !need_tag && imports.is_empty() {
                self.states.slot_mut(&path).ps = PortState::Valid;
                return Ok(PortOutcome::Done);
            }
        }

        // Module version decision: lock the version the module will use.
        // An update is tried once; a module seen Updated in a prior sweep
        // and still failing is re-pinned to its original version.
        if let Some(outcome) = self.decide_module_version(id, &path)? {
            return Ok(outcome);
        }

        // Re-tag search: walk the alternative configurations for one whose
        // only hard errors are bad imports.
        if need_tag {
            self.states.slot_mut(&path).cfg_idx = 1;
            let mut visitor = RetagVisitor::default();
            filter_configs(self.tree, self.states, self.harness, id, &mut visitor)?;

            if self.states.slot(&path).cfg_idx >= self.tree.pkg(id).builds.len() {
                self.states.slot_mut(&path).ps = PortState::Exhausted;
                return Ok(PortOutcome::ManualPortRequired(format!(
                    "unable to find a valid config for {path}"
                )));
            }

            imports.clear();
            for (file, alias) in &visitor.pending {
                imports.insert(self.resolve_bad_import(id, file, alias));
            }
            if imports.is_empty() {
                self.states.slot_mut(&path).ps = PortState::Patched;
                return Ok(PortOutcome::Done);
            }
        }

        // Dependency porting. Returning here after a run through the
        // dependencies: re-check the current configuration so that
        // dependencies patched earlier in this very sweep are seen, and
        // recompute the bad-import set from the fresh errors.
        if self.states.slot(&path).ps == PortState::PortingDependencies {
            imports.clear();
            let cfg_idx = self.states.slot(&path).cfg_idx;
            self.tree.load_sources(id, cfg_idx)?;
            let (types, errs) = self.harness.check(self.tree, self.states, id, false)?;
            {
                let slot = self.states.slot_mut(&path);
                slot.types = Some(types);
                slot.errs = errs.clone();
            }
            for diag in &errs {
                match &diag.reason {
                    DiagReason::BadImportName { pkg_alias, .. } => {
                        imports.insert(self.resolve_bad_import(id, &diag.file, pkg_alias));
                    }
                    _ if diag.soft => {}
                    _ => {
                        // A hard error of another kind can reappear after a
                        // dependency was retagged; give up on the package
                        // rather than abort the run.
                        self.states.slot_mut(&path).ps = PortState::Exhausted;
                        return Ok(PortOutcome::ManualPortRequired(format!(
                            "unexpected type errors after dependency porting in {path}: {}",
                            diag.message
                        )));
                    }
                }
            }
        } else if imports.is_empty() {
            panic!("advancing to dependency porting but no bad dependencies found in {path}");
        }

        // All dependencies fixed.
        if imports.is_empty() {
            let slot = self.states.slot_mut(&path);
            slot.ps = if slot.cfg_idx == 0 {
                PortState::Valid
            } else {
                PortState::Patched
            };
            return Ok(PortOutcome::Done);
        }

        let mut can_port_imports = false;
        for &dep in &imports {
            let dep_path = self.tree.pkg(dep).import_path.clone();
            let dep_slot = self.states.slot_mut(&dep_path);
            match dep_slot.ps {
                PortState::Patched => {
                    panic!("package {dep_path} is claimed to be patchable but has bad parent")
                }
                PortState::Exhausted => {}
                PortState::Unknown | PortState::Built | PortState::Valid => {
                    dep_slot.ps = PortState::BrokeParent;
                    can_port_imports = true;
                }
                PortState::BrokeParent | PortState::PortingDependencies => {
                    can_port_imports = true;
                }
            }
        }

        // Port the dependencies first if any of them still can be.
        if can_port_imports {
            self.states.slot_mut(&path).ps = PortState::PortingDependencies;
            return Ok(PortOutcome::Done);
        }

        // Every bad import is exhausted; try to substitute the offending
        // symbols through the export-directive table.
        let mut visitor = EditVisitor::new(self.directives, self.tree, id);
        filter_configs(self.tree, self.states, self.harness, id, &mut visitor)?;
        let edits = visitor.edits;

        if self.states.slot(&path).cfg_idx < self.tree.pkg(id).builds.len() {
            if !edits.is_empty() {
                self.apply_export_directive(id, &path, edits)?;
            }
            self.states.slot_mut(&path).ps = PortState::Patched;
            return Ok(PortOutcome::Done);
        }

        // Last resort: explicit file overrides from the directive file.
        if !self.directives.files(&path).is_empty() {
            self.apply_package_directive(id, &path)?;
            self.states.slot_mut(&path).ps = PortState::Patched;
            return Ok(PortOutcome::Done);
        }

        self.states.slot_mut(&path).ps = PortState::Exhausted;
        Ok(PortOutcome::ManualPortRequired(format!(
            "no applicable options available to port package {path}"
        )))
    }

    /// Resolve the package a bad-import diagnostic refers to, falling back
    /// to the backup name lookup when the alias's import lives in a file
    /// excluded from the current configuration.
    fn resolve_bad_import(&self, id: PkgId, file: &str, alias: &str) -> PkgId {
        self.tree
            .resolve_file_alias(id, file, alias)
            .or_else(|| self.tree.backup_name_lookup(alias, id))
            .unwrap_or_else(|| {
                panic!(
                    "bad import on unknown package {alias:?} in {}",
                    self.tree.pkg(id).import_path
                )
            })
    }

    /// Steps 1-2 of the version policy: try the updated version once, then
    /// fall back to pinning the original version reported by MVS. Returns
    /// an outcome when the decision ends this package's step.
    fn decide_module_version(&mut self, id: PkgId, path: &str) -> Result<Option<PortOutcome>> {
        let module = self.tree.module_of(id).clone();
        let entry = self.journal.get(&module.path).cloned();

        let enter = !module.main
            && match &entry {
                None => module.replace.is_none(),
                Some(e) => e.action < ModAction::Locked,
            };
        if !enter {
            return Ok(None);
        }

        let version;
        let updated;
        match entry {
            None => {
                let latest = match self.gotool.list_mod_update(&module.path) {
                    Ok(v) => v,
                    Err(err) if gotool::is_excludable(&err) => {
                        if self.opts.verbose {
                            println!("module query failed (ignored): {err:#}");
                        }
                        module.version.clone()
                    }
                    Err(err) => return Err(err),
                };
                updated = latest != module.version;
                if updated {
                    version = latest;
                    self.journal
                        .note(&module.path, &module.version, &version, ModAction::Updated);
                } else {
                    version = module.version.clone();
                    self.journal
                        .note(&module.path, &module.version, &version, ModAction::Locked);
                }
            }
            Some(e) => {
                // We already tried the updated version; lock the module to
                // the original version instead.
                version = e.original.clone();
                updated = true;
                self.journal
                    .note(&module.path, &e.original, &version, ModAction::Locked);
            }
        }

        self.gotool
            .work_edit_replace(&module.path, &version)
            .with_context(|| format!("pin {} to {version}", module.path))?;
        if updated {
            *self.tree_dirty = true;
        }

        // golang.org/x/... modules are authoritative upstream; lock them
        // and never retag their packages.
        if module.is_golang_x() {
            self.states.slot_mut(path).ps = PortState::Exhausted;
            return Ok(Some(PortOutcome::Done));
        }

        if updated {
            // Reload and reclassify with the new version.
            self.states.slot_mut(path).ps = PortState::Unknown;
            return Ok(Some(PortOutcome::Done));
        }

        Ok(None)
    }

    /// Materialize export-directive substitutions as override files in the
    /// package cache directory and attach the `Replaced` records.
    fn apply_export_directive(
        &mut self,
        id: PkgId,
        path: &str,
        edits: BTreeMap<String, FileEdits>,
    ) -> Result<()> {
        let cache_dir = self.opts.package_cache_dir(path);
        std::fs::create_dir_all(&cache_dir)
            .context("unable to create cache directory for package")?;

        for (file_name, file_edits) in edits {
            let pkg = self.tree.pkg_mut(id);
            let file = pkg
                .files
                .get_mut(&file_name)
                .unwrap_or_else(|| panic!("edit map names unknown file {file_name}"));
            let source = match &file.source {
                Some(src) => src.clone(),
                None => std::fs::read_to_string(&file.path)
                    .with_context(|| format!("read source: {}", file.path.display()))?,
            };

            let mut rewritten = source;
            for (alias, symbols) in &file_edits {
                for (symbol, directive) in symbols {
                    rewritten = replace_qualified(
                        &rewritten,
                        alias,
                        symbol,
                        &directive.replacement(alias),
                    );
                }
            }

            let out = cache_dir.join(&file_name);
            std::fs::write(&out, rewritten)
                .with_context(|| format!("write override: {}", out.display()))?;
            let replaced = Replaced {
                path: out,
                edits: file_edits,
            };
            file.replaced = Some(replaced.clone());
            self.artifacts
                .entry(path.to_string())
                .or_default()
                .replaced
                .insert(file_name, replaced);
        }

        // A patch must never claim the default configuration. When the
        // substitutions fix configuration 0, attach them to a synthesized
        // copy tagged for the target platform instead.
        if self.states.slot(path).cfg_idx == 0 {
            let pkg = self.tree.pkg_mut(id);
            let cfg = BuildConfig {
                files: pkg.builds[0].files.clone(),
                platforms: vec![self.opts.goos.clone()],
            };
            pkg.builds.push(cfg.clone());
            let patched_idx = pkg.builds.len() - 1;
            self.artifacts.entry(path.to_string()).or_default().synthesized = Some(cfg);
            self.states.slot_mut(path).cfg_idx = patched_idx;
        }
        Ok(())
    }

    /// Materialize full-file overrides from the directive file and attach
    /// them to a synthesized manual-patch configuration (empty platform
    /// list) so that the patch never claims the default configuration.
    fn apply_package_directive(&mut self, id: PkgId, path: &str) -> Result<()> {
        let cache_dir = self.opts.package_cache_dir(path);
        std::fs::create_dir_all(&cache_dir)
            .context("unable to create cache directory for package")?;

        let overrides = self.directives.files(path).to_vec();
        let mut files = self.tree.pkg(id).builds[0].files.clone();
        for directive in &overrides {
            let pkg = self.tree.pkg_mut(id);
            let file = pkg.files.get_mut(&directive.name).with_context(|| {
                format!(
                    "file directive targets unknown file {:?} in {path}",
                    directive.name
                )
            })?;
            let out = cache_dir.join(&directive.name);
            let source = crate::tags::append_build_tag(
                &directive.source,
                &directive.platform,
                "",
                &format!("This file was generated by Wharf (original {})", directive.name),
            );
            std::fs::write(&out, source)
                .with_context(|| format!("write override: {}", out.display()))?;
            let replaced = Replaced {
                path: out,
                edits: FileEdits::new(),
            };
            file.replaced = Some(replaced.clone());
            self.artifacts
                .entry(path.to_string())
                .or_default()
                .replaced
                .insert(directive.name.clone(), replaced);
            if !files.contains(&directive.name) {
                files.push(directive.name.clone());
            }
        }

        let cfg = BuildConfig {
            files,
            platforms: Vec::new(),
        };
        let pkg = self.tree.pkg_mut(id);
        pkg.builds.push(cfg.clone());
        let manual_idx = pkg.builds.len() - 1;
        self.artifacts.entry(path.to_string()).or_default().synthesized = Some(cfg);
        self.states.slot_mut(path).cfg_idx = manual_idx;
        Ok(())
    }
}

/// Visitor for the re-tag search: collect bad-import sites and reject any
/// configuration carrying a hard error of another kind.
#[derive(Default)]
struct RetagVisitor {
    /// (file, alias) pairs of the current candidate's bad imports.
    pending: Vec<(String, String)>,
}

impl ConfigVisitor for RetagVisitor {
    fn on_new_candidate(&mut self, _cfg_idx: usize) {
        self.pending.clear();
    }

    fn visit(&mut self, diag: &TypeDiag) -> bool {
        match &diag.reason {
            DiagReason::BadImportName { pkg_alias, .. } => {
                self.pending.push((diag.file.clone(), pkg_alias.clone()));
                true
            }
            _ => diag.soft,
        }
    }
}

/// Visitor for the export-directive search: accept a bad import exactly
/// when the registry supplies a substitution for it, accumulating the edit
/// map for the current candidate.
struct EditVisitor<'a> {
    directives: &'a Directives,
    /// (file, alias) -> import path, precomputed over every file of the
    /// package so the visitor does not need the tree while the filter
    /// mutates it.
    file_imports: BTreeMap<(String, String), String>,
    edits: BTreeMap<String, FileEdits>,
}

impl<'a> EditVisitor<'a> {
    fn new(directives: &'a Directives, tree: &Tree, id: PkgId) -> Self {
        let mut file_imports = BTreeMap::new();
        for (file_name, file) in &tree.pkg(id).files {
            for (alias, ipath) in &file.imports {
                file_imports.insert((file_name.clone(), alias.clone()), ipath.clone());
            }
        }
        Self {
            directives,
            file_imports,
            edits: BTreeMap::new(),
        }
    }
}

impl ConfigVisitor for EditVisitor<'_> {
    fn on_new_candidate(&mut self, _cfg_idx: usize) {
        self.edits.clear();
    }

    fn visit(&mut self, diag: &TypeDiag) -> bool {
        if let DiagReason::BadImportName { pkg_alias, name } = &diag.reason {
            let key = (diag.file.clone(), pkg_alias.clone());
            if let Some(ipath) = self.file_imports.get(&key) {
                if let Some(directive) = self.directives.export(ipath, name) {
                    self.edits
                        .entry(diag.file.clone())
                        .or_default()
                        .entry(pkg_alias.clone())
                        .or_default()
                        .insert(name.clone(), directive.clone());
                    return true;
                }
            }
        }
        diag.soft
    }
}

/// Replace every use site `alias.symbol` at identifier boundaries.
fn replace_qualified(source: &str, alias: &str, symbol: &str, replacement: &str) -> String {
    let needle = format!("{alias}.{symbol}");
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(pos) = rest.find(&needle) {
        let before_ok = rest[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric() && c != '_' && c != '.');
        let after = &rest[pos + needle.len()..];
        let after_ok = after
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric() && c != '_');
        out.push_str(&rest[..pos]);
        if before_ok && after_ok {
            out.push_str(replacement);
        } else {
            out.push_str(&needle);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{ExportDirective, ExportKind};

    #[test]
    fn qualified_replacement_respects_identifier_boundaries() {
        let src = "x := unix.Foo\ny := myunix.Foo\nz := unix.FooBar\n";
        let out = replace_qualified(src, "unix", "Foo", "unix.Bar");
        assert_eq!(out, "x := unix.Bar\ny := myunix.Foo\nz := unix.FooBar\n");
    }

    #[test]
    fn constant_directives_replace_the_whole_use_site() {
        let d = ExportDirective {
            kind: ExportKind::Constant,
            replace: "0x80".to_string(),
        };
        let out = replace_qualified("f(sys.O_FLAG)", "sys", "O_FLAG", &d.replacement("sys"));
        assert_eq!(out, "f(0x80)");
    }
}
