use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::apply::{self, PortReport};
use crate::check::{Checker, Harness};
use crate::config::PortOptions;
use crate::diag::TypesSummary;
use crate::directive::Directives;
use crate::gotool::GoTool;
use crate::journal::Journal;
use crate::package::{PatchArtifacts, PkgId, RawPackage, Tree};
use crate::port::{PortOutcome, Porter};
use crate::state::{PortState, StateTable};

/// Package discovery: list the target paths and their transitive
/// dependencies as a raw package set (external collaborator contract).
pub trait Lister {
    fn list(&mut self, paths: &[String]) -> Result<Vec<RawPackage>>;
}

/// A package the run could not port; reported, not fatal.
#[derive(Debug, Clone)]
pub struct PortingError {
    pub import_path: String,
    pub reason: String,
}

/// One observed state transition, recorded for verbose reporting.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub import_path: String,
    /// 1-based sweep number the transition happened in.
    pub sweep: u32,
    pub from: PortState,
    pub to: PortState,
}

/// The porting controller: owns the package tree, the per-package state
/// table, and the workspace journal, and drives load/port sweeps to a
/// fixpoint. Strictly single-threaded; a controller runs exactly once.
pub struct Controller {
    opts: PortOptions,
    directives: Directives,
    paths: Vec<String>,
    lister: Box<dyn Lister>,
    harness: Harness,
    gotool: Box<dyn GoTool>,

    tree: Tree,
    states: StateTable,
    journal: Journal,
    patchable: BTreeSet<String>,
    /// Patch state re-attached to the tree after every reload.
    artifacts: BTreeMap<String, PatchArtifacts>,
    /// Packages whose state changed last sweep; their importers are
    /// re-checked on the next load even if nothing changed on disk.
    modified: BTreeSet<String>,
    errors: Vec<PortingError>,
    transitions: Vec<TransitionRecord>,

    tree_dirty: bool,
    complete: bool,
    load_count: u32,
}

impl Controller {
    pub fn new(
        opts: PortOptions,
        directives: Directives,
        paths: Vec<String>,
        lister: Box<dyn Lister>,
        checker: Box<dyn Checker>,
        gotool: Box<dyn GoTool>,
    ) -> Self {
        Self {
            opts,
            directives,
            paths,
            lister,
            harness: Harness::new(checker),
            gotool,
            tree: Tree::default(),
            states: StateTable::new(),
            journal: Journal::new(),
            patchable: BTreeSet::new(),
            artifacts: BTreeMap::new(),
            modified: BTreeSet::new(),
            errors: Vec::new(),
            transitions: Vec::new(),
            tree_dirty: false,
            complete: false,
            load_count: 0,
        }
    }

    /// Drive load/port sweeps until one settles without dirtying the tree.
    pub fn run(&mut self) -> Result<()> {
        if self.complete {
            panic!("cannot run a controller more than once");
        }
        self.complete = true;

        loop {
            self.load()?;
            self.port_all()?;
            if !self.tree_dirty {
                break;
            }
        }
        Ok(())
    }

    /// Materialize every decision as file and workspace mutations.
    pub fn apply(&mut self) -> Result<PortReport> {
        if !self.complete {
            panic!("trying to apply incomplete porting job");
        }
        apply::apply(
            &self.opts,
            &mut self.tree,
            &self.states,
            &self.journal,
            &self.patchable,
            self.gotool.as_mut(),
        )
    }

    /// Discovery plus the initial type-check of every dirty package,
    /// leaf-first so that dependency types are always cached before their
    /// importers are checked.
    fn load(&mut self) -> Result<()> {
        self.load_count += 1;
        self.tree_dirty = false;

        let raws = self.lister.list(&self.paths).context("package discovery")?;
        let tree = Tree::build(raws).context("build import tree")?;
        self.tree = tree;
        self.overlay_modified();
        for (path, artifacts) in &self.artifacts {
            if let Some(id) = self.tree.lookup(path) {
                artifacts.restore(self.tree.pkg_mut(id));
            }
        }

        let listed: BTreeSet<String> = self
            .tree
            .ids()
            .map(|id| self.tree.pkg(id).import_path.clone())
            .collect();
        self.states.retain(&listed);

        let layers = self.tree.layers().to_vec();
        for layer in layers.iter().rev() {
            for &id in layer {
                self.load_package(id)?;
            }
        }
        Ok(())
    }

    /// Fold the previous sweep's in-memory changes into the lister's reload
    /// hints: a package we moved re-checks, and so does every package that
    /// imports one we moved.
    fn overlay_modified(&mut self) {
        if self.modified.is_empty() {
            return;
        }
        let mut dirty: Vec<(PkgId, bool, bool)> = Vec::new();
        for id in self.tree.ids() {
            let pkg = self.tree.pkg(id);
            let own = self.modified.contains(&pkg.import_path);
            let dep = pkg
                .imports
                .values()
                .any(|&d| self.modified.contains(&self.tree.pkg(d).import_path));
            if own || dep {
                dirty.push((id, own, dep));
            }
        }
        for (id, own, dep) in dirty {
            let pkg = self.tree.pkg_mut(id);
            pkg.dirty |= own;
            pkg.dep_dirty |= dep;
        }
        self.modified.clear();
    }

    fn load_package(&mut self, id: PkgId) -> Result<()> {
        let (path, name, included, goroot, standard, dirty, dep_dirty, builds_len) = {
            let pkg = self.tree.pkg(id);
            (
                pkg.import_path.clone(),
                pkg.name.clone(),
                pkg.included,
                pkg.goroot,
                pkg.standard,
                pkg.dirty,
                pkg.dep_dirty,
                pkg.builds.len(),
            )
        };

        let first = !self.states.contains(&path);
        if first {
            let module = self.tree.module_of(id);
            let pinned = goroot || standard || (module.is_golang_x() && module.replace.is_some());
            self.states.insert(&path, pinned);
        } else if self.load_count > 1 && (goroot || standard) && (dirty || dep_dirty) {
            // Guards against checker misclassification: nothing we do may
            // touch the standard library.
            panic!("package found in GOROOT changed after first load: {path}");
        }

        {
            let slot = self.states.slot_mut(&path);
            if slot.ps == PortState::Unknown && included {
                // Included packages get a full build from the start.
                slot.ps = PortState::Built;
            }
        }

        if !(dirty || dep_dirty) {
            return Ok(());
        }
        let cfg_idx = self.states.slot(&path).cfg_idx;
        if cfg_idx >= builds_len {
            return Ok(());
        }

        if self.tree.pkg(id).builds[cfg_idx].files.is_empty() {
            let slot = self.states.slot_mut(&path);
            slot.types = Some(TypesSummary::empty(&name));
            slot.errs.clear();
        } else {
            self.tree.load_sources(id, cfg_idx)?;
            let skip_bodies = !included || standard;
            let (types, errs) = self.harness.check(&self.tree, &self.states, id, skip_bodies)?;
            let slot = self.states.slot_mut(&path);
            slot.types = Some(types);
            slot.errs = errs;
        }
        Ok(())
    }

    /// One sweep: walk the tree leaf-first, driving the port state machine
    /// on every package that still needs work. Aborts as soon as a step
    /// dirties the tree.
    fn port_all(&mut self) -> Result<()> {
        if self.tree.is_empty() {
            panic!("package tree not initialized");
        }

        let mut valid = true;
        let layers = self.tree.layers().to_vec();
        for layer in layers.iter().rev() {
            for &id in layer {
                let path = self.tree.pkg(id).import_path.clone();
                let included = self.tree.pkg(id).included;
                let entry_ps = self.states.slot(&path).ps;

                // Skip exhausted, settled, or inactive packages.
                if (!included && entry_ps == PortState::Unknown) || entry_ps.is_terminal() {
                    continue;
                }
                if self.patchable.contains(&path) {
                    panic!("trying to port package that already has a patch associated with it");
                }

                let outcome = Porter {
                    tree: &mut self.tree,
                    states: &mut self.states,
                    harness: &mut self.harness,
                    journal: &mut self.journal,
                    gotool: self.gotool.as_mut(),
                    directives: &self.directives,
                    opts: &self.opts,
                    tree_dirty: &mut self.tree_dirty,
                    artifacts: &mut self.artifacts,
                }
                .port(id)?;

                let exit_ps = self.states.slot(&path).ps;
                if exit_ps != entry_ps {
                    if self.opts.verbose {
                        println!("{path}: {entry_ps} -> {exit_ps}");
                    }
                    self.transitions.push(TransitionRecord {
                        import_path: path.clone(),
                        sweep: self.load_count,
                        from: entry_ps,
                        to: exit_ps,
                    });
                }

                if let PortOutcome::ManualPortRequired(reason) = outcome {
                    println!("Package requires manual porting: {path}\n\t{reason}");
                    self.errors.push(PortingError {
                        import_path: path.clone(),
                        reason,
                    });
                }

                if exit_ps == PortState::Patched {
                    let module_path = self.tree.module_of(id).path.clone();
                    self.journal.promote_imported(&module_path);
                    self.patchable.insert(path.clone());
                    self.modified.insert(path);
                } else if exit_ps.is_intermediate() || exit_ps == PortState::Unknown {
                    valid = false;
                    self.modified.insert(path);
                }

                if self.tree_dirty {
                    return Ok(());
                }
            }
        }

        // Packages still in an intermediate state need another sweep.
        if !valid {
            self.tree_dirty = true;
        }
        Ok(())
    }

    pub fn state_of(&self, import_path: &str) -> Option<PortState> {
        self.states.get(import_path).map(|s| s.ps)
    }

    pub fn cfg_idx_of(&self, import_path: &str) -> Option<usize> {
        self.states.get(import_path).map(|s| s.cfg_idx)
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn patchable(&self) -> &BTreeSet<String> {
        &self.patchable
    }

    pub fn errors(&self) -> &[PortingError] {
        &self.errors
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn sweep_count(&self) -> u32 {
        self.load_count
    }
}
