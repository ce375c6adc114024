use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;

use crate::diag::{TypeDiag, TypesSummary};
use crate::package::{PkgId, Tree};
use crate::state::StateTable;

/// One selected file handed to the checker.
pub struct CheckFile<'a> {
    pub name: &'a str,
    pub path: &'a Path,
    pub source: &'a str,
    /// Import alias -> import path, as declared by this file.
    pub imports: &'a BTreeMap<String, String>,
}

/// Everything the external type checker needs for one package check.
pub struct CheckRequest<'a> {
    pub import_path: &'a str,
    pub pkg_name: &'a str,
    pub files: Vec<CheckFile<'a>>,
    /// Import path -> cached types of the dependency.
    pub dep_types: BTreeMap<&'a str, Rc<TypesSummary>>,
    /// Skip function-body analysis (dependencies and standard library).
    pub ignore_func_bodies: bool,
}

/// Contract for the external type checker; the engine never parses or
/// checks Go itself. An `Err` is a checker malfunction, not a diagnostic.
pub trait Checker {
    fn check(&mut self, req: &CheckRequest) -> Result<(Rc<TypesSummary>, Vec<TypeDiag>)>;
}

/// Wraps a [`Checker`] so that imports resolve against the controller's
/// cached per-package types. Dependencies without a cached types object are
/// a programming error: the leaf-first traversal must have produced one
/// before any dependent is checked.
pub struct Harness {
    checker: Box<dyn Checker>,
}

impl Harness {
    pub fn new(checker: Box<dyn Checker>) -> Self {
        Self { checker }
    }

    /// Type-check `id` under its current configuration.
    pub fn check(
        &mut self,
        tree: &Tree,
        states: &StateTable,
        id: PkgId,
        ignore_func_bodies: bool,
    ) -> Result<(Rc<TypesSummary>, Vec<TypeDiag>)> {
        let pkg = tree.pkg(id);
        let cfg_idx = states.slot(&pkg.import_path).cfg_idx;
        let cfg = &pkg.builds[cfg_idx];

        // A configuration that selects no files is the "build constraints
        // exclude all Go files" case: an empty, complete package.
        if cfg.files.is_empty() {
            return Ok((TypesSummary::empty(&pkg.name), Vec::new()));
        }

        let files: Vec<CheckFile> = cfg
            .files
            .iter()
            .map(|name| {
                let file = pkg
                    .files
                    .get(name)
                    .unwrap_or_else(|| panic!("configuration names unknown file {name}"));
                let source = file.source.as_deref().unwrap_or_else(|| {
                    panic!(
                        "source not loaded for {} during type check of {}",
                        name, pkg.import_path
                    )
                });
                CheckFile {
                    name: file.name.as_str(),
                    path: &file.path,
                    source,
                    imports: &file.imports,
                }
            })
            .collect();

        let mut dep_types: BTreeMap<&str, Rc<TypesSummary>> = BTreeMap::new();
        for (ipath, &dep) in &pkg.imports {
            let dep_path = &tree.pkg(dep).import_path;
            let slot = states.get(dep_path).unwrap_or_else(|| {
                panic!("imported package {dep_path} with uninitialized state found during type check")
            });
            let types = slot.types.clone().unwrap_or_else(|| {
                panic!("imported package {dep_path} with uninitialized types object found during type check")
            });
            dep_types.insert(ipath.as_str(), types);
        }

        let req = CheckRequest {
            import_path: &pkg.import_path,
            pkg_name: &pkg.name,
            files,
            dep_types,
            ignore_func_bodies,
        };
        self.checker.check(&req)
    }
}
