use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::directive::ExportDirective;

/// Arena index of a package within a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PkgId(pub u32);

/// Arena index of a module within a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReplace {
    pub path: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub path: String,
    pub version: String,
    /// Directory the module currently resolves to (module cache or workspace).
    pub dir: PathBuf,
    /// Module is a workspace main module.
    pub main: bool,
    pub replace: Option<ModuleReplace>,
}

impl Module {
    pub fn is_golang_x(&self) -> bool {
        self.path.starts_with("golang.org/x/")
    }
}

/// Symbol substitutions applied to one file: alias -> symbol -> directive.
pub type FileEdits = BTreeMap<String, BTreeMap<String, ExportDirective>>;

/// Patch state that must survive a package-tree reload: the tree is rebuilt
/// from the lister every load, but override records and synthesized
/// configurations exist only in memory until the applier runs.
#[derive(Debug, Clone, Default)]
pub struct PatchArtifacts {
    /// File name -> override record.
    pub replaced: BTreeMap<String, Replaced>,
    /// Configuration appended by a directive application, if any.
    pub synthesized: Option<BuildConfig>,
}

impl PatchArtifacts {
    /// Re-attach the artifacts to a freshly rebuilt package.
    pub fn restore(&self, pkg: &mut Package) {
        for (name, replaced) in &self.replaced {
            if let Some(file) = pkg.files.get_mut(name) {
                file.replaced = Some(replaced.clone());
            }
        }
        if let Some(cfg) = &self.synthesized {
            pkg.builds.push(cfg.clone());
        }
    }
}

/// Override record for a file that Wharf generated a replacement for.
#[derive(Debug, Clone)]
pub struct Replaced {
    /// Location of the generated override in the package cache directory.
    pub path: PathBuf,
    /// The substitutions the override implements; empty for a full-file
    /// directive override.
    pub edits: FileEdits,
}

#[derive(Debug, Clone)]
pub struct GoFile {
    pub name: String,
    pub path: PathBuf,
    /// Import alias -> import path, as declared by this file.
    pub imports: BTreeMap<String, String>,
    /// File contents; read lazily, written once.
    pub source: Option<String>,
    pub replaced: Option<Replaced>,
}

/// One build configuration: a selection of files and the platform tags it
/// represents. An empty platform list marks a manual patch configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub files: Vec<String>,
    pub platforms: Vec<String>,
}

impl BuildConfig {
    pub fn is_manual(&self) -> bool {
        self.platforms.is_empty()
    }
}

/// A package as produced by the external lister, before tree linking.
#[derive(Debug, Clone)]
pub struct RawPackage {
    pub import_path: String,
    pub name: String,
    pub dir: PathBuf,
    pub module: Module,
    pub files: BTreeMap<String, GoFile>,
    /// Configuration 0 is the default selection under the current platform.
    pub builds: Vec<BuildConfig>,
    /// Direct dependency import paths.
    pub imports: Vec<String>,
    /// Package matches a CLI argument.
    pub included: bool,
    pub goroot: bool,
    pub standard: bool,
    /// Reload hints from the lister.
    pub dirty: bool,
    pub dep_dirty: bool,
}

#[derive(Debug)]
pub struct Package {
    pub import_path: String,
    pub name: String,
    pub dir: PathBuf,
    pub module: ModId,
    pub files: BTreeMap<String, GoFile>,
    pub builds: Vec<BuildConfig>,
    /// Import path -> direct dependency.
    pub imports: BTreeMap<String, PkgId>,
    /// Packages that import this one.
    pub parents: Vec<PkgId>,
    pub included: bool,
    pub goroot: bool,
    pub standard: bool,
    pub dirty: bool,
    pub dep_dirty: bool,
}

/// The loaded package dependency tree. Packages and modules are arena
/// allocated and referenced by index; the import graph is acyclic by
/// construction (guaranteed by the lister, verified during linking).
#[derive(Debug, Default)]
pub struct Tree {
    packages: Vec<Package>,
    modules: Vec<Module>,
    by_path: BTreeMap<String, PkgId>,
    /// Root-first layers; dependencies always sit in a deeper layer than
    /// every package that imports them.
    layers: Vec<Vec<PkgId>>,
    /// Short import alias -> packages known under that alias anywhere in
    /// the tree. Backs the backup name lookup.
    short_names: BTreeMap<String, Vec<PkgId>>,
}

impl Tree {
    /// Link a raw package list into a tree: resolve imports, build parent
    /// back-references, compute layers, and index short names.
    pub fn build(raws: Vec<RawPackage>) -> Result<Self> {
        let mut tree = Tree::default();
        let mut module_ids: BTreeMap<String, ModId> = BTreeMap::new();

        for raw in &raws {
            let id = PkgId(tree.packages.len() as u32);
            if tree.by_path.insert(raw.import_path.clone(), id).is_some() {
                anyhow::bail!("package listed twice: {}", raw.import_path);
            }
            let module = *module_ids.entry(raw.module.path.clone()).or_insert_with(|| {
                let id = ModId(tree.modules.len() as u32);
                tree.modules.push(raw.module.clone());
                id
            });
            tree.packages.push(Package {
                import_path: raw.import_path.clone(),
                name: raw.name.clone(),
                dir: raw.dir.clone(),
                module,
                files: raw.files.clone(),
                builds: raw.builds.clone(),
                imports: BTreeMap::new(),
                parents: Vec::new(),
                included: raw.included,
                goroot: raw.goroot,
                standard: raw.standard,
                dirty: raw.dirty,
                dep_dirty: raw.dep_dirty,
            });
        }

        // Resolve imports and parents.
        for (idx, raw) in raws.iter().enumerate() {
            let id = PkgId(idx as u32);
            for ipath in &raw.imports {
                let dep = *tree.by_path.get(ipath).with_context(|| {
                    format!("{} imports {ipath} which was not listed", raw.import_path)
                })?;
                tree.packages[idx].imports.insert(ipath.clone(), dep);
                tree.packages[dep.0 as usize].parents.push(id);
            }
        }

        tree.compute_layers()?;
        tree.index_short_names();
        Ok(tree)
    }

    fn compute_layers(&mut self) -> Result<()> {
        // depth(pkg) = 1 + max(depth of parents); roots have depth 0. Since
        // every parent of a dependency is one of its importers, iterating
        // layers deepest-first visits dependencies before dependents.
        let n = self.packages.len();
        let mut depth = vec![usize::MAX; n];
        let mut visiting = vec![false; n];

        fn visit(
            packages: &[Package],
            depth: &mut [usize],
            visiting: &mut [bool],
            idx: usize,
        ) -> Result<usize> {
            if depth[idx] != usize::MAX {
                return Ok(depth[idx]);
            }
            if visiting[idx] {
                anyhow::bail!("import cycle through {}", packages[idx].import_path);
            }
            visiting[idx] = true;
            let mut d = 0;
            for parent in &packages[idx].parents {
                d = d.max(visit(packages, depth, visiting, parent.0 as usize)? + 1);
            }
            visiting[idx] = false;
            depth[idx] = d;
            Ok(d)
        }

        let mut max_depth = 0;
        for idx in 0..n {
            max_depth = max_depth.max(visit(&self.packages, &mut depth, &mut visiting, idx)?);
        }

        let mut layers = vec![Vec::new(); if n == 0 { 0 } else { max_depth + 1 }];
        for (idx, d) in depth.iter().enumerate() {
            layers[*d].push(PkgId(idx as u32));
        }
        for layer in &mut layers {
            layer.sort_by(|a, b| {
                self.packages[a.0 as usize]
                    .import_path
                    .cmp(&self.packages[b.0 as usize].import_path)
            });
        }
        self.layers = layers;
        Ok(())
    }

    fn index_short_names(&mut self) {
        let mut index: BTreeMap<String, Vec<PkgId>> = BTreeMap::new();
        for pkg in &self.packages {
            for file in pkg.files.values() {
                for (alias, ipath) in &file.imports {
                    if let Some(&dep) = self.by_path.get(ipath) {
                        let entry = index.entry(alias.clone()).or_default();
                        if !entry.contains(&dep) {
                            entry.push(dep);
                        }
                    }
                }
            }
        }
        for candidates in index.values_mut() {
            candidates.sort_by(|a, b| {
                self.packages[a.0 as usize]
                    .import_path
                    .cmp(&self.packages[b.0 as usize].import_path)
            });
        }
        self.short_names = index;
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PkgId> {
        (0..self.packages.len() as u32).map(PkgId)
    }

    pub fn pkg(&self, id: PkgId) -> &Package {
        &self.packages[id.0 as usize]
    }

    pub fn pkg_mut(&mut self, id: PkgId) -> &mut Package {
        &mut self.packages[id.0 as usize]
    }

    pub fn module(&self, id: ModId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn module_mut(&mut self, id: ModId) -> &mut Module {
        &mut self.modules[id.0 as usize]
    }

    pub fn module_of(&self, id: PkgId) -> &Module {
        self.module(self.pkg(id).module)
    }

    pub fn lookup(&self, import_path: &str) -> Option<PkgId> {
        self.by_path.get(import_path).copied()
    }

    pub fn layers(&self) -> &[Vec<PkgId>] {
        &self.layers
    }

    /// Resolve a file-local import alias to the dependency it names.
    pub fn resolve_file_alias(&self, id: PkgId, file: &str, alias: &str) -> Option<PkgId> {
        let pkg = self.pkg(id);
        let ipath = pkg.files.get(file)?.imports.get(alias)?;
        pkg.imports.get(ipath).copied()
    }

    /// Backup name lookup: resolve a bare package short name against every
    /// import alias known anywhere in the tree. Used when a diagnostic names
    /// an alias whose import lives in a file excluded from the current
    /// configuration. The lookup is heuristic: on ambiguity the candidate in
    /// the same module as the requesting package wins, otherwise the first
    /// candidate by import path.
    pub fn backup_name_lookup(&self, alias: &str, from: PkgId) -> Option<PkgId> {
        let candidates = self.short_names.get(alias)?;
        let module = self.pkg(from).module;
        candidates
            .iter()
            .find(|&&c| self.pkg(c).module == module)
            .or_else(|| candidates.first())
            .copied()
    }

    /// Read the sources of every file selected by a configuration that has
    /// not been read yet. Each slot is write-once.
    pub fn load_sources(&mut self, id: PkgId, cfg_idx: usize) -> Result<()> {
        let pkg = self.pkg_mut(id);
        let names = pkg.builds[cfg_idx].files.clone();
        for name in names {
            let file = pkg
                .files
                .get_mut(&name)
                .unwrap_or_else(|| panic!("configuration names unknown file {name}"));
            if file.source.is_none() {
                let src = std::fs::read_to_string(&file.path)
                    .with_context(|| format!("read source: {}", file.path.display()))?;
                file.source = Some(src);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(path: &str, module: &str, imports: &[&str]) -> RawPackage {
        RawPackage {
            import_path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            dir: PathBuf::from(format!("/src/{path}")),
            module: Module {
                path: module.to_string(),
                version: "v1.0.0".to_string(),
                dir: PathBuf::from(format!("/mod/{module}")),
                main: false,
                replace: None,
            },
            files: BTreeMap::new(),
            builds: vec![BuildConfig {
                files: Vec::new(),
                platforms: vec!["zos".to_string()],
            }],
            imports: imports.iter().map(|s| s.to_string()).collect(),
            included: false,
            goroot: false,
            standard: false,
            dirty: true,
            dep_dirty: false,
        }
    }

    fn with_alias(mut raw: RawPackage, file: &str, alias: &str, ipath: &str) -> RawPackage {
        raw.files.insert(
            file.to_string(),
            GoFile {
                name: file.to_string(),
                path: PathBuf::from(format!("/src/{file}")),
                imports: [(alias.to_string(), ipath.to_string())].into(),
                source: Some(String::new()),
                replaced: None,
            },
        );
        raw
    }

    #[test]
    fn layers_put_dependencies_below_importers() {
        let tree = Tree::build(vec![
            raw("example.com/app", "example.com/app", &["example.com/lib"]),
            raw("example.com/lib", "example.com/lib", &["example.com/base"]),
            raw("example.com/base", "example.com/base", &[]),
        ])
        .unwrap();

        let app = tree.lookup("example.com/app").unwrap();
        let lib = tree.lookup("example.com/lib").unwrap();
        let base = tree.lookup("example.com/base").unwrap();
        assert_eq!(tree.layers()[0], vec![app]);
        assert_eq!(tree.layers()[1], vec![lib]);
        assert_eq!(tree.layers()[2], vec![base]);
        assert_eq!(tree.pkg(lib).parents, vec![app]);
    }

    #[test]
    fn unlisted_import_is_a_discovery_error() {
        let err = Tree::build(vec![raw("a", "a", &["missing"])]).unwrap_err();
        assert!(format!("{err:#}").contains("was not listed"));
    }

    #[test]
    fn import_cycles_are_rejected() {
        let err = Tree::build(vec![raw("a", "a", &["b"]), raw("b", "b", &["a"])]).unwrap_err();
        assert!(format!("{err:#}").contains("import cycle"));
    }

    #[test]
    fn backup_lookup_prefers_the_same_module() {
        // Two different packages are imported under the alias "sys": one
        // from an unrelated module and one from the requester's own module.
        let tree = Tree::build(vec![
            with_alias(
                raw("other.com/app", "other.com/app", &["other.com/sys"]),
                "main.go",
                "sys",
                "other.com/sys",
            ),
            raw("other.com/sys", "other.com/app", &[]),
            with_alias(
                raw("example.com/app", "example.com/mod", &["example.com/sys"]),
                "main.go",
                "sys",
                "example.com/sys",
            ),
            raw("example.com/sys", "example.com/mod", &[]),
            raw("zzz.example/solo", "zzz.example/solo", &[]),
        ])
        .unwrap();

        let requester = tree.lookup("example.com/app").unwrap();
        let found = tree.backup_name_lookup("sys", requester).unwrap();
        assert_eq!(tree.pkg(found).import_path, "example.com/sys");

        // A requester in neither module falls back to the first candidate.
        let outsider = tree.lookup("zzz.example/solo").unwrap();
        let found = tree.backup_name_lookup("sys", outsider).unwrap();
        assert_eq!(tree.pkg(found).import_path, "example.com/sys");
        assert!(tree.backup_name_lookup("nope", requester).is_none());
    }
}
