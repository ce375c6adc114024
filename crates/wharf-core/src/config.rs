use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Options for a single porting run.
///
/// This is the explicit context object threaded through the engine; there is
/// no process-wide configuration state.
#[derive(Debug, Clone)]
pub struct PortOptions {
    /// Target platform tag (the `GOOS` the workspace is being ported to).
    pub goos: String,
    /// Extra build tags active for this run (`--tags`).
    pub build_tags: Vec<String>,
    /// Path to the user's workspace file (`GOWORK`).
    pub gowork: PathBuf,
    /// Directory for generated override files, one subdirectory per package.
    pub cache_dir: PathBuf,
    /// Directory that imported modules are cloned into.
    pub import_dir: PathBuf,
    pub verbose: bool,
    pub dry_run: bool,
    /// Clone imported modules from VCS instead of the local module cache.
    pub use_vcs: bool,
    /// Emit a diff per touched repository (requires `use_vcs`).
    pub generate_patches: bool,
}

impl PortOptions {
    /// Build options from a `go env` table, applying the default cache and
    /// import directory layout relative to the workspace file.
    pub fn from_go_env(
        env: &BTreeMap<String, String>,
        import_dir: Option<PathBuf>,
        build_tags: Vec<String>,
    ) -> Result<Self> {
        let gowork = env
            .get("GOWORK")
            .filter(|v| !v.is_empty())
            .context("no Go workspace found; initialize one with `go work init`")?;
        let gowork = PathBuf::from(gowork);
        let goos = env
            .get("GOOS")
            .filter(|v| !v.is_empty())
            .context("GOOS missing from go env")?
            .clone();
        let base = gowork.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        Ok(Self {
            goos,
            build_tags,
            cache_dir: base.join(".wharf_cache"),
            import_dir: import_dir.unwrap_or_else(|| base.join("wharf_port")),
            gowork,
            verbose: false,
            dry_run: false,
            use_vcs: false,
            generate_patches: false,
        })
    }

    /// Directory holding generated override files for one package.
    pub fn package_cache_dir(&self, import_path: &str) -> PathBuf {
        self.cache_dir.join(import_path)
    }

    /// Directory a module is cloned into when imported.
    pub fn module_import_dir(&self, module_path: &str) -> PathBuf {
        self.import_dir.join(module_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_relative_to_the_workspace_file() {
        let opts = PortOptions::from_go_env(
            &env(&[("GOWORK", "/work/go.work"), ("GOOS", "zos")]),
            None,
            Vec::new(),
        )
        .unwrap();
        assert_eq!(opts.cache_dir, PathBuf::from("/work/.wharf_cache"));
        assert_eq!(opts.import_dir, PathBuf::from("/work/wharf_port"));
        assert_eq!(
            opts.package_cache_dir("example.com/lib"),
            PathBuf::from("/work/.wharf_cache/example.com/lib")
        );
    }

    #[test]
    fn missing_workspace_is_an_error() {
        let err = PortOptions::from_go_env(&env(&[("GOOS", "zos")]), None, Vec::new()).unwrap_err();
        assert!(format!("{err:#}").contains("no Go workspace"));
    }
}
