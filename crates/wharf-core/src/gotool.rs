use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

/// Workspace-edit and module-query operations the porting engine consumes.
/// Each workspace edit must be atomic with respect to the workspace file.
pub trait GoTool {
    /// `replace(path, version)`: pin a module to a specific version.
    fn work_edit_replace(&mut self, module_path: &str, version: &str) -> Result<()>;
    /// Remove a replace directive.
    fn work_edit_drop_replace(&mut self, module_path: &str) -> Result<()>;
    /// Add a directory as a workspace member.
    fn work_use(&mut self, dir: &Path) -> Result<()>;
    /// Latest available version of a module (`list -u -m`).
    fn list_mod_update(&mut self, module_path: &str) -> Result<String>;
    /// Whether a module currently resolves as a workspace main module.
    fn list_mod_main(&mut self, module_path: &str) -> Result<bool>;
    /// Directory a package import path resolves to.
    fn list_pkg_dir(&mut self, import_path: &str) -> Result<PathBuf>;
    fn clone_module_from_vcs(&mut self, dest: &Path, module_path: &str, version: &str)
        -> Result<()>;
    fn clone_module_from_cache(&mut self, src: &Path, dest: &Path, module_path: &str)
        -> Result<()>;
    /// Write a diff of the repository at `repo` to `out`.
    fn git_diff(&mut self, repo: &Path, out: &Path) -> Result<()>;
}

/// A module-query failure. Excludable failures are the classes the engine
/// ignores: a module missing from the cache right after a replace, or a
/// known-unreachable proxy.
#[derive(Debug)]
pub struct ListError {
    pub message: String,
    pub excludable: bool,
}

impl fmt::Display for ListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ListError {}

/// Whether an error from a [`GoTool`] query may be ignored.
pub fn is_excludable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ListError>().map_or(false, |e| e.excludable)
}

const EXCLUDABLE_PATTERNS: &[&str] = &[
    "missing go.sum entry",
    "not a known dependency",
    "no required module provides package",
    "module lookup disabled",
    "cannot find module providing package",
    "dial tcp",
    "i/o timeout",
];

fn classify_list_error(message: String) -> anyhow::Error {
    let excludable = EXCLUDABLE_PATTERNS.iter().any(|p| message.contains(p));
    anyhow::Error::new(ListError {
        message,
        excludable,
    })
}

/// Production implementation driving the `go` and `git` binaries. All
/// workspace operations target the temporary workspace file, never the
/// user's own.
pub struct GoCli {
    workfile: PathBuf,
}

impl GoCli {
    pub fn new(workfile: &Path) -> Self {
        Self {
            workfile: workfile.to_path_buf(),
        }
    }

    fn go(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("go")
            .args(args)
            .env("GOWORK", &self.workfile)
            .output()
            .with_context(|| format!("exec go {}", args.join(" ")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            anyhow::bail!("go {} failed: {stderr}", args.join(" "));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn go_list(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("go")
            .args(args)
            .env("GOWORK", &self.workfile)
            .output()
            .with_context(|| format!("exec go {}", args.join(" ")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(classify_list_error(format!(
                "go {} failed: {stderr}",
                args.join(" ")
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl GoTool for GoCli {
    fn work_edit_replace(&mut self, module_path: &str, version: &str) -> Result<()> {
        let replace = format!("{module_path}={module_path}@{version}");
        let workfile = self.workfile.display().to_string();
        self.go(&["work", "edit", "-replace", &replace, &workfile])?;
        Ok(())
    }

    fn work_edit_drop_replace(&mut self, module_path: &str) -> Result<()> {
        let workfile = self.workfile.display().to_string();
        self.go(&["work", "edit", "-dropreplace", module_path, &workfile])?;
        Ok(())
    }

    fn work_use(&mut self, dir: &Path) -> Result<()> {
        let dir = dir.display().to_string();
        let workfile = self.workfile.display().to_string();
        self.go(&["work", "edit", "-use", &dir, &workfile])?;
        Ok(())
    }

    fn list_mod_update(&mut self, module_path: &str) -> Result<String> {
        let version = self.go_list(&[
            "list",
            "-u",
            "-m",
            "-f",
            "{{if .Update}}{{.Update.Version}}{{else}}{{.Version}}{{end}}",
            module_path,
        ])?;
        if version.is_empty() {
            return Err(classify_list_error(format!(
                "no version reported for module {module_path}"
            )));
        }
        Ok(version)
    }

    fn list_mod_main(&mut self, module_path: &str) -> Result<bool> {
        let out = self.go_list(&["list", "-m", "-f", "{{.Main}}", module_path])?;
        Ok(out == "true")
    }

    fn list_pkg_dir(&mut self, import_path: &str) -> Result<PathBuf> {
        let dir = self.go_list(&["list", "-f", "{{.Dir}}", import_path])?;
        if dir.is_empty() {
            return Err(classify_list_error(format!(
                "no directory reported for package {import_path}"
            )));
        }
        Ok(PathBuf::from(dir))
    }

    fn clone_module_from_vcs(
        &mut self,
        dest: &Path,
        module_path: &str,
        version: &str,
    ) -> Result<()> {
        let url = format!("https://{module_path}.git");
        let out = Command::new("git")
            .args(["clone", "--depth", "1", "--branch", version, &url])
            .arg(dest)
            .output()
            .with_context(|| format!("exec git clone {url}"))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            anyhow::bail!("git clone {url} at {version} failed: {stderr}");
        }
        Ok(())
    }

    fn clone_module_from_cache(
        &mut self,
        src: &Path,
        dest: &Path,
        module_path: &str,
    ) -> Result<()> {
        copy_module_dir(src, dest)
            .with_context(|| format!("clone module {module_path} from cache"))
    }

    fn git_diff(&mut self, repo: &Path, out: &Path) -> Result<()> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo)
            .arg("diff")
            .output()
            .with_context(|| format!("exec git diff in {}", repo.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            anyhow::bail!("git diff in {} failed: {stderr}", repo.display());
        }
        std::fs::write(out, &output.stdout)
            .with_context(|| format!("write patch: {}", out.display()))?;
        Ok(())
    }
}

/// Copy a module directory tree. Module-cache files are read-only, so the
/// copies are made writable on the way.
fn copy_module_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of its root");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create dir: {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir: {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {} to {}", entry.path().display(), target.display()))?;
            let mut perms = std::fs::metadata(&target)
                .with_context(|| format!("stat {}", target.display()))?
                .permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            std::fs::set_permissions(&target, perms)
                .with_context(|| format!("chmod {}", target.display()))?;
        }
    }
    Ok(())
}
