use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The workspace-file protocol: all edits go to a temporary copy of the
/// user's workspace file, which is promoted over the original only on clean
/// completion.
#[derive(Debug)]
pub struct WorkFile {
    original: PathBuf,
    temp: PathBuf,
}

impl WorkFile {
    /// Copy the workspace file to a temporary sibling that edits target.
    pub fn setup(gowork: &Path) -> Result<Self> {
        let mut temp = gowork.as_os_str().to_os_string();
        temp.push(".wharf");
        let temp = PathBuf::from(temp);
        std::fs::copy(gowork, &temp).with_context(|| {
            format!(
                "copy workspace file {} to {}",
                gowork.display(),
                temp.display()
            )
        })?;
        Ok(Self {
            original: gowork.to_path_buf(),
            temp,
        })
    }

    /// Path the Go tool should treat as `GOWORK` during the run.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Back up the original as `<path>.backup` and move the temporary over
    /// it. On failure the temporary is left in place and its path reported.
    pub fn promote(self) -> Result<()> {
        let result = (|| -> Result<()> {
            let mut backup = self.original.as_os_str().to_os_string();
            backup.push(".backup");
            let backup = PathBuf::from(backup);
            std::fs::copy(&self.original, &backup)
                .with_context(|| format!("back up workspace to {}", backup.display()))?;
            println!("Backed up workspace to {}", backup.display());

            std::fs::copy(&self.temp, &self.original)
                .with_context(|| format!("replace workspace {}", self.original.display()))?;
            Ok(())
        })();

        if let Err(err) = result {
            println!("Unable to replace the current workspace file with our copy.");
            println!("Some patches might not be applied.");
            println!("Our copy is located here: {}", self.temp.display());
            return Err(err);
        }

        let mut sum = self.temp.as_os_str().to_os_string();
        sum.push(".sum");
        let sum = PathBuf::from(sum);
        if let Err(err) = std::fs::remove_file(&sum) {
            if err.kind() != std::io::ErrorKind::NotFound {
                println!("WARNING - unable to remove our workspace sum file: {}", sum.display());
            }
        }
        if std::fs::remove_file(&self.temp).is_err() {
            println!("WARNING - unable to remove our workspace file: {}", self.temp.display());
        }
        Ok(())
    }

    /// Drop the temporary without touching the original (dry runs).
    pub fn discard(self) {
        let _ = std::fs::remove_file(&self.temp);
    }

    /// Leave the temporary on disk and report where it is (failed runs).
    pub fn abandon(self) -> PathBuf {
        self.temp
    }
}
