use std::path::Path;

use anyhow::{Context, Result};

use crate::apply::PortReport;
use crate::check::Checker;
use crate::config::PortOptions;
use crate::controller::{Controller, Lister, PortingError};
use crate::directive::Directives;
use crate::gotool::GoTool;
use crate::workfile::WorkFile;

/// Result of a full porting run.
#[derive(Debug)]
pub struct PortSummary {
    pub report: PortReport,
    /// Packages the run could not port automatically.
    pub manual: Vec<PortingError>,
}

/// The external collaborators a run is wired with.
pub struct Collaborators {
    pub lister: Box<dyn Lister>,
    pub checker: Box<dyn Checker>,
    pub gotool: Box<dyn GoTool>,
}

/// The main entry point for porting: set up the cache and the temporary
/// workspace file, drive the controller to a fixpoint, apply the decisions,
/// and promote the workspace file on clean non-dry-run completion.
///
/// The factory receives the temporary workspace file every collaborator
/// must target; the user's own workspace file is never edited directly.
pub fn port(
    paths: &[String],
    opts: &PortOptions,
    directives: Directives,
    make_collaborators: impl FnOnce(&Path) -> Collaborators,
) -> Result<PortSummary> {
    std::fs::create_dir_all(&opts.cache_dir).with_context(|| {
        format!("initialize cache directory: {}", opts.cache_dir.display())
    })?;

    let workfile = WorkFile::setup(&opts.gowork)?;
    let collab = make_collaborators(workfile.temp_path());

    let mut controller = Controller::new(
        opts.clone(),
        directives,
        paths.to_vec(),
        collab.lister,
        collab.checker,
        collab.gotool,
    );

    let run = controller.run().and_then(|()| controller.apply());
    match run {
        Ok(report) => {
            if opts.dry_run {
                workfile.discard();
            } else {
                workfile.promote()?;
            }
            Ok(PortSummary {
                report,
                manual: controller.errors().to_vec(),
            })
        }
        Err(err) => {
            // Leave the edited copy in place so partial work is not lost.
            let temp = workfile.abandon();
            println!("Workspace edits were left in {}", temp.display());
            Err(err)
        }
    }
}
