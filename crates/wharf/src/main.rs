use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use wharf_core::config::PortOptions;
use wharf_core::directive::Directives;
use wharf_core::gotool::GoCli;
use wharf_core::porting::{self, Collaborators};

mod gocheck;
mod golist;

/// Port Go workspaces to a new target platform.
#[derive(Parser, Debug)]
#[command(name = "wharf", version, about = "Automates porting Go workspaces to a new target platform.")]
struct Cli {
    /// Packages to port.
    #[arg(value_name = "PACKAGES", required = true)]
    paths: Vec<String>,

    /// Enable verbose output.
    #[arg(short = 'v')]
    verbose: bool,

    /// Dry mode: make suggestions but don't perform changes.
    #[arg(short = 'n')]
    dry_run: bool,

    /// Run `go test` on the target packages after the porting stage.
    #[arg(short = 't')]
    test: bool,

    /// Clone imported modules from VCS instead of the module cache.
    #[arg(short = 'q')]
    vcs: bool,

    /// Save patch files for each touched repository (requires -q).
    #[arg(short = 'p')]
    patches: bool,

    /// Force the operation even if the import directory already exists.
    #[arg(short = 'f')]
    force: bool,

    /// Directory to store imported modules in.
    #[arg(short = 'd', value_name = "DIR")]
    import_dir: Option<PathBuf>,

    /// Directive file with additional code edits.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Comma-separated list of extra build tags.
    #[arg(long, value_name = "TAGS", value_delimiter = ',')]
    tags: Vec<String>,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            println!("Porting failed due to errors mentioned above");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<std::process::ExitCode> {
    if cli.patches && !cli.vcs {
        anyhow::bail!("cannot use -p without enabling vcs cloning (-q)");
    }

    let env = go_env().context("read go env")?;
    let mut opts = PortOptions::from_go_env(&env, cli.import_dir, cli.tags.clone())?;
    opts.verbose = cli.verbose;
    opts.dry_run = cli.dry_run;
    opts.use_vcs = cli.vcs;
    opts.generate_patches = cli.patches;

    if opts.verbose {
        println!("Import path set to: {}", opts.import_dir.display());
    }
    if !cli.force && !confirm_import_dir(&opts)? {
        return Ok(std::process::ExitCode::SUCCESS);
    }

    let directives = match &cli.config {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("read config file: {}", path.display()))?;
            Directives::parse(&raw)
                .with_context(|| format!("parse config file: {}", path.display()))?
        }
        None => Directives::default(),
    };

    let goarch = env.get("GOARCH").cloned().unwrap_or_default();
    let goos = opts.goos.clone();
    let build_tags = cli.tags.clone();
    let summary = porting::port(&cli.paths, &opts, directives, |workfile| Collaborators {
        lister: Box::new(golist::GoLister::new(workfile, &goos, &goarch, &build_tags)),
        checker: Box::new(gocheck::GoBuildChecker::new(workfile)),
        gotool: Box::new(GoCli::new(workfile)),
    })?;

    if !summary.manual.is_empty() {
        println!(
            "{} package(s) could not be ported automatically",
            summary.manual.len()
        );
        return Ok(std::process::ExitCode::from(1));
    }

    println!("Patches applied successfully!");
    if cli.test {
        println!();
        println!("Running tests...");
        let out = Command::new("go")
            .arg("test")
            .args(&cli.paths)
            .output()
            .context("exec go test")?;
        if out.status.success() {
            println!("Tests passed!");
        } else {
            println!(
                "Tests failed:\n{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
            return Ok(std::process::ExitCode::from(1));
        }
    }

    Ok(std::process::ExitCode::SUCCESS)
}

/// Guard against clobbering an existing import directory: ask on a
/// terminal, refuse otherwise. Returns false when the user declines.
fn confirm_import_dir(opts: &PortOptions) -> Result<bool> {
    if std::fs::symlink_metadata(&opts.import_dir).is_err() {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        anyhow::bail!(
            "import destination already exists ({}); will not overwrite",
            opts.import_dir.display()
        );
    }
    println!(
        "WARNING: Import destination already exists ({})",
        opts.import_dir.display()
    );
    println!("WARNING: Running Wharf may cause some data to get overridden");
    print!("Run anyways? [y/N]: ");
    use std::io::Write;
    std::io::stdout().flush().ok();
    let mut confirm = String::new();
    std::io::stdin()
        .read_line(&mut confirm)
        .context("read confirmation")?;
    Ok(matches!(confirm.trim(), "y" | "Y"))
}

fn go_env() -> Result<BTreeMap<String, String>> {
    let out = Command::new("go")
        .args(["env", "-json"])
        .output()
        .context("exec go env")?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        anyhow::bail!("go env failed: {stderr}");
    }
    let values: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&out.stdout).context("parse go env output")?;
    Ok(values
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}
