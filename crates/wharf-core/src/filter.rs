use anyhow::Result;

use crate::check::Harness;
use crate::diag::{DiagReason, TypeDiag};
use crate::package::{PkgId, Tree};
use crate::state::StateTable;

/// Stateful predicate driven by the configuration filter. The filter calls
/// `on_new_candidate` before feeding a candidate's diagnostics, which is
/// where a visitor resets whatever it accumulates; the filter itself never
/// touches visitor state.
pub trait ConfigVisitor {
    fn on_new_candidate(&mut self, cfg_idx: usize);

    /// Judge one diagnostic of the current candidate. A candidate is
    /// accepted only if every diagnostic is accepted here or is soft.
    fn visit(&mut self, diag: &TypeDiag) -> bool;
}

/// Advance a package's configuration index, starting from its current
/// value, until a configuration satisfies the visitor or the configurations
/// are exhausted (`cfg_idx == builds.len()`).
///
/// A candidate passes in two steps: the package itself type-checks with
/// every diagnostic accepted, and then every parent, re-checked with the
/// candidate's types swapped in, produces no diagnostic that resolves back
/// to the package under test.
pub fn filter_configs(
    tree: &mut Tree,
    states: &mut StateTable,
    harness: &mut Harness,
    id: PkgId,
    visitor: &mut dyn ConfigVisitor,
) -> Result<()> {
    let path = tree.pkg(id).import_path.clone();
    loop {
        let cfg_idx = states.slot(&path).cfg_idx;
        if cfg_idx >= tree.pkg(id).builds.len() {
            return Ok(());
        }
        tree.load_sources(id, cfg_idx)?;
        visitor.on_new_candidate(cfg_idx);
        if validate(tree, states, harness, id, visitor)? {
            return Ok(());
        }
        states.slot_mut(&path).cfg_idx += 1;
    }
}

fn validate(
    tree: &mut Tree,
    states: &mut StateTable,
    harness: &mut Harness,
    id: PkgId,
    visitor: &mut dyn ConfigVisitor,
) -> Result<bool> {
    let path = tree.pkg(id).import_path.clone();

    let (types, diags) = harness.check(tree, states, id, false)?;
    let mut pass = true;
    for diag in &diags {
        if !visitor.visit(diag) && !diag.soft {
            pass = false;
        }
    }
    if !pass {
        return Ok(false);
    }

    // Commit the candidate types so the parent re-checks resolve this
    // package against them. A later candidate simply overwrites.
    states.slot_mut(&path).types = Some(types);

    let parents = tree.pkg(id).parents.clone();
    for parent in parents {
        let parent_cfg = states.slot(&tree.pkg(parent).import_path).cfg_idx;
        if parent_cfg >= tree.pkg(parent).builds.len() {
            // The parent exhausted its own configuration search; there is
            // nothing coherent to re-check it under.
            continue;
        }
        tree.load_sources(parent, parent_cfg)?;
        let (_, diags) = harness.check(tree, states, parent, false)?;
        for diag in &diags {
            let DiagReason::BadImportName { pkg_alias, .. } = &diag.reason else {
                // Pre-existing parent breakage that does not reference the
                // package under test does not reject the candidate.
                continue;
            };
            let referenced = tree
                .resolve_file_alias(parent, &diag.file, pkg_alias)
                .or_else(|| tree.backup_name_lookup(pkg_alias, parent))
                .unwrap_or_else(|| {
                    panic!(
                        "bad import error on {pkg_alias:?} in {} but no known name in lookup",
                        tree.pkg(parent).import_path
                    )
                });
            if referenced == id {
                return Ok(false);
            }
        }
    }

    Ok(true)
}
