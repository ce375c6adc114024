use std::collections::BTreeMap;

use serde::Serialize;

/// Action taken on a module during the run.
///
/// The derived order is the promotion order of the driver's retry sequence:
/// an upgrade attempt (`Updated`) may later be finalized as a pin at the
/// original version (`Locked`), and a patched module is promoted to
/// `Imported` so the applier clones it into the workspace. A decision never
/// moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModAction {
    Updated,
    Locked,
    Imported,
}

/// Version decision for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModDecision {
    /// Version the module had when first seen; never changes.
    pub original: String,
    /// Version the workspace currently pins the module to.
    pub version: String,
    pub action: ModAction,
}

/// Record of per-module decisions taken during the run. The journal is the
/// sole source of workspace edits consumed by the applier, and it persists
/// across package-tree reloads.
#[derive(Debug, Default)]
pub struct Journal {
    entries: BTreeMap<String, ModDecision>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, module_path: &str) -> Option<&ModDecision> {
        self.entries.get(module_path)
    }

    /// Record a decision. The first note for a module fixes its `original`
    /// version; later notes may update the pinned version and promote the
    /// action, but never demote it.
    pub fn note(&mut self, module_path: &str, original: &str, version: &str, action: ModAction) {
        match self.entries.get_mut(module_path) {
            None => {
                self.entries.insert(
                    module_path.to_string(),
                    ModDecision {
                        original: original.to_string(),
                        version: version.to_string(),
                        action,
                    },
                );
            }
            Some(entry) => {
                if action < entry.action {
                    return;
                }
                entry.action = action;
                entry.version = version.to_string();
            }
        }
    }

    /// Promote an existing entry to `Imported`. No-op for unknown modules:
    /// main-module packages never enter the journal.
    pub fn promote_imported(&mut self, module_path: &str) {
        if let Some(entry) = self.entries.get_mut(module_path) {
            entry.action = ModAction::Imported;
        }
    }

    /// Deterministic iteration for apply time.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModDecision)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_promotes_and_never_demotes() {
        let mut journal = Journal::new();
        journal.note("example.com/dep", "v1.0.0", "v1.2.0", ModAction::Updated);
        journal.note("example.com/dep", "v9.9.9", "v1.0.0", ModAction::Locked);

        let entry = journal.get("example.com/dep").unwrap();
        assert_eq!(entry.original, "v1.0.0", "original must not change");
        assert_eq!(entry.version, "v1.0.0");
        assert_eq!(entry.action, ModAction::Locked);

        // A later, lower action leaves the entry alone.
        journal.note("example.com/dep", "v1.0.0", "v1.2.0", ModAction::Updated);
        let entry = journal.get("example.com/dep").unwrap();
        assert_eq!(entry.action, ModAction::Locked);
        assert_eq!(entry.version, "v1.0.0");
    }

    #[test]
    fn promote_imported_requires_an_entry() {
        let mut journal = Journal::new();
        journal.promote_imported("example.com/none");
        assert!(journal.is_empty());

        journal.note("example.com/dep", "v1.0.0", "v1.0.0", ModAction::Locked);
        journal.promote_imported("example.com/dep");
        assert_eq!(
            journal.get("example.com/dep").unwrap().action,
            ModAction::Imported
        );
    }

    #[test]
    fn iteration_is_sorted_by_module_path() {
        let mut journal = Journal::new();
        journal.note("b.example/two", "v1", "v1", ModAction::Locked);
        journal.note("a.example/one", "v1", "v1", ModAction::Locked);
        let paths: Vec<&str> = journal.iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a.example/one", "b.example/two"]);
    }
}
