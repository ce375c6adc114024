use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::diag::{TypeDiag, TypesSummary};

/// Porting progress of one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortState {
    /// Not yet inspected in this sweep.
    Unknown,
    /// Initial type-check completed; errors classified.
    Built,
    /// Types clean under the default configuration; no work required.
    Valid,
    /// A parent needs this package to change; it will be re-tagged.
    BrokeParent,
    /// Bad imports found; dependencies must be ported before retrying.
    PortingDependencies,
    /// A non-default configuration (or directive) produced a clean check.
    Patched,
    /// No admissible configuration or directive; terminal failure.
    Exhausted,
}

impl PortState {
    /// Terminal states are never re-ported within a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, PortState::Valid | PortState::Patched | PortState::Exhausted)
    }

    /// Intermediate states force another sweep when still present at the
    /// end of one.
    pub fn is_intermediate(self) -> bool {
        matches!(
            self,
            PortState::Built | PortState::BrokeParent | PortState::PortingDependencies
        )
    }

    /// A dependency in this state can still be pushed toward a different
    /// configuration on behalf of a broken parent. `Valid` is portable: a
    /// parent may need a package re-tagged even though its default
    /// configuration checks cleanly on its own.
    pub fn is_portable_dependency(self) -> bool {
        !matches!(self, PortState::Patched | PortState::Exhausted)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortState::Unknown => "unknown",
            PortState::Built => "built",
            PortState::Valid => "valid",
            PortState::BrokeParent => "broke-parent",
            PortState::PortingDependencies => "porting-dependencies",
            PortState::Patched => "patched",
            PortState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Mutable porting state of one package. Keyed by import path so that it
/// survives package-tree reloads.
#[derive(Debug)]
pub struct Slot {
    pub ps: PortState,
    /// Index of the configuration currently under consideration. Equal to
    /// the number of configurations once the search is exhausted.
    pub cfg_idx: usize,
    /// Cached result of the most recent type-check.
    pub types: Option<Rc<TypesSummary>>,
    pub errs: Vec<TypeDiag>,
}

impl Slot {
    fn new(ps: PortState) -> Self {
        Self {
            ps,
            cfg_idx: 0,
            types: None,
            errs: Vec::new(),
        }
    }
}

/// The controller's table of per-package state.
#[derive(Debug, Default)]
pub struct StateTable {
    slots: BTreeMap<String, Slot>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, import_path: &str) -> bool {
        self.slots.contains_key(import_path)
    }

    /// Insert a fresh slot for a newly discovered package.
    pub fn insert(&mut self, import_path: &str, pinned_exhausted: bool) {
        let ps = if pinned_exhausted {
            PortState::Exhausted
        } else {
            PortState::Unknown
        };
        self.slots.insert(import_path.to_string(), Slot::new(ps));
    }

    pub fn get(&self, import_path: &str) -> Option<&Slot> {
        self.slots.get(import_path)
    }

    pub fn slot(&self, import_path: &str) -> &Slot {
        self.slots
            .get(import_path)
            .unwrap_or_else(|| panic!("no state associated with package {import_path}"))
    }

    pub fn slot_mut(&mut self, import_path: &str) -> &mut Slot {
        self.slots
            .get_mut(import_path)
            .unwrap_or_else(|| panic!("no state associated with package {import_path}"))
    }

    /// Drop state for packages a reload no longer lists; they are new
    /// entities if they ever reappear.
    pub fn retain(&mut self, listed: &BTreeSet<String>) {
        self.slots.retain(|path, _| listed.contains(path));
    }
}
