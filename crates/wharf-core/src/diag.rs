use std::collections::BTreeSet;
use std::rc::Rc;

use serde::Serialize;

/// Why a type-check diagnostic occurred, as classified at ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagReason {
    /// A reference `alias.Name` where `Name` is not exported by the package
    /// imported under `alias` on this platform.
    BadImportName { pkg_alias: String, name: String },
    /// A bare identifier that is not declared by the selected files.
    BadName { name: String },
    /// Anything the porting engine has no strategy for.
    Other,
}

/// One diagnostic from the external type checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeDiag {
    /// File the diagnostic is anchored to (a key of the package's file map).
    pub file: String,
    pub message: String,
    /// Recoverable errors; these never reject a build configuration.
    pub soft: bool,
    pub reason: DiagReason,
}

impl TypeDiag {
    pub fn bad_import_name(file: &str, alias: &str, name: &str) -> Self {
        Self {
            file: file.to_string(),
            message: format!("undefined: {alias}.{name}"),
            soft: false,
            reason: DiagReason::BadImportName {
                pkg_alias: alias.to_string(),
                name: name.to_string(),
            },
        }
    }

    pub fn bad_name(file: &str, name: &str) -> Self {
        Self {
            file: file.to_string(),
            message: format!("undefined: {name}"),
            soft: false,
            reason: DiagReason::BadName {
                name: name.to_string(),
            },
        }
    }

    pub fn other(file: &str, message: &str, soft: bool) -> Self {
        Self {
            file: file.to_string(),
            message: message.to_string(),
            soft,
            reason: DiagReason::Other,
        }
    }
}

/// The opaque result of type-checking a package: enough surface for
/// dependents to resolve references against. Cached per package by the
/// controller and swapped in when re-checking parents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypesSummary {
    /// Package name (the identifier, not the import path).
    pub name: String,
    /// Exported symbols visible under the checked configuration.
    pub exports: BTreeSet<String>,
}

impl TypesSummary {
    /// Summary for a configuration that selects no files at all
    /// ("build constraints exclude all Go files").
    pub fn empty(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            exports: BTreeSet::new(),
        })
    }
}
