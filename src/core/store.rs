//! Store abstraction for IBP's on-disk state.
//!
//! Unlike a multi-agent workspace, a single IBP project has exactly one
//! state root (`.ibp/` by default, overridable via config). Within it,
//! two kinds of store coexist:
//!
//! - `Registry`: the persistent, cross-book registry and oracle cache —
//!   `registry.db` and `oracle_cache.db`, long-lived across every run.
//! - `Run`: a single run's scratch and artifact area under
//!   `runs/<run_id>/`, holding `runs.db`, `audit.jsonl`, and the
//!   proposal/plan/report artifacts for that run.
//!
//! All mutations to either kind go through `core::broker::DbBroker`
//! rather than touching files directly.

use std::path::PathBuf;

/// Store type discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Persistent, project-wide registry and oracle cache.
    Registry,
    /// Per-run scratch and artifact area, scoped to one `run_id`.
    Run,
}

/// Handle to an on-disk IBP state directory.
#[derive(Debug, Clone)]
pub struct Store {
    /// Store kind (Registry or Run).
    pub kind: StoreKind,
    /// Absolute path to the store root directory.
    pub root: PathBuf,
}

impl Store {
    /// The persistent registry store at `<project_root>/.ibp`.
    pub fn registry(project_root: &std::path::Path) -> Self {
        Self {
            kind: StoreKind::Registry,
            root: project_root.join(".ibp"),
        }
    }

    /// A run-scoped store at `<project_root>/.ibp/runs/<run_id>`.
    pub fn run(project_root: &std::path::Path, run_id: &str) -> Self {
        Self {
            kind: StoreKind::Run,
            root: project_root.join(".ibp").join("runs").join(run_id),
        }
    }
}
