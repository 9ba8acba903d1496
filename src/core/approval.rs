//! Approval Gate (component C7): the two-gate state machine governing
//! `PROPOSED -> AWAITING_APPROVAL -> APPROVED -> APPLIED`, plus its
//! second instance for the chunk/placement plan (spec.md §4.7).

use crate::core::broker::DbBroker;
use crate::core::error::IbpError;
use crate::core::plan::Proposal;
use crate::core::time;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Proposed,
    AwaitingApproval,
    Approved,
    Applied,
}

impl RunState {
    fn as_str(&self) -> &'static str {
        match self {
            RunState::Proposed => "PROPOSED",
            RunState::AwaitingApproval => "AWAITING_APPROVAL",
            RunState::Approved => "APPROVED",
            RunState::Applied => "APPLIED",
        }
    }

    fn parse(s: &str) -> Result<Self, IbpError> {
        match s {
            "PROPOSED" => Ok(RunState::Proposed),
            "AWAITING_APPROVAL" => Ok(RunState::AwaitingApproval),
            "APPROVED" => Ok(RunState::Approved),
            "APPLIED" => Ok(RunState::Applied),
            other => Err(IbpError::StateError(format!("unknown run state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedInjection {
    pub candidate_id: String,
    pub level: u8,
    pub edited_title: Option<String>,
    pub rejected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub run_id: String,
    pub items: Vec<ApprovedInjection>,
    pub approved_by: String,
    pub approved_at: String,
}

/// Validates an approval artifact against its proposal: every approved
/// item must reference a proposed candidate_id (I2), and its level must
/// not exceed the proposed level. Rejected items are allowed for any
/// candidate and never inject. A mismatch is fatal for the run
/// (`ApprovalMismatch`, spec.md §7) -- the gate refuses to transition.
pub fn validate_approval(proposal: &Proposal, approval: &Approval) -> Result<(), IbpError> {
    use std::collections::HashMap;
    let proposed_by_id: HashMap<&str, &crate::core::plan::ProposedInjection> = proposal
        .injections
        .iter()
        .map(|i| (i.candidate_id.as_str(), i))
        .collect();

    for item in &approval.items {
        let Some(proposed) = proposed_by_id.get(item.candidate_id.as_str()) else {
            return Err(IbpError::ApprovalMismatch(format!(
                "approval references candidate '{}' not present in the proposal",
                item.candidate_id
            )));
        };
        if !item.rejected && item.level > proposed.level {
            return Err(IbpError::ApprovalMismatch(format!(
                "candidate '{}' approved at level {} exceeds proposed level {}",
                item.candidate_id, item.level, proposed.level
            )));
        }
    }
    Ok(())
}

/// Applies an approval's accepted (non-rejected) items onto the
/// proposal, producing the final injection set with any title edits
/// folded in. Must be called only after [`validate_approval`] succeeds.
pub fn resolve_approved_injections(
    proposal: &Proposal,
    approval: &Approval,
) -> Vec<crate::core::plan::ProposedInjection> {
    use std::collections::HashMap;
    let approved_by_id: HashMap<&str, &ApprovedInjection> = approval
        .items
        .iter()
        .filter(|i| !i.rejected)
        .map(|i| (i.candidate_id.as_str(), i))
        .collect();

    proposal
        .injections
        .iter()
        .filter_map(|proposed| {
            let approved = approved_by_id.get(proposed.candidate_id.as_str())?;
            let mut resolved = proposed.clone();
            resolved.level = approved.level;
            if let Some(title) = &approved.edited_title {
                resolved.title_text = title.clone();
            }
            Some(resolved)
        })
        .collect()
}

/// Persists and transitions run state through the SQLite `runs` /
/// `run_transitions` tables (spec.md §4.7: "transition is atomic and
/// logged").
pub struct ApprovalGate {
    broker: DbBroker,
    db_path: std::path::PathBuf,
}

impl ApprovalGate {
    pub fn new(run_root: &Path) -> Self {
        Self {
            broker: DbBroker::new(run_root),
            db_path: crate::core::db::run_db_path(run_root),
        }
    }

    pub fn create_run(&self, run_id: &str, book_id: &str) -> Result<(), IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "run.create", |conn| {
            let now = time::now_epoch_z();
            conn.execute(
                "INSERT OR IGNORE INTO runs (run_id, book_id, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![run_id, book_id, RunState::Proposed.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn current_state(&self, run_id: &str) -> Result<RunState, IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "run.state.read", |conn| {
            let state: Option<String> = conn
                .query_row("SELECT state FROM runs WHERE run_id = ?1", params![run_id], |r| r.get(0))
                .optional()?;
            let state = state.ok_or_else(|| IbpError::NotFound(format!("run '{}' not found", run_id)))?;
            RunState::parse(&state)
        })
    }

    /// Performs `from -> to`, failing if the run isn't currently in
    /// `from`. Logged to `run_transitions` regardless of the caller's
    /// next step, inside the same broker transaction as the state
    /// update.
    pub fn transition(&self, run_id: &str, from: RunState, to: RunState, actor: &str) -> Result<(), IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, actor, None, "run.transition", |conn| {
            let current: String = conn.query_row(
                "SELECT state FROM runs WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )?;
            if current != from.as_str() {
                return Err(IbpError::StateError(format!(
                    "cannot transition run '{}' to {:?}: current state is {} not {:?}",
                    run_id, to, current, from
                )));
            }
            let now = time::now_epoch_z();
            conn.execute(
                "UPDATE runs SET state = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![to.as_str(), now, run_id],
            )?;
            conn.execute(
                "INSERT INTO run_transitions (run_id, from_state, to_state, ts, actor) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, from.as_str(), to.as_str(), now, actor],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{DecisionBasis, ProposedInjection};

    fn sample_proposal() -> Proposal {
        Proposal {
            book_id: "b1".into(),
            run_id: "r1".into(),
            injections: vec![ProposedInjection {
                candidate_id: "c1".into(),
                file_index: 0,
                insertion_offset: 0,
                level: 2,
                title_text: "باب الإدغام".into(),
                decision_basis: DecisionBasis::Rule,
                score: 0.9,
                oracle_result: None,
                review_required: true,
            }],
            blocked: vec![],
            ambiguous_top_n: vec![],
            counts_by_kind: Default::default(),
            counts_by_score_band: Default::default(),
            anchors_before: 0,
            anchors_after: 1,
            anchor_miss_reduction: 1.0,
        }
    }

    #[test]
    fn approval_referencing_unknown_candidate_is_a_mismatch() {
        let proposal = sample_proposal();
        let approval = Approval {
            run_id: "r1".into(),
            items: vec![ApprovedInjection {
                candidate_id: "unknown".into(),
                level: 2,
                edited_title: None,
                rejected: false,
            }],
            approved_by: "reviewer".into(),
            approved_at: "now".into(),
        };
        assert!(validate_approval(&proposal, &approval).is_err());
    }

    #[test]
    fn approval_raising_level_above_proposed_is_a_mismatch() {
        let proposal = sample_proposal();
        let approval = Approval {
            run_id: "r1".into(),
            items: vec![ApprovedInjection {
                candidate_id: "c1".into(),
                level: 3,
                edited_title: None,
                rejected: false,
            }],
            approved_by: "reviewer".into(),
            approved_at: "now".into(),
        };
        assert!(validate_approval(&proposal, &approval).is_err());
    }

    #[test]
    fn same_or_lower_level_is_accepted() {
        let proposal = sample_proposal();
        let approval = Approval {
            run_id: "r1".into(),
            items: vec![ApprovedInjection {
                candidate_id: "c1".into(),
                level: 2,
                edited_title: Some("باب الإدغام (محرر)".into()),
                rejected: false,
            }],
            approved_by: "reviewer".into(),
            approved_at: "now".into(),
        };
        assert!(validate_approval(&proposal, &approval).is_ok());
        let resolved = resolve_approved_injections(&proposal, &approval);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].title_text, "باب الإدغام (محرر)");
    }

    #[test]
    fn rejected_items_never_inject() {
        let proposal = sample_proposal();
        let approval = Approval {
            run_id: "r1".into(),
            items: vec![ApprovedInjection {
                candidate_id: "c1".into(),
                level: 2,
                edited_title: None,
                rejected: true,
            }],
            approved_by: "reviewer".into(),
            approved_at: "now".into(),
        };
        assert!(validate_approval(&proposal, &approval).is_ok());
        assert!(resolve_approved_injections(&proposal, &approval).is_empty());
    }

    #[test]
    fn gate_transitions_follow_the_state_machine_and_reject_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        crate::core::db::initialize_run_db(dir.path()).unwrap();
        let gate = ApprovalGate::new(dir.path());
        gate.create_run("r1", "b1").unwrap();
        assert_eq!(gate.current_state("r1").unwrap(), RunState::Proposed);

        gate.transition("r1", RunState::Proposed, RunState::AwaitingApproval, "ibp")
            .unwrap();
        assert!(gate
            .transition("r1", RunState::Proposed, RunState::Approved, "ibp")
            .is_err());

        gate.transition("r1", RunState::AwaitingApproval, RunState::Approved, "reviewer")
            .unwrap();
        gate.transition("r1", RunState::Approved, RunState::Applied, "ibp")
            .unwrap();
        assert_eq!(gate.current_state("r1").unwrap(), RunState::Applied);
    }
}
