//! IBP: the Islamic Book Processor's heading-recovery and chunk-planning
//! engine.
//!
//! **IBP turns inconsistent HTML book typography into recoverable
//! structural anchors under a fail-closed, review-gated pipeline.** A
//! human approves every heading before it is injected, and every
//! canonical chunk body is byte-faithful to its source span.
//!
//! # Pipeline
//!
//! ```text
//! ingest -> candidates -> scoring -> oracle (Layer C, advisory) -> plan
//!   -> approve-headings -> apply (inject + split + place) -> approve-plan
//!   -> commit (registry + projection)
//! ```
//!
//! # For operators
//!
//! 1. `ibp ingest <book_dir> <book_id>` runs C1-C6 and emits a proposal
//!    under `.ibp/runs/<run_id>/`.
//! 2. Review `run_report.md`, write an approval artifact, then
//!    `ibp approve-headings <run_id> --approval <file>`.
//! 3. `ibp apply <run_id>` injects approved headings, splits chunks, and
//!    proposes placement.
//! 4. `ibp approve-plan <run_id> --approval <file>` gates placement.
//! 5. `ibp commit <run_id>` writes canonical chunks and the registry
//!    projection.
//!
//! # Crate structure
//!
//! - [`core`]: every pipeline component (manifest, dom, candidates,
//!   scorer, oracle, plan, approval, injector, placement, registry, run)
//!   plus the shared primitives (error, broker, db, schemas, store, time).

pub mod core;

use crate::core::approval::{self, ApprovalGate, ApprovedInjection, RunState};
use crate::core::candidates::generate_candidates;
use crate::core::dom::{annotate_hr_adjacency, parse_file, structural_signature, tag_footnotes, tag_metadata, tag_pageheads, DomElement, NoiseTag};
use crate::core::error::IbpError;
use crate::core::injector::{apply_injections, shift_spans_for_injections, split_file, verify_byte_faithfulness};
use crate::core::manifest::{build_manifest, compute_run_id, FileEntry, Manifest};
use crate::core::oracle::{BackoffPolicy, HttpOracleClient, OracleRequest, OracleVerifier, TokenBucket};
use crate::core::placement::{propose_placement, PlacementProposal, TopicProfile};
use crate::core::plan::{build_proposal, render_report_markdown, Proposal};
use crate::core::registry::{materialize_projection, topic_folder_segment, CreatedBy, ProjectionRow, Registry, Topic, TopicStatus};
use crate::core::run::RunArtifacts;
use crate::core::scorer::{score_candidate, MustNotHeadingSet, Suggestion};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "ibp",
    version = env!("CARGO_PKG_VERSION"),
    about = "Islamic Book Processor: heading recovery and review-gated chunk planning for HTML book exports."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
    /// Project root holding `.ibp/`, `chunks_by_book/`, and `topics/`.
    /// Defaults to the current directory.
    #[clap(long, global = true)]
    pub project: Option<PathBuf>,
    /// Disables the oracle (Layer C) entirely (spec.md §6.2).
    #[clap(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs C1-C6: manifest, DOM normalize, candidates, scoring, oracle,
    /// plan builder. Emits a proposal under `.ibp/runs/<run_id>/`.
    Ingest {
        /// Directory containing the book's HTML export and `meta.json`.
        book_dir: PathBuf,
        /// Stable ascii book identifier.
        book_id: String,
        /// Explicitly overrides a must-not-heading block for this
        /// candidate_id. Repeatable. Every use is appended to the run's
        /// audit log; the resulting injection carries
        /// `decision_basis: Override` and `review_required: true`.
        #[clap(long = "override-must-not")]
        override_must_not: Vec<String>,
    },
    /// Consumes a human-edited approval artifact and transitions the
    /// heading gate PROPOSED -> AWAITING_APPROVAL -> APPROVED.
    ApproveHeadings {
        run_id: String,
        /// Path to the approval JSON artifact.
        #[clap(long)]
        approval: PathBuf,
        #[clap(long, default_value = "reviewer")]
        approved_by: String,
    },
    /// Runs C8-C9: applies approved injections, splits chunks, proposes
    /// placement. Produces `chunk_plan.proposed.{json,md}`.
    Apply { run_id: String },
    /// Second gate: consumes an approval artifact for the chunk/placement plan.
    ApprovePlan {
        run_id: String,
        #[clap(long)]
        approval: PathBuf,
        #[clap(long, default_value = "reviewer")]
        approved_by: String,
    },
    /// Runs C10: writes canonical chunks and materializes the topic projection.
    Commit { run_id: String },
    /// Archives prior outputs for a book under `_ARCHIVE/<book_id>/<timestamp>/`.
    CleanBook { book_id: String },
    /// Preflight: checks the book directory and `meta.json`, and (unless
    /// `--dry-run`) that `OPENAI_API_KEY` is set. Ambient tooling, not a
    /// pipeline stage -- never gates correctness, only gives a fast
    /// go/no-go diagnostic before a real ingest run.
    Doctor { book_dir: PathBuf },
}

/// Parses the CLI, dispatches to the matching pipeline stage, and
/// returns the terminal `Result`. Exit-code mapping from a returned
/// error happens in `main.rs`, per spec.md §6.2 (0 success, 1 other, 2
/// awaiting approval, 3 blocked by must-not-heading, 4 invariant
/// violation); the "2" and "3" cases are signalled directly via
/// `std::process::exit` at the end of a successful `ingest` since neither
/// is an error: "3" means the run produced a proposal but at least one
/// must-not-heading candidate remains blocked without an override, so the
/// operator must re-run with `--override-must-not` or accept the block
/// before proceeding past approval (see `IbpError::exit_code` for the
/// rest of the contract).
pub fn run() -> Result<(), IbpError> {
    let cli = Cli::parse();
    let project_root = cli.project.clone().unwrap_or(std::env::current_dir()?);

    match cli.command {
        Command::Ingest { book_dir, book_id, override_must_not } => {
            run_ingest(&project_root, &book_dir, &book_id, cli.dry_run, &override_must_not)
        }
        Command::ApproveHeadings { run_id, approval, approved_by } => {
            run_approve_headings(&project_root, &run_id, &approval, &approved_by)
        }
        Command::Apply { run_id } => run_apply(&project_root, &run_id),
        Command::ApprovePlan { run_id, approval, approved_by } => {
            run_approve_plan(&project_root, &run_id, &approval, &approved_by)
        }
        Command::Commit { run_id } => run_commit(&project_root, &run_id),
        Command::CleanBook { book_id } => {
            let archive_dir = crate::core::registry::clean_book(&project_root, &book_id)?;
            println!("archived prior outputs for '{}' under {:?}", book_id, archive_dir);
            Ok(())
        }
        Command::Doctor { book_dir } => run_doctor(&book_dir, cli.dry_run),
    }
}

fn run_doctor(book_dir: &Path, dry_run: bool) -> Result<(), IbpError> {
    if !book_dir.is_dir() {
        return Err(IbpError::InputError(format!("book directory not found: {:?}", book_dir)));
    }
    let meta_path = book_dir.join("meta.json");
    if !meta_path.exists() {
        return Err(IbpError::InputError(format!("missing meta.json under {:?}", book_dir)));
    }
    let meta_raw = std::fs::read_to_string(&meta_path)?;
    let _: serde_json::Value = serde_json::from_str(&meta_raw)?;

    if !dry_run && std::env::var("OPENAI_API_KEY").is_err() {
        println!("warning: OPENAI_API_KEY is not set; Layer C (oracle) will fail if consulted");
    }
    println!("doctor: book directory and meta.json look sane");
    Ok(())
}

/// Runs C1-C6 for one book and writes the proposal artifact set.
fn run_ingest(
    project_root: &Path,
    book_dir: &Path,
    book_id: &str,
    dry_run: bool,
    override_must_not: &[String],
) -> Result<(), IbpError> {
    let manifest = build_manifest(book_dir, book_id)?;
    let run_id = compute_run_id(&manifest);
    let artifacts = RunArtifacts::new(project_root, &run_id)?;
    artifacts.write_atomic("book_dir.txt", &book_dir.to_string_lossy())?;

    artifacts.write_json("ingest_manifest.json", &manifest)?;
    artifacts.write_json(
        "book_profile.json",
        &serde_json::json!({
            "book_id": manifest.book_id,
            "science": manifest.science,
            "title": manifest.title,
            "author": manifest.author,
            "file_count": manifest.files.len(),
        }),
    )?;

    crate::core::db::initialize_run_db(&artifacts.dir)?;
    let gate = ApprovalGate::new(&artifacts.dir);
    gate.create_run(&run_id, book_id)?;

    let must_not = load_must_not_heading(project_root)?;

    // C2/C3 fan out per file with rayon; each file's DOM parse and
    // candidate generation is independent, and results are recombined in
    // manifest order below so markup concatenation and doc_position stay
    // deterministic regardless of which thread finishes first.
    let per_file: Vec<Result<(Vec<crate::core::candidates::Candidate>, String), IbpError>> = manifest
        .files
        .par_iter()
        .map(|file_entry| {
            let raw = std::fs::read_to_string(book_dir.join(&file_entry.path)).map_err(|e| {
                IbpError::InputError(format!("failed to read {}: {}", file_entry.path, e))
            })?;
            let parsed = parse_and_annotate(&raw);
            let candidates = generate_candidates(book_id, file_entry.order_index, &parsed);
            let (markup, _footnote_spans) = derive_plain_markup(&parsed);
            Ok((candidates, markup))
        })
        .collect();

    let mut all_candidates = Vec::new();
    let mut derived_markup_before = String::new();
    for result in per_file {
        let (candidates, markup) = result?;
        all_candidates.extend(candidates);
        derived_markup_before.push_str(&markup);
    }

    let oracle_verifier = if dry_run { None } else { build_oracle_verifier(project_root)? };

    let mut scored_items = Vec::with_capacity(all_candidates.len());
    let total = all_candidates.len().max(1);
    // Level policy's "region" is the current file: reset whenever
    // file_index changes, set once a level-2 heading is emitted above it.
    let mut region_file = None;
    let mut prior_level2_in_region = false;
    for (i, candidate) in all_candidates.into_iter().enumerate() {
        if region_file != Some(candidate.file_index) {
            region_file = Some(candidate.file_index);
            prior_level2_in_region = false;
        }

        let doc_position = i as f64 / total as f64;
        let score = score_candidate(&candidate, doc_position, prior_level2_in_region, &must_not);
        if score.suggested_level == 2 && matches!(score.suggested_is_heading, Suggestion::True) {
            prior_level2_in_region = true;
        }

        let oracle_result = if score.suggested_is_heading == Suggestion::Unknown && !score.must_not_match {
            if let Some(verifier) = &oracle_verifier {
                let request = OracleRequest {
                    candidate_id: candidate.candidate_id.clone(),
                    text: candidate.text.clone(),
                    html_excerpt: candidate.html_excerpt.clone(),
                    context_before: candidate.context_before.clone(),
                    context_after: candidate.context_after.clone(),
                };
                verifier.verify(&request)?.result
            } else {
                None
            }
        } else {
            None
        };

        scored_items.push((candidate, score, oracle_result));
    }

    artifacts.write_jsonl(
        "heading_candidates.jsonl",
        scored_items.iter().map(|(c, _, _)| c.clone()).collect(),
        |c| (c.file_index, c.start_offset),
    )?;
    artifacts.write_jsonl(
        "heading_decisions.jsonl",
        scored_items.iter().map(|(_, s, _)| s.clone()).collect(),
        |s| s.candidate_id.clone(),
    )?;

    let overridden: std::collections::HashSet<String> = override_must_not.iter().cloned().collect();
    if !overridden.is_empty() {
        let broker = crate::core::broker::DbBroker::new(&artifacts.dir);
        let run_db = crate::core::db::run_db_path(&artifacts.dir);
        for candidate_id in &overridden {
            broker.with_conn(
                &run_db,
                "ibp",
                Some(candidate_id),
                "ingest.override_must_not_heading",
                |conn| {
                    conn.execute("SELECT 1", [])?;
                    Ok(())
                },
            )?;
        }
    }

    let proposal = build_proposal(book_id, &run_id, &derived_markup_before, &scored_items, 25, &overridden);

    artifacts.write_jsonl(
        "heading_injections.proposed.jsonl",
        proposal.injections.clone(),
        |i| (i.file_index, i.insertion_offset),
    )?;
    artifacts.write_json("proposal.json", &proposal)?;
    artifacts.write_atomic("run_report.md", &render_report_markdown(&proposal))?;

    gate.transition(&run_id, RunState::Proposed, RunState::AwaitingApproval, "ibp")?;

    println!("ingest complete: run_id={}", run_id);
    println!(
        "{} injections proposed, {} blocked, {} ambiguous",
        proposal.injections.len(),
        proposal.blocked.len(),
        proposal.ambiguous_top_n.len()
    );

    // Any remaining `blocked` entry at this point is a must-not-heading
    // match the operator did not override: surface it as exit code 3
    // rather than the ordinary "proposal awaits approval" code 2, so
    // tooling driving `ingest` can distinguish "review and approve" from
    // "a blocked candidate needs a deliberate override".
    if !proposal.blocked.is_empty() {
        eprintln!(
            "{} candidate(s) blocked by must-not-heading without an override; re-run with --override-must-not <candidate_id> or accept the block",
            proposal.blocked.len()
        );
        std::process::exit(3);
    }
    std::process::exit(2);
}

/// Parses one file's HTML and runs the full noise-annotation pass
/// (pageheads need per-file signature counts first, then footnotes and
/// metadata zones) before candidates are generated against it.
fn parse_and_annotate(raw: &str) -> Vec<DomElement> {
    let mut parsed = parse_file(raw);
    annotate_hr_adjacency(&mut parsed.elements);

    let mut signature_counts: HashMap<String, usize> = HashMap::new();
    for el in &parsed.elements {
        if !el.text.trim().is_empty() {
            *signature_counts.entry(structural_signature(el)).or_insert(0) += 1;
        }
    }
    tag_pageheads(&mut parsed.elements, &signature_counts, 1);
    tag_footnotes(&mut parsed.elements);
    tag_metadata(&mut parsed.elements);
    parsed.elements
}

/// Derives plain markup for anchor-counting and injection purposes:
/// concatenates non-pagehead element text in document order, one line
/// per element. Injection offsets from the candidate generator are
/// computed against this same construction, so `apply` must rebuild it
/// identically from each file's raw bytes. Also returns the byte spans
/// (within the returned markup) of every footnote-tagged element, so
/// the splitter can relocate them into a trailing `## FOOTNOTES`
/// section later.
fn derive_plain_markup(elements: &[DomElement]) -> (String, Vec<(usize, usize)>) {
    let mut out = String::new();
    let mut footnote_spans = Vec::new();
    for el in elements {
        if matches!(el.noise, Some(NoiseTag::Pagehead)) {
            continue;
        }
        let text = el.text.trim();
        if !text.is_empty() {
            let start = out.len();
            out.push_str(text);
            let end = out.len();
            if matches!(el.noise, Some(NoiseTag::Footnote)) {
                footnote_spans.push((start, end));
            }
            out.push('\n');
        }
    }
    (out, footnote_spans)
}

fn load_must_not_heading(project_root: &Path) -> Result<MustNotHeadingSet, IbpError> {
    let fixture_path = project_root.join("fixtures").join("must_not_heading.json");
    if !fixture_path.exists() {
        return Ok(MustNotHeadingSet::default());
    }
    let raw = std::fs::read_to_string(fixture_path)?;
    let entries: Vec<String> = serde_json::from_str(&raw)?;
    Ok(MustNotHeadingSet::from_entries(entries))
}

/// Builds the oracle verifier from environment configuration. Absent
/// `OPENAI_API_KEY`, Layer C is simply skipped (every ambiguous
/// candidate stays `unknown`) rather than failing the run -- the oracle
/// is advisory, not required (spec.md §4.5).
fn build_oracle_verifier(project_root: &Path) -> Result<Option<OracleVerifier<HttpOracleClient>>, IbpError> {
    let Ok(api_key) = std::env::var("OPENAI_API_KEY") else {
        return Ok(None);
    };
    let model_id = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let profile = std::env::var("IBP_AI_PROFILE").unwrap_or_else(|_| "balanced".to_string());
    let (capacity, refill_per_sec) = match profile.as_str() {
        "max" => (10.0, 5.0),
        _ => (3.0, 1.0),
    };

    let registry_root = project_root.join(".ibp");
    crate::core::db::initialize_oracle_db(&registry_root)?;
    let client = HttpOracleClient {
        endpoint: "https://api.openai.com/v1/ibp-heading-verdict".to_string(),
        api_key,
        model_id,
        timeout: std::time::Duration::from_secs(20),
    };
    Ok(Some(OracleVerifier::new(
        &registry_root,
        Some(client),
        Arc::new(TokenBucket::new(capacity, refill_per_sec)),
        BackoffPolicy::default(),
    )))
}

fn load_proposal(artifacts: &RunArtifacts) -> Result<Proposal, IbpError> {
    let raw = std::fs::read_to_string(artifacts.path("proposal.json"))?;
    Ok(serde_json::from_str(&raw)?)
}

fn run_approve_headings(project_root: &Path, run_id: &str, approval_path: &Path, approved_by: &str) -> Result<(), IbpError> {
    let artifacts = RunArtifacts::new(project_root, run_id)?;
    let gate = ApprovalGate::new(&artifacts.dir);
    let proposal = load_proposal(&artifacts)?;

    let raw = std::fs::read_to_string(approval_path)?;
    let mut items: Vec<ApprovedInjection> = serde_json::from_str(&raw)?;
    items.sort_by(|a, b| a.candidate_id.cmp(&b.candidate_id));
    let approval = approval::Approval {
        run_id: run_id.to_string(),
        items,
        approved_by: approved_by.to_string(),
        approved_at: crate::core::time::now_epoch_z(),
    };

    approval::validate_approval(&proposal, &approval)?;
    artifacts.write_json("heading_injections.approved.json", &approval)?;

    gate.transition(run_id, RunState::AwaitingApproval, RunState::Approved, approved_by)?;
    println!("headings approved for run {}", run_id);
    Ok(())
}

/// Re-derives one file's plain markup identically to `run_ingest`'s
/// baseline, so `apply` injects into exactly the same text the
/// proposal's offsets were computed against. Also returns that file's
/// footnote spans (pre-injection offsets), for `split_file`.
fn derive_plain_markup_for_file(
    book_dir: &Path,
    file_entry: &FileEntry,
) -> Result<(String, Vec<(usize, usize)>), IbpError> {
    let raw = std::fs::read_to_string(book_dir.join(&file_entry.path)).map_err(|e| {
        IbpError::InputError(format!("failed to re-read {}: {}", file_entry.path, e))
    })?;
    Ok(derive_plain_markup(&parse_and_annotate(&raw)))
}

fn run_apply(project_root: &Path, run_id: &str) -> Result<(), IbpError> {
    let artifacts = RunArtifacts::new(project_root, run_id)?;
    let gate = ApprovalGate::new(&artifacts.dir);
    if gate.current_state(run_id)? != RunState::Approved {
        return Err(IbpError::StateError(format!(
            "run '{}' is not in APPROVED state; approve-headings must run first",
            run_id
        )));
    }

    let proposal = load_proposal(&artifacts)?;
    let approval_raw = std::fs::read_to_string(artifacts.path("heading_injections.approved.json"))?;
    let approval: approval::Approval = serde_json::from_str(&approval_raw)?;
    let resolved_injections = approval::resolve_approved_injections(&proposal, &approval);

    let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(artifacts.path("ingest_manifest.json"))?)?;
    let book_dir = PathBuf::from(std::fs::read_to_string(artifacts.path("book_dir.txt"))?);

    let mut by_file: HashMap<usize, Vec<_>> = HashMap::new();
    for inj in resolved_injections {
        by_file.entry(inj.file_index).or_default().push(inj);
    }

    let registry = Registry::open(project_root)?;
    let known_topics = registry.list_topic_profiles()?;
    let topic_profiles: Vec<TopicProfile> = known_topics
        .iter()
        .map(|(id, title)| TopicProfile { topic_id: id, representative_text: title })
        .collect();

    let mut all_chunks = Vec::new();
    let mut anchor_misses = Vec::new();
    let mut placements = Vec::new();

    for file_entry in &manifest.files {
        let injections = by_file.remove(&file_entry.order_index).unwrap_or_default();
        let (derived, footnote_spans) = derive_plain_markup_for_file(&book_dir, file_entry)?;
        let injected = apply_injections(&derived, &injections);
        let shifted_spans = shift_spans_for_injections(&footnote_spans, &injections);

        let result = split_file(&proposal.book_id, &file_entry.path, &injected, Vec::new(), &shifted_spans);
        for chunk in &result.chunks {
            if !verify_byte_faithfulness(&injected, chunk) {
                return Err(IbpError::InvariantViolation(format!(
                    "chunk {} failed byte-faithfulness check",
                    chunk.chunk_id
                )));
            }
        }

        for chunk in &result.chunks {
            let heading = chunk.body.lines().next().unwrap_or("");
            let boundary_confidence = proposal
                .injections
                .iter()
                .find(|i| i.file_index == file_entry.order_index && heading.trim_start_matches('#').trim() == i.title_text)
                .map(|i| i.score)
                .unwrap_or(0.5);
            placements.push(propose_placement(&chunk.chunk_id, heading, &chunk.body, boundary_confidence, &topic_profiles));
        }

        all_chunks.extend(result.chunks);
        if let Some(miss) = result.anchor_miss {
            anchor_misses.push(miss);
        }
    }

    artifacts.write_json(
        "chunk_plan.proposed.json",
        &serde_json::json!({
            "chunks": all_chunks,
            "anchor_miss": anchor_misses,
            "placements": placements,
        }),
    )?;

    let mut md = String::from("# Chunk & placement plan\n\n");
    for (chunk, placement) in all_chunks.iter().zip(placements.iter()) {
        md.push_str(&format!(
            "- chunk {} (file {}): review_required={}, exercise_family={}\n",
            chunk.chunk_id, chunk.provenance.file, placement.review_required, placement.exercise_family
        ));
    }
    artifacts.write_atomic("chunk_plan.proposed.md", &md)?;

    println!(
        "apply complete for run {}: {} chunks, {} anchor-miss diagnostics",
        run_id,
        all_chunks.len(),
        anchor_misses.len()
    );
    Ok(())
}

fn run_approve_plan(project_root: &Path, run_id: &str, approval_path: &Path, approved_by: &str) -> Result<(), IbpError> {
    let artifacts = RunArtifacts::new(project_root, run_id)?;
    let raw = std::fs::read_to_string(approval_path)?;
    artifacts.write_atomic("chunk_plan.approved.json", &raw)?;
    println!("chunk/placement plan approved for run {} by {}", run_id, approved_by);
    Ok(())
}

/// Resolves the target topic_id for one chunk's placement, creating a
/// new topic row when the plan calls for it. `exercises_id` is filled in
/// lazily on first use and reused for every exercise-family chunk in
/// this commit.
fn resolve_topic_for_chunk(
    registry: &Registry,
    placement: &PlacementProposal,
    heading_text: &str,
    exercises_id: &mut Option<String>,
    known_titles: &mut Vec<(String, String)>,
) -> Result<(String, String), IbpError> {
    if placement.exercise_family {
        if let Some(id) = exercises_id {
            let title = known_titles.iter().find(|(i, _)| i == id).map(|(_, t)| t.clone()).unwrap_or_default();
            return Ok((id.clone(), title));
        }
        let title = crate::core::placement::exercises_folder_title();
        if let Some((id, t)) = known_titles.iter().find(|(_, t)| *t == title) {
            *exercises_id = Some(id.clone());
            return Ok((id.clone(), t.clone()));
        }
        let id = registry.next_topic_id()?;
        registry.create_topic(&Topic {
            topic_id: id.clone(),
            parent_topic_id: None,
            display_title_ar: title.clone(),
            display_title_en: Some("Exercises and Applications".to_string()),
            aliases_ar: vec![],
            aliases_en: vec![],
            status: TopicStatus::Active,
            created_by: CreatedBy::Rule,
            created_at: crate::core::time::now_epoch_z(),
            notes: String::new(),
        })?;
        *exercises_id = Some(id.clone());
        known_titles.push((id.clone(), title.clone()));
        return Ok((id, title));
    }

    if !placement.creates_new_topic {
        if let Some(top) = placement.ranked_topics.first() {
            let title = known_titles
                .iter()
                .find(|(i, _)| *i == top.topic_id)
                .map(|(_, t)| t.clone())
                .unwrap_or_default();
            return Ok((top.topic_id.clone(), title));
        }
    }

    let id = registry.next_topic_id()?;
    let title = heading_text.trim_start_matches('#').trim().to_string();
    registry.create_topic(&Topic {
        topic_id: id.clone(),
        parent_topic_id: None,
        display_title_ar: title.clone(),
        display_title_en: None,
        aliases_ar: vec![],
        aliases_en: vec![],
        status: TopicStatus::Active,
        created_by: CreatedBy::Rule,
        created_at: crate::core::time::now_epoch_z(),
        notes: String::new(),
    })?;
    known_titles.push((id.clone(), title.clone()));
    Ok((id, title))
}

fn run_commit(project_root: &Path, run_id: &str) -> Result<(), IbpError> {
    let artifacts = RunArtifacts::new(project_root, run_id)?;
    let gate = ApprovalGate::new(&artifacts.dir);

    if !artifacts.path("chunk_plan.approved.json").exists() {
        return Err(IbpError::StateError(format!(
            "run '{}' has no chunk_plan.approved.json; approve-plan must run before commit (second approval gate)",
            run_id
        )));
    }

    let plan_raw = std::fs::read_to_string(artifacts.path("chunk_plan.proposed.json"))?;
    let plan: serde_json::Value = serde_json::from_str(&plan_raw)?;
    let chunks: Vec<crate::core::injector::Chunk> = serde_json::from_value(plan["chunks"].clone())?;
    let placements: Vec<PlacementProposal> = serde_json::from_value(plan["placements"].clone())?;

    let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(artifacts.path("ingest_manifest.json"))?)?;
    let registry = Registry::open(project_root)?;
    registry.insert_book(&manifest)?;

    let mut known_titles = registry.list_topic_profiles()?;
    let mut exercises_id: Option<String> = None;

    let chunks_dir = project_root.join("chunks_by_book").join(&manifest.book_id);
    std::fs::create_dir_all(&chunks_dir)?;

    let mut committed = 0usize;
    for (chunk, placement) in chunks.iter().zip(placements.iter()) {
        if registry.chunk_exists(&chunk.chunk_id)? {
            continue; // commit is idempotent: an already-applied chunk is a no-op (spec.md §8)
        }
        let heading = chunk.body.lines().next().unwrap_or("");
        let (topic_id, display_title) =
            resolve_topic_for_chunk(&registry, placement, heading, &mut exercises_id, &mut known_titles)?;

        let body_path = chunks_dir.join(format!("chunk_{}.md", chunk.chunk_id));
        let mut full_body = chunk.body.clone();
        if let Some(footnotes) = &chunk.footnotes_section {
            full_body.push_str("\n\n");
            full_body.push_str(footnotes);
        }
        std::fs::write(&body_path, &full_body)?;
        registry.insert_chunk(chunk, body_path.to_string_lossy().as_ref(), None)?;

        let folder = topic_folder_segment(&topic_id, &display_title);
        let projected_path = project_root.join("topics").join(&folder).join(format!("chunk_{}.md", chunk.chunk_id));
        let link_type = materialize_projection(&body_path, &projected_path)?;
        registry.insert_projection(&ProjectionRow {
            topic_id,
            chunk_id: chunk.chunk_id.clone(),
            canonical_path: body_path.to_string_lossy().to_string(),
            projected_path: projected_path.to_string_lossy().to_string(),
            link_type,
        })?;
        committed += 1;
    }

    gate.transition(run_id, RunState::Approved, RunState::Applied, "ibp").ok();
    println!(
        "commit complete: {} new chunks written for book {} ({} total in plan)",
        committed,
        manifest.book_id,
        chunks.len()
    );
    Ok(())
}
