//! Registry & Projection (component C10): the source-of-truth SQLite
//! registry for topics, books, chunks, and projections, plus the
//! filesystem projection materializer and `--clean-book` archival.

use crate::core::broker::DbBroker;
use crate::core::error::IbpError;
use crate::core::manifest::Manifest;
use crate::core::time;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicStatus {
    Active,
    Merged,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreatedBy {
    Rule,
    Oracle,
    Human,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub topic_id: String,
    pub parent_topic_id: Option<String>,
    pub display_title_ar: String,
    pub display_title_en: Option<String>,
    pub aliases_ar: Vec<String>,
    pub aliases_en: Vec<String>,
    pub status: TopicStatus,
    pub created_by: CreatedBy,
    pub created_at: String,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    Hardlink,
    Copy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionRow {
    pub topic_id: String,
    pub chunk_id: String,
    pub canonical_path: String,
    pub projected_path: String,
    pub link_type: LinkType,
}

/// Registry handle rooted at `<project_root>/.ibp`.
pub struct Registry {
    broker: DbBroker,
    db_path: PathBuf,
    root: PathBuf,
}

impl Registry {
    pub fn open(project_root: &Path) -> Result<Self, IbpError> {
        let root = project_root.join(".ibp");
        crate::core::db::initialize_registry_db(&root)?;
        Ok(Self {
            broker: DbBroker::new(&root),
            db_path: crate::core::db::registry_db_path(&root),
            root,
        })
    }

    pub fn insert_book(&self, manifest: &Manifest) -> Result<(), IbpError> {
        let path = self.db_path.clone();
        let manifest_json = serde_json::to_string(manifest)?;
        self.broker.with_conn(&path, "ibp", None, "registry.book.insert", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO books (book_id, science, title, author, manifest_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![manifest.book_id, manifest.science, manifest.title, manifest.author, manifest_json, time::now_epoch_z()],
            )?;
            Ok(())
        })
    }

    /// Creates a new topic. `parent_topic_id`, if present, must already
    /// exist in the registry -- the partial order required to prevent
    /// cyclic taxonomy edits (spec.md §9).
    pub fn create_topic(&self, topic: &Topic) -> Result<(), IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "registry.topic.create", |conn| {
            if let Some(parent) = &topic.parent_topic_id {
                let exists: Option<String> = conn
                    .query_row("SELECT topic_id FROM topics WHERE topic_id = ?1", params![parent], |r| r.get(0))
                    .optional()?;
                if exists.is_none() {
                    return Err(IbpError::InvariantViolation(format!(
                        "parent_topic_id '{}' does not exist (would create a cycle or dangling reference)",
                        parent
                    )));
                }
            }
            conn.execute(
                "INSERT INTO topics (topic_id, parent_topic_id, display_title_ar, display_title_en, aliases_ar, aliases_en, status, created_by, created_at, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    topic.topic_id,
                    topic.parent_topic_id,
                    topic.display_title_ar,
                    topic.display_title_en,
                    serde_json::to_string(&topic.aliases_ar)?,
                    serde_json::to_string(&topic.aliases_en)?,
                    status_str(topic.status),
                    created_by_str(topic.created_by),
                    topic.created_at,
                    topic.notes,
                ],
            )?;
            Ok(())
        })
    }

    /// Allocates the next sequential `T######` topic_id. Never reused,
    /// even after a topic is deprecated (I4: topic_ids persist forever).
    pub fn next_topic_id(&self) -> Result<String, IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "registry.topic.next_id", |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM topics", [], |r| r.get(0))?;
            Ok(format!("T{:06}", count + 1))
        })
    }

    /// Records a canonical chunk row. Canonical chunk files are created
    /// exactly once and never reopened for write (spec.md §5) -- this
    /// call must be paired with a single write of `body_path` on disk by
    /// the caller, never a rewrite of an existing one.
    pub fn insert_chunk(
        &self,
        chunk: &crate::core::injector::Chunk,
        body_path: &str,
        supersedes: Option<&str>,
    ) -> Result<(), IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "registry.chunk.insert", |conn| {
            conn.execute(
                "INSERT INTO chunks (chunk_id, book_id, file, dom_anchor, start_offset, end_offset, page_index, body_path, status, supersedes_chunk_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    chunk.chunk_id,
                    chunk.book_id,
                    chunk.provenance.file,
                    chunk.provenance.dom_anchor,
                    chunk.provenance.start_offset as i64,
                    chunk.provenance.end_offset as i64,
                    chunk.provenance.page_index,
                    body_path,
                    "active",
                    supersedes,
                    time::now_epoch_z(),
                ],
            )?;
            if let Some(prior) = supersedes {
                conn.execute(
                    "UPDATE chunks SET status = 'deprecated' WHERE chunk_id = ?1",
                    params![prior],
                )?;
            }
            Ok(())
        })
    }

    pub fn chunk_exists(&self, chunk_id: &str) -> Result<bool, IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "registry.chunk.exists", |conn| {
            let found: Option<String> = conn
                .query_row("SELECT chunk_id FROM chunks WHERE chunk_id = ?1", params![chunk_id], |r| r.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn insert_projection(&self, row: &ProjectionRow) -> Result<(), IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "registry.projection.insert", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO projections (topic_id, chunk_id, canonical_path, projected_path, link_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.topic_id,
                    row.chunk_id,
                    row.canonical_path,
                    row.projected_path,
                    link_type_str(row.link_type),
                    time::now_epoch_z(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists every active topic's `(topic_id, display_title_ar)` for use
    /// as the similarity basis in placement proposals (component C9).
    pub fn list_topic_profiles(&self) -> Result<Vec<(String, String)>, IbpError> {
        let path = self.db_path.clone();
        self.broker.with_conn(&path, "ibp", None, "registry.topic.list", |conn| {
            let mut stmt = conn.prepare("SELECT topic_id, display_title_ar FROM topics WHERE status = 'active'")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

fn status_str(s: TopicStatus) -> &'static str {
    match s {
        TopicStatus::Active => "active",
        TopicStatus::Merged => "merged",
        TopicStatus::Deprecated => "deprecated",
    }
}

fn created_by_str(c: CreatedBy) -> &'static str {
    match c {
        CreatedBy::Rule => "rule",
        CreatedBy::Oracle => "oracle",
        CreatedBy::Human => "human",
    }
}

fn link_type_str(l: LinkType) -> &'static str {
    match l {
        LinkType::Hardlink => "hardlink",
        LinkType::Copy => "copy",
    }
}

/// Sanitizes a topic display title into a filesystem-safe folder segment
/// (spec.md §4.10): NFC normalize, spaces -> `_`, strip illegal chars
/// `\ / : * ? " < > |`, trim trailing dots/spaces, cap at 80 chars (the
/// full title is preserved in the registry regardless).
pub fn sanitize_folder_title(title: &str) -> String {
    let normalized: String = title.nfc().collect();
    let cleaned: String = normalized
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| !"\\/:*?\"<>|".contains(*c))
        .collect();
    let trimmed = cleaned.trim_end_matches(['.', ' ']);
    trimmed.chars().take(80).collect()
}

pub fn topic_folder_segment(topic_id: &str, display_title_ar: &str) -> String {
    format!("{}__{}", topic_id, sanitize_folder_title(display_title_ar))
}

/// Materializes the projection for one (topic_id, chunk_id): links the
/// canonical chunk body under `topics/<folder>/` to `chunks_by_book/`.
/// Tries a hardlink first; on failure (e.g. cross-device) falls back to
/// a copy, recording which per-row (spec.md §4.10).
pub fn materialize_projection(canonical_path: &Path, projected_path: &Path) -> Result<LinkType, IbpError> {
    if let Some(parent) = projected_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if projected_path.exists() {
        fs::remove_file(projected_path)?;
    }
    match fs::hard_link(canonical_path, projected_path) {
        Ok(()) => Ok(LinkType::Hardlink),
        Err(_) => {
            fs::copy(canonical_path, projected_path)?;
            Ok(LinkType::Copy)
        }
    }
}

/// Archives all prior outputs for a book under
/// `_ARCHIVE/<book_id>/<timestamp>/...` before a rerun. Never deletes in
/// place (spec.md §4.10).
pub fn clean_book(project_root: &Path, book_id: &str) -> Result<PathBuf, IbpError> {
    let chunks_dir = project_root.join("chunks_by_book").join(book_id);
    let timestamp = time::now_epoch_z();
    let archive_dir = project_root.join("_ARCHIVE").join(book_id).join(&timestamp);

    if chunks_dir.exists() {
        fs::create_dir_all(&archive_dir)?;
        copy_dir_recursive(&chunks_dir, &archive_dir.join("chunks_by_book"))?;
        fs::remove_dir_all(&chunks_dir)?;
    }

    Ok(archive_dir)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), IbpError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_sanitization_strips_illegal_characters_and_caps_length() {
        let title = "باب: أحكام الصلاة/الزكاة؟ <test>".to_string();
        let sanitized = sanitize_folder_title(&title);
        assert!(!sanitized.contains(':'));
        assert!(!sanitized.contains('/'));
        assert!(!sanitized.contains('<'));
        assert!(sanitized.len() <= 80);
    }

    #[test]
    fn folder_segment_uses_topic_id_prefix() {
        let segment = topic_folder_segment("T000042", "تمارين وتطبيقات");
        assert!(segment.starts_with("T000042__"));
    }

    #[test]
    fn next_topic_id_is_sequential_and_never_reused_after_creation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        let id1 = registry.next_topic_id().unwrap();
        assert_eq!(id1, "T000001");
        registry
            .create_topic(&Topic {
                topic_id: id1.clone(),
                parent_topic_id: None,
                display_title_ar: "باب الطهارة".into(),
                display_title_en: None,
                aliases_ar: vec![],
                aliases_en: vec![],
                status: TopicStatus::Active,
                created_by: CreatedBy::Rule,
                created_at: time::now_epoch_z(),
                notes: String::new(),
            })
            .unwrap();
        let id2 = registry.next_topic_id().unwrap();
        assert_eq!(id2, "T000002");
    }

    #[test]
    fn topic_creation_rejects_dangling_parent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        let result = registry.create_topic(&Topic {
            topic_id: "T000001".into(),
            parent_topic_id: Some("T999999".into()),
            display_title_ar: "x".into(),
            display_title_en: None,
            aliases_ar: vec![],
            aliases_en: vec![],
            status: TopicStatus::Active,
            created_by: CreatedBy::Rule,
            created_at: time::now_epoch_z(),
            notes: String::new(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn projection_prefers_hardlink_and_falls_back_to_copy() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("chunk_abc.md");
        fs::write(&canonical, "body text").unwrap();
        let projected = dir.path().join("topics").join("T000001__x").join("chunk_abc.md");
        let link_type = materialize_projection(&canonical, &projected).unwrap();
        assert_eq!(link_type, LinkType::Hardlink);
        assert_eq!(fs::read_to_string(&projected).unwrap(), "body text");
    }

    #[test]
    fn clean_book_archives_instead_of_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let chunks_dir = dir.path().join("chunks_by_book").join("b1");
        fs::create_dir_all(&chunks_dir).unwrap();
        fs::write(chunks_dir.join("chunk_1.md"), "content").unwrap();

        let archive_dir = clean_book(dir.path(), "b1").unwrap();
        assert!(!chunks_dir.exists());
        assert!(archive_dir.join("chunks_by_book").join("chunk_1.md").exists());
    }
}
