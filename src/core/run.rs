//! Run artifact handling (spec.md §6.4): the run-scoped artifact
//! directory under `runs/<run_id>/`, and atomic (temp + rename) writers
//! for every artifact file.

use crate::core::error::IbpError;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A handle to one run's artifact directory. All artifacts are
/// immutable once written: a second write to the same filename replaces
/// it atomically (temp + rename), it never appends or patches in place.
pub struct RunArtifacts {
    pub run_id: String,
    pub dir: PathBuf,
}

impl RunArtifacts {
    pub fn new(project_root: &Path, run_id: &str) -> Result<Self, IbpError> {
        let dir = project_root.join(".ibp").join("runs").join(run_id);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Writes `contents` to `<run_dir>/<name>` via temp file + rename, so
    /// a crash mid-write never leaves a partial artifact visible.
    pub fn write_atomic(&self, name: &str, contents: &str) -> Result<PathBuf, IbpError> {
        let target = self.path(name);
        write_atomic_to(&target, contents.as_bytes())?;
        Ok(target)
    }

    /// Serializes `value` as pretty JSON and writes it atomically.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, IbpError> {
        let json = serde_json::to_string_pretty(value)?;
        self.write_atomic(name, &json)
    }

    /// Writes a JSONL artifact: one compact JSON object per line, UTF-8
    /// without BOM, sorted by the caller-supplied key function before
    /// writing (spec.md §6.4's "sorted by their natural keys").
    pub fn write_jsonl<T: Serialize, K: Ord, F: Fn(&T) -> K>(
        &self,
        name: &str,
        mut items: Vec<T>,
        key_fn: F,
    ) -> Result<PathBuf, IbpError> {
        items.sort_by_key(|i| key_fn(i));
        let mut buf = String::new();
        for item in &items {
            buf.push_str(&serde_json::to_string(item)?);
            buf.push('\n');
        }
        self.write_atomic(name, &buf)
    }
}

fn write_atomic_to(target: &Path, bytes: &[u8]) -> Result<(), IbpError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = target.with_extension(format!(
        "{}.tmp",
        target.extension().and_then(|e| e.to_str()).unwrap_or("part")
    ));
    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Item {
        key: u32,
        label: String,
    }

    #[test]
    fn write_atomic_leaves_no_temp_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path(), "run1").unwrap();
        artifacts.write_atomic("run_report.md", "# report\n").unwrap();
        let written = fs::read_to_string(artifacts.path("run_report.md")).unwrap();
        assert_eq!(written, "# report\n");
    }

    #[test]
    fn jsonl_is_sorted_by_natural_key() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path(), "run1").unwrap();
        let items = vec![
            Item { key: 3, label: "c".into() },
            Item { key: 1, label: "a".into() },
            Item { key: 2, label: "b".into() },
        ];
        let path = artifacts
            .write_jsonl("heading_candidates.jsonl", items, |i| i.key)
            .unwrap();
        let content = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].contains("\"key\":1"));
        assert!(lines[1].contains("\"key\":2"));
        assert!(lines[2].contains("\"key\":3"));
    }

    #[test]
    fn rewriting_an_artifact_replaces_it_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path(), "run1").unwrap();
        artifacts.write_atomic("run_report.md", "first").unwrap();
        artifacts.write_atomic("run_report.md", "second").unwrap();
        assert_eq!(fs::read_to_string(artifacts.path("run_report.md")).unwrap(), "second");
    }
}
