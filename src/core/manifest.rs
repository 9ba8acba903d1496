//! Deterministic ingest manifesting: file enumeration, encoding detection,
//! hashing, and run-id construction (component C1).

use crate::core::error::IbpError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Fixed set of sciences a book may be classified under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Science {
    Fiqh,
    Aqidah,
    UsulAlFiqh,
    Imla,
    Tajwid,
    Sarf,
    Nahw,
    Balaghah,
    IslamicHistory,
}

impl Science {
    pub fn parse(s: &str) -> Result<Self, IbpError> {
        match s {
            "Fiqh" => Ok(Science::Fiqh),
            "Aqidah" => Ok(Science::Aqidah),
            "Usul_al_Fiqh" => Ok(Science::UsulAlFiqh),
            "Imla" => Ok(Science::Imla),
            "Tajwid" => Ok(Science::Tajwid),
            "Sarf" => Ok(Science::Sarf),
            "Nahw" => Ok(Science::Nahw),
            "Balaghah" => Ok(Science::Balaghah),
            "Islamic_History" => Ok(Science::IslamicHistory),
            other => Err(IbpError::InputError(format!(
                "unrecognized science '{}': expected one of Fiqh, Aqidah, Usul_al_Fiqh, Imla, Tajwid, Sarf, Nahw, Balaghah, Islamic_History",
                other
            ))),
        }
    }
}

/// Per-book metadata read from `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMeta {
    pub science: String,
    pub title: String,
    pub author: String,
}

/// One enumerated input file with its frozen identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub encoding: String,
    pub order_index: usize,
}

/// The frozen input state for one book: `ingest_manifest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub book_id: String,
    pub science: String,
    pub title: String,
    pub author: String,
    pub files: Vec<FileEntry>,
}

/// Pipeline version: changes only on a schema-breaking release. Mixed into
/// `run_id` so artifacts from an incompatible pipeline version never collide.
pub const PIPELINE_VERSION: &str = "ibp-pipeline-v1";

/// Reads every regular file under `book_dir` in stable lexicographic order
/// of relative path, detects its encoding, computes its hash, and freezes
/// the manifest. `book_dir` must contain a `meta.json`.
pub fn build_manifest(book_dir: &Path, book_id: &str) -> Result<Manifest, IbpError> {
    let meta_path = book_dir.join("meta.json");
    let meta_raw = fs::read_to_string(&meta_path).map_err(|e| {
        IbpError::InputError(format!("missing or unreadable meta.json at {:?}: {}", meta_path, e))
    })?;
    let meta: BookMeta = serde_json::from_str(&meta_raw)?;
    Science::parse(&meta.science)?;

    let mut relative_paths: Vec<PathBuf> = Vec::new();
    collect_files(book_dir, book_dir, &mut relative_paths)?;
    relative_paths.sort();

    let mut files = Vec::with_capacity(relative_paths.len());
    for (order_index, rel) in relative_paths.iter().enumerate() {
        let abs = book_dir.join(rel);
        let bytes = fs::read(&abs)?;
        let encoding = detect_encoding(&bytes)?;
        let sha256 = sha256_hex(&bytes);
        files.push(FileEntry {
            path: rel.to_string_lossy().replace('\\', "/"),
            size: bytes.len() as u64,
            sha256,
            encoding,
            order_index,
        });
    }

    Ok(Manifest {
        book_id: book_id.to_string(),
        science: meta.science,
        title: meta.title,
        author: meta.author,
        files,
    })
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), IbpError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path
            .extension()
            .map(|e| e == "html" || e == "htm")
            .unwrap_or(false)
        {
            out.push(path.strip_prefix(root).unwrap_or(&path).to_path_buf());
        }
    }
    Ok(())
}

/// Detects text encoding: prefer UTF-8; otherwise fall back to a declared
/// HTML charset (`<meta charset=...>` or `<meta http-equiv=Content-Type
/// content=...charset=...>`); fail closed when neither is present or they
/// conflict.
pub fn detect_encoding(bytes: &[u8]) -> Result<String, IbpError> {
    if std::str::from_utf8(bytes).is_ok() {
        if let Some(declared) = declared_meta_charset(bytes) {
            let normalized = declared.to_ascii_lowercase();
            if normalized != "utf-8" && normalized != "utf8" {
                return Err(IbpError::InputError(format!(
                    "declared meta-charset '{}' conflicts with valid UTF-8 content",
                    declared
                )));
            }
        }
        return Ok("utf-8".to_string());
    }

    if let Some(declared) = declared_meta_charset(bytes) {
        return Ok(declared.to_ascii_lowercase());
    }

    Err(IbpError::InputError(
        "content is not valid UTF-8 and no declared meta-charset was found".to_string(),
    ))
}

fn declared_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(4096)]);
    let lower = head.to_ascii_lowercase();

    if let Some(pos) = lower.find("charset=") {
        let rest = &head[pos + "charset=".len()..];
        let rest = rest.trim_start_matches('"').trim_start_matches('\'');
        let end = rest
            .find(|c: char| c == '"' || c == '\'' || c == ' ' || c == '>' || c == ';')
            .unwrap_or(rest.len());
        let charset = rest[..end].trim();
        if !charset.is_empty() {
            return Some(charset.to_string());
        }
    }
    None
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// NFC-normalizes text for fingerprinting only; raw bytes on disk are never
/// rewritten.
pub fn nfc_fingerprint(text: &str) -> String {
    text.nfc().collect::<String>()
}

/// `run_id = sha256(book_id || sorted(file sha256s) || pipeline_version)`,
/// hex-encoded and truncated to 26 characters for filesystem friendliness.
/// Deterministic: re-running ingest on byte-identical input reproduces the
/// same run_id.
pub fn compute_run_id(manifest: &Manifest) -> String {
    let mut hashes: Vec<&str> = manifest.files.iter().map(|f| f.sha256.as_str()).collect();
    hashes.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(manifest.book_id.as_bytes());
    for h in hashes {
        hasher.update(h.as_bytes());
    }
    hasher.update(PIPELINE_VERSION.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..26].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_detects_utf8() {
        let bytes = "<html><body>مرحبا</body></html>".as_bytes();
        assert_eq!(detect_encoding(bytes).unwrap(), "utf-8");
    }

    #[test]
    fn encoding_falls_back_to_declared_charset_for_non_utf8() {
        let mut bytes = b"<html><head><meta charset=\"windows-1256\"></head><body>".to_vec();
        bytes.push(0xC8);
        bytes.extend_from_slice(b"</body></html>");
        assert_eq!(detect_encoding(&bytes).unwrap(), "windows-1256");
    }

    #[test]
    fn encoding_fails_closed_with_no_declaration() {
        let bytes: &[u8] = &[0xFF, 0xFE, 0xC8, 0x00];
        assert!(detect_encoding(bytes).is_err());
    }

    #[test]
    fn run_id_is_deterministic_and_order_independent() {
        let m1 = Manifest {
            book_id: "b1".into(),
            science: "Fiqh".into(),
            title: "t".into(),
            author: "a".into(),
            files: vec![
                FileEntry {
                    path: "a.html".into(),
                    size: 1,
                    sha256: "aaa".into(),
                    encoding: "utf-8".into(),
                    order_index: 0,
                },
                FileEntry {
                    path: "b.html".into(),
                    size: 1,
                    sha256: "bbb".into(),
                    encoding: "utf-8".into(),
                    order_index: 1,
                },
            ],
        };
        let mut m2 = m1.clone();
        m2.files.reverse();
        assert_eq!(compute_run_id(&m1), compute_run_id(&m2));
    }

    #[test]
    fn science_rejects_unknown_values() {
        assert!(Science::parse("Geology").is_err());
        assert!(Science::parse("Usul_al_Fiqh").is_ok());
    }
}
