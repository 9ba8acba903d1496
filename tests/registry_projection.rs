//! Integration coverage for the registry and projection materializer
//! (C10): topic creation, chunk recording, topic-profile listing for
//! placement similarity, filesystem projection, and `--clean-book`
//! archival.

use ibp::core::injector::{split_file, Chunk};
use ibp::core::registry::{topic_folder_segment, CreatedBy, LinkType, ProjectionRow, Registry, Topic, TopicStatus};
use std::fs;

fn sample_chunk() -> Chunk {
    let markup = "## باب الطهارة\nنص الباب الأول.\n";
    split_file("book1", "page_0001.html", markup, vec![], &[]).chunks.remove(0)
}

#[test]
fn topic_profiles_reflect_only_active_topics() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path()).unwrap();

    let id = registry.next_topic_id().unwrap();
    registry
        .create_topic(&Topic {
            topic_id: id.clone(),
            parent_topic_id: None,
            display_title_ar: "باب الطهارة وأحكام الوضوء".into(),
            display_title_en: None,
            aliases_ar: vec![],
            aliases_en: vec![],
            status: TopicStatus::Active,
            created_by: CreatedBy::Rule,
            created_at: ibp::core::time::now_epoch_z(),
            notes: String::new(),
        })
        .unwrap();

    let profiles = registry.list_topic_profiles().unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].0, id);
    assert_eq!(profiles[0].1, "باب الطهارة وأحكام الوضوء");
}

#[test]
fn committing_a_chunk_twice_is_rejected_by_chunk_exists_check() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path()).unwrap();
    let chunk = sample_chunk();

    assert!(!registry.chunk_exists(&chunk.chunk_id).unwrap());
    registry.insert_chunk(&chunk, "chunks_by_book/book1/chunk.md", None).unwrap();
    assert!(registry.chunk_exists(&chunk.chunk_id).unwrap());
}

#[test]
fn inserting_a_superseding_chunk_deprecates_the_prior_one() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path()).unwrap();
    let chunk = sample_chunk();
    registry.insert_chunk(&chunk, "chunks_by_book/book1/chunk.md", None).unwrap();

    let mut corrected = chunk.clone();
    corrected.chunk_id = format!("{}-corrected", chunk.chunk_id);
    registry
        .insert_chunk(&corrected, "chunks_by_book/book1/chunk_corrected.md", Some(&chunk.chunk_id))
        .unwrap();

    assert!(registry.chunk_exists(&corrected.chunk_id).unwrap());
}

#[test]
fn projection_links_canonical_chunk_under_its_topic_folder() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::open(dir.path()).unwrap();

    let canonical = dir.path().join("chunks_by_book").join("book1").join("chunk_1.md");
    fs::create_dir_all(canonical.parent().unwrap()).unwrap();
    fs::write(&canonical, "نص الفصل الكامل").unwrap();

    let folder = topic_folder_segment("T000001", "باب الطهارة");
    let projected = dir.path().join("topics").join(&folder).join("chunk_1.md");
    let link_type = ibp::core::registry::materialize_projection(&canonical, &projected).unwrap();
    assert_eq!(link_type, LinkType::Hardlink);

    registry
        .insert_projection(&ProjectionRow {
            topic_id: "T000001".into(),
            chunk_id: "chunk_1".into(),
            canonical_path: canonical.to_string_lossy().to_string(),
            projected_path: projected.to_string_lossy().to_string(),
            link_type,
        })
        .unwrap();

    assert_eq!(fs::read_to_string(&projected).unwrap(), "نص الفصل الكامل");
}

#[test]
fn clean_book_archives_rather_than_deletes_prior_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let chunks_dir = dir.path().join("chunks_by_book").join("book1");
    fs::create_dir_all(&chunks_dir).unwrap();
    fs::write(chunks_dir.join("chunk_1.md"), "نص سابق").unwrap();

    let archive_dir = ibp::core::registry::clean_book(dir.path(), "book1").unwrap();
    assert!(!chunks_dir.exists());
    assert!(archive_dir.join("chunks_by_book").join("chunk_1.md").exists());
}
