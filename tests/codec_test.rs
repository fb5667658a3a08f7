//! Markdown codec tests against the `tests/garden` fixture project.
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tempfile::{tempdir, TempDir};
use test_log::test;

use notebase_core::{
    codec::{diagnostic::ParseErrorKind, CodecMap, CODECS},
    error::NotebaseError,
};

#[cfg(feature = "service")]
mod common;

fn garden() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("garden")
}

fn copy_dir_all(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> io::Result<()> {
    fs::create_dir_all(&dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        if ty.is_dir() {
            copy_dir_all(entry.path(), dst.as_ref().join(entry.file_name()))?;
        } else {
            fs::copy(entry.path(), dst.as_ref().join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[allow(dead_code)]
fn generate_test_root() -> Result<TempDir, NotebaseError> {
    let temp_dir = tempdir()?;
    let content_root = garden();
    tracing::debug!("Copying content from {:?}", content_root);
    copy_dir_all(&content_root, temp_dir.path().join("garden"))?;
    Ok(temp_dir)
}

#[test]
fn test_parse_index_document() {
    let (doc, error) = CODECS.parse_file(&garden(), "index.md").unwrap();
    assert!(error.is_none());
    assert_eq!(doc.title, "Garden Journal");
    assert_eq!(doc.entity_type, "journal");
    assert_eq!(doc.aliases, vec!["journal".to_string(), "garden".to_string()]);
    assert_eq!(doc.metadata["season"], serde_json::json!("spring"));

    assert_eq!(doc.observations.len(), 2);
    assert_eq!(doc.observations[0].category, "goal");
    assert_eq!(doc.observations[0].tags, vec!["summer".to_string()]);
    assert_eq!(doc.observations[1].content, "soil is clay heavy");
    assert_eq!(doc.observations[1].context.as_deref(), Some("tested 2024"));

    let relations = doc
        .relations
        .iter()
        .map(|r| (r.relation_type.as_str(), r.target.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        relations,
        vec![
            ("links_to", "Tomato"),
            ("contains", "Tomato"),
            ("contains", "Basil"),
            ("inspired_by", "Allotment Handbook"),
        ]
    );
    assert_eq!(doc.relations[2].context.as_deref(), Some("companion planting"));
}

#[test]
fn test_parse_body_only_document() {
    let (doc, error) = CODECS.parse_file(&garden(), "plants/basil.md").unwrap();
    assert!(error.is_none());
    assert_eq!(doc.title, "Basil");
    assert_eq!(doc.entity_type, "note");
    // Task checkboxes are not observations.
    assert_eq!(doc.observations.len(), 1);
    assert_eq!(doc.observations[0].category, "care");
    assert_eq!(doc.relations.len(), 1);
    assert_eq!(doc.relations[0].target_key(), "tomato");
}

#[test]
fn test_free_text_links_and_typed_relations_coexist() {
    let (doc, _) = CODECS.parse_file(&garden(), "plants/tomato.md").unwrap();
    assert_eq!(doc.metadata["tags"], serde_json::json!(["nightshade", "annual"]));
    let types = doc
        .relations
        .iter()
        .map(|r| r.relation_type.as_str())
        .collect::<Vec<_>>();
    assert_eq!(types, vec!["links_to", "grows_near"]);
}

#[test]
fn test_broken_frontmatter_yields_minimal_document() {
    let (doc, error) = CODECS.parse_file(&garden(), "broken.md").unwrap();
    let error = error.expect("frontmatter error");
    assert!(matches!(error.kind, ParseErrorKind::InvalidFrontmatter(_)));
    assert_eq!(error.path, "broken.md");
    assert_eq!(doc.title, "broken");
    assert!(doc.observations.is_empty());
}

#[test]
fn test_rendered_document_parses_back() {
    let (doc, _) = CODECS.parse_file(&garden(), "index.md").unwrap();
    let rendered = doc.to_markdown().unwrap();
    let (reparsed, error) = CODECS.parse_bytes("index.md", rendered.as_bytes()).unwrap();
    assert!(error.is_none());
    assert_eq!(reparsed, doc);
}

#[test]
fn test_unknown_extension() {
    let codecs = CodecMap::create();
    assert!(matches!(
        codecs.parse_bytes("notes.txt", b"plain"),
        Err(NotebaseError::NotFound(_))
    ));
}

#[cfg(feature = "service")]
#[test(tokio::test)]
async fn test_garden_full_scan() {
    use common::TestProject;
    use notebase_core::query::{get_by_permalink, project_stats};

    let temp_dir = generate_test_root().unwrap();
    let garden = TestProject::new(&temp_dir, "garden").await;
    let report = garden.coordinator().full_scan().await.unwrap();

    let mut added = report.added.clone();
    added.sort();
    assert_eq!(
        added,
        vec!["broken.md", "index.md", "plants/basil.md", "plants/tomato.md"]
    );
    assert_eq!(report.parse_errors, vec!["broken.md".to_string()]);

    let journal = get_by_permalink(&garden.db, garden.project.id, "journal")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(journal.entity.permalink, "index");
    let pending = journal
        .relations
        .iter()
        .filter(|r| r.to_id.is_none())
        .map(|r| r.to_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(pending, vec!["Allotment Handbook"]);

    let stats = project_stats(&garden.db, garden.project.id).await.unwrap();
    assert_eq!(stats.entity_count, 4);
    assert_eq!(stats.pending_relations, 1);
    assert_eq!(stats.isolated, vec!["broken".to_string()]);
}
