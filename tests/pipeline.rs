mod common;

use std::{collections::HashMap, io::Write, path::Path};

use common::{Fixture, HashEmbedder};
use docseek::{
    DocumentExtractor, Embedder, FlatIndex, IndexStore,
    hybrid::{self, SearchFilters, SearchHit, SearchQuery, SearchResponse, SearchSettings, SortMode},
    indexer::{IndexOutcome, IndexRequest, IndexSettings, Indexer},
};
use tokio_util::sync::CancellationToken;

fn write_docx(path: &Path, paragraphs: &[&str]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{p}</w:t></w:r></w:p>"))
        .collect();
    zip.write_all(
        format!(r#"<w:document xmlns:w="x"><w:body>{body}</w:body></w:document>"#)
            .as_bytes(),
    )
    .unwrap();
    zip.finish().unwrap();
}

fn fixture() -> Fixture {
    let fixture = Fixture::new(&[
        ("leave.txt", "Annual leave policy. Employees receive fifteen days of leave."),
        ("notes.md", "# Meeting notes\n\nThe leave calendar is shared with the team."),
    ]);
    write_docx(
        &fixture.docs.join("expenses.docx"),
        &["Travel expense policy", "Receipts are required for every claim."],
    );
    std::fs::create_dir_all(fixture.docs.join("archive")).unwrap();
    std::fs::write(
        fixture.docs.join("archive/old-leave.txt"),
        "Superseded leave rules from the previous year.",
    )
    .unwrap();
    fixture
}

fn run(fixture: &Fixture, embedder: &HashEmbedder, recursive: bool) -> IndexOutcome {
    let cache = fixture.cache();
    let indexer = Indexer {
        extractor: &DocumentExtractor,
        embedder,
        ocr: None,
        cache: &cache,
        vectors: FlatIndex::boxed,
        settings: IndexSettings::default(),
    };
    indexer
        .run(
            &IndexRequest {
                folder: fixture.docs.clone(),
                recursive,
                passwords: HashMap::new(),
            },
            None,
            &CancellationToken::new(),
            &mut |_| {},
        )
        .unwrap()
}

fn hits(store: &IndexStore, embedder: &HashEmbedder, query: SearchQuery) -> Vec<SearchHit> {
    let settings = SearchSettings {
        default_results: 10,
        ..SearchSettings::default()
    };
    match hybrid::search(Some((store, embedder as &dyn Embedder)), &query, &settings).unwrap() {
        SearchResponse::Hits { hits, .. } => hits,
        other => panic!("expected hits, got {other:?}"),
    }
}

#[test]
fn every_supported_format_is_searchable() {
    let fixture = fixture();
    let embedder = HashEmbedder::new("hash");
    let outcome = run(&fixture, &embedder, false);

    assert_eq!(outcome.report.indexed, 3);
    assert!(outcome.report.failures.is_empty());

    let found = hits(&outcome.store, &embedder, SearchQuery::new("travel expense receipts"));
    assert_eq!(found[0].file, "expenses.docx");
    assert!(found[0].text.contains("Receipts are required"));
}

#[test]
fn recursive_pass_picks_up_subfolders() {
    let fixture = fixture();
    let embedder = HashEmbedder::new("hash");

    let flat = run(&fixture, &embedder, false);
    assert!(flat.manifest.files.keys().all(|k| !k.starts_with("archive")));

    let deep = run(&fixture, &embedder, true);
    assert_eq!(deep.report.indexed, 1);
    assert_eq!(deep.report.cached, 3);
    assert!(deep.manifest.files.contains_key("archive/old-leave.txt"));

    let query = SearchQuery {
        filters: SearchFilters {
            path: Some("archive".into()),
            ..SearchFilters::default()
        },
        ..SearchQuery::new("leave")
    };
    let found = hits(&deep.store, &embedder, query);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].file, "archive/old-leave.txt");
}

#[test]
fn filters_restrict_results() {
    let fixture = fixture();
    let embedder = HashEmbedder::new("hash");
    let outcome = run(&fixture, &embedder, false);

    let by_ext = SearchQuery {
        filters: SearchFilters {
            extensions: vec![".MD".into()],
            ..SearchFilters::default()
        },
        ..SearchQuery::new("leave")
    };
    let found = hits(&outcome.store, &embedder, by_ext);
    assert!(!found.is_empty());
    assert!(found.iter().all(|h| h.source == "notes.md"));

    let by_glob = SearchQuery {
        filters: SearchFilters {
            name: Some("*.DOCX".into()),
            ..SearchFilters::default()
        },
        ..SearchQuery::new("policy")
    };
    let found = hits(&outcome.store, &embedder, by_glob);
    assert!(found.iter().all(|h| h.source == "expenses.docx"));
}

#[test]
fn filename_sort_orders_hits_alphabetically() {
    let fixture = fixture();
    let embedder = HashEmbedder::new("hash");
    let outcome = run(&fixture, &embedder, false);

    let query = SearchQuery {
        sort: SortMode::Filename,
        ..SearchQuery::new("leave policy")
    };
    let found = hits(&outcome.store, &embedder, query);
    let names: Vec<&str> = found.iter().map(|h| h.source.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn edits_and_deletions_reach_the_next_generation() {
    let fixture = fixture();
    let embedder = HashEmbedder::new("hash");
    let first = run(&fixture, &embedder, false);

    std::fs::write(
        fixture.docs.join("leave.txt"),
        "Parental leave now lasts twelve weeks, replacing the previous rules.",
    )
    .unwrap();
    std::fs::remove_file(fixture.docs.join("notes.md")).unwrap();

    let second = run(&fixture, &embedder, false);
    assert_eq!(second.store.generation(), first.store.generation() + 1);
    assert_eq!(second.report.indexed, 1);
    assert_eq!(second.report.cached, 1);
    assert_eq!(second.report.removed, 1);

    let found = hits(&second.store, &embedder, SearchQuery::new("parental leave weeks"));
    assert_eq!(found[0].file, "leave.txt");
    assert!(found[0].text.contains("twelve weeks"));
    assert!(found.iter().all(|h| h.file != "notes.md"));

    // The first generation is untouched by the second pass.
    assert!(first.store.chunks().iter().any(|c| c.text.contains("fifteen days")));
}

#[test]
fn cache_survives_across_embedder_instances_but_not_models() {
    let fixture = fixture();
    run(&fixture, &HashEmbedder::new("hash"), false);

    let again = run(&fixture, &HashEmbedder::new("hash"), false);
    assert_eq!(again.report.indexed, 0);
    assert_eq!(again.report.cached, 3);

    let other = run(&fixture, &HashEmbedder::new("other-model"), false);
    assert_eq!(other.report.indexed, 3);
    assert_eq!(fixture.cache().usage().unwrap().entries, 2);
}
