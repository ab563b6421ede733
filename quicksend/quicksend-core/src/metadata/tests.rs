use super::*;
use crate::clock::ManualClock;
use crate::error::Error;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::thread;

fn repo_in(dir: &std::path::Path) -> MetadataRepository {
    MetadataRepository::new(dir.join("metadata.json"), dir.join("uploads"))
        .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
}

fn write_raw(repo: &MetadataRepository, value: &Value) {
    fs::write(repo.metadata_path(), serde_json::to_vec(value).unwrap()).unwrap();
}

fn read_raw(repo: &MetadataRepository) -> Value {
    serde_json::from_slice(&fs::read(repo.metadata_path()).unwrap()).unwrap()
}

#[test]
fn missing_groups_section_bootstraps_root() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    write_raw(&repo, &json!({"report.pdf": {"uploader": "amy"}}));

    let doc = repo.load();
    let root = &doc.groups[ROOT_GROUP_ID];
    assert_eq!(root.parent_id, None);
    assert_eq!(root.created_by, SYSTEM_CREATOR);
    assert_eq!(root.mtime.secs(), 1_700_000_000.0);
    assert_eq!(doc.groups.len(), 1);
}

#[test]
fn empty_store_still_has_root() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    let doc = repo.load();
    assert!(doc.has_group(ROOT_GROUP_ID));
    assert!(doc.files.is_empty());
}

#[test]
fn malformed_groups_section_is_recreated() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    write_raw(&repo, &json!({"__groups__": ["not", "a", "map"]}));

    let doc = repo.load();
    assert_eq!(doc.groups.keys().collect::<Vec<_>>(), vec![ROOT_GROUP_ID]);
}

#[test]
fn unparsable_group_record_is_kept_verbatim() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    write_raw(
        &repo,
        &json!({"__groups__": {
            "root": {"name": "Home", "parent_id": null, "created_by": "system", "mtime": 1.0},
            "good": {"name": "Photos", "parent_id": "root", "created_by": "10.0.0.2", "mtime": 2.0},
            "bad": 17
        }}),
    );

    let doc = repo.load();
    assert_eq!(doc.groups.len(), 2);
    assert_eq!(doc.groups[ROOT_GROUP_ID].name, "Home");
    assert_eq!(doc.groups["good"].parent_id.as_deref(), Some(ROOT_GROUP_ID));
    assert_eq!(doc.raw_groups["bad"], json!(17));

    repo.mutate(|_| Ok(())).unwrap();
    assert_eq!(read_raw(&repo)[GROUPS_KEY]["bad"], json!(17));
}

#[test]
fn integer_stamps_and_empty_texts_survive_resave() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    let original = json!({
        "__groups__": {
            "root": {"name": "Root", "parent_id": null, "created_by": "system",
                     "mtime": 1700000000, "hidden": false, "is_pinned": false}
        },
        "__texts__": {}
    });
    write_raw(&repo, &original);

    assert!(repo.save(&repo.load()));
    assert_eq!(read_raw(&repo), original);
    assert_eq!(repo.load().groups[ROOT_GROUP_ID].mtime.secs(), 1_700_000_000.0);

    // a store that never had texts does not grow the section
    write_raw(&repo, &json!({"__groups__": original[GROUPS_KEY].clone()}));
    assert!(repo.save(&repo.load()));
    assert!(read_raw(&repo).get(TEXTS_KEY).is_none());
}

#[test]
fn loose_records_survive_unrelated_writes() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    let stale_text = json!({"content": "hi", "uploader": "amy", "mtime": "yesterday"});
    write_raw(
        &repo,
        &json!({
            "__groups__": {
                "root": {"name": "Root", "parent_id": null, "created_by": "system", "mtime": 1},
                "a": {"parent_id": "root", "created_by": "10.0.0.2", "mtime": 2},
                "b": {"name": "Inner", "parent_id": "a", "created_by": "10.0.0.2", "mtime": 3}
            },
            "__texts__": {"1700000000000": stale_text.clone()}
        }),
    );

    let doc = repo.load();
    assert_eq!(doc.groups["a"].name, "");
    assert_eq!(doc.groups["b"].parent_id.as_deref(), Some("a"));
    assert!(doc.has_text("1700000000000"));

    repo.mutate(|doc| {
        doc.files.insert("new.txt".into(), FileEntry::new("bob"));
        Ok(())
    })
    .unwrap();

    let raw = read_raw(&repo);
    let mut group_ids: Vec<&String> = raw[GROUPS_KEY].as_object().unwrap().keys().collect();
    group_ids.sort();
    assert_eq!(group_ids, vec!["a", "b", "root"]);
    assert_eq!(raw[TEXTS_KEY]["1700000000000"], stale_text);

    let mut listed: Vec<String> = crate::groups::visible_groups(&repo.load(), true)
        .into_iter()
        .map(|g| g.id)
        .collect();
    listed.sort();
    assert_eq!(listed, vec!["a", "b", "root"]);
}

#[test]
fn groups_with_a_missing_parent_are_adopted_by_root() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    write_raw(
        &repo,
        &json!({"__groups__": {
            "root": {"name": "Root", "parent_id": null, "created_by": "system", "mtime": 1},
            "lost": {"name": "Lost", "parent_id": "gone", "created_by": "x", "mtime": 2},
            "broken": {"name": "Broken", "parent_id": "root", "created_by": "x", "mtime": "soon"},
            "child": {"name": "Child", "parent_id": "broken", "created_by": "x", "mtime": 3}
        }}),
    );

    let doc = repo.load();
    assert_eq!(doc.groups["lost"].parent_id.as_deref(), Some(ROOT_GROUP_ID));
    assert_eq!(doc.groups["child"].parent_id.as_deref(), Some(ROOT_GROUP_ID));
    assert!(doc.raw_groups.contains_key("broken"));
    let listed: Vec<String> = crate::groups::visible_groups(&doc, false)
        .into_iter()
        .map(|g| g.id)
        .collect();
    assert!(listed.contains(&"lost".to_string()));
    assert!(listed.contains(&"child".to_string()));
}

#[test]
fn file_entry_without_group_reports_root() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    write_raw(
        &repo,
        &json!({
            "a.txt": {"uploader": "amy", "password_hash": null},
            "b.txt": {"uploader": "bob", "group_id": null},
            "c.txt": {"uploader": "cid", "group_id": "photos"}
        }),
    );

    let doc = repo.load();
    assert_eq!(doc.files["a.txt"].group_id, ROOT_GROUP_ID);
    assert_eq!(doc.files["b.txt"].group_id, ROOT_GROUP_ID);
    assert_eq!(doc.files["c.txt"].group_id, "photos");
}

#[test]
fn well_formed_document_roundtrips_unchanged() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    let original = json!({
        "report.pdf": {
            "uploader": "amy",
            "password_hash": null,
            "group_id": "g1",
            "source_mtime": 1690000000.25
        },
        "schema": 3,
        "__groups__": {
            "root": {"name": "Root", "parent_id": null, "created_by": "system",
                     "mtime": 1700000000.0, "hidden": false, "is_pinned": false},
            "g1": {"name": "Docs", "parent_id": "root", "created_by": "192.168.1.4",
                   "mtime": 1700000001.5, "hidden": true, "is_pinned": true, "color": "red"}
        },
        "__texts__": {
            "1700000002000": {"content": "hello", "uploader": "bob", "uploader_id": null,
                              "password_hash": null, "mtime": 1700000002}
        },
        "__debug__": {"last_error": "none"}
    });
    write_raw(&repo, &original);

    assert!(repo.save(&repo.load()));
    assert_eq!(read_raw(&repo), original);
}

#[test]
fn reserved_keys_never_become_files() {
    let mut doc = Document::from_map(
        json!({"__debug__": [1, 2], "x.bin": {"uploader": ""}})
            .as_object()
            .cloned()
            .unwrap(),
    );
    assert_eq!(doc.files.len(), 1);
    assert_eq!(doc.debug, Some(json!([1, 2])));
    assert!(is_reserved_key(GROUPS_KEY));
    assert!(!is_reserved_key("x.bin"));

    doc.unrecognized.insert(GROUPS_KEY.to_string(), json!("bogus"));
    doc.ensure_root(5.0);
    let value = serde_json::to_value(&doc).unwrap();
    assert!(value[GROUPS_KEY].is_object());
}

#[test]
fn mutate_persists_changes() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());

    repo.mutate(|doc| {
        doc.files.insert("a.txt".into(), FileEntry::new("amy"));
        Ok(())
    })
    .unwrap();

    let doc = repo.load();
    assert_eq!(doc.files["a.txt"].uploader, "amy");
    assert_eq!(read_raw(&repo)["a.txt"]["group_id"], "root");
}

#[test]
fn failed_mutation_is_not_saved() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    repo.mutate(|doc| {
        doc.files.insert("keep.txt".into(), FileEntry::new("amy"));
        Ok(())
    })
    .unwrap();

    let err = repo
        .mutate(|doc| -> crate::Result<()> {
            doc.files.clear();
            Err(Error::invalid("nope"))
        })
        .unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    assert!(repo.load().files.contains_key("keep.txt"));
}

#[test]
fn unwritable_store_reports_storage_failure() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    fs::create_dir_all(repo.metadata_path().join("blocker")).unwrap();

    let err = repo.mutate(|_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::StorageFailure(_)));
    assert!(!repo.save(&Document::default()));
}

#[test]
fn concurrent_mutations_do_not_lose_updates() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = Arc::new(repo_in(tempdir.path()));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let repo = repo.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    repo.mutate(|doc| {
                        doc.files
                            .insert(format!("t{t}-{i}.bin"), FileEntry::new(format!("u{t}")));
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(repo.load().files.len(), 80);
}

#[test]
fn metadata_file_name_is_recognised() {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = repo_in(tempdir.path());
    assert!(repo.is_metadata_file("metadata.json"));
    assert!(repo.is_metadata_file("METADATA.JSON"));
    assert!(!repo.is_metadata_file("notes.json"));

    repo.set_upload_dir(tempdir.path().join("elsewhere"));
    assert_eq!(repo.upload_dir(), tempdir.path().join("elsewhere"));
}
