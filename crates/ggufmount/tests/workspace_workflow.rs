//! Mount → edit → save workflows through the `Workspace` facade.

mod common;

use std::path::Path;

use common::*;
use ggufmount::codec::{MetadataEntry, MetadataValue, align_up};
use ggufmount::stage::{DocumentKind, MountError, MountState};
use ggufmount::{Config, Error, ErrorKind, ValidationError, Workspace};
use proptest::prelude::*;
use tempfile::TempDir;

fn workspace(dir: &TempDir) -> Workspace {
    let config = Config::builder().session_path(dir.path().join("session.json")).build().unwrap();
    Workspace::new(config)
}

fn state_of(ws: &Workspace, id: &str) -> Option<MountState> {
    ws.list().into_iter().find(|m| m.id.as_str() == id).and_then(|m| m.state)
}

fn write_doc(path: &Path, json: &str) {
    std::fs::write(path, json).unwrap();
}

#[test]
fn strip_fix_and_save_keep_tensor_bytes() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();

    let stripped = ws.strip_telemetry(id.as_str()).unwrap();
    assert_eq!(stripped.removed_keys, ["general.license"]);
    let fixed = ws.fix_tokenizer(id.as_str()).unwrap();
    assert_eq!(fixed.removed_count, 5);

    let out = dir.path().join("out.gguf");
    let report = ws.save(id.as_str(), &out).unwrap();
    assert_eq!(report.bytes, std::fs::metadata(&out).unwrap().len());
    assert_eq!(report.sha256.len(), 64);
    assert!(report.warnings.is_empty());
    assert_eq!(state_of(&ws, id.as_str()), Some(MountState::Saved));

    let before = parse(&src);
    let after = parse(&out);
    assert_eq!(
        keys(&after),
        ["general.architecture", "general.name", "llama.block_count", "tokenizer.ggml.model", "tokenizer.ggml.tokens"]
    );
    assert_eq!(
        after.metadata_value("tokenizer.ggml.tokens").and_then(MetadataValue::as_string_array),
        Some(vec!["A", "B"])
    );
    for t in before.tensors() {
        assert_eq!(after.tensor_bytes(&t.name), before.tensor_bytes(&t.name), "{}", t.name);
        let moved = after.tensor(&t.name).unwrap();
        assert_eq!(moved.offset % after.alignment(), 0);
    }
    // the source is untouched
    assert_eq!(parse(&src).metadata().len(), before.metadata().len());
}

#[test]
fn saving_over_the_source_is_refused() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let original = std::fs::read(&src).unwrap();
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    ws.strip_telemetry(id.as_str()).unwrap();

    // spelled through a detour so only canonicalisation catches it
    let detour = dir.path().join("mnt").join("..").join("in.gguf");
    let err = ws.save(id.as_str(), &detour).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::OutputIsSource(_))));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(std::fs::read(&src).unwrap(), original);
    assert_eq!(state_of(&ws, id.as_str()), Some(MountState::Modified));
}

#[test]
fn duplicate_key_in_a_hand_edited_document_blocks_save() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    let path = dir.path().join("mnt/metadata/metadata.json");
    write_doc(
        &path,
        r#"{"general.name": {"type": "string", "value": "a"}, "general.name": {"type": "string", "value": "b"}}"#,
    );

    let out = dir.path().join("out.gguf");
    let err = ws.save(id.as_str(), &out).unwrap_err();
    match err {
        Error::Validation(ValidationError::DuplicateKey { document, key }) => {
            assert_eq!(document, DocumentKind::Metadata);
            assert_eq!(key, "general.name");
        }
        other => panic!("expected DuplicateKey, got {other}"),
    }
    assert!(!out.exists());
    assert_eq!(state_of(&ws, id.as_str()), Some(MountState::Staged));
}

#[test]
fn dangling_token_id_blocks_save_only_when_tokenizer_edited() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let mut metadata = llama_metadata();
    // out of range in the source already; the untouched tokenizer is not checked
    metadata.push(MetadataEntry::new("tokenizer.ggml.eos_token_id", MetadataValue::U32(99)));
    let src = write_archive(dir.path(), "in.gguf", metadata);

    let id = ws.mount(&src, &dir.path().join("a")).unwrap();
    ws.save(id.as_str(), &dir.path().join("a.gguf")).unwrap();

    let id = ws.mount(&src, &dir.path().join("b")).unwrap();
    write_doc(
        &dir.path().join("b/tokenizer/tokenizer.json"),
        r#"{
  "tokenizer.ggml.tokens": {"type": "array", "element_type": "string", "value": ["x", "y"]},
  "tokenizer.ggml.eos_token_id": {"type": "u32", "value": 2}
}"#,
    );
    let err = ws.save(id.as_str(), &dir.path().join("b.gguf")).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::DanglingTokenizerIndex { .. })));
    assert!(!dir.path().join("b.gguf").exists());
}

#[test]
fn malformed_config_blocks_save() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    write_doc(
        &dir.path().join("mnt/config/model_config.json"),
        r#"{"general.architecture": {"type": "string", "value": "llama"}, "general.alignment": {"type": "u32", "value": 24}}"#,
    );
    let err = ws.save(id.as_str(), &dir.path().join("out.gguf")).unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::MalformedConfig { .. })));
}

fn with_alignment(alignment: u32) -> Vec<MetadataEntry> {
    let mut metadata = llama_metadata();
    metadata.insert(1, MetadataEntry::new("general.alignment", MetadataValue::U32(alignment)));
    metadata
}

#[test]
fn deleting_the_alignment_key_falls_back_to_the_default_layout() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", with_alignment(64));
    assert_eq!(parse(&src).alignment(), 64);
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();

    let path = dir.path().join("mnt/config/model_config.json");
    let mut doc: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(doc.remove("general.alignment").is_some());
    std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

    let out = dir.path().join("out.gguf");
    ws.save(id.as_str(), &out).unwrap();
    let before = parse(&src);
    let after = parse(&out);
    assert!(after.metadata_value("general.alignment").is_none());
    assert_eq!(after.alignment(), 32);
    assert_eq!(after.tensor("norm.weight").unwrap().offset, 32);
    for t in before.tensors() {
        assert_eq!(after.tensor_bytes(&t.name), before.tensor_bytes(&t.name), "{}", t.name);
    }
}

#[test]
fn kept_alignment_key_is_honoured() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", with_alignment(64));
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    let out = dir.path().join("out.gguf");
    ws.save(id.as_str(), &out).unwrap();
    let after = parse(&out);
    assert_eq!(after.alignment(), 64);
    assert_eq!(after.tensor("norm.weight").unwrap().offset, 64);
}

#[test]
fn unreadable_alignment_outside_config_blocks_save() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    write_doc(
        &dir.path().join("mnt/metadata/metadata.json"),
        r#"{"general.name": {"type": "string", "value": "tiny"}, "general.alignment": {"type": "string", "value": "wide"}}"#,
    );
    let out = dir.path().join("out.gguf");
    let err = ws.save(id.as_str(), &out).unwrap_err();
    match err {
        Error::Validation(ValidationError::MalformedConfig { ref key, .. }) => assert_eq!(key, "general.alignment"),
        ref other => panic!("expected MalformedConfig, got {other}"),
    }
    assert_eq!(err.exit_code(), 3);
    assert!(!out.exists());
}

#[test]
fn unparseable_hand_edit_is_a_validation_failure() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    write_doc(&dir.path().join("mnt/metadata/metadata.json"), "{ not json");
    let err = ws.save(id.as_str(), &dir.path().join("out.gguf")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn cross_document_duplicates_are_warnings() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    write_doc(
        &dir.path().join("mnt/metadata/metadata.json"),
        r#"{"general.name": {"type": "string", "value": "tiny"}, "general.license": {"type": "string", "value": "mit"}, "llama.block_count": {"type": "u32", "value": 7}}"#,
    );
    let out = dir.path().join("out.gguf");
    let report = ws.save(id.as_str(), &out).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("llama.block_count"));
    // config is merged after metadata and wins
    assert_eq!(parse(&out).metadata_value("llama.block_count"), Some(&MetadataValue::U32(1)));
}

#[test]
fn a_saved_mount_cannot_be_saved_again() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    ws.save(id.as_str(), &dir.path().join("one.gguf")).unwrap();
    let err = ws.save(id.as_str(), &dir.path().join("two.gguf")).unwrap_err();
    assert!(matches!(err, Error::Mount(MountError::InvalidTransition { .. })));
    assert_eq!(err.exit_code(), 7);
    assert!(matches!(ws.fix_tokenizer(id.as_str()).unwrap_err().kind(), ErrorKind::Mount));
}

#[test]
fn mount_conflict_and_cleanup_rules() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let dest = dir.path().join("mnt");
    let id = ws.mount(&src, &dest).unwrap();
    let err = ws.mount(&src, &dest).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DestinationConflict);
    let err = ws.extract(&src, &dest).unwrap_err();
    assert_eq!(err.exit_code(), 5);

    ws.strip_telemetry(id.as_str()).unwrap();
    assert!(ws.cleanup(false).is_empty());
    assert!(dest.join("metadata/metadata.json").exists());
    assert_eq!(ws.cleanup(true), [id]);
    assert!(ws.list().is_empty());
    assert!(!dest.exists());
}

#[test]
fn discard_then_remount() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let dest = dir.path().join("mnt");
    let id = ws.mount(&src, &dest).unwrap();
    assert_eq!(ws.discard(dest.to_str().unwrap()).unwrap(), id);
    assert_eq!(state_of(&ws, id.as_str()), Some(MountState::Discarded));
    ws.mount(&src, &dest).unwrap();
    assert_eq!(state_of(&ws, id.as_str()), Some(MountState::Staged));
}

#[test]
fn unknown_mount_reference() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let err = ws.strip_telemetry("/no/such/mount").unwrap_err();
    assert!(matches!(err, Error::Mount(MountError::MountNotFound(_))));
    assert_eq!(err.exit_code(), 7);
}

#[test]
fn missing_tokenizer_exit_code() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", vec![MetadataEntry::new("general.name", string("x"))]);
    let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
    assert_eq!(ws.fix_tokenizer(id.as_str()).unwrap_err().exit_code(), 8);
}

#[test]
fn extract_stages_without_registering() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let report = ws.extract(&src, &dir.path().join("out")).unwrap();
    assert_eq!(report.documents, [DocumentKind::Metadata, DocumentKind::Config, DocumentKind::Tokenizer]);
    assert!(report.root.join("extraction_manifest.json").is_file());
    assert!(report.root.join("tokenizer/tokenizer.json").is_file());
    assert!(ws.list().is_empty());
}

#[test]
fn session_survives_a_new_workspace() {
    let dir = TempDir::new().unwrap();
    let src = write_archive(dir.path(), "in.gguf", llama_metadata());
    let id = {
        let ws = workspace(&dir);
        let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();
        ws.strip_telemetry(id.as_str()).unwrap();
        ws.persist().unwrap();
        id
    };

    let config = Config::builder().session_path(dir.path().join("session.json")).build().unwrap();
    let ws = Workspace::open(config).unwrap();
    assert_eq!(state_of(&ws, id.as_str()), Some(MountState::Modified));
    assert_eq!(ws.fix_tokenizer(id.as_str()).unwrap().removed_count, 5);
    ws.save(id.as_str(), &dir.path().join("out.gguf")).unwrap();
    let out = parse(&dir.path().join("out.gguf"));
    assert!(out.metadata_value("general.license").is_none());
}

#[test]
fn corrupt_source_reports_parse_error() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let src = dir.path().join("bad.gguf");
    std::fs::write(&src, b"GGUF\x03\x00\x00\x00").unwrap();
    let err = ws.mount(&src, &dir.path().join("mnt")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(!dir.path().join("mnt/metadata").exists());

    let err = ws.analyze(&dir.path().join("missing.gguf"), false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Growing or shrinking metadata moves the payload but never corrupts it.
    #[test]
    fn offsets_stay_valid_after_metadata_edits(
        extra in prop::collection::vec(("[a-z]{1,12}", ".{0,80}"), 0..8),
    ) {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let src = write_archive(dir.path(), "in.gguf", llama_metadata());
        let id = ws.mount(&src, &dir.path().join("mnt")).unwrap();

        let path = dir.path().join("mnt/metadata/metadata.json");
        let mut doc: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for (k, v) in &extra {
            doc.insert(format!("user.{k}"), serde_json::json!({"type": "string", "value": v}));
        }
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let out = dir.path().join("out.gguf");
        ws.save(id.as_str(), &out).unwrap();
        let before = parse(&src);
        let after = parse(&out);
        let mut expected_offset = 0u64;
        for (old, new) in before.tensors().iter().zip(after.tensors()) {
            prop_assert_eq!(new.offset, expected_offset);
            prop_assert_eq!(after.tensor_bytes(&new.name), before.tensor_bytes(&old.name));
            expected_offset = align_up(new.end(), after.alignment()).unwrap();
        }
    }
}
