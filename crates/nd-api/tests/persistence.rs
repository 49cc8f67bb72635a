use nd_api::{
    ArrayError, ArrayOptions, DType, EngineError, EvidenceKind, LoadedArrays, NdSession, Shape,
    StorageType, UsageError,
};

fn options() -> ArrayOptions {
    ArrayOptions::default().with_dtype(DType::F64)
}

fn location(dir: &tempfile::TempDir, file: &str) -> String {
    dir.path().join(file).to_string_lossy().into_owned()
}

#[test]
fn named_save_and_load_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = location(&dir, "named.nd");
    let session = NdSession::default();
    let weights = session
        .array(&[1.0, 2.0, 3.0, 4.0], &[2, 2], options())
        .expect("weights");
    let bias = session.full(&[2], 0.5, options()).expect("bias");

    session
        .save(&path, &[("weights", &weights), ("bias", &bias)])
        .expect("save");

    let loaded = session.load(&path).expect("load");
    assert!(matches!(loaded, LoadedArrays::Named(_)));
    assert_eq!(loaded.len(), 2);
    let restored = loaded.get("weights").expect("weights entry").array();
    assert_eq!(restored.shape().expect("live"), Shape::new(vec![2, 2]));
    assert_eq!(restored.dtype().expect("live"), DType::F64);
    assert_eq!(restored.to_vec().expect("read"), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(restored.lineage_len().expect("live"), 0);
    assert!(
        session
            .evidence()
            .iter()
            .any(|entry| entry.kind == EvidenceKind::Durability)
    );
}

#[test]
fn unnamed_save_loads_as_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = format!("file://{}", location(&dir, "list.nd"));
    let session = NdSession::default();
    let a = session.ones(&[3], options()).expect("ones");
    let b = session.zeros(&[1], options()).expect("zeros");

    session.save_list(&path, &[&a, &b]).expect("save");
    let arrays = session.load(&path).expect("load").into_arrays();
    assert_eq!(arrays.len(), 2);
    assert_eq!(arrays[0].array().to_vec().expect("read"), vec![1.0; 3]);
    assert_eq!(arrays[1].array().to_vec().expect("read"), vec![0.0]);
}

#[test]
fn name_count_mismatch_is_rejected_before_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = location(&dir, "mismatch.nd");
    let session = NdSession::default();
    let a = session.ones(&[1], options()).expect("ones");

    let err = session
        .save_with_names(&path, &["a".to_string(), "b".to_string()], &[&a])
        .expect_err("mismatch");
    assert_eq!(
        err,
        ArrayError::Usage(UsageError::NameCountMismatch {
            names: 2,
            arrays: 1
        })
    );
    assert!(!dir.path().join("mismatch.nd").exists());
}

#[test]
fn arrays_from_another_session_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = location(&dir, "foreign.nd");
    let session = NdSession::default();
    let other = NdSession::default();
    let foreign = other.ones(&[1], options()).expect("ones");

    let err = session.save_list(&path, &[&foreign]).expect_err("foreign");
    assert!(matches!(
        err,
        ArrayError::Usage(UsageError::ForeignEnvironment { .. })
    ));
}

#[test]
fn disposed_array_cannot_be_saved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = location(&dir, "disposed.nd");
    let session = NdSession::default();
    let a = session.ones(&[1], options()).expect("ones");
    a.dispose().expect("dispose");

    let err = session.save_list(&path, &[&a]).expect_err("disposed");
    assert!(matches!(err, ArrayError::Usage(UsageError::Disposed { .. })));
}

#[test]
fn corrupt_archive_is_native_error_and_recorded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = location(&dir, "corrupt.nd");
    std::fs::write(&path, "{not json").expect("write corrupt file");
    let session = NdSession::default();
    let before = session.live_handles();

    let err = session.load(&path).expect_err("corrupt");
    assert!(matches!(err, ArrayError::Native(EngineError::Serialize(_))));
    assert_eq!(session.live_handles(), before);
    assert!(
        session
            .evidence()
            .iter()
            .any(|entry| entry.kind == EvidenceKind::Durability
                && entry.summary.contains("decode failure"))
    );
}

#[test]
fn missing_file_and_remote_scheme_are_native_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let session = NdSession::default();

    let missing = session
        .load(&location(&dir, "absent.nd"))
        .expect_err("missing");
    assert!(matches!(missing, ArrayError::Native(EngineError::Io { .. })));

    let remote = session
        .load("s3://bucket/weights.nd")
        .expect_err("unsupported scheme");
    assert!(matches!(
        remote,
        ArrayError::Native(EngineError::UnsupportedScheme { .. })
    ));
}

#[test]
fn raw_bytes_round_trip_through_session() {
    let session = NdSession::default();
    let a = session
        .array(&[1.5, -2.0], &[2], options())
        .expect("array");
    let bytes = a.serialize().expect("serialize");

    let restored = session.deserialize(&bytes).expect("deserialize");
    assert!(!restored.is_sparse());
    assert_eq!(restored.array().to_vec().expect("read"), vec![1.5, -2.0]);
    assert!(!restored.array().ptr_eq(&a));
}

#[test]
fn garbage_bytes_fail_without_leaking() {
    let session = NdSession::default();
    let before = session.live_handles();
    let err = session.deserialize(b"garbage").expect_err("garbage");
    assert!(err.is_native());
    assert_eq!(session.live_handles(), before);
}

#[test]
fn sparse_arrays_survive_persistence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = location(&dir, "sparse.nd");
    let session = NdSession::default();
    let dense = session
        .array(&[0.0, 3.0, 0.0], &[3], options())
        .expect("array");
    let sparse = dense
        .cast_storage(StorageType::RowSparse)
        .expect("cast")
        .into_sparse()
        .expect("sparse");

    session.save_list(&path, &[sparse.as_array()]).expect("save");
    let loaded = session.load(&path).expect("load").into_arrays();
    assert!(loaded[0].is_sparse());
    assert_eq!(
        loaded[0].array().storage_type().expect("live"),
        StorageType::RowSparse
    );
    assert_eq!(loaded[0].array().to_vec().expect("read"), vec![0.0, 3.0, 0.0]);
}
