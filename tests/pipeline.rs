mod common;

use common::{row, TestEnv};
use std::fs;
use std::sync::atomic::Ordering;

use ingest_pipeline::remote::{RemotePath, RemoteSession, UploadOptions};
use ingest_pipeline::storage::Ledger;
use ingest_pipeline::utils::ByteSize;
use ingest_pipeline::{IngestError, Task, TaskKind, TaskStatus};

const COLLECTION: &str = "/zone/home/ingest/M5/PhenoBox/2023";

fn status(env: &TestEnv, label: &str) -> TaskStatus {
    Ledger::load(env.ledger_path()).unwrap().get(label).unwrap().status
}

#[tokio::test]
async fn ingests_folder_file_and_empty_folder() {
    let env = TestEnv::new();
    env.write_file("run1/plate_a.tif", 1200);
    env.write_file("run1/sub/plate_b.tif", 800);
    env.write_file("scan.tif", 10_000);
    fs::create_dir(env.source.path().join("empty")).unwrap();
    env.write_manifest(serde_json::json!([row("run1"), row("scan.tif"), row("empty")]));

    let coordinator = env.coordinator(env.config());
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.incomplete, 0);
    assert_eq!(status(&env, "run1"), TaskStatus::MetadataAdded);
    assert_eq!(status(&env, "scan.tif"), TaskStatus::MetadataAdded);
    assert_eq!(status(&env, "empty"), TaskStatus::SkippedEmpty);

    // The folder's reservation was held while it compressed.
    assert_eq!(*env.archiver.observed_available.lock(), vec![3000]);
    assert_eq!(coordinator.budget().available(), 5000);
    assert!(env.scratch_files().is_empty());

    let archive = format!("{COLLECTION}/run1.zip");
    assert_eq!(env.repo.object_size(&archive), Some(2000));
    assert_eq!(env.repo.object_size(&format!("{COLLECTION}/scan.tif")), Some(10_000));
    let meta = env.repo.metadata_of(&archive);
    assert_eq!(meta.get("NPEC_crop").map(String::as_str), Some("maize"));
    assert_eq!(meta.get("NPEC_plot").map(String::as_str), Some("-"));
    // Path-forming columns are tags too.
    assert_eq!(meta.get("NPEC_system").map(String::as_str), Some("PhenoBox"));
    assert_eq!(meta.get("NPEC_year").map(String::as_str), Some("2023"));
    assert_eq!(meta.get("NPEC_category").map(String::as_str), Some("Greenhouse"));
}

#[tokio::test]
async fn rerun_does_not_upload_again() {
    let env = TestEnv::new();
    env.write_file("run1/plate_a.tif", 1500);
    env.write_file("scan.tif", 300);
    env.write_manifest(serde_json::json!([row("run1"), row("scan.tif")]));

    env.coordinator(env.config()).run().await.unwrap();
    let uploads = env.repo.uploads();
    assert_eq!(uploads.len(), 2);

    // Step one task back as if the run stopped right after its upload.
    let mut ledger = Ledger::load(env.ledger_path()).unwrap();
    ledger.get_mut("run1").unwrap().status = TaskStatus::Uploaded;
    ledger.persist().unwrap();

    let summary = env.coordinator(env.config()).run().await.unwrap();
    assert_eq!(summary.incomplete, 0);
    assert_eq!(env.repo.uploads(), uploads);
    assert_eq!(env.archiver.calls(), 1);
    assert_eq!(status(&env, "run1"), TaskStatus::MetadataAdded);
}

#[tokio::test]
async fn oversized_folder_is_split_into_volumes() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 1000);
    env.write_file("run1/b.tif", 1000);
    env.write_manifest(serde_json::json!([row("run1")]));

    let config = ingest_pipeline::Config {
        max_single_archive_bytes: ByteSize(1000),
        volume_size: ByteSize(400),
        ..env.config()
    };
    let coordinator = env.coordinator(config);
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.incomplete, 0);

    let ledger = Ledger::load(env.ledger_path()).unwrap();
    let parent = ledger.get("run1").unwrap();
    assert!(parent.multi_volume);
    assert_eq!(parent.status, TaskStatus::MetadataAdded);

    let volumes: Vec<&Task> = ledger.children("run1").collect();
    assert_eq!(volumes.len(), 5);
    for volume in &volumes {
        assert_eq!(volume.kind, TaskKind::Volume);
        assert_eq!(volume.status, TaskStatus::MetadataAdded);
        assert_eq!(volume.metadata, parent.metadata);
        assert_eq!(volume.remote_path.parent(), Some(RemotePath::new(COLLECTION)));
        let meta = env.repo.metadata_of(volume.remote_path.as_str());
        assert_eq!(meta.get("NPEC_crop").map(String::as_str), Some("maize"));
    }
    assert_eq!(env.repo.object_size(&format!("{COLLECTION}/run1.z01")), Some(400));
    assert_eq!(env.repo.object_size(&format!("{COLLECTION}/run1.zip")), Some(400));
    assert_eq!(coordinator.budget().available(), 5000);
    assert!(env.scratch_files().is_empty());
}

#[tokio::test]
async fn folder_larger_than_scratch_stops_before_queueing() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 2000);
    env.write_file("scan.tif", 100);
    env.write_manifest(serde_json::json!([row("scan.tif"), row("run1")]));

    let config = ingest_pipeline::Config {
        scratch_capacity: ByteSize(1000),
        ..env.config()
    };
    let err = env.coordinator(config).run().await.unwrap_err();
    match err {
        IngestError::Capacity { label, size, limit, .. } => {
            assert_eq!(label, "run1");
            assert_eq!(size, 2000);
            assert_eq!(limit, 1000);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(env.archiver.calls(), 0);
    assert!(env.repo.uploads().is_empty());
    assert!(env.scratch_files().is_empty());
    assert_eq!(status(&env, "run1"), TaskStatus::Pending);
    assert_eq!(status(&env, "scan.tif"), TaskStatus::Pending);
}

#[tokio::test]
async fn oversized_payload_can_be_skipped() {
    let env = TestEnv::new();
    env.write_file("big.raw", 3000);
    env.write_file("small.raw", 10);
    env.write_manifest(serde_json::json!([row("big.raw"), row("small.raw")]));

    let config = ingest_pipeline::Config {
        max_single_archive_bytes: ByteSize(1000),
        split_oversized: false,
        skip_oversized: true,
        ..env.config()
    };
    let summary = env.coordinator(config).run().await.unwrap();

    assert_eq!(summary.incomplete, 0);
    assert_eq!(status(&env, "big.raw"), TaskStatus::SkippedTooLarge);
    assert_eq!(status(&env, "small.raw"), TaskStatus::MetadataAdded);
    assert_eq!(env.repo.uploads(), vec![format!("{COLLECTION}/small.raw")]);
}

#[tokio::test]
async fn invalid_rows_halt_before_any_transfer() {
    let env = TestEnv::new();
    env.write_file("ok.tif", 10);
    env.write_file("bad#name.tif", 10);
    env.write_manifest(serde_json::json!([row("ok.tif"), row("bad#name.tif")]));

    let err = env.coordinator(env.config()).run().await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { ref label, .. } if label == "bad#name.tif"));
    assert_eq!(status(&env, "bad#name.tif"), TaskStatus::Invalid);
    assert!(env.repo.uploads().is_empty());

    // Still halted on the next run.
    let err = env.coordinator(env.config()).run().await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));
}

#[tokio::test]
async fn reserved_metadata_key_is_rejected() {
    let env = TestEnv::new();
    env.write_file("ok.tif", 10);
    let mut bad = row("ok.tif");
    bad["select"] = serde_json::json!("x");
    env.write_manifest(serde_json::json!([bad]));

    let err = env.coordinator(env.config()).run().await.unwrap_err();
    match err {
        IngestError::Validation { reason, .. } => assert!(reason.contains("select")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(env.repo.uploads().is_empty());
}

#[tokio::test]
async fn resumes_archive_left_in_scratch() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 2000);
    let archive = env.scratch.path().join("run1.zip");
    fs::write(&archive, vec![0u8; 2000]).unwrap();
    fs::write(env.scratch.path().join("stray.bin"), vec![0u8; 500]).unwrap();

    let mut ledger = Ledger::new(env.ledger_path());
    let mut task = Task::new(
        "run1",
        env.source.path().join("run1"),
        RemotePath::new(format!("{COLLECTION}/run1.zip")),
        TaskKind::Folder,
    );
    task.archive_path = Some(archive.clone());
    task.size_bytes = Some(2000);
    task.status = TaskStatus::Archived;
    task.metadata.insert("crop".into(), Some("maize".into()));
    ledger.push(task).unwrap();
    ledger.persist().unwrap();

    let coordinator = env.coordinator(env.config());
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.incomplete, 0);
    assert_eq!(env.archiver.calls(), 0);
    assert_eq!(status(&env, "run1"), TaskStatus::MetadataAdded);
    assert!(!archive.exists());
    // The stray file stays charged to the budget.
    assert_eq!(coordinator.budget().available(), 4500);
    assert_eq!(
        env.repo.object_size(&format!("{COLLECTION}/run1.zip")),
        Some(2000)
    );
}

#[tokio::test]
async fn missing_archive_with_remote_copy_counts_as_uploaded() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 50);
    env.write_file("run1.zip", 50);
    env.write_manifest(serde_json::json!([row("run1.zip")]));
    // Put the object on the remote through a first run of a plain file row.
    env.coordinator(env.config()).run().await.unwrap();
    fs::remove_file(env.ledger_path()).unwrap();

    let mut ledger = Ledger::new(env.ledger_path());
    let mut task = Task::new(
        "run1",
        env.source.path().join("run1"),
        RemotePath::new(format!("{COLLECTION}/run1.zip")),
        TaskKind::Folder,
    );
    task.archive_path = Some(env.scratch.path().join("run1.zip"));
    task.size_bytes = Some(50);
    task.status = TaskStatus::QueuedUpload;
    ledger.push(task).unwrap();
    ledger.persist().unwrap();

    let uploads = env.repo.uploads();
    env.coordinator(env.config()).run().await.unwrap();
    assert_eq!(env.repo.uploads(), uploads);
    assert_eq!(status(&env, "run1"), TaskStatus::MetadataAdded);
}

#[tokio::test]
async fn missing_archive_without_remote_copy_is_fatal() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 50);

    let mut ledger = Ledger::new(env.ledger_path());
    let mut task = Task::new(
        "run1",
        env.source.path().join("run1"),
        RemotePath::new(format!("{COLLECTION}/run1.zip")),
        TaskKind::Folder,
    );
    task.archive_path = Some(env.scratch.path().join("run1.zip"));
    task.status = TaskStatus::Archived;
    ledger.push(task).unwrap();
    ledger.persist().unwrap();

    let err = env.coordinator(env.config()).run().await.unwrap_err();
    assert!(matches!(err, IngestError::MissingPayload { ref label, .. } if label == "run1"));
    assert!(env.repo.uploads().is_empty());
}

#[tokio::test]
async fn oversized_queued_archive_is_skipped_on_rerun() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 3000);

    let mut ledger = Ledger::new(env.ledger_path());
    let mut task = Task::new(
        "run1",
        env.source.path().join("run1"),
        RemotePath::new(format!("{COLLECTION}/run1.zip")),
        TaskKind::Folder,
    );
    task.archive_path = Some(env.scratch.path().join("run1.zip"));
    task.status = TaskStatus::QueuedArchive;
    ledger.push(task).unwrap();
    ledger.persist().unwrap();

    let config = ingest_pipeline::Config {
        max_single_archive_bytes: ByteSize(1000),
        split_oversized: false,
        skip_oversized: true,
        ..env.config()
    };
    let summary = env.coordinator(config).run().await.unwrap();
    assert_eq!(summary.incomplete, 0);
    assert_eq!(status(&env, "run1"), TaskStatus::SkippedTooLarge);
    assert_eq!(env.archiver.calls(), 0);
}

fn raw_folder_config(env: &TestEnv) -> ingest_pipeline::Config {
    ingest_pipeline::Config {
        compress_folders: false,
        ..env.config()
    }
}

#[tokio::test]
async fn interrupted_folder_upload_is_completed() {
    let env = TestEnv::new();
    let first = env.write_file("run1/a.tif", 100);
    env.write_file("run1/b.tif", 200);
    env.write_file("run1/sub/c.tif", 300);

    // Only a.tif reached the repository before the earlier run stopped.
    let remote = RemotePath::new(format!("{COLLECTION}/run1"));
    env.repo
        .upload(&first, &remote.join("a.tif"), UploadOptions::default())
        .await
        .unwrap();
    let before = env.repo.uploads();

    let mut ledger = Ledger::new(env.ledger_path());
    let mut task = Task::new("run1", env.source.path().join("run1"), remote, TaskKind::Folder);
    task.size_bytes = Some(600);
    task.status = TaskStatus::QueuedUpload;
    task.metadata.insert("crop".into(), Some("maize".into()));
    ledger.push(task).unwrap();
    ledger.persist().unwrap();

    let summary = env.coordinator(raw_folder_config(&env)).run().await.unwrap();
    assert_eq!(summary.incomplete, 0);
    assert_eq!(status(&env, "run1"), TaskStatus::MetadataAdded);

    let mut added = env.repo.uploads()[before.len()..].to_vec();
    added.sort();
    assert_eq!(
        added,
        vec![format!("{COLLECTION}/run1/b.tif"), format!("{COLLECTION}/run1/sub/c.tif")]
    );
    assert_eq!(env.repo.object_size(&format!("{COLLECTION}/run1/sub/c.tif")), Some(300));
    assert_eq!(env.archiver.calls(), 0);
}

#[tokio::test]
async fn raw_folder_reaches_archive_tier() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 100);
    env.write_file("run1/sub/b.tif", 100);
    env.write_manifest(serde_json::json!([row("run1")]));

    let config = ingest_pipeline::Config {
        send_to_archive_tier: true,
        ..raw_folder_config(&env)
    };
    let summary = env.coordinator(config).run().await.unwrap();

    assert_eq!(summary.incomplete, 0);
    assert_eq!(status(&env, "run1"), TaskStatus::ArchivedRemote);
    assert_eq!(env.archiver.calls(), 0);
    assert_eq!(env.repo.object_size(&format!("{COLLECTION}/run1/sub/b.tif")), Some(100));
}

#[tokio::test]
async fn cancelled_run_resumes_without_duplicate_uploads() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 1000);
    env.write_file("run2/a.tif", 1000);
    env.write_manifest(serde_json::json!([row("run1"), row("run2")]));

    let config = ingest_pipeline::Config {
        archiver_workers: 1,
        ..env.config()
    };
    let coordinator = env.coordinator(config.clone());
    *env.archiver.cancel_on_compress.lock() = Some(coordinator.cancel_flag());

    let err = coordinator.run().await.unwrap_err();
    assert!(matches!(err, IngestError::Cancelled));
    assert!(coordinator.cancel_flag().load(Ordering::SeqCst));
    assert_eq!(env.archiver.calls(), 1);

    // The ledger on disk shows the second folder was never compressed.
    let ledger = Ledger::load(env.ledger_path()).unwrap();
    let waiting = ledger
        .tasks()
        .iter()
        .filter(|t| t.status == TaskStatus::QueuedArchive)
        .count();
    assert_eq!(waiting, 1);

    let summary = env.coordinator(config).run().await.unwrap();
    assert_eq!(summary.incomplete, 0);
    assert_eq!(env.archiver.calls(), 2);
    assert_eq!(status(&env, "run1"), TaskStatus::MetadataAdded);
    assert_eq!(status(&env, "run2"), TaskStatus::MetadataAdded);

    let mut uploads = env.repo.uploads();
    uploads.sort();
    assert_eq!(
        uploads,
        vec![format!("{COLLECTION}/run1.zip"), format!("{COLLECTION}/run2.zip")]
    );
    assert!(env.scratch_files().is_empty());
}

/// A split parent plus one ledger row per volume, as a stopped run leaves
/// them. Volumes whose status is at least `Uploaded` are put on the remote.
async fn split_ledger(env: &TestEnv, volumes: &[(&str, TaskStatus, bool)]) {
    let mut ledger = Ledger::new(env.ledger_path());
    let mut parent = Task::new(
        "run1",
        env.source.path().join("run1"),
        RemotePath::new(format!("{COLLECTION}/run1.zip")),
        TaskKind::Folder,
    );
    parent.multi_volume = true;
    parent.archive_path = Some(env.scratch.path().join("run1.zip"));
    parent.size_bytes = Some(1200);
    parent.status = TaskStatus::Archived;
    parent.metadata.insert("crop".into(), Some("maize".into()));
    ledger.push(parent.clone()).unwrap();

    for (file, status, in_scratch) in volumes {
        let archive = env.scratch.path().join(file);
        if *in_scratch {
            fs::write(&archive, vec![0u8; 400]).unwrap();
        }
        let mut row = Task::new(
            format!("run1::{file}"),
            parent.local_path.clone(),
            RemotePath::new(format!("{COLLECTION}/{file}")),
            TaskKind::Volume,
        );
        row.parent = Some("run1".into());
        row.metadata = parent.metadata.clone();
        row.size_bytes = Some(400);
        row.archive_path = Some(archive);
        row.status = *status;
        if status.rank() >= TaskStatus::Uploaded.rank() {
            put_remote(env, &row.remote_path).await;
        }
        ledger.push(row).unwrap();
    }
    ledger.persist().unwrap();
}

async fn put_remote(env: &TestEnv, remote: &RemotePath) {
    let local = env.state.path().join("volume.bin");
    fs::write(&local, vec![0u8; 400]).unwrap();
    env.repo
        .upload(&local, remote, UploadOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn split_archive_resumes_remaining_volumes() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 1200);
    split_ledger(
        &env,
        &[
            ("run1.z01", TaskStatus::Uploaded, false),
            ("run1.z02", TaskStatus::QueuedUpload, true),
            ("run1.zip", TaskStatus::Archived, true),
        ],
    )
    .await;
    let before = env.repo.uploads();

    let coordinator = env.coordinator(env.config());
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.incomplete, 0);
    assert_eq!(env.archiver.calls(), 0);
    let mut added = env.repo.uploads()[before.len()..].to_vec();
    added.sort();
    assert_eq!(
        added,
        vec![format!("{COLLECTION}/run1.z02"), format!("{COLLECTION}/run1.zip")]
    );

    let ledger = Ledger::load(env.ledger_path()).unwrap();
    assert_eq!(ledger.get("run1").unwrap().status, TaskStatus::MetadataAdded);
    for volume in ledger.children("run1") {
        assert_eq!(volume.status, TaskStatus::MetadataAdded);
    }
    assert_eq!(coordinator.budget().available(), 5000);
    assert!(env.scratch_files().is_empty());
}

#[tokio::test]
async fn finished_volumes_release_the_parent_archive() {
    let env = TestEnv::new();
    env.write_file("run1/a.tif", 800);
    // Every volume made it, but the run stopped before the scratch copies
    // were removed and the parent caught up.
    split_ledger(
        &env,
        &[
            ("run1.z01", TaskStatus::Uploaded, true),
            ("run1.zip", TaskStatus::Uploaded, true),
        ],
    )
    .await;
    let before = env.repo.uploads();

    let coordinator = env.coordinator(env.config());
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.incomplete, 0);
    assert_eq!(env.repo.uploads(), before);
    assert_eq!(status(&env, "run1"), TaskStatus::MetadataAdded);
    assert_eq!(coordinator.budget().available(), 5000);
    assert!(env.scratch_files().is_empty());
}
