use clearscan_core::ScanError;
use clearscan_core::clearance::NewLicenseConclusion;
use clearscan_core::database::{
    ClearanceRepository, FileRepository, JobRepository, PackageRepository,
};
use clearscan_core::orchestration::{
    JobLifecycle, MergeConfig, OrchestratorConfig, QueueEventSync, ResultsMerger,
};
use clearscan_core::service::{ScanResults, SubmitTarget};
use clearscan_core::storage::{ObjectStorage, hash_key};
use clearscan_model::{
    FileScanStatus, JobId, JobState, PackageScanStatus, Purl, QueueEvent, QueueEventKind,
};

#[path = "support/mod.rs"]
mod support;

use support::{Harness, payload, sha};

const SHARED: &[u8] = b"Permission is hereby granted, free of charge";
const OTHER: &[u8] = b"fn main() {}\n";

fn purls(raw: &[&str]) -> Vec<SubmitTarget> {
    raw.iter().map(|p| SubmitTarget::Purl(p.to_string())).collect()
}

fn queue_sync(harness: &Harness) -> QueueEventSync {
    let store = harness.store_handle();
    QueueEventSync::new(
        JobLifecycle::new(store.clone()),
        ResultsMerger::new(store, MergeConfig::default()),
        harness.worker.clone(),
        harness.status.clone(),
    )
}

async fn package_status(harness: &Harness, raw: &str) -> PackageScanStatus {
    let purl: Purl = raw.parse().unwrap();
    harness
        .store
        .find_package_by_purl(&purl)
        .await
        .unwrap()
        .unwrap()
        .scan_status
}

async fn job_state(harness: &Harness, id: JobId) -> JobState {
    harness.store.get_job(id).await.unwrap().unwrap().state
}

#[tokio::test]
async fn identical_content_is_dispatched_once() {
    let harness = Harness::new().await;
    let first = [("LICENSE", SHARED), ("vendor/LICENSE", SHARED), ("src/main.rs", OTHER)];
    harness.upload_archive("archives/one.tar.gz", &first).await;

    let job_id = harness
        .service
        .submit_job("archives/one.tar.gz", purls(&["pkg:cargo/one@1.0.0"]))
        .await
        .unwrap();
    harness.service.drain().await;

    let submissions = harness.worker.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].job_id, job_id);
    assert_eq!(submissions[0].files.len(), 2);
    assert_eq!(harness.store.file_count().await, 2);
    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.file_count, Some(2));
    assert_eq!(
        package_status(&harness, "pkg:cargo/one@1.0.0").await,
        PackageScanStatus::Pending
    );
    for file in &submissions[0].files {
        assert!(harness.storage.exists(&hash_key(&file.hash)).await.unwrap());
    }

    queue_sync(&harness)
        .handle(QueueEvent::new(
            job_id,
            QueueEventKind::Completed {
                result: Some(Box::new(payload(&first, "MIT"))),
            },
        ))
        .await
        .unwrap();
    assert_eq!(job_state(&harness, job_id).await, JobState::Completed);
    let record = harness.store.get_file(&sha(SHARED)).await.unwrap().unwrap();
    assert_eq!(record.scan_status, FileScanStatus::Scanned);

    // Same bytes under other paths in another package.
    let second = [("COPYING", SHARED), ("bin/tool.rs", OTHER)];
    harness.upload_archive("archives/two.tar.gz", &second).await;
    let second_job = harness
        .service
        .submit_job("archives/two.tar.gz", purls(&["pkg:cargo/two@1.0.0"]))
        .await
        .unwrap();
    harness.service.drain().await;

    assert_eq!(harness.worker.submissions().len(), 1);
    assert_eq!(harness.store.file_count().await, 2);
    assert_eq!(job_state(&harness, second_job).await, JobState::Completed);
    assert_eq!(
        package_status(&harness, "pkg:cargo/two@1.0.0").await,
        PackageScanStatus::Scanned
    );
    let package = harness
        .store
        .find_package_by_purl(&"pkg:cargo/two@1.0.0".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        harness
            .store
            .file_trees_for_package(package.id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn one_archive_fans_out_to_every_package() {
    let harness = Harness::new().await;
    harness
        .upload_archive("archives/shared.tar.gz", &[("README", OTHER)])
        .await;

    let job_id = harness
        .service
        .submit_job(
            "archives/shared.tar.gz",
            purls(&["pkg:npm/a@1.0.0", "pkg:npm/b@1.0.0", "pkg:npm/c@1.0.0"]),
        )
        .await
        .unwrap();
    harness.service.drain().await;

    assert_eq!(harness.worker.submissions().len(), 1);
    let children = harness.store.children_of(job_id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.state == JobState::Queued));

    queue_sync(&harness)
        .handle(QueueEvent::new(
            job_id,
            QueueEventKind::Failed {
                reason: Some("worker crashed".into()),
            },
        ))
        .await
        .unwrap();

    assert_eq!(job_state(&harness, job_id).await, JobState::Failed);
    for child in &children {
        assert_eq!(job_state(&harness, child.id).await, JobState::Failed);
    }
    for purl in ["pkg:npm/a@1.0.0", "pkg:npm/b@1.0.0", "pkg:npm/c@1.0.0"] {
        assert_eq!(package_status(&harness, purl).await, PackageScanStatus::Failed);
    }
    let view = harness.service.get_job_state(children[0].id).await.unwrap();
    assert_eq!(view.message.as_deref(), Some("worker crashed"));
}

#[tokio::test]
async fn missing_archive_fails_the_whole_batch() {
    let harness = Harness::new().await;
    let job_id = harness
        .service
        .submit_job("archives/missing.tar.gz", purls(&["pkg:pypi/x@1", "pkg:pypi/y@1"]))
        .await
        .unwrap();
    harness.service.drain().await;

    assert!(harness.worker.submissions().is_empty());
    assert_eq!(job_state(&harness, job_id).await, JobState::Failed);
    for child in harness.store.children_of(job_id).await.unwrap() {
        assert_eq!(child.state, JobState::Failed);
    }
    assert_eq!(package_status(&harness, "pkg:pypi/y@1").await, PackageScanStatus::Failed);
    let view = harness.service.get_job_state(job_id).await.unwrap();
    assert!(view.message.unwrap().starts_with("Ingest failed"));
}

#[tokio::test]
async fn exhausted_dispatch_fails_job_and_package() {
    let mut config = OrchestratorConfig::default();
    config.dispatch.retry_delay_ms = 1;
    let harness = Harness::with_config(config).await;
    harness.worker.refuse_submissions();
    harness
        .upload_archive("archives/offline.tar.gz", &[("main.c", OTHER)])
        .await;

    let job_id = harness
        .service
        .submit_job("archives/offline.tar.gz", purls(&["pkg:generic/offline@1.0"]))
        .await
        .unwrap();
    harness.service.drain().await;

    let attempts = harness.worker.submissions();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|request| request.job_id == job_id));
    assert_eq!(job_state(&harness, job_id).await, JobState::Failed);
    assert_eq!(
        package_status(&harness, "pkg:generic/offline@1.0").await,
        PackageScanStatus::Failed
    );
    let stored = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert!(stored.failure_message.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn unreadable_archive_is_fatal() {
    let harness = Harness::new().await;
    harness
        .storage
        .put_bytes("archives/garbage.tar.gz", b"definitely not gzip")
        .await
        .unwrap();
    let job_id = harness
        .service
        .submit_job("archives/garbage.tar.gz", purls(&["pkg:gem/rake@13.0.0"]))
        .await
        .unwrap();
    harness.service.drain().await;

    assert_eq!(job_state(&harness, job_id).await, JobState::Failed);
    assert_eq!(
        package_status(&harness, "pkg:gem/rake@13.0.0").await,
        PackageScanStatus::Failed
    );
}

#[tokio::test]
async fn scanned_packages_are_not_resubmitted() {
    let harness = Harness::new().await;
    let files = [("index.js", OTHER)];
    harness.upload_archive("archives/a.tar.gz", &files).await;
    let job_id = harness
        .service
        .submit_job("archives/a.tar.gz", purls(&["pkg:npm/left-pad@1.3.0"]))
        .await
        .unwrap();
    harness.service.drain().await;
    queue_sync(&harness)
        .handle(QueueEvent::new(
            job_id,
            QueueEventKind::Completed {
                result: Some(Box::new(payload(&files, "WTFPL"))),
            },
        ))
        .await
        .unwrap();

    let err = harness
        .service
        .submit_job("archives/a.tar.gz", purls(&["pkg:npm/left-pad@1.3.0"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Conflict(_)));

    match harness.service.get_scan_results("pkg:npm/left-pad@1.3.0").await.unwrap() {
        ScanResults::Results(findings) => {
            assert_eq!(findings.licenses.len(), 1);
            assert_eq!(findings.licenses[0].license_expression, "WTFPL");
            assert_eq!(findings.paths[&sha(OTHER)], vec!["index.js".to_string()]);
        }
        other => panic!("expected results, got {other:?}"),
    }
}

#[tokio::test]
async fn deleting_results_collects_unshared_files_only() {
    let harness = Harness::new().await;
    let first = [("LICENSE", SHARED), ("a.rs", OTHER)];
    let second = [("LICENSE", SHARED)];
    harness.upload_archive("archives/first.tar.gz", &first).await;
    harness.upload_archive("archives/second.tar.gz", &second).await;
    let sync = queue_sync(&harness);

    let first_job = harness
        .service
        .submit_job("archives/first.tar.gz", purls(&["pkg:cargo/first@1.0.0"]))
        .await
        .unwrap();
    harness.service.drain().await;
    sync.handle(QueueEvent::new(
        first_job,
        QueueEventKind::Completed {
            result: Some(Box::new(payload(&first, "Apache-2.0"))),
        },
    ))
    .await
    .unwrap();
    harness
        .service
        .submit_job("archives/second.tar.gz", purls(&["pkg:cargo/second@1.0.0"]))
        .await
        .unwrap();
    harness.service.drain().await;
    assert_eq!(
        package_status(&harness, "pkg:cargo/second@1.0.0").await,
        PackageScanStatus::Scanned
    );

    let summary = harness
        .service
        .delete_scan_results("pkg:cargo/first@1.0.0")
        .await
        .unwrap();
    assert_eq!(summary.jobs, 1);
    assert_eq!(summary.files_removed, 1);
    assert_eq!(job_state(&harness, first_job).await, JobState::ResultsDeleted);
    assert_eq!(
        package_status(&harness, "pkg:cargo/first@1.0.0").await,
        PackageScanStatus::NotScanned
    );
    assert!(harness.store.get_file(&sha(OTHER)).await.unwrap().is_none());
    assert!(!harness.storage.exists(&hash_key(&sha(OTHER))).await.unwrap());
    assert!(harness.store.get_file(&sha(SHARED)).await.unwrap().is_some());
    assert_eq!(
        harness
            .service
            .get_scan_results("pkg:cargo/first@1.0.0")
            .await
            .unwrap(),
        ScanResults::NoResults
    );
}

#[tokio::test]
async fn deleting_results_keeps_curated_conclusions() {
    let harness = Harness::new().await;
    let files = [("src/lib.rs", OTHER)];
    harness.upload_archive("archives/curated.tar.gz", &files).await;
    let job_id = harness
        .service
        .submit_job("archives/curated.tar.gz", purls(&["pkg:cargo/curated@1.0.0"]))
        .await
        .unwrap();
    harness.service.drain().await;
    queue_sync(&harness)
        .handle(QueueEvent::new(
            job_id,
            QueueEventKind::Completed {
                result: Some(Box::new(payload(&files, "MIT"))),
            },
        ))
        .await
        .unwrap();

    let package = harness
        .store
        .find_package_by_purl(&"pkg:cargo/curated@1.0.0".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    let curator = harness.service.curator();
    let group = curator.create_group("legal").await.unwrap().id;
    curator
        .add_license_conclusion(NewLicenseConclusion {
            hash: sha(OTHER),
            package_id: package.id,
            detected_expression: Some("MIT".into()),
            concluded_expression: "MIT OR Apache-2.0".into(),
            comment: None,
            curator: "erin".into(),
            group_ids: vec![group],
        })
        .await
        .unwrap();

    let summary = harness
        .service
        .delete_scan_results("pkg:cargo/curated@1.0.0")
        .await
        .unwrap();
    assert_eq!(summary.files_removed, 1);
    assert!(harness.store.get_file(&sha(OTHER)).await.unwrap().is_none());
    assert_eq!(harness.store.license_finding_count().await, 0);
    assert_eq!(harness.store.license_conclusion_count().await, 1);
    let kept = harness
        .store
        .license_conclusions_for_hashes(&[sha(OTHER)])
        .await
        .unwrap();
    assert_eq!(kept[0].concluded_expression, "MIT OR Apache-2.0");
}

#[tokio::test]
async fn results_cannot_be_deleted_mid_scan() {
    let harness = Harness::new().await;
    harness
        .upload_archive("archives/busy.tar.gz", &[("main.go", OTHER)])
        .await;
    harness
        .service
        .submit_job("archives/busy.tar.gz", purls(&["pkg:golang/busy@1.0.0"]))
        .await
        .unwrap();
    harness.service.drain().await;

    assert_eq!(
        harness
            .service
            .get_scan_results("pkg:golang/busy@1.0.0")
            .await
            .unwrap(),
        ScanResults::Pending
    );
    assert!(matches!(
        harness.service.delete_scan_results("pkg:golang/busy@1.0.0").await,
        Err(ScanError::Conflict(_))
    ));
}
