use clearscan_core::ScanError;
use clearscan_core::clearance::{NewBulkConclusion, NewLicenseConclusion, NewPathExclusion};
use clearscan_core::database::PackageRepository;
use clearscan_core::service::SubmitTarget;
use clearscan_model::{ClearanceGroupId, PackageId};

#[path = "support/mod.rs"]
mod support;

use support::{Harness, sha};

const PURL: &str = "pkg:npm/widgets@2.1.0";
const INDEX: &[u8] = b"module.exports = require('./lib');\n";
const LIB: &[u8] = b"exports.widget = () => 42;\n";
const FIXTURE: &[u8] = b"{\"fixture\": true}\n";

async fn ingested() -> (Harness, PackageId) {
    let harness = Harness::new().await;
    harness
        .upload_archive(
            "archives/widgets.tgz",
            &[
                ("index.js", INDEX),
                ("lib/widget.js", LIB),
                ("test/fixtures/data.json", FIXTURE),
            ],
        )
        .await;
    harness
        .service
        .submit_job("archives/widgets.tgz", vec![SubmitTarget::Purl(PURL.into())])
        .await
        .unwrap();
    harness.service.drain().await;
    let package = harness
        .store
        .find_package_by_purl(&PURL.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    (harness, package.id)
}

fn conclusion(
    package_id: PackageId,
    bytes: &[u8],
    expression: &str,
    group: ClearanceGroupId,
) -> NewLicenseConclusion {
    NewLicenseConclusion {
        hash: sha(bytes),
        package_id,
        detected_expression: None,
        concluded_expression: expression.into(),
        comment: None,
        curator: "bob".into(),
        group_ids: vec![group],
    }
}

#[tokio::test]
async fn ranked_groups_pick_one_conclusion_per_file() {
    let (harness, package_id) = ingested().await;
    let curator = harness.service.curator();
    let g1 = curator.create_group("upstream").await.unwrap().id;
    let g2 = curator.create_group("community").await.unwrap().id;
    let g3 = curator.create_group("legal").await.unwrap().id;

    curator
        .add_license_conclusion(conclusion(package_id, INDEX, "Apache-2.0", g3))
        .await
        .unwrap();
    curator
        .add_license_conclusion(conclusion(package_id, INDEX, "MIT", g1))
        .await
        .unwrap();
    curator
        .add_license_conclusion(conclusion(package_id, INDEX, "GPL-3.0", g2))
        .await
        .unwrap();

    let effective = harness
        .service
        .resolve_clearance(PURL, &[g3, g1, g2])
        .await
        .unwrap();
    assert_eq!(effective.license_conclusions.len(), 1);
    assert_eq!(effective.license_conclusions[0].concluded_expression, "Apache-2.0");

    let effective = harness.service.resolve_clearance(PURL, &[g2]).await.unwrap();
    assert_eq!(effective.license_conclusions[0].concluded_expression, "GPL-3.0");

    let effective = harness.service.resolve_clearance(PURL, &[]).await.unwrap();
    assert!(effective.license_conclusions.is_empty());
}

#[tokio::test]
async fn bulk_conclusions_resolve_per_pattern_and_per_file() {
    let (harness, package_id) = ingested().await;
    let curator = harness.service.curator();
    let team = curator.create_group("team").await.unwrap().id;
    let legal = curator.create_group("legal").await.unwrap().id;

    let bulk = curator
        .create_bulk_conclusion(NewBulkConclusion {
            package_id,
            pattern: "**/*.js".into(),
            detected_expression: Some("MIT".into()),
            concluded_expression: "MIT".into(),
            comment: None,
            curator: "carol".into(),
            group_ids: vec![team],
        })
        .await
        .unwrap();
    assert_eq!(bulk.conclusions.len(), 2);
    curator
        .add_license_conclusion(conclusion(package_id, LIB, "BSD-2-Clause", legal))
        .await
        .unwrap();
    curator
        .add_path_exclusion(NewPathExclusion {
            package_id,
            pattern: "test/**".into(),
            reason: "test data".into(),
            comment: None,
            curator: "carol".into(),
            group_ids: vec![team],
        })
        .await
        .unwrap();

    let effective = harness
        .service
        .resolve_clearance(PURL, &[legal, team])
        .await
        .unwrap();
    assert_eq!(effective.bulk_conclusions.len(), 1);
    assert_eq!(effective.path_exclusions.len(), 1);
    assert_eq!(effective.license_conclusions.len(), 2);
    let for_lib = effective
        .license_conclusions
        .iter()
        .find(|c| c.hash == sha(LIB))
        .unwrap();
    assert_eq!(for_lib.concluded_expression, "BSD-2-Clause");
    let for_index = effective
        .license_conclusions
        .iter()
        .find(|c| c.hash == sha(INDEX))
        .unwrap();
    assert_eq!(for_index.bulk_conclusion_id, Some(bulk.bulk.id));

    let removed = harness
        .service
        .delete_bulk_conclusion(bulk.bulk.id)
        .await
        .unwrap();
    assert_eq!(removed, 2);
    let effective = harness
        .service
        .resolve_clearance(PURL, &[legal, team])
        .await
        .unwrap();
    assert!(effective.bulk_conclusions.is_empty());
    assert_eq!(effective.license_conclusions.len(), 1);
}

#[tokio::test]
async fn bulk_without_matches_is_rejected_and_leaves_nothing() {
    let (harness, package_id) = ingested().await;
    let curator = harness.service.curator();
    let group = curator.create_group("legal").await.unwrap().id;

    let err = curator
        .create_bulk_conclusion(NewBulkConclusion {
            package_id,
            pattern: "**/*.nomatch".into(),
            detected_expression: None,
            concluded_expression: "MIT".into(),
            comment: None,
            curator: "dave".into(),
            group_ids: vec![group],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::DataIntegrity(_)));
    assert_eq!(harness.store.license_conclusion_count().await, 0);
}

#[tokio::test]
async fn unknown_package_is_not_found() {
    let harness = Harness::new().await;
    assert!(matches!(
        harness
            .service
            .resolve_clearance("pkg:npm/nobody@0.0.1", &[])
            .await,
        Err(ScanError::NotFound(_))
    ));
}
