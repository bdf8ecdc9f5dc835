use hpt_checklist::score_batch;
use hpt_mds::{flatten_batch, parse_batch, LocalSnapshotSource, MetadataSource};
use uuid::Uuid;

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mds/sample_metadata.json")
}

#[tokio::test]
async fn sample_snapshot_flattens_every_guid() {
    let source = LocalSnapshotSource::new(fixture_path());
    let raw = source.fetch_raw(Uuid::new_v4()).await.expect("read fixture");
    let records = flatten_batch(&parse_batch(&raw).expect("parse fixture"));

    let ids = records.iter().map(|r| r.hdp_id()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["HDP00001", "HDP00002", "HDP00003", "HDP00004"]);

    let first = &records[0];
    assert_eq!(first.cell("appl_id"), "10056337");
    assert_eq!(first.cell("is_registered"), "is registered");
    assert_eq!(first.cell("archived"), "live");
    assert_eq!(first.cell("clinicaltrials_gov.OverallStatus"), "Recruiting");
    assert_eq!(first.cell("cedar_study_metadata.study_type.observational"), "1");
    assert_eq!(first.cell("study_metadata.citation.heal_funded_status"), "true");

    let archived = &records[2];
    assert_eq!(archived.cell("archived"), "archived");
    assert_eq!(archived.cell("archive_date"), "2024-06-30");
    assert_eq!(archived.cell("appl_id"), "");

    assert_eq!(records[3].cell("appl_id"), "9867358");
    assert_eq!(records[3].cell("is_registered"), "not registered");
}

#[tokio::test]
async fn sample_snapshot_scores_registered_study() {
    let raw = tokio::fs::read(fixture_path()).await.expect("read fixture");
    let mut records = flatten_batch(&parse_batch(&raw).expect("parse fixture"));
    let cards = score_batch(&mut records);
    let card = &cards[0];

    // minimal_info 2/3, websites 2/2, data_availability 2/3, study_type 2/2,
    // data 1/2, human_subject_applicability 2/2
    assert_eq!(card.overall_total, 14);
    assert_eq!(card.overall_complete, 11);
    assert_eq!(card.overall_percent, 78.6);
    assert_eq!(card.last_cedar_update, "2024-11-02 09:15:00");

    let missing = card.missing_fields().collect::<Vec<_>>();
    assert_eq!(
        missing,
        vec![
            "cedar_study_metadata.minimal_info.alternative_study_name",
            "cedar_study_metadata.data_availability.data_restricted",
            "cedar_study_metadata.data.data_source",
        ]
    );
}

#[tokio::test]
async fn sample_snapshot_scores_sparse_study_against_batch_columns() {
    let raw = tokio::fs::read(fixture_path()).await.expect("read fixture");
    let mut records = flatten_batch(&parse_batch(&raw).expect("parse fixture"));
    let cards = score_batch(&mut records);

    // HDP00003 answers nothing; every batch checklist field is missing except the websites baseline.
    let archived = &cards[2];
    assert_eq!(archived.hdp_id, "HDP00003");
    assert_eq!(archived.overall_total, cards[0].overall_total);
    assert_eq!(archived.overall_complete, 1);
    assert_eq!(archived.overall_percent, 7.1);
    assert!(archived
        .missing_fields()
        .any(|f| f == "cedar_study_metadata.study_type.observational"));
}
