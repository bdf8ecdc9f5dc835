//! Metadata service documents, source contracts and the study flattener.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hpt_checklist::is_cedar_group;
use hpt_core::{
    ArchiveState, FieldValue, RegistrationState, StudyRecord, APPL_ID, CEDAR_PREFIX,
    IS_REGISTERED, PROJECT_NUM, STUDY_METADATA_PREFIX,
};
use hpt_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hpt-mds";

/// Full metadata dump, every guid with its documents.
pub const DEFAULT_MDS_URL: &str = "https://healdata.org/mds/metadata?data=True&limit=1000000";

pub const ARCHIVED_GUID_TYPE: &str = "discovery_metadata_archive";

/// Funder columns merged from the `nih_reporter` document.
pub const FUNDER_FIELDS: &[&str] = &[
    "appl_id",
    "award_type",
    "award_amount",
    "award_notice_date",
    "project_end_date",
    "project_title",
];

/// Columns holding pseudo-JSON lists that the lookup service re-parses.
pub const PLACEHOLDER_LIST_FIELDS: &[&str] = &["dmp_plan", "heal_cde_used", "vlmd_metadata"];

type JsonObject = Map<String, JsonValue>;

/// The documents the metadata service holds for one guid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MdsDocument {
    #[serde(default)]
    pub gen3_discovery: Option<JsonObject>,
    #[serde(default)]
    pub nih_reporter: Option<JsonObject>,
    #[serde(default)]
    pub clinicaltrials_gov: Option<JsonObject>,
    #[serde(rename = "_guid_type", default)]
    pub guid_type: Option<String>,
}

impl MdsDocument {
    /// Lenient conversion: keys that are not objects (or strings for the type tag) are dropped.
    pub fn from_json(value: &JsonValue) -> Self {
        let object = |key: &str| value.get(key).and_then(JsonValue::as_object).cloned();
        Self {
            gen3_discovery: object("gen3_discovery"),
            nih_reporter: object("nih_reporter"),
            clinicaltrials_gov: object("clinicaltrials_gov"),
            guid_type: value
                .get("_guid_type")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
        }
    }
}

/// guid to documents, ordered by guid.
pub type MdsBatch = BTreeMap<String, MdsDocument>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing metadata payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("metadata payload is not an object keyed by guid")]
    NotKeyedByGuid,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub fn parse_batch(bytes: &[u8]) -> Result<MdsBatch, SourceError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let JsonValue::Object(by_guid) = value else {
        return Err(SourceError::NotKeyedByGuid);
    };
    let mut batch = MdsBatch::new();
    for (guid, doc) in by_guid {
        if !doc.is_object() {
            warn!(guid = %guid, "metadata entry is not an object; keeping empty record");
        }
        batch.insert(guid, MdsDocument::from_json(&doc));
    }
    Ok(batch)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSelection {
    Remote { url: String },
    Local { path: PathBuf },
}

impl Default for SourceSelection {
    fn default() -> Self {
        Self::Remote {
            url: DEFAULT_MDS_URL.to_string(),
        }
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn describe(&self) -> String;

    /// Raw payload bytes, exactly as served or stored.
    async fn fetch_raw(&self, run_id: Uuid) -> Result<Vec<u8>, SourceError>;
}

pub struct RemoteMdsSource {
    http: HttpFetcher,
    url: String,
}

impl RemoteMdsSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for RemoteMdsSource {
    fn describe(&self) -> String {
        format!("remote {}", self.url)
    }

    async fn fetch_raw(&self, run_id: Uuid) -> Result<Vec<u8>, SourceError> {
        Ok(self.http.fetch_bytes(run_id, &self.url).await?.body)
    }
}

pub struct LocalSnapshotSource {
    path: PathBuf,
}

impl LocalSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetadataSource for LocalSnapshotSource {
    fn describe(&self) -> String {
        format!("local {}", self.path.display())
    }

    async fn fetch_raw(&self, _run_id: Uuid) -> Result<Vec<u8>, SourceError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

pub fn source_for(
    selection: &SourceSelection,
    http: HttpClientConfig,
) -> Result<Box<dyn MetadataSource>, SourceError> {
    Ok(match selection {
        SourceSelection::Remote { url } => {
            Box::new(RemoteMdsSource::new(HttpFetcher::new(http)?, url.clone()))
        }
        SourceSelection::Local { path } => Box::new(LocalSnapshotSource::new(path.clone())),
    })
}

/// Flattens every guid in the batch, in guid order.
pub fn flatten_batch(batch: &MdsBatch) -> Vec<StudyRecord> {
    let records = batch
        .iter()
        .map(|(guid, doc)| flatten_study(guid, doc))
        .collect::<Vec<_>>();
    debug!(
        studies = records.len(),
        without_discovery = batch.values().filter(|d| d.gen3_discovery.is_none()).count(),
        without_funder = batch.values().filter(|d| d.nih_reporter.is_none()).count(),
        "flattened metadata batch"
    );
    records
}

/// Merges the discovery, funder and trial-registry documents of one study.
pub fn flatten_study(hdp_id: &str, doc: &MdsDocument) -> StudyRecord {
    let mut record = StudyRecord::new(hdp_id);
    let empty = JsonObject::new();
    let discovery = doc.gen3_discovery.as_ref().unwrap_or(&empty);

    for (key, value) in discovery {
        if key != "study_metadata" {
            record.set(key.as_str(), FieldValue::from_json(value));
        }
    }

    if let Some(guid_type) = &doc.guid_type {
        record.set("registration_status", guid_type.as_str());
    }

    if let Some(study_metadata) = discovery.get("study_metadata").and_then(JsonValue::as_object) {
        flatten_study_metadata(&mut record, study_metadata);
    }

    merge_funder(&mut record, doc.nih_reporter.as_ref());

    if let Some(trial) = &doc.clinicaltrials_gov {
        for (key, value) in trial {
            if !value.is_object() && !value.is_array() {
                record.set(format!("clinicaltrials_gov.{key}"), FieldValue::from_json(value));
            }
        }
    }

    derive_archive_status(&mut record, doc.guid_type.as_deref(), discovery);
    derive_registration(&mut record, discovery);
    derive_descriptive(&mut record, discovery);

    // The guid is authoritative even when the discovery document carries its own id.
    record.set(hpt_core::HDP_ID, hdp_id);
    record
}

fn flatten_study_metadata(record: &mut StudyRecord, study_metadata: &JsonObject) {
    for (group, fields) in study_metadata {
        let prefix = if is_cedar_group(group) {
            CEDAR_PREFIX
        } else {
            STUDY_METADATA_PREFIX
        };
        match fields.as_object() {
            Some(fields) => {
                for (field, value) in fields {
                    record.set(
                        format!("{prefix}.{group}.{field}"),
                        FieldValue::from_json(value),
                    );
                }
            }
            None => record.set(format!("{prefix}.{group}"), FieldValue::from_json(fields)),
        }
    }
}

fn merge_funder(record: &mut StudyRecord, funder: Option<&JsonObject>) {
    for field in FUNDER_FIELDS {
        let value = funder
            .and_then(|f| f.get(*field))
            .map(FieldValue::from_json)
            .unwrap_or_default();
        if *field == APPL_ID && value == FieldValue::Empty && record.contains(APPL_ID) {
            continue;
        }
        record.set(*field, value);
    }
}

fn derive_archive_status(record: &mut StudyRecord, guid_type: Option<&str>, discovery: &JsonObject) {
    if guid_type == Some(ARCHIVED_GUID_TYPE) {
        record.set("archived", ArchiveState::Archived.as_str());
        record.set("archive_date", json_field(discovery, "archive_date"));
    } else {
        record.set("archived", ArchiveState::Live.as_str());
        record.set("archive_date", "");
    }
}

fn derive_registration(record: &mut StudyRecord, discovery: &JsonObject) {
    let registered = match discovery.get(IS_REGISTERED) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64() == Some(1.0),
        _ => false,
    };

    if registered {
        let registered_at = match json_field(discovery, "time_of_registration") {
            FieldValue::Empty => record
                .get(&format!("{CEDAR_PREFIX}.time_of_registration"))
                .cloned()
                .unwrap_or_default(),
            value => value,
        };
        record.set(IS_REGISTERED, RegistrationState::Registered.as_str());
        record.set("time_of_registration", registered_at);
        record.set("registering_user", json_field(discovery, "registrant_username"));
    } else {
        record.set(IS_REGISTERED, RegistrationState::NotRegistered.as_str());
        record.set("time_of_registration", "");
        record.set("registering_user", "");
    }
}

fn derive_descriptive(record: &mut StudyRecord, discovery: &JsonObject) {
    let location = |field: &str| {
        record
            .get(&format!("{CEDAR_PREFIX}.metadata_location.{field}"))
            .cloned()
            .unwrap_or_default()
    };
    let nih_reporter_link = location("nih_reporter_link");
    let clinical_trials_study_id = location("clinical_trials_study_ID");
    let clinical_trials_study_link = location("clinical_trials_study_link");

    let first_repository = discovery
        .get("study_metadata")
        .and_then(|m| m.get("metadata_location"))
        .and_then(|m| m.get("data_repositories"))
        .and_then(JsonValue::as_array)
        .and_then(|repos| repos.first());
    let repository = |field: &str| {
        first_repository
            .and_then(|r| r.get(field))
            .map(FieldValue::from_json)
            .unwrap_or_default()
    };

    let study_name = match json_field(discovery, "project_title") {
        FieldValue::Text(title) => FieldValue::Text(title.replace('\'', "''")),
        other => other,
    };
    record.set("study_name", study_name);
    record.set(PROJECT_NUM, json_field(discovery, "project_number"));
    record.set("investigators_name", json_field(discovery, "investigators_name"));
    record.set("year_awarded", json_field(discovery, "year_awarded"));
    record.set("nih_reporter_link", nih_reporter_link);
    record.set("clinical_trials_study_ID", clinical_trials_study_id);
    record.set("clinical_trials_study_link", clinical_trials_study_link);
    record.set("repository_name", repository("repository_name"));
    record.set("repository_study_id", repository("repository_study_ID"));
    for field in PLACEHOLDER_LIST_FIELDS {
        if !record.contains(field) {
            record.set(*field, "[]");
        }
    }
}

fn json_field(object: &JsonObject, key: &str) -> FieldValue {
    object.get(key).map(FieldValue::from_json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> MdsDocument {
        MdsDocument::from_json(&value)
    }

    #[test]
    fn study_metadata_routes_checklist_groups_under_cedar_prefix() {
        let record = flatten_study(
            "HDP00001",
            &doc(json!({
                "gen3_discovery": {
                    "study_metadata": {
                        "study_type": {"observational": "1"},
                        "citation": {"heal_funded_status": true}
                    }
                }
            })),
        );
        assert_eq!(
            record.get("cedar_study_metadata.study_type.observational"),
            Some(&FieldValue::text("1"))
        );
        assert_eq!(
            record.get("study_metadata.citation.heal_funded_status"),
            Some(&FieldValue::Bool(true))
        );
        assert!(!record.contains("study_metadata"));
    }

    #[test]
    fn registration_and_archive_are_derived() {
        let record = flatten_study(
            "HDP00002",
            &doc(json!({
                "_guid_type": "discovery_metadata_archive",
                "gen3_discovery": {
                    "is_registered": true,
                    "time_of_registration": "2024-03-01 10:00:00",
                    "registrant_username": "pi@example.org",
                    "archive_date": "2025-01-15"
                }
            })),
        );
        assert_eq!(record.cell("registration_status"), "discovery_metadata_archive");
        assert_eq!(record.cell("archived"), "archived");
        assert_eq!(record.cell("archive_date"), "2025-01-15");
        assert_eq!(record.cell("is_registered"), "is registered");
        assert_eq!(record.cell("time_of_registration"), "2024-03-01 10:00:00");
        assert_eq!(record.cell("registering_user"), "pi@example.org");
    }

    #[test]
    fn unregistered_live_study_has_blank_status_dates() {
        let record = flatten_study(
            "HDP00003",
            &doc(json!({
                "_guid_type": "discovery_metadata",
                "gen3_discovery": {
                    "is_registered": false,
                    "time_of_registration": "2024-03-01 10:00:00",
                    "registrant_username": "someone"
                }
            })),
        );
        assert_eq!(record.cell("archived"), "live");
        assert_eq!(record.cell("archive_date"), "");
        assert_eq!(record.cell("is_registered"), "not registered");
        assert_eq!(record.cell("time_of_registration"), "");
        assert_eq!(record.cell("registering_user"), "");
    }

    #[test]
    fn funder_only_study_still_produces_a_record() {
        let record = flatten_study(
            "HDP00004",
            &doc(json!({
                "nih_reporter": {
                    "appl_id": 10056337,
                    "award_type": "5",
                    "award_amount": 1250000,
                    "project_title": "Opioid Use Disorder Outcomes"
                }
            })),
        );
        assert_eq!(record.cell("appl_id"), "10056337");
        assert_eq!(record.cell("award_amount"), "1250000");
        assert_eq!(record.cell("project_end_date"), "");
        assert_eq!(record.cell("study_name"), "");
        assert_eq!(record.cell("is_registered"), "not registered");
        assert_eq!(record.cell("dmp_plan"), "[]");
    }

    #[test]
    fn discovery_appl_id_survives_missing_funder_value() {
        let record = flatten_study(
            "HDP00005",
            &doc(json!({"gen3_discovery": {"appl_id": "9608089"}})),
        );
        assert_eq!(record.cell("appl_id"), "9608089");
    }

    #[test]
    fn descriptive_columns_pull_from_metadata_location() {
        let record = flatten_study(
            "HDP00006",
            &doc(json!({
                "gen3_discovery": {
                    "project_title": "Back Pain Consortium",
                    "project_number": "1U24AR076730-01",
                    "investigators_name": ["Ada Lovelace", "Grace Hopper"],
                    "study_metadata": {
                        "metadata_location": {
                            "nih_reporter_link": "https://reporter.nih.gov/project-details/9900258",
                            "clinical_trials_study_ID": "NCT00000001",
                            "data_repositories": [
                                {"repository_name": "ICPSR", "repository_study_ID": "ICPSR-1"}
                            ]
                        }
                    }
                },
                "clinicaltrials_gov": {"NCTId": "NCT00000001", "protocolSection": {"x": 1}}
            })),
        );
        assert_eq!(record.cell("study_name"), "Back Pain Consortium");
        assert_eq!(record.cell("project_num"), "1U24AR076730-01");
        assert_eq!(record.cell("investigators_name"), "['Ada Lovelace', 'Grace Hopper']");
        assert_eq!(record.cell("clinical_trials_study_ID"), "NCT00000001");
        assert_eq!(record.cell("repository_name"), "ICPSR");
        assert_eq!(record.cell("repository_study_id"), "ICPSR-1");
        assert_eq!(record.cell("clinicaltrials_gov.NCTId"), "NCT00000001");
        assert!(!record.contains("clinicaltrials_gov.protocolSection"));
    }

    #[test]
    fn study_name_doubles_single_quotes() {
        let record = flatten_study(
            "HDP00007",
            &doc(json!({"gen3_discovery": {"project_title": "Children's Pain Registry"}})),
        );
        assert_eq!(record.cell("study_name"), "Children''s Pain Registry");
    }

    #[test]
    fn flattening_is_deterministic() {
        let batch = parse_batch(
            br#"{"B": {"gen3_discovery": {"study_metadata": {"data": {"x": ""}}}}, "A": {"_guid_type": "unregistered_discovery_metadata"}}"#,
        )
        .unwrap();
        let first = flatten_batch(&batch);
        let second = flatten_batch(&batch);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first[0].hdp_id(), "A");
    }

    #[test]
    fn payload_must_be_keyed_by_guid() {
        assert!(matches!(parse_batch(b"[1, 2]"), Err(SourceError::NotKeyedByGuid)));
        assert!(matches!(parse_batch(b"{"), Err(SourceError::Parse(_))));
    }

    #[tokio::test]
    async fn local_source_reports_missing_file() {
        let source = LocalSnapshotSource::new("/nonexistent/metadata.json");
        let err = source.fetch_raw(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }
}
