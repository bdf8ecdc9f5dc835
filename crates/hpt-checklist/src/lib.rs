//! Checklist sections, section scoring and per-record completeness.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use hpt_core::{is_empty, FieldValue, ScoreFields, StudyRecord, CEDAR_PREFIX};
use serde::Serialize;
use tracing::debug;

pub const CRATE_NAME: &str = "hpt-checklist";

/// Field that records the optional extra study website.
pub const OTHER_STUDY_WEBSITES: &str = "cedar_study_metadata.metadata_location.other_study_websites";

/// Metadata-location fields that exist in the source but are not on the form.
pub const METADATA_LOCATION_EXCLUSIONS: &[&str] = &[
    "cedar_study_metadata.metadata_location.data_repositories",
    "cedar_study_metadata.metadata_location.nih_reporter_link",
    "cedar_study_metadata.metadata_location.nih_application_id",
    "cedar_study_metadata.metadata_location.clinical_trials_study_ID",
    "cedar_study_metadata.metadata_location.cedar_study_level_metadata_template_instance_ID",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SectionRule {
    /// Every remaining field under the prefix is one checklist item.
    Fields,
    /// Two website slots, one always filled by autopopulation.
    WebsitesBaseline,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Section {
    pub name: &'static str,
    pub prefix: &'static str,
    pub exclusions: &'static [&'static str],
    pub rule: SectionRule,
}

impl Section {
    const fn fields(name: &'static str, prefix: &'static str) -> Self {
        Self {
            name,
            prefix,
            exclusions: &[],
            rule: SectionRule::Fields,
        }
    }
}

/// Scored sections, in aggregation order.
pub const SECTIONS: [Section; 9] = [
    Section::fields("minimal_info", "cedar_study_metadata.minimal_info."),
    Section {
        name: "metadata_location",
        prefix: "cedar_study_metadata.metadata_location.",
        exclusions: METADATA_LOCATION_EXCLUSIONS,
        rule: SectionRule::WebsitesBaseline,
    },
    Section::fields("data_availability", "cedar_study_metadata.data_availability."),
    Section::fields(
        "study_translational_focus",
        "cedar_study_metadata.study_translational_focus.",
    ),
    Section::fields("study_type", "cedar_study_metadata.study_type."),
    Section::fields(
        "human_treatment_applicability",
        "cedar_study_metadata.human_treatment_applicability.",
    ),
    Section::fields(
        "human_condition_applicability",
        "cedar_study_metadata.human_condition_applicability.",
    ),
    Section::fields(
        "human_subject_applicability",
        "cedar_study_metadata.human_subject_applicability.",
    ),
    Section::fields("data", "cedar_study_metadata.data."),
];

/// Form-written groups that are not scored but still live under the cedar prefix.
pub const UNSCORED_CEDAR_GROUPS: &[&str] = &["time_of_registration", "time_of_last_cedar_updated"];

/// Whether a `study_metadata` group belongs under [`CEDAR_PREFIX`].
pub fn is_cedar_group(group: &str) -> bool {
    SECTIONS.iter().any(|s| s.name == group) || UNSCORED_CEDAR_GROUPS.contains(&group)
}

pub fn section(name: &str) -> Option<&'static Section> {
    SECTIONS.iter().find(|s| s.name == name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SectionScore {
    pub total: u32,
    pub completed: u32,
    pub missing: Vec<String>,
}

/// Counts the fields of `record` under `prefix`, ignoring `exclusions`.
pub fn score_section(record: &StudyRecord, prefix: &str, exclusions: &[&str]) -> SectionScore {
    let mut score = SectionScore::default();
    for (name, value) in record.with_prefix(prefix) {
        if exclusions.contains(&name) {
            continue;
        }
        score.total += 1;
        if is_empty(value) {
            score.missing.push(name.to_string());
        } else {
            score.completed += 1;
        }
    }
    score
}

/// Two slots: complete when the website field has a value, else the baseline one.
pub fn score_websites(record: &StudyRecord) -> (u32, u32) {
    let filled = record
        .get(OTHER_STUDY_WEBSITES)
        .map(|v| !is_empty(v))
        .unwrap_or(false);
    (2, if filled { 2 } else { 1 })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionReport {
    pub section: &'static str,
    pub total: u32,
    pub completed: u32,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreCard {
    pub hdp_id: String,
    pub sections: Vec<SectionReport>,
    pub overall_total: u32,
    pub overall_complete: u32,
    pub overall_percent: f64,
    pub last_cedar_update: String,
}

impl ScoreCard {
    pub fn fields(&self, synced_at: DateTime<Utc>) -> ScoreFields {
        ScoreFields {
            overall_percent_complete: self.overall_percent,
            overall_num_complete: self.overall_complete,
            last_cedar_update: self.last_cedar_update.clone(),
            date_last_mds_update: synced_at,
        }
    }

    pub fn missing_fields(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|s| s.missing.iter().map(String::as_str))
    }
}

/// `round(100 * complete / total, 1)`; a record with no checklist fields scores 0.
pub fn percent_complete(complete: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = 100.0 * f64::from(complete) / f64::from(total);
    (pct * 10.0).round() / 10.0
}

pub fn score_record(record: &StudyRecord) -> ScoreCard {
    let mut sections = Vec::with_capacity(SECTIONS.len());
    let mut overall_total = 0;
    let mut overall_complete = 0;

    for section in &SECTIONS {
        let scored = score_section(record, section.prefix, section.exclusions);
        let (total, completed) = match section.rule {
            SectionRule::Fields => (scored.total, scored.completed),
            SectionRule::WebsitesBaseline => score_websites(record),
        };
        overall_total += total;
        overall_complete += completed;
        sections.push(SectionReport {
            section: section.name,
            total,
            completed,
            missing: scored.missing,
        });
    }

    let overall_percent = percent_complete(overall_complete, overall_total);
    debug!(
        hdp_id = record.hdp_id(),
        overall_total, overall_complete, overall_percent, "scored record"
    );

    ScoreCard {
        hdp_id: record.hdp_id().to_string(),
        sections,
        overall_total,
        overall_complete,
        overall_percent,
        last_cedar_update: last_cedar_update(record),
    }
}

/// Gives every record the checklist columns any record in the batch has; absent ones are empty.
pub fn align_checklist_columns(records: &mut [StudyRecord]) {
    let prefix = format!("{CEDAR_PREFIX}.");
    let union = records
        .iter()
        .flat_map(|r| r.with_prefix(&prefix).map(|(k, _)| k.to_string()))
        .collect::<BTreeSet<_>>();
    for record in records.iter_mut() {
        for key in &union {
            if !record.contains(key) {
                record.set(key.clone(), FieldValue::Empty);
            }
        }
    }
}

/// Scores a whole batch against the batch-wide checklist column set.
pub fn score_batch(records: &mut [StudyRecord]) -> Vec<ScoreCard> {
    align_checklist_columns(records);
    records.iter().map(score_record).collect()
}

fn last_cedar_update(record: &StudyRecord) -> String {
    let nested = format!("{CEDAR_PREFIX}.time_of_last_cedar_updated");
    ["time_of_last_cedar_updated", nested.as_str()]
        .iter()
        .filter_map(|key| record.get(key))
        .find(|v| !matches!(v, FieldValue::Empty))
        .map(FieldValue::to_cell)
        .unwrap_or_default()
}
