//! Core record model and value normalization for the progress tracker.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "hpt-core";

pub const HDP_ID: &str = "hdp_id";
pub const APPL_ID: &str = "appl_id";
pub const PROJECT_NUM: &str = "project_num";
pub const IS_REGISTERED: &str = "is_registered";
pub const OVERALL_PERCENT_COMPLETE: &str = "overall_percent_complete";
pub const OVERALL_NUM_COMPLETE: &str = "overall_num_complete";
pub const LAST_CEDAR_UPDATE: &str = "last_cedar_update";
pub const DATE_LAST_MDS_UPDATE: &str = "date_last_mds_update";

/// Prefix for form-tracked metadata columns.
pub const CEDAR_PREFIX: &str = "cedar_study_metadata";
/// Prefix for free-form study metadata columns.
pub const STUDY_METADATA_PREFIX: &str = "study_metadata";

/// Timestamp format used for every run-level timestamp written to the table.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single cell of a flattened study record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    #[default]
    Empty,
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Converts a raw JSON value from the metadata service into a cell.
    ///
    /// `null`, empty arrays and objects whose values are all falsy become
    /// [`FieldValue::Empty`]. Remaining arrays and objects are rendered as
    /// single-quoted pseudo-JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Empty,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => Self::Number(n.clone()),
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(items) if items.is_empty() => Self::Empty,
            JsonValue::Object(map) if map.values().all(is_falsy) => Self::Empty,
            other => Self::Text(render_pseudo_json(other)),
        }
    }

    /// Text form written to the destination table.
    pub fn to_cell(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::Empty => String::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cell())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

/// The single definition of "not filled in" used by all scoring.
///
/// Empty means the empty string, the placeholder string `"0"`, or a missing
/// value. Booleans and numbers (including numeric zero) are always present.
pub fn is_empty(value: &FieldValue) -> bool {
    match value {
        FieldValue::Empty => true,
        FieldValue::Text(s) => s.is_empty() || s == "0",
        FieldValue::Bool(_) | FieldValue::Number(_) => false,
    }
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

/// Renders JSON with single-quoted strings; inner single quotes are doubled.
pub fn render_pseudo_json(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => quote_single(s),
        JsonValue::Array(items) => {
            let inner = items.iter().map(render_pseudo_json).collect::<Vec<_>>();
            format!("[{}]", inner.join(", "))
        }
        JsonValue::Object(map) => {
            let inner = map
                .iter()
                .map(|(k, v)| format!("{}: {}", quote_single(k), render_pseudo_json(v)))
                .collect::<Vec<_>>();
            format!("{{{}}}", inner.join(", "))
        }
        other => other.to_string(),
    }
}

fn quote_single(s: &str) -> String {
    let escaped = serde_json::to_string(s).unwrap_or_default();
    let body = escaped
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or_default();
    format!("'{}'", body.replace('\'', "''"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Registered,
    NotRegistered,
}

impl RegistrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "is registered",
            Self::NotRegistered => "not registered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveState {
    Live,
    Archived,
}

impl ArchiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Archived => "archived",
        }
    }
}

/// One flattened study: column name to cell, ordered by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl StudyRecord {
    pub fn new(hdp_id: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(HDP_ID.to_string(), FieldValue::Text(hdp_id.into()));
        Self { fields }
    }

    pub fn hdp_id(&self) -> &str {
        self.fields
            .get(HDP_ID)
            .and_then(FieldValue::as_str)
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Cell text for `key`, empty when the column is absent.
    pub fn cell(&self, key: &str) -> String {
        self.fields.get(key).map(FieldValue::to_cell).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Fields whose name starts with `prefix`, in record order.
    pub fn with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a FieldValue)> + 'a {
        self.fields
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Per-record completeness columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFields {
    pub overall_percent_complete: f64,
    pub overall_num_complete: u32,
    pub last_cedar_update: String,
    pub date_last_mds_update: DateTime<Utc>,
}

impl ScoreFields {
    pub fn apply_to(&self, record: &mut StudyRecord) {
        record.set(
            OVERALL_PERCENT_COMPLETE,
            format!("{:.1}", self.overall_percent_complete),
        );
        record.set(
            OVERALL_NUM_COMPLETE,
            FieldValue::from(i64::from(self.overall_num_complete)),
        );
        record.set(LAST_CEDAR_UPDATE, self.last_cedar_update.clone());
        record.set(
            DATE_LAST_MDS_UPDATE,
            self.date_last_mds_update.format(TIMESTAMP_FORMAT).to_string(),
        );
    }
}
