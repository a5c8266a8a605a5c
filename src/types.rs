//! Core types for the Cohort Lens pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: study definitions, identifiable subject records, cohort membership,
//! anonymized observations, lag correlation results, and study reports.

use crate::criteria::{Criterion, EnrollmentWindow};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Pipeline phase, used for error context, progress and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Registration,
    CohortBuild,
    Collection,
    Anonymization,
    Analysis,
    Report,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Registration => "registration",
            Phase::CohortBuild => "cohort_build",
            Phase::Collection => "collection",
            Phase::Anonymization => "anonymization",
            Phase::Analysis => "analysis",
            Phase::Report => "report",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Study lifecycle status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    Draft,
    Collecting,
    Analyzed,
    Reported,
}

impl StudyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyStatus::Draft => "draft",
            StudyStatus::Collecting => "collecting",
            StudyStatus::Analyzed => "analyzed",
            StudyStatus::Reported => "reported",
        }
    }

    /// Status after a successful phase; never moves backwards
    pub fn advanced_to(self, target: StudyStatus) -> StudyStatus {
        self.max(target)
    }
}

impl fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic type of a study variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Continuous,
    Ordinal,
    Categorical,
}

/// Where a variable's raw values live in the clinical store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableSource {
    pub table: String,
    pub field: String,
}

impl VariableSource {
    pub fn new(table: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for VariableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.field)
    }
}

/// Plausible range for a variable's values (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// A variable declared by a study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Variable name used throughout the pipeline (e.g. "phq9")
    pub name: String,
    pub kind: VariableKind,
    pub source: VariableSource,
    /// Values outside this range are kept but flagged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_range: Option<ValueRange>,
}

/// Everything needed to register a study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDefinition {
    /// Human-readable unique code (e.g. "EVA-VOICE-PHQ9-001")
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub hypothesis: String,
    #[serde(default)]
    pub study_type: String,
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub inclusion: Vec<Criterion>,
    #[serde(default)]
    pub exclusion: Vec<Criterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_window: Option<EnrollmentWindow>,
    /// Days of data collected from each subject's enrollment; falls back to config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_window_days: Option<u32>,
    #[serde(default)]
    pub primary_outcome: String,
    #[serde(default)]
    pub target_subjects: u32,
    #[serde(default)]
    pub principal_investigator: String,
}

impl StudyDefinition {
    pub fn variable(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Record of the most recent cohort build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortBuild {
    pub build_id: Uuid,
    pub built_at: DateTime<Utc>,
    pub size: usize,
}

/// A registered study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub definition: StudyDefinition,
    pub status: StudyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort_build: Option<CohortBuild>,
}

impl Study {
    pub fn code(&self) -> &str {
        &self.definition.code
    }
}

/// Identifiable subject record from the clinical store.
///
/// Never leaves the anonymization boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject_id: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub birth_date: NaiveDate,
    /// First contact with the care program; baseline for data collection
    pub enrolled_at: DateTime<Utc>,
    /// Clinical and living-situation flags (e.g. "on_antidepressants")
    #[serde(default)]
    pub flags: BTreeSet<String>,
}

impl SubjectRecord {
    /// Age in whole years at the given date
    pub fn age_at(&self, at: NaiveDate) -> Option<u32> {
        at.years_since(self.birth_date)
    }
}

/// A single raw measurement for one subject and one variable source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub subject_id: String,
    pub source: VariableSource,
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn from_start(start: DateTime<Utc>, days: u32) -> Self {
        Self {
            start,
            end: start + Duration::days(i64::from(days)),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Snapshot of why a subject was judged eligible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilitySnapshot {
    pub evaluated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_years: Option<u32>,
    pub criteria_met: Vec<String>,
}

/// Cohort membership row, keyed by (study, subject)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMembership {
    pub study_code: String,
    pub subject_id: String,
    pub enrolled_at: DateTime<Utc>,
    pub build_id: Uuid,
    pub eligibility: EligibilitySnapshot,
}

/// One-way subject identifier scoped to a single study
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pseudonym(String);

impl Pseudonym {
    pub(crate) fn from_digest_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anonymized, time-stamped value for one pseudonym and one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub collection_id: Uuid,
    pub study_code: String,
    pub pseudonym: Pseudonym,
    pub variable: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Position in the raw source order; breaks timestamp ties
    pub sequence: u64,
    /// Value fell outside the variable's declared valid range
    #[serde(default)]
    pub out_of_range: bool,
}

/// Header for one anonymization run over a cohort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionBatch {
    pub collection_id: Uuid,
    pub study_code: String,
    pub cohort_build_id: Uuid,
    pub collected_at: DateTime<Utc>,
    pub subjects_anonymized: usize,
    pub observation_count: usize,
}

/// Correlation statistics for one tested lag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagCorrelationResult {
    pub run_id: Uuid,
    pub study_code: String,
    pub variable_x: String,
    pub variable_y: String,
    pub lag_days: u32,
    /// Pearson r; NaN when undefined (no pairs or zero variance)
    #[serde(with = "nullable_f64")]
    pub coefficient: f64,
    /// Two-sided p-value
    #[serde(with = "nullable_f64")]
    pub p_value: f64,
    /// 95% confidence interval for r (Fisher z)
    #[serde(with = "nullable_f64")]
    pub ci_lower: f64,
    #[serde(with = "nullable_f64")]
    pub ci_upper: f64,
    /// Pooled pair count across subjects
    pub sample_size: usize,
    /// Subjects that contributed at least one pair
    pub subjects: usize,
    pub significant: bool,
}

/// Known keys for analysis run metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKey {
    SubjectsCompared,
    SubjectsWithX,
    SubjectsWithY,
    PairingRule,
    ToleranceMinutes,
    SignificanceThreshold,
    MinSampleSize,
    BonferroniThreshold,
    LagsTested,
    DegenerateLags,
}

/// Typed metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataValue {
    Count(u64),
    Number(f64),
    Text(String),
    Flag(bool),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Count(n) => write!(f, "{}", n),
            MetadataValue::Number(x) => write!(f, "{}", x),
            MetadataValue::Text(s) => f.write_str(s),
            MetadataValue::Flag(b) => write!(f, "{}", b),
        }
    }
}

/// Key-value metadata attached to an analysis run: enumerated keys plus an open
/// extension bag for ad-hoc annotations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default)]
    known: BTreeMap<MetadataKey, MetadataValue>,
    #[serde(default)]
    extensions: BTreeMap<String, MetadataValue>,
}

impl RunMetadata {
    pub fn set(&mut self, key: MetadataKey, value: MetadataValue) {
        self.known.insert(key, value);
    }

    pub fn get(&self, key: MetadataKey) -> Option<&MetadataValue> {
        self.known.get(&key)
    }

    pub fn count(&self, key: MetadataKey) -> Option<u64> {
        match self.known.get(&key) {
            Some(MetadataValue::Count(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn extend_with(&mut self, key: impl Into<String>, value: MetadataValue) {
        self.extensions.insert(key.into(), value);
    }

    pub fn extension(&self, key: &str) -> Option<&MetadataValue> {
        self.extensions.get(key)
    }

    pub fn known(&self) -> impl Iterator<Item = (&MetadataKey, &MetadataValue)> {
        self.known.iter()
    }
}

/// One persisted lag-correlation analysis run. Runs are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: Uuid,
    pub study_code: String,
    pub variable_x: String,
    pub variable_y: String,
    pub max_lag_days: u32,
    pub cohort_build_id: Uuid,
    pub collection_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// One entry per lag in `0..=max_lag_days`
    pub results: Vec<LagCorrelationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_lag: Option<LagCorrelationResult>,
    #[serde(default)]
    pub metadata: RunMetadata,
}

impl AnalysisRun {
    /// Bonferroni-style threshold for the best lag of this run
    pub fn bonferroni_threshold(&self, significance_threshold: f64) -> f64 {
        significance_threshold / (f64::from(self.max_lag_days) + 1.0)
    }
}

/// Read-only aggregation of a study's state and significant findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyReport {
    pub study_code: String,
    pub study_name: String,
    pub hypothesis: String,
    pub status: StudyStatus,
    pub cohort_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort_build_id: Option<Uuid>,
    /// Best-lag findings that pass the Bonferroni-adjusted threshold
    pub significant_findings: Vec<ReportFinding>,
    /// Variable pairs analyzed (latest run per pair)
    pub analyses: Vec<AnalysisSummary>,
    pub generated_at: DateTime<Utc>,
    pub producer: String,
    pub producer_version: String,
}

/// Headline numbers for the latest run of one variable pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub run_id: Uuid,
    pub variable_x: String,
    pub variable_y: String,
    pub max_lag_days: u32,
    pub lags_significant_raw: usize,
    pub completed_at: DateTime<Utc>,
    /// Run was computed against the current cohort build
    pub current: bool,
}

/// A best-lag result surfaced in a study report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFinding {
    pub result: LagCorrelationResult,
    pub bonferroni_threshold: f64,
}

/// Serialize NaN as `null` and read `null` back as NaN
pub(crate) mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
