//! Persistent store contract
//!
//! The research core talks to storage only through [`ResearchStore`]. Raw clinical
//! records are read-only from the core's point of view; studies and cohort
//! memberships are insert-or-update by key; observations and analysis runs are
//! append-only.
//!
//! [`MemoryStore`] is an in-process implementation that can be snapshotted to JSON,
//! used by the CLI and the test suite.

use crate::types::{
    AnalysisRun, CohortMembership, CollectionBatch, Observation, RawRecord, Study, StudyStatus,
    SubjectRecord, TimeWindow, VariableSource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a store backend; treated as transient by the core
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage operations required by the research core
pub trait ResearchStore: Send + Sync {
    /// All subjects in the clinical population
    fn list_subjects(&self) -> StoreResult<Vec<SubjectRecord>>;

    /// Number of raw records a subject has for a variable source
    fn count_raw_records(&self, subject_id: &str, source: &VariableSource) -> StoreResult<usize>;

    /// Raw records for one subject and source inside a window, in source order
    fn fetch_raw_records(
        &self,
        subject_id: &str,
        source: &VariableSource,
        window: &TimeWindow,
    ) -> StoreResult<Vec<RawRecord>>;

    /// Insert a study if its code is free. Returns `false` when the code exists.
    fn insert_study(&self, study: Study) -> StoreResult<bool>;

    /// Insert or update a study by code
    fn upsert_study(&self, study: Study) -> StoreResult<()>;

    /// Set a study's status in place, leaving every other field as stored.
    /// Returns the updated study, or `None` when the code is unknown.
    fn update_study_status(
        &self,
        code: &str,
        status: StudyStatus,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<Option<Study>>;

    fn get_study(&self, code: &str) -> StoreResult<Option<Study>>;

    fn list_studies(&self) -> StoreResult<Vec<Study>>;

    fn memberships(&self, study_code: &str) -> StoreResult<Vec<CohortMembership>>;

    /// Insert or update membership rows keyed by (study, subject)
    fn upsert_memberships(&self, rows: &[CohortMembership]) -> StoreResult<()>;

    fn remove_memberships(&self, study_code: &str, subject_ids: &[String]) -> StoreResult<()>;

    /// Append an anonymized collection batch and its observations atomically
    fn append_collection(
        &self,
        batch: CollectionBatch,
        observations: Vec<Observation>,
    ) -> StoreResult<()>;

    /// Most recently appended collection batch for a study
    fn latest_collection(&self, study_code: &str) -> StoreResult<Option<CollectionBatch>>;

    /// Observations of one batch, optionally restricted to a time window
    fn observations(
        &self,
        collection_id: Uuid,
        window: Option<&TimeWindow>,
    ) -> StoreResult<Vec<Observation>>;

    fn append_analysis_run(&self, run: AnalysisRun) -> StoreResult<()>;

    /// Analysis runs for a study in append order
    fn analysis_runs(&self, study_code: &str) -> StoreResult<Vec<AnalysisRun>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryState {
    subjects: Vec<SubjectRecord>,
    raw_records: Vec<RawRecord>,
    studies: BTreeMap<String, Study>,
    memberships: BTreeMap<String, BTreeMap<String, CohortMembership>>,
    collections: Vec<CollectionBatch>,
    observations: Vec<Observation>,
    analysis_runs: Vec<AnalysisRun>,
}

/// In-memory store with JSON snapshots
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    /// Subjects whose raw fetches fail, simulating an unreachable source
    unavailable: RwLock<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store snapshot from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let state: MemoryState = serde_json::from_str(json)?;
        Ok(Self {
            state: RwLock::new(state),
            unavailable: RwLock::default(),
        })
    }

    /// Serialize the full store to JSON
    pub fn to_json(&self) -> StoreResult<String> {
        let state = self.read()?;
        serde_json::to_string_pretty(&*state).map_err(|e| StoreError(e.to_string()))
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| StoreError(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json).map_err(|e| StoreError(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let json = self.to_json()?;
        fs::write(path, json).map_err(|e| StoreError(format!("{}: {}", path.display(), e)))
    }

    pub fn add_subject(&self, subject: SubjectRecord) -> StoreResult<()> {
        let mut state = self.write()?;
        state.subjects.retain(|s| s.subject_id != subject.subject_id);
        state.subjects.push(subject);
        Ok(())
    }

    pub fn add_raw_record(&self, record: RawRecord) -> StoreResult<()> {
        self.write()?.raw_records.push(record);
        Ok(())
    }

    /// Make raw fetches for a subject fail until [`MemoryStore::mark_available`]
    pub fn mark_unavailable(&self, subject_id: &str) {
        if let Ok(mut unavailable) = self.unavailable.write() {
            unavailable.insert(subject_id.to_string());
        }
    }

    pub fn mark_available(&self, subject_id: &str) {
        if let Ok(mut unavailable) = self.unavailable.write() {
            unavailable.remove(subject_id);
        }
    }

    pub fn subject_count(&self) -> usize {
        self.read().map(|s| s.subjects.len()).unwrap_or(0)
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StoreError("store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StoreError("store lock poisoned".to_string()))
    }

    fn is_unavailable(&self, subject_id: &str) -> bool {
        self.unavailable
            .read()
            .map(|u| u.contains(subject_id))
            .unwrap_or(true)
    }
}

impl ResearchStore for MemoryStore {
    fn list_subjects(&self) -> StoreResult<Vec<SubjectRecord>> {
        Ok(self.read()?.subjects.clone())
    }

    fn count_raw_records(&self, subject_id: &str, source: &VariableSource) -> StoreResult<usize> {
        Ok(self
            .read()?
            .raw_records
            .iter()
            .filter(|r| r.subject_id == subject_id && &r.source == source)
            .count())
    }

    fn fetch_raw_records(
        &self,
        subject_id: &str,
        source: &VariableSource,
        window: &TimeWindow,
    ) -> StoreResult<Vec<RawRecord>> {
        if self.is_unavailable(subject_id) {
            return Err(StoreError(format!(
                "raw source {} unreachable for subject",
                source
            )));
        }
        Ok(self
            .read()?
            .raw_records
            .iter()
            .filter(|r| {
                r.subject_id == subject_id && &r.source == source && window.contains(r.recorded_at)
            })
            .cloned()
            .collect())
    }

    fn insert_study(&self, study: Study) -> StoreResult<bool> {
        let mut state = self.write()?;
        if state.studies.contains_key(study.code()) {
            return Ok(false);
        }
        state.studies.insert(study.code().to_string(), study);
        Ok(true)
    }

    fn upsert_study(&self, study: Study) -> StoreResult<()> {
        self.write()?
            .studies
            .insert(study.code().to_string(), study);
        Ok(())
    }

    fn update_study_status(
        &self,
        code: &str,
        status: StudyStatus,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<Option<Study>> {
        let mut state = self.write()?;
        Ok(state.studies.get_mut(code).map(|study| {
            study.status = status;
            study.updated_at = updated_at;
            study.clone()
        }))
    }

    fn get_study(&self, code: &str) -> StoreResult<Option<Study>> {
        Ok(self.read()?.studies.get(code).cloned())
    }

    fn list_studies(&self) -> StoreResult<Vec<Study>> {
        let state = self.read()?;
        let mut studies: Vec<Study> = state.studies.values().cloned().collect();
        studies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.code().cmp(b.code())));
        Ok(studies)
    }

    fn memberships(&self, study_code: &str) -> StoreResult<Vec<CohortMembership>> {
        Ok(self
            .read()?
            .memberships
            .get(study_code)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert_memberships(&self, rows: &[CohortMembership]) -> StoreResult<()> {
        let mut state = self.write()?;
        for row in rows {
            state
                .memberships
                .entry(row.study_code.clone())
                .or_default()
                .insert(row.subject_id.clone(), row.clone());
        }
        Ok(())
    }

    fn remove_memberships(&self, study_code: &str, subject_ids: &[String]) -> StoreResult<()> {
        let mut state = self.write()?;
        if let Some(rows) = state.memberships.get_mut(study_code) {
            for subject_id in subject_ids {
                rows.remove(subject_id);
            }
        }
        Ok(())
    }

    fn append_collection(
        &self,
        batch: CollectionBatch,
        observations: Vec<Observation>,
    ) -> StoreResult<()> {
        let mut state = self.write()?;
        state.collections.push(batch);
        state.observations.extend(observations);
        Ok(())
    }

    fn latest_collection(&self, study_code: &str) -> StoreResult<Option<CollectionBatch>> {
        Ok(self
            .read()?
            .collections
            .iter()
            .rev()
            .find(|b| b.study_code == study_code)
            .cloned())
    }

    fn observations(
        &self,
        collection_id: Uuid,
        window: Option<&TimeWindow>,
    ) -> StoreResult<Vec<Observation>> {
        Ok(self
            .read()?
            .observations
            .iter()
            .filter(|o| {
                o.collection_id == collection_id && window.map_or(true, |w| w.contains(o.timestamp))
            })
            .cloned()
            .collect())
    }

    fn append_analysis_run(&self, run: AnalysisRun) -> StoreResult<()> {
        self.write()?.analysis_runs.push(run);
        Ok(())
    }

    fn analysis_runs(&self, study_code: &str) -> StoreResult<Vec<AnalysisRun>> {
        Ok(self
            .read()?
            .analysis_runs
            .iter()
            .filter(|r| r.study_code == study_code)
            .cloned()
            .collect())
    }
}
