//! Cohort Builder
//!
//! Registers study definitions and materializes cohort membership by evaluating
//! each study's criteria against the subject population.

use crate::control::RunContext;
use crate::criteria::{self, Eligibility, SubjectProfile};
use crate::error::ResearchError;
use crate::store::ResearchStore;
use crate::types::{
    CohortBuild, CohortMembership, EligibilitySnapshot, Phase, Study, StudyDefinition,
    StudyStatus, SubjectRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Result of a cohort (re)build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortBuildOutcome {
    pub study_code: String,
    pub build_id: Uuid,
    pub built_at: DateTime<Utc>,
    /// Cohort size after the build
    pub enrolled: usize,
    /// Subjects that joined since the previous build
    pub added: usize,
    /// Subjects that no longer qualify and were removed
    pub removed: usize,
}

impl CohortBuildOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Study registration and cohort materialization over a store
pub struct CohortBuilder<'a, S: ResearchStore> {
    store: &'a S,
}

impl<'a, S: ResearchStore> CohortBuilder<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Validate and persist a new study in draft status
    pub fn register_study(&self, definition: StudyDefinition) -> Result<Study, ResearchError> {
        validate_definition(&definition)?;

        let now = Utc::now();
        let study = Study {
            definition,
            status: StudyStatus::Draft,
            created_at: now,
            updated_at: now,
            cohort_build: None,
        };

        let inserted = self
            .store
            .insert_study(study.clone())
            .map_err(|e| ResearchError::store(Phase::Registration, e.to_string()))?;
        if !inserted {
            return Err(ResearchError::DuplicateStudy(study.code().to_string()));
        }

        info!(study = %study.code(), variables = study.definition.variables.len(), "study registered");
        Ok(study)
    }

    /// Recompute cohort membership from current data and move the study to collecting.
    ///
    /// Re-running is safe: the outcome carries the membership delta. A build with
    /// zero qualifying subjects fails and leaves the study and its rows untouched.
    pub fn build_cohort(
        &self,
        study_code: &str,
        ctx: &RunContext,
    ) -> Result<CohortBuildOutcome, ResearchError> {
        let mut study = self.study(study_code)?;
        let subjects = self
            .store
            .list_subjects()
            .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?;

        let now = Utc::now();
        let build_id = Uuid::new_v4();
        let total = subjects.len();
        let mut rows = Vec::new();

        for (processed, subject) in subjects.iter().enumerate() {
            ctx.checkpoint(Phase::CohortBuild)?;
            let profile = self.profile(&study.definition, subject, now)?;
            let eligibility = criteria::evaluate(&study.definition, &profile);
            if eligibility.eligible {
                rows.push(CohortMembership {
                    study_code: study_code.to_string(),
                    subject_id: subject.subject_id.clone(),
                    enrolled_at: subject.enrolled_at,
                    build_id,
                    eligibility: EligibilitySnapshot {
                        evaluated_at: now,
                        age_years: profile.age_years(),
                        criteria_met: eligibility.criteria_met,
                    },
                });
            } else {
                debug!(study = %study_code, subject = %subject.subject_id, reasons = ?eligibility.reasons, "subject not eligible");
            }
            ctx.report(Phase::CohortBuild, processed + 1, total);
        }

        if rows.is_empty() {
            return Err(ResearchError::EmptyCohort(study_code.to_string()));
        }

        let previous: BTreeSet<String> = self
            .store
            .memberships(study_code)
            .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?
            .into_iter()
            .map(|m| m.subject_id)
            .collect();
        let current: BTreeSet<String> = rows.iter().map(|m| m.subject_id.clone()).collect();

        let added = current.difference(&previous).count();
        let dropped: Vec<String> = previous.difference(&current).cloned().collect();

        ctx.checkpoint(Phase::CohortBuild)?;
        self.store
            .upsert_memberships(&rows)
            .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?;
        if !dropped.is_empty() {
            self.store
                .remove_memberships(study_code, &dropped)
                .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?;
        }

        let previous_status = study.status;
        study.status = study.status.advanced_to(StudyStatus::Collecting);
        study.updated_at = now;
        study.cohort_build = Some(CohortBuild {
            build_id,
            built_at: now,
            size: rows.len(),
        });
        self.store
            .upsert_study(study)
            .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?;

        if previous_status == StudyStatus::Draft {
            info!(study = %study_code, from = %previous_status, to = %StudyStatus::Collecting, "study status changed");
        }
        info!(
            study = %study_code,
            enrolled = rows.len(),
            added,
            removed = dropped.len(),
            "cohort built"
        );

        Ok(CohortBuildOutcome {
            study_code: study_code.to_string(),
            build_id,
            built_at: now,
            enrolled: rows.len(),
            added,
            removed: dropped.len(),
        })
    }

    /// Evaluate one subject against a study without touching membership
    pub fn validate_subject(
        &self,
        study_code: &str,
        subject_id: &str,
    ) -> Result<Eligibility, ResearchError> {
        let study = self.study(study_code)?;
        let subjects = self
            .store
            .list_subjects()
            .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?;
        let subject = subjects
            .iter()
            .find(|s| s.subject_id == subject_id)
            .ok_or_else(|| {
                ResearchError::InvalidDefinition(format!("unknown subject '{}'", subject_id))
            })?;

        let profile = self.profile(&study.definition, subject, Utc::now())?;
        Ok(criteria::evaluate(&study.definition, &profile))
    }

    /// Count qualifying subjects without persisting anything
    pub fn count_eligible(&self, study_code: &str) -> Result<usize, ResearchError> {
        Ok(self.select_subjects(study_code)?.len())
    }

    /// Ids of qualifying subjects, in population order
    pub fn select_subjects(&self, study_code: &str) -> Result<Vec<String>, ResearchError> {
        let study = self.study(study_code)?;
        let subjects = self
            .store
            .list_subjects()
            .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?;
        let now = Utc::now();

        let mut selected = Vec::new();
        for subject in &subjects {
            let profile = self.profile(&study.definition, subject, now)?;
            if criteria::evaluate(&study.definition, &profile).eligible {
                selected.push(subject.subject_id.clone());
            }
        }
        Ok(selected)
    }

    fn study(&self, study_code: &str) -> Result<Study, ResearchError> {
        self.store
            .get_study(study_code)
            .map_err(|e| ResearchError::store(Phase::CohortBuild, e.to_string()))?
            .ok_or_else(|| ResearchError::StudyNotFound(study_code.to_string()))
    }

    /// Gather what the criteria need: record counts only for referenced variables
    fn profile<'s>(
        &self,
        definition: &StudyDefinition,
        subject: &'s SubjectRecord,
        now: DateTime<Utc>,
    ) -> Result<SubjectProfile<'s>, ResearchError> {
        let referenced: BTreeSet<&str> = definition
            .inclusion
            .iter()
            .chain(definition.exclusion.iter())
            .filter_map(|c| c.variable())
            .collect();

        let mut record_counts = BTreeMap::new();
        for name in referenced {
            if let Some(variable) = definition.variable(name) {
                let count = self
                    .store
                    .count_raw_records(&subject.subject_id, &variable.source)
                    .map_err(|e| ResearchError::SubjectFetch {
                        phase: Phase::CohortBuild,
                        subject: subject.subject_id.clone(),
                        detail: e.to_string(),
                    })?;
                record_counts.insert(name.to_string(), count);
            }
        }

        Ok(SubjectProfile {
            subject,
            record_counts,
            evaluated_on: now.date_naive(),
        })
    }
}

/// Structural checks on a definition before it is persisted
pub fn validate_definition(definition: &StudyDefinition) -> Result<(), ResearchError> {
    if definition.code.trim().is_empty() {
        return Err(ResearchError::InvalidDefinition(
            "study code must not be empty".to_string(),
        ));
    }
    if definition.variables.is_empty() {
        return Err(ResearchError::InvalidDefinition(format!(
            "study {} declares no variables",
            definition.code
        )));
    }

    let mut names = BTreeSet::new();
    for variable in &definition.variables {
        if variable.name.trim().is_empty() {
            return Err(ResearchError::InvalidDefinition(
                "variable name must not be empty".to_string(),
            ));
        }
        if !names.insert(variable.name.as_str()) {
            return Err(ResearchError::InvalidDefinition(format!(
                "variable '{}' declared twice",
                variable.name
            )));
        }
        if let Some(range) = &variable.valid_range {
            if !(range.min <= range.max) {
                return Err(ResearchError::InvalidDefinition(format!(
                    "valid range for '{}' is empty",
                    variable.name
                )));
            }
        }
    }
    if definition.collection_window_days == Some(0) {
        return Err(ResearchError::InvalidDefinition(
            "collection window must be at least one day".to_string(),
        ));
    }

    criteria::validate(definition)
}
