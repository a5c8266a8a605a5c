//! Research Engine
//!
//! Orchestrates a study through its lifecycle:
//! registration → cohort build → collection/anonymization → analysis → report.
//!
//! The study status (`draft → collecting → analyzed → reported`) only moves
//! forward, and each phase checks it before running. Out-of-order calls fail with
//! [`ResearchError::PhaseOrder`] instead of relying on caller discipline.
//!
//! The engine holds no per-study state in memory beyond a cache of generated
//! reports, so phases for different studies may run concurrently from multiple
//! threads.

use crate::anonymize::{AnonymizationSummary, Anonymizer, SkippedSubject};
use crate::catalog::StudyTemplate;
use crate::cohort::{CohortBuildOutcome, CohortBuilder};
use crate::config::{validate_max_lag, AnalysisOptions, ResearchConfig};
use crate::control::RunContext;
use crate::criteria::Eligibility;
use crate::error::ResearchError;
use crate::longitudinal::{self, ChangePoint, LagRequest, TrendAnalysis};
use crate::report;
use crate::store::ResearchStore;
use crate::types::{
    AnalysisRun, CollectionBatch, LagCorrelationResult, MetadataKey, MetadataValue, Observation,
    Phase, RunMetadata, Study, StudyDefinition, StudyReport, StudyStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of registering a study table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRegistration {
    pub registered: Vec<String>,
    /// Codes that were already registered and left untouched
    pub existing: Vec<String>,
}

/// Counts returned by [`ResearchEngine::collect_data_for_cohort`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub study_code: String,
    /// Present when this call had to build the cohort first
    pub cohort_build: Option<CohortBuildOutcome>,
    pub enrolled: usize,
    pub anonymized: usize,
    pub skipped: Vec<SkippedSubject>,
    pub collection_id: Uuid,
    pub observations: usize,
    pub out_of_range: usize,
}

impl CollectionSummary {
    fn new(study_code: &str, built: Option<CohortBuildOutcome>, run: AnonymizationSummary) -> Self {
        Self {
            study_code: study_code.to_string(),
            cohort_build: built,
            enrolled: run.enrolled,
            anonymized: run.anonymized,
            skipped: run.skipped,
            collection_id: run.collection_id,
            observations: run.observations,
            out_of_range: run.out_of_range,
        }
    }
}

/// Research pipeline orchestrator over a store
pub struct ResearchEngine<S: ResearchStore> {
    store: S,
    config: ResearchConfig,
    reports: Mutex<HashMap<String, StudyReport>>,
}

impl<S: ResearchStore> ResearchEngine<S> {
    /// Create an engine over a store with a validated configuration
    pub fn new(store: S, config: ResearchConfig) -> Result<Self, ResearchError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            reports: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Consume the engine and hand back its store
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn register_study(&self, definition: StudyDefinition) -> Result<Study, ResearchError> {
        CohortBuilder::new(&self.store).register_study(definition)
    }

    /// Register every template in `templates`, leaving already-registered codes alone.
    ///
    /// # Example
    /// ```ignore
    /// let outcome = engine.create_preconfigured_studies(PRECONFIGURED_STUDIES)?;
    /// println!("registered {:?}", outcome.registered);
    /// ```
    pub fn create_preconfigured_studies(
        &self,
        templates: &[StudyTemplate],
    ) -> Result<CatalogRegistration, ResearchError> {
        let mut outcome = CatalogRegistration::default();
        for template in templates {
            match self.register_study(template.to_definition()) {
                Ok(_) => outcome.registered.push(template.code.to_string()),
                Err(ResearchError::DuplicateStudy(code)) => {
                    debug!(study = %code, "preconfigured study already registered");
                    outcome.existing.push(code);
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            registered = outcome.registered.len(),
            existing = outcome.existing.len(),
            "preconfigured studies registered"
        );
        Ok(outcome)
    }

    /// (Re)build a study's cohort. Invalidates any cached report for the study.
    pub fn build_cohort(
        &self,
        study_code: &str,
        ctx: &RunContext,
    ) -> Result<CohortBuildOutcome, ResearchError> {
        let outcome = CohortBuilder::new(&self.store).build_cohort(study_code, ctx)?;
        self.invalidate_report(study_code);
        Ok(outcome)
    }

    pub fn validate_subject(
        &self,
        study_code: &str,
        subject_id: &str,
    ) -> Result<Eligibility, ResearchError> {
        CohortBuilder::new(&self.store).validate_subject(study_code, subject_id)
    }

    pub fn count_eligible(&self, study_code: &str) -> Result<usize, ResearchError> {
        CohortBuilder::new(&self.store).count_eligible(study_code)
    }

    /// Anonymize the current cohort into a new collection batch. Status is unchanged.
    pub fn anonymize_cohort(
        &self,
        study_code: &str,
        ctx: &RunContext,
    ) -> Result<AnonymizationSummary, ResearchError> {
        Anonymizer::new(&self.store, &self.config).anonymize_cohort(study_code, ctx)
    }

    /// Build the cohort if it has never been built, then anonymize it.
    ///
    /// # Returns
    /// Enrolled, anonymized and skipped subject counts for the new collection
    pub fn collect_data_for_cohort(
        &self,
        study_code: &str,
        ctx: &RunContext,
    ) -> Result<CollectionSummary, ResearchError> {
        let study = self.study(study_code, Phase::Collection)?;
        let built = match study.cohort_build {
            Some(_) => None,
            None => Some(self.build_cohort(study_code, ctx)?),
        };

        let run = self.anonymize_cohort(study_code, ctx)?;
        Ok(CollectionSummary::new(study_code, built, run))
    }

    /// Sweep lags `0..=max_lag_days` between two declared variables over the latest
    /// collection and persist the results as a new run.
    ///
    /// # Arguments
    /// * `variable_x` - Predictor, shifted forward by each lag
    /// * `variable_y` - Outcome
    /// * `options` - Per-call overrides of the configured analysis settings
    ///
    /// # Example
    /// ```ignore
    /// let run = engine.run_lag_correlation_analysis(
    ///     "EVA-VOICE-PHQ9-001",
    ///     "voice_pitch_mean",
    ///     "phq9",
    ///     14,
    ///     &AnalysisOptions::default(),
    ///     &RunContext::new(),
    /// )?;
    /// ```
    pub fn run_lag_correlation_analysis(
        &self,
        study_code: &str,
        variable_x: &str,
        variable_y: &str,
        max_lag_days: u32,
        options: &AnalysisOptions,
        ctx: &RunContext,
    ) -> Result<AnalysisRun, ResearchError> {
        validate_max_lag(max_lag_days)?;
        let settings = self.config.analysis_settings(options)?;
        let mut study = self.study(study_code, Phase::Analysis)?;

        for variable in [variable_x, variable_y] {
            if study.definition.variable(variable).is_none() {
                return Err(ResearchError::InvalidDefinition(format!(
                    "study {} does not declare variable '{}'",
                    study_code, variable
                )));
            }
        }

        let batch = self.current_collection(&study, Phase::Analysis)?;
        let observations = self.observations(&batch, Phase::Analysis)?;

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(
            study = %study_code,
            run = %run_id,
            x = %variable_x,
            y = %variable_y,
            max_lag_days,
            "lag analysis started"
        );

        let request = LagRequest {
            run_id,
            study_code,
            variable_x,
            variable_y,
            max_lag_days,
        };
        let sweep = longitudinal::run_lag_analysis(&observations, &request, &settings, ctx)?;

        let mut metadata = RunMetadata::default();
        metadata.set(
            MetadataKey::SubjectsCompared,
            MetadataValue::Count(sweep.subjects_compared as u64),
        );
        metadata.set(
            MetadataKey::SubjectsWithX,
            MetadataValue::Count(sweep.subjects_with_x as u64),
        );
        metadata.set(
            MetadataKey::SubjectsWithY,
            MetadataValue::Count(sweep.subjects_with_y as u64),
        );
        metadata.set(
            MetadataKey::PairingRule,
            MetadataValue::Text(settings.pairing_rule.as_str().to_string()),
        );
        metadata.set(
            MetadataKey::ToleranceMinutes,
            MetadataValue::Count(settings.match_tolerance_minutes.unsigned_abs()),
        );
        metadata.set(
            MetadataKey::SignificanceThreshold,
            MetadataValue::Number(settings.significance_threshold),
        );
        metadata.set(
            MetadataKey::MinSampleSize,
            MetadataValue::Count(settings.min_sample_size as u64),
        );
        metadata.set(
            MetadataKey::LagsTested,
            MetadataValue::Count(sweep.results.len() as u64),
        );
        metadata.set(
            MetadataKey::DegenerateLags,
            MetadataValue::Count(sweep.degenerate_lags as u64),
        );

        let mut run = AnalysisRun {
            run_id,
            study_code: study_code.to_string(),
            variable_x: variable_x.to_string(),
            variable_y: variable_y.to_string(),
            max_lag_days,
            cohort_build_id: batch.cohort_build_id,
            collection_id: batch.collection_id,
            started_at,
            completed_at: Utc::now(),
            results: sweep.results,
            best_lag: sweep.best_lag,
            metadata,
        };
        let bonferroni = run.bonferroni_threshold(settings.significance_threshold);
        run.metadata.set(
            MetadataKey::BonferroniThreshold,
            MetadataValue::Number(bonferroni),
        );

        // Nothing is persisted for a run abandoned before this point
        ctx.checkpoint(Phase::Analysis)?;
        self.store
            .append_analysis_run(run.clone())
            .map_err(|e| ResearchError::store(Phase::Analysis, e.to_string()))?;

        self.advance(&mut study, StudyStatus::Analyzed, Phase::Analysis)?;
        self.invalidate_report(study_code);

        info!(
            study = %study_code,
            run = %run_id,
            significant_lags = run.results.iter().filter(|r| r.significant).count(),
            best_lag = ?run.best_lag.as_ref().map(|b| b.lag_days),
            "lag analysis complete"
        );
        Ok(run)
    }

    /// Compose the study report from the latest run of each variable pair and mark
    /// the study reported.
    pub fn generate_study_report(&self, study_code: &str) -> Result<StudyReport, ResearchError> {
        let mut study = self.study(study_code, Phase::Report)?;
        if study.status < StudyStatus::Analyzed {
            return Err(ResearchError::PhaseOrder {
                study: study_code.to_string(),
                phase: Phase::Report,
                status: study.status.to_string(),
            });
        }

        if let Some(cached) = self.cached_report(study_code) {
            debug!(study = %study_code, "report served from cache");
            return Ok(cached);
        }

        let runs = self.runs(study_code, Phase::Report)?;
        let cohort_size = self
            .store
            .memberships(study_code)
            .map_err(|e| ResearchError::store(Phase::Report, e.to_string()))?
            .len();

        // The report carries the status it leaves the study in
        let mut reported = study.clone();
        reported.status = study.status.advanced_to(StudyStatus::Reported);
        let report = report::compose_report(
            &reported,
            cohort_size,
            &runs,
            self.config.significance_threshold,
            Utc::now(),
        );
        self.advance(&mut study, StudyStatus::Reported, Phase::Report)?;

        if let Ok(mut cache) = self.reports.lock() {
            cache.insert(study_code.to_string(), report.clone());
        }
        info!(
            study = %study_code,
            findings = report.significant_findings.len(),
            analyses = report.analyses.len(),
            "study report generated"
        );
        Ok(report)
    }

    /// Per-lag results significant at the raw threshold, latest run per pair
    pub fn get_significant_correlations(
        &self,
        study_code: &str,
    ) -> Result<Vec<LagCorrelationResult>, ResearchError> {
        self.study(study_code, Phase::Report)?;
        let runs = self.runs(study_code, Phase::Report)?;
        Ok(report::significant_results(&runs))
    }

    pub fn get_all_studies(&self) -> Result<Vec<Study>, ResearchError> {
        self.store
            .list_studies()
            .map_err(|e| ResearchError::store(Phase::Report, e.to_string()))
    }

    pub fn get_study(&self, study_code: &str) -> Result<Study, ResearchError> {
        self.study(study_code, Phase::Report)
    }

    /// All persisted analysis runs for a study, oldest first
    pub fn analysis_runs(&self, study_code: &str) -> Result<Vec<AnalysisRun>, ResearchError> {
        self.study(study_code, Phase::Report)?;
        self.runs(study_code, Phase::Report)
    }

    /// Pooled trend of one variable over the latest collection
    pub fn calculate_trend(
        &self,
        study_code: &str,
        variable: &str,
    ) -> Result<TrendAnalysis, ResearchError> {
        let observations = self.latest_observations(study_code)?;
        longitudinal::calculate_trend(&observations, variable)
    }

    /// Abrupt per-pseudonym changes of one variable over the latest collection
    pub fn detect_change_points(
        &self,
        study_code: &str,
        variable: &str,
        threshold_percent: f64,
    ) -> Result<Vec<ChangePoint>, ResearchError> {
        let observations = self.latest_observations(study_code)?;
        Ok(longitudinal::detect_change_points(
            &observations,
            variable,
            threshold_percent,
        ))
    }

    /// Write the latest collection as newline-delimited JSON. Returns rows written.
    pub fn export_dataset<W: Write>(
        &self,
        study_code: &str,
        mut writer: W,
    ) -> Result<usize, ResearchError> {
        let observations = self.latest_observations(study_code)?;
        for observation in &observations {
            serde_json::to_writer(&mut writer, observation)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        info!(study = %study_code, rows = observations.len(), "dataset exported");
        Ok(observations.len())
    }

    fn study(&self, study_code: &str, phase: Phase) -> Result<Study, ResearchError> {
        self.store
            .get_study(study_code)
            .map_err(|e| ResearchError::store(phase, e.to_string()))?
            .ok_or_else(|| ResearchError::StudyNotFound(study_code.to_string()))
    }

    fn runs(&self, study_code: &str, phase: Phase) -> Result<Vec<AnalysisRun>, ResearchError> {
        self.store
            .analysis_runs(study_code)
            .map_err(|e| ResearchError::store(phase, e.to_string()))
    }

    /// Latest collection, which must belong to the current cohort build
    fn current_collection(
        &self,
        study: &Study,
        phase: Phase,
    ) -> Result<CollectionBatch, ResearchError> {
        let phase_order = || ResearchError::PhaseOrder {
            study: study.code().to_string(),
            phase,
            status: study.status.to_string(),
        };

        let build = study.cohort_build.as_ref().ok_or_else(phase_order)?;
        let batch = self
            .store
            .latest_collection(study.code())
            .map_err(|e| ResearchError::store(phase, e.to_string()))?
            .ok_or_else(phase_order)?;

        if batch.cohort_build_id != build.build_id {
            debug!(study = %study.code(), "latest collection predates the current cohort build");
            return Err(phase_order());
        }
        Ok(batch)
    }

    fn observations(
        &self,
        batch: &CollectionBatch,
        phase: Phase,
    ) -> Result<Vec<Observation>, ResearchError> {
        self.store
            .observations(batch.collection_id, None)
            .map_err(|e| ResearchError::store(phase, e.to_string()))
    }

    fn latest_observations(&self, study_code: &str) -> Result<Vec<Observation>, ResearchError> {
        let study = self.study(study_code, Phase::Analysis)?;
        let batch = self.current_collection(&study, Phase::Analysis)?;
        self.observations(&batch, Phase::Analysis)
    }

    fn advance(
        &self,
        study: &mut Study,
        target: StudyStatus,
        phase: Phase,
    ) -> Result<(), ResearchError> {
        let next = study.status.advanced_to(target);
        if next == study.status {
            return Ok(());
        }
        let previous = study.status;
        // Status-only write so a concurrent cohort rebuild is not overwritten
        let updated = self
            .store
            .update_study_status(study.code(), next, Utc::now())
            .map_err(|e| ResearchError::store(phase, e.to_string()))?
            .ok_or_else(|| ResearchError::StudyNotFound(study.code().to_string()))?;
        *study = updated;
        info!(study = %study.code(), from = %previous, to = %next, "study status changed");
        Ok(())
    }

    fn cached_report(&self, study_code: &str) -> Option<StudyReport> {
        self.reports
            .lock()
            .ok()
            .and_then(|cache| cache.get(study_code).cloned())
    }

    fn invalidate_report(&self, study_code: &str) {
        if let Ok(mut cache) = self.reports.lock() {
            cache.remove(study_code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{find_template, PRECONFIGURED_STUDIES};
    use crate::cohort::tests::{subject, voice_phq9_definition};
    use crate::control::Progress;
    use crate::store::{MemoryStore, StoreError, StoreResult};
    use crate::types::{CohortMembership, RawRecord, SubjectRecord, TimeWindow, VariableSource};
    use chrono::{DateTime, Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex as StdMutex};

    const CODE: &str = "EVA-ENGINE-001";

    /// Eight elderly subjects whose PHQ-9 tracks voice pitch two days later, with
    /// visits 20 days apart so no other lag in 0..=14 lines up
    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let pitch = VariableSource::new("voice_prosody_features", "pitch_mean");
        let phq9 = VariableSource::new("clinical_assessments", "phq9_total");

        for s in 0..8i64 {
            let id = format!("{}", s + 1);
            store.add_subject(subject(&id, 1950, &[])).unwrap();
            for visit in 0..5i64 {
                let at = start + Duration::days(visit * 20);
                let value = 150.0 + (s * 5 + visit) as f64;
                store
                    .add_raw_record(RawRecord {
                        subject_id: id.clone(),
                        source: pitch.clone(),
                        recorded_at: at,
                        value,
                        label: None,
                    })
                    .unwrap();
                store
                    .add_raw_record(RawRecord {
                        subject_id: id.clone(),
                        source: phq9.clone(),
                        recorded_at: at + Duration::days(2),
                        value: (value - 150.0) / 2.0,
                        label: None,
                    })
                    .unwrap();
            }
        }
        // Too young for the study
        store.add_subject(subject("young", 2001, &[])).unwrap();
        store
    }

    fn engine() -> ResearchEngine<MemoryStore> {
        let engine = ResearchEngine::new(seeded_store(), ResearchConfig::default()).unwrap();
        engine.register_study(voice_phq9_definition(CODE)).unwrap();
        engine
    }

    fn analyze(engine: &ResearchEngine<MemoryStore>) -> Result<AnalysisRun, ResearchError> {
        engine.run_lag_correlation_analysis(
            CODE,
            "voice_pitch_mean",
            "phq9",
            14,
            &AnalysisOptions::default(),
            &RunContext::new(),
        )
    }

    fn status(engine: &ResearchEngine<MemoryStore>) -> StudyStatus {
        engine.get_study(CODE).unwrap().status
    }

    #[test]
    fn test_full_lifecycle() {
        let engine = engine();
        assert_eq!(status(&engine), StudyStatus::Draft);

        let collected = engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();
        assert_eq!(collected.enrolled, 8);
        assert_eq!(collected.anonymized, 8);
        assert!(collected.skipped.is_empty());
        assert_eq!(collected.cohort_build.as_ref().map(|b| b.added), Some(8));
        assert_eq!(status(&engine), StudyStatus::Collecting);

        let run = analyze(&engine).unwrap();
        assert_eq!(run.results.len(), 15);
        assert_eq!(run.best_lag.as_ref().map(|b| b.lag_days), Some(2));
        assert_eq!(run.metadata.count(MetadataKey::SubjectsCompared), Some(8));
        assert_eq!(status(&engine), StudyStatus::Analyzed);

        let report = engine.generate_study_report(CODE).unwrap();
        assert_eq!(report.cohort_size, 8);
        assert_eq!(report.status, StudyStatus::Reported);
        assert_eq!(report.significant_findings.len(), 1);
        assert_eq!(report.significant_findings[0].result.lag_days, 2);
        assert_eq!(status(&engine), StudyStatus::Reported);

        // Re-analysis keeps the status and appends a new run
        let again = analyze(&engine).unwrap();
        assert_ne!(again.run_id, run.run_id);
        assert_eq!(status(&engine), StudyStatus::Reported);
        assert_eq!(engine.analysis_runs(CODE).unwrap().len(), 2);

        let significant = engine.get_significant_correlations(CODE).unwrap();
        assert!(significant.iter().all(|r| r.run_id == again.run_id));
        assert!(significant.iter().any(|r| r.lag_days == 2));
    }

    #[test]
    fn test_out_of_order_phases_rejected() {
        let engine = engine();
        assert!(matches!(
            analyze(&engine),
            Err(ResearchError::PhaseOrder {
                phase: Phase::Analysis,
                ..
            })
        ));
        assert!(matches!(
            engine.generate_study_report(CODE),
            Err(ResearchError::PhaseOrder {
                phase: Phase::Report,
                ..
            })
        ));

        // Cohort built but nothing collected yet
        engine.build_cohort(CODE, &RunContext::new()).unwrap();
        assert!(matches!(
            analyze(&engine),
            Err(ResearchError::PhaseOrder { .. })
        ));
        assert_eq!(status(&engine), StudyStatus::Collecting);
    }

    #[test]
    fn test_rebuild_invalidates_cached_report() {
        let engine = engine();
        engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();
        analyze(&engine).unwrap();

        let first = engine.generate_study_report(CODE).unwrap();
        let cached = engine.generate_study_report(CODE).unwrap();
        assert_eq!(first, cached);

        engine.build_cohort(CODE, &RunContext::new()).unwrap();
        let rebuilt = engine.generate_study_report(CODE).unwrap();
        assert_ne!(rebuilt.cohort_build_id, first.cohort_build_id);
        assert!(!rebuilt.analyses[0].current);
        assert!(rebuilt.significant_findings.is_empty());

        // The old collection belongs to the previous build
        assert!(matches!(
            analyze(&engine),
            Err(ResearchError::PhaseOrder { .. })
        ));
        engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();
        assert!(analyze(&engine).is_ok());
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let engine = engine();
        engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();
        let err = engine
            .run_lag_correlation_analysis(
                CODE,
                "sleep_hours",
                "phq9",
                7,
                &AnalysisOptions::default(),
                &RunContext::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ResearchError::InvalidDefinition(_)));
    }

    #[test]
    fn test_preconfigured_studies_are_idempotent() {
        let engine = ResearchEngine::new(MemoryStore::new(), ResearchConfig::default()).unwrap();
        let first = engine
            .create_preconfigured_studies(PRECONFIGURED_STUDIES)
            .unwrap();
        assert_eq!(first.registered.len(), 4);

        let second = engine
            .create_preconfigured_studies(PRECONFIGURED_STUDIES)
            .unwrap();
        assert!(second.registered.is_empty());
        assert_eq!(second.existing.len(), 4);

        let studies = engine.get_all_studies().unwrap();
        assert_eq!(studies.len(), 4);
        assert!(studies.iter().all(|s| s.status == StudyStatus::Draft));

        let voice = find_template(PRECONFIGURED_STUDIES, "EVA-VOICE-PHQ9-001").unwrap();
        assert_eq!(
            engine.get_study(voice.code).unwrap().definition.target_subjects,
            100
        );
    }

    #[test]
    fn test_export_dataset_has_no_raw_ids() {
        let engine = engine();
        let collected = engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();

        let mut buffer = Vec::new();
        let rows = engine.export_dataset(CODE, &mut buffer).unwrap();
        assert_eq!(rows, collected.observations);

        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().count(), rows);
        assert!(!text.contains("Paciente"));
        assert!(!text.contains("DOC-"));

        let first: Observation = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.study_code, CODE);
    }

    #[test]
    fn test_collection_reports_progress() {
        let engine = engine();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let ctx = RunContext::new().with_progress(move |p: Progress| {
            sink.lock().unwrap().push(p);
        });

        engine.collect_data_for_cohort(CODE, &ctx).unwrap();

        let events = events.lock().unwrap();
        let anonymization: Vec<&Progress> = events
            .iter()
            .filter(|p| p.phase == Phase::Anonymization)
            .collect();
        assert_eq!(anonymization.len(), 9);
        assert!(anonymization.iter().any(|p| p.processed == 8 && p.total == 8));
    }

    #[test]
    fn test_trend_and_change_points_over_collection() {
        let engine = engine();
        engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();

        let trend = engine.calculate_trend(CODE, "phq9").unwrap();
        assert!(trend.slope_per_day > 0.0);
        assert_eq!(trend.subjects, 8);

        // Pitch grows by under 1% per visit
        let points = engine
            .detect_change_points(CODE, "voice_pitch_mean", 5.0)
            .unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn test_oversized_max_lag_rejected_before_any_work() {
        let engine = engine();
        engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();
        let err = engine
            .run_lag_correlation_analysis(
                CODE,
                "voice_pitch_mean",
                "phq9",
                u32::MAX,
                &AnalysisOptions::default(),
                &RunContext::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ResearchError::Config(_)));

        let err = engine
            .run_lag_correlation_analysis(
                CODE,
                "voice_pitch_mean",
                "phq9",
                14,
                &AnalysisOptions {
                    match_tolerance_minutes: Some(i64::MAX),
                    ..Default::default()
                },
                &RunContext::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ResearchError::Config(_)));
        assert!(engine.analysis_runs(CODE).unwrap().is_empty());
        assert_eq!(status(&engine), StudyStatus::Collecting);
    }

    #[test]
    fn test_status_change_keeps_newer_cohort_build() {
        let engine = engine();
        engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();
        let mut stale = engine.get_study(CODE).unwrap();

        engine.build_cohort(CODE, &RunContext::new()).unwrap();
        let rebuilt = engine.get_study(CODE).unwrap().cohort_build;
        assert_ne!(rebuilt, stale.cohort_build);

        engine
            .advance(&mut stale, StudyStatus::Analyzed, Phase::Analysis)
            .unwrap();
        let stored = engine.get_study(CODE).unwrap();
        assert_eq!(stored.status, StudyStatus::Analyzed);
        assert_eq!(stored.cohort_build, rebuilt);
        assert_eq!(stale, stored);
    }

    /// Memory store whose membership reads can be switched to fail
    struct MembershipOutage {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl ResearchStore for MembershipOutage {
        fn list_subjects(&self) -> StoreResult<Vec<SubjectRecord>> {
            self.inner.list_subjects()
        }
        fn count_raw_records(&self, subject_id: &str, source: &VariableSource) -> StoreResult<usize> {
            self.inner.count_raw_records(subject_id, source)
        }
        fn fetch_raw_records(
            &self,
            subject_id: &str,
            source: &VariableSource,
            window: &TimeWindow,
        ) -> StoreResult<Vec<RawRecord>> {
            self.inner.fetch_raw_records(subject_id, source, window)
        }
        fn insert_study(&self, study: Study) -> StoreResult<bool> {
            self.inner.insert_study(study)
        }
        fn upsert_study(&self, study: Study) -> StoreResult<()> {
            self.inner.upsert_study(study)
        }
        fn update_study_status(
            &self,
            code: &str,
            status: StudyStatus,
            updated_at: DateTime<Utc>,
        ) -> StoreResult<Option<Study>> {
            self.inner.update_study_status(code, status, updated_at)
        }
        fn get_study(&self, code: &str) -> StoreResult<Option<Study>> {
            self.inner.get_study(code)
        }
        fn list_studies(&self) -> StoreResult<Vec<Study>> {
            self.inner.list_studies()
        }
        fn memberships(&self, study_code: &str) -> StoreResult<Vec<CohortMembership>> {
            if self.failing.load(AtomicOrdering::SeqCst) {
                return Err(StoreError("membership table unavailable".to_string()));
            }
            self.inner.memberships(study_code)
        }
        fn upsert_memberships(&self, rows: &[CohortMembership]) -> StoreResult<()> {
            self.inner.upsert_memberships(rows)
        }
        fn remove_memberships(&self, study_code: &str, subject_ids: &[String]) -> StoreResult<()> {
            self.inner.remove_memberships(study_code, subject_ids)
        }
        fn append_collection(
            &self,
            batch: CollectionBatch,
            observations: Vec<Observation>,
        ) -> StoreResult<()> {
            self.inner.append_collection(batch, observations)
        }
        fn latest_collection(&self, study_code: &str) -> StoreResult<Option<CollectionBatch>> {
            self.inner.latest_collection(study_code)
        }
        fn observations(
            &self,
            collection_id: Uuid,
            window: Option<&TimeWindow>,
        ) -> StoreResult<Vec<Observation>> {
            self.inner.observations(collection_id, window)
        }
        fn append_analysis_run(&self, run: AnalysisRun) -> StoreResult<()> {
            self.inner.append_analysis_run(run)
        }
        fn analysis_runs(&self, study_code: &str) -> StoreResult<Vec<AnalysisRun>> {
            self.inner.analysis_runs(study_code)
        }
    }

    #[test]
    fn test_failed_report_leaves_study_analyzed() {
        let store = MembershipOutage {
            inner: seeded_store(),
            failing: AtomicBool::new(false),
        };
        let engine = ResearchEngine::new(store, ResearchConfig::default()).unwrap();
        engine.register_study(voice_phq9_definition(CODE)).unwrap();
        engine
            .collect_data_for_cohort(CODE, &RunContext::new())
            .unwrap();
        engine
            .run_lag_correlation_analysis(
                CODE,
                "voice_pitch_mean",
                "phq9",
                14,
                &AnalysisOptions::default(),
                &RunContext::new(),
            )
            .unwrap();

        engine.store().failing.store(true, AtomicOrdering::SeqCst);
        let err = engine.generate_study_report(CODE).unwrap_err();
        assert!(matches!(
            err,
            ResearchError::Store {
                phase: Phase::Report,
                ..
            }
        ));
        assert_eq!(engine.get_study(CODE).unwrap().status, StudyStatus::Analyzed);

        engine.store().failing.store(false, AtomicOrdering::SeqCst);
        let report = engine.generate_study_report(CODE).unwrap();
        assert_eq!(report.status, StudyStatus::Reported);
        assert_eq!(engine.get_study(CODE).unwrap().status, StudyStatus::Reported);
    }
}
