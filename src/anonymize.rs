//! Anonymization Pipeline
//!
//! Converts each cohort member's raw longitudinal records into pseudonymized
//! observations. Only the pseudonym and the declared variable fields cross this
//! boundary; names, document numbers and contact details are never read.

use crate::config::ResearchConfig;
use crate::control::{worker_pool, RunContext};
use crate::error::ResearchError;
use crate::store::ResearchStore;
use crate::types::{
    CohortMembership, CollectionBatch, Observation, Phase, Pseudonym, StudyDefinition,
    StudyStatus, TimeWindow,
};
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Separates hash inputs so ("ab", "c") and ("a", "bc") never collide
const FIELD_SEPARATOR: [u8; 1] = [0x1f];

/// Derive the study-scoped pseudonym for a raw subject id.
///
/// SHA-256 over study code, subject id and salt; the same inputs always yield the
/// same pseudonym and different studies yield unrelated ones.
pub fn derive_pseudonym(study_code: &str, subject_id: &str, salt: &str) -> Pseudonym {
    let mut hasher = Sha256::new();
    hasher.update(study_code.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(subject_id.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Pseudonym::from_digest_hex(hex)
}

/// A cohort member whose raw records could not be fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSubject {
    /// Raw id, returned to the caller only so the fetch can be retried
    pub subject_id: String,
    pub reason: String,
}

/// Counts from one anonymization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizationSummary {
    pub collection_id: Uuid,
    pub cohort_build_id: Uuid,
    pub enrolled: usize,
    pub anonymized: usize,
    pub skipped: Vec<SkippedSubject>,
    pub observations: usize,
    /// Observations whose value fell outside the variable's valid range
    pub out_of_range: usize,
}

enum SubjectOutcome {
    Collected(Vec<Observation>),
    Skipped(SkippedSubject),
}

/// Cohort anonymizer bound to a store and deployment configuration
pub struct Anonymizer<'a, S: ResearchStore> {
    store: &'a S,
    config: &'a ResearchConfig,
}

impl<'a, S: ResearchStore> Anonymizer<'a, S> {
    pub fn new(store: &'a S, config: &'a ResearchConfig) -> Self {
        Self { store, config }
    }

    /// Anonymize every cohort member's records and append them as a new collection.
    ///
    /// A subject whose fetch fails is skipped and reported. Cancellation or an
    /// expired deadline abandons the run and persists nothing.
    pub fn anonymize_cohort(
        &self,
        study_code: &str,
        ctx: &RunContext,
    ) -> Result<AnonymizationSummary, ResearchError> {
        let study = self
            .store
            .get_study(study_code)
            .map_err(|e| ResearchError::store(Phase::Anonymization, e.to_string()))?
            .ok_or_else(|| ResearchError::StudyNotFound(study_code.to_string()))?;

        let build = match (&study.cohort_build, study.status) {
            (Some(build), status) if status >= StudyStatus::Collecting => build.clone(),
            _ => {
                return Err(ResearchError::PhaseOrder {
                    study: study_code.to_string(),
                    phase: Phase::Anonymization,
                    status: study.status.to_string(),
                })
            }
        };

        let members = self
            .store
            .memberships(study_code)
            .map_err(|e| ResearchError::store(Phase::Anonymization, e.to_string()))?;
        if members.is_empty() {
            return Err(ResearchError::EmptyCohort(study_code.to_string()));
        }

        let collection_id = Uuid::new_v4();
        let window_days = study
            .definition
            .collection_window_days
            .unwrap_or(self.config.collection_window_days);

        info!(
            study = %study_code,
            subjects = members.len(),
            window_days,
            "anonymization started"
        );

        let pool = worker_pool(self.config.concurrency)?;
        let counter = ctx.counter(Phase::Anonymization, members.len());
        let outcomes: Vec<SubjectOutcome> = pool.install(|| {
            members
                .par_iter()
                .map(|member| {
                    let outcome = self.collect_subject(
                        &study.definition,
                        member,
                        collection_id,
                        window_days,
                        ctx,
                    )?;
                    counter.tick();
                    Ok(outcome)
                })
                .collect::<Result<Vec<_>, ResearchError>>()
        })?;

        let mut observations = Vec::new();
        let mut skipped = Vec::new();
        let mut anonymized = 0;
        for outcome in outcomes {
            match outcome {
                SubjectOutcome::Collected(rows) => {
                    anonymized += 1;
                    observations.extend(rows);
                }
                SubjectOutcome::Skipped(subject) => skipped.push(subject),
            }
        }
        let out_of_range = observations.iter().filter(|o| o.out_of_range).count();

        ctx.checkpoint(Phase::Anonymization)?;

        let batch = CollectionBatch {
            collection_id,
            study_code: study_code.to_string(),
            cohort_build_id: build.build_id,
            collected_at: Utc::now(),
            subjects_anonymized: anonymized,
            observation_count: observations.len(),
        };
        let observation_count = observations.len();
        self.store
            .append_collection(batch, observations)
            .map_err(|e| ResearchError::store(Phase::Anonymization, e.to_string()))?;

        if out_of_range > 0 {
            warn!(study = %study_code, out_of_range, "values outside declared valid range");
        }
        info!(
            study = %study_code,
            collection = %collection_id,
            anonymized,
            skipped = skipped.len(),
            observations = observation_count,
            "anonymization complete"
        );

        Ok(AnonymizationSummary {
            collection_id,
            cohort_build_id: build.build_id,
            enrolled: members.len(),
            anonymized,
            skipped,
            observations: observation_count,
            out_of_range,
        })
    }

    fn collect_subject(
        &self,
        definition: &StudyDefinition,
        member: &CohortMembership,
        collection_id: Uuid,
        window_days: u32,
        ctx: &RunContext,
    ) -> Result<SubjectOutcome, ResearchError> {
        let pseudonym = derive_pseudonym(
            &definition.code,
            &member.subject_id,
            &self.config.collection_salt,
        );
        let window = TimeWindow::from_start(member.enrolled_at, window_days);
        let mut observations = Vec::new();

        for variable in &definition.variables {
            ctx.checkpoint(Phase::Anonymization)?;

            let records = match self
                .store
                .fetch_raw_records(&member.subject_id, &variable.source, &window)
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(study = %definition.code, variable = %variable.name, error = %e, "subject skipped");
                    debug!(subject = %member.subject_id, "skipped subject id");
                    return Ok(SubjectOutcome::Skipped(SkippedSubject {
                        subject_id: member.subject_id.clone(),
                        reason: format!("{}: {}", variable.source, e),
                    }));
                }
            };

            let mut rows: Vec<Observation> = records
                .into_iter()
                .enumerate()
                .map(|(index, record)| Observation {
                    collection_id,
                    study_code: definition.code.clone(),
                    pseudonym: pseudonym.clone(),
                    variable: variable.name.clone(),
                    timestamp: record.recorded_at,
                    value: record.value,
                    label: record.label,
                    sequence: index as u64,
                    out_of_range: variable
                        .valid_range
                        .is_some_and(|range| !range.contains(record.value)),
                })
                .collect();
            // Stable: equal timestamps keep raw source order
            rows.sort_by_key(|o| o.timestamp);
            observations.extend(rows);
        }

        Ok(SubjectOutcome::Collected(observations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::tests::{subject, voice_phq9_definition};
    use crate::cohort::CohortBuilder;
    use crate::control::CancellationToken;
    use crate::store::MemoryStore;
    use crate::types::{RawRecord, ValueRange, VariableSource};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn seeded_store(code: &str) -> MemoryStore {
        let store = MemoryStore::new();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let pitch = VariableSource::new("voice_prosody_features", "pitch_mean");
        let phq9 = VariableSource::new("clinical_assessments", "phq9_total");

        for id in ["1", "2", "3"] {
            store.add_subject(subject(id, 1950, &[])).unwrap();
            // Deliberately out of order, with a duplicated timestamp
            for (day, value) in [(3, 180.0), (1, 175.0), (3, 181.0), (2, 178.0)] {
                store
                    .add_raw_record(RawRecord {
                        subject_id: id.to_string(),
                        source: pitch.clone(),
                        recorded_at: start + Duration::days(day),
                        value,
                        label: None,
                    })
                    .unwrap();
            }
            store
                .add_raw_record(RawRecord {
                    subject_id: id.to_string(),
                    source: phq9.clone(),
                    recorded_at: start + Duration::days(2),
                    value: 31.0,
                    label: Some("severe".to_string()),
                })
                .unwrap();
            // Outside the collection window
            store
                .add_raw_record(RawRecord {
                    subject_id: id.to_string(),
                    source: phq9.clone(),
                    recorded_at: start + Duration::days(400),
                    value: 5.0,
                    label: None,
                })
                .unwrap();
        }

        let mut definition = voice_phq9_definition(code);
        definition.variables[1].valid_range = Some(ValueRange {
            min: 0.0,
            max: 27.0,
        });
        let builder = CohortBuilder::new(&store);
        builder.register_study(definition).unwrap();
        builder.build_cohort(code, &RunContext::new()).unwrap();
        store
    }

    #[test]
    fn test_pseudonym_is_deterministic_and_study_scoped() {
        let a = derive_pseudonym("EVA-1", "subject-42", "salt");
        let b = derive_pseudonym("EVA-1", "subject-42", "salt");
        let other_study = derive_pseudonym("EVA-2", "subject-42", "salt");
        let other_salt = derive_pseudonym("EVA-1", "subject-42", "pepper");

        assert_eq!(a, b);
        assert_ne!(a, other_study);
        assert_ne!(a, other_salt);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.as_str().contains("subject-42"));
    }

    #[test]
    fn test_reruns_yield_identical_pseudonyms() {
        let store = seeded_store("EVA-ANON-001");
        let config = ResearchConfig::default();
        let anonymizer = Anonymizer::new(&store, &config);

        let first = anonymizer
            .anonymize_cohort("EVA-ANON-001", &RunContext::new())
            .unwrap();
        let second = anonymizer
            .anonymize_cohort("EVA-ANON-001", &RunContext::new())
            .unwrap();
        assert_ne!(first.collection_id, second.collection_id);

        let pseudonyms = |id: Uuid| {
            store
                .observations(id, None)
                .unwrap()
                .into_iter()
                .map(|o| o.pseudonym)
                .collect::<Vec<_>>()
        };
        assert_eq!(pseudonyms(first.collection_id), pseudonyms(second.collection_id));
    }

    #[test]
    fn test_order_preserved_and_identifiers_absent() {
        let store = seeded_store("EVA-ANON-002");
        let config = ResearchConfig::default();
        let summary = Anonymizer::new(&store, &config)
            .anonymize_cohort("EVA-ANON-002", &RunContext::new())
            .unwrap();

        assert_eq!(summary.enrolled, 3);
        assert_eq!(summary.anonymized, 3);
        assert!(summary.skipped.is_empty());
        // 4 pitch + 1 in-window phq9 per subject
        assert_eq!(summary.observations, 15);
        assert_eq!(summary.out_of_range, 3);

        let observations = store.observations(summary.collection_id, None).unwrap();
        let mut series: BTreeMap<(String, String), Vec<&Observation>> = BTreeMap::new();
        for o in &observations {
            series
                .entry((o.pseudonym.to_string(), o.variable.clone()))
                .or_default()
                .push(o);
        }
        for rows in series.values() {
            assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }

        let pitch: Vec<f64> = series
            .iter()
            .find(|((_, v), _)| v == "voice_pitch_mean")
            .map(|(_, rows)| rows.iter().map(|o| o.value).collect())
            .unwrap();
        // Equal timestamps keep source order: 180 was recorded before 181
        assert_eq!(pitch, vec![175.0, 178.0, 180.0, 181.0]);

        let json = serde_json::to_string(&observations).unwrap();
        for id in ["1", "2", "3"] {
            assert!(!json.contains(&format!("Paciente {}", id)));
            assert!(!json.contains(&format!("DOC-{}", id)));
        }
    }

    #[test]
    fn test_failed_subject_is_skipped_not_fatal() {
        let store = seeded_store("EVA-ANON-003");
        store.mark_unavailable("2");
        let config = ResearchConfig::default();
        let summary = Anonymizer::new(&store, &config)
            .anonymize_cohort("EVA-ANON-003", &RunContext::new())
            .unwrap();

        assert_eq!(summary.anonymized, 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].subject_id, "2");
        assert_eq!(summary.observations, 10);
    }

    #[test]
    fn test_cancelled_run_persists_nothing() {
        let store = seeded_store("EVA-ANON-004");
        let config = ResearchConfig::default();
        let token = CancellationToken::new();
        token.cancel();

        let err = Anonymizer::new(&store, &config)
            .anonymize_cohort(
                "EVA-ANON-004",
                &RunContext::new().with_cancellation(token),
            )
            .unwrap_err();
        assert!(matches!(err, ResearchError::Cancelled { .. }));
        assert!(store.latest_collection("EVA-ANON-004").unwrap().is_none());
    }

    #[test]
    fn test_requires_built_cohort() {
        let store = MemoryStore::new();
        CohortBuilder::new(&store)
            .register_study(voice_phq9_definition("EVA-ANON-005"))
            .unwrap();
        let config = ResearchConfig::default();
        let err = Anonymizer::new(&store, &config)
            .anonymize_cohort("EVA-ANON-005", &RunContext::new())
            .unwrap_err();
        assert!(matches!(err, ResearchError::PhaseOrder { .. }));
    }
}
