//! Preconfigured study catalog
//!
//! An immutable table of study templates. Callers pass the table they want
//! registered into [`ResearchEngine::create_preconfigured_studies`]; nothing here is
//! global mutable state.
//!
//! [`ResearchEngine::create_preconfigured_studies`]: crate::engine::ResearchEngine::create_preconfigured_studies

use crate::criteria::Criterion;
use crate::types::{StudyDefinition, ValueRange, VariableDefinition, VariableKind, VariableSource};

/// Static description of a study variable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariableTemplate {
    pub name: &'static str,
    pub kind: VariableKind,
    pub table: &'static str,
    pub field: &'static str,
    pub valid_range: Option<(f64, f64)>,
}

impl VariableTemplate {
    pub fn to_definition(&self) -> VariableDefinition {
        VariableDefinition {
            name: self.name.to_string(),
            kind: self.kind,
            source: VariableSource::new(self.table, self.field),
            valid_range: self.valid_range.map(|(min, max)| ValueRange { min, max }),
        }
    }
}

/// Static form of [`Criterion`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionTemplate {
    MinAge(u32),
    MaxAge(u32),
    HasFlag(&'static str),
    HasData(&'static str),
    MinObservations(&'static str, usize),
}

impl CriterionTemplate {
    pub fn to_criterion(&self) -> Criterion {
        match *self {
            CriterionTemplate::MinAge(years) => Criterion::MinAge { years },
            CriterionTemplate::MaxAge(years) => Criterion::MaxAge { years },
            CriterionTemplate::HasFlag(flag) => Criterion::HasFlag {
                flag: flag.to_string(),
            },
            CriterionTemplate::HasData(variable) => Criterion::HasData {
                variable: variable.to_string(),
            },
            CriterionTemplate::MinObservations(variable, count) => Criterion::MinObservations {
                variable: variable.to_string(),
                count,
            },
        }
    }
}

/// A known study, ready to be registered
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudyTemplate {
    pub code: &'static str,
    pub name: &'static str,
    pub hypothesis: &'static str,
    pub study_type: &'static str,
    pub primary_outcome: &'static str,
    pub principal_investigator: &'static str,
    pub target_subjects: u32,
    pub followup_days: u32,
    pub variables: &'static [VariableTemplate],
    pub inclusion: &'static [CriterionTemplate],
    pub exclusion: &'static [CriterionTemplate],
    /// Default (X, Y) pair for the study's primary lag analysis
    pub primary_pair: (&'static str, &'static str),
}

impl StudyTemplate {
    pub fn to_definition(&self) -> StudyDefinition {
        StudyDefinition {
            code: self.code.to_string(),
            name: self.name.to_string(),
            hypothesis: self.hypothesis.to_string(),
            study_type: self.study_type.to_string(),
            variables: self.variables.iter().map(|v| v.to_definition()).collect(),
            inclusion: self.inclusion.iter().map(|c| c.to_criterion()).collect(),
            exclusion: self.exclusion.iter().map(|c| c.to_criterion()).collect(),
            enrollment_window: None,
            collection_window_days: Some(self.followup_days),
            primary_outcome: self.primary_outcome.to_string(),
            target_subjects: self.target_subjects,
            principal_investigator: self.principal_investigator.to_string(),
        }
    }
}

/// Look up a template by study code
pub fn find_template(templates: &[StudyTemplate], code: &str) -> Option<StudyTemplate> {
    templates.iter().find(|t| t.code == code).copied()
}

const RESEARCH_TEAM: &str = "Dr. EVA Research Team";

pub const VOICE_PITCH_MEAN: VariableTemplate = VariableTemplate {
    name: "voice_pitch_mean",
    kind: VariableKind::Continuous,
    table: "voice_prosody_features",
    field: "pitch_mean_hz",
    valid_range: Some((50.0, 400.0)),
};

pub const VOICE_JITTER: VariableTemplate = VariableTemplate {
    name: "voice_jitter",
    kind: VariableKind::Continuous,
    table: "voice_prosody_features",
    field: "jitter",
    valid_range: Some((0.0, 1.0)),
};

pub const VOICE_SHIMMER: VariableTemplate = VariableTemplate {
    name: "voice_shimmer",
    kind: VariableKind::Continuous,
    table: "voice_prosody_features",
    field: "shimmer",
    valid_range: Some((0.0, 1.0)),
};

pub const PHQ9: VariableTemplate = VariableTemplate {
    name: "phq9",
    kind: VariableKind::Ordinal,
    table: "clinical_assessments",
    field: "phq9_score",
    valid_range: Some((0.0, 27.0)),
};

pub const GAD7: VariableTemplate = VariableTemplate {
    name: "gad7",
    kind: VariableKind::Ordinal,
    table: "clinical_assessments",
    field: "gad7_score",
    valid_range: Some((0.0, 21.0)),
};

pub const MEDICATION_ADHERENCE: VariableTemplate = VariableTemplate {
    name: "medication_adherence",
    kind: VariableKind::Continuous,
    table: "medication_logs",
    field: "adherence_7d",
    valid_range: Some((0.0, 1.0)),
};

pub const SOCIAL_ISOLATION: VariableTemplate = VariableTemplate {
    name: "social_isolation",
    kind: VariableKind::Continuous,
    table: "call_logs",
    field: "days_since_last_call",
    valid_range: Some((0.0, 365.0)),
};

pub const CRISIS_EVENT: VariableTemplate = VariableTemplate {
    name: "crisis_event",
    kind: VariableKind::Categorical,
    table: "crisis_events",
    field: "severity",
    valid_range: None,
};

pub const SLEEP_HOURS: VariableTemplate = VariableTemplate {
    name: "sleep_hours",
    kind: VariableKind::Continuous,
    table: "sinais_vitais",
    field: "sleep_hours_avg_7d",
    valid_range: Some((0.0, 12.0)),
};

pub const SLEEP_EFFICIENCY: VariableTemplate = VariableTemplate {
    name: "sleep_efficiency",
    kind: VariableKind::Continuous,
    table: "sinais_vitais",
    field: "sleep_efficiency",
    valid_range: Some((0.0, 1.0)),
};

/// The four studies shipped with the care program
pub const PRECONFIGURED_STUDIES: &[StudyTemplate] = &[
    StudyTemplate {
        code: "EVA-VOICE-PHQ9-001",
        name: "Voice Biomarkers as Early Predictors of Depression Severity",
        hypothesis: "Changes in voice prosody features (pitch, jitter, shimmer) predict PHQ-9 score changes 7-14 days in advance",
        study_type: "longitudinal_correlation",
        primary_outcome: "PHQ-9 score change",
        principal_investigator: RESEARCH_TEAM,
        target_subjects: 100,
        followup_days: 180,
        variables: &[VOICE_PITCH_MEAN, VOICE_JITTER, VOICE_SHIMMER, PHQ9],
        inclusion: &[
            CriterionTemplate::MinAge(60),
            CriterionTemplate::MaxAge(90),
            CriterionTemplate::HasData("voice_pitch_mean"),
            CriterionTemplate::MinObservations("phq9", 3),
        ],
        exclusion: &[
            CriterionTemplate::HasFlag("severe_hearing_impairment"),
            CriterionTemplate::HasFlag("severe_cognitive_impairment"),
        ],
        primary_pair: ("voice_pitch_mean", "phq9"),
    },
    StudyTemplate {
        code: "EVA-ADHERENCE-DEP-002",
        name: "Impact of Medication Adherence on Depression Outcomes in Elderly",
        hypothesis: "Medication adherence <50% for 2+ weeks leads to a PHQ-9 increase of 5+ points within 30 days",
        study_type: "causal_inference",
        primary_outcome: "PHQ-9 increase of 5+ points",
        principal_investigator: RESEARCH_TEAM,
        target_subjects: 200,
        followup_days: 90,
        variables: &[MEDICATION_ADHERENCE, PHQ9],
        inclusion: &[
            CriterionTemplate::MinAge(60),
            CriterionTemplate::HasFlag("on_antidepressants"),
            CriterionTemplate::HasData("medication_adherence"),
        ],
        exclusion: &[CriterionTemplate::HasFlag("hospitalized")],
        primary_pair: ("medication_adherence", "phq9"),
    },
    StudyTemplate {
        code: "EVA-ISOLATION-CRISIS-003",
        name: "Social Isolation as Risk Factor for Mental Health Crisis",
        hypothesis: "7+ days without social interaction increases crisis risk 3x within 30 days",
        study_type: "survival_analysis",
        primary_outcome: "Time to crisis event",
        principal_investigator: RESEARCH_TEAM,
        target_subjects: 150,
        followup_days: 180,
        variables: &[SOCIAL_ISOLATION, CRISIS_EVENT, PHQ9],
        inclusion: &[
            CriterionTemplate::MinAge(60),
            CriterionTemplate::HasData("social_isolation"),
        ],
        exclusion: &[CriterionTemplate::HasFlag("lives_in_facility")],
        primary_pair: ("social_isolation", "crisis_event"),
    },
    StudyTemplate {
        code: "EVA-SLEEP-MH-004",
        name: "Sleep Quality and Mental Health Trajectories in Elderly",
        hypothesis: "Poor sleep (<5h average for 7 days) predicts worsening depression and anxiety",
        study_type: "longitudinal_correlation",
        primary_outcome: "PHQ-9 and GAD-7 trajectories",
        principal_investigator: RESEARCH_TEAM,
        target_subjects: 120,
        followup_days: 120,
        variables: &[SLEEP_HOURS, SLEEP_EFFICIENCY, PHQ9, GAD7],
        inclusion: &[
            CriterionTemplate::MinAge(60),
            CriterionTemplate::HasData("sleep_hours"),
            CriterionTemplate::MinObservations("phq9", 5),
        ],
        exclusion: &[CriterionTemplate::HasFlag("diagnosed_sleep_apnea")],
        primary_pair: ("sleep_hours", "phq9"),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::validate_definition;
    use std::collections::BTreeSet;

    #[test]
    fn test_catalog_definitions_are_valid() {
        for template in PRECONFIGURED_STUDIES {
            let definition = template.to_definition();
            assert!(
                validate_definition(&definition).is_ok(),
                "{} should validate",
                template.code
            );
            assert!(definition.variable(template.primary_pair.0).is_some());
            assert!(definition.variable(template.primary_pair.1).is_some());
        }
    }

    #[test]
    fn test_catalog_codes_are_unique() {
        let codes: BTreeSet<&str> = PRECONFIGURED_STUDIES.iter().map(|t| t.code).collect();
        assert_eq!(codes.len(), PRECONFIGURED_STUDIES.len());
    }

    #[test]
    fn test_voice_study_criteria() {
        let template = find_template(PRECONFIGURED_STUDIES, "EVA-VOICE-PHQ9-001").unwrap();
        let definition = template.to_definition();
        assert_eq!(definition.collection_window_days, Some(180));
        assert!(definition.inclusion.contains(&Criterion::MinObservations {
            variable: "phq9".to_string(),
            count: 3
        }));
        assert_eq!(definition.exclusion.len(), 2);
    }
}
