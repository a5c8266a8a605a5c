//! Inclusion and exclusion criteria
//!
//! Criteria are typed predicates over a subject's attributes and data availability.
//! A subject qualifies for a study when it meets every inclusion criterion, meets no
//! exclusion criterion, and enrolled inside the study's enrollment window.

use crate::error::ResearchError;
use crate::types::{StudyDefinition, SubjectRecord};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single predicate over a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
    /// Age in years at evaluation time is at least `years`
    MinAge { years: u32 },
    /// Age in years at evaluation time is at most `years`
    MaxAge { years: u32 },
    /// Subject record carries the named flag
    HasFlag { flag: String },
    /// At least one raw record exists for a declared variable
    HasData { variable: String },
    /// At least `count` raw records exist for a declared variable
    MinObservations { variable: String, count: usize },
}

impl Criterion {
    /// Short human-readable description, used in eligibility snapshots
    pub fn describe(&self) -> String {
        match self {
            Criterion::MinAge { years } => format!("age >= {}", years),
            Criterion::MaxAge { years } => format!("age <= {}", years),
            Criterion::HasFlag { flag } => format!("flag {}", flag),
            Criterion::HasData { variable } => format!("has {} data", variable),
            Criterion::MinObservations { variable, count } => {
                format!("{} >= {} observations", variable, count)
            }
        }
    }

    /// Variable this criterion depends on, if any
    pub fn variable(&self) -> Option<&str> {
        match self {
            Criterion::HasData { variable } | Criterion::MinObservations { variable, .. } => {
                Some(variable.as_str())
            }
            _ => None,
        }
    }

    /// Evaluate against a subject profile
    pub fn matches(&self, profile: &SubjectProfile<'_>) -> bool {
        match self {
            Criterion::MinAge { years } => profile.age_years().is_some_and(|age| age >= *years),
            Criterion::MaxAge { years } => profile.age_years().is_some_and(|age| age <= *years),
            Criterion::HasFlag { flag } => profile.subject.flags.contains(flag),
            Criterion::HasData { variable } => profile.record_count(variable) > 0,
            Criterion::MinObservations { variable, count } => {
                profile.record_count(variable) >= *count
            }
        }
    }
}

/// Window in which a subject's enrollment must fall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentWindow {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl EnrollmentWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && self.end.map_or(true, |end| at < end)
    }
}

/// What the criteria see of a subject: its record plus per-variable record counts
#[derive(Debug, Clone)]
pub struct SubjectProfile<'a> {
    pub subject: &'a SubjectRecord,
    pub record_counts: BTreeMap<String, usize>,
    pub evaluated_on: NaiveDate,
}

impl<'a> SubjectProfile<'a> {
    pub fn age_years(&self) -> Option<u32> {
        self.subject.age_at(self.evaluated_on)
    }

    pub fn record_count(&self, variable: &str) -> usize {
        self.record_counts.get(variable).copied().unwrap_or(0)
    }
}

/// Outcome of evaluating a study's criteria for one subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub eligible: bool,
    /// Inclusion criteria the subject met
    pub criteria_met: Vec<String>,
    /// Why the subject does not qualify (empty when eligible)
    pub reasons: Vec<String>,
}

/// Evaluate all of a study's criteria for one subject
pub fn evaluate(definition: &StudyDefinition, profile: &SubjectProfile<'_>) -> Eligibility {
    let mut criteria_met = Vec::new();
    let mut reasons = Vec::new();

    if let Some(window) = &definition.enrollment_window {
        if !window.contains(profile.subject.enrolled_at) {
            reasons.push("enrolled outside enrollment window".to_string());
        }
    }

    for criterion in &definition.inclusion {
        if criterion.matches(profile) {
            criteria_met.push(criterion.describe());
        } else {
            reasons.push(format!("does not meet: {}", criterion.describe()));
        }
    }

    for criterion in &definition.exclusion {
        if criterion.matches(profile) {
            reasons.push(format!("excluded: {}", criterion.describe()));
        }
    }

    Eligibility {
        eligible: reasons.is_empty(),
        criteria_met,
        reasons,
    }
}

/// Check that a definition's criteria are well-formed and reference declared variables
pub fn validate(definition: &StudyDefinition) -> Result<(), ResearchError> {
    let all = definition.inclusion.iter().chain(definition.exclusion.iter());

    for criterion in all {
        if let Some(variable) = criterion.variable() {
            if definition.variable(variable).is_none() {
                return Err(ResearchError::InvalidDefinition(format!(
                    "criterion '{}' references unknown variable '{}'",
                    criterion.describe(),
                    variable
                )));
            }
        }
        match criterion {
            Criterion::HasFlag { flag } if flag.trim().is_empty() => {
                return Err(ResearchError::InvalidDefinition(
                    "flag criterion with empty flag name".to_string(),
                ));
            }
            Criterion::MinObservations { count: 0, variable } => {
                return Err(ResearchError::InvalidDefinition(format!(
                    "minimum observation count for '{}' must be positive",
                    variable
                )));
            }
            _ => {}
        }
    }

    let min_age = definition
        .inclusion
        .iter()
        .filter_map(|c| match c {
            Criterion::MinAge { years } => Some(*years),
            _ => None,
        })
        .max();
    let max_age = definition
        .inclusion
        .iter()
        .filter_map(|c| match c {
            Criterion::MaxAge { years } => Some(*years),
            _ => None,
        })
        .min();
    if let (Some(min), Some(max)) = (min_age, max_age) {
        if min > max {
            return Err(ResearchError::InvalidDefinition(format!(
                "age range is empty ({} > {})",
                min, max
            )));
        }
    }

    if let Some(window) = &definition.enrollment_window {
        if window.end.is_some_and(|end| end <= window.start) {
            return Err(ResearchError::InvalidDefinition(
                "enrollment window ends before it starts".to_string(),
            ));
        }
    }

    Ok(())
}
