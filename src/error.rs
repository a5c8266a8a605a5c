//! Error types for Cohort Lens

use crate::types::Phase;
use thiserror::Error;

/// Errors that can occur while running a study through the research pipeline
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Study already registered: {0}")]
    DuplicateStudy(String),

    #[error("Invalid study definition: {0}")]
    InvalidDefinition(String),

    #[error("Study not found: {0}")]
    StudyNotFound(String),

    #[error("No subjects qualify for study {0}")]
    EmptyCohort(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Phase {phase} not allowed for study {study} in status {status}")]
    PhaseOrder {
        study: String,
        phase: Phase,
        status: String,
    },

    #[error("Store error during {phase}: {detail}")]
    Store { phase: Phase, detail: String },

    #[error("Failed to fetch records for subject {subject} during {phase}: {detail}")]
    SubjectFetch {
        phase: Phase,
        subject: String,
        detail: String,
    },

    #[error("{phase} cancelled")]
    Cancelled { phase: Phase },

    #[error("{phase} exceeded its deadline")]
    DeadlineExceeded { phase: Phase },

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResearchError {
    /// Transient failures the caller may retry with backoff.
    ///
    /// Validation and state errors need a changed request instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResearchError::Store { .. }
                | ResearchError::SubjectFetch { .. }
                | ResearchError::DeadlineExceeded { .. }
        )
    }

    /// Phase the error was raised in, when it is tied to one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            ResearchError::PhaseOrder { phase, .. }
            | ResearchError::Store { phase, .. }
            | ResearchError::SubjectFetch { phase, .. }
            | ResearchError::Cancelled { phase }
            | ResearchError::DeadlineExceeded { phase } => Some(*phase),
            _ => None,
        }
    }

    pub(crate) fn store(phase: Phase, detail: impl Into<String>) -> Self {
        ResearchError::Store {
            phase,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ResearchError::store(Phase::Collection, "connection reset").is_retryable());
        assert!(ResearchError::DeadlineExceeded {
            phase: Phase::Analysis
        }
        .is_retryable());
        assert!(!ResearchError::DuplicateStudy("EVA-1".to_string()).is_retryable());
        assert!(!ResearchError::EmptyCohort("EVA-1".to_string()).is_retryable());
        assert!(!ResearchError::Cancelled {
            phase: Phase::Analysis
        }
        .is_retryable());
    }

    #[test]
    fn test_fetch_error_names_subject_and_phase() {
        let err = ResearchError::SubjectFetch {
            phase: Phase::Anonymization,
            subject: "subject-42".to_string(),
            detail: "timeout".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("subject-42"));
        assert!(message.contains("anonymization"));
        assert_eq!(err.phase(), Some(Phase::Anonymization));
    }
}
