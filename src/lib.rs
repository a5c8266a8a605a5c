//! Cohort Lens - De-identified longitudinal cohorts and lag-correlation analysis
//!
//! Cohort Lens turns identifiable longitudinal care data into pseudonymized,
//! analysis-ready cohorts and searches for time-lagged associations between
//! behavioral signals and clinical outcome scores: study registration → cohort
//! build → anonymization → lag-correlation sweep → study report.
//!
//! ## Modules
//!
//! - **Statistical Methods** ([`stats`]): correlation, significance tests, descriptive aggregates
//! - **Cohort Builder** ([`cohort`], [`criteria`]): study registration and membership
//! - **Anonymization** ([`anonymize`]): study-scoped pseudonyms, order-preserving observations
//! - **Longitudinal Analysis** ([`longitudinal`]): lag sweep, trend, change points
//! - **Research Engine** ([`engine`]): lifecycle state machine over a [`store::ResearchStore`]

pub mod anonymize;
pub mod catalog;
pub mod cohort;
pub mod config;
pub mod control;
pub mod criteria;
pub mod engine;
pub mod error;
pub mod longitudinal;
pub mod report;
pub mod stats;
pub mod store;
pub mod types;

pub use catalog::{StudyTemplate, PRECONFIGURED_STUDIES};
pub use config::{AnalysisOptions, PairingRule, ResearchConfig};
pub use control::{CancellationToken, Progress, ProgressSink, RunContext};
pub use engine::{CollectionSummary, ResearchEngine};
pub use error::ResearchError;
pub use store::{MemoryStore, ResearchStore, StoreError};

/// Engine version embedded in every study report
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for study reports
pub const PRODUCER_NAME: &str = "cohort-lens";
