//! Configuration
//!
//! Deployment-wide defaults for collection and analysis, loadable from JSON, plus
//! per-call overrides that are resolved into concrete analysis settings.

use crate::error::ResearchError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default collection window from each subject's enrollment (days)
pub const DEFAULT_COLLECTION_WINDOW_DAYS: u32 = 180;

/// Default per-lag significance threshold
pub const DEFAULT_SIGNIFICANCE_THRESHOLD: f64 = 0.05;

/// Minimum pooled pairs before a lag may be called significant
pub const DEFAULT_MIN_SAMPLE_SIZE: usize = 10;

/// Default timestamp matching tolerance (minutes, applied on both sides)
pub const DEFAULT_MATCH_TOLERANCE_MINUTES: i64 = 12 * 60;

/// Largest lag offset a sweep may request (ten years)
pub const MAX_LAG_DAYS: u32 = 3650;

/// Largest timestamp matching tolerance (minutes); one window may not exceed the lag span
pub const MAX_MATCH_TOLERANCE_MINUTES: i64 = MAX_LAG_DAYS as i64 * 24 * 60;

/// Default number of worker threads for per-subject and per-lag work
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Fewest subjects with both variables observed for an analysis to proceed
pub const MIN_COMPARABLE_SUBJECTS: usize = 2;

/// How an X observation picks its Y partner after the lag shift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingRule {
    /// Closest Y observation to the shifted X timestamp, in either direction
    #[default]
    Nearest,
    /// Earliest Y observation at or after the shifted X timestamp
    FirstAtOrAfter,
}

impl PairingRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingRule::Nearest => "nearest",
            PairingRule::FirstAtOrAfter => "first_at_or_after",
        }
    }
}

/// Deployment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub collection_window_days: u32,
    pub significance_threshold: f64,
    pub min_sample_size: usize,
    pub match_tolerance_minutes: i64,
    pub pairing_rule: PairingRule,
    pub concurrency: usize,
    /// Secret mixed into every pseudonym; changing it breaks pseudonym continuity
    pub collection_salt: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            collection_window_days: DEFAULT_COLLECTION_WINDOW_DAYS,
            significance_threshold: DEFAULT_SIGNIFICANCE_THRESHOLD,
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            match_tolerance_minutes: DEFAULT_MATCH_TOLERANCE_MINUTES,
            pairing_rule: PairingRule::default(),
            concurrency: DEFAULT_CONCURRENCY,
            collection_salt: "cohort-lens-default-salt".to_string(),
        }
    }
}

impl ResearchConfig {
    /// Load configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ResearchError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ResearchError> {
        let json = fs::read_to_string(path)
            .map_err(|e| ResearchError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ResearchError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ResearchError> {
        if self.collection_window_days == 0 {
            return Err(ResearchError::Config(
                "collection_window_days must be positive".to_string(),
            ));
        }
        if self.collection_salt.is_empty() {
            return Err(ResearchError::Config(
                "collection_salt must not be empty".to_string(),
            ));
        }
        self.analysis_settings(&AnalysisOptions::default())
            .map(|_| ())
    }

    /// Resolve per-call overrides against the configured defaults
    pub fn analysis_settings(
        &self,
        options: &AnalysisOptions,
    ) -> Result<AnalysisSettings, ResearchError> {
        let settings = AnalysisSettings {
            significance_threshold: options
                .significance_threshold
                .unwrap_or(self.significance_threshold),
            min_sample_size: options.min_sample_size.unwrap_or(self.min_sample_size),
            match_tolerance_minutes: options
                .match_tolerance_minutes
                .unwrap_or(self.match_tolerance_minutes),
            pairing_rule: options.pairing_rule.unwrap_or(self.pairing_rule),
            concurrency: options.concurrency.unwrap_or(self.concurrency),
        };

        settings.validate()?;
        Ok(settings)
    }
}

/// Reject lag sweeps wider than [`MAX_LAG_DAYS`]
pub fn validate_max_lag(max_lag_days: u32) -> Result<(), ResearchError> {
    if max_lag_days > MAX_LAG_DAYS {
        return Err(ResearchError::Config(format!(
            "max lag must be at most {} days, got {}",
            MAX_LAG_DAYS, max_lag_days
        )));
    }
    Ok(())
}

/// Per-call overrides; `None` keeps the configured value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    pub significance_threshold: Option<f64>,
    pub min_sample_size: Option<usize>,
    pub match_tolerance_minutes: Option<i64>,
    pub pairing_rule: Option<PairingRule>,
    pub concurrency: Option<usize>,
}

/// Concrete settings used by one analysis call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub significance_threshold: f64,
    pub min_sample_size: usize,
    pub match_tolerance_minutes: i64,
    pub pairing_rule: PairingRule,
    pub concurrency: usize,
}

impl AnalysisSettings {
    pub fn validate(&self) -> Result<(), ResearchError> {
        if !(self.significance_threshold > 0.0 && self.significance_threshold < 1.0) {
            return Err(ResearchError::Config(format!(
                "significance threshold must be in (0, 1), got {}",
                self.significance_threshold
            )));
        }
        if !(0..=MAX_MATCH_TOLERANCE_MINUTES).contains(&self.match_tolerance_minutes) {
            return Err(ResearchError::Config(format!(
                "match tolerance must be within 0..={} minutes, got {}",
                MAX_MATCH_TOLERANCE_MINUTES, self.match_tolerance_minutes
            )));
        }
        if self.concurrency == 0 {
            return Err(ResearchError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Matching tolerance; callers validate first, out-of-range values clamp
    pub fn tolerance(&self) -> Duration {
        Duration::minutes(
            self.match_tolerance_minutes
                .clamp(0, MAX_MATCH_TOLERANCE_MINUTES),
        )
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            significance_threshold: DEFAULT_SIGNIFICANCE_THRESHOLD,
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            match_tolerance_minutes: DEFAULT_MATCH_TOLERANCE_MINUTES,
            pairing_rule: PairingRule::Nearest,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResearchConfig::default();
        assert_eq!(config.significance_threshold, 0.05);
        assert_eq!(config.min_sample_size, 10);
        assert_eq!(config.match_tolerance_minutes, 720);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ResearchConfig::from_json(r#"{"min_sample_size": 25}"#).unwrap();
        assert_eq!(config.min_sample_size, 25);
        assert_eq!(config.collection_window_days, DEFAULT_COLLECTION_WINDOW_DAYS);
        assert_eq!(config.pairing_rule, PairingRule::Nearest);
    }

    #[test]
    fn test_overrides_resolve() {
        let config = ResearchConfig::default();
        let options = AnalysisOptions {
            match_tolerance_minutes: Some(30),
            pairing_rule: Some(PairingRule::FirstAtOrAfter),
            ..Default::default()
        };
        let settings = config.analysis_settings(&options).unwrap();
        assert_eq!(settings.tolerance(), Duration::minutes(30));
        assert_eq!(settings.pairing_rule, PairingRule::FirstAtOrAfter);
        assert_eq!(settings.min_sample_size, 10);
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let config = ResearchConfig::default();
        let options = AnalysisOptions {
            significance_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(
            config.analysis_settings(&options),
            Err(ResearchError::Config(_))
        ));
        assert!(ResearchConfig::from_json(r#"{"collection_salt": ""}"#).is_err());
    }

    #[test]
    fn test_tolerance_beyond_lag_span_rejected() {
        let config = ResearchConfig::default();
        for minutes in [i64::MAX, MAX_MATCH_TOLERANCE_MINUTES + 1, -1] {
            let options = AnalysisOptions {
                match_tolerance_minutes: Some(minutes),
                ..Default::default()
            };
            assert!(matches!(
                config.analysis_settings(&options),
                Err(ResearchError::Config(_))
            ));
        }

        let widest = AnalysisOptions {
            match_tolerance_minutes: Some(MAX_MATCH_TOLERANCE_MINUTES),
            ..Default::default()
        };
        let settings = config.analysis_settings(&widest).unwrap();
        assert_eq!(settings.tolerance(), Duration::days(i64::from(MAX_LAG_DAYS)));

        let unchecked = AnalysisSettings {
            match_tolerance_minutes: i64::MAX,
            ..Default::default()
        };
        assert_eq!(unchecked.tolerance(), Duration::days(i64::from(MAX_LAG_DAYS)));
    }

    #[test]
    fn test_max_lag_bound() {
        assert!(validate_max_lag(0).is_ok());
        assert!(validate_max_lag(MAX_LAG_DAYS).is_ok());
        assert!(matches!(
            validate_max_lag(MAX_LAG_DAYS + 1),
            Err(ResearchError::Config(_))
        ));
        assert!(validate_max_lag(u32::MAX).is_err());
    }
}
