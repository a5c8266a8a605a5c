//! Study reports
//!
//! A report is derived on demand from the study record and its persisted analysis
//! runs. Only the latest run of each variable pair is considered, and its best lag
//! is surfaced only when it beats the Bonferroni-adjusted threshold
//! `alpha / (max_lag_days + 1)`.

use crate::types::{
    AnalysisRun, AnalysisSummary, LagCorrelationResult, MetadataKey, MetadataValue,
    ReportFinding, Study, StudyReport,
};
use crate::{ENGINE_VERSION, PRODUCER_NAME};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Latest run per (X, Y) pair, ordered by pair
pub fn latest_runs(runs: &[AnalysisRun]) -> Vec<&AnalysisRun> {
    let mut latest: BTreeMap<(&str, &str), &AnalysisRun> = BTreeMap::new();
    for run in runs {
        latest.insert((run.variable_x.as_str(), run.variable_y.as_str()), run);
    }
    latest.into_values().collect()
}

/// Threshold the run was analyzed with, falling back to `default`
pub fn run_significance_threshold(run: &AnalysisRun, default: f64) -> f64 {
    match run.metadata.get(MetadataKey::SignificanceThreshold) {
        Some(MetadataValue::Number(alpha)) => *alpha,
        _ => default,
    }
}

/// Compose the report for a study from its runs (in append order)
pub fn compose_report(
    study: &Study,
    cohort_size: usize,
    runs: &[AnalysisRun],
    default_threshold: f64,
    generated_at: DateTime<Utc>,
) -> StudyReport {
    let current_build = study.cohort_build.as_ref().map(|b| b.build_id);
    let mut analyses = Vec::new();
    let mut findings = Vec::new();

    for run in latest_runs(runs) {
        let current = current_build == Some(run.cohort_build_id);
        analyses.push(AnalysisSummary {
            run_id: run.run_id,
            variable_x: run.variable_x.clone(),
            variable_y: run.variable_y.clone(),
            max_lag_days: run.max_lag_days,
            lags_significant_raw: run.results.iter().filter(|r| r.significant).count(),
            completed_at: run.completed_at,
            current,
        });

        // Runs against a superseded cohort build are listed but not reported on
        if !current {
            continue;
        }
        if let Some(best) = &run.best_lag {
            let threshold =
                run.bonferroni_threshold(run_significance_threshold(run, default_threshold));
            if best.p_value < threshold {
                findings.push(ReportFinding {
                    result: best.clone(),
                    bonferroni_threshold: threshold,
                });
            }
        }
    }

    StudyReport {
        study_code: study.code().to_string(),
        study_name: study.definition.name.clone(),
        hypothesis: study.definition.hypothesis.clone(),
        status: study.status,
        cohort_size,
        cohort_build_id: current_build,
        significant_findings: findings,
        analyses,
        generated_at,
        producer: PRODUCER_NAME.to_string(),
        producer_version: ENGINE_VERSION.to_string(),
    }
}

/// Per-lag results significant at the raw threshold, from each pair's latest run,
/// ordered by p-value
pub fn significant_results(runs: &[AnalysisRun]) -> Vec<LagCorrelationResult> {
    let mut results: Vec<LagCorrelationResult> = latest_runs(runs)
        .into_iter()
        .flat_map(|run| run.results.iter().filter(|r| r.significant).cloned())
        .collect();
    results.sort_by(|a, b| a.p_value.total_cmp(&b.p_value));
    results
}

/// Plain-text rendering for consoles and logs
pub fn render_text(report: &StudyReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Study {} - {}", report.study_code, report.study_name);
    if !report.hypothesis.is_empty() {
        let _ = writeln!(out, "Hypothesis: {}", report.hypothesis);
    }
    let _ = writeln!(out, "Status: {}", report.status);
    let _ = writeln!(out, "Cohort size: {}", report.cohort_size);
    let _ = writeln!(out, "Generated: {}", report.generated_at.to_rfc3339());

    let _ = writeln!(out, "\nAnalyses:");
    if report.analyses.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for analysis in &report.analyses {
        let _ = writeln!(
            out,
            "  {} -> {}: lags 0..={}, {} significant at raw threshold{}",
            analysis.variable_x,
            analysis.variable_y,
            analysis.max_lag_days,
            analysis.lags_significant_raw,
            if analysis.current { "" } else { " (stale cohort)" }
        );
    }

    let _ = writeln!(out, "\nSignificant findings:");
    if report.significant_findings.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for finding in &report.significant_findings {
        let r = &finding.result;
        let _ = writeln!(
            out,
            "  {} -> {} at lag {}d: r={:.3} (95% CI {:.3}..{:.3}), p={:.2e} < {:.2e}, n={} across {} subjects",
            r.variable_x,
            r.variable_y,
            r.lag_days,
            r.coefficient,
            r.ci_lower,
            r.ci_upper,
            r.p_value,
            finding.bonferroni_threshold,
            r.sample_size,
            r.subjects
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::tests::voice_phq9_definition;
    use crate::types::{CohortBuild, RunMetadata, StudyStatus};
    use uuid::Uuid;

    fn result(lag: u32, r: f64, p: f64, significant: bool) -> LagCorrelationResult {
        LagCorrelationResult {
            run_id: Uuid::nil(),
            study_code: "EVA-REPORT".to_string(),
            variable_x: "voice_pitch_mean".to_string(),
            variable_y: "phq9".to_string(),
            lag_days: lag,
            coefficient: r,
            p_value: p,
            ci_lower: r - 0.1,
            ci_upper: r + 0.1,
            sample_size: 40,
            subjects: 8,
            significant,
        }
    }

    fn run(build_id: Uuid, best_p: f64, max_lag_days: u32) -> AnalysisRun {
        let best = result(3, -0.6, best_p, true);
        AnalysisRun {
            run_id: Uuid::new_v4(),
            study_code: "EVA-REPORT".to_string(),
            variable_x: "voice_pitch_mean".to_string(),
            variable_y: "phq9".to_string(),
            max_lag_days,
            cohort_build_id: build_id,
            collection_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            results: vec![result(0, 0.1, 0.4, false), best.clone()],
            best_lag: Some(best),
            metadata: RunMetadata::default(),
        }
    }

    fn study(build_id: Uuid) -> Study {
        Study {
            definition: voice_phq9_definition("EVA-REPORT"),
            status: StudyStatus::Analyzed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            cohort_build: Some(CohortBuild {
                build_id,
                built_at: Utc::now(),
                size: 8,
            }),
        }
    }

    #[test]
    fn test_bonferroni_gate() {
        let build = Uuid::new_v4();
        // 15 lags tested: threshold is 0.05 / 15
        let passes = run(build, 0.001, 14);
        let fails = run(build, 0.01, 14);

        let report = compose_report(&study(build), 8, &[passes], 0.05, Utc::now());
        assert_eq!(report.significant_findings.len(), 1);
        assert!((report.significant_findings[0].bonferroni_threshold - 0.05 / 15.0).abs() < 1e-12);

        let report = compose_report(&study(build), 8, &[fails], 0.05, Utc::now());
        assert!(report.significant_findings.is_empty());
        assert_eq!(report.analyses[0].lags_significant_raw, 1);
    }

    #[test]
    fn test_latest_run_wins() {
        let build = Uuid::new_v4();
        let old = run(build, 0.001, 14);
        let new = run(build, 0.02, 14);
        let report = compose_report(&study(build), 8, &[old, new.clone()], 0.05, Utc::now());

        assert_eq!(report.analyses.len(), 1);
        assert_eq!(report.analyses[0].run_id, new.run_id);
        assert!(report.significant_findings.is_empty());
    }

    #[test]
    fn test_stale_cohort_runs_not_reported() {
        let stale = run(Uuid::new_v4(), 0.0001, 14);
        let report = compose_report(&study(Uuid::new_v4()), 8, &[stale], 0.05, Utc::now());
        assert!(!report.analyses[0].current);
        assert!(report.significant_findings.is_empty());
        assert!(render_text(&report).contains("stale cohort"));
    }

    #[test]
    fn test_significant_results_sorted_by_p() {
        let build = Uuid::new_v4();
        let mut a = run(build, 0.03, 7);
        a.variable_y = "gad7".to_string();
        let b = run(build, 0.001, 7);

        let results = significant_results(&[a, b]);
        let ps: Vec<f64> = results.iter().map(|r| r.p_value).collect();
        assert_eq!(ps, vec![0.001, 0.03]);
    }
}
