//! Longitudinal analysis
//!
//! Lag-correlation sweep between two variables over anonymized observations, plus
//! pooled trend estimation and per-pseudonym change-point detection.
//!
//! For a lag `L`, every X observation at `t` is paired with a Y observation near
//! `t + L days` (see [`PairingRule`]); pairs from all subjects are pooled and
//! correlated. Unmatched X observations are dropped for that lag.

use crate::config::{validate_max_lag, AnalysisSettings, PairingRule, MIN_COMPARABLE_SUBJECTS};
use crate::control::{worker_pool, RunContext};
use crate::error::ResearchError;
use crate::stats::{self, CorrelationTest};
use crate::types::{LagCorrelationResult, Observation, Phase, Pseudonym};
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Parameters of one lag sweep
#[derive(Debug, Clone, PartialEq)]
pub struct LagRequest<'a> {
    pub run_id: Uuid,
    pub study_code: &'a str,
    pub variable_x: &'a str,
    pub variable_y: &'a str,
    pub max_lag_days: u32,
}

/// Per-lag results of a sweep and the subject counts behind them
#[derive(Debug, Clone, PartialEq)]
pub struct LagSweep {
    /// Exactly `max_lag_days + 1` entries, ordered by lag
    pub results: Vec<LagCorrelationResult>,
    pub best_lag: Option<LagCorrelationResult>,
    pub subjects_with_x: usize,
    pub subjects_with_y: usize,
    pub subjects_compared: usize,
    /// Lags with no usable correlation (no pairs or zero variance)
    pub degenerate_lags: usize,
}

type Point = (DateTime<Utc>, f64);

/// One subject's X and Y series, each in timestamp then source order
#[derive(Debug, Default)]
struct PairedSeries {
    x: Vec<Point>,
    y: Vec<Point>,
}

/// Sweep lags `0..=max_lag_days` over one collection's observations
pub fn run_lag_analysis(
    observations: &[Observation],
    request: &LagRequest<'_>,
    settings: &AnalysisSettings,
    ctx: &RunContext,
) -> Result<LagSweep, ResearchError> {
    validate_max_lag(request.max_lag_days)?;
    settings.validate()?;
    let pool = worker_pool(settings.concurrency)?;

    let mut by_subject: BTreeMap<&Pseudonym, Vec<&Observation>> = BTreeMap::new();
    for observation in observations {
        if observation.variable == request.variable_x || observation.variable == request.variable_y
        {
            by_subject
                .entry(&observation.pseudonym)
                .or_default()
                .push(observation);
        }
    }

    let subjects: Vec<(&Pseudonym, Vec<&Observation>)> = by_subject.into_iter().collect();
    let extraction = ctx.counter(Phase::Analysis, subjects.len());
    let series: Vec<PairedSeries> = pool.install(|| {
        subjects
            .par_iter()
            .map(|(_, rows)| {
                ctx.checkpoint(Phase::Analysis)?;
                let series = extract_series(rows, request.variable_x, request.variable_y);
                extraction.tick();
                Ok(series)
            })
            .collect::<Result<Vec<_>, ResearchError>>()
    })?;

    let subjects_with_x = series.iter().filter(|s| !s.x.is_empty()).count();
    let subjects_with_y = series.iter().filter(|s| !s.y.is_empty()).count();
    let comparable: Vec<PairedSeries> = series
        .into_iter()
        .filter(|s| !s.x.is_empty() && !s.y.is_empty())
        .collect();

    if comparable.len() < MIN_COMPARABLE_SUBJECTS {
        return Err(ResearchError::InsufficientData(format!(
            "{} subject(s) have both {} and {} observed in study {}; at least {} required",
            comparable.len(),
            request.variable_x,
            request.variable_y,
            request.study_code,
            MIN_COMPARABLE_SUBJECTS
        )));
    }

    let lags: Vec<u32> = (0..=request.max_lag_days).collect();
    let results: Vec<LagCorrelationResult> = pool.install(|| {
        lags.par_iter()
            .map(|&lag| {
                ctx.checkpoint(Phase::Analysis)?;
                Ok(correlate_lag(&comparable, lag, request, settings))
            })
            .collect::<Result<Vec<_>, ResearchError>>()
    })?;

    let degenerate_lags = results.iter().filter(|r| r.coefficient.is_nan()).count();
    let best_lag = select_best_lag(&results).cloned();

    match &best_lag {
        Some(best) => info!(
            study = %request.study_code,
            x = %request.variable_x,
            y = %request.variable_y,
            lag = best.lag_days,
            r = best.coefficient,
            p = best.p_value,
            n = best.sample_size,
            "best lag found"
        ),
        None => info!(
            study = %request.study_code,
            x = %request.variable_x,
            y = %request.variable_y,
            lags = results.len(),
            "no significant lag"
        ),
    }

    Ok(LagSweep {
        results,
        best_lag,
        subjects_with_x,
        subjects_with_y,
        subjects_compared: comparable.len(),
        degenerate_lags,
    })
}

fn extract_series(rows: &[&Observation], variable_x: &str, variable_y: &str) -> PairedSeries {
    let mut x: Vec<&Observation> = rows.iter().copied().filter(|o| o.variable == variable_x).collect();
    let mut y: Vec<&Observation> = rows.iter().copied().filter(|o| o.variable == variable_y).collect();
    x.sort_by_key(|o| (o.timestamp, o.sequence));
    y.sort_by_key(|o| (o.timestamp, o.sequence));

    PairedSeries {
        x: x.iter().map(|o| (o.timestamp, o.value)).collect(),
        y: y.iter().map(|o| (o.timestamp, o.value)).collect(),
    }
}

fn correlate_lag(
    subjects: &[PairedSeries],
    lag: u32,
    request: &LagRequest<'_>,
    settings: &AnalysisSettings,
) -> LagCorrelationResult {
    let shift = Duration::days(i64::from(lag));
    let tolerance = settings.tolerance();
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut contributing = 0;

    for subject in subjects {
        let before = xs.len();
        for &(timestamp, x_value) in &subject.x {
            // A shift past the representable range matches nothing
            let Some(target) = timestamp.checked_add_signed(shift) else {
                continue;
            };
            if let Some(y_value) = match_y(&subject.y, target, tolerance, settings.pairing_rule) {
                xs.push(x_value);
                ys.push(y_value);
            }
        }
        if xs.len() > before {
            contributing += 1;
        }
    }

    let test = CorrelationTest::run(&xs, &ys);
    let significant = test.coefficient.is_finite()
        && test.n >= settings.min_sample_size
        && test.p_value < settings.significance_threshold;

    debug!(
        study = %request.study_code,
        lag,
        n = test.n,
        r = test.coefficient,
        p = test.p_value,
        significant,
        "lag tested"
    );

    LagCorrelationResult {
        run_id: request.run_id,
        study_code: request.study_code.to_string(),
        variable_x: request.variable_x.to_string(),
        variable_y: request.variable_y.to_string(),
        lag_days: lag,
        coefficient: test.coefficient,
        p_value: test.p_value,
        ci_lower: test.ci_lower,
        ci_upper: test.ci_upper,
        sample_size: test.n,
        subjects: contributing,
        significant,
    }
}

/// Pick the Y value paired with a shifted X timestamp, if any lies within tolerance
fn match_y(
    ys: &[Point],
    target: DateTime<Utc>,
    tolerance: Duration,
    rule: PairingRule,
) -> Option<f64> {
    let after = ys.partition_point(|(t, _)| *t < target);

    match rule {
        PairingRule::FirstAtOrAfter => ys
            .get(after)
            .filter(|(t, _)| *t - target <= tolerance)
            .map(|(_, v)| *v),
        PairingRule::Nearest => {
            // First of the run of equal timestamps just before the target
            let before = after.checked_sub(1).map(|last| {
                let t = ys[last].0;
                ys.partition_point(|(u, _)| *u < t)
            });

            let before = before
                .map(|i| ys[i])
                .filter(|(t, _)| target - *t <= tolerance);
            let after = ys.get(after).copied().filter(|(t, _)| *t - target <= tolerance);

            match (before, after) {
                (Some(b), Some(a)) => {
                    // Ties go to the earlier observation
                    if a.0 - target < target - b.0 {
                        Some(a.1)
                    } else {
                        Some(b.1)
                    }
                }
                (Some(b), None) => Some(b.1),
                (None, Some(a)) => Some(a.1),
                (None, None) => None,
            }
        }
    }
}

/// Lowest p-value among significant lags; ties by larger |r|, then smaller lag
pub fn select_best_lag(results: &[LagCorrelationResult]) -> Option<&LagCorrelationResult> {
    results
        .iter()
        .filter(|r| r.significant)
        .min_by(|a, b| {
            a.p_value
                .partial_cmp(&b.p_value)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.coefficient
                        .abs()
                        .partial_cmp(&a.coefficient.abs())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.lag_days.cmp(&b.lag_days))
        })
}

/// Direction of a fitted trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

impl TrendDirection {
    pub fn from_slope(slope: f64) -> Self {
        if slope > 0.0 {
            TrendDirection::Increasing
        } else if slope < 0.0 {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        }
    }
}

/// Pooled linear trend of a variable against days since each subject's first observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub variable: String,
    pub slope_per_day: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub direction: TrendDirection,
    pub points: usize,
    pub subjects: usize,
}

/// Fit a pooled trend for one variable.
///
/// Fails with `InsufficientData` when fewer than two points exist or all points fall
/// on the same day.
pub fn calculate_trend(
    observations: &[Observation],
    variable: &str,
) -> Result<TrendAnalysis, ResearchError> {
    let series = series_by_pseudonym(observations, variable);
    let mut days = Vec::new();
    let mut values = Vec::new();
    for points in series.values() {
        let Some(&(first, _)) = points.first() else {
            continue;
        };
        for &(timestamp, value) in points {
            days.push(days_between(first, timestamp));
            values.push(value);
        }
    }

    let fit = stats::linear_regression(&days, &values).ok_or_else(|| {
        ResearchError::InsufficientData(format!(
            "cannot fit a trend for {} over {} point(s)",
            variable,
            values.len()
        ))
    })?;

    Ok(TrendAnalysis {
        variable: variable.to_string(),
        slope_per_day: fit.slope,
        intercept: fit.intercept,
        r_squared: fit.r_squared,
        direction: TrendDirection::from_slope(fit.slope),
        points: values.len(),
        subjects: series.len(),
    })
}

/// Minimum points in a series before change points are looked for
pub const MIN_CHANGE_POINT_SERIES: usize = 5;

/// An abrupt change between consecutive observations of one pseudonym
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePoint {
    pub pseudonym: Pseudonym,
    pub variable: String,
    pub timestamp: DateTime<Utc>,
    /// Whole days since the pseudonym's first observation of the variable
    pub day: i64,
    pub value_before: f64,
    pub value_after: f64,
    pub percent_change: f64,
}

/// Consecutive changes whose magnitude exceeds `threshold_percent`.
///
/// Series shorter than [`MIN_CHANGE_POINT_SERIES`] are ignored, and so are steps
/// from a zero value where a percentage is undefined.
pub fn detect_change_points(
    observations: &[Observation],
    variable: &str,
    threshold_percent: f64,
) -> Vec<ChangePoint> {
    let mut change_points = Vec::new();

    for (pseudonym, points) in series_by_pseudonym(observations, variable) {
        if points.len() < MIN_CHANGE_POINT_SERIES {
            continue;
        }
        let first = points[0].0;
        for pair in points.windows(2) {
            let (_, before) = pair[0];
            let (timestamp, after) = pair[1];
            if before == 0.0 {
                continue;
            }
            let percent_change = (after - before) / before * 100.0;
            if percent_change.abs() > threshold_percent {
                change_points.push(ChangePoint {
                    pseudonym: pseudonym.clone(),
                    variable: variable.to_string(),
                    timestamp,
                    day: (timestamp - first).num_days(),
                    value_before: before,
                    value_after: after,
                    percent_change,
                });
            }
        }
    }

    debug!(variable, count = change_points.len(), threshold_percent, "change points detected");
    change_points
}

fn series_by_pseudonym<'a>(
    observations: &'a [Observation],
    variable: &str,
) -> BTreeMap<&'a Pseudonym, Vec<Point>> {
    let mut rows: BTreeMap<&Pseudonym, Vec<&Observation>> = BTreeMap::new();
    for observation in observations.iter().filter(|o| o.variable == variable) {
        rows.entry(&observation.pseudonym)
            .or_default()
            .push(observation);
    }
    rows.into_iter()
        .map(|(pseudonym, mut rows)| {
            rows.sort_by_key(|o| (o.timestamp, o.sequence));
            (pseudonym, rows.iter().map(|o| (o.timestamp, o.value)).collect())
        })
        .collect()
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 86_400.0
}
