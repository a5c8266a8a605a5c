//! Statistical methods
//!
//! Pure numeric functions used by the longitudinal analysis: descriptive aggregates,
//! Pearson correlation with an exact Student-t significance test, Fisher-z confidence
//! intervals, simple linear regression, two-sample t-test and effect sizes.
//!
//! Functions return `None` when a statistic is undefined for the input (empty samples,
//! mismatched lengths, zero variance) rather than inventing a value.

use serde::{Deserialize, Serialize};

/// Arithmetic mean
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (n - 1 denominator)
pub fn variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(sum_sq / (values.len() - 1) as f64)
}

/// Sample standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    variance(values).map(f64::sqrt)
}

/// Median
pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Percentile in `0..=100` with linear interpolation between closest ranks
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let index = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let weight = index - lower as f64;
    Some(sorted[lower] * (1.0 - weight) + sorted[upper] * weight)
}

/// Pearson correlation coefficient
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mean_x = mean(x)?;
    let mean_y = mean(y)?;

    let mut numerator = 0.0;
    let mut sum_sq_x = 0.0;
    let mut sum_sq_y = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        numerator += dx * dy;
        sum_sq_x += dx * dx;
        sum_sq_y += dy * dy;
    }

    let denominator = (sum_sq_x * sum_sq_y).sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return None;
    }
    Some((numerator / denominator).clamp(-1.0, 1.0))
}

/// Two-sided p-value for H0: rho = 0 given sample correlation `r` over `n` pairs
pub fn correlation_p_value(r: f64, n: usize) -> f64 {
    if n < 3 || !r.is_finite() {
        return 1.0;
    }
    if r.abs() >= 1.0 {
        return 0.0;
    }
    let df = (n - 2) as f64;
    let t = r * (df / (1.0 - r * r)).sqrt();
    student_t_two_sided_p(t, df)
}

/// Two-sided tail probability `P(|T| >= |t|)` for Student's t with `df` degrees of freedom
pub fn student_t_two_sided_p(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    if df <= 0.0 {
        return 1.0;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(x, df / 2.0, 0.5).clamp(0.0, 1.0)
}

/// Fisher-z confidence interval for a correlation coefficient
pub fn correlation_confidence_interval(r: f64, n: usize, confidence: f64) -> Option<(f64, f64)> {
    if n < 4 || !r.is_finite() {
        return None;
    }
    if r.abs() >= 1.0 {
        return Some((r, r));
    }
    let z_r = r.atanh();
    let se = 1.0 / ((n - 3) as f64).sqrt();
    let z = z_for_confidence(confidence);
    Some(((z_r - z * se).tanh(), (z_r + z * se).tanh()))
}

/// Two-sided critical z value for common confidence levels (defaults to 95%)
pub fn z_for_confidence(confidence: f64) -> f64 {
    const TABLE: [(f64, f64); 6] = [
        (0.80, 1.281_551_6),
        (0.90, 1.644_853_6),
        (0.95, 1.959_964_0),
        (0.98, 2.326_347_9),
        (0.99, 2.575_829_3),
        (0.999, 3.290_526_7),
    ];
    TABLE
        .iter()
        .find(|(level, _)| (level - confidence).abs() < 1e-9)
        .map(|(_, z)| *z)
        .unwrap_or(1.959_964_0)
}

/// Correlation with its significance test, NaN-filled when undefined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationTest {
    pub coefficient: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub n: usize,
}

impl CorrelationTest {
    /// Run Pearson correlation and its two-sided test over paired samples
    pub fn run(x: &[f64], y: &[f64]) -> Self {
        let n = x.len().min(y.len());
        match pearson(x, y) {
            Some(r) => {
                let (ci_lower, ci_upper) =
                    correlation_confidence_interval(r, n, 0.95).unwrap_or((f64::NAN, f64::NAN));
                Self {
                    coefficient: r,
                    p_value: correlation_p_value(r, n),
                    ci_lower,
                    ci_upper,
                    n,
                }
            }
            None => Self {
                coefficient: f64::NAN,
                p_value: 1.0,
                ci_lower: f64::NAN,
                ci_upper: f64::NAN,
                n,
            },
        }
    }
}

/// Least-squares line `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

/// Simple linear regression
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mean_x = mean(x)?;
    let mean_y = mean(y)?;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        numerator += dx * (yi - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        return None;
    }

    let slope = numerator / denominator;
    let intercept = mean_y - slope * mean_x;

    let mut ss_total = 0.0;
    let mut ss_residual = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let predicted = slope * xi + intercept;
        ss_total += (yi - mean_y).powi(2);
        ss_residual += (yi - predicted).powi(2);
    }
    // A flat response is fit perfectly by a flat line
    let r_squared = if ss_total == 0.0 {
        1.0
    } else {
        1.0 - ss_residual / ss_total
    };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

/// Result of an independent two-sample t-test (pooled variance)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TTestResult {
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
}

/// Independent two-sample Student t-test
pub fn t_test(group1: &[f64], group2: &[f64]) -> Option<TTestResult> {
    let n1 = group1.len();
    let n2 = group2.len();
    if n1 < 2 || n2 < 2 {
        return None;
    }
    let pooled = pooled_variance(group1, group2)?;
    let se = (pooled * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    if se == 0.0 {
        return None;
    }
    let t = (mean(group1)? - mean(group2)?) / se;
    let df = (n1 + n2 - 2) as f64;
    Some(TTestResult {
        t_statistic: t,
        degrees_of_freedom: df,
        p_value: student_t_two_sided_p(t, df),
    })
}

/// Cohen's d using the pooled standard deviation
pub fn cohens_d(group1: &[f64], group2: &[f64]) -> Option<f64> {
    let pooled_sd = pooled_variance(group1, group2)?.sqrt();
    if pooled_sd == 0.0 {
        return None;
    }
    Some((mean(group1)? - mean(group2)?) / pooled_sd)
}

fn pooled_variance(group1: &[f64], group2: &[f64]) -> Option<f64> {
    let n1 = group1.len() as f64;
    let n2 = group2.len() as f64;
    let v1 = variance(group1)?;
    let v2 = variance(group2)?;
    Some(((n1 - 1.0) * v1 + (n2 - 1.0) * v2) / (n1 + n2 - 2.0))
}

/// Conventional magnitude bands for Cohen's d
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSize {
    Negligible,
    Small,
    Medium,
    Large,
}

impl EffectSize {
    pub fn from_cohens_d(d: f64) -> Self {
        let abs_d = d.abs();
        if abs_d < 0.2 {
            EffectSize::Negligible
        } else if abs_d < 0.5 {
            EffectSize::Small
        } else if abs_d < 0.8 {
            EffectSize::Medium
        } else {
            EffectSize::Large
        }
    }
}

/// Natural log of the gamma function (Lanczos approximation, g = 7)
fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    let pi = std::f64::consts::PI;

    if x < 0.5 {
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut a = COEF[0];
    for (i, c) in COEF.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    let t = x + G + 0.5;
    0.5 * (2.0 * pi).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

/// Regularized incomplete beta function `I_x(a, b)`
fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    // The continued fraction converges fastest on this side of the mode
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

/// Modified Lentz evaluation of the incomplete beta continued fraction
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITERATIONS: usize = 300;
    const EPSILON: f64 = 1e-15;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptive_aggregates() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), Some(5.0));
        // Sample variance: sum of squares 32 over 7
        assert!((variance(&values).unwrap() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(median(&values), Some(4.5));
        assert_eq!(percentile(&values, 0.0), Some(2.0));
        assert_eq!(percentile(&values, 100.0), Some(9.0));
        assert!((percentile(&[1.0, 2.0, 3.0, 4.0], 25.0).unwrap() - 1.75).abs() < 1e-12);

        assert_eq!(mean(&[]), None);
        assert_eq!(variance(&[1.0]), None);
        assert_eq!(percentile(&values, 101.0), None);
    }

    #[test]
    fn test_pearson_perfect_and_undefined() {
        assert_eq!(pearson(&[1.0, 2.0], &[10.0, 20.0]), Some(1.0));
        let r = pearson(&[1.0, 2.0, 3.0, 4.0], &[8.0, 6.0, 4.0, 2.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-12);

        // Zero variance in one variable
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
        assert_eq!(pearson(&[1.0, 2.0], &[1.0]), None);
        assert_eq!(pearson(&[], &[]), None);
    }

    #[test]
    fn test_student_t_tail_probabilities() {
        // Cauchy (df = 1): P(|T| > 1) = 0.5
        assert!((student_t_two_sided_p(1.0, 1.0) - 0.5).abs() < 1e-9);
        // Critical value for alpha = 0.05 at df = 10
        assert!((student_t_two_sided_p(2.228_138_9, 10.0) - 0.05).abs() < 1e-5);
        // Critical value for alpha = 0.01 at df = 30
        assert!((student_t_two_sided_p(2.749_995_7, 30.0) - 0.01).abs() < 1e-5);
        assert!((student_t_two_sided_p(0.0, 5.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_correlation_p_value() {
        assert_eq!(correlation_p_value(0.9, 2), 1.0);
        assert_eq!(correlation_p_value(1.0, 10), 0.0);
        assert!((correlation_p_value(0.0, 20) - 1.0).abs() < 1e-12);

        // r = 0.632 with n = 10 sits right at p ~= 0.05
        let p = correlation_p_value(0.6319, 10);
        assert!((p - 0.05).abs() < 0.001);
    }

    #[test]
    fn test_confidence_interval_brackets_r() {
        let (lower, upper) = correlation_confidence_interval(0.5, 50, 0.95).unwrap();
        assert!(lower < 0.5 && 0.5 < upper);
        assert!((lower - 0.257).abs() < 0.01);
        assert!((upper - 0.684).abs() < 0.01);
        assert_eq!(correlation_confidence_interval(0.5, 3, 0.95), None);
    }

    #[test]
    fn test_correlation_test_undefined_is_nan() {
        let test = CorrelationTest::run(&[], &[]);
        assert!(test.coefficient.is_nan());
        assert_eq!(test.p_value, 1.0);
        assert_eq!(test.n, 0);
    }

    #[test]
    fn test_linear_regression() {
        let fit = linear_regression(&[0.0, 1.0, 2.0, 3.0], &[1.0, 3.0, 5.0, 7.0]).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert_eq!(linear_regression(&[1.0, 1.0], &[2.0, 3.0]), None);
    }

    #[test]
    fn test_t_test_and_effect_size() {
        let a = [5.0, 6.0, 7.0, 5.5, 6.5];
        let b = [8.0, 9.0, 10.0, 8.5, 9.5];
        let result = t_test(&a, &b).unwrap();
        assert!(result.t_statistic < 0.0);
        assert_eq!(result.degrees_of_freedom, 8.0);
        assert!(result.p_value < 0.001);

        let d = cohens_d(&a, &b).unwrap();
        assert!(d < -0.8);
        assert_eq!(EffectSize::from_cohens_d(d), EffectSize::Large);
        assert_eq!(EffectSize::from_cohens_d(0.3), EffectSize::Small);
        assert_eq!(EffectSize::from_cohens_d(-0.1), EffectSize::Negligible);

        assert!(t_test(&[1.0], &b).is_none());
    }
}
