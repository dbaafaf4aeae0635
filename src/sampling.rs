//! Correlated parameter sampling for probabilistic sensitivity analysis.
//!
//! Parameters are declared as independent marginals (normal, log-normal,
//! gamma, beta) optionally tied into named correlation blocks. Each block
//! carries a target correlation matrix whose Cholesky factor is applied to
//! iid standard normals; the correlated normals then pass through each
//! marginal's own inverse-CDF, so the correlation lives at the copula level
//! while the marginal shapes stay exact. Parameters outside every block are
//! drawn independently.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Marginal distributions ───────────────────────────────────────────────────

/// One parameter's marginal. Every variant has closed-form mean and
/// variance so calibration can be checked without sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Marginal {
    Normal { mean: f64, sd: f64 },
    /// Parameterized on the underlying normal, not the observed scale.
    LogNormal { log_mean: f64, log_sd: f64 },
    Gamma { shape: f64, rate: f64 },
    Beta { alpha: f64, beta: f64 },
}

impl Marginal {
    pub fn mean(&self) -> f64 {
        match *self {
            Marginal::Normal { mean, .. } => mean,
            Marginal::LogNormal { log_mean, log_sd } => {
                (log_mean + 0.5 * log_sd * log_sd).exp()
            }
            Marginal::Gamma { shape, rate } => shape / rate,
            Marginal::Beta { alpha, beta } => alpha / (alpha + beta),
        }
    }

    pub fn variance(&self) -> f64 {
        match *self {
            Marginal::Normal { sd, .. } => sd * sd,
            Marginal::LogNormal { log_mean, log_sd } => {
                let s2 = log_sd * log_sd;
                (s2.exp() - 1.0) * (2.0 * log_mean + s2).exp()
            }
            Marginal::Gamma { shape, rate } => shape / (rate * rate),
            Marginal::Beta { alpha, beta } => {
                let total = alpha + beta;
                alpha * beta / (total * total * (total + 1.0))
            }
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason| {
            Err(ConfigError::InvalidMarginal { name: name.to_string(), reason })
        };
        match *self {
            Marginal::Normal { mean, sd } => {
                if !mean.is_finite() || !sd.is_finite() {
                    return invalid("normal parameters must be finite");
                }
                if sd < 0.0 {
                    return invalid("normal sd must be non-negative");
                }
            }
            Marginal::LogNormal { log_mean, log_sd } => {
                if !log_mean.is_finite() || !log_sd.is_finite() {
                    return invalid("log-normal parameters must be finite");
                }
                if log_sd < 0.0 {
                    return invalid("log-normal sd must be non-negative");
                }
            }
            Marginal::Gamma { shape, rate } => {
                if !shape.is_finite() || !rate.is_finite() || shape <= 0.0 || rate <= 0.0 {
                    return invalid("gamma shape and rate must be positive");
                }
            }
            Marginal::Beta { alpha, beta } => {
                if !alpha.is_finite() || !beta.is_finite() || alpha <= 0.0 || beta <= 0.0 {
                    return invalid("beta parameters must be positive");
                }
            }
        }
        Ok(())
    }

    /// Maps one standard-normal coordinate through this marginal. For the
    /// normal and log-normal variants the uniform step cancels analytically;
    /// gamma and beta go through the normal CDF and a numeric quantile.
    fn from_standard_normal(&self, z: f64) -> f64 {
        match *self {
            Marginal::Normal { mean, sd } => mean + sd * z,
            Marginal::LogNormal { log_mean, log_sd } => (log_mean + log_sd * z).exp(),
            Marginal::Gamma { shape, rate } => gamma_quantile(shape, rate, normal_cdf(z)),
            Marginal::Beta { alpha, beta } => beta_quantile(alpha, beta, normal_cdf(z)),
        }
    }
}

// ── Parameter declarations ───────────────────────────────────────────────────

/// A named sampled parameter. The name doubles as the configuration
/// override key the drawn value is applied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub marginal: Marginal,
}

impl ParameterSpec {
    pub fn new(name: &str, marginal: Marginal) -> Result<Self, ConfigError> {
        marginal.validate(name)?;
        Ok(ParameterSpec { name: name.to_string(), marginal })
    }

    pub fn normal(name: &str, mean: f64, sd: f64) -> Result<Self, ConfigError> {
        ParameterSpec::new(name, Marginal::Normal { mean, sd })
    }

    /// Log-normal matched to an observed-scale mean and sd.
    pub fn log_normal_from_moments(name: &str, mean: f64, sd: f64) -> Result<Self, ConfigError> {
        if !(mean > 0.0) || sd < 0.0 {
            return Err(ConfigError::InvalidMarginal {
                name: name.to_string(),
                reason: "log-normal moment matching needs mean > 0 and sd >= 0",
            });
        }
        let s2 = (1.0 + (sd * sd) / (mean * mean)).ln();
        ParameterSpec::new(
            name,
            Marginal::LogNormal { log_mean: mean.ln() - 0.5 * s2, log_sd: s2.sqrt() },
        )
    }

    /// Gamma matched to a mean and sd, the usual shape for cost parameters.
    pub fn gamma_from_moments(name: &str, mean: f64, sd: f64) -> Result<Self, ConfigError> {
        if !(mean > 0.0) || !(sd > 0.0) {
            return Err(ConfigError::InvalidMarginal {
                name: name.to_string(),
                reason: "gamma moment matching needs positive mean and sd",
            });
        }
        let shape = (mean / sd) * (mean / sd);
        let rate = mean / (sd * sd);
        ParameterSpec::new(name, Marginal::Gamma { shape, rate })
    }

    /// Beta matched to a mean and sd, the usual shape for utilities. The
    /// variance must sit below mean*(1-mean) for the match to exist.
    pub fn beta_from_moments(name: &str, mean: f64, sd: f64) -> Result<Self, ConfigError> {
        if !(0.0 < mean && mean < 1.0) || !(sd > 0.0) {
            return Err(ConfigError::InvalidMarginal {
                name: name.to_string(),
                reason: "beta moment matching needs mean in (0, 1) and sd > 0",
            });
        }
        let spread = mean * (1.0 - mean);
        if sd * sd >= spread {
            return Err(ConfigError::InvalidMarginal {
                name: name.to_string(),
                reason: "beta moment matching needs sd^2 < mean*(1-mean)",
            });
        }
        let concentration = spread / (sd * sd) - 1.0;
        ParameterSpec::new(
            name,
            Marginal::Beta {
                alpha: mean * concentration,
                beta: (1.0 - mean) * concentration,
            },
        )
    }
}

/// A named correlation block: member parameter names in row order plus the
/// flat row-major target correlation matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationGroup {
    pub name: String,
    pub parameters: Vec<String>,
    pub correlation: Vec<f64>,
}

impl CorrelationGroup {
    pub fn new(name: &str, parameters: &[&str], correlation: Vec<f64>) -> Self {
        CorrelationGroup {
            name: name.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            correlation,
        }
    }
}

/// One PSA iteration's drawn values, aligned with the sampler's parameter
/// order. Immutable once drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl ParameterSet {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names.iter().map(String::as_str).zip(self.values.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug)]
struct PreparedGroup {
    members: Vec<usize>,
    /// Lower-triangular Cholesky factor, flat row-major over the block.
    factor: Vec<f64>,
}

/// The Cholesky engine. Built once per PSA run; validation happens entirely
/// at build time so `draw` is infallible.
#[derive(Debug)]
pub struct CorrelatedSampler {
    specs: Vec<ParameterSpec>,
    groups: Vec<PreparedGroup>,
    ungrouped: Vec<usize>,
}

impl CorrelatedSampler {
    pub fn new(
        specs: Vec<ParameterSpec>,
        groups: &[CorrelationGroup],
    ) -> Result<Self, ConfigError> {
        for spec in &specs {
            spec.marginal.validate(&spec.name)?;
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|other| other.name == spec.name) {
                return Err(ConfigError::InvalidMarginal {
                    name: spec.name.clone(),
                    reason: "duplicate parameter name",
                });
            }
        }

        let mut grouped = vec![false; specs.len()];
        let mut prepared = Vec::with_capacity(groups.len());
        for group in groups {
            let n = group.parameters.len();
            if group.correlation.len() != n * n {
                let rows = (group.correlation.len() as f64).sqrt().floor() as usize;
                return Err(ConfigError::CorrelationShape {
                    block: group.name.clone(),
                    parameters: n,
                    rows,
                });
            }
            let mut members = Vec::with_capacity(n);
            for parameter in &group.parameters {
                let Some(index) = specs.iter().position(|s| &s.name == parameter) else {
                    return Err(ConfigError::UnknownOverrideKey(parameter.clone()));
                };
                if grouped[index] {
                    return Err(ConfigError::InvalidMarginal {
                        name: parameter.clone(),
                        reason: "parameter appears in more than one correlation block",
                    });
                }
                grouped[index] = true;
                members.push(index);
            }
            if !is_valid_correlation_matrix(&group.correlation, n) {
                return Err(ConfigError::CorrelationNotPositiveDefinite {
                    block: group.name.clone(),
                });
            }
            let Some(factor) = cholesky_decompose(&group.correlation, n) else {
                return Err(ConfigError::CorrelationNotPositiveDefinite {
                    block: group.name.clone(),
                });
            };
            prepared.push(PreparedGroup { members, factor });
        }

        let ungrouped = (0..specs.len()).filter(|&i| !grouped[i]).collect();
        Ok(CorrelatedSampler { specs, groups: prepared, ungrouped })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Draws one parameter set. RNG consumption is fixed at one standard
    /// normal per parameter, in declaration order (blocks first), so a given
    /// seed always yields the same set.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterSet {
        let mut values = vec![0.0; self.specs.len()];
        for group in &self.groups {
            let n = group.members.len();
            let z: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
            for (row, &spec_index) in group.members.iter().enumerate() {
                let mut w = 0.0;
                for (column, z_j) in z.iter().enumerate().take(row + 1) {
                    w += group.factor[row * n + column] * z_j;
                }
                values[spec_index] = self.specs[spec_index].marginal.from_standard_normal(w);
            }
        }
        for &spec_index in &self.ungrouped {
            let z: f64 = rng.sample(StandardNormal);
            values[spec_index] = self.specs[spec_index].marginal.from_standard_normal(z);
        }
        ParameterSet {
            names: self.specs.iter().map(|spec| spec.name.clone()).collect(),
            values,
        }
    }
}

fn is_valid_correlation_matrix(matrix: &[f64], n: usize) -> bool {
    for i in 0..n {
        if (matrix[i * n + i] - 1.0).abs() > 1e-9 {
            return false;
        }
        for j in 0..n {
            let value = matrix[i * n + j];
            if !value.is_finite() || value.abs() > 1.0 + 1e-9 {
                return false;
            }
            if (value - matrix[j * n + i]).abs() > 1e-9 {
                return false;
            }
        }
    }
    true
}

/// Lower-triangular Cholesky factor of a flat row-major matrix, or `None`
/// when the matrix is not positive definite.
pub(crate) fn cholesky_decompose(matrix: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[i * n + j] = sum.sqrt();
            } else {
                let ljj = l[j * n + j];
                if ljj.abs() < 1e-12 {
                    return None;
                }
                l[i * n + j] = sum / ljj;
            }
        }
    }
    Some(l)
}

// ── Numeric kernels ──────────────────────────────────────────────────────────

// Quantiles clamp the uniform away from 0 and 1; the erf approximation is
// only good to ~1e-7 so the extreme tails are unreachable anyway.
const QUANTILE_FLOOR: f64 = 1e-12;

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26 rational approximation.
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Natural log of the gamma function, Lanczos approximation with g = 7.
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        let pi = std::f64::consts::PI;
        pi.ln() - (pi * x).sin().ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut a = COEFFS[0];
        for (i, &coeff) in COEFFS.iter().enumerate().skip(1) {
            a += coeff / (x + i as f64);
        }
        let t = x + 7.5;
        let sqrt_2pi = (2.0 * std::f64::consts::PI).sqrt();
        (sqrt_2pi * a).ln() + (x + 0.5) * t.ln() - t
    }
}

/// Regularized lower incomplete gamma P(a, x): series expansion below
/// a + 1, continued fraction above.
fn regularized_gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 || a <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        gamma_series(a, x)
    } else {
        1.0 - gamma_continued_fraction(a, x)
    }
}

fn gamma_series(a: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 1e-12;

    let gln = ln_gamma(a);
    let mut ap = a;
    let mut sum = 1.0 / a;
    let mut del = sum;
    for _ in 0..MAX_ITER {
        ap += 1.0;
        del *= x / ap;
        sum += del;
        if del.abs() < sum.abs() * EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - gln).exp()
}

fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 1e-12;
    const FPMIN: f64 = 1e-30;

    let gln = ln_gamma(a);
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = b + an / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    (-x + a * x.ln() - gln).exp() * h
}

/// Regularized incomplete beta I_x(a, b) via the continued fraction, with
/// the symmetry flip for numerical stability past the mode.
fn regularized_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    if x > (a + 1.0) / (a + b + 2.0) {
        return 1.0 - regularized_beta(b, a, 1.0 - x);
    }

    const MAX_ITER: usize = 200;
    const EPS: f64 = 1e-12;
    const FPMIN: f64 = 1e-30;

    let bt =
        (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();

    let mut d = 1.0 - (a + b) * x / (a + 1.0);
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut c = 1.0;
    let mut f = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((a + m2 - 1.0) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        d = 1.0 / d;
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        f *= d * c;

        let aa = -(a + m) * (a + b + m) * x / ((a + m2) * (a + m2 + 1.0));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        d = 1.0 / d;
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        let del = d * c;
        f *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    bt * f / a
}

/// Gamma quantile by bracket expansion plus bisection on the CDF. Slow but
/// exact enough, and only paid once per parameter per PSA iteration.
fn gamma_quantile(shape: f64, rate: f64, u: f64) -> f64 {
    let u = u.clamp(QUANTILE_FLOOR, 1.0 - QUANTILE_FLOOR);
    let mean = shape / rate;
    let sd = shape.sqrt() / rate;
    let mut hi = mean + 10.0 * sd;
    let mut expansions = 0;
    while regularized_gamma_p(shape, rate * hi) < u && expansions < 64 {
        hi *= 2.0;
        expansions += 1;
    }
    let mut lo = 0.0;
    for _ in 0..90 {
        let mid = 0.5 * (lo + hi);
        if regularized_gamma_p(shape, rate * mid) < u {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Beta quantile by bisection on [0, 1].
fn beta_quantile(alpha: f64, beta: f64, u: f64) -> f64 {
    let u = u.clamp(QUANTILE_FLOOR, 1.0 - QUANTILE_FLOOR);
    let mut lo = 0.0;
    let mut hi = 1.0;
    for _ in 0..90 {
        let mid = 0.5 * (lo + hi);
        if regularized_beta(alpha, beta, mid) < u {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
        let n = xs.len() as f64;
        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = ys.iter().sum::<f64>() / n;
        let mut cov = 0.0;
        let mut var_x = 0.0;
        let mut var_y = 0.0;
        for (x, y) in xs.iter().zip(ys) {
            cov += (x - mean_x) * (y - mean_y);
            var_x += (x - mean_x) * (x - mean_x);
            var_y += (y - mean_y) * (y - mean_y);
        }
        cov / (var_x.sqrt() * var_y.sqrt())
    }

    // ── Closed-form moments ──────────────────────────────────────────────────

    #[test]
    fn marginal_moments_match_closed_forms() {
        let normal = Marginal::Normal { mean: 3.0, sd: 2.0 };
        assert_eq!(normal.mean(), 3.0);
        assert_eq!(normal.variance(), 4.0);

        let gamma = Marginal::Gamma { shape: 4.0, rate: 0.5 };
        assert!((gamma.mean() - 8.0).abs() < 1e-12);
        assert!((gamma.variance() - 16.0).abs() < 1e-12);

        let beta = Marginal::Beta { alpha: 2.0, beta: 5.0 };
        assert!((beta.mean() - 2.0 / 7.0).abs() < 1e-12);
        assert!((beta.variance() - 10.0 / (49.0 * 8.0)).abs() < 1e-12);

        let log_normal = Marginal::LogNormal { log_mean: 0.0, log_sd: 0.5 };
        assert!((log_normal.mean() - (0.125f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn moment_matching_constructors_round_trip() {
        let gamma = ParameterSpec::gamma_from_moments("c", 100.0, 20.0).unwrap();
        assert!((gamma.marginal.mean() - 100.0).abs() < 1e-9);
        assert!((gamma.marginal.variance() - 400.0).abs() < 1e-9);

        let log_normal = ParameterSpec::log_normal_from_moments("m", 50.0, 10.0).unwrap();
        assert!((log_normal.marginal.mean() - 50.0).abs() < 1e-9);
        assert!((log_normal.marginal.variance() - 100.0).abs() < 1e-9);

        let beta = ParameterSpec::beta_from_moments("u", 0.7, 0.05).unwrap();
        assert!((beta.marginal.mean() - 0.7).abs() < 1e-9);
        assert!((beta.marginal.variance() - 0.0025).abs() < 1e-9);
    }

    #[test]
    fn impossible_moment_matches_are_rejected() {
        assert!(matches!(
            ParameterSpec::beta_from_moments("u", 0.5, 0.6).unwrap_err(),
            ConfigError::InvalidMarginal { .. }
        ));
        assert!(ParameterSpec::gamma_from_moments("c", -5.0, 1.0).is_err());
        assert!(ParameterSpec::normal("n", 0.0, -1.0).is_err());
        assert!(ParameterSpec::new("g", Marginal::Gamma { shape: 0.0, rate: 1.0 }).is_err());
    }

    // ── Numeric kernels ──────────────────────────────────────────────────────

    #[test]
    fn normal_cdf_hits_known_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.959_964) - 0.975).abs() < 1e-4);
        assert!((normal_cdf(-1.0) + normal_cdf(1.0) - 1.0).abs() < 1e-7);
        assert!(normal_cdf(8.0) > 0.999_999);
        assert!(normal_cdf(-8.0) < 1e-6);
    }

    #[test]
    fn ln_gamma_hits_known_points() {
        assert!((ln_gamma(5.0) - 24.0f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(1.0)).abs() < 1e-10);
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-10);
    }

    #[test]
    fn incomplete_gamma_matches_exponential_special_case() {
        // P(1, x) is the exponential CDF.
        for x in [0.1f64, 0.5, 1.0, 2.0, 5.0] {
            let expected = 1.0 - (-x).exp();
            assert!((regularized_gamma_p(1.0, x) - expected).abs() < 1e-8, "x = {x}");
        }
        assert_eq!(regularized_gamma_p(2.0, 0.0), 0.0);
    }

    #[test]
    fn incomplete_beta_matches_polynomial_special_cases() {
        // I_x(1, 1) = x; I_x(2, 2) = x^2 (3 - 2x).
        for x in [0.1, 0.3, 0.5, 0.7, 0.9] {
            assert!((regularized_beta(1.0, 1.0, x) - x).abs() < 1e-8);
            let expected = x * x * (3.0 - 2.0 * x);
            assert!((regularized_beta(2.0, 2.0, x) - expected).abs() < 1e-8);
        }
        // Symmetry.
        let forward = regularized_beta(3.0, 5.0, 0.35);
        let backward = 1.0 - regularized_beta(5.0, 3.0, 0.65);
        assert!((forward - backward).abs() < 1e-9);
    }

    #[test]
    fn quantiles_invert_their_cdfs() {
        for u in [0.01, 0.1, 0.5, 0.9, 0.99] {
            let x = gamma_quantile(4.0, 0.5, u);
            assert!((regularized_gamma_p(4.0, 0.5 * x) - u).abs() < 1e-6, "gamma u = {u}");
            let y = beta_quantile(2.0, 5.0, u);
            assert!((regularized_beta(2.0, 5.0, y) - u).abs() < 1e-6, "beta u = {u}");
        }
    }

    proptest! {
        #[test]
        fn quantiles_are_monotone_and_in_support(
            u_lo in 0.001f64..0.5,
            gap in 0.001f64..0.49,
            shape in 0.5f64..20.0,
            alpha in 0.5f64..20.0,
            beta in 0.5f64..20.0,
        ) {
            let u_hi = u_lo + gap;
            let g_lo = gamma_quantile(shape, 1.0, u_lo);
            let g_hi = gamma_quantile(shape, 1.0, u_hi);
            prop_assert!(g_lo > 0.0);
            prop_assert!(g_hi >= g_lo);

            let b_lo = beta_quantile(alpha, beta, u_lo);
            let b_hi = beta_quantile(alpha, beta, u_hi);
            prop_assert!(b_lo > 0.0 && b_hi < 1.0);
            prop_assert!(b_hi >= b_lo);
        }
    }

    // ── Cholesky ─────────────────────────────────────────────────────────────

    #[test]
    fn cholesky_of_identity_is_identity() {
        let factor = cholesky_decompose(&[1.0, 0.0, 0.0, 1.0], 2).unwrap();
        assert_eq!(factor, vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn cholesky_of_two_by_two_matches_closed_form() {
        let rho: f64 = 0.7;
        let factor = cholesky_decompose(&[1.0, rho, rho, 1.0], 2).unwrap();
        assert!((factor[0] - 1.0).abs() < 1e-12);
        assert!((factor[2] - rho).abs() < 1e-12);
        assert!((factor[3] - (1.0 - rho * rho).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn non_positive_definite_matrix_is_rejected() {
        assert!(cholesky_decompose(&[1.0, 1.2, 1.2, 1.0], 2).is_none());
    }

    // ── Sampler ──────────────────────────────────────────────────────────────

    fn make_pair_sampler(rho: f64) -> CorrelatedSampler {
        let specs = vec![
            ParameterSpec::normal("a", 10.0, 2.0).unwrap(),
            ParameterSpec::normal("b", -5.0, 1.0).unwrap(),
            ParameterSpec::normal("lone", 0.0, 1.0).unwrap(),
        ];
        let group =
            CorrelationGroup::new("pair", &["a", "b"], vec![1.0, rho, rho, 1.0]);
        CorrelatedSampler::new(specs, &[group]).unwrap()
    }

    #[test]
    fn build_rejects_malformed_groups() {
        let specs = vec![
            ParameterSpec::normal("a", 0.0, 1.0).unwrap(),
            ParameterSpec::normal("b", 0.0, 1.0).unwrap(),
        ];
        let wrong_shape =
            CorrelationGroup::new("pair", &["a", "b"], vec![1.0, 0.5, 0.5, 1.0, 0.0]);
        assert!(matches!(
            CorrelatedSampler::new(specs.clone(), &[wrong_shape]).unwrap_err(),
            ConfigError::CorrelationShape { .. }
        ));

        let unknown = CorrelationGroup::new("pair", &["a", "missing"], vec![1.0, 0.0, 0.0, 1.0]);
        assert!(matches!(
            CorrelatedSampler::new(specs.clone(), &[unknown]).unwrap_err(),
            ConfigError::UnknownOverrideKey(_)
        ));

        let not_pd = CorrelationGroup::new("pair", &["a", "b"], vec![1.0, 1.2, 1.2, 1.0]);
        assert!(matches!(
            CorrelatedSampler::new(specs.clone(), &[not_pd]).unwrap_err(),
            ConfigError::CorrelationNotPositiveDefinite { .. }
        ));

        let first = CorrelationGroup::new("one", &["a", "b"], vec![1.0, 0.3, 0.3, 1.0]);
        let again = CorrelationGroup::new("two", &["b"], vec![1.0]);
        assert!(matches!(
            CorrelatedSampler::new(specs, &[first, again]).unwrap_err(),
            ConfigError::InvalidMarginal { .. }
        ));
    }

    #[test]
    fn grouped_draws_hit_the_target_correlation() {
        let sampler = make_pair_sampler(0.7);
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let mut a = Vec::with_capacity(10_000);
        let mut b = Vec::with_capacity(10_000);
        let mut lone = Vec::with_capacity(10_000);
        for _ in 0..10_000 {
            let set = sampler.draw(&mut rng);
            a.push(set.get("a").unwrap());
            b.push(set.get("b").unwrap());
            lone.push(set.get("lone").unwrap());
        }
        assert!((pearson(&a, &b) - 0.7).abs() < 0.05, "got {}", pearson(&a, &b));
        assert!(pearson(&a, &lone).abs() < 0.05);
        assert!(pearson(&b, &lone).abs() < 0.05);
    }

    #[test]
    fn copula_correlation_survives_non_gaussian_marginals() {
        let specs = vec![
            ParameterSpec::gamma_from_moments("cost", 100.0, 20.0).unwrap(),
            ParameterSpec::beta_from_moments("utility", 0.7, 0.05).unwrap(),
        ];
        let group = CorrelationGroup::new(
            "econ",
            &["cost", "utility"],
            vec![1.0, 0.7, 0.7, 1.0],
        );
        let sampler = CorrelatedSampler::new(specs, &[group]).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let mut costs = Vec::with_capacity(5_000);
        let mut utilities = Vec::with_capacity(5_000);
        for _ in 0..5_000 {
            let set = sampler.draw(&mut rng);
            let cost = set.get("cost").unwrap();
            let utility = set.get("utility").unwrap();
            assert!(cost > 0.0);
            assert!((0.0..=1.0).contains(&utility));
            costs.push(cost);
            utilities.push(utility);
        }
        assert!((pearson(&costs, &utilities) - 0.7).abs() < 0.05);
    }

    #[test]
    fn marginal_shapes_survive_the_copula() {
        let specs = vec![ParameterSpec::gamma_from_moments("cost", 100.0, 20.0).unwrap()];
        let sampler = CorrelatedSampler::new(specs, &[]).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let draws: Vec<f64> =
            (0..8_000).map(|_| sampler.draw(&mut rng).values[0]).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let variance =
            draws.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / draws.len() as f64;
        assert!((mean - 100.0).abs() < 1.5, "mean {mean}");
        assert!((variance - 400.0).abs() < 40.0, "variance {variance}");
    }

    #[test]
    fn same_seed_reproduces_the_same_draw() {
        let sampler = make_pair_sampler(0.4);
        let first = sampler.draw(&mut ChaCha20Rng::seed_from_u64(9));
        let second = sampler.draw(&mut ChaCha20Rng::seed_from_u64(9));
        assert_eq!(first, second);
        let third = sampler.draw(&mut ChaCha20Rng::seed_from_u64(10));
        assert_ne!(first.values, third.values);
    }
}
