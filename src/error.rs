use std::fmt;

use crate::types::{Cycle, PatientId};

/// Rejected before any simulation starts. A run either begins with a fully
/// valid configuration or not at all; there is no partially-applied state to
/// unwind.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    NegativeDiscountRate(f64),
    EmptyCohort,
    ZeroHorizon,
    ProbabilityOutOfRange { field: &'static str, value: f64 },
    NonFinite { field: &'static str, value: f64 },
    RangeInverted { field: &'static str, lo: f64, hi: f64 },
    UnknownOverrideKey(String),
    InvalidOverride { key: String, value: f64, reason: &'static str },
    InvalidMarginal { name: String, reason: &'static str },
    CorrelationShape { block: String, parameters: usize, rows: usize },
    CorrelationNotPositiveDefinite { block: String },
    MissingTreatmentEffect { treatment: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NegativeDiscountRate(rate) => {
                write!(f, "discount rate must be >= 0, got {rate}")
            }
            ConfigError::EmptyCohort => write!(f, "cohort size must be at least 1"),
            ConfigError::ZeroHorizon => write!(f, "time horizon must be at least 1 year"),
            ConfigError::ProbabilityOutOfRange { field, value } => {
                write!(f, "{field} must lie in [0, 1], got {value}")
            }
            ConfigError::NonFinite { field, value } => {
                write!(f, "{field} must be finite, got {value}")
            }
            ConfigError::RangeInverted { field, lo, hi } => {
                write!(f, "{field} range is inverted: lo {lo} > hi {hi}")
            }
            ConfigError::UnknownOverrideKey(key) => {
                write!(f, "unknown parameter override key '{key}'")
            }
            ConfigError::InvalidOverride { key, value, reason } => {
                write!(f, "override '{key}' = {value} rejected: {reason}")
            }
            ConfigError::InvalidMarginal { name, reason } => {
                write!(f, "marginal distribution '{name}' invalid: {reason}")
            }
            ConfigError::CorrelationShape { block, parameters, rows } => {
                write!(
                    f,
                    "correlation block '{block}' has {parameters} parameters but a {rows}x{rows} matrix"
                )
            }
            ConfigError::CorrelationNotPositiveDefinite { block } => {
                write!(f, "correlation block '{block}' matrix is not positive definite")
            }
            ConfigError::MissingTreatmentEffect { treatment } => {
                write!(f, "no effect-table row for treatment '{treatment}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A probability or covariate left its valid domain after every clamp. Only
/// raised in strict mode; the default policy recovers in place and counts
/// the repair. Carries enough context to replay the exact patient-cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericDivergence {
    pub seed: u64,
    pub cycle: Cycle,
    pub patient: PatientId,
    pub quantity: &'static str,
    pub value: f64,
}

impl fmt::Display for NumericDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "numeric divergence: {} = {} (seed {}, cycle {}, patient {})",
            self.quantity, self.value, self.seed, self.cycle, self.patient
        )
    }
}

impl std::error::Error for NumericDivergence {}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The named backend is not reachable. Recoverable: the caller may fall
    /// back to the in-process reference implementation.
    Unavailable { name: String },
    /// The backend ran and failed. Not recoverable by fallback; the partial
    /// result is discarded.
    Failed { name: String, detail: String },
    /// The backend returned a population or result whose columns do not
    /// match the agreed layout.
    ColumnMismatch { name: String, column: &'static str },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unavailable { name } => write!(f, "backend '{name}' unavailable"),
            BackendError::Failed { name, detail } => {
                write!(f, "backend '{name}' failed: {detail}")
            }
            BackendError::ColumnMismatch { name, column } => {
                write!(f, "backend '{name}' column '{column}' does not match the agreed layout")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Umbrella error for a whole run. An undefined ICER is deliberately absent
/// here: non-positive incremental QALYs are a reportable outcome, not a
/// failure (`cea::IcerOutcome`).
#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    Config(ConfigError),
    Numeric(NumericDivergence),
    Backend(BackendError),
    Cancelled,
}

impl SimError {
    /// Process exit status for the automation surface: invalid configuration,
    /// numeric divergence and backend failure must be distinguishable by the
    /// caller without parsing stderr.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::Config(_) => 2,
            SimError::Numeric(_) => 3,
            SimError::Backend(_) => 4,
            SimError::Cancelled => 1,
        }
    }
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Config(e) => write!(f, "configuration error: {e}"),
            SimError::Numeric(e) => write!(f, "{e}"),
            SimError::Backend(e) => write!(f, "backend error: {e}"),
            SimError::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimError::Config(e) => Some(e),
            SimError::Numeric(e) => Some(e),
            SimError::Backend(e) => Some(e),
            SimError::Cancelled => None,
        }
    }
}

impl From<ConfigError> for SimError {
    fn from(e: ConfigError) -> Self {
        SimError::Config(e)
    }
}

impl From<NumericDivergence> for SimError {
    fn from(e: NumericDivergence) -> Self {
        SimError::Numeric(e)
    }
}

impl From<BackendError> for SimError {
    fn from(e: BackendError) -> Self {
        SimError::Backend(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_failure_classes() {
        let config = SimError::Config(ConfigError::NegativeDiscountRate(-0.01));
        let numeric = SimError::Numeric(NumericDivergence {
            seed: 7,
            cycle: Cycle(3),
            patient: PatientId(12),
            quantity: "p_mi",
            value: f64::NAN,
        });
        let backend = SimError::Backend(BackendError::Unavailable { name: "accel".into() });
        assert_eq!(config.exit_code(), 2);
        assert_eq!(numeric.exit_code(), 3);
        assert_eq!(backend.exit_code(), 4);
        assert_eq!(SimError::Cancelled.exit_code(), 1);
    }

    #[test]
    fn divergence_message_carries_reproduction_context() {
        let e = NumericDivergence {
            seed: 42,
            cycle: Cycle(17),
            patient: PatientId(5),
            quantity: "p_stroke",
            value: -0.2,
        };
        let msg = e.to_string();
        assert!(msg.contains("seed 42"));
        assert!(msg.contains("cycle 17"));
        assert!(msg.contains("patient 5"));
        assert!(msg.contains("p_stroke"));
    }

    #[test]
    fn source_chain_exposes_inner_error() {
        use std::error::Error;
        let e = SimError::Config(ConfigError::EmptyCohort);
        assert!(e.source().is_some());
        assert!(SimError::Cancelled.source().is_none());
    }
}
