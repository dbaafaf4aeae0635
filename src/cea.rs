//! Deterministic cost-effectiveness comparison of two arms.
//!
//! Both arms are generated from the same seed, so they start from identical
//! patients and differ only in what happens after cycle 0. The incremental
//! ratio is a closed sum type: a bare f64 ICER turns sign-ambiguous the
//! moment either delta goes negative (-100/-0.01 and 100/0.01 print the same
//! number), so the quadrant is classified first and a ratio is only ever
//! reported inside the two quadrants where it means something.

use std::fmt;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::simulation::{arm_label, ArmResult, SimulationEngine};
use crate::treatment::Treatment;

/// Incremental outcome of intervention vs comparator, per patient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IcerOutcome {
    /// Cheaper and at least as effective (or equally cheap and more
    /// effective). No ratio: adopting is the only rational answer.
    Dominant,
    /// More effective and more costly: the classic trade-off, cost per QALY
    /// gained.
    CostPerQaly(f64),
    /// Less effective and cheaper: savings per QALY forgone, the
    /// willingness-to-accept reading of the southwest quadrant.
    SavingsPerQalyForgone(f64),
    /// At most as effective and at least as costly (one strictly so).
    Dominated,
    /// Identical on both axes.
    Equivalent,
}

impl IcerOutcome {
    pub fn from_deltas(delta_cost: f64, delta_qaly: f64) -> IcerOutcome {
        if delta_qaly > 0.0 && delta_cost > 0.0 {
            IcerOutcome::CostPerQaly(delta_cost / delta_qaly)
        } else if delta_qaly < 0.0 && delta_cost < 0.0 {
            IcerOutcome::SavingsPerQalyForgone(delta_cost / delta_qaly)
        } else if delta_qaly == 0.0 && delta_cost == 0.0 {
            IcerOutcome::Equivalent
        } else if delta_qaly >= 0.0 && delta_cost <= 0.0 {
            IcerOutcome::Dominant
        } else {
            IcerOutcome::Dominated
        }
    }
}

impl fmt::Display for IcerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcerOutcome::Dominant => write!(f, "dominant (cheaper, at least as effective)"),
            IcerOutcome::CostPerQaly(ratio) => write!(f, "{ratio:.0} per QALY gained"),
            IcerOutcome::SavingsPerQalyForgone(ratio) => {
                write!(f, "{ratio:.0} saved per QALY forgone")
            }
            IcerOutcome::Dominated => write!(f, "dominated (dearer, no more effective)"),
            IcerOutcome::Equivalent => write!(f, "equivalent"),
        }
    }
}

/// Net monetary benefit of the intervention at willingness-to-pay `wtp` per
/// QALY. Positive means adopt.
pub fn net_monetary_benefit(delta_cost: f64, delta_qaly: f64, wtp: f64) -> f64 {
    wtp * delta_qaly - delta_cost
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CeaResult {
    pub comparator: ArmResult,
    pub intervention: ArmResult,
    /// Incremental means per patient, intervention minus comparator.
    pub delta_cost: f64,
    pub delta_qaly: f64,
    pub delta_life_years: f64,
    pub icer: IcerOutcome,
}

impl CeaResult {
    pub fn from_arms(comparator: ArmResult, intervention: ArmResult) -> CeaResult {
        let delta_cost = intervention.mean_discounted_cost - comparator.mean_discounted_cost;
        let delta_qaly = intervention.mean_discounted_qaly - comparator.mean_discounted_qaly;
        let delta_life_years =
            intervention.mean_discounted_life_years - comparator.mean_discounted_life_years;
        let icer = IcerOutcome::from_deltas(delta_cost, delta_qaly);
        CeaResult { comparator, intervention, delta_cost, delta_qaly, delta_life_years, icer }
    }

    pub fn net_monetary_benefit(&self, wtp: f64) -> f64 {
        net_monetary_benefit(self.delta_cost, self.delta_qaly, wtp)
    }

    pub fn comparison_label(&self) -> String {
        format!("{} vs {}", arm_label(self.intervention.treatment), self.comparator.label())
    }
}

/// Runs the paired comparison. Identical seed on both arms is what makes the
/// deltas a within-patient contrast rather than a between-cohort one.
pub fn run_cea(
    config: &SimulationConfig,
    comparator: Option<Treatment>,
    intervention: Option<Treatment>,
    seed: u64,
    cancel: Option<&AtomicBool>,
) -> Result<CeaResult, SimError> {
    let engine = SimulationEngine::new(config);
    let comparator_result = engine.run_arm(comparator, seed, cancel)?;
    let intervention_result = engine.run_arm(intervention, seed, cancel)?;
    Ok(CeaResult::from_arms(comparator_result, intervention_result))
}
