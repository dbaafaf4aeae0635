//! Probabilistic sensitivity analysis.
//!
//! Each iteration draws one correlated parameter set, pushes it through the
//! flat override surface onto a fresh copy of the base configuration, and
//! re-runs the paired comparison. The patient seed is the same in every
//! iteration: only the parameters move between iterations, so the spread of
//! the incremental cloud is second-order (parameter) uncertainty, not
//! first-order sampling noise. Parameter draws get their own stream family,
//! far from any patient stream.

use std::sync::atomic::AtomicBool;

use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cea::{net_monetary_benefit, run_cea};
use crate::config::SimulationConfig;
use crate::error::{ConfigError, SimError};
use crate::sampling::{CorrelatedSampler, CorrelationGroup, ParameterSet, ParameterSpec};
use crate::simulation::{cancelled, stream_seed, EventCounts};
use crate::treatment::Treatment;

/// Stream index reserved for parameter draws. Patient streams are indexed by
/// patient id from zero, so the two families never meet.
const PARAMETER_STREAM: u64 = u64::MAX;

/// WTP used for parameter-importance ranking when the grid is empty.
const DEFAULT_REFERENCE_WTP: f64 = 20_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsaOptions {
    pub iterations: usize,
    /// Willingness-to-pay grid for the acceptability curve and EVPI.
    pub wtp_grid: Vec<f64>,
    /// Size of the decision population the EVPI curve is reported for.
    /// `None` leaves the curve per patient. Scales only the EVPI: the
    /// acceptability curve and parameter importance are population-free.
    pub population_size: Option<f64>,
}

impl PsaOptions {
    pub fn canonical() -> Self {
        PsaOptions {
            iterations: 500,
            wtp_grid: (0..=10).map(|step| f64::from(step) * 5_000.0).collect(),
            population_size: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::InvalidOverride {
                key: "iterations".to_string(),
                value: 0.0,
                reason: "at least one iteration is required",
            });
        }
        for &wtp in &self.wtp_grid {
            if !wtp.is_finite() || wtp < 0.0 {
                return Err(ConfigError::NonFinite { field: "wtp_grid", value: wtp });
            }
        }
        if let Some(population) = self.population_size {
            if !population.is_finite() || population <= 0.0 {
                return Err(ConfigError::InvalidOverride {
                    key: "population_size".to_string(),
                    value: population,
                    reason: "population size must be finite and positive",
                });
            }
        }
        Ok(())
    }
}

/// The canonical second-order uncertainty model over the override surface.
/// Means come from the configuration as it stands, so command-line overrides
/// shift the distributions rather than being ignored by them.
pub fn canonical_parameters(
    config: &SimulationConfig,
) -> Result<(Vec<ParameterSpec>, Vec<CorrelationGroup>), ConfigError> {
    let costs = &config.costs;
    let utilities = &config.utilities;
    let mut specs = vec![
        // Acute and chronic care costs: gamma, 20% coefficient of variation.
        ParameterSpec::gamma_from_moments(
            "costs.acute_mi",
            costs.acute_mi,
            0.2 * costs.acute_mi,
        )?,
        ParameterSpec::gamma_from_moments(
            "costs.acute_ischemic_stroke",
            costs.acute_ischemic_stroke,
            0.2 * costs.acute_ischemic_stroke,
        )?,
        ParameterSpec::gamma_from_moments(
            "costs.acute_hemorrhagic_stroke",
            costs.acute_hemorrhagic_stroke,
            0.2 * costs.acute_hemorrhagic_stroke,
        )?,
        ParameterSpec::gamma_from_moments(
            "costs.chronic_hf_monthly",
            costs.chronic_hf_monthly,
            0.2 * costs.chronic_hf_monthly,
        )?,
        ParameterSpec::gamma_from_moments(
            "costs.dialysis_monthly",
            costs.dialysis_monthly,
            0.2 * costs.dialysis_monthly,
        )?,
        ParameterSpec::gamma_from_moments(
            "costs.dementia_monthly",
            costs.dementia_monthly,
            0.2 * costs.dementia_monthly,
        )?,
        // Chronic state utilities: beta on the unit interval.
        ParameterSpec::beta_from_moments("utilities.post_mi", utilities.post_mi, 0.04)?,
        ParameterSpec::beta_from_moments("utilities.post_stroke", utilities.post_stroke, 0.04)?,
        ParameterSpec::beta_from_moments("utilities.chronic_hf", utilities.chronic_hf, 0.04)?,
        ParameterSpec::beta_from_moments("utilities.dialysis", utilities.dialysis, 0.04)?,
        // Calibration multipliers: lognormal keeps them positive.
        ParameterSpec::log_normal_from_moments(
            "cvd_calibration",
            config.cvd_calibration,
            0.15 * config.cvd_calibration,
        )?,
        ParameterSpec::log_normal_from_moments(
            "mortality_calibration",
            config.mortality_calibration,
            0.10 * config.mortality_calibration,
        )?,
        ParameterSpec::beta_from_moments(
            "adherence.annual_become_nonadherent",
            config.treatment.adherence.annual_become_nonadherent,
            0.03,
        )?,
    ];
    // Per-class effect sizes, normal around the trial means.
    for treatment in Treatment::ALL {
        let row = config.treatment.effects.get(treatment)?;
        specs.push(ParameterSpec::normal(
            &format!("effects.{}.mean_sbp_reduction", treatment.name()),
            row.mean_sbp_reduction,
            0.6,
        )?);
    }

    let groups = vec![
        // Acute event prices move together under tariff revisions.
        CorrelationGroup::new(
            "acute_event_costs",
            &[
                "costs.acute_mi",
                "costs.acute_ischemic_stroke",
                "costs.acute_hemorrhagic_stroke",
            ],
            vec![1.0, 0.5, 0.5, 0.5, 1.0, 0.5, 0.5, 0.5, 1.0],
        ),
        // Severity utilities share elicitation instruments.
        CorrelationGroup::new(
            "chronic_state_utilities",
            &["utilities.post_mi", "utilities.post_stroke", "utilities.chronic_hf"],
            vec![1.0, 0.4, 0.4, 0.4, 1.0, 0.4, 0.4, 0.4, 1.0],
        ),
    ];
    Ok((specs, groups))
}

/// One point of the incremental cloud, with the draw that produced it and
/// per-arm tallies for timing-invariance checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsaIteration {
    pub iteration: usize,
    pub parameters: ParameterSet,
    pub comparator_cost: f64,
    pub comparator_qaly: f64,
    pub intervention_cost: f64,
    pub intervention_qaly: f64,
    pub delta_cost: f64,
    pub delta_qaly: f64,
    pub comparator_events: EventCounts,
    pub intervention_events: EventCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CeacPoint {
    pub wtp: f64,
    /// Fraction of iterations in which the intervention carries positive net
    /// monetary benefit.
    pub probability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvpiPoint {
    pub wtp: f64,
    /// Expected value of resolving all parameter uncertainty: per patient,
    /// times the decision population when the options set one.
    pub expected_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterImportance {
    pub name: String,
    /// Pearson correlation between the drawn value and the incremental net
    /// monetary benefit at the reference WTP.
    pub correlation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsaResult {
    pub iterations: Vec<PsaIteration>,
    pub mean_delta_cost: f64,
    pub mean_delta_qaly: f64,
    pub ceac: Vec<CeacPoint>,
    pub evpi: Vec<EvpiPoint>,
    /// Ranked by |correlation|, strongest driver first.
    pub importance: Vec<ParameterImportance>,
}

/// Probability that the intervention is the right call at `wtp`.
pub fn acceptability(iterations: &[PsaIteration], wtp: f64) -> f64 {
    if iterations.is_empty() {
        return 0.0;
    }
    let wins = iterations
        .iter()
        .filter(|it| net_monetary_benefit(it.delta_cost, it.delta_qaly, wtp) > 0.0)
        .count();
    wins as f64 / iterations.len() as f64
}

/// EVPI at `wtp`: what a decision-maker would pay, per patient, to know the
/// parameters before choosing. mean(max over strategies) - max(mean over
/// strategies), with the comparator pinned at zero benefit.
pub fn expected_value_of_perfect_information(iterations: &[PsaIteration], wtp: f64) -> f64 {
    if iterations.is_empty() {
        return 0.0;
    }
    let n = iterations.len() as f64;
    let mut informed = 0.0;
    let mut mean_nmb = 0.0;
    for it in iterations {
        let nmb = net_monetary_benefit(it.delta_cost, it.delta_qaly, wtp);
        informed += nmb.max(0.0);
        mean_nmb += nmb;
    }
    informed / n - (mean_nmb / n).max(0.0)
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    if xs.len() < 2 || xs.len() != ys.len() {
        return 0.0;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        covariance += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    covariance / (var_x * var_y).sqrt()
}

/// Correlation of each parameter with the incremental net benefit at the
/// reference WTP, ranked by magnitude. A crude but robust tornado substitute
/// that respects the joint (correlated) draw.
pub fn parameter_importance(iterations: &[PsaIteration], wtp: f64) -> Vec<ParameterImportance> {
    let Some(first) = iterations.first() else {
        return Vec::new();
    };
    let nmbs: Vec<f64> = iterations
        .iter()
        .map(|it| net_monetary_benefit(it.delta_cost, it.delta_qaly, wtp))
        .collect();
    let mut ranked: Vec<ParameterImportance> = first
        .parameters
        .names
        .iter()
        .map(|name| {
            let draws: Vec<f64> =
                iterations.iter().filter_map(|it| it.parameters.get(name)).collect();
            ParameterImportance { name: name.clone(), correlation: pearson(&draws, &nmbs) }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.correlation
            .abs()
            .partial_cmp(&a.correlation.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

pub struct PsaRunner<'a> {
    config: &'a SimulationConfig,
    options: PsaOptions,
    specs: Vec<ParameterSpec>,
    groups: Vec<CorrelationGroup>,
}

impl<'a> PsaRunner<'a> {
    /// Canonical uncertainty model over the base configuration.
    pub fn new(config: &'a SimulationConfig, options: PsaOptions) -> Result<Self, ConfigError> {
        let (specs, groups) = canonical_parameters(config)?;
        Ok(PsaRunner { config, options, specs, groups })
    }

    /// Caller-supplied parameter model, for restricted or extended sweeps.
    pub fn with_parameters(
        config: &'a SimulationConfig,
        options: PsaOptions,
        specs: Vec<ParameterSpec>,
        groups: Vec<CorrelationGroup>,
    ) -> Self {
        PsaRunner { config, options, specs, groups }
    }

    /// Runs the full grid. `seed` feeds both the patient streams (identical
    /// across iterations) and the parameter stream family.
    pub fn run(
        &self,
        comparator: Option<Treatment>,
        intervention: Option<Treatment>,
        seed: u64,
        cancel: Option<&AtomicBool>,
    ) -> Result<PsaResult, SimError> {
        self.options.validate()?;
        let sampler = CorrelatedSampler::new(self.specs.clone(), &self.groups)?;
        let parameter_base = stream_seed(seed, PARAMETER_STREAM);

        let iterations: Vec<PsaIteration> = (0..self.options.iterations)
            .into_par_iter()
            .map(|iteration| -> Result<PsaIteration, SimError> {
                if cancelled(cancel) {
                    return Err(SimError::Cancelled);
                }
                let mut rng =
                    ChaCha20Rng::seed_from_u64(stream_seed(parameter_base, iteration as u64));
                let parameters = sampler.draw(&mut rng);

                let mut config = self.config.clone();
                for (name, value) in parameters.iter() {
                    config.apply_override(name, value)?;
                }
                config.validate()?;

                let cea = run_cea(&config, comparator, intervention, seed, cancel)?;
                Ok(PsaIteration {
                    iteration,
                    parameters,
                    comparator_cost: cea.comparator.mean_discounted_cost,
                    comparator_qaly: cea.comparator.mean_discounted_qaly,
                    intervention_cost: cea.intervention.mean_discounted_cost,
                    intervention_qaly: cea.intervention.mean_discounted_qaly,
                    delta_cost: cea.delta_cost,
                    delta_qaly: cea.delta_qaly,
                    comparator_events: cea.comparator.events,
                    intervention_events: cea.intervention.events,
                })
            })
            .collect::<Result<_, _>>()?;

        let n = iterations.len() as f64;
        let mean_delta_cost = iterations.iter().map(|it| it.delta_cost).sum::<f64>() / n;
        let mean_delta_qaly = iterations.iter().map(|it| it.delta_qaly).sum::<f64>() / n;
        let ceac = self
            .options
            .wtp_grid
            .iter()
            .map(|&wtp| CeacPoint { wtp, probability: acceptability(&iterations, wtp) })
            .collect();
        let evpi_scale = self.options.population_size.unwrap_or(1.0);
        let evpi = self
            .options
            .wtp_grid
            .iter()
            .map(|&wtp| EvpiPoint {
                wtp,
                expected_value: evpi_scale
                    * expected_value_of_perfect_information(&iterations, wtp),
            })
            .collect();
        let reference = self
            .options
            .wtp_grid
            .get(self.options.wtp_grid.len() / 2)
            .copied()
            .unwrap_or(DEFAULT_REFERENCE_WTP);
        let importance = parameter_importance(&iterations, reference);

        debug!(
            "psa: {} iterations, mean deltas {:.2} cost / {:.4} QALY",
            iterations.len(),
            mean_delta_cost,
            mean_delta_qaly,
        );
        Ok(PsaResult { iterations, mean_delta_cost, mean_delta_qaly, ceac, evpi, importance })
    }
}
