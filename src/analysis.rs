//! Post-run aggregation and trace auditing.
//!
//! Three consumers sit downstream of a finished run: the tables the CLI
//! prints, the flat key/value scalar sheet a spreadsheet template imports,
//! and the NDJSON trace the `analyse` tool reads back. This module owns the
//! shared pieces: distribution statistics, the scalar maps, trace rows and
//! a history audit that re-checks the machine rules on recorded cohorts.

use serde::{Deserialize, Serialize};

use crate::cea::{CeaResult, IcerOutcome, net_monetary_benefit};
use crate::error::ConfigError;
use crate::patient::{EventRecord, Patient, Transition, TreatmentChangeReason};
use crate::psa::{PsaIteration, PsaResult};
use crate::simulation::{ArmResult, EventCounts};
use crate::states::{CardiacState, NeuroState, RenalStage};
use crate::treatment::Treatment;
use crate::types::{Cycle, PatientId};

/// Distribution statistics for a continuous metric across patients or
/// probabilistic iterations.
#[derive(Debug, Clone)]
pub struct DistStats {
    pub n: usize,
    pub min: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

pub fn percentile_stats(values: &mut Vec<f64>) -> Option<DistStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();

    let interp = |p: f64| -> f64 {
        let h = p * (n - 1) as f64;
        let lo = h.floor() as usize;
        let hi = (lo + 1).min(n - 1);
        let frac = h - lo as f64;
        values[lo] * (1.0 - frac) + values[hi] * frac
    };

    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = if n > 1 {
        values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };

    Some(DistStats {
        n,
        min: values[0],
        p5: interp(0.05),
        p25: interp(0.25),
        p50: interp(0.50),
        p75: interp(0.75),
        p95: interp(0.95),
        max: values[n - 1],
        mean,
        std_dev: variance.sqrt(),
    })
}

/// Spread of per-patient outcomes inside one arm.
#[derive(Debug, Clone)]
pub struct ArmDistributions {
    pub cost: DistStats,
    pub qaly: DistStats,
    pub life_years: DistStats,
    pub months_alive: DistStats,
}

pub fn arm_distributions(arm: &ArmResult) -> Option<ArmDistributions> {
    let mut cost: Vec<f64> = arm.patients.iter().map(|p| p.discounted_cost).collect();
    let mut qaly: Vec<f64> = arm.patients.iter().map(|p| p.discounted_qaly).collect();
    let mut life_years: Vec<f64> = arm.patients.iter().map(|p| p.discounted_life_years).collect();
    let mut months: Vec<f64> = arm.patients.iter().map(|p| f64::from(p.months_alive)).collect();
    Some(ArmDistributions {
        cost: percentile_stats(&mut cost)?,
        qaly: percentile_stats(&mut qaly)?,
        life_years: percentile_stats(&mut life_years)?,
        months_alive: percentile_stats(&mut months)?,
    })
}

/// Spread of the incremental cloud across probabilistic iterations, with net
/// benefit evaluated at `wtp`.
#[derive(Debug, Clone)]
pub struct PsaDistributions {
    pub delta_cost: DistStats,
    pub delta_qaly: DistStats,
    pub net_benefit: DistStats,
}

pub fn psa_distributions(iterations: &[PsaIteration], wtp: f64) -> Option<PsaDistributions> {
    let mut delta_cost: Vec<f64> = iterations.iter().map(|it| it.delta_cost).collect();
    let mut delta_qaly: Vec<f64> = iterations.iter().map(|it| it.delta_qaly).collect();
    let mut nmb: Vec<f64> = iterations
        .iter()
        .map(|it| net_monetary_benefit(it.delta_cost, it.delta_qaly, wtp))
        .collect();
    Some(PsaDistributions {
        delta_cost: percentile_stats(&mut delta_cost)?,
        delta_qaly: percentile_stats(&mut delta_qaly)?,
        net_benefit: percentile_stats(&mut nmb)?,
    })
}

// ── Spreadsheet surface ──────────────────────────────────────────────────────

/// Quadrant code in the scalar sheet: 0 equivalent, 1 dominant, 2 cost per
/// QALY gained, 3 savings per QALY forgone, 4 dominated.
fn icer_quadrant_code(icer: IcerOutcome) -> f64 {
    match icer {
        IcerOutcome::Equivalent => 0.0,
        IcerOutcome::Dominant => 1.0,
        IcerOutcome::CostPerQaly(_) => 2.0,
        IcerOutcome::SavingsPerQalyForgone(_) => 3.0,
        IcerOutcome::Dominated => 4.0,
    }
}

fn event_scalars(out: &mut Vec<(String, f64)>, role: &str, events: &EventCounts) {
    let counts = [
        ("mi", events.mi),
        ("ischemic_stroke", events.ischemic_stroke),
        ("hemorrhagic_stroke", events.hemorrhagic_stroke),
        ("tia", events.tia),
        ("acute_hf", events.acute_hf),
        ("cv_death", events.cv_death),
        ("non_cv_death", events.non_cv_death),
        ("renal_death", events.renal_death),
    ];
    for (name, count) in counts {
        out.push((format!("{role}.events.{name}"), count as f64));
    }
}

fn arm_scalars(out: &mut Vec<(String, f64)>, role: &str, arm: &ArmResult) {
    out.push((format!("{role}.cohort_size"), arm.cohort_size as f64));
    out.push((format!("{role}.alive_at_horizon"), arm.alive_at_horizon as f64));
    out.push((format!("{role}.mean_cost"), arm.mean_discounted_cost));
    out.push((format!("{role}.mean_qaly"), arm.mean_discounted_qaly));
    out.push((format!("{role}.mean_life_years"), arm.mean_discounted_life_years));
    out.push((format!("{role}.divergence_recoveries"), arm.divergence_recoveries as f64));
    event_scalars(out, role, &arm.events);
}

/// The deterministic result as a flat key/value list. Keys are stable:
/// downstream workbooks reference them by name, so additions are fine and
/// renames are breaking. `icer` carries only a cost per QALY gained; the
/// southwest ratio reports under `icer_savings_per_qaly_forgone`, so neither
/// number can be read as the other.
pub fn cea_scalars(result: &CeaResult) -> Vec<(String, f64)> {
    let mut out = Vec::new();
    arm_scalars(&mut out, "comparator", &result.comparator);
    arm_scalars(&mut out, "intervention", &result.intervention);
    out.push(("delta_cost".to_string(), result.delta_cost));
    out.push(("delta_qaly".to_string(), result.delta_qaly));
    out.push(("delta_life_years".to_string(), result.delta_life_years));
    out.push(("icer_quadrant".to_string(), icer_quadrant_code(result.icer)));
    match result.icer {
        IcerOutcome::CostPerQaly(v) => {
            out.push(("icer".to_string(), v));
        }
        IcerOutcome::SavingsPerQalyForgone(v) => {
            out.push(("icer_savings_per_qaly_forgone".to_string(), v));
        }
        _ => {}
    }
    out
}

/// The probabilistic result as a flat key/value list, one `psa.ceac.<wtp>`
/// and `psa.evpi.<wtp>` entry per grid point.
pub fn psa_scalars(result: &PsaResult) -> Vec<(String, f64)> {
    let mut out = vec![
        ("psa.iterations".to_string(), result.iterations.len() as f64),
        ("psa.mean_delta_cost".to_string(), result.mean_delta_cost),
        ("psa.mean_delta_qaly".to_string(), result.mean_delta_qaly),
    ];
    for point in &result.ceac {
        out.push((format!("psa.ceac.{:.0}", point.wtp), point.probability));
    }
    for point in &result.evpi {
        out.push((format!("psa.evpi.{:.0}", point.wtp), point.expected_value));
    }
    for p in &result.importance {
        out.push((format!("psa.importance.{}", p.name), p.correlation));
    }
    out
}

/// Renders scalar pairs as the two-column csv the workbook imports.
pub fn scalar_sheet(pairs: &[(String, f64)]) -> String {
    let mut out = String::with_capacity(pairs.len() * 32);
    for (key, value) in pairs {
        out.push_str(key);
        out.push(',');
        out.push_str(&value.to_string());
        out.push('\n');
    }
    out
}

/// Parses an override sheet: one `key,value` pair per line, `#` comments and
/// blank lines skipped. Keys are the ones `SimulationConfig::apply_override`
/// accepts.
pub fn parse_overrides(text: &str) -> Result<Vec<(String, f64)>, ConfigError> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, raw) = line.split_once(',').ok_or_else(|| ConfigError::InvalidOverride {
            key: line.to_string(),
            value: f64::NAN,
            reason: "expected 'key,value'",
        })?;
        let value: f64 = raw.trim().parse().map_err(|_| ConfigError::InvalidOverride {
            key: key.trim().to_string(),
            value: f64::NAN,
            reason: "value is not a number",
        })?;
        pairs.push((key.trim().to_string(), value));
    }
    Ok(pairs)
}

// ── Trace rows ───────────────────────────────────────────────────────────────

/// One line of the NDJSON trace: a recorded transition flattened for
/// external tools. `from`/`to` carry the enums' snake_case names; treatment
/// rows add the change reason. `arm` keeps the two sides of a comparison
/// apart, since both run the same patient ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRow {
    pub arm: String,
    pub patient: u64,
    pub cycle: u32,
    pub domain: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub sbp: f64,
    pub egfr: f64,
    pub potassium: f64,
}

fn reason_name(reason: TreatmentChangeReason) -> &'static str {
    match reason {
        TreatmentChangeReason::Assigned => "assigned",
        TreatmentChangeReason::Discontinued => "discontinued",
        TreatmentChangeReason::SafetyStop => "safety_stop",
    }
}

impl TraceRow {
    pub fn from_record(arm: &str, patient: PatientId, record: &EventRecord) -> TraceRow {
        let (domain, from, to, reason) = match &record.transition {
            Transition::Cardiac { from, to } => ("cardiac", from.name(), to.name(), None),
            Transition::Renal { from, to } => ("renal", from.name(), to.name(), None),
            Transition::Neuro { from, to } => ("neuro", from.name(), to.name(), None),
            Transition::Treatment { from, to, reason } => (
                "treatment",
                from.map_or("none", Treatment::name),
                to.map_or("none", Treatment::name),
                Some(reason_name(*reason).to_string()),
            ),
            Transition::Adherence { adherent } => {
                let (from, to) =
                    if *adherent { ("nonadherent", "adherent") } else { ("adherent", "nonadherent") };
                ("adherence", from, to, None)
            }
        };
        TraceRow {
            arm: arm.to_string(),
            patient: patient.0,
            cycle: record.cycle.0,
            domain: domain.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            reason,
            sbp: record.sbp,
            egfr: record.egfr,
            potassium: record.potassium,
        }
    }
}

/// Flattens a finished cohort's histories, patients in id order, each
/// history in recording order.
pub fn trace_rows(arm: &str, cohort: &[Patient]) -> Vec<TraceRow> {
    cohort
        .iter()
        .flat_map(|p| p.history.iter().map(|record| TraceRow::from_record(arm, p.id, record)))
        .collect()
}

// ── History audit ────────────────────────────────────────────────────────────

/// A machine rule broken in a recorded history. The engine cannot produce
/// these; the audit exists for traces that crossed a process boundary and
/// for regression confidence on the engine itself.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryViolation {
    /// Consecutive cardiac transitions do not chain.
    CardiacChainBroken {
        patient: PatientId,
        cycle: Cycle,
        expected: CardiacState,
        found: CardiacState,
    },
    /// The transition after an acute entry is not the deterministic
    /// cooldown on the very next cycle.
    CooldownViolated { patient: PatientId, acute: CardiacState, detail: String },
    /// Renal staging moved to an equal or earlier stage.
    RenalStageRegressed { patient: PatientId, cycle: Cycle, from: RenalStage, to: RenalStage },
    /// Cognitive decline jumped more than one stage in a single cycle.
    NeuroStepSkipped { patient: PatientId, cycle: Cycle, from: NeuroState, to: NeuroState },
    /// A transition was recorded after a terminal state was entered.
    RecordAfterDeath { patient: PatientId, cycle: Cycle },
    /// A safety stop fired on a cycle that is not a scheduled check.
    SafetyStopOffSchedule { patient: PatientId, cycle: Cycle, interval: u32 },
}

impl std::fmt::Display for HistoryViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CardiacChainBroken { patient, cycle, expected, found } => {
                write!(
                    f,
                    "CardiacChainBroken patient={} cycle={}: expected from {expected:?}, found {found:?}",
                    patient.0, cycle.0
                )
            }
            Self::CooldownViolated { patient, acute, detail } => {
                write!(f, "CooldownViolated patient={} after {acute:?}: {detail}", patient.0)
            }
            Self::RenalStageRegressed { patient, cycle, from, to } => {
                write!(
                    f,
                    "RenalStageRegressed patient={} cycle={}: {from:?} -> {to:?}",
                    patient.0, cycle.0
                )
            }
            Self::NeuroStepSkipped { patient, cycle, from, to } => {
                write!(
                    f,
                    "NeuroStepSkipped patient={} cycle={}: {from:?} -> {to:?}",
                    patient.0, cycle.0
                )
            }
            Self::RecordAfterDeath { patient, cycle } => {
                write!(f, "RecordAfterDeath patient={} cycle={}", patient.0, cycle.0)
            }
            Self::SafetyStopOffSchedule { patient, cycle, interval } => {
                write!(
                    f,
                    "SafetyStopOffSchedule patient={} cycle={} interval={interval}",
                    patient.0, cycle.0
                )
            }
        }
    }
}

/// Re-checks one recorded history against the machine rules. Returns one
/// item per violation found.
pub fn audit_history(patient: &Patient, safety_interval_months: u32) -> Vec<HistoryViolation> {
    let mut violations = Vec::new();
    let mut last_cardiac: Option<(Cycle, CardiacState)> = None;
    let mut dead = false;

    for record in &patient.history {
        if dead {
            violations
                .push(HistoryViolation::RecordAfterDeath { patient: patient.id, cycle: record.cycle });
            continue;
        }
        match &record.transition {
            Transition::Cardiac { from, to } => {
                if let Some((prev_cycle, prev_to)) = last_cardiac {
                    if *from != prev_to {
                        violations.push(HistoryViolation::CardiacChainBroken {
                            patient: patient.id,
                            cycle: record.cycle,
                            expected: prev_to,
                            found: *from,
                        });
                    }
                    if prev_to.is_acute() {
                        let target = prev_to.cooldown();
                        let on_time = record.cycle.0 == prev_cycle.0 + 1;
                        if !on_time || Some(*to) != target {
                            violations.push(HistoryViolation::CooldownViolated {
                                patient: patient.id,
                                acute: prev_to,
                                detail: format!(
                                    "found {from:?} -> {to:?} at cycle {}, expected {target:?} at cycle {}",
                                    record.cycle.0,
                                    prev_cycle.0 + 1
                                ),
                            });
                        }
                    }
                }
                last_cardiac = Some((record.cycle, *to));
                if to.is_terminal() {
                    dead = true;
                }
            }
            Transition::Renal { from, to } => {
                if to.index() <= from.index() {
                    violations.push(HistoryViolation::RenalStageRegressed {
                        patient: patient.id,
                        cycle: record.cycle,
                        from: *from,
                        to: *to,
                    });
                }
                if to.is_terminal() {
                    dead = true;
                }
            }
            Transition::Neuro { from, to } => {
                if to.index() != from.index() + 1 {
                    violations.push(HistoryViolation::NeuroStepSkipped {
                        patient: patient.id,
                        cycle: record.cycle,
                        from: *from,
                        to: *to,
                    });
                }
            }
            Transition::Treatment { reason: TreatmentChangeReason::SafetyStop, .. } => {
                let c = record.cycle.0;
                let scheduled = safety_interval_months > 0 && c > 0 && c % safety_interval_months == 0;
                if !scheduled {
                    violations.push(HistoryViolation::SafetyStopOffSchedule {
                        patient: patient.id,
                        cycle: record.cycle,
                        interval: safety_interval_months,
                    });
                }
            }
            _ => {}
        }
    }
    violations
}

/// Audits every history in the cohort.
pub fn audit_cohort(cohort: &[Patient], safety_interval_months: u32) -> Vec<HistoryViolation> {
    cohort.iter().flat_map(|p| audit_history(p, safety_interval_months)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cea::run_cea;
    use crate::config::SimulationConfig;
    use crate::population::PopulationGenerator;
    use crate::psa::{CeacPoint, EvpiPoint, ParameterImportance};
    use crate::simulation::SimulationEngine;

    fn small_config() -> SimulationConfig {
        let mut config = SimulationConfig::canonical();
        config.population.cohort_size = 15;
        config.horizon_years = 3;
        config
    }

    fn blank_patient() -> Patient {
        let config = small_config();
        let mut patient =
            PopulationGenerator::new(&config).generate(11).unwrap().into_iter().next().unwrap();
        patient.history.clear();
        patient
    }

    fn value(pairs: &[(String, f64)], key: &str) -> f64 {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .unwrap_or_else(|| panic!("missing key '{key}'"))
            .1
    }

    /// A degenerate one-patient arm whose means are set directly, for driving
    /// the scalar sheet into a chosen quadrant.
    fn flat_arm(treatment: Option<Treatment>, cost: f64, qaly: f64) -> ArmResult {
        ArmResult {
            treatment,
            cohort_size: 1,
            alive_at_horizon: 1,
            total_discounted_cost: cost,
            total_discounted_qaly: qaly,
            total_discounted_life_years: 1.0,
            mean_discounted_cost: cost,
            mean_discounted_qaly: qaly,
            mean_discounted_life_years: 1.0,
            events: EventCounts::default(),
            divergence_recoveries: 0,
            patients: Vec::new(),
        }
    }

    // ── Distribution statistics ──────────────────────────────────────────────

    #[test]
    fn percentile_stats_known_values() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let ds = percentile_stats(&mut values).unwrap();
        assert_eq!(ds.n, 5);
        assert!((ds.min - 1.0).abs() < 1e-10, "min");
        assert!((ds.max - 5.0).abs() < 1e-10, "max");
        assert!((ds.p50 - 3.0).abs() < 1e-10, "p50");
        assert!((ds.mean - 3.0).abs() < 1e-10, "mean");
        assert!((ds.p25 - 2.0).abs() < 1e-10, "p25");
    }

    #[test]
    fn percentile_stats_empty_returns_none() {
        let mut values: Vec<f64> = vec![];
        assert!(percentile_stats(&mut values).is_none());
    }

    #[test]
    fn a_single_value_collapses_the_spread() {
        let mut values = vec![7.5];
        let ds = percentile_stats(&mut values).unwrap();
        assert_eq!(ds.n, 1);
        assert_eq!(ds.min, 7.5);
        assert_eq!(ds.max, 7.5);
        assert_eq!(ds.p50, 7.5);
        assert_eq!(ds.std_dev, 0.0);
    }

    #[test]
    fn arm_distributions_agree_with_the_arm_means() {
        let config = small_config();
        let arm = SimulationEngine::new(&config).run_arm(None, 21, None).unwrap();
        let dist = arm_distributions(&arm).unwrap();
        assert_eq!(dist.cost.n, arm.cohort_size);
        assert!((dist.cost.mean - arm.mean_discounted_cost).abs() < 1e-9);
        assert!((dist.qaly.mean - arm.mean_discounted_qaly).abs() < 1e-9);
        assert!(dist.months_alive.max <= f64::from(config.horizon_years * 12));
    }

    // ── Spreadsheet surface ──────────────────────────────────────────────────

    #[test]
    fn cea_scalars_cover_both_arms_and_the_deltas() {
        let config = small_config();
        let result =
            run_cea(&config, None, Some(Treatment::AceInhibitor), 33, None).unwrap();
        let pairs = cea_scalars(&result);

        assert_eq!(value(&pairs, "comparator.cohort_size"), 15.0);
        assert_eq!(value(&pairs, "intervention.cohort_size"), 15.0);
        assert!((value(&pairs, "comparator.mean_cost") - result.comparator.mean_discounted_cost)
            .abs()
            < 1e-12);
        assert!((value(&pairs, "delta_qaly") - result.delta_qaly).abs() < 1e-12);
        assert!((value(&pairs, "intervention.events.mi")
            - result.intervention.events.mi as f64)
            .abs()
            < 1e-12);

        // `icer` is reserved for the cost-per-QALY quadrant.
        let quadrant = value(&pairs, "icer_quadrant");
        let has_icer = pairs.iter().any(|(k, _)| k == "icer");
        assert_eq!(has_icer, quadrant == 2.0);
    }

    #[test]
    fn each_ratio_quadrant_reports_under_its_own_key() {
        let comparator = flat_arm(None, 1_000.0, 2.0);

        // Southwest: cheaper and less effective, savings per QALY forgone.
        let cheaper_worse = CeaResult::from_arms(
            comparator.clone(),
            flat_arm(Some(Treatment::AceInhibitor), 400.0, 1.8),
        );
        let pairs = cea_scalars(&cheaper_worse);
        assert_eq!(value(&pairs, "icer_quadrant"), 3.0);
        assert!((value(&pairs, "icer_savings_per_qaly_forgone") - 3_000.0).abs() < 1e-9);
        assert!(pairs.iter().all(|(k, _)| k != "icer"));

        // Northeast: dearer and more effective, cost per QALY gained.
        let dearer_better = CeaResult::from_arms(
            comparator,
            flat_arm(Some(Treatment::AceInhibitor), 1_600.0, 2.2),
        );
        let pairs = cea_scalars(&dearer_better);
        assert_eq!(value(&pairs, "icer_quadrant"), 2.0);
        assert!((value(&pairs, "icer") - 3_000.0).abs() < 1e-9);
        assert!(pairs.iter().all(|(k, _)| k != "icer_savings_per_qaly_forgone"));
    }

    #[test]
    fn psa_scalars_emit_one_entry_per_grid_point() {
        let result = PsaResult {
            iterations: Vec::new(),
            mean_delta_cost: 120.0,
            mean_delta_qaly: 0.01,
            ceac: vec![
                CeacPoint { wtp: 0.0, probability: 0.1 },
                CeacPoint { wtp: 20_000.0, probability: 0.8 },
            ],
            evpi: vec![EvpiPoint { wtp: 20_000.0, expected_value: 45.0 }],
            importance: vec![ParameterImportance {
                name: "cvd_calibration".to_string(),
                correlation: -0.9,
            }],
        };
        let pairs = psa_scalars(&result);
        assert_eq!(value(&pairs, "psa.iterations"), 0.0);
        assert_eq!(value(&pairs, "psa.ceac.20000"), 0.8);
        assert_eq!(value(&pairs, "psa.evpi.20000"), 45.0);
        assert_eq!(value(&pairs, "psa.importance.cvd_calibration"), -0.9);
    }

    #[test]
    fn scalar_sheet_renders_two_columns() {
        let pairs = vec![("delta_cost".to_string(), 12.5), ("delta_qaly".to_string(), 0.25)];
        assert_eq!(scalar_sheet(&pairs), "delta_cost,12.5\ndelta_qaly,0.25\n");
    }

    #[test]
    fn overrides_parse_and_reject() {
        let text = "# tariff scenario\n\ncosts.acute_mi, 9000\nutilities.post_mi,0.7\n";
        let pairs = parse_overrides(text).unwrap();
        assert_eq!(
            pairs,
            vec![("costs.acute_mi".to_string(), 9000.0), ("utilities.post_mi".to_string(), 0.7)]
        );

        assert!(matches!(
            parse_overrides("costs.acute_mi"),
            Err(ConfigError::InvalidOverride { .. })
        ));
        assert!(matches!(
            parse_overrides("costs.acute_mi,not-a-number"),
            Err(ConfigError::InvalidOverride { .. })
        ));
    }

    // ── Trace rows ───────────────────────────────────────────────────────────

    #[test]
    fn trace_rows_flatten_each_domain() {
        let mut patient = blank_patient();
        patient.record(
            Cycle(3),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::AcuteMi },
        );
        patient.record(
            Cycle(5),
            Transition::Treatment {
                from: Some(Treatment::AceInhibitor),
                to: None,
                reason: TreatmentChangeReason::Discontinued,
            },
        );
        patient.record(Cycle(6), Transition::Adherence { adherent: false });

        let rows = trace_rows("control", std::slice::from_ref(&patient));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].arm, "control");
        assert_eq!(rows[0].domain, "cardiac");
        assert_eq!(rows[0].from, "stable");
        assert_eq!(rows[0].to, "acute_mi");
        assert_eq!(rows[0].reason, None);
        assert_eq!(rows[1].domain, "treatment");
        assert_eq!(rows[1].from, "ace_inhibitor");
        assert_eq!(rows[1].to, "none");
        assert_eq!(rows[1].reason.as_deref(), Some("discontinued"));
        assert_eq!(rows[2].domain, "adherence");
        assert_eq!(rows[2].from, "adherent");
        assert_eq!(rows[2].to, "nonadherent");
        assert_eq!(rows[2].sbp, patient.sbp);
    }

    #[test]
    fn trace_rows_survive_a_json_round_trip() {
        let mut patient = blank_patient();
        patient.record(
            Cycle(14),
            Transition::Renal { from: RenalStage::Stage3a, to: RenalStage::Stage3b },
        );
        let row = &trace_rows("ace_inhibitor", std::slice::from_ref(&patient))[0];
        let line = serde_json::to_string(row).unwrap();
        assert!(!line.contains("reason"), "absent reason must not serialize");
        let back: TraceRow = serde_json::from_str(&line).unwrap();
        assert_eq!(&back, row);
    }

    // ── History audit ────────────────────────────────────────────────────────

    #[test]
    fn a_real_run_passes_the_audit() {
        let config = small_config();
        let mut cohort = PopulationGenerator::new(&config).generate(55).unwrap();
        SimulationEngine::new(&config)
            .run_cohort(&mut cohort, Some(Treatment::MineralocorticoidAntagonist), 55, None)
            .unwrap();
        let violations =
            audit_cohort(&cohort, config.treatment.safety.check_interval_months);
        assert!(violations.is_empty(), "clean run must audit clean, got: {violations:?}");
    }

    #[test]
    fn broken_cardiac_chains_are_flagged() {
        let mut patient = blank_patient();
        patient.record(
            Cycle(2),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::PostMi },
        );
        patient.record(
            Cycle(8),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::ChronicHf },
        );
        let violations = audit_history(&patient, 12);
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0],
            HistoryViolation::CardiacChainBroken {
                expected: CardiacState::PostMi,
                found: CardiacState::Stable,
                ..
            }
        ));
    }

    #[test]
    fn a_wrong_or_late_cooldown_is_flagged() {
        let mut patient = blank_patient();
        patient.record(
            Cycle(3),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::AcuteMi },
        );
        patient.record(
            Cycle(4),
            Transition::Cardiac { from: CardiacState::AcuteMi, to: CardiacState::ChronicHf },
        );
        let violations = audit_history(&patient, 12);
        assert!(violations
            .iter()
            .any(|v| matches!(v, HistoryViolation::CooldownViolated { .. })));

        let mut late = blank_patient();
        late.record(
            Cycle(3),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::AcuteMi },
        );
        late.record(
            Cycle(6),
            Transition::Cardiac { from: CardiacState::AcuteMi, to: CardiacState::PostMi },
        );
        let violations = audit_history(&late, 12);
        assert!(violations
            .iter()
            .any(|v| matches!(v, HistoryViolation::CooldownViolated { .. })));
    }

    #[test]
    fn renal_regressions_and_neuro_jumps_are_flagged() {
        let mut patient = blank_patient();
        patient.record(
            Cycle(9),
            Transition::Renal { from: RenalStage::Stage3b, to: RenalStage::Stage3a },
        );
        patient.record(
            Cycle(10),
            Transition::Neuro { from: NeuroState::Normal, to: NeuroState::Dementia },
        );
        let violations = audit_history(&patient, 12);
        assert_eq!(violations.len(), 2);
        assert!(matches!(violations[0], HistoryViolation::RenalStageRegressed { .. }));
        assert!(matches!(violations[1], HistoryViolation::NeuroStepSkipped { .. }));
    }

    #[test]
    fn records_after_death_are_flagged() {
        let mut patient = blank_patient();
        patient.record(
            Cycle(5),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::NonCvDeath },
        );
        patient.record(Cycle(6), Transition::Adherence { adherent: false });
        let violations = audit_history(&patient, 12);
        assert_eq!(
            violations,
            vec![HistoryViolation::RecordAfterDeath { patient: patient.id, cycle: Cycle(6) }]
        );
    }

    #[test]
    fn off_schedule_safety_stops_are_flagged() {
        let stop = || Transition::Treatment {
            from: Some(Treatment::MineralocorticoidAntagonist),
            to: None,
            reason: TreatmentChangeReason::SafetyStop,
        };

        let mut on_schedule = blank_patient();
        on_schedule.record(Cycle(24), stop());
        assert!(audit_history(&on_schedule, 12).is_empty());

        let mut off_schedule = blank_patient();
        off_schedule.record(Cycle(13), stop());
        let violations = audit_history(&off_schedule, 12);
        assert_eq!(
            violations,
            vec![HistoryViolation::SafetyStopOffSchedule {
                patient: off_schedule.id,
                cycle: Cycle(13),
                interval: 12,
            }]
        );
    }
}
