//! Treatment assignment, adherence and discontinuation.
//!
//! Everything stochastic here draws from the caller's injected RNG stream;
//! the model itself holds no generator and no mutable state, so one instance
//! is shared read-only across every patient and every PSA iteration.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::risk::annual_to_monthly_probability;
use crate::types::Cycle;

/// Antihypertensive drug classes. Interop code 0 is reserved for the
/// no-treatment comparator arm, so `code()` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Treatment {
    AceInhibitor,
    CalciumChannelBlocker,
    ThiazideDiuretic,
    MineralocorticoidAntagonist,
}

impl Treatment {
    pub const ALL: [Treatment; 4] = [
        Treatment::AceInhibitor,
        Treatment::CalciumChannelBlocker,
        Treatment::ThiazideDiuretic,
        Treatment::MineralocorticoidAntagonist,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Treatment::AceInhibitor => "ace_inhibitor",
            Treatment::CalciumChannelBlocker => "calcium_channel_blocker",
            Treatment::ThiazideDiuretic => "thiazide_diuretic",
            Treatment::MineralocorticoidAntagonist => "mineralocorticoid_antagonist",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Treatment::AceInhibitor => 1,
            Treatment::CalciumChannelBlocker => 2,
            Treatment::ThiazideDiuretic => 3,
            Treatment::MineralocorticoidAntagonist => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Treatment::AceInhibitor),
            2 => Some(Treatment::CalciumChannelBlocker),
            3 => Some(Treatment::ThiazideDiuretic),
            4 => Some(Treatment::MineralocorticoidAntagonist),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Treatment::ALL.into_iter().find(|t| t.name() == name)
    }

    /// RAAS blockade slows eGFR decline; the other classes do not.
    pub fn is_kidney_protective(self) -> bool {
        matches!(self, Treatment::AceInhibitor | Treatment::MineralocorticoidAntagonist)
    }

    /// Shift applied to the potassium walk's long-run target while the drug
    /// is active. Positive for RAAS blockade, negative for thiazides.
    pub fn potassium_target_shift(self) -> f64 {
        match self {
            Treatment::AceInhibitor => 0.3,
            Treatment::CalciumChannelBlocker => 0.0,
            Treatment::ThiazideDiuretic => -0.25,
            Treatment::MineralocorticoidAntagonist => 0.6,
        }
    }
}

/// One immutable effect-table row. PSA perturbs these through per-run
/// config overrides; nothing ever writes to a shared table mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentEffect {
    pub treatment: Treatment,
    /// Nominal SBP reduction in mmHg for a fully adherent average responder.
    pub mean_sbp_reduction: f64,
    pub sd_sbp_reduction: f64,
    pub annual_discontinuation: f64,
    pub monthly_cost: f64,
    /// Tolerability and dosing convenience, around 1.0. Scales adherence
    /// flip probabilities, never the effect itself.
    pub attractiveness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectTable {
    rows: Vec<TreatmentEffect>,
}

impl EffectTable {
    pub fn new(rows: Vec<TreatmentEffect>) -> Self {
        EffectTable { rows }
    }

    pub fn canonical() -> Self {
        EffectTable {
            rows: vec![
                TreatmentEffect {
                    treatment: Treatment::AceInhibitor,
                    mean_sbp_reduction: 9.0,
                    sd_sbp_reduction: 3.5,
                    annual_discontinuation: 0.10,
                    monthly_cost: 4.50,
                    attractiveness: 1.1,
                },
                TreatmentEffect {
                    treatment: Treatment::CalciumChannelBlocker,
                    mean_sbp_reduction: 8.5,
                    sd_sbp_reduction: 3.2,
                    annual_discontinuation: 0.12,
                    monthly_cost: 3.80,
                    attractiveness: 1.0,
                },
                TreatmentEffect {
                    treatment: Treatment::ThiazideDiuretic,
                    mean_sbp_reduction: 7.0,
                    sd_sbp_reduction: 3.0,
                    annual_discontinuation: 0.13,
                    monthly_cost: 1.20,
                    attractiveness: 0.95,
                },
                TreatmentEffect {
                    treatment: Treatment::MineralocorticoidAntagonist,
                    mean_sbp_reduction: 8.0,
                    sd_sbp_reduction: 4.0,
                    annual_discontinuation: 0.18,
                    monthly_cost: 6.00,
                    attractiveness: 0.85,
                },
            ],
        }
    }

    pub fn get(&self, treatment: Treatment) -> Result<&TreatmentEffect, ConfigError> {
        self.rows.iter().find(|r| r.treatment == treatment).ok_or(
            ConfigError::MissingTreatmentEffect { treatment: treatment.name().to_string() },
        )
    }

    pub fn get_mut(&mut self, treatment: Treatment) -> Result<&mut TreatmentEffect, ConfigError> {
        self.rows.iter_mut().find(|r| r.treatment == treatment).ok_or(
            ConfigError::MissingTreatmentEffect { treatment: treatment.name().to_string() },
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for treatment in Treatment::ALL {
            let row = self.get(treatment)?;
            if !(0.0..=1.0).contains(&row.annual_discontinuation) {
                return Err(ConfigError::ProbabilityOutOfRange {
                    field: "annual_discontinuation",
                    value: row.annual_discontinuation,
                });
            }
            for (field, value) in [
                ("mean_sbp_reduction", row.mean_sbp_reduction),
                ("sd_sbp_reduction", row.sd_sbp_reduction),
                ("monthly_cost", row.monthly_cost),
                ("attractiveness", row.attractiveness),
            ] {
                if !value.is_finite() || value < 0.0 {
                    return Err(ConfigError::NonFinite { field, value });
                }
            }
        }
        Ok(())
    }
}

/// The effect a patient actually carries once assigned. `nominal_sbp` is the
/// fully adherent reduction; the adherence fraction is applied at read time
/// because adherence changes cycle to cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssignedTreatment {
    pub treatment: Treatment,
    pub nominal_sbp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdherenceModel {
    pub annual_become_nonadherent: f64,
    pub annual_regain_adherence: f64,
    /// Applied to the become-nonadherent probability for patients over 75.
    pub age_over_75_multiplier: f64,
    /// Compounded per deprivation quintile above the first.
    pub per_deprivation_quintile: f64,
    /// Fraction of the nominal effect a non-adherent patient still realizes.
    pub nonadherent_effect_fraction: f64,
}

impl AdherenceModel {
    pub fn canonical() -> Self {
        AdherenceModel {
            annual_become_nonadherent: 0.15,
            annual_regain_adherence: 0.05,
            age_over_75_multiplier: 1.3,
            per_deprivation_quintile: 1.08,
            nonadherent_effect_fraction: 0.3,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("annual_become_nonadherent", self.annual_become_nonadherent),
            ("annual_regain_adherence", self.annual_regain_adherence),
            ("nonadherent_effect_fraction", self.nonadherent_effect_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { field, value });
            }
        }
        for (field, value) in [
            ("age_over_75_multiplier", self.age_over_75_multiplier),
            ("per_deprivation_quintile", self.per_deprivation_quintile),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NonFinite { field, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRule {
    /// Serum potassium, mmol/L, at or above which treatment stops.
    pub potassium_stop_threshold: f64,
    /// Cycles between lab checks. Zero disables the schedule entirely.
    pub check_interval_months: u32,
}

impl SafetyRule {
    pub fn canonical() -> Self {
        SafetyRule { potassium_stop_threshold: 5.5, check_interval_months: 12 }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.potassium_stop_threshold.is_finite() || self.potassium_stop_threshold <= 0.0 {
            return Err(ConfigError::NonFinite {
                field: "potassium_stop_threshold",
                value: self.potassium_stop_threshold,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentModel {
    pub effects: EffectTable,
    pub adherence: AdherenceModel,
    pub safety: SafetyRule,
}

impl TreatmentModel {
    pub fn canonical() -> Self {
        TreatmentModel {
            effects: EffectTable::canonical(),
            adherence: AdherenceModel::canonical(),
            safety: SafetyRule::canonical(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.effects.validate()?;
        self.adherence.validate()?;
        self.safety.validate()
    }

    /// Draws the individualized effect for one patient: Normal around the
    /// class mean, clamped non-negative, scaled by the patient's
    /// etiology/phenotype response modifier.
    pub fn assign(
        &self,
        rng: &mut impl Rng,
        treatment: Treatment,
        response_modifier: f64,
    ) -> Result<AssignedTreatment, ConfigError> {
        let row = self.effects.get(treatment)?;
        let normal =
            Normal::new(row.mean_sbp_reduction, row.sd_sbp_reduction).map_err(|_| {
                ConfigError::InvalidMarginal {
                    name: treatment.name().to_string(),
                    reason: "effect standard deviation must be finite and non-negative",
                }
            })?;
        let drawn: f64 = normal.sample(rng);
        let nominal_sbp = drawn.max(0.0) * response_modifier.max(0.0);
        Ok(AssignedTreatment { treatment, nominal_sbp })
    }

    /// The mmHg reduction the patient realizes this cycle given adherence.
    pub fn realized_effect(&self, assigned: &AssignedTreatment, adherent: bool) -> f64 {
        if adherent {
            assigned.nominal_sbp
        } else {
            assigned.nominal_sbp * self.adherence.nonadherent_effect_fraction
        }
    }

    /// Monthly Bernoulli draw against the exactly-converted annualized rate.
    pub fn check_discontinuation(
        &self,
        rng: &mut impl Rng,
        treatment: Treatment,
    ) -> Result<bool, ConfigError> {
        let row = self.effects.get(treatment)?;
        let p = annual_to_monthly_probability(row.annual_discontinuation);
        Ok(rng.random_bool(p.clamp(0.0, 1.0)))
    }

    /// Monthly probability of flipping adherence state. Risk factors scale
    /// the probability, never the flip itself: older and more deprived
    /// patients lapse more, attractive regimens lapse less and are easier
    /// to return to. Asymmetric on purpose.
    pub fn adherence_flip_probability(
        &self,
        currently_adherent: bool,
        age: f64,
        deprivation_quintile: u8,
        treatment: Treatment,
    ) -> Result<f64, ConfigError> {
        let row = self.effects.get(treatment)?;
        let quintile = deprivation_quintile.clamp(1, 5);
        let deprivation =
            self.adherence.per_deprivation_quintile.powi(i32::from(quintile) - 1);
        let p = if currently_adherent {
            let age_factor = if age > 75.0 { self.adherence.age_over_75_multiplier } else { 1.0 };
            annual_to_monthly_probability(self.adherence.annual_become_nonadherent)
                * age_factor
                * deprivation
                / row.attractiveness
        } else {
            annual_to_monthly_probability(self.adherence.annual_regain_adherence)
                * row.attractiveness
                / deprivation
        };
        Ok(p.clamp(0.0, 0.5))
    }

    pub fn check_adherence_flip(
        &self,
        rng: &mut impl Rng,
        currently_adherent: bool,
        age: f64,
        deprivation_quintile: u8,
        treatment: Treatment,
    ) -> Result<bool, ConfigError> {
        let p = self.adherence_flip_probability(
            currently_adherent,
            age,
            deprivation_quintile,
            treatment,
        )?;
        Ok(rng.random_bool(p))
    }

    /// Lab checks run on a fixed schedule; cycle 0 is baseline and skipped.
    pub fn safety_check_due(&self, cycle: Cycle) -> bool {
        let interval = self.safety.check_interval_months;
        interval > 0 && cycle.0 > 0 && cycle.0 % interval == 0
    }

    pub fn safety_stop_triggered(&self, potassium: f64) -> bool {
        potassium >= self.safety.potassium_stop_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn rng(seed: u64) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(seed)
    }

    // ── Assignment ───────────────────────────────────────────────────────────

    #[test]
    fn assigned_effect_is_never_negative() {
        let model = TreatmentModel::canonical();
        let mut r = rng(11);
        for _ in 0..2_000 {
            let assigned = model
                .assign(&mut r, Treatment::MineralocorticoidAntagonist, 1.0)
                .unwrap();
            assert!(assigned.nominal_sbp >= 0.0);
        }
    }

    #[test]
    fn response_modifier_scales_the_draw() {
        let model = TreatmentModel::canonical();
        let a = model.assign(&mut rng(99), Treatment::AceInhibitor, 1.0).unwrap();
        let b = model.assign(&mut rng(99), Treatment::AceInhibitor, 2.0).unwrap();
        assert!((b.nominal_sbp - 2.0 * a.nominal_sbp).abs() < 1e-12);
        let zero = model.assign(&mut rng(99), Treatment::AceInhibitor, -1.0).unwrap();
        assert_eq!(zero.nominal_sbp, 0.0);
    }

    #[test]
    fn effect_draws_center_on_the_class_mean() {
        let model = TreatmentModel::canonical();
        let mut r = rng(7);
        let n = 10_000;
        let total: f64 = (0..n)
            .map(|_| model.assign(&mut r, Treatment::AceInhibitor, 1.0).unwrap().nominal_sbp)
            .sum();
        let mean = total / n as f64;
        // Clamping at zero pulls the mean up slightly; 9.0 +- 0.3 holds
        // comfortably at sd 3.5.
        assert!((mean - 9.0).abs() < 0.3, "mean {mean}");
    }

    #[test]
    fn nonadherent_patients_realize_a_fraction() {
        let model = TreatmentModel::canonical();
        let assigned = AssignedTreatment { treatment: Treatment::AceInhibitor, nominal_sbp: 10.0 };
        assert_eq!(model.realized_effect(&assigned, true), 10.0);
        assert!((model.realized_effect(&assigned, false) - 3.0).abs() < 1e-12);
    }

    // ── Discontinuation ──────────────────────────────────────────────────────

    #[test]
    fn discontinuation_rate_matches_exact_conversion() {
        let model = TreatmentModel::canonical();
        let mut r = rng(5);
        let n = 60_000;
        let stops = (0..n)
            .filter(|_| model.check_discontinuation(&mut r, Treatment::AceInhibitor).unwrap())
            .count();
        let observed = stops as f64 / n as f64;
        let expected = annual_to_monthly_probability(0.10);
        assert!(
            (observed - expected).abs() < 0.002,
            "observed {observed}, expected {expected}"
        );
    }

    // ── Adherence ────────────────────────────────────────────────────────────

    #[test]
    fn flips_are_asymmetric() {
        let model = TreatmentModel::canonical();
        let lapse = model
            .adherence_flip_probability(true, 60.0, 3, Treatment::CalciumChannelBlocker)
            .unwrap();
        let regain = model
            .adherence_flip_probability(false, 60.0, 3, Treatment::CalciumChannelBlocker)
            .unwrap();
        assert!(lapse > regain);
    }

    #[test]
    fn age_and_deprivation_raise_lapse_probability() {
        let model = TreatmentModel::canonical();
        let young = model
            .adherence_flip_probability(true, 60.0, 1, Treatment::AceInhibitor)
            .unwrap();
        let old = model
            .adherence_flip_probability(true, 80.0, 1, Treatment::AceInhibitor)
            .unwrap();
        let deprived = model
            .adherence_flip_probability(true, 60.0, 5, Treatment::AceInhibitor)
            .unwrap();
        assert!(old > young);
        assert!(deprived > young);
    }

    #[test]
    fn attractiveness_cuts_lapse_and_aids_regain() {
        let model = TreatmentModel::canonical();
        // ACE (1.1) vs MRA (0.85): the attractive regimen lapses less.
        let ace_lapse =
            model.adherence_flip_probability(true, 60.0, 3, Treatment::AceInhibitor).unwrap();
        let mra_lapse = model
            .adherence_flip_probability(true, 60.0, 3, Treatment::MineralocorticoidAntagonist)
            .unwrap();
        assert!(ace_lapse < mra_lapse);
        let ace_regain =
            model.adherence_flip_probability(false, 60.0, 3, Treatment::AceInhibitor).unwrap();
        let mra_regain = model
            .adherence_flip_probability(false, 60.0, 3, Treatment::MineralocorticoidAntagonist)
            .unwrap();
        assert!(ace_regain > mra_regain);
    }

    // ── Safety ───────────────────────────────────────────────────────────────

    #[test]
    fn safety_checks_run_on_schedule() {
        let model = TreatmentModel::canonical();
        assert!(!model.safety_check_due(Cycle(0)));
        assert!(!model.safety_check_due(Cycle(11)));
        assert!(model.safety_check_due(Cycle(12)));
        assert!(model.safety_check_due(Cycle(24)));
        assert!(!model.safety_check_due(Cycle(25)));
    }

    #[test]
    fn zero_interval_disables_the_schedule() {
        let mut model = TreatmentModel::canonical();
        model.safety.check_interval_months = 0;
        model.validate().unwrap();
        for cycle in 0..120 {
            assert!(!model.safety_check_due(Cycle(cycle)));
        }
    }

    #[test]
    fn potassium_threshold_is_inclusive() {
        let model = TreatmentModel::canonical();
        assert!(!model.safety_stop_triggered(5.49));
        assert!(model.safety_stop_triggered(5.5));
        assert!(model.safety_stop_triggered(6.8));
    }

    // ── Table integrity ──────────────────────────────────────────────────────

    #[test]
    fn canonical_table_validates_and_covers_every_class() {
        let model = TreatmentModel::canonical();
        model.validate().unwrap();
        for t in Treatment::ALL {
            assert!(model.effects.get(t).is_ok());
        }
    }

    #[test]
    fn missing_row_is_a_config_error() {
        let table = EffectTable::new(vec![]);
        let err = table.get(Treatment::AceInhibitor).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTreatmentEffect { .. }));
    }

    #[test]
    fn invalid_discontinuation_fails_validation() {
        let mut table = EffectTable::canonical();
        table.get_mut(Treatment::ThiazideDiuretic).unwrap().annual_discontinuation = 1.4;
        let err = table.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ProbabilityOutOfRange { .. }));
    }

    #[test]
    fn treatment_codes_round_trip_and_reserve_zero() {
        for t in Treatment::ALL {
            assert!(t.code() > 0);
            assert_eq!(Treatment::from_code(t.code()), Some(t));
            assert_eq!(Treatment::from_name(t.name()), Some(t));
        }
        assert_eq!(Treatment::from_code(0), None);
    }
}
