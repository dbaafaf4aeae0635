//! Cohort generation.
//!
//! One seed fully determines one cohort: every draw comes from a single
//! `ChaCha20Rng` in a fixed per-patient order, so two arms built from the
//! same seed get covariate-identical patients. Continuous covariates are
//! drawn around age-linked means, with systolic pressure, BMI and total
//! cholesterol coupled through a small Cholesky block.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;

use crate::config::SimulationConfig;
use crate::error::ConfigError;
use crate::patient::{CopdSeverity, Patient, SubstanceType};
use crate::phenotype::{BaselineRiskProfile, Etiology, PhenotypeScheme, SecondaryCause};
use crate::risk::CvdOutcome;
use crate::sampling::cholesky_decompose;
use crate::states::{CardiacState, NeuroState, RenalStage};
use crate::types::{PatientId, Sex};

// Relative weights for the conditional categorical draws.
const COPD_MODERATE_SPLIT: f64 = 0.50;
const COPD_SEVERE_SPLIT: f64 = 0.85;
const SUBSTANCE_STIMULANT_SPLIT: f64 = 0.60;
const SUBSTANCE_OPIOID_SPLIT: f64 = 0.85;
const SECONDARY_RAS_SPLIT: f64 = 0.45;
const SECONDARY_OSA_SPLIT: f64 = 0.70;
const SECONDARY_THYROID_SPLIT: f64 = 0.90;

fn standard_normal(rng: &mut ChaCha20Rng) -> f64 {
    rng.sample(StandardNormal)
}

/// Builds the correlated cohort for one run. Stateless apart from the
/// borrowed config; the seed is the whole identity of the output.
pub struct PopulationGenerator<'a> {
    config: &'a SimulationConfig,
}

impl<'a> PopulationGenerator<'a> {
    pub fn new(config: &'a SimulationConfig) -> Self {
        PopulationGenerator { config }
    }

    /// Generates the full cohort for `seed`. Fails only on a population
    /// config whose correlation block is not positive definite or whose
    /// ranges put generated covariates outside physiological bounds.
    pub fn generate(&self, seed: u64) -> Result<Vec<Patient>, ConfigError> {
        let p = &self.config.population;
        let correlation = [
            1.0,
            p.rho_sbp_bmi,
            p.rho_sbp_cholesterol,
            p.rho_sbp_bmi,
            1.0,
            p.rho_bmi_cholesterol,
            p.rho_sbp_cholesterol,
            p.rho_bmi_cholesterol,
            1.0,
        ];
        let Some(factor) = cholesky_decompose(&correlation, 3) else {
            return Err(ConfigError::CorrelationNotPositiveDefinite {
                block: "population_covariates".to_string(),
            });
        };

        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut cohort = Vec::with_capacity(p.cohort_size);
        for index in 0..p.cohort_size {
            let patient = self.generate_one(PatientId(index as u64), &mut rng, &factor);
            patient.validate()?;
            cohort.push(patient);
        }
        Ok(cohort)
    }

    fn generate_one(&self, id: PatientId, rng: &mut ChaCha20Rng, factor: &[f64]) -> Patient {
        let p = &self.config.population;
        let walks = &self.config.walks;

        let age = (p.age_mean + p.age_sd * standard_normal(rng)).clamp(p.age_min, p.age_max);
        let sex = if rng.random_bool(p.female_fraction) { Sex::Female } else { Sex::Male };
        let deprivation_quintile = rng.random_range(1..=5u8);

        // Correlated block: systolic pressure, BMI, total cholesterol.
        let z = [standard_normal(rng), standard_normal(rng), standard_normal(rng)];
        let w_sbp = factor[0] * z[0];
        let w_bmi = factor[3] * z[0] + factor[4] * z[1];
        let w_cholesterol = factor[6] * z[0] + factor[7] * z[1] + factor[8] * z[2];

        let decades_from_60 = (age - 60.0) / 10.0;
        let sbp = (p.sbp_mean + p.sbp_age_slope_per_decade * decades_from_60 + p.sbp_sd * w_sbp)
            .clamp(walks.sbp_lo, walks.sbp_hi);
        let bmi = (p.bmi_mean + p.bmi_sd * w_bmi).clamp(14.0, 60.0);
        let total_cholesterol =
            (p.total_cholesterol_mean + p.total_cholesterol_sd * w_cholesterol).clamp(2.0, 12.0);

        let dbp = (p.dbp_mean + p.dbp_sd * standard_normal(rng)).clamp(walks.dbp_lo, walks.dbp_hi);
        let white_coat_offset =
            (p.white_coat_mean + p.white_coat_sd * standard_normal(rng)).clamp(-10.0, 25.0);

        let decades_from_65 = (age - 65.0) / 10.0;
        let egfr = (p.egfr_mean_at_65 - p.egfr_age_slope_per_decade * decades_from_65
            + p.egfr_sd * standard_normal(rng))
        .clamp(5.0, 140.0);

        let diabetes = rng.random_bool(p.diabetes_prevalence(age));
        let log_uacr = p.uacr_log_mean
            + if diabetes { p.uacr_diabetes_log_shift } else { 0.0 }
            + p.uacr_log_sd * standard_normal(rng);
        let uacr = log_uacr.exp().clamp(1.0, 5_000.0);

        let hdl_cholesterol = (p.hdl_mean + p.hdl_sd * standard_normal(rng)).clamp(0.5, 3.5);
        let potassium = (p.potassium_mean + p.potassium_sd * standard_normal(rng))
            .clamp(walks.potassium_lo, walks.potassium_hi);

        let smoking = rng.random_bool(p.smoking_prevalence);
        let copd = if rng.random_bool(p.copd_prevalence) {
            let split = rng.random::<f64>();
            Some(if split < COPD_MODERATE_SPLIT {
                CopdSeverity::Mild
            } else if split < COPD_SEVERE_SPLIT {
                CopdSeverity::Moderate
            } else {
                CopdSeverity::Severe
            })
        } else {
            None
        };
        let substance_use = if rng.random_bool(p.substance_use_prevalence) {
            let split = rng.random::<f64>();
            Some(if split < SUBSTANCE_STIMULANT_SPLIT {
                SubstanceType::Alcohol
            } else if split < SUBSTANCE_OPIOID_SPLIT {
                SubstanceType::Stimulant
            } else {
                SubstanceType::Opioid
            })
        } else {
            None
        };
        let depression = rng.random_bool(p.depression_prevalence);
        let anxiety = rng.random_bool(p.anxiety_prevalence);
        let serious_mental_illness = rng.random_bool(p.serious_mental_illness_prevalence);
        let atrial_fibrillation = rng.random_bool(p.af_prevalence(age));
        let peripheral_artery_disease = rng.random_bool(p.pad_prevalence);

        let etiology = if rng.random_bool(p.secondary_etiology_fraction) {
            let split = rng.random::<f64>();
            Etiology::Secondary(if split < SECONDARY_RAS_SPLIT {
                SecondaryCause::PrimaryAldosteronism
            } else if split < SECONDARY_OSA_SPLIT {
                SecondaryCause::RenalArteryStenosis
            } else if split < SECONDARY_THYROID_SPLIT {
                SecondaryCause::ObstructiveSleepApnea
            } else {
                SecondaryCause::ThyroidDisorder
            })
        } else {
            Etiology::Primary
        };

        let office_sbp = sbp + white_coat_offset;
        let office_dbp = dbp + white_coat_offset * 0.5;
        let scheme = PhenotypeScheme::select(age, office_sbp, office_dbp, egfr, uacr);

        let mut patient = Patient {
            id,
            age,
            sex,
            deprivation_quintile,
            sbp,
            dbp,
            white_coat_offset,
            egfr,
            uacr,
            total_cholesterol,
            hdl_cholesterol,
            bmi,
            potassium,
            diabetes,
            smoking,
            copd,
            substance_use,
            depression,
            anxiety,
            serious_mental_illness,
            atrial_fibrillation,
            peripheral_artery_disease,
            adherent: true,
            cycles_since_adherence_change: 0,
            assigned: None,
            baseline: BaselineRiskProfile::new(scheme, etiology, 0.0),
            cardiac: CardiacState::Stable,
            renal: RenalStage::from_egfr(egfr),
            neuro: NeuroState::Normal,
            discounted_cost: 0.0,
            discounted_qaly: 0.0,
            discounted_life_years: 0.0,
            months_alive: 0,
            months_in_cardiac: [0; CardiacState::COUNT],
            months_in_renal: [0; RenalStage::COUNT],
            months_in_neuro: [0; NeuroState::COUNT],
            divergence_recoveries: 0,
            history: Vec::new(),
        };
        let ten_year = self.ten_year_cvd_risk(&patient);
        patient.baseline = BaselineRiskProfile::new(scheme, etiology, ten_year);
        patient
    }

    /// Composite ten-year risk across the cardiovascular outcomes, frozen
    /// into the baseline profile at t=0.
    fn ten_year_cvd_risk(&self, patient: &Patient) -> f64 {
        let inputs = patient.risk_inputs(false);
        let mut annual_survival = 1.0;
        for outcome in [
            CvdOutcome::Mi,
            CvdOutcome::IschemicStroke,
            CvdOutcome::HemorrhagicStroke,
            CvdOutcome::HeartFailure,
            CvdOutcome::CvDeath,
        ] {
            let annual = self.config.risk.cvd.annual_probability(&inputs, outcome, 1.0);
            annual_survival *= 1.0 - annual;
        }
        1.0 - annual_survival.powi(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(seed: u64, cohort_size: usize) -> Vec<Patient> {
        let mut config = SimulationConfig::canonical();
        config.population.cohort_size = cohort_size;
        PopulationGenerator::new(&config).generate(seed).unwrap()
    }

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

    // ── Determinism ──────────────────────────────────────────────────────────

    #[test]
    fn same_seed_reproduces_the_same_cohort() {
        let first = generate(42, 200);
        let second = generate(42, 200);
        assert_eq!(first, second);
    }

    #[test]
    fn different_seeds_diverge() {
        let first = generate(42, 200);
        let second = generate(43, 200);
        assert_ne!(first, second);
    }

    #[test]
    fn ids_are_dense_and_cohort_size_is_respected() {
        let cohort = generate(7, 150);
        assert_eq!(cohort.len(), 150);
        for (index, patient) in cohort.iter().enumerate() {
            assert_eq!(patient.id, PatientId(index as u64));
        }
    }

    // ── Baseline state ───────────────────────────────────────────────────────

    #[test]
    fn everyone_starts_alive_untreated_and_consistent() {
        for patient in generate(11, 400) {
            assert!(patient.is_alive());
            assert_eq!(patient.cardiac, CardiacState::Stable);
            assert_eq!(patient.neuro, NeuroState::Normal);
            assert_eq!(patient.renal, RenalStage::from_egfr(patient.egfr));
            assert!(patient.assigned.is_none());
            assert!(patient.adherent);
            assert_eq!(patient.months_alive, 0);
            assert!(patient.history.is_empty());
            assert!((0.0..=1.0).contains(&patient.baseline.ten_year_cvd_risk));
            patient.validate().unwrap();
        }
    }

    #[test]
    fn renal_dominant_scheme_tracks_low_egfr() {
        for patient in generate(13, 400) {
            if patient.egfr < 60.0 {
                assert!(matches!(
                    patient.baseline.scheme(),
                    PhenotypeScheme::RenalDominant(_)
                ));
            }
        }
    }

    #[test]
    fn age_stays_within_configured_bounds() {
        let mut config = SimulationConfig::canonical();
        config.population.cohort_size = 400;
        config.population.age_sd = 25.0;
        let cohort = PopulationGenerator::new(&config).generate(3).unwrap();
        for patient in cohort {
            assert!(patient.age >= config.population.age_min);
            assert!(patient.age <= config.population.age_max);
        }
    }

    // ── Distributional shape ─────────────────────────────────────────────────

    #[test]
    fn covariate_correlations_land_near_targets() {
        let cohort = generate(42, 4_000);
        let sbp: Vec<f64> = cohort.iter().map(|p| p.sbp).collect();
        let bmi: Vec<f64> = cohort.iter().map(|p| p.bmi).collect();
        let cholesterol: Vec<f64> = cohort.iter().map(|p| p.total_cholesterol).collect();
        assert!((pearson(&sbp, &bmi) - 0.25).abs() < 0.08, "got {}", pearson(&sbp, &bmi));
        assert!((pearson(&bmi, &cholesterol) - 0.22).abs() < 0.08);
        assert!((pearson(&sbp, &cholesterol) - 0.12).abs() < 0.08);
    }

    #[test]
    fn prevalences_land_near_expectations() {
        let cohort = generate(42, 4_000);
        let n = cohort.len() as f64;
        let female = cohort.iter().filter(|p| p.sex == Sex::Female).count() as f64 / n;
        assert!((female - 0.47).abs() < 0.03, "female fraction {female}");
        let smoking = cohort.iter().filter(|p| p.smoking).count() as f64 / n;
        assert!((smoking - 0.16).abs() < 0.03);
        let diabetes = cohort.iter().filter(|p| p.diabetes).count() as f64 / n;
        assert!((0.10..=0.30).contains(&diabetes), "diabetes fraction {diabetes}");
        let secondary = cohort
            .iter()
            .filter(|p| p.baseline.etiology() != Etiology::Primary)
            .count() as f64
            / n;
        assert!((secondary - 0.10).abs() < 0.03);
    }

    #[test]
    fn diabetic_patients_skew_to_higher_albuminuria() {
        let cohort = generate(42, 4_000);
        let mean_log = |diabetic: bool| {
            let values: Vec<f64> = cohort
                .iter()
                .filter(|p| p.diabetes == diabetic)
                .map(|p| p.uacr.ln())
                .collect();
            values.iter().sum::<f64>() / values.len() as f64
        };
        assert!(mean_log(true) > mean_log(false) + 0.3);
    }

    #[test]
    fn rejects_non_positive_definite_covariate_block() {
        let mut config = SimulationConfig::canonical();
        config.population.rho_sbp_bmi = 0.99;
        config.population.rho_sbp_cholesterol = -0.99;
        config.population.rho_bmi_cholesterol = 0.99;
        assert!(matches!(
            PopulationGenerator::new(&config).generate(1).unwrap_err(),
            ConfigError::CorrelationNotPositiveDefinite { .. }
        ));
    }
}
