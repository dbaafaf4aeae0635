//! Run configuration: one immutable value owning every table a run reads.
//!
//! `canonical()` is the complete default parameterization. External callers
//! (spreadsheet ingest, PSA) adjust it through `apply_override`, the flat
//! key→value surface; nothing in the engine ever writes to a config after
//! `validate()` has passed.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::risk::RiskModel;
use crate::states::{CardiacState, NeuroState, RenalStage};
use crate::treatment::{Treatment, TreatmentModel};
use crate::types::{Country, Perspective};

// ── Costs ────────────────────────────────────────────────────────────────────

/// All amounts in GBP at present-day prices. One-time costs land in the
/// cycle the event fires; monthly costs accrue per cycle of occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostConfig {
    pub acute_mi: f64,
    pub acute_ischemic_stroke: f64,
    pub acute_hemorrhagic_stroke: f64,
    pub tia: f64,
    pub acute_hf: f64,
    /// Terminal-care cost charged once in the cycle of death.
    pub cv_death: f64,
    pub non_cv_death: f64,
    pub renal_death: f64,

    pub post_mi_monthly: f64,
    pub post_stroke_monthly: f64,
    pub chronic_hf_monthly: f64,
    pub stage_3a_monthly: f64,
    pub stage_3b_monthly: f64,
    pub stage_4_monthly: f64,
    pub dialysis_monthly: f64,
    pub mild_impairment_monthly: f64,
    pub dementia_monthly: f64,

    /// Societal perspective only: lost output per acute event before
    /// retirement age.
    pub productivity_per_acute_event: f64,
    pub retirement_age: f64,
}

impl CostConfig {
    pub fn canonical() -> Self {
        CostConfig {
            acute_mi: 6_800.0,
            acute_ischemic_stroke: 9_200.0,
            acute_hemorrhagic_stroke: 12_500.0,
            tia: 2_400.0,
            acute_hf: 5_200.0,
            cv_death: 4_500.0,
            non_cv_death: 3_200.0,
            renal_death: 6_000.0,
            post_mi_monthly: 55.0,
            post_stroke_monthly: 140.0,
            chronic_hf_monthly: 180.0,
            stage_3a_monthly: 15.0,
            stage_3b_monthly: 35.0,
            stage_4_monthly: 110.0,
            dialysis_monthly: 2_600.0,
            mild_impairment_monthly: 120.0,
            dementia_monthly: 950.0,
            productivity_per_acute_event: 3_800.0,
            retirement_age: 66.0,
        }
    }

    /// One-time cost for entering `to`. Zero for background states.
    pub fn acute_event_cost(&self, to: CardiacState) -> f64 {
        match to {
            CardiacState::AcuteMi => self.acute_mi,
            CardiacState::AcuteIschemicStroke => self.acute_ischemic_stroke,
            CardiacState::AcuteHemorrhagicStroke => self.acute_hemorrhagic_stroke,
            CardiacState::Tia => self.tia,
            CardiacState::AcuteHf => self.acute_hf,
            CardiacState::CvDeath => self.cv_death,
            CardiacState::NonCvDeath => self.non_cv_death,
            CardiacState::Stable
            | CardiacState::PostMi
            | CardiacState::PostStroke
            | CardiacState::ChronicHf => 0.0,
        }
    }

    /// Monthly management cost for the current state triple. Additive across
    /// domains; drug cost is layered on separately by the engine.
    pub fn monthly_state_cost(
        &self,
        cardiac: CardiacState,
        renal: RenalStage,
        neuro: NeuroState,
    ) -> f64 {
        let cardiac_cost = match cardiac {
            CardiacState::PostMi => self.post_mi_monthly,
            CardiacState::PostStroke => self.post_stroke_monthly,
            CardiacState::ChronicHf => self.chronic_hf_monthly,
            // Acute cycles are covered by the one-time cost.
            _ => 0.0,
        };
        let renal_cost = match renal {
            RenalStage::Normal | RenalStage::RenalDeath => 0.0,
            RenalStage::Stage3a => self.stage_3a_monthly,
            RenalStage::Stage3b => self.stage_3b_monthly,
            RenalStage::Stage4 => self.stage_4_monthly,
            RenalStage::KidneyFailure => self.dialysis_monthly,
        };
        let neuro_cost = match neuro {
            NeuroState::Normal => 0.0,
            NeuroState::MildImpairment => self.mild_impairment_monthly,
            NeuroState::Dementia => self.dementia_monthly,
        };
        cardiac_cost + renal_cost + neuro_cost
    }

    /// Lost-productivity cost for an acute event, zero once retired or for
    /// deaths (the human-capital stream stops either way in this model).
    pub fn productivity_cost(&self, age: f64, to: CardiacState) -> f64 {
        if age < self.retirement_age && to.is_acute() {
            self.productivity_per_acute_event
        } else {
            0.0
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("costs.acute_mi", self.acute_mi),
            ("costs.acute_ischemic_stroke", self.acute_ischemic_stroke),
            ("costs.acute_hemorrhagic_stroke", self.acute_hemorrhagic_stroke),
            ("costs.tia", self.tia),
            ("costs.acute_hf", self.acute_hf),
            ("costs.cv_death", self.cv_death),
            ("costs.non_cv_death", self.non_cv_death),
            ("costs.renal_death", self.renal_death),
            ("costs.post_mi_monthly", self.post_mi_monthly),
            ("costs.post_stroke_monthly", self.post_stroke_monthly),
            ("costs.chronic_hf_monthly", self.chronic_hf_monthly),
            ("costs.stage_3a_monthly", self.stage_3a_monthly),
            ("costs.stage_3b_monthly", self.stage_3b_monthly),
            ("costs.stage_4_monthly", self.stage_4_monthly),
            ("costs.dialysis_monthly", self.dialysis_monthly),
            ("costs.mild_impairment_monthly", self.mild_impairment_monthly),
            ("costs.dementia_monthly", self.dementia_monthly),
            ("costs.productivity_per_acute_event", self.productivity_per_acute_event),
            ("costs.retirement_age", self.retirement_age),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NonFinite { field, value });
            }
        }
        Ok(())
    }
}

// ── Utilities ────────────────────────────────────────────────────────────────

/// Health-state utilities. The age baseline is multiplied by one factor per
/// domain; acute cycles use their own (worse) cardiac factor for the single
/// month they last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityConfig {
    /// Utility of a well 50-year-old.
    pub baseline_at_50: f64,
    /// Linear decrement per decade of age over 50.
    pub decrement_per_decade: f64,

    pub acute_mi: f64,
    pub acute_ischemic_stroke: f64,
    pub acute_hemorrhagic_stroke: f64,
    pub tia: f64,
    pub acute_hf: f64,
    pub post_mi: f64,
    pub post_stroke: f64,
    pub chronic_hf: f64,

    pub stage_3a: f64,
    pub stage_3b: f64,
    pub stage_4: f64,
    pub dialysis: f64,

    pub mild_impairment: f64,
    pub dementia: f64,
}

impl UtilityConfig {
    pub fn canonical() -> Self {
        UtilityConfig {
            baseline_at_50: 0.92,
            decrement_per_decade: 0.015,
            acute_mi: 0.60,
            acute_ischemic_stroke: 0.55,
            acute_hemorrhagic_stroke: 0.45,
            tia: 0.85,
            acute_hf: 0.58,
            post_mi: 0.88,
            post_stroke: 0.76,
            chronic_hf: 0.71,
            stage_3a: 0.97,
            stage_3b: 0.93,
            stage_4: 0.85,
            dialysis: 0.56,
            mild_impairment: 0.83,
            dementia: 0.45,
        }
    }

    pub fn baseline(&self, age: f64) -> f64 {
        let decades_over_50 = ((age - 50.0) / 10.0).max(0.0);
        (self.baseline_at_50 - self.decrement_per_decade * decades_over_50).clamp(0.0, 1.0)
    }

    /// Utility for one month in the given state triple, in [0, 1].
    pub fn monthly_utility(
        &self,
        age: f64,
        cardiac: CardiacState,
        renal: RenalStage,
        neuro: NeuroState,
    ) -> f64 {
        let cardiac_factor = match cardiac {
            CardiacState::Stable => 1.0,
            CardiacState::AcuteMi => self.acute_mi,
            CardiacState::AcuteIschemicStroke => self.acute_ischemic_stroke,
            CardiacState::AcuteHemorrhagicStroke => self.acute_hemorrhagic_stroke,
            CardiacState::Tia => self.tia,
            CardiacState::AcuteHf => self.acute_hf,
            CardiacState::PostMi => self.post_mi,
            CardiacState::PostStroke => self.post_stroke,
            CardiacState::ChronicHf => self.chronic_hf,
            CardiacState::CvDeath | CardiacState::NonCvDeath => 0.0,
        };
        let renal_factor = match renal {
            RenalStage::Normal => 1.0,
            RenalStage::Stage3a => self.stage_3a,
            RenalStage::Stage3b => self.stage_3b,
            RenalStage::Stage4 => self.stage_4,
            RenalStage::KidneyFailure => self.dialysis,
            RenalStage::RenalDeath => 0.0,
        };
        let neuro_factor = match neuro {
            NeuroState::Normal => 1.0,
            NeuroState::MildImpairment => self.mild_impairment,
            NeuroState::Dementia => self.dementia,
        };
        (self.baseline(age) * cardiac_factor * renal_factor * neuro_factor).clamp(0.0, 1.0)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("utilities.baseline_at_50", self.baseline_at_50),
            ("utilities.acute_mi", self.acute_mi),
            ("utilities.acute_ischemic_stroke", self.acute_ischemic_stroke),
            ("utilities.acute_hemorrhagic_stroke", self.acute_hemorrhagic_stroke),
            ("utilities.tia", self.tia),
            ("utilities.acute_hf", self.acute_hf),
            ("utilities.post_mi", self.post_mi),
            ("utilities.post_stroke", self.post_stroke),
            ("utilities.chronic_hf", self.chronic_hf),
            ("utilities.stage_3a", self.stage_3a),
            ("utilities.stage_3b", self.stage_3b),
            ("utilities.stage_4", self.stage_4),
            ("utilities.dialysis", self.dialysis),
            ("utilities.mild_impairment", self.mild_impairment),
            ("utilities.dementia", self.dementia),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { field, value });
            }
        }
        if !self.decrement_per_decade.is_finite() || self.decrement_per_decade < 0.0 {
            return Err(ConfigError::NonFinite {
                field: "utilities.decrement_per_decade",
                value: self.decrement_per_decade,
            });
        }
        Ok(())
    }
}

// ── Covariate walks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateWalkConfig {
    /// Deterministic physiological SBP rise, mmHg per year of age.
    pub sbp_age_drift_per_year: f64,
    /// Gaussian noise SD per monthly step.
    pub sbp_noise_sd: f64,
    pub sbp_lo: f64,
    pub sbp_hi: f64,

    pub dbp_age_drift_per_year: f64,
    pub dbp_noise_sd: f64,
    pub dbp_lo: f64,
    pub dbp_hi: f64,

    /// Long-run potassium target for an untreated patient.
    pub potassium_target: f64,
    /// Fraction of the gap to target closed per month.
    pub potassium_reversion: f64,
    pub potassium_noise_sd: f64,
    pub potassium_lo: f64,
    pub potassium_hi: f64,
}

impl CovariateWalkConfig {
    pub fn canonical() -> Self {
        CovariateWalkConfig {
            sbp_age_drift_per_year: 0.5,
            sbp_noise_sd: 1.2,
            sbp_lo: 70.0,
            sbp_hi: 250.0,
            dbp_age_drift_per_year: 0.1,
            dbp_noise_sd: 0.8,
            dbp_lo: 40.0,
            dbp_hi: 150.0,
            potassium_target: 4.2,
            potassium_reversion: 0.10,
            potassium_noise_sd: 0.08,
            potassium_lo: 2.5,
            potassium_hi: 7.5,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sbp_lo > self.sbp_hi {
            return Err(ConfigError::RangeInverted {
                field: "walks.sbp",
                lo: self.sbp_lo,
                hi: self.sbp_hi,
            });
        }
        if self.dbp_lo > self.dbp_hi {
            return Err(ConfigError::RangeInverted {
                field: "walks.dbp",
                lo: self.dbp_lo,
                hi: self.dbp_hi,
            });
        }
        if self.potassium_lo > self.potassium_hi {
            return Err(ConfigError::RangeInverted {
                field: "walks.potassium",
                lo: self.potassium_lo,
                hi: self.potassium_hi,
            });
        }
        if !(0.0..=1.0).contains(&self.potassium_reversion) {
            return Err(ConfigError::ProbabilityOutOfRange {
                field: "walks.potassium_reversion",
                value: self.potassium_reversion,
            });
        }
        for (field, value) in [
            ("walks.sbp_noise_sd", self.sbp_noise_sd),
            ("walks.dbp_noise_sd", self.dbp_noise_sd),
            ("walks.potassium_noise_sd", self.potassium_noise_sd),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NonFinite { field, value });
            }
        }
        Ok(())
    }
}

// ── Population ───────────────────────────────────────────────────────────────

/// Aggregate parameters the generator turns into a correlated cohort.
/// Continuous covariates are drawn around age-linked means; the correlation
/// coefficients couple SBP, BMI and total cholesterol at the copula level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationConfig {
    pub cohort_size: usize,

    pub age_mean: f64,
    pub age_sd: f64,
    pub age_min: f64,
    pub age_max: f64,
    pub female_fraction: f64,

    /// Physiological SBP at age 60; the office value adds the white-coat
    /// offset drawn below.
    pub sbp_mean: f64,
    pub sbp_sd: f64,
    /// Mean shift per decade of age from 60.
    pub sbp_age_slope_per_decade: f64,
    pub dbp_mean: f64,
    pub dbp_sd: f64,
    pub white_coat_mean: f64,
    pub white_coat_sd: f64,

    /// eGFR at age 65, declining linearly per decade after it.
    pub egfr_mean_at_65: f64,
    pub egfr_sd: f64,
    pub egfr_age_slope_per_decade: f64,

    /// uACR is log-normal; these are the parameters of ln(uACR).
    pub uacr_log_mean: f64,
    pub uacr_log_sd: f64,
    /// Added to the log-mean for diabetic patients.
    pub uacr_diabetes_log_shift: f64,

    pub total_cholesterol_mean: f64,
    pub total_cholesterol_sd: f64,
    pub hdl_mean: f64,
    pub hdl_sd: f64,
    pub bmi_mean: f64,
    pub bmi_sd: f64,
    pub potassium_mean: f64,
    pub potassium_sd: f64,

    pub rho_sbp_bmi: f64,
    pub rho_sbp_cholesterol: f64,
    pub rho_bmi_cholesterol: f64,

    pub diabetes_prevalence_at_60: f64,
    pub diabetes_slope_per_decade: f64,
    pub smoking_prevalence: f64,
    pub copd_prevalence: f64,
    pub substance_use_prevalence: f64,
    pub depression_prevalence: f64,
    pub anxiety_prevalence: f64,
    pub serious_mental_illness_prevalence: f64,
    pub af_prevalence_at_60: f64,
    pub af_slope_per_decade: f64,
    pub pad_prevalence: f64,
    pub secondary_etiology_fraction: f64,
}

impl PopulationConfig {
    pub fn canonical() -> Self {
        PopulationConfig {
            cohort_size: 500,
            age_mean: 64.0,
            age_sd: 9.0,
            age_min: 40.0,
            age_max: 90.0,
            female_fraction: 0.47,
            sbp_mean: 148.0,
            sbp_sd: 14.0,
            sbp_age_slope_per_decade: 3.0,
            dbp_mean: 86.0,
            dbp_sd: 9.0,
            white_coat_mean: 7.0,
            white_coat_sd: 5.0,
            egfr_mean_at_65: 78.0,
            egfr_sd: 16.0,
            egfr_age_slope_per_decade: 8.0,
            uacr_log_mean: 2.6,
            uacr_log_sd: 1.1,
            uacr_diabetes_log_shift: 0.8,
            total_cholesterol_mean: 5.5,
            total_cholesterol_sd: 1.0,
            hdl_mean: 1.3,
            hdl_sd: 0.3,
            bmi_mean: 28.5,
            bmi_sd: 4.5,
            potassium_mean: 4.2,
            potassium_sd: 0.35,
            rho_sbp_bmi: 0.25,
            rho_sbp_cholesterol: 0.12,
            rho_bmi_cholesterol: 0.22,
            diabetes_prevalence_at_60: 0.18,
            diabetes_slope_per_decade: 0.04,
            smoking_prevalence: 0.16,
            copd_prevalence: 0.08,
            substance_use_prevalence: 0.05,
            depression_prevalence: 0.18,
            anxiety_prevalence: 0.22,
            serious_mental_illness_prevalence: 0.04,
            af_prevalence_at_60: 0.06,
            af_slope_per_decade: 0.03,
            pad_prevalence: 0.07,
            secondary_etiology_fraction: 0.10,
        }
    }

    pub fn diabetes_prevalence(&self, age: f64) -> f64 {
        (self.diabetes_prevalence_at_60 + self.diabetes_slope_per_decade * (age - 60.0) / 10.0)
            .clamp(0.0, 0.8)
    }

    pub fn af_prevalence(&self, age: f64) -> f64 {
        (self.af_prevalence_at_60 + self.af_slope_per_decade * (age - 60.0) / 10.0).clamp(0.0, 0.6)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cohort_size == 0 {
            return Err(ConfigError::EmptyCohort);
        }
        if self.age_min > self.age_max {
            return Err(ConfigError::RangeInverted {
                field: "population.age",
                lo: self.age_min,
                hi: self.age_max,
            });
        }
        for (field, value) in [
            ("population.female_fraction", self.female_fraction),
            ("population.diabetes_prevalence_at_60", self.diabetes_prevalence_at_60),
            ("population.smoking_prevalence", self.smoking_prevalence),
            ("population.copd_prevalence", self.copd_prevalence),
            ("population.substance_use_prevalence", self.substance_use_prevalence),
            ("population.depression_prevalence", self.depression_prevalence),
            ("population.anxiety_prevalence", self.anxiety_prevalence),
            (
                "population.serious_mental_illness_prevalence",
                self.serious_mental_illness_prevalence,
            ),
            ("population.af_prevalence_at_60", self.af_prevalence_at_60),
            ("population.pad_prevalence", self.pad_prevalence),
            ("population.secondary_etiology_fraction", self.secondary_etiology_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { field, value });
            }
        }
        for (field, value) in [
            ("population.age_sd", self.age_sd),
            ("population.sbp_sd", self.sbp_sd),
            ("population.dbp_sd", self.dbp_sd),
            ("population.white_coat_sd", self.white_coat_sd),
            ("population.egfr_sd", self.egfr_sd),
            ("population.uacr_log_sd", self.uacr_log_sd),
            ("population.total_cholesterol_sd", self.total_cholesterol_sd),
            ("population.hdl_sd", self.hdl_sd),
            ("population.bmi_sd", self.bmi_sd),
            ("population.potassium_sd", self.potassium_sd),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NonFinite { field, value });
            }
        }
        for (field, value) in [
            ("population.rho_sbp_bmi", self.rho_sbp_bmi),
            ("population.rho_sbp_cholesterol", self.rho_sbp_cholesterol),
            ("population.rho_bmi_cholesterol", self.rho_bmi_cholesterol),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { field, value });
            }
        }
        Ok(())
    }
}

// ── Top level ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub horizon_years: u32,
    pub annual_discount_rate: f64,
    pub perspective: Perspective,

    /// Rescale ceiling for the competing-event sum. A pragmatic safety
    /// margin, not clinical truth; kept tunable for exactly that reason.
    pub max_monthly_event_probability: f64,
    /// Abort with full context on the first numeric repair instead of
    /// clamping and counting.
    pub strict_numerics: bool,
    /// Credit half a month of pre-death state accrual in the death cycle.
    pub half_cycle_correction: bool,
    /// Feed the latent physiological SBP to the CVD equations instead of
    /// the office reading.
    pub risk_on_physiological_bp: bool,
    /// Zeroes the life-table route. Only meaningful for variance-isolation
    /// experiments; never for production estimates.
    pub disable_background_mortality: bool,

    pub dialysis_annual_mortality: f64,
    /// PSA calibration multipliers over whole equation families.
    pub cvd_calibration: f64,
    pub mortality_calibration: f64,

    pub risk: RiskModel,
    pub walks: CovariateWalkConfig,
    pub costs: CostConfig,
    pub utilities: UtilityConfig,
    pub treatment: TreatmentModel,
    pub population: PopulationConfig,
}

impl SimulationConfig {
    pub fn canonical() -> Self {
        SimulationConfig {
            horizon_years: 40,
            annual_discount_rate: 0.035,
            perspective: Perspective::Healthcare,
            max_monthly_event_probability: 0.95,
            strict_numerics: false,
            half_cycle_correction: false,
            risk_on_physiological_bp: false,
            disable_background_mortality: false,
            dialysis_annual_mortality: 0.12,
            cvd_calibration: 1.0,
            mortality_calibration: 1.0,
            risk: RiskModel::canonical(Country::UnitedKingdom),
            walks: CovariateWalkConfig::canonical(),
            costs: CostConfig::canonical(),
            utilities: UtilityConfig::canonical(),
            treatment: TreatmentModel::canonical(),
            population: PopulationConfig::canonical(),
        }
    }

    pub fn country(&self) -> Country {
        self.risk.life_table.country
    }

    pub fn horizon_cycles(&self) -> u32 {
        self.horizon_years * 12
    }

    /// Present-value factor for an accrual `month` cycles after baseline.
    pub fn discount_factor(&self, month: u32) -> f64 {
        if self.annual_discount_rate == 0.0 {
            return 1.0;
        }
        (1.0 + self.annual_discount_rate).powf(-(f64::from(month) / 12.0))
    }

    /// Fails fast: the first violated constraint aborts before any patient
    /// is generated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.annual_discount_rate < 0.0 || !self.annual_discount_rate.is_finite() {
            return Err(ConfigError::NegativeDiscountRate(self.annual_discount_rate));
        }
        if self.horizon_years == 0 {
            return Err(ConfigError::ZeroHorizon);
        }
        if !(self.max_monthly_event_probability > 0.0
            && self.max_monthly_event_probability <= 1.0)
        {
            return Err(ConfigError::ProbabilityOutOfRange {
                field: "max_monthly_event_probability",
                value: self.max_monthly_event_probability,
            });
        }
        if !(0.0..=1.0).contains(&self.dialysis_annual_mortality) {
            return Err(ConfigError::ProbabilityOutOfRange {
                field: "dialysis_annual_mortality",
                value: self.dialysis_annual_mortality,
            });
        }
        for (field, value) in [
            ("cvd_calibration", self.cvd_calibration),
            ("mortality_calibration", self.mortality_calibration),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NonFinite { field, value });
            }
        }
        self.walks.validate()?;
        self.costs.validate()?;
        self.utilities.validate()?;
        self.treatment.validate()?;
        self.population.validate()
    }

    /// The flat key→value override surface for spreadsheet ingest and PSA.
    /// Keys are dotted paths; unknown keys are rejected, and values are
    /// re-validated by the caller via `validate()` once all overrides are
    /// applied.
    pub fn apply_override(&mut self, key: &str, value: f64) -> Result<(), ConfigError> {
        if !value.is_finite() {
            return Err(ConfigError::InvalidOverride {
                key: key.to_string(),
                value,
                reason: "override values must be finite",
            });
        }
        let mut parts = key.splitn(2, '.');
        let head = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();
        match head {
            "horizon_years" => self.horizon_years = value as u32,
            "annual_discount_rate" => self.annual_discount_rate = value,
            "max_monthly_event_probability" => self.max_monthly_event_probability = value,
            "dialysis_annual_mortality" => self.dialysis_annual_mortality = value,
            "cvd_calibration" => self.cvd_calibration = value,
            "mortality_calibration" => self.mortality_calibration = value,
            "cohort_size" => {
                if value < 1.0 {
                    return Err(ConfigError::InvalidOverride {
                        key: key.to_string(),
                        value,
                        reason: "cohort size must be at least 1",
                    });
                }
                self.population.cohort_size = value as usize;
            }
            "population" => self.apply_population_override(key, rest, value)?,
            "costs" => self.apply_cost_override(key, rest, value)?,
            "utilities" => self.apply_utility_override(key, rest, value)?,
            "effects" => self.apply_effect_override(key, rest, value)?,
            "adherence" => {
                let a = &mut self.treatment.adherence;
                match rest {
                    "annual_become_nonadherent" => a.annual_become_nonadherent = value,
                    "annual_regain_adherence" => a.annual_regain_adherence = value,
                    "nonadherent_effect_fraction" => a.nonadherent_effect_fraction = value,
                    "age_over_75_multiplier" => a.age_over_75_multiplier = value,
                    "per_deprivation_quintile" => a.per_deprivation_quintile = value,
                    _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
                }
            }
            "safety" => match rest {
                "potassium_stop_threshold" => {
                    self.treatment.safety.potassium_stop_threshold = value
                }
                "check_interval_months" => {
                    self.treatment.safety.check_interval_months = value as u32
                }
                _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
            },
            "walks" => {
                let w = &mut self.walks;
                match rest {
                    "sbp_age_drift_per_year" => w.sbp_age_drift_per_year = value,
                    "sbp_noise_sd" => w.sbp_noise_sd = value,
                    "dbp_age_drift_per_year" => w.dbp_age_drift_per_year = value,
                    "dbp_noise_sd" => w.dbp_noise_sd = value,
                    "potassium_target" => w.potassium_target = value,
                    "potassium_reversion" => w.potassium_reversion = value,
                    "potassium_noise_sd" => w.potassium_noise_sd = value,
                    _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
                }
            }
            _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
        }
        Ok(())
    }

    fn apply_population_override(
        &mut self,
        key: &str,
        field: &str,
        value: f64,
    ) -> Result<(), ConfigError> {
        let p = &mut self.population;
        match field {
            "age_mean" => p.age_mean = value,
            "age_sd" => p.age_sd = value,
            "age_min" => p.age_min = value,
            "age_max" => p.age_max = value,
            "female_fraction" => p.female_fraction = value,
            "sbp_mean" => p.sbp_mean = value,
            "sbp_sd" => p.sbp_sd = value,
            "sbp_age_slope_per_decade" => p.sbp_age_slope_per_decade = value,
            "dbp_mean" => p.dbp_mean = value,
            "dbp_sd" => p.dbp_sd = value,
            "white_coat_mean" => p.white_coat_mean = value,
            "white_coat_sd" => p.white_coat_sd = value,
            "egfr_mean_at_65" => p.egfr_mean_at_65 = value,
            "egfr_sd" => p.egfr_sd = value,
            "egfr_age_slope_per_decade" => p.egfr_age_slope_per_decade = value,
            "uacr_log_mean" => p.uacr_log_mean = value,
            "uacr_log_sd" => p.uacr_log_sd = value,
            "uacr_diabetes_log_shift" => p.uacr_diabetes_log_shift = value,
            "total_cholesterol_mean" => p.total_cholesterol_mean = value,
            "total_cholesterol_sd" => p.total_cholesterol_sd = value,
            "hdl_mean" => p.hdl_mean = value,
            "hdl_sd" => p.hdl_sd = value,
            "bmi_mean" => p.bmi_mean = value,
            "bmi_sd" => p.bmi_sd = value,
            "potassium_mean" => p.potassium_mean = value,
            "potassium_sd" => p.potassium_sd = value,
            "rho_sbp_bmi" => p.rho_sbp_bmi = value,
            "rho_sbp_cholesterol" => p.rho_sbp_cholesterol = value,
            "rho_bmi_cholesterol" => p.rho_bmi_cholesterol = value,
            "diabetes_prevalence_at_60" => p.diabetes_prevalence_at_60 = value,
            "diabetes_slope_per_decade" => p.diabetes_slope_per_decade = value,
            "smoking_prevalence" => p.smoking_prevalence = value,
            "copd_prevalence" => p.copd_prevalence = value,
            "substance_use_prevalence" => p.substance_use_prevalence = value,
            "depression_prevalence" => p.depression_prevalence = value,
            "anxiety_prevalence" => p.anxiety_prevalence = value,
            "serious_mental_illness_prevalence" => p.serious_mental_illness_prevalence = value,
            "af_prevalence_at_60" => p.af_prevalence_at_60 = value,
            "af_slope_per_decade" => p.af_slope_per_decade = value,
            "pad_prevalence" => p.pad_prevalence = value,
            "secondary_etiology_fraction" => p.secondary_etiology_fraction = value,
            _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
        }
        Ok(())
    }

    fn apply_cost_override(
        &mut self,
        key: &str,
        field: &str,
        value: f64,
    ) -> Result<(), ConfigError> {
        let c = &mut self.costs;
        match field {
            "acute_mi" => c.acute_mi = value,
            "acute_ischemic_stroke" => c.acute_ischemic_stroke = value,
            "acute_hemorrhagic_stroke" => c.acute_hemorrhagic_stroke = value,
            "tia" => c.tia = value,
            "acute_hf" => c.acute_hf = value,
            "cv_death" => c.cv_death = value,
            "non_cv_death" => c.non_cv_death = value,
            "renal_death" => c.renal_death = value,
            "post_mi_monthly" => c.post_mi_monthly = value,
            "post_stroke_monthly" => c.post_stroke_monthly = value,
            "chronic_hf_monthly" => c.chronic_hf_monthly = value,
            "stage_3a_monthly" => c.stage_3a_monthly = value,
            "stage_3b_monthly" => c.stage_3b_monthly = value,
            "stage_4_monthly" => c.stage_4_monthly = value,
            "dialysis_monthly" => c.dialysis_monthly = value,
            "mild_impairment_monthly" => c.mild_impairment_monthly = value,
            "dementia_monthly" => c.dementia_monthly = value,
            "productivity_per_acute_event" => c.productivity_per_acute_event = value,
            "retirement_age" => c.retirement_age = value,
            _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
        }
        Ok(())
    }

    fn apply_utility_override(
        &mut self,
        key: &str,
        field: &str,
        value: f64,
    ) -> Result<(), ConfigError> {
        let u = &mut self.utilities;
        match field {
            "baseline_at_50" => u.baseline_at_50 = value,
            "decrement_per_decade" => u.decrement_per_decade = value,
            "acute_mi" => u.acute_mi = value,
            "acute_ischemic_stroke" => u.acute_ischemic_stroke = value,
            "acute_hemorrhagic_stroke" => u.acute_hemorrhagic_stroke = value,
            "tia" => u.tia = value,
            "acute_hf" => u.acute_hf = value,
            "post_mi" => u.post_mi = value,
            "post_stroke" => u.post_stroke = value,
            "chronic_hf" => u.chronic_hf = value,
            "stage_3a" => u.stage_3a = value,
            "stage_3b" => u.stage_3b = value,
            "stage_4" => u.stage_4 = value,
            "dialysis" => u.dialysis = value,
            "mild_impairment" => u.mild_impairment = value,
            "dementia" => u.dementia = value,
            _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
        }
        Ok(())
    }

    /// `effects.<treatment_name>.<field>`, e.g.
    /// `effects.ace_inhibitor.mean_sbp_reduction`.
    fn apply_effect_override(
        &mut self,
        key: &str,
        rest: &str,
        value: f64,
    ) -> Result<(), ConfigError> {
        let mut parts = rest.splitn(2, '.');
        let name = parts.next().unwrap_or_default();
        let field = parts.next().unwrap_or_default();
        let Some(treatment) = Treatment::from_name(name) else {
            return Err(ConfigError::UnknownOverrideKey(key.to_string()));
        };
        let row = self.treatment.effects.get_mut(treatment)?;
        match field {
            "mean_sbp_reduction" => row.mean_sbp_reduction = value,
            "sd_sbp_reduction" => row.sd_sbp_reduction = value,
            "annual_discontinuation" => row.annual_discontinuation = value,
            "monthly_cost" => row.monthly_cost = value,
            "attractiveness" => row.attractiveness = value,
            _ => return Err(ConfigError::UnknownOverrideKey(key.to_string())),
        }
        Ok(())
    }
}
