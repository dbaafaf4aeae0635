//! Risk-equation layer: pure functions from covariates to probabilities.
//!
//! Every equation here is deterministic given its inputs and draws nothing
//! from an RNG. Callers layer state-history and phenotype multipliers on top
//! through the `multiplier` argument, then convert annual probabilities to
//! monthly ones with the exact compounding identities at the bottom of the
//! module.
//!
//! Clamping policy: covariates are clamped to the validated ranges in
//! `RiskInputs::clamped` before any equation evaluates them. Out-of-range
//! inputs therefore produce the boundary prediction rather than an
//! extrapolation or a panic; the engine counts a divergence only when a
//! value is non-finite.

use serde::{Deserialize, Serialize};

use crate::types::{Country, Sex};

/// The modelled cardiovascular outcomes. Fatal events are routed through
/// `CvDeath`; the non-fatal outcomes map 1:1 onto acute cardiac states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CvdOutcome {
    Mi,
    IschemicStroke,
    HemorrhagicStroke,
    Tia,
    HeartFailure,
    CvDeath,
}

impl CvdOutcome {
    pub const ALL: [CvdOutcome; 6] = [
        CvdOutcome::Mi,
        CvdOutcome::IschemicStroke,
        CvdOutcome::HemorrhagicStroke,
        CvdOutcome::Tia,
        CvdOutcome::HeartFailure,
        CvdOutcome::CvDeath,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CvdOutcome::Mi => "mi",
            CvdOutcome::IschemicStroke => "ischemic_stroke",
            CvdOutcome::HemorrhagicStroke => "hemorrhagic_stroke",
            CvdOutcome::Tia => "tia",
            CvdOutcome::HeartFailure => "heart_failure",
            CvdOutcome::CvDeath => "cv_death",
        }
    }
}

/// Covariate snapshot handed to the equations for one patient-cycle. Which
/// blood pressure lands in `sbp` (office or physiological) is the caller's
/// decision; the equations do not know the difference.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub age: f64,
    pub sex: Sex,
    pub sbp: f64,
    pub egfr: f64,
    /// Urine albumin/creatinine ratio, mg/g.
    pub uacr: f64,
    /// Non-HDL cholesterol, mmol/L.
    pub non_hdl: f64,
    pub bmi: f64,
    pub diabetes: bool,
    pub smoking: bool,
}

impl RiskInputs {
    /// Validated covariate ranges. Values outside are clamped to the nearer
    /// bound, so predictions saturate instead of extrapolating.
    pub fn clamped(self) -> RiskInputs {
        RiskInputs {
            age: self.age.clamp(30.0, 100.0),
            sbp: self.sbp.clamp(70.0, 250.0),
            egfr: self.egfr.clamp(2.0, 150.0),
            uacr: self.uacr.clamp(0.1, 5000.0),
            non_hdl: self.non_hdl.clamp(1.0, 12.0),
            bmi: self.bmi.clamp(14.0, 60.0),
            ..self
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

// ── Cardiovascular equations ─────────────────────────────────────────────────

/// Logistic formulation: a shared linear predictor over centred covariates,
/// scaled and shifted per outcome, mapped through the sigmoid. All covariate
/// coefficients are non-negative, so predicted risk is monotone in age, SBP
/// and diabetes by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticCvdCoefficients {
    pub age_per_decade: f64,
    pub male: f64,
    pub sbp_per_20: f64,
    pub diabetes: f64,
    pub smoking: f64,
    /// Per 10 mL/min/1.73m² of eGFR below 60; zero contribution above.
    pub egfr_deficit_per_10: f64,
    pub non_hdl_per_mmol: f64,
    pub bmi_per_5: f64,
}

impl LogisticCvdCoefficients {
    pub fn canonical() -> Self {
        LogisticCvdCoefficients {
            age_per_decade: 0.58,
            male: 0.34,
            sbp_per_20: 0.44,
            diabetes: 0.72,
            smoking: 0.52,
            egfr_deficit_per_10: 0.27,
            non_hdl_per_mmol: 0.17,
            bmi_per_5: 0.09,
        }
    }

    /// Linear predictor centred at a 55-year-old woman with SBP 120,
    /// eGFR >= 60, non-HDL 3.5 and BMI 25.
    fn linear_predictor(&self, x: &RiskInputs) -> f64 {
        let egfr_deficit = (60.0 - x.egfr).max(0.0);
        self.age_per_decade * (x.age - 55.0) / 10.0
            + self.male * f64::from(x.sex == Sex::Male)
            + self.sbp_per_20 * (x.sbp - 120.0) / 20.0
            + self.diabetes * f64::from(x.diabetes)
            + self.smoking * f64::from(x.smoking)
            + self.egfr_deficit_per_10 * egfr_deficit / 10.0
            + self.non_hdl_per_mmol * (x.non_hdl - 3.5)
            + self.bmi_per_5 * (x.bmi - 25.0) / 5.0
    }

    /// Per-outcome intercept (annual log-odds at the reference covariates)
    /// and slope applied to the shared linear predictor.
    fn outcome_terms(outcome: CvdOutcome) -> (f64, f64) {
        match outcome {
            CvdOutcome::Mi => (-5.75, 1.0),
            CvdOutcome::IschemicStroke => (-6.05, 1.0),
            CvdOutcome::HemorrhagicStroke => (-7.55, 0.85),
            CvdOutcome::Tia => (-6.45, 0.9),
            CvdOutcome::HeartFailure => (-6.0, 1.05),
            CvdOutcome::CvDeath => (-6.85, 1.1),
        }
    }
}

/// Baseline-survival formulation: p = 1 - s0^exp(lp), with s0 the one-year
/// event-free probability at the reference covariates. Kept as a swappable
/// alternative; coefficient signs match the logistic model so the same
/// monotonicity guarantees hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalCvdCoefficients {
    pub age_per_decade: f64,
    pub male: f64,
    pub sbp_per_20: f64,
    pub diabetes: f64,
    pub smoking: f64,
    pub non_hdl_per_mmol: f64,
}

impl SurvivalCvdCoefficients {
    pub fn canonical() -> Self {
        SurvivalCvdCoefficients {
            age_per_decade: 0.50,
            male: 0.30,
            sbp_per_20: 0.38,
            diabetes: 0.65,
            smoking: 0.48,
            non_hdl_per_mmol: 0.15,
        }
    }

    fn linear_predictor(&self, x: &RiskInputs) -> f64 {
        self.age_per_decade * (x.age - 55.0) / 10.0
            + self.male * f64::from(x.sex == Sex::Male)
            + self.sbp_per_20 * (x.sbp - 120.0) / 20.0
            + self.diabetes * f64::from(x.diabetes)
            + self.smoking * f64::from(x.smoking)
            + self.non_hdl_per_mmol * (x.non_hdl - 3.5)
    }

    /// One-year baseline survival per outcome at the reference covariates.
    fn baseline_survival(outcome: CvdOutcome) -> f64 {
        match outcome {
            CvdOutcome::Mi => 0.9968,
            CvdOutcome::IschemicStroke => 0.9976,
            CvdOutcome::HemorrhagicStroke => 0.9994,
            CvdOutcome::Tia => 0.9983,
            CvdOutcome::HeartFailure => 0.9972,
            CvdOutcome::CvDeath => 0.9988,
        }
    }
}

/// The swappable cardiovascular equation family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CvdEquation {
    Logistic(LogisticCvdCoefficients),
    Survival(SurvivalCvdCoefficients),
}

impl CvdEquation {
    pub fn canonical() -> Self {
        CvdEquation::Logistic(LogisticCvdCoefficients::canonical())
    }

    /// Annual probability of `outcome` for one patient. `multiplier` carries
    /// everything layered on top of the base equation (state history,
    /// phenotype, calibration); the product is clamped back into [0, 1].
    pub fn annual_probability(
        &self,
        inputs: &RiskInputs,
        outcome: CvdOutcome,
        multiplier: f64,
    ) -> f64 {
        let x = inputs.clamped();
        let base = match self {
            CvdEquation::Logistic(c) => {
                let (intercept, slope) = LogisticCvdCoefficients::outcome_terms(outcome);
                sigmoid(intercept + slope * c.linear_predictor(&x))
            }
            CvdEquation::Survival(c) => {
                let s0 = SurvivalCvdCoefficients::baseline_survival(outcome);
                1.0 - s0.powf(c.linear_predictor(&x).exp())
            }
        };
        (base * multiplier.max(0.0)).clamp(0.0, 1.0)
    }
}

// ── Kidney-failure progression ───────────────────────────────────────────────

/// Two-year kidney-failure risk in the baseline-survival form
/// 1 - s0^exp(lp), parameterized on age, sex, eGFR and albuminuria. Feeds
/// the eGFR decline model as an acceleration term rather than being sampled
/// directly; the renal stage itself stays a deterministic function of eGFR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KidneyFailureEquation {
    pub age_per_decade: f64,
    pub male: f64,
    /// Per 5 mL/min/1.73m² of eGFR below the reference of 36.
    pub egfr_per_5: f64,
    /// Per natural-log unit of uACR above the reference of ln 170.
    pub log_uacr: f64,
    pub two_year_baseline_survival: f64,
}

impl KidneyFailureEquation {
    pub fn canonical() -> Self {
        KidneyFailureEquation {
            age_per_decade: -0.20,
            male: 0.25,
            egfr_per_5: 0.45,
            log_uacr: 0.35,
            two_year_baseline_survival: 0.975,
        }
    }

    pub fn two_year_risk(&self, inputs: &RiskInputs) -> f64 {
        let x = inputs.clamped();
        let lp = self.age_per_decade * (x.age - 70.0) / 10.0
            + self.male * f64::from(x.sex == Sex::Male)
            + self.egfr_per_5 * (36.0 - x.egfr) / 5.0
            + self.log_uacr * (x.uacr.ln() - 170.0_f64.ln());
        (1.0 - self.two_year_baseline_survival.powf(lp.exp())).clamp(0.0, 1.0)
    }

    pub fn annual_probability(&self, inputs: &RiskInputs, multiplier: f64) -> f64 {
        let two_year = self.two_year_risk(inputs);
        let annual = 1.0 - (1.0 - two_year).sqrt();
        (annual * multiplier.max(0.0)).clamp(0.0, 1.0)
    }
}

// ── eGFR decline ─────────────────────────────────────────────────────────────

/// Continuous eGFR decline, mL/min/1.73m² per year. Deterministic given the
/// covariates: the renal machine's stochasticity lives entirely in the BP
/// walk and event history that shape these inputs. Decline is floored at
/// zero, so eGFR never recovers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgfrDeclineModel {
    pub base_annual: f64,
    /// Extra decline per decade of age over 60.
    pub age_per_decade_over_60: f64,
    /// Extra decline per 10 mmHg of physiological SBP over 130.
    pub sbp_excess_per_10: f64,
    pub diabetes_extra: f64,
    /// Scales the kidney-failure equation's two-year risk into extra decline.
    pub progression_acceleration: f64,
    /// Fraction of the total decline removed by a kidney-protective drug
    /// class while the patient is on it and adherent.
    pub drug_protection: f64,
}

impl EgfrDeclineModel {
    pub fn canonical() -> Self {
        EgfrDeclineModel {
            base_annual: 0.9,
            age_per_decade_over_60: 0.25,
            sbp_excess_per_10: 0.35,
            diabetes_extra: 1.1,
            progression_acceleration: 3.0,
            drug_protection: 0.35,
        }
    }

    /// Monthly eGFR loss. `kidney_risk` is the two-year kidney-failure risk
    /// for the current covariates; `protected` is true while a
    /// kidney-protective treatment is active.
    pub fn monthly_decline(&self, inputs: &RiskInputs, kidney_risk: f64, protected: bool) -> f64 {
        let x = inputs.clamped();
        let mut annual = self.base_annual
            + self.age_per_decade_over_60 * ((x.age - 60.0).max(0.0) / 10.0)
            + self.sbp_excess_per_10 * ((x.sbp - 130.0).max(0.0) / 10.0)
            + self.diabetes_extra * f64::from(x.diabetes)
            + self.progression_acceleration * kidney_risk.clamp(0.0, 1.0);
        if protected {
            annual *= 1.0 - self.drug_protection;
        }
        (annual / 12.0).max(0.0)
    }
}

// ── Neurological progression ─────────────────────────────────────────────────

/// Annual probabilities for the monotonic neuro machine. Driven by age and
/// the *physiological* systolic pressure: cumulative vascular load tracks
/// what the vessels actually see, not what the clinic measures over a
/// white-coat offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuroRiskModel {
    /// Annual probability of normal -> mild impairment at age 70, SBP 120.
    pub annual_mild_at_70: f64,
    /// Annual probability of mild impairment -> dementia at age 70, SBP 120.
    pub annual_dementia_at_70: f64,
    /// Risk multiplies by this per decade of age beyond 70.
    pub per_decade_multiplier: f64,
    /// Risk multiplies by this per 10 mmHg of physiological SBP above 120.
    pub sbp_per_10_multiplier: f64,
}

impl NeuroRiskModel {
    pub fn canonical() -> Self {
        NeuroRiskModel {
            annual_mild_at_70: 0.015,
            annual_dementia_at_70: 0.08,
            per_decade_multiplier: 2.0,
            sbp_per_10_multiplier: 1.12,
        }
    }

    /// Annual probability of advancing one stage from `from`. Zero once
    /// dementia is reached; there is nowhere further to go.
    pub fn annual_progression(
        &self,
        from: crate::states::NeuroState,
        age: f64,
        physiological_sbp: f64,
    ) -> f64 {
        use crate::states::NeuroState;
        let base = match from {
            NeuroState::Normal => self.annual_mild_at_70,
            NeuroState::MildImpairment => self.annual_dementia_at_70,
            NeuroState::Dementia => return 0.0,
        };
        let age_factor = self
            .per_decade_multiplier
            .powf(((age.clamp(30.0, 100.0)) - 70.0) / 10.0);
        let sbp_factor = self
            .sbp_per_10_multiplier
            .powf(((physiological_sbp.clamp(70.0, 250.0)) - 120.0).max(0.0) / 10.0);
        (base * age_factor * sbp_factor).clamp(0.0, 1.0)
    }
}

// ── Background mortality ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LifeTableRow {
    pub age_lo: u32,
    pub female: f64,
    pub male: f64,
}

/// Non-cardiovascular background mortality in five-year bands. Ages below
/// the first band use the first row; ages past the last use the last row.
/// Cardiovascular and renal deaths are modelled separately, so these rates
/// exclude them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifeTable {
    pub country: Country,
    rows: Vec<LifeTableRow>,
}

impl LifeTable {
    pub fn for_country(country: Country) -> Self {
        let rows = match country {
            Country::UnitedKingdom => vec![
                LifeTableRow { age_lo: 30, female: 0.00040, male: 0.00062 },
                LifeTableRow { age_lo: 35, female: 0.00058, male: 0.00090 },
                LifeTableRow { age_lo: 40, female: 0.00087, male: 0.00134 },
                LifeTableRow { age_lo: 45, female: 0.00133, male: 0.00201 },
                LifeTableRow { age_lo: 50, female: 0.00203, male: 0.00297 },
                LifeTableRow { age_lo: 55, female: 0.00310, male: 0.00443 },
                LifeTableRow { age_lo: 60, female: 0.00481, male: 0.00671 },
                LifeTableRow { age_lo: 65, female: 0.00757, male: 0.01028 },
                LifeTableRow { age_lo: 70, female: 0.01222, male: 0.01614 },
                LifeTableRow { age_lo: 75, female: 0.02066, male: 0.02625 },
                LifeTableRow { age_lo: 80, female: 0.03655, male: 0.04452 },
                LifeTableRow { age_lo: 85, female: 0.06778, male: 0.07899 },
                LifeTableRow { age_lo: 90, female: 0.12616, male: 0.14037 },
                LifeTableRow { age_lo: 95, female: 0.21570, male: 0.23172 },
                LifeTableRow { age_lo: 100, female: 0.33255, male: 0.34512 },
            ],
            Country::UnitedStates => vec![
                LifeTableRow { age_lo: 30, female: 0.00075, male: 0.00147 },
                LifeTableRow { age_lo: 35, female: 0.00101, male: 0.00186 },
                LifeTableRow { age_lo: 40, female: 0.00139, male: 0.00240 },
                LifeTableRow { age_lo: 45, female: 0.00197, male: 0.00326 },
                LifeTableRow { age_lo: 50, female: 0.00289, male: 0.00461 },
                LifeTableRow { age_lo: 55, female: 0.00427, male: 0.00667 },
                LifeTableRow { age_lo: 60, female: 0.00633, male: 0.00957 },
                LifeTableRow { age_lo: 65, female: 0.00945, male: 0.01378 },
                LifeTableRow { age_lo: 70, female: 0.01463, male: 0.02047 },
                LifeTableRow { age_lo: 75, female: 0.02373, male: 0.03168 },
                LifeTableRow { age_lo: 80, female: 0.04048, male: 0.05155 },
                LifeTableRow { age_lo: 85, female: 0.07221, male: 0.08737 },
                LifeTableRow { age_lo: 90, female: 0.13086, male: 0.15019 },
                LifeTableRow { age_lo: 95, female: 0.21995, male: 0.24280 },
                LifeTableRow { age_lo: 100, female: 0.33420, male: 0.35688 },
            ],
        };
        LifeTable { country, rows }
    }

    /// Annual probability of non-CV death for this age and sex.
    pub fn annual_mortality(&self, age: f64, sex: Sex) -> f64 {
        let mut current = self.rows[0];
        for row in &self.rows {
            if age >= row.age_lo as f64 {
                current = *row;
            } else {
                break;
            }
        }
        match sex {
            Sex::Female => current.female,
            Sex::Male => current.male,
        }
    }
}

// ── Annual/monthly conversions ───────────────────────────────────────────────

/// Exact conversion: p_month = 1 - (1 - p_annual)^(1/12). The naive p/12
/// shortcut understates the monthly risk needed to compound back to the
/// annual figure, and the gap widens once history multipliers stack up.
pub fn annual_to_monthly_probability(p_annual: f64) -> f64 {
    let p = p_annual.clamp(0.0, 1.0);
    if p >= 1.0 {
        return 1.0;
    }
    1.0 - (1.0 - p).powf(1.0 / 12.0)
}

/// Inverse of `annual_to_monthly_probability`.
pub fn monthly_to_annual_probability(p_month: f64) -> f64 {
    let p = p_month.clamp(0.0, 1.0);
    if p >= 1.0 {
        return 1.0;
    }
    1.0 - (1.0 - p).powi(12)
}

/// Converts an annualized event *rate* (events per person-year) to the
/// probability of at least one event in a month, via the Poisson identity.
pub fn annual_rate_to_monthly_probability(rate: f64) -> f64 {
    if rate <= 0.0 {
        return 0.0;
    }
    1.0 - (-rate / 12.0).exp()
}

/// Bundle of the swappable equations one run uses. Each field can be
/// replaced independently; the engine only calls through this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModel {
    pub cvd: CvdEquation,
    pub kidney: KidneyFailureEquation,
    pub egfr_decline: EgfrDeclineModel,
    pub neuro: NeuroRiskModel,
    pub life_table: LifeTable,
}

impl RiskModel {
    pub fn canonical(country: Country) -> Self {
        RiskModel {
            cvd: CvdEquation::canonical(),
            kidney: KidneyFailureEquation::canonical(),
            egfr_decline: EgfrDeclineModel::canonical(),
            neuro: NeuroRiskModel::canonical(),
            life_table: LifeTable::for_country(country),
        }
    }
}
