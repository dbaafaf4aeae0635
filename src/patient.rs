//! The per-patient record: one flat struct, explicit optionals, no nesting.
//!
//! Everything the cycle loop reads or writes lives here. "Alive" is derived
//! from the two machines that own terminal states; there is no separate flag
//! to fall out of sync. History is a fixed-schema append-only vector
//! indexed by cycle, which is what the windowed risk modifiers query.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::phenotype::BaselineRiskProfile;
use crate::risk::{CvdOutcome, RiskInputs};
use crate::states::{CardiacState, NeuroState, RenalStage};
use crate::treatment::{AssignedTreatment, Treatment};
use crate::types::{Cycle, PatientId, Sex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopdSeverity {
    Mild,
    Moderate,
    Severe,
}

impl CopdSeverity {
    /// Interop: 0 = none, then severity order.
    pub fn code(opt: Option<CopdSeverity>) -> u8 {
        match opt {
            None => 0,
            Some(CopdSeverity::Mild) => 1,
            Some(CopdSeverity::Moderate) => 2,
            Some(CopdSeverity::Severe) => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Option<CopdSeverity>> {
        match code {
            0 => Some(None),
            1 => Some(Some(CopdSeverity::Mild)),
            2 => Some(Some(CopdSeverity::Moderate)),
            3 => Some(Some(CopdSeverity::Severe)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubstanceType {
    Alcohol,
    Stimulant,
    Opioid,
}

impl SubstanceType {
    pub fn code(opt: Option<SubstanceType>) -> u8 {
        match opt {
            None => 0,
            Some(SubstanceType::Alcohol) => 1,
            Some(SubstanceType::Stimulant) => 2,
            Some(SubstanceType::Opioid) => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Option<SubstanceType>> {
        match code {
            0 => Some(None),
            1 => Some(Some(SubstanceType::Alcohol)),
            2 => Some(Some(SubstanceType::Stimulant)),
            3 => Some(Some(SubstanceType::Opioid)),
            _ => None,
        }
    }
}

/// Which machine or sub-model a history row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Cardiac,
    Renal,
    Neuro,
    Treatment,
    Adherence,
}

impl Domain {
    pub fn name(self) -> &'static str {
        match self {
            Domain::Cardiac => "cardiac",
            Domain::Renal => "renal",
            Domain::Neuro => "neuro",
            Domain::Treatment => "treatment",
            Domain::Adherence => "adherence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreatmentChangeReason {
    Assigned,
    Discontinued,
    SafetyStop,
}

/// Typed from/to payload. One variant per domain keeps transition rows
/// exhaustively matchable while the record schema stays fixed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    Cardiac { from: CardiacState, to: CardiacState },
    Renal { from: RenalStage, to: RenalStage },
    Neuro { from: NeuroState, to: NeuroState },
    Treatment {
        from: Option<Treatment>,
        to: Option<Treatment>,
        reason: TreatmentChangeReason,
    },
    Adherence { adherent: bool },
}

impl Transition {
    pub fn domain(&self) -> Domain {
        match self {
            Transition::Cardiac { .. } => Domain::Cardiac,
            Transition::Renal { .. } => Domain::Renal,
            Transition::Neuro { .. } => Domain::Neuro,
            Transition::Treatment { .. } => Domain::Treatment,
            Transition::Adherence { .. } => Domain::Adherence,
        }
    }
}

/// One history row. The covariate snapshot fields are fixed: physiological
/// SBP, eGFR and potassium at the moment the transition was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub cycle: Cycle,
    pub transition: Transition,
    pub sbp: f64,
    pub egfr: f64,
    pub potassium: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,

    // Demographics.
    pub age: f64,
    pub sex: Sex,
    /// 1 (least deprived) ..= 5 (most deprived).
    pub deprivation_quintile: u8,

    // Blood pressure. `sbp`/`dbp` are the latent physiological values the
    // walks update; the office reading adds the per-patient white-coat
    // offset on top.
    pub sbp: f64,
    pub dbp: f64,
    pub white_coat_offset: f64,

    // Clinical covariates.
    pub egfr: f64,
    pub uacr: f64,
    pub total_cholesterol: f64,
    pub hdl_cholesterol: f64,
    pub bmi: f64,
    pub potassium: f64,

    // Comorbidity flags.
    pub diabetes: bool,
    pub smoking: bool,
    pub copd: Option<CopdSeverity>,
    pub substance_use: Option<SubstanceType>,
    pub depression: bool,
    pub anxiety: bool,
    pub serious_mental_illness: bool,
    pub atrial_fibrillation: bool,
    pub peripheral_artery_disease: bool,

    // Treatment.
    pub adherent: bool,
    pub cycles_since_adherence_change: u32,
    pub assigned: Option<AssignedTreatment>,

    // Read-only after construction (etiology updates aside).
    pub baseline: BaselineRiskProfile,

    // Machine positions.
    pub cardiac: CardiacState,
    pub renal: RenalStage,
    pub neuro: NeuroState,

    // Accumulators.
    pub discounted_cost: f64,
    pub discounted_qaly: f64,
    pub discounted_life_years: f64,
    pub months_alive: u32,
    pub months_in_cardiac: [u32; CardiacState::COUNT],
    pub months_in_renal: [u32; RenalStage::COUNT],
    pub months_in_neuro: [u32; NeuroState::COUNT],
    pub divergence_recoveries: u32,

    pub history: Vec<EventRecord>,
}

impl Patient {
    /// Derived, never stored: terminal cardiac or renal state means dead.
    pub fn is_alive(&self) -> bool {
        !self.cardiac.is_terminal() && !self.renal.is_terminal()
    }

    pub fn office_sbp(&self) -> f64 {
        self.sbp + self.white_coat_offset
    }

    /// The white-coat phenomenon is weaker diastolically; half the offset is
    /// the conventional working assumption.
    pub fn office_dbp(&self) -> f64 {
        self.dbp + self.white_coat_offset * 0.5
    }

    pub fn non_hdl_cholesterol(&self) -> f64 {
        (self.total_cholesterol - self.hdl_cholesterol).max(0.2)
    }

    /// Covariate view for the risk equations. `physiological_bp` selects the
    /// latent SBP; the default pathway feeds the office reading, which is
    /// what the source equations were fitted on.
    pub fn risk_inputs(&self, physiological_bp: bool) -> RiskInputs {
        RiskInputs {
            age: self.age,
            sex: self.sex,
            sbp: if physiological_bp { self.sbp } else { self.office_sbp() },
            egfr: self.egfr,
            uacr: self.uacr,
            non_hdl: self.non_hdl_cholesterol(),
            bmi: self.bmi,
            diabetes: self.diabetes,
            smoking: self.smoking,
        }
    }

    /// Appends a history row with the current covariate snapshot.
    pub fn record(&mut self, cycle: Cycle, transition: Transition) {
        self.history.push(EventRecord {
            cycle,
            transition,
            sbp: self.sbp,
            egfr: self.egfr,
            potassium: self.potassium,
        });
    }

    /// Rows with `now - window < cycle <= now`. History is appended in cycle
    /// order, so the scan walks backwards and stops early.
    pub fn events_in_window(
        &self,
        now: Cycle,
        window_months: u32,
    ) -> impl Iterator<Item = &EventRecord> {
        let floor = now.0.saturating_sub(window_months);
        self.history.iter().rev().take_while(move |r| r.cycle.0 > floor)
    }

    /// Acute cardiac events recorded in the window, the input to the
    /// recurrence loading below.
    pub fn acute_cardiac_events_in_window(&self, now: Cycle, window_months: u32) -> usize {
        self.events_in_window(now, window_months)
            .filter(|r| matches!(r.transition, Transition::Cardiac { to, .. } if to.is_acute()))
            .count()
    }

    /// History-dependent loading on top of the state multipliers: each acute
    /// cardiac event beyond the first in the past 60 months adds 15%, capped
    /// at +60%.
    pub fn recurrence_multiplier(&self, now: Cycle) -> f64 {
        let events = self.acute_cardiac_events_in_window(now, 60);
        if events <= 1 {
            1.0
        } else {
            (1.0 + 0.15 * (events - 1) as f64).min(1.6)
        }
    }

    /// Comorbidity loading per outcome, multiplied into the competing list
    /// alongside the state and phenotype terms.
    pub fn comorbidity_multiplier(&self, outcome: CvdOutcome) -> f64 {
        let mut m = 1.0;
        if self.atrial_fibrillation
            && matches!(
                outcome,
                CvdOutcome::IschemicStroke | CvdOutcome::Tia | CvdOutcome::CvDeath
            )
        {
            m *= match outcome {
                CvdOutcome::IschemicStroke => 1.8,
                CvdOutcome::Tia => 1.5,
                _ => 1.2,
            };
        }
        if self.peripheral_artery_disease
            && matches!(outcome, CvdOutcome::Mi | CvdOutcome::CvDeath)
        {
            m *= 1.3;
        }
        m
    }

    /// Loading on background (non-CV) mortality from conditions the life
    /// table does not see.
    pub fn background_mortality_multiplier(&self) -> f64 {
        let mut m = 1.0;
        m *= match self.copd {
            None => 1.0,
            Some(CopdSeverity::Mild) => 1.15,
            Some(CopdSeverity::Moderate) => 1.4,
            Some(CopdSeverity::Severe) => 1.9,
        };
        m *= match self.substance_use {
            None => 1.0,
            Some(SubstanceType::Alcohol) => 1.3,
            Some(SubstanceType::Stimulant) => 1.5,
            Some(SubstanceType::Opioid) => 1.8,
        };
        if self.serious_mental_illness {
            m *= 1.4;
        }
        if self.smoking {
            m *= 1.35;
        }
        m
    }

    /// One month of survival: bumps the life-month counter and the per-state
    /// occupancy slots.
    pub fn accrue_month_alive(&mut self) {
        self.months_alive += 1;
        self.months_in_cardiac[self.cardiac.index()] += 1;
        self.months_in_renal[self.renal.index()] += 1;
        self.months_in_neuro[self.neuro.index()] += 1;
    }

    /// Range checks for records that arrive from outside the generator
    /// (backend ingest). Generator output always passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value, lo, hi) in [
            ("age", self.age, 18.0, 110.0),
            ("sbp", self.sbp, 60.0, 260.0),
            ("dbp", self.dbp, 30.0, 160.0),
            ("egfr", self.egfr, 0.0, 180.0),
            ("uacr", self.uacr, 0.0, 10_000.0),
            ("total_cholesterol", self.total_cholesterol, 1.0, 20.0),
            ("hdl_cholesterol", self.hdl_cholesterol, 0.2, 5.0),
            ("bmi", self.bmi, 12.0, 80.0),
            ("potassium", self.potassium, 1.5, 9.0),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { field, value });
            }
            if value < lo || value > hi {
                return Err(ConfigError::InvalidOverride {
                    key: field.to_string(),
                    value,
                    reason: "outside physiological range",
                });
            }
        }
        if !(1..=5).contains(&self.deprivation_quintile) {
            return Err(ConfigError::InvalidOverride {
                key: "deprivation_quintile".to_string(),
                value: f64::from(self.deprivation_quintile),
                reason: "quintile must be 1..=5",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phenotype::{Etiology, PhenotypeScheme};

    fn make_patient(id: u64) -> Patient {
        let scheme = PhenotypeScheme::select(62.0, 154.0, 88.0, 72.0, 30.0);
        Patient {
            id: PatientId(id),
            age: 62.0,
            sex: Sex::Male,
            deprivation_quintile: 3,
            sbp: 146.0,
            dbp: 86.0,
            white_coat_offset: 8.0,
            egfr: 72.0,
            uacr: 30.0,
            total_cholesterol: 5.4,
            hdl_cholesterol: 1.2,
            bmi: 28.0,
            potassium: 4.2,
            diabetes: false,
            smoking: false,
            copd: None,
            substance_use: None,
            depression: false,
            anxiety: false,
            serious_mental_illness: false,
            atrial_fibrillation: false,
            peripheral_artery_disease: false,
            adherent: true,
            cycles_since_adherence_change: 0,
            assigned: None,
            baseline: BaselineRiskProfile::new(scheme, Etiology::Primary, 0.18),
            cardiac: CardiacState::Stable,
            renal: RenalStage::Normal,
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
        }
    }

    // ── Liveness ─────────────────────────────────────────────────────────────

    #[test]
    fn alive_is_derived_from_state_only() {
        let mut p = make_patient(1);
        assert!(p.is_alive());
        p.cardiac = CardiacState::CvDeath;
        assert!(!p.is_alive());
        p.cardiac = CardiacState::Stable;
        p.renal = RenalStage::RenalDeath;
        assert!(!p.is_alive());
        p.renal = RenalStage::KidneyFailure;
        assert!(p.is_alive());
    }

    // ── Office vs physiological pressure ─────────────────────────────────────

    #[test]
    fn office_readings_add_the_white_coat_offset() {
        let p = make_patient(2);
        assert_eq!(p.office_sbp(), 154.0);
        assert_eq!(p.office_dbp(), 90.0);
        assert_eq!(p.risk_inputs(false).sbp, 154.0);
        assert_eq!(p.risk_inputs(true).sbp, 146.0);
    }

    // ── History and windowed queries ─────────────────────────────────────────

    #[test]
    fn record_snapshots_current_covariates() {
        let mut p = make_patient(3);
        p.sbp = 151.0;
        p.egfr = 64.0;
        p.potassium = 4.7;
        p.record(
            Cycle(5),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::AcuteMi },
        );
        let row = p.history.last().unwrap();
        assert_eq!(row.cycle, Cycle(5));
        assert_eq!(row.sbp, 151.0);
        assert_eq!(row.egfr, 64.0);
        assert_eq!(row.potassium, 4.7);
        assert_eq!(row.transition.domain(), Domain::Cardiac);
    }

    #[test]
    fn window_query_excludes_old_rows() {
        let mut p = make_patient(4);
        for cycle in [10_u32, 40, 70, 100] {
            p.record(
                Cycle(cycle),
                Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::AcuteMi },
            );
        }
        // Window (40, 100]: rows at 70 and 100.
        assert_eq!(p.events_in_window(Cycle(100), 60).count(), 2);
        assert_eq!(p.acute_cardiac_events_in_window(Cycle(100), 60), 2);
        // Everything visible from cycle 100 with a huge window.
        assert_eq!(p.events_in_window(Cycle(100), 200).count(), 4);
    }

    #[test]
    fn recurrence_loading_needs_more_than_one_event() {
        let mut p = make_patient(5);
        assert_eq!(p.recurrence_multiplier(Cycle(50)), 1.0);
        p.record(
            Cycle(20),
            Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::AcuteMi },
        );
        assert_eq!(p.recurrence_multiplier(Cycle(50)), 1.0);
        p.record(
            Cycle(30),
            Transition::Cardiac { from: CardiacState::PostMi, to: CardiacState::AcuteHf },
        );
        assert!((p.recurrence_multiplier(Cycle(50)) - 1.15).abs() < 1e-12);
        // Non-cardiac rows never count.
        p.record(Cycle(40), Transition::Adherence { adherent: false });
        assert!((p.recurrence_multiplier(Cycle(50)) - 1.15).abs() < 1e-12);
    }

    #[test]
    fn recurrence_loading_caps() {
        let mut p = make_patient(6);
        for cycle in 1..=8 {
            p.record(
                Cycle(cycle),
                Transition::Cardiac { from: CardiacState::Stable, to: CardiacState::AcuteMi },
            );
        }
        assert_eq!(p.recurrence_multiplier(Cycle(10)), 1.6);
    }

    // ── Multipliers ──────────────────────────────────────────────────────────

    #[test]
    fn af_loads_ischemic_not_hemorrhagic_stroke() {
        let mut p = make_patient(7);
        p.atrial_fibrillation = true;
        assert_eq!(p.comorbidity_multiplier(CvdOutcome::IschemicStroke), 1.8);
        assert_eq!(p.comorbidity_multiplier(CvdOutcome::HemorrhagicStroke), 1.0);
        assert_eq!(p.comorbidity_multiplier(CvdOutcome::Tia), 1.5);
    }

    #[test]
    fn background_mortality_compounds_flags() {
        let mut p = make_patient(8);
        assert_eq!(p.background_mortality_multiplier(), 1.0);
        p.copd = Some(CopdSeverity::Severe);
        p.smoking = true;
        let m = p.background_mortality_multiplier();
        assert!((m - 1.9 * 1.35).abs() < 1e-12);
    }

    // ── Accrual ──────────────────────────────────────────────────────────────

    #[test]
    fn month_accrual_tracks_state_occupancy() {
        let mut p = make_patient(9);
        p.accrue_month_alive();
        p.cardiac = CardiacState::PostMi;
        p.accrue_month_alive();
        p.accrue_month_alive();
        assert_eq!(p.months_alive, 3);
        assert_eq!(p.months_in_cardiac[CardiacState::Stable.index()], 1);
        assert_eq!(p.months_in_cardiac[CardiacState::PostMi.index()], 2);
        assert_eq!(p.months_in_renal[RenalStage::Normal.index()], 3);
    }

    // ── Validation ───────────────────────────────────────────────────────────

    #[test]
    fn validation_rejects_out_of_range_covariates() {
        let mut p = make_patient(10);
        p.validate().unwrap();
        p.egfr = -4.0;
        assert!(p.validate().is_err());
        p.egfr = 72.0;
        p.deprivation_quintile = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn non_hdl_is_floored() {
        let mut p = make_patient(11);
        p.total_cholesterol = 1.0;
        p.hdl_cholesterol = 2.0;
        assert_eq!(p.non_hdl_cholesterol(), 0.2);
    }
}
