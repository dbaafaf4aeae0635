//! Per-cycle competing-event machinery.
//!
//! Each live patient gets a fresh `TransitionProbabilities` every cycle: one
//! probability per candidate event, jointly rescaled so the no-event residual
//! stays positive, then resolved with a single uniform draw against the
//! cumulative distribution. Independent per-event coin flips would
//! double-count mass once several routes are live at once.

use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::patient::Patient;
use crate::risk::{CvdOutcome, annual_to_monthly_probability};
use crate::states::CardiacState;
use crate::types::Cycle;

/// Candidate events for one cycle, declared in resolution order: death
/// routes first (cardiovascular, then renal, then background), then
/// non-fatal events from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompetingEvent {
    CvDeath,
    RenalDeath,
    NonCvDeath,
    HemorrhagicStroke,
    Mi,
    IschemicStroke,
    AcuteHf,
    Tia,
}

impl CompetingEvent {
    pub const COUNT: usize = 8;

    pub const ALL: [CompetingEvent; CompetingEvent::COUNT] = [
        CompetingEvent::CvDeath,
        CompetingEvent::RenalDeath,
        CompetingEvent::NonCvDeath,
        CompetingEvent::HemorrhagicStroke,
        CompetingEvent::Mi,
        CompetingEvent::IschemicStroke,
        CompetingEvent::AcuteHf,
        CompetingEvent::Tia,
    ];

    pub fn index(self) -> usize {
        match self {
            CompetingEvent::CvDeath => 0,
            CompetingEvent::RenalDeath => 1,
            CompetingEvent::NonCvDeath => 2,
            CompetingEvent::HemorrhagicStroke => 3,
            CompetingEvent::Mi => 4,
            CompetingEvent::IschemicStroke => 5,
            CompetingEvent::AcuteHf => 6,
            CompetingEvent::Tia => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompetingEvent::CvDeath => "cv_death",
            CompetingEvent::RenalDeath => "renal_death",
            CompetingEvent::NonCvDeath => "non_cv_death",
            CompetingEvent::HemorrhagicStroke => "hemorrhagic_stroke",
            CompetingEvent::Mi => "mi",
            CompetingEvent::IschemicStroke => "ischemic_stroke",
            CompetingEvent::AcuteHf => "acute_hf",
            CompetingEvent::Tia => "tia",
        }
    }

    pub fn is_death(self) -> bool {
        matches!(
            self,
            CompetingEvent::CvDeath | CompetingEvent::RenalDeath | CompetingEvent::NonCvDeath
        )
    }

    /// Cardiac state entered when this event fires. `None` for renal death,
    /// which lands in the renal machine instead.
    pub fn cardiac_destination(self) -> Option<CardiacState> {
        match self {
            CompetingEvent::CvDeath => Some(CardiacState::CvDeath),
            CompetingEvent::RenalDeath => None,
            CompetingEvent::NonCvDeath => Some(CardiacState::NonCvDeath),
            CompetingEvent::HemorrhagicStroke => Some(CardiacState::AcuteHemorrhagicStroke),
            CompetingEvent::Mi => Some(CardiacState::AcuteMi),
            CompetingEvent::IschemicStroke => Some(CardiacState::AcuteIschemicStroke),
            CompetingEvent::AcuteHf => Some(CardiacState::AcuteHf),
            CompetingEvent::Tia => Some(CardiacState::Tia),
        }
    }

    fn for_outcome(outcome: CvdOutcome) -> CompetingEvent {
        match outcome {
            CvdOutcome::Mi => CompetingEvent::Mi,
            CvdOutcome::IschemicStroke => CompetingEvent::IschemicStroke,
            CvdOutcome::HemorrhagicStroke => CompetingEvent::HemorrhagicStroke,
            CvdOutcome::Tia => CompetingEvent::Tia,
            CvdOutcome::HeartFailure => CompetingEvent::AcuteHf,
            CvdOutcome::CvDeath => CompetingEvent::CvDeath,
        }
    }
}

/// First out-of-range input a `TransitionProbabilities` had to repair, kept
/// for divergence reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Repair {
    pub event: CompetingEvent,
    pub value: f64,
}

/// The per-cycle competing-event distribution. Inputs are repaired at the
/// door (NaN and negatives to zero, >1 to one) and the repairs counted, so a
/// divergent equation can never push bad mass into the sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionProbabilities {
    probabilities: [f64; CompetingEvent::COUNT],
    first_repair: Option<Repair>,
    repair_count: u32,
    rescale_factor: f64,
}

impl TransitionProbabilities {
    pub fn new() -> Self {
        TransitionProbabilities {
            probabilities: [0.0; CompetingEvent::COUNT],
            first_repair: None,
            repair_count: 0,
            rescale_factor: 1.0,
        }
    }

    pub fn set(&mut self, event: CompetingEvent, probability: f64) {
        let repaired = if !probability.is_finite() || probability < 0.0 {
            0.0
        } else if probability > 1.0 {
            1.0
        } else {
            probability
        };
        if repaired != probability {
            self.repair_count += 1;
            if self.first_repair.is_none() {
                self.first_repair = Some(Repair { event, value: probability });
            }
        }
        self.probabilities[event.index()] = repaired;
    }

    pub fn probability(&self, event: CompetingEvent) -> f64 {
        self.probabilities[event.index()]
    }

    pub fn total(&self) -> f64 {
        self.probabilities.iter().sum()
    }

    /// Proportional rescale whenever the total exceeds `ceiling`, keeping
    /// the relative event mix intact and the no-event residual positive.
    pub fn rescale(&mut self, ceiling: f64) {
        let total = self.total();
        if total > ceiling && total > 0.0 {
            let factor = ceiling / total;
            for probability in &mut self.probabilities {
                *probability *= factor;
            }
            self.rescale_factor = factor;
        }
    }

    pub fn rescale_factor(&self) -> f64 {
        self.rescale_factor
    }

    pub fn first_repair(&self) -> Option<Repair> {
        self.first_repair
    }

    pub fn repair_count(&self) -> u32 {
        self.repair_count
    }

    /// Resolves the cycle with one uniform in [0, 1): walks the cumulative
    /// distribution in resolution order and returns the first event whose
    /// band contains `u`, or `None` for the no-event residual. Exactly one
    /// uniform per cycle keeps RNG consumption fixed, which paired-seed
    /// comparisons rely on.
    pub fn sample(&self, u: f64) -> Option<CompetingEvent> {
        let mut cumulative = 0.0;
        for event in CompetingEvent::ALL {
            cumulative += self.probabilities[event.index()];
            if u < cumulative {
                return Some(event);
            }
        }
        None
    }
}

impl Default for TransitionProbabilities {
    fn default() -> Self {
        TransitionProbabilities::new()
    }
}

/// Assembles the cardiac competing-event distribution for one live patient
/// and cycle. Pure in everything but the patient snapshot it reads.
///
/// Each cardiovascular outcome gets the base equation times the full
/// multiplier stack: current cardiac state, renal stage, baseline phenotype,
/// comorbidity loads, recent-event recurrence and the run's calibration
/// factor. Background mortality applies to every patient regardless of
/// history; the renal death route competes only while on dialysis.
pub fn cardiac_probabilities(
    config: &SimulationConfig,
    patient: &Patient,
    cycle: Cycle,
) -> TransitionProbabilities {
    let mut probabilities = TransitionProbabilities::new();
    let inputs = patient.risk_inputs(config.risk_on_physiological_bp);
    let renal_multiplier = patient.renal.risk_multiplier();
    let recurrence = patient.recurrence_multiplier(cycle);

    for outcome in CvdOutcome::ALL {
        let multiplier = patient.cardiac.risk_multiplier(outcome)
            * renal_multiplier
            * patient.baseline.dynamic_modifier(outcome)
            * patient.comorbidity_multiplier(outcome)
            * recurrence
            * config.cvd_calibration;
        let annual = config.risk.cvd.annual_probability(&inputs, outcome, multiplier);
        probabilities.set(
            CompetingEvent::for_outcome(outcome),
            annual_to_monthly_probability(annual),
        );
    }

    if !config.disable_background_mortality {
        let annual = (config.risk.life_table.annual_mortality(patient.age, patient.sex)
            * patient.background_mortality_multiplier()
            * config.mortality_calibration)
            .min(1.0);
        probabilities.set(
            CompetingEvent::NonCvDeath,
            annual_to_monthly_probability(annual),
        );
    }

    if patient.renal.on_dialysis() {
        let annual =
            (config.dialysis_annual_mortality * config.mortality_calibration).min(1.0);
        probabilities.set(
            CompetingEvent::RenalDeath,
            annual_to_monthly_probability(annual),
        );
    }

    probabilities.rescale(config.max_monthly_event_probability);
    probabilities
}

/// Monthly probability of the patient's next neuro progression step.
/// Always driven by the latent physiological pressure, whatever the CVD
/// equations are fed.
pub fn neuro_progression_probability(config: &SimulationConfig, patient: &Patient) -> f64 {
    let annual = config.risk.neuro.annual_progression(patient.neuro, patient.age, patient.sbp);
    annual_to_monthly_probability(annual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phenotype::{BaselineRiskProfile, Etiology, PhenotypeScheme};
    use crate::states::{NeuroState, RenalStage};
    use crate::types::{PatientId, Sex};
    use proptest::prelude::*;

    fn make_patient(age: f64, sbp: f64, egfr: f64, diabetes: bool) -> Patient {
        Patient {
            id: PatientId(0),
            age,
            sex: Sex::Male,
            deprivation_quintile: 3,
            sbp,
            dbp: 86.0,
            white_coat_offset: 7.0,
            egfr,
            uacr: 30.0,
            total_cholesterol: 5.5,
            hdl_cholesterol: 1.3,
            bmi: 28.0,
            potassium: 4.2,
            diabetes,
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
            baseline: BaselineRiskProfile::new(
                PhenotypeScheme::select(age, sbp + 7.0, 89.5, egfr, 30.0),
                Etiology::Primary,
                0.12,
            ),
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
        }
    }

    // ── Resolution order ─────────────────────────────────────────────────────

    #[test]
    fn deaths_resolve_before_non_fatal_events() {
        assert_eq!(CompetingEvent::ALL[0], CompetingEvent::CvDeath);
        assert_eq!(CompetingEvent::ALL[1], CompetingEvent::RenalDeath);
        assert_eq!(CompetingEvent::ALL[2], CompetingEvent::NonCvDeath);
        for (position, event) in CompetingEvent::ALL.into_iter().enumerate() {
            assert_eq!(event.index(), position);
            assert_eq!(event.is_death(), position < 3);
        }
    }

    #[test]
    fn destinations_cover_every_event() {
        assert_eq!(
            CompetingEvent::Mi.cardiac_destination(),
            Some(CardiacState::AcuteMi)
        );
        assert_eq!(
            CompetingEvent::HemorrhagicStroke.cardiac_destination(),
            Some(CardiacState::AcuteHemorrhagicStroke)
        );
        assert_eq!(
            CompetingEvent::AcuteHf.cardiac_destination(),
            Some(CardiacState::AcuteHf)
        );
        assert_eq!(CompetingEvent::RenalDeath.cardiac_destination(), None);
        for event in CompetingEvent::ALL {
            if event != CompetingEvent::RenalDeath {
                assert!(event.cardiac_destination().is_some(), "{}", event.name());
            }
        }
    }

    // ── Input repair ─────────────────────────────────────────────────────────

    #[test]
    fn bad_inputs_are_repaired_and_counted() {
        let mut probabilities = TransitionProbabilities::new();
        probabilities.set(CompetingEvent::Mi, f64::NAN);
        probabilities.set(CompetingEvent::Tia, -0.2);
        probabilities.set(CompetingEvent::AcuteHf, 1.7);
        assert_eq!(probabilities.probability(CompetingEvent::Mi), 0.0);
        assert_eq!(probabilities.probability(CompetingEvent::Tia), 0.0);
        assert_eq!(probabilities.probability(CompetingEvent::AcuteHf), 1.0);
        assert_eq!(probabilities.repair_count(), 3);
        let first = probabilities.first_repair().unwrap();
        assert_eq!(first.event, CompetingEvent::Mi);
        assert!(first.value.is_nan());
    }

    #[test]
    fn clean_inputs_leave_no_repair_trace() {
        let mut probabilities = TransitionProbabilities::new();
        probabilities.set(CompetingEvent::Mi, 0.01);
        probabilities.set(CompetingEvent::CvDeath, 0.0);
        assert_eq!(probabilities.repair_count(), 0);
        assert!(probabilities.first_repair().is_none());
    }

    // ── Rescaling ────────────────────────────────────────────────────────────

    #[test]
    fn rescale_fires_only_above_the_ceiling() {
        let mut probabilities = TransitionProbabilities::new();
        probabilities.set(CompetingEvent::Mi, 0.10);
        probabilities.set(CompetingEvent::CvDeath, 0.05);
        probabilities.rescale(0.95);
        assert_eq!(probabilities.rescale_factor(), 1.0);
        assert!((probabilities.total() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn rescale_preserves_the_event_mix() {
        let mut probabilities = TransitionProbabilities::new();
        probabilities.set(CompetingEvent::Mi, 0.60);
        probabilities.set(CompetingEvent::IschemicStroke, 0.30);
        probabilities.set(CompetingEvent::CvDeath, 0.30);
        probabilities.rescale(0.95);
        assert!((probabilities.total() - 0.95).abs() < 1e-12);
        let mi = probabilities.probability(CompetingEvent::Mi);
        let stroke = probabilities.probability(CompetingEvent::IschemicStroke);
        let death = probabilities.probability(CompetingEvent::CvDeath);
        assert!((mi / stroke - 2.0).abs() < 1e-9);
        assert!((stroke / death - 1.0).abs() < 1e-9);
    }

    // ── Sampling ─────────────────────────────────────────────────────────────

    #[test]
    fn sample_walks_the_cumulative_bands_in_order() {
        // Dyadic probabilities so the band edges are exact: 0.125, 0.375, 0.625.
        let mut probabilities = TransitionProbabilities::new();
        probabilities.set(CompetingEvent::CvDeath, 0.125);
        probabilities.set(CompetingEvent::NonCvDeath, 0.25);
        probabilities.set(CompetingEvent::Mi, 0.25);
        assert_eq!(probabilities.sample(0.05), Some(CompetingEvent::CvDeath));
        assert_eq!(probabilities.sample(0.125), Some(CompetingEvent::NonCvDeath));
        assert_eq!(probabilities.sample(0.374), Some(CompetingEvent::NonCvDeath));
        assert_eq!(probabilities.sample(0.375), Some(CompetingEvent::Mi));
        assert_eq!(probabilities.sample(0.624), Some(CompetingEvent::Mi));
        assert_eq!(probabilities.sample(0.625), None);
        assert_eq!(probabilities.sample(0.999), None);
    }

    #[test]
    fn empty_distribution_never_fires() {
        let probabilities = TransitionProbabilities::new();
        assert_eq!(probabilities.sample(0.0), None);
        assert_eq!(probabilities.sample(0.999_999), None);
    }

    // ── Assembly ─────────────────────────────────────────────────────────────

    #[test]
    fn background_mortality_applies_to_zero_history_patients() {
        let config = SimulationConfig::canonical();
        let patient = make_patient(45.0, 120.0, 95.0, false);
        let probabilities = cardiac_probabilities(&config, &patient, Cycle(0));
        assert!(probabilities.probability(CompetingEvent::NonCvDeath) > 0.0);
        assert_eq!(probabilities.probability(CompetingEvent::RenalDeath), 0.0);

        let mut isolated = SimulationConfig::canonical();
        isolated.disable_background_mortality = true;
        let probabilities = cardiac_probabilities(&isolated, &patient, Cycle(0));
        assert_eq!(probabilities.probability(CompetingEvent::NonCvDeath), 0.0);
    }

    #[test]
    fn dialysis_opens_the_renal_death_route() {
        let config = SimulationConfig::canonical();
        let mut patient = make_patient(68.0, 150.0, 12.0, true);
        assert_eq!(patient.renal, RenalStage::KidneyFailure);
        let probabilities = cardiac_probabilities(&config, &patient, Cycle(0));
        let expected =
            annual_to_monthly_probability(config.dialysis_annual_mortality);
        assert!(
            (probabilities.probability(CompetingEvent::RenalDeath) - expected).abs() < 1e-9,
            "renal death should match the annualized dialysis mortality before rescale"
        );

        patient.renal = RenalStage::Stage3b;
        patient.egfr = 38.0;
        let probabilities = cardiac_probabilities(&config, &patient, Cycle(0));
        assert_eq!(probabilities.probability(CompetingEvent::RenalDeath), 0.0);
    }

    #[test]
    fn prior_events_raise_recurrent_risk() {
        let config = SimulationConfig::canonical();
        let stable = make_patient(64.0, 150.0, 70.0, false);
        let mut survivor = make_patient(64.0, 150.0, 70.0, false);
        survivor.cardiac = CardiacState::PostMi;
        let base = cardiac_probabilities(&config, &stable, Cycle(0));
        let elevated = cardiac_probabilities(&config, &survivor, Cycle(0));
        assert!(
            elevated.probability(CompetingEvent::Mi) > base.probability(CompetingEvent::Mi)
        );
        assert!(
            elevated.probability(CompetingEvent::CvDeath)
                > base.probability(CompetingEvent::CvDeath)
        );
    }

    #[test]
    fn calibration_scales_cvd_routes_but_not_background_mortality() {
        let mut config = SimulationConfig::canonical();
        config.cvd_calibration = 0.0;
        let patient = make_patient(64.0, 150.0, 70.0, false);
        let probabilities = cardiac_probabilities(&config, &patient, Cycle(0));
        for event in CompetingEvent::ALL {
            if event == CompetingEvent::NonCvDeath {
                assert!(probabilities.probability(event) > 0.0);
            } else {
                assert_eq!(probabilities.probability(event), 0.0, "{}", event.name());
            }
        }
    }

    #[test]
    fn neuro_probability_uses_physiological_pressure_and_stops_at_dementia() {
        let config = SimulationConfig::canonical();
        let mut patient = make_patient(75.0, 165.0, 80.0, false);
        let progressing = neuro_progression_probability(&config, &patient);
        assert!(progressing > 0.0);

        patient.sbp = 125.0;
        let calmer = neuro_progression_probability(&config, &patient);
        assert!(calmer < progressing);

        patient.neuro = NeuroState::Dementia;
        assert_eq!(neuro_progression_probability(&config, &patient), 0.0);
    }

    proptest! {
        // The joint-consistency invariant: whatever the covariates and
        // states, every probability is non-negative and the total never
        // exceeds the configured ceiling.
        #[test]
        fn competing_probabilities_stay_jointly_consistent(
            age in 30.0f64..100.0,
            sbp in 80.0f64..240.0,
            egfr in 4.0f64..120.0,
            diabetes in proptest::bool::ANY,
            cardiac_code in 0u8..9,
        ) {
            let config = SimulationConfig::canonical();
            let mut patient = make_patient(age, sbp, egfr, diabetes);
            if let Some(state) = CardiacState::from_code(cardiac_code) {
                if !state.is_terminal() {
                    patient.cardiac = state;
                }
            }
            let probabilities = cardiac_probabilities(&config, &patient, Cycle(0));
            for event in CompetingEvent::ALL {
                prop_assert!(probabilities.probability(event) >= 0.0);
            }
            prop_assert!(
                probabilities.total() <= config.max_monthly_event_probability + 1e-12
            );
            prop_assert_eq!(probabilities.repair_count(), 0);
        }
    }
}
