//! The monthly-cycle engine.
//!
//! One arm = one cohort walked from baseline to the horizon, one patient at a
//! time. Patients never interact, so the cohort is sharded across worker
//! threads; determinism comes from per-patient RNG streams derived from the
//! arm seed and the patient id, never from thread scheduling. A patient's
//! stream is a function of (seed, id) alone, which is what keeps paired arms
//! and probabilistic re-runs comparable.
//!
//! Within a cycle the step order is fixed: adherence flip, safety check,
//! neuro progression, the competing cardiac/mortality draw, accrual,
//! covariate walks, time advance with renal re-staging, and finally the
//! discontinuation check. Terminal patients are skipped entirely.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::{NumericDivergence, SimError};
use crate::patient::{Patient, Transition, TreatmentChangeReason};
use crate::population::PopulationGenerator;
use crate::states::{CardiacState, NeuroState, RenalStage};
use crate::transitions::{
    cardiac_probabilities, neuro_progression_probability, CompetingEvent, TransitionProbabilities,
};
use crate::treatment::Treatment;
use crate::types::{Cycle, PatientId, Perspective};

// ── Seeding ──────────────────────────────────────────────────────────────────

/// SplitMix64 finalizer over (base, stream). Adjacent stream indices land in
/// unrelated parts of the seed space, so patient 0 of seed 1 and patient 1 of
/// seed 0 never share a stream.
pub fn stream_seed(base_seed: u64, stream: u64) -> u64 {
    let mut z = base_seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// The stochastic stream for one patient. Fixed by (arm seed, patient id):
/// re-running the same patient under perturbed cost or utility parameters
/// replays the identical event path.
pub fn patient_rng(base_seed: u64, patient: PatientId) -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(stream_seed(base_seed, patient.0))
}

pub fn arm_label(treatment: Option<Treatment>) -> &'static str {
    match treatment {
        Some(t) => t.name(),
        None => "control",
    }
}

// ── Aggregates ───────────────────────────────────────────────────────────────

/// Acute event and death tallies for one arm, recovered from patient
/// histories after the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub mi: u64,
    pub ischemic_stroke: u64,
    pub hemorrhagic_stroke: u64,
    pub tia: u64,
    pub acute_hf: u64,
    pub cv_death: u64,
    pub non_cv_death: u64,
    pub renal_death: u64,
}

impl EventCounts {
    /// Counts entries into acute and terminal states. Cooldown rows and
    /// renal re-staging rows pass through uncounted.
    fn observe(&mut self, transition: &Transition) {
        match *transition {
            Transition::Cardiac { to, .. } => match to {
                CardiacState::AcuteMi => self.mi += 1,
                CardiacState::AcuteIschemicStroke => self.ischemic_stroke += 1,
                CardiacState::AcuteHemorrhagicStroke => self.hemorrhagic_stroke += 1,
                CardiacState::Tia => self.tia += 1,
                CardiacState::AcuteHf => self.acute_hf += 1,
                CardiacState::CvDeath => self.cv_death += 1,
                CardiacState::NonCvDeath => self.non_cv_death += 1,
                _ => {}
            },
            Transition::Renal { to: RenalStage::RenalDeath, .. } => self.renal_death += 1,
            _ => {}
        }
    }

    pub fn total_acute(&self) -> u64 {
        self.mi + self.ischemic_stroke + self.hemorrhagic_stroke + self.tia + self.acute_hf
    }

    pub fn total_deaths(&self) -> u64 {
        self.cv_death + self.non_cv_death + self.renal_death
    }
}

/// Per-patient slice of an [`ArmResult`], small enough to keep for every
/// patient of every probabilistic iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatientSummary {
    pub id: PatientId,
    pub alive: bool,
    pub months_alive: u32,
    pub discounted_cost: f64,
    pub discounted_qaly: f64,
    pub discounted_life_years: f64,
    pub divergence_recoveries: u32,
}

impl PatientSummary {
    pub fn of(patient: &Patient) -> PatientSummary {
        PatientSummary {
            id: patient.id,
            alive: patient.is_alive(),
            months_alive: patient.months_alive,
            discounted_cost: patient.discounted_cost,
            discounted_qaly: patient.discounted_qaly,
            discounted_life_years: patient.discounted_life_years,
            divergence_recoveries: patient.divergence_recoveries,
        }
    }
}

/// Everything one arm produced. Totals are summed sequentially in patient-id
/// order so the floating-point result is independent of thread count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmResult {
    pub treatment: Option<Treatment>,
    pub cohort_size: usize,
    pub alive_at_horizon: usize,
    pub total_discounted_cost: f64,
    pub total_discounted_qaly: f64,
    pub total_discounted_life_years: f64,
    pub mean_discounted_cost: f64,
    pub mean_discounted_qaly: f64,
    pub mean_discounted_life_years: f64,
    pub events: EventCounts,
    pub divergence_recoveries: u64,
    pub patients: Vec<PatientSummary>,
}

impl ArmResult {
    fn collect(treatment: Option<Treatment>, cohort: &[Patient]) -> ArmResult {
        let mut events = EventCounts::default();
        let mut alive_at_horizon = 0;
        let mut total_discounted_cost = 0.0;
        let mut total_discounted_qaly = 0.0;
        let mut total_discounted_life_years = 0.0;
        let mut divergence_recoveries = 0u64;
        let mut patients = Vec::with_capacity(cohort.len());

        for patient in cohort {
            for record in &patient.history {
                events.observe(&record.transition);
            }
            if patient.is_alive() {
                alive_at_horizon += 1;
            }
            total_discounted_cost += patient.discounted_cost;
            total_discounted_qaly += patient.discounted_qaly;
            total_discounted_life_years += patient.discounted_life_years;
            divergence_recoveries += u64::from(patient.divergence_recoveries);
            patients.push(PatientSummary::of(patient));
        }

        let n = cohort.len() as f64;
        let mean = |total: f64| if cohort.is_empty() { 0.0 } else { total / n };
        ArmResult {
            treatment,
            cohort_size: cohort.len(),
            alive_at_horizon,
            total_discounted_cost,
            total_discounted_qaly,
            total_discounted_life_years,
            mean_discounted_cost: mean(total_discounted_cost),
            mean_discounted_qaly: mean(total_discounted_qaly),
            mean_discounted_life_years: mean(total_discounted_life_years),
            events,
            divergence_recoveries,
            patients,
        }
    }

    pub fn label(&self) -> &'static str {
        arm_label(self.treatment)
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub(crate) fn cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

pub struct SimulationEngine<'a> {
    config: &'a SimulationConfig,
}

impl<'a> SimulationEngine<'a> {
    pub fn new(config: &'a SimulationConfig) -> SimulationEngine<'a> {
        SimulationEngine { config }
    }

    /// Generates the cohort for `seed` and runs it. Both arms of a paired
    /// comparison call this with the same seed and so start from identical
    /// patients.
    pub fn run_arm(
        &self,
        treatment: Option<Treatment>,
        seed: u64,
        cancel: Option<&AtomicBool>,
    ) -> Result<ArmResult, SimError> {
        let mut cohort = PopulationGenerator::new(self.config).generate(seed)?;
        self.run_cohort(&mut cohort, treatment, seed, cancel)
    }

    /// Runs an existing cohort to the horizon, mutating it in place. The
    /// caller keeps the patients, and with them the full transition
    /// histories for tracing.
    pub fn run_cohort(
        &self,
        cohort: &mut [Patient],
        treatment: Option<Treatment>,
        seed: u64,
        cancel: Option<&AtomicBool>,
    ) -> Result<ArmResult, SimError> {
        if cancelled(cancel) {
            return Err(SimError::Cancelled);
        }
        cohort
            .par_iter_mut()
            .try_for_each(|patient| self.simulate_patient(patient, treatment, seed, cancel))?;
        if cancelled(cancel) {
            return Err(SimError::Cancelled);
        }

        let result = ArmResult::collect(treatment, cohort);
        debug!(
            "arm {} seed {seed}: {}/{} alive at horizon, {} acute events, {} deaths",
            result.label(),
            result.alive_at_horizon,
            result.cohort_size,
            result.events.total_acute(),
            result.events.total_deaths(),
        );
        Ok(result)
    }

    fn simulate_patient(
        &self,
        patient: &mut Patient,
        treatment: Option<Treatment>,
        seed: u64,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), SimError> {
        let mut rng = patient_rng(seed, patient.id);
        if let Some(drug) = treatment {
            self.start_treatment(patient, drug, &mut rng)?;
        }
        for month in 0..self.config.horizon_cycles() {
            if cancelled(cancel) {
                return Ok(());
            }
            if !patient.is_alive() {
                break;
            }
            self.advance_cycle(patient, Cycle(month), seed, &mut rng)?;
        }
        Ok(())
    }

    /// Draws the individualized effect and applies it as a level shift on the
    /// latent pressures. Recorded at cycle 0, before the first cycle runs.
    fn start_treatment(
        &self,
        patient: &mut Patient,
        drug: Treatment,
        rng: &mut ChaCha20Rng,
    ) -> Result<(), SimError> {
        let modifier = patient.baseline.treatment_response_modifier(drug);
        let assigned = self.config.treatment.assign(rng, drug, modifier)?;
        patient.adherent = true;
        patient.cycles_since_adherence_change = 0;
        let effect = self.config.treatment.realized_effect(&assigned, true);
        patient.assigned = Some(assigned);
        self.shift_pressure(patient, -effect);
        patient.record(
            Cycle(0),
            Transition::Treatment {
                from: None,
                to: Some(drug),
                reason: TreatmentChangeReason::Assigned,
            },
        );
        Ok(())
    }

    /// Reverts to the no-drug comparator: the realized effect comes back off
    /// the latent pressures and the assignment is cleared.
    fn stop_treatment(&self, patient: &mut Patient, cycle: Cycle, reason: TreatmentChangeReason) {
        if let Some(assigned) = patient.assigned.take() {
            let effect = self.config.treatment.realized_effect(&assigned, patient.adherent);
            self.shift_pressure(patient, effect);
            patient.record(
                cycle,
                Transition::Treatment { from: Some(assigned.treatment), to: None, reason },
            );
        }
    }

    /// Moves the latent pressures by `delta` mmHg, diastolic at half
    /// strength, clamped to the walk bounds.
    fn shift_pressure(&self, patient: &mut Patient, delta: f64) {
        let walks = &self.config.walks;
        patient.sbp = (patient.sbp + delta).clamp(walks.sbp_lo, walks.sbp_hi);
        patient.dbp = (patient.dbp + delta * 0.5).clamp(walks.dbp_lo, walks.dbp_hi);
    }

    fn advance_cycle(
        &self,
        patient: &mut Patient,
        cycle: Cycle,
        seed: u64,
        rng: &mut ChaCha20Rng,
    ) -> Result<(), SimError> {
        let config = self.config;

        // (1) Adherence flip. The pressure shift tracks the change in the
        // realized effect, so a lapse raises the latent SBP this cycle and a
        // regain lowers it, before any risk is evaluated.
        if let Some(assigned) = patient.assigned {
            let flipped = config.treatment.check_adherence_flip(
                rng,
                patient.adherent,
                patient.age,
                patient.deprivation_quintile,
                assigned.treatment,
            )?;
            if flipped {
                let before = config.treatment.realized_effect(&assigned, patient.adherent);
                patient.adherent = !patient.adherent;
                let after = config.treatment.realized_effect(&assigned, patient.adherent);
                self.shift_pressure(patient, before - after);
                patient.cycles_since_adherence_change = 0;
                patient.record(cycle, Transition::Adherence { adherent: patient.adherent });
            } else {
                patient.cycles_since_adherence_change += 1;
            }
        }

        // (2) Scheduled lab check. Reversion lands before this cycle's cost
        // accrual, so a stopped drug is never billed for the stopping month.
        if patient.assigned.is_some()
            && config.treatment.safety_check_due(cycle)
            && config.treatment.safety_stop_triggered(patient.potassium)
        {
            self.stop_treatment(patient, cycle, TreatmentChangeReason::SafetyStop);
        }

        // (3) Neuro progression. One uniform per cycle whatever the state;
        // at the absorbing end the probability is zero and the draw is inert.
        let p_neuro = neuro_progression_probability(config, patient);
        if rng.random::<f64>() < p_neuro {
            if let Some(next) = patient.neuro.advance() {
                let from = patient.neuro;
                patient.neuro = next;
                patient.record(cycle, Transition::Neuro { from, to: next });
            }
        }

        // (4) Cardiac step. Acute states take their deterministic cooldown
        // instead of sampling; everyone else faces the competing draw.
        let cardiac_before = patient.cardiac;
        let renal_before = patient.renal;
        let mut died = false;
        if let Some(recovered) = patient.cardiac.cooldown() {
            let from = patient.cardiac;
            patient.cardiac = recovered;
            patient.record(cycle, Transition::Cardiac { from, to: recovered });
        } else {
            let probabilities = cardiac_probabilities(config, patient, cycle);
            self.note_divergence(patient, cycle, seed, &probabilities)?;
            let u = rng.random::<f64>();
            if let Some(event) = probabilities.sample(u) {
                self.apply_event(patient, cycle, event);
                died = event.is_death();
            }
        }

        // (5) Monthly accrual. The dying cycle accrues nothing unless the
        // half-cycle correction credits half a month in the pre-death state.
        let discount = config.discount_factor(cycle.0);
        if !died {
            patient.accrue_month_alive();
            let cost = self.monthly_cost(patient, patient.cardiac, patient.renal, patient.neuro)?;
            let utility = config.utilities.monthly_utility(
                patient.age,
                patient.cardiac,
                patient.renal,
                patient.neuro,
            );
            patient.discounted_cost += cost * discount;
            patient.discounted_qaly += utility / 12.0 * discount;
            patient.discounted_life_years += discount / 12.0;
        } else if config.half_cycle_correction {
            let cost = self.monthly_cost(patient, cardiac_before, renal_before, patient.neuro)?;
            let utility = config.utilities.monthly_utility(
                patient.age,
                cardiac_before,
                renal_before,
                patient.neuro,
            );
            patient.discounted_cost += 0.5 * cost * discount;
            patient.discounted_qaly += 0.5 * utility / 12.0 * discount;
            patient.discounted_life_years += 0.5 * discount / 12.0;
        }
        if died {
            return Ok(());
        }

        // (6) Covariate walks.
        self.walk_covariates(patient, rng);

        // (7) Time advance and renal re-staging from the walked eGFR. The
        // decline is monotone, so stages only ever worsen here.
        patient.age += 1.0 / 12.0;
        let stage = RenalStage::from_egfr(patient.egfr);
        if stage != patient.renal {
            let from = patient.renal;
            patient.renal = stage;
            patient.record(cycle, Transition::Renal { from, to: stage });
        }

        // (8) Discontinuation.
        if let Some(assigned) = patient.assigned {
            if config.treatment.check_discontinuation(rng, assigned.treatment)? {
                self.stop_treatment(patient, cycle, TreatmentChangeReason::Discontinued);
            }
        }
        Ok(())
    }

    /// One-time event handling: the acute or terminal-care cost lands on the
    /// firing cycle, discounted, and the destination machine flips state.
    fn apply_event(&self, patient: &mut Patient, cycle: Cycle, event: CompetingEvent) {
        let discount = self.config.discount_factor(cycle.0);
        match event.cardiac_destination() {
            Some(to) => {
                let mut one_time = self.config.costs.acute_event_cost(to);
                if self.config.perspective == Perspective::Societal {
                    one_time += self.config.costs.productivity_cost(patient.age, to);
                }
                patient.discounted_cost += one_time * discount;
                let from = patient.cardiac;
                patient.cardiac = to;
                patient.record(cycle, Transition::Cardiac { from, to });
            }
            None => {
                patient.discounted_cost += self.config.costs.renal_death * discount;
                let from = patient.renal;
                patient.renal = RenalStage::RenalDeath;
                patient.record(cycle, Transition::Renal { from, to: RenalStage::RenalDeath });
            }
        }
    }

    /// State upkeep plus the drug cost while a prescription is open. The
    /// prescription is dispensed whether or not the patient takes it, so
    /// adherence does not gate the cost.
    fn monthly_cost(
        &self,
        patient: &Patient,
        cardiac: CardiacState,
        renal: RenalStage,
        neuro: NeuroState,
    ) -> Result<f64, SimError> {
        let mut cost = self.config.costs.monthly_state_cost(cardiac, renal, neuro);
        if let Some(assigned) = patient.assigned {
            cost += self.config.treatment.effects.get(assigned.treatment)?.monthly_cost;
        }
        Ok(cost)
    }

    /// Clamp-and-count by default; strict mode aborts the arm with enough
    /// context to replay the exact patient-cycle.
    fn note_divergence(
        &self,
        patient: &mut Patient,
        cycle: Cycle,
        seed: u64,
        probabilities: &TransitionProbabilities,
    ) -> Result<(), SimError> {
        let repairs = probabilities.repair_count();
        if repairs == 0 {
            return Ok(());
        }
        if self.config.strict_numerics {
            if let Some(repair) = probabilities.first_repair() {
                return Err(SimError::Numeric(NumericDivergence {
                    seed,
                    cycle,
                    patient: patient.id,
                    quantity: repair.event.name(),
                    value: repair.value,
                }));
            }
        }
        patient.divergence_recoveries += repairs;
        Ok(())
    }

    fn walk_covariates(&self, patient: &mut Patient, rng: &mut ChaCha20Rng) {
        let walks = &self.config.walks;

        let sbp_noise: f64 = rng.sample(StandardNormal);
        patient.sbp = (patient.sbp
            + walks.sbp_age_drift_per_year / 12.0
            + sbp_noise * walks.sbp_noise_sd)
            .clamp(walks.sbp_lo, walks.sbp_hi);

        let dbp_noise: f64 = rng.sample(StandardNormal);
        patient.dbp = (patient.dbp
            + walks.dbp_age_drift_per_year / 12.0
            + dbp_noise * walks.dbp_noise_sd)
            .clamp(walks.dbp_lo, walks.dbp_hi);

        // Mean reversion toward a target the active drug class may shift.
        let target = walks.potassium_target
            + patient.assigned.map_or(0.0, |a| a.treatment.potassium_target_shift());
        let potassium_noise: f64 = rng.sample(StandardNormal);
        patient.potassium = (patient.potassium
            + walks.potassium_reversion * (target - patient.potassium)
            + potassium_noise * walks.potassium_noise_sd)
            .clamp(walks.potassium_lo, walks.potassium_hi);

        // eGFR decline runs off the latent pressure, accelerated by the
        // kidney-failure risk at the current covariates.
        let inputs = patient.risk_inputs(true);
        let kidney_risk = self.config.risk.kidney.two_year_risk(&inputs);
        let protected = patient.adherent
            && patient.assigned.is_some_and(|a| a.treatment.is_kidney_protective());
        let decline = self.config.risk.egfr_decline.monthly_decline(&inputs, kidney_risk, protected);
        patient.egfr = (patient.egfr - decline).max(2.0);
    }
}
