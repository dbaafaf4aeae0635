//! Accelerated-backend seam.
//!
//! Large cohorts can be handed to an external arm runner (another process,
//! another machine) instead of the in-process engine. Everything that
//! crosses the boundary is flat: the cohort as column-major arrays keyed by
//! field name, categorical fields as the `code()` mappings the enums define,
//! booleans as single bytes, parameter overrides as a name/value list.
//! `ReferenceBackend` implements the same contract in-process and is the
//! ground truth external backends are validated against.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::{BackendError, SimError};
use crate::patient::{CopdSeverity, Patient, SubstanceType};
use crate::phenotype::{BaselineRiskProfile, Etiology, PhenotypeScheme};
use crate::sampling::ParameterSet;
use crate::simulation::{ArmResult, SimulationEngine};
use crate::states::{CardiacState, NeuroState, RenalStage};
use crate::treatment::Treatment;
use crate::types::{PatientId, Sex};

/// Name the in-process implementation reports in errors and logs.
pub const REFERENCE_BACKEND: &str = "reference";

/// `treatment_code` value meaning the untreated control arm; drug arms use
/// `Treatment::code` (1..=4).
pub const CONTROL_CODE: u8 = 0;

pub fn treatment_code(treatment: Option<Treatment>) -> u8 {
    treatment.map_or(CONTROL_CODE, Treatment::code)
}

pub fn decode_treatment(code: u8) -> Option<Option<Treatment>> {
    if code == CONTROL_CODE {
        Some(None)
    } else {
        Treatment::from_code(code).map(Some)
    }
}

/// A baseline cohort in column-major form, one entry per patient per column.
///
/// Continuous fields are f64 columns. Categorical columns carry the enums'
/// interop codes: `Sex` 0..=1, `CopdSeverity` and `SubstanceType` with 0 for
/// absent, `PhenotypeScheme` 0..=8, `Etiology` 0..=4, `CardiacState` 0..=10,
/// `RenalStage` 0..=5, `NeuroState` 0..=2. Flag columns are 0/1 bytes.
/// Run state (treatment assignment, accumulators, history) never crosses the
/// boundary; decoded patients start clean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationColumns {
    pub id: Vec<u64>,
    pub age: Vec<f64>,
    pub sex: Vec<u8>,
    pub deprivation_quintile: Vec<u8>,
    pub sbp: Vec<f64>,
    pub dbp: Vec<f64>,
    pub white_coat_offset: Vec<f64>,
    pub egfr: Vec<f64>,
    pub uacr: Vec<f64>,
    pub total_cholesterol: Vec<f64>,
    pub hdl_cholesterol: Vec<f64>,
    pub bmi: Vec<f64>,
    pub potassium: Vec<f64>,
    pub diabetes: Vec<u8>,
    pub smoking: Vec<u8>,
    pub copd: Vec<u8>,
    pub substance_use: Vec<u8>,
    pub depression: Vec<u8>,
    pub anxiety: Vec<u8>,
    pub serious_mental_illness: Vec<u8>,
    pub atrial_fibrillation: Vec<u8>,
    pub peripheral_artery_disease: Vec<u8>,
    pub adherent: Vec<u8>,
    pub phenotype: Vec<u8>,
    pub etiology: Vec<u8>,
    pub ten_year_cvd_risk: Vec<f64>,
    pub cardiac: Vec<u8>,
    pub renal: Vec<u8>,
    pub neuro: Vec<u8>,
}

fn mismatch(column: &'static str) -> BackendError {
    BackendError::ColumnMismatch { name: REFERENCE_BACKEND.into(), column }
}

fn flag(byte: u8, column: &'static str) -> Result<bool, BackendError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(mismatch(column)),
    }
}

impl PopulationColumns {
    pub fn from_patients(patients: &[Patient]) -> PopulationColumns {
        let mut columns = PopulationColumns::default();
        for p in patients {
            columns.id.push(p.id.0);
            columns.age.push(p.age);
            columns.sex.push(p.sex.code());
            columns.deprivation_quintile.push(p.deprivation_quintile);
            columns.sbp.push(p.sbp);
            columns.dbp.push(p.dbp);
            columns.white_coat_offset.push(p.white_coat_offset);
            columns.egfr.push(p.egfr);
            columns.uacr.push(p.uacr);
            columns.total_cholesterol.push(p.total_cholesterol);
            columns.hdl_cholesterol.push(p.hdl_cholesterol);
            columns.bmi.push(p.bmi);
            columns.potassium.push(p.potassium);
            columns.diabetes.push(u8::from(p.diabetes));
            columns.smoking.push(u8::from(p.smoking));
            columns.copd.push(CopdSeverity::code(p.copd));
            columns.substance_use.push(SubstanceType::code(p.substance_use));
            columns.depression.push(u8::from(p.depression));
            columns.anxiety.push(u8::from(p.anxiety));
            columns.serious_mental_illness.push(u8::from(p.serious_mental_illness));
            columns.atrial_fibrillation.push(u8::from(p.atrial_fibrillation));
            columns.peripheral_artery_disease.push(u8::from(p.peripheral_artery_disease));
            columns.adherent.push(u8::from(p.adherent));
            columns.phenotype.push(p.baseline.scheme().code());
            columns.etiology.push(p.baseline.etiology().code());
            columns.ten_year_cvd_risk.push(p.baseline.ten_year_cvd_risk);
            columns.cardiac.push(p.cardiac.code());
            columns.renal.push(p.renal.code());
            columns.neuro.push(p.neuro.code());
        }
        columns
    }

    pub fn len(&self) -> usize {
        self.id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    fn column_lengths(&self) -> [(&'static str, usize); 28] {
        [
            ("age", self.age.len()),
            ("sex", self.sex.len()),
            ("deprivation_quintile", self.deprivation_quintile.len()),
            ("sbp", self.sbp.len()),
            ("dbp", self.dbp.len()),
            ("white_coat_offset", self.white_coat_offset.len()),
            ("egfr", self.egfr.len()),
            ("uacr", self.uacr.len()),
            ("total_cholesterol", self.total_cholesterol.len()),
            ("hdl_cholesterol", self.hdl_cholesterol.len()),
            ("bmi", self.bmi.len()),
            ("potassium", self.potassium.len()),
            ("diabetes", self.diabetes.len()),
            ("smoking", self.smoking.len()),
            ("copd", self.copd.len()),
            ("substance_use", self.substance_use.len()),
            ("depression", self.depression.len()),
            ("anxiety", self.anxiety.len()),
            ("serious_mental_illness", self.serious_mental_illness.len()),
            ("atrial_fibrillation", self.atrial_fibrillation.len()),
            ("peripheral_artery_disease", self.peripheral_artery_disease.len()),
            ("adherent", self.adherent.len()),
            ("phenotype", self.phenotype.len()),
            ("etiology", self.etiology.len()),
            ("ten_year_cvd_risk", self.ten_year_cvd_risk.len()),
            ("cardiac", self.cardiac.len()),
            ("renal", self.renal.len()),
            ("neuro", self.neuro.len()),
        ]
    }

    /// Every column must have exactly one entry per id.
    pub fn validate(&self) -> Result<(), BackendError> {
        for (column, len) in self.column_lengths() {
            if len != self.id.len() {
                return Err(mismatch(column));
            }
        }
        Ok(())
    }

    /// Decodes the columns back into patients. Length disagreements and
    /// out-of-range codes are reported by column name; continuous values
    /// pass through untouched and fall under the engine's own numerics
    /// policy once the run starts.
    pub fn to_patients(&self) -> Result<Vec<Patient>, BackendError> {
        self.validate()?;
        let mut patients = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            patients.push(self.decode_row(i)?);
        }
        Ok(patients)
    }

    fn decode_row(&self, i: usize) -> Result<Patient, BackendError> {
        let sex = Sex::from_code(self.sex[i]).ok_or_else(|| mismatch("sex"))?;
        let deprivation_quintile = self.deprivation_quintile[i];
        if !(1..=5).contains(&deprivation_quintile) {
            return Err(mismatch("deprivation_quintile"));
        }
        let copd = CopdSeverity::from_code(self.copd[i]).ok_or_else(|| mismatch("copd"))?;
        let substance_use = SubstanceType::from_code(self.substance_use[i])
            .ok_or_else(|| mismatch("substance_use"))?;
        let scheme =
            PhenotypeScheme::from_code(self.phenotype[i]).ok_or_else(|| mismatch("phenotype"))?;
        let etiology = Etiology::from_code(self.etiology[i]).ok_or_else(|| mismatch("etiology"))?;
        let cardiac = CardiacState::from_code(self.cardiac[i]).ok_or_else(|| mismatch("cardiac"))?;
        let renal = RenalStage::from_code(self.renal[i]).ok_or_else(|| mismatch("renal"))?;
        let neuro = NeuroState::from_code(self.neuro[i]).ok_or_else(|| mismatch("neuro"))?;

        Ok(Patient {
            id: PatientId(self.id[i]),
            age: self.age[i],
            sex,
            deprivation_quintile,
            sbp: self.sbp[i],
            dbp: self.dbp[i],
            white_coat_offset: self.white_coat_offset[i],
            egfr: self.egfr[i],
            uacr: self.uacr[i],
            total_cholesterol: self.total_cholesterol[i],
            hdl_cholesterol: self.hdl_cholesterol[i],
            bmi: self.bmi[i],
            potassium: self.potassium[i],
            diabetes: flag(self.diabetes[i], "diabetes")?,
            smoking: flag(self.smoking[i], "smoking")?,
            copd,
            substance_use,
            depression: flag(self.depression[i], "depression")?,
            anxiety: flag(self.anxiety[i], "anxiety")?,
            serious_mental_illness: flag(self.serious_mental_illness[i], "serious_mental_illness")?,
            atrial_fibrillation: flag(self.atrial_fibrillation[i], "atrial_fibrillation")?,
            peripheral_artery_disease: flag(
                self.peripheral_artery_disease[i],
                "peripheral_artery_disease",
            )?,
            adherent: flag(self.adherent[i], "adherent")?,
            cycles_since_adherence_change: 0,
            assigned: None,
            baseline: BaselineRiskProfile::new(scheme, etiology, self.ten_year_cvd_risk[i]),
            cardiac,
            renal,
            neuro,
            discounted_cost: 0.0,
            discounted_qaly: 0.0,
            discounted_life_years: 0.0,
            months_alive: 0,
            months_in_cardiac: [0; CardiacState::COUNT],
            months_in_renal: [0; RenalStage::COUNT],
            months_in_neuro: [0; NeuroState::COUNT],
            divergence_recoveries: 0,
            history: Vec::new(),
        })
    }
}

/// An engine that runs one arm over a prepared cohort. Implementations may
/// live out of process; everything they need crosses in flat form.
pub trait ArmBackend: Sync {
    /// Stable identifier used in logs and error reports.
    fn name(&self) -> &str;

    /// Runs the arm selected by `treatment_code` over `population` under
    /// `config` with the overrides in `psa_parameters` applied on top.
    /// Equal seeds mean identical per-patient streams, so paired arms and
    /// backend comparisons stay paired.
    fn run_arm(
        &self,
        population: &PopulationColumns,
        treatment_code: u8,
        config: &SimulationConfig,
        psa_parameters: &ParameterSet,
        seed: u64,
    ) -> Result<ArmResult, BackendError>;
}

/// The in-process implementation of the backend contract. Decodes the
/// columns and hands the cohort to `SimulationEngine`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    fn failed(detail: impl ToString) -> BackendError {
        BackendError::Failed { name: REFERENCE_BACKEND.into(), detail: detail.to_string() }
    }
}

impl ArmBackend for ReferenceBackend {
    fn name(&self) -> &str {
        REFERENCE_BACKEND
    }

    fn run_arm(
        &self,
        population: &PopulationColumns,
        treatment_code: u8,
        config: &SimulationConfig,
        psa_parameters: &ParameterSet,
        seed: u64,
    ) -> Result<ArmResult, BackendError> {
        let treatment = decode_treatment(treatment_code).ok_or_else(|| mismatch("treatment_code"))?;
        let mut config = config.clone();
        for (key, value) in psa_parameters.iter() {
            config.apply_override(key, value).map_err(Self::failed)?;
        }
        config.validate().map_err(Self::failed)?;
        let mut cohort = population.to_patients()?;
        SimulationEngine::new(&config)
            .run_cohort(&mut cohort, treatment, seed, None)
            .map_err(Self::failed)
    }
}

/// Runs the arm on `backend`; if the backend is unreachable the run is
/// redone on `ReferenceBackend`. `Failed` and `ColumnMismatch` surface
/// unchanged: only `Unavailable` is recoverable.
pub fn run_arm_with_fallback(
    backend: &dyn ArmBackend,
    population: &PopulationColumns,
    treatment_code: u8,
    config: &SimulationConfig,
    psa_parameters: &ParameterSet,
    seed: u64,
) -> Result<ArmResult, SimError> {
    match backend.run_arm(population, treatment_code, config, psa_parameters, seed) {
        Ok(result) => Ok(result),
        Err(BackendError::Unavailable { name }) => {
            warn!("backend '{name}' unavailable, rerunning on '{REFERENCE_BACKEND}'");
            ReferenceBackend
                .run_arm(population, treatment_code, config, psa_parameters, seed)
                .map_err(SimError::Backend)
        }
        Err(e) => Err(SimError::Backend(e)),
    }
}
