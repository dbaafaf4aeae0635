//! Baseline risk stratification, computed once per patient at entry.
//!
//! Exactly one of three phenotyping schemes applies, selected by age and
//! renal function: impaired kidneys dominate everything else, then the
//! age cut separates a haemodynamic profile (younger) from an arterial
//! stiffness profile (older). The profile is read-only for the rest of the
//! run apart from etiology updates, which can arrive late when a secondary
//! cause is diagnosed after entry.

use serde::{Deserialize, Serialize};

use crate::risk::CvdOutcome;
use crate::treatment::Treatment;

/// Identified causes of secondary hypertension. Response to a given drug
/// class varies sharply across these, which is the whole reason etiology is
/// tracked at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecondaryCause {
    PrimaryAldosteronism,
    RenalArteryStenosis,
    ObstructiveSleepApnea,
    ThyroidDisorder,
}

impl SecondaryCause {
    pub const ALL: [SecondaryCause; 4] = [
        SecondaryCause::PrimaryAldosteronism,
        SecondaryCause::RenalArteryStenosis,
        SecondaryCause::ObstructiveSleepApnea,
        SecondaryCause::ThyroidDisorder,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SecondaryCause::PrimaryAldosteronism => "primary_aldosteronism",
            SecondaryCause::RenalArteryStenosis => "renal_artery_stenosis",
            SecondaryCause::ObstructiveSleepApnea => "obstructive_sleep_apnea",
            SecondaryCause::ThyroidDisorder => "thyroid_disorder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Etiology {
    Primary,
    Secondary(SecondaryCause),
}

impl Etiology {
    pub fn code(self) -> u8 {
        match self {
            Etiology::Primary => 0,
            Etiology::Secondary(SecondaryCause::PrimaryAldosteronism) => 1,
            Etiology::Secondary(SecondaryCause::RenalArteryStenosis) => 2,
            Etiology::Secondary(SecondaryCause::ObstructiveSleepApnea) => 3,
            Etiology::Secondary(SecondaryCause::ThyroidDisorder) => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Etiology::Primary),
            1 => Some(Etiology::Secondary(SecondaryCause::PrimaryAldosteronism)),
            2 => Some(Etiology::Secondary(SecondaryCause::RenalArteryStenosis)),
            3 => Some(Etiology::Secondary(SecondaryCause::ObstructiveSleepApnea)),
            4 => Some(Etiology::Secondary(SecondaryCause::ThyroidDisorder)),
            _ => None,
        }
    }
}

/// Younger patients with preserved kidneys, split on which pressure
/// component drives the picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HemodynamicVariant {
    DiastolicDominant,
    SystolicDominant,
    Mixed,
}

/// Older patients with preserved kidneys, graded by pulse pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StiffnessVariant {
    WidePulsePressure,
    Moderate,
    Preserved,
}

/// Impaired kidney function, graded by albuminuria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenalVariant {
    Albuminuric,
    Microalbuminuric,
    NonProteinuric,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PhenotypeScheme {
    Hemodynamic(HemodynamicVariant),
    Stiffness(StiffnessVariant),
    RenalDominant(RenalVariant),
}

impl PhenotypeScheme {
    /// Age cut between the haemodynamic and stiffness schemes.
    pub const AGE_CUT: f64 = 55.0;
    /// eGFR below this routes every patient to the renal-dominant scheme.
    pub const EGFR_CUT: f64 = 60.0;

    /// Scheme selection from baseline covariates. Total: every input lands
    /// in exactly one scheme.
    pub fn select(age: f64, sbp: f64, dbp: f64, egfr: f64, uacr: f64) -> PhenotypeScheme {
        if egfr < Self::EGFR_CUT {
            let variant = if uacr >= 300.0 {
                RenalVariant::Albuminuric
            } else if uacr >= 30.0 {
                RenalVariant::Microalbuminuric
            } else {
                RenalVariant::NonProteinuric
            };
            PhenotypeScheme::RenalDominant(variant)
        } else if age < Self::AGE_CUT {
            let variant = if dbp >= 90.0 && sbp < 150.0 {
                HemodynamicVariant::DiastolicDominant
            } else if sbp >= 150.0 && dbp < 90.0 {
                HemodynamicVariant::SystolicDominant
            } else {
                HemodynamicVariant::Mixed
            };
            PhenotypeScheme::Hemodynamic(variant)
        } else {
            let pulse_pressure = sbp - dbp;
            let variant = if pulse_pressure >= 65.0 {
                StiffnessVariant::WidePulsePressure
            } else if pulse_pressure >= 50.0 {
                StiffnessVariant::Moderate
            } else {
                StiffnessVariant::Preserved
            };
            PhenotypeScheme::Stiffness(variant)
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PhenotypeScheme::Hemodynamic(_) => "hemodynamic",
            PhenotypeScheme::Stiffness(_) => "stiffness",
            PhenotypeScheme::RenalDominant(_) => "renal_dominant",
        }
    }

    /// Scheme and variant folded into one interop code, shared with the
    /// column layout external backends consume.
    pub fn code(self) -> u8 {
        match self {
            PhenotypeScheme::Hemodynamic(HemodynamicVariant::DiastolicDominant) => 0,
            PhenotypeScheme::Hemodynamic(HemodynamicVariant::SystolicDominant) => 1,
            PhenotypeScheme::Hemodynamic(HemodynamicVariant::Mixed) => 2,
            PhenotypeScheme::Stiffness(StiffnessVariant::WidePulsePressure) => 3,
            PhenotypeScheme::Stiffness(StiffnessVariant::Moderate) => 4,
            PhenotypeScheme::Stiffness(StiffnessVariant::Preserved) => 5,
            PhenotypeScheme::RenalDominant(RenalVariant::Albuminuric) => 6,
            PhenotypeScheme::RenalDominant(RenalVariant::Microalbuminuric) => 7,
            PhenotypeScheme::RenalDominant(RenalVariant::NonProteinuric) => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PhenotypeScheme::Hemodynamic(HemodynamicVariant::DiastolicDominant)),
            1 => Some(PhenotypeScheme::Hemodynamic(HemodynamicVariant::SystolicDominant)),
            2 => Some(PhenotypeScheme::Hemodynamic(HemodynamicVariant::Mixed)),
            3 => Some(PhenotypeScheme::Stiffness(StiffnessVariant::WidePulsePressure)),
            4 => Some(PhenotypeScheme::Stiffness(StiffnessVariant::Moderate)),
            5 => Some(PhenotypeScheme::Stiffness(StiffnessVariant::Preserved)),
            6 => Some(PhenotypeScheme::RenalDominant(RenalVariant::Albuminuric)),
            7 => Some(PhenotypeScheme::RenalDominant(RenalVariant::Microalbuminuric)),
            8 => Some(PhenotypeScheme::RenalDominant(RenalVariant::NonProteinuric)),
            _ => None,
        }
    }
}

/// The per-patient risk-stratification snapshot. Computed once by the
/// population generator, then read every cycle by the transition layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRiskProfile {
    scheme: PhenotypeScheme,
    etiology: Etiology,
    /// Any-CVD-event probability over ten years at entry, kept for
    /// stratified reporting; not used inside the cycle loop.
    pub ten_year_cvd_risk: f64,
}

impl BaselineRiskProfile {
    pub fn new(scheme: PhenotypeScheme, etiology: Etiology, ten_year_cvd_risk: f64) -> Self {
        BaselineRiskProfile {
            scheme,
            etiology,
            ten_year_cvd_risk: ten_year_cvd_risk.clamp(0.0, 1.0),
        }
    }

    pub fn scheme(&self) -> PhenotypeScheme {
        self.scheme
    }

    pub fn etiology(&self) -> Etiology {
        self.etiology
    }

    /// A secondary cause can be diagnosed after entry; this is the only
    /// mutation the profile permits.
    pub fn update_etiology(&mut self, etiology: Etiology) {
        self.etiology = etiology;
    }

    /// Multiplier the transition layer applies on top of the base equation
    /// for `outcome`. Pure: same profile, same outcome, same answer.
    pub fn dynamic_modifier(&self, outcome: CvdOutcome) -> f64 {
        match self.scheme {
            PhenotypeScheme::Hemodynamic(variant) => match variant {
                HemodynamicVariant::DiastolicDominant => match outcome {
                    CvdOutcome::IschemicStroke | CvdOutcome::HemorrhagicStroke => 1.25,
                    CvdOutcome::Tia => 1.2,
                    CvdOutcome::Mi => 1.1,
                    CvdOutcome::HeartFailure => 1.0,
                    CvdOutcome::CvDeath => 1.05,
                },
                HemodynamicVariant::SystolicDominant => match outcome {
                    CvdOutcome::Mi => 1.2,
                    CvdOutcome::HeartFailure => 1.15,
                    CvdOutcome::IschemicStroke | CvdOutcome::HemorrhagicStroke => 1.1,
                    CvdOutcome::Tia => 1.05,
                    CvdOutcome::CvDeath => 1.1,
                },
                HemodynamicVariant::Mixed => 1.15,
            },
            PhenotypeScheme::Stiffness(variant) => match variant {
                StiffnessVariant::WidePulsePressure => match outcome {
                    CvdOutcome::IschemicStroke | CvdOutcome::HemorrhagicStroke => 1.5,
                    CvdOutcome::HeartFailure => 1.35,
                    CvdOutcome::Mi => 1.3,
                    CvdOutcome::Tia => 1.3,
                    CvdOutcome::CvDeath => 1.3,
                },
                StiffnessVariant::Moderate => 1.15,
                StiffnessVariant::Preserved => 1.0,
            },
            PhenotypeScheme::RenalDominant(variant) => match variant {
                RenalVariant::Albuminuric => match outcome {
                    CvdOutcome::HeartFailure => 1.5,
                    CvdOutcome::CvDeath => 1.4,
                    CvdOutcome::Mi => 1.35,
                    CvdOutcome::IschemicStroke | CvdOutcome::HemorrhagicStroke => 1.3,
                    CvdOutcome::Tia => 1.2,
                },
                RenalVariant::Microalbuminuric => 1.2,
                RenalVariant::NonProteinuric => 1.1,
            },
        }
    }

    /// Scales the nominal drug effect for this patient. The scheme gives a
    /// mild tilt; the etiology dominates, because secondary causes respond
    /// very differently to the same class.
    pub fn treatment_response_modifier(&self, treatment: Treatment) -> f64 {
        let scheme_factor = match (self.scheme, treatment) {
            (PhenotypeScheme::RenalDominant(_), Treatment::AceInhibitor) => 1.15,
            (PhenotypeScheme::Stiffness(_), Treatment::CalciumChannelBlocker) => 1.1,
            (PhenotypeScheme::Stiffness(_), Treatment::ThiazideDiuretic) => 1.1,
            _ => 1.0,
        };
        let etiology_factor = match self.etiology {
            Etiology::Primary => 1.0,
            Etiology::Secondary(SecondaryCause::PrimaryAldosteronism) => match treatment {
                Treatment::MineralocorticoidAntagonist => 1.9,
                Treatment::AceInhibitor => 0.75,
                Treatment::ThiazideDiuretic => 0.85,
                Treatment::CalciumChannelBlocker => 0.9,
            },
            Etiology::Secondary(SecondaryCause::RenalArteryStenosis) => match treatment {
                Treatment::AceInhibitor => 0.45,
                Treatment::CalciumChannelBlocker => 1.1,
                Treatment::ThiazideDiuretic => 1.0,
                Treatment::MineralocorticoidAntagonist => 0.9,
            },
            Etiology::Secondary(SecondaryCause::ObstructiveSleepApnea) => 0.85,
            Etiology::Secondary(SecondaryCause::ThyroidDisorder) => 0.9,
        };
        scheme_factor * etiology_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(scheme: PhenotypeScheme, etiology: Etiology) -> BaselineRiskProfile {
        BaselineRiskProfile::new(scheme, etiology, 0.15)
    }

    // ── Scheme selection ─────────────────────────────────────────────────────

    #[test]
    fn impaired_kidneys_override_the_age_split() {
        let scheme = PhenotypeScheme::select(40.0, 150.0, 95.0, 45.0, 400.0);
        assert_eq!(scheme, PhenotypeScheme::RenalDominant(RenalVariant::Albuminuric));
        let scheme = PhenotypeScheme::select(80.0, 170.0, 80.0, 59.9, 10.0);
        assert_eq!(scheme, PhenotypeScheme::RenalDominant(RenalVariant::NonProteinuric));
    }

    #[test]
    fn age_cut_separates_hemodynamic_from_stiffness() {
        let young = PhenotypeScheme::select(54.9, 155.0, 85.0, 80.0, 5.0);
        assert!(matches!(young, PhenotypeScheme::Hemodynamic(_)));
        let old = PhenotypeScheme::select(55.0, 155.0, 85.0, 80.0, 5.0);
        assert!(matches!(old, PhenotypeScheme::Stiffness(_)));
    }

    #[test]
    fn selection_is_total_and_exclusive() {
        // A coarse sweep over the covariate grid: every combination lands in
        // exactly one scheme by construction; check none panics and the
        // renal rule wins whenever eGFR is low.
        for age in [30.0, 50.0, 55.0, 75.0, 95.0] {
            for sbp in [110.0, 150.0, 200.0] {
                for dbp in [60.0, 85.0, 100.0] {
                    for egfr in [20.0, 59.0, 60.0, 95.0] {
                        for uacr in [1.0, 40.0, 500.0] {
                            let scheme = PhenotypeScheme::select(age, sbp, dbp, egfr, uacr);
                            if egfr < 60.0 {
                                assert!(matches!(scheme, PhenotypeScheme::RenalDominant(_)));
                            } else {
                                assert!(!matches!(scheme, PhenotypeScheme::RenalDominant(_)));
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn pulse_pressure_grades_the_stiffness_scheme() {
        let wide = PhenotypeScheme::select(70.0, 165.0, 75.0, 80.0, 5.0);
        assert_eq!(wide, PhenotypeScheme::Stiffness(StiffnessVariant::WidePulsePressure));
        let preserved = PhenotypeScheme::select(70.0, 130.0, 85.0, 80.0, 5.0);
        assert_eq!(preserved, PhenotypeScheme::Stiffness(StiffnessVariant::Preserved));
    }

    // ── Modifiers ────────────────────────────────────────────────────────────

    #[test]
    fn dynamic_modifiers_stay_in_sane_bounds() {
        let schemes = [
            PhenotypeScheme::Hemodynamic(HemodynamicVariant::DiastolicDominant),
            PhenotypeScheme::Hemodynamic(HemodynamicVariant::SystolicDominant),
            PhenotypeScheme::Hemodynamic(HemodynamicVariant::Mixed),
            PhenotypeScheme::Stiffness(StiffnessVariant::WidePulsePressure),
            PhenotypeScheme::Stiffness(StiffnessVariant::Moderate),
            PhenotypeScheme::Stiffness(StiffnessVariant::Preserved),
            PhenotypeScheme::RenalDominant(RenalVariant::Albuminuric),
            PhenotypeScheme::RenalDominant(RenalVariant::Microalbuminuric),
            PhenotypeScheme::RenalDominant(RenalVariant::NonProteinuric),
        ];
        for scheme in schemes {
            let p = profile(scheme, Etiology::Primary);
            for outcome in CvdOutcome::ALL {
                let m = p.dynamic_modifier(outcome);
                assert!((1.0..=1.6).contains(&m), "{scheme:?} {outcome:?}: {m}");
            }
        }
    }

    #[test]
    fn aldosteronism_prefers_the_mineralocorticoid_antagonist() {
        let p = profile(
            PhenotypeScheme::Stiffness(StiffnessVariant::Moderate),
            Etiology::Secondary(SecondaryCause::PrimaryAldosteronism),
        );
        let mra = p.treatment_response_modifier(Treatment::MineralocorticoidAntagonist);
        let ace = p.treatment_response_modifier(Treatment::AceInhibitor);
        assert!(mra > 1.5);
        assert!(ace < 1.0);
        assert!(mra > 2.0 * ace);
    }

    #[test]
    fn renal_artery_stenosis_blunts_ace_response() {
        let p = profile(
            PhenotypeScheme::RenalDominant(RenalVariant::Microalbuminuric),
            Etiology::Secondary(SecondaryCause::RenalArteryStenosis),
        );
        let ace = p.treatment_response_modifier(Treatment::AceInhibitor);
        let ccb = p.treatment_response_modifier(Treatment::CalciumChannelBlocker);
        assert!(ace < 0.6);
        assert!(ccb > 1.0);
    }

    #[test]
    fn etiology_update_changes_response_not_scheme() {
        let mut p = profile(
            PhenotypeScheme::Stiffness(StiffnessVariant::Preserved),
            Etiology::Primary,
        );
        let before = p.treatment_response_modifier(Treatment::MineralocorticoidAntagonist);
        p.update_etiology(Etiology::Secondary(SecondaryCause::PrimaryAldosteronism));
        let after = p.treatment_response_modifier(Treatment::MineralocorticoidAntagonist);
        assert!(after > before);
        assert_eq!(p.scheme(), PhenotypeScheme::Stiffness(StiffnessVariant::Preserved));
    }

    #[test]
    fn primary_etiology_is_response_neutral() {
        let p = profile(
            PhenotypeScheme::Hemodynamic(HemodynamicVariant::Mixed),
            Etiology::Primary,
        );
        for t in Treatment::ALL {
            assert_eq!(p.treatment_response_modifier(t), 1.0);
        }
    }

    #[test]
    fn etiology_codes_round_trip() {
        let all = [
            Etiology::Primary,
            Etiology::Secondary(SecondaryCause::PrimaryAldosteronism),
            Etiology::Secondary(SecondaryCause::RenalArteryStenosis),
            Etiology::Secondary(SecondaryCause::ObstructiveSleepApnea),
            Etiology::Secondary(SecondaryCause::ThyroidDisorder),
        ];
        for e in all {
            assert_eq!(Etiology::from_code(e.code()), Some(e));
        }
        assert_eq!(Etiology::from_code(99), None);
    }

    #[test]
    fn scheme_codes_round_trip() {
        let mut seen = [false; 9];
        for code in 0..9u8 {
            let scheme = PhenotypeScheme::from_code(code).unwrap();
            assert_eq!(scheme.code(), code);
            seen[code as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(PhenotypeScheme::from_code(9), None);
    }
}
