use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatientId(pub u64);

impl std::fmt::Display for PatientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simulation time in months (1 unit = 1 monthly cycle).
/// Cycle 0 is the baseline month; a patient aged 60.0 at entry is 60.0 + 1/12
/// years old when cycle 1 runs. Discounting and age drift both read elapsed
/// years from here, so the month counter is the single clock for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cycle(pub u32);

impl Cycle {
    pub const MONTHS_PER_YEAR: u32 = 12;

    pub fn from_years(years: u32) -> Self {
        Cycle(years * Self::MONTHS_PER_YEAR)
    }

    /// Elapsed time in fractional years since baseline.
    pub fn years(self) -> f64 {
        self.0 as f64 / Self::MONTHS_PER_YEAR as f64
    }

    pub fn next(self) -> Self {
        Cycle(self.0 + 1)
    }

    /// True on cycles 0, 12, 24, … — used for annual checks such as the
    /// potassium safety review.
    pub fn is_year_start(self) -> bool {
        self.0 % Self::MONTHS_PER_YEAR == 0
    }
}

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    Female,
    Male,
}

impl Sex {
    /// Stable interop code shared with external backends: female = 0,
    /// male = 1. Never reorder.
    pub fn code(self) -> u8 {
        match self {
            Sex::Female => 0,
            Sex::Male => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Sex::Female),
            1 => Some(Sex::Male),
            _ => None,
        }
    }
}

/// Life-table key. Each country carries its own background-mortality table;
/// adding a variant requires adding a table row set in `risk::LifeTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Country {
    UnitedKingdom,
    UnitedStates,
}

impl Country {
    pub fn code(self) -> u8 {
        match self {
            Country::UnitedKingdom => 0,
            Country::UnitedStates => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Country::UnitedKingdom),
            1 => Some(Country::UnitedStates),
            _ => None,
        }
    }
}

/// Whose costs count. The societal perspective adds lost-productivity costs
/// for acute events in working-age patients on top of the healthcare payer
/// costs; it never changes utilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Perspective {
    Healthcare,
    Societal,
}
