use qalysim::config::SimulationConfig;
use qalysim::patient::Patient;
use qalysim::population::PopulationGenerator;

pub struct Scenario {
    pub patients: usize,
    pub years: u32,
}

pub const SMALL: Scenario = Scenario { patients: 100, years: 5 };
pub const MEDIUM: Scenario = Scenario { patients: 500, years: 10 };
pub const LARGE: Scenario = Scenario { patients: 2_000, years: 20 };

/// Canonical configuration resized to `scenario`.
pub fn build_config(scenario: &Scenario) -> SimulationConfig {
    let mut config = SimulationConfig::canonical();
    config.population.cohort_size = scenario.patients;
    config.horizon_years = scenario.years;
    config
}

/// One generated patient, for benches that isolate per-cycle math.
pub fn sample_patient(config: &SimulationConfig, seed: u64) -> Patient {
    let cohort = PopulationGenerator::new(config)
        .generate(seed)
        .expect("canonical population config generates");
    cohort.into_iter().next().expect("cohort is non-empty")
}
