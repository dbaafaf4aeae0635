use std::collections::HashMap;
use std::env;

use qalysim::analysis::percentile_stats;
use qalysim::config::SimulationConfig;
use qalysim::patient::Patient;
use qalysim::phenotype::Etiology;
use qalysim::population::PopulationGenerator;

fn main() {
    let mut config = SimulationConfig::canonical();

    if let Some(n) = env::args().nth(1).and_then(|s| s.parse().ok()) {
        config.population.cohort_size = n;
    }
    let seed: u64 = env::args().nth(2).and_then(|s| s.parse().ok()).unwrap_or(42);

    let cohort = PopulationGenerator::new(&config).generate(seed).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(2);
    });

    // Write NDJSON to stdout.
    for patient in &cohort {
        println!("{}", serde_json::to_string(patient).expect("serialisation failed"));
    }

    // Summary to stderr.
    eprintln!("cohort_table: {} patients, seed {}", cohort.len(), seed);
    if cohort.is_empty() {
        return;
    }
    let n = cohort.len() as f64;

    eprintln!(
        "  {:<12} {:>9} {:>9} {:>9} {:>9} {:>9}",
        "covariate", "mean", "sd", "p5", "p50", "p95"
    );
    let spread = |name: &str, f: fn(&Patient) -> f64| {
        let mut values: Vec<f64> = cohort.iter().map(f).collect();
        if let Some(ds) = percentile_stats(&mut values) {
            eprintln!(
                "  {:<12} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
                name, ds.mean, ds.std_dev, ds.p5, ds.p50, ds.p95
            );
        }
    };
    spread("age", |p| p.age);
    spread("sbp", |p| p.sbp);
    spread("dbp", |p| p.dbp);
    spread("bmi", |p| p.bmi);
    spread("egfr", |p| p.egfr);
    spread("uacr", |p| p.uacr);
    spread("cholesterol", |p| p.total_cholesterol);
    spread("potassium", |p| p.potassium);

    let share = |f: fn(&Patient) -> bool| cohort.iter().filter(|p| f(p)).count() as f64 / n * 100.0;
    eprintln!(
        "  diabetes={:.1}%  smoking={:.1}%  copd={:.1}%  depression={:.1}%  af={:.1}%",
        share(|p| p.diabetes),
        share(|p| p.smoking),
        share(|p| p.copd.is_some()),
        share(|p| p.depression),
        share(|p| p.atrial_fibrillation),
    );

    // Etiology breakdown.
    let mut etiology_counts: HashMap<&str, usize> = HashMap::new();
    let mut etiology_sum_risk: HashMap<&str, f64> = HashMap::new();
    for p in &cohort {
        let label = etiology_label(p.baseline.etiology());
        *etiology_counts.entry(label).or_insert(0) += 1;
        *etiology_sum_risk.entry(label).or_insert(0.0) += p.baseline.ten_year_cvd_risk;
    }
    let mut labels: Vec<&str> = etiology_counts.keys().copied().collect();
    labels.sort_unstable();
    for label in labels {
        let count = etiology_counts[label];
        let mean_risk = etiology_sum_risk[label] / count as f64;
        eprintln!("  etiology={label:<24}  patients={count:>5}  mean_risk={mean_risk:.4}");
    }

    // Phenotype scheme breakdown.
    let mut scheme_counts: HashMap<&str, usize> = HashMap::new();
    for p in &cohort {
        *scheme_counts.entry(p.baseline.scheme().name()).or_insert(0) += 1;
    }
    let mut schemes: Vec<&str> = scheme_counts.keys().copied().collect();
    schemes.sort_unstable();
    for scheme in schemes {
        eprintln!("  scheme={scheme:<14}  patients={:>5}", scheme_counts[scheme]);
    }

    // Baseline renal staging.
    let mut stage_counts: HashMap<&str, usize> = HashMap::new();
    for p in &cohort {
        *stage_counts.entry(p.renal.name()).or_insert(0) += 1;
    }
    let mut stages: Vec<&str> = stage_counts.keys().copied().collect();
    stages.sort_unstable();
    for stage in stages {
        eprintln!("  renal={stage:<14}  patients={:>5}", stage_counts[stage]);
    }
}

fn etiology_label(etiology: Etiology) -> &'static str {
    match etiology {
        Etiology::Primary => "primary",
        Etiology::Secondary(cause) => cause.name(),
    }
}
