use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use qalysim::analysis::{self, DistStats, HistoryViolation};
use qalysim::cea::{CeaResult, run_cea};
use qalysim::config::SimulationConfig;
use qalysim::error::SimError;
use qalysim::patient::Patient;
use qalysim::population::PopulationGenerator;
use qalysim::psa::{PsaOptions, PsaResult, PsaRunner};
use qalysim::simulation::{arm_label, EventCounts, SimulationEngine};
use qalysim::treatment::Treatment;
use qalysim::types::Perspective;

const DEFAULT_SEED: u64 = 42;
const DEFAULT_WTP: f64 = 20_000.0;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Cea,
    Psa,
}

struct Cli {
    mode: Mode,
    patients: Option<usize>,
    years: Option<u32>,
    seed: u64,
    comparator: Option<Treatment>,
    intervention: Option<Treatment>,
    perspective: Option<Perspective>,
    iterations: Option<usize>,
    runs: Option<u64>,
    wtp: f64,
    population: Option<f64>,
    strict: bool,
    overrides_path: Option<String>,
    trace_path: Option<String>,
    output_path: Option<String>,
    scalars_path: Option<String>,
    quiet: bool,
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut cli = Cli {
        mode: Mode::Cea,
        patients: None,
        years: None,
        seed: DEFAULT_SEED,
        comparator: None,
        intervention: Some(Treatment::AceInhibitor),
        perspective: None,
        iterations: None,
        runs: None,
        wtp: DEFAULT_WTP,
        population: None,
        strict: false,
        overrides_path: None,
        trace_path: None,
        output_path: None,
        scalars_path: None,
        quiet: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "cea" => cli.mode = Mode::Cea,
            "psa" => cli.mode = Mode::Psa,
            "--patients" => {
                i += 1;
                cli.patients = Some(flag_value(&args, i, "--patients requires a positive integer"));
            }
            "--years" => {
                i += 1;
                cli.years = Some(flag_value(&args, i, "--years requires a u32"));
            }
            "--seed" => {
                i += 1;
                cli.seed = flag_value(&args, i, "--seed requires a u64");
            }
            "--treatment" => {
                i += 1;
                cli.intervention = arm_value(&args, i, "--treatment");
            }
            "--comparator" => {
                i += 1;
                cli.comparator = arm_value(&args, i, "--comparator");
            }
            "--perspective" => {
                i += 1;
                cli.perspective = Some(perspective_value(&args, i));
            }
            "--iterations" => {
                i += 1;
                cli.iterations =
                    Some(flag_value(&args, i, "--iterations requires a positive integer"));
            }
            "--runs" => {
                i += 1;
                cli.runs = Some(flag_value(&args, i, "--runs requires a positive integer"));
            }
            "--wtp" => {
                i += 1;
                cli.wtp = flag_value(&args, i, "--wtp requires a number");
            }
            "--population" => {
                i += 1;
                cli.population =
                    Some(flag_value(&args, i, "--population requires a positive number"));
            }
            "--strict" => cli.strict = true,
            "--overrides" => {
                i += 1;
                cli.overrides_path = Some(path_value(&args, i, "--overrides requires a path"));
            }
            "--trace" => {
                i += 1;
                cli.trace_path = Some(path_value(&args, i, "--trace requires a path"));
            }
            "--output" => {
                i += 1;
                cli.output_path = Some(path_value(&args, i, "--output requires a path"));
            }
            "--scalars" => {
                i += 1;
                cli.scalars_path = Some(path_value(&args, i, "--scalars requires a path"));
            }
            "--quiet" => cli.quiet = true,
            _ => {}
        }
        i += 1;
    }

    if let Err(e) = run(&cli) {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn run(cli: &Cli) -> Result<(), SimError> {
    let mut config = SimulationConfig::canonical();
    if let Some(n) = cli.patients {
        config.population.cohort_size = n;
    }
    if let Some(y) = cli.years {
        config.horizon_years = y;
    }
    if let Some(p) = cli.perspective {
        config.perspective = p;
    }
    if cli.strict {
        config.strict_numerics = true;
    }

    if let Some(path) = &cli.overrides_path {
        let text = std::fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("failed to read {path}: {e}"));
        for (key, value) in analysis::parse_overrides(&text)? {
            config.apply_override(&key, value)?;
        }
    }
    config.validate()?;

    match cli.mode {
        Mode::Cea => run_cea_single(cli, &config),
        Mode::Psa => run_psa(cli, &config),
    }
}

fn run_cea_single(cli: &Cli, config: &SimulationConfig) -> Result<(), SimError> {
    if let Some(runs) = cli.runs {
        return run_cea_sweep(cli, config, runs);
    }

    let engine = SimulationEngine::new(config);
    let mut comparator_cohort = PopulationGenerator::new(config).generate(cli.seed)?;
    let mut intervention_cohort = comparator_cohort.clone();

    let comparator = engine.run_cohort(&mut comparator_cohort, cli.comparator, cli.seed, None)?;
    let intervention =
        engine.run_cohort(&mut intervention_cohort, cli.intervention, cli.seed, None)?;
    let result = CeaResult::from_arms(comparator, intervention);
    let scalars = analysis::cea_scalars(&result);

    if let Some(path) = &cli.trace_path {
        write_trace(path, &result, &comparator_cohort, &intervention_cohort, cli.quiet);
    }
    if let Some(path) = &cli.scalars_path {
        write_scalars(path, &scalars, cli.quiet);
    }
    if let Some(path) = &cli.output_path {
        write_output(path, &result, &scalars, cli.quiet);
    }

    if !cli.quiet {
        print_cea(cli, config, &result);
        let interval = config.treatment.safety.check_interval_months;
        let mut violations = analysis::audit_cohort(&comparator_cohort, interval);
        violations.extend(analysis::audit_cohort(&intervention_cohort, interval));
        print_audit(&violations);
    }
    Ok(())
}

fn run_cea_sweep(cli: &Cli, config: &SimulationConfig, runs: u64) -> Result<(), SimError> {
    use rayon::prelude::*;

    let results = (0..runs)
        .into_par_iter()
        .map(|i| run_cea(config, cli.comparator, cli.intervention, cli.seed + i, None))
        .collect::<Result<Vec<CeaResult>, SimError>>()?;

    if cli.quiet {
        return Ok(());
    }

    println!("\n=== Seed sweep (N={runs} runs) ===");
    println!("{:>8} | {:>12} | {:>10} | {:>12} | {}", "Seed", "dCost", "dQALYs", "NMB", "ICER");
    println!("{}", "-".repeat(64));
    for (i, r) in results.iter().enumerate() {
        println!(
            "{:>8} | {:>12.2} | {:>10.4} | {:>12.2} | {}",
            cli.seed + i as u64,
            r.delta_cost,
            r.delta_qaly,
            r.net_monetary_benefit(cli.wtp),
            r.icer,
        );
    }

    if runs < 2 {
        eprintln!("Warning: seed-level spread requires >= 2 runs");
        return Ok(());
    }

    let mut delta_costs: Vec<f64> = results.iter().map(|r| r.delta_cost).collect();
    let mut delta_qalys: Vec<f64> = results.iter().map(|r| r.delta_qaly).collect();
    let mut benefits: Vec<f64> =
        results.iter().map(|r| r.net_monetary_benefit(cli.wtp)).collect();

    println!("\n--- Seed-level spread ---");
    dist_header();
    if let Some(ds) = analysis::percentile_stats(&mut delta_costs) {
        dist_row("delta cost", &ds, 2);
    }
    if let Some(ds) = analysis::percentile_stats(&mut delta_qalys) {
        dist_row("delta QALYs", &ds, 3);
    }
    if let Some(ds) = analysis::percentile_stats(&mut benefits) {
        dist_row(&format!("NMB at {:.0}", cli.wtp), &ds, 2);
    }
    Ok(())
}

fn run_psa(cli: &Cli, config: &SimulationConfig) -> Result<(), SimError> {
    let mut options = PsaOptions::canonical();
    if let Some(n) = cli.iterations {
        options.iterations = n;
    }
    if let Some(n) = cli.population {
        options.population_size = Some(n);
    }

    let runner = PsaRunner::new(config, options)?;
    let result = runner.run(cli.comparator, cli.intervention, cli.seed, None)?;
    let scalars = analysis::psa_scalars(&result);

    if let Some(path) = &cli.scalars_path {
        write_scalars(path, &scalars, cli.quiet);
    }
    if let Some(path) = &cli.output_path {
        write_output(path, &result, &scalars, cli.quiet);
    }
    if !cli.quiet {
        print_psa(cli, config, &result);
    }
    Ok(())
}

fn write_trace(
    path: &str,
    result: &CeaResult,
    comparator_cohort: &[Patient],
    intervention_cohort: &[Patient],
    quiet: bool,
) {
    let file = File::create(path).unwrap_or_else(|e| panic!("failed to create {path}: {e}"));
    let mut writer = BufWriter::new(file);
    let mut rows = 0usize;
    let arms = [
        (result.comparator.label(), comparator_cohort),
        (result.intervention.label(), intervention_cohort),
    ];
    for (label, cohort) in arms {
        for row in analysis::trace_rows(label, cohort) {
            serde_json::to_writer(&mut writer, &row).expect("failed to serialize trace row");
            writeln!(writer).expect("failed to write newline");
            rows += 1;
        }
    }
    if !quiet {
        println!("Trace: {rows} rows → {path}");
    }
}

fn write_scalars(path: &str, pairs: &[(String, f64)], quiet: bool) {
    std::fs::write(path, analysis::scalar_sheet(pairs))
        .unwrap_or_else(|e| panic!("failed to write {path}: {e}"));
    if !quiet {
        println!("Scalars: {} keys → {path}", pairs.len());
    }
}

fn write_output<T: serde::Serialize>(path: &str, result: &T, scalars: &[(String, f64)], quiet: bool) {
    #[derive(serde::Serialize)]
    struct Export<'a, T> {
        result: &'a T,
        scalars: BTreeMap<&'a str, f64>,
    }
    let export = Export {
        result,
        scalars: scalars.iter().map(|(key, value)| (key.as_str(), *value)).collect(),
    };
    let json = serde_json::to_string_pretty(&export).expect("failed to serialize results");
    std::fs::write(path, json).unwrap_or_else(|e| panic!("failed to write {path}: {e}"));
    if !quiet {
        println!("Results → {path}");
    }
}

fn print_cea(cli: &Cli, config: &SimulationConfig, result: &CeaResult) {
    println!("\n=== {} ===", result.comparison_label());
    println!(
        "  {} patients over {} years, seed {}, {} perspective",
        result.comparator.cohort_size,
        config.horizon_years,
        cli.seed,
        perspective_name(config.perspective),
    );

    println!(
        "\n{:>28} | {:>9} | {:>12} | {:>9} | {:>9} | {:>6}",
        "Arm", "Alive", "Cost", "QALYs", "LYs", "Recov"
    );
    println!("{}", "-".repeat(86));
    for arm in [&result.comparator, &result.intervention] {
        println!(
            "{:>28} | {:>9} | {:>12.2} | {:>9.4} | {:>9.4} | {:>6}",
            arm.label(),
            format!("{}/{}", arm.alive_at_horizon, arm.cohort_size),
            arm.mean_discounted_cost,
            arm.mean_discounted_qaly,
            arm.mean_discounted_life_years,
            arm.divergence_recoveries,
        );
    }

    println!("\n=== Event counts ===");
    println!(
        "{:>20} | {:>28} | {:>28}",
        "Event",
        result.comparator.label(),
        result.intervention.label()
    );
    println!("{}", "-".repeat(82));
    let rows: [(&str, fn(&EventCounts) -> u64); 8] = [
        ("MI", |e| e.mi),
        ("ischemic stroke", |e| e.ischemic_stroke),
        ("hemorrhagic stroke", |e| e.hemorrhagic_stroke),
        ("TIA", |e| e.tia),
        ("acute HF", |e| e.acute_hf),
        ("CV death", |e| e.cv_death),
        ("non-CV death", |e| e.non_cv_death),
        ("renal death", |e| e.renal_death),
    ];
    for (name, get) in rows {
        println!(
            "{:>20} | {:>28} | {:>28}",
            name,
            get(&result.comparator.events),
            get(&result.intervention.events)
        );
    }

    println!("\n=== Incremental (per patient) ===");
    println!("  delta cost        {:>12.2}", result.delta_cost);
    println!("  delta QALYs       {:>12.4}", result.delta_qaly);
    println!("  delta life-years  {:>12.4}", result.delta_life_years);
    println!("  ICER              {}", result.icer);
    println!(
        "  NMB at WTP {:<8.0} {:>10.2}",
        cli.wtp,
        result.net_monetary_benefit(cli.wtp)
    );

    println!("\n--- Per-patient spread ---");
    dist_header();
    for arm in [&result.comparator, &result.intervention] {
        let Some(dists) = analysis::arm_distributions(arm) else { continue };
        dist_row(&format!("{} cost", arm.label()), &dists.cost, 2);
        dist_row(&format!("{} QALYs", arm.label()), &dists.qaly, 3);
    }
}

fn print_audit(violations: &[HistoryViolation]) {
    let inv = |variant: fn(&HistoryViolation) -> bool| {
        if violations.iter().any(variant) { "FAIL" } else { "PASS" }
    };

    println!("\n=== History invariants ===");
    println!("  [1] Cardiac transitions chain:     {}", inv(|v| matches!(v, HistoryViolation::CardiacChainBroken { .. })));
    println!("  [2] Cooldown follows acute state:  {}", inv(|v| matches!(v, HistoryViolation::CooldownViolated { .. })));
    println!("  [3] Renal staging never improves:  {}", inv(|v| matches!(v, HistoryViolation::RenalStageRegressed { .. })));
    println!("  [4] Cognitive decline is stepwise: {}", inv(|v| matches!(v, HistoryViolation::NeuroStepSkipped { .. })));
    println!("  [5] Dead patients stay silent:     {}", inv(|v| matches!(v, HistoryViolation::RecordAfterDeath { .. })));
    println!("  [6] Safety stops on schedule:      {}", inv(|v| matches!(v, HistoryViolation::SafetyStopOffSchedule { .. })));

    if violations.is_empty() {
        println!("  All history invariants: PASS");
    } else {
        println!("\n  {} violation(s):", violations.len());
        for v in violations {
            println!("    {v}");
        }
    }
}

fn print_psa(cli: &Cli, config: &SimulationConfig, result: &PsaResult) {
    println!(
        "\n=== Probabilistic sensitivity (N={} iterations) ===",
        result.iterations.len()
    );
    println!(
        "  {} vs {}, {} patients over {} years, seed {}",
        arm_label(cli.intervention),
        arm_label(cli.comparator),
        config.population.cohort_size,
        config.horizon_years,
        cli.seed,
    );
    println!("  mean delta cost   {:>12.2}", result.mean_delta_cost);
    println!("  mean delta QALYs  {:>12.4}", result.mean_delta_qaly);

    if let Some(spread) = analysis::psa_distributions(&result.iterations, cli.wtp) {
        println!("\n--- Iteration spread ---");
        dist_header();
        dist_row("delta cost", &spread.delta_cost, 2);
        dist_row("delta QALYs", &spread.delta_qaly, 3);
        dist_row(&format!("NMB at {:.0}", cli.wtp), &spread.net_benefit, 2);
    }

    println!("\n=== Acceptability and EVPI ===");
    println!("{:>10} | {:>10} | {:>12}", "WTP", "P(CE)", "EVPI");
    println!("{}", "-".repeat(38));
    for (ceac, evpi) in result.ceac.iter().zip(&result.evpi) {
        println!(
            "{:>10.0} | {:>10.3} | {:>12.2}",
            ceac.wtp, ceac.probability, evpi.expected_value
        );
    }

    if !result.importance.is_empty() {
        println!("\n=== Parameter importance (correlation with NMB) ===");
        for p in &result.importance {
            println!("  {:>+8.3}  {}", p.correlation, p.name);
        }
    }
}

fn dist_header() {
    println!(
        "{:>32} | {:>10} | {:>10} | {:>10} | {:>10} | {:>10} | {:>10} | {:>10} | {:>10}",
        "Metric", "min", "p5", "p25", "p50", "p75", "p95", "max", "mean"
    );
}

fn dist_row(label: &str, ds: &DistStats, prec: usize) {
    println!(
        "{:>32} | {:>10.prec$} | {:>10.prec$} | {:>10.prec$} | {:>10.prec$} | {:>10.prec$} | {:>10.prec$} | {:>10.prec$} | {:>10.prec$}",
        label,
        ds.min,
        ds.p5,
        ds.p25,
        ds.p50,
        ds.p75,
        ds.p95,
        ds.max,
        ds.mean,
        prec = prec,
    );
}

fn flag_value<T: std::str::FromStr>(args: &[String], i: usize, message: &str) -> T {
    args.get(i)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| usage_exit(message))
}

fn path_value(args: &[String], i: usize, message: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| usage_exit(message))
}

fn arm_value(args: &[String], i: usize, flag: &str) -> Option<Treatment> {
    let name = args
        .get(i)
        .unwrap_or_else(|| usage_exit(&format!("{flag} requires an arm name")));
    if name == "control" {
        return None;
    }
    match Treatment::from_name(name) {
        Some(t) => Some(t),
        None => usage_exit(&format!(
            "{flag}: unknown arm '{name}' (control, ace_inhibitor, calcium_channel_blocker, \
             thiazide_diuretic, mineralocorticoid_antagonist)"
        )),
    }
}

fn perspective_value(args: &[String], i: usize) -> Perspective {
    match args.get(i).map(String::as_str) {
        Some("healthcare") => Perspective::Healthcare,
        Some("societal") => Perspective::Societal,
        _ => usage_exit("--perspective must be 'healthcare' or 'societal'"),
    }
}

fn perspective_name(perspective: Perspective) -> &'static str {
    match perspective {
        Perspective::Healthcare => "healthcare",
        Perspective::Societal => "societal",
    }
}

fn usage_exit(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(2);
}
