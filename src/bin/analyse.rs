//! Trace-stream auditor for qalysim simulation output.
//!
//! Reads the NDJSON trace written by `qalysim --trace`, deserializes it using
//! the same `TraceRow` type the simulation writes, then prints:
//!   Tier 1 — transition invariant status (PASS/FAIL per rule)
//!   Tier 2 — per-arm row census by domain
//!   Tier 3 — per-arm terminal-state census

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader},
};

use qalysim::{
    analysis::TraceRow,
    states::{CardiacState, NeuroState, RenalStage},
};

enum TraceViolation {
    CardiacChainBroken { arm: String, patient: u64, cycle: u32, expected: String, found: String },
    RenalRowInvalid { arm: String, patient: u64, cycle: u32, detail: String },
    NeuroRowInvalid { arm: String, patient: u64, cycle: u32, detail: String },
    CycleOrder { arm: String, patient: u64, cycle: u32, previous: u32 },
    RowAfterDeath { arm: String, patient: u64, cycle: u32 },
    CovariateOutOfRange { arm: String, patient: u64, cycle: u32, field: &'static str, value: f64 },
    UnknownState { arm: String, patient: u64, cycle: u32, detail: String },
}

impl std::fmt::Display for TraceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CardiacChainBroken { arm, patient, cycle, expected, found } => {
                write!(f, "CardiacChainBroken  arm={arm}  patient={patient}  cycle={cycle}  expected={expected}  found={found}")
            }
            Self::RenalRowInvalid { arm, patient, cycle, detail } => {
                write!(f, "RenalRowInvalid  arm={arm}  patient={patient}  cycle={cycle}  {detail}")
            }
            Self::NeuroRowInvalid { arm, patient, cycle, detail } => {
                write!(f, "NeuroRowInvalid  arm={arm}  patient={patient}  cycle={cycle}  {detail}")
            }
            Self::CycleOrder { arm, patient, cycle, previous } => {
                write!(f, "CycleOrder  arm={arm}  patient={patient}  cycle={cycle}  previous={previous}")
            }
            Self::RowAfterDeath { arm, patient, cycle } => {
                write!(f, "RowAfterDeath  arm={arm}  patient={patient}  cycle={cycle}")
            }
            Self::CovariateOutOfRange { arm, patient, cycle, field, value } => {
                write!(f, "CovariateOutOfRange  arm={arm}  patient={patient}  cycle={cycle}  {field}={value}")
            }
            Self::UnknownState { arm, patient, cycle, detail } => {
                write!(f, "UnknownState  arm={arm}  patient={patient}  cycle={cycle}  {detail}")
            }
        }
    }
}

fn main() {
    // ── Resolve trace file path: first positional arg, else default ───────────
    let trace_path = std::env::args().nth(1).unwrap_or_else(|| "trace.ndjson".to_string());

    // ── Load rows ─────────────────────────────────────────────────────────────
    let file = File::open(&trace_path).unwrap_or_else(|e| {
        eprintln!("error: cannot open {trace_path} — {e}");
        eprintln!("Run `qalysim --trace {trace_path}` first to generate the trace.");
        std::process::exit(1);
    });

    let mut rows: Vec<TraceRow> = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.unwrap_or_else(|e| {
            eprintln!("error reading line {}: {}", line_no + 1, e);
            std::process::exit(1);
        });
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceRow>(&line) {
            Ok(row) => rows.push(row),
            Err(e) => {
                eprintln!("error: failed to deserialize line {}: {}", line_no + 1, e);
                eprintln!("  line: {line}");
                std::process::exit(1);
            }
        }
    }

    // Rows grouped per (arm, patient); file order is recording order within
    // a group, so the chain checks can walk it directly.
    let mut by_patient: BTreeMap<(String, u64), Vec<&TraceRow>> = BTreeMap::new();
    for row in &rows {
        by_patient.entry((row.arm.clone(), row.patient)).or_default().push(row);
    }

    let mut violations: Vec<TraceViolation> = Vec::new();
    for ((arm, patient), patient_rows) in &by_patient {
        check_patient(arm, *patient, patient_rows, &mut violations);
    }

    // ── Tier 1: transition invariants ─────────────────────────────────────────
    println!("=== Tier 1 — Trace Invariants ===");

    let has = |f: fn(&TraceViolation) -> bool| violations.iter().any(f);

    fn status(fail: bool) -> &'static str {
        if fail { "FAIL" } else { "PASS" }
    }

    println!(
        "  [{}] Inv 1 — Cardiac transitions chain (from = previous to)",
        status(has(|v| matches!(v, TraceViolation::CardiacChainBroken { .. })))
    );
    println!(
        "  [{}] Inv 2 — Renal rows strictly worsen and chain",
        status(has(|v| matches!(v, TraceViolation::RenalRowInvalid { .. })))
    );
    println!(
        "  [{}] Inv 3 — Neuro rows decline exactly one stage",
        status(has(|v| matches!(v, TraceViolation::NeuroRowInvalid { .. })))
    );
    println!(
        "  [{}] Inv 4 — Cycles non-decreasing per patient",
        status(has(|v| matches!(v, TraceViolation::CycleOrder { .. })))
    );
    println!(
        "  [{}] Inv 5 — No rows after a death row",
        status(has(|v| matches!(v, TraceViolation::RowAfterDeath { .. })))
    );
    println!(
        "  [{}] Inv 6 — Covariates finite and positive",
        status(has(|v| matches!(v, TraceViolation::CovariateOutOfRange { .. })))
    );
    println!(
        "  [{}] Inv 7 — Every state name decodes",
        status(has(|v| matches!(v, TraceViolation::UnknownState { .. })))
    );

    if violations.is_empty() {
        println!("  All trace invariants PASS ({} rows checked)", rows.len());
    } else {
        println!("\n  {} violation(s) detected:", violations.len());
        for v in &violations {
            println!("    {v}");
        }
    }

    println!();

    // ── Tier 2: per-arm row census by domain ──────────────────────────────────
    let mut arms: Vec<&str> = Vec::new();
    for row in &rows {
        if !arms.contains(&row.arm.as_str()) {
            arms.push(&row.arm);
        }
    }

    println!("=== Tier 2 — Row Census by Domain ===");
    println!(
        "{:>28} | {:>8} | {:>8} | {:>8} | {:>9} | {:>9} | {:>8}",
        "Arm", "cardiac", "renal", "neuro", "treatmnt", "adherenc", "total"
    );
    println!("{}", "-".repeat(28 + 3 + 8 + 3 + 8 + 3 + 8 + 3 + 9 + 3 + 9 + 3 + 8));
    for arm in &arms {
        let count = |domain: &str| {
            rows.iter().filter(|r| r.arm == *arm && r.domain == domain).count()
        };
        let total = rows.iter().filter(|r| r.arm == *arm).count();
        println!(
            "{:>28} | {:>8} | {:>8} | {:>8} | {:>9} | {:>9} | {:>8}",
            arm,
            count("cardiac"),
            count("renal"),
            count("neuro"),
            count("treatment"),
            count("adherence"),
            total,
        );
    }

    println!();

    // ── Tier 3: per-arm terminal-state census ─────────────────────────────────
    println!("=== Tier 3 — Terminal-State Census ===");
    println!(
        "{:>28} | {:>8} | {:>8} | {:>9} | {:>10} | {:>11} | {:>10}",
        "Arm", "Patients", "CV death", "Non-CV", "Renal", "SafetyStop", "Discontin"
    );
    println!("{}", "-".repeat(28 + 3 + 8 + 3 + 8 + 3 + 9 + 3 + 10 + 3 + 11 + 3 + 10));
    for arm in &arms {
        let patients =
            by_patient.keys().filter(|(a, _)| a == *arm).count();
        let deaths = |name: &str| {
            rows.iter()
                .filter(|r| r.arm == *arm && (r.domain == "cardiac" || r.domain == "renal"))
                .filter(|r| r.to == name)
                .count()
        };
        let reasons = |name: &str| {
            rows.iter()
                .filter(|r| r.arm == *arm && r.reason.as_deref() == Some(name))
                .count()
        };
        println!(
            "{:>28} | {:>8} | {:>8} | {:>9} | {:>10} | {:>11} | {:>10}",
            arm,
            patients,
            deaths("cv_death"),
            deaths("non_cv_death"),
            deaths("renal_death"),
            reasons("safety_stop"),
            reasons("discontinued"),
        );
    }
    println!();
}

fn check_patient(arm: &str, patient: u64, rows: &[&TraceRow], out: &mut Vec<TraceViolation>) {
    let mut last_cycle: Option<u32> = None;
    let mut last_cardiac: Option<CardiacState> = None;
    let mut last_renal: Option<RenalStage> = None;
    let mut last_neuro: Option<NeuroState> = None;
    let mut dead = false;

    for row in rows {
        if dead {
            out.push(TraceViolation::RowAfterDeath {
                arm: arm.to_string(),
                patient,
                cycle: row.cycle,
            });
            continue;
        }

        if let Some(previous) = last_cycle {
            if row.cycle < previous {
                out.push(TraceViolation::CycleOrder {
                    arm: arm.to_string(),
                    patient,
                    cycle: row.cycle,
                    previous,
                });
            }
        }
        last_cycle = Some(row.cycle);

        for (field, value) in [("sbp", row.sbp), ("egfr", row.egfr), ("potassium", row.potassium)]
        {
            if !value.is_finite() || value <= 0.0 {
                out.push(TraceViolation::CovariateOutOfRange {
                    arm: arm.to_string(),
                    patient,
                    cycle: row.cycle,
                    field,
                    value,
                });
            }
        }

        match row.domain.as_str() {
            "cardiac" => {
                let (Some(from), Some(to)) = (cardiac_state(&row.from), cardiac_state(&row.to))
                else {
                    push_unknown(out, arm, patient, row);
                    continue;
                };
                if let Some(previous) = last_cardiac {
                    if from != previous {
                        out.push(TraceViolation::CardiacChainBroken {
                            arm: arm.to_string(),
                            patient,
                            cycle: row.cycle,
                            expected: previous.name().to_string(),
                            found: from.name().to_string(),
                        });
                    }
                }
                last_cardiac = Some(to);
                if to.is_terminal() {
                    dead = true;
                }
            }
            "renal" => {
                let (Some(from), Some(to)) = (renal_stage(&row.from), renal_stage(&row.to))
                else {
                    push_unknown(out, arm, patient, row);
                    continue;
                };
                if let Some(previous) = last_renal {
                    if from != previous {
                        out.push(TraceViolation::RenalRowInvalid {
                            arm: arm.to_string(),
                            patient,
                            cycle: row.cycle,
                            detail: format!(
                                "expected from={}, found {}",
                                previous.name(),
                                from.name()
                            ),
                        });
                    }
                }
                if to.index() <= from.index() {
                    out.push(TraceViolation::RenalRowInvalid {
                        arm: arm.to_string(),
                        patient,
                        cycle: row.cycle,
                        detail: format!("{} -> {} does not worsen", from.name(), to.name()),
                    });
                }
                last_renal = Some(to);
                if to.is_terminal() {
                    dead = true;
                }
            }
            "neuro" => {
                let (Some(from), Some(to)) = (neuro_state(&row.from), neuro_state(&row.to))
                else {
                    push_unknown(out, arm, patient, row);
                    continue;
                };
                if let Some(previous) = last_neuro {
                    if from != previous {
                        out.push(TraceViolation::NeuroRowInvalid {
                            arm: arm.to_string(),
                            patient,
                            cycle: row.cycle,
                            detail: format!(
                                "expected from={}, found {}",
                                previous.name(),
                                from.name()
                            ),
                        });
                    }
                }
                if to.index() != from.index() + 1 {
                    out.push(TraceViolation::NeuroRowInvalid {
                        arm: arm.to_string(),
                        patient,
                        cycle: row.cycle,
                        detail: format!("{} -> {} is not one stage", from.name(), to.name()),
                    });
                }
                last_neuro = Some(to);
            }
            // Treatment and adherence rows carry no chain rule the trace alone
            // can check; the engine-side audit covers the safety schedule.
            _ => {}
        }
    }
}

fn push_unknown(out: &mut Vec<TraceViolation>, arm: &str, patient: u64, row: &TraceRow) {
    out.push(TraceViolation::UnknownState {
        arm: arm.to_string(),
        patient,
        cycle: row.cycle,
        detail: format!("{} -> {}", row.from, row.to),
    });
}

fn cardiac_state(name: &str) -> Option<CardiacState> {
    (0..CardiacState::COUNT as u8)
        .filter_map(CardiacState::from_code)
        .find(|s| s.name() == name)
}

fn renal_stage(name: &str) -> Option<RenalStage> {
    (0..RenalStage::COUNT as u8).filter_map(RenalStage::from_code).find(|s| s.name() == name)
}

fn neuro_state(name: &str) -> Option<NeuroState> {
    (0..NeuroState::COUNT as u8).filter_map(NeuroState::from_code).find(|s| s.name() == name)
}
