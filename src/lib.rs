//! Patient-level microsimulation of long-term antihypertensive treatment.
//!
//! A cohort of synthetic hypertensive patients is walked through monthly
//! cycles across three coupled state machines (cardiovascular, renal and
//! cognitive) under competing risks, with treatment effect, adherence and
//! safety-driven discontinuation feeding back into the risk equations.
//! Paired arms share per-patient RNG streams, so incremental costs and
//! QALYs measure treatment signal rather than sampling noise. On top of
//! the engine sit the deterministic cost-effectiveness comparison, a
//! probabilistic sensitivity analysis with correlated parameter draws, and
//! flat column/scalar surfaces for external backends and spreadsheet
//! templates.

pub mod analysis;
pub mod backend;
pub mod cea;
pub mod config;
pub mod error;
pub mod patient;
pub mod phenotype;
pub mod population;
pub mod psa;
pub mod risk;
pub mod sampling;
pub mod simulation;
pub mod states;
pub mod transitions;
pub mod treatment;
pub mod types;
