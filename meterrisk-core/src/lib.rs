//! meterrisk core library - failure-risk and subcounting scoring for water meters

#![deny(warnings)]

// Global invariants enforced in this crate:
// - Every stage is a pure function of its inputs
// - No global mutable state; population bounds live inside one run
// - Iteration order is explicit (BTreeMap keys, stable sorts)
// - Fatal input problems abort before any output exists
// - Identical input yields byte-for-byte identical output

pub mod aggregate;
pub mod anomaly;
pub mod combine;
pub mod config;
pub mod degradation;
pub mod error;
pub mod indicators;
pub mod inputs;
pub mod linalg;
pub mod peer;
pub mod pipeline;
pub mod report;
pub mod risk;
pub mod stats;
pub mod subcount;
pub mod summary;
pub mod types;

pub use combine::{combine_probability, RiskRecord};
pub use config::ResolvedConfig;
pub use error::{Fallback, FallbackLog, PipelineError, PipelineResult};
pub use pipeline::{run, run_subcounting, PipelineInputs, RiskTable};
pub use report::{render_json, render_text, sort_records};
pub use subcount::SubcountingMetrics;
pub use types::{ClusterId, MeterId};
