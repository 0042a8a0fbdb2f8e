//! Simulation and scenario-analysis engine for compartmental PBPK/PD models.
//!
//! Models are read from JSON exchange files, optionally composed from
//! organ-level submodels, and simulated over declarative scenarios: dose
//! variants, parameter scans and repeated draws. Tasks run in parallel and
//! their trajectories are reduced to pharmacokinetic summaries.

pub mod aggregate;
pub mod analysis;
pub mod bundle;
pub mod error;
pub mod model;
pub mod scan;
pub mod scenario;
pub mod simulator;

pub use error::PbpkError;

pub mod prelude {
    pub mod model {
        pub use crate::model::{
            compose, load_definition, load_model, parse_model, CompartmentalModel,
            CompositionMap, Correspondence, ModelDefinition, PortRef, Submodel, Validator,
        };
    }
    pub mod scenario {
        pub use crate::scenario::{
            expand, DoseEvent, DoseVariant, OverrideValues, Range, Repeat, Scale, Scenario,
            SimulationTask, Timepoints,
        };
    }

    pub use crate::aggregate::{
        aggregate, AUCMethod, AggregateOptions, LambdaZOptions, PkSummary, ResultTable,
    };
    pub use crate::analysis::{run_analyses, RunOptions, RunReport, Selector};
    pub use crate::bundle::Bundle;
    pub use crate::error::PbpkError;
    pub use crate::scan::{run_scan, CancellationToken, ScanOptions};
    pub use crate::simulator::{simulate, SimulationResult, SolverOptions, TaskStatus};
}
