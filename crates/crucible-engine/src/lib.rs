pub mod config;
pub mod context;
pub mod delta;
mod design;
mod evaluate;
pub mod merge;
pub mod orchestrator;
pub mod preflight;
pub mod rank;
pub mod remediation;
mod scenario;
pub mod snapshot;
pub mod verification;

pub use config::*;
pub use context::*;
pub use delta::*;
pub use design::DesignPhaseResult;
pub use evaluate::EvaluationPhaseResult;
pub use orchestrator::*;
pub use preflight::*;
pub use rank::{RankedCandidate, RankingPhaseResult};
pub use remediation::*;
pub use scenario::ScenarioPhaseResult;
pub use snapshot::*;
pub use verification::*;
