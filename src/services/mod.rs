pub mod confidence;
pub mod exporter;
pub mod failure_log;
pub mod stats;
pub mod syntax;

pub use confidence::{ConfidenceDecision, ConfidenceEvaluator};
pub use exporter::{JsonExporter, ResultExporter, StandardizedBlock, StandardizedDocument};
pub use failure_log::FailureLog;
pub use stats::{EngineStats, FailureReasonStat, StatsAggregator, StatsSnapshot};
pub use syntax::{FormulaRenderer, KnownCommandRenderer, SyntaxError, SyntaxValidator};
