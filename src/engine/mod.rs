//! State reconciliation between the controller and the bus.

mod commands;
mod gate;
mod reconcile;
mod scheduler;

pub use commands::{CommandFact, CommandRouter, DeviceDirectory, Lookup, Routed};
pub use gate::{AnalysisGate, AnalysisPermit};
pub use reconcile::{Observed, ReconciliationEngine};
pub use scheduler::{Scheduler, TokioScheduler};
