//! Operational tooling: simulation, verification, benchmarking, monitoring
//! and administration.

pub mod admin;
pub mod backoff;
pub mod bench;
pub mod monitor;
pub mod simulator;

pub use admin::Admin;
pub use backoff::{BackoffReport, BackoffStep, BackoffTester};
pub use bench::{BenchConfig, BenchReport};
pub use monitor::{HealthReport, HealthState, Monitor, MonitorHandle};
pub use simulator::{Pacing, SimulatedRequest, SimulationPlan, SimulationReport, Simulator};
