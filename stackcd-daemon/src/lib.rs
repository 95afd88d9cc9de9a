//! stackcd scheduler: periodic reconcile cycles per stack, deployed on change.

pub mod deploy;
mod error;
mod runtime;

pub use deploy::{Deployer, DockerStackDeployer, LogDeployer};
pub use error::DaemonError;
pub use runtime::{
    init_tracing, run, run_cycle, start_blocking, CycleOutcome, DeployRecord, InFlight,
    LastDeployed, RunOptions,
};
