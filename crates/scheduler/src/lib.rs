pub mod error;
pub mod parset;
pub mod runner;
pub mod slurm;
pub mod specification;

pub use error::{SchedulerError, SpecificationError};
pub use parset::Parset;
pub use runner::{CommandOutput, CommandRunner, LocalRunner, SshRunner};
pub use slurm::{BatchScheduler, Dependency, JobConstraints, JobId, SlurmGateway};
pub use specification::{ClusterSettings, ClusterTarget, TaskKind, TaskSpecification};
