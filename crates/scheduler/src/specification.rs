//! Typed view of a task specification, validated once at construction.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::SpecificationError;
use crate::parset::Parset;

pub const KEY_PROCESS_TYPE: &str = "ObsSW.Observation.processType";
pub const KEY_PREDECESSORS: &str = "ObsSW.Observation.Scheduler.predecessors";
pub const KEY_CLUSTER_NAME: &str = "ObsSW.Observation.Cluster.ProcessingCluster.clusterName";
pub const KEY_CLUSTER_PARTITION: &str =
    "ObsSW.Observation.Cluster.ProcessingCluster.clusterPartition";
pub const KEY_CORES_PER_TASK: &str =
    "ObsSW.Observation.Cluster.ProcessingCluster.numberOfCoresPerTask";
pub const KEY_MIN_RAM_PER_TASK: &str = "ObsSW.Observation.Cluster.ProcessingCluster.minRAMPerTask";
pub const KEY_START_TIME: &str = "ObsSW.Observation.startTime";
pub const KEY_STOP_TIME: &str = "ObsSW.Observation.stopTime";

const ABORT_SUFFIX: &str = "-aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Observation,
    Pipeline,
}

impl TaskKind {
    /// Anything other than `Pipeline` is an observation, so an unexpected
    /// value never gets scheduled here.
    pub fn from_process_type(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pipeline") => Self::Pipeline,
            _ => Self::Observation,
        }
    }
}

/// Processing clusters a task can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterTarget {
    /// Legacy cluster, handled by another controller.
    Cep2,
    Cep4,
}

/// Per-cluster defaults: `(partition, cores per task, min RAM per task in MB)`.
const CLUSTER_DEFAULTS: [(ClusterTarget, &str, u32, u32); 2] = [
    (ClusterTarget::Cep2, "cep2", 1, 4096),
    (ClusterTarget::Cep4, "cpu", 2, 8192),
];

impl ClusterTarget {
    pub fn from_name(name: &str) -> Result<Self, SpecificationError> {
        match name.to_ascii_uppercase().as_str() {
            "CEP2" => Ok(Self::Cep2),
            "CEP4" => Ok(Self::Cep4),
            _ => Err(SpecificationError::UnknownCluster(name.to_string())),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Cep2)
    }

    pub fn defaults(&self) -> ClusterSettings {
        let (target, partition, cores, ram) = CLUSTER_DEFAULTS
            .iter()
            .copied()
            .find(|(t, ..)| t == self)
            .unwrap_or(CLUSTER_DEFAULTS[0]);
        ClusterSettings {
            target,
            partition: partition.to_string(),
            cores_per_task: cores,
            min_ram_per_task_mb: ram,
        }
    }
}

impl fmt::Display for ClusterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cep2 => f.write_str("CEP2"),
            Self::Cep4 => f.write_str("CEP4"),
        }
    }
}

/// Resolved cluster with explicit overrides applied on top of its defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    pub target: ClusterTarget,
    pub partition: String,
    pub cores_per_task: u32,
    pub min_ram_per_task_mb: u32,
}

impl ClusterSettings {
    fn resolve(parset: &Parset) -> Result<Self, SpecificationError> {
        let target = match parset.get_str(KEY_CLUSTER_NAME) {
            Some(name) => ClusterTarget::from_name(name)?,
            None => ClusterTarget::Cep2,
        };
        let mut settings = target.defaults();
        if let Some(partition) = parset.get_str(KEY_CLUSTER_PARTITION) {
            settings.partition = partition.to_string();
        }
        if let Some(cores) = parset.get_u32(KEY_CORES_PER_TASK)? {
            if cores == 0 {
                return Err(SpecificationError::malformed(
                    KEY_CORES_PER_TASK,
                    "0",
                    "must be at least 1",
                ));
            }
            settings.cores_per_task = cores;
        }
        if let Some(ram) = parset.get_u32(KEY_MIN_RAM_PER_TASK)? {
            settings.min_ram_per_task_mb = ram;
        }
        Ok(settings)
    }

    /// Per-task RAM spread over the task's cores, rounded up.
    pub fn mem_per_cpu_mb(&self) -> u32 {
        self.min_ram_per_task_mb.div_ceil(self.cores_per_task.max(1))
    }
}

/// A task as the controller sees it.
#[derive(Debug, Clone)]
pub struct TaskSpecification {
    task_id: u32,
    kind: TaskKind,
    predecessors: Vec<u32>,
    cluster: ClusterSettings,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    parset: Parset,
}

impl TaskSpecification {
    pub fn from_parset(task_id: u32, parset: Parset) -> Result<Self, SpecificationError> {
        let kind = TaskKind::from_process_type(parset.get_str(KEY_PROCESS_TYPE));
        let predecessors = parset
            .get_vector(KEY_PREDECESSORS)
            .iter()
            .map(|label| {
                numeric_suffix(label).ok_or_else(|| {
                    SpecificationError::malformed(KEY_PREDECESSORS, label, "no numeric task id")
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cluster = ClusterSettings::resolve(&parset)?;

        let start_time = parset.get_timestamp(KEY_START_TIME)?;
        let stop_time = parset.get_timestamp(KEY_STOP_TIME)?;

        Ok(Self {
            task_id,
            kind,
            predecessors,
            cluster,
            start_time,
            stop_time,
            parset,
        })
    }

    /// Accepts the task database's `{"specification": {...}}` reply as well
    /// as a bare key/value object.
    pub fn from_reply(task_id: u32, reply: &Value) -> Result<Self, SpecificationError> {
        let body = reply.get("specification").unwrap_or(reply);
        Self::from_parset(task_id, Parset::from_json(body)?)
    }

    pub fn task_id(&self) -> u32 {
        self.task_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_pipeline(&self) -> bool {
        self.kind == TaskKind::Pipeline
    }

    pub fn is_observation(&self) -> bool {
        self.kind == TaskKind::Observation
    }

    pub fn predecessors(&self) -> &[u32] {
        &self.predecessors
    }

    pub fn cluster_target(&self) -> &ClusterSettings {
        &self.cluster
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        self.stop_time
    }

    /// Start and stop time of an observation, both required.
    pub fn observation_window(
        &self,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), SpecificationError> {
        let start = self
            .start_time
            .ok_or_else(|| SpecificationError::MissingField(KEY_START_TIME.into()))?;
        let stop = self
            .stop_time
            .ok_or_else(|| SpecificationError::MissingField(KEY_STOP_TIME.into()))?;
        Ok((start, stop))
    }

    pub fn parset(&self) -> &Parset {
        &self.parset
    }

    /// Scheduler job name; unique among live jobs because task ids are.
    pub fn job_name(&self) -> String {
        self.task_id.to_string()
    }

    /// Name of the companion job that marks the task aborted.
    pub fn abort_job_name(&self) -> String {
        format!("{}{ABORT_SUFFIX}", self.job_name())
    }
}

/// Trailing digits of a label: `L123` -> 123, `456` -> 456, `T` -> None.
fn numeric_suffix(label: &str) -> Option<u32> {
    let digits_start = label
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    label[digits_start..].parse().ok()
}
