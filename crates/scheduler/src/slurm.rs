//! Submit, cancel and look up batch jobs by name.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::runner::{CommandOutput, CommandRunner};

/// Flags every submission carries: wait for the whole allocation, fail
/// right away on an unsatisfiable dependency, requeue on node failure and
/// allow up to 31 days of wall clock.
pub const BASE_SBATCH_FLAGS: [&str; 4] = [
    "--wait-all-nodes=1",
    "--kill-on-invalid-dep=yes",
    "--requeue",
    "--time=31-0",
];

const BEGIN_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const SUBMITTED_PREFIX: &str = "Submitted batch job ";

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Start only after the job succeeded; cancelled with it otherwise.
    AfterOk(JobId),
    /// Start only if the job failed, was killed or was cancelled.
    AfterNotOk(JobId),
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterOk(id) => write!(f, "afterok:{id}"),
            Self::AfterNotOk(id) => write!(f, "afternotok:{id}"),
        }
    }
}

/// Everything about a submission except its name and command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobConstraints {
    pub partition: Option<String>,
    pub cpus_per_task: Option<u32>,
    pub mem_per_cpu_mb: Option<u32>,
    /// Earliest start.
    pub begin: Option<DateTime<Utc>>,
    pub dependencies: Vec<Dependency>,
}

impl JobConstraints {
    pub fn after_ok(ids: impl IntoIterator<Item = JobId>) -> Self {
        Self {
            dependencies: ids.into_iter().map(Dependency::AfterOk).collect(),
            ..Self::default()
        }
    }

    pub fn after_not_ok(id: JobId) -> Self {
        Self {
            dependencies: vec![Dependency::AfterNotOk(id)],
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submit `command` under `job_name`. Not idempotent: submitting twice
    /// creates two jobs with the same name.
    async fn submit(
        &self,
        job_name: &str,
        command: &str,
        constraints: &JobConstraints,
    ) -> Result<JobId, SchedulerError>;

    /// Cancel every job named `job_name`. Best effort: failures are logged,
    /// and cancelling a finished or unknown job is fine.
    async fn cancel(&self, job_name: &str);

    async fn job_id(&self, job_name: &str) -> Result<Option<JobId>, SchedulerError>;

    /// Id of a job named `job_name` that is still pending or running.
    /// Finished and cancelled jobs are not reported.
    async fn active_job_id(&self, job_name: &str) -> Result<Option<JobId>, SchedulerError>;

    /// [`job_id`](Self::job_id) for a job that must exist.
    async fn require_job_id(&self, job_name: &str) -> Result<JobId, SchedulerError> {
        self.job_id(job_name)
            .await?
            .ok_or_else(|| SchedulerError::UnresolvedDependency(job_name.to_string()))
    }
}

/// [`BatchScheduler`] driving the Slurm command line tools.
pub struct SlurmGateway<R> {
    runner: R,
}

impl<R: CommandRunner> SlurmGateway<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn run_checked(&self, argv: Vec<String>) -> Result<CommandOutput, SchedulerError> {
        let output = self.runner.run(&argv).await?;
        if !output.success() {
            return Err(SchedulerError::CommandFailed {
                program: argv.first().cloned().unwrap_or_default(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl<R: CommandRunner> BatchScheduler for SlurmGateway<R> {
    async fn submit(
        &self,
        job_name: &str,
        command: &str,
        constraints: &JobConstraints,
    ) -> Result<JobId, SchedulerError> {
        let output = self
            .run_checked(sbatch_argv(job_name, command, constraints))
            .await?;
        let id = parse_submitted(&output.stdout).ok_or_else(|| SchedulerError::UnexpectedOutput {
            program: "sbatch".into(),
            output: output.stdout.trim().to_string(),
        })?;
        info!(job_name, job_id = %id, "submitted slurm job");
        Ok(id)
    }

    async fn cancel(&self, job_name: &str) {
        let argv = vec!["scancel".into(), "--jobname".into(), job_name.to_string()];
        match self.run_checked(argv).await {
            Ok(_) => info!(job_name, "cancelled slurm job"),
            Err(e) => warn!(job_name, error = %e, "failed to cancel slurm job"),
        }
    }

    async fn job_id(&self, job_name: &str) -> Result<Option<JobId>, SchedulerError> {
        let output = self.run_checked(sacct_argv(job_name)).await?;
        let ids = parse_sacct(&output.stdout, job_name);
        if ids.len() > 1 {
            warn!(job_name, ?ids, "several slurm jobs share this name, using the last");
        }
        let id = ids.into_iter().last();
        debug!(job_name, job_id = ?id, "looked up slurm job");
        Ok(id)
    }

    async fn active_job_id(&self, job_name: &str) -> Result<Option<JobId>, SchedulerError> {
        let output = self.run_checked(squeue_argv(job_name)).await?;
        let id = parse_sacct(&output.stdout, job_name).into_iter().last();
        debug!(job_name, job_id = ?id, "looked up active slurm job");
        Ok(id)
    }
}

pub fn sbatch_argv(job_name: &str, command: &str, constraints: &JobConstraints) -> Vec<String> {
    let mut argv = vec!["sbatch".to_string()];
    argv.extend(BASE_SBATCH_FLAGS.iter().map(|f| f.to_string()));
    if let Some(partition) = &constraints.partition {
        argv.push(format!("--partition={partition}"));
    }
    if let Some(cpus) = constraints.cpus_per_task {
        argv.push(format!("--cpus-per-task={cpus}"));
    }
    if let Some(mem) = constraints.mem_per_cpu_mb {
        argv.push(format!("--mem-per-cpu={mem}M"));
    }
    if let Some(begin) = constraints.begin {
        argv.push(format!("--begin={}", begin.format(BEGIN_FORMAT)));
    }
    if !constraints.dependencies.is_empty() {
        let deps = constraints
            .dependencies
            .iter()
            .map(Dependency::to_string)
            .collect::<Vec<_>>()
            .join(",");
        argv.push(format!("--dependency={deps}"));
    }
    argv.push(format!("--job-name={job_name}"));
    argv.extend(["bash".to_string(), "-c".to_string(), command.to_string()]);
    argv
}

pub fn sacct_argv(job_name: &str) -> Vec<String> {
    vec![
        "sacct".into(),
        "--noheader".into(),
        "--parsable2".into(),
        "--format=jobid,jobname".into(),
        format!("--name={job_name}"),
    ]
}

/// Pending and running jobs only, printed as `jobid|jobname`.
pub fn squeue_argv(job_name: &str) -> Vec<String> {
    vec![
        "squeue".into(),
        "--noheader".into(),
        "--format=%i|%j".into(),
        format!("--name={job_name}"),
    ]
}

/// Job id from `Submitted batch job <digits>`.
pub fn parse_submitted(stdout: &str) -> Option<JobId> {
    stdout.lines().find_map(|line| {
        let digits = line.trim().strip_prefix(SUBMITTED_PREFIX)?.trim();
        (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
            .then(|| JobId::new(digits))
    })
}

/// Ids of the `jobid|jobname` lines whose name is exactly `job_name`, in
/// output order. Reads both `sacct` and `squeue` output.
pub fn parse_sacct(stdout: &str, job_name: &str) -> Vec<JobId> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            let id = fields.next()?.trim();
            let name = fields.next()?.trim();
            (name == job_name && !id.is_empty()).then(|| JobId::new(id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;

    /// Replays canned outputs and records every argv.
    struct ScriptedRunner {
        outputs: Mutex<Vec<CommandOutput>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
            self.calls.lock().unwrap().push(argv.to_vec());
            let mut outputs = self.outputs.lock().unwrap();
            Ok(if outputs.is_empty() {
                CommandOutput::default()
            } else {
                outputs.remove(0)
            })
        }
    }

    fn stdout(text: &str) -> CommandOutput {
        CommandOutput {
            status: 0,
            stdout: text.into(),
            stderr: String::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn sbatch_argv_is_bit_exact() {
        let constraints = JobConstraints {
            partition: Some("cpu".into()),
            cpus_per_task: Some(2),
            mem_per_cpu_mb: Some(4096),
            begin: Some(Utc.with_ymd_and_hms(2016, 3, 1, 12, 1, 0).unwrap()),
            dependencies: vec![
                Dependency::AfterOk(JobId::new("11")),
                Dependency::AfterOk(JobId::new("12")),
            ],
        };
        let argv = sbatch_argv("123", "runPipeline.sh -o 123", &constraints);
        assert_eq!(
            argv,
            vec![
                "sbatch",
                "--wait-all-nodes=1",
                "--kill-on-invalid-dep=yes",
                "--requeue",
                "--time=31-0",
                "--partition=cpu",
                "--cpus-per-task=2",
                "--mem-per-cpu=4096M",
                "--begin=2016-03-01T12:01:00",
                "--dependency=afterok:11,afterok:12",
                "--job-name=123",
                "bash",
                "-c",
                "runPipeline.sh -o 123",
            ]
        );
    }

    #[test]
    fn minimal_sbatch_has_no_optional_flags() {
        let argv = sbatch_argv("7-aborted", "true", &JobConstraints::after_not_ok(JobId::new("99")));
        assert!(!argv.iter().any(|a| a.starts_with("--begin")));
        assert!(!argv.iter().any(|a| a.starts_with("--partition")));
        assert!(argv.contains(&"--dependency=afternotok:99".to_string()));
        assert!(argv.contains(&"--job-name=7-aborted".to_string()));
    }

    #[test]
    fn submitted_line_is_parsed() {
        assert_eq!(
            parse_submitted("Submitted batch job 4242\n"),
            Some(JobId::new("4242"))
        );
        assert_eq!(
            parse_submitted("sbatch: note\nSubmitted batch job 7"),
            Some(JobId::new("7"))
        );
        assert_eq!(parse_submitted("Submitted batch job abc"), None);
        assert_eq!(parse_submitted(""), None);
    }

    #[test]
    fn sacct_keeps_exact_names_in_order() {
        let out = "100|123\n100.batch|batch\n101|1234\n102|123\n";
        assert_eq!(
            parse_sacct(out, "123"),
            vec![JobId::new("100"), JobId::new("102")]
        );
        assert!(parse_sacct("", "123").is_empty());
    }

    #[tokio::test]
    async fn submit_returns_job_id() {
        let gateway = SlurmGateway::new(ScriptedRunner::new(vec![stdout(
            "Submitted batch job 555\n",
        )]));
        let id = gateway
            .submit("123", "runPipeline.sh -o 123", &JobConstraints::default())
            .await
            .unwrap();
        assert_eq!(id, JobId::new("555"));
        assert_eq!(gateway.runner().calls()[0][0], "sbatch");
    }

    #[tokio::test]
    async fn submit_rejects_unexpected_output() {
        let gateway = SlurmGateway::new(ScriptedRunner::new(vec![stdout("queued, maybe")]));
        let err = gateway
            .submit("123", "true", &JobConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnexpectedOutput { .. }));
    }

    #[tokio::test]
    async fn submit_surfaces_sbatch_failure() {
        let gateway = SlurmGateway::new(ScriptedRunner::new(vec![failed(
            "sbatch: error: Job dependency problem",
        )]));
        let err = gateway
            .submit("123", "true", &JobConstraints::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, SchedulerError::CommandFailed { status: 1, ref stderr, .. } if stderr.contains("dependency"))
        );
    }

    #[tokio::test]
    async fn cancel_twice_is_quiet() {
        let gateway = SlurmGateway::new(ScriptedRunner::new(vec![
            stdout(""),
            failed("scancel: error: no jobs"),
        ]));
        gateway.cancel("123").await;
        gateway.cancel("123").await;
        let calls = gateway.runner().calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec!["scancel", "--jobname", "123"]);
    }

    #[tokio::test]
    async fn job_id_takes_last_match() {
        let gateway = SlurmGateway::new(ScriptedRunner::new(vec![stdout("10|123\n11|123\n")]));
        assert_eq!(gateway.job_id("123").await.unwrap(), Some(JobId::new("11")));
        assert_eq!(
            gateway.runner().calls()[0],
            vec![
                "sacct",
                "--noheader",
                "--parsable2",
                "--format=jobid,jobname",
                "--name=123"
            ]
        );
    }

    #[tokio::test]
    async fn active_job_id_asks_squeue() {
        let gateway = SlurmGateway::new(ScriptedRunner::new(vec![
            stdout("300|123\n301|123-aborted\n"),
            stdout(""),
        ]));
        assert_eq!(
            gateway.active_job_id("123").await.unwrap(),
            Some(JobId::new("300"))
        );
        assert_eq!(gateway.active_job_id("124").await.unwrap(), None);
        assert_eq!(
            gateway.runner().calls()[0],
            vec!["squeue", "--noheader", "--format=%i|%j", "--name=123"]
        );
    }

    #[tokio::test]
    async fn require_job_id_fails_when_absent() {
        let gateway = SlurmGateway::new(ScriptedRunner::new(vec![stdout("")]));
        let err = gateway.require_job_id("77").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnresolvedDependency(name) if name == "77"));
    }
}
